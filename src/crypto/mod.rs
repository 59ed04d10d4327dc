//! Field encryption: key derivation, AEAD, and the versioned envelope.

mod cipher;
mod envelope;

pub use cipher::{AuditKey, CipherManager, KEY_LEN, NONCE_LEN, TAG_LEN};
pub use envelope::{EnvelopeCodec, Metadata, Opened, Sealer};
