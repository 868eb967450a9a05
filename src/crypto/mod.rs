//! AEAD primitives used to unwrap local-provider keys and wrap/unwrap DEKs.

mod aead;
mod aes256gcm;

pub use aead::{fill_random, AeadImpl};
pub use aes256gcm::Aes256GcmAead;