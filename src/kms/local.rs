//! The local KMS provider: an in-process AEAD collaborator with no wire
//! envelope at all. Unwrap happens synchronously inside `done_adding_docs`
//! rather than through a pumped subcontext (§4.2).

use crate::crypto::{AeadImpl, Aes256GcmAead};
use crate::error::{Error, Result};

/// Unwraps `wrapped` using `master_key` via AES-256-GCM.
pub fn unwrap(wrapped: &[u8], master_key: &[u8]) -> Result<Vec<u8>> {
    if master_key.is_empty() {
        return Err(Error::Kms(
            "local KMS provider configured without a master key".into(),
        ));
    }
    Aes256GcmAead::new().decrypt(wrapped, master_key)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crypto::AeadImpl as _;

    #[test]
    fn unwraps_a_locally_wrapped_dek() {
        let master_key = vec![9_u8; 32];
        let wrapped = Aes256GcmAead::new().encrypt(b"dek-bytes", &master_key).unwrap();
        assert_eq!(unwrap(&wrapped, &master_key).unwrap(), b"dek-bytes");
    }

    #[test]
    fn rejects_missing_master_key() {
        assert!(unwrap(&[1, 2, 3], &[]).is_err());
    }
}
