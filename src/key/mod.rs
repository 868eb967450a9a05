//! Key material handling for the field-level encryption core.
//!
//! Unlike the host library's session-level key cache (a Non-goal for this
//! core — the caller owns cross-operation caching via its schema cache),
//! `CryptoKey` here is scoped to a single broker entry: it holds the unwrapped
//! DEK bytes for the lifetime of one context and is zeroized on drop.

use zeroize::Zeroizing;

/// Unwrapped key material, scoped to a single operation.
///
/// Wraps the plaintext DEK bytes in [`Zeroizing`] so the buffer is overwritten
/// the moment it is dropped, regardless of where in the broker or context it
/// was held. This is the Rust rendition of the "unwrapped key material must be
/// overwritten on release" invariant: the implementation must not rely on an
/// optimizer-visible write, which is exactly what `Zeroizing` guarantees.
#[derive(Clone)]
pub struct CryptoKey {
    bytes: Zeroizing<Vec<u8>>,
}

impl CryptoKey {
    /// Takes ownership of `bytes` as the key material. The caller's original
    /// buffer is not itself zeroized; move owned buffers in rather than
    /// cloning them where possible.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
        }
    }

    /// Borrows the key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Explicitly zeroizes the key material now, ahead of `Drop`.
    pub fn close(&mut self) {
        self.bytes = Zeroizing::new(Vec::new());
    }
}

impl std::fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoKey")
            .field("bytes", &"<redacted>")
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn close_wipes_the_buffer() {
        let mut key = CryptoKey::new(vec![1, 2, 3, 4]);
        assert_eq!(key.as_bytes(), &[1, 2, 3, 4]);
        key.close();
        assert!(key.is_empty());
    }
}
