// Wrapper for sha256 libraries.
// Hashing pieces is most of the CPU an agent spends. The pure-rust
// implementation is the default; the system one (openssl-backed on linux)
// can be switched on with a feature.

#[cfg(all(feature = "sha256-rust", not(feature = "sha256-system")))]
pub type Sha256 = Sha256Rust;

#[cfg(feature = "sha256-system")]
pub type Sha256 = Sha256System;

pub trait ISha256 {
    fn new() -> Self;
    fn update(&mut self, buf: &[u8]);
    fn finish(self) -> [u8; 32];
}

/// Hash a single buffer in one go.
pub fn digest(buf: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(buf);
    h.finish()
}

#[cfg(feature = "sha256-rust")]
pub struct Sha256Rust {
    inner: sha2::Sha256,
}

#[cfg(feature = "sha256-rust")]
impl ISha256 for Sha256Rust {
    fn new() -> Self {
        use sha2::Digest;
        Sha256Rust {
            inner: sha2::Sha256::new(),
        }
    }

    fn update(&mut self, buf: &[u8]) {
        use sha2::Digest;
        self.inner.update(buf)
    }

    fn finish(self) -> [u8; 32] {
        use sha2::Digest;
        self.inner.finalize().into()
    }
}

#[cfg(feature = "sha256-system")]
pub struct Sha256System {
    inner: crypto_hash::Hasher,
}

#[cfg(feature = "sha256-system")]
impl ISha256 for Sha256System {
    fn new() -> Self {
        Self {
            inner: crypto_hash::Hasher::new(crypto_hash::Algorithm::SHA256),
        }
    }

    fn update(&mut self, buf: &[u8]) {
        use std::io::Write;
        // Writing into the hasher only fails if openssl itself is broken.
        let _ = self.inner.write_all(buf);
    }

    fn finish(mut self) -> [u8; 32] {
        let result = self.inner.finish();
        debug_assert_eq!(result.len(), 32);
        let mut result_arr = [0u8; 32];
        result_arr.copy_from_slice(&result);
        result_arr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_digest() {
        assert_eq!(
            digest(b""),
            [
                0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f,
                0xb9, 0x24, 0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b,
                0x78, 0x52, 0xb8, 0x55
            ]
        );
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut h = Sha256::new();
        h.update(b"hello ");
        h.update(b"world");
        assert_eq!(h.finish(), digest(b"hello world"));
    }
}
