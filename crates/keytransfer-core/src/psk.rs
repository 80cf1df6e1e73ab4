use rand_core::{CryptoRng, OsRng, RngCore};
use std::fmt;
use zeroize::Zeroize;

use crate::error::TransferError;

/// Length of a freshly generated pre-shared key.
pub const PSK_LEN: usize = 16;

/// Single-use secret shared out of band through the pairing descriptor.
///
/// Zeroized on drop and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct PresharedKey(Vec<u8>);

impl PresharedKey {
    /// Wrap decoded key bytes. Empty keys are rejected.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, TransferError> {
        if bytes.is_empty() {
            return Err(TransferError::malformed("empty preshared key"));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(&self.0)
    }
}

impl Drop for PresharedKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PresharedKey(<{} bytes>)", self.0.len())
    }
}

/// Source of per-session secrets, generic over the CSPRNG.
pub struct PresharedKeySource<R = OsRng> {
    rng: R,
}

impl Default for PresharedKeySource<OsRng> {
    fn default() -> Self {
        Self { rng: OsRng }
    }
}

impl<R: RngCore + CryptoRng> PresharedKeySource<R> {
    pub fn with_rng(rng: R) -> Self {
        Self { rng }
    }

    pub fn generate(&mut self) -> Result<PresharedKey, TransferError> {
        let mut bytes = vec![0u8; PSK_LEN];
        self.rng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| TransferError::Setup(format!("random generator unavailable: {e}")))?;
        Ok(PresharedKey(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_have_fixed_length_and_differ() {
        let mut source = PresharedKeySource::default();
        let a = source.generate().unwrap();
        let b = source.generate().unwrap();
        assert_eq!(a.as_bytes().len(), PSK_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!(PresharedKey::from_bytes(Vec::new()).is_err());
    }

    #[test]
    fn debug_output_hides_key_material() {
        let key = PresharedKey::from_bytes(vec![0xAB; 16]).unwrap();
        let printed = format!("{key:?}");
        assert!(!printed.contains("AB") && !printed.contains("ab"));
        assert!(printed.contains("16 bytes"));
    }
}
