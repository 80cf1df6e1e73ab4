use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;

pub mod codec;

pub use codec::{ArmoredKeyCodec, DecodeError, KeyCodec, KeyEncoding, KeyKind, KeyRing};

/// Persistence for key rings received from a peer.
#[async_trait]
pub trait KeyRingStore: Send + Sync {
    /// Store a ring and return its id.
    async fn put(&self, ring: &KeyRing) -> Result<String>;
    async fn get(&self, id: &str) -> Result<Option<KeyRing>>;
    async fn list(&self) -> Result<Vec<String>>;
}

/// Short content id: first 8 bytes of SHA-256, hex.
pub fn key_ring_id(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    hex::encode(&hash[..8])
}

/// Keeps rings as `<base>/keyrings/<id>.asc` or `<id>.gpg`.
#[derive(Clone)]
pub struct LocalKeyRingStore {
    rings_dir: PathBuf,
    codec: ArmoredKeyCodec,
}

impl LocalKeyRingStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        let rings_dir = base_dir.as_ref().join("keyrings");
        std::fs::create_dir_all(&rings_dir).context("Failed to create keyrings directory")?;

        Ok(Self {
            rings_dir,
            codec: ArmoredKeyCodec,
        })
    }

    pub fn path_for(&self, id: &str, encoding: KeyEncoding) -> PathBuf {
        self.rings_dir
            .join(format!("{}.{}", id, encoding.file_extension()))
    }
}

#[async_trait]
impl KeyRingStore for LocalKeyRingStore {
    async fn put(&self, ring: &KeyRing) -> Result<String> {
        let bytes = self.codec.serialize(ring);
        let id = key_ring_id(&bytes);
        let path = self.path_for(&id, ring.encoding);

        fs::write(&path, &bytes)
            .await
            .with_context(|| format!("Failed to write key ring {}", path.display()))?;

        tracing::debug!("Stored key ring {} ({} bytes)", id, bytes.len());
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<KeyRing>> {
        for encoding in [KeyEncoding::Armored, KeyEncoding::Binary] {
            let path = self.path_for(id, encoding);
            if !path.exists() {
                continue;
            }
            let data = fs::read(&path)
                .await
                .with_context(|| format!("Failed to read key ring {}", id))?;
            let ring = self
                .codec
                .deserialize(&data)
                .with_context(|| format!("Stored key ring {} is corrupt", id))?;
            return Ok(Some(ring));
        }
        Ok(None)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.rings_dir)
            .await
            .context("Failed to list keyrings directory")?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let known = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("asc") | Some("gpg")
            );
            if let (true, Some(stem)) = (known, path.file_stem().and_then(|s| s.to_str())) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ARMORED: &[u8] =
        b"-----BEGIN PGP PUBLIC KEY BLOCK-----\n\nmDMEZ\n-----END PGP PUBLIC KEY BLOCK-----\n";

    #[tokio::test]
    async fn test_store_roundtrip() -> Result<()> {
        let temp = TempDir::new()?;
        let store = LocalKeyRingStore::new(temp.path())?;

        let ring = ArmoredKeyCodec.deserialize(ARMORED)?;
        let id = store.put(&ring).await?;
        assert_eq!(id.len(), 16);
        assert!(temp.path().join("keyrings").join(format!("{id}.asc")).exists());

        let retrieved = store.get(&id).await?;
        assert_eq!(retrieved, Some(ring));

        let missing = store.get("0000000000000000").await?;
        assert_eq!(missing, None);

        Ok(())
    }

    #[tokio::test]
    async fn binary_rings_use_gpg_extension() -> Result<()> {
        let temp = TempDir::new()?;
        let store = LocalKeyRingStore::new(temp.path())?;

        let binary = ArmoredKeyCodec.deserialize(&[0x99, 0x01, 0x0d, 0x04])?;
        let armored = ArmoredKeyCodec.deserialize(ARMORED)?;
        let bin_id = store.put(&binary).await?;
        let asc_id = store.put(&armored).await?;

        assert!(store.path_for(&bin_id, KeyEncoding::Binary).exists());
        let mut expected = vec![bin_id, asc_id];
        expected.sort();
        assert_eq!(store.list().await?, expected);

        Ok(())
    }

    #[test]
    fn ids_are_stable() {
        assert_eq!(key_ring_id(b"abc"), "ba7816bf8f01cfea");
    }
}
