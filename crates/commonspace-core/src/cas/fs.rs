use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest as Sha2Digest, Sha256};
use tempfile::NamedTempFile;

use super::{BlobStore, CasError, Digest, Result, READ_CHUNK};

/// Filesystem-backed content-addressed store with git-style 2-char sharding.
///
/// Layout: `<root>/objects/<first 2 hex chars>/<remaining hex chars>`
pub struct FsBlobStore {
    objects_dir: PathBuf,
}

impl FsBlobStore {
    /// Create a new `FsBlobStore` rooted at `root`. Creates `root/objects/` if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let objects_dir = root.as_ref().join("objects");
        fs::create_dir_all(&objects_dir)?;
        Ok(Self { objects_dir })
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.objects_dir.join(&hex[..2]).join(&hex[2..])
    }
}

/// Copy `src` into `dst` chunk by chunk while hashing what passes through.
fn copy_hashed(src: &mut impl Read, dst: &mut impl Write) -> std::io::Result<Digest> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        dst.write_all(&buf[..n])?;
    }
    Ok(Digest::from_hasher(hasher))
}

impl BlobStore for FsBlobStore {
    fn put_file(&self, path: &Path) -> Result<Digest> {
        let mut src = fs::File::open(path)?;

        // Hash while staging into a temp file next to the shards, then rename.
        let mut tmp = NamedTempFile::new_in(&self.objects_dir)?;
        let digest = copy_hashed(&mut src, &mut tmp)?;
        tmp.flush()?;

        let blob = self.blob_path(&digest);
        if blob.exists() {
            return Ok(digest);
        }

        let shard_dir = blob.parent().ok_or_else(|| CasError::InvalidDigest(digest.to_hex()))?;
        fs::create_dir_all(shard_dir)?;
        tmp.persist(&blob).map_err(|e| e.error)?;

        Ok(digest)
    }

    fn restore(&self, digest: &Digest, dest: &Path) -> Result<()> {
        let blob = self.blob_path(digest);
        let mut src = fs::File::open(&blob).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CasError::NotFound(*digest)
            } else {
                CasError::Io(e)
            }
        })?;

        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let mut tmp = NamedTempFile::new_in(parent)?;
        let actual = copy_hashed(&mut src, &mut tmp)?;
        if actual != *digest {
            return Err(CasError::Corrupt(*digest));
        }
        tmp.flush()?;
        tmp.persist(dest).map_err(|e| e.error)?;
        Ok(())
    }
}
