use rand::Rng;
use sha2::{Digest, Sha256, Sha384};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

// Content-addressed, immutable binary storage. Writes stream through the
// hash pair into a staging file and become visible only after the declared
// hash and size have been confirmed, under a freshly drawn opaque name.
// Names are never reused; a name that survives `put` refers to the same
// bytes forever.

const NAME_LEN: usize = 16;
const NAME_CHARSET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("hash mismatch: declared {declared}, computed {computed}")]
    HashMismatch { declared: String, computed: String },
    #[error("size mismatch: declared {declared}, got {got}")]
    SizeMismatch { declared: u64, got: u64 },
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The outcome of a successful `put`: the drawn blob name plus the hashes
/// and size actually observed on the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    pub name: String,
    /// SHA-384, lowercase hex. The primary content hash.
    pub hash: String,
    /// SHA-256, lowercase hex. Kept for clients that only speak SHA-256.
    pub hash_256: String,
    pub size: u64,
}

pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Open (creating if needed) a blob store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Store, Error> {
        let root = root.into();
        std::fs::create_dir_all(root.join("tmp"))?;
        std::fs::create_dir_all(root.join("blobs"))?;
        Ok(Store { root })
    }

    fn blob_path(&self, name: &str) -> PathBuf {
        self.root.join("blobs").join(name)
    }

    /// Stream `reader` into the store, verifying the declared SHA-384 hash
    /// and size. The returned name becomes visible atomically; no partial
    /// blob is ever observable under any name.
    pub fn put(
        &self,
        mut reader: impl Read,
        declared_hash: &str,
        declared_size: u64,
    ) -> Result<PutResult, Error> {
        let mut staged = tempfile::NamedTempFile::new_in(self.root.join("tmp"))?;
        let mut sha384 = Sha384::new();
        let mut sha256 = Sha256::new();
        let mut size: u64 = 0;

        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            sha384.update(&buf[..n]);
            sha256.update(&buf[..n]);
            staged.write_all(&buf[..n])?;
            size += n as u64;
        }
        staged.flush()?;

        if size != declared_size {
            return Err(Error::SizeMismatch {
                declared: declared_size,
                got: size,
            });
        }
        let hash = hex::encode(sha384.finalize());
        if hash != declared_hash {
            return Err(Error::HashMismatch {
                declared: declared_hash.to_string(),
                computed: hash,
            });
        }
        let hash_256 = hex::encode(sha256.finalize());

        // Persist under a fresh name. A collision on the target re-draws:
        // names are never reused.
        loop {
            let name = random_name();
            match staged.persist_noclobber(self.blob_path(&name)) {
                Ok(_) => {
                    tracing::debug!(%name, size, "stored blob");
                    return Ok(PutResult {
                        name,
                        hash,
                        hash_256,
                        size,
                    });
                }
                Err(err) if err.error.kind() == std::io::ErrorKind::AlreadyExists => {
                    staged = err.file;
                }
                Err(err) => return Err(err.error.into()),
            }
        }
    }

    /// Open the named blob for reading. The file supports `Read + Seek`,
    /// which range reads and central-directory parsing rely on. Any number
    /// of readers may hold the same blob open.
    pub fn open(&self, name: &str) -> Result<(File, u64), Error> {
        let file = File::open(self.blob_path(name)).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(name.to_string())
            } else {
                err.into()
            }
        })?;
        let size = file.metadata()?.len();
        Ok((file, size))
    }

    /// Remove the named blob. Only upload rollback and archive rewrites
    /// call this; names are not recycled afterwards.
    pub fn delete(&self, name: &str) -> Result<(), Error> {
        std::fs::remove_file(self.blob_path(name)).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(name.to_string())
            } else {
                err.into()
            }
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn random_name() -> String {
    let mut rng = rand::thread_rng();
    (0..NAME_LEN)
        .map(|_| NAME_CHARSET[rng.gen_range(0..NAME_CHARSET.len())] as char)
        .collect()
}

/// Hex SHA-384 of `data`, as `put` would compute it. Callers declaring a
/// hash for bytes they hold in memory use this.
pub fn hash_of(data: &[u8]) -> String {
    hex::encode(Sha384::digest(data))
}

/// Hex SHA-256 of `data`.
pub fn hash_256_of(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Seek;

    fn new_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("blobs")).unwrap();
        (dir, store)
    }

    #[test]
    fn put_then_open_round_trips() {
        let (_dir, store) = new_store();
        let body = b"hello, blob world".to_vec();

        let put = store
            .put(body.as_slice(), &hash_of(&body), body.len() as u64)
            .unwrap();
        assert_eq!(put.size, body.len() as u64);
        assert_eq!(put.hash, hash_of(&body));
        assert_eq!(put.hash_256, hash_256_of(&body));
        assert!(put.name.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));

        let (mut file, size) = store.open(&put.name).unwrap();
        assert_eq!(size, body.len() as u64);
        let mut read_back = Vec::new();
        file.read_to_end(&mut read_back).unwrap();
        assert_eq!(read_back, body);

        // The reader seeks.
        file.rewind().unwrap();
        let mut first = [0u8; 5];
        file.read_exact(&mut first).unwrap();
        assert_eq!(&first, b"hello");
    }

    #[test]
    fn put_rejects_hash_mismatch() {
        let (dir, store) = new_store();
        let err = store.put(&b"content"[..], "blahblah", 7).unwrap_err();
        assert!(matches!(err, Error::HashMismatch { .. }));

        // Nothing became visible.
        let blobs: Vec<_> = std::fs::read_dir(dir.path().join("blobs/blobs"))
            .unwrap()
            .collect();
        assert!(blobs.is_empty());
    }

    #[test]
    fn put_rejects_size_mismatch() {
        let (_dir, store) = new_store();
        let body = b"content";
        let err = store
            .put(&body[..], &hash_of(body), body.len() as u64 + 1)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::SizeMismatch { declared: 8, got: 7 }
        ));
    }

    #[test]
    fn delete_removes_blob() {
        let (_dir, store) = new_store();
        let body = b"doomed";
        let put = store
            .put(&body[..], &hash_of(body), body.len() as u64)
            .unwrap();
        store.delete(&put.name).unwrap();
        assert!(matches!(store.open(&put.name), Err(Error::NotFound(_))));
        assert!(matches!(store.delete(&put.name), Err(Error::NotFound(_))));
    }

    #[test]
    fn open_unknown_name_is_not_found() {
        let (_dir, store) = new_store();
        assert!(matches!(store.open("nosuchblob"), Err(Error::NotFound(_))));
    }
}
