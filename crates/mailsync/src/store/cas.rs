//! Deduplicating file store addressed by content digest
//!
//! Artifacts are stored under `root/<aa>/<bb>/<digest><suffix>` where the
//! nested directories are the leading byte-pairs of the hex digest. The
//! final write is a rename of a fully written temporary file, so a crash
//! can never leave a partial artifact under its final name.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, error};
use sha2::{Digest, Sha384};
use walkdir::WalkDir;

use super::StoreError;

/// Hashing and write block size.
const BLOCK_SIZE: usize = 16 * 1024;
/// Subdirectory holding artifacts whose digest path was already taken by
/// different content.
const COLLISIONS_DIR: &str = "collisions";

/// Whether an add wrote a new artifact or found an identical one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddStatus {
    New,
    Exists,
}

impl fmt::Display for AddStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddStatus::New => write!(f, "NEW"),
            AddStatus::Exists => write!(f, "EXISTS"),
        }
    }
}

/// Result of adding data to the store.
#[derive(Debug, Clone)]
pub struct Added {
    pub status: AddStatus,
    pub digest: String,
    pub path: PathBuf,
}

/// Append-only store mapping a SHA-384 digest to a deterministic path.
pub struct ContentStore {
    root: PathBuf,
    collisions: PathBuf,
    suffix: String,
    depth: usize,
}

impl ContentStore {
    /// Open (or create) a store rooted at `root`.
    ///
    /// `suffix` names the artifact files; a leading dot is added when
    /// missing, and an empty suffix falls back to `.dat`.
    pub fn new(root: impl AsRef<Path>, suffix: &str) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            collisions: root.join(COLLISIONS_DIR),
            root,
            suffix: normalize_suffix(suffix),
            depth: 2,
        })
    }

    /// Override the directory fan-out depth (digest byte-pairs per level).
    ///
    /// The value is only validated against the digest length once a path
    /// is computed.
    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    fn entry_dir(&self, digest: &str) -> Result<PathBuf, StoreError> {
        let required = self.depth * 2;
        if digest.len() < required {
            return Err(StoreError::InvalidConfiguration {
                depth: self.depth,
                required,
            });
        }
        let mut dir = self.root.clone();
        for i in (0..required).step_by(2) {
            dir.push(&digest[i..i + 2]);
        }
        Ok(dir)
    }

    fn filename(&self, digest: &str) -> String {
        format!("{}{}", digest, self.suffix)
    }

    /// Add a byte blob to the store.
    pub fn add(&self, data: &[u8]) -> Result<Added, StoreError> {
        self.add_stream(io::Cursor::new(data))
    }

    /// Add streamed content to the store.
    ///
    /// The input is hashed in fixed-size blocks, so large messages are
    /// never held in memory twice. If the destination already holds a file
    /// of the same size the content is assumed identical and nothing is
    /// written. A same-digest file of a different size is a collision and
    /// is routed to the collision area instead; a second collision at that
    /// location is treated as already handled.
    pub fn add_stream<R: Read + Seek>(&self, mut reader: R) -> Result<Added, StoreError> {
        let digest = stream_digest(&mut reader)?;
        let mut dir = self.entry_dir(&digest)?;
        let filename = self.filename(&digest);
        let mut file = dir.join(&filename);

        if file.exists() {
            if fs::metadata(&file)?.len() == stream_len(&mut reader)? {
                debug!("{}: already exists", file.display());
                return Ok(Added {
                    status: AddStatus::Exists,
                    digest,
                    path: file,
                });
            }
            error!("{}: collision detected!", file.display());
            dir = self.collisions.clone();
            file = dir.join(&filename);
            if file.exists() {
                debug!("{}: collision file already exists", file.display());
                return Ok(Added {
                    status: AddStatus::Exists,
                    digest,
                    path: file,
                });
            }
        }

        fs::create_dir_all(&dir)?;
        let tmp = file.with_extension("tmp");
        if let Err(source) = write_blocks(&mut reader, &tmp) {
            error!("{}: error while writing file: {}", file.display(), source);
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::Write { path: file, source });
        }
        fs::rename(&tmp, &file)?;
        debug!("{}: new entry", file.display());
        Ok(Added {
            status: AddStatus::New,
            digest,
            path: file,
        })
    }

    /// Compute the path the given bytes resolve to without writing.
    ///
    /// With `must_exist`, returns `None` unless the artifact is present.
    pub fn locate(&self, data: &[u8], must_exist: bool) -> Result<Option<PathBuf>, StoreError> {
        let digest = stream_digest(&mut io::Cursor::new(data))?;
        self.locate_digest(&digest, must_exist)
    }

    /// Compute the path for an already known digest.
    pub fn locate_digest(
        &self,
        digest: &str,
        must_exist: bool,
    ) -> Result<Option<PathBuf>, StoreError> {
        let path = self.entry_dir(digest)?.join(self.filename(digest));
        if must_exist && !path.exists() {
            return Ok(None);
        }
        Ok(Some(path))
    }

    /// Walk every artifact currently in the store.
    ///
    /// Re-scans the filesystem on each call; order is unspecified. The
    /// collision area is included since it lives under the root.
    pub fn walk(&self) -> impl Iterator<Item = PathBuf> {
        let suffix = self.suffix.clone();
        WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(move |entry| {
                entry.file_type().is_file()
                    && entry.file_name().to_string_lossy().ends_with(&suffix)
            })
            .map(|entry| entry.into_path())
    }
}

fn normalize_suffix(suffix: &str) -> String {
    let suffix = suffix.trim();
    if suffix.is_empty() {
        ".dat".to_string()
    } else if suffix.starts_with('.') {
        suffix.to_string()
    } else {
        format!(".{}", suffix)
    }
}

/// Hash the stream in fixed-size blocks and rewind it.
fn stream_digest<R: Read + Seek>(reader: &mut R) -> io::Result<String> {
    reader.seek(SeekFrom::Start(0))?;
    let mut hasher = Sha384::new();
    let mut block = vec![0u8; BLOCK_SIZE];
    loop {
        let n = reader.read(&mut block)?;
        if n == 0 {
            break;
        }
        hasher.update(&block[..n]);
    }
    reader.seek(SeekFrom::Start(0))?;
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{:02x}", byte));
    }
    Ok(hex)
}

fn stream_len<R: Seek>(reader: &mut R) -> io::Result<u64> {
    let pos = reader.stream_position()?;
    let len = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(pos))?;
    Ok(len)
}

fn write_blocks<R: Read>(reader: &mut R, tmp: &Path) -> io::Result<()> {
    let mut out = File::create(tmp)?;
    let mut block = vec![0u8; BLOCK_SIZE];
    loop {
        let n = reader.read(&mut block)?;
        if n == 0 {
            break;
        }
        out.write_all(&block[..n])?;
    }
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_new_creates_root() {
        let dir = tempdir().unwrap();
        let _ = ContentStore::new(dir.path().join("cas"), ".eml").unwrap();
        assert!(dir.path().join("cas").exists());
    }

    #[test]
    fn test_add_then_exists() {
        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path().join("cas"), ".eml").unwrap();

        let first = store.add(b"hello world").unwrap();
        assert_eq!(first.status, AddStatus::New);
        assert!(first.path.exists());
        assert_eq!(fs::read(&first.path).unwrap(), b"hello world");

        let second = store.add(b"hello world").unwrap();
        assert_eq!(second.status, AddStatus::Exists);
        assert_eq!(second.digest, first.digest);
        assert_eq!(second.path, first.path);
        assert_eq!(fs::read(&second.path).unwrap(), b"hello world");
    }

    #[test]
    fn test_locate_matches_add() {
        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path().join("cas"), ".eml").unwrap();

        let added = store.add(b"find me").unwrap();
        let located = store.locate(b"find me", false).unwrap().unwrap();
        assert_eq!(located, added.path);

        assert!(store.locate(b"missing", true).unwrap().is_none());
        let would_be = store.locate(b"missing", false).unwrap().unwrap();
        assert!(!would_be.exists());
    }

    #[test]
    fn test_walk_counts_entries() {
        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path().join("cas"), ".eml").unwrap();
        store.add(b"file1").unwrap();
        store.add(b"file2").unwrap();

        assert_eq!(store.walk().count(), 2);
        // walk() re-scans, so a second iteration sees the same entries.
        assert_eq!(store.walk().count(), 2);
    }

    #[test]
    fn test_collision_goes_to_collision_area() {
        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path().join("cas"), ".eml").unwrap();

        let original = store.add(b"colliding content").unwrap();
        // Plant a different-size file at the digest path to simulate a
        // digest collision.
        fs::write(&original.path, b"something else entirely, longer").unwrap();

        let rerouted = store.add(b"colliding content").unwrap();
        assert_eq!(rerouted.status, AddStatus::New);
        assert!(rerouted.path.starts_with(dir.path().join("cas").join("collisions")));
        assert_eq!(fs::read(&rerouted.path).unwrap(), b"colliding content");
        // The original entry is untouched.
        assert_eq!(
            fs::read(&original.path).unwrap(),
            b"something else entirely, longer"
        );

        // A second hit on the same collision slot is assumed handled.
        let again = store.add(b"colliding content").unwrap();
        assert_eq!(again.status, AddStatus::Exists);
        assert_eq!(again.path, rerouted.path);
    }

    #[test]
    fn test_depth_validated_lazily() {
        let dir = tempdir().unwrap();
        // Construction succeeds; the digest is too short only once used.
        let store = ContentStore::new(dir.path().join("cas"), ".eml")
            .unwrap()
            .with_depth(64);
        let err = store.add(b"data").unwrap_err();
        assert!(matches!(err, StoreError::InvalidConfiguration { .. }));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(AddStatus::New.to_string(), "NEW");
        assert_eq!(AddStatus::Exists.to_string(), "EXISTS");
    }

    #[test]
    fn test_suffix_normalization() {
        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path().join("cas"), "eml").unwrap();
        assert_eq!(store.suffix(), ".eml");
        let store = ContentStore::new(dir.path().join("cas2"), "").unwrap();
        assert_eq!(store.suffix(), ".dat");
    }

    #[test]
    fn test_add_stream_matches_add() {
        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path().join("cas"), ".eml").unwrap();

        let from_bytes = store.add(b"streamed content").unwrap();
        let dir2 = tempdir().unwrap();
        let store2 = ContentStore::new(dir2.path().join("cas"), ".eml").unwrap();
        let from_stream = store2
            .add_stream(io::Cursor::new(b"streamed content".to_vec()))
            .unwrap();
        assert_eq!(from_bytes.digest, from_stream.digest);
    }
}
