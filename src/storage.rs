use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::{self, Cursor, Read, Seek, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    config::{Config, StorageKind},
    hasher,
    root::Root,
};

pub const INDEX_JSON_FILE_NAME: &str = "index.json";
pub const INDEX_MD_FILE_NAME: &str = "index.md";
pub const VERSION_MARKER_FILE_NAME: &str = "httplock";
pub const BUNDLE_VERSION: &str = "1.0";

const FS_TMP_DIR: &str = "tmp";

/// Version marker stored at the top of every exported bundle.
#[derive(Debug, Serialize, Deserialize)]
pub struct VersionMarker {
    #[serde(rename = "httplockVersion")]
    pub version: String,
}

#[derive(Debug)]
pub enum StorageError {
    NotFound(String),
    ReadOnly,
    NotADir(String),
    NotAFile(String),
    WriterOpen,
    HashMismatch { expected: String, computed: String },
    AlreadyExists(String),
    Invalid(String),
    NotImplemented(&'static str),
    Io(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(what) => write!(f, "not found: {what}"),
            Self::ReadOnly => write!(f, "root is read-only"),
            Self::NotADir(path) => write!(f, "{path} exists and is not a directory"),
            Self::NotAFile(path) => write!(f, "{path} exists and is not a file"),
            Self::WriterOpen => write!(f, "hash unavailable, writer is not closed"),
            Self::HashMismatch { expected, computed } => {
                write!(f, "hash mismatch, expected {expected}, computed {computed}")
            }
            Self::AlreadyExists(what) => write!(f, "{what} already exists"),
            Self::Invalid(message) => write!(f, "{message}"),
            Self::NotImplemented(what) => write!(f, "{what} is not implemented"),
            Self::Io(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for StorageError {}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Positional reader over a stored blob.
pub trait BlobRead: Read + Seek + Send + Sync {
    fn size(&self) -> u64;
}

impl std::fmt::Debug for dyn BlobRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobRead").field("size", &self.size()).finish()
    }
}

/// Streaming blob writer. The hash is fixed (and only queryable) after
/// `close`; closing twice is a no-op that returns the same hash.
pub trait BlobWrite: Write + Send + Sync {
    fn close(&mut self) -> Result<String>;
    fn hash(&self) -> Result<String>;
}

/// Backing store for blobs plus the persisted root index.
pub trait BlobStore: Send + Sync {
    fn blob_open(&self, hash: &str) -> Result<Box<dyn BlobRead>>;
    fn blob_create(&self) -> Result<Box<dyn BlobWrite>>;
    fn load_index(&self) -> Index;
    fn persist_index(&self, index: &Index) -> Result<()>;

    fn prune_cache(&self, _unused_since: Duration) -> Result<()> {
        Err(StorageError::NotImplemented("prune cache"))
    }

    fn prune_storage(&self) -> Result<()> {
        Err(StorageError::NotImplemented("prune storage"))
    }
}

/// Index of known immutable roots, persisted as `index.json` by the
/// filesystem backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Index {
    #[serde(default)]
    pub roots: BTreeMap<String, IndexRoot>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexRoot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used: Option<i64>,
}

pub fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => i64::try_from(duration.as_millis()).unwrap_or(i64::MAX),
        Err(_) => 0,
    }
}

// ---- memory backend ----

type MemoryBlobs = Arc<Mutex<HashMap<String, Bytes>>>;

#[derive(Default)]
struct MemoryStore {
    blobs: MemoryBlobs,
}

struct MemoryReader {
    cursor: Cursor<Bytes>,
    size: u64,
}

impl Read for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryReader {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl BlobRead for MemoryReader {
    fn size(&self) -> u64 {
        self.size
    }
}

struct MemoryWriter {
    blobs: MemoryBlobs,
    buf: Vec<u8>,
    closed: Option<String>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.is_some() {
            return Err(io::Error::other("blob writer is closed"));
        }
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BlobWrite for MemoryWriter {
    fn close(&mut self) -> Result<String> {
        if let Some(hash) = &self.closed {
            return Ok(hash.clone());
        }
        let hash = hasher::from_bytes(&self.buf);
        let bytes = Bytes::from(std::mem::take(&mut self.buf));
        self.blobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(hash.clone(), bytes);
        self.closed = Some(hash.clone());
        Ok(hash)
    }

    fn hash(&self) -> Result<String> {
        self.closed.clone().ok_or(StorageError::WriterOpen)
    }
}

impl BlobStore for MemoryStore {
    fn blob_open(&self, hash: &str) -> Result<Box<dyn BlobRead>> {
        let blobs = self
            .blobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(bytes) = blobs.get(hash) else {
            return Err(StorageError::NotFound(format!("blob {hash}")));
        };
        let size = bytes.len() as u64;
        Ok(Box::new(MemoryReader {
            cursor: Cursor::new(bytes.clone()),
            size,
        }))
    }

    fn blob_create(&self) -> Result<Box<dyn BlobWrite>> {
        Ok(Box::new(MemoryWriter {
            blobs: Arc::clone(&self.blobs),
            buf: Vec::new(),
            closed: None,
        }))
    }

    fn load_index(&self) -> Index {
        Index::default()
    }

    fn persist_index(&self, _index: &Index) -> Result<()> {
        Ok(())
    }
}

// ---- filesystem backend ----

struct FilesystemStore {
    dir: PathBuf,
}

impl FilesystemStore {
    fn new(dir: &Path) -> Result<Self> {
        let tmp_dir = dir.join(FS_TMP_DIR);
        match fs::metadata(&tmp_dir) {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => {
                return Err(StorageError::AlreadyExists(format!(
                    "{} (not a directory)",
                    tmp_dir.display()
                )));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&tmp_dir).map_err(|err| {
                    StorageError::Io(format!("create storage dir {}: {err}", tmp_dir.display()))
                })?;
            }
            Err(err) => {
                return Err(StorageError::Io(format!(
                    "stat storage dir {}: {err}",
                    tmp_dir.display()
                )));
            }
        }
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }
}

struct FileReader {
    file: fs::File,
    size: u64,
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for FileReader {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl BlobRead for FileReader {
    fn size(&self) -> u64 {
        self.size
    }
}

struct FileWriter {
    dir: PathBuf,
    tmp: Option<hasher::HashingWriter<tempfile::NamedTempFile>>,
    closed: Option<String>,
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.tmp.as_mut() {
            Some(tmp) => tmp.write(buf),
            None => Err(io::Error::other("blob writer is closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.tmp.as_mut() {
            Some(tmp) => tmp.flush(),
            None => Ok(()),
        }
    }
}

impl BlobWrite for FileWriter {
    fn close(&mut self) -> Result<String> {
        if let Some(hash) = &self.closed {
            return Ok(hash.clone());
        }
        let tmp = self.tmp.take().ok_or(StorageError::WriterOpen)?;
        let (tmp_file, hash) = tmp.finish();
        // Concurrent writers for the same hash both rename; content addressing
        // makes the last rename a harmless overwrite of identical bytes. The
        // temp file is removed automatically when persist fails.
        tmp_file
            .persist(self.dir.join(&hash))
            .map_err(|err| StorageError::Io(format!("persist blob {hash}: {}", err.error)))?;
        self.closed = Some(hash.clone());
        Ok(hash)
    }

    fn hash(&self) -> Result<String> {
        self.closed.clone().ok_or(StorageError::WriterOpen)
    }
}

impl BlobStore for FilesystemStore {
    fn blob_open(&self, hash: &str) -> Result<Box<dyn BlobRead>> {
        let path = self.dir.join(hash);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(format!("blob {hash}")));
            }
            Err(err) => {
                return Err(StorageError::Io(format!(
                    "open blob {}: {err}",
                    path.display()
                )));
            }
        };
        let size = file
            .metadata()
            .map_err(|err| StorageError::Io(format!("stat blob {}: {err}", path.display())))?
            .len();
        Ok(Box::new(FileReader { file, size }))
    }

    fn blob_create(&self) -> Result<Box<dyn BlobWrite>> {
        let tmp = tempfile::NamedTempFile::new_in(self.dir.join(FS_TMP_DIR))
            .map_err(|err| StorageError::Io(format!("create blob temp file: {err}")))?;
        Ok(Box::new(FileWriter {
            dir: self.dir.clone(),
            tmp: Some(hasher::HashingWriter::new(tmp)),
            closed: None,
        }))
    }

    fn load_index(&self) -> Index {
        let path = self.dir.join(INDEX_JSON_FILE_NAME);
        let Ok(bytes) = fs::read(&path) else {
            return Index::default();
        };
        serde_json::from_slice(&bytes).unwrap_or_default()
    }

    fn persist_index(&self, index: &Index) -> Result<()> {
        let path = self.dir.join(INDEX_JSON_FILE_NAME);
        let bytes = serde_json::to_vec(index)
            .map_err(|err| StorageError::Io(format!("serialize index: {err}")))?;
        fs::write(&path, bytes)
            .map_err(|err| StorageError::Io(format!("write index {}: {err}", path.display())))
    }
}

// ---- registry ----

/// Storage facade: the blob backend plus the table of live roots.
pub struct Storage {
    store: Arc<dyn BlobStore>,
    inner: Mutex<StorageInner>,
}

struct StorageInner {
    roots: HashMap<String, Arc<Root>>,
    index: Index,
}

impl Storage {
    pub fn from_config(config: &Config) -> Result<Self> {
        match config.storage.kind {
            StorageKind::Memory => Ok(Self::memory()),
            StorageKind::Filesystem => {
                let Some(dir) = config.storage.directory.as_deref() else {
                    return Err(StorageError::Invalid(
                        "storage.directory is required for the filesystem backend".to_owned(),
                    ));
                };
                Self::filesystem(dir)
            }
        }
    }

    pub fn memory() -> Self {
        Self::with_store(Arc::new(MemoryStore::default()))
    }

    pub fn filesystem(dir: &Path) -> Result<Self> {
        Ok(Self::with_store(Arc::new(FilesystemStore::new(dir)?)))
    }

    fn with_store(store: Arc<dyn BlobStore>) -> Self {
        let index = store.load_index();
        Self {
            store,
            inner: Mutex::new(StorageInner {
                roots: HashMap::new(),
                index,
            }),
        }
    }

    pub fn store(&self) -> Arc<dyn BlobStore> {
        Arc::clone(&self.store)
    }

    pub fn blob_open(&self, hash: &str) -> Result<Box<dyn BlobRead>> {
        self.store.blob_open(hash)
    }

    pub fn blob_create(&self) -> Result<Box<dyn BlobWrite>> {
        self.store.blob_create()
    }

    /// Creates a new writable root with an empty tree, named `uuid:<v4>`.
    pub fn root_create(&self) -> (String, Arc<Root>) {
        let name = format!("uuid:{}", uuid::Uuid::new_v4());
        let root = Arc::new(Root::new(self.store()));
        self.lock_inner()
            .roots
            .insert(name.clone(), Arc::clone(&root));
        (name, root)
    }

    /// Creates a new writable root whose tree starts as a clone of an
    /// existing immutable root. Blobs are shared; mutation writes new
    /// directory blobs rather than touching existing ones.
    pub fn root_create_from(&self, hash: &str) -> Result<(String, Arc<Root>)> {
        let mut inner = self.lock_inner();
        if !inner.index.roots.contains_key(hash) {
            return Err(StorageError::NotFound(format!("hash in index: {hash}")));
        }
        let name = format!("uuid:{}", uuid::Uuid::new_v4());
        let root = Arc::new(Root::from_hash(self.store(), hash, false));
        inner.roots.insert(name.clone(), Arc::clone(&root));
        Ok((name, root))
    }

    /// Returns the live handle for a root, materializing a read-only root
    /// from the index for known hashes.
    pub fn root_open(&self, name: &str) -> Result<Arc<Root>> {
        let mut inner = self.lock_inner();
        if let Some(root) = inner.roots.get(name) {
            return Ok(Arc::clone(root));
        }
        let Some(entry) = inner.index.roots.get_mut(name) else {
            return Err(StorageError::NotFound(format!("root {name}")));
        };
        entry.used = Some(now_unix_ms());
        let root = Arc::new(Root::from_hash(self.store(), name, true));
        inner.roots.insert(name.to_owned(), Arc::clone(&root));
        Ok(root)
    }

    /// Seals a root: hashes every dirty subtree, registers the resulting
    /// hash as an immutable sibling, and persists the index.
    pub fn root_save(&self, root: &Root) -> Result<String> {
        let hash = root.save()?;
        let mut inner = self.lock_inner();
        inner
            .roots
            .entry(hash.clone())
            .or_insert_with(|| Arc::new(Root::from_hash(self.store(), &hash, true)));
        inner.index.roots.insert(
            hash.clone(),
            IndexRoot {
                used: Some(now_unix_ms()),
            },
        );
        self.store.persist_index(&inner.index)?;
        Ok(hash)
    }

    /// Registers an imported root hash without resealing it. The caller has
    /// already verified the tree blob-by-blob.
    pub fn register_imported_root(&self, hash: &str) -> Result<()> {
        let mut inner = self.lock_inner();
        inner
            .roots
            .entry(hash.to_owned())
            .or_insert_with(|| Arc::new(Root::from_hash(self.store(), hash, true)));
        inner.index.roots.insert(
            hash.to_owned(),
            IndexRoot {
                used: Some(now_unix_ms()),
            },
        );
        self.store.persist_index(&inner.index)
    }

    /// Sorted list of immutable root hashes known to the index.
    pub fn root_hashes(&self) -> Vec<String> {
        self.lock_inner().index.roots.keys().cloned().collect()
    }

    pub fn flush(&self) -> Result<()> {
        let inner = self.lock_inner();
        self.store.persist_index(&inner.index)
    }

    pub fn prune_cache(&self, unused_since: Duration) -> Result<()> {
        self.store.prune_cache(unused_since)
    }

    pub fn prune_storage(&self) -> Result<()> {
        self.store.prune_storage()
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, StorageInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
