use std::{
    collections::BTreeMap,
    io::{Read as _, Write as _},
    sync::{Arc, Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};

use crate::storage::{BlobRead, BlobStore, BlobWrite, Result, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Dir,
    File,
}

/// Entry description returned by `Root::list`. The hash is empty while the
/// entry is dirty (not yet hashed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub hash: String,
    pub kind: EntryKind,
}

/// Serialized form of a directory. Entry names sort via the BTreeMap and
/// fields serialize in declaration order, so the encoding is canonical and
/// hashing it is reproducible.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct DirManifest {
    pub(crate) entries: BTreeMap<String, ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ManifestEntry {
    pub(crate) hash: String,
    pub(crate) kind: EntryKind,
}

/// Hash slot shared between the tree and an outstanding file writer. None
/// while the writer is open; the writer fills it on close.
type FileSlot = Arc<Mutex<Option<String>>>;

enum Entry {
    Dir(DirNode),
    File(FileSlot),
}

struct DirNode {
    /// None marks the directory dirty; every ancestor of a dirty node is
    /// also dirty.
    hash: Option<String>,
    /// None means not yet loaded from the store (hash must be present).
    entries: Option<BTreeMap<String, Entry>>,
}

impl DirNode {
    fn empty() -> Self {
        Self {
            hash: None,
            entries: Some(BTreeMap::new()),
        }
    }

    fn unloaded(hash: String) -> Self {
        Self {
            hash: Some(hash),
            entries: None,
        }
    }
}

/// Handle to a Merkle tree over the blob store. Mutable roots are created
/// empty or as clones of a sealed hash; read-only roots load lazily from an
/// immutable hash.
pub struct Root {
    store: Arc<dyn BlobStore>,
    readonly: bool,
    state: Mutex<RootState>,
}

impl std::fmt::Debug for Root {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Root").field("readonly", &self.readonly).finish()
    }
}

struct RootState {
    hash: Option<String>,
    dir: Option<DirNode>,
}

impl Root {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            readonly: false,
            state: Mutex::new(RootState {
                hash: None,
                dir: Some(DirNode::empty()),
            }),
        }
    }

    pub fn from_hash(store: Arc<dyn BlobStore>, hash: &str, readonly: bool) -> Self {
        Self {
            store,
            readonly,
            state: Mutex::new(RootState {
                hash: Some(hash.to_owned()),
                dir: None,
            }),
        }
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    /// Lists the entries of the directory at `path`.
    pub fn list(&self, path: &[String]) -> Result<BTreeMap<String, EntryInfo>> {
        let mut state = self.lock_state();
        let dir = self.descend(&mut state, path, false)?;
        let entries = Self::loaded_entries(&self.store, dir)?;
        let mut listing = BTreeMap::new();
        for (name, entry) in entries.iter() {
            let info = match entry {
                Entry::Dir(node) => EntryInfo {
                    hash: node.hash.clone().unwrap_or_default(),
                    kind: EntryKind::Dir,
                },
                Entry::File(slot) => EntryInfo {
                    hash: lock_slot(slot).clone().unwrap_or_default(),
                    kind: EntryKind::File,
                },
            };
            listing.insert(name.clone(), info);
        }
        Ok(listing)
    }

    /// Opens the file at `path` for reading.
    pub fn read(&self, path: &[String]) -> Result<Box<dyn BlobRead>> {
        let (parent, name) = split_path(path)?;
        let mut state = self.lock_state();
        let dir = self.descend(&mut state, parent, false)?;
        let entries = Self::loaded_entries(&self.store, dir)?;
        let Some(entry) = entries.get(name) else {
            return Err(StorageError::NotFound(path.join("/")));
        };
        let hash = match entry {
            Entry::Dir(_) => return Err(StorageError::NotAFile(path.join("/"))),
            Entry::File(slot) => lock_slot(slot).clone().ok_or(StorageError::WriterOpen)?,
        };
        drop(state);
        self.store.blob_open(&hash)
    }

    /// Opens the file at `path` for writing, creating intermediate
    /// directories. The dirent commits when the returned writer closes.
    pub fn write(&self, path: &[String]) -> Result<RootFileWriter> {
        if self.readonly {
            return Err(StorageError::ReadOnly);
        }
        let slot = self.prepare_file_entry(path, None)?;
        let writer = self.store.blob_create()?;
        Ok(RootFileWriter {
            writer: Some(writer),
            slot,
            committed: None,
        })
    }

    /// References an existing blob as the file at `path`, avoiding a second
    /// copy of the bytes.
    pub fn link(&self, path: &[String], blob_hash: &str) -> Result<()> {
        if self.readonly {
            return Err(StorageError::ReadOnly);
        }
        self.prepare_file_entry(path, Some(blob_hash.to_owned()))?;
        Ok(())
    }

    /// Returns the hash of the entry at `path`, hashing the subtree if it is
    /// dirty.
    pub fn entry_hash(&self, path: &[String]) -> Result<String> {
        let (parent, name) = split_path(path)?;
        let mut state = self.lock_state();
        let dir = self.descend(&mut state, parent, false)?;
        let entries = Self::loaded_entries(&self.store, dir)?;
        let Some(entry) = entries.get_mut(name) else {
            return Err(StorageError::NotFound(path.join("/")));
        };
        match entry {
            Entry::Dir(node) => hash_dir(&self.store, node),
            Entry::File(slot) => lock_slot(slot).clone().ok_or(StorageError::WriterOpen),
        }
    }

    /// Hashes every dirty subtree and returns the top hash. The root stays
    /// writable; further writes dirty it again.
    pub fn save(&self) -> Result<String> {
        let mut state = self.lock_state();
        if !self.readonly {
            if let Some(dir) = state.dir.as_mut() {
                let hash = hash_dir(&self.store, dir)?;
                state.hash = Some(hash);
            }
        }
        state
            .hash
            .clone()
            .ok_or_else(|| StorageError::Invalid("root hash missing".to_owned()))
    }

    /// Pre-order walk over the sealed tree, visiting every reachable blob
    /// hash. Directory blobs come before their children; entries visit in
    /// name order.
    pub fn walk(&self, visit: &mut dyn FnMut(&str, EntryKind) -> Result<()>) -> Result<()> {
        let top = self.save()?;
        self.walk_dir(&top, visit)
    }

    fn walk_dir(&self, hash: &str, visit: &mut dyn FnMut(&str, EntryKind) -> Result<()>) -> Result<()> {
        visit(hash, EntryKind::Dir)?;
        let manifest = read_manifest(&self.store, hash)?;
        for (_, entry) in manifest.entries {
            match entry.kind {
                EntryKind::Dir => self.walk_dir(&entry.hash, visit)?,
                EntryKind::File => visit(&entry.hash, EntryKind::File)?,
            }
        }
        Ok(())
    }

    /// Markdown tree report: the root hash followed by a nested,
    /// alphabetized entry list.
    pub fn report(&self) -> Result<String> {
        let top = self.save()?;
        let mut lines = vec![format!("[{top}](./{top})"), String::new()];
        self.report_dir(&top, "", &mut lines)?;
        Ok(lines.join("\n") + "\n")
    }

    fn report_dir(&self, hash: &str, prefix: &str, lines: &mut Vec<String>) -> Result<()> {
        let manifest = read_manifest(&self.store, hash)?;
        for (name, entry) in manifest.entries {
            lines.push(format!("{prefix}- [{name}](./{})", entry.hash));
            if entry.kind == EntryKind::Dir {
                self.report_dir(&entry.hash, &format!("{prefix}  "), lines)?;
            }
        }
        Ok(())
    }

    fn prepare_file_entry(&self, path: &[String], hash: Option<String>) -> Result<FileSlot> {
        let (parent, name) = split_path(path)?;
        let mut state = self.lock_state();
        let dir = self.descend(&mut state, parent, true)?;
        let entries = Self::loaded_entries(&self.store, dir)?;
        if let Some(Entry::Dir(_)) = entries.get(name) {
            return Err(StorageError::NotAFile(path.join("/")));
        }
        let slot: FileSlot = Arc::new(Mutex::new(hash));
        entries.insert(name.clone(), Entry::File(Arc::clone(&slot)));
        Ok(slot)
    }

    /// Descends to the directory at `path`. A write descent creates missing
    /// intermediate directories and clears cached hashes along the spine.
    fn descend<'a>(
        &self,
        state: &'a mut MutexGuard<'_, RootState>,
        path: &[String],
        write: bool,
    ) -> Result<&'a mut DirNode> {
        if self.readonly && write {
            return Err(StorageError::ReadOnly);
        }
        self.materialize_root(state)?;
        if write {
            state.hash = None;
        }
        let mut current = state
            .dir
            .as_mut()
            .ok_or_else(|| StorageError::Invalid("root directory missing".to_owned()))?;
        for (depth, name) in path.iter().enumerate() {
            // Load before clearing: an unloaded node needs its hash to load.
            Self::loaded_entries(&self.store, current)?;
            if write {
                current.hash = None;
            }
            let entries = current
                .entries
                .as_mut()
                .ok_or_else(|| StorageError::Invalid("directory entries missing".to_owned()))?;
            if !entries.contains_key(name) {
                if !write {
                    return Err(StorageError::NotFound(path[..=depth].join("/")));
                }
                entries.insert(name.clone(), Entry::Dir(DirNode::empty()));
            }
            current = match entries.get_mut(name) {
                Some(Entry::Dir(node)) => node,
                Some(Entry::File(_)) => {
                    return Err(StorageError::NotADir(path[..=depth].join("/")));
                }
                None => return Err(StorageError::NotFound(path[..=depth].join("/"))),
            };
        }
        if write {
            Self::loaded_entries(&self.store, current)?;
            current.hash = None;
        }
        Ok(current)
    }

    fn materialize_root(&self, state: &mut MutexGuard<'_, RootState>) -> Result<()> {
        if state.dir.is_none() {
            let hash = state
                .hash
                .clone()
                .ok_or_else(|| StorageError::Invalid("root hash missing".to_owned()))?;
            state.dir = Some(DirNode::unloaded(hash));
        }
        Ok(())
    }

    fn loaded_entries<'a>(
        store: &Arc<dyn BlobStore>,
        node: &'a mut DirNode,
    ) -> Result<&'a mut BTreeMap<String, Entry>> {
        if node.entries.is_none() {
            let hash = node
                .hash
                .clone()
                .ok_or_else(|| StorageError::Invalid("unloaded directory has no hash".to_owned()))?;
            let manifest = read_manifest(store, &hash)?;
            let mut entries = BTreeMap::new();
            for (name, entry) in manifest.entries {
                let child = match entry.kind {
                    EntryKind::Dir => Entry::Dir(DirNode::unloaded(entry.hash)),
                    EntryKind::File => Entry::File(Arc::new(Mutex::new(Some(entry.hash)))),
                };
                entries.insert(name, child);
            }
            node.entries = Some(entries);
        }
        node.entries
            .as_mut()
            .ok_or_else(|| StorageError::Invalid("directory entries missing".to_owned()))
    }

    fn lock_state(&self) -> MutexGuard<'_, RootState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// File writer handed out by `Root::write`. The dirent hash commits when
/// `close` succeeds; a dropped writer leaves the entry dirty so a later
/// `save` surfaces the abandoned write instead of sealing over it.
pub struct RootFileWriter {
    writer: Option<Box<dyn BlobWrite>>,
    slot: FileSlot,
    committed: Option<String>,
}

impl std::fmt::Debug for RootFileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootFileWriter")
            .field("committed", &self.committed)
            .finish()
    }
}

impl RootFileWriter {
    pub fn close(&mut self) -> Result<String> {
        if let Some(hash) = &self.committed {
            return Ok(hash.clone());
        }
        let mut writer = self.writer.take().ok_or(StorageError::WriterOpen)?;
        let hash = writer.close()?;
        *lock_slot(&self.slot) = Some(hash.clone());
        self.committed = Some(hash.clone());
        Ok(hash)
    }

    pub fn hash(&self) -> Result<String> {
        self.committed.clone().ok_or(StorageError::WriterOpen)
    }
}

impl std::io::Write for RootFileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.writer.as_mut() {
            Some(writer) => writer.write(buf),
            None => Err(std::io::Error::other("file writer is closed")),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

fn hash_dir(store: &Arc<dyn BlobStore>, node: &mut DirNode) -> Result<String> {
    if let Some(hash) = &node.hash {
        return Ok(hash.clone());
    }
    let Some(entries) = node.entries.as_mut() else {
        return Err(StorageError::Invalid(
            "dirty directory has no loaded entries".to_owned(),
        ));
    };
    let mut manifest = DirManifest {
        entries: BTreeMap::new(),
    };
    for (name, entry) in entries.iter_mut() {
        let (hash, kind) = match entry {
            Entry::Dir(child) => (hash_dir(store, child)?, EntryKind::Dir),
            Entry::File(slot) => (
                lock_slot(slot).clone().ok_or(StorageError::WriterOpen)?,
                EntryKind::File,
            ),
        };
        manifest.entries.insert(name.clone(), ManifestEntry { hash, kind });
    }
    let bytes = serde_json::to_vec(&manifest)
        .map_err(|err| StorageError::Io(format!("serialize directory: {err}")))?;
    let mut writer = store.blob_create()?;
    writer
        .write_all(&bytes)
        .map_err(|err| StorageError::Io(format!("write directory blob: {err}")))?;
    let hash = writer.close()?;
    node.hash = Some(hash.clone());
    Ok(hash)
}

fn read_manifest(store: &Arc<dyn BlobStore>, hash: &str) -> Result<DirManifest> {
    let mut reader = store.blob_open(hash)?;
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .map_err(|err| StorageError::Io(format!("read directory blob {hash}: {err}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|err| StorageError::Invalid(format!("decode directory blob {hash}: {err}")))
}

fn split_path(path: &[String]) -> Result<(&[String], &String)> {
    match path.split_last() {
        Some((name, parent)) => Ok((parent, name)),
        None => Err(StorageError::Invalid("path must not be empty".to_owned())),
    }
}

fn lock_slot(slot: &FileSlot) -> MutexGuard<'_, Option<String>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---- diff ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffReport {
    pub r1: String,
    pub r2: String,
    pub entries: Vec<DiffEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub action: DiffAction,
    pub path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash2: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffAction {
    Added,
    Deleted,
    Changed,
}

/// Compares two sealed roots, reporting added, deleted, and changed files in
/// lexicographic path order. Dirty subtrees are hashed first.
pub fn diff_roots(r1: &Root, r2: &Root) -> Result<DiffReport> {
    let h1 = r1.save()?;
    let h2 = r2.save()?;
    let mut iter1 = FileIter::new(Arc::clone(&r1.store), &h1)?;
    let mut iter2 = FileIter::new(Arc::clone(&r2.store), &h2)?;

    let mut entries = Vec::new();
    loop {
        match (iter1.current.clone(), iter2.current.clone()) {
            (None, None) => break,
            (Some((path, hash)), None) => {
                entries.push(DiffEntry {
                    action: DiffAction::Deleted,
                    path,
                    hash1: Some(hash),
                    hash2: None,
                });
                iter1.advance()?;
            }
            (None, Some((path, hash))) => {
                entries.push(DiffEntry {
                    action: DiffAction::Added,
                    path,
                    hash1: None,
                    hash2: Some(hash),
                });
                iter2.advance()?;
            }
            (Some((path1, hash1)), Some((path2, hash2))) => match path1.cmp(&path2) {
                std::cmp::Ordering::Less => {
                    entries.push(DiffEntry {
                        action: DiffAction::Deleted,
                        path: path1,
                        hash1: Some(hash1),
                        hash2: None,
                    });
                    iter1.advance()?;
                }
                std::cmp::Ordering::Greater => {
                    entries.push(DiffEntry {
                        action: DiffAction::Added,
                        path: path2,
                        hash1: None,
                        hash2: Some(hash2),
                    });
                    iter2.advance()?;
                }
                std::cmp::Ordering::Equal => {
                    if hash1 != hash2 {
                        entries.push(DiffEntry {
                            action: DiffAction::Changed,
                            path: path1,
                            hash1: Some(hash1),
                            hash2: Some(hash2),
                        });
                    }
                    iter1.advance()?;
                    iter2.advance()?;
                }
            },
        }
    }

    Ok(DiffReport {
        r1: h1,
        r2: h2,
        entries,
    })
}

/// Depth-first iterator yielding file paths (and their blob hashes) in
/// lexicographic order. Directories descend alphabetically; only files emit.
struct FileIter {
    store: Arc<dyn BlobStore>,
    stack: Vec<std::collections::btree_map::IntoIter<String, ManifestEntry>>,
    path: Vec<String>,
    current: Option<(Vec<String>, String)>,
}

impl FileIter {
    fn new(store: Arc<dyn BlobStore>, top_hash: &str) -> Result<Self> {
        let manifest = read_manifest(&store, top_hash)?;
        let mut iter = Self {
            store,
            stack: vec![manifest.entries.into_iter()],
            path: Vec::new(),
            current: None,
        };
        iter.advance()?;
        Ok(iter)
    }

    fn advance(&mut self) -> Result<()> {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                self.current = None;
                return Ok(());
            };
            let Some((name, entry)) = frame.next() else {
                self.stack.pop();
                self.path.pop();
                continue;
            };
            match entry.kind {
                EntryKind::File => {
                    let mut path = self.path.clone();
                    path.push(name);
                    self.current = Some((path, entry.hash));
                    return Ok(());
                }
                EntryKind::Dir => {
                    let manifest = read_manifest(&self.store, &entry.hash)?;
                    self.stack.push(manifest.entries.into_iter());
                    self.path.push(name);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read as _, Write as _};

    use super::{DiffAction, EntryKind, Root, diff_roots};
    use crate::storage::{Storage, StorageError};

    fn path(components: &[&str]) -> Vec<String> {
        components.iter().map(|c| (*c).to_owned()).collect()
    }

    fn write_file(root: &Root, p: &[&str], contents: &[u8]) -> String {
        let mut writer = root.write(&path(p)).unwrap();
        writer.write_all(contents).unwrap();
        writer.close().unwrap()
    }

    #[test]
    fn identical_trees_hash_identically() {
        let storage = Storage::memory();
        let first = Root::new(storage.store());
        let second = Root::new(storage.store());
        for root in [&first, &second] {
            write_file(root, &["host", "a"], b"one");
            write_file(root, &["host", "sub", "b"], b"two");
        }
        assert_eq!(first.save().unwrap(), second.save().unwrap());
    }

    #[test]
    fn content_changes_propagate_to_the_top_hash() {
        let storage = Storage::memory();
        let root = Root::new(storage.store());
        write_file(&root, &["host", "a"], b"one");
        let before = root.save().unwrap();

        write_file(&root, &["host", "a"], b"changed");
        let after = root.save().unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn save_is_stable_without_intervening_writes() {
        let storage = Storage::memory();
        let root = Root::new(storage.store());
        write_file(&root, &["a"], b"x");
        assert_eq!(root.save().unwrap(), root.save().unwrap());
    }

    #[test]
    fn file_overwrite_replaces_the_dirent() {
        let storage = Storage::memory();
        let root = Root::new(storage.store());
        write_file(&root, &["f"], b"old");
        write_file(&root, &["f"], b"new");

        let mut reader = root.read(&path(&["f"])).unwrap();
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"new");
    }

    #[test]
    fn traversal_through_a_file_fails_with_not_a_dir() {
        let storage = Storage::memory();
        let root = Root::new(storage.store());
        write_file(&root, &["a"], b"leaf");

        let err = root.write(&path(&["a", "b"])).unwrap_err();
        assert!(matches!(err, StorageError::NotADir(_)), "{err}");

        let err = root.read(&path(&["a", "b"])).unwrap_err();
        assert!(matches!(err, StorageError::NotADir(_)), "{err}");
    }

    #[test]
    fn writing_over_a_directory_fails_with_not_a_file() {
        let storage = Storage::memory();
        let root = Root::new(storage.store());
        write_file(&root, &["dir", "child"], b"x");

        let err = root.write(&path(&["dir"])).unwrap_err();
        assert!(matches!(err, StorageError::NotAFile(_)), "{err}");
    }

    #[test]
    fn listing_a_missing_path_fails_with_not_found() {
        let storage = Storage::memory();
        let root = Root::new(storage.store());
        let err = root.list(&path(&["missing"])).unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)), "{err}");
    }

    #[test]
    fn listing_shows_empty_hashes_until_sealed() {
        let storage = Storage::memory();
        let root = Root::new(storage.store());
        write_file(&root, &["dir", "f"], b"x");

        let listing = root.list(&[]).unwrap();
        assert_eq!(listing["dir"].kind, EntryKind::Dir);
        assert_eq!(listing["dir"].hash, "");

        root.save().unwrap();
        let listing = root.list(&[]).unwrap();
        assert!(listing["dir"].hash.starts_with("sha256:"));
    }

    #[test]
    fn entry_hash_resolves_dirty_subtrees() {
        let storage = Storage::memory();
        let root = Root::new(storage.store());
        write_file(&root, &["dir", "f"], b"x");

        let dir_hash = root.entry_hash(&path(&["dir"])).unwrap();
        assert!(dir_hash.starts_with("sha256:"));

        root.save().unwrap();
        let listing = root.list(&[]).unwrap();
        assert_eq!(listing["dir"].hash, dir_hash);
    }

    #[test]
    fn read_of_an_open_writer_fails_until_close() {
        let storage = Storage::memory();
        let root = Root::new(storage.store());
        let mut writer = root.write(&path(&["f"])).unwrap();
        writer.write_all(b"partial").unwrap();

        assert!(matches!(writer.hash(), Err(StorageError::WriterOpen)));
        assert!(matches!(
            root.read(&path(&["f"])),
            Err(StorageError::WriterOpen)
        ));
        assert!(matches!(root.save(), Err(StorageError::WriterOpen)));

        writer.close().unwrap();
        assert!(root.read(&path(&["f"])).is_ok());
        assert!(root.save().is_ok());
    }

    #[test]
    fn abandoned_writer_keeps_the_root_unsealable() {
        let storage = Storage::memory();
        let root = Root::new(storage.store());
        {
            let mut writer = root.write(&path(&["f"])).unwrap();
            writer.write_all(b"never closed").unwrap();
        }
        assert!(matches!(root.save(), Err(StorageError::WriterOpen)));
    }

    #[test]
    fn link_points_a_file_at_an_existing_blob() {
        let storage = Storage::memory();
        let mut blob = storage.blob_create().unwrap();
        blob.write_all(b"shared bytes").unwrap();
        let blob_hash = blob.close().unwrap();

        let root = Root::new(storage.store());
        root.link(&path(&["dir", "body"]), &blob_hash).unwrap();

        let mut reader = root.read(&path(&["dir", "body"])).unwrap();
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"shared bytes");
        assert_eq!(root.entry_hash(&path(&["dir", "body"])).unwrap(), blob_hash);
    }

    #[test]
    fn sealed_root_walk_matches_the_writable_tree() {
        let storage = Storage::memory();
        let (_, root) = storage.root_create();
        write_file(&root, &["host", "a"], b"one");
        write_file(&root, &["host", "deep", "b"], b"two");
        let hash = storage.root_save(&root).unwrap();

        let mut original_walk = Vec::new();
        root.walk(&mut |hash, kind| {
            original_walk.push((hash.to_owned(), kind));
            Ok(())
        })
        .unwrap();

        let sealed = storage.root_open(&hash).unwrap();
        let mut sealed_walk = Vec::new();
        sealed
            .walk(&mut |hash, kind| {
                sealed_walk.push((hash.to_owned(), kind));
                Ok(())
            })
            .unwrap();

        assert_eq!(original_walk, sealed_walk);
        assert_eq!(original_walk[0], (hash, EntryKind::Dir));
    }

    #[test]
    fn report_lists_entries_alphabetically_with_indentation() {
        let storage = Storage::memory();
        let root = Root::new(storage.store());
        write_file(&root, &["zeta"], b"z");
        write_file(&root, &["alpha", "inner"], b"a");
        let top = root.save().unwrap();

        let report = root.report().unwrap();
        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(lines[0], format!("[{top}](./{top})"));
        assert_eq!(lines[1], "");
        assert!(lines[2].starts_with("- [alpha]"), "line: {}", lines[2]);
        assert!(lines[3].starts_with("  - [inner]"), "line: {}", lines[3]);
        assert!(lines[4].starts_with("- [zeta]"), "line: {}", lines[4]);
    }

    #[test]
    fn diff_of_a_root_with_itself_is_empty() {
        let storage = Storage::memory();
        let root = Root::new(storage.store());
        write_file(&root, &["host", "a"], b"one");

        let report = diff_roots(&root, &root).unwrap();
        assert_eq!(report.r1, report.r2);
        assert!(report.entries.is_empty());
    }

    #[test]
    fn diff_reports_added_deleted_and_changed_in_path_order() {
        let storage = Storage::memory();
        let left = Root::new(storage.store());
        write_file(&left, &["host", "changed"], b"old");
        write_file(&left, &["host", "removed"], b"gone");

        let right = Root::new(storage.store());
        write_file(&right, &["host", "added"], b"new");
        write_file(&right, &["host", "changed"], b"new contents");

        let report = diff_roots(&left, &right).unwrap();
        let actions: Vec<(DiffAction, Vec<String>)> = report
            .entries
            .iter()
            .map(|entry| (entry.action, entry.path.clone()))
            .collect();
        assert_eq!(
            actions,
            vec![
                (DiffAction::Added, path(&["host", "added"])),
                (DiffAction::Changed, path(&["host", "changed"])),
                (DiffAction::Deleted, path(&["host", "removed"])),
            ]
        );

        let changed = &report.entries[1];
        assert!(changed.hash1.is_some() && changed.hash2.is_some());
        assert_ne!(changed.hash1, changed.hash2);

        let mut sorted = report.entries.clone();
        sorted.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(sorted, report.entries, "entries should be path-sorted");
    }
}
