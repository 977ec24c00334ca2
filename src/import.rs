use std::{
    fs,
    io::{Read, Write as _},
    path::Path,
};

use flate2::read::GzDecoder;

use crate::{
    root::{DirManifest, EntryKind},
    storage::{
        BUNDLE_VERSION, INDEX_JSON_FILE_NAME, Index, Result, Storage, StorageError,
        VERSION_MARKER_FILE_NAME, VersionMarker,
    },
};

/// Installs an exported bundle under its declared root hash. The archive is
/// extracted to a scratch directory, the version marker is checked, and the
/// tree is rebuilt blob by blob with every hash re-verified. The root is
/// registered in the index only after the whole tree checks out, so a failed
/// import leaves the registry unchanged.
pub fn import<R: Read>(storage: &Storage, root_hash: &str, reader: R) -> Result<()> {
    if !root_hash.starts_with("sha256:") {
        return Err(StorageError::Invalid(format!(
            "import target must be a hash root, got {root_hash}"
        )));
    }

    let scratch = tempfile::tempdir()
        .map_err(|err| StorageError::Io(format!("create import scratch dir: {err}")))?;
    extract_bundle(reader, scratch.path())?;

    let marker_bytes = fs::read(scratch.path().join(VERSION_MARKER_FILE_NAME))
        .map_err(|_| StorageError::Invalid("bundle is missing the httplock marker".to_owned()))?;
    let marker: VersionMarker = serde_json::from_slice(&marker_bytes)
        .map_err(|err| StorageError::Invalid(format!("decode httplock marker: {err}")))?;
    if marker.version != BUNDLE_VERSION {
        return Err(StorageError::Invalid(format!(
            "unsupported bundle version {} (expected {BUNDLE_VERSION})",
            marker.version
        )));
    }

    let index_bytes = fs::read(scratch.path().join(INDEX_JSON_FILE_NAME))
        .map_err(|_| StorageError::Invalid("bundle is missing index.json".to_owned()))?;
    let index: Index = serde_json::from_slice(&index_bytes)
        .map_err(|err| StorageError::Invalid(format!("decode bundle index: {err}")))?;
    if !index.roots.contains_key(root_hash) {
        return Err(StorageError::Invalid(format!(
            "bundle does not contain root {root_hash}"
        )));
    }

    import_dir(storage, scratch.path(), root_hash)?;
    storage.register_imported_root(root_hash)
}

/// Extracts the flat bundle members into `dest`, keeping only the final
/// file-name component of each entry.
fn extract_bundle<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let gz = GzDecoder::new(reader);
    let mut archive = tar::Archive::new(gz);
    let entries = archive
        .entries()
        .map_err(|err| StorageError::Invalid(format!("read bundle archive: {err}")))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|err| StorageError::Invalid(format!("read bundle entry: {err}")))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .map_err(|err| StorageError::Invalid(format!("decode bundle entry name: {err}")))?;
        let Some(file_name) = path.file_name().map(|name| name.to_owned()) else {
            continue;
        };
        let out_path = dest.join(file_name);
        let mut out = fs::File::create(&out_path).map_err(|err| {
            StorageError::Io(format!("create {}: {err}", out_path.display()))
        })?;
        std::io::copy(&mut entry, &mut out)
            .map_err(|err| StorageError::Io(format!("extract {}: {err}", out_path.display())))?;
    }
    Ok(())
}

fn import_dir(storage: &Storage, base: &Path, hash: &str) -> Result<()> {
    let bytes = read_bundle_blob(base, hash)?;
    let manifest: DirManifest = serde_json::from_slice(&bytes)
        .map_err(|err| StorageError::Invalid(format!("decode directory blob {hash}: {err}")))?;
    push_blob(storage, &bytes, hash)?;
    for entry in manifest.entries.values() {
        match entry.kind {
            EntryKind::Dir => import_dir(storage, base, &entry.hash)?,
            EntryKind::File => {
                let bytes = read_bundle_blob(base, &entry.hash)?;
                push_blob(storage, &bytes, &entry.hash)?;
            }
        }
    }
    Ok(())
}

fn read_bundle_blob(base: &Path, hash: &str) -> Result<Vec<u8>> {
    validate_blob_name(hash)?;
    fs::read(base.join(hash))
        .map_err(|_| StorageError::NotFound(format!("blob {hash} in bundle")))
}

/// Writes bundle bytes into the store and verifies the computed hash against
/// the declared one.
fn push_blob(storage: &Storage, bytes: &[u8], expected: &str) -> Result<()> {
    let mut writer = storage.blob_create()?;
    writer
        .write_all(bytes)
        .map_err(|err| StorageError::Io(format!("write imported blob: {err}")))?;
    let computed = writer.close()?;
    if computed != expected {
        return Err(StorageError::HashMismatch {
            expected: expected.to_owned(),
            computed,
        });
    }
    Ok(())
}

/// Blob references come from manifests inside the bundle; constrain them to
/// `sha256:<hex>` so they can never escape the scratch directory.
fn validate_blob_name(hash: &str) -> Result<()> {
    let Some(hex) = hash.strip_prefix("sha256:") else {
        return Err(StorageError::Invalid(format!("malformed blob name {hash}")));
    };
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(StorageError::Invalid(format!("malformed blob name {hash}")));
    }
    Ok(())
}
