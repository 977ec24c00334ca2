use std::{collections::HashSet, io::Write};

use flate2::{Compression, write::GzEncoder};

use crate::storage::{
    BUNDLE_VERSION, INDEX_JSON_FILE_NAME, INDEX_MD_FILE_NAME, Index, IndexRoot, Result, Storage,
    StorageError, VERSION_MARKER_FILE_NAME, VersionMarker,
};

/// Streams a gzipped tar bundle of a sealed root: the version marker,
/// `index.json` naming the root, a human-readable `index.md` tree report,
/// and one flat entry per reachable blob (directory and file blobs alike,
/// each emitted once).
pub fn export<W: Write>(storage: &Storage, root_name: &str, out: W) -> Result<()> {
    let root = storage.root_open(root_name)?;
    let top = root.save()?;

    let gz = GzEncoder::new(out, Compression::default());
    let mut tar = tar::Builder::new(gz);

    let marker = VersionMarker {
        version: BUNDLE_VERSION.to_owned(),
    };
    let marker_bytes = serde_json::to_vec(&marker)
        .map_err(|err| StorageError::Io(format!("serialize version marker: {err}")))?;
    tar_add(&mut tar, VERSION_MARKER_FILE_NAME, &marker_bytes)?;

    let mut index = Index::default();
    index.roots.insert(top.clone(), IndexRoot::default());
    let index_bytes = serde_json::to_vec(&index)
        .map_err(|err| StorageError::Io(format!("serialize bundle index: {err}")))?;
    tar_add(&mut tar, INDEX_JSON_FILE_NAME, &index_bytes)?;

    let report = format!("# Index\n\n{}", root.report()?);
    tar_add(&mut tar, INDEX_MD_FILE_NAME, report.as_bytes())?;

    let mut seen: HashSet<String> = HashSet::new();
    root.walk(&mut |hash, _kind| {
        if !seen.insert(hash.to_owned()) {
            return Ok(());
        }
        let mut reader = storage.blob_open(hash)?;
        tar_add_reader(&mut tar, hash, reader.size(), &mut reader)
    })?;

    let gz = tar
        .into_inner()
        .map_err(|err| StorageError::Io(format!("finish bundle tar: {err}")))?;
    gz.finish()
        .map_err(|err| StorageError::Io(format!("finish bundle gzip: {err}")))?;
    Ok(())
}

fn tar_add<W: Write>(tar: &mut tar::Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    tar_add_reader(tar, name, data.len() as u64, &mut std::io::Cursor::new(data))
}

fn tar_add_reader<W: Write>(
    tar: &mut tar::Builder<W>,
    name: &str,
    size: u64,
    reader: &mut dyn std::io::Read,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    header.set_cksum();
    tar.append_data(&mut header, name, reader)
        .map_err(|err| StorageError::Io(format!("append {name} to bundle: {err}")))
}
