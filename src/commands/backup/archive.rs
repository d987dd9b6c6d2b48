use std::{
    collections::HashMap,
    fs,
    io::Read,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tracing as log;
use walkdir::WalkDir;

use crate::errors::Fault;
use crate::storage::sibling;
use crate::tooling::codec::{self, Codec, Mode};
use crate::utils::hash;

#[derive(Debug, Clone)]
pub struct ArchiveOutcome {
    pub archive: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
    pub entries: u64,
}

/// One streaming pass: staging tree → tar → compressor → SHA-256 tee →
/// `<final>.tmp`, then fsync + rename, and only then the `.sha256` file.
/// A crash in between leaves an orphan the next run removes.
pub fn write_archive(
    staging: &Path,
    final_path: &Path,
    codec_kind: Codec,
    level: u32,
    mode: Mode,
    threads: u32,
) -> Result<ArchiveOutcome> {
    let tmp_path = tmp_path_for(final_path);
    if let Some(dir) = final_path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("create {}", dir.display()))
            .context(Fault::Archive)?;
    }

    let level = codec::effective_level(level, mode);
    let result = stream_tree(staging, &tmp_path, codec_kind, level, threads);

    let (sha256, size_bytes, entries) = match result {
        Ok(v) => v,
        Err(e) => {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.context(Fault::Archive));
        }
    };

    fs::rename(&tmp_path, final_path)
        .with_context(|| format!("rename archive into place: {}", final_path.display()))
        .context(Fault::Archive)?;

    let sha_path = sibling(final_path, ".sha256");
    fs::write(&sha_path, format!("{sha256}\n"))
        .with_context(|| format!("write checksum {}", sha_path.display()))
        .context(Fault::Archive)?;

    log::info!(
        "archive written: {} ({} bytes, {} entries)",
        final_path.display(),
        size_bytes,
        entries
    );
    Ok(ArchiveOutcome {
        archive: final_path.to_path_buf(),
        sha256,
        size_bytes,
        entries,
    })
}

fn tmp_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".tmp");
    final_path.with_file_name(name)
}

fn stream_tree(
    staging: &Path,
    tmp_path: &Path,
    codec_kind: Codec,
    level: u32,
    threads: u32,
) -> Result<(String, u64, u64)> {
    let sink = codec::open_sink(codec_kind, level, threads, tmp_path)
        .context(Fault::Compression)?;
    let mut builder = tar::Builder::new(sink);
    builder.follow_symlinks(false);

    // (dev, inode) of already-emitted multi-link files, for hardlinks
    let mut seen_inodes: HashMap<(u64, u64), PathBuf> = HashMap::new();
    let mut entries = 0u64;

    // depth-first, siblings sorted: deterministic for identical input
    for entry in WalkDir::new(staging)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.context("walk staging tree")?;
        let rel = entry
            .path()
            .strip_prefix(staging)
            .context("entry outside staging root")?
            .to_path_buf();
        let meta = entry
            .metadata()
            .with_context(|| format!("stat {}", entry.path().display()))?;

        append_entry(&mut builder, entry.path(), &rel, &meta, &mut seen_inodes)
            .with_context(|| format!("append {}", rel.display()))?;
        entries += 1;
    }

    let sink = builder.into_inner().context("finish tar stream")?;
    let hashing = sink.finish().context(Fault::Compression)?;
    let (sha256, size_bytes) = hashing.finalize()?;
    Ok((sha256, size_bytes, entries))
}

fn append_entry(
    builder: &mut tar::Builder<Box<dyn codec::ArchiveSink>>,
    src: &Path,
    rel: &Path,
    meta: &fs::Metadata,
    seen_inodes: &mut HashMap<(u64, u64), PathBuf>,
) -> Result<()> {
    let ftype = meta.file_type();

    // PAX records carry nanosecond timestamps; the ustar field only has
    // whole seconds for mtime and nothing for atime
    let mtime_pax = format!("{}.{:09}", meta.mtime(), meta.mtime_nsec());
    let atime_pax = format!("{}.{:09}", meta.atime(), meta.atime_nsec());
    builder.append_pax_extensions([
        ("mtime", mtime_pax.as_bytes()),
        ("atime", atime_pax.as_bytes()),
    ])?;

    let mut header = tar::Header::new_gnu();
    header.set_metadata_in_mode(meta, tar::HeaderMode::Complete);

    if ftype.is_dir() {
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        builder.append_data(&mut header, rel, std::io::empty())?;
    } else if ftype.is_symlink() {
        let target = fs::read_link(src)?;
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        builder.append_link(&mut header, rel, &target)?;
    } else if ftype.is_file() {
        let key = (meta.dev(), meta.ino());
        if meta.nlink() > 1
            && let Some(first) = seen_inodes.get(&key)
        {
            header.set_entry_type(tar::EntryType::Link);
            header.set_size(0);
            builder.append_link(&mut header, rel, first)?;
            return Ok(());
        }
        if meta.nlink() > 1 {
            seen_inodes.insert(key, rel.to_path_buf());
        }
        let file = fs::File::open(src)?;
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(meta.len());
        builder.append_data(&mut header, rel, file)?;
    } else {
        log::debug!("skipping special entry in staging: {}", src.display());
    }
    Ok(())
}

/// Decompressing tar reader over a finished archive, shared by category
/// analysis, selective extraction and verification of bundled archives.
pub fn open_archive(path: &Path) -> Result<tar::Archive<Box<dyn Read + Send>>> {
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let codec_kind = Codec::from_archive_name(&name);
    let source = codec::open_source(codec_kind, path)?;
    Ok(tar::Archive::new(source))
}

/// Compare the archive's streamed hash against its `.sha256` sidecar.
pub fn verify_against_sidecar(archive: &Path) -> Result<bool> {
    let sha_path = sibling(archive, ".sha256");
    let expected = fs::read_to_string(&sha_path)
        .with_context(|| format!("read {}", sha_path.display()))?;
    Ok(hash::hash_file(archive)? == expected.trim())
}
