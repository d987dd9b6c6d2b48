use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use tracing as log;
use walkdir::WalkDir;

use crate::config::OptimizerCfg;
use crate::utils::hash;

#[derive(Debug, Default, Clone, Copy)]
pub struct OptimizeStats {
    pub prefiltered: u64,
    pub deduplicated: u64,
    pub chunked: u64,
}

/// Sidecar recipe describing a chunked file, stored next to the chunks.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkRecipe {
    pub file: String,
    pub total_size: u64,
    pub sha256: String,
    pub chunks: Vec<String>,
}

pub const CHUNK_DIR_SUFFIX: &str = ".chunks";
pub const RECIPE_NAME: &str = "recipe.json";

/// Run the enabled optimizer stages over the staging tree, in order:
/// prefilter, deduplication, smart chunking.
pub fn run(cfg: &OptimizerCfg, staging: &Path, user_roots: &[PathBuf]) -> Result<OptimizeStats> {
    let mut stats = OptimizeStats::default();
    if cfg.prefilter {
        stats.prefiltered = prefilter(staging, cfg.prefilter_max_bytes)?;
    }
    if cfg.dedup {
        stats.deduplicated = deduplicate(staging, user_roots)?;
    }
    if cfg.chunking {
        stats.chunked = chunk_large_files(staging, cfg.chunk_threshold_bytes, cfg.chunk_size_bytes)?;
    }
    log::info!(
        "optimizer: {} prefiltered, {} deduplicated, {} chunked",
        stats.prefiltered,
        stats.deduplicated,
        stats.chunked
    );
    Ok(stats)
}

// ---------------------------------------------------------------------------
// prefilter

/// Normalize small text files: drop the UTF-8 BOM, CRLF to LF, trailing
/// whitespace stripped. Binary files are never touched.
fn prefilter(staging: &Path, max_bytes: u64) -> Result<u64> {
    let mut changed = 0;
    for entry in regular_files(staging) {
        let Ok(meta) = entry.metadata() else { continue };
        if meta.len() > max_bytes {
            continue;
        }
        let Ok(data) = fs::read(entry.path()) else {
            continue;
        };
        if !looks_like_text(&data) {
            continue;
        }
        let normalized = normalize_text(&data);
        if normalized != data {
            fs::write(entry.path(), &normalized)
                .with_context(|| format!("rewrite {}", entry.path().display()))?;
            changed += 1;
        }
    }
    Ok(changed)
}

fn looks_like_text(data: &[u8]) -> bool {
    let probe = &data[..data.len().min(8192)];
    !probe.contains(&0)
}

fn normalize_text(data: &[u8]) -> Vec<u8> {
    let data = data.strip_prefix(b"\xef\xbb\xbf".as_slice()).unwrap_or(data);
    let mut out = Vec::with_capacity(data.len());
    for line in data.split_inclusive(|b| *b == b'\n') {
        let (body, had_newline) = match line.last() {
            Some(b'\n') => (&line[..line.len() - 1], true),
            _ => (line, false),
        };
        let body = body.strip_suffix(b"\r".as_slice()).unwrap_or(body);
        let trimmed_len = body
            .iter()
            .rposition(|b| *b != b' ' && *b != b'\t')
            .map(|i| i + 1)
            .unwrap_or(0);
        out.extend_from_slice(&body[..trimmed_len]);
        if had_newline {
            out.push(b'\n');
        }
    }
    out
}

// ---------------------------------------------------------------------------
// deduplication

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Origin {
    System,
    User,
}

/// Content-hash regular files; for every duplicate group keep one
/// canonical and replace the rest with hard links (same filesystem) or
/// symlinks to the canonical's original absolute path. The user/system
/// boundary is never crossed.
fn deduplicate(staging: &Path, user_roots: &[PathBuf]) -> Result<u64> {
    let origin_of = |p: &Path| {
        if user_roots.iter().any(|r| p.starts_with(r)) {
            Origin::User
        } else {
            Origin::System
        }
    };

    let mut groups: HashMap<(Origin, String), Vec<PathBuf>> = HashMap::new();
    for entry in regular_files(staging) {
        let path = entry.path().to_path_buf();
        let Ok(meta) = entry.metadata() else { continue };
        if meta.len() == 0 {
            continue; // linking empty files buys nothing
        }
        let Ok(digest) = hash::hash_file(&path) else {
            continue;
        };
        groups
            .entry((origin_of(&path), digest))
            .or_default()
            .push(path);
    }

    let mut linked = 0;
    for ((_, _), mut members) in groups {
        if members.len() < 2 {
            continue;
        }
        members.sort();
        let canonical = members[0].clone();
        for dup in &members[1..] {
            fs::remove_file(dup).with_context(|| format!("unlink {}", dup.display()))?;
            match fs::hard_link(&canonical, dup) {
                Ok(()) => {
                    linked += 1;
                }
                Err(e) => {
                    // cross-device staging layouts fall back to symlinks
                    log::debug!("hardlink failed ({e}), using symlink: {}", dup.display());
                    let target = original_path(staging, &canonical);
                    std::os::unix::fs::symlink(&target, dup)
                        .with_context(|| format!("symlink {}", dup.display()))?;
                    linked += 1;
                }
            }
        }
    }
    Ok(linked)
}

/// The absolute path a staged file will restore to.
fn original_path(staging: &Path, staged: &Path) -> PathBuf {
    match staged.strip_prefix(staging) {
        Ok(rel) => Path::new("/").join(rel),
        Err(_) => staged.to_path_buf(),
    }
}

// ---------------------------------------------------------------------------
// smart chunking

/// Replace files above the threshold with a `.chunks/` directory holding
/// fixed-size pieces and a recipe; the original is removed.
fn chunk_large_files(staging: &Path, threshold: u64, chunk_size: u64) -> Result<u64> {
    use std::io::{Read, Write};

    let mut chunked = 0;
    let candidates: Vec<PathBuf> = regular_files(staging)
        .filter(|e| e.metadata().map(|m| m.len() > threshold).unwrap_or(false))
        .map(|e| e.path().to_path_buf())
        .collect();

    for path in candidates {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let chunk_dir = path.with_file_name(format!("{name}{CHUNK_DIR_SUFFIX}"));
        fs::create_dir(&chunk_dir)
            .with_context(|| format!("create {}", chunk_dir.display()))?;

        let mut input =
            fs::File::open(&path).with_context(|| format!("open {}", path.display()))?;
        let mut hasher = sha2::Sha256::default();
        let mut chunks = Vec::new();
        let mut total = 0u64;
        let mut buf = vec![0u8; chunk_size as usize];

        loop {
            let mut filled = 0usize;
            while filled < buf.len() {
                let n = input.read(&mut buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            hasher.update(&buf[..filled]);
            total += filled as u64;

            let chunk_name = format!("{name}.{:04}", chunks.len());
            let mut out = fs::File::create(chunk_dir.join(&chunk_name))?;
            out.write_all(&buf[..filled])?;
            chunks.push(chunk_name);
            if filled < buf.len() {
                break;
            }
        }

        let recipe = ChunkRecipe {
            file: name.clone(),
            total_size: total,
            sha256: format!("{:x}", hasher.finalize()),
            chunks,
        };
        fs::write(
            chunk_dir.join(RECIPE_NAME),
            serde_json::to_string_pretty(&recipe)?,
        )?;
        fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        chunked += 1;
        log::debug!("chunked {name} into {} piece(s)", recipe.chunks.len());
    }
    Ok(chunked)
}

/// Rebuild chunked files under `root`. Failures are per-file warnings:
/// the chunk directory is left in place for manual recovery and a count
/// of failures is returned alongside the rebuilt total.
pub fn reassemble_chunks(root: &Path) -> (u64, u64) {
    use std::io::Write;

    let mut rebuilt = 0;
    let mut failed = 0;

    let chunk_dirs: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .flatten()
        .filter(|e| {
            e.file_type().is_dir()
                && e.file_name().to_string_lossy().ends_with(CHUNK_DIR_SUFFIX)
        })
        .map(|e| e.path().to_path_buf())
        .collect();

    'dirs: for dir in chunk_dirs {
        let recipe: ChunkRecipe = match fs::read_to_string(dir.join(RECIPE_NAME))
            .map_err(anyhow::Error::from)
            .and_then(|s| serde_json::from_str(&s).map_err(Into::into))
        {
            Ok(r) => r,
            Err(e) => {
                log::warn!("chunk recipe unreadable in {}: {e:#}", dir.display());
                failed += 1;
                continue;
            }
        };

        let target = dir.with_file_name(&recipe.file);
        let tmp = dir.with_file_name(format!("{}.reassembly", recipe.file));
        let mut hasher = sha2::Sha256::default();
        let mut out = match fs::File::create(&tmp) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("cannot create {}: {e}", tmp.display());
                failed += 1;
                continue;
            }
        };

        let mut total = 0u64;
        for chunk in &recipe.chunks {
            let data = match fs::read(dir.join(chunk)) {
                Ok(d) => d,
                Err(e) => {
                    log::warn!("chunk {chunk} missing in {}: {e}", dir.display());
                    failed += 1;
                    let _ = fs::remove_file(&tmp);
                    continue 'dirs;
                }
            };
            hasher.update(&data);
            total += data.len() as u64;
            if out.write_all(&data).is_err() {
                failed += 1;
                let _ = fs::remove_file(&tmp);
                continue 'dirs;
            }
        }

        let digest = format!("{:x}", hasher.finalize());
        if total != recipe.total_size || digest != recipe.sha256 {
            log::warn!(
                "chunk reassembly mismatch for {} (size {total}/{}, hash differs: {})",
                recipe.file,
                recipe.total_size,
                digest != recipe.sha256
            );
            failed += 1;
            let _ = fs::remove_file(&tmp);
            continue;
        }

        if let Err(e) = fs::rename(&tmp, &target) {
            log::warn!("cannot move reassembled file into place: {e}");
            failed += 1;
            let _ = fs::remove_file(&tmp);
            continue;
        }
        let _ = fs::remove_dir_all(&dir);
        rebuilt += 1;
    }

    (rebuilt, failed)
}

fn regular_files(root: &Path) -> impl Iterator<Item = walkdir::DirEntry> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
}
