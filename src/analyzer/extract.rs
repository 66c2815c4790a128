use std::collections::HashSet;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::TargetPaths;
use super::index::{self, MemberIndex, MemberKind};

/// A single layer's tar data, re-openable for the two extraction passes.
///
/// Layers staged to disk by the walker are opened twice; layers pulled
/// straight out of an image archive stream arrive as bytes.
pub enum LayerSource {
    Staged(PathBuf),
    Bytes(Vec<u8>),
}

impl LayerSource {
    /// Open a fresh reader over the (decompressed) layer tar.
    ///
    /// Gzip is detected by magic bytes, the same sniff used for layer blobs
    /// inside `docker save` archives — extensions are unreliable there.
    fn open(&self) -> Result<Box<dyn Read + '_>> {
        match self {
            LayerSource::Staged(path) => {
                let mut magic = [0u8; 2];
                let n = File::open(path)
                    .with_context(|| format!("Failed to open layer {}", path.display()))?
                    .read(&mut magic)?;
                let file = File::open(path)?;
                if n == 2 && is_gzip(&magic) {
                    Ok(Box::new(flate2::read::GzDecoder::new(file)))
                } else {
                    Ok(Box::new(file))
                }
            }
            LayerSource::Bytes(data) => {
                let cursor = Cursor::new(data.as_slice());
                if data.len() >= 2 && is_gzip(&data[..2]) {
                    Ok(Box::new(flate2::read::GzDecoder::new(cursor)))
                } else {
                    Ok(Box::new(cursor))
                }
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            LayerSource::Staged(path) => path.display().to_string(),
            LayerSource::Bytes(data) => format!("<{} byte stream>", data.len()),
        }
    }
}

fn is_gzip(magic: &[u8]) -> bool {
    magic[0] == 0x1f && magic[1] == 0x8b
}

/// Selectively extract one layer into `rootfs`.
///
/// Only members whose normalized path matches a target path are extracted,
/// plus the same-layer targets of matched symlinks. Non-symlinks land on disk
/// before any symlink is materialized, so a link's target already exists if
/// this layer provided it. Per-member failures are logged and skipped; an
/// error return means the layer itself could not be read.
pub fn extract_layer(source: &LayerSource, targets: &TargetPaths, rootfs: &Path) -> Result<()> {
    // Pass 1: index every member of the layer.
    let mut archive = tar::Archive::new(source.open()?);
    let index = MemberIndex::from_archive(&mut archive)
        .with_context(|| format!("Failed to read layer {}", source.describe()))?;

    debug!(layer = %source.describe(), members = index.len(), "indexed layer");

    let selected = select_members(&index, targets);
    if selected.is_empty() {
        return Ok(());
    }

    // Pass 2: unpack selected non-symlink members.
    let mut archive = tar::Archive::new(source.open()?);
    for entry_result in archive.entries()? {
        let mut entry = match entry_result {
            Ok(e) => e,
            Err(_) => continue,
        };
        let path = match entry.path() {
            Ok(p) => index::normalize(&p.to_string_lossy()),
            Err(_) => continue,
        };
        if !selected.contains(&path) || entry.header().entry_type() == tar::EntryType::Symlink {
            continue;
        }

        // Later layers overwrite earlier ones at the same path.
        let _ = std::fs::remove_file(rootfs.join(&path));
        match entry.unpack_in(rootfs) {
            Ok(true) => debug!(%path, "extracted"),
            Ok(false) => warn!(%path, "skipped member unpacking outside the scratch root"),
            Err(e) => warn!(%path, error = %e, "failed to extract member"),
        }
    }

    // Pass 3: materialize selected symlinks, targets now on disk.
    for path in &selected {
        let Some(member) = index.get(path) else { continue };
        let MemberKind::Symlink { target } = &member.kind else {
            continue;
        };
        if let Err(e) = place_symlink(rootfs, path, target) {
            warn!(%path, error = %e, "failed to create symlink");
        }
    }

    Ok(())
}

/// Compute the extraction set: exact target-path matches that are regular
/// files or symlinks, plus same-layer resolved symlink targets.
fn select_members(index: &MemberIndex, targets: &TargetPaths) -> HashSet<String> {
    let mut selected = HashSet::new();

    for candidate in targets.all() {
        if let Some(member) = index.get(candidate) {
            match member.kind {
                MemberKind::File { .. } | MemberKind::Symlink { .. } => {
                    selected.insert(member.path.clone());
                }
                // Directories are never matched.
                _ => {}
            }
        }
    }

    let mut link_targets = Vec::new();
    for path in &selected {
        if let Some(member) = index.get(path)
            && let MemberKind::Symlink { target } = &member.kind
        {
            let resolved = index::resolve_link_target(path, target);
            if index.contains(&resolved) {
                link_targets.push(resolved);
            } else {
                // Cross-layer resolution is not attempted; a later layer may
                // still provide this path on its own.
                warn!(link = %path, target = %resolved, "symlink target not present in this layer");
            }
        }
    }
    selected.extend(link_targets);

    selected
}

fn place_symlink(rootfs: &Path, path: &str, target: &str) -> std::io::Result<()> {
    let dest = rootfs.join(path);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _ = std::fs::remove_file(&dest);
    std::os::unix::fs::symlink(target, &dest)
}
