use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use super::TargetPaths;
use super::extract::{self, LayerSource};
use super::index;

// ---- `docker save` archive structs (manifest.json) ----

#[derive(Deserialize)]
struct ManifestEntry {
    #[serde(rename = "Config", default)]
    config: Option<String>,
    #[serde(rename = "Layers", default)]
    layers: Vec<String>,
}

// ---- Embedded image config (for direct tar input) ----

#[derive(Deserialize)]
struct ImageConfig {
    #[serde(default)]
    config: Option<RunConfig>,
    #[serde(default)]
    history: Vec<HistoryEntry>,
}

#[derive(Deserialize)]
struct RunConfig {
    #[serde(rename = "User", default)]
    user: Option<String>,
}

#[derive(Deserialize)]
struct HistoryEntry {
    created_by: Option<String>,
}

/// Run-as-user and build history read out of the archive itself, used when
/// no runtime client is available to inspect the image.
#[derive(Debug, Default)]
pub struct EmbeddedIdentity {
    pub user: Option<String>,
    pub history: Vec<String>,
}

/// Populate `rootfs` from the image archive at `archive_path`.
///
/// Layers are selectively extracted in manifest order, so a later layer wins
/// on path conflicts. With no usable manifest the walker falls back to
/// treating every `*.tar`/`*.tar.gz`/`*.tgz` entry as a layer, in listing
/// order. Per-layer failures never escape; only an unreadable archive does.
/// The archive file itself is left in place — it is a handoff artifact.
pub fn assemble_rootfs(
    archive_path: &Path,
    rootfs: &Path,
    stage_dir: &Path,
    targets: &TargetPaths,
) -> Result<()> {
    std::fs::create_dir_all(rootfs)
        .with_context(|| format!("Failed to create {}", rootfs.display()))?;

    if let Some(manifest) = load_manifest(archive_path)?
        && !manifest.layers.is_empty()
    {
        match extract_declared_layers(archive_path, &manifest.layers, rootfs, stage_dir, targets) {
            Ok(extracted) if extracted > 0 => return Ok(()),
            Ok(_) => warn!("no declared layers found in archive, falling back to raw scan"),
            Err(e) => warn!(error = %e, "declared-layer extraction failed, falling back to raw scan"),
        }
    } else {
        debug!("no usable manifest, scanning archive for layer-like entries");
    }

    fallback_walk(archive_path, rootfs, targets)
}

/// Extract the layers a manifest declares, in manifest order.
///
/// One scan stages every declared layer blob to `stage_dir`; each staged blob
/// is then selectively extracted and deleted. Returns how many layers were
/// actually extracted.
fn extract_declared_layers(
    archive_path: &Path,
    layers: &[String],
    rootfs: &Path,
    stage_dir: &Path,
    targets: &TargetPaths,
) -> Result<usize> {
    let position: HashMap<String, usize> = layers
        .iter()
        .enumerate()
        .map(|(i, name)| (index::normalize(name), i))
        .collect();

    let mut staged: HashMap<usize, PathBuf> = HashMap::new();
    let file = File::open(archive_path)
        .with_context(|| format!("Failed to open {}", archive_path.display()))?;
    let mut archive = tar::Archive::new(file);

    for entry_result in archive.entries()? {
        let mut entry = entry_result?;
        let entry_path = index::normalize(&entry.path()?.to_string_lossy());
        if let Some(&i) = position.get(&entry_path) {
            let dest = stage_dir.join(format!("layer-{i:03}.tar"));
            let mut out = File::create(&dest)
                .with_context(|| format!("Failed to stage layer to {}", dest.display()))?;
            std::io::copy(&mut entry, &mut out)
                .with_context(|| format!("Failed to stage layer {entry_path}"))?;
            staged.insert(i, dest);
        }
    }

    let mut extracted = 0;
    for (i, name) in layers.iter().enumerate() {
        let Some(path) = staged.get(&i) else {
            warn!(layer = %name, "declared layer not present in archive");
            continue;
        };
        match extract::extract_layer(&LayerSource::Staged(path.clone()), targets, rootfs) {
            Ok(()) => extracted += 1,
            Err(e) => warn!(layer = %name, error = %e, "skipping unreadable layer"),
        }
        let _ = std::fs::remove_file(path);
    }

    Ok(extracted)
}

/// Best-effort path for archives without a usable manifest: any entry that
/// looks like a tarball is treated as a layer, in listing order.
fn fallback_walk(archive_path: &Path, rootfs: &Path, targets: &TargetPaths) -> Result<()> {
    let file = File::open(archive_path)
        .with_context(|| format!("Failed to open {}", archive_path.display()))?;
    let mut archive = tar::Archive::new(file);

    for entry_result in archive.entries()? {
        let mut entry = match entry_result {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "stopping raw scan on unreadable entry");
                break;
            }
        };
        let Ok(path) = entry.path() else { continue };
        let entry_path = path.to_string_lossy().to_string();
        if !(entry_path.ends_with(".tar")
            || entry_path.ends_with(".tar.gz")
            || entry_path.ends_with(".tgz"))
        {
            continue;
        }

        let mut data = Vec::new();
        if let Err(e) = entry.read_to_end(&mut data) {
            warn!(layer = %entry_path, error = %e, "skipping unreadable layer entry");
            continue;
        }
        if let Err(e) = extract::extract_layer(&LayerSource::Bytes(data), targets, rootfs) {
            warn!(layer = %entry_path, error = %e, "skipping unreadable layer");
        }
    }

    Ok(())
}

/// Locate and parse the manifest: `manifest.json`, or the first root-level
/// JSON entry as a fallback. A malformed manifest yields `None` — the caller
/// falls back to the raw scan rather than failing the analysis.
fn load_manifest(archive_path: &Path) -> Result<Option<ManifestEntry>> {
    let file = File::open(archive_path)
        .with_context(|| format!("Failed to open {}", archive_path.display()))?;
    let mut archive = tar::Archive::new(file);

    let mut manifest_data: Option<Vec<u8>> = None;
    let mut root_json: Option<Vec<u8>> = None;

    for entry_result in archive.entries()? {
        let mut entry = match entry_result {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "stopping manifest scan on unreadable entry");
                break;
            }
        };
        let Ok(path) = entry.path() else { continue };
        let entry_path = path.to_string_lossy().to_string();

        if entry_path == "manifest.json" {
            let mut data = Vec::new();
            if let Err(e) = entry.read_to_end(&mut data) {
                warn!(error = %e, "could not read manifest.json");
                break;
            }
            manifest_data = Some(data);
            break;
        } else if entry_path.ends_with(".json") && !entry_path.contains('/') && root_json.is_none()
        {
            let mut data = Vec::new();
            if entry.read_to_end(&mut data).is_ok() {
                root_json = Some(data);
            }
        }
    }

    let Some(data) = manifest_data.or(root_json) else {
        return Ok(None);
    };

    match serde_json::from_slice::<Vec<ManifestEntry>>(&data) {
        Ok(entries) => Ok(entries.into_iter().next()),
        Err(e) => {
            warn!(error = %e, "malformed manifest");
            Ok(None)
        }
    }
}

/// Read the configured user and build history from the config JSON embedded
/// in the archive. Every failure is tolerated — a missing config just means
/// the run-as-user is unknown.
pub fn read_identity(archive_path: &Path) -> EmbeddedIdentity {
    let config_name = match load_manifest(archive_path) {
        Ok(Some(ManifestEntry {
            config: Some(name), ..
        })) => index::normalize(&name),
        Ok(_) => {
            debug!("archive manifest names no config, image identity unknown");
            return EmbeddedIdentity::default();
        }
        Err(e) => {
            warn!(error = %e, "could not read archive manifest");
            return EmbeddedIdentity::default();
        }
    };

    let Some(data) = read_entry(archive_path, &config_name) else {
        warn!(config = %config_name, "image config not found in archive");
        return EmbeddedIdentity::default();
    };

    match serde_json::from_slice::<ImageConfig>(&data) {
        Ok(config) => EmbeddedIdentity {
            user: config.config.and_then(|c| c.user),
            history: config
                .history
                .into_iter()
                .filter_map(|h| h.created_by)
                .collect(),
        },
        Err(e) => {
            warn!(error = %e, "malformed image config");
            EmbeddedIdentity::default()
        }
    }
}

fn read_entry(archive_path: &Path, name: &str) -> Option<Vec<u8>> {
    let file = File::open(archive_path).ok()?;
    let mut archive = tar::Archive::new(file);

    for entry_result in archive.entries().ok()? {
        let mut entry = entry_result.ok()?;
        let entry_path = index::normalize(&entry.path().ok()?.to_string_lossy());
        if entry_path == name {
            let mut data = Vec::new();
            entry.read_to_end(&mut data).ok()?;
            return Some(data);
        }
    }
    None
}
