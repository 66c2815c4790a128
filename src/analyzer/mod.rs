//! The forensic core: selective extraction of an image's layered archive and
//! multi-signal classification into rootless / shell-less / distroless.

pub mod classify;
pub mod extract;
pub mod index;
pub mod probe;
pub mod walk;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::runtime::{ImageHandle, ImageRuntime};

/// Candidate paths of interest, in probe precedence order (first match wins).
///
/// Injected at construction instead of living as module globals, so tests can
/// run with custom sets.
#[derive(Debug, Clone)]
pub struct TargetPaths {
    pub shells: Vec<String>,
    pub package_managers: Vec<String>,
    pub os_indicators: Vec<String>,
}

impl TargetPaths {
    /// All target paths, across the three subsets.
    pub fn all(&self) -> impl Iterator<Item = &str> {
        self.shells
            .iter()
            .chain(&self.package_managers)
            .chain(&self.os_indicators)
            .map(String::as_str)
    }
}

impl Default for TargetPaths {
    fn default() -> Self {
        let paths = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            shells: paths(&[
                "bin/sh",
                "bin/bash",
                "bin/dash",
                "bin/zsh",
                "bin/ash",
                "usr/bin/sh",
                "usr/bin/bash",
                "usr/bin/ash",
            ]),
            package_managers: paths(&[
                "usr/bin/apt",
                "usr/bin/apt-get",
                "usr/bin/dnf",
                "usr/bin/yum",
                "usr/bin/apk",
            ]),
            os_indicators: paths(&[
                "etc/os-release",
                "etc/passwd",
                "etc/group",
                "etc/shadow",
                "var/log",
                "var/cache",
                "etc/alpine-release",
            ]),
        }
    }
}

/// Heuristic constants, empirically tuned; kept configurable since they are
/// the most likely candidates for future adjustment.
#[derive(Debug, Clone)]
pub struct Thresholds {
    /// File counting stops once the running count exceeds this.
    pub max_file_count: u64,
    /// Below this many files, missing OS indicators imply distroless.
    pub distroless_relaxed: u64,
    /// Below this many files (and no shell/package manager), distroless.
    pub distroless_strict: u64,
    /// Share of OS-indicator paths that must be absent for the relaxed rule.
    pub os_indicator_missing_ratio: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_file_count: 250,
            distroless_relaxed: 75,
            distroless_strict: 30,
            os_indicator_missing_ratio: 0.6,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnalyzerConfig {
    pub targets: TargetPaths,
    pub thresholds: Thresholds,
}

/// Verdicts and supporting detail for one image. `None` means "unknown" —
/// the analysis failed before that question could be answered.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub image: String,
    pub rootless: Option<bool>,
    pub shellless: Option<bool>,
    pub distroless: Option<bool>,
    pub shell_path: Option<String>,
    pub package_manager_path: Option<String>,
    pub distribution: Option<String>,
    pub file_count: u64,
    pub error: Option<String>,
}

impl AnalysisReport {
    fn failed(image: &str, error: String) -> Self {
        Self {
            image: image.to_string(),
            rootless: None,
            shellless: None,
            distroless: None,
            shell_path: None,
            package_manager_path: None,
            distribution: None,
            file_count: 0,
            error: Some(error),
        }
    }
}

/// One finished analysis, owning its scratch directory.
///
/// The scratch directory (including the exported `image.tar`) lives as long
/// as this value, so a downstream consumer can read the archive before it is
/// released. Dropping `Analysis` deletes the scratch tree — exactly once, on
/// every exit path.
pub struct Analysis {
    pub report: AnalysisReport,
    /// Path to the exported image archive, the handoff artifact for an
    /// external scanner. `None` when the export itself failed.
    pub archive_path: Option<PathBuf>,
    scratch: Option<TempDir>,
}

impl Analysis {
    pub fn scratch_path(&self) -> Option<&Path> {
        self.scratch.as_ref().map(|dir| dir.path())
    }

    /// Disarm cleanup and hand the scratch directory to the caller.
    pub fn keep_scratch(mut self) -> Option<PathBuf> {
        self.scratch.take().map(|dir| dir.keep())
    }
}

/// Analyzes container images without running them.
pub struct Analyzer<R> {
    runtime: R,
    config: AnalyzerConfig,
}

impl<R: ImageRuntime> Analyzer<R> {
    pub fn new(runtime: R, config: AnalyzerConfig) -> Self {
        Self { runtime, config }
    }

    /// Analyze an image reference via the runtime client.
    ///
    /// Resolve/pull/export failures are fatal to the analysis — the verdicts
    /// come back unknown with `error` set — but never panic or propagate, and
    /// the scratch resource is still returned for cleanup.
    pub fn analyze(&self, image: &str) -> Analysis {
        let scratch = match new_scratch() {
            Ok(dir) => dir,
            Err(e) => {
                return Analysis {
                    report: AnalysisReport::failed(image, format!("{e:#}")),
                    archive_path: None,
                    scratch: None,
                };
            }
        };

        let outcome = self.resolve_and_export(image, scratch.path());
        match outcome {
            Ok((handle, archive_path)) => {
                let report = inspect_archive(
                    image,
                    &archive_path,
                    scratch.path(),
                    handle.user.as_deref(),
                    &handle.history,
                    &self.config,
                );
                Analysis {
                    report,
                    archive_path: Some(archive_path),
                    scratch: Some(scratch),
                }
            }
            Err(e) => Analysis {
                report: AnalysisReport::failed(image, format!("{e:#}")),
                archive_path: None,
                scratch: Some(scratch),
            },
        }
    }

    fn resolve_and_export(&self, image: &str, scratch: &Path) -> Result<(ImageHandle, PathBuf)> {
        let handle = match self.runtime.resolve(image)? {
            Some(handle) => handle,
            None => {
                debug!(%image, "image not present locally, pulling");
                self.runtime
                    .pull(image)
                    .with_context(|| format!("Failed to pull {image}"))?;
                self.runtime
                    .resolve(image)?
                    .with_context(|| format!("{image} still not found after pull"))?
            }
        };

        let archive_path = scratch.join("image.tar");
        self.runtime
            .export(image, &archive_path)
            .with_context(|| format!("Failed to export {image}"))?;

        Ok((handle, archive_path))
    }
}

/// Analyze a pre-exported image archive directly, no runtime involved.
///
/// The run-as-user and history come from the config JSON embedded in the
/// archive; when that is unreadable the rootless verdict stays unknown.
pub fn analyze_archive(archive: &Path, config: &AnalyzerConfig) -> Analysis {
    let label = archive.display().to_string();

    let scratch = match new_scratch() {
        Ok(dir) => dir,
        Err(e) => {
            return Analysis {
                report: AnalysisReport::failed(&label, format!("{e:#}")),
                archive_path: None,
                scratch: None,
            };
        }
    };

    let identity = walk::read_identity(archive);
    let report = inspect_archive(
        &label,
        archive,
        scratch.path(),
        identity.user.as_deref(),
        &identity.history,
        config,
    );

    Analysis {
        report,
        archive_path: Some(archive.to_path_buf()),
        scratch: Some(scratch),
    }
}

fn new_scratch() -> Result<TempDir> {
    tempfile::Builder::new()
        .prefix("husk-")
        .tempdir()
        .context("Failed to create scratch directory")
}

/// Shared tail of both entry points: walk the archive into a scratch rootfs,
/// fan out the probes, classify.
fn inspect_archive(
    image: &str,
    archive_path: &Path,
    scratch: &Path,
    user: Option<&str>,
    history: &[String],
    config: &AnalyzerConfig,
) -> AnalysisReport {
    let rootfs = scratch.join("rootfs");

    if let Err(e) = walk::assemble_rootfs(archive_path, &rootfs, scratch, &config.targets) {
        warn!(%image, error = %e, "archive walk failed");
        let mut report = AnalysisReport::failed(image, format!("{e:#}"));
        // The rootless verdict needs no filesystem — preserve it if we can.
        report.rootless = user.map(classify::rootless);
        return report;
    }

    let signals = probe::run_all(&rootfs, config);
    debug!(
        %image,
        shell = ?signals.shell_path,
        package_manager = ?signals.package_manager_path,
        files = signals.file_count,
        "probes joined"
    );

    let distroless = classify::distroless(
        image,
        history,
        &signals,
        &rootfs,
        &config.targets.os_indicators,
        &config.thresholds,
    );

    AnalysisReport {
        image: image.to_string(),
        rootless: user.map(classify::rootless),
        shellless: Some(signals.shell_path.is_none()),
        distroless: Some(distroless),
        shell_path: signals.shell_path,
        package_manager_path: signals.package_manager_path,
        distribution: signals.distribution,
        file_count: signals.file_count,
        error: None,
    }
}
