//! husk — a container image forensic analyzer.
//!
//! Given an image reference (or an already-exported archive), husk determines
//! — without running the image — whether it is rootless, shell-less, and
//! distroless. It selectively extracts only the handful of filesystem paths
//! the verdicts depend on, so cost stays bounded regardless of image size.

pub mod analyzer;
pub mod runtime;

pub use analyzer::{Analysis, AnalysisReport, Analyzer, AnalyzerConfig, TargetPaths, Thresholds};
pub use runtime::{CliRuntime, ImageHandle, ImageRuntime};
