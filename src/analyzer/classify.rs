use std::path::Path;

use tracing::debug;

use super::{Thresholds, probe::Signals};

/// Rootless iff the configured run-as-user is a non-empty value other than
/// `0` / `root` (any case). Purely a function of image metadata.
pub fn rootless(user: &str) -> bool {
    if user.is_empty() {
        return false;
    }
    if user.chars().all(|c| c.is_ascii_digit()) {
        user != "0"
    } else {
        !user.eq_ignore_ascii_case("root")
    }
}

/// Ordered distroless rules; the first matching rule decides.
///
/// 1. "distroless" in the image reference.
/// 2. Distroless markers in the build history.
/// 3. A shell or package manager present → not distroless.
/// 4. Few files and most OS-indicator paths absent.
/// 5. Very few files (shell and package manager already ruled out).
pub fn distroless(
    image: &str,
    history: &[String],
    signals: &Signals,
    rootfs: &Path,
    os_indicators: &[String],
    thresholds: &Thresholds,
) -> bool {
    if image.to_lowercase().contains("distroless") {
        return true;
    }

    if history.iter().any(|entry| {
        let entry = entry.to_lowercase();
        entry.contains("distroless")
            || entry.contains("bazel build")
            || entry.contains("/distroless/")
    }) {
        return true;
    }

    if signals.shell_path.is_some() || signals.package_manager_path.is_some() {
        return false;
    }

    if signals.file_count < thresholds.distroless_relaxed {
        let missing = os_indicators
            .iter()
            .filter(|p| !rootfs.join(p.as_str()).exists())
            .count();
        debug!(
            missing,
            total = os_indicators.len(),
            "OS indicator files absent"
        );
        if missing as f64 >= os_indicators.len() as f64 * thresholds.os_indicator_missing_ratio {
            return true;
        }
    }

    signals.file_count < thresholds.distroless_strict
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::TargetPaths;

    #[test]
    fn rootless_user_table() {
        for user in ["", "0", "root", "ROOT", "Root"] {
            assert!(!rootless(user), "{user:?} should not be rootless");
        }
        for user in ["1000", "65532", "nonroot", "app", "10001"] {
            assert!(rootless(user), "{user:?} should be rootless");
        }
    }

    fn empty_signals(file_count: u64) -> Signals {
        Signals {
            file_count,
            ..Signals::default()
        }
    }

    #[test]
    fn name_rule_overrides_shell_presence() {
        let signals = Signals {
            shell_path: Some("bin/sh".into()),
            package_manager_path: Some("usr/bin/apt".into()),
            file_count: 5000,
            distribution: Some("Debian".into()),
        };
        let root = tempfile::tempdir().unwrap();
        assert!(distroless(
            "gcr.io/distroless/static:nonroot",
            &[],
            &signals,
            root.path(),
            &TargetPaths::default().os_indicators,
            &Thresholds::default(),
        ));
    }

    #[test]
    fn history_markers_classify_distroless() {
        let root = tempfile::tempdir().unwrap();
        for marker in ["bazel build ...", "FROM /distroless/base", "COPY distroless rootfs"] {
            assert!(distroless(
                "myorg/app:v1",
                &[marker.to_string()],
                &empty_signals(5000),
                root.path(),
                &TargetPaths::default().os_indicators,
                &Thresholds::default(),
            ));
        }
    }

    #[test]
    fn shell_presence_vetoes_distroless() {
        let signals = Signals {
            shell_path: Some("bin/bash".into()),
            ..empty_signals(10)
        };
        let root = tempfile::tempdir().unwrap();
        assert!(!distroless(
            "myorg/app:v1",
            &[],
            &signals,
            root.path(),
            &TargetPaths::default().os_indicators,
            &Thresholds::default(),
        ));
    }

    #[test]
    fn minimal_tree_with_missing_indicators_is_distroless() {
        let root = tempfile::tempdir().unwrap();
        // 40 files: below the relaxed threshold, above the strict one.
        for i in 0..40 {
            std::fs::write(root.path().join(format!("f{i}")), b"x").unwrap();
        }
        assert!(distroless(
            "myorg/app:v1",
            &[],
            &empty_signals(40),
            root.path(),
            &TargetPaths::default().os_indicators,
            &Thresholds::default(),
        ));
    }

    #[test]
    fn minimal_tree_with_indicators_present_needs_strict_count() {
        let root = tempfile::tempdir().unwrap();
        let targets = TargetPaths::default();
        // All OS indicator paths exist, so rule 4 cannot fire.
        for p in &targets.os_indicators {
            let full = root.path().join(p);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(&full, b"x").unwrap();
        }

        assert!(!distroless(
            "myorg/app:v1",
            &[],
            &empty_signals(40),
            root.path(),
            &targets.os_indicators,
            &Thresholds::default(),
        ));
        assert!(distroless(
            "myorg/app:v1",
            &[],
            &empty_signals(10),
            root.path(),
            &targets.os_indicators,
            &Thresholds::default(),
        ));
    }

    #[test]
    fn populated_image_is_not_distroless() {
        let root = tempfile::tempdir().unwrap();
        assert!(!distroless(
            "debian:12",
            &[],
            &empty_signals(5000),
            root.path(),
            &TargetPaths::default().os_indicators,
            &Thresholds::default(),
        ));
    }
}
