use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use super::AnalyzerConfig;

/// Joined output of the four probes.
#[derive(Debug, Clone, Default)]
pub struct Signals {
    pub shell_path: Option<String>,
    pub package_manager_path: Option<String>,
    pub file_count: u64,
    pub distribution: Option<String>,
}

/// Run all four probes over a finished scratch root.
///
/// The probes are independent pure reads over an immutable tree, so they fan
/// out on scoped worker threads and join before classification.
pub fn run_all(rootfs: &Path, config: &AnalyzerConfig) -> Signals {
    std::thread::scope(|s| {
        let shell = s.spawn(|| find_executable(rootfs, &config.targets.shells));
        let pkg = s.spawn(|| find_executable(rootfs, &config.targets.package_managers));
        let count = s.spawn(|| count_files(rootfs, config.thresholds.max_file_count));
        let distro = s.spawn(|| distribution(rootfs));

        Signals {
            shell_path: shell.join().expect("shell probe panicked"),
            package_manager_path: pkg.join().expect("package-manager probe panicked"),
            file_count: count.join().expect("file-count probe panicked"),
            distribution: distro.join().expect("distribution probe panicked"),
        }
    })
}

/// Return the first candidate that exists as an executable regular file, or
/// as a symlink whose resolved target is an executable non-directory.
///
/// Candidate order defines precedence; the first hit wins.
pub fn find_executable(rootfs: &Path, candidates: &[String]) -> Option<String> {
    for candidate in candidates {
        let full = rootfs.join(candidate);
        let Ok(meta) = full.symlink_metadata() else {
            continue;
        };

        if meta.file_type().is_symlink() {
            let Ok(target) = fs::read_link(&full) else {
                continue;
            };
            let resolved = resolve_on_disk(rootfs, &full, &target);
            debug!(link = %candidate, target = %resolved.display(), "candidate is a symlink");
            if let Ok(target_meta) = resolved.metadata()
                && !target_meta.is_dir()
                && is_executable(&target_meta)
            {
                return Some(candidate.clone());
            }
        } else if meta.is_file() && is_executable(&meta) {
            return Some(candidate.clone());
        }
    }
    None
}

/// Root an on-disk symlink target inside the scratch root: absolute targets
/// re-root at `rootfs`, relative ones resolve against the link's directory.
/// `..` components collapse lexically and never climb past `rootfs`, so the
/// probe cannot be steered onto host files.
fn resolve_on_disk(rootfs: &Path, link: &Path, target: &Path) -> PathBuf {
    let rel = if target.is_absolute() {
        strip_root(target)
    } else {
        link.parent()
            .and_then(|dir| dir.strip_prefix(rootfs).ok())
            .unwrap_or_else(|| Path::new(""))
            .join(target)
    };
    rootfs.join(lexical_normalize(&rel))
}

fn strip_root(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::RootDir))
        .collect()
}

/// Collapse `.` and `..` without touching the filesystem. Popping stops at
/// the (relative) root.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

fn is_executable(meta: &fs::Metadata) -> bool {
    meta.permissions().mode() & 0o111 != 0
}

/// Count regular files under `rootfs`, stopping as soon as the count exceeds
/// `cap`. Past the cap only "exceeded" matters, not the exact number.
pub fn count_files(rootfs: &Path, cap: u64) -> u64 {
    let mut count = 0;
    count_into(rootfs, cap, &mut count);
    count
}

fn count_into(dir: &Path, cap: u64, count: &mut u64) -> bool {
    let Ok(entries) = fs::read_dir(dir) else {
        return true;
    };
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_file() {
            *count += 1;
            if *count > cap {
                return false;
            }
        } else if file_type.is_dir() && !count_into(&entry.path(), cap, count) {
            return false;
        }
    }
    true
}

/// Identify the Linux distribution from `etc/os-release`, with the Alpine
/// marker file as a fallback signal.
pub fn distribution(rootfs: &Path) -> Option<String> {
    match fs::read_to_string(rootfs.join("etc/os-release")) {
        Ok(content) => {
            let fields = parse_os_release(&content);
            if let Some(pretty) = fields.get("PRETTY_NAME") {
                return Some(pretty.clone());
            }
            match (fields.get("NAME"), fields.get("VERSION_ID")) {
                (Some(name), Some(version)) => Some(format!("{name} {version}")),
                (Some(name), None) => Some(name.clone()),
                _ => fields.get("ID").cloned(),
            }
        }
        Err(_) => {
            if rootfs.join("etc/alpine-release").exists() {
                Some("Alpine Linux".to_string())
            } else {
                None
            }
        }
    }
}

/// Parse `KEY=value` lines, ignoring comments and stripping quotes.
fn parse_os_release(content: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim_matches(|c| c == '"' || c == '\'');
            fields.insert(key.to_uppercase(), value.to_string());
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn write_exec(path: &Path, data: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, data).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn write_plain(path: &Path, data: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, data).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o644)).unwrap();
    }

    fn candidates(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn earlier_candidate_wins() {
        let root = tempfile::tempdir().unwrap();
        write_exec(&root.path().join("bin/sh"), b"#!");
        write_exec(&root.path().join("bin/bash"), b"#!");

        let found = find_executable(root.path(), &candidates(&["bin/sh", "bin/bash"]));
        assert_eq!(found.as_deref(), Some("bin/sh"));
    }

    #[test]
    fn non_executable_file_does_not_count() {
        let root = tempfile::tempdir().unwrap();
        write_plain(&root.path().join("bin/sh"), b"data");

        assert_eq!(find_executable(root.path(), &candidates(&["bin/sh"])), None);
    }

    #[test]
    fn symlink_to_executable_counts_via_relative_target() {
        let root = tempfile::tempdir().unwrap();
        write_exec(&root.path().join("bin/busybox"), b"#!");
        symlink("busybox", root.path().join("bin/sh")).unwrap();

        let found = find_executable(root.path(), &candidates(&["bin/sh"]));
        assert_eq!(found.as_deref(), Some("bin/sh"));
    }

    #[test]
    fn absolute_symlink_target_is_rooted_at_rootfs() {
        let root = tempfile::tempdir().unwrap();
        write_exec(&root.path().join("bin/dash"), b"#!");
        fs::create_dir_all(root.path().join("usr/bin")).unwrap();
        symlink("/bin/dash", root.path().join("usr/bin/sh")).unwrap();

        let found = find_executable(root.path(), &candidates(&["usr/bin/sh"]));
        assert_eq!(found.as_deref(), Some("usr/bin/sh"));
    }

    #[test]
    fn escaping_symlink_target_never_leaves_the_root() {
        // The host's /bin/sh exists and is executable; a link trying to climb
        // out of the scratch root must not reach it.
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("bin")).unwrap();
        symlink("../../../../../bin/sh", root.path().join("bin/bash")).unwrap();

        assert_eq!(find_executable(root.path(), &candidates(&["bin/bash"])), None);
    }

    #[test]
    fn climbing_target_clamps_at_the_root() {
        let root = tempfile::tempdir().unwrap();
        write_exec(&root.path().join("bin/dash"), b"#!");
        fs::create_dir_all(root.path().join("usr/bin")).unwrap();
        symlink("../../../../bin/dash", root.path().join("usr/bin/sh")).unwrap();

        let found = find_executable(root.path(), &candidates(&["usr/bin/sh"]));
        assert_eq!(found.as_deref(), Some("usr/bin/sh"));
    }

    #[test]
    fn dangling_symlink_does_not_count() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("bin")).unwrap();
        symlink("busybox", root.path().join("bin/sh")).unwrap();

        assert_eq!(find_executable(root.path(), &candidates(&["bin/sh"])), None);
    }

    #[test]
    fn count_stops_right_past_the_cap() {
        let root = tempfile::tempdir().unwrap();
        let flat = root.path().join("flat");
        fs::create_dir_all(&flat).unwrap();
        for i in 0..10 {
            fs::write(flat.join(format!("f{i}")), b"x").unwrap();
        }
        // A sentinel subtree that must never be reached once the cap trips.
        let deep = root.path().join("zz-deep");
        fs::create_dir_all(&deep).unwrap();
        for i in 0..10 {
            fs::write(deep.join(format!("g{i}")), b"x").unwrap();
        }

        let count = count_files(root.path(), 3);
        assert_eq!(count, 4, "counting must stop at the first exceeding file");
    }

    #[test]
    fn count_below_cap_is_exact() {
        let root = tempfile::tempdir().unwrap();
        write_plain(&root.path().join("a/one"), b"1");
        write_plain(&root.path().join("a/b/two"), b"2");
        write_plain(&root.path().join("three"), b"3");

        assert_eq!(count_files(root.path(), 250), 3);
    }

    #[test]
    fn os_release_precedence() {
        let fields = "NAME=\"Debian GNU/Linux\"\nVERSION_ID=\"12\"\nPRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\nID=debian\n";
        let root = tempfile::tempdir().unwrap();
        write_plain(&root.path().join("etc/os-release"), fields.as_bytes());
        assert_eq!(
            distribution(root.path()).as_deref(),
            Some("Debian GNU/Linux 12 (bookworm)")
        );
    }

    #[test]
    fn os_release_name_version_fallback() {
        let root = tempfile::tempdir().unwrap();
        write_plain(
            &root.path().join("etc/os-release"),
            b"# comment\nNAME='Ubuntu'\nVERSION_ID=22.04\n",
        );
        assert_eq!(distribution(root.path()).as_deref(), Some("Ubuntu 22.04"));
    }

    #[test]
    fn alpine_marker_fallback() {
        let root = tempfile::tempdir().unwrap();
        write_plain(&root.path().join("etc/alpine-release"), b"3.20.1\n");
        assert_eq!(distribution(root.path()).as_deref(), Some("Alpine Linux"));
    }

    #[test]
    fn no_signal_at_all() {
        let root = tempfile::tempdir().unwrap();
        assert_eq!(distribution(root.path()), None);
    }
}
