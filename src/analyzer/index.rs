use std::collections::HashMap;
use std::io::Read;

use anyhow::Result;
use tar::EntryType;

/// What an archive member is, as far as the analyzer cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberKind {
    File { executable: bool },
    Symlink { target: String },
    Dir,
    Other,
}

/// One entry of a layer tar, keyed by its normalized path.
#[derive(Debug, Clone)]
pub struct ArchiveMember {
    pub path: String,
    pub kind: MemberKind,
}

/// Path-indexed view of a single layer's members.
///
/// Built fresh per layer and discarded after that layer is extracted. Pure
/// indexing — no I/O beyond reading the tar headers.
#[derive(Debug, Default)]
pub struct MemberIndex {
    members: HashMap<String, ArchiveMember>,
}

impl MemberIndex {
    /// Index every member of `archive` by normalized path.
    ///
    /// A read error here means the layer stream itself is corrupt or
    /// truncated; the caller skips the whole layer in that case.
    pub fn from_archive<R: Read>(archive: &mut tar::Archive<R>) -> Result<Self> {
        let mut members = HashMap::new();

        for entry_result in archive.entries()? {
            let entry = entry_result?;

            let path = match entry.path() {
                Ok(p) => normalize(&p.to_string_lossy()),
                Err(_) => continue,
            };
            if path.is_empty() {
                continue;
            }

            let header = entry.header();
            let kind = match header.entry_type() {
                EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                    let executable = header.mode().map(|m| m & 0o111 != 0).unwrap_or(false);
                    MemberKind::File { executable }
                }
                EntryType::Symlink => {
                    let target = entry
                        .link_name()
                        .ok()
                        .flatten()
                        .map(|t| t.to_string_lossy().to_string())
                        .unwrap_or_default();
                    MemberKind::Symlink { target }
                }
                EntryType::Directory => MemberKind::Dir,
                _ => MemberKind::Other,
            };

            members.insert(path.clone(), ArchiveMember { path, kind });
        }

        Ok(Self { members })
    }

    pub fn get(&self, path: &str) -> Option<&ArchiveMember> {
        self.members.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.members.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Normalize a tar member path: strip leading `./` segments and any trailing
/// slash, so `./bin/sh` and `bin/sh` index identically.
pub fn normalize(path: &str) -> String {
    let mut p = path;
    while let Some(rest) = p.strip_prefix("./") {
        p = rest;
    }
    p.trim_end_matches('/').to_string()
}

/// Resolve a symlink's target to a normalized archive path.
///
/// Absolute targets are rooted at the archive root; relative targets resolve
/// against the symlink's containing directory. `..` components are collapsed
/// lexically and never escape the root.
pub fn resolve_link_target(link_path: &str, target: &str) -> String {
    if let Some(abs) = target.strip_prefix('/') {
        return collapse(abs);
    }

    let parent = match link_path.rfind('/') {
        Some(i) => &link_path[..i],
        None => "",
    };
    if parent.is_empty() {
        collapse(target)
    } else {
        collapse(&format!("{parent}/{target}"))
    }
}

/// Collapse `.`/`..`/empty components of a slash-separated path.
fn collapse(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            c => out.push(c),
        }
    }
    out.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_dot_slash_and_trailing_slash() {
        assert_eq!(normalize("./bin/sh"), "bin/sh");
        assert_eq!(normalize("././etc/os-release"), "etc/os-release");
        assert_eq!(normalize("var/log/"), "var/log");
        assert_eq!(normalize("bin/sh"), "bin/sh");
    }

    #[test]
    fn absolute_target_roots_at_archive_root() {
        assert_eq!(resolve_link_target("bin/sh", "/bin/busybox"), "bin/busybox");
        assert_eq!(resolve_link_target("usr/bin/sh", "/bin/dash"), "bin/dash");
    }

    #[test]
    fn relative_target_resolves_against_link_dir() {
        assert_eq!(resolve_link_target("bin/sh", "busybox"), "bin/busybox");
        assert_eq!(resolve_link_target("usr/bin/sh", "../../bin/dash"), "bin/dash");
        assert_eq!(resolve_link_target("sh", "busybox"), "busybox");
    }

    #[test]
    fn collapse_never_escapes_root() {
        assert_eq!(resolve_link_target("bin/sh", "../../../etc/passwd"), "etc/passwd");
    }

    #[test]
    fn index_records_kinds_and_link_targets() {
        let mut builder = tar::Builder::new(Vec::new());

        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o755);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        builder
            .append_data(&mut header, "./bin/busybox", &b"bin!"[..])
            .unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_size(0);
        header.set_entry_type(EntryType::Symlink);
        header.set_cksum();
        builder
            .append_link(&mut header, "bin/sh", "busybox")
            .unwrap();

        let data = builder.into_inner().unwrap();
        let mut archive = tar::Archive::new(std::io::Cursor::new(data));
        let index = MemberIndex::from_archive(&mut archive).unwrap();

        assert_eq!(index.len(), 2);
        assert_eq!(
            index.get("bin/busybox").unwrap().kind,
            MemberKind::File { executable: true }
        );
        match &index.get("bin/sh").unwrap().kind {
            MemberKind::Symlink { target } => assert_eq!(target, "busybox"),
            other => panic!("expected symlink, got {other:?}"),
        }
    }
}
