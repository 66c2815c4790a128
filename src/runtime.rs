use std::fmt;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::warn;

/// A locally resolved image: id plus the metadata the classifier needs.
#[derive(Debug, Clone)]
pub struct ImageHandle {
    pub id: String,
    /// Configured run-as-user (`Config.User`). Empty means unconfigured;
    /// `None` means it could not be determined at all.
    pub user: Option<String>,
    /// Build-history descriptions, best-effort — failures leave it empty.
    pub history: Vec<String>,
}

/// The registry/runtime collaborator: resolve an image locally, pull it if
/// absent, and export its layered archive. This is the analyzer's only
/// outward dependency, and the seam tests fake.
pub trait ImageRuntime {
    /// `Ok(None)` when the image is not present locally.
    fn resolve(&self, image: &str) -> Result<Option<ImageHandle>>;

    fn pull(&self, image: &str) -> Result<()>;

    /// Export the image's full layered archive to `dest`.
    fn export(&self, image: &str, dest: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Docker,
    Podman,
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeKind::Docker => write!(f, "docker"),
            RuntimeKind::Podman => write!(f, "podman"),
        }
    }
}

// ---- Runtime CLI JSON output ----

#[derive(Deserialize)]
struct InspectLine {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Config", default)]
    config: Option<InspectConfig>,
}

#[derive(Deserialize, Default)]
struct InspectConfig {
    #[serde(rename = "User", default)]
    user: String,
}

#[derive(Deserialize)]
struct HistoryLine {
    #[serde(rename = "CreatedBy", default)]
    created_by: Option<String>,
}

/// Whether an inspect failure means the image is simply not present locally,
/// as opposed to a broken runtime. Docker says "No such image", podman says
/// "image not known".
fn image_absent(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("no such") || stderr.contains("image not known") || stderr.contains("not found")
}

/// Talks to a container runtime CLI (`docker`/`podman`). Cross-platform, no
/// root needed, at the cost of a subprocess per operation.
pub struct CliRuntime {
    cmd: String,
    kind: RuntimeKind,
}

impl CliRuntime {
    pub fn new(cmd: String, kind: RuntimeKind) -> Self {
        Self { cmd, kind }
    }

    /// Probe for an available runtime binary, docker first.
    pub fn detect() -> Result<Self> {
        for (cmd, kind) in [("docker", RuntimeKind::Docker), ("podman", RuntimeKind::Podman)] {
            let available = Command::new(cmd)
                .arg("--version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map(|s| s.success())
                .unwrap_or(false);
            if available {
                return Ok(Self::new(cmd.to_string(), kind));
            }
        }
        bail!("No container runtime detected. Install Docker or Podman, or pass a tar archive.")
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "docker" => Ok(Self::new(name.to_string(), RuntimeKind::Docker)),
            "podman" => Ok(Self::new(name.to_string(), RuntimeKind::Podman)),
            other => bail!("Unsupported runtime '{other}' (expected docker or podman)"),
        }
    }

    pub fn kind(&self) -> RuntimeKind {
        self.kind
    }

    /// Best-effort `image history` — any failure just means no history.
    fn history(&self, image: &str) -> Vec<String> {
        let output = match Command::new(&self.cmd)
            .args(["image", "history", image, "--no-trunc", "--format", "{{json .}}"])
            .output()
        {
            Ok(out) if out.status.success() => out,
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                warn!(%image, error = %stderr.trim(), "could not read image history");
                return Vec::new();
            }
            Err(e) => {
                warn!(%image, error = %e, "could not run '{} image history'", self.cmd);
                return Vec::new();
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<HistoryLine>(line.trim()).ok())
            .filter_map(|entry| entry.created_by)
            .collect()
    }
}

impl ImageRuntime for CliRuntime {
    fn resolve(&self, image: &str) -> Result<Option<ImageHandle>> {
        let output = Command::new(&self.cmd)
            .args(["image", "inspect", image, "--format", "{{json .}}"])
            .output()
            .with_context(|| format!("Failed to run '{} image inspect'", self.cmd))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if image_absent(&stderr) {
                return Ok(None);
            }
            bail!(
                "'{} image inspect {}' failed: {}",
                self.cmd,
                image,
                stderr.trim()
            );
        }

        let json = String::from_utf8_lossy(&output.stdout);
        let line: InspectLine = serde_json::from_str(json.trim())
            .context("Failed to parse image inspect JSON")?;

        Ok(Some(ImageHandle {
            id: line.id,
            user: Some(line.config.unwrap_or_default().user),
            history: self.history(image),
        }))
    }

    fn pull(&self, image: &str) -> Result<()> {
        let output = Command::new(&self.cmd)
            .args(["pull", image])
            .output()
            .with_context(|| format!("Failed to run '{} pull'", self.cmd))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("Failed to pull '{}': {}", image, stderr.trim());
        }
        Ok(())
    }

    /// `docker save` piped straight into the destination file.
    fn export(&self, image: &str, dest: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.cmd);
        cmd.args(["save", image]);
        if self.kind == RuntimeKind::Podman {
            cmd.arg("--format=docker-archive");
        }

        let mut child = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to run '{} save'", self.cmd))?;

        let mut stdout = child.stdout.take().context("Failed to capture stdout")?;
        let mut file = std::fs::File::create(dest)
            .with_context(|| format!("Failed to create {}", dest.display()))?;
        std::io::copy(&mut stdout, &mut file)?;

        drop(file);
        drop(stdout);
        let status = child.wait()?;
        if !status.success() {
            let _ = std::fs::remove_file(dest);
            let mut stderr_str = String::new();
            if let Some(mut stderr) = child.stderr.take() {
                let _ = stderr.read_to_string(&mut stderr_str);
            }
            bail!("Failed to save '{}': {}", image, stderr_str.trim());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_image_stderr_is_recognized_for_both_runtimes() {
        // docker
        assert!(image_absent("Error: No such image: ghost:latest"));
        // podman
        assert!(image_absent("Error: ghost:latest: image not known"));
        assert!(image_absent("Error: ghost:latest: manifest not found"));
        // a broken runtime must stay a hard error, not a pull trigger
        assert!(!image_absent(
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock"
        ));
        assert!(!image_absent("permission denied"));
    }

    #[test]
    fn from_name_rejects_unknown_runtimes() {
        assert!(CliRuntime::from_name("docker").is_ok());
        assert!(CliRuntime::from_name("podman").is_ok());
        assert!(CliRuntime::from_name("containerd").is_err());
    }

    #[test]
    fn inspect_json_parses_user() {
        let line: InspectLine = serde_json::from_str(
            r#"{"Id":"sha256:abc","Config":{"User":"65532","Env":[]},"Extra":1}"#,
        )
        .unwrap();
        assert_eq!(line.id, "sha256:abc");
        assert_eq!(line.config.unwrap().user, "65532");
    }

    #[test]
    fn inspect_json_without_user_defaults_to_empty() {
        let line: InspectLine =
            serde_json::from_str(r#"{"Id":"sha256:abc","Config":{}}"#).unwrap();
        assert_eq!(line.config.unwrap().user, "");
    }
}
