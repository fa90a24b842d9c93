//! Artifact provisioning
//!
//! Ensures the helper binaries (proxy engine, tunnel client, optional
//! monitoring agent) exist in the working directory with execute permission,
//! downloading them for the detected CPU architecture when absent.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Settings;

/// Browser-like User-Agent; some release hosts reject default client strings.
const DOWNLOAD_USER_AGENT: &str = "Mozilla/5.0";

/// Per-transfer timeout.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Provisioning errors
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Network transfer failed; not retryable within the same run.
    #[error("Failed to fetch '{name}' from {url}: {source}")]
    Fetch {
        name: String,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Failed to write '{name}': {source}")]
    Write {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to set permissions on {path}: {source}")]
    Permissions {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to build download client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Supported CPU architecture classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Arm,
    Amd,
}

impl Arch {
    /// Classify the build target's architecture.
    pub fn detect() -> Self {
        Self::classify(std::env::consts::ARCH)
    }

    fn classify(arch: &str) -> Self {
        let arch = arch.to_lowercase();
        if arch.contains("arm") || arch.contains("aarch64") {
            Arch::Arm
        } else {
            Arch::Amd
        }
    }

    fn release_tag(&self) -> &'static str {
        match self {
            Arch::Arm => "arm64",
            Arch::Amd => "amd64",
        }
    }
}

/// A logical artifact and where to fetch it from.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub name: &'static str,
    pub url: String,
}

/// Build the download manifest for the given architecture.
///
/// The monitoring agent is included only when its endpoint and token are both
/// configured.
pub fn artifact_manifest(settings: &Settings, arch: Arch) -> Vec<Artifact> {
    let tag = arch.release_tag();

    let mut artifacts = Vec::new();

    if settings.monitor_enabled() {
        artifacts.push(Artifact {
            name: "komari-agent",
            url: format!(
                "https://ghfast.top/https://github.com/komari-monitor/komari-agent/releases/latest/download/komari-agent-linux-{tag}"
            ),
        });
    }

    artifacts.push(Artifact {
        name: "web",
        url: format!("https://{tag}.ssss.nyc.mn/web"),
    });
    artifacts.push(Artifact {
        name: "bot",
        url: format!("https://{tag}.ssss.nyc.mn/2go"),
    });

    artifacts
}

/// Download every missing artifact and mark it executable.
///
/// A transfer gets exactly one attempt; the first failure aborts provisioning
/// and the partial file is removed so a corrupt binary is never left behind.
pub async fn provision(settings: &Settings) -> Result<(), ProvisionError> {
    let arch = Arch::detect();
    let manifest = artifact_manifest(settings, arch);
    debug!("Provisioning {} artifact(s) for {:?}", manifest.len(), arch);

    let client = reqwest::Client::builder()
        .user_agent(DOWNLOAD_USER_AGENT)
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .map_err(ProvisionError::Client)?;

    for artifact in &manifest {
        let dest = settings.work_dir.join(artifact.name);
        if dest.exists() {
            debug!("{} already present, skipping download", artifact.name);
        } else {
            fetch_artifact(&client, artifact, &dest).await?;
            info!("Downloaded {}", artifact.name);
        }
        make_executable(&dest)?;
    }

    Ok(())
}

/// Stream one artifact to disk, removing the partial file on any failure.
async fn fetch_artifact(
    client: &reqwest::Client,
    artifact: &Artifact,
    dest: &Path,
) -> Result<(), ProvisionError> {
    let fetch_err = |source| ProvisionError::Fetch {
        name: artifact.name.to_string(),
        url: artifact.url.clone(),
        source,
    };

    let result = async {
        let mut response = client
            .get(&artifact.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| fetch_err(e))?;

        let mut file = fs::File::create(dest).map_err(|source| ProvisionError::Write {
            name: artifact.name.to_string(),
            source,
        })?;

        while let Some(chunk) = response.chunk().await.map_err(|e| fetch_err(e))? {
            file.write_all(&chunk).map_err(|source| ProvisionError::Write {
                name: artifact.name.to_string(),
                source,
            })?;
        }

        Ok(())
    }
    .await;

    if result.is_err() {
        if let Err(e) = fs::remove_file(dest) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove partial file {}: {}", dest.display(), e);
            }
        }
    }

    result
}

/// chmod 0o775 so the detached children can execute the binaries.
pub fn make_executable(path: &Path) -> Result<(), ProvisionError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o775)).map_err(|source| {
            ProvisionError::Permissions {
                path: path.to_path_buf(),
                source,
            }
        })?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_settings;

    #[test]
    fn test_arch_classification() {
        assert_eq!(Arch::classify("aarch64"), Arch::Arm);
        assert_eq!(Arch::classify("arm"), Arch::Arm);
        assert_eq!(Arch::classify("armv7"), Arch::Arm);
        assert_eq!(Arch::classify("x86_64"), Arch::Amd);
        assert_eq!(Arch::classify("riscv64"), Arch::Amd);
    }

    #[test]
    fn test_manifest_without_monitor() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let manifest = artifact_manifest(&settings, Arch::Amd);
        let names: Vec<_> = manifest.iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["web", "bot"]);
        assert!(manifest[0].url.contains("amd64"));
    }

    #[test]
    fn test_manifest_with_monitor() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(dir.path());
        settings.monitor_host = Some("https://status.example.com".to_string());
        settings.monitor_token = Some("token".to_string());
        let manifest = artifact_manifest(&settings, Arch::Arm);
        let names: Vec<_> = manifest.iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["komari-agent", "web", "bot"]);
        assert!(manifest[0].url.contains("arm64"));
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let client = reqwest::Client::new();
        let artifact = Artifact {
            name: "web",
            url: "http://127.0.0.1:1/unreachable".to_string(),
        };
        let dest = dir.path().join("web");
        let result = fetch_artifact(&client, &artifact, &dest).await;
        assert!(matches!(result, Err(ProvisionError::Fetch { .. })));
        assert!(!dest.exists());
    }
}
