//! Process supervision
//!
//! Launches the helper binaries as detached children. Each child is placed in
//! its own process group so it survives a restart of this orchestrator; the
//! deal is fire-and-forget, there is no restart-on-crash. Combined output goes
//! to an append-only log sink or to the void.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use regex_lite::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Settings;

/// Launch failures.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to open log sink {path}: {source}")]
    LogSink {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write tunnel config: {0}")]
    TunnelConfig(#[from] std::io::Error),
}

/// Handle to a detached child. Dropping it does not touch the process.
#[derive(Debug, Clone)]
pub struct ChildProcessHandle {
    pub name: String,
    pub pid: u32,
}

/// How the tunnel client authenticates against the relay network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelMode {
    /// Connector token issued by the relay dashboard.
    Token(String),
    /// Credentials JSON plus a generated ingress config.
    ConfigFile,
    /// No credential: ephemeral hostname, log written for discovery.
    Quick,
}

impl TunnelMode {
    /// Classify the configured credential.
    pub fn from_credential(credential: Option<&str>) -> Self {
        let Some(credential) = credential else {
            return TunnelMode::Quick;
        };
        // Connector tokens are long single-line base64-ish strings.
        let token_shape = Regex::new(r"^[A-Z0-9a-z=]{120,250}$").unwrap();
        if token_shape.is_match(credential) {
            TunnelMode::Token(credential.to_string())
        } else if credential.contains("TunnelSecret") {
            TunnelMode::ConfigFile
        } else {
            TunnelMode::Quick
        }
    }
}

/// Spawn a program detached from this process's lifetime.
///
/// The child gets its own process group, so terminating or restarting the
/// orchestrator leaves it running. stdout and stderr are appended to
/// `log_sink` when given.
pub fn launch_detached(
    program: &Path,
    args: &[String],
    log_sink: Option<&Path>,
) -> Result<ChildProcessHandle, SupervisorError> {
    let name = program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string());

    let (stdout, stderr) = match log_sink {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| SupervisorError::LogSink {
                    path: path.to_path_buf(),
                    source,
                })?;
            let err = file.try_clone().map_err(|source| SupervisorError::LogSink {
                path: path.to_path_buf(),
                source,
            })?;
            (Stdio::from(file), Stdio::from(err))
        }
        None => (Stdio::null(), Stdio::null()),
    };

    let mut command = Command::new(program);
    command.args(args).stdin(Stdio::null()).stdout(stdout).stderr(stderr);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let child = command.spawn().map_err(|source| SupervisorError::Spawn {
        name: name.clone(),
        source,
    })?;

    let handle = ChildProcessHandle {
        name,
        pid: child.id(),
    };
    info!("Started {} (pid {})", handle.name, handle.pid);
    Ok(handle)
}

/// Best-effort termination of a previously launched helper.
///
/// Children are detached, so the handle's PID is the only reference we keep.
pub fn terminate(handle: &ChildProcessHandle) {
    // kill(0) signals the whole process group, ours included.
    if handle.pid == 0 {
        return;
    }
    #[cfg(unix)]
    {
        let status = Command::new("kill")
            .arg(handle.pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(s) if s.success() => debug!("Stopped {} (pid {})", handle.name, handle.pid),
            _ => warn!("Could not stop {} (pid {})", handle.name, handle.pid),
        }
    }
    #[cfg(not(unix))]
    let _ = handle;
}

/// Arguments for the tunnel client in the given mode.
pub fn tunnel_args(settings: &Settings, mode: &TunnelMode) -> Vec<String> {
    let mut args = vec![
        "tunnel".to_string(),
        "--edge-ip-version".to_string(),
        "auto".to_string(),
    ];
    match mode {
        TunnelMode::Token(token) => {
            args.extend([
                "--no-autoupdate".to_string(),
                "--protocol".to_string(),
                "http2".to_string(),
                "run".to_string(),
                "--token".to_string(),
                token.clone(),
            ]);
        }
        TunnelMode::ConfigFile => {
            args.extend([
                "--config".to_string(),
                settings.tunnel_config_path().display().to_string(),
                "run".to_string(),
            ]);
        }
        TunnelMode::Quick => {
            args.extend([
                "--no-autoupdate".to_string(),
                "--protocol".to_string(),
                "http2".to_string(),
                "--logfile".to_string(),
                settings.tunnel_log_path().display().to_string(),
                "--loglevel".to_string(),
                "info".to_string(),
                "--url".to_string(),
                format!("http://localhost:{}", settings.ingress_port),
            ]);
        }
    }
    args
}

/// Materialize `tunnel.json` and `tunnel.yml` for config-file mode.
///
/// No-op for the other modes.
pub fn write_tunnel_config(settings: &Settings, mode: &TunnelMode) -> Result<(), SupervisorError> {
    if *mode != TunnelMode::ConfigFile {
        return Ok(());
    }
    let credential = settings
        .tunnel_credential
        .as_deref()
        .unwrap_or_default();
    let hostname = settings.tunnel_hostname.as_deref().unwrap_or_default();

    std::fs::write(settings.tunnel_credentials_path(), credential)?;

    let tunnel_id = serde_json::from_str::<serde_json::Value>(credential)
        .ok()
        .and_then(|v| v.get("TunnelID").and_then(|id| id.as_str().map(String::from)))
        .unwrap_or_default();
    let ingress = format!(
        "\ntunnel: {tunnel_id}\ncredentials-file: {credentials}\nprotocol: http2\n\ningress:\n  - hostname: {hostname}\n    service: http://localhost:{port}\n    originRequest:\n      noTLSVerify: true\n  - service: http_status:404\n",
        credentials = settings.tunnel_credentials_path().display(),
        port = settings.ingress_port,
    );
    std::fs::write(settings.tunnel_config_path(), ingress)?;
    Ok(())
}

/// Launch the tunnel client in the mode implied by the configured credential.
pub fn launch_tunnel(settings: &Settings) -> Result<ChildProcessHandle, SupervisorError> {
    let mode = TunnelMode::from_credential(settings.tunnel_credential.as_deref());
    write_tunnel_config(settings, &mode)?;
    let args = tunnel_args(settings, &mode);
    launch_detached(&settings.tunnel_bin(), &args, None)
}

/// Relaunch the tunnel client in quick mode after wiping its log.
///
/// Used by the discovery restart policy when no hostname ever appeared.
pub fn relaunch_quick_tunnel(
    settings: &Settings,
    previous: &ChildProcessHandle,
) -> Result<ChildProcessHandle, SupervisorError> {
    let log = settings.tunnel_log_path();
    if let Err(e) = std::fs::remove_file(&log) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Could not remove {}: {}", log.display(), e);
        }
    }
    terminate(previous);
    let args = tunnel_args(settings, &TunnelMode::Quick);
    launch_detached(&settings.tunnel_bin(), &args, None)
}

/// Launch the proxy engine against the emitted configuration document.
pub fn launch_engine(settings: &Settings) -> Result<ChildProcessHandle, SupervisorError> {
    let args = vec![
        "-c".to_string(),
        settings.engine_config_path().display().to_string(),
    ];
    launch_detached(&settings.engine_bin(), &args, None)
}

/// Launch the monitoring agent when its endpoint and token are configured.
pub fn launch_monitor(settings: &Settings) -> Result<Option<ChildProcessHandle>, SupervisorError> {
    let (Some(host), Some(token)) = (&settings.monitor_host, &settings.monitor_token) else {
        debug!("Monitoring endpoint not configured, skipping agent");
        return Ok(None);
    };
    let args = vec![
        "-e".to_string(),
        host.clone(),
        "-t".to_string(),
        token.clone(),
        "--disable-command-execute".to_string(),
    ];
    launch_detached(&settings.agent_bin(), &args, None).map(Some)
}
