//! Hostname discovery
//!
//! Resolves the externally reachable hostname for this node. With a fixed
//! hostname and credential configured nothing needs to be discovered;
//! otherwise the tunnel client's log is polled until the relay's ephemeral
//! hostname shows up or the retry budget runs out. Exhaustion triggers one
//! tunnel restart and one more poll round, then gives up for good.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use regex_lite::Regex;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::supervisor::{self, ChildProcessHandle};

/// Only the newest part of the log is scanned on each poll; the client
/// re-logs its hostname on reconnect, so old segments carry no new truth.
const TAIL_READ_LIMIT: u64 = 64 * 1024;

/// Discovery failures.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Retry budget exhausted in every round; no hostname was ever seen.
    #[error("No tunnel hostname appeared within the retry budget")]
    Timeout,

    #[error("Failed to restart tunnel client: {0}")]
    Restart(#[from] supervisor::SupervisorError),
}

/// Scan text for the relay's ephemeral hostname pattern.
///
/// The log may contain the pattern several times (e.g. across a client
/// restart); the first match in document order is authoritative.
pub fn find_hostname(text: &str) -> Option<String> {
    let pattern = Regex::new(r"https?://([^ ]*trycloudflare\.com)/?").unwrap();
    pattern
        .captures(text)
        .map(|caps| caps[1].trim_end_matches('/').to_string())
}

/// Read at most the newest `TAIL_READ_LIMIT` bytes of the log sink.
fn tail_read(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    if len > TAIL_READ_LIMIT {
        file.seek(SeekFrom::Start(len - TAIL_READ_LIMIT))?;
    }
    let mut buf = Vec::with_capacity(len.min(TAIL_READ_LIMIT) as usize);
    file.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// One poll round: up to `retry_budget` scans with `poll_interval` sleeps.
async fn poll_log(settings: &Settings) -> Option<String> {
    let log = settings.tunnel_log_path();
    for attempt in 1..=settings.retry_budget {
        match tail_read(&log) {
            Ok(content) => {
                if let Some(hostname) = find_hostname(&content) {
                    return Some(hostname);
                }
                debug!("Poll {}/{}: no hostname yet", attempt, settings.retry_budget);
            }
            Err(e) => {
                // The client may not have created the log yet.
                debug!("Poll {}/{}: {}", attempt, settings.retry_budget, e);
            }
        }
        sleep(settings.poll_interval).await;
    }
    None
}

/// Resolve the node's public hostname.
///
/// Static path: a fixed hostname plus credential is accepted immediately.
/// Dynamic path: poll the log; on exhaustion restart the tunnel client once
/// and poll again, then return [`DiscoveryError::Timeout`].
pub async fn discover_hostname(
    settings: &Settings,
    tunnel: &ChildProcessHandle,
) -> Result<String, DiscoveryError> {
    if settings.has_fixed_tunnel() {
        let hostname = settings
            .tunnel_hostname
            .clone()
            .unwrap_or_default();
        info!("Using fixed tunnel hostname: {}", hostname);
        return Ok(hostname);
    }

    if let Some(hostname) = poll_log(settings).await {
        info!("Discovered tunnel hostname: {}", hostname);
        return Ok(hostname);
    }

    // One bounded restart round. Looping here forever would hide a tunnel
    // that can never come up.
    warn!("Hostname not found, restarting tunnel client for one more round");
    let restarted = supervisor::relaunch_quick_tunnel(settings, tunnel)?;
    debug!("Tunnel client restarted (pid {})", restarted.pid);

    match poll_log(settings).await {
        Some(hostname) => {
            info!("Discovered tunnel hostname after restart: {}", hostname);
            Ok(hostname)
        }
        None => Err(DiscoveryError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_settings;
    use std::io::Write;
    use std::time::Instant;

    #[test]
    fn test_first_match_wins() {
        let log = "INF https://first-one.trycloudflare.com registered\n\
                   INF reconnect\n\
                   INF https://second-one.trycloudflare.com registered\n";
        assert_eq!(
            find_hostname(log).as_deref(),
            Some("first-one.trycloudflare.com")
        );
    }

    #[test]
    fn test_no_match() {
        assert_eq!(find_hostname("nothing to see here"), None);
        assert_eq!(find_hostname("https://example.com/"), None);
    }

    #[test]
    fn test_trailing_slash_stripped() {
        let log = "visit https://abc-def.trycloudflare.com/ now";
        assert_eq!(find_hostname(log).as_deref(), Some("abc-def.trycloudflare.com"));
    }

    #[test]
    fn test_tail_read_finds_hostname_in_large_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boot.log");
        let mut file = std::fs::File::create(&path).unwrap();
        // Push the hostname past the tail window start.
        for _ in 0..20_000 {
            writeln!(file, "INF noise noise noise noise noise noise").unwrap();
        }
        writeln!(file, "INF https://tail-host.trycloudflare.com ready").unwrap();

        let content = tail_read(&path).unwrap();
        assert!(content.len() as u64 <= TAIL_READ_LIMIT);
        assert_eq!(
            find_hostname(&content).as_deref(),
            Some("tail-host.trycloudflare.com")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_round_is_time_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        // No log file ever appears.
        let start = Instant::now();
        let result = poll_log(&settings).await;
        assert!(result.is_none());
        // Paused clock: elapsed real time stays tiny even across the sleeps.
        assert!(start.elapsed().as_secs() < 1);
    }

    #[tokio::test]
    async fn test_poll_picks_up_hostname() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        std::fs::write(
            settings.tunnel_log_path(),
            "INF https://live-host.trycloudflare.com up\n",
        )
        .unwrap();
        assert_eq!(
            poll_log(&settings).await.as_deref(),
            Some("live-host.trycloudflare.com")
        );
    }

    #[tokio::test]
    async fn test_static_path_skips_polling() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(dir.path());
        settings.tunnel_hostname = Some("node.example.com".to_string());
        settings.tunnel_credential = Some("x".repeat(150));
        let tunnel = ChildProcessHandle {
            name: "bot".to_string(),
            pid: 0,
        };
        let hostname = discover_hostname(&settings, &tunnel).await.unwrap();
        assert_eq!(hostname, "node.example.com");
    }
}
