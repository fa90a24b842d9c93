//! Housekeeping
//!
//! Best-effort disk hygiene: a startup sweep of leftovers from a previous
//! run, and a delayed one-shot deletion of the large downloaded binaries
//! once the children no longer need them on disk. The subscription artifact
//! is never touched.

use std::path::Path;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info};

use crate::config::Settings;

/// How long after startup the downloaded binaries are deleted.
const CLEANUP_DELAY: Duration = Duration::from_secs(90);

/// Leftovers a previous run may have abandoned in the working directory.
const STALE_FILES: [&str; 5] = ["web", "bot", "komari-agent", "boot.log", "list.txt"];

fn remove_quietly(path: &Path) {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!("Could not remove {}: {}", path.display(), e),
    }
}

/// Remove leftovers from a prior run so provisioning starts clean.
pub fn sweep_stale_files(settings: &Settings) {
    for name in STALE_FILES {
        remove_quietly(&settings.work_dir.join(name));
    }
}

/// Spawn the one-shot task that reclaims the binary storage later on.
///
/// The children hold their executables open; unlinking the files does not
/// stop them.
pub fn spawn_delayed_cleanup(settings: &Settings) {
    let binaries = vec![settings.engine_bin(), settings.tunnel_bin(), settings.agent_bin()];
    tokio::spawn(async move {
        sleep(CLEANUP_DELAY).await;
        for path in &binaries {
            remove_quietly(path);
        }
        info!("Reclaimed storage held by downloaded binaries");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_settings;

    #[test]
    fn test_sweep_removes_stale_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());

        for name in STALE_FILES {
            std::fs::write(dir.path().join(name), "x").unwrap();
        }
        std::fs::write(settings.subscription_path(), "keep me").unwrap();

        sweep_stale_files(&settings);

        for name in STALE_FILES {
            assert!(!dir.path().join(name).exists(), "{name} should be gone");
        }
        // The subscription artifact survives every sweep.
        assert!(settings.subscription_path().exists());
    }

    #[test]
    fn test_sweep_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        sweep_stale_files(&settings);
        sweep_stale_files(&settings);
    }
}
