//! Link synthesis
//!
//! Builds the three protocol URIs from the node identity, the static endpoint
//! set and the discovered hostname, then derives the subscription artifact:
//! the URIs separated by blank lines, whole-document base64-encoded. Both
//! output files are replaced atomically so the publication server never sees
//! a torn write.

use std::fs;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{EndpointSet, Settings};
use crate::engine::{TROJAN_WS_PATH, VLESS_WS_PATH, VMESS_WS_PATH};

/// Early-data suffix the websocket paths advertise to clients.
const WS_PATH_SUFFIX: &str = "?ed=2560";

/// Publish failures; the previous artifact stays in place when these occur.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Failed to write {name}: {source}")]
    Write {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// The three synthesized URIs, in subscription order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSet {
    pub vless: String,
    pub vmess: String,
    pub trojan: String,
}

impl LinkSet {
    /// The human-readable list document: URIs separated by blank lines.
    pub fn list_document(&self) -> String {
        format!("{}\n\n{}\n\n{}\n", self.vless, self.vmess, self.trojan)
    }

    /// The encoded subscription blob.
    pub fn subscription_blob(&self) -> String {
        STANDARD.encode(self.list_document())
    }
}

fn percent_encode_path(path: &str) -> String {
    path.replace('/', "%2F").replace('?', "%3F").replace('=', "%3D")
}

/// Deterministically build the link set.
///
/// `label` is the enrichment suffix; callers pass
/// [`crate::enrich::UNKNOWN_OPERATOR`] when the lookup failed.
pub fn synthesize(
    identity: &Uuid,
    endpoints: &EndpointSet,
    hostname: &str,
    label: &str,
) -> LinkSet {
    let EndpointSet {
        front_host,
        front_port,
        display_name,
    } = endpoints;
    let fragment = format!("{display_name}-{label}");

    let vless = format!(
        "vless://{identity}@{front_host}:{front_port}?encryption=none&security=tls&sni={hostname}&fp=chrome&type=ws&host={hostname}&path={path}#{fragment}",
        path = percent_encode_path(&format!("{VLESS_WS_PATH}{WS_PATH_SUFFIX}")),
    );

    let vmess_payload = json!({
        "v": "2",
        "ps": fragment,
        "add": front_host,
        "port": front_port.to_string(),
        "id": identity.to_string(),
        "aid": "0",
        "scy": "none",
        "net": "ws",
        "type": "none",
        "host": hostname,
        "path": format!("{VMESS_WS_PATH}{WS_PATH_SUFFIX}"),
        "tls": "tls",
        "sni": hostname,
        "alpn": "",
        "fp": "chrome"
    });
    let vmess = format!("vmess://{}", STANDARD.encode(vmess_payload.to_string()));

    let trojan = format!(
        "trojan://{identity}@{front_host}:{front_port}?security=tls&sni={hostname}&fp=chrome&type=ws&host={hostname}&path={path}#{fragment}",
        path = percent_encode_path(&format!("{TROJAN_WS_PATH}{WS_PATH_SUFFIX}")),
    );

    LinkSet { vless, vmess, trojan }
}

/// Atomically replace `dest` with `content` (write sibling temp, rename).
fn replace_file(dest: &Path, content: &str, name: &'static str) -> Result<(), PublishError> {
    let tmp = dest.with_extension("tmp");
    let write = |source| PublishError::Write { name, source };
    fs::write(&tmp, content).map_err(write)?;
    fs::rename(&tmp, dest).map_err(write)?;
    Ok(())
}

/// Write `list.txt` and `sub.txt` for the given link set.
pub fn publish(settings: &Settings, links: &LinkSet) -> Result<(), PublishError> {
    replace_file(&settings.link_list_path(), &links.list_document(), "list.txt")?;
    replace_file(
        &settings.subscription_path(),
        &links.subscription_blob(),
        "sub.txt",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_settings;
    use crate::enrich::UNKNOWN_OPERATOR;

    fn example_inputs() -> (Uuid, EndpointSet) {
        let identity = "b8250c99-e0ad-442e-a8e6-e1763ba0b1ad".parse().unwrap();
        let endpoints = EndpointSet {
            front_host: "1.2.3.4".to_string(),
            front_port: 443,
            display_name: "Test".to_string(),
        };
        (identity, endpoints)
    }

    #[test]
    fn test_example_vector() {
        let (identity, endpoints) = example_inputs();
        let links = synthesize(&identity, &endpoints, "tunnel.example.com", UNKNOWN_OPERATOR);

        assert!(links
            .vless
            .contains("b8250c99-e0ad-442e-a8e6-e1763ba0b1ad@1.2.3.4:443"));
        assert!(links.vless.contains("host=tunnel.example.com"));
        assert!(links.vless.ends_with("#Test-Unknown"));
        assert!(links.trojan.starts_with("trojan://"));
    }

    #[test]
    fn test_synthesis_is_deterministic() {
        let (identity, endpoints) = example_inputs();
        let a = synthesize(&identity, &endpoints, "h.trycloudflare.com", "US-Org");
        let b = synthesize(&identity, &endpoints, "h.trycloudflare.com", "US-Org");
        assert_eq!(a, b);
        assert_eq!(a.subscription_blob(), b.subscription_blob());
    }

    #[test]
    fn test_blob_decodes_to_list_document() {
        let (identity, endpoints) = example_inputs();
        let links = synthesize(&identity, &endpoints, "tunnel.example.com", UNKNOWN_OPERATOR);

        let decoded = STANDARD.decode(links.subscription_blob()).unwrap();
        let decoded = String::from_utf8(decoded).unwrap();
        assert_eq!(decoded, links.list_document());

        let uris: Vec<&str> = decoded.split("\n\n").map(str::trim).collect();
        assert_eq!(uris.len(), 3);
        assert!(uris[0].starts_with("vless://"));
        assert!(uris[1].starts_with("vmess://"));
        assert!(uris[2].starts_with("trojan://"));
    }

    #[test]
    fn test_vmess_wrapper_fields() {
        let (identity, endpoints) = example_inputs();
        let links = synthesize(&identity, &endpoints, "tunnel.example.com", "US-Org");

        let payload = links.vmess.strip_prefix("vmess://").unwrap();
        let decoded = STANDARD.decode(payload).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&decoded).unwrap();

        assert_eq!(value["add"], "1.2.3.4");
        assert_eq!(value["port"], "443");
        assert_eq!(value["host"], "tunnel.example.com");
        assert_eq!(value["ps"], "Test-US-Org");
        assert_eq!(value["path"], "/vmess-argo?ed=2560");
        assert_eq!(value["tls"], "tls");
    }

    #[test]
    fn test_ws_paths_are_percent_encoded() {
        let (identity, endpoints) = example_inputs();
        let links = synthesize(&identity, &endpoints, "h.example.com", UNKNOWN_OPERATOR);
        assert!(links.vless.contains("path=%2Fvless-argo%3Fed%3D2560"));
        assert!(links.trojan.contains("path=%2Ftrojan-argo%3Fed%3D2560"));
    }

    #[test]
    fn test_publish_idempotent_and_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let (identity, endpoints) = example_inputs();
        let links = synthesize(&identity, &endpoints, "h.example.com", UNKNOWN_OPERATOR);

        publish(&settings, &links).unwrap();
        let first = fs::read(settings.subscription_path()).unwrap();
        publish(&settings, &links).unwrap();
        let second = fs::read(settings.subscription_path()).unwrap();
        assert_eq!(first, second);

        // No temp leftovers after a successful publish.
        assert!(!settings.subscription_path().with_extension("tmp").exists());
        assert!(!settings.link_list_path().with_extension("tmp").exists());
    }
}
