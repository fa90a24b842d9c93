//! Outbound reporting
//!
//! Best-effort calls to external collaborators: the node aggregator and the
//! Telegram notification channel. Every failure here is swallowed after a
//! log line; nothing in this module may affect pipeline state.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use regex_lite::Regex;
use reqwest::header::CONTENT_TYPE;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::Settings;

const REPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// URI schemes recognized as node lines in decoded subscription content.
const NODE_SCHEMES: [&str; 5] = [
    "vless://",
    "vmess://",
    "trojan://",
    "hysteria2://",
    "tuic://",
];

fn client() -> Option<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REPORT_TIMEOUT)
        .build()
        .ok()
}

fn node_lines(text: &str) -> Vec<String> {
    text.lines()
        .filter(|line| NODE_SCHEMES.iter().any(|scheme| line.contains(scheme)))
        .map(str::to_string)
        .collect()
}

/// Ask the aggregator to drop the nodes from the previous run.
///
/// Only meaningful when an upload URL is configured and an old subscription
/// artifact survives on disk.
pub async fn deregister_nodes(settings: &Settings) {
    let Some(upload_url) = &settings.upload_url else {
        return;
    };
    let Ok(encoded) = std::fs::read_to_string(settings.subscription_path()) else {
        return;
    };
    let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
        debug!("Previous subscription artifact is not decodable, skipping");
        return;
    };
    let nodes = node_lines(&String::from_utf8_lossy(&decoded));
    if nodes.is_empty() {
        return;
    }

    let Some(client) = client() else { return };
    let body = json!({ "nodes": nodes }).to_string();
    match client
        .post(format!("{upload_url}/api/delete-nodes"))
        .header(CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await
    {
        Ok(_) => debug!("Requested removal of previous nodes"),
        Err(e) => debug!("Node removal request failed: {}", e),
    }
}

/// Register this node with the aggregator.
///
/// With a project URL the subscription URL itself is registered; otherwise
/// the raw node URIs from the link list are sent.
pub async fn upload_subscription(settings: &Settings) {
    let Some(upload_url) = &settings.upload_url else {
        debug!("No upload URL configured, skipping registration");
        return;
    };
    let Some(client) = client() else { return };

    if let Some(project_url) = &settings.project_url {
        let subscription_url = format!("{project_url}/{}", settings.sub_path);
        let body = json!({ "subscription": [subscription_url] }).to_string();
        match client
            .post(format!("{upload_url}/api/add-subscriptions"))
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                info!("Subscription registered with aggregator")
            }
            Ok(response) => debug!("Subscription registration got {}", response.status()),
            Err(e) => debug!("Subscription registration failed: {}", e),
        }
        return;
    }

    let Ok(list) = std::fs::read_to_string(settings.link_list_path()) else {
        return;
    };
    let nodes = node_lines(&list);
    if nodes.is_empty() {
        return;
    }
    let body = json!({ "nodes": nodes }).to_string();
    match client
        .post(format!("{upload_url}/api/add-nodes"))
        .header(CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => {
            info!("Nodes registered with aggregator")
        }
        Ok(response) => debug!("Node registration got {}", response.status()),
        Err(e) => debug!("Node registration failed: {}", e),
    }
}

/// Characters MarkdownV2 requires to be backslash-escaped.
fn escape_markdown(text: &str) -> String {
    let special = Regex::new(r"([_*\[\]()~>#+=|{}.!\-])").unwrap();
    special.replace_all(text, r"\$1").into_owned()
}

/// Push the subscription content to the configured Telegram chat.
pub async fn send_telegram(settings: &Settings) {
    let (Some(bot_token), Some(chat_id)) = (&settings.bot_token, &settings.chat_id) else {
        debug!("Telegram credentials not configured, skipping notification");
        return;
    };
    let Ok(message) = std::fs::read_to_string(settings.subscription_path()) else {
        warn!("Subscription artifact missing, nothing to notify");
        return;
    };
    let Some(client) = client() else { return };

    let escaped_name = escape_markdown(&settings.endpoints.display_name);
    let url = format!("https://api.telegram.org/bot{bot_token}/sendMessage");
    let text = format!("**{escaped_name} node update**\n{message}");

    let result = client
        .post(&url)
        .query(&[
            ("chat_id", chat_id.as_str()),
            ("text", text.as_str()),
            ("parse_mode", "MarkdownV2"),
        ])
        .send()
        .await;
    match result {
        Ok(response) if response.status().is_success() => info!("Telegram notification sent"),
        Ok(response) => warn!("Telegram notification got {}", response.status()),
        Err(e) => warn!("Telegram notification failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_lines_filters_schemes() {
        let text = "vless://a\njunk line\ntrojan://b\n\nvmess://c";
        assert_eq!(node_lines(text), vec!["vless://a", "trojan://b", "vmess://c"]);
        assert!(node_lines("no nodes here").is_empty());
    }

    #[test]
    fn test_escape_markdown() {
        assert_eq!(escape_markdown("My-Node.v2"), r"My\-Node\.v2");
        assert_eq!(escape_markdown("plain"), "plain");
        assert_eq!(escape_markdown("a_b*c"), r"a\_b\*c");
    }

    #[tokio::test]
    async fn test_deregister_without_config_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let settings = crate::config::test_settings(dir.path());
        // No upload URL, no artifact: both paths return without a request.
        deregister_nodes(&settings).await;
        upload_subscription(&settings).await;
        send_telegram(&settings).await;
    }
}
