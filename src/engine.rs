//! Proxy engine configuration
//!
//! Emits the declarative document the proxy engine consumes: one public
//! inbound on the ingress port that fans out by request path to three
//! loopback-only inbounds, one per sub-protocol. The document is a pure
//! function of the node identity and the fixed routing table, so rewriting
//! it is always safe.

use std::fs;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::Settings;

/// Loopback ports the public inbound falls back to, in routing order.
const FALLBACK_PLAIN: u16 = 3001;
const FALLBACK_VLESS_WS: u16 = 3002;
const FALLBACK_VMESS_WS: u16 = 3003;
const FALLBACK_TROJAN_WS: u16 = 3004;

/// Websocket paths the fallbacks match on. Shared with the link synthesizer.
pub const VLESS_WS_PATH: &str = "/vless-argo";
pub const VMESS_WS_PATH: &str = "/vmess-argo";
pub const TROJAN_WS_PATH: &str = "/trojan-argo";

/// Configuration write failure; fatal to the run.
#[derive(Debug, Error)]
pub enum EngineConfigError {
    #[error("Failed to serialize engine config: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to write engine config: {0}")]
    Write(#[from] std::io::Error),
}

/// The serialized document structure.
#[derive(Debug, Serialize)]
pub struct EngineConfig {
    pub log: Value,
    pub inbounds: Vec<Value>,
    pub outbounds: Vec<Value>,
}

/// Build the engine document for the given settings.
pub fn engine_config(settings: &Settings) -> EngineConfig {
    let id = settings.identity.to_string();
    let sniffing = json!({
        "enabled": true,
        "destOverride": ["http", "tls", "quic"],
        "metadataOnly": false
    });

    EngineConfig {
        log: json!({ "access": "/dev/null", "error": "/dev/null", "loglevel": "none" }),
        inbounds: vec![
            json!({
                "port": settings.ingress_port,
                "protocol": "vless",
                "settings": {
                    "clients": [{ "id": id, "flow": "xtls-rprx-vision" }],
                    "decryption": "none",
                    "fallbacks": [
                        { "dest": FALLBACK_PLAIN },
                        { "path": VLESS_WS_PATH, "dest": FALLBACK_VLESS_WS },
                        { "path": VMESS_WS_PATH, "dest": FALLBACK_VMESS_WS },
                        { "path": TROJAN_WS_PATH, "dest": FALLBACK_TROJAN_WS }
                    ]
                },
                "streamSettings": { "network": "tcp" }
            }),
            json!({
                "port": FALLBACK_PLAIN,
                "listen": "127.0.0.1",
                "protocol": "vless",
                "settings": { "clients": [{ "id": id }], "decryption": "none" },
                "streamSettings": { "network": "ws", "security": "none" }
            }),
            json!({
                "port": FALLBACK_VLESS_WS,
                "listen": "127.0.0.1",
                "protocol": "vless",
                "settings": { "clients": [{ "id": id, "level": 0 }], "decryption": "none" },
                "streamSettings": {
                    "network": "ws",
                    "security": "none",
                    "wsSettings": { "path": VLESS_WS_PATH }
                },
                "sniffing": sniffing.clone()
            }),
            json!({
                "port": FALLBACK_VMESS_WS,
                "listen": "127.0.0.1",
                "protocol": "vmess",
                "settings": { "clients": [{ "id": id, "alterId": 0 }] },
                "streamSettings": {
                    "network": "ws",
                    "wsSettings": { "path": VMESS_WS_PATH }
                },
                "sniffing": sniffing.clone()
            }),
            json!({
                "port": FALLBACK_TROJAN_WS,
                "listen": "127.0.0.1",
                "protocol": "trojan",
                "settings": { "clients": [{ "password": id }] },
                "streamSettings": {
                    "network": "ws",
                    "security": "none",
                    "wsSettings": { "path": TROJAN_WS_PATH }
                },
                "sniffing": sniffing
            }),
        ],
        outbounds: vec![
            json!({ "protocol": "freedom", "tag": "direct" }),
            json!({ "protocol": "blackhole", "tag": "block" }),
        ],
    }
}

/// Serialize the engine document and overwrite `config.json`.
pub fn write_engine_config(settings: &Settings) -> Result<(), EngineConfigError> {
    let config = engine_config(settings);
    let body = serde_json::to_string_pretty(&config)?;
    fs::write(settings.engine_config_path(), body)?;
    Ok(())
}
