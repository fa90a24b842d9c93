//! Node configuration
//!
//! All environment-derived settings are resolved exactly once at startup into
//! an immutable [`Settings`] value that is passed explicitly to every
//! component. Nothing below `main` reads the process environment.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::warn;
use uuid::Uuid;

/// nodeup - provisions tunnel node helpers and publishes the subscription
#[derive(Parser, Debug)]
#[command(name = "nodeup")]
#[command(about = "Bootstraps a tunnel node and serves its subscription over HTTP")]
#[command(version)]
#[command(long_about = r#"
nodeup downloads the proxy engine, tunnel client and (optionally) a
monitoring agent, launches them detached, waits for the tunnel's public
hostname and publishes the derived connection links as an encoded
subscription over HTTP.

EXAMPLES:
  # Quick tunnel with an ephemeral hostname
  UUID=$(uuidgen) nodeup

  # Fixed tunnel hostname with a connector token
  ARGO_DOMAIN=node.example.com ARGO_AUTH=$TOKEN nodeup

ENVIRONMENT VARIABLES:
  UUID          Node credential embedded in every link
  NAME          Display name used in link fragments
  CFIP, CFPORT  Preferred front host and port
  ARGO_DOMAIN   Fixed tunnel hostname (skips discovery when paired with ARGO_AUTH)
  ARGO_AUTH     Tunnel credential (connector token or credentials JSON)
  SUB_PATH      Subscription route path token
  FILE_PATH     Working directory for binaries and artifacts
  SERVER_PORT   HTTP port for the publication server (falls back to PORT)
"#)]
pub struct Args {
    /// Node credential embedded in every generated link
    #[arg(long, env = "UUID")]
    pub uuid: Option<String>,

    /// Display name used as the link fragment prefix
    #[arg(long, env = "NAME", default_value = "Vls")]
    pub name: String,

    /// Preferred front host or IP
    #[arg(long, env = "CFIP", default_value = "www.visa.com.tw")]
    pub front_host: String,

    /// Port on the front host
    #[arg(long, env = "CFPORT", default_value = "443")]
    pub front_port: u16,

    /// Fixed tunnel hostname
    #[arg(long, env = "ARGO_DOMAIN")]
    pub tunnel_hostname: Option<String>,

    /// Tunnel credential (connector token or credentials JSON)
    #[arg(long, env = "ARGO_AUTH")]
    pub tunnel_credential: Option<String>,

    /// Ingress port the proxy engine listens on
    #[arg(long, env = "ARGO_PORT", default_value = "8001")]
    pub ingress_port: u16,

    /// Monitoring collector endpoint, with scheme
    #[arg(long, env = "KOMARI_HOST")]
    pub monitor_host: Option<String>,

    /// Monitoring collector token
    #[arg(long, env = "KOMARI_TOKEN")]
    pub monitor_token: Option<String>,

    /// Subscription route path token
    #[arg(long, env = "SUB_PATH", default_value = "sub")]
    pub sub_path: String,

    /// Aggregator base URL for node/subscription upload
    #[arg(long, env = "UPLOAD_URL")]
    pub upload_url: Option<String>,

    /// Public base URL of this deployment
    #[arg(long, env = "PROJECT_URL")]
    pub project_url: Option<String>,

    /// Telegram chat id for the subscription notification
    #[arg(long, env = "CHAT_ID")]
    pub chat_id: Option<String>,

    /// Telegram bot token
    #[arg(long, env = "BOT_TOKEN")]
    pub bot_token: Option<String>,

    /// Working directory for binaries, logs and artifacts
    #[arg(long, env = "FILE_PATH", default_value = "./.cache")]
    pub work_dir: PathBuf,

    /// HTTP port for the publication server
    #[arg(long, env = "SERVER_PORT")]
    pub server_port: Option<u16>,

    /// Fallback HTTP port (platform-assigned)
    #[arg(long = "http-port", env = "PORT")]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Normalize the subscription route token into a plain path segment.
///
/// axum treats `{`/`}` in route strings as parameter syntax and an empty
/// segment would collide with the root route, so those characters are
/// stripped and an empty result falls back to the default token.
pub fn sanitize_sub_path(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '{' | '}' | '/'))
        .collect();
    if cleaned.is_empty() {
        "sub".to_string()
    } else {
        cleaned
    }
}

/// Static endpoint parameters embedded in every generated URI.
#[derive(Debug, Clone)]
pub struct EndpointSet {
    /// Preferred front host or IP (the address clients dial).
    pub front_host: String,
    /// Port on the front host.
    pub front_port: u16,
    /// Advertised display name, used as the URI fragment prefix.
    pub display_name: String,
}

/// Immutable per-run configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Per-deployment credential embedded in every URI.
    pub identity: Uuid,
    /// Front host/port/name used by the link synthesizer.
    pub endpoints: EndpointSet,
    /// Fixed tunnel hostname; with `tunnel_credential` set, skips discovery.
    pub tunnel_hostname: Option<String>,
    /// Tunnel credential: either a connector token or a credentials JSON blob.
    pub tunnel_credential: Option<String>,
    /// Ingress port the proxy engine listens on and the tunnel points at.
    pub ingress_port: u16,
    /// Monitoring collector endpoint (with scheme). Absent disables the agent.
    pub monitor_host: Option<String>,
    /// Monitoring collector token.
    pub monitor_token: Option<String>,
    /// Path token for the subscription route.
    pub sub_path: String,
    /// Aggregator base URL for node/subscription upload. Absent disables.
    pub upload_url: Option<String>,
    /// Public base URL of this deployment, used for subscription upload.
    pub project_url: Option<String>,
    /// Telegram chat id for the one-shot notification.
    pub chat_id: Option<String>,
    /// Telegram bot token.
    pub bot_token: Option<String>,
    /// Working directory holding binaries, logs and artifacts.
    pub work_dir: PathBuf,
    /// Port the publication server binds.
    pub http_port: u16,
    /// Delay between discovery polls of the tunnel log.
    pub poll_interval: Duration,
    /// Number of polls before discovery gives up on a round.
    pub retry_budget: u32,
}

impl Settings {
    /// Resolve parsed arguments into the immutable settings value.
    pub fn from_args(args: Args) -> anyhow::Result<Self> {
        let identity = match args.uuid.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => raw
                .parse::<Uuid>()
                .with_context(|| format!("UUID is not a valid identity: {raw:?}"))?,
            None => {
                let generated = Uuid::new_v4();
                warn!(
                    "UUID not set, generated {} for this run; links change on restart",
                    generated
                );
                generated
            }
        };

        // SERVER_PORT wins over PORT; platforms set one or the other.
        let http_port = args.server_port.or(args.port).unwrap_or(3000);

        Ok(Self {
            identity,
            endpoints: EndpointSet {
                front_host: args.front_host,
                front_port: args.front_port,
                display_name: args.name,
            },
            tunnel_hostname: args.tunnel_hostname.filter(|s| !s.is_empty()),
            tunnel_credential: args.tunnel_credential.filter(|s| !s.is_empty()),
            ingress_port: args.ingress_port,
            monitor_host: args.monitor_host.filter(|s| !s.is_empty()),
            monitor_token: args.monitor_token.filter(|s| !s.is_empty()),
            sub_path: sanitize_sub_path(&args.sub_path),
            upload_url: args.upload_url.filter(|s| !s.is_empty()),
            project_url: args.project_url.filter(|s| !s.is_empty()),
            chat_id: args.chat_id.filter(|s| !s.is_empty()),
            bot_token: args.bot_token.filter(|s| !s.is_empty()),
            work_dir: args.work_dir,
            http_port,
            poll_interval: Duration::from_secs(2),
            retry_budget: 15,
        })
    }

    /// Create the working directory if it does not exist yet.
    pub fn prepare_workdir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.work_dir)
    }

    /// True when the fixed tunnel hostname and credential are both present.
    pub fn has_fixed_tunnel(&self) -> bool {
        self.tunnel_hostname.is_some() && self.tunnel_credential.is_some()
    }

    /// True when the monitoring agent should be provisioned and launched.
    pub fn monitor_enabled(&self) -> bool {
        self.monitor_host.is_some() && self.monitor_token.is_some()
    }

    fn path(&self, name: &str) -> PathBuf {
        self.work_dir.join(name)
    }

    /// Proxy engine binary.
    pub fn engine_bin(&self) -> PathBuf {
        self.path("web")
    }

    /// Tunnel client binary.
    pub fn tunnel_bin(&self) -> PathBuf {
        self.path("bot")
    }

    /// Monitoring agent binary.
    pub fn agent_bin(&self) -> PathBuf {
        self.path("komari-agent")
    }

    /// Proxy engine configuration document.
    pub fn engine_config_path(&self) -> PathBuf {
        self.path("config.json")
    }

    /// Tunnel client ingress configuration (config mode only).
    pub fn tunnel_config_path(&self) -> PathBuf {
        self.path("tunnel.yml")
    }

    /// Tunnel client credentials file (config mode only).
    pub fn tunnel_credentials_path(&self) -> PathBuf {
        self.path("tunnel.json")
    }

    /// Tunnel client log sink, scanned by hostname discovery.
    pub fn tunnel_log_path(&self) -> PathBuf {
        self.path("boot.log")
    }

    /// Encoded subscription artifact served over HTTP.
    pub fn subscription_path(&self) -> PathBuf {
        self.path("sub.txt")
    }

    /// Human-readable link list.
    pub fn link_list_path(&self) -> PathBuf {
        self.path("list.txt")
    }
}

/// Minimal settings for tests: everything optional disabled.
#[cfg(test)]
pub(crate) fn test_settings(work_dir: &std::path::Path) -> Settings {
    Settings {
        identity: Uuid::nil(),
        endpoints: EndpointSet {
            front_host: "1.2.3.4".to_string(),
            front_port: 443,
            display_name: "Test".to_string(),
        },
        tunnel_hostname: None,
        tunnel_credential: None,
        ingress_port: 8001,
        monitor_host: None,
        monitor_token: None,
        sub_path: "sub".to_string(),
        upload_url: None,
        project_url: None,
        chat_id: None,
        bot_token: None,
        work_dir: work_dir.to_path_buf(),
        http_port: 0,
        poll_interval: Duration::from_millis(10),
        retry_budget: 3,
    }
}
