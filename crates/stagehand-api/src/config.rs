//! Environment-only process configuration.

use std::collections::HashMap;
use std::net::SocketAddr;

/// Agent log file; `/destroy` uploads its tail to the log service.
pub const DEFAULT_LOG_FILE: &str = "/tmp/stagehand/agent.log";

const DEFAULT_BIND: &str = "0.0.0.0:3000";

/// Proxy variables forwarded into step containers.
const PROXY_ENV_KEYS: [&str; 3] = [
    "HARNESS_HTTP_PROXY",
    "HARNESS_HTTPS_PROXY",
    "HARNESS_NO_PROXY",
];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub cert_file: String,
    pub key_file: String,
    pub ca_cert_file: String,
    pub client_cert_file: String,
    pub server_name: String,
    /// Plaintext HTTP; development only.
    pub insecure: bool,
    pub debug: bool,
    pub trace: bool,
    pub log_file: String,
    pub proxy_envs: HashMap<String, String>,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind = std::env::var("HTTPS_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
        let bind: SocketAddr = bind
            .parse()
            .map_err(|e| anyhow::anyhow!("HTTPS_BIND {bind:?}: {e}"))?;

        let mut proxy_envs = HashMap::new();
        for key in PROXY_ENV_KEYS {
            if let Ok(value) = std::env::var(key) {
                if !value.is_empty() {
                    proxy_envs.insert(key.to_string(), value);
                }
            }
        }

        Ok(Self {
            bind,
            cert_file: std::env::var("SERVER_CERT_FILE").unwrap_or_default(),
            key_file: std::env::var("SERVER_KEY_FILE").unwrap_or_default(),
            ca_cert_file: std::env::var("CA_CERT_FILE").unwrap_or_default(),
            client_cert_file: std::env::var("CLIENT_CERT_FILE").unwrap_or_default(),
            server_name: std::env::var("SERVER_NAME").unwrap_or_default(),
            insecure: env_flag("SERVER_INSECURE"),
            debug: env_flag("DEBUG"),
            trace: env_flag("TRACE"),
            log_file: std::env::var("STAGEHAND_LOG_FILE")
                .unwrap_or_else(|_| DEFAULT_LOG_FILE.to_string()),
            proxy_envs,
        })
    }

    /// The default tracing filter directive for this configuration.
    pub fn log_filter(&self) -> &'static str {
        if self.trace {
            "trace"
        } else if self.debug {
            "debug"
        } else {
            "info"
        }
    }

    pub fn tls_configured(&self) -> bool {
        !self.cert_file.is_empty() && !self.key_file.is_empty()
    }
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}
