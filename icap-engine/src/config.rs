//! Listener and server configuration.
//!
//! A server runs one listener per configured ICAP service. The configuration
//! is a JSON document:
//!
//! ```json
//! {
//!   "listeners": [
//!     { "name": "echo", "handler": "echo", "port": 1344, "keep_alive": "disable" },
//!     { "name": "preview", "handler": "preview", "port": 1345, "preview": 0 }
//!   ]
//! }
//! ```

use crate::error::{Error, IcapResult};
use crate::{DEFAULT_PORT, VERSION, icap_config_error};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// `Max-Connections` advertised when none is configured.
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;
pub const DEFAULT_OPTIONS_TTL: u32 = 300;
pub const DEFAULT_POOL_SIZE: usize = 20;
pub const DEFAULT_BACKLOG: u32 = 2000;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 900;
pub const DEFAULT_X_INCLUDE: &str = "X-Client-IP, X-Server-IP, X-Subscriber-ID, X-Authenticated-User, X-Authenticated-Groups";

/// Interprets a `keep_alive` setting.
///
/// `off`, `no`, `close` and anything starting with `disable` turn persistent
/// connections off (pooled mode); every other value turns them on.
pub fn parse_keep_alive(value: &str) -> bool {
    let v = value.trim().to_ascii_lowercase();
    !(v == "off" || v == "no" || v == "close" || v == "false" || v.starts_with("disable"))
}

fn deserialize_keep_alive<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Flag(bool),
        Text(String),
    }

    Ok(match Repr::deserialize(deserializer)? {
        Repr::Flag(flag) => flag,
        Repr::Text(text) => parse_keep_alive(&text),
    })
}

/// Configuration of one ICAP listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Service name: used in logs and in the default ISTag.
    pub name: String,
    /// Adaptation service implementation (`echo`, `preview`).
    pub handler: String,
    /// Address to bind; `*` binds every interface.
    pub bind: String,
    pub port: u16,
    /// Listen backlog in keep-alive mode. Pooled listeners use the pool size.
    pub backlog: u32,
    /// Workers of the connection pool (pooled mode only).
    pub pool_size: usize,
    /// `true`: one task per persistent connection.
    /// `false`: fixed worker pool, connection closed after each exchange.
    #[serde(deserialize_with = "deserialize_keep_alive")]
    pub keep_alive: bool,
    /// Seconds a connection may stay idle (or an exchange may take).
    pub idle_timeout_secs: u64,

    pub istag: Option<String>,
    /// `Service:` advertised by OPTIONS.
    pub service: Option<String>,
    pub service_id: Option<String>,
    pub options_ttl: u32,
    /// Overrides the advertised `Max-Connections` and the pool size.
    pub max_connections: Option<usize>,
    pub allow: String,
    pub preview: Option<u32>,
    pub transfer_preview: Option<String>,
    pub transfer_complete: Option<String>,
    pub transfer_ignore: Option<String>,
    pub x_include: String,
    /// Extra raw `Name: value` lines appended to the OPTIONS response.
    pub options_custom: Vec<String>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            name: "echo".to_string(),
            handler: "echo".to_string(),
            bind: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            backlog: DEFAULT_BACKLOG,
            pool_size: DEFAULT_POOL_SIZE,
            keep_alive: false,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            istag: None,
            service: None,
            service_id: None,
            options_ttl: DEFAULT_OPTIONS_TTL,
            max_connections: None,
            allow: "204".to_string(),
            preview: None,
            transfer_preview: Some("*".to_string()),
            transfer_complete: None,
            transfer_ignore: None,
            x_include: DEFAULT_X_INCLUDE.to_string(),
            options_custom: Vec::new(),
        }
    }
}

impl ListenerConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            handler: name.to_string(),
            ..Self::default()
        }
    }

    pub fn with_handler(mut self, handler: &str) -> Self {
        self.handler = handler.to_string();
        self
    }

    pub fn with_bind(mut self, bind: &str) -> Self {
        self.bind = bind.to_string();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_preview(mut self, preview: u32) -> Self {
        self.preview = Some(preview);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_istag(mut self, istag: &str) -> Self {
        self.istag = Some(istag.to_string());
        self
    }

    /// ISTag value, without quotes.
    pub fn istag(&self) -> String {
        self.istag
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.name, VERSION))
    }

    pub fn service_description(&self) -> String {
        self.service
            .clone()
            .unwrap_or_else(|| format!("{} ICAP service", self.name))
    }

    pub fn service_id(&self) -> &str {
        self.service_id.as_deref().unwrap_or(&self.name)
    }

    /// Workers of the pool: `max_connections` when set, `pool_size` otherwise.
    pub fn effective_pool_size(&self) -> usize {
        self.max_connections.unwrap_or(self.pool_size)
    }

    pub fn advertised_max_connections(&self) -> usize {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    /// Pooled listeners keep the kernel queue as short as the pool: waiting
    /// connections are queued by the pool itself.
    pub fn effective_backlog(&self) -> u32 {
        if self.keep_alive {
            self.backlog
        } else {
            u32::try_from(self.effective_pool_size()).unwrap_or(u32::MAX)
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// `host:port` used for binding and logs.
    pub fn address(&self) -> String {
        let host = if self.bind == "*" { "0.0.0.0" } else { &self.bind };
        if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{}", self.port)
        } else {
            format!("{host}:{}", self.port)
        }
    }

    /// Checks the settings and that `handler` names a bundled service.
    pub fn validate(&self) -> IcapResult<()> {
        self.validate_settings()?;
        if self.handler.trim().is_empty() {
            return Err(icap_config_error!("listener {}: handler must not be empty", self.name));
        }
        if !crate::services::KINDS.contains(&self.handler.trim().to_ascii_lowercase().as_str()) {
            return Err(icap_config_error!(
                "listener {}: unknown handler {:?}",
                self.name,
                self.handler
            ));
        }
        Ok(())
    }

    /// Checks everything but the handler name.
    pub fn validate_settings(&self) -> IcapResult<()> {
        if self.name.trim().is_empty() {
            return Err(Error::configuration("listener name must not be empty"));
        }
        if self.effective_pool_size() == 0 {
            return Err(icap_config_error!("listener {}: pool size must be at least 1", self.name));
        }
        if self.idle_timeout_secs == 0 {
            return Err(icap_config_error!("listener {}: idle timeout must be at least 1s", self.name));
        }
        if self.istag().contains('"') {
            return Err(icap_config_error!("listener {}: ISTag must not contain quotes", self.name));
        }
        if let Some(line) = self.options_custom.iter().find(|l| !l.contains(':')) {
            return Err(icap_config_error!(
                "listener {}: custom OPTIONS line without colon: {line}",
                self.name
            ));
        }
        Ok(())
    }
}

/// Full server configuration: one entry per listener.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listeners: Vec<ListenerConfig>,
}

impl ServerConfig {
    pub fn from_json(text: &str) -> IcapResult<Self> {
        let config: ServerConfig = serde_json::from_str(text)
            .map_err(|e| icap_config_error!("invalid configuration: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> IcapResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| icap_config_error!("cannot read {}: {e}", path.display()))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> IcapResult<()> {
        if self.listeners.is_empty() {
            return Err(Error::configuration("no listener configured"));
        }
        let mut addresses = HashSet::new();
        let mut names = HashSet::new();
        for listener in &self.listeners {
            listener.validate()?;
            if !names.insert(listener.name.as_str()) {
                return Err(icap_config_error!("listener name {} is used twice", listener.name));
            }
            if !addresses.insert(listener.address()) {
                return Err(icap_config_error!(
                    "listener {}: address {} is used twice",
                    listener.name,
                    listener.address()
                ));
            }
        }
        Ok(())
    }
}
