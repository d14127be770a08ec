use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::listener::AcceptOptions;

/// Server settings.
///
/// All fields have defaults, so a configuration file only needs to contain what differs:
///
/// ```
/// # use proxmox_graceful::ServerConfig;
/// let config = ServerConfig::from_json(r#"{ "address": "127.0.0.1:8007", "shutdown-timeout": 2.5 }"#)?;
/// assert_eq!(config.shutdown_timeout.as_millis(), 2500);
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to listen on. A leading `:` without host means all IPv4 interfaces.
    pub address: String,

    /// Time to wait for open connections on shutdown, in seconds.
    #[serde(with = "seconds")]
    pub shutdown_timeout: Duration,

    pub tcp_nodelay: bool,

    /// TCP keepalive idle time in seconds, `null` keeps the system default.
    pub tcp_keepalive_time: Option<u32>,

    /// Binary to execute on reload, defaults to the running executable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: ":8080".to_string(),
            shutdown_timeout: Duration::from_secs(10),
            tcp_nodelay: true,
            tcp_keepalive_time: Some(120),
            executable: None,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.tcp_nodelay = nodelay;
        self
    }

    pub fn tcp_keepalive_time(mut self, time: Option<u32>) -> Self {
        self.tcp_keepalive_time = time;
        self
    }

    pub fn executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = Some(executable.into());
        self
    }

    pub(crate) fn accept_options(&self) -> AcceptOptions {
        AcceptOptions {
            tcp_nodelay: self.tcp_nodelay,
            tcp_keepalive_time: self.tcp_keepalive_time,
        }
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|err| de::Error::custom(format!("invalid timeout {secs} - {err}")))
    }
}
