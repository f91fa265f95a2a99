//! Configuration.
//!
//! ```text
//! gantry.toml
//!     → ServerConfig::load   (serde + toml)
//!     → initialize           (defaults: 30 s timeouts, built-in CSRF policies)
//!     → settings()           (DEFAULT policy must exist)
//!     → Arc<Settings>        (immutable, shared by every chain)
//! ```
//!
//! ```toml
//! [http]
//! service_name = "orders"
//! connection_timeout_secs = 10
//! shutdown_timeout_secs = 15
//!
//! [http.logger]
//! skip_paths = ["/healthz"]
//!
//! [http.csrf.session_types.DEFAULT]
//! cookie_key = "CSRF_TOKEN"
//! header_key = "X-CSRF-TOKEN"
//!
//! [[middlewares]]
//! name = "auth"
//! type = "require-auth"
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::csrf::{CsrfPolicies, CsrfPolicy};
use crate::error::ConfigError;
use crate::logger::AccessLog;

pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Root of the configuration file.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub http: HttpConfig,

    /// Router-wide middleware, resolved in order through a
    /// [`Registry`](crate::Registry).
    pub middlewares: Vec<MiddlewareConfig>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Log every request at info instead of by status class.
    pub development: bool,

    pub service_name: String,

    pub bind_address: String,

    /// Deadline of each request's connection scope. `0` means the default.
    pub connection_timeout_secs: u64,

    /// How long shutdown waits for open connections before aborting them.
    /// `0` means the default.
    pub shutdown_timeout_secs: u64,

    /// Answer preflights and add `access-control-allow-origin: *`.
    pub cors: bool,

    pub logger: AccessLogConfig,

    pub csrf: CsrfConfig,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            development: false,
            service_name: String::new(),
            bind_address: "127.0.0.1:8080".to_owned(),
            connection_timeout_secs: 0,
            shutdown_timeout_secs: 0,
            cors: true,
            logger: AccessLogConfig::default(),
            csrf: CsrfConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AccessLogConfig {
    pub skip_paths: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CsrfConfig {
    pub session_types: HashMap<String, CsrfPolicy>,
}

/// One configured middleware instance.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MiddlewareConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default = "empty_table")]
    pub config: toml::Value,
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::Table::new())
}

impl ServerConfig {
    /// Reads, parses and initialises a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(content)?;
        config.initialize();
        Ok(config)
    }

    /// Fills the defaults a minimal file leaves out.
    pub fn initialize(&mut self) {
        if self.http.connection_timeout_secs == 0 {
            self.http.connection_timeout_secs = DEFAULT_CONNECTION_TIMEOUT.as_secs();
        }
        if self.http.shutdown_timeout_secs == 0 {
            self.http.shutdown_timeout_secs = DEFAULT_SHUTDOWN_TIMEOUT.as_secs();
        }
        if self.http.csrf.session_types.is_empty() {
            self.http.csrf.session_types = CsrfPolicies::builtin();
        }
    }

    /// The validated runtime settings.
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        let csrf = CsrfPolicies::new(self.http.csrf.session_types.clone())?;
        Ok(Settings {
            connection_timeout: Duration::from_secs(self.http.connection_timeout_secs),
            csrf: Arc::new(csrf),
        })
    }

    /// Drain budget for [`Server`](crate::Server) shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        match self.http.shutdown_timeout_secs {
            0 => DEFAULT_SHUTDOWN_TIMEOUT,
            secs => Duration::from_secs(secs),
        }
    }

    pub fn access_log(&self) -> AccessLog {
        AccessLog::new(self.http.service_name.clone())
            .skip_paths(self.http.logger.skip_paths.iter().cloned())
            .development(self.http.development)
    }
}

/// Process-lifetime settings every chain is compiled against.
#[derive(Clone, Debug)]
pub struct Settings {
    pub(crate) connection_timeout: Duration,
    pub(crate) csrf: Arc<CsrfPolicies>,
}

impl Settings {
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_csrf_policies(mut self, policies: CsrfPolicies) -> Self {
        self.csrf = Arc::new(policies);
        self
    }

    pub fn connection_timeout(&self) -> Duration { self.connection_timeout }
    pub fn csrf_policies(&self) -> &CsrfPolicies { &self.csrf }
}

impl Default for Settings {
    fn default() -> Self {
        Self { connection_timeout: DEFAULT_CONNECTION_TIMEOUT, csrf: Arc::new(CsrfPolicies::default()) }
    }
}
