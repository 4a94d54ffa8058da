//! Leadership configuration
//!
//! Values are layered with figment: built-in defaults, then an optional TOML
//! file, then `NIMBUS_LEADERSHIP_*` environment variables.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::address::CandidateIdentity;
use crate::coordination::{validate_path, ConnectOptions};
use crate::error::{LeadershipError, Result};

/// Prefix for environment variable overrides
pub const ENV_PREFIX: &str = "NIMBUS_LEADERSHIP_";

/// Election path relative to the configured root
pub const LEADERSHIP_SUBPATH: &str = "/nimbus/leadership";

/// Advertised host when the machine's name cannot be used
pub const FALLBACK_HOST: &str = "localhost";

/// This machine's host name, or [`FALLBACK_HOST`] if it is unusable as an identity
pub fn local_hostname() -> String {
    match gethostname::gethostname().into_string() {
        Ok(name) if CandidateIdentity::new(name.as_str(), 0).is_ok() => name,
        Ok(name) => {
            debug!("Host name {:?} cannot be advertised, using {}", name, FALLBACK_HOST);
            FALLBACK_HOST.to_string()
        }
        Err(name) => {
            debug!("Host name {:?} is not UTF-8, using {}", name, FALLBACK_HOST);
            FALLBACK_HOST.to_string()
        }
    }
}

/// Settings consumed by the election engine and membership resolver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeadershipConfig {
    /// Coordination service hosts
    pub zookeeper_servers: Vec<String>,
    /// Port shared by all coordination service hosts
    pub zookeeper_port: u16,
    /// Namespace root the election path is nested under
    pub zookeeper_root: String,
    /// Session expiry in milliseconds
    pub session_timeout_ms: u64,
    /// Initial connection timeout in milliseconds
    pub connection_timeout_ms: u64,
    /// Host this master advertises to clients; defaults to the machine's name
    pub nimbus_host: String,
    /// Port this master advertises to clients
    pub nimbus_thrift_port: u16,
    /// Upper bound on waiting for leadership; `None` waits forever
    pub acquire_timeout_ms: Option<u64>,
}

impl Default for LeadershipConfig {
    fn default() -> Self {
        Self {
            zookeeper_servers: vec!["localhost".to_string()],
            zookeeper_port: 2181,
            zookeeper_root: "/storm".to_string(),
            session_timeout_ms: 20_000,
            connection_timeout_ms: 15_000,
            nimbus_host: local_hostname(),
            nimbus_thrift_port: 6627,
            acquire_timeout_ms: None,
        }
    }
}

impl LeadershipConfig {
    /// Figment with defaults, an optional TOML file and environment overrides
    pub fn figment(file: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(LeadershipConfig::default()));
        if let Some(file) = file {
            debug!("Layering leadership config from {}", file.display());
            figment = figment.merge(Toml::file(file));
        }
        figment.merge(Env::prefixed(ENV_PREFIX))
    }

    /// Load from defaults and environment
    pub fn load() -> Result<Self> {
        Self::extract(Self::figment(None))
    }

    /// Load from defaults, a TOML file and environment
    ///
    /// A missing file is skipped.
    pub fn load_from(file: impl AsRef<Path>) -> Result<Self> {
        Self::extract(Self::figment(Some(file.as_ref())))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the election cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.zookeeper_servers.is_empty() {
            return Err(LeadershipError::config("zookeeper_servers is empty"));
        }
        if self.zookeeper_servers.iter().any(|s| s.trim().is_empty()) {
            return Err(LeadershipError::config("zookeeper_servers has a blank entry"));
        }
        validate_path(&self.election_path())
            .map_err(|e| LeadershipError::config(format!("invalid zookeeper_root: {}", e)))?;
        self.identity()
            .map_err(|e| LeadershipError::config(format!("invalid nimbus address: {}", e)))?;
        Ok(())
    }

    /// `<root>/nimbus/leadership`
    pub fn election_path(&self) -> String {
        let root = self.zookeeper_root.trim_end_matches('/');
        if root.is_empty() {
            LEADERSHIP_SUBPATH.to_string()
        } else if root.starts_with('/') {
            format!("{}{}", root, LEADERSHIP_SUBPATH)
        } else {
            format!("/{}{}", root, LEADERSHIP_SUBPATH)
        }
    }

    /// This master's advertised identity
    pub fn identity(&self) -> Result<CandidateIdentity> {
        CandidateIdentity::new(self.nimbus_host.clone(), self.nimbus_thrift_port)
    }

    /// Session parameters for the coordination adapter
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            session_timeout: Duration::from_millis(self.session_timeout_ms),
            connection_timeout: Duration::from_millis(self.connection_timeout_ms),
        }
    }

    /// Default bound on waiting for leadership
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }
}
