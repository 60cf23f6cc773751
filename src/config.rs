//! Configuration types for Steno

use std::fmt;
use std::path::{Path, PathBuf};

use hyper::Uri;
use serde::{Deserialize, Serialize};

use crate::{Result, StenoError};

/// Operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Record mode: capture traffic in both directions
    Record,
    /// Replay mode: serve outgoing traffic and originate incoming traffic from a scenario
    Replay,
}

impl Mode {
    /// Check if mode is Record
    #[must_use]
    pub fn is_record(&self) -> bool {
        matches!(self, Mode::Record)
    }

    /// Check if mode is Replay
    #[must_use]
    pub fn is_replay(&self) -> bool {
        matches!(self, Mode::Replay)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Record => f.write_str("record"),
            Mode::Replay => f.write_str("replay"),
        }
    }
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Operating mode
    pub mode: Mode,
    /// Port for the control API
    pub control_port: u16,
    /// Scenario active at startup
    pub scenario_name: String,
    /// Directory holding one sub-directory per scenario
    pub scenario_dir: PathBuf,
    /// Where requests from the external service are delivered (the application)
    pub incoming_target_url: Option<String>,
    /// Port receiving requests from the external service
    pub incoming_port: u16,
    /// Where requests from the application are delivered (the external service)
    pub outgoing_target_url: Option<String>,
    /// Port receiving requests from the application
    pub outgoing_port: u16,
    /// Redaction applied before interactions are written
    pub redaction: RedactionConfig,
    /// Outbound hostname rewrites keyed by path prefix
    pub host_rewrites: Vec<HostRewriteRule>,
    /// Resource limits
    pub limits: LimitsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Record,
            control_port: 4000,
            scenario_name: "untitled_scenario".to_string(),
            scenario_dir: PathBuf::from("scenarios"),
            incoming_target_url: None,
            incoming_port: 3010,
            outgoing_target_url: None,
            outgoing_port: 3000,
            redaction: RedactionConfig::default(),
            host_rewrites: Vec::new(),
            limits: LimitsConfig::default(),
        }
    }
}

/// Redaction configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    /// Request headers whose values are replaced
    pub headers: Vec<String>,
    /// Literal secrets replaced wherever they appear in a request
    pub secrets: Vec<String>,
}

impl RedactionConfig {
    /// Whether any redaction is configured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.secrets.is_empty()
    }
}

/// Send requests whose path starts with `path_prefix` to `hostname` instead
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRewriteRule {
    /// Path prefix, starting with `/`
    pub path_prefix: String,
    /// Replacement outbound hostname
    pub hostname: String,
}

/// Resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum concurrent connections per listener
    pub max_connections: usize,
    /// Maximum request body size in bytes
    pub max_body_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            max_body_size: 16 * 1024 * 1024, // 16 MB
        }
    }
}

/// A normalized upstream target (scheme, host and port)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// URL scheme
    pub scheme: String,
    /// Hostname
    pub host: String,
    /// Port
    pub port: u16,
}

impl Target {
    /// Parse a target URL, defaulting to `http://` when no scheme is given
    ///
    /// # Errors
    ///
    /// Returns error if the URL is malformed, has no host, or uses a scheme
    /// other than `http` or `https`
    pub fn parse(url: &str) -> Result<Self> {
        let normalized = if url.contains("://") {
            url.to_string()
        } else {
            format!("http://{url}")
        };

        let uri = normalized
            .parse::<Uri>()
            .map_err(|e| StenoError::ConfigError(format!("Invalid target URL '{url}': {e}")))?;

        let scheme = uri.scheme_str().unwrap_or("http").to_ascii_lowercase();
        let Some(default_port) = default_port(&scheme) else {
            return Err(StenoError::ConfigError(format!(
                "Target URL protocol {scheme}: not supported in '{url}'"
            )));
        };

        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| StenoError::ConfigError(format!("Target URL has no host: '{url}'")))?
            .to_string();

        Ok(Self {
            port: uri.port_u16().unwrap_or(default_port),
            scheme,
            host,
        })
    }

    /// Value for a `Host` header addressed to this target
    #[must_use]
    pub fn authority(&self) -> String {
        authority(&self.scheme, &self.host, self.port)
    }

    /// Whether requests to this target are sent over TLS
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.scheme == "https"
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Port implied by a supported URL scheme
#[must_use]
pub fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

/// `host`, or `host:port` when the port is not the scheme's default
#[must_use]
pub fn authority(scheme: &str, host: &str, port: u16) -> String {
    if default_port(scheme) == Some(port) {
        host.to_string()
    } else {
        format!("{host}:{port}")
    }
}

impl Config {
    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StenoError::ConfigError(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| StenoError::ConfigError(format!("Failed to parse config: {e}")))
    }

    /// Target for requests originated by the external service
    ///
    /// # Errors
    ///
    /// Returns error if the URL is missing or invalid
    pub fn incoming_target(&self) -> Result<Target> {
        let url = self.incoming_target_url.as_deref().ok_or_else(|| {
            StenoError::ConfigError("An application base URL is required".to_string())
        })?;
        Target::parse(url)
    }

    /// Target for requests originated by the application
    ///
    /// # Errors
    ///
    /// Returns error if the URL is missing or invalid
    pub fn outgoing_target(&self) -> Result<Target> {
        let url = self.outgoing_target_url.as_deref().ok_or_else(|| {
            StenoError::ConfigError(
                "An outgoing target URL is required in record mode".to_string(),
            )
        })?;
        Target::parse(url)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        self.incoming_target()?;
        if self.mode.is_record() {
            self.outgoing_target()?;
        }

        validate_scenario_name(&self.scenario_name)?;

        for (i, rule) in self.host_rewrites.iter().enumerate() {
            if !rule.path_prefix.starts_with('/') {
                return Err(StenoError::ConfigError(format!(
                    "Host rewrite {i}: path_prefix must start with '/'"
                )));
            }
            if rule.hostname.is_empty() {
                return Err(StenoError::ConfigError(format!(
                    "Host rewrite {i}: hostname cannot be empty"
                )));
            }
        }

        if self.limits.max_connections == 0 {
            return Err(StenoError::ConfigError(
                "max_connections must be > 0".to_string(),
            ));
        }
        if self.limits.max_body_size == 0 {
            return Err(StenoError::ConfigError(
                "max_body_size must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Validate a scenario name
///
/// # Errors
///
/// Returns error if the name could escape the scenario directory
pub fn validate_scenario_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StenoError::InvalidScenarioName(
            "Scenario name cannot be empty".to_string(),
        ));
    }

    if name.len() > 255 {
        return Err(StenoError::InvalidScenarioName(format!(
            "Scenario name too long: {} > 255",
            name.len()
        )));
    }

    if name.contains('/') || name.contains('\\') {
        return Err(StenoError::InvalidScenarioName(
            "Scenario name cannot contain path separators".to_string(),
        ));
    }

    if name.starts_with('.') {
        return Err(StenoError::InvalidScenarioName(
            "Scenario name cannot start with dot".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(StenoError::InvalidScenarioName(
            "Scenario name cannot contain null bytes".to_string(),
        ));
    }

    if name.contains("..") {
        return Err(StenoError::InvalidScenarioName(
            "Scenario name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}
