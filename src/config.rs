//! Configuration loading using Figment.
//!
//! Settings are merged in this order (later wins):
//! 1. built-in defaults ([`Settings::default`])
//! 2. an optional TOML file
//! 3. environment variables prefixed with `PERFECTEM_`, using `__` to
//!    separate sections
//!
//! ```text
//! PERFECTEM_CONNECTION__HOST=192.168.10.4
//! PERFECTEM_SCOPE__PROFILE=krios3_k3
//! PERFECTEM_SESSION__DOSE_CEILING_EPS=200
//! ```
//!
//! # Example
//!
//! ```toml
//! [connection]
//! host = "127.0.0.1"
//! port = 48888
//! timeout = "30s"
//!
//! [scope]
//! name = "Krios2"
//! profile = "krios2_falcon4"
//! camera = 2
//!
//! [session]
//! settle_delay = "2s"
//! dose_ceiling_eps = 120.0
//! readiness_poll = "60s"
//! output_root = "runs"
//!
//! [user_settings]
//! DriftProtection = 1.0
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, EmError};
use crate::profiles;

/// Top-level settings for one diagnostic run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Automation server address
    #[serde(default)]
    pub connection: ConnectionSettings,
    /// Instrument profile and camera
    #[serde(default)]
    pub scope: ScopeSettings,
    /// Feedback loop timing and output location
    #[serde(default)]
    pub session: SessionSettings,
    /// Console and file logging
    #[serde(default)]
    pub log: LogSettings,
    /// Remote user settings pushed to the automation server at bootstrap.
    #[serde(default = "default_user_settings")]
    pub user_settings: BTreeMap<String, f64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            scope: ScopeSettings::default(),
            session: SessionSettings::default(),
            log: LogSettings::default(),
            user_settings: default_user_settings(),
        }
    }
}

/// Where the automation server listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Host name or IP of the microscope PC
    pub host: String,
    /// Automation server port
    pub port: u16,
    /// Round-trip timeout for a single remote call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl ConnectionSettings {
    /// `host:port`, as passed to the socket client.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 48888,
            // Autofocus and drift-wait calls block the server for a long time.
            timeout: Duration::from_secs(600),
        }
    }
}

/// Instrument identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeSettings {
    /// Name used for the run directory, e.g. "Krios2"
    pub name: String,
    /// Key into the static parameter tables, see [`crate::profiles`]
    pub profile: String,
    /// 1-based camera number; prompts the operator when absent
    #[serde(default)]
    pub camera: Option<usize>,
}

impl Default for ScopeSettings {
    fn default() -> Self {
        Self {
            name: "Krios2".to_string(),
            profile: "krios2_falcon4".to_string(),
            camera: None,
        }
    }
}

/// Tuning of the session primitives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Pause after any beam change before the next call
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Dose-rate ceiling in electrons per pixel per second
    pub dose_ceiling_eps: f64,
    /// Poll interval of the pre-acquisition readiness gate
    #[serde(with = "humantime_serde")]
    pub readiness_poll: Duration,
    /// Upper bound on autofocus iterations when focusing to a target
    pub autofocus_max_iterations: u32,
    /// Parent directory of the per-run output directories
    pub output_root: PathBuf,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(2),
            dose_ceiling_eps: 120.0,
            readiness_poll: Duration::from_secs(60),
            autofocus_max_iterations: 20,
            output_root: PathBuf::from("."),
        }
    }
}

/// Log verbosity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    /// trace, debug, info, warn or error
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn default_user_settings() -> BTreeMap<String, f64> {
    // Astigmatism and coma correction use the same conditions as Record.
    [
        ("DriftProtection", 1.0),
        ("CtfBinning", 0.0),
        ("CtfDoFullArray", 0.0),
        ("CtfDriftSettling", 0.0),
        ("CtfExposure", 0.0),
        ("MinCtfBasedDefocus", -0.4),
        ("ComaIterationThresh", 0.02),
        ("CtfUseFullField", 0.0),
        ("UsersComaTilt", 5.0),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_string(), value))
    .collect()
}

impl Settings {
    /// Load settings from defaults, an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let settings: Self = figment
            .merge(Env::prefixed("PERFECTEM_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Semantic checks that parsing alone cannot catch.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log.level.as_str()) {
            return Err(EmError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.log.level,
                valid_levels.join(", ")
            )));
        }

        if self.connection.port == 0 {
            return Err(EmError::Configuration(
                "connection.port must be non-zero".to_string(),
            ));
        }

        if self.scope.name.trim().is_empty() {
            return Err(EmError::Configuration(
                "scope.name cannot be empty".to_string(),
            ));
        }

        if profiles::profile(&self.scope.profile).is_none() {
            return Err(EmError::Configuration(format!(
                "Unknown scope profile '{}'. Known profiles: {}",
                self.scope.profile,
                profiles::profile_names().join(", ")
            )));
        }

        if self.scope.camera == Some(0) {
            return Err(EmError::Configuration(
                "scope.camera is 1-based; 0 is not a camera".to_string(),
            ));
        }

        if !(self.session.dose_ceiling_eps > 0.0) {
            return Err(EmError::Configuration(format!(
                "session.dose_ceiling_eps must be positive, got {}",
                self.session.dose_ceiling_eps
            )));
        }

        if self.session.autofocus_max_iterations == 0 {
            return Err(EmError::Configuration(
                "session.autofocus_max_iterations must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
