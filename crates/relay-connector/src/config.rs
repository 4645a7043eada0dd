//! Connector configuration file.
//!
//! ```toml
//! [agent]
//! name = "colonel"
//!
//! [communication]
//! transport_url = "redis://127.0.0.1:6379/0"
//! read_block_timeout = 500
//!
//! [communication.streams]
//! response_stream = "responses:{agent}"
//!
//! [state]
//! dir = "/var/lib/relay"
//! ```
//!
//! `RELAY_TRANSPORT_URL`, or failing that `REDIS_URL`, overrides
//! `communication.transport_url`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use relay_delegation::CommunicationConfig;

const CONFIG_FILE_NAME: &str = "connector.toml";

/// Environment variables that override the transport url, first set wins.
const TRANSPORT_URL_VARS: [&str; 2] = ["RELAY_TRANSPORT_URL", "REDIS_URL"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    pub agent: AgentSection,
    pub communication: CommunicationConfig,
    pub state: StateSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Name this connector delegates as.
    pub name: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            name: "colonel".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSection {
    /// Root directory of the file-backed state store; one subdirectory per
    /// agent.
    pub dir: PathBuf,
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("relay"),
        }
    }
}

impl ConnectorConfig {
    /// Load `path`, or the per-user config file when no path is given and
    /// one exists, or the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = Self::load_file(path)?;
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    fn load_file(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match default_path().filter(|p| p.is_file()) {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config = Self::from_toml_str(&text)
            .with_context(|| format!("loading config file {}", path.display()))?;
        tracing::debug!(path = %path.display(), "Loaded connector config");
        Ok(config)
    }

    /// Take the transport url from the first non-empty variable in
    /// `TRANSPORT_URL_VARS`, looked up through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let found = TRANSPORT_URL_VARS
            .iter()
            .find_map(|name| var(name).filter(|v| !v.trim().is_empty()).map(|v| (*name, v)));
        if let Some((name, url)) = found {
            tracing::debug!(var = name, "Transport url taken from environment");
            self.communication.transport_url = url;
        }
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.agent.name.trim().is_empty() {
            anyhow::bail!("agent.name must not be empty");
        }
        self.communication.validate()?;
        Ok(())
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("relay").join(CONFIG_FILE_NAME))
}
