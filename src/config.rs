//! Configuration loading and filesystem paths.
//!
//! One YAML document, read once at start-up and treated as immutable:
//! driver selection, the server-wide user ACT, and one [`HandlerConfig`]
//! per enabled module. Configuration lives under `$XDG_CONFIG_HOME`
//! (fallback `$HOME/.config`), persisted state under `$XDG_DATA_HOME`
//! (fallback `$HOME/.local/share`), both in a `straylight` subdirectory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::act::{is_valid_user, Act, Capability};
use crate::driver::dbus::DBusBus;

/// Project directory name under the XDG roots.
const PROJECT_DIR: &str = "straylight";

/// Which transport to drive and how to reach it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DriverConfig {
    /// Console driver on stdin/stdout.
    Console {
        /// Number the console impersonates.
        number: String,
    },
    /// signal-cli over D-Bus.
    Dbus {
        /// Session or system bus.
        bus: DBusBus,
    },
    /// signal-cli daemon over a JSON-RPC Unix socket.
    Jsonrpc {
        /// Socket path.
        socket: PathBuf,
        /// The account number behind the socket.
        number: String,
    },
}

/// Per-module dispatch record: prefixes, help text, access control.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandlerConfig {
    /// Command prefixes routed to this module. Whitespace-free; globally
    /// unique across modules.
    pub prefixes: Vec<String>,
    /// One-line help text shown in overviews.
    #[serde(default)]
    pub help: String,
    /// Module-level access-control tree.
    #[serde(default)]
    pub act: Act,
}

/// The whole configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Transport selection.
    pub driver: DriverConfig,
    /// Server-wide user ACT, evaluated before any module sees a message.
    #[serde(default)]
    pub users: Act,
    /// Enabled modules by name.
    #[serde(default)]
    pub modules: HashMap<String, HandlerConfig>,
}

impl Default for Config {
    /// Zero-config default: console driver, everything allowed, both
    /// built-in modules enabled. Useful for local experimentation only.
    fn default() -> Self {
        let open = Act {
            default: Capability::Allow,
            children: HashMap::new(),
        };
        let mut modules = HashMap::new();
        modules.insert(
            "echo".to_owned(),
            HandlerConfig {
                prefixes: vec!["echo".to_owned()],
                help: "echo arguments back".to_owned(),
                act: open.clone(),
            },
        );
        modules.insert(
            "periodic".to_owned(),
            HandlerConfig {
                prefixes: vec!["periodic".to_owned()],
                help: "schedule reoccurring commands".to_owned(),
                act: open.clone(),
            },
        );
        Self {
            driver: DriverConfig::Console {
                number: "+49000000000".to_owned(),
            },
            users: open,
            modules,
        }
    }
}

impl Config {
    /// Load from `override_path`, or from the XDG config file. A missing
    /// file yields the console default.
    ///
    /// # Errors
    ///
    /// Fails on unreadable files, YAML errors, or invalid values.
    pub fn load(override_path: Option<&Path>, paths: &Paths) -> Result<Self> {
        let path = match override_path {
            Some(p) => p.to_path_buf(),
            None => paths.config_file(),
        };
        let config = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config");
                serde_yaml::from_str(&contents)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "no config file, using console defaults");
                Self::default()
            }
            Err(e) => {
                return Err(anyhow!("reading {}: {e}", path.display()));
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Fail-fast sanity checks not covered by dispatcher construction.
    ///
    /// # Errors
    ///
    /// Reports the first invalid value.
    pub fn validate(&self) -> Result<()> {
        match &self.driver {
            DriverConfig::Console { number } | DriverConfig::Jsonrpc { number, .. } => {
                if !is_valid_user(number) {
                    return Err(anyhow!("driver number {number:?} is not phone-shaped"));
                }
            }
            DriverConfig::Dbus { .. } => {}
        }
        self.users.validate().context("server user ACT invalid")?;
        for (name, handler) in &self.modules {
            handler
                .act
                .validate()
                .with_context(|| format!("module {name} ACT invalid"))?;
        }
        Ok(())
    }
}

/// Resolved filesystem roots.
#[derive(Debug, Clone)]
pub struct Paths {
    config_dir: PathBuf,
    data_dir: PathBuf,
}

impl Paths {
    /// Resolve the XDG config and data roots.
    ///
    /// # Errors
    ///
    /// Fails when no home directory can be determined.
    pub fn resolve() -> Result<Self> {
        let dirs = directories::ProjectDirs::from("", "", PROJECT_DIR)
            .ok_or_else(|| anyhow!("cannot determine home directory"))?;
        Ok(Self {
            config_dir: dirs.config_dir().to_path_buf(),
            data_dir: dirs.data_dir().to_path_buf(),
        })
    }

    /// Explicit roots, used by tests.
    pub fn at(config_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            data_dir: data_dir.into(),
        }
    }

    /// The main configuration file.
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.yaml")
    }

    /// Root for persisted state.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Log file directory.
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Per-module state file, keyed by module name.
    pub fn module_state(&self, module: &str) -> PathBuf {
        self.data_dir.join(format!("{module}.yaml"))
    }
}
