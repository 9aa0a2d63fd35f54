//! The `ci.yml` workflow specification.
//!
//! A spec carries a global section (timeout, environment), a main script and
//! a cleanup script. Scripts are sequences of shell fragments joined with
//! `;` and handed to `sh -ce`, so the first failing fragment aborts the run.
//! Environment values whose string content equals a registered meta-var key
//! are substituted at command-build time; the core job registers
//! `__commit__`, `__ref__` and `__branch__` before execution.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;

/// Applied when `global.timeout` is absent or zero.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Errors raised while loading a spec. Either aborts the job with an error
/// status.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("failed reading ci spec: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed parsing ci spec yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// The `global` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Global {
    /// Per-script deadline in seconds.
    #[serde(default)]
    pub timeout: u64,

    /// Extra environment for both scripts. Scalar values only; strings
    /// matching a meta-var key are substituted.
    #[serde(default)]
    pub env: BTreeMap<String, serde_yaml::Value>,
}

/// A parsed workflow specification. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Spec {
    #[serde(default)]
    pub global: Global,

    #[serde(default)]
    pub script: Vec<String>,

    #[serde(default)]
    pub after_script: Vec<String>,

    #[serde(skip)]
    meta_vars: HashMap<String, String>,
}

impl Spec {
    pub fn from_yaml(text: &str) -> Result<Self, SpecError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SpecError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// The per-script deadline.
    pub fn timeout(&self) -> Duration {
        let secs = match self.global.timeout {
            0 => DEFAULT_TIMEOUT_SECS,
            t => t,
        };
        Duration::from_secs(secs)
    }

    /// Registers a meta-var for environment substitution.
    pub fn set_meta_var(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.meta_vars.insert(key.into(), value.into());
    }

    /// Builds the main script command, rooted in `dir`.
    pub fn script_cmd(&self, dir: &Path) -> Command {
        self.shell_cmd(&self.script, dir)
    }

    /// Builds the cleanup script command, rooted in `dir`.
    pub fn after_script_cmd(&self, dir: &Path) -> Command {
        self.shell_cmd(&self.after_script, dir)
    }

    fn shell_cmd(&self, fragments: &[String], dir: &Path) -> Command {
        let joined = fragments.join(";");
        let mut cmd = Command::new("sh");
        // -e aborts on the first failing fragment. The process environment
        // is inherited; the spec's env is layered on top.
        cmd.arg("-ce").arg(joined).current_dir(dir);
        for (key, value) in &self.global.env {
            if let Some(value) = self.env_value(value) {
                cmd.env(key, value);
            }
        }
        cmd
    }

    fn env_value(&self, value: &serde_yaml::Value) -> Option<String> {
        match value {
            serde_yaml::Value::String(s) => Some(
                self.meta_vars
                    .get(s.as_str())
                    .cloned()
                    .unwrap_or_else(|| s.clone()),
            ),
            serde_yaml::Value::Number(n) => Some(n.to_string()),
            serde_yaml::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}
