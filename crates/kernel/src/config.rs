use std::{fs, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const PIPLITE_WHEEL_URL: &str = "https://jupyter.org/try-jupyter/extensions/@jupyterlite/pyodide-kernel-extension/static/pypi/piplite-0.6.0-py3-none-any.whl";
const PIPLITE_INDEX_URL: &str = "https://jupyter.org/try-jupyter/extensions/@jupyterlite/pyodide-kernel-extension/static/pypi/all.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Requests the caller may queue before `send` starts waiting.
    pub queue_capacity: usize,
    /// Upper bound for running a single request; unbounded when absent.
    pub execution_timeout_ms: Option<u64>,
    pub packages: PackageConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 32,
            execution_timeout_ms: None,
            packages: PackageConfig::default(),
        }
    }
}

impl KernelConfig {
    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout_ms.map(Duration::from_millis)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_toml(&content).map_err(|source| ConfigError::ParseToml {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Packages set up while the engine initializes, in this order: `preload`,
/// the installer wheel, `index_urls`, `kernel`, `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageConfig {
    pub preload: Vec<String>,
    pub installer_wheel: String,
    pub index_urls: Vec<String>,
    pub kernel: Vec<String>,
    pub extra: Vec<String>,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            preload: strings(&["micropip", "jedi", "ipython"]),
            installer_wheel: PIPLITE_WHEEL_URL.to_string(),
            index_urls: strings(&[PIPLITE_INDEX_URL]),
            kernel: strings(&["ipykernel", "comm", "pyodide_kernel", "ipywidgets"]),
            extra: Vec::new(),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file '{path}': {source}")]
    ParseToml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
