// src/core/launcher/manifest.rs

//! Pattern manifests: YAML files on disk describing the executables the
//! launcher may run, loaded and validated at agent startup.

use crate::core::errors::CitrineError;
use crate::core::launcher::isolation::IsolationLevel;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Readiness probe declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthcheckSpec {
    pub port: u32,
    pub path: String,
    #[serde(with = "humantime_serde", default = "default_health_interval")]
    pub interval: Duration,
    #[serde(with = "humantime_serde", default = "default_health_timeout")]
    pub timeout: Duration,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_health_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_failure_threshold() -> u32 {
    3
}

/// Advisory resource limits. Not enforced by the agent; passed through for
/// schedulers that care.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default)]
    pub cpu_limit: Option<String>,
    #[serde(default)]
    pub memory_limit: Option<String>,
}

/// One pattern manifest as parsed from disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternManifest {
    pub name: String,
    pub version: String,
    /// Relative paths resolve against the manifest file's directory.
    pub executable: String,
    pub isolation_level: IsolationLevel,
    pub healthcheck: HealthcheckSpec,
    #[serde(default)]
    pub resources: Option<ResourceSpec>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub backend_slots: Option<u32>,
    #[serde(skip)]
    manifest_dir: PathBuf,
}

impl PatternManifest {
    /// Loads and validates one manifest file.
    pub fn from_file(path: &Path) -> Result<Self, CitrineError> {
        let contents = std::fs::read_to_string(path)?;
        let mut manifest: PatternManifest = serde_yaml::from_str(&contents).map_err(|e| {
            CitrineError::InvalidArgument(format!("invalid manifest {}: {e}", path.display()))
        })?;
        manifest.manifest_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        manifest.validate(path)?;
        Ok(manifest)
    }

    fn validate(&self, path: &Path) -> Result<(), CitrineError> {
        let reject = |msg: String| {
            Err(CitrineError::InvalidArgument(format!(
                "manifest {}: {msg}",
                path.display()
            )))
        };
        if self.name.trim().is_empty() {
            return reject("name cannot be empty".to_string());
        }
        if self.version.trim().is_empty() {
            return reject("version cannot be empty".to_string());
        }
        if self.executable.trim().is_empty() {
            return reject("executable cannot be empty".to_string());
        }
        if self.healthcheck.port == 0 || self.healthcheck.port > u16::MAX as u32 {
            return reject(format!(
                "healthcheck.port {} is outside the valid range",
                self.healthcheck.port
            ));
        }
        if !self.healthcheck.path.starts_with('/') {
            return reject(format!(
                "healthcheck.path '{}' must start with '/'",
                self.healthcheck.path
            ));
        }

        let executable = self.resolved_executable();
        let meta = match std::fs::metadata(&executable) {
            Ok(meta) => meta,
            Err(_) => {
                return reject(format!(
                    "executable '{}' does not exist",
                    executable.display()
                ));
            }
        };
        if !meta.is_file() {
            return reject(format!("executable '{}' is not a file", executable.display()));
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if meta.permissions().mode() & 0o111 == 0 {
                return reject(format!(
                    "executable '{}' is not executable",
                    executable.display()
                ));
            }
        }
        Ok(())
    }

    /// The executable path, resolved against the manifest's directory.
    pub fn resolved_executable(&self) -> PathBuf {
        let path = Path::new(&self.executable);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.manifest_dir.join(path)
        }
    }
}

/// All manifests known to the agent, keyed by pattern name.
#[derive(Debug, Default)]
pub struct ManifestSet {
    patterns: HashMap<String, PatternManifest>,
}

impl ManifestSet {
    /// Loads every `*.yaml` / `*.yml` under a directory. Duplicate pattern
    /// names are rejected.
    pub fn load_dir(dir: &Path) -> Result<Self, CitrineError> {
        let mut set = ManifestSet::default();
        let entries = std::fs::read_dir(dir).map_err(|e| {
            CitrineError::Config(format!("cannot read manifest dir {}: {e}", dir.display()))
        })?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let is_yaml = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            );
            if !is_yaml {
                continue;
            }
            let manifest = PatternManifest::from_file(&path)?;
            info!(
                "Loaded pattern manifest '{}' v{} ({})",
                manifest.name,
                manifest.version,
                path.display()
            );
            if set
                .patterns
                .insert(manifest.name.clone(), manifest)
                .is_some()
            {
                return Err(CitrineError::Config(format!(
                    "duplicate pattern manifest in {}",
                    path.display()
                )));
            }
        }
        Ok(set)
    }

    pub fn insert(&mut self, manifest: PatternManifest) {
        self.patterns.insert(manifest.name.clone(), manifest);
    }

    pub fn get(&self, pattern: &str) -> Option<&PatternManifest> {
        self.patterns.get(pattern)
    }

    pub fn names(&self) -> Vec<String> {
        self.patterns.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
