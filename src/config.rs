use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::RepositoryKey;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub repositories: RepositoriesConfig,
    pub tool: ToolConfig,
    pub pipeline: PipelineConfig,
    pub storage: StorageConfig,
    pub report: ReportConfig,
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mapdiffbot")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoriesConfig {
    /// Root directory holding one working copy per `owner/name`
    pub root: PathBuf,
    /// Clone URL template; `{owner}` and `{name}` are substituted
    pub remote_url: String,
    pub committer_name: String,
    pub committer_email: String,
}

impl Default for RepositoriesConfig {
    fn default() -> Self {
        Self {
            root: data_dir().join("repositories"),
            remote_url: "https://github.com/{owner}/{name}.git".to_string(),
            committer_name: "mapdiffbot".to_string(),
            committer_email: "mapdiffbot@users.noreply.github.com".to_string(),
        }
    }
}

impl RepositoriesConfig {
    pub fn remote_url_for(&self, key: &RepositoryKey) -> String {
        self.remote_url.replace("{owner}", &key.owner).replace("{name}", &key.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub binary: PathBuf,
    /// Arguments placed before the subcommand on every invocation
    pub base_args: Vec<String>,
    pub render_command: String,
    pub diff_command: String,
    pub size_command: String,
    pub map_extension: String,
    pub manifest_extension: String,
    pub image_extension: String,
    /// Maximum concurrently running tool processes; 0 means unbounded
    pub max_concurrent: usize,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("dmm-tools"),
            base_args: Vec::new(),
            render_command: "minimap".to_string(),
            diff_command: "diff-maps".to_string(),
            size_command: "map-info".to_string(),
            map_extension: "dmm".to_string(),
            manifest_extension: "dme".to_string(),
            image_extension: "png".to_string(),
            max_concurrent: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root of the per-job scratch output directories
    pub work_dir: PathBuf,
    pub mergeable_attempts: u32,
    /// Delay unit of the linear mergeable backoff
    pub mergeable_delay_ms: u64,
    pub min_view_diameter: i32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            work_dir: data_dir().join("work"),
            mergeable_attempts: 5,
            mergeable_delay_ms: 1000,
            min_view_diameter: 4,
        }
    }
}

impl PipelineConfig {
    pub fn mergeable_delay(&self) -> Duration {
        Duration::from_millis(self.mergeable_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: data_dir().join("mapdiffbot.sqlite3"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Base URL images are served from; `None` reports without image links
    pub public_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            repositories: RepositoriesConfig::default(),
            tool: ToolConfig::default(),
            pipeline: PipelineConfig::default(),
            storage: StorageConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// An explicit path must load. Otherwise the first readable of
    /// `~/.config/mapdiffbot/mapdiffbot.yml` and `./mapdiffbot.yml` wins,
    /// falling back to defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        for candidate in Self::search_paths() {
            if !candidate.exists() {
                continue;
            }
            match Self::load_from_file(&candidate) {
                Ok(config) => return Ok(config),
                Err(e) => log::warn!("Skipping config {}: {:#}", candidate.display(), e),
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn search_paths() -> Vec<PathBuf> {
        let file_name = format!("{}.yml", env!("CARGO_PKG_NAME"));
        let mut paths = Vec::with_capacity(2);
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join(env!("CARGO_PKG_NAME")).join(&file_name));
        }
        paths.push(PathBuf::from(file_name));
        paths
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }
}
