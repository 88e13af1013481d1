use crate::error::{LauncherError, Result};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub remote: RemoteConfig,
    pub local: LocalConfig,
    pub docker: DockerConfig,
    pub readiness: ReadinessConfig,
    pub github: GitHubConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteConfig {
    pub user: String,
    pub connect_timeout_sec: u64,
    pub metadata_dir: String,
    pub repos_root: String,
    pub ssh_dir: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LocalConfig {
    pub repos_root: String,
    pub ssh_dir: String,
    pub docker_desktop_command: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DockerConfig {
    pub image: String,
    pub dockerfile: String,
    pub prerequisite_dockerfile: String,
    pub rsync_image: String,
    pub context_prefix: String,
    pub daemon_timeout_sec: u64,
    pub high_compute_cpus: u32,
    pub high_compute_memory: String,
    pub container_uid: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ReadinessConfig {
    pub attempts: u32,
    pub interval_sec: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct GitHubConfig {
    pub api_url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            remote: RemoteConfig::default(),
            local: LocalConfig::default(),
            docker: DockerConfig::default(),
            readiness: ReadinessConfig::default(),
            github: GitHubConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            user: "php-workstation".to_string(),
            connect_timeout_sec: 10,
            metadata_dir: "/tmp/impactncd".to_string(),
            repos_root: "/home/php-workstation/Schreibtisch/Repositories".to_string(),
            ssh_dir: ".ssh".to_string(),
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            repos_root: "~/Documents/GitHub".to_string(),
            ssh_dir: "~/.ssh".to_string(),
            docker_desktop_command: String::new(),
        }
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: String::new(),
            dockerfile: "docker_setup/Dockerfile.IMPACTncdGER".to_string(),
            prerequisite_dockerfile: "docker_setup/Dockerfile.prerequisite.IMPACTncdGER"
                .to_string(),
            rsync_image: "rsync-alpine".to_string(),
            context_prefix: "impactncd-remote".to_string(),
            daemon_timeout_sec: 30,
            high_compute_cpus: 32,
            high_compute_memory: "384g".to_string(),
            container_uid: 1000,
        }
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            attempts: 60,
            interval_sec: 2,
        }
    }
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
        }
    }
}

/// Everything that used to be process-wide state, built once in `main` and
/// passed down by reference.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub config: Config,
    pub config_path: PathBuf,
    pub state_dir: PathBuf,
    pub debug: bool,
    pub non_interactive: bool,
    pub json: bool,
}

impl RuntimeConfig {
    pub fn local_ssh_dir(&self) -> PathBuf {
        PathBuf::from(expand_path(&self.config.local.ssh_dir))
    }

    pub fn image_for_repo(&self, repo: &str) -> String {
        let configured = self.config.docker.image.trim();
        if configured.is_empty() {
            repo.to_lowercase()
        } else {
            configured.to_string()
        }
    }
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("IMPACTNCD_CONFIG") {
        return PathBuf::from(path);
    }
    let mut base = default_config_dir();
    base.push("config.yaml");
    base
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("IMPACTNCD_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("impactncd");
    base
}

pub fn state_dir_for(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .map(|p| p.join("sessions"))
        .unwrap_or_else(|| default_config_dir().join("sessions"))
}

pub fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub fn write_atomic_text_file(path: &Path, content: &str, mode: Option<u32>) -> Result<()> {
    ensure_parent(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "impactncd".to_string()),
        pid,
        ts
    ));

    fs::write(&tmp_path, content)?;
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

pub fn read_config_from_str(content: &str) -> Result<Config> {
    let cfg: Config = serde_yaml::from_str(content)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn read_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content)
}

/// Missing file means defaults; an unreadable or invalid one is an error.
pub fn load_config_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    read_config(path).map_err(|err| {
        LauncherError::Config(format!(
            "config is invalid. Please edit {} and try again. ({})",
            path.display(),
            err
        ))
    })
}

pub fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.version != CONFIG_VERSION {
        return Err(LauncherError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    if cfg.remote.user.trim().is_empty() {
        return Err(LauncherError::Config(
            "remote.user must not be empty".to_string(),
        ));
    }
    if !cfg.remote.metadata_dir.starts_with('/') {
        return Err(LauncherError::Config(
            "remote.metadata_dir must be an absolute path".to_string(),
        ));
    }
    if cfg.remote.connect_timeout_sec == 0 {
        return Err(LauncherError::Config(
            "remote.connect_timeout_sec must be greater than zero".to_string(),
        ));
    }
    if cfg.docker.dockerfile.trim().is_empty() {
        return Err(LauncherError::Config(
            "docker.dockerfile must not be empty".to_string(),
        ));
    }
    if cfg.docker.high_compute_cpus == 0 || cfg.docker.high_compute_memory.trim().is_empty() {
        return Err(LauncherError::Config(
            "docker.high_compute_cpus and docker.high_compute_memory must be set".to_string(),
        ));
    }
    Ok(())
}

pub fn expand_path(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    if input == "~" {
        if let Some(home) = home_dir() {
            return home.to_string_lossy().to_string();
        }
    }
    input.to_string()
}
