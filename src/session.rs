use crate::config::{expand_path, RuntimeConfig};
use crate::error::{LauncherError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

pub const RSTUDIO_PORT: u16 = 8787;
pub const DEFAULT_REPO: &str = "IMPACTncd_Germany";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Location {
    Local,
    Remote { host: String, ip: String },
}

impl Location {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("local") {
            return Ok(Location::Local);
        }
        let prefix = "REMOTE@";
        let has_prefix = trimmed
            .get(..prefix.len())
            .map(|head| head.eq_ignore_ascii_case(prefix))
            .unwrap_or(false);
        if has_prefix {
            let ip = trimmed[prefix.len()..].trim();
            if ip.is_empty() || ip.chars().any(char::is_whitespace) {
                return Err(LauncherError::Config(format!("invalid remote address in '{raw}'")));
            }
            return Ok(Location::Remote {
                host: ip.to_string(),
                ip: ip.to_string(),
            });
        }
        Err(LauncherError::Config(format!(
            "invalid location '{raw}': expected LOCAL or REMOTE@<ip>"
        )))
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Location::Local)
    }

    pub fn remote_ip(&self) -> Option<&str> {
        match self {
            Location::Local => None,
            Location::Remote { ip, .. } => Some(ip.as_str()),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local => write!(f, "LOCAL"),
            Location::Remote { ip, .. } => write!(f, "REMOTE@{ip}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPaths {
    pub repo_root: String,
    pub output_dir: Option<String>,
    pub synthpop_dir: Option<String>,
    /// Mount source of the private key, on whichever host runs Docker.
    pub ssh_private_key: String,
    pub known_hosts: String,
    /// The operator's own key pair on this machine.
    pub local_private_key: PathBuf,
    pub local_known_hosts: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    pub debug: bool,
    pub direct_ssh: bool,
    pub use_volumes: bool,
    pub rebuild: bool,
    pub high_compute: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortState {
    pub requested: u16,
    pub assigned: Option<u16>,
    pub in_use: BTreeSet<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub image: String,
    pub built: bool,
    pub used_prerequisite: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoverySource {
    Metadata,
    Inspection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveredRuntimeInfo {
    pub password: Option<String>,
    pub port: Option<u16>,
    pub use_volumes: bool,
    pub source: RecoverySource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeNames {
    pub output: String,
    pub synthpop: String,
}

impl VolumeNames {
    pub fn for_user(user: &str) -> Self {
        Self {
            output: sanitize_volume_name(&format!("impactncd_germany_output_{user}")),
            synthpop: sanitize_volume_name(&format!("impactncd_germany_synthpop_{user}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitBaseline {
    pub commit: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionMetadata {
    pub build: Option<BuildInfo>,
    pub recovered: Option<RecoveredRuntimeInfo>,
    pub docker_context: Option<String>,
    pub volumes: Option<VolumeNames>,
    pub git_baseline: Option<GitBaseline>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSession {
    pub repo_path: String,
    pub is_remote: bool,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub user_name: String,
    pub password: String,
    pub location: Location,
    pub remote_user: Option<String>,
    pub selected_repo: String,
    pub container_name: String,
    pub paths: SessionPaths,
    pub flags: SessionFlags,
    pub ports: PortState,
    pub metadata: SessionMetadata,
}

/// Raw selections gathered from the command line.
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    pub user: String,
    pub password: Option<String>,
    pub location: String,
    pub repo: Option<String>,
    pub repo_path: Option<String>,
    pub remote_user: Option<String>,
    pub port: Option<u16>,
    pub flags: SessionFlags,
}

impl SessionState {
    pub fn from_request(rt: &RuntimeConfig, request: &SessionRequest) -> Result<Self> {
        let user_name = normalize_user_name(&request.user);
        if user_name.is_empty() {
            return Err(LauncherError::Config("user name must not be empty".to_string()));
        }
        let password = request
            .password
            .as_deref()
            .map(normalize_password)
            .unwrap_or_default();
        let location = Location::parse(&request.location)?;
        let selected_repo = request
            .repo
            .clone()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_REPO.to_string());
        if selected_repo.contains(['/', '\\']) || selected_repo.chars().any(char::is_whitespace) {
            return Err(LauncherError::Config(format!(
                "invalid repository name '{selected_repo}'"
            )));
        }
        let remote_user = match &location {
            Location::Local => None,
            Location::Remote { .. } => Some(
                request
                    .remote_user
                    .clone()
                    .filter(|u| !u.trim().is_empty())
                    .unwrap_or_else(|| rt.config.remote.user.clone()),
            ),
        };

        let key_name = key_file_name(&user_name);
        let local_ssh_dir = rt.local_ssh_dir();
        let local_private_key = local_ssh_dir.join(&key_name);
        let local_known_hosts = local_ssh_dir.join("known_hosts");

        let (repo_root, ssh_private_key, known_hosts) = match &location {
            Location::Local => {
                let repo_root = request.repo_path.clone().unwrap_or_else(|| {
                    let base = expand_path(&rt.config.local.repos_root);
                    format!("{}/{}", base.trim_end_matches(['/', '\\']), selected_repo)
                });
                (
                    repo_root,
                    local_private_key.to_string_lossy().to_string(),
                    local_known_hosts.to_string_lossy().to_string(),
                )
            }
            Location::Remote { .. } => {
                let account = remote_user.clone().unwrap_or_default();
                let repo_root = request.repo_path.clone().unwrap_or_else(|| {
                    format!(
                        "{}/{}",
                        rt.config.remote.repos_root.trim_end_matches('/'),
                        selected_repo
                    )
                });
                let ssh_dir = remote_ssh_dir(&account, &rt.config.remote.ssh_dir);
                (
                    repo_root,
                    format!("{ssh_dir}/{key_name}"),
                    format!("{ssh_dir}/known_hosts_{user_name}"),
                )
            }
        };

        let mut flags = request.flags;
        flags.debug = flags.debug || rt.debug;

        Ok(Self {
            container_name: container_name(&selected_repo, &user_name),
            user_name,
            password,
            location,
            remote_user,
            selected_repo,
            paths: SessionPaths {
                repo_root,
                output_dir: None,
                synthpop_dir: None,
                ssh_private_key,
                known_hosts,
                local_private_key,
                local_known_hosts,
            },
            flags,
            ports: PortState {
                requested: request.port.unwrap_or(RSTUDIO_PORT),
                assigned: None,
                in_use: BTreeSet::new(),
            },
            metadata: SessionMetadata::default(),
        })
    }

    pub fn is_remote(&self) -> bool {
        !self.location.is_local()
    }

    pub fn volume_names(&self) -> VolumeNames {
        VolumeNames::for_user(&self.user_name)
    }

    pub fn active_session(&self) -> ActiveSession {
        ActiveSession {
            repo_path: self.paths.repo_root.clone(),
            is_remote: self.is_remote(),
            port: self.ports.assigned.unwrap_or(self.ports.requested),
        }
    }

    /// Host name RStudio is reachable on once the container is up.
    pub fn server_host(&self) -> String {
        match &self.location {
            Location::Local => "localhost".to_string(),
            Location::Remote { ip, .. } => ip.clone(),
        }
    }
}

pub fn normalize_user_name(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}

pub fn normalize_password(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_whitespace()).collect()
}

pub fn container_name(repo: &str, user: &str) -> String {
    format!("{repo}_{user}")
}

pub fn key_file_name(user: &str) -> String {
    format!("id_ed25519_{user}")
}

pub fn sanitize_volume_name(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn remote_ssh_dir(account: &str, configured: &str) -> String {
    if configured.starts_with('/') {
        return configured.trim_end_matches('/').to_string();
    }
    format!("/home/{account}/{}", configured.trim_matches('/'))
}
