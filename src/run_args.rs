//! `docker run` argument vector for an RStudio session container.
//!
//! The ordering is relied on by operators reading `--dry-run` output, so it
//! is fixed: identity, env, repo mounts, sync env, port, custom tokens, data
//! mounts, resource limits, key mounts, workdir, image.

use crate::config::DockerConfig;
use crate::paths::to_docker_mount_path;
use crate::session::{SessionState, RSTUDIO_PORT};

pub const HOST_REPO_TARGET: &str = "/host-repo";
pub const KNOWN_HOSTS_TARGET: &str = "/etc/ssh/ssh_known_hosts";
pub const CONTAINER_HOME: &str = "/home/rstudio";
const DEFAULT_IDS: &str = "1000";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub image: String,
    pub custom_params: String,
    pub cpus: u32,
    pub memory: String,
    /// Mount sources below are already in the Docker host's path dialect.
    pub repo_mount_source: String,
    pub output_source: String,
    pub synthpop_source: String,
    pub key_source: String,
    pub known_hosts_source: String,
}

impl RunOptions {
    /// Translates the session's resolved paths into mount sources for
    /// whichever host runs the container.
    pub fn for_session(state: &SessionState, docker: &DockerConfig, image: &str, custom_params: &str) -> Self {
        let is_local = state.location.is_local();
        let mount = |p: &str| to_docker_mount_path(p, is_local);
        Self {
            image: image.to_string(),
            custom_params: custom_params.to_string(),
            cpus: docker.high_compute_cpus,
            memory: docker.high_compute_memory.clone(),
            repo_mount_source: mount(&state.paths.repo_root),
            output_source: state.paths.output_dir.as_deref().map(mount).unwrap_or_default(),
            synthpop_source: state.paths.synthpop_dir.as_deref().map(mount).unwrap_or_default(),
            key_source: mount(&state.paths.ssh_private_key),
            known_hosts_source: mount(&state.paths.known_hosts),
        }
    }
}

pub fn container_repo_dir(repo: &str) -> String {
    format!("{CONTAINER_HOME}/{repo}")
}

pub fn container_key_path(user: &str) -> String {
    format!("{CONTAINER_HOME}/.ssh/id_ed25519_{user}")
}

pub fn key_mount_target(user: &str) -> String {
    format!("/keys/id_ed25519_{user}")
}

pub fn git_ssh_command(user: &str) -> String {
    format!(
        "ssh -i {} -o IdentitiesOnly=yes -o UserKnownHostsFile={KNOWN_HOSTS_TARGET} -o StrictHostKeyChecking=yes",
        container_key_path(user)
    )
}

pub fn build_run_args(state: &SessionState, options: &RunOptions) -> Vec<String> {
    let user = &state.user_name;
    let repo_dir = container_repo_dir(&state.selected_repo);
    let port = state.ports.assigned.unwrap_or(state.ports.requested);
    let mut args: Vec<String> = Vec::new();

    args.extend([
        "run".to_string(),
        "-d".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        state.container_name.clone(),
    ]);

    for env in [
        format!("PASSWORD={}", state.password),
        "DISABLE_AUTH=false".to_string(),
        format!("USERID={DEFAULT_IDS}"),
        format!("GROUPID={DEFAULT_IDS}"),
        format!("GIT_SSH_COMMAND={}", git_ssh_command(user)),
    ] {
        args.push("-e".to_string());
        args.push(env);
    }

    args.extend([
        "-v".to_string(),
        format!("{}:{HOST_REPO_TARGET}", options.repo_mount_source),
        "-v".to_string(),
        format!("{}:{repo_dir}", options.repo_mount_source),
        "-e".to_string(),
        format!("REPO_SYNC_PATH={HOST_REPO_TARGET}"),
        "-e".to_string(),
        "SYNC_ENABLED=true".to_string(),
        "-p".to_string(),
        format!("{port}:{RSTUDIO_PORT}"),
    ]);

    args.extend(options.custom_params.split_whitespace().map(str::to_string));

    let output_target = format!("{repo_dir}/outputs");
    let synthpop_target = format!("{repo_dir}/inputs/synthpop");
    let (output_source, synthpop_source) = if state.flags.use_volumes {
        let volumes = state.volume_names();
        (volumes.output, volumes.synthpop)
    } else {
        (options.output_source.clone(), options.synthpop_source.clone())
    };
    args.extend([
        "-v".to_string(),
        format!("{output_source}:{output_target}"),
        "-v".to_string(),
        format!("{synthpop_source}:{synthpop_target}"),
    ]);

    if state.flags.high_compute && state.is_remote() {
        args.extend([
            "--cpus".to_string(),
            options.cpus.to_string(),
            "-m".to_string(),
            options.memory.clone(),
        ]);
    }

    args.extend([
        "-v".to_string(),
        format!("{}:{}:ro", options.key_source, key_mount_target(user)),
        "-v".to_string(),
        format!("{}:{KNOWN_HOSTS_TARGET}:ro", options.known_hosts_source),
        "--workdir".to_string(),
        repo_dir,
        options.image.clone(),
    ]);
    args
}
