//! Start/stop state machine for one `<repo>_<user>` container.
//!
//! Every external effect goes through the [`CommandRunner`] handed to the
//! [`Orchestrator`], so the full sequences are testable against a recording
//! mock.

use crate::config::RuntimeConfig;
use crate::docker::{ssh_uri, ContainerRow, Docker, DockerTarget};
use crate::error::{LauncherError, Result};
use crate::git_notify::RepoGit;
use crate::metadata::{
    clear_session_record, load_session_record, write_session_record, RunMetadata, SessionRecord,
};
use crate::paths::{to_docker_mount_path, validate_mount_source};
use crate::readiness::{server_url, wait_for_server};
use crate::run_args::{
    build_run_args, container_key_path, key_mount_target, RunOptions, CONTAINER_HOME,
    KNOWN_HOSTS_TARGET,
};
use crate::runner::{shell_single_quote, CommandOutput, CommandRunner, Invocation};
use crate::session::{
    ActiveSession, BuildInfo, GitBaseline, RecoveredRuntimeInfo, RecoverySource, SessionState,
    VolumeNames, RSTUDIO_PORT,
};
use crate::sim_design::{self, DataDirs};
use crate::ssh::config::{ensure_config_entry, HostEntry, HostEntryPlan};
use crate::ssh::keys::{
    ensure_github_known_host, ensure_local_key_pair, key_marker, read_public_key,
};
use crate::ssh::{KeyAuthorization, SshGateway};
use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const DAEMON_POLL_SEC: u64 = 2;
const RSYNC_DOCKERFILE: &str = "FROM alpine:latest\nRUN apk add --no-cache rsync\n";
const SYNC_BACK_FLAGS: [&str; 5] = [
    "-rlt",
    "--no-owner",
    "--no-group",
    "--no-perms",
    "--chmod=ugo=rwX",
];

#[derive(Debug, Clone, Serialize)]
pub struct ContainerStatus {
    pub container: String,
    pub running: bool,
    pub inventory: Vec<ContainerRow>,
    pub ports_in_use: Vec<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovered: Option<RecoveredRuntimeInfo>,
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub image: String,
    pub custom_params: String,
    pub wait: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub container: String,
    pub url: String,
    pub port: u16,
    pub build: BuildInfo,
    pub use_volumes: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volumes: Option<VolumeNames>,
    pub container_uid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_written: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_ready: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_baseline: Option<GitBaseline>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopReport {
    pub container: String,
    pub stopped: bool,
    pub volumes_removed: Vec<String>,
    pub volumes_kept: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_deleted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<ActiveSession>,
    #[serde(skip)]
    pub git_baseline: Option<GitBaseline>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccessReport {
    pub private_key: String,
    pub key_generated: bool,
    pub github_known_host_added: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<KeyAuthorization>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_config: Option<HostEntryPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_material_uploaded: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_docker: Option<String>,
}

pub struct Orchestrator<'a, R: CommandRunner> {
    rt: &'a RuntimeConfig,
    runner: &'a R,
    poll_interval: Duration,
}

impl<'a, R: CommandRunner> Orchestrator<'a, R> {
    pub fn new(rt: &'a RuntimeConfig, runner: &'a R) -> Self {
        Self {
            rt,
            runner,
            poll_interval: Duration::from_secs(DAEMON_POLL_SEC),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn docker_target(&self, state: &SessionState) -> DockerTarget {
        match state.location.remote_ip() {
            None => DockerTarget::Local,
            Some(ip) => DockerTarget::for_remote(
                state.flags.direct_ssh,
                &self.rt.config.docker.context_prefix,
                self.remote_user(state),
                ip,
            ),
        }
    }

    pub fn docker(&self, state: &SessionState) -> Docker<'a, R> {
        Docker::new(self.runner, self.docker_target(state))
    }

    /// `None` in local mode: nothing there may touch SSH.
    pub fn ssh(&self, state: &SessionState) -> Option<SshGateway<'a, R>> {
        let ip = state.location.remote_ip()?;
        Some(SshGateway::new(
            self.runner,
            self.remote_user(state),
            ip,
            &state.paths.local_private_key.to_string_lossy(),
            self.rt.config.remote.connect_timeout_sec,
        ))
    }

    fn remote_user<'s>(&'s self, state: &'s SessionState) -> &'s str {
        state
            .remote_user
            .as_deref()
            .unwrap_or(self.rt.config.remote.user.as_str())
    }

    /// Makes sure the engine for this session answers `docker info`,
    /// creating the remote context and launching Docker Desktop as needed.
    pub fn ensure_daemon(&self, state: &mut SessionState) -> Result<()> {
        let docker = self.docker(state);
        let context = match (docker.target(), state.location.remote_ip()) {
            (DockerTarget::Context(name), Some(ip)) => Some((name.clone(), ssh_uri(self.remote_user(state), ip))),
            _ => None,
        };
        if let Some((name, uri)) = context {
            docker.ensure_context(&name, &uri)?;
            state.metadata.docker_context = Some(name);
        }
        if docker.daemon_reachable() {
            return Ok(());
        }
        let launcher = self.rt.config.local.docker_desktop_command.trim();
        if state.location.is_local() && !launcher.is_empty() {
            info!(command = %launcher, "docker daemon unreachable; launching Docker Desktop");
            let output = self
                .runner
                .run(
                    &Invocation::new("sh")
                        .arg("-c")
                        .arg(format!("{launcher} >/dev/null 2>&1 &")),
                )
                .map_err(|err| LauncherError::Process(format!("failed to launch Docker Desktop: {err}")))?;
            if !output.success() {
                warn!(stderr = %output.stderr_text(), "Docker Desktop launcher returned non-zero");
            }
            let timeout = self.rt.config.docker.daemon_timeout_sec;
            let attempts = timeout.div_ceil(DAEMON_POLL_SEC).max(1);
            for attempt in 1..=attempts {
                thread::sleep(self.poll_interval);
                if docker.daemon_reachable() {
                    info!(attempt, "docker daemon is up");
                    return Ok(());
                }
            }
            return Err(LauncherError::EnvironmentMissing(format!(
                "docker daemon did not become reachable within {timeout}s"
            )));
        }
        Err(LauncherError::EnvironmentMissing(match state.location.remote_ip() {
            None => "docker daemon is unreachable; start Docker Desktop (or dockerd) and retry".to_string(),
            Some(ip) => format!(
                "docker engine on {ip} is unreachable; check `impactncd ssh setup` and that docker runs there"
            ),
        }))
    }

    pub fn detect_status(&self, state: &mut SessionState) -> Result<ContainerStatus> {
        let docker = self.docker(state);
        let suffix = format!("_{}", state.user_name);
        let inventory: Vec<ContainerRow> = docker
            .list_user_containers(&state.user_name)?
            .into_iter()
            .filter(|row| row.name.ends_with(&suffix))
            .collect();
        let running = inventory
            .iter()
            .any(|row| row.name == state.container_name && row.is_up());
        state.ports.in_use = inventory
            .iter()
            .filter(|row| row.is_up() && row.name != state.container_name)
            .flat_map(|row| row.host_ports())
            .collect();

        let recovered = if running {
            self.recover_runtime(state, &docker)
        } else {
            None
        };
        if let Some(port) = recovered.as_ref().and_then(|r| r.port) {
            state.ports.assigned = Some(port);
        }
        state.metadata.recovered = recovered.clone();
        debug!(container = %state.container_name, running, in_use = ?state.ports.in_use, "status detected");
        Ok(ContainerStatus {
            container: state.container_name.clone(),
            running,
            inventory,
            ports_in_use: state.ports.in_use.iter().copied().collect(),
            recovered,
        })
    }

    /// Remote metadata first, live inspection second.
    fn recover_runtime(&self, state: &SessionState, docker: &Docker<'a, R>) -> Option<RecoveredRuntimeInfo> {
        if let Some(ssh) = self.ssh(state) {
            if let Some(meta) = ssh.read_metadata(&self.rt.config.remote.metadata_dir, &state.container_name) {
                return Some(RecoveredRuntimeInfo {
                    password: Some(meta.password).filter(|p| !p.is_empty()),
                    port: Some(meta.port),
                    use_volumes: meta.use_volumes,
                    source: RecoverySource::Metadata,
                });
            }
            debug!(container = %state.container_name, "no remote metadata; inspecting container");
        }
        let inspected = docker.inspect(&state.container_name, RSTUDIO_PORT)?;
        let volumes = state.volume_names();
        Some(RecoveredRuntimeInfo {
            password: inspected.password,
            port: inspected.port,
            use_volumes: inspected.volumes.contains(&volumes.output),
            source: RecoverySource::Inspection,
        })
    }

    pub fn check_start_preconditions(&self, state: &SessionState, status: &ContainerStatus) -> Result<()> {
        if state.password.is_empty() {
            return Err(LauncherError::Precondition(
                "a password is required for the RStudio login".to_string(),
            ));
        }
        if status.running {
            let port = state.ports.assigned.unwrap_or(state.ports.requested);
            return Err(LauncherError::Precondition(format!(
                "container {} is already running on port {port}; stop it first",
                state.container_name
            )));
        }
        if state.ports.in_use.contains(&state.ports.requested) {
            return Err(LauncherError::Precondition(format!(
                "port {} is already used by another of your containers; pick another with --port",
                state.ports.requested
            )));
        }
        if let Some(ssh) = self.ssh(state) {
            for path in [&state.paths.ssh_private_key, &state.paths.known_hosts] {
                if !ssh.file_exists(path) {
                    return Err(LauncherError::Precondition(format!(
                        "{path} is missing on {}; run `impactncd ssh setup` first",
                        ssh.host()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Reads `sim_design*.yaml` from the repo and stores the resolved data
    /// directories on the session. Missing directories are an error when
    /// `require_existing` is set; nothing is ever created.
    pub fn resolve_data_dirs(&self, state: &mut SessionState, require_existing: bool) -> Result<DataDirs> {
        let repo_root = state.paths.repo_root.clone();
        let ssh = self.ssh(state);
        let source = match &ssh {
            Some(ssh) => {
                if !ssh.dir_exists(&repo_root) {
                    return Err(LauncherError::Precondition(format!(
                        "repository {repo_root} not found on {}",
                        ssh.host()
                    )));
                }
                sim_design::load_remote_source(ssh, &repo_root)
            }
            None => {
                validate_mount_source(&repo_root, &state.location, cfg!(windows))?;
                if !Path::new(&repo_root).is_dir() {
                    return Err(LauncherError::Precondition(format!(
                        "repository {repo_root} not found"
                    )));
                }
                sim_design::load_local_source(&repo_root)
            }
        };
        let dirs = sim_design::resolve_data_dirs(source.as_deref(), &repo_root)?;
        for (key, dir) in [
            (sim_design::OUTPUT_DIR_KEY, &dirs.output_dir),
            (sim_design::SYNTHPOP_DIR_KEY, &dirs.synthpop_dir),
        ] {
            validate_mount_source(dir, &state.location, cfg!(windows))?;
            if !require_existing {
                continue;
            }
            let exists = match &ssh {
                Some(ssh) => ssh.dir_exists(dir),
                None => Path::new(dir).is_dir(),
            };
            if !exists {
                return Err(LauncherError::Precondition(format!(
                    "{key} {dir} does not exist; create it or correct sim_design.yaml"
                )));
            }
        }
        state.paths.output_dir = Some(dirs.output_dir.clone());
        state.paths.synthpop_dir = Some(dirs.synthpop_dir.clone());
        Ok(dirs)
    }

    fn run_build(&self, state: &SessionState, docker: &Docker<'a, R>, dockerfile: &str, tag: &str) -> Result<CommandOutput> {
        let repo = state.paths.repo_root.as_str();
        match self.ssh(state) {
            Some(ssh) => ssh.exec(&format!(
                "cd {} && docker build -f {} -t {} .",
                shell_single_quote(repo),
                shell_single_quote(dockerfile),
                shell_single_quote(tag)
            )),
            None => {
                let file = format!("{}/{}", repo.trim_end_matches(['/', '\\']), dockerfile);
                docker.raw(&docker.invocation(["build", "-f", file.as_str(), "-t", tag, repo]))
            }
        }
    }

    /// Builds `image` unless it exists and no rebuild was requested. A failed
    /// build is retried once after building the prerequisite image.
    pub fn build_image(&self, state: &SessionState, image: &str) -> Result<BuildInfo> {
        let docker = self.docker(state);
        if !state.flags.rebuild && docker.image_exists(image) {
            debug!(image = %image, "image present; skipping build");
            return Ok(BuildInfo {
                image: image.to_string(),
                built: false,
                used_prerequisite: false,
            });
        }
        let docker_cfg = &self.rt.config.docker;
        info!(image = %image, "building image; this can take 10-20 minutes");
        let first = self.run_build(state, &docker, &docker_cfg.dockerfile, image)?;
        if first.success() {
            return Ok(BuildInfo {
                image: image.to_string(),
                built: true,
                used_prerequisite: false,
            });
        }
        warn!(image = %image, "build failed; building the prerequisite image first");
        let prerequisite = format!("{image}-prerequisite");
        let prereq = self.run_build(state, &docker, &docker_cfg.prerequisite_dockerfile, &prerequisite)?;
        if !prereq.success() {
            return Err(LauncherError::Build {
                message: format!("prerequisite image {prerequisite} failed to build"),
                output: prereq.combined_text(),
            });
        }
        let retry = self.run_build(state, &docker, &docker_cfg.dockerfile, image)?;
        if !retry.success() {
            return Err(LauncherError::Build {
                message: format!("image {image} failed to build after the prerequisite image"),
                output: retry.combined_text(),
            });
        }
        Ok(BuildInfo {
            image: image.to_string(),
            built: true,
            used_prerequisite: true,
        })
    }

    pub fn ensure_rsync_image(&self, docker: &Docker<'a, R>) -> Result<()> {
        let image = self.rt.config.docker.rsync_image.as_str();
        if docker.image_exists(image) {
            return Ok(());
        }
        info!(image = %image, "building rsync helper image");
        let invocation = docker
            .invocation(["build", "-t", image, "-"])
            .stdin(RSYNC_DOCKERFILE);
        let output = docker.raw(&invocation)?;
        if !output.success() {
            return Err(LauncherError::Build {
                message: format!("rsync helper image {image} failed to build"),
                output: output.combined_text(),
            });
        }
        Ok(())
    }

    /// Creates both data volumes, owns them to the container uid and copies
    /// the host directories in.
    pub fn prepare_volumes(&self, state: &SessionState, docker: &Docker<'a, R>, dirs: &DataDirs) -> Result<VolumeNames> {
        let volumes = state.volume_names();
        self.ensure_rsync_image(docker)?;
        let rsync_image = self.rt.config.docker.rsync_image.as_str();
        let uid = self.rt.config.docker.container_uid;
        let owner = format!("{uid}:{uid}");
        let chown_flag = format!("--chown={owner}");
        let is_local = state.location.is_local();
        for (volume, source) in [(&volumes.output, &dirs.output_dir), (&volumes.synthpop, &dirs.synthpop_dir)] {
            docker.volume_create(volume)?;
            let volume_mount = format!("{volume}:/volume");
            docker.run_args([
                "run", "--rm", "-v", volume_mount.as_str(), rsync_image, "chown", "-R", owner.as_str(), "/volume",
            ])?;
            let source_mount = format!("{}:/source:ro", to_docker_mount_path(source, is_local));
            docker.run_args([
                "run", "--rm", "-v", source_mount.as_str(), "-v", volume_mount.as_str(), rsync_image,
                "rsync", "-a", chown_flag.as_str(), "/source/", "/volume/",
            ])?;
            info!(volume = %volume, source = %source, "volume populated");
        }
        Ok(volumes)
    }

    fn sync_volume_back(&self, docker: &Docker<'a, R>, volume: &str, target: &str, is_local: bool) -> bool {
        let volume_mount = format!("{volume}:/volume");
        let backup_mount = format!("{}:/backup", to_docker_mount_path(target, is_local));
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            volume_mount,
            "-v".to_string(),
            backup_mount,
            self.rt.config.docker.rsync_image.clone(),
            "rsync".to_string(),
        ];
        args.extend(SYNC_BACK_FLAGS.iter().map(|f| f.to_string()));
        args.push("/volume/".to_string());
        args.push("/backup/".to_string());
        match docker.run_args(args) {
            Ok(_) => true,
            Err(err) => {
                warn!(volume = %volume, target = %target, error = %err, "rsync back failed; keeping volume");
                false
            }
        }
    }

    fn run_container(&self, docker: &Docker<'a, R>, state: &SessionState, options: &RunOptions) -> Result<()> {
        let args = build_run_args(state, options);
        match docker.run_args(args) {
            Ok(_) => Ok(()),
            Err(err) if err.error_code() == "process_command_failed" => {
                Err(LauncherError::ContainerStart(err.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    /// Copies the read-only key mounts into the RStudio user's home and sets
    /// the git defaults. Failures leave a usable container, so they are
    /// logged only.
    fn post_start(&self, state: &SessionState, docker: &Docker<'a, R>) -> u32 {
        let container = state.container_name.as_str();
        let uid = match docker.exec_in(container, None, &["id", "-u", "rstudio"]) {
            Ok(output) => output.stdout_text().trim().parse::<u32>().ok(),
            Err(err) => {
                debug!(error = %err, "could not query rstudio uid");
                None
            }
        }
        .unwrap_or(self.rt.config.docker.container_uid);

        let key_dst = container_key_path(&state.user_name);
        let script = format!(
            "mkdir -p {home}/.ssh && cp {src} {key_dst} && cp {KNOWN_HOSTS_TARGET} {home}/.ssh/known_hosts && chown -R {uid}:{uid} {home}/.ssh && chmod 700 {home}/.ssh && chmod 600 {key_dst}",
            home = CONTAINER_HOME,
            src = key_mount_target(&state.user_name),
        );
        if let Err(err) = docker.exec_in(container, Some("root"), &["sh", "-c", script.as_str()]) {
            warn!(error = %err, "could not install ssh key inside the container");
        }
        let user = uid.to_string();
        let git_defaults: [&[&str]; 2] = [
            &["git", "config", "--global", "pull.rebase", "false"],
            &["git", "config", "--global", "--add", "safe.directory", "*"],
        ];
        for command in git_defaults {
            if let Err(err) = docker.exec_in(container, Some(user.as_str()), command) {
                warn!(error = %err, "could not apply git defaults inside the container");
            }
        }
        uid
    }

    fn repo_git<'g>(&self, ssh: Option<&'g SshGateway<'a, R>>, repo: &str) -> RepoGit<'g, R>
    where
        'a: 'g,
    {
        match ssh {
            Some(ssh) => RepoGit::remote(self.runner, ssh, repo),
            None => RepoGit::local(self.runner, repo),
        }
    }

    pub fn start(&self, state: &mut SessionState, options: &StartOptions) -> Result<StartReport> {
        self.ensure_daemon(state)?;
        let status = self.detect_status(state)?;
        self.check_start_preconditions(state, &status)?;
        let dirs = self.resolve_data_dirs(state, true)?;
        let docker = self.docker(state);

        let build = self.build_image(state, &options.image)?;
        state.metadata.build = Some(build.clone());

        let ssh = self.ssh(state);
        state.metadata.git_baseline = self
            .repo_git(ssh.as_ref(), &state.paths.repo_root)
            .capture_baseline();

        if state.flags.use_volumes {
            state.metadata.volumes = Some(self.prepare_volumes(state, &docker, &dirs)?);
        }

        state.ports.assigned = Some(state.ports.requested);
        let port = state.ports.requested;
        let run_options = RunOptions::for_session(state, &self.rt.config.docker, &options.image, &options.custom_params);
        self.run_container(&docker, state, &run_options)?;
        info!(container = %state.container_name, port, "container started");

        let container_uid = self.post_start(state, &docker);

        let metadata_written = ssh.as_ref().map(|ssh| {
            let meta = RunMetadata::new(
                &state.container_name,
                &state.selected_repo,
                &state.user_name,
                &state.password,
                port,
                state.flags.use_volumes,
            );
            ssh.write_metadata(&self.rt.config.remote.metadata_dir, &meta)
        });

        let record = SessionRecord {
            container: state.container_name.clone(),
            repo: state.selected_repo.clone(),
            location: state.location.clone(),
            active: state.active_session(),
            use_volumes: state.flags.use_volumes,
            output_dir: state.paths.output_dir.clone(),
            synthpop_dir: state.paths.synthpop_dir.clone(),
            git_baseline: state.metadata.git_baseline.clone(),
            started_at: Utc::now().to_rfc3339(),
        };
        if let Err(err) = write_session_record(&self.rt.state_dir, &record) {
            warn!(error = %err, "could not write local session record");
        }

        let url = server_url(&state.server_host(), port);
        let server_ready = options.wait.then(|| {
            wait_for_server(
                &url,
                self.rt.config.readiness.attempts,
                Duration::from_secs(self.rt.config.readiness.interval_sec),
            )
        });

        Ok(StartReport {
            container: state.container_name.clone(),
            url,
            port,
            build,
            use_volumes: state.flags.use_volumes,
            volumes: state.metadata.volumes.clone(),
            container_uid,
            metadata_written,
            server_ready,
            git_baseline: state.metadata.git_baseline.clone(),
        })
    }

    /// Stops the container and reconciles volume contents back to the host.
    /// A container that is not running is a no-op.
    pub fn stop(&self, state: &mut SessionState) -> Result<StopReport> {
        self.ensure_daemon(state)?;
        let status = self.detect_status(state)?;
        let record = load_session_record(&self.rt.state_dir, &state.container_name)
            .filter(|r| r.location == state.location);
        // the recorded start wins over command-line defaults
        if let Some(record) = &record {
            state.paths.repo_root = record.active.repo_path.clone();
            state.ports.assigned = Some(record.active.port);
        }
        if !status.running {
            info!(container = %state.container_name, "container is not running; nothing to stop");
            if record.is_some() {
                if let Err(err) = clear_session_record(&self.rt.state_dir, &state.container_name) {
                    warn!(error = %err, "could not clear stale session record");
                }
            }
            return Ok(StopReport {
                container: state.container_name.clone(),
                stopped: false,
                volumes_removed: Vec::new(),
                volumes_kept: Vec::new(),
                metadata_deleted: None,
                active: None,
                git_baseline: None,
            });
        }

        let use_volumes = state.flags.use_volumes
            || state.metadata.recovered.as_ref().map(|r| r.use_volumes).unwrap_or(false)
            || record.as_ref().map(|r| r.use_volumes).unwrap_or(false);

        let docker = self.docker(state);
        docker.stop(&state.container_name)?;
        info!(container = %state.container_name, "container stopped");

        let mut volumes_removed = Vec::new();
        let mut volumes_kept = Vec::new();
        if use_volumes {
            let volumes = state.volume_names();
            let targets = match record.as_ref().and_then(|r| r.output_dir.clone().zip(r.synthpop_dir.clone())) {
                Some(dirs) => Ok(dirs),
                None => self
                    .resolve_data_dirs(state, false)
                    .map(|d| (d.output_dir, d.synthpop_dir)),
            };
            let ready = targets.and_then(|t| self.ensure_rsync_image(&docker).map(|_| t));
            match ready {
                Ok((output_dir, synthpop_dir)) => {
                    let is_local = state.location.is_local();
                    for (volume, target) in [(&volumes.output, &output_dir), (&volumes.synthpop, &synthpop_dir)] {
                        if !self.sync_volume_back(&docker, volume, target, is_local) {
                            volumes_kept.push(volume.clone());
                            continue;
                        }
                        match docker.volume_remove(volume) {
                            Ok(()) => volumes_removed.push(volume.clone()),
                            Err(err) => {
                                warn!(volume = %volume, error = %err, "could not remove volume");
                                volumes_kept.push(volume.clone());
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "cannot sync volumes back; keeping them");
                    volumes_kept.push(volumes.output.clone());
                    volumes_kept.push(volumes.synthpop.clone());
                }
            }
        }

        let metadata_deleted = self
            .ssh(state)
            .map(|ssh| ssh.delete_metadata(&self.rt.config.remote.metadata_dir, &state.container_name));

        if let Err(err) = clear_session_record(&self.rt.state_dir, &state.container_name) {
            warn!(error = %err, "could not clear local session record");
        }

        Ok(StopReport {
            container: state.container_name.clone(),
            stopped: true,
            volumes_removed,
            volumes_kept,
            metadata_deleted,
            active: Some(
                record
                    .as_ref()
                    .map(|r| r.active.clone())
                    .unwrap_or_else(|| state.active_session()),
            ),
            git_baseline: record.and_then(|r| r.git_baseline),
        })
    }

    /// Prepares key-based access: local key pair, GitHub host key and, for
    /// remote sessions, authorization on the workstation plus the key
    /// material containers there will mount.
    pub fn setup_access(&self, state: &SessionState, password: Option<&str>) -> Result<AccessReport> {
        let private_key = &state.paths.local_private_key;
        let key_generated = ensure_local_key_pair(self.runner, private_key, &state.user_name)?;
        let github_known_host_added = ensure_github_known_host(self.runner, &state.paths.local_known_hosts)?;
        let mut report = AccessReport {
            private_key: private_key.to_string_lossy().to_string(),
            key_generated,
            github_known_host_added,
            authorization: None,
            ssh_config: None,
            key_material_uploaded: None,
            remote_docker: None,
        };
        let Some(ssh) = self.ssh(state) else {
            return Ok(report);
        };

        let public_key = read_public_key(private_key)?;
        report.authorization = Some(ssh.provision_key(&public_key, &key_marker(&state.user_name), password)?);

        let entry = HostEntry {
            host: ssh.host().to_string(),
            user: ssh.user().to_string(),
            identity_file: private_key.to_string_lossy().to_string(),
        };
        report.ssh_config = Some(ensure_config_entry(&self.rt.local_ssh_dir().join("config"), &entry)?);

        let private_bytes = fs::read(private_key)?;
        let known_hosts_bytes = fs::read(&state.paths.local_known_hosts)?;
        report.key_material_uploaded = Some(ssh.sync_key_material(
            &private_bytes,
            &known_hosts_bytes,
            &state.paths.ssh_private_key,
            &state.paths.known_hosts,
        )?);

        report.remote_docker = ssh.remote_docker_version();
        if report.remote_docker.is_none() {
            return Err(LauncherError::EnvironmentMissing(format!(
                "docker is not available for {} on {}",
                ssh.user(),
                ssh.host()
            )));
        }
        Ok(report)
    }
}
