use crate::error::{LauncherError, ProcessErrorDetails, Result};
use crate::runner::{mask_secrets, CommandOutput, CommandRunner, Invocation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io;
use tracing::{debug, info};

pub const DOCKER_HOST_ENV: &str = "DOCKER_HOST";

/// How an invocation reaches the engine. `--context` and `DOCKER_HOST`
/// conflict, so exactly one mechanism is used per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerTarget {
    Local,
    Context(String),
    Host(String),
}

impl DockerTarget {
    pub fn for_remote(direct_ssh: bool, context_prefix: &str, user: &str, ip: &str) -> Self {
        let uri = ssh_uri(user, ip);
        if direct_ssh {
            DockerTarget::Host(uri)
        } else {
            DockerTarget::Context(context_name(context_prefix, ip))
        }
    }
}

pub fn ssh_uri(user: &str, ip: &str) -> String {
    format!("ssh://{user}@{ip}")
}

pub fn context_name(prefix: &str, ip: &str) -> String {
    let suffix: String = ip
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("{prefix}-{suffix}")
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ContainerRow {
    #[serde(rename(deserialize = "Names"), default)]
    pub name: String,
    #[serde(rename(deserialize = "Status"), default)]
    pub status: String,
    #[serde(rename(deserialize = "Ports"), default)]
    pub ports: String,
    #[serde(rename(deserialize = "Image"), default)]
    pub image: String,
}

impl ContainerRow {
    pub fn is_up(&self) -> bool {
        self.status.starts_with("Up")
    }

    pub fn host_ports(&self) -> Vec<u16> {
        parse_host_ports(&self.ports)
    }
}

/// `0.0.0.0:8787->8787/tcp, :::8787->8787/tcp` -> `[8787]`
pub fn parse_host_ports(ports: &str) -> Vec<u16> {
    let mut found = BTreeSet::new();
    for mapping in ports.split(',') {
        let Some((host_side, _)) = mapping.trim().split_once("->") else {
            continue;
        };
        if let Some(port) = host_side
            .rsplit(':')
            .next()
            .and_then(|p| p.trim().parse::<u16>().ok())
        {
            found.insert(port);
        }
    }
    found.into_iter().collect()
}

pub fn parse_ps_rows(text: &str) -> Vec<ContainerRow> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str::<ContainerRow>(line).ok())
        .collect()
}

/// Connection details read back from `docker inspect`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InspectedRuntime {
    pub password: Option<String>,
    pub port: Option<u16>,
    pub volumes: Vec<String>,
}

pub fn parse_inspect(text: &str, container_port: u16) -> Option<InspectedRuntime> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let item = match value {
        serde_json::Value::Array(mut items) if !items.is_empty() => items.remove(0),
        serde_json::Value::Object(_) => value,
        _ => return None,
    };
    let password = item["Config"]["Env"].as_array().and_then(|env| {
        env.iter()
            .filter_map(|e| e.as_str())
            .find_map(|e| e.strip_prefix("PASSWORD=").map(ToString::to_string))
    });
    let port_key = format!("{container_port}/tcp");
    let port = item["NetworkSettings"]["Ports"][&port_key]
        .as_array()
        .and_then(|bindings| {
            bindings
                .iter()
                .filter_map(|b| b["HostPort"].as_str())
                .find_map(|p| p.parse::<u16>().ok())
        });
    let volumes = item["Mounts"]
        .as_array()
        .map(|mounts| {
            mounts
                .iter()
                .filter(|m| m["Type"].as_str() == Some("volume"))
                .filter_map(|m| m["Name"].as_str().map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default();
    Some(InspectedRuntime {
        password,
        port,
        volumes,
    })
}

pub fn docker_spawn_error_details(err: &io::Error, command: &str) -> ProcessErrorDetails {
    if err.kind() == io::ErrorKind::NotFound {
        return ProcessErrorDetails {
            error_code: "docker_not_found".to_string(),
            hint: Some("Install Docker and ensure `docker` is on your PATH.".to_string()),
            command: Some(command.to_string()),
            raw_stderr: None,
        };
    }
    ProcessErrorDetails {
        error_code: "process_command_failed".to_string(),
        hint: None,
        command: Some(command.to_string()),
        raw_stderr: None,
    }
}

pub fn classify_docker_command_failure(stderr: &str) -> (String, Option<String>) {
    let lower = stderr.to_lowercase();

    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("failed to connect to the docker api")
        || lower.contains("error during connect")
    {
        return (
            "docker_daemon_unreachable".to_string(),
            Some("Docker daemon is unreachable. Start Docker Desktop (or dockerd) and retry.".to_string()),
        );
    }

    if lower.contains("port is already allocated")
        || lower.contains("bind: address already in use")
        || lower.contains("address already in use")
    {
        return (
            "docker_port_conflict".to_string(),
            Some("The requested host port is already in use. Pick another --port.".to_string()),
        );
    }

    if lower.contains("is already in use by container") || lower.contains("conflict. the container name") {
        return (
            "docker_name_conflict".to_string(),
            Some("A container with this name exists. Stop it first with `impactncd stop`.".to_string()),
        );
    }

    if lower.contains("permission denied (publickey")
        || lower.contains("host key verification failed")
        || lower.contains("ssh: connect to host")
    {
        return (
            "docker_ssh_transport".to_string(),
            Some("The remote engine is unreachable over SSH. Run `impactncd ssh setup` and retry.".to_string()),
        );
    }

    if lower.contains("no such file or directory") && lower.contains("mount") {
        return (
            "docker_mount_source_missing".to_string(),
            Some("A bind-mount source does not exist on the Docker host.".to_string()),
        );
    }

    if lower.contains("denied") || lower.contains("unauthorized") || lower.contains("authentication") {
        return (
            "docker_registry_auth".to_string(),
            Some("Authenticate with `docker login` for private base images.".to_string()),
        );
    }

    ("process_command_failed".to_string(), None)
}

pub struct Docker<'a, R: CommandRunner> {
    runner: &'a R,
    target: DockerTarget,
}

impl<'a, R: CommandRunner> Docker<'a, R> {
    pub fn new(runner: &'a R, target: DockerTarget) -> Self {
        Self { runner, target }
    }

    pub fn target(&self) -> &DockerTarget {
        &self.target
    }

    pub fn invocation<I, S>(&self, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let base = Invocation::new("docker");
        let base = match &self.target {
            DockerTarget::Local => base.env_remove(DOCKER_HOST_ENV),
            DockerTarget::Context(name) => base
                .env_remove(DOCKER_HOST_ENV)
                .arg("--context")
                .arg(name.clone()),
            DockerTarget::Host(uri) => base.env(DOCKER_HOST_ENV, uri.clone()),
        };
        base.args(args)
    }

    /// Runs an invocation and returns its output whatever the exit status.
    /// Only a failure to spawn is an error.
    pub fn raw(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let command = mask_secrets(&invocation.rendered());
        self.runner.run(invocation).map_err(|err| {
            let details = docker_spawn_error_details(&err, &command);
            LauncherError::ProcessDetailed {
                message: format!("failed to run command `{command}`: {err}"),
                details,
            }
        })
    }

    /// Runs an invocation and turns a non-zero exit into a classified error.
    pub fn execute(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let command = mask_secrets(&invocation.rendered());
        let output = self.raw(invocation)?;
        if !output.success() {
            let stderr = output.stderr_text();
            let (error_code, hint) = classify_docker_command_failure(&stderr);
            let mut message = format!(
                "command failed with status {} while running `{}`",
                output.status_code, command
            );
            if !stderr.is_empty() {
                message = format!("{message}: {stderr}");
            }
            if let Some(ref hint_message) = hint {
                message = format!("{message}\nHint: {hint_message}");
            }
            return Err(LauncherError::ProcessDetailed {
                message,
                details: ProcessErrorDetails {
                    error_code,
                    hint,
                    command: Some(command),
                    raw_stderr: if stderr.is_empty() { None } else { Some(stderr) },
                },
            });
        }
        Ok(output)
    }

    pub fn run_args<I, S>(&self, args: I) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.execute(&self.invocation(args))
    }

    /// `true` when the invocation exits zero; spawn failures count as `false`.
    pub fn succeeds<I, S>(&self, args: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.raw(&self.invocation(args))
            .map(|o| o.success())
            .unwrap_or(false)
    }

    pub fn daemon_reachable(&self) -> bool {
        self.succeeds(["info", "--format", "{{.ServerVersion}}"])
    }

    pub fn list_user_containers(&self, user: &str) -> Result<Vec<ContainerRow>> {
        let output = self.run_args([
            "ps".to_string(),
            "-a".to_string(),
            "--filter".to_string(),
            format!("name=_{user}"),
            "--format".to_string(),
            "{{json .}}".to_string(),
        ])?;
        Ok(parse_ps_rows(&output.stdout_text()))
    }

    pub fn inspect(&self, name: &str, container_port: u16) -> Option<InspectedRuntime> {
        match self.raw(&self.invocation(["inspect", name])) {
            Ok(output) if output.success() => parse_inspect(&output.stdout_text(), container_port),
            Ok(output) => {
                debug!(container = %name, stderr = %output.stderr_text(), "inspect failed");
                None
            }
            Err(err) => {
                debug!(container = %name, error = %err, "inspect unavailable");
                None
            }
        }
    }

    pub fn image_exists(&self, image: &str) -> bool {
        self.succeeds(["image", "inspect", image])
    }

    pub fn volume_create(&self, name: &str) -> Result<()> {
        self.run_args(["volume", "create", name]).map(|_| ())
    }

    pub fn volume_remove(&self, name: &str) -> Result<()> {
        self.run_args(["volume", "rm", "-f", name]).map(|_| ())
    }

    pub fn stop(&self, name: &str) -> Result<()> {
        self.run_args(["stop", name]).map(|_| ())
    }

    pub fn exec_in(&self, container: &str, user: Option<&str>, command: &[&str]) -> Result<CommandOutput> {
        let mut args: Vec<String> = vec!["exec".to_string()];
        if let Some(user) = user {
            args.push("-u".to_string());
            args.push(user.to_string());
        }
        args.push(container.to_string());
        args.extend(command.iter().map(|c| c.to_string()));
        self.run_args(args)
    }

    /// Creates the named context for `ssh_uri` unless it already exists.
    pub fn ensure_context(&self, name: &str, ssh_uri: &str) -> Result<bool> {
        let local = Docker::new(self.runner, DockerTarget::Local);
        if local.succeeds(["context", "inspect", name]) {
            return Ok(false);
        }
        local.run_args([
            "context".to_string(),
            "create".to_string(),
            name.to_string(),
            "--docker".to_string(),
            format!("host={ssh_uri}"),
        ])?;
        info!(context = %name, host = %ssh_uri, "created docker context");
        Ok(true)
    }
}
