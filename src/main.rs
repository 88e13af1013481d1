mod config;
mod docker;
mod error;
mod git_notify;
mod github;
mod lifecycle;
mod logging;
mod metadata;
mod paths;
mod readiness;
mod run_args;
mod runner;
mod session;
mod sim_design;
mod ssh;

use clap::{Args, Parser, Subcommand};
use config::{
    load_config_or_default, read_config, resolve_config_path, state_dir_for,
    write_atomic_text_file, RuntimeConfig, DEFAULT_CONFIG_YAML,
};
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Input, Password};
use error::{LauncherError, ProcessErrorDetails, Result};
use git_notify::{
    notify_changes, ChangePrompt, DialoguerPrompt, NonInteractivePrompt, PresetPrompt, RepoGit,
};
use github::{resolve_token, GitHubKeyClient};
use lifecycle::{Orchestrator, StartOptions};
use metadata::load_session_record;
use paths::to_docker_mount_path;
use run_args::{build_run_args, RunOptions};
use runner::{mask_secrets, render_command, SystemRunner};
use serde::Serialize;
use serde_json::json;
use session::{SessionFlags, SessionRequest, SessionState};
use ssh::keys::read_public_key;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Parser, Debug)]
#[command(name = "impactncd", version, about = "IMPACTncd RStudio container launcher")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, global = true)]
    debug: bool,
    #[arg(long, global = true)]
    non_interactive: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Check that docker, ssh and git are usable.
    Doctor,
    /// Show the user's containers and the state of the selected one.
    Status {
        #[command(flatten)]
        session: SessionArgs,
    },
    Start {
        #[command(flatten)]
        session: SessionArgs,
        /// RStudio login password.
        #[arg(long, env = "IMPACTNCD_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long, default_value_t = false)]
        use_volumes: bool,
        #[arg(long, default_value_t = false)]
        rebuild: bool,
        #[arg(long, default_value_t = false)]
        high_compute: bool,
        /// Extra `docker run` tokens, whitespace separated.
        #[arg(long, default_value = "", allow_hyphen_values = true)]
        custom_params: String,
        /// Print the `docker run` arguments without touching docker.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[arg(long, default_value_t = false)]
        no_wait: bool,
    },
    Stop {
        #[command(flatten)]
        session: SessionArgs,
        /// Commit leftover repository changes with this message.
        #[arg(long)]
        commit_message: Option<String>,
        #[arg(long, default_value_t = false, requires = "commit_message")]
        push: bool,
    },
    Ssh {
        #[command(subcommand)]
        command: SshCommand,
    },
    Github {
        #[command(subcommand)]
        command: GithubCommand,
    },
    /// Translate a host path into the form docker expects as a mount source.
    MountPath {
        path: String,
        #[arg(long, default_value_t = false)]
        remote: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
    Show,
}

#[derive(Subcommand, Debug)]
enum SshCommand {
    /// Generate keys and authorize them for GitHub and the remote workstation.
    Setup {
        #[command(flatten)]
        session: SessionArgs,
        /// Remote account password, used once to install the public key.
        #[arg(long, env = "IMPACTNCD_SSH_PASSWORD", hide_env_values = true)]
        ssh_password: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum GithubCommand {
    AddKey {
        #[arg(long)]
        title: String,
        /// Public key file; defaults to `~/.ssh/id_ed25519_<user>.pub`.
        #[arg(long)]
        key_file: Option<PathBuf>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        token: Option<String>,
    },
    RemoveKey {
        id: u64,
        #[arg(long)]
        token: Option<String>,
    },
}

#[derive(Args, Debug, Clone)]
struct SessionArgs {
    #[arg(long)]
    user: Option<String>,
    /// `LOCAL` or `REMOTE@<ip>`.
    #[arg(long, default_value = "LOCAL")]
    location: String,
    #[arg(long)]
    repo: Option<String>,
    #[arg(long)]
    repo_path: Option<String>,
    #[arg(long)]
    remote_user: Option<String>,
    /// Reach the remote engine through `DOCKER_HOST` instead of a docker context.
    #[arg(long, default_value_t = false)]
    direct_ssh: bool,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ProcessErrorDetails>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Credentials {
    user: String,
    password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CredentialOutcome {
    Next(Credentials),
    Cancel,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    ok: bool,
    severity: String,
    message: String,
    remediation: String,
}

fn main() {
    let cli = Cli::parse();
    let json = cli.json;
    if let Err(err) = run(cli) {
        if json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_details: err.details(),
            };
            if let Err(print_err) = print_json(&payload) {
                eprintln!("{print_err}");
            }
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config_path = resolve_config_path(cli.config.as_ref());
    // `config validate` reports the parse error itself.
    let config = match &cli.command {
        Commands::Config { .. } => load_config_or_default(&config_path).unwrap_or_default(),
        _ => load_config_or_default(&config_path)?,
    };
    logging::init(cli.debug, &config.logging);
    let rt = RuntimeConfig {
        state_dir: state_dir_for(&config_path),
        config,
        config_path,
        debug: cli.debug,
        non_interactive: cli.non_interactive,
        json: cli.json,
    };
    debug!(config = %rt.config_path.display(), "configuration resolved");
    let runner = SystemRunner;

    match cli.command {
        Commands::Config { command } => handle_config(&rt, command),
        Commands::Doctor => handle_doctor(&rt, &runner),
        Commands::Status { session } => handle_status(&rt, &runner, &session),
        Commands::Start {
            session,
            password,
            port,
            use_volumes,
            rebuild,
            high_compute,
            custom_params,
            dry_run,
            no_wait,
        } => {
            let flags = SessionFlags {
                debug: rt.debug,
                direct_ssh: session.direct_ssh,
                use_volumes,
                rebuild,
                high_compute,
            };
            let mut state = build_session(&rt, &session, password, true, port, flags)?;
            if dry_run {
                handle_start_dry_run(&rt, &runner, &mut state, &custom_params)
            } else {
                handle_start(&rt, &runner, &mut state, &custom_params, !no_wait)
            }
        }
        Commands::Stop {
            session,
            commit_message,
            push,
        } => handle_stop(&rt, &runner, &session, commit_message, push),
        Commands::Ssh { command } => match command {
            SshCommand::Setup {
                session,
                ssh_password,
            } => handle_ssh_setup(&rt, &runner, &session, ssh_password),
        },
        Commands::Github { command } => handle_github(&rt, command),
        Commands::MountPath { path, remote } => output(
            &rt,
            json!({"path": path, "mount_source": to_docker_mount_path(&path, !remote)}),
        ),
    }
}

fn handle_config(rt: &RuntimeConfig, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Init => {
            if rt.config_path.exists() {
                return output(rt, json!({"path": rt.config_path, "created": false}));
            }
            write_atomic_text_file(&rt.config_path, DEFAULT_CONFIG_YAML, None)?;
            output(rt, json!({"path": rt.config_path, "created": true}))
        }
        ConfigCommand::Validate => {
            let _cfg = read_config(&rt.config_path)?;
            output(rt, json!({"path": rt.config_path, "valid": true}))
        }
        ConfigCommand::Show => {
            let cfg = load_config_or_default(&rt.config_path)?;
            if rt.json {
                return output(
                    rt,
                    json!({"path": rt.config_path, "exists": rt.config_path.exists(), "config": cfg}),
                );
            }
            print!("{}", serde_yaml::to_string(&cfg)?);
            Ok(())
        }
    }
}

/// Fills in whatever the command line left out, prompting when allowed.
fn gather_credentials(
    rt: &RuntimeConfig,
    user: Option<String>,
    password: Option<String>,
    need_password: bool,
) -> Result<CredentialOutcome> {
    let interactive = !rt.non_interactive && !rt.json;
    let user = match user.filter(|u| !u.trim().is_empty()) {
        Some(user) => user,
        None if interactive => {
            let entered: String = Input::with_theme(&ColorfulTheme::default())
                .with_prompt("User name (leave empty to cancel)")
                .allow_empty(true)
                .interact_text()?;
            if entered.trim().is_empty() {
                return Ok(CredentialOutcome::Cancel);
            }
            entered
        }
        None => return Err(LauncherError::Config("--user is required".to_string())),
    };
    let password = match password.filter(|p| !p.trim().is_empty()) {
        Some(password) => Some(password),
        None if !need_password => None,
        None if interactive => {
            let entered = Password::with_theme(&ColorfulTheme::default())
                .with_prompt("RStudio password (leave empty to cancel)")
                .allow_empty_password(true)
                .interact()?;
            if entered.trim().is_empty() {
                return Ok(CredentialOutcome::Cancel);
            }
            Some(entered)
        }
        None => {
            return Err(LauncherError::Config(
                "--password (or IMPACTNCD_PASSWORD) is required".to_string(),
            ))
        }
    };
    Ok(CredentialOutcome::Next(Credentials { user, password }))
}

fn build_session(
    rt: &RuntimeConfig,
    args: &SessionArgs,
    password: Option<String>,
    need_password: bool,
    port: Option<u16>,
    flags: SessionFlags,
) -> Result<SessionState> {
    let credentials = match gather_credentials(rt, args.user.clone(), password, need_password)? {
        CredentialOutcome::Next(credentials) => credentials,
        CredentialOutcome::Cancel => return Err(LauncherError::Cancelled),
    };
    let request = SessionRequest {
        user: credentials.user,
        password: credentials.password,
        location: args.location.clone(),
        repo: args.repo.clone(),
        repo_path: args.repo_path.clone(),
        remote_user: args.remote_user.clone(),
        port,
        flags,
    };
    SessionState::from_request(rt, &request)
}

fn session_flags(rt: &RuntimeConfig, args: &SessionArgs) -> SessionFlags {
    SessionFlags {
        debug: rt.debug,
        direct_ssh: args.direct_ssh,
        ..SessionFlags::default()
    }
}

fn doctor_check(id: &str, ok: bool, severity: &str, message: &str, remediation: &str) -> DoctorCheck {
    DoctorCheck {
        id: id.to_string(),
        ok,
        severity: severity.to_string(),
        message: message.to_string(),
        remediation: remediation.to_string(),
    }
}

fn handle_doctor(rt: &RuntimeConfig, runner: &SystemRunner) -> Result<()> {
    let mut checks = Vec::new();
    for (tool, severity, remediation) in [
        ("docker", "error", "Install Docker Desktop (or docker engine) and make sure `docker` is on PATH."),
        ("ssh", "error", "Install the OpenSSH client."),
        ("git", "error", "Install git."),
        ("ssh-keygen", "error", "Install the OpenSSH client tools."),
        ("sshpass", "warning", "Install sshpass for the one-time password bootstrap of remote keys."),
    ] {
        let found = which::which(tool).is_ok();
        let message = if found {
            format!("{tool} found")
        } else {
            format!("{tool} is not installed or not in PATH")
        };
        checks.push(doctor_check(tool, found, severity, &message, remediation));
    }
    let daemon_ok = checks.first().map(|c| c.ok).unwrap_or(false)
        && docker::Docker::new(runner, docker::DockerTarget::Local).daemon_reachable();
    checks.push(doctor_check(
        "docker_daemon",
        daemon_ok,
        "error",
        if daemon_ok {
            "docker daemon reachable"
        } else {
            "docker daemon is unreachable"
        },
        "Start Docker Desktop (or dockerd) and rerun `impactncd doctor`.",
    ));

    let ok = !checks.iter().any(|c| !c.ok && c.severity == "error");
    if rt.json {
        let primary_error = checks
            .iter()
            .find(|c| !c.ok && c.severity == "error")
            .map(|c| c.message.clone());
        return print_json(&JsonResult {
            ok,
            result: Some(json!({ "checks": checks })),
            error: primary_error,
            error_details: None,
        });
    }
    for check in &checks {
        let state = if check.ok { "ok" } else { "fail" };
        println!("[{}] {} ({}) - {}", state, check.id, check.severity, check.message);
        if !check.ok {
            println!("  remediation: {}", check.remediation);
        }
    }
    if ok {
        return Ok(());
    }
    Err(LauncherError::EnvironmentMissing(
        checks
            .iter()
            .find(|c| !c.ok && c.severity == "error")
            .map(|c| c.message.clone())
            .unwrap_or_else(|| "one or more checks failed".to_string()),
    ))
}

fn handle_status(rt: &RuntimeConfig, runner: &SystemRunner, args: &SessionArgs) -> Result<()> {
    let mut state = build_session(rt, args, None, false, None, session_flags(rt, args))?;
    let orchestrator = Orchestrator::new(rt, runner);
    orchestrator.ensure_daemon(&mut state)?;
    let status = orchestrator.detect_status(&mut state)?;
    let record = load_session_record(&rt.state_dir, &state.container_name);
    let url = status
        .running
        .then(|| readiness::server_url(&state.server_host(), state.active_session().port));
    output(
        rt,
        json!({
            "location": state.location.to_string(),
            "status": status,
            "url": url,
            "record": record,
        }),
    )
}

fn handle_start_dry_run(
    rt: &RuntimeConfig,
    runner: &SystemRunner,
    state: &mut SessionState,
    custom_params: &str,
) -> Result<()> {
    let orchestrator = Orchestrator::new(rt, runner);
    orchestrator.resolve_data_dirs(state, false)?;
    let image = rt.image_for_repo(&state.selected_repo);
    let options = RunOptions::for_session(state, &rt.config.docker, &image, custom_params);
    let args = build_run_args(state, &options);
    let command = mask_secrets(&render_command("docker", &args));
    if !rt.json {
        println!("{command}");
        return Ok(());
    }
    output(
        rt,
        json!({
            "container": state.container_name,
            "image": image,
            "args": args,
            "command": command,
        }),
    )
}

fn handle_start(
    rt: &RuntimeConfig,
    runner: &SystemRunner,
    state: &mut SessionState,
    custom_params: &str,
    wait: bool,
) -> Result<()> {
    let options = StartOptions {
        image: rt.image_for_repo(&state.selected_repo),
        custom_params: custom_params.to_string(),
        wait,
    };
    let report = Orchestrator::new(rt, runner).start(state, &options)?;
    if !rt.json {
        println!("RStudio for {} is at {}", report.container, report.url);
        println!("Log in as user 'rstudio' with the password you provided.");
        if report.server_ready == Some(false) {
            println!("The server has not answered yet; it may still be starting.");
        }
        return Ok(());
    }
    output(rt, serde_json::to_value(&report)?)
}

fn handle_stop(
    rt: &RuntimeConfig,
    runner: &SystemRunner,
    args: &SessionArgs,
    commit_message: Option<String>,
    push: bool,
) -> Result<()> {
    let mut state = build_session(rt, args, None, false, None, session_flags(rt, args))?;
    let orchestrator = Orchestrator::new(rt, runner);
    let report = orchestrator.stop(&mut state)?;

    let git = match &report.active {
        Some(active) if report.stopped => {
            let prompt: Box<dyn ChangePrompt> = match commit_message {
                Some(message) => Box::new(PresetPrompt { message, push }),
                None if rt.non_interactive || rt.json => Box::new(NonInteractivePrompt),
                None => Box::new(DialoguerPrompt),
            };
            let ssh = orchestrator.ssh(&state);
            let (repo_git, push_key) = match &ssh {
                Some(ssh) => (
                    RepoGit::remote(runner, ssh, &active.repo_path),
                    state.paths.ssh_private_key.clone(),
                ),
                None => (
                    RepoGit::local(runner, &active.repo_path),
                    state.paths.local_private_key.to_string_lossy().to_string(),
                ),
            };
            match notify_changes(&repo_git, prompt.as_ref(), &push_key, report.git_baseline.as_ref()) {
                Ok(notify) => Some(serde_json::to_value(&notify)?),
                Err(err) => {
                    warn!(error = %err, "change notification failed");
                    Some(json!({"error": err.to_string()}))
                }
            }
        }
        _ => None,
    };

    if !rt.json {
        if report.stopped {
            println!("Stopped {}", report.container);
        } else {
            println!("{} is not running", report.container);
        }
        for volume in &report.volumes_kept {
            println!("Kept volume {volume}: its contents could not be copied back");
        }
        if let Some(git) = &git {
            println!("git: {git}");
        }
        return Ok(());
    }
    output(rt, json!({"stop": report, "git": git}))
}

fn handle_ssh_setup(
    rt: &RuntimeConfig,
    runner: &SystemRunner,
    args: &SessionArgs,
    ssh_password: Option<String>,
) -> Result<()> {
    let state = build_session(rt, args, None, false, None, session_flags(rt, args))?;
    let orchestrator = Orchestrator::new(rt, runner);
    let report = match orchestrator.setup_access(&state, ssh_password.as_deref()) {
        Err(LauncherError::SshAccess(reason))
            if ssh_password.is_none() && !rt.non_interactive && !rt.json && state.is_remote() =>
        {
            warn!(reason = %reason, "key authentication failed; asking for the remote password");
            let password = Password::with_theme(&ColorfulTheme::default())
                .with_prompt(format!(
                    "Password for {}@{}",
                    state.remote_user.as_deref().unwrap_or_default(),
                    state.server_host()
                ))
                .interact()?;
            orchestrator.setup_access(&state, Some(&password))?
        }
        other => other?,
    };
    output(rt, serde_json::to_value(&report)?)
}

fn handle_github(rt: &RuntimeConfig, command: GithubCommand) -> Result<()> {
    match command {
        GithubCommand::AddKey {
            title,
            key_file,
            user,
            token,
        } => {
            let key = match (key_file, user) {
                (Some(path), _) => fs::read_to_string(&path)?.trim().to_string(),
                (None, Some(user)) => {
                    let user = session::normalize_user_name(&user);
                    read_public_key(&rt.local_ssh_dir().join(session::key_file_name(&user)))?
                }
                (None, None) => {
                    return Err(LauncherError::Config(
                        "pass --key-file or --user to choose the public key".to_string(),
                    ))
                }
            };
            let client = GitHubKeyClient::new(&rt.config.github.api_url, &resolve_token(token.as_deref())?)?;
            let id = client.add_key(&title, &key)?;
            output(rt, json!({"id": id, "title": title}))
        }
        GithubCommand::RemoveKey { id, token } => {
            let client = GitHubKeyClient::new(&rt.config.github.api_url, &resolve_token(token.as_deref())?)?;
            client.remove_key(id)?;
            output(rt, json!({"id": id, "removed": true}))
        }
    }
}

fn output(rt: &RuntimeConfig, payload: serde_json::Value) -> Result<()> {
    if rt.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
