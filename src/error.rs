use serde::Serialize;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LauncherError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("missing environment: {0}")]
    EnvironmentMissing(String),
    #[error("cannot continue: {0}")]
    SshAccess(String),
    #[error("{0}")]
    Precondition(String),
    #[error("image build failed: {message}\n{output}")]
    Build { message: String, output: String },
    #[error("container failed to start: {0}")]
    ContainerStart(String),
    #[error("github api error: HTTP {status}: {body}")]
    GitHub { status: u16, body: String },
    #[error("process error: {0}")]
    Process(String),
    #[error("process error: {message}")]
    ProcessDetailed {
        message: String,
        details: ProcessErrorDetails,
    },
    #[error("cancelled by user")]
    Cancelled,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessErrorDetails {
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_stderr: Option<String>,
}

impl LauncherError {
    /// Stable machine-readable code for the `--json` envelope.
    pub fn error_code(&self) -> &str {
        match self {
            LauncherError::Config(_) | LauncherError::Yaml(_) => "config_invalid",
            LauncherError::Io(_) => "io_error",
            LauncherError::Prompt(_) => "prompt_failed",
            LauncherError::Json(_) => "json_invalid",
            LauncherError::Http(_) => "http_error",
            LauncherError::EnvironmentMissing(_) => "environment_missing",
            LauncherError::SshAccess(_) => "ssh_access_denied",
            LauncherError::Precondition(_) => "precondition_failed",
            LauncherError::Build { .. } => "image_build_failed",
            LauncherError::ContainerStart(_) => "container_start_failed",
            LauncherError::GitHub { .. } => "github_api_error",
            LauncherError::Process(_) => "process_command_failed",
            LauncherError::ProcessDetailed { details, .. } => details.error_code.as_str(),
            LauncherError::Cancelled => "cancelled",
        }
    }

    pub fn details(&self) -> Option<ProcessErrorDetails> {
        match self {
            LauncherError::ProcessDetailed { details, .. } => Some(details.clone()),
            LauncherError::Build { output, .. } => Some(ProcessErrorDetails {
                error_code: self.error_code().to_string(),
                hint: Some("Check the Dockerfile under docker_setup/ and rerun with --rebuild.".to_string()),
                command: None,
                raw_stderr: if output.trim().is_empty() {
                    None
                } else {
                    Some(output.clone())
                },
            }),
            LauncherError::EnvironmentMissing(_) | LauncherError::SshAccess(_) => {
                Some(ProcessErrorDetails {
                    error_code: self.error_code().to_string(),
                    hint: None,
                    command: None,
                    raw_stderr: None,
                })
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, LauncherError>;
