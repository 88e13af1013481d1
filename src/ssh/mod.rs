//! Everything that reaches the remote workstation goes through [`SshGateway`].
//!
//! Transport failures are logged and folded into `bool`/`Option` results.
//! Only the key authorization probe in [`SshGateway::provision_key`] treats
//! a total failure as fatal.

pub mod config;
pub mod keys;

use crate::error::{LauncherError, Result};
use crate::metadata::{remote_metadata_path, RunMetadata};
use crate::runner::{shell_single_quote, CommandOutput, CommandRunner, Invocation};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;
use std::io;
use tracing::{debug, info, warn};

/// OpenSSH reserves exit status 255 for its own errors.
const SSH_TRANSPORT_EXIT: i32 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAuthorization {
    AlreadyAuthorized,
    PasswordHelper,
    LegacyPlink,
}

pub struct SshGateway<'a, R: CommandRunner> {
    runner: &'a R,
    user: String,
    host: String,
    identity_file: String,
    connect_timeout_sec: u64,
}

impl<'a, R: CommandRunner> SshGateway<'a, R> {
    pub fn new(
        runner: &'a R,
        user: &str,
        host: &str,
        identity_file: &str,
        connect_timeout_sec: u64,
    ) -> Self {
        Self {
            runner,
            user: user.to_string(),
            host: host.to_string(),
            identity_file: identity_file.to_string(),
            connect_timeout_sec,
        }
    }

    pub fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    fn invocation(&self, command: &str) -> Invocation {
        Invocation::new("ssh").args([
            "-i".to_string(),
            self.identity_file.clone(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_sec),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            self.target(),
            command.to_string(),
        ])
    }

    /// Runs `command` on the remote host. A non-zero exit of the remote
    /// command is returned as output; only transport failures are errors.
    pub fn exec(&self, command: &str) -> Result<CommandOutput> {
        let invocation = self.invocation(command);
        let output = self.runner.run(&invocation).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                LauncherError::EnvironmentMissing(
                    "ssh client not found; install OpenSSH and ensure `ssh` is on your PATH".to_string(),
                )
            } else {
                LauncherError::Process(format!("failed to run ssh: {err}"))
            }
        })?;
        if output.status_code == SSH_TRANSPORT_EXIT {
            return Err(LauncherError::Process(format!(
                "ssh transport to {} failed: {}",
                self.target(),
                output.stderr_text()
            )));
        }
        Ok(output)
    }

    pub fn run_ok(&self, command: &str) -> bool {
        match self.exec(command) {
            Ok(output) => {
                if !output.success() {
                    debug!(host = %self.host, status = output.status_code, "remote command returned non-zero");
                }
                output.success()
            }
            Err(err) => {
                warn!(host = %self.host, error = %err, "remote command unavailable");
                false
            }
        }
    }

    pub fn capture(&self, command: &str) -> Option<String> {
        match self.exec(command) {
            Ok(output) if output.success() => Some(output.stdout_text()),
            Ok(output) => {
                debug!(host = %self.host, status = output.status_code, stderr = %output.stderr_text(), "remote command returned non-zero");
                None
            }
            Err(err) => {
                warn!(host = %self.host, error = %err, "remote command unavailable");
                None
            }
        }
    }

    pub fn dir_exists(&self, path: &str) -> bool {
        self.run_ok(&format!("test -d {}", shell_single_quote(path)))
    }

    pub fn file_exists(&self, path: &str) -> bool {
        self.run_ok(&format!("test -f {}", shell_single_quote(path)))
    }

    pub fn probe(&self) -> bool {
        match self.exec("echo ok") {
            Ok(output) => output.success() && output.stdout_text().trim() == "ok",
            Err(err) => {
                debug!(host = %self.host, error = %err, "key probe failed");
                false
            }
        }
    }

    pub fn remote_docker_version(&self) -> Option<String> {
        self.capture("docker --version")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Makes sure `public_key` is accepted by the remote account.
    ///
    /// Order: existing key auth, then the `sshpass` password helper, then the
    /// legacy `plink` path. If the key still does not work afterwards the
    /// caller cannot continue.
    pub fn provision_key(
        &self,
        public_key: &str,
        marker: &str,
        password: Option<&str>,
    ) -> Result<KeyAuthorization> {
        if self.probe() {
            debug!(host = %self.host, "key authentication already works");
            return Ok(KeyAuthorization::AlreadyAuthorized);
        }
        let Some(password) = password.filter(|p| !p.is_empty()) else {
            return Err(LauncherError::SshAccess(format!(
                "key authentication to {} failed and no password was provided for the one-time bootstrap",
                self.target()
            )));
        };
        let script = keys::authorize_script(public_key, marker);
        let remote_command = encoded_script_command(&script);

        let mut method = None;
        match self.bootstrap_with_helper(&remote_command, password) {
            Ok(true) => method = Some(KeyAuthorization::PasswordHelper),
            Ok(false) => warn!(host = %self.host, "password helper did not authorize the key"),
            Err(err) => warn!(host = %self.host, error = %err, "password helper unavailable"),
        }
        if method.is_none() {
            match self.bootstrap_with_plink(&remote_command, password) {
                Ok(true) => method = Some(KeyAuthorization::LegacyPlink),
                Ok(false) => warn!(host = %self.host, "plink did not authorize the key"),
                Err(err) => warn!(host = %self.host, error = %err, "plink unavailable"),
            }
        }
        let Some(method) = method else {
            return Err(LauncherError::SshAccess(format!(
                "could not install the public key on {}; check the password and that sshpass or plink is installed",
                self.target()
            )));
        };
        if !self.probe() {
            return Err(LauncherError::SshAccess(format!(
                "public key was installed on {} but key authentication still fails",
                self.target()
            )));
        }
        info!(host = %self.host, ?method, "public key authorized");
        Ok(method)
    }

    fn bootstrap_with_helper(&self, remote_command: &str, password: &str) -> Result<bool> {
        let invocation = Invocation::new("sshpass")
            .args([
                "-e".to_string(),
                "ssh".to_string(),
                "-o".to_string(),
                "StrictHostKeyChecking=accept-new".to_string(),
                "-o".to_string(),
                "PreferredAuthentications=password,keyboard-interactive".to_string(),
                "-o".to_string(),
                "PubkeyAuthentication=no".to_string(),
                "-o".to_string(),
                format!("ConnectTimeout={}", self.connect_timeout_sec),
                self.target(),
                remote_command.to_string(),
            ])
            .env("SSHPASS", password);
        let output = self.runner.run(&invocation)?;
        Ok(output.success())
    }

    fn bootstrap_with_plink(&self, remote_command: &str, password: &str) -> Result<bool> {
        let invocation = Invocation::new("plink").args([
            "-batch".to_string(),
            "-ssh".to_string(),
            "-pw".to_string(),
            password.to_string(),
            self.target(),
            remote_command.to_string(),
        ]);
        let output = self.runner.run(&invocation)?;
        Ok(output.success())
    }

    pub fn write_metadata(&self, metadata_dir: &str, metadata: &RunMetadata) -> bool {
        let payload = match serde_json::to_string(metadata) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "could not serialize run metadata");
                return false;
            }
        };
        let path = remote_metadata_path(metadata_dir, &metadata.container);
        let command = format!(
            "mkdir -p {dir} && umask 077 && echo {b64} | base64 -d > {path}",
            dir = shell_single_quote(metadata_dir),
            b64 = STANDARD.encode(payload.as_bytes()),
            path = shell_single_quote(&path),
        );
        let ok = self.run_ok(&command);
        if !ok {
            warn!(path = %path, "failed to write remote run metadata");
        }
        ok
    }

    pub fn read_metadata(&self, metadata_dir: &str, container: &str) -> Option<RunMetadata> {
        let path = remote_metadata_path(metadata_dir, container);
        let content = self.capture(&format!("cat {} 2>/dev/null", shell_single_quote(&path)))?;
        match serde_json::from_str(content.trim()) {
            Ok(meta) => Some(meta),
            Err(err) => {
                warn!(path = %path, error = %err, "remote run metadata is corrupt");
                None
            }
        }
    }

    pub fn delete_metadata(&self, metadata_dir: &str, container: &str) -> bool {
        let path = remote_metadata_path(metadata_dir, container);
        self.run_ok(&format!("rm -f {}", shell_single_quote(&path)))
    }

    /// Copies the operator's private key and GitHub known-hosts file to the
    /// remote so containers started there can mount them. Files whose remote
    /// copy already matches are left alone; returns whether anything was
    /// written.
    pub fn sync_key_material(
        &self,
        private_key: &[u8],
        known_hosts: &[u8],
        remote_private_key: &str,
        remote_known_hosts: &str,
    ) -> Result<bool> {
        let mut uploaded = false;
        for (content, path) in [(private_key, remote_private_key), (known_hosts, remote_known_hosts)] {
            let b64 = STANDARD.encode(content);
            let quoted = shell_single_quote(path);
            if self.run_ok(&format!("echo {b64} | base64 -d | cmp -s - {quoted}")) {
                debug!(host = %self.host, path = %path, "remote copy is current");
                continue;
            }
            let dir = path.rsplit_once('/').map(|(d, _)| d).unwrap_or(".");
            let command = format!(
                "mkdir -p {dir} && umask 077 && echo {b64} | base64 -d > {quoted} && chmod 600 {quoted}",
                dir = shell_single_quote(dir),
            );
            let output = self.exec(&command)?;
            if !output.success() {
                return Err(LauncherError::Process(format!(
                    "failed to upload {path} to {}: {}",
                    self.target(),
                    output.stderr_text()
                )));
            }
            info!(host = %self.host, path = %path, "key material uploaded");
            uploaded = true;
        }
        Ok(uploaded)
    }
}

/// Ships a script as base64 so no shell quoting survives the transport.
pub fn encoded_script_command(script: &str) -> String {
    format!("echo {} | base64 -d | sh", STANDARD.encode(script.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::MockRunner;

    fn gateway(runner: &MockRunner) -> SshGateway<'_, MockRunner> {
        SshGateway::new(runner, "php-workstation", "10.0.0.5", "/keys/id_ed25519_bob", 10)
    }

    fn decode_payload(rendered: &str) -> String {
        let b64 = rendered
            .split_whitespace()
            .skip_while(|part| part.trim_start_matches('"') != "echo")
            .nth(1)
            .expect("payload");
        String::from_utf8(STANDARD.decode(b64).unwrap()).unwrap()
    }

    #[test]
    fn exec_uses_batch_mode_identity_and_timeout() {
        let runner = MockRunner::new();
        let ssh = gateway(&runner);
        ssh.exec("true").unwrap();
        let call = &runner.calls()[0];
        assert_eq!(call.program, "ssh");
        assert!(call.args.windows(2).any(|w| w == ["-i", "/keys/id_ed25519_bob"]));
        assert!(call.args.contains(&"BatchMode=yes".to_string()));
        assert!(call.args.contains(&"ConnectTimeout=10".to_string()));
        assert_eq!(call.args[call.args.len() - 2], "php-workstation@10.0.0.5");
        assert_eq!(call.args.last().unwrap(), "true");
    }

    #[test]
    fn transport_failures_become_false_and_none() {
        let runner = MockRunner::new();
        runner.on_stderr("ssh", 255, "Connection refused");
        let ssh = gateway(&runner);
        assert!(ssh.exec("true").is_err());
        assert!(!ssh.dir_exists("/data"));
        assert!(ssh.capture("cat x").is_none());
        assert!(!ssh.probe());
    }

    #[test]
    fn missing_ssh_binary_is_environment_error() {
        let runner = MockRunner::new();
        runner.missing_program("ssh");
        let err = gateway(&runner).exec("true").unwrap_err();
        assert!(matches!(err, LauncherError::EnvironmentMissing(_)));
    }

    #[test]
    fn provision_skips_bootstrap_when_key_works() {
        let runner = MockRunner::new();
        runner.on("echo ok", 0, "ok\n");
        let result = gateway(&runner)
            .provision_key("ssh-ed25519 AAAA", "impactncd-key-bob", None)
            .unwrap();
        assert_eq!(result, KeyAuthorization::AlreadyAuthorized);
        assert_eq!(runner.count_matching("sshpass"), 0);
    }

    #[test]
    fn provision_without_password_cannot_continue() {
        let runner = MockRunner::new();
        runner.on("echo ok", 255, "");
        let err = gateway(&runner)
            .provision_key("ssh-ed25519 AAAA", "impactncd-key-bob", None)
            .unwrap_err();
        assert!(matches!(err, LauncherError::SshAccess(_)));
    }

    #[test]
    fn provision_falls_back_to_plink_when_helper_missing() {
        // First probe fails, the re-probe after plink succeeds.
        struct Sequenced {
            inner: MockRunner,
            probes: std::cell::Cell<u32>,
        }
        impl CommandRunner for Sequenced {
            fn run(&self, invocation: &Invocation) -> std::result::Result<CommandOutput, io::Error> {
                if invocation.program == "ssh" && invocation.rendered().ends_with("\"echo ok\"") {
                    let n = self.probes.get();
                    self.probes.set(n + 1);
                    let ok = n > 0;
                    return Ok(CommandOutput {
                        status_code: if ok { 0 } else { 255 },
                        stdout: if ok { b"ok\n".to_vec() } else { Vec::new() },
                        stderr: Vec::new(),
                    });
                }
                self.inner.run(invocation)
            }
        }
        let inner = MockRunner::new();
        inner.missing_program("sshpass");
        let runner = Sequenced {
            inner,
            probes: std::cell::Cell::new(0),
        };
        let ssh = SshGateway::new(&runner, "svc", "10.0.0.5", "/k", 10);
        let method = ssh
            .provision_key("ssh-ed25519 AAAA bob", "impactncd-key-bob", Some("pw"))
            .unwrap();
        assert_eq!(method, KeyAuthorization::LegacyPlink);
        let calls = runner.inner.calls();
        let plink = calls.iter().find(|c| c.program == "plink").expect("plink call");
        assert!(plink.args.windows(2).any(|w| w == ["-pw", "pw"]));
        let script = decode_payload(&plink.rendered());
        assert!(script.contains("impactncd-key-bob"));
    }

    #[test]
    fn helper_receives_password_through_environment() {
        let runner = MockRunner::new();
        runner.on("echo ok", 1, "");
        let ssh = gateway(&runner);
        let err = ssh
            .provision_key("ssh-ed25519 AAAA", "impactncd-key-bob", Some("s3cret"))
            .unwrap_err();
        // sshpass "succeeds" in the mock but the key still does not work.
        assert!(err.to_string().contains("still fails"));
        let helper = runner
            .calls()
            .into_iter()
            .find(|c| c.program == "sshpass")
            .expect("sshpass call");
        assert_eq!(helper.env.get("SSHPASS").map(String::as_str), Some("s3cret"));
        assert!(!helper.rendered().contains("s3cret"));
    }

    #[test]
    fn metadata_is_base64_encoded_with_umask() {
        let runner = MockRunner::new();
        let ssh = gateway(&runner);
        let meta = RunMetadata::new("repo_bob", "repo", "bob", "it's quoted", 8787, false);
        assert!(ssh.write_metadata("/tmp/impactncd", &meta));
        let rendered = runner.rendered_calls().remove(0);
        assert!(rendered.contains("umask 077"));
        assert!(!rendered.contains("it's quoted"));
        let decoded: RunMetadata = serde_json::from_str(&decode_payload(&rendered)).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn metadata_read_and_delete() {
        let runner = MockRunner::new();
        let meta = RunMetadata::new("repo_bob", "repo", "bob", "pw", 8788, true);
        runner.on("cat '/tmp/impactncd/repo_bob.json'", 0, &serde_json::to_string(&meta).unwrap());
        let ssh = gateway(&runner);
        assert_eq!(ssh.read_metadata("/tmp/impactncd", "repo_bob"), Some(meta));
        assert!(ssh.delete_metadata("/tmp/impactncd", "repo_bob"));
        assert_eq!(runner.count_matching("rm -f '/tmp/impactncd/repo_bob.json'"), 1);
    }

    #[test]
    fn key_material_upload_skipped_when_current() {
        let runner = MockRunner::new();
        let ssh = gateway(&runner);
        let uploaded = ssh
            .sync_key_material(b"key", b"hosts", "/home/svc/.ssh/id", "/home/svc/.ssh/kh")
            .unwrap();
        assert!(!uploaded);
        assert_eq!(runner.count_matching("cmp -s -"), 2);
        assert_eq!(runner.count_matching("base64 -d >"), 0);
    }

    #[test]
    fn regenerated_key_replaces_stale_remote_copy() {
        let runner = MockRunner::new();
        runner.on("cmp -s - '/home/svc/.ssh/id'", 1, "");
        let ssh = gateway(&runner);
        let uploaded = ssh
            .sync_key_material(b"new-key", b"hosts", "/home/svc/.ssh/id", "/home/svc/.ssh/kh")
            .unwrap();
        assert!(uploaded);
        assert_eq!(runner.count_matching("base64 -d > '/home/svc/.ssh/id'"), 1);
        assert_eq!(runner.count_matching("base64 -d > '/home/svc/.ssh/kh'"), 0);
        let upload = runner
            .calls()
            .into_iter()
            .find(|c| c.rendered().contains("base64 -d > '/home/svc/.ssh/id'"))
            .unwrap();
        assert!(upload.rendered().contains(&STANDARD.encode(b"new-key")));
    }
}
