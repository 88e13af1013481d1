use crate::error::{LauncherError, Result};
use crate::runner::{shell_single_quote, CommandRunner, Invocation};
use std::fs;
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const GITHUB_HOST: &str = "github.com";

pub fn public_key_path(private_key: &Path) -> PathBuf {
    let mut raw = private_key.as_os_str().to_owned();
    raw.push(".pub");
    PathBuf::from(raw)
}

pub fn key_marker(user: &str) -> String {
    format!("impactncd-key-{user}")
}

/// Idempotent `authorized_keys` update: drops every line whose last field is
/// exactly `marker`, then appends the current key tagged the same way.
pub fn authorize_script(public_key: &str, marker: &str) -> String {
    let line = format!("{} {}", public_key.trim(), marker);
    format!(
        "set -e\n\
umask 077\n\
mkdir -p ~/.ssh\n\
touch ~/.ssh/authorized_keys\n\
awk -v m={marker} '$NF != m' ~/.ssh/authorized_keys > ~/.ssh/authorized_keys.impactncd\n\
echo {line} >> ~/.ssh/authorized_keys.impactncd\n\
mv ~/.ssh/authorized_keys.impactncd ~/.ssh/authorized_keys\n\
chmod 700 ~/.ssh\n\
chmod 600 ~/.ssh/authorized_keys\n",
        marker = shell_single_quote(marker),
        line = shell_single_quote(&line),
    )
}

/// Creates `~/.ssh/id_ed25519_<user>` with `ssh-keygen` when missing.
/// Returns whether a new pair was generated.
pub fn ensure_local_key_pair<R: CommandRunner>(runner: &R, private_key: &Path, user: &str) -> Result<bool> {
    let public_key = public_key_path(private_key);
    if private_key.exists() && public_key.exists() {
        return Ok(false);
    }
    if private_key.exists() {
        return Err(LauncherError::Precondition(format!(
            "{} exists without its .pub file; restore it or delete the private key to regenerate",
            private_key.display()
        )));
    }
    if let Some(parent) = private_key.parent() {
        fs::create_dir_all(parent)?;
    }
    let invocation = Invocation::new("ssh-keygen").args([
        "-t".to_string(),
        "ed25519".to_string(),
        "-N".to_string(),
        String::new(),
        "-C".to_string(),
        key_marker(user),
        "-f".to_string(),
        private_key.to_string_lossy().to_string(),
        "-q".to_string(),
    ]);
    let output = runner.run(&invocation).map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            LauncherError::EnvironmentMissing("ssh-keygen not found on PATH".to_string())
        } else {
            LauncherError::Io(err)
        }
    })?;
    if !output.success() {
        return Err(LauncherError::Process(format!(
            "ssh-keygen failed: {}",
            output.stderr_text()
        )));
    }
    info!(key = %private_key.display(), "generated ssh key pair");
    Ok(true)
}

pub fn read_public_key(private_key: &Path) -> Result<String> {
    let public_key = public_key_path(private_key);
    let content = fs::read_to_string(&public_key).map_err(|err| {
        LauncherError::Precondition(format!(
            "cannot read public key {}: {err}",
            public_key.display()
        ))
    })?;
    let line = content.lines().next().unwrap_or_default().trim().to_string();
    if line.is_empty() {
        return Err(LauncherError::Precondition(format!(
            "public key {} is empty",
            public_key.display()
        )));
    }
    Ok(line)
}

pub fn has_known_host(content: &str, host: &str) -> bool {
    content.lines().any(|line| {
        let line = line.trim();
        !line.starts_with('#')
            && line
                .split_whitespace()
                .next()
                .map(|hosts| hosts.split(',').any(|h| h == host))
                .unwrap_or(false)
    })
}

/// Appends GitHub's host keys (via `ssh-keyscan`) to `known_hosts` unless an
/// entry is already present. Containers pin `StrictHostKeyChecking=yes`, so a
/// missing entry would break every push from inside.
pub fn ensure_github_known_host<R: CommandRunner>(runner: &R, known_hosts: &Path) -> Result<bool> {
    let existing = fs::read_to_string(known_hosts).unwrap_or_default();
    if has_known_host(&existing, GITHUB_HOST) {
        return Ok(false);
    }
    let output = runner
        .run(&Invocation::new("ssh-keyscan").args(["-t", "ed25519,ecdsa,rsa", GITHUB_HOST]))
        .map_err(|err| LauncherError::Process(format!("failed to run ssh-keyscan: {err}")))?;
    let scanned = output.stdout_text();
    if !output.success() || !has_known_host(&scanned, GITHUB_HOST) {
        return Err(LauncherError::Process(format!(
            "ssh-keyscan returned no host keys for {GITHUB_HOST}: {}",
            output.stderr_text()
        )));
    }
    if let Some(parent) = known_hosts.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(known_hosts)?;
    if !existing.is_empty() && !existing.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    for line in scanned.lines().filter(|l| !l.trim().is_empty() && !l.starts_with('#')) {
        writeln!(file, "{line}")?;
    }
    info!(path = %known_hosts.display(), "added github.com host keys");
    Ok(true)
}

pub fn agent_add<R: CommandRunner>(runner: &R, private_key: &Path) -> bool {
    match runner.run(&Invocation::new("ssh-add").arg(private_key.to_string_lossy().to_string())) {
        Ok(output) if output.success() => true,
        Ok(output) => {
            debug!(stderr = %output.stderr_text(), "ssh-add failed");
            false
        }
        Err(err) => {
            debug!(error = %err, "ssh-add unavailable");
            false
        }
    }
}

/// Best-effort removal of a previously loaded identity from the agent.
pub fn agent_remove<R: CommandRunner>(runner: &R, private_key: &Path) {
    let invocation = Invocation::new("ssh-add")
        .arg("-d")
        .arg(private_key.to_string_lossy().to_string());
    match runner.run(&invocation) {
        Ok(output) if !output.success() => {
            debug!(stderr = %output.stderr_text(), "no stale agent identity removed")
        }
        Ok(_) => debug!(key = %private_key.display(), "removed stale agent identity"),
        Err(err) => warn!(error = %err, "could not clean up ssh-agent identities"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::MockRunner;
    use tempfile::tempdir;

    #[test]
    fn authorize_script_strips_marked_lines_then_appends() {
        let script = authorize_script("ssh-ed25519 AAAAkey bob@pc\n", "impactncd-key-bob");
        let strip = script.find("awk -v m='impactncd-key-bob' '$NF != m'").expect("strip step");
        let append = script
            .find("echo 'ssh-ed25519 AAAAkey bob@pc impactncd-key-bob'")
            .expect("append step");
        assert!(strip < append);
        assert!(script.contains("umask 077"));
        assert!(script.contains("chmod 600 ~/.ssh/authorized_keys"));
    }

    #[test]
    fn authorize_script_keeps_keys_of_users_sharing_a_prefix() {
        let home = tempdir().unwrap();
        let ssh_dir = home.path().join(".ssh");
        fs::create_dir_all(&ssh_dir).unwrap();
        fs::write(
            ssh_dir.join("authorized_keys"),
            "ssh-ed25519 BOBBYKEY impactncd-key-bobby\n\
ssh-ed25519 OLDBOBKEY bob@pc impactncd-key-bob\n\
ssh-ed25519 ADMINKEY admin@host\n",
        )
        .unwrap();

        let script = authorize_script("ssh-ed25519 BOBKEY bob@pc", &key_marker("bob"));
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(&script)
            .env("HOME", home.path())
            .status()
            .unwrap();
        assert!(status.success());

        let content = fs::read_to_string(ssh_dir.join("authorized_keys")).unwrap();
        assert!(content.contains("ssh-ed25519 BOBBYKEY impactncd-key-bobby"));
        assert!(content.contains("ssh-ed25519 ADMINKEY admin@host"));
        assert!(!content.contains("OLDBOBKEY"));
        assert_eq!(content.matches("impactncd-key-bob\n").count(), 1);
        assert!(content.ends_with("ssh-ed25519 BOBKEY bob@pc impactncd-key-bob\n"));

        // running it again changes nothing
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(&script)
            .env("HOME", home.path())
            .status()
            .unwrap();
        assert!(status.success());
        assert_eq!(fs::read_to_string(ssh_dir.join("authorized_keys")).unwrap(), content);
    }

    #[test]
    fn key_pair_generation_runs_ssh_keygen_once() {
        let dir = tempdir().unwrap();
        let key = dir.path().join("id_ed25519_alice");
        let runner = MockRunner::new();
        assert!(ensure_local_key_pair(&runner, &key, "alice").unwrap());
        let call = &runner.calls()[0];
        assert_eq!(call.program, "ssh-keygen");
        assert!(call.args.contains(&"ed25519".to_string()));
        assert!(call.args.contains(&"impactncd-key-alice".to_string()));

        fs::write(&key, "private").unwrap();
        fs::write(public_key_path(&key), "ssh-ed25519 AAAA").unwrap();
        assert!(!ensure_local_key_pair(&runner, &key, "alice").unwrap());
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn orphaned_private_key_is_an_error() {
        let dir = tempdir().unwrap();
        let key = dir.path().join("id_ed25519_alice");
        fs::write(&key, "private").unwrap();
        assert!(ensure_local_key_pair(&MockRunner::new(), &key, "alice").is_err());
    }

    #[test]
    fn known_host_detection_handles_host_lists() {
        assert!(has_known_host("github.com,140.82.121.4 ssh-ed25519 AAAA\n", "github.com"));
        assert!(!has_known_host("# github.com ssh-ed25519 AAAA\n", "github.com"));
        assert!(!has_known_host("gitlab.com ssh-ed25519 AAAA\n", "github.com"));
    }

    #[test]
    fn github_host_keys_are_appended_once() {
        let dir = tempdir().unwrap();
        let known_hosts = dir.path().join("known_hosts");
        fs::write(&known_hosts, "example.org ssh-rsa BBBB").unwrap();
        let runner = MockRunner::new();
        runner.on("ssh-keyscan", 0, "# comment\ngithub.com ssh-ed25519 AAAA\n");
        assert!(ensure_github_known_host(&runner, &known_hosts).unwrap());
        assert!(!ensure_github_known_host(&runner, &known_hosts).unwrap());
        let content = fs::read_to_string(&known_hosts).unwrap();
        assert_eq!(content, "example.org ssh-rsa BBBB\ngithub.com ssh-ed25519 AAAA\n");
        assert_eq!(runner.count_matching("ssh-keyscan"), 1);
    }
}
