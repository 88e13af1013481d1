//! Post-session change detection for the repository a container worked on.
//!
//! Local repositories are driven with `git -C`; remote ones go through a
//! single [`SshGateway`] call per step so the notifier never needs a local
//! checkout of a remote repo.

use crate::error::{LauncherError, Result};
use crate::runner::{shell_single_quote, CommandOutput, CommandRunner, Invocation};
use crate::session::GitBaseline;
use crate::ssh::keys::{agent_add, agent_remove};
use crate::ssh::SshGateway;
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Input};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info, warn};

const STATUS_MARKER: &str = "__IMPACTNCD_STATUS__";
const BRANCH_MARKER: &str = "__IMPACTNCD_BRANCH__";
const ORIGIN_MARKER: &str = "__IMPACTNCD_ORIGIN__";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepoStatus {
    pub porcelain: String,
    pub branch: String,
    pub origin: String,
}

impl RepoStatus {
    pub fn has_changes(&self) -> bool {
        !self.porcelain.trim().is_empty()
    }

    pub fn changed_files(&self) -> Vec<&str> {
        self.porcelain
            .lines()
            .filter(|l| !l.trim().is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NotifyOutcome {
    NoChanges,
    Declined,
    Committed { pushed: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotifyReport {
    #[serde(flatten)]
    pub outcome: NotifyOutcome,
    pub branch: String,
    pub changed_files: usize,
    /// `Some(true)` when HEAD moved since the baseline taken at start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_moved: Option<bool>,
}

pub trait ChangePrompt {
    fn confirm_commit(&self, status: &RepoStatus) -> Result<bool>;
    fn commit_message(&self) -> Result<Option<String>>;
    fn confirm_push(&self, branch: &str) -> Result<bool>;
}

pub struct DialoguerPrompt;

impl ChangePrompt for DialoguerPrompt {
    fn confirm_commit(&self, status: &RepoStatus) -> Result<bool> {
        eprintln!("Uncommitted changes on branch '{}':", status.branch);
        for line in status.changed_files() {
            eprintln!("  {line}");
        }
        Ok(Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Commit these changes?")
            .default(false)
            .interact()?)
    }

    fn commit_message(&self) -> Result<Option<String>> {
        let message: String = Input::with_theme(&ColorfulTheme::default())
            .with_prompt("Commit message")
            .allow_empty(true)
            .interact_text()?;
        let message = message.trim().to_string();
        Ok(if message.is_empty() { None } else { Some(message) })
    }

    fn confirm_push(&self, branch: &str) -> Result<bool> {
        Ok(Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Push '{branch}' to origin?"))
            .default(true)
            .interact()?)
    }
}

/// Never commits.
pub struct NonInteractivePrompt;

impl ChangePrompt for NonInteractivePrompt {
    fn confirm_commit(&self, _status: &RepoStatus) -> Result<bool> {
        Ok(false)
    }

    fn commit_message(&self) -> Result<Option<String>> {
        Ok(None)
    }

    fn confirm_push(&self, _branch: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Answers supplied on the command line (`stop --commit-message`).
pub struct PresetPrompt {
    pub message: String,
    pub push: bool,
}

impl ChangePrompt for PresetPrompt {
    fn confirm_commit(&self, _status: &RepoStatus) -> Result<bool> {
        Ok(!self.message.trim().is_empty())
    }

    fn commit_message(&self) -> Result<Option<String>> {
        Ok(Some(self.message.trim().to_string()).filter(|m| !m.is_empty()))
    }

    fn confirm_push(&self, _branch: &str) -> Result<bool> {
        Ok(self.push)
    }
}

/// `https://github.com/<owner>/<repo>(.git)` -> `git@github.com:<owner>/<repo>.git`.
/// Anything else (already SSH, other hosts) yields `None`.
pub fn ssh_origin_url(url: &str) -> Option<String> {
    let rest = url.trim().strip_prefix("https://")?;
    let rest = match rest.split_once('@') {
        Some((_credentials, host_path)) if !host_path.contains('@') => host_path,
        _ => rest,
    };
    let path = rest.strip_prefix("github.com/")?;
    let path = path.trim_end_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);
    let mut parts = path.split('/');
    let owner = parts.next().filter(|p| !p.is_empty())?;
    let repo = parts.next().filter(|p| !p.is_empty())?;
    if parts.next().is_some() {
        return None;
    }
    Some(format!("git@github.com:{owner}/{repo}.git"))
}

pub fn push_ssh_command(key: &str) -> String {
    format!("ssh -i {key} -o IdentitiesOnly=yes")
}

pub struct RepoGit<'a, R: CommandRunner> {
    runner: &'a R,
    ssh: Option<&'a SshGateway<'a, R>>,
    repo_path: String,
}

impl<'a, R: CommandRunner> RepoGit<'a, R> {
    pub fn local(runner: &'a R, repo_path: &str) -> Self {
        Self {
            runner,
            ssh: None,
            repo_path: repo_path.to_string(),
        }
    }

    pub fn remote(runner: &'a R, ssh: &'a SshGateway<'a, R>, repo_path: &str) -> Self {
        Self {
            runner,
            ssh: Some(ssh),
            repo_path: repo_path.to_string(),
        }
    }

    fn remote_command(&self, env: Option<(&str, &str)>, args: &[&str]) -> String {
        let quoted = args
            .iter()
            .map(|a| shell_single_quote(a))
            .collect::<Vec<_>>()
            .join(" ");
        let prefix = env
            .map(|(k, v)| format!("{k}={} ", shell_single_quote(v)))
            .unwrap_or_default();
        format!(
            "cd {} && {prefix}git {quoted}",
            shell_single_quote(&self.repo_path)
        )
    }

    fn git_env(&self, env: Option<(&str, &str)>, args: &[&str]) -> Result<CommandOutput> {
        match self.ssh {
            Some(ssh) => ssh.exec(&self.remote_command(env, args)),
            None => {
                let mut invocation = Invocation::new("git")
                    .arg("-C")
                    .arg(self.repo_path.clone())
                    .args(args.iter().copied());
                if let Some((key, value)) = env {
                    invocation = invocation.env(key, value);
                }
                self.runner.run(&invocation).map_err(|err| {
                    if err.kind() == std::io::ErrorKind::NotFound {
                        LauncherError::EnvironmentMissing("git not found on PATH".to_string())
                    } else {
                        LauncherError::Process(format!("failed to run git: {err}"))
                    }
                })
            }
        }
    }

    fn git(&self, args: &[&str]) -> Result<CommandOutput> {
        self.git_env(None, args)
    }

    fn git_ok(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.git(args)?;
        if !output.success() {
            return Err(LauncherError::Process(format!(
                "git {} failed in {}: {}",
                args.join(" "),
                self.repo_path,
                output.combined_text()
            )));
        }
        Ok(output)
    }

    pub fn head_commit(&self) -> Option<String> {
        match self.git(&["rev-parse", "HEAD"]) {
            Ok(output) if output.success() => {
                Some(output.stdout_text().trim().to_string()).filter(|c| !c.is_empty())
            }
            Ok(output) => {
                debug!(repo = %self.repo_path, stderr = %output.stderr_text(), "rev-parse failed");
                None
            }
            Err(err) => {
                debug!(repo = %self.repo_path, error = %err, "rev-parse unavailable");
                None
            }
        }
    }

    /// Best-effort snapshot taken before a container starts.
    pub fn capture_baseline(&self) -> Option<GitBaseline> {
        let commit = self.head_commit()?;
        let status = match self.git(&["status", "--porcelain"]) {
            Ok(output) if output.success() => output.stdout_text(),
            _ => {
                warn!(repo = %self.repo_path, "could not read working tree status for baseline");
                return None;
            }
        };
        Some(GitBaseline { commit, status })
    }

    pub fn collect_status(&self) -> Result<RepoStatus> {
        match self.ssh {
            Some(ssh) => {
                let command = format!(
                    "cd {repo} && echo {STATUS_MARKER} && git status --porcelain && echo {BRANCH_MARKER} && git rev-parse --abbrev-ref HEAD && echo {ORIGIN_MARKER} && (git remote get-url origin || true)",
                    repo = shell_single_quote(&self.repo_path),
                );
                let output = ssh.exec(&command)?;
                if !output.success() {
                    return Err(LauncherError::Process(format!(
                        "git status failed on {} in {}: {}",
                        ssh.host(),
                        self.repo_path,
                        output.combined_text()
                    )));
                }
                Ok(parse_sectioned_status(&output.stdout_text()))
            }
            None => {
                let porcelain = self.git_ok(&["status", "--porcelain"])?.stdout_text();
                let branch = self
                    .git_ok(&["rev-parse", "--abbrev-ref", "HEAD"])?
                    .stdout_text()
                    .trim()
                    .to_string();
                let origin = self
                    .git(&["remote", "get-url", "origin"])
                    .map(|o| o.stdout_text().trim().to_string())
                    .unwrap_or_default();
                Ok(RepoStatus {
                    porcelain,
                    branch,
                    origin,
                })
            }
        }
    }

    fn agent_push(&self, key: &str, branch: &str) -> bool {
        match self.ssh {
            None => {
                agent_remove(self.runner, Path::new(key));
                if !agent_add(self.runner, Path::new(key)) {
                    return false;
                }
                matches!(self.git(&["push", "origin", branch]), Ok(o) if o.success())
            }
            Some(ssh) => {
                let command = format!(
                    "ssh-add {} >/dev/null 2>&1 && {}",
                    shell_single_quote(key),
                    self.remote_command(None, &["push", "origin", branch])
                );
                matches!(ssh.exec(&command), Ok(o) if o.success())
            }
        }
    }

    /// Agent-mediated push first, then a push scoped to `key` through
    /// `GIT_SSH_COMMAND`.
    pub fn push(&self, key: &str, branch: &str) -> Result<()> {
        if self.agent_push(key, branch) {
            info!(branch = %branch, "pushed via ssh-agent");
            return Ok(());
        }
        debug!(branch = %branch, "agent push failed; retrying with explicit key");
        let ssh_command = push_ssh_command(key);
        let output = self.git_env(
            Some(("GIT_SSH_COMMAND", ssh_command.as_str())),
            &["push", "origin", branch],
        )?;
        if !output.success() {
            return Err(LauncherError::Process(format!(
                "git push failed: {}",
                output.combined_text()
            )));
        }
        info!(branch = %branch, "pushed with explicit key");
        Ok(())
    }
}

fn parse_sectioned_status(text: &str) -> RepoStatus {
    let mut status = RepoStatus::default();
    let mut section = None;
    for line in text.lines() {
        match line.trim() {
            STATUS_MARKER => section = Some(STATUS_MARKER),
            BRANCH_MARKER => section = Some(BRANCH_MARKER),
            ORIGIN_MARKER => section = Some(ORIGIN_MARKER),
            _ => match section {
                Some(STATUS_MARKER) => {
                    status.porcelain.push_str(line);
                    status.porcelain.push('\n');
                }
                Some(BRANCH_MARKER) if status.branch.is_empty() => {
                    status.branch = line.trim().to_string()
                }
                Some(ORIGIN_MARKER) if status.origin.is_empty() => {
                    status.origin = line.trim().to_string()
                }
                _ => {}
            },
        }
    }
    status
}

/// Offers to commit (and push) whatever the session left behind in the repo.
pub fn notify_changes<R: CommandRunner>(
    git: &RepoGit<'_, R>,
    prompt: &dyn ChangePrompt,
    push_key: &str,
    baseline: Option<&GitBaseline>,
) -> Result<NotifyReport> {
    let status = git.collect_status()?;
    let head_moved = baseline.and_then(|b| git.head_commit().map(|head| head != b.commit));
    let report = |outcome: NotifyOutcome| NotifyReport {
        outcome,
        branch: status.branch.clone(),
        changed_files: status.changed_files().len(),
        head_moved,
    };
    if !status.has_changes() {
        return Ok(report(NotifyOutcome::NoChanges));
    }
    if !prompt.confirm_commit(&status)? {
        return Ok(report(NotifyOutcome::Declined));
    }
    let Some(message) = prompt.commit_message()? else {
        info!("empty commit message; leaving changes uncommitted");
        return Ok(report(NotifyOutcome::Declined));
    };
    if let Some(ssh_url) = ssh_origin_url(&status.origin) {
        git.git_ok(&["remote", "set-url", "origin", &ssh_url])?;
        info!(origin = %ssh_url, "switched origin to ssh");
    }
    git.git_ok(&["add", "-A"])?;
    git.git_ok(&["commit", "-m", &message])?;
    let pushed = if prompt.confirm_push(&status.branch)? {
        git.push(push_key, &status.branch)?;
        true
    } else {
        false
    };
    Ok(report(NotifyOutcome::Committed { pushed }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::MockRunner;

    struct Scripted {
        commit: bool,
        message: Option<&'static str>,
        push: bool,
    }

    impl ChangePrompt for Scripted {
        fn confirm_commit(&self, _status: &RepoStatus) -> Result<bool> {
            Ok(self.commit)
        }
        fn commit_message(&self) -> Result<Option<String>> {
            Ok(self.message.map(String::from))
        }
        fn confirm_push(&self, _branch: &str) -> Result<bool> {
            Ok(self.push)
        }
    }

    fn dirty_repo(runner: &MockRunner) {
        runner
            .on("status --porcelain", 0, " M R/model.R\n?? outputs/new.csv\n")
            .on("rev-parse --abbrev-ref HEAD", 0, "main\n")
            .on("rev-parse HEAD", 0, "def456\n")
            .on("remote get-url origin", 0, "https://github.com/php/IMPACTncd_Germany.git\n");
    }

    #[test]
    fn https_origin_is_rewritten_to_ssh() {
        assert_eq!(
            ssh_origin_url("https://github.com/php/IMPACTncd_Germany.git").as_deref(),
            Some("git@github.com:php/IMPACTncd_Germany.git")
        );
        assert_eq!(
            ssh_origin_url("https://github.com/php/IMPACTncd_Germany/").as_deref(),
            Some("git@github.com:php/IMPACTncd_Germany.git")
        );
        assert_eq!(
            ssh_origin_url("https://x-access-token@github.com/php/repo").as_deref(),
            Some("git@github.com:php/repo.git")
        );
        assert!(ssh_origin_url("git@github.com:php/repo.git").is_none());
        assert!(ssh_origin_url("https://gitlab.com/php/repo.git").is_none());
    }

    #[test]
    fn clean_tree_reports_no_changes() {
        let runner = MockRunner::new();
        runner.on("rev-parse --abbrev-ref HEAD", 0, "main\n");
        let git = RepoGit::local(&runner, "/work/repo");
        let report = notify_changes(&git, &NonInteractivePrompt, "/k", None).unwrap();
        assert_eq!(report.outcome, NotifyOutcome::NoChanges);
        assert_eq!(report.branch, "main");
    }

    #[test]
    fn declined_commit_runs_no_mutations() {
        let runner = MockRunner::new();
        dirty_repo(&runner);
        let git = RepoGit::local(&runner, "/work/repo");
        let report = notify_changes(&git, &NonInteractivePrompt, "/k", None).unwrap();
        assert_eq!(report.outcome, NotifyOutcome::Declined);
        assert_eq!(report.changed_files, 2);
        assert_eq!(runner.count_matching("commit"), 0);
        assert_eq!(runner.count_matching("set-url"), 0);
    }

    #[test]
    fn commit_and_push_falls_back_to_explicit_key() {
        let runner = MockRunner::new();
        dirty_repo(&runner);
        runner.on_stderr("ssh-add /home/me/.ssh/id_ed25519_bob", 2, "Could not open a connection to your authentication agent.");
        let git = RepoGit::local(&runner, "/work/repo");
        let prompt = Scripted {
            commit: true,
            message: Some("results of run 7"),
            push: true,
        };
        let baseline = GitBaseline {
            commit: "abc123".to_string(),
            status: String::new(),
        };
        let report = notify_changes(&git, &prompt, "/home/me/.ssh/id_ed25519_bob", Some(&baseline)).unwrap();
        assert_eq!(report.outcome, NotifyOutcome::Committed { pushed: true });
        assert_eq!(report.head_moved, Some(true));

        let set_url = runner
            .position("remote set-url origin git@github.com:php/IMPACTncd_Germany.git")
            .unwrap();
        let commit = runner.position("commit -m \"results of run 7\"").unwrap();
        assert!(set_url < commit);
        let push = runner
            .calls()
            .into_iter()
            .find(|c| c.args.contains(&"push".to_string()))
            .unwrap();
        assert_eq!(
            push.env.get("GIT_SSH_COMMAND").map(String::as_str),
            Some("ssh -i /home/me/.ssh/id_ed25519_bob -o IdentitiesOnly=yes")
        );
    }

    #[test]
    fn agent_push_skips_fallback() {
        let runner = MockRunner::new();
        dirty_repo(&runner);
        let git = RepoGit::local(&runner, "/work/repo");
        let prompt = Scripted {
            commit: true,
            message: Some("msg"),
            push: true,
        };
        notify_changes(&git, &prompt, "/k", None).unwrap();
        assert_eq!(runner.count_matching("push origin main"), 1);
        assert!(runner.position("ssh-add -d /k").unwrap() < runner.position("ssh-add /k").unwrap());
    }

    #[test]
    fn remote_status_uses_one_ssh_call() {
        let runner = MockRunner::new();
        runner.on(
            STATUS_MARKER,
            0,
            &format!("{STATUS_MARKER}\n M a.R\n{BRANCH_MARKER}\nfeature\n{ORIGIN_MARKER}\ngit@github.com:o/r.git\n"),
        );
        let ssh = SshGateway::new(&runner, "svc", "10.0.0.5", "/k", 10);
        let git = RepoGit::remote(&runner, &ssh, "/srv/repo");
        let status = git.collect_status().unwrap();
        assert_eq!(runner.calls().len(), 1);
        assert_eq!(status.branch, "feature");
        assert_eq!(status.origin, "git@github.com:o/r.git");
        assert_eq!(status.changed_files(), vec![" M a.R"]);
    }

    #[test]
    fn baseline_is_optional() {
        let runner = MockRunner::new();
        runner.on_stderr("rev-parse HEAD", 128, "fatal: not a git repository");
        let git = RepoGit::local(&runner, "/tmp/nowhere");
        assert!(git.capture_baseline().is_none());

        let runner = MockRunner::new();
        runner.on("rev-parse HEAD", 0, "abc123\n").on("status --porcelain", 0, "");
        let git = RepoGit::local(&runner, "/work/repo");
        assert_eq!(
            git.capture_baseline(),
            Some(GitBaseline {
                commit: "abc123".to_string(),
                status: String::new(),
            })
        );
    }
}
