use std::collections::BTreeMap;
use std::io;
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub env_remove: Vec<String>,
    pub stdin: Option<String>,
}

impl Invocation {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.insert(key.to_string(), value.into());
        self
    }

    pub fn env_remove(mut self, key: &str) -> Self {
        self.env_remove.push(key.to_string());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn rendered(&self) -> String {
        render_command(&self.program, &self.args)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    /// stdout followed by stderr, for error reports that show raw output.
    pub fn combined_text(&self) -> String {
        let stdout = String::from_utf8_lossy(&self.stdout);
        let stderr = String::from_utf8_lossy(&self.stderr);
        format!("{}{}", stdout, stderr).trim().to_string()
    }
}

pub trait CommandRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput, io::Error>;
}

pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput, io::Error> {
        debug!(command = %mask_secrets(&invocation.rendered()), "running");
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);
        for key in &invocation.env_remove {
            cmd.env_remove(key);
        }
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }
        if invocation.stdin.is_some() {
            cmd.stdin(Stdio::piped());
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd.spawn()?;
        if let Some(input) = &invocation.stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes())?;
            }
        }
        let output = child.wait_with_output()?;
        let status_code = output
            .status
            .code()
            .unwrap_or(if output.status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

pub fn render_command(program: &str, args: &[String]) -> String {
    fn shell_quote(part: &str) -> String {
        if part.is_empty() {
            return "\"\"".to_string();
        }
        if part.chars().any(|c| c.is_whitespace()) {
            return format!("\"{}\"", part.replace('"', "\\\""));
        }
        part.to_string()
    }
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program.to_string());
    parts.extend(args.iter().map(|arg| shell_quote(arg)));
    parts.join(" ")
}

/// Hides `PASSWORD=` values so rendered commands are safe to log.
pub fn mask_secrets(rendered: &str) -> String {
    let mut out = String::with_capacity(rendered.len());
    let mut rest = rendered;
    while let Some(idx) = rest.find("PASSWORD=") {
        let (head, tail) = rest.split_at(idx + "PASSWORD=".len());
        out.push_str(head);
        let end = tail
            .find(|c: char| c.is_whitespace() || c == '"')
            .unwrap_or(tail.len());
        out.push_str("****");
        rest = &tail[end..];
    }
    out.push_str(rest);
    out
}

pub fn shell_single_quote(value: &str) -> String {
    // foo'bar -> 'foo'\''bar'
    let mut out = String::new();
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::cell::RefCell;

    /// Records every invocation and answers from substring-matched rules.
    /// Unmatched invocations succeed with empty output.
    #[derive(Default)]
    pub struct MockRunner {
        calls: RefCell<Vec<Invocation>>,
        rules: RefCell<Vec<(String, CommandOutput)>>,
        not_found: RefCell<Vec<String>>,
    }

    impl MockRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn on(&self, pattern: &str, status_code: i32, stdout: &str) -> &Self {
            self.rules.borrow_mut().push((
                pattern.to_string(),
                CommandOutput {
                    status_code,
                    stdout: stdout.as_bytes().to_vec(),
                    stderr: Vec::new(),
                },
            ));
            self
        }

        pub fn on_stderr(&self, pattern: &str, status_code: i32, stderr: &str) -> &Self {
            self.rules.borrow_mut().push((
                pattern.to_string(),
                CommandOutput {
                    status_code,
                    stdout: Vec::new(),
                    stderr: stderr.as_bytes().to_vec(),
                },
            ));
            self
        }

        pub fn missing_program(&self, program: &str) -> &Self {
            self.not_found.borrow_mut().push(program.to_string());
            self
        }

        pub fn calls(&self) -> Vec<Invocation> {
            self.calls.borrow().clone()
        }

        pub fn rendered_calls(&self) -> Vec<String> {
            self.calls.borrow().iter().map(|c| c.rendered()).collect()
        }

        pub fn count_matching(&self, pattern: &str) -> usize {
            self.rendered_calls()
                .iter()
                .filter(|c| c.contains(pattern))
                .count()
        }

        pub fn position(&self, pattern: &str) -> Option<usize> {
            self.rendered_calls().iter().position(|c| c.contains(pattern))
        }
    }

    impl CommandRunner for MockRunner {
        fn run(&self, invocation: &Invocation) -> Result<CommandOutput, io::Error> {
            self.calls.borrow_mut().push(invocation.clone());
            if self.not_found.borrow().contains(&invocation.program) {
                return Err(io::Error::new(io::ErrorKind::NotFound, "not found"));
            }
            let rendered = invocation.rendered();
            let stdin = invocation.stdin.clone().unwrap_or_default();
            for (pattern, output) in self.rules.borrow().iter() {
                if rendered.contains(pattern.as_str()) || stdin.contains(pattern.as_str()) {
                    return Ok(output.clone());
                }
            }
            Ok(CommandOutput {
                status_code: 0,
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_quotes_whitespace_arguments() {
        let args = vec![
            "-e".to_string(),
            "GIT_SSH_COMMAND=ssh -i key".to_string(),
            String::new(),
        ];
        assert_eq!(
            render_command("docker", &args),
            "docker -e \"GIT_SSH_COMMAND=ssh -i key\" \"\""
        );
    }

    #[test]
    fn mask_hides_password_values() {
        let rendered = "docker run -e PASSWORD=hunter2 -e DISABLE_AUTH=false";
        assert_eq!(
            mask_secrets(rendered),
            "docker run -e PASSWORD=**** -e DISABLE_AUTH=false"
        );
    }

    #[test]
    fn single_quote_escapes_embedded_quotes() {
        assert_eq!(shell_single_quote("foo'bar"), "'foo'\\''bar'");
        assert_eq!(shell_single_quote("plain"), "'plain'");
    }

    #[test]
    fn mock_runner_matches_first_rule() {
        let runner = testing::MockRunner::new();
        runner.on("ps -a", 0, "row\n").on("ps", 1, "");
        let out = runner
            .run(&Invocation::new("docker").args(["ps", "-a"]))
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout_text(), "row\n");
        assert_eq!(runner.calls().len(), 1);
    }
}
