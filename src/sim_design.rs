use crate::error::{LauncherError, Result};
use crate::paths::{collapse_slashes, is_drive_rooted};
use crate::runner::{shell_single_quote, CommandRunner};
use crate::ssh::SshGateway;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

pub const OUTPUT_DIR_KEY: &str = "output_dir";
pub const SYNTHPOP_DIR_KEY: &str = "synthpop_dir";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDirs {
    pub output_dir: String,
    pub synthpop_dir: String,
}

/// Pulls a path-valued key out of a sim design document.
///
/// Only top-level `key: value` lines are considered. Absolute values are
/// returned as-is (slashes normalized); relative values are joined onto
/// `base_dir`. `None` covers both an unreadable source and an absent key.
pub fn read_path_value(source: Option<&str>, key: &str, base_dir: &str) -> Option<String> {
    let source = source?;
    for line in source.lines() {
        let Some(rest) = line.strip_prefix(key) else {
            continue;
        };
        let rest = rest.trim_start_matches([' ', '\t']);
        let Some(value) = rest.strip_prefix(':') else {
            continue;
        };
        let value = strip_inline_comment(value).trim();
        let value = strip_quotes(value);
        if value.is_empty() {
            return None;
        }
        if is_absolute(value) {
            return Some(value.replace('\\', "/"));
        }
        return Some(join_relative(base_dir, value));
    }
    None
}

fn strip_inline_comment(value: &str) -> &str {
    match value.find('#') {
        Some(idx) => &value[..idx],
        None => value,
    }
}

fn strip_quotes(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return value[1..value.len() - 1].trim();
        }
    }
    value
}

fn is_absolute(value: &str) -> bool {
    value.starts_with('/') || value.starts_with('\\') || is_drive_rooted(value)
}

fn join_relative(base_dir: &str, value: &str) -> String {
    let mut relative = value.replace('\\', "/");
    while let Some(stripped) = relative.strip_prefix("./") {
        relative = stripped.to_string();
    }
    let base = base_dir.replace('\\', "/");
    let joined = format!("{}/{}", base.trim_end_matches('/'), relative);
    let mut normalized = joined.replace("/./", "/");
    while normalized.contains("/./") {
        normalized = normalized.replace("/./", "/");
    }
    let normalized = collapse_slashes(&normalized);
    let trimmed = normalized.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn sim_design_candidates(repo_root: &str) -> Vec<String> {
    let root = repo_root.replace('\\', "/");
    let root = root.trim_end_matches('/');
    [
        "inputs/sim_design.local.yaml",
        "inputs/sim_design.yaml",
        "sim_design.local.yaml",
        "sim_design.yaml",
    ]
    .iter()
    .map(|name| format!("{root}/{name}"))
    .collect()
}

pub fn load_local_source(repo_root: &str) -> Option<String> {
    for candidate in sim_design_candidates(repo_root) {
        let path = Path::new(&candidate);
        if !path.is_file() {
            continue;
        }
        match fs::read_to_string(path) {
            Ok(content) => {
                debug!(file = %candidate, "loaded sim design");
                return Some(content);
            }
            Err(err) => warn!(file = %candidate, error = %err, "sim design unreadable"),
        }
    }
    None
}

/// One SSH round trip: the first candidate that `cat` can read wins.
pub fn load_remote_source<R: CommandRunner>(ssh: &SshGateway<'_, R>, repo_root: &str) -> Option<String> {
    let chain = sim_design_candidates(repo_root)
        .iter()
        .map(|c| format!("cat {} 2>/dev/null", shell_single_quote(c)))
        .collect::<Vec<_>>()
        .join(" || ");
    ssh.capture(&chain)
}

pub fn resolve_data_dirs(source: Option<&str>, repo_root: &str) -> Result<DataDirs> {
    if source.is_none() {
        return Err(LauncherError::Precondition(format!(
            "no sim_design.yaml found under {repo_root} (looked in inputs/ and the repository root)"
        )));
    }
    let output_dir = read_path_value(source, OUTPUT_DIR_KEY, repo_root).ok_or_else(|| {
        LauncherError::Precondition(format!("sim_design.yaml does not define {OUTPUT_DIR_KEY}"))
    })?;
    let synthpop_dir = read_path_value(source, SYNTHPOP_DIR_KEY, repo_root).ok_or_else(|| {
        LauncherError::Precondition(format!(
            "sim_design.yaml does not define {SYNTHPOP_DIR_KEY}"
        ))
    })?;
    Ok(DataDirs {
        output_dir,
        synthpop_dir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn relative_value_joins_base_and_drops_comment() {
        let yaml = "output_dir: ./outputs  # comment\n";
        let value = read_path_value(Some(yaml), "output_dir", "B").unwrap();
        assert_eq!(value, "B/outputs");
        assert!(!value.contains('#'));
    }

    #[test]
    fn absolute_value_ignores_base() {
        let yaml = "output_dir: /abs/path\n";
        assert_eq!(
            read_path_value(Some(yaml), "output_dir", "/anything").unwrap(),
            "/abs/path"
        );
        assert_eq!(
            read_path_value(Some(yaml), "output_dir", r"C:\repo").unwrap(),
            "/abs/path"
        );
    }

    #[test]
    fn windows_absolute_value_is_slash_normalized() {
        let yaml = "synthpop_dir: D:\\data\\synthpop\n";
        assert_eq!(
            read_path_value(Some(yaml), "synthpop_dir", "/base").unwrap(),
            "D:/data/synthpop"
        );
    }

    #[test]
    fn missing_key_and_missing_source_are_none() {
        assert!(read_path_value(Some("other: 1\n"), "output_dir", "/b").is_none());
        assert!(read_path_value(None, "output_dir", "/b").is_none());
        assert!(read_path_value(Some("output_dir:   # nothing\n"), "output_dir", "/b").is_none());
    }

    #[test]
    fn similar_key_prefix_does_not_match() {
        let yaml = "output_dir_old: /wrong\noutput_dir : outputs\n";
        assert_eq!(
            read_path_value(Some(yaml), "output_dir", "/repo/").unwrap(),
            "/repo/outputs"
        );
    }

    #[test]
    fn nested_relative_paths_collapse_slashes() {
        let yaml = "synthpop_dir: \"inputs//synthpop/\"\n";
        assert_eq!(
            read_path_value(Some(yaml), "synthpop_dir", r"C:\Users\x\repo\").unwrap(),
            "C:/Users/x/repo/inputs/synthpop"
        );
    }

    #[test]
    fn local_source_prefers_inputs_local_override() {
        let dir = tempdir().unwrap();
        let inputs = dir.path().join("inputs");
        std::fs::create_dir_all(&inputs).unwrap();
        std::fs::write(inputs.join("sim_design.yaml"), "output_dir: shared\n").unwrap();
        std::fs::write(inputs.join("sim_design.local.yaml"), "output_dir: mine\n").unwrap();
        let root = dir.path().to_string_lossy().to_string();
        let source = load_local_source(&root);
        assert_eq!(source.as_deref(), Some("output_dir: mine\n"));
    }

    #[test]
    fn resolve_requires_both_keys() {
        let err = resolve_data_dirs(Some("output_dir: out\n"), "/repo").unwrap_err();
        assert!(err.to_string().contains("synthpop_dir"));
        let dirs = resolve_data_dirs(
            Some("output_dir: out\nsynthpop_dir: /mnt/synthpop\n"),
            "/repo",
        )
        .unwrap();
        assert_eq!(dirs.output_dir, "/repo/out");
        assert_eq!(dirs.synthpop_dir, "/mnt/synthpop");
        assert!(resolve_data_dirs(None, "/repo").is_err());
    }
}
