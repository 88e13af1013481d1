//! `~/.ssh/config` entry management.
//!
//! A stale `Host` block with `IdentitiesOnly yes` pointing at another key
//! silently breaks authentication, so mismatching blocks are replaced rather
//! than left in place.

use crate::config::{expand_path, write_atomic_text_file};
use crate::error::Result;
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::info;

pub const ENTRY_MARKER: &str = "# impactncd auto-generated entry";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub host: String,
    pub user: String,
    pub identity_file: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostEntryPlan {
    Unchanged,
    Append,
    Replace,
}

impl HostEntry {
    pub fn render(&self) -> String {
        format!(
            "{ENTRY_MARKER} for {host}\nHost {host}\n    HostName {host}\n    User {user}\n    IdentityFile {identity}\n    IdentitiesOnly yes\n",
            host = self.host,
            user = self.user,
            identity = quote_if_needed(&self.identity_file),
        )
    }
}

fn quote_if_needed(value: &str) -> String {
    if value.chars().any(char::is_whitespace) {
        format!("\"{value}\"")
    } else {
        value.to_string()
    }
}

#[derive(Debug, Clone)]
struct Block {
    start: usize,
    end: usize,
    user: Option<String>,
    identity_file: Option<String>,
}

fn keyword_and_value(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let split_at = line.find(|c: char| c.is_whitespace() || c == '=')?;
    let (keyword, rest) = line.split_at(split_at);
    let value = rest
        .trim_start_matches(|c: char| c.is_whitespace() || c == '=')
        .trim()
        .trim_matches('"')
        .to_string();
    Some((keyword.to_ascii_lowercase(), value))
}

fn is_section_start(line: &str) -> bool {
    matches!(
        keyword_and_value(line),
        Some((keyword, _)) if keyword == "host" || keyword == "match"
    ) || line.trim_start().starts_with(ENTRY_MARKER)
}

fn find_blocks(lines: &[&str], host: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut idx = 0;
    while idx < lines.len() {
        let matches_host = match keyword_and_value(lines[idx]) {
            Some((keyword, value)) if keyword == "host" => {
                value.split_whitespace().any(|pattern| pattern == host)
            }
            _ => false,
        };
        if !matches_host {
            idx += 1;
            continue;
        }
        let mut start = idx;
        if idx > 0 && lines[idx - 1].trim_start().starts_with(ENTRY_MARKER) {
            start = idx - 1;
        }
        let mut end = idx + 1;
        let mut user = None;
        let mut identity_file = None;
        while end < lines.len() && !is_section_start(lines[end]) {
            if let Some((keyword, value)) = keyword_and_value(lines[end]) {
                match keyword.as_str() {
                    "user" => user = Some(value),
                    "identityfile" => identity_file = Some(value),
                    _ => {}
                }
            }
            end += 1;
        }
        blocks.push(Block {
            start,
            end,
            user,
            identity_file,
        });
        idx = end;
    }
    blocks
}

pub fn plan_host_entry(
    existing: &str,
    entry: &HostEntry,
    identity_exists: impl Fn(&str) -> bool,
) -> HostEntryPlan {
    let lines: Vec<&str> = existing.lines().collect();
    let blocks = find_blocks(&lines, &entry.host);
    match blocks.as_slice() {
        [] => HostEntryPlan::Append,
        [block] => {
            let identity_matches = block
                .identity_file
                .as_deref()
                .map(|id| same_path(id, &entry.identity_file) && identity_exists(id))
                .unwrap_or(false);
            let user_matches = block.user.as_deref() == Some(entry.user.as_str());
            if identity_matches && user_matches {
                HostEntryPlan::Unchanged
            } else {
                HostEntryPlan::Replace
            }
        }
        _ => HostEntryPlan::Replace,
    }
}

fn same_path(a: &str, b: &str) -> bool {
    let norm = |p: &str| expand_path(p).replace('\\', "/");
    norm(a) == norm(b)
}

/// Removes every block for `entry.host` (with its marker comment) and
/// appends a fresh one.
pub fn apply_host_entry(existing: &str, entry: &HostEntry) -> String {
    let lines: Vec<&str> = existing.lines().collect();
    let blocks = find_blocks(&lines, &entry.host);
    let mut kept: Vec<&str> = Vec::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        if blocks.iter().any(|b| idx >= b.start && idx < b.end) {
            continue;
        }
        kept.push(line);
    }
    while kept.last().map(|l| l.trim().is_empty()).unwrap_or(false) {
        kept.pop();
    }
    let mut out = kept.join("\n");
    if !out.is_empty() {
        out.push_str("\n\n");
    }
    out.push_str(&entry.render());
    out
}

/// Makes `config_path` contain exactly one up-to-date block for the entry.
pub fn ensure_config_entry(config_path: &Path, entry: &HostEntry) -> Result<HostEntryPlan> {
    let existing = if config_path.exists() {
        fs::read_to_string(config_path)?
    } else {
        String::new()
    };
    let plan = plan_host_entry(&existing, entry, |id| Path::new(&expand_path(id)).exists());
    if plan == HostEntryPlan::Unchanged {
        return Ok(plan);
    }
    let updated = apply_host_entry(&existing, entry);
    write_atomic_text_file(config_path, &updated, Some(0o600))?;
    info!(path = %config_path.display(), host = %entry.host, ?plan, "updated ssh config");
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(identity: &str) -> HostEntry {
        HostEntry {
            host: "10.0.0.5".to_string(),
            user: "php-workstation".to_string(),
            identity_file: identity.to_string(),
        }
    }

    fn host_blocks(text: &str, host: &str) -> usize {
        text.lines()
            .filter(|l| l.trim() == format!("Host {host}"))
            .count()
    }

    #[test]
    fn ensure_twice_yields_single_block() {
        let dir = tempdir().unwrap();
        let key = dir.path().join("id_ed25519_bob");
        fs::write(&key, "k").unwrap();
        let config = dir.path().join("config");
        fs::write(&config, "Host github.com\n    User git\n").unwrap();
        let e = entry(&key.to_string_lossy());

        assert_eq!(ensure_config_entry(&config, &e).unwrap(), HostEntryPlan::Append);
        assert_eq!(ensure_config_entry(&config, &e).unwrap(), HostEntryPlan::Unchanged);
        let text = fs::read_to_string(&config).unwrap();
        assert_eq!(host_blocks(&text, "10.0.0.5"), 1);
        assert_eq!(host_blocks(&text, "github.com"), 1);
    }

    #[test]
    fn different_key_replaces_block_and_marker() {
        let existing = format!(
            "Host other\n    User x\n\n{}\n",
            entry("/old/id_ed25519_bob").render()
        );
        let new_entry = entry("/new/id_ed25519_bob");
        assert_eq!(
            plan_host_entry(&existing, &new_entry, |_| true),
            HostEntryPlan::Replace
        );
        let updated = apply_host_entry(&existing, &new_entry);
        assert!(!updated.contains("/old/id_ed25519_bob"));
        assert_eq!(updated.matches(ENTRY_MARKER).count(), 1);
        assert_eq!(host_blocks(&updated, "10.0.0.5"), 1);
        assert!(updated.starts_with("Host other\n    User x\n\n"));
    }

    #[test]
    fn deleted_key_makes_block_stale() {
        let e = entry("/gone/id_ed25519_bob");
        let existing = e.render();
        assert_eq!(plan_host_entry(&existing, &e, |_| false), HostEntryPlan::Replace);
        assert_eq!(plan_host_entry(&existing, &e, |_| true), HostEntryPlan::Unchanged);
    }

    #[test]
    fn following_blocks_survive_replacement() {
        let e = entry("/k");
        let existing = format!(
            "Host 10.0.0.5\n    IdentityFile /stale\n    IdentitiesOnly=yes\n{ENTRY_MARKER} for 10.0.0.9\nHost 10.0.0.9\n    User y\nMatch host z\n    User z\n"
        );
        let updated = apply_host_entry(&existing, &e);
        assert!(!updated.contains("/stale"));
        assert!(updated.contains("Host 10.0.0.9\n    User y"));
        assert!(updated.contains("Match host z"));
        assert_eq!(host_blocks(&updated, "10.0.0.5"), 1);
    }

    #[test]
    fn duplicate_blocks_are_collapsed() {
        let e = entry("/k");
        let existing = format!("{}\n{}", e.render(), e.render());
        assert_eq!(plan_host_entry(&existing, &e, |_| true), HostEntryPlan::Replace);
        assert_eq!(host_blocks(&apply_host_entry(&existing, &e), "10.0.0.5"), 1);
    }

    #[test]
    fn identity_with_spaces_is_quoted_and_parsed_back() {
        let e = entry("C:/Users/John Doe/.ssh/id_ed25519_bob");
        let rendered = e.render();
        assert!(rendered.contains("IdentityFile \"C:/Users/John Doe/.ssh/id_ed25519_bob\""));
        assert_eq!(plan_host_entry(&rendered, &e, |_| true), HostEntryPlan::Unchanged);
    }
}
