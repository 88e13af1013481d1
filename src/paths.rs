//! Host path to Docker mount source translation.
//!
//! Docker Desktop on Windows expects drive paths in the `/c/Users/...` form.
//! Remote hosts are Linux workstations whose paths are already POSIX.

use crate::error::{LauncherError, Result};
use crate::session::Location;

pub fn to_docker_mount_path(path: &str, is_local: bool) -> String {
    if is_local {
        if let Some((drive, rest)) = split_drive(path) {
            let rest = collapse_slashes(&rest.replace('\\', "/"));
            let rest = rest.trim_matches('/');
            let drive = drive.to_ascii_lowercase();
            if rest.is_empty() {
                return format!("/{drive}");
            }
            return format!("/{drive}/{rest}");
        }
    }
    path.replace('\\', "/")
}

/// Local mode on a Windows host must never see a `/`-rooted source: it would
/// be resolved inside the Docker Desktop VM rather than on the user's disk.
pub fn validate_mount_source(path: &str, location: &Location, host_is_windows: bool) -> Result<()> {
    if location.is_local() && host_is_windows && (path.starts_with('/') || path.starts_with('\\')) {
        return Err(LauncherError::Precondition(format!(
            "'{path}' looks like a remote path; local containers need a Windows drive path"
        )));
    }
    Ok(())
}

pub fn is_drive_rooted(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/')
}

fn split_drive(path: &str) -> Option<(char, &str)> {
    let mut chars = path.chars();
    let drive = chars.next()?;
    if !drive.is_ascii_alphabetic() || chars.next()? != ':' {
        return None;
    }
    let rest = &path[2..];
    if rest.is_empty() || rest.starts_with('\\') || rest.starts_with('/') {
        return Some((drive, rest));
    }
    None
}

pub(crate) fn collapse_slashes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut prev_slash = false;
    let mut prev_colon = false;
    let mut in_scheme = false;
    for ch in input.chars() {
        if ch == '/' {
            if prev_colon {
                in_scheme = true;
            }
            if prev_slash && !in_scheme {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
            in_scheme = false;
        }
        prev_colon = ch == ':';
        out.push(ch);
    }
    out
}
