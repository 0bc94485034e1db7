//! Runtime process/host metadata surfaced by the admin `/stats` endpoint.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessInfoError {
    #[error("I/O error occurred: {0}")]
    IoError(#[from] std::io::Error),

    #[error("UTF-8 error occurred: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),

    #[error("command failed with non-zero exit status ({status}): {stderr}")]
    ExitStatusError { status: i32, stderr: String },

    #[error("failed to execute the command: {0}")]
    ExecutionError(String),
}

/// Snapshot of the running server's process and host identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub process_current_exe: String,
    pub process_basename: String,
    pub process_location: String,
    pub process_pid: i64,
    pub process_uid: String,
    pub process_user: String,
    pub process_host: String,
    pub process_host_ip: String,
}

/// Collects [`ProcessInfo`] for the currently running binary.
pub fn get_process_info() -> Result<ProcessInfo, ProcessInfoError> {
    let current_exe = get_current_exe()?;
    let basename = get_process_basename(&current_exe)?;
    let location = get_process_location(&current_exe)?;
    let pid = std::process::id() as i64;
    let (uid, user) = get_process_user()?;
    let (host, host_ip) = get_process_host()?;

    Ok(ProcessInfo {
        process_current_exe: current_exe.to_string_lossy().into_owned(),
        process_basename: basename,
        process_location: location,
        process_pid: pid,
        process_uid: uid,
        process_user: user,
        process_host: host,
        process_host_ip: host_ip,
    })
}

fn get_current_exe() -> Result<PathBuf, ProcessInfoError> {
    env::current_exe().map_err(ProcessInfoError::IoError)
}

fn get_process_basename(exe_path: &Path) -> Result<String, ProcessInfoError> {
    exe_path
        .file_name()
        .and_then(|f| f.to_str())
        .map(|name| Path::new(name).file_stem().and_then(|s| s.to_str()).unwrap_or(name).to_string())
        .ok_or_else(|| ProcessInfoError::IoError(std::io::Error::new(std::io::ErrorKind::Other, "no file name component")))
}

fn get_process_location(exe_path: &Path) -> Result<String, ProcessInfoError> {
    exe_path
        .parent()
        .and_then(|p| p.to_str())
        .map(str::to_owned)
        .ok_or_else(|| ProcessInfoError::IoError(std::io::Error::new(std::io::ErrorKind::Other, "executable has no parent directory")))
}

/// Shells out to `id -u`/`whoami` (or `whoami /user` on Windows) since the
/// standard library has no portable way to resolve the current username.
fn get_process_user() -> Result<(String, String), ProcessInfoError> {
    let user_name = run_trimmed("whoami", &[])?;

    let user_id = if cfg!(target_os = "windows") {
        run_trimmed("whoami", &["/user"])?
            .split_whitespace()
            .last()
            .unwrap_or_default()
            .to_string()
    } else {
        run_trimmed("id", &["-u"])?
    };

    Ok((user_id, user_name))
}

fn run_trimmed(program: &str, args: &[&str]) -> Result<String, ProcessInfoError> {
    let output = Command::new(program).args(args).output().map_err(|e| ProcessInfoError::ExecutionError(e.to_string()))?;
    if !output.status.success() {
        return Err(ProcessInfoError::ExitStatusError {
            status: output.status.code().unwrap_or(-1),
            stderr: std::str::from_utf8(&output.stderr)?.trim().to_string(),
        });
    }
    Ok(std::str::from_utf8(&output.stdout)?.trim().to_string())
}

fn get_process_host() -> Result<(String, String), ProcessInfoError> {
    let host_name = hostname::get()
        .map(|n| n.to_string_lossy().into_owned())
        .map_err(|e| ProcessInfoError::IoError(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
    let host_ip = local_ip_address::local_ip()
        .map(|ip| ip.to_string())
        .map_err(|e| ProcessInfoError::IoError(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
    Ok((host_name, host_ip))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basename_strips_extension() {
        let path = PathBuf::from("/usr/local/bin/concierge-server.exe");
        assert_eq!(get_process_basename(&path).unwrap(), "concierge-server");
    }

    #[test]
    fn location_is_parent_directory() {
        let path = PathBuf::from("/usr/local/bin/concierge-server");
        assert_eq!(get_process_location(&path).unwrap(), "/usr/local/bin");
    }

    #[test]
    fn process_info_round_trips_through_json() {
        let info = get_process_info().unwrap();
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["process_pid"], info.process_pid);
    }
}
