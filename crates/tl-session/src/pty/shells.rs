//! Local shell allow-list

use std::path::Path;

use tl_core::error::SessionError;

/// Shells that may be started without appearing in `/etc/shells`
const ALLOWED_SHELLS_UNIX: &[&str] = &[
    "/bin/sh",
    "/bin/bash",
    "/bin/zsh",
    "/bin/fish",
    "/bin/dash",
    "/bin/ksh",
    "/bin/tcsh",
    "/bin/csh",
    "/usr/bin/sh",
    "/usr/bin/bash",
    "/usr/bin/zsh",
    "/usr/bin/fish",
    "/usr/bin/dash",
    "/usr/bin/ksh",
    "/usr/bin/tcsh",
    "/usr/bin/csh",
    "/usr/local/bin/bash",
    "/usr/local/bin/zsh",
    "/usr/local/bin/fish",
    "/opt/homebrew/bin/bash",
    "/opt/homebrew/bin/zsh",
    "/opt/homebrew/bin/fish",
];

const ALLOWED_SHELLS_WINDOWS: &[&str] = &[
    "cmd.exe",
    "powershell.exe",
    "pwsh.exe",
    "C:\\Windows\\System32\\cmd.exe",
    "C:\\Windows\\System32\\WindowsPowerShell\\v1.0\\powershell.exe",
];

fn allowed_shells() -> &'static [&'static str] {
    if cfg!(windows) {
        ALLOWED_SHELLS_WINDOWS
    } else {
        ALLOWED_SHELLS_UNIX
    }
}

/// Entries of `/etc/shells`
fn system_shells() -> Vec<String> {
    if cfg!(windows) {
        return Vec::new();
    }
    std::fs::read_to_string("/etc/shells")
        .map(|content| {
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Check that a shell is allowed and present
pub fn validate_shell_path(shell: &str) -> Result<String, SessionError> {
    let lower = shell.to_lowercase();
    let listed = allowed_shells()
        .iter()
        .any(|s| s.to_lowercase() == lower)
        || system_shells().iter().any(|s| s == shell);

    if !listed {
        return Err(SessionError::InvalidShell(format!(
            "'{}' is not an allowed shell",
            shell
        )));
    }

    if !cfg!(windows) && !Path::new(shell).exists() {
        return Err(SessionError::InvalidShell(format!(
            "'{}' does not exist",
            shell
        )));
    }

    Ok(shell.to_string())
}

/// Shell to start when none is requested
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| validate_shell_path(s).is_ok())
        .unwrap_or_else(|| {
            if cfg!(windows) {
                "cmd.exe".to_string()
            } else {
                "/bin/sh".to_string()
            }
        })
}

/// Every allowed shell present on this machine, without duplicates
pub fn available_shells() -> Vec<String> {
    let mut shells: Vec<String> = Vec::new();
    let candidates = allowed_shells()
        .iter()
        .map(|s| s.to_string())
        .chain(system_shells());

    for shell in candidates {
        if shells.contains(&shell) {
            continue;
        }
        if cfg!(windows) || Path::new(&shell).exists() {
            shells.push(shell);
        }
    }
    shells
}
