//! Locates the helper binaries the tunnels are built from.

use std::path::PathBuf;

use portbridge_core::forward::HelperPaths;

const KNOWN_DIRS: &[&str] = &["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin", "/bin"];

/// Search the well-known install locations and PATH for an executable.
fn find_executable(name: &str) -> Option<PathBuf> {
    for dir in KNOWN_DIRS {
        let candidate = PathBuf::from(dir).join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }

    if let Some(path) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path) {
            let candidate = dir.join(name);
            if is_executable(&candidate) {
                return Some(candidate);
            }
        }
    }

    None
}

#[cfg(unix)]
fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &std::path::Path) -> bool {
    path.is_file()
}

/// Locate kubectl and socat. Missing helpers are reported lazily when a
/// connection actually needs them.
pub fn locate_helpers() -> HelperPaths {
    let kubectl = find_executable("kubectl");
    let socat = find_executable("socat");

    if kubectl.is_none() {
        tracing::warn!("kubectl not found in known locations or PATH");
    }
    if socat.is_none() {
        tracing::warn!("socat not found in known locations or PATH");
    }

    HelperPaths { kubectl, socat }
}
