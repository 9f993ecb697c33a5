//! Per-user cache locations for precompiled tamper-handler fragments.

use std::path::PathBuf;

/// File name for a precompiled handler fragment, keyed by target
/// architecture and OS so that one cache directory can serve cross builds.
pub fn handler_file_name(arch: &str, os: &str) -> String {
    format!("antihook-handler-{arch}-{os}.bc")
}

/// Default location of the precompiled handler fragment for a target.
///
/// Resolves to `$HOME/.vigil/antihook-handler-<arch>-<os>.bc`. Returns `None`
/// when no home directory can be determined; callers treat that the same as a
/// missing handler file (non-fatal, fall back to the trap/abort response).
pub fn handler_cache_path(arch: &str, os: &str) -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    let mut path = PathBuf::from(home);
    path.push(".vigil");
    path.push(handler_file_name(arch, os));
    Some(path)
}
