//! Executable search-path resolution.

use std::path::{Path, PathBuf, MAIN_SEPARATOR};

use tracing::debug;

use crate::env::Environment;

/// Resolve `program` against the executable search path.
///
/// Names containing a path separator are returned unchanged. Otherwise the
/// `PATH` of `env` is searched (falling back to the parent's `PATH` when
/// `env` is `None` or has none), with relative entries taken from `cwd`.
/// When nothing matches, the original name is returned so the platform
/// exec call fails on its own.
pub fn resolve_program(program: &str, env: Option<&Environment>, cwd: Option<&Path>) -> PathBuf {
    if program.contains(MAIN_SEPARATOR) || program.contains('/') {
        return PathBuf::from(program);
    }

    let search_path = env
        .and_then(|env| env.get("PATH").map(ToOwned::to_owned))
        .or_else(|| std::env::var_os("PATH"));
    let cwd = cwd
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    match which::which_in(program, search_path, &cwd) {
        Ok(found) => {
            debug!(%program, resolved = %found.display(), "resolved executable");
            found
        }
        Err(err) => {
            debug!(%program, error = %err, "executable not on search path");
            PathBuf::from(program)
        }
    }
}
