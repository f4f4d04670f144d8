//! Command-line parsing for leaf tasks.

use std::ffi::OsString;

use camino::Utf8Path;

/// The executable of a command: its first token, unless a declared
/// multi-command executable prefixes it (longest prefix wins), in which case
/// the whole prefix counts as one executable.
pub fn executable(command: &str, multi_command_executables: &[String]) -> String {
    multi_command_executables
        .iter()
        .filter(|prefix| {
            command == prefix.as_str()
                || command
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with(' '))
        })
        .max_by_key(|prefix| prefix.len())
        .cloned()
        .unwrap_or_else(|| {
            command
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_owned()
        })
}

/// Filesystem-safe basename of an executable, used in done-file names.
pub fn executable_basename(executable: &str) -> String {
    executable
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(executable)
        .replace(' ', "-")
}

/// `PATH` with the package-local bin directory prepended, so locally
/// installed binaries resolve before global ones.
pub fn path_with_local_bin(package_dir: &Utf8Path) -> OsString {
    let local_bin = package_dir.join("node_modules").join(".bin");
    let current = std::env::var_os("PATH").unwrap_or_default();
    let mut paths = vec![local_bin.as_std_path().to_owned()];
    paths.extend(std::env::split_paths(&current));
    std::env::join_paths(paths).unwrap_or(current)
}

/// Whether the executable resolves on the adjusted `PATH`. Used for
/// diagnostics only; the spawn itself reports the authoritative error.
pub fn executable_resolves(executable: &str, package_dir: &Utf8Path) -> bool {
    let first_token = executable.split(' ').next().unwrap_or(executable);
    which::which_in(first_token, Some(path_with_local_bin(package_dir)), package_dir).is_ok()
}
