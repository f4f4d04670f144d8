mod build;
mod policy;
mod scan;

pub use build::build;
pub use policy::policy;
pub use scan::scan;

use camino::Utf8PathBuf;

use crate::Error;

/// The discovery starting point: an explicit `--path`, or the current
/// directory.
pub fn search_path(explicit: Option<Utf8PathBuf>) -> Result<Utf8PathBuf, Error> {
    match explicit {
        Some(path) if path.is_absolute() => Ok(path),
        Some(path) => Ok(current_dir()?.join(path)),
        None => current_dir(),
    }
}

fn current_dir() -> Result<Utf8PathBuf, Error> {
    let cwd = std::env::current_dir().map_err(|source| Error::Io {
        path: Utf8PathBuf::from("."),
        source,
    })?;
    Utf8PathBuf::from_path_buf(cwd)
        .map_err(|path| Error::Internal(format!("current directory is not UTF-8: {}", path.display())))
}

pub(crate) fn print_kv(indent: usize, key: &str, value: &str) {
    println!("{:indent$}{key}: {value}", "", indent = indent);
}
