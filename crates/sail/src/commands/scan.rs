use camino::Utf8PathBuf;
use sail_workspace::{BuildProject, ConfigurationSource};

use super::print_kv;
use crate::Error;

/// Enumerates the workspace and prints the package tree. Doubles as the
/// contract that discovery is queryable on its own.
pub async fn scan(path: Option<Utf8PathBuf>) -> Result<i32, Error> {
    let search_path = super::search_path(path)?;
    let project = BuildProject::discover(&search_path)?;

    print_kv(0, "root", project.root().as_str());
    let source = match project.configuration_source() {
        ConfigurationSource::ConfigFile(path) => format!("config file {path}"),
        ConfigurationSource::Inferred(path) => format!("inferred from {path}"),
    };
    print_kv(0, "configuration", &source);

    println!("packages:");
    for package in project.packages() {
        print_kv(2, package.name(), package.directory().as_str());
        if !package.workspace_dependencies().is_empty() {
            print_kv(4, "depends on", &package.workspace_dependencies().join(", "));
        }
        if let Some(group) = package.release_group() {
            print_kv(4, "release group", group);
        }
    }

    if !project.release_groups().is_empty() {
        println!("release groups:");
        for (group, members) in project.release_groups() {
            print_kv(2, group, &members.join(", "));
        }
    }
    Ok(0)
}
