//! Build-root location and package scanning.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use tracing::debug;
use walkdir::WalkDir;

use crate::{
    config::{SailConfig, CONFIG_FILE_NAME},
    manifest::PackageManifest,
    package::Package,
    Error, IGNORE_FILES_ENV,
};

const PACKAGE_MANIFEST: &str = "package.json";

/// Where the build configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationSource {
    /// An explicit `sail.config.json`.
    ConfigFile(Utf8PathBuf),
    /// No config file; the root was inferred from a workspace manifest.
    Inferred(Utf8PathBuf),
}

/// A discovered workspace: root, configuration, packages and release groups.
#[derive(Debug)]
pub struct BuildProject {
    root: Utf8PathBuf,
    configuration_source: ConfigurationSource,
    config: SailConfig,
    packages: BTreeMap<String, Package>,
    release_groups: BTreeMap<String, Vec<String>>,
}

impl BuildProject {
    /// Locates the build root above `search_path` and enumerates its
    /// packages.
    ///
    /// Walks upward for a `sail.config.json`; failing that, for a manifest
    /// with a `workspaces` field. Exclusions come from the configured
    /// `excludeGlobs` and from `SAIL_IGNORE_FILES`, both threaded into the
    /// scanner.
    pub fn discover(search_path: &Utf8Path) -> Result<Self, Error> {
        let env_globs = std::env::var(IGNORE_FILES_ENV)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|glob| !glob.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        Self::discover_with_ignore_globs(search_path, env_globs)
    }

    /// Like [`BuildProject::discover`], with the environment escape hatch
    /// passed explicitly.
    pub fn discover_with_ignore_globs(
        search_path: &Utf8Path,
        extra_ignore_globs: Vec<String>,
    ) -> Result<Self, Error> {
        let (root, configuration_source, config) = find_root(search_path)?;
        debug!(%root, "discovered build root");

        let mut exclude = Vec::with_capacity(config.exclude_globs.len() + extra_ignore_globs.len());
        for pattern in config.exclude_globs.iter().chain(&extra_ignore_globs) {
            exclude.push(Pattern::new(pattern).map_err(|source| Error::BadGlob {
                pattern: pattern.clone(),
                source,
            })?);
        }

        let mut packages = scan_packages(&root, &exclude)?;
        resolve_workspace_dependencies(&mut packages);

        let mut release_groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for package in packages.values() {
            if let Some(group) = package.release_group() {
                release_groups
                    .entry(group.to_owned())
                    .or_default()
                    .push(package.name().to_owned());
            }
        }

        Ok(Self {
            root,
            configuration_source,
            config,
            packages,
            release_groups,
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn configuration_source(&self) -> &ConfigurationSource {
        &self.configuration_source
    }

    pub fn config(&self) -> &SailConfig {
        &self.config
    }

    pub fn packages(&self) -> impl Iterator<Item = &Package> {
        self.packages.values()
    }

    pub fn package(&self, name: &str) -> Option<&Package> {
        self.packages.get(name)
    }

    pub fn package_names(&self) -> impl Iterator<Item = &str> {
        self.packages.keys().map(String::as_str)
    }

    pub fn release_groups(&self) -> &BTreeMap<String, Vec<String>> {
        &self.release_groups
    }
}

fn find_root(
    search_path: &Utf8Path,
) -> Result<(Utf8PathBuf, ConfigurationSource, SailConfig), Error> {
    // First pass: an explicit config file wins over any workspace manifest.
    for dir in search_path.ancestors() {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            let config = read_json::<SailConfig>(&candidate)?;
            return Ok((
                dir.to_owned(),
                ConfigurationSource::ConfigFile(candidate),
                config,
            ));
        }
    }

    // Second pass: infer the root from a workspace manifest.
    for dir in search_path.ancestors() {
        let candidate = dir.join(PACKAGE_MANIFEST);
        if candidate.is_file() {
            let manifest = read_json::<PackageManifest>(&candidate)?;
            if manifest.workspaces.is_some() {
                return Ok((
                    dir.to_owned(),
                    ConfigurationSource::Inferred(candidate),
                    SailConfig::default(),
                ));
            }
        }
    }

    Err(Error::NoBuildRoot(search_path.to_owned()))
}

/// Scans the root for package manifests, always excluding
/// `**/node_modules/**` plus the caller-provided globs.
fn scan_packages(
    root: &Utf8Path,
    exclude: &[Pattern],
) -> Result<BTreeMap<String, Package>, Error> {
    let mut packages: BTreeMap<String, Package> = BTreeMap::new();

    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        let name = entry.file_name().to_string_lossy();
        name != "node_modules" && name != ".git"
    });

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() || entry.file_name() != PACKAGE_MANIFEST {
            continue;
        }
        let path = Utf8PathBuf::from_path_buf(entry.path().to_owned())
            .map_err(Error::NonUtf8Path)?;
        let directory = path
            .parent()
            .expect("manifest path has a parent")
            .to_owned();

        // The root manifest is the workspace definition, not a package.
        if directory == root {
            continue;
        }

        let relative = path.strip_prefix(root).unwrap_or(&path);
        if exclude
            .iter()
            .any(|pattern| pattern.matches_path(relative.as_std_path()))
        {
            debug!(path = %relative, "manifest excluded by glob");
            continue;
        }

        let manifest = read_json::<PackageManifest>(&path)?;
        let name = manifest.name.clone();
        let package = Package::new(manifest, directory.clone());
        if let Some(existing) = packages.get(&name) {
            return Err(Error::DuplicatePackageName {
                name,
                first: existing.directory().join(PACKAGE_MANIFEST),
                second: path,
            });
        }
        packages.insert(name, package);
    }

    Ok(packages)
}

fn resolve_workspace_dependencies(packages: &mut BTreeMap<String, Package>) {
    let names: Vec<String> = packages.keys().cloned().collect();
    for package in packages.values_mut() {
        let deps = package
            .manifest()
            .declared_dependencies()
            .filter(|dep| names.iter().any(|name| name == dep))
            .map(str::to_owned)
            .collect();
        package.set_workspace_dependencies(deps);
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Utf8Path) -> Result<T, Error> {
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(|source| Error::Parse {
        path: path.to_owned(),
        source,
    })
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use pretty_assertions::assert_eq;

    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: Utf8PathBuf,
    }

    impl Fixture {
        fn new(config: &str) -> Result<Self> {
            let dir = tempfile::tempdir()?;
            let root = Utf8PathBuf::from_path_buf(dir.path().canonicalize()?).unwrap();
            std::fs::write(root.join(CONFIG_FILE_NAME), config)?;
            Ok(Self { _dir: dir, root })
        }

        fn add_package(&self, rel_dir: &str, manifest: &str) -> Result<()> {
            let dir = self.root.join(rel_dir);
            std::fs::create_dir_all(&dir)?;
            std::fs::write(dir.join(PACKAGE_MANIFEST), manifest)?;
            Ok(())
        }
    }

    #[test]
    fn test_discovers_packages_from_config_root() -> Result<()> {
        let fixture = Fixture::new("{}")?;
        fixture.add_package("packages/alpha", r#"{ "name": "alpha" }"#)?;
        fixture.add_package("packages/beta", r#"{ "name": "beta" }"#)?;

        // Discovery from a nested path walks up to the config.
        let nested = fixture.root.join("packages/alpha");
        let project = BuildProject::discover_with_ignore_globs(&nested, vec![])?;

        assert_eq!(project.root(), fixture.root);
        assert_eq!(
            project.package_names().collect::<Vec<_>>(),
            vec!["alpha", "beta"]
        );
        assert!(matches!(
            project.configuration_source(),
            ConfigurationSource::ConfigFile(_)
        ));
        Ok(())
    }

    #[test]
    fn test_infers_root_from_workspace_manifest() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = Utf8PathBuf::from_path_buf(dir.path().canonicalize()?).unwrap();
        std::fs::write(
            root.join(PACKAGE_MANIFEST),
            r#"{ "name": "monorepo", "workspaces": ["packages/*"] }"#,
        )?;
        let pkg_dir = root.join("packages/gamma");
        std::fs::create_dir_all(&pkg_dir)?;
        std::fs::write(pkg_dir.join(PACKAGE_MANIFEST), r#"{ "name": "gamma" }"#)?;

        let project = BuildProject::discover_with_ignore_globs(&root, vec![])?;
        assert!(matches!(
            project.configuration_source(),
            ConfigurationSource::Inferred(_)
        ));
        assert_eq!(project.package_names().collect::<Vec<_>>(), vec!["gamma"]);
        Ok(())
    }

    #[test]
    fn test_configured_exclude_globs_reach_the_scanner() -> Result<()> {
        let fixture = Fixture::new(r#"{ "excludeGlobs": ["legacy/**"] }"#)?;
        fixture.add_package("packages/alpha", r#"{ "name": "alpha" }"#)?;
        fixture.add_package("legacy/old", r#"{ "name": "old" }"#)?;

        let project = BuildProject::discover_with_ignore_globs(&fixture.root, vec![])?;
        assert_eq!(project.package_names().collect::<Vec<_>>(), vec!["alpha"]);
        Ok(())
    }

    #[test]
    fn test_extra_ignore_globs_compose_with_config() -> Result<()> {
        let fixture = Fixture::new(r#"{ "excludeGlobs": ["legacy/**"] }"#)?;
        fixture.add_package("packages/alpha", r#"{ "name": "alpha" }"#)?;
        fixture.add_package("legacy/old", r#"{ "name": "old" }"#)?;
        fixture.add_package("scratch/tmp", r#"{ "name": "tmp" }"#)?;

        let project = BuildProject::discover_with_ignore_globs(
            &fixture.root,
            vec!["scratch/**".to_owned()],
        )?;
        assert_eq!(project.package_names().collect::<Vec<_>>(), vec!["alpha"]);
        Ok(())
    }

    #[test]
    fn test_node_modules_are_always_excluded() -> Result<()> {
        let fixture = Fixture::new("{}")?;
        fixture.add_package("packages/alpha", r#"{ "name": "alpha" }"#)?;
        fixture.add_package(
            "packages/alpha/node_modules/vendored",
            r#"{ "name": "vendored" }"#,
        )?;

        let project = BuildProject::discover_with_ignore_globs(&fixture.root, vec![])?;
        assert_eq!(project.package_names().collect::<Vec<_>>(), vec!["alpha"]);
        Ok(())
    }

    #[test]
    fn test_duplicate_package_names_are_fatal_and_name_both_locations() -> Result<()> {
        let fixture = Fixture::new("{}")?;
        fixture.add_package("packages/one", r#"{ "name": "dup" }"#)?;
        fixture.add_package("packages/two", r#"{ "name": "dup" }"#)?;

        let err = BuildProject::discover_with_ignore_globs(&fixture.root, vec![]).unwrap_err();
        match err {
            Error::DuplicatePackageName { name, first, second } => {
                assert_eq!(name, "dup");
                let mut dirs = vec![first.to_string(), second.to_string()];
                dirs.sort();
                assert!(dirs[0].contains("packages/one"), "{dirs:?}");
                assert!(dirs[1].contains("packages/two"), "{dirs:?}");
            }
            other => panic!("expected DuplicatePackageName, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_workspace_dependencies_and_release_groups() -> Result<()> {
        let fixture = Fixture::new("{}")?;
        fixture.add_package(
            "packages/lib",
            r#"{ "name": "lib", "releaseGroup": "client" }"#,
        )?;
        fixture.add_package(
            "packages/app",
            r#"{
                "name": "app",
                "releaseGroup": "client",
                "dependencies": { "lib": "workspace:*", "left-pad": "^1.0.0" }
            }"#,
        )?;

        let project = BuildProject::discover_with_ignore_globs(&fixture.root, vec![])?;
        let app = project.package("app").unwrap();
        assert_eq!(app.workspace_dependencies(), ["lib"]);

        assert_eq!(
            project.release_groups().get("client").unwrap(),
            &vec!["app".to_owned(), "lib".to_owned()]
        );
        Ok(())
    }

    #[test]
    fn test_no_build_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().canonicalize().unwrap()).unwrap();
        let err = BuildProject::discover_with_ignore_globs(&root, vec![]).unwrap_err();
        assert!(matches!(err, Error::NoBuildRoot(_)), "{err:?}");
    }
}
