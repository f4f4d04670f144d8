use camino::{Utf8Path, Utf8PathBuf};

use crate::manifest::PackageManifest;

/// One discovered package. Created during discovery, immutable thereafter.
#[derive(Debug, Clone)]
pub struct Package {
    manifest: PackageManifest,
    directory: Utf8PathBuf,
    /// Declared dependencies that resolve to sibling workspace packages.
    workspace_dependencies: Vec<String>,
}

impl Package {
    pub(crate) fn new(manifest: PackageManifest, directory: Utf8PathBuf) -> Self {
        Self {
            manifest,
            directory,
            workspace_dependencies: Vec::new(),
        }
    }

    pub(crate) fn set_workspace_dependencies(&mut self, deps: Vec<String>) {
        self.workspace_dependencies = deps;
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    /// Absolute directory holding the package's manifest.
    pub fn directory(&self) -> &Utf8Path {
        &self.directory
    }

    pub fn manifest(&self) -> &PackageManifest {
        &self.manifest
    }

    pub fn script(&self, name: &str) -> Option<&str> {
        self.manifest.script(name)
    }

    pub fn release_group(&self) -> Option<&str> {
        self.manifest.release_group.as_deref()
    }

    /// Names of sibling workspace packages this package depends on.
    pub fn workspace_dependencies(&self) -> &[String] {
        &self.workspace_dependencies
    }
}
