//! Parsed package manifests.

use std::collections::BTreeMap;

use serde::Deserialize;

/// How a package pins its dependencies on sibling workspace packages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterdependencyRange {
    Exact,
    #[default]
    Caret,
    Tilde,
    Workspace,
}

/// The parsed on-disk manifest of one package.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub dev_dependencies: BTreeMap<String, String>,
    /// Label grouping packages that version together.
    #[serde(default)]
    pub release_group: Option<String>,
    #[serde(default)]
    pub interdependency_range: InterdependencyRange,
    /// Workspace member globs; only meaningful on the root manifest.
    #[serde(default)]
    pub workspaces: Option<Vec<String>>,
}

impl PackageManifest {
    pub fn script(&self, name: &str) -> Option<&str> {
        self.scripts.get(name).map(String::as_str)
    }

    /// Names of all declared dependencies, production and dev.
    pub fn declared_dependencies(&self) -> impl Iterator<Item = &str> {
        self.dependencies
            .keys()
            .chain(self.dev_dependencies.keys())
            .map(String::as_str)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_manifest_round_trip() {
        let manifest: PackageManifest = serde_json::from_str(
            r#"{
                "name": "@scope/alpha",
                "version": "1.2.3",
                "scripts": { "compile": "tsc -p ." },
                "dependencies": { "@scope/lib": "workspace:*" },
                "devDependencies": { "eslint": "^8.0.0" },
                "releaseGroup": "client",
                "interdependencyRange": "workspace"
            }"#,
        )
        .unwrap();

        assert_eq!(manifest.name, "@scope/alpha");
        assert_eq!(manifest.script("compile"), Some("tsc -p ."));
        assert_eq!(
            manifest.declared_dependencies().collect::<Vec<_>>(),
            vec!["@scope/lib", "eslint"]
        );
        assert_eq!(manifest.release_group.as_deref(), Some("client"));
        assert_eq!(
            manifest.interdependency_range,
            InterdependencyRange::Workspace
        );
    }

    #[test]
    fn test_minimal_manifest() {
        let manifest: PackageManifest = serde_json::from_str(r#"{ "name": "tiny" }"#).unwrap();
        assert_eq!(manifest.name, "tiny");
        assert!(manifest.scripts.is_empty());
        assert_eq!(manifest.interdependency_range, InterdependencyRange::Caret);
    }
}
