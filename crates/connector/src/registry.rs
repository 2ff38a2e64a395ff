//! Helper registry: maps (platform, application) to a helper executable.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Built-in helpers shipped with the connector.
const BUILTIN: &[(&str, &str, &str)] = &[
    ("darwin", "keynote", "connector-osx-kn5.sh"),
    ("darwin", "keynote5", "connector-osx-kn5.sh"),
    ("darwin", "keynote6", "connector-osx-kn6.sh"),
    ("darwin", "powerpoint", "connector-osx-ppt2011.sh"),
    ("darwin", "powerpoint2011", "connector-osx-ppt2011.sh"),
    ("darwin", "powerpoint2016", "connector-osx-ppt2011.sh"),
    ("win32", "powerpoint", "connector-win-ppt2010.bat"),
    ("win32", "powerpoint2010", "connector-win-ppt2010.bat"),
    ("win32", "powerpoint2013", "connector-win-ppt2010.bat"),
];

/// Composite registry key, rendered as `{platform}-{application}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HelperKey {
    platform_id: String,
    application_id: String,
}

impl HelperKey {
    pub fn new(platform_id: impl Into<String>, application_id: impl Into<String>) -> Self {
        Self {
            platform_id: platform_id.into(),
            application_id: application_id.into(),
        }
    }

    pub fn platform_id(&self) -> &str {
        &self.platform_id
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }
}

impl fmt::Display for HelperKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.platform_id, self.application_id)
    }
}

/// A helper executable known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperDescriptor {
    #[serde(rename = "platform")]
    pub platform_id: String,
    #[serde(rename = "application")]
    pub application_id: String,
    #[serde(rename = "executable")]
    pub executable_name: String,
}

impl HelperDescriptor {
    pub fn new(
        platform_id: impl Into<String>,
        application_id: impl Into<String>,
        executable_name: impl Into<String>,
    ) -> Self {
        Self {
            platform_id: platform_id.into(),
            application_id: application_id.into(),
            executable_name: executable_name.into(),
        }
    }

    pub fn key(&self) -> HelperKey {
        HelperKey::new(&self.platform_id, &self.application_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unsupported platform/application combination: {key}")]
    UnsupportedCombination { key: HelperKey },
    #[error("duplicate helper registration: {key}")]
    DuplicateHelper { key: HelperKey },
    #[error("failed to load registry: {0}")]
    Load(String),
}

/// Immutable-after-construction table of helper descriptors.
///
/// Built once at startup and handed to the bridge; nothing reads it from
/// global state.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    helpers: BTreeMap<HelperKey, HelperDescriptor>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The connector's own helper table.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for (platform, application, executable) in BUILTIN {
            let descriptor = HelperDescriptor::new(*platform, *application, *executable);
            registry.helpers.insert(descriptor.key(), descriptor);
        }
        registry
    }

    /// Load descriptors from a JSON array of
    /// `{"platform": …, "application": …, "executable": …}` objects.
    pub fn from_json(json: &str) -> Result<Self, RegistryError> {
        let descriptors: Vec<HelperDescriptor> =
            serde_json::from_str(json).map_err(|e| RegistryError::Load(e.to_string()))?;
        let mut registry = Self::new();
        for descriptor in descriptors {
            registry.insert(descriptor)?;
        }
        Ok(registry)
    }

    /// Add a descriptor. Fails if its composite key is already taken.
    pub fn insert(&mut self, descriptor: HelperDescriptor) -> Result<(), RegistryError> {
        if descriptor.platform_id.is_empty()
            || descriptor.application_id.is_empty()
            || descriptor.executable_name.is_empty()
        {
            return Err(RegistryError::Load(format!(
                "helper descriptor has empty fields: {:?}",
                descriptor
            )));
        }
        let key = descriptor.key();
        if self.helpers.contains_key(&key) {
            return Err(RegistryError::DuplicateHelper { key });
        }
        self.helpers.insert(key, descriptor);
        Ok(())
    }

    pub fn with(mut self, descriptor: HelperDescriptor) -> Result<Self, RegistryError> {
        self.insert(descriptor)?;
        Ok(self)
    }

    /// Look up the helper for a platform/application pair.
    pub fn resolve(
        &self,
        platform_id: &str,
        application_id: &str,
    ) -> Result<&HelperDescriptor, RegistryError> {
        let key = HelperKey::new(platform_id, application_id);
        match self.helpers.get(&key) {
            Some(descriptor) => {
                tracing::debug!(%key, executable = %descriptor.executable_name, "Resolved helper");
                Ok(descriptor)
            }
            None => Err(RegistryError::UnsupportedCombination { key }),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &HelperDescriptor> {
        self.helpers.values()
    }

    pub fn len(&self) -> usize {
        self.helpers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.helpers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_resolves_known_pairs() {
        let registry = Registry::builtin();
        assert_eq!(registry.len(), 9);

        let kn = registry.resolve("darwin", "keynote6").unwrap();
        assert_eq!(kn.executable_name, "connector-osx-kn6.sh");

        let ppt = registry.resolve("win32", "powerpoint2013").unwrap();
        assert_eq!(ppt.executable_name, "connector-win-ppt2010.bat");
    }

    #[test]
    fn unknown_pair_is_unsupported() {
        let registry = Registry::builtin();
        let err = registry.resolve("linux", "keynote").unwrap_err();
        match err {
            RegistryError::UnsupportedCombination { key } => {
                assert_eq!(key.to_string(), "linux-keynote");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unsupported_message_carries_key() {
        let err = Registry::builtin().resolve("win32", "keynote").unwrap_err();
        assert_eq!(
            err.to_string(),
            "unsupported platform/application combination: win32-keynote"
        );
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let result = Registry::new()
            .with(HelperDescriptor::new("linux", "impress", "a.sh"))
            .and_then(|r| r.with(HelperDescriptor::new("linux", "impress", "b.sh")));
        assert!(matches!(result, Err(RegistryError::DuplicateHelper { .. })));
    }

    #[test]
    fn loads_from_json() {
        let json = r#"[
            {"platform": "linux", "application": "impress", "executable": "connector-linux-impress.sh"},
            {"platform": "darwin", "application": "keynote", "executable": "kn.sh"}
        ]"#;
        let registry = Registry::from_json(json).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.resolve("linux", "impress").unwrap().executable_name,
            "connector-linux-impress.sh"
        );
    }

    #[test]
    fn json_with_duplicates_fails() {
        let json = r#"[
            {"platform": "linux", "application": "impress", "executable": "a.sh"},
            {"platform": "linux", "application": "impress", "executable": "b.sh"}
        ]"#;
        assert!(matches!(
            Registry::from_json(json),
            Err(RegistryError::DuplicateHelper { .. })
        ));
    }

    #[test]
    fn json_with_empty_fields_fails() {
        let json = r#"[{"platform": "linux", "application": "", "executable": "a.sh"}]"#;
        assert!(matches!(Registry::from_json(json), Err(RegistryError::Load(_))));
    }

    #[test]
    fn descriptor_serializes() {
        let descriptor = HelperDescriptor::new("darwin", "keynote", "connector-osx-kn5.sh");
        insta::assert_json_snapshot!(descriptor, @r#"
        {
          "platform": "darwin",
          "application": "keynote",
          "executable": "connector-osx-kn5.sh"
        }
        "#);
    }
}
