//! Credential Vault
//!
//! Credentials are referenced from playbooks by name and resolved only at
//! execution time. The vault itself is an external collaborator; the
//! in-memory implementation here backs the CLI and tests.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{OrchestratorError, Result};

/// A stored username/secret pair.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    pub name: String,
    pub username: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_url: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl Credential {
    pub fn new(
        name: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            username: username.into(),
            password: password.into(),
            gateway_url: None,
            description: String::new(),
        }
    }

    /// Value substituted for a credential parameter.
    ///
    /// Steps reach the fields through `{{ param.username }}` and
    /// `{{ param.password }}` placeholders.
    pub fn to_parameter_value(&self) -> Value {
        let mut value = json!({
            "name": self.name,
            "username": self.username,
            "password": self.password,
        });
        if let (Some(url), Some(map)) = (&self.gateway_url, value.as_object_mut()) {
            map.insert("gateway_url".to_string(), Value::String(url.clone()));
        }
        value
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("name", &self.name)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("gateway_url", &self.gateway_url)
            .finish()
    }
}

/// Looks up credentials by name.
#[async_trait]
pub trait CredentialVault: Send + Sync {
    /// Returns the credential, or `None` when no credential has that name.
    async fn get_credential(&self, name: &str) -> Result<Option<Credential>>;
}

/// Vault holding credentials in memory.
#[derive(Default)]
pub struct InMemoryVault {
    credentials: RwLock<HashMap<String, Credential>>,
}

impl InMemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a credential.
    pub fn insert(&self, credential: Credential) {
        self.credentials
            .write()
            .insert(credential.name.clone(), credential);
    }

    /// Loads credentials from a YAML list file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Config(format!(
                "Failed to read credentials file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let credentials: Vec<Credential> = serde_yaml::from_str(&content)?;

        let vault = Self::new();
        for credential in credentials {
            vault.insert(credential);
        }
        Ok(vault)
    }

    /// Number of stored credentials.
    pub fn len(&self) -> usize {
        self.credentials.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.read().is_empty()
    }
}

#[async_trait]
impl CredentialVault for InMemoryVault {
    async fn get_credential(&self, name: &str) -> Result<Option<Credential>> {
        Ok(self.credentials.read().get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_vault_lookup() {
        let vault = InMemoryVault::new();
        vault.insert(Credential::new("prod", "admin", "secret"));

        let found = vault.get_credential("prod").await.unwrap();
        assert_eq!(found.unwrap().username, "admin");
        assert!(vault.get_credential("dev").await.unwrap().is_none());
    }

    #[test]
    fn test_debug_redacts_password() {
        let cred = Credential::new("prod", "admin", "hunter2");
        let printed = format!("{:?}", cred);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("redacted"));
    }

    #[test]
    fn test_parameter_value_fields() {
        let mut cred = Credential::new("prod", "admin", "pw");
        cred.gateway_url = Some("http://gw:8088".to_string());
        let value = cred.to_parameter_value();
        assert_eq!(value["username"], "admin");
        assert_eq!(value["password"], "pw");
        assert_eq!(value["gateway_url"], "http://gw:8088");
    }

    #[test]
    fn test_vault_from_yaml_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("creds.yaml");
        std::fs::write(
            &path,
            "- name: prod\n  username: admin\n  password: pw\n- name: qa\n  username: qa\n  password: qa\n",
        )
        .unwrap();

        let vault = InMemoryVault::from_yaml_file(&path).unwrap();
        assert_eq!(vault.len(), 2);
    }

    #[test]
    fn test_vault_from_missing_file() {
        let result = InMemoryVault::from_yaml_file("/nonexistent/creds.yaml");
        assert!(matches!(result, Err(OrchestratorError::Config(_))));
    }
}
