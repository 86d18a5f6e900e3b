//! Named credentials for source storage.
//!
//! Stage tasks refer to credentials by id; a [`CredentialProvider`] turns
//! that id into key material at execution time so secrets never live in
//! pipeline definitions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors resolving credentials.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    /// No credentials registered under this id.
    #[error("unknown credentials: {0}")]
    NotFound(String),

    /// A required variable is not set.
    #[error("credentials '{id}': variable {variable} is not set")]
    MissingVariable { id: String, variable: String },
}

/// Access key pair for object storage.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    secret_access_key: String,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
        }
    }

    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Resolves a credentials id to key material.
pub trait CredentialProvider: Send + Sync {
    fn resolve(&self, id: &str) -> Result<Credentials, CredentialError>;
}

/// A fixed set of credentials, mostly for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    entries: HashMap<String, Credentials>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: register credentials under `id`.
    pub fn with(mut self, id: impl Into<String>, credentials: Credentials) -> Self {
        self.entries.insert(id.into(), credentials);
        self
    }
}

impl CredentialProvider for StaticCredentials {
    fn resolve(&self, id: &str) -> Result<Credentials, CredentialError> {
        self.entries
            .get(id)
            .cloned()
            .ok_or_else(|| CredentialError::NotFound(id.to_string()))
    }
}

type Lookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads `<ID>_ACCESS_KEY_ID` and `<ID>_SECRET_ACCESS_KEY` from the process
/// environment. The id is upper-cased and every non-alphanumeric character
/// becomes `_`, so `aws-credentials` reads `AWS_CREDENTIALS_ACCESS_KEY_ID`.
#[derive(Clone)]
pub struct EnvCredentials {
    lookup: Lookup,
}

impl EnvCredentials {
    pub fn new() -> Self {
        Self::with_lookup(|name| std::env::var(name).ok())
    }

    /// Use a custom variable lookup instead of the process environment.
    pub fn with_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            lookup: Arc::new(lookup),
        }
    }

    fn variable(id: &str, suffix: &str) -> String {
        let stem: String = id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}_{}", stem, suffix)
    }

    fn read(&self, id: &str, suffix: &str) -> Result<String, CredentialError> {
        let variable = Self::variable(id, suffix);
        (self.lookup)(&variable)
            .filter(|v| !v.is_empty())
            .ok_or(CredentialError::MissingVariable {
                id: id.to_string(),
                variable,
            })
    }
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EnvCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvCredentials").finish_non_exhaustive()
    }
}

impl CredentialProvider for EnvCredentials {
    fn resolve(&self, id: &str) -> Result<Credentials, CredentialError> {
        debug!(credentials = %id, "resolving credentials from environment");
        let access_key_id = self.read(id, "ACCESS_KEY_ID")?;
        let secret_access_key = self.read(id, "SECRET_ACCESS_KEY")?;
        Ok(Credentials::new(access_key_id, secret_access_key))
    }
}
