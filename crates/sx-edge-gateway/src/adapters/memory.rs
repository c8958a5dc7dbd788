//! In-memory identity source.
//!
//! Holds projects and key records behind one lock so that regenerating a key
//! swaps the old hash for the new one in a single step: once `regenerate`
//! returns, the old secret no longer validates. Only SHA-256 hashes of
//! secrets are kept; a secret is returned exactly once, when issued.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rand::RngCore;
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

use crate::domain::config::StaticKey;
use crate::domain::error::IdentityError;
use crate::domain::types::{ApiKeyRecord, KeyHash, Project, ProjectId};
use crate::ports::{IdentitySource, KeyValidation};

const SECRET_PREFIX: &str = "sk_live_";

/// Key administration failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyAdminError {
    #[error("unknown project: {0}")]
    UnknownProject(String),
    #[error("unknown key: {0}")]
    UnknownKey(Uuid),
    #[error("upstream base url must be an absolute http(s) url: {0}")]
    InvalidUpstream(String),
}

#[derive(Default)]
struct Registry {
    projects: HashMap<ProjectId, Project>,
    keys: HashMap<KeyHash, ApiKeyRecord>,
    hash_by_id: HashMap<Uuid, KeyHash>,
}

impl Registry {
    fn insert_key(&mut self, project_id: ProjectId, secret: &str) -> ApiKeyRecord {
        let record = ApiKeyRecord {
            id: Uuid::new_v4(),
            project_id,
            secret_hash: KeyHash::of(secret),
            active: true,
            created_at: Utc::now(),
        };
        self.hash_by_id.insert(record.id, record.secret_hash);
        self.keys.insert(record.secret_hash, record.clone());
        record
    }
}

#[derive(Default)]
pub struct InMemoryIdentitySource {
    registry: RwLock<Registry>,
}

impl InMemoryIdentitySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from keys declared in configuration.
    pub fn from_static_keys(keys: &[StaticKey]) -> Result<Self, KeyAdminError> {
        let source = Self::new();
        {
            let mut registry = source.registry.write();
            for key in keys {
                validate_upstream(&key.upstream_base_url)?;
                let project_id = ProjectId::new(key.project_id.clone());
                registry
                    .projects
                    .entry(project_id.clone())
                    .or_insert_with(|| Project {
                        id: project_id.clone(),
                        name: key.project_name.clone(),
                        upstream_base_url: key.upstream_base_url.clone(),
                        created_at: Utc::now(),
                    });
                registry.insert_key(project_id, &key.secret);
            }
        }
        info!(keys = keys.len(), "Loaded static API keys");
        Ok(source)
    }

    pub fn create_project(
        &self,
        name: &str,
        upstream_base_url: &str,
    ) -> Result<Project, KeyAdminError> {
        validate_upstream(upstream_base_url)?;
        let project = Project {
            id: ProjectId::new(format!("proj_{}", Uuid::new_v4().simple())),
            name: name.to_string(),
            upstream_base_url: upstream_base_url.to_string(),
            created_at: Utc::now(),
        };
        self.registry
            .write()
            .projects
            .insert(project.id.clone(), project.clone());
        Ok(project)
    }

    /// Issue a new key; the returned secret is not retrievable later.
    pub fn issue_key(&self, project_id: &ProjectId) -> Result<(ApiKeyRecord, String), KeyAdminError> {
        let mut registry = self.registry.write();
        if !registry.projects.contains_key(project_id) {
            return Err(KeyAdminError::UnknownProject(project_id.to_string()));
        }
        let secret = generate_secret();
        let record = registry.insert_key(project_id.clone(), &secret);
        Ok((record, secret))
    }

    /// Replace a key's secret. The old secret stops validating atomically.
    pub fn regenerate(&self, key_id: Uuid) -> Result<String, KeyAdminError> {
        let mut registry = self.registry.write();
        let old_hash = registry
            .hash_by_id
            .get(&key_id)
            .copied()
            .ok_or(KeyAdminError::UnknownKey(key_id))?;
        let mut record = registry
            .keys
            .remove(&old_hash)
            .ok_or(KeyAdminError::UnknownKey(key_id))?;

        let secret = generate_secret();
        record.secret_hash = KeyHash::of(&secret);
        record.created_at = Utc::now();
        registry.hash_by_id.insert(key_id, record.secret_hash);
        registry.keys.insert(record.secret_hash, record);
        Ok(secret)
    }

    pub fn revoke(&self, key_id: Uuid) -> Result<ProjectId, KeyAdminError> {
        let mut registry = self.registry.write();
        let hash = registry
            .hash_by_id
            .get(&key_id)
            .copied()
            .ok_or(KeyAdminError::UnknownKey(key_id))?;
        let record = registry
            .keys
            .get_mut(&hash)
            .ok_or(KeyAdminError::UnknownKey(key_id))?;
        record.active = false;
        Ok(record.project_id.clone())
    }

    pub fn project(&self, project_id: &ProjectId) -> Option<Project> {
        self.registry.read().projects.get(project_id).cloned()
    }
}

#[async_trait]
impl IdentitySource for InMemoryIdentitySource {
    async fn validate(&self, secret: &str) -> Result<Option<KeyValidation>, IdentityError> {
        let registry = self.registry.read();
        let Some(record) = registry.keys.get(&KeyHash::of(secret)) else {
            return Ok(None);
        };
        let Some(project) = registry.projects.get(&record.project_id) else {
            return Ok(None);
        };
        Ok(Some(KeyValidation {
            project_id: record.project_id.clone(),
            upstream_base_url: project.upstream_base_url.clone(),
            active: record.active,
        }))
    }
}

fn generate_secret() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}{}", SECRET_PREFIX, hex::encode(bytes))
}

fn validate_upstream(url: &str) -> Result<(), KeyAdminError> {
    match reqwest::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") && parsed.has_host() => Ok(()),
        _ => Err(KeyAdminError::InvalidUpstream(url.to_string())),
    }
}
