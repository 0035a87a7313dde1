use crate::sink::imds::{InstanceMetadata, MetadataError, RoleCredentials};
use chrono::{Duration, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("{0} is not set and instance metadata is disabled")]
    Missing(&'static str),

    #[error("instance role credentials: {0}")]
    Metadata(#[from] MetadataError),
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl Credentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token,
        }
    }

    /// Read `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and, if present,
    /// `AWS_SESSION_TOKEN`.
    pub fn from_env<F>(env: F) -> Result<Self, CredentialsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &'static str| {
            env(name)
                .filter(|v| !v.is_empty())
                .ok_or(CredentialsError::Missing(name))
        };
        Ok(Self {
            access_key_id: var("AWS_ACCESS_KEY_ID")?,
            secret_access_key: var("AWS_SECRET_ACCESS_KEY")?,
            session_token: var("AWS_SESSION_TOKEN").ok(),
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .field("session_token", &self.session_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Where request credentials come from.
#[derive(Debug)]
pub enum CredentialsProvider {
    Static(Credentials),
    InstanceRole(InstanceRoleProvider),
}

impl CredentialsProvider {
    /// Environment credentials if complete, else the instance role.
    pub fn chain(
        env: Result<Credentials, CredentialsError>,
        metadata: Option<InstanceMetadata>,
    ) -> Result<Self, CredentialsError> {
        match (env, metadata) {
            (Ok(credentials), _) => {
                info!(access_key_id = %credentials.access_key_id, "Using credentials from the environment");
                Ok(Self::Static(credentials))
            }
            (Err(_), Some(metadata)) => {
                info!(endpoint = %metadata.endpoint(), "Using instance role credentials");
                Ok(Self::InstanceRole(InstanceRoleProvider::new(metadata)))
            }
            (Err(e), None) => Err(e),
        }
    }

    pub async fn credentials(&self) -> Result<Credentials, CredentialsError> {
        match self {
            Self::Static(credentials) => Ok(credentials.clone()),
            Self::InstanceRole(provider) => provider.credentials().await,
        }
    }
}

impl From<Credentials> for CredentialsProvider {
    fn from(credentials: Credentials) -> Self {
        Self::Static(credentials)
    }
}

/// Instance role credentials, fetched on first use and again shortly
/// before they expire.
#[derive(Debug)]
pub struct InstanceRoleProvider {
    metadata: InstanceMetadata,
    cached: Mutex<Option<RoleCredentials>>,
}

impl InstanceRoleProvider {
    pub fn new(metadata: InstanceMetadata) -> Self {
        Self {
            metadata,
            cached: Mutex::new(None),
        }
    }

    pub async fn credentials(&self) -> Result<Credentials, CredentialsError> {
        let mut cached = self.cached.lock().await;
        if let Some(role) = cached.as_ref() {
            if role.expiration - refresh_margin() > Utc::now() {
                return Ok(role.credentials.clone());
            }
        }

        let role = self.metadata.role_credentials().await?;
        info!(role = %role.role, expiration = %role.expiration, "Refreshed instance role credentials");
        let credentials = role.credentials.clone();
        *cached = Some(role);
        Ok(credentials)
    }
}

fn refresh_margin() -> Duration {
    Duration::minutes(5)
}
