//! EC2 instance metadata service client.
//!
//! Speaks IMDSv2 (session token) and falls back to IMDSv1 when the token
//! endpoint answers with an error status.

use crate::sink::credentials::Credentials;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_ENDPOINT: &str = "http://169.254.169.254";

/// Kept short: off EC2 every call waits this long before giving up.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

pub const ENDPOINT_ENV: &str = "AWS_EC2_METADATA_SERVICE_ENDPOINT";
pub const DISABLED_ENV: &str = "AWS_EC2_METADATA_DISABLED";

const TOKEN_PATH: &str = "/latest/api/token";
const TOKEN_TTL_HEADER: &str = "x-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_HEADER: &str = "x-aws-ec2-metadata-token";
const TOKEN_TTL_SECONDS: &str = "21600";
const IDENTITY_PATH: &str = "/latest/dynamic/instance-identity/document";
const ROLE_PATH: &str = "/latest/meta-data/iam/security-credentials/";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid metadata endpoint '{0}'")]
    Endpoint(String),

    #[error("metadata service returned status {status} for {path}")]
    Status { status: u16, path: String },

    #[error("no IAM role is attached to this instance")]
    NoRole,

    #[error("role {role} credentials unavailable: {code}")]
    RoleCredentials { role: String, code: String },
}

#[derive(Debug, Clone)]
pub struct InstanceMetadata {
    client: reqwest::Client,
    endpoint: Url,
}

impl InstanceMetadata {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, MetadataError> {
        let endpoint =
            Url::parse(endpoint).map_err(|_| MetadataError::Endpoint(endpoint.to_string()))?;
        if endpoint.host_str().is_none() {
            return Err(MetadataError::Endpoint(endpoint.to_string()));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }

    /// The service at `AWS_EC2_METADATA_SERVICE_ENDPOINT` or the link-local
    /// default. `None` when `AWS_EC2_METADATA_DISABLED` is `true`.
    pub fn from_env<F>(env: F) -> Result<Option<Self>, MetadataError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if env(DISABLED_ENV).is_some_and(|v| v.trim().eq_ignore_ascii_case("true")) {
            debug!("Instance metadata disabled");
            return Ok(None);
        }
        let endpoint = env(ENDPOINT_ENV)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        Self::new(&endpoint, DEFAULT_TIMEOUT).map(Some)
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    /// The instance identity document.
    pub async fn identity_document(&self) -> Result<IdentityDocument, MetadataError> {
        let token = self.session_token().await?;
        let body = self.get(IDENTITY_PATH, token.as_deref()).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Temporary credentials of the role attached to the instance.
    pub async fn role_credentials(&self) -> Result<RoleCredentials, MetadataError> {
        let token = self.session_token().await?;
        let roles = match self.get(ROLE_PATH, token.as_deref()).await {
            Ok(roles) => roles,
            Err(MetadataError::Status { status: 404, .. }) => return Err(MetadataError::NoRole),
            Err(e) => return Err(e),
        };
        let role = roles
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or(MetadataError::NoRole)?
            .to_string();

        let body = self
            .get(&format!("{ROLE_PATH}{role}"), token.as_deref())
            .await?;
        let response: RoleCredentialsResponse = serde_json::from_str(&body)?;
        if response.code != "Success" {
            return Err(MetadataError::RoleCredentials {
                role,
                code: response.code,
            });
        }

        debug!(role = %role, expiration = %response.expiration, "Fetched role credentials");
        Ok(RoleCredentials {
            role,
            credentials: Credentials::new(
                response.access_key_id,
                response.secret_access_key,
                Some(response.token).filter(|t| !t.is_empty()),
            ),
            expiration: response.expiration,
        })
    }

    /// IMDSv2 session token, or `None` to fall back to IMDSv1.
    async fn session_token(&self) -> Result<Option<String>, MetadataError> {
        let response = self
            .client
            .put(self.url(TOKEN_PATH)?)
            .header(TOKEN_TTL_HEADER, TOKEN_TTL_SECONDS)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            debug!(status = status.as_u16(), "No IMDSv2 session token, using IMDSv1");
            return Ok(None);
        }
        Ok(Some(response.text().await?))
    }

    async fn get(&self, path: &str, token: Option<&str>) -> Result<String, MetadataError> {
        let mut request = self.client.get(self.url(path)?);
        if let Some(token) = token {
            request = request.header(TOKEN_HEADER, token);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MetadataError::Status {
                status: status.as_u16(),
                path: path.to_string(),
            });
        }
        Ok(response.text().await?)
    }

    fn url(&self, path: &str) -> Result<Url, MetadataError> {
        self.endpoint
            .join(path)
            .map_err(|_| MetadataError::Endpoint(format!("{}{path}", self.endpoint)))
    }
}

/// String fields of the instance identity document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityDocument {
    pub account_id: Option<String>,
    pub architecture: Option<String>,
    pub availability_zone: Option<String>,
    pub image_id: Option<String>,
    pub instance_id: Option<String>,
    pub instance_type: Option<String>,
    pub kernel_id: Option<String>,
    pub private_ip: Option<String>,
    pub ramdisk_id: Option<String>,
    pub region: Option<String>,
    pub version: Option<String>,
}

/// A `${instance.<name>}` config variable and where its value comes from.
struct Variable {
    name: &'static str,
    value: fn(&IdentityDocument) -> Option<String>,
}

static VARIABLES: &[Variable] = &[
    Variable { name: "AccountID", value: |d| d.account_id.clone() },
    Variable { name: "Architecture", value: |d| d.architecture.clone() },
    Variable { name: "AvailabilityZone", value: |d| d.availability_zone.clone() },
    Variable { name: "ImageID", value: |d| d.image_id.clone() },
    Variable { name: "InstanceID", value: |d| d.instance_id.clone() },
    Variable { name: "InstanceType", value: |d| d.instance_type.clone() },
    Variable { name: "KernelID", value: |d| d.kernel_id.clone() },
    Variable { name: "PrivateIP", value: |d| d.private_ip.clone() },
    Variable { name: "RamdiskID", value: |d| d.ramdisk_id.clone() },
    Variable { name: "Region", value: |d| d.region.clone() },
    Variable { name: "Version", value: |d| d.version.clone() },
];

impl IdentityDocument {
    /// Present fields keyed by variable name, e.g. `InstanceID`.
    pub fn variables(&self) -> HashMap<String, String> {
        VARIABLES
            .iter()
            .filter_map(|var| (var.value)(self).map(|value| (var.name.to_string(), value)))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct RoleCredentials {
    pub role: String,
    pub credentials: Credentials,
    pub expiration: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoleCredentialsResponse {
    code: String,
    #[serde(default)]
    access_key_id: String,
    #[serde(default)]
    secret_access_key: String,
    #[serde(default)]
    token: String,
    expiration: DateTime<Utc>,
}
