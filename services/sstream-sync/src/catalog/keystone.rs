//! Keystone v3 Client
//!
//! Password-authenticates the sync user, keeps the token's service catalog
//! and joins `/v3/services` with `/v3/endpoints` for the full service list.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Certificate, Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::{Catalog, CatalogEndpoint, CatalogSnapshot, CatalogSource, EndpointType, ServiceRecord};
use crate::config::IdentityConfig;
use crate::error::{ConfigError, Result, SyncError};

const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";
const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";

/// Keystone identity API client
pub struct KeystoneClient {
    http_client: Client,
    auth_url: String,
    username: String,
    password: String,
    domain_name: String,
    project_id: String,
}

// ============================================================
// API Response Types
// ============================================================

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    #[serde(default)]
    catalog: Vec<ApiCatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct ApiCatalogEntry {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<ApiEndpoint>,
}

#[derive(Debug, Deserialize)]
struct ApiEndpoint {
    interface: String,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    region_id: Option<String>,
    url: String,
    #[serde(default)]
    service_id: Option<String>,
}

impl ApiEndpoint {
    fn into_catalog_endpoint(self) -> Option<CatalogEndpoint> {
        let interface = parse_interface(&self.interface)?;
        let region = self.region_id.or(self.region).unwrap_or_default();
        Some(CatalogEndpoint {
            interface,
            region,
            url: self.url,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ServiceListResponse {
    services: Vec<ApiService>,
}

#[derive(Debug, Deserialize)]
struct ApiService {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "type")]
    service_type: String,
}

#[derive(Debug, Deserialize)]
struct EndpointListResponse {
    endpoints: Vec<ApiEndpoint>,
}

fn parse_interface(interface: &str) -> Option<EndpointType> {
    match interface {
        "public" | "publicURL" => Some(EndpointType::Public),
        "internal" | "internalURL" => Some(EndpointType::Internal),
        "admin" | "adminURL" => Some(EndpointType::Admin),
        _ => None,
    }
}

// ============================================================
// Client Implementation
// ============================================================

impl KeystoneClient {
    /// Create a client for the identity endpoint in `identity`.
    ///
    /// `ca_pem` is trusted in addition to the system roots.
    pub fn new(identity: &IdentityConfig, ca_pem: Option<&[u8]>) -> Result<Self> {
        if !identity.is_v3() {
            return Err(ConfigError::UnsupportedApiVersion(identity.api_version.clone()).into());
        }

        let mut builder = Client::builder()
            .user_agent(concat!("glance-simplestreams-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30));

        if let Some(pem) = ca_pem {
            let cert = Certificate::from_pem(pem)
                .map_err(|e| SyncError::identity(format!("Invalid CA bundle: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        let http_client = builder
            .build()
            .map_err(|e| SyncError::identity(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            auth_url: identity.auth_url(),
            username: identity.admin_user.clone(),
            password: identity.admin_password.clone(),
            domain_name: identity.domain_name().to_string(),
            project_id: identity.admin_tenant_id.clone(),
        })
    }

    pub fn auth_url(&self) -> &str {
        &self.auth_url
    }

    /// Issue a project-scoped token; returns the token id and its catalog
    async fn authenticate(&self) -> Result<(String, Catalog)> {
        let url = format!("{}/auth/tokens", self.auth_url);
        debug!(url = %url, user = %self.username, "Requesting identity token");

        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.username,
                            "domain": { "name": self.domain_name },
                            "password": self.password,
                        }
                    }
                },
                "scope": {
                    "project": { "id": self.project_id }
                }
            }
        });

        let response = self.http_client.post(&url).json(&body).send().await?;
        let status = response.status();
        if status != StatusCode::CREATED && !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SyncError::identity(format!(
                "Token request to {} returned {}: {}",
                url, status, text
            )));
        }

        let token = response
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| SyncError::identity("Token response has no X-Subject-Token header"))?;

        let parsed: TokenResponse = response.json().await?;
        let services = parsed
            .token
            .catalog
            .into_iter()
            .map(|entry| ServiceRecord {
                id: entry.id,
                name: entry.name,
                service_type: entry.service_type,
                endpoints: entry
                    .endpoints
                    .into_iter()
                    .filter_map(ApiEndpoint::into_catalog_endpoint)
                    .collect(),
            })
            .collect::<Vec<_>>();

        info!(services = services.len(), "Authenticated with identity service");
        Ok((token, Catalog::new(services)))
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, token: &str, path: &str) -> Result<T> {
        let url = format!("{}/{}", self.auth_url, path);
        let response = self
            .http_client
            .get(&url)
            .header(AUTH_TOKEN_HEADER, token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SyncError::identity(format!(
                "GET {} returned {}: {}",
                url, status, text
            )));
        }

        Ok(response.json().await?)
    }

    /// All registered services with their endpoints attached
    async fn list_services(&self, token: &str) -> Result<Vec<ServiceRecord>> {
        let services: ServiceListResponse = self.get(token, "services").await?;
        let endpoints: EndpointListResponse = self.get(token, "endpoints").await?;

        let mut by_service: HashMap<String, Vec<CatalogEndpoint>> = HashMap::new();
        for endpoint in endpoints.endpoints {
            let Some(service_id) = endpoint.service_id.clone() else {
                continue;
            };
            if let Some(e) = endpoint.into_catalog_endpoint() {
                by_service.entry(service_id).or_default().push(e);
            }
        }

        let records = services
            .services
            .into_iter()
            .map(|s| ServiceRecord {
                endpoints: by_service.remove(&s.id).unwrap_or_default(),
                id: s.id,
                name: s.name,
                service_type: s.service_type,
            })
            .collect::<Vec<_>>();

        debug!(
            names = ?records.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            "Listed registered services"
        );
        Ok(records)
    }
}

#[async_trait]
impl CatalogSource for KeystoneClient {
    async fn snapshot(&self) -> Result<CatalogSnapshot> {
        let (token, catalog) = self.authenticate().await?;
        let services = self.list_services(&token).await?;
        Ok(CatalogSnapshot { catalog, services })
    }
}
