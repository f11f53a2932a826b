//! Service Catalog
//!
//! Read-only view of the identity service catalog: which URL a service
//! exposes for each interface in a region. The Keystone client fills it
//! once per run; everything downstream only needs [`ServiceCatalog::lookup`].

pub mod keystone;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CatalogError, Result};

pub use keystone::KeystoneClient;

/// Service type of the object store (swift or radosgw)
pub const OBJECT_STORE_SERVICE_TYPE: &str = "object-store";
/// Service type of Keystone itself
pub const IDENTITY_SERVICE_TYPE: &str = "identity";
/// Service type of Glance
pub const IMAGE_SERVICE_TYPE: &str = "image";

/// Endpoint interface, in Keystone v3 terms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    Public,
    Internal,
    Admin,
}

impl EndpointType {
    pub const ALL: [EndpointType; 3] = [
        EndpointType::Public,
        EndpointType::Internal,
        EndpointType::Admin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointType::Public => "public",
            EndpointType::Internal => "internal",
            EndpointType::Admin => "admin",
        }
    }
}

impl std::fmt::Display for EndpointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public, internal and admin URL of one service in one region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSet {
    pub public: String,
    pub internal: String,
    pub admin: String,
}

impl EndpointSet {
    pub fn url(&self, endpoint_type: EndpointType) -> &str {
        match endpoint_type {
            EndpointType::Public => &self.public,
            EndpointType::Internal => &self.internal,
            EndpointType::Admin => &self.admin,
        }
    }

    /// URLs in public, internal, admin order
    pub fn urls(&self) -> [&str; 3] {
        [&self.public, &self.internal, &self.admin]
    }
}

/// Query interface over the service catalog
pub trait ServiceCatalog {
    fn lookup(
        &self,
        service_type: &str,
        endpoint_type: EndpointType,
        region: &str,
    ) -> Result<String, CatalogError>;
}

/// One endpoint as registered in the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEndpoint {
    pub interface: EndpointType,
    pub region: String,
    pub url: String,
}

/// A service with all its endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub endpoints: Vec<CatalogEndpoint>,
}

impl ServiceRecord {
    /// URL registered for an interface in a region, if any
    pub fn url_for(&self, endpoint_type: EndpointType, region: &str) -> Option<&str> {
        self.endpoints
            .iter()
            .find(|e| e.interface == endpoint_type && e.region == region)
            .map(|e| e.url.as_str())
    }
}

/// In-memory catalog built from a token response
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    services: Vec<ServiceRecord>,
}

impl Catalog {
    pub fn new(services: Vec<ServiceRecord>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &[ServiceRecord] {
        &self.services
    }
}

impl ServiceCatalog for Catalog {
    fn lookup(
        &self,
        service_type: &str,
        endpoint_type: EndpointType,
        region: &str,
    ) -> Result<String, CatalogError> {
        self.services
            .iter()
            .filter(|s| s.service_type == service_type)
            .find_map(|s| s.url_for(endpoint_type, region))
            .map(str::to_string)
            .ok_or_else(|| CatalogError::endpoint_not_found(service_type, endpoint_type, region))
    }
}

/// Everything a sync run needs to know about the cloud
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    /// Catalog scoped to the sync user's token
    pub catalog: Catalog,
    /// All registered services with their endpoints
    pub services: Vec<ServiceRecord>,
}

impl CatalogSnapshot {
    pub fn has_service(&self, name: &str) -> bool {
        self.services.iter().any(|s| s.name == name)
    }
}

/// Source of catalog snapshots (the identity service in production)
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn snapshot(&self) -> Result<CatalogSnapshot>;
}

/// Look up all three endpoint URLs of a service in a region.
///
/// Any missing interface fails the whole lookup.
pub fn get_service_endpoints<C: ServiceCatalog + ?Sized>(
    catalog: &C,
    service_type: &str,
    region: &str,
) -> Result<EndpointSet, CatalogError> {
    let endpoints = EndpointSet {
        public: catalog.lookup(service_type, EndpointType::Public, region)?,
        internal: catalog.lookup(service_type, EndpointType::Internal, region)?,
        admin: catalog.lookup(service_type, EndpointType::Admin, region)?,
    };
    debug!(service_type, region, ?endpoints, "Resolved service endpoints");
    Ok(endpoints)
}

/// Object store endpoint URLs, or nothing when the object store is absent
pub fn get_object_store_endpoints<C: ServiceCatalog + ?Sized>(
    catalog: &C,
    region: &str,
) -> Vec<String> {
    match get_service_endpoints(catalog, OBJECT_STORE_SERVICE_TYPE, region) {
        Ok(endpoints) => endpoints.urls().iter().map(|u| u.to_string()).collect(),
        Err(e) => {
            debug!(error = %e, "Object store endpoints not in catalog");
            Vec::new()
        }
    }
}

pub fn is_object_store_present<C: ServiceCatalog + ?Sized>(catalog: &C, region: &str) -> bool {
    !get_object_store_endpoints(catalog, region).is_empty()
}
