//! Product-Streams Endpoint Reconciler
//!
//! When image metadata is published to the object store, the `image-stream`
//! catalog entry has to point at it. The hooks register a placeholder URL
//! (swift may not exist yet at that point); each sync compares the registered
//! URLs against the object store and pushes new ones through the
//! identity-service relation only when they differ.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::{
    get_service_endpoints, EndpointSet, EndpointType, ServiceCatalog, ServiceRecord,
    OBJECT_STORE_SERVICE_TYPE,
};
use crate::error::Result;
use crate::juju::EndpointNotifier;

pub const PRODUCT_STREAMS_SERVICE_NAME: &str = "image-stream";
pub const PRODUCT_STREAMS_SERVICE_TYPE: &str = "product-streams";

/// Object-store path juju reads image metadata from. Not configurable.
pub const SWIFT_DATA_DIR: &str = "simplestreams/data/";

/// Relation payload announcing new product-streams URLs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointUpdate {
    pub service: String,
    pub region: String,
    pub public_url: String,
    pub admin_url: String,
    pub internal_url: String,
}

impl EndpointUpdate {
    pub fn new(region: &str, endpoints: &EndpointSet) -> Self {
        Self {
            service: PRODUCT_STREAMS_SERVICE_NAME.to_string(),
            region: region.to_string(),
            public_url: endpoints.public.clone(),
            admin_url: endpoints.admin.clone(),
            internal_url: endpoints.internal.clone(),
        }
    }

    /// Flat `key=value` pairs for `relation-set`
    pub fn relation_data(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("service", self.service.as_str()),
            ("region", self.region.as_str()),
            ("public_url", self.public_url.as_str()),
            ("admin_url", self.admin_url.as_str()),
            ("internal_url", self.internal_url.as_str()),
        ]
        .into_iter()
    }
}

/// What a reconciliation did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileAction {
    Updated,
    Unchanged,
}

/// Product-streams URLs for the given object-store endpoints
pub fn desired_endpoints(object_store: &EndpointSet) -> EndpointSet {
    EndpointSet {
        public: format!("{}/{}", object_store.public, SWIFT_DATA_DIR),
        internal: format!("{}/{}", object_store.internal, SWIFT_DATA_DIR),
        admin: object_store.admin.clone(),
    }
}

fn is_registered(services: &[ServiceRecord], region: &str, desired: &EndpointSet) -> bool {
    let Some(current) = services.iter().find(|s| s.name == PRODUCT_STREAMS_SERVICE_NAME) else {
        return false;
    };
    EndpointType::ALL
        .iter()
        .all(|t| current.url_for(*t, region) == Some(desired.url(*t)))
}

/// Point the product-streams endpoint at the object store.
///
/// `services` is the current service list; nothing is sent when the
/// registered URLs already match. Fails when the object store has no
/// endpoints in `region`.
pub fn update_product_streams_service<C, N>(
    catalog: &C,
    services: &[ServiceRecord],
    region: &str,
    notifier: &N,
) -> Result<ReconcileAction>
where
    C: ServiceCatalog + ?Sized,
    N: EndpointNotifier + ?Sized,
{
    let object_store = get_service_endpoints(catalog, OBJECT_STORE_SERVICE_TYPE, region)
        .inspect_err(|e| {
            warn!(error = %e, "Could not retrieve swift endpoint, not updating product-streams endpoint")
        })?;

    let desired = desired_endpoints(&object_store);

    if is_registered(services, region, &desired) {
        debug!(region, "Product-streams endpoints already up to date");
        return Ok(ReconcileAction::Unchanged);
    }

    info!(
        region,
        public_url = %desired.public,
        internal_url = %desired.internal,
        admin_url = %desired.admin,
        "Updating product-streams endpoints"
    );
    notifier.update_endpoints(&EndpointUpdate::new(region, &desired))?;
    Ok(ReconcileAction::Updated)
}
