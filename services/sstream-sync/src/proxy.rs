//! Proxy Environment
//!
//! `sstream-mirror-glance` talks to Keystone, Glance and the object store
//! through whatever proxy the model configures. Those cloud-internal
//! endpoints must bypass it, so their hosts are added to `NO_PROXY` on top of
//! the exemptions already configured.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};
use url::{Host, Url};

use crate::catalog::{
    get_object_store_endpoints, get_service_endpoints, ServiceCatalog, IDENTITY_SERVICE_TYPE,
    IMAGE_SERVICE_TYPE,
};
use crate::error::CatalogError;

/// Proxy variable name to value, upper and lowercase spellings
pub type ProxySettings = BTreeMap<String, String>;

const PROXY_KEYS: [&str; 3] = ["HTTP_PROXY", "HTTPS_PROXY", "NO_PROXY"];

/// Prefix of model-level proxy settings exported into hook environments
const JUJU_CHARM_PREFIX: &str = "JUJU_CHARM_";

/// Extract proxy settings from `KEY=value` lines (the output of `env`).
///
/// `JUJU_CHARM_HTTP_PROXY` and friends win over the legacy unprefixed names.
/// Returns `None` when no proxy variable is set at all.
pub fn parse_proxy_settings(env_output: &str) -> Option<ProxySettings> {
    let vars: BTreeMap<&str, &str> = env_output
        .lines()
        .filter_map(|line| line.trim().split_once('='))
        .collect();

    let mut settings = ProxySettings::new();
    for key in PROXY_KEYS {
        let prefixed = format!("{}{}", JUJU_CHARM_PREFIX, key);
        let value = vars
            .get(prefixed.as_str())
            .or_else(|| vars.get(key))
            .filter(|v| !v.is_empty());

        if let Some(value) = value {
            settings.insert(key.to_string(), value.to_string());
            settings.insert(key.to_lowercase(), value.to_string());
        }
    }

    if settings.is_empty() {
        None
    } else {
        Some(settings)
    }
}

/// Host component of an endpoint URL.
///
/// IPv6 literals come back without brackets, which is the form `NO_PROXY`
/// matching expects.
pub fn endpoint_hostname(endpoint: &str) -> Option<String> {
    let url = match Url::parse(endpoint) {
        Ok(url) => url,
        Err(e) => {
            warn!(endpoint, error = %e, "Cannot parse endpoint URL, not exempting it from proxy");
            return None;
        }
    };

    match url.host()? {
        Host::Domain(domain) => Some(domain.to_string()),
        Host::Ipv4(addr) => Some(addr.to_string()),
        Host::Ipv6(addr) => Some(addr.to_string()),
    }
}

fn existing_exemptions(settings: &ProxySettings) -> BTreeSet<String> {
    settings
        .get("NO_PROXY")
        .or_else(|| settings.get("no_proxy"))
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Proxy environment for `sstream-mirror-glance`.
///
/// Starts from `ambient` (the model's proxy settings, if any) and sets
/// `NO_PROXY`/`no_proxy` to the existing exemptions plus the hosts of all
/// identity and image endpoints. Object-store hosts are added only when
/// `ignore_proxy_for_object_store` is set and the object store exists.
///
/// Fails when identity or image endpoints are missing from the catalog.
pub fn get_sstream_mirror_proxy_env<C: ServiceCatalog + ?Sized>(
    catalog: &C,
    region: &str,
    ambient: Option<ProxySettings>,
    ignore_proxy_for_object_store: bool,
) -> Result<ProxySettings, CatalogError> {
    let mut settings = ambient.unwrap_or_default();
    let mut no_proxy = existing_exemptions(&settings);

    let mut urls = Vec::new();
    for service_type in [IDENTITY_SERVICE_TYPE, IMAGE_SERVICE_TYPE] {
        let endpoints = get_service_endpoints(catalog, service_type, region)?;
        urls.extend(endpoints.urls().iter().map(|u| u.to_string()));
    }
    if ignore_proxy_for_object_store {
        urls.extend(get_object_store_endpoints(catalog, region));
    }

    no_proxy.extend(urls.iter().filter_map(|u| endpoint_hostname(u)));

    let joined = no_proxy.into_iter().collect::<Vec<_>>().join(",");
    debug!(no_proxy = %joined, "Computed proxy exemptions");

    settings.insert("NO_PROXY".to_string(), joined.clone());
    settings.insert("no_proxy".to_string(), joined);
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::{endpoints, service};
    use crate::catalog::{Catalog, EndpointType};

    fn ambient() -> ProxySettings {
        [
            ("HTTP_PROXY", "http://squid.internal:3128"),
            ("HTTPS_PROXY", "https://squid.internal:3128"),
            ("NO_PROXY", "127.0.0.1,localhost,::1"),
            ("http_proxy", "http://squid.internal:3128"),
            ("https_proxy", "https://squid.internal:3128"),
            ("no_proxy", "127.0.0.1,localhost,::1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn catalog(with_object_store: bool) -> Catalog {
        let mut services = vec![
            service(
                "keystone",
                "identity",
                endpoints(
                    "TestRegion",
                    "https://192.0.2.42:5000/v3",
                    "https://192.0.2.43:5000/v3",
                    "https://192.0.2.44:35357/v3",
                ),
            ),
            service(
                "glance",
                "image",
                endpoints(
                    "TestRegion",
                    "https://192.0.2.45:9292",
                    "https://192.0.2.45:9292",
                    "https://192.0.2.47:9292",
                ),
            ),
        ];
        if with_object_store {
            services.push(service(
                "swift",
                "object-store",
                endpoints(
                    "TestRegion",
                    "https://192.0.2.90:443/swift/v1",
                    "https://192.0.2.90:443/swift/v1",
                    "https://192.0.2.90:443/swift",
                ),
            ));
        }
        Catalog::new(services)
    }

    fn no_proxy_set(env: &ProxySettings, key: &str) -> BTreeSet<String> {
        env[key].split(',').map(str::to_string).collect()
    }

    fn set(hosts: &[&str]) -> BTreeSet<String> {
        hosts.iter().map(|h| h.to_string()).collect()
    }

    #[test]
    fn test_parse_proxy_settings() {
        let output = "
LANG=C.UTF-8
JUJU_CONTEXT_ID=glance-simplestreams-sync/0-run-commands-3325280900519425661
JUJU_CHARM_HTTP_PROXY=http://squid.internal:3128
JUJU_CHARM_HTTPS_PROXY=https://squid.internal:3128
JUJU_CHARM_NO_PROXY=127.0.0.1,localhost,::1
";
        assert_eq!(parse_proxy_settings(output), Some(ambient()));
    }

    #[test]
    fn test_parse_legacy_proxy_settings() {
        let output = "
LANG=C.UTF-8
JUJU_CONTEXT_ID=glance-simplestreams-sync/0-run-commands-3325280900519425661
HTTP_PROXY=http://squid.internal:3128
HTTPS_PROXY=https://squid.internal:3128
NO_PROXY=127.0.0.1,localhost,::1
";
        assert_eq!(parse_proxy_settings(output), Some(ambient()));
    }

    #[test]
    fn test_parse_proxy_settings_not_set() {
        let output = "
LANG=C.UTF-8
JUJU_CONTEXT_ID=glance-simplestreams-sync/0-run-commands-3325280900519425661
";
        assert_eq!(parse_proxy_settings(output), None);
    }

    #[test]
    fn test_endpoint_hostname() {
        assert_eq!(endpoint_hostname("https://192.0.2.42:5000/v3").as_deref(), Some("192.0.2.42"));
        assert_eq!(endpoint_hostname("http://keystone.internal/v3").as_deref(), Some("keystone.internal"));
        assert_eq!(endpoint_hostname("https://[2001:db8::5]:9292").as_deref(), Some("2001:db8::5"));
        assert_eq!(endpoint_hostname("not a url"), None);
    }

    #[test]
    fn test_proxy_env_with_object_store() {
        let expected = set(&[
            "127.0.0.1", "localhost", "::1", "192.0.2.42", "192.0.2.43", "192.0.2.44",
            "192.0.2.45", "192.0.2.47", "192.0.2.90",
        ]);

        let env =
            get_sstream_mirror_proxy_env(&catalog(true), "TestRegion", Some(ambient()), true).unwrap();

        assert_eq!(env["HTTP_PROXY"], "http://squid.internal:3128");
        assert_eq!(env["http_proxy"], "http://squid.internal:3128");
        assert_eq!(env["HTTPS_PROXY"], "https://squid.internal:3128");
        assert_eq!(env["https_proxy"], "https://squid.internal:3128");
        assert_eq!(no_proxy_set(&env, "NO_PROXY"), expected);
        assert_eq!(no_proxy_set(&env, "no_proxy"), expected);
    }

    #[test]
    fn test_proxy_env_object_store_not_exempted() {
        let expected = set(&[
            "127.0.0.1", "localhost", "::1", "192.0.2.42", "192.0.2.43", "192.0.2.44",
            "192.0.2.45", "192.0.2.47",
        ]);

        let env =
            get_sstream_mirror_proxy_env(&catalog(true), "TestRegion", Some(ambient()), false).unwrap();

        assert_eq!(env["HTTPS_PROXY"], "https://squid.internal:3128");
        assert_eq!(no_proxy_set(&env, "NO_PROXY"), expected);
        assert_eq!(no_proxy_set(&env, "no_proxy"), expected);
    }

    #[test]
    fn test_proxy_env_flag_only_adds_object_store_hosts() {
        let with = get_sstream_mirror_proxy_env(&catalog(true), "TestRegion", Some(ambient()), true).unwrap();
        let without =
            get_sstream_mirror_proxy_env(&catalog(true), "TestRegion", Some(ambient()), false).unwrap();

        let with = no_proxy_set(&with, "NO_PROXY");
        let without = no_proxy_set(&without, "NO_PROXY");
        assert!(with.is_superset(&without));
        assert_eq!(with.difference(&without).cloned().collect::<BTreeSet<_>>(), set(&["192.0.2.90"]));
    }

    #[test]
    fn test_proxy_env_without_ambient_settings() {
        let env = get_sstream_mirror_proxy_env(&catalog(true), "TestRegion", None, false).unwrap();

        let expected = set(&["192.0.2.42", "192.0.2.43", "192.0.2.44", "192.0.2.45", "192.0.2.47"]);
        assert_eq!(no_proxy_set(&env, "NO_PROXY"), expected);
        assert_eq!(no_proxy_set(&env, "no_proxy"), expected);
        assert!(!env.contains_key("HTTP_PROXY"));
    }

    #[test]
    fn test_proxy_env_no_object_store() {
        let expected = set(&[
            "127.0.0.1", "localhost", "::1", "192.0.2.42", "192.0.2.43", "192.0.2.44",
            "192.0.2.45", "192.0.2.47",
        ]);

        for flag in [true, false] {
            let env =
                get_sstream_mirror_proxy_env(&catalog(false), "TestRegion", Some(ambient()), flag).unwrap();
            assert_eq!(env["HTTP_PROXY"], "http://squid.internal:3128");
            assert_eq!(no_proxy_set(&env, "NO_PROXY"), expected);
        }
    }

    #[test]
    fn test_proxy_env_requires_image_endpoints() {
        let catalog = Catalog::new(vec![service(
            "keystone",
            "identity",
            endpoints("TestRegion", "http://a:5000", "http://b:5000", "http://c:35357"),
        )]);

        let err = get_sstream_mirror_proxy_env(&catalog, "TestRegion", None, true).unwrap_err();
        assert_eq!(
            err,
            CatalogError::endpoint_not_found("image", EndpointType::Public, "TestRegion")
        );
    }
}
