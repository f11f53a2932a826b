//! Sync Configuration
//!
//! Two YAML files rendered by the charm hooks: `identity.yaml` (credentials
//! and endpoints from the identity-service relation) and `mirrors.yaml`
//! (charm config). Both are loaded once per run into immutable structs.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::{debug, info};

use crate::error::ConfigError;

pub const DEFAULT_CONF_DIR: &str = "/etc/glance-simplestreams-sync";
pub const ID_CONF_FILE_NAME: &str = "identity.yaml";
pub const MIRRORS_CONF_FILE_NAME: &str = "mirrors.yaml";
pub const CACERT_FILE_NAME: &str = "cacert.pem";

/// Top-level keys never written to the log
const REDACTED_KEYS: &[&str] = &["admin", "password", "rabbit_password", "admin_password"];

// ============================================================
// identity.yaml
// ============================================================

/// Identity service relation data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(deserialize_with = "string_or_number")]
    pub api_version: String,
    pub service_protocol: String,
    pub service_host: String,
    #[serde(deserialize_with = "string_or_number")]
    pub service_port: String,
    #[serde(default)]
    pub internal_protocol: Option<String>,
    #[serde(default)]
    pub internal_host: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub internal_port: Option<String>,
    pub admin_user: String,
    pub admin_password: String,
    pub admin_tenant_id: String,
    pub admin_tenant_name: String,
    #[serde(default)]
    pub admin_domain_name: Option<String>,
    pub unit_name: String,
    /// Base64 encoded CA bundle for https endpoints
    #[serde(default)]
    pub ssl_ca: Option<String>,
    /// Path of an already installed CA bundle
    #[serde(default)]
    pub cacert: Option<String>,
    /// Endpoint interface to authenticate against (`public` or `internal`)
    #[serde(default)]
    pub interface: Option<String>,
}

impl IdentityConfig {
    pub fn is_v3(&self) -> bool {
        self.api_version.starts_with('3')
    }

    fn version_path(&self) -> &'static str {
        if self.is_v3() {
            "v3"
        } else {
            "v2.0"
        }
    }

    fn uses_internal_interface(&self) -> bool {
        self.interface.as_deref() == Some("internal")
    }

    /// Keystone URL the sync user authenticates against
    pub fn auth_url(&self) -> String {
        let (protocol, host, port) = if self.uses_internal_interface() {
            (
                self.internal_protocol.as_deref().unwrap_or(&self.service_protocol),
                self.internal_host.as_deref().unwrap_or(&self.service_host),
                self.internal_port.as_deref().unwrap_or(&self.service_port),
            )
        } else {
            (
                self.service_protocol.as_str(),
                self.service_host.as_str(),
                self.service_port.as_str(),
            )
        };
        format!("{}://{}:{}/{}", protocol, host, port, self.version_path())
    }

    /// Domain of the sync user and its project
    pub fn domain_name(&self) -> &str {
        self.admin_domain_name.as_deref().unwrap_or("default")
    }

    /// Decode `ssl_ca` when the identity endpoint is https
    pub fn ca_bundle(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        match (&self.ssl_ca, self.service_protocol.as_str()) {
            (Some(ssl_ca), "https") => base64::engine::general_purpose::STANDARD
                .decode(ssl_ca.trim())
                .map(Some)
                .map_err(|e| ConfigError::Parse {
                    path: PathBuf::from(ID_CONF_FILE_NAME),
                    message: format!("ssl_ca is not valid base64: {}", e),
                }),
            _ => Ok(None),
        }
    }

    /// `OS_*` variables for OpenStack clients run by the sync.
    ///
    /// `cacert_path` is where the decoded `ssl_ca` bundle was written, if any.
    pub fn openstack_env(&self, region: &str, cacert_path: Option<&Path>) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("OS_AUTH_URL".to_string(), self.auth_url());
        env.insert("OS_USERNAME".to_string(), self.admin_user.clone());
        env.insert("OS_PASSWORD".to_string(), self.admin_password.clone());
        env.insert("OS_REGION_NAME".to_string(), region.to_string());

        if let Some(path) = cacert_path {
            env.insert("OS_CACERT".to_string(), path.display().to_string());
        }

        if self.is_v3() {
            // Service users live in the service domain for both user and project.
            env.insert("OS_USER_DOMAIN_NAME".to_string(), self.domain_name().to_string());
            env.insert("OS_PROJECT_ID".to_string(), self.admin_tenant_id.clone());
            env.insert("OS_PROJECT_NAME".to_string(), self.admin_tenant_name.clone());
            env.insert("OS_PROJECT_DOMAIN_NAME".to_string(), self.domain_name().to_string());
            if let Some(cacert) = &self.cacert {
                env.insert("OS_CACERT".to_string(), cacert.clone());
            }
            if let Some(interface) = &self.interface {
                env.insert("OS_INTERFACE".to_string(), interface.clone());
                env.insert("OS_ENDPOINT_TYPE".to_string(), interface.clone());
            }
        } else {
            env.insert("OS_TENANT_ID".to_string(), self.admin_tenant_id.clone());
            env.insert("OS_TENANT_NAME".to_string(), self.admin_tenant_name.clone());
        }

        env
    }
}

// ============================================================
// mirrors.yaml
// ============================================================

/// One upstream simplestreams mirror
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorInfo {
    pub url: String,
    pub path: String,
    pub max: u32,
    #[serde(default)]
    pub item_filters: Vec<String>,
}

/// Charm configuration relevant to the sync
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    pub mirror_list: Vec<MirrorInfo>,
    pub content_id_template: String,
    pub use_swift: bool,
    pub region: String,
    pub cloud_name: String,
    pub name_prefix: String,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub hypervisor_mapping: bool,
    /// Space separated `key=value` image properties
    #[serde(default)]
    pub custom_properties: Option<String>,
    /// Exempt object-store endpoints from the proxy
    #[serde(default = "default_true")]
    pub ignore_proxy_for_object_store: bool,
    #[serde(default)]
    pub modify_hook_scripts: Option<String>,
}

impl MirrorConfig {
    /// Content id with `{region}` substituted
    pub fn content_id(&self) -> String {
        self.content_id_template.replace("{region}", &self.region)
    }

    pub fn custom_properties(&self) -> Vec<&str> {
        self.custom_properties
            .as_deref()
            .map(|p| p.split_whitespace().collect())
            .unwrap_or_default()
    }
}

fn default_true() -> bool {
    true
}

// ============================================================
// Loading
// ============================================================

/// Both configuration files, loaded together
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub config_dir: PathBuf,
    pub identity: IdentityConfig,
    pub mirrors: MirrorConfig,
}

impl SyncConfig {
    /// Load `identity.yaml` and `mirrors.yaml` from `config_dir`.
    ///
    /// Both files must exist before either is parsed.
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let id_path = config_dir.join(ID_CONF_FILE_NAME);
        let mirrors_path = config_dir.join(MIRRORS_CONF_FILE_NAME);

        for path in [&id_path, &mirrors_path] {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.clone()));
            }
        }

        let identity: IdentityConfig = read_conf(&id_path)?;
        let mirrors: MirrorConfig = read_conf(&mirrors_path)?;

        info!(
            config_dir = %config_dir.display(),
            region = %mirrors.region,
            mirrors = mirrors.mirror_list.len(),
            use_swift = mirrors.use_swift,
            "Loaded sync configuration"
        );

        Ok(Self {
            config_dir: config_dir.to_path_buf(),
            identity,
            mirrors,
        })
    }

    pub fn cacert_path(&self) -> PathBuf {
        self.config_dir.join(CACERT_FILE_NAME)
    }

    /// Write the decoded CA bundle next to the config files.
    ///
    /// Returns the bundle and its path when the identity endpoint needs one.
    pub fn install_ca_bundle(&self) -> anyhow::Result<Option<(Vec<u8>, PathBuf)>> {
        let Some(pem) = self.identity.ca_bundle()? else {
            return Ok(None);
        };
        let path = self.cacert_path();
        fs::write(&path, &pem)
            .with_context(|| format!("Failed to write CA bundle: {:?}", path))?;
        debug!(path = %path.display(), "Installed identity CA bundle");
        Ok(Some((pem, path)))
    }
}

/// Parse a config file, rejecting null values
fn read_conf<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let parse_err = |source: anyhow::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: format!("{:#}", source),
    };

    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {:?}", path))
        .map_err(parse_err)?;
    let value: Value = serde_yaml::from_str(&raw)
        .context("Invalid YAML")
        .map_err(parse_err)?;
    let mapping = value
        .as_mapping()
        .context("Expected a mapping at the top level")
        .map_err(parse_err)?;

    let missing = null_keys(mapping);
    if !missing.is_empty() {
        info!(
            path = %path.display(),
            config = ?redact_keys(mapping, REDACTED_KEYS),
            "Configuration value missing"
        );
        return Err(ConfigError::MissingValues {
            path: path.to_path_buf(),
            keys: missing,
        });
    }

    serde_yaml::from_value(value)
        .context("Unexpected configuration layout")
        .map_err(parse_err)
}

fn null_keys(mapping: &Mapping) -> Vec<String> {
    mapping
        .iter()
        .filter(|(_, v)| v.is_null())
        .filter_map(|(k, _)| k.as_str().map(str::to_string))
        .collect()
}

/// Copy of `mapping` with the values of `keys` replaced by `<redacted>`
pub fn redact_keys(mapping: &Mapping, keys: &[&str]) -> Mapping {
    let mut redacted = mapping.clone();
    for key in keys {
        let key = Value::String(key.to_string());
        if let Some(v) = redacted.get_mut(&key) {
            *v = Value::String("<redacted>".to_string());
        }
    }
    redacted
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Int(i64),
        Float(f64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s,
        Raw::Int(i) => i.to_string(),
        Raw::Float(f) => f.to_string(),
    })
}

fn opt_string_or_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    string_or_number(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const IDENTITY_YAML: &str = r#"
api_version: 3
service_protocol: https
service_host: service-host.local
service_port: 5000
internal_protocol: https
internal_host: internal-host.local
internal_port: 5000
admin_tenant_id: admin-tenant-id
admin_tenant_name: services
admin_user: image-stream
admin_password: insecure
admin_domain_name: service_domain
unit_name: gss/0
"#;

    const MIRRORS_YAML: &str = r#"
mirror_list:
  - url: http://cloud-images.ubuntu.com/releases/
    path: streams/v1/index.sjson
    max: 1
    item_filters:
      - release~(focal|jammy)
      - arch~(x86_64|amd64)
      - ftype~(disk1.img|disk.img)
content_id_template: "com.ubuntu.cloud.{region}:images"
use_swift: true
region: RegionOne
cloud_name: mycloud
name_prefix: "auto-sync/"
hypervisor_mapping: false
custom_properties: "hw_firmware_type=uefi os_distro=ubuntu"
"#;

    fn identity() -> IdentityConfig {
        serde_yaml::from_str(IDENTITY_YAML).unwrap()
    }

    #[test]
    fn test_openstack_env_v3() {
        let id = identity();
        let env = id.openstack_env("region-one", None);

        let expected: BTreeMap<String, String> = [
            ("OS_AUTH_URL", "https://service-host.local:5000/v3"),
            ("OS_USERNAME", "image-stream"),
            ("OS_PASSWORD", "insecure"),
            ("OS_REGION_NAME", "region-one"),
            ("OS_USER_DOMAIN_NAME", "service_domain"),
            ("OS_PROJECT_ID", "admin-tenant-id"),
            ("OS_PROJECT_NAME", "services"),
            ("OS_PROJECT_DOMAIN_NAME", "service_domain"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        assert_eq!(env, expected);
    }

    #[test]
    fn test_openstack_env_internal_interface() {
        let mut id = identity();
        id.interface = Some("internal".to_string());
        let env = id.openstack_env("region-one", None);

        assert_eq!(env["OS_AUTH_URL"], "https://internal-host.local:5000/v3");
        assert_eq!(env["OS_INTERFACE"], "internal");
        assert_eq!(env["OS_ENDPOINT_TYPE"], "internal");
    }

    #[test]
    fn test_openstack_env_v2() {
        let mut id = identity();
        id.api_version = "2".to_string();
        let env = id.openstack_env("region-one", Some(Path::new("/etc/gss/cacert.pem")));

        assert_eq!(env["OS_AUTH_URL"], "https://service-host.local:5000/v2.0");
        assert_eq!(env["OS_TENANT_ID"], "admin-tenant-id");
        assert_eq!(env["OS_TENANT_NAME"], "services");
        assert_eq!(env["OS_CACERT"], "/etc/gss/cacert.pem");
        assert!(!env.contains_key("OS_PROJECT_ID"));
    }

    #[test]
    fn test_mirror_config_helpers() {
        let mirrors: MirrorConfig = serde_yaml::from_str(MIRRORS_YAML).unwrap();
        assert_eq!(mirrors.content_id(), "com.ubuntu.cloud.RegionOne:images");
        assert_eq!(
            mirrors.custom_properties(),
            vec!["hw_firmware_type=uefi", "os_distro=ubuntu"]
        );
        assert!(mirrors.ignore_proxy_for_object_store);
        assert_eq!(mirrors.mirror_list[0].item_filters.len(), 3);
    }

    #[test]
    fn test_load_config() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(ID_CONF_FILE_NAME), IDENTITY_YAML).unwrap();
        fs::write(dir.path().join(MIRRORS_CONF_FILE_NAME), MIRRORS_YAML).unwrap();

        let config = SyncConfig::load(dir.path()).unwrap();
        assert_eq!(config.identity.api_version, "3");
        assert_eq!(config.identity.service_port, "5000");
        assert_eq!(config.mirrors.region, "RegionOne");
    }

    #[test]
    fn test_load_config_missing_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(ID_CONF_FILE_NAME), IDENTITY_YAML).unwrap();

        let err = SyncConfig::load(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(p) if p.ends_with(MIRRORS_CONF_FILE_NAME)));
    }

    #[test]
    fn test_load_config_null_values() {
        let dir = tempdir().unwrap();
        let identity = IDENTITY_YAML.replace("admin_password: insecure", "admin_password:");
        fs::write(dir.path().join(ID_CONF_FILE_NAME), identity).unwrap();
        fs::write(dir.path().join(MIRRORS_CONF_FILE_NAME), MIRRORS_YAML).unwrap();

        match SyncConfig::load(dir.path()).unwrap_err() {
            ConfigError::MissingValues { keys, .. } => assert_eq!(keys, vec!["admin_password"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_load_config_malformed() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(ID_CONF_FILE_NAME), "api_version: [3").unwrap();
        fs::write(dir.path().join(MIRRORS_CONF_FILE_NAME), MIRRORS_YAML).unwrap();

        assert!(matches!(
            SyncConfig::load(dir.path()).unwrap_err(),
            ConfigError::Parse { .. }
        ));
    }

    #[test]
    fn test_redact_keys() {
        let mapping: Mapping =
            serde_yaml::from_str("admin_password: secret\nadmin_user: image-stream\n").unwrap();
        let redacted = redact_keys(&mapping, REDACTED_KEYS);

        assert_eq!(redacted.get("admin_password").unwrap().as_str(), Some("<redacted>"));
        assert_eq!(redacted.get("admin_user").unwrap().as_str(), Some("image-stream"));
        // Input mapping untouched
        assert_eq!(mapping.get("admin_password").unwrap().as_str(), Some("secret"));
    }

    #[test]
    fn test_install_ca_bundle() {
        let dir = tempdir().unwrap();
        let mut id = identity();
        id.ssl_ca = Some(base64::engine::general_purpose::STANDARD.encode("PEM DATA"));
        let config = SyncConfig {
            config_dir: dir.path().to_path_buf(),
            identity: id,
            mirrors: serde_yaml::from_str(MIRRORS_YAML).unwrap(),
        };

        let (pem, path) = config.install_ca_bundle().unwrap().unwrap();
        assert_eq!(pem, b"PEM DATA");
        assert_eq!(fs::read_to_string(path).unwrap(), "PEM DATA");
    }
}
