//! Node configuration, loaded from a file and `DTABLES_*` environment
//! overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::ClusterSettings;
use crate::peer::{CertificateValidator, ClientIdentity, NodeDescriptor, PinnedCertificate};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub bind_addr: String,
    /// How the other nodes address this one; must match one of `nodes`.
    pub self_host: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// PEM bundle (certificate and key) used for peer calls.
    #[serde(default)]
    pub client_identity: Option<PathBuf>,
    /// Explicit opt-out of client certificates.
    #[serde(default)]
    pub plaintext: bool,
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,
    #[serde(default = "default_lock_expiration_ms")]
    pub lock_expiration_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
    #[serde(default)]
    pub tables: Vec<TableEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub host: String,
    /// Tables the node serves; all of them when absent.
    #[serde(default)]
    pub tables: Option<Vec<String>>,
    /// PEM files of the client certificates this node may present.
    #[serde(default)]
    pub trusted_certificates: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableEntry {
    pub name: String,
    #[serde(default = "default_min_version")]
    pub min_version: u32,
}

fn default_scheme() -> String {
    "https".to_string()
}

fn default_lock_expiration_ms() -> u64 {
    30_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_maintenance_interval_secs() -> u64 {
    300
}

fn default_min_version() -> u32 {
    1
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .add_source(::config::Environment::with_prefix("DTABLES"))
            .build()
            .with_context(|| format!("Failed to read config {}", path.display()))?;

        let config: NodeConfig = settings
            .try_deserialize()
            .with_context(|| format!("Invalid config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.plaintext && self.client_identity.is_some() {
            anyhow::bail!("`plaintext` and `client_identity` are mutually exclusive");
        }
        if self.scheme != "https" && !self.plaintext {
            anyhow::bail!("Scheme {} requires `plaintext = true`", self.scheme);
        }
        let mut names: Vec<&str> = self.tables.iter().map(|t| t.name.as_str()).collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|pair| pair[0] == pair[1]) {
            anyhow::bail!("Table {} is configured twice", pair[0]);
        }
        Ok(())
    }

    pub fn lock_expiration(&self) -> Duration {
        Duration::from_millis(self.lock_expiration_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    /// Loads the client identity; reads the PEM file when one is set.
    pub fn identity(&self) -> Result<Option<ClientIdentity>> {
        if self.plaintext {
            return Ok(Some(ClientIdentity::Plaintext));
        }
        match &self.client_identity {
            Some(path) => Ok(Some(
                ClientIdentity::from_pem_file(path)
                    .with_context(|| format!("Failed to load identity {}", path.display()))?,
            )),
            None => Ok(None),
        }
    }

    pub fn cluster_settings(&self) -> Result<ClusterSettings> {
        Ok(ClusterSettings {
            self_host: self.self_host.clone(),
            scheme: self.scheme.clone(),
            identity: self.identity()?,
            lock_expiration: self.lock_expiration(),
            request_timeout: self.request_timeout(),
        })
    }

    /// Builds the node descriptors, loading every pinned certificate.
    pub fn node_descriptors(&self) -> Result<Vec<NodeDescriptor>> {
        self.nodes
            .iter()
            .map(|node| {
                let validators = node
                    .trusted_certificates
                    .iter()
                    .map(|path| {
                        let pinned = PinnedCertificate::from_file(path).with_context(|| {
                            format!("Failed to load certificate {}", path.display())
                        })?;
                        Ok(Arc::new(pinned) as Arc<dyn CertificateValidator>)
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(NodeDescriptor {
                    host: node.host.clone(),
                    tables: node.tables.clone(),
                    validators,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("node.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_defaults_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
data_dir = "/var/lib/dtables"
bind_addr = "0.0.0.0:8443"
self_host = "db1.internal:8443"

[[tables]]
name = "users"
"#,
        );

        let config = NodeConfig::from_file(&path).unwrap();

        assert_eq!(config.scheme, "https");
        assert_eq!(config.lock_expiration(), Duration::from_secs(30));
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.maintenance_interval(), Duration::from_secs(300));
        assert_eq!(config.tables[0].min_version, 1);
        assert!(config.nodes.is_empty());
        assert!(config.identity().unwrap().is_none());
    }

    #[test]
    fn test_nodes_and_pinned_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("db2.pem");
        std::fs::write(&cert, "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n").unwrap();
        let body = format!(
            r#"
data_dir = "data"
bind_addr = "127.0.0.1:9000"
self_host = "127.0.0.1:9000"
scheme = "http"
plaintext = true

[[nodes]]
host = "127.0.0.1:9000"

[[nodes]]
host = "127.0.0.1:9001"
tables = ["users"]
trusted_certificates = ["{}"]
"#,
            cert.display()
        );
        let path = write_config(dir.path(), &body);

        let config = NodeConfig::from_file(&path).unwrap();
        let descriptors = config.node_descriptors().unwrap();
        let settings = config.cluster_settings().unwrap();

        assert_eq!(descriptors.len(), 2);
        assert!(descriptors[0].validators.is_empty());
        assert_eq!(descriptors[1].tables, Some(vec!["users".to_string()]));
        assert_eq!(descriptors[1].validators.len(), 1);
        assert!(descriptors[1].validators[0].validate("-----BEGIN CERTIFICATE-----AAAA-----END CERTIFICATE-----", "x"));
        assert!(matches!(settings.identity, Some(ClientIdentity::Plaintext)));
    }

    #[test]
    fn test_http_requires_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
data_dir = "data"
bind_addr = "127.0.0.1:9000"
self_host = "127.0.0.1:9000"
scheme = "http"
"#,
        );

        assert!(NodeConfig::from_file(&path).is_err());
    }

    #[test]
    fn test_duplicate_tables_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
data_dir = "data"
bind_addr = "127.0.0.1:9000"
self_host = "127.0.0.1:9000"

[[tables]]
name = "users"

[[tables]]
name = "users"
min_version = 2
"#,
        );

        assert!(NodeConfig::from_file(&path).is_err());
    }
}
