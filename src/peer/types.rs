use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Decides whether a client certificate presented by `hostname` is trusted.
///
/// Implementations live outside this crate (PKI checks, pinning, ...);
/// [`PinnedCertificate`] covers the common "exactly this certificate" case.
pub trait CertificateValidator: Send + Sync {
    fn validate(&self, certificate_pem: &str, hostname: &str) -> bool;
}

/// Accepts exactly one certificate, compared with whitespace ignored.
#[derive(Debug, Clone)]
pub struct PinnedCertificate {
    pem: String,
}

impl PinnedCertificate {
    pub fn new(pem: &str) -> Self {
        Self {
            pem: normalize_pem(pem),
        }
    }

    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        Ok(Self::new(&std::fs::read_to_string(path)?))
    }
}

impl CertificateValidator for PinnedCertificate {
    fn validate(&self, certificate_pem: &str, _hostname: &str) -> bool {
        !self.pem.is_empty() && normalize_pem(certificate_pem) == self.pem
    }
}

fn normalize_pem(pem: &str) -> String {
    pem.chars().filter(|c| !c.is_whitespace()).collect()
}

/// How this node authenticates itself to its peers.
#[derive(Debug, Clone)]
pub enum ClientIdentity {
    /// PEM bundle with the client certificate and its private key.
    Pem { path: PathBuf, certificate: String },
    /// Explicit opt-out of client certificates, for local clusters over plain HTTP.
    Plaintext,
}

impl ClientIdentity {
    pub fn from_pem_file(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let certificate = std::fs::read_to_string(&path)?;
        Ok(ClientIdentity::Pem { path, certificate })
    }
}

/// Static description of one configured cluster node.
#[derive(Clone)]
pub struct NodeDescriptor {
    pub host: String,
    /// Tables this node takes part in; `None` means all of them.
    pub tables: Option<Vec<String>>,
    pub validators: Vec<Arc<dyn CertificateValidator>>,
}

impl NodeDescriptor {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            tables: None,
            validators: Vec::new(),
        }
    }
}

impl std::fmt::Debug for NodeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeDescriptor")
            .field("host", &self.host)
            .field("tables", &self.tables)
            .field("validators", &self.validators.len())
            .finish()
    }
}

/// Connection parameters shared by every peer client of this process.
#[derive(Debug, Clone)]
pub struct PeerSettings {
    /// `https` in production; `http` only together with [`ClientIdentity::Plaintext`].
    pub scheme: String,
    /// How peers address this node; sent as `host=` on every call.
    pub self_host: String,
    pub request_timeout: Duration,
}
