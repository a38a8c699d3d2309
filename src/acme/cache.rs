//! On-disk cache for issued certificates and the ACME account.
//!
//! Layout:
//! ```text
//! <root>/credentials.json
//! <root>/domains/<domain>/cert.pem
//! <root>/domains/<domain>/key.pem
//! ```

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, trace};

/// PEM material stored for one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCertificate {
    pub chain_pem: String,
    pub key_pem: String,
}

#[derive(Debug, Clone)]
pub struct DirCache {
    root: PathBuf,
}

impl DirCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn domain_path(&self, domain: &str) -> PathBuf {
        self.root.join("domains").join(domain)
    }

    /// Load the certificate stored for `domain`.
    pub async fn load(&self, domain: &str) -> io::Result<Option<StoredCertificate>> {
        let dir = self.domain_path(domain);
        let chain_pem = match fs::read_to_string(dir.join("cert.pem")).await {
            Ok(pem) => pem,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!(domain = %domain, "No cached certificate");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let key_pem = fs::read_to_string(dir.join("key.pem")).await?;
        debug!(domain = %domain, "Loaded cached certificate");
        Ok(Some(StoredCertificate { chain_pem, key_pem }))
    }

    /// Persist the certificate for `domain`. The key is written first so a
    /// reader never sees a chain without its key.
    pub async fn store(&self, domain: &str, cert: &StoredCertificate) -> io::Result<()> {
        let dir = self.domain_path(domain);
        fs::create_dir_all(&dir).await?;
        write_private(&dir.join("key.pem"), &cert.key_pem).await?;
        fs::write(dir.join("cert.pem"), &cert.chain_pem).await?;
        debug!(domain = %domain, "Cached certificate");
        Ok(())
    }

    /// Raw account credentials JSON, if an account was registered before.
    pub async fn load_credentials(&self) -> io::Result<Option<String>> {
        match fs::read_to_string(self.root.join("credentials.json")).await {
            Ok(json) => Ok(Some(json)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn store_credentials(&self, json: &str) -> io::Result<()> {
        fs::create_dir_all(&self.root).await?;
        write_private(&self.root.join("credentials.json"), json).await
    }
}

async fn write_private(path: &Path, contents: &str) -> io::Result<()> {
    fs::write(path, contents).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}
