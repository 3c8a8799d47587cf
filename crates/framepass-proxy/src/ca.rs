//! Root certificate authority for TLS interception.
//!
//! The proxy signs a certificate per intercepted host with this CA. The CA
//! is generated once and stored under the platform data directory; the
//! user installs `framepass-ca.crt` in the browser that hosts the embedding
//! surface.

use std::fs;
use std::path::{Path, PathBuf};

use hudsucker::certificate_authority::RcgenAuthority;
use hudsucker::rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use hudsucker::rustls::crypto::aws_lc_rs::default_provider;

pub use crate::error::CaManagerError;

const CA_CERT_FILENAME: &str = "framepass-ca.crt";
const CA_KEY_FILENAME: &str = "framepass-ca.key";
const CA_COMMON_NAME: &str = "Framepass Root CA";

/// Number of per-host leaf certificates kept in memory.
const LEAF_CACHE_SIZE: u64 = 1000;

/// Manages the root CA certificate for the MITM proxy.
#[derive(Debug, Clone)]
pub struct CaManager {
    ca_dir: PathBuf,
}

/// Certificate parameters for the root CA.
fn root_params() -> Result<CertificateParams, CaManagerError> {
    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|e| CaManagerError::Generation(e.to_string()))?;

    params
        .distinguished_name
        .push(DnType::CommonName, CA_COMMON_NAME);
    params
        .distinguished_name
        .push(DnType::OrganizationName, "Framepass");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    Ok(params)
}

impl CaManager {
    pub fn new(ca_dir: impl AsRef<Path>) -> Self {
        Self {
            ca_dir: ca_dir.as_ref().to_path_buf(),
        }
    }

    /// Creates a CA manager under the platform data directory.
    pub fn with_default_dir() -> Result<Self, CaManagerError> {
        let project_dirs = directories::ProjectDirs::from("dev", "framepass", "Framepass")
            .ok_or_else(|| CaManagerError::Generation("Failed to get project dirs".into()))?;

        Ok(Self::new(project_dirs.data_dir().join("ca")))
    }

    pub fn ca_dir(&self) -> &Path {
        &self.ca_dir
    }

    pub fn cert_path(&self) -> PathBuf {
        self.ca_dir.join(CA_CERT_FILENAME)
    }

    pub fn key_path(&self) -> PathBuf {
        self.ca_dir.join(CA_KEY_FILENAME)
    }

    /// Checks if both the certificate and the key exist.
    pub fn ca_exists(&self) -> bool {
        self.cert_path().exists() && self.key_path().exists()
    }

    /// Ensures the CA exists, generating it if necessary.
    ///
    /// Returns the authority ready for use with the proxy.
    pub fn ensure_ca(&self) -> Result<RcgenAuthority, CaManagerError> {
        if !self.ca_exists() {
            self.generate_ca()?;
        }
        self.load_authority()
    }

    /// Generates a new root CA certificate and key, replacing any existing one.
    pub fn generate_ca(&self) -> Result<(), CaManagerError> {
        fs::create_dir_all(&self.ca_dir)?;

        let key_pair =
            KeyPair::generate().map_err(|e| CaManagerError::Generation(e.to_string()))?;
        let cert = root_params()?
            .self_signed(&key_pair)
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;

        fs::write(self.cert_path(), cert.pem())
            .map_err(|e| CaManagerError::Write(e.to_string()))?;
        fs::write(self.key_path(), key_pair.serialize_pem())
            .map_err(|e| CaManagerError::Write(e.to_string()))?;

        tracing::info!("Generated new CA certificate at {:?}", self.cert_path());
        Ok(())
    }

    /// Loads the stored CA as a signing authority.
    pub fn load_authority(&self) -> Result<RcgenAuthority, CaManagerError> {
        let cert_pem = fs::read_to_string(self.cert_path())?;
        let key_pair = self.load_key()?;

        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CaManagerError::Parse(e.to_string()))?;

        Ok(RcgenAuthority::new(issuer, LEAF_CACHE_SIZE, default_provider()))
    }

    fn load_key(&self) -> Result<KeyPair, CaManagerError> {
        let key_pem = fs::read_to_string(self.key_path())?;
        KeyPair::from_pem(&key_pem).map_err(|e| CaManagerError::Parse(e.to_string()))
    }

    /// Returns the stored certificate in PEM form.
    pub fn read_cert_pem(&self) -> Result<String, CaManagerError> {
        Ok(fs::read_to_string(self.cert_path())?)
    }

    /// Returns a DER certificate for the stored key.
    ///
    /// The certificate is re-signed from the stored key, so it carries the
    /// same subject and public key as the installed one.
    pub fn read_cert_der(&self) -> Result<Vec<u8>, CaManagerError> {
        let key_pair = self.load_key()?;
        let cert = root_params()?
            .self_signed(&key_pair)
            .map_err(|e| CaManagerError::Parse(e.to_string()))?;

        Ok(cert.der().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ca_manager_paths() {
        let manager = CaManager::new("/tmp/test-ca");
        assert_eq!(manager.ca_dir(), Path::new("/tmp/test-ca"));
        assert_eq!(
            manager.cert_path(),
            PathBuf::from("/tmp/test-ca/framepass-ca.crt")
        );
        assert_eq!(
            manager.key_path(),
            PathBuf::from("/tmp/test-ca/framepass-ca.key")
        );
    }

    #[test]
    fn ca_manager_not_exists_initially() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));
        assert!(!manager.ca_exists());
        assert!(manager.read_cert_pem().is_err());
    }

    #[test]
    fn ca_manager_generate_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));

        manager.generate_ca().unwrap();
        assert!(manager.ca_exists());
        assert!(manager.load_authority().is_ok());

        let pem = manager.read_cert_pem().unwrap();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn ensure_ca_generates_once() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));

        assert!(manager.ensure_ca().is_ok());
        let first = manager.read_cert_pem().unwrap();

        assert!(manager.ensure_ca().is_ok());
        assert_eq!(manager.read_cert_pem().unwrap(), first);
    }

    #[test]
    fn ca_manager_read_cert_der() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));

        manager.generate_ca().unwrap();
        let der = manager.read_cert_der().unwrap();
        assert!(!der.is_empty());
    }
}
