#![allow(dead_code)]

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair, SanType,
};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::{fs, net::IpAddr};
use strand::{load_client_config, load_server_config};
use tempfile::TempDir;

pub struct TlsMaterials {
    pub server: std::sync::Arc<rustls::ServerConfig>,
    pub peer: std::sync::Arc<rustls::ClientConfig>,
}

/// Generates a throwaway CA plus a localhost server identity and loads
/// them through the crate's PEM loaders.
pub fn tls_materials(dir: &TempDir) -> Result<TlsMaterials, Box<dyn Error>> {
    let ca_key = KeyPair::generate()?;
    let ca_cert = ca_params().self_signed(&ca_key)?;
    let ca_path = dir.path().join("ca.pem");
    fs::write(&ca_path, ca_cert.pem())?;

    let (cert_path, key_path) = write_identity(dir.path(), "server", &ca_cert, &ca_key)?;

    Ok(TlsMaterials {
        server: std::sync::Arc::new(load_server_config(&cert_path, &key_path)?),
        peer: std::sync::Arc::new(load_client_config(&ca_path)?),
    })
}

fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name = {
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(DnType::CommonName, "test-ca");
        dn
    };
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
}

fn write_identity(
    dir: &Path,
    name: &str,
    ca_cert: &Certificate,
    ca_key: &KeyPair,
) -> Result<(PathBuf, PathBuf), Box<dyn Error>> {
    let mut params = CertificateParams::new(vec!["localhost".to_string()])?;
    params.distinguished_name.push(DnType::CommonName, "localhost");
    params
        .subject_alt_names
        .push(SanType::IpAddress("127.0.0.1".parse::<IpAddr>()?));
    let key = KeyPair::generate()?;
    let cert = params.signed_by(&key, ca_cert, ca_key)?;
    let cert_path = dir.join(format!("{name}.pem"));
    let key_path = dir.join(format!("{name}.key"));
    fs::write(&cert_path, cert.pem())?;
    fs::write(&key_path, key.serialize_pem())?;
    Ok((cert_path, key_path))
}
