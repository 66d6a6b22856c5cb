use crate::error::NetError;
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::Path;

/// Server-side TLS for the stream layer from PEM files.
pub fn load_server_config(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<ServerConfig, NetError> {
    let chain = load_cert_chain(cert_path)?;
    if chain.is_empty() {
        return Err(NetError::Protocol("certificate chain is empty".into()));
    }
    let key = load_private_key(key_path)?;
    ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(NetError::from)
}

/// Client-side TLS for outbound peer sessions, trusting `ca_path`.
pub fn load_client_config(ca_path: impl AsRef<Path>) -> Result<ClientConfig, NetError> {
    let mut roots = RootCertStore::empty();
    for cert in load_cert_chain(ca_path)? {
        roots
            .add(&cert)
            .map_err(|err| NetError::Protocol(format!("invalid trust root: {err}")))?;
    }
    Ok(ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

fn load_cert_chain(path: impl AsRef<Path>) -> Result<Vec<Certificate>, NetError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let parsed =
        certs(&mut reader).map_err(|_| NetError::Protocol("invalid certificate chain".into()))?;
    Ok(parsed.into_iter().map(Certificate).collect())
}

fn load_private_key(path: impl AsRef<Path>) -> Result<PrivateKey, NetError> {
    let pem = std::fs::read(path.as_ref())?;

    let mut reader = Cursor::new(&pem);
    let keys = pkcs8_private_keys(&mut reader)
        .map_err(|_| NetError::Protocol("invalid PKCS#8 key".into()))?;
    if let Some(key) = keys.into_iter().next() {
        return Ok(PrivateKey(key));
    }

    let mut reader = Cursor::new(&pem);
    let keys =
        rsa_private_keys(&mut reader).map_err(|_| NetError::Protocol("invalid RSA key".into()))?;
    if let Some(key) = keys.into_iter().next() {
        return Ok(PrivateKey(key));
    }

    Err(NetError::Protocol("no private key found".into()))
}
