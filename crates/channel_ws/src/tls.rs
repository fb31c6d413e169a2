use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use rustls::{
    ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer},
};
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::WsError;

/// Build a TLS acceptor when both PEM paths are configured. A single path on
/// its own is ignored with a warning and the server stays plain `ws://`.
pub fn acceptor(
    certificate_path: Option<&Path>,
    private_key_path: Option<&Path>,
) -> Result<Option<TlsAcceptor>, WsError> {
    match (certificate_path, private_key_path) {
        (Some(cert), Some(key)) => {
            let certs = load_certs(cert)?;
            let key = load_key(key)?;
            let config = ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, key)?;
            info!(certificate = %cert.display(), "websocket TLS enabled");
            Ok(Some(TlsAcceptor::from(Arc::new(config))))
        }
        (None, None) => Ok(None),
        _ => {
            warn!("WS_CERTIFICATE_PATH and WS_PRIVATE_KEY_PATH must both be set for TLS; serving plain websocket");
            Ok(None)
        }
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, WsError> {
    fs::read(path).map_err(|source| WsError::ReadPem {
        path: path.to_path_buf(),
        source,
    })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, WsError> {
    let pem = read_pem(path)?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_slice())
        .filter_map(Result::ok)
        .collect();
    if certs.is_empty() {
        return Err(WsError::NoCertificate(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, WsError> {
    let pem = read_pem(path)?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|source| WsError::ReadPem {
            path: PathBuf::from(path),
            source,
        })?
        .ok_or_else(|| WsError::NoPrivateKey(path.to_path_buf()))
}
