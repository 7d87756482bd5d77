use std::{path::Path, sync::Arc};

use color_eyre::eyre::Context;
use rustls::{RootCertStore, ServerConfig, server::WebPkiClientVerifier};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject};
use tokio_rustls::TlsAcceptor;

use crate::{config::TlsArgs, error::ServerError};

fn load_certificates(path: &Path) -> color_eyre::Result<Vec<CertificateDer<'static>>> {
    let certificates = CertificateDer::pem_file_iter(path)
        .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
        .with_context(|| format!("Error reading certificates from {path:?}"))?;
    if certificates.is_empty() {
        return Err(ServerError::TlsConfig(format!("No certificates found in {path:?}")).into());
    }
    Ok(certificates)
}

// Build the acceptor for the listener, or None when TLS isn't configured.
pub(crate) fn tls_acceptor(args: &TlsArgs) -> color_eyre::Result<Option<TlsAcceptor>> {
    let (key, cert) = match (args.tls_key.as_deref(), args.tls_cert.as_deref()) {
        (Some(key), Some(cert)) => (key, cert),
        (None, None) => {
            if args.tls_ca.is_some() {
                return Err(
                    ServerError::TlsConfig("--tls-ca requires --tls-key and --tls-cert".into())
                        .into(),
                );
            }
            return Ok(None);
        }
        _ => {
            return Err(ServerError::TlsConfig(
                "--tls-key and --tls-cert must be set together".into(),
            )
            .into());
        }
    };
    let certificates = load_certificates(cert)?;
    let key = PrivateKeyDer::from_pem_file(key)
        .with_context(|| format!("Error reading private key from {key:?}"))?;
    let builder = ServerConfig::builder();
    let builder = match args.tls_ca.as_deref() {
        // Require client certificates signed by the given CA
        Some(ca) => {
            let mut roots = RootCertStore::empty();
            roots.add_parsable_certificates(load_certificates(ca)?);
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|error| ServerError::TlsConfig(error.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };
    let mut config = builder
        .with_single_cert(certificates, key)
        .map_err(|error| ServerError::TlsConfig(error.to_string()))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}
