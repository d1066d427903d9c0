//! Mutual-TLS serving.
//!
//! A static rustls server configuration: TLS 1.3 only, server identity
//! from PEM files, client certificates verified against the configured
//! CA. Each accepted connection gets its own task and its own handshake.

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use rustls::RootCertStore;
use rustls::ServerConfig as RustlsServerConfig;
use rustls::server::WebPkiClientVerifier;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;

/// Build the rustls server configuration for mTLS.
pub fn build_tls_config(config: &ServerConfig) -> anyhow::Result<Arc<RustlsServerConfig>> {
    let certs: Vec<CertificateDer<'static>> =
        CertificateDer::pem_file_iter(&config.cert_file)
            .map_err(|e| anyhow::anyhow!("read {}: {e}", config.cert_file))?
            .collect::<Result<_, _>>()
            .map_err(|e| anyhow::anyhow!("parse {}: {e}", config.cert_file))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates in {}", config.cert_file);
    }

    let key = PrivateKeyDer::from_pem_file(&config.key_file)
        .map_err(|e| anyhow::anyhow!("read {}: {e}", config.key_file))?;

    let builder = RustlsServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13]);

    let builder = if config.ca_cert_file.is_empty() {
        warn!("no client CA configured, client certificates are not verified");
        builder.with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        for cert in CertificateDer::pem_file_iter(&config.ca_cert_file)
            .map_err(|e| anyhow::anyhow!("read {}: {e}", config.ca_cert_file))?
        {
            let cert = cert.map_err(|e| anyhow::anyhow!("parse {}: {e}", config.ca_cert_file))?;
            roots
                .add(cert)
                .map_err(|e| anyhow::anyhow!("add CA cert: {e}"))?;
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| anyhow::anyhow!("client verifier: {e}"))?;
        builder.with_client_cert_verifier(verifier)
    };

    let server_config = builder
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("server identity: {e}"))?;

    Ok(Arc::new(server_config))
}

/// Accept loop serving the router over TLS. Handshake failures are
/// logged and dropped; they never take the listener down.
pub async fn serve(
    listener: TcpListener,
    tls_config: Arc<RustlsServerConfig>,
    app: Router,
) -> anyhow::Result<()> {
    let acceptor = TlsAcceptor::from(tls_config);
    info!(addr = %listener.local_addr()?, "serving with mutual TLS");

    loop {
        let (stream, peer) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let app = app.clone();

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    warn!(%peer, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let service = TowerToHyperService::new(app);
            let io = TokioIo::new(tls_stream);
            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                debug!(%peer, error = %e, "connection ended with error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(cert: &str, key: &str, ca: &str) -> ServerConfig {
        ServerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            cert_file: cert.to_string(),
            key_file: key.to_string(),
            ca_cert_file: ca.to_string(),
            client_cert_file: String::new(),
            server_name: String::new(),
            insecure: false,
            debug: false,
            trace: false,
            log_file: String::new(),
            proxy_envs: HashMap::new(),
        }
    }

    #[test]
    fn test_missing_cert_file_is_an_error() {
        let result = build_tls_config(&config("/nonexistent/cert.pem", "/nonexistent/key.pem", ""));
        assert!(result.is_err());
    }
}
