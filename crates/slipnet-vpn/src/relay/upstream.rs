//! Outbound HTTP/1.1 connections over the SOCKS5 hop, optionally wrapped
//! in TLS for `https://` targets.

use super::http::Target;
use super::{ConnLog, RelayError, is_benign_hyper};
use crate::socks::Socks5Connector;
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;

fn tls_config() -> Arc<ClientConfig> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

            let config = ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();
            Arc::new(config)
        })
        .clone()
}

/// Dial `target` through the hop and complete the HTTP/1.1 handshake.
///
/// The connection task is spawned with upgrade support, so the same sender
/// serves both plain requests and `101 Switching Protocols` exchanges.
pub(crate) async fn open(
    connector: &Socks5Connector,
    target: &Target,
    log: &ConnLog,
) -> Result<SendRequest<Incoming>, RelayError> {
    let stream = connector.connect(target.dial_host(), target.port).await?;
    log.verbose(format_args!("SOCKS5 connected to {}:{}", target.host, target.port));

    if !target.is_https() {
        return handshake(stream, log).await;
    }

    let server_name = rustls::pki_types::ServerName::try_from(target.dial_host().to_string())
        .map_err(|_| RelayError::Tls(format!("Invalid server name {}", target.host)))?;
    let tls_stream = TlsConnector::from(tls_config())
        .connect(server_name, stream)
        .await
        .map_err(|e| RelayError::Tls(e.to_string()))?;
    log.verbose("TLS established");

    handshake(tls_stream, log).await
}

async fn handshake<S>(stream: S, log: &ConnLog) -> Result<SendRequest<Incoming>, RelayError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sender, conn) = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(stream))
        .await?;

    let log = log.clone();
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            if is_benign_hyper(&e) {
                log.verbose(format_args!("Upstream connection closed: {e}"));
            } else {
                log.error(format_args!("Upstream connection error: {e}"));
            }
        }
    });

    Ok(sender)
}
