//! Relay self-test: fetch a "what is my IP" URL through the relay and
//! report the egress address.

use super::RelayError;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header;
use hyper::{Request, Uri};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Bytes of a bad body quoted in the failure
const BODY_PREVIEW: usize = 200;

/// Outcome of a successful self-test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    /// Egress address as seen by the remote end
    pub origin: String,
    pub elapsed: Duration,
}

/// `GET url` through the relay at `relay`, bounded by `limit`
pub async fn probe(relay: SocketAddr, url: &str, limit: Duration) -> Result<ProbeReport, RelayError> {
    let started = Instant::now();
    let report = tokio::time::timeout(limit, fetch(relay, url))
        .await
        .map_err(|_| RelayError::ProbeFailed(format!("no answer within {limit:?}")))??;

    let elapsed = started.elapsed();
    debug!("Relay probe answered in {:?}: {}", elapsed, report);
    Ok(ProbeReport {
        origin: report,
        elapsed,
    })
}

async fn fetch(relay: SocketAddr, url: &str) -> Result<String, RelayError> {
    let uri: Uri = url
        .parse()
        .map_err(|_| RelayError::InvalidTarget(url.to_string()))?;
    let host = uri
        .authority()
        .map(|a| a.as_str().to_string())
        .ok_or_else(|| RelayError::InvalidTarget(url.to_string()))?;

    let stream = TcpStream::connect(relay).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Probe connection closed: {}", e);
        }
    });

    // Absolute-form, as a browser talks to a proxy
    let request = Request::get(uri)
        .header(header::HOST, host)
        .header(header::ACCEPT, "application/json")
        .body(Empty::<Bytes>::new())
        .map_err(|e| RelayError::InvalidTarget(e.to_string()))?;

    let response = sender.send_request(request).await?;
    let status = response.status();
    let body = response.into_body().collect().await?.to_bytes();

    if !status.is_success() {
        warn!("Relay probe got HTTP {}", status);
        return Err(RelayError::ProbeFailed(format!(
            "HTTP {}: {}",
            status.as_u16(),
            preview(&body)
        )));
    }

    parse_origin(&body)
}

/// Pull `origin` out of an httpbin-style JSON body
fn parse_origin(body: &[u8]) -> Result<String, RelayError> {
    let json: serde_json::Value = serde_json::from_slice(body)
        .map_err(|_| RelayError::ProbeFailed(format!("Non-JSON response: {}", preview(body))))?;

    json.get("origin")
        .and_then(|o| o.as_str())
        .map(str::to_string)
        .ok_or_else(|| RelayError::ProbeFailed(format!("No origin in response: {}", preview(body))))
}

fn preview(body: &[u8]) -> String {
    let end = body.len().min(BODY_PREVIEW);
    String::from_utf8_lossy(&body[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_origin() {
        assert_eq!(parse_origin(br#"{"origin": "203.0.113.9"}"#).unwrap(), "203.0.113.9");
        assert!(parse_origin(b"<html>captive portal</html>").is_err());
        assert!(parse_origin(br#"{"ip": "1.2.3.4"}"#).is_err());
    }

    #[test]
    fn test_preview_truncates() {
        let long = vec![b'a'; 500];
        assert_eq!(preview(&long).len(), BODY_PREVIEW);
    }
}
