//! Plain HTTP forwarding.
//!
//! Absolute-form requests (`GET http://host/path`) are re-issued upstream in
//! origin-form with hop-by-hop and proxy headers removed. Relative-form
//! requests get a target synthesized from their `Host` header.

use super::server::RelayContext;
use super::idle::IdleTimeout;
use super::{ConnLog, RelayBody, RelayError, full, is_benign_hyper, upstream};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Request, Response, StatusCode, Uri, Version};

/// Request headers never forwarded upstream
const STRIPPED_REQUEST_HEADERS: [&str; 6] = [
    "host",
    "proxy-connection",
    "proxy-authorization",
    "connection",
    "upgrade",
    "keep-alive",
];

/// Response headers never relayed back
const STRIPPED_RESPONSE_HEADERS: [&str; 3] = ["connection", "transfer-encoding", "keep-alive"];

/// Where a request is going
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Target {
    https: bool,
    /// Host as written in the URL (IPv6 keeps its brackets)
    pub(crate) host: String,
    pub(crate) port: u16,
    explicit_port: bool,
    pub(crate) path_and_query: String,
}

impl Target {
    /// Resolve the target of a request (port 80 unless the URL says otherwise)
    pub(crate) fn from_request<B>(req: &Request<B>) -> Result<Self, RelayError> {
        let uri = req.uri();
        if uri.scheme().is_some() && uri.authority().is_some() {
            return Self::from_uri(uri);
        }

        // Relative form: rebuild from Host
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .filter(|h| !h.trim().is_empty())
            .unwrap_or("localhost")
            .trim();
        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let synthesized: Uri = format!("http://{host}{path}")
            .parse()
            .map_err(|_| RelayError::InvalidTarget(format!("{host}{path}")))?;
        Self::from_uri(&synthesized)
    }

    fn from_uri(uri: &Uri) -> Result<Self, RelayError> {
        let https = match uri.scheme_str() {
            Some(s) if s.eq_ignore_ascii_case("https") || s.eq_ignore_ascii_case("wss") => true,
            Some(s) if s.eq_ignore_ascii_case("http") || s.eq_ignore_ascii_case("ws") => false,
            other => {
                return Err(RelayError::InvalidTarget(format!(
                    "unsupported scheme {}",
                    other.unwrap_or("")
                )));
            }
        };
        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| RelayError::InvalidTarget(uri.to_string()))?;

        Ok(Self {
            https,
            host: host.to_string(),
            port: uri.port_u16().unwrap_or(if https { 443 } else { 80 }),
            explicit_port: uri.port_u16().is_some(),
            path_and_query: uri
                .path_and_query()
                .map(|p| p.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
        })
    }

    pub(crate) fn is_https(&self) -> bool {
        self.https
    }

    /// Host without IPv6 brackets, for dialing and SNI
    pub(crate) fn dial_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    /// Value of the outbound `Host` header
    pub(crate) fn authority(&self) -> String {
        if self.explicit_port {
            format!("{}:{}", self.host, self.port)
        } else {
            self.host.clone()
        }
    }
}

/// Remove proxy and connection-management headers from a request
pub(crate) fn strip_request_headers(headers: &mut HeaderMap, keep_upgrade: bool) {
    for name in STRIPPED_REQUEST_HEADERS {
        if keep_upgrade && (name == "connection" || name == "upgrade") {
            continue;
        }
        headers.remove(name);
    }
}

/// Remove framing and connection headers from an upstream response
pub(crate) fn strip_response_headers(headers: &mut HeaderMap) {
    for name in STRIPPED_RESPONSE_HEADERS {
        headers.remove(name);
    }
}

/// Rewrite an inbound request into its origin-form outbound equivalent
pub(crate) fn outbound_request(
    req: Request<Incoming>,
    target: &Target,
    keep_upgrade: bool,
) -> Result<Request<Incoming>, RelayError> {
    let (mut parts, body) = req.into_parts();

    parts.uri = target
        .path_and_query
        .parse()
        .map_err(|_| RelayError::InvalidTarget(target.path_and_query.clone()))?;
    parts.version = Version::HTTP_11;

    strip_request_headers(&mut parts.headers, keep_upgrade);
    let authority = HeaderValue::from_str(&target.authority())
        .map_err(|_| RelayError::InvalidTarget(target.authority()))?;
    parts.headers.insert(header::HOST, authority);

    Ok(Request::from_parts(parts, body))
}

/// Text response for relay-generated errors
pub(crate) fn error_response(status: StatusCode, text: impl Into<String>) -> Response<RelayBody> {
    let mut resp = Response::new(full(text.into()));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    resp
}

/// Relay one plain HTTP request
pub(crate) async fn forward(
    req: Request<Incoming>,
    ctx: &RelayContext,
    log: ConnLog,
) -> Response<RelayBody> {
    let target = match Target::from_request(&req) {
        Ok(target) => target,
        Err(e) => {
            log.error(format_args!("Rejected {} {}: {}", req.method(), req.uri(), e));
            return error_response(StatusCode::BAD_REQUEST, e.to_string());
        }
    };
    log.verbose(format_args!(
        "HTTP {} {}:{}{}",
        req.method(),
        target.host,
        target.port,
        target.path_and_query
    ));

    let exchange = async {
        let mut sender = upstream::open(ctx.connector(), &target, &log).await?;
        let outbound = outbound_request(req, &target, false)?;
        Ok::<_, RelayError>(sender.send_request(outbound).await?)
    };

    let upstream_resp = match tokio::time::timeout(ctx.http_timeout(), exchange).await {
        Err(_) => {
            log.error(format_args!("Request timeout after {:?}", ctx.http_timeout()));
            return error_response(StatusCode::REQUEST_TIMEOUT, "Request Timeout");
        }
        Ok(Err(e)) => {
            log.error(format_args!("Proxy request error: {e}"));
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
        Ok(Ok(resp)) => resp,
    };

    log.verbose(format_args!("Response {}", upstream_resp.status()));

    let (mut parts, body) = upstream_resp.into_parts();
    strip_response_headers(&mut parts.headers);

    Response::from_parts(parts, relay_body(body, ctx, log))
}

/// Stream an upstream body back to the client, failing if it goes quiet
/// for longer than the HTTP timeout.
///
/// Headers are flushed before the body, so late failures can only be logged.
pub(crate) fn relay_body(body: Incoming, ctx: &RelayContext, log: ConnLog) -> RelayBody {
    let limit = ctx.http_timeout();
    IdleTimeout::new(body, limit)
        .map_err(move |e| {
            match &e {
                RelayError::Upstream(h) if is_benign_hyper(h) => {
                    log.verbose(format_args!("Response body ended early: {h}"))
                }
                RelayError::RequestTimeout => log.error(format_args!("Response body stalled for {limit:?}")),
                _ => log.error(format_args!("Error streaming response: {e}")),
            }
            e
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, host: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri(uri);
        if let Some(host) = host {
            builder = builder.header(header::HOST, host);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_absolute_form_target() {
        let target = Target::from_request(&request("http://example.com/a?b=1", None)).unwrap();
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 80);
        assert_eq!(target.path_and_query, "/a?b=1");
        assert_eq!(target.authority(), "example.com");
        assert!(!target.is_https());
    }

    #[test]
    fn test_absolute_form_explicit_port_in_authority() {
        let target = Target::from_request(&request("http://example.com:8081/", None)).unwrap();
        assert_eq!(target.port, 8081);
        assert_eq!(target.authority(), "example.com:8081");
    }

    #[test]
    fn test_https_absolute_form_defaults_to_443() {
        let target = Target::from_request(&request("https://example.com/", None)).unwrap();
        assert!(target.is_https());
        assert_eq!(target.port, 443);
    }

    #[test]
    fn test_relative_form_uses_host_header() {
        let target = Target::from_request(&request("/index.html", Some("intranet:9000"))).unwrap();
        assert_eq!(target.host, "intranet");
        assert_eq!(target.port, 9000);
        assert_eq!(target.path_and_query, "/index.html");

        let fallback = Target::from_request(&request("/", None)).unwrap();
        assert_eq!(fallback.host, "localhost");
    }

    #[test]
    fn test_ipv6_dial_host() {
        let target = Target::from_request(&request("http://[::1]:8080/", None)).unwrap();
        assert_eq!(target.dial_host(), "::1");
        assert_eq!(target.authority(), "[::1]:8080");
    }

    #[test]
    fn test_unsupported_scheme() {
        assert!(Target::from_request(&request("ftp://example.com/", None)).is_err());
    }

    #[test]
    fn test_strip_request_headers() {
        let mut headers = HeaderMap::new();
        for name in STRIPPED_REQUEST_HEADERS {
            headers.insert(name, HeaderValue::from_static("x"));
        }
        headers.insert("accept", HeaderValue::from_static("*/*"));

        let mut upgrade = headers.clone();
        strip_request_headers(&mut headers, false);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("accept"));

        strip_request_headers(&mut upgrade, true);
        assert!(upgrade.contains_key("connection"));
        assert!(upgrade.contains_key("upgrade"));
        assert!(!upgrade.contains_key("proxy-authorization"));
    }

    #[test]
    fn test_strip_response_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("content-type", HeaderValue::from_static("text/html"));

        strip_response_headers(&mut headers);
        assert_eq!(headers.len(), 1);
    }
}
