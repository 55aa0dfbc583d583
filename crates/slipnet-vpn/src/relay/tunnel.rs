//! CONNECT tunnels and protocol upgrades.
//!
//! Both end in a splice: raw bytes copied in each direction until either
//! side finishes, at which point both sockets are dropped together.

use super::http::{Target, error_response, outbound_request, relay_body, strip_response_headers};
use super::server::RelayContext;
use super::{ConnLog, RelayBody, RelayError, empty, upstream};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::header::{self, HeaderValue};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};

/// Copy bytes both ways until one direction ends or fails.
///
/// Returning drops both streams, so a close on either side tears down the
/// other without waiting on it.
pub(crate) async fn splice<A, B>(client: A, upstream: B, log: &ConnLog)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rx, mut client_tx) = tokio::io::split(client);
    let (mut upstream_rx, mut upstream_tx) = tokio::io::split(upstream);

    let (side, result) = tokio::select! {
        r = tokio::io::copy(&mut client_rx, &mut upstream_tx) => ("client", r),
        r = tokio::io::copy(&mut upstream_rx, &mut client_tx) => ("target", r),
    };

    match result {
        Ok(bytes) => log.verbose(format_args!("{side} closed after sending {bytes} bytes")),
        Err(e) => log.io_error("Tunnel error", &e),
    }
}

/// `CONNECT host:port`
pub(crate) async fn connect(req: Request<Incoming>, ctx: &RelayContext, log: ConnLog) -> Response<RelayBody> {
    let Some(authority) = req.uri().authority().cloned() else {
        log.error(format_args!("CONNECT without authority: {}", req.uri()));
        return error_response(StatusCode::BAD_REQUEST, "CONNECT target must be host:port");
    };
    let host = authority.host().trim_start_matches('[').trim_end_matches(']').to_string();
    let port = authority.port_u16().unwrap_or(443);
    log.verbose(format_args!("CONNECT {host}:{port} (HTTPS)"));

    let dialed = tokio::time::timeout(ctx.http_timeout(), ctx.connector().connect(&host, port))
        .await
        .unwrap_or(Err(RelayError::RequestTimeout));
    let upstream = match dialed {
        Ok(stream) => stream,
        Err(e) => {
            log.error(format_args!("CONNECT {host}:{port} failed: {e}"));
            let mut resp = error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
            resp.headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
            resp.extensions_mut()
                .insert(ReasonPhrase::from_static(b"Proxy Error"));
            return resp;
        }
    };
    log.verbose(format_args!("SOCKS5 connected to {host}:{port}"));

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => splice(TokioIo::new(upgraded), upstream, &log).await,
            Err(e) => log.error(format_args!("CONNECT upgrade failed: {e}")),
        }
    });

    let mut resp = Response::new(empty());
    resp.extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection established"));
    resp
}

/// A request carrying `Upgrade` (WebSocket and friends)
pub(crate) async fn upgrade(mut req: Request<Incoming>, ctx: &RelayContext, log: ConnLog) -> Response<RelayBody> {
    let target = match Target::from_request(&req) {
        Ok(target) => target,
        Err(e) => {
            log.error(format_args!("Rejected upgrade {}: {}", req.uri(), e));
            return error_response(StatusCode::BAD_REQUEST, e.to_string());
        }
    };
    let protocol = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    log.verbose(format_args!("Upgrade ({protocol}) {}:{}", target.host, target.port));

    let client_side = hyper::upgrade::on(&mut req);

    let exchange = async {
        let mut sender = upstream::open(ctx.connector(), &target, &log).await?;
        let outbound = outbound_request(req, &target, true)?;
        Ok::<_, RelayError>(sender.send_request(outbound).await?)
    };

    let mut upstream_resp = match tokio::time::timeout(ctx.http_timeout(), exchange).await {
        Err(_) => {
            log.error("Upgrade handshake timeout");
            return error_response(StatusCode::REQUEST_TIMEOUT, "Request Timeout");
        }
        Ok(Err(e)) => {
            log.error(format_args!("Upgrade failed: {e}"));
            let mut resp = error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
            resp.headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
            return resp;
        }
        Ok(Ok(resp)) => resp,
    };

    if upstream_resp.status() != StatusCode::SWITCHING_PROTOCOLS {
        log.verbose(format_args!("Upstream declined upgrade with {}", upstream_resp.status()));
        let (mut parts, body) = upstream_resp.into_parts();
        strip_response_headers(&mut parts.headers);
        return Response::from_parts(parts, relay_body(body, ctx, log));
    }

    let upstream_side = hyper::upgrade::on(&mut upstream_resp);
    let (parts, _) = upstream_resp.into_parts();
    log.verbose("101 Switching Protocols");

    tokio::spawn(async move {
        match tokio::try_join!(client_side, upstream_side) {
            Ok((client, upstream)) => splice(TokioIo::new(client), TokioIo::new(upstream), &log).await,
            Err(e) => log.error(format_args!("Upgrade splice failed: {e}")),
        }
    });

    Response::from_parts(parts, empty())
}
