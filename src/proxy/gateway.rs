//! Pingora ProxyHttp implementation for the gateway.
//!
//! The single HTTP entry point. Requests under the admin prefix are
//! answered locally; everything else is matched against the routing table
//! and relayed to an available host of the selected group. Every response
//! carries the `Server: mgw` banner, and failed dispatches carry the wall
//! time of the attempt in a `duration` header.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use pingora_core::prelude::*;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_core::{ErrorSource, ErrorType};
use pingora_http::ResponseHeader;
use pingora_proxy::{ProxyHttp, Session};
use tracing::{debug, info, warn};
use url::Url;

use crate::admin;
use crate::config::Config;
use crate::error::{GatewayError, HandlerError};
use crate::proxy::router;
use crate::store::{ApiStore, RouteTable};

/// Banner value set on every response.
pub const SERVER_NAME: &str = "mgw";

/// Per-request context.
///
/// Carries the dispatch timer, the chosen upstream for logging, and the
/// reason text for a locally generated failure.
#[derive(Default)]
pub struct GatewayCtx {
    pub start: Option<Instant>,
    pub upstream: Option<String>,
    pub reason: Option<String>,
}

/// Gateway front-end: admin surface plus proxy dispatch over one listener.
pub struct Gateway {
    table: Arc<RouteTable>,
    store: Arc<ApiStore>,
    read_timeout: u64,
    write_timeout: u64,
    idle_timeout: u64,
}

impl Gateway {
    pub fn new(table: Arc<RouteTable>, store: Arc<ApiStore>, config: &Config) -> Self {
        Self {
            table,
            store,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            idle_timeout: config.idle_timeout,
        }
    }
}

#[async_trait]
impl ProxyHttp for Gateway {
    type CTX = GatewayCtx;

    fn new_ctx(&self) -> Self::CTX {
        GatewayCtx::default()
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        if self.idle_timeout > 0 {
            session.set_keepalive(Some(self.idle_timeout));
        }
        let path = session.req_header().uri.path().to_string();
        if admin::is_admin_path(&path) {
            admin::handle(&self.table, &self.store, session, self.read_timeout).await?;
            return Ok(true);
        }
        ctx.start = Some(Instant::now());
        Ok(false)
    }

    async fn upstream_peer(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let path = session.req_header().uri.path();

        let group = match router::match_group(&self.table, path) {
            Some(group) => group,
            None => {
                ctx.reason = Some(format!("no route for {path}"));
                return Err(Error::explain(ErrorType::HTTPStatus(404), "no route"));
            }
        };
        let host = match group.pick() {
            Some(host) => host,
            None => {
                ctx.reason = Some(format!("no available host for {}", group.pattern()));
                return Err(Error::explain(ErrorType::HTTPStatus(503), "no healthy upstream"));
            }
        };
        ctx.upstream = Some(host.server.clone());

        let mut peer = build_peer(&host.server)?;
        if self.read_timeout > 0 {
            let deadline = std::time::Duration::from_secs(self.read_timeout);
            peer.options.connection_timeout = Some(deadline);
            peer.options.read_timeout = Some(deadline);
        }
        if self.write_timeout > 0 {
            peer.options.write_timeout = Some(std::time::Duration::from_secs(self.write_timeout));
        }

        debug!(path = %path, pattern = %group.pattern(), upstream = %host.server, "dispatching");
        Ok(Box::new(peer))
    }

    async fn response_filter(
        &self,
        _session: &mut Session,
        resp: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        resp.insert_header("Server", SERVER_NAME)?;
        if resp.status.as_u16() >= 400 {
            if let Some(start) = ctx.start {
                resp.insert_header("duration", format_duration(start.elapsed()))?;
            }
        }
        Ok(())
    }

    async fn fail_to_proxy(&self, session: &mut Session, e: &Error, ctx: &mut Self::CTX) -> u16 {
        let code = match e.etype() {
            ErrorType::HTTPStatus(code) => *code,
            ErrorType::ConnectTimedout | ErrorType::ReadTimedout | ErrorType::WriteTimedout => 504,
            _ => 502,
        };

        if matches!(e.esource(), ErrorSource::Downstream) {
            return match e.etype() {
                // The client went away; there is no one left to answer.
                ErrorType::WriteError | ErrorType::ReadError | ErrorType::ConnectionClosed => 0,
                _ => {
                    let _ = respond_text(session, 400, "400 bad request\n", ctx.start).await;
                    400
                }
            };
        }
        if session.response_written().is_some() {
            // Failed mid-stream; the connection closes as-is.
            return code;
        }

        let reason = ctx.reason.take().unwrap_or_else(|| relay_reason(e));
        let err = HandlerError::with_status(code, classify_failure(code, &reason));
        warn!(error = %err, upstream = ctx.upstream.as_deref().unwrap_or("-"), "dispatch failed");

        let body = format!("{code} {reason}\n");
        if let Err(write_err) = respond_text(session, code, &body, ctx.start).await {
            debug!(error = %write_err, "failed to write error response");
        }
        code
    }

    async fn logging(&self, session: &mut Session, _e: Option<&Error>, ctx: &mut Self::CTX) {
        let status = session
            .response_written()
            .map(|resp| resp.status.as_u16())
            .unwrap_or(0);
        let method = session.req_header().method.as_str();
        let path = session.req_header().uri.path();
        let upstream = ctx.upstream.as_deref().unwrap_or("-");

        info!(
            method = method,
            path = path,
            status = status,
            upstream = upstream,
            "request completed"
        );
    }
}

/// Builds the reverse-proxy peer for a server origin of the form
/// `scheme://host:port`.
fn build_peer(server: &str) -> Result<HttpPeer> {
    let url = Url::parse(server).map_err(|_| {
        Error::explain(
            ErrorType::InternalError,
            format!("invalid upstream origin {server}"),
        )
    })?;
    let tls = url.scheme() == "https";
    let host = url
        .host_str()
        .ok_or_else(|| Error::explain(ErrorType::InternalError, format!("missing host in {server}")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::explain(ErrorType::InternalError, format!("missing port in {server}")))?;
    Ok(HttpPeer::new(
        format!("{host}:{port}"),
        tls,
        host.to_string(),
    ))
}

fn classify_failure(code: u16, reason: &str) -> GatewayError {
    match code {
        404 => GatewayError::NotFound(reason.to_string()),
        503 => GatewayError::NoHealthyUpstream(reason.to_string()),
        _ => GatewayError::UpstreamUnreachable(reason.to_string()),
    }
}

fn relay_reason(e: &Error) -> String {
    match e.etype() {
        ErrorType::ConnectTimedout => "upstream connect timeout".to_string(),
        ErrorType::ReadTimedout => "upstream read timeout".to_string(),
        ErrorType::WriteTimedout => "upstream write timeout".to_string(),
        other => format!("upstream {}", other.as_str()),
    }
}

/// Header-safe rendering of a wall-time measurement.
fn format_duration(elapsed: std::time::Duration) -> String {
    format!("{:.3}ms", elapsed.as_secs_f64() * 1000.0)
}

/// Writes a complete plain-text response with the banner and admin content
/// headers. Statuses of 400 and above carry the dispatch duration when a
/// timer was started.
pub(crate) async fn respond_text(
    session: &mut Session,
    status: u16,
    body: &str,
    started: Option<Instant>,
) -> Result<()> {
    let mut resp = ResponseHeader::build(status, Some(6))?;
    resp.insert_header("Server", SERVER_NAME)?;
    resp.insert_header("Content-Type", "text/plain; charset=utf-8")?;
    resp.insert_header("X-Content-Type-Options", "nosniff")?;
    if status >= 400 {
        if let Some(start) = started {
            resp.insert_header("duration", format_duration(start.elapsed()))?;
        }
    }
    resp.insert_header("Content-Length", body.len().to_string())?;
    session.write_response_header(Box::new(resp), false).await?;
    session
        .write_response_body(Some(Bytes::copy_from_slice(body.as_bytes())), true)
        .await
}

/// Writes a complete HTML response with the banner.
pub(crate) async fn respond_html(session: &mut Session, status: u16, body: &str) -> Result<()> {
    let mut resp = ResponseHeader::build(status, Some(4))?;
    resp.insert_header("Server", SERVER_NAME)?;
    resp.insert_header("Content-Type", "text/html; charset=utf-8")?;
    resp.insert_header("Content-Length", body.len().to_string())?;
    session.write_response_header(Box::new(resp), false).await?;
    session
        .write_response_body(Some(Bytes::copy_from_slice(body.as_bytes())), true)
        .await
}

/// Writes a redirect with no body.
pub(crate) async fn respond_redirect(session: &mut Session, location: &str) -> Result<()> {
    let mut resp = ResponseHeader::build(302, Some(3))?;
    resp.insert_header("Server", SERVER_NAME)?;
    resp.insert_header("Location", location.to_string())?;
    resp.insert_header("Content-Length", "0")?;
    session.write_response_header(Box::new(resp), true).await
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========== Phase 1: Peer Building ==========

    #[test]
    fn test_build_peer_http_origin() {
        let peer = build_peer("http://backend.local:8080").unwrap();
        assert!(!peer.is_tls());
    }

    #[test]
    fn test_build_peer_https_origin_uses_tls() {
        let peer = build_peer("https://backend.local:8443").unwrap();
        assert!(peer.is_tls());
    }

    #[test]
    fn test_build_peer_default_ports() {
        assert!(build_peer("http://backend.local").is_ok());
        assert!(build_peer("https://backend.local").is_ok());
    }

    #[test]
    fn test_build_peer_rejects_garbage() {
        assert!(build_peer("not a url").is_err());
        assert!(build_peer("file:///etc/passwd").is_err());
    }

    // ========== Phase 2: Failure Mapping ==========

    #[test]
    fn test_classify_failure_kinds() {
        assert!(matches!(classify_failure(404, "x"), GatewayError::NotFound(_)));
        assert!(matches!(
            classify_failure(503, "x"),
            GatewayError::NoHealthyUpstream(_)
        ));
        assert!(matches!(
            classify_failure(502, "x"),
            GatewayError::UpstreamUnreachable(_)
        ));
        assert!(matches!(
            classify_failure(504, "x"),
            GatewayError::UpstreamUnreachable(_)
        ));
    }

    #[test]
    fn test_relay_reason_names_timeouts() {
        let e = Error::explain(ErrorType::ConnectTimedout, "t");
        assert_eq!(relay_reason(&e), "upstream connect timeout");
        let e = Error::explain(ErrorType::ReadTimedout, "t");
        assert_eq!(relay_reason(&e), "upstream read timeout");
    }

    // ========== Phase 3: Trait Object Properties ==========

    #[test]
    fn test_gateway_ctx_default_is_empty() {
        let ctx = GatewayCtx::default();
        assert!(ctx.start.is_none());
        assert!(ctx.upstream.is_none());
        assert!(ctx.reason.is_none());
    }
}
