//! Administrative surface under `/mgw`.
//!
//! Route registration, deletion, persistence control, and the HTML
//! inspector all live on the proxy listener itself; the gateway hands any
//! request whose path starts with the admin prefix to [`handle`].
//!
//! The `sign` payload uses keys as data: `name` and `check` are reserved,
//! and every other key is a backend server origin mapped to a list of
//! route patterns.

use std::sync::Arc;
use std::time::Duration;

use pingora_core::prelude::*;
use pingora_core::ErrorType;
use pingora_proxy::Session;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, HandlerError};
use crate::proxy::gateway::{respond_html, respond_redirect, respond_text};
use crate::proxy::upstream::{HealthCheck, DEFAULT_PROBE_INTERVAL, DEFAULT_PROBE_TIMEOUT};
use crate::store::{ApiStore, RouteTable};

/// Prefix that routes a request to the admin surface.
pub const ADMIN_PREFIX: &str = "/mgw";

/// True for `/mgw` itself and everything below it.
pub fn is_admin_path(path: &str) -> bool {
    path == ADMIN_PREFIX || path.starts_with("/mgw/")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdminRoute {
    Inspect,
    Sign,
    Delete,
    Save,
    Load,
    Unknown,
}

fn admin_route(path: &str) -> AdminRoute {
    match path {
        "/mgw" => AdminRoute::Inspect,
        "/mgw/sign" => AdminRoute::Sign,
        "/mgw/delete" => AdminRoute::Delete,
        "/mgw/save" => AdminRoute::Save,
        "/mgw/load" => AdminRoute::Load,
        _ => AdminRoute::Unknown,
    }
}

/// Dispatches one admin request and writes its response. Only transport
/// failures bubble up; handler errors are logged with their id and
/// rendered as responses here.
pub async fn handle(
    table: &Arc<RouteTable>,
    store: &ApiStore,
    session: &mut Session,
    body_timeout: u64,
) -> Result<()> {
    let path = session.req_header().uri.path().to_string();
    match admin_route(&path) {
        AdminRoute::Inspect => {
            let html = render_inspector(table);
            respond_html(session, 200, &html).await
        }
        AdminRoute::Sign => sign(table, store, session, body_timeout).await,
        AdminRoute::Delete => delete(table, store, session).await,
        AdminRoute::Save => match store.save(table) {
            Ok(()) => {
                info!(routes = table.len(), "routing table saved");
                respond_text(session, 200, "ok", None).await
            }
            Err(err) => fail(session, HandlerError::new(err)).await,
        },
        AdminRoute::Load => match store.load(table) {
            Ok(restored) => {
                info!(restored, "routing table loaded");
                respond_text(session, 200, "ok", None).await
            }
            Err(err) => fail(session, HandlerError::new(err)).await,
        },
        AdminRoute::Unknown => respond_text(session, 404, "404 page not found\n", None).await,
    }
}

/// Logs a handler error under its id and renders it. Bad requests echo the
/// decoder error; everything else gets the bare status line.
async fn fail(session: &mut Session, err: HandlerError) -> Result<()> {
    warn!(error = %err, "admin request failed");
    let body = match &err.cause {
        GatewayError::BadRequest(msg) => msg.clone(),
        _ => format!(
            "{} {}\n",
            err.status,
            http::StatusCode::from_u16(err.status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or("error")
        ),
    };
    respond_text(session, err.status, &body, None).await
}

// ---- sign ----

/// A parsed `POST /mgw/sign` payload.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SignRequest {
    pub name: String,
    pub check: HealthCheck,
    /// `(server origin, patterns)` pairs.
    pub entries: Vec<(String, Vec<String>)>,
}

async fn sign(
    table: &Arc<RouteTable>,
    store: &ApiStore,
    session: &mut Session,
    body_timeout: u64,
) -> Result<()> {
    if session.req_header().method != http::Method::POST {
        return respond_text(session, 200, SIGN_USAGE, None).await;
    }

    let body = read_body(session, body_timeout).await?;
    let request = match parse_sign_payload(&body) {
        Ok(request) => request,
        Err(err) => return fail(session, HandlerError::new(err)).await,
    };

    let mut registered = 0;
    for (server, patterns) in &request.entries {
        for pattern in patterns {
            match table.get_or_create(pattern, server, &request.name, &request.check) {
                Ok(_) => registered += 1,
                Err(err) => {
                    debug!(pattern = %pattern, server = %server, error = %err, "registration skipped");
                }
            }
        }
    }
    if let Err(err) = store.save(table) {
        // The in-memory change stands; the next save reconciles.
        warn!(error = %err, "persist after sign failed");
    }
    info!(registered, routes = table.len(), "routes registered");
    respond_text(session, 200, "ok", None).await
}

async fn read_body(session: &mut Session, timeout_secs: u64) -> Result<Vec<u8>> {
    let read = async {
        let mut body = Vec::new();
        while let Some(chunk) = session.read_request_body().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    };
    if timeout_secs == 0 {
        return read.await;
    }
    match tokio::time::timeout(Duration::from_secs(timeout_secs), read).await {
        Ok(result) => result,
        Err(_) => Err(Error::explain(
            ErrorType::ReadTimedout,
            "admin body read timed out",
        )),
    }
}

/// Parses the dynamic registration payload. Reserved keys are extracted
/// first; every remaining key is a server origin whose value must be a
/// list of pattern strings.
pub(crate) fn parse_sign_payload(body: &[u8]) -> Result<SignRequest, GatewayError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|err| GatewayError::BadRequest(err.to_string()))?;
    let map = value
        .as_object()
        .ok_or_else(|| GatewayError::BadRequest("payload must be a JSON object".to_string()))?;

    let mut name = String::new();
    let mut check = HealthCheck::default();
    let mut entries = Vec::new();
    for (key, val) in map {
        match key.as_str() {
            "name" => name = val.as_str().unwrap_or_default().to_string(),
            "check" => check = parse_check(val)?,
            server => {
                let list = val.as_array().ok_or_else(|| {
                    GatewayError::BadRequest(format!(
                        "patterns for {server} must be an array of strings"
                    ))
                })?;
                let mut patterns = Vec::with_capacity(list.len());
                for item in list {
                    let pattern = item.as_str().ok_or_else(|| {
                        GatewayError::BadRequest(format!(
                            "patterns for {server} must be an array of strings"
                        ))
                    })?;
                    patterns.push(pattern.to_string());
                }
                entries.push((server.to_string(), patterns));
            }
        }
    }
    Ok(SignRequest {
        name,
        check,
        entries,
    })
}

fn parse_check(value: &Value) -> Result<HealthCheck, GatewayError> {
    let obj = value
        .as_object()
        .ok_or_else(|| GatewayError::BadRequest("check must be an object".to_string()))?;
    let method = obj.get("method").and_then(Value::as_str).unwrap_or("");
    let path = obj.get("path").and_then(Value::as_str).unwrap_or("");
    let interval = obj
        .get("interval")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_PROBE_INTERVAL);
    let timeout = obj
        .get("timeout")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_PROBE_TIMEOUT);
    Ok(HealthCheck::new(method, path, interval, timeout))
}

const SIGN_USAGE: &str = r#"// mgw.addr: this gateway's address
// microservice.ip: your backend's address
POST http://{mgw.addr}/mgw/sign

// check: health check (optional)
//   method: get | post | options | ... any request method
//   path: /check
//   interval: seconds between probes
//   timeout: seconds before a probe fails
// route patterns support a trailing *
Payload:
{
  "check": {
    "method": "get",
    "path": "/check",
    "interval": 30,
    "timeout": 50
  },
  "http://microservice.ip:40000": [
    "/api/users/auth",
    "/api/users/department",
    "/api/users/department/*",
    "/api/users/dept/us/*"
  ]
}
"#;

// ---- delete ----

#[derive(Debug, PartialEq)]
enum DeleteTarget {
    Pattern(String),
    Host(String),
}

/// Picks the deletion target out of the query string; `api` wins when both
/// parameters are present.
fn delete_target(query: &str) -> Option<DeleteTarget> {
    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if let Some((_, v)) = pairs.iter().find(|(k, _)| k == "api") {
        return Some(DeleteTarget::Pattern(v.clone()));
    }
    if let Some((_, v)) = pairs.iter().find(|(k, _)| k == "host") {
        return Some(DeleteTarget::Host(v.clone()));
    }
    None
}

async fn delete(table: &Arc<RouteTable>, store: &ApiStore, session: &mut Session) -> Result<()> {
    let query = session.req_header().uri.query().unwrap_or("").to_string();
    match delete_target(&query) {
        Some(DeleteTarget::Pattern(pattern)) => {
            let existed = table.delete(&pattern);
            info!(pattern = %pattern, existed, "route deleted");
            if let Err(err) = store.save(table) {
                warn!(error = %err, "persist after delete failed");
            }
        }
        Some(DeleteTarget::Host(server)) => {
            let removed = table.delete_host(&server);
            info!(server = %server, removed, "host deleted");
            if let Err(err) = store.save(table) {
                warn!(error = %err, "persist after delete failed");
            }
        }
        None => {}
    }
    respond_redirect(session, ADMIN_PREFIX).await
}

// ---- inspector ----

/// Renders the HTML inspector: every pattern with its hosts and delete
/// links.
pub(crate) fn render_inspector(table: &RouteTable) -> String {
    let mut rows = String::new();
    table.range(|pattern, group| {
        rows.push_str(&format!(
            "    <div class=\"box\">\n        <div>{} <a href=\"/mgw/delete?api={}\">Del</a></div>\n        <table>\n",
            html_escape(pattern),
            url_encode(pattern),
        ));
        for host in group.hosts() {
            rows.push_str(&format!(
                "            <tr><td>{}</td><td>{}</td><td>{}</td><td><a href=\"/mgw/delete?host={}\">Del</a></td></tr>\n",
                html_escape(&host.name),
                html_escape(&host.server),
                host.available,
                url_encode(&host.server),
            ));
        }
        rows.push_str("        </table>\n    </div>\n");
        true
    });

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>mgw info</title>
    <style>
        .box {{
            margin-left: 24pt;
            padding: 20pt 0 0 24pt;
        }}
        table {{
            width: 100%;
        }}
        td {{
            border-bottom: 1pt solid #ebeef5;
        }}
    </style>
</head>
<body>
{rows}</body>
</html>
"#
    )
}

fn html_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn url_encode(text: &str) -> String {
    url::form_urlencoded::byte_serialize(text.as_bytes()).collect()
}
