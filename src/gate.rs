//! Per-request authorization. Every inbound request passes through
//! [`authorize`] before any content is produced; the precedence of its
//! branches is load-bearing and mirrors the admin-lockdown semantics:
//! robots exemption, session resolution, login redirect, re-login redirect,
//! lockdown force-logout, then the static-asset prefix rewrite.

use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use std::convert::Infallible;
use std::net::SocketAddr;

use crate::state::AppState;

/// Session cookie: value is the opaque session token.
pub const SESSION_COOKIE: &str = "login-id";

/// Short-lived cookie remembering the path requested before the login
/// redirect, consumed by the login flow.
pub const REDIRECT_COOKIE: &str = "login-redirect";

const ROBOTS_PATH: &str = "/robots.txt";
const LOGIN_PATH: &str = "/login";
const RESOURCES_PREFIX: &str = "/resources/";

/// Username resolved by the gate, attached to authorized requests.
#[derive(Debug, Clone)]
pub struct AuthUser(pub String);

/// Extractor for handlers that serve both logged-in and anonymous callers
/// (the robots and login paths never carry an [`AuthUser`]).
pub struct MaybeUser(pub Option<String>);

impl<S: Send + Sync> FromRequestParts<S> for MaybeUser {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Infallible> {
        Ok(MaybeUser(
            parts.extensions.get::<AuthUser>().map(|user| user.0.clone()),
        ))
    }
}

/// Extractor for the client address, honoring `X-Forwarded-For`.
pub struct ClientIp(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Infallible> {
        let addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr);
        Ok(ClientIp(client_ip(&parts.headers, addr)))
    }
}

pub async fn authorize(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();

    if path == ROBOTS_PATH {
        return next.run(req).await;
    }

    let token = cookie_value(req.headers(), SESSION_COOKIE);
    let username = token.as_deref().and_then(|token| state.sessions.name_for(token));

    let Some(username) = username else {
        if path != LOGIN_PATH {
            tracing::debug!("No valid session when accessing {}", path);
            return remember_and_redirect(&path);
        }
        return next.run(req).await;
    };

    if path == LOGIN_PATH {
        return Redirect::to("/").into_response();
    }

    if state.users.is_admin_only() && !state.users.is_admin(&username) {
        tracing::info!("Admin-only mode: forcing logout of {}", username);
        if let Some(token) = &token {
            state.sessions.invalidate(token);
        }
        return force_logout();
    }

    // Static assets live at the stripped URL; this rewrite is a plain
    // pass-through that runs only for requests the gate already allowed.
    if let Some(rest) = path.strip_prefix(RESOURCES_PREFIX) {
        return Redirect::to(&format!("/{}", rest)).into_response();
    }

    req.extensions_mut().insert(AuthUser(username));
    next.run(req).await
}

// ── Responses ────────────────────────────────────────────────────────────────

/// Remember the requested path, then send the caller to the login page.
fn remember_and_redirect(path: &str) -> Response {
    let cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age=300",
        REDIRECT_COOKIE,
        utf8_percent_encode(path, NON_ALPHANUMERIC)
    );
    (
        StatusCode::SEE_OTHER,
        [
            (header::SET_COOKIE, cookie),
            (header::LOCATION, LOGIN_PATH.to_string()),
        ],
    )
        .into_response()
}

fn force_logout() -> Response {
    (
        StatusCode::SEE_OTHER,
        [
            (header::SET_COOKIE, clear_session_cookie()),
            (header::LOCATION, LOGIN_PATH.to_string()),
        ],
    )
        .into_response()
}

/// `Set-Cookie` value establishing a session.
pub fn session_cookie(token: &str, max_age_secs: u64) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        SESSION_COOKIE, token, max_age_secs
    )
}

/// `Set-Cookie` value dropping the session cookie.
pub fn clear_session_cookie() -> String {
    format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", SESSION_COOKIE)
}

/// `Set-Cookie` value dropping the remembered-path cookie.
pub fn clear_redirect_cookie() -> String {
    format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", REDIRECT_COOKIE)
}

// ── Request helpers ──────────────────────────────────────────────────────────

pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    for part in cookies.split(';') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix(&format!("{}=", name)) {
            return Some(value.to_string());
        }
    }
    None
}

/// The remembered pre-login path, percent-decoded. Only absolute local paths
/// are accepted, so the cookie cannot redirect off-site.
pub fn remembered_path(headers: &HeaderMap) -> Option<String> {
    let raw = cookie_value(headers, REDIRECT_COOKIE)?;
    let decoded = percent_decode_str(&raw).decode_utf8().ok()?.into_owned();
    if decoded.starts_with('/') && !decoded.starts_with("//") {
        Some(decoded)
    } else {
        None
    }
}

/// Client address, honoring `X-Forwarded-For` set by a reverse proxy.
pub fn client_ip(headers: &HeaderMap, addr: Option<&SocketAddr>) -> String {
    headers
        .get("X-Forwarded-For")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(',').next().unwrap_or(value).trim().to_string())
        .unwrap_or_else(|| match addr {
            Some(addr) => addr.ip().to_string(),
            None => "IP-UNKNOWN".to_string(),
        })
}
