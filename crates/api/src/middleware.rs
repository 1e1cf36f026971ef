use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use conveyor_core::config::env_var;

use crate::app::errors::json_error;
use crate::context::{Session, UserContext};

/// Looks up the session behind a bearer token.
#[async_trait]
pub trait SessionResolver: Send + Sync {
    /// `None` when the token is unknown or expired.
    async fn resolve(&self, token: &str) -> Option<Session>;
}

/// Fixed token table, e.g. `SESSION_TOKENS="t1=alice,t2=bob,anon="`.
///
/// A token with an empty user maps to a session without a user.
#[derive(Debug, Clone, Default)]
pub struct StaticSessions {
    tokens: HashMap<String, Session>,
}

impl StaticSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        env_var("SESSION_TOKENS")
            .map(|raw| Self::parse(&raw))
            .unwrap_or_default()
    }

    pub fn parse(raw: &str) -> Self {
        let tokens = raw
            .split(',')
            .filter_map(|pair| {
                let (token, user) = pair.split_once('=')?;
                let token = token.trim();
                (!token.is_empty())
                    .then(|| (token.to_string(), Session::new(Some(user.trim().to_string()))))
            })
            .collect();
        Self { tokens }
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: Option<&str>) -> Self {
        self.tokens
            .insert(token.into(), Session::new(user_id.map(str::to_string)));
        self
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl SessionResolver for StaticSessions {
    async fn resolve(&self, token: &str) -> Option<Session> {
        self.tokens.get(token).cloned()
    }
}

#[derive(Clone)]
pub struct AuthState {
    pub sessions: Arc<dyn SessionResolver>,
}

pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, Response> {
    let unauthorized = |msg: &str| json_error(StatusCode::UNAUTHORIZED, msg);

    let token = extract_bearer(req.headers()).map_err(|_| unauthorized("Missing credentials."))?;
    let session = state
        .sessions
        .resolve(token)
        .await
        .ok_or_else(|| unauthorized("Invalid or expired session."))?;

    let user_id = session
        .user_id()
        .ok_or_else(|| json_error(StatusCode::FORBIDDEN, "User ID not found in session."))?;

    req.extensions_mut().insert(UserContext::new(user_id));
    Ok(next.run(req).await)
}

fn extract_bearer(headers: &HeaderMap) -> Result<&str, StatusCode> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let header = header.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;

    let header = header
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token = header.trim();
    if token.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(token)
}
