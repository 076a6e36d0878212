//! Bearer-token authentication for the node API.
//!
//! Mutating routes and the access ledger require `Authorization: Bearer
//! <token>` matching `NODE_API_TOKEN`. With no token configured every guarded
//! route is refused. `NODE_API_AUDITORS` optionally narrows which auditor
//! identities may appear in rotation messages.

use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::request::Parts;
use subtle::ConstantTimeEq;

use crate::node_api::NodeApiState;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeApiAuth {
    pub token: Option<String>,
    /// Empty means any auditor presenting the token is accepted.
    pub auditors: Vec<String>,
}

impl NodeApiAuth {
    pub fn from_env() -> Self {
        Self {
            token: std::env::var("NODE_API_TOKEN")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            auditors: std::env::var("NODE_API_AUDITORS")
                .map(|v| parse_auditors(&v))
                .unwrap_or_default(),
        }
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            auditors: Vec::new(),
        }
    }

    pub fn accepts_token(&self, presented: &str) -> bool {
        self.token
            .as_deref()
            .is_some_and(|expected| bool::from(expected.as_bytes().ct_eq(presented.as_bytes())))
    }

    pub fn allows_auditor(&self, auditor: &str) -> bool {
        self.auditors.is_empty() || self.auditors.iter().any(|a| a == auditor)
    }
}

fn parse_auditors(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(String::from)
        .collect()
}

/// Extract a Bearer token from an Authorization header value.
pub fn extract_bearer_token(auth_header: &str) -> Option<&str> {
    auth_header
        .strip_prefix("Bearer ")
        .or_else(|| auth_header.strip_prefix("bearer "))
        .map(|t| t.trim())
}

/// Axum extractor guarding a route behind the node API token.
///
/// ```ignore
/// async fn handler(_auth: NodeAuth, State(state): State<NodeApiState>) { ... }
/// ```
pub struct NodeAuth;

impl FromRequestParts<NodeApiState> for NodeAuth {
    type Rejection = (StatusCode, String);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &NodeApiState,
    ) -> std::result::Result<Self, Self::Rejection> {
        if state.auth.token.is_none() {
            return Err((
                StatusCode::UNAUTHORIZED,
                "Node API token is not configured".to_string(),
            ));
        }

        let auth_header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                (
                    StatusCode::UNAUTHORIZED,
                    "Missing Authorization header".to_string(),
                )
            })?;

        let token = extract_bearer_token(auth_header).ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                "Invalid Authorization header format".to_string(),
            )
        })?;

        if !state.auth.accepts_token(token) {
            return Err((StatusCode::UNAUTHORIZED, "Invalid token".to_string()));
        }
        Ok(NodeAuth)
    }
}
