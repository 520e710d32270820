//! Session-validation endpoint
//!
//! `GET /api/v1/auth/session/validate` is called out-of-band by Newts gating
//! SSO resources. Every invalid input answers `200 {valid: false}` so the
//! agent can tell "validated as unauthenticated" apart from transport
//! failure; only true internal faults produce a 500.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};

use crate::authproxy::SESSION_COOKIE_NAME;
use crate::error::Result;
use crate::state::AppState;

/// Response body of the validation endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

impl ValidateResponse {
    fn invalid() -> Self {
        Self {
            valid: false,
            user_id: None,
            email: None,
            expires_at: None,
        }
    }
}

/// `GET /api/v1/auth/session/validate`
pub async fn validate_session(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let token = match session_token(&headers) {
        Some(token) => token,
        None => return (StatusCode::OK, Json(ValidateResponse::invalid())).into_response(),
    };

    match lookup(&state, &token).await {
        Ok(Some(response)) => (StatusCode::OK, Json(response)).into_response(),
        Ok(None) => (StatusCode::OK, Json(ValidateResponse::invalid())).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "session validation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ValidateResponse::invalid()),
            )
                .into_response()
        }
    }
}

async fn lookup(state: &AppState, token: &str) -> Result<Option<ValidateResponse>> {
    let Some(session) = state.store.session_by_token(token).await? else {
        return Ok(None);
    };
    let Some(user) = state.store.user(&session.user_id).await? else {
        return Ok(None);
    };
    Ok(Some(ValidateResponse {
        valid: true,
        user_id: Some(user.user_id),
        email: Some(user.email),
        expires_at: Some(
            session
                .expires_at
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        ),
    }))
}

/// Token from the session cookie, falling back to a bearer header.
fn session_token(headers: &HeaderMap) -> Option<String> {
    cookie_value(headers, SESSION_COOKIE_NAME).or_else(|| bearer_token(headers))
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for value in headers.get_all(header::COOKIE) {
        let Ok(raw) = value.to_str() else {
            continue;
        };
        for pair in raw.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            if parts.next() == Some(name) {
                if let Some(token) = parts.next() {
                    if !token.is_empty() {
                        return Some(token.to_string());
                    }
                }
            }
        }
    }
    None
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}
