use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;

use cinch_core::crypto::hash_token;
use cinch_core::model::Token;

use super::AppState;

/// Extracts the bearer token from the `Authorization` header, if present.
pub fn bearer_from_header(headers: &axum::http::HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Resolves a raw bearer token to a non-revoked `Token` row by its one-way
/// hash. Never compares or logs the raw token value.
pub async fn authenticate_raw(state: &AppState, raw: &str) -> Option<Token> {
    let token_hash = hash_token(raw);
    let token = state.storage.get_token_by_hash(&token_hash).await.ok().flatten()?;
    if !token.is_valid() {
        return None;
    }
    Some(token)
}

/// Resolves the bearer token in `Authorization` to a non-revoked `Token`
/// row. Never compares or logs the raw token value.
pub async fn authenticate(state: &AppState, headers: &axum::http::HeaderMap) -> Option<Token> {
    authenticate_raw(state, bearer_from_header(headers)?).await
}

/// Middleware guarding the worker-facing and operator HTTP API: rejects any
/// request without a valid, non-revoked bearer token.
pub async fn require_token(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = authenticate(&state, req.headers()).await.ok_or(StatusCode::UNAUTHORIZED)?;
    let mut req = req;
    req.extensions_mut().insert(token);
    Ok(next.run(req).await)
}
