use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cinch_core::crypto::hash_token;
use cinch_core::model::Token;

use super::AppState;

#[derive(Deserialize)]
pub struct CreateTokenRequest {
    pub display_name: String,
    /// Ties the token to a specific worker; absent for an operator token.
    pub worker_id: Option<Uuid>,
}

#[derive(Serialize)]
pub struct CreateTokenResponse {
    pub id: Uuid,
    /// The raw bearer value. Returned exactly once; only its hash is stored.
    pub token: String,
}

/// Mints a new bearer token and returns its raw value once. A worker cannot
/// open its WebSocket session until it holds a token with `worker_id` set.
pub async fn create_token(
    State(state): State<AppState>,
    Json(body): Json<CreateTokenRequest>,
) -> impl IntoResponse {
    let raw = generate_raw_token();
    let token = Token {
        id: Uuid::new_v4(),
        token_hash: hash_token(&raw),
        display_name: body.display_name,
        worker_id: body.worker_id,
        created_at: chrono::Utc::now(),
        revoked_at: None,
    };
    match state.storage.create_token(token).await {
        Ok(created) => Json(CreateTokenResponse {
            id: created.id,
            token: raw,
        })
        .into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

pub async fn revoke_token(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<Uuid>,
) -> impl IntoResponse {
    match state.storage.revoke_token(id).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn generate_raw_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("cin_{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_unique_and_prefixed() {
        let a = generate_raw_token();
        let b = generate_raw_token();
        assert_ne!(a, b);
        assert!(a.starts_with("cin_"));
    }
}
