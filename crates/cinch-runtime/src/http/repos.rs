use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cinch_core::model::{ForgeType, Repo};

use super::AppState;

/// Public view of a `Repo`: secrets never leave the process.
#[derive(Serialize)]
struct RepoSummary {
    id: Uuid,
    forge_type: ForgeType,
    owner: String,
    name: String,
    clone_url: String,
    private: bool,
}

impl From<Repo> for RepoSummary {
    fn from(repo: Repo) -> Self {
        Self {
            id: repo.id,
            forge_type: repo.forge_type,
            owner: repo.owner,
            name: repo.name,
            clone_url: repo.clone_url,
            private: repo.private,
        }
    }
}

#[derive(Deserialize)]
pub struct ListReposQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    100
}

pub async fn list_repos(State(state): State<AppState>, Query(query): Query<ListReposQuery>) -> impl IntoResponse {
    match state.storage.list_repos(query.limit).await {
        Ok(repos) => Json(repos.into_iter().map(RepoSummary::from).collect::<Vec<_>>()).into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

pub async fn get_repo(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.storage.get_repo(id).await {
        Ok(Some(repo)) => Json(RepoSummary::from(repo)).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[derive(Deserialize)]
pub struct UpdateSecretsRequest {
    pub webhook_secret: Option<String>,
    pub forge_token: Option<String>,
    pub env_secrets: Option<std::collections::HashMap<String, String>>,
}

/// Re-encrypts and replaces a repo's secret fields. Fields omitted from the
/// request keep their current encrypted value.
pub async fn update_repo_secrets(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateSecretsRequest>,
) -> impl IntoResponse {
    let mut repo = match state.storage.get_repo(id).await {
        Ok(Some(repo)) => repo,
        Ok(None) => return StatusCode::NOT_FOUND,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR,
    };

    if let Some(secret) = body.webhook_secret {
        repo.webhook_secret = match state.cipher.encrypt(&secret) {
            Ok(enc) => enc,
            Err(_) => return StatusCode::INTERNAL_SERVER_ERROR,
        };
    }
    if let Some(token) = body.forge_token {
        repo.forge_token = match state.cipher.encrypt(&token) {
            Ok(enc) => enc,
            Err(_) => return StatusCode::INTERNAL_SERVER_ERROR,
        };
    }
    if let Some(env_secrets) = body.env_secrets {
        let mut encrypted = std::collections::HashMap::with_capacity(env_secrets.len());
        for (key, value) in env_secrets {
            let enc = match state.cipher.encrypt(&value) {
                Ok(enc) => enc,
                Err(_) => return StatusCode::INTERNAL_SERVER_ERROR,
            };
            encrypted.insert(key, enc);
        }
        repo.env_secrets = encrypted;
    }

    match state.storage.update_repo_secrets(&repo).await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
