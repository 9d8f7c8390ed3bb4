use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{info, warn};

use cinch_core::model::{Worker, WorkerStatus};

use crate::forge::StatusState;
use crate::session::{read_deadline, ClientMessage, ServerMessage, WorkerSession};
use crate::status_reconciler::StatusTask;

use super::auth::{authenticate_raw, bearer_from_header};
use super::AppState;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub async fn handle_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    // The bearer token can arrive via the Authorization header or a `token`
    // query parameter; either form is accepted for this endpoint. Auth
    // itself happens after the upgrade so a failure can be reported as a
    // wire AUTH_FAIL message instead of an HTTP status a WebSocket client
    // can't see.
    let raw_token = bearer_from_header(&headers).map(str::to_string).or(query.token);
    ws.on_upgrade(move |socket| handle_socket(socket, state, raw_token))
}

async fn send_auth_fail(socket: &mut WebSocket, error: &str) {
    let msg = ServerMessage::AuthFail { error: error.to_string() };
    let _ = socket
        .send(Message::Text(serde_json::to_string(&msg).unwrap_or_default()))
        .await;
    let _ = socket.close().await;
}

async fn handle_socket(mut socket: WebSocket, state: AppState, raw_token: Option<String>) {
    let Some(raw_token) = raw_token else {
        send_auth_fail(&mut socket, "missing bearer token").await;
        return;
    };
    let Some(token) = authenticate_raw(&state, &raw_token).await else {
        send_auth_fail(&mut socket, "invalid or revoked token").await;
        return;
    };
    // Worker tokens are minted against a specific worker id; an operator
    // token with no worker_id can't open a worker session.
    let Some(worker_id) = token.worker_id else {
        send_auth_fail(&mut socket, "token is not a worker token").await;
        return;
    };

    let ack = ServerMessage::AuthOk {
        worker_id,
        server_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    if socket
        .send(Message::Text(serde_json::to_string(&ack).unwrap_or_default()))
        .await
        .is_err()
    {
        return;
    }

    // First frame after AUTH_OK must be REGISTER; anything else is a
    // protocol violation.
    let register = match socket.recv().await {
        Some(Ok(Message::Text(text))) => serde_json::from_str::<ClientMessage>(&text),
        _ => {
            let _ = socket.close().await;
            return;
        }
    };

    let ClientMessage::Register {
        labels,
        mode,
        concurrency,
        owner_id,
        hostname,
        ..
    } = (match register {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, "malformed register frame");
            let _ = socket.close().await;
            return;
        }
    }) else {
        let _ = socket.close().await;
        return;
    };

    let worker = Worker {
        id: worker_id,
        display_name: hostname,
        labels: labels.clone(),
        status: WorkerStatus::Online,
        last_seen_at: chrono::Utc::now(),
        owner_identity: owner_id.clone(),
        mode,
        concurrency,
    };
    let worker = match state.storage.upsert_worker(worker).await {
        Ok(w) => w,
        Err(e) => {
            warn!(error = %e, "failed to register worker");
            let _ = socket.close().await;
            return;
        }
    };

    let session = WorkerSession::new(worker.id, labels, mode, owner_id, concurrency);
    let handle = session.handle();
    state.hub.register(handle.clone());

    let registered = ServerMessage::Registered { worker_id: worker.id };
    if socket
        .send(Message::Text(serde_json::to_string(&registered).unwrap_or_default()))
        .await
        .is_err()
    {
        state.hub.unregister(&handle);
        return;
    }
    info!(worker_id = %worker.id, "worker connected");

    let (mut write, mut read) = socket.split();
    let mut session = session;

    let writer_state = state.clone();
    let writer_handle = handle.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(step) = session.next_outbound().await {
            match step {
                crate::session::OutboundStep::Send(msg) => {
                    let Ok(text) = serde_json::to_string(&msg) else { continue };
                    if write.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                crate::session::OutboundStep::Close(reason) => {
                    info!(worker_id = %writer_handle.worker_id, %reason, "closing worker session");
                    let _ = write.close().await;
                    break;
                }
            }
        }
        let _ = writer_state;
    });

    loop {
        let next = tokio::time::timeout(read_deadline(), read.next()).await;
        let frame = match next {
            Ok(Some(Ok(Message::Text(text)))) => text,
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Err(_) => break,
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) => break,
        };

        let msg: ClientMessage = match serde_json::from_str(&frame) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "malformed client frame");
                continue;
            }
        };

        if let Err(e) = handle_client_message(&state, &handle, msg).await {
            warn!(error = %e, "error handling worker message");
        }
    }

    state.hub.unregister(&handle);
    let _ = state.storage.set_worker_status(worker.id, WorkerStatus::Offline).await;
    writer_task.abort();
}


async fn handle_client_message(
    state: &AppState,
    handle: &crate::session::SessionHandle,
    msg: ClientMessage,
) -> cinch_core::error::Result<()> {
    match msg {
        ClientMessage::JobAck { .. } => Ok(()),
        ClientMessage::JobReject { job_id, reason } => {
            warn!(%job_id, %reason, "worker rejected job");
            handle.release_job(job_id);
            state
                .storage
                .update_job_status(job_id, cinch_core::model::JobStatus::Queued, None)
                .await?;
            state.dispatcher.notify();
            Ok(())
        }
        ClientMessage::JobStarted { job_id, .. } => {
            state
                .storage
                .update_job_status(job_id, cinch_core::model::JobStatus::Running, None)
                .await?;
            report_status(state, job_id, StatusState::Running, "job started").await
        }
        ClientMessage::LogChunk { job_id, stream, data, .. } => {
            let tagged = match stream {
                crate::session::LogStreamTag::Stdout => crate::logstore::LogStream::Stdout,
                crate::session::LogStreamTag::Stderr => crate::logstore::LogStream::Stderr,
            };
            let bytes = bytes::Bytes::from(data.into_bytes());
            state.storage.add_job_log_bytes(job_id, bytes.len() as i64).await?;
            state.log_mux.ingest(job_id, tagged, bytes).await
        }
        ClientMessage::JobComplete { job_id, exit_code, .. } => {
            handle.release_job(job_id);
            let status = if exit_code == 0 {
                cinch_core::model::JobStatus::Success
            } else {
                cinch_core::model::JobStatus::Failed
            };
            state.storage.update_job_status(job_id, status, Some(exit_code)).await?;
            state.log_mux.finalize(job_id).await?;
            let state_label = if exit_code == 0 { StatusState::Success } else { StatusState::Failure };
            report_status(state, job_id, state_label, "job finished").await
        }
        ClientMessage::JobError { job_id, error, phase } => {
            handle.release_job(job_id);
            state
                .storage
                .update_job_status(job_id, cinch_core::model::JobStatus::Error, None)
                .await?;
            state.log_mux.finalize(job_id).await?;
            warn!(%job_id, %error, ?phase, "job errored");
            report_status(state, job_id, StatusState::Error, &error).await
        }
        ClientMessage::Ping { .. } => {
            handle.send(ServerMessage::Pong {
                timestamp: chrono::Utc::now().timestamp_millis(),
            });
            Ok(())
        }
        ClientMessage::Register { .. } => Ok(()),
    }
}

async fn report_status(
    state: &AppState,
    job_id: uuid::Uuid,
    job_state: StatusState,
    description: &str,
) -> cinch_core::error::Result<()> {
    let Some(job) = state.storage.get_job(job_id).await? else {
        return Ok(());
    };
    let Some(repo) = state.storage.get_repo(job.repo_id).await? else {
        return Ok(());
    };
    state
        .status_reconciler
        .enqueue(StatusTask {
            repo,
            commit_sha: job.commit_sha,
            state: job_state,
            context: "cinch".to_string(),
            description: description.to_string(),
            target_url: format!("{}/jobs/{}", state.config.server.base_url, job_id),
        })
        .await;
    Ok(())
}
