//! The worker session protocol (one session per connected worker).
//!
//! The transport is a framed, message-oriented bidirectional channel; this
//! module doesn't care what carries the frames (the HTTP layer wires it to
//! a WebSocket). Each frame is one JSON object `{"type": <tag>, "payload":
//! <object>}`. The session's send and receive paths are two cooperating
//! tasks connected by a bounded outbound queue: the receive task owns the
//! session's lifecycle and signals the send task to stop via a `Close`
//! marker on that queue.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cinch_core::model::WorkerMode;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

pub const PING_INTERVAL_SECS: u64 = 30;
pub const OFFLINE_AFTER_SECS: u64 = 60;

/// Messages the worker sends to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Register {
        labels: Vec<String>,
        capabilities: Capabilities,
        version: String,
        hostname: String,
        concurrency: i32,
        mode: WorkerMode,
        owner_id: String,
        owner_name: String,
    },
    JobAck {
        job_id: Uuid,
    },
    JobReject {
        job_id: Uuid,
        reason: String,
    },
    JobStarted {
        job_id: Uuid,
        timestamp: i64,
    },
    LogChunk {
        job_id: Uuid,
        ts: i64,
        stream: LogStreamTag,
        data: String,
    },
    JobComplete {
        job_id: Uuid,
        exit_code: i32,
        duration_ms: u64,
    },
    JobError {
        job_id: Uuid,
        error: String,
        phase: JobErrorPhase,
    },
    Ping {
        timestamp: i64,
        active_jobs: Vec<Uuid>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStreamTag {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorPhase {
    Clone,
    Setup,
    Execute,
    Cleanup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub docker: bool,
}

/// Messages the server sends to the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthOk {
        worker_id: Uuid,
        server_version: String,
    },
    AuthFail {
        error: String,
    },
    Registered {
        worker_id: Uuid,
    },
    JobAssign {
        job_id: Uuid,
        repo: JobAssignRepo,
        config: JobAssignConfig,
    },
    JobCancel {
        job_id: Uuid,
        reason: String,
    },
    Pong {
        timestamp: i64,
    },
    GracefulShutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAssignRepo {
    pub clone_url: String,
    pub clone_token: Option<String>,
    pub commit: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub branch: Option<String>,
    pub tag: Option<String>,
    pub forge_type: String,
    pub is_pr: bool,
    pub pr_number: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAssignConfig {
    pub command: String,
    pub timeout_secs: u64,
    pub env: std::collections::HashMap<String, String>,
}

/// Session lifecycle state, per the state machine:
/// `connecting -> authenticated -> ready -> (ready | draining) -> closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Ready,
    Draining,
    Closed,
}

enum OutboundItem {
    Message(ServerMessage),
    Close(String),
}

/// A cheap, cloneable reference to a live session, held by the Hub and the
/// Dispatcher. Sending through it never blocks the caller on the session's
/// own I/O beyond the bounded outbound queue.
#[derive(Clone)]
pub struct SessionHandle {
    /// Distinguishes this connection instance from a prior one for the same
    /// worker id, so a superseded session's teardown can't evict its
    /// successor from the Hub.
    pub id: Uuid,
    pub worker_id: Uuid,
    pub labels: Vec<String>,
    pub mode: WorkerMode,
    pub owner_identity: String,
    concurrency: i32,
    /// Count of acknowledged, not-yet-terminal jobs. Only the session's own
    /// reader task increments/decrements this; other components only read
    /// it via `is_available`.
    in_flight_count: Arc<AtomicI64>,
    in_flight_ids: Arc<Mutex<HashSet<Uuid>>>,
    last_assigned_millis: Arc<AtomicI64>,
    outbound: mpsc::Sender<OutboundItem>,
    state: Arc<Mutex<SessionState>>,
}

impl SessionHandle {
    pub fn is_available(&self) -> bool {
        let state = *self.state.lock().unwrap();
        state == SessionState::Ready
            && (self.in_flight_count.load(Ordering::SeqCst) as i32) < self.concurrency
    }

    pub fn is_closed(&self) -> bool {
        *self.state.lock().unwrap() == SessionState::Closed
    }

    pub fn last_assigned_at(&self) -> i64 {
        self.last_assigned_millis.load(Ordering::SeqCst)
    }

    pub fn in_flight_job_ids(&self) -> HashSet<Uuid> {
        self.in_flight_ids.lock().unwrap().clone()
    }

    pub fn in_flight_count(&self) -> i64 {
        self.in_flight_count.load(Ordering::SeqCst)
    }

    /// Sends a `JOB_ASSIGN` and records the assignment for round-robin /
    /// least-recently-assigned ordering and capacity tracking. The caller
    /// (Dispatcher) must not hold any lock across this call.
    pub fn assign_job(&self, job_id: Uuid, msg: ServerMessage) -> Result<(), crate::dispatcher::SendFailed> {
        self.in_flight_ids.lock().unwrap().insert(job_id);
        self.in_flight_count.fetch_add(1, Ordering::SeqCst);
        self.last_assigned_millis
            .store(chrono::Utc::now().timestamp_millis(), Ordering::SeqCst);
        self.outbound
            .try_send(OutboundItem::Message(msg))
            .map_err(|_| crate::dispatcher::SendFailed)
    }

    /// Releases the in-flight slot for a job that reached a terminal state
    /// (ack'd then completed/errored) or was rejected before being counted.
    pub fn release_job(&self, job_id: Uuid) {
        if self.in_flight_ids.lock().unwrap().remove(&job_id) {
            self.in_flight_count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub fn send(&self, msg: ServerMessage) {
        let _ = self.outbound.try_send(OutboundItem::Message(msg));
    }

    pub fn close(&self, reason: &str) {
        *self.state.lock().unwrap() = SessionState::Closed;
        let _ = self.outbound.try_send(OutboundItem::Close(reason.to_string()));
    }
}

/// Owns the two cooperating I/O tasks for one connected worker. Constructed
/// by the HTTP layer after a successful token auth; `handle()` is what gets
/// registered into the Hub.
pub struct WorkerSession {
    handle: SessionHandle,
    outbound_rx: mpsc::Receiver<OutboundItem>,
}

impl WorkerSession {
    pub fn new(worker_id: Uuid, labels: Vec<String>, mode: WorkerMode, owner_identity: String, concurrency: i32) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let handle = SessionHandle {
            id: Uuid::new_v4(),
            worker_id,
            labels,
            mode,
            owner_identity,
            concurrency,
            in_flight_count: Arc::new(AtomicI64::new(0)),
            in_flight_ids: Arc::new(Mutex::new(HashSet::new())),
            last_assigned_millis: Arc::new(AtomicI64::new(0)),
            outbound: tx,
            state: Arc::new(Mutex::new(SessionState::Ready)),
        };
        Self {
            handle,
            outbound_rx: rx,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Drains the outbound queue, yielding each message to send over the
    /// transport until a `Close` marker arrives; the caller's write loop
    /// should stop after that.
    pub async fn next_outbound(&mut self) -> Option<OutboundStep> {
        match self.outbound_rx.recv().await {
            Some(OutboundItem::Message(msg)) => Some(OutboundStep::Send(msg)),
            Some(OutboundItem::Close(reason)) => Some(OutboundStep::Close(reason)),
            None => None,
        }
    }
}

pub enum OutboundStep {
    Send(ServerMessage),
    Close(String),
}

/// The read-deadline a reader task should apply: twice the heartbeat
/// interval, per the concurrency/resource model.
pub fn read_deadline() -> Duration {
    Duration::from_secs(PING_INTERVAL_SECS * 2)
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// Builds a `SessionHandle` for Hub unit tests. The session's own
    /// outbound receiver is leaked (nobody drains it); callers only need
    /// the handle, and `is_closed()` reflects state synchronously since
    /// `close` sets it directly rather than through the channel.
    pub fn fake_session(worker_id: Uuid, labels: &[&str]) -> SessionHandle {
        let session = WorkerSession::new(
            worker_id,
            labels.iter().map(|s| s.to_string()).collect(),
            WorkerMode::Shared,
            "owner@example.com".to_string(),
            4,
        );
        let handle = session.handle();
        std::mem::forget(session);
        handle
    }
}
