//! Session tracking with capacity enforcement and idle cleanup.
//!
//! A session is one client connection. It owns at most one child process at a
//! time; while one is bound, the session holds its pid/pgid, a cancel handle,
//! and the streaming task. All map access goes through a single async mutex
//! with short critical sections; callers never hold a session reference
//! across an await.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

/// Lifecycle state of a session's current execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No active execution.
    Idle,
    /// Pre-execution hooks running.
    PreHook,
    /// Child process started, streaming active.
    Running,
    /// Child process stopped by SIGSTOP.
    Paused,
    /// Cancel/timeout/exit in progress; readers draining.
    Terminating,
    /// Post-execution hooks running.
    PostHook,
    /// Session removed.
    Closed,
}

/// One tracked session.
#[derive(Debug)]
pub struct Session {
    pub session_id: String,
    /// Single-writer outbound queue toward the client transport.
    pub outbound: mpsc::Sender<Value>,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub state: SessionState,
    /// Pid of the bound child process, if any.
    pub pid: Option<u32>,
    /// Process group of the bound child process, if any.
    pub pgid: Option<i32>,
    /// Cancel signal for the streaming task.
    pub cancel: Option<watch::Sender<bool>>,
    /// Handle to the streaming task.
    pub stream_task: Option<JoinHandle<()>>,
}

/// Summary of one session for observability snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub state: SessionState,
    pub age_seconds: f64,
    pub idle_seconds: f64,
    pub pid: Option<u32>,
}

/// Thread-safe registry of sessions with a capacity limit.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
    max_sessions: usize,
}

impl SessionManager {
    #[must_use]
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            max_sessions,
        }
    }

    /// Create a session if capacity remains. Returns false at the limit.
    pub async fn create(&self, session_id: &str, outbound: mpsc::Sender<Value>) -> bool {
        let mut sessions = self.sessions.lock().await;
        if sessions.len() >= self.max_sessions {
            tracing::warn!(
                active = sessions.len(),
                max = self.max_sessions,
                "session limit reached"
            );
            return false;
        }

        let now = Instant::now();
        sessions.insert(
            session_id.to_string(),
            Session {
                session_id: session_id.to_string(),
                outbound,
                created_at: now,
                last_activity: now,
                state: SessionState::Idle,
                pid: None,
                pgid: None,
                cancel: None,
                stream_task: None,
            },
        );
        tracing::info!(
            session = session_id,
            active = sessions.len(),
            max = self.max_sessions,
            "session created"
        );
        true
    }

    /// Bump a session's last-activity timestamp.
    pub async fn touch(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.last_activity = Instant::now();
        }
    }

    /// Current state of a session, touching last_activity.
    pub async fn state(&self, session_id: &str) -> Option<SessionState> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(session_id)?;
        session.last_activity = Instant::now();
        Some(session.state)
    }

    /// Transition a session to a new state. Returns false if it is gone.
    pub async fn set_state(&self, session_id: &str, state: SessionState) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(session_id) {
            Some(session) => {
                tracing::debug!(session = session_id, from = ?session.state, to = ?state, "session state transition");
                session.state = state;
                session.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Bind a spawned process (and its streaming task plumbing) to a session.
    pub async fn bind_process(
        &self,
        session_id: &str,
        pid: u32,
        pgid: Option<i32>,
        cancel: watch::Sender<bool>,
    ) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(session_id) {
            Some(session) => {
                session.pid = Some(pid);
                session.pgid = pgid;
                session.cancel = Some(cancel);
                session.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Attach the streaming task handle once spawned.
    pub async fn set_stream_task(&self, session_id: &str, task: JoinHandle<()>) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(session_id) {
            Some(session) => {
                session.stream_task = Some(task);
                true
            }
            None => false,
        }
    }

    /// Drop the process binding and return the session to Idle.
    pub async fn clear_process(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.pid = None;
            session.pgid = None;
            session.cancel = None;
            session.stream_task = None;
            session.state = SessionState::Idle;
            session.last_activity = Instant::now();
        }
    }

    /// (pid, pgid) of the bound process, if one exists.
    pub async fn process_ids(&self, session_id: &str) -> Option<(u32, i32)> {
        let sessions = self.sessions.lock().await;
        let session = sessions.get(session_id)?;
        Some((session.pid?, session.pgid?))
    }

    /// Clone of the session's cancel handle, if a process is bound.
    pub async fn cancel_handle(&self, session_id: &str) -> Option<watch::Sender<bool>> {
        let sessions = self.sessions.lock().await;
        sessions.get(session_id)?.cancel.clone()
    }

    /// Clone of the session's outbound queue.
    pub async fn outbound(&self, session_id: &str) -> Option<mpsc::Sender<Value>> {
        let sessions = self.sessions.lock().await;
        Some(sessions.get(session_id)?.outbound.clone())
    }

    /// Remove a session and return it for teardown.
    pub async fn remove(&self, session_id: &str) -> Option<Session> {
        let mut sessions = self.sessions.lock().await;
        let mut session = sessions.remove(session_id)?;
        session.state = SessionState::Closed;
        tracing::info!(
            session = session_id,
            active = sessions.len(),
            "session removed"
        );
        Some(session)
    }

    /// Number of active sessions.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Snapshot of all sessions for observability.
    pub async fn snapshot(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.lock().await;
        sessions
            .values()
            .map(|s| SessionSummary {
                session_id: s.session_id.clone(),
                state: s.state,
                age_seconds: s.created_at.elapsed().as_secs_f64(),
                idle_seconds: s.last_activity.elapsed().as_secs_f64(),
                pid: s.pid,
            })
            .collect()
    }

    /// Remove sessions idle past `idle_timeout` and signal their streaming
    /// tasks to cancel (which terminates the process group). Returns the
    /// number removed.
    pub async fn cleanup_idle(&self, idle_timeout: Duration) -> usize {
        let expired: Vec<Session> = {
            let mut sessions = self.sessions.lock().await;
            let ids: Vec<String> = sessions
                .values()
                .filter(|s| s.last_activity.elapsed() >= idle_timeout)
                .map(|s| s.session_id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        let count = expired.len();
        for session in expired {
            tracing::info!(session = %session.session_id, "removing idle session");
            if let Some(cancel) = &session.cancel {
                let _ = cancel.send(true);
            }
        }
        count
    }
}
