//! Best-effort remote replica of activity and session lifecycle events.
//!
//! The mirror is addressed as `users/{user}/activities/{key}/sessions/{doc}`.
//! Writes are at-most-once: the coordinator hands them to a
//! [`MirrorDispatcher`] and never waits on the outcome. Failures are logged
//! and counted in [`MirrorHealth`], never retried.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crate::error::TrackerError;

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("Mirror unavailable: {0}")]
    Unavailable(String),

    #[error(
        "No mirrored session under {activity_key} matched uid {uid:?} or start {start_time_ms}"
    )]
    NoMatch {
        activity_key: String,
        uid: Option<String>,
        start_time_ms: i64,
    },

    #[error("Mirror call timed out after {0} ms")]
    Timeout(u64),

    #[error("Mirror I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Mirror JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type MirrorResult<T> = std::result::Result<T, MirrorError>;

impl From<MirrorError> for TrackerError {
    fn from(err: MirrorError) -> Self {
        TrackerError::MirrorSync(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteActivity {
    pub name: String,
    pub color_hex: Option<String>,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSession {
    /// Absent on documents written before sessions carried a uid.
    #[serde(default)]
    pub uid: Option<String>,
    pub start_time_ms: i64,
    pub end_time_ms: Option<i64>,
}

#[async_trait]
pub trait RemoteMirror: Send + Sync {
    fn name(&self) -> &'static str;

    /// `false` for backends that drop everything; the dispatcher counts
    /// those writes as skipped instead of attempted.
    fn accepts_writes(&self) -> bool {
        true
    }

    async fn add_activity(
        &self,
        user_id: &str,
        activity_key: &str,
        activity: &RemoteActivity,
    ) -> MirrorResult<()>;

    async fn delete_activity(&self, user_id: &str, activity_key: &str) -> MirrorResult<()>;

    /// Returns the server-assigned document id.
    async fn add_session(
        &self,
        user_id: &str,
        activity_key: &str,
        session: &RemoteSession,
    ) -> MirrorResult<String>;

    /// Matches on `uid` first, then on `start_time_ms` among documents
    /// without a uid. The first match wins.
    async fn update_session_end_time(
        &self,
        user_id: &str,
        activity_key: &str,
        uid: Option<&str>,
        start_time_ms: i64,
        end_time_ms: i64,
    ) -> MirrorResult<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Document tree shared by the memory and file backends
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDoc {
    pub doc_id: String,
    #[serde(flatten)]
    pub session: RemoteSession,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityDoc {
    #[serde(default)]
    pub fields: Option<RemoteActivity>,
    #[serde(default)]
    pub sessions: Vec<SessionDoc>,
}

/// Everything mirrored for one user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTree {
    #[serde(default)]
    pub activities: BTreeMap<String, ActivityDoc>,
}

impl UserTree {
    fn add_activity(&mut self, activity_key: &str, activity: &RemoteActivity) {
        self.activities
            .entry(activity_key.to_string())
            .or_default()
            .fields = Some(activity.clone());
    }

    fn delete_activity(&mut self, activity_key: &str) {
        self.activities.remove(activity_key);
    }

    fn add_session(&mut self, activity_key: &str, session: &RemoteSession) -> String {
        let doc_id = ulid::Ulid::new().to_string();
        self.activities
            .entry(activity_key.to_string())
            .or_default()
            .sessions
            .push(SessionDoc {
                doc_id: doc_id.clone(),
                session: session.clone(),
            });
        doc_id
    }

    fn update_end_time(
        &mut self,
        activity_key: &str,
        uid: Option<&str>,
        start_time_ms: i64,
        end_time_ms: i64,
    ) -> MirrorResult<()> {
        let no_match = || MirrorError::NoMatch {
            activity_key: activity_key.to_string(),
            uid: uid.map(str::to_string),
            start_time_ms,
        };
        let sessions = &mut self
            .activities
            .get_mut(activity_key)
            .ok_or_else(no_match)?
            .sessions;

        let by_uid = uid.and_then(|uid| {
            sessions
                .iter()
                .position(|doc| doc.session.uid.as_deref() == Some(uid))
        });
        let index = by_uid
            .or_else(|| {
                sessions.iter().position(|doc| {
                    (uid.is_none() || doc.session.uid.is_none())
                        && doc.session.start_time_ms == start_time_ms
                })
            })
            .ok_or_else(no_match)?;

        sessions[index].session.end_time_ms = Some(end_time_ms);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory backend
// ─────────────────────────────────────────────────────────────────────────────

/// In-process document store. Can be switched offline or slowed down.
#[derive(Debug, Default)]
pub struct MemoryMirror {
    users: Mutex<BTreeMap<String, UserTree>>,
    offline: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl MemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut guard) = self.latency.lock() {
            *guard = latency;
        }
    }

    pub fn user_tree(&self, user_id: &str) -> Option<UserTree> {
        self.users
            .lock()
            .ok()
            .and_then(|users| users.get(user_id).cloned())
    }

    async fn with_user<T>(
        &self,
        user_id: &str,
        op: impl FnOnce(&mut UserTree) -> MirrorResult<T>,
    ) -> MirrorResult<T> {
        let latency = self.latency.lock().ok().and_then(|guard| *guard);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(MirrorError::Unavailable("memory mirror is offline".to_string()));
        }
        let mut users = self
            .users
            .lock()
            .map_err(|_| MirrorError::Unavailable("memory mirror lock poisoned".to_string()))?;
        op(users.entry(user_id.to_string()).or_default())
    }
}

#[async_trait]
impl RemoteMirror for MemoryMirror {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn add_activity(
        &self,
        user_id: &str,
        activity_key: &str,
        activity: &RemoteActivity,
    ) -> MirrorResult<()> {
        self.with_user(user_id, |tree| {
            tree.add_activity(activity_key, activity);
            Ok(())
        })
        .await
    }

    async fn delete_activity(&self, user_id: &str, activity_key: &str) -> MirrorResult<()> {
        self.with_user(user_id, |tree| {
            tree.delete_activity(activity_key);
            Ok(())
        })
        .await
    }

    async fn add_session(
        &self,
        user_id: &str,
        activity_key: &str,
        session: &RemoteSession,
    ) -> MirrorResult<String> {
        self.with_user(user_id, |tree| Ok(tree.add_session(activity_key, session)))
            .await
    }

    async fn update_session_end_time(
        &self,
        user_id: &str,
        activity_key: &str,
        uid: Option<&str>,
        start_time_ms: i64,
        end_time_ms: i64,
    ) -> MirrorResult<()> {
        self.with_user(user_id, |tree| {
            tree.update_end_time(activity_key, uid, start_time_ms, end_time_ms)
        })
        .await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File backend
// ─────────────────────────────────────────────────────────────────────────────

/// One JSON document per user under `dir`, rewritten atomically.
#[derive(Debug, Clone)]
pub struct FileMirror {
    dir: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl FileMirror {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn user_path(&self, user_id: &str) -> PathBuf {
        let file_stem: String = user_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", file_stem))
    }

    pub fn read_user(&self, user_id: &str) -> MirrorResult<UserTree> {
        load_tree(&self.user_path(user_id))
    }

    async fn mutate<T, F>(&self, user_id: &str, op: F) -> MirrorResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut UserTree) -> MirrorResult<T> + Send + 'static,
    {
        let path = self.user_path(user_id);
        let lock = Arc::clone(&self.lock);
        tokio::task::spawn_blocking(move || {
            let _guard = lock
                .lock()
                .map_err(|_| MirrorError::Unavailable("file mirror lock poisoned".to_string()))?;
            let mut tree = load_tree(&path)?;
            let value = op(&mut tree)?;
            save_tree(&path, &tree)?;
            Ok(value)
        })
        .await
        .map_err(|err| MirrorError::Unavailable(format!("file mirror task failed: {}", err)))?
    }
}

fn load_tree(path: &Path) -> MirrorResult<UserTree> {
    let data = match fs_err::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(UserTree::default()),
        Err(source) => {
            return Err(MirrorError::Io {
                context: "Failed to read mirror file".to_string(),
                source,
            })
        }
    };
    serde_json::from_slice(&data).map_err(|source| MirrorError::Json {
        context: format!("Failed to parse {}", path.display()),
        source,
    })
}

fn save_tree(path: &Path, tree: &UserTree) -> MirrorResult<()> {
    if let Some(parent) = path.parent() {
        fs_err::create_dir_all(parent).map_err(|source| MirrorError::Io {
            context: "Failed to create mirror dir".to_string(),
            source,
        })?;
    }

    let payload = serde_json::to_vec_pretty(tree).map_err(|source| MirrorError::Json {
        context: "Failed to serialize mirror document".to_string(),
        source,
    })?;
    let tmp_path = path.with_extension("tmp");
    fs_err::write(&tmp_path, payload).map_err(|source| MirrorError::Io {
        context: "Failed to write mirror document".to_string(),
        source,
    })?;
    fs_err::rename(&tmp_path, path).map_err(|source| MirrorError::Io {
        context: "Failed to commit mirror document".to_string(),
        source,
    })?;
    Ok(())
}

#[async_trait]
impl RemoteMirror for FileMirror {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn add_activity(
        &self,
        user_id: &str,
        activity_key: &str,
        activity: &RemoteActivity,
    ) -> MirrorResult<()> {
        let key = activity_key.to_string();
        let activity = activity.clone();
        self.mutate(user_id, move |tree| {
            tree.add_activity(&key, &activity);
            Ok(())
        })
        .await
    }

    async fn delete_activity(&self, user_id: &str, activity_key: &str) -> MirrorResult<()> {
        let key = activity_key.to_string();
        self.mutate(user_id, move |tree| {
            tree.delete_activity(&key);
            Ok(())
        })
        .await
    }

    async fn add_session(
        &self,
        user_id: &str,
        activity_key: &str,
        session: &RemoteSession,
    ) -> MirrorResult<String> {
        let key = activity_key.to_string();
        let session = session.clone();
        self.mutate(user_id, move |tree| Ok(tree.add_session(&key, &session)))
            .await
    }

    async fn update_session_end_time(
        &self,
        user_id: &str,
        activity_key: &str,
        uid: Option<&str>,
        start_time_ms: i64,
        end_time_ms: i64,
    ) -> MirrorResult<()> {
        let key = activity_key.to_string();
        let uid = uid.map(str::to_string);
        self.mutate(user_id, move |tree| {
            tree.update_end_time(&key, uid.as_deref(), start_time_ms, end_time_ms)
        })
        .await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Disabled backend
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledMirror;

#[async_trait]
impl RemoteMirror for DisabledMirror {
    fn name(&self) -> &'static str {
        "disabled"
    }

    fn accepts_writes(&self) -> bool {
        false
    }

    async fn add_activity(&self, _: &str, _: &str, _: &RemoteActivity) -> MirrorResult<()> {
        Ok(())
    }

    async fn delete_activity(&self, _: &str, _: &str) -> MirrorResult<()> {
        Ok(())
    }

    async fn add_session(&self, _: &str, _: &str, _: &RemoteSession) -> MirrorResult<String> {
        Ok(String::new())
    }

    async fn update_session_end_time(
        &self,
        _: &str,
        _: &str,
        _: Option<&str>,
        _: i64,
        _: i64,
    ) -> MirrorResult<()> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Health sink
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorHealthSnapshot {
    pub backend: String,
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
pub struct MirrorHealth {
    attempted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl MirrorHealth {
    fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self, operation: &'static str, err: MirrorError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        let report = TrackerError::from(err);
        tracing::warn!(operation, error = %report, "Mirror write failed");
        self.set_last_error(report.to_string());
    }

    fn record_skipped(&self, operation: &'static str, reason: &str) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(operation, reason, "Mirror write skipped");
    }

    fn set_last_error(&self, message: String) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(message);
        }
    }

    fn snapshot(&self, backend: &str) -> MirrorHealthSnapshot {
        MirrorHealthSnapshot {
            backend: backend.to_string(),
            attempted: self.attempted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|last| last.clone()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorOp {
    AddActivity {
        user_id: String,
        activity_key: String,
        activity: RemoteActivity,
    },
    DeleteActivity {
        user_id: String,
        activity_key: String,
    },
    AddSession {
        user_id: String,
        activity_key: String,
        session: RemoteSession,
    },
    UpdateSessionEnd {
        user_id: String,
        activity_key: String,
        uid: Option<String>,
        start_time_ms: i64,
        end_time_ms: i64,
    },
}

impl MirrorOp {
    pub fn label(&self) -> &'static str {
        match self {
            MirrorOp::AddActivity { .. } => "add_activity",
            MirrorOp::DeleteActivity { .. } => "delete_activity",
            MirrorOp::AddSession { .. } => "add_session",
            MirrorOp::UpdateSessionEnd { .. } => "update_session_end_time",
        }
    }
}

enum Envelope {
    Op(MirrorOp),
    Flush(oneshot::Sender<()>),
}

/// Queues mirror writes for a single background worker.
///
/// `submit` never blocks: once `max_in_flight` writes are queued, further
/// writes are dropped and counted as skipped. The worker runs writes in
/// submission order so an end-time update never overtakes its `add_session`.
#[derive(Clone)]
pub struct MirrorDispatcher {
    tx: mpsc::Sender<Envelope>,
    health: Arc<MirrorHealth>,
    backend: &'static str,
    accepts_writes: bool,
}

impl MirrorDispatcher {
    pub fn spawn(
        handle: &Handle,
        mirror: Arc<dyn RemoteMirror>,
        timeout: Duration,
        max_in_flight: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(max_in_flight.max(1));
        let health = Arc::new(MirrorHealth::default());
        let dispatcher = Self {
            tx,
            health: Arc::clone(&health),
            backend: mirror.name(),
            accepts_writes: mirror.accepts_writes(),
        };
        handle.spawn(run_worker(rx, mirror, health, timeout));
        dispatcher
    }

    pub fn submit(&self, op: MirrorOp) {
        let operation = op.label();
        if !self.accepts_writes {
            self.health.record_skipped(operation, "mirror disabled");
            return;
        }
        match self.tx.try_send(Envelope::Op(op)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.health.record_skipped(operation, "too many writes in flight");
                self.health
                    .set_last_error(format!("{} dropped: too many writes in flight", operation));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.health.record_skipped(operation, "mirror worker stopped");
            }
        }
    }

    /// Counts a write that could not even be formed (e.g. no remote key).
    pub fn skip(&self, operation: &'static str, reason: &str) {
        self.health.record_skipped(operation, reason);
    }

    pub fn health(&self) -> MirrorHealthSnapshot {
        self.health.snapshot(self.backend)
    }

    /// Resolves once every write submitted before this call has finished.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Envelope::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<Envelope>,
    mirror: Arc<dyn RemoteMirror>,
    health: Arc<MirrorHealth>,
    timeout: Duration,
) {
    while let Some(envelope) = rx.recv().await {
        match envelope {
            Envelope::Op(op) => {
                let operation = op.label();
                health.attempted.fetch_add(1, Ordering::Relaxed);
                match tokio::time::timeout(timeout, execute(mirror.as_ref(), op)).await {
                    Ok(Ok(())) => health.record_success(),
                    Ok(Err(err)) => health.record_failure(operation, err),
                    Err(_) => health.record_failure(
                        operation,
                        MirrorError::Timeout(timeout.as_millis() as u64),
                    ),
                }
            }
            Envelope::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("Mirror worker stopped");
}

async fn execute(mirror: &dyn RemoteMirror, op: MirrorOp) -> MirrorResult<()> {
    match op {
        MirrorOp::AddActivity {
            user_id,
            activity_key,
            activity,
        } => mirror.add_activity(&user_id, &activity_key, &activity).await,
        MirrorOp::DeleteActivity {
            user_id,
            activity_key,
        } => mirror.delete_activity(&user_id, &activity_key).await,
        MirrorOp::AddSession {
            user_id,
            activity_key,
            session,
        } => {
            let doc_id = mirror.add_session(&user_id, &activity_key, &session).await?;
            tracing::debug!(
                user_id = %user_id,
                activity_key = %activity_key,
                doc_id = %doc_id,
                "Mirrored session"
            );
            Ok(())
        }
        MirrorOp::UpdateSessionEnd {
            user_id,
            activity_key,
            uid,
            start_time_ms,
            end_time_ms,
        } => {
            mirror
                .update_session_end_time(
                    &user_id,
                    &activity_key,
                    uid.as_deref(),
                    start_time_ms,
                    end_time_ms,
                )
                .await
        }
    }
}
