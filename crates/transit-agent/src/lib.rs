//! Abstract transfer-agent boundary (spec.md §4.3).
//!
//! The orchestrator treats the concrete HTTP/FTP engine as an external
//! collaborator behind this trait: it issues the actual request, reports
//! byte progress, headers and completion, and nothing about its internals
//! is core. Two concrete engines are provided — an `http` module built on
//! `reqwest` and an `ftp` module with a small RFC 959 client — plus, under
//! the `testing` feature, a `mock` module the orchestrator's own test
//! suite drives deterministically.

pub mod http;
pub mod ftp;
pub mod dispatch;

#[cfg(feature = "testing")]
pub mod mock;

use thiserror::Error;
use uuid::Uuid;

/// Opaque handle tying a controller-side ticket to an agent-side session.
/// The orchestrator keeps `ticket <-> session_id` as a plain mapping and
/// never derives one from the other (spec.md §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Local file an upload session streams from. Both concrete engines read
/// it directly off disk rather than pulling bytes through `ReadRequest`,
/// since both already receive the path; `ReadRequest` stays available for
/// an agent implementation with no filesystem access of its own.
#[derive(Debug, Clone)]
pub struct UploadBody {
    pub path: std::path::PathBuf,
    pub offset: u64,
    pub content_type: Option<String>,
}

/// Everything the agent needs to start one session (spec.md §4.3 `start(request)`).
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub url: String,
    pub resume_from: u64,
    /// Bound local interface name (e.g. `wlan0`), or `None` for `any`.
    pub interface: Option<String>,
    pub headers: Vec<(String, String)>,
    pub cookie_header: Option<String>,
    pub low_speed_floor_bytes_per_sec: u64,
    pub low_speed_window_secs: u64,
    pub connect_timeout_secs: u64,
    pub upload: Option<UploadBody>,
}

/// Terminal outcome of one session, the agent's one-shot `on_done`.
#[derive(Debug, Clone)]
pub enum AgentOutcome {
    /// Body fully received/sent; carries the final HTTP status (0 for FTP,
    /// which has no equivalent).
    Ok { http_status: u16 },
    HttpError { http_status: u16 },
    ConnectTimeout,
    LowSpeed,
    WriteError,
    /// Any other transport-level failure (DNS, reset, protocol violation).
    Transport(String),
    Cancelled,
}

/// Events an agent session emits on its way to exactly one terminal
/// `Done`. Delivered over an `mpsc` channel so that, per spec.md §5, every
/// callback into the controller runs serialized on its own executor.
#[derive(Debug)]
pub enum AgentEvent {
    Header {
        session: SessionId,
        name: String,
        value: String,
    },
    /// A chunk of response body. The agent expects no reply; a `false`
    /// return from the orchestrator's processing is expressed by calling
    /// `cancel` on the session rather than blocking here.
    Write {
        session: SessionId,
        bytes: bytes::Bytes,
    },
    /// Upload body pull: the agent asks for up to `max_len` bytes; the
    /// reply channel carries what to send (empty == EOF).
    ReadRequest {
        session: SessionId,
        max_len: usize,
        reply: tokio::sync::oneshot::Sender<Vec<u8>>,
    },
    Done {
        session: SessionId,
        outcome: AgentOutcome,
    },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),
    #[error("agent transport error: {0}")]
    Transport(String),
    #[error("session not found")]
    NoSuchSession,
}

pub type Result<T> = std::result::Result<T, Error>;

/// The orchestrator depends only on this trait (spec.md §4.3).
pub trait TransferAgent: Send + Sync {
    /// Start a session. Returns once the session has been handed to the
    /// engine's internal task; all further communication is via `events`.
    fn start(
        &self,
        session: SessionId,
        request: AgentRequest,
        events: tokio::sync::mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<()>;

    /// Idempotent; causes `Done` to fire with `AgentOutcome::Cancelled` if
    /// the session was still live.
    fn cancel(&self, session: SessionId);

    /// Remove the session from the engine's active pool, rebind its
    /// interface, and re-admit it requesting from `resume_from`. Safe to
    /// call only from the controller (spec.md §4.3).
    fn swap_interface(
        &self,
        session: SessionId,
        interface: Option<String>,
        resume_from: u64,
        events: tokio::sync::mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<()>;
}
