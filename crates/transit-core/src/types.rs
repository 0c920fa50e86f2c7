use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::Error;

/// Monotonically increasing transfer identifier. Never reused within the
/// lifetime of a history store.
pub type Ticket = u64;

/// Physical (or virtual, for `Any`) network interface a transfer can be
/// bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceId {
    Wired,
    Wifi,
    Wan,
    Btpan,
    /// Let the orchestrator pick; resolved to a concrete interface at
    /// admission time, or left as `Any` if none is available.
    Any,
}

impl InterfaceId {
    pub const NAMED: [InterfaceId; 4] = [
        InterfaceId::Wired,
        InterfaceId::Wifi,
        InterfaceId::Wan,
        InterfaceId::Btpan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InterfaceId::Wired => "wired",
            InterfaceId::Wifi => "wifi",
            InterfaceId::Wan => "wan",
            InterfaceId::Btpan => "btpan",
            InterfaceId::Any => "any",
        }
    }
}

impl std::fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for InterfaceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wired" => Ok(InterfaceId::Wired),
            "wifi" => Ok(InterfaceId::Wifi),
            "wan" => Ok(InterfaceId::Wan),
            "btpan" => Ok(InterfaceId::Btpan),
            "any" => Ok(InterfaceId::Any),
            other => Err(Error::InvalidInterface(other.to_string())),
        }
    }
}

/// WAN connection sub-type. `OneX` is treated as unusable unless an
/// explicit policy flag (`allow_1x`) permits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WanSubType {
    #[default]
    Unknown,
    #[serde(rename = "1x")]
    OneX,
    Hs,
}

impl WanSubType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WanSubType::Unknown => "unknown",
            WanSubType::OneX => "1x",
            WanSubType::Hs => "hs",
        }
    }
}

impl FromStr for WanSubType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(WanSubType::Unknown),
            "1x" => Ok(WanSubType::OneX),
            "hs" => Ok(WanSubType::Hs),
            other => Err(Error::InvalidWanSubType(other.to_string())),
        }
    }
}

/// Interface reachability as tracked by the interface monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityStatus {
    Connected,
    Disconnected,
    #[default]
    Unknown,
}

/// Finite transfer state set. `Init` only ever appears as the history
/// store's schema-version sentinel row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Init,
    Queued,
    Running,
    Paused,
    Interrupted,
    Completed,
    Cancelled,
}

impl TransferState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Init => "init",
            TransferState::Queued => "queued",
            TransferState::Running => "running",
            TransferState::Paused => "paused",
            TransferState::Interrupted => "interrupted",
            TransferState::Completed => "completed",
            TransferState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Cancelled)
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransferState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(TransferState::Init),
            "queued" => Ok(TransferState::Queued),
            "running" => Ok(TransferState::Running),
            "paused" => Ok(TransferState::Paused),
            "interrupted" => Ok(TransferState::Interrupted),
            "completed" => Ok(TransferState::Completed),
            "cancelled" => Ok(TransferState::Cancelled),
            other => Err(Error::InvalidState(other.to_string())),
        }
    }
}

/// Half-open byte range `[low, high)` requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub low: u64,
    pub high: u64,
}

/// Per-transfer behavioral flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TransferFlags {
    pub keep_filename_on_redirect: bool,
    pub can_handle_pause: bool,
    pub auto_resume: bool,
    pub append: bool,
}

/// One `postParameters` entry of an upload request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostParameter {
    pub key: String,
    pub data: String,
    pub content_type: Option<String>,
}

/// Upload-only details (§6 "Client request fields (upload)").
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UploadDetails {
    pub file_label: Option<String>,
    pub content_type: Option<String>,
    pub post_parameters: Vec<PostParameter>,
    pub custom_http_headers: Vec<String>,
}

/// Tagged variant distinguishing downloads from uploads; the controller
/// dispatches on this tag only at state-machine boundaries (redirect
/// handling, body driving), everything else lives on the shared header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransferBody {
    Download,
    Upload(UploadDetails),
}

impl TransferBody {
    pub fn is_upload(&self) -> bool {
        matches!(self, TransferBody::Upload(_))
    }
}

/// Header fields shared by downloads and uploads (spec.md §3 "TransferRecord").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferHeader {
    pub ticket: Ticket,
    pub owner: String,
    pub source_url: String,
    pub mime: Option<String>,
    pub dest_dir: PathBuf,
    pub dest_filename: Option<String>,
    pub temp_prefix: String,
    pub auth_token: Option<String>,
    pub device_id: Option<String>,
    pub cookie_header: Option<String>,
    pub initial_offset: u64,
    pub bytes_completed: u64,
    pub bytes_total: u64,
    pub byte_range: Option<ByteRange>,
    pub flags: TransferFlags,
    pub interface: InterfaceId,
    pub wan_subtype: WanSubType,
    pub redirect_budget: u8,
    pub last_update: u64,
    pub update_interval: u64,
    pub error_count: u32,
    pub queued: bool,
    pub state: TransferState,
}

/// In-memory descriptor of one transfer, plus the tag distinguishing
/// its direction. The open write handle (while running) deliberately
/// lives outside this value in the controller's active-session map: it
/// is not serializable and must not survive a history round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub header: TransferHeader,
    pub body: TransferBody,
}

impl TransferRecord {
    /// `bytes_completed <= bytes_total` whenever `bytes_total > 0`.
    pub fn check_invariant(&self) -> bool {
        self.header.bytes_total == 0 || self.header.bytes_completed <= self.header.bytes_total
    }
}
