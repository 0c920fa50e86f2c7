use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Static, startup-only configuration (spec.md §6 "Configuration").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub download_path: PathBuf,
    pub wired_iface: String,
    pub wifi_iface: String,
    pub wan_iface: String,
    pub btpan_iface: String,
    pub auto_resume: bool,
    pub resume_aggression: bool,
    pub app_compatibility_mode: bool,
    pub preemptive_free_space_check: bool,
    pub max_queue_length: u32,
    pub max_concurrent: u32,
    pub low_full_percent: u32,
    pub med_full_percent: u32,
    pub high_full_percent: u32,
    pub critical_full_percent: u32,
    pub stop_remain_kb: u64,
    pub allow_1x: bool,

    /// History store path (not in spec.md's enumerated option list but
    /// required to locate the durable map; defaults alongside
    /// `download_path`).
    pub history_db_path: PathBuf,

    /// Seconds of no byte progress on a running transfer before the
    /// watchdog sweep declares it stalled (SPEC_FULL.md §11, grounded in
    /// the original `Watchdog` activity check). Not one of spec.md's
    /// enumerated options; it is the ambient counterpart to the low-speed
    /// floor, for engines that go silent instead of trickling.
    pub stall_window_secs: u64,
}

/// Default constants (spec.md §6 "Default constants").
pub const DOWNLOAD_BUFFER_BYTES: usize = 512 * 1024;
pub const MIN_PROGRESS_INTERVAL_BYTES: u64 = 100 * 1024;
pub const TARGET_PROGRESS_EVENTS: u64 = 20;
pub const LOW_SPEED_FLOOR_BYTES_PER_SEC: u64 = 10;
pub const LOW_SPEED_WINDOW_SECS: u64 = 10;
pub const CONNECT_TIMEOUT_SECS: u64 = 60;
pub const MAX_REDIRECTS: u8 = 5;
pub const RECEIVE_TIMEOUT_SECS: u64 = 10;

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            download_path: PathBuf::from("/media/internal/downloads"),
            wired_iface: "eth0".to_string(),
            wifi_iface: "wlan0".to_string(),
            wan_iface: "wwan0".to_string(),
            btpan_iface: "bnep0".to_string(),
            auto_resume: true,
            resume_aggression: false,
            app_compatibility_mode: false,
            preemptive_free_space_check: true,
            max_queue_length: 128,
            max_concurrent: 2,
            low_full_percent: 15,
            med_full_percent: 10,
            high_full_percent: 5,
            critical_full_percent: 2,
            stop_remain_kb: 1024,
            allow_1x: false,
            history_db_path: PathBuf::from("/var/lib/transit/history.db"),
            stall_window_secs: 120,
        }
    }
}
