//! Free-space admission checks and wake-lock reference counting
//! (spec.md §4.8).

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::statvfs::statvfs;
use transit_core::OrchestratorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceZone {
    Ok,
    Low,
    Med,
    High,
    Critical,
    /// Treated as filesystem-full for admission and resume.
    Stop,
}

impl SpaceZone {
    pub fn is_admissible(&self) -> bool {
        !matches!(self, SpaceZone::Stop)
    }
}

/// The power/wake-lock client is an out-of-scope external collaborator
/// (spec.md §1); this trait is the seam the orchestrator depends on.
pub trait WakeLockClient: Send + Sync {
    fn set(&self, desired: bool);
}

/// No-op implementation for environments with no wake-lock service.
pub struct NullWakeLock;

impl WakeLockClient for NullWakeLock {
    fn set(&self, _desired: bool) {}
}

pub struct ResourceGuard {
    low_full_percent: u32,
    med_full_percent: u32,
    high_full_percent: u32,
    critical_full_percent: u32,
    stop_remain_kb: u64,
    wake_lock: Box<dyn WakeLockClient>,
    wake_lock_held: AtomicBool,
}

impl ResourceGuard {
    pub fn new(cfg: &OrchestratorConfig, wake_lock: Box<dyn WakeLockClient>) -> Self {
        Self {
            low_full_percent: cfg.low_full_percent,
            med_full_percent: cfg.med_full_percent,
            high_full_percent: cfg.high_full_percent,
            critical_full_percent: cfg.critical_full_percent,
            stop_remain_kb: cfg.stop_remain_kb,
            wake_lock,
            wake_lock_held: AtomicBool::new(false),
        }
    }

    pub fn free_kb(&self, path: &Path) -> std::io::Result<u64> {
        let stat = statvfs(path).map_err(std::io::Error::from)?;
        Ok((stat.blocks_available() as u64 * stat.fragment_size() as u64) / 1024)
    }

    pub fn total_kb(&self, path: &Path) -> std::io::Result<u64> {
        let stat = statvfs(path).map_err(std::io::Error::from)?;
        Ok((stat.blocks() as u64 * stat.fragment_size() as u64) / 1024)
    }

    pub fn classify(&self, free_kb: u64, total_kb: u64) -> SpaceZone {
        if free_kb <= self.stop_remain_kb {
            return SpaceZone::Stop;
        }
        if total_kb == 0 {
            return SpaceZone::Ok;
        }
        let percent_free = (free_kb.saturating_mul(100) / total_kb) as u32;
        if percent_free <= self.critical_full_percent {
            SpaceZone::Critical
        } else if percent_free <= self.high_full_percent {
            SpaceZone::High
        } else if percent_free <= self.med_full_percent {
            SpaceZone::Med
        } else if percent_free <= self.low_full_percent {
            SpaceZone::Low
        } else {
            SpaceZone::Ok
        }
    }

    /// `true` when `path`'s filesystem has at least `kb_threshold` free,
    /// used for the lightweight resume-time recheck (spec.md §4.8).
    pub fn space_check(&self, path: &Path, kb_threshold: u64) -> bool {
        self.free_kb(path).map(|kb| kb >= kb_threshold).unwrap_or(false)
    }

    /// Admission-time check: classify the destination filesystem's free
    /// space and reject as `FilesystemFull` in zone `stop`.
    pub fn admit(&self, path: &Path) -> bool {
        match (self.free_kb(path), self.total_kb(path)) {
            (Ok(free), Ok(total)) => self.classify(free, total).is_admissible(),
            _ => false,
        }
    }

    /// Acquire on the 0->=1 active transition, release when active and
    /// queue are both empty. No-op if already in the desired state.
    pub fn wake_lock(&self, desired: bool) {
        let was_held = self.wake_lock_held.swap(desired, Ordering::SeqCst);
        if was_held != desired {
            self.wake_lock.set(desired);
        }
    }
}
