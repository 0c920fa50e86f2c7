//! Per-ticket transition policy (spec.md §4.6). These are pure decision
//! functions over a `TransferHeader`; the orchestrator actor performs the
//! I/O (history upserts, agent calls, file operations) the decisions call
//! for.

use transit_core::{CompletionCode, TransferHeader};

pub const DEFAULT_UPDATE_INTERVAL_BYTES: u64 = 100 * 1024;
pub const TARGET_PROGRESS_EVENTS: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpStatusClass {
    Success,
    Redirect,
    Error,
}

pub fn classify_http_status(status: u16) -> HttpStatusClass {
    match status {
        200..=299 => HttpStatusClass::Success,
        300..=399 => HttpStatusClass::Redirect,
        _ => HttpStatusClass::Error,
    }
}

pub struct TransferController {
    pub max_redirects: u8,
}

impl TransferController {
    pub fn new(max_redirects: u8) -> Self {
        Self { max_redirects }
    }

    /// `clamp(bytes_total / N, base, base*N)` once total size is known.
    pub fn update_interval_for(&self, bytes_total: u64) -> u64 {
        if bytes_total == 0 {
            return DEFAULT_UPDATE_INTERVAL_BYTES;
        }
        let n = TARGET_PROGRESS_EVENTS;
        (bytes_total / n).clamp(DEFAULT_UPDATE_INTERVAL_BYTES, DEFAULT_UPDATE_INTERVAL_BYTES * n)
    }

    /// spec.md §4.6 "Content-Length handling".
    pub fn apply_content_length(&self, header: &mut TransferHeader, content_length: u64) {
        if content_length == 0 {
            return;
        }
        if header.bytes_total == 0 {
            header.bytes_total = if header.bytes_completed > 0 {
                content_length + header.bytes_completed
            } else {
                content_length
            };
            header.update_interval = self.update_interval_for(header.bytes_total);
        }
    }

    pub fn should_emit_progress(&self, header: &TransferHeader) -> bool {
        header.bytes_completed.saturating_sub(header.last_update) >= header.update_interval
    }

    pub fn record_progress(&self, header: &mut TransferHeader) {
        header.last_update = header.bytes_completed;
    }

    /// Attempt to consume one unit of redirect budget. `false` means the
    /// budget is exhausted and the transfer must terminate cancelled.
    pub fn try_follow_redirect(&self, header: &mut TransferHeader) -> bool {
        if header.redirect_budget == 0 {
            return false;
        }
        header.redirect_budget -= 1;
        true
    }

    /// Reset per-transfer progress state for a redirected restart: the old
    /// response's partial body is discarded.
    pub fn reset_for_redirect(&self, header: &mut TransferHeader) {
        header.bytes_completed = header.initial_offset;
        header.bytes_total = 0;
        header.last_update = header.initial_offset;
        if !header.flags.keep_filename_on_redirect {
            header.dest_filename = None;
        }
    }

    /// Agent timeout / write-error / any transport-level error
    /// (spec.md §4.6, §5 "Timeout semantics").
    pub fn classify_transport_failure(&self, can_handle_pause: bool) -> CompletionCode {
        if can_handle_pause {
            CompletionCode::Interrupted
        } else {
            CompletionCode::GeneralError
        }
    }

    /// Short body with no transport error: `FileCorrupt`, resumable under
    /// the same `can_handle_pause` rule as a transport failure.
    pub fn classify_short_body(&self, can_handle_pause: bool) -> CompletionCode {
        if can_handle_pause {
            CompletionCode::Interrupted
        } else {
            CompletionCode::FileCorrupt
        }
    }

    pub fn classify_low_speed(&self, can_handle_pause: bool) -> CompletionCode {
        self.classify_transport_failure(can_handle_pause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transit_core::*;

    fn header() -> TransferHeader {
        TransferHeader {
            ticket: 1,
            owner: "app".into(),
            source_url: "https://example.test/a".into(),
            mime: None,
            dest_dir: "/tmp".into(),
            dest_filename: Some("a".into()),
            temp_prefix: ".tmp".into(),
            auth_token: None,
            device_id: None,
            cookie_header: None,
            initial_offset: 0,
            bytes_completed: 0,
            bytes_total: 0,
            byte_range: None,
            flags: TransferFlags {
                keep_filename_on_redirect: false,
                can_handle_pause: true,
                auto_resume: true,
                append: false,
            },
            interface: InterfaceId::Wifi,
            wan_subtype: WanSubType::Unknown,
            redirect_budget: 5,
            last_update: 0,
            update_interval: DEFAULT_UPDATE_INTERVAL_BYTES,
            error_count: 0,
            queued: false,
            state: TransferState::Running,
        }
    }

    #[test]
    fn update_interval_clamps_between_base_and_base_times_n() {
        let c = TransferController::new(5);
        assert_eq!(c.update_interval_for(0), DEFAULT_UPDATE_INTERVAL_BYTES);
        assert_eq!(c.update_interval_for(1_000), DEFAULT_UPDATE_INTERVAL_BYTES);
        assert_eq!(
            c.update_interval_for(8_000_000),
            400_000 // 8_000_000 / 20
        );
        assert_eq!(
            c.update_interval_for(1_000_000_000),
            DEFAULT_UPDATE_INTERVAL_BYTES * TARGET_PROGRESS_EVENTS
        );
    }

    #[test]
    fn content_length_sets_total_directly_from_zero() {
        let c = TransferController::new(5);
        let mut h = header();
        c.apply_content_length(&mut h, 8_000_000);
        assert_eq!(h.bytes_total, 8_000_000);
    }

    #[test]
    fn content_length_after_partial_progress_is_resume_response() {
        let c = TransferController::new(5);
        let mut h = header();
        h.bytes_completed = 4_000_000;
        c.apply_content_length(&mut h, 4_000_000);
        assert_eq!(h.bytes_total, 8_000_000);
    }

    #[test]
    fn zero_content_length_is_ignored() {
        let c = TransferController::new(5);
        let mut h = header();
        c.apply_content_length(&mut h, 0);
        assert_eq!(h.bytes_total, 0);
    }

    #[test]
    fn redirect_budget_exhausts_after_five_follows() {
        let c = TransferController::new(5);
        let mut h = header();
        for _ in 0..5 {
            assert!(c.try_follow_redirect(&mut h));
        }
        assert_eq!(h.redirect_budget, 0);
        assert!(!c.try_follow_redirect(&mut h));
    }

    #[test]
    fn transport_failure_classification_depends_on_can_handle_pause() {
        let c = TransferController::new(5);
        assert_eq!(c.classify_transport_failure(true), CompletionCode::Interrupted);
        assert_eq!(c.classify_transport_failure(false), CompletionCode::GeneralError);
    }

    #[test]
    fn short_body_classification_depends_on_can_handle_pause() {
        let c = TransferController::new(5);
        assert_eq!(c.classify_short_body(true), CompletionCode::Interrupted);
        assert_eq!(c.classify_short_body(false), CompletionCode::FileCorrupt);
    }
}
