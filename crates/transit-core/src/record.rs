//! Stable on-disk serialization of a [`TransferRecord`].
//!
//! Field names here are part of the on-disk format: older rows must still
//! parse after upgrades. Counters wider than 32 bits are written both as a
//! best-effort truncated `u32` (for legacy readers) and as an `e_`-prefixed
//! decimal string; on read the string form is authoritative; see spec.md §9.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{
    ByteRange, InterfaceId, PostParameter, TransferBody, TransferFlags, TransferHeader,
    TransferRecord, TransferState, UploadDetails, WanSubType,
};

#[derive(Debug, Serialize, Deserialize)]
struct WireUpload {
    file_label: Option<String>,
    content_type: Option<String>,
    post_parameters: Vec<PostParameter>,
    custom_http_headers: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireBody {
    Download,
    Upload(WireUpload),
}

#[derive(Debug, Serialize, Deserialize)]
struct WireRecord {
    ticket: u64,
    owner: String,
    #[serde(rename = "url")]
    source_url: String,
    mime: Option<String>,
    dest_dir: String,
    dest_filename: Option<String>,
    temp_prefix: String,
    auth_token: Option<String>,
    device_id: Option<String>,
    cookie_header: Option<String>,

    initial_offset: u32,
    e_initial_offset: String,
    bytes_completed: u32,
    e_bytes_completed: String,
    bytes_total: u32,
    e_bytes_total: String,

    range_low: Option<u64>,
    range_high: Option<u64>,

    keep_filename_on_redirect: bool,
    can_handle_pause: bool,
    auto_resume: bool,
    append: bool,

    interface: String,
    wan_subtype: String,
    redirect_budget: u8,

    last_update: u32,
    e_last_update: String,
    update_interval: u32,
    e_update_interval: String,

    error_count: u32,
    queued: bool,
    state: String,

    body: WireBody,
}

fn truncate(v: u64) -> u32 {
    u32::try_from(v).unwrap_or(u32::MAX)
}

impl From<&TransferRecord> for WireRecord {
    fn from(rec: &TransferRecord) -> Self {
        let h = &rec.header;
        WireRecord {
            ticket: h.ticket,
            owner: h.owner.clone(),
            source_url: h.source_url.clone(),
            mime: h.mime.clone(),
            dest_dir: h.dest_dir.to_string_lossy().to_string(),
            dest_filename: h.dest_filename.clone(),
            temp_prefix: h.temp_prefix.clone(),
            auth_token: h.auth_token.clone(),
            device_id: h.device_id.clone(),
            cookie_header: h.cookie_header.clone(),

            initial_offset: truncate(h.initial_offset),
            e_initial_offset: h.initial_offset.to_string(),
            bytes_completed: truncate(h.bytes_completed),
            e_bytes_completed: h.bytes_completed.to_string(),
            bytes_total: truncate(h.bytes_total),
            e_bytes_total: h.bytes_total.to_string(),

            range_low: h.byte_range.map(|r| r.low),
            range_high: h.byte_range.map(|r| r.high),

            keep_filename_on_redirect: h.flags.keep_filename_on_redirect,
            can_handle_pause: h.flags.can_handle_pause,
            auto_resume: h.flags.auto_resume,
            append: h.flags.append,

            interface: h.interface.as_str().to_string(),
            wan_subtype: h.wan_subtype.as_str().to_string(),
            redirect_budget: h.redirect_budget,

            last_update: truncate(h.last_update),
            e_last_update: h.last_update.to_string(),
            update_interval: truncate(h.update_interval),
            e_update_interval: h.update_interval.to_string(),

            error_count: h.error_count,
            queued: h.queued,
            state: h.state.as_str().to_string(),

            body: match &rec.body {
                TransferBody::Download => WireBody::Download,
                TransferBody::Upload(u) => WireBody::Upload(WireUpload {
                    file_label: u.file_label.clone(),
                    content_type: u.content_type.clone(),
                    post_parameters: u.post_parameters.clone(),
                    custom_http_headers: u.custom_http_headers.clone(),
                }),
            },
        }
    }
}

impl TryFrom<WireRecord> for TransferRecord {
    type Error = Error;

    fn try_from(w: WireRecord) -> Result<Self> {
        // The e_-prefixed decimal string is authoritative; fall back to the
        // truncated field only if it somehow fails to parse.
        let parse_or_truncated = |s: &str, truncated: u32| s.parse::<u64>().unwrap_or(truncated as u64);

        let byte_range = match (w.range_low, w.range_high) {
            (Some(low), Some(high)) => Some(ByteRange { low, high }),
            _ => None,
        };

        let body = match w.body {
            WireBody::Download => TransferBody::Download,
            WireBody::Upload(u) => TransferBody::Upload(UploadDetails {
                file_label: u.file_label,
                content_type: u.content_type,
                post_parameters: u.post_parameters,
                custom_http_headers: u.custom_http_headers,
            }),
        };

        Ok(TransferRecord {
            header: TransferHeader {
                ticket: w.ticket,
                owner: w.owner,
                source_url: w.source_url,
                mime: w.mime,
                dest_dir: w.dest_dir.into(),
                dest_filename: w.dest_filename,
                temp_prefix: w.temp_prefix,
                auth_token: w.auth_token,
                device_id: w.device_id,
                cookie_header: w.cookie_header,
                initial_offset: parse_or_truncated(&w.e_initial_offset, w.initial_offset),
                bytes_completed: parse_or_truncated(&w.e_bytes_completed, w.bytes_completed),
                bytes_total: parse_or_truncated(&w.e_bytes_total, w.bytes_total),
                byte_range,
                flags: TransferFlags {
                    keep_filename_on_redirect: w.keep_filename_on_redirect,
                    can_handle_pause: w.can_handle_pause,
                    auto_resume: w.auto_resume,
                    append: w.append,
                },
                interface: w.interface.parse::<InterfaceId>()?,
                wan_subtype: w.wan_subtype.parse::<WanSubType>()?,
                redirect_budget: w.redirect_budget,
                last_update: parse_or_truncated(&w.e_last_update, w.last_update),
                update_interval: parse_or_truncated(&w.e_update_interval, w.update_interval),
                error_count: w.error_count,
                queued: w.queued,
                state: w.state.parse::<TransferState>()?,
            },
            body,
        })
    }
}

/// Serialize a record into its durable string form.
pub fn to_blob(record: &TransferRecord) -> Result<String> {
    let wire = WireRecord::from(record);
    Ok(serde_json::to_string(&wire)?)
}

/// Parse a durable string form back into a record.
pub fn from_blob(blob: &str) -> Result<TransferRecord> {
    let wire: WireRecord = serde_json::from_str(blob)?;
    wire.try_into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use std::path::PathBuf;

    fn sample() -> TransferRecord {
        TransferRecord {
            header: TransferHeader {
                ticket: 42,
                owner: "com.example.app".into(),
                source_url: "https://example.test/a.bin".into(),
                mime: Some("application/octet-stream".into()),
                dest_dir: PathBuf::from("/media/internal/downloads"),
                dest_filename: Some("a.bin".into()),
                temp_prefix: ".transit-tmp".into(),
                auth_token: Some("opaque-token".into()),
                device_id: Some("device-1".into()),
                cookie_header: None,
                initial_offset: 0,
                bytes_completed: 5_000_000_123,
                bytes_total: 9_000_000_456,
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
                last_update: 4_900_000_000,
                update_interval: 400_000,
                error_count: 0,
                queued: false,
                state: TransferState::Running,
            },
            body: TransferBody::Download,
        }
    }

    #[test]
    fn round_trips_64_bit_counters_exactly() {
        let rec = sample();
        let blob = to_blob(&rec).unwrap();
        let back = from_blob(&blob).unwrap();
        assert_eq!(back.header.bytes_completed, 5_000_000_123);
        assert_eq!(back.header.bytes_total, 9_000_000_456);
        assert_eq!(back.header.last_update, 4_900_000_000);
        assert_eq!(back.header.owner, rec.header.owner);
        assert_eq!(back.header.state, rec.header.state);
    }

    #[test]
    fn decimal_string_wins_over_truncated_field() {
        // Simulate a legacy writer that truncated but a correct e_ field.
        let rec = sample();
        let mut wire = WireRecord::from(&rec);
        wire.bytes_completed = 7; // corrupted 32-bit mirror
        let blob = serde_json::to_string(&wire).unwrap();
        let back = from_blob(&blob).unwrap();
        assert_eq!(back.header.bytes_completed, 5_000_000_123);
    }

    #[test]
    fn upload_body_round_trips() {
        let mut rec = sample();
        rec.body = TransferBody::Upload(UploadDetails {
            file_label: Some("report.pdf".into()),
            content_type: Some("application/pdf".into()),
            post_parameters: vec![PostParameter {
                key: "title".into(),
                data: "monthly report".into(),
                content_type: None,
            }],
            custom_http_headers: vec!["X-Client: transit/0.1".into()],
        });
        let blob = to_blob(&rec).unwrap();
        let back = from_blob(&blob).unwrap();
        assert!(back.body.is_upload());
    }
}
