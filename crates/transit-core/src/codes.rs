//! Numeric status/error codes observable to subscribers and callers
//! (spec.md §6 "Exit codes / terminal status codes").

use serde::{Deserialize, Serialize};

/// Terminal completion code carried on the terminal event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionCode {
    Ok,
    GeneralError,
    ConnectTimeout,
    FileCorrupt,
    FilesystemError,
    HttpError,
    WriteError,
    Interrupted,
    Cancelled,
}

impl CompletionCode {
    pub fn code(&self) -> i32 {
        match self {
            CompletionCode::Ok => 0,
            CompletionCode::GeneralError => -1,
            CompletionCode::ConnectTimeout => -2,
            CompletionCode::FileCorrupt => -3,
            CompletionCode::FilesystemError => -4,
            CompletionCode::HttpError => -5,
            CompletionCode::WriteError => -6,
            CompletionCode::Interrupted => 11,
            CompletionCode::Cancelled => 12,
        }
    }
}

/// Admission-time rejection reasons (spec.md §6/§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum AdmitError {
    #[error("admission queue is full")]
    QueueFull,
    #[error("insufficient free space on the destination filesystem")]
    FilesystemFull,
    #[error("no suitable network interface is available")]
    NoSuitableInterface,
    #[error("request failed a security boundary check")]
    FailedSecurityCheck,
    #[error("general admission error")]
    GeneralError,
}

impl AdmitError {
    pub fn code(&self) -> i32 {
        match self {
            AdmitError::QueueFull => -3,
            AdmitError::FilesystemFull => -4,
            AdmitError::NoSuitableInterface => -6,
            AdmitError::FailedSecurityCheck => -7,
            AdmitError::GeneralError => -1,
        }
    }
}

/// Errors from `resume(ticket)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ResumeError {
    #[error("ticket is not present in history")]
    NotInHistory,
    #[error("ticket is not in the interrupted state")]
    NotInterrupted,
    #[error("history store is corrupt")]
    HistoryCorrupt,
    #[error("temp file could not be accessed")]
    CannotAccessTemp,
    #[error("bound interface is down")]
    InterfaceDown,
    #[error("insufficient free space on the destination filesystem")]
    FilesystemFull,
    #[error("admission queue is full")]
    QueueFull,
}

/// Errors from `pause(ticket, ..)` / `cancel(ticket)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum PauseError {
    #[error("no such download task")]
    NoSuchDownloadTask,
}

/// Errors from `swap_interface(ticket, target)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum SwapError {
    #[error("no such download task")]
    NoSuchDownloadTask,
    #[error("swapping to `any` is not a valid target")]
    InvalidTarget,
}
