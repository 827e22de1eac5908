//! Application-level status codes.
//!
//! The codes match the standard RPC status taxonomy and are part of the
//! protocol contract; their numeric values must remain stable.

use std::fmt;

/// Metadata key carrying a human-readable description on non-OK responses.
pub const STATUS_DESCRIPTION_KEY: &str = "arf-status-description";

/// Application-level status returned in responses and stream errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Status {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    InternalError = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Status {
    pub fn code(&self) -> u16 {
        *self as u16
    }

    pub fn from_u16(code: u16) -> Option<Status> {
        match code {
            0 => Some(Status::Ok),
            1 => Some(Status::Cancelled),
            2 => Some(Status::Unknown),
            3 => Some(Status::InvalidArgument),
            4 => Some(Status::DeadlineExceeded),
            5 => Some(Status::NotFound),
            6 => Some(Status::AlreadyExists),
            7 => Some(Status::PermissionDenied),
            8 => Some(Status::ResourceExhausted),
            9 => Some(Status::FailedPrecondition),
            10 => Some(Status::Aborted),
            11 => Some(Status::OutOfRange),
            12 => Some(Status::Unimplemented),
            13 => Some(Status::InternalError),
            14 => Some(Status::Unavailable),
            15 => Some(Status::DataLoss),
            16 => Some(Status::Unauthenticated),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Status::Ok => "OK",
            Status::Cancelled => "Cancelled",
            Status::Unknown => "Unknown",
            Status::InvalidArgument => "Invalid Argument",
            Status::DeadlineExceeded => "Deadline Exceeded",
            Status::NotFound => "Not Found",
            Status::AlreadyExists => "Already Exists",
            Status::PermissionDenied => "Permission Denied",
            Status::ResourceExhausted => "Resource Exhausted",
            Status::FailedPrecondition => "Failed Precondition",
            Status::Aborted => "Aborted",
            Status::OutOfRange => "Out of Range",
            Status::Unimplemented => "Unimplemented",
            Status::InternalError => "Internal Error",
            Status::Unavailable => "Unavailable",
            Status::DataLoss => "Data Loss",
            Status::Unauthenticated => "Unauthenticated",
        };
        f.write_str(text)
    }
}

/// A non-OK status with its description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadStatus {
    pub code: Status,
    pub message: String,
}

impl BadStatus {
    pub fn new(code: Status, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for BadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BadStatus: {} ({}): {}",
            self.code.code(),
            self.code,
            self.message
        )
    }
}

impl std::error::Error for BadStatus {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_stable() {
        assert_eq!(Status::Ok.code(), 0);
        assert_eq!(Status::Cancelled.code(), 1);
        assert_eq!(Status::Unimplemented.code(), 12);
        assert_eq!(Status::Unauthenticated.code(), 16);
    }

    #[test]
    fn test_status_from_u16() {
        for code in 0..=16u16 {
            let status = Status::from_u16(code).unwrap();
            assert_eq!(status.code(), code);
        }
        assert!(Status::from_u16(17).is_none());
    }

    #[test]
    fn test_bad_status_display() {
        let err = BadStatus::new(Status::NotFound, "no such widget");
        let text = err.to_string();
        assert!(text.contains("5"));
        assert!(text.contains("Not Found"));
        assert!(text.contains("no such widget"));
    }
}
