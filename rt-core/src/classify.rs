//! Error classification.
//!
//! Decides whether an error ends the connection for good (`failed`), needs
//! the auth layer to renew credentials, or is worth retrying. The thresholds
//! are protocol constants, so they are carried as configuration.

use rtwire_types::ErrorInfo;
use serde::Deserialize;

/// Inclusive range of protocol error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CodeRange {
    /// First code in the range.
    pub start: u32,
    /// Last code in the range.
    pub end: u32,
}

impl CodeRange {
    /// Create a range covering `start..=end`.
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// Whether `code` falls in the range.
    pub fn contains(&self, code: u32) -> bool {
        (self.start..=self.end).contains(&code)
    }
}

/// How an error affects the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Drives the connection to `failed`.
    Fatal,
    /// Expired or revoked credentials; recoverable after renewal.
    Token,
    /// Transient; retry.
    Recoverable,
}

/// Thresholds for [`ErrorClass`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ErrorClassifier {
    /// Codes that are fatal unless they are token codes.
    pub fatal_codes: CodeRange,
    /// Codes reserved for token expiry, revocation and auth-provider failure.
    pub token_codes: CodeRange,
    /// Non-zero statuses strictly below this are fatal.
    pub fatal_status_below: u16,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self {
            fatal_codes: CodeRange::new(40000, 49999),
            token_codes: CodeRange::new(40140, 40149),
            fatal_status_below: 500,
        }
    }
}

impl ErrorClassifier {
    /// Classify an error.
    pub fn classify(&self, error: &ErrorInfo) -> ErrorClass {
        if self.token_codes.contains(error.code) {
            return ErrorClass::Token;
        }
        if self.fatal_codes.contains(error.code) {
            return ErrorClass::Fatal;
        }
        if error.status_code != 0 && error.status_code < self.fatal_status_below {
            return ErrorClass::Fatal;
        }
        ErrorClass::Recoverable
    }

    /// Whether `reason` should drive the connection to `failed`.
    pub fn is_fatal(&self, reason: Option<&ErrorInfo>) -> bool {
        reason.is_some_and(|e| self.classify(e) == ErrorClass::Fatal)
    }

    /// Whether `error` is a token error.
    pub fn is_token_error(&self, error: &ErrorInfo) -> bool {
        self.classify(error) == ErrorClass::Token
    }
}
