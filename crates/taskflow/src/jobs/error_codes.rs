// crates/taskflow/src/jobs/error_codes.rs
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Transient,
    Permanent,
    Timeout,
    Panic,
    BadPayload,
    HandlerNotFound,
    RetriesExhausted,
    Unknown,
}

impl ErrorCode {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "TRANSIENT" => Self::Transient,
            "PERMANENT" => Self::Permanent,
            "TIMEOUT" => Self::Timeout,
            "PANIC" => Self::Panic,
            "BAD_PAYLOAD" => Self::BadPayload,
            "HANDLER_NOT_FOUND" => Self::HandlerNotFound,
            "RETRIES_EXHAUSTED" => Self::RetriesExhausted,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "TRANSIENT",
            Self::Permanent => "PERMANENT",
            Self::Timeout => "TIMEOUT",
            Self::Panic => "PANIC",
            Self::BadPayload => "BAD_PAYLOAD",
            Self::HandlerNotFound => "HANDLER_NOT_FOUND",
            Self::RetriesExhausted => "RETRIES_EXHAUSTED",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Class used when the engine itself raises this code. Handler-raised
    /// errors carry their own class.
    pub fn default_class(&self) -> ErrorClass {
        match self {
            Self::Transient | Self::Timeout | Self::Panic | Self::Unknown => ErrorClass::Transient,
            Self::Permanent | Self::BadPayload | Self::HandlerNotFound | Self::RetriesExhausted => {
                ErrorClass::Permanent
            }
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn suggested_action(code: &str) -> &'static str {
    match ErrorCode::parse(code) {
        ErrorCode::Transient => "Retried with backoff. Check the downstream dependency if it keeps recurring.",
        ErrorCode::Permanent => "Not retried. Fix the input or the handler, then replay the job.",
        ErrorCode::Timeout => {
            "Increase the job timeout OR reduce the work per job. Check downstream latency."
        }
        ErrorCode::Panic => {
            "Investigate the crash. A deterministic panic should become a permanent error."
        }
        ErrorCode::BadPayload => {
            "Non-retryable. Payload does not match the handler schema. Fix the producer."
        }
        ErrorCode::HandlerNotFound => {
            "No worker has this handler registered. Deploy it, then replay the job."
        }
        ErrorCode::RetriesExhausted => {
            "Every attempt failed transiently. Check the dependency, then replay the job."
        }
        ErrorCode::Unknown => "Inspect the error message and worker logs.",
    }
}
