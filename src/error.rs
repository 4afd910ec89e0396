//! Error taxonomy for the polling engine.
//!
//! Mirrors `IndustrialError`: one flat enum grouped by concern, an
//! `error_code()` for structured logs, and `is_recoverable()` so the
//! supervisor can decide whether to back off a device or surface a hard
//! failure.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PollerError>;

#[derive(Debug, Error)]
pub enum PollerError {
    // Connection / transport errors (1xx)
    #[error("connection to {device} failed: {source}")]
    ConnectionFailed {
        device: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connection to {device} timed out after {timeout_ms}ms")]
    ConnectionTimeout { device: String, timeout_ms: u64 },
    #[error("device {device} is not connected")]
    NotConnected { device: String },

    // Protocol errors (2xx)
    #[error("modbus exception on {device}: function {function_code:#04x}, code {exception_code} ({message})")]
    ModbusException {
        device: String,
        function_code: u8,
        exception_code: u8,
        message: String,
    },
    #[error("operation on {device} timed out after {timeout_ms}ms")]
    ResponseTimeout { device: String, timeout_ms: u64 },
    #[error("invalid response from {device}: {reason}")]
    InvalidResponse { device: String, reason: String },
    #[error("transaction id mismatch on {device}: expected {expected}, got {actual}")]
    TransactionMismatch {
        device: String,
        expected: u16,
        actual: u16,
    },

    // Codec errors (3xx)
    #[error("codec length mismatch: expected {expected} words, got {actual}")]
    CodecLengthMismatch { expected: usize, actual: usize },
    #[error("value {value} out of range for encoding as {data_type}")]
    CodecEncodeRange { value: String, data_type: String },

    // Coercion errors (4xx)
    #[error("cannot coerce {value} to {data_type} for write")]
    WriteCoercion { value: String, data_type: String },
    #[error("tag {tag_id} is read-only on channel {channel}")]
    ReadOnlyTag { tag_id: i64, channel: String },

    // Configuration / invariant errors (5xx)
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
    #[error("device {device_id} not found")]
    DeviceNotFound { device_id: i64 },
    #[error("tag {tag_id} not found")]
    TagNotFound { tag_id: i64 },
    #[error("limit exceeded: {what} ({actual} > {limit})")]
    LimitExceeded {
        what: String,
        limit: usize,
        actual: usize,
    },

    // Persistence errors (6xx)
    #[error("persistence error: {reason}")]
    Persistence { reason: String },

    // Internal errors (9xx)
    #[error("internal error: {0}")]
    Internal(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("channel send failed")]
    ChannelSend,
}

impl PollerError {
    /// Stable numeric code for structured logging/metrics, grouped by
    /// hundreds the way `IndustrialError::error_code` is.
    pub fn error_code(&self) -> u16 {
        match self {
            Self::ConnectionFailed { .. } => 100,
            Self::ConnectionTimeout { .. } => 101,
            Self::NotConnected { .. } => 102,
            Self::ModbusException { .. } => 200,
            Self::ResponseTimeout { .. } => 201,
            Self::InvalidResponse { .. } => 202,
            Self::TransactionMismatch { .. } => 203,
            Self::CodecLengthMismatch { .. } => 300,
            Self::CodecEncodeRange { .. } => 301,
            Self::WriteCoercion { .. } => 400,
            Self::ReadOnlyTag { .. } => 401,
            Self::InvalidConfig { .. } => 500,
            Self::DeviceNotFound { .. } => 501,
            Self::TagNotFound { .. } => 502,
            Self::LimitExceeded { .. } => 503,
            Self::Persistence { .. } => 600,
            Self::Internal(_) => 900,
            Self::Io(_) => 901,
            Self::ChannelSend => 902,
        }
    }

    /// Whether the device supervisor should treat this as a transient
    /// fault eligible for backoff-and-retry, as opposed to a fault that
    /// will recur deterministically (bad config, malformed write).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. }
                | Self::ConnectionTimeout { .. }
                | Self::NotConnected { .. }
                | Self::ResponseTimeout { .. }
                | Self::Io(_)
        )
    }

    /// Builds a `ModbusException` from the exception code a device
    /// returned, filling in the standard MODBUS exception text.
    pub fn modbus_exception(device: impl Into<String>, function_code: u8, exception_code: u8) -> Self {
        let message = match exception_code {
            1 => "illegal function",
            2 => "illegal data address",
            3 => "illegal data value",
            4 => "slave device failure",
            5 => "acknowledge",
            6 => "slave device busy",
            _ => "unknown exception",
        };
        Self::ModbusException {
            device: device.into(),
            function_code,
            exception_code,
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_grouped_by_hundreds() {
        let e = PollerError::DeviceNotFound { device_id: 1 };
        assert_eq!(e.error_code(), 501);
    }

    #[test]
    fn recoverable_matches_transient_faults() {
        assert!(PollerError::NotConnected { device: "d1".into() }.is_recoverable());
        assert!(!PollerError::InvalidConfig { reason: "x".into() }.is_recoverable());
    }

    #[test]
    fn modbus_exception_maps_known_codes() {
        let e = PollerError::modbus_exception("d1", 0x03, 2);
        match e {
            PollerError::ModbusException { message, .. } => assert_eq!(message, "illegal data address"),
            _ => panic!("wrong variant"),
        }
    }
}
