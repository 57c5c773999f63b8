use thiserror::Error;

/// Outcome of a GATT round-trip as reported by the OS stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    Unreachable,
    ProtocolError,
    AccessDenied,
}

#[derive(Debug, Error)]
pub enum BleError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("GATT communication failed with status {0:?}")]
    Communication(GattStatus),

    #[error("operation cancelled by shutdown")]
    Cancelled,

    #[error("payload of {len} bytes exceeds the {capacity}-byte value buffer")]
    PayloadTooLarge { len: usize, capacity: usize },

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("platform error: {0}")]
    Platform(String),
}

impl BleError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Maps a non-success status to an error; `Success` is `Ok`.
    pub fn check_status(status: GattStatus) -> Result<(), BleError> {
        match status {
            GattStatus::Success => Ok(()),
            other => Err(Self::Communication(other)),
        }
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Communication(GattStatus::Unreachable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_status() {
        assert!(BleError::check_status(GattStatus::Success).is_ok());
        let err = BleError::check_status(GattStatus::Unreachable).unwrap_err();
        assert!(err.is_unreachable());
        assert!(!BleError::Cancelled.is_unreachable());
    }

    #[test]
    fn test_payload_message() {
        let err = BleError::PayloadTooLarge {
            len: 600,
            capacity: 512,
        };
        assert_eq!(
            err.to_string(),
            "payload of 600 bytes exceeds the 512-byte value buffer"
        );
    }
}
