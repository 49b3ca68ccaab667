//! Error types for INDI client operations.

use thiserror::Error;

/// Errors returned by client, catalog, and codec operations.
#[derive(Debug, Error)]
pub enum IndiError {
    /// No device with the given name exists in the local catalog.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The device exists but has no property with the given name.
    #[error("property not found: {device}.{property}")]
    PropertyNotFound { device: String, property: String },

    /// The property exists but has no value with the given name.
    #[error("property value not found: {device}.{property}.{value}")]
    PropertyValueNotFound {
        device: String,
        property: String,
        value: String,
    },

    /// The BLOB value exists but is not armed (no bytes have been received
    /// since it was last read).
    #[error("blob not found: {device}.{property}.{value}")]
    BlobNotFound {
        device: String,
        property: String,
        value: String,
    },

    /// Attempt to change a read-only property.
    #[error("property is read only: {device}.{property}")]
    PropertyReadOnly { device: String, property: String },

    /// Attempt to change a property whose previous change has not resolved.
    #[error("property is busy: {device}.{property}")]
    PropertyBusy { device: String, property: String },

    /// `getProperties` named a property without naming a device.
    #[error("property specified without device")]
    PropertyWithoutDevice,

    /// Parallel name/value vectors passed to a set operation differ in length.
    #[error("mismatched lengths: {names} names, {values} values")]
    LengthMismatch { names: usize, values: usize },

    /// A BLOB enable mode other than Never, Also, or Only.
    #[error("invalid BlobEnable value: {0}")]
    InvalidBlobEnable(String),

    /// The server resolved a set operation to Alert.
    #[error("unable to set property: {device}.{property}")]
    PropertyAlert { device: String, property: String },

    /// A set operation saw no Ok/Alert resolution within the configured wait.
    #[error("timed out waiting for {device}.{property} to resolve after {seconds}s")]
    SetTimeout {
        device: String,
        property: String,
        seconds: u64,
    },

    /// The client has no live connection.
    #[error("not connected")]
    NotConnected,

    /// Dialing the transport failed.
    #[error("dial failed: {0}")]
    Dial(#[source] std::io::Error),

    /// The outbound queue is closed; the connection has been torn down.
    #[error("connection closed")]
    ConnectionClosed,

    /// The inbound stream ended or the transport failed mid-read.
    #[error("stream closed: {0}")]
    Stream(#[source] std::io::Error),

    /// The inbound bytes could not be tokenized or decoded as INDI XML.
    #[error("parse error: {0}")]
    Parse(String),

    /// Filesystem failure while persisting or reading a BLOB.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for INDI operations.
pub type IndiResult<T> = Result<T, IndiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IndiError::DeviceNotFound("Telescope Simulator".to_string());
        assert_eq!(err.to_string(), "device not found: Telescope Simulator");

        let err = IndiError::PropertyNotFound {
            device: "CCD Simulator".to_string(),
            property: "CCD_EXPOSURE".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "property not found: CCD Simulator.CCD_EXPOSURE"
        );

        let err = IndiError::LengthMismatch { names: 2, values: 3 };
        assert!(err.to_string().contains("2 names"));
        assert!(err.to_string().contains("3 values"));
    }

    #[test]
    fn test_set_timeout_display() {
        let err = IndiError::SetTimeout {
            device: "Focuser".to_string(),
            property: "ABS_FOCUS_POSITION".to_string(),
            seconds: 30,
        };
        let msg = err.to_string();
        assert!(msg.contains("Focuser"));
        assert!(msg.contains("ABS_FOCUS_POSITION"));
        assert!(msg.contains("30"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: IndiError = io.into();
        assert!(matches!(err, IndiError::Io(_)));
    }
}
