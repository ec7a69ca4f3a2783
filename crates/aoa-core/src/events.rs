//! Events delivered to application code.
//!
//! The connection never calls application code directly; everything it has
//! to say goes through an `EventSink` on the connection's worker thread.

use std::fmt;
use std::sync::mpsc;

use crate::identity::IdentityField;

/// Events emitted by an `AccessoryConnection`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// Bytes read from the accessory, exactly as many as the read returned.
    RawData(Vec<u8>),
    /// No accessory is attached.
    NotConnected,
    /// The accessory was detached while in use.
    Detached,
    /// The user refused access to the accessory.
    PermissionDenied,
    /// The attached accessory is not the expected one.
    IdentityMismatch { field: IdentityField, reason: String },
    /// Opening or reading the accessory failed; the connection is over.
    IoFailure(String),
}

impl InboundEvent {
    pub const CODE_RAW_DATA: i32 = -1;
    pub const CODE_NOT_CONNECTED: i32 = -2;
    pub const CODE_DETACHED: i32 = -3;
    pub const CODE_PERMISSION_DENIED: i32 = -4;
    pub const CODE_IDENTITY_MISMATCH: i32 = -5;
    pub const CODE_IO_FAILURE: i32 = -6;

    pub(crate) fn identity_mismatch(field: IdentityField) -> Self {
        InboundEvent::IdentityMismatch {
            field,
            reason: field.mismatch_reason().to_string(),
        }
    }

    /// Stable numeric code, for bridging to message-code based hosts.
    pub fn code(&self) -> i32 {
        match self {
            InboundEvent::RawData(_) => Self::CODE_RAW_DATA,
            InboundEvent::NotConnected => Self::CODE_NOT_CONNECTED,
            InboundEvent::Detached => Self::CODE_DETACHED,
            InboundEvent::PermissionDenied => Self::CODE_PERMISSION_DENIED,
            InboundEvent::IdentityMismatch { .. } => Self::CODE_IDENTITY_MISMATCH,
            InboundEvent::IoFailure(_) => Self::CODE_IO_FAILURE,
        }
    }
}

impl fmt::Display for InboundEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InboundEvent::RawData(data) => write!(f, "Raw data ({} bytes)", data.len()),
            InboundEvent::NotConnected => write!(f, "Not connected"),
            InboundEvent::Detached => write!(f, "Detached"),
            InboundEvent::PermissionDenied => write!(f, "Permission denied"),
            InboundEvent::IdentityMismatch { reason, .. } => write!(f, "{}", reason),
            InboundEvent::IoFailure(reason) => write!(f, "I/O failure: {}", reason),
        }
    }
}

/// Receiver of connection events.
///
/// Called on the connection's worker thread. Implementations that need the
/// events elsewhere should hand them off (see `ChannelSink`).
pub trait EventSink: Send + Sync {
    fn accept(&self, event: InboundEvent);
}

/// Default sink: reports every event as a warning, since nobody handles it.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn accept(&self, event: InboundEvent) {
        match &event {
            InboundEvent::RawData(data) => {
                tracing::warn!(
                    code = event.code(),
                    data = ?data,
                    "Default event sink, install your own; raw data"
                );
            }
            _ => {
                tracing::warn!(
                    code = event.code(),
                    event = %event,
                    "Default event sink, install your own"
                );
            }
        }
    }
}

/// Sink that discards all events.
pub struct NullSink;

impl EventSink for NullSink {
    fn accept(&self, _event: InboundEvent) {}
}

/// Sink that forwards events to a channel receiver.
pub struct ChannelSink {
    sender: mpsc::Sender<InboundEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::Receiver<InboundEvent>) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelSink {
    fn accept(&self, event: InboundEvent) {
        if self.sender.send(event).is_err() {
            tracing::debug!("Event receiver dropped, discarding event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_codes() {
        assert_eq!(InboundEvent::RawData(vec![1]).code(), -1);
        assert_eq!(InboundEvent::NotConnected.code(), -2);
        assert_eq!(InboundEvent::Detached.code(), -3);
        assert_eq!(InboundEvent::PermissionDenied.code(), -4);
        assert_eq!(
            InboundEvent::identity_mismatch(IdentityField::Model).code(),
            -5
        );
        assert_eq!(InboundEvent::IoFailure("eof".into()).code(), -6);
    }

    #[test]
    fn test_identity_mismatch_carries_reason() {
        let event = InboundEvent::identity_mismatch(IdentityField::Version);
        assert_eq!(event.to_string(), "Version is not matched!");
    }

    #[test]
    fn test_channel_sink_forwards() {
        let (sink, rx) = ChannelSink::new();
        sink.accept(InboundEvent::Detached);
        assert_eq!(rx.recv().unwrap(), InboundEvent::Detached);

        drop(rx);
        // Must not panic once the receiver is gone.
        sink.accept(InboundEvent::NotConnected);
    }
}
