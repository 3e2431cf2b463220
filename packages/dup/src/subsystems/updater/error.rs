use thiserror::Error;

use crate::apis::vmq::VmqError;
use crate::queries::QueriesError;
use crate::subsystems::events::EventsError;
use crate::subsystems::tracker::TrackerError;

/// Infrastructure failures. Any of these crashes the actor so the tracker
/// requeues the in-flight messages.
#[derive(Error, Debug)]
pub enum UpdaterError {
    #[error(transparent)]
    Queries(#[from] QueriesError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Events(#[from] EventsError),
    #[error(transparent)]
    Vmq(#[from] VmqError),
    #[error("device inbox closed")]
    InboxClosed,
}

/// Payload violations. These discard the message and ask the device for a
/// clean session; they never crash the actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageViolation {
    InvalidPath,
    MappingNotFound,
    GuessedEndpoints,
    CannotWriteOnServerOwnedInterface,
    InterfaceLoadingFailed,
    UndecodableBsonPayload,
    UnexpectedValueType,
    UnexpectedObjectKey,
    ValueSizeExceeded,
    InvalidIntrospection,
    InvalidProperties,
    UnexpectedControlMessage,
}

impl MessageViolation {
    pub fn error_name(&self) -> &'static str {
        match self {
            MessageViolation::InvalidPath => "invalid_path",
            MessageViolation::MappingNotFound => "mapping_not_found",
            MessageViolation::GuessedEndpoints => "guessed_endpoints",
            MessageViolation::CannotWriteOnServerOwnedInterface => {
                "cannot_write_on_server_owned_interface"
            }
            MessageViolation::InterfaceLoadingFailed => "interface_loading_failed",
            MessageViolation::UndecodableBsonPayload => "undecodable_bson_payload",
            MessageViolation::UnexpectedValueType => "unexpected_value_type",
            MessageViolation::UnexpectedObjectKey => "unexpected_object_key",
            MessageViolation::ValueSizeExceeded => "value_size_exceeded",
            MessageViolation::InvalidIntrospection => "invalid_introspection",
            MessageViolation::InvalidProperties => "invalid_properties",
            MessageViolation::UnexpectedControlMessage => "unexpected_control_message",
        }
    }
}

/// Volatile trigger installation failures, reported back to the caller.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum VolatileTriggerError {
    #[error("trigger references an interface this device does not have")]
    InterfaceNotFound,
    #[error("match path does not resolve to any endpoint")]
    InvalidMatchPath,
    #[error("path-specific data triggers require individual aggregation")]
    ObjectAggregation,
    #[error("no such volatile trigger")]
    NotFound,
}
