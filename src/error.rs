//! Defines error handling constructs for causal broadcast.
//!
//! Registration conflicts fail fast and are returned to the caller. Routing faults caused by inbound traffic are
//! isolated per message: the event loop logs them and keeps serving every other registration. Network level faults
//! (loss, reordering, duplication) are never errors at all, they only delay delivery until anti-entropy repairs them.

use thiserror::Error;

use crate::message::{MessageKind, ProtocolId};

/// Error returned when registering or unregistering a protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A registration already exists for this protocol id.
    #[error("protocol '{0}' is already registered")]
    AlreadyRegistered(ProtocolId),
    /// No registration exists for this protocol id.
    #[error("protocol '{0}' is not registered")]
    NotRegistered(ProtocolId),
    /// The broadcast event loop is no longer running.
    #[error("broadcast runtime stopped")]
    Stopped,
}

/// Error raised while routing an inbound envelope to its registration.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// The envelope names a protocol with no registration.
    #[error("no registration for protocol '{0}'")]
    UnknownProtocol(ProtocolId),
    /// The envelope's type tag is not one of the known message kinds.
    #[error("unhandled message type {tag} for protocol '{protocol_id}'")]
    UnhandledMessageType {
        /// Protocol the envelope was addressed to.
        protocol_id: ProtocolId,
        /// Raw type tag found on the wire.
        tag: u8,
    },
    /// A body of this kind could not be decoded, or the answer to it could not be encoded.
    #[error("codec failure on {kind:?} for protocol '{protocol_id}': {source}")]
    Codec {
        /// Protocol the envelope was addressed to.
        protocol_id: ProtocolId,
        /// Kind of the message being handled.
        kind: MessageKind,
        /// Underlying codec failure.
        #[source]
        source: CodecError,
    },
    /// Delivering the message left the buffer in an inconsistent state.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Error returned by a registration handle.
#[derive(Debug, Error)]
pub enum BroadcastError {
    /// The broadcast event loop is no longer running.
    #[error("broadcast runtime stopped")]
    Stopped,
    /// The registration was removed before the command was handled.
    #[error("protocol '{0}' is not registered")]
    NotRegistered(ProtocolId),
    /// The payload could not be encoded for the wire.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Internal invariant violation detected by the causal delivery scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The review loop kept making progress past its pass bound, which can only happen if readiness predicates form
    /// a dependency cycle.
    #[error("causal review stalled after {passes} passes with {buffered} messages buffered")]
    Stalled {
        /// Number of passes performed.
        passes: usize,
        /// Messages still buffered when the loop gave up.
        buffered: usize,
    },
}

/// An error that occurs while encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    /// Deserialization failed.
    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}
