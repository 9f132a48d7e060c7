#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unused_must_use)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod anti_entropy;
pub mod broadcast;
pub mod buffer;
pub mod causality;
pub mod codec;
pub mod config;
pub mod error;
pub mod gossip;
pub mod message;
pub mod overlay;
pub mod registration;
pub mod registry;
pub mod subscription;

#[cfg(test)]
mod test_helpers;

pub use anti_entropy::AntiEntropyObserved;
pub use broadcast::{BroadcastHandle, CausalBroadcast};
pub use causality::{CausalityOracle, Dependencies, Dot, VersionVector};
pub use codec::Envelope;
pub use config::{AntiEntropyScope, BroadcastConfig};
pub use error::{BroadcastError, CodecError, DeliveryError, RegistryError, RoutingError};
pub use message::{MessageKind, ProtocolId};
pub use overlay::{OverlayEvent, PeerId, PeerSampling};
pub use registration::{Payload, ProtocolRegistration, RegistrationStats};
pub use registry::ProtocolRegistry;
pub use subscription::SubscriptionId;
