#![deny(unsafe_code)]

//! MQTT v3.1.1 control packet codec for a client engine.
//!
//! Implements exactly the packet set a clean-session MQTT 3.1.1 client exchanges
//! with a broker: CONNECT/CONNACK, SUBSCRIBE/SUBACK, PUBLISH and its QoS 1/2
//! acknowledgement family, PINGREQ/PINGRESP and DISCONNECT. Encoding and decoding
//! are stateless per call; framing state (fixed header, then body) lives in
//! [`Codec`], which plugs into `tokio_util::codec::Framed`.
//!
//! Decoding is symmetric (client-to-server packets decode too), which lets tests
//! run a mock broker over the same codec.

#[macro_use]
mod utils;

mod codec;
mod decode;
mod encode;
mod packet;

/// Error types for encoding/decoding operations
pub mod error;

/// Shared types and constants for the MQTT v3.1.1 wire format
pub mod types;

pub use self::codec::Codec;
pub use self::packet::{Connect, ConnectAck, ConnectAckReason, Packet, SubscribeReturnCode};
pub use self::types::{ConnectAckFlags, ConnectFlags, Publish, QoS};
