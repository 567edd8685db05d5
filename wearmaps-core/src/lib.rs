//! WearMaps relay core.
//! Host-driven: no I/O; host passes peer messages, fetch results and location fixes,
//! and receives actions.

pub mod core;
pub mod error;
pub mod ffi;
pub mod identity;
pub mod location;
pub mod protocol;
pub mod tile;
pub mod wire;

pub use crate::core::{Action, ConnectionState, RelayConfig, RelayCore};
pub use error::RelayError;
pub use identity::{DeviceId, Handshake, HandshakeHeader, Keypair, PeerNode, PublicKey, Salt};
pub use location::{Criteria, LocationSample, LocationState};
pub use protocol::{Command, ParseError, PeerMessage, Reply, PROTOCOL_VERSION};
pub use tile::{FetchError, StaticMapSource, TileRequest, TileResponse};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
