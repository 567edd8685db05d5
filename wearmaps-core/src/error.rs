//! Relay error taxonomy. Every kind is logged where it happens; none reach the peer
//! except a fetch failure, which can be reported as a `failed` reply.

use crate::protocol::ParseError;
use crate::tile::FetchError;
use crate::wire::FrameDecodeError;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("malformed command: {0}")]
    Parse(#[from] ParseError),
    #[error("tile fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("no peer to send to")]
    NoPeer,
    #[error("no location fix available")]
    LocationUnavailable,
    #[error("bad frame: {0}")]
    Frame(#[from] FrameDecodeError),
}
