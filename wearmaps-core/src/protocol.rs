//! WearMaps peer protocol: command and reply types and their string encoding.
//!
//! Every message on the peer channel is a [`PeerMessage`]: a whitespace-delimited
//! command string (the "path") plus an opaque payload. [`Command`] and [`Reply`]
//! are the typed view of those strings; parsing and encoding happen only here.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::location::LocationSample;
use crate::tile::{TileRequest, TileResponse};

/// Current protocol version. Used in the channel handshake.
pub const PROTOCOL_VERSION: u8 = 1;

const VERB_GET: &str = "get";
const VERB_LOCATE: &str = "locate";
const VERB_START: &str = "start";
const VERB_STOP: &str = "stop";
const VERB_LAUNCH_UI: &str = "/start";
const VERB_RESPONSE: &str = "response";
const VERB_LOCATION: &str = "location";
const VERB_FAILED: &str = "failed";

/// The unit carried by the peer channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerMessage {
    pub path: String,
    pub data: Vec<u8>,
}

impl PeerMessage {
    pub fn new(path: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            data,
        }
    }
}

/// Inbound request from the wearable.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `get <row> <col> <lat> <lon> <zoom>`: fetch one map tile.
    Get(TileRequest),
    /// `locate`: one-shot last known location.
    Locate,
    /// `start`: begin streaming location updates.
    Start,
    /// `stop`: end streaming location updates.
    Stop,
    /// `/start`: bring the phone-side UI to the foreground.
    LaunchUi,
}

impl Command {
    pub fn parse(path: &str) -> Result<Self, ParseError> {
        let mut tokens = Tokens::new(path)?;
        let cmd = match tokens.verb {
            VERB_GET => Command::Get(tokens.tile_request(VERB_GET)?),
            VERB_LOCATE => Command::Locate,
            VERB_START => Command::Start,
            VERB_STOP => Command::Stop,
            VERB_LAUNCH_UI => Command::LaunchUi,
            other => return Err(ParseError::UnknownVerb(other.to_string())),
        };
        tokens.finish()?;
        Ok(cmd)
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Command::Get(_) => VERB_GET,
            Command::Locate => VERB_LOCATE,
            Command::Start => VERB_START,
            Command::Stop => VERB_STOP,
            Command::LaunchUi => VERB_LAUNCH_UI,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Command::Get(req) => format!("{} {}", VERB_GET, encode_tile_args(req)),
            other => other.verb().to_string(),
        }
    }
}

impl FromStr for Command {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::parse(s)
    }
}

/// Outbound message to the wearable.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `response <row> <col> <lat> <lon> <zoom>` with the image as payload.
    Tile(TileResponse),
    /// `location <lat> <lon>`, no payload.
    Location(LocationSample),
    /// `failed <row> <col> <lat> <lon> <zoom>`: the tile could not be fetched.
    TileFailed(TileRequest),
}

impl Reply {
    pub fn encode(&self) -> PeerMessage {
        match self {
            Reply::Tile(resp) => PeerMessage::new(
                format!("{} {}", VERB_RESPONSE, encode_tile_args(&resp.request)),
                resp.image.clone(),
            ),
            Reply::Location(sample) => PeerMessage::new(
                format!(
                    "{} {:.6} {:.6}",
                    VERB_LOCATION, sample.latitude, sample.longitude
                ),
                Vec::new(),
            ),
            Reply::TileFailed(req) => PeerMessage::new(
                format!("{} {}", VERB_FAILED, encode_tile_args(req)),
                Vec::new(),
            ),
        }
    }

    /// Wearable-side decode of a reply.
    pub fn parse(msg: &PeerMessage) -> Result<Self, ParseError> {
        let mut tokens = Tokens::new(&msg.path)?;
        let reply = match tokens.verb {
            VERB_RESPONSE => Reply::Tile(TileResponse {
                request: tokens.tile_request(VERB_RESPONSE)?,
                image: msg.data.clone(),
            }),
            VERB_FAILED => Reply::TileFailed(tokens.tile_request(VERB_FAILED)?),
            VERB_LOCATION => {
                tokens.expect_count(VERB_LOCATION, 2)?;
                Reply::Location(LocationSample {
                    latitude: tokens.next_float()?,
                    longitude: tokens.next_float()?,
                })
            }
            other => return Err(ParseError::UnknownVerb(other.to_string())),
        };
        tokens.finish()?;
        Ok(reply)
    }
}

fn encode_tile_args(req: &TileRequest) -> String {
    format!(
        "{} {} {:.6} {:.6} {}",
        req.row, req.col, req.latitude, req.longitude, req.zoom
    )
}

/// Malformed command string.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown verb {0:?}")]
    UnknownVerb(String),
    #[error("{verb}: expected {expected} arguments, found {found}")]
    Arity {
        verb: String,
        expected: usize,
        found: usize,
    },
    #[error("argument {index} is not valid: {token:?}")]
    InvalidArgument { index: usize, token: String },
}

struct Tokens<'a> {
    verb: &'a str,
    args: Vec<&'a str>,
    pos: usize,
}

impl<'a> Tokens<'a> {
    fn new(path: &'a str) -> Result<Self, ParseError> {
        let mut it = path.split_ascii_whitespace();
        let verb = it.next().ok_or(ParseError::Empty)?;
        Ok(Self {
            verb,
            args: it.collect(),
            pos: 0,
        })
    }

    fn expect_count(&self, verb: &str, expected: usize) -> Result<(), ParseError> {
        if self.args.len() != expected {
            return Err(ParseError::Arity {
                verb: verb.to_string(),
                expected,
                found: self.args.len(),
            });
        }
        Ok(())
    }

    fn finish(&self) -> Result<(), ParseError> {
        if self.pos != self.args.len() {
            return Err(ParseError::Arity {
                verb: self.verb.to_string(),
                expected: self.pos,
                found: self.args.len(),
            });
        }
        Ok(())
    }

    fn next_raw(&mut self) -> &'a str {
        let token = self.args[self.pos];
        self.pos += 1;
        token
    }

    fn next_parsed<T: FromStr>(&mut self) -> Result<T, ParseError> {
        let index = self.pos;
        let token = self.next_raw();
        token.parse().map_err(|_| ParseError::InvalidArgument {
            index,
            token: token.to_string(),
        })
    }

    fn next_float(&mut self) -> Result<f64, ParseError> {
        let index = self.pos;
        let value: f64 = self.next_parsed()?;
        if !value.is_finite() {
            return Err(ParseError::InvalidArgument {
                index,
                token: self.args[index].to_string(),
            });
        }
        Ok(value)
    }

    fn tile_request(&mut self, verb: &str) -> Result<TileRequest, ParseError> {
        self.expect_count(verb, 5)?;
        Ok(TileRequest {
            row: self.next_parsed()?,
            col: self.next_parsed()?,
            latitude: self.next_float()?,
            longitude: self.next_float()?,
            zoom: self.next_parsed()?,
        })
    }
}
