//! Host-driven API: RelayCore receives events from host, returns actions.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::error::RelayError;
use crate::identity::{DeviceId, Keypair, PeerNode};
use crate::location::{Criteria, LocationSample, LocationState};
use crate::protocol::{Command, ParseError, PeerMessage, Reply};
use crate::tile::{FetchError, TileRequest, TileResponse};
use crate::wire;

/// Relay behavior knobs the host may change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// Send a `failed` reply when a tile download fails, instead of staying silent.
    pub report_fetch_failures: bool,
    /// Criterion passed along with every last-known location query.
    pub criteria: Criteria,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            report_fetch_failures: true,
            criteria: Criteria::default(),
        }
    }
}

/// Peer channel state as seen by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    /// Deliver a framed `PeerMessage` to the peer.
    SendMessage(DeviceId, Vec<u8>),
    /// Download the tile and report back with `on_tile_fetched`.
    FetchTile(TileRequest),
    /// Query the last known fix and report back with `on_last_known`.
    QueryLocation(Criteria),
    /// Start pushing fixes with `on_location_changed`, no throttling.
    SubscribeLocation,
    UnsubscribeLocation,
    /// Bring the phone-side UI to the foreground.
    LaunchUi,
}

/// Relay coordinator. Host passes events; core returns actions.
pub struct RelayCore {
    keypair: Arc<Keypair>,
    config: RelayConfig,
    connection: ConnectionState,
    peer: Option<PeerNode>,
    location: LocationState,
}

impl RelayCore {
    pub fn new() -> Self {
        Self::with_keypair(Keypair::generate())
    }

    pub fn with_keypair(keypair: Keypair) -> Self {
        Self::with_config(keypair, RelayConfig::default())
    }

    pub fn with_config(keypair: Keypair, config: RelayConfig) -> Self {
        Self::with_shared_keypair(Arc::new(keypair), config)
    }

    /// Share the identity with a transport that runs the channel handshake.
    pub fn with_shared_keypair(keypair: Arc<Keypair>, config: RelayConfig) -> Self {
        Self {
            keypair,
            config,
            connection: ConnectionState::Disconnected,
            peer: None,
            location: LocationState::Idle,
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.keypair.device_id()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn location_state(&self) -> LocationState {
        self.location
    }

    pub fn current_peer(&self) -> Option<&PeerNode> {
        self.peer.as_ref()
    }

    pub fn set_peer(&mut self, node: PeerNode) {
        info!(peer = %node.id, name = %node.display_name, "found wearable");
        self.peer = Some(node);
    }

    pub fn clear_peer(&mut self) {
        if let Some(old) = self.peer.take() {
            debug!(peer = %old.id, "cleared wearable");
        }
    }

    /// Host started bringing the channel up.
    pub fn on_connecting(&mut self) {
        self.connection = ConnectionState::Connecting;
    }

    /// Channel is ready; `reachable` is the current set of connected nodes.
    pub fn on_connected(&mut self, reachable: &[PeerNode]) {
        debug!(reachable = reachable.len(), "channel connected");
        self.connection = ConnectionState::Connected;
        self.find_peer(reachable);
    }

    /// Pick the peer to talk to: first reachable node wins, none clears the cache.
    pub fn find_peer(&mut self, reachable: &[PeerNode]) {
        match reachable.first() {
            Some(node) => {
                if self.peer.as_ref() != Some(node) {
                    self.set_peer(node.clone());
                }
            }
            None => self.clear_peer(),
        }
    }

    /// A single node dropped off. Clears the cached peer if it was that node.
    pub fn on_peer_disconnected(&mut self, peer_id: DeviceId) {
        if self.peer.as_ref().map(|p| p.id) == Some(peer_id) {
            self.clear_peer();
        }
    }

    /// Whole channel went away (suspended or failed).
    pub fn on_connection_lost(&mut self) {
        debug!("channel lost");
        self.connection = ConnectionState::Disconnected;
        self.clear_peer();
    }

    /// Process a framed message from the channel.
    pub fn on_message_received(
        &mut self,
        from: DeviceId,
        frame: &[u8],
    ) -> Result<Vec<Action>, RelayError> {
        let (msg, _) = wire::decode_frame(frame)?;
        trace!(peer = %from, path = %msg.path, bytes = msg.data.len(), "message received");
        Ok(self.dispatch(&msg.path, &msg.data))
    }

    /// Route one command string. Malformed and unknown commands produce no actions.
    pub fn dispatch(&mut self, path: &str, payload: &[u8]) -> Vec<Action> {
        debug!(path = %path, bytes = payload.len(), "dispatch");
        let command = match Command::parse(path) {
            Ok(c) => c,
            Err(ParseError::UnknownVerb(verb)) => {
                debug!(verb = %verb, "ignoring unknown verb");
                return Vec::new();
            }
            Err(e) => {
                warn!(path = %path, error = %RelayError::from(e), "dropping command");
                return Vec::new();
            }
        };
        match command {
            Command::Get(request) => vec![Action::FetchTile(request)],
            Command::Locate => vec![Action::QueryLocation(self.config.criteria)],
            Command::Start => {
                if self.location == LocationState::Subscribed {
                    debug!("location updates already running");
                    return Vec::new();
                }
                self.location = LocationState::Subscribed;
                vec![Action::SubscribeLocation]
            }
            Command::Stop => {
                if self.location == LocationState::Idle {
                    return Vec::new();
                }
                self.location = LocationState::Idle;
                vec![Action::UnsubscribeLocation]
            }
            Command::LaunchUi => vec![Action::LaunchUi],
        }
    }

    /// Result of a `FetchTile` action.
    pub fn on_tile_fetched(
        &mut self,
        request: TileRequest,
        result: Result<Vec<u8>, FetchError>,
    ) -> Vec<Action> {
        match result {
            Ok(image) => {
                debug!(bytes = image.len(), zoom = request.zoom, "tile fetched");
                self.send(Reply::Tile(TileResponse { request, image }))
            }
            Err(e) => {
                warn!(error = %RelayError::from(e), "tile dropped");
                if self.config.report_fetch_failures {
                    self.send(Reply::TileFailed(request))
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Result of a `QueryLocation` action.
    pub fn on_last_known(&mut self, sample: Option<LocationSample>) -> Vec<Action> {
        match sample {
            Some(s) => {
                debug!(lat = s.latitude, lon = s.longitude, "last known location");
                self.send(Reply::Location(s))
            }
            None => {
                warn!(error = %RelayError::LocationUnavailable, "locate ignored");
                Vec::new()
            }
        }
    }

    /// Pushed fix from an active subscription.
    pub fn on_location_changed(&mut self, sample: LocationSample) -> Vec<Action> {
        if self.location != LocationState::Subscribed {
            trace!("fix arrived while idle");
            return Vec::new();
        }
        trace!(lat = sample.latitude, lon = sample.longitude, "location changed");
        self.send(Reply::Location(sample))
    }

    fn send(&self, reply: Reply) -> Vec<Action> {
        let msg: PeerMessage = reply.encode();
        let Some(peer) = &self.peer else {
            warn!(path = %msg.path, error = %RelayError::NoPeer, "message dropped");
            return Vec::new();
        };
        match wire::encode_frame(&msg) {
            Ok(frame) => vec![Action::SendMessage(peer.id, frame)],
            Err(e) => {
                warn!(path = %msg.path, error = %e, "message dropped");
                Vec::new()
            }
        }
    }
}

impl Default for RelayCore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watch() -> PeerNode {
        PeerNode::new(Keypair::generate().device_id(), "watch")
    }

    fn connected_core() -> (RelayCore, PeerNode) {
        let mut core = RelayCore::new();
        let node = watch();
        core.on_connecting();
        core.on_connected(std::slice::from_ref(&node));
        (core, node)
    }

    fn sent(actions: &[Action]) -> Vec<(DeviceId, PeerMessage)> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::SendMessage(to, frame) => {
                    Some((*to, wire::decode_frame(frame).unwrap().0))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn get_requests_tile_then_replies_with_image() {
        let (mut core, node) = connected_core();
        let actions = core.dispatch("get 3 5 37.422 -122.084 15", &[]);
        let request = match actions.as_slice() {
            [Action::FetchTile(r)] => *r,
            other => panic!("expected FetchTile, got {other:?}"),
        };
        assert_eq!((request.latitude, request.longitude, request.zoom), (37.422, -122.084, 15));

        let out = core.on_tile_fetched(request, Ok(vec![1, 2, 3]));
        let msgs = sent(&out);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].0, node.id);
        assert_eq!(msgs[0].1.path, "response 3 5 37.422000 -122.084000 15");
        assert_eq!(msgs[0].1.data, vec![1, 2, 3]);
    }

    #[test]
    fn malformed_get_fetches_nothing() {
        let (mut core, _) = connected_core();
        for path in [
            "get",
            "get 3 5 37.4 -122.0",
            "get 3 5 37.4 -122.0 15 1",
            "get a 5 37.4 -122.0 15",
            "get 3 5 north -122.0 15",
            "get 3 5 37.4 -122.0 15.5",
        ] {
            assert!(core.dispatch(path, &[]).is_empty(), "{path}");
        }
    }

    #[test]
    fn unknown_verb_is_a_no_op() {
        let (mut core, _) = connected_core();
        assert!(core.dispatch("bogus", &[]).is_empty());
        assert!(core.dispatch("", &[]).is_empty());
        assert_eq!(core.location_state(), LocationState::Idle);
    }

    #[test]
    fn fetch_failure_reports_failed_reply() {
        let (mut core, _) = connected_core();
        let request = TileRequest {
            row: 1,
            col: 2,
            latitude: 3.0,
            longitude: 4.0,
            zoom: 5,
        };
        let out = core.on_tile_fetched(request, Err(FetchError::Timeout(15)));
        let msgs = sent(&out);
        assert_eq!(msgs[0].1.path, "failed 1 2 3.000000 4.000000 5");
    }

    #[test]
    fn fetch_failure_silent_when_reporting_disabled() {
        let config = RelayConfig {
            report_fetch_failures: false,
            ..RelayConfig::default()
        };
        let mut core = RelayCore::with_config(Keypair::generate(), config);
        core.on_connected(&[watch()]);
        let request = TileRequest {
            row: 0,
            col: 0,
            latitude: 0.0,
            longitude: 0.0,
            zoom: 1,
        };
        let out = core.on_tile_fetched(request, Err(FetchError::Request("refused".into())));
        assert!(out.is_empty());
    }

    #[test]
    fn locate_without_fix_sends_nothing() {
        let (mut core, _) = connected_core();
        let actions = core.dispatch("locate", &[]);
        assert_eq!(actions, vec![Action::QueryLocation(Criteria::default())]);
        assert!(core.on_last_known(None).is_empty());
    }

    #[test]
    fn locate_with_fix_sends_location() {
        let (mut core, _) = connected_core();
        core.dispatch("locate", &[]);
        let msgs = sent(&core.on_last_known(Some(LocationSample::new(51.5074, -0.1278))));
        assert_eq!(msgs[0].1.path, "location 51.507400 -0.127800");
        assert!(msgs[0].1.data.is_empty());
    }

    #[test]
    fn start_streams_every_fix() {
        let (mut core, _) = connected_core();
        assert_eq!(core.dispatch("start", &[]), vec![Action::SubscribeLocation]);
        let fixes = [(1.0, 2.0), (1.5, 2.5), (-10.125, 100.0625)];
        let mut paths = Vec::new();
        for (lat, lon) in fixes {
            for (_, msg) in sent(&core.on_location_changed(LocationSample::new(lat, lon))) {
                paths.push(msg.path);
            }
        }
        assert_eq!(
            paths,
            vec![
                "location 1.000000 2.000000",
                "location 1.500000 2.500000",
                "location -10.125000 100.062500",
            ]
        );
    }

    #[test]
    fn stop_silences_further_fixes() {
        let (mut core, _) = connected_core();
        core.dispatch("start", &[]);
        assert_eq!(core.dispatch("stop", &[]), vec![Action::UnsubscribeLocation]);
        for i in 0..5 {
            let out = core.on_location_changed(LocationSample::new(i as f64, 0.0));
            assert!(out.is_empty());
        }
    }

    #[test]
    fn single_subscription_per_core() {
        let (mut core, _) = connected_core();
        assert_eq!(core.dispatch("start", &[]).len(), 1);
        assert!(core.dispatch("start", &[]).is_empty());
        assert_eq!(core.dispatch("stop", &[]).len(), 1);
        assert!(core.dispatch("stop", &[]).is_empty());
    }

    #[test]
    fn no_peer_means_no_send() {
        let mut core = RelayCore::new();
        core.dispatch("start", &[]);
        assert!(core.on_location_changed(LocationSample::new(1.0, 1.0)).is_empty());
        assert!(core.on_last_known(Some(LocationSample::new(1.0, 1.0))).is_empty());
    }

    #[test]
    fn first_reachable_peer_wins() {
        let mut core = RelayCore::new();
        let a = watch();
        let b = watch();
        core.on_connected(&[a.clone(), b.clone()]);
        assert_eq!(core.current_peer(), Some(&a));
        assert_eq!(core.connection_state(), ConnectionState::Connected);

        core.find_peer(&[b.clone()]);
        assert_eq!(core.current_peer(), Some(&b));
        core.find_peer(&[]);
        assert_eq!(core.current_peer(), None);
    }

    #[test]
    fn disconnect_clears_only_matching_peer() {
        let (mut core, node) = connected_core();
        core.on_peer_disconnected(watch().id);
        assert_eq!(core.current_peer(), Some(&node));
        core.on_peer_disconnected(node.id);
        assert_eq!(core.current_peer(), None);
    }

    #[test]
    fn connection_lost_resets_channel() {
        let (mut core, _) = connected_core();
        core.on_connection_lost();
        assert_eq!(core.connection_state(), ConnectionState::Disconnected);
        assert!(core.current_peer().is_none());
    }

    #[test]
    fn framed_message_is_dispatched() {
        let (mut core, node) = connected_core();
        let frame = wire::encode_frame(&PeerMessage::new("/start", Vec::new())).unwrap();
        let actions = core.on_message_received(node.id, &frame).unwrap();
        assert_eq!(actions, vec![Action::LaunchUi]);
        assert!(core.on_message_received(node.id, &frame[..3]).is_err());
    }
}
