//! Event loop: the only owner of `RelayCore`. Transport, fetch and location tasks post
//! events here; actions returned by the core are carried out here.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};
use wearmaps_core::{
    Action, Criteria, DeviceId, FetchError, LocationSample, PeerNode, RelayCore, TileRequest,
};

use crate::fetcher::TileFetcher;
use crate::launcher::Launcher;
use crate::location::LocationSource;
use crate::transport::{self, PeerSenders};

/// Something the core must react to.
#[derive(Debug)]
pub enum Event {
    /// A node finished its handshake. Carries the reachable set, in connection order.
    Connected(Vec<PeerNode>),
    /// A node went away. Carries what is still reachable.
    Disconnected(DeviceId, Vec<PeerNode>),
    /// Decrypted frame from a node.
    Message(DeviceId, Vec<u8>),
    TileFetched(TileRequest, Result<Vec<u8>, FetchError>),
    LastKnown(Option<LocationSample>),
    LocationChanged(LocationSample),
}

pub struct Relay<F, L> {
    core: RelayCore,
    fetcher: Arc<F>,
    location: Arc<L>,
    launcher: Launcher,
    senders: PeerSenders,
    events: mpsc::UnboundedSender<Event>,
    subscription: Option<AbortHandle>,
}

impl<F: TileFetcher, L: LocationSource> Relay<F, L> {
    pub fn new(
        core: RelayCore,
        fetcher: Arc<F>,
        location: Arc<L>,
        launcher: Launcher,
        senders: PeerSenders,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            core,
            fetcher,
            location,
            launcher,
            senders,
            events,
            subscription: None,
        }
    }

    #[cfg(test)]
    pub fn core(&self) -> &RelayCore {
        &self.core
    }

    /// Process events until every sender is gone.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = rx.recv().await {
            self.handle(event).await;
        }
        self.stop_subscription();
    }

    pub async fn handle(&mut self, event: Event) {
        let actions = match event {
            Event::Connected(reachable) => {
                self.core.on_connected(&reachable);
                Vec::new()
            }
            Event::Disconnected(peer_id, reachable) => {
                self.core.on_peer_disconnected(peer_id);
                if reachable.is_empty() {
                    self.core.on_connection_lost();
                } else {
                    self.core.find_peer(&reachable);
                }
                Vec::new()
            }
            Event::Message(from, frame) => match self.core.on_message_received(from, &frame) {
                Ok(actions) => actions,
                Err(e) => {
                    warn!(peer = %from, error = %e, "dropping frame");
                    Vec::new()
                }
            },
            Event::TileFetched(request, result) => self.core.on_tile_fetched(request, result),
            Event::LastKnown(sample) => self.core.on_last_known(sample),
            Event::LocationChanged(sample) => self.core.on_location_changed(sample),
        };
        for action in actions {
            self.perform(action).await;
        }
    }

    async fn perform(&mut self, action: Action) {
        match action {
            Action::SendMessage(peer_id, frame) => self.send(peer_id, frame).await,
            Action::FetchTile(request) => self.spawn_fetch(request),
            Action::QueryLocation(criteria) => self.query_location(criteria),
            Action::SubscribeLocation => self.start_subscription(),
            Action::UnsubscribeLocation => self.stop_subscription(),
            Action::LaunchUi => {
                if let Err(e) = self.launcher.launch() {
                    warn!(error = %e, "UI launch failed");
                }
            }
        }
    }

    async fn send(&self, peer_id: DeviceId, frame: Vec<u8>) {
        let senders = self.senders.lock().await;
        match transport::sender_for(&senders, peer_id) {
            Some(tx) => {
                if tx.send(frame).is_err() {
                    warn!(peer = %peer_id, "send failed, connection closing");
                }
            }
            None => warn!(peer = %peer_id, "send failed, peer not connected"),
        }
    }

    fn spawn_fetch(&self, request: TileRequest) {
        let fetcher = self.fetcher.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = fetcher
                .fetch(request.latitude, request.longitude, request.zoom)
                .await;
            let _ = events.send(Event::TileFetched(request, result));
        });
    }

    fn query_location(&self, criteria: Criteria) {
        let sample = self.location.last_known(&criteria);
        let _ = self.events.send(Event::LastKnown(sample));
    }

    fn start_subscription(&mut self) {
        self.stop_subscription();
        let mut sub = self.location.subscribe();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            while let Some(sample) = sub.recv().await {
                if events.send(Event::LocationChanged(sample)).is_err() {
                    sub.cancel();
                }
            }
        });
        debug!("location updates started");
        self.subscription = Some(task.abort_handle());
    }

    fn stop_subscription(&mut self) {
        if let Some(handle) = self.subscription.take() {
            handle.abort();
            debug!("location updates stopped");
        }
    }
}
