//! Location source: last known fix plus a push subscription, fed from config and a line feed.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use wearmaps_core::{Criteria, LocationSample};

const FEED_POLL: Duration = Duration::from_millis(500);

/// Where fixes come from.
pub trait LocationSource: Send + Sync + 'static {
    /// Most recent cached fix; may be stale or absent.
    fn last_known(&self, criteria: &Criteria) -> Option<LocationSample>;
    /// Push every new fix to the returned handle until it is dropped or cancelled.
    fn subscribe(&self) -> LocationSubscription;
}

/// Live subscription. Drop it (or call `cancel`) to stop receiving fixes.
pub struct LocationSubscription {
    rx: Option<mpsc::UnboundedReceiver<LocationSample>>,
}

impl LocationSubscription {
    /// Next fix, in publish order. `None` once cancelled or when the source goes away.
    pub async fn recv(&mut self) -> Option<LocationSample> {
        let rx = self.rx.as_mut()?;
        let sample = rx.recv().await;
        if sample.is_none() {
            self.rx = None;
        }
        sample
    }

    pub fn cancel(&mut self) {
        self.rx = None;
    }
}

#[derive(Default)]
struct FeedState {
    last: Option<LocationSample>,
    subscribers: Vec<mpsc::UnboundedSender<LocationSample>>,
}

/// Fix holder shared by the feed reader and every subscriber.
/// A subscriber gets every fix published after it subscribed, none coalesced.
#[derive(Clone)]
pub struct FeedLocation {
    state: Arc<Mutex<FeedState>>,
}

impl FeedLocation {
    pub fn new(initial: Option<LocationSample>) -> Self {
        Self {
            state: Arc::new(Mutex::new(FeedState {
                last: initial,
                subscribers: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn publish(&self, sample: LocationSample) {
        trace!(lat = sample.latitude, lon = sample.longitude, "fix published");
        let mut state = self.lock();
        state.last = Some(sample);
        state.subscribers.retain(|tx| tx.send(sample).is_ok());
    }
}

impl LocationSource for FeedLocation {
    fn last_known(&self, criteria: &Criteria) -> Option<LocationSample> {
        trace!(?criteria, "last known query");
        self.lock().last
    }

    fn subscribe(&self) -> LocationSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        LocationSubscription { rx: Some(rx) }
    }
}

/// Parse one feed line: "<lat> <lon>" or "<lat>,<lon>". Blank lines and `#` comments are skipped.
pub fn parse_feed_line(line: &str) -> Option<LocationSample> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut parts = line
        .split(|c: char| c == ',' || c.is_ascii_whitespace())
        .filter(|s| !s.is_empty());
    let lat: f64 = parts.next()?.parse().ok()?;
    let lon: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return None;
    }
    Some(LocationSample::new(lat, lon))
}

/// Follow `path` like `tail -f`, publishing every valid line. Returns only on I/O error.
pub async fn run_feed(path: &Path, feed: FeedLocation) -> std::io::Result<()> {
    let file = tokio::fs::File::open(path).await?;
    debug!(path = %path.display(), "following location feed");
    let mut lines = BufReader::new(file).lines();
    loop {
        match lines.next_line().await? {
            Some(line) => match parse_feed_line(&line) {
                Some(sample) => feed.publish(sample),
                None if line.trim().is_empty() || line.trim_start().starts_with('#') => {}
                None => warn!(line = %line, "ignoring bad location line"),
            },
            None => tokio::time::sleep(FEED_POLL).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_line_formats() {
        assert_eq!(
            parse_feed_line("37.422 -122.084"),
            Some(LocationSample::new(37.422, -122.084))
        );
        assert_eq!(
            parse_feed_line(" 1.5,2.5 "),
            Some(LocationSample::new(1.5, 2.5))
        );
        assert_eq!(parse_feed_line("# comment"), None);
        assert_eq!(parse_feed_line("1.0"), None);
        assert_eq!(parse_feed_line("1.0 2.0 3.0"), None);
        assert_eq!(parse_feed_line("91.0 0.0"), None);
        assert_eq!(parse_feed_line("NaN 0.0"), None);
    }

    #[test]
    fn last_known_reflects_latest_fix() {
        let feed = FeedLocation::new(None);
        assert_eq!(feed.last_known(&Criteria::default()), None);
        feed.publish(LocationSample::new(1.0, 2.0));
        feed.publish(LocationSample::new(3.0, 4.0));
        assert_eq!(
            feed.last_known(&Criteria::default()),
            Some(LocationSample::new(3.0, 4.0))
        );
    }

    #[tokio::test]
    async fn subscription_sees_only_new_fixes() {
        let feed = FeedLocation::new(Some(LocationSample::new(0.0, 0.0)));
        let mut sub = feed.subscribe();
        feed.publish(LocationSample::new(5.0, 6.0));
        assert_eq!(sub.recv().await, Some(LocationSample::new(5.0, 6.0)));
    }

    #[tokio::test]
    async fn subscription_yields_every_fix_in_order() {
        let feed = FeedLocation::new(None);
        let mut sub = feed.subscribe();
        for i in 0..5 {
            feed.publish(LocationSample::new(i as f64, 0.0));
        }
        for i in 0..5 {
            assert_eq!(sub.recv().await, Some(LocationSample::new(i as f64, 0.0)));
        }
    }

    #[tokio::test]
    async fn cancelled_subscription_ends() {
        let feed = FeedLocation::new(None);
        let mut sub = feed.subscribe();
        sub.cancel();
        feed.publish(LocationSample::new(5.0, 6.0));
        assert_eq!(sub.recv().await, None);
        assert!(feed.lock().subscribers.is_empty());
    }

    #[tokio::test]
    async fn subscription_ends_when_source_dropped() {
        let feed = FeedLocation::new(None);
        let mut sub = feed.subscribe();
        drop(feed);
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn feed_file_is_followed() {
        let path = std::env::temp_dir().join(format!("wearmaps-feed-{}", std::process::id()));
        std::fs::write(&path, "# fixes\n10.0 20.0\nbad line\n").unwrap();
        let feed = FeedLocation::new(None);
        let mut sub = feed.subscribe();
        let reader = tokio::spawn({
            let feed = feed.clone();
            let path = path.clone();
            async move { run_feed(&path, feed).await }
        });
        let sample = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap();
        assert_eq!(sample, Some(LocationSample::new(10.0, 20.0)));
        reader.abort();
        let _ = std::fs::remove_file(&path);
    }
}
