use crate::error::{FillError, TileFetchError};
use shared::tiles::{BoundingBox, TileKey, TileStore, tile_ranges};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

/// Upstream provider of tile images.
pub trait TileSource {
    fn fetch(&self, key: TileKey) -> impl Future<Output = Result<Vec<u8>, TileFetchError>> + Send;
}

pub struct HttpTileSource {
    client: reqwest::Client,
    url_template: String,
}

impl HttpTileSource {
    pub fn new(
        url_template: impl Into<String>,
        user_agent: &str,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url_template: url_template.into(),
        })
    }

    pub fn url(&self, key: TileKey) -> String {
        self.url_template
            .replace("{z}", &key.zoom.to_string())
            .replace("{x}", &key.x.to_string())
            .replace("{y}", &key.y.to_string())
    }
}

impl TileSource for HttpTileSource {
    async fn fetch(&self, key: TileKey) -> Result<Vec<u8>, TileFetchError> {
        let response = self.client.get(self.url(key)).send().await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(TileFetchError::Status(status));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileOutcome {
    /// Already present in the store; no request was made.
    Cached,
    Fetched { bytes: usize },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileEvent {
    pub key: TileKey,
    pub outcome: TileOutcome,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FillSummary {
    pub fetched: u64,
    pub cached: u64,
    pub failures: Vec<(TileKey, String)>,
}

pub struct TileFetcher<S> {
    source: S,
    store: TileStore,
    min_delay: Duration,
}

impl<S: TileSource> TileFetcher<S> {
    pub fn new(source: S, store: TileStore, min_delay: Duration) -> Self {
        Self {
            source,
            store,
            min_delay,
        }
    }

    pub fn store(&self) -> &TileStore {
        &self.store
    }

    /// Downloads every tile covering `bbox` at each of `zooms` that the store
    /// does not already hold. Upstream requests run one at a time with at least
    /// `min_delay` between one request completing and the next starting.
    ///
    /// Per-tile fetch failures are recorded and skipped; a store write failure
    /// ends the fill.
    pub async fn fill(
        &self,
        bbox: &BoundingBox,
        zooms: &[u8],
        events: Option<&UnboundedSender<TileEvent>>,
    ) -> Result<FillSummary, FillError> {
        let ranges = tile_ranges(bbox, zooms)?;
        let mut summary = FillSummary::default();
        let mut last_request: Option<Instant> = None;

        for range in ranges {
            info!(
                name: "fill.zoom.started",
                zoom = range.zoom(),
                x = ?range.x(),
                y = ?range.y(),
                tiles = range.len(),
                "filling zoom level"
            );
            for key in range.keys() {
                let outcome = self.fill_tile(key, &mut last_request).await?;
                match &outcome {
                    TileOutcome::Cached => summary.cached += 1,
                    TileOutcome::Fetched { .. } => summary.fetched += 1,
                    TileOutcome::Failed(reason) => summary.failures.push((key, reason.clone())),
                }
                if let Some(events) = events {
                    // a reporter that has gone away does not stop the fill
                    let _ = events.send(TileEvent { key, outcome });
                }
            }
        }

        Ok(summary)
    }

    async fn fill_tile(
        &self,
        key: TileKey,
        last_request: &mut Option<Instant>,
    ) -> Result<TileOutcome, FillError> {
        let store_error = |source| FillError::Store { key, source };
        if self.store.exists(key).await.map_err(store_error)? {
            debug!(%key, "tile already cached");
            return Ok(TileOutcome::Cached);
        }

        if let Some(last) = *last_request {
            sleep_until(last + self.min_delay).await;
        }
        let fetched = self.source.fetch(key).await;
        *last_request = Some(Instant::now());

        match fetched {
            Ok(bytes) => {
                self.store.put(key, &bytes).await.map_err(store_error)?;
                debug!(%key, bytes = bytes.len(), "stored tile");
                Ok(TileOutcome::Fetched { bytes: bytes.len() })
            }
            Err(e) => {
                warn!(name: "fill.tile.failed", %key, error = %e, "failed to fetch tile, skipping");
                Ok(TileOutcome::Failed(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Serves a fixed body for every tile except those listed as failing.
    #[derive(Clone, Default)]
    struct MockSource {
        requests: Arc<AtomicUsize>,
        started_at: Arc<Mutex<Vec<Instant>>>,
        failing: HashSet<TileKey>,
    }

    impl MockSource {
        fn requests(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }
    }

    impl TileSource for MockSource {
        async fn fetch(&self, key: TileKey) -> Result<Vec<u8>, TileFetchError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            self.started_at.lock().unwrap().push(Instant::now());
            if self.failing.contains(&key) {
                Err(TileFetchError::Status(reqwest::StatusCode::NOT_FOUND))
            } else {
                Ok(format!("tile {key}").into_bytes())
            }
        }
    }

    fn nyc() -> BoundingBox {
        BoundingBox::new(40.0, -74.1, 40.8, -73.9).unwrap()
    }

    #[tokio::test]
    async fn second_fill_issues_no_requests() {
        let dir = tempfile::tempdir().unwrap();
        let source = MockSource::default();
        let fetcher = TileFetcher::new(
            source.clone(),
            TileStore::new(dir.path(), "png"),
            Duration::ZERO,
        );

        let first = fetcher.fill(&nyc(), &[10], None).await.unwrap();
        assert_eq!(first.fetched, 4);
        assert_eq!(first.cached, 0);
        assert!(first.failures.is_empty());
        assert_eq!(source.requests(), 4);

        let second = fetcher.fill(&nyc(), &[10], None).await.unwrap();
        assert_eq!(second.fetched, 0);
        assert_eq!(second.cached, 4);
        assert_eq!(source.requests(), 4);
    }

    #[tokio::test]
    async fn failed_tiles_are_reported_and_retried_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let broken = TileKey::new(10, 301, 385);
        let source = MockSource {
            failing: HashSet::from([broken]),
            ..MockSource::default()
        };
        let store = TileStore::new(dir.path(), "png");
        let fetcher = TileFetcher::new(source.clone(), store.clone(), Duration::ZERO);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let summary = fetcher.fill(&nyc(), &[10], Some(&tx)).await.unwrap();
        drop(tx);

        assert_eq!(summary.fetched, 3);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].0, broken);
        assert!(!store.exists(broken).await.unwrap());

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        let keys: Vec<_> = events.iter().map(|e| e.key).collect();
        assert_eq!(
            keys,
            (384..=387).map(|y| TileKey::new(10, 301, y)).collect::<Vec<_>>()
        );
        assert!(matches!(events[1].outcome, TileOutcome::Failed(_)));
        assert_eq!(events[0].outcome, TileOutcome::Fetched { bytes: 15 });

        // only the missing tile is requested again
        let rerun = fetcher.fill(&nyc(), &[10], None).await.unwrap();
        assert_eq!(rerun.cached, 3);
        assert_eq!(source.requests(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_are_spaced_by_the_politeness_delay() {
        let dir = tempfile::tempdir().unwrap();
        let source = MockSource::default();
        let fetcher = TileFetcher::new(
            source.clone(),
            TileStore::new(dir.path(), "png"),
            Duration::from_millis(200),
        );

        fetcher.fill(&nyc(), &[10], None).await.unwrap();

        let started_at = source.started_at.lock().unwrap().clone();
        assert_eq!(started_at.len(), 4);
        for pair in started_at.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(200));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cached_tiles_are_not_throttled() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileStore::new(dir.path(), "png");
        for y in 384..=387 {
            store.put(TileKey::new(10, 301, y), b"cached").await.unwrap();
        }
        let fetcher = TileFetcher::new(MockSource::default(), store, Duration::from_secs(60));

        let start = Instant::now();
        let summary = fetcher.fill(&nyc(), &[10], None).await.unwrap();
        assert_eq!(summary.cached, 4);
        assert!(Instant::now() - start < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn store_failure_aborts_the_fill() {
        let dir = tempfile::tempdir().unwrap();
        // a plain file where the zoom directory should go
        std::fs::write(dir.path().join("10"), b"").unwrap();
        let fetcher = TileFetcher::new(
            MockSource::default(),
            TileStore::new(dir.path(), "png"),
            Duration::ZERO,
        );

        let result = fetcher.fill(&nyc(), &[10], None).await;
        assert!(matches!(result, Err(FillError::Store { .. })));
    }

    #[tokio::test]
    async fn empty_zoom_list_is_rejected_before_any_request() {
        let dir = tempfile::tempdir().unwrap();
        let source = MockSource::default();
        let fetcher = TileFetcher::new(
            source.clone(),
            TileStore::new(dir.path(), "png"),
            Duration::ZERO,
        );

        let result = fetcher.fill(&nyc(), &[], None).await;
        assert!(matches!(result, Err(FillError::Projection(_))));
        assert_eq!(source.requests(), 0);
    }

    #[test]
    fn url_template_is_filled_per_tile() {
        let source = HttpTileSource::new(
            "https://tile.example.org/{z}/{x}/{y}.png",
            "test-agent",
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(
            source.url(TileKey::new(10, 301, 385)),
            "https://tile.example.org/10/301/385.png"
        );
    }
}
