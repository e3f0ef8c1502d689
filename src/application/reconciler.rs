use crate::domain::models::TimerSnapshot;
use crate::infrastructure::error::GatewayError;
use crate::infrastructure::export_parser::{ActiveInterval, active_interval, parse_export, recent_tags};
use crate::infrastructure::tracker_gateway::TrackerGateway;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_HISTORY_SEED_INTERVALS: usize = 50;

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub poll_interval: Duration,
    pub probe_interval: Duration,
    pub history_seed_intervals: usize,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            history_seed_intervals: DEFAULT_HISTORY_SEED_INTERVALS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilerState {
    Idle,
    Polling,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcilerStatus {
    pub state: ReconcilerState,
    pub binary_available: bool,
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct PollOutcome {
    sequence: u64,
    result: Result<Arc<TimerSnapshot>, GatewayError>,
}

#[derive(Debug)]
struct Health {
    binary_available: bool,
    last_error: Option<String>,
    last_success_at: Option<DateTime<Utc>>,
    last_probe_at: Option<Instant>,
    recent_tags: Vec<String>,
}

/// Keeps the published [`TimerSnapshot`] in line with the tracker's export.
///
/// The reconciler is the only writer of the snapshot. Each successful poll
/// builds a fresh value and swaps it into a watch channel in one step, so
/// readers see either the previous snapshot or the new one.
pub struct StateReconciler<G>
where
    G: TrackerGateway,
{
    gateway: Arc<G>,
    settings: ReconcilerSettings,
    snapshot_tx: watch::Sender<Arc<TimerSnapshot>>,
    poll_lock: tokio::sync::Mutex<()>,
    started_polls: AtomicU64,
    completed_polls: AtomicU64,
    last_outcome: Mutex<Option<PollOutcome>>,
    polling: AtomicBool,
    health: Mutex<Health>,
    now_provider: NowProvider,
}

impl<G> StateReconciler<G>
where
    G: TrackerGateway,
{
    pub fn new(gateway: Arc<G>) -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(TimerSnapshot::idle()));
        Self {
            gateway,
            settings: ReconcilerSettings::default(),
            snapshot_tx,
            poll_lock: tokio::sync::Mutex::new(()),
            started_polls: AtomicU64::new(0),
            completed_polls: AtomicU64::new(0),
            last_outcome: Mutex::new(None),
            polling: AtomicBool::new(false),
            health: Mutex::new(Health {
                binary_available: true,
                last_error: None,
                last_success_at: None,
                last_probe_at: None,
                recent_tags: Vec::new(),
            }),
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_settings(mut self, settings: ReconcilerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    pub fn current(&self) -> Arc<TimerSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<TimerSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    pub fn state(&self) -> ReconcilerState {
        if self.polling.load(Ordering::SeqCst) {
            ReconcilerState::Polling
        } else {
            ReconcilerState::Idle
        }
    }

    pub fn binary_available(&self) -> bool {
        self.health().binary_available
    }

    pub fn last_error(&self) -> Option<String> {
        self.health().last_error.clone()
    }

    pub fn status(&self) -> ReconcilerStatus {
        let health = self.health();
        ReconcilerStatus {
            state: self.state(),
            binary_available: health.binary_available,
            last_error: health.last_error.clone(),
            last_success_at: health.last_success_at,
        }
    }

    /// Tags of the most recent intervals seen in the last successful export.
    pub fn recent_tags(&self) -> Vec<String> {
        self.health().recent_tags.clone()
    }

    /// Polls the tracker now, or joins the poll already in flight.
    ///
    /// Callers that arrive while a poll is outstanding wait for it and receive
    /// its outcome instead of issuing a second export.
    pub async fn force_refresh(&self) -> Result<Arc<TimerSnapshot>, GatewayError> {
        let observed = self.completed_polls.load(Ordering::SeqCst);
        let _guard = self.poll_lock.lock().await;
        if self.completed_polls.load(Ordering::SeqCst) != observed {
            if let Some(outcome) = self.last_outcome() {
                return outcome.result;
            }
        }
        self.run_poll().await
    }

    /// Sequence number the next poll will start with.
    ///
    /// Read it after changing the tracker and pass it to [`Self::refresh_since`]
    /// to get a snapshot that reflects the change.
    pub fn poll_mark(&self) -> u64 {
        self.started_polls.load(Ordering::SeqCst)
    }

    /// Like [`Self::force_refresh`], but only shares a poll that started at or
    /// after `mark`. An older poll still in flight is waited out and followed
    /// by a fresh export.
    pub async fn refresh_since(&self, mark: u64) -> Result<Arc<TimerSnapshot>, GatewayError> {
        let _guard = self.poll_lock.lock().await;
        if let Some(outcome) = self.last_outcome() {
            if outcome.sequence >= mark {
                return outcome.result;
            }
        }
        self.run_poll().await
    }

    // Callers hold `poll_lock`.
    async fn run_poll(&self) -> Result<Arc<TimerSnapshot>, GatewayError> {
        let sequence = self.started_polls.fetch_add(1, Ordering::SeqCst);
        let result = {
            let _polling = PollingFlag::raise(&self.polling);
            self.poll_once().await
        };
        *self
            .last_outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(PollOutcome {
            sequence,
            result: result.clone(),
        });
        self.completed_polls.fetch_add(1, Ordering::SeqCst);
        result
    }

    /// Checks whether the tracker binary can be executed and updates the
    /// availability flag.
    pub async fn probe(&self) -> bool {
        let result = self.gateway.probe().await;
        let available = !matches!(result, Err(GatewayError::BinaryUnavailable));

        let mut health = self.health();
        health.last_probe_at = Some(Instant::now());
        if available != health.binary_available {
            if available {
                tracing::info!("tracker binary became available");
            } else {
                tracing::warn!("tracker binary is unavailable; export polling suspended");
            }
        }
        health.binary_available = available;
        if available {
            let unavailable = GatewayError::BinaryUnavailable.to_string();
            if health.last_error.as_deref() == Some(unavailable.as_str()) {
                health.last_error = None;
            }
        } else {
            health.last_error = Some(GatewayError::BinaryUnavailable.to_string());
        }
        available
    }

    /// Records a gateway failure observed outside the poll loop.
    pub fn note_gateway_error(&self, error: &GatewayError) {
        let mut health = self.health();
        if matches!(error, GatewayError::BinaryUnavailable) {
            if health.binary_available {
                tracing::warn!("tracker binary is unavailable; export polling suspended");
            }
            health.binary_available = false;
            health.last_probe_at = Some(Instant::now());
        }
        health.last_error = Some(error.to_string());
    }

    pub fn spawn_polling(self: &Arc<Self>) -> PollerHandle
    where
        G: 'static,
    {
        let reconciler = Arc::clone(self);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let period = self.settings.poll_interval;

        let task = tokio::spawn(async move {
            reconciler.probe().await;
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(error) = reconciler.force_refresh().await {
                            tracing::debug!(error = %error, "scheduled poll failed");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("poll loop stopped");
        });

        PollerHandle { shutdown_tx, task }
    }

    async fn poll_once(&self) -> Result<Arc<TimerSnapshot>, GatewayError> {
        if !self.binary_available() {
            if !self.probe_due() || !self.probe().await {
                return Err(GatewayError::BinaryUnavailable);
            }
        }

        let intervals = match self.gateway.export().await.and_then(|output| parse_export(&output)) {
            Ok(intervals) => intervals,
            Err(error) => {
                tracing::warn!(error = %error, "tracker export failed; keeping last snapshot");
                self.note_gateway_error(&error);
                return Err(error);
            }
        };

        let now = (self.now_provider)();
        let snapshot = match active_interval(&intervals) {
            ActiveInterval::None => TimerSnapshot::idle(),
            ActiveInterval::One(interval) => TimerSnapshot::from_interval(interval, now),
            ActiveInterval::Ambiguous(count) => {
                tracing::warn!(
                    open_intervals = count,
                    "tracker reports more than one open interval; treating timer as idle"
                );
                TimerSnapshot::idle()
            }
        };
        let snapshot = Arc::new(snapshot);
        self.snapshot_tx.send_replace(Arc::clone(&snapshot));

        let mut health = self.health();
        health.last_error = None;
        health.last_success_at = Some(now);
        health.recent_tags = recent_tags(&intervals, self.settings.history_seed_intervals);
        Ok(snapshot)
    }

    fn probe_due(&self) -> bool {
        match self.health().last_probe_at {
            Some(last) => last.elapsed() >= self.settings.probe_interval,
            None => true,
        }
    }

    fn last_outcome(&self) -> Option<PollOutcome> {
        self.last_outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn health(&self) -> MutexGuard<'_, Health> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn replace_snapshot(&self, snapshot: TimerSnapshot) {
        self.snapshot_tx.send_replace(Arc::new(snapshot));
    }
}

/// Lowers the polling flag even when the poll future is dropped midway.
struct PollingFlag<'a>(&'a AtomicBool);

impl<'a> PollingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for PollingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct PollerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(error) = self.task.await {
            tracing::warn!(error = %error, "poll loop task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::tracker_gateway::fakes::ScriptedTrackerGateway;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    const OPEN_EXPORT: &str =
        r#"[{"id":1,"start":"20260216T090000Z","tags":["work","project"]}]"#;

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn fixed_now(value: &str) -> NowProvider {
        let now = fixed_time(value);
        Arc::new(move || now)
    }

    fn reconciler_with(
        responses: Vec<Result<String, GatewayError>>,
    ) -> (Arc<ScriptedTrackerGateway>, StateReconciler<ScriptedTrackerGateway>) {
        let gateway = Arc::new(ScriptedTrackerGateway::with_responses(responses));
        let reconciler = StateReconciler::new(Arc::clone(&gateway))
            .with_now_provider(fixed_now("2026-02-16T09:10:00Z"));
        (gateway, reconciler)
    }

    /// Export blocks until the test hands out a permit.
    struct GatedGateway {
        gate: Semaphore,
        exports: AtomicUsize,
    }

    #[async_trait]
    impl TrackerGateway for GatedGateway {
        async fn run(&self, args: &[String]) -> Result<String, GatewayError> {
            if args.first().map(String::as_str) == Some("export") {
                self.exports.fetch_add(1, Ordering::SeqCst);
                let _permit = self.gate.acquire().await.expect("gate open");
            }
            Ok(OPEN_EXPORT.to_string())
        }
    }

    #[tokio::test]
    async fn refresh_publishes_active_snapshot() {
        let (gateway, reconciler) = reconciler_with(vec![Ok(OPEN_EXPORT.to_string())]);

        let snapshot = reconciler.force_refresh().await.expect("refresh succeeds");

        assert!(snapshot.active);
        assert_eq!(snapshot.id, "@1");
        assert_eq!(snapshot.tags, vec!["work", "project"]);
        assert_eq!(snapshot.started_at, Some(fixed_time("2026-02-16T09:00:00Z")));
        assert_eq!(snapshot.elapsed_seconds, 600);
        assert_eq!(*reconciler.current(), *snapshot);
        assert_eq!(gateway.calls_named("export"), 1);
        assert_eq!(reconciler.state(), ReconcilerState::Idle);
        assert_eq!(
            reconciler.status().last_success_at,
            Some(fixed_time("2026-02-16T09:10:00Z"))
        );
    }

    #[tokio::test]
    async fn refresh_publishes_idle_when_no_interval_is_open() {
        let (_, reconciler) = reconciler_with(vec![
            Ok(OPEN_EXPORT.to_string()),
            Ok(r#"[{"id":1,"start":"20260216T090000Z","end":"20260216T091000Z","tags":["work"]}]"#
                .to_string()),
        ]);

        reconciler.force_refresh().await.expect("first refresh");
        let snapshot = reconciler.force_refresh().await.expect("second refresh");

        assert_eq!(*snapshot, TimerSnapshot::idle());
        assert_eq!(reconciler.recent_tags(), vec!["work"]);
    }

    #[tokio::test]
    async fn multiple_open_intervals_are_treated_as_idle() {
        let (_, reconciler) = reconciler_with(vec![Ok(r#"[
            {"id":2,"start":"20260216T080000Z","tags":["a"]},
            {"id":1,"start":"20260216T090000Z","tags":["b"]}
        ]"#
        .to_string())]);

        let snapshot = reconciler.force_refresh().await.expect("refresh succeeds");
        assert_eq!(*snapshot, TimerSnapshot::idle());
        assert!(reconciler.last_error().is_none());
    }

    #[tokio::test]
    async fn failed_poll_keeps_last_known_snapshot() {
        let (_, reconciler) = reconciler_with(vec![
            Ok(OPEN_EXPORT.to_string()),
            Err(GatewayError::CommandFailed {
                exit_code: Some(1),
                stderr: "database locked".to_string(),
            }),
            Ok("not json".to_string()),
        ]);

        let before = reconciler.force_refresh().await.expect("first refresh");
        let failed = reconciler.force_refresh().await;
        assert!(matches!(failed, Err(GatewayError::CommandFailed { .. })));
        assert_eq!(reconciler.current(), before);
        assert!(reconciler.last_error().is_some_and(|error| error.contains("database locked")));

        let malformed = reconciler.force_refresh().await;
        assert!(matches!(malformed, Err(GatewayError::MalformedOutput(_))));
        assert_eq!(reconciler.current(), before);
        assert!(reconciler.binary_available());
    }

    #[tokio::test]
    async fn concurrent_forced_refreshes_share_one_export() {
        let gateway = Arc::new(GatedGateway {
            gate: Semaphore::new(0),
            exports: AtomicUsize::new(0),
        });
        let reconciler = Arc::new(StateReconciler::new(Arc::clone(&gateway)));

        let first = tokio::spawn({
            let reconciler = Arc::clone(&reconciler);
            async move { reconciler.force_refresh().await }
        });
        while gateway.exports.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(reconciler.state(), ReconcilerState::Polling);

        let second = tokio::spawn({
            let reconciler = Arc::clone(&reconciler);
            async move { reconciler.force_refresh().await }
        });
        let third = tokio::spawn({
            let reconciler = Arc::clone(&reconciler);
            async move { reconciler.force_refresh().await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        gateway.gate.add_permits(1);

        let first = first.await.expect("join").expect("first refresh");
        let second = second.await.expect("join").expect("second refresh");
        let third = third.await.expect("join").expect("third refresh");

        assert_eq!(gateway.exports.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &third));
        assert_eq!(reconciler.state(), ReconcilerState::Idle);
    }

    #[tokio::test]
    async fn refresh_since_mark_waits_out_older_poll() {
        let gateway = Arc::new(GatedGateway {
            gate: Semaphore::new(0),
            exports: AtomicUsize::new(0),
        });
        let reconciler = Arc::new(StateReconciler::new(Arc::clone(&gateway)));

        let early = tokio::spawn({
            let reconciler = Arc::clone(&reconciler);
            async move { reconciler.force_refresh().await }
        });
        while gateway.exports.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        let mark = reconciler.poll_mark();
        assert_eq!(mark, 1);

        let late = tokio::spawn({
            let reconciler = Arc::clone(&reconciler);
            async move { reconciler.refresh_since(mark).await }
        });
        let joined = tokio::spawn({
            let reconciler = Arc::clone(&reconciler);
            async move { reconciler.refresh_since(mark).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        gateway.gate.add_permits(1);

        let early = early.await.expect("join").expect("early refresh");
        let late = late.await.expect("join").expect("late refresh");
        let joined = joined.await.expect("join").expect("joined refresh");

        assert_eq!(gateway.exports.load(Ordering::SeqCst), 2);
        assert!(!Arc::ptr_eq(&early, &late));
        assert!(Arc::ptr_eq(&late, &joined));
        assert_eq!(reconciler.poll_mark(), 2);
    }

    #[tokio::test]
    async fn sequential_refreshes_each_poll() {
        let (gateway, reconciler) =
            reconciler_with(vec![Ok(OPEN_EXPORT.to_string()), Ok(OPEN_EXPORT.to_string())]);
        reconciler.force_refresh().await.expect("first");
        reconciler.force_refresh().await.expect("second");
        assert_eq!(gateway.calls_named("export"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_binary_suspends_export_until_probe_succeeds() {
        let (gateway, reconciler) = reconciler_with(vec![
            Err(GatewayError::BinaryUnavailable),
            Ok("timew 1.7.1".to_string()),
            Ok(OPEN_EXPORT.to_string()),
        ]);

        let first = reconciler.force_refresh().await;
        assert_eq!(first, Err(GatewayError::BinaryUnavailable));
        assert!(!reconciler.binary_available());

        let suppressed = reconciler.force_refresh().await;
        assert_eq!(suppressed, Err(GatewayError::BinaryUnavailable));
        assert_eq!(gateway.calls().len(), 1);

        tokio::time::advance(DEFAULT_PROBE_INTERVAL).await;
        let recovered = reconciler.force_refresh().await.expect("probe then export");
        assert!(recovered.active);
        assert!(reconciler.binary_available());
        assert!(reconciler.last_error().is_none());
        assert_eq!(gateway.calls_named("--version"), 1);
        assert_eq!(gateway.calls_named("export"), 2);
    }

    #[tokio::test]
    async fn probe_reports_missing_binary() {
        let (_, reconciler) = reconciler_with(vec![Err(GatewayError::BinaryUnavailable)]);
        assert!(!reconciler.probe().await);
        assert!(!reconciler.status().binary_available);
        assert!(reconciler.last_error().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_loop_ticks_until_shutdown() {
        let gateway = Arc::new(ScriptedTrackerGateway::default());
        let reconciler = Arc::new(
            StateReconciler::new(Arc::clone(&gateway)).with_settings(ReconcilerSettings {
                poll_interval: Duration::from_secs(2),
                ..ReconcilerSettings::default()
            }),
        );
        let mut updates = reconciler.subscribe();

        let handle = reconciler.spawn_polling();
        updates.changed().await.expect("first tick publishes");
        tokio::time::sleep(Duration::from_millis(4_100)).await;
        handle.shutdown().await;

        let exports = gateway.calls_named("export");
        assert_eq!(exports, 3);
        assert_eq!(gateway.calls_named("--version"), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(gateway.calls_named("export"), exports);
    }

    fn export_strategy() -> impl Strategy<Value = String> {
        let record = (
            1u32..50,
            0i64..86_400,
            prop::option::of(0i64..3_600),
            prop::collection::vec("[a-z]{1,6}", 0..4),
        )
            .prop_map(|(id, start_offset, duration, tags)| {
                let start = fixed_time("2026-02-16T00:00:00Z") + chrono::Duration::seconds(start_offset);
                let mut record = serde_json::json!({
                    "id": id,
                    "start": start.format(COMPACT).to_string(),
                    "tags": tags,
                });
                if let Some(duration) = duration {
                    let end = start + chrono::Duration::seconds(duration);
                    record["end"] = serde_json::Value::String(end.format(COMPACT).to_string());
                }
                record
            });
        prop::collection::vec(record, 0..6)
            .prop_map(|records| serde_json::Value::Array(records).to_string())
    }

    const COMPACT: &str = "%Y%m%dT%H%M%SZ";

    proptest! {
        #[test]
        fn published_snapshots_always_satisfy_invariant(
            exports in prop::collection::vec(export_strategy(), 1..6)
        ) {
            let runtime = tokio::runtime::Runtime::new().expect("runtime");
            runtime.block_on(async move {
                let responses = exports.into_iter().map(Ok).collect();
                let (_, reconciler) = reconciler_with(responses);
                let mut polls = 0;
                while polls < 6 {
                    let _ = reconciler.force_refresh().await;
                    let snapshot = reconciler.current();
                    assert!(snapshot.validate().is_ok(), "invalid snapshot {snapshot:?}");
                    if !snapshot.active {
                        assert!(snapshot.tags.is_empty());
                        assert!(snapshot.id.is_empty());
                    }
                    polls += 1;
                }
            });
        }
    }
}
