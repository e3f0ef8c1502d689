use crate::application::reconciler::StateReconciler;
use crate::domain::models::{TimerEvent, TimerSnapshot};
use crate::domain::tags::validate_tag_list;
use crate::infrastructure::error::{GatewayError, OperationError};
use crate::infrastructure::tag_history::TagHistory;
use crate::infrastructure::tracker_gateway::TrackerGateway;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Runs start/stop/retag against the tracker one at a time.
///
/// Operations queue on a fair lock, so a retag issued while a stop is still
/// outstanding runs after it and sees the post-stop snapshot. The coordinator
/// never writes the snapshot itself; after every successful command it asks
/// the reconciler for a poll that started after the command returned.
pub struct TimerCoordinator<G>
where
    G: TrackerGateway,
{
    gateway: Arc<G>,
    reconciler: Arc<StateReconciler<G>>,
    history: Arc<TagHistory>,
    events: broadcast::Sender<TimerEvent>,
    operation_lock: Mutex<()>,
}

impl<G> TimerCoordinator<G>
where
    G: TrackerGateway,
{
    pub fn new(
        gateway: Arc<G>,
        reconciler: Arc<StateReconciler<G>>,
        history: Arc<TagHistory>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            gateway,
            reconciler,
            history,
            events,
            operation_lock: Mutex::new(()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimerEvent> {
        self.events.subscribe()
    }

    pub fn reconciler(&self) -> &Arc<StateReconciler<G>> {
        &self.reconciler
    }

    pub fn current_snapshot(&self) -> Arc<TimerSnapshot> {
        self.reconciler.current()
    }

    pub fn tag_history(&self) -> Vec<String> {
        self.history.snapshot()
    }

    /// Reads the tracker once and warms the tag history from recent intervals.
    pub async fn initialize(&self) -> Result<Arc<TimerSnapshot>, GatewayError> {
        let snapshot = self.reconciler.force_refresh().await?;
        self.history.record(self.reconciler.recent_tags().as_slice());
        Ok(snapshot)
    }

    pub async fn start(&self, tags: &[String]) -> Result<(), OperationError> {
        let validation = validate_tag_list(tags);
        if validation.tags.is_empty() {
            return Err(OperationError::NoTags);
        }
        if !validation.is_valid {
            return Err(OperationError::InvalidTags(validation.errors));
        }
        let tags = validation.tags;

        let _operation = self.operation_lock.lock().await;
        if let Err(error) = self.gateway.start(&tags).await {
            return Err(self.gateway_failure("start", error));
        }

        self.refresh_after("start").await;
        self.history.record(tags.as_slice());
        tracing::info!(command = "start", tags = ?tags, "timer started");
        self.emit(TimerEvent::TimerStarted { tags });
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), OperationError> {
        let _operation = self.operation_lock.lock().await;
        let snapshot = self.reconciler.current();
        if !snapshot.active {
            return Err(OperationError::NoActiveTimer);
        }
        let last_tags = snapshot.tags.clone();

        if let Err(error) = self.gateway.stop().await {
            return Err(self.gateway_failure("stop", error));
        }

        self.refresh_after("stop").await;
        tracing::info!(command = "stop", tags = ?last_tags, "timer stopped");
        self.emit(TimerEvent::TimerStopped { last_tags });
        Ok(())
    }

    /// Replaces the tags of the running interval in place.
    ///
    /// The tracker retags the interval by id, so its start time and elapsed
    /// time are untouched. On failure nothing local changes; the published
    /// snapshot only moves when the reconciler next reads the tracker.
    pub async fn update_tags(&self, new_tags: &[String]) -> Result<(), OperationError> {
        let _operation = self.operation_lock.lock().await;
        let snapshot = self.reconciler.current();
        if !snapshot.active {
            return Err(OperationError::NoActiveTimer);
        }
        if snapshot.id.trim().is_empty() {
            return Err(OperationError::InvalidTimerId);
        }

        let validation = validate_tag_list(new_tags);
        if !validation.is_valid {
            return Err(OperationError::InvalidTags(validation.errors));
        }
        let new_tags = validation.tags;
        let old_tags = snapshot.tags.clone();

        if let Err(error) = self.gateway.retag(&snapshot.id, &new_tags).await {
            let reason = error.to_string();
            let error = self.gateway_failure("retag", error);
            self.emit(TimerEvent::TagUpdateFailed { reason });
            return Err(error);
        }

        self.history.record(new_tags.as_slice());
        self.refresh_after("retag").await;
        tracing::info!(
            command = "retag",
            id = %snapshot.id,
            old_tags = ?old_tags,
            new_tags = ?new_tags,
            "timer tags updated"
        );
        self.emit(TimerEvent::TagsUpdated { old_tags, new_tags });
        Ok(())
    }

    // Must run right after the gateway command returns. A scheduled poll whose
    // export began earlier is not reused.
    async fn refresh_after(&self, command: &str) {
        let mark = self.reconciler.poll_mark();
        if let Err(error) = self.reconciler.refresh_since(mark).await {
            tracing::warn!(command, error = %error, "refresh after command failed");
        }
    }

    fn gateway_failure(&self, command: &str, error: GatewayError) -> OperationError {
        tracing::error!(command, error = %error, "tracker command failed");
        self.reconciler.note_gateway_error(&error);
        OperationError::Gateway(error)
    }

    fn emit(&self, event: TimerEvent) {
        // No subscribers is fine; the snapshot stays readable through the reconciler.
        let _ = self.events.send(event);
    }
}
