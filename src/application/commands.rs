use crate::application::bootstrap::bootstrap_workspace;
use crate::application::coordinator::TimerCoordinator;
use crate::application::reconciler::{PollerHandle, ReconcilerSettings, ReconcilerStatus, StateReconciler};
use crate::domain::models::{TimerEvent, TimerSnapshot, ValidationResult};
use crate::domain::tags::{parse_tags, validate_tag_list, validate_tags};
use crate::infrastructure::config::TrackerConfig;
use crate::infrastructure::error::{InfraError, OperationError};
use crate::infrastructure::tag_history::TagHistory;
use crate::infrastructure::tracker_gateway::{ProcessTrackerGateway, TrackerGateway};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Owns the timer services for one workspace.
///
/// The entry point constructs exactly one of these and hands references to
/// whatever front end drives it.
pub struct AppState<G = ProcessTrackerGateway>
where
    G: TrackerGateway,
{
    config: TrackerConfig,
    logs_dir: Option<PathBuf>,
    reconciler: Arc<StateReconciler<G>>,
    coordinator: TimerCoordinator<G>,
}

impl AppState<ProcessTrackerGateway> {
    pub fn new(workspace_root: PathBuf) -> Result<Self, InfraError> {
        let bootstrap = bootstrap_workspace(&workspace_root)?;
        let gateway = ProcessTrackerGateway::new(bootstrap.config.tracker_binary.clone())
            .with_timeout(bootstrap.config.command_timeout());
        let mut state = Self::with_gateway(bootstrap.config, Arc::new(gateway));
        state.logs_dir = Some(bootstrap.logs_dir);
        Ok(state)
    }
}

impl<G> AppState<G>
where
    G: TrackerGateway,
{
    pub fn with_gateway(config: TrackerConfig, gateway: Arc<G>) -> Self {
        let reconciler = Arc::new(
            StateReconciler::new(Arc::clone(&gateway)).with_settings(ReconcilerSettings {
                poll_interval: config.poll_interval(),
                probe_interval: config.probe_interval(),
                history_seed_intervals: config.history_seed_intervals,
            }),
        );
        let history = Arc::new(TagHistory::new(config.history_capacity));
        let coordinator = TimerCoordinator::new(gateway, Arc::clone(&reconciler), history);
        Self {
            config,
            logs_dir: None,
            reconciler,
            coordinator,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn logs_dir(&self) -> Option<&Path> {
        self.logs_dir.as_deref()
    }

    pub fn coordinator(&self) -> &TimerCoordinator<G> {
        &self.coordinator
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TimerEvent> {
        self.coordinator.subscribe()
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<Arc<TimerSnapshot>> {
        self.reconciler.subscribe()
    }

    pub fn start_polling(&self) -> PollerHandle
    where
        G: 'static,
    {
        self.reconciler.spawn_polling()
    }

    pub fn command_error(&self, command: &str, error: &InfraError) -> String {
        match error {
            InfraError::Operation(operation) if operation.is_caller_error() => {
                tracing::warn!(command, error = %error, "command rejected");
            }
            _ => tracing::error!(command, error = %error, "command failed"),
        }
        error.to_string()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TimerStateResponse {
    pub active: bool,
    pub id: Option<String>,
    pub tags: Vec<String>,
    pub started_at: Option<String>,
    pub elapsed_seconds: u64,
    pub elapsed: String,
    pub binary_available: bool,
    pub last_error: Option<String>,
}

impl TimerStateResponse {
    fn from_parts(snapshot: &TimerSnapshot, status: &ReconcilerStatus) -> Self {
        Self {
            active: snapshot.active,
            id: Some(snapshot.id.clone()).filter(|id| !id.is_empty()),
            tags: snapshot.tags.clone(),
            started_at: snapshot.started_at.map(|value| value.to_rfc3339()),
            elapsed_seconds: snapshot.elapsed_seconds,
            elapsed: snapshot.elapsed_display(),
            binary_available: status.binary_available,
            last_error: status.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TagHistoryResponse {
    pub capacity: usize,
    pub tags: Vec<String>,
}

fn state_response<G: TrackerGateway>(state: &AppState<G>) -> TimerStateResponse {
    TimerStateResponse::from_parts(&state.reconciler.current(), &state.reconciler.status())
}

/// Refreshes from the tracker and warms the tag history. A failed refresh is
/// reported through `last_error` rather than as an error, so callers still get
/// the last known state.
pub async fn get_timer_state_impl<G: TrackerGateway>(
    state: &AppState<G>,
) -> Result<TimerStateResponse, InfraError> {
    if let Err(error) = state.coordinator.initialize().await {
        tracing::warn!(command = "get_timer_state", error = %error, "refresh failed");
    }
    Ok(state_response(state))
}

pub async fn start_timer_impl<G: TrackerGateway>(
    state: &AppState<G>,
    tags: String,
) -> Result<TimerStateResponse, InfraError> {
    start_timer_with_tags_impl(state, parse_tags(&tags)).await
}

/// Starts a timer from tags that are already separate values. Elements are
/// never split, so `"a;b"` is reported instead of becoming two tags.
pub async fn start_timer_with_tags_impl<G: TrackerGateway>(
    state: &AppState<G>,
    tags: Vec<String>,
) -> Result<TimerStateResponse, InfraError> {
    state.coordinator.start(&tags).await?;
    Ok(state_response(state))
}

pub async fn stop_timer_impl<G: TrackerGateway>(
    state: &AppState<G>,
) -> Result<TimerStateResponse, InfraError> {
    refresh_if_stale(state).await;
    state.coordinator.stop().await?;
    Ok(state_response(state))
}

pub async fn update_tags_impl<G: TrackerGateway>(
    state: &AppState<G>,
    tags: String,
) -> Result<TimerStateResponse, InfraError> {
    let validation = validate_tags(&tags);
    if !validation.is_valid {
        return Err(OperationError::InvalidTags(validation.errors).into());
    }
    update_tags_with_list_impl(state, validation.tags).await
}

pub async fn update_tags_with_list_impl<G: TrackerGateway>(
    state: &AppState<G>,
    tags: Vec<String>,
) -> Result<TimerStateResponse, InfraError> {
    let validation = validate_tag_list(&tags);
    if !validation.is_valid {
        return Err(OperationError::InvalidTags(validation.errors).into());
    }
    refresh_if_stale(state).await;
    state.coordinator.update_tags(&validation.tags).await?;
    Ok(state_response(state))
}

pub fn validate_tags_impl(tags: String) -> ValidationResult {
    validate_tags(&tags)
}

pub fn validate_tag_list_impl(tags: Vec<String>) -> ValidationResult {
    validate_tag_list(&tags)
}

pub async fn list_tag_history_impl<G: TrackerGateway>(
    state: &AppState<G>,
) -> Result<TagHistoryResponse, InfraError> {
    if state.coordinator.tag_history().is_empty() {
        if let Err(error) = state.coordinator.initialize().await {
            tracing::warn!(command = "list_tag_history", error = %error, "history seed failed");
        }
    }
    Ok(TagHistoryResponse {
        capacity: state.config.history_capacity,
        tags: state.coordinator.tag_history(),
    })
}

// One-shot callers have no poll loop running, so the snapshot may never have
// been read yet.
async fn refresh_if_stale<G: TrackerGateway>(state: &AppState<G>) {
    if state.reconciler.status().last_success_at.is_none() {
        if let Err(error) = state.reconciler.force_refresh().await {
            tracing::warn!(error = %error, "initial refresh failed");
        }
    }
}
