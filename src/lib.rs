pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::commands::AppState;
pub use application::coordinator::TimerCoordinator;
pub use application::reconciler::{PollerHandle, ReconcilerSettings, ReconcilerStatus, StateReconciler};
pub use domain::models::{TimerEvent, TimerSnapshot, TrackerInterval, ValidationResult};
pub use domain::tags::{parse_tags, validate_tag_list, validate_tags};
pub use infrastructure::error::{GatewayError, InfraError, OperationError};
pub use infrastructure::tag_history::TagHistory;
pub use infrastructure::tracker_gateway::{ProcessTrackerGateway, TrackerCommand, TrackerGateway};
