use crate::events::EventMessage;
use crate::middleware::HandlerError;
use std::sync::Arc;

/// Outcome of the `on_event_start` hook: `Skip` acknowledges the delivery
/// without dispatching it or touching the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookDecision {
    Continue,
    Skip,
}

pub type OnEventStart = Arc<dyn Fn(&EventMessage) -> HookDecision + Send + Sync>;
pub type OnSuccess = Arc<dyn Fn(&EventMessage) + Send + Sync>;
pub type OnError = Arc<dyn Fn(&EventMessage, &HandlerError) + Send + Sync>;

/// Observation points around the consume pipeline. `on_error` fires on every
/// handler throw, both on the retry and on the terminal path.
#[derive(Clone, Default)]
pub struct LifecycleHooks {
    pub on_event_start: Option<OnEventStart>,
    pub on_success: Option<OnSuccess>,
    pub on_error: Option<OnError>,
}
