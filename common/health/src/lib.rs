use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tracing::warn;

/// Liveness reporting for the engine's consumer loops.
///
/// Each loop registers itself with a heartbeat deadline and ticks its handle
/// on every poll. Nothing is evaluated at report time: a probe reading the
/// registry compares the last beat of every component against its deadline,
/// so a loop that silently stopped ticking fails the check without having to
/// report anything.
///
/// The registry only answers "is this process alive"; readiness is a
/// separate concern and should get its own instance if a binary ever needs
/// both.

struct ComponentState {
    /// How stale the last beat may be before the component counts as dead.
    deadline: Duration,
    last_beat: Option<OffsetDateTime>,
    /// Set when the component itself reports it is broken, independent of
    /// beat freshness.
    failed: bool,
}

/// Computed view of one component at probe time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentStatus {
    /// Registered but has not beaten yet.
    Starting,
    /// Beat within its deadline.
    Healthy,
    /// Last beat is older than the deadline.
    Stalled,
    /// The component reported itself broken.
    Unhealthy,
}

impl ComponentStatus {
    fn is_healthy(&self) -> bool {
        matches!(self, ComponentStatus::Healthy)
    }
}

#[derive(Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    /// Per-component verdicts, stable order for display.
    pub components: BTreeMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    /// 200 when every component is healthy, 503 otherwise, with one line per
    /// component so the failing loop is visible straight from the probe.
    fn into_response(self) -> Response {
        let mut body = String::new();
        for (name, status) in &self.components {
            body.push_str(&format!("{}: {:?}\n", name, status));
        }
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        (code, body).into_response()
    }
}

type Components = Arc<Mutex<BTreeMap<String, ComponentState>>>;

/// Write side for one component. Cheap to tick from a hot loop: a mutex
/// grab and a timestamp store, no channel or background task involved.
pub struct HealthHandle {
    component: String,
    components: Components,
}

impl HealthHandle {
    /// Record a heartbeat. Must be called more often than the deadline the
    /// component registered with.
    pub fn report_healthy(&self) {
        self.update(|state| {
            state.last_beat = Some(OffsetDateTime::now_utc());
            state.failed = false;
        });
    }

    /// Mark the component broken until it reports healthy again.
    pub fn report_unhealthy(&self) {
        self.update(|state| state.failed = true);
    }

    fn update(&self, apply: impl FnOnce(&mut ComponentState)) {
        let mut components = lock(&self.components);
        if let Some(state) = components.get_mut(&self.component) {
            apply(state);
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Components,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Register a component and hand back the handle it beats through.
    /// Registering twice under one name resets the component to Starting.
    pub fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let mut components = lock(&self.components);
        components.insert(
            component.to_owned(),
            ComponentState {
                deadline,
                last_beat: None,
                failed: false,
            },
        );

        HealthHandle {
            component: component.to_owned(),
            components: self.components.clone(),
        }
    }

    /// Evaluate every component right now. A registry with no components is
    /// unhealthy: the process has loops that have not come up yet.
    pub fn get_status(&self) -> HealthStatus {
        let now = OffsetDateTime::now_utc();
        let components = lock(&self.components);

        let mut verdicts = BTreeMap::new();
        for (name, state) in components.iter() {
            let status = if state.failed {
                ComponentStatus::Unhealthy
            } else {
                match state.last_beat {
                    None => ComponentStatus::Starting,
                    Some(beat) if now - beat <= state.deadline => ComponentStatus::Healthy,
                    Some(_) => ComponentStatus::Stalled,
                }
            };
            verdicts.insert(name.clone(), status);
        }

        let healthy =
            !verdicts.is_empty() && verdicts.values().all(ComponentStatus::is_healthy);
        if !healthy {
            warn!("{} health check failed: {:?}", self.name, verdicts);
        }

        HealthStatus {
            healthy,
            components: verdicts,
        }
    }
}

fn lock(components: &Components) -> std::sync::MutexGuard<'_, BTreeMap<String, ComponentState>> {
    // A panic while holding the lock poisons it; the map itself is still
    // sound, so keep serving rather than failing every probe from then on.
    components.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
