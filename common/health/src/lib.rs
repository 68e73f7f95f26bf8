use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

/// Health reporting for the long-running loops of a service.
///
/// Every component registers itself with a deadline and must keep reporting healthy more
/// often than that deadline. The process is healthy when at least one component registered
/// and every registered component has a current `HealthyUntil` status. A component that
/// reported `Unhealthy`, or that missed its deadline (`Stalled`), fails the whole probe.
///
/// Liveness and readiness should each get their own registry.
#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Set on registration, until the first report
    Starting,
    /// Reported healthy, must report again before the date
    HealthyUntil(OffsetDateTime),
    /// Reported unhealthy
    Unhealthy,
    /// The HealthyUntil deadline passed without a new report
    Stalled,
}

type Components = Arc<RwLock<HashMap<String, ComponentStatus>>>;

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    /// Report healthy until `now + deadline`. Safe to call from non-async contexts such as
    /// rdkafka callbacks.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc().add(self.deadline),
        ))
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut map) => {
                _ = map.insert(self.component.clone(), status);
            }
            Err(_) => warn!("poisoned HealthRegistry lock, cannot report {}", self.component),
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

    /// Registers a new component. The returned handle is passed to the component so it can
    /// report its own status.
    pub fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Computes the overall status. Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("poisoned HealthRegistry lock, {} probe fails", self.name);
            return HealthStatus::default();
        };

        let now = OffsetDateTime::now_utc();
        let mut result = HealthStatus {
            // unhealthy until something registers
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, status) in components.iter() {
            let status = match status {
                ComponentStatus::HealthyUntil(until) if *until > now => status.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(status, ComponentStatus::HealthyUntil(_)) {
                result.healthy = false;
            }
            result.components.insert(name.clone(), status);
        }

        match result.healthy {
            true => info!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, result.components),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn starting_component_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        let _handle = registry.register("one".to_string(), Duration::seconds(30));

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("one"),
            Some(&ComponentStatus::Starting)
        );
    }

    #[test]
    fn all_components_must_report_healthy() {
        let registry = HealthRegistry::new("liveness");
        let one = registry.register("one".to_string(), Duration::seconds(30));
        let two = registry.register("two".to_string(), Duration::seconds(30));

        one.report_healthy();
        assert!(!registry.get_status().healthy);

        two.report_healthy();
        assert!(registry.get_status().healthy);

        two.report_status(ComponentStatus::Unhealthy);
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn expired_report_is_stalled() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("one".to_string(), Duration::seconds(-1));
        handle.report_healthy();

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(status.components.get("one"), Some(&ComponentStatus::Stalled));
    }
}
