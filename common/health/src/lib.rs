use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

/// Health reporting for the long-running loops of a service.
///
/// Every loop the process depends on (a partition worker, a publisher, ...)
/// registers itself and then reports on its own schedule. The process is
/// healthy only while every registered component has reported within its
/// deadline and none has declared itself unhealthy. A registry with no
/// components is unhealthy, so the probe fails until the service has actually
/// started its loops.
///
/// Reports are plain writes into a shared map, so handles can be used from
/// both async and blocking contexts.
#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True when all components are healthy
    pub healthy: bool,
    /// Per-component status, for display in the probe body
    pub components: BTreeMap<String, ComponentStatus>,
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
    /// Set on registration, before the first report
    Starting,
    /// Reported healthy, must report again before the deadline
    HealthyUntil(OffsetDateTime),
    /// Reported unhealthy
    Unhealthy,
    /// Computed when a HealthyUntil deadline has passed
    Stalled,
    /// The component finished its work and no longer reports
    Stopped,
}

type ComponentMap = Arc<RwLock<BTreeMap<String, ComponentStatus>>>;

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: ComponentMap,
}

impl HealthHandle {
    /// Report healthy until now + deadline. Must be called more often than the deadline.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc() + self.deadline,
        ))
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut map) => {
                _ = map.insert(self.component.clone(), status);
            }
            Err(_) => warn!(component = %self.component, "poisoned health registry lock"),
        }
    }

    /// Mark the component as cleanly stopped; stopped components do not fail the probe.
    pub fn report_stopped(&self) {
        self.report_status(ComponentStatus::Stopped)
    }

    pub fn component(&self) -> &str {
        &self.component
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: ComponentMap,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Registers a component in Starting state and returns its reporting handle.
    pub fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Computes the overall status. Can be used directly as an axum handler body.
    pub fn get_status(&self) -> HealthStatus {
        let now = OffsetDateTime::now_utc();
        let components = match self.components.read() {
            Ok(map) => map.clone(),
            Err(_) => {
                warn!("{} health registry lock poisoned", self.name);
                return HealthStatus::default();
            }
        };

        let mut status = HealthStatus {
            healthy: !components.is_empty(),
            components: BTreeMap::new(),
        };

        for (name, component) in components {
            let effective = match component {
                ComponentStatus::HealthyUntil(until) if until <= now => ComponentStatus::Stalled,
                other => other,
            };
            if !matches!(
                effective,
                ComponentStatus::HealthyUntil(_) | ComponentStatus::Stopped
            ) {
                status.healthy = false;
            }
            status.components.insert(name, effective);
        }

        match status.healthy {
            true => debug!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, status.components),
        }
        status
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
    fn component_lifecycle() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("partition-0".to_string(), Duration::seconds(30));

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("partition-0"),
            Some(&ComponentStatus::Starting)
        );

        handle.report_healthy();
        assert!(registry.get_status().healthy);

        handle.report_status(ComponentStatus::Unhealthy);
        assert!(!registry.get_status().healthy);

        handle.report_stopped();
        assert!(registry.get_status().healthy);
    }

    #[test]
    fn missed_deadline_is_stalled() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("publisher".to_string(), Duration::seconds(30));
        handle.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc() - Duration::seconds(1),
        ));

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("publisher"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[test]
    fn one_bad_component_fails_the_probe() {
        let registry = HealthRegistry::new("liveness");
        let one = registry.register("one".to_string(), Duration::seconds(30));
        let two = registry.register("two".to_string(), Duration::seconds(30));

        one.report_healthy();
        assert!(!registry.get_status().healthy);

        two.report_healthy();
        assert!(registry.get_status().healthy);

        one.report_status(ComponentStatus::Unhealthy);
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn into_response() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}
