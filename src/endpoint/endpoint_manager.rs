use std::sync::{Arc, RwLock};

use rustc_hash::FxHashSet;
use tokio::sync::broadcast;
use tracing::{info, trace, warn};

use crate::config::ServiceOptions;
use crate::endpoint::service_endpoint::{EndpointType, HubServiceEndpoint, ServiceEndpoint};
use crate::error::RelayError;


#[derive(Clone, Debug)]
pub enum EndpointEvent {
    /// added by a reload, staging until promoted
    Added(Arc<ServiceEndpoint>),
    Removed(Arc<ServiceEndpoint>),
    /// name or type of an existing endpoint changed
    Updated(EndpointUpdatedData),
    /// a staging endpoint became visible to negotiation
    Promoted(Arc<ServiceEndpoint>),
}

#[derive(Clone, Debug)]
pub struct EndpointUpdatedData {
    pub endpoint: Arc<ServiceEndpoint>,
    pub old_name: String,
    pub old_type: EndpointType,
}

pub struct EndpointEventNotifier {
    sender: broadcast::Sender<EndpointEvent>,
}
impl EndpointEventNotifier {
    pub fn new() -> EndpointEventNotifier {
        let (sender, _) = broadcast::channel(128);

        EndpointEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: EndpointEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

impl Default for EndpointEventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct ReloadSummary {
    pub added: usize,
    pub removed: usize,
    pub updated: usize,
    pub unchanged: usize,
}

/// Owns the authoritative endpoint set. The set is replaced as a whole on reload, so readers
///  always see a consistent snapshot.
pub struct ServiceEndpointManager {
    endpoints: RwLock<Arc<Vec<Arc<ServiceEndpoint>>>>,
    notifier: EndpointEventNotifier,
}

impl ServiceEndpointManager {
    pub fn new(endpoints: Vec<ServiceEndpoint>) -> anyhow::Result<ServiceEndpointManager> {
        let endpoints = Self::dedup(endpoints);
        Self::validate(&endpoints)?;

        for e in &endpoints {
            info!("service endpoint {}", e);
        }

        Ok(ServiceEndpointManager {
            endpoints: RwLock::new(Arc::new(endpoints.into_iter().map(Arc::new).collect())),
            notifier: EndpointEventNotifier::new(),
        })
    }

    pub fn from_options(options: &ServiceOptions) -> anyhow::Result<ServiceEndpointManager> {
        options.validate()?;
        Self::new(Self::endpoints_from_options(options)?)
    }

    pub fn endpoints_from_options(options: &ServiceOptions) -> anyhow::Result<Vec<ServiceEndpoint>> {
        options.endpoints.iter()
            .map(|e| ServiceEndpoint::new(&e.connection_string, e.endpoint_type, &e.name))
            .collect()
    }

    /// first occurrence of each (connection string, type) wins
    fn dedup(endpoints: Vec<ServiceEndpoint>) -> Vec<ServiceEndpoint> {
        let mut seen = FxHashSet::default();
        endpoints.into_iter()
            .filter(|e| {
                let is_new = seen.insert(e.key());
                if !is_new {
                    warn!("ignoring duplicate service endpoint {}", e);
                }
                is_new
            })
            .collect()
    }

    fn validate(endpoints: &[ServiceEndpoint]) -> anyhow::Result<()> {
        if endpoints.is_empty() {
            return Err(RelayError::NoEndpoint.into());
        }
        if !endpoints.iter().any(|e| e.endpoint_type() == EndpointType::Primary) {
            return Err(RelayError::NoPrimaryEndpoint.into());
        }
        Ok(())
    }

    pub fn endpoints(&self) -> Arc<Vec<Arc<ServiceEndpoint>>> {
        self.endpoints.read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// endpoints that may be offered to new clients: everything except staging endpoints
    pub fn negotiate_endpoints(&self) -> Vec<Arc<ServiceEndpoint>> {
        self.endpoints().iter()
            .filter(|e| !e.is_staging())
            .cloned()
            .collect()
    }

    pub fn hub_endpoints(&self, hub: &str) -> Vec<HubServiceEndpoint> {
        self.endpoints().iter()
            .map(|e| HubServiceEndpoint::new(hub, e.clone()))
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.notifier.subscribe()
    }

    /// Replaces the endpoint set. Endpoints matching an existing (connection string, type) keep
    ///  their instance, with only the name updated. An existing endpoint with the same
    ///  connection string but a different type changes its type in place. Everything else is
    ///  added (in staging) or removed.
    ///
    /// A new set without endpoints or without a primary endpoint is rejected, leaving the current
    ///  set in place.
    pub fn reload(&self, new_endpoints: Vec<ServiceEndpoint>) -> anyhow::Result<ReloadSummary> {
        let new_endpoints = Self::dedup(new_endpoints);
        Self::validate(&new_endpoints)?;

        let mut events = Vec::new();
        let mut summary = ReloadSummary::default();

        {
            let mut guard = self.endpoints.write()
                .unwrap_or_else(|e| e.into_inner());

            let mut old_endpoints = guard.to_vec();
            let mut unmatched = Vec::new();
            let mut result = Vec::new();

            for new in new_endpoints {
                match old_endpoints.iter().position(|old| old.key() == new.key()) {
                    Some(pos) => {
                        let old = old_endpoints.remove(pos);
                        let old_name = old.name();
                        if old_name != new.name() {
                            old.set_name(&new.name());
                            events.push(EndpointEvent::Updated(EndpointUpdatedData { endpoint: old.clone(), old_name, old_type: old.endpoint_type() }));
                            summary.updated += 1;
                        }
                        else {
                            summary.unchanged += 1;
                        }
                        result.push(old);
                    }
                    None => unmatched.push(new),
                }
            }

            for new in unmatched {
                match old_endpoints.iter().position(|old| old.connection_string() == new.connection_string()) {
                    Some(pos) => {
                        let old = old_endpoints.remove(pos);
                        let old_name = old.name();
                        let old_type = old.endpoint_type();
                        old.set_name(&new.name());
                        old.set_endpoint_type(new.endpoint_type());
                        events.push(EndpointEvent::Updated(EndpointUpdatedData { endpoint: old.clone(), old_name, old_type }));
                        summary.updated += 1;
                        result.push(old);
                    }
                    None => {
                        new.set_staging(true);
                        let new = Arc::new(new);
                        events.push(EndpointEvent::Added(new.clone()));
                        summary.added += 1;
                        result.push(new);
                    }
                }
            }

            for old in old_endpoints {
                events.push(EndpointEvent::Removed(old));
                summary.removed += 1;
            }

            *guard = Arc::new(result);
        }

        info!("reloaded service endpoints: {:?}", summary);
        for event in events {
            self.notifier.send_event(event);
        }
        Ok(summary)
    }

    /// Makes a staging endpoint visible to negotiation. Returns `false` if the endpoint is not
    ///  (or no longer) part of the set or was not staging.
    pub fn promote(&self, endpoint: &Arc<ServiceEndpoint>) -> bool {
        let is_current = self.endpoints().iter()
            .any(|e| e.id() == endpoint.id());
        if !is_current || !endpoint.is_staging() {
            return false;
        }

        endpoint.set_staging(false);
        info!("service endpoint {} is now available for negotiation", endpoint);
        self.notifier.send_event(EndpointEvent::Promoted(endpoint.clone()));
        true
    }
}
