use std::sync::Arc;

use tracing::trace;

use crate::endpoint::service_endpoint::{EndpointType, HubServiceEndpoint, ServiceEndpoint};
use crate::util::random::{Random, RngRandom};


/// Selection policy deciding which endpoints serve a message or a new client. Errors returned
///  by an implementation reach the caller of the container operation unchanged.
#[cfg_attr(test, mockall::automock)]
pub trait EndpointRouter: Send + Sync {
    /// Endpoint for a client of the hub that is about to connect, `None` if there is no suitable
    ///  endpoint. The candidates are the hub's view of the endpoints, including whether the hub
    ///  has a live connection to each.
    fn get_negotiate_endpoint(&self, endpoints: &[Arc<HubServiceEndpoint>]) -> anyhow::Result<Option<Arc<HubServiceEndpoint>>>;

    fn get_endpoints_for_broadcast(&self, endpoints: &[Arc<ServiceEndpoint>]) -> anyhow::Result<Vec<Arc<ServiceEndpoint>>>;

    fn get_endpoints_for_group(&self, group_name: &str, endpoints: &[Arc<ServiceEndpoint>]) -> anyhow::Result<Vec<Arc<ServiceEndpoint>>>;

    fn get_endpoints_for_user(&self, user_id: &str, endpoints: &[Arc<ServiceEndpoint>]) -> anyhow::Result<Vec<Arc<ServiceEndpoint>>>;

    fn get_endpoints_for_connection(&self, connection_id: &str, endpoints: &[Arc<ServiceEndpoint>]) -> anyhow::Result<Vec<Arc<ServiceEndpoint>>>;
}

/// Messages go to every endpoint. New clients go to an online primary endpoint chosen at random,
///  weighted by remaining capacity.
pub struct DefaultEndpointRouter {
    random: Arc<dyn Random>,
}

impl DefaultEndpointRouter {
    pub fn new() -> DefaultEndpointRouter {
        Self::with_random(Arc::new(RngRandom {}))
    }

    pub fn with_random(random: Arc<dyn Random>) -> DefaultEndpointRouter {
        DefaultEndpointRouter {
            random,
        }
    }

    /// Remaining capacity per candidate. An endpoint that did not report metrics yet counts with
    ///  the average of those that did.
    fn weights(candidates: &[&Arc<HubServiceEndpoint>]) -> Vec<u64> {
        let reported = candidates.iter()
            .map(|e| e.endpoint().metrics().map(|m| m.remaining_capacity()))
            .collect::<Vec<_>>();

        let known = reported.iter().flatten().copied().collect::<Vec<_>>();
        let unknown_weight = if known.is_empty() {
            0
        }
        else {
            known.iter().fold(0u64, |acc, w| acc.saturating_add(*w)) / known.len() as u64
        };

        reported.into_iter()
            .map(|w| w.unwrap_or(unknown_weight))
            .collect()
    }

    fn weighted_choice(&self, candidates: &[&Arc<HubServiceEndpoint>]) -> Option<Arc<HubServiceEndpoint>> {
        if candidates.is_empty() {
            return None;
        }

        let weights = Self::weights(candidates);
        let total = weights.iter()
            .fold(0u64, |acc, w| acc.saturating_add(*w));

        if total == 0 {
            // no metrics reported yet, or every endpoint is full
            let idx = self.random.gen_usize_range(0..candidates.len());
            return Some(candidates[idx].clone());
        }

        let mut pick = self.random.gen_u64_range(0..total);
        for (candidate, weight) in candidates.iter().zip(weights) {
            if pick < weight {
                trace!(endpoint = %candidate, "selected endpoint for negotiation");
                return Some((*candidate).clone());
            }
            pick -= weight;
        }
        candidates.last().map(|e| (*e).clone())
    }
}

impl Default for DefaultEndpointRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointRouter for DefaultEndpointRouter {
    fn get_negotiate_endpoint(&self, endpoints: &[Arc<HubServiceEndpoint>]) -> anyhow::Result<Option<Arc<HubServiceEndpoint>>> {
        let candidates = endpoints.iter()
            .filter(|e| e.endpoint().endpoint_type() == EndpointType::Primary && e.is_online())
            .collect::<Vec<_>>();
        Ok(self.weighted_choice(&candidates))
    }

    fn get_endpoints_for_broadcast(&self, endpoints: &[Arc<ServiceEndpoint>]) -> anyhow::Result<Vec<Arc<ServiceEndpoint>>> {
        Ok(endpoints.to_vec())
    }

    fn get_endpoints_for_group(&self, _group_name: &str, endpoints: &[Arc<ServiceEndpoint>]) -> anyhow::Result<Vec<Arc<ServiceEndpoint>>> {
        Ok(endpoints.to_vec())
    }

    fn get_endpoints_for_user(&self, _user_id: &str, endpoints: &[Arc<ServiceEndpoint>]) -> anyhow::Result<Vec<Arc<ServiceEndpoint>>> {
        Ok(endpoints.to_vec())
    }

    fn get_endpoints_for_connection(&self, _connection_id: &str, endpoints: &[Arc<ServiceEndpoint>]) -> anyhow::Result<Vec<Arc<ServiceEndpoint>>> {
        Ok(endpoints.to_vec())
    }
}

#[cfg(test)]
mod test {
    use crate::endpoint::service_endpoint::EndpointMetrics;
    use crate::util::random::{MockRandom, SeededRandom};
    use super::*;

    fn unreported(name: &str, endpoint_type: EndpointType, online: bool) -> Arc<HubServiceEndpoint> {
        let endpoint = ServiceEndpoint::new(&format!("Endpoint=https://{}.example", name), endpoint_type, name).unwrap();
        let result = HubServiceEndpoint::new("chat", Arc::new(endpoint));
        result.set_online(online);
        Arc::new(result)
    }

    fn endpoint(name: &str, endpoint_type: EndpointType, online: bool, capacity: u64, clients: u64) -> Arc<HubServiceEndpoint> {
        let result = unreported(name, endpoint_type, online);
        result.endpoint().update_metrics(EndpointMetrics {
            connection_capacity: capacity,
            server_connection_count: 0,
            client_connection_count: clients,
        });
        result
    }

    #[test]
    fn test_negotiate_weighted_by_remaining_capacity() {
        let almost_full = endpoint("full", EndpointType::Primary, true, 1000, 999);
        let almost_empty = endpoint("empty", EndpointType::Primary, true, 1000, 10);
        let endpoints = vec![almost_full.clone(), almost_empty.clone()];

        let router = DefaultEndpointRouter::with_random(Arc::new(SeededRandom::new(17)));
        let mut full_count = 0;
        for _ in 0..1000 {
            let selected = router.get_negotiate_endpoint(&endpoints).unwrap().unwrap();
            if selected.endpoint().id() == almost_full.endpoint().id() {
                full_count += 1;
            }
        }
        assert!(full_count <= 10, "{}", full_count);
    }

    #[test]
    fn test_negotiate_never_selects_endpoint_without_headroom() {
        let full = endpoint("full", EndpointType::Primary, true, 1000, 1000);
        let other = endpoint("other", EndpointType::Primary, true, 1000, 900);
        let endpoints = vec![full.clone(), other.clone()];

        let router = DefaultEndpointRouter::with_random(Arc::new(SeededRandom::new(3)));
        for _ in 0..1000 {
            let selected = router.get_negotiate_endpoint(&endpoints).unwrap().unwrap();
            assert_eq!(selected.endpoint().id(), other.endpoint().id());
        }
    }

    #[test]
    fn test_negotiate_only_online_primaries() {
        let offline = endpoint("offline", EndpointType::Primary, false, 1000, 0);
        let secondary = endpoint("secondary", EndpointType::Secondary, true, 1000, 0);
        let primary = endpoint("primary", EndpointType::Primary, true, 1000, 500);

        let router = DefaultEndpointRouter::new();
        for _ in 0..100 {
            let selected = router.get_negotiate_endpoint(&[offline.clone(), secondary.clone(), primary.clone()]).unwrap().unwrap();
            assert_eq!(selected.endpoint().id(), primary.endpoint().id());
        }

        assert!(router.get_negotiate_endpoint(&[offline, secondary]).unwrap().is_none());
    }

    #[test]
    fn test_negotiate_without_headroom_anywhere_is_uniform() {
        let a = endpoint("a", EndpointType::Primary, true, 0, 0);
        let b = endpoint("b", EndpointType::Primary, true, 0, 0);

        let mut random = MockRandom::new();
        random.expect_gen_usize_range()
            .withf(|r| *r == (0..2))
            .once()
            .return_const(1usize);

        let router = DefaultEndpointRouter::with_random(Arc::new(random));
        let selected = router.get_negotiate_endpoint(&[a, b.clone()]).unwrap().unwrap();
        assert_eq!(selected.endpoint().id(), b.endpoint().id());
    }

    #[test]
    fn test_negotiate_without_any_metrics_is_uniform() {
        let a = unreported("a", EndpointType::Primary, true);
        let b = unreported("b", EndpointType::Primary, true);

        let mut random = MockRandom::new();
        random.expect_gen_usize_range()
            .withf(|r| *r == (0..2))
            .once()
            .return_const(0usize);

        let router = DefaultEndpointRouter::with_random(Arc::new(random));
        let selected = router.get_negotiate_endpoint(&[a.clone(), b]).unwrap().unwrap();
        assert_eq!(selected.endpoint().id(), a.endpoint().id());
    }

    #[test]
    fn test_endpoint_without_metrics_weighs_like_average() {
        let reported = endpoint("reported", EndpointType::Primary, true, 1000, 500);
        let fresh = unreported("fresh", EndpointType::Primary, true);

        // both weigh 500, so 700 falls into the second one
        let mut random = MockRandom::new();
        random.expect_gen_u64_range()
            .withf(|r| *r == (0..1000))
            .once()
            .return_const(700u64);

        let router = DefaultEndpointRouter::with_random(Arc::new(random));
        let selected = router.get_negotiate_endpoint(&[reported, fresh.clone()]).unwrap().unwrap();
        assert_eq!(selected.endpoint().id(), fresh.endpoint().id());
    }

    #[test]
    fn test_endpoint_without_metrics_is_chosen_next_to_reported_ones() {
        let fresh = unreported("fresh", EndpointType::Primary, true);
        let reported = endpoint("reported", EndpointType::Primary, true, 1000, 0);
        let endpoints = vec![fresh.clone(), reported];

        let router = DefaultEndpointRouter::with_random(Arc::new(SeededRandom::new(5)));
        let fresh_count = (0..1000)
            .filter(|_| router.get_negotiate_endpoint(&endpoints).unwrap().unwrap().endpoint().id() == fresh.endpoint().id())
            .count();
        assert!(fresh_count > 300, "{}", fresh_count);
    }

    #[test]
    fn test_empty_selection_is_not_an_error() {
        let router = DefaultEndpointRouter::new();
        assert!(router.get_negotiate_endpoint(&[]).unwrap().is_none());
        assert!(router.get_endpoints_for_broadcast(&[]).unwrap().is_empty());
        assert!(router.get_endpoints_for_group("g", &[]).unwrap().is_empty());
        assert!(router.get_endpoints_for_user("u", &[]).unwrap().is_empty());
        assert!(router.get_endpoints_for_connection("c", &[]).unwrap().is_empty());
    }

    #[test]
    fn test_messages_go_to_all_endpoints() {
        let a = endpoint("a", EndpointType::Primary, true, 0, 0).endpoint().clone();
        let b = endpoint("b", EndpointType::Secondary, false, 0, 0).endpoint().clone();
        let router = DefaultEndpointRouter::new();

        let selected = router.get_endpoints_for_group("g", &[a.clone(), b.clone()]).unwrap();
        assert_eq!(selected.iter().map(|e| e.id()).collect::<Vec<_>>(), vec![a.id(), b.id()]);
    }
}
