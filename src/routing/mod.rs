//! Route selection for intercepted flows.
//!
//! Every proxied exchange gets an ordered list of synthetic waypoint ids, a
//! strategy tag and a cost estimate attached as telemetry. Selection is a
//! pure function of the (source, destination) endpoint pair so it can be
//! swapped or mocked in tests; the two implementations are a configured
//! topology table and a hash-derived simulation used when no topology data
//! exists.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::config::{RoutingConfig, TopologyEntry};

/// Named routing strategies, ordered by the distance bucket they serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    DirectLocal,
    EntangledRegional,
    RepeaterChain,
    QuantumTeleport,
    /// Route taken verbatim from a configured topology entry
    Topology,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::DirectLocal => "direct_local",
            Strategy::EntangledRegional => "entangled_regional",
            Strategy::RepeaterChain => "repeater_chain",
            Strategy::QuantumTeleport => "quantum_teleport",
            Strategy::Topology => "topology",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A selected route with its cost model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub waypoints: Vec<u32>,
    pub strategy: Strategy,
    /// Estimated traversal cost in milliseconds
    pub cost_ms: f64,
    /// Classical single-path baseline for the same pair, in milliseconds
    pub classical_ms: f64,
    /// True when the route was synthesized rather than read from topology
    pub simulated: bool,
}

impl Route {
    /// Strategy label as exposed in diagnostics, e.g. `repeater_chain[simulated]`
    pub fn strategy_label(&self) -> String {
        if self.simulated {
            format!("{}[simulated]", self.strategy)
        } else {
            self.strategy.to_string()
        }
    }

    /// Waypoints serialized for the diagnostic header, e.g. `17,42,3`
    pub fn waypoints_header(&self) -> String {
        self.waypoints
            .iter()
            .map(|w| w.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Ratio of the classical baseline to the routed cost; >1 means the
    /// routed path is estimated faster
    pub fn advantage(&self) -> f64 {
        if self.cost_ms > 0.0 {
            self.classical_ms / self.cost_ms
        } else {
            0.0
        }
    }
}

/// Maps an endpoint pair to a route. Implementations must be pure and
/// side-effect free.
pub trait RouteSelector: Send + Sync {
    fn route(&self, src: &str, dst: &str) -> Route;
}

/// Build the selector the configuration asks for: topology-backed when a
/// table is present, hash-simulated otherwise.
pub fn build_selector(config: &RoutingConfig) -> Box<dyn RouteSelector> {
    match &config.topology {
        Some(entries) if !entries.is_empty() => Box::new(TopologySelector::new(
            entries.clone(),
            SimulatedSelector::new(config.clone()),
        )),
        _ => Box::new(SimulatedSelector::new(config.clone())),
    }
}

/// Hash-based simulation used when no real topology exists.
pub struct SimulatedSelector {
    config: RoutingConfig,
}

impl SimulatedSelector {
    pub fn new(config: RoutingConfig) -> Self {
        Self { config }
    }

    /// Surrogate coordinate for an endpoint string, in `0..100_000`
    fn surrogate(endpoint: &str) -> u64 {
        let digest = Sha256::digest(endpoint.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(bytes) % 100_000
    }

    /// Deterministic waypoint ids derived from both endpoints
    fn waypoints(src_surrogate: u64, dst_surrogate: u64, hops: usize) -> Vec<u32> {
        let seed = src_surrogate ^ dst_surrogate.rotate_left(17);
        (0..hops)
            .map(|i| (seed.wrapping_mul(6364136223846793005).wrapping_add(i as u64 * 1442695040888963407) % 65_536) as u32)
            .collect()
    }

    /// Bucket a distance into a strategy with its hop count and base cost
    pub fn classify(&self, distance: u64) -> (Strategy, usize, f64) {
        let cfg = &self.config;
        if distance < cfg.local_max_distance {
            // Short hauls scale with distance; everything else is flat per bucket
            let cost = cfg.local_base_cost_ms + distance as f64 / 10_000.0;
            (Strategy::DirectLocal, 1, cost)
        } else if distance < cfg.regional_max_distance {
            (Strategy::EntangledRegional, 3, cfg.regional_cost_ms)
        } else if distance < cfg.chain_max_distance {
            let hops = 5;
            (
                Strategy::RepeaterChain,
                hops,
                cfg.chain_base_cost_ms + hops as f64 * 0.5,
            )
        } else {
            (Strategy::QuantumTeleport, 2, cfg.teleport_cost_ms)
        }
    }
}

impl RouteSelector for SimulatedSelector {
    fn route(&self, src: &str, dst: &str) -> Route {
        let a = Self::surrogate(src);
        let b = Self::surrogate(dst);
        let distance = a.abs_diff(b);

        let (strategy, hops, base_cost) = self.classify(distance);
        let cost_ms = base_cost * self.config.simulated_cost_factor;
        let classical_ms =
            (distance as f64 * self.config.classical_ms_per_distance).max(cost_ms);

        Route {
            waypoints: Self::waypoints(a, b, hops),
            strategy,
            cost_ms,
            classical_ms,
            simulated: true,
        }
    }
}

/// Configured topology table with simulated fallback for unlisted hosts.
pub struct TopologySelector {
    entries: Vec<TopologyEntry>,
    fallback: SimulatedSelector,
}

impl TopologySelector {
    pub fn new(entries: Vec<TopologyEntry>, fallback: SimulatedSelector) -> Self {
        Self { entries, fallback }
    }

    fn lookup(&self, dst: &str) -> Option<&TopologyEntry> {
        let host = dst.split(':').next().unwrap_or(dst);
        self.entries.iter().find(|e| e.host == host)
    }
}

impl RouteSelector for TopologySelector {
    fn route(&self, src: &str, dst: &str) -> Route {
        match self.lookup(dst) {
            Some(entry) => Route {
                waypoints: entry.waypoints.clone(),
                strategy: Strategy::Topology,
                cost_ms: entry.cost_ms,
                classical_ms: entry.cost_ms,
                simulated: false,
            },
            None => self.fallback.route(src, dst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector() -> SimulatedSelector {
        SimulatedSelector::new(RoutingConfig::default())
    }

    #[test]
    fn test_distance_buckets() {
        let s = selector();

        let (strategy, hops, cost) = s.classify(500);
        assert_eq!(strategy, Strategy::DirectLocal);
        assert_eq!(hops, 1);
        assert!((0.5..0.65).contains(&cost), "local cost out of range: {cost}");

        let (strategy, hops, _) = s.classify(5_000);
        assert_eq!(strategy, Strategy::EntangledRegional);
        assert_eq!(hops, 3);

        let (strategy, hops, _) = s.classify(25_000);
        assert_eq!(strategy, Strategy::RepeaterChain);
        assert_eq!(hops, 5);

        let (strategy, hops, cost) = s.classify(75_000);
        assert_eq!(strategy, Strategy::QuantumTeleport);
        assert_eq!(hops, 2);
        assert_eq!(cost, 12.0);
    }

    #[test]
    fn test_teleport_has_highest_cost() {
        let s = selector();
        let (_, _, teleport) = s.classify(75_000);
        for distance in [0, 500, 999, 1_000, 9_999, 10_000, 49_999] {
            let (_, _, cost) = s.classify(distance);
            assert!(cost < teleport, "cost {cost} at distance {distance} >= teleport {teleport}");
        }
    }

    #[test]
    fn test_route_is_deterministic() {
        let s = selector();
        let a = s.route("10.0.0.1:50123", "origin.example.com:443");
        let b = s.route("10.0.0.1:50123", "origin.example.com:443");
        assert_eq!(a, b);
    }

    #[test]
    fn test_simulated_routes_are_tagged_and_scaled() {
        let s = selector();
        let route = s.route("10.0.0.1:50123", "origin.example.com:443");
        assert!(route.simulated);
        assert!(route.strategy_label().ends_with("[simulated]"));

        let (_, _, base) = s.classify(
            SimulatedSelector::surrogate("10.0.0.1:50123")
                .abs_diff(SimulatedSelector::surrogate("origin.example.com:443")),
        );
        assert!((route.cost_ms - base * 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_waypoint_count_matches_strategy() {
        let s = selector();
        let route = s.route("client-a", "client-b");
        let (strategy, hops, _) = s.classify(
            SimulatedSelector::surrogate("client-a")
                .abs_diff(SimulatedSelector::surrogate("client-b")),
        );
        assert_eq!(route.strategy, strategy);
        assert_eq!(route.waypoints.len(), hops);
    }

    #[test]
    fn test_advantage_is_at_least_one() {
        let s = selector();
        let route = s.route("10.1.2.3:1", "far.example.net:443");
        assert!(route.advantage() >= 1.0);
    }

    #[test]
    fn test_topology_selector_prefers_table() {
        let entries = vec![TopologyEntry {
            host: "origin.example.com".to_string(),
            waypoints: vec![7, 9, 11],
            cost_ms: 3.25,
        }];
        let ts = TopologySelector::new(entries, selector());

        let route = ts.route("10.0.0.1:50123", "origin.example.com:443");
        assert_eq!(route.strategy, Strategy::Topology);
        assert_eq!(route.waypoints, vec![7, 9, 11]);
        assert!(!route.simulated);

        let fallback = ts.route("10.0.0.1:50123", "unlisted.example.com:443");
        assert!(fallback.simulated);
    }

    #[test]
    fn test_waypoints_header_format() {
        let route = Route {
            waypoints: vec![17, 42, 3],
            strategy: Strategy::RepeaterChain,
            cost_ms: 7.5,
            classical_ms: 30.0,
            simulated: true,
        };
        assert_eq!(route.waypoints_header(), "17,42,3");
        assert_eq!(route.advantage(), 4.0);
    }
}
