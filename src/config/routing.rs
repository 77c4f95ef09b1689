use serde::{Deserialize, Serialize};

/// Route selection configuration.
///
/// The distance thresholds and per-strategy cost constants were inherited
/// from the original routing tables; they carry no deeper meaning and are
/// kept configurable rather than hard-coded.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingConfig {
    /// Distances below this use the direct local strategy
    pub local_max_distance: u64,
    /// Distances below this use the entangled regional strategy
    pub regional_max_distance: u64,
    /// Distances below this use the repeater chain strategy
    pub chain_max_distance: u64,
    /// Base cost estimates per strategy, in milliseconds
    pub local_base_cost_ms: f64,
    pub regional_cost_ms: f64,
    pub chain_base_cost_ms: f64,
    pub teleport_cost_ms: f64,
    /// Cost scale-up applied when no real topology is configured
    pub simulated_cost_factor: f64,
    /// Classical baseline, milliseconds per unit of distance
    pub classical_ms_per_distance: f64,
    /// Optional real topology; when present the selector uses it instead of
    /// the hash-based simulation
    pub topology: Option<Vec<TopologyEntry>>,
}

/// One entry of a configured (non-simulated) topology
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TopologyEntry {
    /// Destination host this entry applies to
    pub host: String,
    /// Ordered waypoint ids
    pub waypoints: Vec<u32>,
    /// Estimated route cost in milliseconds
    pub cost_ms: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            local_max_distance: 1_000,
            regional_max_distance: 10_000,
            chain_max_distance: 50_000,
            local_base_cost_ms: 0.5,
            regional_cost_ms: 2.5,
            chain_base_cost_ms: 5.0,
            teleport_cost_ms: 12.0,
            simulated_cost_factor: 1.5,
            classical_ms_per_distance: 0.001,
            topology: None,
        }
    }
}

impl RoutingConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.local_max_distance >= self.regional_max_distance
            || self.regional_max_distance >= self.chain_max_distance
        {
            return Err(anyhow::anyhow!(
                "Routing distance thresholds must be strictly increasing: {} < {} < {}",
                self.local_max_distance,
                self.regional_max_distance,
                self.chain_max_distance
            ));
        }

        if self.simulated_cost_factor <= 0.0 {
            return Err(anyhow::anyhow!(
                "Routing simulated_cost_factor must be positive"
            ));
        }

        if let Some(topology) = &self.topology {
            for entry in topology {
                if entry.host.is_empty() {
                    return Err(anyhow::anyhow!("Topology entry host cannot be empty"));
                }
                if entry.waypoints.is_empty() {
                    return Err(anyhow::anyhow!(
                        "Topology entry for {} must list at least one waypoint",
                        entry.host
                    ));
                }
            }
        }

        Ok(())
    }
}
