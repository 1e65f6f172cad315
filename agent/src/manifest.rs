//! Pipeline manifest - self-describing topology
//!
//! The manifest captures the running pipeline's component graph at load
//! time, so operators can query what the agent built from the current
//! configuration without reading logs.

use serde::Serialize;

/// Self-describing pipeline topology, rebuilt on every load cycle
#[derive(Debug, Clone, Serialize)]
pub struct AgentManifest {
    /// Manifest schema version
    pub version: String,
    /// Loaded sources (including the reserved self-metrics source)
    pub sources: Vec<ComponentDesc>,
    /// Started sinks
    pub sinks: Vec<ComponentDesc>,
    /// Pipe entries successfully connected
    pub pipes_connected: u64,
    /// Pipe entries that failed to bind
    pub pipes_failed: u64,
    /// Started generic plugins
    pub plugins: usize,
    /// Constructed credential providers
    pub credential_providers: usize,
}

/// Description of one loaded component
#[derive(Debug, Clone, Serialize)]
pub struct ComponentDesc {
    /// Component id
    pub id: String,
    /// Component kind ("source" or "sink")
    pub kind: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_serializes_to_json() {
        let manifest = AgentManifest {
            version: "1".to_string(),
            sources: vec![ComponentDesc {
                id: "s1".to_string(),
                kind: "source".to_string(),
            }],
            sinks: vec![ComponentDesc {
                id: "k1".to_string(),
                kind: "sink".to_string(),
            }],
            pipes_connected: 1,
            pipes_failed: 0,
            plugins: 0,
            credential_providers: 0,
        };

        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["sources"][0]["id"], "s1");
        assert_eq!(json["pipes_connected"], 1);
    }
}
