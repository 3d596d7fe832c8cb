use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::engine::ContainerEngine;

/// One line of the engine's port table, e.g. `3000/tcp -> 0.0.0.0:49153`
/// or `3000/tcp -> [::]:49153`.
static PORT_LINE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d{1,5})/(?:tcp|udp|sctp)\s*->\s*(?:\[[0-9a-fA-F:.]*\]|[0-9A-Za-z.\-]*):(\d{1,5})\s*$")
        .ok()
});

/// Parse a port table into a container-port to host-port map.
///
/// Lines that do not match the expected layout are skipped. When a container
/// port is published on several addresses the first listed mapping wins.
pub fn parse_port_table(output: &str) -> BTreeMap<u16, u16> {
    let mut ports = BTreeMap::new();
    let Some(re) = PORT_LINE.as_ref() else {
        return ports;
    };

    for line in output.lines() {
        let Some(caps) = re.captures(line) else {
            if !line.trim().is_empty() {
                debug!(line = %line, "Skipping unrecognized port line");
            }
            continue;
        };
        let container = caps.get(1).and_then(|m| m.as_str().parse::<u16>().ok());
        let host = caps.get(2).and_then(|m| m.as_str().parse::<u16>().ok());
        if let (Some(container), Some(host)) = (container, host) {
            ports.entry(container).or_insert(host);
        }
    }

    ports
}

/// Discover the host ports the engine assigned to a container's published ports.
///
/// Returns an empty map when nothing is published or the query fails; callers
/// treat that as "no dynamic ports available yet".
pub async fn resolve_mapped_ports(
    engine: &dyn ContainerEngine,
    container: &str,
) -> BTreeMap<u16, u16> {
    match engine.port_table(container).await {
        Ok(output) => parse_port_table(&output),
        Err(e) => {
            warn!(container = %container, error = %e, "Failed to query port mappings");
            BTreeMap::new()
        }
    }
}
