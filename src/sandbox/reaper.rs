use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::ContainerEngine;
use crate::error::Result;
use crate::sandbox::naming::is_managed_name;

/// Outcome of an orphan sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Container names that were force-removed
    pub removed: Vec<String>,
    /// Managed containers that still have a record
    pub kept: usize,
    /// Container names whose removal failed
    pub failed: Vec<String>,
}

/// Remove managed containers that no record accounts for.
///
/// Only names following the `{prefix}-{hex}` layout are considered, so
/// unrelated containers that merely share the prefix are left alone.
pub async fn sweep(
    engine: &dyn ContainerEngine,
    prefix: &str,
    known: &HashSet<String>,
) -> Result<SweepReport> {
    let mut report = SweepReport::default();

    for name in engine.list_names(prefix).await? {
        if !is_managed_name(prefix, &name) {
            debug!(container = %name, "Ignoring container outside the managed naming scheme");
            continue;
        }
        if known.contains(&name) {
            report.kept += 1;
            continue;
        }

        match engine.remove(&name).await {
            Ok(()) => {
                info!(container = %name, "Removed orphaned sandbox container");
                report.removed.push(name);
            }
            Err(e) => {
                warn!(container = %name, error = %e, "Failed to remove orphaned container");
                report.failed.push(name);
            }
        }
    }

    Ok(report)
}
