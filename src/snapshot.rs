use chrono::Local;
use tracing::{debug, warn};

use crate::client::{ApiError, RouterClient};
use crate::reconcile::{CapabilitySet, HealthSnapshot};

/// Fetches tool and resource health concurrently. Both must succeed.
pub async fn fetch_health(client: &RouterClient) -> Result<HealthSnapshot, ApiError> {
    let (tools, resources) = tokio::try_join!(client.tools_state(), client.resources_state())?;
    Ok(HealthSnapshot { tools, resources })
}

/// Builds the starting capability collection: inventory plus health, joined by
/// service name. Any failure yields an error and no partial collection.
pub async fn fetch_capabilities(client: &RouterClient) -> Result<CapabilitySet, ApiError> {
    let (inventory, health) = tokio::try_join!(client.list_capabilities(), fetch_health(client))
        .inspect_err(|err| warn!(error = %err, "capability snapshot failed"))?;

    let mut set = CapabilitySet::new(inventory);
    set.merge_health(&health, Local::now());
    debug!(entries = set.len(), "capability snapshot loaded");
    Ok(set)
}

/// Fail-closed form: an error becomes an empty collection plus the error for
/// the caller to surface.
pub async fn fetch_capabilities_or_empty(client: &RouterClient) -> (CapabilitySet, Option<ApiError>) {
    match fetch_capabilities(client).await {
        Ok(set) => (set, None),
        Err(err) => (CapabilitySet::default(), Some(err)),
    }
}
