//! Service-scoped node selection over the registry.

use std::sync::Arc;

use crate::cluster::node::NodeHandle;
use crate::cluster::registry::NodeRegistry;
use crate::errors::SelectionError;
use crate::service::ServiceType;

/// Picks a random node advertising the capability for `service`.
///
/// With a bucket name the selection is scoped to nodes owned by that bucket
/// and fails with [`SelectionError::ServiceMissing`] when none qualifies.
/// Views are inherently bucket-scoped: an unscoped views selection can never
/// match. Key/value routing is handled by the bucket's locator, not here, but
/// [`ServiceType::KeyValue`] still selects (the config poller uses it).
pub(crate) fn select_for_service(
    registry: &NodeRegistry,
    service: ServiceType,
    bucket: Option<&str>,
) -> Result<Arc<NodeHandle>, SelectionError> {
    let picked = registry.random(|node| {
        node.capabilities().supports(service)
            && match bucket {
                Some(name) => node.owner() == Some(name),
                None => service != ServiceType::Views,
            }
    });

    picked.ok_or_else(|| match bucket {
        Some(name) => SelectionError::ServiceMissing {
            service,
            bucket: name.to_owned(),
        },
        None => SelectionError::ServiceNotAvailable(service),
    })
}
