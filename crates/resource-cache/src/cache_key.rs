use std::fmt;

use crate::connection::{ConnectionSettings, ProviderId, Region};
use crate::resource::ResourceId;

/// The key of a single cache entry.
///
/// Two fetches are considered to be the same cached entity iff the resource id, the region and
/// the provider id all match exactly. The kind of connection does not contribute to the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    resource: ResourceId,
    region: Region,
    provider: ProviderId,
}

impl CacheKey {
    /// Creates a [`CacheKey`] for the given cached resource id tied to a connection.
    pub fn new(resource: ResourceId, connection: &ConnectionSettings) -> Self {
        Self {
            resource,
            region: connection.region().clone(),
            provider: connection.provider_id().clone(),
        }
    }

    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn provider(&self) -> &ProviderId {
        &self.provider
    }

    /// Whether this key belongs to the `(region, provider)` scope of `connection`.
    pub fn matches_connection(&self, connection: &ConnectionSettings) -> bool {
        &self.region == connection.region() && &self.provider == connection.provider_id()
    }

    #[cfg(test)]
    pub fn for_testing(resource: &str, region: &str, provider: &str) -> Self {
        Self::new(
            ResourceId::new(resource),
            &ConnectionSettings::credentials(region, provider),
        )
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.resource, self.region, self.provider)
    }
}
