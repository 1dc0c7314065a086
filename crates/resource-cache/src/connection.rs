use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A region identifier, like `us-west-2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Region(Arc<str>);

impl Region {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The identity of a credential provider or a bearer token provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderId(Arc<str>);

impl ProviderId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The connection a resource is fetched with.
///
/// Both kinds of connections are scoped to a region and an identity, and the cache does not
/// distinguish between them beyond that: a `(region, provider)` pair uniquely identifies one
/// connection for caching purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionSettings {
    /// A connection authenticated with static or profile based credentials.
    Credentials {
        region: Region,
        credentials: ProviderId,
    },
    /// A connection authenticated with a bearer token.
    BearerToken {
        region: Region,
        token_provider: ProviderId,
    },
}

impl ConnectionSettings {
    pub fn credentials(region: impl AsRef<str>, credentials: impl AsRef<str>) -> Self {
        Self::Credentials {
            region: Region::new(region),
            credentials: ProviderId::new(credentials),
        }
    }

    pub fn bearer_token(region: impl AsRef<str>, token_provider: impl AsRef<str>) -> Self {
        Self::BearerToken {
            region: Region::new(region),
            token_provider: ProviderId::new(token_provider),
        }
    }

    pub fn region(&self) -> &Region {
        match self {
            Self::Credentials { region, .. } | Self::BearerToken { region, .. } => region,
        }
    }

    pub fn provider_id(&self) -> &ProviderId {
        match self {
            Self::Credentials { credentials, .. } => credentials,
            Self::BearerToken { token_provider, .. } => token_provider,
        }
    }
}

impl fmt::Display for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.region(), self.provider_id())
    }
}
