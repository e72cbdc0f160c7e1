//! Remote peer identity as reported by the transport.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transport-assigned endpoint id. Opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        EndpointId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(s: &str) -> Self {
        EndpointId(s.to_owned())
    }
}

/// A discovered or connected remote peer. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: EndpointId,
    pub name: String,
}

impl Endpoint {
    pub fn new(id: EndpointId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// What discovery reports about an advertising endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredEndpointInfo {
    pub service_id: String,
    pub endpoint_name: String,
}

/// What the transport reports when a connection is initiated (either role).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub endpoint_name: String,
    /// Short code both sides derive from the key exchange; users compare it out of band.
    pub authentication_token: String,
    /// True when the remote side requested the connection.
    pub is_incoming: bool,
}
