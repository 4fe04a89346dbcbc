use serde::{Deserialize, Serialize};

use crate::protocol::error::Result;
use crate::protocol::frame::{MethodId, ServiceId};

/// Published description of one method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodMetadata {
    pub name: String,
    pub parameter_type: String,
    pub return_type: String,
    pub method_id: MethodId,
}

/// Published description of a service, exchanged in METADATA frames.
///
/// Clients on the local path learn method ids from this message instead of
/// hard-coding them, since ids change when services are merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMetadata {
    pub service_id: ServiceId,
    pub name: String,
    pub weight: u8,
    pub methods: Vec<MethodMetadata>,
}

impl ServiceMetadata {
    /// Encodes the metadata as a METADATA frame body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decodes a METADATA frame body.
    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(postcard::from_bytes(data)?)
    }

    pub fn method(&self, name: &str) -> Option<&MethodMetadata> {
        self.methods.iter().find(|m| m.name == name)
    }
}
