//! Value types shared by the connector state machines.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which side of a negotiation or transfer this connector plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Consumer,
    Provider,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Consumer => "consumer",
            Role::Provider => "provider",
        }
    }
}

/// Where the counter-party connector is reached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterParty {
    pub id: String,
    pub address: String,
    pub protocol: String,
}

/// Location of data, as a type tag plus free-form properties.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAddress {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl DataAddress {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// An offer for one asset under an opaque policy document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContractOffer {
    pub id: String,
    pub asset_id: String,
    #[serde(default)]
    pub policy: serde_json::Value,
}

/// The agreement a negotiation ends with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractAgreement {
    pub id: String,
    pub asset_id: String,
    pub consumer_id: String,
    pub provider_id: String,
    /// Signing time (Unix millis).
    pub signed_at: i64,
    #[serde(default)]
    pub policy: serde_json::Value,
}

/// A resource a provisioner created for a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedResource {
    pub id: String,
    pub kind: String,
    /// Where the data plane should read or write.
    pub address: Option<DataAddress>,
}
