use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Capabilities, Capability};

/// One physical storage backend and its routing weight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub name: String,
    /// Connection URI; the scheme picks the driver (`memory://...`)
    pub uri: String,
    /// Selection weight within the group; 0 takes the pool out of rotation
    pub weight: u32,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub flavor: Option<String>,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl Pool {
    pub fn new(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
            weight: 100,
            group: None,
            flavor: None,
            capabilities: Capabilities::new(),
            options: Map::new(),
        }
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn flavor(mut self, flavor: impl Into<String>) -> Self {
        self.flavor = Some(flavor.into());
        self
    }

    pub fn capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities.extend(capabilities);
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// URI scheme, e.g. `memory` for `memory://pool-a`
    pub fn scheme(&self) -> &str {
        self.uri.split("://").next().unwrap_or_default()
    }
}

/// Named set of pools that queues can bind to via `_flavor`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flavor {
    pub name: String,
    pub pool_list: Vec<String>,
    #[serde(default)]
    pub capabilities: Capabilities,
}

impl Flavor {
    pub fn new<I, S>(name: impl Into<String>, pools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            pool_list: pools.into_iter().map(Into::into).collect(),
            capabilities: Capabilities::new(),
        }
    }

    pub fn capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities.extend(capabilities);
        self
    }
}
