//! Configuration file structure.
//!
//! ```toml
//! links = ["precommit:meter.voltage -> bus.v", "sync:meter.load <- bus.load; 0.5"]
//!
//! [connection]
//! spec = "client,udp,port=39036"
//! options = ["udp:timeout=500", "connection:on_error=halt"]
//!
//! [[objects]]
//! name = "meter"
//! properties = [
//!     { name = "voltage", type = "double", value = "120.0" },
//!     { name = "load", type = "double" },
//! ]
//! ```

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use gridlink_core::property::PropertySpec;
use gridlink_core::{ObjectStore, ValueKind};
use gridlink_net::{Endpoint, ListenerConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub listener: ListenerConfig,
    pub objects: Vec<ObjectConfig>,
    /// Client side bindings, `PHASE:SPEC`
    pub links: Vec<String>,
    /// Bindings served to every listener session
    pub session: Vec<String>,
    pub run: RunConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Construction string, `MODE,TRANSPORT[,OPTION]*`
    pub spec: String,
    /// Options applied after construction, `TARGET:COMMAND`
    pub options: Vec<String>,
    /// Run the opening handshake before the first step
    pub handshake: bool,
    pub application: String,
    pub version: f64,
    pub model: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            spec: "client,udp".to_string(),
            options: Vec::new(),
            handshake: false,
            application: "gridlink".to_string(),
            version: 1.0,
            model: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectConfig {
    pub name: String,
    #[serde(default)]
    pub properties: Vec<PropertyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: Option<String>,
    pub size: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub steps: usize,
    pub timestep: f64,
    pub start: f64,
    /// Phases exchanged at every step, in order
    pub phases: Vec<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            steps: 10,
            timestep: 1.0,
            start: 0.,
            phases: vec![
                "precommit".to_string(),
                "sync".to_string(),
                "commit".to_string(),
            ],
        }
    }
}

impl Config {
    pub fn from_path(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed reading config file: {}", path.display()))?;
        let config = toml::from_str(&text)
            .with_context(|| format!("failed parsing config file: {}", path.display()))?;
        Ok(config)
    }

    /// Builds the in-memory object model described by the config.
    pub fn object_store(&self) -> Result<ObjectStore> {
        let mut store = ObjectStore::new();
        for object in &self.objects {
            let mut specs = Vec::new();
            for property in &object.properties {
                let kind: ValueKind = property
                    .kind
                    .parse()
                    .with_context(|| format!("{}.{}", object.name, property.name))?;
                let mut spec = PropertySpec::new(&property.name, kind);
                if let Some(value) = &property.value {
                    spec = spec.with_value(value);
                }
                if let Some(size) = property.size {
                    spec = spec.with_size(size);
                }
                specs.push(spec);
            }
            store.add_object(&object.name, specs)?;
        }
        Ok(store)
    }

    /// Creates the endpoint with its connection and bindings, without
    /// touching the network.
    pub fn endpoint(&self) -> Result<Endpoint> {
        let mut endpoint = Endpoint::new();
        endpoint
            .option(&format!("connection:{}", self.connection.spec))
            .with_context(|| format!("invalid connection spec: {}", self.connection.spec))?;
        for option in &self.connection.options {
            endpoint
                .option(option)
                .with_context(|| format!("invalid option: {}", option))?;
        }
        for link in &self.links {
            if !endpoint
                .link(link)
                .with_context(|| format!("invalid link: {}", link))?
            {
                warn!("link filtered out: {}", link);
            }
        }
        endpoint.set_timestep(self.run.timestep);
        Ok(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridlink_core::Phase;

    const CONFIG: &str = r#"
links = ["precommit:meter.voltage -> bus.v", "sync:meter.load <- bus.load; 0.5"]
session = ["grid.v <- bus.v"]

[connection]
spec = "client,udp,port=39100"
options = ["readcache:size 512"]

[listener]
udp_address = "127.0.0.1:39100"
workers = 2

[[objects]]
name = "meter"
properties = [
    { name = "voltage", type = "double", value = "120.5" },
    { name = "load", type = "double" },
]

[run]
steps = 3
"#;

    #[test]
    fn parse_config() {
        let config: Config = toml::from_str(CONFIG).unwrap();
        assert_eq!(config.run.steps, 3);
        assert_eq!(config.run.timestep, 1.0);
        assert_eq!(config.listener.workers, 2);
        assert_eq!(config.listener.tcp_address, None);

        let store = config.object_store().unwrap();
        assert_eq!(store.get("meter.voltage").unwrap(), "120.5");

        let endpoint = config.endpoint().unwrap();
        assert_eq!(endpoint.map(Phase::Precommit).len(), 1);
        assert_eq!(endpoint.map(Phase::Sync).len(), 1);
    }

    #[test]
    fn reject_unknown_kind() {
        let mut config: Config = toml::from_str(CONFIG).unwrap();
        config.objects[0].properties[0].kind = "quaternion".to_string();
        assert!(config.object_store().is_err());
    }

    #[test]
    fn demo_configs_are_valid() {
        let client: Config = toml::from_str(include_str!("../../demos/client.toml")).unwrap();
        let endpoint = client.endpoint().unwrap();
        assert_eq!(endpoint.map(Phase::Sync).len(), 2);
        assert_eq!(endpoint.timestep(), 60.0);
        assert!(!endpoint.connection().unwrap().ignores_errors());

        let server: Config = toml::from_str(include_str!("../../demos/server.toml")).unwrap();
        assert_eq!(server.session.len(), 2);
        assert_eq!(server.listener.session_timeout.as_millis(), 2000);
        assert_eq!(server.object_store().unwrap().get("feeder.load").unwrap(), "42.5");
    }
}
