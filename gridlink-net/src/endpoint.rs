//! Phase-based endpoint.
//!
//! An [`Endpoint`] holds a connection and one variable map per exchange
//! phase. Bindings are declared with phase-prefixed specifications:
//!
//! ```text
//! precommit:meter.voltage -> bus.v
//! sync:meter.load <- bus.load; 0.5
//! forbid:meter.secret
//! ```
//!
//! The `allow` and `forbid` maps filter which local names may be bound in
//! the other phases and are never exchanged.
//!
//! [`Endpoint`]: struct.Endpoint.html

use gridlink_core::{CommunicationType, Direction, Phase, Resolver, VarMap, VarMapEntry};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::program::{CacheSelector, Program};

pub const DEFAULT_TIMESTEP: f64 = 1.0;
/// Phase name sent with the first exchange after the handshake.
pub const START_PHASE: &str = "start";

pub struct Endpoint {
    connection: Option<Connection>,
    maps: Vec<VarMap>,
    timestep: f64,
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint {
            connection: None,
            maps: Phase::ALL.iter().map(|_| VarMap::new()).collect(),
            timestep: DEFAULT_TIMESTEP,
        }
    }
}

impl Endpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection(connection: Connection) -> Self {
        Endpoint {
            connection: Some(connection),
            ..Self::default()
        }
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn connection_mut(&mut self) -> Option<&mut Connection> {
        self.connection.as_mut()
    }

    pub fn map(&self, phase: Phase) -> &VarMap {
        &self.maps[phase.index()]
    }

    pub fn timestep(&self) -> f64 {
        self.timestep
    }

    pub fn set_timestep(&mut self, timestep: f64) {
        self.timestep = timestep;
    }

    /// Checks a local name against the allow and forbid lists.
    pub fn permits(&self, name: &str) -> bool {
        let allow = self.map(Phase::Allow);
        if self.map(Phase::Forbid).mentions(name) {
            return false;
        }
        allow.is_empty() || allow.mentions(name)
    }

    /// Adds a binding given as `PHASE:SPEC`.
    ///
    /// Returns false if the local name is filtered out by the allow or
    /// forbid lists.
    pub fn link(&mut self, spec: &str) -> Result<bool> {
        let i = spec
            .find(':')
            .ok_or_else(|| Error::ParsingError(format!("missing phase in link '{}'", spec)))?;
        let phase: Phase = spec[..i].parse()?;
        let binding = spec[i + 1..].trim();
        match phase {
            Phase::Allow => self.maps[phase.index()].add_rule(binding, Direction::Allow)?,
            Phase::Forbid => self.maps[phase.index()].add_rule(binding, Direction::Forbid)?,
            _ => {
                let entry = VarMapEntry::parse(binding, CommunicationType::Unknown)?;
                if !self.permits(&entry.local_name) {
                    warn!("endpoint: {} is not allowed, link ignored", entry.local_name);
                    return Ok(false);
                }
                self.maps[phase.index()].add(binding, CommunicationType::Unknown)?;
            }
        }
        Ok(true)
    }

    /// Applies a `TARGET:COMMAND` option.
    ///
    /// `connection:` creates the connection from a construction string, or
    /// configures it if it already exists. Phase names are aliases of
    /// `link`. Other targets are passed on to the connection.
    pub fn option(&mut self, command: &str) -> Result<()> {
        let i = command
            .find(':')
            .ok_or_else(|| Error::ParsingError(format!("missing option target in '{}'", command)))?;
        let target = command[..i].trim().to_lowercase();
        let rest = command[i + 1..].trim();

        if target == "connection" {
            match &mut self.connection {
                Some(connection) => {
                    for token in rest.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                        connection.configure(token)?;
                    }
                }
                None => self.connection = Some(Connection::new_instance(rest)?),
            }
            return Ok(());
        }
        if target.parse::<Phase>().is_ok() {
            self.link(command)?;
            return Ok(());
        }
        self.connection
            .as_mut()
            .ok_or(Error::NotInitialized)?
            .option(&target, rest)
    }

    /// Binds every map to the host objects, creates cache items for the
    /// exchanged phases and initializes the transport.
    pub fn init(&mut self, resolver: &dyn Resolver) -> Result<()> {
        let connection = self.connection.as_mut().ok_or(Error::NotInitialized)?;
        for phase in Phase::ALL.iter() {
            let map = &mut self.maps[phase.index()];
            if !phase.is_exchanged() || map.is_empty() {
                continue;
            }
            let resolved = map.resolve(resolver);
            let linked = map.link_cache(&mut *connection)?;
            debug!(
                "endpoint: {}: {} of {} bindings resolved, {} linked",
                phase,
                resolved,
                map.len(),
                linked
            );
        }
        connection.init()
    }

    /// Runs the opening exchanges: identification, then the schema of the
    /// read and write caches, then a first exchange of the `init` map.
    pub fn handshake(&mut self, application: &str, version: f64, model: &str) -> Result<()> {
        let connection = self.connection.as_mut().ok_or(Error::NotInitialized)?;

        let mut request = Program::new()
            .critical()
            .initiate()
            .tag("method", "init")
            .open("params")
            .string("application", application)
            .real("version", version)
            .string("modelname", model)
            .close()
            .complete();
        let rc = connection.client_initiated(&mut request);
        connection.check(rc, "init")?;
        let mut reply = Program::new()
            .critical()
            .initiate()
            .tag("result", "init")
            .complete();
        let rc = connection.server_response(&mut reply);
        connection.check(rc, "init")?;

        for (method, selector) in &[("input", CacheSelector::Read), ("output", CacheSelector::Write)]
        {
            let mut request = Program::new()
                .critical()
                .initiate()
                .tag("method", method)
                .open("schema")
                .schema(*selector)
                .close()
                .complete();
            let rc = connection.client_initiated(&mut request);
            connection.check(rc, method)?;
            let mut reply = Program::new()
                .critical()
                .initiate()
                .tag("result", method)
                .complete();
            let rc = connection.server_response(&mut reply);
            connection.check(rc, method)?;
        }
        info!("endpoint: handshake with peer complete");

        connection.update(&mut self.maps[Phase::Init.index()], START_PHASE, None)?;
        Ok(())
    }

    /// Exchanges the values of one phase at simulation time `clock`,
    /// returning the time of the next exchange.
    pub fn run(&mut self, phase: Phase, clock: f64) -> Result<f64> {
        if !phase.is_exchanged() {
            return Ok(clock);
        }
        let connection = self.connection.as_mut().ok_or(Error::NotInitialized)?;
        match connection.update(&mut self.maps[phase.index()], phase.as_str(), None) {
            Ok(count) => trace!("endpoint: {} at {}: {} values sent", phase, clock, count),
            Err(e) => {
                error!("endpoint: {} at {} failed: {}", phase, clock, e);
                return Err(e);
            }
        }
        Ok(match phase {
            Phase::Presync | Phase::Sync | Phase::Postsync => clock + self.timestep,
            _ => clock,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_are_filtered() {
        let mut endpoint = Endpoint::new();
        assert!(endpoint.link("precommit:meter.v -> bus.v").unwrap());
        endpoint.link("forbid:meter.secret").unwrap();
        assert!(!endpoint.link("sync:meter.secret -> bus.s").unwrap());

        endpoint.link("allow:meter.load").unwrap();
        assert!(endpoint.link("sync:meter.load <- bus.load; 0.5").unwrap());
        assert!(!endpoint.link("sync:meter.other -> bus.o").unwrap());

        assert_eq!(endpoint.map(Phase::Precommit).len(), 1);
        assert_eq!(endpoint.map(Phase::Sync).len(), 1);
        assert!(endpoint.link("meter.v -> bus.v").is_err());
        assert!(endpoint.link("someday:meter.v -> bus.v").is_err());
        assert!(endpoint.link("commit:meter.v = bus.v").is_err());
    }

    #[test]
    fn options_create_and_route() {
        let mut endpoint = Endpoint::new();
        assert!(endpoint.option("readcache:size 512").is_err());
        endpoint.option("connection:client,udp,port=6410").unwrap();
        endpoint.option("connection:on_error=halt").unwrap();
        endpoint.option("readcache:size 512").unwrap();
        endpoint.option("udp:timeout=5").unwrap();
        endpoint.option("commit:meter.v -> bus.v").unwrap();

        let connection = endpoint.connection().unwrap();
        assert!(!connection.ignores_errors());
        assert_eq!(connection.cache(CacheSelector::Read).size(), 512);
        assert_eq!(endpoint.map(Phase::Commit).len(), 1);
        assert!(endpoint.option("nothing").is_err());
    }

    #[test]
    fn non_exchanged_phases_keep_time() {
        let mut endpoint = Endpoint::new();
        assert_eq!(endpoint.run(Phase::Allow, 3.0).unwrap(), 3.0);
        assert!(endpoint.run(Phase::Sync, 3.0).is_err());
    }
}
