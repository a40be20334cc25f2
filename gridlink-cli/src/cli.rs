//! Application definition.

extern crate simplelog;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;

use gridlink_core::cache::DumpRow;
use gridlink_core::{CommunicationType, ObjectStore, Phase, Resolver, VarMap};
use gridlink_net::{CacheSelector, Connection, Endpoint, Listener, SessionHandler};

use crate::config::Config;

pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");
pub const AUTHORS: &'static str = env!("CARGO_PKG_AUTHORS");

pub fn app<'a, 'b>() -> App<'a, 'b> {
    App::new("gridlink")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .version(VERSION)
        .author(AUTHORS)
        .about("Exchange simulation values with external processes.")
        .arg(Arg::with_name("verbosity")
            .long("verbosity")
            .short("v")
            .takes_value(true)
            .default_value("info")
            .value_name("verb")
            .global(true)
            .help("Set the verbosity of the log output"))
        .subcommand(SubCommand::with_name("check")
            .display_order(10)
            .about("Validate a config file without touching the network")
            .arg(Arg::with_name("config")
                .required(true)
                .value_name("path")))
        .subcommand(SubCommand::with_name("run")
            .display_order(20)
            .about("Run a client endpoint, exchanging values every step")
            .arg(Arg::with_name("config")
                .required(true)
                .value_name("path"))
            .arg(Arg::with_name("steps")
                .long("steps")
                .short("s")
                .takes_value(true)
                .value_name("count")
                .help("Override the number of steps to run"))
            .arg(Arg::with_name("dump")
                .long("dump")
                .short("d")
                .help("Print cache contents after the run")))
        .subcommand(SubCommand::with_name("serve")
            .display_order(30)
            .about("Serve connector sessions over tcp and udp")
            .arg(Arg::with_name("config")
                .required(true)
                .value_name("path"))
            .arg(Arg::with_name("tcp")
                .long("tcp")
                .takes_value(true)
                .value_name("address")
                .help("Accept tcp connections on the given address"))
            .arg(Arg::with_name("udp")
                .long("udp")
                .takes_value(true)
                .value_name("address")
                .help("Receive udp datagrams on the given address"))
            .arg(Arg::with_name("workers")
                .long("workers")
                .short("w")
                .takes_value(true)
                .value_name("count")
                .help("Number of session worker threads")))
}

pub fn app_matches() -> ArgMatches<'static> {
    app().get_matches()
}

pub fn start(matches: ArgMatches) -> Result<()> {
    setup_log_verbosity(&matches);
    match matches.subcommand() {
        ("check", Some(m)) => start_check(m),
        ("run", Some(m)) => start_run(m),
        ("serve", Some(m)) => start_serve(m),
        _ => Ok(()),
    }
}

fn load_config(matches: &ArgMatches) -> Result<Config> {
    let path = PathBuf::from(matches.value_of("config").unwrap_or_default());
    Config::from_path(&path)
}

fn start_check(matches: &ArgMatches) -> Result<()> {
    let config = load_config(matches)?;
    let store = config.object_store()?;
    let endpoint = config.endpoint()?;
    let connection = endpoint
        .connection()
        .context("config doesn't define a connection")?;

    println!(
        "connection: {} over {}",
        connection.mode(),
        connection.transport().kind()
    );
    println!("objects: {}", store.object_count());

    let mut unresolved = 0;
    for phase in Phase::ALL.iter() {
        let map = endpoint.map(*phase);
        if !phase.is_exchanged() || map.is_empty() {
            continue;
        }
        println!("{}: {} bindings", phase, map.len());
        for entry in map.iter() {
            if store.resolve(&entry.local_name).is_none() {
                unresolved += 1;
                match store.suggest(&entry.local_name) {
                    Some(similar) => println!(
                        "  {} {} (did you mean {}?)",
                        "unresolved:".yellow(),
                        entry.local_name,
                        similar
                    ),
                    None => println!("  {} {}", "unresolved:".yellow(), entry.local_name),
                }
            }
        }
    }

    let mut session = VarMap::new();
    for spec in &config.session {
        session
            .add(spec, CommunicationType::Unknown)
            .with_context(|| format!("invalid session link: {}", spec))?;
    }
    if !session.is_empty() {
        println!("session: {} bindings", session.len());
    }

    if unresolved > 0 {
        println!("{} unresolved properties", unresolved);
    } else {
        println!("{}", "config ok".green());
    }
    Ok(())
}

fn start_run(matches: &ArgMatches) -> Result<()> {
    let mut config = load_config(matches)?;
    if let Some(steps) = matches.value_of("steps") {
        config.run.steps = steps.parse().context("invalid step count")?;
    }
    let mut phases = Vec::new();
    for name in &config.run.phases {
        let phase: Phase = name
            .parse()
            .with_context(|| format!("invalid phase: {}", name))?;
        phases.push(phase);
    }

    let store = config.object_store()?;
    let mut endpoint = config.endpoint()?;
    endpoint.init(&store)?;
    if config.connection.handshake {
        endpoint.handshake(
            &config.connection.application,
            config.connection.version,
            &config.connection.model,
        )?;
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let mut clock = config.run.start;
    let mut step = 0;
    while step < config.run.steps && running.load(Ordering::SeqCst) {
        let mut next = clock;
        for phase in &phases {
            next = endpoint.run(*phase, clock)?;
        }
        debug!("step {} done at {}", step, clock);
        clock = next.max(clock + config.run.timestep);
        step += 1;
    }
    info!("finished {} steps at {}", step, clock);

    if matches.is_present("dump") {
        print_dump(&endpoint)?;
    }
    Ok(())
}

#[derive(Serialize)]
struct Dump {
    readcache: Vec<DumpRow>,
    writecache: Vec<DumpRow>,
}

fn print_dump(endpoint: &Endpoint) -> Result<()> {
    if let Some(connection) = endpoint.connection() {
        let dump = Dump {
            readcache: connection.dump(CacheSelector::Read),
            writecache: connection.dump(CacheSelector::Write),
        };
        println!("{}", toml::to_string(&dump)?);
    }
    Ok(())
}

/// Session handler serving the objects and bindings of a config file.
struct ConfigHandler {
    store: ObjectStore,
    session: Vec<String>,
}

impl SessionHandler for ConfigHandler {
    fn open_session(&self, connection: &mut Connection) -> gridlink_net::Result<VarMap> {
        let mut map = VarMap::new();
        for spec in &self.session {
            map.add(spec, CommunicationType::Unknown)?;
        }
        let resolved = map.resolve(&self.store);
        debug!("session: resolved {} of {} bindings", resolved, map.len());
        map.link_cache(connection)?;
        Ok(map)
    }

    fn handled(&self, method: &str, connection: &Connection) {
        trace!("session: answered {} (seqnum {})", method, connection.seqnum());
    }
}

fn start_serve(matches: &ArgMatches) -> Result<()> {
    let config = load_config(matches)?;
    let mut listener_config = config.listener.clone();
    if let Some(address) = matches.value_of("tcp") {
        listener_config.tcp_address = Some(address.to_string());
    }
    if let Some(address) = matches.value_of("udp") {
        listener_config.udp_address = Some(address.to_string());
    }
    if let Some(workers) = matches.value_of("workers") {
        listener_config.workers = workers.parse().context("invalid worker count")?;
    }

    let handler = Arc::new(ConfigHandler {
        store: config.object_store()?,
        session: config.session.clone(),
    });
    let mut listener = Listener::start(listener_config, handler)?;
    if let Some(addr) = listener.tcp_addr() {
        println!("listening on tcp://{}", addr);
    }
    if let Some(addr) = listener.udp_addr() {
        println!("listening on udp://{}", addr);
    }

    // run a loop allowing graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;
    while running.load(Ordering::SeqCst) && listener.is_running() {
        sleep(Duration::from_millis(100));
    }
    println!("Initiating graceful shutdown...");
    listener.shutdown();
    Ok(())
}

fn setup_log_verbosity(matches: &ArgMatches) {
    use self::simplelog::{LevelFilter, TermLogger};
    let level_filter = match matches.value_of("verbosity") {
        Some(s) => match s {
            "0" | "none" => LevelFilter::Off,
            "1" | "err" | "error" | "min" => LevelFilter::Error,
            "2" | "warn" | "warning" | "default" => LevelFilter::Warn,
            "3" | "info" => LevelFilter::Info,
            "4" | "debug" => LevelFilter::Debug,
            "5" | "trace" | "max" | "all" => LevelFilter::Trace,
            _ => LevelFilter::Warn,
        },
        _ => LevelFilter::Warn,
    };
    let mut config_builder = simplelog::ConfigBuilder::new();
    let logger_conf = config_builder
        .set_time_level(LevelFilter::Error)
        .set_target_level(LevelFilter::Debug)
        .set_location_level(LevelFilter::Error)
        .set_time_format_str("%H:%M:%S%.6f")
        .build();
    TermLogger::init(level_filter, logger_conf, simplelog::TerminalMode::Mixed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subcommands_parse() {
        let matches = app()
            .get_matches_from_safe(vec!["gridlink", "-v", "debug", "run", "link.toml", "-s", "4"])
            .unwrap();
        assert_eq!(matches.value_of("verbosity"), Some("debug"));
        let (name, sub) = matches.subcommand();
        assert_eq!(name, "run");
        let sub = sub.unwrap();
        assert_eq!(sub.value_of("config"), Some("link.toml"));
        assert_eq!(sub.value_of("steps"), Some("4"));

        assert!(app().get_matches_from_safe(vec!["gridlink", "serve"]).is_err());
    }
}
