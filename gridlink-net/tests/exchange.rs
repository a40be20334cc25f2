extern crate gridlink_core;
extern crate gridlink_net;

use std::net::UdpSocket;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use simplelog::{Config, LevelFilter, TestLogger};

use gridlink_core::property::PropertySpec;
use gridlink_core::{CommunicationType, ObjectStore, Phase, ValueKind, VarMap};
use gridlink_net::transport::{HeaderConfig, HEADER_SIZE};
use gridlink_net::{
    CacheSelector, Connection, Endpoint, Error, Listener, ListenerConfig, Mode, Result,
    SessionHandler, Transport, TransportKind,
};

fn init_logging() {
    TestLogger::init(LevelFilter::Trace, Config::default()).ok();
}

fn store(object: &str, properties: &[(&str, &str)]) -> ObjectStore {
    let mut store = ObjectStore::new();
    store
        .add_object(
            object,
            properties
                .iter()
                .map(|(name, value)| PropertySpec::new(name, ValueKind::Float).with_value(value))
                .collect(),
        )
        .unwrap();
    store
}

fn varmap(specs: &[&str]) -> VarMap {
    let mut map = VarMap::new();
    for spec in specs {
        map.add(spec, CommunicationType::Unknown).unwrap();
    }
    map
}

fn server_header() -> HeaderConfig {
    let mut config = HeaderConfig::default();
    config.set_mode(Mode::Server);
    config
}

fn framed(config: &HeaderConfig, body: &str) -> Vec<u8> {
    let mut raw = config.encode(body.len()).unwrap().into_bytes();
    raw.extend_from_slice(body.as_bytes());
    raw
}

#[test]
fn udp_header_rejection() {
    init_logging();
    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = peer.local_addr().unwrap().port();

    let mut transport = Transport::new(TransportKind::Udp);
    transport
        .option(&format!("hostname=127.0.0.1, port={}, timeout=500", port))
        .unwrap();
    transport.init().unwrap();
    let client = transport.local_addr().unwrap();

    let wrong_version = HeaderConfig {
        version: 1,
        ..server_header()
    };
    let wrong_size = HeaderConfig {
        size: 33,
        ..server_header()
    };
    let wrong_format = HeaderConfig {
        format: "JSON".to_string(),
        ..server_header()
    };
    // requests carry status 0
    let wrong_status = HeaderConfig::default();

    for config in &[wrong_version, wrong_size, wrong_format, wrong_status] {
        peer.send_to(&framed(config, "{}"), client).unwrap();
        match transport.recv() {
            Err(Error::Protocol(_)) => (),
            other => panic!("header {:?} accepted: {:?}", config, other),
        }
    }

    let close_version = HeaderConfig {
        format_version: 0.04,
        ..server_header()
    };
    peer.send_to(&framed(&close_version, "hello"), client).unwrap();
    assert_eq!(transport.recv().unwrap(), 5);
    assert_eq!(transport.input(), "hello");
}

#[test]
fn udp_retry_policy() {
    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = peer.local_addr().unwrap().port();

    let mut transport = Transport::new(TransportKind::Udp);
    transport
        .option(&format!("port={}; timeout=20; on_error=retry; maxretry=2", port))
        .unwrap();
    transport.init().unwrap();
    assert!(matches!(transport.recv(), Err(Error::TimedOut)));

    transport.option("on_error=ignore").unwrap();
    assert_eq!(transport.recv().unwrap(), 0);
    assert_eq!(transport.input(), "");
    assert!(!transport.has_input());
}

#[test]
fn inert_entries_send_nothing() {
    init_logging();
    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    let port = peer.local_addr().unwrap().port();

    let objects = store("meter", &[("load", "1.5")]);
    let mut map = varmap(&["meter.load <- bus.load", "meter.gone -> bus.gone"]);
    map.resolve(&objects);

    let mut client = Connection::new_instance(&format!("client,udp,port={}", port)).unwrap();
    map.link_cache(&mut client).unwrap();
    client.init().unwrap();

    assert_eq!(client.update(&mut map, "precommit", None).unwrap(), 0);
    assert_eq!(client.seqnum(), 0);
    let mut buf = [0; 64];
    assert!(peer.recv_from(&mut buf).is_err());
}

#[test]
fn unchanged_write_is_not_sent_again() {
    init_logging();
    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let port = peer.local_addr().unwrap().port();

    let objects = store("meter", &[("load", "1.5")]);
    let mut map = varmap(&["meter.load -> bus.load; 0.5"]);
    assert_eq!(map.resolve(&objects), 1);

    let mut client =
        Connection::new_instance(&format!("client,udp,port={},timeout=5000", port)).unwrap();
    map.link_cache(&mut client).unwrap();
    client.init().unwrap();

    let answer = thread::spawn(move || {
        let mut buf = [0; 1500];
        let (len, from) = peer.recv_from(&mut buf).unwrap();
        let request = String::from_utf8_lossy(&buf[HEADER_SIZE..len]).to_string();
        let body = r#"{result="sync", data={}, id=2}"#;
        peer.send_to(&framed(&server_header(), body), from).unwrap();
        (peer, request)
    });
    assert_eq!(client.update(&mut map, "sync", None).unwrap(), 1);
    let (peer, request) = answer.join().unwrap();
    assert_eq!(request, r#"{method="sync", data={bus.load="1.5"}, id=1}"#);
    assert_eq!(client.seqnum(), 2);

    // same value, then a move within the threshold
    assert_eq!(client.update(&mut map, "sync", None).unwrap(), 0);
    objects.set("meter.load", "1.8").unwrap();
    assert_eq!(client.update(&mut map, "sync", None).unwrap(), 0);
    assert_eq!(client.seqnum(), 2);

    peer.set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    let mut buf = [0; 64];
    assert!(peer.recv_from(&mut buf).is_err());
}

#[test]
fn end_to_end_over_channel() {
    init_logging();
    let (mut client, mut server) = Connection::channel_pair();

    client.transport_mut().set_timeout(Duration::from_secs(5));
    server.transport_mut().set_timeout(Duration::from_secs(5));

    let server_thread = thread::spawn(move || {
        let objects = store("grid", &[("tag", "0")]);
        let mut map = varmap(&["grid.tag <- remote.tag"]);
        map.resolve(&objects);
        map.link_cache(&mut server).unwrap();
        let method = server.respond(&mut map, None).unwrap();
        (
            method,
            server.transport().input().to_string(),
            objects.get("grid.tag").unwrap(),
        )
    });

    let objects = store("obj", &[("prop", "3.14")]);
    let mut map = varmap(&["obj.prop -> remote.tag"]);
    map.resolve(&objects);
    map.link_cache(&mut client).unwrap();

    assert_eq!(client.update(&mut map, "precommit", None).unwrap(), 1);

    let (method, body, received) = server_thread.join().unwrap();
    assert_eq!(method, "precommit");
    assert!(body.contains(r#"remote.tag="3.14""#));
    assert_eq!(body, r#"{method="precommit", data={remote.tag="3.14"}, id=1}"#);
    assert_eq!(received, "3.14");

    let rows = client.dump(CacheSelector::Write);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].remote, "remote.tag");
    assert_eq!(rows[0].value, "3.14");
    assert!(!rows[0].marked);
    assert_eq!(client.seqnum(), 2);
}

#[test]
fn endpoint_handshake_and_phase() {
    init_logging();
    let (mut client, mut server) = Connection::channel_pair();
    client.transport_mut().set_timeout(Duration::from_secs(5));
    server.transport_mut().set_timeout(Duration::from_secs(5));

    let server_thread = thread::spawn(move || {
        let objects = store("grid", &[("tag", "0"), ("load", "7.5")]);
        let mut map = varmap(&["grid.tag <- remote.tag", "grid.load -> remote.load"]);
        map.resolve(&objects);
        map.link_cache(&mut server).unwrap();
        let mut methods = Vec::new();
        for _ in 0..4 {
            methods.push(server.respond(&mut map, None).unwrap());
        }
        (methods, objects.get("grid.tag").unwrap())
    });

    let objects = store("obj", &[("prop", "3.14"), ("load", "0")]);
    let mut endpoint = Endpoint::with_connection(client);
    endpoint.link("precommit:obj.prop -> remote.tag").unwrap();
    endpoint.link("precommit:obj.load <- remote.load").unwrap();
    endpoint.init(&objects).unwrap();
    endpoint.handshake("gridlink", 1.0, "test").unwrap();
    assert_eq!(endpoint.run(Phase::Precommit, 0.).unwrap(), 0.);

    let (methods, received) = server_thread.join().unwrap();
    assert_eq!(methods, vec!["init", "input", "output", "precommit"]);
    assert_eq!(received, "3.14");
    assert_eq!(objects.get("obj.load").unwrap(), "7.5");
}

struct Handler {
    objects: ObjectStore,
    handled: AtomicUsize,
}

impl SessionHandler for Handler {
    fn open_session(&self, connection: &mut Connection) -> Result<VarMap> {
        let mut map = varmap(&["grid.tag <- remote.tag", "grid.load -> remote.load"]);
        map.resolve(&self.objects);
        map.link_cache(connection)?;
        Ok(map)
    }

    fn handled(&self, _method: &str, _connection: &Connection) {
        self.handled.fetch_add(1, Ordering::SeqCst);
    }
}

fn exchange_with(listener: &Listener, spec: &str) {
    let objects = store("obj", &[("prop", "2.5"), ("load", "0")]);
    let mut map = varmap(&["obj.prop -> remote.tag", "obj.load <- remote.load"]);
    map.resolve(&objects);

    let mut client = Connection::new_instance(spec).unwrap();
    map.link_cache(&mut client).unwrap();
    client.init().unwrap();
    assert_eq!(client.update(&mut map, "sync", None).unwrap(), 1);
    assert_eq!(objects.get("obj.load").unwrap(), "7.5");
}

#[test]
fn listener_serves_tcp_and_udp() {
    init_logging();
    let handler = Arc::new(Handler {
        objects: store("grid", &[("tag", "0"), ("load", "7.5")]),
        handled: AtomicUsize::new(0),
    });
    let config = ListenerConfig {
        tcp_address: Some("127.0.0.1:0".to_string()),
        udp_address: Some("127.0.0.1:0".to_string()),
        workers: 2,
        ..ListenerConfig::default()
    };
    let mut listener = Listener::start(config, handler.clone()).unwrap();
    let tcp_port = listener.tcp_addr().unwrap().port();
    let udp_port = listener.udp_addr().unwrap().port();

    exchange_with(&listener, &format!("client,tcp,port={}", tcp_port));
    exchange_with(&listener, &format!("client,udp,port={}", udp_port));

    listener.shutdown();
    assert!(!listener.is_running());
    assert_eq!(handler.handled.load(Ordering::SeqCst), 2);
    assert_eq!(handler.objects.get("grid.tag").unwrap(), "2.5");
}
