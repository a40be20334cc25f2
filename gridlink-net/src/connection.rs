//! Client and server connections.
//!
//! A [`Connection`] owns a transport, the cache index and the read and
//! write caches of a single link. Messages are described by [`Program`]s
//! and run through a single evaluator that either encodes and sends, or
//! receives and decodes, depending on the local mode and on which side
//! starts the exchange.
//!
//! # Return contract
//!
//! [`Connection::client_initiated`] and [`Connection::server_response`]
//! return a signed count:
//!
//! - `0` after a successful `Complete`,
//! - a positive number of processed instructions if the program has no
//!   `Complete`,
//! - `-n` if the `n`-th instruction failed,
//! - `-1` if the program is empty, receiving failed, or a critical
//!   exchange failed.
//!
//! [`Connection`]: struct.Connection.html
//! [`Program`]: ../program/struct.Program.html
//! [`Connection::client_initiated`]: struct.Connection.html#method.client_initiated
//! [`Connection::server_response`]: struct.Connection.html#method.server_response

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use gridlink_core::cache::{DumpRow, ITEM_CAPACITY};
use gridlink_core::{Cache, CacheIndex, Direction, LinkTarget, Translator, VarMap, VarMapEntry};

use crate::codec::{
    BodyParser, ExchangeTranslator, FieldMode, FieldValue, PlainExport, PlainImport, PlainParser,
};
use crate::error::{Error, Result};
use crate::program::{CacheSelector, Instruction, Program, DEFAULT_STRING_LIMIT};
use crate::transport::{Transport, TransportKind};

/// Longest accepted schema description.
pub const SCHEMA_LIMIT: usize = 256;
/// Longest accepted textual number.
const NUMBER_LIMIT: usize = 64;

/// Role of the local side of a connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Client,
    Server,
}

impl Display for Mode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Client => write!(f, "client"),
            Mode::Server => write!(f, "server"),
        }
    }
}

impl FromStr for Mode {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "client" => Ok(Mode::Client),
            "server" => Ok(Mode::Server),
            _ => Err(Error::ParsingError(format!(
                "connection mode must be client or server, got '{}'",
                s
            ))),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Role {
    Encode,
    Decode,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ExchangeState {
    Idle,
    GroupOpen,
    InGroup(usize),
    Complete,
    Error,
}

enum Failure {
    Receive(Error),
    Handler(Error),
}

impl From<Error> for Failure {
    fn from(e: Error) -> Self {
        Failure::Handler(e)
    }
}

/// One end of a data exchange link.
pub struct Connection {
    mode: Mode,
    transport: Transport,
    index: CacheIndex,
    read_cache: Cache,
    write_cache: Cache,
    seqnum: u64,
    ignore_error: bool,
    xlate_out: Arc<dyn ExchangeTranslator>,
    xlate_in: Arc<dyn ExchangeTranslator>,
    translator: Option<Arc<dyn Translator>>,
    last_error: Option<Error>,
}

impl Connection {
    /// Creates a connection over an uninitialized transport of the given
    /// kind, using the plain codec.
    pub fn new(mode: Mode, kind: TransportKind) -> Connection {
        Self::with_transport(mode, Transport::new(kind))
    }

    pub fn with_transport(mode: Mode, mut transport: Transport) -> Connection {
        transport.set_mode(mode);
        let mut connection = Connection {
            mode,
            transport,
            index: CacheIndex::new(),
            read_cache: Cache::new("readcache"),
            write_cache: Cache::new("writecache"),
            seqnum: 0,
            ignore_error: true,
            xlate_out: Arc::new(PlainExport),
            xlate_in: Arc::new(PlainImport),
            translator: None,
            last_error: None,
        };
        connection.set_codec(
            Arc::new(PlainExport),
            Arc::new(PlainImport),
            Some(Arc::new(PlainParser)),
        );
        connection
    }

    /// Creates a client and a server connected in-process.
    pub fn channel_pair() -> (Connection, Connection) {
        let (a, b) = Transport::channel_pair();
        (
            Self::with_transport(Mode::Client, a),
            Self::with_transport(Mode::Server, b),
        )
    }

    /// Creates a connection from a construction string of the form
    /// `MODE,TRANSPORT[,OPTION]*`.
    ///
    /// Options are either `on_error=halt|ignore`, `TARGET:COMMAND` routed
    /// with [`Connection::option`], or transport settings.
    ///
    /// [`Connection::option`]: struct.Connection.html#method.option
    pub fn new_instance(spec: &str) -> Result<Connection> {
        let mut tokens = spec.split(',').map(str::trim).filter(|t| !t.is_empty());
        let mode: Mode = tokens
            .next()
            .ok_or_else(|| Error::ParsingError("empty connection specification".to_string()))?
            .parse()?;
        let mut rest = tokens.collect::<Vec<&str>>();
        let kind = match rest.first().map(|t| t.parse::<TransportKind>()) {
            Some(Ok(kind)) => {
                rest.remove(0);
                kind
            }
            _ => {
                warn!("connection/{}: no transport specified, using udp", mode);
                TransportKind::Udp
            }
        };
        if kind == TransportKind::Channel {
            return Err(Error::TransportUnavailable(kind));
        }
        let mut connection = Connection::new(mode, kind);
        for token in rest {
            connection.configure(token)?;
        }
        debug!("connection/{}: created over {}", mode, kind);
        Ok(connection)
    }

    /// Applies a single construction token to an existing connection.
    pub fn configure(&mut self, token: &str) -> Result<()> {
        if let Some(i) = token.find(':') {
            if !token[..i].contains('=') {
                return self.option(&token[..i], &token[i + 1..]);
            }
        }
        let (key, value) = split_setting(token);
        if key.eq_ignore_ascii_case("on_error")
            && (value.eq_ignore_ascii_case("halt") || value.eq_ignore_ascii_case("ignore"))
        {
            return self.mode_option(token);
        }
        self.transport.option(token)
    }

    /// Routes a command to the connection, its transport or one of its
    /// caches.
    pub fn option(&mut self, target: &str, command: &str) -> Result<()> {
        let target = target.trim().to_lowercase();
        match target.as_str() {
            "readcache" => self.read_cache.option(command)?,
            "writecache" => self.write_cache.option(command)?,
            "connection" | "client" | "server" => self.mode_option(command)?,
            "transport" => self.transport.option(command)?,
            t if t == self.transport.kind().to_string() => self.transport.option(command)?,
            _ => {
                return Err(Error::InvalidOption(format!(
                    "connection/{}: unknown option target '{}'",
                    self.mode, target
                )))
            }
        }
        Ok(())
    }

    fn mode_option(&mut self, command: &str) -> Result<()> {
        let (key, value) = split_setting(command);
        match (key.to_lowercase().as_str(), self.mode) {
            ("on_error", _) => {
                self.ignore_error = match value.to_lowercase().as_str() {
                    "halt" => false,
                    "ignore" => true,
                    _ => {
                        return Err(Error::InvalidOption(format!(
                            "connection/{}: on_error must be halt or ignore, got '{}'",
                            self.mode, value
                        )))
                    }
                }
            }
            ("connect_retries", Mode::Client) => self.transport.set_connect_retries(value.parse()?),
            _ => {
                return Err(Error::InvalidOption(format!(
                    "connection/{}: option '{}' not recognized",
                    self.mode, command
                )))
            }
        }
        Ok(())
    }

    /// Replaces the message codec.
    pub fn set_codec(
        &mut self,
        xlate_out: Arc<dyn ExchangeTranslator>,
        xlate_in: Arc<dyn ExchangeTranslator>,
        parser: Option<Arc<dyn BodyParser>>,
    ) {
        if self.transport.delimiter().is_none() {
            self.transport.set_delimiter(xlate_out.delimiter());
        }
        self.transport.set_parser(parser);
        self.xlate_out = xlate_out;
        self.xlate_in = xlate_in;
    }

    /// Sets the value translator attached to items created from now on.
    pub fn set_translator(&mut self, translator: Option<Arc<dyn Translator>>) {
        self.translator = translator;
    }

    /// Initializes the transport.
    pub fn init(&mut self) -> Result<()> {
        self.transport.init()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn seqnum(&self) -> u64 {
        self.seqnum
    }

    pub fn ignores_errors(&self) -> bool {
        self.ignore_error
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }

    pub fn index(&self) -> &CacheIndex {
        &self.index
    }

    pub fn cache(&self, selector: CacheSelector) -> &Cache {
        match selector {
            CacheSelector::Read => &self.read_cache,
            CacheSelector::Write => &self.write_cache,
        }
    }

    /// Lists the contents of one of the caches.
    pub fn dump(&self, selector: CacheSelector) -> Vec<DumpRow> {
        self.cache(selector).dump(&self.index)
    }

    /// Error behind the last failed program.
    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// Runs a program for an exchange started by the client.
    ///
    /// A client encodes and sends the message, a server receives and
    /// decodes it.
    pub fn client_initiated(&mut self, program: &mut Program) -> i64 {
        let role = match self.mode {
            Mode::Client => Role::Encode,
            Mode::Server => Role::Decode,
        };
        self.run(program, role, false)
    }

    /// Runs a program for the server's answer to an exchange.
    ///
    /// A server encodes and sends the message, a client receives and
    /// decodes it. The client only accepts the reply to its latest
    /// request: older replies are discarded, other ids fail the exchange.
    pub fn server_response(&mut self, program: &mut Program) -> i64 {
        let role = match self.mode {
            Mode::Client => Role::Decode,
            Mode::Server => Role::Encode,
        };
        self.run(program, role, self.mode == Mode::Client)
    }

    fn run(&mut self, program: &mut Program, role: Role, check_id: bool) -> i64 {
        if program.is_empty() {
            warn!("connection/{}: empty message program", self.mode);
            return -1;
        }
        let mut state = ExchangeState::Idle;
        let mut critical = false;
        let mut count: i64 = 0;
        for instruction in program.instructions_mut() {
            count += 1;
            let result = self.step(instruction, role, check_id, &mut state, &mut critical);
            let failure = match result {
                Ok(()) => continue,
                Err(f) => f,
            };
            state = ExchangeState::Error;
            match role {
                Role::Encode if self.transport.is_open() => self.transport.message_discard(),
                Role::Decode => self.transport.consume_input(),
                _ => (),
            }
            let (error, hard) = match failure {
                Failure::Receive(e) => (e, true),
                Failure::Handler(e) => (e, critical),
            };
            if hard {
                error!(
                    "connection/{}: {} failed: {}",
                    self.mode,
                    instruction.name(),
                    error
                );
            } else {
                warn!(
                    "connection/{}: {} failed at instruction {}: {}",
                    self.mode,
                    instruction.name(),
                    count,
                    error
                );
            }
            self.last_error = Some(error);
            return if hard { -1 } else { -count };
        }
        if state == ExchangeState::Complete {
            0
        } else {
            count
        }
    }

    fn step(
        &mut self,
        instruction: &mut Instruction,
        role: Role,
        check_id: bool,
        state: &mut ExchangeState,
        critical: &mut bool,
    ) -> core::result::Result<(), Failure> {
        let xlate = match role {
            Role::Encode => self.xlate_out.clone(),
            Role::Decode => self.xlate_in.clone(),
        };
        let xlate = xlate.as_ref();
        match instruction {
            Instruction::Critical => {
                if *state != ExchangeState::Idle {
                    return Err(exchange("critical must come before initiate"));
                }
                *critical = true;
            }
            Instruction::Initiate => {
                match state {
                    ExchangeState::Idle | ExchangeState::Complete => (),
                    _ => return Err(exchange("message already initiated")),
                }
                match role {
                    Role::Encode => {
                        self.transport.message_open()?;
                        self.seqnum += 1;
                    }
                    Role::Decode => loop {
                        if !self.transport.has_input() {
                            self.transport.recv().map_err(Failure::Receive)?;
                        }
                        match self.stale_id(check_id) {
                            Some(id) => {
                                warn!(
                                    "connection/{}: discarding late reply {}, expecting {}",
                                    self.mode,
                                    id,
                                    self.seqnum + 1
                                );
                                self.transport.consume_input();
                            }
                            None => break,
                        }
                    },
                }
                xlate.group_open(&mut self.transport, None)?;
                *state = ExchangeState::GroupOpen;
            }
            Instruction::Continue => {
                require_group(*state)?;
                if role == Role::Encode {
                    self.transport.message_continue()?;
                }
            }
            Instruction::Complete => {
                if *state != ExchangeState::GroupOpen {
                    return Err(exchange("complete with no open message or unclosed groups"));
                }
                match role {
                    Role::Encode => {
                        let mut id = self.seqnum.to_string();
                        xlate.field(&mut self.transport, "id", &mut id, FieldMode::MatchOnly, false)?;
                        xlate.group_close(&mut self.transport)?;
                        self.transport.message_close()?;
                        self.transport.send()?;
                    }
                    Role::Decode => {
                        let mut id = String::new();
                        xlate.field(
                            &mut self.transport,
                            "id",
                            &mut id,
                            FieldMode::RoundTrip {
                                limit: NUMBER_LIMIT,
                            },
                            false,
                        )?;
                        let id: u64 = id
                            .parse()
                            .map_err(|_| exchange(&format!("invalid message id '{}'", id)))?;
                        if check_id && id != self.seqnum + 1 {
                            return Err(exchange(&format!(
                                "unexpected message id {}, expected {}",
                                id,
                                self.seqnum + 1
                            )));
                        }
                        self.seqnum = id;
                        xlate.group_close(&mut self.transport)?;
                        self.transport.consume_input();
                    }
                }
                *state = ExchangeState::Complete;
            }
            Instruction::Tag {
                tag,
                value,
                capture,
            } => {
                require_group(*state)?;
                let mode = if *capture {
                    FieldMode::RoundTrip {
                        limit: DEFAULT_STRING_LIMIT,
                    }
                } else {
                    FieldMode::MatchOnly
                };
                xlate.field(&mut self.transport, tag, value, mode, true)?;
            }
            Instruction::String { tag, value, limit } => {
                require_group(*state)?;
                let mode = FieldMode::RoundTrip { limit: *limit };
                xlate.field(&mut self.transport, tag, value, mode, true)?;
            }
            Instruction::Real { tag, value } => {
                require_group(*state)?;
                let mut text = value.to_string();
                let mode = FieldMode::RoundTrip {
                    limit: NUMBER_LIMIT,
                };
                xlate.field(&mut self.transport, tag, &mut text, mode, false)?;
                *value = text
                    .parse()
                    .map_err(|_| exchange(&format!("{} is not a real number: '{}'", tag, text)))?;
            }
            Instruction::Integer { tag, value } => {
                require_group(*state)?;
                let mut text = value.to_string();
                let mode = FieldMode::RoundTrip {
                    limit: NUMBER_LIMIT,
                };
                xlate.field(&mut self.transport, tag, &mut text, mode, false)?;
                *value = text
                    .parse()
                    .map_err(|_| exchange(&format!("{} is not an integer: '{}'", tag, text)))?;
            }
            Instruction::Open(name) => {
                let depth = match state {
                    ExchangeState::GroupOpen => 1,
                    ExchangeState::InGroup(d) => *d + 1,
                    _ => return Err(exchange("group opened outside of a message")),
                };
                xlate.group_open(&mut self.transport, Some(name.as_str()))?;
                *state = ExchangeState::InGroup(depth);
            }
            Instruction::Close => {
                let next = match state {
                    ExchangeState::InGroup(1) => ExchangeState::GroupOpen,
                    ExchangeState::InGroup(d) => ExchangeState::InGroup(*d - 1),
                    _ => return Err(exchange("close without an open group")),
                };
                xlate.group_close(&mut self.transport)?;
                *state = next;
            }
            Instruction::Schema(selector) => {
                require_group(*state)?;
                self.exchange_schema(xlate, role, *selector)?;
            }
            Instruction::Data(selector) => {
                require_group(*state)?;
                self.exchange_data(xlate, role, *selector)?;
            }
        }
        Ok(())
    }

    /// Id of a received reply older than the latest request.
    fn stale_id(&self, check_id: bool) -> Option<u64> {
        if !check_id {
            return None;
        }
        match self.transport.lookup("id") {
            Some(FieldValue::Text(id)) => id.parse().ok().filter(|id| *id <= self.seqnum),
            _ => None,
        }
    }

    fn selected(&self, role: Role, selector: CacheSelector) -> &Cache {
        match role {
            Role::Encode => self.cache(selector),
            Role::Decode => self.cache(selector.opposite()),
        }
    }

    /// Sends or checks the description of every item of a cache.
    fn exchange_schema(
        &mut self,
        xlate: &dyn ExchangeTranslator,
        role: Role,
        selector: CacheSelector,
    ) -> Result<()> {
        let handles = self.selected(role, selector).handles().to_vec();
        for handle in handles {
            let (remote, local) = match self.index.get(handle) {
                Some(item) => (item.remote_name().to_string(), item.schema_info()?),
                None => continue,
            };
            let mut info = local.clone();
            match role {
                Role::Encode => {
                    xlate.field(
                        &mut self.transport,
                        &remote,
                        &mut info,
                        FieldMode::MatchOnly,
                        true,
                    )?;
                }
                Role::Decode => {
                    xlate.field(
                        &mut self.transport,
                        &remote,
                        &mut info,
                        FieldMode::RoundTrip {
                            limit: SCHEMA_LIMIT,
                        },
                        true,
                    )?;
                    if info != local {
                        debug!(
                            "connection/{}: peer describes {} as '{}', local is '{}'",
                            self.mode, remote, info, local
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Sends the values of a cache, or stores received values into it.
    ///
    /// Sent items keep their value but are no longer marked.
    fn exchange_data(
        &mut self,
        xlate: &dyn ExchangeTranslator,
        role: Role,
        selector: CacheSelector,
    ) -> Result<()> {
        let handles = self.selected(role, selector).handles().to_vec();
        for handle in &handles {
            let (remote, mut value) = match self.index.get(*handle) {
                Some(item) => (item.remote_name().to_string(), item.value().to_string()),
                None => continue,
            };
            match role {
                Role::Encode => {
                    xlate.field(
                        &mut self.transport,
                        &remote,
                        &mut value,
                        FieldMode::MatchOnly,
                        true,
                    )?;
                }
                Role::Decode => {
                    xlate.field(
                        &mut self.transport,
                        &remote,
                        &mut value,
                        FieldMode::RoundTrip {
                            limit: ITEM_CAPACITY,
                        },
                        true,
                    )?;
                    if let Some(item) = self.index.get_mut(*handle) {
                        item.store(&value)?;
                    }
                }
            }
        }
        if role == Role::Encode {
            for handle in handles {
                if let Some(item) = self.index.get_mut(handle) {
                    item.unmark();
                }
            }
        }
        Ok(())
    }

    /// Turns a failed program's return code into its error.
    pub(crate) fn check(&mut self, rc: i64, what: &str) -> Result<()> {
        if rc >= 0 {
            return Ok(());
        }
        Err(self
            .last_error
            .take()
            .unwrap_or_else(|| Error::Exchange(format!("{} failed at instruction {}", what, -rc))))
    }

    /// Exchanges the values of one phase.
    ///
    /// Changed write entries are stored into the write cache. If anything
    /// changed, the write cache is sent tagged by `phase`, and the peer's
    /// answer is stored into the read cache and copied into the read
    /// entries' objects. Returns the number of values written.
    ///
    /// A failed request is an error. A failed response is an error only if
    /// the connection halts on errors, otherwise it's logged and 0 is
    /// returned.
    pub fn update(
        &mut self,
        map: &mut VarMap,
        phase: &str,
        xltr: Option<&dyn Translator>,
    ) -> Result<usize> {
        let mut count = 0;
        for entry in map.iter_mut().filter(|e| e.direction == Direction::Write) {
            match self.write_cache.write(&mut self.index, entry, xltr) {
                Ok(true) => count += 1,
                Ok(false) => (),
                Err(e) => warn!(
                    "connection/{}: unable to write {}: {}",
                    self.mode, entry.local_name, e
                ),
            }
        }
        if count == 0 {
            trace!("connection/{}: {}: nothing changed", self.mode, phase);
            return Ok(0);
        }

        let mut request = Program::new()
            .initiate()
            .tag("method", phase)
            .open("data")
            .data(CacheSelector::Write)
            .close()
            .complete();
        let rc = self.client_initiated(&mut request);
        if let Err(e) = self.check(rc, phase) {
            error!("connection/{}: {} request failed: {}", self.mode, phase, e);
            return Err(e);
        }

        let mut response = Program::new()
            .initiate()
            .tag("result", phase)
            .open("data")
            .data(CacheSelector::Write)
            .close()
            .complete();
        let rc = self.server_response(&mut response);
        if let Err(e) = self.check(rc, phase) {
            if self.ignore_error {
                warn!("connection/{}: {} response ignored: {}", self.mode, phase, e);
                return Ok(0);
            }
            error!("connection/{}: {} response failed: {}", self.mode, phase, e);
            return Err(e);
        }

        self.read_entries(map, xltr);
        debug!("connection/{}: {}: {} values sent", self.mode, phase, count);
        Ok(count)
    }

    fn read_entries(&mut self, map: &VarMap, xltr: Option<&dyn Translator>) {
        for entry in map.iter().filter(|e| e.direction == Direction::Read) {
            if let Err(e) = self.read_cache.read(&mut self.index, entry, xltr) {
                warn!(
                    "connection/{}: unable to read {}: {}",
                    self.mode, entry.local_name, e
                );
            }
        }
    }

    fn refresh_writes(&mut self, map: &mut VarMap, xltr: Option<&dyn Translator>) {
        for entry in map.iter_mut().filter(|e| e.direction == Direction::Write) {
            if let Err(e) = self.write_cache.write(&mut self.index, entry, xltr) {
                warn!(
                    "connection/{}: unable to write {}: {}",
                    self.mode, entry.local_name, e
                );
            }
        }
    }

    /// Answers a single message sent by the peer, returning its method.
    ///
    /// `init`, `input` and `output` belong to the opening handshake. Any
    /// other method is a phase: received data goes into the read entries'
    /// objects and the current write entries are sent back.
    pub fn respond(&mut self, map: &mut VarMap, xltr: Option<&dyn Translator>) -> Result<String> {
        if !self.transport.has_input() {
            self.transport.recv()?;
        }
        if !self.transport.has_input() {
            return Err(Error::TimedOut);
        }
        let method = match self.transport.translation().and_then(|t| t.text("method")) {
            Some(m) => m.to_string(),
            None => {
                self.transport.consume_input();
                return Err(Error::TagNotFound("method".to_string()));
            }
        };
        trace!("connection/{}: responding to {}", self.mode, method);

        match method.as_str() {
            "init" => {
                let mut request = Program::new()
                    .initiate()
                    .tag("method", "init")
                    .open("params")
                    .string("application", "")
                    .real("version", 0.)
                    .string("modelname", "")
                    .close()
                    .complete();
                let rc = self.client_initiated(&mut request);
                self.check(rc, "init")?;
                info!(
                    "connection/{}: peer application {} version {} model {}",
                    self.mode,
                    request.text("application").unwrap_or(""),
                    request.real_value("version").unwrap_or(0.),
                    request.text("modelname").unwrap_or("")
                );
                let mut reply = Program::new().initiate().tag("result", "init").complete();
                let rc = self.server_response(&mut reply);
                self.check(rc, "init")?;
            }
            "input" | "output" => {
                let selector = if method == "input" {
                    CacheSelector::Read
                } else {
                    CacheSelector::Write
                };
                let mut request = Program::new()
                    .initiate()
                    .tag("method", &method)
                    .open("schema")
                    .schema(selector)
                    .close()
                    .complete();
                let rc = self.client_initiated(&mut request);
                self.check(rc, &method)?;
                let mut reply = Program::new().initiate().tag("result", &method).complete();
                let rc = self.server_response(&mut reply);
                self.check(rc, &method)?;
            }
            phase => {
                let mut request = Program::new()
                    .initiate()
                    .tag("method", phase)
                    .open("data")
                    .data(CacheSelector::Write)
                    .close()
                    .complete();
                let rc = self.client_initiated(&mut request);
                self.check(rc, phase)?;
                self.read_entries(map, xltr);
                self.refresh_writes(map, xltr);
                let mut reply = Program::new()
                    .initiate()
                    .tag("result", phase)
                    .open("data")
                    .data(CacheSelector::Write)
                    .close()
                    .complete();
                let rc = self.server_response(&mut reply);
                self.check(rc, phase)?;
            }
        }
        Ok(method)
    }
}

impl LinkTarget for Connection {
    fn link_entry(&mut self, entry: &VarMapEntry) -> gridlink_core::Result<bool> {
        let cache = match entry.direction {
            Direction::Read => &mut self.read_cache,
            Direction::Write => &mut self.write_cache,
            _ => return Ok(false),
        };
        cache.add_item(&mut self.index, entry, self.translator.clone())?;
        trace!(
            "connection/{}: {} linked to {}",
            self.mode,
            entry.local_name,
            cache.name()
        );
        Ok(true)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.transport.is_open() {
            warn!(
                "connection/{}: closed with an unsent message: '{}'",
                self.mode,
                self.transport.output()
            );
        }
        self.transport.close();
    }
}

fn exchange(what: &str) -> Failure {
    Failure::Handler(Error::Exchange(what.to_string()))
}

fn require_group(state: ExchangeState) -> core::result::Result<(), Failure> {
    match state {
        ExchangeState::GroupOpen | ExchangeState::InGroup(_) => Ok(()),
        _ => Err(exchange("field outside of a message")),
    }
}

/// Splits `key=value` or `key value`.
fn split_setting(setting: &str) -> (&str, &str) {
    let setting = setting.trim();
    match setting.find(|c: char| c == '=' || c.is_whitespace()) {
        Some(i) => (
            setting[..i].trim(),
            setting[i..]
                .trim_start_matches(|c: char| c == '=' || c.is_whitespace())
                .trim(),
        ),
        None => (setting, ""),
    }
}
