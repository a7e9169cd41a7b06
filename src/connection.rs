use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use log::{debug, trace};
use sha1_smol::Sha1;
use url::Url;

use crate::args::Arg;
use crate::parser::ReplyReader;
use crate::pipeline::{db_index_valid, Entry, EntryKind, State};
use crate::types::{Error, ErrorKind, FromResp, Okay, Queued, RedisResult};
use crate::writer::Writer;

static DEFAULT_PORT: u16 = 6379;

/// Connection options.  All fields have usable defaults.
#[derive(Clone, Debug)]
pub struct ConnOptions {
    /// Size of the read buffer (min 512 bytes).
    pub read_buffer_size: usize,
    /// Size of the write buffer (min 512 bytes).
    pub write_buffer_size: usize,
    /// If set, all reads fail once exceeded.
    pub read_timeout: Option<Duration>,
    /// If set, all writes fail once exceeded.
    pub write_timeout: Option<Duration>,
    /// Write-only connections return no replies: the read half is shut
    /// down and `CLIENT REPLY OFF` is issued on connect.
    pub write_only: bool,
    /// Database index selected on connect.
    pub db: u32,
    /// Text prepended to every key argument at serialization time.
    pub key_prefix: String,
    /// If non-empty, `AUTH` is issued on connect.
    pub auth: String,
    /// Disables the EVAL script rewriting.
    pub debug: bool,
}

impl Default for ConnOptions {
    fn default() -> ConnOptions {
        ConnOptions {
            read_buffer_size: 4096,
            write_buffer_size: 4096,
            read_timeout: None,
            write_timeout: None,
            write_only: false,
            db: 0,
            key_prefix: String::new(),
            auth: String::new(),
            debug: false,
        }
    }
}

/// Holds the information needed to open a connection.
#[derive(Clone, Debug, Default)]
pub struct ConnectionInfo {
    /// The `host:port` address of the server.
    pub addr: String,
    pub options: ConnOptions,
}

/// Converts an object into a connection info struct.  This allows the
/// connect function to accept connection information in a range of
/// different formats.
pub trait IntoConnectionInfo {
    fn into_connection_info(self) -> RedisResult<ConnectionInfo>;
}

impl IntoConnectionInfo for ConnectionInfo {
    fn into_connection_info(self) -> RedisResult<ConnectionInfo> {
        Ok(self)
    }
}

impl<'a> IntoConnectionInfo for &'a str {
    fn into_connection_info(self) -> RedisResult<ConnectionInfo> {
        parse_redis_url(self)
    }
}

impl IntoConnectionInfo for String {
    fn into_connection_info(self) -> RedisResult<ConnectionInfo> {
        parse_redis_url(&self)
    }
}

fn parse_duration_ms(value: &str) -> RedisResult<Option<Duration>> {
    match value.parse::<u64>() {
        Ok(0) => Ok(None),
        Ok(ms) => Ok(Some(Duration::from_millis(ms))),
        Err(_) => fail!((
            ErrorKind::InvalidClientConfig,
            "Invalid duration in URL",
            value.to_string()
        )),
    }
}

fn parse_bool(value: &str) -> RedisResult<bool> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" | "" => Ok(false),
        _ => fail!((
            ErrorKind::InvalidClientConfig,
            "Invalid boolean in URL",
            value.to_string()
        )),
    }
}

/// This function takes a redis URL string and parses it into connection
/// information.
///
/// The URL format is `redis://[:<auth>@]<host>[:port][/<db>][?<opt>=…]`
/// where the query options are the kebab-case connection option names
/// with durations given as integer milliseconds.  Pool-level options are
/// recognized and ignored so one URL can configure both layers.
pub fn parse_redis_url(input: &str) -> RedisResult<ConnectionInfo> {
    let url = match Url::parse(input) {
        Ok(url) => url,
        Err(_) => fail!((ErrorKind::InvalidClientConfig, "Redis URL did not parse")),
    };
    if url.scheme() != "redis" {
        fail!((
            ErrorKind::InvalidClientConfig,
            "URL provided is not a redis URL"
        ));
    }
    let host = match url.host_str() {
        Some(host) => host,
        None => fail!((ErrorKind::InvalidClientConfig, "Missing hostname")),
    };
    let mut info = ConnectionInfo {
        addr: format!("{}:{}", host, url.port().unwrap_or(DEFAULT_PORT)),
        options: ConnOptions::default(),
    };
    if let Some(password) = url.password() {
        info.options.auth = password.to_string();
    }
    match url.path().trim_matches('/') {
        "" => {}
        path => {
            info.options.db = match path.parse::<u32>() {
                Ok(db) if db_index_valid(db) => db,
                _ => fail!((ErrorKind::InvalidClientConfig, "Invalid database number")),
            };
        }
    }
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "read-buffer-size" => {
                info.options.read_buffer_size = match value.parse() {
                    Ok(n) => n,
                    Err(_) => fail!((ErrorKind::InvalidClientConfig, "Invalid buffer size")),
                };
            }
            "write-buffer-size" => {
                info.options.write_buffer_size = match value.parse() {
                    Ok(n) => n,
                    Err(_) => fail!((ErrorKind::InvalidClientConfig, "Invalid buffer size")),
                };
            }
            "read-timeout" => info.options.read_timeout = parse_duration_ms(&value)?,
            "write-timeout" => info.options.write_timeout = parse_duration_ms(&value)?,
            "write-only" => info.options.write_only = parse_bool(&value)?,
            "key-prefix" => info.options.key_prefix = value.into_owned(),
            "auth" => info.options.auth = value.into_owned(),
            "debug" => info.options.debug = parse_bool(&value)?,
            // pool options live in the same URL but are not ours
            "max-connections" | "min-connections" | "max-idle-time" | "clock-interval" => {}
            _ => fail!((
                ErrorKind::InvalidClientConfig,
                "Unknown URL option",
                key.into_owned()
            )),
        }
    }
    Ok(info)
}

/// The transport a connection runs on: a full-duplex byte stream with
/// per-I/O deadlines.  `TcpStream` is the production implementation;
/// tests substitute an in-memory double.
pub trait Transport: Read + Write + Send {
    /// Applies a deadline to subsequent reads; `None` blocks forever.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    /// Applies a deadline to subsequent writes; `None` blocks forever.
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    /// Shuts down both halves of the stream.
    fn shutdown(&self) -> io::Result<()>;
    /// Shuts down the read half of the stream.
    fn shutdown_read(&self) -> io::Result<()>;
    /// Returns a second handle to the same stream for the read side.
    fn try_clone(&self) -> io::Result<Box<dyn Transport>>;
}

impl Transport for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn shutdown_read(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Read)
    }

    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(TcpStream::try_clone(self)?))
    }
}

/// A single full-duplex client connection.
///
/// The connection owns the byte stream, the codec state for each
/// direction and the pipeline accounting.  It is single-owner: batches
/// and subscribers acquire exclusive use of it.
///
/// Basic usage:
///
/// ```rust,no_run
/// use redpipe::{Arg, Connection};
///
/// # fn run() -> redpipe::RedisResult<()> {
/// let mut con = Connection::connect("redis://127.0.0.1/")?;
/// con.do_command::<()>("SET", &[Arg::key("answer"), Arg::Int(42)])?;
/// let value: i64 = con.do_command("GET", &[Arg::key("answer")])?;
/// assert_eq!(value, 42);
/// # Ok(()) }
/// ```
pub struct Connection {
    pub(crate) r: ReplyReader<Box<dyn Transport>>,
    pub(crate) w: Writer<Box<dyn Transport>>,
    pub(crate) state: State,
    pub(crate) options: ConnOptions,
    pub(crate) scripts: HashMap<Arg, String>,
    pub(crate) managed: bool,
    pub(crate) err: Option<Error>,
    // the entry consumed by the most recent reply read
    last_entry: Entry,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    /// Opens a TCP connection and prepares it per the options:
    /// authentication, database selection, and reply-mode for
    /// write-only connections.
    pub fn connect<I: IntoConnectionInfo>(info: I) -> RedisResult<Connection> {
        let info = info.into_connection_info()?;
        let stream = TcpStream::connect(info.addr.as_str())?;
        debug!("connected to {}", info.addr);
        Connection::new(Box::new(stream), info.options)
    }

    /// Wraps an established transport into a connection and runs the
    /// connect-time setup.
    pub fn new(transport: Box<dyn Transport>, options: ConnOptions) -> RedisResult<Connection> {
        transport.set_read_timeout(options.read_timeout)?;
        transport.set_write_timeout(options.write_timeout)?;
        let read_half = transport.try_clone()?;
        let mut conn = Connection {
            r: ReplyReader::with_capacity(options.read_buffer_size, read_half),
            w: Writer::with_capacity(options.write_buffer_size, transport),
            state: State::new(),
            options,
            scripts: HashMap::new(),
            managed: false,
            err: None,
            last_entry: Entry::default(),
        };
        conn.setup()?;
        Ok(conn)
    }

    fn setup(&mut self) -> RedisResult<()> {
        let auth = self.options.auth.clone();
        if !auth.is_empty() {
            self.auth(&auth)?;
        }
        let db = self.options.db;
        if db != 0 {
            if !db_index_valid(db) {
                fail!((ErrorKind::InvalidClientConfig, "Invalid database number"));
            }
            let _: Okay = self.do_command("SELECT", &[Arg::Uint(db as u64)])?;
        }
        if self.options.write_only {
            self.write_client_reply("OFF")?;
            self.flush()?;
            self.transport().shutdown_read()?;
        }
        Ok(())
    }

    fn transport(&self) -> &dyn Transport {
        &**self.w.get_ref()
    }

    /// Checks if the connection is managed by a higher-level construct.
    pub fn is_managed(&self) -> bool {
        self.managed
    }

    /// Checks if the connection has replies pending to be scanned.
    pub fn dirty(&self) -> bool {
        self.state.dirty()
    }

    /// Returns the sticky error of the connection, if any.
    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Returns the connection options.
    pub fn options(&self) -> &ConnOptions {
        &self.options
    }

    /// Writes a command into the pipeline buffer, updating the pipeline
    /// state.  The reply is read back later with [`Connection::scan`].
    ///
    /// `CLIENT` subcommands are rejected: the library relies on the
    /// reply-mode state being changed only through its own internal
    /// writes.
    pub fn write_command(&mut self, name: &str, args: &[Arg]) -> RedisResult<()> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if self.managed {
            fail!((
                ErrorKind::ConnectionManaged,
                "Connection managed by another construct"
            ));
        }
        let name = name.to_uppercase();
        if !self.options.debug && name == "EVAL" && !args.is_empty() {
            return self.write_eval(args);
        }
        if name == "CLIENT" {
            fail!((
                ErrorKind::InvalidClientConfig,
                "CLIENT commands not allowed"
            ));
        }
        self.write_raw(&name, args)
    }

    /// Writes a command where the first argument is a key and the rest
    /// are plain strings.
    pub fn write_quick(&mut self, name: &str, key: &str, args: &[&str]) -> RedisResult<()> {
        let args = crate::args::quick_args(key, args.iter().map(|s| s.to_string()));
        self.write_command(name, &args)
    }

    // The raw write path: no CLIENT guard, no EVAL rewriting.  Used by
    // the internal commands as well as the user path once a command has
    // passed the checks.
    pub(crate) fn write_raw(&mut self, name: &str, args: &[Arg]) -> RedisResult<()> {
        if let Err(err) = self.w.write_command(&self.options.key_prefix, name, args) {
            return Err(self.close_with_error(err));
        }
        self.update_pipeline(name, args);
        Ok(())
    }

    /// Executes a command: writes it, flushes, and reads one reply.
    /// The connection must have no pending replies.
    pub fn do_command<T: FromResp>(&mut self, name: &str, args: &[Arg]) -> RedisResult<T> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if self.dirty() {
            fail!((ErrorKind::ReplyPending, "Pending replies"));
        }
        self.write_command(name, args)?;
        self.scan()
    }

    /// Reads the next non-suppressed reply and decodes it.
    ///
    /// Transport and protocol errors close the connection; decode
    /// errors surface to the caller and leave the connection healthy.
    pub fn scan<T: FromResp>(&mut self) -> RedisResult<T> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if self.managed {
            fail!((
                ErrorKind::ConnectionManaged,
                "Connection managed by another construct"
            ));
        }
        if self.options.write_only {
            fail!((ErrorKind::ConnectionWriteOnly, "Connection write only"));
        }
        self.flush()?;
        self.fill_reply()?;
        self.r.value().decode()
    }

    /// Pops the next reply-bearing entry and parses its reply into the
    /// incoming message, honoring the entry's blocking timeout.
    pub(crate) fn fill_reply(&mut self) -> RedisResult<()> {
        let entry = loop {
            match self.state.pop() {
                Some(entry) if entry.skip => continue,
                Some(entry) => break entry,
                None => fail!((ErrorKind::NoReplies, "No more replies")),
            }
        };
        self.apply_read_timeout(&entry)?;
        if let Err(err) = self.r.fill_next() {
            return Err(self.close_with_error(err));
        }
        Ok(())
    }

    /// Discards the next reply-bearing reply without parsing it into
    /// the arena.
    fn discard_reply(&mut self) -> RedisResult<bool> {
        let entry = loop {
            match self.state.pop() {
                Some(entry) if entry.skip => continue,
                Some(entry) => break entry,
                None => return Ok(false),
            }
        };
        self.apply_read_timeout(&entry)?;
        if let Err(err) = self.r.skip() {
            return Err(self.close_with_error(err));
        }
        Ok(true)
    }

    /// Reads an outstanding MULTI/EXEC span: the `OK` ack of `MULTI`,
    /// one `QUEUED` ack per buffered command, and finally the `EXEC`
    /// array decoded element by element into `dest`.
    ///
    /// A null-array `EXEC` reply means a watched key changed and the
    /// transaction was aborted: this surfaces as a `Null` error.  An
    /// error frame at `EXEC` time (e.g. `EXECABORT`) surfaces as a
    /// transaction-aborted error.  A `DISCARD` inside the span yields a
    /// transaction-discarded error.
    pub fn scan_multi<T: FromResp>(&mut self, dest: &mut Vec<T>) -> RedisResult<()> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if self.managed {
            fail!((
                ErrorKind::ConnectionManaged,
                "Connection managed by another construct"
            ));
        }
        if self.options.write_only {
            fail!((ErrorKind::ConnectionWriteOnly, "Connection write only"));
        }
        self.flush()?;

        self.fill_reply()?;
        let entry = self.last_entry;
        if entry.kind != EntryKind::Multi {
            fail!((
                ErrorKind::ResponseError,
                "No MULTI/EXEC transaction pending"
            ));
        }
        self.r.value().decode::<Okay>()?;

        let mut queued = 0usize;
        loop {
            self.fill_reply()?;
            match self.last_entry.kind {
                EntryKind::Exec => break,
                EntryKind::Discard => {
                    self.r.value().decode::<Okay>()?;
                    fail!((
                        ErrorKind::TransactionDiscarded,
                        "MULTI/EXEC transaction discarded"
                    ));
                }
                _ => {
                    self.r.value().decode::<Queued>()?;
                    queued += 1;
                }
            }
        }

        // EXEC reply
        if self.r.value().is_null_array() {
            fail!((
                ErrorKind::Null,
                "Transaction aborted by a watched key change"
            ));
        }
        if let Some(msg) = self.r.value().as_error() {
            return Err(Error::server(msg));
        }
        match self.r.value().array_len() {
            Some(n) if n == queued => {}
            _ => fail!((
                ErrorKind::ResponseError,
                "EXEC reply does not match the queued commands"
            )),
        }
        let mut err = None;
        if let Some(iter) = self.r.value().iter() {
            for item in iter {
                match item.decode() {
                    Ok(x) => dest.push(x),
                    Err(e) => {
                        err = Some(e);
                        break;
                    }
                }
            }
        }
        match err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Pushes the writer's buffer to the underlying stream.
    pub fn flush(&mut self) -> RedisResult<()> {
        if let Err(err) = self.w.flush() {
            return Err(self.close_with_error(err));
        }
        Ok(())
    }

    /// Drains every pending reply, leaving the pipeline empty.
    fn drain(&mut self) -> RedisResult<()> {
        while self.discard_reply()? {}
        Ok(())
    }

    /// Restores the connection to a clean reusable state per the given
    /// options (or the current ones): an open MULTI is discarded,
    /// watches are cleared, the reply mode is reconciled, the database
    /// is re-selected when it differs, and all pending replies are
    /// drained.
    pub fn reset(&mut self, options: Option<&ConnOptions>) -> RedisResult<()> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if self.managed {
            fail!((
                ErrorKind::ConnectionManaged,
                "Connection managed by another construct"
            ));
        }
        if let Some(options) = options {
            self.options = options.clone();
        }
        trace!("resetting connection");
        if self.state.is_multi() {
            let _ = self.write_raw("DISCARD", &[]);
        } else if self.state.is_watch() {
            let _ = self.write_raw("UNWATCH", &[]);
        }
        if self.options.write_only {
            let _ = self.write_client_reply("OFF");
        } else if self.state.is_reply_off() {
            let _ = self.write_client_reply("ON");
        } else if self.state.is_reply_skip() {
            // a throwaway command consumes the pending skip
            let _ = self.write_raw("PING", &[]);
        }
        let db = self.options.db;
        if db_index_valid(db) && self.state.db() != db {
            let _ = self.inject_command("SELECT", &[Arg::Uint(db as u64)]);
        }
        if self.options.write_only {
            self.flush()?;
        } else {
            self.flush()?;
            self.drain()?;
        }
        match &self.err {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Closes the underlying stream.  Every subsequent operation fails
    /// with the sticky close error.
    pub fn close(&mut self) -> RedisResult<()> {
        if self.err.is_none() {
            self.close_with_error(Error::from((
                ErrorKind::ConnectionClosed,
                "Connection closed",
            )));
            return Ok(());
        }
        Err(self.err.clone().unwrap())
    }

    pub(crate) fn close_with_error(&mut self, err: Error) -> Error {
        if self.err.is_none() {
            debug!("closing connection: {}", err);
            self.err = Some(err.clone());
            let _ = self.transport().shutdown();
        }
        err
    }

    /// Authenticates the connection.
    pub fn auth(&mut self, password: &str) -> RedisResult<()> {
        match self.do_command::<Okay>("AUTH", &[Arg::string(password)]) {
            Ok(_) => Ok(()),
            Err(err) => fail!((
                ErrorKind::AuthenticationFailed,
                "Authentication failed",
                err.to_string()
            )),
        }
    }

    // Writes a command whose reply must not surface to callers.  The
    // reply is suppressed through `CLIENT REPLY SKIP`, except when the
    // connection already suppresses all replies.  Never valid inside an
    // active MULTI block.
    pub(crate) fn inject_command(&mut self, name: &str, args: &[Arg]) -> RedisResult<()> {
        if self.state.is_multi() {
            fail!((
                ErrorKind::InvalidClientConfig,
                "Connection is in a MULTI/EXEC transaction"
            ));
        }
        if self.state.is_reply_off() || self.options.write_only {
            return self.write_raw(name, args);
        }
        if self.state.is_reply_skip() {
            fail!((
                ErrorKind::InvalidClientConfig,
                "Connection is already on CLIENT REPLY SKIP"
            ));
        }
        self.write_client_reply("SKIP")?;
        self.write_raw(name, args)
    }

    fn write_client_reply(&mut self, mode: &str) -> RedisResult<()> {
        self.write_raw("CLIENT", &[Arg::string("REPLY"), Arg::string(mode)])
    }

    // EVAL interception: a cached script is rewritten to EVALSHA; a new
    // script is loaded with a suppressed SCRIPT LOAD ahead of the
    // rewritten command and cached under its original argument.
    fn write_eval(&mut self, args: &[Arg]) -> RedisResult<()> {
        if let Some(digest) = self.scripts.get(&args[0]).cloned() {
            trace!("script cache hit: {}", digest);
            let mut args = args.to_vec();
            args[0] = Arg::Str(digest);
            return self.write_raw("EVALSHA", &args);
        }
        let script = match args[0].as_str() {
            Some(script) => script.to_string(),
            None => return self.write_raw("EVAL", args),
        };
        let digest = sha1_hex(&script);
        debug!("loading script {}", digest);
        self.scripts.insert(args[0].clone(), digest.clone());
        self.inject_command("SCRIPT", &[Arg::string("LOAD"), Arg::string(&script)])?;
        let mut args = args.to_vec();
        args[0] = Arg::Str(digest);
        self.write_raw("EVALSHA", &args)
    }

    /// Evaluates a Lua script.  The first `num_keys` of `args` are sent
    /// as keys (`KEYS[i]`), the rest as plain values (`ARGV[i]`).  A
    /// 40-hex-digit `script` is sent as `EVALSHA` directly.
    pub fn eval<T: FromResp>(
        &mut self,
        script: &str,
        num_keys: usize,
        args: &[&str],
    ) -> RedisResult<T> {
        let name = if is_sha1_hex(script) { "EVALSHA" } else { "EVAL" };
        self.do_command(name, &eval_args(script, num_keys, args))
    }

    /// Loads a Lua script into the server cache and primes the local
    /// EVAL rewrite cache, returning the script's hex digest.
    pub fn load_script(&mut self, script: &str) -> RedisResult<String> {
        let digest: Option<String> =
            self.do_command("SCRIPT", &[Arg::string("LOAD"), Arg::string(script)])?;
        let digest = match digest {
            Some(digest) => digest,
            None => fail!((ErrorKind::Null, "Null value")),
        };
        self.scripts.insert(Arg::string(script), digest.clone());
        Ok(digest)
    }

    // Applies the read deadline for the entry about to be read: the
    // configured read timeout, extended by the declared blocking
    // timeout.  A blocking command with no timeout clears the deadline
    // entirely.  Queued entries never block (the server pops
    // immediately inside MULTI/EXEC).
    fn apply_read_timeout(&mut self, entry: &Entry) -> RedisResult<()> {
        self.last_entry = *entry;
        let timeout = if entry.block && !entry.queued {
            if entry.timeout > Duration::from_secs(0) {
                match self.options.read_timeout {
                    Some(t) => Some(t + entry.timeout),
                    None => Some(entry.timeout),
                }
            } else {
                None
            }
        } else {
            self.options.read_timeout
        };
        if let Err(err) = self.transport().set_read_timeout(timeout) {
            return Err(self.close_with_error(Error::from(err)));
        }
        Ok(())
    }

    fn update_pipeline(&mut self, name: &str, args: &[Arg]) {
        match name {
            "SELECT" => match select_arg(args) {
                Some(db) if db_index_valid(db) => self.state.select(db),
                _ => self.state.command(),
            },
            "MULTI" => self.state.multi(),
            "EXEC" => self.state.exec(),
            "DISCARD" => self.state.discard(),
            "WATCH" => self.state.watch(args.len()),
            "UNWATCH" => self.state.unwatch(),
            "CLIENT" => match client_reply_arg(args) {
                Some("OFF") => self.state.reply_off(),
                Some("ON") => self.state.reply_on(),
                Some("SKIP") => self.state.reply_skip(),
                _ => self.state.command(),
            },
            "BLPOP" | "BRPOP" | "BRPOPLPUSH" | "BZPOPMIN" | "BZPOPMAX" => {
                self.state.block(last_arg_timeout(args));
            }
            _ => self.state.command(),
        }
    }
}

fn select_arg(args: &[Arg]) -> Option<u32> {
    let n = args.first()?.as_int()?;
    if n >= 0 {
        Some(n as u32)
    } else {
        None
    }
}

fn client_reply_arg(args: &[Arg]) -> Option<&str> {
    if args.len() != 2 {
        return None;
    }
    if !args[0].as_str()?.eq_ignore_ascii_case("REPLY") {
        return None;
    }
    match args[1].as_str()? {
        s if s.eq_ignore_ascii_case("OFF") => Some("OFF"),
        s if s.eq_ignore_ascii_case("ON") => Some("ON"),
        s if s.eq_ignore_ascii_case("SKIP") => Some("SKIP"),
        _ => None,
    }
}

// Blocking commands carry their timeout in seconds as the last
// argument.
fn last_arg_timeout(args: &[Arg]) -> Duration {
    let secs = match args.last() {
        Some(Arg::Int(n)) => *n as f64,
        Some(Arg::Uint(n)) => *n as f64,
        Some(Arg::Float64(f)) => *f,
        Some(Arg::Str(s)) => s.parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    if secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::from_secs(0)
    }
}

fn eval_args(script: &str, num_keys: usize, args: &[&str]) -> Vec<Arg> {
    let mut argv = Vec::with_capacity(args.len() + 2);
    argv.push(Arg::string(script));
    argv.push(Arg::Uint(num_keys as u64));
    for (i, arg) in args.iter().enumerate() {
        if i < num_keys {
            argv.push(Arg::key(*arg));
        } else {
            argv.push(Arg::string(*arg));
        }
    }
    argv
}

pub(crate) fn sha1_hex(script: &str) -> String {
    let mut hash = Sha1::new();
    hash.update(script.as_bytes());
    hash.digest().to_string()
}

fn is_sha1_hex(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    // a transport that swallows writes and never yields reads
    struct NullTransport;

    impl Read for NullTransport {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for NullTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for NullTransport {
        fn set_read_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
            Ok(())
        }

        fn set_write_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
            Ok(())
        }

        fn shutdown(&self) -> io::Result<()> {
            Ok(())
        }

        fn shutdown_read(&self) -> io::Result<()> {
            Ok(())
        }

        fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
            Ok(Box::new(NullTransport))
        }
    }

    fn test_conn() -> Connection {
        Connection::new(Box::new(NullTransport), ConnOptions::default()).unwrap()
    }

    #[test]
    fn managed_connections_refuse_direct_use() {
        let mut conn = test_conn();
        conn.managed = true;
        assert!(conn.is_managed());
        let err = conn.write_command("PING", &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionManaged);
        let err = conn.scan::<crate::types::Value>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionManaged);
        let err = conn.reset(None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionManaged);
        conn.managed = false;
        assert!(conn.write_command("PING", &[]).is_ok());
    }

    #[test]
    fn inject_refuses_to_stack_reply_skips() {
        let mut conn = test_conn();
        conn.inject_command("SELECT", &[Arg::Uint(1)]).unwrap();
        // pipeline: CLIENT REPLY SKIP + SELECT, both suppressed
        assert_eq!(conn.state.count_replies(), 0);
        assert_eq!(conn.state.len(), 2);

        conn.state.reply_skip();
        let err = conn.inject_command("SELECT", &[Arg::Uint(2)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidClientConfig);
    }

    #[test]
    fn inject_inside_multi_is_rejected() {
        let mut conn = test_conn();
        conn.write_command("MULTI", &[]).unwrap();
        let err = conn.inject_command("SELECT", &[Arg::Uint(1)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidClientConfig);
    }

    #[test]
    fn script_hashing_matches_the_server() {
        assert_eq!(sha1_hex(""), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
        assert_eq!(
            sha1_hex("return {KEYS[1],ARGV[1],KEYS[2],ARGV[2]}"),
            "da95252e2c27e41cd53b9114f28b4ba84e7d64d4"
        );
        assert!(is_sha1_hex("da95252e2c27e41cd53b9114f28b4ba84e7d64d4"));
        assert!(!is_sha1_hex("return 1"));
    }

    #[test]
    fn blocking_commands_record_their_timeout() {
        let mut conn = test_conn();
        conn.write_command("BLPOP", &[Arg::key("k"), Arg::Int(5)])
            .unwrap();
        let entry = conn.state.pop().unwrap();
        assert!(entry.block);
        assert_eq!(entry.timeout, Duration::from_secs(5));

        conn.write_command("BRPOPLPUSH", &[Arg::key("a"), Arg::key("b"), Arg::string("1.5")])
            .unwrap();
        let entry = conn.state.pop().unwrap();
        assert!(entry.block);
        assert_eq!(entry.timeout, Duration::from_secs_f64(1.5));
    }

    #[test]
    fn client_reply_classification() {
        let args = [Arg::string("reply"), Arg::string("skip")];
        assert_eq!(client_reply_arg(&args), Some("SKIP"));
        let args = [Arg::string("REPLY"), Arg::string("ON")];
        assert_eq!(client_reply_arg(&args), Some("ON"));
        let args = [Arg::string("LIST")];
        assert_eq!(client_reply_arg(&args), None);
        assert_eq!(select_arg(&[Arg::Int(7)]), Some(7));
        assert_eq!(select_arg(&[Arg::string("7")]), None);
    }
}
