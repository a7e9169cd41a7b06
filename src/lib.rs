//! redpipe is a pipelined client library for RESP key-value servers.
//! It exposes the protocol at a low level — commands in, typed replies
//! out — and builds pipelining, transactions, batches and pub/sub on
//! top of a single connection primitive.
//!
//! The crate is called `redpipe` and you can depend on it via cargo:
//!
//! ```ini
//! [dependencies]
//! redpipe = "0.1"
//! ```
//!
//! # Basic Operation
//!
//! Commands are written as a name plus a slice of typed [`Arg`] values.
//! Key arguments are distinguished from plain strings so a
//! connection-wide key prefix can be applied at serialization time.
//! Replies decode into whatever target type implements [`FromResp`]:
//!
//! ```rust,no_run
//! use redpipe::{Arg, Connection};
//!
//! fn do_something() -> redpipe::RedisResult<()> {
//!     let mut con = Connection::connect("redis://127.0.0.1/")?;
//!     con.do_command::<()>("SET", &[Arg::key("my_key"), Arg::Int(42)])?;
//!     let count: i64 = con.do_command("GET", &[Arg::key("my_key")])?;
//!     assert_eq!(count, 42);
//!     Ok(())
//! }
//! ```
//!
//! ## Connection Parameters
//!
//! `Connection::connect` accepts anything that implements
//! [`IntoConnectionInfo`], most usefully a URL in the form
//! `redis://[:<auth>@]<host>[:port][/<db>]` with the remaining
//! connection options as kebab-case query parameters
//! (`?read-timeout=1000&key-prefix=myapp:`).
//!
//! # Pipelining
//!
//! Commands and replies are decoupled: [`Connection::write_command`]
//! queues a command, [`Connection::flush`] pushes the buffer out, and
//! [`Connection::scan`] reads the next reply.  The connection tracks
//! which written commands will produce replies — including
//! reply-suppressed internal commands and transactions — so scans
//! always line up with the right frame on the wire:
//!
//! ```rust,no_run
//! # use redpipe::{Arg, Connection};
//! # fn do_something(con: &mut Connection) -> redpipe::RedisResult<()> {
//! con.write_command("INCR", &[Arg::key("a")])?;
//! con.write_command("INCR", &[Arg::key("b")])?;
//! let a: i64 = con.scan()?;
//! let b: i64 = con.scan()?;
//! # Ok(()) }
//! ```
//!
//! # Batches and Transactions
//!
//! A [`Batch`] accumulates commands bound to typed reply handles and
//! executes them in one round-trip.  A [`Tx`] queues commands for a
//! MULTI/EXEC transaction inside a batch:
//!
//! ```rust,no_run
//! use redpipe::{Arg, Batch, Connection, Tx};
//!
//! # fn do_something(con: &mut Connection) -> redpipe::RedisResult<()> {
//! let mut tx = Tx::new();
//! let n = tx.integer("HINCRBY", &[Arg::key("h"), Arg::string("f"), Arg::Int(2)]);
//! let mut batch = Batch::new();
//! let all = batch.multi(&mut tx);
//! con.do_batch(&mut batch)?;
//! all.take()?;
//! assert_eq!(n.take()?, 2);
//! # Ok(()) }
//! ```
//!
//! # Scripts
//!
//! When a connection is not in debug mode, `EVAL` commands are
//! transparently rewritten: the script is loaded once with
//! `SCRIPT LOAD` and every subsequent invocation goes out as `EVALSHA`
//! with the cached digest.
//!
//! # PubSub
//!
//! A connection converts into a [`Subscriber`] that dispatches inbound
//! messages onto a bounded channel from a background reader:
//!
//! ```rust,no_run
//! # fn do_something() -> redpipe::RedisResult<()> {
//! let con = redpipe::Connection::connect("redis://127.0.0.1/")?;
//! let sub = con.subscriber(64)?;
//! sub.subscribe(&["channel_1", "channel_2"])?;
//! while let Some(msg) = sub.block() {
//!     println!("channel '{}': {}", msg.channel, msg.payload);
//! }
//! # Ok(()) }
//! ```

#![deny(non_camel_case_types)]

mod macros;

mod args;
mod batch;
mod connection;
mod parser;
mod pipeline;
mod pubsub;
mod types;
mod writer;

// public api
pub use crate::args::{quick_args, Arg, ArgBuilder};
pub use crate::batch::{Batch, Reply, ReplyTx, Tx};
pub use crate::connection::{
    parse_redis_url, ConnOptions, Connection, ConnectionInfo, IntoConnectionInfo, Transport,
};
pub use crate::parser::{
    parse_resp_value, Iter, Kind, Message, ReplyReader, ValueRef, CRLF, MAX_BULK_STRING_SIZE,
};
pub use crate::pipeline::{db_index_valid, MAX_DB_INDEX};
pub use crate::pubsub::{PubSubMessage, Subscriber};
pub use crate::types::{
    // utility functions
    from_resp,

    // conversion trait
    FromResp,

    // error and result types
    DecodeError,
    Error,
    ErrorKind,
    RedisResult,

    // status asserts
    Okay,
    Queued,

    // low level values
    Value,
};
pub use crate::writer::Writer;
