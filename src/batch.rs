use std::cell::RefCell;
use std::rc::Rc;

use crate::args::Arg;
use crate::connection::Connection;
use crate::parser::ValueRef;
use crate::types::{Error, ErrorKind, FromResp, Okay, Queued, RedisResult, Value};

/// A reply sink: the destination a batch demultiplexes one reply into.
/// Sinks either receive a parsed value to decode or are rejected with
/// an error.  They never fail the batch themselves: the outcome is
/// stored for later retrieval through the reply handle.
trait Sink {
    fn resolve(&self, v: ValueRef<'_>);
    fn reject(&self, err: &Error);
}

type SinkCell<T> = Rc<RefCell<Option<RedisResult<T>>>>;

impl<T: FromResp> Sink for RefCell<Option<RedisResult<T>>> {
    fn resolve(&self, v: ValueRef<'_>) {
        // decode errors are stored, not thrown; stripped of the decode
        // wrapper they read like the scan errors a direct caller gets
        *self.borrow_mut() = Some(v.decode::<T>().map_err(Error::unwrap_decode));
    }

    fn reject(&self, err: &Error) {
        let mut slot = self.borrow_mut();
        if slot.is_none() {
            *slot = Some(Err(err.clone()));
        }
    }
}

/// A typed handle to one reply of a batch.
///
/// Until the batch executes, the handle reports `ReplyPending`.  After
/// execution it holds either the decoded value or the error of this one
/// command, independent of the rest of the batch.
pub struct Reply<T> {
    cell: SinkCell<T>,
}

impl<T: FromResp> Reply<T> {
    fn new() -> (Reply<T>, SinkCell<T>) {
        let cell: SinkCell<T> = Rc::new(RefCell::new(None));
        (Reply { cell: cell.clone() }, cell)
    }

    /// Takes the reply out of the handle.
    pub fn take(&self) -> RedisResult<T> {
        match self.cell.borrow_mut().take() {
            Some(res) => res,
            None => Err(Error::from((ErrorKind::ReplyPending, "Reply pending"))),
        }
    }
}

impl<T: FromResp + Clone> Reply<T> {
    /// Returns a copy of the reply, leaving it in the handle.
    pub fn get(&self) -> RedisResult<T> {
        match &*self.cell.borrow() {
            Some(res) => res.clone(),
            None => Err(Error::from((ErrorKind::ReplyPending, "Reply pending"))),
        }
    }
}

/// The aggregate handle of a queued MULTI/EXEC transaction.  Children
/// receive their individual outcomes from the `EXEC` array; this handle
/// reports whether the transaction as a whole went through.
pub struct ReplyTx {
    cell: SinkCell<()>,
}

impl ReplyTx {
    /// Takes the transaction outcome out of the handle.
    pub fn take(&self) -> RedisResult<()> {
        match self.cell.borrow_mut().take() {
            Some(res) => res,
            None => Err(Error::from((ErrorKind::ReplyPending, "Reply pending"))),
        }
    }
}

struct BatchCmd {
    name: String,
    argv: u32,
    argc: u32,
}

enum BatchSink {
    Plain(Rc<dyn Sink>),
    Tx {
        cell: SinkCell<()>,
        children: Vec<Rc<dyn Sink>>,
    },
}

#[derive(Default)]
struct BatchCore {
    args: Vec<Arg>,
    commands: Vec<BatchCmd>,
    sinks: Vec<BatchSink>,
}

impl BatchCore {
    fn push<T: FromResp + 'static>(&mut self, name: &str, args: &[Arg]) -> Reply<T> {
        let argv = self.args.len() as u32;
        self.args.extend_from_slice(args);
        self.commands.push(BatchCmd {
            name: name.to_string(),
            argv,
            argc: args.len() as u32,
        });
        let (reply, cell) = Reply::new();
        self.sinks.push(BatchSink::Plain(cell));
        reply
    }

    fn reset(&mut self) {
        self.args.clear();
        self.commands.clear();
        self.sinks.clear();
    }

    fn cmd_args<'a>(&'a self, cmd: &BatchCmd) -> &'a [Arg] {
        let start = cmd.argv as usize;
        let end = start + cmd.argc as usize;
        &self.args[start..end]
    }
}

macro_rules! batch_api {
    ($t:ident) => {
        impl $t {
            /// Queues a command returning an untyped reply handle.
            pub fn do_cmd(&mut self, name: &str, args: &[Arg]) -> Reply<Value> {
                self.core.push(name, args)
            }

            /// Queues a command expecting an integer reply.
            pub fn integer(&mut self, name: &str, args: &[Arg]) -> Reply<i64> {
                self.core.push(name, args)
            }

            /// Queues a command expecting a 0/1 integer reply.
            pub fn boolean(&mut self, name: &str, args: &[Arg]) -> Reply<bool> {
                self.core.push(name, args)
            }

            /// Queues a command expecting a bulk string parsed as float.
            pub fn float(&mut self, name: &str, args: &[Arg]) -> Reply<f64> {
                self.core.push(name, args)
            }

            /// Queues a command expecting a string reply.
            pub fn string(&mut self, name: &str, args: &[Arg]) -> Reply<String> {
                self.core.push(name, args)
            }

            /// Queues a command expecting an array of non-null bulk
            /// strings.
            pub fn strings(&mut self, name: &str, args: &[Arg]) -> Reply<Vec<String>> {
                self.core.push(name, args)
            }

            /// Queues a command expecting an `OK` status.
            pub fn okay(&mut self, name: &str, args: &[Arg]) -> Reply<Okay> {
                self.core.push(name, args)
            }

            /// The number of commands queued.
            pub fn len(&self) -> usize {
                self.core.commands.len()
            }

            /// Checks if no commands are queued.
            pub fn is_empty(&self) -> bool {
                self.core.commands.is_empty()
            }

            /// Clears all queued commands and sinks for reuse.
            pub fn reset(&mut self) {
                self.core.reset();
            }
        }
    };
}

/// A batch of commands executed as one pipeline round-trip.
///
/// Commands accumulate together with typed reply handles; executing the
/// batch on a connection with [`Connection::do_batch`] writes every
/// command, flushes once, and demultiplexes the replies back to the
/// handles in order.
///
/// ```rust,no_run
/// use redpipe::{Arg, Batch, Connection};
///
/// # fn run() -> redpipe::RedisResult<()> {
/// let mut con = Connection::connect("redis://127.0.0.1/")?;
/// let mut batch = Batch::new();
/// batch.okay("SET", &[Arg::key("foo"), Arg::Int(1)]);
/// let n = batch.integer("INCRBY", &[Arg::key("foo"), Arg::Int(41)]);
/// con.do_batch(&mut batch)?;
/// assert_eq!(n.take()?, 42);
/// # Ok(()) }
/// ```
#[derive(Default)]
pub struct Batch {
    core: BatchCore,
}

/// A MULTI/EXEC transaction block under construction.  Queue commands
/// exactly like a batch, then attach it to one with [`Batch::multi`].
#[derive(Default)]
pub struct Tx {
    core: BatchCore,
}

batch_api!(Batch);
batch_api!(Tx);

impl Batch {
    /// Creates an empty batch.
    pub fn new() -> Batch {
        Batch::default()
    }

    /// Queues `tx` as a MULTI/EXEC transaction: `MULTI`, every command
    /// accumulated in `tx`, then `EXEC`.  The transaction registers as
    /// a single composite reply; each queued command's handle receives
    /// its element of the `EXEC` array.  `tx` is left empty.
    pub fn multi(&mut self, tx: &mut Tx) -> ReplyTx {
        let cell: SinkCell<()> = Rc::new(RefCell::new(None));
        let mut children = Vec::with_capacity(tx.core.sinks.len());
        self.core.commands.push(BatchCmd {
            name: "MULTI".to_string(),
            argv: self.core.args.len() as u32,
            argc: 0,
        });
        for cmd in tx.core.commands.drain(..) {
            let argv = self.core.args.len() as u32;
            let start = cmd.argv as usize;
            let end = start + cmd.argc as usize;
            self.core.args.extend_from_slice(&tx.core.args[start..end]);
            self.core.commands.push(BatchCmd {
                name: cmd.name,
                argv,
                argc: cmd.argc,
            });
        }
        for sink in tx.core.sinks.drain(..) {
            if let BatchSink::Plain(sink) = sink {
                children.push(sink);
            }
        }
        self.core.commands.push(BatchCmd {
            name: "EXEC".to_string(),
            argv: self.core.args.len() as u32,
            argc: 0,
        });
        self.core.sinks.push(BatchSink::Tx {
            cell: cell.clone(),
            children,
        });
        tx.core.reset();
        ReplyTx { cell }
    }
}

impl Tx {
    /// Creates an empty transaction block.
    pub fn new() -> Tx {
        Tx::default()
    }
}

fn reject_all(sinks: &[BatchSink], err: &Error) {
    for sink in sinks {
        match sink {
            BatchSink::Plain(sink) => sink.reject(err),
            BatchSink::Tx { cell, children } => {
                Sink::reject(&**cell, err);
                for child in children {
                    child.reject(err);
                }
            }
        }
    }
}

impl Connection {
    /// Executes a batch: writes all accumulated commands, flushes once,
    /// and demultiplexes the replies into the batch's handles in order.
    ///
    /// A decode failure is stored on the affected handle and does not
    /// abort the batch.  A transport error aborts the batch and rejects
    /// every remaining handle with the same error.  The batch is reset
    /// afterwards either way.
    pub fn do_batch(&mut self, b: &mut Batch) -> RedisResult<()> {
        let res = self.do_batch_inner(&b.core);
        b.reset();
        res
    }

    fn do_batch_inner(&mut self, core: &BatchCore) -> RedisResult<()> {
        if let Some(err) = self.err() {
            return Err(err.clone());
        }
        if self.state.count_replies() > 0 {
            fail!((ErrorKind::ReplyPending, "Reply pending"));
        }
        if let Err(err) = self.write_batch(core) {
            reject_all(&core.sinks, &err);
            return Err(err);
        }
        self.scan_batch(&core.sinks)
    }

    fn write_batch(&mut self, core: &BatchCore) -> RedisResult<()> {
        for cmd in &core.commands {
            self.write_command(&cmd.name, core.cmd_args(cmd))?;
        }
        // a batch that opened a MULTI without closing it still has to
        // read an EXEC reply
        if self.state.is_multi() {
            self.write_command("EXEC", &[])?;
        }
        self.flush()
    }

    fn scan_batch(&mut self, sinks: &[BatchSink]) -> RedisResult<()> {
        for i in 0..sinks.len() {
            let res = match &sinks[i] {
                BatchSink::Plain(sink) => self.scan_sink(&**sink),
                BatchSink::Tx { cell, children } => self.scan_tx(cell, children),
            };
            if let Err(err) = res {
                reject_all(&sinks[i..], &err);
                return Err(err);
            }
        }
        Ok(())
    }

    // Reads one reply into a sink.  Only transport-level failures
    // escape; decode errors are stored on the sink.
    fn scan_sink(&mut self, sink: &dyn Sink) -> RedisResult<()> {
        self.fill_reply()?;
        sink.resolve(self.r.value());
        Ok(())
    }

    fn scan_tx(&mut self, cell: &SinkCell<()>, children: &[Rc<dyn Sink>]) -> RedisResult<()> {
        // MULTI ack
        self.fill_reply()?;
        if let Err(err) = self.r.value().decode::<Okay>() {
            // the span's replies are still on the wire: consume them so
            // the pipeline stays aligned, then fail the whole handle
            let err = err.unwrap_decode();
            for child in children {
                self.fill_reply()?;
                child.reject(&err);
            }
            self.fill_reply()?;
            Sink::reject(&**cell, &err);
            return Ok(());
        }
        // one QUEUED ack per child
        for child in children {
            self.fill_reply()?;
            if let Err(err) = self.r.value().decode::<Queued>() {
                child.reject(&err.unwrap_decode());
            }
        }
        // the EXEC reply carries the element per child
        self.fill_reply()?;
        let v = self.r.value();
        if v.is_null_array() {
            let err = Error::from((
                ErrorKind::Null,
                "Transaction aborted by a watched key change",
            ));
            for child in children {
                child.reject(&err);
            }
            Sink::reject(&**cell, &err);
            return Ok(());
        }
        if let Some(msg) = v.as_error() {
            let err = Error::server(msg);
            for child in children {
                child.reject(&err);
            }
            Sink::reject(&**cell, &err);
            return Ok(());
        }
        match v.iter() {
            Some(iter) if iter.len() == children.len() => {
                for (child, item) in children.iter().zip(iter) {
                    child.resolve(item);
                }
                *cell.borrow_mut() = Some(Ok(()));
            }
            _ => {
                let err = Error::from((ErrorKind::ResponseError, "Invalid EXEC reply"));
                for child in children {
                    child.reject(&err);
                }
                Sink::reject(&**cell, &err);
            }
        }
        Ok(())
    }
}
