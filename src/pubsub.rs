use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use log::{debug, trace};
use parking_lot::{Mutex, RwLock};

use crate::args::Arg;
use crate::connection::{Connection, Transport};
use crate::parser::{ReplyReader, ValueRef};
use crate::types::{ErrorKind, FromResp, RedisResult};
use crate::writer::Writer;

/// A message delivered on a subscribed channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PubSubMessage {
    /// The channel the message was published to.
    pub channel: String,
    /// The pattern that matched, for pattern subscriptions.
    pub pattern: Option<String>,
    /// The message payload.
    pub payload: String,
}

// Every inbound PUB/SUB frame is an array whose first element names the
// frame kind.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
enum FrameKind {
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
    Message,
    PMessage,
    Pong,
}

struct Frame {
    kind: FrameKind,
    channel: String,
    pattern: Option<String>,
    payload: String,
    count: i64,
}

impl FromResp for Frame {
    fn from_resp(v: ValueRef<'_>) -> RedisResult<Frame> {
        v.check_error()?;
        let mut iter = match v.iter() {
            Some(iter) => iter,
            None => fail!((ErrorKind::TypeError, "Invalid PUB/SUB frame")),
        };
        let kind = match iter.next().and_then(|k| k.as_str()) {
            Some("subscribe") => FrameKind::Subscribe,
            Some("unsubscribe") => FrameKind::Unsubscribe,
            Some("psubscribe") => FrameKind::PSubscribe,
            Some("punsubscribe") => FrameKind::PUnsubscribe,
            Some("message") => FrameKind::Message,
            Some("pmessage") => FrameKind::PMessage,
            Some("pong") => FrameKind::Pong,
            _ => fail!((ErrorKind::TypeError, "Invalid PUB/SUB frame kind")),
        };
        let mut frame = Frame {
            kind,
            channel: String::new(),
            pattern: None,
            payload: String::new(),
            count: 0,
        };
        match kind {
            FrameKind::Message => {
                frame.channel = decode_text(iter.next())?;
                frame.payload = decode_text(iter.next())?;
            }
            FrameKind::PMessage => {
                frame.pattern = Some(decode_text(iter.next())?);
                frame.channel = decode_text(iter.next())?;
                frame.payload = decode_text(iter.next())?;
            }
            FrameKind::Pong => {
                frame.payload = decode_text(iter.next())?;
            }
            _ => {
                frame.channel = decode_text(iter.next())?;
                frame.count = match iter.next().and_then(|n| n.as_int()) {
                    Some(n) => n,
                    None => fail!((ErrorKind::TypeError, "Invalid PUB/SUB frame count")),
                };
            }
        }
        Ok(frame)
    }
}

fn decode_text(v: Option<ValueRef<'_>>) -> RedisResult<String> {
    match v.and_then(|v| v.as_str()) {
        Some(s) => Ok(s.to_string()),
        None => fail!((ErrorKind::TypeError, "Invalid PUB/SUB frame element")),
    }
}

struct WriteHalf {
    w: Writer<Box<dyn Transport>>,
    // subscribe/unsubscribe commands sent but not yet acknowledged
    pending: i64,
    failed: bool,
}

struct Shared {
    writer: Mutex<WriteHalf>,
    subscriptions: RwLock<HashSet<(String, bool)>>,
    closed: AtomicBool,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // Serializes a PUB/SUB command through the shared writer, bumping
    // the pending-acknowledgement counter by the number of expected
    // acks.
    fn send(&self, name: &str, args: &[&str], acks: i64) -> RedisResult<()> {
        let mut wh = self.writer.lock();
        if wh.failed {
            fail!((ErrorKind::ConnectionClosed, "Connection closed"));
        }
        wh.pending += acks;
        let args: Vec<Arg> = args.iter().map(|s| Arg::string(*s)).collect();
        let res = wh.w.write_command("", name, &args).and_then(|_| wh.w.flush());
        if let Err(err) = res {
            wh.failed = true;
            let _ = wh.w.get_ref().shutdown();
            return Err(err);
        }
        Ok(())
    }

    fn ack(&self) -> i64 {
        let mut wh = self.writer.lock();
        wh.pending -= 1;
        wh.pending
    }

    fn pending(&self) -> i64 {
        self.writer.lock().pending
    }

    fn shutdown(&self) {
        let mut wh = self.writer.lock();
        wh.failed = true;
        let _ = wh.w.get_ref().shutdown();
    }
}

/// A PUB/SUB subscriber.
///
/// A subscriber takes exclusive ownership of a connection and runs a
/// background reader that translates inbound frames into a bounded
/// message channel.  Subscriptions can be changed at any time from any
/// thread; the reader keeps the subscription set in sync with the
/// server's acknowledgements.
///
/// ```rust,no_run
/// use redpipe::Connection;
///
/// # fn run() -> redpipe::RedisResult<()> {
/// let con = Connection::connect("redis://127.0.0.1/")?;
/// let sub = con.subscriber(32)?;
/// sub.subscribe(&["news"])?;
/// while let Some(msg) = sub.block() {
///     println!("{}: {}", msg.channel, msg.payload);
/// }
/// sub.close()?;
/// # Ok(()) }
/// ```
pub struct Subscriber {
    shared: Arc<Shared>,
    messages: Receiver<PubSubMessage>,
    close_tx: Mutex<Option<Sender<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber").finish_non_exhaustive()
    }
}

impl Connection {
    /// Puts the connection into subscribe mode, returning a subscriber
    /// that owns it.  `queue_size` bounds the message channel; a full
    /// channel back-pressures the reader.
    pub fn subscriber(self, queue_size: usize) -> RedisResult<Subscriber> {
        if let Some(err) = self.err() {
            return Err(err.clone());
        }
        if self.state.count_replies() > 0 {
            fail!((ErrorKind::ReplyPending, "Reply pending"));
        }
        let read_timeout = self.options.read_timeout;
        let Connection { r, w, .. } = self;
        let shared = Arc::new(Shared {
            writer: Mutex::new(WriteHalf {
                w,
                pending: 0,
                failed: false,
            }),
            subscriptions: RwLock::new(HashSet::new()),
            closed: AtomicBool::new(false),
        });
        let (msg_tx, msg_rx) = bounded(queue_size.max(1));
        let (close_tx, close_rx) = bounded::<()>(0);

        let reader = ReaderTask {
            r,
            shared: shared.clone(),
            messages: msg_tx,
            close: close_rx.clone(),
            read_timeout,
        };
        let reader = thread::Builder::new()
            .name("redpipe-subscriber".to_string())
            .spawn(move || reader.run())?;

        let keepalive = match read_timeout {
            Some(interval) if interval > Duration::from_secs(0) => {
                let shared = shared.clone();
                Some(
                    thread::Builder::new()
                        .name("redpipe-keepalive".to_string())
                        .spawn(move || keepalive_loop(shared, interval, close_rx))?,
                )
            }
            _ => None,
        };

        Ok(Subscriber {
            shared,
            messages: msg_rx,
            close_tx: Mutex::new(Some(close_tx)),
            reader: Mutex::new(Some(reader)),
            keepalive: Mutex::new(keepalive),
        })
    }
}

impl Subscriber {
    fn check_closed(&self) -> RedisResult<()> {
        if self.shared.is_closed() {
            fail!((ErrorKind::SubscriberClosed, "Subscriber closed"));
        }
        Ok(())
    }

    /// Subscribes to the given channels.
    pub fn subscribe(&self, channels: &[&str]) -> RedisResult<()> {
        self.check_closed()?;
        if channels.is_empty() {
            return Ok(());
        }
        self.shared
            .send("SUBSCRIBE", channels, channels.len() as i64)
    }

    /// Subscribes to the given patterns.
    pub fn psubscribe(&self, patterns: &[&str]) -> RedisResult<()> {
        self.check_closed()?;
        if patterns.is_empty() {
            return Ok(());
        }
        self.shared
            .send("PSUBSCRIBE", patterns, patterns.len() as i64)
    }

    /// Unsubscribes from the given channels.
    pub fn unsubscribe(&self, channels: &[&str]) -> RedisResult<()> {
        self.check_closed()?;
        if channels.is_empty() {
            return Ok(());
        }
        self.shared
            .send("UNSUBSCRIBE", channels, channels.len() as i64)
    }

    /// Unsubscribes from the given patterns.
    pub fn punsubscribe(&self, patterns: &[&str]) -> RedisResult<()> {
        self.check_closed()?;
        if patterns.is_empty() {
            return Ok(());
        }
        self.shared
            .send("PUNSUBSCRIBE", patterns, patterns.len() as i64)
    }

    /// Returns the active subscriptions as `(name, is_pattern)` pairs.
    pub fn subscriptions(&self) -> Vec<(String, bool)> {
        let subs = self.shared.subscriptions.read();
        subs.iter().cloned().collect()
    }

    /// Returns the message channel.  The channel closes when the
    /// subscriber terminates.
    pub fn messages(&self) -> &Receiver<PubSubMessage> {
        &self.messages
    }

    /// Polls for a message without blocking.
    pub fn get(&self) -> Option<PubSubMessage> {
        self.messages.try_recv().ok()
    }

    /// Blocks until a message arrives or the subscriber terminates.
    pub fn block(&self) -> Option<PubSubMessage> {
        self.messages.recv().ok()
    }

    /// Blocks for up to `timeout` waiting for a message.
    pub fn wait(&self, timeout: Duration) -> Option<PubSubMessage> {
        self.messages.recv_timeout(timeout).ok()
    }

    /// Closes the subscriber: unsubscribes from every active
    /// subscription and waits for the reader to observe a zero
    /// subscription count and exit.  Closing is idempotent.
    pub fn close(&self) -> RedisResult<()> {
        self.shared.closed.store(true, Ordering::SeqCst);
        // releases any reader blocked on a full message channel
        drop(self.close_tx.lock().take());

        let (channels, patterns): (Vec<_>, Vec<_>) = {
            let subs = self.shared.subscriptions.read();
            let channels = subs
                .iter()
                .filter(|(_, p)| !p)
                .map(|(c, _)| c.clone())
                .collect();
            let patterns = subs
                .iter()
                .filter(|(_, p)| *p)
                .map(|(c, _)| c.clone())
                .collect();
            (channels, patterns)
        };
        if !channels.is_empty() {
            let refs: Vec<&str> = channels.iter().map(|s| s.as_str()).collect();
            let _ = self.shared.send("UNSUBSCRIBE", &refs, refs.len() as i64);
        }
        if !patterns.is_empty() {
            let refs: Vec<&str> = patterns.iter().map(|s| s.as_str()).collect();
            let _ = self.shared.send("PUNSUBSCRIBE", &refs, refs.len() as i64);
        }
        if channels.is_empty() && patterns.is_empty() && self.shared.pending() <= 0 {
            // nothing will wake the reader: close the socket under it
            self.shared.shutdown();
        }
        if let Some(handle) = self.reader.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.keepalive.lock().take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

// Issues `PING PONG` through the shared writer on a tick of the read
// timeout so the server sees traffic and the reader sees `pong` acks
// while the connection idles.  The close channel wakes the task early.
fn keepalive_loop(shared: Arc<Shared>, interval: Duration, close: Receiver<()>) {
    loop {
        match close.recv_timeout(interval) {
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            _ => return,
        }
        if shared.is_closed() {
            return;
        }
        trace!("subscriber keepalive ping");
        if shared.send("PING", &["PONG"], 1).is_err() {
            return;
        }
    }
}

struct ReaderTask {
    r: ReplyReader<Box<dyn Transport>>,
    shared: Arc<Shared>,
    messages: Sender<PubSubMessage>,
    close: Receiver<()>,
    read_timeout: Option<Duration>,
}

impl ReaderTask {
    fn run(mut self) {
        debug!("subscriber reader started");
        // the keepalive task guarantees one pong per interval, so twice
        // the interval of silence means the server is gone
        let _ = self
            .r
            .get_ref()
            .set_read_timeout(self.read_timeout.map(|t| t * 2));
        let mut last_count: i64 = -1;
        loop {
            let frame: Frame = match self.r.next_value().and_then(|v| v.decode()) {
                Ok(frame) => frame,
                Err(_) => break,
            };
            match frame.kind {
                FrameKind::Message | FrameKind::PMessage => {
                    let msg = PubSubMessage {
                        channel: frame.channel,
                        pattern: frame.pattern,
                        payload: frame.payload,
                    };
                    select! {
                        send(self.messages, msg) -> res => {
                            if res.is_err() {
                                break;
                            }
                        }
                        recv(self.close) -> _ => {
                            // closing with no consumer: drop the message
                            // and keep draining acknowledgements
                        }
                    }
                }
                FrameKind::Subscribe | FrameKind::PSubscribe => {
                    let pattern = frame.kind == FrameKind::PSubscribe;
                    last_count = frame.count;
                    self.shared.ack();
                    if self.shared.is_closed() {
                        // a subscribe raced the close: undo it
                        let cmd = if pattern { "PUNSUBSCRIBE" } else { "UNSUBSCRIBE" };
                        let _ = self.shared.send(cmd, &[frame.channel.as_str()], 1);
                    } else {
                        let mut subs = self.shared.subscriptions.write();
                        subs.insert((frame.channel, pattern));
                    }
                }
                FrameKind::Unsubscribe | FrameKind::PUnsubscribe => {
                    let pattern = frame.kind == FrameKind::PUnsubscribe;
                    last_count = frame.count;
                    {
                        let mut subs = self.shared.subscriptions.write();
                        subs.remove(&(frame.channel, pattern));
                    }
                    let pending = self.shared.ack();
                    if frame.count == 0 && pending <= 0 {
                        break;
                    }
                }
                FrameKind::Pong => {
                    let pending = self.shared.ack();
                    if pending <= 0 && last_count == 0 {
                        break;
                    }
                }
            }
        }
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.shutdown();
        debug!("subscriber reader stopped");
    }
}
