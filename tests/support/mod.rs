#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use redpipe::Transport;

#[derive(Default)]
struct Inner {
    // bytes the client wrote
    written: Vec<u8>,
    // bytes queued for the client to read
    readable: VecDeque<u8>,
    // every deadline the client applied, in order
    read_timeouts: Vec<Option<Duration>>,
    shutdown: bool,
    read_shutdown: bool,
}

/// An in-memory full-duplex transport double.  The test side feeds
/// reply bytes and inspects what the client wrote; reads block on a
/// condvar honoring the applied read deadline, like a socket would.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<(Mutex<Inner>, Condvar)>,
}

impl MockTransport {
    pub fn new() -> MockTransport {
        MockTransport {
            inner: Arc::new((Mutex::new(Inner::default()), Condvar::new())),
        }
    }

    /// Queues bytes for the client to read.
    pub fn feed(&self, bytes: &[u8]) {
        let (lock, cvar) = &*self.inner;
        let mut inner = lock.lock().unwrap();
        inner.readable.extend(bytes.iter().copied());
        cvar.notify_all();
    }

    /// Returns and clears everything the client wrote so far.
    pub fn take_written(&self) -> Vec<u8> {
        let (lock, _) = &*self.inner;
        let mut inner = lock.lock().unwrap();
        std::mem::take(&mut inner.written)
    }

    /// Returns a copy of everything the client wrote so far.
    pub fn written(&self) -> Vec<u8> {
        let (lock, _) = &*self.inner;
        lock.lock().unwrap().written.clone()
    }

    /// Blocks until the written bytes contain `needle`, up to `timeout`.
    pub fn wait_written(&self, needle: &[u8], timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (lock, cvar) = &*self.inner;
        let mut inner = lock.lock().unwrap();
        loop {
            if contains(&inner.written, needle) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = cvar.wait_timeout(inner, deadline - now).unwrap();
            inner = next;
        }
    }

    /// The read deadlines the client applied, in order.
    pub fn read_timeouts(&self) -> Vec<Option<Duration>> {
        let (lock, _) = &*self.inner;
        lock.lock().unwrap().read_timeouts.clone()
    }

    /// Closes the transport from the far side.
    pub fn close(&self) {
        let (lock, cvar) = &*self.inner;
        lock.lock().unwrap().shutdown = true;
        cvar.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        let (lock, _) = &*self.inner;
        lock.lock().unwrap().shutdown
    }

    pub fn is_read_shutdown(&self) -> bool {
        let (lock, _) = &*self.inner;
        let inner = lock.lock().unwrap();
        inner.read_shutdown || inner.shutdown
    }

    fn current_read_timeout(&self) -> Option<Duration> {
        let (lock, _) = &*self.inner;
        let inner = lock.lock().unwrap();
        inner.read_timeouts.last().copied().flatten()
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len().max(1)).any(|w| w == needle)
}

impl Read for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let timeout = self.current_read_timeout();
        let deadline = timeout.map(|t| Instant::now() + t);
        let (lock, cvar) = &*self.inner;
        let mut inner = lock.lock().unwrap();
        loop {
            if !inner.readable.is_empty() {
                let mut n = 0;
                while n < buf.len() {
                    match inner.readable.pop_front() {
                        Some(b) => {
                            buf[n] = b;
                            n += 1;
                        }
                        None => break,
                    }
                }
                return Ok(n);
            }
            if inner.shutdown || inner.read_shutdown {
                return Ok(0);
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(io::Error::new(io::ErrorKind::WouldBlock, "read timed out"));
                    }
                    let (next, _) = cvar.wait_timeout(inner, deadline - now).unwrap();
                    inner = next;
                }
                None => {
                    inner = cvar.wait(inner).unwrap();
                }
            }
        }
    }
}

impl Write for MockTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let (lock, cvar) = &*self.inner;
        let mut inner = lock.lock().unwrap();
        if inner.shutdown {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "transport closed"));
        }
        inner.written.extend_from_slice(buf);
        cvar.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MockTransport {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        let (lock, _) = &*self.inner;
        lock.lock().unwrap().read_timeouts.push(timeout);
        Ok(())
    }

    fn set_write_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    fn shutdown(&self) -> io::Result<()> {
        let (lock, cvar) = &*self.inner;
        lock.lock().unwrap().shutdown = true;
        cvar.notify_all();
        Ok(())
    }

    fn shutdown_read(&self) -> io::Result<()> {
        let (lock, cvar) = &*self.inner;
        lock.lock().unwrap().read_shutdown = true;
        cvar.notify_all();
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(self.clone()))
    }
}
