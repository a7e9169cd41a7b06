use std::io::{self, Write};
use std::mem;

use crate::args::Arg;
use crate::parser::{Kind, CRLF, MAX_BULK_STRING_SIZE};
use crate::types::{Error, ErrorKind, RedisResult};

const DEFAULT_BUFFER_SIZE: usize = 4096;
const MIN_BUFFER_SIZE: usize = 512;

// "$" + "536870912" + CRLF
const MAX_BULK_HEADER_SIZE: usize = 1 + 9 + 2;
// ":" + "-9223372036854775808" + CRLF
const MAX_INT_ENCODED_SIZE: usize = 1 + 20 + 2;

/// A buffered writer for the RESP protocol.
///
/// All writes are buffered up to a fixed capacity and an explicit call
/// to [`Writer::flush`] is required to push the data to the underlying
/// writer.  The writer acts like a `BufWriter` but avoids duplicate
/// buffering during RESP serialization: values are rendered straight
/// into the output buffer and only bulk strings larger than the buffer
/// are streamed across multiple flushes.  The minimum capacity of 512
/// bytes guarantees that any protocol element header fits the buffer,
/// so a flush never strands a partial header.
pub struct Writer<W: Write> {
    dest: W,
    buf: Vec<u8>,
    scratch: Vec<u8>,
    err: Option<Error>,
}

impl<W: Write> Writer<W> {
    /// Creates a new writer using the default buffer size (4096 bytes).
    pub fn new(dest: W) -> Writer<W> {
        Writer::with_capacity(DEFAULT_BUFFER_SIZE, dest)
    }

    /// Creates a new writer using the specified buffer size.  A minimum
    /// of 512 bytes is enforced to allow enough space for RESP headers.
    pub fn with_capacity(size: usize, dest: W) -> Writer<W> {
        let size = size.max(MIN_BUFFER_SIZE);
        Writer {
            dest,
            buf: Vec::with_capacity(size),
            scratch: Vec::new(),
            err: None,
        }
    }

    /// Returns a reference to the underlying writer.
    pub fn get_ref(&self) -> &W {
        &self.dest
    }

    /// Returns the size of buffered data in bytes.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the sticky error of the writer, if any.
    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    fn check_err(&self) -> RedisResult<()> {
        match &self.err {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Flushes buffered data so at least `n` bytes fit the buffer
    /// without exceeding its capacity.
    fn ensure(&mut self, n: usize) -> RedisResult<()> {
        if self.buf.len() + n > self.buf.capacity() {
            self.flush()?;
        }
        Ok(())
    }

    /// Writes `s` as a RESP simple string.
    pub fn write_simple_string(&mut self, s: &str) -> RedisResult<()> {
        self.write_safe_string(Kind::SimpleString, s)
    }

    /// Writes `s` as a RESP error string.
    pub fn write_error(&mut self, s: &str) -> RedisResult<()> {
        self.write_safe_string(Kind::Error, s)
    }

    fn write_safe_string(&mut self, kind: Kind, s: &str) -> RedisResult<()> {
        if s.bytes().any(|b| b == b'\r' || b == b'\n') {
            fail!(kind_of_unsafe(kind));
        }
        self.check_err()?;
        let n = 1 + s.len() + CRLF.len();
        if n > self.buf.capacity() {
            fail!(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Inline string exceeds buffer capacity",
            ));
        }
        self.ensure(n)?;
        self.buf.push(kind.marker());
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.extend_from_slice(CRLF);
        Ok(())
    }

    /// Writes `n` as a RESP integer.
    pub fn write_integer(&mut self, n: i64) -> RedisResult<()> {
        self.check_err()?;
        self.write_header(Kind::Integer, n)
    }

    /// Writes a RESP array header announcing `n` elements.
    pub fn write_array_header(&mut self, n: i64) -> RedisResult<()> {
        self.check_err()?;
        self.write_header(Kind::Array, n)
    }

    fn write_header(&mut self, kind: Kind, n: i64) -> RedisResult<()> {
        self.ensure(MAX_INT_ENCODED_SIZE)?;
        self.buf.push(kind.marker());
        let _ = write!(self.buf, "{}", n);
        self.buf.extend_from_slice(CRLF);
        Ok(())
    }

    /// Writes a RESP null bulk string.
    pub fn write_bulk_null(&mut self) -> RedisResult<()> {
        self.check_err()?;
        self.ensure(5)?;
        self.buf.extend_from_slice(b"$-1\r\n");
        Ok(())
    }

    /// Writes `s` as a RESP bulk string.
    pub fn write_bulk_string(&mut self, s: &str) -> RedisResult<()> {
        self.write_bulk_parts(b"", s.as_bytes())
    }

    /// Writes `s` prefixed by `prefix` as a single RESP bulk string.
    /// The announced length covers both parts.  This is how key prefixes
    /// and the `[` / `(` range markers are emitted without concatenating
    /// in memory first.
    pub fn write_bulk_string_prefix(&mut self, prefix: &str, s: &str) -> RedisResult<()> {
        self.write_bulk_parts(prefix.as_bytes(), s.as_bytes())
    }

    /// Writes `data` as a RESP bulk string, or the null bulk string for
    /// `None`.
    pub fn write_bulk_bytes(&mut self, data: Option<&[u8]>) -> RedisResult<()> {
        match data {
            Some(data) => self.write_bulk_parts(b"", data),
            None => self.write_bulk_null(),
        }
    }

    /// Writes `n` as a bulk string of its decimal representation.
    pub fn write_bulk_i64(&mut self, n: i64) -> RedisResult<()> {
        let mut scratch = mem::take(&mut self.scratch);
        scratch.clear();
        let _ = write!(scratch, "{}", n);
        let res = self.write_bulk_parts(b"", &scratch);
        self.scratch = scratch;
        res
    }

    /// Writes `n` as a bulk string of its decimal representation.
    pub fn write_bulk_u64(&mut self, n: u64) -> RedisResult<()> {
        let mut scratch = mem::take(&mut self.scratch);
        scratch.clear();
        let _ = write!(scratch, "{}", n);
        let res = self.write_bulk_parts(b"", &scratch);
        self.scratch = scratch;
        res
    }

    /// Writes `f` as a bulk string of its shortest decimal
    /// representation, with an optional textual prefix.
    pub fn write_bulk_f64_prefix(&mut self, prefix: &str, f: f64) -> RedisResult<()> {
        let mut scratch = mem::take(&mut self.scratch);
        scratch.clear();
        let _ = write!(scratch, "{}", f);
        let res = self.write_bulk_parts(prefix.as_bytes(), &scratch);
        self.scratch = scratch;
        res
    }

    /// Writes `f` as a bulk string of its shortest decimal
    /// representation.
    pub fn write_bulk_f64(&mut self, f: f64) -> RedisResult<()> {
        self.write_bulk_f64_prefix("", f)
    }

    fn write_bulk_parts(&mut self, prefix: &[u8], body: &[u8]) -> RedisResult<()> {
        let size = prefix.len() + body.len();
        if size as i64 > MAX_BULK_STRING_SIZE {
            fail!((ErrorKind::InvalidSize, "Invalid bulk string size"));
        }
        self.check_err()?;
        let total = MAX_BULK_HEADER_SIZE + size + CRLF.len();
        if self.buf.len() + total <= self.buf.capacity() {
            self.buf.push(b'$');
            let _ = write!(self.buf, "{}", size);
            self.buf.extend_from_slice(CRLF);
            self.buf.extend_from_slice(prefix);
            self.buf.extend_from_slice(body);
            self.buf.extend_from_slice(CRLF);
            return Ok(());
        }
        self.write_bulk_big(prefix, body, size)
    }

    // Slow path: the payload does not fit the remaining buffer.  The
    // header is written atomically after a flush, then the payload is
    // streamed through the buffer window, then the trailing CRLF.
    fn write_bulk_big(&mut self, prefix: &[u8], body: &[u8], size: usize) -> RedisResult<()> {
        self.flush()?;
        self.buf.push(b'$');
        let _ = write!(self.buf, "{}", size);
        self.buf.extend_from_slice(CRLF);
        self.fill(prefix)?;
        self.fill(body)?;
        self.ensure(CRLF.len())?;
        self.buf.extend_from_slice(CRLF);
        Ok(())
    }

    fn fill(&mut self, mut data: &[u8]) -> RedisResult<()> {
        while !data.is_empty() {
            let room = self.buf.capacity() - self.buf.len();
            if room == 0 {
                self.flush()?;
                continue;
            }
            let take = room.min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
        }
        Ok(())
    }

    /// Writes a command frame: a RESP array of bulk strings holding the
    /// command name followed by each argument rendered per its type.
    /// Key arguments are emitted with `key_prefix` prepended inside the
    /// same bulk string.
    pub fn write_command(
        &mut self,
        key_prefix: &str,
        name: &str,
        args: &[Arg],
    ) -> RedisResult<()> {
        self.write_array_header(args.len() as i64 + 1)?;
        self.write_bulk_string(name)?;
        for arg in args {
            self.write_arg(key_prefix, arg)?;
        }
        Ok(())
    }

    fn write_arg(&mut self, key_prefix: &str, arg: &Arg) -> RedisResult<()> {
        match arg {
            Arg::Key(s) => self.write_bulk_string_prefix(key_prefix, s),
            Arg::Str(s) => self.write_bulk_string(s),
            Arg::Int(n) => self.write_bulk_i64(*n),
            Arg::Uint(n) => self.write_bulk_u64(*n),
            Arg::Float32(f) => {
                let mut scratch = mem::take(&mut self.scratch);
                scratch.clear();
                let _ = write!(scratch, "{}", f);
                let res = self.write_bulk_parts(b"", &scratch);
                self.scratch = scratch;
                res
            }
            Arg::Float64(f) => self.write_bulk_f64(*f),
            Arg::Bool(true) => self.write_bulk_string("true"),
            Arg::Bool(false) => self.write_bulk_string("false"),
            Arg::Lex { value, inclusive } => {
                let prefix = if *inclusive { "[" } else { "(" };
                self.write_bulk_string_prefix(prefix, value)
            }
            Arg::Score { value, inclusive } => {
                let prefix = if *inclusive { "" } else { "(" };
                self.write_bulk_f64_prefix(prefix, *value)
            }
        }
    }

    /// Writes all buffered data to the underlying writer and empties
    /// the buffer.  Once a write fails the error is sticky.
    pub fn flush(&mut self) -> RedisResult<()> {
        self.check_err()?;
        let mut written = 0;
        while written < self.buf.len() {
            match self.dest.write(&self.buf[written..]) {
                Ok(0) => {
                    let err = Error::from(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "Failed to write buffered data",
                    ));
                    self.buf.drain(..written);
                    self.err = Some(err.clone());
                    return Err(err);
                }
                Ok(n) => written += n,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    self.buf.drain(..written);
                    let err = Error::from(err);
                    self.err = Some(err.clone());
                    return Err(err);
                }
            }
        }
        self.buf.clear();
        Ok(())
    }
}

fn kind_of_unsafe(kind: Kind) -> (ErrorKind, &'static str) {
    match kind {
        Kind::Error => (ErrorKind::TypeError, "CR or LF in error string"),
        _ => (ErrorKind::TypeError, "CR or LF in simple string"),
    }
}
