use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::mem;
use std::str::from_utf8;

use crate::types::{DecodeError, Error, ErrorKind, FromResp, RedisResult, Value};

/// The line ending used in RESP.
pub const CRLF: &[u8] = b"\r\n";

/// The maximum bulk string size specified by the RESP protocol (512 MiB).
pub const MAX_BULK_STRING_SIZE: i64 = 512 * 1024 * 1024;

const DEFAULT_BUFFER_SIZE: usize = 4096;
const MIN_BUFFER_SIZE: usize = 512;

/// The type of a RESP value, keyed by the marker byte of its frame.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Kind {
    SimpleString,
    Error,
    Integer,
    BulkString,
    Array,
}

impl Kind {
    fn from_marker(b: u8) -> Option<Kind> {
        match b {
            b'+' => Some(Kind::SimpleString),
            b'-' => Some(Kind::Error),
            b':' => Some(Kind::Integer),
            b'$' => Some(Kind::BulkString),
            b'*' => Some(Kind::Array),
            _ => None,
        }
    }

    /// Returns the marker byte that introduces a frame of this type.
    pub fn marker(self) -> u8 {
        match self {
            Kind::SimpleString => b'+',
            Kind::Error => b'-',
            Kind::Integer => b':',
            Kind::BulkString => b'$',
            Kind::Array => b'*',
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            Kind::SimpleString => "simple string",
            Kind::Error => "error",
            Kind::Integer => "integer",
            Kind::BulkString => "bulk string",
            Kind::Array => "array",
        };
        f.write_str(name)
    }
}

/// A fixed-layout record locating one parsed value inside a [`Message`].
///
/// For inline strings and bulk payloads `offset`/`len` address a span of
/// the message buffer.  For integers they pack the 64-bit value.  For
/// arrays `offset` is the index of the first child hint and `len` the
/// number of children; sibling hints occupy consecutive slots.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
struct Hint {
    kind: Kind,
    null: bool,
    offset: u32,
    len: u32,
}

impl Hint {
    fn placeholder() -> Hint {
        Hint {
            kind: Kind::SimpleString,
            null: false,
            offset: 0,
            len: 0,
        }
    }

    fn from_int(n: i64) -> Hint {
        let u = n as u64;
        Hint {
            kind: Kind::Integer,
            null: false,
            offset: (u >> 32) as u32,
            len: u as u32,
        }
    }

    fn int(&self) -> i64 {
        (((self.offset as u64) << 32) | (self.len as u64)) as i64
    }
}

/// A parsed incoming RESP value stored as a single contiguous byte
/// buffer plus a flat array of [`Hint`] records.  The message is reused
/// across parses: both allocations are retained by [`Message::reset`].
#[derive(Default)]
pub struct Message {
    buffer: Vec<u8>,
    hints: Vec<Hint>,
    line: Vec<u8>,
}

impl Message {
    /// Creates an empty message.
    pub fn new() -> Message {
        Message::default()
    }

    /// Clears the message retaining its allocations.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.hints.clear();
    }

    /// Reads exactly one RESP value from a buffered reader into the
    /// message, replacing any previous contents, and returns a handle to
    /// the root.
    pub fn read_from<R: BufRead>(&mut self, r: &mut R) -> RedisResult<ValueRef<'_>> {
        self.reset();
        self.hints.push(Hint::placeholder());
        let mut line = mem::take(&mut self.line);
        let res = self.parse_value(r, &mut line, 0);
        self.line = line;
        res?;
        Ok(ValueRef {
            msg: self,
            index: 0,
        })
    }

    /// Parses a RESP value from a byte slice.
    pub fn parse(&mut self, buf: &[u8]) -> RedisResult<ValueRef<'_>> {
        let mut r = buf;
        self.read_from(&mut r)
    }

    /// Returns a handle to the root value of the last parse.
    pub fn value(&self) -> ValueRef<'_> {
        ValueRef {
            msg: self,
            index: 0,
        }
    }

    fn str(&self, h: &Hint) -> &[u8] {
        let start = h.offset as usize;
        let end = start + h.len as usize;
        if end <= self.buffer.len() {
            &self.buffer[start..end]
        } else {
            &[]
        }
    }

    fn copy(&mut self, data: &[u8]) -> u32 {
        let offset = self.buffer.len() as u32;
        self.buffer.extend_from_slice(data);
        offset
    }

    fn parse_value<R: BufRead>(
        &mut self,
        r: &mut R,
        line: &mut Vec<u8>,
        index: usize,
    ) -> RedisResult<()> {
        read_line(r, line)?;
        let (marker, rest) = match line.split_first() {
            Some((marker, rest)) => (*marker, rest),
            None => fail!((ErrorKind::InvalidType, "Empty RESP frame")),
        };
        let kind = match Kind::from_marker(marker) {
            Some(kind) => kind,
            None => fail!((ErrorKind::InvalidType, "Invalid RESP type marker")),
        };
        match kind {
            Kind::SimpleString | Kind::Error => {
                let offset = self.copy(rest);
                self.hints[index] = Hint {
                    kind,
                    null: false,
                    offset,
                    len: rest.len() as u32,
                };
                Ok(())
            }
            Kind::Integer => {
                let n = match parse_int(rest) {
                    Some(n) => n,
                    None => fail!((ErrorKind::InvalidInteger, "Invalid integer frame")),
                };
                self.hints[index] = Hint::from_int(n);
                Ok(())
            }
            Kind::BulkString => {
                let n = match parse_int(rest) {
                    Some(n) if (-1..=MAX_BULK_STRING_SIZE).contains(&n) => n,
                    _ => fail!((ErrorKind::InvalidSize, "Invalid bulk string size")),
                };
                if n == -1 {
                    self.hints[index] = Hint {
                        kind,
                        null: true,
                        offset: 0,
                        len: 0,
                    };
                    return Ok(());
                }
                let offset = self.buffer.len() as u32;
                self.copy_payload(r, n as usize)?;
                skip_bytes(r, CRLF.len())?;
                self.hints[index] = Hint {
                    kind,
                    null: false,
                    offset,
                    len: n as u32,
                };
                Ok(())
            }
            Kind::Array => {
                let n = match parse_int(rest) {
                    Some(n) if (-1..=u32::MAX as i64).contains(&n) => n,
                    _ => fail!((ErrorKind::InvalidSize, "Invalid array size")),
                };
                if n == -1 {
                    self.hints[index] = Hint {
                        kind,
                        null: true,
                        offset: 0,
                        len: 0,
                    };
                    return Ok(());
                }
                let offset = self.hints.len();
                self.hints[index] = Hint {
                    kind,
                    null: false,
                    offset: offset as u32,
                    len: n as u32,
                };
                // Children get consecutive slots reserved up front; a
                // nested array appends its own children after this block
                // and finds them through its offset index.
                self.hints
                    .resize(offset + n as usize, Hint::placeholder());
                for i in 0..n as usize {
                    self.parse_value(r, line, offset + i)?;
                }
                Ok(())
            }
        }
    }

    /// Copies a bulk payload of `n` bytes into the message buffer.  When
    /// the payload is already buffered this is a single peek + discard;
    /// otherwise it streams through the reader's window chunk by chunk.
    fn copy_payload<R: BufRead>(&mut self, r: &mut R, n: usize) -> RedisResult<()> {
        let mut remaining = n;
        while remaining > 0 {
            let take = {
                let chunk = r.fill_buf()?;
                if chunk.is_empty() {
                    fail!(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "Unexpected end of RESP stream",
                    ));
                }
                let take = chunk.len().min(remaining);
                self.buffer.extend_from_slice(&chunk[..take]);
                take
            };
            r.consume(take);
            remaining -= take;
        }
        Ok(())
    }
}

/// Reads one CRLF-terminated line into `line` (terminator stripped).
fn read_line<R: BufRead>(r: &mut R, line: &mut Vec<u8>) -> RedisResult<()> {
    line.clear();
    let n = r.read_until(b'\n', line)?;
    if n == 0 {
        fail!(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "Unexpected end of RESP stream",
        ));
    }
    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    }
    Ok(())
}

fn skip_bytes<R: BufRead>(r: &mut R, n: usize) -> RedisResult<()> {
    let mut remaining = n;
    while remaining > 0 {
        let take = {
            let chunk = r.fill_buf()?;
            if chunk.is_empty() {
                fail!(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Unexpected end of RESP stream",
                ));
            }
            chunk.len().min(remaining)
        };
        r.consume(take);
        remaining -= take;
    }
    Ok(())
}

/// Parses an ASCII decimal integer, rejecting garbage and overflow.
fn parse_int(line: &[u8]) -> Option<i64> {
    let (neg, digits) = match line.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, line),
    };
    if digits.is_empty() {
        return None;
    }
    let mut n: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return None;
        }
        n = n.checked_mul(10)?.checked_add((b - b'0') as i64)?;
    }
    Some(if neg { -n } else { n })
}

/// A handle to one value inside a parsed [`Message`].  Copying the
/// handle is free; all accessors borrow from the message buffer.
#[derive(Copy, Clone)]
pub struct ValueRef<'a> {
    msg: &'a Message,
    index: u32,
}

impl<'a> ValueRef<'a> {
    fn hint(&self) -> Option<&'a Hint> {
        self.msg.hints.get(self.index as usize)
    }

    /// Returns the RESP type of the value.
    pub fn kind(&self) -> Option<Kind> {
        self.hint().map(|h| h.kind)
    }

    /// Checks if the value is a null bulk string or a null array.
    pub fn is_null(&self) -> bool {
        match self.hint() {
            Some(h) => h.null,
            None => false,
        }
    }

    /// Checks if the value is a null array (the shape of an aborted
    /// `EXEC` reply).
    pub fn is_null_array(&self) -> bool {
        match self.hint() {
            Some(h) => h.kind == Kind::Array && h.null,
            None => false,
        }
    }

    /// Returns a simple string value.
    pub fn as_simple(&self) -> Option<&'a str> {
        match self.hint() {
            Some(h) if h.kind == Kind::SimpleString => from_utf8(self.msg.str(h)).ok(),
            _ => None,
        }
    }

    /// Returns the message of a RESP error value.
    pub fn as_error(&self) -> Option<&'a str> {
        match self.hint() {
            Some(h) if h.kind == Kind::Error => from_utf8(self.msg.str(h)).ok(),
            _ => None,
        }
    }

    /// Returns an integer value.
    pub fn as_int(&self) -> Option<i64> {
        match self.hint() {
            Some(h) if h.kind == Kind::Integer => Some(h.int()),
            _ => None,
        }
    }

    /// Returns a bulk string payload; the inner `None` is the null bulk
    /// string.
    pub fn as_bulk(&self) -> Option<Option<&'a [u8]>> {
        match self.hint() {
            Some(h) if h.kind == Kind::BulkString => {
                if h.null {
                    Some(None)
                } else {
                    Some(Some(self.msg.str(h)))
                }
            }
            _ => None,
        }
    }

    /// Returns the textual payload of a simple string or a non-null bulk
    /// string.
    pub fn as_str(&self) -> Option<&'a str> {
        match self.hint() {
            Some(h) if h.kind == Kind::SimpleString || h.kind == Kind::BulkString => {
                if h.null {
                    None
                } else {
                    from_utf8(self.msg.str(h)).ok()
                }
            }
            _ => None,
        }
    }

    /// Returns the element count of a non-null array value.
    pub fn array_len(&self) -> Option<usize> {
        match self.hint() {
            Some(h) if h.kind == Kind::Array && !h.null => Some(h.len as usize),
            _ => None,
        }
    }

    /// Returns an iterator over the elements of a non-null array value.
    pub fn iter(&self) -> Option<Iter<'a>> {
        match self.hint() {
            Some(h) if h.kind == Kind::Array && !h.null => Some(Iter {
                msg: self.msg,
                offset: h.offset,
                len: h.len,
                index: 0,
            }),
            _ => None,
        }
    }

    /// Fails with the server error if the value is a RESP error frame.
    pub fn check_error(&self) -> RedisResult<()> {
        match self.as_error() {
            Some(msg) => Err(Error::server(msg)),
            None => Ok(()),
        }
    }

    /// Materializes the value into an owned [`Value`].
    pub fn to_owned(&self) -> Value {
        match self.hint() {
            Some(h) => match h.kind {
                Kind::SimpleString => {
                    Value::Simple(String::from_utf8_lossy(self.msg.str(h)).into_owned())
                }
                Kind::Error => Value::Error(String::from_utf8_lossy(self.msg.str(h)).into_owned()),
                Kind::Integer => Value::Int(h.int()),
                Kind::BulkString => {
                    if h.null {
                        Value::Bulk(None)
                    } else {
                        Value::Bulk(Some(self.msg.str(h).to_vec()))
                    }
                }
                Kind::Array => {
                    if h.null {
                        Value::Array(None)
                    } else {
                        let items = self
                            .iter()
                            .map(|iter| iter.map(|v| v.to_owned()).collect())
                            .unwrap_or_default();
                        Value::Array(Some(items))
                    }
                }
            },
            None => Value::Bulk(None),
        }
    }

    /// Appends the canonical RESP serialization of the value to `buf`.
    pub fn append_resp(&self, buf: &mut Vec<u8>) {
        let h = match self.hint() {
            Some(h) => h,
            None => return,
        };
        match h.kind {
            Kind::SimpleString | Kind::Error => {
                buf.push(h.kind.marker());
                buf.extend_from_slice(self.msg.str(h));
                buf.extend_from_slice(CRLF);
            }
            Kind::Integer => {
                buf.push(b':');
                buf.extend_from_slice(h.int().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Kind::BulkString => {
                if h.null {
                    buf.extend_from_slice(b"$-1\r\n");
                } else {
                    buf.push(b'$');
                    buf.extend_from_slice(h.len.to_string().as_bytes());
                    buf.extend_from_slice(CRLF);
                    buf.extend_from_slice(self.msg.str(h));
                    buf.extend_from_slice(CRLF);
                }
            }
            Kind::Array => {
                if h.null {
                    buf.extend_from_slice(b"*-1\r\n");
                } else {
                    buf.push(b'*');
                    buf.extend_from_slice(h.len.to_string().as_bytes());
                    buf.extend_from_slice(CRLF);
                    if let Some(iter) = self.iter() {
                        for item in iter {
                            item.append_resp(buf);
                        }
                    }
                }
            }
        }
    }

    /// Decodes the value into `T`, wrapping any failure with the source
    /// value and the target type so protocol errors can be told apart
    /// from type mismatches.
    pub fn decode<T: FromResp>(&self) -> RedisResult<T> {
        match T::from_resp(*self) {
            Ok(x) => Ok(x),
            Err(cause) => Err(Error::from(DecodeError {
                cause,
                source: self.to_owned(),
                target: std::any::type_name::<T>(),
            })),
        }
    }
}

impl<'a> fmt::Debug for ValueRef<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&self.to_owned(), f)
    }
}

/// An iterator over the elements of an array value.
pub struct Iter<'a> {
    msg: &'a Message,
    offset: u32,
    len: u32,
    index: u32,
}

impl<'a> Iter<'a> {
    /// Returns the total number of elements.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Checks if the array has no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = ValueRef<'a>;

    fn next(&mut self) -> Option<ValueRef<'a>> {
        if self.index < self.len {
            let v = ValueRef {
                msg: self.msg,
                index: self.offset + self.index,
            };
            self.index += 1;
            Some(v)
        } else {
            None
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.len - self.index) as usize;
        (remaining, Some(remaining))
    }
}

impl<'a> ExactSizeIterator for Iter<'a> {}

/// The buffered read side of a connection: a reader, the reusable
/// incoming [`Message`], and a sticky error.  Once a read or protocol
/// error occurs every subsequent call returns it, because the stream
/// framing can no longer be trusted.
pub struct ReplyReader<R: Read> {
    r: BufReader<R>,
    msg: Message,
    line: Vec<u8>,
    err: Option<Error>,
}

impl<R: Read> ReplyReader<R> {
    /// Creates a reply reader with the default buffer size.
    pub fn new(r: R) -> ReplyReader<R> {
        ReplyReader::with_capacity(DEFAULT_BUFFER_SIZE, r)
    }

    /// Creates a reply reader with the given buffer size.  A minimum of
    /// 512 bytes is enforced.
    pub fn with_capacity(size: usize, r: R) -> ReplyReader<R> {
        let size = size.max(MIN_BUFFER_SIZE);
        ReplyReader {
            r: BufReader::with_capacity(size, r),
            msg: Message::new(),
            line: Vec::new(),
            err: None,
        }
    }

    /// Returns a reference to the underlying reader.
    pub fn get_ref(&self) -> &R {
        self.r.get_ref()
    }

    /// Returns the sticky error, if any.
    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Parses the next reply into the internal message.  On success the
    /// value is available through [`ReplyReader::value`].
    pub fn fill_next(&mut self) -> RedisResult<()> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        match self.msg.read_from(&mut self.r) {
            Ok(_) => Ok(()),
            Err(err) => {
                self.err = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Returns a handle to the most recently parsed reply.
    pub fn value(&self) -> ValueRef<'_> {
        self.msg.value()
    }

    /// Parses and returns the next reply.
    pub fn next_value(&mut self) -> RedisResult<ValueRef<'_>> {
        self.fill_next()?;
        Ok(self.msg.value())
    }

    /// Discards the next reply without storing it.
    pub fn skip(&mut self) -> RedisResult<()> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        let mut line = mem::take(&mut self.line);
        let res = discard_next(&mut self.r, &mut line);
        self.line = line;
        match res {
            Ok(()) => Ok(()),
            Err(err) => {
                self.err = Some(err.clone());
                Err(err)
            }
        }
    }
}

/// Discards one RESP value from a reader without buffering it.
fn discard_next<R: BufRead>(r: &mut R, line: &mut Vec<u8>) -> RedisResult<()> {
    read_line(r, line)?;
    let (marker, rest) = match line.split_first() {
        Some((marker, rest)) => (*marker, rest),
        None => fail!((ErrorKind::InvalidType, "Empty RESP frame")),
    };
    let kind = match Kind::from_marker(marker) {
        Some(kind) => kind,
        None => fail!((ErrorKind::InvalidType, "Invalid RESP type marker")),
    };
    match kind {
        Kind::SimpleString | Kind::Error | Kind::Integer => Ok(()),
        Kind::BulkString => match parse_int(rest) {
            Some(-1) => Ok(()),
            Some(n) if (0..=MAX_BULK_STRING_SIZE).contains(&n) => {
                skip_bytes(r, n as usize + CRLF.len())
            }
            _ => fail!((ErrorKind::InvalidSize, "Invalid bulk string size")),
        },
        Kind::Array => match parse_int(rest) {
            Some(-1) => Ok(()),
            Some(n) if n >= 0 => {
                for _ in 0..n {
                    discard_next(r, line)?;
                }
                Ok(())
            }
            _ => fail!((ErrorKind::InvalidSize, "Invalid array size")),
        },
    }
}

/// Parses bytes into an owned RESP value.
///
/// This is the most straightforward way to parse something into a low
/// level value instead of having to manage a whole [`Message`].
pub fn parse_resp_value(bytes: &[u8]) -> RedisResult<Value> {
    let mut msg = Message::new();
    let v = msg.parse(bytes)?;
    Ok(v.to_owned())
}
