use std::collections::{BTreeMap, HashMap};
use std::convert::TryFrom;
use std::error;
use std::fmt;
use std::hash::Hash;
use std::io;
use std::str::{from_utf8, Utf8Error};

use crate::parser::{Kind, ValueRef};

/// An enum of all error kinds.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum ErrorKind {
    /// A reply handle was read before the batch was executed.
    ReplyPending,
    /// A reply was requested but the pipeline has no more entries.
    NoReplies,
    /// The connection was closed.
    ConnectionClosed,
    /// The connection is managed by a higher-level construct.
    ConnectionManaged,
    /// The connection is write-only and cannot read replies.
    ConnectionWriteOnly,
    /// A MULTI/EXEC transaction was discarded.
    TransactionDiscarded,
    /// The server aborted a MULTI/EXEC transaction.
    TransactionAborted,
    /// The subscriber has been closed.
    SubscriberClosed,
    /// A null value was decoded into a target that cannot express null.
    Null,
    /// The first byte of a frame is not a RESP type marker.
    InvalidType,
    /// A length header is not a valid size.
    InvalidSize,
    /// An integer frame could not be parsed as a signed 64-bit value.
    InvalidInteger,
    /// A value could not be decoded into the requested target type.
    TypeError,
    /// The server replied with an error the library has no special
    /// handling for.
    ResponseError,
    /// The authentication with the server failed.
    AuthenticationFailed,
    /// The parameters given to the client were wrong.
    InvalidClientConfig,
    /// An I/O error on the underlying stream.
    IoError,
}

/// Represents an error of this library.  For the most part you should be
/// interacting with this through `kind()` and the predicates rather than
/// the actual struct.
pub struct Error {
    repr: ErrorRepr,
}

#[derive(Debug)]
enum ErrorRepr {
    WithDescription(ErrorKind, &'static str),
    WithDescriptionAndDetail(ErrorKind, &'static str, String),
    Server(ErrorKind, String),
    Decode(Box<DecodeError>),
    IoError(io::Error),
}

/// The context of a failed decode: the cause, the value that was decoded
/// and the name of the target type.
#[derive(Debug)]
pub struct DecodeError {
    pub cause: Error,
    pub source: Value,
    pub target: &'static str,
}

impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        self.kind() == other.kind()
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error {
            repr: ErrorRepr::IoError(err),
        }
    }
}

impl From<Utf8Error> for Error {
    fn from(_: Utf8Error) -> Error {
        Error {
            repr: ErrorRepr::WithDescription(ErrorKind::TypeError, "Invalid UTF-8"),
        }
    }
}

impl From<(ErrorKind, &'static str)> for Error {
    fn from((kind, desc): (ErrorKind, &'static str)) -> Error {
        Error {
            repr: ErrorRepr::WithDescription(kind, desc),
        }
    }
}

impl From<(ErrorKind, &'static str, String)> for Error {
    fn from((kind, desc, detail): (ErrorKind, &'static str, String)) -> Error {
        Error {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, desc, detail),
        }
    }
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Error {
        Error {
            repr: ErrorRepr::Decode(Box::new(err)),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self.repr {
            ErrorRepr::IoError(ref err) => Some(err),
            ErrorRepr::Decode(ref err) => Some(&err.cause),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        match self.repr {
            ErrorRepr::WithDescription(_, desc) => desc.fmt(f),
            ErrorRepr::WithDescriptionAndDetail(_, desc, ref detail) => {
                desc.fmt(f)?;
                f.write_str(": ")?;
                detail.fmt(f)
            }
            ErrorRepr::Server(_, ref msg) => msg.fmt(f),
            ErrorRepr::Decode(ref err) => write!(
                f,
                "Cannot decode {:?} into {}: {}",
                err.source, err.target, err.cause
            ),
            ErrorRepr::IoError(ref err) => err.fmt(f),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        fmt::Display::fmt(self, f)
    }
}

impl Clone for Error {
    fn clone(&self) -> Error {
        let repr = match self.repr {
            ErrorRepr::WithDescription(kind, desc) => ErrorRepr::WithDescription(kind, desc),
            ErrorRepr::WithDescriptionAndDetail(kind, desc, ref detail) => {
                ErrorRepr::WithDescriptionAndDetail(kind, desc, detail.clone())
            }
            ErrorRepr::Server(kind, ref msg) => ErrorRepr::Server(kind, msg.clone()),
            ErrorRepr::Decode(ref err) => ErrorRepr::Decode(Box::new(DecodeError {
                cause: err.cause.clone(),
                source: err.source.clone(),
                target: err.target,
            })),
            // io::Error is not Clone; rebuild one carrying the same kind
            // and message so one transport error can reject many sinks.
            ErrorRepr::IoError(ref err) => {
                ErrorRepr::IoError(io::Error::new(err.kind(), err.to_string()))
            }
        };
        Error { repr }
    }
}

impl Error {
    /// Creates an error from a RESP error frame returned by the server.
    ///
    /// The leading word of the message selects the error kind, so that
    /// replies like `EXECABORT ...` can be told apart from plain `ERR`.
    pub fn server(msg: &str) -> Error {
        let code = msg.split(' ').next().unwrap_or("");
        let kind = match code {
            "EXECABORT" => ErrorKind::TransactionAborted,
            "NOAUTH" | "WRONGPASS" => ErrorKind::AuthenticationFailed,
            _ => ErrorKind::ResponseError,
        };
        Error {
            repr: ErrorRepr::Server(kind, msg.to_string()),
        }
    }

    /// Returns the kind of the error.  For decode errors the kind of the
    /// cause is reported, so `Null` and server errors stay visible
    /// through the wrapper.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::WithDescription(kind, _) => kind,
            ErrorRepr::WithDescriptionAndDetail(kind, _, _) => kind,
            ErrorRepr::Server(kind, _) => kind,
            ErrorRepr::Decode(ref err) => err.cause.kind(),
            ErrorRepr::IoError(_) => ErrorKind::IoError,
        }
    }

    /// Returns the name of the error category for display purposes.
    pub fn category(&self) -> &str {
        match self.kind() {
            ErrorKind::ReplyPending => "reply pending",
            ErrorKind::NoReplies => "no more replies",
            ErrorKind::ConnectionClosed => "connection closed",
            ErrorKind::ConnectionManaged => "connection managed",
            ErrorKind::ConnectionWriteOnly => "connection write only",
            ErrorKind::TransactionDiscarded => "transaction discarded",
            ErrorKind::TransactionAborted => "transaction aborted",
            ErrorKind::SubscriberClosed => "subscriber closed",
            ErrorKind::Null => "null value",
            ErrorKind::InvalidType => "invalid RESP type",
            ErrorKind::InvalidSize => "invalid size",
            ErrorKind::InvalidInteger => "invalid integer",
            ErrorKind::TypeError => "type error",
            ErrorKind::ResponseError => "response error",
            ErrorKind::AuthenticationFailed => "authentication failed",
            ErrorKind::InvalidClientConfig => "invalid client config",
            ErrorKind::IoError => "I/O error",
        }
    }

    /// Indicates that this failure is an IO failure.
    pub fn is_io_error(&self) -> bool {
        self.kind() == ErrorKind::IoError
    }

    /// Indicates a malformed frame on the stream.  After a protocol
    /// error the framing is no longer trustworthy and the connection
    /// closes.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InvalidType | ErrorKind::InvalidSize | ErrorKind::InvalidInteger
        )
    }

    /// Indicates an error that came back as a RESP error frame.
    pub fn is_server_error(&self) -> bool {
        match self.repr {
            ErrorRepr::Server(_, _) => true,
            ErrorRepr::Decode(ref err) => err.cause.is_server_error(),
            _ => false,
        }
    }

    /// Returns the decode context if this error wraps a failed decode.
    pub fn decode_context(&self) -> Option<&DecodeError> {
        match self.repr {
            ErrorRepr::Decode(ref err) => Some(err),
            _ => None,
        }
    }

    /// Returns true if error was caused by an I/O time out.
    /// Note that this may not be accurate depending on platform.
    pub fn is_timeout(&self) -> bool {
        match self.repr {
            ErrorRepr::IoError(ref err) => matches!(
                err.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Returns true if error was caused by a dropped connection.
    pub fn is_connection_dropped(&self) -> bool {
        match self.repr {
            ErrorRepr::IoError(ref err) => matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }

    /// Unwraps a decode error to its cause; other errors pass through.
    /// Batch sinks store the cause only, the full context is for the
    /// caller that issued the scan.
    pub(crate) fn unwrap_decode(self) -> Error {
        match self.repr {
            ErrorRepr::Decode(err) => err.cause,
            repr => Error { repr },
        }
    }
}

/// Library generic result type.
pub type RedisResult<T> = Result<T, Error>;

/// Internal low-level value enum representing one RESP value of any of
/// the five protocol types.  Bulk strings and arrays carry `None` for
/// the null variants of the wire format (`$-1`, `*-1`).
#[derive(PartialEq, Eq, Clone)]
pub enum Value {
    /// A simple (status) string, e.g. `+OK`.
    Simple(String),
    /// An error reply, e.g. `-ERR unknown command`.
    Error(String),
    /// An integer reply.
    Int(i64),
    /// A bulk string reply; `None` is the null bulk string.
    Bulk(Option<Vec<u8>>),
    /// An array reply; `None` is the null array.
    Array(Option<Vec<Value>>),
}

impl Value {
    /// Returns the RESP type of the value.
    pub fn kind(&self) -> Kind {
        match *self {
            Value::Simple(_) => Kind::SimpleString,
            Value::Error(_) => Kind::Error,
            Value::Int(_) => Kind::Integer,
            Value::Bulk(_) => Kind::BulkString,
            Value::Array(_) => Kind::Array,
        }
    }

    /// Checks if the value is a null bulk string or a null array.
    pub fn is_null(&self) -> bool {
        matches!(*self, Value::Bulk(None) | Value::Array(None))
    }

    /// Appends the canonical RESP serialization of the value to `buf`.
    pub fn append_resp(&self, buf: &mut Vec<u8>) {
        match *self {
            Value::Simple(ref s) => {
                buf.push(b'+');
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Value::Error(ref s) => {
                buf.push(b'-');
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Value::Int(n) => {
                buf.push(b':');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Value::Bulk(None) => buf.extend_from_slice(b"$-1\r\n"),
            Value::Bulk(Some(ref data)) => {
                buf.push(b'$');
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                buf.extend_from_slice(data);
                buf.extend_from_slice(b"\r\n");
            }
            Value::Array(None) => buf.extend_from_slice(b"*-1\r\n"),
            Value::Array(Some(ref items)) => {
                buf.push(b'*');
                buf.extend_from_slice(items.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                for item in items.iter() {
                    item.append_resp(buf);
                }
            }
        }
    }

    /// Returns the canonical RESP serialization of the value.
    pub fn to_resp(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.append_resp(&mut buf);
        buf
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Value::Simple(ref s) => write!(fmt, "simple({:?})", s),
            Value::Error(ref s) => write!(fmt, "error({:?})", s),
            Value::Int(n) => write!(fmt, "int({:?})", n),
            Value::Bulk(None) => write!(fmt, "bulk(nil)"),
            Value::Bulk(Some(ref data)) => match from_utf8(data) {
                Ok(s) => write!(fmt, "bulk({:?})", s),
                Err(_) => write!(fmt, "bulk({:?})", data),
            },
            Value::Array(None) => write!(fmt, "array(nil)"),
            Value::Array(Some(ref items)) => {
                write!(fmt, "array(")?;
                let mut is_first = true;
                for item in items.iter() {
                    if !is_first {
                        write!(fmt, ", ")?;
                    }
                    write!(fmt, "{:?}", item)?;
                    is_first = false;
                }
                write!(fmt, ")")
            }
        }
    }
}

macro_rules! invalid_type_error {
    ($v:expr, $det:expr) => {{
        fail!((
            ErrorKind::TypeError,
            "Response was of incompatible type",
            format!("{} (response was {:?})", $det, $v.to_owned())
        ));
    }};
}

/// This trait is used to convert a RESP value into a more appropriate
/// type.  While a parsed value can represent any response that comes
/// back from the server, usually you want to map this into something
/// that works better in rust.  For instance you might want to convert
/// the return value into a `String` or an integer.
///
/// This trait is well supported throughout the library and you can
/// implement it for your own types if you want.
pub trait FromResp: Sized {
    /// Given a [`ValueRef`] this attempts to convert it into the given
    /// destination type.  If that fails because it's not compatible an
    /// appropriate error is generated.
    fn from_resp(v: ValueRef<'_>) -> RedisResult<Self>;

    /// This only exists internally as a workaround for the lack of
    /// specialization: it allows `Vec<u8>` to capture a bulk string
    /// payload as raw bytes where other element types fail.
    #[doc(hidden)]
    fn from_bulk_bytes(_data: &[u8]) -> Option<Vec<Self>> {
        None
    }
}

/// A shortcut function to invoke `FromResp::from_resp` to make the
/// API slightly nicer.
pub fn from_resp<T: FromResp>(v: ValueRef<'_>) -> RedisResult<T> {
    T::from_resp(v)
}

macro_rules! from_resp_for_int {
    ($t:ty) => {
        impl FromResp for $t {
            fn from_resp(v: ValueRef<'_>) -> RedisResult<$t> {
                v.check_error()?;
                if let Some(n) = v.as_int() {
                    return match <$t>::try_from(n) {
                        Ok(n) => Ok(n),
                        Err(_) => invalid_type_error!(v, "Integer out of range."),
                    };
                }
                match v.as_str() {
                    Some(s) => match s.parse::<$t>() {
                        Ok(n) => Ok(n),
                        Err(_) => invalid_type_error!(v, "Could not convert from string."),
                    },
                    None => {
                        if v.is_null() {
                            fail!((ErrorKind::Null, "Null value"));
                        }
                        invalid_type_error!(v, "Response type not convertible to numeric.")
                    }
                }
            }
        }
    };
}

from_resp_for_int!(i8);
from_resp_for_int!(i16);
from_resp_for_int!(u16);
from_resp_for_int!(i32);
from_resp_for_int!(u32);
from_resp_for_int!(i64);
from_resp_for_int!(u64);
from_resp_for_int!(isize);
from_resp_for_int!(usize);

impl FromResp for u8 {
    fn from_resp(v: ValueRef<'_>) -> RedisResult<u8> {
        v.check_error()?;
        if let Some(n) = v.as_int() {
            return match u8::try_from(n) {
                Ok(n) => Ok(n),
                Err(_) => invalid_type_error!(v, "Integer out of range."),
            };
        }
        match v.as_str() {
            Some(s) => match s.parse::<u8>() {
                Ok(n) => Ok(n),
                Err(_) => invalid_type_error!(v, "Could not convert from string."),
            },
            None => {
                if v.is_null() {
                    fail!((ErrorKind::Null, "Null value"));
                }
                invalid_type_error!(v, "Response type not convertible to numeric.")
            }
        }
    }

    fn from_bulk_bytes(data: &[u8]) -> Option<Vec<u8>> {
        Some(data.to_vec())
    }
}

macro_rules! from_resp_for_float {
    ($t:ty) => {
        impl FromResp for $t {
            fn from_resp(v: ValueRef<'_>) -> RedisResult<$t> {
                v.check_error()?;
                if let Some(n) = v.as_int() {
                    return Ok(n as $t);
                }
                match v.as_str() {
                    Some(s) => match s.parse::<$t>() {
                        Ok(f) => Ok(f),
                        Err(_) => invalid_type_error!(v, "Could not convert from string."),
                    },
                    None => {
                        if v.is_null() {
                            fail!((ErrorKind::Null, "Null value"));
                        }
                        invalid_type_error!(v, "Response type not convertible to float.")
                    }
                }
            }
        }
    };
}

from_resp_for_float!(f32);
from_resp_for_float!(f64);

impl FromResp for bool {
    fn from_resp(v: ValueRef<'_>) -> RedisResult<bool> {
        v.check_error()?;
        if let Some(n) = v.as_int() {
            return match n {
                0 => Ok(false),
                1 => Ok(true),
                _ => invalid_type_error!(v, "Integer response not a valid boolean."),
            };
        }
        match v.as_str() {
            Some("0") | Some("false") => Ok(false),
            Some("1") | Some("true") | Some("OK") => Ok(true),
            _ => invalid_type_error!(v, "Response type not bool compatible."),
        }
    }
}

impl FromResp for String {
    fn from_resp(v: ValueRef<'_>) -> RedisResult<String> {
        v.check_error()?;
        if let Some(n) = v.as_int() {
            return Ok(n.to_string());
        }
        match v.as_str() {
            Some(s) => Ok(s.to_string()),
            None => {
                if v.is_null() {
                    fail!((ErrorKind::Null, "Null value"));
                }
                invalid_type_error!(v, "Response type not string compatible.")
            }
        }
    }
}

impl<T: FromResp> FromResp for Vec<T> {
    fn from_resp(v: ValueRef<'_>) -> RedisResult<Vec<T>> {
        v.check_error()?;
        if let Some(Some(data)) = v.as_bulk() {
            // this hack allows us to specialize Vec<u8> to work with
            // binary data whereas all others will fail with an error.
            return match FromResp::from_bulk_bytes(data) {
                Some(x) => Ok(x),
                None => invalid_type_error!(v, "Response type not vector compatible."),
            };
        }
        if v.is_null() {
            return Ok(vec![]);
        }
        match v.iter() {
            Some(iter) => {
                let mut rv = Vec::with_capacity(iter.len());
                for item in iter {
                    rv.push(T::from_resp(item)?);
                }
                Ok(rv)
            }
            None => invalid_type_error!(v, "Response type not vector compatible."),
        }
    }
}

macro_rules! from_resp_for_map {
    ($t:ident, $($bound:tt)+) => {
        impl<K: FromResp + $($bound)+, V: FromResp> FromResp for $t<K, V> {
            fn from_resp(v: ValueRef<'_>) -> RedisResult<$t<K, V>> {
                v.check_error()?;
                let mut iter = match v.iter() {
                    Some(iter) => iter,
                    None => invalid_type_error!(v, "Response type not map compatible."),
                };
                if iter.len() % 2 != 0 {
                    invalid_type_error!(v, "Map response of odd length.");
                }
                let mut rv = $t::new();
                while let (Some(k), Some(val)) = (iter.next(), iter.next()) {
                    rv.insert(K::from_resp(k)?, V::from_resp(val)?);
                }
                Ok(rv)
            }
        }
    };
}

from_resp_for_map!(HashMap, Eq + Hash);
from_resp_for_map!(BTreeMap, Ord);

impl FromResp for Value {
    fn from_resp(v: ValueRef<'_>) -> RedisResult<Value> {
        Ok(v.to_owned())
    }
}

impl FromResp for () {
    fn from_resp(v: ValueRef<'_>) -> RedisResult<()> {
        v.check_error()?;
        Ok(())
    }
}

impl<T: FromResp> FromResp for Option<T> {
    fn from_resp(v: ValueRef<'_>) -> RedisResult<Option<T>> {
        v.check_error()?;
        if v.is_null() {
            return Ok(None);
        }
        Ok(Some(T::from_resp(v)?))
    }
}

/// A convenience target that asserts the reply is the status `OK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Okay;

impl FromResp for Okay {
    fn from_resp(v: ValueRef<'_>) -> RedisResult<Okay> {
        v.check_error()?;
        match v.as_simple() {
            Some("OK") => Ok(Okay),
            _ => invalid_type_error!(v, "Expected an OK status."),
        }
    }
}

/// A convenience target that asserts the `QUEUED` status the server
/// sends for every command buffered inside a MULTI/EXEC transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Queued;

impl FromResp for Queued {
    fn from_resp(v: ValueRef<'_>) -> RedisResult<Queued> {
        v.check_error()?;
        match v.as_simple() {
            Some("QUEUED") => Ok(Queued),
            _ => invalid_type_error!(v, "Expected a QUEUED status."),
        }
    }
}
