mod support;

use redpipe::{Arg, Batch, ConnOptions, Connection, ErrorKind, Transport, Tx, Value};
use support::MockTransport;

fn new_conn() -> (Connection, MockTransport) {
    let mock = MockTransport::new();
    let conn = Connection::new(Box::new(mock.clone()), ConnOptions::default()).unwrap();
    (conn, mock)
}

#[test]
fn handles_report_pending_before_execution() {
    let mut batch = Batch::new();
    let n = batch.integer("INCR", &[Arg::key("a")]);
    assert_eq!(n.take().unwrap_err().kind(), ErrorKind::ReplyPending);
}

#[test]
fn replies_arrive_in_command_order() {
    let (mut conn, mock) = new_conn();
    let mut batch = Batch::new();
    let ok = batch.okay("SET", &[Arg::key("a"), Arg::Int(1)]);
    let n = batch.integer("INCRBY", &[Arg::key("a"), Arg::Int(41)]);
    let s = batch.string("GET", &[Arg::key("a")]);
    let all = batch.strings("KEYS", &[Arg::string("*")]);

    mock.feed(b"+OK\r\n:42\r\n$2\r\n42\r\n*1\r\n$1\r\na\r\n");
    conn.do_batch(&mut batch).unwrap();

    ok.take().unwrap();
    assert_eq!(n.take().unwrap(), 42);
    assert_eq!(s.take().unwrap(), "42");
    assert_eq!(all.take().unwrap(), vec!["a".to_string()]);
    assert!(batch.is_empty(), "batch resets after execution");
}

#[test]
fn decode_errors_stay_on_their_own_handle() {
    let (mut conn, mock) = new_conn();
    let mut batch = Batch::new();
    let bad = batch.integer("GET", &[Arg::key("a")]);
    let good = batch.string("GET", &[Arg::key("b")]);

    mock.feed(b"$3\r\nfoo\r\n$3\r\nbar\r\n");
    conn.do_batch(&mut batch).unwrap();

    assert_eq!(bad.take().unwrap_err().kind(), ErrorKind::TypeError);
    assert_eq!(good.take().unwrap(), "bar");
}

#[test]
fn server_errors_stay_on_their_own_handle() {
    let (mut conn, mock) = new_conn();
    let mut batch = Batch::new();
    let bad = batch.do_cmd("FROB", &[]);
    let good = batch.integer("INCR", &[Arg::key("a")]);

    mock.feed(b"-ERR unknown command 'FROB'\r\n:1\r\n");
    conn.do_batch(&mut batch).unwrap();

    assert_eq!(bad.take().unwrap_err().kind(), ErrorKind::ResponseError);
    assert_eq!(good.take().unwrap(), 1);
    assert!(conn.err().is_none());
}

#[test]
fn transaction_children_receive_exec_elements_in_order() {
    let (mut conn, mock) = new_conn();
    let mut tx = Tx::new();
    let args = [Arg::key("foo"), Arg::string("bar"), Arg::Int(2)];
    let a = tx.integer("HINCRBY", &args);
    let b = tx.integer("HINCRBY", &args);
    let c = tx.integer("HINCRBY", &args);

    let mut batch = Batch::new();
    let all = batch.multi(&mut tx);
    mock.feed(b"+OK\r\n+QUEUED\r\n+QUEUED\r\n+QUEUED\r\n*3\r\n:3\r\n:5\r\n:7\r\n");
    conn.do_batch(&mut batch).unwrap();

    all.take().unwrap();
    assert_eq!(a.take().unwrap(), 3);
    assert_eq!(b.take().unwrap(), 5);
    assert_eq!(c.take().unwrap(), 7);

    let written = mock.take_written();
    let text = String::from_utf8_lossy(&written);
    let multi = text.find("MULTI").unwrap();
    let exec = text.find("EXEC").unwrap();
    let first = text.find("HINCRBY").unwrap();
    assert!(multi < first && first < exec);
}

#[test]
fn transactions_mix_with_plain_commands() {
    let (mut conn, mock) = new_conn();
    let mut tx = Tx::new();
    let inner = tx.integer("INCR", &[Arg::key("a")]);
    let mut batch = Batch::new();
    let before = batch.okay("SET", &[Arg::key("a"), Arg::Int(0)]);
    let all = batch.multi(&mut tx);
    let after = batch.string("GET", &[Arg::key("a")]);

    mock.feed(b"+OK\r\n+OK\r\n+QUEUED\r\n*1\r\n:1\r\n$1\r\n1\r\n");
    conn.do_batch(&mut batch).unwrap();

    before.take().unwrap();
    all.take().unwrap();
    assert_eq!(inner.take().unwrap(), 1);
    assert_eq!(after.take().unwrap(), "1");
}

#[test]
fn watch_abort_rejects_the_whole_transaction_with_null() {
    let (mut conn, mock) = new_conn();
    let mut tx = Tx::new();
    let child_a = tx.integer("INCR", &[Arg::key("foo")]);
    let child_b = tx.integer("INCR", &[Arg::key("foo")]);
    let mut batch = Batch::new();
    let all = batch.multi(&mut tx);

    mock.feed(b"+OK\r\n+QUEUED\r\n+QUEUED\r\n*-1\r\n");
    conn.do_batch(&mut batch).unwrap();

    assert_eq!(all.take().unwrap_err().kind(), ErrorKind::Null);
    assert_eq!(child_a.take().unwrap_err().kind(), ErrorKind::Null);
    assert_eq!(child_b.take().unwrap_err().kind(), ErrorKind::Null);

    // the connection survives an aborted transaction
    assert!(conn.err().is_none());
    mock.feed(b"+PONG\r\n");
    let pong: String = conn.do_command("PING", &[]).unwrap();
    assert_eq!(pong, "PONG");
}

#[test]
fn exec_abort_errors_reach_every_handle() {
    let (mut conn, mock) = new_conn();
    let mut tx = Tx::new();
    let bad = tx.integer("NOSUCH", &[Arg::key("a")]);
    let good = tx.integer("INCR", &[Arg::key("a")]);
    let mut batch = Batch::new();
    let all = batch.multi(&mut tx);

    mock.feed(
        b"+OK\r\n-ERR unknown command 'NOSUCH'\r\n+QUEUED\r\n-EXECABORT Transaction discarded because of previous errors.\r\n",
    );
    conn.do_batch(&mut batch).unwrap();

    // the queued-ack error lands on the failing child first; the
    // EXECABORT covers the rest
    assert_eq!(bad.take().unwrap_err().kind(), ErrorKind::ResponseError);
    assert_eq!(good.take().unwrap_err().kind(), ErrorKind::TransactionAborted);
    assert_eq!(all.take().unwrap_err().kind(), ErrorKind::TransactionAborted);
}

#[test]
fn transport_errors_reject_all_remaining_handles() {
    let (mut conn, mock) = new_conn();
    let mut batch = Batch::new();
    let first = batch.integer("INCR", &[Arg::key("a")]);
    let second = batch.integer("INCR", &[Arg::key("b")]);
    let third = batch.integer("INCR", &[Arg::key("c")]);

    // one reply, then the read side of the stream dies
    mock.feed(b":1\r\n");
    mock.shutdown_read().unwrap();
    let err = conn.do_batch(&mut batch).unwrap_err();
    assert!(err.is_io_error());

    assert_eq!(first.take().unwrap(), 1);
    assert!(second.take().unwrap_err().is_io_error());
    assert!(third.take().unwrap_err().is_io_error());
    assert!(conn.err().is_some());
}

#[test]
fn do_batch_requires_a_clean_pipeline() {
    let (mut conn, _mock) = new_conn();
    conn.write_command("PING", &[]).unwrap();
    let mut batch = Batch::new();
    batch.integer("INCR", &[Arg::key("a")]);
    let err = conn.do_batch(&mut batch).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReplyPending);
}

#[test]
fn untyped_handles_return_raw_values() {
    let (mut conn, mock) = new_conn();
    let mut batch = Batch::new();
    let v = batch.do_cmd("TIME", &[]);
    mock.feed(b"*2\r\n$10\r\n1609459200\r\n$6\r\n123456\r\n");
    conn.do_batch(&mut batch).unwrap();
    assert_eq!(
        v.take().unwrap(),
        Value::Array(Some(vec![
            Value::Bulk(Some(b"1609459200".to_vec())),
            Value::Bulk(Some(b"123456".to_vec())),
        ]))
    );
}
