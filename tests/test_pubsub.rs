mod support;

use std::thread;
use std::time::Duration;

use redpipe::{ConnOptions, Connection, ErrorKind, PubSubMessage};
use support::MockTransport;

const WAIT: Duration = Duration::from_secs(5);

fn frame(parts: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", parts.len()).into_bytes();
    for part in parts {
        out.extend_from_slice(format!("${}\r\n{}\r\n", part.len(), part).as_bytes());
    }
    out
}

fn count_frame(kind: &str, channel: &str, count: i64) -> Vec<u8> {
    let mut out = format!("*3\r\n${}\r\n{}\r\n", kind.len(), kind).into_bytes();
    out.extend_from_slice(format!("${}\r\n{}\r\n", channel.len(), channel).as_bytes());
    out.extend_from_slice(format!(":{}\r\n", count).as_bytes());
    out
}

fn new_subscriber(queue: usize) -> (redpipe::Subscriber, MockTransport) {
    let mock = MockTransport::new();
    let conn = Connection::new(Box::new(mock.clone()), ConnOptions::default()).unwrap();
    let sub = conn.subscriber(queue).unwrap();
    (sub, mock)
}

#[test]
fn delivers_messages_for_subscribed_channels() {
    let (sub, mock) = new_subscriber(4);

    sub.subscribe(&["news"]).unwrap();
    assert!(mock.wait_written(b"SUBSCRIBE", WAIT));
    mock.feed(&count_frame("subscribe", "news", 1));
    mock.feed(&frame(&["message", "news", "hello"]));

    let msg = sub.wait(WAIT).expect("message should arrive");
    assert_eq!(
        msg,
        PubSubMessage {
            channel: "news".to_string(),
            pattern: None,
            payload: "hello".to_string(),
        }
    );

    // the acknowledged subscription is tracked
    let subs = sub.subscriptions();
    assert_eq!(subs, vec![("news".to_string(), false)]);

    // unsubscribe acknowledgement with zero remaining ends the reader
    let closer = {
        let mock = mock.clone();
        thread::spawn(move || {
            assert!(mock.wait_written(b"UNSUBSCRIBE", WAIT));
            mock.feed(&count_frame("unsubscribe", "news", 0));
        })
    };
    sub.close().unwrap();
    closer.join().unwrap();

    // the channel is closed once the subscriber terminates
    assert!(sub.block().is_none());
}

#[test]
fn pattern_messages_carry_the_pattern() {
    let (sub, mock) = new_subscriber(4);

    sub.psubscribe(&["news.*"]).unwrap();
    assert!(mock.wait_written(b"PSUBSCRIBE", WAIT));
    mock.feed(&count_frame("psubscribe", "news.*", 1));
    mock.feed(&frame(&["pmessage", "news.*", "news.rust", "1.0 released"]));

    let msg = sub.wait(WAIT).expect("pattern message should arrive");
    assert_eq!(msg.pattern.as_deref(), Some("news.*"));
    assert_eq!(msg.channel, "news.rust");
    assert_eq!(msg.payload, "1.0 released");

    let subs = sub.subscriptions();
    assert_eq!(subs, vec![("news.*".to_string(), true)]);

    let closer = {
        let mock = mock.clone();
        thread::spawn(move || {
            assert!(mock.wait_written(b"PUNSUBSCRIBE", WAIT));
            mock.feed(&count_frame("punsubscribe", "news.*", 0));
        })
    };
    sub.close().unwrap();
    closer.join().unwrap();
}

#[test]
fn operations_fail_after_close() {
    let (sub, _mock) = new_subscriber(1);
    // nothing was subscribed: close shuts the socket to release the
    // reader
    sub.close().unwrap();
    assert_eq!(
        sub.subscribe(&["late"]).unwrap_err().kind(),
        ErrorKind::SubscriberClosed
    );
    assert_eq!(
        sub.unsubscribe(&["late"]).unwrap_err().kind(),
        ErrorKind::SubscriberClosed
    );
    assert!(sub.get().is_none());
}

#[test]
fn close_is_idempotent() {
    let (sub, _mock) = new_subscriber(1);
    sub.close().unwrap();
    sub.close().unwrap();
}

#[test]
fn dynamic_unsubscribe_keeps_the_reader_alive_for_other_channels() {
    let (sub, mock) = new_subscriber(4);

    sub.subscribe(&["a", "b"]).unwrap();
    assert!(mock.wait_written(b"SUBSCRIBE", WAIT));
    mock.feed(&count_frame("subscribe", "a", 1));
    mock.feed(&count_frame("subscribe", "b", 2));

    sub.unsubscribe(&["a"]).unwrap();
    assert!(mock.wait_written(b"UNSUBSCRIBE", WAIT));
    // one subscription remains: the reader keeps going
    mock.feed(&count_frame("unsubscribe", "a", 1));

    mock.feed(&frame(&["message", "b", "still here"]));
    let msg = sub.wait(WAIT).expect("b is still subscribed");
    assert_eq!(msg.channel, "b");

    // forget the earlier UNSUBSCRIBE so the closer waits for the new one
    mock.take_written();
    let closer = {
        let mock = mock.clone();
        thread::spawn(move || {
            assert!(mock.wait_written(b"UNSUBSCRIBE", WAIT));
            mock.feed(&count_frame("unsubscribe", "b", 0));
        })
    };
    sub.close().unwrap();
    closer.join().unwrap();
}

#[test]
fn subscriber_requires_a_clean_connection() {
    let mock = MockTransport::new();
    let mut conn = Connection::new(Box::new(mock.clone()), ConnOptions::default()).unwrap();
    conn.write_command("PING", &[]).unwrap();
    let err = conn.subscriber(1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReplyPending);
}
