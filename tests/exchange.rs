//! End-to-end exchange scenarios over live nodes.
//!
//! Covers the subscribe, publish, object and feed-deletion flows between
//! real nodes on loopback TCP, plus a hand-rolled raw peer speaking the
//! published wire format for the timeout and hash-mismatch cases.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use grapevine::node::msg;
use grapevine::transport::{FrameReader, FrameWriter};
use grapevine::{
    Callbacks, Config, Container, Feed, MemoryContainer, Msg, Node, NodeError, NodeId, ObjectKey,
    ProtocolViolation, Root, Signature,
};

const MAX_FRAME: usize = 8 << 20;

fn test_config() -> Config {
    let mut config = Config::default();
    config.enable_listener = true;
    config.listen = "127.0.0.1:0".to_string();
    config.response_timeout_ms = 2_000;
    config.ping_interval_ms = 0;
    config
}

fn start_node(mutate: impl FnOnce(&mut Config)) -> (Node, Arc<MemoryContainer>) {
    let mut config = test_config();
    mutate(&mut config);
    start_node_with(config, Callbacks::default())
}

fn start_node_with(config: Config, callbacks: Callbacks) -> (Node, Arc<MemoryContainer>) {
    let container = Arc::new(MemoryContainer::new());
    let node = Node::new(config, container.clone(), callbacks).expect("start node");
    (node, container)
}

fn feed(b: u8) -> Feed {
    Feed([b; 32])
}

fn addr_of(node: &Node) -> String {
    node.listen_addr().expect("listener bound").to_string()
}

fn store_root(
    container: &MemoryContainer,
    feed: &Feed,
    nonce: u64,
    seq: u64,
    refs: &[ObjectKey],
) -> Root {
    let body = Root::encode_body(feed, nonce, seq, refs);
    container
        .received_root(Signature([7u8; 64]), body)
        .expect("store root")
        .root
}

fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

//
// raw peer speaking the published wire format
//

type RawReader = FrameReader<TcpStream>;
type RawWriter = FrameWriter<TcpStream>;

fn raw_peer(serve: impl FnOnce(&mut RawReader, &mut RawWriter) + Send + 'static) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind raw peer");
    let addr = listener.local_addr().expect("raw peer addr").to_string();
    thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        let mut reader = FrameReader::new(stream.try_clone().expect("clone"), MAX_FRAME);
        let mut writer = FrameWriter::new(stream, MAX_FRAME);
        raw_handshake(&mut reader, &mut writer);
        serve(&mut reader, &mut writer);
    });
    addr
}

fn raw_handshake(reader: &mut RawReader, writer: &mut RawWriter) {
    let raw = reader.read_next().expect("read hello").expect("hello frame");
    let (seq, _, message) = msg::decode(&raw).expect("decode hello");
    let Msg::Hello { nonce, .. } = message else {
        panic!("expected hello, got {message:?}");
    };
    let welcome = msg::encode(
        1,
        seq,
        &Msg::Welcome {
            node_id: NodeId([0xee; 32]),
            nonce,
        },
    );
    writer.write_frame(&welcome).expect("write welcome");
    writer.flush().expect("flush welcome");
}

//
// scenarios
//

#[test]
fn subscribe_happy_path_delivers_latest_root() {
    let (a, a_container) = start_node(|_| {});
    let (b, b_container) = start_node(|c| c.enable_listener = false);
    let f = feed(1);
    a.add_feed(&f).unwrap();
    store_root(&a_container, &f, 0, 1, &[]);

    let conn = b.connect(&addr_of(&a)).unwrap();
    conn.subscribe(f).unwrap();

    // the pair appears in A's subscribers
    let a_conn = a.connections()[0].clone();
    assert!(a_conn.feeds().contains(&f));
    assert_eq!(a_conn.peer_id(), Some(b.id()));
    assert_eq!(conn.peer_id(), Some(a.id()));

    // and B immediately receives A's current latest Root
    eventually("root pushed to B", || {
        b_container.last_root_seq(&f, 0) == Ok(1)
    });

    b.close();
    a.close();
}

#[test]
fn subscribe_to_unshared_feed_is_rejected() {
    let (a, _) = start_node(|_| {});
    let (b, _) = start_node(|c| c.enable_listener = false);

    let conn = b.connect(&addr_of(&a)).unwrap();
    let err = conn.subscribe(feed(2)).unwrap_err();
    assert_eq!(
        err,
        NodeError::SubscriptionRejected("do not share the feed".to_string())
    );
    assert!(a.connections()[0].feeds().is_empty());

    b.close();
    a.close();
}

#[test]
fn subscribe_vetoed_by_callback() {
    let callbacks = Callbacks {
        on_subscribe_remote: Some(Arc::new(|_conn, _feed| Err("not today".to_string()))),
        ..Callbacks::default()
    };
    let (a, _) = start_node_with(test_config(), callbacks);
    a.add_feed(&feed(6)).unwrap();
    let (b, _) = start_node(|c| c.enable_listener = false);

    let conn = b.connect(&addr_of(&a)).unwrap();
    assert_eq!(
        conn.subscribe(feed(6)).unwrap_err(),
        NodeError::SubscriptionRejected("not today".to_string())
    );

    b.close();
    a.close();
}

#[test]
fn dial_vetoed_by_callback() {
    let callbacks = Callbacks {
        on_dial: Some(Arc::new(|_conn| Err("no dialing".to_string()))),
        ..Callbacks::default()
    };
    let mut config = test_config();
    config.enable_listener = false;
    let (b, _) = start_node_with(config, callbacks);
    let (a, _) = start_node(|_| {});

    assert_eq!(
        b.connect(&addr_of(&a)).unwrap_err(),
        NodeError::Dial("no dialing".to_string())
    );
    assert!(b.connections().is_empty());

    b.close();
    a.close();
}

#[test]
fn late_reply_after_timeout_is_discarded() {
    let addr = raw_peer(|reader, writer| {
        let raw = reader.read_next().expect("read").expect("request frame");
        let (seq, _, message) = msg::decode(&raw).expect("decode");
        assert_eq!(message, Msg::RqList);
        // reply well past the caller's deadline
        thread::sleep(Duration::from_millis(250));
        let reply = msg::encode(2, seq, &Msg::List { feeds: Vec::new() });
        writer.write_frame(&reply).expect("write");
        writer.flush().expect("flush");
        thread::sleep(Duration::from_millis(400));
    });

    let (b, _) = start_node(|c| {
        c.enable_listener = false;
        c.response_timeout_ms = 100;
    });
    let conn = b.connect(&addr).unwrap();

    assert_eq!(conn.remote_feeds().unwrap_err(), NodeError::Timeout);

    // the late List arrives and is silently dropped
    thread::sleep(Duration::from_millis(300));
    assert!(!conn.is_closed());

    b.close();
}

#[test]
fn object_hash_mismatch_closes_the_connection() {
    let key = ObjectKey([0x42; 32]);
    let addr = raw_peer(move |reader, writer| {
        let raw = reader.read_next().expect("read").expect("rq object frame");
        let (seq, _, message) = msg::decode(&raw).expect("decode");
        let Msg::RqObject { key: requested, .. } = message else {
            panic!("expected RqObject, got {message:?}");
        };
        assert_eq!(requested, key);
        let reply = msg::encode(
            2,
            seq,
            &Msg::Object {
                value: Bytes::from_static(b"not the object"),
            },
        );
        writer.write_frame(&reply).expect("write");
        writer.flush().expect("flush");
        thread::sleep(Duration::from_millis(300));
    });

    let reasons: Arc<Mutex<Vec<Option<NodeError>>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&reasons);
    let callbacks = Callbacks {
        on_disconnect: Some(Arc::new(move |_conn, reason| {
            seen.lock().unwrap().push(reason.cloned());
        })),
        ..Callbacks::default()
    };
    let mut config = test_config();
    config.enable_listener = false;
    let (b, _) = start_node_with(config, callbacks);

    let conn = b.connect(&addr).unwrap();
    let err = conn.getter().get(&key).unwrap_err();
    assert_eq!(
        err,
        NodeError::Protocol(ProtocolViolation::ObjectHashMismatch { key })
    );
    assert!(conn.is_closed());
    assert_eq!(conn.close_reason(), Some(err.clone()));

    // closing again changes nothing
    conn.close();
    assert_eq!(reasons.lock().unwrap().as_slice(), &[Some(err)]);

    b.close();
}

#[test]
fn stale_root_is_dropped() {
    let (a, a_container) = start_node(|_| {});
    let (b, b_container) = start_node(|c| c.enable_listener = false);
    let f = feed(3);
    a.add_feed(&f).unwrap();

    let conn = b.connect(&addr_of(&a)).unwrap();
    conn.subscribe(f).unwrap();

    let root5 = store_root(&b_container, &f, 0, 5, &[]);
    b.publish(&root5);
    eventually("root 5 accepted", || {
        a_container.last_root_seq(&f, 0) == Ok(5)
    });

    // an older root on the same head is ignored
    let body4 = Root::encode_body(&f, 0, 4, &[]);
    let root4 = Root::from_signed_body(Signature([7u8; 64]), body4).unwrap();
    b.publish(&root4);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(a_container.last_root_seq(&f, 0), Ok(5));

    let root6 = store_root(&b_container, &f, 0, 6, &[]);
    b.publish(&root6);
    eventually("root 6 accepted", || {
        a_container.last_root_seq(&f, 0) == Ok(6)
    });

    b.close();
    a.close();
}

#[test]
fn del_feed_drains_subscribers() {
    let (a, a_container) = start_node(|_| {});
    let (b1, _) = start_node(|c| c.enable_listener = false);
    let (b2, _) = start_node(|c| c.enable_listener = false);
    let f = feed(4);
    a.add_feed(&f).unwrap();

    let c1 = b1.connect(&addr_of(&a)).unwrap();
    let c2 = b2.connect(&addr_of(&a)).unwrap();
    c1.subscribe(f).unwrap();
    c2.subscribe(f).unwrap();

    a.del_feed(&f).unwrap();
    assert!(!a.has_feed(&f));
    assert_eq!(a_container.del_feed_calls(), 1);

    // both peers got the unsubscribe
    eventually("b1 unsubscribed", || c1.feeds().is_empty());
    eventually("b2 unsubscribed", || c2.feeds().is_empty());

    b1.close();
    b2.close();
    a.close();
}

#[test]
fn object_request_served_from_store() {
    let (a, a_container) = start_node(|_| {});
    let (b, _) = start_node(|c| c.enable_listener = false);
    let value = Bytes::from_static(b"shared object");
    let key = a_container.store_object(value.clone());

    let conn = b.connect(&addr_of(&a)).unwrap();
    assert_eq!(conn.getter().get(&key).unwrap(), value);

    b.close();
    a.close();
}

#[test]
fn object_request_for_missing_object_times_out_remotely() {
    let (a, _) = start_node(|c| c.response_timeout_ms = 200);
    let (b, _) = start_node(|c| {
        c.enable_listener = false;
        c.response_timeout_ms = 2_000;
    });

    let conn = b.connect(&addr_of(&a)).unwrap();
    let missing = ObjectKey([0x99; 32]);
    assert_eq!(
        conn.getter().get(&missing).unwrap_err(),
        NodeError::Remote("timeout".to_string())
    );

    b.close();
    a.close();
}

#[test]
fn parked_object_request_is_answered_by_want_fanout() {
    // A holds the object; B neither stores it nor fills, so C's request
    // parked at B can only be satisfied by the want-registry reply once B
    // fetches the object for a preview.
    let (a, a_container) = start_node(|_| {});
    let (b, _) = start_node(|c| c.response_timeout_ms = 5_000);
    let (c, _) = start_node(|cfg| {
        cfg.enable_listener = false;
        cfg.response_timeout_ms = 5_000;
    });

    let f = feed(10);
    a.add_feed(&f).unwrap();
    let value = Bytes::from_static(b"fanned out");
    let key = a_container.store_object(value.clone());
    store_root(&a_container, &f, 0, 1, &[key]);

    let c_conn = c.connect(&addr_of(&b)).unwrap();
    let fetch = thread::spawn(move || c_conn.getter().get(&key));

    // let C's request park in B's object service and register its seq
    thread::sleep(Duration::from_millis(150));

    let b_conn = b.connect(&addr_of(&a)).unwrap();
    b_conn
        .preview(f, |pack, _root| {
            pack.get(&key).expect("fetch through the preview getter");
            false
        })
        .unwrap();

    assert_eq!(fetch.join().expect("fetch thread"), Ok(value));

    c.close();
    b.close();
    a.close();
}

#[test]
fn remote_feeds_respects_public_server_flag() {
    let (a, _) = start_node(|c| c.public_server = true);
    a.add_feed(&feed(7)).unwrap();
    let (b, _) = start_node(|c| c.enable_listener = false);
    let conn = b.connect(&addr_of(&a)).unwrap();
    assert_eq!(conn.remote_feeds().unwrap(), vec![feed(7)]);
    b.close();
    a.close();

    let (a, _) = start_node(|_| {}); // public_server defaults to false
    let (b, _) = start_node(|c| c.enable_listener = false);
    let conn = b.connect(&addr_of(&a)).unwrap();
    assert_eq!(conn.remote_feeds().unwrap_err(), NodeError::NonPublicPeer);
    b.close();
    a.close();
}

#[test]
fn preview_fetches_missing_objects_and_subscribes() {
    let (a, a_container) = start_node(|_| {});
    let (b, _) = start_node(|c| c.enable_listener = false);
    let f = feed(5);
    a.add_feed(&f).unwrap();
    let value = Bytes::from_static(b"preview object");
    let key = a_container.store_object(value.clone());
    store_root(&a_container, &f, 0, 1, &[key]);

    let conn = b.connect(&addr_of(&a)).unwrap();
    let observed = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&observed);
    conn.preview(f, move |pack, root| {
        let fetched = pack.get(&key).expect("resolve over the connection");
        *sink.lock().unwrap() = Some((fetched, root.seq));
        true
    })
    .unwrap();

    assert_eq!(*observed.lock().unwrap(), Some((value, 1)));
    assert!(b.has_feed(&f));
    assert!(conn.feeds().contains(&f));

    b.close();
    a.close();
}

#[test]
fn unsubscribe_removes_both_sides() {
    let (a, _) = start_node(|_| {});
    let (b, _) = start_node(|c| c.enable_listener = false);
    let f = feed(8);
    a.add_feed(&f).unwrap();

    let conn = b.connect(&addr_of(&a)).unwrap();
    conn.subscribe(f).unwrap();
    let a_conn = a.connections()[0].clone();
    assert!(a_conn.feeds().contains(&f));

    conn.unsubscribe(f);
    assert!(conn.feeds().is_empty());
    eventually("peer side unsubscribed", || a_conn.feeds().is_empty());

    b.close();
    a.close();
}

#[test]
fn repeated_close_fires_one_disconnect() {
    let disconnects = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&disconnects);
    let callbacks = Callbacks {
        on_disconnect: Some(Arc::new(move |_conn, _reason| {
            counter.fetch_add(1, Ordering::Relaxed);
        })),
        ..Callbacks::default()
    };
    let mut config = test_config();
    config.enable_listener = false;
    let (b, _) = start_node_with(config, callbacks);
    let (a, _) = start_node(|_| {});

    let conn = b.connect(&addr_of(&a)).unwrap();
    conn.close();
    conn.close();
    b.close(); // closes the (already closed) connection again
    assert_eq!(disconnects.load(Ordering::Relaxed), 1);

    a.close();
}

#[test]
fn connection_lookup_by_address() {
    let (a, _) = start_node(|_| {});
    let (b, _) = start_node(|c| c.enable_listener = false);

    let addr = addr_of(&a);
    let conn = b.connect(&addr).unwrap();
    let found = b.connection(&addr).expect("connection by address");
    assert_eq!(found.id(), conn.id());
    assert!(b.connection("127.0.0.1:1").is_none());

    b.close();
    a.close();
}

#[test]
fn requests_on_closed_connection_fail_fast() {
    let (a, _) = start_node(|_| {});
    let (b, _) = start_node(|c| c.enable_listener = false);

    let conn = b.connect(&addr_of(&a)).unwrap();
    conn.close();
    assert_eq!(conn.remote_feeds().unwrap_err(), NodeError::Closed);
    assert_eq!(conn.subscribe(feed(9)).unwrap_err(), NodeError::Closed);

    b.close();
    a.close();
}
