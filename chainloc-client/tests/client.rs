//! Integration tests driving the client against scripted lookup peers.
//!
//! Each test binds a throwaway listener on 127.0.0.1:0 and answers the wire
//! protocol by hand, so connection faults and response timing are fully
//! under the test's control.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chainloc_client::{
    ClientConfig, Endpoint, LookupClient, OperationResult, ResultConsumer,
};
use chainloc_common::wire::{
    KEY_TERMINATOR, NOT_FOUND_MARKER, STORED_MARKER, VALUE_MARKER, VALUE_SUFFIX,
};
use chainloc_common::{DataKey, Entry, KEY_WIDTH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

enum PeerRequest {
    Get([u8; KEY_WIDTH]),
    Set([u8; KEY_WIDTH], u32),
}

async fn read_request(stream: &mut TcpStream) -> std::io::Result<PeerRequest> {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await?;
    match &prefix {
        b"get " => {
            // key, terminator, line end
            let mut rest = [0u8; KEY_WIDTH + 3];
            stream.read_exact(&mut rest).await?;
            let mut key = [0u8; KEY_WIDTH];
            key.copy_from_slice(&rest[..KEY_WIDTH]);
            Ok(PeerRequest::Get(key))
        }
        b"set " => {
            // key, terminator, size field, line end, entry, suffix, line end
            let mut rest = [0u8; KEY_WIDTH + 20];
            stream.read_exact(&mut rest).await?;
            let mut key = [0u8; KEY_WIDTH];
            key.copy_from_slice(&rest[..KEY_WIDTH]);
            let digits = &rest[KEY_WIDTH + 6..KEY_WIDTH + 16];
            let server_id = std::str::from_utf8(digits)
                .expect("entry digits")
                .parse()
                .expect("entry value");
            Ok(PeerRequest::Set(key, server_id))
        }
        other => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected prefix {other:?}"),
        )),
    }
}

fn stored(key: &[u8; KEY_WIDTH]) -> Vec<u8> {
    [STORED_MARKER, &key[..], &[KEY_TERMINATOR][..]].concat()
}

fn not_found(key: &[u8; KEY_WIDTH]) -> Vec<u8> {
    [NOT_FOUND_MARKER, &key[..], &[KEY_TERMINATOR][..]].concat()
}

fn value(key: &[u8; KEY_WIDTH], server_id: u32) -> Vec<u8> {
    let digits = format!("{server_id:010}");
    [
        VALUE_MARKER,
        &key[..],
        &[KEY_TERMINATOR][..],
        b"12",
        digits.as_bytes(),
        VALUE_SUFFIX,
    ]
    .concat()
}

fn test_key(last: u8) -> DataKey {
    let mut bytes = [b'0'; KEY_WIDTH];
    bytes[KEY_WIDTH - 1] = last;
    DataKey::new(&bytes).expect("test key")
}

#[derive(Default)]
struct RecordingConsumer {
    gets: Mutex<Vec<OperationResult>>,
    sets: Mutex<Vec<OperationResult>>,
}

impl ResultConsumer for RecordingConsumer {
    fn on_get_result(&self, result: OperationResult) {
        self.gets.lock().expect("gets lock").push(result);
    }

    fn on_set_result(&self, result: OperationResult) {
        self.sets.lock().expect("sets lock").push(result);
    }
}

impl RecordingConsumer {
    fn get_count(&self) -> usize {
        self.gets.lock().expect("gets lock").len()
    }

    fn set_count(&self) -> usize {
        self.sets.lock().expect("sets lock").len()
    }

    fn get_results(&self) -> Vec<OperationResult> {
        self.gets.lock().expect("gets lock").clone()
    }

    fn set_results(&self) -> Vec<OperationResult> {
        self.sets.lock().expect("sets lock").clone()
    }
}

async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    cond()
}

fn test_config(
    addr: SocketAddr,
    get_connections: usize,
    set_connections: usize,
    get_timeout: Option<Duration>,
) -> ClientConfig {
    ClientConfig {
        endpoints: vec![Endpoint::new(addr.ip().to_string(), addr.port())],
        get_connections,
        set_connections,
        get_timeout,
        max_retries: 8,
    }
}

/// Scripted peer that answers every request from an in-memory assignment
/// map shared across all accepted sockets.
fn spawn_kv_peer(listener: TcpListener) -> Arc<Mutex<HashMap<[u8; KEY_WIDTH], u32>>> {
    let assignments: Arc<Mutex<HashMap<[u8; KEY_WIDTH], u32>>> = Arc::default();
    let shared = assignments.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let assignments = shared.clone();
            tokio::spawn(async move {
                while let Ok(request) = read_request(&mut stream).await {
                    let response = match request {
                        PeerRequest::Get(key) => {
                            match assignments.lock().expect("peer lock").get(&key) {
                                Some(&server_id) => value(&key, server_id),
                                None => not_found(&key),
                            }
                        }
                        PeerRequest::Set(key, server_id) => {
                            assignments.lock().expect("peer lock").insert(key, server_id);
                            stored(&key)
                        }
                    };
                    if stream.write_all(&response).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    assignments
}

#[tokio::test]
async fn delayed_not_found_is_one_successful_null_result() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                while let Ok(request) = read_request(&mut stream).await {
                    if let PeerRequest::Get(key) = request {
                        sleep(Duration::from_millis(50)).await;
                        if stream.write_all(&not_found(&key)).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });

    let consumer = Arc::new(RecordingConsumer::default());
    let client = LookupClient::new(
        test_config(addr, 4, 1, Some(Duration::from_secs(2))),
        consumer.clone(),
    )
    .expect("client");

    let key = test_key(b'7');
    client.get(key).expect("enqueue get");

    assert!(wait_until(Duration::from_secs(5), || consumer.get_count() == 1).await);
    let results = consumer.get_results();
    assert_eq!(results.len(), 1);
    assert!(results[0].succeeded);
    assert!(results[0].entry.is_null());
    assert_eq!(results[0].key, key);

    // The answer stays delivered exactly once.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(consumer.get_count(), 1);
    assert_eq!(client.num_still_processing(), 0);
}

#[tokio::test]
async fn set_then_get_roundtrip_with_tracking() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    spawn_kv_peer(listener);

    let consumer = Arc::new(RecordingConsumer::default());
    let client = LookupClient::new(
        test_config(addr, 2, 2, Some(Duration::from_secs(2))),
        consumer.clone(),
    )
    .expect("client");

    let key = test_key(b'a');
    let tracking_id = client.set(key, Entry::new(12), true).expect("enqueue set");
    assert!(tracking_id > 0);

    assert!(wait_until(Duration::from_secs(5), || consumer.set_count() == 1).await);
    let set_results = consumer.set_results();
    assert!(set_results[0].succeeded);
    assert!(set_results[0].tracking);
    assert_eq!(set_results[0].tracking_id, tracking_id);
    assert_eq!(set_results[0].entry, Entry::new(12));

    client.get(key).expect("enqueue get");
    assert!(wait_until(Duration::from_secs(5), || consumer.get_count() == 1).await);
    let get_results = consumer.get_results();
    assert!(get_results[0].succeeded);
    assert_eq!(get_results[0].entry, Entry::new(12));
}

#[tokio::test]
async fn get_timeout_is_one_failure_and_late_response_is_ignored() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                while let Ok(request) = read_request(&mut stream).await {
                    if let PeerRequest::Get(key) = request {
                        // Answer well past the client's deadline.
                        sleep(Duration::from_millis(500)).await;
                        if stream.write_all(&not_found(&key)).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });

    let consumer = Arc::new(RecordingConsumer::default());
    let client = LookupClient::new(
        test_config(addr, 1, 1, Some(Duration::from_millis(100))),
        consumer.clone(),
    )
    .expect("client");

    let key = test_key(b'b');
    client.get(key).expect("enqueue get");

    assert!(wait_until(Duration::from_secs(5), || consumer.get_count() == 1).await);
    let results = consumer.get_results();
    assert!(!results[0].succeeded);
    assert!(results[0].entry.is_null());
    assert_eq!(client.metrics().timed_out, 1);

    // The late response finds no matching query and must not deliver again.
    sleep(Duration::from_millis(700)).await;
    assert_eq!(consumer.get_count(), 1);
    assert_eq!(client.num_still_processing(), 0);
}

#[tokio::test]
async fn desynced_stream_recycles_connection_and_requeries_once() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    let poison_next = Arc::new(AtomicBool::new(true));
    let set_requests = Arc::new(AtomicU64::new(0));
    let poison = poison_next.clone();
    let seen = set_requests.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let poison = poison.clone();
            let seen = seen.clone();
            tokio::spawn(async move {
                while let Ok(request) = read_request(&mut stream).await {
                    if let PeerRequest::Set(key, _) = request {
                        seen.fetch_add(1, Ordering::SeqCst);
                        let response = if poison.swap(false, Ordering::SeqCst) {
                            // Marker at a non-zero offset: the client must
                            // treat the stream as desynchronized.
                            let mut bad = b"XX".to_vec();
                            bad.extend_from_slice(&stored(&key));
                            bad
                        } else {
                            stored(&key)
                        };
                        if stream.write_all(&response).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });

    let consumer = Arc::new(RecordingConsumer::default());
    let client = LookupClient::new(test_config(addr, 1, 1, None), consumer.clone()).expect("client");

    let key = test_key(b'c');
    let tracking_id = client.set(key, Entry::new(5), true).expect("enqueue set");

    assert!(wait_until(Duration::from_secs(5), || consumer.set_count() == 1).await);
    let results = consumer.set_results();
    assert!(results[0].succeeded);
    assert_eq!(results[0].tracking_id, tracking_id);

    // The query was written twice in total: the original send and exactly
    // one re-send after the reconnect.
    assert_eq!(set_requests.load(Ordering::SeqCst), 2);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(consumer.set_count(), 1);
    assert_eq!(client.num_still_processing(), 0);
}

#[tokio::test]
async fn queries_wait_in_queue_while_node_is_down() {
    let consumer = Arc::new(RecordingConsumer::default());
    // Nothing listens on the reserved port; every connect is refused.
    let client = LookupClient::new(
        ClientConfig {
            endpoints: vec![Endpoint::new("127.0.0.1", 1)],
            get_connections: 2,
            set_connections: 1,
            get_timeout: Some(Duration::from_secs(5)),
            max_retries: 8,
        },
        consumer.clone(),
    )
    .expect("client");

    client.get(test_key(b'd')).expect("enqueue get");
    sleep(Duration::from_millis(300)).await;

    // Nothing to dispatch to, nothing delivered, nothing lost.
    assert_eq!(consumer.get_count(), 0);
    assert_eq!(client.queue_size(), 1);
    assert_eq!(client.num_still_processing(), 0);
    // The pool keeps cycling through connect attempts meanwhile.
    assert!(client.metrics().connects >= 2);
}
