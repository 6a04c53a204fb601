use relaymq::{BridgeConfig, BridgeServer, BusClient, BusMessage};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

/// Shared handles into the in-memory bus double: what the bridge
/// subscribed and published, and a queue of messages to deliver inbound.
#[derive(Clone, Default)]
struct BusHandles {
    subscribed: Arc<Mutex<Vec<String>>>,
    published: Arc<Mutex<Vec<(String, String)>>>,
    inbound: Arc<Mutex<VecDeque<BusMessage>>>,
}

impl BusHandles {
    fn push_inbound(&self, topic: &str, payload: &str) {
        self.inbound.lock().unwrap().push_back(BusMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
        });
    }

    fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }
}

/// In-memory stand-in for the external bus client.
struct RecordingBus {
    handles: BusHandles,
}

impl BusClient for RecordingBus {
    fn subscribe(&mut self, filter: &str) -> relaymq::Result<()> {
        self.handles
            .subscribed
            .lock()
            .unwrap()
            .push(filter.to_string());
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> relaymq::Result<()> {
        self.handles.published.lock().unwrap().push((
            topic.to_string(),
            String::from_utf8_lossy(payload).into_owned(),
        ));
        Ok(())
    }

    async fn service(&mut self, _timeout: Duration) -> relaymq::Result<Vec<BusMessage>> {
        Ok(self.handles.inbound.lock().unwrap().drain(..).collect())
    }
}

struct TestBridge {
    addr: SocketAddr,
    handles: BusHandles,
    running: Arc<AtomicBool>,
    task: JoinHandle<relaymq::Result<()>>,
}

impl TestBridge {
    async fn shutdown(self) {
        self.running.store(false, Ordering::SeqCst);
        timeout(Duration::from_secs(5), self.task)
            .await
            .expect("bridge did not stop")
            .expect("bridge task panicked")
            .expect("bridge exited with an error");
    }
}

async fn start_bridge(capacity: usize) -> TestBridge {
    let config = BridgeConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        max_connections: capacity,
        ..Default::default()
    };
    let handles = BusHandles::default();
    let bus = RecordingBus {
        handles: handles.clone(),
    };
    let server = BridgeServer::bind(config, bus)
        .await
        .expect("failed to bind bridge");
    let addr = server.local_addr().unwrap();
    let running = server.run_flag();
    let task = tokio::spawn(server.run());
    TestBridge {
        addr,
        handles,
        running,
        task,
    }
}

/// Connect a TCP client and consume the greeting line the bridge sends on
/// accept.
async fn connect_client(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.expect("connect failed");
    assert_eq!(read_line_from(&mut stream).await, "hello,hello");
    stream
}

/// Read one CRLF-terminated line, panicking on timeout or EOF.
async fn read_line_from(stream: &mut TcpStream) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = timeout(Duration::from_secs(2), stream.read(&mut byte))
            .await
            .expect("timed out reading line")
            .expect("read failed");
        if n == 0 {
            panic!("peer closed while reading line");
        }
        match byte[0] {
            b'\n' => return String::from_utf8(line).unwrap(),
            b'\r' => {}
            other => line.push(other),
        }
    }
}

/// Block until the peer closes the connection. A reset counts as closed:
/// the bridge may drop a connection with bytes still unread.
async fn expect_eof(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    loop {
        match timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("timed out waiting for close")
        {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn subscribes_to_the_topic_filter_at_startup() {
    let bridge = start_bridge(4).await;
    let subscribed = bridge.handles.subscribed.lock().unwrap().clone();
    assert_eq!(subscribed, vec!["PI/CV/SHOOT/DATA".to_string()]);
    bridge.shutdown().await;
}

#[tokio::test]
async fn new_client_receives_the_greeting_line() {
    let bridge = start_bridge(4).await;

    let mut stream = TcpStream::connect(bridge.addr).await.expect("connect failed");
    assert_eq!(read_line_from(&mut stream).await, "hello,hello");

    bridge.shutdown().await;
}

#[tokio::test]
async fn client_line_is_published_exactly_once() {
    let bridge = start_bridge(4).await;
    let mut client = connect_client(bridge.addr).await;

    client.write_all(b"sensor/temp,21.5\r\n").await.unwrap();

    let handles = bridge.handles.clone();
    wait_until("the record to be published", || {
        !handles.published().is_empty()
    })
    .await;

    // give the loop time to surface any duplicate
    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        bridge.handles.published(),
        vec![("sensor/temp".to_string(), "21.5".to_string())]
    );

    bridge.shutdown().await;
}

#[tokio::test]
async fn record_split_across_segments_is_published() {
    let bridge = start_bridge(4).await;
    let mut client = connect_client(bridge.addr).await;

    // the line arrives in two TCP segments with a pause in between; the
    // bridge keeps the partial line buffered instead of dropping the client
    client.write_all(b"sensor/te").await.unwrap();
    client.flush().await.unwrap();
    sleep(Duration::from_millis(200)).await;
    client.write_all(b"mp,21.5\r\n").await.unwrap();

    let handles = bridge.handles.clone();
    wait_until("the reassembled record to be published", || {
        !handles.published().is_empty()
    })
    .await;
    assert_eq!(
        bridge.handles.published(),
        vec![("sensor/temp".to_string(), "21.5".to_string())]
    );

    // the connection is still pooled: fan-out reaches it
    bridge.handles.push_inbound("PI/CV/SHOOT/DATA", "ack");
    assert_eq!(read_line_from(&mut client).await, "PI/CV/SHOOT/DATA,ack");

    bridge.shutdown().await;
}

#[tokio::test]
async fn malformed_lines_are_discarded_without_dropping_the_client() {
    let bridge = start_bridge(4).await;
    let mut client = connect_client(bridge.addr).await;

    client.write_all(b"noComma\r\n").await.unwrap();
    client.write_all(b",onlyPayload\r\n").await.unwrap();
    client.write_all(b"valid,record\r\n").await.unwrap();

    let handles = bridge.handles.clone();
    wait_until("the valid record to be published", || {
        !handles.published().is_empty()
    })
    .await;

    // only the well-formed line made it to the bus
    assert_eq!(
        bridge.handles.published(),
        vec![("valid".to_string(), "record".to_string())]
    );

    // the connection survived the garbage: fan-out still reaches it
    bridge.handles.push_inbound("PI/CV/SHOOT/DATA", "ack");
    assert_eq!(read_line_from(&mut client).await, "PI/CV/SHOOT/DATA,ack");

    bridge.shutdown().await;
}

#[tokio::test]
async fn bus_messages_reach_every_connected_client_once() {
    let bridge = start_bridge(4).await;
    let mut first = connect_client(bridge.addr).await;
    let mut second = connect_client(bridge.addr).await;
    let mut third = connect_client(bridge.addr).await;

    bridge.handles.push_inbound("PI/CV/SHOOT/DATA", "shot 1");
    for client in [&mut first, &mut second, &mut third] {
        assert_eq!(read_line_from(client).await, "PI/CV/SHOOT/DATA,shot 1");
    }

    // the next message is the next line on every socket, so nobody saw
    // the first one twice
    bridge.handles.push_inbound("PI/CV/SHOOT/DATA", "shot 2");
    for client in [&mut first, &mut second, &mut third] {
        assert_eq!(read_line_from(client).await, "PI/CV/SHOOT/DATA,shot 2");
    }

    bridge.shutdown().await;
}

#[tokio::test]
async fn full_pool_evicts_the_oldest_and_fans_out_to_survivors() {
    let bridge = start_bridge(2).await;
    let mut client_a = connect_client(bridge.addr).await;
    let mut client_b = connect_client(bridge.addr).await;

    // both occupants are at age 0, so the tie-break dooms slot 0 (A)
    let mut client_c = connect_client(bridge.addr).await;
    expect_eof(&mut client_a).await;

    bridge.handles.push_inbound("PI/CV/SHOOT/DATA", "42");
    assert_eq!(read_line_from(&mut client_b).await, "PI/CV/SHOOT/DATA,42");
    assert_eq!(read_line_from(&mut client_c).await, "PI/CV/SHOOT/DATA,42");

    bridge.shutdown().await;
}

#[tokio::test]
async fn unterminated_input_gets_the_connection_closed() {
    let bridge = start_bridge(4).await;
    let mut client = connect_client(bridge.addr).await;

    client.write_all(&[b'x'; 400]).await.unwrap();
    client.flush().await.unwrap();

    expect_eof(&mut client).await;
    assert!(bridge.handles.published().is_empty());

    bridge.shutdown().await;
}

#[tokio::test]
async fn disconnecting_client_frees_its_slot() {
    let bridge = start_bridge(2).await;
    let client_a = connect_client(bridge.addr).await;
    let mut client_b = connect_client(bridge.addr).await;

    drop(client_a);
    // the freed slot is noticed on the next drain; afterwards a new
    // client fits without evicting B
    sleep(Duration::from_millis(100)).await;
    let mut client_c = connect_client(bridge.addr).await;

    bridge.handles.push_inbound("PI/CV/SHOOT/DATA", "still here");
    assert_eq!(
        read_line_from(&mut client_b).await,
        "PI/CV/SHOOT/DATA,still here"
    );
    assert_eq!(
        read_line_from(&mut client_c).await,
        "PI/CV/SHOOT/DATA,still here"
    );

    bridge.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_client_sockets() {
    let bridge = start_bridge(4).await;
    let mut client = connect_client(bridge.addr).await;

    bridge.shutdown().await;
    expect_eof(&mut client).await;
}
