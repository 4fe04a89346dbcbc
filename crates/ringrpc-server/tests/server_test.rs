//! Server Integration Tests
//!
//! These tests start a real server and talk to it with raw frames:
//! - Every frame type on the accept path
//! - Handler faults, panics and undecodable parameters
//! - Idle close and METADATA exchange
//! - DELAY and WATER_MARK backpressure, pool growth, shared groups
//! - Shutdown answering queued requests
//!
//! All services publish on `127.0.0.1:0`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use ringrpc_common::location::{ServiceDiscovery, StaticDiscovery};
use ringrpc_common::registry::{
    handler, ExecutorConfig, Handler, MethodSpec, OverflowMode, ServiceDescriptor,
};
use ringrpc_common::transport::{FrameCodec, FrameReader, FrameWriter};
use ringrpc_common::{
    ErrorKind, Fault, Frame, Header, MethodId, PrimitiveSerializer, Primitive, Serializer,
    ServiceMetadata, TypeId, Value, MAX_FRAME_SIZE,
};
use ringrpc_server::{DelayConfig, RpcServer, ServerConfig, ServerContext};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

// ============================================================================
// Test Helpers
// ============================================================================

/// Blocks handlers until released.
struct Latch {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            open: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cv.wait(&mut open);
        }
    }

    fn release(&self) {
        *self.open.lock() = true;
        self.cv.notify_all();
    }
}

fn blocking(latch: &Arc<Latch>, started: &Arc<AtomicUsize>) -> Handler {
    let (latch, started) = (latch.clone(), started.clone());
    handler(move |v| {
        started.fetch_add(1, Ordering::SeqCst);
        latch.wait();
        Ok(v)
    })
}

fn test_config() -> ServerConfig {
    ServerConfig {
        io_workers: 2,
        drain_timeout: Duration::from_millis(200),
        ..ServerConfig::default()
    }
}

fn echo_service() -> ServiceDescriptor {
    let mut service = ServiceDescriptor::new("echo", "127.0.0.1:0".parse().unwrap());
    service
        .register(
            MethodSpec::new("ping").parameter("string").returns("string"),
            handler(|v| {
                if v.as_str() == Some("ping") {
                    Ok(Value::from("pong"))
                } else {
                    Ok(v)
                }
            }),
        )
        .unwrap();
    service
        .register(MethodSpec::new("clear"), handler(|_| Ok(Value::Empty)))
        .unwrap();
    service
        .register(
            MethodSpec::new("fail").parameter("string").returns("string"),
            handler(|_| Err(Fault::new(ErrorKind::ServerError, "refused"))),
        )
        .unwrap();
    service
        .register(
            MethodSpec::new("explode").parameter("string").returns("string"),
            handler(|_| panic!("handler exploded")),
        )
        .unwrap();
    service
}

/// Logs go to the test output; set `RUST_LOG` to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn start(config: ServerConfig, service: ServiceDescriptor) -> (RpcServer, SocketAddr) {
    init_tracing();
    let name = service.name().to_string();
    let mut context = ServerContext::new(config);
    context.publish(service).unwrap();
    let server = context.start().unwrap();
    let addr = server.local_addr(&name).unwrap();
    (server, addr)
}

fn method_id(service: &ServiceDescriptor, name: &str) -> MethodId {
    service.method_by_name(name).unwrap().method_id()
}

fn string_body(s: &str) -> Bytes {
    let mut body = BytesMut::new();
    PrimitiveSerializer::new(Primitive::String)
        .serialize(&Value::from(s), &mut body)
        .unwrap();
    body.freeze()
}

fn string_of(frame: &Frame) -> Value {
    PrimitiveSerializer::new(Primitive::String)
        .deserialize(&frame.body)
        .unwrap()
}

fn fault_of(frame: &Frame) -> Fault {
    assert_eq!(frame.header.type_id, TypeId::Abnormal);
    Fault::decode(&frame.body).unwrap()
}

async fn wait_for(counter: &AtomicUsize, value: usize) {
    for _ in 0..500 {
        if counter.load(Ordering::SeqCst) >= value {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("counter never reached {}", value);
}

/// Raw frame client
struct RawClient {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    codec: FrameCodec,
}

impl RawClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, write) = stream.into_split();
        Self {
            reader: FrameReader::new(read, MAX_FRAME_SIZE),
            writer: FrameWriter::new(write),
            codec: FrameCodec::new(),
        }
    }

    async fn send(&mut self, frame: Frame) {
        let mut buf = BytesMut::new();
        self.codec.encode(&frame, &mut buf).unwrap();
        self.send_raw(buf.freeze()).await;
    }

    async fn send_raw(&mut self, bytes: Bytes) {
        self.writer.write(&bytes).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn call(&mut self, header: Header, body: Bytes) -> Frame {
        self.send(Frame::new(header, body)).await;
        self.recv().await
    }

    async fn recv(&mut self) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), self.reader.next_frame())
            .await
            .expect("no answer within 5s")
            .unwrap()
            .expect("connection closed")
    }

    /// Asserts nothing arrives for `wait`.
    async fn expect_silence(&mut self, wait: Duration) {
        if let Ok(frame) = tokio::time::timeout(wait, self.reader.next_frame()).await {
            panic!("unexpected answer: {:?}", frame);
        }
    }
}

// ============================================================================
// Accept Path
// ============================================================================

#[tokio::test]
async fn test_object_request_answered() {
    let service = echo_service();
    let (sid, ping) = (service.service_id(), method_id(&service, "ping"));
    let (server, addr) = start(test_config(), service);
    let mut client = RawClient::connect(addr).await;

    let frame = client
        .call(Header::new(sid, 7, ping, TypeId::Object), string_body("ping"))
        .await;
    assert_eq!(frame.header, Header::new(sid, 7, ping, TypeId::Normal));
    assert_eq!(string_of(&frame), Value::from("pong"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_any_address_serves_every_service() {
    init_tracing();
    let echo = echo_service();
    let (echo_sid, ping) = (echo.service_id(), method_id(&echo, "ping"));
    let mut other = ServiceDescriptor::new("other", "127.0.0.2:0".parse().unwrap());
    let shout = other
        .register(
            MethodSpec::new("shout").parameter("string").returns("string"),
            handler(|v| Ok(Value::from(format!("{}!", v.as_str().unwrap_or_default())))),
        )
        .unwrap();
    let other_sid = other.service_id();

    let mut context = ServerContext::new(test_config());
    context.publish(echo).unwrap();
    context.publish(other).unwrap();
    let server = context.start().unwrap();
    let echo_addr = server.local_addr("echo").unwrap();
    let other_addr = server.local_addr("other").unwrap();
    assert_ne!(echo_addr, other_addr);

    // service ids resolve server-wide, whichever address the frame came in on
    let mut client = RawClient::connect(echo_addr).await;
    let frame = client
        .call(Header::new(other_sid, 1, shout, TypeId::Object), string_body("hey"))
        .await;
    assert_eq!(string_of(&frame), Value::from("hey!"));

    let mut client = RawClient::connect(other_addr).await;
    let frame = client
        .call(Header::new(echo_sid, 2, ping, TypeId::Object), string_body("ping"))
        .await;
    assert_eq!(string_of(&frame), Value::from("pong"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_empty_request_gets_empty_answer() {
    let service = echo_service();
    let (sid, clear) = (service.service_id(), method_id(&service, "clear"));
    let (server, addr) = start(test_config(), service);
    let mut client = RawClient::connect(addr).await;

    let frame = client
        .call(Header::new(sid, 8, clear, TypeId::Empty), Bytes::new())
        .await;
    assert_eq!(frame.header.type_id, TypeId::Empty);
    assert_eq!(frame.header.request_id, 8);
    assert!(frame.body.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_echoed() {
    let service = echo_service();
    let sid = service.service_id();
    let (server, addr) = start(test_config(), service);
    let mut client = RawClient::connect(addr).await;

    let frame = client.call(Header::heartbeat(sid), Bytes::new()).await;
    assert_eq!(frame.header, Header::heartbeat(sid));

    server.shutdown().await;
}

#[tokio::test]
async fn test_metadata_probe() {
    let service = echo_service();
    let sid = service.service_id();
    let ping = method_id(&service, "ping");
    let (server, addr) = start(test_config(), service);
    let mut client = RawClient::connect(addr).await;

    let frame = client.call(Header::metadata_probe(sid), Bytes::new()).await;
    assert_eq!(frame.header, Header::metadata_probe(sid));
    let metadata = ServiceMetadata::decode(&frame.body).unwrap();
    assert_eq!(metadata.service_id, sid);
    assert_eq!(metadata.name, "echo");
    assert_eq!(metadata.methods.len(), 4);
    assert_eq!(metadata.method("ping").unwrap().method_id, ping);
    assert_eq!(metadata.method("ping").unwrap().return_type, "string");

    server.shutdown().await;
}

#[tokio::test]
async fn test_metadata_probe_unknown_service() {
    let (server, addr) = start(test_config(), echo_service());
    let mut client = RawClient::connect(addr).await;

    let frame = client.call(Header::metadata_probe(1), Bytes::new()).await;
    assert_eq!(frame.header.request_id, 124);
    assert_eq!(frame.header.method_id, 124);
    assert_eq!(fault_of(&frame).kind, ErrorKind::NotExistServiceId);

    server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_method_and_service() {
    let service = echo_service();
    let sid = service.service_id();
    let (server, addr) = start(test_config(), service);
    let mut client = RawClient::connect(addr).await;

    let frame = client
        .call(Header::new(sid, 1, 99, TypeId::Object), string_body("x"))
        .await;
    assert_eq!(fault_of(&frame).kind, ErrorKind::NotExistServiceId);

    let frame = client
        .call(Header::new(sid.wrapping_add(1), 2, 1, TypeId::Object), string_body("x"))
        .await;
    assert_eq!(frame.header.request_id, 2);
    assert_eq!(fault_of(&frame).kind, ErrorKind::NotExistServiceId);

    server.shutdown().await;
}

#[tokio::test]
async fn test_response_types_rejected() {
    let service = echo_service();
    let (sid, ping) = (service.service_id(), method_id(&service, "ping"));
    let (server, addr) = start(test_config(), service);
    let mut client = RawClient::connect(addr).await;

    for (rid, type_id) in [(3, TypeId::Normal), (4, TypeId::Abnormal)] {
        let frame = client
            .call(Header::new(sid, rid, ping, type_id), Bytes::new())
            .await;
        assert_eq!(frame.header.request_id, rid);
        assert_eq!(fault_of(&frame).kind, ErrorKind::NotSupportType);
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_type_id_keeps_connection() {
    let service = echo_service();
    let (sid, ping) = (service.service_id(), method_id(&service, "ping"));
    let (server, addr) = start(test_config(), service);
    let mut client = RawClient::connect(addr).await;

    let mut raw = BytesMut::new();
    raw.put_u32(sid);
    raw.put_u64(11);
    raw.put_u8(ping);
    raw.put_u8(42);
    raw.put_u16(0);
    client.send_raw(raw.freeze()).await;

    let frame = client.recv().await;
    assert_eq!(frame.header.request_id, 11);
    assert_eq!(fault_of(&frame).kind, ErrorKind::NotSupportType);

    let frame = client
        .call(Header::new(sid, 12, ping, TypeId::Object), string_body("ping"))
        .await;
    assert_eq!(string_of(&frame), Value::from("pong"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_handler_failures() {
    let service = echo_service();
    let sid = service.service_id();
    let (fail, explode, ping) = (
        method_id(&service, "fail"),
        method_id(&service, "explode"),
        method_id(&service, "ping"),
    );
    let (server, addr) = start(test_config(), service);
    let mut client = RawClient::connect(addr).await;

    let frame = client
        .call(Header::new(sid, 1, fail, TypeId::Object), string_body("x"))
        .await;
    assert_eq!(
        fault_of(&frame),
        Fault::new(ErrorKind::ServerError, "refused")
    );

    let frame = client
        .call(Header::new(sid, 2, explode, TypeId::Object), string_body("x"))
        .await;
    let fault = fault_of(&frame);
    assert_eq!(fault.kind, ErrorKind::ServerError);
    assert!(fault.message.contains("handler exploded"));

    // one byte cannot be a length-prefixed string
    let frame = client
        .call(
            Header::new(sid, 3, ping, TypeId::Object),
            Bytes::from_static(&[1]),
        )
        .await;
    assert_eq!(frame.header.request_id, 3);
    assert_eq!(fault_of(&frame).kind, ErrorKind::SerializerError);

    server.shutdown().await;
}

#[tokio::test]
async fn test_idle_connection_closed() {
    let config = ServerConfig {
        idle_timeout: Duration::from_millis(100),
        ..test_config()
    };
    let (server, addr) = start(config, echo_service());
    let mut client = RawClient::connect(addr).await;

    let closed = tokio::time::timeout(Duration::from_secs(2), client.reader.next_frame())
        .await
        .expect("server kept the idle connection open");
    assert!(matches!(closed, Ok(None)) || closed.is_err());

    server.shutdown().await;
}

#[tokio::test]
async fn test_discovery_announces_bound_address() {
    let discovery = Arc::new(StaticDiscovery::new());
    let service = echo_service().with_discovery("registry-a");
    let mut context = ServerContext::with_discovery(test_config(), discovery.clone());
    context.publish(service).unwrap();
    let server = context.start().unwrap();
    let bound = server.local_addr("echo").unwrap();

    let addresses = discovery.resolve("registry-a", "echo").unwrap();
    assert_eq!(addresses.len(), 1);
    assert_eq!(addresses[0].addr, bound);
    let metadata = discovery.metadata("registry-a", "echo").unwrap().unwrap();
    assert_eq!(metadata.methods.len(), 4);

    server.shutdown().await;
}

#[test]
fn test_start_without_services_fails() {
    assert!(ServerContext::new(test_config()).start().is_err());
}

// ============================================================================
// Executors and Backpressure
// ============================================================================

#[tokio::test]
async fn test_delay_overflow_answers_busy() {
    let latch = Latch::new();
    let started = Arc::new(AtomicUsize::new(0));
    let mut service = ServiceDescriptor::new("slow", "127.0.0.1:0".parse().unwrap());
    let work = service
        .register(
            MethodSpec::new("work")
                .parameter("string")
                .returns("string")
                .executor(
                    ExecutorConfig::single()
                        .with_capacity(1)
                        .with_overflow(OverflowMode::Delay),
                ),
            blocking(&latch, &started),
        )
        .unwrap();
    let sid = service.service_id();
    let config = ServerConfig {
        delay: DelayConfig {
            delay: Duration::from_millis(10),
            max_attempts: 4,
        },
        ..test_config()
    };
    let (server, addr) = start(config, service);
    let mut client = RawClient::connect(addr).await;

    client
        .send(Frame::new(Header::new(sid, 1, work, TypeId::Object), string_body("a")))
        .await;
    wait_for(&started, 1).await;
    client
        .send(Frame::new(Header::new(sid, 2, work, TypeId::Object), string_body("b")))
        .await;
    client
        .send(Frame::new(Header::new(sid, 3, work, TypeId::Object), string_body("c")))
        .await;

    let frame = client.recv().await;
    assert_eq!(frame.header.request_id, 3);
    assert_eq!(fault_of(&frame).kind, ErrorKind::ServiceBusy);
    assert_eq!(server.dispatcher().delay().resubmits(), 4);

    latch.release();
    let mut answered = vec![client.recv().await, client.recv().await];
    answered.sort_by_key(|f| f.header.request_id);
    assert_eq!(string_of(&answered[0]), Value::from("a"));
    assert_eq!(string_of(&answered[1]), Value::from("b"));
    client.expect_silence(Duration::from_millis(100)).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_water_mark_pauses_reads() {
    let latch = Latch::new();
    let started = Arc::new(AtomicUsize::new(0));
    let mut service = ServiceDescriptor::new("marked", "127.0.0.1:0".parse().unwrap());
    let work = service
        .register(
            MethodSpec::new("work")
                .parameter("string")
                .returns("string")
                .executor(
                    ExecutorConfig::single()
                        .with_capacity(10)
                        .with_overflow(OverflowMode::WaterMark),
                ),
            blocking(&latch, &started),
        )
        .unwrap();
    let sid = service.service_id();
    let (server, addr) = start(test_config(), service);
    let mut client = RawClient::connect(addr).await;

    client
        .send(Frame::new(Header::new(sid, 1, work, TypeId::Object), string_body("x")))
        .await;
    wait_for(&started, 1).await;

    // nine queued reach the high mark of 9
    for rid in 2..=11 {
        client
            .send(Frame::new(Header::new(sid, rid, work, TypeId::Object), string_body("x")))
            .await;
    }
    client.send(Frame::empty(Header::heartbeat(sid))).await;

    // the heartbeat sits unread behind the closed gate
    client.expect_silence(Duration::from_millis(150)).await;

    latch.release();
    let mut normal = 0;
    let mut heartbeats = 0;
    for _ in 0..12 {
        match client.recv().await.header.type_id {
            TypeId::Normal => normal += 1,
            TypeId::Heartbeat => heartbeats += 1,
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(normal, 11);
    assert_eq!(heartbeats, 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_pool_executor_grows() {
    let barrier = Arc::new(Barrier::new(3));
    let mut service = ServiceDescriptor::new("pooled", "127.0.0.1:0".parse().unwrap());
    let work = service
        .register(
            MethodSpec::new("work")
                .parameter("string")
                .returns("string")
                .executor(ExecutorConfig::pool(1, 4)),
            {
                let barrier = barrier.clone();
                handler(move |v| {
                    barrier.wait();
                    Ok(v)
                })
            },
        )
        .unwrap();
    let sid = service.service_id();
    let (server, addr) = start(test_config(), service);
    let mut client = RawClient::connect(addr).await;

    // three calls only finish when three threads run them at once
    for rid in 1..=3 {
        client
            .send(Frame::new(Header::new(sid, rid, work, TypeId::Object), string_body("x")))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    for _ in 0..3 {
        assert_eq!(client.recv().await.header.type_id, TypeId::Normal);
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_shared_group_runs_on_one_executor() {
    let latch = Latch::new();
    let started = Arc::new(AtomicUsize::new(0));
    let group = ExecutorConfig::single().shared("serial");
    let mut service = ServiceDescriptor::new("grouped", "127.0.0.1:0".parse().unwrap());
    let slow = service
        .register(
            MethodSpec::new("slow")
                .parameter("string")
                .returns("string")
                .executor(group.clone()),
            blocking(&latch, &started),
        )
        .unwrap();
    let fast = service
        .register(
            MethodSpec::new("fast")
                .parameter("string")
                .returns("string")
                .executor(group),
            handler(Ok),
        )
        .unwrap();
    let sid = service.service_id();
    let (server, addr) = start(test_config(), service);
    let mut client = RawClient::connect(addr).await;

    client
        .send(Frame::new(Header::new(sid, 1, slow, TypeId::Object), string_body("s")))
        .await;
    wait_for(&started, 1).await;
    client
        .send(Frame::new(Header::new(sid, 2, fast, TypeId::Object), string_body("f")))
        .await;

    // the shared thread is still busy with the slow call
    client.expect_silence(Duration::from_millis(100)).await;

    latch.release();
    let first = client.recv().await;
    let second = client.recv().await;
    assert_eq!(first.header.request_id, 1);
    assert_eq!(second.header.request_id, 2);

    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_answers_queued_requests() {
    let latch = Latch::new();
    let started = Arc::new(AtomicUsize::new(0));
    let mut service = ServiceDescriptor::new("draining", "127.0.0.1:0".parse().unwrap());
    let work = service
        .register(
            MethodSpec::new("work").parameter("string").returns("string"),
            blocking(&latch, &started),
        )
        .unwrap();
    let sid = service.service_id();
    let (server, addr) = start(test_config(), service);
    let mut client = RawClient::connect(addr).await;

    client
        .send(Frame::new(Header::new(sid, 1, work, TypeId::Object), string_body("x")))
        .await;
    wait_for(&started, 1).await;
    client
        .send(Frame::new(Header::new(sid, 2, work, TypeId::Object), string_body("y")))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let shutdown = tokio::spawn(server.shutdown());

    let frame = client.recv().await;
    assert_eq!(frame.header.request_id, 2);
    assert_eq!(fault_of(&frame).kind, ErrorKind::RpcServerStopping);

    latch.release();
    shutdown.await.unwrap();

    // the running call may still slip out before the writer closes
    loop {
        let next = tokio::time::timeout(Duration::from_secs(2), client.reader.next_frame())
            .await
            .expect("connection still open after shutdown");
        match next {
            Ok(Some(frame)) => assert_eq!(frame.header.request_id, 1),
            _ => break,
        }
    }
}
