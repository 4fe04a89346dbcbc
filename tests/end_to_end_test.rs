//! ringrpc End-to-End Tests
//!
//! These tests run the real client against the real server over TCP:
//! - METADATA exchange, method calls and merged services
//! - Weighted fan-out, locally and through discovery
//! - Handler faults surfaced to callers
//! - `ServiceBusy` retries under DELAY, lossless WATER_MARK flow control
//! - Server and client shutdown
//!
//! Servers publish on `127.0.0.1:0`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use ringrpc::common::location::StaticDiscovery;
use ringrpc::common::registry::{
    handler, ExecutorConfig, Handler, MethodSpec, OverflowMode, ServiceDescriptor, Weight,
};
use ringrpc::server::DelayConfig;
use ringrpc::{
    ClientConfig, ClientContext, ErrorKind, Fault, RingRpcError, RpcServer, ServerConfig,
    ServerContext, Value,
};
use serde_json::json;

// ============================================================================
// Test Helpers
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

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

fn server_config() -> ServerConfig {
    ServerConfig {
        io_workers: 2,
        drain_timeout: Duration::from_millis(200),
        ..ServerConfig::default()
    }
}

fn client_config() -> ClientConfig {
    ClientConfig {
        call_timeout: Duration::from_millis(500),
        metadata_timeout: Duration::from_secs(2),
        reconnect_delay: Duration::from_millis(20),
        ..ClientConfig::default()
    }
}

fn any_port() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn echo_service() -> ServiceDescriptor {
    let mut service = ServiceDescriptor::new("echo", any_port());
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
        .register(
            MethodSpec::new("sum").parameter("object").returns("long"),
            handler(|v| {
                let numbers: Vec<i64> = v
                    .parse()
                    .map_err(|e| Fault::new(ErrorKind::ServerError, e.to_string()))?;
                Ok(Value::Long(numbers.iter().sum()))
            }),
        )
        .unwrap();
    service
        .register(
            MethodSpec::new("reject").parameter("string").returns("string"),
            handler(|_| Err(Fault::new(ErrorKind::ServerError, "not today"))),
        )
        .unwrap();
    service
}

fn start(services: Vec<ServiceDescriptor>) -> RpcServer {
    start_with(server_config(), services)
}

fn start_with(config: ServerConfig, services: Vec<ServiceDescriptor>) -> RpcServer {
    init_tracing();
    let mut context = ServerContext::new(config);
    for service in services {
        context.publish(service).unwrap();
    }
    context.start().unwrap()
}

fn local(server: &RpcServer, service: &str) -> String {
    format!("local://{}", server.local_addr(service).unwrap())
}

async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

// ============================================================================
// Calls
// ============================================================================

#[tokio::test]
async fn test_ping_pong() {
    let server = start(vec![echo_service()]);
    let context = ClientContext::new(client_config());

    let echo = context.connect("echo", &local(&server, "echo")).await.unwrap();
    let ping = echo.method("ping").unwrap();
    assert_eq!(
        echo.invoke(&ping, Value::from("ping")).await.unwrap(),
        Value::from("pong")
    );
    assert_eq!(
        echo.call("sum", Value::from(json!([1, 2, 3, 4]))).await.unwrap(),
        Value::Long(10)
    );
    assert_eq!(context.pending_calls(), 0);

    context.shutdown();
    server.shutdown().await;
}

#[tokio::test]
async fn test_many_concurrent_calls() {
    let server = start(vec![echo_service()]);
    let context = ClientContext::new(client_config());
    let echo = context.connect("echo", &local(&server, "echo")).await.unwrap();

    let calls: Vec<_> = (0..100)
        .map(|i| {
            let echo = echo.clone();
            tokio::spawn(async move { echo.call("ping", Value::from(format!("m{}", i))).await })
        })
        .collect();
    for (i, call) in calls.into_iter().enumerate() {
        assert_eq!(call.await.unwrap().unwrap(), Value::from(format!("m{}", i)));
    }

    context.shutdown();
    server.shutdown().await;
}

#[tokio::test]
async fn test_handler_fault_reaches_caller() {
    let server = start(vec![echo_service()]);
    let context = ClientContext::new(client_config());
    let echo = context.connect("echo", &local(&server, "echo")).await.unwrap();

    let err = echo.call("reject", Value::from("x")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServerError);
    match err {
        RingRpcError::Rpc { fault, request } => {
            assert_eq!(fault.message, "not today");
            assert_eq!(request.unwrap().service_id, echo.service_id());
        }
        other => panic!("expected a fault, got {:?}", other),
    }

    let err = echo.call("missing", Value::from("x")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ClientError);

    context.shutdown();
    server.shutdown().await;
}

#[tokio::test]
async fn test_merged_service_uses_remapped_ids() {
    let mut extra = ServiceDescriptor::new("echo", any_port());
    extra
        .register(
            MethodSpec::new("shout").parameter("string").returns("string"),
            handler(|v| Ok(Value::from(v.as_str().unwrap_or_default().to_uppercase()))),
        )
        .unwrap();

    init_tracing();
    let mut server = ServerContext::new(server_config());
    server.publish(echo_service()).unwrap();
    let remap = server.publish(extra).unwrap();
    // shout was id 1 in its own descriptor
    assert_ne!(remap[&1], 1);
    let server = server.start().unwrap();

    let context = ClientContext::new(client_config());
    let echo = context.connect("echo", &local(&server, "echo")).await.unwrap();
    assert_eq!(echo.method("shout").unwrap().method_id(), remap[&1]);
    assert_eq!(
        echo.call("shout", Value::from("quiet")).await.unwrap(),
        Value::from("QUIET")
    );
    assert_eq!(
        echo.call("ping", Value::from("ping")).await.unwrap(),
        Value::from("pong")
    );

    context.shutdown();
    server.shutdown().await;
}

// ============================================================================
// Pooling
// ============================================================================

#[tokio::test]
async fn test_weight_fans_out_connections() {
    let server = start(vec![echo_service().with_weight(Weight::new(3).unwrap())]);
    let context = ClientContext::new(client_config());
    let echo = context.connect("echo", &local(&server, "echo")).await.unwrap();

    wait_for("three connections", || echo.pool().connections().len() == 3).await;
    wait_for("server side accept", || server.connections() == 3).await;
    assert_eq!(echo.pool().ring_len(), 30);

    for i in 0..20 {
        assert_eq!(
            echo.call("ping", Value::from(format!("{}", i))).await.unwrap(),
            Value::from(format!("{}", i))
        );
    }

    context.shutdown();
    server.shutdown().await;
}

#[tokio::test]
async fn test_discovery_location() {
    init_tracing();
    let discovery = Arc::new(StaticDiscovery::new());
    let service = echo_service()
        .with_weight(Weight::new(2).unwrap())
        .with_discovery("registry:2181");
    let mut server = ServerContext::with_discovery(server_config(), discovery.clone());
    server.publish(service).unwrap();
    let server = server.start().unwrap();

    let context = ClientContext::with_discovery(client_config(), discovery);
    let echo = context
        .connect("echo", "discovery://registry:2181/echo")
        .await
        .unwrap();
    assert_eq!(echo.pool().connections().len(), 2);
    assert_eq!(
        echo.call("ping", Value::from("ping")).await.unwrap(),
        Value::from("pong")
    );

    context.shutdown();
    server.shutdown().await;
}

// ============================================================================
// Backpressure
// ============================================================================

#[tokio::test]
async fn test_busy_server_retried_until_capacity_frees() {
    let latch = Latch::new();
    let started = Arc::new(AtomicUsize::new(0));
    let mut service = ServiceDescriptor::new("slow", any_port());
    let blocking: Handler = {
        let (latch, started) = (latch.clone(), started.clone());
        handler(move |v| {
            started.fetch_add(1, Ordering::SeqCst);
            latch.wait();
            Ok(v)
        })
    };
    service
        .register(
            MethodSpec::new("work")
                .parameter("string")
                .returns("string")
                .executor(
                    ExecutorConfig::single()
                        .with_capacity(1)
                        .with_overflow(OverflowMode::Delay),
                ),
            blocking,
        )
        .unwrap();
    let server = start_with(
        ServerConfig {
            delay: DelayConfig {
                delay: Duration::from_millis(10),
                max_attempts: 4,
            },
            ..server_config()
        },
        vec![service],
    );

    let context = ClientContext::new(ClientConfig {
        call_timeout: Duration::from_secs(3),
        ..client_config()
    });
    let slow = context.connect("slow", &local(&server, "slow")).await.unwrap();

    let first = tokio::spawn({
        let slow = slow.clone();
        async move { slow.call("work", Value::from("a")).await }
    });
    wait_for("first call to run", || started.load(Ordering::SeqCst) == 1).await;
    let second = tokio::spawn({
        let slow = slow.clone();
        async move { slow.call("work", Value::from("b")).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let third = tokio::spawn({
        let slow = slow.clone();
        async move { slow.call("work", Value::from("c")).await }
    });

    // several ServiceBusy rounds, more than the retry budget
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!third.is_finished());

    latch.release();
    assert_eq!(first.await.unwrap().unwrap(), Value::from("a"));
    assert_eq!(second.await.unwrap().unwrap(), Value::from("b"));
    assert_eq!(third.await.unwrap().unwrap(), Value::from("c"));

    context.shutdown();
    server.shutdown().await;
}

#[tokio::test]
async fn test_water_mark_loses_nothing() {
    let mut service = ServiceDescriptor::new("metered", any_port());
    service
        .register(
            MethodSpec::new("work")
                .parameter("int")
                .returns("int")
                .executor(
                    ExecutorConfig::single()
                        .with_capacity(4)
                        .with_overflow(OverflowMode::WaterMark),
                ),
            handler(|v| {
                std::thread::sleep(Duration::from_millis(2));
                Ok(v)
            }),
        )
        .unwrap();
    let server = start(vec![service]);
    let context = ClientContext::new(ClientConfig {
        call_timeout: Duration::from_secs(5),
        ..client_config()
    });
    let metered = context
        .connect("metered", &local(&server, "metered"))
        .await
        .unwrap();

    let calls: Vec<_> = (0..60)
        .map(|i| {
            let metered = metered.clone();
            tokio::spawn(async move { metered.call("work", Value::Int(i)).await })
        })
        .collect();
    for (i, call) in calls.into_iter().enumerate() {
        assert_eq!(call.await.unwrap().unwrap(), Value::Int(i as i32));
    }

    context.shutdown();
    server.shutdown().await;
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_client_shutdown_fails_calls() {
    let server = start(vec![echo_service()]);
    let context = ClientContext::new(client_config());
    let echo = context.connect("echo", &local(&server, "echo")).await.unwrap();

    context.shutdown();
    let err = echo.call("ping", Value::from("ping")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RpcClientStopping);

    let err = context
        .connect("echo", &local(&server, "echo"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RpcClientStopping);

    server.shutdown().await;
}

#[tokio::test]
async fn test_calls_fail_after_server_shutdown() {
    let server = start(vec![echo_service()]);
    let location = local(&server, "echo");
    let context = ClientContext::new(ClientConfig {
        call_timeout: Duration::from_millis(100),
        max_retries: 2,
        ..client_config()
    });
    let echo = context.connect("echo", &location).await.unwrap();
    assert!(echo.call("ping", Value::from("ping")).await.is_ok());

    server.shutdown().await;

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        echo.call("ping", Value::from("ping")),
    )
    .await
    .expect("call hung after server shutdown");
    assert!(outcome.is_err());

    context.shutdown();
}
