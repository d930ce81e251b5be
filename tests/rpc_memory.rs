// tests/rpc_memory.rs
//! End-to-end call behavior over the in-process broker.
//!
//! A simulated worker taps the request exchange under its service name and
//! publishes raw reply bodies to the caller's reply queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::task::{JoinHandle, JoinSet};

use mom_dispatch::{
    //
    BrokerConfig,
    CorrelationId,
    Envelope,
    FailureKind,
    FeatureTarget,
    JsonCodec,
    MemoryBroker,
    ReconnectPolicy,
    RpcClient,
    RpcClientBuilder,
    RpcError,
    DEFAULT_REQUEST_EXCHANGE,
    DEFAULT_RESULT_EXCHANGE,
};

const SERVICE: &str = "ai-core-test";
const FEATURE: &str = "image2image";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn target(timeout: Duration) -> FeatureTarget {
    FeatureTarget::new(SERVICE, FEATURE, timeout)
}

async fn client(broker: &Arc<MemoryBroker>, reply_queue: &str) -> RpcClient {
    // ---
    RpcClientBuilder::new()
        .broker(BrokerConfig::new("memory://").with_reply_queue(reply_queue))
        .connector(broker.connector())
        .reconnect_policy(ReconnectPolicy {
            max_attempts: 3,
            interval: Duration::from_millis(20),
        })
        .build()
        .await
        .expect("client build failed")
}

/// Spawn a worker for `SERVICE`. `respond` maps each request body to the raw
/// reply bodies to send back, in order.
fn spawn_worker<F>(broker: &Arc<MemoryBroker>, respond: F) -> JoinHandle<()>
where
    F: Fn(&Value) -> Vec<Vec<u8>> + Send + 'static,
{
    // ---
    let mut requests = broker
        .tap("worker-inbox", DEFAULT_REQUEST_EXCHANGE, SERVICE)
        .expect("tap failed");
    let broker = Arc::clone(broker);

    tokio::spawn(async move {
        while let Some(env) = requests.recv().await {
            let body: Value = serde_json::from_slice(&env.payload).expect("request is not JSON");
            let reply_to = env.properties.reply_to.clone().expect("request without reply_to");
            let id = env.correlation_id().cloned().expect("request without correlation_id");

            for reply in respond(&body) {
                broker
                    .inject(Envelope::reply(
                        DEFAULT_RESULT_EXCHANGE,
                        reply_to.as_str(),
                        Bytes::from(reply),
                        id.clone(),
                    ))
                    .expect("inject failed");
            }
        }
    })
}

fn json_bytes(value: Value) -> Vec<u8> {
    serde_json::to_vec(&value).unwrap()
}

#[tokio::test]
async fn test_result_file_resolves_call() {
    // ---
    init_tracing();
    let broker = MemoryBroker::new();
    let _worker = spawn_worker(&broker, |_| vec![json_bytes(json!({"resultFile": ["out.png"]}))]);
    let client = client(&broker, "workflow-rpc-success").await;

    let result = client
        .call(&json!({"file": "s3://in/cat.png"}), &target(Duration::from_secs(5)))
        .await;

    assert_eq!(result, Ok("out.png".to_string()));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_request_carries_feature_and_output_path() {
    // ---
    init_tracing();
    let broker = MemoryBroker::new();
    let mut requests = broker
        .tap("inspect-inbox", DEFAULT_REQUEST_EXCHANGE, SERVICE)
        .unwrap();
    let client = client(&broker, "workflow-rpc-inspect").await;

    let pending = client
        .begin(
            &json!({"file": "s3://in/cat.png?sig=abc", "prompt": "a cat"}),
            &target(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    let env = tokio::time::timeout(Duration::from_secs(2), requests.recv())
        .await
        .expect("request never arrived")
        .unwrap();
    let body: Value = serde_json::from_slice(&env.payload).unwrap();

    assert_eq!(env.routing_key, SERVICE);
    assert_eq!(env.properties.reply_to.as_deref(), Some("workflow-rpc-inspect"));
    assert_eq!(env.correlation_id(), Some(pending.correlation_id()));
    assert_eq!(body["prompt"], "a cat");
    assert_eq!(body["targetFeature"], FEATURE);
    assert_eq!(
        body["expectOutputPath"],
        format!("{SERVICE}/{FEATURE}/{}/cat.png", pending.correlation_id())
    );

    assert!(client.cancel(pending.correlation_id()));
}

#[tokio::test]
async fn test_error_message_fails_call() {
    // ---
    init_tracing();
    let broker = MemoryBroker::new();
    let _worker = spawn_worker(&broker, |_| vec![json_bytes(json!({"errorMessage": "oom"}))]);
    let client = client(&broker, "workflow-rpc-remote").await;

    let err = client
        .call(&json!({"file": "a.png"}), &target(Duration::from_secs(5)))
        .await
        .unwrap_err();

    assert_eq!(err, RpcError::Remote("oom".into()));
    assert_eq!(err.kind(), FailureKind::Remote);
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_timeout_without_reply() {
    // ---
    init_tracing();
    let broker = MemoryBroker::new();
    let client = client(&broker, "workflow-rpc-timeout").await;
    let timeout = Duration::from_millis(100);

    let started = Instant::now();
    let err = client
        .call(&json!({"file": "a.png"}), &target(timeout))
        .await
        .unwrap_err();

    assert_eq!(err, RpcError::Timeout(timeout));
    assert!(err.is_timeout());
    assert!(started.elapsed() >= timeout);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_late_reply_after_timeout_is_dropped() {
    // ---
    init_tracing();
    let broker = MemoryBroker::new();
    let _worker = spawn_worker(&broker, |_| Vec::new());
    let client = client(&broker, "workflow-rpc-late").await;

    let pending = client
        .begin(&json!({"file": "a.png"}), &target(Duration::from_millis(50)))
        .await
        .unwrap();
    let id = pending.correlation_id().clone();
    assert_eq!(pending.wait().await, Err(RpcError::Timeout(Duration::from_millis(50))));

    broker
        .inject(Envelope::reply(
            DEFAULT_RESULT_EXCHANGE,
            "workflow-rpc-late",
            Bytes::from(json_bytes(json!({"resultFile": ["late.png"]}))),
            id,
        ))
        .unwrap();

    // The client stays usable and nothing is left behind.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_publish_rejection_fails_immediately() {
    // ---
    init_tracing();
    let broker = MemoryBroker::new();
    let client = client(&broker, "workflow-rpc-reject").await;
    broker.set_reject_publishes(true);

    let started = Instant::now();
    let err = client
        .call(&json!({"file": "a.png"}), &target(Duration::from_secs(30)))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::Publish);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_call_while_disconnected_fails_as_publish() {
    // ---
    init_tracing();
    let broker = MemoryBroker::new();
    broker.refuse_connections(100);
    let client = client(&broker, "workflow-rpc-offline").await;

    let err = client
        .call(&json!({"file": "a.png"}), &target(Duration::from_secs(30)))
        .await
        .unwrap_err();

    assert_eq!(err, RpcError::NotConnected);
    assert_eq!(err.kind(), FailureKind::Publish);
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_non_terminal_and_malformed_replies_keep_waiting() {
    // ---
    init_tracing();
    let broker = MemoryBroker::new();
    let _worker = spawn_worker(&broker, |_| {
        vec![
            json_bytes(json!({"status": "rendering"})),
            b"not json at all".to_vec(),
            json_bytes(json!({"resultFile": ["final.mp4"]})),
        ]
    });
    let client = client(&broker, "workflow-rpc-progress").await;

    let result = client
        .call(&json!({"file": "clip.png"}), &target(Duration::from_secs(5)))
        .await;

    assert_eq!(result, Ok("final.mp4".to_string()));
}

#[tokio::test]
async fn test_unknown_correlation_id_is_ignored() {
    // ---
    init_tracing();
    let broker = MemoryBroker::new();
    let _worker = spawn_worker(&broker, |_| vec![json_bytes(json!({"resultFile": ["mine.png"]}))]);
    let client = client(&broker, "workflow-rpc-stranger").await;

    let pending = client
        .begin(&json!({"file": "a.png"}), &target(Duration::from_secs(5)))
        .await
        .unwrap();

    broker
        .inject(Envelope::reply(
            DEFAULT_RESULT_EXCHANGE,
            "workflow-rpc-stranger",
            Bytes::from(json_bytes(json!({"errorMessage": "not for you"}))),
            CorrelationId::generate(),
        ))
        .unwrap();

    assert_eq!(pending.wait().await, Ok("mine.png".to_string()));
}

#[tokio::test]
async fn test_concurrent_calls_are_matched_independently() {
    // ---
    init_tracing();
    let broker = MemoryBroker::new();
    let _worker = spawn_worker(&broker, |body| {
        let file = body["file"].as_str().unwrap_or_default().to_string();
        vec![json_bytes(json!({"resultFile": [format!("out-{file}")]}))]
    });
    let client = client(&broker, "workflow-rpc-concurrent").await;

    let mut calls = JoinSet::new();
    for i in 0..25 {
        let client = client.clone();
        calls.spawn(async move {
            let file = format!("{i}.png");
            let result = client
                .call(&json!({ "file": file }), &target(Duration::from_secs(5)))
                .await;
            (file, result)
        });
    }

    let mut completed = 0;
    while let Some(joined) = calls.join_next().await {
        let (file, result) = joined.expect("call task panicked");
        assert_eq!(result, Ok(format!("out-{file}")));
        completed += 1;
    }

    assert_eq!(completed, 25);
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_cancel_settles_waiter() {
    // ---
    init_tracing();
    let broker = MemoryBroker::new();
    let client = client(&broker, "workflow-rpc-cancel").await;

    let pending = client
        .begin(&json!({"file": "a.png"}), &target(Duration::from_secs(30)))
        .await
        .unwrap();
    let id = pending.correlation_id().clone();
    let waiter = tokio::spawn(pending.wait());

    assert!(client.cancel(&id));
    assert!(!client.cancel(&id));

    let outcome = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("waiter not released")
        .unwrap();
    assert_eq!(outcome, Err(RpcError::Cancelled));
    assert_eq!(outcome.unwrap_err().kind(), FailureKind::Cancelled);
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_call_each_stops_at_first_failure() {
    // ---
    init_tracing();
    let broker = MemoryBroker::new();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let _worker = spawn_worker(&broker, move |body| {
        counter.fetch_add(1, Ordering::SeqCst);
        match body["file"].as_str() {
            Some("bad.png") => vec![json_bytes(json!({"errorMessage": "corrupt input"}))],
            Some(file) => vec![json_bytes(json!({"resultFile": [file]}))],
            None => vec![json_bytes(json!({"errorMessage": "no file"}))],
        }
    });
    let client = client(&broker, "workflow-rpc-batch").await;

    let ok = client
        .call_each(
            [json!({"file": "a.png"}), json!({"file": "b.png"})],
            &target(Duration::from_secs(5)),
        )
        .await;
    assert_eq!(ok, Ok(vec!["a.png".to_string(), "b.png".to_string()]));

    let failed = client
        .call_each(
            [
                json!({"file": "c.png"}),
                json!({"file": "bad.png"}),
                json!({"file": "never.png"}),
            ],
            &target(Duration::from_secs(5)),
        )
        .await;
    assert_eq!(failed, Err(RpcError::Remote("corrupt input".into())));
    assert_eq!(seen.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_call_with_and_non_object_payload() {
    // ---
    init_tracing();
    let broker = MemoryBroker::new();
    let _worker = spawn_worker(&broker, |_| vec![json_bytes(json!({"resultFile": []}))]);
    let client = client(&broker, "workflow-rpc-callwith").await;

    let empty = client
        .call_with(&json!({"prompt": "x"}), SERVICE, FEATURE, 5_000)
        .await;
    assert_eq!(empty, Ok(String::new()));

    let err = client
        .call_with(&json!(["not", "an", "object"]), SERVICE, FEATURE, 5_000)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Encode(_)));
    assert_eq!(err.kind(), FailureKind::Config);
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_clients_sharing_a_connection_both_get_replies() {
    // ---
    init_tracing();
    let broker = MemoryBroker::new();
    let _worker = spawn_worker(&broker, |body| {
        let file = body["file"].as_str().unwrap_or_default().to_string();
        vec![json_bytes(json!({"resultFile": [format!("out-{file}")]}))]
    });
    let first = client(&broker, "workflow-rpc-shared").await;
    let second = RpcClient::new(first.connection().clone(), Arc::new(JsonCodec));

    let a = first
        .call(&json!({"file": "a.png"}), &target(Duration::from_secs(5)))
        .await;
    let b = second
        .call(&json!({"file": "b.png"}), &target(Duration::from_secs(5)))
        .await;

    assert_eq!(a, Ok("out-a.png".to_string()));
    assert_eq!(b, Ok("out-b.png".to_string()));

    // A client added later reuses the consumer already on the reply queue.
    let third = RpcClient::new(first.connection().clone(), Arc::new(JsonCodec));
    let c = third
        .call(&json!({"file": "c.png"}), &target(Duration::from_secs(5)))
        .await;
    assert_eq!(c, Ok("out-c.png".to_string()));
    assert_eq!(second.pending_calls(), 0);
}

#[tokio::test]
async fn test_dropped_call_is_released_before_timeout() {
    // ---
    init_tracing();
    let broker = MemoryBroker::new();
    let _worker = spawn_worker(&broker, |_| Vec::new());
    let client = client(&broker, "workflow-rpc-abandon").await;

    let payload = json!({"file": "a.png"});
    let call_target = target(Duration::from_secs(600));
    let call = client.call(&payload, &call_target);
    tokio::select! {
        _ = call => panic!("call settled without a reply"),
        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
    }

    assert_eq!(client.pending_calls(), 0);
}
