//! Full call round trip on the in-process broker, with a simulated worker.
//!
//! Run with `RUST_LOG=mom_dispatch=debug cargo run --example memory_roundtrip`.

use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};

use mom_dispatch::{
    BrokerConfig, CombineImageRequest, Envelope, FeatureTarget, MemoryBroker, Result,
    RpcClientBuilder, DEFAULT_REQUEST_EXCHANGE, DEFAULT_RESULT_EXCHANGE,
};

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let broker = MemoryBroker::new();
    let target = FeatureTarget::combine_image();

    // Worker: answers every request with a file next to the expected output path.
    let mut requests = broker.tap(
        "outpainting-inbox",
        DEFAULT_REQUEST_EXCHANGE,
        &target.target_service,
    )?;
    let worker_broker = broker.clone();
    tokio::spawn(async move {
        while let Some(env) = requests.recv().await {
            let id = env.correlation_id().cloned();
            let (Some(id), Some(reply_to)) = (id, env.properties.reply_to.clone()) else {
                continue;
            };
            let body: Value = serde_json::from_slice(&env.payload).unwrap_or_default();
            let output = body["expectOutputPath"].as_str().unwrap_or_default().to_string();

            tokio::time::sleep(Duration::from_millis(200)).await;
            let reply = json!({ "resultFile": [output] });
            let _ = worker_broker.inject(Envelope::reply(
                DEFAULT_RESULT_EXCHANGE,
                reply_to,
                Bytes::from(reply.to_string()),
                id,
            ));
        }
    });

    let client = RpcClientBuilder::new()
        .broker(BrokerConfig::new("memory://").with_reply_queue("workflow-demo"))
        .connector(broker.connector())
        .build()
        .await?;

    let request = CombineImageRequest {
        file: "s3://uploads/portrait.png".into(),
        another_file: "s3://uploads/beach.png".into(),
        style_combine_background: "watercolor".into(),
        prompt: "sunset".into(),
    };

    let output = client.call(&request, &target).await?;
    println!("combined image written to {output}");

    client.close().await
}
