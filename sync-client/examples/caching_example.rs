use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sync_client::{Error, RawResponse, Request, SharedRequestFn, SyncClient, SyncConfig};

/// Pretends to be the agents endpoint: slow, and versioned with an entity tag
fn simulated_backend(calls: Arc<AtomicUsize>) -> SharedRequestFn<Value> {
    Arc::new(move |request: Request| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;

            if request.header_value(sync_client::IF_NONE_MATCH) == Some("\"agents-v1\"") {
                return Ok::<_, Error>(RawResponse::not_modified());
            }
            Ok(RawResponse::ok(json!({
                "agents": [
                    {"id": "agent-1", "status": "running"},
                    {"id": "agent-2", "status": "idle"},
                ]
            }))
            .with_etag("\"agents-v1\""))
        }
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    let calls = Arc::new(AtomicUsize::new(0));
    let config = SyncConfig::default()
        .with_max_age(Duration::from_secs(1))
        .with_poll_interval("agents", Duration::from_millis(500));
    let client = Arc::new(SyncClient::new(config, simulated_backend(calls.clone()))?);
    let request = Request::get("/api/agents");

    println!("=== Concurrent misses ===");
    let start = std::time::Instant::now();
    let results = futures::future::join_all((0..5).map(|_| client.fetch(request.clone()))).await;
    println!(
        "{} callers served in {:?} with {} backend call(s)",
        results.len(),
        start.elapsed(),
        calls.load(Ordering::SeqCst)
    );

    println!("\n=== Cached read ===");
    let start = std::time::Instant::now();
    client.fetch(request.clone()).await?;
    println!("Cached fetch took: {:?}", start.elapsed());

    println!("\n=== Stale read ===");
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let start = std::time::Instant::now();
    client.fetch(request.clone()).await?;
    println!("Stale fetch took: {:?} (revalidating in background)", start.elapsed());
    client.coordinator().settle_revalidations().await;
    println!("Cache stats: {:?}", client.cache_stats());

    println!("\n=== Polling ===");
    client.poll("agents", request.clone(), |snapshot: Value| {
        let count = snapshot["agents"].as_array().map_or(0, |agents| agents.len());
        println!("Snapshot with {} agents", count);
    })?;
    tokio::time::sleep(Duration::from_millis(1600)).await;

    client.shutdown();
    println!("\nBackend calls in total: {}", calls.load(Ordering::SeqCst));

    Ok(())
}
