//! Changes feed example
//!
//! Makes sure a database exists, subscribes to its changes feed and writes a
//! document every few seconds; the listener prints every change it sees.
//!
//! Run with: cargo run --example watch_changes -- [base_url] [database]

use couch_stream_http::logging::init_tracing;
use couch_stream_http::{ChangeListener, ClientConfig, DatabaseRegistry, StatusObserver};
use serde_json::json;
use tokio::time::{interval, Duration};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("couch_stream_http=info");

    let mut args = std::env::args().skip(1);
    let base_url = args.next().unwrap_or_else(|| "http://localhost:5984".to_string());
    let name = args.next().unwrap_or_else(|| "watch_changes".to_string());

    println!("CouchDB Changes Feed Example");
    println!("============================\n");
    println!("Server:   {}", base_url);
    println!("Database: {}\n", name);

    let registry = DatabaseRegistry::new(ClientConfig {
        base_url,
        ..ClientConfig::default()
    })?;

    if !registry.test_connection(&name).await? {
        anyhow::bail!("database {} is not reachable", name);
    }

    let db = registry.get_or_create(&name);
    if let (Ok(user), Ok(password)) = (std::env::var("COUCH_USER"), std::env::var("COUCH_PASSWORD")) {
        db.set_credentials(user, password)?;
    }

    db.add_connection_status_observer(StatusObserver::new(|connected| {
        println!("  [status] connected: {}", connected);
    }));

    let listener = ChangeListener::new(|change, key| match change {
        Some(change) => println!("  [{}] seq {} id {}", key, change["seq"], change["id"]),
        None => println!("  [{}] feed ended", key),
    });
    db.subscribe(listener, None, None, None).await?;

    let mut ticks = interval(Duration::from_secs(3));
    for n in 0..5 {
        ticks.tick().await;
        let mut doc = json!({"_id": format!("tick-{}", n), "n": n});
        match db.save(&mut doc).await {
            Ok(_) => println!("Saved tick-{} at {}", n, doc["_rev"]),
            Err(e) if e.is_conflict() => println!("tick-{} already exists", n),
            Err(e) => return Err(e.into()),
        }
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    registry.close(&name);
    Ok(())
}
