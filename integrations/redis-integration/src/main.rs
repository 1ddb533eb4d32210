use deferwork::store::{KeyTtl, RedisStore};
use deferwork::{Call, Connection, DeferworkError, Store};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

// Include shared test scenarios
#[path = "../../shared/test_scenarios.rs"]
mod test_scenarios;
use test_scenarios::TestScenarios;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("redis_integration=info".parse()?)
                .add_directive("deferwork=debug".parse()?),
        )
        .init();

    info!("🟥 Starting Redis integration tests for deferwork");

    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| {
        warn!("REDIS_URL not set, using default");
        "redis://127.0.0.1:6379/15".to_string()
    });

    info!("📡 Connecting to Redis: {}", redis_url);

    let store = match RedisStore::connect(&redis_url).await {
        Ok(store) => {
            info!("✅ Successfully connected to Redis");
            Arc::new(store)
        }
        Err(e) => {
            error!("❌ Failed to connect to Redis: {}", e);
            return Err(e.into());
        }
    };

    let conn = Connection::new(store.clone(), Arc::new(TestScenarios::functions()));

    if let Err(e) = run_redis_specific_tests(&conn).await {
        error!("❌ Redis-specific tests failed: {}", e);
        return Err(e.into());
    }

    let test_scenarios = TestScenarios::new(conn);

    info!("🧪 Running comprehensive integration tests");
    if let Err(e) = test_scenarios.run_all_tests().await {
        error!("❌ Integration tests failed: {}", e);
        return Err(e.into());
    }

    info!("🎉 All Redis integration tests completed successfully!");
    Ok(())
}

async fn run_redis_specific_tests(conn: &Connection) -> deferwork::Result<()> {
    info!("🧪 Running Redis-specific tests");

    test_server_side_ttl(conn).await?;
    test_concurrent_dequeue(conn).await?;

    info!("✅ Redis-specific tests completed");
    Ok(())
}

/// The job hash carries a real Redis expiry that perform lifts and replaces.
async fn test_server_side_ttl(conn: &Connection) -> deferwork::Result<()> {
    info!("🧪 Testing server-side TTL handling");

    let queue = conn.queue(format!("redis-ttl-{}", uuid::Uuid::new_v4().simple()));
    let mut job = queue
        .enqueue(
            Call::new("integration.add")
                .arg(json!(20))
                .arg(json!(22))
                .ttl(300)
                .result_ttl(120),
        )
        .await?;

    match conn.store().ttl(&job.key()).await? {
        KeyTtl::ExpiresIn(seconds) if seconds > 290 => {
            info!("✅ Queued job expires in {}s", seconds)
        }
        other => {
            return Err(DeferworkError::Worker {
                message: format!("unexpected ttl for queued job: {:?}", other),
            });
        }
    }

    queue.dequeue().await?;
    job.perform().await?;

    match conn.store().ttl(&job.key()).await? {
        KeyTtl::ExpiresIn(seconds) if seconds <= 120 => {
            info!("✅ Finished job expires in {}s", seconds)
        }
        other => {
            return Err(DeferworkError::Worker {
                message: format!("unexpected ttl for finished job: {:?}", other),
            });
        }
    }

    let elapsed = chrono::Utc::now() - job.created_at;
    info!("✅ Server-side TTL test completed in {}ms", elapsed.num_milliseconds());
    job.delete().await?;
    Ok(())
}

/// Many tasks popping from one list never see the same job twice.
async fn test_concurrent_dequeue(conn: &Connection) -> deferwork::Result<()> {
    info!("🧪 Testing concurrent dequeue");

    let queue = conn.queue(format!("redis-pop-{}", uuid::Uuid::new_v4().simple()));
    for i in 0..20 {
        queue
            .enqueue(Call::new("integration.add").arg(json!(i)).arg(json!(i)))
            .await?;
    }
    info!("✅ Enqueued 20 jobs for concurrent dequeue test");

    let mut handles = Vec::new();
    for _ in 0..5 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let mut taken = Vec::new();
            while let Some(id) = queue.dequeue().await? {
                taken.push(id);
            }
            Ok::<_, DeferworkError>(taken)
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        let taken = handle.await.map_err(|e| DeferworkError::Worker {
            message: format!("dequeue task failed: {}", e),
        })??;
        for id in taken {
            if !seen.insert(id) {
                return Err(DeferworkError::Worker {
                    message: format!("job {} dequeued twice", id),
                });
            }
        }
    }

    if seen.len() != 20 {
        return Err(DeferworkError::Worker {
            message: format!("expected 20 dequeued jobs, got {}", seen.len()),
        });
    }

    for id in seen {
        conn.get_job(id).await?.delete().await?;
    }
    info!("✅ Concurrent dequeue test completed");
    Ok(())
}
