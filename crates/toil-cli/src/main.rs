use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use toil_core::{
    Backend, InMemoryBackend, Job, JobHandler, JobOutcome, JobState, Queue, RedisBackend,
};

#[derive(Debug, Deserialize)]
struct GreetPayload {
    name: String,
}

struct GreetHandler {
    remaining_failures: AtomicU32,
}

impl GreetHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl JobHandler for GreetHandler {
    async fn handle(&self, job: &Job) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let payload: GreetPayload = serde_json::from_value(job.payload.clone())?;

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(format!("intentional failure (left={left})").into());
        }

        println!("Hello, {}!", payload.name);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // (A) Backend from the environment: Redis when REDIS_URL is set,
    //     otherwise in-memory (single-process demo).
    let backend: Arc<dyn Backend> = match env::var("REDIS_URL") {
        Ok(url) => {
            info!(%url, "using redis backend");
            Arc::new(RedisBackend::connect(&url).await?)
        }
        Err(_) => {
            info!("using in-memory backend (set REDIS_URL for a shared one)");
            Arc::new(InMemoryBackend::new())
        }
    };
    let name = env::var("QUEUE_NAME").unwrap_or_else(|_| "demo".to_string());

    // (B) One queue instance, working as both producer and worker.
    let queue = Queue::builder(name, backend)
        .lock_ttl(Duration::from_secs(60))
        .build()?;
    queue.process(Arc::new(GreetHandler::new(1))).await?;

    // (C) Enqueue a couple of jobs; the first one fails on purpose.
    let mut handles = Vec::new();
    for who in ["toil", "world"] {
        handles.push(queue.add(serde_json::json!({ "name": who })).await?);
    }

    // (D) Wait for the terminal events to resolve the local handles.
    for handle in handles {
        let id = handle.id();
        match handle.wait().await? {
            JobOutcome::Completed => info!(job = %id, "completed"),
            JobOutcome::Failed { error } => info!(job = %id, %error, "failed"),
        }
    }

    info!(
        complete = queue.count_in(&[JobState::Complete]).await?,
        failed = queue.count_in(&[JobState::Failed]).await?,
        "final counts"
    );
    queue.close().await;
    Ok(())
}
