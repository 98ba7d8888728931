use std::sync::Arc;
use std::time::Duration;

use query_tasks::config::PoolConfig;
use query_tasks::query::TaskQuery;
use query_tasks::tasks::{TaskContext, TaskEventKind, TaskManager};

/// Pretend catalogue searched by the demo queries.
const CATALOGUE: &[&str] = &[
    "amber", "apple", "apricot", "banana", "blackberry", "blueberry", "cherry", "grape", "lemon",
    "lime", "mango", "melon", "orange", "peach", "pear", "plum",
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = PoolConfig::from_env()?;
    let manager = Arc::new(TaskManager::new(config)?);

    manager.register_observer(|event| {
        if event.kind == TaskEventKind::Finished {
            tracing::info!(
                generation = event.snapshot.generation,
                state = %event.snapshot.state,
                elapsed_ms = event.snapshot.elapsed().map(|d| d.as_millis() as u64),
                "{}",
                event.snapshot.description
            );
        }
    });

    // Progress from the broadcast side, the way a UI would follow it.
    let mut events = manager.subscribe();
    let follower = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if event.kind == TaskEventKind::Progress {
                tracing::debug!(
                    generation = event.snapshot.generation,
                    progress = event.snapshot.progress,
                    "{}",
                    event.snapshot.action_caption
                );
            }
        }
    });

    let query = TaskQuery::<Vec<String>>::new(Arc::clone(&manager));

    // Simulate someone typing "ap" one keystroke at a time; every keystroke
    // supersedes the previous search.
    let mut last = None;
    for prefix in ["a", "ap", "apr", "ap"] {
        let needle = prefix.to_string();
        last = Some(query.set_query(format!("prefix '{prefix}'"), move |ctx: &TaskContext| {
            search(ctx, &needle)
        }));
        tokio::time::sleep(Duration::from_millis(15)).await;
    }

    if let Some(ctx) = last {
        tokio::task::spawn_blocking(move || ctx.wait()).await?;
    }

    match query.get() {
        Some(matches) => println!("{} matches: {}", matches.len(), matches.join(", ")),
        None => println!("no result committed"),
    }
    println!("{:?}", manager.summary());

    manager.shutdown();
    // Contexts still hold the broadcast sender, so the follower never sees
    // the channel close.
    follower.abort();
    Ok(())
}

/// Scan the catalogue slowly enough for later keystrokes to interrupt it.
fn search(ctx: &TaskContext, prefix: &str) -> Result<Vec<String>, query_tasks::TaskError> {
    let mut matches = Vec::new();
    for (i, item) in CATALOGUE.iter().enumerate() {
        ctx.sleep(Duration::from_millis(5))?;
        if item.starts_with(prefix) {
            matches.push(item.to_string());
        }
        let done = (i + 1) as f64 / CATALOGUE.len() as f64;
        ctx.set_progress_with_caption(done, format!("Scanned {item}"))
            .map_err(anyhow::Error::from)?;
    }
    Ok(matches)
}
