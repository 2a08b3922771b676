use anyhow::Result;
use chrono::Utc;
use serde_json::Value;

use ccr_offline_core::{
    HttpBackend, OfflineContext, Outcome, QuarantineReason, SyncOutcome, SyncStatus,
};

use crate::Command;

pub async fn run(ctx: &OfflineContext, backend: &HttpBackend, command: Command) -> Result<()> {
    match command {
        Command::Status => print_status(&ctx.status().await),
        Command::Queue => list_queue(ctx).await,
        Command::Enqueue { action, payload } => {
            let id = ctx.queue().enqueue(&action, payload).await?;
            println!("Queued {} as {}", action, id);
        }
        Command::Sync => sync(ctx).await?,
        Command::Get { path } => get(ctx, backend, &path).await?,
        Command::CacheInfo => {
            let info = ctx.cache().storage_info().await?;
            println!("Entries:  {}", info.entries);
            println!("Expired:  {}", info.expired);
            println!("Size:     {}", format_bytes(info.bytes));
        }
        Command::CacheClear => {
            let removed = ctx.cache().clear_all().await?;
            println!("Removed {} cache entries", removed);
        }
        Command::Purge => {
            let removed = ctx.cache().purge_expired().await?;
            println!("Purged {} expired entries", removed);
        }
        Command::QueueClear => {
            let removed = ctx.queue().clear().await?;
            println!("Dropped {} queued mutations", removed);
        }
    }
    Ok(())
}

fn print_status(status: &SyncStatus) {
    println!("Online:    {}", if status.is_online { "yes" } else { "no" });
    println!("Syncing:   {}", if status.is_syncing { "yes" } else { "no" });
    println!("Pending:   {}", status.pending);
    match status.last_sync_at {
        Some(at) => println!("Last sync: {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("Last sync: never"),
    }
}

async fn list_queue(ctx: &OfflineContext) {
    let items = ctx.queue().list().await;
    if items.is_empty() {
        println!("Queue is empty");
        return;
    }

    let now = Utc::now();
    for item in items {
        let age = (now - item.enqueued_at).num_minutes().max(0);
        print!(
            "{}  {:<20} retries={} queued {}m ago",
            item.id, item.action, item.retries, age
        );
        match item.last_error {
            Some(ref error) => println!("  last error: {}", error),
            None => println!(),
        }
    }
}

async fn sync(ctx: &OfflineContext) -> Result<()> {
    let mut failures = ctx.engine().subscribe_failures();

    match ctx.engine().sync().await? {
        SyncOutcome::Completed(report) => {
            println!(
                "Replayed {} of {}: {} deferred, {} quarantined, {} still queued",
                report.succeeded,
                report.attempted,
                report.deferred,
                report.quarantined,
                report.remaining
            );
            if report.halted {
                println!("Stopped at the first deferred item (strict ordering)");
            }
        }
        SyncOutcome::AlreadySyncing => println!("A sync is already running"),
        SyncOutcome::Offline => println!("Offline, nothing replayed"),
    }

    while let Ok(failure) = failures.try_recv() {
        let reason = match failure.reason {
            QuarantineReason::Rejected => "rejected",
            QuarantineReason::RetriesExhausted => "gave up after retries",
        };
        eprintln!(
            "  {} {} {}: {}",
            failure.item.id, failure.item.action, reason, failure.error
        );
    }
    Ok(())
}

async fn get(ctx: &OfflineContext, backend: &HttpBackend, path: &str) -> Result<()> {
    let outcome = ctx
        .client()
        .fetch::<Value, _, _>(path, None, || backend.fetch(path))
        .await?;

    if let Outcome::StaleFallback { written_at, .. } = &outcome {
        let minutes = (Utc::now() - *written_at).num_minutes().max(0);
        eprintln!("Backend unreachable, showing cached copy from {}m ago", minutes);
    }
    if let Some(data) = outcome.into_data() {
        println!("{}", serde_json::to_string_pretty(&data)?);
    }
    Ok(())
}

/// Format bytes as human-readable size
fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024 + 512 * 1024), "3.5 MB");
    }
}
