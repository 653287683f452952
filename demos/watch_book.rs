//! Example: watching a book pipeline and a translation job
//!
//! Subscribes to one book pipeline over its dedicated channel and one
//! translation job over the shared channel, then logs every snapshot
//! change, connectivity change and refetch request for a while.
//!
//! Run with: cargo run --example watch_book -- ws://localhost:8000/ 42 job-7

use progress_sync::{SyncConfig, SyncController, SyncEvent, TrackedEntity};
use tokio::time::{sleep, Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,progress_sync=debug")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let base_url = args.next().unwrap_or_else(|| "ws://localhost:8000/".to_string());
    let book_id = args.next().unwrap_or_else(|| "1".to_string());
    let job_id = args.next().unwrap_or_else(|| "1".to_string());

    let config = SyncConfig::builder().base_url(base_url).build()?;
    let controller = SyncController::with_websocket(config);
    let mut events = controller.events();

    let book_entity = TrackedEntity::book_v1(book_id.clone());
    let job_entity = TrackedEntity::translation(job_id.clone());
    let mut book = controller.subscribe(book_entity.clone());
    let mut job = controller.subscribe(job_entity.clone());
    info!("Watching book {} and translation job {}", book_id, job_id);

    let deadline = sleep(Duration::from_secs(120));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            Ok(()) = book.changed() => {
                let snapshot = book.borrow_and_update().clone();
                info!(
                    "book {}: {} {:.0}% agent={:?} counters={:?}",
                    book_id,
                    snapshot.status,
                    snapshot.progress_percent,
                    snapshot.current_agent,
                    snapshot.per_stage_counters
                );
            }
            Ok(()) = job.changed() => {
                let snapshot = job.borrow_and_update().clone();
                info!(
                    "job {}: {} {:.0}% stage={:?}",
                    job_id, snapshot.status, snapshot.progress_percent, snapshot.stage_label
                );
            }
            event = events.recv() => match event {
                Ok(SyncEvent::Connectivity { entity, status }) => {
                    info!("connectivity {:?}: {:?}", entity, status);
                    if status.should_poll() {
                        warn!("Push delivery gave up; a real client would start polling now");
                    }
                }
                Ok(SyncEvent::RefetchRequired { entity }) => {
                    info!("{:?} {} needs a full refetch", entity.kind, entity.id);
                }
                Ok(SyncEvent::Server { name, .. }) => info!("server event: {}", name),
                Err(e) => warn!("event stream: {}", e),
            },
            _ = &mut deadline => break,
        }
    }

    // Print final metrics
    let snapshot = controller.metrics().snapshot();
    info!("Final metrics:");
    info!("  Connections: {}", snapshot.connections_total);
    info!("  Reconnect attempts: {}", snapshot.reconnect_attempts_total);
    info!("  Frames received: {}", snapshot.frames_received_total);
    info!("  Fallbacks: {}", snapshot.fallbacks_total);

    controller.unsubscribe(&book_entity);
    controller.unsubscribe(&job_entity);
    controller.shutdown();
    info!("Stopped");

    Ok(())
}
