use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use copy_supervisor::supervisor::Scheduler;
use copy_supervisor::utils::config::{self, Config};
use copy_supervisor::utils::logging;

// Children are forked from this thread, so the runtime must not start others.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::load_config()?;

    logging::init_tracing(&config);

    info!("Starting copy supervisor v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Copying {} -> {} from list {}",
        config.source_dir.display(),
        config.dest_dir.display(),
        config.file_list.display()
    );

    let mut scheduler = Scheduler::init(&config);

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut more = signal(SignalKind::user_defined1())?;
    let mut fewer = signal(SignalKind::user_defined2())?;

    let mut rescan = interval(config.rescan_interval);
    rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tick = interval(config.tick_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = terminate.recv() => break,
            _ = interrupt.recv() => break,
            _ = hangup.recv() => {
                info!("Hangup received, re-reading file list");
                reconcile(&mut scheduler, &config);
            }
            _ = more.recv() => {
                let ceiling = scheduler.ceiling() + 1;
                scheduler.set_concurrency_ceiling(ceiling);
            }
            _ = fewer.recv() => {
                let ceiling = scheduler.ceiling().saturating_sub(1).max(1);
                scheduler.set_concurrency_ceiling(ceiling);
            }
            _ = rescan.tick() => reconcile(&mut scheduler, &config),
            _ = tick.tick() => tick_and_report(&mut scheduler),
        }
    }

    info!("Shutdown signal received");
    scheduler.shutdown();

    info!("Supervisor stopped");
    Ok(())
}

/// Advance every task once and log the resulting status. Errors are logged
/// so the loop always reaches `shutdown()`.
fn tick_and_report(scheduler: &mut Scheduler) {
    if let Err(e) = scheduler.tick() {
        error!("tick failed: {}", e);
    }
    match serde_json::to_string(&scheduler.snapshot()) {
        Ok(status) => debug!("status {}", status),
        Err(e) => warn!("cannot encode status: {}", e),
    }
}

/// Re-read the file list and create tasks for whatever is stale.
fn reconcile(scheduler: &mut Scheduler, config: &Config) {
    let files = match std::fs::read(&config.file_list) {
        Ok(files) => files,
        Err(e) => {
            error!(target: "user", "cannot read {}: {}", config.file_list.display(), e);
            return;
        }
    };

    match scheduler.reconcile(&config.source_dir, &config.dest_dir, &files) {
        Ok(0) => debug!("nothing to copy"),
        Ok(created) => info!(
            "{} new copies queued, {} jobs, {} running",
            created,
            scheduler.task_count(),
            scheduler.running_count()
        ),
        Err(e) => error!(target: "user", "cannot reconcile: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;
    use std::time::{Duration, Instant};

    #[test]
    fn list_with_bad_entry_still_drives_copies() {
        let root = tempfile::tempdir().unwrap();
        let config = Config {
            source_dir: root.path().join("src"),
            dest_dir: root.path().join("dst"),
            file_list: root.path().join("list"),
            ..Config::default()
        };
        std::fs::create_dir(&config.source_dir).unwrap();
        std::fs::create_dir(&config.dest_dir).unwrap();
        std::fs::write(config.source_dir.join("plain"), b"data").unwrap();
        std::fs::write(&config.file_list, b"\xff\xfe\nplain\n").unwrap();

        let mut scheduler = Scheduler::new(2);
        reconcile(&mut scheduler, &config);
        assert_eq!(scheduler.task_count(), 1);

        let deadline = Instant::now() + Duration::from_secs(10);
        while scheduler.task_count() > 0 {
            assert!(Instant::now() < deadline, "copy never finished");
            tick_and_report(&mut scheduler);
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(
            std::fs::read(config.dest_dir.join("plain")).unwrap(),
            b"data"
        );
        assert!(!config.dest_dir.join(OsStr::from_bytes(b"\xff\xfe")).exists());

        scheduler.shutdown();
        assert_eq!(scheduler.running_count(), 0);
    }
}
