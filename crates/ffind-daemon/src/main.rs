//! ffind-daemon: indexes one or more directory trees, keeps the index
//! synchronized through inotify, and serves queries over a local Unix
//! socket.

mod cli;
mod config;
mod lifecycle;
mod server;

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use ffind_index::{indexer, EntryStore, EventLoop, PersistentStore, RootSet, Watcher};

/// Effective settings after merging the config file and the command
/// line (command line wins).
struct Settings {
    foreground: bool,
    db: Option<PathBuf>,
}

fn main() {
    let args = cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .init();

    let file_config = config::load();
    if let Some(source) = &file_config.source {
        tracing::info!("loaded config from {}", source.display());
    }
    let settings = Settings {
        foreground: args.foreground || file_config.foreground.unwrap_or(false),
        db: args.db.clone().or(file_config.db),
    };

    if let Err(err) = run(&args.roots, &settings) {
        tracing::error!("{err:#}");
        std::process::exit(1);
    }
}

fn run(requested_roots: &[PathBuf], settings: &Settings) -> Result<()> {
    let roots = RootSet::resolve(requested_roots)?;

    let socket_path = lifecycle::socket_path();
    let pid_path = lifecycle::pid_file_path();

    if !settings.foreground {
        lifecycle::daemonize()?;
    }
    // After the fork so the PID file records the daemon, not the
    // launcher.
    lifecycle::register_cleanup_paths(&socket_path, &pid_path);
    lifecycle::claim_pid_file(&pid_path)?;
    lifecycle::install_signal_handlers()?;

    let persist = match &settings.db {
        Some(path) => {
            tracing::info!("enabling SQLite persistence: {}", path.display());
            Some(Arc::new(PersistentStore::open(path).with_context(|| {
                format!("failed to initialize database {}", path.display())
            })?))
        }
        None => None,
    };

    if roots.len() == 1 {
        tracing::info!("monitoring 1 root directory:");
    } else {
        tracing::info!("monitoring {} root directories:", roots.len());
    }
    for root in roots.iter() {
        tracing::info!("  - {root}");
    }

    let store = Arc::new(Mutex::new(EntryStore::new()));
    let roots = Arc::new(roots);
    let mut watcher = Watcher::new()?;
    let report_progress = settings.foreground;

    let prior_roots = persist.as_ref().map(|db| db.load_roots()).unwrap_or_default();
    if let Some(db) = &persist {
        db.save_roots(&roots);
    }

    let snapshot_usable = !prior_roots.is_empty() && roots.matches(&prior_roots);
    match (&persist, snapshot_usable) {
        (Some(db), true) => {
            let loaded = {
                let mut guard = lock(&store)?;
                db.load_entries(&mut guard)
            };
            tracing::info!("loaded {loaded} entries from database");
            let stats = {
                let mut guard = lock(&store)?;
                indexer::reconcile(&mut guard, Some(&mut watcher), &roots)
            };
            if stats.total() > 0 {
                db.note_changes(stats.total());
                tracing::info!(
                    "reconciliation: {} added, {} removed, {} updated",
                    stats.added,
                    stats.removed,
                    stats.updated,
                );
            }
        }
        _ => {
            if !prior_roots.is_empty() {
                tracing::warn!("root paths changed since last run; rebuilding index");
            }
            let stats = {
                let mut guard = lock(&store)?;
                indexer::walk_roots(&mut guard, Some(&mut watcher), &roots, report_progress)
            };
            if let Some(db) = &persist {
                db.note_changes(stats.total());
            }
        }
    }

    let listener = server::bind(&socket_path)?;
    lifecycle::publish_listener(&listener);

    let stop = Arc::new(AtomicBool::new(false));
    let event_loop = EventLoop::new(
        Arc::clone(&store),
        Arc::clone(&roots),
        watcher,
        persist.clone(),
        Arc::clone(&stop),
    );
    let event_thread = thread::Builder::new()
        .name("ffind-events".to_string())
        .spawn(move || event_loop.run())
        .context("failed to spawn event thread")?;

    let accept_thread = {
        let store = Arc::clone(&store);
        let roots = Arc::clone(&roots);
        thread::Builder::new()
            .name("ffind-accept".to_string())
            .spawn(move || server::run_accept_loop(listener, store, roots))
            .context("failed to spawn accept thread")?
    };

    while !lifecycle::shutdown_requested() {
        thread::sleep(Duration::from_millis(100));
    }
    tracing::info!("shutting down");

    stop.store(true, Ordering::SeqCst);
    if accept_thread.join().is_err() {
        tracing::warn!("accept thread panicked during shutdown");
    }
    if event_thread.join().is_err() {
        tracing::warn!("event thread panicked during shutdown");
    }

    if let Some(db) = &persist {
        tracing::info!("flushing {} changes to database...", db.pending());
        db.flush(&store);
    }
    let _ = std::fs::remove_file(&socket_path);
    lifecycle::remove_pid_file(&pid_path);
    tracing::info!("clean shutdown");
    Ok(())
}

fn lock(store: &Mutex<EntryStore>) -> Result<std::sync::MutexGuard<'_, EntryStore>> {
    store
        .lock()
        .map_err(|_| anyhow::anyhow!("store lock poisoned"))
}
