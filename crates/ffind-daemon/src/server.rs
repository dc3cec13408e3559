//! The local query socket.
//!
//! One accept thread, one detached thread per connection. A connection
//! carries a single request and is closed after the response streams
//! out. Protocol violations get one error line; transport failures
//! just close.

use std::fs;
use std::io::{self, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use ffind_index::{read_request, run_query, EntryStore, RootSet};

use crate::lifecycle;

/// Binds the listening socket, unlinking any previous one first.
pub fn bind(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!("could not remove old socket {}: {err}", path.display()),
    }
    UnixListener::bind(path).with_context(|| format!("cannot bind {}", path.display()))
}

/// Serves connections until shutdown. The signal handler shuts the
/// listener down, which pops `accept` with an error and ends the loop.
pub fn run_accept_loop(
    listener: UnixListener,
    store: Arc<Mutex<EntryStore>>,
    roots: Arc<RootSet>,
) {
    loop {
        if lifecycle::shutdown_requested() {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let store = Arc::clone(&store);
                let roots = Arc::clone(&roots);
                thread::spawn(move || handle_client(stream, &store, &roots));
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                if lifecycle::shutdown_requested() {
                    break;
                }
                tracing::warn!("accept failed: {err}");
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn handle_client(mut stream: UnixStream, store: &Mutex<EntryStore>, roots: &RootSet) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            if let Some(line) = err.client_line() {
                let _ = stream.write_all(format!("{line}\n").as_bytes());
            }
            return;
        }
    };
    run_query(&request, store, roots, stream);
}
