//! Single-instance guard, daemonization, and signal discipline.
//!
//! Signal handlers touch nothing but atomics, pre-initialized
//! `CString`s, and raw syscalls: shutdown signals set a flag and shut
//! down the listening socket so `accept` unblocks; fatal signals
//! unlink the socket and PID files and re-raise the default
//! disposition for the core dump. Everything else happens on ordinary
//! threads once the flag is observed.

use std::ffi::CString;
use std::fs;
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::OnceLock;

use anyhow::{bail, Result};

/// Expected `/proc/<pid>/comm` name of a live peer.
const DAEMON_NAME: &str = "ffind-daemon";

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static LISTENER_FD: AtomicI32 = AtomicI32::new(-1);
static SOCKET_PATH_C: OnceLock<CString> = OnceLock::new();
static PID_PATH_C: OnceLock<CString> = OnceLock::new();

pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

fn uid() -> u32 {
    unsafe { libc::getuid() }
}

pub fn socket_path() -> PathBuf {
    PathBuf::from(format!("/run/user/{}/ffind.sock", uid()))
}

pub fn pid_file_path() -> PathBuf {
    if uid() == 0 {
        PathBuf::from("/run/ffind-daemon.pid")
    } else {
        PathBuf::from(format!("/run/user/{}/ffind-daemon.pid", uid()))
    }
}

/// Records the paths the fatal-signal handler may unlink. Must run
/// before [`install_signal_handlers`].
pub fn register_cleanup_paths(socket: &Path, pid_file: &Path) {
    if let Ok(cstr) = CString::new(socket.as_os_str().as_bytes()) {
        let _ = SOCKET_PATH_C.set(cstr);
    }
    if let Ok(cstr) = CString::new(pid_file.as_os_str().as_bytes()) {
        let _ = PID_PATH_C.set(cstr);
    }
}

/// Publishes the listening descriptor so the shutdown handler can
/// unblock `accept`.
pub fn publish_listener(listener: &UnixListener) {
    LISTENER_FD.store(listener.as_raw_fd(), Ordering::SeqCst);
}

extern "C" fn on_shutdown_signal(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
    let fd = LISTENER_FD.swap(-1, Ordering::SeqCst);
    if fd >= 0 {
        unsafe {
            libc::shutdown(fd, libc::SHUT_RDWR);
        }
    }
}

extern "C" fn on_fatal_signal(signal: libc::c_int) {
    if let Some(path) = SOCKET_PATH_C.get() {
        unsafe {
            libc::unlink(path.as_ptr());
        }
    }
    if let Some(path) = PID_PATH_C.get() {
        unsafe {
            libc::unlink(path.as_ptr());
        }
    }
    unsafe {
        libc::signal(signal, libc::SIG_DFL);
        libc::raise(signal);
    }
}

pub fn install_signal_handlers() -> Result<()> {
    for signal in [libc::SIGINT, libc::SIGTERM, libc::SIGQUIT, libc::SIGHUP] {
        install(signal, on_shutdown_signal as usize)?;
    }
    for signal in [libc::SIGSEGV, libc::SIGABRT, libc::SIGBUS] {
        install(signal, on_fatal_signal as usize)?;
    }
    Ok(())
}

fn install(signal: libc::c_int, handler: usize) -> Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;
        if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
            bail!(
                "sigaction({signal}) failed: {}",
                io::Error::last_os_error()
            );
        }
    }
    Ok(())
}

/// Detaches from the controlling terminal: double fork, new session,
/// stdio redirected to /dev/null.
pub fn daemonize() -> Result<()> {
    match unsafe { libc::fork() } {
        -1 => bail!("fork failed: {}", io::Error::last_os_error()),
        0 => {}
        _ => std::process::exit(0),
    }
    if unsafe { libc::setsid() } == -1 {
        bail!("setsid failed: {}", io::Error::last_os_error());
    }
    match unsafe { libc::fork() } {
        -1 => bail!("second fork failed: {}", io::Error::last_os_error()),
        0 => {}
        _ => std::process::exit(0),
    }
    unsafe {
        let null = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR);
        if null >= 0 {
            libc::dup2(null, 0);
            libc::dup2(null, 1);
            libc::dup2(null, 2);
            if null > 2 {
                libc::close(null);
            }
        }
    }
    Ok(())
}

/// Claims the single-instance PID file. A healthy peer is fatal; a
/// stale or unreadable file is removed and retried; any other obstacle
/// degrades to running without one.
pub fn claim_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    match write_pid_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => match read_pid(path) {
            Some(pid) if process_is_peer(pid) => {
                bail!("daemon already running (PID: {pid})")
            }
            Some(pid) => {
                tracing::warn!("removing stale PID file (PID {pid} not running)");
                replace_pid_file(path);
                Ok(())
            }
            None => {
                tracing::warn!("removing invalid PID file {}", path.display());
                replace_pid_file(path);
                Ok(())
            }
        },
        Err(err) => {
            tracing::warn!("could not create PID file {}: {err}", path.display());
            Ok(())
        }
    }
}

fn replace_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
    if let Err(err) = write_pid_file(path) {
        tracing::warn!("could not recreate PID file {}: {err}", path.display());
    }
}

fn write_pid_file(path: &Path) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    writeln!(file, "{}", std::process::id())
}

fn read_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Whether `pid` is a live process that really is an ffind-daemon.
/// Process-table absence or a different `/proc/<pid>/comm` name means
/// the PID file is stale.
pub fn process_is_peer(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } != 0 {
        return false;
    }
    match fs::read_to_string(format!("/proc/{pid}/comm")) {
        Ok(comm) => comm.trim_end() == DAEMON_NAME,
        // Cannot verify the name; assume it is live.
        Err(_) => true,
    }
}

pub fn remove_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}
