// PERFNUM — ENGINE: RUNTIME MODULE
// Process-wide infrastructure shared by all three executables: the caught-
// signal flag, structured fatal exits, and the coordinator pid file.

use std::io;
use std::mem;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};

// ============================================================================
// FATAL EXIT + DIAGNOSTIC ERROR CODES
// ============================================================================

// Convention: 0x10-0x1F = Configuration, 0x20-0x2F = Resource acquisition

pub const E_USAGE: i32 = 0x10;
pub const E_BAD_LIMIT: i32 = 0x11;
pub const E_SHM_FAIL: i32 = 0x20;
pub const E_FIFO_FAIL: i32 = 0x21;
pub const E_SOCK_FAIL: i32 = 0x22;
pub const E_SPAWN_FAIL: i32 = 0x23;
pub const E_PIDFILE_FAIL: i32 = 0x24;
pub const E_KILL_FAIL: i32 = 0x25;

/// Structured fatal exit: fixed-format diagnostic line to stderr, then exit
/// with the code. Only for errors no loop can recover from; a signal-driven
/// shutdown is a *clean* exit and never comes through here.
pub fn fatal(code: i32, msg: &str) -> ! {
    eprintln!("[perfnum FATAL {:#04x}] {}", code, msg);
    std::process::exit(code);
}

// ============================================================================
// SIGNAL FLAG
// ============================================================================

/// The signal number most recently caught, 0 if none. Written only by the
/// handler; observed at every main-loop head.
static CAUGHT_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn record_signal(sig: i32) {
    CAUGHT_SIGNAL.store(sig, Ordering::Relaxed);
}

/// Install the shutdown handlers: SIGQUIT, SIGHUP, and SIGINT store their
/// number in the flag; SIGPIPE is ignored so writes to a vanished peer report
/// EPIPE instead of killing the process. Installed via sigaction with empty
/// flags — no SA_RESTART, so blocking reads and waits return EINTR and the
/// loops get to observe the flag.
pub fn install_signal_handlers() {
    // SAFETY: sigaction with a zeroed struct and a valid extern "C" handler that
    // only performs an atomic store, which is async-signal-safe per POSIX.
    unsafe {
        let mut act: libc::sigaction = mem::zeroed();
        act.sa_sigaction = record_signal as *const () as libc::sighandler_t;
        libc::sigemptyset(&mut act.sa_mask);
        for sig in [libc::SIGQUIT, libc::SIGHUP, libc::SIGINT] {
            if libc::sigaction(sig, &act, std::ptr::null_mut()) == -1 {
                eprintln!(
                    "[perfnum] could not install handler for signal {}: {}",
                    sig,
                    io::Error::last_os_error()
                );
            }
        }
        let mut ign: libc::sigaction = mem::zeroed();
        ign.sa_sigaction = libc::SIG_IGN;
        libc::sigemptyset(&mut ign.sa_mask);
        if libc::sigaction(libc::SIGPIPE, &ign, std::ptr::null_mut()) == -1 {
            eprintln!(
                "[perfnum] could not ignore SIGPIPE: {}",
                io::Error::last_os_error()
            );
        }
    }
}

/// True once any shutdown signal has been caught.
pub fn shutdown_requested() -> bool {
    CAUGHT_SIGNAL.load(Ordering::Relaxed) != 0
}

/// The caught signal number, 0 if none.
pub fn caught_signal() -> i32 {
    CAUGHT_SIGNAL.load(Ordering::Relaxed)
}

// ============================================================================
// PID FILE
// ============================================================================

/// Write this process's pid, ASCII decimal with no trailing newline, owner
/// read/write only. The reporter reads it back to know whom to signal.
pub fn write_pid_file(path: &Path) -> io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(std::process::id().to_string().as_bytes())
}

pub fn read_pid_file(path: &Path) -> io::Result<i32> {
    let text = std::fs::read_to_string(path)?;
    text.trim()
        .parse::<i32>()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "pid file is not a pid"))
}
