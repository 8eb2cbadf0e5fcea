// PERFNUM — COMPUTE
// The worker. Tests candidates with the shared predicate; where the
// candidates come from and where results go depends on the method: a
// pre-assigned range on stdout (pipes), self-claimed bits in the shared
// region (shmem), or on-demand range grants over TCP (sockets).

use std::io;

use perfnum::engine::perfect::is_perfect;
use perfnum::engine::protocol::{recv_record, send_record, Record, Recv, Tag, PID_CLIENT};
use perfnum::engine::runtime::{self, fatal, E_SHM_FAIL, E_SOCK_FAIL, E_USAGE};
use perfnum::ipc::shmem::{ShmemRes, SHMEM_PATH};
use perfnum::ipc::sock::{connect_to, SERVER_PORT};

use std::sync::atomic::Ordering;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        usage();
    }

    runtime::install_signal_handlers();

    match args[1].chars().next() {
        Some('p') => {
            if args.len() < 4 {
                usage();
            }
            let start: u32 = args[2].parse().unwrap_or_else(|_| usage());
            let end: u32 = args[3].parse().unwrap_or_else(|_| usage());
            pipe_loop(start, end);
        }
        Some('m') => shmem_loop(),
        Some('s') => {
            if args.len() < 3 {
                usage();
            }
            sock_loop(&args[2]);
        }
        _ => usage(),
    }
}

// ============================================================================
// PIPES WORKER
// ============================================================================

/// Test [start, end] in order, reporting on stdout — the coordinator wired
/// fd 1 to its pipe before exec. DONE on exhaustion, CLOSED on a signal.
fn pipe_loop(start: u32, end: u32) {
    let pid = std::process::id() as i32;
    let out = libc::STDOUT_FILENO;

    for n in start..=end {
        if runtime::shutdown_requested() {
            send_or_warn(out, &Record::closed(pid));
            return;
        }
        if is_perfect(n) {
            send_or_warn(out, &Record::perfnum(n as i32));
        }
    }
    send_or_warn(out, &Record::done(pid));
}

// ============================================================================
// SHMEM WORKER
// ============================================================================

/// Mount the region, take a roster slot, and claim candidates until none
/// remain or a signal arrives. The slot is returned on the way out; the
/// counters stay behind for the reporter's totals.
fn shmem_loop() {
    let res = match ShmemRes::mount(SHMEM_PATH) {
        Ok(res) => res,
        Err(e) => fatal(E_SHM_FAIL, &format!("{}", e)),
    };
    let slot_idx = match res.roster_insert(std::process::id() as i32) {
        Some(idx) => idx,
        None => fatal(E_SHM_FAIL, "no free roster slot"),
    };
    let slot = res.roster_slot(slot_idx);

    while let Some(n) = res.claim_next() {
        if is_perfect(n) {
            slot.found.fetch_add(1, Ordering::Relaxed);
            if !res.record_perfnum(n as i32) {
                eprintln!("[compute] result table full, dropping {}", n);
            }
        }
        slot.tested.fetch_add(1, Ordering::Relaxed);

        if runtime::shutdown_requested() {
            break;
        }
    }

    res.roster_clear(slot_idx);
}

// ============================================================================
// SOCKET WORKER
// ============================================================================

/// Connect and ask for work with DONE; DONE doubles as "finished my range,
/// more please". REFUSE or a server CLOSED ends the run; a signal mid-range
/// announces CLOSED before exiting.
fn sock_loop(host: &str) {
    let fd = match connect_to(host, SERVER_PORT) {
        Ok(fd) => fd,
        Err(e) => fatal(E_SOCK_FAIL, &format!("could not connect to server: {}", e)),
    };

    send_or_warn(fd, &Record::done(std::process::id() as i32));

    loop {
        let rec = match recv_record(fd) {
            Ok(Recv::Record(rec)) => rec,
            Ok(Recv::Closed) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                if runtime::shutdown_requested() {
                    send_or_warn(fd, &Record::closed(PID_CLIENT));
                    break;
                }
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                eprintln!("[compute] unrecognized record: {}", e);
                continue;
            }
            Err(e) => {
                eprintln!("[compute] could not read record: {}", e);
                break;
            }
        };

        match rec.kind() {
            Tag::Range => {
                for n in rec.start()..=rec.end() {
                    if runtime::shutdown_requested() {
                        send_or_warn(fd, &Record::closed(PID_CLIENT));
                        // SAFETY: fd is this worker's socket, closed exactly once.
                        unsafe { libc::close(fd) };
                        return;
                    }
                    if n > 0 && is_perfect(n as u32) {
                        send_or_warn(fd, &Record::perfnum(n));
                    }
                }
                send_or_warn(fd, &Record::done(std::process::id() as i32));
            }
            Tag::Refuse => break,  // no work remains
            Tag::Closed => break,  // server terminated
            _ => {
                eprintln!("[compute] unexpected record: {:#04x}", rec.tag);
            }
        }
    }

    // SAFETY: fd is this worker's socket, closed exactly once.
    unsafe { libc::close(fd) };
}

fn send_or_warn(fd: i32, rec: &Record) {
    if let Err(e) = send_record(fd, rec) {
        if e.kind() != io::ErrorKind::BrokenPipe {
            eprintln!("[compute] could not send record: {}", e);
        }
    }
}

fn usage() -> ! {
    println!("Usage: compute [mps] ...");
    println!();
    println!("Modes:");
    println!("    m - shared memory");
    println!("        usage: compute m");
    println!();
    println!("    p - pipes (spawned by manage with stdout wired to its pipe)");
    println!("        usage: compute p <start> <end>");
    println!();
    println!("    s - sockets");
    println!("        usage: compute s <server-ip>");
    println!();
    std::process::exit(E_USAGE);
}
