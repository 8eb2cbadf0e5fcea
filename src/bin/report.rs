// PERFNUM — REPORT
// The observer. Displays results found so far — a region snapshot (shmem) or
// a live record stream (pipes, sockets) — and, with -k, asks the coordinator
// to shut down instead. Never mutates shared state on the display path.

use std::io;
use std::path::Path;

use perfnum::engine::protocol::{recv_record, send_record, Record, Recv, Tag, PID_SERVER};
use perfnum::engine::runtime::{
    self, fatal, read_pid_file, E_FIFO_FAIL, E_KILL_FAIL, E_PIDFILE_FAIL, E_SHM_FAIL, E_SOCK_FAIL,
    E_USAGE,
};
use perfnum::ipc::pipes::{open_fifo_reader, FIFO_PATH, PID_FILE};
use perfnum::ipc::shmem::{ShmemRes, SHMEM_PATH};
use perfnum::ipc::sock::{connect_to, SERVER_PORT};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        usage();
    }

    runtime::install_signal_handlers();

    let kill = args.iter().any(|a| a == "-k");

    match args[1].chars().next() {
        Some('m') => shmem_report(kill),
        Some('p') => pipe_report(kill),
        Some('s') => {
            let host = match args.iter().skip(2).find(|a| *a != "-k") {
                Some(host) => host,
                None => usage(),
            };
            sock_report(host, kill);
        }
        _ => usage(),
    }
}

// ============================================================================
// SHMEM REPORTER
// ============================================================================

fn shmem_report(kill: bool) {
    let res = match ShmemRes::mount(SHMEM_PATH) {
        Ok(res) => res,
        Err(e) => fatal(E_SHM_FAIL, &format!("{}", e)),
    };

    if kill {
        quit_pid(res.manage_pid());
        return;
    }

    for n in res.results() {
        println!("{}", n);
    }
    for (pid, found, tested) in res.roster() {
        println!("compute({}): tested {}, found {}", pid, tested, found);
    }
    let tested = res.total_tested();
    println!("{} tested, {} remaining", tested, res.limit() as i64 - tested);
    match res.next_unclaimed() {
        Some(n) => println!("Next untested integer: {}", n),
        None => println!("Testing complete"),
    }
}

// ============================================================================
// PIPES REPORTER
// ============================================================================

fn pipe_report(kill: bool) {
    let manage_pid = match read_pid_file(Path::new(PID_FILE)) {
        Ok(pid) => pid,
        Err(e) => fatal(E_PIDFILE_FAIL, &format!("could not read pid file: {}", e)),
    };

    if kill {
        quit_pid(manage_pid);
        return;
    }

    let fd = match open_fifo_reader(Path::new(FIFO_PATH)) {
        Ok(fd) => fd,
        Err(e) => fatal(E_FIFO_FAIL, &format!("could not open FIFO: {}", e)),
    };
    stream_records(fd, manage_pid);
    // SAFETY: fd is the FIFO read end opened above.
    unsafe { libc::close(fd) };
}

// ============================================================================
// SOCKET REPORTER
// ============================================================================

fn sock_report(host: &str, kill: bool) {
    let fd = match connect_to(host, SERVER_PORT) {
        Ok(fd) => fd,
        Err(e) => fatal(E_SOCK_FAIL, &format!("could not connect to server: {}", e)),
    };

    if kill {
        if let Err(e) = send_record(fd, &Record::kill()) {
            eprintln!("[report] could not send record: {}", e);
        }
        // SAFETY: fd is this reporter's socket, closed exactly once.
        unsafe { libc::close(fd) };
        return;
    }

    if let Err(e) = send_record(fd, &Record::notify()) {
        fatal(E_SOCK_FAIL, &format!("could not subscribe: {}", e));
    }
    match recv_record(fd) {
        Ok(Recv::Record(rec)) if rec.kind() == Tag::Accept => {
            stream_records(fd, PID_SERVER);
        }
        Ok(Recv::Record(rec)) if rec.kind() == Tag::Refuse => {
            println!("Another reporter is already registered");
        }
        Ok(Recv::Record(rec)) => {
            eprintln!("[report] unexpected record: {:#04x}", rec.tag);
        }
        Ok(Recv::Closed) => {
            eprintln!("[report] server closed the connection");
        }
        Err(e) => {
            eprintln!("[report] could not read record: {}", e);
        }
    }
    // SAFETY: fd is this reporter's socket, closed exactly once.
    unsafe { libc::close(fd) };
}

// ============================================================================
// DISPLAY LOOP (pipes + sockets)
// ============================================================================

/// Print the record stream until a terminal record arrives. `coordinator_pid`
/// identifies the coordinator's own CLOSED (a shutdown); any other CLOSED is
/// a worker death — results may be lost, but the stream continues.
fn stream_records(fd: i32, coordinator_pid: i32) {
    loop {
        let rec = match recv_record(fd) {
            Ok(Recv::Record(rec)) => rec,
            Ok(Recv::Closed) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                if runtime::shutdown_requested() {
                    break;
                }
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                eprintln!("[report] unrecognized record: {}", e);
                continue;
            }
            Err(e) => {
                eprintln!("[report] could not read record: {}", e);
                break;
            }
        };

        match rec.kind() {
            Tag::Perfnum => println!("{}", rec.value()),
            Tag::Done => {
                println!("Computation complete");
                break;
            }
            Tag::Closed if rec.pid() == coordinator_pid => {
                println!("Manage was shut down before execution could complete");
                break;
            }
            Tag::Closed => {
                println!("A compute process exited prematurely; some results may have been lost");
            }
            _ => {
                eprintln!("[report] unexpected record: {:#04x}", rec.tag);
            }
        }
    }
}

fn quit_pid(pid: i32) {
    // SAFETY: pid was read from the coordinator's own header or pid file;
    // kill with SIGQUIT is safe for any pid value.
    if unsafe { libc::kill(pid, libc::SIGQUIT) } == -1 {
        fatal(
            E_KILL_FAIL,
            &format!("could not signal manage ({}): {}", pid, io::Error::last_os_error()),
        );
    }
}

fn usage() -> ! {
    println!("Usage: report [mps] [<server-ip>] [-k]");
    println!();
    println!("Modes:");
    println!("    m - shared memory");
    println!("        usage: report m [-k]");
    println!();
    println!("    p - pipes");
    println!("        usage: report p [-k]");
    println!();
    println!("    s - sockets");
    println!("        usage: report s <server-ip> [-k]");
    println!();
    println!("    -k  ask manage to shut down instead of displaying");
    println!();
    std::process::exit(E_USAGE);
}
