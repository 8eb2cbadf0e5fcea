// PERFNUM — MANAGE
// The coordinator. Owns every lifecycle: spawns and reaps workers (pipes),
// creates and tears down the shared region (shmem), or serves work ranges
// and the notify subscription over TCP (sockets).

use std::io;
use std::path::Path;
use std::time::Duration;

use perfnum::engine::protocol::{recv_record, send_record, Record, Recv, Tag};
use perfnum::engine::runtime::{
    self, fatal, E_BAD_LIMIT, E_FIFO_FAIL, E_PIDFILE_FAIL, E_SHM_FAIL, E_SOCK_FAIL, E_SPAWN_FAIL,
    E_USAGE,
};
use perfnum::ipc::pipes::{
    kill_and_reap, make_fifo, open_fifo_writer, reap_one, spawn_computes, unlink_path,
    ComputeProc, COMPUTE_CMD, FIFO_PATH, PID_FILE, REAP_WINDOW,
};
use perfnum::ipc::shmem::{ShmemRes, SHMEM_PATH};
use perfnum::ipc::sock::{listen_on, SockServer, SERVER_PORT};

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
            let limit = parse_limit(&args[2]);
            let nprocs: u32 = match args[3].parse() {
                Ok(n) if n > 0 => n,
                _ => fatal(E_USAGE, "nprocs must be a positive integer"),
            };
            pipe_run(limit, nprocs);
        }
        Some('m') => {
            if args.len() < 3 {
                usage();
            }
            shmem_run(parse_limit(&args[2]));
        }
        Some('s') => {
            if args.len() < 3 {
                usage();
            }
            sock_run(parse_limit(&args[2]));
        }
        _ => usage(),
    }
}

fn parse_limit(arg: &str) -> u32 {
    match arg.parse::<u32>() {
        Ok(n) if n > 0 && n <= i32::MAX as u32 => n,
        _ => fatal(E_BAD_LIMIT, "limit must be a positive integer"),
    }
}

// ============================================================================
// PIPES COORDINATOR
// ============================================================================

struct PipeRes {
    procs: Vec<ComputeProc>,
    compute_pipe: i32,
    report_fifo: i32,
    perfnums: Vec<i32>,
}

fn pipe_run(limit: u32, nprocs: u32) {
    let (procs, compute_pipe) = match spawn_computes(COMPUTE_CMD, limit, nprocs) {
        Ok(spawned) => spawned,
        Err(e) => fatal(E_SPAWN_FAIL, &format!("could not spawn computes: {}", e)),
    };
    let mut res = PipeRes { procs, compute_pipe, report_fifo: -1, perfnums: Vec::new() };

    if let Err(e) = runtime::write_pid_file(Path::new(PID_FILE)) {
        kill_and_reap(&mut res.procs, REAP_WINDOW);
        fatal(E_PIDFILE_FAIL, &format!("could not create pid file: {}", e));
    }

    if let Err(e) = make_fifo(Path::new(FIFO_PATH)) {
        kill_and_reap(&mut res.procs, REAP_WINDOW);
        unlink_path(Path::new(PID_FILE));
        fatal(E_FIFO_FAIL, &format!("could not make FIFO: {}", e));
    }

    // Blocks until the reporter opens its end; a shutdown signal interrupts.
    res.report_fifo = match open_fifo_writer(Path::new(FIFO_PATH)) {
        Ok(fd) => fd,
        Err(e) => {
            if e.kind() != io::ErrorKind::Interrupted {
                eprintln!("[manage] could not open FIFO: {}", e);
            }
            unlink_path(Path::new(FIFO_PATH));
            unlink_path(Path::new(PID_FILE));
            kill_and_reap(&mut res.procs, REAP_WINDOW);
            let code = if e.kind() == io::ErrorKind::Interrupted { 0 } else { E_FIFO_FAIL };
            std::process::exit(code);
        }
    };

    pipe_loop(&mut res, nprocs);
    pipe_cleanup(&mut res);
}

/// Drain the compute pipe until every worker has exited, a signal arrives,
/// or the reporter disappears.
fn pipe_loop(res: &mut PipeRes, nprocs: u32) {
    let mut exited = 0u32;
    loop {
        if runtime::shutdown_requested() {
            break;
        }

        let rec = match recv_record(res.compute_pipe) {
            Ok(Recv::Record(rec)) => rec,
            Ok(Recv::Closed) => {
                // Every write end is gone; any DONE/CLOSED already arrived.
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(5));
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                eprintln!("[manage] unrecognized record: {}", e);
                continue;
            }
            Err(e) => {
                eprintln!("[manage] could not read record: {}", e);
                continue;
            }
        };

        match rec.kind() {
            Tag::Perfnum => {
                res.perfnums.push(rec.value());
                if let Err(e) = send_record(res.report_fifo, &rec) {
                    if e.kind() == io::ErrorKind::BrokenPipe {
                        eprintln!("[manage] reporting process disconnected");
                        break;
                    }
                    eprintln!("[manage] could not send record: {}", e);
                }
            }
            Tag::Closed => {
                // Worker died mid-range: tell the reporter, then reap it like
                // a normal exit.
                if let Err(e) = send_record(res.report_fifo, &rec) {
                    if e.kind() != io::ErrorKind::BrokenPipe {
                        eprintln!("[manage] could not send record: {}", e);
                    }
                }
                if reap_one(&mut res.procs, rec.pid()) {
                    exited += 1;
                }
                if exited == nprocs {
                    break;
                }
            }
            Tag::Done => {
                if reap_one(&mut res.procs, rec.pid()) {
                    exited += 1;
                }
                if exited == nprocs {
                    break;
                }
            }
            Tag::Null | Tag::Range => {
                eprintln!("[manage] invalid record: {:#04x}", rec.tag);
            }
            _ => {
                eprintln!("[manage] unexpected record: {:#04x}", rec.tag);
            }
        }
    }
}

fn pipe_cleanup(res: &mut PipeRes) {
    // Tell the reporter whether this is completion or a signalled shutdown.
    let farewell = if runtime::shutdown_requested() {
        Record::closed(std::process::id() as i32)
    } else {
        Record::done(std::process::id() as i32)
    };
    if let Err(e) = send_record(res.report_fifo, &farewell) {
        if e.kind() != io::ErrorKind::BrokenPipe {
            eprintln!("[manage] could not send record: {}", e);
        }
    }

    // SAFETY: both fds are open resources of this coordinator, closed once.
    unsafe {
        libc::close(res.compute_pipe);
        libc::close(res.report_fifo);
    }
    unlink_path(Path::new(FIFO_PATH));

    kill_and_reap(&mut res.procs, REAP_WINDOW);
    unlink_path(Path::new(PID_FILE));
}

// ============================================================================
// SHMEM COORDINATOR
// ============================================================================

fn shmem_run(limit: u32) {
    let res = match ShmemRes::create(SHMEM_PATH, limit as i32) {
        Ok(res) => res,
        Err(e) => fatal(E_SHM_FAIL, &format!("{}", e)),
    };

    // Workers pull work themselves; the coordinator just holds the region
    // open until it is told to shut down.
    while !runtime::shutdown_requested() {
        std::thread::sleep(Duration::from_millis(50));
    }

    res.teardown();
    if let Err(e) = ShmemRes::unlink(SHMEM_PATH) {
        eprintln!("[manage] {}", e);
    }
}

// ============================================================================
// SOCKET COORDINATOR
// ============================================================================

fn sock_run(limit: u32) {
    let listen_fd = match listen_on(SERVER_PORT) {
        Ok(fd) => fd,
        Err(e) => fatal(E_SOCK_FAIL, &format!("could not bind server socket: {}", e)),
    };
    let mut server = SockServer::new(listen_fd, limit as i32);
    server.run();
    server.cleanup();
}

fn usage() -> ! {
    println!("Usage: manage [mps] <limit> <nprocs>");
    println!();
    println!("Modes:");
    println!("    m - shared memory");
    println!("        usage: manage m <limit>");
    println!();
    println!("        limit:      largest number to test");
    println!();
    println!("    p - pipes");
    println!("        usage: manage p <limit> <nprocs>");
    println!();
    println!("        limit:      largest number to test");
    println!("        nprocs:     number of compute processes to spawn");
    println!();
    println!("    s - sockets");
    println!("        usage: manage s <limit>");
    println!();
    println!("        limit:      largest number to test");
    println!();
    std::process::exit(E_USAGE);
}
