// PERFNUM — IPC: PIPE PIPELINE
// The pipes method: one anonymous pipe multiplexing every worker's stdout
// into the coordinator, and a named FIFO from the coordinator to the
// reporter. Ranges are pre-partitioned at spawn; workers never ask for more.

use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::engine::perfect::partition;

/// Path of the coordinator-to-reporter FIFO, in the working directory.
pub const FIFO_PATH: &str = ".perfect_numbers";

/// Path of the coordinator pid file, in the working directory.
pub const PID_FILE: &str = "manage.pid";

/// Path of the worker executable the coordinator spawns.
pub const COMPUTE_CMD: &str = "./compute";

/// How long shutdown waits for signalled workers before giving up on them.
pub const REAP_WINDOW: Duration = Duration::from_secs(5);

/// A spawned worker and its liveness as the coordinator understands it.
pub struct ComputeProc {
    pub pid: i32,
    pub child: Child,
    pub alive: bool,
}

/// Pre-partition [1, limit] among nprocs workers and spawn them, each with
/// its stdout redirected to the shared pipe's write end. Returns the workers
/// and the pipe's read end, already set non-blocking. On any spawn failure
/// the already-started workers are killed and reaped before the error is
/// returned.
pub fn spawn_computes(
    cmd: &str,
    limit: u32,
    nprocs: u32,
) -> io::Result<(Vec<ComputeProc>, RawFd)> {
    let mut fds = [0i32; 2];
    // SAFETY: fds is a valid 2-element array for pipe() to fill.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);

    let mut procs: Vec<ComputeProc> = Vec::with_capacity(nprocs as usize);
    for (start, end) in partition(limit, nprocs) {
        // SAFETY: write_fd is the open pipe write end; dup gives the child its
        // own descriptor, consumed by Stdio.
        let child_fd = unsafe { libc::dup(write_fd) };
        if child_fd == -1 {
            let err = io::Error::last_os_error();
            abort_spawn(&mut procs, read_fd, write_fd);
            return Err(err);
        }
        // SAFETY: child_fd is a freshly duped fd owned by this Stdio alone.
        let stdout = unsafe { Stdio::from_raw_fd(child_fd) };
        match Command::new(cmd)
            .arg("p")
            .arg(start.to_string())
            .arg(end.to_string())
            .stdout(stdout)
            .spawn()
        {
            Ok(child) => {
                let pid = child.id() as i32;
                procs.push(ComputeProc { pid, child, alive: true });
            }
            Err(err) => {
                abort_spawn(&mut procs, read_fd, write_fd);
                return Err(err);
            }
        }
    }

    // All children hold their own write ends now; drop the parent's so the
    // pipe reports EOF once the last worker exits.
    // SAFETY: write_fd is open and not used again.
    unsafe { libc::close(write_fd) };

    // SAFETY: fcntl on the open read end, restoring flags read from F_GETFL.
    unsafe {
        let flags = libc::fcntl(read_fd, libc::F_GETFL, 0);
        let flags = if flags == -1 { 0 } else { flags };
        if libc::fcntl(read_fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            let err = io::Error::last_os_error();
            libc::close(read_fd);
            return Err(err);
        }
    }

    Ok((procs, read_fd))
}

fn abort_spawn(procs: &mut Vec<ComputeProc>, read_fd: RawFd, write_fd: RawFd) {
    // SAFETY: both pipe ends are open and closed exactly once here.
    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
    kill_and_reap(procs, REAP_WINDOW);
}

/// Reap one worker by pid after it announced DONE or CLOSED.
pub fn reap_one(procs: &mut [ComputeProc], pid: i32) -> bool {
    for p in procs.iter_mut() {
        if p.alive && p.pid == pid {
            if let Err(e) = p.child.wait() {
                eprintln!("[manage] could not collect compute {}: {}", pid, e);
            }
            p.alive = false;
            return true;
        }
    }
    false
}

/// Send SIGQUIT to every worker still marked alive, then reap with a bounded
/// polling window. A worker that outlives the window is abandoned to the OS.
pub fn kill_and_reap(procs: &mut Vec<ComputeProc>, window: Duration) {
    for p in procs.iter_mut().filter(|p| p.alive) {
        // SAFETY: p.pid came from Child::id; a stale pid fails with ESRCH.
        if unsafe { libc::kill(p.pid, libc::SIGQUIT) } == -1 {
            eprintln!(
                "[manage] could not signal compute {}: {}",
                p.pid,
                io::Error::last_os_error()
            );
        }
    }
    let deadline = Instant::now() + window;
    loop {
        let mut pending = false;
        for p in procs.iter_mut().filter(|p| p.alive) {
            match p.child.try_wait() {
                Ok(Some(_)) => p.alive = false,
                Ok(None) => pending = true,
                Err(e) => {
                    eprintln!("[manage] could not collect compute {}: {}", p.pid, e);
                    p.alive = false;
                }
            }
        }
        if !pending || Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Create the reporter FIFO, read/write for the owner only.
pub fn make_fifo(path: &Path) -> io::Result<()> {
    let c_path = c_path(path);
    // SAFETY: c_path is a valid NUL-terminated path.
    if unsafe { libc::mkfifo(c_path.as_ptr(), libc::S_IRUSR | libc::S_IWUSR) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Open the FIFO for writing. Blocks until the reporter opens the read side;
/// an arriving shutdown signal interrupts the open and surfaces as
/// ErrorKind::Interrupted.
pub fn open_fifo_writer(path: &Path) -> io::Result<RawFd> {
    open_fifo(path, libc::O_WRONLY)
}

/// Open the FIFO for reading. Blocks until the coordinator opens the write
/// side.
pub fn open_fifo_reader(path: &Path) -> io::Result<RawFd> {
    open_fifo(path, libc::O_RDONLY)
}

fn open_fifo(path: &Path, flags: i32) -> io::Result<RawFd> {
    let c_path = c_path(path);
    // SAFETY: c_path is a valid NUL-terminated path; open blocks until the
    // peer end exists or a signal interrupts.
    let fd = unsafe { libc::open(c_path.as_ptr(), flags) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Unlink a filesystem name, ignoring "does not exist".
pub fn unlink_path(path: &Path) {
    let c_path = c_path(path);
    // SAFETY: c_path is a valid NUL-terminated path.
    if unsafe { libc::unlink(c_path.as_ptr()) } == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOENT) {
            eprintln!("[manage] could not unlink {}: {}", path.display(), err);
        }
    }
}

fn c_path(path: &Path) -> std::ffi::CString {
    let bytes: Vec<u8> = path.as_os_str().as_bytes().iter().copied().filter(|&b| b != 0).collect();
    std::ffi::CString::new(bytes).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::protocol::{recv_record, send_record, Record, Recv, Tag};
    use std::path::PathBuf;

    fn scratch_fifo(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{}.{}", name, std::process::id()))
    }

    #[test]
    fn fifo_carries_records_across_threads() {
        let path = scratch_fifo("perfnum_fifo");
        unlink_path(&path);
        make_fifo(&path).unwrap();

        let writer_path = path.clone();
        let writer = std::thread::spawn(move || {
            // Blocks until the reader below opens its end.
            let fd = open_fifo_writer(&writer_path).unwrap();
            send_record(fd, &Record::perfnum(496)).unwrap();
            send_record(fd, &Record::done(1)).unwrap();
            // SAFETY: fd is the FIFO write end opened above.
            unsafe { libc::close(fd) };
        });

        let fd = open_fifo_reader(&path).unwrap();
        match recv_record(fd).unwrap() {
            Recv::Record(r) => {
                assert_eq!(r.kind(), Tag::Perfnum);
                assert_eq!(r.value(), 496);
            }
            Recv::Closed => panic!("unexpected close"),
        }
        match recv_record(fd).unwrap() {
            Recv::Record(r) => assert_eq!(r.kind(), Tag::Done),
            Recv::Closed => panic!("unexpected close"),
        }
        assert!(matches!(recv_record(fd).unwrap(), Recv::Closed));
        // SAFETY: fd is the FIFO read end opened above.
        unsafe { libc::close(fd) };

        writer.join().unwrap();
        unlink_path(&path);
    }

    #[test]
    fn spawned_children_share_one_pipe() {
        // /bin/true writes nothing; once both exit, the pipe reports EOF
        // because the parent's write end was closed after the spawns.
        let (mut procs, read_fd) = spawn_computes("/bin/true", 20, 2).unwrap();
        assert_eq!(procs.len(), 2);

        let mut closed = false;
        for _ in 0..200 {
            match recv_record(read_fd) {
                Ok(Recv::Closed) => {
                    closed = true;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                other => panic!("unexpected pipe state: {:?}", other.err()),
            }
        }
        assert!(closed, "pipe never reported EOF");

        kill_and_reap(&mut procs, Duration::from_secs(1));
        assert!(procs.iter().all(|p| !p.alive));
        // SAFETY: read_fd is the pipe read end from spawn_computes.
        unsafe { libc::close(read_fd) };
    }
}
