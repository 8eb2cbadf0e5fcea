// PERFNUM — IPC: SOCKET TRANSPORT
// The sockets method: a TCP server handing out work ranges on demand over
// fixed-width records, with a poll-driven client table and at most one
// notify-subscriber receiving the live result stream.

use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;

use crate::engine::protocol::{recv_record, send_record, Record, Recv, Tag, PID_CLIENT, PID_SERVER};
use crate::engine::runtime;

/// Port the server listens on.
pub const SERVER_PORT: u16 = 10054;

/// Maximum number of queued connections.
pub const MAX_BACKLOG: i32 = 32;

/// Maximum number of simultaneous clients; an accepted connection beyond
/// this is closed immediately.
pub const MAX_CLIENTS: usize = 64;

/// Candidates granted per DONE request.
pub const NASSIGN: i32 = 1000;

/// Bind a listening socket on INADDR_ANY:port with address reuse.
pub fn listen_on(port: u16) -> io::Result<RawFd> {
    // SAFETY: plain socket/setsockopt/bind/listen sequence on a fresh fd; the
    // sockaddr_in is zeroed then fully initialized; fd closed on every error path.
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        let on: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &on as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) == -1
        {
            eprintln!(
                "[manage] could not set SO_REUSEADDR: {}",
                io::Error::last_os_error()
            );
        }
        let mut addr: libc::sockaddr_in = mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = libc::INADDR_ANY;
        if libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) == -1
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        if libc::listen(fd, MAX_BACKLOG) == -1 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        Ok(fd)
    }
}

/// Port a listening socket actually bound (for port-0 binds).
pub fn local_port(fd: RawFd) -> io::Result<u16> {
    // SAFETY: getsockname fills the zeroed sockaddr_in up to len bytes.
    unsafe {
        let mut addr: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        if libc::getsockname(
            fd,
            &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        ) == -1
        {
            return Err(io::Error::last_os_error());
        }
        Ok(u16::from_be(addr.sin_port))
    }
}

/// Connect to the coordinating server.
pub fn connect_to(host: &str, port: u16) -> io::Result<RawFd> {
    let ip: Ipv4Addr = host
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid server address"))?;
    // SAFETY: socket/connect on a fresh fd; sockaddr_in zeroed then initialized;
    // fd closed on the error path.
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        let mut addr: libc::sockaddr_in = mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = u32::from(ip).to_be();
        if libc::connect(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) == -1
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        Ok(fd)
    }
}

/// The socket coordinator's state: the fd table, the subscription, the
/// high-water mark of handed-out work, and the result history replayed to a
/// late subscriber.
pub struct SockServer {
    listen_fd: RawFd,
    clients: [RawFd; MAX_CLIENTS],
    notify: RawFd,
    perfnums: Vec<i32>,
    limit: i32,
    highest_assigned: i32,
    done: bool,
    missed_some: bool,
}

impl SockServer {
    pub fn new(listen_fd: RawFd, limit: i32) -> SockServer {
        SockServer {
            listen_fd,
            clients: [-1; MAX_CLIENTS],
            notify: -1,
            perfnums: Vec::new(),
            limit,
            highest_assigned: 0,
            done: false,
            missed_some: false,
        }
    }

    pub fn results(&self) -> &[i32] {
        &self.perfnums
    }

    /// Main loop: poll the listener and every client, level-triggered, no
    /// timeout. Exits on a caught signal, a KILL record, or a poll failure.
    pub fn run(&mut self) {
        loop {
            if runtime::shutdown_requested() {
                break;
            }

            let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(MAX_CLIENTS + 1);
            pollfds.push(libc::pollfd { fd: self.listen_fd, events: libc::POLLIN, revents: 0 });
            for &fd in self.clients.iter().filter(|&&fd| fd != -1) {
                pollfds.push(libc::pollfd { fd, events: libc::POLLIN, revents: 0 });
            }

            // SAFETY: pollfds is a valid array of pollfds.len() entries.
            let nready =
                unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, -1) };
            if nready == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    // Loop head re-checks the signal flag.
                    continue;
                }
                eprintln!("[manage] poll failed: {}", err);
                break;
            }

            if pollfds[0].revents != 0 {
                self.accept_client();
            }
            for pfd in &pollfds[1..] {
                if pfd.revents == 0 {
                    continue;
                }
                match recv_record(pfd.fd) {
                    Ok(Recv::Closed) => self.remove_client(pfd.fd),
                    Ok(Recv::Record(rec)) => {
                        if self.handle_record(pfd.fd, rec) {
                            return;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                        eprintln!("[manage] unrecognized record: {}", e);
                    }
                    Err(e) => {
                        eprintln!("[manage] could not read record: {}", e);
                        self.remove_client(pfd.fd);
                    }
                }
            }
        }
    }

    /// Handle one record from client `fd`. Returns true when the record ends
    /// the main loop (KILL).
    pub fn handle_record(&mut self, fd: RawFd, rec: Record) -> bool {
        match rec.kind() {
            Tag::Perfnum => {
                self.perfnums.push(rec.value());
                if self.notify != -1 {
                    self.send_to(self.notify, &rec);
                }
            }
            Tag::Done => match self.next_grant() {
                Some((start, end)) => {
                    self.send_to(fd, &Record::range(start, end));
                }
                None => {
                    self.done = true;
                    self.send_to(fd, &Record::refuse());
                    if self.notify != -1 {
                        self.send_to(self.notify, &Record::done(PID_SERVER));
                    }
                }
            },
            Tag::Closed => {
                // A worker died mid-range; some candidates may go untested.
                self.missed_some = true;
                if self.notify != -1 {
                    self.send_to(self.notify, &rec);
                }
            }
            Tag::Kill => {
                eprintln!("[manage] received shutdown record");
                return true;
            }
            Tag::Notify => {
                if self.notify == -1 {
                    self.notify = fd;
                    self.send_to(fd, &Record::accept());
                    if self.missed_some {
                        self.send_to(fd, &Record::closed(PID_CLIENT));
                    }
                    // Replay the full history, then the terminal state.
                    for i in 0..self.perfnums.len() {
                        self.send_to(fd, &Record::perfnum(self.perfnums[i]));
                    }
                    if self.done {
                        self.send_to(fd, &Record::done(PID_SERVER));
                    }
                } else {
                    self.send_to(fd, &Record::refuse());
                }
            }
            Tag::Null | Tag::Range => {
                eprintln!("[manage] invalid record: {:#04x}", rec.tag);
            }
            Tag::Accept | Tag::Refuse => {
                eprintln!("[manage] unexpected record: {:#04x}", rec.tag);
            }
        }
        false
    }

    /// Next work grant: [h+1, min(h+NASSIGN, limit)], advancing the
    /// high-water mark by exactly NASSIGN. None once the limit is covered.
    fn next_grant(&mut self) -> Option<(i32, i32)> {
        if self.highest_assigned >= self.limit {
            return None;
        }
        let start = self.highest_assigned + 1;
        let end = self.highest_assigned.saturating_add(NASSIGN).min(self.limit);
        self.highest_assigned = self.highest_assigned.saturating_add(NASSIGN);
        Some((start, end))
    }

    fn accept_client(&mut self) {
        // SAFETY: accept on the listening fd; peer address is not needed.
        let fd = unsafe { libc::accept(self.listen_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if fd == -1 {
            eprintln!("[manage] accept failed: {}", io::Error::last_os_error());
            return;
        }
        for slot in self.clients.iter_mut() {
            if *slot == -1 {
                *slot = fd;
                return;
            }
        }
        eprintln!("[manage] client limit reached, dropping connection");
        // SAFETY: fd was just accepted and is otherwise untracked.
        unsafe { libc::close(fd) };
    }

    fn remove_client(&mut self, fd: RawFd) {
        if fd == self.notify {
            self.notify = -1;
        }
        for slot in self.clients.iter_mut() {
            if *slot == fd {
                *slot = -1;
                // SAFETY: fd is a tracked client socket, closed exactly once.
                unsafe { libc::close(fd) };
                return;
            }
        }
    }

    fn send_to(&self, fd: RawFd, rec: &Record) {
        if let Err(e) = send_record(fd, rec) {
            eprintln!("[manage] could not send record: {}", e);
        }
    }

    /// Shutdown: tell every connected client the server is gone, then close
    /// everything including the listener.
    pub fn cleanup(&mut self) {
        let farewell = Record::closed(PID_SERVER);
        for slot in self.clients.iter_mut() {
            if *slot != -1 {
                if let Err(e) = send_record(*slot, &farewell) {
                    if e.kind() != io::ErrorKind::BrokenPipe {
                        eprintln!("[manage] could not send record: {}", e);
                    }
                }
                // SAFETY: slot holds a tracked client socket, closed exactly once.
                unsafe { libc::close(*slot) };
                *slot = -1;
            }
        }
        self.notify = -1;
        if self.listen_fd != -1 {
            // SAFETY: the listener fd is open and closed exactly once.
            unsafe { libc::close(self.listen_fd) };
            self.listen_fd = -1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        // SAFETY: fds is a valid 2-element array for socketpair() to fill.
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn close_fd(fd: RawFd) {
        // SAFETY: fd came from socketpair() above and is closed exactly once.
        unsafe { libc::close(fd) };
    }

    fn expect_record(fd: RawFd) -> Record {
        match recv_record(fd).unwrap() {
            Recv::Record(r) => r,
            Recv::Closed => panic!("unexpected close"),
        }
    }

    #[test]
    fn grants_cover_limit_and_clip_last_range() {
        let mut srv = SockServer::new(-1, 2500);
        assert_eq!(srv.next_grant(), Some((1, 1000)));
        assert_eq!(srv.next_grant(), Some((1001, 2000)));
        assert_eq!(srv.next_grant(), Some((2001, 2500)));
        assert_eq!(srv.next_grant(), None);
    }

    #[test]
    fn short_limit_grants_once() {
        let mut srv = SockServer::new(-1, 30);
        assert_eq!(srv.next_grant(), Some((1, 30)));
        assert_eq!(srv.next_grant(), None);
    }

    #[test]
    fn done_is_answered_with_range_then_refuse() {
        let mut srv = SockServer::new(-1, 30);
        let (server_side, worker_side) = socketpair();

        assert!(!srv.handle_record(server_side, Record::done(99)));
        let r = expect_record(worker_side);
        assert_eq!(r.kind(), Tag::Range);
        assert_eq!((r.start(), r.end()), (1, 30));

        assert!(!srv.handle_record(server_side, Record::done(99)));
        assert_eq!(expect_record(worker_side).kind(), Tag::Refuse);
        assert!(srv.done);

        close_fd(server_side);
        close_fd(worker_side);
    }

    #[test]
    fn late_subscriber_gets_history_then_done() {
        let mut srv = SockServer::new(-1, 30);
        let (worker_tx, _worker_rx) = socketpair();
        let (reporter_srv, reporter_cli) = socketpair();

        srv.handle_record(worker_tx, Record::perfnum(6));
        srv.handle_record(worker_tx, Record::perfnum(28));
        srv.next_grant();
        srv.handle_record(worker_tx, Record::done(99)); // exhausted: sets done

        srv.handle_record(reporter_srv, Record::notify());
        assert_eq!(expect_record(reporter_cli).kind(), Tag::Accept);
        assert_eq!(expect_record(reporter_cli).value(), 6);
        assert_eq!(expect_record(reporter_cli).value(), 28);
        assert_eq!(expect_record(reporter_cli).kind(), Tag::Done);

        close_fd(worker_tx);
        close_fd(_worker_rx);
        close_fd(reporter_srv);
        close_fd(reporter_cli);
    }

    #[test]
    fn second_subscriber_is_refused() {
        let mut srv = SockServer::new(-1, 30);
        let (first_srv, first_cli) = socketpair();
        let (second_srv, second_cli) = socketpair();

        srv.handle_record(first_srv, Record::notify());
        assert_eq!(expect_record(first_cli).kind(), Tag::Accept);

        srv.handle_record(second_srv, Record::notify());
        assert_eq!(expect_record(second_cli).kind(), Tag::Refuse);

        close_fd(first_srv);
        close_fd(first_cli);
        close_fd(second_srv);
        close_fd(second_cli);
    }

    #[test]
    fn live_results_are_forwarded_to_subscriber() {
        let mut srv = SockServer::new(-1, 500);
        let (rep_srv, rep_cli) = socketpair();
        let (worker_tx, _worker_rx) = socketpair();

        srv.handle_record(rep_srv, Record::notify());
        assert_eq!(expect_record(rep_cli).kind(), Tag::Accept);

        srv.handle_record(worker_tx, Record::perfnum(496));
        let r = expect_record(rep_cli);
        assert_eq!(r.kind(), Tag::Perfnum);
        assert_eq!(r.value(), 496);

        close_fd(rep_srv);
        close_fd(rep_cli);
        close_fd(worker_tx);
        close_fd(_worker_rx);
    }

    #[test]
    fn worker_death_reaches_subscriber_even_late() {
        let mut srv = SockServer::new(-1, 500);
        let (worker_tx, _worker_rx) = socketpair();
        srv.handle_record(worker_tx, Record::closed(1234));
        assert!(srv.missed_some);

        // A subscriber arriving afterwards hears about the loss first.
        let (rep_srv, rep_cli) = socketpair();
        srv.handle_record(rep_srv, Record::notify());
        assert_eq!(expect_record(rep_cli).kind(), Tag::Accept);
        let r = expect_record(rep_cli);
        assert_eq!(r.kind(), Tag::Closed);
        assert_eq!(r.pid(), PID_CLIENT);

        close_fd(worker_tx);
        close_fd(_worker_rx);
        close_fd(rep_srv);
        close_fd(rep_cli);
    }

    #[test]
    fn kill_ends_the_loop() {
        let mut srv = SockServer::new(-1, 500);
        let (a, b) = socketpair();
        assert!(srv.handle_record(a, Record::kill()));
        close_fd(a);
        close_fd(b);
    }
}
