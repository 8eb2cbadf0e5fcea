// PERFNUM — ENGINE: RECORD PROTOCOL
// Fixed-width tagged records carried over the compute pipe, the report FIFO,
// and the TCP sockets. Every record is the same width on the wire (the width
// of the widest variant), host-native layout — the protocol is in-host only
// and makes no cross-architecture promises.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;

use bytemuck::{Pod, Zeroable};

/// Pid carried by a CLOSED record when the socket server itself terminates.
pub const PID_SERVER: i32 = 0;
/// Pid carried by a CLOSED record sent on behalf of a compute client.
pub const PID_CLIENT: i32 = 1;

/// Record tags. The wire value is the discriminant.
#[repr(u32)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Tag {
    /// Reserved; never valid on the wire.
    Null = 0,
    /// Worker finished its range (pipes) or requests more work (sockets).
    Done = 1,
    /// Premature termination of the sender (or, forwarded, of a peer).
    Closed = 2,
    /// Reporter asks the socket server to shut down.
    Kill = 3,
    /// Work assignment: an inclusive candidate range.
    Range = 4,
    /// A perfect number was found.
    Perfnum = 5,
    /// Reporter asks to become the live-event subscriber.
    Notify = 6,
    /// Subscription granted.
    Accept = 7,
    /// Subscription denied, or no work remains.
    Refuse = 8,
}

impl Tag {
    pub fn from_raw(raw: u32) -> Option<Tag> {
        match raw {
            0 => Some(Tag::Null),
            1 => Some(Tag::Done),
            2 => Some(Tag::Closed),
            3 => Some(Tag::Kill),
            4 => Some(Tag::Range),
            5 => Some(Tag::Perfnum),
            6 => Some(Tag::Notify),
            7 => Some(Tag::Accept),
            8 => Some(Tag::Refuse),
            _ => None,
        }
    }
}

/// One wire record. RANGE uses both args (start, end); DONE and CLOSED carry
/// the sender pid in arg0; PERFNUM carries the value in arg0; the remaining
/// tags carry zeroed args.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct Record {
    pub tag: u32,
    pub arg0: i32,
    pub arg1: i32,
}

pub const RECORD_SIZE: usize = mem::size_of::<Record>();
const _: () = assert!(RECORD_SIZE == 12);

impl Record {
    pub fn done(pid: i32) -> Record {
        Record { tag: Tag::Done as u32, arg0: pid, arg1: 0 }
    }

    pub fn closed(pid: i32) -> Record {
        Record { tag: Tag::Closed as u32, arg0: pid, arg1: 0 }
    }

    pub fn kill() -> Record {
        Record { tag: Tag::Kill as u32, arg0: 0, arg1: 0 }
    }

    pub fn range(start: i32, end: i32) -> Record {
        Record { tag: Tag::Range as u32, arg0: start, arg1: end }
    }

    pub fn perfnum(n: i32) -> Record {
        Record { tag: Tag::Perfnum as u32, arg0: n, arg1: 0 }
    }

    pub fn notify() -> Record {
        Record { tag: Tag::Notify as u32, arg0: 0, arg1: 0 }
    }

    pub fn accept() -> Record {
        Record { tag: Tag::Accept as u32, arg0: 0, arg1: 0 }
    }

    pub fn refuse() -> Record {
        Record { tag: Tag::Refuse as u32, arg0: 0, arg1: 0 }
    }

    /// Tag of a received record. recv_record rejects out-of-range tags, so a
    /// record that made it to a handler always maps; anything else reads as
    /// Null and falls into the handlers' invalid-record branch.
    pub fn kind(&self) -> Tag {
        Tag::from_raw(self.tag).unwrap_or(Tag::Null)
    }

    /// Sender pid of a DONE or CLOSED record.
    pub fn pid(&self) -> i32 {
        self.arg0
    }

    pub fn start(&self) -> i32 {
        self.arg0
    }

    pub fn end(&self) -> i32 {
        self.arg1
    }

    pub fn value(&self) -> i32 {
        self.arg0
    }
}

/// Outcome of a blocking record read.
#[derive(Debug)]
pub enum Recv {
    /// A full, tag-valid record.
    Record(Record),
    /// Orderly close: the peer shut down its end before the next record.
    Closed,
}

/// Write exactly RECORD_SIZE bytes to fd. EINTR is retried unconditionally —
/// sends must make progress even while a shutdown flag is pending (the final
/// CLOSED of a signalled worker travels this path). A closed peer surfaces as
/// BrokenPipe (SIGPIPE is ignored process-wide).
pub fn send_record(fd: RawFd, rec: &Record) -> io::Result<()> {
    let buf = bytemuck::bytes_of(rec);
    let mut sent = 0usize;
    while sent < RECORD_SIZE {
        // SAFETY: buf[sent..] is a valid readable region of RECORD_SIZE - sent bytes.
        let n = unsafe {
            libc::write(
                fd,
                buf[sent..].as_ptr() as *const libc::c_void,
                RECORD_SIZE - sent,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        sent += n as usize;
    }
    Ok(())
}

/// Zero-fill a record, then read exactly RECORD_SIZE bytes from fd, retrying
/// short reads until the record is complete.
///
/// Returns Recv::Closed on orderly peer close at a record boundary; an EOF
/// mid-record is an UnexpectedEof error. An EINTR or EAGAIN *before the first
/// byte* is surfaced to the caller (Interrupted is the cancellation point,
/// WouldBlock is the non-blocking pipe's "empty"); once a record is partially
/// read, both are retried so the record is never torn.
///
/// Records whose tag is outside the enumeration are rejected with
/// InvalidData; the tag value is in the error message.
pub fn recv_record(fd: RawFd) -> io::Result<Recv> {
    let mut rec = Record::zeroed();
    let buf = bytemuck::bytes_of_mut(&mut rec);
    let mut nread = 0usize;
    while nread < RECORD_SIZE {
        // SAFETY: buf[nread..] is a valid writable region of RECORD_SIZE - nread bytes.
        let n = unsafe {
            libc::read(
                fd,
                buf[nread..].as_mut_ptr() as *mut libc::c_void,
                RECORD_SIZE - nread,
            )
        };
        if n == 0 {
            if nread == 0 {
                return Ok(Recv::Closed);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed mid-record",
            ));
        }
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock if nread > 0 => continue,
                _ => return Err(err),
            }
        }
        nread += n as usize;
    }
    if Tag::from_raw(rec.tag).is_none() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("record tag {:#04x} outside enumeration", rec.tag),
        ));
    }
    Ok(Recv::Record(rec))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        // SAFETY: fds is a valid 2-element array for pipe() to fill.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn close_fd(fd: RawFd) {
        // SAFETY: fd came from pipe() above and is closed exactly once.
        unsafe { libc::close(fd) };
    }

    #[test]
    fn record_is_twelve_bytes() {
        assert_eq!(RECORD_SIZE, 12);
        assert_eq!(mem::size_of::<Record>(), mem::size_of::<u32>() + 2 * mem::size_of::<i32>());
    }

    #[test]
    fn constructors_and_accessors() {
        let r = Record::range(101, 1100);
        assert_eq!(r.kind(), Tag::Range);
        assert_eq!(r.start(), 101);
        assert_eq!(r.end(), 1100);

        let d = Record::done(4242);
        assert_eq!(d.kind(), Tag::Done);
        assert_eq!(d.pid(), 4242);

        let p = Record::perfnum(8128);
        assert_eq!(p.kind(), Tag::Perfnum);
        assert_eq!(p.value(), 8128);

        assert_eq!(Record::kill().kind(), Tag::Kill);
        assert_eq!(Record::notify().kind(), Tag::Notify);
        assert_eq!(Record::accept().kind(), Tag::Accept);
        assert_eq!(Record::refuse().kind(), Tag::Refuse);
    }

    #[test]
    fn roundtrip_over_pipe() {
        let (rx, tx) = pipe_pair();
        send_record(tx, &Record::perfnum(28)).unwrap();
        send_record(tx, &Record::done(7)).unwrap();
        match recv_record(rx).unwrap() {
            Recv::Record(r) => {
                assert_eq!(r.kind(), Tag::Perfnum);
                assert_eq!(r.value(), 28);
            }
            Recv::Closed => panic!("unexpected close"),
        }
        match recv_record(rx).unwrap() {
            Recv::Record(r) => {
                assert_eq!(r.kind(), Tag::Done);
                assert_eq!(r.pid(), 7);
            }
            Recv::Closed => panic!("unexpected close"),
        }
        close_fd(tx);
        close_fd(rx);
    }

    #[test]
    fn orderly_close_at_boundary() {
        let (rx, tx) = pipe_pair();
        close_fd(tx);
        assert!(matches!(recv_record(rx).unwrap(), Recv::Closed));
        close_fd(rx);
    }

    #[test]
    fn bad_tag_rejected() {
        let (rx, tx) = pipe_pair();
        let bogus = Record { tag: 99, arg0: 0, arg1: 0 };
        send_record(tx, &bogus).unwrap();
        let err = recv_record(rx).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        close_fd(tx);
        close_fd(rx);
    }

    #[test]
    fn empty_nonblocking_pipe_reports_wouldblock() {
        let (rx, tx) = pipe_pair();
        // SAFETY: fcntl on a valid fd; F_SETFL with flags read back from F_GETFL.
        unsafe {
            let flags = libc::fcntl(rx, libc::F_GETFL, 0);
            libc::fcntl(rx, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
        let err = recv_record(rx).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        close_fd(tx);
        close_fd(rx);
    }

    #[test]
    fn unknown_raw_tags_read_as_null() {
        let bogus = Record { tag: 0xDEAD, arg0: 0, arg1: 0 };
        assert_eq!(bogus.kind(), Tag::Null);
        assert!(Tag::from_raw(0xDEAD).is_none());
        assert_eq!(Tag::from_raw(8), Some(Tag::Refuse));
    }
}
