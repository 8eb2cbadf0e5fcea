// PERFNUM — IPC: SHARED MEMORY SUBSTRATE
// One contiguous region, header-then-arrays:
//
//   [ limit:i32 | manage_pid:i32 | bitmap_sem:sem_t | bitmap:limit/8+1 bytes |
//     result_sem:sem_t | results:NPERFNUMS x i32 | roster:NPROCS x ProcSlot ]
//
// Sub-region offsets are rounded up to 8 bytes (the natural alignment of
// sem_t); creator and mounters derive them from `limit` with the same
// arithmetic, so the mount-time size check rejects any region whose limit
// does not reproduce the on-disk size.
//
// Discipline: the bitmap semaphore guards bit transitions, the result
// semaphore guards slot insertion. Roster pids go through word-sized atomics
// so slot claim/clear needs no semaphore at all.

use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};

use thiserror::Error;

/// Name of the shared memory object.
pub const SHMEM_PATH: &str = "albertd";

/// Capacity of the result table. The eight perfect numbers below 10^9 fit
/// with room to spare; a full table is a configuration error.
pub const NPERFNUMS: usize = 20;

/// Capacity of the worker roster.
pub const NPROCS: usize = 20;

/// Roster sentinel: slot is unused.
pub const UNUSED_SLOT: i32 = -1;

/// One worker's roster record. Single writer per slot (the owning worker);
/// the coordinator reads pids at teardown and the reporter reads everything,
/// so all fields are word-sized atomics.
#[repr(C)]
pub struct ProcSlot {
    pub pid: AtomicI32,
    pub found: AtomicI32,
    pub tested: AtomicI32,
}

const LIMIT_OFF: usize = 0;
const MANAGE_PID_OFF: usize = 4;
const BITMAP_SEM_OFF: usize = 8;

const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Byte offsets of every sub-region, derived from the limit alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionLayout {
    pub limit: i32,
    pub bitmap: usize,
    pub bitmap_len: usize,
    pub result_sem: usize,
    pub results: usize,
    pub roster: usize,
    pub total_size: usize,
}

impl RegionLayout {
    pub fn for_limit(limit: i32) -> RegionLayout {
        let sem = mem::size_of::<libc::sem_t>();
        let bitmap = BITMAP_SEM_OFF + sem;
        let bitmap_len = limit as usize / 8 + 1;
        let result_sem = align8(bitmap + bitmap_len);
        let results = result_sem + sem;
        let roster = align8(results + NPERFNUMS * mem::size_of::<i32>());
        let total_size = roster + NPROCS * mem::size_of::<ProcSlot>();
        RegionLayout { limit, bitmap, bitmap_len, result_sem, results, roster, total_size }
    }
}

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("could not open shared memory object '{name}': {source}")]
    Open { name: String, source: io::Error },
    #[error("could not resize shared memory object: {0}")]
    Resize(io::Error),
    #[error("could not read limit from shared memory object: {0}")]
    ReadLimit(io::Error),
    #[error("region limit {0} is not a positive candidate limit")]
    BadLimit(i32),
    #[error("shared memory object is invalid: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: usize, actual: i64 },
    #[error("could not map shared memory object: {0}")]
    Map(io::Error),
    #[error("could not initialize semaphore: {0}")]
    SemInit(io::Error),
    #[error("could not unlink shared memory object: {0}")]
    Unlink(io::Error),
}

/// A mounted (or freshly created) region. All shared mutation goes through
/// atomics or the two semaphores, so `&ShmemRes` may be shared freely.
pub struct ShmemRes {
    addr: *mut u8,
    layout: RegionLayout,
    /// True when `addr` came from mmap and must be unmapped on drop. Regions
    /// built over borrowed memory (tests) leave this false.
    mapped: bool,
}

// SAFETY: every access to the region goes through atomics or a semaphore
// critical section; the raw pointer itself is never reseated.
unsafe impl Send for ShmemRes {}
unsafe impl Sync for ShmemRes {}

impl ShmemRes {
    /// Create the region: unlink any stale object at `name`, size a fresh one
    /// for `limit`, map it, and initialize header, semaphores, and roster.
    /// Coordinator only.
    pub fn create(name: &str, limit: i32) -> Result<ShmemRes, ShmError> {
        if limit <= 0 {
            return Err(ShmError::BadLimit(limit));
        }
        Self::unlink(name)?;

        let layout = RegionLayout::for_limit(limit);
        let c_name = cstring(name);
        // SAFETY: c_name is a valid NUL-terminated string; the fd is checked
        // before use and closed on every path.
        let fd = unsafe {
            libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR, shm_mode())
        };
        if fd == -1 {
            return Err(ShmError::Open { name: name.to_string(), source: io::Error::last_os_error() });
        }
        // SAFETY: fd is a valid shm object fd; ftruncate zero-fills to total_size.
        if unsafe { libc::ftruncate(fd, layout.total_size as libc::off_t) } == -1 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is open.
            unsafe { libc::close(fd) };
            return Err(ShmError::Resize(err));
        }
        let addr = map_region(fd, layout.total_size)?;

        let res = ShmemRes { addr, layout, mapped: true };
        // SAFETY: addr points at a writable mapping of layout.total_size bytes
        // that no other process can have mounted yet (the object was just created).
        unsafe {
            ptr::write(addr.add(LIMIT_OFF) as *mut i32, limit);
            ptr::write(addr.add(MANAGE_PID_OFF) as *mut i32, std::process::id() as i32);
            if libc::sem_init(res.bitmap_sem(), 1, 1) == -1 {
                return Err(ShmError::SemInit(io::Error::last_os_error()));
            }
            if libc::sem_init(res.result_sem(), 1, 1) == -1 {
                return Err(ShmError::SemInit(io::Error::last_os_error()));
            }
        }
        for i in 0..NPROCS {
            res.roster_slot(i).pid.store(UNUSED_SLOT, Ordering::Relaxed);
        }
        Ok(res)
    }

    /// Mount an existing region: read its limit, derive the expected size,
    /// and reject the object if the on-disk size disagrees — it is foreign or
    /// corrupt. Workers and the reporter mount; they never create or unlink.
    pub fn mount(name: &str) -> Result<ShmemRes, ShmError> {
        let c_name = cstring(name);
        // SAFETY: c_name is a valid NUL-terminated string; fd checked before use.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd == -1 {
            return Err(ShmError::Open { name: name.to_string(), source: io::Error::last_os_error() });
        }

        let mut limit: i32 = 0;
        // SAFETY: reading sizeof(i32) bytes into a valid i32; fd is open.
        let n = unsafe {
            libc::read(fd, &mut limit as *mut i32 as *mut libc::c_void, mem::size_of::<i32>())
        };
        if n != mem::size_of::<i32>() as isize {
            let err = io::Error::last_os_error();
            // SAFETY: fd is open.
            unsafe { libc::close(fd) };
            return Err(ShmError::ReadLimit(err));
        }
        if limit <= 0 {
            // SAFETY: fd is open.
            unsafe { libc::close(fd) };
            return Err(ShmError::BadLimit(limit));
        }

        let layout = RegionLayout::for_limit(limit);
        // SAFETY: fd is open; lseek to the end reports the object size.
        let actual = unsafe { libc::lseek(fd, 0, libc::SEEK_END) };
        if actual != layout.total_size as libc::off_t {
            // SAFETY: fd is open.
            unsafe { libc::close(fd) };
            return Err(ShmError::SizeMismatch { expected: layout.total_size, actual: actual as i64 });
        }

        let addr = map_region(fd, layout.total_size)?;
        Ok(ShmemRes { addr, layout, mapped: true })
    }

    /// Remove the object name, ignoring "does not exist". Coordinator only.
    pub fn unlink(name: &str) -> Result<(), ShmError> {
        let c_name = cstring(name);
        // SAFETY: c_name is a valid NUL-terminated string.
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(ShmError::Unlink(err));
            }
        }
        Ok(())
    }

    /// Build a region over caller-owned memory of at least
    /// `RegionLayout::for_limit(limit).total_size` bytes, 8-aligned.
    /// Initializes it exactly as `create` does. Used by tests in place of a
    /// kernel-backed object.
    ///
    /// # Safety
    /// `addr` must be valid, writable, 8-aligned, and outlive the result.
    pub unsafe fn init_at(addr: *mut u8, limit: i32) -> ShmemRes {
        let layout = RegionLayout::for_limit(limit);
        ptr::write_bytes(addr, 0, layout.total_size);
        ptr::write(addr.add(LIMIT_OFF) as *mut i32, limit);
        ptr::write(addr.add(MANAGE_PID_OFF) as *mut i32, std::process::id() as i32);
        let res = ShmemRes { addr, layout, mapped: false };
        libc::sem_init(res.bitmap_sem(), 1, 1);
        libc::sem_init(res.result_sem(), 1, 1);
        for i in 0..NPROCS {
            res.roster_slot(i).pid.store(UNUSED_SLOT, Ordering::Relaxed);
        }
        res
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    pub fn limit(&self) -> i32 {
        self.layout.limit
    }

    /// Pid of the coordinator that created the region.
    pub fn manage_pid(&self) -> i32 {
        // SAFETY: MANAGE_PID_OFF is within the mapping; written once at create.
        unsafe { ptr::read(self.addr.add(MANAGE_PID_OFF) as *const i32) }
    }

    fn bitmap_sem(&self) -> *mut libc::sem_t {
        // Offset is 8-aligned by construction.
        unsafe { self.addr.add(BITMAP_SEM_OFF) as *mut libc::sem_t }
    }

    fn result_sem(&self) -> *mut libc::sem_t {
        unsafe { self.addr.add(self.layout.result_sem) as *mut libc::sem_t }
    }

    fn bitmap_byte(&self, i: usize) -> &AtomicU8 {
        debug_assert!(i < self.layout.bitmap_len);
        // SAFETY: i is within the bitmap sub-region; AtomicU8 has the layout of u8.
        unsafe { &*(self.addr.add(self.layout.bitmap + i) as *const AtomicU8) }
    }

    fn result_slot(&self, i: usize) -> &AtomicI32 {
        debug_assert!(i < NPERFNUMS);
        // SAFETY: i is within the results sub-region; offsets are 4-aligned.
        unsafe { &*(self.addr.add(self.layout.results + i * mem::size_of::<i32>()) as *const AtomicI32) }
    }

    pub fn roster_slot(&self, i: usize) -> &ProcSlot {
        debug_assert!(i < NPROCS);
        // SAFETY: i is within the roster sub-region; ProcSlot is repr(C) atomics.
        unsafe {
            &*(self.addr.add(self.layout.roster + i * mem::size_of::<ProcSlot>()) as *const ProcSlot)
        }
    }

    /// Wait on a region semaphore, retrying interrupted and spurious wakeups.
    fn sem_wait(&self, sem: *mut libc::sem_t) {
        // SAFETY: sem points at a sem_t initialized by create/init_at.
        unsafe {
            while libc::sem_wait(sem) == -1 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                    _ => {
                        eprintln!("[perfnum] semaphore wait failed: {}", err);
                        return;
                    }
                }
            }
        }
    }

    fn sem_post(&self, sem: *mut libc::sem_t) {
        // SAFETY: sem points at a sem_t initialized by create/init_at.
        if unsafe { libc::sem_post(sem) } == -1 {
            eprintln!("[perfnum] semaphore post failed: {}", io::Error::last_os_error());
        }
    }

    /// Claim the next untested candidate. The scan reads bitmap bytes without
    /// the lock; a zero bit is only trusted after a re-check under the bitmap
    /// semaphore (it may have been claimed during the wait). Returns the
    /// candidate value, or None when every bit in [1, limit] is set.
    pub fn claim_next(&self) -> Option<u32> {
        let limit = self.layout.limit as u32;
        let mut n = 0u32;
        while n < limit {
            let byte_idx = (n / 8) as usize;
            let byte = self.bitmap_byte(byte_idx).load(Ordering::Relaxed);
            if byte == 0xFF {
                n = (n / 8 + 1) * 8;
                continue;
            }
            let bit = 1u8 << (n % 8);
            if byte & bit != 0 {
                n += 1;
                continue;
            }

            self.sem_wait(self.bitmap_sem());
            let slot = self.bitmap_byte(byte_idx);
            let current = slot.load(Ordering::Acquire);
            let won = current & bit == 0;
            if won {
                slot.store(current | bit, Ordering::Release);
            }
            self.sem_post(self.bitmap_sem());

            if won {
                return Some(n + 1);
            }
            n += 1;
        }
        None
    }

    /// Lowest unclaimed candidate, or None when testing is complete.
    pub fn next_unclaimed(&self) -> Option<u32> {
        let limit = self.layout.limit as u32;
        for n in 0..limit {
            let byte = self.bitmap_byte((n / 8) as usize).load(Ordering::Relaxed);
            if byte & (1u8 << (n % 8)) == 0 {
                return Some(n + 1);
            }
        }
        None
    }

    /// Insert a perfect number into the first empty result slot, under the
    /// result semaphore. Returns false when the table is full (a
    /// configuration error for the supported limits); no slot is ever
    /// overwritten.
    pub fn record_perfnum(&self, n: i32) -> bool {
        self.sem_wait(self.result_sem());
        let mut stored = false;
        for i in 0..NPERFNUMS {
            let slot = self.result_slot(i);
            if slot.load(Ordering::Relaxed) == 0 {
                slot.store(n, Ordering::Release);
                stored = true;
                break;
            }
        }
        self.sem_post(self.result_sem());
        stored
    }

    /// Non-zero result slots in insertion order.
    pub fn results(&self) -> Vec<i32> {
        (0..NPERFNUMS)
            .map(|i| self.result_slot(i).load(Ordering::Acquire))
            .filter(|&v| v != 0)
            .collect()
    }

    /// Claim the first unused roster slot for `pid`. The pid field is the
    /// publication point: a successful compare-exchange owns the slot, and
    /// the counters are zeroed immediately after.
    pub fn roster_insert(&self, pid: i32) -> Option<usize> {
        for i in 0..NPROCS {
            let slot = self.roster_slot(i);
            if slot
                .pid
                .compare_exchange(UNUSED_SLOT, pid, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                slot.found.store(0, Ordering::Relaxed);
                slot.tested.store(0, Ordering::Relaxed);
                return Some(i);
            }
        }
        None
    }

    /// Return a roster slot to the pool. The counters stay behind so the
    /// reporter's totals still include work done by exited workers.
    pub fn roster_clear(&self, idx: usize) {
        self.roster_slot(idx).pid.store(UNUSED_SLOT, Ordering::Release);
    }

    /// Live roster entries: (pid, found, tested).
    pub fn roster(&self) -> Vec<(i32, i32, i32)> {
        let mut live = Vec::new();
        for i in 0..NPROCS {
            let slot = self.roster_slot(i);
            let pid = slot.pid.load(Ordering::Acquire);
            if pid != UNUSED_SLOT {
                live.push((
                    pid,
                    slot.found.load(Ordering::Relaxed),
                    slot.tested.load(Ordering::Relaxed),
                ));
            }
        }
        live
    }

    /// Candidates tested so far, summed over every slot — cleared slots keep
    /// their counters, so exited workers still count.
    pub fn total_tested(&self) -> i64 {
        (0..NPROCS)
            .map(|i| self.roster_slot(i).tested.load(Ordering::Relaxed) as i64)
            .sum()
    }

    /// Coordinator shutdown: signal every live worker with SIGQUIT, then
    /// destroy both semaphores, retrying until they report not-in-use.
    /// The caller unlinks the object name afterwards.
    pub fn teardown(&self) {
        for i in 0..NPROCS {
            let slot = self.roster_slot(i);
            let pid = slot.pid.load(Ordering::Acquire);
            if pid == UNUSED_SLOT {
                continue;
            }
            // SAFETY: pid is a worker recorded in the roster; kill with SIGQUIT
            // is safe for any pid value (a stale pid just fails with ESRCH).
            if unsafe { libc::kill(pid, libc::SIGQUIT) } == -1 {
                eprintln!(
                    "[manage] could not signal compute {}: {}",
                    pid,
                    io::Error::last_os_error()
                );
            } else {
                slot.pid.store(UNUSED_SLOT, Ordering::Release);
            }
        }
        sem_destroy_retry(self.bitmap_sem());
        sem_destroy_retry(self.result_sem());
    }
}

impl Drop for ShmemRes {
    fn drop(&mut self) {
        if self.mapped {
            // SAFETY: addr/total_size describe the mapping created in create/mount.
            unsafe { libc::munmap(self.addr as *mut libc::c_void, self.layout.total_size) };
        }
    }
}

/// Destroy a semaphore, retrying while something still blocks on it.
fn sem_destroy_retry(sem: *mut libc::sem_t) {
    // SAFETY: sem points at a sem_t initialized in this region.
    unsafe {
        while libc::sem_destroy(sem) == -1 {
            if io::Error::last_os_error().raw_os_error() == Some(libc::EINVAL) {
                break;
            }
        }
    }
}

fn map_region(fd: i32, size: usize) -> Result<*mut u8, ShmError> {
    // SAFETY: fd is an open shm object of at least `size` bytes; the fd is no
    // longer needed once the mapping exists.
    unsafe {
        let addr = libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        );
        let err = io::Error::last_os_error();
        libc::close(fd);
        if addr == libc::MAP_FAILED {
            return Err(ShmError::Map(err));
        }
        Ok(addr as *mut u8)
    }
}

fn cstring(name: &str) -> std::ffi::CString {
    // Interior NULs cannot appear in the compile-time names this crate uses;
    // strip them rather than silently naming a different object.
    let bytes: Vec<u8> = name.bytes().filter(|&b| b != 0).collect();
    std::ffi::CString::new(bytes).unwrap_or_default()
}

fn shm_mode() -> libc::mode_t {
    libc::S_IRUSR | libc::S_IWUSR
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 8-aligned heap backing for a region, in place of a kernel object.
    struct HeapRegion {
        buf: Vec<u64>,
    }

    impl HeapRegion {
        fn new(limit: i32) -> (HeapRegion, ShmemRes) {
            let layout = RegionLayout::for_limit(limit);
            let mut region = HeapRegion { buf: vec![0u64; layout.total_size / 8 + 1] };
            // SAFETY: buf is 8-aligned, writable, covers total_size bytes, and
            // outlives the ShmemRes (both are returned together and dropped in
            // test scope, region after res).
            let res = unsafe { ShmemRes::init_at(region.buf.as_mut_ptr() as *mut u8, limit) };
            (region, res)
        }
    }

    #[test]
    fn layout_keeps_semaphores_aligned() {
        for limit in [1, 7, 8, 9, 100, 101, 499, 500, 8128] {
            let l = RegionLayout::for_limit(limit);
            assert_eq!(l.result_sem % 8, 0, "limit {}", limit);
            assert_eq!(l.roster % 8, 0, "limit {}", limit);
            assert_eq!(l.bitmap_len, limit as usize / 8 + 1);
            assert!(l.total_size > l.roster);
        }
    }

    #[test]
    fn layout_size_tracks_limit() {
        let a = RegionLayout::for_limit(100);
        let b = RegionLayout::for_limit(1000);
        assert!(b.total_size > a.total_size);
        assert_eq!(a, RegionLayout::for_limit(100));
    }

    #[test]
    fn claims_are_exclusive_and_exhaustive() {
        let (_backing, res) = HeapRegion::new(20);
        let mut seen = Vec::new();
        while let Some(n) = res.claim_next() {
            seen.push(n);
        }
        seen.sort();
        assert_eq!(seen, (1..=20).collect::<Vec<u32>>());
        assert!(res.claim_next().is_none());
        assert!(res.next_unclaimed().is_none());
    }

    #[test]
    fn claim_skips_already_set_bits() {
        let (_backing, res) = HeapRegion::new(10);
        assert_eq!(res.claim_next(), Some(1));
        assert_eq!(res.claim_next(), Some(2));
        assert_eq!(res.next_unclaimed(), Some(3));
        assert_eq!(res.claim_next(), Some(3));
    }

    #[test]
    fn result_slots_fill_in_order_and_never_overwrite() {
        let (_backing, res) = HeapRegion::new(8);
        assert!(res.record_perfnum(6));
        assert!(res.record_perfnum(28));
        assert_eq!(res.results(), vec![6, 28]);
        for i in 0..NPERFNUMS - 2 {
            assert!(res.record_perfnum(1000 + i as i32));
        }
        // Table full: insertion refused, existing slots untouched.
        assert!(!res.record_perfnum(9999));
        let all = res.results();
        assert_eq!(all.len(), NPERFNUMS);
        assert_eq!(all[0], 6);
        assert_eq!(all[1], 28);
        assert!(!all.contains(&9999));
    }

    #[test]
    fn roster_insert_clear_reuse() {
        let (_backing, res) = HeapRegion::new(8);
        let a = res.roster_insert(100).unwrap();
        let b = res.roster_insert(200).unwrap();
        assert_ne!(a, b);
        assert_eq!(res.roster().len(), 2);

        res.roster_slot(a).tested.store(5, Ordering::Relaxed);
        res.roster_clear(a);
        assert_eq!(res.roster().len(), 1);
        // Cleared slots keep their counters for the totals.
        assert_eq!(res.total_tested(), 5);

        // Reinsertion claims a free slot and zeroes the counters.
        let c = res.roster_insert(300).unwrap();
        assert_eq!(c, a);
        assert_eq!(res.roster_slot(c).tested.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn roster_capacity_is_bounded() {
        let (_backing, res) = HeapRegion::new(8);
        for i in 0..NPROCS {
            assert!(res.roster_insert(1000 + i as i32).is_some());
        }
        assert!(res.roster_insert(5555).is_none());
    }

    #[test]
    fn header_carries_limit_and_manage_pid() {
        let (_backing, res) = HeapRegion::new(64);
        assert_eq!(res.limit(), 64);
        assert_eq!(res.manage_pid(), std::process::id() as i32);
    }
}
