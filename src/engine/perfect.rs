// PERFNUM — ENGINE: THE PREDICATE
// A positive integer is perfect when it equals the sum of its proper divisors.
// All three worker loops share this test; the pipes coordinator shares the
// pre-partitioning math.

/// Design ceiling on the divisor buffer. Large enough for every candidate the
/// supported limits can produce; exceeding it means the configured limit is
/// out of the design envelope and must fail loudly.
pub const MAX_DIVISORS: usize = 10_000;

/// Trial division over [1, n). Proper divisors are collected, the buffer
/// bound asserted, then summed.
pub fn is_perfect(n: u32) -> bool {
    if n == 0 {
        return false;
    }

    let mut divisors: Vec<u32> = Vec::new();
    for i in 1..n {
        if n % i == 0 {
            divisors.push(i);
        }
    }
    assert!(
        divisors.len() <= MAX_DIVISORS,
        "divisor buffer overflow at n={}: limit exceeds design envelope",
        n
    );

    let sum: u32 = divisors.iter().sum();
    sum == n
}

/// Pre-partition [1, limit] into nprocs contiguous inclusive ranges.
/// Each range holds floor(limit/nprocs) candidates except the first, which
/// also absorbs the remainder — the first worker is started first and has the
/// longest head start.
pub fn partition(limit: u32, nprocs: u32) -> Vec<(u32, u32)> {
    assert!(limit > 0 && nprocs > 0);
    let per_proc = limit / nprocs;
    let mut ranges = Vec::with_capacity(nprocs as usize);
    let mut end = 0u32;
    for i in 0..nprocs {
        let start = end + 1;
        end = if i == 0 {
            per_proc + limit % nprocs
        } else {
            start + per_proc - 1
        };
        ranges.push((start, end));
    }
    ranges
}
