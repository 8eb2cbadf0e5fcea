// PERFNUM — IPC MODULE
// The three transports. Engine defines the records and the predicate; ipc
// moves the bytes: a shared memory region under semaphore discipline, an
// anonymous pipe + FIFO pipeline, and a poll-driven TCP server.

pub mod pipes;
pub mod shmem;
pub mod sock;
