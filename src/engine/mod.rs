// PERFNUM — ENGINE MODULE
// Everything the system IS: the record protocol, the predicate, and the
// process-wide runtime (signals, fatal exits). The ipc module moves the bytes.

pub mod perfect;
pub mod protocol;
pub mod runtime;
