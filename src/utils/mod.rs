pub mod perf;
pub mod sos;
pub mod thread;
