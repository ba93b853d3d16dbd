//! Server tunables.
//!
//! Parsing a configuration file is out of scope; the embedding binary fills
//! this struct and hands it to the supervisor before any worker is spawned.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Tunables for the supervisor and its execution units.
#[derive(Clone, Debug)]
pub struct Config {
    /// Addresses to listen on.
    pub listen: Vec<SocketAddr>,
    /// Number of worker processes to supervise.
    pub worker_processes: usize,
    /// Number of I/O execution units per worker process.
    pub io_units: usize,
    /// Maximum connections (and readiness results) per execution unit.
    pub connections: usize,
    /// Listen backlog.
    pub backlog: i32,
    /// Receive buffer size for listening sockets, in bytes.
    pub rcvbuf: usize,
    /// Send buffer size for listening sockets, in bytes.
    pub sndbuf: usize,
    /// Upper bound on one reactor wait, keeping timer resolution tight.
    pub cycle_resolution_ms: u64,
    /// Timer re-arm coalescing threshold.
    pub timer_lazy_delay_ms: u64,
    /// A worker that exits within this many seconds of its last start is
    /// treated as crash-looping and not respawned.
    pub restart_window_secs: u64,
    /// Pid file written on startup and removed on clean exit.
    pub pid_file: PathBuf,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            listen: Vec::new(),
            worker_processes: 2,
            io_units: 2,
            connections: 1024,
            backlog: 2048,
            rcvbuf: 64 << 10,
            sndbuf: 64 << 10,
            cycle_resolution_ms: 10,
            timer_lazy_delay_ms: 300,
            restart_window_secs: 60,
            pid_file: PathBuf::from("datanoded.pid"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.worker_processes > 0);
        assert!(config.io_units > 0);
        assert!(config.connections > 0);
        assert!(config.cycle_resolution_ms > 0);
    }
}
