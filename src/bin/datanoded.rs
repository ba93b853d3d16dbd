//! The datanode server binary.
//!
//! Wires the supervision core together: opens the listening sockets,
//! writes the pid file, forks the worker set and supervises it until a
//! shutdown signal arrives. Request handling proper lives outside the
//! core; the connection handler here only manages connection lifetime
//! (drain, idle timeout, teardown).

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use log::{debug, error, info};

use datanode_core::{
    open_listeners, process as supervise, signal, Config, Direction, Listener,
    Signal, Supervisor, Token, Worker, WorkerShared,
};

/// Idle timeout after which a quiet client connection is dropped.
const CLIENT_IDLE_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Parser)]
#[command(name = "datanoded", version, about = "datanode server")]
struct Args {
    /// Addresses to listen on.
    #[arg(short, long = "listen", default_value = "127.0.0.1:8090")]
    listen: Vec<SocketAddr>,

    /// Number of worker processes.
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Number of I/O execution units per worker process.
    #[arg(long = "io-units", default_value_t = 2)]
    io_units: usize,

    /// Maximum connections per execution unit.
    #[arg(long, default_value_t = 1024)]
    connections: usize,

    /// Crash-loop window: a worker exiting within this many seconds of
    /// its last start is not respawned.
    #[arg(long = "restart-window-secs", default_value_t = 60)]
    restart_window_secs: u64,

    /// Pid file path.
    #[arg(long = "pid-file")]
    pid_file: Option<PathBuf>,

    /// Signal a running instance to quit gracefully, then exit.
    #[arg(short, long)]
    quit: bool,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(err) = run(args) {
        error!("datanoded: {}", err);
        process::exit(1);
    }
}

fn run(args: Args) -> io::Result<()> {
    let mut config = Config {
        listen: args.listen,
        worker_processes: args.workers,
        io_units: args.io_units,
        connections: args.connections,
        restart_window_secs: args.restart_window_secs,
        ..Config::default()
    };
    if let Some(pid_file) = args.pid_file {
        config.pid_file = pid_file;
    }

    if args.quit {
        let pid = supervise::read_pid_file(&config.pid_file)?;
        signal::send(pid, Signal::Quit)?;
        println!("sent quit to {}", pid);
        return Ok(());
    }

    if supervise::check_running(&config.pid_file) {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "datanoded is already running",
        ));
    }

    let _ = unsafe { libc::umask(0o022) };

    let mut listeners: Vec<Listener> = config
        .listen
        .iter()
        .map(|&addr| Listener::new(addr, client_handler))
        .collect();
    open_listeners(&mut listeners, &config)?;

    let shared = Arc::new(WorkerShared::new(config.clone(), listeners)?);
    let mut supervisor = Supervisor::new(shared, supervise::worker_process_cycle);

    // Take over the control signals before announcing the pid, so a quit
    // delivered right after startup is queued instead of killing us.
    signal::install()?;
    signal::block()?;
    supervise::write_pid_file(&config.pid_file)?;
    info!(
        "datanoded starting: {} workers x {} units",
        config.worker_processes, config.io_units
    );

    let result = supervisor.run();
    supervise::remove_pid_file(&config.pid_file);
    info!("datanoded stopped");
    result
}

/// Lifecycle handler for accepted client connections.
///
/// Drains readable data (the wire protocol is handled elsewhere), drops
/// connections on end-of-file, error or idle timeout, and re-arms the idle
/// timer after activity.
fn client_handler(worker: &mut Worker, token: Token, direction: Direction) {
    let timed_out = match worker.pool.event_mut(token, direction) {
        Some(event) => {
            let timed_out = event.timed_out;
            event.timed_out = false;
            event.ready = false;
            timed_out
        }
        None => return,
    };
    if timed_out {
        debug!("client connection {} idled out", token);
        worker.close_conn(token);
        return;
    }

    if direction == Direction::Write {
        return;
    }

    let fd = match worker.pool.get(token) {
        Some(conn) => conn.fd(),
        None => return,
    };

    let mut buf = [0u8; 4096];
    loop {
        let n = unsafe {
            libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        if n == -1 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => break,
                _ => {
                    debug!("client connection {} failed: {}", token, err);
                    worker.close_conn(token);
                    return;
                }
            }
        }
        if n == 0 {
            worker.close_conn(token);
            return;
        }
        // Payload is consumed by the (out-of-scope) request layer.
    }

    worker.arm_timer(token, Direction::Read, CLIENT_IDLE_TIMEOUT_MS);
}
