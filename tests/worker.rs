use std::io::{self, Write as _};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use datanode_core::{
    open_listeners, Config, Direction, Listener, Registry, Token, UnitKind, Worker,
    WorkerShared,
};

mod util;

use util::{init, wait_until};

fn drain(worker: &mut Worker, token: Token) -> io::Result<usize> {
    let fd = match worker.pool.get(token) {
        Some(conn) => conn.fd(),
        None => return Ok(0),
    };
    let mut total = 0;
    let mut buf = [0u8; 1024];
    loop {
        let n = unsafe {
            libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        if n == -1 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(total),
                _ => return Err(err),
            }
        }
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer gone"));
        }
        total += n as usize;
    }
}

fn start_unit(config: Config, listeners: Vec<Listener>) -> (Arc<Registry>, Arc<std::sync::atomic::AtomicBool>, thread::JoinHandle<()>) {
    let shared = Arc::new(WorkerShared::new(config, listeners).unwrap());
    let mut worker = Worker::new(0, UnitKind::Io, shared).unwrap();
    let flag = worker.run_flag();
    let registry = Arc::new(Registry::new());
    registry.add_total(1);
    let run_registry = registry.clone();
    let handle = thread::spawn(move || worker.run(&run_registry));
    registry.wait_ready();
    (registry, flag, handle)
}

static READ_BYTES: AtomicUsize = AtomicUsize::new(0);
static READ_CLOSED: AtomicUsize = AtomicUsize::new(0);

fn counting_handler(worker: &mut Worker, token: Token, direction: Direction) {
    if direction == Direction::Write {
        if let Some(event) = worker.pool.event_mut(token, direction) {
            event.ready = false;
        }
        return;
    }
    match drain(worker, token) {
        Ok(n) => {
            let _ = READ_BYTES.fetch_add(n, Ordering::SeqCst);
        }
        Err(_) => {
            worker.close_conn(token);
            let _ = READ_CLOSED.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[test]
fn unit_accepts_and_serves_connections() {
    init();
    let config = Config { connections: 64, ..Config::default() };
    let mut listeners = vec![Listener::new(
        "127.0.0.1:0".parse().unwrap(),
        counting_handler,
    )];
    open_listeners(&mut listeners, &config).unwrap();
    let addr = listeners[0].local_addr().unwrap();

    let (_registry, flag, handle) = start_unit(config, listeners);

    let mut client = TcpStream::connect(addr).expect("unable to connect");
    client.write_all(b"ping!").unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || READ_BYTES
            .load(Ordering::SeqCst)
            >= 5),
        "unit never read the client's bytes"
    );

    // Closing the client fires end-of-file on the unit's side.
    drop(client);
    assert!(
        wait_until(Duration::from_secs(5), || READ_CLOSED
            .load(Ordering::SeqCst)
            >= 1),
        "unit never tore the connection down"
    );

    flag.store(false, Ordering::Relaxed);
    handle.join().unwrap();
}

static IDLE_CLOSED: AtomicUsize = AtomicUsize::new(0);

fn idle_handler(worker: &mut Worker, token: Token, direction: Direction) {
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
        worker.close_conn(token);
        let _ = IDLE_CLOSED.fetch_add(1, Ordering::SeqCst);
        return;
    }
    if direction == Direction::Write {
        return;
    }
    if drain(worker, token).is_err() {
        worker.close_conn(token);
        return;
    }
    worker.arm_timer(token, Direction::Read, 150);
}

#[test]
fn idle_connections_time_out() {
    init();
    let config = Config { connections: 64, ..Config::default() };
    let mut listeners = vec![Listener::new(
        "127.0.0.1:0".parse().unwrap(),
        idle_handler,
    )];
    open_listeners(&mut listeners, &config).unwrap();
    let addr = listeners[0].local_addr().unwrap();

    let (_registry, flag, handle) = start_unit(config, listeners);

    // Write once, then go quiet; the armed idle timer must close us.
    let mut client = TcpStream::connect(addr).expect("unable to connect");
    client.write_all(b"one write").unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || IDLE_CLOSED
            .load(Ordering::SeqCst)
            >= 1),
        "idle connection was never timed out"
    );

    flag.store(false, Ordering::Relaxed);
    handle.join().unwrap();
}
