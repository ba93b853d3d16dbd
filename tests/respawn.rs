//! Worker respawn policy, observed through the real `datanoded` binary and
//! the kernel's view of the master's children.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

mod util;

use util::{init, wait_until};

fn pid_file(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!(
        "datanoded-respawn-{}-{}.pid",
        name,
        std::process::id()
    ));
    path
}

fn spawn_datanoded(pid_file: &PathBuf, workers: u32, restart_window_secs: u64) -> Child {
    Command::new(env!("CARGO_BIN_EXE_datanoded"))
        .arg("--listen")
        .arg("127.0.0.1:0")
        .arg("--workers")
        .arg(workers.to_string())
        .arg("--io-units")
        .arg("1")
        .arg("--restart-window-secs")
        .arg(restart_window_secs.to_string())
        .arg("--pid-file")
        .arg(pid_file)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("unable to start datanoded")
}

fn children_of(pid: u32) -> HashSet<libc::pid_t> {
    let path = format!("/proc/{}/task/{}/children", pid, pid);
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .split_whitespace()
        .filter_map(|child| child.parse().ok())
        .collect()
}

fn shut_down(master: &mut Child) {
    let _ = unsafe { libc::kill(master.id() as libc::pid_t, libc::SIGQUIT) };
    let exited = wait_until(Duration::from_secs(30), || {
        master.try_wait().expect("try_wait failed").is_some()
    });
    if !exited {
        let _ = master.kill();
        panic!("datanoded did not exit in time");
    }
}

#[test]
fn killed_worker_is_respawned_outside_the_window() {
    init();
    let pid_file = pid_file("respawn");
    let _ = std::fs::remove_file(&pid_file);

    // A one-second window: anything that survives a couple of seconds is
    // eligible for respawn.
    let mut master = spawn_datanoded(&pid_file, 2, 1);
    assert!(
        wait_until(Duration::from_secs(10), || children_of(master.id()).len() == 2),
        "workers never came up"
    );

    // Let the workers outlive the crash-loop window before killing one.
    std::thread::sleep(Duration::from_secs(3));
    let before = children_of(master.id());
    let victim = *before.iter().next().unwrap();
    assert_eq!(unsafe { libc::kill(victim, libc::SIGKILL) }, 0);

    // The supervisor must bring the slot back with a fresh process.
    assert!(
        wait_until(Duration::from_secs(10), || {
            let now = children_of(master.id());
            now.len() == 2 && !now.contains(&victim)
        }),
        "killed worker was not respawned"
    );

    shut_down(&mut master);
}

#[test]
fn crash_within_the_window_is_not_respawned() {
    init();
    let pid_file = pid_file("crash-loop");
    let _ = std::fs::remove_file(&pid_file);

    // Default-sized window: an immediately-killed worker counts as a
    // crash loop and must stay down.
    let mut master = spawn_datanoded(&pid_file, 2, 60);
    assert!(
        wait_until(Duration::from_secs(10), || children_of(master.id()).len() == 2),
        "workers never came up"
    );

    let victim = *children_of(master.id()).iter().next().unwrap();
    assert_eq!(unsafe { libc::kill(victim, libc::SIGKILL) }, 0);

    assert!(
        wait_until(Duration::from_secs(5), || children_of(master.id()).len() == 1),
        "killed worker never disappeared"
    );
    // Give the supervisor time to (wrongly) respawn, then re-check.
    std::thread::sleep(Duration::from_secs(2));
    assert_eq!(
        children_of(master.id()).len(),
        1,
        "crash-looping worker was respawned"
    );

    shut_down(&mut master);
}
