use datanode_core::{
    ConnPool, DispatchMode, Direction, Firing, Reactor, RegisterOption, Token, Worker,
};

mod util;

use util::{init, FdPair};

fn nop_handler(_: &mut Worker, _: Token, _: Direction) {}

fn setup(capacity: usize) -> (Reactor, ConnPool) {
    init();
    (
        Reactor::new(capacity).expect("unable to create reactor"),
        ConnPool::with_capacity(capacity),
    )
}

#[test]
fn paired_directions_share_one_registration() {
    let (mut reactor, mut pool) = setup(8);
    let pair = FdPair::new();
    let token = pool.admit_borrowed(pair.left).unwrap();

    // Read first: a fresh registration. Write second: if this issued
    // another add the kernel would refuse it with EEXIST, so success here
    // means the reactor modified the existing registration.
    {
        let conn = pool.get_mut(token).unwrap();
        reactor.add(conn, token, Direction::Read, RegisterOption::Level).unwrap();
        reactor.add(conn, token, Direction::Write, RegisterOption::Level).unwrap();
        assert!(conn.read.active);
        assert!(conn.write.active);
    }

    // Demote to write-only, then drop the registration entirely.
    {
        let conn = pool.get_mut(token).unwrap();
        reactor.remove(conn, token, Direction::Read, false).unwrap();
        assert!(!conn.read.active);
        assert!(conn.write.active);
        reactor.remove(conn, token, Direction::Write, false).unwrap();
        assert!(!conn.write.active);
    }

    // After a full delete a fresh add must succeed; it would fail with
    // ENOENT if the reactor had tried to modify instead.
    {
        let conn = pool.get_mut(token).unwrap();
        reactor.add(conn, token, Direction::Read, RegisterOption::Level).unwrap();
    }
}

#[test]
fn remove_on_closing_descriptor_skips_the_syscall() {
    let (mut reactor, mut pool) = setup(8);
    let pair = FdPair::new();
    let token = pool.admit_borrowed(pair.left).unwrap();

    let conn = pool.get_mut(token).unwrap();
    reactor.add(conn, token, Direction::Read, RegisterOption::Level).unwrap();

    // With `closing` the reactor only clears the active flag; removing a
    // descriptor that was never registered would otherwise fail.
    reactor.remove(conn, token, Direction::Read, true).unwrap();
    assert!(!conn.read.active);
    reactor.remove(conn, token, Direction::Write, true).unwrap();
}

#[test]
fn readiness_is_collected_inline() {
    let (mut reactor, mut pool) = setup(8);
    let pair = FdPair::new();
    let token = pool.admit_borrowed(pair.left).unwrap();

    {
        let conn = pool.get_mut(token).unwrap();
        conn.read.handler = Some(nop_handler);
        reactor.add(conn, token, Direction::Read, RegisterOption::Level).unwrap();
    }

    let mut sink = Vec::new();
    pair.make_left_readable(b"x");
    reactor
        .process(&mut pool, &mut sink, Some(500), DispatchMode::Inline)
        .unwrap();

    assert_eq!(sink, vec![Firing { token, direction: Direction::Read }]);
    assert!(pool.get(token).unwrap().read.ready);
    assert!(reactor.pop_accept().is_none());
    assert!(reactor.pop_posted().is_none());
}

#[test]
fn zero_timeout_polls_without_blocking() {
    let (mut reactor, mut pool) = setup(8);
    let mut sink = Vec::new();
    let n = reactor
        .process(&mut pool, &mut sink, Some(0), DispatchMode::Inline)
        .unwrap();
    assert_eq!(n, 0);
    assert!(sink.is_empty());
}

#[test]
fn stale_generation_is_dropped_without_dispatch() {
    let (mut reactor, mut pool) = setup(8);
    let stale = FdPair::new();
    let fresh = FdPair::new();

    // Register and make readable, then release the slot without closing
    // the descriptor: the kernel still holds the old registration.
    let token = pool.admit_borrowed(stale.left).unwrap();
    {
        let conn = pool.get_mut(token).unwrap();
        conn.read.handler = Some(nop_handler);
        reactor.add(conn, token, Direction::Read, RegisterOption::Level).unwrap();
    }
    stale.make_left_readable(b"x");
    pool.release(token);

    // The slot is reused by a different descriptor with a new generation.
    let reused = pool.admit_borrowed(fresh.left).unwrap();
    assert_eq!(reused, token);
    pool.get_mut(reused).unwrap().read.handler = Some(nop_handler);

    // The pending readiness result carries the old generation and must be
    // discarded without firing and without touching the new occupant.
    let mut sink = Vec::new();
    reactor
        .process(&mut pool, &mut sink, Some(500), DispatchMode::Inline)
        .unwrap();
    assert!(sink.is_empty());
    assert!(!pool.get(reused).unwrap().read.ready);
}

#[test]
fn accept_events_queue_ahead_of_general_events() {
    let (mut reactor, mut pool) = setup(8);
    let listener_like = FdPair::new();
    let client_like = FdPair::new();

    let accept_token = pool.admit_borrowed(listener_like.left).unwrap();
    {
        let conn = pool.get_mut(accept_token).unwrap();
        conn.read.accept = true;
        conn.read.handler = Some(nop_handler);
        reactor.add(conn, accept_token, Direction::Read, RegisterOption::Level).unwrap();
    }

    let client_token = pool.admit_borrowed(client_like.left).unwrap();
    {
        let conn = pool.get_mut(client_token).unwrap();
        conn.read.handler = Some(nop_handler);
        reactor.add(conn, client_token, Direction::Read, RegisterOption::Level).unwrap();
    }

    // Make the general descriptor ready first; queue routing must still
    // put the accept event in the dedicated queue.
    client_like.make_left_readable(b"data");
    listener_like.make_left_readable(b"conn");

    let mut sink = Vec::new();
    reactor
        .process(&mut pool, &mut sink, Some(500), DispatchMode::Posted)
        .unwrap();

    assert!(sink.is_empty());
    assert_eq!(
        reactor.pop_accept(),
        Some(Firing { token: accept_token, direction: Direction::Read })
    );
    assert!(reactor.pop_accept().is_none());
    assert_eq!(
        reactor.pop_posted(),
        Some(Firing { token: client_token, direction: Direction::Read })
    );
    assert!(reactor.pop_posted().is_none());
}

#[test]
fn peer_hangup_fires_both_directions() {
    let (mut reactor, mut pool) = setup(8);
    let mut pair = FdPair::new();
    let token = pool.admit_borrowed(pair.left).unwrap();

    {
        let conn = pool.get_mut(token).unwrap();
        conn.read.handler = Some(nop_handler);
        conn.write.handler = Some(nop_handler);
        reactor.add(conn, token, Direction::Read, RegisterOption::Level).unwrap();
        reactor.add(conn, token, Direction::Write, RegisterOption::Level).unwrap();
    }

    // Closing the peer produces a hang-up condition; both active events
    // must observe it so at least one handler sees the failure.
    assert_eq!(unsafe { libc::close(pair.right) }, 0);
    pair.right = -1;

    let mut sink = Vec::new();
    reactor
        .process(&mut pool, &mut sink, Some(500), DispatchMode::Inline)
        .unwrap();

    assert!(sink.contains(&Firing { token, direction: Direction::Read }));
    assert!(sink.contains(&Firing { token, direction: Direction::Write }));
}
