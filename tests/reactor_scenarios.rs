//! End-to-end scenarios exercised against the real platform backend: a TCP
//! echo round-trip, one-shot and repeating timers, and
//! cross-thread `kick()`.
//!
//! All mutation of the descriptor table (`add`/`set_interest`) happens on
//! the reactor's own thread, either before `start()` is called (while
//! `owner_thread` is still unset) or from inside a callback — mirroring the
//! single-owner-thread affinity the reactor enforces.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use netcore::{EventKind, Interest, Mode, Reactor, RegistrationToken};

fn spawn_reactor(reactor: Arc<Reactor>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        reactor.start().unwrap();
    })
}

#[test]
fn tcp_echo_close_fires_once() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();

    let reactor = Arc::new(Reactor::new(64).unwrap());
    let close_count = Arc::new(AtomicUsize::new(0));
    let echoed = Arc::new(AtomicUsize::new(0));

    let mut listen_fd: RawFd = listener.as_raw_fd();
    std::mem::forget(listener);

    let r_for_accept = Arc::clone(&reactor);
    let close_count2 = Arc::clone(&close_count);
    let echoed2 = Arc::clone(&echoed);
    reactor
        .add(
            RegistrationToken(100),
            &mut listen_fd,
            Interest::none().set(EventKind::Read, Mode::Enabled),
            Box::new(move |fd, kind| {
                if kind != EventKind::Read {
                    return;
                }
                loop {
                    // SAFETY: fd is the listening socket registered above.
                    let client = unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
                    if client < 0 {
                        break;
                    }
                    // SAFETY: client is a freshly accepted, owned fd.
                    unsafe {
                        let flags = libc::fcntl(client, libc::F_GETFL, 0);
                        libc::fcntl(client, libc::F_SETFL, flags | libc::O_NONBLOCK);
                    }
                    let close_count3 = Arc::clone(&close_count2);
                    let echoed3 = Arc::clone(&echoed2);
                    let mut client_fd = client;
                    r_for_accept
                        .add(
                            RegistrationToken(101),
                            &mut client_fd,
                            Interest::none()
                                .set(EventKind::Read, Mode::Enabled)
                                .set(EventKind::Close, Mode::Enabled),
                            Box::new(move |fd, kind| match kind {
                                EventKind::Read => {
                                    let mut buf = [0_u8; 64];
                                    // SAFETY: fd is the stream registered above.
                                    let n = unsafe {
                                        libc::read(fd, buf.as_mut_ptr().cast(), buf.len())
                                    };
                                    if n > 0 {
                                        // SAFETY: buf[..n] was just filled above.
                                        unsafe {
                                            libc::write(fd, buf.as_ptr().cast(), n as usize);
                                        }
                                        echoed3.fetch_add(1, Ordering::SeqCst);
                                    }
                                }
                                EventKind::Close => {
                                    close_count3.fetch_add(1, Ordering::SeqCst);
                                }
                                _ => {}
                            }),
                            0,
                            false,
                        )
                        .unwrap();
                }
            }),
            0,
            false,
        )
        .unwrap();

    let handle = spawn_reactor(Arc::clone(&reactor));
    thread::sleep(Duration::from_millis(20));

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"ping").unwrap();
    let mut buf = [0_u8; 4];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");
    drop(client);
    thread::sleep(Duration::from_millis(100));

    reactor.stop();
    handle.join().unwrap();

    assert_eq!(echoed.load(Ordering::SeqCst), 1);
    assert_eq!(close_count.load(Ordering::SeqCst), 1);
}

#[test]
fn one_shot_timer_fires_exactly_once() {
    let reactor = Arc::new(Reactor::new(16).unwrap());
    let fires = Arc::new(AtomicU32::new(0));
    let fires2 = Arc::clone(&fires);

    let mut fd: RawFd = -1;
    reactor
        .add(
            RegistrationToken(1),
            &mut fd,
            Interest::none().set(EventKind::Timer, Mode::Enabled),
            Box::new(move |_, kind| {
                if kind == EventKind::Timer {
                    fires2.fetch_add(1, Ordering::SeqCst);
                }
            }),
            50_000_000,
            false,
        )
        .unwrap();

    let handle = spawn_reactor(Arc::clone(&reactor));
    thread::sleep(Duration::from_millis(250));
    reactor.stop();
    handle.join().unwrap();

    assert_eq!(fires.load(Ordering::SeqCst), 1);
}

#[test]
fn repeating_timer_disables_itself_after_three_fires() {
    let reactor = Arc::new(Reactor::new(16).unwrap());
    let fires = Arc::new(AtomicU32::new(0));
    let fires2 = Arc::clone(&fires);
    let r_for_disable = Arc::clone(&reactor);

    let mut fd: RawFd = -1;
    reactor
        .add(
            RegistrationToken(7),
            &mut fd,
            Interest::none().set(EventKind::Timer, Mode::Enabled),
            Box::new(move |fd, kind| {
                if kind != EventKind::Timer {
                    return;
                }
                let count = fires2.fetch_add(1, Ordering::SeqCst) + 1;
                if count == 3 {
                    r_for_disable
                        .set_interest(RegistrationToken(7), fd, EventKind::Timer, Mode::Disabled)
                        .unwrap();
                }
            }),
            20_000_000,
            true,
        )
        .unwrap();

    let handle = spawn_reactor(Arc::clone(&reactor));
    thread::sleep(Duration::from_millis(250));
    let settled = fires.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(120));
    let after_wait = fires.load(Ordering::SeqCst);

    reactor.stop();
    handle.join().unwrap();

    assert_eq!(settled, 3);
    assert_eq!(after_wait, 3, "no further fires expected once Timer interest is disabled");
}

#[test]
fn kick_interrupts_wait_without_dropping_entries() {
    let reactor = Arc::new(Reactor::new(16).unwrap());
    let fires = Arc::new(AtomicU32::new(0));
    let fires2 = Arc::clone(&fires);

    let mut fd: RawFd = -1;
    reactor
        .add(
            RegistrationToken(3),
            &mut fd,
            Interest::none().set(EventKind::Timer, Mode::Enabled),
            Box::new(move |_, kind| {
                if kind == EventKind::Timer {
                    fires2.fetch_add(1, Ordering::SeqCst);
                }
            }),
            500_000_000,
            false,
        )
        .unwrap();

    let handle = spawn_reactor(Arc::clone(&reactor));
    thread::sleep(Duration::from_millis(20));
    reactor.kick();
    thread::sleep(Duration::from_millis(20));
    assert!(reactor.is_running());
    assert_eq!(fires.load(Ordering::SeqCst), 0, "kick must not fire the timer early");

    reactor.stop();
    handle.join().unwrap();
}
