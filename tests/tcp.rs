//! TCP scenarios: connect/accept/echo, guarded broadcast, disconnect
//! retirement, and buffer fan-out accounting.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpStream};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use ringloop::{Buffer, EventLoop, RemoteAddr, Socket, StopSignal};

#[test]
fn connect_accept_echo_roundtrip() {
    let mut event_loop = EventLoop::new().unwrap();
    let stop = StopSignal::new();

    let listener = event_loop.tcp_listen(Ipv4Addr::LOCALHOST, 0, 10).unwrap();
    let server_addr = listener.address();

    // Server side: accept one client and echo everything back.
    event_loop
        .accept(&listener, move |ctx, response| {
            assert!(response.client.is_valid());
            ctx.event_loop
                .receive(response.client, Buffer::allocate(1024), |ctx, response| {
                    if response.data.is_empty() {
                        return false;
                    }
                    let reply = Buffer::from_bytes(response.data);
                    ctx.event_loop
                        .send(response.client, reply, |_ctx, _response| {})
                        .unwrap();
                    true
                })
                .unwrap();
            false
        })
        .unwrap();

    // Client side, in the same loop.
    let echoed = Rc::new(RefCell::new(String::new()));
    let seen = echoed.clone();
    event_loop
        .connect(Ipv4Addr::LOCALHOST, server_addr.port(), move |ctx, response| {
            assert!(response.error.is_none(), "connect: {:?}", response.error);
            assert_eq!(response.server, RemoteAddr::Inet(server_addr));

            let client = response.client;
            ctx.event_loop
                .send(client, Buffer::from_bytes(b"ping\n"), |_ctx, _response| {})
                .unwrap();

            let seen = seen.clone();
            ctx.event_loop
                .receive(client, Buffer::allocate(64), move |ctx, response| {
                    seen.borrow_mut()
                        .push_str(&String::from_utf8_lossy(response.data));
                    if seen.borrow().contains('\n') {
                        ctx.stop.request_stop();
                        false
                    } else {
                        true
                    }
                })
                .unwrap();
        })
        .unwrap();

    event_loop.run(&stop).unwrap();
    assert_eq!(echoed.borrow().as_str(), "ping\n");
}

#[test]
fn broadcast_reaches_only_other_clients() {
    let mut event_loop = EventLoop::new().unwrap();
    let stop = StopSignal::new();

    let listener = event_loop.tcp_listen(Ipv4Addr::LOCALHOST, 0, 10).unwrap();
    let port = listener.address().port();
    let dispatcher = event_loop.dispatcher();

    let clients: Rc<RefCell<Vec<Socket>>> = Rc::new(RefCell::new(Vec::new()));

    let accepted = clients.clone();
    event_loop
        .accept(&listener, move |ctx, response| {
            accepted.borrow_mut().push(response.client);

            let peers = accepted.clone();
            ctx.event_loop
                .receive(response.client, Buffer::allocate(1024), move |ctx, response| {
                    if response.data.is_empty() {
                        peers.borrow_mut().retain(|&s| s != response.client);
                        return false;
                    }
                    let text = String::from_utf8_lossy(response.data);
                    let out = Buffer::from_bytes(format!("Other: {text}").as_bytes());

                    let mut batch = ctx.event_loop.batch();
                    for &other in peers.borrow().iter() {
                        if other != response.client {
                            batch.send(other, out.clone(), |_ctx, _response| {}).unwrap();
                        }
                    }
                    assert_eq!(batch.pending(), peers.borrow().len() - 1);
                    true
                })
                .unwrap();
            true
        })
        .unwrap();

    let stop_remotely = stop.clone();
    let sender = thread::spawn(move || {
        let mut first = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut second = TcpStream::connect(("127.0.0.1", port)).unwrap();

        // Give the loop time to accept both and arm their receives.
        thread::sleep(Duration::from_millis(300));

        first.write_all(b"hi\n").unwrap();

        let mut relayed = [0u8; 10];
        second.read_exact(&mut relayed).unwrap();
        assert_eq!(&relayed, b"Other: hi\n");

        // The sender must not hear its own message back.
        first
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let mut scratch = [0u8; 16];
        match first.read(&mut scratch) {
            Ok(n) => panic!("sender received {n} unexpected bytes"),
            Err(e) => assert!(matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            )),
        }

        dispatcher.dispatch(move |_event_loop| stop_remotely.request_stop());
    });

    event_loop.run(&stop).unwrap();
    sender.join().unwrap();
}

#[test]
fn zero_result_overrides_resubmit_vote() {
    let mut event_loop = EventLoop::new().unwrap();
    let stop = StopSignal::new();

    let listener = event_loop.tcp_listen(Ipv4Addr::LOCALHOST, 0, 10).unwrap();
    let port = listener.address().port();

    let saw_disconnect = Rc::new(RefCell::new(false));

    let flag = saw_disconnect.clone();
    event_loop
        .accept(&listener, move |ctx, response| {
            let flag = flag.clone();
            ctx.event_loop
                .receive(response.client, Buffer::allocate(256), move |ctx, response| {
                    if response.data.is_empty() {
                        *flag.borrow_mut() = true;
                        ctx.stop.request_stop();
                    }
                    // Always vote to keep receiving; the runtime must retire
                    // the operation anyway once the peer disconnected.
                    true
                })
                .unwrap();
            false
        })
        .unwrap();

    let peer = thread::spawn(move || {
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        thread::sleep(Duration::from_millis(100));
        drop(stream);
    });

    event_loop.run(&stop).unwrap();
    peer.join().unwrap();

    assert!(*saw_disconnect.borrow());
    assert_eq!(
        event_loop.pending_operations(),
        0,
        "disconnected receive must be retired despite its resubmit vote"
    );
}

#[test]
fn broadcast_buffer_returns_to_sole_handle() {
    const CLIENTS: usize = 10;

    let mut event_loop = EventLoop::new().unwrap();
    let stop = StopSignal::new();

    let listener = event_loop.tcp_listen(Ipv4Addr::LOCALHOST, 0, 16).unwrap();
    let port = listener.address().port();

    let clients: Rc<RefCell<Vec<Socket>>> = Rc::new(RefCell::new(Vec::new()));
    let keeper: Rc<RefCell<Option<Buffer>>> = Rc::new(RefCell::new(None));
    let completed = Rc::new(RefCell::new(0usize));

    let accepted = clients.clone();
    let kept = keeper.clone();
    let sends_done = completed.clone();
    event_loop
        .accept(&listener, move |ctx, response| {
            accepted.borrow_mut().push(response.client);
            if accepted.borrow().len() < CLIENTS {
                return true;
            }

            let out = Buffer::from_bytes(b"Hello, All!\n");
            *kept.borrow_mut() = Some(out.clone());

            let mut batch = ctx.event_loop.batch();
            for &client in accepted.borrow().iter() {
                let sends_done = sends_done.clone();
                batch
                    .send(client, out.clone(), move |ctx, response| {
                        assert_eq!(response.size, 12);
                        *sends_done.borrow_mut() += 1;
                        if *sends_done.borrow() == CLIENTS {
                            ctx.stop.request_stop();
                        }
                    })
                    .unwrap();
            }
            false
        })
        .unwrap();

    let readers = thread::spawn(move || {
        let mut streams: Vec<TcpStream> = (0..CLIENTS)
            .map(|_| TcpStream::connect(("127.0.0.1", port)).unwrap())
            .collect();
        for stream in &mut streams {
            let mut greeting = [0u8; 12];
            stream.read_exact(&mut greeting).unwrap();
            assert_eq!(&greeting, b"Hello, All!\n");
        }
    });

    event_loop.run(&stop).unwrap();
    readers.join().unwrap();

    assert_eq!(*completed.borrow(), CLIENTS);
    assert_eq!(event_loop.pending_operations(), 0);

    // Every send completed and its record dropped; only the handle stored
    // before the fan-out remains.
    let buffer = keeper.borrow();
    assert_eq!(buffer.as_ref().unwrap().use_count(), 1);
}
