//! Datagram receive through the loop.

use std::cell::RefCell;
use std::mem;
use std::net::{Ipv4Addr, UdpSocket};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use ringloop::{Buffer, EventLoop, Socket, StopSignal};

/// The port a socket is actually bound to.
fn local_port(socket: Socket) -> u16 {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(
            socket.raw(),
            (&mut addr as *mut libc::sockaddr_in).cast(),
            &mut len,
        )
    };
    assert_eq!(rc, 0);
    u16::from_be(addr.sin_port)
}

#[test]
fn udp_receiver_gets_datagrams() {
    let mut event_loop = EventLoop::new().unwrap();
    let stop = StopSignal::new();

    let receiver = event_loop
        .udp_receiver(Ipv4Addr::LOCALHOST, 0)
        .unwrap();
    let port = local_port(receiver);

    let messages = Rc::new(RefCell::new(Vec::<String>::new()));
    let sink = messages.clone();
    event_loop
        .receive(receiver, Buffer::allocate(128), move |ctx, response| {
            sink.borrow_mut()
                .push(String::from_utf8_lossy(response.data).into_owned());
            if sink.borrow().len() == 2 {
                ctx.stop.request_stop();
                return false;
            }
            true
        })
        .unwrap();

    let sender = thread::spawn(move || {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.send_to(b"first datagram", ("127.0.0.1", port)).unwrap();
        thread::sleep(Duration::from_millis(50));
        socket.send_to(b"second datagram", ("127.0.0.1", port)).unwrap();
    });

    event_loop.run(&stop).unwrap();
    sender.join().unwrap();

    let messages = messages.borrow();
    assert_eq!(messages.as_slice(), ["first datagram", "second datagram"]);
    assert_eq!(event_loop.pending_operations(), 0);
}
