use std::{
    io::Write,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream},
    time::{Duration, Instant},
};

use diag_common::Reactor;
use diag_router::{command::key, Router, RouterOptions, Token};
use diag_transport::Listener;

use crate::{expect_frames, frame, turns};

fn wait_for_clients(reactor: &mut Reactor<Token>, router: &mut Router, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(1);
    while router.client_count() != count && Instant::now() < deadline {
        turns(reactor, router, 1);
    }
    assert_eq!(router.client_count(), count);
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_nonblocking(true).unwrap();
    stream
}

#[test]
fn listeners_are_independent() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut reactor = Reactor::new().unwrap();
    let mut router = Router::new(RouterOptions::default());
    router.commands().register(key(0x00), |reply, req| reply.send(req));

    let first = Listener::tcp4(Ipv4Addr::LOCALHOST, 0).unwrap();
    let second = match Listener::tcp6(Ipv6Addr::LOCALHOST, 0) {
        Ok(listener) => listener,
        Err(e) => {
            // Hosts without an IPv6 loopback cannot run this test.
            eprintln!("skipping, no ipv6 loopback: {e}");
            return;
        }
    };
    let first_addr = first.local_addr().unwrap();
    let mut a = connect(first_addr);
    let mut b = connect(second.local_addr().unwrap());
    router.add_listener(&mut reactor, first).unwrap();
    router.add_listener(&mut reactor, second).unwrap();

    wait_for_clients(&mut reactor, &mut router, 2);

    // Losing one connection leaves the other listener and its client untouched.
    drop(a);
    wait_for_clients(&mut reactor, &mut router, 1);

    b.write_all(&frame(&[0x00, 0x42])).unwrap();
    let frames = expect_frames(&mut reactor, &mut router, &mut b, 1);
    assert_eq!(frames, vec![vec![0x00, 0x42]]);

    // Both listeners keep accepting.
    a = connect(first_addr);
    wait_for_clients(&mut reactor, &mut router, 2);
    a.write_all(&frame(&[0x00, 0x43])).unwrap();
    let frames = expect_frames(&mut reactor, &mut router, &mut a, 1);
    assert_eq!(frames, vec![vec![0x00, 0x43]]);
}
