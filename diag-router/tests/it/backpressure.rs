use std::{io::Write, time::Duration};

use diag_common::{FlowOptions, Reactor};
use diag_router::{Router, RouterOptions};

use crate::{expect_frames, expect_messages, frame, seqpacket_pair, stream_pair, turns};

#[test]
fn throttled_client_stops_enqueueing_until_low_water() {
    let _ = tracing_subscriber::fmt::try_init();

    let flow = FlowOptions::default().high_water(2).low_water(1);
    let mut reactor = Reactor::new().unwrap();
    let mut router = Router::new(RouterOptions::default().flow(flow));

    let (periph, mut modem) = seqpacket_pair();
    router.set_peripheral(&mut reactor, periph).unwrap();

    let (fd, mut tool) = stream_pair();
    let id = router.add_client("tool", fd, None, true);
    router.enable_client(&mut reactor, id).unwrap();

    let mut stream = Vec::new();
    for i in 0..5u8 {
        stream.extend(frame(&[0x4b, i]));
    }
    tool.write_all(&stream).unwrap();

    // The first turn reads every frame but stops dispatching once the flow exceeds its
    // high-water mark.
    turns(&mut reactor, &mut router, 1);
    let client_flow = router.client_flow(id).unwrap().clone();
    assert_eq!(client_flow.outstanding(), 3);
    assert!(client_flow.is_throttled());

    // Draining the peripheral queue lifts the throttle and the rest follows in order.
    let msgs = expect_messages(&mut reactor, &mut router, &mut modem, 5);
    let expected: Vec<Vec<u8>> = (0..5u8).map(|i| vec![0x4b, i]).collect();
    assert_eq!(msgs, expected);

    turns(&mut reactor, &mut router, 2);
    assert_eq!(client_flow.outstanding(), 0);
    assert!(!client_flow.is_throttled());
}

#[test]
fn queued_broadcasts_throttle_the_peripheral() {
    let flow = FlowOptions::default().high_water(2).low_water(1);
    let mut reactor = Reactor::new().unwrap();
    let mut router = Router::new(RouterOptions::default().flow(flow));

    let (periph, mut modem) = seqpacket_pair();
    router.set_peripheral(&mut reactor, periph).unwrap();

    let (fd, mut tool) = stream_pair();
    let id = router.add_client("tool", fd, None, true);
    router.enable_client(&mut reactor, id).unwrap();

    for _ in 0..3 {
        router.broadcast(&mut reactor, &[0x10, 0x00]);
    }
    let periph_flow = router.peripheral_flow().unwrap().clone();
    assert_eq!(periph_flow.outstanding(), 3);
    assert!(periph_flow.is_throttled());

    // While throttled the peripheral is not read; only the client's write watch runs.
    modem.write_all(&[0x10, 0xff]).unwrap();
    assert_eq!(reactor.turn_timeout(&mut router, Duration::from_secs(1)).unwrap(), 1);
    assert_eq!(periph_flow.outstanding(), 0);
    assert!(!periph_flow.is_throttled());

    let frames = expect_frames(&mut reactor, &mut router, &mut tool, 4);
    assert_eq!(
        frames,
        vec![vec![0x10, 0x00], vec![0x10, 0x00], vec![0x10, 0x00], vec![0x10, 0xff]]
    );
}
