use std::io::Write;

use diag_common::Reactor;
use diag_router::{command::key, Router, RouterOptions};

use crate::{expect_frames, expect_messages, frame, read_available, seqpacket_pair, stream_pair, turns};

/// Registers a handler answering command 0x00 with a fixed version string.
fn with_version_handler(router: &mut Router) {
    router.commands().register(key(0x00), |reply, req| {
        let mut resp = req.to_vec();
        resp.extend_from_slice(b"v1");
        reply.send(&resp);
    });
}

#[test]
fn local_handler_replies_to_sender_only() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut reactor = Reactor::new().unwrap();
    let mut router = Router::new(RouterOptions::default());
    with_version_handler(&mut router);

    let (a, mut tool_a) = stream_pair();
    let (b, mut tool_b) = stream_pair();
    let a = router.add_client("a", a, None, true);
    let b = router.add_client("b", b, None, true);
    router.enable_client(&mut reactor, a).unwrap();
    router.enable_client(&mut reactor, b).unwrap();

    tool_a.write_all(&frame(&[0x00])).unwrap();

    let frames = expect_frames(&mut reactor, &mut router, &mut tool_a, 1);
    assert_eq!(frames, vec![b"\x00v1".to_vec()]);
    assert!(read_available(&mut tool_b).is_empty());

    // The reply was written, so nothing is outstanding anymore.
    assert_eq!(router.client_flow(a).unwrap().outstanding(), 0);
}

#[test]
fn unmatched_frames_are_forwarded_to_peripheral() {
    let mut reactor = Reactor::new().unwrap();
    let mut router = Router::new(RouterOptions::default());
    with_version_handler(&mut router);

    let (periph, mut modem) = seqpacket_pair();
    router.set_peripheral(&mut reactor, periph).unwrap();

    let (fd, mut tool) = stream_pair();
    let id = router.add_client("tool", fd, None, true);
    router.enable_client(&mut reactor, id).unwrap();

    let mut stream = frame(&[0x4b, 0x12, 0x01, 0x00]);
    stream.extend(frame(&[0x7d, 0x7e]));
    tool.write_all(&stream).unwrap();

    // Forwarded unmodified, one message per frame.
    let msgs = expect_messages(&mut reactor, &mut router, &mut modem, 2);
    assert_eq!(msgs, vec![vec![0x4b, 0x12, 0x01, 0x00], vec![0x7d, 0x7e]]);
    assert_eq!(router.client_flow(id).unwrap().outstanding(), 0);
}

#[test]
fn frames_are_dropped_without_peripheral() {
    let mut reactor = Reactor::new().unwrap();
    let mut router = Router::new(RouterOptions::default());

    let (fd, mut tool) = stream_pair();
    let id = router.add_client("tool", fd, None, true);
    router.enable_client(&mut reactor, id).unwrap();

    tool.write_all(&frame(&[0x1d])).unwrap();
    turns(&mut reactor, &mut router, 3);

    assert_eq!(router.client_count(), 1);
    assert_eq!(router.client_flow(id).unwrap().outstanding(), 0);
}

#[test]
fn peripheral_output_is_broadcast() {
    let mut reactor = Reactor::new().unwrap();
    let mut router = Router::new(RouterOptions::default());

    let (periph, mut modem) = seqpacket_pair();
    router.set_peripheral(&mut reactor, periph).unwrap();

    let mut tools = Vec::new();
    for label in ["a", "b"] {
        let (fd, tool) = stream_pair();
        let id = router.add_client(label, fd, None, true);
        router.enable_client(&mut reactor, id).unwrap();
        tools.push(tool);
    }

    // A control client receives the bare message.
    let (ctl, mut ctl_tool) = seqpacket_pair();
    let ctl = router.add_client("control", ctl, None, false);
    router.enable_client(&mut reactor, ctl).unwrap();

    modem.write_all(&[0x10, 0x00, 0x7e]).unwrap();

    for tool in &mut tools {
        let frames = expect_frames(&mut reactor, &mut router, tool, 1);
        assert_eq!(frames, vec![vec![0x10, 0x00, 0x7e]]);
    }
    let msgs = expect_messages(&mut reactor, &mut router, &mut ctl_tool, 1);
    assert_eq!(msgs, vec![vec![0x10, 0x00, 0x7e]]);

    assert_eq!(router.peripheral_flow().unwrap().outstanding(), 0);
}

#[test]
fn corrupted_frame_is_dropped_and_stream_resyncs() {
    let mut reactor = Reactor::new().unwrap();
    let mut router = Router::new(RouterOptions::default());
    with_version_handler(&mut router);

    let (fd, mut tool) = stream_pair();
    let id = router.add_client("tool", fd, None, true);
    router.enable_client(&mut reactor, id).unwrap();

    let mut bad = frame(&[0x00, 0x01]);
    let n = bad.len();
    bad[n - 2] ^= 0x01;

    let mut stream = bad;
    stream.extend(frame(&[0x00, 0x02]));
    tool.write_all(&stream).unwrap();

    let frames = expect_frames(&mut reactor, &mut router, &mut tool, 1);
    assert_eq!(frames, vec![b"\x00\x02v1".to_vec()]);

    turns(&mut reactor, &mut router, 3);
    assert!(read_available(&mut tool).is_empty());
    assert_eq!(router.client_count(), 1);
}

#[test]
fn closed_client_is_torn_down() {
    let mut reactor = Reactor::new().unwrap();
    let mut router = Router::new(RouterOptions::default());

    let (periph, _modem) = seqpacket_pair();
    router.set_peripheral(&mut reactor, periph).unwrap();

    let (fd, tool) = stream_pair();
    let id = router.add_client("tool", fd, None, true);
    router.enable_client(&mut reactor, id).unwrap();
    assert_eq!(reactor.len(), 4);

    drop(tool);
    turns(&mut reactor, &mut router, 3);

    assert_eq!(router.client_count(), 0);
    assert_eq!(reactor.len(), 2);
}

#[test]
fn peripheral_loss_keeps_local_commands_working() {
    let mut reactor = Reactor::new().unwrap();
    let mut router = Router::new(RouterOptions::default());
    with_version_handler(&mut router);

    let (periph, modem) = seqpacket_pair();
    router.set_peripheral(&mut reactor, periph).unwrap();

    let (fd, mut tool) = stream_pair();
    let id = router.add_client("tool", fd, None, true);
    router.enable_client(&mut reactor, id).unwrap();

    drop(modem);
    turns(&mut reactor, &mut router, 3);
    assert!(!router.has_peripheral());

    tool.write_all(&frame(&[0x00])).unwrap();
    let frames = expect_frames(&mut reactor, &mut router, &mut tool, 1);
    assert_eq!(frames, vec![b"\x00v1".to_vec()]);
}
