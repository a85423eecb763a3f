use crate::config::{Readiness, XskConfig};
use crate::context::Context;
use crate::error::RingError;
use crate::poll::Interest;
use crate::tests::peer::{loopback, shared_pair, small_config};

fn ring_state(lb: &mut crate::tests::peer::Loopback) -> [u32; 8] {
    let rx = &lb.socket.rx;
    let tx = &lb.socket.tx;
    let mut umem = lb.socket.pool.lock();
    let (fp, fc) = (umem.fill_ring().producer(), umem.fill_ring().consumer());
    let (cp, cc) = (
        umem.completion_ring().producer(),
        umem.completion_ring().consumer(),
    );
    [
        rx.producer(),
        rx.consumer(),
        tx.producer(),
        tx.consumer(),
        fp,
        fc,
        cp,
        cc,
    ]
}

#[test]
fn test_transfer_outstanding_until_completed() {
    // ten frames: two lent for receive, eight for transmit, 16-slot transmit ring
    let config = XskConfig {
        frame_count: 10,
        fill_size: 2,
        rx_size: 2,
        tx_size: 16,
        completion_size: 16,
        ..XskConfig::default()
    };
    let mut lb = loopback(&config);
    assert_eq!(lb.socket.umem().free_frames(), 8);

    assert_eq!(lb.socket.transfer(b"hello").unwrap(), 0);
    assert_eq!(lb.socket.outstanding_tx(), 1);
    assert_eq!(lb.socket.umem().free_frames(), 7);
    // without need-wakeup every reclamation kicks
    assert_eq!(lb.kicks(), 1);

    let sent = lb.send_all();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].len, 5);
    assert_eq!(lb.socket.umem().packet(&sent[0]).unwrap(), b"hello");

    assert_eq!(lb.socket.complete_tx().unwrap(), 1);
    assert_eq!(lb.socket.outstanding_tx(), 0);
    assert_eq!(lb.socket.stats().tx_packets, 1);
    assert_eq!(lb.socket.umem().free_frames(), 8);
    assert_eq!(lb.kicks(), 1);

    // nothing outstanding: no kick, nothing claimed
    assert_eq!(lb.socket.complete_tx().unwrap(), 0);
    assert_eq!(lb.kicks(), 0);
}

#[test]
fn test_transfer_acknowledges_earlier_packets() {
    let mut lb = loopback(&small_config());
    lb.socket.transfer(b"one").unwrap();
    lb.send_all();
    assert_eq!(lb.socket.transfer(b"two").unwrap(), 1);
    assert_eq!(lb.socket.outstanding_tx(), 1);
}

#[test]
fn test_transfers_use_distinct_frames() {
    let mut lb = loopback(&small_config());
    lb.socket.transfer(b"first").unwrap();
    lb.socket.transfer(b"second").unwrap();
    let sent = lb.send_all();
    assert_eq!(sent.len(), 2);
    assert_ne!(sent[0].addr, sent[1].addr);
    let umem = lb.socket.umem();
    assert_eq!(umem.packet(&sent[0]).unwrap(), b"first");
    assert_eq!(umem.packet(&sent[1]).unwrap(), b"second");
}

#[test]
fn test_transfer_rejects_bad_lengths() {
    let mut lb = loopback(&small_config());
    assert!(matches!(lb.socket.transfer(b""), Err(RingError::InvalidLength)));
    let big = vec![0u8; 2049];
    assert!(matches!(lb.socket.transfer(&big), Err(RingError::InvalidLength)));
    assert_eq!(lb.socket.transfer(&big[..2048]).unwrap(), 0);

    let mut lb = loopback(&XskConfig {
        headroom: 256,
        ..small_config()
    });
    assert!(matches!(
        lb.socket.transfer(&big[..2048]),
        Err(RingError::InvalidLength)
    ));
    lb.socket.transfer(b"payload").unwrap();
    let sent = lb.send_all();
    assert_eq!(sent[0].addr % 2048, 256);
}

#[test]
fn test_transfer_ring_full_submits_nothing() {
    let config = XskConfig {
        tx_size: 2,
        ..small_config()
    };
    let mut lb = loopback(&config);
    lb.socket.transfer(b"a").unwrap();
    lb.socket.transfer(b"b").unwrap();
    let free = lb.socket.umem().free_frames();

    assert!(matches!(lb.socket.transfer(b"c"), Err(RingError::RingFull)));
    assert_eq!(lb.socket.tx.producer(), 2);
    assert_eq!(lb.socket.outstanding_tx(), 2);
    assert_eq!(lb.socket.umem().free_frames(), free);

    lb.send_all();
    assert_eq!(lb.socket.transfer(b"c").unwrap(), 1);
}

#[test]
fn test_transfer_without_free_frame() {
    let config = XskConfig {
        frame_count: 6,
        ..small_config()
    };
    let mut lb = loopback(&config);
    lb.socket.transfer(b"a").unwrap();
    lb.socket.transfer(b"b").unwrap();
    assert!(matches!(lb.socket.transfer(b"c"), Err(RingError::NoFreeFrame)));
    assert_eq!(lb.socket.outstanding_tx(), 2);

    lb.send_all();
    // the retry reclaims one frame, the closing pass the other
    assert_eq!(lb.socket.transfer(b"c").unwrap(), 2);
    assert_eq!(lb.socket.outstanding_tx(), 1);
}

#[test]
fn test_need_wakeup_kicks_only_on_request() {
    let config = XskConfig {
        need_wakeup: true,
        ..small_config()
    };
    let mut lb = loopback(&config);
    lb.socket.transfer(b"quiet").unwrap();
    assert_eq!(lb.kicks(), 0);

    lb.kernel.tx.set_flags(libc::XDP_RING_NEED_WAKEUP);
    lb.socket.transfer(b"loud").unwrap();
    assert_eq!(lb.kicks(), 1);
}

#[test]
fn test_kick_tolerates_full_peer() {
    let mut lb = loopback(&small_config());
    // fill the peer's queue until the kernel refuses more datagrams
    for _ in 0..4096 {
        lb.socket.kick().unwrap();
    }
    lb.socket.transfer(b"still fine").unwrap();
}

#[test]
fn test_transfer_succeeds_when_reclaim_kick_fails() {
    let crate::tests::peer::Loopback { mut socket, wire, .. } = loopback(&small_config());
    // the peer is gone, so the kick after submitting gets ECONNREFUSED
    drop(wire);
    assert_eq!(socket.transfer(b"x").unwrap(), 0);
    assert_eq!(socket.outstanding_tx(), 1);
    assert_eq!(socket.tx.producer(), 1);
}

#[test]
fn test_transfer_reports_kick_failure_before_submitting() {
    let config = XskConfig {
        frame_count: 5,
        ..small_config()
    };
    let crate::tests::peer::Loopback { mut socket, wire, .. } = loopback(&config);
    socket.transfer(b"only frame").unwrap();
    drop(wire);
    // no free frame: the retry pass kicks first and that error surfaces
    assert!(matches!(socket.transfer(b"x"), Err(RingError::Io(_))));
    assert_eq!(socket.tx.producer(), 1);
}

#[test]
fn test_empty_receive_wakes_kernel_on_request() {
    let config = XskConfig {
        need_wakeup: true,
        ..small_config()
    };
    let mut lb = loopback(&config);
    lb.wire.send(b"queued").unwrap();

    // flag down: the socket leaves its descriptor alone
    assert!(lb.socket.receive().unwrap().is_none());
    assert!(lb.socket.poll_ready(Interest::Receive).unwrap());

    // flag up: the zero-length recvfrom consumes the queued datagram
    lb.kernel.fill.set_flags(libc::XDP_RING_NEED_WAKEUP);
    assert!(lb.socket.receive().unwrap().is_none());
    assert!(!lb.socket.poll_ready(Interest::Receive).unwrap());

    lb.wire.send(b"queued").unwrap();
    assert_eq!(lb.socket.receive_batch(4, |_| {}).unwrap(), 0);
    assert!(!lb.socket.poll_ready(Interest::Receive).unwrap());
}

#[test]
fn test_receive_wakeup_ignored_without_need_wakeup() {
    let mut lb = loopback(&small_config());
    lb.wire.send(b"queued").unwrap();
    lb.kernel.fill.set_flags(libc::XDP_RING_NEED_WAKEUP);
    assert!(lb.socket.receive().unwrap().is_none());
    assert!(lb.socket.poll_ready(Interest::Receive).unwrap());
}

#[test]
fn test_context_receive_wakes_idle_sockets() {
    let config = XskConfig {
        need_wakeup: true,
        ..small_config()
    };
    let crate::tests::peer::Loopback {
        socket,
        kernel,
        wire,
    } = loopback(&config);
    kernel.fill.set_flags(libc::XDP_RING_NEED_WAKEUP);
    wire.send(b"queued").unwrap();
    let mut ctx = Context::from_sockets(vec![socket], Readiness::Always);
    assert!(ctx.receive().unwrap().is_none());
    assert!(!ctx.sockets()[0].poll_ready(Interest::Receive).unwrap());
}

#[test]
fn test_receive_recycles_on_drop() {
    let mut lb = loopback(&small_config());
    let desc = lb.deliver(b"ping");
    assert_eq!(lb.socket.rx_pending(), 1);
    {
        let packet = lb.socket.receive().unwrap().unwrap();
        assert_eq!(&packet[..], b"ping");
        assert_eq!(packet.desc(), desc);
    }
    assert_eq!(lb.socket.stats().rx_packets, 1);
    assert!(lb.socket.receive().unwrap().is_none());

    let lent = lb.drain_fill();
    // three never used, plus the recycled one at the back
    assert_eq!(lent.len(), 4);
    assert_eq!(*lent.last().unwrap(), desc.addr);
}

#[test]
fn test_receive_empty() {
    let mut lb = loopback(&small_config());
    assert!(lb.socket.receive().unwrap().is_none());
    let mut buf = [0u8; 16];
    assert_eq!(lb.socket.receive_into(&mut buf).unwrap(), 0);
    assert_eq!(lb.socket.receive_batch(4, |_| panic!("no packets")).unwrap(), 0);
}

#[test]
fn test_receive_into_truncates() {
    let mut lb = loopback(&small_config());
    lb.deliver(b"0123456789");
    let mut buf = [0u8; 4];
    assert_eq!(lb.socket.receive_into(&mut buf).unwrap(), 4);
    assert_eq!(&buf, b"0123");
    // the frame went back even though the copy was short
    assert_eq!(lb.drain_fill().len(), 4);
}

#[test]
fn test_receive_batch() {
    let config = XskConfig {
        batch_size: 4,
        ..small_config()
    };
    let mut lb = loopback(&config);
    let a = lb.deliver(b"a");
    let b = lb.deliver(b"bb");
    let c = lb.deliver(b"ccc");

    let mut seen = Vec::new();
    assert_eq!(lb.socket.receive_batch(8, |p| seen.push(p.to_vec())).unwrap(), 3);
    assert_eq!(seen, vec![b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()]);
    assert_eq!(lb.socket.stats().rx_packets, 3);

    let lent = lb.drain_fill();
    assert_eq!(&lent[lent.len() - 3..], &[a.addr, b.addr, c.addr]);
}

#[test]
fn test_receive_batch_is_capped_by_batch_size() {
    let mut lb = loopback(&small_config());
    lb.deliver(b"a");
    lb.deliver(b"b");
    assert_eq!(lb.socket.receive_batch(8, |_| {}).unwrap(), 1);
    assert_eq!(lb.socket.rx_pending(), 1);
}

#[test]
fn test_receive_rejects_foreign_descriptor() {
    let mut lb = loopback(&small_config());
    lb.kernel
        .rx
        .enqueue(&[crate::ring::XdpDesc::new(1 << 30, 10)])
        .unwrap();
    assert!(matches!(
        lb.socket.receive(),
        Err(RingError::InvalidAddress(_))
    ));
}

#[test]
fn test_readiness_probes_leave_rings_alone() {
    let mut lb = loopback(&small_config());
    lb.deliver(b"pending");
    lb.socket.transfer(b"out").unwrap();
    lb.kicks();
    let before = ring_state(&mut lb);

    assert!(!lb.socket.poll_ready(Interest::Receive).unwrap());
    assert!(lb.socket.poll_ready(Interest::Transfer).unwrap());
    lb.wire.send(b"wake").unwrap();
    for _ in 0..3 {
        assert!(lb.socket.poll_ready(Interest::Receive).unwrap());
        assert!(lb.socket.is_ready(Interest::Receive, Readiness::Poll).unwrap());
        assert!(lb.socket.is_ready(Interest::Transfer, Readiness::Always).unwrap());
    }
    assert_eq!(ring_state(&mut lb), before);
}

#[test]
fn test_poll_wait_times_out() {
    let lb = loopback(&small_config());
    let ready = lb
        .socket
        .poll_wait(Interest::Receive, Some(std::time::Duration::from_millis(10)))
        .unwrap();
    assert!(!ready);
}

#[test]
fn test_context_facade() {
    let lb = loopback(&small_config());
    let crate::tests::peer::Loopback {
        socket,
        mut kernel,
        wire,
    } = lb;
    let mut ctx = Context::from_sockets(vec![socket], Readiness::Poll);

    assert!(!ctx.can_receive());
    assert!(ctx.can_transfer());
    assert!(ctx.receive().unwrap().is_none());

    assert_eq!(ctx.transfer(b"frame").unwrap(), 0);
    assert_eq!(ctx.outstanding_tx(), 1);
    let mut out = [crate::ring::XdpDesc::default(); 4];
    assert_eq!(kernel.tx.dequeue(&mut out), 1);
    kernel.completion.enqueue(&[out[0].addr]).unwrap();
    assert_eq!(ctx.transfer(b"frame").unwrap(), 1);
    assert_eq!(ctx.stats().tx_packets, 1);

    let mut addr = [0u64];
    kernel.fill.dequeue(&mut addr);
    kernel
        .rx
        .enqueue(&[crate::ring::XdpDesc::new(addr[0], 0)])
        .unwrap();
    wire.send(b"wake").unwrap();
    assert!(ctx.can_receive());
    assert_eq!(ctx.receive().unwrap().map(|p| p.len()), Some(0));
    assert_eq!(ctx.stats().rx_packets, 1);

    drop(kernel);
    ctx.close().unwrap();
}

#[test]
fn test_always_ready_context() {
    let lb = loopback(&small_config());
    let ctx = Context::from_sockets(vec![lb.socket], Readiness::Always);
    assert!(ctx.can_receive());
    assert!(ctx.can_transfer());
}

#[test]
fn test_socket_close_releases_pool() {
    let lb = loopback(&small_config());
    let crate::tests::peer::Loopback {
        socket,
        kernel,
        wire,
    } = lb;
    drop(kernel);
    socket.close().unwrap();
    assert!(wire.send(b"x").is_err());
}

#[test]
fn test_shared_pool_outlives_first_socket() {
    let config = small_config();
    let (shared, mut first, mut second, second_wire) = shared_pair(&config);
    assert_eq!(std::sync::Arc::strong_count(&shared), 3);
    assert!(first.socket.shared_umem().is_some());

    first.socket.transfer(b"from first").unwrap();
    second.transfer(b"from second").unwrap();
    assert_eq!(shared.lock().unwrap().free_frames(), 10);

    let mut kernel_tx2 = unsafe { second.tx.mirror() };
    let mut out = [crate::ring::XdpDesc::default(); 4];
    assert_eq!(kernel_tx2.dequeue(&mut out), 1);
    assert_eq!(shared.lock().unwrap().packet(&out[0]).unwrap(), b"from second");
    drop(kernel_tx2);

    let crate::tests::peer::Loopback {
        socket,
        kernel,
        wire,
    } = first;
    drop(kernel);
    socket.close().unwrap();
    // pool and its registering descriptor are still held by the second socket
    wire.send(b"x").unwrap();

    drop(shared);
    second.close().unwrap();
    assert!(wire.send(b"x").is_err());
    assert!(second_wire.send(b"x").is_err());
}
