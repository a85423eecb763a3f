//
// veth_loopback.rs - End-to-end packet I/O over a veth pair
//
// Purpose:
//   Verifies the whole startup sequence and both directions of the data path against a
//   real kernel: redirect program attach, frame pool registration, socket bind, transmit
//   with completion reclamation on one end and zero-copy receive on the other.
//
// How it works:
//   - Needs CAP_NET_ADMIN, CAP_NET_RAW and CAP_BPF; re-runs itself under sudo otherwise.
//   - Needs a compiled redirect program: XSK_IO_BPF_OBJECT names the object file. The
//     test is skipped when it is not set.
//   - Opens a receiving context on host1 and, once it is bound, a transmitting context
//     on host0 that sends a marked UDP frame until host1 reports it or time runs out.
//

use anyhow::{Context as _, bail};
use etherparse::{PacketBuilder, SlicedPacket, TransportSlice};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use xsk_io::{AttachMode, Context, Interest, ProgramSource, RingError, XskConfig};

const OBJECT_ENV: &str = "XSK_IO_BPF_OBJECT";
const MARKER: &[u8] = b"xsk-io veth loopback";
const DEADLINE: Duration = Duration::from_secs(5);

fn config(object: &str) -> XskConfig {
    XskConfig {
        frame_count: 4096,
        zero_copy: Some(false),
        attach_mode: AttachMode::Skb,
        program: ProgramSource::File(object.into()),
        ..XskConfig::default()
    }
}

fn udp_frame(src: &str, dst: &str) -> anyhow::Result<Vec<u8>> {
    let src: Ipv4Addr = src.parse()?;
    let dst: Ipv4Addr = dst.parse()?;
    let builder = PacketBuilder::ethernet2([0x02, 0, 0, 0, 0, 0x01], [0xff; 6])
        .ipv4(src.octets(), dst.octets(), 64)
        .udp(9000, 9001);
    let mut frame = Vec::with_capacity(builder.size(MARKER.len()));
    builder.write(&mut frame, MARKER)?;
    Ok(frame)
}

fn is_marker(packet: &[u8]) -> bool {
    match SlicedPacket::from_ethernet(packet) {
        Ok(sliced) => matches!(
            sliced.transport,
            Some(TransportSlice::Udp(udp)) if udp.payload() == MARKER
        ),
        Err(_) => false,
    }
}

fn receive_marker(
    ifname: &str,
    config: &XskConfig,
    ready: CancellationToken,
    done: CancellationToken,
) -> anyhow::Result<()> {
    let mut ctx = Context::open_with(ifname, config).context("open receiving context")?;
    ready.cancel();
    let start = Instant::now();
    let mut seen = 0u64;
    while start.elapsed() < DEADLINE {
        let marker = ctx.receive()?.map(|packet| is_marker(&packet));
        match marker {
            Some(true) => {
                log::info!("marker received on {ifname} after {seen} other packet(s)");
                done.cancel();
                ctx.close()?;
                return Ok(());
            }
            Some(false) => seen += 1,
            None => {
                ctx.sockets()[0].poll_wait(Interest::Receive, Some(Duration::from_millis(50)))?;
            }
        }
    }
    done.cancel();
    bail!("no marker on {ifname} within {DEADLINE:?} ({seen} other packets)")
}

fn transmit_marker(
    ifname: &str,
    config: &XskConfig,
    frame: &[u8],
    done: CancellationToken,
) -> anyhow::Result<u64> {
    let mut ctx = Context::open_with(ifname, config).context("open transmitting context")?;
    let mut sent = 0;
    while !done.is_cancelled() {
        match ctx.transfer(frame) {
            Ok(_) => sent += 1,
            Err(RingError::RingFull | RingError::NoFreeFrame) => {}
            Err(e) => return Err(e.into()),
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    log::info!(
        "{ifname}: {sent} frame(s) sent, {} acknowledged",
        ctx.stats().tx_packets
    );
    ctx.close()?;
    Ok(sent)
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let Ok(object) = std::env::var(OBJECT_ENV) else {
        println!("{OBJECT_ENV} is not set, skipping veth loopback test");
        return Ok(());
    };
    nettest::command::setup(&[
        caps::Capability::CAP_NET_ADMIN,
        caps::Capability::CAP_NET_RAW,
        caps::Capability::CAP_BPF,
    ])?;

    let config = config(&object);
    let result = nettest::run_test_with_pair(|pair| async move {
        let frame = udp_frame(&pair.host0.ip, &pair.host1.ip).map_err(std::io::Error::other)?;
        let ready = CancellationToken::new();
        let done = CancellationToken::new();

        let receiver = {
            let (ifname, config) = (pair.host1.if_dev.clone(), config.clone());
            let (ready, done) = (ready.clone(), done.clone());
            tokio::task::spawn_blocking(move || receive_marker(&ifname, &config, ready, done))
        };
        tokio::select! {
            _ = ready.cancelled() => {}
            _ = tokio::time::sleep(DEADLINE) => {}
        }
        let sender = {
            let ifname = pair.host0.if_dev.clone();
            let done = done.clone();
            tokio::task::spawn_blocking(move || transmit_marker(&ifname, &config, &frame, done))
        };

        let received = receiver.await?;
        done.cancel();
        let sent = sender.await?;
        received.map_err(std::io::Error::other)?;
        sent.map_err(std::io::Error::other)?;
        Ok(())
    })
    .await;

    match result {
        Ok(()) => {
            log::info!("veth loopback test passed");
            Ok(())
        }
        Err(e) => {
            log::error!("veth loopback test failed: {e}");
            Err(e.into())
        }
    }
}
