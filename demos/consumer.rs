use clap::Parser;
use eyre::{eyre, Result};
use hdrhistogram::Histogram;
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
use std::io::IoSliceMut;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[clap(name = "consumer")]
#[clap(about = "Ring buffer consumer demo", long_about = None)]
struct Args {
    #[clap(short, long, default_value = "/tmp/spscbuf_demo.sock")]
    socket: String,

    #[clap(short, long, default_value_t = 5)]
    report_interval_secs: u64,
}

fn monotonic_nanos() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    debug!(?args, "consumer configuration");

    let stream = UnixStream::connect(&args.socket)?;
    info!(socket = %args.socket, "connected to producer");

    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);
    let mut handshake = [0u8; 16];
    let mut iov = [IoSliceMut::new(&mut handshake)];

    let (capacity, message_size, memory_fd) = {
        let msg = recvmsg::<()>(
            stream.as_fd().as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::empty(),
        )?;

        let data = msg.iovs().next().ok_or_else(|| eyre!("empty handshake"))?;
        let capacity = u64::from_le_bytes(data[..8].try_into().unwrap()) as usize;
        let message_size = u64::from_le_bytes(data[8..16].try_into().unwrap()) as usize;

        let mut memory_fd = None;
        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                if let Some(&fd) = fds.first() {
                    memory_fd = Some(unsafe { OwnedFd::from_raw_fd(fd) });
                }
            }
        }

        (
            capacity,
            message_size,
            memory_fd.ok_or_else(|| eyre!("no memory fd received"))?,
        )
    };

    info!(
        capacity = capacity,
        message_size = message_size,
        memory_fd = memory_fd.as_raw_fd(),
        "received connection info"
    );

    // SAFETY: the producer hands the fd to exactly one consumer.
    let mut reader = unsafe { spscbuf::attach_reader(memory_fd, capacity)? };

    let record_size = 16 + message_size;
    let mut histogram = Histogram::<u64>::new(3)?;
    let report_interval = Duration::from_secs(args.report_interval_secs);
    let mut last_report = Instant::now();
    let mut last_count = 0u64;
    let mut count = 0u64;

    info!("starting record consumption");

    loop {
        let record = reader.record(record_size, 8);
        let receive_time = monotonic_nanos();

        let send_time = u64::from_le_bytes(record[..8].try_into().unwrap());
        let sequence = u64::from_le_bytes(record[8..16].try_into().unwrap());
        drop(record);

        let latency_us = receive_time.saturating_sub(send_time) / 1000;
        histogram.record(latency_us)?;
        count += 1;

        debug!(sequence, latency_us, "record consumed");

        if last_report.elapsed() >= report_interval {
            let elapsed = last_report.elapsed();
            let rate = (count - last_count) as f64 / elapsed.as_secs_f64();
            info!(
                rate = format!("{:.2}", rate),
                total_records = count,
                p50_us = histogram.value_at_quantile(0.50),
                p99_us = histogram.value_at_quantile(0.99),
                p99_9_us = histogram.value_at_quantile(0.999),
                max_us = histogram.max(),
                "=== statistics report ==="
            );
            last_report = Instant::now();
            last_count = count;
        }
    }
}
