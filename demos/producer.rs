use clap::Parser;
use eyre::Result;
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use spscbuf::create_writer;
use std::io::IoSlice;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::UnixListener;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[clap(name = "producer")]
#[clap(about = "Ring buffer producer demo", long_about = None)]
struct Args {
    #[clap(short, long, default_value = "/tmp/spscbuf_demo.sock")]
    socket: String,

    #[clap(short, long, default_value_t = 1 << 20)]
    capacity: usize,

    #[clap(short, long, default_value_t = 1024)]
    message_size: usize,

    /// Records per second, 0 for unpaced.
    #[clap(short, long, default_value_t = 100_000)]
    rate: u64,

    #[clap(short, long, default_value_t = 1_000_000)]
    print_interval: u64,
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
    debug!(?args, "producer configuration");

    let mut writer = create_writer(args.capacity)?;

    let _ = std::fs::remove_file(&args.socket);
    let listener = UnixListener::bind(&args.socket)?;
    info!(socket = %args.socket, capacity = args.capacity, "producer listening");

    let (stream, _) = listener.accept()?;
    info!("consumer connected");

    // Handshake: capacity and message size, plus the memory fd. Record
    // shapes are agreed here because the ring itself carries no framing.
    let mut handshake = [0u8; 16];
    handshake[..8].copy_from_slice(&(args.capacity as u64).to_le_bytes());
    handshake[8..].copy_from_slice(&(args.message_size as u64).to_le_bytes());
    let iov = [IoSlice::new(&handshake)];
    let fds = [writer.memory_fd().as_raw_fd()];
    let cmsg = ControlMessage::ScmRights(&fds);
    sendmsg::<()>(
        stream.as_fd().as_raw_fd(),
        &iov,
        &[cmsg],
        MsgFlags::empty(),
        None,
    )?;

    let record_size = 16 + args.message_size;
    let pause = (args.rate > 0).then(|| Duration::from_nanos(1_000_000_000 / args.rate));

    info!(
        record_size = record_size,
        rate = args.rate,
        "starting record production"
    );

    let mut sequence = 0u64;
    loop {
        let timestamp = monotonic_nanos();

        let mut reserved = writer.reserve(record_size, 8);
        reserved[..8].copy_from_slice(&timestamp.to_le_bytes());
        reserved[8..16].copy_from_slice(&sequence.to_le_bytes());
        reserved[16..].fill(b'a');
        drop(reserved);

        sequence += 1;

        if sequence % args.print_interval == 0 {
            info!(records_sent = sequence, "progress update");
        }

        if let Some(pause) = pause {
            thread::sleep(pause);
        }
    }
}
