//! Two-process driver: producer and consumer in separate processes over a
//! named backing file (tmpfs, `/dev/shm`, or a DAX device path).
//!
//! Both processes perform the same layout allocation, then rendezvous
//! through the handshake flags: the producer initializes the session and
//! raises `producer_ready`; the consumer attaches, raises `consumer_ready`;
//! the producer raises `start` and the timed run begins.
//!
//! ```text
//! # terminal 1
//! cargo run --release --example two_process -p farline -- producer --path /dev/shm/farline --iters 10000000
//! # terminal 2
//! cargo run --release --example two_process -p farline -- consumer --path /dev/shm/farline --iters 10000000
//! ```

use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};

use farline::prelude::*;
use farline::{cpu_relax, HandshakeCell};

#[derive(Clone, Copy, ValueEnum)]
enum Backing {
    /// A named file (tmpfs or any filesystem both processes can reach).
    File,
    /// A raw DAX / CXL character device; `--path` names the device.
    Device,
}

#[derive(Parser)]
#[command(about = "farline two-process queue driver")]
struct Cli {
    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand)]
enum Role {
    /// Initialize the session and produce entries.
    Producer(CommonArgs),
    /// Attach to the session and consume entries.
    Consumer(CommonArgs),
}

#[derive(clap::Args)]
struct CommonArgs {
    /// Backing path shared by both processes.
    #[arg(long)]
    path: String,

    /// Backing kind.
    #[arg(long, value_enum, default_value_t = Backing::File)]
    backing: Backing,

    /// Byte offset into a device backing (must be page-aligned).
    #[arg(long, default_value_t = 0)]
    offset: u64,

    /// Entries to move.
    #[arg(long, default_value_t = 10_000_000)]
    iters: u64,

    /// Ring order (capacity = 1 << order).
    #[arg(long, default_value_t = 14)]
    order: u32,

    /// Logical CPU to pin this process to.
    #[arg(long)]
    pin: Option<usize>,
}

fn pin_to_cpu(cpu: usize) {
    // SAFETY: a zeroed cpu_set_t is a valid empty set; CPU_SET/sched_setaffinity
    // operate on it by value/pointer with no other preconditions.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            eprintln!("warning: could not pin to CPU {cpu}");
        }
    }
}

struct Session {
    queue: LineQueue,
    producer_ready: HandshakeCell,
    consumer_ready: HandshakeCell,
    start: HandshakeCell,
    // Dropped last: the queue and flags point into this mapping.
    _region: SharedRegion,
}

fn open_session(args: &CommonArgs, initialize: bool) -> Result<Session, Box<dyn std::error::Error>> {
    let bytes = session_size(args.order);
    let region = match (args.backing, initialize) {
        (Backing::File, true) => SharedRegion::create_file(&args.path, bytes)?,
        (Backing::File, false) => SharedRegion::open_file(&args.path, bytes)?,
        (Backing::Device, _) => SharedRegion::device(&args.path, args.offset, bytes)?,
    };
    let layout = SessionLayout::allocate(&region, args.order)?;
    Ok(Session {
        queue: layout.queue(initialize)?,
        producer_ready: layout.producer_ready(initialize)?,
        consumer_ready: layout.consumer_ready(initialize)?,
        start: layout.start(initialize)?,
        _region: region,
    })
}

fn run_producer(args: &CommonArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut session = open_session(args, true)?;
    println!("[producer] session initialized at {}", args.path);

    // Pre-fill a quarter of the ring so the consumer starts against a warm
    // queue, then rendezvous.
    let warmup = (session.queue.capacity() as u64 / 4).min(args.iters);
    let mut entry = Entry::default();
    entry.rpc_method = 1;
    entry.seal_index = -1;
    for i in 0..warmup {
        entry.rpc_id = i as u16;
        entry.payload[0] = i;
        while session.queue.enqueue(&entry).is_err() {}
    }

    println!("[producer] warm-up complete, waiting for consumer");
    session.producer_ready.raise();
    session.consumer_ready.wait(100);
    session.start.raise();
    println!("[producer] start signal raised");

    let started = Instant::now();
    for i in warmup..args.iters {
        entry.rpc_id = i as u16;
        entry.payload[0] = i;
        while session.queue.enqueue(&entry).is_err() {}
    }
    let elapsed = started.elapsed();

    let produced = args.iters - warmup;
    println!(
        "[producer] {:.2} ns/op over {produced} entries",
        elapsed.as_nanos() as f64 / produced as f64
    );
    println!("\n{}", session.queue.metrics());
    Ok(())
}

fn run_consumer(args: &CommonArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Wait for the producer to finish initializing before mapping attaches.
    let mut session = loop {
        match open_session(args, false) {
            Ok(s) => break s,
            Err(_) => cpu_relax(10_000),
        }
    };
    session.producer_ready.wait(100);
    println!("[consumer] producer ready, signaling back");
    session.consumer_ready.raise();
    session.start.wait(100);
    println!("[consumer] start signal observed");

    let started = Instant::now();
    let mut consumed = 0u64;
    while consumed < args.iters {
        if let Ok(entry) = session.queue.dequeue() {
            if entry.payload[0] != consumed {
                eprintln!(
                    "[consumer] verification failed: expected {consumed}, got {}",
                    entry.payload[0]
                );
                std::process::exit(1);
            }
            consumed += 1;
        }
    }
    let elapsed = started.elapsed();

    println!(
        "[consumer] {:.2} ns/op over {} entries",
        elapsed.as_nanos() as f64 / args.iters as f64,
        args.iters
    );
    println!("\n{}", session.queue.metrics());
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let args = match &cli.role {
        Role::Producer(args) | Role::Consumer(args) => args,
    };
    if let Some(cpu) = args.pin {
        pin_to_cpu(cpu);
    }

    match cli.role {
        Role::Producer(ref args) => run_producer(args),
        Role::Consumer(ref args) => run_consumer(args),
    }
}
