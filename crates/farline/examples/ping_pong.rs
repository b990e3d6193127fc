//! Ping-pong latency driver: one request queue, one response queue, two
//! pinned threads in one process.
//!
//! The client seals a request, the server echoes it back, and the round-trip
//! time is averaged over all iterations. Both queues live in one anonymous
//! shared region, so this measures the protocol cost without a second
//! process in the way.
//!
//! Run with: `cargo run --release --example ping_pong -p farline -- --iters 1000000`

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use clap::Parser;

use farline::prelude::*;

#[derive(Parser)]
#[command(about = "farline ping-pong latency benchmark")]
struct Cli {
    /// Round trips to measure.
    #[arg(long, default_value_t = 1_000_000)]
    iters: u64,

    /// Ring order (capacity = 1 << order).
    #[arg(long, default_value_t = 14)]
    order: u32,

    /// Logical CPU for the client thread; the server takes the next one.
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

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let iters = cli.iters;

    let region = Arc::new(SharedRegion::anon(2 * session_size(cli.order))?);
    let req_layout = SessionLayout::allocate(&region, cli.order)?;
    let rsp_layout = SessionLayout::allocate(&region, cli.order)?;

    // client -> server
    let mut req_producer = req_layout.queue(true)?;
    let mut req_consumer = req_layout.queue(false)?;
    // server -> client
    let mut rsp_producer = rsp_layout.queue(true)?;
    let mut rsp_consumer = rsp_layout.queue(false)?;

    println!("iterations : {iters}");
    println!("capacity   : {}", req_producer.capacity());

    let server_cpu = cli.pin.map(|cpu| cpu + 1);
    let server = thread::spawn({
        let _region = Arc::clone(&region);
        move || {
            if let Some(cpu) = server_cpu {
                pin_to_cpu(cpu);
            }
            for i in 0..iters {
                let req = loop {
                    match req_consumer.dequeue() {
                        Ok(e) => break e,
                        Err(_) => continue,
                    }
                };
                assert_eq!(req.payload[0], i, "server saw out-of-order request");
                while rsp_producer.enqueue(&req).is_err() {}
            }
            (req_consumer.metrics(), rsp_producer.metrics())
        }
    });

    if let Some(cpu) = cli.pin {
        pin_to_cpu(cpu);
    }

    let mut req = Entry::default();
    let started = Instant::now();
    for i in 0..iters {
        req.payload[0] = i;
        req.rpc_id = i as u16;

        while req_producer.enqueue(&req).is_err() {}
        let rsp = loop {
            match rsp_consumer.dequeue() {
                Ok(e) => break e,
                Err(_) => continue,
            }
        };
        assert_eq!(rsp.rpc_id, req.rpc_id, "client saw mismatched response");
        assert_eq!(rsp.payload[0], req.payload[0]);
    }
    let elapsed = started.elapsed();

    let (server_req_metrics, server_rsp_metrics) = server.join().expect("server thread");

    let rtt_ns = elapsed.as_nanos() as f64 / iters as f64;
    println!("\ntotal elapsed     : {:.2} ms", elapsed.as_secs_f64() * 1e3);
    println!("round-trip latency: {rtt_ns:.2} ns");
    println!("one-way latency   : {:.2} ns", rtt_ns / 2.0);

    println!("\n[request producer]\n{}", req_producer.metrics());
    println!("\n[request consumer]\n{server_req_metrics}");
    println!("\n[response producer]\n{server_rsp_metrics}");
    println!("\n[response consumer]\n{}", rsp_consumer.metrics());

    Ok(())
}
