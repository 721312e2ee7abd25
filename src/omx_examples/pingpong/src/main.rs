use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use hdrhistogram::Histogram;
use minstant::Instant;

use omx::{Config, Endpoint};
use omx_transport_loopback::{LoopbackConfig, LoopbackFabric};

const KEY: u32 = 0x4242;
const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

#[derive(Parser, Debug)]
#[command(about = "Ping-pong latency between two endpoints of the loopback fabric.")]
pub struct Args {
    /// Path to an omx.toml.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Message size.
    #[arg(short, long, default_value = "8")]
    pub size: usize,

    /// Total number of iterations.
    #[arg(short = 'n', long = "num", default_value = "10000")]
    pub num: usize,

    /// Number of warmup iterations.
    #[arg(short, long, default_value = "100")]
    pub warmup: usize,
}

fn run_server(ep: &Endpoint, args: &Args) -> anyhow::Result<()> {
    let mut buf = vec![0u8; args.size];
    for i in 0..args.warmup + args.num {
        let r = ep.irecv(buf, 0, 0, i as u64)?;
        let ping = ep
            .wait(r, TIMEOUT)?
            .ok_or_else(|| anyhow::anyhow!("no ping after {:?}", TIMEOUT))?;
        ping.status.code?;
        let client = ping
            .status
            .addr
            .ok_or_else(|| anyhow::anyhow!("ping from nowhere"))?;
        let s = ep.isend(ping.segments, &client, 0, i as u64)?;
        let pong = ep
            .wait(s, TIMEOUT)?
            .ok_or_else(|| anyhow::anyhow!("pong {} never completed", i))?;
        buf = pong.segments.into_contiguous();
    }
    Ok(())
}

fn run_client(ep: &Endpoint, server: &Endpoint, args: &Args) -> anyhow::Result<Histogram<u64>> {
    let mut hist = Histogram::<u64>::new_with_max(60_000_000_000, 5)?;
    let server_addr = server.addr();
    let dest = ep.connect(
        server_addr.board_addr,
        server_addr.endpoint_index,
        KEY,
        TIMEOUT,
    )?;
    tracing::info!("connected to {}", dest);

    let mut msg = vec![0x5au8; args.size];
    for i in 0..args.warmup + args.num {
        let start = Instant::now();
        let r = ep.irecv(vec![0u8; args.size], 0, 0, i as u64)?;
        let s = ep.isend(msg, &dest, 0, i as u64)?;
        let pong = ep
            .wait(r, TIMEOUT)?
            .ok_or_else(|| anyhow::anyhow!("no pong after {:?}", TIMEOUT))?;
        let sent = ep
            .wait(s, TIMEOUT)?
            .ok_or_else(|| anyhow::anyhow!("ping {} never completed", i))?;
        let dura = start.elapsed();
        pong.status.code?;
        if i >= args.warmup {
            hist.record(dura.as_nanos() as u64)?;
        }
        msg = sent.segments.into_contiguous();
    }
    Ok(hist)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };
    let _guard = omx::init_log(&config, true)?;

    let fabric = Arc::new(LoopbackFabric::new(LoopbackConfig {
        boards: 2,
        ..Default::default()
    }));
    let client = Endpoint::open(fabric.clone(), 0, 0, KEY, &config.endpoint)?;
    let server = Endpoint::open(fabric, 1, 0, KEY, &config.endpoint)?;

    let hist = crossbeam::thread::scope(|s| {
        let handle = s.spawn(|_| run_server(&server, &args));
        let hist = run_client(&client, &server, &args);
        if let Err(e) = handle.join().unwrap_or_else(|_| Err(anyhow::anyhow!("server panicked"))) {
            tracing::error!("server: {}", e);
        }
        hist
    })
    .map_err(|_| anyhow::anyhow!("client panicked"))??;

    println!(
        "size: {}, samples: {}, min: {:.2}us, median: {:.2}us, p95: {:.2}us, p99: {:.2}us, max: {:.2}us",
        args.size,
        hist.len(),
        hist.min() as f64 / 1e3,
        hist.value_at_quantile(0.5) as f64 / 1e3,
        hist.value_at_quantile(0.95) as f64 / 1e3,
        hist.value_at_quantile(0.99) as f64 / 1e3,
        hist.max() as f64 / 1e3,
    );

    client.close()?;
    server.close()?;
    Ok(())
}
