use std::{path::PathBuf, sync::Arc, time::Instant};

use anyhow::{Context, anyhow};
use bytes::Bytes;
use clap::Parser;
use crossbeam_channel::{Receiver, Sender};
use logging_lib::LoggingOpts;
use parcelport_lib::{
    Chunk, ParcelBuffer, ParcelDecoder, Parcelport, ParcelportConfig, ParcelportError,
    api::FabricAddr,
    loopback::{LoopbackConfig, LoopbackFabric},
    provider::FabricEndpoint,
};
use tracing::info;

#[derive(Debug, Parser)]
#[clap(about = "Ping messages between two parcelports over the loopback fabric")]
struct Args {
    #[clap(flatten)]
    logging: LoggingOpts,

    /// JSON file with a parcelport configuration. Missing fields keep
    /// their defaults.
    #[clap(long)]
    config: Option<PathBuf>,

    /// Payload bytes per message.
    #[clap(long, default_value_t = 8192)]
    message_size: usize,

    /// Zero-copy chunks per message.
    #[clap(long, default_value_t = 2)]
    chunks: usize,

    /// Bytes per chunk.
    #[clap(long, default_value_t = 65536)]
    chunk_size: usize,

    #[clap(long, default_value_t = 1000)]
    iterations: usize,

    /// Start the configured polling threads instead of polling inline.
    #[clap(long)]
    threaded: bool,
}

struct ChannelDecoder(Sender<ParcelBuffer>);

impl ParcelDecoder for ChannelDecoder {
    fn decode(&self, _source: FabricAddr, buffer: ParcelBuffer) {
        let _ = self.0.send(buffer);
    }
}

fn load_config(args: &Args) -> anyhow::Result<ParcelportConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => ParcelportConfig::default(),
    };
    if !args.threaded {
        config.polling_threads = 0;
    } else if config.polling_threads == 0 {
        config.polling_threads = 1;
    }
    config.validate().map_err(|e| anyhow!(e))?;
    Ok(config)
}

fn start(
    fabric: &Arc<LoopbackFabric>,
    config: &ParcelportConfig,
) -> anyhow::Result<(Parcelport, Receiver<ParcelBuffer>)> {
    let (tx, rx) = crossbeam_channel::unbounded();
    let endpoint = fabric.open_endpoint(LoopbackConfig::default());
    let port = Parcelport::startup(
        config.clone(),
        endpoint as Arc<dyn FabricEndpoint>,
        Arc::new(ChannelDecoder(tx)),
    )?;
    Ok((port, rx))
}

fn pattern(len: usize, seed: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(131).wrapping_add(seed)) as u8).collect()
}

fn verify(buffer: &ParcelBuffer, payload: &[u8], chunks: &[Bytes]) -> anyhow::Result<()> {
    if buffer.data() != payload {
        return Err(anyhow!("payload mismatch"));
    }
    let received: Vec<_> = buffer.chunks().collect();
    if received.len() != chunks.len() {
        return Err(anyhow!("expected {} chunks, got {}", chunks.len(), received.len()));
    }
    for (i, (got, want)) in received.iter().zip(chunks).enumerate() {
        if got.data() != &want[..] {
            return Err(anyhow!("chunk {} mismatch", i));
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging_lib::init(&args.logging)?;
    let config = load_config(&args)?;
    info!(?config, "starting");

    let fabric = LoopbackFabric::new();
    let (client, _client_rx) = start(&fabric, &config)?;
    let (server, server_rx) = start(&fabric, &config)?;
    let table = [client.here(), server.here()];
    client.initialize_localities(&table)?;
    server.initialize_localities(&table)?;
    println!("client: {}", client.here());
    println!("server: {}", server.here());

    let payload = pattern(args.message_size, 0);
    let chunks: Vec<Bytes> =
        (0..args.chunks).map(|i| Bytes::from(pattern(args.chunk_size, i + 1))).collect();
    let (done_tx, done_rx) = crossbeam_channel::unbounded::<Result<(), ParcelportError>>();

    let t0 = Instant::now();
    for i in 0..args.iterations {
        let conn = loop {
            if let Some(conn) = client.get_connection(&server.here())? {
                break conn;
            }
            server.background_work();
        };
        let mut buffer = client.send_buffer(&payload)?;
        for chunk in &chunks {
            buffer = buffer.with_chunk(Chunk::Pointer(chunk.clone()));
        }
        let done_tx = done_tx.clone();
        client.async_write(
            conn,
            buffer,
            Box::new(move |result| done_tx.send(result).map_err(|e| e.to_string())),
        )?;

        let parcel = loop {
            if let Ok(parcel) = server_rx.try_recv() {
                break parcel;
            }
            server.background_work();
            client.background_work();
        };
        verify(&parcel, &payload, &chunks).with_context(|| format!("iteration {}", i))?;
        parcel.release()?;
    }
    for _ in 0..args.iterations {
        loop {
            if let Ok(result) = done_rx.try_recv() {
                result?;
                break;
            }
            client.background_work();
            server.background_work();
        }
    }
    let elapsed = t0.elapsed();

    let bytes = (args.message_size + args.chunks * args.chunk_size) * args.iterations;
    let secs = elapsed.as_secs_f64();
    println!(
        "{} messages, {} bytes in {:.3}s: {:.1} msg/s, {:.2} MiB/s",
        args.iterations,
        bytes,
        secs,
        args.iterations as f64 / secs,
        bytes as f64 / secs / (1 << 20) as f64,
    );
    println!("client: {}", serde_json::to_string(&client.stats())?);
    println!("server: {}", serde_json::to_string(&server.stats())?);
    for class in client.memory_pool().class_stats() {
        println!("client pool: {:?}", class);
    }

    server.stop();
    client.stop();
    Ok(())
}
