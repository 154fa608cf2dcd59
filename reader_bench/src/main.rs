use std::error::Error;
use std::time::Instant;

use clap::Parser;
use serde_derive::{Deserialize, Serialize};

use ringcast::{QueueConfig, RingQueue};

/// Terminal value the writer bench publishes last.
const END_MARKER: u64 = u64::MAX;

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "ringcast-bench.toml")]
    config: String,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct BenchConfig {
    queue: QueueConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    let opts: Opts = Opts::parse();
    let cfg: BenchConfig = confy::load_path(&opts.config)?;
    let queue = RingQueue::<u64>::attach(&cfg.queue)?;
    run(&queue)
}

fn run(queue: &RingQueue<u64>) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();

    let mut cursor = 0u64;
    let mut received = 0u64;
    loop {
        if let Some((cell, _)) = queue.read(&mut cursor) {
            let value = *cell;
            if value == END_MARKER {
                break;
            }
            received += 1;
            if received % 500_000 == 0 {
                eprint!("\rTotal {} ops (current value: {})", received, value);
            }
        }
    }

    let duration = start.elapsed();
    let iops = ((received as f64) / (duration.as_millis() as f64)) * 1_000f64;
    println!(
        "\n{:#?}K messages read/s. Total time: {:#?}, lost: {}",
        (iops / 1000f64) as u64,
        duration,
        queue.loss_count()
    );
    Ok(())
}
