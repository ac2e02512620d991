use clap::Parser;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use inverse_model::engine::{EngineConfig, PredicateEngine};
use inverse_model::model::{InverseModel, ModelConfig};
use inverse_model::overlap::PrefixTrieIndex;
use inverse_model::ports::InternedPorts;
use inverse_model::rule::{DeviceId, Port, Rule};

#[derive(Debug, Parser)]
#[command(author, version)]
struct Cli {
    /// Number of devices.
    #[arg(value_name = "INT", default_value = "8", value_parser = clap::value_parser!(u32).range(1..))]
    devices: u32,

    /// Number of batches to apply.
    #[clap(long, value_name = "INT", default_value = "50")]
    batches: usize,

    /// Rule changes per batch.
    #[clap(long, value_name = "INT", default_value = "20")]
    batch_size: usize,

    /// Node table size (in bits, so the actual size is `2^size` nodes).
    #[clap(long, value_name = "INT", default_value = "20")]
    size: usize,

    /// Seed of the rule generator.
    #[clap(long, value_name = "INT", default_value = "42")]
    seed: u64,

    /// Compute per-device deltas sequentially.
    #[clap(long)]
    sequential: bool,
}

fn random_rule(rng: &mut ChaCha8Rng, devices: u32) -> Rule {
    let device = DeviceId::new(rng.random_range(0..devices));
    let prefix_len = rng.random_range(8..=24u32);
    let addr = [10, rng.random_range(0..4u8), rng.random(), rng.random()];
    let target = DeviceId::new(rng.random_range(0..devices));
    let port = Port::new(device, format!("to-{}", target));
    Rule::ipv4(device, addr, prefix_len, prefix_len as i32, port)
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    simplelog::TermLogger::init(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )?;

    let time_total = std::time::Instant::now();

    let args = Cli::parse();
    println!("args = {:?}", args);

    let engine = PredicateEngine::new(EngineConfig::default().with_storage_bits(args.size));
    let width = engine.config().header_bits;
    let mut model = InverseModel::with_components(
        engine.clone(),
        ModelConfig::default().with_parallel(!args.sequential),
        (0..args.devices).map(DeviceId::new),
        |_| PrefixTrieIndex::new(width),
        InternedPorts::new(),
    );

    let mut rng = ChaCha8Rng::seed_from_u64(args.seed);
    let mut installed: Vec<Rule> = Vec::new();
    for batch in 0..args.batches {
        let mut insertions = Vec::new();
        let mut deletions = Vec::new();
        for _ in 0..args.batch_size {
            if !installed.is_empty() && rng.random_bool(1.0 / 3.0) {
                let i = rng.random_range(0..installed.len());
                deletions.push(installed.swap_remove(i));
            } else {
                let rule = random_rule(&mut rng, args.devices);
                installed.push(rule.clone());
                insertions.push(rule);
            }
        }

        let moved = model.apply_batch(&insertions, &deletions)?;
        println!(
            "batch {}: +{} -{} moved {} ECs, now {} ECs and {} rules",
            batch,
            insertions.len(),
            deletions.len(),
            moved.len(),
            model.ec_count(),
            model.rule_count()
        );
    }

    println!("partition is valid: {}", model.verify_partition()?);
    println!("engine = {:?}", engine);
    println!("stats = {:?}", engine.stats());

    let time_total = time_total.elapsed();
    println!("Done in {:.3} s", time_total.as_secs_f64());

    Ok(())
}
