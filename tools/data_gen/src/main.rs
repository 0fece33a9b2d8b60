use std::path::PathBuf;

use clap::Parser;
use tch::Device;

use harness::data::{hidden_manifold, save_dataset, ManifoldConfig};
use repr_core::Activation;

/// Generate a hidden-manifold dataset and save it with its generation
/// parameters, so runs stay reproducible.
#[derive(Parser)]
struct Cli {
    #[arg(short, long)]
    output_dir: PathBuf,
    #[arg(short, long)]
    id: String,
    #[arg(long, default_value_t = 64)]
    latent_dim: i64,
    #[arg(long, default_value_t = 1024)]
    ambient_dim: i64,
    #[arg(long, default_value_t = 8192)]
    num_points: i64,
    #[arg(long, default_value_t = 0.5)]
    active_prob: f64,
    #[arg(long, default_value_t = 0.0)]
    noise: f64,
    #[arg(long, default_value_t = 42)]
    seed: i64,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ManifoldConfig {
        latent_dim: cli.latent_dim,
        ambient_dim: cli.ambient_dim,
        num_points: cli.num_points,
        active_prob: cli.active_prob,
        noise: cli.noise,
        nonlinearity: Activation::Tanh,
    };
    let data = hidden_manifold(&config, cli.seed, Device::Cpu);
    save_dataset(&cli.output_dir, &cli.id, &data, &config)?;

    println!(
        "Saved dataset rf_{} ({} points, {} dims) under {:?}",
        cli.id, cli.num_points, cli.ambient_dim, cli.output_dir
    );
    Ok(())
}
