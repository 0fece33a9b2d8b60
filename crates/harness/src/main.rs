use anyhow::Result;
use std::fs;
use std::path::Path;
use tch::Device;

use harness::data::{hidden_manifold, load_dataset, InMemoryDataset, ManifoldConfig};
use harness::{build_objective, ConsoleLogger, RunConfig, Trainer};

fn main() -> Result<()> {
    env_logger::init();

    let config_path = "configs/run_config.yaml";
    let run: RunConfig = if Path::new(config_path).exists() {
        println!("Loading run configuration from {}", config_path);
        serde_yaml::from_str(&fs::read_to_string(config_path)?)?
    } else {
        RunConfig::default()
    };

    let device = Device::cuda_if_available();
    println!("Using device: {:?}", device);

    // Use a previously generated dataset when one exists, otherwise draw a
    // fresh hidden-manifold dataset matching the configured input width.
    let data = match load_dataset(Path::new("data"), &run.run_id) {
        Ok((tensor, manifold)) => {
            println!(
                "Loaded dataset rf_{} ({} points in {} dims)",
                run.run_id, manifold.num_points, manifold.ambient_dim
            );
            tensor.to_device(device)
        }
        Err(_) => {
            let manifold = ManifoldConfig {
                ambient_dim: run.arch.input_dim,
                ..Default::default()
            };
            println!(
                "Generating hidden-manifold dataset ({} points in {} dims)",
                manifold.num_points, manifold.ambient_dim
            );
            hidden_manifold(&manifold, run.seed as i64, device)
        }
    };
    let dataset = InMemoryDataset::new(data, None, 0.1, 0.1);

    let objective = build_objective(&run, device);
    let logger = Box::new(ConsoleLogger::new());
    let epochs = run.epochs;
    let mut trainer = Trainer::new(run, objective, logger, device)?;
    trainer.fit(&dataset, epochs)?;

    println!("Training complete!");
    Ok(())
}
