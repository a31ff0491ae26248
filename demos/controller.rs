//! The demo controller: federates two demo workers and drives them for a few
//! hundred steps.
//!
//! ```text
//! RUST_LOG=info cargo run --example demo-controller
//! # then, in two other shells:
//! RUST_LOG=info cargo run --example demo-worker
//! RUST_LOG=info cargo run --example demo-worker
//! ```

use std::time::Duration;

use vecfed::{ControllerConfig, FabricError, FederatedVecEnv, Tensor};

fn main() -> Result<(), FabricError> {
    env_logger::init();

    let mut config = ControllerConfig::new("tcp://*", 9991, 9992, 2, "Drift-v0");
    config.step_timeout = Duration::from_secs(20);

    let mut env = FederatedVecEnv::new(config)?;
    println!(
        "{} environments, observation space {:?}, action space {:?}",
        env.num_envs(),
        env.observation_space(),
        env.action_space()
    );

    let observations = env.reset()?;
    println!("reset delivered {} observations", observations.len());

    for round in 0..300usize {
        let actions: Vec<Tensor> = (0..env.num_envs())
            .map(|slot| Tensor::scalar(((round + slot) % 2) as i64))
            .collect();
        let batch = env.step(&actions)?;
        if round % 50 == 0 {
            println!(
                "round {}: rewards {:?}, dones {:?}",
                round, batch.rewards, batch.dones
            );
        }
    }

    env.close()
}
