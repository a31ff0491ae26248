//! A demo worker hosting a toy drift simulator. Start the demo controller,
//! then run one of these per environment slot:
//!
//! ```text
//! RUST_LOG=info cargo run --example demo-worker
//! ```

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vecfed::{
    EnvFactory, EnvStep, Environment, FabricError, SpaceKind, SpacePair, SpaceSpec, Tensor,
    Worker, WorkerConfig,
};

const EPISODE_LENGTH: u32 = 200;

/// A point drifting on a line. Action 0 nudges it left, action 1 right; the
/// reward penalises distance from the origin.
struct DriftEnv {
    rng: StdRng,
    position: f32,
    steps: u32,
}

impl Environment for DriftEnv {
    fn space_payload(&self) -> Result<Vec<u8>, FabricError> {
        SpacePair {
            observation: SpaceSpec {
                kind: SpaceKind::Box,
                shape: vec![1],
                dtype: "f32".to_string(),
            },
            action: SpaceSpec {
                kind: SpaceKind::Discrete,
                shape: vec![],
                dtype: "i64".to_string(),
            },
        }
        .to_payload()
    }

    fn reset(&mut self) -> Result<Tensor, FabricError> {
        self.position = 0.0;
        self.steps = 0;
        Tensor::from_values(vec![1], &[self.position])
    }

    fn step(&mut self, action: &Tensor) -> Result<EnvStep, FabricError> {
        let action = action.to_scalar::<i64>()?;
        let drift = if action == 0 { -0.05 } else { 0.05 };
        self.position += drift + self.rng.gen_range(-0.01..0.01);
        self.steps += 1;
        Ok(EnvStep {
            observation: Tensor::from_values(vec![1], &[self.position])?,
            reward: f64::from(-self.position.abs()),
            done: self.steps >= EPISODE_LENGTH,
            info: Vec::new(),
        })
    }
}

struct DriftFactory;

impl EnvFactory for DriftFactory {
    type Env = DriftEnv;

    fn instantiate(&mut self, _name: &str, seed: i64) -> Result<DriftEnv, FabricError> {
        Ok(DriftEnv {
            rng: StdRng::seed_from_u64(seed as u64),
            position: 0.0,
            steps: 0,
        })
    }
}

fn main() -> Result<(), FabricError> {
    env_logger::init();

    let mut config = WorkerConfig::new("tcp://localhost", 9991, 9992);
    config.timeout = Duration::from_secs(10);
    config.wait_period = Duration::from_secs(2);

    let mut worker = Worker::new(config, DriftFactory)?;
    worker.run()
}
