//! A coordination fabric that drives many remote simulation workers as one
//! synchronous vectorised environment.
//!
//! Two peers speak one protocol. The [`Controller`](controller::Controller)
//! binds a request/reply endpoint and a broadcast command endpoint, owns the
//! slot table and the per-step frame buffer, and unblocks its caller only
//! once every slot has delivered one fresh frame. Each
//! [`Worker`](worker::Worker) connects to both endpoints, runs one injected
//! [`Environment`](env::Environment), and heals itself through the handshake
//! whenever the controller refuses it. The
//! [`FederatedVecEnv`](vec_env::FederatedVecEnv) facade packages the whole
//! thing as the usual `reset`/`step_async`/`step_wait` surface for a
//! training loop.
//!
//! Runnable demo binaries for both sides live in the `demos/` directory.

pub mod config;
pub mod controller;
pub mod env;
pub mod error;
pub mod proto;
pub mod tensor;
#[cfg(test)]
pub mod test_util;
pub mod vec_env;
pub mod worker;

pub use config::{ControllerConfig, WorkerConfig};
pub use controller::{Controller, StepBatch};
pub use env::{EnvFactory, EnvStep, Environment, SpaceKind, SpacePair, SpaceSpec};
pub use error::FabricError;
pub use proto::Tensor;
pub use tensor::Element;
pub use vec_env::FederatedVecEnv;
pub use worker::Worker;
