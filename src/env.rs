//! The capability contract between a worker and the simulator it hosts. The
//! fabric depends on nothing else about the environment; a concrete worker
//! binary plugs in its own implementation.

use serde::{Deserialize, Serialize};

use crate::error::FabricError;
use crate::proto::Tensor;

/// The result of advancing an environment by one action.
#[derive(Clone, Debug)]
pub struct EnvStep {
    pub observation: Tensor,
    pub reward: f64,
    pub done: bool,
    /// Opaque diagnostic payload, passed through to the controller verbatim.
    pub info: Vec<u8>,
}

/// One remotely driven simulation instance.
pub trait Environment {
    /// Opaque observation/action space descriptors for the controller.
    /// Conventionally a JSON-encoded [`SpacePair`].
    fn space_payload(&self) -> Result<Vec<u8>, FabricError>;

    /// Starts a fresh episode and returns its first observation.
    fn reset(&mut self) -> Result<Tensor, FabricError>;

    /// Applies one action.
    fn step(&mut self, action: &Tensor) -> Result<EnvStep, FabricError>;

    /// Releases simulator resources. Called exactly once per instance.
    fn close(&mut self) {}
}

/// Builds environments on demand during the worker handshake.
pub trait EnvFactory {
    type Env: Environment;

    fn instantiate(&mut self, name: &str, seed: i64) -> Result<Self::Env, FabricError>;
}

/// Shape and dtype of one observation or action space.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpaceSpec {
    pub kind: SpaceKind,
    pub shape: Vec<u32>,
    pub dtype: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpaceKind {
    /// A bounded numeric box.
    Box,
    /// A finite choice, encoded as a scalar index.
    Discrete,
}

/// The observation and action spaces of one environment, as carried opaquely
/// in the connect payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpacePair {
    pub observation: SpaceSpec,
    pub action: SpaceSpec,
}

impl SpacePair {
    pub fn to_payload(&self) -> Result<Vec<u8>, FabricError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> Result<SpacePair, FabricError> {
        Ok(serde_json::from_slice(payload)?)
    }
}
