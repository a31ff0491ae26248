//! The training-loop-facing surface: a vectorised environment whose slots
//! live in remote worker processes. Mostly a thin wrapper over
//! [`Controller`], plus the action/space encoding the wire keeps opaque.

use log::info;

use crate::config::ControllerConfig;
use crate::controller::{Controller, StepBatch};
use crate::env::SpacePair;
use crate::error::FabricError;
use crate::proto::{self, ActionBatch, Tensor};

/// A synchronous vector of `N` remote environments.
///
/// `reset` and `step` block until every slot has answered; the split
/// `step_async`/`step_wait` pair lets the caller overlap local work with the
/// remote step. After [`FederatedVecEnv::close`] every operation fails with
/// [`FabricError::Closed`].
pub struct FederatedVecEnv {
    controller: Controller,
    spaces: SpacePair,
    step_pending: bool,
}

impl FederatedVecEnv {
    /// Binds the endpoints and blocks until all `N` workers have joined.
    pub fn new(config: ControllerConfig) -> Result<FederatedVecEnv, FabricError> {
        let mut controller = Controller::new(config)?;
        let payload = controller.initialize()?;
        let spaces = SpacePair::from_payload(&payload)?;
        info!(
            "vec env: {} environments ready, observation space {:?}",
            controller.number_of_environments(),
            spaces.observation
        );
        Ok(FederatedVecEnv {
            controller,
            spaces,
            step_pending: false,
        })
    }

    pub fn num_envs(&self) -> usize {
        self.controller.number_of_environments()
    }

    pub fn observation_space(&self) -> &crate::env::SpaceSpec {
        &self.spaces.observation
    }

    pub fn action_space(&self) -> &crate::env::SpaceSpec {
        &self.spaces.action
    }

    /// Resets every environment, cancelling any pending step, and returns
    /// the batched first observations.
    pub fn reset(&mut self) -> Result<Vec<Tensor>, FabricError> {
        self.step_pending = false;
        self.controller.reset_environments()
    }

    /// Starts a step with one action per slot. The results are collected by
    /// [`FederatedVecEnv::step_wait`].
    pub fn step_async(&mut self, actions: &[Tensor]) -> Result<(), FabricError> {
        if actions.len() != self.num_envs() {
            return Err(FabricError::protocol(format!(
                "{} actions supplied for {} environments",
                actions.len(),
                self.num_envs()
            )));
        }
        let batch = ActionBatch {
            actions: actions.to_vec(),
        };
        self.controller.send_actions(proto::encode(&batch))?;
        self.step_pending = true;
        Ok(())
    }

    /// Blocks for the step started by [`FederatedVecEnv::step_async`].
    pub fn step_wait(&mut self) -> Result<StepBatch, FabricError> {
        if self.controller.is_closed() {
            return Err(FabricError::Closed);
        }
        if !self.step_pending {
            return Err(FabricError::protocol("step_wait without a pending step"));
        }
        let batch = self.controller.gather_frames()?;
        self.step_pending = false;
        Ok(batch)
    }

    /// `step_async` and `step_wait` in one call.
    pub fn step(&mut self, actions: &[Tensor]) -> Result<StepBatch, FabricError> {
        self.step_async(actions)?;
        self.step_wait()
    }

    /// Tears the fabric down. A second close fails with
    /// [`FabricError::Closed`] and mutates nothing further.
    pub fn close(&mut self) -> Result<(), FabricError> {
        self.controller.close_environments()
    }
}
