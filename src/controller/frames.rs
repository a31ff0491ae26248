//! The per-step frame buffer: one cell per environment slot, filled by the
//! request handler and drained as a batch once every slot has reported.
//!
//! Each cell carries the previous round's observation so that a slot whose
//! worker vanished can be substituted without changing the batch shape.

use crate::proto::Tensor;

#[derive(Clone, Debug, Default)]
struct Cell {
    observation: Option<Tensor>,
    reward: f64,
    done: bool,
    info: Vec<u8>,
    previous: Option<Tensor>,
}

/// A full gathering round, indexed by env id.
#[derive(Clone, Debug)]
pub struct StepBatch {
    pub observations: Vec<Tensor>,
    pub rewards: Vec<f64>,
    pub dones: Vec<bool>,
    pub infos: Vec<Vec<u8>>,
}

/// Outcome of storing a frame into a cell.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreOutcome {
    Stored,
    /// The slot already reported this round; the duplicate is dropped.
    AlreadyFilled,
}

#[derive(Clone, Debug)]
pub struct FrameBuffer {
    cells: Vec<Cell>,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        FrameBuffer {
            cells: vec![Cell::default(); capacity],
        }
    }

    /// Empties every cell for a new round, keeping the previous observations.
    pub fn clear(&mut self) {
        for cell in &mut self.cells {
            cell.observation = None;
            cell.reward = 0.0;
            cell.done = false;
            cell.info.clear();
        }
    }

    pub fn store(
        &mut self,
        env_id: u32,
        observation: Tensor,
        reward: f64,
        done: bool,
        info: Vec<u8>,
    ) -> StoreOutcome {
        let cell = &mut self.cells[env_id as usize];
        if cell.observation.is_some() {
            return StoreOutcome::AlreadyFilled;
        }
        cell.observation = Some(observation);
        cell.reward = reward;
        cell.done = done;
        cell.info = info;
        StoreOutcome::Stored
    }

    /// Fills an empty cell from its previous observation with `reward = 0`
    /// and `done = true`, so the caller sees an episode termination instead
    /// of a stalled batch. Returns false when no previous observation exists.
    pub fn substitute(&mut self, env_id: u32) -> bool {
        let cell = &mut self.cells[env_id as usize];
        if cell.observation.is_some() {
            return false;
        }
        match &cell.previous {
            Some(previous) => {
                cell.observation = Some(previous.clone());
                cell.reward = 0.0;
                cell.done = true;
                cell.info.clear();
                true
            }
            None => false,
        }
    }

    pub fn is_empty_cell(&self, env_id: u32) -> bool {
        self.cells[env_id as usize].observation.is_none()
    }

    /// Ready iff every slot's observation cell is non-empty.
    pub fn is_ready(&self) -> bool {
        self.cells.iter().all(|cell| cell.observation.is_some())
    }

    /// Drains the round into a batch, rolling each observation over into the
    /// cell's previous-observation carry. Panics if called before readiness;
    /// the coordinator only drains a ready buffer.
    pub fn take_batch(&mut self) -> StepBatch {
        let mut batch = StepBatch {
            observations: Vec::with_capacity(self.cells.len()),
            rewards: Vec::with_capacity(self.cells.len()),
            dones: Vec::with_capacity(self.cells.len()),
            infos: Vec::with_capacity(self.cells.len()),
        };
        for cell in &mut self.cells {
            let observation = cell
                .observation
                .take()
                .expect("frame buffer drained before it was ready");
            cell.previous = Some(observation.clone());
            batch.observations.push(observation);
            batch.rewards.push(std::mem::take(&mut cell.reward));
            batch.dones.push(std::mem::take(&mut cell.done));
            batch.infos.push(std::mem::take(&mut cell.info));
        }
        batch
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn obs(value: u8) -> Tensor {
        Tensor::from_values(vec![1], &[value]).unwrap()
    }

    #[test]
    fn ready_only_when_every_cell_is_filled() {
        let mut frames = FrameBuffer::new(2);
        assert!(!frames.is_ready());
        assert_eq!(frames.store(0, obs(1), 0.5, false, vec![]), StoreOutcome::Stored);
        assert!(!frames.is_ready());
        assert_eq!(frames.store(1, obs(2), 0.0, true, vec![7]), StoreOutcome::Stored);
        assert!(frames.is_ready());

        let batch = frames.take_batch();
        assert_eq!(batch.observations, vec![obs(1), obs(2)]);
        assert_eq!(batch.rewards, vec![0.5, 0.0]);
        assert_eq!(batch.dones, vec![false, true]);
        assert_eq!(batch.infos, vec![vec![], vec![7]]);
        assert!(!frames.is_ready());
    }

    #[test]
    fn duplicates_do_not_overwrite() {
        let mut frames = FrameBuffer::new(1);
        assert_eq!(frames.store(0, obs(1), 1.0, false, vec![]), StoreOutcome::Stored);
        assert_eq!(
            frames.store(0, obs(9), 9.0, true, vec![]),
            StoreOutcome::AlreadyFilled
        );
        let batch = frames.take_batch();
        assert_eq!(batch.observations, vec![obs(1)]);
        assert_eq!(batch.rewards, vec![1.0]);
    }

    #[test]
    fn substitution_reuses_the_previous_observation() {
        let mut frames = FrameBuffer::new(1);
        frames.store(0, obs(3), 2.0, false, vec![]);
        frames.take_batch();
        frames.clear();

        assert!(frames.substitute(0));
        assert!(frames.is_ready());
        let batch = frames.take_batch();
        assert_eq!(batch.observations, vec![obs(3)]);
        assert_eq!(batch.rewards, vec![0.0]);
        assert_eq!(batch.dones, vec![true]);
    }

    #[test]
    fn substitution_needs_a_previous_observation() {
        let mut frames = FrameBuffer::new(1);
        assert!(!frames.substitute(0));
        assert!(!frames.is_ready());
    }

    #[test]
    fn substitution_never_clobbers_a_delivered_frame() {
        let mut frames = FrameBuffer::new(1);
        frames.store(0, obs(1), 1.0, false, vec![]);
        frames.take_batch();
        frames.clear();
        frames.store(0, obs(2), 2.0, false, vec![]);
        assert!(!frames.substitute(0));
        assert_eq!(frames.take_batch().observations, vec![obs(2)]);
    }

    #[test]
    fn clear_preserves_the_carry() {
        let mut frames = FrameBuffer::new(2);
        frames.store(0, obs(1), 0.0, false, vec![]);
        frames.store(1, obs(2), 0.0, false, vec![]);
        frames.take_batch();
        frames.clear();
        assert!(frames.substitute(0));
        assert!(frames.substitute(1));
        let batch = frames.take_batch();
        assert_eq!(batch.observations, vec![obs(1), obs(2)]);
    }
}
