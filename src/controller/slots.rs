//! The authoritative slot table: a bijection between occupied environment
//! slots and connected client ids, plus the monotonic client-id mint.

use std::collections::HashMap;

/// Outcome of asking for a slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SlotDecision {
    /// The client now occupies (or already occupied) this slot.
    Bound(u32),
    /// Every slot is taken; the client should wait and retry.
    Full,
}

#[derive(Clone, Debug, Default)]
pub struct SlotTable {
    capacity: usize,
    client_env: HashMap<u32, u32>,
    env_client: HashMap<u32, u32>,
    last_client_id_assigned: u32,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        SlotTable {
            capacity,
            ..Default::default()
        }
    }

    /// Mints the next client id. No slot is reserved yet.
    pub fn assign_client_id(&mut self) -> u32 {
        let client_id = self.last_client_id_assigned;
        self.last_client_id_assigned += 1;
        client_id
    }

    /// Binds the client to the lowest free slot. Re-binding an already bound
    /// client returns its existing slot, so a retried connect after a lost
    /// reply cannot split the bijection.
    pub fn bind(&mut self, client_id: u32) -> SlotDecision {
        if let Some(&env_id) = self.client_env.get(&client_id) {
            return SlotDecision::Bound(env_id);
        }
        let free = (0..self.capacity as u32).find(|env_id| !self.env_client.contains_key(env_id));
        match free {
            Some(env_id) => {
                self.client_env.insert(client_id, env_id);
                self.env_client.insert(env_id, client_id);
                SlotDecision::Bound(env_id)
            }
            None => SlotDecision::Full,
        }
    }

    /// Removes both sides of the mapping, returning the evicted client.
    pub fn unregister(&mut self, env_id: u32) -> Option<u32> {
        let client_id = self.env_client.remove(&env_id)?;
        self.client_env.remove(&client_id);
        Some(client_id)
    }

    pub fn env_of(&self, client_id: u32) -> Option<u32> {
        self.client_env.get(&client_id).copied()
    }

    pub fn client_of(&self, env_id: u32) -> Option<u32> {
        self.env_client.get(&env_id).copied()
    }

    pub fn occupied(&self) -> usize {
        self.env_client.len()
    }

    pub fn is_full(&self) -> bool {
        self.occupied() == self.capacity
    }

    #[cfg(test)]
    fn is_bijective(&self) -> bool {
        self.client_env.len() == self.env_client.len()
            && self
                .client_env
                .iter()
                .all(|(client, env)| self.env_client.get(env) == Some(client))
    }
}
