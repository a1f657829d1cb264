//! Command buffering for the server lockstep loop.
//!
//! Commands accepted between two seals wait here. Draining yields them in
//! the deterministic seal order: ascending client id, then arrival order
//! within each client. Every server replaying the same arrivals produces the
//! same turn.

use std::collections::BTreeMap;

use turnsync_lockstep::{ClientId, Command};

use crate::validation::BufferResult;

#[derive(Debug, Default)]
struct ClientQueue {
    commands: Vec<Command>,
    /// Commands received for the turn being collected.
    receive_count: u32,
}

#[derive(Debug)]
pub struct CommandBuffer {
    /// Per-turn, per-client limit. 0 means unlimited.
    per_turn_limit: u32,
    queues: BTreeMap<ClientId, ClientQueue>,
}

impl CommandBuffer {
    pub fn new(per_turn_limit: u32) -> Self {
        Self {
            per_turn_limit,
            queues: BTreeMap::new(),
        }
    }

    /// Try to buffer a command for the turn being collected.
    pub fn try_buffer(&mut self, command: Command) -> BufferResult {
        let queue = self.queues.entry(command.client_id).or_default();
        if self.per_turn_limit != 0 && queue.receive_count >= self.per_turn_limit {
            return BufferResult::RateLimited;
        }
        queue.receive_count += 1;
        queue.commands.push(command);
        BufferResult::Accepted
    }

    /// Take every buffered command in seal order and reset the rate limits.
    pub fn drain_ordered(&mut self) -> Vec<Command> {
        let queues = std::mem::take(&mut self.queues);
        queues
            .into_values()
            .flat_map(|queue| queue.commands)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.queues.values().map(|q| q.commands.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(client_id: ClientId, seq: u64) -> Command {
        Command::new(client_id, seq, vec![client_id, seq as u8])
    }

    #[test]
    fn test_drain_orders_by_client_then_arrival() {
        let mut buffer = CommandBuffer::new(0);
        buffer.try_buffer(cmd(2, 1));
        buffer.try_buffer(cmd(0, 1));
        buffer.try_buffer(cmd(2, 2));
        buffer.try_buffer(cmd(1, 7));
        buffer.try_buffer(cmd(0, 2));

        let order: Vec<_> = buffer
            .drain_ordered()
            .iter()
            .map(|c| (c.client_id, c.seq))
            .collect();
        assert_eq!(order, vec![(0, 1), (0, 2), (1, 7), (2, 1), (2, 2)]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_arrival_order_is_kept_within_client() {
        let mut buffer = CommandBuffer::new(0);
        // Arrival order wins over sequence order.
        buffer.try_buffer(cmd(0, 5));
        buffer.try_buffer(cmd(0, 3));
        let seqs: Vec<_> = buffer.drain_ordered().iter().map(|c| c.seq).collect();
        assert_eq!(seqs, vec![5, 3]);
    }

    #[test]
    fn test_rate_limiting_per_turn() {
        let mut buffer = CommandBuffer::new(2);

        let mut accepted = 0;
        let mut dropped = 0;
        for seq in 1..=5 {
            match buffer.try_buffer(cmd(0, seq)) {
                BufferResult::Accepted => accepted += 1,
                BufferResult::RateLimited => dropped += 1,
            }
        }
        assert_eq!(accepted, 2);
        assert_eq!(dropped, 3);

        // Other clients have their own budget.
        assert_eq!(buffer.try_buffer(cmd(1, 1)), BufferResult::Accepted);

        // Draining opens the next turn.
        assert_eq!(buffer.drain_ordered().len(), 3);
        assert_eq!(buffer.try_buffer(cmd(0, 6)), BufferResult::Accepted);
    }
}
