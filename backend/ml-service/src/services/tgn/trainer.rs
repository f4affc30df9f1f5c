// ============================================
// TGN Trainer
// ============================================
//
// Chronological, unshuffled batches. Messages from batch i update memory at
// the start of batch i + 1 on that batch's tape, so the GRU and message
// function receive gradients; the updated rows are then written back as
// plain arrays, which cuts the chain at every optimizer step.

use super::memory::MemoryState;
use super::{neighbors_before, MemoryMessage, Neighbor, TgnModel};
use crate::config::TgnConfig;
use crate::error::{AppError, Result};
use crate::models::{EngineKind, LossHistory};
use crate::nn::{seeded_rng, Adam, Tape, Var};
use crate::services::checkpoint::{Checkpoint, Hyperparameters, FORMAT_VERSION};
use crate::services::graph::{TemporalEdge, TemporalGraph};
use chrono::Utc;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

const MEMORY_BUFFER: &str = "memory";
const LAST_UPDATE_BUFFER: &str = "last_update";
const MAX_REJECTION_TRIES: usize = 64;

pub struct TgnTrainer {
    model: TgnModel,
    optimizer: Adam,
    history: LossHistory,
    edges: Vec<TemporalEdge>,
    user_items: Vec<HashSet<usize>>,
    memory: MemoryState,
    mappings: BTreeMap<String, Vec<String>>,
    rng: StdRng,
    step_graph_sizes: Vec<usize>,
}

impl TgnTrainer {
    pub fn new(config: TgnConfig, graph: &TemporalGraph, seed: u64) -> Self {
        let mut rng = seeded_rng(seed);
        let model = TgnModel::new(config.clone(), graph.num_users(), graph.num_items(), &mut rng);
        let optimizer = Adam::new(model.params(), config.learning_rate).with_grad_clip(config.grad_clip);

        let mut user_items = vec![HashSet::new(); graph.num_users()];
        for edge in &graph.edges {
            user_items[edge.user].insert(edge.item);
        }

        let mut mappings = BTreeMap::new();
        mappings.insert("user".to_string(), graph.users.ids().to_vec());
        mappings.insert("game".to_string(), graph.items.ids().to_vec());

        Self {
            memory: MemoryState::zeros(graph.num_users(), config.memory_dim),
            model,
            optimizer,
            history: LossHistory::default(),
            edges: graph.edges.clone(),
            user_items,
            mappings,
            rng,
            step_graph_sizes: Vec::new(),
        }
    }

    pub fn model(&self) -> &TgnModel {
        &self.model
    }

    pub fn memory(&self) -> &MemoryState {
        &self.memory
    }

    pub fn history(&self) -> &LossHistory {
        &self.history
    }

    /// Recorded node count of every training step's tape.
    pub fn step_graph_sizes(&self) -> &[usize] {
        &self.step_graph_sizes
    }

    pub fn into_parts(self) -> (TgnModel, MemoryState) {
        (self.model, self.memory)
    }

    fn sample_negative(&mut self, user: usize) -> usize {
        let num_items = self.model.num_items();
        let seen = &self.user_items[user];
        if seen.len() < num_items {
            for _ in 0..MAX_REJECTION_TRIES {
                let candidate = self.rng.gen_range(0..num_items);
                if !seen.contains(&candidate) {
                    return candidate;
                }
            }
            let remaining: Vec<usize> = (0..num_items).filter(|i| !seen.contains(i)).collect();
            if let Some(&choice) = remaining.choose(&mut self.rng) {
                return choice;
            }
        }
        self.rng.gen_range(0..num_items)
    }

    /// Memory for `users`, taking rows updated on this tape where present.
    fn batch_memory(
        &self,
        tape: &mut Tape,
        users: &[usize],
        updated: Option<(Var, &HashMap<usize, usize>)>,
    ) -> Var {
        let stored = tape.constant(self.memory.rows(users));
        let Some((updated, positions)) = updated else {
            return stored;
        };

        let num_updated = positions.len();
        let keep_stored = Array2::from_shape_fn((users.len(), 1), |(i, _)| {
            if positions.contains_key(&users[i]) {
                0.0
            } else {
                1.0
            }
        });
        let picks: Vec<usize> = users
            .iter()
            .map(|u| positions.get(u).copied().unwrap_or(num_updated))
            .collect();

        let zero_row = tape.constant(Array2::zeros((1, self.model.config().memory_dim)));
        let extended = tape.concat_rows(&[updated, zero_row]);
        let from_updated = tape.gather(extended, &picks);
        let keep_stored = tape.constant(keep_stored);
        let kept = tape.mul_col(stored, keep_stored);
        tape.add(kept, from_updated)
    }

    fn apply_messages(&self, tape: &mut Tape, pending: &[MemoryMessage]) -> Var {
        let users: Vec<usize> = pending.iter().map(|m| m.user).collect();
        let memory = tape.constant(self.memory.rows(&users));
        let last = self.memory.times(&users);
        self.model.update_memory(tape, memory, pending, &last)
    }

    fn train_step(
        &mut self,
        batch: &[TemporalEdge],
        pending: &[MemoryMessage],
        seen: &HashMap<usize, Vec<Neighbor>>,
    ) -> f32 {
        let users: Vec<usize> = batch.iter().map(|e| e.user).collect();
        let positives: Vec<usize> = batch.iter().map(|e| e.item).collect();
        let negatives: Vec<usize> = users.iter().map(|&u| self.sample_negative(u)).collect();
        let times: Vec<f64> = batch.iter().map(|e| e.timestamp).collect();
        let limit = self.model.config().num_neighbors;
        let contexts: Vec<Vec<Neighbor>> = batch
            .iter()
            .map(|e| {
                seen.get(&e.user)
                    .map(|h| neighbors_before(h, e.timestamp, limit))
                    .unwrap_or_default()
            })
            .collect();

        let mut tape = Tape::new();
        let updated = if pending.is_empty() {
            None
        } else {
            Some(self.apply_messages(&mut tape, pending))
        };
        let positions: HashMap<usize, usize> =
            pending.iter().enumerate().map(|(i, m)| (m.user, i)).collect();

        let memory = self.batch_memory(&mut tape, &users, updated.map(|v| (v, &positions)));
        let user_emb = self.model.embed_users(&mut tape, &users, memory, &contexts, &times);
        let pos = self.model.items(&mut tape, &positives);
        let neg = self.model.items(&mut tape, &negatives);

        let up = tape.mul(user_emb, pos);
        let pos_scores = tape.row_sum(up);
        let un = tape.mul(user_emb, neg);
        let neg_scores = tape.row_sum(un);
        let gap = tape.sub(pos_scores, neg_scores);
        let log_sig = tape.log_sigmoid(gap);
        let mean = tape.mean(log_sig);
        let loss = tape.scale(mean, -1.0);

        let value = tape.scalar(loss);
        let grads = tape.backward(loss);
        self.optimizer.step(self.model.params_mut(), grads);

        // Detach: keep only the values of the updated rows
        if let Some(updated) = updated {
            let users: Vec<usize> = pending.iter().map(|m| m.user).collect();
            let times: Vec<f64> = pending.iter().map(|m| m.timestamp).collect();
            let values = tape.value(updated).clone();
            self.memory.write_rows(&users, &values, &times);
        }
        self.step_graph_sizes.push(tape.len());

        value
    }

    /// Applies messages outside of any optimizer step.
    fn flush(&mut self, pending: &[MemoryMessage]) {
        if pending.is_empty() {
            return;
        }
        let mut tape = Tape::new();
        let updated = self.apply_messages(&mut tape, pending);
        let users: Vec<usize> = pending.iter().map(|m| m.user).collect();
        let times: Vec<f64> = pending.iter().map(|m| m.timestamp).collect();
        let values = tape.value(updated).clone();
        self.memory.write_rows(&users, &values, &times);
    }

    pub fn train_epoch(&mut self) -> f32 {
        self.memory = MemoryState::zeros(self.model.num_users(), self.model.config().memory_dim);
        let mut seen: HashMap<usize, Vec<Neighbor>> = HashMap::new();
        let mut pending: Vec<MemoryMessage> = Vec::new();

        let edges = self.edges.clone();
        let batch_size = self.model.config().batch_size.max(1);
        let mut total = 0.0;
        let mut batches = 0;

        for chunk in edges.chunks(batch_size) {
            let loss = self.train_step(chunk, &pending, &seen);
            debug!(batch = batches, loss, "TGN batch");
            total += loss;
            batches += 1;

            for edge in chunk {
                seen.entry(edge.user).or_default().push(Neighbor {
                    item: edge.item,
                    timestamp: edge.timestamp,
                });
            }
            pending = last_message_per_user(chunk);
        }
        self.flush(&pending);

        total / batches.max(1) as f32
    }

    pub fn train(&mut self, epochs: usize) -> LossHistory {
        let mut run = LossHistory::default();
        if self.edges.is_empty() || self.model.num_items() == 0 {
            info!("No temporal edges, skipping TGN training");
            return run;
        }

        info!(
            epochs,
            users = self.model.num_users(),
            items = self.model.num_items(),
            edges = self.edges.len(),
            "Starting TGN training"
        );
        for epoch in 0..epochs {
            let loss = self.train_epoch();
            run.push(loss);
            self.history.push(loss);
            if epoch % 5 == 0 || epoch + 1 == epochs {
                info!(epoch = epoch + 1, epochs, loss, "TGN epoch");
            }
        }
        run
    }

    pub fn checkpoint(&self) -> Checkpoint {
        let mut buffers = BTreeMap::new();
        buffers.insert(MEMORY_BUFFER.to_string(), self.memory.memory.clone());
        buffers.insert(LAST_UPDATE_BUFFER.to_string(), self.memory.times_as_columns());

        Checkpoint {
            format_version: FORMAT_VERSION,
            engine: EngineKind::Tgn,
            hyperparameters: Hyperparameters::Tgn(self.model.config().clone()),
            node_mappings: self.mappings.clone(),
            params: self.model.params().clone(),
            optimizer: self.optimizer.state().clone(),
            train_losses: self.history.losses.clone(),
            buffers,
            created_at: Utc::now(),
        }
    }

    pub fn restore(&mut self, mut checkpoint: Checkpoint) -> Result<()> {
        checkpoint.verify(
            EngineKind::Tgn,
            &Hyperparameters::Tgn(self.model.config().clone()),
            &self.mappings,
        )?;
        self.model.params().check_compatible(&checkpoint.params)?;

        let memory = checkpoint
            .buffers
            .remove(MEMORY_BUFFER)
            .ok_or_else(|| AppError::Checkpoint("missing memory buffer".to_string()))?;
        let last_update = checkpoint
            .buffers
            .remove(LAST_UPDATE_BUFFER)
            .ok_or_else(|| AppError::Checkpoint("missing last_update buffer".to_string()))?;
        if memory.dim() != self.memory.memory.dim() || last_update.dim() != (memory.nrows(), 2) {
            return Err(AppError::ShapeMismatch("memory buffer shape".to_string()));
        }

        let mut optimizer = self.optimizer.clone();
        optimizer.load_state(checkpoint.optimizer)?;

        self.model.params_mut().load_from(&checkpoint.params)?;
        self.optimizer = optimizer;
        self.memory = MemoryState {
            memory,
            last_update: MemoryState::times_from_columns(&last_update),
        };
        self.history = LossHistory {
            losses: checkpoint.train_losses,
        };
        Ok(())
    }
}

/// One message per user: the latest interaction in the batch.
fn last_message_per_user(batch: &[TemporalEdge]) -> Vec<MemoryMessage> {
    let mut latest: BTreeMap<usize, MemoryMessage> = BTreeMap::new();
    for edge in batch {
        latest.insert(
            edge.user,
            MemoryMessage {
                user: edge.user,
                item: edge.item,
                timestamp: edge.timestamp,
                event: edge.event,
                weight: edge.weight,
            },
        );
    }
    latest.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventCode;
    use crate::services::graph::NodeIndex;
    use crate::services::tgn::tests::tiny_config;

    /// Every user interacts in every batch so the step shape repeats.
    fn stream(num_batches: usize) -> TemporalGraph {
        let users = NodeIndex::from_ids((0..4).map(|i| format!("u{i}")));
        let items = NodeIndex::from_ids((0..6).map(|i| format!("g{i}")));
        let mut edges = Vec::new();
        let mut t = 1_000.0;
        for b in 0..num_batches {
            for u in 0..4 {
                edges.push(TemporalEdge {
                    user: u,
                    item: (u + b) % 5,
                    timestamp: t,
                    event: EventCode::Click,
                    weight: 1.0,
                });
                t += 60.0;
            }
        }
        TemporalGraph { users, items, edges }
    }

    #[test]
    fn test_empty_stream_zero_epochs() {
        let mut trainer = TgnTrainer::new(tiny_config(), &TemporalGraph::default(), 1);
        assert!(trainer.train(3).is_empty());
    }

    #[test]
    fn test_tape_size_does_not_grow_across_steps() {
        let mut trainer = TgnTrainer::new(tiny_config(), &stream(8), 5);
        trainer.train(2);

        let sizes = trainer.step_graph_sizes();
        assert_eq!(sizes.len(), 16);
        // First step of each epoch has no pending messages; the rest share
        // one shape regardless of how many steps came before.
        let steady = sizes[1];
        assert!(sizes[1..8].iter().all(|&s| s == steady));
        assert!(sizes[9..].iter().all(|&s| s == steady));
        assert_eq!(sizes[0], sizes[8]);
    }

    #[test]
    fn test_memory_updated_and_finite() {
        let mut trainer = TgnTrainer::new(tiny_config(), &stream(3), 9);
        trainer.train(1);
        let memory = trainer.memory();
        assert!(memory.memory.iter().all(|v| v.is_finite()));
        assert!(memory.memory.iter().any(|v| *v != 0.0));
        assert!(memory.last_update.iter().all(|&t| t > 0.0));
    }

    #[test]
    fn test_chronological_messages_keep_latest() {
        let graph = stream(1);
        let mut batch = graph.edges.clone();
        batch.push(TemporalEdge {
            user: 0,
            item: 4,
            timestamp: 99_999.0,
            event: EventCode::Play,
            weight: 2.0,
        });
        let messages = last_message_per_user(&batch);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].item, 4);
    }

    #[test]
    fn test_restore_brings_memory_back() {
        let graph = stream(3);
        let mut trainer = TgnTrainer::new(tiny_config(), &graph, 2);
        trainer.train(1);
        let ckpt = trainer.checkpoint();

        let mut fresh = TgnTrainer::new(tiny_config(), &graph, 77);
        fresh.restore(ckpt).unwrap();
        assert_eq!(fresh.memory().memory, trainer.memory().memory);
        assert_eq!(fresh.model().params(), trainer.model().params());
        for (a, b) in fresh.memory().last_update.iter().zip(&trainer.memory().last_update) {
            assert!((a - b).abs() < 0.01);
        }
    }
}
