// ============================================
// HGT Trainer
// ============================================

use super::Hgt;
use crate::config::HgtConfig;
use crate::error::Result;
use crate::models::{EngineKind, LossHistory};
use crate::nn::{seeded_rng, Adam, Tape, Var};
use crate::services::checkpoint::{Checkpoint, Hyperparameters, FORMAT_VERSION};
use crate::services::graph::hetero::{PLAYED, RATED};
use crate::services::graph::{HeteroGraph, NodeType};
use crate::services::lightgcn::trainer::Triplet;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info};

const MAX_REJECTION_TRIES: usize = 64;

pub struct HgtTrainer {
    model: Hgt,
    optimizer: Adam,
    history: LossHistory,
    positives: Vec<HashSet<usize>>,
    pairs: Vec<(usize, usize)>,
    mappings: BTreeMap<String, Vec<String>>,
    rng: StdRng,
}

impl HgtTrainer {
    pub fn new(config: HgtConfig, graph: &HeteroGraph, seed: u64) -> Self {
        let mut rng = seeded_rng(seed);
        let model = Hgt::new(config.clone(), graph, &mut rng);
        let optimizer = Adam::new(model.params(), config.learning_rate).with_grad_clip(config.grad_clip);

        // Played and rated edges both count as positives
        let mut unique: BTreeSet<(usize, usize)> = BTreeSet::new();
        for edge_type in [PLAYED, RATED] {
            if let Some(block) = graph.edges(&edge_type) {
                unique.extend(block.src.iter().copied().zip(block.dst.iter().copied()));
            }
        }
        let mut positives = vec![HashSet::new(); graph.num_nodes(NodeType::User)];
        for &(user, game) in &unique {
            positives[user].insert(game);
        }

        Self {
            model,
            optimizer,
            history: LossHistory::default(),
            positives,
            pairs: unique.into_iter().collect(),
            mappings: graph.mappings(),
            rng,
        }
    }

    pub fn model(&self) -> &Hgt {
        &self.model
    }

    pub fn into_model(self) -> Hgt {
        self.model
    }

    pub fn history(&self) -> &LossHistory {
        &self.history
    }

    pub fn num_pairs(&self) -> usize {
        self.pairs.len()
    }

    fn sample_negative(&mut self, user: usize) -> usize {
        let num_games = self.model.num_nodes(NodeType::Game);
        let positives = &self.positives[user];
        if positives.len() < num_games {
            for _ in 0..MAX_REJECTION_TRIES {
                let candidate = self.rng.gen_range(0..num_games);
                if !positives.contains(&candidate) {
                    return candidate;
                }
            }
            let remaining: Vec<usize> = (0..num_games).filter(|g| !positives.contains(g)).collect();
            if let Some(&choice) = remaining.choose(&mut self.rng) {
                return choice;
            }
        }
        self.rng.gen_range(0..num_games)
    }

    fn bpr_loss(&self, tape: &mut Tape, batch: &[Triplet]) -> Option<Var> {
        let outputs = self.model.forward(tape);
        let users_out = *outputs.get(&NodeType::User)?;
        let games_out = *outputs.get(&NodeType::Game)?;

        let users: Vec<usize> = batch.iter().map(|t| t.user).collect();
        let pos: Vec<usize> = batch.iter().map(|t| t.positive).collect();
        let neg: Vec<usize> = batch.iter().map(|t| t.negative).collect();

        let u = tape.gather(users_out, &users);
        let p = tape.gather(games_out, &pos);
        let n = tape.gather(games_out, &neg);

        let up = tape.mul(u, p);
        let pos_scores = tape.row_sum(up);
        let un = tape.mul(u, n);
        let neg_scores = tape.row_sum(un);
        let gap = tape.sub(pos_scores, neg_scores);
        let log_sig = tape.log_sigmoid(gap);
        let mean = tape.mean(log_sig);
        let bpr = tape.scale(mean, -1.0);

        let mut norms = Vec::with_capacity(3);
        for v in [u, p, n] {
            let sq = tape.mul(v, v);
            norms.push(tape.row_sum(sq));
        }
        let sum = tape.add(norms[0], norms[1]);
        let sum = tape.add(sum, norms[2]);
        let reg = tape.mean(sum);
        let reg = tape.scale(reg, self.model.config().reg_weight);

        Some(tape.add(bpr, reg))
    }

    fn train_step(&mut self, batch: &[Triplet]) -> f32 {
        let mut tape = Tape::new();
        let Some(loss) = self.bpr_loss(&mut tape, batch) else {
            return 0.0;
        };
        let value = tape.scalar(loss);
        let grads = tape.backward(loss);
        let norm = self.optimizer.step(self.model.params_mut(), grads);
        debug!(loss = value, grad_norm = norm, "HGT step");
        value
    }

    pub fn train_epoch(&mut self) -> f32 {
        let mut order = self.pairs.clone();
        order.shuffle(&mut self.rng);

        let batch_size = self.model.config().batch_size.max(1);
        let mut total = 0.0;
        let mut batches = 0;
        for chunk in order.chunks(batch_size) {
            let batch: Vec<Triplet> = chunk
                .iter()
                .map(|&(user, positive)| Triplet {
                    user,
                    positive,
                    negative: self.sample_negative(user),
                })
                .collect();
            total += self.train_step(&batch);
            batches += 1;
        }
        total / batches.max(1) as f32
    }

    pub fn train(&mut self, epochs: usize) -> LossHistory {
        let mut run = LossHistory::default();
        if self.pairs.is_empty() || self.model.num_nodes(NodeType::Game) == 0 {
            info!("No user-game edges, skipping HGT training");
            return run;
        }

        info!(
            epochs,
            users = self.model.num_nodes(NodeType::User),
            games = self.model.num_nodes(NodeType::Game),
            pairs = self.pairs.len(),
            params = self.model.params().num_scalars(),
            "Starting HGT training"
        );
        for epoch in 0..epochs {
            let loss = self.train_epoch();
            run.push(loss);
            self.history.push(loss);
            if epoch % 10 == 0 || epoch + 1 == epochs {
                info!(epoch = epoch + 1, epochs, loss, "HGT epoch");
            }
        }
        run
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            format_version: FORMAT_VERSION,
            engine: EngineKind::Hgt,
            hyperparameters: Hyperparameters::Hgt(self.model.config().clone()),
            node_mappings: self.mappings.clone(),
            params: self.model.params().clone(),
            optimizer: self.optimizer.state().clone(),
            train_losses: self.history.losses.clone(),
            buffers: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// All-or-nothing restore; on error the trainer is unchanged.
    pub fn restore(&mut self, checkpoint: Checkpoint) -> Result<()> {
        checkpoint.verify(
            EngineKind::Hgt,
            &Hyperparameters::Hgt(self.model.config().clone()),
            &self.mappings,
        )?;
        self.model.params().check_compatible(&checkpoint.params)?;

        let mut optimizer = self.optimizer.clone();
        optimizer.load_state(checkpoint.optimizer)?;

        self.model.params_mut().load_from(&checkpoint.params)?;
        self.optimizer = optimizer;
        self.history = LossHistory {
            losses: checkpoint.train_losses,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::hgt::tests::{sample_graph, tiny_config};

    #[test]
    fn test_positive_pairs_from_played_and_rated() {
        let graph = sample_graph();
        let trainer = HgtTrainer::new(tiny_config(), &graph, 1);
        assert_eq!(trainer.num_pairs(), 5);
    }

    #[test]
    fn test_loss_decreases() {
        let mut trainer = HgtTrainer::new(tiny_config(), &sample_graph(), 21);
        let run = trainer.train(50);
        assert_eq!(run.len(), 50);
        let first = run.losses[0];
        let last = run.last().unwrap_or(f32::MAX);
        assert!(last.is_finite());
        assert!(last < first, "loss did not decrease: {first} -> {last}");
    }

    #[test]
    fn test_empty_graph_runs_zero_epochs() {
        let mut trainer = HgtTrainer::new(tiny_config(), &HeteroGraph::default(), 1);
        assert!(trainer.train(5).is_empty());
    }

    #[test]
    fn test_restore_is_all_or_nothing() {
        let graph = sample_graph();
        let mut trainer = HgtTrainer::new(tiny_config(), &graph, 4);
        trainer.train(2);
        let ckpt = trainer.checkpoint();

        let mut fresh = HgtTrainer::new(tiny_config(), &graph, 8);
        fresh.restore(ckpt.clone()).unwrap();
        assert_eq!(fresh.model().params(), trainer.model().params());

        let other_config = HgtConfig {
            num_layers: 1,
            ..tiny_config()
        };
        let mut other = HgtTrainer::new(other_config, &graph, 8);
        let before = other.model().params().clone();
        assert!(other.restore(ckpt).is_err());
        assert_eq!(other.model().params(), &before);
    }
}
