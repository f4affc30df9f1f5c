// ============================================
// LightGCN Trainer
// ============================================

use super::LightGcn;
use crate::config::LightGcnConfig;
use crate::error::Result;
use crate::models::{EngineKind, LossHistory};
use crate::nn::{seeded_rng, Adam, Tape, Var};
use crate::services::checkpoint::{Checkpoint, Hyperparameters, FORMAT_VERSION};
use crate::services::graph::BipartiteGraph;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

const MAX_REJECTION_TRIES: usize = 64;

/// One BPR triplet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Triplet {
    pub user: usize,
    pub positive: usize,
    pub negative: usize,
}

pub struct LightGcnTrainer {
    model: LightGcn,
    optimizer: Adam,
    history: LossHistory,
    positives: Vec<HashSet<usize>>,
    pairs: Vec<(usize, usize)>,
    mappings: BTreeMap<String, Vec<String>>,
    rng: StdRng,
}

impl LightGcnTrainer {
    pub fn new(config: LightGcnConfig, graph: &BipartiteGraph, seed: u64) -> Self {
        let mut rng = seeded_rng(seed);
        let model = LightGcn::new(config.clone(), graph, &mut rng);
        let optimizer = Adam::new(model.params(), config.learning_rate);
        let pairs = graph
            .interactions()
            .iter()
            .map(|e| (e.user, e.item))
            .collect();

        Self {
            model,
            optimizer,
            history: LossHistory::default(),
            positives: graph.positives_by_user(),
            pairs,
            mappings: mappings(graph),
            rng,
        }
    }

    pub fn model(&self) -> &LightGcn {
        &self.model
    }

    pub fn into_model(self) -> LightGcn {
        self.model
    }

    pub fn history(&self) -> &LossHistory {
        &self.history
    }

    /// Uniform item outside the user's positives; any item if the user has
    /// interacted with everything.
    fn sample_negative(&mut self, user: usize) -> usize {
        let num_items = self.model.num_items();
        let positives = &self.positives[user];
        if positives.len() < num_items {
            for _ in 0..MAX_REJECTION_TRIES {
                let candidate = self.rng.gen_range(0..num_items);
                if !positives.contains(&candidate) {
                    return candidate;
                }
            }
            let remaining: Vec<usize> = (0..num_items).filter(|i| !positives.contains(i)).collect();
            if let Some(&choice) = remaining.choose(&mut self.rng) {
                return choice;
            }
        }
        self.rng.gen_range(0..num_items)
    }

    fn bpr_loss(&self, tape: &mut Tape, batch: &[Triplet]) -> Var {
        let propagation = self.model.propagate(tape);
        let offset = self.model.num_users();

        let users: Vec<usize> = batch.iter().map(|t| t.user).collect();
        let pos: Vec<usize> = batch.iter().map(|t| offset + t.positive).collect();
        let neg: Vec<usize> = batch.iter().map(|t| offset + t.negative).collect();

        let u = tape.gather(propagation.output, &users);
        let p = tape.gather(propagation.output, &pos);
        let n = tape.gather(propagation.output, &neg);

        let up = tape.mul(u, p);
        let pos_scores = tape.row_sum(up);
        let un = tape.mul(u, n);
        let neg_scores = tape.row_sum(un);
        let gap = tape.sub(pos_scores, neg_scores);
        let log_sig = tape.log_sigmoid(gap);
        let mean = tape.mean(log_sig);
        let bpr = tape.scale(mean, -1.0);

        // L2 on round-zero embeddings of the participants, per triplet
        let u0 = tape.gather(propagation.base, &users);
        let p0 = tape.gather(propagation.base, &pos);
        let n0 = tape.gather(propagation.base, &neg);
        let mut norms = Vec::with_capacity(3);
        for v in [u0, p0, n0] {
            let sq = tape.mul(v, v);
            norms.push(tape.row_sum(sq));
        }
        let sum = tape.add(norms[0], norms[1]);
        let sum = tape.add(sum, norms[2]);
        let reg = tape.mean(sum);
        let reg = tape.scale(reg, self.model.config().reg_weight);

        tape.add(bpr, reg)
    }

    fn train_step(&mut self, batch: &[Triplet]) -> f32 {
        let mut tape = Tape::new();
        let loss = self.bpr_loss(&mut tape, batch);
        let value = tape.scalar(loss);
        let grads = tape.backward(loss);
        self.optimizer.step(self.model.params_mut(), grads);
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
            let loss = self.train_step(&batch);
            debug!(batch = batches, loss, "LightGCN batch");
            total += loss;
            batches += 1;
        }
        total / batches.max(1) as f32
    }

    /// Runs up to `epochs` epochs. An empty graph runs none.
    pub fn train(&mut self, epochs: usize) -> LossHistory {
        let mut run = LossHistory::default();
        if self.pairs.is_empty() || self.model.num_items() == 0 {
            info!("No positive interactions, skipping LightGCN training");
            return run;
        }

        info!(
            epochs,
            users = self.model.num_users(),
            items = self.model.num_items(),
            pairs = self.pairs.len(),
            "Starting LightGCN training"
        );
        for epoch in 0..epochs {
            let loss = self.train_epoch();
            run.push(loss);
            self.history.push(loss);
            if epoch % 10 == 0 || epoch + 1 == epochs {
                info!(epoch = epoch + 1, epochs, loss, "LightGCN epoch");
            }
        }
        run
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            format_version: FORMAT_VERSION,
            engine: EngineKind::LightGcn,
            hyperparameters: Hyperparameters::LightGcn(self.model.config().clone()),
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
            EngineKind::LightGcn,
            &Hyperparameters::LightGcn(self.model.config().clone()),
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

fn mappings(graph: &BipartiteGraph) -> BTreeMap<String, Vec<String>> {
    let mut m = BTreeMap::new();
    m.insert("user".to_string(), graph.users.ids().to_vec());
    m.insert("game".to_string(), graph.items.ids().to_vec());
    m
}
