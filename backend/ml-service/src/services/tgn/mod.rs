// ============================================
// TGN: temporal memory + attention
// ============================================
//
// Per-user memory updated by a GRU over interaction messages, plus
// multi-head attention over recent items keyed by their time encoding.

pub mod inference;
pub mod memory;
pub mod trainer;

pub use inference::{HistoryEntry, TgnInference};
pub use memory::{MemoryState, MemoryStore};
pub use trainer::TgnTrainer;

use crate::config::TgnConfig;
use crate::models::EventCode;
use crate::nn::{xavier_uniform, GruCell, Linear, Mlp, ParamId, ParamStore, Tape, Var};
use ndarray::Array2;
use rand::rngs::StdRng;

/// A past interaction visible to the attention layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub item: usize,
    pub timestamp: f64,
}

/// Raw inputs for one memory update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryMessage {
    pub user: usize,
    pub item: usize,
    pub timestamp: f64,
    pub event: EventCode,
    pub weight: f32,
}

#[derive(Debug, Clone)]
pub struct TgnModel {
    config: TgnConfig,
    num_users: usize,
    num_items: usize,
    params: ParamStore,
    user_embedding: ParamId,
    item_embedding: ParamId,
    event_embedding: ParamId,
    time_encoder: Linear,
    interaction_encoder: Mlp,
    message_fn: Mlp,
    memory_updater: GruCell,
    query: Linear,
    key: Linear,
    value: Linear,
    attention_out: Linear,
    combiner: Mlp,
}

impl TgnModel {
    pub fn new(config: TgnConfig, num_users: usize, num_items: usize, rng: &mut StdRng) -> Self {
        let emb = config.embedding_dim;
        let mem = config.memory_dim;
        let msg = config.message_dim;
        let time = config.time_dim;
        let event_dim = (msg / 4).max(1);

        let mut params = ParamStore::default();
        let user_embedding = params.add("user_embedding", xavier_uniform(num_users, emb, rng));
        let item_embedding = params.add("item_embedding", xavier_uniform(num_items, emb, rng));
        let event_embedding =
            params.add("event_embedding", xavier_uniform(EventCode::COUNT, event_dim, rng));
        let time_encoder = Linear::new(&mut params, "time_encoder", 1, time, rng);
        let interaction_encoder =
            Mlp::new(&mut params, "interaction_encoder", event_dim + 1 + time, msg, msg, rng);
        let message_fn = Mlp::new(&mut params, "message_fn", mem + emb + msg, msg, msg, rng);
        let memory_updater = GruCell::new(&mut params, "memory_updater", msg, mem, rng);
        let query = Linear::new(&mut params, "attention.q_proj", emb, emb, rng);
        let key = Linear::new(&mut params, "attention.k_proj", emb + time, emb, rng);
        let value = Linear::new(&mut params, "attention.v_proj", emb + time, emb, rng);
        let attention_out = Linear::new(&mut params, "attention.out_proj", emb, emb, rng);
        let combiner = Mlp::new(&mut params, "combiner", emb + mem, emb, emb, rng);

        Self {
            config,
            num_users,
            num_items,
            params,
            user_embedding,
            item_embedding,
            event_embedding,
            time_encoder,
            interaction_encoder,
            message_fn,
            memory_updater,
            query,
            key,
            value,
            attention_out,
            combiner,
        }
    }

    pub fn config(&self) -> &TgnConfig {
        &self.config
    }

    pub fn num_users(&self) -> usize {
        self.num_users
    }

    pub fn num_items(&self) -> usize {
        self.num_items
    }

    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }

    /// Base item embeddings used for scoring.
    pub fn item_table(&self) -> &Array2<f32> {
        self.params.get(self.item_embedding)
    }

    pub fn items(&self, tape: &mut Tape, items: &[usize]) -> Var {
        tape.param_rows(&self.params, self.item_embedding, items)
    }

    /// `log(1 + |dt|)` through a linear map, sine on the first half of the
    /// output and cosine on the second.
    pub fn encode_time(&self, tape: &mut Tape, deltas: &[f64]) -> Var {
        let x = Array2::from_shape_fn((deltas.len(), 1), |(i, _)| (deltas[i].abs().ln_1p()) as f32);
        let x = tape.constant(x);
        let projected = self.time_encoder.forward(tape, &self.params, x);
        let half = self.config.time_dim / 2;
        let first = tape.slice_cols(projected, 0, half);
        let second = tape.slice_cols(projected, half, self.config.time_dim);
        let sin = tape.sin(first);
        let cos = tape.cos(second);
        tape.concat_cols(&[sin, cos])
    }

    fn interaction_features(&self, tape: &mut Tape, messages: &[MemoryMessage], deltas: &[f64]) -> Var {
        let codes: Vec<usize> = messages.iter().map(|m| m.event.index()).collect();
        let events = tape.param_rows(&self.params, self.event_embedding, &codes);
        let weights = Array2::from_shape_fn((messages.len(), 1), |(i, _)| messages[i].weight);
        let weights = tape.constant(weights);
        let time = self.encode_time(tape, deltas);
        let joined = tape.concat_cols(&[events, weights, time]);
        self.interaction_encoder.forward(tape, &self.params, joined)
    }

    /// GRU update of `memory` (one row per message). `last_update` holds
    /// each row's previous update time.
    pub fn update_memory(
        &self,
        tape: &mut Tape,
        memory: Var,
        messages: &[MemoryMessage],
        last_update: &[f64],
    ) -> Var {
        let deltas: Vec<f64> = messages
            .iter()
            .zip(last_update)
            .map(|(m, last)| m.timestamp - last)
            .collect();
        let features = self.interaction_features(tape, messages, &deltas);
        let items: Vec<usize> = messages.iter().map(|m| m.item).collect();
        let item_emb = self.items(tape, &items);
        let input = tape.concat_cols(&[memory, item_emb, features]);
        let message = self.message_fn.forward(tape, &self.params, input);
        self.memory_updater.forward(tape, &self.params, message, memory)
    }

    /// Contextual user embeddings.
    ///
    /// Row `b` attends over `contexts[b]` as seen from `query_times[b]`;
    /// rows without context use the base embedding in place of the
    /// attention output before the combiner.
    pub fn embed_users(
        &self,
        tape: &mut Tape,
        users: &[usize],
        memory: Var,
        contexts: &[Vec<Neighbor>],
        query_times: &[f64],
    ) -> Var {
        let batch = users.len();
        let base = tape.param_rows(&self.params, self.user_embedding, users);

        let mut segments = Vec::new();
        let mut items = Vec::new();
        let mut deltas = Vec::new();
        for (b, neighbors) in contexts.iter().enumerate() {
            for n in neighbors {
                segments.push(b);
                items.push(n.item);
                deltas.push(query_times[b] - n.timestamp);
            }
        }

        let context = if segments.is_empty() {
            base
        } else {
            let attended = self.attend(tape, base, &segments, &items, &deltas, batch);
            let has_context = Array2::from_shape_fn((batch, 1), |(b, _)| {
                if contexts[b].is_empty() {
                    0.0
                } else {
                    1.0
                }
            });
            let no_context = has_context.mapv(|v| 1.0 - v);
            let has_context = tape.constant(has_context);
            let no_context = tape.constant(no_context);
            let from_attention = tape.mul_col(attended, has_context);
            let from_base = tape.mul_col(base, no_context);
            tape.add(from_attention, from_base)
        };

        let joined = tape.concat_cols(&[context, memory]);
        self.combiner.forward(tape, &self.params, joined)
    }

    fn attend(
        &self,
        tape: &mut Tape,
        base: Var,
        segments: &[usize],
        items: &[usize],
        deltas: &[f64],
        batch: usize,
    ) -> Var {
        let heads = self.config.num_heads;
        let head_dim = self.config.embedding_dim / heads;

        let q = self.query.forward(tape, &self.params, base);
        let q = tape.gather(q, segments);

        let neighbor_items = self.items(tape, items);
        let time = self.encode_time(tape, deltas);
        let kv_input = tape.concat_cols(&[neighbor_items, time]);
        let k = self.key.forward(tape, &self.params, kv_input);
        let v = self.value.forward(tape, &self.params, kv_input);

        let qk = tape.mul(q, k);
        let mut head_scores = Vec::with_capacity(heads);
        for h in 0..heads {
            let slice = tape.slice_cols(qk, h * head_dim, (h + 1) * head_dim);
            head_scores.push(tape.row_sum(slice));
        }
        let scores = tape.concat_cols(&head_scores);
        let scores = tape.scale(scores, 1.0 / (head_dim as f32).sqrt());
        let attention = tape.segment_softmax(scores, segments, batch);

        let mut head_outputs = Vec::with_capacity(heads);
        for h in 0..heads {
            let v_h = tape.slice_cols(v, h * head_dim, (h + 1) * head_dim);
            let a_h = tape.slice_cols(attention, h, h + 1);
            let weighted = tape.mul_col(v_h, a_h);
            head_outputs.push(tape.scatter_add(weighted, segments, batch));
        }
        let merged = tape.concat_cols(&head_outputs);
        self.attention_out.forward(tape, &self.params, merged)
    }
}

/// Last `limit` neighbors strictly before `before`, oldest first.
pub fn neighbors_before(history: &[Neighbor], before: f64, limit: usize) -> Vec<Neighbor> {
    latest(history.iter().filter(|n| n.timestamp < before), limit)
}

/// Last `limit` neighbors at or before `until`, oldest first.
pub fn neighbors_until(history: &[Neighbor], until: f64, limit: usize) -> Vec<Neighbor> {
    latest(history.iter().filter(|n| n.timestamp <= until), limit)
}

fn latest<'a, I>(visible: I, limit: usize) -> Vec<Neighbor>
where
    I: Iterator<Item = &'a Neighbor>,
{
    let visible: Vec<Neighbor> = visible.copied().collect();
    let skip = visible.len().saturating_sub(limit);
    visible[skip..].to_vec()
}
