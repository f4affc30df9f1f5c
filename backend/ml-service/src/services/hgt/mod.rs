// ============================================
// HGT: heterogeneous graph transformer
// ============================================
//
// Per node type: a base embedding table and key/query/value/output maps.
// Per relation: a head-wise attention map and a message transform.
// Messages are averaged over incoming edges of every relation reaching a
// node type, projected, added to the residual and passed through ReLU.

pub mod inference;
pub mod trainer;

pub use inference::{GameFilter, HgtInference, TypedEmbeddings};
pub use trainer::HgtTrainer;

use crate::config::HgtConfig;
use crate::nn::{xavier_uniform, Linear, ParamId, ParamStore, Tape, Var};
use crate::services::graph::{EdgeBlock, EdgeType, HeteroGraph, NodeType};
use ndarray::Array2;
use rand::rngs::StdRng;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct RelationWeights {
    attention: Linear,
    message: Linear,
}

#[derive(Debug, Clone)]
struct HgtLayer {
    key: BTreeMap<NodeType, Linear>,
    query: BTreeMap<NodeType, Linear>,
    value: BTreeMap<NodeType, Linear>,
    output: BTreeMap<NodeType, Linear>,
    relations: BTreeMap<EdgeType, RelationWeights>,
}

#[derive(Debug, Clone)]
pub struct Hgt {
    config: HgtConfig,
    counts: BTreeMap<NodeType, usize>,
    edges: BTreeMap<EdgeType, EdgeBlock>,
    params: ParamStore,
    base: BTreeMap<NodeType, ParamId>,
    layers: Vec<HgtLayer>,
    projection: BTreeMap<NodeType, Linear>,
}

impl Hgt {
    /// Parameters are created only for node types with nodes and relations
    /// with edges.
    pub fn new(config: HgtConfig, graph: &HeteroGraph, rng: &mut StdRng) -> Self {
        let hidden = config.hidden_dim;
        let counts: BTreeMap<NodeType, usize> = NodeType::ALL
            .iter()
            .map(|&nt| (nt, graph.num_nodes(nt)))
            .filter(|(_, n)| *n > 0)
            .collect();
        let edges: BTreeMap<EdgeType, EdgeBlock> = graph
            .edge_types()
            .map(|(et, block)| (*et, block.clone()))
            .collect();

        let mut params = ParamStore::default();
        let base = counts
            .iter()
            .map(|(&nt, &n)| {
                let name = format!("embedding.{}", nt.as_str());
                (nt, params.add(name, xavier_uniform(n, hidden, rng)))
            })
            .collect();

        let mut layers = Vec::with_capacity(config.num_layers);
        for l in 0..config.num_layers {
            let per_type = |role: &str, params: &mut ParamStore, rng: &mut StdRng| {
                counts
                    .keys()
                    .map(|&nt| {
                        let name = format!("layers.{l}.{role}.{}", nt.as_str());
                        (nt, Linear::new(params, &name, hidden, hidden, rng))
                    })
                    .collect::<BTreeMap<_, _>>()
            };
            let key = per_type("k_linear", &mut params, rng);
            let query = per_type("q_linear", &mut params, rng);
            let value = per_type("v_linear", &mut params, rng);
            let output = per_type("out_linear", &mut params, rng);

            let relations = edges
                .keys()
                .map(|et| {
                    let prefix = format!("layers.{l}.relation.{}", et.key());
                    let weights = RelationWeights {
                        attention: Linear::without_bias(
                            &mut params,
                            &format!("{prefix}.a_linear"),
                            hidden,
                            config.num_heads,
                            rng,
                        ),
                        message: Linear::new(&mut params, &format!("{prefix}.m_linear"), hidden, hidden, rng),
                    };
                    (*et, weights)
                })
                .collect();

            layers.push(HgtLayer {
                key,
                query,
                value,
                output,
                relations,
            });
        }

        let projection = counts
            .keys()
            .map(|&nt| {
                let name = format!("projection.{}", nt.as_str());
                (nt, Linear::new(&mut params, &name, hidden, config.embedding_dim, rng))
            })
            .collect();

        Self {
            config,
            counts,
            edges,
            params,
            base,
            layers,
            projection,
        }
    }

    pub fn config(&self) -> &HgtConfig {
        &self.config
    }

    pub fn num_nodes(&self, node_type: NodeType) -> usize {
        self.counts.get(&node_type).copied().unwrap_or(0)
    }

    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }

    /// Full forward pass; one `[num_nodes, embedding_dim]` output per
    /// node type with nodes.
    pub fn forward(&self, tape: &mut Tape) -> BTreeMap<NodeType, Var> {
        let mut hidden: BTreeMap<NodeType, Var> = self
            .base
            .iter()
            .map(|(&nt, &id)| (nt, tape.param(&self.params, id)))
            .collect();

        for layer in &self.layers {
            hidden = self.convolve(tape, layer, &hidden);
        }

        self.projection
            .iter()
            .filter_map(|(nt, proj)| {
                let h = *hidden.get(nt)?;
                Some((*nt, proj.forward(tape, &self.params, h)))
            })
            .collect()
    }

    fn convolve(
        &self,
        tape: &mut Tape,
        layer: &HgtLayer,
        hidden: &BTreeMap<NodeType, Var>,
    ) -> BTreeMap<NodeType, Var> {
        let project = |tape: &mut Tape, maps: &BTreeMap<NodeType, Linear>| -> BTreeMap<NodeType, Var> {
            hidden
                .iter()
                .filter_map(|(nt, &h)| Some((*nt, maps.get(nt)?.forward(tape, &self.params, h))))
                .collect()
        };
        let keys = project(tape, &layer.key);
        let queries = project(tape, &layer.query);
        let values = project(tape, &layer.value);

        let heads = self.config.num_heads.max(1);
        let scale = 1.0 / ((self.config.hidden_dim / heads).max(1) as f32).sqrt();

        let mut incoming: BTreeMap<NodeType, Vec<Var>> = BTreeMap::new();
        let mut degree: BTreeMap<NodeType, Vec<f32>> = BTreeMap::new();

        for (edge_type, block) in &self.edges {
            let (Some(relation), Some(&k), Some(&q), Some(&v)) = (
                layer.relations.get(edge_type),
                keys.get(&edge_type.src),
                queries.get(&edge_type.dst),
                values.get(&edge_type.src),
            ) else {
                continue;
            };
            if block.is_empty() {
                continue;
            }
            let num_dst = self.num_nodes(edge_type.dst);

            let k_src = tape.gather(k, &block.src);
            let q_dst = tape.gather(q, &block.dst);
            let interaction = tape.mul(k_src, q_dst);
            let scores = relation.attention.forward(tape, &self.params, interaction);
            let mut scores = tape.scale(scores, scale);
            if let Some(weights) = &block.weight {
                let column = Array2::from_shape_fn((weights.len(), 1), |(i, _)| weights[i]);
                let column = tape.constant(column);
                scores = tape.mul_col(scores, column);
            }
            let attention = tape.segment_softmax(scores, &block.dst, num_dst);
            let attention = tape.row_mean(attention);

            let v_src = tape.gather(v, &block.src);
            let message = relation.message.forward(tape, &self.params, v_src);
            let message = tape.mul_col(message, attention);
            incoming
                .entry(edge_type.dst)
                .or_default()
                .push(tape.scatter_add(message, &block.dst, num_dst));

            let counts = degree.entry(edge_type.dst).or_insert_with(|| vec![0.0; num_dst]);
            for &d in &block.dst {
                counts[d] += 1.0;
            }
        }

        hidden
            .iter()
            .map(|(&nt, &h)| {
                let (Some(messages), Some(counts), Some(output)) =
                    (incoming.get(&nt), degree.get(&nt), layer.output.get(&nt))
                else {
                    return (nt, h);
                };
                let mut total = messages[0];
                for &m in &messages[1..] {
                    total = tape.add(total, m);
                }
                let inv = Array2::from_shape_fn((counts.len(), 1), |(i, _)| 1.0 / counts[i].max(1.0));
                let inv = tape.constant(inv);
                let mean = tape.mul_col(total, inv);
                let projected = output.forward(tape, &self.params, mean);
                let residual = tape.add(projected, h);
                (nt, tape.relu(residual))
            })
            .collect()
    }

    /// Forward pass without gradients.
    pub fn embeddings(&self) -> BTreeMap<NodeType, Array2<f32>> {
        let mut tape = Tape::new();
        let outputs = self.forward(&mut tape);
        outputs
            .into_iter()
            .map(|(nt, var)| (nt, tape.value(var).clone()))
            .collect()
    }
}
