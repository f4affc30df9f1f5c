//! Minimal dense tensor toolkit used by the embedding engines.

pub mod layers;
pub mod optim;
pub mod params;
pub mod sparse;
pub mod tape;

pub use layers::{xavier_uniform, GruCell, Linear, Mlp};
pub use optim::{Adam, AdamState};
pub use params::{Gradients, ParamId, ParamStore};
pub use sparse::SparseMatrix;
pub use tape::{Tape, Var};

use rand::rngs::StdRng;
use rand::SeedableRng;

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}
