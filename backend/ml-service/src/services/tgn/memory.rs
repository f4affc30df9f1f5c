//! Index-addressed recurrent memory for the temporal engine.
//!
//! Values are plain arrays: whatever tape produced an update is gone once
//! the value is written here.

use ndarray::{Array1, Array2, Axis};
use std::collections::{HashMap, VecDeque};

/// Memory rows and last-update times for every user.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryState {
    pub memory: Array2<f32>,
    pub last_update: Vec<f64>,
}

impl MemoryState {
    pub fn zeros(num_users: usize, dim: usize) -> Self {
        Self {
            memory: Array2::zeros((num_users, dim)),
            last_update: vec![0.0; num_users],
        }
    }

    pub fn num_users(&self) -> usize {
        self.memory.nrows()
    }

    pub fn rows(&self, users: &[usize]) -> Array2<f32> {
        self.memory.select(Axis(0), users)
    }

    pub fn times(&self, users: &[usize]) -> Vec<f64> {
        users.iter().map(|&u| self.last_update[u]).collect()
    }

    /// Writes row `i` of `values` to user `users[i]`.
    pub fn write_rows(&mut self, users: &[usize], values: &Array2<f32>, times: &[f64]) {
        for (i, &user) in users.iter().enumerate() {
            self.memory.row_mut(user).assign(&values.row(i));
            self.last_update[user] = times[i];
        }
    }

    /// `[num_users, 2]` encoding of the update times for checkpoints: whole
    /// days and seconds within the day, each exact enough in f32.
    pub fn times_as_columns(&self) -> Array2<f32> {
        Array2::from_shape_fn((self.last_update.len(), 2), |(i, col)| {
            let t = self.last_update[i];
            let days = (t / SECONDS_PER_DAY).floor();
            match col {
                0 => days as f32,
                _ => (t - days * SECONDS_PER_DAY) as f32,
            }
        })
    }

    pub fn times_from_columns(columns: &Array2<f32>) -> Vec<f64> {
        columns
            .rows()
            .into_iter()
            .map(|row| f64::from(row[0]) * SECONDS_PER_DAY + f64::from(row[1]))
            .collect()
    }
}

const SECONDS_PER_DAY: f64 = 86_400.0;

#[derive(Debug, Clone, PartialEq)]
struct Snapshot {
    timestamp: f64,
    memory: Array1<f32>,
}

/// Post-training baseline plus per-user timelines of live updates.
///
/// Looking up memory "as of" a time returns the latest snapshot at or
/// before it, so a later interaction never leaks into an earlier query.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    baseline: MemoryState,
    timelines: HashMap<usize, VecDeque<Snapshot>>,
    capacity: usize,
}

impl MemoryStore {
    pub fn new(baseline: MemoryState, capacity: usize) -> Self {
        Self {
            baseline,
            timelines: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn baseline(&self) -> &MemoryState {
        &self.baseline
    }

    /// Memory row and its update time as of `at`.
    pub fn state_at(&self, user: usize, at: f64) -> (Array1<f32>, f64) {
        if let Some(snapshot) = self
            .timelines
            .get(&user)
            .and_then(|t| t.iter().rev().find(|s| s.timestamp <= at))
        {
            return (snapshot.memory.clone(), snapshot.timestamp);
        }
        (
            self.baseline.memory.row(user).to_owned(),
            self.baseline.last_update[user],
        )
    }

    /// Most recent memory row regardless of time.
    pub fn current(&self, user: usize) -> Array1<f32> {
        self.timelines
            .get(&user)
            .and_then(|t| t.back())
            .map(|s| s.memory.clone())
            .unwrap_or_else(|| self.baseline.memory.row(user).to_owned())
    }

    /// Inserts a snapshot in time order, dropping the oldest past capacity.
    pub fn record(&mut self, user: usize, timestamp: f64, memory: Array1<f32>) {
        let timeline = self.timelines.entry(user).or_default();
        let pos = timeline
            .iter()
            .position(|s| s.timestamp > timestamp)
            .unwrap_or(timeline.len());
        timeline.insert(pos, Snapshot { timestamp, memory });
        while timeline.len() > self.capacity {
            timeline.pop_front();
        }
    }

    /// Drops live updates; the user falls back to the baseline.
    pub fn reset(&mut self, user: usize) {
        self.timelines.remove(&user);
    }

    pub fn live_users(&self) -> usize {
        self.timelines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_write_rows() {
        let mut state = MemoryState::zeros(3, 2);
        state.write_rows(&[2, 0], &array![[1.0, 2.0], [3.0, 4.0]], &[5.0, 6.0]);
        assert_eq!(state.memory.row(2).to_vec(), vec![1.0, 2.0]);
        assert_eq!(state.memory.row(0).to_vec(), vec![3.0, 4.0]);
        assert_eq!(state.last_update, vec![6.0, 0.0, 5.0]);
    }

    #[test]
    fn test_time_columns_keep_precision() {
        let mut state = MemoryState::zeros(2, 1);
        state.last_update = vec![1_760_000_123.5, 0.0];
        let restored = MemoryState::times_from_columns(&state.times_as_columns());
        assert!((restored[0] - 1_760_000_123.5).abs() < 0.01);
        assert_eq!(restored[1], 0.0);
    }

    #[test]
    fn test_state_at_respects_time() {
        let mut store = MemoryStore::new(MemoryState::zeros(2, 2), 4);
        store.record(0, 200.0, array![2.0, 2.0]);
        store.record(0, 100.0, array![1.0, 1.0]);

        assert_eq!(store.state_at(0, 50.0).0.to_vec(), vec![0.0, 0.0]);
        assert_eq!(store.state_at(0, 150.0), (array![1.0, 1.0], 100.0));
        assert_eq!(store.state_at(0, 250.0).0.to_vec(), vec![2.0, 2.0]);
        assert_eq!(store.current(0).to_vec(), vec![2.0, 2.0]);
        assert_eq!(store.current(1).to_vec(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_capacity_and_reset() {
        let mut store = MemoryStore::new(MemoryState::zeros(1, 1), 2);
        for t in 0..5 {
            store.record(0, t as f64, array![t as f32]);
        }
        assert_eq!(store.state_at(0, 2.5).0.to_vec(), vec![0.0]);
        assert_eq!(store.current(0).to_vec(), vec![4.0]);
        assert_eq!(store.live_users(), 1);

        store.reset(0);
        assert_eq!(store.live_users(), 0);
        assert_eq!(store.current(0).to_vec(), vec![0.0]);
    }
}
