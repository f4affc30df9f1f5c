// ============================================
// Training coordinator
// ============================================
//
// At most one training run of any engine is active at a time. A second
// request is rejected immediately rather than queued.

use crate::error::{AppError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct TrainingGate {
    busy: Arc<AtomicBool>,
}

/// Held for the duration of a training run; dropping it reopens the gate,
/// including on error or panic.
#[derive(Debug)]
pub struct TrainingPermit {
    busy: Arc<AtomicBool>,
}

impl TrainingGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Result<TrainingPermit> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| AppError::TrainingInProgress)?;
        debug!("Training gate acquired");
        Ok(TrainingPermit {
            busy: self.busy.clone(),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Drop for TrainingPermit {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
        debug!("Training gate released");
    }
}
