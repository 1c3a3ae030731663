use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Tracks running batches so a vault switch can cancel them and wait until
/// the last one has finished.
#[derive(Clone, Default)]
pub struct ActiveBatches {
    gate: Arc<RwLock<()>>,
    generation: Arc<Mutex<CancellationToken>>,
}

/// Held by a running batch.
pub struct BatchGuard {
    _gate: OwnedRwLockReadGuard<()>,
    draining: CancellationToken,
}

impl BatchGuard {
    /// True once a drain has been requested.
    pub fn draining(&self) -> bool {
        self.draining.is_cancelled()
    }
}

/// Held while the active vault changes. No batch can start until it drops.
pub struct DrainGuard {
    _gate: OwnedRwLockWriteGuard<()>,
}

impl ActiveBatches {
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> CancellationToken {
        self.generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn begin(&self) -> BatchGuard {
        let gate = self.gate.clone().read_owned().await;
        BatchGuard {
            _gate: gate,
            draining: self.current(),
        }
    }

    /// Cancels every running batch and waits for them to finish. Batches that
    /// start after the returned guard drops are unaffected.
    pub async fn drain(&self) -> DrainGuard {
        let old = {
            let mut generation = self
                .generation
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *generation, CancellationToken::new())
        };
        old.cancel();
        let gate = self.gate.clone().write_owned().await;
        debug!("all batches drained");
        DrainGuard { _gate: gate }
    }
}
