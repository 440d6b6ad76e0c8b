//! Global cap on concurrently running tool processes.
//!
//! Waiters are admitted in FIFO order. A waiter whose cancellation token
//! fires while queued never takes a slot.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{MapDiffError, Result};

/// Bounds the number of outstanding tool invocations.
#[derive(Debug, Clone)]
pub struct ProcessThrottle {
    /// `None` when unbounded
    slots: Option<Arc<Semaphore>>,
    max: usize,
}

/// Held for the duration of one tool invocation; dropping it frees the slot.
#[derive(Debug)]
pub struct ThrottlePermit {
    _permit: Option<OwnedSemaphorePermit>,
}

impl ProcessThrottle {
    /// Create a throttle allowing `max` concurrent entries; 0 means unbounded.
    pub fn new(max: usize) -> Self {
        Self {
            slots: (max > 0).then(|| Arc::new(Semaphore::new(max))),
            max,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(0)
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Free slots, or `None` when unbounded.
    pub fn available(&self) -> Option<usize> {
        self.slots.as_ref().map(|s| s.available_permits())
    }

    /// Wait for a slot, giving up if `cancel` fires first.
    pub async fn enter(&self, cancel: &CancellationToken) -> Result<ThrottlePermit> {
        if cancel.is_cancelled() {
            return Err(MapDiffError::Cancelled);
        }

        let Some(slots) = &self.slots else {
            return Ok(ThrottlePermit { _permit: None });
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MapDiffError::Cancelled),
            permit = slots.clone().acquire_owned() => {
                let permit = permit.map_err(|_| MapDiffError::Tool("process throttle closed".to_string()))?;
                Ok(ThrottlePermit { _permit: Some(permit) })
            }
        }
    }
}

impl Default for ProcessThrottle {
    fn default() -> Self {
        Self::unbounded()
    }
}
