//! Global admission control for concurrent mixes.
//!
//! The check and the increment are a single compare-exchange, so `limit`
//! concurrent callers can never be exceeded. A slot gives its capacity back
//! when dropped.

use crate::error::{MixerError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct AdmissionGate {
    active: AtomicUsize,
    limit: usize,
}

impl AdmissionGate {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            limit,
        })
    }

    pub fn try_acquire(self: &Arc<Self>) -> Result<AdmissionSlot> {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.limit {
                return Err(MixerError::ConcurrencyLimit);
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(AdmissionSlot {
                        gate: Arc::clone(self),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// One unit of admitted capacity
#[derive(Debug)]
pub struct AdmissionSlot {
    gate: Arc<AdmissionGate>,
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.gate.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_enforced_and_released_on_drop() {
        let gate = AdmissionGate::new(2);
        let a = gate.try_acquire().unwrap();
        let _b = gate.try_acquire().unwrap();
        assert_eq!(gate.try_acquire().unwrap_err(), MixerError::ConcurrencyLimit);
        drop(a);
        assert_eq!(gate.active(), 1);
        assert!(gate.try_acquire().is_ok());
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_limit() {
        let gate = AdmissionGate::new(10);
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let gate = gate.clone();
                std::thread::spawn(move || gate.try_acquire().ok())
            })
            .collect();
        let slots: Vec<AdmissionSlot> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(slots.len(), 10);
        assert_eq!(gate.active(), 10);
        drop(slots);
        assert_eq!(gate.active(), 0);
    }
}
