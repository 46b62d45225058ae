//! Global CPU-token budget.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Caps the summed CPU requests of all running instances.
///
/// Acquisition never waits: the coordinator asks with [`CpuBudget::try_reserve`]
/// and leaves the instance Pending when tokens are short. Tokens return when
/// the [`CpuReservation`] is dropped.
#[derive(Debug, Clone)]
pub struct CpuBudget {
    semaphore: Arc<Semaphore>,
    total: usize,
}

/// Tokens held by one running instance.
#[derive(Debug)]
pub struct CpuReservation {
    _permit: OwnedSemaphorePermit,
    cpus: usize,
}

impl CpuReservation {
    pub fn cpus(&self) -> usize {
        self.cpus
    }
}

impl CpuBudget {
    pub fn new(total: usize) -> Self {
        let total = total.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(total)),
            total,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Requests above the total are clamped so they can still run alone.
    pub fn clamp(&self, cpus: usize) -> usize {
        cpus.clamp(1, self.total)
    }

    /// Take `cpus` tokens (clamped) if they are free right now.
    pub fn try_reserve(&self, cpus: usize) -> Option<CpuReservation> {
        let cpus = self.clamp(cpus);
        let permit = self
            .semaphore
            .clone()
            .try_acquire_many_owned(cpus as u32)
            .ok()?;
        Some(CpuReservation {
            _permit: permit,
            cpus,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_release() {
        let budget = CpuBudget::new(8);
        let a = budget.try_reserve(6).unwrap();
        assert_eq!(budget.available(), 2);
        assert!(budget.try_reserve(4).is_none());

        drop(a);
        assert_eq!(budget.available(), 8);
        assert!(budget.try_reserve(4).is_some());
    }

    #[test]
    fn test_oversized_request_is_clamped() {
        let budget = CpuBudget::new(4);
        let r = budget.try_reserve(16).unwrap();
        assert_eq!(r.cpus(), 4);
        assert_eq!(budget.available(), 0);
    }

    #[test]
    fn test_zero_request_takes_one_token() {
        let budget = CpuBudget::new(2);
        assert_eq!(budget.try_reserve(0).unwrap().cpus(), 1);
    }
}
