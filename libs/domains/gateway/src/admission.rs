use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::error::{GatewayError, GatewayResult};

/// Global cap on in-flight requests.
///
/// Full capacity rejects immediately with `Overloaded`; requests already
/// admitted are never dropped to make room.
#[derive(Debug, Clone)]
pub struct ConnectionAdmission {
    semaphore: Arc<Semaphore>,
    max: usize,
    retry_after: Duration,
}

/// One held concurrency slot. Dropping it releases the slot, so every exit
/// path of a request releases exactly once.
#[derive(Debug)]
pub struct AdmissionSlot {
    _permit: OwnedSemaphorePermit,
}

impl ConnectionAdmission {
    pub fn new(max: usize, retry_after: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
            retry_after,
        }
    }

    pub fn acquire_slot(&self) -> GatewayResult<AdmissionSlot> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Ok(AdmissionSlot { _permit: permit }),
            Err(TryAcquireError::NoPermits) => {
                tracing::warn!(max = self.max, "Admission cap reached");
                Err(GatewayError::Overloaded {
                    reason: format!("{} requests already in flight", self.max),
                    retry_after: self.retry_after,
                })
            }
            Err(TryAcquireError::Closed) => Err(GatewayError::Overloaded {
                reason: "gateway is shutting down".to_string(),
                retry_after: self.retry_after,
            }),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.max - self.semaphore.available_permits()
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Refuse every later acquisition. Held slots stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_slots_release_on_drop() {
        let admission = ConnectionAdmission::new(2, Duration::from_secs(1));
        let a = admission.acquire_slot().unwrap();
        let _b = admission.acquire_slot().unwrap();
        assert_eq!(admission.in_flight(), 2);

        let err = admission.acquire_slot().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Overloaded);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));

        drop(a);
        assert_eq!(admission.in_flight(), 1);
        assert!(admission.acquire_slot().is_ok());
    }

    #[test]
    fn test_closed_admission_rejects() {
        let admission = ConnectionAdmission::new(1, Duration::from_secs(1));
        admission.close();
        assert!(admission.acquire_slot().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cap_holds_under_concurrent_load() {
        let admission = ConnectionAdmission::new(3, Duration::from_millis(10));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let admission = admission.clone();
                let current = current.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    if let Ok(_slot) = admission.acquire_slot() {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(admission.in_flight(), 0);
    }
}
