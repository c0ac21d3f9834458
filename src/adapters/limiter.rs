//! Per-user concurrency limits.
//!
//! Callers who reach a method only because it is public share one
//! semaphore per `(method, user)` pair. The permit is held for the whole
//! call; for `GetUpdates` that is the life of the stream. Entries are
//! dropped once their last permit is released.

use super::{Access, FleetMethod};
use crate::core::error::{FleetError, FleetResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

type Key = (FleetMethod, String);
type InFlight = Arc<Mutex<HashMap<Key, Arc<Semaphore>>>>;

/// Keyed semaphores capping concurrent calls per user.
#[derive(Debug)]
pub struct MethodLimiter {
    limits: HashMap<FleetMethod, usize>,
    in_flight: InFlight,
}

impl Default for MethodLimiter {
    fn default() -> Self {
        Self::new([(FleetMethod::GetMachineInfo, 1), (FleetMethod::GetUpdates, 1)])
    }
}

impl MethodLimiter {
    /// Limiter with the given per-user limits. Methods not listed are
    /// unlimited, as is a limit of zero.
    pub fn new(limits: impl IntoIterator<Item = (FleetMethod, usize)>) -> Self {
        Self {
            limits: limits.into_iter().filter(|(_, limit)| *limit > 0).collect(),
            in_flight: Arc::default(),
        }
    }

    /// Limiter that never refuses a call.
    pub fn unlimited() -> Self {
        Self::new([])
    }

    pub fn limit(&self, method: FleetMethod) -> Option<usize> {
        self.limits.get(&method).copied()
    }

    /// Take a slot for one call. Returns `None` when the call is not
    /// limited.
    pub fn acquire(&self, method: FleetMethod, access: Access, username: &str) -> FleetResult<Option<CallPermit>> {
        if access != Access::Public {
            return Ok(None);
        }
        let Some(limit) = self.limit(method) else {
            return Ok(None);
        };
        let key = (method, username.to_string());
        let mut in_flight = self.in_flight.lock();
        let semaphore = in_flight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(limit)))
            .clone();
        match semaphore.try_acquire_owned() {
            Ok(permit) => Ok(Some(CallPermit {
                permit: Some(permit),
                key,
                in_flight: self.in_flight.clone(),
            })),
            Err(_) => {
                drop(in_flight);
                tracing::debug!(%method, username, limit, "per-user call limit reached");
                Err(FleetError::resource_exhausted(
                    method.to_string(),
                    format!("{} already has {} call(s) in flight", username, limit),
                ))
            }
        }
    }

    /// Users with at least one limited call in flight.
    pub fn active_keys(&self) -> usize {
        self.in_flight.lock().len()
    }
}

/// One admitted call. Dropping it frees the slot.
#[derive(Debug)]
pub struct CallPermit {
    permit: Option<OwnedSemaphorePermit>,
    key: Key,
    in_flight: InFlight,
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock();
        self.permit.take();
        // Only the map holds the semaphore once no permit is outstanding.
        if in_flight
            .get(&self.key)
            .is_some_and(|semaphore| Arc::strong_count(semaphore) == 1)
        {
            in_flight.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::status::StatusCode;

    #[test]
    fn test_public_calls_are_limited_per_user() {
        let limiter = MethodLimiter::default();
        let first = limiter
            .acquire(FleetMethod::GetUpdates, Access::Public, "bob")
            .unwrap();
        assert!(first.is_some());
        let err = limiter
            .acquire(FleetMethod::GetUpdates, Access::Public, "bob")
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::ResourceExhausted);

        // Other users and other methods have their own slots.
        assert!(limiter
            .acquire(FleetMethod::GetUpdates, Access::Public, "carol")
            .unwrap()
            .is_some());
        assert!(limiter
            .acquire(FleetMethod::GetMachineInfo, Access::Public, "bob")
            .unwrap()
            .is_some());

        drop(first);
        assert!(limiter
            .acquire(FleetMethod::GetUpdates, Access::Public, "bob")
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_permitted_and_unlisted_calls_are_free() {
        let limiter = MethodLimiter::default();
        let _held = limiter
            .acquire(FleetMethod::GetUpdates, Access::Public, "bob")
            .unwrap();
        assert!(limiter
            .acquire(FleetMethod::GetUpdates, Access::Permitted, "bob")
            .unwrap()
            .is_none());
        assert!(limiter
            .acquire(FleetMethod::ListVmsInLocation, Access::Public, "bob")
            .unwrap()
            .is_none());
        assert!(MethodLimiter::unlimited()
            .acquire(FleetMethod::GetUpdates, Access::Public, "bob")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_entries_released_with_last_permit() {
        let limiter = MethodLimiter::new([(FleetMethod::GetMachineInfo, 2)]);
        let a = limiter.acquire(FleetMethod::GetMachineInfo, Access::Public, "bob").unwrap();
        let b = limiter.acquire(FleetMethod::GetMachineInfo, Access::Public, "bob").unwrap();
        assert!(limiter
            .acquire(FleetMethod::GetMachineInfo, Access::Public, "bob")
            .is_err());
        assert_eq!(limiter.active_keys(), 1);
        drop(a);
        assert_eq!(limiter.active_keys(), 1);
        drop(b);
        assert_eq!(limiter.active_keys(), 0);
    }
}
