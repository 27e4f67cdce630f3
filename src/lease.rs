//! In-process leases on helper instances.
//!
//! Helper instances are discovered through a shared security group, so two
//! runs in the same process could otherwise pick the same helper. A run leases
//! the instance it selects; other runs skip leased instances until the lease
//! is released, invalidated, or expires.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use uuid::Uuid;

/// Default lifetime of a lease.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(3600);

/// How the leased instance came to be used by the run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LeaseOrigin {
    /// The instance existed before the run.
    Reused,
    /// The run launched the instance.
    Launched,
}

/// Proof that a run holds an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Lease {
    /// Leased instance.
    pub instance_id: String,
    /// Token identifying the holder.
    pub token: Uuid,
    /// Whether the instance was reused or launched.
    pub origin: LeaseOrigin,
}

/// Errors raised by the lease table.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LeaseError {
    /// Another run holds an unexpired lease on the instance.
    #[error("instance {instance_id} is leased by another run")]
    Held {
        /// Contested instance.
        instance_id: String,
    },
    /// The presented token does not match the current lease.
    #[error("lease on instance {instance_id} is not held by this run")]
    NotHolder {
        /// Instance whose lease was presented.
        instance_id: String,
    },
    /// The table mutex was poisoned by a panicking holder.
    #[error("lease table is unavailable: {0}")]
    Poisoned(String),
}

#[derive(Clone, Debug)]
struct LeaseRecord {
    token: Uuid,
    expires_at: Instant,
}

/// Shared table of active leases keyed by instance id.
#[derive(Clone, Debug)]
pub struct LeaseTable {
    records: Arc<Mutex<HashMap<String, LeaseRecord>>>,
    ttl: Duration,
}

impl Default for LeaseTable {
    fn default() -> Self {
        Self::new(DEFAULT_LEASE_TTL)
    }
}

impl LeaseTable {
    /// Creates an empty table whose leases last `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, LeaseRecord>>, LeaseError> {
        self.records
            .lock()
            .map_err(|err| LeaseError::Poisoned(err.to_string()))
    }

    /// Leases `instance_id` for the caller.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Held`] when an unexpired lease exists.
    pub fn acquire(&self, instance_id: &str, origin: LeaseOrigin) -> Result<Lease, LeaseError> {
        let now = Instant::now();
        let mut records = self.lock()?;
        if records
            .get(instance_id)
            .is_some_and(|record| record.expires_at > now)
        {
            return Err(LeaseError::Held {
                instance_id: instance_id.to_owned(),
            });
        }

        let token = Uuid::new_v4();
        records.insert(
            instance_id.to_owned(),
            LeaseRecord {
                token,
                expires_at: now + self.ttl,
            },
        );
        Ok(Lease {
            instance_id: instance_id.to_owned(),
            token,
            origin,
        })
    }

    /// Returns `true` when an unexpired lease exists for `instance_id`.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Poisoned`] when the table is unusable.
    pub fn is_held(&self, instance_id: &str) -> Result<bool, LeaseError> {
        let now = Instant::now();
        Ok(self
            .lock()?
            .get(instance_id)
            .is_some_and(|record| record.expires_at > now))
    }

    /// Gives the lease back so other runs may reuse the instance.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::NotHolder`] when the lease was replaced or
    /// invalidated in the meantime.
    pub fn release(&self, lease: &Lease) -> Result<(), LeaseError> {
        let mut records = self.lock()?;
        match records.get(&lease.instance_id) {
            Some(record) if record.token == lease.token => {
                records.remove(&lease.instance_id);
                Ok(())
            }
            _ => Err(LeaseError::NotHolder {
                instance_id: lease.instance_id.clone(),
            }),
        }
    }

    /// Drops any lease on `instance_id`, whoever holds it. Used once the
    /// instance is being terminated.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Poisoned`] when the table is unusable.
    pub fn invalidate(&self, instance_id: &str) -> Result<(), LeaseError> {
        self.lock()?.remove(instance_id);
        Ok(())
    }
}
