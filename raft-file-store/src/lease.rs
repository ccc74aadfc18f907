//! Write leases over file paths.
//!
//! Leases live only inside the replicated state machine: they are created
//! and removed by applying `AcquireLease`/`ReleaseLease` entries, and every
//! expiry decision compares against the timestamp of the entry being
//! applied (or the read's reference time), never a local clock. An expired
//! lease is treated as absent; it is not removed until someone touches the
//! path again.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::ClientId;
use crate::config::LeasePolicy;
use crate::error::FileError;
use crate::log::Timestamp;
use crate::message::Index;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub path: String,
    pub holder: ClientId,
    /// First instant at which the lease no longer holds.
    pub expires_at: Timestamp,
    /// Log index of the entry that first granted it; renewals keep it.
    pub granted_at_index: Index,
}

impl Lease {
    pub fn is_active(&self, now: Timestamp) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseTable {
    leases: BTreeMap<String, Lease>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The unexpired lease on `path`, if any.
    pub fn active(&self, path: &str, now: Timestamp) -> Option<&Lease> {
        self.leases.get(path).filter(|l| l.is_active(now))
    }

    /// Grants or renews a lease. Renewal by the current holder never
    /// shortens the lease and keeps its original grant index.
    pub fn acquire(
        &mut self,
        path: &str,
        holder: &str,
        duration: Duration,
        now: Timestamp,
        index: Index,
    ) -> Result<Lease, FileError> {
        let millis = Timestamp::try_from(duration.as_millis()).unwrap_or(Timestamp::MAX);
        let expires_at = now.saturating_add(millis);
        let lease = match self.active(path, now) {
            Some(current) if current.holder != holder => {
                return Err(FileError::NotLeaseHolder {
                    path: path.to_string(),
                    holder: Some(current.holder.clone()),
                });
            }
            Some(current) => Lease {
                expires_at: current.expires_at.max(expires_at),
                ..current.clone()
            },
            None => Lease {
                path: path.to_string(),
                holder: holder.to_string(),
                expires_at,
                granted_at_index: index,
            },
        };
        self.leases.insert(path.to_string(), lease.clone());
        Ok(lease)
    }

    /// Releases the lease held by `holder`.
    pub fn release(
        &mut self,
        path: &str,
        holder: &str,
        now: Timestamp,
    ) -> Result<Lease, FileError> {
        match self.active(path, now) {
            Some(current) if current.holder == holder => {}
            current => {
                return Err(FileError::NotLeaseHolder {
                    path: path.to_string(),
                    holder: current.map(|l| l.holder.clone()),
                });
            }
        }
        self.leases
            .remove(path)
            .ok_or_else(|| FileError::NotLeaseHolder {
                path: path.to_string(),
                holder: None,
            })
    }

    /// Whether `writer` may modify `path` at `now`.
    pub fn check_write(
        &self,
        path: &str,
        writer: &str,
        now: Timestamp,
        policy: LeasePolicy,
    ) -> Result<(), FileError> {
        match (self.active(path, now), policy) {
            (Some(lease), _) if lease.holder == writer => Ok(()),
            (Some(lease), _) => Err(FileError::NotLeaseHolder {
                path: path.to_string(),
                holder: Some(lease.holder.clone()),
            }),
            (None, LeasePolicy::Optional) => Ok(()),
            (None, LeasePolicy::Required) => Err(FileError::LeaseRequired {
                path: path.to_string(),
            }),
        }
    }
}
