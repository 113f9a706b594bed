use crate::error::{LabError, Result};
use crate::service::ConnectionId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard};

/// Exclusive claim on one hosted service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Lock {
    pub holder: ConnectionId,
    /// Free-form label supplied by the client, e.g. a user name.
    pub user: Option<String>,
    pub acquired_at: DateTime<Utc>,
}

impl Lock {
    pub fn describe_holder(&self) -> String {
        match &self.user {
            Some(user) => format!("{user} (connection {})", self.holder),
            None => format!("connection {}", self.holder),
        }
    }
}

/// Per-service lock state of a lockable daemon.
///
/// Each service has its own slot. Calls into a service hold the slot's read
/// guard for their whole duration, while acquire and release take the write
/// guard, so a lock can never be granted while another connection's call is
/// still inside the service.
pub struct LockTable {
    slots: BTreeMap<String, RwLock<Option<Lock>>>,
}

/// Held while a call runs inside a service.
pub struct CallGuard<'a> {
    _slot: RwLockReadGuard<'a, Option<Lock>>,
}

impl LockTable {
    pub fn new<I, S>(services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            slots: services
                .into_iter()
                .map(|name| (name.into(), RwLock::new(None)))
                .collect(),
        }
    }

    fn slot(&self, service: &str) -> Result<&RwLock<Option<Lock>>> {
        self.slots
            .get(service)
            .ok_or_else(|| LabError::UnknownObject(service.to_string()))
    }

    /// Unlocked -> Locked(holder). Fails whenever the service is already locked.
    pub fn acquire(&self, service: &str, holder: ConnectionId, user: Option<String>) -> Result<()> {
        let mut slot = self.slot(service)?.write().expect("lock slot poisoned");
        if let Some(current) = slot.as_ref() {
            return Err(LabError::AlreadyLocked {
                service: service.to_string(),
                holder: current.describe_holder(),
            });
        }
        *slot = Some(Lock {
            holder,
            user,
            acquired_at: Utc::now(),
        });
        tracing::info!(service, holder, "Service locked");
        Ok(())
    }

    /// Locked(holder) -> Unlocked. Returns `false` if the service was not locked.
    pub fn release(&self, service: &str, holder: ConnectionId) -> Result<bool> {
        let mut slot = self.slot(service)?.write().expect("lock slot poisoned");
        match slot.as_ref() {
            None => Ok(false),
            Some(current) if current.holder == holder => {
                *slot = None;
                tracing::info!(service, holder, "Service released");
                Ok(true)
            }
            Some(current) => Err(LabError::ResourceBusy {
                service: service.to_string(),
                holder: current.describe_holder(),
            }),
        }
    }

    /// Admit a call from `caller`, or fail with `ResourceBusy` if someone else holds the lock.
    pub fn enter(&self, service: &str, caller: ConnectionId) -> Result<CallGuard<'_>> {
        let slot = self.slot(service)?.read().expect("lock slot poisoned");
        if let Some(current) = slot.as_ref() {
            if current.holder != caller {
                return Err(LabError::ResourceBusy {
                    service: service.to_string(),
                    holder: current.describe_holder(),
                });
            }
        }
        Ok(CallGuard { _slot: slot })
    }

    pub fn holder(&self, service: &str) -> Result<Option<Lock>> {
        Ok(self.slot(service)?.read().expect("lock slot poisoned").clone())
    }

    /// Implicit release when a connection goes away. Returns the released services.
    pub fn release_all(&self, holder: ConnectionId) -> Vec<String> {
        let mut released = Vec::new();
        for (service, slot) in &self.slots {
            let mut slot = slot.write().expect("lock slot poisoned");
            if slot.as_ref().is_some_and(|lock| lock.holder == holder) {
                *slot = None;
                released.push(service.clone());
            }
        }
        if !released.is_empty() {
            tracing::info!(holder, services = ?released, "Released locks of closed connection");
        }
        released
    }

    /// Administrative unlock regardless of holder.
    pub fn force_release(&self, service: &str) -> Result<Option<Lock>> {
        let previous = self.slot(service)?.write().expect("lock slot poisoned").take();
        if let Some(lock) = &previous {
            tracing::warn!(service, holder = lock.holder, "Lock forcibly released");
        }
        Ok(previous)
    }

    pub fn snapshot(&self) -> BTreeMap<String, Option<Lock>> {
        self.slots
            .iter()
            .map(|(name, slot)| {
                let lock = slot.read().expect("lock slot poisoned").clone();
                (name.clone(), lock)
            })
            .collect()
    }
}
