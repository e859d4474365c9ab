//! Resource allocator for exclusive passthrough devices
//!
//! Every grant is a single ledger transaction: the holder check and the
//! write happen under the same exclusive lock.

use chrono::{DateTime, Utc};
use hostlet_core::{HostletError, Owner, PciAddress};
use thiserror::Error;
use tracing::{debug, info};

use crate::ledger::{Ledger, LedgerEntry, LedgerError, LedgerState};

/// A device requested while held by someone else
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("device {device} is held by {holder} since {acquired_at} (requested by {requester})")]
pub struct AllocationConflict {
    pub device: PciAddress,
    pub holder: Owner,
    pub acquired_at: DateTime<Utc>,
    pub requester: Owner,
}

impl From<AllocationConflict> for HostletError {
    fn from(conflict: AllocationConflict) -> Self {
        HostletError::ResourceConflict {
            device: conflict.device,
            owner: conflict.holder,
            requester: conflict.requester,
        }
    }
}

/// Errors returned by allocating operations
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error(transparent)]
    Conflict(#[from] AllocationConflict),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl From<AllocationError> for HostletError {
    fn from(err: AllocationError) -> Self {
        match err {
            AllocationError::Conflict(conflict) => conflict.into(),
            AllocationError::Ledger(err) => err.into(),
        }
    }
}

fn check(
    state: &LedgerState,
    device: &PciAddress,
    requester: &Owner,
) -> Result<(), AllocationConflict> {
    match state.get(device) {
        Some(entry) if &entry.owner != requester => Err(AllocationConflict {
            device: device.clone(),
            holder: entry.owner.clone(),
            acquired_at: entry.acquired_at,
            requester: requester.clone(),
        }),
        _ => Ok(()),
    }
}

/// Grants, denies and releases exclusive device ownership
#[derive(Debug, Clone)]
pub struct ResourceAllocator {
    ledger: Ledger,
}

impl ResourceAllocator {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// The underlying ledger
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Grant `device` to `owner` if it is free or already theirs
    pub fn try_allocate(&self, device: &PciAddress, owner: &Owner) -> Result<(), AllocationError> {
        self.ledger.transaction(|state| {
            check(state, device, owner)?;
            if state.get(device).is_none() {
                state
                    .allocations
                    .insert(device.clone(), LedgerEntry::new(owner.clone()));
            }
            Ok::<_, AllocationConflict>(())
        })??;

        info!(device = %device, owner = %owner, "Allocated device");
        Ok(())
    }

    /// Free a device; releasing a free device is not an error
    ///
    /// Returns the entry that was removed, if any.
    pub fn release(&self, device: &PciAddress) -> Result<Option<LedgerEntry>, LedgerError> {
        let removed = self.ledger.clear(device)?;
        match &removed {
            Some(entry) => info!(device = %device, owner = %entry.owner, "Released device"),
            None => debug!(device = %device, "Device already free"),
        }
        Ok(removed)
    }

    /// Free a device only if `owner` currently holds it
    pub fn release_held_by(&self, device: &PciAddress, owner: &Owner) -> Result<bool, LedgerError> {
        let released = self.ledger.transaction(|state| {
            let held = state.get(device).is_some_and(|entry| &entry.owner == owner);
            if held {
                state.allocations.remove(device);
            }
            held
        })?;

        if released {
            info!(device = %device, owner = %owner, "Released device");
        } else {
            debug!(device = %device, owner = %owner, "Device not held by owner, nothing to release");
        }
        Ok(released)
    }

    /// Free every device held by `owner`
    pub fn release_all_held_by(&self, owner: &Owner) -> Result<Vec<PciAddress>, LedgerError> {
        let released: Vec<PciAddress> = self
            .ledger
            .clear_where(|holder| holder == owner)?
            .into_iter()
            .map(|(device, _)| device)
            .collect();

        for device in &released {
            info!(device = %device, owner = %owner, "Released device");
        }
        Ok(released)
    }

    /// Pre-flight check; a following `try_allocate` is still required
    pub fn is_available(&self, device: &PciAddress, owner: &Owner) -> Result<bool, LedgerError> {
        let state = self.ledger.snapshot()?;
        Ok(check(&state, device, owner).is_ok())
    }

    /// Current ledger entry for a device
    pub fn owner_of(&self, device: &PciAddress) -> Result<Option<LedgerEntry>, LedgerError> {
        self.ledger.get(device)
    }

    /// First conflict across `devices` for `owner`, without writing
    pub fn validate_availability(
        &self,
        devices: &[PciAddress],
        owner: &Owner,
    ) -> Result<(), AllocationError> {
        let state = self.ledger.snapshot()?;
        for device in devices {
            check(&state, device, owner)?;
        }
        Ok(())
    }

    /// Grant every device in `devices` to `owner`, or none of them
    pub fn reserve_all(&self, devices: &[PciAddress], owner: &Owner) -> Result<(), AllocationError> {
        if devices.is_empty() {
            return Ok(());
        }

        self.ledger.transaction(|state| {
            for device in devices {
                check(state, device, owner)?;
            }
            for device in devices {
                state
                    .allocations
                    .entry(device.clone())
                    .or_insert_with(|| LedgerEntry::new(owner.clone()));
            }
            Ok::<_, AllocationConflict>(())
        })??;

        info!(devices = ?devices, owner = %owner, "Reserved devices");
        Ok(())
    }

    /// Hand a device held by `from` over to `to`
    ///
    /// Succeeds if the device is held by `from`, already held by `to`, or
    /// free; anything else is a conflict naming the actual holder.
    pub fn transfer(&self, device: &PciAddress, from: &Owner, to: &Owner) -> Result<(), AllocationError> {
        self.ledger.transaction(|state| {
            if state.get(device).is_some_and(|entry| &entry.owner == from) {
                state.allocations.remove(device);
            }
            check(state, device, to)?;
            if state.get(device).is_none() {
                state
                    .allocations
                    .insert(device.clone(), LedgerEntry::new(to.clone()));
            }
            Ok::<_, AllocationConflict>(())
        })??;

        debug!(device = %device, from = %from, to = %to, "Transferred device");
        Ok(())
    }

    /// Read the whole ledger
    pub fn snapshot(&self) -> Result<LedgerState, LedgerError> {
        self.ledger.snapshot()
    }
}
