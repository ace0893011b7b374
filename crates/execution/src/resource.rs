//! Capacity-bounded resource pools.
//!
//! Invariant: for every resource type, the units held by active allocations
//! never exceed its capacity. All bookkeeping happens under one mutex per
//! pool, so concurrent workers may reserve and release freely.

use conductor_core::{AllocationId, ResourceConstraint, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Errors from resource bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    /// The allocation is not active in this pool (already released, or
    /// issued by a different pool).
    #[error("allocation {0} is not active in this pool")]
    UnknownAllocation(AllocationId),

    /// No pool exists for this resource type.
    #[error("unknown resource type: {0}")]
    UnknownResource(String),

    /// Shrinking a pool below what is currently held.
    #[error("cannot set {resource} capacity to {requested}: {allocated} units are allocated")]
    CapacityBelowAllocated {
        /// Resource type
        resource: String,
        /// Requested capacity
        requested: u32,
        /// Units currently held
        allocated: u32,
    },
}

/// A successful reservation.
///
/// The handle is not `Clone`: releasing consumes it, so each reservation can
/// be returned at most once.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an allocation must be released"]
pub struct Allocation {
    id: AllocationId,
    task_id: TaskId,
    units: BTreeMap<String, u32>,
}

impl Allocation {
    /// Allocation id.
    pub fn id(&self) -> AllocationId {
        self.id
    }

    /// Task holding the reservation.
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Units held per resource type.
    pub fn units(&self) -> &BTreeMap<String, u32> {
        &self.units
    }
}

/// Capacity and current use of one resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Resource type
    pub resource_type: String,
    /// Total units
    pub capacity: u32,
    /// Units held
    pub allocated: u32,
}

impl ResourceUsage {
    /// Units still free.
    pub fn available(&self) -> u32 {
        self.capacity.saturating_sub(self.allocated)
    }

    /// Fraction of capacity in use, 0.0 for an empty pool.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            f64::from(self.allocated) / f64::from(self.capacity)
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    capacities: BTreeMap<String, u32>,
    allocated: BTreeMap<String, u32>,
    active: HashMap<AllocationId, (TaskId, BTreeMap<String, u32>)>,
}

/// Named resource capacities and their active allocations.
#[derive(Debug, Default)]
pub struct ResourcePool {
    state: Mutex<PoolState>,
}

impl ResourcePool {
    /// Create a pool with the given capacities.
    pub fn new<I, S>(capacities: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let capacities: BTreeMap<String, u32> =
            capacities.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let allocated = capacities.keys().map(|k| (k.clone(), 0)).collect();
        Self {
            state: Mutex::new(PoolState {
                capacities,
                allocated,
                active: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Every mutation below completes before the guard drops, so a
        // poisoned lock still holds consistent state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically reserve every constraint, or nothing.
    ///
    /// Returns `None` when any resource type lacks free capacity (or is not
    /// known to the pool); the pool is left unchanged in that case.
    pub fn try_allocate(
        &self,
        task_id: TaskId,
        constraints: &[ResourceConstraint],
    ) -> Option<Allocation> {
        let mut requested: BTreeMap<String, u32> = BTreeMap::new();
        for constraint in constraints.iter().filter(|c| c.max_units > 0) {
            let entry = requested.entry(constraint.resource_type.clone()).or_insert(0);
            *entry = entry.saturating_add(constraint.max_units);
        }

        let mut state = self.lock();
        for (resource, units) in &requested {
            let capacity = state.capacities.get(resource).copied().unwrap_or(0);
            let held = state.allocated.get(resource).copied().unwrap_or(0);
            if capacity.saturating_sub(held) < *units {
                tracing::debug!(
                    task_id = %task_id,
                    resource = %resource,
                    requested = units,
                    available = capacity.saturating_sub(held),
                    "insufficient capacity"
                );
                return None;
            }
        }

        for (resource, units) in &requested {
            *state.allocated.entry(resource.clone()).or_insert(0) += units;
        }
        let id = AllocationId::new();
        state.active.insert(id, (task_id, requested.clone()));
        tracing::debug!(task_id = %task_id, allocation = %id, "resources allocated");

        Some(Allocation {
            id,
            task_id,
            units: requested,
        })
    }

    /// Return every unit held by `allocation`.
    pub fn release(&self, allocation: Allocation) -> Result<(), ResourceError> {
        let mut state = self.lock();
        let Some((_, units)) = state.active.remove(&allocation.id) else {
            tracing::error!(allocation = %allocation.id, "release of inactive allocation");
            return Err(ResourceError::UnknownAllocation(allocation.id));
        };
        for (resource, held) in units {
            if let Some(total) = state.allocated.get_mut(&resource) {
                *total = total.saturating_sub(held);
            }
        }
        tracing::debug!(task_id = %allocation.task_id, allocation = %allocation.id, "resources released");
        Ok(())
    }

    /// Change the capacity of a resource type, creating it if needed.
    /// Returns the previous capacity (0 for a new type).
    pub fn set_capacity(&self, resource: &str, capacity: u32) -> Result<u32, ResourceError> {
        let mut state = self.lock();
        let allocated = state.allocated.get(resource).copied().unwrap_or(0);
        if capacity < allocated {
            return Err(ResourceError::CapacityBelowAllocated {
                resource: resource.to_string(),
                requested: capacity,
                allocated,
            });
        }
        state.allocated.entry(resource.to_string()).or_insert(0);
        let previous = state
            .capacities
            .insert(resource.to_string(), capacity)
            .unwrap_or(0);
        tracing::info!(resource, previous, capacity, "resource capacity changed");
        Ok(previous)
    }

    /// Whether the pool knows `resource`.
    pub fn has_resource(&self, resource: &str) -> bool {
        self.lock().capacities.contains_key(resource)
    }

    /// Current usage of one resource type.
    pub fn usage(&self, resource: &str) -> Result<ResourceUsage, ResourceError> {
        let state = self.lock();
        let capacity = state
            .capacities
            .get(resource)
            .copied()
            .ok_or_else(|| ResourceError::UnknownResource(resource.to_string()))?;
        Ok(ResourceUsage {
            resource_type: resource.to_string(),
            capacity,
            allocated: state.allocated.get(resource).copied().unwrap_or(0),
        })
    }

    /// Usage of every resource type, sorted by name.
    pub fn snapshot(&self) -> Vec<ResourceUsage> {
        let state = self.lock();
        state
            .capacities
            .iter()
            .map(|(resource, capacity)| ResourceUsage {
                resource_type: resource.clone(),
                capacity: *capacity,
                allocated: state.allocated.get(resource).copied().unwrap_or(0),
            })
            .collect()
    }

    /// Number of outstanding allocations.
    pub fn active_allocations(&self) -> usize {
        self.lock().active.len()
    }
}
