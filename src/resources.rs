// src/resources.rs

//! Resource budget bookkeeping.
//!
//! [`ResourceAllocator`] owns the process-wide usage counters behind a mutex
//! and is cloned into every dispatch loop. Usage is only changed through
//! [`ResourceAllocator::try_reserve`] and [`Reservation::release`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, trace};

use crate::job::{JobId, ResourceRequest};

/// Capacity in abstract CPU and memory units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Budget {
    pub cpu_units: u64,
    pub memory_units: u64,
}

impl Budget {
    pub fn new(cpu_units: u64, memory_units: u64) -> Self {
        Self {
            cpu_units,
            memory_units,
        }
    }

    pub fn fits(&self, request: &ResourceRequest) -> bool {
        request.cpu_units <= self.cpu_units && request.memory_units <= self.memory_units
    }
}

impl fmt::Display for Budget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu={} mem={}", self.cpu_units, self.memory_units)
    }
}

/// Transient denial. Never a job failure; the job stays queued.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("resources unavailable for job {job_id}: requested {requested}, free {available}")]
pub struct ResourceUnavailable {
    pub job_id: JobId,
    pub requested: ResourceRequest,
    pub available: Budget,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Usage {
    cpu_units: u64,
    memory_units: u64,
}

impl Usage {
    fn add(&mut self, r: &ResourceRequest) {
        self.cpu_units += r.cpu_units;
        self.memory_units += r.memory_units;
    }

    fn sub(&mut self, r: &ResourceRequest) {
        self.cpu_units = self.cpu_units.saturating_sub(r.cpu_units);
        self.memory_units = self.memory_units.saturating_sub(r.memory_units);
    }

    fn free_in(&self, budget: &Budget) -> Budget {
        Budget {
            cpu_units: budget.cpu_units.saturating_sub(self.cpu_units),
            memory_units: budget.memory_units.saturating_sub(self.memory_units),
        }
    }
}

#[derive(Debug)]
struct Ledger {
    budget: Budget,
    class_budgets: HashMap<String, Budget>,
    used: Usage,
    class_used: HashMap<String, Usage>,
    active: usize,
}

/// Point-in-time view of the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    pub budget: Budget,
    pub reserved: Budget,
    pub active_reservations: usize,
}

/// Atomic check-and-reserve over a global budget plus optional per-type
/// budgets.
#[derive(Debug, Clone)]
pub struct ResourceAllocator {
    ledger: Arc<Mutex<Ledger>>,
}

impl ResourceAllocator {
    pub fn new(budget: Budget) -> Self {
        Self::with_classes(budget, HashMap::new())
    }

    /// `class_budgets` is keyed by job type.
    pub fn with_classes(budget: Budget, class_budgets: HashMap<String, Budget>) -> Self {
        Self {
            ledger: Arc::new(Mutex::new(Ledger {
                budget,
                class_budgets,
                used: Usage::default(),
                class_used: HashMap::new(),
                active: 0,
            })),
        }
    }

    // Counters stay consistent under poisoning: every mutation is a pair of
    // plain integer updates with no panicking code in between.
    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether `request` could ever be granted for a job of type `class`.
    pub fn fits_budget(&self, class: &str, request: &ResourceRequest) -> bool {
        let ledger = self.ledger();
        ledger.budget.fits(request)
            && ledger
                .class_budgets
                .get(class)
                .is_none_or(|b| b.fits(request))
    }

    pub fn budget(&self) -> Budget {
        self.ledger().budget
    }

    /// Reserve `request` for one attempt of `job_id`.
    ///
    /// Granted iff both dimensions fit in the remaining global budget and,
    /// when `class` has its own budget, in the remaining class budget.
    pub fn try_reserve(
        &self,
        job_id: JobId,
        class: &str,
        request: ResourceRequest,
    ) -> Result<Reservation, ResourceUnavailable> {
        let mut ledger = self.ledger();

        let free = ledger.used.free_in(&ledger.budget);
        if !free.fits(&request) {
            trace!(job_id = %job_id, %request, %free, "reservation denied (global)");
            return Err(ResourceUnavailable {
                job_id,
                requested: request,
                available: free,
            });
        }

        if let Some(class_budget) = ledger.class_budgets.get(class).copied() {
            let class_free = ledger
                .class_used
                .get(class)
                .copied()
                .unwrap_or_default()
                .free_in(&class_budget);
            if !class_free.fits(&request) {
                trace!(job_id = %job_id, class, %request, free = %class_free, "reservation denied (class)");
                return Err(ResourceUnavailable {
                    job_id,
                    requested: request,
                    available: class_free,
                });
            }
            ledger
                .class_used
                .entry(class.to_string())
                .or_default()
                .add(&request);
        }

        ledger.used.add(&request);
        ledger.active += 1;
        debug!(job_id = %job_id, %request, active = ledger.active, "resources reserved");

        Ok(Reservation {
            job_id,
            class: class.to_string(),
            request,
            acquired_at: Utc::now(),
            released: AtomicBool::new(false),
            ledger: Arc::clone(&self.ledger),
        })
    }

    pub fn usage(&self) -> ResourceUsage {
        let ledger = self.ledger();
        ResourceUsage {
            budget: ledger.budget,
            reserved: Budget::new(ledger.used.cpu_units, ledger.used.memory_units),
            active_reservations: ledger.active,
        }
    }
}

/// A held slice of the budget for one execution attempt.
///
/// Released explicitly with [`release`](Self::release) or implicitly on drop;
/// only the first release returns the units.
#[derive(Debug)]
pub struct Reservation {
    job_id: JobId,
    class: String,
    request: ResourceRequest,
    acquired_at: DateTime<Utc>,
    released: AtomicBool,
    ledger: Arc<Mutex<Ledger>>,
}

impl Reservation {
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Return the units to the budget. Returns `false` if this reservation
    /// was already released.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }

        let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        ledger.used.sub(&self.request);
        if let Some(class_used) = ledger.class_used.get_mut(&self.class) {
            class_used.sub(&self.request);
        }
        ledger.active = ledger.active.saturating_sub(1);
        let held_ms = (Utc::now() - self.acquired_at).num_milliseconds();
        debug!(job_id = %self.job_id, request = %self.request, held_ms, active = ledger.active, "resources released");
        true
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release();
    }
}
