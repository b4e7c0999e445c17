//! Resource requirements and the in-use ledger owned by the runner.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ResourceError;

/// CPU/GPU units, used both for per-trial requirements and for the total budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    #[serde(default)]
    pub gpu: u32,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpu: default_cpu(),
            gpu: 0,
        }
    }
}

fn default_cpu() -> u32 {
    1
}

impl Resources {
    pub fn new(cpu: u32, gpu: u32) -> Self {
        Self { cpu, gpu }
    }

    pub fn zero() -> Self {
        Self { cpu: 0, gpu: 0 }
    }

    /// Whether `self` can be satisfied out of `available`.
    pub fn fits_within(&self, available: &Resources) -> bool {
        self.cpu <= available.cpu && self.gpu <= available.gpu
    }

    fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu.saturating_sub(other.cpu),
            gpu: self.gpu.saturating_sub(other.gpu),
        }
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} CPU, {} GPU", self.cpu, self.gpu)
    }
}

/// Tracks how much of the total budget is held by running trials.
///
/// Only the runner writes to the ledger, and always in the same step as the
/// trial status change that acquires or releases the resources.
#[derive(Debug, Clone)]
pub struct ResourceLedger {
    total: Resources,
    in_use: Resources,
}

impl ResourceLedger {
    pub fn new(total: Resources) -> Self {
        Self {
            total,
            in_use: Resources::zero(),
        }
    }

    pub fn total(&self) -> Resources {
        self.total
    }

    pub fn in_use(&self) -> Resources {
        self.in_use
    }

    pub fn available(&self) -> Resources {
        self.total.saturating_sub(&self.in_use)
    }

    /// Reserve `request`, failing if it does not fit in what is left.
    pub fn acquire(&mut self, request: &Resources) -> Result<(), ResourceError> {
        let available = self.available();
        if !request.fits_within(&available) {
            return Err(ResourceError::Exceeds {
                requested: *request,
                available,
            });
        }
        self.in_use.cpu += request.cpu;
        self.in_use.gpu += request.gpu;
        Ok(())
    }

    pub fn release(&mut self, request: &Resources) {
        self.in_use = self.in_use.saturating_sub(request);
    }
}
