//! Scalar resource vectors.
//!
//! Every admission, entitlement and matching decision in the control plane
//! operates on the same four-dimensional vector: cpu, memory, disk, gpu.
//! Ports and file descriptors are counted separately on the task request
//! because they are not divisible the same way.

use serde::{Deserialize, Serialize};

/// The four scalar resource dimensions tracked by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Cpu,
    MemMb,
    DiskMb,
    Gpu,
}

impl ResourceKind {
    /// All dimensions, in canonical order.
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Cpu,
        ResourceKind::MemMb,
        ResourceKind::DiskMb,
        ResourceKind::Gpu,
    ];
}

/// A scalar resource vector.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: f64,
    pub mem_mb: f64,
    pub disk_mb: f64,
    pub gpu: f64,
}

impl Resources {
    pub const ZERO: Resources = Resources {
        cpu: 0.0,
        mem_mb: 0.0,
        disk_mb: 0.0,
        gpu: 0.0,
    };

    pub fn new(cpu: f64, mem_mb: f64, disk_mb: f64, gpu: f64) -> Self {
        Self {
            cpu,
            mem_mb,
            disk_mb,
            gpu,
        }
    }

    pub fn get(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Cpu => self.cpu,
            ResourceKind::MemMb => self.mem_mb,
            ResourceKind::DiskMb => self.disk_mb,
            ResourceKind::Gpu => self.gpu,
        }
    }

    pub fn set(&mut self, kind: ResourceKind, value: f64) {
        match kind {
            ResourceKind::Cpu => self.cpu = value,
            ResourceKind::MemMb => self.mem_mb = value,
            ResourceKind::DiskMb => self.disk_mb = value,
            ResourceKind::Gpu => self.gpu = value,
        }
    }

    pub fn add(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu + other.cpu,
            mem_mb: self.mem_mb + other.mem_mb,
            disk_mb: self.disk_mb + other.disk_mb,
            gpu: self.gpu + other.gpu,
        }
    }

    /// Per-dimension subtraction, clamped at zero.
    pub fn subtract(&self, other: &Resources) -> Resources {
        Resources {
            cpu: (self.cpu - other.cpu).max(0.0),
            mem_mb: (self.mem_mb - other.mem_mb).max(0.0),
            disk_mb: (self.disk_mb - other.disk_mb).max(0.0),
            gpu: (self.gpu - other.gpu).max(0.0),
        }
    }

    pub fn scale(&self, factor: f64) -> Resources {
        Resources {
            cpu: self.cpu * factor,
            mem_mb: self.mem_mb * factor,
            disk_mb: self.disk_mb * factor,
            gpu: self.gpu * factor,
        }
    }

    /// True when every dimension of `self` fits within `other`.
    pub fn fits_in(&self, other: &Resources) -> bool {
        self.cpu <= other.cpu
            && self.mem_mb <= other.mem_mb
            && self.disk_mb <= other.disk_mb
            && self.gpu <= other.gpu
    }

    /// Per-dimension minimum.
    pub fn min(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu.min(other.cpu),
            mem_mb: self.mem_mb.min(other.mem_mb),
            disk_mb: self.disk_mb.min(other.disk_mb),
            gpu: self.gpu.min(other.gpu),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.cpu == 0.0 && self.mem_mb == 0.0 && self.disk_mb == 0.0 && self.gpu == 0.0
    }
}

impl std::fmt::Display for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cpu={} mem_mb={} disk_mb={} gpu={}",
            self.cpu, self.mem_mb, self.disk_mb, self.gpu
        )
    }
}
