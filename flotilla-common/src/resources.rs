// Copyright 2025 The Flotilla Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Resource quantities and four-dimensional resource vectors.
//!
//! All scheduler math (entitlement, allocation, demand, admission) runs on
//! `ResourceVector`. Quantities are fixed-point so that repeated add/subtract
//! cycles stay exact and comparisons never depend on float epsilons.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Smallest representable fraction of a resource unit is 1/10000.
const QUANTITY_SCALE: i64 = 10_000;

/// Fixed-point quantity of a single resource dimension.
///
/// Stored as `value * 10000` for exact integer arithmetic; 0.5 CPU and
/// 0.0001 CPU are both representable without drift.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Quantity(i64);

impl Quantity {
    pub const ZERO: Self = Self(0);

    pub fn from_f64(value: f64) -> Self {
        Self((value * QUANTITY_SCALE as f64).round() as i64)
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / QUANTITY_SCALE as f64
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Multiply by a scalar factor, rounding to the nearest representable
    /// quantity.
    pub fn scale(self, factor: f64) -> Self {
        Self((self.0 as f64 * factor).round() as i64)
    }

    /// Subtract without going below zero. Returns the clamped result and
    /// whether clamping occurred.
    pub fn saturating_sub(self, rhs: Self) -> (Self, bool) {
        let raw = self.0 - rhs.0;
        if raw < 0 {
            (Self(0), true)
        } else {
            (Self(raw), false)
        }
    }

    pub fn min(self, rhs: Self) -> Self {
        Self(self.0.min(rhs.0))
    }
}

impl std::ops::Add for Quantity {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for Quantity {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl std::ops::Sub for Quantity {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl std::ops::SubAssign for Quantity {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl fmt::Debug for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}

/// The four resource dimensions every pool, task, and host carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Cpu,
    Mem,
    Disk,
    Gpu,
}

impl Dimension {
    pub const ALL: [Dimension; 4] = [
        Dimension::Cpu,
        Dimension::Mem,
        Dimension::Disk,
        Dimension::Gpu,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Cpu => "cpu",
            Dimension::Mem => "mem",
            Dimension::Disk => "disk",
            Dimension::Gpu => "gpu",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A four-dimensional resource vector (cpu, mem, disk, gpu).
///
/// The `revocable` marker tags vectors whose resources may be reclaimed by
/// their owner at any time; it is carried through `add` but takes no part in
/// the dimension arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceVector {
    pub cpu: Quantity,
    pub mem: Quantity,
    pub disk: Quantity,
    pub gpu: Quantity,
    #[serde(default)]
    pub revocable: bool,
}

impl ResourceVector {
    pub const ZERO: Self = Self {
        cpu: Quantity::ZERO,
        mem: Quantity::ZERO,
        disk: Quantity::ZERO,
        gpu: Quantity::ZERO,
        revocable: false,
    };

    pub fn new(cpu: f64, mem: f64, disk: f64, gpu: f64) -> Self {
        Self {
            cpu: Quantity::from_f64(cpu),
            mem: Quantity::from_f64(mem),
            disk: Quantity::from_f64(disk),
            gpu: Quantity::from_f64(gpu),
            revocable: false,
        }
    }

    pub fn revocable(mut self) -> Self {
        self.revocable = true;
        self
    }

    pub fn get(&self, dim: Dimension) -> Quantity {
        match dim {
            Dimension::Cpu => self.cpu,
            Dimension::Mem => self.mem,
            Dimension::Disk => self.disk,
            Dimension::Gpu => self.gpu,
        }
    }

    pub fn set(&mut self, dim: Dimension, value: Quantity) {
        match dim {
            Dimension::Cpu => self.cpu = value,
            Dimension::Mem => self.mem = value,
            Dimension::Disk => self.disk = value,
            Dimension::Gpu => self.gpu = value,
        }
    }

    /// Add another vector dimension-wise. The result is revocable if either
    /// operand is.
    pub fn add(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            cpu: self.cpu + other.cpu,
            mem: self.mem + other.mem,
            disk: self.disk + other.disk,
            gpu: self.gpu + other.gpu,
            revocable: self.revocable || other.revocable,
        }
    }

    /// Subtract another vector dimension-wise, saturating each dimension at
    /// zero. Returns the result and whether any dimension was clamped.
    pub fn subtract(&self, other: &ResourceVector) -> (ResourceVector, bool) {
        let mut clamped = false;
        let mut out = *self;
        for dim in Dimension::ALL {
            let (v, c) = self.get(dim).saturating_sub(other.get(dim));
            out.set(dim, v);
            clamped |= c;
        }
        (out, clamped)
    }

    /// True when every dimension of `self` is at most the matching dimension
    /// of `other`.
    pub fn less_or_equal(&self, other: &ResourceVector) -> bool {
        Dimension::ALL.iter().all(|&d| self.get(d) <= other.get(d))
    }

    /// Multiply every dimension by a scalar factor.
    pub fn scale(&self, factor: f64) -> ResourceVector {
        let mut out = *self;
        for dim in Dimension::ALL {
            out.set(dim, self.get(dim).scale(factor));
        }
        out
    }

    pub fn is_zero(&self) -> bool {
        Dimension::ALL.iter().all(|&d| self.get(d).is_zero())
    }

    /// True when at least one dimension of `self` exceeds the matching
    /// dimension of `other`.
    pub fn exceeds(&self, other: &ResourceVector) -> bool {
        !self.less_or_equal(other)
    }
}

impl fmt::Display for ResourceVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu:{} mem:{} disk:{} gpu:{}",
            self.cpu, self.mem, self.disk, self.gpu
        )
    }
}
