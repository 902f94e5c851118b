//! Per-dimension correlation assignment.
//!
//! Every feature dimension maps to exactly one kernel: the near-white template
//! or one of the bank's length-scales. Assignments are plain values; overrides
//! produce a new assignment and never touch the input.
//!
//! HumanML3D channel layout used by [`CorrMode`]:
//!
//! ```text
//! 0        root angular velocity
//! 1..3     root linear velocity (x, z)
//! 3        root height
//! 4..67    local joint positions (21 × 3)
//! 67..193  joint rotations (21 × 6)
//! 193..259 local joint velocities (22 × 3)
//! 259..263 foot contacts
//! ```

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::kernel::KernelBank;
use crate::{Error, Result};

/// Kernel governing one feature dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelChoice {
    /// The per-dimension near-white template factor.
    Template,
    /// Bank factor at this length-scale index.
    LengthScale(usize),
}

/// Correlation settings of one feature dimension.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DimCorrelation {
    pub kernel: KernelChoice,
    /// Length value handed to the score model as conditioning.
    pub length: f64,
    /// Blend weight of the task kernel against the template, in `[0, 1]`.
    pub strength: f64,
}

/// One [`DimCorrelation`] per feature dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationAssignment {
    dims: Vec<DimCorrelation>,
}

impl CorrelationAssignment {
    /// Every dimension on the template kernel.
    pub fn template(dims: usize, default_length: f64) -> Self {
        let entry = DimCorrelation {
            kernel: KernelChoice::Template,
            length: default_length,
            strength: 0.0,
        };
        Self {
            dims: vec![entry; dims],
        }
    }

    pub fn len(&self) -> usize {
        self.dims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    pub fn get(&self, dim: usize) -> Option<&DimCorrelation> {
        self.dims.get(dim)
    }

    pub fn as_slice(&self) -> &[DimCorrelation] {
        &self.dims
    }

    pub fn iter(&self) -> impl Iterator<Item = &DimCorrelation> {
        self.dims.iter()
    }
}

/// Put `range` of dimensions on bank kernel `kernel`.
#[derive(Debug, Clone, PartialEq)]
pub struct Override {
    pub range: Range<usize>,
    pub kernel: usize,
    pub length: f64,
    pub strength: f64,
}

impl Override {
    /// Full-strength override.
    pub fn new(range: Range<usize>, kernel: usize, length: f64) -> Self {
        Self {
            range,
            kernel,
            length,
            strength: 1.0,
        }
    }

    pub fn with_strength(mut self, strength: f64) -> Self {
        self.strength = strength;
        self
    }
}

/// Apply `overrides` in order on top of `template`. Later overrides win.
pub fn assign_correlation(
    template: &CorrelationAssignment,
    overrides: &[Override],
) -> Result<CorrelationAssignment> {
    let mut dims = template.dims.clone();
    for o in overrides {
        if o.range.start > o.range.end || o.range.end > dims.len() {
            return Err(Error::Config(format!(
                "override range {:?} outside {} dimensions",
                o.range,
                dims.len()
            )));
        }
        if !(o.length.is_finite() && o.length > 0.0) {
            return Err(Error::Config(format!("override length {} must be positive", o.length)));
        }
        if !(0.0..=1.0).contains(&o.strength) {
            return Err(Error::Config(format!(
                "override strength {} outside [0, 1]",
                o.strength
            )));
        }
        for entry in &mut dims[o.range.clone()] {
            *entry = DimCorrelation {
                kernel: KernelChoice::LengthScale(o.kernel),
                length: o.length,
                strength: o.strength,
            };
        }
    }
    Ok(CorrelationAssignment { dims })
}

/// Which body-part group receives the chosen length-scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CorrMode {
    /// Root linear velocity.
    #[serde(rename = "trs", alias = "all_trs", alias = "R_trs")]
    Trs,
    /// Root rotation, velocity and height, plus the root's local velocity.
    #[serde(rename = "trsrot", alias = "all_trsrot", alias = "R_trsrot")]
    TrsRot,
    /// Local joint positions.
    #[serde(rename = "ric")]
    Ric,
    /// Every channel.
    #[serde(rename = "all")]
    All,
}

const CORR_MODES: &[(&str, CorrMode)] = &[
    ("trs", CorrMode::Trs),
    ("all_trs", CorrMode::Trs),
    ("R_trs", CorrMode::Trs),
    ("trsrot", CorrMode::TrsRot),
    ("all_trsrot", CorrMode::TrsRot),
    ("R_trsrot", CorrMode::TrsRot),
    ("ric", CorrMode::Ric),
    ("all", CorrMode::All),
];

impl CorrMode {
    pub fn name(self) -> &'static str {
        match self {
            CorrMode::Trs => "trs",
            CorrMode::TrsRot => "trsrot",
            CorrMode::Ric => "ric",
            CorrMode::All => "all",
        }
    }

    /// Channel ranges that receive the task kernel.
    pub fn ranges(self, dims: usize) -> Vec<Range<usize>> {
        match self {
            CorrMode::Trs => vec![1..3],
            CorrMode::TrsRot => vec![0..4, 193..196],
            CorrMode::Ric => vec![4..67],
            CorrMode::All => vec![0..dims],
        }
    }

    /// Fails unless every channel range of the mode fits in `dims`.
    pub fn check_dims(self, dims: usize) -> Result<()> {
        let needed = self.ranges(dims).iter().map(|r| r.end).max().unwrap_or(0);
        if needed > dims {
            return Err(Error::Config(format!(
                "correlation mode {self} needs {needed} feature dimensions, bank has {dims}"
            )));
        }
        Ok(())
    }

    /// `self` if it fits in `dims`, otherwise [`CorrMode::All`].
    pub fn fit_to_dims(self, dims: usize) -> Self {
        if self.check_dims(dims).is_ok() {
            self
        } else {
            CorrMode::All
        }
    }

    pub fn overrides(self, dims: usize, kernel: usize, length: f64) -> Vec<Override> {
        self.ranges(dims)
            .into_iter()
            .map(|range| Override::new(range, kernel, length))
            .collect()
    }

    /// Assignment for bank length index `kernel`; other channels stay on the
    /// template with `default_length`.
    pub fn assignment(
        self,
        bank: &KernelBank,
        kernel: usize,
        default_length: f64,
    ) -> Result<CorrelationAssignment> {
        let length = bank.length_scale(kernel)?;
        let template = CorrelationAssignment::template(bank.dims(), default_length);
        assign_correlation(&template, &self.overrides(bank.dims(), kernel, length))
    }
}

impl FromStr for CorrMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        CORR_MODES
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, mode)| *mode)
            .ok_or_else(|| Error::UnknownCorrMode(s.to_string()))
    }
}

impl fmt::Display for CorrMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
