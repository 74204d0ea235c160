//! Core engine for stage-structured agroecological food web simulation.
//!
//! A [`config::FoodWebConfig`] describes organisms, their life stages, the
//! equations governing each stage, and the trophic links between them. It is
//! compiled once into a [`registry::FoodWeb`] (flattened stage index space,
//! parasitism ghost chains, equation groupings), coefficients are then
//! materialized into dense per-replicate arrays, and any number of
//! [`sim::Simulation`] runs advance the five-axis population tensor
//! step by step.

use thiserror::Error;

pub mod coeffs;
pub mod cohorts;
pub mod config;
pub mod kernel;
pub mod registry;
pub mod sim;

pub use coeffs::MaterializedCoefs;
pub use kernel::{PhaseTimings, StepDetails, StepEvents};
pub use config::{
    AgeDistribution, AgingLaw, CoefValue, CutoffRule, DayDegreeMethod, DistSpec, FoodWebConfig,
    GrowthConfig, GrowthLaw, GrowthModifier, HostSpec, MortalityLaw, MovementKind, NoiseConfig,
    OrganismConfig, ParasitismConfig, PredationConfig, PredationLaw, PreyBasis, PreyEntry,
    ReproductionConfig, ReproductionProb, ResponseForm, StageConfig, StageRef, TransitionConfig,
    TransitionProb,
};
pub use registry::{DriverRequirement, FoodWeb, GhostMeta, InfectionLink, ParasitoidMeta, StageMeta};
pub use sim::{
    DriverSeries, Experiment, InitialPopulation, NullObserver, ObservedSeries, PredictionSet,
    RunSpec, SimObserver, Simulation, StepSummary, run_batch, run_for_calibration,
};

/// Named axes of the population tensor `[parcel, stoch, param, stage, time]`.
///
/// Cohort arrays prepend a slot axis: `[slot, parcel, stoch, param, cstage]`.
/// All indexing in the engine goes through these names rather than positional
/// convention.
pub mod axis {
    /// Spatial parcel (field/plot).
    pub const PARCEL: usize = 0;
    /// Stochastic replicate (pure noise draws).
    pub const STOCH: usize = 1;
    /// Parametric replicate (parameter-uncertainty draws).
    pub const PARAM: usize = 2;
    /// Flattened life stage.
    pub const STAGE: usize = 3;
    /// Simulation time index.
    pub const TIME: usize = 4;
    /// Age slot, first axis of cohort arrays only.
    pub const SLOT: usize = 0;
}

/// The three replicated batch axes shared by every per-stage tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchDims {
    /// Number of parcels.
    pub parcels: usize,
    /// Number of stochastic replicates.
    pub stoch: usize,
    /// Number of parametric replicates.
    pub param: usize,
}

impl BatchDims {
    /// Iterate every (parcel, stoch, param) cell in row-major order.
    pub fn cells(&self) -> impl Iterator<Item = (usize, usize, usize)> + use<> {
        let (stoch, param) = (self.stoch, self.param);
        (0..self.parcels).flat_map(move |p| {
            (0..stoch).flat_map(move |e| (0..param).map(move |r| (p, e, r)))
        })
    }

    /// Total cell count.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.parcels * self.stoch * self.param
    }

    /// True when any axis is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Errors raised while compiling a configuration or materializing
/// coefficients. All of these are fatal: nothing is silently defaulted.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FoodWebError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// A trophic or parasitism link names an organism that does not exist.
    #[error("unknown organism \"{0}\"")]
    UnknownOrganism(String),
    /// A link or target names a stage that does not exist on its organism.
    #[error("unknown stage \"{stage}\" of organism \"{organism}\"")]
    UnknownStage {
        /// Organism the reference was resolved against.
        organism: String,
        /// The missing stage name.
        stage: String,
    },
    /// An equation requires a coefficient the configuration does not supply.
    #[error("{organism}/{stage}: missing {category} coefficient \"{parameter}\"")]
    MissingCoefficient {
        /// Owning organism.
        organism: String,
        /// Owning stage.
        stage: String,
        /// Equation category the coefficient belongs to.
        category: &'static str,
        /// Parameter name.
        parameter: &'static str,
    },
    /// A per-replicate coefficient vector does not match the replicate count.
    #[error("{organism}/{stage}: \"{parameter}\" has {got} replicate values, expected {expected}")]
    ReplicateMismatch {
        /// Owning organism.
        organism: String,
        /// Owning stage.
        stage: String,
        /// Parameter name.
        parameter: &'static str,
        /// Number of values supplied.
        got: usize,
        /// Number of parametric replicates requested.
        expected: usize,
    },
    /// A distribution's parameters are outside its domain.
    #[error("{organism}/{stage}: invalid distribution for \"{parameter}\": {reason}")]
    InvalidDistribution {
        /// Owning organism.
        organism: String,
        /// Owning stage.
        stage: String,
        /// Parameter name.
        parameter: &'static str,
        /// Why the distribution could not be constructed.
        reason: &'static str,
    },
    /// An equation kind is reachable in configuration but has no
    /// implementation. Distinct from plain configuration errors.
    #[error("equation kind not implemented: {0}")]
    Unimplemented(&'static str),
}

/// Errors raised while preparing or advancing a simulation run.
#[derive(Debug, Error)]
pub enum SimError {
    /// Compilation/materialization failure surfaced through a run entry point.
    #[error(transparent)]
    Web(#[from] FoodWebError),
    /// A required external driver series was not supplied.
    #[error("missing driver series: {0}")]
    MissingDriver(&'static str),
    /// A driver series ends before the simulation horizon.
    #[error("driver series \"{name}\" has {got} values, needs {needed}")]
    DriverTooShort {
        /// Series name.
        name: String,
        /// Values supplied.
        got: usize,
        /// Values required by the run horizon.
        needed: usize,
    },
    /// An experiment's inputs are inconsistent with the compiled web or the
    /// run specification.
    #[error("invalid experiment: {0}")]
    InvalidExperiment(&'static str),
    /// An initial population or query references a parcel outside the
    /// experiment.
    #[error("parcel {parcel} is outside the experiment's {parcels} parcels")]
    ParcelOutOfRange {
        /// Referenced parcel index.
        parcel: usize,
        /// Number of parcels in the experiment.
        parcels: usize,
    },
    /// A step or prediction query addressed a day beyond the run horizon.
    #[error("day {day} is beyond the run horizon of {days} days")]
    DayOutOfRange {
        /// Requested day.
        day: usize,
        /// Days covered by the run.
        days: usize,
    },
    /// An observation day falls between recorded steps.
    #[error("day {day} is not a multiple of the {step_days}-day step")]
    DayOffGrid {
        /// Requested day.
        day: usize,
        /// Step size of the run.
        step_days: f64,
    },
    /// A prediction query referenced a stage column outside the reported
    /// view.
    #[error("stage column {stage} is outside the {stages}-stage reported view")]
    StageOutOfRange {
        /// Requested column.
        stage: usize,
        /// Columns in the reported view.
        stages: usize,
    },
    /// A debug-mode consistency check failed after a kernel sub-phase.
    /// These indicate an equation or bookkeeping bug, not a runtime condition.
    #[error("internal inconsistency after {phase}: {detail}")]
    InvariantViolation {
        /// Sub-phase that produced the inconsistent state.
        phase: &'static str,
        /// Human-readable description of the violated invariant.
        detail: String,
    },
}
