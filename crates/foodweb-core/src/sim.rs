//! Run orchestration: an [`Experiment`] (initial observations, driver
//! series, parcel areas) plus a [`RunSpec`] instantiate a [`Simulation`]
//! that advances the five-axis population tensor one step at a time through
//! the kernel. Observers receive a [`StepSummary`] per step, a bounded
//! history ring retains recent summaries, and finished runs export a
//! [`PredictionSet`] whose reported view re-absorbs parasitism ghost stages
//! and aligns with observed data columns.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use ndarray::{Array3, Array4, Array5, Axis, s};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rayon::prelude::*;

use crate::coeffs::{GrowthLawCoefs, MaterializedCoefs};
use crate::cohorts::CohortStore;
use crate::config::StageRef;
use crate::kernel::{DriverDay, Kernel, PhaseTimings, StepDetails, StepEvents};
use crate::registry::{DriverRequirement, FoodWeb};
use crate::{BatchDims, FoodWebError, SimError, axis};

/// Shape and switches of one run. Replicate counts and the seed fix the
/// tensor dimensions and every random draw; the toggles control debug
/// checking and per-phase delta recording.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSpec {
    /// Number of steps to advance.
    pub n_steps: usize,
    /// Step size in whole days.
    pub step_days: f64,
    /// Stochastic replicates (pure noise draws).
    pub n_stoch: usize,
    /// Parametric replicates; must match the materialized coefficients.
    pub n_param: usize,
    /// Optional RNG seed for reproducible runs.
    pub seed: Option<u64>,
    /// Record per-phase population deltas every step.
    pub detail: bool,
    /// Run consistency checks after every kernel phase and accumulate
    /// per-phase timings.
    pub debug_checks: bool,
    /// Age slots per cohort store.
    pub cohort_slots: usize,
    /// Maximum number of recent step summaries retained in-memory.
    pub history_capacity: usize,
}

impl Default for RunSpec {
    fn default() -> Self {
        Self {
            n_steps: 30,
            step_days: 1.0,
            n_stoch: 1,
            n_param: 1,
            seed: None,
            detail: false,
            debug_checks: false,
            cohort_slots: 10,
            history_capacity: 256,
        }
    }
}

impl RunSpec {
    /// Checks the run shape before any allocation happens.
    pub fn validate(&self) -> Result<(), FoodWebError> {
        if self.n_steps == 0 {
            return Err(FoodWebError::InvalidConfig("a run covers at least one step"));
        }
        if !(self.step_days >= 1.0 && self.step_days.fract() == 0.0) {
            return Err(FoodWebError::InvalidConfig(
                "step size must be a whole number of days, at least one",
            ));
        }
        if self.n_stoch == 0 || self.n_param == 0 {
            return Err(FoodWebError::InvalidConfig(
                "stochastic and parametric replicate counts must be at least one",
            ));
        }
        if self.cohort_slots == 0 {
            return Err(FoodWebError::InvalidConfig(
                "cohort stores need at least one age slot",
            ));
        }
        if self.history_capacity == 0 {
            return Err(FoodWebError::InvalidConfig("history capacity must be non-zero"));
        }
        Ok(())
    }

    /// Returns the configured RNG seed, generating one from entropy if
    /// absent.
    fn seeded_rng(&self) -> SmallRng {
        match self.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// One observed data column used to seed populations at day zero. A column
/// may cover several stages that were counted together in the field; the
/// observed value is then split round-robin across them.
#[derive(Debug, Clone, PartialEq)]
pub struct InitialPopulation {
    /// Stages the observed column covers.
    pub stages: Vec<StageRef>,
    /// Observed individuals, one value per parcel.
    pub counts: Vec<f64>,
}

impl InitialPopulation {
    /// A column observing a single stage.
    pub fn single(stage: StageRef, counts: Vec<f64>) -> Self {
        Self {
            stages: vec![stage],
            counts,
        }
    }

    /// A column whose count was taken over several stages at once.
    pub fn combined(stages: Vec<StageRef>, counts: Vec<f64>) -> Self {
        Self { stages, counts }
    }
}

/// Day-indexed external forcing series. Each series supplies one value per
/// step; which ones a run needs follows from the laws in force (see
/// [`FoodWeb::required_drivers`]).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverSeries {
    /// Daily maximum temperature, °C.
    pub t_max: Option<Vec<f64>>,
    /// Daily minimum temperature, °C.
    pub t_min: Option<Vec<f64>>,
    /// Daily mean temperature, °C.
    pub t_mean: Option<Vec<f64>>,
    /// Relative humidity, percent.
    pub humidity: Option<Vec<f64>>,
    /// Imposed population levels for externally driven stages. A stage
    /// with no series holds its level.
    pub stage_pops: BTreeMap<StageRef, Vec<f64>>,
}

/// Field data backing one run: parcel areas, day-zero observations, and
/// driver series. The number of parcels is the number of areas.
#[derive(Debug, Clone, PartialEq)]
pub struct Experiment {
    /// Parcel areas in hectares; reported views divide by these.
    pub areas: Vec<f64>,
    /// Observed day-zero columns.
    pub initial: Vec<InitialPopulation>,
    /// External forcing.
    pub drivers: DriverSeries,
}

impl Experiment {
    /// An experiment over the given parcel areas, with no observations or
    /// drivers yet.
    #[must_use]
    pub fn new(areas: Vec<f64>) -> Self {
        Self {
            areas,
            initial: Vec::new(),
            drivers: DriverSeries::default(),
        }
    }

    /// Number of parcels.
    #[must_use]
    pub fn n_parcels(&self) -> usize {
        self.areas.len()
    }
}

/// Layout of one observed series to extract predictions for: the stages the
/// column covers and the days it was read on.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedSeries {
    /// Stages whose reported values are summed into the column.
    pub stages: Vec<StageRef>,
    /// Observation days, counted from day zero.
    pub days: Vec<usize>,
}

/// Summary emitted to observers each step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSummary {
    /// Step index, 1-based; step `i` ends day `i * step_days`.
    pub step: usize,
    /// Displayed population total per organism, ghosts re-absorbed and
    /// summed over every parcel and replicate.
    pub organisms: BTreeMap<String, f64>,
    /// Event counts of the step.
    pub events: StepEvents,
}

/// Observer invoked after each step.
pub trait SimObserver: Send {
    /// Called once per completed step.
    fn on_step(&mut self, summary: &StepSummary);
}

/// No-op observer.
#[derive(Debug, Default)]
pub struct NullObserver;

impl SimObserver for NullObserver {
    fn on_step(&mut self, _summary: &StepSummary) {}
}

/// Driver series with stage references resolved to flattened indices and
/// lengths checked against the horizon.
#[derive(Debug, Clone)]
struct ResolvedDrivers {
    t_max: Option<Vec<f64>>,
    t_min: Option<Vec<f64>>,
    t_mean: Option<Vec<f64>>,
    humidity: Option<Vec<f64>>,
    stage_pops: Vec<(usize, Vec<f64>)>,
}

/// One live run: the population tensor, cohort stores, RNG, and step
/// bookkeeping over a compiled web and materialized coefficients.
pub struct Simulation<'w> {
    web: &'w FoodWeb,
    spec: RunSpec,
    kernel: Kernel<'w>,
    dims: BatchDims,
    areas: Vec<f64>,
    drivers: ResolvedDrivers,
    fold: Vec<Vec<usize>>,
    pops: Array5<f64>,
    work: Array4<f64>,
    cohorts: CohortStore,
    details: Vec<StepDetails>,
    timings: PhaseTimings,
    rng: SmallRng,
    step_index: usize,
    observer: Box<dyn SimObserver>,
    history: VecDeque<StepSummary>,
}

impl fmt::Debug for Simulation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("step", &self.step_index)
            .field("n_steps", &self.spec.n_steps)
            .field("dims", &self.dims)
            .field("n_stages", &self.web.n_stages())
            .finish_non_exhaustive()
    }
}

impl<'w> Simulation<'w> {
    /// Instantiates a run with a no-op observer.
    pub fn new(
        web: &'w FoodWeb,
        coefs: &'w MaterializedCoefs,
        experiment: &Experiment,
        spec: RunSpec,
    ) -> Result<Self, SimError> {
        Self::with_observer(web, coefs, experiment, spec, Box::new(NullObserver))
    }

    /// Instantiates a run with the supplied observer. Fails fast on an
    /// invalid spec, mismatched replicate counts, inconsistent initial
    /// populations, or missing driver series.
    pub fn with_observer(
        web: &'w FoodWeb,
        coefs: &'w MaterializedCoefs,
        experiment: &Experiment,
        spec: RunSpec,
        observer: Box<dyn SimObserver>,
    ) -> Result<Self, SimError> {
        spec.validate()?;
        if coefs.n_param() != spec.n_param {
            return Err(FoodWebError::InvalidConfig(
                "materialized coefficients cover a different parametric replicate count",
            )
            .into());
        }
        if coefs.n_stages() != web.n_stages() {
            return Err(FoodWebError::InvalidConfig(
                "materialized coefficients cover a different stage count",
            )
            .into());
        }
        let parcels = experiment.n_parcels();
        if parcels == 0 {
            return Err(SimError::InvalidExperiment(
                "an experiment needs at least one parcel",
            ));
        }
        if experiment.areas.iter().any(|a| !(*a > 0.0)) {
            return Err(SimError::InvalidExperiment("parcel areas must be positive"));
        }
        let dims = BatchDims {
            parcels,
            stoch: spec.n_stoch,
            param: spec.n_param,
        };
        let drivers = resolve_drivers(web, &experiment.drivers, spec.n_steps)?;
        let fold = display_fold(web);

        let mut work = Array4::zeros((parcels, dims.stoch, dims.param, web.n_stages()));
        place_initial(web, coefs, experiment, dims, &mut work)?;
        let mut cohorts = CohortStore::new(spec.cohort_slots, dims, web.cohort_stages().len());
        cohorts.add(work.select(Axis(axis::STAGE), web.cohort_stages()).view());

        let mut pops = Array5::zeros((
            parcels,
            dims.stoch,
            dims.param,
            web.n_stages(),
            spec.n_steps + 1,
        ));
        pops.index_axis_mut(Axis(axis::TIME), 0).assign(&work);

        let rng = spec.seeded_rng();
        let kernel = Kernel::new(
            web,
            coefs,
            dims,
            spec.step_days,
            experiment.areas.clone(),
            spec.debug_checks,
        );
        let history = VecDeque::with_capacity(spec.history_capacity);
        Ok(Self {
            web,
            areas: experiment.areas.clone(),
            spec,
            kernel,
            dims,
            drivers,
            fold,
            pops,
            work,
            cohorts,
            details: Vec::new(),
            timings: PhaseTimings::default(),
            rng,
            step_index: 0,
            observer,
            history,
        })
    }

    /// Replace the observer.
    pub fn set_observer(&mut self, observer: Box<dyn SimObserver>) {
        self.observer = observer;
    }

    /// The run specification.
    #[must_use]
    pub const fn spec(&self) -> &RunSpec {
        &self.spec
    }

    /// The compiled web this run advances.
    #[must_use]
    pub const fn web(&self) -> &FoodWeb {
        self.web
    }

    /// Completed steps so far.
    #[must_use]
    pub const fn step_index(&self) -> usize {
        self.step_index
    }

    /// Simulated days elapsed.
    #[must_use]
    pub fn day(&self) -> f64 {
        self.step_index as f64 * self.spec.step_days
    }

    /// The full population tensor `[parcel, stoch, param, stage, time]`,
    /// filled up to the current step.
    #[must_use]
    pub const fn populations(&self) -> &Array5<f64> {
        &self.pops
    }

    /// Populations at the current step, `[parcel, stoch, param, stage]`.
    #[must_use]
    pub const fn current(&self) -> &Array4<f64> {
        &self.work
    }

    /// The cohort store backing age-structured stages.
    #[must_use]
    pub const fn cohorts(&self) -> &CohortStore {
        &self.cohorts
    }

    /// Accumulated per-phase timings; all zero unless debug checks are on.
    #[must_use]
    pub const fn timings(&self) -> &PhaseTimings {
        &self.timings
    }

    /// Iterate over retained step summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &StepSummary> {
        self.history.iter()
    }

    /// Advances one step. Fails once the horizon is exhausted.
    pub fn step(&mut self) -> Result<StepEvents, SimError> {
        let step_days = self.spec.step_days as usize;
        if self.step_index >= self.spec.n_steps {
            return Err(SimError::DayOutOfRange {
                day: (self.step_index + 1) * step_days,
                days: self.spec.n_steps * step_days,
            });
        }
        let next = self.step_index + 1;
        let drivers = self.driver_day(self.step_index);
        let mut detail = self
            .spec
            .detail
            .then(|| StepDetails::zeros(self.dims, self.web.n_stages()));
        let timings = if self.spec.debug_checks {
            Some(&mut self.timings)
        } else {
            None
        };
        let events = self.kernel.step(
            &drivers,
            &mut self.work,
            &mut self.cohorts,
            &mut self.rng,
            timings,
            detail.as_mut(),
        )?;
        self.pops
            .index_axis_mut(Axis(axis::TIME), next)
            .assign(&self.work);
        if let Some(detail) = detail {
            self.details.push(detail);
        }
        self.step_index = next;

        let summary = self.summarize(next, events);
        self.observer.on_step(&summary);
        if self.history.len() >= self.spec.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
        Ok(events)
    }

    /// Advances every remaining step.
    pub fn run(&mut self) -> Result<(), SimError> {
        while self.step_index < self.spec.n_steps {
            self.step()?;
        }
        Ok(())
    }

    /// Snapshot of the run so far as an exportable prediction set.
    #[must_use]
    pub fn predictions(&self) -> PredictionSet {
        let n_base = self.web.n_base_stages();
        let labels = (0..n_base)
            .map(|idx| {
                let meta = self.web.stage(idx);
                (meta.organism.clone(), meta.name.clone())
            })
            .collect();
        PredictionSet {
            pops: self.pops.clone(),
            step_days: self.spec.step_days,
            areas: self.areas.clone(),
            n_base,
            labels,
            fold: self.fold.clone(),
            details: self.spec.detail.then(|| self.details.clone()),
        }
    }

    fn driver_day(&self, index: usize) -> DriverDay {
        DriverDay {
            t_max: self.drivers.t_max.as_ref().map(|v| v[index]),
            t_min: self.drivers.t_min.as_ref().map(|v| v[index]),
            t_mean: self.drivers.t_mean.as_ref().map(|v| v[index]),
            humidity: self.drivers.humidity.as_ref().map(|v| v[index]),
            stage_pops: self
                .drivers
                .stage_pops
                .iter()
                .map(|(idx, v)| (*idx, v[index]))
                .collect(),
        }
    }

    fn summarize(&self, step: usize, events: StepEvents) -> StepSummary {
        let mut organisms: BTreeMap<String, f64> = BTreeMap::new();
        for idx in 0..self.web.n_base_stages() {
            let mut total = self.work.index_axis(Axis(axis::STAGE), idx).sum();
            for &ghost in &self.fold[idx] {
                total += self.work.index_axis(Axis(axis::STAGE), ghost).sum();
            }
            *organisms
                .entry(self.web.stage(idx).organism.clone())
                .or_insert(0.0) += total;
        }
        StepSummary {
            step,
            organisms,
            events,
        }
    }
}

/// Ghost columns folded into each base column for display: hosts re-absorb
/// the ghosts parasitizing them, and each parasitoid's juvenile column
/// re-absorbs every ghost of that parasitoid.
fn display_fold(web: &FoodWeb) -> Vec<Vec<usize>> {
    let mut fold = vec![Vec::new(); web.n_base_stages()];
    for (host, extra) in fold.iter_mut().enumerate() {
        extra.extend_from_slice(web.ghosts_of_host(host));
    }
    for meta in web.parasitoids() {
        fold[meta.juvenile].extend(meta.ghosts.iter().copied());
    }
    fold
}

fn resolve_stage(web: &FoodWeb, reference: &StageRef) -> Result<usize, SimError> {
    web.stage_index(&reference.organism, &reference.stage)
        .ok_or_else(|| {
            if web.config().organisms.contains_key(&reference.organism) {
                FoodWebError::UnknownStage {
                    organism: reference.organism.clone(),
                    stage: reference.stage.clone(),
                }
            } else {
                FoodWebError::UnknownOrganism(reference.organism.clone())
            }
            .into()
        })
}

fn check_series(
    name: &'static str,
    series: &Option<Vec<f64>>,
    needed: usize,
) -> Result<(), SimError> {
    if let Some(values) = series
        && values.len() < needed
    {
        return Err(SimError::DriverTooShort {
            name: name.to_owned(),
            got: values.len(),
            needed,
        });
    }
    Ok(())
}

fn resolve_drivers(
    web: &FoodWeb,
    series: &DriverSeries,
    n_steps: usize,
) -> Result<ResolvedDrivers, SimError> {
    check_series("maximum temperature", &series.t_max, n_steps)?;
    check_series("minimum temperature", &series.t_min, n_steps)?;
    check_series("mean temperature", &series.t_mean, n_steps)?;
    check_series("relative humidity", &series.humidity, n_steps)?;
    let mut stage_pops = Vec::with_capacity(series.stage_pops.len());
    for (reference, values) in &series.stage_pops {
        let idx = resolve_stage(web, reference)?;
        if values.len() < n_steps {
            return Err(SimError::DriverTooShort {
                name: format!("{}/{} population", reference.organism, reference.stage),
                got: values.len(),
                needed: n_steps,
            });
        }
        stage_pops.push((idx, values.clone()));
    }
    for requirement in web.required_drivers() {
        let (name, present) = match requirement {
            DriverRequirement::MaxTemperature => ("maximum temperature", series.t_max.is_some()),
            DriverRequirement::MinTemperature => ("minimum temperature", series.t_min.is_some()),
            DriverRequirement::MeanTemperature => ("mean temperature", series.t_mean.is_some()),
            DriverRequirement::RelativeHumidity => ("relative humidity", series.humidity.is_some()),
            // Externally driven stages hold their level when no series is
            // supplied.
            DriverRequirement::StagePopulation(_) => continue,
        };
        if !present {
            return Err(SimError::MissingDriver(name));
        }
    }
    Ok(ResolvedDrivers {
        t_max: series.t_max.clone(),
        t_min: series.t_min.clone(),
        t_mean: series.t_mean.clone(),
        humidity: series.humidity.clone(),
        stage_pops,
    })
}

/// Seeds the day-zero tensor from an experiment's observed columns.
///
/// A column's count is split round-robin over the stages it covers: each
/// gets `floor(count / n)`, the first `count mod n` one extra. Stages on a
/// constant growth law are then pinned to their configured level, and
/// counts observed for parasitoid juveniles are converted into parasitized
/// hosts on the ghost chain, proportionally to the host stage populations.
fn place_initial(
    web: &FoodWeb,
    coefs: &MaterializedCoefs,
    experiment: &Experiment,
    dims: BatchDims,
    work: &mut Array4<f64>,
) -> Result<(), SimError> {
    let mut juveniles: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
    for entry in &experiment.initial {
        if entry.stages.is_empty() {
            return Err(SimError::InvalidExperiment("an observed column names no stages"));
        }
        if entry.counts.len() != dims.parcels {
            return Err(SimError::InvalidExperiment(
                "observed columns need one count per parcel",
            ));
        }
        if entry.counts.iter().any(|c| !c.is_finite() || *c < 0.0) {
            return Err(SimError::InvalidExperiment(
                "initial populations must be finite and non-negative",
            ));
        }
        let columns: Vec<usize> = entry
            .stages
            .iter()
            .map(|reference| resolve_stage(web, reference))
            .collect::<Result<_, _>>()?;
        let n = columns.len() as f64;
        for (p, &observed) in entry.counts.iter().enumerate() {
            let share = (observed / n).floor();
            let remainder = observed - share * n;
            for (j, &idx) in columns.iter().enumerate() {
                let extra = if (j as f64) < remainder { 1.0 } else { 0.0 };
                let value = share + extra;
                if value == 0.0 {
                    continue;
                }
                if is_parasitoid_juvenile(web, idx) {
                    juveniles
                        .entry(idx)
                        .or_insert_with(|| vec![0.0; dims.parcels])[p] += value;
                } else {
                    for e in 0..dims.stoch {
                        for r in 0..dims.param {
                            work[[p, e, r, idx]] += value;
                        }
                    }
                }
            }
        }
    }

    // Constant-law stages hold their level from day zero, observed or not.
    for idx in 0..web.n_stages() {
        if let Some(table) = coefs.growth(idx)
            && let GrowthLawCoefs::Constant { n } = &table.law
        {
            for r in 0..dims.param {
                let level = n[r].floor().max(0.0);
                for p in 0..dims.parcels {
                    for e in 0..dims.stoch {
                        work[[p, e, r, idx]] = level;
                    }
                }
            }
        }
    }

    for (juvenile, counts) in &juveniles {
        let ghosts: Vec<usize> = web
            .parasitoids()
            .iter()
            .filter(|meta| meta.juvenile == *juvenile)
            .flat_map(|meta| meta.ghosts.iter().copied())
            .collect();
        if ghosts.is_empty() {
            return Err(SimError::InvalidExperiment(
                "a parasitoid juvenile column has no ghost stages to seed",
            ));
        }
        for (p, e, r) in dims.cells() {
            let observed = counts[p];
            if observed > 0.0 {
                seed_juveniles(web, work, (p, e, r), observed, &ghosts)?;
            }
        }
    }
    Ok(())
}

fn is_parasitoid_juvenile(web: &FoodWeb, idx: usize) -> bool {
    web.parasitoids().iter().any(|meta| meta.juvenile == idx)
}

/// Converts `observed` juveniles of one cell into parasitized hosts. Whole
/// individuals move from each host stage to its ghost, floor-proportionally
/// to the host populations, the remainder one at a time in chain order
/// while a host still has individuals left.
fn seed_juveniles(
    web: &FoodWeb,
    work: &mut Array4<f64>,
    (p, e, r): (usize, usize, usize),
    observed: f64,
    ghosts: &[usize],
) -> Result<(), SimError> {
    let pairs: Vec<(usize, usize)> = ghosts
        .iter()
        .filter_map(|&ghost| {
            web.stage(ghost)
                .ghost
                .as_ref()
                .map(|meta| (ghost, meta.host_stage))
        })
        .collect();
    let total: f64 = pairs.iter().map(|&(_, host)| work[[p, e, r, host]]).sum();
    if observed > total {
        return Err(SimError::InvalidExperiment(
            "more initial parasitoid juveniles than host individuals",
        ));
    }
    let mut moved: Vec<f64> = pairs
        .iter()
        .map(|&(_, host)| {
            let available = work[[p, e, r, host]];
            (observed * available / total).floor().min(available)
        })
        .collect();
    let mut left = observed - moved.iter().sum::<f64>();
    while left >= 1.0 {
        let mut progressed = false;
        for (k, &(_, host)) in pairs.iter().enumerate() {
            if left < 1.0 {
                break;
            }
            if work[[p, e, r, host]] - moved[k] >= 1.0 {
                moved[k] += 1.0;
                left -= 1.0;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    for (k, &(ghost, host)) in pairs.iter().enumerate() {
        work[[p, e, r, host]] -= moved[k];
        work[[p, e, r, ghost]] += moved[k];
    }
    Ok(())
}

/// Finished-run results. The raw tensor keeps every stage column including
/// ghosts; the reported view divides by parcel area, re-absorbs ghosts into
/// their host and parasitoid juvenile columns, and keeps configured stages
/// only.
#[derive(Debug, Clone)]
pub struct PredictionSet {
    pops: Array5<f64>,
    step_days: f64,
    areas: Vec<f64>,
    n_base: usize,
    labels: Vec<(String, String)>,
    fold: Vec<Vec<usize>>,
    details: Option<Vec<StepDetails>>,
}

impl PredictionSet {
    /// Steps covered by the run.
    #[must_use]
    pub fn n_steps(&self) -> usize {
        self.pops.len_of(Axis(axis::TIME)) - 1
    }

    /// The raw population tensor `[parcel, stoch, param, stage, time]`,
    /// ghost columns included, in individuals.
    #[must_use]
    pub const fn raw(&self) -> &Array5<f64> {
        &self.pops
    }

    /// The raw tensor scaled to individuals per hectare.
    #[must_use]
    pub fn per_hectare(&self) -> Array5<f64> {
        let mut out = self.pops.clone();
        for (p, &area) in self.areas.iter().enumerate() {
            out.index_axis_mut(Axis(axis::PARCEL), p)
                .mapv_inplace(|v| v / area);
        }
        out
    }

    /// The reported view: per hectare, ghosts re-absorbed, configured
    /// stages only.
    #[must_use]
    pub fn reported(&self) -> Array5<f64> {
        let (parcels, stoch, param, _, time) = self.pops.dim();
        let mut out = Array5::zeros((parcels, stoch, param, self.n_base, time));
        for column in 0..self.n_base {
            let mut folded = self.pops.index_axis(Axis(axis::STAGE), column).to_owned();
            for &ghost in &self.fold[column] {
                folded += &self.pops.index_axis(Axis(axis::STAGE), ghost);
            }
            out.index_axis_mut(Axis(axis::STAGE), column).assign(&folded);
        }
        for (p, &area) in self.areas.iter().enumerate() {
            out.index_axis_mut(Axis(axis::PARCEL), p)
                .mapv_inplace(|v| v / area);
        }
        out
    }

    /// Column index of a stage in the reported view.
    #[must_use]
    pub fn stage_column(&self, organism: &str, stage: &str) -> Option<usize> {
        self.labels
            .iter()
            .position(|(o, s)| o == organism && s == stage)
    }

    /// Reported series of one column on one parcel, `[stoch, param, time]`.
    pub fn column_series(&self, parcel: usize, column: usize) -> Result<Array3<f64>, SimError> {
        if parcel >= self.areas.len() {
            return Err(SimError::ParcelOutOfRange {
                parcel,
                parcels: self.areas.len(),
            });
        }
        if column >= self.n_base {
            return Err(SimError::StageOutOfRange {
                stage: column,
                stages: self.n_base,
            });
        }
        let reported = self.reported();
        Ok(reported.slice(s![parcel, .., .., column, ..]).to_owned())
    }

    /// Extracts one prediction array per observed series, aligned
    /// one-to-one with the observation layout. Each array is laid out
    /// `[parcel, stoch, param, observation day]` in reported units.
    pub fn aligned(&self, series: &[ObservedSeries]) -> Result<Vec<Array4<f64>>, SimError> {
        let reported = self.reported();
        let (parcels, stoch, param, ..) = self.pops.dim();
        series
            .iter()
            .map(|observed| {
                let columns: Vec<usize> = observed
                    .stages
                    .iter()
                    .map(|reference| {
                        self.stage_column(&reference.organism, &reference.stage)
                            .ok_or_else(|| {
                                SimError::from(FoodWebError::UnknownStage {
                                    organism: reference.organism.clone(),
                                    stage: reference.stage.clone(),
                                })
                            })
                    })
                    .collect::<Result<_, _>>()?;
                let mut out = Array4::zeros((parcels, stoch, param, observed.days.len()));
                for (d, &day) in observed.days.iter().enumerate() {
                    let t = self.day_index(day)?;
                    for &column in &columns {
                        let mut slot = out.index_axis_mut(Axis(3), d);
                        slot += &reported.slice(s![.., .., .., column, t]);
                    }
                }
                Ok(out)
            })
            .collect()
    }

    /// Per-phase population deltas, one entry per step; `None` unless the
    /// run recorded details.
    #[must_use]
    pub fn details(&self) -> Option<&[StepDetails]> {
        self.details.as_deref()
    }

    fn day_index(&self, day: usize) -> Result<usize, SimError> {
        let step = self.step_days as usize;
        if day % step != 0 {
            return Err(SimError::DayOffGrid {
                day,
                step_days: self.step_days,
            });
        }
        let index = day / step;
        if index > self.n_steps() {
            return Err(SimError::DayOutOfRange {
                day,
                days: self.n_steps() * step,
            });
        }
        Ok(index)
    }
}

/// Runs one simulation to completion and exports its predictions. This is
/// the entry point calibration drivers loop over: the web and coefficients
/// are shared immutably, every mutable piece lives in the run.
pub fn run_for_calibration(
    web: &FoodWeb,
    coefs: &MaterializedCoefs,
    experiment: &Experiment,
    spec: &RunSpec,
) -> Result<PredictionSet, SimError> {
    let mut sim = Simulation::new(web, coefs, experiment, spec.clone())?;
    sim.run()?;
    Ok(sim.predictions())
}

/// Runs one simulation per spec in parallel. Runs are independent; seeds
/// in the specs keep them reproducible.
pub fn run_batch(
    web: &FoodWeb,
    coefs: &MaterializedCoefs,
    experiment: &Experiment,
    specs: &[RunSpec],
) -> Result<Vec<PredictionSet>, SimError> {
    specs
        .par_iter()
        .map(|spec| run_for_calibration(web, coefs, experiment, spec))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AgingLaw, FoodWebConfig, GrowthConfig, GrowthLaw, GrowthModifier, HostSpec, OrganismConfig,
        ParasitismConfig, PredationConfig, PredationLaw, PreyBasis, PreyEntry, ResponseForm,
        StageConfig, TransitionConfig, TransitionProb,
    };
    use std::sync::{Arc, Mutex};

    fn organisms(
        entries: Vec<(&str, OrganismConfig)>,
    ) -> std::collections::BTreeMap<String, OrganismConfig> {
        entries
            .into_iter()
            .map(|(name, cfg)| (name.to_owned(), cfg))
            .collect()
    }

    fn build(config: FoodWebConfig) -> (FoodWeb, MaterializedCoefs) {
        let web = FoodWeb::compile(&config).unwrap();
        let mut rng = SmallRng::seed_from_u64(7);
        let coefs = MaterializedCoefs::build(&web, 1, &mut rng).unwrap();
        (web, coefs)
    }

    fn inert_web() -> (FoodWeb, MaterializedCoefs) {
        build(FoodWebConfig {
            organisms: organisms(vec![(
                "moth",
                OrganismConfig {
                    stages: vec![StageConfig::new("colony")],
                },
            )]),
        })
    }

    /// A wasp parasitizing both aphid stages with a linear attack rate.
    fn parasitized_web(a: f64) -> FoodWebConfig {
        FoodWebConfig {
            organisms: organisms(vec![
                (
                    "aphid",
                    OrganismConfig {
                        stages: vec![StageConfig::new("nymph"), StageConfig::new("adult")],
                    },
                ),
                (
                    "wasp",
                    OrganismConfig {
                        stages: vec![
                            StageConfig {
                                aging: Some(AgingLaw::Days),
                                transition: Some(TransitionConfig {
                                    prob: TransitionProb::ConstantHazard { q: 0.0.into() },
                                    multiplier: None,
                                    target: Some("adult".to_owned()),
                                }),
                                ..StageConfig::new("juvenile")
                            },
                            StageConfig {
                                predation: Some(PredationConfig {
                                    law: PredationLaw::Response {
                                        form: ResponseForm::TypeI,
                                        basis: PreyBasis::Prey,
                                    },
                                    prey: vec![
                                        PreyEntry::new(StageRef::new("aphid", "nymph"), a),
                                        PreyEntry::new(StageRef::new("aphid", "adult"), a),
                                    ],
                                }),
                                parasitism: Some(ParasitismConfig {
                                    juvenile_stage: "juvenile".to_owned(),
                                    recipient_stage: "adult".to_owned(),
                                    hosts: vec![HostSpec {
                                        organism: "aphid".to_owned(),
                                        entry_stages: vec![
                                            "nymph".to_owned(),
                                            "adult".to_owned(),
                                        ],
                                        exit_stage: "adult".to_owned(),
                                    }],
                                }),
                                ..StageConfig::new("adult")
                            },
                        ],
                    },
                ),
            ]),
        }
    }

    #[test]
    fn run_spec_rejects_degenerate_shapes() {
        assert!(RunSpec::default().validate().is_ok());
        let broken = [
            RunSpec {
                n_steps: 0,
                ..RunSpec::default()
            },
            RunSpec {
                step_days: 0.5,
                ..RunSpec::default()
            },
            RunSpec {
                n_stoch: 0,
                ..RunSpec::default()
            },
            RunSpec {
                cohort_slots: 0,
                ..RunSpec::default()
            },
            RunSpec {
                history_capacity: 0,
                ..RunSpec::default()
            },
        ];
        for spec in broken {
            assert!(spec.validate().is_err());
        }
    }

    #[test]
    fn observed_columns_split_round_robin_across_stages() {
        let (web, coefs) = build(FoodWebConfig {
            organisms: organisms(vec![(
                "whitefly",
                OrganismConfig {
                    stages: vec![
                        StageConfig::new("egg"),
                        StageConfig::new("nymph"),
                        StageConfig::new("adult"),
                    ],
                },
            )]),
        });
        let mut experiment = Experiment::new(vec![1.0, 1.0]);
        experiment.initial.push(InitialPopulation::combined(
            vec![
                StageRef::new("whitefly", "egg"),
                StageRef::new("whitefly", "nymph"),
                StageRef::new("whitefly", "adult"),
            ],
            vec![7.0, 5.0],
        ));
        let sim = Simulation::new(&web, &coefs, &experiment, RunSpec::default()).unwrap();

        let egg = web.stage_index("whitefly", "egg").unwrap();
        let nymph = web.stage_index("whitefly", "nymph").unwrap();
        let adult = web.stage_index("whitefly", "adult").unwrap();
        let pops = sim.populations();
        assert_eq!(pops[[0, 0, 0, egg, 0]], 3.0);
        assert_eq!(pops[[0, 0, 0, nymph, 0]], 2.0);
        assert_eq!(pops[[0, 0, 0, adult, 0]], 2.0);
        assert_eq!(pops[[1, 0, 0, egg, 0]], 2.0);
        assert_eq!(pops[[1, 0, 0, nymph, 0]], 2.0);
        assert_eq!(pops[[1, 0, 0, adult, 0]], 1.0);
    }

    #[test]
    fn constant_growth_stages_start_at_their_level() {
        let (web, coefs) = build(FoodWebConfig {
            organisms: organisms(vec![(
                "clover",
                OrganismConfig {
                    stages: vec![StageConfig {
                        growth: Some(GrowthConfig {
                            law: GrowthLaw::Constant { n: 250.7.into() },
                            modifier: None,
                        }),
                        ..StageConfig::new("cover")
                    }],
                },
            )]),
        });
        let experiment = Experiment::new(vec![1.0]);
        let sim = Simulation::new(&web, &coefs, &experiment, RunSpec::default()).unwrap();
        let cover = web.stage_index("clover", "cover").unwrap();
        assert_eq!(sim.populations()[[0, 0, 0, cover, 0]], 250.0);
    }

    #[test]
    fn juvenile_observations_convert_hosts_into_ghosts() {
        let (web, coefs) = build(parasitized_web(0.0));
        let mut experiment = Experiment::new(vec![1.0]);
        experiment.initial.push(InitialPopulation::single(
            StageRef::new("aphid", "nymph"),
            vec![30.0],
        ));
        experiment.initial.push(InitialPopulation::single(
            StageRef::new("aphid", "adult"),
            vec![10.0],
        ));
        experiment.initial.push(InitialPopulation::single(
            StageRef::new("wasp", "juvenile"),
            vec![8.0],
        ));
        let sim = Simulation::new(&web, &coefs, &experiment, RunSpec::default()).unwrap();

        let nymph = web.stage_index("aphid", "nymph").unwrap();
        let adult = web.stage_index("aphid", "adult").unwrap();
        let juvenile = web.stage_index("wasp", "juvenile").unwrap();
        let ghost_nymph = web.ghosts_of_host(nymph)[0];
        let ghost_adult = web.ghosts_of_host(adult)[0];
        let pops = sim.populations();
        assert_eq!(pops[[0, 0, 0, nymph, 0]], 24.0);
        assert_eq!(pops[[0, 0, 0, adult, 0]], 8.0);
        assert_eq!(pops[[0, 0, 0, ghost_nymph, 0]], 6.0);
        assert_eq!(pops[[0, 0, 0, ghost_adult, 0]], 2.0);
        assert_eq!(pops[[0, 0, 0, juvenile, 0]], 0.0);

        // The reported view shows the full aphid counts and the juveniles.
        let predictions = sim.predictions();
        let reported = predictions.reported();
        let n_col = predictions.stage_column("aphid", "nymph").unwrap();
        let j_col = predictions.stage_column("wasp", "juvenile").unwrap();
        assert_eq!(reported[[0, 0, 0, n_col, 0]], 30.0);
        assert_eq!(reported[[0, 0, 0, j_col, 0]], 8.0);
    }

    #[test]
    fn juveniles_beyond_host_populations_are_rejected() {
        let (web, coefs) = build(parasitized_web(0.0));
        let mut experiment = Experiment::new(vec![1.0]);
        experiment.initial.push(InitialPopulation::single(
            StageRef::new("aphid", "nymph"),
            vec![30.0],
        ));
        experiment.initial.push(InitialPopulation::single(
            StageRef::new("wasp", "juvenile"),
            vec![50.0],
        ));
        let err = Simulation::new(&web, &coefs, &experiment, RunSpec::default()).unwrap_err();
        assert!(matches!(err, SimError::InvalidExperiment(_)));
    }

    #[test]
    fn missing_required_drivers_fail_before_the_run() {
        let (web, coefs) = build(FoodWebConfig {
            organisms: organisms(vec![(
                "aphid",
                OrganismConfig {
                    stages: vec![StageConfig {
                        growth: Some(GrowthConfig {
                            law: GrowthLaw::Exponential,
                            modifier: Some(GrowthModifier::LogNormalTemp {
                                r: 0.1.into(),
                                t: 25.0.into(),
                                p: 1.0.into(),
                            }),
                        }),
                        ..StageConfig::new("colony")
                    }],
                },
            )]),
        });
        let experiment = Experiment::new(vec![1.0]);
        let err = Simulation::new(&web, &coefs, &experiment, RunSpec::default()).unwrap_err();
        assert!(matches!(err, SimError::MissingDriver("maximum temperature")));
    }

    #[test]
    fn short_driver_series_fail_before_the_run() {
        let (web, coefs) = build(FoodWebConfig {
            organisms: organisms(vec![(
                "aphid",
                OrganismConfig {
                    stages: vec![StageConfig {
                        growth: Some(GrowthConfig {
                            law: GrowthLaw::Exponential,
                            modifier: Some(GrowthModifier::LogNormalTemp {
                                r: 0.1.into(),
                                t: 25.0.into(),
                                p: 1.0.into(),
                            }),
                        }),
                        ..StageConfig::new("colony")
                    }],
                },
            )]),
        });
        let mut experiment = Experiment::new(vec![1.0]);
        experiment.drivers.t_max = Some(vec![25.0, 26.0, 24.0]);
        let spec = RunSpec {
            n_steps: 5,
            ..RunSpec::default()
        };
        let err = Simulation::new(&web, &coefs, &experiment, spec).unwrap_err();
        match err {
            SimError::DriverTooShort { name, got, needed } => {
                assert_eq!(name, "maximum temperature");
                assert_eq!(got, 3);
                assert_eq!(needed, 5);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    struct Recorder(Arc<Mutex<Vec<usize>>>);

    impl SimObserver for Recorder {
        fn on_step(&mut self, summary: &StepSummary) {
            self.0.lock().unwrap().push(summary.step);
        }
    }

    #[test]
    fn history_ring_keeps_the_most_recent_summaries() {
        let (web, coefs) = inert_web();
        let mut experiment = Experiment::new(vec![1.0]);
        experiment.initial.push(InitialPopulation::single(
            StageRef::new("moth", "colony"),
            vec![5.0],
        ));
        let spec = RunSpec {
            n_steps: 6,
            history_capacity: 4,
            ..RunSpec::default()
        };
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut sim = Simulation::with_observer(
            &web,
            &coefs,
            &experiment,
            spec,
            Box::new(Recorder(Arc::clone(&seen))),
        )
        .unwrap();
        sim.run().unwrap();

        let steps: Vec<usize> = sim.history().map(|s| s.step).collect();
        assert_eq!(steps, vec![3, 4, 5, 6]);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5, 6]);
        for summary in sim.history() {
            assert_eq!(summary.organisms["moth"], 5.0);
            assert_eq!(summary.events, StepEvents::default());
        }
    }

    #[test]
    fn reported_view_reabsorbs_ghosts_per_hectare() {
        let (web, coefs) = build(parasitized_web(0.03));
        let mut experiment = Experiment::new(vec![2.0]);
        experiment.initial.push(InitialPopulation::single(
            StageRef::new("aphid", "nymph"),
            vec![100.0],
        ));
        experiment.initial.push(InitialPopulation::single(
            StageRef::new("aphid", "adult"),
            vec![100.0],
        ));
        experiment.initial.push(InitialPopulation::single(
            StageRef::new("wasp", "adult"),
            vec![1.0],
        ));
        let spec = RunSpec {
            n_steps: 1,
            debug_checks: true,
            ..RunSpec::default()
        };
        let mut sim = Simulation::new(&web, &coefs, &experiment, spec).unwrap();
        let events = sim.step().unwrap();
        // One wasp infecting 0.03 * 100 hosts in each of two stages.
        assert_eq!(events.predated, 6.0);

        let nymph = web.stage_index("aphid", "nymph").unwrap();
        let ghost_nymph = web.ghosts_of_host(nymph)[0];
        let predictions = sim.predictions();
        let raw = predictions.raw();
        assert_eq!(raw[[0, 0, 0, nymph, 1]], 97.0);
        assert_eq!(raw[[0, 0, 0, ghost_nymph, 1]], 3.0);

        let reported = predictions.reported();
        let n_col = predictions.stage_column("aphid", "nymph").unwrap();
        let j_col = predictions.stage_column("wasp", "juvenile").unwrap();
        let w_col = predictions.stage_column("wasp", "adult").unwrap();
        // Hosts re-absorb their ghosts, so the displayed aphid column is
        // flat; the juvenile column shows the infections. Units are per ha.
        assert_eq!(reported[[0, 0, 0, n_col, 0]], 50.0);
        assert_eq!(reported[[0, 0, 0, n_col, 1]], 50.0);
        assert_eq!(reported[[0, 0, 0, j_col, 0]], 0.0);
        assert_eq!(reported[[0, 0, 0, j_col, 1]], 3.0);
        assert_eq!(reported[[0, 0, 0, w_col, 1]], 0.5);

        let per_ha = predictions.per_hectare();
        assert_eq!(per_ha[[0, 0, 0, nymph, 1]], 48.5);
    }

    #[test]
    fn aligned_series_follow_the_observation_layout() {
        let (web, coefs) = inert_web();
        let mut experiment = Experiment::new(vec![1.0]);
        experiment.initial.push(InitialPopulation::single(
            StageRef::new("moth", "colony"),
            vec![12.0],
        ));
        let spec = RunSpec {
            n_steps: 2,
            step_days: 2.0,
            ..RunSpec::default()
        };
        let mut sim = Simulation::new(&web, &coefs, &experiment, spec).unwrap();
        sim.run().unwrap();
        let predictions = sim.predictions();

        let series = predictions
            .aligned(&[ObservedSeries {
                stages: vec![StageRef::new("moth", "colony")],
                days: vec![0, 2, 4],
            }])
            .unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].shape(), &[1, 1, 1, 3]);
        assert_eq!(series[0][[0, 0, 0, 0]], 12.0);
        assert_eq!(series[0][[0, 0, 0, 2]], 12.0);

        let off_grid = predictions.aligned(&[ObservedSeries {
            stages: vec![StageRef::new("moth", "colony")],
            days: vec![3],
        }]);
        assert!(matches!(off_grid, Err(SimError::DayOffGrid { day: 3, .. })));

        let beyond = predictions.aligned(&[ObservedSeries {
            stages: vec![StageRef::new("moth", "colony")],
            days: vec![6],
        }]);
        assert!(matches!(beyond, Err(SimError::DayOutOfRange { day: 6, .. })));
    }

    #[test]
    fn replicate_count_must_match_materialization() {
        let (web, coefs) = inert_web();
        let experiment = Experiment::new(vec![1.0]);
        let spec = RunSpec {
            n_param: 2,
            ..RunSpec::default()
        };
        let err = Simulation::new(&web, &coefs, &experiment, spec).unwrap_err();
        assert!(matches!(
            err,
            SimError::Web(FoodWebError::InvalidConfig(_))
        ));
    }

    #[test]
    fn materialization_must_match_the_web() {
        let (web, _) = build(FoodWebConfig {
            organisms: organisms(vec![(
                "moth",
                OrganismConfig {
                    stages: vec![StageConfig::new("egg"), StageConfig::new("colony")],
                },
            )]),
        });
        let (_, coefs) = inert_web();
        let experiment = Experiment::new(vec![1.0]);
        let err = Simulation::new(&web, &coefs, &experiment, RunSpec::default()).unwrap_err();
        assert!(matches!(
            err,
            SimError::Web(FoodWebError::InvalidConfig(_))
        ));
    }

    #[test]
    fn stepping_past_the_horizon_fails() {
        let (web, coefs) = inert_web();
        let experiment = Experiment::new(vec![1.0]);
        let spec = RunSpec {
            n_steps: 1,
            ..RunSpec::default()
        };
        let mut sim = Simulation::new(&web, &coefs, &experiment, spec).unwrap();
        sim.step().unwrap();
        assert!(matches!(
            sim.step(),
            Err(SimError::DayOutOfRange { day: 2, days: 1 })
        ));
    }
}
