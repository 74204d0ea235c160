//! The step kernel: one tick of the population tensor. Phases run in a
//! fixed order (noise, predation, growth, mortality, aging, transitions,
//! reproduction), each reading the state the previous phase left behind and
//! mirroring every population change into the cohort store. Populations are
//! whole individuals throughout; every fractional flow is floored or
//! rounded at the point it is applied.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use ndarray::{Array4, Axis, s};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::coeffs::{
    AgingCoefs, AttackLawCoefs, BasisCoefs, GrowthLawCoefs, MaterializedCoefs, MortalityCoefs,
    RateCoefs, ReproductionCoefs, ResponseFormCoefs, TransitionProbCoefs,
};
use crate::cohorts::CohortStore;
use crate::config::{CutoffRule, DayDegreeMethod};
use crate::registry::FoodWeb;
use crate::{BatchDims, SimError};

/// Tolerance when checking that populations stayed whole numbers and that
/// cohort slot sums track the tensor.
const COUNT_TOL: f64 = 1e-6;

/// External forcing for one simulated day. Temperatures are in °C, humidity
/// in percent. Every field is optional; a phase that needs an absent value
/// fails with [`SimError::MissingDriver`].
#[derive(Debug, Clone, Default)]
pub struct DriverDay {
    /// Daily maximum temperature.
    pub t_max: Option<f64>,
    /// Daily minimum temperature.
    pub t_min: Option<f64>,
    /// Daily mean temperature.
    pub t_mean: Option<f64>,
    /// Relative humidity.
    pub humidity: Option<f64>,
    /// Imposed population levels by flattened stage index, for externally
    /// driven stages.
    pub stage_pops: BTreeMap<usize, f64>,
}

impl DriverDay {
    fn max_temperature(&self) -> Result<f64, SimError> {
        self.t_max
            .ok_or(SimError::MissingDriver("maximum temperature"))
    }

    fn min_temperature(&self) -> Result<f64, SimError> {
        self.t_min
            .ok_or(SimError::MissingDriver("minimum temperature"))
    }

    fn mean_temperature(&self) -> Result<f64, SimError> {
        self.t_mean
            .ok_or(SimError::MissingDriver("mean temperature"))
    }

    fn relative_humidity(&self) -> Result<f64, SimError> {
        self.humidity
            .ok_or(SimError::MissingDriver("relative humidity"))
    }
}

/// Wall-clock time spent in each kernel phase, accumulated across steps.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimings {
    /// Demographic noise draws.
    pub noise: Duration,
    /// Predation and parasitism flows.
    pub predation: Duration,
    /// Growth laws.
    pub growth: Duration,
    /// Background mortality.
    pub mortality: Duration,
    /// Age-increment and reproduction-pulse evaluation.
    pub aging: Duration,
    /// Stage transitions.
    pub transitions: Duration,
    /// Reproduction.
    pub reproduction: Duration,
    /// Debug-mode consistency checks.
    pub checks: Duration,
}

impl PhaseTimings {
    /// Total across all phases, checks included.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.noise
            + self.predation
            + self.growth
            + self.mortality
            + self.aging
            + self.transitions
            + self.reproduction
            + self.checks
    }
}

/// Aggregate event counts of one step, summed over the whole tensor.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepEvents {
    /// Individuals removed from victim stages by predation and parasitism.
    pub predated: f64,
    /// Transition departures, death by old age included.
    pub matured: f64,
    /// Offspring added by reproduction.
    pub births: f64,
    /// Background mortality deaths.
    pub deaths: f64,
}

/// Per-stage population deltas of one step, split by cause. Each array is
/// laid out `[parcel, stoch, param, stage]` and holds the net change the
/// phase applied.
#[derive(Debug, Clone)]
pub struct StepDetails {
    /// Demographic noise.
    pub noise: Array4<f64>,
    /// Predation and parasitism, negative on victims and positive on ghost
    /// stages receiving infected hosts.
    pub predation: Array4<f64>,
    /// Growth.
    pub growth: Array4<f64>,
    /// Background mortality.
    pub mortality: Array4<f64>,
    /// Transitions, negative on sources and positive on targets.
    pub transitions: Array4<f64>,
    /// Reproduction, positive on recipients.
    pub reproduction: Array4<f64>,
}

impl StepDetails {
    /// Zeroed delta arrays for one step.
    #[must_use]
    pub fn zeros(dims: BatchDims, n_stages: usize) -> Self {
        let shape = (dims.parcels, dims.stoch, dims.param, n_stages);
        Self {
            noise: Array4::zeros(shape),
            predation: Array4::zeros(shape),
            growth: Array4::zeros(shape),
            mortality: Array4::zeros(shape),
            transitions: Array4::zeros(shape),
            reproduction: Array4::zeros(shape),
        }
    }
}

/// One-step advancement engine. Holds references to the compiled web and the
/// materialized coefficients; the caller owns the mutable tensor, cohort
/// store, and RNG.
#[derive(Debug)]
pub struct Kernel<'w> {
    web: &'w FoodWeb,
    coefs: &'w MaterializedCoefs,
    dims: BatchDims,
    dt: f64,
    areas: Vec<f64>,
    check: bool,
}

impl<'w> Kernel<'w> {
    /// A kernel over `dims` with one area (hectares) per parcel. With
    /// `check` set, every phase is followed by a consistency sweep.
    #[must_use]
    pub fn new(
        web: &'w FoodWeb,
        coefs: &'w MaterializedCoefs,
        dims: BatchDims,
        dt: f64,
        areas: Vec<f64>,
        check: bool,
    ) -> Self {
        Self {
            web,
            coefs,
            dims,
            dt,
            areas,
            check,
        }
    }

    /// Advances `pops` (laid out `[parcel, stoch, param, stage]`) and the
    /// cohort store by one step under the given day's drivers. When
    /// `details` is supplied, per-phase deltas are recorded into it.
    pub fn step(
        &self,
        drivers: &DriverDay,
        pops: &mut Array4<f64>,
        cohorts: &mut CohortStore,
        rng: &mut impl Rng,
        mut timings: Option<&mut PhaseTimings>,
        mut details: Option<&mut StepDetails>,
    ) -> Result<StepEvents, SimError> {
        let mut events = StepEvents::default();
        let mut prev = details.is_some().then(|| pops.clone());

        let clock = Instant::now();
        self.noise(pops, cohorts, rng);
        if let Some(t) = timings.as_deref_mut() {
            t.noise += clock.elapsed();
        }
        if let (Some(d), Some(prev)) = (details.as_deref_mut(), prev.as_mut()) {
            record_delta(prev, pops, &mut d.noise);
        }
        self.checked(pops, cohorts, "noise", timings.as_deref_mut())?;

        let clock = Instant::now();
        let (flows, predated) = self.predation(pops, cohorts);
        events.predated = predated;
        if let Some(t) = timings.as_deref_mut() {
            t.predation += clock.elapsed();
        }
        if let (Some(d), Some(prev)) = (details.as_deref_mut(), prev.as_mut()) {
            record_delta(prev, pops, &mut d.predation);
        }
        self.checked(pops, cohorts, "predation", timings.as_deref_mut())?;

        let clock = Instant::now();
        self.growth(drivers, pops, cohorts, &flows)?;
        if let Some(t) = timings.as_deref_mut() {
            t.growth += clock.elapsed();
        }
        if let (Some(d), Some(prev)) = (details.as_deref_mut(), prev.as_mut()) {
            record_delta(prev, pops, &mut d.growth);
        }
        self.checked(pops, cohorts, "growth", timings.as_deref_mut())?;

        let clock = Instant::now();
        events.deaths = self.mortality(drivers, pops, cohorts)?;
        if let Some(t) = timings.as_deref_mut() {
            t.mortality += clock.elapsed();
        }
        if let (Some(d), Some(prev)) = (details.as_deref_mut(), prev.as_mut()) {
            record_delta(prev, pops, &mut d.mortality);
        }
        self.checked(pops, cohorts, "mortality", timings.as_deref_mut())?;

        // Age increments and reproduction pulses both read the pre-advance
        // ages, so a stage maturing and reproducing on the same day sees one
        // consistent age.
        let clock = Instant::now();
        let increments = self.age_increments(drivers)?;
        let pulses = self.reproduction_pulses(cohorts, &increments);
        if let Some(t) = timings.as_deref_mut() {
            t.aging += clock.elapsed();
        }

        let clock = Instant::now();
        events.matured = self.transitions(pops, cohorts, &increments);
        if let Some(t) = timings.as_deref_mut() {
            t.transitions += clock.elapsed();
        }
        if let (Some(d), Some(prev)) = (details.as_deref_mut(), prev.as_mut()) {
            record_delta(prev, pops, &mut d.transitions);
        }
        self.checked(pops, cohorts, "transitions", timings.as_deref_mut())?;

        let clock = Instant::now();
        events.births = self.reproduction(pops, cohorts, &flows, &pulses);
        if let Some(t) = timings.as_deref_mut() {
            t.reproduction += clock.elapsed();
        }
        if let (Some(d), Some(prev)) = (details.as_deref_mut(), prev.as_mut()) {
            record_delta(prev, pops, &mut d.reproduction);
        }
        self.checked(pops, cohorts, "reproduction", timings.as_deref_mut())?;

        Ok(events)
    }

    /// Demographic noise: a normal draw per cell with standard deviation
    /// `max(1, pop * sigma * dt)`, rounded to whole individuals and clamped
    /// so the stage cannot go negative. Cells where `pop * sigma * dt` is
    /// zero consume no draw, so an all-quiet web is bit-identical across
    /// seeds.
    fn noise(&self, pops: &mut Array4<f64>, cohorts: &mut CohortStore, rng: &mut impl Rng) {
        let dims = self.dims;
        let shape = (dims.parcels, dims.stoch, dims.param, cohorts.n_cstages());
        let mut cohort_delta = Array4::zeros(shape);
        for idx in 0..self.web.n_stages() {
            let Some(sigma) = self.coefs.noise(idx) else {
                continue;
            };
            let cpos = self.web.cohort_pos(idx);
            for (p, e, r) in dims.cells() {
                let pop = pops[[p, e, r, idx]];
                let sd = pop * sigma[r] * self.dt;
                if sd == 0.0 {
                    continue;
                }
                let sd = sd.max(1.0);
                let z: f64 = StandardNormal.sample(rng);
                let delta = (z * sd).round().max(-pop);
                if delta == 0.0 {
                    continue;
                }
                pops[[p, e, r, idx]] += delta;
                if let Some(cp) = cpos {
                    cohort_delta[[p, e, r, cp]] += delta;
                }
            }
        }
        cohorts.adjust(cohort_delta.view());
    }

    /// Predation and parasitism. Per-capita rates are evaluated on
    /// densities, scaled to whole-parcel flows, reconciled across predators
    /// drawing on the same victim, floored, and applied. Flows along
    /// infection links move hosts into ghost stages instead of killing them.
    /// Returns the per-table victim-column flows and the total removed.
    fn predation(
        &self,
        pops: &mut Array4<f64>,
        cohorts: &mut CohortStore,
    ) -> (Vec<Array4<f64>>, f64) {
        let dims = self.dims;
        let tables = self.coefs.attacks();
        let mut flows: Vec<Array4<f64>> = tables
            .iter()
            .map(|t| Array4::zeros((dims.parcels, dims.stoch, dims.param, t.victims.len())))
            .collect();

        for (ti, table) in tables.iter().enumerate() {
            let n_cols = table.victims.len();
            let mut percap = vec![0.0; n_cols];
            let asymptote_weights = match &table.law {
                AttackLawCoefs::DoubleAsymptote { .. } => Some(
                    (0..dims.param)
                        .map(|r| table.a.row(r).to_vec())
                        .collect::<Vec<_>>(),
                ),
                _ => None,
            };
            for (p, e, r) in dims.cells() {
                let area = self.areas[p];
                let pred_pop = pops[[p, e, r, table.attacker]];
                let pred_d = pred_pop / area;
                for (j, &victim) in table.victims.iter().enumerate() {
                    let prey_d = pops[[p, e, r, victim]] / area;
                    let a = table.a[[r, j]];
                    let rate = match &table.law {
                        AttackLawCoefs::Response { form, basis } => {
                            let arg = match basis {
                                BasisCoefs::Prey => prey_d,
                                BasisCoefs::Ratio => prey_d / pred_d,
                                BasisCoefs::HassellVarley { m } => {
                                    prey_d / pred_d.powf(m[[r, j]])
                                }
                            };
                            match form {
                                ResponseFormCoefs::TypeI => a * arg,
                                ResponseFormCoefs::TypeII { b } => a * arg / (arg + b[[r, j]]),
                                ResponseFormCoefs::TypeIII { b } => {
                                    let sq = arg * arg;
                                    a * sq / (sq + b[[r, j]])
                                }
                            }
                        }
                        AttackLawCoefs::BeddingtonDeAngelis { b, c } => {
                            a * prey_d / (b[[r, j]] + prey_d + c[[r, j]] * pred_d)
                        }
                        AttackLawCoefs::DoubleAsymptote { b } => {
                            let b = b[[r, j]];
                            let intake = prey_d + b * ((-prey_d / b).exp() - 1.0);
                            a * (1.0 - (-intake / (a * pred_d)).exp())
                        }
                    };
                    percap[j] = if rate.is_finite() && rate > 0.0 { rate } else { 0.0 };
                }
                if let Some(rows) = &asymptote_weights {
                    // The predator's total intake saturates at 1 per capita,
                    // shared across prey in proportion to attack rates.
                    joint_capacity_correction(&mut percap, Some(rows[r].as_slice()), 1.0);
                }
                for (j, &rate) in percap.iter().enumerate() {
                    flows[ti][[p, e, r, j]] = rate * area * pred_pop * self.dt;
                }
            }
        }

        // Predators drawing on the same victim cannot jointly remove more
        // than the standing population.
        let mut drawers: BTreeMap<usize, Vec<(usize, usize)>> = BTreeMap::new();
        for (ti, table) in tables.iter().enumerate() {
            for (j, &victim) in table.victims.iter().enumerate() {
                drawers.entry(victim).or_default().push((ti, j));
            }
        }
        let mut values = Vec::new();
        for (&victim, cols) in &drawers {
            for (p, e, r) in dims.cells() {
                values.clear();
                values.extend(cols.iter().map(|&(ti, j)| flows[ti][[p, e, r, j]]));
                joint_capacity_correction(&mut values, None, pops[[p, e, r, victim]]);
                for (&(ti, j), &v) in cols.iter().zip(&values) {
                    flows[ti][[p, e, r, j]] = v;
                }
            }
        }
        for flow in &mut flows {
            flow.mapv_inplace(|v| if v.is_nan() { 0.0 } else { v.floor() });
        }

        let links = self.web.infection_links();
        let shape = (dims.parcels, dims.stoch, dims.param, cohorts.n_cstages());
        let mut cohort_deaths = Array4::zeros(shape);
        let mut transfer_deaths: Vec<Array4<f64>> =
            links.iter().map(|_| Array4::zeros(shape)).collect();
        let mut ghost_adds = Array4::zeros(shape);
        let mut removed = 0.0;
        for (ti, table) in tables.iter().enumerate() {
            for (j, &victim) in table.victims.iter().enumerate() {
                let link = links
                    .iter()
                    .position(|l| l.attacker == table.attacker && l.entry == victim);
                for (p, e, r) in dims.cells() {
                    let flow = flows[ti][[p, e, r, j]];
                    if flow == 0.0 {
                        continue;
                    }
                    pops[[p, e, r, victim]] -= flow;
                    removed += flow;
                    match link {
                        Some(li) => {
                            let ghost = links[li].ghost;
                            pops[[p, e, r, ghost]] += flow;
                            match (self.web.cohort_pos(victim), self.web.cohort_pos(ghost)) {
                                (Some(dp), Some(_)) => {
                                    transfer_deaths[li][[p, e, r, dp]] += flow;
                                }
                                (Some(dp), None) => cohort_deaths[[p, e, r, dp]] += flow,
                                (None, Some(gp)) => ghost_adds[[p, e, r, gp]] += flow,
                                (None, None) => {}
                            }
                        }
                        None => {
                            if let Some(dp) = self.web.cohort_pos(victim) {
                                cohort_deaths[[p, e, r, dp]] += flow;
                            }
                        }
                    }
                }
            }
        }
        cohorts.remove(cohort_deaths.view());
        for (li, link) in links.iter().enumerate() {
            if let (Some(dp), Some(gp)) = (
                self.web.cohort_pos(link.entry),
                self.web.cohort_pos(link.ghost),
            ) {
                cohorts.transfer(transfer_deaths[li].view(), &[(dp, gp)]);
            }
        }
        cohorts.add(ghost_adds.view());
        (flows, removed)
    }

    /// Growth laws. Increments are floored to whole individuals and clamped
    /// so a stage never drops below zero.
    fn growth(
        &self,
        drivers: &DriverDay,
        pops: &mut Array4<f64>,
        cohorts: &mut CohortStore,
        flows: &[Array4<f64>],
    ) -> Result<(), SimError> {
        let dims = self.dims;
        let np = dims.param;
        let tables = self.coefs.attacks();
        let shape = (dims.parcels, dims.stoch, dims.param, cohorts.n_cstages());
        let mut cohort_delta = Array4::zeros(shape);
        for idx in 0..self.web.n_stages() {
            let Some(table) = self.coefs.growth(idx) else {
                continue;
            };
            let rate: Vec<f64> = match &table.rate {
                None => vec![1.0; np],
                Some(RateCoefs::Constant { r }) => r.to_vec(),
                Some(RateCoefs::LogNormalTemp { r, t, p }) => {
                    let t_max = drivers.max_temperature()?;
                    (0..np)
                        .map(|ri| r[ri] * log_normal_survival(t_max, t[ri], p[ri]))
                        .collect()
                }
            };
            let driven = match &table.law {
                GrowthLawCoefs::ExternallyDriven => {
                    let Some(&level) = drivers.stage_pops.get(&idx) else {
                        // No series this day: hold the stage.
                        continue;
                    };
                    Some(level)
                }
                _ => None,
            };
            let ti = tables.iter().position(|t| t.attacker == idx);
            let cpos = self.web.cohort_pos(idx);
            for (p, e, r) in dims.cells() {
                let pop = pops[[p, e, r, idx]];
                let raw = match &table.law {
                    GrowthLawCoefs::Exponential => pop * rate[r] * self.dt,
                    GrowthLawCoefs::Logistic { k } => {
                        rate[r] * pop * (1.0 - pop / k[r]) * self.dt
                    }
                    GrowthLawCoefs::LogisticPrey { partners } => {
                        let mut cap = 0.0;
                        for (partner, kv) in partners {
                            cap += pops[[p, e, r, *partner]] * kv[r];
                        }
                        rate[r] * pop * (1.0 - pop / cap) * self.dt
                    }
                    GrowthLawCoefs::LogisticPredation { partners } => {
                        let mut cap = 0.0;
                        if let Some(ti) = ti {
                            for (partner, kv) in partners {
                                let mut eaten = 0.0;
                                for (j, &src) in tables[ti].sources.iter().enumerate() {
                                    if src == *partner {
                                        eaten += flows[ti][[p, e, r, j]];
                                    }
                                }
                                cap += eaten * kv[r];
                            }
                        }
                        rate[r] * pop * (1.0 - pop / cap) * self.dt
                    }
                    GrowthLawCoefs::Constant { n } => n[r] - pop,
                    GrowthLawCoefs::ExternallyDriven => driven.unwrap_or(pop) - pop,
                };
                let mut inc = raw.floor();
                if inc.is_nan() {
                    inc = 0.0;
                }
                inc = inc.max(-pop);
                if inc == 0.0 {
                    continue;
                }
                pops[[p, e, r, idx]] += inc;
                if let Some(cp) = cpos {
                    cohort_delta[[p, e, r, cp]] += inc;
                }
            }
        }
        cohorts.adjust(cohort_delta.view());
        Ok(())
    }

    /// Background mortality: a daily death fraction per law, floored to
    /// whole deaths and clamped to the standing population.
    fn mortality(
        &self,
        drivers: &DriverDay,
        pops: &mut Array4<f64>,
        cohorts: &mut CohortStore,
    ) -> Result<f64, SimError> {
        let dims = self.dims;
        let np = dims.param;
        let shape = (dims.parcels, dims.stoch, dims.param, cohorts.n_cstages());
        let mut cohort_deaths = Array4::zeros(shape);
        let mut died = 0.0;
        for idx in 0..self.web.n_stages() {
            let Some(law) = self.coefs.mortality(idx) else {
                continue;
            };
            let frac: Vec<f64> = match law {
                MortalityCoefs::ConstantHazard { q } => q.to_vec(),
                MortalityCoefs::LogNormalTemp { t, p } => {
                    let t_max = drivers.max_temperature()?;
                    (0..np)
                        .map(|r| 1.0 - log_normal_survival(t_max, t[r], p[r]))
                        .collect()
                }
                MortalityCoefs::AsymptoticHumidity { a, b } => {
                    let humidity = drivers.relative_humidity()?;
                    (0..np)
                        .map(|r| 1.0 - (1.0 - (-a[r] * (humidity - b[r])).exp()).max(0.0))
                        .collect()
                }
                MortalityCoefs::SigmoidTemp { a, b } => {
                    let t_max = drivers.max_temperature()?;
                    (0..np)
                        .map(|r| 1.0 - 1.0 / (1.0 + ((t_max - a[r]) / b[r]).exp()))
                        .collect()
                }
            };
            let cpos = self.web.cohort_pos(idx);
            for (p, e, r) in dims.cells() {
                let pop = pops[[p, e, r, idx]];
                let deaths = (pop * frac[r] * self.dt).floor().clamp(0.0, pop);
                if deaths.is_nan() || deaths <= 0.0 {
                    continue;
                }
                pops[[p, e, r, idx]] -= deaths;
                died += deaths;
                if let Some(cp) = cpos {
                    cohort_deaths[[p, e, r, cp]] += deaths;
                }
            }
        }
        cohorts.remove(cohort_deaths.view());
        Ok(died)
    }

    /// Physiological-age increment per cohort stage, `[parcel, stoch,
    /// param, cstage]`. Drivers are global, so increments vary only across
    /// parametric replicates.
    fn age_increments(&self, drivers: &DriverDay) -> Result<Array4<f64>, SimError> {
        let dims = self.dims;
        let stages = self.web.cohort_stages();
        let mut increments =
            Array4::zeros((dims.parcels, dims.stoch, dims.param, stages.len()));
        for (pos, &idx) in stages.iter().enumerate() {
            let Some(law) = self.coefs.aging(idx) else {
                continue;
            };
            let per_r: Vec<f64> = match law {
                AgingCoefs::Days => vec![self.dt; dims.param],
                AgingCoefs::DegreeDays {
                    min,
                    max,
                    method,
                    cutoff,
                } => {
                    let t_min = drivers.min_temperature()?;
                    let t_max = drivers.max_temperature()?;
                    (0..dims.param)
                        .map(|r| {
                            day_degrees(*method, *cutoff, t_min, t_max, min[r], max[r]) * self.dt
                        })
                        .collect()
                }
                AgingCoefs::Briere { t_dev_min, t_letal } => {
                    let t = drivers.mean_temperature()?;
                    (0..dims.param)
                        .map(|r| development_briere(t, t_dev_min[r], t_letal[r]) * self.dt)
                        .collect()
                }
                AgingCoefs::BriereNonlinear {
                    t_dev_min,
                    t_letal,
                    m,
                } => {
                    let t = drivers.mean_temperature()?;
                    (0..dims.param)
                        .map(|r| {
                            development_briere_nonlinear(t, t_dev_min[r], t_letal[r], m[r])
                                * self.dt
                        })
                        .collect()
                }
                AgingCoefs::Logan {
                    rho,
                    delta,
                    t_letal,
                } => {
                    let t = drivers.mean_temperature()?;
                    (0..dims.param)
                        .map(|r| development_logan(t, rho[r], delta[r], t_letal[r]) * self.dt)
                        .collect()
                }
            };
            for (p, e, r) in dims.cells() {
                increments[[p, e, r, pos]] = per_r[r];
            }
        }
        Ok(increments)
    }

    /// Maturation counts for age-distribution reproduction, evaluated
    /// against the pre-advance ages without touching the store.
    fn reproduction_pulses(
        &self,
        cohorts: &CohortStore,
        increments: &Array4<f64>,
    ) -> BTreeMap<usize, Array4<f64>> {
        let mut pulses = BTreeMap::new();
        for idx in 0..self.web.n_stages() {
            let Some(ReproductionCoefs::AgeDistribution { cdfs, .. }) =
                self.coefs.reproduction(idx)
            else {
                continue;
            };
            let Some(pos) = self.web.cohort_pos(idx) else {
                continue;
            };
            let column = increments.slice(s![.., .., .., pos..=pos]);
            let counts = cohorts.maturing(column, &[pos], |_, r, x| cdfs[r].cdf(x));
            pulses.insert(idx, counts);
        }
        pulses
    }

    /// Stage transitions. Ages advance exactly once per step here, for every
    /// cohort stage. Departures are all computed from the state at phase
    /// start and arrivals land only after every departure, so individuals
    /// never ride a chain of transitions within one step. Returns the total
    /// departure count.
    fn transitions(
        &self,
        pops: &mut Array4<f64>,
        cohorts: &mut CohortStore,
        increments: &Array4<f64>,
    ) -> f64 {
        let dims = self.dims;

        let mut advancing = Vec::new();
        let mut coasting = Vec::new();
        for (pos, &idx) in self.web.cohort_stages().iter().enumerate() {
            match self.coefs.transition(idx).map(|t| &t.prob) {
                Some(TransitionProbCoefs::AgeDistribution { cdfs }) => {
                    advancing.push((pos, cdfs));
                }
                _ => coasting.push(pos),
            }
        }
        let sel: Vec<usize> = advancing.iter().map(|&(pos, _)| pos).collect();
        let sel_increments = increments.select(Axis(3), &sel);
        let matured = cohorts.advance(
            sel_increments.view(),
            &sel,
            |j, r, x| advancing[j].1[r].cdf(x),
            true,
        );
        let coast_increments = increments.select(Axis(3), &coasting);
        cohorts.age(coast_increments.view(), &coasting);

        let snapshot = pops.clone();
        let shape = (dims.parcels, dims.stoch, dims.param, cohorts.n_cstages());
        let mut slot_deaths = Array4::zeros(shape);
        let mut arrivals = Array4::zeros(pops.raw_dim());
        let mut cohort_arrivals = Array4::zeros(shape);
        let mut departed = 0.0;
        for idx in 0..self.web.n_stages() {
            let Some(tc) = self.coefs.transition(idx) else {
                continue;
            };
            let target = self.web.transition_target(idx);
            let target_cpos = target.and_then(|t| self.web.cohort_pos(t));
            let adv_col = match &tc.prob {
                TransitionProbCoefs::AgeDistribution { .. } => self
                    .web
                    .cohort_pos(idx)
                    .and_then(|pos| sel.iter().position(|&s| s == pos)),
                TransitionProbCoefs::ConstantHazard { .. } => None,
            };
            for (p, e, r) in dims.cells() {
                let pop = snapshot[[p, e, r, idx]];
                let departures = match &tc.prob {
                    TransitionProbCoefs::ConstantHazard { q } => {
                        let frac = 1.0 - (1.0 - q[r]).powf(self.dt);
                        (pop * frac).floor().clamp(0.0, pop)
                    }
                    TransitionProbCoefs::AgeDistribution { .. } => {
                        adv_col.map_or(0.0, |j| matured[[p, e, r, j]])
                    }
                };
                if departures == 0.0 {
                    continue;
                }
                pops[[p, e, r, idx]] -= departures;
                departed += departures;
                if let TransitionProbCoefs::ConstantHazard { .. } = &tc.prob
                    && let Some(cp) = self.web.cohort_pos(idx)
                {
                    slot_deaths[[p, e, r, cp]] += departures;
                }
                if let Some(tgt) = target {
                    let moved = match &tc.multiplier {
                        Some(mult) => (departures * mult[r]).round(),
                        None => departures,
                    };
                    arrivals[[p, e, r, tgt]] += moved;
                    if let Some(tp) = target_cpos {
                        cohort_arrivals[[p, e, r, tp]] += moved;
                    }
                }
            }
        }
        cohorts.remove(slot_deaths.view());
        *pops += &arrivals;
        cohorts.add(cohort_arrivals.view());
        departed
    }

    /// Reproduction: offspring counts are rounded and land on the recipient
    /// stage at age zero. Returns the total born.
    fn reproduction(
        &self,
        pops: &mut Array4<f64>,
        cohorts: &mut CohortStore,
        flows: &[Array4<f64>],
        pulses: &BTreeMap<usize, Array4<f64>>,
    ) -> f64 {
        let dims = self.dims;
        let tables = self.coefs.attacks();
        let shape = (dims.parcels, dims.stoch, dims.param, cohorts.n_cstages());
        let mut cohort_newborn = Array4::zeros(shape);
        let mut born = 0.0;
        for idx in 0..self.web.n_stages() {
            let Some(rc) = self.coefs.reproduction(idx) else {
                continue;
            };
            let Some(target) = self.web.reproduction_target(idx) else {
                continue;
            };
            let ti = tables.iter().position(|t| t.attacker == idx);
            let target_cpos = self.web.cohort_pos(target);
            for (p, e, r) in dims.cells() {
                let births = match rc {
                    ReproductionCoefs::Constant { a } => {
                        (pops[[p, e, r, idx]] * a[r] * self.dt).round()
                    }
                    ReproductionCoefs::PredationLinked { n } => match ti {
                        Some(ti) => {
                            let mut expected = 0.0;
                            for (source, per_eaten) in n {
                                let mut eaten = 0.0;
                                for (j, &src) in tables[ti].sources.iter().enumerate() {
                                    if src == *source {
                                        eaten += flows[ti][[p, e, r, j]];
                                    }
                                }
                                expected += eaten * per_eaten[r];
                            }
                            expected.round()
                        }
                        None => 0.0,
                    },
                    ReproductionCoefs::AgeDistribution { n, .. } => match pulses.get(&idx) {
                        Some(counts) => (counts[[p, e, r, 0]] * n[r]).round(),
                        None => 0.0,
                    },
                };
                if births <= 0.0 {
                    continue;
                }
                pops[[p, e, r, target]] += births;
                born += births;
                if let Some(tp) = target_cpos {
                    cohort_newborn[[p, e, r, tp]] += births;
                }
            }
        }
        cohorts.add(cohort_newborn.view());
        born
    }

    fn checked(
        &self,
        pops: &Array4<f64>,
        cohorts: &CohortStore,
        phase: &'static str,
        timings: Option<&mut PhaseTimings>,
    ) -> Result<(), SimError> {
        if !self.check {
            return Ok(());
        }
        let clock = Instant::now();
        let result = self.verify(pops, cohorts, phase);
        if let Some(t) = timings {
            t.checks += clock.elapsed();
        }
        result
    }

    /// Full consistency sweep: populations finite, non-negative, and whole;
    /// cohort slot sums equal to the tensor; cohort arrays clean.
    fn verify(
        &self,
        pops: &Array4<f64>,
        cohorts: &CohortStore,
        phase: &'static str,
    ) -> Result<(), SimError> {
        for ((p, e, r, idx), &v) in pops.indexed_iter() {
            if !v.is_finite() || v < 0.0 || (v - v.round()).abs() > COUNT_TOL {
                let meta = self.web.stage(idx);
                return Err(SimError::InvariantViolation {
                    phase,
                    detail: format!(
                        "{}/{} holds {v} at parcel {p}, stochastic {e}, parametric {r}",
                        meta.organism, meta.name
                    ),
                });
            }
        }
        let totals = cohorts.slot_totals();
        for (pos, &idx) in self.web.cohort_stages().iter().enumerate() {
            for (p, e, r) in self.dims.cells() {
                let slots = totals[[p, e, r, pos]];
                let tensor = pops[[p, e, r, idx]];
                if (slots - tensor).abs() > COUNT_TOL {
                    let meta = self.web.stage(idx);
                    return Err(SimError::InvariantViolation {
                        phase,
                        detail: format!(
                            "{}/{} cohort slots sum to {slots}, tensor holds {tensor}",
                            meta.organism, meta.name
                        ),
                    });
                }
            }
        }
        for ((slot, p, e, r, col), &v) in cohorts.pops().indexed_iter() {
            if !v.is_finite() || v < 0.0 {
                return Err(SimError::InvariantViolation {
                    phase,
                    detail: format!(
                        "cohort slot {slot} of column {col} holds {v} at parcel {p}, \
                         stochastic {e}, parametric {r}"
                    ),
                });
            }
        }
        for ((slot, _, _, _, col), &v) in cohorts.ages().indexed_iter() {
            if !v.is_finite() || v < 0.0 {
                return Err(SimError::InvariantViolation {
                    phase,
                    detail: format!("cohort slot {slot} of column {col} carries age {v}"),
                });
            }
        }
        Ok(())
    }
}

/// Writes `now - prev` into `out` and refreshes `prev`.
fn record_delta(prev: &mut Array4<f64>, now: &Array4<f64>, out: &mut Array4<f64>) {
    out.assign(now);
    *out -= &*prev;
    prev.assign(now);
}

/// Jointly rescales competing draws against a shared capacity. Each value is
/// first expressed as a per-unit fraction `v / w / capacity`; when fractions
/// sum past 1 all values are scaled by `(1 - prod(1 - min(f, 1))) / sum(f)`,
/// which lands the weighted sum on the union-derived total
/// `capacity * (1 - prod(1 - min(f, 1)))`, never above capacity. A weighted
/// draw may legitimately exceed `capacity` on its own; only the per-unit sum
/// is bounded. Under-capacity inputs pass through unchanged, so the
/// projection is idempotent.
pub fn joint_capacity_correction(values: &mut [f64], weights: Option<&[f64]>, capacity: f64) {
    if capacity <= 0.0 {
        values.fill(0.0);
        return;
    }
    let mut sum = 0.0;
    let mut spared = 1.0;
    for (i, &v) in values.iter().enumerate() {
        let w = weights.map_or(1.0, |w| w[i]);
        let mut f = v / w / capacity;
        if f.is_nan() {
            f = 0.0;
        }
        sum += f;
        spared *= 1.0 - f.min(1.0);
    }
    if sum <= 1.0 {
        return;
    }
    let scale = (1.0 - spared) / sum;
    for v in values.iter_mut() {
        *v *= scale;
    }
}

/// Degree-days accumulated in one day, from the daily extremes and the
/// development thresholds. The diurnal curve is integrated exactly for both
/// the triangular and sine shapes; the cutoff rule decides how heat above
/// the upper threshold counts.
#[must_use]
pub fn day_degrees(
    method: DayDegreeMethod,
    cutoff: CutoffRule,
    t_min: f64,
    t_max: f64,
    lower: f64,
    upper: f64,
) -> f64 {
    let (lo, hi) = if t_min <= t_max {
        (t_min, t_max)
    } else {
        (t_max, t_min)
    };
    let excess = |x: f64| mean_excess(method, lo, hi, x);
    let accumulated = match cutoff {
        CutoffRule::None => excess(lower),
        CutoffRule::Horizontal => excess(lower) - excess(upper),
        CutoffRule::Intermediate => excess(lower) - 2.0 * excess(upper),
        CutoffRule::Vertical => {
            excess(lower) - excess(upper) - (upper - lower) * fraction_above(method, lo, hi, upper)
        }
    };
    accumulated.max(0.0)
}

/// Daily mean of `max(T - x, 0)` under the chosen diurnal curve.
fn mean_excess(method: DayDegreeMethod, lo: f64, hi: f64, x: f64) -> f64 {
    if x >= hi {
        return 0.0;
    }
    if x <= lo {
        return (lo + hi) / 2.0 - x;
    }
    match method {
        DayDegreeMethod::Triangular => (hi - x).powi(2) / (2.0 * (hi - lo)),
        DayDegreeMethod::Sine => {
            let mid = (lo + hi) / 2.0;
            let amplitude = (hi - lo) / 2.0;
            let theta = ((x - mid) / amplitude).acos();
            ((mid - x) * theta + amplitude * theta.sin()) / std::f64::consts::PI
        }
    }
}

/// Fraction of the day spent above `x` under the chosen diurnal curve.
fn fraction_above(method: DayDegreeMethod, lo: f64, hi: f64, x: f64) -> f64 {
    if x >= hi {
        return 0.0;
    }
    if x <= lo {
        return 1.0;
    }
    match method {
        DayDegreeMethod::Triangular => (hi - x) / (hi - lo),
        DayDegreeMethod::Sine => {
            let mid = (lo + hi) / 2.0;
            let amplitude = (hi - lo) / 2.0;
            ((x - mid) / amplitude).acos() / std::f64::consts::PI
        }
    }
}

fn development_briere(t: f64, t_dev_min: f64, t_letal: f64) -> f64 {
    non_negative(t * (t - t_dev_min) * (t_letal - t).sqrt())
}

fn development_briere_nonlinear(t: f64, t_dev_min: f64, t_letal: f64, m: f64) -> f64 {
    non_negative(t * (t - t_dev_min) * (t_letal - t).powf(1.0 / m))
}

fn development_logan(t: f64, rho: f64, delta: f64, t_letal: f64) -> f64 {
    non_negative((rho * t).exp() - (rho * t_letal - (t_letal - t) / delta).exp())
}

fn non_negative(rate: f64) -> f64 {
    if rate.is_finite() { rate.max(0.0) } else { 0.0 }
}

/// Log-normal temperature survival `exp(-0.5 * (ln(T / t) / p)^2)`.
fn log_normal_survival(temperature: f64, center: f64, spread: f64) -> f64 {
    let survival = (-0.5 * ((temperature / center).ln() / spread).powi(2)).exp();
    if survival.is_finite() { survival } else { 0.0 }
}
