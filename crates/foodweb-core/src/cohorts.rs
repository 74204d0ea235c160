//! Age-structured cohort bookkeeping. Stages with an aging law track their
//! populations in a fixed number of age slots; the kernel mirrors every
//! population change into this store so maturation probabilities can follow
//! accumulated physiological age instead of calendar time.

use ndarray::{Array4, Array5, ArrayView4, Axis};
use ordered_float::OrderedFloat;

use crate::{BatchDims, axis};

/// Population and mean-age slots for every cohort-tracked stage, laid out
/// `[slot, parcel, stoch, param, cstage]`. The slot-sum of `pops` always
/// equals the corresponding stage population in the main tensor.
#[derive(Debug, Clone)]
pub struct CohortStore {
    pops: Array5<f64>,
    ages: Array5<f64>,
    dims: BatchDims,
    n_cstages: usize,
    slots: usize,
}

impl CohortStore {
    /// An empty store with the given slot count per stage.
    #[must_use]
    pub fn new(slots: usize, dims: BatchDims, n_cstages: usize) -> Self {
        let shape = (slots, dims.parcels, dims.stoch, dims.param, n_cstages);
        Self {
            pops: Array5::zeros(shape),
            ages: Array5::zeros(shape),
            dims,
            n_cstages,
            slots,
        }
    }

    /// Number of age slots per stage.
    #[must_use]
    pub const fn n_slots(&self) -> usize {
        self.slots
    }

    /// Number of cohort-tracked stages.
    #[must_use]
    pub const fn n_cstages(&self) -> usize {
        self.n_cstages
    }

    /// Slot populations, `[slot, parcel, stoch, param, cstage]`.
    #[must_use]
    pub fn pops(&self) -> &Array5<f64> {
        &self.pops
    }

    /// Slot mean ages, same layout as [`Self::pops`].
    #[must_use]
    pub fn ages(&self) -> &Array5<f64> {
        &self.ages
    }

    /// Per-cell population summed over slots, `[parcel, stoch, param,
    /// cstage]`.
    #[must_use]
    pub fn slot_totals(&self) -> Array4<f64> {
        self.pops.sum_axis(Axis(axis::SLOT))
    }

    /// Adds newborn individuals at age zero.
    pub fn add(&mut self, additions: ArrayView4<'_, f64>) {
        let zero = Array4::zeros(additions.raw_dim());
        self.add_aged(additions, zero.view());
    }

    /// Adds individuals carrying an age. Per cell, ages of empty slots are
    /// reset, then the minimum-age slot (first on ties) absorbs the
    /// addition with a population-weighted mean age.
    pub fn add_aged(&mut self, additions: ArrayView4<'_, f64>, ages: ArrayView4<'_, f64>) {
        for (p, e, r) in self.dims.cells() {
            for k in 0..self.n_cstages {
                let new = additions[[p, e, r, k]];
                if new == 0.0 {
                    continue;
                }
                for s in 0..self.slots {
                    if self.pops[[s, p, e, r, k]] == 0.0 {
                        self.ages[[s, p, e, r, k]] = 0.0;
                    }
                }
                let slot = (0..self.slots)
                    .min_by_key(|&s| OrderedFloat(self.ages[[s, p, e, r, k]]))
                    .unwrap_or(0);
                let pop_old = self.pops[[slot, p, e, r, k]];
                let mut weight = pop_old / (pop_old + new);
                if weight.is_nan() {
                    weight = 0.0;
                }
                let merged = self.ages[[slot, p, e, r, k]] * weight
                    + ages[[p, e, r, k]] * (1.0 - weight);
                self.ages[[slot, p, e, r, k]] = merged;
                self.pops[[slot, p, e, r, k]] += new;
            }
        }
    }

    /// Removes individuals: floor-proportional across slots, then one at a
    /// time from slots in ascending order until the requested count is met
    /// or the stage is empty.
    pub fn remove(&mut self, deaths: ArrayView4<'_, f64>) {
        self.remove_tracked(deaths);
    }

    /// As [`Self::remove`], returning the per-slot removed counts.
    fn remove_tracked(&mut self, deaths: ArrayView4<'_, f64>) -> Array5<f64> {
        let mut removed = Array5::zeros(self.pops.raw_dim());
        for (p, e, r) in self.dims.cells() {
            for k in 0..self.n_cstages {
                let need = deaths[[p, e, r, k]];
                if need <= 0.0 {
                    continue;
                }
                let mut total = 0.0;
                for s in 0..self.slots {
                    total += self.pops[[s, p, e, r, k]];
                }
                let mut left = need;
                if total > 0.0 {
                    for s in 0..self.slots {
                        let share = (need * self.pops[[s, p, e, r, k]] / total)
                            .floor()
                            .min(self.pops[[s, p, e, r, k]]);
                        self.pops[[s, p, e, r, k]] -= share;
                        removed[[s, p, e, r, k]] += share;
                        left -= share;
                    }
                }
                while left >= 1.0 {
                    let mut took = false;
                    for s in 0..self.slots {
                        if left >= 1.0 && self.pops[[s, p, e, r, k]] > 0.0 {
                            self.pops[[s, p, e, r, k]] -= 1.0;
                            removed[[s, p, e, r, k]] += 1.0;
                            left -= 1.0;
                            took = true;
                        }
                    }
                    if !took {
                        break;
                    }
                }
            }
        }
        removed
    }

    /// Moves individuals between stages: removal on the donor columns, then
    /// re-entry on the recipient columns with the donor slot ages carried
    /// along. `links` pairs donor and recipient cohort positions; `deaths`
    /// must be zero outside the donor columns.
    pub fn transfer(&mut self, deaths: ArrayView4<'_, f64>, links: &[(usize, usize)]) {
        let ages_before = self.ages.clone();
        let removed = self.remove_tracked(deaths);
        let cell_shape = (self.dims.parcels, self.dims.stoch, self.dims.param, self.n_cstages);
        for s in 0..self.slots {
            let mut additions = Array4::zeros(cell_shape);
            let mut ages = Array4::zeros(cell_shape);
            for (p, e, r) in self.dims.cells() {
                for &(donor, recipient) in links {
                    additions[[p, e, r, recipient]] = removed[[s, p, e, r, donor]];
                    ages[[p, e, r, recipient]] = ages_before[[s, p, e, r, donor]];
                }
            }
            self.add_aged(additions.view(), ages.view());
        }
    }

    /// Signed adjustment: positive part enters at age zero, negative part
    /// leaves via [`Self::remove`].
    pub fn adjust(&mut self, delta: ArrayView4<'_, f64>) {
        let gains = delta.mapv(|v| v.max(0.0));
        let losses = delta.mapv(|v| (-v).max(0.0));
        self.add(gains.view());
        self.remove(losses.view());
    }

    /// Advances ages without evaluating maturation, for stages whose exits
    /// are not age-driven.
    pub fn age(&mut self, age_deltas: ArrayView4<'_, f64>, selected: &[usize]) {
        for (j, &k) in selected.iter().enumerate() {
            for (p, e, r) in self.dims.cells() {
                let delta = age_deltas[[p, e, r, j]];
                for s in 0..self.slots {
                    self.ages[[s, p, e, r, k]] += delta;
                }
            }
        }
    }

    /// Maturation counts at the current ages, leaving the store untouched.
    /// Same probability rule as [`Self::advance`].
    pub fn maturing(
        &self,
        age_deltas: ArrayView4<'_, f64>,
        selected: &[usize],
        cdf: impl Fn(usize, usize, f64) -> f64,
    ) -> Array4<f64> {
        let mut matured = Array4::zeros((
            self.dims.parcels,
            self.dims.stoch,
            self.dims.param,
            selected.len(),
        ));
        for (j, &k) in selected.iter().enumerate() {
            for (p, e, r) in self.dims.cells() {
                let delta = age_deltas[[p, e, r, j]];
                let mut total = 0.0;
                for s in 0..self.slots {
                    let age = self.ages[[s, p, e, r, k]];
                    let below = cdf(j, r, age);
                    let mut prob = (cdf(j, r, age + delta) - below) / (1.0 - below);
                    if prob.is_nan() {
                        prob = 1.0;
                    }
                    total += (self.pops[[s, p, e, r, k]] * prob).floor();
                }
                matured[[p, e, r, j]] = total;
            }
        }
        matured
    }

    /// Advances ages and computes maturation. `age_deltas` is laid out
    /// `[parcel, stoch, param, sel]` for the selected cohort positions;
    /// `cdf(sel, param, age)` evaluates the maturation distribution. The
    /// conditional probability `(F(a + d) - F(a)) / (1 - F(a))` turns NaN
    /// into certain maturation (the distribution is exhausted). Matured
    /// counts are floored per slot, withdrawn when `withdraw`, and returned
    /// summed over slots.
    pub fn advance(
        &mut self,
        age_deltas: ArrayView4<'_, f64>,
        selected: &[usize],
        cdf: impl Fn(usize, usize, f64) -> f64,
        withdraw: bool,
    ) -> Array4<f64> {
        let mut matured = Array4::zeros((
            self.dims.parcels,
            self.dims.stoch,
            self.dims.param,
            selected.len(),
        ));
        for (j, &k) in selected.iter().enumerate() {
            for (p, e, r) in self.dims.cells() {
                let delta = age_deltas[[p, e, r, j]];
                let mut total = 0.0;
                for s in 0..self.slots {
                    let age = self.ages[[s, p, e, r, k]];
                    let pop = self.pops[[s, p, e, r, k]];
                    let below = cdf(j, r, age);
                    let mut prob = (cdf(j, r, age + delta) - below) / (1.0 - below);
                    if prob.is_nan() {
                        prob = 1.0;
                    }
                    let count = (pop * prob).floor();
                    self.ages[[s, p, e, r, k]] += delta;
                    if withdraw {
                        self.pops[[s, p, e, r, k]] -= count;
                    }
                    total += count;
                }
                matured[[p, e, r, j]] = total;
            }
        }
        matured
    }
}
