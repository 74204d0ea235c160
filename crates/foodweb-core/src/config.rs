//! Declarative description of a food web: organisms, stages, equations,
//! coefficients, and trophic links. Everything here is inert data; the
//! [`crate::registry`] compiles it and the [`crate::coeffs`] materializer
//! resolves the numbers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::FoodWebError;

/// A coefficient as written in configuration. Scalars broadcast across
/// parametric replicates; per-replicate vectors must match the replicate
/// count; priors are sampled once per replicate at materialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CoefValue {
    /// One value shared by every parametric replicate.
    Scalar(f64),
    /// One value per parametric replicate, e.g. draws from a calibration.
    PerReplicate(Vec<f64>),
    /// A prior distribution sampled per parametric replicate.
    Prior(DistSpec),
}

impl From<f64> for CoefValue {
    fn from(value: f64) -> Self {
        Self::Scalar(value)
    }
}

impl From<Vec<f64>> for CoefValue {
    fn from(values: Vec<f64>) -> Self {
        Self::PerReplicate(values)
    }
}

impl From<DistSpec> for CoefValue {
    fn from(dist: DistSpec) -> Self {
        Self::Prior(dist)
    }
}

/// Closed vocabulary of coefficient prior distributions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistSpec {
    /// Normal with mean `mu` and standard deviation `sigma`.
    Normal { mu: f64, sigma: f64 },
    /// Triangular over `[a, a + b]` with mode `a + b * c`, `c` in `[0, 1]`.
    Triangular { a: f64, b: f64, c: f64 },
    /// Cauchy with location `u` and scale `f`.
    Cauchy { u: f64, f: f64 },
    /// Gamma with location `u`, scale `f`, and shape `a`.
    Gamma { u: f64, f: f64, a: f64 },
    /// Student-T with location `mu`, scale `sigma`, and `k` degrees of
    /// freedom.
    StudentT { mu: f64, sigma: f64, k: f64 },
}

/// Reference to a stage of some organism, used for trophic links and
/// interaction coefficients.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StageRef {
    /// Organism name.
    pub organism: String,
    /// Stage name within that organism.
    pub stage: String,
}

impl StageRef {
    /// Build a reference from anything string-like.
    pub fn new(organism: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            organism: organism.into(),
            stage: stage.into(),
        }
    }
}

/// Growth rate modifier, applied before the growth law.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrowthModifier {
    /// Plain rate: `r * dt`.
    Constant {
        /// Intrinsic growth rate per day.
        r: CoefValue,
    },
    /// Log-normal temperature response:
    /// `r * dt * exp(-0.5 * (ln(T_max / t) / p)^2)`.
    LogNormalTemp {
        /// Intrinsic growth rate per day.
        r: CoefValue,
        /// Temperature of maximal growth.
        t: CoefValue,
        /// Spread of the response curve.
        p: CoefValue,
    },
}

/// Growth law, applied to the modified rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrowthLaw {
    /// `dN = N * r`.
    Exponential,
    /// `dN = r * N * (1 - N / k)`.
    Logistic {
        /// Carrying capacity.
        k: CoefValue,
    },
    /// Logistic with prey-mediated capacity `K = sum(prey_pop * k_partner)`.
    LogisticPrey {
        /// Capacity contribution per prey stage.
        k: BTreeMap<StageRef, CoefValue>,
    },
    /// Logistic with predation-mediated capacity
    /// `K = sum(consumed * k_partner)` over this step's consumption.
    LogisticPredation {
        /// Capacity contribution per consumed prey stage.
        k: BTreeMap<StageRef, CoefValue>,
    },
    /// Pin the population at a set level: `dN = n - N`.
    Constant {
        /// Level the stage is held at.
        n: CoefValue,
    },
    /// Track an external driver series: `dN = driver - N`. No change when
    /// the series is absent from the experiment.
    ExternallyDriven,
}

impl GrowthLaw {
    /// Whether the law consumes the modified rate `r * dt`.
    #[must_use]
    pub const fn needs_rate(&self) -> bool {
        !matches!(self, Self::Constant { .. } | Self::ExternallyDriven)
    }
}

/// Growth equation of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrowthConfig {
    /// The growth law.
    pub law: GrowthLaw,
    /// Rate modifier; required by rate-driven laws, rejected otherwise.
    #[serde(default)]
    pub modifier: Option<GrowthModifier>,
}

/// Shape of a classical functional response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseForm {
    /// Linear: `a * P`.
    TypeI,
    /// Saturating: `a * P / (P + b)`.
    TypeII,
    /// Sigmoid: `a * P^2 / (P^2 + b)`.
    TypeIII,
}

/// What the response argument `P` is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreyBasis {
    /// Prey density.
    Prey,
    /// Prey-to-predator ratio `P / D`.
    Ratio,
    /// Hassell-Varley interference `P / D^m`.
    HassellVarley,
}

/// Functional-response family of a predator or parasitoid stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredationLaw {
    /// One of the classical Holling forms on a choice of basis.
    Response {
        /// Holling form.
        form: ResponseForm,
        /// Density basis for the prey argument.
        basis: PreyBasis,
    },
    /// Beddington-DeAngelis: `a * P / (b + P + c * D)`.
    BeddingtonDeAngelis,
    /// Double asymptote (Kovai): `y = a * (1 - exp(-u / (a * D)))` with
    /// `u = P + b * (exp(-P / b) - 1)`, followed by a per-capita joint
    /// correction across prey with weights `a` and capacity 1.
    DoubleAsymptote,
}

/// One prey (or host) link with its per-partner coefficients. Which of the
/// optional coefficients are required depends on the predation law.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreyEntry {
    /// The attacked stage.
    pub target: StageRef,
    /// Attack rate / saturation ceiling.
    pub a: CoefValue,
    /// Half-saturation or shape constant.
    #[serde(default)]
    pub b: Option<CoefValue>,
    /// Predator-interference weight (Beddington-DeAngelis).
    #[serde(default)]
    pub c: Option<CoefValue>,
    /// Interference exponent (Hassell-Varley).
    #[serde(default)]
    pub m: Option<CoefValue>,
}

impl PreyEntry {
    /// Link with only an attack rate; other coefficients default to absent.
    pub fn new(target: StageRef, a: impl Into<CoefValue>) -> Self {
        Self {
            target,
            a: a.into(),
            b: None,
            c: None,
            m: None,
        }
    }
}

/// Predation equation of a stage, including its prey links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredationConfig {
    /// Functional-response law shared by every link of this stage.
    pub law: PredationLaw,
    /// Attacked stages with per-partner coefficients.
    pub prey: Vec<PreyEntry>,
}

/// Mortality law of a stage. Deaths are `pop * (1 - survival)` scaled by
/// `dt`, floored, and never exceed the available population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MortalityLaw {
    /// Constant hazard `q` per day.
    ConstantHazard {
        /// Daily death fraction.
        q: CoefValue,
    },
    /// Log-normal temperature survival `exp(-0.5 * (ln(T_max / t) / p)^2)`.
    LogNormalTemp {
        /// Temperature of maximal survival.
        t: CoefValue,
        /// Spread of the response curve.
        p: CoefValue,
    },
    /// Asymptotic humidity survival `max(0, 1 - exp(-a * (H - b)))`.
    AsymptoticHumidity {
        /// Approach rate.
        a: CoefValue,
        /// Humidity threshold.
        b: CoefValue,
    },
    /// Sigmoid temperature survival `1 / (1 + exp((T_max - a) / b))`.
    SigmoidTemp {
        /// Inflection temperature.
        a: CoefValue,
        /// Inverse steepness.
        b: CoefValue,
    },
}

/// How daily degree-day accumulation integrates the diurnal curve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayDegreeMethod {
    /// Single triangle between the daily minimum and maximum.
    #[default]
    Triangular,
    /// Single sine wave between the daily minimum and maximum.
    Sine,
}

/// How temperatures above the upper development threshold are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CutoffRule {
    /// No upper threshold; accumulate everything above the lower one.
    None,
    /// Heat above the upper threshold counts as if at the threshold.
    #[default]
    Horizontal,
    /// Heat above the upper threshold is subtracted twice.
    Intermediate,
    /// No accumulation at all while above the upper threshold.
    Vertical,
}

/// Physiological age accrual law of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgingLaw {
    /// Calendar days: one unit of age per day.
    Days,
    /// Thermal time between two development thresholds.
    DegreeDays {
        /// Lower development threshold.
        min: CoefValue,
        /// Upper development threshold.
        max: CoefValue,
        /// Diurnal integration method.
        #[serde(default)]
        method: DayDegreeMethod,
        /// Upper-threshold cut-off rule.
        #[serde(default)]
        cutoff: CutoffRule,
    },
    /// Briere development rate `T * (T - t_dev_min) * sqrt(t_letal - T)`.
    Briere {
        /// Lower development temperature.
        t_dev_min: CoefValue,
        /// Lethal temperature.
        t_letal: CoefValue,
    },
    /// Nonlinear Briere `T * (T - t_dev_min) * (t_letal - T)^(1/m)`.
    BriereNonlinear {
        /// Lower development temperature.
        t_dev_min: CoefValue,
        /// Lethal temperature.
        t_letal: CoefValue,
        /// Exponent denominator.
        m: CoefValue,
    },
    /// Logan development rate
    /// `exp(rho * T) - exp(rho * t_letal - (t_letal - T) / delta)`.
    Logan {
        /// Low-temperature rate constant.
        rho: CoefValue,
        /// High-temperature decay width.
        delta: CoefValue,
        /// Lethal temperature.
        t_letal: CoefValue,
    },
}

/// Maturation-age distribution for cohort-driven transitions and
/// reproduction, evaluated as a CDF over accumulated physiological age.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeDistribution {
    /// Normal with mean `mu` and standard deviation `sigma`.
    Normal {
        /// Mean maturation age.
        mu: CoefValue,
        /// Spread.
        sigma: CoefValue,
    },
    /// Triangular over `[a, a + b]` with mode `a + b * c`.
    Triangular {
        /// Lower bound.
        a: CoefValue,
        /// Width.
        b: CoefValue,
        /// Mode position in `[0, 1]`.
        c: CoefValue,
    },
    /// Cauchy with location `u` and scale `f`.
    Cauchy {
        /// Location.
        u: CoefValue,
        /// Scale.
        f: CoefValue,
    },
    /// Gamma with location `u`, scale `f`, and shape `a`.
    Gamma {
        /// Location.
        u: CoefValue,
        /// Scale.
        f: CoefValue,
        /// Shape.
        a: CoefValue,
    },
    /// Student-T with location `mu`, scale `sigma`, `k` degrees of freedom.
    StudentT {
        /// Location.
        mu: CoefValue,
        /// Scale.
        sigma: CoefValue,
        /// Degrees of freedom.
        k: CoefValue,
    },
}

/// Transition probability law.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionProb {
    /// Memoryless: `pop * (1 - (1 - q)^dt)` individuals leave per step.
    ConstantHazard {
        /// Daily transition fraction.
        q: CoefValue,
    },
    /// Age-structured: cohorts mature when their accumulated age crosses
    /// draws from the distribution. Requires an aging law on the stage.
    AgeDistribution {
        /// Maturation-age distribution.
        dist: AgeDistribution,
    },
}

/// Transition equation of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionConfig {
    /// Probability law deciding how many individuals leave the stage.
    pub prob: TransitionProb,
    /// Linear output multiplier applied to arrivals (rounded); `None`
    /// forwards departures one-to-one.
    #[serde(default)]
    pub multiplier: Option<CoefValue>,
    /// Destination stage within the same organism. `None` removes matured
    /// individuals from the system (death by old age).
    #[serde(default)]
    pub target: Option<String>,
}

/// Reproduction probability law.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReproductionProb {
    /// Offspring in proportion to the stage population: `a * pop * dt`.
    Constant {
        /// Offspring per individual per day.
        a: CoefValue,
    },
    /// Offspring in proportion to this step's consumption:
    /// `sum(n_partner * consumed)` over prey. Requires a predation law.
    PredationLinked {
        /// Offspring per consumed individual, per prey stage.
        n: BTreeMap<StageRef, CoefValue>,
    },
    /// Pulse reproduction when cohorts cross a maturation age; matured
    /// counts stay in place and are scaled by `n`. Requires an aging law.
    AgeDistribution {
        /// Offspring per maturing individual.
        n: CoefValue,
        /// Maturation-age distribution.
        dist: AgeDistribution,
    },
}

/// Reproduction equation of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReproductionConfig {
    /// Probability law deciding how many offspring appear.
    pub prob: ReproductionProb,
    /// Stage of the same organism that receives the offspring.
    pub recipient: String,
}

/// Multiplicative demographic noise. Draws are Normal with standard
/// deviation `max(1, pop * sigma * dt)` per cell, rounded, and never drive
/// a population negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseConfig {
    /// Relative noise intensity.
    pub sigma: CoefValue,
}

/// Movement between parcels. The category is part of the vocabulary but no
/// law has an agreed functional form yet; configuring one is rejected at
/// compile time with [`FoodWebError::Unimplemented`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum MovementKind {
    /// Parcel-to-parcel dispersal.
    Dispersal,
}

/// Host window of one parasitoid-host pairing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSpec {
    /// Host organism name.
    pub organism: String,
    /// Host stages an infection may start in. Each must also appear as a
    /// prey link of the attacking stage.
    pub entry_stages: Vec<String>,
    /// Last host stage an infection survives through; the parasitoid
    /// juvenile emerges as an adult from this stage.
    pub exit_stage: String,
}

/// Parasitism wiring, declared on the attacking (adult) stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParasitismConfig {
    /// Stage of this organism that develops inside the host.
    pub juvenile_stage: String,
    /// Stage of this organism that emerging adults join.
    pub recipient_stage: String,
    /// Host organisms with their susceptibility windows.
    pub hosts: Vec<HostSpec>,
}

/// One life stage with its active equations. Absent categories are
/// inactive for the stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage name, unique within its organism.
    pub name: String,
    /// Growth equation.
    #[serde(default)]
    pub growth: Option<GrowthConfig>,
    /// Predation equation and prey links.
    #[serde(default)]
    pub predation: Option<PredationConfig>,
    /// Mortality law.
    #[serde(default)]
    pub mortality: Option<MortalityLaw>,
    /// Physiological aging law.
    #[serde(default)]
    pub aging: Option<AgingLaw>,
    /// Transition equation.
    #[serde(default)]
    pub transition: Option<TransitionConfig>,
    /// Reproduction equation.
    #[serde(default)]
    pub reproduction: Option<ReproductionConfig>,
    /// Demographic noise.
    #[serde(default)]
    pub noise: Option<NoiseConfig>,
    /// Movement law (vocabulary only, see [`MovementKind`]).
    #[serde(default)]
    pub movement: Option<MovementKind>,
    /// Parasitism wiring when this stage attacks hosts.
    #[serde(default)]
    pub parasitism: Option<ParasitismConfig>,
}

impl StageConfig {
    /// A stage with the given name and every category inactive.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            growth: None,
            predation: None,
            mortality: None,
            aging: None,
            transition: None,
            reproduction: None,
            noise: None,
            movement: None,
            parasitism: None,
        }
    }
}

/// One organism: an ordered list of life stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganismConfig {
    /// Stages in development order.
    pub stages: Vec<StageConfig>,
}

impl OrganismConfig {
    /// Position of a stage name in the declared order.
    pub(crate) fn stage_position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }
}

/// Complete food web description. Organisms are keyed by name; the map
/// ordering fixes the deterministic stage flattening order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FoodWebConfig {
    /// Organisms by name.
    pub organisms: BTreeMap<String, OrganismConfig>,
}

impl FoodWebConfig {
    /// Checks every cross-reference and per-law coefficient requirement.
    /// Compilation refuses configurations this rejects.
    pub fn validate(&self) -> Result<(), FoodWebError> {
        if self.organisms.is_empty() {
            return Err(FoodWebError::InvalidConfig(
                "a food web needs at least one organism",
            ));
        }
        for (org_name, org) in &self.organisms {
            if org_name.is_empty() {
                return Err(FoodWebError::InvalidConfig(
                    "organism names must be non-empty",
                ));
            }
            if org.stages.is_empty() {
                return Err(FoodWebError::InvalidConfig(
                    "every organism needs at least one stage",
                ));
            }
            let mut seen = Vec::with_capacity(org.stages.len());
            for stage in &org.stages {
                if stage.name.is_empty() {
                    return Err(FoodWebError::InvalidConfig(
                        "stage names must be non-empty",
                    ));
                }
                if seen.contains(&&stage.name) {
                    return Err(FoodWebError::InvalidConfig(
                        "stage names must be unique within an organism",
                    ));
                }
                seen.push(&stage.name);
            }
            for stage in &org.stages {
                self.validate_stage(org_name, org, stage)?;
            }
        }
        Ok(())
    }

    fn validate_stage(
        &self,
        org_name: &str,
        org: &OrganismConfig,
        stage: &StageConfig,
    ) -> Result<(), FoodWebError> {
        if let Some(growth) = &stage.growth {
            match (growth.law.needs_rate(), &growth.modifier) {
                (true, None) => {
                    return Err(FoodWebError::InvalidConfig(
                        "growth law requires a rate modifier",
                    ));
                }
                (false, Some(_)) => {
                    return Err(FoodWebError::InvalidConfig(
                        "growth law does not take a rate modifier",
                    ));
                }
                _ => {}
            }
            match &growth.law {
                GrowthLaw::LogisticPrey { k } | GrowthLaw::LogisticPredation { k } => {
                    for partner in k.keys() {
                        self.resolve(partner)?;
                    }
                }
                _ => {}
            }
        }
        if let Some(predation) = &stage.predation {
            if predation.prey.is_empty() {
                return Err(FoodWebError::InvalidConfig(
                    "a predation law needs at least one prey link",
                ));
            }
            for entry in &predation.prey {
                self.resolve(&entry.target)?;
                for parameter in required_prey_params(predation.law) {
                    let present = match *parameter {
                        "b" => entry.b.is_some(),
                        "c" => entry.c.is_some(),
                        "m" => entry.m.is_some(),
                        _ => true,
                    };
                    if !present {
                        return Err(FoodWebError::MissingCoefficient {
                            organism: org_name.to_owned(),
                            stage: stage.name.clone(),
                            category: "predation",
                            parameter,
                        });
                    }
                }
            }
        }
        if let Some(transition) = &stage.transition {
            if let Some(target) = &transition.target {
                resolve_in(org, org_name, target)?;
            }
            if matches!(transition.prob, TransitionProb::AgeDistribution { .. })
                && stage.aging.is_none()
            {
                return Err(FoodWebError::InvalidConfig(
                    "an age-distribution transition requires an aging law",
                ));
            }
        }
        if let Some(reproduction) = &stage.reproduction {
            resolve_in(org, org_name, &reproduction.recipient)?;
            match &reproduction.prob {
                ReproductionProb::PredationLinked { n } => {
                    if stage.predation.is_none() {
                        return Err(FoodWebError::InvalidConfig(
                            "predation-linked reproduction requires a predation law",
                        ));
                    }
                    for partner in n.keys() {
                        self.resolve(partner)?;
                    }
                }
                ReproductionProb::AgeDistribution { .. } => {
                    if stage.aging.is_none() {
                        return Err(FoodWebError::InvalidConfig(
                            "age-distribution reproduction requires an aging law",
                        ));
                    }
                }
                ReproductionProb::Constant { .. } => {}
            }
        }
        if let Some(parasitism) = &stage.parasitism {
            self.validate_parasitism(org_name, org, stage, parasitism)?;
        }
        Ok(())
    }

    fn validate_parasitism(
        &self,
        org_name: &str,
        org: &OrganismConfig,
        stage: &StageConfig,
        parasitism: &ParasitismConfig,
    ) -> Result<(), FoodWebError> {
        resolve_in(org, org_name, &parasitism.juvenile_stage)?;
        resolve_in(org, org_name, &parasitism.recipient_stage)?;
        if parasitism.hosts.is_empty() {
            return Err(FoodWebError::InvalidConfig(
                "a parasitism block needs at least one host",
            ));
        }
        let prey = stage
            .predation
            .as_ref()
            .ok_or(FoodWebError::InvalidConfig(
                "a parasitoid attack stage needs a predation law",
            ))?;
        for host in &parasitism.hosts {
            if host.organism == org_name {
                return Err(FoodWebError::InvalidConfig(
                    "an organism cannot parasitize itself",
                ));
            }
            let host_org = self
                .organisms
                .get(&host.organism)
                .ok_or_else(|| FoodWebError::UnknownOrganism(host.organism.clone()))?;
            if host.entry_stages.is_empty() {
                return Err(FoodWebError::InvalidConfig(
                    "a host window needs at least one entry stage",
                ));
            }
            let exit = resolve_in(host_org, &host.organism, &host.exit_stage)?;
            for entry in &host.entry_stages {
                let pos = resolve_in(host_org, &host.organism, entry)?;
                if pos > exit {
                    return Err(FoodWebError::InvalidConfig(
                        "host entry stages must not come after the exit stage",
                    ));
                }
                let linked = prey.prey.iter().any(|p| {
                    p.target.organism == host.organism && p.target.stage == *entry
                });
                if !linked {
                    return Err(FoodWebError::InvalidConfig(
                        "every host entry stage needs a matching prey link",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Resolves a stage reference, erroring on dangling names.
    pub(crate) fn resolve(&self, reference: &StageRef) -> Result<(), FoodWebError> {
        let org = self
            .organisms
            .get(&reference.organism)
            .ok_or_else(|| FoodWebError::UnknownOrganism(reference.organism.clone()))?;
        resolve_in(org, &reference.organism, &reference.stage).map(|_| ())
    }
}

/// Position of a stage name within one organism.
fn resolve_in(org: &OrganismConfig, org_name: &str, stage: &str) -> Result<usize, FoodWebError> {
    org.stage_position(stage).ok_or_else(|| FoodWebError::UnknownStage {
        organism: org_name.to_owned(),
        stage: stage.to_owned(),
    })
}

/// Per-prey coefficients each predation law requires beyond `a`.
const fn required_prey_params(law: PredationLaw) -> &'static [&'static str] {
    match law {
        PredationLaw::Response {
            form: ResponseForm::TypeI,
            basis: PreyBasis::Prey | PreyBasis::Ratio,
        } => &[],
        PredationLaw::Response {
            form: ResponseForm::TypeI,
            basis: PreyBasis::HassellVarley,
        } => &["m"],
        PredationLaw::Response {
            form: ResponseForm::TypeII | ResponseForm::TypeIII,
            basis: PreyBasis::Prey | PreyBasis::Ratio,
        } => &["b"],
        PredationLaw::Response {
            form: ResponseForm::TypeII | ResponseForm::TypeIII,
            basis: PreyBasis::HassellVarley,
        } => &["b", "m"],
        PredationLaw::BeddingtonDeAngelis => &["b", "c"],
        PredationLaw::DoubleAsymptote => &["b"],
    }
}
