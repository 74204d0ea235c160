//! Coefficient materialization: every [`CoefValue`] in the compiled web is
//! resolved into one value per parametric replicate. Scalars broadcast,
//! per-replicate vectors are length-checked, priors are sampled once at
//! build time. The sampling order is fixed (stage index ascending, category
//! order within a stage), so a seeded RNG reproduces the same draws.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2};
use rand::Rng;
use rand_distr::Distribution;
use statrs::distribution::{Cauchy, ContinuousCDF, Gamma, Normal, StudentsT, Triangular};

use crate::FoodWebError;
use crate::config::{
    AgeDistribution, AgingLaw, CoefValue, CutoffRule, DayDegreeMethod, DistSpec, GrowthConfig,
    GrowthLaw, GrowthModifier, MortalityLaw, PredationConfig, PredationLaw, PreyBasis,
    ReproductionConfig, ReproductionProb, ResponseForm, StageRef, TransitionConfig, TransitionProb,
};
use crate::registry::FoodWeb;

/// One coefficient resolved per parametric replicate.
pub(crate) type Param = Array1<f64>;

/// Growth coefficients of one stage.
#[derive(Debug, Clone)]
pub(crate) struct GrowthTable {
    pub(crate) law: GrowthLawCoefs,
    pub(crate) rate: Option<RateCoefs>,
}

#[derive(Debug, Clone)]
pub(crate) enum GrowthLawCoefs {
    Exponential,
    Logistic { k: Param },
    LogisticPrey { partners: Vec<(usize, Param)> },
    LogisticPredation { partners: Vec<(usize, Param)> },
    Constant { n: Param },
    ExternallyDriven,
}

#[derive(Debug, Clone)]
pub(crate) enum RateCoefs {
    Constant { r: Param },
    LogNormalTemp { r: Param, t: Param, p: Param },
}

/// Attack coefficients of one predator or parasitoid stage. Victim columns
/// cover the configured prey stages plus, for attackers that are not
/// parasitoids themselves, the ghost stages shadowing each prey; ghost
/// columns share the prey entry's coefficients. `sources[j]` is the
/// configured prey stage column `j` derives from.
#[derive(Debug, Clone)]
pub(crate) struct AttackTable {
    pub(crate) attacker: usize,
    pub(crate) victims: Vec<usize>,
    pub(crate) sources: Vec<usize>,
    /// Attack rate, `[param, victim]`.
    pub(crate) a: Array2<f64>,
    pub(crate) law: AttackLawCoefs,
}

#[derive(Debug, Clone)]
pub(crate) enum AttackLawCoefs {
    Response {
        form: ResponseFormCoefs,
        basis: BasisCoefs,
    },
    BeddingtonDeAngelis {
        b: Array2<f64>,
        c: Array2<f64>,
    },
    DoubleAsymptote {
        b: Array2<f64>,
    },
}

#[derive(Debug, Clone)]
pub(crate) enum ResponseFormCoefs {
    TypeI,
    TypeII { b: Array2<f64> },
    TypeIII { b: Array2<f64> },
}

#[derive(Debug, Clone)]
pub(crate) enum BasisCoefs {
    Prey,
    Ratio,
    HassellVarley { m: Array2<f64> },
}

#[derive(Debug, Clone)]
pub(crate) enum MortalityCoefs {
    ConstantHazard { q: Param },
    LogNormalTemp { t: Param, p: Param },
    AsymptoticHumidity { a: Param, b: Param },
    SigmoidTemp { a: Param, b: Param },
}

#[derive(Debug, Clone)]
pub(crate) enum AgingCoefs {
    Days,
    DegreeDays {
        min: Param,
        max: Param,
        method: DayDegreeMethod,
        cutoff: CutoffRule,
    },
    Briere {
        t_dev_min: Param,
        t_letal: Param,
    },
    BriereNonlinear {
        t_dev_min: Param,
        t_letal: Param,
        m: Param,
    },
    Logan {
        rho: Param,
        delta: Param,
        t_letal: Param,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct TransitionCoefs {
    pub(crate) prob: TransitionProbCoefs,
    pub(crate) multiplier: Option<Param>,
}

#[derive(Debug, Clone)]
pub(crate) enum TransitionProbCoefs {
    ConstantHazard { q: Param },
    AgeDistribution { cdfs: Vec<MaturationCdf> },
}

#[derive(Debug, Clone)]
pub(crate) enum ReproductionCoefs {
    Constant { a: Param },
    PredationLinked { n: Vec<(usize, Param)> },
    AgeDistribution { n: Param, cdfs: Vec<MaturationCdf> },
}

/// Maturation-age CDF of one parametric replicate, backed by `statrs`.
#[derive(Debug, Clone)]
pub(crate) enum MaturationCdf {
    Normal(Normal),
    Triangular(Triangular),
    Cauchy(Cauchy),
    Gamma { shift: f64, inner: Gamma },
    StudentT(StudentsT),
}

impl MaturationCdf {
    pub(crate) fn cdf(&self, x: f64) -> f64 {
        match self {
            Self::Normal(d) => d.cdf(x),
            Self::Triangular(d) => d.cdf(x),
            Self::Cauchy(d) => d.cdf(x),
            Self::Gamma { shift, inner } => {
                if x <= *shift {
                    0.0
                } else {
                    inner.cdf(x - shift)
                }
            }
            Self::StudentT(d) => d.cdf(x),
        }
    }
}

/// Every coefficient of a compiled web resolved for a fixed number of
/// parametric replicates. Built once per run; the kernel reads it as plain
/// arrays.
#[derive(Debug, Clone)]
pub struct MaterializedCoefs {
    n_param: usize,
    growth: Vec<Option<GrowthTable>>,
    attacks: Vec<AttackTable>,
    mortality: Vec<Option<MortalityCoefs>>,
    aging: Vec<Option<AgingCoefs>>,
    transition: Vec<Option<TransitionCoefs>>,
    reproduction: Vec<Option<ReproductionCoefs>>,
    noise: Vec<Option<Param>>,
}

impl MaterializedCoefs {
    /// Resolves every coefficient of `web` for `n_param` parametric
    /// replicates, drawing priors from `rng`.
    pub fn build(
        web: &FoodWeb,
        n_param: usize,
        rng: &mut impl Rng,
    ) -> Result<Self, FoodWebError> {
        let mut mat = Materializer { n_param, rng };
        let n = web.n_stages();
        let mut growth = Vec::with_capacity(n);
        let mut attacks = Vec::new();
        let mut mortality = Vec::with_capacity(n);
        let mut aging = Vec::with_capacity(n);
        let mut transition = Vec::with_capacity(n);
        let mut reproduction = Vec::with_capacity(n);
        let mut noise = Vec::with_capacity(n);
        for idx in 0..n {
            let meta = web.stage(idx);
            let at = Ctx {
                organism: &meta.organism,
                stage: &meta.name,
            };
            let eqs = web.eqs(idx);
            growth.push(match &eqs.growth {
                Some(cfg) => Some(mat.growth(&at, web, cfg)?),
                None => None,
            });
            if let Some(cfg) = &eqs.predation {
                attacks.push(mat.attack(&at, web, idx, cfg)?);
            }
            mortality.push(match &eqs.mortality {
                Some(cfg) => Some(mat.mortality(&at, cfg)?),
                None => None,
            });
            aging.push(match &eqs.aging {
                Some(cfg) => Some(mat.aging(&at, cfg)?),
                None => None,
            });
            transition.push(match &eqs.transition {
                Some(cfg) => Some(mat.transition(&at, cfg)?),
                None => None,
            });
            reproduction.push(match &eqs.reproduction {
                Some(cfg) => Some(mat.reproduction(&at, web, cfg)?),
                None => None,
            });
            noise.push(match &eqs.noise {
                Some(cfg) => Some(mat.param(&at, "sigma", &cfg.sigma)?),
                None => None,
            });
        }
        Ok(Self {
            n_param,
            growth,
            attacks,
            mortality,
            aging,
            transition,
            reproduction,
            noise,
        })
    }

    /// Number of parametric replicates the tables were resolved for.
    #[must_use]
    pub const fn n_param(&self) -> usize {
        self.n_param
    }

    /// Number of stages the tables were resolved for, ghosts included.
    #[must_use]
    pub fn n_stages(&self) -> usize {
        self.growth.len()
    }

    pub(crate) fn growth(&self, idx: usize) -> Option<&GrowthTable> {
        self.growth[idx].as_ref()
    }

    /// Attack tables in ascending attacker order.
    pub(crate) fn attacks(&self) -> &[AttackTable] {
        &self.attacks
    }

    pub(crate) fn attack_of(&self, attacker: usize) -> Option<&AttackTable> {
        self.attacks.iter().find(|t| t.attacker == attacker)
    }

    pub(crate) fn mortality(&self, idx: usize) -> Option<&MortalityCoefs> {
        self.mortality[idx].as_ref()
    }

    pub(crate) fn aging(&self, idx: usize) -> Option<&AgingCoefs> {
        self.aging[idx].as_ref()
    }

    pub(crate) fn transition(&self, idx: usize) -> Option<&TransitionCoefs> {
        self.transition[idx].as_ref()
    }

    pub(crate) fn reproduction(&self, idx: usize) -> Option<&ReproductionCoefs> {
        self.reproduction[idx].as_ref()
    }

    pub(crate) fn noise(&self, idx: usize) -> Option<&Param> {
        self.noise[idx].as_ref()
    }
}

/// Error context while materializing one stage.
struct Ctx<'a> {
    organism: &'a str,
    stage: &'a str,
}

impl Ctx<'_> {
    fn replicate_mismatch(&self, parameter: &'static str, got: usize, expected: usize) -> FoodWebError {
        FoodWebError::ReplicateMismatch {
            organism: self.organism.to_owned(),
            stage: self.stage.to_owned(),
            parameter,
            got,
            expected,
        }
    }

    fn invalid_dist(&self, parameter: &'static str, reason: &'static str) -> FoodWebError {
        FoodWebError::InvalidDistribution {
            organism: self.organism.to_owned(),
            stage: self.stage.to_owned(),
            parameter,
            reason,
        }
    }

    fn missing(&self, category: &'static str, parameter: &'static str) -> FoodWebError {
        FoodWebError::MissingCoefficient {
            organism: self.organism.to_owned(),
            stage: self.stage.to_owned(),
            category,
            parameter,
        }
    }
}

struct Materializer<'r, R> {
    n_param: usize,
    rng: &'r mut R,
}

impl<R: Rng> Materializer<'_, R> {
    fn param(
        &mut self,
        at: &Ctx<'_>,
        name: &'static str,
        coef: &CoefValue,
    ) -> Result<Param, FoodWebError> {
        match coef {
            CoefValue::Scalar(v) => Ok(Array1::from_elem(self.n_param, *v)),
            CoefValue::PerReplicate(values) => {
                if values.len() != self.n_param {
                    return Err(at.replicate_mismatch(name, values.len(), self.n_param));
                }
                Ok(Array1::from_vec(values.clone()))
            }
            CoefValue::Prior(dist) => self.sample(at, name, *dist),
        }
    }

    fn sample(
        &mut self,
        at: &Ctx<'_>,
        name: &'static str,
        dist: DistSpec,
    ) -> Result<Param, FoodWebError> {
        let n = self.n_param;
        match dist {
            DistSpec::Normal { mu, sigma } => {
                let d = rand_distr::Normal::new(mu, sigma)
                    .map_err(|_| at.invalid_dist(name, "sigma must be finite and non-negative"))?;
                Ok((0..n).map(|_| d.sample(self.rng)).collect())
            }
            DistSpec::Triangular { a, b, c } => {
                let d = rand_distr::Triangular::new(a, a + b, a + b * c)
                    .map_err(|_| {
                        at.invalid_dist(name, "width must be positive with the mode inside")
                    })?;
                Ok((0..n).map(|_| d.sample(self.rng)).collect())
            }
            DistSpec::Cauchy { u, f } => {
                let d = rand_distr::Cauchy::new(u, f)
                    .map_err(|_| at.invalid_dist(name, "scale must be positive"))?;
                Ok((0..n).map(|_| d.sample(self.rng)).collect())
            }
            DistSpec::Gamma { u, f, a } => {
                let d = rand_distr::Gamma::new(a, f)
                    .map_err(|_| at.invalid_dist(name, "shape and scale must be positive"))?;
                Ok((0..n).map(|_| u + d.sample(self.rng)).collect())
            }
            DistSpec::StudentT { mu, sigma, k } => {
                let d = rand_distr::StudentT::new(k)
                    .map_err(|_| at.invalid_dist(name, "degrees of freedom must be positive"))?;
                Ok((0..n).map(|_| mu + sigma * d.sample(self.rng)).collect())
            }
        }
    }

    fn growth(
        &mut self,
        at: &Ctx<'_>,
        web: &FoodWeb,
        cfg: &GrowthConfig,
    ) -> Result<GrowthTable, FoodWebError> {
        let rate = match &cfg.modifier {
            None => None,
            Some(GrowthModifier::Constant { r }) => Some(RateCoefs::Constant {
                r: self.param(at, "r", r)?,
            }),
            Some(GrowthModifier::LogNormalTemp { r, t, p }) => Some(RateCoefs::LogNormalTemp {
                r: self.param(at, "r", r)?,
                t: self.param(at, "t", t)?,
                p: self.param(at, "p", p)?,
            }),
        };
        let law = match &cfg.law {
            GrowthLaw::Exponential => GrowthLawCoefs::Exponential,
            GrowthLaw::Logistic { k } => GrowthLawCoefs::Logistic {
                k: self.param(at, "k", k)?,
            },
            GrowthLaw::LogisticPrey { k } => GrowthLawCoefs::LogisticPrey {
                partners: self.partners(at, web, "k", k)?,
            },
            GrowthLaw::LogisticPredation { k } => GrowthLawCoefs::LogisticPredation {
                partners: self.partners(at, web, "k", k)?,
            },
            GrowthLaw::Constant { n } => GrowthLawCoefs::Constant {
                n: self.param(at, "n", n)?,
            },
            GrowthLaw::ExternallyDriven => GrowthLawCoefs::ExternallyDriven,
        };
        Ok(GrowthTable { law, rate })
    }

    fn partners(
        &mut self,
        at: &Ctx<'_>,
        web: &FoodWeb,
        name: &'static str,
        map: &BTreeMap<StageRef, CoefValue>,
    ) -> Result<Vec<(usize, Param)>, FoodWebError> {
        // A parasitized partner still counts: its ghost columns carry the
        // host's coefficient. Parasitoid subjects see only the bare host.
        let fan_out = !web.is_parasitoid_organism(at.organism);
        let mut out = Vec::new();
        for (partner, coef) in map {
            let idx = resolve(web, partner)?;
            let value = self.param(at, name, coef)?;
            let mut columns = vec![idx];
            if fan_out {
                columns.extend_from_slice(web.ghosts_of_host(idx));
            }
            for &column in &columns {
                out.push((column, value.clone()));
            }
        }
        Ok(out)
    }

    fn attack(
        &mut self,
        at: &Ctx<'_>,
        web: &FoodWeb,
        attacker: usize,
        cfg: &PredationConfig,
    ) -> Result<AttackTable, FoodWebError> {
        // Ghost individuals look like their host to an outside predator,
        // but a parasitoid never attacks an already parasitized host.
        let fan_out = !web.is_parasitoid_organism(&web.stage(attacker).organism);
        let mut victims = Vec::new();
        let mut sources = Vec::new();
        let mut a_cols: Vec<Param> = Vec::new();
        let mut b_cols: Vec<Option<Param>> = Vec::new();
        let mut c_cols: Vec<Option<Param>> = Vec::new();
        let mut m_cols: Vec<Option<Param>> = Vec::new();
        for entry in &cfg.prey {
            let target = resolve(web, &entry.target)?;
            let a = self.param(at, "a", &entry.a)?;
            let b = match &entry.b {
                Some(v) => Some(self.param(at, "b", v)?),
                None => None,
            };
            let c = match &entry.c {
                Some(v) => Some(self.param(at, "c", v)?),
                None => None,
            };
            let m = match &entry.m {
                Some(v) => Some(self.param(at, "m", v)?),
                None => None,
            };
            let mut columns = vec![target];
            if fan_out {
                columns.extend_from_slice(web.ghosts_of_host(target));
            }
            for &column in &columns {
                victims.push(column);
                sources.push(target);
                a_cols.push(a.clone());
                b_cols.push(b.clone());
                c_cols.push(c.clone());
                m_cols.push(m.clone());
            }
        }
        let a = stack(self.n_param, &a_cols);
        let law = match cfg.law {
            PredationLaw::Response { form, basis } => {
                let form = match form {
                    ResponseForm::TypeI => ResponseFormCoefs::TypeI,
                    ResponseForm::TypeII => ResponseFormCoefs::TypeII {
                        b: required(at, self.n_param, "b", &b_cols)?,
                    },
                    ResponseForm::TypeIII => ResponseFormCoefs::TypeIII {
                        b: required(at, self.n_param, "b", &b_cols)?,
                    },
                };
                let basis = match basis {
                    PreyBasis::Prey => BasisCoefs::Prey,
                    PreyBasis::Ratio => BasisCoefs::Ratio,
                    PreyBasis::HassellVarley => BasisCoefs::HassellVarley {
                        m: required(at, self.n_param, "m", &m_cols)?,
                    },
                };
                AttackLawCoefs::Response { form, basis }
            }
            PredationLaw::BeddingtonDeAngelis => AttackLawCoefs::BeddingtonDeAngelis {
                b: required(at, self.n_param, "b", &b_cols)?,
                c: required(at, self.n_param, "c", &c_cols)?,
            },
            PredationLaw::DoubleAsymptote => AttackLawCoefs::DoubleAsymptote {
                b: required(at, self.n_param, "b", &b_cols)?,
            },
        };
        Ok(AttackTable {
            attacker,
            victims,
            sources,
            a,
            law,
        })
    }

    fn mortality(
        &mut self,
        at: &Ctx<'_>,
        cfg: &MortalityLaw,
    ) -> Result<MortalityCoefs, FoodWebError> {
        Ok(match cfg {
            MortalityLaw::ConstantHazard { q } => MortalityCoefs::ConstantHazard {
                q: self.param(at, "q", q)?,
            },
            MortalityLaw::LogNormalTemp { t, p } => MortalityCoefs::LogNormalTemp {
                t: self.param(at, "t", t)?,
                p: self.param(at, "p", p)?,
            },
            MortalityLaw::AsymptoticHumidity { a, b } => MortalityCoefs::AsymptoticHumidity {
                a: self.param(at, "a", a)?,
                b: self.param(at, "b", b)?,
            },
            MortalityLaw::SigmoidTemp { a, b } => MortalityCoefs::SigmoidTemp {
                a: self.param(at, "a", a)?,
                b: self.param(at, "b", b)?,
            },
        })
    }

    fn aging(&mut self, at: &Ctx<'_>, cfg: &AgingLaw) -> Result<AgingCoefs, FoodWebError> {
        Ok(match cfg {
            AgingLaw::Days => AgingCoefs::Days,
            AgingLaw::DegreeDays {
                min,
                max,
                method,
                cutoff,
            } => AgingCoefs::DegreeDays {
                min: self.param(at, "min", min)?,
                max: self.param(at, "max", max)?,
                method: *method,
                cutoff: *cutoff,
            },
            AgingLaw::Briere { t_dev_min, t_letal } => AgingCoefs::Briere {
                t_dev_min: self.param(at, "t_dev_min", t_dev_min)?,
                t_letal: self.param(at, "t_letal", t_letal)?,
            },
            AgingLaw::BriereNonlinear {
                t_dev_min,
                t_letal,
                m,
            } => AgingCoefs::BriereNonlinear {
                t_dev_min: self.param(at, "t_dev_min", t_dev_min)?,
                t_letal: self.param(at, "t_letal", t_letal)?,
                m: self.param(at, "m", m)?,
            },
            AgingLaw::Logan {
                rho,
                delta,
                t_letal,
            } => AgingCoefs::Logan {
                rho: self.param(at, "rho", rho)?,
                delta: self.param(at, "delta", delta)?,
                t_letal: self.param(at, "t_letal", t_letal)?,
            },
        })
    }

    fn transition(
        &mut self,
        at: &Ctx<'_>,
        cfg: &TransitionConfig,
    ) -> Result<TransitionCoefs, FoodWebError> {
        let prob = match &cfg.prob {
            TransitionProb::ConstantHazard { q } => TransitionProbCoefs::ConstantHazard {
                q: self.param(at, "q", q)?,
            },
            TransitionProb::AgeDistribution { dist } => TransitionProbCoefs::AgeDistribution {
                cdfs: self.maturation(at, dist)?,
            },
        };
        let multiplier = match &cfg.multiplier {
            Some(v) => Some(self.param(at, "multiplier", v)?),
            None => None,
        };
        Ok(TransitionCoefs { prob, multiplier })
    }

    fn reproduction(
        &mut self,
        at: &Ctx<'_>,
        web: &FoodWeb,
        cfg: &ReproductionConfig,
    ) -> Result<ReproductionCoefs, FoodWebError> {
        Ok(match &cfg.prob {
            ReproductionProb::Constant { a } => ReproductionCoefs::Constant {
                a: self.param(at, "a", a)?,
            },
            ReproductionProb::PredationLinked { n } => ReproductionCoefs::PredationLinked {
                n: self.partners(at, web, "n", n)?,
            },
            ReproductionProb::AgeDistribution { n, dist } => ReproductionCoefs::AgeDistribution {
                n: self.param(at, "n", n)?,
                cdfs: self.maturation(at, dist)?,
            },
        })
    }

    /// One maturation CDF per parametric replicate.
    fn maturation(
        &mut self,
        at: &Ctx<'_>,
        dist: &AgeDistribution,
    ) -> Result<Vec<MaturationCdf>, FoodWebError> {
        match dist {
            AgeDistribution::Normal { mu, sigma } => {
                let mu = self.param(at, "mu", mu)?;
                let sigma = self.param(at, "sigma", sigma)?;
                (0..self.n_param)
                    .map(|r| {
                        Normal::new(mu[r], sigma[r])
                            .map(MaturationCdf::Normal)
                            .map_err(|_| at.invalid_dist("sigma", "must be positive and finite"))
                    })
                    .collect()
            }
            AgeDistribution::Triangular { a, b, c } => {
                let a = self.param(at, "a", a)?;
                let b = self.param(at, "b", b)?;
                let c = self.param(at, "c", c)?;
                (0..self.n_param)
                    .map(|r| {
                        Triangular::new(a[r], a[r] + b[r], a[r] + b[r] * c[r])
                            .map(MaturationCdf::Triangular)
                            .map_err(|_| {
                                at.invalid_dist("b", "width must be positive with the mode inside")
                            })
                    })
                    .collect()
            }
            AgeDistribution::Cauchy { u, f } => {
                let u = self.param(at, "u", u)?;
                let f = self.param(at, "f", f)?;
                (0..self.n_param)
                    .map(|r| {
                        Cauchy::new(u[r], f[r])
                            .map(MaturationCdf::Cauchy)
                            .map_err(|_| at.invalid_dist("f", "scale must be positive"))
                    })
                    .collect()
            }
            AgeDistribution::Gamma { u, f, a } => {
                let u = self.param(at, "u", u)?;
                let f = self.param(at, "f", f)?;
                let a = self.param(at, "a", a)?;
                (0..self.n_param)
                    .map(|r| {
                        Gamma::new(a[r], 1.0 / f[r])
                            .map(|inner| MaturationCdf::Gamma {
                                shift: u[r],
                                inner,
                            })
                            .map_err(|_| {
                                at.invalid_dist("a", "shape and scale must be positive")
                            })
                    })
                    .collect()
            }
            AgeDistribution::StudentT { mu, sigma, k } => {
                let mu = self.param(at, "mu", mu)?;
                let sigma = self.param(at, "sigma", sigma)?;
                let k = self.param(at, "k", k)?;
                (0..self.n_param)
                    .map(|r| {
                        StudentsT::new(mu[r], sigma[r], k[r])
                            .map(MaturationCdf::StudentT)
                            .map_err(|_| {
                                at.invalid_dist("k", "scale and degrees of freedom must be positive")
                            })
                    })
                    .collect()
            }
        }
    }
}

/// Flattened index of a configured stage reference.
fn resolve(web: &FoodWeb, reference: &StageRef) -> Result<usize, FoodWebError> {
    web.stage_index(&reference.organism, &reference.stage)
        .ok_or_else(|| FoodWebError::UnknownStage {
            organism: reference.organism.clone(),
            stage: reference.stage.clone(),
        })
}

fn stack(n_param: usize, cols: &[Param]) -> Array2<f64> {
    let mut out = Array2::zeros((n_param, cols.len()));
    for (j, col) in cols.iter().enumerate() {
        out.column_mut(j).assign(col);
    }
    out
}

fn required(
    at: &Ctx<'_>,
    n_param: usize,
    parameter: &'static str,
    cols: &[Option<Param>],
) -> Result<Array2<f64>, FoodWebError> {
    let mut out = Array2::zeros((n_param, cols.len()));
    for (j, col) in cols.iter().enumerate() {
        let col = col
            .as_ref()
            .ok_or_else(|| at.missing("predation", parameter))?;
        out.column_mut(j).assign(col);
    }
    Ok(out)
}
