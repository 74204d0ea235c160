//! Compiled form of a [`FoodWebConfig`]: the flattened stage index space,
//! parasitism ghost chains, successor maps, equation activation, and driver
//! requirements. Everything downstream (materializer, kernel, simulation)
//! works against this registry, never against raw configuration.

use std::collections::{BTreeMap, BTreeSet};

use crate::FoodWebError;
use crate::config::{
    AgingLaw, FoodWebConfig, GrowthConfig, GrowthLaw, GrowthModifier, MortalityLaw, NoiseConfig,
    PredationConfig, ReproductionConfig, StageConfig, TransitionConfig,
};

/// One entry of the flattened stage list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageMeta {
    /// Owning organism. Ghost stages belong to the parasitoid, not the host.
    pub organism: String,
    /// Stage name; ghosts get a synthetic one.
    pub name: String,
    /// Ghost bookkeeping, `None` for configured stages.
    pub ghost: Option<GhostMeta>,
}

impl StageMeta {
    /// Whether this is a synthetic parasitized-host stage.
    #[must_use]
    pub const fn is_ghost(&self) -> bool {
        self.ghost.is_some()
    }
}

/// Where a ghost stage came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GhostMeta {
    /// Host organism name.
    pub host_organism: String,
    /// Flattened index of the host stage this ghost shadows.
    pub host_stage: usize,
    /// Flattened index of the attacking parasitoid stage.
    pub attack_stage: usize,
}

/// One parasitoid attack stage with its resolved wiring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParasitoidMeta {
    /// Attacking (adult) stage index.
    pub attack_stage: usize,
    /// Juvenile stage index; its transition and aging live on the ghost
    /// chain instead.
    pub juvenile: usize,
    /// Stage emerging adults join.
    pub recipient: usize,
    /// Every ghost stage of this parasitoid, in creation order.
    pub ghosts: Vec<usize>,
}

/// One (attacker, host entry stage) infection route. Predation flows along
/// these links move individuals into the ghost stage instead of killing
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfectionLink {
    /// Attacking parasitoid stage index.
    pub attacker: usize,
    /// Host stage the infection starts in.
    pub entry: usize,
    /// Ghost stage infected individuals move to.
    pub ghost: usize,
}

/// External driver series an active equation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DriverRequirement {
    /// Daily maximum temperature.
    MaxTemperature,
    /// Daily minimum temperature.
    MinTemperature,
    /// Daily mean temperature.
    MeanTemperature,
    /// Relative humidity.
    RelativeHumidity,
    /// Externally driven population series for one stage.
    StagePopulation(usize),
}

/// Equations in force for one flattened stage, after ghost substitution and
/// deactivation. Ghost stages carry the host's equations except where the
/// chain overrides them; parasitoid juveniles lose transition and aging.
#[derive(Debug, Clone, Default)]
pub(crate) struct StageEquations {
    pub(crate) growth: Option<GrowthConfig>,
    pub(crate) predation: Option<PredationConfig>,
    pub(crate) mortality: Option<MortalityLaw>,
    pub(crate) aging: Option<AgingLaw>,
    pub(crate) transition: Option<TransitionConfig>,
    pub(crate) reproduction: Option<ReproductionConfig>,
    pub(crate) noise: Option<NoiseConfig>,
}

impl StageEquations {
    fn from_stage(stage: &StageConfig) -> Self {
        Self {
            growth: stage.growth.clone(),
            predation: stage.predation.clone(),
            mortality: stage.mortality.clone(),
            aging: stage.aging.clone(),
            transition: stage.transition.clone(),
            reproduction: stage.reproduction.clone(),
            noise: stage.noise.clone(),
        }
    }
}

/// A compiled food web. Rebuilt from scratch by [`FoodWeb::compile`]; no
/// incremental mutation.
#[derive(Debug, Clone)]
pub struct FoodWeb {
    config: FoodWebConfig,
    stages: Vec<StageMeta>,
    eqs: Vec<StageEquations>,
    n_base: usize,
    index: BTreeMap<String, BTreeMap<String, usize>>,
    transition_target: Vec<Option<usize>>,
    reproduction_target: Vec<Option<usize>>,
    cohort_stages: Vec<usize>,
    cohort_pos: Vec<Option<usize>>,
    parasitoids: Vec<ParasitoidMeta>,
    infection_links: Vec<InfectionLink>,
    ghosts_of_host: BTreeMap<usize, Vec<usize>>,
    parasitoid_organisms: BTreeSet<String>,
}

impl FoodWeb {
    /// Validates and compiles a configuration. Organisms flatten in sorted
    /// name order, stages in declared order, ghosts appended in creation
    /// order; the result is deterministic for a given configuration.
    pub fn compile(config: &FoodWebConfig) -> Result<Self, FoodWebError> {
        config.validate()?;
        for org in config.organisms.values() {
            for stage in &org.stages {
                if stage.movement.is_some() {
                    return Err(FoodWebError::Unimplemented("movement"));
                }
            }
        }

        let mut stages = Vec::new();
        let mut eqs: Vec<StageEquations> = Vec::new();
        let mut index: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
        for (org_name, org) in &config.organisms {
            let names = index.entry(org_name.clone()).or_default();
            for stage in &org.stages {
                names.insert(stage.name.clone(), stages.len());
                stages.push(StageMeta {
                    organism: org_name.clone(),
                    name: stage.name.clone(),
                    ghost: None,
                });
                eqs.push(StageEquations::from_stage(stage));
            }
        }
        let n_base = stages.len();

        let lookup = |index: &BTreeMap<String, BTreeMap<String, usize>>,
                      org: &str,
                      stage: &str|
         -> Result<usize, FoodWebError> {
            index
                .get(org)
                .and_then(|names| names.get(stage).copied())
                .ok_or_else(|| FoodWebError::UnknownStage {
                    organism: org.to_owned(),
                    stage: stage.to_owned(),
                })
        };

        // Base successor maps before any ghost exists.
        let mut transition_target: Vec<Option<usize>> = vec![None; n_base];
        let mut reproduction_target: Vec<Option<usize>> = vec![None; n_base];
        for idx in 0..n_base {
            let organism = stages[idx].organism.clone();
            if let Some(transition) = &eqs[idx].transition
                && let Some(target) = &transition.target
            {
                transition_target[idx] = Some(lookup(&index, &organism, target)?);
            }
            if let Some(reproduction) = &eqs[idx].reproduction {
                reproduction_target[idx] =
                    Some(lookup(&index, &organism, &reproduction.recipient)?);
            }
        }

        // Ghost chains: one ghost per (attack stage, host, window stage),
        // appended right after the base stages in flattening order.
        let mut parasitoids = Vec::new();
        let mut infection_links = Vec::new();
        let mut ghosts_of_host: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        let mut parasitoid_organisms = BTreeSet::new();
        for (organism, org_cfg) in &config.organisms {
            for stage_cfg in &org_cfg.stages {
                let Some(parasitism) = &stage_cfg.parasitism else {
                    continue;
                };
                parasitoid_organisms.insert(organism.clone());
                let attack_stage = lookup(&index, organism, &stage_cfg.name)?;
                let juvenile = lookup(&index, organism, &parasitism.juvenile_stage)?;
                let recipient = lookup(&index, organism, &parasitism.recipient_stage)?;
                let juvenile_cfg = org_cfg
                    .stage_position(&parasitism.juvenile_stage)
                    .map(|pos| &org_cfg.stages[pos])
                    .ok_or_else(|| FoodWebError::UnknownStage {
                        organism: organism.clone(),
                        stage: parasitism.juvenile_stage.clone(),
                    })?;

                let mut ghosts = Vec::new();
                for host in &parasitism.hosts {
                    let host_org = config
                        .organisms
                        .get(&host.organism)
                        .ok_or_else(|| FoodWebError::UnknownOrganism(host.organism.clone()))?;
                    let entry_positions: Vec<usize> = host
                        .entry_stages
                        .iter()
                        .map(|name| {
                            host_org.stage_position(name).ok_or_else(|| {
                                FoodWebError::UnknownStage {
                                    organism: host.organism.clone(),
                                    stage: name.clone(),
                                }
                            })
                        })
                        .collect::<Result<_, _>>()?;
                    let first = entry_positions.iter().copied().min().ok_or(
                        FoodWebError::InvalidConfig(
                            "a host window needs at least one entry stage",
                        ),
                    )?;
                    let exit = host_org.stage_position(&host.exit_stage).ok_or_else(|| {
                        FoodWebError::UnknownStage {
                            organism: host.organism.clone(),
                            stage: host.exit_stage.clone(),
                        }
                    })?;

                    let window_len = exit - first + 1;
                    for (chain_pos, host_pos) in (first..=exit).enumerate() {
                        let host_cfg = &host_org.stages[host_pos];
                        let host_abs = lookup(&index, &host.organism, &host_cfg.name)?;
                        let ghost_idx = stages.len();
                        let terminal = chain_pos == window_len - 1;

                        let mut ghost_eqs = StageEquations::from_stage(host_cfg);
                        // A parasitized host never reproduces.
                        ghost_eqs.reproduction = None;
                        if terminal {
                            // The parasitoid larva controls maturation out
                            // of the final infected stage.
                            ghost_eqs.transition = juvenile_cfg.transition.clone();
                            ghost_eqs.aging = juvenile_cfg.aging.clone();
                        }
                        let target = ghost_eqs
                            .transition
                            .as_ref()
                            .map(|_| if terminal { recipient } else { ghost_idx + 1 });

                        stages.push(StageMeta {
                            organism: organism.clone(),
                            name: format!("infecting {}/{}", host.organism, host_cfg.name),
                            ghost: Some(GhostMeta {
                                host_organism: host.organism.clone(),
                                host_stage: host_abs,
                                attack_stage,
                            }),
                        });
                        eqs.push(ghost_eqs);
                        transition_target.push(target);
                        reproduction_target.push(None);
                        ghosts_of_host.entry(host_abs).or_default().push(ghost_idx);
                        ghosts.push(ghost_idx);
                        if entry_positions.contains(&host_pos) {
                            infection_links.push(InfectionLink {
                                attacker: attack_stage,
                                entry: host_abs,
                                ghost: ghost_idx,
                            });
                        }
                    }
                }
                parasitoids.push(ParasitoidMeta {
                    attack_stage,
                    juvenile,
                    recipient,
                    ghosts,
                });
            }
        }

        // The ghost chain implements the juvenile's development.
        for parasitoid in &parasitoids {
            eqs[parasitoid.juvenile].transition = None;
            eqs[parasitoid.juvenile].aging = None;
            transition_target[parasitoid.juvenile] = None;
        }

        let cohort_stages: Vec<usize> =
            (0..stages.len()).filter(|&i| eqs[i].aging.is_some()).collect();
        let mut cohort_pos = vec![None; stages.len()];
        for (pos, &stage) in cohort_stages.iter().enumerate() {
            cohort_pos[stage] = Some(pos);
        }

        Ok(Self {
            config: config.clone(),
            stages,
            eqs,
            n_base,
            index,
            transition_target,
            reproduction_target,
            cohort_stages,
            cohort_pos,
            parasitoids,
            infection_links,
            ghosts_of_host,
            parasitoid_organisms,
        })
    }

    /// The configuration this web was compiled from.
    #[must_use]
    pub const fn config(&self) -> &FoodWebConfig {
        &self.config
    }

    /// Total stage count, ghosts included.
    #[must_use]
    pub const fn n_stages(&self) -> usize {
        self.stages.len()
    }

    /// Number of configured (non-ghost) stages.
    #[must_use]
    pub const fn n_base_stages(&self) -> usize {
        self.n_base
    }

    /// Metadata of one flattened stage.
    #[must_use]
    pub fn stage(&self, idx: usize) -> &StageMeta {
        &self.stages[idx]
    }

    /// All flattened stages in index order.
    pub fn stages(&self) -> impl Iterator<Item = &StageMeta> {
        self.stages.iter()
    }

    /// Flattened index of a configured stage. Ghost stages are not
    /// addressable by name.
    #[must_use]
    pub fn stage_index(&self, organism: &str, stage: &str) -> Option<usize> {
        self.index.get(organism)?.get(stage).copied()
    }

    /// Organism names in flattening order.
    pub fn organisms(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    /// Where stage transitions route, `None` for death by old age.
    #[must_use]
    pub fn transition_target(&self, idx: usize) -> Option<usize> {
        self.transition_target[idx]
    }

    /// Where offspring of a stage go.
    #[must_use]
    pub fn reproduction_target(&self, idx: usize) -> Option<usize> {
        self.reproduction_target[idx]
    }

    /// Stages that track age-structured cohorts, ascending.
    #[must_use]
    pub fn cohort_stages(&self) -> &[usize] {
        &self.cohort_stages
    }

    /// Position of a stage in the cohort arrays, if it tracks cohorts.
    #[must_use]
    pub fn cohort_pos(&self, idx: usize) -> Option<usize> {
        self.cohort_pos[idx]
    }

    /// Every parasitoid attack stage with its wiring.
    #[must_use]
    pub fn parasitoids(&self) -> &[ParasitoidMeta] {
        &self.parasitoids
    }

    /// Every (attacker, entry stage, ghost) infection route.
    #[must_use]
    pub fn infection_links(&self) -> &[InfectionLink] {
        &self.infection_links
    }

    /// Ghost stages shadowing a host stage, across all parasitoids.
    #[must_use]
    pub fn ghosts_of_host(&self, host: usize) -> &[usize] {
        self.ghosts_of_host
            .get(&host)
            .map_or(&[], Vec::as_slice)
    }

    /// Whether any stage of the organism parasitizes hosts.
    #[must_use]
    pub fn is_parasitoid_organism(&self, organism: &str) -> bool {
        self.parasitoid_organisms.contains(organism)
    }

    /// External driver series the active equations need, deduplicated and
    /// sorted. Callers can fail fast before starting a run.
    #[must_use]
    pub fn required_drivers(&self) -> Vec<DriverRequirement> {
        let mut needs = BTreeSet::new();
        for (idx, eqs) in self.eqs.iter().enumerate() {
            if let Some(growth) = &eqs.growth {
                if let Some(GrowthModifier::LogNormalTemp { .. }) = &growth.modifier {
                    needs.insert(DriverRequirement::MaxTemperature);
                }
                if matches!(growth.law, GrowthLaw::ExternallyDriven) {
                    needs.insert(DriverRequirement::StagePopulation(idx));
                }
            }
            match &eqs.mortality {
                Some(MortalityLaw::LogNormalTemp { .. } | MortalityLaw::SigmoidTemp { .. }) => {
                    needs.insert(DriverRequirement::MaxTemperature);
                }
                Some(MortalityLaw::AsymptoticHumidity { .. }) => {
                    needs.insert(DriverRequirement::RelativeHumidity);
                }
                _ => {}
            }
            match &eqs.aging {
                Some(AgingLaw::DegreeDays { .. }) => {
                    needs.insert(DriverRequirement::MaxTemperature);
                    needs.insert(DriverRequirement::MinTemperature);
                }
                Some(
                    AgingLaw::Briere { .. }
                    | AgingLaw::BriereNonlinear { .. }
                    | AgingLaw::Logan { .. },
                ) => {
                    needs.insert(DriverRequirement::MeanTemperature);
                }
                _ => {}
            }
        }
        needs.into_iter().collect()
    }

    /// Effective equations of one stage.
    pub(crate) fn eqs(&self, idx: usize) -> &StageEquations {
        &self.eqs[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        CutoffRule, DayDegreeMethod, HostSpec, MovementKind, OrganismConfig, ParasitismConfig,
        PredationLaw, PreyBasis, PreyEntry, ReproductionConfig, ReproductionProb, ResponseForm,
        StageRef, TransitionProb,
    };

    fn aphid() -> OrganismConfig {
        OrganismConfig {
            stages: vec![
                StageConfig {
                    aging: Some(AgingLaw::Days),
                    transition: Some(TransitionConfig {
                        prob: TransitionProb::ConstantHazard { q: 0.2.into() },
                        multiplier: None,
                        target: Some("adult".to_owned()),
                    }),
                    ..StageConfig::new("nymph")
                },
                StageConfig {
                    growth: Some(GrowthConfig {
                        law: GrowthLaw::Logistic { k: 1000.0.into() },
                        modifier: Some(GrowthModifier::Constant { r: 0.3.into() }),
                    }),
                    reproduction: Some(ReproductionConfig {
                        prob: ReproductionProb::Constant { a: 2.0.into() },
                        recipient: "nymph".to_owned(),
                    }),
                    ..StageConfig::new("adult")
                },
            ],
        }
    }

    fn wasp() -> OrganismConfig {
        OrganismConfig {
            stages: vec![
                StageConfig {
                    aging: Some(AgingLaw::Days),
                    transition: Some(TransitionConfig {
                        prob: TransitionProb::ConstantHazard { q: 0.1.into() },
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
                            PreyEntry::new(StageRef::new("aphid", "nymph"), 0.05),
                            PreyEntry::new(StageRef::new("aphid", "adult"), 0.05),
                        ],
                    }),
                    parasitism: Some(ParasitismConfig {
                        juvenile_stage: "juvenile".to_owned(),
                        recipient_stage: "adult".to_owned(),
                        hosts: vec![HostSpec {
                            organism: "aphid".to_owned(),
                            entry_stages: vec!["nymph".to_owned()],
                            exit_stage: "adult".to_owned(),
                        }],
                    }),
                    ..StageConfig::new("adult")
                },
            ],
        }
    }

    fn parasitized_web() -> FoodWebConfig {
        let mut organisms = std::collections::BTreeMap::new();
        organisms.insert("aphid".to_owned(), aphid());
        organisms.insert("wasp".to_owned(), wasp());
        FoodWebConfig { organisms }
    }

    #[test]
    fn flattens_in_sorted_organism_order() {
        let web = FoodWeb::compile(&parasitized_web()).unwrap();
        assert_eq!(web.n_base_stages(), 4);
        assert_eq!(web.stage_index("aphid", "nymph"), Some(0));
        assert_eq!(web.stage_index("aphid", "adult"), Some(1));
        assert_eq!(web.stage_index("wasp", "juvenile"), Some(2));
        assert_eq!(web.stage_index("wasp", "adult"), Some(3));
        assert_eq!(
            web.organisms().collect::<Vec<_>>(),
            vec!["aphid", "wasp"]
        );
    }

    #[test]
    fn ghost_chain_covers_the_host_window() {
        let web = FoodWeb::compile(&parasitized_web()).unwrap();
        assert_eq!(web.n_stages(), 6);
        let first = web.stage(4);
        assert!(first.is_ghost());
        assert_eq!(first.organism, "wasp");
        let meta = first.ghost.as_ref().unwrap();
        assert_eq!(meta.host_stage, 0);
        assert_eq!(meta.attack_stage, 3);
        assert_eq!(web.ghosts_of_host(0), &[4]);
        assert_eq!(web.ghosts_of_host(1), &[5]);
        assert_eq!(web.ghosts_of_host(3), &[] as &[usize]);
    }

    #[test]
    fn chain_transitions_end_at_the_recipient() {
        let web = FoodWeb::compile(&parasitized_web()).unwrap();
        assert_eq!(web.transition_target(4), Some(5));
        assert_eq!(web.transition_target(5), Some(3));
        // Terminal ghost runs on the juvenile's clock.
        assert!(matches!(
            web.eqs(5).transition.as_ref().unwrap().prob,
            TransitionProb::ConstantHazard { .. }
        ));
        assert!(matches!(web.eqs(5).aging, Some(AgingLaw::Days)));
    }

    #[test]
    fn juvenile_development_moves_to_the_chain() {
        let web = FoodWeb::compile(&parasitized_web()).unwrap();
        assert!(web.eqs(2).transition.is_none());
        assert!(web.eqs(2).aging.is_none());
        assert_eq!(web.transition_target(2), None);
        assert_eq!(web.cohort_pos(2), None);
    }

    #[test]
    fn cohort_stages_follow_active_aging() {
        let web = FoodWeb::compile(&parasitized_web()).unwrap();
        assert_eq!(web.cohort_stages(), &[0, 4, 5]);
        assert_eq!(web.cohort_pos(0), Some(0));
        assert_eq!(web.cohort_pos(5), Some(2));
    }

    #[test]
    fn infection_links_pair_entries_with_their_ghosts() {
        let web = FoodWeb::compile(&parasitized_web()).unwrap();
        assert_eq!(
            web.infection_links(),
            &[InfectionLink {
                attacker: 3,
                entry: 0,
                ghost: 4,
            }]
        );
        let parasitoid = &web.parasitoids()[0];
        assert_eq!(parasitoid.attack_stage, 3);
        assert_eq!(parasitoid.juvenile, 2);
        assert_eq!(parasitoid.recipient, 3);
        assert_eq!(parasitoid.ghosts, vec![4, 5]);
        assert!(web.is_parasitoid_organism("wasp"));
        assert!(!web.is_parasitoid_organism("aphid"));
    }

    #[test]
    fn ghosts_never_reproduce() {
        let web = FoodWeb::compile(&parasitized_web()).unwrap();
        assert!(web.eqs(5).reproduction.is_none());
        assert_eq!(web.reproduction_target(5), None);
        assert_eq!(web.reproduction_target(1), Some(0));
    }

    #[test]
    fn movement_is_rejected_as_unimplemented() {
        let mut config = parasitized_web();
        config.organisms.get_mut("aphid").unwrap().stages[0].movement =
            Some(MovementKind::Dispersal);
        assert!(matches!(
            FoodWeb::compile(&config),
            Err(FoodWebError::Unimplemented("movement"))
        ));
    }

    #[test]
    fn driver_requirements_reflect_active_equations() {
        let mut config = parasitized_web();
        let aphid = config.organisms.get_mut("aphid").unwrap();
        aphid.stages[0].aging = Some(AgingLaw::DegreeDays {
            min: 10.0.into(),
            max: 35.0.into(),
            method: DayDegreeMethod::Triangular,
            cutoff: CutoffRule::Horizontal,
        });
        aphid.stages[1].mortality = Some(MortalityLaw::AsymptoticHumidity {
            a: 0.1.into(),
            b: 30.0.into(),
        });
        let web = FoodWeb::compile(&config).unwrap();
        assert_eq!(
            web.required_drivers(),
            vec![
                DriverRequirement::MaxTemperature,
                DriverRequirement::MinTemperature,
                DriverRequirement::RelativeHumidity,
            ]
        );
    }
}
