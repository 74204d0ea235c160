use std::collections::BTreeMap;

use anyhow::Result;
use foodweb_core::{
    AgingLaw, Experiment, FoodWeb, FoodWebConfig, GrowthConfig, GrowthLaw, GrowthModifier, HostSpec,
    InitialPopulation, MaterializedCoefs, MortalityLaw, NoiseConfig, OrganismConfig,
    ParasitismConfig, PredationConfig, PredationLaw, PreyBasis, PreyEntry, ReproductionConfig,
    ReproductionProb, ResponseForm, RunSpec, Simulation, StageConfig, StageRef, TransitionConfig,
    TransitionProb,
};
use rand::{SeedableRng, rngs::SmallRng};
use tracing::{info, warn};

const SEASON_DAYS: usize = 120;

fn main() -> Result<()> {
    init_tracing();
    let config = orchard_config();
    let web = FoodWeb::compile(&config)?;
    let mut rng = SmallRng::seed_from_u64(0xFEED_FACE_CAFE_BEEF_u64);
    let coefs = MaterializedCoefs::build(&web, 1, &mut rng)?;
    let experiment = orchard_experiment();
    info!(
        organisms = config.organisms.len(),
        stages = web.n_stages(),
        parcels = experiment.n_parcels(),
        "Compiled orchard web"
    );

    let spec = RunSpec {
        n_steps: SEASON_DAYS,
        seed: Some(0xFEED_FACE_CAFE_BEEF_u64),
        ..RunSpec::default()
    };
    let mut sim = Simulation::new(&web, &coefs, &experiment, spec)?;
    info!("Starting orchard season run");
    while sim.step_index() < sim.spec().n_steps {
        let events = sim.step()?;
        if sim.step_index() % 14 == 0 {
            info!(
                day = sim.day(),
                predated = events.predated,
                matured = events.matured,
                births = events.births,
                deaths = events.deaths,
                "Fortnight digest"
            );
        }
    }

    if let Some(summary) = sim.history().last() {
        for (organism, individuals) in &summary.organisms {
            info!(organism = %organism, individuals = *individuals, "Final standing");
        }
        info!(day = sim.day(), "Season complete");
    } else {
        warn!("Season finished without any retained summaries");
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// An apple orchard block: aphids flush on the canopy with a
/// temperature-tuned rate, ladybirds graze them and recruit on what they
/// eat, and a parasitoid wasp works the same colonies through its ghost
/// columns.
fn orchard_config() -> FoodWebConfig {
    let mut organisms = BTreeMap::new();
    organisms.insert(
        "apple".to_owned(),
        OrganismConfig {
            stages: vec![StageConfig {
                growth: Some(GrowthConfig {
                    law: GrowthLaw::Constant { n: 80_000.0.into() },
                    modifier: None,
                }),
                ..StageConfig::new("canopy")
            }],
        },
    );
    organisms.insert(
        "aphid".to_owned(),
        OrganismConfig {
            stages: vec![StageConfig {
                growth: Some(GrowthConfig {
                    law: GrowthLaw::LogisticPrey {
                        k: BTreeMap::from([(StageRef::new("apple", "canopy"), 0.01.into())]),
                    },
                    modifier: Some(GrowthModifier::LogNormalTemp {
                        r: 0.35.into(),
                        t: 24.0.into(),
                        p: 0.3.into(),
                    }),
                }),
                mortality: Some(MortalityLaw::ConstantHazard { q: 0.02.into() }),
                noise: Some(NoiseConfig { sigma: 0.1.into() }),
                ..StageConfig::new("colony")
            }],
        },
    );
    organisms.insert(
        "ladybird".to_owned(),
        OrganismConfig {
            stages: vec![StageConfig {
                predation: Some(PredationConfig {
                    law: PredationLaw::Response {
                        form: ResponseForm::TypeII,
                        basis: PreyBasis::Prey,
                    },
                    prey: vec![PreyEntry {
                        b: Some(60.0.into()),
                        ..PreyEntry::new(StageRef::new("aphid", "colony"), 0.7)
                    }],
                }),
                reproduction: Some(ReproductionConfig {
                    prob: ReproductionProb::PredationLinked {
                        n: BTreeMap::from([(StageRef::new("aphid", "colony"), 0.05.into())]),
                    },
                    recipient: "adult".to_owned(),
                }),
                mortality: Some(MortalityLaw::ConstantHazard { q: 0.04.into() }),
                ..StageConfig::new("adult")
            }],
        },
    );
    organisms.insert(
        "wasp".to_owned(),
        OrganismConfig {
            stages: vec![
                StageConfig {
                    aging: Some(AgingLaw::Days),
                    transition: Some(TransitionConfig {
                        prob: TransitionProb::ConstantHazard { q: 0.08.into() },
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
                        prey: vec![PreyEntry::new(StageRef::new("aphid", "colony"), 0.02)],
                    }),
                    parasitism: Some(ParasitismConfig {
                        juvenile_stage: "juvenile".to_owned(),
                        recipient_stage: "adult".to_owned(),
                        hosts: vec![HostSpec {
                            organism: "aphid".to_owned(),
                            entry_stages: vec!["colony".to_owned()],
                            exit_stage: "colony".to_owned(),
                        }],
                    }),
                    mortality: Some(MortalityLaw::ConstantHazard { q: 0.06.into() }),
                    ..StageConfig::new("adult")
                },
            ],
        },
    );
    FoodWebConfig { organisms }
}

/// Two orchard blocks of unequal size with a synthetic spring-to-summer
/// temperature ramp.
fn orchard_experiment() -> Experiment {
    let mut experiment = Experiment::new(vec![1.5, 0.75]);
    experiment.initial.push(InitialPopulation::single(
        StageRef::new("aphid", "colony"),
        vec![900.0, 420.0],
    ));
    experiment.initial.push(InitialPopulation::single(
        StageRef::new("ladybird", "adult"),
        vec![8.0, 5.0],
    ));
    experiment.initial.push(InitialPopulation::single(
        StageRef::new("wasp", "adult"),
        vec![4.0, 2.0],
    ));
    experiment.drivers.t_max = Some(
        (0..SEASON_DAYS)
            .map(|day| {
                let phase = day as f64 / SEASON_DAYS as f64 * std::f64::consts::PI;
                16.0 + 12.0 * phase.sin()
            })
            .collect(),
    );
    experiment
}
