use std::collections::BTreeMap;

use foodweb_core::{
    AgeDistribution, AgingLaw, CutoffRule, DayDegreeMethod, DriverRequirement, Experiment,
    FoodWeb, FoodWebConfig, GrowthConfig, GrowthLaw, GrowthModifier, HostSpec, InitialPopulation,
    MaterializedCoefs, MortalityLaw, NoiseConfig, OrganismConfig, ParasitismConfig,
    PredationConfig, PredationLaw, PreyBasis, PreyEntry, ReproductionConfig, ReproductionProb,
    ResponseForm, RunSpec, SimError, Simulation, StageConfig, StageRef, TransitionConfig,
    TransitionProb, run_batch, run_for_calibration,
};
use ndarray::Array5;
use rand::SeedableRng;
use rand::rngs::SmallRng;

fn organisms(entries: Vec<(&str, OrganismConfig)>) -> BTreeMap<String, OrganismConfig> {
    entries
        .into_iter()
        .map(|(name, cfg)| (name.to_owned(), cfg))
        .collect()
}

fn compile(config: FoodWebConfig) -> (FoodWeb, MaterializedCoefs) {
    let web = FoodWeb::compile(&config).expect("web");
    let mut rng = SmallRng::seed_from_u64(7);
    let coefs = MaterializedCoefs::build(&web, 1, &mut rng).expect("coefs");
    (web, coefs)
}

/// Every population must stay a non-negative whole count at every recorded
/// step.
fn assert_whole_counts(pops: &Array5<f64>) {
    for &value in pops {
        assert!(value.is_finite(), "population {value} is not finite");
        assert!(value >= 0.0, "population {value} went negative");
        assert!(
            (value - value.round()).abs() < 1e-6,
            "population {value} is not a whole count"
        );
    }
}

/// An aphid colony growing on a pinned crop stand, grazed by ladybirds
/// whose reproduction tracks their consumption.
fn aphid_ladybird_field() -> FoodWebConfig {
    FoodWebConfig {
        organisms: organisms(vec![
            (
                "barley",
                OrganismConfig {
                    stages: vec![StageConfig {
                        growth: Some(GrowthConfig {
                            law: GrowthLaw::Constant { n: 10_000.0.into() },
                            modifier: None,
                        }),
                        ..StageConfig::new("stand")
                    }],
                },
            ),
            (
                "aphid",
                OrganismConfig {
                    stages: vec![StageConfig {
                        growth: Some(GrowthConfig {
                            law: GrowthLaw::LogisticPrey {
                                k: BTreeMap::from([(
                                    StageRef::new("barley", "stand"),
                                    0.05.into(),
                                )]),
                            },
                            modifier: Some(GrowthModifier::Constant { r: 0.4.into() }),
                        }),
                        mortality: Some(MortalityLaw::ConstantHazard { q: 0.05.into() }),
                        ..StageConfig::new("colony")
                    }],
                },
            ),
            (
                "ladybird",
                OrganismConfig {
                    stages: vec![StageConfig {
                        predation: Some(PredationConfig {
                            law: PredationLaw::Response {
                                form: ResponseForm::TypeII,
                                basis: PreyBasis::Prey,
                            },
                            prey: vec![PreyEntry {
                                b: Some(50.0.into()),
                                ..PreyEntry::new(StageRef::new("aphid", "colony"), 0.8)
                            }],
                        }),
                        reproduction: Some(ReproductionConfig {
                            prob: ReproductionProb::PredationLinked {
                                n: BTreeMap::from([(
                                    StageRef::new("aphid", "colony"),
                                    0.2.into(),
                                )]),
                            },
                            recipient: "adult".to_owned(),
                        }),
                        ..StageConfig::new("adult")
                    }],
                },
            ),
        ]),
    }
}

fn parasitized_aphids() -> FoodWebConfig {
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
                                    PreyEntry::new(StageRef::new("aphid", "nymph"), 0.03),
                                    PreyEntry::new(StageRef::new("aphid", "adult"), 0.03),
                                ],
                            }),
                            parasitism: Some(ParasitismConfig {
                                juvenile_stage: "juvenile".to_owned(),
                                recipient_stage: "adult".to_owned(),
                                hosts: vec![HostSpec {
                                    organism: "aphid".to_owned(),
                                    entry_stages: vec!["nymph".to_owned(), "adult".to_owned()],
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

fn noisy_colony() -> FoodWebConfig {
    FoodWebConfig {
        organisms: organisms(vec![(
            "moth",
            OrganismConfig {
                stages: vec![StageConfig {
                    growth: Some(GrowthConfig {
                        law: GrowthLaw::Exponential,
                        modifier: Some(GrowthModifier::Constant { r: 0.05.into() }),
                    }),
                    noise: Some(NoiseConfig {
                        sigma: 0.2.into(),
                    }),
                    ..StageConfig::new("colony")
                }],
            },
        )]),
    }
}

#[test]
fn seeded_runs_reproduce_bit_for_bit() {
    let (web, coefs) = compile(noisy_colony());
    let mut experiment = Experiment::new(vec![1.0, 1.0]);
    experiment.initial.push(InitialPopulation::single(
        StageRef::new("moth", "colony"),
        vec![400.0, 250.0],
    ));
    let spec = RunSpec {
        n_steps: 10,
        n_stoch: 3,
        seed: Some(0xDEADBEEF),
        ..RunSpec::default()
    };

    let mut run_a = Simulation::new(&web, &coefs, &experiment, spec.clone()).expect("run_a");
    let mut run_b = Simulation::new(&web, &coefs, &experiment, spec).expect("run_b");
    run_a.run().expect("advance a");
    run_b.run().expect("advance b");

    assert_eq!(run_a.populations(), run_b.populations());
    assert!(run_a.history().eq(run_b.history()));
    assert_whole_counts(run_a.populations());
}

#[test]
fn noise_free_runs_match_across_seeds() {
    let mut config = noisy_colony();
    config
        .organisms
        .get_mut("moth")
        .expect("moth")
        .stages[0]
        .noise = None;
    let (web, coefs) = compile(config);
    let mut experiment = Experiment::new(vec![1.0]);
    experiment.initial.push(InitialPopulation::single(
        StageRef::new("moth", "colony"),
        vec![400.0],
    ));

    let spec_a = RunSpec {
        n_steps: 12,
        seed: Some(1),
        ..RunSpec::default()
    };
    let spec_b = RunSpec {
        seed: Some(2),
        ..spec_a.clone()
    };
    let predictions_a = run_for_calibration(&web, &coefs, &experiment, &spec_a).expect("a");
    let predictions_b = run_for_calibration(&web, &coefs, &experiment, &spec_b).expect("b");
    assert_eq!(predictions_a.raw(), predictions_b.raw());
}

#[test]
fn predation_is_applied_before_growth_within_a_step() {
    let config = FoodWebConfig {
        organisms: organisms(vec![
            (
                "aphid",
                OrganismConfig {
                    stages: vec![StageConfig {
                        growth: Some(GrowthConfig {
                            law: GrowthLaw::Logistic { k: 1000.0.into() },
                            modifier: Some(GrowthModifier::Constant { r: 0.3.into() }),
                        }),
                        ..StageConfig::new("colony")
                    }],
                },
            ),
            (
                "ladybird",
                OrganismConfig {
                    stages: vec![StageConfig {
                        predation: Some(PredationConfig {
                            law: PredationLaw::Response {
                                form: ResponseForm::TypeII,
                                basis: PreyBasis::Prey,
                            },
                            prey: vec![PreyEntry {
                                b: Some(10.0.into()),
                                ..PreyEntry::new(StageRef::new("aphid", "colony"), 0.5)
                            }],
                        }),
                        ..StageConfig::new("adult")
                    }],
                },
            ),
        ]),
    };
    let (web, coefs) = compile(config);
    let mut experiment = Experiment::new(vec![1.0]);
    experiment.initial.push(InitialPopulation::single(
        StageRef::new("aphid", "colony"),
        vec![100.0],
    ));
    experiment.initial.push(InitialPopulation::single(
        StageRef::new("ladybird", "adult"),
        vec![5.0],
    ));
    let spec = RunSpec {
        n_steps: 1,
        debug_checks: true,
        ..RunSpec::default()
    };
    let mut sim = Simulation::new(&web, &coefs, &experiment, spec).expect("sim");
    let events = sim.step().expect("step");

    // Five predators drawing 0.5 * 100 / 110 each leaves 98 aphids, then
    // logistic growth adds floor(0.3 * 98 * (1 - 98/1000)) = 26.
    assert_eq!(events.predated, 2.0);
    let colony = web.stage_index("aphid", "colony").expect("colony");
    let adult = web.stage_index("ladybird", "adult").expect("adult");
    assert_eq!(sim.current()[[0, 0, 0, colony]], 124.0);
    assert_eq!(sim.current()[[0, 0, 0, adult]], 5.0);
}

#[test]
fn season_of_predation_and_recruitment_stays_whole() {
    let (web, coefs) = compile(aphid_ladybird_field());
    let mut experiment = Experiment::new(vec![0.5, 2.0]);
    experiment.initial.push(InitialPopulation::single(
        StageRef::new("aphid", "colony"),
        vec![200.0, 320.0],
    ));
    experiment.initial.push(InitialPopulation::single(
        StageRef::new("ladybird", "adult"),
        vec![6.0, 4.0],
    ));
    let spec = RunSpec {
        n_steps: 15,
        debug_checks: true,
        seed: Some(99),
        ..RunSpec::default()
    };
    let mut sim = Simulation::new(&web, &coefs, &experiment, spec).expect("sim");
    sim.run().expect("run");

    assert_whole_counts(sim.populations());
    let mut predated = 0.0;
    let mut births = 0.0;
    let mut deaths = 0.0;
    for summary in sim.history() {
        predated += summary.events.predated;
        births += summary.events.births;
        deaths += summary.events.deaths;
    }
    assert!(predated > 0.0, "ladybirds never ate");
    assert!(births > 0.0, "consumption never recruited ladybirds");
    assert!(deaths > 0.0, "background mortality never fired");

    let stand = web.stage_index("barley", "stand").expect("stand");
    let colony = web.stage_index("aphid", "colony").expect("colony");
    assert_eq!(sim.current()[[0, 0, 0, stand]], 10_000.0);
    assert!(sim.current()[[0, 0, 0, colony]] > 0.0);
}

#[test]
fn parasitism_conserves_displayed_host_totals() {
    let (web, coefs) = compile(parasitized_aphids());
    let mut experiment = Experiment::new(vec![1.0]);
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
        n_steps: 10,
        debug_checks: true,
        ..RunSpec::default()
    };
    let mut sim = Simulation::new(&web, &coefs, &experiment, spec).expect("sim");
    sim.run().expect("run");

    let predictions = sim.predictions();
    let reported = predictions.reported();
    let nymph = predictions.stage_column("aphid", "nymph").expect("nymph");
    let adult = predictions.stage_column("aphid", "adult").expect("adult");
    let juvenile = predictions.stage_column("wasp", "juvenile").expect("juvenile");
    for t in 0..=10 {
        let displayed = reported[[0, 0, 0, nymph, t]] + reported[[0, 0, 0, adult, t]];
        assert_eq!(displayed, 200.0, "aphids leaked at step {t}");
    }
    // Infections accumulate into the juvenile column and match the raw
    // ghost populations.
    assert!(reported[[0, 0, 0, juvenile, 10]] > 0.0);
    let total_predated: f64 = sim.history().map(|s| s.events.predated).sum();
    assert_eq!(reported[[0, 0, 0, juvenile, 10]], total_predated);
    assert_whole_counts(predictions.raw());
}

#[test]
fn cohort_maturation_empties_the_source_stage() {
    let config = FoodWebConfig {
        organisms: organisms(vec![(
            "whitefly",
            OrganismConfig {
                stages: vec![
                    StageConfig {
                        aging: Some(AgingLaw::Days),
                        transition: Some(TransitionConfig {
                            prob: TransitionProb::AgeDistribution {
                                dist: AgeDistribution::Normal {
                                    mu: 2.5.into(),
                                    sigma: 0.2.into(),
                                },
                            },
                            multiplier: None,
                            target: Some("adult".to_owned()),
                        }),
                        ..StageConfig::new("nymph")
                    },
                    StageConfig::new("adult"),
                ],
            },
        )]),
    };
    let (web, coefs) = compile(config);
    let mut experiment = Experiment::new(vec![1.0]);
    experiment.initial.push(InitialPopulation::single(
        StageRef::new("whitefly", "nymph"),
        vec![10.0],
    ));
    let spec = RunSpec {
        n_steps: 8,
        debug_checks: true,
        ..RunSpec::default()
    };
    let mut sim = Simulation::new(&web, &coefs, &experiment, spec).expect("sim");
    sim.run().expect("run");

    let nymph = web.stage_index("whitefly", "nymph").expect("nymph");
    let adult = web.stage_index("whitefly", "adult").expect("adult");
    let pops = sim.populations();
    for t in 0..=8 {
        let total = pops[[0, 0, 0, nymph, t]] + pops[[0, 0, 0, adult, t]];
        assert_eq!(total, 10.0, "maturation lost individuals at step {t}");
    }
    assert_eq!(pops[[0, 0, 0, nymph, 8]], 0.0);
    assert_eq!(pops[[0, 0, 0, adult, 8]], 10.0);
    // Nothing matures before the distribution's support is reached.
    assert_eq!(pops[[0, 0, 0, adult, 1]], 0.0);
}

#[test]
fn batch_runs_match_serial_runs() {
    let (web, coefs) = compile(noisy_colony());
    let mut experiment = Experiment::new(vec![1.0]);
    experiment.initial.push(InitialPopulation::single(
        StageRef::new("moth", "colony"),
        vec![300.0],
    ));
    let specs: Vec<RunSpec> = [11_u64, 12, 13]
        .into_iter()
        .map(|seed| RunSpec {
            n_steps: 12,
            n_stoch: 2,
            seed: Some(seed),
            ..RunSpec::default()
        })
        .collect();

    let batch = run_batch(&web, &coefs, &experiment, &specs).expect("batch");
    assert_eq!(batch.len(), specs.len());
    for (spec, parallel) in specs.iter().zip(&batch) {
        let serial = run_for_calibration(&web, &coefs, &experiment, spec).expect("serial");
        assert_eq!(parallel.raw(), serial.raw());
    }
}

#[test]
fn driver_requirements_surface_before_running() {
    let config = FoodWebConfig {
        organisms: organisms(vec![(
            "beetle",
            OrganismConfig {
                stages: vec![
                    StageConfig {
                        aging: Some(AgingLaw::DegreeDays {
                            min: 10.0.into(),
                            max: 32.0.into(),
                            method: DayDegreeMethod::Triangular,
                            cutoff: CutoffRule::Horizontal,
                        }),
                        transition: Some(TransitionConfig {
                            prob: TransitionProb::AgeDistribution {
                                dist: AgeDistribution::Normal {
                                    mu: 60.0.into(),
                                    sigma: 12.0.into(),
                                },
                            },
                            multiplier: None,
                            target: Some("adult".to_owned()),
                        }),
                        mortality: Some(MortalityLaw::AsymptoticHumidity {
                            a: 0.02.into(),
                            b: 80.0.into(),
                        }),
                        ..StageConfig::new("larva")
                    },
                    StageConfig::new("adult"),
                ],
            },
        )]),
    };
    let (web, coefs) = compile(config);
    let required = web.required_drivers();
    assert!(required.contains(&DriverRequirement::MaxTemperature));
    assert!(required.contains(&DriverRequirement::MinTemperature));
    assert!(required.contains(&DriverRequirement::RelativeHumidity));

    let mut experiment = Experiment::new(vec![1.0]);
    experiment.initial.push(InitialPopulation::single(
        StageRef::new("beetle", "larva"),
        vec![100.0],
    ));
    experiment.drivers.t_max = Some(vec![28.0; 5]);
    experiment.drivers.t_min = Some(vec![12.0; 5]);
    let spec = RunSpec {
        n_steps: 5,
        debug_checks: true,
        ..RunSpec::default()
    };
    let err = Simulation::new(&web, &coefs, &experiment, spec.clone()).unwrap_err();
    assert!(matches!(err, SimError::MissingDriver("relative humidity")));

    experiment.drivers.humidity = Some(vec![85.0; 5]);
    let mut sim = Simulation::new(&web, &coefs, &experiment, spec).expect("sim");
    sim.run().expect("run");
    assert_whole_counts(sim.populations());

    let larva = web.stage_index("beetle", "larva").expect("larva");
    let adult = web.stage_index("beetle", "adult").expect("adult");
    let final_total =
        sim.current()[[0, 0, 0, larva]] + sim.current()[[0, 0, 0, adult]];
    assert!(final_total <= 100.0, "humidity mortality cannot add insects");
}
