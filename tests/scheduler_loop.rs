use training_scheduler::{
    BatchStats, Scheduler, SchedulerConfig, SchedulerErr, SchedulingParameter, SchedulingUnit,
    ShutdownSignal, Solo, StaticLoss, StopReason,
    driver::{self, DemoRun, HeldOutLoss, SyntheticModel},
};

fn batch(labels: u64) -> BatchStats {
    BatchStats {
        read_batches: 1,
        samples: 10,
        labels,
        gradient_norm: 1.0,
    }
}

fn step(scheduler: &mut Scheduler<SyntheticModel>, loss: f32) -> Result<(), SchedulerErr> {
    scheduler.update(
        StaticLoss {
            loss: loss * 10.0,
            count: 10.0,
        },
        batch(10),
    )
}

#[test]
fn early_stopping_after_repeated_stalls() {
    let mut config = SchedulerConfig::default();
    config.valid_freq = SchedulingParameter::new(10, SchedulingUnit::Updates);
    config.early_stopping = 3;
    config.lr_decay = 0.5;
    config.lr_decay_strategy = "stalled".into();
    config.lr_decay_start = vec![1];
    config.learn_rate = 1.0;

    let model = SyntheticModel::default();
    let mut scheduler: Scheduler<SyntheticModel> =
        Scheduler::new(config, Box::new(Solo)).unwrap();
    scheduler.add_validator(Box::new(HeldOutLoss::new(4.5)));

    scheduler.started();
    while scheduler.keep_going() {
        let loss = model.loss_at(scheduler.state().batches);
        step(&mut scheduler, loss).unwrap();
        if scheduler.validating() {
            scheduler.validate(&model, false).unwrap();
        }
    }
    scheduler.finished();

    assert_eq!(
        scheduler.stop_reason(),
        Some(StopReason::EarlyStopping { stalled: 3 })
    );
    // best at update 110, stalls at 120, 130 and 140
    assert_eq!(scheduler.state().batches, 140);
    assert_eq!(scheduler.state().factor, 0.125);
    assert_eq!(scheduler.state().eta, 0.125);
}

#[test]
fn divergence_aborts_the_update() {
    let mut config = SchedulerConfig::default();
    config.throw_on_divergence = Some(vec!["5".into(), "1".into(), "1.0".into()]);
    let mut scheduler: Scheduler<SyntheticModel> =
        Scheduler::new(config, Box::new(Solo)).unwrap();

    for _ in 0..10 {
        step(&mut scheduler, 1.0).unwrap();
    }
    step(&mut scheduler, 100.0).unwrap();

    match step(&mut scheduler, 100.0) {
        Err(SchedulerErr::Divergence(err)) => {
            assert!((err.avg_slow - 34.0).abs() < 1e-3);
            assert!((err.avg_fast - 100.0).abs() < 1e-3);
            assert!(err.sigmas > 1.0);
        }
        other => panic!("expected divergence, got {other:?}"),
    }
    assert_eq!(scheduler.state().batches, 12);
}

#[test]
fn compound_stop_criteria_with_logical_epochs() {
    let mut config = SchedulerConfig::default();
    config.after = "2e,1Mu".into();
    config.logical_epoch = vec!["500t".into()];
    let mut scheduler: Scheduler<SyntheticModel> =
        Scheduler::new(config, Box::new(Solo)).unwrap();

    let mut updates = 0;
    while scheduler.keep_going() {
        step(&mut scheduler, 1.0).unwrap();
        updates += 1;
    }
    // 10 labels per update: logical epoch 2 ends after 1000 labels, stop once past it
    assert_eq!(updates, 101);
    assert_eq!(scheduler.format_logical_epoch(), "2.020");
    assert_eq!(
        scheduler.stop_reason(),
        Some(StopReason::Criterion(SchedulingParameter::new(
            2,
            SchedulingUnit::Epochs
        )))
    );
}

#[test]
fn warmup_then_inverse_square_root_decay() {
    let mut config = SchedulerConfig::default();
    config.learn_rate = 1.0;
    config.lr_warmup = SchedulingParameter::new(100, SchedulingUnit::Updates);
    config.lr_decay_inv_sqrt = vec![SchedulingParameter::new(100, SchedulingUnit::Updates)];
    let mut scheduler: Scheduler<SyntheticModel> =
        Scheduler::new(config, Box::new(Solo)).unwrap();
    assert_eq!(scheduler.state().eta, 0.0);

    let mut etas = Vec::new();
    for _ in 0..400 {
        step(&mut scheduler, 1.0).unwrap();
        etas.push(scheduler.state().eta);
    }
    assert!((etas[49] - 0.5).abs() < 1e-6);
    assert_eq!(etas[99], 1.0);
    assert!(etas[100] < 1.0);
    assert!((etas[399] - 0.5).abs() < 1e-6);
    assert!(etas.windows(2).skip(100).all(|w| w[1] <= w[0]));
}

#[test]
fn mini_batch_scaling_follows_the_schedule() {
    let mut config = SchedulerConfig::default();
    config.mini_batch_warmup = SchedulingParameter::new(1_000, SchedulingUnit::TargetLabels);
    let mut scheduler: Scheduler<SyntheticModel> =
        Scheduler::new(config, Box::new(Solo)).unwrap();
    assert!(scheduler.is_dynamic_mb_scaling());

    for _ in 0..25 {
        step(&mut scheduler, 1.0).unwrap();
    }
    // sqrt(250 / 1000)
    assert!((scheduler.dynamic_mb_size_multiplier() - 0.5).abs() < 1e-9);
}

#[test]
fn shutdown_skips_validation_and_stops() {
    let mut config = SchedulerConfig::default();
    config.valid_freq = SchedulingParameter::new(1, SchedulingUnit::Updates);
    let signal = ShutdownSignal::new();
    let model = SyntheticModel::default();
    let mut scheduler: Scheduler<SyntheticModel> = Scheduler::new(config, Box::new(Solo))
        .unwrap()
        .with_shutdown_signal(signal.clone());
    scheduler.add_validator(Box::new(HeldOutLoss::new(0.0)));

    step(&mut scheduler, 1.0).unwrap();
    signal.request();

    assert!(!scheduler.validating());
    scheduler.validate(&model, true).unwrap();
    assert!(!scheduler.state().validated);
    assert!(scheduler.saving());
    assert_eq!(scheduler.stop_reason(), Some(StopReason::ShutdownRequested));
}

#[tokio::test]
async fn demo_run_stops_on_criterion_across_workers() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = SchedulerConfig::default();
    config.after = "300u".into();
    config.valid_freq = SchedulingParameter::new(20, SchedulingUnit::Updates);
    config.save_freq = SchedulingParameter::new(100, SchedulingUnit::Updates);

    let demo = DemoRun {
        name: dir.path().join("demo").to_str().unwrap().to_string(),
        workers: 3,
        ..DemoRun::default()
    };
    let states = driver::run(config, demo.clone(), ShutdownSignal::new())
        .await
        .unwrap();

    assert_eq!(states.len(), 3);
    assert!(states.iter().all(|s| s == &states[0]));
    assert_eq!(states[0].batches, 300);
    assert_eq!(states[0].epochs, 4);
    assert_eq!(states[0].labels_total, 300 * 3 * demo.labels_per_update);
    assert!(dir.path().join("demo.progress.yml").exists());
    assert!(dir.path().join("demo.yml").exists());
}

#[tokio::test]
async fn demo_run_resumes_from_its_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let demo = DemoRun {
        name: dir.path().join("demo").to_str().unwrap().to_string(),
        workers: 2,
        ..DemoRun::default()
    };

    let mut first = SchedulerConfig::default();
    first.after = "150u".into();
    let states = driver::run(first, demo.clone(), ShutdownSignal::new())
        .await
        .unwrap();
    assert_eq!(states[0].batches, 150);

    let mut second = SchedulerConfig::default();
    second.after = "250u".into();
    let states = driver::run(second, demo, ShutdownSignal::new())
        .await
        .unwrap();
    assert_eq!(states[1].batches, 250);
    assert_eq!(states[1].epochs, 3);
}

#[tokio::test]
async fn interrupted_demo_run_saves_and_exits() {
    let dir = tempfile::tempdir().unwrap();
    let demo = DemoRun {
        name: dir.path().join("demo").to_str().unwrap().to_string(),
        workers: 2,
        ..DemoRun::default()
    };
    let interrupt = ShutdownSignal::new();
    interrupt.request();

    let states = driver::run(SchedulerConfig::default(), demo, interrupt)
        .await
        .unwrap();
    assert!(states.iter().all(|s| s.batches == 0));
    assert!(dir.path().join("demo.progress.yml").exists());
}
