use atnsim::batch::{BatchDispatcher, BatchError, BatchSettings, result_file_name};
use atnsim::config::SimulationParameters;
use atnsim::detector::StopEvent;
use atnsim::foodweb::{FoodWeb, NodeAttributes, NodeId, NodeType};
use atnsim::model::AtnParameters;
use atnsim::simulation::{SimulationError, SimulationResults};
use atnsim::solver::IntegrationError;
use std::{env, fs, path::PathBuf, sync::Arc, time::Duration};

fn three_species_web() -> FoodWeb {
    let mut web = FoodWeb::new();
    web.add_node_with(NodeId(1), NodeAttributes::new(NodeType::Producer))
        .unwrap();
    web.add_node_with(
        NodeId(2),
        NodeAttributes {
            body_mass: Some(10.0),
            ..NodeAttributes::new(NodeType::Consumer)
        },
    )
    .unwrap();
    web.add_node_with(
        NodeId(3),
        NodeAttributes {
            body_mass: Some(100.0),
            ..NodeAttributes::new(NodeType::Consumer)
        },
    )
    .unwrap();
    web.add_link(NodeId(1), NodeId(2)).unwrap();
    web.add_link(NodeId(1), NodeId(3)).unwrap();
    web.add_link(NodeId(2), NodeId(3)).unwrap();
    web
}

fn settings(test_name: &str) -> BatchSettings {
    let out_dir = PathBuf::from(env!("CARGO_TARGET_TMPDIR")).join(test_name);
    fs::remove_dir_all(&out_dir).ok();

    let parameters = SimulationParameters {
        timesteps: 400,
        step_size: 0.1,
        stop_on_steady_state: true,
        record_biomass: true,
    };
    let mut settings = BatchSettings::new(parameters, out_dir);
    settings.threads = 2;
    settings
}

#[test]
fn two_records_on_two_workers() {
    let web = Arc::new(three_species_web());
    let before = (*web).clone();
    let settings = settings("two_records_on_two_workers");
    let out_dir = settings.output_dir.clone();

    let records = "{\"1\": 2.0, \"2\": 0.5, \"3\": 0.2}\n{\"1\": 1.0, \"3\": 0.4}\n";
    let dispatcher = BatchDispatcher::new(Arc::clone(&web), settings);
    let reports = dispatcher.run(records.as_bytes()).unwrap();

    assert_eq!(reports.len(), 2);
    for (id, report) in reports.iter().enumerate() {
        assert_eq!(report.id, id);
        let summary = report.outcome.as_ref().unwrap();
        assert_eq!(summary.file, out_dir.join(result_file_name(id)));
    }

    let first: SimulationResults<AtnParameters> =
        SimulationResults::load(out_dir.join(result_file_name(0))).unwrap();
    let second: SimulationResults<AtnParameters> =
        SimulationResults::load(out_dir.join(result_file_name(1))).unwrap();

    assert_eq!(first.model_parameters.node_ids(), vec![NodeId(1), NodeId(2), NodeId(3)]);
    assert_eq!(second.model_parameters.node_ids(), vec![NodeId(1), NodeId(3)]);
    assert_eq!(first.biomass[0], vec![2000.0, 500.0, 200.0]);
    assert_eq!(second.biomass[0], vec![1000.0, 400.0]);
    assert_eq!(first.biomass.len(), 401);

    assert_eq!(*web, before);

    fs::remove_dir_all(&out_dir).ok();
}

#[test]
fn failing_records_do_not_abort_the_batch() {
    let web = Arc::new(three_species_web());
    let settings = settings("failing_records_do_not_abort_the_batch");
    let out_dir = settings.output_dir.clone();

    let records = "not json\n{\"1\": 1.0, \"9\": 1.0}\n{\"1\": 1.0}\n";
    let dispatcher = BatchDispatcher::new(web, settings);
    let reports = dispatcher.run(records.as_bytes()).unwrap();

    assert_eq!(reports.len(), 3);
    assert!(reports[0].outcome.is_err());
    assert!(reports[1].outcome.is_err());
    let summary = reports[2].outcome.as_ref().unwrap();
    assert_eq!(summary.stop_event, StopEvent::ConstantSteadyState);
    assert!(summary.timesteps_simulated < 400);

    assert!(!out_dir.join(result_file_name(0)).exists());
    assert!(out_dir.join(result_file_name(2)).is_file());

    fs::remove_dir_all(&out_dir).ok();
}

#[test]
fn interrupt_is_reported() {
    let web = Arc::new(three_species_web());
    let settings = settings("interrupt_is_reported");
    let out_dir = settings.output_dir.clone();

    let dispatcher = BatchDispatcher::new(web, settings);
    dispatcher.handle().interrupt();
    let result = dispatcher.run("{\"1\": 1.0}\n{\"1\": 2.0}\n".as_bytes());
    assert!(matches!(result, Err(BatchError::Interrupted)));

    fs::remove_dir_all(&out_dir).ok();
}

#[test]
fn drain_timeout_cancels_running_tasks() {
    let web = Arc::new(three_species_web());
    let mut settings = settings("drain_timeout_cancels_running_tasks");
    let out_dir = settings.output_dir.clone();
    settings.parameters.timesteps = 1_000_000;
    settings.parameters.stop_on_steady_state = false;
    settings.parameters.record_biomass = false;
    settings.model.integrator.max_step = 1e-3;
    settings.model.integrator.max_steps_per_chunk = u32::MAX as usize;
    settings.drain_timeout = Duration::from_millis(200);

    let records = "{\"1\": 1.0, \"2\": 0.5}\n{\"1\": 2.0, \"3\": 0.5}\n";
    let dispatcher = BatchDispatcher::new(web, settings);
    let reports = dispatcher.run(records.as_bytes()).unwrap();

    assert_eq!(reports.len(), 2);
    for report in &reports {
        let error = report.outcome.as_ref().unwrap_err();
        let cancelled = error.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<SimulationError>(),
                Some(SimulationError::Integration(IntegrationError::Cancelled { .. }))
            )
        });
        assert!(cancelled, "{error:#}");
    }
    assert!(!out_dir.join(result_file_name(0)).exists());

    fs::remove_dir_all(&out_dir).ok();
}
