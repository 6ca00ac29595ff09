//! Behavioural properties of the session primitives against the simulated
//! microscope.

mod common;

use std::sync::Arc;

use common::simulated_session;
use perfectem::config::ConnectionSettings;
use perfectem::error::EmError;
use perfectem::scope::client::SemClient;
use perfectem::scope::sim::{SimConfig, SimulatedScope};
use perfectem::scope::{Microscope, Preset, ReadoutMode, SensorArea};
use perfectem::session::feedback::MAX_SPOT_SIZE;
use perfectem::session::{AreaSettings, Capabilities, Change, FocusTarget};
use tokio_test::assert_ok;

#[tokio::test]
async fn test_capability_detection_is_total() {
    for bits in 0..8u8 {
        let config = SimConfig {
            three_condenser: bits & 1 != 0,
            autofill: bits & 2 != 0,
            aperture_control: bits & 4 != 0,
            ..SimConfig::default()
        };
        let expected = Capabilities {
            three_condenser: config.three_condenser,
            autofill: config.autofill,
            aperture_control: config.aperture_control,
        };
        let sim = SimulatedScope::new(config);

        assert_eq!(Capabilities::detect(&sim).await, expected);
    }

    // Server errors on supported features are still only "absent".
    let sim = SimulatedScope::default();
    sim.fail("illuminated_area");
    sim.fail("dewars_filling");
    sim.fail("aperture_size");
    assert_eq!(Capabilities::detect(&sim).await, Capabilities::default());
}

#[tokio::test(start_paused = true)]
async fn test_dose_regulation_480_to_120() {
    let dir = tempfile::tempdir().unwrap();
    let (sim, session) = simulated_session(
        SimConfig {
            dose_rate_eps: 480.0,
            spot_size: 3,
            ..SimConfig::default()
        },
        dir.path(),
    )
    .await;
    assert_ok!(sim.set_exposure(Preset::Focus, 0.8).await);
    assert_ok!(sim.set_binning(Preset::Focus, 2).await);

    let result = session.regulate_dose_rate().await.unwrap();

    assert_eq!(result.measured_eps, 480.0);
    assert_eq!(result.estimated_eps, 120.0);
    assert_eq!(result.iterations, 2);
    assert_eq!(result.spot, 5);
    assert_eq!(sim.current_spot(), 5);
    assert_eq!(sim.preset(Preset::Focus).exposure, 0.8);
    assert_eq!(sim.preset(Preset::Focus).binning, 2);
}

#[tokio::test(start_paused = true)]
async fn test_dose_regulation_terminates_with_monotone_spot() {
    let dir = tempfile::tempdir().unwrap();
    for spot in [1, 4, 9, 11, 12] {
        for eps in [30.0, 120.0, 130.0, 999.0, 50_000.0] {
            let (sim, session) = simulated_session(
                SimConfig {
                    dose_rate_eps: eps,
                    spot_size: spot,
                    ..SimConfig::default()
                },
                dir.path(),
            )
            .await;

            let result = session.regulate_dose_rate().await.unwrap();
            let bound = (eps / 120.0_f64).log2().ceil().max(0.0) as u32;

            assert!(result.iterations <= bound, "eps {} spot {}", eps, spot);
            assert!(result.spot >= spot);
            assert!(result.spot <= MAX_SPOT_SIZE);
            assert_eq!(sim.current_spot(), result.spot);
        }
    }
}

#[tokio::test]
async fn test_configure_area_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (sim, session) = simulated_session(SimConfig::default(), dir.path()).await;
    let settings = AreaSettings::new(1.5, 2)
        .with_preset(Preset::Trial)
        .with_area(SensorArea::Half)
        .with_readout(ReadoutMode::Counting);

    assert_eq!(session.configure_area(&settings).await.unwrap(), Change::Applied);
    let once = sim.preset(Preset::Trial);
    assert_eq!(session.configure_area(&settings).await.unwrap(), Change::Applied);
    let twice = sim.preset(Preset::Trial);

    assert_eq!(once, twice);
    assert_eq!(twice.exposure, 1.5);
    assert_eq!(twice.area, SensorArea::Half);
    assert_eq!(twice.readout, ReadoutMode::Counting);
}

#[tokio::test(start_paused = true)]
async fn test_autofocus_stub_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let (sim, mut session) = simulated_session(SimConfig::default(), dir.path()).await;
    sim.push_autofocus_readings(&[-2.5, -2.2, -2.08, -1.98]);

    let value = session
        .autofocus_to(&FocusTarget::new(-2.0, 0.05))
        .await
        .unwrap();

    assert_eq!(value, -1.98);
    assert_eq!(sim.count("autofocus"), 4);
    assert_eq!(sim.last_autofocus().await.unwrap(), -1.98);
}

#[tokio::test(start_paused = true)]
async fn test_autofocus_result_within_precision() {
    let dir = tempfile::tempdir().unwrap();
    let sequences: [&[f64]; 4] = [
        &[],
        &[-0.4, -0.9, -1.02],
        &[-3.1, -2.6, -2.41, -1.55, -1.48],
        &[-1.0],
    ];
    for readings in sequences {
        let (sim, mut session) = simulated_session(SimConfig::default(), dir.path()).await;
        sim.push_autofocus_readings(readings);

        let target = FocusTarget::new(-1.0, 0.05);
        let value = session.autofocus_to(&target).await.unwrap();
        assert!((value - target.defocus).abs() <= target.precision);
    }
}

#[tokio::test(start_paused = true)]
async fn test_readiness_gate_never_reads_dewars_without_autofill() {
    let dir = tempfile::tempdir().unwrap();
    let (sim, session) = simulated_session(
        SimConfig {
            autofill: false,
            ..SimConfig::default()
        },
        dir.path(),
    )
    .await;
    sim.pump_busy_for(4);

    let waits = session.wait_until_ready_to_acquire().await.unwrap();

    assert_eq!(waits, 4);
    assert_eq!(sim.count("dewars_filling"), 0);
    assert!(session.dewar_time_remaining().await.unwrap().is_none());
}

#[tokio::test]
async fn test_unreachable_server_is_connection_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let settings = ConnectionSettings {
        port,
        ..ConnectionSettings::default()
    };
    let result = SemClient::connect(&settings).await;

    assert!(matches!(result, Err(EmError::Connection { .. })));
}

#[tokio::test]
async fn test_out_of_range_camera_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let settings = perfectem::config::Settings::default();
    let mut options =
        perfectem::session::SessionOptions::from_settings(&settings, perfectem::profiles::TestId::StageDrift)
            .unwrap();
    options.camera = Some(7);
    options.output_root = dir.path().to_path_buf();
    let sim = Arc::new(SimulatedScope::default());
    let mut operator = perfectem::operator::ScriptedOperator::default();

    let result = perfectem::session::Session::initialize(sim.clone(), options, &mut operator).await;

    assert!(matches!(result, Err(EmError::Configuration(_))));
    assert_eq!(sim.count("set_low_dose"), 0);
    assert_eq!(sim.count("set_column_valves"), 0);
}
