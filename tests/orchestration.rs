mod common;

use common::{Call, RecordingDevice, TempFile, program_file};
use fcsim::error::{ConfigError, ErrorKind, FcsError};
use fcsim::event::LaunchState;
use fcsim::kernel::KernelArg;
use fcsim::launch::{LaunchPlan, RNG_STATE_WORDS};
use fcsim::memory::{MemoryTier, RunBuffers};
use fcsim::program::DIAGNOSTIC_DEFINE;
use fcsim::{RunMode, RunParameters, Simulation, SimulationConfig, SoftwareDevice};

fn config(path: &std::path::Path, mode: RunMode) -> SimulationConfig {
    SimulationConfig::default()
        .with_program_path(path)
        .with_mode(mode)
        .with_seed(7)
}

fn is_enqueue(c: &Call) -> bool {
    matches!(c, Call::Enqueue { .. })
}

fn is_wait(c: &Call) -> bool {
    matches!(c, Call::Wait(_))
}

fn is_read(c: &Call) -> bool {
    matches!(c, Call::Read(_))
}

// ---------------------------------------------------------------------------
// Release runs
// ---------------------------------------------------------------------------

#[test]
fn default_run_yields_one_thousand_zeroed_bins() {
    let (_program, path) = program_file();
    let device = RecordingDevice::new();
    let sim = Simulation::init(&device, config(&path, RunMode::Release)).unwrap();
    let rs = sim.run(&RunParameters::default()).unwrap();

    assert_eq!(rs.result_len, 1000);
    assert_eq!(rs.results.len(), 1000);
    assert!(rs.results.iter().all(|&c| c == 0));
    assert!(rs.diagnostics.is_none());
    assert!(rs.device_elapsed_ns.is_none());
    assert!(rs.host_elapsed_ns.is_none());

    let range = device.enqueued_range().unwrap();
    assert_eq!(range.global_size(), 1);
    assert_eq!(range.local_size(), 1);

    let seeded = device
        .position(|c| {
            matches!(c, Call::Allocate { tier: MemoryTier::PerRunGlobal, bytes: 4, host: Some(h), .. }
                if h == &1u32.to_le_bytes())
        })
        .unwrap();
    assert!(seeded < device.position(is_enqueue).unwrap());
    assert_eq!(
        device.count(|c| matches!(c, Call::Allocate { tier: MemoryTier::PerRunGlobal, .. })),
        2
    );
}

#[test]
fn countdown_is_seeded_before_enqueue() {
    let (_program, path) = program_file();
    let device = RecordingDevice::new();
    let sim = Simulation::init(&device, config(&path, RunMode::Release)).unwrap();
    sim.run(&RunParameters::default().with_total_droplets(1234))
        .unwrap();

    let seeded = device
        .position(|c| {
            matches!(c, Call::Allocate { tier: MemoryTier::PerRunGlobal, host: Some(h), .. }
                if h == &1234u32.to_le_bytes())
        })
        .unwrap();
    assert!(seeded < device.position(is_enqueue).unwrap());
}

#[test]
fn release_arguments_follow_the_kernel_signature() {
    let (_program, path) = program_file();
    let device = RecordingDevice::new();
    let sim = Simulation::init(&device, config(&path, RunMode::Release)).unwrap();
    let params = RunParameters::default()
        .with_grid(4, 16)
        .with_global_capacity(500);
    sim.run(&params).unwrap();

    let args = device.enqueued_args().unwrap();
    assert_eq!(args.len(), 4);
    assert!(matches!(
        args[0],
        KernelArg::Global { tier: MemoryTier::PerRunGlobal, bytes: 4, .. }
    ));
    assert!(matches!(
        args[1],
        KernelArg::Global { tier: MemoryTier::PerRunGlobal, bytes: 16_000, .. }
    ));
    assert_eq!(args[2], KernelArg::Local { bytes: 16 * 1000 * 4 });
    match args[3] {
        KernelArg::Constants(c) => {
            assert_eq!(c.end_time_ns, 10_000_000_000);
            assert_eq!(c.global_capacity, 500);
            assert_eq!(c.local_capacity, 1000);
            assert_eq!(c.rng_reserved, RNG_STATE_WORDS);
            assert_eq!(c.seed, 7);
        }
        other => panic!("expected constants last, got {other:?}"),
    }
    assert!(device.calls().iter().all(|c| match c {
        Call::Build { defines, .. } => defines.is_empty(),
        _ => true,
    }));
}

#[test]
fn grid_is_workgroups_times_workitems() {
    let (_program, path) = program_file();
    for (groups, items) in [(1u32, 1u32), (4, 16), (64, 1), (3, 7)] {
        let device = RecordingDevice::new();
        let sim = Simulation::init(&device, config(&path, RunMode::Release)).unwrap();
        let params = RunParameters::default()
            .with_grid(groups, items)
            .with_global_capacity(10)
            .with_local_capacity(64);
        let rs = sim.run(&params).unwrap();

        let range = device.enqueued_range().unwrap();
        assert_eq!(range.global_size(), (groups * items) as u64);
        assert_eq!(range.local_size(), items as u64);
        assert_eq!(range.global_size() % range.local_size(), 0);
        assert_eq!(rs.result_len, (groups * 10) as usize);
    }
}

#[test]
fn readback_happens_after_the_wait_and_before_finish() {
    let (_program, path) = program_file();
    let device = RecordingDevice::new();
    let sim = Simulation::init(&device, config(&path, RunMode::Release)).unwrap();
    sim.run(&RunParameters::default()).unwrap();

    let enqueue = device.position(is_enqueue).unwrap();
    let wait = device.position(is_wait).unwrap();
    let read = device.position(is_read).unwrap();
    let finish = device.position(|c| *c == Call::Finish).unwrap();
    assert!(enqueue < wait && wait < read && read < finish);
    assert_eq!(device.count(is_enqueue), 1);
    assert_eq!(device.count(is_wait), 1);
}

#[test]
fn every_buffer_is_released_after_a_run() {
    let (_program, path) = program_file();
    let device = RecordingDevice::new();
    let sim = Simulation::init(&device, config(&path, RunMode::Diagnostic)).unwrap();
    sim.run(&RunParameters::default()).unwrap();

    let mut allocated = device.allocated();
    let mut released = device.released();
    allocated.sort_by_key(|b| b.0);
    released.sort_by_key(|b| b.0);
    assert_eq!(allocated.len(), 3);
    assert_eq!(allocated, released);
}

#[test]
fn results_are_copied_from_the_device() {
    let (_program, path) = program_file();
    let mut device = RecordingDevice::new();
    device.fill_byte = 1;
    let sim = Simulation::init(&device, config(&path, RunMode::Release)).unwrap();
    let rs = sim
        .run(&RunParameters::default().with_global_capacity(3))
        .unwrap();
    assert_eq!(rs.results, vec![0x0101_0101_0101_0101u64; 3]);
}

// ---------------------------------------------------------------------------
// Diagnostic runs
// ---------------------------------------------------------------------------

#[test]
fn diagnostic_run_binds_the_debug_buffer_before_the_constants() {
    let (_program, path) = program_file();
    let device = RecordingDevice::new().with_profiling(1_000, 1_250);
    let sim = Simulation::init(&device, config(&path, RunMode::Diagnostic)).unwrap();
    let rs = sim.run(&RunParameters::default()).unwrap();

    let args = device.enqueued_args().unwrap();
    assert_eq!(args.len(), 5);
    assert!(matches!(
        args[3],
        KernelArg::Global { tier: MemoryTier::Diagnostic, bytes: 80, .. }
    ));
    assert!(matches!(args[4], KernelArg::Constants(_)));

    let defines = device.calls().into_iter().find_map(|c| match c {
        Call::Build { defines, .. } => Some(defines),
        _ => None,
    });
    assert_eq!(defines, Some(vec![DIAGNOSTIC_DEFINE.to_string()]));

    assert_eq!(rs.device_elapsed_ns, Some(250));
    assert!(rs.host_elapsed_ns.is_some());
    assert!(rs.diagnostics.is_some());
    assert_eq!(device.count(is_read), 2);
}

#[test]
fn diagnostic_run_without_profiling_still_reports_host_time() {
    let (_program, path) = program_file();
    let device = RecordingDevice::new();
    let sim = Simulation::init(&device, config(&path, RunMode::Diagnostic)).unwrap();
    let rs = sim.run(&RunParameters::default()).unwrap();
    assert_eq!(rs.device_elapsed_ns, None);
    assert!(rs.host_elapsed_ns.is_some());
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[test]
fn missing_program_fails_before_touching_the_device() {
    let device = RecordingDevice::new();
    let missing = std::env::temp_dir().join("fcsim_no_such_dir").join("absent.cl");
    let err = Simulation::init(&device, config(&missing, RunMode::Release))
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::Initialization);
    assert!(device.calls().is_empty());
}

#[test]
fn build_failure_is_an_initialization_error() {
    let (_program, path) = program_file();
    let mut device = RecordingDevice::new();
    device.fail_build = true;
    let err = Simulation::init(&device, config(&path, RunMode::Release))
        .err()
        .unwrap();
    assert!(matches!(err, FcsError::ProgramBuild { .. }));
    assert_eq!(err.kind(), ErrorKind::Initialization);
    assert!(device.allocated().is_empty());
}

#[test]
fn allocation_failure_releases_earlier_buffers_and_never_enqueues() {
    let (_program, path) = program_file();
    let device = RecordingDevice::new().failing_tier(MemoryTier::Diagnostic);
    let sim = Simulation::init(&device, config(&path, RunMode::Diagnostic)).unwrap();
    let err = sim.run(&RunParameters::default()).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Allocation);
    assert!(matches!(err, FcsError::Allocation { tier: MemoryTier::Diagnostic, .. }));
    assert_eq!(device.count(is_enqueue), 0);
    let mut allocated = device.allocated();
    let mut released = device.released();
    allocated.sort_by_key(|b| b.0);
    released.sort_by_key(|b| b.0);
    assert_eq!(allocated.len(), 2);
    assert_eq!(allocated, released);
}

#[test]
fn results_allocation_failure_is_reported_with_its_tier() {
    let (_program, path) = program_file();
    let device = RecordingDevice::new().failing_tier(MemoryTier::PerRunGlobal);
    let sim = Simulation::init(&device, config(&path, RunMode::Release)).unwrap();
    let err = sim.run(&RunParameters::default()).unwrap_err();
    assert!(matches!(
        err,
        FcsError::Allocation { tier: MemoryTier::PerRunGlobal, bytes: 8000, .. }
    ));
    assert!(err.to_string().contains("per-run global"));
    assert!(device.allocated().is_empty());
    assert_eq!(device.count(is_enqueue), 0);
}

#[test]
fn invalid_parameters_are_rejected_before_allocation() {
    let (_program, path) = program_file();
    let device = RecordingDevice::new();
    let sim = Simulation::init(&device, config(&path, RunMode::Release)).unwrap();

    let bad = [
        RunParameters::default().with_grid(0, 1),
        RunParameters::default().with_total_droplets(0),
        RunParameters::default().with_end_time(0.0),
        RunParameters::default().with_end_time(f64::NAN),
        RunParameters::default().with_end_time(1e12),
        RunParameters::default().with_photon_rate(-1.0),
        // exceeds the device's work-group limit
        RunParameters::default().with_grid(1, 4096).with_local_capacity(8),
    ];
    for params in bad {
        let err = sim.run(&params).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration, "{params:?}");
    }
    assert!(device.allocated().is_empty());
}

#[test]
fn launch_rejection_is_a_launch_error() {
    let (_program, path) = program_file();
    let mut device = RecordingDevice::new();
    device.fail_enqueue = true;
    let sim = Simulation::init(&device, config(&path, RunMode::Release)).unwrap();
    let err = sim.run(&RunParameters::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Launch);
    assert_eq!(device.allocated().len(), device.released().len());
}

// ---------------------------------------------------------------------------
// Launch lifecycle
// ---------------------------------------------------------------------------

#[test]
fn completion_handle_waits_once_and_gates_readback() {
    let device = RecordingDevice::new();
    let params = RunParameters::default();
    let plan = LaunchPlan::prepare(&params, RunMode::Release, RNG_STATE_WORDS, 1, &device.limits)
        .unwrap();
    let buffers = RunBuffers::allocate(&device, &plan.buffers, plan.total_droplets).unwrap();
    let prepared = plan
        .bind(&device, fcsim::device::KernelId(99), &buffers)
        .unwrap();
    assert_eq!(prepared.state(), LaunchState::NotLaunched);

    let mut handle = prepared.enqueue().unwrap();
    assert_eq!(handle.state(), LaunchState::InFlight);
    assert!(matches!(
        handle.ensure_completed(),
        Err(FcsError::NotCompleted(LaunchState::InFlight))
    ));
    assert!(handle.mark_results_available().is_err());
    assert!(handle.host_elapsed().is_none());

    handle.wait().unwrap();
    handle.wait().unwrap();
    assert_eq!(handle.state(), LaunchState::Completed);
    assert_eq!(device.count(is_wait), 1);
    assert!(handle.host_elapsed().is_some());

    handle.mark_results_available().unwrap();
    assert_eq!(handle.state(), LaunchState::ResultsAvailable);
    handle.wait().unwrap();
    assert_eq!(device.count(is_wait), 1);
}

#[test]
fn dropping_an_in_flight_handle_waits_for_the_kernel() {
    let device = RecordingDevice::new();
    let params = RunParameters::default();
    let plan = LaunchPlan::prepare(&params, RunMode::Release, RNG_STATE_WORDS, 1, &device.limits)
        .unwrap();
    let buffers = RunBuffers::allocate(&device, &plan.buffers, plan.total_droplets).unwrap();
    let handle = plan
        .bind(&device, fcsim::device::KernelId(99), &buffers)
        .unwrap()
        .enqueue()
        .unwrap();
    drop(handle);
    assert_eq!(device.count(is_wait), 1);
    drop(buffers);
    let wait = device.position(is_wait).unwrap();
    let first_release = device.position(|c| matches!(c, Call::Release(_))).unwrap();
    assert!(wait < first_release);
}

#[test]
fn diagnostic_buffers_do_not_fit_a_release_contract() {
    let device = RecordingDevice::new();
    let params = RunParameters::default();
    let diagnostic = LaunchPlan::prepare(
        &params,
        RunMode::Diagnostic,
        RNG_STATE_WORDS,
        1,
        &device.limits,
    )
    .unwrap();
    let buffers = RunBuffers::allocate(&device, &diagnostic.buffers, 1).unwrap();

    let release = LaunchPlan::prepare(&params, RunMode::Release, RNG_STATE_WORDS, 1, &device.limits)
        .unwrap();
    let err = release
        .bind(&device, fcsim::device::KernelId(1), &buffers)
        .err()
        .unwrap();
    assert!(matches!(
        err,
        FcsError::Configuration(ConfigError::ArgumentBinding { slot: "diagnostic", .. })
    ));
    assert_eq!(device.count(is_enqueue), 0);
}

// ---------------------------------------------------------------------------
// Software device, end to end
// ---------------------------------------------------------------------------

fn short_run() -> RunParameters {
    RunParameters::default()
        .with_total_droplets(8)
        .with_grid(2, 4)
        .with_end_time(0.01)
        .with_photon_rate(5.0e4)
        .with_global_capacity(100)
        .with_local_capacity(64)
}

#[test]
fn software_device_runs_a_diagnostic_simulation() {
    let (_program, path) = program_file();
    let sim = Simulation::init(SoftwareDevice::new(), config(&path, RunMode::Diagnostic)).unwrap();
    let rs = sim.run(&short_run()).unwrap();

    assert_eq!(rs.result_len, 200);
    let diag = rs.diagnostics.as_ref().unwrap();
    assert_eq!(diag.get("dropletsRemaining"), Some(0.0));
    assert_eq!(diag.get("GLOBALSIZE"), Some(100.0));
    assert_eq!(diag.get("LOCALSIZE"), Some(64.0));
    assert_eq!(diag.get("RNGRESERVED"), Some(RNG_STATE_WORDS as f32));
    assert!((diag.get("ENDTIME").unwrap() - 0.01).abs() < 1e-6);
    assert!(rs.device_elapsed_ns.is_some());
    assert!(rs.host_elapsed_ns.is_some());

    assert_eq!(sim.device().live_buffers(), 0);
    assert_eq!(sim.device().memory_in_use(), 0);
}

#[test]
fn software_device_reruns_are_independent() {
    let (_program, path) = program_file();
    let sim = Simulation::init(SoftwareDevice::new(), config(&path, RunMode::Release)).unwrap();
    // a single work-item claims every droplet, so the run is reproducible
    let params = short_run().with_grid(1, 1);
    let first = sim.run(&params).unwrap();
    let second = sim.run(&params).unwrap();
    assert_eq!(first.results, second.results);
    assert_eq!(first.result_len, 100);
    assert_eq!(sim.device().live_buffers(), 0);
}

#[test]
fn software_device_rejects_a_program_without_the_entry_point() {
    let file = TempFile::new("other.cl", "__kernel void other() {}\n");
    let err = Simulation::init(SoftwareDevice::new(), config(file.path(), RunMode::Release))
        .err()
        .unwrap();
    assert!(matches!(err, FcsError::ProgramBuild { .. }));
}

// ---------------------------------------------------------------------------
// Configuration files
// ---------------------------------------------------------------------------

#[test]
fn run_parameters_from_json() {
    let file = TempFile::new(
        "run.json",
        r#"{ "total_droplets": 1000, "workgroups": 4, "workitems": 16,
             "global_buffer_size_per_workgroup": 500 }"#,
    );
    let params = RunParameters::from_json_file(file.path()).unwrap();
    assert_eq!(params.total_droplets, 1000);
    assert_eq!(params.result_len().unwrap(), 2000);
    assert_eq!(params.end_time, 10.0);

    let err = RunParameters::from_json_str(r#"{ "workgroup": 4 }"#).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

#[test]
fn simulation_config_from_json() {
    let config: SimulationConfig =
        serde_json::from_str(r#"{ "mode": "diagnostic", "seed": 3 }"#).unwrap();
    assert_eq!(config.mode, RunMode::Diagnostic);
    assert_eq!(config.seed, 3);
    assert_eq!(config.rng_reserved, RNG_STATE_WORDS);
    assert_eq!(config.entry_point, "fcs");
}
