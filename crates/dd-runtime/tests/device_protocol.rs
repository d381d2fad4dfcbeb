use std::path::PathBuf;
use std::sync::Arc;

use dd_runtime::{
    DeviceConfig, DeviceProtocol, FakeStep, FakeTransport, RunError, SessionState, VmInvocation,
};
use dd_types::{ConfigurationError, ExecutionFailureKind};
use tempfile::TempDir;

const CLEANUP: &str = "shell find /data -name";

fn fast_config() -> DeviceConfig {
    DeviceConfig::default()
        .with_bridge_ready(40, 4)
        .with_root_retries(5, 0)
}

fn protocol(fake: &FakeTransport) -> DeviceProtocol {
    DeviceProtocol::new(Arc::new(fake.clone()), fast_config())
}

fn program(dir: &TempDir) -> VmInvocation {
    let classes = dir.path().join("classes.dex");
    let extra = dir.path().join("classes2.dex");
    std::fs::write(&classes, b"dex\n035").expect("write dex");
    std::fs::write(&extra, b"dex\n035").expect("write dex");
    VmInvocation::builder("Main")
        .classpath([classes, extra])
        .build()
}

fn execution_kind(
    result: &Result<dd_types::ExecutionResult, RunError>,
) -> Option<ExecutionFailureKind> {
    match result {
        Err(RunError::Execution(failure)) => Some(failure.kind),
        _ => None,
    }
}

#[test]
fn successful_session_walks_every_state_and_cleans_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fake = FakeTransport::new().with_program("Hello\r\nWorld\n", Some("0\n"));
    let report = protocol(&fake).run_session(&program(&dir));

    let result = report.result.expect("device run succeeds");
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, dd_runtime::device::to_host_line_endings("Hello\nWorld\n"));
    let id = report.session.correlation_id().to_owned();
    assert_eq!(result.correlation_id.as_deref(), Some(id.as_str()));
    assert!(result.command.contains(&format!(
        "-cp /data/dd-tests-{id}/f0_classes.dex:/data/dd-tests-{id}/f1_classes2.dex Main"
    )));
    assert!(result.command.contains("/system/bin/dalvikvm"));

    assert_eq!(
        report.session.trail(),
        &[
            SessionState::Init,
            SessionState::BridgeReady,
            SessionState::RootEscalated,
            SessionState::FilesPushed,
            SessionState::CommandExecuted,
            SessionState::ResultPulled,
            SessionState::Cleaned,
        ]
    );
    assert_eq!(report.session.device(), Some("emulator-5554"));
    assert_eq!(fake.count_commands(CLEANUP), 1);
    assert!(fake.remote_files().is_empty());
}

#[test]
fn exit_status_file_overrides_shell_status() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fake = FakeTransport::new().with_program("partial\n", Some("1\n"));
    let result = protocol(&fake).run(&program(&dir)).expect("completed run");
    assert_eq!(result.exit_code, 1);
    assert_eq!(result.stdout, "partial\n");
}

#[test]
fn missing_exit_status_is_an_execution_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fake = FakeTransport::new().with_program("", None);
    let report = protocol(&fake).run_session(&program(&dir));
    assert_eq!(
        execution_kind(&report.result),
        Some(ExecutionFailureKind::MissingExitStatus)
    );
    assert_eq!(fake.count_commands(CLEANUP), 1);
    let Err(RunError::Execution(failure)) = &report.result else {
        panic!("expected execution failure");
    };
    assert_eq!(failure.correlation_id.as_deref(), Some(report.session.correlation_id()));
}

#[test]
fn unparsable_exit_status_is_an_execution_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fake = FakeTransport::new().with_program("", Some("Segmentation fault\n"));
    let result = protocol(&fake).run(&program(&dir));
    assert_eq!(
        execution_kind(&result),
        Some(ExecutionFailureKind::UnparsableExitStatus)
    );
}

#[test]
fn push_failure_still_cleans_up_exactly_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fake = FakeTransport::new().failing_at(FakeStep::Push);
    let report = protocol(&fake).run_session(&program(&dir));
    assert_eq!(execution_kind(&report.result), Some(ExecutionFailureKind::Transport));
    assert_eq!(fake.count_commands(CLEANUP), 1);
    assert_eq!(report.session.trail().last(), Some(&SessionState::Cleaned));
    assert!(report.session.trail().contains(&SessionState::Failed));
    assert!(!report.session.trail().contains(&SessionState::FilesPushed));
}

#[test]
fn execute_failure_still_cleans_up_exactly_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fake = FakeTransport::new().failing_at(FakeStep::Execute);
    let report = protocol(&fake).run_session(&program(&dir));
    assert_eq!(execution_kind(&report.result), Some(ExecutionFailureKind::Transport));
    assert_eq!(fake.count_commands(CLEANUP), 1);
    assert!(report.session.trail().contains(&SessionState::FilesPushed));
    assert!(!report.session.trail().contains(&SessionState::CommandExecuted));
    assert!(fake.remote_files().is_empty());
}

#[test]
fn root_escalation_retries_until_granted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fake = FakeTransport::new().root_after_attempts(Some(3));
    let result = protocol(&fake).run(&program(&dir));
    assert!(result.is_ok(), "{result:?}");
    assert_eq!(fake.root_requests(), 3);
}

#[test]
fn root_escalation_gives_up_after_five_attempts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fake = FakeTransport::new()
        .root_after_attempts(None)
        .failing_at(FakeStep::Root);
    let result = protocol(&fake).run(&program(&dir));
    assert!(matches!(
        result,
        Err(RunError::Configuration(ConfigurationError::RootUnavailable { .. }))
    ));
    assert_eq!(fake.root_requests(), 5);
    assert_eq!(fake.count_commands(CLEANUP), 1);
}

#[test]
fn device_count_must_be_exactly_one() {
    let dir = tempfile::tempdir().expect("tempdir");
    let none = FakeTransport::new().with_devices(Vec::<String>::new());
    assert_eq!(
        protocol(&none).run(&program(&dir)),
        Err(RunError::Configuration(ConfigurationError::NoDevice))
    );
    assert_eq!(none.count_commands(CLEANUP), 0);

    let two = FakeTransport::new().with_devices(["emulator-5554", "HT4"]);
    assert_eq!(
        protocol(&two).run(&program(&dir)),
        Err(RunError::Configuration(ConfigurationError::MultipleDevices {
            devices: vec!["emulator-5554".to_owned(), "HT4".to_owned()]
        }))
    );
}

#[test]
fn missing_bridge_differs_from_unready_bridge() {
    let dir = tempfile::tempdir().expect("tempdir");
    let missing = FakeTransport::new().without_bridge();
    assert!(matches!(
        protocol(&missing).run(&program(&dir)),
        Err(RunError::Configuration(ConfigurationError::TransportNotFound { .. }))
    ));

    let unready = FakeTransport::new().ready_after_polls(None);
    assert!(matches!(
        protocol(&unready).run(&program(&dir)),
        Err(RunError::Configuration(ConfigurationError::TransportMisconfigured { .. }))
    ));

    let slow = FakeTransport::new().ready_after_polls(Some(2));
    assert!(protocol(&slow).run(&program(&dir)).is_ok());
}

#[test]
fn wrong_runtime_family_is_rejected_after_selection() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fake = FakeTransport::new().with_runtime_banner("DalvikVM version 1.6.0");
    let result = protocol(&fake).run(&program(&dir));
    assert!(matches!(
        result,
        Err(RunError::Configuration(ConfigurationError::WrongRuntimeFamily { .. }))
    ));
    assert_eq!(fake.count_commands(CLEANUP), 1);
}

#[test]
fn cancelled_session_stops_before_touching_the_device() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fake = FakeTransport::new();
    let protocol = protocol(&fake);
    protocol.cancel_token().cancel();
    let result = protocol.run(&program(&dir));
    assert_eq!(execution_kind(&result), Some(ExecutionFailureKind::Cancelled));
    assert!(fake.commands().is_empty());
}

#[test]
fn boot_classpath_is_pushed_before_classpath() {
    let dir = tempfile::tempdir().expect("tempdir");
    let boot = dir.path().join("core.jar");
    std::fs::write(&boot, b"jar").expect("write jar");
    let classes = dir.path().join("classes.dex");
    std::fs::write(&classes, b"dex").expect("write dex");
    let invocation = VmInvocation::builder("Main")
        .boot_classpath([boot])
        .classpath([PathBuf::from(&classes)])
        .build();
    let fake = FakeTransport::new();
    let result = protocol(&fake).run(&invocation).expect("runs");
    let pushes: Vec<String> = fake
        .commands()
        .into_iter()
        .filter(|entry| entry.starts_with("push"))
        .collect();
    assert_eq!(pushes.len(), 3);
    assert!(pushes[0].ends_with("run-with-exit-status.sh"));
    assert!(pushes[1].ends_with("f0_core.jar"));
    assert!(pushes[2].ends_with("f1_classes.dex"));
    assert!(result.command.contains("-Xbootclasspath:/data/dd-tests-"));
}

proptest::proptest! {
    #![proptest_config(proptest::prelude::ProptestConfig::with_cases(32))]

    #[test]
    fn exit_status_file_is_ground_truth_for_any_status(
        status in -255i32..=255,
        stdout in "[ -~]{0,32}",
        injected in proptest::option::of(
            proptest::sample::select(vec![FakeStep::Push, FakeStep::Execute])
        ),
    ) {
        let dir = tempfile::tempdir().expect("tempdir");
        let status_file = format!("{status}\n");
        let mut fake = FakeTransport::new().with_program(stdout, Some(status_file.as_str()));
        if let Some(step) = injected {
            fake = fake.failing_at(step);
        }
        let result = protocol(&fake).run(&program(&dir));

        match injected {
            None => proptest::prop_assert_eq!(result.expect("device run").exit_code, status),
            Some(_) => proptest::prop_assert_eq!(
                execution_kind(&result),
                Some(ExecutionFailureKind::Transport)
            ),
        }
        proptest::prop_assert_eq!(fake.count_commands(CLEANUP), 1);
        proptest::prop_assert!(fake.remote_files().is_empty());
    }
}
