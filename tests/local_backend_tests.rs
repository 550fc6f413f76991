//! End-to-end runs on the local backend, using the real worker binary.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use taskfold::backend::LocalBackend;
use taskfold::channel::TaskValue;
use taskfold::config::{BatchLimits, ControllerConfig, Profile, Resource};
use taskfold::controller::Controller;
use taskfold::scheduler::{EntryPoint, JobState, TaskRequirements, TaskSpec};
use taskfold::version::VersionReport;
use taskfold::TaskFailure;
use tokio_util::sync::CancellationToken;

const WORKER: &str = env!("CARGO_BIN_EXE_taskfold");

fn config() -> ControllerConfig {
    ControllerConfig::default()
        .with_poll_interval(Duration::from_millis(20), Duration::from_millis(100))
        .with_retry_delays(Duration::from_millis(10), Duration::from_millis(50))
        .with_job_timeout(Some(Duration::from_secs(60)))
}

fn controller(job_root: &Path, config: ControllerConfig) -> Controller<LocalBackend> {
    let resource = Resource::local("local", job_root)
        .with_worker(VersionReport::current().interpreter_key(), WORKER);
    let backend = LocalBackend::new(&resource, &Profile::new("tests"), config.clone()).unwrap();
    Controller::new(Arc::new(backend), config)
}

fn shell(script: &str, payload: TaskValue) -> TaskSpec {
    TaskSpec::new(
        EntryPoint::new("sh").with_arg("-c").with_arg(script),
        payload,
    )
}

fn limits(max_jobs: usize) -> BatchLimits {
    BatchLimits::default()
        .with_cpus(1, 2)
        .with_mem_mb(100, 200)
        .with_num_jobs(max_jobs, max_jobs)
}

fn job_dirs(root: &Path) -> usize {
    std::fs::read_dir(root)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with("job-"))
                .count()
        })
        .unwrap_or(0)
}

#[tokio::test]
async fn test_three_tasks_two_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let controller = controller(dir.path(), config());
    let tasks: Vec<TaskSpec> = (0..3)
        .map(|i| shell("cat", TaskValue::Json(json!({ "i": i }))))
        .collect();
    let ids: Vec<_> = tasks.iter().map(|t| t.id).collect();

    let report = controller
        .run(
            tasks,
            &TaskRequirements::new(1, 100),
            &limits(2),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.jobs.len(), 2);
    assert!(report.jobs.iter().all(|j| j.state == JobState::FinishedOk));
    assert_eq!(report.results.len(), 3);
    for (i, id) in ids.iter().enumerate() {
        let result = report.result_for(*id).unwrap();
        assert_eq!(result.outcome, Ok(TaskValue::Json(json!({ "i": i }))));
    }
    assert_eq!(job_dirs(dir.path()), 0);
}

#[tokio::test]
async fn test_partial_failure_is_per_task() {
    let dir = tempfile::tempdir().unwrap();
    let controller = controller(dir.path(), config());
    let tasks = vec![
        shell("echo hello", TaskValue::None),
        shell("echo oops >&2; exit 3", TaskValue::None),
        shell("true", TaskValue::None),
    ];
    let failing = tasks[1].id;

    let report = controller
        .run(
            tasks,
            &TaskRequirements::new(1, 100),
            &limits(1),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.jobs.len(), 1);
    assert_eq!(report.jobs[0].state, JobState::FinishedError);
    assert_eq!(report.succeeded().count(), 2);
    assert_eq!(report.results[0].outcome, Ok(TaskValue::Text("hello\n".into())));
    assert_eq!(report.results[2].outcome, Ok(TaskValue::None));

    match &report.result_for(failing).unwrap().outcome {
        Err(TaskFailure::Execution(e)) => {
            assert_eq!(e.exc_type_name, "NonZeroExit");
            assert_eq!(e.args, vec![json!(3)]);
            assert!(e.traceback.contains("oops"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn test_cancellation_stops_running_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let controller = controller(dir.path(), config());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let report = controller
        .run(
            vec![shell("sleep 30", TaskValue::None)],
            &TaskRequirements::new(1, 100),
            &limits(1),
            cancel,
        )
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(report.jobs[0].state, JobState::Cancelled);
    assert_eq!(report.results[0].outcome, Err(TaskFailure::Cancelled));
}

#[tokio::test]
async fn test_job_timeout_reports_timed_out() {
    let dir = tempfile::tempdir().unwrap();
    let config = config().with_job_timeout(Some(Duration::from_millis(300)));
    let controller = controller(dir.path(), config);

    let report = controller
        .run(
            vec![shell("sleep 30", TaskValue::None)],
            &TaskRequirements::new(1, 100),
            &limits(1),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.results[0].outcome, Err(TaskFailure::TimedOut));
}

#[tokio::test]
async fn test_keep_job_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let controller = controller(dir.path(), config().with_keep_job_dirs(true));

    controller
        .run(
            vec![shell("true", TaskValue::None)],
            &TaskRequirements::new(1, 100),
            &limits(1),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(job_dirs(dir.path()), 1);
}

#[tokio::test]
async fn test_resource_batching_limits_apply() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let resource = Resource::local("local", dir.path())
        .with_worker(VersionReport::current().interpreter_key(), WORKER)
        .with_batching(limits(1));
    let backend = LocalBackend::new(&resource, &Profile::new("tests"), config.clone()).unwrap();
    let controller = Controller::new(Arc::new(backend), config);

    let tasks: Vec<TaskSpec> = (0..3).map(|_| shell("true", TaskValue::None)).collect();
    let report = controller
        .run_with_resource_limits(tasks, &TaskRequirements::new(1, 100), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.jobs.len(), 1);
    assert_eq!(report.succeeded().count(), 3);
}

#[tokio::test]
async fn test_worker_logs_land_in_job_dir() {
    let dir = tempfile::tempdir().unwrap();
    let controller = controller(dir.path(), config().with_keep_job_dirs(true));

    controller
        .run(
            vec![shell("true", TaskValue::None).with_label("greet")],
            &TaskRequirements::new(1, 100),
            &limits(1),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let job_dir = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .find(|e| e.file_name().to_string_lossy().starts_with("job-"))
        .unwrap()
        .path();
    assert!(job_dir.join("version.log").is_file());
    assert!(job_dir.join("greet.log").is_file());
}
