use std::collections::HashSet;

use crate::config::BatchLimits;
use crate::error::{Result, TaskfoldError};
use crate::scheduler::job::{Job, ResourceRequest, TaskRequirements, TaskSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    pub tasks_per_job: usize,
    pub parallel_tasks_per_job: usize,
    pub num_jobs: usize,
}

/// Job width is capped by both the cpu and the memory ceiling. Jobs widen
/// past the target when there would be more than `target_num_jobs`, and
/// take sequential waves when even full width exceeds `max_num_jobs`.
pub fn plan(
    total_tasks: usize,
    needs: &TaskRequirements,
    limits: &BatchLimits,
) -> Result<BatchPlan> {
    validate(total_tasks, needs, limits)?;

    let cpus = needs.cpus_per_task as u64;
    let mem = needs.mem_per_task_mb;

    let by_cpu = limits.max_cpus_per_job as u64 / cpus;
    let by_mem = limits.max_mem_per_job_mb / mem;
    let max_parallel = clamp_width(by_cpu.min(by_mem), total_tasks);

    let target_by_cpu = limits.target_cpus_per_job as u64 / cpus;
    let target_by_mem = limits.target_mem_per_job_mb / mem;
    let target_parallel = clamp_width(target_by_cpu.min(target_by_mem), total_tasks).min(max_parallel);

    let target_num_jobs = limits.target_num_jobs.clamp(1, limits.max_num_jobs);

    let mut parallel = target_parallel;
    if total_tasks.div_ceil(parallel) > target_num_jobs {
        parallel = total_tasks
            .div_ceil(target_num_jobs)
            .clamp(target_parallel, max_parallel);
    }

    let mut tasks_per_job = parallel;
    if total_tasks.div_ceil(tasks_per_job) > limits.max_num_jobs {
        tasks_per_job = total_tasks.div_ceil(limits.max_num_jobs);
        parallel = max_parallel.min(tasks_per_job);
    }

    let plan = BatchPlan {
        tasks_per_job,
        parallel_tasks_per_job: parallel,
        num_jobs: total_tasks.div_ceil(tasks_per_job),
    };
    tracing::debug!(
        total_tasks,
        tasks_per_job = plan.tasks_per_job,
        parallel_tasks_per_job = plan.parallel_tasks_per_job,
        num_jobs = plan.num_jobs,
        "Computed batch plan"
    );
    Ok(plan)
}

fn clamp_width(width: u64, total_tasks: usize) -> usize {
    usize::try_from(width)
        .unwrap_or(usize::MAX)
        .clamp(1, total_tasks.max(1))
}

fn validate(total_tasks: usize, needs: &TaskRequirements, limits: &BatchLimits) -> Result<()> {
    let invalid = |msg: String| Err(TaskfoldError::InvalidPlan(msg));

    if total_tasks == 0 {
        return invalid("no tasks to plan".to_string());
    }
    if needs.cpus_per_task == 0 {
        return invalid("cpus_per_task must be positive".to_string());
    }
    if needs.mem_per_task_mb == 0 {
        return invalid("mem_per_task_mb must be positive".to_string());
    }
    if limits.max_num_jobs < 1 {
        return invalid("max_num_jobs must be at least 1".to_string());
    }
    if needs.cpus_per_task > limits.max_cpus_per_job {
        return invalid(format!(
            "cpus_per_task={} exceeds max_cpus_per_job={}",
            needs.cpus_per_task, limits.max_cpus_per_job
        ));
    }
    if needs.mem_per_task_mb > limits.max_mem_per_job_mb {
        return invalid(format!(
            "mem_per_task_mb={} exceeds max_mem_per_job_mb={}",
            needs.mem_per_task_mb, limits.max_mem_per_job_mb
        ));
    }
    Ok(())
}

/// Split `tasks` into jobs following `plan`. Task order is kept, both
/// across and within jobs.
pub fn split_into_jobs(
    tasks: Vec<TaskSpec>,
    plan: &BatchPlan,
    needs: &TaskRequirements,
) -> Result<Vec<Job>> {
    check_labels(&tasks)?;

    let mut jobs = Vec::with_capacity(plan.num_jobs);
    let mut tasks = tasks.into_iter().peekable();
    while tasks.peek().is_some() {
        let chunk: Vec<TaskSpec> = tasks.by_ref().take(plan.tasks_per_job).collect();
        let request = ResourceRequest {
            cpus_per_task: needs.cpus_per_task,
            mem_per_task_mb: needs.mem_per_task_mb,
            parallel_tasks: plan.parallel_tasks_per_job.min(chunk.len()),
            wall_time: needs.wall_time,
        };
        jobs.push(Job::new(chunk, request));
    }
    Ok(jobs)
}

// Labels become file names on the venue
fn check_labels(tasks: &[TaskSpec]) -> Result<()> {
    let mut seen = HashSet::with_capacity(tasks.len());
    for task in tasks {
        let safe = !task.label.is_empty()
            && !task.label.starts_with('.')
            && task
                .label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !safe {
            return Err(TaskfoldError::Config(format!(
                "task label {:?} must be non-empty, not start with '.', and use [A-Za-z0-9._-]",
                task.label
            )));
        }
        if !seen.insert(task.label.as_str()) {
            return Err(TaskfoldError::Config(format!(
                "duplicate task label {:?}",
                task.label
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::TaskValue;
    use crate::scheduler::job::EntryPoint;

    fn limits(
        target_cpus: u32,
        max_cpus: u32,
        target_mem: u64,
        max_mem: u64,
        target_jobs: usize,
        max_jobs: usize,
    ) -> BatchLimits {
        BatchLimits::default()
            .with_cpus(target_cpus, max_cpus)
            .with_mem_mb(target_mem, max_mem)
            .with_num_jobs(target_jobs, max_jobs)
    }

    fn tasks(n: usize) -> Vec<TaskSpec> {
        (0..n)
            .map(|i| {
                TaskSpec::new(EntryPoint::new("/bin/true"), TaskValue::None)
                    .with_label(format!("task-{}", i))
            })
            .collect()
    }

    #[test]
    fn single_job_folds_everything() {
        let plan = plan(
            10_000,
            &TaskRequirements::new(1, 100),
            &limits(1, 1, 100, 100, 10, 1),
        )
        .unwrap();
        assert_eq!(plan.tasks_per_job, 10_000);
        assert_eq!(plan.parallel_tasks_per_job, 1);
        assert_eq!(plan.num_jobs, 1);
    }

    #[test]
    fn single_job_uses_ceiling_width() {
        let plan = plan(
            100,
            &TaskRequirements::new(1, 100),
            &limits(1, 8, 100, 400, 10, 1),
        )
        .unwrap();
        assert_eq!(plan.num_jobs, 1);
        assert_eq!(plan.tasks_per_job, 100);
        // Memory is the tighter ceiling
        assert_eq!(plan.parallel_tasks_per_job, 4);
    }

    #[test]
    fn widens_toward_target_job_count() {
        let plan = plan(
            40,
            &TaskRequirements::new(1, 100),
            &limits(1, 8, 100, 1000, 5, 50),
        )
        .unwrap();
        assert_eq!(plan.parallel_tasks_per_job, 8);
        assert_eq!(plan.tasks_per_job, 8);
        assert_eq!(plan.num_jobs, 5);
    }

    #[test]
    fn few_tasks_cap_width() {
        let plan = plan(
            3,
            &TaskRequirements::new(1, 100),
            &limits(16, 16, 1600, 1600, 1, 1),
        )
        .unwrap();
        assert_eq!(plan.parallel_tasks_per_job, 3);
        assert_eq!(plan.tasks_per_job, 3);
    }

    #[test]
    fn rejects_invalid_inputs() {
        let l = limits(1, 4, 100, 400, 2, 4);
        assert!(plan(0, &TaskRequirements::new(1, 100), &l).is_err());
        assert!(plan(5, &TaskRequirements::new(0, 100), &l).is_err());
        assert!(plan(5, &TaskRequirements::new(1, 0), &l).is_err());
        assert!(plan(5, &TaskRequirements::new(8, 100), &l).is_err());
        assert!(plan(5, &TaskRequirements::new(1, 1000), &l).is_err());
        assert!(matches!(
            plan(5, &TaskRequirements::new(1, 100), &limits(1, 4, 100, 400, 2, 0)),
            Err(TaskfoldError::InvalidPlan(_))
        ));
    }

    #[test]
    fn split_three_tasks_into_two_jobs() {
        let needs = TaskRequirements::new(1, 100);
        let plan = plan(3, &needs, &limits(1, 1, 100, 100, 2, 2)).unwrap();
        let jobs = split_into_jobs(tasks(3), &plan, &needs).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs.iter().map(|j| j.tasks.len()).sum::<usize>(), 3);
        assert_eq!(jobs[0].tasks[0].label, "task-0");
        assert_eq!(jobs[1].tasks[0].label, "task-2");
        for job in &jobs {
            assert!(job.request.parallel_tasks <= job.tasks.len());
        }
    }

    #[test]
    fn split_rejects_unsafe_or_duplicate_labels() {
        let needs = TaskRequirements::new(1, 100);
        let plan = BatchPlan {
            tasks_per_job: 2,
            parallel_tasks_per_job: 1,
            num_jobs: 1,
        };

        let mut dup = tasks(2);
        dup[1].label = dup[0].label.clone();
        assert!(split_into_jobs(dup, &plan, &needs).is_err());

        let mut bad = tasks(1);
        bad[0].label = "../escape".to_string();
        assert!(split_into_jobs(bad, &plan, &needs).is_err());
    }
}
