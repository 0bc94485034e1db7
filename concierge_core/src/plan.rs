//! Execution plan interpreter.
//!
//! A plan is compiled once, by [`crate::task::TaskDispatcher::compile_plan`],
//! into a flat, position-ordered `Vec<PlanTask>`. [`PlanScheduler::start`]
//! persists a parent [`Task`] that tracks each step's status and spawns the
//! actual run as a background activity, returning the parent task
//! immediately — callers poll it the same way they poll any other async
//! task rather than blocking on the whole plan.

use std::time::{Duration, Instant};

use crate::config::{PlanTask, PrevResultCond};
use crate::error::ConciergeError;
use crate::task::{PlanTaskStatus, Task, TaskDispatcher};
use std::sync::Arc;

/// How long a plan will wait for one async sub-task (or an `execute_after`
/// barrier on another step) before giving up on the whole plan run.
const SUBTASK_WAIT_LIMIT: Duration = Duration::from_secs(300);
const SUBTASK_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Runs compiled execution plans against a [`TaskDispatcher`].
pub struct PlanScheduler;

impl PlanScheduler {
    /// Compiles `plan_name`, persists its parent task, and spawns the
    /// actual interpreter loop in the background. Returns the parent task
    /// as it stands at the moment of dispatch (every step `scheduled`).
    pub fn start(dispatcher: Arc<TaskDispatcher>, plan_name: &str) -> Result<Task, ConciergeError> {
        let compiled = dispatcher.compile_plan(plan_name)?;
        let task = dispatcher.create_plan_task(plan_name, &compiled)?;
        let task_id = task.id.clone();

        tokio::spawn(async move {
            if let Err(e) = run_compiled(&dispatcher, &task_id, &compiled).await {
                tracing::warn!(task_id, error = %e, "execution plan run failed");
                dispatcher.finish_plan_task(&task_id);
            }
        });

        Ok(task)
    }
}

/// Interprets `compiled` against `task_id`'s plan-task table, following
/// `on_success_jump_to`/`on_error_jump_to` branches and honoring
/// `if_previous_command*` conditions and `execute_after` barriers.
async fn run_compiled(dispatcher: &Arc<TaskDispatcher>, task_id: &str, compiled: &[PlanTask]) -> Result<(), ConciergeError> {
    let mut results: Vec<Option<Task>> = vec![None; compiled.len()];
    let plan_start = Instant::now();
    let total = compiled.len();

    let mut pc = 0usize;
    while pc < total {
        let step = &compiled[pc];

        if let Some(after) = step.execute_after {
            wait_for_barrier(&results, after as usize, plan_start).await?;
        }

        if !condition_holds(step, &results) {
            dispatcher.update_plan_task(task_id, |t| set_step_status(t, pc, PlanTaskStatus::Skipped));
            advance_progress(dispatcher, task_id, total).await;
            pc += 1;
            continue;
        }

        dispatcher.update_plan_task(task_id, |t| set_step_status(t, pc, PlanTaskStatus::Waiting));

        let mut sub_task = dispatcher.command(&step.command, &step.hostnames, step.params.clone()).await?;
        if sub_task.is_running() {
            sub_task = wait_for_completion(dispatcher, &sub_task.id, plan_start).await?;
        }

        let succeeded = !sub_task.success.is_empty();
        let all_failed = !sub_task.errors.is_empty() && sub_task.success.is_empty();
        results[pc] = Some(sub_task);

        dispatcher.update_plan_task(task_id, |t| set_step_status(t, pc, PlanTaskStatus::Completed));
        advance_progress(dispatcher, task_id, total).await;

        let jump = if all_failed {
            step.on_error_jump_to
        } else if succeeded {
            step.on_success_jump_to
        } else {
            None
        };
        pc = jump.unwrap_or(pc + 1);
    }

    dispatcher.finish_plan_task(task_id);
    Ok(())
}

fn set_step_status(task: &mut Task, idx: usize, status: PlanTaskStatus) {
    if let Some(plan_tasks) = &mut task.plan_tasks {
        if let Some(entry) = plan_tasks.get_mut(idx) {
            entry.status = status;
        }
    }
}

fn completed_count(task: &Task) -> usize {
    task.plan_tasks
        .as_ref()
        .map(|steps| {
            steps
                .iter()
                .filter(|s| matches!(s.status, PlanTaskStatus::Completed | PlanTaskStatus::Skipped))
                .count()
        })
        .unwrap_or(0)
}

async fn advance_progress(dispatcher: &Arc<TaskDispatcher>, task_id: &str, total: usize) {
    dispatcher.update_plan_task(task_id, |t| {
        let done = completed_count(t);
        t.running = vec![crate::task::RunningEntry {
            hostname: format!("Plan progress: {done}/{total}"),
        }];
    });
}

/// Blocks this step until the step at index `after` has produced a result
/// in this plan run's local result map, or the plan has waited 300s for it.
async fn wait_for_barrier(results: &[Option<Task>], after: usize, plan_start: Instant) -> Result<(), ConciergeError> {
    loop {
        if results.get(after).is_some_and(|r| r.is_some()) {
            return Ok(());
        }
        if plan_start.elapsed() >= SUBTASK_WAIT_LIMIT {
            return Err(ConciergeError::PlanSubtaskTimeout);
        }
        tokio::time::sleep(SUBTASK_POLL_INTERVAL).await;
    }
}

/// Evaluates a step's `if_previous_command*` condition against the result
/// table. A step with no condition always runs. A condition referencing a
/// step that was itself skipped (no recorded task) never holds.
fn condition_holds(step: &PlanTask, results: &[Option<Task>]) -> bool {
    let Some(prev_idx) = step.if_previous_command else {
        return true;
    };
    let Some(Some(prev)) = results.get(prev_idx) else {
        return false;
    };

    if let Some(cond) = step.if_previous_command_result {
        if !result_cond_holds(cond, prev) {
            return false;
        }
    }

    if let Some(substr) = &step.if_previous_output_contains {
        let output = prev
            .success
            .iter()
            .filter_map(|s| s.output.as_deref())
            .chain(prev.errors.iter().filter_map(|e| e.output.as_deref()))
            .collect::<Vec<_>>()
            .join("\n");
        if !output.contains(substr.as_str()) {
            return false;
        }
    }

    true
}

fn result_cond_holds(cond: PrevResultCond, task: &Task) -> bool {
    if task.success.is_empty() && task.errors.is_empty() {
        return false;
    }
    match cond {
        PrevResultCond::AllSuccess => task.errors.is_empty(),
        PrevResultCond::AnySuccess => !task.success.is_empty(),
        PrevResultCond::AllError => task.success.is_empty(),
        PrevResultCond::AnyError => !task.errors.is_empty(),
    }
}

/// Polls an async sub-task until it finishes, or fails with
/// [`ConciergeError::PlanSubtaskTimeout`] once the plan has waited 300s for it.
async fn wait_for_completion(dispatcher: &Arc<TaskDispatcher>, task_id: &str, plan_start: Instant) -> Result<Task, ConciergeError> {
    loop {
        if let Some(task) = dispatcher.get_task(task_id) {
            if !task.is_running() {
                return Ok(task);
            }
        }
        if plan_start.elapsed() >= SUBTASK_WAIT_LIMIT {
            return Err(ConciergeError::PlanSubtaskTimeout);
        }
        tokio::time::sleep(SUBTASK_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::process::ProcessRegistry;
    use crate::store::PersistentOrderedMap;

    fn dispatcher(json: &str) -> Arc<TaskDispatcher> {
        let config = ConfigStore::from_json_bytes(json.as_bytes()).unwrap();
        Arc::new(TaskDispatcher::new(config, Arc::new(PersistentOrderedMap::new(0)), Arc::new(ProcessRegistry::new())))
    }

    async fn poll_until_done(dispatcher: &TaskDispatcher, task_id: &str) -> Task {
        for _ in 0..200 {
            if let Some(task) = dispatcher.get_task(task_id) {
                if !task.is_running() {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("plan task {task_id} did not finish in time");
    }

    #[tokio::test]
    async fn runs_linear_plan_to_completion() {
        let json = r#"{"hosts":[{"hostname":"h1","commands":[
            {"name":"step1","type":"shell","command":"echo","arguments":["a"],"timeout":5},
            {"name":"step2","type":"shell","command":"echo","arguments":["b"],"timeout":5}
        ]}],"execution_plans":[
            {"name":"plan1","tasks":[
                {"command":"step1","hostnames":["h1"]},
                {"command":"step2","hostnames":["h1"]}
            ]}
        ]}"#;
        let d = dispatcher(json);
        let parent = PlanScheduler::start(d.clone(), "plan1").unwrap();
        let finished = poll_until_done(&d, &parent.id).await;
        let steps = finished.plan_tasks.unwrap();
        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(|s| matches!(s.status, PlanTaskStatus::Completed)));
    }

    #[tokio::test]
    async fn skips_step_when_condition_fails() {
        let json = r#"{"hosts":[{"hostname":"h1","commands":[
            {"name":"fails","type":"shell","command":"sh","arguments":["-c","exit 1"],"timeout":5},
            {"name":"ok","type":"shell","command":"echo","arguments":["done"],"timeout":5}
        ]}],"execution_plans":[
            {"name":"plan1","tasks":[
                {"command":"fails","hostnames":["h1"]},
                {"command":"ok","hostnames":["h1"],"if_previous_command":0,"if_previous_command_result":"all_success"}
            ]}
        ]}"#;
        let d = dispatcher(json);
        let parent = PlanScheduler::start(d.clone(), "plan1").unwrap();
        let finished = poll_until_done(&d, &parent.id).await;
        let steps = finished.plan_tasks.unwrap();
        assert!(matches!(steps[0].status, PlanTaskStatus::Completed));
        assert!(matches!(steps[1].status, PlanTaskStatus::Skipped));
    }

    #[tokio::test]
    async fn jump_on_error_skips_forward() {
        let json = r#"{"hosts":[{"hostname":"h1","commands":[
            {"name":"fails","type":"shell","command":"sh","arguments":["-c","exit 1"],"timeout":5},
            {"name":"skip_me","type":"shell","command":"echo","arguments":["skip"],"timeout":5},
            {"name":"land","type":"shell","command":"echo","arguments":["land"],"timeout":5}
        ]}],"execution_plans":[
            {"name":"plan1","tasks":[
                {"command":"fails","hostnames":["h1"],"on_error_jump_to":2},
                {"command":"skip_me","hostnames":["h1"]},
                {"command":"land","hostnames":["h1"]}
            ]}
        ]}"#;
        let d = dispatcher(json);
        let parent = PlanScheduler::start(d.clone(), "plan1").unwrap();
        let finished = poll_until_done(&d, &parent.id).await;
        let steps = finished.plan_tasks.unwrap();
        assert!(matches!(steps[0].status, PlanTaskStatus::Completed));
        assert!(matches!(steps[1].status, PlanTaskStatus::Scheduled));
        assert!(matches!(steps[2].status, PlanTaskStatus::Completed));
    }

    #[test]
    fn rejects_unknown_plan() {
        let d = dispatcher(r#"{"hosts":[],"execution_plans":[]}"#);
        let err = PlanScheduler::start(d, "ghost").unwrap_err();
        assert!(matches!(err, ConciergeError::ConfigInvalid(_)));
    }
}
