//! Task records and the dispatcher that creates and fans them out.
//!
//! A [`Task`] is the one persisted record of "someone asked for this
//! command against these hosts". [`TaskDispatcher`] is the only thing
//! allowed to create one: it runs the allow-list checks first (host known,
//! MAC configured, command exposed by the host) and only builds a `Task`
//! once every host passes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{Command, ConfigStore, SocketRawMode};
use crate::error::ConciergeError;
use crate::process::{HttpClientProcess, ProcessRegistry, ProcessResult, ShellProcess, StreamFrame};
use crate::store::PersistentOrderedMap;
use crate::wol;
use crate::ws::ClientRegistry;

/// A host that finished successfully.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessEntry {
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_code: Option<i32>,
}

/// A host still in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningEntry {
    pub hostname: String,
}

/// A host that failed, or a request-level failure with no single host to blame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_code: Option<i32>,
}

/// One step's state within a persisted execution-plan parent task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanTaskStatus {
    Scheduled,
    Skipped,
    Waiting,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTaskState {
    pub index: usize,
    pub command: String,
    pub hostnames: Vec<String>,
    pub status: PlanTaskStatus,
}

/// The recorded outcome of running a command against one host.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub success: bool,
    pub response_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl From<ProcessResult> for TaskResult {
    fn from(r: ProcessResult) -> Self {
        let output = match (r.stdout.is_empty(), r.stderr.is_empty()) {
            (true, true) => None,
            (false, true) => Some(r.stdout),
            (true, false) => Some(r.stderr),
            (false, false) => Some(format!("{}\n{}", r.stdout, r.stderr)),
        };
        Self {
            success: r.success,
            response_code: r.exit_code,
            output,
            error: r.error,
        }
    }
}

/// A single dispatch: a command (or wakeup, or execution plan) run against
/// one or more hosts.
///
/// A task is running exactly as long as `running` is non-empty, which is
/// exactly as long as `end_timestamp` is `None`. `success`, `running`, and
/// `errors` together cover the task's full target host set exactly once,
/// except for an execution-plan task, whose `running` carries a single
/// synthetic progress entry instead of one entry per host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// `None` for a wakeup dispatch or an execution-plan run.
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_plan: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_tasks: Option<Vec<PlanTaskState>>,
    pub hosts: Vec<String>,
    pub params: HashMap<String, Value>,
    pub start_timestamp: i64,
    pub end_timestamp: Option<i64>,
    pub success: Vec<SuccessEntry>,
    pub running: Vec<RunningEntry>,
    pub errors: Vec<ErrorEntry>,
}

impl Task {
    /// The HTTP status a frontend should report for this task's dispatch.
    ///
    /// Derived from `errors` alone, independent of `running` — an async
    /// task that is still in flight but has already recorded a host-level
    /// error reports `400` immediately rather than waiting for completion.
    /// This keeps the response contract stable across the sync/async split.
    pub fn response_status(&self) -> u16 {
        if self.errors.is_empty() {
            200
        } else {
            400
        }
    }

    /// Whether any host (or, for a plan, the plan itself) is still in flight.
    pub fn is_running(&self) -> bool {
        !self.running.is_empty()
    }

    fn new(command: Option<&str>, hosts: Vec<String>, params: HashMap<String, Value>, now: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            command: command.map(|c| c.to_string()),
            execution_plan: None,
            plan_tasks: None,
            hosts: hosts.clone(),
            params,
            start_timestamp: now,
            end_timestamp: None,
            success: Vec::new(),
            running: hosts.into_iter().map(|hostname| RunningEntry { hostname }).collect(),
            errors: Vec::new(),
        }
    }

    fn new_plan(plan_name: &str, plan_tasks: Vec<PlanTaskState>, now: i64) -> Self {
        let total = plan_tasks.len();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            command: None,
            execution_plan: Some(plan_name.to_string()),
            plan_tasks: Some(plan_tasks),
            hosts: Vec::new(),
            params: HashMap::new(),
            start_timestamp: now,
            end_timestamp: None,
            success: Vec::new(),
            running: vec![RunningEntry {
                hostname: format!("Plan progress: 0/{total}"),
            }],
            errors: Vec::new(),
        }
    }

    fn record(&mut self, hostname: &str, result: TaskResult, now: i64) {
        self.running.retain(|r| r.hostname != hostname);
        if result.success {
            self.success.push(SuccessEntry {
                hostname: hostname.to_string(),
                output: result.output,
                response_code: result.response_code,
            });
        } else {
            self.errors.push(ErrorEntry {
                hostname: Some(hostname.to_string()),
                error: result.error.unwrap_or_else(|| "unknown error".to_string()),
                output: result.output,
                response_code: result.response_code,
            });
        }
        if self.running.is_empty() {
            self.end_timestamp = Some(now);
        }
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Validates requests against the declarative config, creates [`Task`]
/// records, and fans commands out to [`ShellProcess`]/[`HttpClientProcess`]/
/// [`wol::send`].
pub struct TaskDispatcher {
    config: RwLock<ConfigStore>,
    tasks: Arc<PersistentOrderedMap>,
    registry: Arc<ProcessRegistry>,
    streams: Option<Arc<ClientRegistry>>,
}

impl TaskDispatcher {
    pub fn new(config: ConfigStore, tasks: Arc<PersistentOrderedMap>, registry: Arc<ProcessRegistry>) -> Self {
        Self {
            config: RwLock::new(config),
            tasks,
            registry,
            streams: None,
        }
    }

    /// Attaches a [`ClientRegistry`] so shell commands with a
    /// `socket_raw_mode` other than `disabled` push their output to any
    /// WebSocket clients attached to that task/host.
    pub fn with_streams(mut self, streams: Arc<ClientRegistry>) -> Self {
        self.streams = Some(streams);
        self
    }

    fn config(&self) -> std::sync::RwLockReadGuard<'_, ConfigStore> {
        self.config.read().expect("config lock poisoned")
    }

    /// Atomically validates and swaps in a new config document.
    pub fn replace_config(&self, new_bytes: &[u8]) -> Result<(), ConciergeError> {
        self.config.write().expect("config lock poisoned").replace(new_bytes)
    }

    /// Renders the dashboard template against the current config snapshot.
    pub fn render_html(&self, template: &str) -> String {
        self.config().render_html(template)
    }

    /// The raw bytes of the backing config file, for the admin config endpoint.
    pub fn config_source_bytes(&self) -> Result<Vec<u8>, ConciergeError> {
        self.config().raw_bytes()
    }

    /// Aborts the process running for `(task_id, hostname)`, if any.
    pub fn abort(&self, task_id: &str, hostname: &str) -> bool {
        self.registry.abort(task_id, hostname)
    }

    /// Whether `command_name` resolves to an execution-plan pseudo-command.
    pub fn is_plan(&self, command_name: &str) -> bool {
        matches!(self.config().commands.get(command_name), Some(Command::Plan { .. }))
    }

    /// The `socket_raw_mode` a shell command streams with, for reporting
    /// alongside a WebSocket token. `None` for HTTP commands, plans, or
    /// unknown command names.
    pub fn socket_raw_mode_for(&self, command_name: &str) -> Option<SocketRawMode> {
        match self.config().commands.get(command_name) {
            Some(Command::Shell(c)) => Some(c.socket_raw_mode),
            _ => None,
        }
    }

    /// Builds a stream channel for `command` against `(task_id, hostname)`
    /// if it's a shell command with streaming enabled and a [`ClientRegistry`]
    /// is attached. A background task drains the channel and pushes each
    /// frame to whatever WebSocket clients are watching that host.
    fn stream_sender(
        &self,
        command: &Command,
        task_id: &str,
        hostname: &str,
    ) -> Option<tokio::sync::mpsc::UnboundedSender<StreamFrame>> {
        let streams = self.streams.clone()?;
        let Command::Shell(c) = command else { return None };
        if c.socket_raw_mode == SocketRawMode::Disabled {
            return None;
        }
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<StreamFrame>();
        let task_id = task_id.to_string();
        let hostname = hostname.to_string();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                streams.send_to(&task_id, &hostname, crate::ws::encode_stream_frame(&frame));
            }
        });
        Some(tx)
    }

    /// Flattens `name` and everything it references (recursively, in
    /// listed order, depth-first) into one compiled task sequence, then
    /// stable-sorts by `execute_at_position` where a task declares one.
    ///
    /// Self-referencing or mutually-referencing plans are rejected rather
    /// than expanded forever.
    pub fn compile_plan(&self, name: &str) -> Result<Vec<crate::config::PlanTask>, ConciergeError> {
        let config = self.config();
        let mut visited = std::collections::HashSet::new();
        let mut flat = Vec::new();
        flatten_plan(&config, name, &mut visited, &mut flat)?;

        let mut indexed: Vec<(usize, crate::config::PlanTask)> = flat.into_iter().enumerate().collect();
        indexed.sort_by_key(|(i, t)| (t.execute_at_position.unwrap_or(*i as i64), *i as i64));
        Ok(indexed.into_iter().map(|(_, t)| t).collect())
    }

    /// Creates and persists the parent task for a compiled execution plan.
    /// Used by [`crate::plan::PlanScheduler`] before it spawns the
    /// background run.
    pub fn create_plan_task(&self, plan_name: &str, compiled: &[crate::config::PlanTask]) -> Result<Task, ConciergeError> {
        let plan_tasks = compiled
            .iter()
            .enumerate()
            .map(|(index, step)| PlanTaskState {
                index,
                command: step.command.clone(),
                hostnames: step.hostnames.clone(),
                status: PlanTaskStatus::Scheduled,
            })
            .collect();
        let task = Task::new_plan(plan_name, plan_tasks, now_unix());
        self.persist(&task)?;
        Ok(task)
    }

    /// Reads, mutates, and writes back a plan's parent task under a single
    /// store lock acquisition. Used by [`crate::plan::PlanScheduler`] to
    /// advance `plan_tasks[idx]` and the synthetic progress entry as steps
    /// complete.
    pub fn update_plan_task<F>(&self, task_id: &str, f: F)
    where
        F: FnOnce(&mut Task),
    {
        let _ = self.tasks.update(task_id, |value| {
            if let Ok(mut task) = serde_json::from_value::<Task>(value.clone()) {
                f(&mut task);
                if let Ok(v) = serde_json::to_value(&task) {
                    *value = v;
                }
            }
        });
    }

    /// Marks a plan's parent task finished: clears the synthetic progress
    /// entry, stamps `end_timestamp`, tags it for eviction, and notifies
    /// attached WebSocket clients.
    pub fn finish_plan_task(&self, task_id: &str) {
        let now = now_unix();
        self.update_plan_task(task_id, |task| {
            task.running.clear();
            task.end_timestamp = Some(now);
        });
        let _ = self.tasks.tag_for_removal(task_id);
        if let Some(streams) = &self.streams {
            streams.broadcast_status(task_id, crate::ws::status_frame(task_id, false));
        }
    }

    /// Fetches a persisted task by id.
    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.tasks.get(task_id).and_then(|v| serde_json::from_value(v).ok())
    }

    /// All tasks, most recently created first.
    pub fn list_tasks(&self) -> Vec<Task> {
        self.tasks
            .items_reversed()
            .into_iter()
            .filter_map(|(_, v)| serde_json::from_value(v).ok())
            .collect()
    }

    fn persist(&self, task: &Task) -> Result<(), ConciergeError> {
        self.tasks.set(&task.id, serde_json::to_value(task)?)
    }

    /// Crash-recovery sweep, run once at startup: any task still `running`
    /// when the previous process exited is finalized as dropped, so a
    /// restart never leaves a task stuck open forever. Returns the number
    /// of tasks recovered.
    pub fn recover_from_restart(&self) -> usize {
        let now = now_unix();
        let mut recovered = 0;
        for key in self.tasks.keys() {
            let Some(value) = self.tasks.get(&key) else { continue };
            let Ok(mut task) = serde_json::from_value::<Task>(value) else { continue };
            if !task.is_running() {
                continue;
            }
            for entry in std::mem::take(&mut task.running) {
                task.errors.push(ErrorEntry {
                    hostname: Some(entry.hostname),
                    error: ConciergeError::ProcessDroppedAtRestart.to_string(),
                    output: None,
                    response_code: None,
                });
            }
            task.end_timestamp = Some(now);
            let Ok(value) = serde_json::to_value(&task) else { continue };
            if self.tasks.set(&key, value).is_ok() {
                let _ = self.tasks.tag_for_removal(&key);
                recovered += 1;
            }
        }
        recovered
    }

    /// Sends a Wake-on-LAN packet to each host. Validated up front: every
    /// host must be known and have a configured MAC, or the whole request
    /// is rejected before any packet is sent.
    pub async fn wakeup(&self, hosts: &[String]) -> Result<Task, ConciergeError> {
        let macs: Vec<(String, String)> = {
            let config = self.config();
            hosts
                .iter()
                .map(|h| {
                    let host = config.hosts.get(h).ok_or(ConciergeError::HostNotAllowed)?;
                    let mac = host.mac.clone().ok_or(ConciergeError::MacNotConfigured)?;
                    Ok((h.clone(), mac))
                })
                .collect::<Result<Vec<_>, ConciergeError>>()?
        };

        let mut task = Task::new(None, hosts.to_vec(), HashMap::new(), now_unix());
        for (hostname, mac) in macs {
            let result = match wol::send(&mac).await {
                Ok(()) => TaskResult {
                    success: true,
                    response_code: None,
                    output: Some("magic packet sent".to_string()),
                    error: None,
                },
                Err(e) => TaskResult {
                    success: false,
                    response_code: None,
                    output: None,
                    error: Some(e.to_string()),
                },
            };
            task.record(&hostname, result, now_unix());
        }
        self.persist(&task)?;
        Ok(task)
    }

    /// Dispatches a named shell or HTTP command against one or more hosts.
    ///
    /// Every host's allow-list error is collected before any decision is
    /// made: if every failing host's error belongs to the allow-list
    /// family (host/MAC/command not allowed), that error is returned
    /// (`403`); otherwise the request is rejected with `500` and a detail
    /// list of every host's failure. Execution-plan pseudo-commands are not
    /// dispatchable here: callers resolve plans through
    /// [`crate::plan::PlanScheduler`] instead.
    pub async fn command(
        &self,
        command_name: &str,
        hosts: &[String],
        params: HashMap<String, Value>,
    ) -> Result<Task, ConciergeError> {
        let command_def = {
            let config = self.config();

            let command_def = match config.commands.get(command_name).cloned() {
                Some(c @ (Command::Shell(_) | Command::Http(_))) => c,
                _ => return Err(ConciergeError::CommandNotAllowed),
            };

            let mut validation_errors: Vec<(String, ConciergeError)> = Vec::new();
            for h in hosts {
                match config.hosts.get(h) {
                    None => validation_errors.push((h.clone(), ConciergeError::HostNotAllowed)),
                    Some(host) => {
                        if !host.commands.iter().any(|c| c.name() == command_name) {
                            validation_errors.push((h.clone(), ConciergeError::CommandNotAllowed));
                        }
                    }
                }
            }

            if !validation_errors.is_empty() {
                if validation_errors.iter().all(|(_, e)| e.is_allow_listed()) {
                    return Err(validation_errors.into_iter().next().expect("non-empty").1);
                }
                let detail = validation_errors
                    .iter()
                    .map(|(h, e)| format!("{h}: {e}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(ConciergeError::ConfigInvalid(detail));
            }

            command_def
        };

        let is_async = match &command_def {
            Command::Shell(c) => c.timeout.is_async(),
            Command::Http(c) => c.timeout.is_async(),
            Command::Plan { .. } => unreachable!("plan commands rejected above"),
        };

        let task = Task::new(Some(command_name), hosts.to_vec(), params.clone(), now_unix());
        self.persist(&task)?;
        let task_id = task.id.clone();

        if is_async {
            for hostname in hosts.to_vec() {
                let task_id = task_id.clone();
                let command_def = command_def.clone();
                let params = params.clone();
                let tasks = self.tasks.clone();
                let registry = self.registry.clone();
                let stream_tx = self.stream_sender(&command_def, &task_id, &hostname);
                let streams = self.streams.clone();
                tokio::spawn(async move {
                    let result = run_one(&command_def, &task_id, &hostname, &params, &registry, stream_tx).await;
                    apply_result(&tasks, &task_id, &hostname, result, streams.as_ref());
                });
            }
            Ok(task)
        } else {
            let mut handles = Vec::new();
            for hostname in hosts.to_vec() {
                let command_def = command_def.clone();
                let params = params.clone();
                let task_id = task_id.clone();
                let registry = self.registry.clone();
                let stream_tx = self.stream_sender(&command_def, &task_id, &hostname);
                handles.push(tokio::spawn(async move {
                    let result = run_one(&command_def, &task_id, &hostname, &params, &registry, stream_tx).await;
                    (hostname, result)
                }));
            }
            let mut completed = self.get_task(&task_id).expect("just persisted");
            for handle in handles {
                if let Ok((hostname, result)) = handle.await {
                    completed.record(&hostname, result.into(), now_unix());
                }
            }
            self.persist(&completed)?;
            if let Some(streams) = &self.streams {
                streams.broadcast_status(&completed.id, crate::ws::status_frame(&completed.id, completed.is_running()));
            }
            Ok(completed)
        }
    }
}

async fn run_one(
    command: &Command,
    task_id: &str,
    hostname: &str,
    params: &HashMap<String, Value>,
    registry: &Arc<ProcessRegistry>,
    stream_tx: Option<tokio::sync::mpsc::UnboundedSender<crate::process::StreamFrame>>,
) -> ProcessResult {
    match command {
        Command::Shell(c) => ShellProcess::run(c, task_id, hostname, params, registry, stream_tx).await,
        Command::Http(c) => HttpClientProcess::run(c, hostname, params).await,
        Command::Plan { .. } => unreachable!("plan commands rejected before dispatch"),
    }
}

fn flatten_plan(
    config: &ConfigStore,
    name: &str,
    visited: &mut std::collections::HashSet<String>,
    out: &mut Vec<crate::config::PlanTask>,
) -> Result<(), ConciergeError> {
    if !visited.insert(name.to_string()) {
        return Err(ConciergeError::ConfigInvalid(format!(
            "execution plan '{name}' is part of a reference cycle"
        )));
    }
    let plan = config
        .execution_plans
        .get(name)
        .ok_or_else(|| ConciergeError::ConfigInvalid(format!("unknown execution plan '{name}'")))?;
    for referenced in &plan.referenced_plans {
        flatten_plan(config, referenced, visited, out)?;
    }
    out.extend(plan.tasks.iter().cloned());
    Ok(())
}

fn apply_result(
    tasks: &Arc<PersistentOrderedMap>,
    task_id: &str,
    hostname: &str,
    result: ProcessResult,
    streams: Option<&Arc<ClientRegistry>>,
) {
    let result = TaskResult::from(result);
    let mut still_running = None;
    let _ = tasks.update(task_id, |value| {
        if let Ok(mut task) = serde_json::from_value::<Task>(value.clone()) {
            task.record(hostname, result, now_unix());
            still_running = Some(task.is_running());
            if let Ok(v) = serde_json::to_value(&task) {
                *value = v;
            }
        }
    });
    if let (Some(streams), Some(running)) = (streams, still_running) {
        if !running {
            streams.broadcast_status(task_id, crate::ws::status_frame(task_id, running));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;

    fn dispatcher(json: &str) -> TaskDispatcher {
        let config = ConfigStore::from_json_bytes(json.as_bytes()).unwrap();
        TaskDispatcher::new(config, Arc::new(PersistentOrderedMap::new(0)), Arc::new(ProcessRegistry::new()))
    }

    #[tokio::test]
    async fn wakeup_rejects_unknown_host() {
        let d = dispatcher(r#"[]"#);
        let err = d.wakeup(&["ghost".to_string()]).await.unwrap_err();
        assert!(matches!(err, ConciergeError::HostNotAllowed));
    }

    #[tokio::test]
    async fn wakeup_rejects_host_without_mac() {
        let d = dispatcher(r#"[{"hostname":"h1"}]"#);
        let err = d.wakeup(&["h1".to_string()]).await.unwrap_err();
        assert!(matches!(err, ConciergeError::MacNotConfigured));
    }

    #[tokio::test]
    async fn wakeup_creates_completed_task() {
        let d = dispatcher(r#"[{"hostname":"h1","mac":"11:22:33:44:55:66"}]"#);
        let task = d.wakeup(&["h1".to_string()]).await.unwrap();
        assert!(!task.is_running());
        assert!(task.command.is_none());
        assert!(task.end_timestamp.is_some());
        assert_eq!(task.success.len() + task.errors.len(), 1);
    }

    #[tokio::test]
    async fn sync_command_runs_and_completes() {
        let json = r#"{"hosts":[{"hostname":"h1","commands":[
            {"name":"echo","type":"shell","command":"echo","arguments":["hi"],"timeout":5}
        ]}]}"#;
        let d = dispatcher(json);
        let task = d.command("echo", &["h1".to_string()], HashMap::new()).await.unwrap();
        assert!(!task.is_running());
        assert_eq!(task.response_status(), 200);
        assert_eq!(task.success.len(), 1);
        assert!(task.success[0].output.as_deref().unwrap_or("").contains("hi"));
    }

    #[tokio::test]
    async fn command_not_exposed_by_host_is_rejected() {
        let json = r#"[{"hostname":"h1","commands":[]}]"#;
        let d = dispatcher(json);
        let err = d.command("nope", &["h1".to_string()], HashMap::new()).await.unwrap_err();
        assert!(matches!(err, ConciergeError::CommandNotAllowed));
    }

    #[tokio::test]
    async fn every_host_failure_allow_listed_is_rejected_with_first_error() {
        let json = r#"{"hosts":[
            {"hostname":"h1","commands":[{"name":"echo","type":"shell","command":"echo","timeout":5}]},
            {"hostname":"h2","commands":[]}
        ]}"#;
        let d = dispatcher(json);
        let hosts = vec!["ghost".to_string(), "h2".to_string()];
        let err = d.command("echo", &hosts, HashMap::new()).await.unwrap_err();
        assert!(err.is_allow_listed());
        assert!(matches!(err, ConciergeError::HostNotAllowed));
    }

    #[tokio::test]
    async fn async_command_returns_before_completion() {
        let json = r#"{"hosts":[{"hostname":"h1","commands":[
            {"name":"slow","type":"shell","command":"sleep","arguments":["1"],"async_timeout":5}
        ]}]}"#;
        let d = dispatcher(json);
        let task = d.command("slow", &["h1".to_string()], HashMap::new()).await.unwrap();
        assert!(task.is_running());
        assert!(task.end_timestamp.is_none());
    }

    #[test]
    fn recover_from_restart_finalizes_running_tasks() {
        let store = Arc::new(PersistentOrderedMap::new(0));
        let d = TaskDispatcher::new(
            ConfigStore::from_json_bytes(b"[]").unwrap(),
            store.clone(),
            Arc::new(ProcessRegistry::new()),
        );
        let stuck = Task::new(Some("echo"), vec!["h1".to_string()], HashMap::new(), 1000);
        store.set(&stuck.id, serde_json::to_value(&stuck).unwrap()).unwrap();

        let recovered = d.recover_from_restart();
        assert_eq!(recovered, 1);

        let task = d.get_task(&stuck.id).unwrap();
        assert!(!task.is_running());
        assert_eq!(task.errors.len(), 1);
        assert_eq!(task.errors[0].hostname.as_deref(), Some("h1"));
        assert_eq!(task.errors[0].error, ConciergeError::ProcessDroppedAtRestart.to_string());
        assert!(task.end_timestamp.is_some());
    }
}
