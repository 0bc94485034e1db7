//! Declarative configuration: hosts, commands, and execution plans.
//!
//! The source loads untyped JSON and re-validates at each use site. Here,
//! validation happens exactly once, at load time, and the result is a set of
//! sum types (`Command`, `Timeout`) that downstream code can match on without
//! re-checking invariants — the "dynamic config → typed records" decision
//! from the design notes.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConciergeError;
use crate::wol::parse_mac;

/// A single configured host.
#[derive(Debug, Clone)]
pub struct Host {
    /// Unique, case-sensitive host identifier.
    pub hostname: String,
    /// Normalized `AA:BB:CC:DD:EE:FF` MAC, if Wake-on-LAN is available for this host.
    pub mac: Option<String>,
    /// Commands this host exposes, in declaration order.
    pub commands: Vec<Command>,
}

/// One of the three things a dispatch can target: a shell invocation, an
/// HTTP(S) request, or a reference to a declared execution plan.
#[derive(Debug, Clone)]
pub enum Command {
    /// A locally executed child process.
    Shell(ShellCommand),
    /// An outbound HTTP(S) request.
    Http(HttpCommand),
    /// A pseudo-command surfacing an execution plan by name.
    Plan { name: String },
}

impl Command {
    /// The command's name, regardless of variant.
    pub fn name(&self) -> &str {
        match self {
            Command::Shell(c) => &c.name,
            Command::Http(c) => &c.name,
            Command::Plan { name } => name,
        }
    }
}

/// How a shell command streams its stdout over the WebSocket gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketRawMode {
    /// No streaming; stdout/stderr are discarded.
    Disabled,
    /// Line-oriented JSON text frames.
    Cli,
    /// Binary MJPEG-style frame extraction.
    JpegStream,
}

/// Sync vs. async execution, and the wait-bound convention for each.
///
/// See the design document's Open Question #1: the sync and async
/// conventions for "no bound" are asymmetric on purpose (`0` vs `-1`) and
/// are preserved here rather than unified.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Waits synchronously. `0` means "wait forever".
    Sync(u32),
    /// Dispatches a supervisor task and returns immediately. `-1` means "wait forever".
    Async(i64),
}

impl Timeout {
    /// The wait bound to apply, or `None` if the call should block forever.
    pub fn wait_duration(&self) -> Option<Duration> {
        match self {
            Timeout::Sync(0) => None,
            Timeout::Sync(secs) => Some(Duration::from_secs(*secs as u64)),
            Timeout::Async(-1) => None,
            Timeout::Async(secs) => Some(Duration::from_secs((*secs).max(0) as u64)),
        }
    }

    /// Whether this is the async variant (dispatch returns immediately).
    pub fn is_async(&self) -> bool {
        matches!(self, Timeout::Async(_))
    }
}

/// A shell-backed command definition.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    /// Command name, unique within the merged command table.
    pub name: String,
    /// Executable or shell line to run.
    pub command: String,
    /// Arguments, each subject to literal placeholder expansion.
    pub arguments: Vec<String>,
    /// Wait-bound convention for this command.
    pub timeout: Timeout,
    /// Streaming mode for stdout.
    pub socket_raw_mode: SocketRawMode,
    /// Whether inbound WebSocket frames are relayed to the process's stdin.
    pub socket_raw_stdin: bool,
}

/// The seven HTTP methods the config schema accepts (case-insensitively).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "DELETE" => Some(Self::Delete),
            "PATCH" => Some(Self::Patch),
            "HEAD" => Some(Self::Head),
            "OPTIONS" => Some(Self::Options),
            _ => None,
        }
    }

    /// The `reqwest::Method` equivalent.
    pub fn as_reqwest(&self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Delete => reqwest::Method::DELETE,
            Self::Patch => reqwest::Method::PATCH,
            Self::Head => reqwest::Method::HEAD,
            Self::Options => reqwest::Method::OPTIONS,
        }
    }
}

/// How the payload template is rendered before being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadMode {
    /// Sent verbatim.
    Disabled,
    /// JSON-mode typed placeholder substitution.
    JsonOnly,
    /// Literal-mode substitution; unsafe because values are not JSON-escaped.
    VeryUnsafe,
}

/// An HTTP-backed command definition.
#[derive(Debug, Clone)]
pub struct HttpCommand {
    /// Command name, unique within the merged command table.
    pub name: String,
    /// URL template, subject to literal placeholder expansion.
    pub url: String,
    /// HTTP method.
    pub method: HttpMethod,
    /// Header name/value pairs, values subject to literal placeholder expansion.
    pub headers: Vec<(String, String)>,
    /// Query parameters, subject to literal placeholder expansion.
    pub query_params: HashMap<String, String>,
    /// Path parameters, subject to literal placeholder expansion.
    pub path_params: HashMap<String, String>,
    /// Request body template.
    pub payload: Option<String>,
    /// Whether `payload` is base64-encoded binary data.
    pub payload_base64_encoded: bool,
    /// Which placeholder mode to apply to `payload`.
    pub payload_placeholder_replacement: PayloadMode,
    /// Whether to skip TLS certificate validation (documented as unsafe).
    pub skip_cert_validation: bool,
    /// Wait-bound convention for this command.
    pub timeout: Timeout,
}

/// One of the four result conditions a plan branch can test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrevResultCond {
    AllSuccess,
    AnySuccess,
    AllError,
    AnyError,
}

impl PrevResultCond {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "all_success" => Some(Self::AllSuccess),
            "any_success" => Some(Self::AnySuccess),
            "all_error" => Some(Self::AllError),
            "any_error" => Some(Self::AnyError),
            _ => None,
        }
    }
}

/// One step of an execution plan.
#[derive(Debug, Clone)]
pub struct PlanTask {
    pub command: String,
    pub hostnames: Vec<String>,
    pub params: HashMap<String, Value>,
    pub execute_after: Option<i64>,
    pub execute_at_position: Option<i64>,
    pub if_previous_command: Option<usize>,
    pub if_previous_command_result: Option<PrevResultCond>,
    pub if_previous_output_contains: Option<String>,
    pub on_success_jump_to: Option<usize>,
    pub on_error_jump_to: Option<usize>,
}

/// A declarative sequence of tasks with conditions, barriers, and jumps.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub name: String,
    pub referenced_plans: Vec<String>,
    pub tasks: Vec<PlanTask>,
}

// --- Raw (untyped) document shapes, mirroring the JSON config file. ---

#[derive(Debug, Deserialize, Serialize)]
struct RawHost {
    hostname: String,
    mac: Option<String>,
    #[serde(default)]
    commands: Vec<RawCommand>,
}

#[derive(Debug, Deserialize, Serialize)]
struct RawCommand {
    name: String,
    #[serde(rename = "type")]
    type_: String,
    // shell fields
    command: Option<String>,
    #[serde(default)]
    arguments: Vec<String>,
    timeout: Option<i64>,
    async_timeout: Option<i64>,
    socket_raw_mode: Option<String>,
    #[serde(default)]
    socket_raw_stdin: bool,
    // http fields
    url: Option<String>,
    method: Option<String>,
    #[serde(default)]
    headers: Vec<RawHeader>,
    #[serde(default)]
    query_params: HashMap<String, String>,
    #[serde(default)]
    path_params: HashMap<String, String>,
    payload: Option<String>,
    #[serde(default)]
    payload_base64_encoded: bool,
    payload_placeholder_replacement: Option<String>,
    #[serde(default)]
    skip_cert_validation: bool,
}

#[derive(Debug, Deserialize, Serialize)]
struct RawHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct RawPlanTask {
    command: String,
    hostnames: Vec<String>,
    #[serde(default)]
    params: HashMap<String, Value>,
    execute_after: Option<i64>,
    execute_at_position: Option<i64>,
    if_previous_command: Option<usize>,
    if_previous_command_result: Option<String>,
    if_previous_output_contains: Option<String>,
    on_success_jump_to: Option<usize>,
    on_error_jump_to: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize)]
struct RawExecutionPlan {
    name: String,
    #[serde(default)]
    referenced_plans: Vec<String>,
    #[serde(default)]
    tasks: Vec<RawPlanTask>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
enum RawDocument {
    Full {
        hosts: Vec<RawHost>,
        #[serde(default)]
        execution_plans: Vec<RawExecutionPlan>,
    },
    HostsOnly(Vec<RawHost>),
}

/// Validated, derived view over the declarative configuration file.
pub struct ConfigStore {
    /// All hosts, keyed by hostname.
    pub hosts: HashMap<String, Host>,
    /// All commands (including plan pseudo-commands), keyed by name;
    /// name collisions across hosts keep the first-defining command.
    pub commands: HashMap<String, Command>,
    /// All execution plans, keyed by name.
    pub execution_plans: HashMap<String, ExecutionPlan>,
    source_path: Option<PathBuf>,
}

impl ConfigStore {
    /// Loads and validates the config document at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConciergeError> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let mut store = Self::from_json_bytes(&bytes)?;
        store.source_path = Some(path.to_path_buf());
        Ok(store)
    }

    /// Validates `bytes` as a config document without attaching a source path.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, ConciergeError> {
        let raw: RawDocument = serde_json::from_slice(bytes)
            .map_err(|e| ConciergeError::ConfigInvalid(format!("invalid JSON: {e}")))?;
        let (raw_hosts, raw_plans) = match raw {
            RawDocument::Full { hosts, execution_plans } => (hosts, execution_plans),
            RawDocument::HostsOnly(hosts) => (hosts, Vec::new()),
        };

        let mut plan_names = std::collections::HashSet::new();
        for plan in &raw_plans {
            if !plan_names.insert(plan.name.clone()) {
                return Err(ConciergeError::ConfigInvalid(format!(
                    "duplicate execution plan name '{}'",
                    plan.name
                )));
            }
        }

        let mut hosts = HashMap::new();
        let mut commands: HashMap<String, Command> = HashMap::new();
        for raw_host in raw_hosts {
            if let Some(mac) = &raw_host.mac {
                parse_mac(mac).map_err(|_| {
                    ConciergeError::ConfigInvalid(format!(
                        "host '{}' has an invalid MAC '{mac}'",
                        raw_host.hostname
                    ))
                })?;
            }

            let mut host_commands = Vec::with_capacity(raw_host.commands.len());
            for raw_cmd in &raw_host.commands {
                let cmd = validate_command(raw_cmd)?;
                commands.entry(cmd.name().to_string()).or_insert_with(|| cmd.clone());
                host_commands.push(cmd);
            }

            if hosts
                .insert(
                    raw_host.hostname.clone(),
                    Host {
                        hostname: raw_host.hostname.clone(),
                        mac: raw_host.mac.as_ref().map(|m| normalize_mac(m)),
                        commands: host_commands,
                    },
                )
                .is_some()
            {
                return Err(ConciergeError::ConfigInvalid(format!(
                    "duplicate hostname '{}'",
                    raw_host.hostname
                )));
            }
        }

        let mut execution_plans = HashMap::new();
        for raw_plan in raw_plans {
            for task in &raw_plan.tasks {
                if task.command.is_empty() {
                    return Err(ConciergeError::ConfigInvalid(format!(
                        "plan '{}' has a task with no command",
                        raw_plan.name
                    )));
                }
                if task.hostnames.is_empty() {
                    return Err(ConciergeError::ConfigInvalid(format!(
                        "plan '{}' has a task with no hostnames",
                        raw_plan.name
                    )));
                }
                if let Some(cond) = &task.if_previous_command_result {
                    if PrevResultCond::parse(cond).is_none() {
                        return Err(ConciergeError::ConfigInvalid(format!(
                            "plan '{}' has an unknown if_previous_command_result '{cond}'",
                            raw_plan.name
                        )));
                    }
                }
            }

            commands.entry(raw_plan.name.clone()).or_insert_with(|| Command::Plan {
                name: raw_plan.name.clone(),
            });

            execution_plans.insert(
                raw_plan.name.clone(),
                ExecutionPlan {
                    name: raw_plan.name.clone(),
                    referenced_plans: raw_plan.referenced_plans,
                    tasks: raw_plan
                        .tasks
                        .into_iter()
                        .map(|t| PlanTask {
                            command: t.command,
                            hostnames: t.hostnames,
                            params: t.params,
                            execute_after: t.execute_after,
                            execute_at_position: t.execute_at_position,
                            if_previous_command: t.if_previous_command,
                            if_previous_command_result: t
                                .if_previous_command_result
                                .as_deref()
                                .and_then(PrevResultCond::parse),
                            if_previous_output_contains: t.if_previous_output_contains,
                            on_success_jump_to: t.on_success_jump_to,
                            on_error_jump_to: t.on_error_jump_to,
                        })
                        .collect(),
                },
            );
        }

        Ok(Self {
            hosts,
            commands,
            execution_plans,
            source_path: None,
        })
    }

    /// Commands exposed by a given host, in declaration order.
    pub fn commands_for(&self, hostname: &str) -> &[Command] {
        self.hosts.get(hostname).map(|h| h.commands.as_slice()).unwrap_or(&[])
    }

    /// Renders `template`, substituting `{HOST_OPTIONS}` and `{COMMAND_OPTIONS}`.
    pub fn render_html(&self, template: &str) -> String {
        let mut hostnames: Vec<&str> = self.hosts.keys().map(String::as_str).collect();
        hostnames.sort_unstable();
        let host_options: String = hostnames
            .iter()
            .map(|h| {
                let commands: Vec<&str> = self.commands_for(h).iter().map(Command::name).collect();
                format!(
                    "<option value=\"{h}\" data-commands=\"{}\">{h}</option>",
                    commands.join(",")
                )
            })
            .collect();

        let mut command_names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        command_names.sort_unstable();
        let command_options: String = command_names
            .iter()
            .map(|c| format!("<option value=\"{c}\">{c}</option>"))
            .collect();

        template
            .replace("{HOST_OPTIONS}", &host_options)
            .replace("{COMMAND_OPTIONS}", &command_options)
    }

    /// The raw bytes of the backing config file, re-read from disk so it
    /// reflects the latest successful [`ConfigStore::replace`].
    pub fn raw_bytes(&self) -> Result<Vec<u8>, ConciergeError> {
        match &self.source_path {
            Some(path) => Ok(fs::read(path)?),
            None => Err(ConciergeError::ConfigInvalid("config has no backing file".to_string())),
        }
    }

    /// Validates `new_bytes` as a config document, then atomically replaces
    /// the file this store was loaded from (temp file + rename).
    pub fn replace(&mut self, new_bytes: &[u8]) -> Result<(), ConciergeError> {
        let replacement = Self::from_json_bytes(new_bytes)?;
        if let Some(path) = self.source_path.clone() {
            let tmp = path.with_extension("json.tmp");
            fs::write(&tmp, new_bytes)?;
            fs::rename(&tmp, &path)?;
        }
        self.hosts = replacement.hosts;
        self.commands = replacement.commands;
        self.execution_plans = replacement.execution_plans;
        Ok(())
    }
}

fn normalize_mac(mac: &str) -> String {
    let stripped: String = mac.chars().filter(|c| *c != ':' && *c != '-').collect();
    let upper = stripped.to_ascii_uppercase();
    upper
        .as_bytes()
        .chunks(2)
        .map(|c| std::str::from_utf8(c).unwrap())
        .collect::<Vec<_>>()
        .join(":")
}

fn validate_command(raw: &RawCommand) -> Result<Command, ConciergeError> {
    match raw.type_.as_str() {
        "shell" => {
            let command = raw.command.clone().ok_or_else(|| {
                ConciergeError::InvalidCommandDefinition(format!("'{}' is missing 'command'", raw.name))
            })?;
            let timeout = validate_timeout(&raw.name, raw.timeout, raw.async_timeout)?;
            let socket_raw_mode = match raw.socket_raw_mode.as_deref() {
                None | Some("disabled") => SocketRawMode::Disabled,
                Some("cli") => SocketRawMode::Cli,
                Some("jpeg_stream") => SocketRawMode::JpegStream,
                Some(other) => {
                    return Err(ConciergeError::InvalidCommandDefinition(format!(
                        "'{}' has unknown socket_raw_mode '{other}'",
                        raw.name
                    )))
                }
            };
            Ok(Command::Shell(ShellCommand {
                name: raw.name.clone(),
                command,
                arguments: raw.arguments.clone(),
                timeout,
                socket_raw_mode,
                socket_raw_stdin: raw.socket_raw_stdin,
            }))
        }
        "http" => {
            let url = raw.url.clone().ok_or_else(|| {
                ConciergeError::InvalidCommandDefinition(format!("'{}' is missing 'url'", raw.name))
            })?;
            let method = match &raw.method {
                Some(m) => HttpMethod::parse(m).ok_or_else(|| {
                    ConciergeError::InvalidCommandDefinition(format!("'{}' has unknown method '{m}'", raw.name))
                })?,
                None => HttpMethod::Get,
            };
            let payload_placeholder_replacement = match raw.payload_placeholder_replacement.as_deref() {
                None | Some("disabled") => PayloadMode::Disabled,
                Some("json_only") => PayloadMode::JsonOnly,
                Some("very_unsafe") => PayloadMode::VeryUnsafe,
                Some(other) => {
                    return Err(ConciergeError::InvalidCommandDefinition(format!(
                        "'{}' has unknown payload_placeholder_replacement '{other}'",
                        raw.name
                    )))
                }
            };
            if raw.payload_base64_encoded && payload_placeholder_replacement != PayloadMode::Disabled {
                return Err(ConciergeError::InvalidCommandDefinition(format!(
                    "'{}' cannot combine payload_base64_encoded with placeholder replacement",
                    raw.name
                )));
            }
            let timeout = if raw.timeout.is_none() && raw.async_timeout.is_none() {
                Timeout::Sync(30)
            } else {
                validate_timeout(&raw.name, raw.timeout, raw.async_timeout)?
            };
            Ok(Command::Http(HttpCommand {
                name: raw.name.clone(),
                url,
                method,
                headers: raw.headers.iter().map(|h| (h.name.clone(), h.value.clone())).collect(),
                query_params: raw.query_params.clone(),
                path_params: raw.path_params.clone(),
                payload: raw.payload.clone(),
                payload_base64_encoded: raw.payload_base64_encoded,
                payload_placeholder_replacement,
                skip_cert_validation: raw.skip_cert_validation,
                timeout,
            }))
        }
        other => Err(ConciergeError::InvalidCommandDefinition(format!(
            "'{}' has unknown type '{other}'",
            raw.name
        ))),
    }
}

fn validate_timeout(name: &str, timeout: Option<i64>, async_timeout: Option<i64>) -> Result<Timeout, ConciergeError> {
    match (timeout, async_timeout) {
        (Some(_), Some(_)) => Err(ConciergeError::InvalidTimeout(format!(
            "'{name}' may not set both timeout and async_timeout"
        ))),
        (None, None) => Err(ConciergeError::InvalidTimeout(format!(
            "'{name}' must set exactly one of timeout or async_timeout"
        ))),
        (Some(t), None) => {
            if t < 0 {
                return Err(ConciergeError::InvalidTimeout(format!(
                    "'{name}' timeout must be >= 0, got {t}"
                )));
            }
            Ok(Timeout::Sync(t as u32))
        }
        (None, Some(t)) => {
            if t < -1 {
                return Err(ConciergeError::InvalidTimeout(format!(
                    "'{name}' async_timeout must be >= -1, got {t}"
                )));
            }
            Ok(Timeout::Async(t))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_legacy_hosts_array() {
        let json = r#"[{"hostname":"h1","mac":"11:22:33:44:55:66","commands":[]}]"#;
        let store = ConfigStore::from_json_bytes(json.as_bytes()).unwrap();
        assert!(store.hosts.contains_key("h1"));
    }

    #[test]
    fn rejects_bad_mac() {
        let json = r#"[{"hostname":"h1","mac":"not-a-mac"}]"#;
        assert!(ConfigStore::from_json_bytes(json.as_bytes()).is_err());
    }

    #[test]
    fn rejects_both_timeouts() {
        let json = r#"{"hosts":[{"hostname":"h1","commands":[
            {"name":"c1","type":"shell","command":"echo","timeout":1,"async_timeout":1}
        ]}]}"#;
        assert!(ConfigStore::from_json_bytes(json.as_bytes()).is_err());
    }

    #[test]
    fn rejects_base64_with_placeholder_mode() {
        let json = r#"{"hosts":[{"hostname":"h1","commands":[
            {"name":"c1","type":"http","url":"https://<hostname>/","timeout":5,
             "payload_base64_encoded":true,"payload_placeholder_replacement":"json_only"}
        ]}]}"#;
        assert!(ConfigStore::from_json_bytes(json.as_bytes()).is_err());
    }

    #[test]
    fn first_defining_command_wins_on_name_collision() {
        let json = r#"{"hosts":[
            {"hostname":"h1","commands":[{"name":"dup","type":"shell","command":"echo a","timeout":1}]},
            {"hostname":"h2","commands":[{"name":"dup","type":"shell","command":"echo b","timeout":1}]}
        ]}"#;
        let store = ConfigStore::from_json_bytes(json.as_bytes()).unwrap();
        let Command::Shell(c) = store.commands.get("dup").unwrap() else {
            panic!("expected shell command")
        };
        assert_eq!(c.command, "echo a");
    }

    #[test]
    fn execution_plan_surfaces_as_pseudo_command() {
        let json = r#"{"hosts":[{"hostname":"h1"}],"execution_plans":[
            {"name":"plan1","tasks":[{"command":"noop","hostnames":["h1"]}]}
        ]}"#;
        let store = ConfigStore::from_json_bytes(json.as_bytes()).unwrap();
        assert!(matches!(store.commands.get("plan1"), Some(Command::Plan { .. })));
    }

    #[test]
    fn duplicate_plan_names_rejected() {
        let json = r#"{"hosts":[],"execution_plans":[
            {"name":"p","tasks":[{"command":"noop","hostnames":["h1"]}]},
            {"name":"p","tasks":[{"command":"noop","hostnames":["h1"]}]}
        ]}"#;
        assert!(ConfigStore::from_json_bytes(json.as_bytes()).is_err());
    }

    #[test]
    fn sync_zero_means_wait_forever() {
        assert!(Timeout::Sync(0).wait_duration().is_none());
        assert!(Timeout::Sync(5).wait_duration().is_some());
    }

    #[test]
    fn async_minus_one_means_wait_forever_but_zero_is_immediate() {
        assert!(Timeout::Async(-1).wait_duration().is_none());
        assert_eq!(Timeout::Async(0).wait_duration(), Some(Duration::from_secs(0)));
    }
}
