//! Resolves commands to scripts, stages their descriptors and runs them
//! under the process watchdog.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::domain::errors::{AgentError, AgentResult};
use crate::domain::models::command::{Command, CommandType, RoleCommand, ScriptType};
use crate::domain::models::config::Config;
use crate::domain::models::result::{CommandResult, TIMEOUT_EXIT_CODE};
use crate::domain::ports::CommandExecutor;
use crate::infrastructure::logging::SecretScrubber;
use crate::infrastructure::process::{ProcessSpec, ProcessWatchdog, RawOutcome, WatchdogSettings};
use crate::services::cluster_host_info;
use crate::services::output_window::OutputWindow;

/// Where scripts live and how they are run.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Root of the service packages.
    pub package_dir: PathBuf,
    /// Scratch directory for staged command files.
    pub tmp_dir: PathBuf,
    /// Cache directory handed to scripts.
    pub cache_dir: PathBuf,
    /// Interpreter for `PYTHON` scripts.
    pub python_interpreter: String,
    /// Shell for `SHELL` scripts.
    pub shell: String,
    /// Log level handed to scripts.
    pub script_log_level: String,
    /// Host name handed to scripts.
    pub public_hostname: String,
}

impl OrchestratorSettings {
    /// Settings for `hostname` taken from `config`.
    pub fn from_config(config: &Config, hostname: &str) -> Self {
        Self {
            package_dir: config.paths.package_dir.clone(),
            tmp_dir: config.paths.tmp_dir.clone(),
            cache_dir: config.paths.cache_dir.clone(),
            python_interpreter: config.execution.python_interpreter.clone(),
            shell: config.execution.shell.clone(),
            script_log_level: config.execution.script_log_level.clone(),
            public_hostname: hostname.to_string(),
        }
    }
}

#[derive(Default)]
struct RunningCommand {
    cancel: Option<oneshot::Sender<String>>,
    aborted: Option<String>,
}

/// One script invocation in a command's pipeline.
struct Step {
    script: PathBuf,
    base_dir: PathBuf,
}

/// Runs command scripts with their hooks under the process watchdog.
pub struct ServiceOrchestrator {
    settings: OrchestratorSettings,
    watchdog: ProcessWatchdog,
    window: OutputWindow,
    scrubber: SecretScrubber,
    running: Mutex<HashMap<u64, RunningCommand>>,
}

impl ServiceOrchestrator {
    /// Orchestrator from explicit parts.
    pub fn new(settings: OrchestratorSettings, watchdog: ProcessWatchdog, window: OutputWindow) -> Self {
        Self {
            settings,
            watchdog,
            window,
            scrubber: SecretScrubber::new(),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Orchestrator built from the agent configuration.
    pub fn from_config(config: &Config, hostname: &str) -> Self {
        let watchdog = ProcessWatchdog::new(WatchdogSettings {
            kill_grace: Duration::from_secs(config.execution.kill_grace_secs),
            reap_timeout: Duration::from_secs(config.execution.reap_timeout_secs),
        });
        Self::new(
            OrchestratorSettings::from_config(config, hostname),
            watchdog,
            OutputWindow::from(&config.execution),
        )
    }

    /// Directory the command's script is resolved against.
    pub fn base_dir(&self, cmd: &Command) -> PathBuf {
        if cmd.role_command == RoleCommand::ActionExecute {
            return self.settings.package_dir.join("custom_actions");
        }
        let folder = cmd
            .command_params
            .service_package_folder
            .clone()
            .unwrap_or_else(|| format!("services/{}/package", cmd.service_name));
        self.settings.package_dir.join(folder)
    }

    /// Absolute path of the script a command runs.
    pub fn resolve(&self, cmd: &Command) -> AgentResult<PathBuf> {
        let script = &cmd.command_params.script;
        if script.trim().is_empty() {
            return Err(AgentError::InvalidCommand(format!(
                "command {} has no script",
                cmd.task_id
            )));
        }
        let path = if cmd.role_command == RoleCommand::ActionExecute {
            let name = Path::new(script).file_name().map_or_else(
                || PathBuf::from(script),
                PathBuf::from,
            );
            self.base_dir(cmd).join("scripts").join(name)
        } else {
            self.base_dir(cmd).join(script)
        };
        if path.is_file() {
            Ok(path)
        } else {
            Err(AgentError::ScriptNotFound(path))
        }
    }

    /// Descriptor file name for a command.
    pub fn descriptor_name(cmd: &Command) -> String {
        match cmd.command_type {
            CommandType::ExecutionCommand => format!("command-{}.json", cmd.task_id),
            CommandType::AutoExecutionCommand => format!("auto_command-{}.json", cmd.task_id),
            CommandType::StatusCommand => "status_command.json".to_string(),
        }
    }

    /// Write the command descriptor, readable by the owner only.
    ///
    /// Execution commands get their `clusterHostInfo` expanded first; a
    /// malformed block fails the command before anything is written.
    pub fn stage(&self, cmd: &Command) -> AgentResult<PathBuf> {
        let mut descriptor = serde_json::to_value(cmd)?;
        if let Some(obj) = descriptor.as_object_mut() {
            if !cmd.is_status() && !cmd.cluster_host_info.is_empty() {
                let expanded = cluster_host_info::decompress(&cmd.cluster_host_info)?;
                obj.insert("clusterHostInfo".to_string(), Value::Object(expanded));
            }
            obj.insert(
                "public_hostname".to_string(),
                Value::String(self.settings.public_hostname.clone()),
            );
            if let Some(Value::Object(params)) = obj.get_mut("hostLevelParams") {
                params.insert(
                    "agentCacheDir".to_string(),
                    Value::String(self.settings.cache_dir.display().to_string()),
                );
            }
        }

        fs::create_dir_all(&self.settings.tmp_dir)?;
        let path = self.settings.tmp_dir.join(Self::descriptor_name(cmd));
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)?;
        // mode() only applies on creation; status descriptors are reused.
        file.set_permissions(Permissions::from_mode(0o600))?;
        file.write_all(&serde_json::to_vec_pretty(&descriptor)?)?;

        debug!(
            path = %path.display(),
            descriptor = %self.scrubber.scrub_json(&descriptor),
            "staged command descriptor"
        );
        Ok(path)
    }

    fn hook(&self, cmd: &Command, phase: &str, script_type: ScriptType) -> Option<Step> {
        if cmd.is_status() || cmd.role_command == RoleCommand::ActionExecute {
            return None;
        }
        let hooks = cmd.command_params.hooks_folder.as_ref()?;
        let base_dir = self
            .settings
            .package_dir
            .join(hooks)
            .join(format!("{phase}-{}", cmd.command_name()));
        let script = base_dir
            .join("scripts")
            .join(format!("hook.{}", script_type.extension()));
        script.is_file().then_some(Step { script, base_dir })
    }

    /// File the script may leave a JSON object in for the coordinator.
    pub fn structured_out_path(&self, cmd: &Command) -> PathBuf {
        let name = if cmd.is_status() {
            "structured-out-status.json".to_string()
        } else {
            format!("structured-out-{}.json", cmd.task_id)
        };
        self.settings.tmp_dir.join(name)
    }

    fn spec_for(
        &self,
        cmd: &Command,
        script_type: ScriptType,
        step: &Step,
        descriptor: &Path,
        timeout: Duration,
    ) -> ProcessSpec {
        let interpreter = match script_type {
            ScriptType::Python => &self.settings.python_interpreter,
            ScriptType::Shell => &self.settings.shell,
        };
        ProcessSpec::new(interpreter, timeout)
            .arg(step.script.as_os_str())
            .arg(cmd.command_name())
            .arg(descriptor.as_os_str())
            .arg(step.base_dir.as_os_str())
            .arg(self.structured_out_path(cmd).as_os_str())
            .arg(self.settings.script_log_level.clone())
            .arg(self.settings.tmp_dir.as_os_str())
            .working_dir(&step.base_dir)
    }

    /// Run a command with its own timeout. Never fails: every problem is
    /// reported as a FAILED result.
    pub async fn run(&self, cmd: &Command) -> CommandResult {
        self.run_with_timeout(cmd, cmd.timeout()).await
    }

    /// Like [`Self::run`], with an explicit timeout for every step.
    #[instrument(skip(self, cmd), fields(task_id = cmd.task_id, role = %cmd.role, command = %cmd.command_name()))]
    pub async fn run_with_timeout(&self, cmd: &Command, timeout: Duration) -> CommandResult {
        let Some(script_type) = ScriptType::parse(&cmd.command_params.script_type) else {
            let err = AgentError::UnknownScriptType(cmd.command_params.script_type.clone());
            warn!(error = %err, "refusing to run command");
            return CommandResult::failed(cmd, err.to_string());
        };

        let track = !cmd.is_status();
        if track {
            self.lock_running().insert(cmd.task_id, RunningCommand::default());
        }
        let result = match self.run_pipeline(cmd, script_type, timeout).await {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, "command could not be executed");
                CommandResult::failed(cmd, err.to_string())
            }
        };
        if track {
            self.lock_running().remove(&cmd.task_id);
        }
        result
    }

    async fn run_pipeline(
        &self,
        cmd: &Command,
        script_type: ScriptType,
        timeout: Duration,
    ) -> AgentResult<CommandResult> {
        let main = Step {
            script: self.resolve(cmd)?,
            base_dir: self.base_dir(cmd),
        };
        let descriptor = self.stage(cmd)?;
        // Status commands share one file; never report a previous run's output.
        let structured_out = self.structured_out_path(cmd);
        match fs::remove_file(&structured_out) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let steps: Vec<Step> = [
            self.hook(cmd, "before", script_type),
            Some(main),
            self.hook(cmd, "after", script_type),
        ]
        .into_iter()
        .flatten()
        .collect();

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut last = None;

        for step in &steps {
            let cancel = match self.arm_cancel(cmd) {
                Ok(cancel) => cancel,
                Err(reason) => {
                    last = Some(aborted_outcome(reason));
                    break;
                }
            };
            // Each step gets the full timeout.
            let spec = self.spec_for(cmd, script_type, step, &descriptor, timeout);
            debug!(script = %step.script.display(), "running step");

            let outcome = self.watchdog.run(spec, cancel).await?;
            append(&mut stdout, &outcome.stdout);
            append(&mut stderr, &outcome.stderr);

            let stop = outcome.exit_code != 0;
            last = Some(outcome);
            if stop {
                break;
            }
        }

        let outcome = last.unwrap_or_else(|| aborted_outcome(String::new()));
        Ok(self
            .shape(cmd, &outcome, &stdout, &stderr)
            .with_structured_out(read_structured_out(&structured_out)))
    }

    /// Register a cancel channel for the next step, or report that the
    /// command was already aborted.
    fn arm_cancel(&self, cmd: &Command) -> Result<Option<oneshot::Receiver<String>>, String> {
        let mut running = self.lock_running();
        let Some(entry) = running.get_mut(&cmd.task_id) else {
            return Ok(None);
        };
        if let Some(reason) = &entry.aborted {
            return Err(reason.clone());
        }
        let (tx, rx) = oneshot::channel();
        entry.cancel = Some(tx);
        Ok(Some(rx))
    }

    fn shape(&self, cmd: &Command, outcome: &RawOutcome, stdout: &str, stderr: &str) -> CommandResult {
        let success = outcome.exit_code == 0;
        let mut stdout = self.window.shape(stdout, success);
        let mut stderr = self.window.shape(stderr, success);

        if outcome.timed_out {
            if let Some(note) = outcome.stderr.lines().last() {
                if !stderr.ends_with(note) {
                    append(&mut stderr, note);
                }
            }
        }
        if let Some(reason) = &outcome.cancelled {
            let note = format!("\nCommand aborted. Reason: '{reason}'");
            stdout.push_str(&note);
            stderr.push_str(&note);
        }

        let exit_code = if outcome.timed_out {
            TIMEOUT_EXIT_CODE
        } else {
            outcome.exit_code
        };
        info!(exit_code, timed_out = outcome.timed_out, "command finished");
        CommandResult::from_exit(cmd, exit_code, stdout, stderr)
    }

    /// Abort a running command. Returns whether it was running.
    pub fn cancel(&self, task_id: u64, reason: &str) -> bool {
        let mut running = self.lock_running();
        let Some(entry) = running.get_mut(&task_id) else {
            return false;
        };
        info!(task_id, reason, "cancelling command");
        entry.aborted = Some(reason.to_string());
        if let Some(tx) = entry.cancel.take() {
            // The step may have finished in the meantime.
            let _ = tx.send(reason.to_string());
        }
        true
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, HashMap<u64, RunningCommand>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The JSON object a script wrote, or `{}` when the file is missing or
/// does not hold an object.
fn read_structured_out(path: &Path) -> Value {
    let empty = || Value::Object(serde_json::Map::new());
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return empty(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read structured output");
            return empty();
        }
    };
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(value @ Value::Object(_)) => value,
        Ok(_) => {
            warn!(path = %path.display(), "structured output is not a JSON object, ignoring it");
            empty()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "malformed structured output, ignoring it");
            empty()
        }
    }
}

fn aborted_outcome(reason: String) -> RawOutcome {
    RawOutcome {
        exit_code: 1,
        stdout: String::new(),
        stderr: String::new(),
        timed_out: false,
        cancelled: Some(reason),
        pgid: None,
    }
}

fn append(buf: &mut String, text: &str) {
    if text.is_empty() {
        return;
    }
    if !buf.is_empty() && !buf.ends_with('\n') {
        buf.push('\n');
    }
    buf.push_str(text);
}

#[async_trait]
impl CommandExecutor for ServiceOrchestrator {
    async fn execute(&self, cmd: &Command) -> AgentResult<CommandResult> {
        Ok(self.run(cmd).await)
    }

    fn cancel(&self, task_id: u64, reason: &str) -> bool {
        Self::cancel(self, task_id, reason)
    }
}
