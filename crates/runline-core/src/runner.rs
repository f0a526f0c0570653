//! Runner trait and the data handed to runners.
//!
//! A runner executes the steps of one started job execution. The scheduler
//! drives it step by step and records every transition; the runner itself
//! only has to materialize the execution environment and run programs.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use crate::event::Event;
use crate::execution::{JobExecution, StepExecution};
use crate::identity::Identity;
use crate::job::StepContent;
use crate::parameter::{Parameter, ParameterValues};
use crate::project::{Project, ProjectSettings};
use crate::{Error, Result};

static SHEBANG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#!\s*(\S+)\s*(.+)?").expect("valid shebang regex"));

/// Writer receiving the output stream of a step.
pub type StepOutput = Box<dyn AsyncWrite + Send + Unpin>;

/// Error returned by a runner while executing a step.
#[derive(Debug, Error)]
pub enum StepError {
    /// The program ran and reported a failure: non-zero exit or signal.
    #[error("{0}")]
    Failure(String),

    /// The step was cancelled before completing.
    #[error("execution of step {0} interrupted")]
    Interrupted(i32),

    /// The step could not be executed at all.
    #[error("{0}")]
    Fatal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StepError {
    /// Failures are recorded on the step and subject to its `on_failure`
    /// policy; every other error fails the whole execution.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StepError::Failure(_))
    }
}

/// Trait for runner implementations. One instance per started execution.
#[async_trait]
pub trait RunnerBehaviour: Send {
    /// Prepare the execution environment before the first step runs.
    async fn init(&mut self) -> std::result::Result<(), StepError>;

    /// Run the step at `index` (0-based) to completion.
    ///
    /// Output is written to `stdout` and `stderr`; both writers must be
    /// dropped before returning. When `cancel` fires the step must stop and
    /// return [`StepError::Interrupted`].
    async fn execute_step(
        &mut self,
        index: usize,
        stdout: StepOutput,
        stderr: StepOutput,
        cancel: CancellationToken,
    ) -> std::result::Result<(), StepError>;

    /// Release everything `init` created. Errors are logged, not reported.
    async fn terminate(&mut self);
}

/// Creates runners of one kind.
pub trait RunnerFactory: Send + Sync {
    /// Name jobs use to select this runner.
    fn name(&self) -> &str;

    /// Build the runner of a started execution.
    fn create(&self, data: RunnerData) -> Result<Box<dyn RunnerBehaviour>>;
}

/// Everything a step may read about the execution that runs it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<Event>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: ParameterValues,
    /// Identities referenced by the job, by name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub identities: BTreeMap<String, Identity>,
}

/// State loaded when an execution starts, handed over to its runner.
#[derive(Debug, Clone)]
pub struct RunnerData {
    pub project: Project,
    pub project_settings: ProjectSettings,
    pub job_execution: JobExecution,
    pub step_executions: Vec<StepExecution>,
    pub context: ExecutionContext,
}

/// A file to create in the execution directory.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionFile {
    /// Path relative to the execution directory.
    pub path: PathBuf,
    pub content: Vec<u8>,
    pub mode: u32,
}

impl RunnerData {
    /// Environment of every step, `dir` being the execution directory.
    ///
    /// Later sources override earlier ones: system variables, identities in
    /// the order the job lists them, the job environment, then parameters
    /// exported as variables.
    pub fn environment(&self, dir: &Path) -> BTreeMap<String, String> {
        let je = &self.job_execution;
        let mut env = BTreeMap::from([
            ("RUNLINE".to_string(), "true".to_string()),
            ("RUNLINE_PROJECT_ID".to_string(), self.project.id.to_string()),
            ("RUNLINE_PROJECT_NAME".to_string(), self.project.name.clone()),
            ("RUNLINE_JOB_ID".to_string(), je.job_id.to_string()),
            ("RUNLINE_JOB_NAME".to_string(), je.job_spec.name.clone()),
            ("RUNLINE_JOB_EXECUTION_ID".to_string(), je.id.to_string()),
            ("RUNLINE_DIR".to_string(), dir.display().to_string()),
        ]);

        for name in &je.job_spec.identities {
            if let Some(identity) = self.context.identities.get(name) {
                env.extend(identity.environment());
            }
        }

        env.extend(je.job_spec.environment.clone());

        for parameter in &je.job_spec.parameters {
            let (Some(var), Some(value)) = (
                &parameter.environment,
                je.parameters.get(&parameter.name),
            ) else {
                continue;
            };
            env.insert(var.clone(), Parameter::value_string(value));
        }

        env
    }

    /// Files to write before the first step runs.
    pub fn files(&self) -> Result<Vec<ExecutionFile>> {
        let mut files = Vec::new();

        let context = serde_json::to_vec_pretty(&self.context)
            .map_err(|e| Error::Internal(format!("cannot encode execution context: {}", e)))?;
        files.push(ExecutionFile {
            path: PathBuf::from("context.json"),
            content: context,
            mode: 0o600,
        });

        for (i, step) in self.job_execution.job_spec.steps.iter().enumerate() {
            let step_path = Path::new("steps").join((i + 1).to_string());
            match &step.content {
                StepContent::Code(code) => files.push(self.program_file(step_path, code)),
                StepContent::Script(script) => {
                    files.push(self.program_file(step_path, &script.content))
                }
                StepContent::Bundle(bundle) => {
                    for file in &bundle.files {
                        let name = sandbox_path(&file.name).ok_or_else(|| {
                            Error::InvalidInput(format!(
                                "invalid file name {:?} in step {}",
                                file.name,
                                i + 1
                            ))
                        })?;
                        files.push(ExecutionFile {
                            path: step_path.join(name),
                            content: file.content.clone().into_bytes(),
                            mode: file.mode,
                        });
                    }
                }
                StepContent::Command(_) => {}
            }
        }

        let parameters = serde_json::to_value(&self.context.parameters)
            .map_err(|e| Error::Internal(format!("cannot encode parameters: {}", e)))?;
        push_fields(&mut files, Path::new("parameters"), &parameters);

        if let Some(event) = &self.context.event {
            push_fields(&mut files, Path::new("event"), &event.data);
        }

        for (name, identity) in &self.context.identities {
            if let Some(name) = sandbox_path(name) {
                push_fields(&mut files, &Path::new("identities").join(name), &identity.data);
            }
        }

        Ok(files)
    }

    /// Program and arguments of the step at `index`.
    pub fn step_command(&self, index: usize, dir: &Path) -> Result<(PathBuf, Vec<String>)> {
        let step = self
            .job_execution
            .job_spec
            .steps
            .get(index)
            .ok_or_else(|| Error::NotFound(format!("step {}", index + 1)))?;
        let step_path = dir.join("steps").join((index + 1).to_string());

        Ok(match &step.content {
            StepContent::Code(_) => (step_path, Vec::new()),
            StepContent::Command(command) => {
                (PathBuf::from(&command.name), command.arguments.clone())
            }
            StepContent::Script(script) => (step_path, script.arguments.clone()),
            StepContent::Bundle(bundle) => {
                (step_path.join(&bundle.command), bundle.arguments.clone())
            }
        })
    }

    fn program_file(&self, path: PathBuf, code: &str) -> ExecutionFile {
        let mut content = String::new();
        if !starts_with_shebang(code) {
            content.push_str(&self.project_settings.code_header);
        }
        content.push_str(code);

        ExecutionFile {
            path,
            content: content.into_bytes(),
            mode: 0o700,
        }
    }
}

/// Relative path built from the plain components of `name`.
///
/// Returns `None` for empty names and for names with a root, a prefix, `.`
/// or `..`: files derived from them could land outside the execution
/// directory.
pub fn sandbox_path(name: &str) -> Option<PathBuf> {
    let mut path = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => path.push(part),
            _ => return None,
        }
    }
    if path.as_os_str().is_empty() {
        None
    } else {
        Some(path)
    }
}

pub fn starts_with_shebang(code: &str) -> bool {
    SHEBANG_RE.is_match(code)
}

/// Flatten a JSON value into `path -> text` pairs, paths joined with `/`.
pub fn json_fields(value: &Value) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    collect_fields(value, String::new(), &mut fields);
    fields
}

fn collect_fields(value: &Value, key: String, fields: &mut BTreeMap<String, String>) {
    let child_key = |name: &str| {
        if key.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", key, name)
        }
    };

    match value {
        Value::Object(map) => {
            for (name, child) in map {
                collect_fields(child, child_key(name), fields);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                collect_fields(child, child_key(&i.to_string()), fields);
            }
        }
        Value::String(s) => {
            fields.insert(key, s.clone());
        }
        other => {
            fields.insert(key, other.to_string());
        }
    }
}

/// Fields whose key is not a plain relative path are skipped.
fn push_fields(files: &mut Vec<ExecutionFile>, root: &Path, value: &Value) {
    for (name, text) in json_fields(value) {
        let Some(name) = sandbox_path(&name) else {
            continue;
        };
        files.push(ExecutionFile {
            path: root.join(name),
            content: text.into_bytes(),
            mode: 0o600,
        });
    }
}
