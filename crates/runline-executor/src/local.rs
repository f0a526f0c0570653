//! Local runner: steps run as subprocesses of the service.
//!
//! Each execution gets a private directory under the configured root holding
//! the execution context, step programs and field files. Steps run with that
//! directory as working directory and exactly the composed environment.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Component, Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use runline_config::LocalRunnerConfig;
use runline_core::runner::{
    ExecutionFile, RunnerBehaviour, RunnerData, RunnerFactory, StepError, StepOutput,
};
use runline_core::{Error, Result};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const LOCAL_RUNNER: &str = "local";

/// Creates [`LocalRunner`]s rooted in the configured directory.
pub struct LocalRunnerFactory {
    config: LocalRunnerConfig,
}

impl LocalRunnerFactory {
    pub fn new(config: LocalRunnerConfig) -> Self {
        Self { config }
    }
}

impl RunnerFactory for LocalRunnerFactory {
    fn name(&self) -> &str {
        LOCAL_RUNNER
    }

    fn create(&self, data: RunnerData) -> Result<Box<dyn RunnerBehaviour>> {
        let root = std::path::absolute(&self.config.root_directory).map_err(|e| {
            Error::Internal(format!(
                "cannot resolve directory {}: {}",
                self.config.root_directory.display(),
                e
            ))
        })?;
        Ok(Box::new(LocalRunner::new(data, root)))
    }
}

pub struct LocalRunner {
    data: RunnerData,
    dir: PathBuf,
    environment: BTreeMap<String, String>,
}

impl LocalRunner {
    pub fn new(data: RunnerData, root: impl AsRef<Path>) -> Self {
        let dir = root.as_ref().join(data.job_execution.id.to_string());
        let environment = data.environment(&dir);
        Self {
            data,
            dir,
            environment,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    async fn write_file(&self, file: &ExecutionFile) -> std::result::Result<(), StepError> {
        if !file
            .path
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(StepError::Fatal(format!(
                "invalid execution file path {}",
                file.path.display()
            )));
        }

        let path = self.dir.join(&file.path);
        if let Some(parent) = path.parent() {
            create_private_dir(parent).await?;
        }

        fs::write(&path, &file.content).await.map_err(|e| {
            StepError::Fatal(format!("cannot write {}: {}", path.display(), e))
        })?;
        fs::set_permissions(&path, std::fs::Permissions::from_mode(file.mode))
            .await
            .map_err(|e| {
                StepError::Fatal(format!("cannot set mode of {}: {}", path.display(), e))
            })
    }
}

#[async_trait]
impl RunnerBehaviour for LocalRunner {
    async fn init(&mut self) -> std::result::Result<(), StepError> {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StepError::Fatal(format!(
                    "cannot delete directory {}: {}",
                    self.dir.display(),
                    e
                )));
            }
        }
        create_private_dir(&self.dir).await?;

        let files = self
            .data
            .files()
            .map_err(|e| StepError::Fatal(e.to_string()))?;
        for file in &files {
            self.write_file(file).await?;
        }

        debug!(
            job_execution_id = %self.data.job_execution.id,
            directory = %self.dir.display(),
            files = files.len(),
            "Execution directory ready"
        );
        Ok(())
    }

    async fn execute_step(
        &mut self,
        index: usize,
        stdout: StepOutput,
        stderr: StepOutput,
        cancel: CancellationToken,
    ) -> std::result::Result<(), StepError> {
        let position = index as i32 + 1;
        let (program, args) = self
            .data
            .step_command(index, &self.dir)
            .map_err(|e| StepError::Fatal(e.to_string()))?;

        let mut child = Command::new(&program)
            .args(&args)
            .current_dir(&self.dir)
            .env_clear()
            .envs(&self.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                StepError::Fatal(format!("cannot start {}: {}", program.display(), e))
            })?;

        let child_stdout = child.stdout.take();
        let child_stderr = child.stderr.take();

        let outcome = {
            let io = async {
                tokio::join!(
                    child.wait(),
                    pump(child_stdout, stdout),
                    pump(child_stderr, stderr)
                )
            };
            tokio::select! {
                result = io => Some(result),
                _ = cancel.cancelled() => None,
            }
        };

        let Some((status, stdout_result, stderr_result)) = outcome else {
            info!(
                job_execution_id = %self.data.job_execution.id,
                step = position,
                "Interrupting step"
            );
            child.start_kill()?;
            child.wait().await?;
            return Err(StepError::Interrupted(position));
        };

        let status = status?;
        stdout_result?;
        stderr_result?;

        if status.success() {
            Ok(())
        } else {
            Err(StepError::Failure(exit_message(status)))
        }
    }

    async fn terminate(&mut self) {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                directory = %self.dir.display(),
                error = %e,
                "Cannot delete execution directory"
            ),
        }
    }
}

async fn create_private_dir(path: &Path) -> std::result::Result<(), StepError> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
        .await
        .map_err(|e| StepError::Fatal(format!("cannot create directory {}: {}", path.display(), e)))
}

/// Copy a child pipe into a step output until end of stream.
async fn pump<R>(reader: Option<R>, mut output: StepOutput) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    if let Some(mut reader) = reader {
        tokio::io::copy(&mut reader, &mut output).await?;
    }
    output.shutdown().await
}

/// Human readable reason of a non-successful exit.
pub fn exit_message(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) if code >= 128 => format!("program killed by signal {}", code - 128),
        (Some(code), _) => format!("program exited with status {}", code),
        (None, Some(signal)) => format!("program killed by signal {}", signal),
        (None, None) => "program terminated abnormally".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use runline_core::ResourceId;
    use runline_core::event::Event;
    use runline_core::execution::{JobExecution, NewJobExecution};
    use runline_core::job::{BundleFile, JobSpec, Step, StepBundle, StepContent};
    use runline_core::parameter::ParameterValues;
    use runline_core::project::{Project, ProjectSettings};
    use runline_core::runner::ExecutionContext;
    use serde_json::json;
    use tokio::io::AsyncReadExt;

    fn data(steps: Vec<Step>) -> RunnerData {
        let project = Project {
            id: ResourceId::new(),
            name: "main".into(),
        };
        let spec = JobSpec {
            name: "local-test".into(),
            environment: BTreeMap::from([("GREETING".to_string(), "hello".to_string())]),
            steps,
            ..Default::default()
        };
        let (job_execution, step_executions) = JobExecution::instantiate(
            NewJobExecution {
                project_id: project.id,
                job_id: ResourceId::new(),
                job_spec: spec,
                parameters: ParameterValues::new(),
                event: None,
                default_retention: None,
            },
            Utc::now(),
        );
        RunnerData {
            project_settings: ProjectSettings::new(project.id),
            project,
            job_execution,
            step_executions,
            context: ExecutionContext::default(),
        }
    }

    async fn run(
        runner: &mut LocalRunner,
        index: usize,
    ) -> (std::result::Result<(), StepError>, String, String) {
        let (stdout_w, mut stdout_r) = tokio::io::duplex(4096);
        let (stderr_w, mut stderr_r) = tokio::io::duplex(4096);
        let result = runner
            .execute_step(
                index,
                Box::new(stdout_w),
                Box::new(stderr_w),
                CancellationToken::new(),
            )
            .await;
        let mut out = String::new();
        let mut err = String::new();
        stdout_r.read_to_string(&mut out).await.unwrap();
        stderr_r.read_to_string(&mut err).await.unwrap();
        (result, out, err)
    }

    #[tokio::test]
    async fn test_init_writes_sandbox() {
        let root = tempfile::tempdir().unwrap();
        let mut runner = LocalRunner::new(data(vec![Step::code("echo hi")]), root.path());
        runner.init().await.unwrap();

        let dir = runner.directory().to_path_buf();
        let meta = std::fs::metadata(&dir).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o700);

        let step = std::fs::read_to_string(dir.join("steps/1")).unwrap();
        assert!(step.starts_with("#!/bin/sh"));
        assert!(step.ends_with("echo hi"));
        let meta = std::fs::metadata(dir.join("steps/1")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o700);

        let meta = std::fs::metadata(dir.join("context.json")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);

        runner.terminate().await;
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_event_fields_cannot_escape_sandbox() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let target = outside.path().join("written");

        let mut data = data(vec![Step::code("true")]);
        data.context.event = Some(Event::new(
            data.project.id,
            data.job_execution.job_id,
            "github",
            "push",
            json!({
                (target.display().to_string()): "absolute",
                "../../written": "parent",
                "branch": "main"
            }),
            Utc::now(),
        ));
        let mut runner = LocalRunner::new(data, root.path());
        runner.init().await.unwrap();

        let dir = runner.directory().to_path_buf();
        assert_eq!(
            std::fs::read_to_string(dir.join("event/branch")).unwrap(),
            "main"
        );
        assert!(!target.exists());
        assert!(!root.path().join("written").exists());
        assert_eq!(std::fs::read_dir(outside.path()).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 1);

        runner.terminate().await;
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_step_output_and_environment() {
        let root = tempfile::tempdir().unwrap();
        let mut runner = LocalRunner::new(
            data(vec![Step::code(
                "echo \"$GREETING $RUNLINE_JOB_NAME\"\necho oops >&2\ntest -f \"$RUNLINE_DIR/context.json\"",
            )]),
            root.path(),
        );
        runner.init().await.unwrap();

        let (result, out, err) = run(&mut runner, 0).await;
        result.unwrap();
        assert_eq!(out, "hello local-test\n");
        assert_eq!(err, "oops\n");
        runner.terminate().await;
    }

    #[tokio::test]
    async fn test_exit_status_failure() {
        let root = tempfile::tempdir().unwrap();
        let mut runner = LocalRunner::new(
            data(vec![Step::code("exit 3"), Step::code("kill -TERM $$")]),
            root.path(),
        );
        runner.init().await.unwrap();

        let (result, _, _) = run(&mut runner, 0).await;
        match result {
            Err(StepError::Failure(message)) => {
                assert_eq!(message, "program exited with status 3")
            }
            other => panic!("unexpected result {:?}", other),
        }

        let (result, _, _) = run(&mut runner, 1).await;
        match result {
            Err(StepError::Failure(message)) => {
                assert_eq!(message, "program killed by signal 15")
            }
            other => panic!("unexpected result {:?}", other),
        }
        runner.terminate().await;
    }

    #[tokio::test]
    async fn test_missing_program_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let mut runner = LocalRunner::new(
            data(vec![Step::command("/nonexistent/program", Vec::new())]),
            root.path(),
        );
        runner.init().await.unwrap();

        let (result, _, _) = run(&mut runner, 0).await;
        assert!(matches!(result, Err(StepError::Fatal(_))));
        runner.terminate().await;
    }

    #[tokio::test]
    async fn test_bundle_step() {
        let root = tempfile::tempdir().unwrap();
        let bundle = StepBundle {
            path: Some("tools".into()),
            command: "run.sh".into(),
            arguments: vec!["world".into()],
            files: vec![BundleFile {
                name: "run.sh".into(),
                mode: 0o755,
                content: "#!/bin/sh\necho \"hello $1\"\n".into(),
            }],
        };
        let mut runner = LocalRunner::new(
            data(vec![Step::new(StepContent::Bundle(bundle))]),
            root.path(),
        );
        runner.init().await.unwrap();

        let (result, out, _) = run(&mut runner, 0).await;
        result.unwrap();
        assert_eq!(out, "hello world\n");
        runner.terminate().await;
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_step() {
        let root = tempfile::tempdir().unwrap();
        let mut runner = LocalRunner::new(data(vec![Step::code("while :; do :; done")]), root.path());
        runner.init().await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = runner
            .execute_step(
                0,
                Box::new(tokio::io::sink()),
                Box::new(tokio::io::sink()),
                cancel,
            )
            .await;
        assert!(matches!(result, Err(StepError::Interrupted(1))));
        runner.terminate().await;
    }
}
