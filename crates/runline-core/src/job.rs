//! Job definitions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::Event;
use crate::filter::{Filter, match_all};
use crate::parameter::Parameter;
use crate::runner::sandbox_path;
use crate::{Error, ResourceId, Result};

/// Runner used when a job does not name one.
pub const DEFAULT_RUNNER: &str = "local";

/// A job as stored for a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: ResourceId,
    pub project_id: ResourceId,
    pub creation_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub disabled: bool,
    pub spec: JobSpec,
}

impl Job {
    /// Whether an event should start an execution of this job.
    ///
    /// Disabled jobs accept nothing; otherwise every trigger filter must
    /// match the event payload.
    pub fn accepts(&self, event: &Event) -> Result<bool> {
        if self.disabled {
            return Ok(false);
        }
        match_all(self.spec.filters(), &event.data)
    }
}

/// The declarative description of a job.
///
/// Executions keep a frozen copy of the spec they were instantiated from, so
/// later edits of the job never affect running or queued executions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<Trigger>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner: Option<RunnerSpec>,
    /// Allow several executions of the job to run at the same time.
    #[serde(default)]
    pub concurrent: bool,
    /// Days executions are kept; zero falls back to the service default.
    #[serde(default)]
    pub retention: u32,
    /// Identities exported to steps, in precedence order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identities: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    pub steps: Vec<Step>,
}

impl JobSpec {
    pub fn runner_name(&self) -> &str {
        self.runner
            .as_ref()
            .map(|r| r.name.as_str())
            .unwrap_or(DEFAULT_RUNNER)
    }

    pub fn filters(&self) -> &[Filter] {
        self.trigger
            .as_ref()
            .map(|t| t.filters.as_slice())
            .unwrap_or(&[])
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Check the spec before it is stored.
    ///
    /// Jobs started by events run with default parameters only, so a trigger
    /// excludes parameters without a default.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidInput("job name cannot be empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(Error::InvalidInput(format!(
                "job {:?} has no steps",
                self.name
            )));
        }

        for filter in self.filters() {
            filter.validate()?;
        }

        for (i, parameter) in self.parameters.iter().enumerate() {
            if self.parameters[..i].iter().any(|p| p.name == parameter.name) {
                return Err(Error::InvalidInput(format!(
                    "duplicate parameter {:?}",
                    parameter.name
                )));
            }
            match &parameter.default {
                Some(default) => parameter.check_value(default)?,
                None if self.trigger.is_some() => {
                    return Err(Error::InvalidInput(format!(
                        "parameter {:?} has no default: jobs with mandatory parameters cannot have a trigger",
                        parameter.name
                    )));
                }
                None => {}
            }
        }

        for (i, name) in self.identities.iter().enumerate() {
            if self.identities[..i].contains(name) {
                return Err(Error::InvalidInput(format!("duplicate identity {:?}", name)));
            }
        }

        for (i, step) in self.steps.iter().enumerate() {
            let StepContent::Bundle(bundle) = &step.content else {
                continue;
            };
            for file in &bundle.files {
                if sandbox_path(&file.name).is_none() {
                    return Err(Error::InvalidInput(format!(
                        "invalid file name {:?} in step {}",
                        file.name,
                        i + 1
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Event subscription of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub connector: String,
    pub event: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Filter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(flatten)]
    pub content: StepContent,
    #[serde(default)]
    pub on_failure: OnFailure,
}

impl Step {
    pub fn new(content: StepContent) -> Self {
        Self {
            label: None,
            content,
            on_failure: OnFailure::default(),
        }
    }

    pub fn code(code: impl Into<String>) -> Self {
        Self::new(StepContent::Code(code.into()))
    }

    pub fn command(name: impl Into<String>, arguments: Vec<String>) -> Self {
        Self::new(StepContent::Command(StepCommand {
            name: name.into(),
            arguments,
        }))
    }

    pub fn with_on_failure(mut self, on_failure: OnFailure) -> Self {
        self.on_failure = on_failure;
        self
    }

    /// Human readable description used in logs.
    pub fn describe(&self) -> String {
        if let Some(label) = &self.label {
            return label.clone();
        }
        match &self.content {
            StepContent::Code(_) => "code".to_string(),
            StepContent::Command(c) => c.name.clone(),
            StepContent::Script(s) => s.path.clone(),
            StepContent::Bundle(b) => match &b.path {
                Some(path) => format!("{}/{}", path.trim_end_matches('/'), b.command),
                None => b.command.clone(),
            },
        }
    }
}

/// What a step runs. Exactly one kind per step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepContent {
    /// Inline program text, written to an executable file.
    Code(String),
    Command(StepCommand),
    Script(StepScript),
    Bundle(StepBundle),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCommand {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepScript {
    pub path: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
}

/// A set of files shipped with the step, one of which is executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepBundle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub files: Vec<BundleFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleFile {
    pub name: String,
    #[serde(default = "default_file_mode")]
    pub mode: u32,
    pub content: String,
}

fn default_file_mode() -> u32 {
    0o644
}

/// What happens to the execution when a step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Fail the execution and abort the remaining steps.
    #[default]
    Abort,
    /// Record the failure and run the next step.
    Continue,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_job_spec() {
        let spec: JobSpec = serde_json::from_value(json!({
            "name": "deploy",
            "trigger": {
                "connector": "github",
                "event": "push",
                "filters": [{"path": "/ref", "is_equal_to": "refs/heads/main"}]
            },
            "environment": {"STAGE": "prod"},
            "identities": ["aws"],
            "steps": [
                {"code": "make"},
                {"command": {"name": "echo", "arguments": ["done"]}, "on_failure": "continue"},
                {"script": {"path": "run.sh", "content": "#!/bin/bash\nexit 0"}},
                {"bundle": {"command": "main", "files": [{"name": "main", "mode": 493, "content": "x"}]}}
            ]
        }))
        .unwrap();

        assert_eq!(spec.runner_name(), DEFAULT_RUNNER);
        assert_eq!(spec.filters().len(), 1);
        assert_eq!(spec.steps.len(), 4);
        assert_eq!(spec.steps[0].content, StepContent::Code("make".into()));
        assert_eq!(spec.steps[0].on_failure, OnFailure::Abort);
        assert_eq!(spec.steps[1].on_failure, OnFailure::Continue);
        assert!(matches!(spec.steps[2].content, StepContent::Script(_)));
        match &spec.steps[3].content {
            StepContent::Bundle(bundle) => assert_eq!(bundle.files[0].mode, 0o755),
            other => panic!("unexpected content {:?}", other),
        }
    }

    #[test]
    fn test_spec_survives_json_storage() {
        let mut spec = JobSpec {
            name: "build".into(),
            concurrent: true,
            steps: vec![Step::code("echo hi").with_on_failure(OnFailure::Continue)],
            ..Default::default()
        };
        spec.environment.insert("A".into(), "1".into());

        let stored = serde_json::to_value(&spec).unwrap();
        assert_eq!(stored["concurrent"], json!(true));
        assert_eq!(stored["steps"][0]["code"], json!("echo hi"));
        let loaded: JobSpec = serde_json::from_value(stored).unwrap();
        assert_eq!(loaded, spec);
    }

    #[test]
    fn test_job_accepts_events() {
        let spec: JobSpec = serde_json::from_value(json!({
            "name": "on-main",
            "trigger": {
                "connector": "github",
                "event": "push",
                "filters": [
                    {"path": "/ref", "is_equal_to": "refs/heads/main"},
                    {"path": "/pusher", "does_not_match": "^bot-"}
                ]
            },
            "steps": [{"code": "true"}]
        }))
        .unwrap();
        let mut job = Job {
            id: ResourceId::new(),
            project_id: ResourceId::new(),
            creation_time: chrono::Utc::now(),
            update_time: chrono::Utc::now(),
            disabled: false,
            spec,
        };
        let event = |data| {
            Event::new(
                job.project_id,
                job.id,
                "github",
                "push",
                data,
                chrono::Utc::now(),
            )
        };

        let human = event(json!({"ref": "refs/heads/main", "pusher": "alice"}));
        let bot = event(json!({"ref": "refs/heads/main", "pusher": "bot-ci"}));
        let branch = event(json!({"ref": "refs/heads/dev", "pusher": "alice"}));

        assert!(job.accepts(&human).unwrap());
        assert!(!job.accepts(&bot).unwrap());
        assert!(!job.accepts(&branch).unwrap());

        job.disabled = true;
        assert!(!job.accepts(&human).unwrap());
    }

    #[test]
    fn test_validate_spec() {
        let valid = JobSpec {
            name: "build".into(),
            steps: vec![Step::code("make")],
            ..Default::default()
        };
        assert!(valid.validate().is_ok());

        let no_steps = JobSpec {
            steps: Vec::new(),
            ..valid.clone()
        };
        assert!(matches!(no_steps.validate(), Err(Error::InvalidInput(_))));

        let bad_filter = JobSpec {
            trigger: Some(Trigger {
                connector: "github".into(),
                event: "push".into(),
                filters: vec![Filter::new("/ref").matches("(")],
            }),
            ..valid.clone()
        };
        assert!(bad_filter.validate().is_err());

        let mandatory = JobSpec {
            trigger: Some(Trigger {
                connector: "github".into(),
                event: "push".into(),
                filters: Vec::new(),
            }),
            parameters: vec![Parameter::new(
                "target",
                crate::parameter::ParameterType::String,
            )],
            ..valid.clone()
        };
        assert!(mandatory.validate().is_err());

        let duplicate_identity = JobSpec {
            identities: vec!["aws".into(), "aws".into()],
            ..valid.clone()
        };
        assert!(duplicate_identity.validate().is_err());

        let escaping_bundle = JobSpec {
            steps: vec![Step::new(StepContent::Bundle(StepBundle {
                path: None,
                command: "run".into(),
                arguments: Vec::new(),
                files: vec![BundleFile {
                    name: "../../etc/cron.d/run".into(),
                    mode: 0o644,
                    content: String::new(),
                }],
            }))],
            ..valid
        };
        assert!(matches!(
            escaping_bundle.validate(),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_step_describe() {
        assert_eq!(Step::command("ls", vec![]).describe(), "ls");
        let mut step = Step::code("true");
        assert_eq!(step.describe(), "code");
        step.label = Some("compile".into());
        assert_eq!(step.describe(), "compile");

        let script = Step::new(StepContent::Script(StepScript {
            path: "ci/build.sh".into(),
            content: String::new(),
            arguments: Vec::new(),
        }));
        assert_eq!(script.describe(), "ci/build.sh");

        let mut bundle = StepBundle {
            path: Some("tools/".into()),
            command: "deploy".into(),
            arguments: Vec::new(),
            files: Vec::new(),
        };
        assert_eq!(
            Step::new(StepContent::Bundle(bundle.clone())).describe(),
            "tools/deploy"
        );
        bundle.path = None;
        assert_eq!(Step::new(StepContent::Bundle(bundle)).describe(), "deploy");
    }
}
