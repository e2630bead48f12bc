//! Job submission payloads.

use std::collections::BTreeMap;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde_json::{Map, Value, json};

use super::JobId;

const FUNCTION_BOOTSTRAP_CMD: &str = "python -m multyvacinit.pybootstrap";
const FUNCTION_RESULT_SOURCE: &str = "file:/tmp/.result";
const FUNCTION_MODULE_PATH: &str = "/pymodules";
const FUNCTION_NAME_LIMIT: usize = 100;

/// Layer a job runs on, optionally mounted writable.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LayerMount {
    /// Layer name.
    pub name: String,
    /// Whether changes made by the job persist into the layer.
    pub read_write: bool,
}

impl LayerMount {
    /// Mounts `name` writable, so the job's changes persist into it.
    #[must_use]
    pub fn read_write(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            read_write: true,
        }
    }

    fn to_json(&self) -> Value {
        if self.read_write {
            json!({"name": self.name, "mount_rw": true})
        } else {
            Value::String(self.name.clone())
        }
    }
}

/// Shell command submission.
#[derive(Clone, Debug, PartialEq)]
pub struct ShellJob {
    cmd: String,
    name: Option<String>,
    core: String,
    multicore: u32,
    layer: Option<LayerMount>,
    volumes: Vec<String>,
    env: BTreeMap<String, String>,
    result_source: String,
    result_type: String,
    max_runtime: Option<u64>,
    profile: bool,
    restartable: bool,
    tags: BTreeMap<String, String>,
    depends_on: Vec<JobId>,
    stdin: Option<Vec<u8>>,
}

impl ShellJob {
    /// Starts a submission for `cmd` with the service defaults: core `c1`,
    /// one core, restartable, result read from stdout as binary.
    #[must_use]
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            name: None,
            core: String::from("c1"),
            multicore: 1,
            layer: None,
            volumes: Vec::new(),
            env: BTreeMap::new(),
            result_source: String::from("stdout"),
            result_type: String::from("binary"),
            max_runtime: None,
            profile: false,
            restartable: true,
            tags: BTreeMap::new(),
            depends_on: Vec::new(),
            stdin: None,
        }
    }

    /// Sets a human-readable job name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the core type.
    #[must_use]
    pub fn core(mut self, core: impl Into<String>) -> Self {
        self.core = core.into();
        self
    }

    /// Sets the number of cores.
    #[must_use]
    pub const fn multicore(mut self, cores: u32) -> Self {
        self.multicore = cores;
        self
    }

    /// Runs the job on a read-only layer.
    #[must_use]
    pub fn layer(mut self, name: impl Into<String>) -> Self {
        self.layer = Some(LayerMount {
            name: name.into(),
            read_write: false,
        });
        self
    }

    /// Runs the job on a layer with an explicit mount mode.
    #[must_use]
    pub fn layer_mount(mut self, mount: LayerMount) -> Self {
        self.layer = Some(mount);
        self
    }

    /// Mounts a volume into the job.
    #[must_use]
    pub fn volume(mut self, name: impl Into<String>) -> Self {
        self.volumes.push(name.into());
        self
    }

    /// Sets an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets where the result is read from (`stdout` or `file:<path>`).
    #[must_use]
    pub fn result_source(mut self, source: impl Into<String>) -> Self {
        self.result_source = source.into();
        self
    }

    /// Sets how the service encodes the result.
    #[must_use]
    pub fn result_type(mut self, result_type: impl Into<String>) -> Self {
        self.result_type = result_type.into();
        self
    }

    /// Sets the maximum runtime in minutes.
    #[must_use]
    pub const fn max_runtime(mut self, minutes: u64) -> Self {
        self.max_runtime = Some(minutes);
        self
    }

    /// Enables profiling.
    #[must_use]
    pub const fn profile(mut self, profile: bool) -> Self {
        self.profile = profile;
        self
    }

    /// Marks whether the service may restart the job after a worker failure.
    #[must_use]
    pub const fn restartable(mut self, restartable: bool) -> Self {
        self.restartable = restartable;
        self
    }

    /// Adds a metadata tag.
    #[must_use]
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Declares a dependency on another job.
    #[must_use]
    pub fn depends_on(mut self, jid: JobId) -> Self {
        self.depends_on.push(jid);
        self
    }

    /// Pipes `stdin` into the job.
    #[must_use]
    pub fn stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// Returns the environment for this submission.
    #[must_use]
    pub const fn environment(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Renders the job entry sent inside `{"jobs": [...]}`. Unset and empty
    /// fields are omitted.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut job = Map::new();
        job.insert(String::from("cmd"), Value::from(self.cmd.clone()));
        job.insert(String::from("core"), Value::from(self.core.clone()));
        job.insert(String::from("multicore"), Value::from(self.multicore));
        job.insert(String::from("profile"), Value::from(self.profile));
        job.insert(String::from("restartable"), Value::from(self.restartable));
        job.insert(
            String::from("result_source"),
            Value::from(self.result_source.clone()),
        );
        job.insert(
            String::from("result_type"),
            Value::from(self.result_type.clone()),
        );
        if let Some(name) = &self.name {
            job.insert(String::from("name"), Value::from(name.clone()));
        }
        if let Some(layer) = &self.layer {
            job.insert(String::from("layer"), layer.to_json());
        }
        if !self.volumes.is_empty() {
            job.insert(String::from("vol"), Value::from(self.volumes.clone()));
        }
        if !self.env.is_empty() {
            job.insert(String::from("env"), json!(self.env));
        }
        if let Some(minutes) = self.max_runtime {
            job.insert(String::from("max_runtime"), Value::from(minutes));
        }
        if !self.tags.is_empty() {
            job.insert(String::from("tags"), json!(self.tags));
        }
        if !self.depends_on.is_empty() {
            job.insert(String::from("depends_on"), json!(self.depends_on));
        }
        if let Some(stdin) = &self.stdin {
            job.insert(String::from("stdin"), Value::from(BASE64.encode(stdin)));
        }
        Value::Object(job)
    }
}

/// Submission of an opaque serialized function payload.
///
/// The payload is piped into the bootstrap runner on the worker, which writes
/// the serialized return value to `/tmp/.result`.
#[derive(Clone, Debug, PartialEq)]
pub struct FunctionJob {
    shell: ShellJob,
    function_name: String,
}

impl FunctionJob {
    /// Wraps a serialized payload produced by the caller.
    #[must_use]
    pub fn new(payload: impl Into<Vec<u8>>, function_name: impl Into<String>) -> Self {
        Self {
            shell: ShellJob::new(FUNCTION_BOOTSTRAP_CMD)
                .stdin(payload)
                .result_source(FUNCTION_RESULT_SOURCE)
                .result_type("pickle"),
            function_name: function_name.into(),
        }
    }

    /// Adjusts the underlying shell submission (core, volumes, tags...).
    #[must_use]
    pub fn configure(mut self, adjust: impl FnOnce(ShellJob) -> ShellJob) -> Self {
        self.shell = adjust(self.shell);
        self
    }

    /// Produces the shell submission, tagging the function name and
    /// extending `PYTHONPATH` with the module volume.
    #[must_use]
    pub fn into_shell_job(self) -> ShellJob {
        let python_path = match self.shell.environment().get("PYTHONPATH") {
            Some(existing) if !existing.is_empty() => format!("{existing}:{FUNCTION_MODULE_PATH}"),
            _ => FUNCTION_MODULE_PATH.to_owned(),
        };
        self.shell
            .env("PYTHONPATH", python_path)
            .tag("fname", truncate_function_name(&self.function_name))
    }
}

fn truncate_function_name(name: &str) -> String {
    if name.chars().count() <= FUNCTION_NAME_LIMIT {
        return name.to_owned();
    }
    let mut truncated: String = name.chars().take(FUNCTION_NAME_LIMIT - 3).collect();
    truncated.push_str("...");
    truncated
}
