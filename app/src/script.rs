// ==============================================================================
// script.rs - External Compute Job Protocol
// ==============================================================================
// Description: Renders an analysis script from a template, executes it in an
//              isolated job directory and parses the results it leaves behind
// Created: 2026-02-10
// Modified: 2026-08-30
// Version: 1.0.0
// ==============================================================================

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::TaskError;
use crate::models::{TaskRun, WorkingDataset};
use crate::task::{AnalysisTask, TaskContext, TaskState};

/// Default wall-clock limit for one engine invocation.
pub const DEFAULT_ENGINE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Filesystem layout for one engine invocation.
///
/// Each run gets its own directory keyed on the run id, so concurrent jobs
/// never share inputs. The engine writes its own log next to the script
/// with an `out` suffix, and its results under `output/`.
#[derive(Debug, Clone)]
pub struct JobPaths {
    pub job_dir: PathBuf,
    pub output_dir: PathBuf,
    pub script_path: PathBuf,
    pub log_path: PathBuf,
}

impl JobPaths {
    pub fn build(work_root: impl AsRef<Path>, run: &TaskRun) -> Result<Self, TaskError> {
        let job_name = format!(
            "{}_{}",
            run.class_name.to_lowercase(),
            run.id.simple()
        );
        let job_dir = work_root.as_ref().join(job_name);
        let output_dir = job_dir.join("output");
        std::fs::create_dir_all(&output_dir)?;
        let script_path = job_dir.join("script.R");
        let mut log_name = script_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "script.R".to_string());
        log_name.push_str("out");
        let log_path = job_dir.join(log_name);
        Ok(Self {
            job_dir,
            output_dir,
            script_path,
            log_path,
        })
    }

    pub fn results_path(&self) -> PathBuf {
        self.output_dir.join("results.json")
    }
}

/// Substitute `{{ name }}` placeholders with the rendered parameter values.
/// Unmatched placeholders are left in place for the engine to fail on.
pub fn render_template(template: &str, params: &Map<String, Value>) -> String {
    let mut rendered = template.to_string();
    for (key, value) in params {
        let replacement = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        for pattern in [format!("{{{{ {} }}}}", key), format!("{{{{{}}}}}", key)] {
            rendered = rendered.replace(&pattern, &replacement);
        }
    }
    rendered
}

/// Run the rendered script under the engine executable.
///
/// The engine runs with the job directory as its working directory and is
/// killed if it outlives the timeout. On a non-zero exit or a timeout the
/// engine's own log is captured into the error so the failure is
/// diagnosable from the run record alone.
pub async fn execute_script(
    engine_exec_path: &str,
    paths: &JobPaths,
    timeout: Duration,
) -> Result<(), TaskError> {
    info!(
        "Executing {} {}",
        engine_exec_path,
        paths.script_path.display()
    );
    let mut command = Command::new(engine_exec_path);
    command
        .arg(&paths.script_path)
        .current_dir(&paths.job_dir)
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(TaskError::EngineFailure {
                log: format!(
                    "engine timed out after {}s; partial log: {}",
                    timeout.as_secs(),
                    read_engine_log(paths)
                ),
            });
        }
    };

    if !output.status.success() {
        let mut log = read_engine_log(paths);
        if log.is_empty() {
            log = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
        }
        return Err(TaskError::EngineFailure { log });
    }
    debug!("Engine exited cleanly");
    Ok(())
}

fn read_engine_log(paths: &JobPaths) -> String {
    std::fs::read_to_string(&paths.log_path).unwrap_or_default()
}

/// Read and decode the engine's results file.
///
/// The engine serializers sometimes wrap the payload in a one-element array
/// or emit it as a JSON-encoded string; both wrappers are unwrapped. A
/// missing file after a clean exit is not an error: the script ran its side
/// effects and simply declared no output.
pub fn parse_results(paths: &JobPaths) -> Result<Option<Value>, TaskError> {
    let path = paths.results_path();
    if !path.is_file() {
        warn!("No results file at {}", path.display());
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path)?;
    let mut value: Value = serde_json::from_str(&raw)?;
    loop {
        value = match value {
            Value::Array(mut items) if items.len() == 1 => items.remove(0),
            Value::String(s) => match serde_json::from_str::<Value>(&s) {
                Ok(inner) => inner,
                Err(_) => break Ok(Some(Value::String(s))),
            },
            other => break Ok(Some(other)),
        };
    }
}

/// Task that delegates its analysis to an external engine script.
///
/// The working dataset is materialized as CSV inputs in the job directory,
/// the script template is rendered with the merged parameter map, and the
/// decoded results become the run's declared output.
pub struct ScriptTask {
    ctx: TaskContext,
    state: TaskState,
    engine_exec_path: String,
    work_root: PathBuf,
    template: String,
    params: Map<String, Value>,
    timeout: Duration,
}

impl ScriptTask {
    pub fn new(
        ctx: TaskContext,
        run: TaskRun,
        engine_exec_path: impl Into<String>,
        work_root: impl Into<PathBuf>,
        template: impl Into<String>,
        params: Map<String, Value>,
    ) -> Result<Self, TaskError> {
        ctx.config.validate()?;
        Ok(Self {
            ctx,
            state: TaskState::new(run),
            engine_exec_path: engine_exec_path.into(),
            work_root: work_root.into(),
            template: template.into(),
            params,
            timeout: DEFAULT_ENGINE_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn write_inputs(data: &WorkingDataset, paths: &JobPaths) -> Result<(), TaskError> {
        data.sample_metadata
            .write_csv(paths.job_dir.join("sample_metadata.csv"))?;
        data.feature_metadata
            .write_csv(paths.job_dir.join("feature_metadata.csv"))?;
        data.intensity_matrix
            .write_csv(paths.job_dir.join("intensity_data.csv"))?;
        Ok(())
    }
}

#[async_trait]
impl AnalysisTask for ScriptTask {
    fn split(&mut self) -> (&TaskContext, &mut TaskState) {
        (&self.ctx, &mut self.state)
    }

    async fn run_analysis(&mut self) -> Result<(), TaskError> {
        let paths = JobPaths::build(&self.work_root, &self.state.run)?;
        Self::write_inputs(&self.state.data, &paths)?;

        let mut params = self.params.clone();
        params.insert(
            "engine_exec_path".to_string(),
            json!(self.engine_exec_path),
        );
        params.insert("job_folder".to_string(), json!(paths.job_dir));
        params.insert("output_folder".to_string(), json!(paths.output_dir));
        params.insert(
            "sample_metadata_path".to_string(),
            json!(paths.job_dir.join("sample_metadata.csv")),
        );
        params.insert(
            "feature_metadata_path".to_string(),
            json!(paths.job_dir.join("feature_metadata.csv")),
        );
        params.insert(
            "intensity_data_path".to_string(),
            json!(paths.job_dir.join("intensity_data.csv")),
        );
        for (key, value) in self.ctx.config.to_args() {
            params.entry(key).or_insert(value);
        }

        let script = render_template(&self.template, &params);
        std::fs::write(&paths.script_path, script)?;
        debug!("Wrote script to {}", paths.script_path.display());

        execute_script(&self.engine_exec_path, &paths, self.timeout).await?;

        // keep the engine log on the run record for later inspection
        self.state.run.args.insert(
            "engine_log_path".to_string(),
            json!(paths.log_path.to_string_lossy()),
        );
        let log = read_engine_log(&paths);
        if !log.is_empty() {
            self.state.run.args.insert("engine_log".to_string(), json!(log));
        }

        self.state.results = parse_results(&paths)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryResultCache;
    use crate::dataset::{InMemoryDatasetSource, QueryData};
    use crate::models::AnalysisConfig;
    use crate::registry::InMemoryRunRegistry;
    use crate::table::{DataTable, IntensityMatrix};
    use crate::task::execute_task;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn context_with_query(query_id: i64) -> TaskContext {
        let mut sample_metadata = DataTable::new(vec!["Sample ID".to_string()]);
        sample_metadata.push_row(vec![json!("S1")]).unwrap();
        let mut feature_metadata = DataTable::new(vec!["feature_id".to_string()]);
        feature_metadata.push_row(vec![json!(10)]).unwrap();
        let source = InMemoryDatasetSource::new();
        source.insert(
            query_id,
            QueryData {
                sample_metadata,
                feature_metadata,
                intensity: IntensityMatrix::new(vec![vec![1.0]]).unwrap(),
                feature_id_matrix: None,
            },
        );
        TaskContext {
            cache: Arc::new(InMemoryResultCache::new()),
            dataset_source: Arc::new(source),
            registry: Arc::new(InMemoryRunRegistry::new()),
            config: AnalysisConfig::default(),
        }
    }

    #[test]
    fn test_render_template() {
        let mut params = Map::new();
        params.insert("output_folder".to_string(), json!("/tmp/out"));
        params.insert("n_components".to_string(), json!(3));
        let rendered = render_template(
            "write({{ n_components }}, '{{ output_folder }}/r.json'); {{ missing }}",
            &params,
        );
        assert_eq!(rendered, "write(3, '/tmp/out/r.json'); {{ missing }}");
    }

    #[test]
    fn test_parse_results_unwraps_wrappers() {
        let dir = tempdir().unwrap();
        let run = TaskRun::new("RunPCA", Some(1));
        let paths = JobPaths::build(dir.path(), &run).unwrap();

        // jsonlite-style: a one-element array holding a JSON-encoded string
        std::fs::write(
            paths.results_path(),
            r#"["{\"scores\": [1.5, 2.5]}"]"#,
        )
        .unwrap();
        let results = parse_results(&paths).unwrap().unwrap();
        assert_eq!(results["scores"], json!([1.5, 2.5]));
    }

    #[test]
    fn test_parse_results_missing_file_is_none() {
        let dir = tempdir().unwrap();
        let run = TaskRun::new("RunPCA", Some(1));
        let paths = JobPaths::build(dir.path(), &run).unwrap();
        assert!(parse_results(&paths).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_engine_failure_carries_log() {
        let dir = tempdir().unwrap();
        let ctx = context_with_query(1);
        let run = TaskRun::new("RunPCA", Some(1));

        let mut task = ScriptTask::new(
            ctx,
            run,
            "/bin/sh",
            dir.path(),
            "echo 'Error in loess: singular' >&2\nexit 1\n",
            Map::new(),
        )
        .unwrap();
        let err = execute_task(&mut task).await.unwrap_err();
        match err {
            TaskError::EngineFailure { log } => assert!(log.contains("singular")),
            other => panic!("expected engine failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_clean_exit_without_results_succeeds() {
        let dir = tempdir().unwrap();
        let ctx = context_with_query(1);
        let run = TaskRun::new("RunPCA", Some(1));

        let mut task = ScriptTask::new(
            ctx,
            run,
            "/bin/sh",
            dir.path(),
            "exit 0\n",
            Map::new(),
        )
        .unwrap();
        let results = execute_task(&mut task).await.unwrap();
        assert!(results.is_none());
    }

    #[tokio::test]
    async fn test_results_become_declared_output() {
        let dir = tempdir().unwrap();
        let ctx = context_with_query(1);
        let run = TaskRun::new("RunPCA", Some(1));
        let output_key = run.task_output_cache_key();

        let mut task = ScriptTask::new(
            ctx.clone(),
            run,
            "/bin/sh",
            dir.path(),
            "echo '{\"variance_explained\": 0.82}' > {{ output_folder }}/results.json\n",
            Map::new(),
        )
        .unwrap();
        let results = execute_task(&mut task).await.unwrap().unwrap();
        assert_eq!(results["variance_explained"], json!(0.82));

        let cached = ctx.cache.get(&output_key).await.unwrap().unwrap();
        assert_eq!(cached["variance_explained"], json!(0.82));
    }

    #[tokio::test]
    async fn test_timeout_kills_engine() {
        let dir = tempdir().unwrap();
        let ctx = context_with_query(1);
        let run = TaskRun::new("RunPCA", Some(1));

        let mut task = ScriptTask::new(
            ctx,
            run,
            "/bin/sh",
            dir.path(),
            "sleep 30\n",
            Map::new(),
        )
        .unwrap()
        .with_timeout(Duration::from_millis(200));
        let err = execute_task(&mut task).await.unwrap_err();
        match err {
            TaskError::EngineFailure { log } => assert!(log.contains("timed out")),
            other => panic!("expected engine failure, got {:?}", other),
        }
    }
}
