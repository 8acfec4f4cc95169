//! Audio processors: the opaque, possibly slow, possibly failing external step.
//!
//! Processors are registered explicitly per [`ProcessingType`] and handed to
//! the worker at construction.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use audioflow_core::JobId;
use audioflow_jobs::ProcessingType;

use crate::store::PipelineStore;

/// Bytes of stderr kept for operator detail.
const STDERR_TAIL: usize = 2048;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("processor failed: {0}")]
    Failed(String),

    #[error("processor io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid processor configuration: {0}")]
    Config(String),
}

/// Best-effort progress writes for one job.
///
/// Failures are logged and swallowed; progress is advisory.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: JobId,
    store: Arc<dyn PipelineStore>,
}

impl ProgressReporter {
    pub fn new(job_id: JobId, store: Arc<dyn PipelineStore>) -> Self {
        Self { job_id, store }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub async fn report(&self, progress: u8) {
        match self.store.record_progress(self.job_id, progress).await {
            Ok(changed) => debug!(job_id = %self.job_id, progress, changed, "progress"),
            Err(e) => warn!(job_id = %self.job_id, progress, error = %e, "progress write failed"),
        }
    }
}

#[async_trait]
pub trait AudioProcessor: Send + Sync {
    /// Transform `input` into `output`. May report intermediate progress.
    async fn process(&self, input: &Path, output: &Path, progress: &ProgressReporter) -> Result<(), ProcessorError>;
}

/// Explicit processing-type → processor table.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    handlers: HashMap<ProcessingType, Arc<dyn AudioProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ProcessingType, processor: Arc<dyn AudioProcessor>) {
        self.handlers.insert(kind, processor);
    }

    pub fn with(mut self, kind: ProcessingType, processor: Arc<dyn AudioProcessor>) -> Self {
        self.register(kind, processor);
        self
    }

    /// Build from command templates; optionally fill gaps with [`PassthroughProcessor`].
    pub fn from_templates(
        templates: &HashMap<ProcessingType, String>,
        passthrough_fallback: bool,
    ) -> Result<Self, ProcessorError> {
        let mut registry = Self::new();
        for kind in ProcessingType::ALL {
            match templates.get(&kind) {
                Some(template) => registry.register(kind, Arc::new(CommandProcessor::from_template(template)?)),
                None if passthrough_fallback => registry.register(kind, Arc::new(PassthroughProcessor)),
                None => {}
            }
        }
        Ok(registry)
    }

    pub fn get(&self, kind: ProcessingType) -> Option<Arc<dyn AudioProcessor>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn supports(&self, kind: ProcessingType) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn registered(&self) -> Vec<ProcessingType> {
        ProcessingType::ALL
            .into_iter()
            .filter(|k| self.handlers.contains_key(k))
            .collect()
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("registered", &self.registered())
            .finish()
    }
}

/// Runs an external command line per job.
///
/// The template is split on whitespace; `{input}` and `{output}` are replaced
/// by the job's paths. The child is killed if the worker drops the future
/// (e.g. on timeout).
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    program: String,
    args: Vec<String>,
}

impl CommandProcessor {
    pub fn from_template(template: &str) -> Result<Self, ProcessorError> {
        let mut parts = template.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| ProcessorError::Config("empty command template".into()))?;
        let args: Vec<String> = parts.collect();
        if !args.iter().any(|a| a.contains("{input}")) || !args.iter().any(|a| a.contains("{output}")) {
            return Err(ProcessorError::Config(format!(
                "command template must reference {{input}} and {{output}}: '{template}'"
            )));
        }
        Ok(Self { program, args })
    }

    fn render(&self, input: &Path, output: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|a| a.replace("{input}", &input).replace("{output}", &output))
            .collect()
    }
}

#[async_trait]
impl AudioProcessor for CommandProcessor {
    async fn process(&self, input: &Path, output: &Path, progress: &ProgressReporter) -> Result<(), ProcessorError> {
        let args = self.render(input, output);
        debug!(job_id = %progress.job_id(), program = %self.program, ?args, "spawning processor");

        let result = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if result.status.success() {
            progress.report(80).await;
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&result.stderr);
        let tail: String = {
            let chars: Vec<char> = stderr.chars().collect();
            chars[chars.len().saturating_sub(STDERR_TAIL)..].iter().collect()
        };
        Err(ProcessorError::Failed(format!(
            "{} exited with {}: {}",
            self.program,
            result.status,
            tail.trim()
        )))
    }
}

/// Copies input to output unchanged. Useful for local runs without a real engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughProcessor;

#[async_trait]
impl AudioProcessor for PassthroughProcessor {
    async fn process(&self, input: &Path, output: &Path, progress: &ProgressReporter) -> Result<(), ProcessorError> {
        progress.report(50).await;
        tokio::fs::copy(input, output).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn template_requires_both_placeholders() {
        assert!(CommandProcessor::from_template("sox {input}").is_err());
        assert!(CommandProcessor::from_template("").is_err());
        assert!(CommandProcessor::from_template("sox {input} {output} noisered").is_ok());
    }

    #[test]
    fn template_renders_paths() {
        let p = CommandProcessor::from_template("enhance --in={input} --out={output}").unwrap();
        let args = p.render(&PathBuf::from("/u/a.wav"), &PathBuf::from("/o/processed_a.wav"));
        assert_eq!(args, vec!["--in=/u/a.wav", "--out=/o/processed_a.wav"]);
    }

    #[test]
    fn registry_reports_registered_types() {
        let reg = ProcessorRegistry::new().with(ProcessingType::SpeechEnhancement, Arc::new(PassthroughProcessor));
        assert!(reg.supports(ProcessingType::SpeechEnhancement));
        assert!(!reg.supports(ProcessingType::SpeechSeparation));
        assert_eq!(reg.registered(), vec![ProcessingType::SpeechEnhancement]);
    }

    #[test]
    fn templates_take_precedence_over_passthrough() {
        let mut templates = HashMap::new();
        templates.insert(ProcessingType::SpeechSeparation, "sep {input} {output}".to_string());

        let only_templates = ProcessorRegistry::from_templates(&templates, false).unwrap();
        assert_eq!(only_templates.registered(), vec![ProcessingType::SpeechSeparation]);

        let filled = ProcessorRegistry::from_templates(&templates, true).unwrap();
        assert_eq!(filled.registered().len(), ProcessingType::ALL.len());

        templates.insert(ProcessingType::SpeechEnhancement, "broken".to_string());
        assert!(ProcessorRegistry::from_templates(&templates, false).is_err());
    }
}
