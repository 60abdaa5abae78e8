//! Bounded-parallel per-file command execution.
//!
//! Every file gets its own command built from a template. Up to
//! `max_parallel` commands run at once; a failing file never stops its
//! siblings. Results come back in input order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use crate::command::{Command, CommandRunner};
use crate::discover::FileMatch;
use crate::error::{HarvestError, HarvestResult};
use crate::report::StageOutcome;

/// Applies a per-file command to a batch of files.
pub struct PostProcessor {
    runner: Arc<dyn CommandRunner>,
    timeout: Option<Duration>,
}

impl PostProcessor {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            timeout: None,
        }
    }

    /// Per-command timeout. `None` waits indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `template(file)` for every file and wait for all of them.
    ///
    /// All commands are materialised before any starts, so a template error
    /// fails the call without side effects. Individual command failures,
    /// including a missing executable or a timeout, become
    /// [`StageOutcome::Failure`] entries.
    #[instrument(skip_all, fields(files = files.len(), max_parallel = max_parallel))]
    pub async fn apply<F>(
        &self,
        files: Vec<FileMatch>,
        template: F,
        max_parallel: usize,
    ) -> HarvestResult<Vec<(FileMatch, StageOutcome)>>
    where
        F: Fn(&FileMatch) -> HarvestResult<Command>,
    {
        if max_parallel == 0 {
            return Err(HarvestError::InvalidParallelism(max_parallel));
        }

        let commands = files
            .iter()
            .map(&template)
            .collect::<HarvestResult<Vec<_>>>()?;

        // Semaphore enforces max_parallel; it is fair, so files start in order.
        let semaphore = Arc::new(Semaphore::new(max_parallel));

        // One task per file. Each task owns the result for its own index.
        let mut slots = Vec::with_capacity(commands.len());
        for (file, command) in files.iter().zip(commands) {
            let runner = Arc::clone(&self.runner);
            let semaphore = Arc::clone(&semaphore);
            let timeout = self.timeout;
            let file = file.clone();

            slots.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                run_one(runner.as_ref(), &file, &command, timeout).await
            }));
        }

        let mut results = Vec::with_capacity(files.len());
        for (file, slot) in files.into_iter().zip(slots) {
            let outcome = match slot.await {
                Ok(outcome) => outcome,
                Err(e) => StageOutcome::failure(format!("worker task failed: {}", e)),
            };
            results.push((file, outcome));
        }

        Ok(results)
    }
}

async fn run_one(
    runner: &dyn CommandRunner,
    file: &FileMatch,
    command: &Command,
    timeout: Option<Duration>,
) -> StageOutcome {
    debug!(file = %file.path.display(), command = %command, "Processing file");

    let reason = match runner.run(command, timeout).await {
        Ok(result) if result.success() => return StageOutcome::Success,
        Ok(result) => result.failure_reason(),
        Err(e) => e.to_string(),
    };

    let failure = HarvestError::PerFileFailure {
        file: file.path.clone(),
        reason: reason.clone(),
    };
    warn!(error = %failure, "File processing failed");
    StageOutcome::Failure(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandResult, ProcessRunner};
    use async_trait::async_trait;
    use std::path::PathBuf;

    /// Fails every command whose first argument contains "bad".
    struct SelectiveRunner;

    #[async_trait]
    impl CommandRunner for SelectiveRunner {
        async fn run(
            &self,
            command: &Command,
            _timeout: Option<Duration>,
        ) -> HarvestResult<CommandResult> {
            let arg = command.arguments().first().cloned().unwrap_or_default();
            if arg.contains("missing") {
                return Err(HarvestError::ExecutableNotFound {
                    program: command.program().to_string(),
                });
            }
            if arg.contains("bad") {
                Ok(CommandResult::new(1, "", "bad input"))
            } else {
                Ok(CommandResult::new(0, "ok", ""))
            }
        }
    }

    fn files(names: &[&str]) -> Vec<FileMatch> {
        names.iter().map(|n| FileMatch::new(format!("/tmp/{}", n))).collect()
    }

    fn template(file: &FileMatch) -> HarvestResult<Command> {
        Ok(Command::new("tool", "/tmp").arg(file.path.to_string_lossy()))
    }

    #[tokio::test]
    async fn test_partial_failures_are_collected() {
        let processor = PostProcessor::new(Arc::new(SelectiveRunner));
        let input = files(&["a", "bad1", "c", "bad2", "e"]);

        let results = processor.apply(input.clone(), template, 2).await.unwrap();

        assert_eq!(results.len(), 5);
        let returned: Vec<FileMatch> = results.iter().map(|(f, _)| f.clone()).collect();
        assert_eq!(returned, input);
        let failures = results.iter().filter(|(_, o)| o.is_failure()).count();
        assert_eq!(failures, 2);
        assert_eq!(results[1].1, StageOutcome::failure("exit code 1: bad input"));
    }

    #[tokio::test]
    async fn test_runner_error_becomes_failure_entry() {
        let processor = PostProcessor::new(Arc::new(SelectiveRunner));
        let results = processor
            .apply(files(&["missing", "ok"]), template, 1)
            .await
            .unwrap();

        assert!(results[0].1.is_failure());
        assert!(results[1].1.is_success());
    }

    #[tokio::test]
    async fn test_zero_parallelism_is_rejected() {
        let processor = PostProcessor::new(Arc::new(SelectiveRunner));
        let err = processor.apply(files(&["a"]), template, 0).await.unwrap_err();
        assert!(matches!(err, HarvestError::InvalidParallelism(0)));
    }

    #[tokio::test]
    async fn test_template_error_fails_whole_call() {
        let processor = PostProcessor::new(Arc::new(SelectiveRunner));
        let failing = |f: &FileMatch| {
            if f.path.ends_with("b") {
                Err(HarvestError::InvalidTemplate("no value".to_string()))
            } else {
                template(f)
            }
        };
        let result = processor.apply(files(&["a", "b"]), failing, 2).await;
        assert!(matches!(result, Err(HarvestError::InvalidTemplate(_))));
    }

    #[tokio::test]
    async fn test_empty_input() {
        let processor = PostProcessor::new(Arc::new(SelectiveRunner));
        let results = processor.apply(Vec::new(), template, 4).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_real_processes_with_timeout() {
        let processor = PostProcessor::new(Arc::new(ProcessRunner))
            .with_timeout(Some(Duration::from_millis(300)));
        let input = vec![FileMatch::new("0"), FileMatch::new("30"), FileMatch::new("0")];
        let cwd = std::env::current_dir().expect("cwd");
        let sleep = |f: &FileMatch| {
            Ok(Command::new("sleep", cwd.clone()).arg(f.path.to_string_lossy()))
        };

        let results = processor.apply(input, sleep, 3).await.unwrap();

        assert!(results[0].1.is_success());
        assert!(results[1].1.is_failure());
        assert!(results[2].1.is_success());
        assert_eq!(results[1].0.path, PathBuf::from("30"));
    }
}
