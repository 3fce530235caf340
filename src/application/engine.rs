//! # Execution Engine
//!
//! Applies the steps of a turn to the sandbox, in order, once per revision.
//!
//! Any number of callers may ask for a drain at any time. Requests are queued and the first
//! caller to take the engine lock works the queue until it is empty; everyone else returns
//! straight away. Steps are executed strictly one after another, front to back, because a
//! later step (a command, say) usually depends on an earlier one (the file it reads).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use crate::application::reconciler::TurnHandle;
use crate::application::shadow::ShadowFileStore;
use crate::domain::config::EngineConfig;
use crate::domain::error::{EngineError, SandboxError};
use crate::domain::paths;
use crate::domain::traits::{Sandbox, SandboxSlot};
use crate::domain::types::{OperationKind, Step, StepOutcome};

/// A line of output from a command the engine is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub turn_id: String,
    pub command: String,
    pub line: String,
}

/// What one call to `drain` did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Times the sandbox was found not ready.
    pub not_ready: u32,
}

impl DrainReport {
    fn record(&mut self, outcome: &StepOutcome) {
        self.attempted += 1;
        if *outcome == StepOutcome::Succeeded {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }
}

struct SandboxNotReady;

pub struct ExecutionEngine {
    sandbox: SandboxSlot,
    shadow: ShadowFileStore,
    config: EngineConfig,
    lock: Mutex<()>,
    queue: StdMutex<VecDeque<Arc<TurnHandle>>>,
    abort: watch::Sender<u64>,
    output: Option<mpsc::UnboundedSender<CommandOutput>>,
}

impl ExecutionEngine {
    pub fn new(sandbox: SandboxSlot, shadow: ShadowFileStore, config: EngineConfig) -> Self {
        let (abort, _rx) = watch::channel(0);
        Self {
            sandbox,
            shadow,
            config,
            lock: Mutex::new(()),
            queue: StdMutex::new(VecDeque::new()),
            abort,
            output: None,
        }
    }

    /// Forwards command output to `sink` in addition to the log.
    pub fn with_output(mut self, sink: mpsc::UnboundedSender<CommandOutput>) -> Self {
        self.output = Some(sink);
        self
    }

    pub fn shadow(&self) -> &ShadowFileStore {
        &self.shadow
    }

    /// Kills the commands running right now. Commands started afterwards are unaffected.
    pub fn abort_running(&self) {
        self.abort.send_modify(|generation| *generation += 1);
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Arc<TurnHandle>>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enqueue(&self, turn: &Arc<TurnHandle>) {
        let mut queue = self.queue();
        if !queue.iter().any(|t| Arc::ptr_eq(t, turn)) {
            queue.push_back(turn.clone());
        }
    }

    /// Applies every due step of `turn`, plus any turns queued by concurrent callers.
    ///
    /// Returns immediately if another drain is in flight; that drain picks the turn up.
    /// Fails only if the sandbox stays unavailable for `max_ready_attempts` attempts.
    pub async fn drain(&self, turn: &Arc<TurnHandle>) -> Result<DrainReport, EngineError> {
        self.enqueue(turn);
        let mut report = DrainReport::default();

        loop {
            let Ok(guard) = self.lock.try_lock() else {
                debug!("Drain already in flight, turn {} queued", turn.id());
                return Ok(report);
            };
            let result = self.drain_queue(&mut report).await;
            drop(guard);

            match result {
                Ok(()) => {
                    // Something may have been queued after the queue emptied but before unlocking.
                    let idle = self.queue().is_empty();
                    if idle {
                        return Ok(report);
                    }
                }
                Err(SandboxNotReady) => {
                    report.not_ready += 1;
                    if report.not_ready >= self.config.max_ready_attempts {
                        warn!("Sandbox not ready after {} attempts, giving up", report.not_ready);
                        return Err(EngineError::SandboxUnavailable {
                            attempts: report.not_ready,
                        });
                    }
                    debug!(
                        "Sandbox not ready (attempt {}/{}), retrying in {}ms",
                        report.not_ready, self.config.max_ready_attempts, self.config.retry_delay_ms
                    );
                    self.wait_for_sandbox().await;
                }
            }
        }
    }

    async fn wait_for_sandbox(&self) {
        let mut ready = self.sandbox.subscribe();
        let _ = tokio::time::timeout(
            self.config.retry_delay(),
            ready.wait_for(|sandbox| sandbox.is_some()),
        )
        .await;
    }

    async fn drain_queue(&self, report: &mut DrainReport) -> Result<(), SandboxNotReady> {
        loop {
            let Some(turn) = self.queue().pop_front() else {
                return Ok(());
            };
            if let Err(not_ready) = self.drain_turn(&turn, report).await {
                self.queue().push_front(turn);
                return Err(not_ready);
            }
        }
    }

    /// Runs the first due step until none is left. Re-scanning from the front after every
    /// step picks up steps that became due while the previous one was running.
    async fn drain_turn(
        &self,
        turn: &TurnHandle,
        report: &mut DrainReport,
    ) -> Result<(), SandboxNotReady> {
        loop {
            let snapshot = turn.snapshot();
            let Some((index, step)) = snapshot.steps.iter().enumerate().find(|(_, s)| s.is_due())
            else {
                return Ok(());
            };
            let Some(sandbox) = self.sandbox.current() else {
                return Err(SandboxNotReady);
            };

            let outcome = self.execute(sandbox.as_ref(), turn.id(), step).await;
            report.record(&outcome);
            turn.mark_attempted(index, step.revision, outcome);
        }
    }

    async fn execute(&self, sandbox: &dyn Sandbox, turn_id: &str, step: &Step) -> StepOutcome {
        let label = step.label();
        let result = match step.kind {
            OperationKind::CreateFile | OperationKind::UpdateFile => {
                self.write_file(sandbox, step).await.map(|()| StepOutcome::Succeeded)
            }
            OperationKind::DeleteFile => {
                self.delete_file(sandbox, step).await.map(|()| StepOutcome::Succeeded)
            }
            OperationKind::RunCommand => self.run_command(sandbox, turn_id, step).await,
        };

        match result {
            Ok(StepOutcome::Succeeded) => {
                info!("Applied: {}", label);
                StepOutcome::Succeeded
            }
            Ok(outcome) => {
                warn!("Step `{}` did not succeed: {:?}", label, outcome);
                outcome
            }
            Err(e) => {
                warn!("Step `{}` failed: {:#}", label, e);
                StepOutcome::Failed(format!("{e:#}"))
            }
        }
    }

    async fn write_file(&self, sandbox: &dyn Sandbox, step: &Step) -> Result<()> {
        let path = step.file_path.as_deref().context("File step without a path")?;

        if let Some(parent) = paths::parent(path) {
            match sandbox.mkdir(parent, true).await {
                Ok(()) | Err(SandboxError::AlreadyExists(_)) => {}
                Err(e) => debug!("mkdir {} failed, writing anyway: {}", parent, e),
            }
        }

        sandbox
            .write_file(path, Bytes::from(step.content.clone()))
            .await
            .with_context(|| format!("Failed to write {path}"))?;
        self.shadow.write(path, &step.content).await;
        Ok(())
    }

    async fn delete_file(&self, sandbox: &dyn Sandbox, step: &Step) -> Result<()> {
        let path = step.file_path.as_deref().context("Delete step without a path")?;

        match sandbox.remove(path, true).await {
            Ok(()) | Err(SandboxError::NotFound(_)) => {}
            Err(e) => return Err(e).with_context(|| format!("Failed to delete {path}")),
        }
        self.shadow.remove(path).await;
        Ok(())
    }

    async fn run_command(
        &self,
        sandbox: &dyn Sandbox,
        turn_id: &str,
        step: &Step,
    ) -> Result<StepOutcome> {
        let command = step.command.as_deref().unwrap_or_default();
        let argv = split_command(command)?;
        let Some((program, args)) = argv.split_first() else {
            bail!("Empty command");
        };

        // Subscribe before spawning so an abort issued from here on is seen.
        let mut abort = self.abort.subscribe();

        let mut process = sandbox
            .spawn(program, args)
            .await
            .with_context(|| format!("Failed to spawn `{command}`"))?;

        if let Some(mut output) = process.take_output() {
            let sink = self.output.clone();
            let turn_id = turn_id.to_string();
            let command = command.to_string();
            tokio::spawn(async move {
                while let Some(line) = output.recv().await {
                    debug!(target: "blueprint::command", "{}", line);
                    if let Some(sink) = &sink {
                        let _ = sink.send(CommandOutput {
                            turn_id: turn_id.clone(),
                            command: command.clone(),
                            line,
                        });
                    }
                }
            });
        }

        let waited = tokio::select! {
            waited = tokio::time::timeout(self.config.command_timeout(), process.wait()) => Some(waited),
            _ = abort.changed() => None,
        };

        let outcome = match waited {
            Some(Ok(Ok(0))) => StepOutcome::Succeeded,
            Some(Ok(Ok(code))) => StepOutcome::Failed(format!("exit code {code}")),
            Some(Ok(Err(e))) => return Err(e).context("Failed waiting for command"),
            Some(Err(_elapsed)) => StepOutcome::TimedOut,
            None => StepOutcome::Aborted,
        };

        if matches!(outcome, StepOutcome::TimedOut | StepOutcome::Aborted)
            && let Err(e) = process.kill().await
        {
            warn!("Failed to kill `{}`: {}", command, e);
        }

        Ok(outcome)
    }
}

/// Splits a command line into program and arguments, honouring single quotes, double
/// quotes and backslash escapes. Shell operators are passed through as plain arguments.
pub fn split_command(line: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') => match chars.next() {
                Some(next @ ('"' | '\\' | '$' | '`')) => current.push(next),
                Some(next) => {
                    current.push('\\');
                    current.push(next);
                }
                None => current.push('\\'),
            },
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if let Some(q) = quote {
        bail!("Unterminated {q} quote in `{line}`");
    }
    if in_word {
        args.push(current);
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::parsing::parse;
    use crate::infrastructure::sandbox::memory::MemorySandbox;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn config() -> EngineConfig {
        EngineConfig {
            retry_delay_ms: 10,
            max_ready_attempts: 5,
            command_timeout_secs: 5,
        }
    }

    fn engine_with(sandbox: &MemorySandbox) -> ExecutionEngine {
        let slot = SandboxSlot::ready(Arc::new(sandbox.clone()));
        ExecutionEngine::new(slot, ShadowFileStore::new(), config())
    }

    fn turn_from(text: &str) -> Arc<TurnHandle> {
        let turn = Arc::new(TurnHandle::new("t1"));
        turn.apply_parse(&parse(text));
        turn
    }

    #[test]
    fn test_split_command() {
        assert_eq!(split_command("npm install").unwrap(), vec!["npm", "install"]);
        assert_eq!(
            split_command("  echo 'hello world' \"a \\\"b\\\"\" c\\ d ").unwrap(),
            vec!["echo", "hello world", "a \"b\"", "c d"]
        );
        assert_eq!(split_command("echo ''").unwrap(), vec!["echo", ""]);
        assert!(split_command("").unwrap().is_empty());
        assert!(split_command("echo 'oops").is_err());
    }

    #[tokio::test]
    async fn test_completed_file_is_written_once() {
        let sandbox = MemorySandbox::new();
        let engine = engine_with(&sandbox);

        let turn = turn_from("<Artifact><Action type=\"file\" filePath=\"a.txt\">hello");
        let report = engine.drain(&turn).await.unwrap();
        assert_eq!(report.attempted, 0);
        assert!(sandbox.journal().is_empty());

        turn.apply_parse(&parse(
            "<Artifact><Action type=\"file\" filePath=\"a.txt\">hello world</Action></Artifact>",
        ));
        let report = engine.drain(&turn).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(sandbox.file("a.txt").as_deref(), Some("hello world"));
        assert_eq!(engine.shadow().get("a.txt").await.as_deref(), Some("hello world"));

        let step = &turn.snapshot().steps[0];
        assert!(!step.pending);
        assert_eq!(step.outcome, Some(StepOutcome::Succeeded));

        engine.drain(&turn).await.unwrap();
        assert_eq!(sandbox.journal(), vec!["write a.txt"]);
    }

    #[tokio::test]
    async fn test_effects_follow_declaration_order() {
        let sandbox = MemorySandbox::new();
        let engine = engine_with(&sandbox);
        let turn = turn_from(concat!(
            "<Artifact>",
            "<Action type=\"file\" filePath=\"src/app.js\">app</Action>",
            "<Action type=\"shell\">npm install</Action>",
            "<Action type=\"file\" filePath=\"README.md\">readme</Action>",
            "<Action type=\"delete\" filePath=\"src/app.js\"></Action>",
            "<Action type=\"shell\">npm run dev</Action>",
            "</Artifact>"
        ));

        let report = engine.drain(&turn).await.unwrap();
        assert_eq!(report.succeeded, 5);
        assert_eq!(
            sandbox.journal(),
            vec![
                "mkdir src",
                "write src/app.js",
                "spawn npm install",
                "write README.md",
                "remove src/app.js",
                "spawn npm run dev",
            ]
        );
        assert!(engine.shadow().get("src/app.js").await.is_none());
        assert_eq!(engine.shadow().paths().await, vec!["README.md".to_string()]);
    }

    #[tokio::test]
    async fn test_repeated_path_ends_at_last_content() {
        let sandbox = MemorySandbox::new();
        let engine = engine_with(&sandbox);

        let first = "<Artifact><Action type=\"file\" filePath=\"a.txt\">v1</Action>";
        let turn = turn_from(first);
        engine.drain(&turn).await.unwrap();
        assert_eq!(sandbox.file("a.txt").as_deref(), Some("v1"));

        turn.apply_parse(&parse(&format!(
            "{first}<Action type=\"file\" filePath=\"a.txt\">v2</Action></Artifact>"
        )));
        engine.drain(&turn).await.unwrap();

        assert_eq!(turn.snapshot().steps.len(), 1);
        assert_eq!(engine.shadow().get("a.txt").await.as_deref(), Some("v2"));
        assert_eq!(sandbox.journal(), vec!["write a.txt", "write a.txt"]);
    }

    #[tokio::test]
    async fn test_write_delete_write_ends_with_file() {
        let sandbox = MemorySandbox::new();
        let engine = engine_with(&sandbox);
        let turn = turn_from(concat!(
            "<Artifact>",
            "<Action type=\"file\" filePath=\"a.txt\">v1</Action>",
            "<Action type=\"delete\" filePath=\"a.txt\"></Action>",
            "<Action type=\"file\" filePath=\"a.txt\">v2</Action>",
            "</Artifact>"
        ));

        engine.drain(&turn).await.unwrap();

        assert_eq!(
            sandbox.journal(),
            vec!["write a.txt", "remove a.txt", "write a.txt"]
        );
        assert_eq!(sandbox.file("a.txt").as_deref(), Some("v2"));
        assert_eq!(engine.shadow().get("a.txt").await.as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_failure_does_not_block_later_steps() {
        let sandbox = MemorySandbox::new()
            .with_failing_path("bad.txt")
            .with_exit_code("false", 1);
        let engine = engine_with(&sandbox);
        let turn = turn_from(concat!(
            "<Artifact>",
            "<Action type=\"file\" filePath=\"bad.txt\">x</Action>",
            "<Action type=\"shell\">false</Action>",
            "<Action type=\"delete\" filePath=\"missing.txt\"></Action>",
            "<Action type=\"file\" filePath=\"good.txt\">y</Action>",
            "</Artifact>"
        ));

        let report = engine.drain(&turn).await.unwrap();
        assert_eq!(report.attempted, 4);
        assert_eq!(report.failed, 2);

        let steps = turn.snapshot().steps;
        assert!(steps.iter().all(|s| !s.pending));
        assert!(matches!(steps[0].outcome, Some(StepOutcome::Failed(_))));
        assert_eq!(steps[1].outcome, Some(StepOutcome::Failed("exit code 1".into())));
        assert_eq!(steps[2].outcome, Some(StepOutcome::Succeeded));
        assert_eq!(sandbox.file("good.txt").as_deref(), Some("y"));
        assert!(engine.shadow().get("bad.txt").await.is_none());
    }

    #[tokio::test]
    async fn test_waits_for_sandbox_then_runs_command() {
        let sandbox = MemorySandbox::new();
        let slot = SandboxSlot::empty();
        let engine = Arc::new(ExecutionEngine::new(
            slot.clone(),
            ShadowFileStore::new(),
            EngineConfig {
                retry_delay_ms: 20,
                max_ready_attempts: 100,
                command_timeout_secs: 5,
            },
        ));
        let turn = turn_from("<Artifact><Action type=\"shell\">npm install</Action></Artifact>");

        let drain = {
            let engine = engine.clone();
            let turn = turn.clone();
            tokio::spawn(async move { engine.drain(&turn).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(turn.snapshot().steps[0].pending);

        slot.set(Arc::new(sandbox.clone()));
        let report = drain.await.unwrap().unwrap();

        assert!(report.not_ready >= 1);
        assert_eq!(report.succeeded, 1);
        assert!(!turn.snapshot().steps[0].pending);
        assert_eq!(sandbox.journal(), vec!["spawn npm install"]);
    }

    #[tokio::test]
    async fn test_gives_up_when_sandbox_never_boots() {
        let engine = ExecutionEngine::new(SandboxSlot::empty(), ShadowFileStore::new(), config());
        let turn = turn_from("<Artifact><Action type=\"file\" filePath=\"a.txt\">x</Action>");

        let err = engine.drain(&turn).await.unwrap_err();
        assert!(matches!(err, EngineError::SandboxUnavailable { attempts: 5 }));
        assert!(turn.snapshot().steps[0].pending);
    }

    #[tokio::test]
    async fn test_hung_command_times_out_and_is_killed() {
        let sandbox = MemorySandbox::new().with_hanging("npm");
        let slot = SandboxSlot::ready(Arc::new(sandbox.clone()));
        let mut config = config();
        config.command_timeout_secs = 0;
        let engine = ExecutionEngine::new(slot, ShadowFileStore::new(), config);
        let turn = turn_from(concat!(
            "<Artifact>",
            "<Action type=\"shell\">npm run dev</Action>",
            "<Action type=\"file\" filePath=\"after.txt\">ok</Action>",
            "</Artifact>"
        ));

        engine.drain(&turn).await.unwrap();

        let steps = turn.snapshot().steps;
        assert_eq!(steps[0].outcome, Some(StepOutcome::TimedOut));
        assert!(!steps[0].pending);
        assert_eq!(
            sandbox.journal(),
            vec!["spawn npm run dev", "kill npm run dev", "write after.txt"]
        );
    }

    #[tokio::test]
    async fn test_abort_kills_running_command() {
        let sandbox = MemorySandbox::new().with_hanging("tail");
        let engine = Arc::new(engine_with(&sandbox));
        let turn = turn_from("<Artifact><Action type=\"shell\">tail -f log</Action></Artifact>");

        let drain = {
            let engine = engine.clone();
            let turn = turn.clone();
            tokio::spawn(async move { engine.drain(&turn).await })
        };

        while sandbox.journal().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        engine.abort_running();
        drain.await.unwrap().unwrap();

        assert_eq!(turn.snapshot().steps[0].outcome, Some(StepOutcome::Aborted));
        assert_eq!(sandbox.journal(), vec!["spawn tail -f log", "kill tail -f log"]);
    }

    #[tokio::test]
    async fn test_concurrent_drains_collapse_without_losing_work() {
        let sandbox = MemorySandbox::new().with_hanging("sleep");
        let mut config = config();
        config.command_timeout_secs = 1;
        let engine = Arc::new(ExecutionEngine::new(
            SandboxSlot::ready(Arc::new(sandbox.clone())),
            ShadowFileStore::new(),
            config,
        ));

        let first = Arc::new(TurnHandle::new("t1"));
        first.apply_parse(&parse(
            "<Artifact><Action type=\"shell\">sleep 1</Action></Artifact>",
        ));
        let second = Arc::new(TurnHandle::new("t2"));
        second.apply_parse(&parse(
            "<Artifact><Action type=\"file\" filePath=\"b.txt\">b</Action></Artifact>",
        ));

        let drain = {
            let engine = engine.clone();
            let first = first.clone();
            tokio::spawn(async move { engine.drain(&first).await })
        };
        while sandbox.journal().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // The lock is held: these return at once and leave the work to the running drain.
        for _ in 0..3 {
            let report = engine.drain(&second).await.unwrap();
            assert_eq!(report, DrainReport::default());
        }

        let report = drain.await.unwrap().unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(sandbox.file("b.txt").as_deref(), Some("b"));
        assert_eq!(
            sandbox.journal(),
            vec!["spawn sleep 1", "kill sleep 1", "write b.txt"]
        );
    }

    #[tokio::test]
    async fn test_command_output_is_forwarded() {
        let sandbox = MemorySandbox::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = engine_with(&sandbox).with_output(tx);
        let turn = turn_from("<Artifact><Action type=\"shell\">echo hi</Action></Artifact>");

        engine.drain(&turn).await.unwrap();

        let output = rx.recv().await.unwrap();
        assert_eq!(output.turn_id, "t1");
        assert_eq!(output.command, "echo hi");
        assert_eq!(output.line, "$ echo hi");
    }
}
