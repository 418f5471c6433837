//! Parallel sub-agent coordination.
//!
//! A [`SubAgentCoordinator`] fans a batch of isolated tasks out over fresh
//! engine instances sharing one backend, bounded by a semaphore, and folds
//! the outcomes back into input order. [`SubAgentTool`] exposes the
//! coordinator to the model as a regular tool, with the spawning tool
//! filtered out of every child catalog so sub-agents cannot recurse.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::ModelBackend;
use crate::engine::{AgentEngine, EngineConfig};
use crate::error::TychoError;
use crate::tools::{PermissionSet, Tool, ToolSet};
use crate::types::Role;

/// Upper bound on tasks per batch.
pub const MAX_TASKS: usize = 5;
/// Upper bound on a single task's timeout.
pub const MAX_TASK_TIMEOUT_SECS: u64 = 600;
/// Backend round-trips a task may use when it does not say otherwise.
pub const DEFAULT_MAX_TURNS: usize = 20;
/// Name the spawning tool registers under.
pub const SUBAGENT_TOOL_NAME: &str = "spawn_subagents";

fn default_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_max_turns() -> usize {
    DEFAULT_MAX_TURNS
}

/// One isolated unit of work for a sub-agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentTask {
    #[serde(default = "default_task_id")]
    pub id: String,
    pub description: String,
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
}

/// Outcome of one sub-agent task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentResult {
    pub task_id: String,
    pub description: String,
    pub success: bool,
    pub duration_ms: u64,
    pub turns: usize,
    pub tool_calls: usize,
    pub summary: Option<String>,
    pub error: Option<String>,
}

/// Aggregated batch outcome, results in input order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentBatchResult {
    pub results: Vec<SubAgentResult>,
    pub all_succeeded: bool,
}

/// Progress notifications emitted while a batch runs.
#[derive(Debug, Clone)]
pub enum SubAgentProgress {
    Started { task_id: String, description: String },
    ToolCall { task_id: String, tool: String },
    Completed { task_id: String },
    Failed { task_id: String, error: String },
}

pub type ProgressObserver = Arc<dyn Fn(SubAgentProgress) + Send + Sync>;

/// Runs batches of sub-agent tasks against a shared backend.
pub struct SubAgentCoordinator {
    backend: Arc<dyn ModelBackend>,
    config: EngineConfig,
    tools: ToolSet,
    observer: Option<ProgressObserver>,
    cancel: CancellationToken,
}

impl SubAgentCoordinator {
    /// `tools` is the parent catalog; the spawning tool is filtered out of
    /// every child's copy.
    pub fn new(backend: Arc<dyn ModelBackend>, config: EngineConfig, tools: ToolSet) -> Self {
        Self {
            backend,
            config,
            tools: tools.without(SUBAGENT_TOOL_NAME),
            observer: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(SubAgentProgress) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Token cancelling every in-flight child when triggered.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run a batch. Validation failures reject the whole batch before any
    /// task starts; per-task failures are isolated into their result slot.
    pub async fn run(
        &self,
        tasks: Vec<SubAgentTask>,
        max_concurrency: Option<usize>,
    ) -> Result<SubAgentBatchResult, TychoError> {
        if tasks.is_empty() {
            return Err(TychoError::InvalidArgument(
                "sub-agent batch requires at least one task".to_string(),
            ));
        }
        if tasks.len() > MAX_TASKS {
            return Err(TychoError::InvalidArgument(format!(
                "sub-agent batch of {} exceeds the limit of {MAX_TASKS}",
                tasks.len()
            )));
        }
        for task in &tasks {
            if let Some(timeout) = task.timeout_secs {
                if timeout > MAX_TASK_TIMEOUT_SECS {
                    return Err(TychoError::InvalidArgument(format!(
                        "task '{}' timeout of {timeout}s exceeds the limit of {MAX_TASK_TIMEOUT_SECS}s",
                        task.id
                    )));
                }
            }
        }

        let concurrency = max_concurrency.unwrap_or(tasks.len()).max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let identities: Vec<(String, String)> = tasks
            .iter()
            .map(|t| (t.id.clone(), t.description.clone()))
            .collect();
        tracing::debug!(tasks = tasks.len(), concurrency, "sub-agent batch start");

        let mut join_set = JoinSet::new();
        for (index, task) in tasks.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let backend = self.backend.clone();
            let config = self.config.clone();
            let tools = self.tools.clone();
            let observer = self.observer.clone();
            let cancel = self.cancel.clone();
            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    // Semaphore is never closed while tasks run.
                    return (index, None);
                };
                let result = run_task(backend, config, tools, observer, cancel, task).await;
                (index, Some(result))
            });
        }

        let mut slots: Vec<Option<SubAgentResult>> = identities.iter().map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            if let Ok((index, result)) = joined {
                slots[index] = result;
            }
        }

        let results: Vec<SubAgentResult> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    let (task_id, description) = identities[index].clone();
                    SubAgentResult {
                        task_id,
                        description,
                        success: false,
                        duration_ms: 0,
                        turns: 0,
                        tool_calls: 0,
                        summary: None,
                        error: Some("sub-agent task aborted".to_string()),
                    }
                })
            })
            .collect();
        let all_succeeded = results.iter().all(|r| r.success);
        Ok(SubAgentBatchResult {
            results,
            all_succeeded,
        })
    }
}

impl std::fmt::Debug for SubAgentCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubAgentCoordinator")
            .field("tools", &self.tools)
            .field("model", &self.config.model)
            .finish()
    }
}

fn notify(observer: &Option<ProgressObserver>, progress: SubAgentProgress) {
    if let Some(observer) = observer {
        observer(progress);
    }
}

async fn run_task(
    backend: Arc<dyn ModelBackend>,
    base: EngineConfig,
    tools: ToolSet,
    observer: Option<ProgressObserver>,
    parent_cancel: CancellationToken,
    task: SubAgentTask,
) -> SubAgentResult {
    let started = Instant::now();
    notify(
        &observer,
        SubAgentProgress::Started {
            task_id: task.id.clone(),
            description: task.description.clone(),
        },
    );

    let mut config = base;
    config.max_turns = None;
    config.max_iterations = Some(task.max_turns);
    if task.system_prompt.is_some() {
        config.system_prompt = task.system_prompt.clone();
    }
    let mut engine = AgentEngine::new(backend, config).with_tools(tools);
    let child_cancel = engine.cancel_handle();

    let deadline = task
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(MAX_TASK_TIMEOUT_SECS));

    let mut turns = 0usize;
    let mut tool_calls = 0usize;
    let mut summary: Option<String> = None;
    let mut error: Option<String> = None;

    {
        let stream = engine.query(task.prompt.clone());
        tokio::pin!(stream);
        let drained = tokio::time::timeout(deadline, async {
            loop {
                let item = tokio::select! {
                    _ = parent_cancel.cancelled() => {
                        child_cancel.cancel();
                        return Err("cancelled".to_string());
                    }
                    item = stream.next() => item,
                };
                match item {
                    None => return Ok(()),
                    Some(Ok(message)) => {
                        if message.role == Role::Assistant {
                            turns += 1;
                            let text = message.text();
                            if !text.is_empty() {
                                summary = Some(text);
                            }
                        }
                        for tool_use in message.tool_uses() {
                            tool_calls += 1;
                            notify(
                                &observer,
                                SubAgentProgress::ToolCall {
                                    task_id: task.id.clone(),
                                    tool: tool_use.name.clone(),
                                },
                            );
                        }
                    }
                    Some(Err(err)) => return Err(err.to_string()),
                }
            }
        })
        .await;
        match drained {
            Ok(Ok(())) => {}
            Ok(Err(message)) => error = Some(message),
            Err(_) => {
                child_cancel.cancel();
                error = Some(format!("timed out after {}s", deadline.as_secs()));
            }
        }
    }

    let duration_ms = started.elapsed().as_millis() as u64;
    let success = error.is_none();
    match &error {
        None => notify(
            &observer,
            SubAgentProgress::Completed {
                task_id: task.id.clone(),
            },
        ),
        Some(message) => {
            tracing::debug!(task_id = %task.id, error = %message, "sub-agent task failed");
            notify(
                &observer,
                SubAgentProgress::Failed {
                    task_id: task.id.clone(),
                    error: message.clone(),
                },
            );
        }
    }

    SubAgentResult {
        task_id: task.id,
        description: task.description,
        success,
        duration_ms,
        turns,
        tool_calls,
        summary,
        error,
    }
}

#[derive(Debug, Deserialize)]
struct SpawnInput {
    tasks: Vec<SubAgentTask>,
    #[serde(default)]
    max_concurrency: Option<usize>,
}

/// Tool wrapper letting the model spawn sub-agent batches.
#[derive(Debug)]
pub struct SubAgentTool {
    coordinator: SubAgentCoordinator,
}

impl SubAgentTool {
    pub fn new(coordinator: SubAgentCoordinator) -> Self {
        Self { coordinator }
    }
}

#[async_trait::async_trait]
impl Tool for SubAgentTool {
    fn name(&self) -> &str {
        SUBAGENT_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Spawn up to 5 isolated sub-agents that work on independent tasks in \
         parallel and report their results"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "tasks": {
                    "type": "array",
                    "minItems": 1,
                    "maxItems": MAX_TASKS,
                    "items": {
                        "type": "object",
                        "properties": {
                            "description": {"type": "string"},
                            "prompt": {"type": "string"},
                            "system_prompt": {"type": "string"},
                            "timeout_secs": {"type": "integer", "maximum": MAX_TASK_TIMEOUT_SECS},
                            "max_turns": {"type": "integer", "default": DEFAULT_MAX_TURNS}
                        },
                        "required": ["description", "prompt"]
                    }
                },
                "max_concurrency": {"type": "integer", "minimum": 1}
            },
            "required": ["tasks"]
        })
    }

    fn permissions(&self) -> PermissionSet {
        PermissionSet::EXECUTE
    }

    async fn execute(&self, input: serde_json::Value) -> Result<serde_json::Value, TychoError> {
        let input: SpawnInput = serde_json::from_value(input)
            .map_err(|err| TychoError::InvalidArgument(format!("invalid sub-agent input: {err}")))?;
        let batch = self.coordinator.run(input.tasks, input.max_concurrency).await?;
        Ok(serde_json::to_value(batch)?)
    }
}

/// Convenience: build the spawning tool from the parent's backend, config,
/// and full tool catalog.
pub fn subagent_tool(
    backend: Arc<dyn ModelBackend>,
    config: EngineConfig,
    parent_tools: &ToolSet,
) -> Arc<dyn Tool> {
    Arc::new(SubAgentTool::new(SubAgentCoordinator::new(
        backend,
        config,
        parent_tools.clone(),
    )))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures::StreamExt as _;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::backend::{BackendRequest, MessageStream};
    use crate::tools::FnTool;
    use crate::types::{ContentBlock, Message, ToolUse};

    enum Script {
        Reply(&'static str),
        ToolUseThen(&'static str, &'static str),
        Fail(&'static str),
        Hang,
    }

    struct StubBackend {
        scripts: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<BackendRequest>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
        delay_ms: u64,
    }

    impl StubBackend {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                requests: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                delay_ms: 0,
            })
        }

        fn with_delay(scripts: Vec<Script>, delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                requests: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                delay_ms,
            })
        }

        fn requests(&self) -> Vec<BackendRequest> {
            self.requests.lock().expect("requests lock").clone()
        }
    }

    #[async_trait]
    impl ModelBackend for StubBackend {
        async fn stream_complete(
            &self,
            request: &BackendRequest,
        ) -> Result<MessageStream, TychoError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);

            self.requests
                .lock()
                .expect("requests lock")
                .push(request.clone());
            let script = self
                .scripts
                .lock()
                .expect("scripts lock")
                .pop_front()
                .unwrap_or(Script::Reply("default"));
            match script {
                Script::Reply(text) => {
                    Ok(futures::stream::iter(vec![Ok(Message::assistant(text))]).boxed())
                }
                Script::ToolUseThen(tool, id) => Ok(futures::stream::iter(vec![Ok(
                    Message::assistant_with(vec![ContentBlock::ToolUse(ToolUse {
                        id: id.to_string(),
                        name: tool.to_string(),
                        input: serde_json::json!({}),
                    })]),
                )])
                .boxed()),
                Script::Fail(message) => Err(TychoError::Backend(message.to_string())),
                Script::Hang => Ok(futures::stream::pending().boxed()),
            }
        }

        async fn complete(&self, _request: &BackendRequest) -> Result<Message, TychoError> {
            Ok(Message::assistant("summary"))
        }
    }

    fn task(id: &str, prompt: &str) -> SubAgentTask {
        SubAgentTask {
            id: id.to_string(),
            description: format!("task {id}"),
            prompt: prompt.to_string(),
            system_prompt: None,
            timeout_secs: None,
            max_turns: DEFAULT_MAX_TURNS,
        }
    }

    fn coordinator(backend: Arc<StubBackend>) -> SubAgentCoordinator {
        SubAgentCoordinator::new(backend, EngineConfig::new("stub-model"), ToolSet::empty())
    }

    #[tokio::test]
    async fn empty_batch_is_rejected_before_any_task_runs() {
        let backend = StubBackend::new(vec![]);
        let err = coordinator(backend.clone())
            .run(vec![], None)
            .await
            .expect_err("empty batch");
        assert!(matches!(err, TychoError::InvalidArgument(_)));
        assert!(backend.requests().is_empty());
    }

    #[tokio::test]
    async fn oversized_batch_is_rejected() {
        let backend = StubBackend::new(vec![]);
        let tasks: Vec<_> = (0..6).map(|i| task(&format!("t{i}"), "go")).collect();
        let err = coordinator(backend)
            .run(tasks, None)
            .await
            .expect_err("six tasks");
        assert!(matches!(err, TychoError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn excessive_timeout_fails_the_whole_batch() {
        let backend = StubBackend::new(vec![]);
        let mut bad = task("slow", "go");
        bad.timeout_secs = Some(MAX_TASK_TIMEOUT_SECS + 1);
        let err = coordinator(backend.clone())
            .run(vec![task("ok", "go"), bad], None)
            .await
            .expect_err("timeout over limit");
        assert!(matches!(err, TychoError::InvalidArgument(_)));
        assert!(backend.requests().is_empty(), "fail fast, nothing started");
    }

    #[tokio::test]
    async fn results_come_back_in_input_order() {
        let backend = StubBackend::new(vec![Script::Reply("reply A"), Script::Reply("reply B")]);
        let batch = coordinator(backend)
            .run(vec![task("a", "first"), task("b", "second")], Some(1))
            .await
            .expect("batch");

        let ids: Vec<_> = batch.results.iter().map(|r| r.task_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(batch.results[0].summary.as_deref(), Some("reply A"));
        assert_eq!(batch.results[1].summary.as_deref(), Some("reply B"));
        assert!(batch.all_succeeded);
        assert_eq!(batch.results[0].turns, 1);
    }

    #[tokio::test]
    async fn concurrency_limit_is_respected() {
        let backend = StubBackend::with_delay(
            vec![Script::Reply("a"), Script::Reply("b"), Script::Reply("c")],
            20,
        );
        coordinator(backend.clone())
            .run(
                vec![task("a", "go"), task("b", "go"), task("c", "go")],
                Some(1),
            )
            .await
            .expect("batch");
        assert_eq!(backend.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn one_failing_task_does_not_poison_the_rest() {
        let backend = StubBackend::new(vec![
            Script::Fail("provider rejected request"),
            Script::Reply("still fine"),
        ]);
        let batch = coordinator(backend)
            .run(vec![task("bad", "go"), task("good", "go")], Some(1))
            .await
            .expect("batch");

        assert!(!batch.results[0].success);
        assert!(batch.results[0]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("provider rejected request")));
        assert!(batch.results[1].success);
        assert!(!batch.all_succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_task_times_out_without_blocking_the_batch() {
        let backend = StubBackend::new(vec![Script::Hang, Script::Reply("quick")]);
        let mut slow = task("slow", "go");
        slow.timeout_secs = Some(5);
        let batch = coordinator(backend)
            .run(vec![slow, task("quick", "go")], Some(1))
            .await
            .expect("batch");

        assert!(!batch.results[0].success);
        assert!(batch.results[0]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("timed out after 5s")));
        assert!(batch.results[1].success);
    }

    #[tokio::test]
    async fn coordinator_cancellation_fails_every_child() {
        let backend = StubBackend::new(vec![Script::Hang, Script::Hang]);
        let coordinator = coordinator(backend);
        let token = coordinator.cancel_token();
        let coordinator = coordinator.with_observer(move |progress| {
            if let SubAgentProgress::Started { .. } = progress {
                token.cancel();
            }
        });

        let batch = coordinator
            .run(vec![task("a", "go"), task("b", "go")], None)
            .await
            .expect("batch");

        assert!(!batch.all_succeeded);
        assert_eq!(batch.results.len(), 2, "no child is silently dropped");
        for result in &batch.results {
            assert!(!result.success);
            assert!(result
                .error
                .as_deref()
                .is_some_and(|e| e.contains("cancelled")));
        }
    }

    #[tokio::test]
    async fn children_never_see_the_spawning_tool() {
        let spawner: Arc<dyn Tool> = Arc::new(FnTool::new(
            SUBAGENT_TOOL_NAME,
            "decoy spawner",
            serde_json::json!({"type": "object"}),
            PermissionSet::EXECUTE,
            |_input| async { Ok(serde_json::Value::Null) },
        ));
        let echo: Arc<dyn Tool> = Arc::new(FnTool::new(
            "echo",
            "echoes",
            serde_json::json!({"type": "object"}),
            PermissionSet::READ,
            |input| async move { Ok(input) },
        ));
        let backend = StubBackend::new(vec![Script::Reply("done")]);
        let coordinator = SubAgentCoordinator::new(
            backend.clone(),
            EngineConfig::new("stub-model"),
            ToolSet::new(vec![spawner, echo]),
        );
        coordinator
            .run(vec![task("a", "go")], None)
            .await
            .expect("batch");

        let tools = backend.requests()[0].tools.clone().unwrap_or_default();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["echo"]);
    }

    #[tokio::test]
    async fn observer_sees_lifecycle_and_tool_calls() {
        let backend = StubBackend::new(vec![
            Script::ToolUseThen("echo", "tu_1"),
            Script::Reply("done"),
        ]);
        let echo: Arc<dyn Tool> = Arc::new(FnTool::new(
            "echo",
            "echoes",
            serde_json::json!({"type": "object"}),
            PermissionSet::READ,
            |input| async move { Ok(input) },
        ));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let coordinator = SubAgentCoordinator::new(
            backend,
            EngineConfig::new("stub-model"),
            ToolSet::new(vec![echo]),
        )
        .with_observer(move |progress| {
            let label = match progress {
                SubAgentProgress::Started { task_id, .. } => format!("started:{task_id}"),
                SubAgentProgress::ToolCall { task_id, tool } => format!("tool:{task_id}:{tool}"),
                SubAgentProgress::Completed { task_id } => format!("completed:{task_id}"),
                SubAgentProgress::Failed { task_id, .. } => format!("failed:{task_id}"),
            };
            sink.lock().expect("events").push(label);
        });

        coordinator
            .run(vec![task("a", "go")], None)
            .await
            .expect("batch");

        assert_eq!(
            *events.lock().expect("events"),
            vec!["started:a", "tool:a:echo", "completed:a"]
        );
    }

    #[tokio::test]
    async fn spawn_tool_decodes_input_and_reports_batch() {
        let backend = StubBackend::new(vec![Script::Reply("done")]);
        let tool = subagent_tool(
            backend,
            EngineConfig::new("stub-model"),
            &ToolSet::empty(),
        );

        let output = tool
            .execute(serde_json::json!({
                "tasks": [{"description": "probe", "prompt": "go"}]
            }))
            .await
            .expect("spawn");
        assert_eq!(output["all_succeeded"], serde_json::json!(true));
        assert_eq!(output["results"][0]["turns"], serde_json::json!(1));

        let bad = tool.execute(serde_json::json!({"tasks": []})).await;
        assert!(matches!(bad, Err(TychoError::InvalidArgument(_))));
    }

    #[test]
    fn task_deserialization_defaults() {
        let task: SubAgentTask = serde_json::from_value(serde_json::json!({
            "description": "probe",
            "prompt": "go"
        }))
        .expect("task");
        assert_eq!(task.max_turns, DEFAULT_MAX_TURNS);
        assert!(task.timeout_secs.is_none());
        assert!(!task.id.is_empty(), "id is generated when omitted");
    }
}
