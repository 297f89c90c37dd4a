//! Orchestrator - turns ready nodes into activities and results back into
//! scheduler state.
//!
//! One logical cursor drives the whole execution: each tick dispatches ready
//! nodes up to the concurrency budget, then suspends on exactly one of an
//! in-flight activity result, a timer, or a signal. Between suspensions every
//! state transition is a pure function of `(BuiltWorkflow, ContextSnapshot,
//! ExecutionQueue)`, which is what makes the execution replay-safe on a
//! durable runtime.
//!
//! ```text
//!  ready ──interpolate──> activity (JoinSet, ≤ max_concurrent)
//!    ▲                        │ result
//!    │   queue / context / governor / events
//!    └────────────────────────┘
//! ```
//!
//! Trigger, loop machinery, parallel fans and output nodes resolve inline;
//! everything else goes through the durable runtime's single
//! `execute_activity` contract with the retry policy of [`crate::retry`]
//! applied around it.

use crate::builder::{build, BuildReport, BuiltWorkflow, ExecutableNode};
use crate::context::{ContextSnapshot, LoopFrame, ParallelFrame};
use crate::definition::{LoopKind, NodeId, NodeKind, WorkflowDefinition};
use crate::error::{EngineError, Result};
use crate::events::{EventChannel, EventKind, EventSink, ExecutionEvent};
use crate::governor::{OverflowAction, SizeGovernor, SizeLimits};
use crate::interpolate;
use crate::queue::ExecutionQueue;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use flowgraph_durable::{ActivityMeta, ActivityRequest, ActivityResult, DurableRuntime};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;

/// Default bound on loop passes.
pub const DEFAULT_MAX_LOOP_ITERATIONS: u64 = 10_000;

/// Cooperative cancellation flag; observed at the next scheduling tick.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Pre-execution admission control. The credit system itself is external;
/// the orchestrator only reserves.
#[async_trait]
pub trait CreditGate: Send + Sync {
    async fn reserve(&self, execution_id: &str, user_id: Option<&str>) -> Result<()>;
}

/// Submission-time options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionOptions {
    /// In-flight activity bound, 1-64.
    pub max_concurrent_nodes: Option<usize>,
    pub skip_credit_check: bool,
    pub max_node_output_bytes: Option<usize>,
    pub max_context_bytes: Option<usize>,
    pub execution_timeout_ms: Option<u64>,
    pub retry_policy: Option<RetryPolicy>,
    pub max_loop_iterations: Option<u64>,
    /// Truncate oversize outputs to a marker instead of failing the node.
    pub truncate_oversize_outputs: bool,
}

/// One workflow submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub execution_id: String,
    pub definition: WorkflowDefinition,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default)]
    pub options: ExecutionOptions,
}

impl ExecutionRequest {
    pub fn new(definition: WorkflowDefinition, inputs: Value) -> Self {
        Self {
            execution_id: uuid::Uuid::new_v4().to_string(),
            definition,
            inputs,
            options: ExecutionOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    pub duration_ms: u64,
    /// Reachable nodes in the plan.
    pub node_count: u64,
    pub retried_count: u64,
    pub pruned_output_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionFailure {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_node_id: Option<NodeId>,
}

/// Result of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub success: bool,
    /// Terminal-node outputs; partial on failure, for forensics.
    pub outputs: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_node_id: Option<NodeId>,
    pub metrics: ExecutionMetrics,
}

/// The execution engine front door.
pub struct Orchestrator {
    runtime: Arc<dyn DurableRuntime>,
    credit_gate: Option<Arc<dyn CreditGate>>,
    event_sink: Option<Arc<dyn EventSink>>,
    user_id: Option<String>,
}

impl Orchestrator {
    pub fn new(runtime: Arc<dyn DurableRuntime>) -> Self {
        Self {
            runtime,
            credit_gate: None,
            event_sink: None,
            user_id: None,
        }
    }

    pub fn with_credit_gate(mut self, gate: Arc<dyn CreditGate>) -> Self {
        self.credit_gate = Some(gate);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Build and run a submission.
    ///
    /// Build errors are returned as the `Err` side - they surface
    /// synchronously and execution never starts. Everything that happens
    /// after the build is reported inside the [`ExecutionOutcome`].
    pub async fn submit(
        &self,
        request: ExecutionRequest,
    ) -> std::result::Result<ExecutionOutcome, BuildReport> {
        self.submit_with(request, CancelToken::new(), None).await
    }

    /// [`submit`](Self::submit) with a cancellation token and an optional
    /// live event listener.
    pub async fn submit_with(
        &self,
        request: ExecutionRequest,
        cancel: CancelToken,
        listener: Option<UnboundedSender<ExecutionEvent>>,
    ) -> std::result::Result<ExecutionOutcome, BuildReport> {
        let report = build(&request.definition);
        if !report.success() {
            return Err(report);
        }
        let workflow = Arc::new(report.workflow.expect("successful build has a workflow"));

        let started = Instant::now();
        let mut events = EventChannel::new(&request.execution_id);
        if let Some(sink) = &self.event_sink {
            events = events.with_sink(sink.clone());
        }
        if let Some(tx) = listener {
            events.attach(tx);
        }

        let resolved = match resolve_options(&request.options, &workflow) {
            Ok(resolved) => resolved,
            Err(err) => {
                return Ok(finish_failed(
                    &mut events,
                    started,
                    &workflow,
                    ExecutionFailure {
                        code: err.code().to_string(),
                        message: err.to_string(),
                        failed_node_id: None,
                    },
                    0,
                    0,
                    Map::new(),
                ));
            }
        };

        if !request.options.skip_credit_check {
            if let Some(gate) = &self.credit_gate {
                if let Err(err) = gate
                    .reserve(&request.execution_id, self.user_id.as_deref())
                    .await
                {
                    return Ok(finish_failed(
                        &mut events,
                        started,
                        &workflow,
                        ExecutionFailure {
                            code: err.code().to_string(),
                            message: err.to_string(),
                            failed_node_id: None,
                        },
                        0,
                        0,
                        Map::new(),
                    ));
                }
            }
        }

        let timeout = request.options.execution_timeout_ms.map(Duration::from_millis);
        let run = run_loop(
            self.runtime.clone(),
            workflow.clone(),
            request.execution_id.clone(),
            self.user_id.clone(),
            request.inputs.clone(),
            resolved,
            &mut events,
            cancel,
            started,
        );

        let outcome = if let Some(duration) = timeout {
            let raced = tokio::time::timeout(duration, run).await;
            match raced {
                Ok(outcome) => outcome,
                Err(_) => finish_failed(
                    &mut events,
                    started,
                    &workflow,
                    ExecutionFailure {
                        code: "EXECUTION_TIMEOUT".to_string(),
                        message: format!(
                            "execution timed out after {}ms",
                            duration.as_millis()
                        ),
                        failed_node_id: None,
                    },
                    0,
                    0,
                    Map::new(),
                ),
            }
        } else {
            run.await
        };
        Ok(outcome)
    }
}

struct ResolvedOptions {
    max_concurrent: usize,
    governor: SizeGovernor,
    retry: RetryPolicy,
    max_loop_iterations: u64,
}

fn resolve_options(
    options: &ExecutionOptions,
    workflow: &BuiltWorkflow,
) -> Result<ResolvedOptions> {
    let max_concurrent = options
        .max_concurrent_nodes
        .unwrap_or(workflow.max_concurrent_nodes);
    if !(1..=64).contains(&max_concurrent) {
        return Err(EngineError::InvalidOptions(format!(
            "maxConcurrentNodes must be within 1-64, got {max_concurrent}"
        )));
    }
    let max_loop_iterations = options
        .max_loop_iterations
        .unwrap_or(DEFAULT_MAX_LOOP_ITERATIONS);
    if max_loop_iterations == 0 {
        return Err(EngineError::InvalidOptions(
            "maxLoopIterations must be positive".to_string(),
        ));
    }
    let mut limits = SizeLimits::default();
    if let Some(bytes) = options.max_node_output_bytes {
        limits.max_node_output_bytes = bytes;
    }
    if let Some(bytes) = options.max_context_bytes {
        limits.max_context_bytes = bytes;
    }
    if options.truncate_oversize_outputs {
        limits.overflow_action = OverflowAction::Truncate;
    }
    Ok(ResolvedOptions {
        max_concurrent,
        governor: SizeGovernor::new(limits),
        retry: options.retry_policy.clone().unwrap_or_default(),
        max_loop_iterations,
    })
}

struct ActivityCompletion {
    node_id: NodeId,
    attempts: u32,
    result: Result<ActivityResult>,
}

enum InlineFlow {
    Progressed,
    Deferred,
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    runtime: Arc<dyn DurableRuntime>,
    workflow: Arc<BuiltWorkflow>,
    execution_id: String,
    user_id: Option<String>,
    inputs: Value,
    options: ResolvedOptions,
    events: &mut EventChannel,
    cancel: CancelToken,
    started: Instant,
) -> ExecutionOutcome {
    let mut ctx = ContextSnapshot::create(workflow.name.clone(), execution_id.clone(), inputs);
    let mut queue = ExecutionQueue::initialize(workflow.clone(), options.max_loop_iterations);
    let mut inflight: JoinSet<ActivityCompletion> = JoinSet::new();
    let consumers = build_consumers(&workflow);

    let mut retried: u64 = 0;
    let mut pruned: u64 = 0;
    let mut fatal: Option<ExecutionFailure> = None;
    let mut output_failure: Option<ExecutionFailure> = None;

    events.emit(
        EventKind::ExecutionStarted,
        json!({
            "workflowName": workflow.name,
            "nodeCount": workflow.reachable_count(),
        }),
    );

    'run: loop {
        if cancel.is_cancelled() {
            queue.cancel_all();
            fatal = Some(ExecutionFailure {
                code: "CANCELLED".to_string(),
                message: "execution cancelled".to_string(),
                failed_node_id: None,
            });
            break 'run;
        }

        // Dispatch phase: inline nodes complete immediately and may unlock
        // more ready work, so keep going until the frontier is quiet.
        let mut progressed = true;
        while progressed {
            progressed = false;
            let capacity = options.max_concurrent.saturating_sub(inflight.len());
            if capacity == 0 {
                break;
            }
            let ready = queue.get_ready(capacity);
            if ready.is_empty() {
                break;
            }
            for node_id in ready {
                let node = match workflow.node(&node_id) {
                    Some(node) => node.clone(),
                    None => {
                        fatal = Some(internal_failure(format!(
                            "ready node '{node_id}' missing from plan"
                        )));
                        queue.cancel_all();
                        break 'run;
                    }
                };
                queue.mark_executing(std::slice::from_ref(&node_id));

                if node.kind.executes_inline() {
                    match execute_inline(
                        &node, &workflow, &mut ctx, &mut queue, events, &consumers,
                        &options.governor, &mut pruned,
                    ) {
                        Ok(InlineFlow::Progressed) => progressed = true,
                        Ok(InlineFlow::Deferred) => {}
                        Err(err) if err.is_fatal() => {
                            queue.cancel_all();
                            fatal = Some(ExecutionFailure {
                                code: err.code().to_string(),
                                message: err.to_string(),
                                failed_node_id: Some(node.id.clone()),
                            });
                            break 'run;
                        }
                        Err(err) => {
                            handle_node_failure(
                                &node,
                                err.code(),
                                &err.to_string(),
                                &workflow,
                                &mut ctx,
                                &mut queue,
                                events,
                                &mut output_failure,
                            );
                            progressed = true;
                        }
                    }
                    continue;
                }

                events.emit(
                    EventKind::NodeStarted,
                    json!({
                        "nodeId": node.id,
                        "nodeName": node.name,
                        "nodeType": node.kind.as_str(),
                    }),
                );
                if node.kind == NodeKind::HumanReview {
                    events.emit(
                        EventKind::ApprovalNeeded,
                        json!({"nodeId": node.id, "nodeName": node.name}),
                    );
                }

                match prepare_request(&node, &ctx, &execution_id, user_id.as_deref()) {
                    Ok(request) => {
                        if let Some(branch) = &node.branch {
                            ctx = ctx.push_parallel_frame(ParallelFrame {
                                parallel_node_id: branch.parallel_node_id.clone(),
                                branch_id: branch.branch_id.clone(),
                            });
                        }
                        let runtime = runtime.clone();
                        let policy = options.retry.clone();
                        let spawned_id = node.id.clone();
                        inflight.spawn(async move {
                            let (attempts, result) =
                                run_activity(runtime, policy, request).await;
                            ActivityCompletion {
                                node_id: spawned_id,
                                attempts,
                                result,
                            }
                        });
                    }
                    Err(err) => {
                        handle_node_failure(
                            &node,
                            err.code(),
                            &err.to_string(),
                            &workflow,
                            &mut ctx,
                            &mut queue,
                            events,
                            &mut output_failure,
                        );
                        progressed = true;
                    }
                }
            }
        }

        if queue.is_complete() && inflight.is_empty() {
            break 'run;
        }

        match inflight.join_next().await {
            Some(Ok(completion)) => {
                retried += u64::from(completion.attempts.saturating_sub(1));
                if let Err(err) = process_completion(
                    completion,
                    &workflow,
                    &mut ctx,
                    &mut queue,
                    events,
                    &consumers,
                    &options.governor,
                    &mut pruned,
                    &mut output_failure,
                ) {
                    queue.cancel_all();
                    fatal = Some(ExecutionFailure {
                        code: err.code().to_string(),
                        message: err.to_string(),
                        failed_node_id: None,
                    });
                    break 'run;
                }
            }
            Some(Err(join_err)) => {
                queue.cancel_all();
                fatal = Some(internal_failure(format!("activity task failed: {join_err}")));
                break 'run;
            }
            None => {
                // Nothing in flight, nothing ready, not complete: the plan
                // or scheduler is inconsistent; do not spin.
                queue.cancel_all();
                fatal = Some(internal_failure("scheduler stalled with pending nodes"));
                break 'run;
            }
        }
    }

    let outputs = ctx.build_final_outputs(workflow.output_node_ids.iter());
    let error = fatal.or(output_failure);
    match &error {
        None => {
            let metrics_payload = json!({"durationMs": started.elapsed().as_millis() as u64});
            events.emit(EventKind::ExecutionCompleted, metrics_payload);
        }
        Some(failure) => {
            events.emit(
                EventKind::ExecutionFailed,
                json!({
                    "failedNodeId": failure.failed_node_id,
                    "kind": failure.code,
                    "message": failure.message,
                }),
            );
        }
    }

    ExecutionOutcome {
        success: error.is_none(),
        outputs,
        failed_node_id: error.as_ref().and_then(|failure| failure.failed_node_id.clone()),
        error,
        metrics: ExecutionMetrics {
            duration_ms: started.elapsed().as_millis() as u64,
            node_count: workflow.reachable_count() as u64,
            retried_count: retried,
            pruned_output_count: pruned,
        },
    }
}

/// Retry loop around one activity. Returns total attempts made.
async fn run_activity(
    runtime: Arc<dyn DurableRuntime>,
    policy: RetryPolicy,
    request: ActivityRequest,
) -> (u32, Result<ActivityResult>) {
    let mut failures: u32 = 0;
    loop {
        match runtime.execute_activity(request.clone()).await {
            Err(err) => return (failures + 1, Err(err.into())),
            Ok(result) if result.success => return (failures + 1, Ok(result)),
            Ok(result) => {
                let (retryable, hint) = result
                    .error
                    .as_ref()
                    .map(|error| (error.retryable, error.retry_after_secs))
                    .unwrap_or((false, None));
                failures += 1;
                if policy.should_retry(failures, retryable) {
                    let delay = policy.delay_for(failures - 1, hint);
                    tracing::debug!(
                        node_id = %request.meta.node_id,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "retrying node after failure"
                    );
                    runtime.sleep(delay).await;
                    continue;
                }
                return (failures, Ok(result));
            }
        }
    }
}

fn prepare_request(
    node: &ExecutableNode,
    ctx: &ContextSnapshot,
    execution_id: &str,
    user_id: Option<&str>,
) -> Result<ActivityRequest> {
    let view = match &node.branch {
        Some(branch) => ctx.with_variables(&branch.variables),
        None => ctx.clone(),
    };
    let config = view.interpolate(&node.config)?;
    Ok(ActivityRequest {
        node_type: node.kind.as_str().to_string(),
        node_config: config,
        context: view.activity_view(),
        meta: ActivityMeta {
            execution_id: execution_id.to_string(),
            node_id: node.id.clone(),
            node_name: node.name.clone(),
            user_id: user_id.map(str::to_string),
        },
    })
}

#[allow(clippy::too_many_arguments)]
fn execute_inline(
    node: &ExecutableNode,
    workflow: &Arc<BuiltWorkflow>,
    ctx: &mut ContextSnapshot,
    queue: &mut ExecutionQueue,
    events: &mut EventChannel,
    consumers: &HashMap<NodeId, Vec<NodeId>>,
    governor: &SizeGovernor,
    pruned: &mut u64,
) -> Result<InlineFlow> {
    match node.kind {
        NodeKind::Trigger => {
            events.emit(
                EventKind::NodeStarted,
                json!({"nodeId": node.id, "nodeName": node.name, "nodeType": "trigger"}),
            );
            // The trigger's output is the workflow inputs, addressed through
            // `inputs.*`; it is not stored into context accounting.
            queue.mark_completed(&node.id, Arc::new(ctx.inputs().clone()));
            events.emit(EventKind::NodeCompleted, json!({"nodeId": node.id}));
            Ok(InlineFlow::Progressed)
        }
        NodeKind::LoopStart => {
            let loop_id = loop_id_of(node)?;
            let context = loop_context(workflow, &loop_id)?;
            events.emit(
                EventKind::NodeStarted,
                json!({"nodeId": node.id, "loopNodeId": loop_id}),
            );
            let frame = match context.kind {
                LoopKind::ForEach => {
                    let path = context
                        .array_path
                        .clone()
                        .ok_or_else(|| internal_error("forEach loop without arrayPath"))?;
                    let items = resolve_items(&path, ctx)?;
                    LoopFrame {
                        loop_node_id: loop_id.clone(),
                        iteration: 0,
                        item_index: Some(0),
                        items: Some(Arc::new(items)),
                        condition: None,
                    }
                }
                LoopKind::While => LoopFrame {
                    loop_node_id: loop_id.clone(),
                    iteration: 0,
                    items: None,
                    item_index: None,
                    condition: context.condition.clone(),
                },
                LoopKind::Count => LoopFrame {
                    loop_node_id: loop_id.clone(),
                    iteration: 0,
                    items: None,
                    item_index: None,
                    condition: None,
                },
            };
            let item_count = frame.items.as_ref().map(|items| items.len());
            *ctx = ctx.push_loop_frame(frame);
            store_and_complete(
                node,
                json!({"started": true, "itemCount": item_count}),
                ctx,
                queue,
                events,
                consumers,
                governor,
                pruned,
            )?;
            Ok(InlineFlow::Progressed)
        }
        NodeKind::Loop => {
            let frame = ctx
                .loop_frame(&node.id)
                .ok_or_else(|| internal_error(format!("no loop frame for '{}'", node.id)))?
                .clone();
            let mut output = json!({"iteration": frame.iteration});
            if let Some(items) = &frame.items {
                let item = items.get(frame.iteration as usize).cloned().unwrap_or(Value::Null);
                output["item"] = item;
            }
            events.emit(
                EventKind::NodeStarted,
                json!({"nodeId": node.id, "iteration": frame.iteration}),
            );
            store_and_complete(node, output, ctx, queue, events, consumers, governor, pruned)?;
            Ok(InlineFlow::Progressed)
        }
        NodeKind::LoopEnd => {
            let loop_id = loop_id_of(node)?;
            let context = loop_context(workflow, &loop_id)?;
            if queue.any_unfinished_in(&context.body_nodes) {
                // The body has stragglers (side branches); decide once it
                // quiesces.
                queue.revert_to_ready(&node.id);
                return Ok(InlineFlow::Deferred);
            }
            let frame = ctx
                .loop_frame(&loop_id)
                .ok_or_else(|| internal_error(format!("no loop frame for '{loop_id}'")))?
                .clone();
            let next_iteration = frame.iteration + 1;
            let keep_going = match context.kind {
                LoopKind::ForEach => {
                    let total = frame.items.as_ref().map(|items| items.len()).unwrap_or(0);
                    (next_iteration as usize) < total
                }
                LoopKind::Count => next_iteration < context.count.unwrap_or(0),
                LoopKind::While => {
                    let condition = frame
                        .condition
                        .clone()
                        .ok_or_else(|| internal_error("while loop without condition"))?;
                    is_truthy(&interpolate::interpolate_string(&condition, ctx)?)
                }
            };
            if keep_going {
                queue.readmit_loop(&loop_id)?;
                *ctx = ctx.update_loop_frame(&loop_id, |frame| {
                    frame.iteration = next_iteration;
                    frame.item_index = Some(next_iteration as usize);
                })?;
                events.emit(
                    EventKind::NodeCompleted,
                    json!({"nodeId": node.id, "continue": true, "iteration": next_iteration}),
                );
                Ok(InlineFlow::Progressed)
            } else {
                *ctx = ctx.pop_loop_frame(&loop_id)?;
                events.emit(EventKind::NodeStarted, json!({"nodeId": node.id}));
                store_and_complete(
                    node,
                    json!({"continue": false, "completed": true, "iteration": next_iteration}),
                    ctx,
                    queue,
                    events,
                    consumers,
                    governor,
                    pruned,
                )?;
                Ok(InlineFlow::Progressed)
            }
        }
        NodeKind::Parallel => {
            events.emit(
                EventKind::NodeStarted,
                json!({"nodeId": node.id, "nodeName": node.name, "nodeType": "parallel"}),
            );
            let branches = workflow
                .parallel_branches
                .get(&node.id)
                .cloned()
                .unwrap_or_default();
            store_and_complete(
                node,
                json!({"branches": branches}),
                ctx,
                queue,
                events,
                consumers,
                governor,
                pruned,
            )?;
            Ok(InlineFlow::Progressed)
        }
        NodeKind::Output => {
            events.emit(
                EventKind::NodeStarted,
                json!({"nodeId": node.id, "nodeName": node.name, "nodeType": "output"}),
            );
            let output = output_node_value(node, ctx, queue)?;
            store_and_complete(node, output, ctx, queue, events, consumers, governor, pruned)?;
            Ok(InlineFlow::Progressed)
        }
        _ => Err(internal_error(format!(
            "node kind '{}' cannot execute inline",
            node.kind.as_str()
        ))),
    }
}

/// An output node forwards its `value` config entry when present, otherwise
/// passes its single dependency's output through, otherwise its interpolated
/// config.
fn output_node_value(
    node: &ExecutableNode,
    ctx: &ContextSnapshot,
    queue: &ExecutionQueue,
) -> Result<Value> {
    if let Some(value) = node.config.get("value") {
        return ctx.interpolate(value);
    }
    let completed_deps: Vec<&NodeId> = node
        .dependencies
        .iter()
        .filter(|dep| queue.output(dep).is_some())
        .collect();
    if completed_deps.len() == 1 {
        if let Some(output) = queue.output(completed_deps[0]) {
            return Ok(output.as_ref().clone());
        }
    }
    ctx.interpolate(&node.config)
}

#[allow(clippy::too_many_arguments)]
fn store_and_complete(
    node: &ExecutableNode,
    value: Value,
    ctx: &mut ContextSnapshot,
    queue: &mut ExecutionQueue,
    events: &mut EventChannel,
    consumers: &HashMap<NodeId, Vec<NodeId>>,
    governor: &SizeGovernor,
    pruned: &mut u64,
) -> Result<()> {
    let outcome = {
        let required = |candidate: &str| {
            consumers
                .get(candidate)
                .map(|dependents| {
                    dependents.iter().any(|dependent| {
                        queue
                            .state(dependent)
                            .map(|state| !state.is_terminal())
                            .unwrap_or(false)
                    })
                })
                .unwrap_or(false)
        };
        governor.admit(ctx, &node.id, value, &required)?
    };
    *pruned += outcome.evicted.len() as u64;
    let stored_bytes = outcome.stored_bytes;
    let truncated = outcome.truncated;
    *ctx = outcome.snapshot;
    let output = ctx
        .node_output(&node.id)
        .unwrap_or_else(|| Arc::new(json!({})));
    queue.mark_completed(&node.id, output);
    events.emit(
        EventKind::NodeCompleted,
        json!({
            "nodeId": node.id,
            "outputBytes": stored_bytes,
            "truncated": truncated,
        }),
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn process_completion(
    completion: ActivityCompletion,
    workflow: &Arc<BuiltWorkflow>,
    ctx: &mut ContextSnapshot,
    queue: &mut ExecutionQueue,
    events: &mut EventChannel,
    consumers: &HashMap<NodeId, Vec<NodeId>>,
    governor: &SizeGovernor,
    pruned: &mut u64,
    output_failure: &mut Option<ExecutionFailure>,
) -> Result<()> {
    let node = workflow
        .node(&completion.node_id)
        .ok_or_else(|| internal_error(format!("unknown node '{}'", completion.node_id)))?
        .clone();

    if let Some(branch) = &node.branch {
        *ctx = ctx.pop_parallel_frame(&branch.parallel_node_id, &branch.branch_id)?;
    }

    match completion.result {
        Ok(result) if result.success => {
            if node.kind == NodeKind::Conditional
                && result.result.get("result").and_then(Value::as_bool).is_none()
            {
                handle_node_failure(
                    &node,
                    "validation",
                    "conditional node produced no boolean 'result'",
                    workflow,
                    ctx,
                    queue,
                    events,
                    output_failure,
                );
                return Ok(());
            }

            apply_variable_signals(&result, ctx);
            emit_signal_events(events, &result);

            match store_and_complete(
                &node,
                result.result.clone(),
                ctx,
                queue,
                events,
                consumers,
                governor,
                pruned,
            ) {
                Ok(()) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    handle_node_failure(
                        &node,
                        err.code(),
                        &err.to_string(),
                        workflow,
                        ctx,
                        queue,
                        events,
                        output_failure,
                    );
                    return Ok(());
                }
            }
            if node.kind == NodeKind::HumanReview {
                events.emit(
                    EventKind::ApprovalResolved,
                    json!({"nodeId": node.id, "approved": true}),
                );
            }
            let completed = queue.nodes_in(crate::queue::NodeState::Completed).len();
            events.emit(
                EventKind::ExecutionProgress,
                json!({"completed": completed, "total": workflow.reachable_count()}),
            );
            Ok(())
        }
        Ok(result) => {
            let (kind, message) = result
                .error
                .as_ref()
                .map(|error| (error.kind.as_str(), error.message.clone()))
                .unwrap_or(("other", "handler reported failure".to_string()));
            if node.kind == NodeKind::HumanReview {
                events.emit(
                    EventKind::ApprovalResolved,
                    json!({"nodeId": node.id, "approved": false}),
                );
            }
            handle_node_failure(
                &node, kind, &message, workflow, ctx, queue, events, output_failure,
            );
            Ok(())
        }
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            handle_node_failure(
                &node,
                err.code(),
                &err.to_string(),
                workflow,
                ctx,
                queue,
                events,
                output_failure,
            );
            Ok(())
        }
    }
}

/// Handlers update the variable namespace through the `setVariables` signal.
fn apply_variable_signals(result: &ActivityResult, ctx: &mut ContextSnapshot) {
    let Some(updates) = result
        .signals
        .as_ref()
        .and_then(|signals| signals.get("setVariables"))
        .and_then(Value::as_object)
    else {
        return;
    };
    for (name, value) in updates {
        *ctx = ctx.set_variable(name.clone(), value.clone());
    }
}

fn emit_signal_events(events: &mut EventChannel, result: &ActivityResult) {
    let Some(signal_events) = result
        .signals
        .as_ref()
        .and_then(|signals| signals.get("events"))
        .and_then(Value::as_array)
    else {
        return;
    };
    for entry in signal_events {
        let kind = entry
            .get("kind")
            .and_then(Value::as_str)
            .and_then(EventKind::from_signal_name);
        if let Some(kind) = kind {
            let payload = entry.get("payload").cloned().unwrap_or(Value::Null);
            events.emit(kind, payload);
        }
    }
}

/// Record a node failure: store an error-shaped output when an error edge
/// will consume it, let the queue divert or dependency-skip, and track
/// whether the skip reached a terminal output node (which decides the run).
#[allow(clippy::too_many_arguments)]
fn handle_node_failure(
    node: &ExecutableNode,
    kind: &str,
    message: &str,
    workflow: &Arc<BuiltWorkflow>,
    ctx: &mut ContextSnapshot,
    queue: &mut ExecutionQueue,
    events: &mut EventChannel,
    output_failure: &mut Option<ExecutionFailure>,
) {
    tracing::warn!(node_id = %node.id, kind, message, "node failed");
    let error_output = if workflow.has_error_edge(&node.id) {
        let value = json!({"error": true, "type": kind, "message": message});
        *ctx = ctx.store_node_output(&node.id, value);
        ctx.node_output(&node.id)
    } else {
        None
    };
    let diverted = error_output.is_some();
    let skipped = queue.mark_failed(&node.id, error_output);

    events.emit(
        EventKind::NodeFailed,
        json!({
            "nodeId": node.id,
            "errorType": kind,
            "message": message,
            "recovered": diverted,
        }),
    );

    if !diverted {
        let hits_output = workflow.output_node_ids.contains(&node.id)
            || skipped
                .iter()
                .any(|skipped_id| workflow.output_node_ids.contains(skipped_id));
        if hits_output && output_failure.is_none() {
            *output_failure = Some(ExecutionFailure {
                code: "NODE_FAILED".to_string(),
                message: format!("node '{}' failed: {message}", node.id),
                failed_node_id: Some(node.id.clone()),
            });
        }
    }
}

fn build_consumers(workflow: &BuiltWorkflow) -> HashMap<NodeId, Vec<NodeId>> {
    let mut consumers: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for node in workflow.nodes.values() {
        for dependency in &node.dependencies {
            consumers
                .entry(dependency.clone())
                .or_default()
                .push(node.id.clone());
        }
        if let Some(refs) = workflow.template_refs(&node.id) {
            for referenced in refs {
                consumers
                    .entry(referenced.clone())
                    .or_default()
                    .push(node.id.clone());
            }
        }
    }
    consumers
}

fn resolve_items(array_path: &str, ctx: &ContextSnapshot) -> Result<Vec<Value>> {
    let template = if array_path.contains("{{") {
        array_path.to_string()
    } else {
        format!("{{{{{array_path}}}}}")
    };
    let value = interpolate::interpolate_string(&template, ctx)?;
    match value {
        Value::Array(items) => Ok(items),
        other => Err(EngineError::InterpolationFailed {
            template,
            message: format!("arrayPath resolved to {}, expected an array", kind_of(&other)),
        }),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

fn loop_id_of(node: &ExecutableNode) -> Result<NodeId> {
    node.config
        .get("loopNodeId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| internal_error(format!("sentinel '{}' missing loopNodeId", node.id)))
}

fn loop_context<'a>(
    workflow: &'a BuiltWorkflow,
    loop_id: &str,
) -> Result<&'a crate::builder::LoopContext> {
    workflow
        .loop_contexts
        .get(loop_id)
        .ok_or_else(|| internal_error(format!("no loop context for '{loop_id}'")))
}

fn internal_error(message: impl Into<String>) -> EngineError {
    EngineError::Internal(message.into())
}

fn internal_failure(message: impl Into<String>) -> ExecutionFailure {
    ExecutionFailure {
        code: "INTERNAL".to_string(),
        message: message.into(),
        failed_node_id: None,
    }
}

#[allow(clippy::too_many_arguments)]
fn finish_failed(
    events: &mut EventChannel,
    started: Instant,
    workflow: &BuiltWorkflow,
    failure: ExecutionFailure,
    retried: u64,
    pruned: u64,
    outputs: Map<String, Value>,
) -> ExecutionOutcome {
    events.emit(
        EventKind::ExecutionFailed,
        json!({
            "failedNodeId": failure.failed_node_id,
            "kind": failure.code,
            "message": failure.message,
        }),
    );
    ExecutionOutcome {
        success: false,
        outputs,
        failed_node_id: failure.failed_node_id.clone(),
        error: Some(failure),
        metrics: ExecutionMetrics {
            duration_ms: started.elapsed().as_millis() as u64,
            node_count: workflow.reachable_count() as u64,
            retried_count: retried,
            pruned_output_count: pruned,
        },
    }
}
