//! The engine core: `Create` / `Tick` / `Run` / `Cancel`, and the
//! `ApplyResult` step that drives the state machine.
//!
//! A plain struct holding `Arc`s to its collaborators plus a config,
//! `#[tracing::instrument]` on every public entry point, a short-circuit
//! on terminal status at the top of the driver method, and
//! `EngineDriverError`'s split between "this is a normal outcome" and
//! "this is a bug/infra failure". It is a load-mutate-save driver over a
//! single durable record, advancing a declarative `Flow` graph one step
//! at a time through a `step.type`-keyed `Handler`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::{EngineError, ErrorCode};
use crate::events::{EngineEvent, EventBus};
use crate::execution::{Execution, ExecutionError, ExecutionStatus, ExecutionStore};
use crate::flow::{Flow, FlowRegistry, Step};
use crate::handler::{HandlerParams, HandlerRegistry, StepOutcome, StepResult};
use crate::input::resolve as resolve_input;
use crate::pipe::{run_pipes, PipeOutcome, TableStore, Wal};
use crate::token::{GenerateOptions, ResumeTokenManager};

/// Everything the engine needs to drive executions: store, registries,
/// config, plus the extra collaborators this engine's data-driven model
/// introduces (event bus, token manager, table store, WAL).
pub struct Engine {
    store: Arc<dyn ExecutionStore>,
    flows: Arc<FlowRegistry>,
    handlers: Arc<HandlerRegistry>,
    events: Arc<dyn EventBus>,
    tokens: Arc<dyn ResumeTokenManager>,
    tables: Arc<dyn TableStore>,
    wal: Option<Arc<dyn Wal>>,
    config: EngineConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineDriverError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] crate::execution::StoreError),
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub execution_id: Option<String>,
    pub tenant_id: Option<String>,
    pub parent_execution_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub idempotency_window_ms: Option<i64>,
    pub metadata: Option<serde_json::Value>,
    pub flow_version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateResult {
    pub execution: Execution,
    pub created: bool,
    pub idempotency_hit: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Success,
    Failure,
    Wait,
}

#[derive(Debug, Clone)]
pub struct TickResult {
    pub done: bool,
    pub status: ExecutionStatus,
    pub step_id: Option<String>,
    pub outcome: Option<TickOutcome>,
    pub wake_at: Option<DateTime<Utc>>,
    pub error: Option<ExecutionError>,
}

impl TickResult {
    fn not_found() -> Self {
        Self {
            done: true,
            status: ExecutionStatus::Failed,
            step_id: None,
            outcome: None,
            wake_at: None,
            error: Some(ExecutionError {
                code: ErrorCode::ExecutionNotFound.as_str().to_string(),
                message: "execution not found".to_string(),
                step_id: None,
                details: None,
                timestamp: Utc::now(),
            }),
        }
    }

    fn from_execution(execution: &Execution, done: bool) -> Self {
        Self {
            done,
            status: execution.status,
            step_id: Some(execution.current_step_id.clone()),
            outcome: None,
            wake_at: execution.wake_at,
            error: execution.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub simulate_time: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationSourceArg {
    User,
    Timeout,
    System,
    Parent,
}

impl From<CancellationSourceArg> for crate::execution::CancellationSource {
    fn from(value: CancellationSourceArg) -> Self {
        match value {
            CancellationSourceArg::User => crate::execution::CancellationSource::User,
            CancellationSourceArg::Timeout => crate::execution::CancellationSource::Timeout,
            CancellationSourceArg::System => crate::execution::CancellationSource::System,
            CancellationSourceArg::Parent => crate::execution::CancellationSource::Parent,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelOptions {
    pub source: Option<CancellationSourceArg>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CancelResult {
    pub execution_id: String,
    pub previous_status: Option<ExecutionStatus>,
    pub cancelled: bool,
    pub tokens_invalidated: usize,
    pub children_cancelled: usize,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        flows: Arc<FlowRegistry>,
        handlers: Arc<HandlerRegistry>,
        events: Arc<dyn EventBus>,
        tokens: Arc<dyn ResumeTokenManager>,
        tables: Arc<dyn TableStore>,
    ) -> Self {
        Self {
            store,
            flows,
            handlers,
            events,
            tokens,
            tables,
            wal: None,
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_wal(mut self, wal: Arc<dyn Wal>) -> Self {
        self.wal = Some(wal);
        self
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    #[tracing::instrument(skip(self, context, options), fields(flow_id = %flow_id))]
    pub async fn create(
        &self,
        flow_id: &str,
        context: serde_json::Value,
        options: CreateOptions,
    ) -> Result<CreateResult, EngineDriverError> {
        let now = Utc::now();

        if let Some(key) = &options.idempotency_key {
            if let Some(existing) = self.store.find_by_idempotency_key(flow_id, key, now).await? {
                self.events
                    .publish(EngineEvent::IdempotencyHit {
                        execution_id: existing.id.clone(),
                        flow_id: flow_id.to_string(),
                        timestamp: now,
                    })
                    .await;
                return Ok(CreateResult {
                    execution: existing,
                    created: false,
                    idempotency_hit: true,
                });
            }
        }

        let flow = self
            .flows
            .get(flow_id, options.flow_version.as_deref())
            .map_err(|_| EngineError::flow_not_found(flow_id))?;

        let context_map = match context {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            serde_json::Value::Null => Default::default(),
            other => {
                let mut map = std::collections::BTreeMap::new();
                map.insert("value".to_string(), other);
                map
            }
        };

        let mut execution = Execution::new_pending(
            options.execution_id,
            flow.id.clone(),
            flow.version.clone(),
            flow.initial_step_id.clone(),
            context_map,
        );
        execution.tenant_id = options.tenant_id;
        execution.parent_execution_id = options.parent_execution_id;
        execution.metadata = options.metadata;

        if let Some(key) = options.idempotency_key {
            let window_ms = options
                .idempotency_window_ms
                .unwrap_or_else(|| self.config.max_idempotency_window.as_millis() as i64)
                .min(self.config.max_idempotency_window.as_millis() as i64);
            execution.idempotency_key = Some(key);
            execution.idempotency_expires_at = Some(now + chrono::Duration::milliseconds(window_ms));
        }

        self.store.save(&execution).await?;
        tracing::info!(execution_id = %execution.id, "execution created");
        self.events
            .publish(EngineEvent::ExecutionCreated {
                execution_id: execution.id.clone(),
                flow_id: flow.id.clone(),
                timestamp: now,
            })
            .await;

        Ok(CreateResult {
            execution,
            created: true,
            idempotency_hit: false,
        })
    }

    #[tracing::instrument(skip(self), fields(execution_id = %execution_id))]
    pub async fn tick(&self, execution_id: &str) -> Result<TickResult, EngineDriverError> {
        let Some(mut execution) = self.store.load(execution_id).await? else {
            return Ok(TickResult::not_found());
        };

        if execution.status.is_terminal() {
            return Ok(TickResult::from_execution(&execution, true));
        }

        if execution.status == ExecutionStatus::Cancelling {
            return Ok(TickResult::from_execution(&execution, false));
        }

        let now = Utc::now();
        if execution.status == ExecutionStatus::Waiting {
            match execution.wake_at {
                Some(wake_at) if wake_at > now => {
                    return Ok(TickResult::from_execution(&execution, false));
                }
                _ => {
                    tracing::debug!(execution_id = %execution.id, "execution resumed");
                    self.events
                        .publish(EngineEvent::ExecutionResumed {
                            execution_id: execution.id.clone(),
                            timestamp: now,
                        })
                        .await;
                }
            }
        }

        if execution.step_count >= self.config.max_steps {
            return self.fail_execution(execution, EngineError::new(ErrorCode::MaxSteps, "max step count reached"), None).await;
        }

        let flow = match self.flows.get(&execution.flow_id, Some(&execution.flow_version)) {
            Ok(flow) => flow,
            Err(_) => {
                return self
                    .fail_execution(
                        execution,
                        EngineError::flow_not_found(&execution.flow_id),
                        None,
                    )
                    .await
            }
        };

        let step_id = execution.current_step_id.clone();
        let step = match flow.step(&step_id) {
            Some(step) => step.clone(),
            None => {
                return self
                    .fail_execution(execution, EngineError::step_not_found(&step_id), Some(step_id))
                    .await
            }
        };

        let handler = match self.handlers.get(&step.r#type) {
            Some(handler) => handler,
            None => {
                return self
                    .fail_execution(
                        execution,
                        EngineError::handler_not_found(&step.r#type),
                        Some(step_id),
                    )
                    .await
            }
        };

        let input = resolve_input(&step.input, &execution.context);

        if execution.status == ExecutionStatus::Pending {
            execution.status = ExecutionStatus::Running;
            self.events
                .publish(EngineEvent::ExecutionStarted {
                    execution_id: execution.id.clone(),
                    timestamp: now,
                })
                .await;
        }

        self.events
            .publish(EngineEvent::StepStarted {
                execution_id: execution.id.clone(),
                step_id: step.id.clone(),
                timestamp: now,
            })
            .await;

        let timeout = step
            .timeout_ms
            .map(StdDuration::from_millis)
            .unwrap_or(self.config.default_step_timeout);

        let signal = CancellationToken::new();
        let ctx_limits = self.config.context_limits;
        let context_helper = Context::from_map(execution.context.clone(), ctx_limits);

        let started_at = Utc::now();
        let result = match tokio::time::timeout(
            timeout,
            handler.execute(HandlerParams {
                step: &step,
                input,
                context: &context_helper,
                execution: &execution,
                token_manager: Some(self.tokens.clone()),
                signal: signal.clone(),
            }),
        )
        .await
        {
            Ok(result) => result,
            Err(_elapsed) => {
                signal.cancel();
                self.events
                    .publish(EngineEvent::StepTimeout {
                        execution_id: execution.id.clone(),
                        step_id: step.id.clone(),
                        timestamp: Utc::now(),
                    })
                    .await;
                StepResult::failure(crate::handler::StepError::new(
                    ErrorCode::HandlerError.as_str(),
                    format!("step '{}' timed out after {}ms", step.id, timeout.as_millis()),
                ))
            }
        };
        let completed_at = Utc::now();

        let outcome_label = match &result.outcome {
            StepOutcome::Success => "success",
            StepOutcome::Failure(_) => "failure",
            StepOutcome::Wait { .. } => "wait",
        };
        self.events
            .publish(EngineEvent::StepCompleted {
                execution_id: execution.id.clone(),
                step_id: step.id.clone(),
                outcome: outcome_label.to_string(),
                duration_ms: (completed_at - started_at).num_milliseconds(),
                timestamp: completed_at,
            })
            .await;

        execution.history.push(crate::execution::HistoryEntry {
            step_id: step.id.clone(),
            outcome: outcome_label.to_string(),
            output: result.output.clone(),
            error: match &result.outcome {
                StepOutcome::Failure(err) => Some(ExecutionError {
                    code: err.code.clone(),
                    message: err.message.clone(),
                    step_id: Some(step.id.clone()),
                    details: err.details.clone(),
                    timestamp: completed_at,
                }),
                _ => None,
            },
            started_at,
            completed_at,
        });

        execution.step_count += 1;

        self.apply_result(execution, &flow, &step, result).await
    }

    async fn fail_execution(
        &self,
        mut execution: Execution,
        err: EngineError,
        step_id: Option<String>,
    ) -> Result<TickResult, EngineDriverError> {
        execution.status = ExecutionStatus::Failed;
        execution.error = Some(ExecutionError::from_engine_error(&err, step_id));
        execution.touch();
        self.store.save(&execution).await?;
        self.events
            .publish(EngineEvent::ExecutionFailed {
                execution_id: execution.id.clone(),
                code: err.code.as_str().to_string(),
                message: err.message.clone(),
                timestamp: Utc::now(),
            })
            .await;
        Ok(TickResult::from_execution(&execution, true))
    }

    async fn apply_result(
        &self,
        mut execution: Execution,
        flow: &Flow,
        step: &Step,
        result: StepResult,
    ) -> Result<TickResult, EngineDriverError> {
        let pipe_outcome = match result.outcome {
            StepOutcome::Success => PipeOutcome::Success,
            StepOutcome::Failure(_) => PipeOutcome::Failure,
            StepOutcome::Wait { .. } => PipeOutcome::Wait,
        };

        if let (Some(output), Some(output_key)) = (&result.output, &step.output_key) {
            if matches!(result.outcome, StepOutcome::Success | StepOutcome::Wait { .. }) {
                let mut ctx = Context::from_map(
                    std::mem::take(&mut execution.context),
                    self.config.context_limits,
                );
                let _ = ctx.set_path(output_key, output.clone());
                execution.context = ctx.into_map();
            }
        }

        run_pipes(
            flow.pipes_for_step(&step.id),
            pipe_outcome,
            result.output.as_ref(),
            execution.tenant_id.as_deref(),
            &execution.id,
            self.tables.as_ref(),
            self.wal.as_deref(),
            &self.events,
        )
        .await;

        match result.outcome {
            StepOutcome::Success => {
                execution.retry_attempts.remove(&step.id);
                let next = result
                    .next_step_override
                    .unwrap_or_else(|| step.transitions.on_success.clone());
                self.advance_or_complete(execution, flow, step, next, true).await
            }
            StepOutcome::Failure(err) => {
                if let Some(retry) = &step.retry {
                    let attempt = *execution.retry_attempts.get(&step.id).unwrap_or(&0);
                    if retry.retries(Some(&err.code)) && attempt < retry.max_attempts {
                        execution.retry_attempts.insert(step.id.clone(), attempt + 1);
                        let backoff_ms = retry.backoff_for_attempt(attempt);
                        self.events
                            .publish(EngineEvent::StepRetry {
                                execution_id: execution.id.clone(),
                                step_id: step.id.clone(),
                                attempt: attempt + 1,
                                max_attempts: retry.max_attempts,
                                backoff_ms,
                                timestamp: Utc::now(),
                            })
                            .await;

                        if backoff_ms > 0 {
                            execution.status = ExecutionStatus::Waiting;
                            execution.wake_at =
                                Some(Utc::now() + chrono::Duration::milliseconds(backoff_ms as i64));
                            execution.wait_started_at = Some(Utc::now());
                            execution.wait_reason =
                                Some(format!("Retry {}/{} after {}ms", attempt + 1, retry.max_attempts, backoff_ms));
                            execution.touch();
                            self.store.save(&execution).await?;
                            return Ok(TickResult::from_execution(&execution, false));
                        }

                        execution.status = ExecutionStatus::Running;
                        execution.touch();
                        self.store.save(&execution).await?;
                        return Ok(TickResult::from_execution(&execution, false));
                    }
                }

                execution.retry_attempts.remove(&step.id);
                let exec_error = ExecutionError {
                    code: err.code.clone(),
                    message: err.message.clone(),
                    step_id: Some(step.id.clone()),
                    details: err.details.clone(),
                    timestamp: Utc::now(),
                };
                let next = result
                    .next_step_override
                    .unwrap_or_else(|| step.transitions.on_failure.clone());

                match next {
                    None => {
                        execution.status = ExecutionStatus::Failed;
                        execution.error = Some(exec_error);
                        execution.touch();
                        self.store.save(&execution).await?;
                        self.events
                            .publish(EngineEvent::ExecutionFailed {
                                execution_id: execution.id.clone(),
                                code: err.code,
                                message: err.message,
                                timestamp: Utc::now(),
                            })
                            .await;
                        Ok(TickResult::from_execution(&execution, true))
                    }
                    Some(next_step) => {
                        if !flow.steps.contains_key(&next_step) {
                            return self
                                .fail_execution(
                                    execution,
                                    EngineError::new(
                                        ErrorCode::InvalidTransition,
                                        format!("unknown transition target '{next_step}'"),
                                    ),
                                    Some(step.id.clone()),
                                )
                                .await;
                        }
                        execution.current_step_id = next_step.clone();
                        execution.status = ExecutionStatus::Running;
                        execution.touch();
                        self.store.save(&execution).await?;
                        self.events
                            .publish(EngineEvent::Transition {
                                execution_id: execution.id.clone(),
                                from_step_id: step.id.clone(),
                                to_step_id: next_step,
                                outcome: "failure".to_string(),
                                timestamp: Utc::now(),
                            })
                            .await;
                        Ok(TickResult::from_execution(&execution, false))
                    }
                }
            }
            StepOutcome::Wait {
                wake_at_ms,
                wait_reason,
                resume_token,
            } => {
                execution.status = ExecutionStatus::Waiting;
                execution.wake_at = wake_at_ms.and_then(DateTime::from_timestamp_millis);
                execution.wait_reason = wait_reason;
                execution.wait_started_at = Some(Utc::now());

                // A wait with no scheduled wake must leave an outstanding resume
                // token, otherwise nothing could ever drive it forward. A handler
                // that already minted its own token via `token_manager` is left
                // alone; the engine only fills in the gap.
                if execution.wake_at.is_none() && resume_token.is_none() {
                    match self
                        .tokens
                        .generate(&execution.id, &step.id, GenerateOptions::default())
                        .await
                    {
                        Ok(token) => {
                            self.events
                                .publish(EngineEvent::TokenCreated {
                                    token: token.token,
                                    execution_id: execution.id.clone(),
                                    timestamp: Utc::now(),
                                })
                                .await;
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "failed to generate resume token for waiting execution");
                        }
                    }
                }

                let next = step
                    .transitions
                    .on_resume
                    .clone()
                    .or_else(|| step.transitions.on_success.clone());
                if let Some(next_step) = next {
                    if flow.steps.contains_key(&next_step) {
                        execution.current_step_id = next_step;
                    }
                }

                execution.touch();
                self.store.save(&execution).await?;
                self.events
                    .publish(EngineEvent::ExecutionWaiting {
                        execution_id: execution.id.clone(),
                        wake_at: execution.wake_at,
                        timestamp: Utc::now(),
                    })
                    .await;
                Ok(TickResult::from_execution(&execution, false))
            }
        }
    }

    async fn advance_or_complete(
        &self,
        mut execution: Execution,
        flow: &Flow,
        step: &Step,
        next: Option<String>,
        success: bool,
    ) -> Result<TickResult, EngineDriverError> {
        match next {
            None => {
                execution.status = ExecutionStatus::Completed;
                execution.touch();
                self.store.save(&execution).await?;
                self.events
                    .publish(EngineEvent::ExecutionCompleted {
                        execution_id: execution.id.clone(),
                        timestamp: Utc::now(),
                    })
                    .await;
                Ok(TickResult::from_execution(&execution, true))
            }
            Some(next_step) => {
                if !flow.steps.contains_key(&next_step) {
                    return self
                        .fail_execution(
                            execution,
                            EngineError::new(
                                ErrorCode::InvalidTransition,
                                format!("unknown transition target '{next_step}'"),
                            ),
                            Some(step.id.clone()),
                        )
                        .await;
                }
                execution.current_step_id = next_step.clone();
                execution.status = ExecutionStatus::Running;
                execution.touch();
                self.store.save(&execution).await?;
                self.events
                    .publish(EngineEvent::Transition {
                        execution_id: execution.id.clone(),
                        from_step_id: step.id.clone(),
                        to_step_id: next_step,
                        outcome: if success { "success" } else { "failure" }.to_string(),
                        timestamp: Utc::now(),
                    })
                    .await;
                Ok(TickResult::from_execution(&execution, false))
            }
        }
    }

    #[tracing::instrument(skip(self, options), fields(execution_id = %execution_id))]
    pub async fn run(
        &self,
        execution_id: &str,
        options: RunOptions,
    ) -> Result<TickResult, EngineDriverError> {
        let mut iterations = 0u64;
        loop {
            iterations += 1;
            if iterations > self.config.max_run_iterations {
                return Err(EngineError::new(ErrorCode::MaxIterations, "run exceeded max iterations").into());
            }

            let result = self.tick(execution_id).await?;
            if result.done {
                return Ok(result);
            }

            if result.status == ExecutionStatus::Waiting {
                if options.simulate_time {
                    if let Some(mut execution) = self.store.load(execution_id).await? {
                        execution.wake_at = Some(Utc::now());
                        self.store.save(&execution).await?;
                    }
                    continue;
                }
                if let Some(wake_at) = result.wake_at {
                    let delay = (wake_at - Utc::now()).to_std().unwrap_or(StdDuration::ZERO);
                    tokio::time::sleep(delay).await;
                }
                continue;
            }

            if result.status == ExecutionStatus::Cancelling {
                return Ok(result);
            }
        }
    }

    /// Recursive cancellation cascade. Boxed because async fns cannot
    /// recurse directly.
    pub fn cancel<'a>(
        &'a self,
        execution_id: &'a str,
        options: CancelOptions,
    ) -> Pin<Box<dyn Future<Output = Result<CancelResult, EngineDriverError>> + Send + 'a>> {
        Box::pin(async move {
            let Some(mut execution) = self.store.load(execution_id).await? else {
                return Ok(CancelResult {
                    execution_id: execution_id.to_string(),
                    previous_status: None,
                    cancelled: false,
                    tokens_invalidated: 0,
                    children_cancelled: 0,
                    cancelled_at: None,
                });
            };

            let previous_status = execution.status;
            if !previous_status.is_cancellable() {
                return Ok(CancelResult {
                    execution_id: execution_id.to_string(),
                    previous_status: Some(previous_status),
                    cancelled: false,
                    tokens_invalidated: 0,
                    children_cancelled: 0,
                    cancelled_at: None,
                });
            }

            execution.status = ExecutionStatus::Cancelling;
            execution.touch();
            self.store.save(&execution).await?;

            let active_tokens = self.tokens.list_by_execution(execution_id).await;
            let mut tokens_invalidated = 0;
            for token in active_tokens {
                if self.tokens.revoke(&token.token).await.is_ok() {
                    tokens_invalidated += 1;
                }
            }

            let children = self.store.find_children(execution_id).await?;
            let mut children_cancelled = 0;
            for child in children {
                let result = self
                    .cancel(
                        &child.id,
                        CancelOptions {
                            source: Some(CancellationSourceArg::Parent),
                            reason: options.reason.clone(),
                        },
                    )
                    .await?;
                if result.cancelled {
                    children_cancelled += 1;
                }
            }

            let now = Utc::now();
            let source = options.source.unwrap_or(CancellationSourceArg::User);
            execution.status = ExecutionStatus::Cancelled;
            execution.cancellation = Some(crate::execution::Cancellation {
                source: source.into(),
                reason: options.reason.clone(),
                cancelled_at: now,
            });
            execution.touch();
            self.store.save(&execution).await?;

            self.events
                .publish(EngineEvent::ExecutionCancelled {
                    execution_id: execution.id.clone(),
                    source: format!("{:?}", source).to_lowercase(),
                    timestamp: now,
                })
                .await;
            self.events
                .publish(EngineEvent::ExecutionFailed {
                    execution_id: execution.id.clone(),
                    code: ErrorCode::Cancelled.as_str().to_string(),
                    message: "execution cancelled".to_string(),
                    timestamp: now,
                })
                .await;

            Ok(CancelResult {
                execution_id: execution_id.to_string(),
                previous_status: Some(previous_status),
                cancelled: true,
                tokens_invalidated,
                children_cancelled,
                cancelled_at: Some(now),
            })
        })
    }

    pub async fn get(&self, execution_id: &str) -> Result<Option<Execution>, EngineDriverError> {
        Ok(self.store.load(execution_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context as CtxHelper;
    use crate::events::InMemoryEventBus;
    use crate::execution::InMemoryExecutionStore;
    use crate::flow::{Flow, Step, Transitions};
    use crate::handler::{Handler, HandlerRegistry};
    use crate::input::InputSelector;
    use crate::pipe::InMemoryTableStore;
    use crate::token::InMemoryResumeTokenManager;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        fn handler_type(&self) -> &str {
            "echo"
        }

        async fn execute(&self, params: HandlerParams<'_>) -> StepResult {
            StepResult::success(Some(params.input))
        }
    }

    struct UpperHandler;

    #[async_trait]
    impl Handler for UpperHandler {
        fn handler_type(&self) -> &str {
            "upper"
        }

        async fn execute(&self, params: HandlerParams<'_>) -> StepResult {
            let s = params.input.as_str().unwrap_or_default().to_uppercase();
            StepResult::success(Some(json!(s)))
        }
    }

    /// Fails twice with `TRANSIENT`, then succeeds. Used to exercise the
    /// retry-then-succeed scenario.
    struct FlakyHandler {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Handler for FlakyHandler {
        fn handler_type(&self) -> &str {
            "flaky"
        }

        async fn execute(&self, _params: HandlerParams<'_>) -> StepResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < 2 {
                StepResult::failure(crate::handler::StepError::new("TRANSIENT", "not yet"))
            } else {
                StepResult::success(Some(json!("done")))
            }
        }
    }

    fn harness() -> (
        Engine,
        Arc<InMemoryExecutionStore>,
        Arc<FlowRegistry>,
        Arc<HandlerRegistry>,
    ) {
        let store = Arc::new(InMemoryExecutionStore::new());
        let flows = Arc::new(FlowRegistry::new());
        let handlers = Arc::new(HandlerRegistry::new());
        let events: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
        let tokens: Arc<dyn ResumeTokenManager> = Arc::new(InMemoryResumeTokenManager::new());
        let tables: Arc<dyn TableStore> = Arc::new(InMemoryTableStore::new());

        let engine = Engine::new(
            store.clone() as Arc<dyn ExecutionStore>,
            flows.clone(),
            handlers.clone(),
            events,
            tokens,
            tables,
        );
        (engine, store, flows, handlers)
    }

    fn step(id: &str, r#type: &str, input: InputSelector, on_success: Option<&str>) -> Step {
        Step {
            id: id.to_string(),
            r#type: r#type.to_string(),
            config: serde_json::Value::Null,
            input,
            output_key: Some(match id {
                "echo" => "echoed".to_string(),
                _ => "result".to_string(),
            }),
            transitions: Transitions {
                on_success: on_success.map(str::to_string),
                on_failure: None,
                on_resume: None,
            },
            retry: None,
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn s1_simple_chain_completes() {
        let (engine, _store, flows, handlers) = harness();
        handlers.register(Arc::new(EchoHandler)).unwrap();
        handlers.register(Arc::new(UpperHandler)).unwrap();

        let mut steps = BTreeMap::new();
        steps.insert(
            "echo".to_string(),
            step("echo", "echo", InputSelector::Key { key: "message".into() }, Some("transform")),
        );
        steps.insert(
            "transform".to_string(),
            step("transform", "upper", InputSelector::Path { path: "echoed".into() }, None),
        );
        flows
            .register(Flow {
                id: "simple".into(),
                version: "1".into(),
                initial_step_id: "echo".into(),
                steps,
                pipes: vec![],
            })
            .unwrap();

        let create = engine
            .create("simple", json!({"message": "hello"}), CreateOptions::default())
            .await
            .unwrap();
        assert!(create.created);

        let result = engine.run(&create.execution.id, RunOptions::default()).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);

        let exec = engine.get(&create.execution.id).await.unwrap().unwrap();
        assert_eq!(exec.context.get("echoed"), Some(&json!("hello")));
        assert_eq!(exec.context.get("result"), Some(&json!("HELLO")));
        assert_eq!(exec.step_count, 2);
    }

    #[tokio::test]
    async fn s3_retry_then_succeed() {
        let (engine, _store, flows, handlers) = harness();
        handlers
            .register(Arc::new(FlakyHandler {
                calls: AtomicU32::new(0),
            }))
            .unwrap();

        let mut flaky_step = step("flaky", "flaky", InputSelector::Full { full: true }, None);
        flaky_step.retry = Some(crate::flow::RetryPolicy {
            max_attempts: 3,
            backoff_ms: 1,
            backoff_multiplier: 2.0,
            max_backoff_ms: 1000,
            retry_on: Some(vec!["TRANSIENT".to_string()]),
        });

        let mut steps = BTreeMap::new();
        steps.insert("flaky".to_string(), flaky_step);
        flows
            .register(Flow {
                id: "retry".into(),
                version: "1".into(),
                initial_step_id: "flaky".into(),
                steps,
                pipes: vec![],
            })
            .unwrap();

        let create = engine.create("retry", json!({}), CreateOptions::default()).await.unwrap();
        let result = engine
            .run(&create.execution.id, RunOptions { simulate_time: true })
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);

        let exec = engine.get(&create.execution.id).await.unwrap().unwrap();
        assert!(!exec.retry_attempts.contains_key("flaky"));
    }

    #[tokio::test]
    async fn s4_non_retryable_failure_terminates() {
        let (engine, _store, flows, handlers) = harness();

        struct AlwaysFails;
        #[async_trait]
        impl Handler for AlwaysFails {
            fn handler_type(&self) -> &str {
                "always_fails"
            }
            async fn execute(&self, _params: HandlerParams<'_>) -> StepResult {
                StepResult::failure(crate::handler::StepError::new("PERMANENT", "nope"))
            }
        }
        handlers.register(Arc::new(AlwaysFails)).unwrap();

        let mut failing_step = step("fail", "always_fails", InputSelector::Full { full: true }, None);
        failing_step.retry = Some(crate::flow::RetryPolicy {
            max_attempts: 3,
            backoff_ms: 1,
            backoff_multiplier: 2.0,
            max_backoff_ms: 1000,
            retry_on: Some(vec!["TRANSIENT".to_string()]),
        });

        let mut steps = BTreeMap::new();
        steps.insert("fail".to_string(), failing_step);
        flows
            .register(Flow {
                id: "nonretry".into(),
                version: "1".into(),
                initial_step_id: "fail".into(),
                steps,
                pipes: vec![],
            })
            .unwrap();

        let create = engine.create("nonretry", json!({}), CreateOptions::default()).await.unwrap();
        let result = engine.run(&create.execution.id, RunOptions::default()).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn terminal_execution_freezes_on_tick() {
        let (engine, store, flows, handlers) = harness();
        handlers.register(Arc::new(EchoHandler)).unwrap();
        let mut steps = BTreeMap::new();
        steps.insert(
            "echo".to_string(),
            step("echo", "echo", InputSelector::Key { key: "message".into() }, None),
        );
        flows
            .register(Flow {
                id: "simple".into(),
                version: "1".into(),
                initial_step_id: "echo".into(),
                steps,
                pipes: vec![],
            })
            .unwrap();

        let create = engine.create("simple", json!({"message": "hi"}), CreateOptions::default()).await.unwrap();
        let _ = engine.run(&create.execution.id, RunOptions::default()).await.unwrap();
        let before = store.load(&create.execution.id).await.unwrap().unwrap();

        let result = engine.tick(&create.execution.id).await.unwrap();
        assert!(result.done);

        let after = store.load(&create.execution.id).await.unwrap().unwrap();
        assert_eq!(before.updated_at, after.updated_at);
    }

    #[tokio::test]
    async fn s7_idempotent_create_returns_existing() {
        let (engine, _store, flows, handlers) = harness();
        handlers.register(Arc::new(EchoHandler)).unwrap();
        let mut steps = BTreeMap::new();
        steps.insert(
            "echo".to_string(),
            step("echo", "echo", InputSelector::Key { key: "message".into() }, None),
        );
        flows
            .register(Flow {
                id: "simple".into(),
                version: "1".into(),
                initial_step_id: "echo".into(),
                steps,
                pipes: vec![],
            })
            .unwrap();

        let opts = CreateOptions {
            idempotency_key: Some("K".to_string()),
            ..Default::default()
        };
        let first = engine
            .create("simple", json!({"message": "first"}), opts.clone())
            .await
            .unwrap();
        assert!(first.created);

        let second = engine
            .create("simple", json!({"message": "second"}), opts)
            .await
            .unwrap();
        assert!(!second.created);
        assert!(second.idempotency_hit);
        assert_eq!(second.execution.id, first.execution.id);
        assert_eq!(second.execution.context.get("message"), Some(&json!("first")));
    }

    #[tokio::test]
    async fn s6_cascading_cancel() {
        let (engine, _store, flows, handlers) = harness();

        struct ForeverWaiting;
        #[async_trait]
        impl Handler for ForeverWaiting {
            fn handler_type(&self) -> &str {
                "wait"
            }
            async fn execute(&self, _params: HandlerParams<'_>) -> StepResult {
                StepResult::wait(None, Some("waiting for human".to_string()))
            }
        }
        handlers.register(Arc::new(ForeverWaiting)).unwrap();

        let mut steps = BTreeMap::new();
        steps.insert(
            "wait".to_string(),
            Step {
                id: "wait".to_string(),
                r#type: "wait".to_string(),
                config: serde_json::Value::Null,
                input: InputSelector::Full { full: true },
                output_key: None,
                transitions: Transitions {
                    on_success: Some("wait".to_string()),
                    on_failure: None,
                    on_resume: Some("wait".to_string()),
                },
                retry: None,
                timeout_ms: None,
            },
        );
        flows
            .register(Flow {
                id: "waiter".into(),
                version: "1".into(),
                initial_step_id: "wait".into(),
                steps,
                pipes: vec![],
            })
            .unwrap();

        let parent = engine.create("waiter", json!({}), CreateOptions::default()).await.unwrap();
        engine.tick(&parent.execution.id).await.unwrap();

        let child_opts = CreateOptions {
            parent_execution_id: Some(parent.execution.id.clone()),
            ..Default::default()
        };
        let child1 = engine.create("waiter", json!({}), child_opts.clone()).await.unwrap();
        engine.tick(&child1.execution.id).await.unwrap();
        let child2 = engine.create("waiter", json!({}), child_opts).await.unwrap();
        engine.tick(&child2.execution.id).await.unwrap();

        let cancel_result = engine
            .cancel(&parent.execution.id, CancelOptions {
                source: Some(CancellationSourceArg::User),
                reason: Some("user requested".to_string()),
            })
            .await
            .unwrap();

        assert!(cancel_result.cancelled);
        assert_eq!(cancel_result.children_cancelled, 2);
        assert_eq!(cancel_result.tokens_invalidated, 1);

        let c1 = engine.get(&child1.execution.id).await.unwrap().unwrap();
        assert_eq!(c1.status, ExecutionStatus::Cancelled);
        assert_eq!(
            c1.cancellation.unwrap().source,
            crate::execution::CancellationSource::Parent
        );
    }

    #[tokio::test]
    async fn max_steps_exceeded_fails_execution() {
        let (engine, _store, flows, handlers) = harness();

        struct LoopHandler;
        #[async_trait]
        impl Handler for LoopHandler {
            fn handler_type(&self) -> &str {
                "loop"
            }
            async fn execute(&self, _params: HandlerParams<'_>) -> StepResult {
                StepResult::success(None).with_next_step_override(Some("loop".to_string()))
            }
        }
        handlers.register(Arc::new(LoopHandler)).unwrap();

        let mut steps = BTreeMap::new();
        steps.insert(
            "loop".to_string(),
            Step {
                id: "loop".to_string(),
                r#type: "loop".to_string(),
                config: serde_json::Value::Null,
                input: InputSelector::Full { full: true },
                output_key: None,
                transitions: Transitions {
                    on_success: Some("loop".to_string()),
                    on_failure: None,
                    on_resume: None,
                },
                retry: None,
                timeout_ms: None,
            },
        );
        flows
            .register(Flow {
                id: "looper".into(),
                version: "1".into(),
                initial_step_id: "loop".into(),
                steps,
                pipes: vec![],
            })
            .unwrap();

        let create = engine.create("looper", json!({}), CreateOptions::default()).await.unwrap();
        let engine = engine.with_config(EngineConfig::default().with_max_steps(5));
        let result = engine.run(&create.execution.id, RunOptions::default()).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error.unwrap().code, "MAX_STEPS");
    }

    #[test]
    fn context_helper_is_reachable_from_engine_module() {
        let _ = CtxHelper::new(crate::config::ContextLimits::default());
    }
}
