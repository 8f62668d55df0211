//! Process manager (spec §4.8): `startProcess`, `executeStep`, `handleReply`
//! and compensation. Grounded in the teacher's `mqk-execution::gateway`
//! split — `ProcessManager` is the only public surface a caller touches;
//! `platform_db::process` and `platform_execution::CommandBus` are its
//! implementation details, exactly as `OrderRouter` delegates to
//! repositories and the broker client without exposing them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use platform_broker::FastPathPort;
use platform_execution::CommandBus;
use platform_inbox::TransientClassifier;
use platform_types::{
    exponential_backoff, ProcessEvent, ProcessInstance, ProcessStatus, COMPENSATING_STEPS_KEY,
    PARALLEL_BRANCHES_KEY, TERMINAL_STEP,
};

use crate::graph::ProcessGraph;

pub type PayloadRenderer = Arc<dyn Fn(&str, &Value) -> Value + Send + Sync>;

/// A decoded reply, already stripped of its envelope (spec §4.8
/// `handleReply`'s `reply` parameter).
#[derive(Debug, Clone)]
pub enum ReplyOutcome {
    Completed { data: Value },
    Failed { error: String },
    TimedOut,
}

/// Per-process-type wiring: its graph, a payload renderer, and the retry
/// budget overrides `handleReply` consults (spec §4.8 "configuration
/// callback isRetryable" / "maxRetries(step)" / "retryDelay(step, attempts)").
#[derive(Clone)]
pub struct ProcessConfiguration {
    pub process_type: String,
    pub graph: Arc<ProcessGraph>,
    pub render_payload: PayloadRenderer,
    pub max_retries: i32,
}

impl ProcessConfiguration {
    pub fn new(process_type: impl Into<String>, graph: ProcessGraph) -> Self {
        Self {
            process_type: process_type.into(),
            graph: Arc::new(graph),
            render_payload: Arc::new(|_step, data| data.clone()),
            max_retries: 3,
        }
    }

    pub fn with_render_payload(mut self, f: PayloadRenderer) -> Self {
        self.render_payload = f;
        self
    }

    pub fn with_max_retries(mut self, n: i32) -> Self {
        self.max_retries = n;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            retry_base: Duration::from_secs(1),
            retry_max: Duration::from_secs(300),
        }
    }
}

/// The process manager (spec §4.8). Generic over the fast-path port so it
/// composes with whichever `CommandBus` the caller already built.
pub struct ProcessManager<F: FastPathPort> {
    pool: PgPool,
    bus: Arc<CommandBus<F>>,
    configurations: HashMap<String, ProcessConfiguration>,
    classifier: TransientClassifier,
    config: ManagerConfig,
}

impl<F: FastPathPort + 'static> ProcessManager<F> {
    /// Auto-discovery at startup (spec §4.8): registers one
    /// [`ProcessConfiguration`] per `process_type`; duplicates fail fast,
    /// mirroring the teacher's component-scan duplicate-registration
    /// rejection in `mqk-execution::gateway::build`.
    pub fn new(
        pool: PgPool,
        bus: Arc<CommandBus<F>>,
        configurations: Vec<ProcessConfiguration>,
        classifier: TransientClassifier,
        config: ManagerConfig,
    ) -> anyhow::Result<Self> {
        let mut map = HashMap::new();
        for cfg in configurations {
            if map.insert(cfg.process_type.clone(), cfg).is_some() {
                anyhow::bail!("duplicate process configuration registered for process_type");
            }
        }
        Ok(Self {
            pool,
            bus,
            configurations: map,
            classifier,
            config,
        })
    }

    fn configuration(&self, process_type: &str) -> anyhow::Result<&ProcessConfiguration> {
        self.configurations
            .get(process_type)
            .ok_or_else(|| anyhow::anyhow!("no ProcessConfiguration registered for {process_type:?}"))
    }

    /// `startProcess(processType, businessKey, initialData) -> processId`.
    #[tracing::instrument(skip(self, initial_data), fields(%process_type, %business_key))]
    pub async fn start_process(
        &self,
        process_type: &str,
        business_key: &str,
        initial_data: Value,
    ) -> anyhow::Result<Uuid> {
        let cfg = self.configuration(process_type)?;
        let process_id = Uuid::new_v4();
        let instance = ProcessInstance {
            process_id,
            process_type: process_type.to_string(),
            business_key: business_key.to_string(),
            status: ProcessStatus::Running,
            current_step: cfg.graph.initial_step().to_string(),
            data: initial_data,
            retries: 0,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        platform_db::process::insert(
            &self.pool,
            &instance,
            &ProcessEvent::ProcessStarted {
                initial_step: instance.current_step.clone(),
            },
        )
        .await?;

        self.execute_step(&instance).await?;
        Ok(process_id)
    }

    /// `executeStep(instance)` (spec §4.8).
    async fn execute_step(&self, instance: &ProcessInstance) -> anyhow::Result<()> {
        let cfg = self.configuration(&instance.process_type)?;
        let mut instance = instance.clone();

        if cfg.graph.is_parallel(&instance.current_step) {
            let gate = instance.current_step.clone();
            let branches = cfg
                .graph
                .parallel_branches(&gate)
                .expect("is_parallel implies parallel_branches")
                .to_vec();
            let join = cfg
                .graph
                .join_step(&gate)
                .expect("is_parallel implies join_step")
                .to_string();

            let mut pending = serde_json::Map::new();
            for branch in &branches {
                pending.insert(branch.clone(), Value::String("PENDING".to_string()));
            }
            let mut data = instance.data.as_object().cloned().unwrap_or_default();
            data.insert(PARALLEL_BRANCHES_KEY.to_string(), Value::Object(pending));
            instance.data = Value::Object(data);
            instance.current_step = join.clone();

            platform_db::process::update(
                &self.pool,
                &instance,
                &ProcessEvent::StepStarted {
                    step: join,
                    command_id: None,
                },
            )
            .await?;

            // Spec §8's boundary property ("parallel join with k branches
            // emits exactly k StepStarted events") and S3 both name the
            // per-branch StepStarted as authoritative, even though the
            // §4.8 pseudocode only shows StepStarted(join) — one StepStarted
            // per branch, issued as each command is accepted.
            for branch in branches {
                let payload = (cfg.render_payload)(&branch, &instance.data);
                let mut headers = BTreeMap::new();
                headers.insert("correlation_id".to_string(), instance.process_id.to_string());
                headers.insert("parallel_branch".to_string(), branch.clone());
                let command_id = self
                    .bus
                    .accept(
                        &branch,
                        &format!("{}:{}", instance.process_id, branch),
                        Some(&instance.business_key),
                        payload,
                        headers,
                    )
                    .await?;
                platform_db::process::update(
                    &self.pool,
                    &instance,
                    &ProcessEvent::StepStarted {
                        step: branch,
                        command_id: Some(command_id),
                    },
                )
                .await?;
            }
        } else {
            let step = instance.current_step.clone();
            platform_db::process::update(
                &self.pool,
                &instance,
                &ProcessEvent::StepStarted {
                    step: step.clone(),
                    command_id: None,
                },
            )
            .await?;

            let payload = (cfg.render_payload)(&step, &instance.data);
            let mut headers = BTreeMap::new();
            headers.insert("correlation_id".to_string(), instance.process_id.to_string());
            self.bus
                .accept(
                    &step,
                    &format!("{}:{}:{}", instance.process_id, step, instance.retries),
                    Some(&instance.business_key),
                    payload,
                    headers,
                )
                .await?;
        }
        Ok(())
    }

    /// `handleReply(correlationId, commandId, reply)` (spec §4.8). The
    /// caller has already decoded the wire envelope into a
    /// [`ReplyOutcome`]; `branch` is `Some` when the header identified this
    /// reply as one branch of an active parallel set.
    #[tracing::instrument(skip(self, reply), fields(%process_id))]
    pub async fn handle_reply(
        &self,
        process_id: Uuid,
        command_id: Uuid,
        step: &str,
        branch: Option<&str>,
        reply: ReplyOutcome,
    ) -> anyhow::Result<()> {
        let Some(instance) = platform_db::process::find_by_id(&self.pool, process_id).await? else {
            tracing::warn!(%process_id, "handleReply: no such process instance, dropping reply");
            return Ok(());
        };
        if instance.status.is_terminal() || instance.status == ProcessStatus::Paused {
            tracing::debug!(%process_id, status = %instance.status, "handleReply: instance not actively running, dropping reply");
            return Ok(());
        }

        // Compensation replies drive a separate state machine (§4.8
        // "compensations must be idempotent by contract" / §8 "COMPENSATED"):
        // once COMPENSATING, every reply is a compensation command settling,
        // never a forward step.
        if instance.status == ProcessStatus::Compensating {
            return match reply {
                ReplyOutcome::Completed { .. } => self.on_compensation_completed(instance, command_id, step).await,
                ReplyOutcome::Failed { error } => self.on_compensation_failed(instance, command_id, step, error).await,
                ReplyOutcome::TimedOut => {
                    self.on_compensation_failed(instance, command_id, step, "lease expired".to_string()).await
                }
            };
        }

        match reply {
            ReplyOutcome::Completed { data } => self.on_completed(instance, command_id, step, branch, data).await,
            ReplyOutcome::Failed { error } => self.on_failed(instance, command_id, step, branch, error).await,
            ReplyOutcome::TimedOut => {
                // Spec §4.8: "TimedOut: treated as Failed with retryable=false
                // unless configuration overrides" — no override hook exists
                // yet, so this always forces the compensation path, but it
                // is logged as its own `StepTimedOut` event (spec §3) rather
                // than folded into `StepFailed` so the log trail can tell a
                // lease expiry apart from a domain failure.
                self.on_timed_out(instance, command_id, step, branch).await
            }
        }
    }

    async fn on_completed(
        &self,
        mut instance: ProcessInstance,
        command_id: Uuid,
        step: &str,
        branch: Option<&str>,
        reply_data: Value,
    ) -> anyhow::Result<()> {
        instance.data = merge_shallow(&instance.data, &reply_data);

        if let Some(branch) = branch {
            let cfg = self.configuration(&instance.process_type)?;
            mark_branch_completed(&mut instance.data, branch);

            platform_db::process::update(
                &self.pool,
                &instance,
                &ProcessEvent::StepCompleted {
                    step: step.to_string(),
                    command_id,
                },
            )
            .await?;

            if any_branch_failed(&instance.data) {
                return self.begin_compensation(instance).await;
            }
            if all_branches_completed(&instance.data) {
                let join = instance.current_step.clone();
                match cfg.graph.next_step(&join, &instance.data) {
                    Some(next) => {
                        instance.current_step = next;
                        self.execute_step(&instance).await
                    }
                    None => self.complete(instance).await,
                }
            } else {
                Ok(())
            }
        } else {
            platform_db::process::update(
                &self.pool,
                &instance,
                &ProcessEvent::StepCompleted {
                    step: step.to_string(),
                    command_id,
                },
            )
            .await?;

            let cfg = self.configuration(&instance.process_type)?;
            match cfg.graph.next_step(step, &instance.data) {
                Some(next) => {
                    instance.current_step = next;
                    instance.retries = 0;
                    self.execute_step(&instance).await
                }
                None => self.complete(instance).await,
            }
        }
    }

    async fn complete(&self, mut instance: ProcessInstance) -> anyhow::Result<()> {
        instance.status = ProcessStatus::Succeeded;
        instance.current_step = TERMINAL_STEP.to_string();
        platform_db::process::update(&self.pool, &instance, &ProcessEvent::ProcessCompleted).await
    }

    async fn on_failed(
        &self,
        mut instance: ProcessInstance,
        command_id: Uuid,
        step: &str,
        branch: Option<&str>,
        error: String,
    ) -> anyhow::Result<()> {
        let cfg = self.configuration(&instance.process_type)?.clone();
        let retryable = self.classifier.is_transient(step, &error);

        if retryable && instance.retries < cfg.max_retries {
            instance.retries += 1;
            let attempt = instance.retries as u32;
            platform_db::process::update(
                &self.pool,
                &instance,
                &ProcessEvent::StepFailed {
                    step: step.to_string(),
                    command_id,
                    retryable: true,
                    error,
                },
            )
            .await?;

            let delay = exponential_backoff(attempt.saturating_sub(1), self.config.retry_base, self.config.retry_max);
            tokio::time::sleep(delay).await;

            match branch {
                // Re-issue only the failing branch — calling `execute_step`
                // here would re-initialize the whole `__parallel__` gate and
                // wipe sibling branches' PENDING/COMPLETED bookkeeping.
                Some(branch) => {
                    let payload = (cfg.render_payload)(branch, &instance.data);
                    let mut headers = BTreeMap::new();
                    headers.insert("correlation_id".to_string(), instance.process_id.to_string());
                    headers.insert("parallel_branch".to_string(), branch.to_string());
                    self.bus
                        .accept(
                            branch,
                            &format!("{}:{}:{}", instance.process_id, branch, instance.retries),
                            Some(&instance.business_key),
                            payload,
                            headers,
                        )
                        .await?;
                    Ok(())
                }
                None => self.execute_step(&instance).await,
            }
        } else {
            platform_db::process::update(
                &self.pool,
                &instance,
                &ProcessEvent::StepFailed {
                    step: step.to_string(),
                    command_id,
                    retryable: false,
                    error,
                },
            )
            .await?;
            if let Some(branch) = branch {
                mark_branch_failed(&mut instance.data, branch);
            }
            self.begin_compensation(instance).await
        }
    }

    /// A lease expiry (spec §4.6 step 8 / §4.8 "TimedOut"): logged as its
    /// own `StepTimedOut` event, distinct from `StepFailed`, then treated as
    /// a non-retryable failure per spec §4.8 ("TimedOut: treated as Failed
    /// with retryable=false unless configuration overrides").
    async fn on_timed_out(
        &self,
        mut instance: ProcessInstance,
        command_id: Uuid,
        step: &str,
        branch: Option<&str>,
    ) -> anyhow::Result<()> {
        platform_db::process::update(
            &self.pool,
            &instance,
            &ProcessEvent::StepTimedOut {
                step: step.to_string(),
                command_id,
            },
        )
        .await?;
        if let Some(branch) = branch {
            mark_branch_failed(&mut instance.data, branch);
        }
        self.begin_compensation(instance).await
    }

    /// Compensation (spec §4.8): enumerate completed forward steps in
    /// reverse-chronological order from the log, queue each one's
    /// compensation command where declared, and issue the first. Unlike the
    /// forward-step parallel gate, compensations run strictly one at a time
    /// — S4 names the order as "reverse order of completion", which only
    /// means something if each compensation is awaited before the next is
    /// issued. [`issue_next_compensation`] drains the queue, and
    /// [`on_compensation_completed`]/[`on_compensation_failed`] are what
    /// `handleReply` dispatches to once `status = COMPENSATING`.
    async fn begin_compensation(&self, mut instance: ProcessInstance) -> anyhow::Result<()> {
        instance.status = ProcessStatus::Compensating;

        let cfg = self.configuration(&instance.process_type)?.clone();
        let log = platform_db::process::log(&self.pool, instance.process_id, 10_000).await?;

        let completed_steps: Vec<String> = log
            .iter()
            .rev()
            .filter_map(|entry| match &entry.event {
                ProcessEvent::StepCompleted { step, .. } => Some(step.clone()),
                _ => None,
            })
            .collect();

        let queue: Vec<String> = completed_steps
            .iter()
            .filter_map(|step| cfg.graph.compensation_step(step).map(str::to_string))
            .collect();

        let mut data = instance.data.as_object().cloned().unwrap_or_default();
        data.insert(
            COMPENSATING_STEPS_KEY.to_string(),
            Value::Array(queue.into_iter().map(Value::String).collect()),
        );
        instance.data = Value::Object(data);

        platform_db::process::update(
            &self.pool,
            &instance,
            &ProcessEvent::CompensationTriggered {
                reason: format!("step {:?} exhausted its retry budget or failed permanently", instance.current_step),
            },
        )
        .await?;

        self.issue_next_compensation(instance).await
    }

    /// Issue the head of the `__compensating__` queue, or — once it's empty
    /// — settle the process as COMPENSATED. One compensation command is ever
    /// in flight at a time.
    async fn issue_next_compensation(&self, instance: ProcessInstance) -> anyhow::Result<()> {
        let Some(step) = compensation_queue(&instance.data).into_iter().next() else {
            return self.finish_compensation(instance).await;
        };

        let cfg = self.configuration(&instance.process_type)?.clone();
        let payload = (cfg.render_payload)(&step, &instance.data);
        let mut headers = BTreeMap::new();
        headers.insert("correlation_id".to_string(), instance.process_id.to_string());
        let command_id = self
            .bus
            .accept(
                &step,
                &format!("{}:compensate:{}", instance.process_id, step),
                Some(&instance.business_key),
                payload,
                headers,
            )
            .await?;

        platform_db::process::update(
            &self.pool,
            &instance,
            &ProcessEvent::CompensationStarted {
                step,
                command_id,
            },
        )
        .await
    }

    async fn on_compensation_completed(
        &self,
        mut instance: ProcessInstance,
        command_id: Uuid,
        step: &str,
    ) -> anyhow::Result<()> {
        platform_db::process::update(
            &self.pool,
            &instance,
            &ProcessEvent::CompensationCompleted {
                step: step.to_string(),
                command_id,
            },
        )
        .await?;

        pop_compensation_queue(&mut instance.data, step);
        self.issue_next_compensation(instance).await
    }

    /// A compensation command itself failed permanently — spec §4.8 "If any
    /// compensation fails permanently: status=FAILED with
    /// CompensationFailed event". This is the only path by which
    /// `ProcessStatus::Failed` / `ProcessEvent::ProcessFailed` are reached;
    /// compensations are not retried here, matching "compensations must be
    /// idempotent by contract" rather than this manager's own retry budget.
    async fn on_compensation_failed(
        &self,
        mut instance: ProcessInstance,
        command_id: Uuid,
        step: &str,
        error: String,
    ) -> anyhow::Result<()> {
        instance.status = ProcessStatus::Failed;
        instance.current_step = TERMINAL_STEP.to_string();
        platform_db::process::update(
            &self.pool,
            &instance,
            &ProcessEvent::CompensationFailed {
                step: step.to_string(),
                command_id,
                error: error.clone(),
            },
        )
        .await?;
        platform_db::process::update(&self.pool, &instance, &ProcessEvent::ProcessFailed { error }).await
    }

    async fn finish_compensation(&self, mut instance: ProcessInstance) -> anyhow::Result<()> {
        instance.status = ProcessStatus::Compensated;
        instance.current_step = TERMINAL_STEP.to_string();
        if let Some(obj) = instance.data.as_object_mut() {
            obj.remove(COMPENSATING_STEPS_KEY);
        }
        platform_db::process::update(&self.pool, &instance, &ProcessEvent::ProcessCompensated).await
    }

    pub async fn pause(&self, process_id: Uuid) -> anyhow::Result<bool> {
        let Some(mut instance) = platform_db::process::find_by_id(&self.pool, process_id).await? else {
            return Ok(false);
        };
        if instance.status != ProcessStatus::Running {
            return Ok(false);
        }
        instance.status = ProcessStatus::Paused;
        platform_db::process::update(&self.pool, &instance, &ProcessEvent::ProcessPaused).await?;
        Ok(true)
    }

    pub async fn resume(&self, process_id: Uuid) -> anyhow::Result<bool> {
        let Some(mut instance) = platform_db::process::find_by_id(&self.pool, process_id).await? else {
            return Ok(false);
        };
        if instance.status != ProcessStatus::Paused {
            return Ok(false);
        }
        instance.status = ProcessStatus::Running;
        platform_db::process::update(&self.pool, &instance, &ProcessEvent::ProcessResumed).await?;
        Ok(true)
    }

    pub async fn find_by_id(&self, process_id: Uuid) -> anyhow::Result<Option<ProcessInstance>> {
        platform_db::process::find_by_id(&self.pool, process_id).await
    }

    pub async fn find_by_status(&self, status: ProcessStatus, limit: i64) -> anyhow::Result<Vec<ProcessInstance>> {
        platform_db::process::find_by_status(&self.pool, status, limit).await
    }

    pub async fn find_by_business_key(
        &self,
        process_type: &str,
        business_key: &str,
    ) -> anyhow::Result<Option<ProcessInstance>> {
        platform_db::process::find_by_business_key(&self.pool, process_type, business_key).await
    }

    pub async fn log(&self, process_id: Uuid, limit: i64) -> anyhow::Result<Vec<platform_types::ProcessLogEntry>> {
        platform_db::process::log(&self.pool, process_id, limit).await
    }
}

/// Shallow merge of reply keys over instance keys (spec §5 "data map merge
/// rule"): nested maps are not merged recursively, numeric types preserved.
fn merge_shallow(instance_data: &Value, reply_data: &Value) -> Value {
    let mut merged = instance_data.as_object().cloned().unwrap_or_default();
    if let Some(reply) = reply_data.as_object() {
        for (k, v) in reply {
            merged.insert(k.clone(), v.clone());
        }
    }
    Value::Object(merged)
}

fn mark_branch_completed(data: &mut Value, branch: &str) {
    if let Some(obj) = data.as_object_mut() {
        if let Some(Value::Object(branches)) = obj.get_mut(PARALLEL_BRANCHES_KEY) {
            branches.insert(branch.to_string(), Value::String("COMPLETED".to_string()));
        }
    }
}

fn mark_branch_failed(data: &mut Value, branch: &str) {
    if let Some(obj) = data.as_object_mut() {
        if let Some(Value::Object(branches)) = obj.get_mut(PARALLEL_BRANCHES_KEY) {
            branches.insert(branch.to_string(), Value::String("FAILED".to_string()));
        }
    }
}

fn any_branch_failed(data: &Value) -> bool {
    data.get(PARALLEL_BRANCHES_KEY)
        .and_then(Value::as_object)
        .map(|branches| branches.values().any(|v| v == "FAILED"))
        .unwrap_or(false)
}

fn all_branches_completed(data: &Value) -> bool {
    data.get(PARALLEL_BRANCHES_KEY)
        .and_then(Value::as_object)
        .map(|branches| branches.values().all(|v| v == "COMPLETED"))
        .unwrap_or(false)
}

/// The `__compensating__` queue: compensation step names still owed a reply,
/// in firing order. Index 0 is always the one currently in flight.
fn compensation_queue(data: &Value) -> Vec<String> {
    data.get(COMPENSATING_STEPS_KEY)
        .and_then(Value::as_array)
        .map(|steps| steps.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

fn pop_compensation_queue(data: &mut Value, step: &str) {
    if let Some(obj) = data.as_object_mut() {
        if let Some(Value::Array(steps)) = obj.get_mut(COMPENSATING_STEPS_KEY) {
            if let Some(pos) = steps.iter().position(|v| v.as_str() == Some(step)) {
                steps.remove(pos);
            }
        }
    }
}

