//! 会话主循环
//!
//! 抓取上下文 -> Plan -> 执行（带重试）-> 校验（可按建议重试）-> 卡死检测与恢复 -> 下一轮。
//! 每轮开始检查取消与持锁者；所有外部等待都与取消竞争。Session / MemoryStore / ContextRegistry
//! 只由本循环修改，修改后持久化并通过 watch 发布 SessionView。

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::actuator::{
    origin_of, Action, ActionExecutor, ActionOutcome, ActuatorError, ContextError, ContextSnapshot,
    PlannedAction, TargetId,
};
use crate::config::AppConfig;
use crate::context::{ContextRegistry, TargetEvent};
use crate::core::{
    AgentError, MessageDeduplicator, RecoveryManager, RecoveryStrategy, SessionLock,
    SessionSupervisor, SessionView,
};
use crate::memory::{
    memory_key, save_json, FactSource, GoalStatus, MemoryStore, Persistence, SESSION_KEY,
};
use crate::react::{
    AgentNotification, HistoryEntry, PlanRequest, PlannerDecision, PlannerGateway, PlannerStatus,
    Verifier,
};
use crate::session::{
    ActionOrigin, ActionRecord, Session, SessionOutcome, SessionStatus, VerificationResult,
};

/// 给 Planner 的最近历史条数
const HISTORY_WINDOW: usize = 10;
/// 抓取上下文失败后的重试间隔（按次数线性增加）
const CONTEXT_RETRY_DELAY_MS: u64 = 500;
/// 提取动作写入事实的置信度
const EXTRACTED_FACT_CONFIDENCE: f64 = 0.9;

/// 会话共享的依赖（由 Orchestrator 持有并在每次 start_session 时克隆）
#[derive(Clone)]
pub struct SessionDeps {
    pub config: Arc<AppConfig>,
    pub executor: ActionExecutor,
    pub planner: Arc<PlannerGateway>,
    pub persistence: Arc<dyn Persistence>,
    pub lock: Arc<SessionLock>,
    pub notifications: broadcast::Sender<AgentNotification>,
    pub view: Arc<watch::Sender<SessionView>>,
}

/// 单个会话的运行体：独占 Session 与各会话级组件
pub struct SessionRunner {
    deps: SessionDeps,
    session: Session,
    memory: MemoryStore,
    registry: ContextRegistry,
    recovery: RecoveryManager,
    verifier: Verifier,
    dedup: MessageDeduplicator,
    supervisor: SessionSupervisor,
    target_events: broadcast::Receiver<TargetEvent>,
    outcome_tx: watch::Sender<Option<SessionOutcome>>,
    no_action_streak: usize,
    verification_budget: usize,
}

impl SessionRunner {
    pub fn new(
        deps: SessionDeps,
        session: Session,
        supervisor: SessionSupervisor,
        outcome_tx: watch::Sender<Option<SessionOutcome>>,
    ) -> Self {
        let cfg = deps.config.clone();
        let registry = ContextRegistry::new(cfg.targets.clone());
        let target_events = registry.subscribe();
        Self {
            memory: MemoryStore::new(cfg.memory.clone()),
            registry,
            recovery: RecoveryManager::new(cfg.recovery.clone()),
            verifier: Verifier::new(cfg.verifier.clone()),
            dedup: MessageDeduplicator::new(&cfg.dedup),
            supervisor,
            target_events,
            outcome_tx,
            no_action_streak: 0,
            verification_budget: cfg.session.max_verification_retries,
            session,
            deps,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session.id
    }

    /// 运行到终态，返回结果（同时写入 outcome 通道）
    pub async fn run(mut self) -> SessionOutcome {
        tracing::info!(session_id = %self.session.id, goal = %self.session.goal, "session started");
        let result = self.drive().await;
        self.finish(result).await
    }

    fn cfg(&self) -> &AppConfig {
        &self.deps.config
    }

    async fn guarded<F: Future>(&self, fut: F) -> Result<F::Output, AgentError> {
        self.supervisor.guard(fut).await.ok_or(AgentError::Cancelled)
    }

    async fn drive(&mut self) -> Result<String, AgentError> {
        self.setup().await?;

        loop {
            self.check_alive()?;
            self.drain_target_events();

            let max_actions = self.cfg().session.max_actions;
            if self.session.action_count() >= max_actions {
                return Err(AgentError::ActionLimitReached(max_actions));
            }

            let target = self.active_target()?;
            let context = self.capture_with_retries(&target).await?;

            self.set_status(SessionStatus::Planning);
            let request = self.plan_request(&context);
            let decision = self.guarded(self.deps.planner.plan(&request)).await??;
            self.check_alive()?;
            tracing::debug!(
                status = ?decision.status,
                confidence = decision.confidence,
                rationale = %decision.rationale,
                "planner decision"
            );
            self.absorb(&decision, &context);

            match decision.status {
                PlannerStatus::Done => {
                    if let Some(planned) = decision.action.filter(|a| a.action.is_delivery()) {
                        self.execute_with_retries(planned, ActionOrigin::Planner).await?;
                    }
                    let summary = if decision.rationale.trim().is_empty() {
                        "Goal achieved".to_string()
                    } else {
                        decision.rationale
                    };
                    return Ok(summary);
                }
                PlannerStatus::Error => return Err(AgentError::PlannerRejected(decision.rationale)),
                PlannerStatus::NeedsClarification => {
                    self.notify(AgentNotification::ClarificationNeeded {
                        session_id: self.session.id,
                        question: decision.rationale.clone(),
                    });
                    return Err(AgentError::ClarificationNeeded(decision.rationale));
                }
                PlannerStatus::Continue => {}
            }

            let Some(planned) = decision.action else {
                self.no_action_streak += 1;
                tracing::warn!(streak = self.no_action_streak, "planner returned no action");
                let limit = self.cfg().session.max_consecutive_no_action.max(1);
                if self.no_action_streak >= limit {
                    return Err(AgentError::PlannerMalformed(self.no_action_streak));
                }
                continue;
            };
            self.no_action_streak = 0;

            self.act(planned, &decision.rationale).await?;
            self.check_recovery().await?;
            self.report_progress();

            let delay = Duration::from_millis(self.cfg().session.action_delay_ms);
            self.guarded(tokio::time::sleep(delay)).await?;
        }
    }

    /// 设定主目标、登记已有标签页、确定初始标签页
    async fn setup(&mut self) -> Result<(), AgentError> {
        self.memory.set_primary_goal(self.session.goal.clone());

        let existing = self
            .guarded(self.deps.executor.list_targets())
            .await?
            .map_err(|e| AgentError::ContextUnavailable {
                attempts: 1,
                reason: e.to_string(),
            })?;
        for info in &existing {
            self.registry.observe_existing(info);
        }
        let primary = self
            .registry
            .active()
            .cloned()
            .ok_or_else(|| AgentError::ContextUnavailable {
                attempts: 1,
                reason: "no target available".to_string(),
            })?;
        tracing::info!(targets = existing.len(), primary = %primary, "targets observed");
        self.session.primary_target = Some(primary);
        self.drain_target_events();

        self.persist().await;
        self.publish();
        self.notify(AgentNotification::StatusChanged {
            session_id: self.session.id,
            status: self.session.status,
        });
        Ok(())
    }

    /// 取消或被新会话取代时返回错误
    fn check_alive(&self) -> Result<(), AgentError> {
        match self.deps.lock.current() {
            Some(holder) if holder != self.session.id => {
                return Err(AgentError::Superseded(holder))
            }
            None => return Err(AgentError::Cancelled),
            _ => {}
        }
        if self.supervisor.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        Ok(())
    }

    fn active_target(&self) -> Result<TargetId, AgentError> {
        self.registry
            .active()
            .cloned()
            .ok_or_else(|| AgentError::Internal("no active target".to_string()))
    }

    /// 同步标签页事件：关闭的标签页从会话与记忆中清除，主目标交给当前活动标签页
    fn drain_target_events(&mut self) {
        loop {
            match self.target_events.try_recv() {
                Ok(TargetEvent::Closed { target }) => {
                    let successor = self.registry.active();
                    tracing::debug!(target_id = %target, successor = ?successor, "target closed");
                    self.session.forget_target(&target, successor);
                    self.memory.forget_target(&target);
                }
                Ok(TargetEvent::Opened { target, agent_opened }) => {
                    if agent_opened {
                        self.session.agent_targets.insert(target);
                    }
                }
                Ok(TargetEvent::Switched { from, to }) => {
                    tracing::debug!(from = ?from, to = %to, "active target switched");
                }
                Err(TryRecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "target events lagged");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    async fn capture(
        &self,
        target: &TargetId,
    ) -> Result<Result<ContextSnapshot, ContextError>, AgentError> {
        self.guarded(self.deps.executor.capture(target)).await
    }

    /// 抓取上下文，失败按配置次数重试；成功后写入历史与访问记录
    async fn capture_with_retries(
        &mut self,
        target: &TargetId,
    ) -> Result<ContextSnapshot, AgentError> {
        let max = self.cfg().targets.max_context_failures.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max {
            match self.capture(target).await? {
                Ok(snapshot) => {
                    self.observe(&snapshot);
                    return Ok(snapshot);
                }
                Err(e) => {
                    tracing::warn!(
                        target_id = %target,
                        attempt,
                        error = %e,
                        "context capture failed"
                    );
                    last_error = e.to_string();
                    if attempt < max {
                        let delay = Duration::from_millis(CONTEXT_RETRY_DELAY_MS * attempt as u64);
                        self.guarded(tokio::time::sleep(delay)).await?;
                    }
                }
            }
        }
        Err(AgentError::ContextUnavailable {
            attempts: max,
            reason: last_error,
        })
    }

    fn observe(&mut self, snapshot: &ContextSnapshot) {
        let id = snapshot.target_id.clone();
        if let Err(e) = self.registry.save_context(&id, snapshot.clone(), BTreeMap::new()) {
            tracing::debug!(target_id = %id, error = %e, "context for unregistered target");
        }
        self.memory.record_visit(id);
        self.session.current_context = Some(snapshot.clone());
    }

    fn plan_request(&self, context: &ContextSnapshot) -> PlanRequest {
        PlanRequest {
            goal: self.session.goal.clone(),
            context: context.clone(),
            history: self
                .session
                .recent(HISTORY_WINDOW)
                .iter()
                .map(HistoryEntry::from_record)
                .collect(),
            step: self.session.action_count(),
            memory_summary: self.memory.summarize_for_prompt(),
            targets_summary: self
                .registry
                .build_summary(Some(&context.target_id), self.cfg().targets.summary_max_targets),
        }
    }

    /// 吸收 Planner 报告的事实与子目标
    fn absorb(&mut self, decision: &PlannerDecision, context: &ContextSnapshot) {
        for fact in &decision.facts {
            let source = FactSource::new("planner")
                .from_target(context.target_id.clone(), Some(origin_of(&context.address)));
            let confidence = fact.confidence.unwrap_or(decision.confidence);
            let update = self.memory.add_fact(&fact.key, &fact.value, source, confidence);
            tracing::debug!(key = %fact.key, ?update, "fact reported");
            let correlated = self
                .registry
                .record_key_value(&context.target_id, &fact.key, &fact.value);
            if let Err(e) = correlated {
                tracing::debug!(error = %e, "fact not correlated");
            }
        }

        for description in &decision.subgoals {
            if self.memory.find_goal(description).is_none() {
                self.memory.add_goal(description.clone(), None);
            }
        }

        for description in &decision.completed_subgoals {
            let Some(id) = self.memory.find_goal(description) else {
                continue;
            };
            let already = self
                .memory
                .goal(id)
                .is_some_and(|g| g.status == GoalStatus::Completed);
            if !already && self.memory.update_status(id, GoalStatus::Completed) {
                self.milestone(format!("Subgoal completed: {}", description));
            }
        }
    }

    /// 执行并校验一个 Planner 动作；校验失败时按建议重试（有预算）
    async fn act(&mut self, planned: PlannedAction, rationale: &str) -> Result<(), AgentError> {
        let description = planned.description.clone();
        self.execute_with_retries(planned, ActionOrigin::Planner).await?;

        let Some(result) = self.verify_last(rationale) else {
            return Ok(());
        };
        if result.success {
            self.verification_budget = self.cfg().session.max_verification_retries;
            return Ok(());
        }

        let reason = result.failure_reason.clone().unwrap_or_default();
        self.remember_failure(description, reason.clone());

        match result.suggested_retry {
            Some(retry) if self.verification_budget > 0 => {
                self.verification_budget -= 1;
                tracing::info!(
                    reason = %reason,
                    steps = retry.actions.len(),
                    budget_left = self.verification_budget,
                    "retrying after failed verification"
                );
                for step in retry.actions {
                    let step_description = step.description.clone();
                    self.execute_with_retries(step, ActionOrigin::VerificationRetry).await?;
                    if self.verify_last(&step_description).is_some_and(|r| r.success) {
                        self.verification_budget = self.cfg().session.max_verification_retries;
                    }
                }
            }
            _ => {
                tracing::info!(reason = %reason, "verification failed, leaving it to the planner");
            }
        }
        Ok(())
    }

    /// 校验最近一条成功记录并补写结论
    fn verify_last(&mut self, rationale: &str) -> Option<VerificationResult> {
        let record = self.session.actions.last()?;
        if !record.success {
            return None;
        }
        let (Some(action), Some(before), Some(after)) =
            (&record.executed, &record.before, &record.after)
        else {
            return None;
        };
        let result = self.verifier.verify(action, before, after, rationale);

        self.set_status(SessionStatus::Verifying);
        if let Some(record) = self.session.last_record_mut() {
            record.attach_verification(result.clone());
        }
        self.publish();
        Some(result)
    }

    /// 失败的做法写入记忆，Planner 下一轮能看到
    fn remember_failure(&mut self, description: String, reason: String) {
        let address = self
            .session
            .current_context
            .as_ref()
            .map(|c| c.address.clone())
            .unwrap_or_default();
        self.memory.record_failure(description, reason, address);
    }

    /// 执行动作，失败时重试；全部失败返回 ExecutionFailed
    async fn execute_with_retries(
        &mut self,
        planned: PlannedAction,
        origin: ActionOrigin,
    ) -> Result<(), AgentError> {
        let max = self.cfg().session.max_execution_retries.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max {
            match self.execute_once(&planned, origin).await? {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        kind = %planned.kind(),
                        attempt,
                        max,
                        error = %e,
                        "action failed"
                    );
                    last_error = e.to_string();
                    self.remember_failure(planned.description.clone(), last_error.clone());
                }
            }
        }
        Err(AgentError::ExecutionFailed {
            kind: planned.kind(),
            attempts: max,
            reason: last_error,
        })
    }

    /// 单次尝试：分派、应用结果、抓取执行后上下文、记录
    async fn execute_once(
        &mut self,
        planned: &PlannedAction,
        origin: ActionOrigin,
    ) -> Result<Result<(), ActuatorError>, AgentError> {
        self.check_alive()?;
        let max_actions = self.cfg().session.max_actions;
        if self.session.action_count() >= max_actions {
            return Err(AgentError::ActionLimitReached(max_actions));
        }

        let target = self.active_target()?;
        let before = match self.session.current_context.clone() {
            Some(ctx) if ctx.target_id == target => ctx,
            _ => match self.capture_with_retries(&target).await {
                Ok(ctx) => ctx,
                Err(AgentError::ContextUnavailable { attempts, reason }) => {
                    // 分派前失败：记录但不执行
                    self.push_record(ActionRecord {
                        id: Uuid::new_v4(),
                        timestamp: Utc::now(),
                        planned: planned.clone(),
                        executed: None,
                        target_id: target,
                        before: None,
                        after: None,
                        success: false,
                        error: Some(reason.clone()),
                        duration_ms: 0,
                        verification: None,
                        origin,
                    })
                    .await;
                    return Err(AgentError::ContextUnavailable { attempts, reason });
                }
                Err(e) => return Err(e),
            },
        };

        self.set_status(SessionStatus::Executing);
        tracing::info!(
            kind = %planned.kind(),
            target_id = %target,
            origin = ?origin,
            "{}",
            planned.description
        );
        let started = Instant::now();
        let performed = self
            .guarded(self.deps.executor.perform(&target, &planned.action))
            .await?;
        let result = match performed {
            Ok(outcome) => self.apply_outcome(&target, &planned.action, &outcome).await?,
            Err(e) => Err(e),
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        self.drain_target_events();

        let after_target = self
            .registry
            .active()
            .cloned()
            .unwrap_or_else(|| target.clone());
        let after = match self.capture(&after_target).await? {
            Ok(snapshot) => {
                self.observe(&snapshot);
                Some(snapshot)
            }
            Err(e) => {
                tracing::warn!(
                    target_id = %after_target,
                    error = %e,
                    "post-action capture failed"
                );
                None
            }
        };

        let success = result.is_ok();
        self.recovery.record_action_result(success, after.as_ref());
        self.push_record(ActionRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            planned: planned.clone(),
            executed: Some(planned.action.clone()),
            target_id: target,
            before: Some(before),
            after,
            success,
            error: result.as_ref().err().map(|e| e.to_string()),
            duration_ms,
            verification: None,
            origin,
        })
        .await;
        Ok(result)
    }

    async fn push_record(&mut self, record: ActionRecord) {
        let retention = self.cfg().session.context_retention;
        self.session.push_record(record, retention);
        self.persist().await;
        self.publish();
    }

    /// 把动作结果同步到注册表与记忆；标签页容量不足时返回动作级错误
    async fn apply_outcome(
        &mut self,
        target: &TargetId,
        action: &Action,
        outcome: &ActionOutcome,
    ) -> Result<Result<(), ActuatorError>, AgentError> {
        if let Some(ref info) = outcome.opened_target {
            let purpose = match action {
                Action::OpenTarget { purpose, .. } => purpose.clone(),
                _ => None,
            };
            match self.registry.open_target(info, purpose) {
                Ok(Some(evicted)) => {
                    let close = Action::CloseTarget {
                        target_id: Some(evicted.clone()),
                    };
                    let closed = self
                        .guarded(self.deps.executor.perform(&evicted, &close))
                        .await?;
                    if let Err(e) = closed {
                        tracing::warn!(
                            target_id = %evicted,
                            error = %e,
                            "failed to close evicted target"
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(target_id = %info.id, error = %e, "new target rejected");
                    let close = Action::CloseTarget {
                        target_id: Some(info.id.clone()),
                    };
                    let closed = self
                        .guarded(self.deps.executor.perform(&info.id, &close))
                        .await?;
                    if let Err(close_err) = closed {
                        tracing::warn!(
                            target_id = %info.id,
                            error = %close_err,
                            "failed to close rejected target"
                        );
                    }
                    return Ok(Err(ActuatorError::Failed(e.to_string())));
                }
            }
        }

        if let Some(ref info) = outcome.opened_target {
            self.milestone(format!("Opened target {} at {}", info.id, info.address));
        }

        if let Some(ref closed) = outcome.closed_target {
            if let Err(e) = self.registry.close_target(closed) {
                tracing::debug!(
                    target_id = %closed,
                    error = %e,
                    "closed target was not registered"
                );
            }
        }

        if let Some(ref active) = outcome.active_target {
            if self.registry.contains(active) && self.registry.active() != Some(active) {
                self.registry.switch_to(active)?;
            }
        }

        if !outcome.extracted.is_empty() {
            let domain = self
                .registry
                .target(target)
                .map(|t| origin_of(&t.address));
            for (key, value) in &outcome.extracted {
                let source = FactSource::new(action.kind().as_str())
                    .from_target(target.clone(), domain.clone());
                self.memory.add_fact(key, value, source, EXTRACTED_FACT_CONFIDENCE);
                if let Err(e) = self.registry.record_key_value(target, key, value) {
                    tracing::debug!(error = %e, "extracted value not correlated");
                }
            }
        }

        if let Some(ref path) = outcome.deliverable {
            self.milestone(format!("Deliverable ready: {}", path));
        }
        if let (Action::Message { .. }, Some(text)) = (action, &outcome.output) {
            self.milestone(text.clone());
        }
        Ok(Ok(()))
    }

    /// 卡死检测；命中时按策略恢复，耗尽后终止
    async fn check_recovery(&mut self) -> Result<(), AgentError> {
        let Some(context) = self.session.current_context.clone() else {
            return Ok(());
        };
        let Some(stuck) = self.recovery.check_stuck_state(&self.session.actions, &context) else {
            return Ok(());
        };
        let alternate = self.registry.alternate_for(&context.target_id);
        match self.recovery.suggest_recovery(&stuck, &context, alternate.as_ref()) {
            RecoveryStrategy::Perform { actions, note } => {
                self.milestone(format!("Recovering ({}): {}", stuck.reason, note));
                for planned in actions {
                    self.execute_with_retries(planned, ActionOrigin::Recovery).await?;
                }
            }
            RecoveryStrategy::FallbackTarget { close, switch_to } => {
                let text = format!("Recovering ({}): switching to {}", stuck.reason, switch_to);
                self.milestone(text);
                let switch = PlannedAction::bare(Action::SwitchTarget {
                    target_id: switch_to.clone(),
                });
                self.execute_with_retries(switch, ActionOrigin::Recovery).await?;
                // 只关闭 Agent 自己打开的标签页
                if self.registry.target(&close).is_some_and(|t| t.agent_opened) {
                    let close = PlannedAction::bare(Action::CloseTarget {
                        target_id: Some(close),
                    });
                    self.execute_with_retries(close, ActionOrigin::Recovery).await?;
                }
            }
            RecoveryStrategy::Abort { reason } => return Err(AgentError::Stuck(reason)),
        }
        self.recovery.applied(self.session.action_count());
        Ok(())
    }

    fn report_progress(&mut self) {
        let step = self.session.action_count();
        let max_steps = self.cfg().session.max_actions;
        if let Some(text) = self.session.actions.last().map(|r| r.planned.description.clone()) {
            if self.dedup.admit(&text) {
                self.notify(AgentNotification::StepProgress {
                    session_id: self.session.id,
                    step,
                    max_steps,
                    text,
                });
            }
        }
        let every = self.cfg().session.milestone_every;
        if every > 0 && step > 0 && step % every == 0 {
            self.notify(AgentNotification::Milestone {
                session_id: self.session.id,
                text: format!("{} actions taken, {} facts known", step, self.memory.fact_count()),
            });
        }
    }

    fn milestone(&mut self, text: String) {
        if self.dedup.admit(&text) {
            self.notify(AgentNotification::Milestone {
                session_id: self.session.id,
                text,
            });
        }
    }

    fn notify(&self, notification: AgentNotification) {
        // 没有订阅者时忽略
        let _ = self.deps.notifications.send(notification);
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.session.status == status {
            return;
        }
        self.session.status = status;
        self.notify(AgentNotification::StatusChanged {
            session_id: self.session.id,
            status,
        });
        self.publish();
    }

    /// 发布只读视图；已被取代的会话不再覆盖
    fn publish(&self) {
        if !self.deps.lock.is_current(self.session.id) {
            return;
        }
        self.deps
            .view
            .send_replace(SessionView::project(&self.session, &self.memory, &self.registry));
    }

    /// 持久化失败只记日志，不影响会话
    async fn persist(&self) {
        let store = self.deps.persistence.as_ref();
        if self.deps.lock.is_current(self.session.id) {
            if let Err(e) = save_json(store, SESSION_KEY, &self.session).await {
                tracing::warn!(error = %e, "failed to persist session");
            }
        }
        if let Err(e) = save_json(store, &memory_key(self.session.id), &self.memory).await {
            tracing::warn!(error = %e, "failed to persist memory");
        }
    }

    /// 进入终态：通知、清理标签页与持久化、重置组件、释放锁
    async fn finish(mut self, result: Result<String, AgentError>) -> SessionOutcome {
        let session_id = self.session.id;
        let root = self.memory.primary_goal().map(|g| g.id);
        let (status, message) = match &result {
            Ok(summary) => {
                let actions = self.session.action_count();
                tracing::info!(%session_id, actions, "session completed");
                if let Some(root) = root {
                    self.memory.update_status(root, GoalStatus::Completed);
                }
                self.notify(AgentNotification::TaskComplete {
                    session_id,
                    summary: summary.clone(),
                });
                (SessionStatus::Completed, summary.clone())
            }
            Err(e) => {
                let kind = e.failure_kind();
                tracing::warn!(
                    %session_id,
                    kind = kind.as_str(),
                    error = %e,
                    "session ended with error"
                );
                if let Some(root) = root {
                    self.memory.update_status(root, GoalStatus::Failed);
                }
                self.notify(AgentNotification::TaskError {
                    session_id,
                    reason: e.to_string(),
                    kind: kind.as_str().to_string(),
                });
                (SessionStatus::Error, e.to_string())
            }
        };
        self.session.finish(status, message.clone());
        self.notify(AgentNotification::StatusChanged { session_id, status });

        let superseded = matches!(result, Err(AgentError::Superseded(_)));
        if matches!(result, Err(AgentError::Cancelled) | Err(AgentError::Superseded(_))) {
            self.close_agent_targets().await;
        }
        self.publish();

        let store = self.deps.persistence.as_ref();
        if self.deps.lock.is_current(session_id) {
            if let Err(e) = store.remove(SESSION_KEY).await {
                tracing::warn!(error = %e, "failed to clear persisted session");
            }
        }
        if let Err(e) = store.remove(&memory_key(session_id)).await {
            tracing::warn!(error = %e, "failed to clear persisted memory");
        }

        let outcome = SessionOutcome {
            session_id,
            status,
            message,
            actions: self.session.action_count(),
        };

        self.memory.reset();
        self.registry.reset();
        self.recovery.reset();
        self.dedup.reset();
        if !superseded {
            self.deps.planner.limiter().reset().await;
        }
        self.deps.lock.release(session_id);
        self.outcome_tx.send_replace(Some(outcome.clone()));
        outcome
    }

    /// 取消时关闭 Agent 打开的标签页。不再与取消竞争，
    /// 但总耗时限制在停止宽限期的一半内，留出时间清理持久化状态
    async fn close_agent_targets(&mut self) {
        let ids = self.registry.agent_opened();
        if ids.is_empty() {
            return;
        }
        let budget = Duration::from_millis(self.cfg().timeouts.stop_grace_secs * 500);
        let executor = &self.deps.executor;
        let closing = futures_util::future::join_all(ids.iter().map(|id| async move {
            let close = Action::CloseTarget {
                target_id: Some(id.clone()),
            };
            (id, executor.perform(id, &close).await)
        }));
        let results = match tokio::time::timeout(budget, closing).await {
            Ok(results) => results,
            Err(_) => {
                tracing::warn!(
                    targets = ids.len(),
                    budget_ms = budget.as_millis() as u64,
                    "closing agent targets timed out, leaving them open"
                );
                return;
            }
        };
        for (id, result) in results {
            match result {
                Ok(_) => {
                    if let Err(e) = self.registry.close_target(id) {
                        tracing::debug!(target_id = %id, error = %e, "target already gone");
                    }
                }
                Err(e) => {
                    tracing::warn!(target_id = %id, error = %e, "failed to close target on cancel")
                }
            }
        }
        self.drain_target_events();
    }
}
