//! Agent 编排器：会话生命周期
//!
//! 负责：根据配置创建 Planner（主 / 备），在会话锁内启动、取代、停止会话，
//! 并对外提供通知订阅（broadcast）与只读状态（watch）。每个会话在独立的后台任务中运行。
//! 配置可热重载：会话级参数（上限、阈值、宽限期等）在下一次 start_session 时生效，
//! 执行器超时、限流器与 Planner 在构建时已固定。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::actuator::ActionExecutor;
use crate::config::{reload_config, AppConfig};
use crate::core::{AgentError, SessionLock, SessionSupervisor, SessionView};
use crate::llm::{create_deepseek_client, LlmClient, MockLlmClient, OpenAiClient};
use crate::memory::{memory_key, save_json, Persistence, SESSION_KEY};
use crate::react::{
    AgentNotification, LlmPlanner, Planner, PlannerGateway, SessionDeps, SessionRunner,
};
use crate::session::{Session, SessionOutcome};

/// 通知通道容量
const NOTIFICATION_CAPACITY: usize = 256;

/// 根据配置选择 LLM 后端（DeepSeek / OpenAI 兼容 / Mock）
pub(crate) fn create_llm_from_config(cfg: &AppConfig, model: &str) -> Arc<dyn LlmClient> {
    match cfg.llm.provider.to_lowercase().as_str() {
        "deepseek" => {
            tracing::info!("Using DeepSeek LLM ({})", model);
            Arc::new(create_deepseek_client(Some(model)))
        }
        "openai" => {
            tracing::info!("Using OpenAI LLM ({})", model);
            Arc::new(OpenAiClient::new(cfg.llm.base_url.as_deref(), model, None))
        }
        "mock" => Arc::new(MockLlmClient::new()),
        other => {
            tracing::warn!("Unknown LLM provider {:?}, using Mock LLM", other);
            Arc::new(MockLlmClient::new())
        }
    }
}

/// 主 Planner 与可选的备用 Planner（同一 provider 的 fallback_model）
pub fn create_planner_from_config(
    cfg: &AppConfig,
) -> (Arc<dyn Planner>, Option<Arc<dyn Planner>>) {
    let system_prompt = ["config/prompts/planner.md", "../config/prompts/planner.md"]
        .into_iter()
        .find_map(|p| std::fs::read_to_string(p).ok());

    let build = |model: &str| -> Arc<dyn Planner> {
        let planner = LlmPlanner::new(create_llm_from_config(cfg, model));
        match system_prompt.as_deref() {
            Some(prompt) => Arc::new(planner.with_system_prompt(prompt)),
            None => Arc::new(planner),
        }
    };

    let primary = build(&cfg.llm.model);
    let fallback = cfg
        .llm
        .fallback_model
        .as_deref()
        .filter(|m| !m.is_empty() && *m != cfg.llm.model)
        .map(build);
    (primary, fallback)
}

struct RunningSession {
    id: Uuid,
    supervisor: SessionSupervisor,
    handle: JoinHandle<SessionOutcome>,
    outcome: watch::Receiver<Option<SessionOutcome>>,
}

/// 会话编排器
pub struct Orchestrator {
    deps: SessionDeps,
    config: RwLock<Arc<AppConfig>>,
    config_path: Option<PathBuf>,
    view_rx: watch::Receiver<SessionView>,
    running: Mutex<Option<RunningSession>>,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        executor: ActionExecutor,
        planner: Arc<PlannerGateway>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (view_tx, view_rx) = watch::channel(SessionView::default());
        let config = Arc::new(config);
        Self {
            config: RwLock::new(config.clone()),
            config_path: None,
            deps: SessionDeps {
                config,
                executor,
                planner,
                persistence,
                lock: Arc::new(SessionLock::new()),
                notifications,
                view: Arc::new(view_tx),
            },
            view_rx,
            running: Mutex::new(None),
        }
    }

    /// 额外的配置文件，重载时叠加在默认配置之上
    pub(crate) fn with_config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub async fn config(&self) -> Arc<AppConfig> {
        self.config.read().await.clone()
    }

    /// 重新读取配置文件与环境变量，下一次 start_session 生效
    pub async fn reload_config(&self) -> Result<Arc<AppConfig>, AgentError> {
        let cfg = reload_config(self.config_path.clone())
            .map(Arc::new)
            .map_err(|e| AgentError::Config(e.to_string()))?;
        tracing::info!(app = cfg.app.display_name(), "config reloaded");
        *self.config.write().await = cfg.clone();
        Ok(cfg)
    }

    /// 订阅会话通知
    pub fn subscribe(&self) -> broadcast::Receiver<AgentNotification> {
        self.deps.notifications.subscribe()
    }

    /// 订阅只读状态
    pub fn subscribe_state(&self) -> watch::Receiver<SessionView> {
        self.view_rx.clone()
    }

    pub fn current_view(&self) -> SessionView {
        self.view_rx.borrow().clone()
    }

    /// 当前持锁的会话
    pub fn current_session(&self) -> Option<Uuid> {
        self.deps.lock.current()
    }

    async fn grace(&self) -> Duration {
        Duration::from_secs(self.config().await.timeouts.stop_grace_secs)
    }

    /// 中止的会话没有机会自行清理持久化状态
    async fn clear_persisted(&self, session_id: Uuid, clear_session: bool) {
        let store = self.deps.persistence.as_ref();
        if clear_session {
            if let Err(e) = store.remove(SESSION_KEY).await {
                tracing::warn!(error = %e, "failed to clear aborted session");
            }
        }
        if let Err(e) = store.remove(&memory_key(session_id)).await {
            tracing::warn!(error = %e, "failed to clear aborted session memory");
        }
    }

    /// 启动新会话；已有会话运行时先取代（取消并有界等待其清理）
    pub async fn start_session(&self, goal: &str) -> Result<Uuid, AgentError> {
        let goal = goal.trim();
        if goal.is_empty() {
            return Err(AgentError::EmptyGoal);
        }
        let lock = &self.deps.lock;
        lock.run_exclusive(|| async move {
            let config = self.config().await;
            let session = Session::new(goal);
            let id = session.id;
            lock.claim(id);

            let mut running = self.running.lock().await;
            if let Some(previous) = running.take() {
                tracing::info!(previous = %previous.id, next = %id, "superseding running session");
                previous.supervisor.cancel();
                self.settle(previous).await;
            }

            if let Err(e) = save_json(self.deps.persistence.as_ref(), SESSION_KEY, &session).await {
                tracing::warn!(error = %e, "failed to persist new session");
            }

            let supervisor = SessionSupervisor::new();
            let (outcome_tx, outcome) = watch::channel(None);
            let span = tracing::info_span!("session", app = config.app.display_name(), %id);
            let deps = SessionDeps {
                config,
                ..self.deps.clone()
            };
            let runner = SessionRunner::new(deps, session, supervisor.clone(), outcome_tx);
            let handle = tokio::spawn(runner.run().instrument(span));
            *running = Some(RunningSession {
                id,
                supervisor,
                handle,
                outcome,
            });
            Ok(id)
        })
        .await
    }

    /// 停止当前会话（幂等）；返回会话结果，没有会话时返回 None
    pub async fn stop_session(&self) -> Option<SessionOutcome> {
        let lock = &self.deps.lock;
        lock.run_exclusive(|| async move {
            let mut running = self.running.lock().await;
            let current = running.as_mut()?;
            let finished = current.outcome.borrow().clone();
            if finished.is_some() {
                return finished;
            }
            tracing::info!(session_id = %current.id, "stopping session");
            current.supervisor.cancel();
            let outcome = Self::await_outcome(&mut current.outcome, self.grace().await).await;
            if outcome.is_some() {
                return outcome;
            }
            let current = running.take()?;
            tracing::warn!(session_id = %current.id, "session did not stop in time, aborting");
            current.handle.abort();
            // 等任务真正停下，避免它在清理之后再写一次持久化
            let _ = current.handle.await;
            self.clear_persisted(current.id, true).await;
            lock.release(current.id);
            None
        })
        .await
    }

    /// 等待当前会话结束
    pub async fn wait(&self) -> Option<SessionOutcome> {
        let mut outcome = self.running.lock().await.as_ref()?.outcome.clone();
        let result = outcome.wait_for(|o| o.is_some()).await;
        match result {
            Ok(done) => done.clone(),
            Err(_) => None,
        }
    }

    /// 等待被取代的会话完成清理，超时则中止任务
    async fn settle(&self, previous: RunningSession) {
        let RunningSession {
            id,
            mut outcome,
            handle,
            ..
        } = previous;
        if Self::await_outcome(&mut outcome, self.grace().await).await.is_none() {
            tracing::warn!(session_id = %id, "superseded session did not finish in time, aborting");
            handle.abort();
            let _ = handle.await;
            // 会话键随后由新会话覆盖
            self.clear_persisted(id, false).await;
        }
    }

    async fn await_outcome(
        outcome: &mut watch::Receiver<Option<SessionOutcome>>,
        grace: Duration,
    ) -> Option<SessionOutcome> {
        match tokio::time::timeout(grace, outcome.wait_for(|o| o.is_some())).await {
            Ok(Ok(done)) => done.clone(),
            _ => None,
        }
    }
}
