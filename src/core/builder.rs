//! Orchestrator 构建器：统一的组装逻辑
//!
//! 外部协作者（Actuator / ContextProvider / Planner / Persistence）都可以注入；
//! 未注入的 Planner 按配置创建，未注入的持久化按 `app.state_dir` 选择文件或内存实现。

use std::path::PathBuf;
use std::sync::Arc;

use crate::actuator::{ActionExecutor, Actuator, ContextProvider, SimulatedSurface};
use crate::config::AppConfig;
use crate::core::{create_planner_from_config, AgentError, Orchestrator, RateLimiter};
use crate::memory::{InMemoryPersistence, JsonFilePersistence, Persistence};
use crate::react::{Planner, PlannerGateway};

/// Orchestrator 构建器
pub struct OrchestratorBuilder {
    config: AppConfig,
    actuator: Option<Arc<dyn Actuator>>,
    context_provider: Option<Arc<dyn ContextProvider>>,
    planner: Option<Arc<dyn Planner>>,
    fallback_planner: Option<Arc<dyn Planner>>,
    persistence: Option<Arc<dyn Persistence>>,
    config_path: Option<PathBuf>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            actuator: None,
            context_provider: None,
            planner: None,
            fallback_planner: None,
            persistence: None,
            config_path: None,
        }
    }

    pub fn actuator(mut self, actuator: Arc<dyn Actuator>) -> Self {
        self.actuator = Some(actuator);
        self
    }

    pub fn context_provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.context_provider = Some(provider);
        self
    }

    /// 模拟页面同时充当 Actuator 与 ContextProvider
    pub fn surface(self, surface: Arc<SimulatedSurface>) -> Self {
        self.actuator(surface.clone()).context_provider(surface)
    }

    pub fn planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn fallback_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.fallback_planner = Some(planner);
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// 配置来自的额外文件；Orchestrator::reload_config 会重新读取它
    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub fn build(self) -> Result<Orchestrator, AgentError> {
        let cfg = self.config;
        let actuator = self
            .actuator
            .ok_or_else(|| AgentError::Config("no actuator configured".to_string()))?;
        let provider = self
            .context_provider
            .ok_or_else(|| AgentError::Config("no context provider configured".to_string()))?;

        let (primary, fallback) = match self.planner {
            Some(p) => (p, self.fallback_planner),
            None => {
                let (p, fb) = create_planner_from_config(&cfg);
                (p, self.fallback_planner.or(fb))
            }
        };

        let state_dir = cfg.app.state_dir.as_ref();
        let persistence: Arc<dyn Persistence> = match (self.persistence, state_dir) {
            (Some(p), _) => p,
            (None, Some(dir)) => {
                tracing::info!(dir = %dir.display(), "persisting session state to disk");
                Arc::new(JsonFilePersistence::new(dir))
            }
            (None, None) => Arc::new(InMemoryPersistence::new()),
        };

        let executor = ActionExecutor::new(
            actuator,
            provider,
            cfg.timeouts.actuator_secs,
            cfg.timeouts.context_secs,
        );
        let limiter = Arc::new(RateLimiter::new(&cfg.rate_limit));
        let gateway = Arc::new(PlannerGateway::new(
            primary,
            fallback,
            limiter,
            cfg.planner.clone(),
            cfg.timeouts.planner_secs,
        ));
        let orchestrator = Orchestrator::new(cfg, executor, gateway, persistence);
        Ok(orchestrator.with_config_path(self.config_path))
    }
}
