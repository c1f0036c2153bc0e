//! 会话级场景测试：脚本化 Planner + 模拟页面

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use tabpilot::actuator::{
    Action, ActionKind, PlannedAction, ScrollDirection, SimElement, SimPage, SimulatedSurface,
    TargetId,
};
use tabpilot::config::AppConfig;
use tabpilot::memory::{InMemoryPersistence, Persistence, PersistenceError};
use tabpilot::react::{
    AgentNotification, PlanRequest, Planner, PlannerDecision, PlannerError, PlannerStatus,
};
use tabpilot::{Orchestrator, OrchestratorBuilder, SessionStatus};

/// 按顺序返回决策，用完后重复 fallback；记录每次请求
struct ScriptedPlanner {
    script: Mutex<VecDeque<PlannerDecision>>,
    fallback: PlannerDecision,
    requests: Mutex<Vec<PlanRequest>>,
}

impl ScriptedPlanner {
    fn new(script: Vec<PlannerDecision>, fallback: PlannerDecision) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn repeating(decision: PlannerDecision) -> Arc<Self> {
        Self::new(Vec::new(), decision)
    }

    fn requests(&self) -> Vec<PlanRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, request: &PlanRequest) -> Result<PlannerDecision, PlannerError> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self.script.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// 第一次 remove 卡住很久，模拟清理时挂起的存储
struct StallingPersistence {
    inner: InMemoryPersistence,
    stall_next_remove: AtomicBool,
}

impl StallingPersistence {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryPersistence::new(),
            stall_next_remove: AtomicBool::new(true),
        })
    }
}

#[async_trait]
impl Persistence for StallingPersistence {
    async fn load(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        self.inner.load(key).await
    }

    async fn save(&self, key: &str, blob: &str) -> Result<(), PersistenceError> {
        self.inner.save(key, blob).await
    }

    async fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        if self.stall_next_remove.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
        }
        self.inner.remove(key).await
    }
}

fn act(action: Action) -> PlannerDecision {
    PlannerDecision::act(PlannedAction::bare(action), "next step")
}

fn done(summary: &str) -> PlannerDecision {
    PlannerDecision::finished(PlannerStatus::Done, summary)
}

fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.session.action_delay_ms = 0;
    cfg.rate_limit.min_delay_ms = 0;
    cfg.rate_limit.max_calls = 1_000;
    cfg.recovery.no_progress_threshold = 100;
    cfg
}

fn shop() -> SimulatedSurface {
    SimulatedSurface::new("https://shop.example")
        .with_page(
            "https://shop.example",
            SimPage::new("Shop")
                .element(SimElement::new("searchbox", "Search products", 400, 80))
                .element(SimElement::new("text", "Free shipping", 400, 200))
                .data("price", "10"),
        )
        .with_page(
            "https://other.example",
            SimPage::new("Other shop").data("price", "12"),
        )
}

fn build(
    cfg: AppConfig,
    surface: Arc<SimulatedSurface>,
    planner: Arc<ScriptedPlanner>,
    persistence: Arc<InMemoryPersistence>,
) -> Orchestrator {
    OrchestratorBuilder::new(cfg)
        .surface(surface)
        .planner(planner)
        .persistence(persistence)
        .build()
        .unwrap()
}

fn memory() -> Arc<InMemoryPersistence> {
    Arc::new(InMemoryPersistence::new())
}

fn drain(rx: &mut broadcast::Receiver<AgentNotification>) -> Vec<AgentNotification> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        out.push(n);
    }
    out
}

#[tokio::test]
async fn test_action_limit_reached_after_exact_ceiling() {
    let mut cfg = test_config();
    cfg.session.max_actions = 5;
    let surface = Arc::new(shop());
    let planner = ScriptedPlanner::repeating(act(Action::Scroll {
        direction: ScrollDirection::Down,
        amount: 100,
    }));
    let orchestrator = build(cfg, surface.clone(), planner, memory());
    let mut rx = orchestrator.subscribe();

    orchestrator.start_session("find X").await.unwrap();
    let outcome = orchestrator.wait().await.unwrap();

    assert_eq!(outcome.status, SessionStatus::Error);
    assert!(outcome.message.starts_with("action limit reached"), "{}", outcome.message);
    assert_eq!(outcome.actions, 5);
    assert_eq!(surface.performed().len(), 5);

    let notifications = drain(&mut rx);
    assert!(notifications.iter().any(|n| matches!(
        n,
        AgentNotification::TaskError { kind, .. } if kind == "stuck"
    )));
    let view = orchestrator.current_view();
    assert_eq!(view.status, Some(SessionStatus::Error));
    assert_eq!(view.step, 5);
}

#[tokio::test]
async fn test_repeated_actuator_failure_names_the_action_kind() {
    let surface = Arc::new(shop());
    surface.fail_next(ActionKind::Click, 3);
    let planner = ScriptedPlanner::repeating(act(Action::Click {
        x: 400,
        y: 80,
        element: Some("Search".into()),
    }));
    let orchestrator = build(test_config(), surface.clone(), planner.clone(), memory());
    let mut rx = orchestrator.subscribe();

    orchestrator.start_session("search for laptops").await.unwrap();
    let outcome = orchestrator.wait().await.unwrap();

    assert_eq!(outcome.status, SessionStatus::Error);
    assert!(outcome.message.contains("click"), "{}", outcome.message);
    assert_eq!(outcome.actions, 3);
    assert_eq!(planner.requests().len(), 1);
    assert!(surface.performed().is_empty());
    assert!(drain(&mut rx).iter().any(|n| matches!(
        n,
        AgentNotification::TaskError { kind, .. } if kind == "actuation"
    )));
}

#[tokio::test]
async fn test_two_targets_reporting_price_are_correlated() {
    let surface = Arc::new(shop());
    let planner = ScriptedPlanner::new(
        vec![
            act(Action::ExtractText {
                key: "price".into(),
                element: None,
            }),
            act(Action::OpenTarget {
                url: Some("https://other.example".into()),
                purpose: Some("compare prices".into()),
            }),
            act(Action::ExtractText {
                key: "price".into(),
                element: None,
            }),
        ],
        done("compared both prices"),
    );
    let orchestrator = build(test_config(), surface.clone(), planner.clone(), memory());

    orchestrator.start_session("compare the price").await.unwrap();
    let outcome = orchestrator.wait().await.unwrap();
    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.actions, 3);

    let requests = planner.requests();
    assert_eq!(requests.len(), 4);
    let summary = &requests[3].targets_summary;
    // 两个标签页佐证：0.5 + 0.2
    assert!(summary.contains("price (0.70)"), "{}", summary);
    assert!(summary.contains("tab-0=10"), "{}", summary);
    assert!(summary.contains("tab-1=12"), "{}", summary);
    assert!(requests[3].memory_summary.contains("price"));
    assert_eq!(surface.open_tabs().len(), 2);
}

#[tokio::test]
async fn test_done_runs_delivery_and_clears_persistence() {
    let surface = Arc::new(shop());
    let deliver = Action::Deliver {
        filename: "report.md".into(),
        format: "md".into(),
        content: "# Prices".into(),
    };
    let mut decision = done("report delivered");
    decision.action = Some(PlannedAction::bare(deliver.clone()));
    let planner = ScriptedPlanner::repeating(decision);
    let persistence = Arc::new(InMemoryPersistence::new());
    let orchestrator = build(test_config(), surface.clone(), planner, persistence.clone());
    let mut rx = orchestrator.subscribe();

    let id = orchestrator.start_session("write a report").await.unwrap();
    let outcome = orchestrator.wait().await.unwrap();

    assert_eq!(outcome.session_id, id);
    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.message, "report delivered");
    assert_eq!(surface.performed(), vec![deliver]);
    assert!(persistence.keys().await.is_empty());
    assert!(orchestrator.current_session().is_none());

    let notifications = drain(&mut rx);
    assert!(notifications.iter().any(|n| matches!(
        n,
        AgentNotification::Milestone { text, .. } if text.contains("report.md")
    )));
    assert!(notifications.iter().any(|n| matches!(
        n,
        AgentNotification::TaskComplete { summary, .. } if summary == "report delivered"
    )));
}

#[tokio::test]
async fn test_planner_without_action_trips_livelock_guard() {
    let planner =
        ScriptedPlanner::repeating(PlannerDecision::finished(PlannerStatus::Continue, "thinking"));
    let orchestrator = build(test_config(), Arc::new(shop()), planner.clone(), memory());
    let mut rx = orchestrator.subscribe();

    orchestrator.start_session("find X").await.unwrap();
    let outcome = orchestrator.wait().await.unwrap();

    assert_eq!(outcome.status, SessionStatus::Error);
    assert_eq!(outcome.actions, 0);
    assert_eq!(planner.requests().len(), 3);
    assert!(drain(&mut rx).iter().any(|n| matches!(
        n,
        AgentNotification::TaskError { kind, .. } if kind == "malformed_planner"
    )));
}

#[tokio::test]
async fn test_clarification_request_ends_session() {
    let planner = ScriptedPlanner::repeating(PlannerDecision::finished(
        PlannerStatus::NeedsClarification,
        "Which laptop model?",
    ));
    let orchestrator = build(test_config(), Arc::new(shop()), planner, memory());
    let mut rx = orchestrator.subscribe();

    orchestrator.start_session("buy a laptop").await.unwrap();
    let outcome = orchestrator.wait().await.unwrap();
    assert_eq!(outcome.status, SessionStatus::Error);
    assert!(drain(&mut rx).iter().any(|n| matches!(
        n,
        AgentNotification::ClarificationNeeded { question, .. } if question == "Which laptop model?"
    )));
}

#[tokio::test]
async fn test_stop_is_idempotent_and_closes_agent_targets() {
    let mut cfg = test_config();
    cfg.session.action_delay_ms = 10_000;
    let surface = Arc::new(shop());
    let planner = ScriptedPlanner::new(
        vec![act(Action::OpenTarget {
            url: Some("https://other.example".into()),
            purpose: None,
        })],
        act(Action::Wait { ms: 10 }),
    );
    let persistence = Arc::new(InMemoryPersistence::new());
    let orchestrator = build(cfg, surface.clone(), planner, persistence.clone());

    assert!(orchestrator.stop_session().await.is_none());

    orchestrator.start_session("look around").await.unwrap();
    let mut state = orchestrator.subscribe_state();
    state.wait_for(|v| v.step >= 1).await.unwrap();
    assert_eq!(surface.open_tabs().len(), 2);

    let first = orchestrator.stop_session().await.unwrap();
    assert_eq!(first.status, SessionStatus::Error);
    assert!(first.message.contains("cancelled"), "{}", first.message);
    let second = orchestrator.stop_session().await.unwrap();
    assert_eq!(first, second);

    assert_eq!(surface.open_tabs(), vec![TargetId::new("tab-0")]);
    assert!(orchestrator.current_session().is_none());
    assert!(persistence.keys().await.is_empty());
    assert!(!orchestrator.current_view().is_running());
}

#[tokio::test]
async fn test_new_session_supersedes_running_one() {
    let mut cfg = test_config();
    cfg.session.action_delay_ms = 10_000;
    let planner = ScriptedPlanner::repeating(act(Action::Wait { ms: 10 }));
    let orchestrator = build(cfg, Arc::new(shop()), planner, memory());
    let mut rx = orchestrator.subscribe();

    let first = orchestrator.start_session("first goal").await.unwrap();
    let mut state = orchestrator.subscribe_state();
    state.wait_for(|v| v.session_id == Some(first) && v.step >= 1).await.unwrap();

    let second = orchestrator.start_session("second goal").await.unwrap();
    assert_ne!(first, second);
    assert_eq!(orchestrator.current_session(), Some(second));

    let notifications = drain(&mut rx);
    assert!(notifications.iter().any(|n| matches!(
        n,
        AgentNotification::TaskError { session_id, kind, .. }
            if *session_id == first && kind == "cancelled"
    )));

    let stopped = orchestrator.stop_session().await.unwrap();
    assert_eq!(stopped.session_id, second);
    assert!(orchestrator.current_session().is_none());
}

#[tokio::test]
async fn test_empty_goal_rejected() {
    let planner = ScriptedPlanner::repeating(done("nothing to do"));
    let orchestrator = build(test_config(), Arc::new(shop()), planner, memory());
    assert!(orchestrator.start_session("   ").await.is_err());
    assert!(orchestrator.current_session().is_none());
}

#[tokio::test]
async fn test_failed_attempts_reach_the_next_prompt() {
    let surface = Arc::new(shop());
    surface.fail_next(ActionKind::Scroll, 2);
    let planner = ScriptedPlanner::new(
        vec![act(Action::Scroll {
            direction: ScrollDirection::Down,
            amount: 200,
        })],
        done("looked around"),
    );
    let orchestrator = build(test_config(), surface.clone(), planner.clone(), memory());

    orchestrator.start_session("look around").await.unwrap();
    let outcome = orchestrator.wait().await.unwrap();
    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.actions, 3);
    assert_eq!(surface.performed().len(), 1);

    let requests = planner.requests();
    assert_eq!(requests.len(), 2);
    assert!(!requests[0].memory_summary.contains("## Failed attempts"));
    let summary = &requests[1].memory_summary;
    assert!(summary.contains("## Failed attempts"), "{}", summary);
    assert!(summary.contains("injected scroll failure"), "{}", summary);
}

#[tokio::test]
async fn test_closing_primary_target_moves_primary_to_active_tab() {
    let surface = Arc::new(shop());
    let planner = ScriptedPlanner::new(
        vec![
            act(Action::OpenTarget {
                url: Some("https://other.example".into()),
                purpose: Some("compare prices".into()),
            }),
            act(Action::CloseTarget {
                target_id: Some(TargetId::new("tab-0")),
            }),
        ],
        done("only the second shop left"),
    );
    let orchestrator = build(test_config(), surface.clone(), planner.clone(), memory());

    orchestrator.start_session("compare the price").await.unwrap();
    let outcome = orchestrator.wait().await.unwrap();
    assert_eq!(outcome.status, SessionStatus::Completed);

    assert_eq!(surface.open_tabs(), vec![TargetId::new("tab-1")]);
    let view = orchestrator.current_view();
    assert_eq!(view.primary_target, Some(TargetId::new("tab-1")));
    assert_eq!(planner.requests()[2].context.target_id, TargetId::new("tab-1"));
}

#[tokio::test(start_paused = true)]
async fn test_stop_bounds_closing_agent_targets() {
    let mut cfg = test_config();
    cfg.session.action_delay_ms = 10_000;
    cfg.timeouts.stop_grace_secs = 2;
    let surface = Arc::new(shop());
    surface.stall_next(ActionKind::CloseTarget, 1, Duration::from_secs(60));
    let planner = ScriptedPlanner::new(
        vec![act(Action::OpenTarget {
            url: Some("https://other.example".into()),
            purpose: None,
        })],
        act(Action::Wait { ms: 10 }),
    );
    let persistence = memory();
    let orchestrator = build(cfg, surface.clone(), planner, persistence.clone());

    orchestrator.start_session("look around").await.unwrap();
    let mut state = orchestrator.subscribe_state();
    state.wait_for(|v| v.step >= 1).await.unwrap();

    let started = tokio::time::Instant::now();
    let outcome = orchestrator.stop_session().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(outcome.status, SessionStatus::Error);
    // 关闭超时的标签页留在原处
    assert_eq!(surface.open_tabs().len(), 2);
    assert!(persistence.keys().await.is_empty());
    assert!(orchestrator.current_session().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_aborted_session_clears_persisted_state() {
    let mut cfg = test_config();
    cfg.session.action_delay_ms = 10_000;
    cfg.timeouts.stop_grace_secs = 1;
    let persistence = StallingPersistence::new();
    let orchestrator = OrchestratorBuilder::new(cfg)
        .surface(Arc::new(shop()))
        .planner(ScriptedPlanner::repeating(act(Action::Wait { ms: 10 })))
        .persistence(persistence.clone())
        .build()
        .unwrap();

    orchestrator.start_session("look around").await.unwrap();
    let mut state = orchestrator.subscribe_state();
    state.wait_for(|v| v.step >= 1).await.unwrap();
    assert_eq!(persistence.inner.keys().await.len(), 2);

    // 会话卡在清理上，宽限期后被中止
    assert!(orchestrator.stop_session().await.is_none());
    assert!(persistence.inner.keys().await.is_empty());
    assert!(orchestrator.current_session().is_none());

    let started = tokio::time::Instant::now();
    assert!(orchestrator.stop_session().await.is_none());
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_unverified_click_is_retried_once_with_hint() {
    let surface = Arc::new(shop());
    let click = Action::Click {
        x: 400,
        y: 200,
        element: Some("Free shipping".into()),
    };
    let planner = ScriptedPlanner::new(vec![act(click.clone())], done("nothing happened"));
    let orchestrator = build(test_config(), surface.clone(), planner.clone(), memory());

    orchestrator.start_session("get free shipping").await.unwrap();
    let outcome = orchestrator.wait().await.unwrap();
    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.actions, 2);
    assert_eq!(surface.performed(), vec![click.clone(), click]);

    let history = &planner.requests()[1].history;
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|h| h.success && h.verified == Some(false)));
    assert!(history[1].description.starts_with("retry:"), "{}", history[1].description);
    assert_eq!(history[1].note.as_deref(), Some("no change observed"));
}

#[tokio::test]
async fn test_recovery_falls_back_to_other_target() {
    let mut cfg = test_config();
    cfg.recovery.no_progress_threshold = 2;
    let surface = Arc::new(shop());
    let wait = || act(Action::Wait { ms: 10 });
    let planner = ScriptedPlanner::new(
        vec![
            act(Action::OpenTarget {
                url: Some("https://other.example".into()),
                purpose: None,
            }),
            wait(),
            wait(),
            wait(),
            wait(),
        ],
        done("back on the first shop"),
    );
    let orchestrator = build(cfg, surface.clone(), planner, memory());
    let mut rx = orchestrator.subscribe();

    orchestrator.start_session("compare the price").await.unwrap();
    let outcome = orchestrator.wait().await.unwrap();
    assert_eq!(outcome.status, SessionStatus::Completed);

    let performed = surface.performed();
    assert!(performed.iter().any(|a| matches!(a, Action::Scroll { .. })));
    assert!(performed.contains(&Action::Refresh));
    assert!(performed.contains(&Action::SwitchTarget {
        target_id: TargetId::new("tab-0")
    }));
    assert!(performed.contains(&Action::CloseTarget {
        target_id: Some(TargetId::new("tab-1"))
    }));
    assert_eq!(surface.open_tabs(), vec![TargetId::new("tab-0")]);
    assert_eq!(orchestrator.current_view().primary_target, Some(TargetId::new("tab-0")));

    assert!(drain(&mut rx).iter().any(|n| matches!(
        n,
        AgentNotification::Milestone { text, .. } if text.contains("switching to tab-0")
    )));
}

#[tokio::test]
async fn test_recovery_gives_up_after_budget() {
    let mut cfg = test_config();
    cfg.recovery.no_progress_threshold = 2;
    cfg.recovery.max_recovery_attempts = 1;
    let planner = ScriptedPlanner::repeating(act(Action::Wait { ms: 10 }));
    let orchestrator = build(cfg, Arc::new(shop()), planner, memory());
    let mut rx = orchestrator.subscribe();

    orchestrator.start_session("wait for something").await.unwrap();
    let outcome = orchestrator.wait().await.unwrap();
    assert_eq!(outcome.status, SessionStatus::Error);
    assert!(outcome.message.contains("gave up after 1 recovery attempts"), "{}", outcome.message);
    assert!(drain(&mut rx).iter().any(|n| matches!(
        n,
        AgentNotification::TaskError { kind, .. } if kind == "stuck"
    )));
}

#[tokio::test(start_paused = true)]
async fn test_context_capture_is_retried_with_backoff() {
    let surface = Arc::new(shop());
    surface.fail_captures(2);
    let planner = ScriptedPlanner::repeating(done("seen it"));
    let orchestrator = build(test_config(), surface, planner.clone(), memory());

    let started = tokio::time::Instant::now();
    orchestrator.start_session("look").await.unwrap();
    let outcome = orchestrator.wait().await.unwrap();
    assert_eq!(outcome.status, SessionStatus::Completed);
    // 500ms + 1000ms
    assert!(started.elapsed() >= Duration::from_millis(1_500));
    assert_eq!(planner.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_context_capture_exhaustion_is_transient() {
    let surface = Arc::new(shop());
    surface.fail_captures(3);
    let planner = ScriptedPlanner::repeating(done("seen it"));
    let orchestrator = build(test_config(), surface, planner.clone(), memory());
    let mut rx = orchestrator.subscribe();

    orchestrator.start_session("look").await.unwrap();
    let outcome = orchestrator.wait().await.unwrap();
    assert_eq!(outcome.status, SessionStatus::Error);
    assert!(outcome.message.contains("after 3 attempts"), "{}", outcome.message);
    assert!(planner.requests().is_empty());
    assert!(drain(&mut rx).iter().any(|n| matches!(
        n,
        AgentNotification::TaskError { kind, .. } if kind == "transient"
    )));
}

#[tokio::test(start_paused = true)]
async fn test_actuator_timeout_is_retried() {
    let mut cfg = test_config();
    cfg.timeouts.actuator_secs = 1;
    let surface = Arc::new(shop());
    surface.stall_next(ActionKind::Click, 1, Duration::from_secs(60));
    let click = Action::Click {
        x: 400,
        y: 80,
        element: Some("Search products".into()),
    };
    let planner = ScriptedPlanner::new(vec![act(click.clone())], done("search box focused"));
    let orchestrator = build(cfg, surface.clone(), planner.clone(), memory());

    orchestrator.start_session("focus the search box").await.unwrap();
    let outcome = orchestrator.wait().await.unwrap();
    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(surface.performed(), vec![click]);

    let history = &planner.requests()[1].history;
    assert_eq!(history.len(), 2);
    assert!(!history[0].success);
    assert!(history[0].note.as_deref().is_some_and(|n| n.contains("timed out")));
    assert!(history[1].success);
    assert_eq!(history[1].verified, Some(true));
}

#[tokio::test(start_paused = true)]
async fn test_planner_calls_respect_min_delay() {
    let mut cfg = test_config();
    cfg.rate_limit.min_delay_ms = 1_000;
    let planner = ScriptedPlanner::new(
        vec![act(Action::Wait { ms: 10 }), act(Action::Wait { ms: 10 })],
        done("waited"),
    );
    let orchestrator = build(cfg, Arc::new(shop()), planner.clone(), memory());

    let started = tokio::time::Instant::now();
    orchestrator.start_session("wait twice").await.unwrap();
    let outcome = orchestrator.wait().await.unwrap();
    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(planner.requests().len(), 3);
    assert!(started.elapsed() >= Duration::from_millis(2_000));
}
