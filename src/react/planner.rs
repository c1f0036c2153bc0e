//! Planner：根据目标、上下文、历史与记忆摘要给出下一步动作
//!
//! - Planner trait 是外部推理服务的接口；LlmPlanner 用任意 LlmClient 实现它（JSON 决策）。
//! - PlannerGateway 包住主 / 备 Planner：每次尝试先过限流器、受截止时间约束；
//!   瞬时错误指数退避重试，连续失败到一定次数后切到备用 Planner，永久错误立即返回。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::actuator::action::preview;
use crate::actuator::{Action, ActionKind, ContextSnapshot, PlannedAction};
use crate::config::PlannerSection;
use crate::core::RateLimiter;
use crate::llm::{LlmClient, LlmError, Message};
use crate::session::ActionRecord;

/// 渲染给 LLM 的快照元素上限
const MAX_RENDERED_ELEMENTS: usize = 40;
/// 原始输出预览长度（解析失败时写入 rationale）
const RAW_PREVIEW_CHARS: usize = 200;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlannerError {
    #[error("Planner rate limited (retry after {retry_after_ms}ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("Planner timed out after {0}s")]
    Timeout(u64),

    #[error("Planner quota exceeded")]
    QuotaExceeded,

    #[error("Planner failed: {0}")]
    Permanent(String),
}

impl PlannerError {
    /// 限流、超时、配额属于瞬时错误，可退避重试
    pub fn is_transient(&self) -> bool {
        !matches!(self, PlannerError::Permanent(_))
    }
}

impl From<LlmError> for PlannerError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::RateLimited { retry_after_ms } => {
                PlannerError::RateLimited { retry_after_ms }
            }
            LlmError::Timeout => PlannerError::Timeout(0),
            LlmError::QuotaExceeded => PlannerError::QuotaExceeded,
            LlmError::ApiError(msg) => PlannerError::Permanent(msg),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannerStatus {
    Continue,
    Done,
    Error,
    #[serde(alias = "needs-clarification")]
    NeedsClarification,
}

/// Planner 报告的事实
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredFact {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// 历史中的一条（给 Planner 看的精简版 ActionRecord）
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub kind: ActionKind,
    pub description: String,
    pub success: bool,
    pub verified: Option<bool>,
    pub note: Option<String>,
}

impl HistoryEntry {
    pub fn from_record(record: &ActionRecord) -> Self {
        let note = record.error.clone().or_else(|| {
            record
                .verification
                .as_ref()
                .and_then(|v| v.failure_reason.clone())
        });
        Self {
            kind: record.kind(),
            description: record.planned.description.clone(),
            success: record.success,
            verified: record.verification.as_ref().map(|v| v.success),
            note,
        }
    }
}

/// 一次规划请求
#[derive(Clone, Debug)]
pub struct PlanRequest {
    pub goal: String,
    pub context: ContextSnapshot,
    pub history: Vec<HistoryEntry>,
    /// 已执行的动作总数
    pub step: usize,
    pub memory_summary: String,
    pub targets_summary: String,
}

/// Planner 的决策
#[derive(Clone, Debug, PartialEq)]
pub struct PlannerDecision {
    pub rationale: String,
    pub action: Option<PlannedAction>,
    pub status: PlannerStatus,
    pub confidence: f64,
    pub facts: Vec<DiscoveredFact>,
    pub subgoals: Vec<String>,
    /// 已完成的子目标（按描述匹配）
    pub completed_subgoals: Vec<String>,
}

impl PlannerDecision {
    pub fn act(action: PlannedAction, rationale: impl Into<String>) -> Self {
        Self {
            rationale: rationale.into(),
            action: Some(action),
            status: PlannerStatus::Continue,
            confidence: 0.8,
            facts: Vec::new(),
            subgoals: Vec::new(),
            completed_subgoals: Vec::new(),
        }
    }

    pub fn finished(status: PlannerStatus, rationale: impl Into<String>) -> Self {
        Self {
            rationale: rationale.into(),
            action: None,
            status,
            confidence: 0.8,
            facts: Vec::new(),
            subgoals: Vec::new(),
            completed_subgoals: Vec::new(),
        }
    }
}

/// 外部推理服务
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: &PlanRequest) -> Result<PlannerDecision, PlannerError>;

    fn name(&self) -> &str {
        "planner"
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = r#"You operate a web browser to accomplish the user's goal.
Reply with exactly one JSON object:
{"rationale": "...", "status": "continue|done|error|needs_clarification", "confidence": 0.0-1.0,
 "action": {"type": "click", "x": 0, "y": 0, "element": "..."}, "description": "...",
 "facts": [{"key": "...", "value": "..."}], "subgoals": ["..."], "completed_subgoals": ["..."]}
Action types: mouse_move, click, double_click, drag, key_press, type, scroll, wait, navigate,
navigate_back, navigate_forward, refresh, open_target, close_target, switch_target,
extract_text, message, deliver. Omit "action" when status is not "continue"."#;

#[derive(Deserialize)]
struct RawDecision {
    #[serde(default)]
    rationale: String,
    #[serde(default = "default_status")]
    status: PlannerStatus,
    #[serde(default = "default_confidence")]
    confidence: f64,
    #[serde(default)]
    action: Option<serde_json::Value>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    facts: Vec<DiscoveredFact>,
    #[serde(default)]
    subgoals: Vec<String>,
    #[serde(default)]
    completed_subgoals: Vec<String>,
}

fn default_status() -> PlannerStatus {
    PlannerStatus::Continue
}

fn default_confidence() -> f64 {
    0.5
}

/// 从 LLM 输出中取 JSON：```json 代码块，否则最外层花括号
fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// 解析 LLM 决策；无法解析时返回不带动作的 continue（由循环的连续无动作保护处理）
pub fn parse_decision(output: &str) -> PlannerDecision {
    let unparseable = |why: String| {
        tracing::warn!(reason = %why, "unparseable planner output");
        PlannerDecision {
            rationale: format!(
                "unparseable planner output ({}): {}",
                why,
                preview(output.trim(), RAW_PREVIEW_CHARS)
            ),
            action: None,
            status: PlannerStatus::Continue,
            confidence: 0.0,
            facts: Vec::new(),
            subgoals: Vec::new(),
            completed_subgoals: Vec::new(),
        }
    };

    let Some(json) = extract_json(output) else {
        return unparseable("no JSON object".to_string());
    };
    let raw: RawDecision = match serde_json::from_str(json) {
        Ok(r) => r,
        Err(e) => return unparseable(e.to_string()),
    };

    let mut rationale = raw.rationale;
    let action = match raw.action {
        Some(value) if !value.is_null() => match serde_json::from_value::<Action>(value) {
            Ok(action) => Some(match raw.description {
                Some(d) if !d.trim().is_empty() => PlannedAction::new(action, d),
                _ => PlannedAction::bare(action),
            }),
            Err(e) => {
                tracing::warn!(error = %e, "planner proposed an invalid action");
                rationale = format!("{} (invalid action: {})", rationale, e);
                None
            }
        },
        _ => None,
    };

    PlannerDecision {
        rationale,
        action,
        status: raw.status,
        confidence: raw.confidence.clamp(0.0, 1.0),
        facts: raw.facts,
        subgoals: raw.subgoals,
        completed_subgoals: raw.completed_subgoals,
    }
}

/// 用 LlmClient 实现 Planner
pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    fn render(&self, request: &PlanRequest) -> Vec<Message> {
        let mut user = format!("Goal: {}\n\n", request.goal);
        if !request.memory_summary.is_empty() {
            user.push_str(&request.memory_summary);
            user.push_str("\n\n");
        }
        if !request.targets_summary.is_empty() {
            user.push_str(&request.targets_summary);
            user.push('\n');
        }
        user.push_str("## Current context\n");
        user.push_str(&request.context.render(MAX_RENDERED_ELEMENTS));
        if !request.history.is_empty() {
            user.push_str("\n## Recent actions\n");
            for h in &request.history {
                let outcome = match (h.success, h.verified) {
                    (false, _) => "failed",
                    (true, Some(false)) => "unverified",
                    _ => "ok",
                };
                user.push_str(&format!("- {} [{}]", h.description, outcome));
                if let Some(ref note) = h.note {
                    user.push_str(&format!(": {}", note));
                }
                user.push('\n');
            }
        }
        user.push_str(&format!("\nStep: {}", request.step));
        vec![Message::system(self.system_prompt.clone()), Message::user(user)]
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(&self, request: &PlanRequest) -> Result<PlannerDecision, PlannerError> {
        let reply = self.llm.complete(&self.render(request)).await?;
        Ok(parse_decision(&reply))
    }

    fn name(&self) -> &str {
        self.llm.model()
    }
}

/// 限流 + 超时 + 退避 + 备用切换
pub struct PlannerGateway {
    primary: Arc<dyn Planner>,
    fallback: Option<Arc<dyn Planner>>,
    limiter: Arc<RateLimiter>,
    cfg: PlannerSection,
    timeout: Duration,
}

impl PlannerGateway {
    pub fn new(
        primary: Arc<dyn Planner>,
        fallback: Option<Arc<dyn Planner>>,
        limiter: Arc<RateLimiter>,
        cfg: PlannerSection,
        timeout_secs: u64,
    ) -> Self {
        Self {
            primary,
            fallback,
            limiter,
            cfg,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    fn backoff(&self, attempt: usize, err: &PlannerError) -> Duration {
        let exp = self
            .cfg
            .base_backoff_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.cfg.max_backoff_ms);
        let hinted = match err {
            PlannerError::RateLimited { retry_after_ms } => *retry_after_ms,
            _ => 0,
        };
        Duration::from_millis(exp.max(hinted))
    }

    pub async fn plan(&self, request: &PlanRequest) -> Result<PlannerDecision, PlannerError> {
        let mut consecutive_transient = 0usize;
        let mut last_err = PlannerError::Permanent("no planner attempt made".to_string());

        for attempt in 0..=self.cfg.max_retries {
            let planner = match &self.fallback {
                Some(fb) if consecutive_transient >= self.cfg.fallback_after.max(1) => fb,
                _ => &self.primary,
            };

            self.limiter.wait().await;
            let result = match tokio::time::timeout(self.timeout, planner.plan(request)).await {
                Ok(r) => r,
                Err(_) => Err(PlannerError::Timeout(self.timeout.as_secs())),
            };

            match result {
                Ok(decision) => {
                    if attempt > 0 {
                        tracing::info!(planner = planner.name(), attempt, "planner recovered");
                    }
                    return Ok(decision);
                }
                Err(e) if e.is_transient() => {
                    consecutive_transient += 1;
                    if attempt == self.cfg.max_retries {
                        last_err = e;
                        break;
                    }
                    let delay = self.backoff(attempt, &e);
                    tracing::warn!(
                        planner = planner.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient planner error, backing off"
                    );
                    last_err = e;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::error!(
                        planner = planner.name(),
                        error = %e,
                        "permanent planner error"
                    );
                    return Err(e);
                }
            }
        }
        Err(last_err)
    }
}
