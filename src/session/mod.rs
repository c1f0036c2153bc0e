//! 会话数据模型：Session、ActionRecord、VerificationResult
//!
//! Session 由 Orchestrator 独占并逐轮修改；ActionRecord 追加后只允许补写一次 VerificationResult。
//! 前后快照只保留最近 `context_retention` 条记录，更早的记录在追加时被裁剪。

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::actuator::{Action, ActionKind, ContextSnapshot, PlannedAction, TargetId};

/// 会话状态机：planning → executing → verifying → (planning | completed | error)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Planning,
    Executing,
    Verifying,
    Completed,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Planning => "planning",
            SessionStatus::Executing => "executing",
            SessionStatus::Verifying => "verifying",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 校验给出的重试建议
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SuggestedRetry {
    pub actions: Vec<PlannedAction>,
    pub confidence: f64,
}

/// Verifier 的结论，每条 ActionRecord 至多一个
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub success: bool,
    pub confidence: f64,
    pub evidence: String,
    pub failure_reason: Option<String>,
    pub suggested_retry: Option<SuggestedRetry>,
}

impl VerificationResult {
    pub fn passed(confidence: f64, evidence: impl Into<String>) -> Self {
        Self {
            success: true,
            confidence: confidence.clamp(0.0, 1.0),
            evidence: evidence.into(),
            failure_reason: None,
            suggested_retry: None,
        }
    }

    pub fn failed(confidence: f64, reason: impl Into<String>, evidence: impl Into<String>) -> Self {
        Self {
            success: false,
            confidence: confidence.clamp(0.0, 1.0),
            evidence: evidence.into(),
            failure_reason: Some(reason.into()),
            suggested_retry: None,
        }
    }
}

/// 动作的来源
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOrigin {
    Planner,
    VerificationRetry,
    Recovery,
}

/// 单次动作尝试的记录
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub planned: PlannedAction,
    /// 实际分派给 Actuator 的动作；分派前失败时为空
    pub executed: Option<Action>,
    pub target_id: TargetId,
    pub before: Option<ContextSnapshot>,
    pub after: Option<ContextSnapshot>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub verification: Option<VerificationResult>,
    pub origin: ActionOrigin,
}

impl ActionRecord {
    pub fn kind(&self) -> ActionKind {
        self.planned.kind()
    }

    /// 补写校验结论；已有结论时忽略
    pub fn attach_verification(&mut self, result: VerificationResult) -> bool {
        if self.verification.is_some() {
            return false;
        }
        self.verification = Some(result);
        true
    }

    /// 已校验且失败
    pub fn failed_verification(&self) -> bool {
        self.verification.as_ref().is_some_and(|v| !v.success)
    }
}

/// 一次会话
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub goal: String,
    pub status: SessionStatus,
    pub actions: Vec<ActionRecord>,
    pub current_context: Option<ContextSnapshot>,
    pub primary_target: Option<TargetId>,
    pub agent_targets: BTreeSet<TargetId>,
    /// error 状态的原因 / completed 状态的总结
    pub outcome_note: Option<String>,
}

impl Session {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            goal: goal.into(),
            status: SessionStatus::Planning,
            actions: Vec::new(),
            current_context: None,
            primary_target: None,
            agent_targets: BTreeSet::new(),
            outcome_note: None,
        }
    }

    /// 追加一条记录，并只让最近 retention 条保留快照
    pub fn push_record(&mut self, record: ActionRecord, retention: usize) {
        self.actions.push(record);
        let keep_from = self.actions.len().saturating_sub(retention);
        for r in &mut self.actions[..keep_from] {
            r.before = None;
            r.after = None;
        }
    }

    pub fn last_record_mut(&mut self) -> Option<&mut ActionRecord> {
        self.actions.last_mut()
    }

    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    /// 最近 n 条记录（时间顺序）
    pub fn recent(&self, n: usize) -> &[ActionRecord] {
        let start = self.actions.len().saturating_sub(n);
        &self.actions[start..]
    }

    /// 进入终态并写下原因或总结
    pub fn finish(&mut self, status: SessionStatus, note: impl Into<String>) {
        self.status = status;
        self.outcome_note = Some(note.into());
    }

    /// 目标被关闭后清理引用；主目标被关闭时改由 successor（通常是新的活动标签页）接替
    pub fn forget_target(&mut self, target: &TargetId, successor: Option<&TargetId>) {
        self.agent_targets.remove(target);
        if self.primary_target.as_ref() == Some(target) {
            self.primary_target = successor.filter(|s| *s != target).cloned();
        }
        if self.current_context.as_ref().is_some_and(|c| &c.target_id == target) {
            self.current_context = None;
        }
    }
}

/// 会话结束后交给调用方的结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub session_id: Uuid,
    pub status: SessionStatus,
    /// completed 时是总结，error 时是具体原因
    pub message: String,
    pub actions: usize,
}
