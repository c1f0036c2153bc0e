//! 卡死检测与恢复
//!
//! 维护三个计数：连续执行失败、距上次进展的动作数、本会话恢复次数。
//! check_stuck_state 依次检查重复失败、无进展、校验死循环；suggest_recovery 按恢复次数逐级升级，
//! 超过上限后返回 Abort。地址或粗粒度结构哈希变化即视为进展，进展会清零无进展计数与恢复次数。
//! 重复失败要求连续失败计数与记录尾部同时成立，成功一次即清零。

use std::fmt;

use crate::actuator::{
    normalize_address, Action, ContextSnapshot, PlannedAction, ScrollDirection, TargetId,
};
use crate::config::RecoverySection;
use crate::session::ActionRecord;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StuckReason {
    RepeatedFailure,
    NoProgress,
    VerificationLoop,
}

impl fmt::Display for StuckReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StuckReason::RepeatedFailure => "repeated_failure",
            StuckReason::NoProgress => "no_progress",
            StuckReason::VerificationLoop => "verification_loop",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StuckState {
    pub reason: StuckReason,
    pub severity: Severity,
    pub detail: String,
}

/// 恢复策略
#[derive(Clone, Debug, PartialEq)]
pub enum RecoveryStrategy {
    /// 执行一组动作后继续
    Perform { actions: Vec<PlannedAction>, note: String },
    /// 关闭有问题的标签页，切到另一个
    FallbackTarget { close: TargetId, switch_to: TargetId },
    /// 放弃会话
    Abort { reason: String },
}

#[derive(Debug)]
pub struct RecoveryManager {
    cfg: RecoverySection,
    consecutive_failures: usize,
    actions_since_progress: usize,
    recovery_attempts: usize,
    last_address: Option<String>,
    last_hash: Option<u64>,
    /// 上次应用恢复时的记录数，之前的记录不再参与判定
    checkpoint: usize,
}

impl RecoveryManager {
    pub fn new(cfg: RecoverySection) -> Self {
        Self {
            cfg,
            consecutive_failures: 0,
            actions_since_progress: 0,
            recovery_attempts: 0,
            last_address: None,
            last_hash: None,
            checkpoint: 0,
        }
    }

    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures
    }

    pub fn actions_since_progress(&self) -> usize {
        self.actions_since_progress
    }

    pub fn recovery_attempts(&self) -> usize {
        self.recovery_attempts
    }

    /// 记录一次动作结果；地址或结构哈希变化即视为进展。
    /// 执行失败时没有执行后快照，只计失败次数
    pub fn record_action_result(&mut self, success: bool, context: Option<&ContextSnapshot>) {
        if success {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
        let Some(context) = context else {
            return;
        };

        let address = normalize_address(&context.address);
        let hash = context.structural_hash();
        let progressed = match (&self.last_address, self.last_hash) {
            (Some(a), Some(h)) => *a != address || h != hash,
            // 第一次观察只建立基线
            _ => {
                self.actions_since_progress = 0;
                self.last_address = Some(address);
                self.last_hash = Some(hash);
                return;
            }
        };

        if progressed {
            if self.recovery_attempts > 0 {
                tracing::info!(
                    attempts = self.recovery_attempts,
                    "progress observed, recovery counters reset"
                );
            }
            self.actions_since_progress = 0;
            self.recovery_attempts = 0;
            self.last_address = Some(address);
            self.last_hash = Some(hash);
        } else {
            self.actions_since_progress += 1;
        }
    }

    /// 按顺序检查：重复失败 → 无进展 → 校验死循环
    pub fn check_stuck_state(
        &self,
        records: &[ActionRecord],
        context: &ContextSnapshot,
    ) -> Option<StuckState> {
        let recent = &records[self.checkpoint.min(records.len())..];

        let n = self.cfg.repeated_failure_threshold.max(1);
        if self.consecutive_failures >= n && recent.len() >= n {
            let tail = &recent[recent.len() - n..];
            let kind = tail[0].kind();
            if tail.iter().all(|r| !r.success && r.kind() == kind) {
                let last_error = tail
                    .last()
                    .and_then(|r| r.error.clone())
                    .unwrap_or_default();
                return Some(StuckState {
                    reason: StuckReason::RepeatedFailure,
                    severity: Severity::High,
                    detail: format!("last {} {} actions failed: {}", n, kind, last_error),
                });
            }
        }

        if self.actions_since_progress >= self.cfg.no_progress_threshold.max(1) {
            return Some(StuckState {
                reason: StuckReason::NoProgress,
                severity: Severity::Medium,
                detail: format!(
                    "no change at {} for {} actions",
                    context.address, self.actions_since_progress
                ),
            });
        }

        let verified: Vec<&ActionRecord> = recent
            .iter()
            .rev()
            .filter(|r| r.verification.is_some())
            .take(self.cfg.verification_loop_window)
            .collect();
        let failed = verified.iter().filter(|r| r.failed_verification()).count();
        if failed >= self.cfg.verification_loop_threshold.max(1) {
            return Some(StuckState {
                reason: StuckReason::VerificationLoop,
                severity: if failed == verified.len() {
                    Severity::High
                } else {
                    Severity::Low
                },
                detail: format!(
                    "{} of the last {} verified actions failed",
                    failed,
                    verified.len()
                ),
            });
        }
        None
    }

    /// 给出恢复策略，随调用次数逐级升级；超过上限返回 Abort
    pub fn suggest_recovery(
        &mut self,
        stuck: &StuckState,
        context: &ContextSnapshot,
        alternate: Option<&TargetId>,
    ) -> RecoveryStrategy {
        self.recovery_attempts += 1;
        let attempt = self.recovery_attempts;
        if attempt > self.cfg.max_recovery_attempts {
            return RecoveryStrategy::Abort {
                reason: format!(
                    "{}: {} (gave up after {} recovery attempts)",
                    stuck.reason, stuck.detail, self.cfg.max_recovery_attempts
                ),
            };
        }
        tracing::warn!(
            reason = %stuck.reason,
            attempt,
            detail = %stuck.detail,
            "stuck state, recovering"
        );

        let scroll = || {
            perform(
                Action::Scroll { direction: ScrollDirection::Down, amount: 500 },
                "scroll to reveal more content",
            )
        };
        let refresh = || perform(Action::Refresh, "refresh the page");
        let last_resort = || match alternate {
            Some(alt) if *alt != context.target_id => RecoveryStrategy::FallbackTarget {
                close: context.target_id.clone(),
                switch_to: alt.clone(),
            },
            _ => perform(Action::NavigateBack, "go back to the previous page"),
        };

        match (stuck.reason, attempt) {
            (StuckReason::VerificationLoop, 1) => {
                perform(Action::Wait { ms: 2_000 }, "wait for the page to settle")
            }
            (StuckReason::VerificationLoop, 2) => scroll(),
            (StuckReason::VerificationLoop, _) => refresh(),
            (_, 1) => scroll(),
            (_, 2) => refresh(),
            _ => last_resort(),
        }
    }

    /// 恢复动作已执行并记录，之前的记录不再参与判定
    pub fn applied(&mut self, action_count: usize) {
        self.checkpoint = action_count;
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.cfg.clone());
    }
}

fn perform(action: Action, note: &str) -> RecoveryStrategy {
    RecoveryStrategy::Perform {
        actions: vec![PlannedAction::new(action, note)],
        note: note.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::actuator::ElementSignature;
    use crate::session::{ActionOrigin, VerificationResult};

    fn ctx(address: &str) -> ContextSnapshot {
        ContextSnapshot::new("t1".into(), address, "")
    }

    fn record(action: Action, success: bool) -> ActionRecord {
        ActionRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            planned: PlannedAction::bare(action.clone()),
            executed: success.then_some(action),
            target_id: "t1".into(),
            before: None,
            after: None,
            success,
            error: (!success).then(|| "element detached".to_string()),
            duration_ms: 1,
            verification: None,
            origin: ActionOrigin::Planner,
        }
    }

    fn click() -> Action {
        Action::Click { x: 1, y: 1, element: None }
    }

    #[test]
    fn test_repeated_failure_detected() {
        let mut rm = RecoveryManager::new(RecoverySection::default());
        let c = ctx("https://a.example");
        let mut records = vec![record(click(), false), record(click(), false)];
        rm.record_action_result(false, None);
        rm.record_action_result(false, None);
        assert!(rm.check_stuck_state(&records, &c).is_none());

        records.push(record(click(), false));
        rm.record_action_result(false, None);
        assert_eq!(rm.consecutive_failures(), 3);
        let stuck = rm.check_stuck_state(&records, &c).unwrap();
        assert_eq!(stuck.reason, StuckReason::RepeatedFailure);
        assert_eq!(stuck.reason.to_string(), "repeated_failure");

        // 类型不同不算
        let mixed = vec![
            record(click(), false),
            record(Action::Refresh, false),
            record(click(), false),
        ];
        assert!(rm.check_stuck_state(&mixed, &c).is_none());
    }

    #[test]
    fn test_success_clears_failure_streak() {
        let mut rm = RecoveryManager::new(RecoverySection::default());
        let c = ctx("https://a.example");
        for _ in 0..3 {
            rm.record_action_result(false, None);
        }
        rm.record_action_result(true, Some(&c));
        assert_eq!(rm.consecutive_failures(), 0);

        // 记录尾部仍是三次失败，但失败链已被成功打断
        let records = vec![record(click(), false), record(click(), false), record(click(), false)];
        assert!(rm.check_stuck_state(&records, &c).is_none());
    }

    #[test]
    fn test_no_progress_and_reset_on_change() {
        let mut rm = RecoveryManager::new(RecoverySection::default());
        let same = ctx("https://a.example/list");
        for _ in 0..6 {
            rm.record_action_result(true, Some(&same));
        }
        assert_eq!(rm.actions_since_progress(), 5);
        let stuck = rm.check_stuck_state(&[], &same).unwrap();
        assert_eq!(stuck.reason, StuckReason::NoProgress);

        let strategy = rm.suggest_recovery(&stuck, &same, None);
        assert!(matches!(strategy, RecoveryStrategy::Perform { .. }));
        assert_eq!(rm.recovery_attempts(), 1);

        let changed = ctx("https://a.example/list")
            .with_elements(vec![ElementSignature::new("button", "Next")]);
        rm.record_action_result(true, Some(&changed));
        assert_eq!(rm.actions_since_progress(), 0);
        assert_eq!(rm.recovery_attempts(), 0);
    }

    #[test]
    fn test_escalation_then_abort() {
        let mut rm = RecoveryManager::new(RecoverySection::default());
        let c = ctx("https://a.example");
        let stuck = StuckState {
            reason: StuckReason::NoProgress,
            severity: Severity::Medium,
            detail: "no change".into(),
        };
        let alt = TargetId::new("t2");

        let first = rm.suggest_recovery(&stuck, &c, Some(&alt));
        let RecoveryStrategy::Perform { actions, .. } = first else {
            panic!("expected scroll")
        };
        assert!(matches!(actions[0].action, Action::Scroll { .. }));

        let second = rm.suggest_recovery(&stuck, &c, Some(&alt));
        let RecoveryStrategy::Perform { actions, .. } = second else {
            panic!("expected refresh")
        };
        assert_eq!(actions[0].action, Action::Refresh);

        assert_eq!(
            rm.suggest_recovery(&stuck, &c, Some(&alt)),
            RecoveryStrategy::FallbackTarget { close: "t1".into(), switch_to: alt.clone() }
        );
        let last = rm.suggest_recovery(&stuck, &c, Some(&alt));
        assert!(matches!(last, RecoveryStrategy::Abort { .. }));
    }

    #[test]
    fn test_navigate_back_without_alternate() {
        let mut rm = RecoveryManager::new(RecoverySection::default());
        let c = ctx("https://a.example");
        let stuck = StuckState {
            reason: StuckReason::RepeatedFailure,
            severity: Severity::High,
            detail: String::new(),
        };
        rm.suggest_recovery(&stuck, &c, None);
        rm.suggest_recovery(&stuck, &c, None);
        let RecoveryStrategy::Perform { actions, .. } = rm.suggest_recovery(&stuck, &c, None) else {
            panic!("expected navigate back")
        };
        assert_eq!(actions[0].action, Action::NavigateBack);
    }

    #[test]
    fn test_verification_loop_and_checkpoint() {
        let mut rm = RecoveryManager::new(RecoverySection::default());
        let c = ctx("https://a.example");
        let mut records: Vec<ActionRecord> = (0..3)
            .map(|_| {
                let mut r = record(click(), true);
                r.verification = Some(VerificationResult::failed(0.3, "no change observed", ""));
                r
            })
            .collect();
        let stuck = rm.check_stuck_state(&records, &c).unwrap();
        assert_eq!(stuck.reason, StuckReason::VerificationLoop);
        let RecoveryStrategy::Perform { actions, .. } = rm.suggest_recovery(&stuck, &c, None) else {
            panic!("expected wait")
        };
        assert!(matches!(actions[0].action, Action::Wait { .. }));

        records.push(record(Action::Wait { ms: 2_000 }, true));
        rm.applied(records.len());
        assert!(rm.check_stuck_state(&records, &c).is_none());
    }
}
