//! 动作结果校验
//!
//! 对比执行前后的快照：地址是否变化、可交互元素签名的结构差异，按动作类型给出成功与否及置信度。
//! 置信度低于阈值的失败会附带重试建议（按失败原因匹配：仍在加载 → 等待；未找到 → 滚动；
//! 输入失败 → 先点输入框再输入；无变化 → 原样重试一次）。

use std::sync::OnceLock;

use regex::Regex;

use crate::actuator::{
    normalize_address, Action, ContextSnapshot, PlannedAction, ScrollDirection, StructuralDiff,
};
use crate::config::VerifierSection;
use crate::session::{SuggestedRetry, VerificationResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RetryHint {
    Wait,
    ClickThenType,
    Scroll,
    Repeat,
}

fn retry_patterns() -> &'static [(Regex, RetryHint)] {
    static PATTERNS: OnceLock<Vec<(Regex, RetryHint)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"(?i)loading", RetryHint::Wait),
            (r"(?i)\binput\b|focus", RetryHint::ClickThenType),
            (r"(?i)not found", RetryHint::Scroll),
            (r"(?i)no change", RetryHint::Repeat),
        ]
        .into_iter()
        .filter_map(|(pattern, hint)| match Regex::new(pattern) {
            Ok(re) => Some((re, hint)),
            Err(e) => {
                tracing::warn!(pattern, error = %e, "retry pattern failed to compile, skipping");
                None
            }
        })
        .collect()
    })
}

#[derive(Debug, Clone)]
pub struct Verifier {
    cfg: VerifierSection,
}

impl Verifier {
    pub fn new(cfg: VerifierSection) -> Self {
        Self { cfg }
    }

    pub fn is_exempt(&self, action: &Action) -> bool {
        self.cfg.exempt_kinds.contains(&action.kind())
    }

    /// 校验一个已执行的动作；rationale 是 Planner 给出的理由，只用于证据文本
    pub fn verify(
        &self,
        action: &Action,
        before: &ContextSnapshot,
        after: &ContextSnapshot,
        rationale: &str,
    ) -> VerificationResult {
        if self.is_exempt(action) {
            let evidence = format!("{} needs no verification", action.kind());
            return VerificationResult::passed(1.0, evidence);
        }

        let mut result = self.judge(action, before, after);
        if !rationale.is_empty() {
            result.evidence = format!("{} (intent: {})", result.evidence, rationale);
        }
        if !result.success && result.confidence < self.cfg.retry_confidence_threshold {
            result.suggested_retry = suggest_retry(action, result.failure_reason.as_deref(), after);
        }
        tracing::debug!(
            kind = %action.kind(),
            success = result.success,
            confidence = result.confidence,
            "verified action"
        );
        result
    }

    fn judge(
        &self,
        action: &Action,
        before: &ContextSnapshot,
        after: &ContextSnapshot,
    ) -> VerificationResult {
        let address_changed =
            normalize_address(&before.address) != normalize_address(&after.address);
        let diff = StructuralDiff::between(before, after);
        let target_switched = before.target_id != after.target_id;

        // 切换类动作在不同标签页之间比较；刷新不要求严格成功。两者都不看加载状态
        match action {
            Action::OpenTarget { .. } => {
                return if target_switched {
                    let evidence = format!("now on new target {}", after.target_id);
                    VerificationResult::passed(0.9, evidence)
                } else {
                    VerificationResult::failed(
                        0.3,
                        "new target not opened, no change in active target",
                        "same target",
                    )
                };
            }
            Action::SwitchTarget { target_id } => {
                return if &after.target_id == target_id {
                    VerificationResult::passed(0.95, format!("active target is {}", target_id))
                } else {
                    VerificationResult::failed(
                        0.3,
                        format!("target {} is not the active target", target_id),
                        format!("active is {}", after.target_id),
                    )
                };
            }
            Action::CloseTarget { target_id } => {
                let closing = target_id.as_ref().unwrap_or(&before.target_id);
                return if &after.target_id != closing {
                    VerificationResult::passed(0.9, format!("target {} closed", closing))
                } else {
                    VerificationResult::failed(
                        0.3,
                        "no change in active target after close",
                        "closed target still active",
                    )
                };
            }
            Action::Refresh => {
                let evidence = if after.loading {
                    "page refreshed, still loading"
                } else {
                    "page refreshed"
                };
                return VerificationResult::passed(0.8, evidence);
            }
            _ => {}
        }

        if after.loading {
            let evidence = format!("{} is loading", after.address);
            return VerificationResult::failed(0.4, "page still loading", evidence);
        }

        match action {
            Action::Click { element, .. } | Action::DoubleClick { element, .. } => {
                if let Some(label) = element {
                    if before.find_element(label).is_none() && after.find_element(label).is_none() {
                        return VerificationResult::failed(
                            0.3,
                            "target element not found",
                            format!("no element matching \"{}\"", label),
                        );
                    }
                }
                pointer_result(address_changed, &diff, before, after)
            }
            Action::Drag { .. } => pointer_result(address_changed, &diff, before, after),
            Action::Type { text, .. } => {
                let before_len = before
                    .focused_value
                    .as_deref()
                    .map_or(0, |v| v.chars().count());
                match after.focused_value.as_deref() {
                    Some(value) if value.contains(text.as_str()) => {
                        VerificationResult::passed(0.95, "focused field contains the typed text")
                    }
                    Some(value) if value.chars().count() > before_len => {
                        VerificationResult::passed(0.75, "focused field text grew")
                    }
                    Some(_) => VerificationResult::failed(
                        0.3,
                        "input text not applied",
                        "focused field unchanged",
                    ),
                    None => VerificationResult::failed(
                        0.2,
                        "input field not focused",
                        "no focused field",
                    ),
                }
            }
            Action::KeyPress { key } => match key.to_lowercase().as_str() {
                "enter" | "return" => {
                    if address_changed || diff.has_changes() {
                        VerificationResult::passed(0.9, change_evidence(address_changed, &diff))
                    } else {
                        VerificationResult::failed(
                            0.4,
                            "no change observed after enter",
                            "address and structure unchanged",
                        )
                    }
                }
                "escape" | "esc" => {
                    if diff.removed_any() {
                        let evidence = format!("dismissed {}", diff.removed.join(", "));
                        VerificationResult::passed(0.9, evidence)
                    } else {
                        VerificationResult::failed(
                            0.4,
                            "no change observed after escape",
                            "nothing dismissed",
                        )
                    }
                }
                _ => VerificationResult::passed(0.6, format!("key {} sent", key)),
            },
            Action::Scroll { .. } => {
                if diff.has_changes() {
                    VerificationResult::passed(0.9, change_evidence(address_changed, &diff))
                } else {
                    VerificationResult::passed(
                        0.6,
                        "no new content, possibly at the end of the page",
                    )
                }
            }
            Action::Navigate { url } => {
                if address_changed || normalize_address(url) == normalize_address(&after.address) {
                    VerificationResult::passed(0.95, format!("now at {}", after.address))
                } else {
                    address_unchanged(after)
                }
            }
            Action::NavigateBack | Action::NavigateForward => {
                if address_changed {
                    VerificationResult::passed(0.9, format!("now at {}", after.address))
                } else {
                    address_unchanged(after)
                }
            }
            Action::MouseMove { .. }
            | Action::Wait { .. }
            | Action::ExtractText { .. }
            | Action::Message { .. }
            | Action::Deliver { .. } => {
                VerificationResult::passed(0.7, "no observable effect expected")
            }
            Action::Refresh
            | Action::OpenTarget { .. }
            | Action::SwitchTarget { .. }
            | Action::CloseTarget { .. } => VerificationResult::passed(0.5, "target action"),
        }
    }
}

fn address_unchanged(after: &ContextSnapshot) -> VerificationResult {
    VerificationResult::failed(
        0.3,
        "no change in address",
        format!("still at {}", after.address),
    )
}

fn pointer_result(
    address_changed: bool,
    diff: &StructuralDiff,
    before: &ContextSnapshot,
    after: &ContextSnapshot,
) -> VerificationResult {
    if address_changed || diff.has_changes() {
        let confidence = if address_changed { 0.95 } else { 0.85 };
        VerificationResult::passed(confidence, change_evidence(address_changed, diff))
    } else if before.focused_value.is_none() && after.focused_value.is_some() {
        VerificationResult::passed(0.8, "an input field gained focus")
    } else {
        VerificationResult::failed(0.4, "no change observed", "address and structure unchanged")
    }
}

fn change_evidence(address_changed: bool, diff: &StructuralDiff) -> String {
    let mut parts = Vec::new();
    if address_changed {
        parts.push("address changed".to_string());
    }
    if !diff.added.is_empty() {
        parts.push(format!("{} element(s) appeared", diff.added.len()));
    }
    if !diff.removed.is_empty() {
        parts.push(format!("{} element(s) disappeared", diff.removed.len()));
    }
    parts.join(", ")
}

fn suggest_retry(
    action: &Action,
    reason: Option<&str>,
    after: &ContextSnapshot,
) -> Option<SuggestedRetry> {
    let reason = reason?;
    let hint = retry_patterns()
        .iter()
        .find(|(re, _)| re.is_match(reason))
        .map(|(_, hint)| *hint)?;

    let (actions, confidence) = match hint {
        RetryHint::Wait => (
            vec![PlannedAction::new(
                Action::Wait { ms: 1_500 },
                "wait for the page to finish loading",
            )],
            0.7,
        ),
        RetryHint::ClickThenType => {
            let Action::Type { text, element } = action else {
                return None;
            };
            let input = after.find_input(element.as_deref())?;
            let (x, y) = input.center.unwrap_or((0, 0));
            (
                vec![
                    PlannedAction::new(
                        Action::Click { x, y, element: Some(input.text.clone()) },
                        format!("focus \"{}\"", input.text),
                    ),
                    PlannedAction::new(
                        Action::Type { text: text.clone(), element: element.clone() },
                        "type again",
                    ),
                ],
                0.6,
            )
        }
        RetryHint::Scroll => (
            vec![PlannedAction::new(
                Action::Scroll { direction: ScrollDirection::Down, amount: 300 },
                "scroll to find the element",
            )],
            0.5,
        ),
        RetryHint::Repeat => (
            vec![PlannedAction::new(action.clone(), format!("retry: {}", action.label()))],
            0.5,
        ),
    };
    Some(SuggestedRetry { actions, confidence })
}
