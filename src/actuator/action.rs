//! 动作模型：每种动作一个变体，各自携带参数
//!
//! Verifier 与 Actuator 都对 Action 做穷尽匹配；ActionKind 是不带参数的判别值，用于计数、配置与错误文案。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::actuator::TargetId;

/// 动作类型（不带参数）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    MouseMove,
    Click,
    DoubleClick,
    Drag,
    KeyPress,
    Type,
    Scroll,
    Wait,
    Navigate,
    NavigateBack,
    NavigateForward,
    Refresh,
    OpenTarget,
    CloseTarget,
    SwitchTarget,
    ExtractText,
    Message,
    Deliver,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::MouseMove => "mouse_move",
            ActionKind::Click => "click",
            ActionKind::DoubleClick => "double_click",
            ActionKind::Drag => "drag",
            ActionKind::KeyPress => "key_press",
            ActionKind::Type => "type",
            ActionKind::Scroll => "scroll",
            ActionKind::Wait => "wait",
            ActionKind::Navigate => "navigate",
            ActionKind::NavigateBack => "navigate_back",
            ActionKind::NavigateForward => "navigate_forward",
            ActionKind::Refresh => "refresh",
            ActionKind::OpenTarget => "open_target",
            ActionKind::CloseTarget => "close_target",
            ActionKind::SwitchTarget => "switch_target",
            ActionKind::ExtractText => "extract_text",
            ActionKind::Message => "message",
            ActionKind::Deliver => "deliver",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

fn default_scroll_amount() -> i32 {
    300
}

/// 单个可执行动作（JSON 形如 {"type": "click", "x": 10, "y": 20}）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    MouseMove {
        x: i32,
        y: i32,
    },
    Click {
        x: i32,
        y: i32,
        /// 期望点中的元素文本（可选，用于校验与「未找到」判定）
        #[serde(default)]
        element: Option<String>,
    },
    DoubleClick {
        x: i32,
        y: i32,
        #[serde(default)]
        element: Option<String>,
    },
    Drag {
        from: Point,
        to: Point,
    },
    KeyPress {
        key: String,
    },
    Type {
        text: String,
        #[serde(default)]
        element: Option<String>,
    },
    Scroll {
        direction: ScrollDirection,
        #[serde(default = "default_scroll_amount")]
        amount: i32,
    },
    Wait {
        ms: u64,
    },
    Navigate {
        url: String,
    },
    NavigateBack,
    NavigateForward,
    Refresh,
    OpenTarget {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        purpose: Option<String>,
    },
    CloseTarget {
        /// 缺省为当前标签页
        #[serde(default)]
        target_id: Option<TargetId>,
    },
    SwitchTarget {
        target_id: TargetId,
    },
    ExtractText {
        key: String,
        #[serde(default)]
        element: Option<String>,
    },
    Message {
        text: String,
    },
    Deliver {
        filename: String,
        #[serde(default)]
        format: String,
        content: String,
    },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::MouseMove { .. } => ActionKind::MouseMove,
            Action::Click { .. } => ActionKind::Click,
            Action::DoubleClick { .. } => ActionKind::DoubleClick,
            Action::Drag { .. } => ActionKind::Drag,
            Action::KeyPress { .. } => ActionKind::KeyPress,
            Action::Type { .. } => ActionKind::Type,
            Action::Scroll { .. } => ActionKind::Scroll,
            Action::Wait { .. } => ActionKind::Wait,
            Action::Navigate { .. } => ActionKind::Navigate,
            Action::NavigateBack => ActionKind::NavigateBack,
            Action::NavigateForward => ActionKind::NavigateForward,
            Action::Refresh => ActionKind::Refresh,
            Action::OpenTarget { .. } => ActionKind::OpenTarget,
            Action::CloseTarget { .. } => ActionKind::CloseTarget,
            Action::SwitchTarget { .. } => ActionKind::SwitchTarget,
            Action::ExtractText { .. } => ActionKind::ExtractText,
            Action::Message { .. } => ActionKind::Message,
            Action::Deliver { .. } => ActionKind::Deliver,
        }
    }

    /// 会产出交付物的动作：Planner 报 done 时若附带此类动作需先执行
    pub fn is_delivery(&self) -> bool {
        matches!(self, Action::Deliver { .. })
    }

    /// 简短的人类可读描述（Planner 未给描述时使用）
    pub fn label(&self) -> String {
        match self {
            Action::MouseMove { x, y } => format!("move pointer to ({x}, {y})"),
            Action::Click { x, y, element } | Action::DoubleClick { x, y, element } => {
                let verb = if self.kind() == ActionKind::Click { "click" } else { "double-click" };
                match element {
                    Some(e) => format!("{verb} \"{e}\""),
                    None => format!("{verb} at ({x}, {y})"),
                }
            }
            Action::Drag { from, to } => {
                format!("drag ({}, {}) -> ({}, {})", from.x, from.y, to.x, to.y)
            }
            Action::KeyPress { key } => format!("press {key}"),
            Action::Type { text, .. } => format!("type \"{}\"", preview(text, 40)),
            Action::Scroll { direction, amount } => format!("scroll {direction:?} by {amount}"),
            Action::Wait { ms } => format!("wait {ms}ms"),
            Action::Navigate { url } => format!("navigate to {url}"),
            Action::NavigateBack => "navigate back".to_string(),
            Action::NavigateForward => "navigate forward".to_string(),
            Action::Refresh => "refresh".to_string(),
            Action::OpenTarget { url, .. } => match url {
                Some(u) => format!("open new target at {u}"),
                None => "open new target".to_string(),
            },
            Action::CloseTarget { target_id } => match target_id {
                Some(id) => format!("close target {id}"),
                None => "close current target".to_string(),
            },
            Action::SwitchTarget { target_id } => format!("switch to target {target_id}"),
            Action::ExtractText { key, .. } => format!("extract \"{key}\""),
            Action::Message { text } => format!("message: {}", preview(text, 40)),
            Action::Deliver { filename, .. } => format!("deliver {filename}"),
        }
    }
}

/// Planner 规划出的动作：动作本身 + 人类可读说明
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlannedAction {
    pub action: Action,
    #[serde(default)]
    pub description: String,
}

impl PlannedAction {
    pub fn new(action: Action, description: impl Into<String>) -> Self {
        Self {
            action,
            description: description.into(),
        }
    }

    /// 用动作自身的 label 作为描述
    pub fn bare(action: Action) -> Self {
        let description = action.label();
        Self { action, description }
    }

    pub fn kind(&self) -> ActionKind {
        self.action.kind()
    }
}

pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    } else {
        text.to_string()
    }
}
