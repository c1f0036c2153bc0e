//! 上下文快照：某个标签页当前可观察的状态
//!
//! 地址、标题、可交互元素签名（角色 + 文本 + 中心点）、焦点输入框内容、加载状态。
//! Verifier 用前后快照的差异判断动作是否生效，RecoveryManager 用粗粒度结构哈希判断是否有进展。

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 执行上下文（标签页）标识
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TargetId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// 可交互元素签名
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementSignature {
    pub role: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub center: Option<(i32, i32)>,
}

/// 结构哈希只取文本前若干字符，避免计数器、时间戳等细小变化被当成进展
const COARSE_TEXT_CHARS: usize = 24;

impl ElementSignature {
    pub fn new(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            text: text.into(),
            center: None,
        }
    }

    pub fn at(mut self, x: i32, y: i32) -> Self {
        self.center = Some((x, y));
        self
    }

    /// 用于结构 diff 的键：小写角色 + 规整后的文本
    pub fn key(&self) -> String {
        format!(
            "{}|{}",
            self.role.trim().to_lowercase(),
            self.text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
        )
    }

    pub fn is_input(&self) -> bool {
        matches!(
            self.role.trim().to_lowercase().as_str(),
            "textbox" | "searchbox" | "combobox" | "input" | "textarea" | "spinbutton"
        )
    }

    fn matches_label(&self, label: &str) -> bool {
        let label = label.trim().to_lowercase();
        !label.is_empty() && self.text.to_lowercase().contains(&label)
    }
}

/// ContextProvider.capture 的结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub target_id: TargetId,
    pub address: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub elements: Vec<ElementSignature>,
    /// 焦点输入框当前内容
    #[serde(default)]
    pub focused_value: Option<String>,
    #[serde(default)]
    pub loading: bool,
    /// 截图等视觉快照的不透明引用（由外部生成与压缩）
    #[serde(default)]
    pub visual_ref: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl ContextSnapshot {
    pub fn new(target_id: TargetId, address: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            target_id,
            address: address.into(),
            title: title.into(),
            elements: Vec::new(),
            focused_value: None,
            loading: false,
            visual_ref: None,
            captured_at: Utc::now(),
        }
    }

    pub fn with_elements(mut self, elements: Vec<ElementSignature>) -> Self {
        self.elements = elements;
        self
    }

    pub fn with_focused_value(mut self, value: impl Into<String>) -> Self {
        self.focused_value = Some(value.into());
        self
    }

    /// 元素键 -> 出现次数
    pub fn element_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for e in &self.elements {
            *counts.entry(e.key()).or_insert(0) += 1;
        }
        counts
    }

    /// 粗粒度结构哈希：角色 + 截断文本的有序多重集合
    pub fn structural_hash(&self) -> u64 {
        let mut coarse: Vec<String> = self
            .elements
            .iter()
            .map(|e| {
                let text: String = e.text.to_lowercase().chars().take(COARSE_TEXT_CHARS).collect();
                format!("{}|{}", e.role.to_lowercase(), text)
            })
            .collect();
        coarse.sort();
        let mut hasher = DefaultHasher::new();
        coarse.hash(&mut hasher);
        hasher.finish()
    }

    /// 按文本（不区分大小写、子串）查找元素
    pub fn find_element(&self, label: &str) -> Option<&ElementSignature> {
        self.elements.iter().find(|e| e.matches_label(label))
    }

    /// 查找输入框：优先匹配 label，否则取第一个输入类元素
    pub fn find_input(&self, label: Option<&str>) -> Option<&ElementSignature> {
        if let Some(label) = label {
            if let Some(e) = self
                .elements
                .iter()
                .find(|e| e.is_input() && e.matches_label(label))
            {
                return Some(e);
            }
        }
        self.elements.iter().find(|e| e.is_input())
    }

    /// 渲染给 Planner 的文本（元素数量受限）
    pub fn render(&self, max_elements: usize) -> String {
        let mut s = format!(
            "Target: {}\nAddress: {}\nTitle: {}\n",
            self.target_id, self.address, self.title
        );
        if self.loading {
            s.push_str("State: loading\n");
        }
        if let Some(ref v) = self.focused_value {
            s.push_str(&format!("Focused field: \"{}\"\n", v));
        }
        if !self.elements.is_empty() {
            s.push_str("Elements:\n");
            for e in self.elements.iter().take(max_elements) {
                match e.center {
                    Some((x, y)) => {
                        s.push_str(&format!("- {} \"{}\" @({}, {})\n", e.role, e.text, x, y))
                    }
                    None => s.push_str(&format!("- {} \"{}\"\n", e.role, e.text)),
                }
            }
            if self.elements.len() > max_elements {
                s.push_str(&format!("- ... {} more\n", self.elements.len() - max_elements));
            }
        }
        s
    }
}

/// 前后快照的结构差异
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StructuralDiff {
    /// 新出现（或数量增加）的元素键
    pub added: Vec<String>,
    /// 消失（或数量减少）的元素键
    pub removed: Vec<String>,
}

impl StructuralDiff {
    pub fn between(before: &ContextSnapshot, after: &ContextSnapshot) -> Self {
        let b = before.element_counts();
        let a = after.element_counts();
        let mut diff = StructuralDiff::default();
        for (key, &after_count) in &a {
            let before_count = b.get(key).copied().unwrap_or(0);
            if after_count > before_count {
                diff.added.push(key.clone());
            }
        }
        for (key, &before_count) in &b {
            let after_count = a.get(key).copied().unwrap_or(0);
            if before_count > after_count {
                diff.removed.push(key.clone());
            }
        }
        diff
    }

    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    pub fn removed_any(&self) -> bool {
        !self.removed.is_empty()
    }
}

/// 地址比较前的规整：去掉片段与末尾斜杠
pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim();
    let without_fragment = trimmed.split('#').next().unwrap_or(trimmed);
    without_fragment.trim_end_matches('/').to_lowercase()
}

/// 提取逻辑来源（scheme://host[:port]），非 URL 时取首段
pub fn origin_of(address: &str) -> String {
    let address = address.trim();
    if let Some(idx) = address.find("://") {
        let scheme = &address[..idx];
        let rest = &address[idx + 3..];
        let host = rest.split(['/', '?', '#']).next().unwrap_or(rest);
        format!("{}://{}", scheme.to_lowercase(), host.to_lowercase())
    } else {
        address
            .split(['/', '?', '#'])
            .next()
            .unwrap_or(address)
            .to_lowercase()
    }
}
