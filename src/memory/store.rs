//! 会话记忆：目标树、事实表、访问记录、失败策略
//!
//! - 目标树：唯一根节点是主目标，子目标挂在根或指定父节点下；超出容量时先淘汰最早完成的非根目标。
//! - 事实表：键唯一，新值仅在置信度不低于已存值时替换（同键置信度单调不减）；溢出时淘汰置信度最低的事实。
//! - 访问记录与失败记录：有界，先进先出。
//! - summarize_for_prompt 输出给 Planner 的有界摘要，长度与会话长度无关。

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::actuator::TargetId;
use crate::config::MemorySection;

pub type GoalId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl GoalStatus {
    fn marker(&self) -> &'static str {
        match self {
            GoalStatus::Pending => "[ ]",
            GoalStatus::InProgress => "[~]",
            GoalStatus::Completed => "[x]",
            GoalStatus::Failed => "[!]",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GoalNode {
    pub id: GoalId,
    pub description: String,
    pub status: GoalStatus,
    pub parent: Option<GoalId>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// 事实来源
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FactSource {
    pub source: String,
    pub target_id: Option<TargetId>,
    pub domain: Option<String>,
}

impl FactSource {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }

    pub fn from_target(mut self, target: TargetId, domain: Option<String>) -> Self {
        self.target_id = Some(target);
        self.domain = domain;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub key: String,
    pub value: String,
    pub provenance: FactSource,
    pub timestamp: DateTime<Utc>,
    pub confidence: f64,
}

/// add_fact 的结果
#[derive(Clone, Debug, PartialEq)]
pub enum FactUpdate {
    Inserted,
    Replaced { previous: String },
    /// 新值置信度低于已存值，未写入
    Rejected { stored_confidence: f64 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailedStrategy {
    pub description: String,
    pub reason: String,
    pub context: String,
    pub timestamp: DateTime<Utc>,
}

/// 会话记忆
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryStore {
    limits: MemorySection,
    goals: BTreeMap<GoalId, GoalNode>,
    root: Option<GoalId>,
    next_goal: GoalId,
    facts: BTreeMap<String, Fact>,
    visited: VecDeque<TargetId>,
    failures: VecDeque<FailedStrategy>,
}

impl MemoryStore {
    pub fn new(limits: MemorySection) -> Self {
        Self {
            limits,
            goals: BTreeMap::new(),
            root: None,
            next_goal: 1,
            facts: BTreeMap::new(),
            visited: VecDeque::new(),
            failures: VecDeque::new(),
        }
    }

    /// 设定主目标（根节点）；已有根时替换整棵树
    pub fn set_primary_goal(&mut self, description: impl Into<String>) -> GoalId {
        self.goals.clear();
        let id = self.alloc_goal_id();
        self.goals.insert(
            id,
            GoalNode {
                id,
                description: description.into(),
                status: GoalStatus::InProgress,
                parent: None,
                created_at: Utc::now(),
                finished_at: None,
            },
        );
        self.root = Some(id);
        id
    }

    pub fn primary_goal(&self) -> Option<&GoalNode> {
        self.root.and_then(|id| self.goals.get(&id))
    }

    /// 新增子目标；父节点缺失或不存在时挂到根下（没有根时成为根）
    pub fn add_goal(&mut self, description: impl Into<String>, parent: Option<GoalId>) -> GoalId {
        let Some(root) = self.root else {
            return self.set_primary_goal(description);
        };
        while self.goals.len() >= self.limits.max_goals.max(1) {
            if !self.evict_goal() {
                break;
            }
        }
        let parent = parent.filter(|p| self.goals.contains_key(p)).unwrap_or(root);
        let id = self.alloc_goal_id();
        self.goals.insert(
            id,
            GoalNode {
                id,
                description: description.into(),
                status: GoalStatus::Pending,
                parent: Some(parent),
                created_at: Utc::now(),
                finished_at: None,
            },
        );
        id
    }

    /// 更新目标状态；完成/失败时记录结束时间。目标不存在返回 false
    pub fn update_status(&mut self, id: GoalId, status: GoalStatus) -> bool {
        let Some(goal) = self.goals.get_mut(&id) else {
            return false;
        };
        goal.status = status;
        goal.finished_at = match status {
            GoalStatus::Completed | GoalStatus::Failed => Some(Utc::now()),
            _ => None,
        };
        true
    }

    pub fn goal(&self, id: GoalId) -> Option<&GoalNode> {
        self.goals.get(&id)
    }

    /// 按描述查找子目标（不区分大小写）
    pub fn find_goal(&self, description: &str) -> Option<GoalId> {
        let needle = description.trim().to_lowercase();
        self.goals
            .values()
            .find(|g| g.description.trim().to_lowercase() == needle)
            .map(|g| g.id)
    }

    pub fn goal_count(&self) -> usize {
        self.goals.len()
    }

    fn alloc_goal_id(&mut self) -> GoalId {
        let id = self.next_goal;
        self.next_goal += 1;
        id
    }

    /// 淘汰最早完成的非根目标，没有则淘汰最早的非根目标；子节点改挂到被淘汰节点的父节点
    fn evict_goal(&mut self) -> bool {
        let root = self.root;
        let candidate = self
            .goals
            .values()
            .filter(|g| Some(g.id) != root && g.status == GoalStatus::Completed)
            .min_by_key(|g| (g.finished_at, g.id))
            .or_else(|| {
                self.goals
                    .values()
                    .filter(|g| Some(g.id) != root)
                    .min_by_key(|g| (g.created_at, g.id))
            })
            .map(|g| (g.id, g.parent));
        let Some((victim, parent)) = candidate else {
            return false;
        };
        self.goals.remove(&victim);
        for g in self.goals.values_mut() {
            if g.parent == Some(victim) {
                g.parent = parent.or(root);
            }
        }
        true
    }

    /// 写入事实，置信度裁剪到 [0, 1]
    pub fn add_fact(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        source: FactSource,
        confidence: f64,
    ) -> FactUpdate {
        let key = key.into();
        let confidence = if confidence.is_nan() { 0.0 } else { confidence.clamp(0.0, 1.0) };
        let fact = Fact {
            key: key.clone(),
            value: value.into(),
            provenance: source,
            timestamp: Utc::now(),
            confidence,
        };

        if let Some(stored) = self.facts.get_mut(&key) {
            if confidence < stored.confidence {
                return FactUpdate::Rejected {
                    stored_confidence: stored.confidence,
                };
            }
            let previous = std::mem::replace(stored, fact);
            return FactUpdate::Replaced {
                previous: previous.value,
            };
        }

        while self.facts.len() >= self.limits.max_facts.max(1) {
            let lowest = self
                .facts
                .values()
                .min_by(|a, b| {
                    a.confidence
                        .total_cmp(&b.confidence)
                        .then(a.timestamp.cmp(&b.timestamp))
                })
                .map(|f| f.key.clone());
            match lowest {
                Some(k) => {
                    self.facts.remove(&k);
                }
                None => break,
            }
        }
        self.facts.insert(key, fact);
        FactUpdate::Inserted
    }

    pub fn fact(&self, key: &str) -> Option<&Fact> {
        self.facts.get(key)
    }

    pub fn fact_count(&self) -> usize {
        self.facts.len()
    }

    /// 按置信度降序
    pub fn top_facts(&self, n: usize) -> Vec<&Fact> {
        let mut facts: Vec<&Fact> = self.facts.values().collect();
        facts.sort_by(|a, b| b.confidence.total_cmp(&a.confidence).then(a.key.cmp(&b.key)));
        facts.truncate(n);
        facts
    }

    /// 目标关闭后清除指向它的来源与访问记录；删除后相邻的重复访问合并为一条
    pub fn forget_target(&mut self, target: &TargetId) {
        for fact in self.facts.values_mut() {
            if fact.provenance.target_id.as_ref() == Some(target) {
                fact.provenance.target_id = None;
            }
        }
        let mut kept: VecDeque<TargetId> = VecDeque::with_capacity(self.visited.len());
        for t in self.visited.drain(..) {
            if &t != target && kept.back() != Some(&t) {
                kept.push_back(t);
            }
        }
        self.visited = kept;
    }

    /// 记录访问；与上一条相同时合并
    pub fn record_visit(&mut self, target: TargetId) {
        if self.visited.back() == Some(&target) {
            return;
        }
        if self.visited.len() >= self.limits.max_visited.max(1) {
            self.visited.pop_front();
        }
        self.visited.push_back(target);
    }

    pub fn visited(&self) -> impl Iterator<Item = &TargetId> {
        self.visited.iter()
    }

    pub fn record_failure(
        &mut self,
        description: impl Into<String>,
        reason: impl Into<String>,
        context: impl Into<String>,
    ) {
        if self.failures.len() >= self.limits.max_failures.max(1) {
            self.failures.pop_front();
        }
        self.failures.push_back(FailedStrategy {
            description: description.into(),
            reason: reason.into(),
            context: context.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn failures(&self) -> impl Iterator<Item = &FailedStrategy> {
        self.failures.iter()
    }

    /// 给 Planner 的有界摘要：主目标及直接子目标、置信度最高的事实、最近访问、最近失败
    pub fn summarize_for_prompt(&self) -> String {
        let mut s = String::new();
        if let Some(root) = self.primary_goal() {
            s.push_str(&format!("## Goal\n{} {}\n", root.status.marker(), root.description));
            for g in self.goals.values().filter(|g| g.parent == Some(root.id)) {
                s.push_str(&format!("  {} {}\n", g.status.marker(), g.description));
            }
            s.push('\n');
        }
        let facts = self.top_facts(self.limits.summary_facts);
        if !facts.is_empty() {
            s.push_str("## Known facts\n");
            for f in facts {
                s.push_str(&format!("- {}: {} ({:.2})\n", f.key, f.value, f.confidence));
            }
            s.push('\n');
        }
        if !self.visited.is_empty() {
            let skip = self.visited.len().saturating_sub(self.limits.summary_visited);
            let recent: Vec<&str> = self.visited.iter().skip(skip).map(|t| t.as_str()).collect();
            s.push_str(&format!("## Recently visited\n{}\n\n", recent.join(" -> ")));
        }
        if !self.failures.is_empty() {
            s.push_str("## Failed attempts\n");
            let skip = self.failures.len().saturating_sub(self.limits.summary_failures);
            for f in self.failures.iter().skip(skip) {
                s.push_str(&format!("- {}: {}\n", f.description, f.reason));
            }
        }
        truncate_chars(s.trim_end(), self.limits.summary_max_chars)
    }

    /// 清空全部内容（容量配置保留）
    pub fn reset(&mut self) {
        *self = Self::new(self.limits.clone());
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> MemorySection {
        MemorySection {
            max_goals: 3,
            max_facts: 2,
            max_visited: 3,
            max_failures: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_fact_confidence_is_monotonic() {
        let mut m = MemoryStore::new(MemorySection::default());
        let src = FactSource::new("planner");
        assert_eq!(m.add_fact("price", "10", src.clone(), 0.6), FactUpdate::Inserted);
        assert!(matches!(m.add_fact("price", "9", src.clone(), 0.4), FactUpdate::Rejected { .. }));
        assert_eq!(m.fact("price").unwrap().value, "10");
        assert_eq!(
            m.add_fact("price", "12", src.clone(), 0.6),
            FactUpdate::Replaced { previous: "10".into() }
        );
        m.add_fact("price", "13", src, 7.0);
        let stored = m.fact("price").unwrap();
        assert_eq!(stored.value, "13");
        assert!((stored.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_fact_overflow_evicts_lowest_confidence() {
        let mut m = MemoryStore::new(limits());
        m.add_fact("a", "1", FactSource::new("x"), 0.9);
        m.add_fact("b", "2", FactSource::new("x"), 0.2);
        m.add_fact("c", "3", FactSource::new("x"), 0.5);
        assert!(m.fact("b").is_none());
        assert_eq!(m.fact_count(), 2);
    }

    #[test]
    fn test_goal_eviction_prefers_completed() {
        let mut m = MemoryStore::new(limits());
        let root = m.set_primary_goal("buy a laptop");
        let a = m.add_goal("search", None);
        let b = m.add_goal("compare", Some(a));
        m.update_status(b, GoalStatus::Completed);
        assert!(m.goal(b).unwrap().finished_at.is_some());

        let c = m.add_goal("checkout", Some(999));
        assert!(m.goal(b).is_none());
        assert_eq!(m.goal(c).unwrap().parent, Some(root));
        assert_eq!(m.goal_count(), 3);

        // 没有已完成的子目标时淘汰最早的，子节点改挂
        let d = m.add_goal("pay", Some(c));
        assert!(m.goal(a).is_none());
        assert!(m.goal(d).is_some());
        assert!(m.goal(root).is_some());
    }

    #[test]
    fn test_visits_collapse_and_bound() {
        let mut m = MemoryStore::new(limits());
        for t in ["t1", "t1", "t2", "t3", "t4"] {
            m.record_visit(t.into());
        }
        let v: Vec<&str> = m.visited().map(|t| t.as_str()).collect();
        assert_eq!(v, vec!["t2", "t3", "t4"]);
    }

    #[test]
    fn test_forget_target_merges_neighbouring_visits() {
        let mut m = MemoryStore::new(MemorySection::default());
        for t in ["t1", "t2", "t1", "t3", "t2", "t3"] {
            m.record_visit(t.into());
        }
        m.forget_target(&"t2".into());
        let v: Vec<&str> = m.visited().map(|t| t.as_str()).collect();
        assert_eq!(v, vec!["t1", "t3"]);

        // 之后的访问仍与末尾合并
        m.record_visit("t3".into());
        assert_eq!(m.visited().count(), 2);
    }

    #[test]
    fn test_summary_is_bounded() {
        let mut m = MemoryStore::new(MemorySection {
            summary_max_chars: 120,
            ..Default::default()
        });
        m.set_primary_goal("find the cheapest flight");
        m.add_goal("open airline site", None);
        for i in 0..50 {
            m.add_fact(format!("k{i}"), "v".repeat(20), FactSource::new("p"), 0.5);
            m.record_failure(format!("click {i}"), "no change observed", "");
        }
        let summary = m.summarize_for_prompt();
        assert!(summary.chars().count() <= 120);
        assert!(summary.starts_with("## Goal\n[~] find the cheapest flight"));
        assert!(summary.contains("[ ] open airline site"));
    }

    #[test]
    fn test_forget_target_and_reset() {
        let mut m = MemoryStore::new(MemorySection::default());
        m.add_fact("price", "10", FactSource::new("page").from_target("t1".into(), None), 0.8);
        m.record_visit("t1".into());
        m.forget_target(&"t1".into());
        assert!(m.fact("price").unwrap().provenance.target_id.is_none());
        assert_eq!(m.visited().count(), 0);
        m.reset();
        assert_eq!(m.fact_count(), 0);
        assert!(m.primary_goal().is_none());
    }
}
