//! 多标签页注册表
//!
//! 跟踪会话中并发的执行上下文（标签页）：每个标签页的状态、最近快照历史、按来源聚合的站点表，
//! 以及跨标签页的事实关联。标签页的打开 / 关闭 / 切换通过 broadcast 通道发布 TargetEvent，
//! 由组装时订阅的一方（会话循环）同步清理自己的引用。

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::actuator::{origin_of, ContextSnapshot, TargetId, TargetInfo};
use crate::config::TargetsSection;

/// 只有一个标签页报告某个键时的置信度
pub const SINGLE_TARGET_CONFIDENCE: f64 = 0.5;
/// 每多一个佐证标签页增加的置信度
const CORROBORATION_STEP: f64 = 0.2;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Target capacity exceeded ({0} open, none evictable)")]
    CapacityExceeded(usize),

    #[error("Unknown target: {0}")]
    UnknownTarget(TargetId),
}

/// 标签页事件
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetEvent {
    Opened { target: TargetId, agent_opened: bool },
    Closed { target: TargetId },
    Switched { from: Option<TargetId>, to: TargetId },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    pub id: TargetId,
    pub address: String,
    pub title: String,
    pub purpose: Option<String>,
    pub created_at: DateTime<Utc>,
    /// true：由 Agent 打开；false：会话开始前已存在
    pub agent_opened: bool,
}

/// 某个标签页的一次快照及其提取数据
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SavedContext {
    pub snapshot: ContextSnapshot,
    pub extracted: BTreeMap<String, String>,
    pub saved_at: DateTime<Utc>,
}

/// 按逻辑来源（scheme://host）聚合
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SiteAggregate {
    pub origin: String,
    pub targets: BTreeSet<TargetId>,
    pub fact_keys: BTreeSet<String>,
    pub visit_count: u64,
    pub last_visit: DateTime<Utc>,
}

/// 被多个标签页同时报告的事实
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    pub key: String,
    pub values: BTreeMap<TargetId, String>,
    pub confidence: f64,
}

impl Correlation {
    /// 所有标签页报告的值是否一致
    pub fn is_consistent(&self) -> bool {
        let mut values = self.values.values();
        match values.next() {
            Some(first) => values.all(|v| v == first),
            None => true,
        }
    }
}

fn correlation_confidence(targets: usize) -> f64 {
    if targets == 0 {
        return 0.0;
    }
    (SINGLE_TARGET_CONFIDENCE + CORROBORATION_STEP * (targets as f64 - 1.0)).min(1.0)
}

/// 多标签页注册表
#[derive(Debug)]
pub struct ContextRegistry {
    cfg: TargetsSection,
    targets: HashMap<TargetId, TargetState>,
    /// 打开顺序（用于淘汰与摘要排序）
    order: Vec<TargetId>,
    active: Option<TargetId>,
    history: HashMap<TargetId, VecDeque<SavedContext>>,
    sites: BTreeMap<String, SiteAggregate>,
    /// 键 -> 各标签页最近一次报告的值
    key_values: BTreeMap<String, BTreeMap<TargetId, String>>,
    correlations: BTreeMap<String, Correlation>,
    events: broadcast::Sender<TargetEvent>,
}

impl ContextRegistry {
    pub fn new(cfg: TargetsSection) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            cfg,
            targets: HashMap::new(),
            order: Vec::new(),
            active: None,
            history: HashMap::new(),
            sites: BTreeMap::new(),
            key_values: BTreeMap::new(),
            correlations: BTreeMap::new(),
            events,
        }
    }

    /// 订阅标签页事件
    pub fn subscribe(&self) -> broadcast::Receiver<TargetEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: TargetEvent) {
        // 没有订阅者时发送失败，忽略
        let _ = self.events.send(event);
    }

    /// 登记会话开始前已存在的标签页；容量已满时忽略并返回 false
    pub fn observe_existing(&mut self, info: &TargetInfo) -> bool {
        if self.targets.contains_key(&info.id) {
            return true;
        }
        if self.targets.len() >= self.cfg.max_targets {
            tracing::warn!(
                target_id = %info.id,
                "target capacity reached, ignoring pre-existing target"
            );
            return false;
        }
        self.insert(info, None, false);
        if info.active || self.active.is_none() {
            self.active = Some(info.id.clone());
        }
        true
    }

    /// 登记 Agent 新打开的标签页并激活；容量已满时淘汰最早打开的、非激活的 Agent 标签页
    ///
    /// 返回被淘汰的标签页（调用方负责通过 Actuator 真正关闭它）。
    pub fn open_target(
        &mut self,
        info: &TargetInfo,
        purpose: Option<String>,
    ) -> Result<Option<TargetId>, RegistryError> {
        let mut evicted = None;
        if !self.targets.contains_key(&info.id) && self.targets.len() >= self.cfg.max_targets {
            let candidate = self
                .order
                .iter()
                .find(|id| {
                    Some(*id) != self.active.as_ref()
                        && self.targets.get(*id).is_some_and(|t| t.agent_opened)
                })
                .cloned();
            match candidate {
                Some(victim) => {
                    tracing::info!(target_id = %victim, "evicting oldest agent-opened target");
                    self.close_target(&victim)?;
                    evicted = Some(victim);
                }
                None => return Err(RegistryError::CapacityExceeded(self.targets.len())),
            }
        }
        self.insert(info, purpose, true);
        let from = self.active.replace(info.id.clone());
        self.emit(TargetEvent::Opened {
            target: info.id.clone(),
            agent_opened: true,
        });
        if from.as_ref() != Some(&info.id) {
            self.emit(TargetEvent::Switched {
                from,
                to: info.id.clone(),
            });
        }
        Ok(evicted)
    }

    fn insert(&mut self, info: &TargetInfo, purpose: Option<String>, agent_opened: bool) {
        self.targets.insert(
            info.id.clone(),
            TargetState {
                id: info.id.clone(),
                address: info.address.clone(),
                title: info.title.clone(),
                purpose,
                created_at: Utc::now(),
                agent_opened,
            },
        );
        self.order.retain(|id| id != &info.id);
        self.order.push(info.id.clone());
    }

    /// 关闭标签页并清除所有指向它的引用（历史、站点聚合、关联）
    pub fn close_target(&mut self, id: &TargetId) -> Result<TargetState, RegistryError> {
        let state = self
            .targets
            .remove(id)
            .ok_or_else(|| RegistryError::UnknownTarget(id.clone()))?;
        self.order.retain(|t| t != id);
        self.history.remove(id);

        self.sites.retain(|_, site| {
            site.targets.remove(id);
            !site.targets.is_empty()
        });

        let affected: Vec<String> = self
            .key_values
            .iter_mut()
            .filter_map(|(key, per_target)| per_target.remove(id).map(|_| key.clone()))
            .collect();
        for key in affected {
            self.rebuild_correlation(&key);
        }
        self.key_values.retain(|_, per_target| !per_target.is_empty());

        self.emit(TargetEvent::Closed { target: id.clone() });
        if self.active.as_ref() == Some(id) {
            self.active = self.order.last().cloned();
            if let Some(next) = self.active.clone() {
                self.emit(TargetEvent::Switched {
                    from: Some(id.clone()),
                    to: next,
                });
            }
        }
        Ok(state)
    }

    pub fn switch_to(&mut self, id: &TargetId) -> Result<(), RegistryError> {
        if !self.targets.contains_key(id) {
            return Err(RegistryError::UnknownTarget(id.clone()));
        }
        let from = self.active.replace(id.clone());
        if from.as_ref() != Some(id) {
            self.emit(TargetEvent::Switched { from, to: id.clone() });
        }
        Ok(())
    }

    /// 保存快照到该标签页的有界历史，并更新来源站点聚合
    pub fn save_context(
        &mut self,
        id: &TargetId,
        snapshot: ContextSnapshot,
        extracted: BTreeMap<String, String>,
    ) -> Result<(), RegistryError> {
        let state = self
            .targets
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownTarget(id.clone()))?;
        state.address = snapshot.address.clone();
        state.title = snapshot.title.clone();

        let history = self.history.entry(id.clone()).or_default();
        let address_changed = history
            .back()
            .map_or(true, |prev| prev.snapshot.address != snapshot.address);

        let now = Utc::now();
        let origin = origin_of(&snapshot.address);
        let site = self.sites.entry(origin.clone()).or_insert_with(|| SiteAggregate {
            origin,
            targets: BTreeSet::new(),
            fact_keys: BTreeSet::new(),
            visit_count: 0,
            last_visit: now,
        });
        site.targets.insert(id.clone());
        site.last_visit = now;
        if address_changed {
            site.visit_count += 1;
        }

        while history.len() >= self.cfg.history_depth.max(1) {
            history.pop_front();
        }
        history.push_back(SavedContext {
            snapshot,
            extracted: BTreeMap::new(),
            saved_at: now,
        });

        for (key, value) in extracted {
            self.record_key_value(id, &key, &value)?;
        }
        Ok(())
    }

    /// 记录提取到的键值：写入最近一次快照，并（开启跨标签追踪时）更新关联
    pub fn record_key_value(
        &mut self,
        id: &TargetId,
        key: &str,
        value: &str,
    ) -> Result<(), RegistryError> {
        let address = self
            .targets
            .get(id)
            .map(|t| t.address.clone())
            .ok_or_else(|| RegistryError::UnknownTarget(id.clone()))?;

        if let Some(latest) = self.history.get_mut(id).and_then(|h| h.back_mut()) {
            latest.extracted.insert(key.to_string(), value.to_string());
        }
        if let Some(site) = self.sites.get_mut(&origin_of(&address)) {
            site.fact_keys.insert(key.to_string());
        }
        if self.cfg.cross_target_tracking {
            self.key_values
                .entry(key.to_string())
                .or_default()
                .insert(id.clone(), value.to_string());
            self.rebuild_correlation(key);
        }
        Ok(())
    }

    fn rebuild_correlation(&mut self, key: &str) {
        let values = self.key_values.get(key).cloned().unwrap_or_default();
        if values.len() >= 2 {
            let confidence = correlation_confidence(values.len());
            self.correlations.insert(
                key.to_string(),
                Correlation {
                    key: key.to_string(),
                    values,
                    confidence,
                },
            );
        } else {
            self.correlations.remove(key);
        }
    }

    /// 当前有效的关联（至少两个标签页）
    pub fn correlations(&self) -> impl Iterator<Item = &Correlation> {
        self.correlations.values()
    }

    pub fn correlation(&self, key: &str) -> Option<&Correlation> {
        self.correlations.get(key)
    }

    pub fn active(&self) -> Option<&TargetId> {
        self.active.as_ref()
    }

    pub fn target(&self, id: &TargetId) -> Option<&TargetState> {
        self.targets.get(id)
    }

    pub fn contains(&self, id: &TargetId) -> bool {
        self.targets.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// 按打开顺序
    pub fn targets(&self) -> Vec<&TargetState> {
        self.order.iter().filter_map(|id| self.targets.get(id)).collect()
    }

    pub fn history(&self, id: &TargetId) -> Option<&VecDeque<SavedContext>> {
        self.history.get(id)
    }

    pub fn site(&self, origin: &str) -> Option<&SiteAggregate> {
        self.sites.get(origin)
    }

    /// 回退目标：最近打开的另一个标签页
    pub fn alternate_for(&self, current: &TargetId) -> Option<TargetId> {
        self.order.iter().rev().find(|id| *id != current).cloned()
    }

    /// Agent 打开的标签页（按打开顺序）
    pub fn agent_opened(&self) -> Vec<TargetId> {
        self.order
            .iter()
            .filter(|id| self.targets.get(*id).is_some_and(|t| t.agent_opened))
            .cloned()
            .collect()
    }

    /// 给 Planner 的有界摘要：标签页（当前页优先）、站点聚合、关联
    pub fn build_summary(&self, current: Option<&TargetId>, max_targets: usize) -> String {
        let mut ids: Vec<&TargetId> = self.order.iter().collect();
        if let Some(cur) = current {
            ids.sort_by_key(|id| *id != cur);
        }
        let mut s = String::from("## Open targets\n");
        for id in ids.iter().take(max_targets) {
            let Some(t) = self.targets.get(*id) else { continue };
            let marker = if Some(*id) == current { "*" } else { "-" };
            let origin = if t.agent_opened { "agent" } else { "existing" };
            s.push_str(&format!("{} {} [{}] {} ({})", marker, t.id, origin, t.address, t.title));
            if let Some(ref p) = t.purpose {
                s.push_str(&format!(" purpose: {}", p));
            }
            s.push('\n');
            if let Some(latest) = self.history.get(*id).and_then(|h| h.back()) {
                for (k, v) in &latest.extracted {
                    s.push_str(&format!("    {} = {}\n", k, v));
                }
            }
        }
        if ids.len() > max_targets {
            s.push_str(&format!("- ... {} more\n", ids.len() - max_targets));
        }
        if !self.sites.is_empty() {
            s.push_str("## Sites\n");
            for site in self.sites.values() {
                s.push_str(&format!(
                    "- {} visits={} targets={} keys=[{}]\n",
                    site.origin,
                    site.visit_count,
                    site.targets.len(),
                    site.fact_keys.iter().cloned().collect::<Vec<_>>().join(", ")
                ));
            }
        }
        if !self.correlations.is_empty() {
            s.push_str("## Cross-target facts\n");
            for c in self.correlations.values() {
                let values: Vec<String> =
                    c.values.iter().map(|(t, v)| format!("{}={}", t, v)).collect();
                s.push_str(&format!("- {} ({:.2}): {}\n", c.key, c.confidence, values.join(", ")));
            }
        }
        s
    }

    /// 只读视图
    pub fn snapshot(&self) -> Vec<TargetInfo> {
        self.targets()
            .into_iter()
            .map(|t| TargetInfo {
                id: t.id.clone(),
                address: t.address.clone(),
                title: t.title.clone(),
                active: self.active.as_ref() == Some(&t.id),
            })
            .collect()
    }

    /// 清空全部状态（保留事件通道与订阅者）
    pub fn reset(&mut self) {
        self.targets.clear();
        self.order.clear();
        self.active = None;
        self.history.clear();
        self.sites.clear();
        self.key_values.clear();
        self.correlations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, address: &str) -> TargetInfo {
        TargetInfo {
            id: id.into(),
            address: address.to_string(),
            title: String::new(),
            active: false,
        }
    }

    fn snap(id: &str, address: &str) -> ContextSnapshot {
        ContextSnapshot::new(id.into(), address, "")
    }

    #[test]
    fn test_correlation_needs_two_targets() {
        let mut r = ContextRegistry::new(TargetsSection::default());
        r.observe_existing(&info("t1", "https://a.example/item"));
        r.open_target(&info("t2", "https://b.example/item"), None).unwrap();

        r.record_key_value(&"t1".into(), "price", "10").unwrap();
        assert!(r.correlation("price").is_none());

        r.record_key_value(&"t2".into(), "price", "12").unwrap();
        let c = r.correlation("price").unwrap();
        assert_eq!(c.values.len(), 2);
        assert!(c.confidence > SINGLE_TARGET_CONFIDENCE);
        assert!(!c.is_consistent());

        r.close_target(&"t2".into()).unwrap();
        assert!(r.correlation("price").is_none());
    }

    #[test]
    fn test_capacity_evicts_oldest_agent_target() {
        let cfg = TargetsSection {
            max_targets: 2,
            ..Default::default()
        };
        let mut r = ContextRegistry::new(cfg);
        r.observe_existing(&info("t0", "https://a.example"));
        r.open_target(&info("t1", "https://b.example"), None).unwrap();
        // t1 是激活页，不可淘汰；t0 不是 Agent 打开的
        let err = r.open_target(&info("t2", "https://c.example"), None).unwrap_err();
        assert_eq!(err, RegistryError::CapacityExceeded(2));

        r.switch_to(&"t0".into()).unwrap();
        let evicted = r.open_target(&info("t2", "https://c.example"), None).unwrap();
        assert_eq!(evicted, Some("t1".into()));
        assert_eq!(r.active(), Some(&"t2".into()));
        assert_eq!(r.agent_opened(), vec![TargetId::from("t2")]);
    }

    #[test]
    fn test_close_purges_sites_and_rehomes_active() {
        let mut r = ContextRegistry::new(TargetsSection::default());
        let mut events = r.subscribe();
        r.observe_existing(&info("t1", "https://a.example"));
        r.open_target(&info("t2", "https://b.example"), Some("compare".into())).unwrap();
        r.save_context(&"t2".into(), snap("t2", "https://b.example/x"), BTreeMap::new()).unwrap();
        assert!(r.site("https://b.example").is_some());

        r.close_target(&"t2".into()).unwrap();
        assert!(r.site("https://b.example").is_none());
        assert_eq!(r.active(), Some(&"t1".into()));
        assert!(r.history(&"t2".into()).is_none());

        assert!(matches!(events.try_recv().unwrap(), TargetEvent::Opened { .. }));
        assert!(matches!(events.try_recv().unwrap(), TargetEvent::Switched { .. }));
        assert_eq!(events.try_recv().unwrap(), TargetEvent::Closed { target: "t2".into() });
    }

    #[test]
    fn test_history_bounded_and_visits_counted() {
        let cfg = TargetsSection {
            history_depth: 2,
            ..Default::default()
        };
        let mut r = ContextRegistry::new(cfg);
        r.observe_existing(&info("t1", "https://a.example"));
        let mut data = BTreeMap::new();
        data.insert("title".to_string(), "Deals".to_string());
        r.save_context(&"t1".into(), snap("t1", "https://a.example/1"), BTreeMap::new()).unwrap();
        r.save_context(&"t1".into(), snap("t1", "https://a.example/1"), BTreeMap::new()).unwrap();
        r.save_context(&"t1".into(), snap("t1", "https://a.example/2"), data).unwrap();

        assert_eq!(r.history(&"t1".into()).unwrap().len(), 2);
        let site = r.site("https://a.example").unwrap();
        assert_eq!(site.visit_count, 2);
        assert!(site.fact_keys.contains("title"));

        let summary = r.build_summary(Some(&"t1".into()), 5);
        assert!(summary.contains("* t1 [existing] https://a.example/2"));
        assert!(summary.contains("title = Deals"));
    }

    #[test]
    fn test_unknown_target_errors() {
        let mut r = ContextRegistry::new(TargetsSection::default());
        assert!(matches!(
            r.switch_to(&"nope".into()),
            Err(RegistryError::UnknownTarget(_))
        ));
        assert!(r.record_key_value(&"nope".into(), "k", "v").is_err());
    }
}
