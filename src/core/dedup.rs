//! 通知去重：近似重复的进度消息不再重复推送

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::DedupSection;

/// 有界、按时间过期的近期消息窗口
#[derive(Debug)]
pub struct MessageDeduplicator {
    threshold: f64,
    capacity: usize,
    expiry: Duration,
    recent: VecDeque<(String, Instant)>,
}

impl MessageDeduplicator {
    pub fn new(cfg: &DedupSection) -> Self {
        Self {
            threshold: cfg.threshold,
            capacity: cfg.capacity.max(1),
            expiry: Duration::from_secs(cfg.expiry_secs),
            recent: VecDeque::new(),
        }
    }

    fn prune(&mut self) {
        let now = Instant::now();
        self.recent.retain(|(_, at)| now.duration_since(*at) < self.expiry);
    }

    /// 与窗口内任一消息的二元组 Jaccard 相似度 >= 阈值即视为重复
    pub fn is_duplicate(&mut self, text: &str) -> bool {
        self.prune();
        self.recent
            .iter()
            .any(|(prev, _)| bigram_similarity(prev, text) >= self.threshold)
    }

    /// 发送成功后记录
    pub fn record(&mut self, text: &str) {
        self.prune();
        if self.recent.len() >= self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back((text.to_string(), Instant::now()));
    }

    /// 不重复则记录并返回 true
    pub fn admit(&mut self, text: &str) -> bool {
        if self.is_duplicate(text) {
            return false;
        }
        self.record(text);
        true
    }

    pub fn reset(&mut self) {
        self.recent.clear();
    }
}

fn normalize(text: &str) -> Vec<char> {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .chars()
        .collect()
}

/// 字符二元组 Jaccard 相似度；不足两个字符时退化为精确比较
pub fn bigram_similarity(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);
    if a.len() < 2 || b.len() < 2 {
        return if a == b { 1.0 } else { 0.0 };
    }
    let set_a: HashSet<(char, char)> = a.windows(2).map(|w| (w[0], w[1])).collect();
    let set_b: HashSet<(char, char)> = b.windows(2).map(|w| (w[0], w[1])).collect();
    let inter = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    inter as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dedup() -> MessageDeduplicator {
        MessageDeduplicator::new(&DedupSection::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_near_duplicates_suppressed() {
        let mut d = dedup();
        assert!(d.admit("Clicking the search button (step 3)"));
        let similarity = bigram_similarity(
            "Clicking the search button (step 3)",
            "Clicking the search button (step 4)",
        );
        assert!(similarity >= 0.7);
        assert!(!d.admit("Clicking the search button (step 4)"));
        assert!(d.admit("Extracted price from second tab"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_and_reset() {
        let mut d = dedup();
        d.record("Waiting for page to load");
        assert!(d.is_duplicate("Waiting for page to load"));
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!d.is_duplicate("Waiting for page to load"));

        d.record("Typing query");
        d.reset();
        assert!(!d.is_duplicate("Typing query"));
    }

    #[test]
    fn test_short_texts_compare_exactly() {
        assert_eq!(bigram_similarity("a", "a"), 1.0);
        assert_eq!(bigram_similarity("a", "b"), 0.0);
        assert!(bigram_similarity("Opened new tab", "Closed old window") < 0.7);
    }
}
