//! 统计计数 (StatisticsRegistry)
//!
//! 所有阶段通过 `Arc` 共享同一组原子计数器:
//! - 区间计数: 遥测每次采样后清零
//! - 累计计数: 进程生命周期内只增不减
//! - 丢弃计数: 满通道丢弃的负载, 可观测而不是静默丢弃

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::VARROA_LABEL;

/// 一组蜜蜂统计计数
#[derive(Debug, Default)]
struct Counters {
    varroa: AtomicU64,
    bees_in: AtomicU64,
    bees_out: AtomicU64,
    frames: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            varroa_count: self.varroa.load(Ordering::Relaxed),
            bees_in: self.bees_in.load(Ordering::Relaxed),
            bees_out: self.bees_out.load(Ordering::Relaxed),
            frames_processed: self.frames.load(Ordering::Relaxed),
        }
    }

    fn take(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            varroa_count: self.varroa.swap(0, Ordering::Relaxed),
            bees_in: self.bees_in.swap(0, Ordering::Relaxed),
            bees_out: self.bees_out.swap(0, Ordering::Relaxed),
            frames_processed: self.frames.swap(0, Ordering::Relaxed),
        }
    }
}

/// 统计快照
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    pub varroa_count: u64,
    pub bees_in: u64,
    pub bees_out: u64,
    pub frames_processed: u64,
}

/// 满通道丢弃计数快照
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DropSnapshot {
    pub visualization: u64,
    pub extraction_requests: u64,
    pub classification_requests: u64,
    pub orphaned_results: u64,
}

#[derive(Debug, Default)]
pub struct StatisticsRegistry {
    interval: Counters,
    cumulative: Counters,

    dropped_visualization: AtomicU64,
    dropped_extraction: AtomicU64,
    dropped_classification: AtomicU64,
    orphaned_results: AtomicU64,
}

pub type SharedStatistics = Arc<StatisticsRegistry>;

impl StatisticsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedStatistics {
        Arc::new(Self::new())
    }

    // ========== 蜜蜂计数 ==========

    pub fn frame_processed(&self) {
        self.interval.frames.fetch_add(1, Ordering::Relaxed);
        self.cumulative.frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bee_in(&self) {
        self.interval.bees_in.fetch_add(1, Ordering::Relaxed);
        self.cumulative.bees_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bee_out(&self) {
        self.interval.bees_out.fetch_add(1, Ordering::Relaxed);
        self.cumulative.bees_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn varroa_detected(&self) {
        self.interval.varroa.fetch_add(1, Ordering::Relaxed);
        self.cumulative.varroa.fetch_add(1, Ordering::Relaxed);
    }

    /// 把一个分类结果计入检测计数 (蜂螨标签)
    pub fn add_classification_result(&self, labels: &BTreeSet<String>) {
        if labels.contains(VARROA_LABEL) {
            self.varroa_detected();
        }
    }

    /// 轨迹已结束的分类结果: 与直接检测同样计数
    pub fn add_orphaned_result(&self, labels: &BTreeSet<String>) {
        self.orphaned_results.fetch_add(1, Ordering::Relaxed);
        self.add_classification_result(labels);
    }

    // ========== 丢弃计数 ==========

    pub fn visualization_dropped(&self) {
        self.dropped_visualization.fetch_add(1, Ordering::Relaxed);
    }

    pub fn extraction_dropped(&self) {
        self.dropped_extraction.fetch_add(1, Ordering::Relaxed);
    }

    pub fn classification_dropped(&self) {
        self.dropped_classification.fetch_add(1, Ordering::Relaxed);
    }

    // ========== 读取 ==========

    pub fn interval(&self) -> StatisticsSnapshot {
        self.interval.snapshot()
    }

    pub fn cumulative(&self) -> StatisticsSnapshot {
        self.cumulative.snapshot()
    }

    /// 读取并清零区间计数
    pub fn take_interval(&self) -> StatisticsSnapshot {
        self.interval.take()
    }

    pub fn drops(&self) -> DropSnapshot {
        DropSnapshot {
            visualization: self.dropped_visualization.load(Ordering::Relaxed),
            extraction_requests: self.dropped_extraction.load(Ordering::Relaxed),
            classification_requests: self.dropped_classification.load(Ordering::Relaxed),
            orphaned_results: self.orphaned_results.load(Ordering::Relaxed),
        }
    }
}
