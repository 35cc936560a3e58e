//! 多目标跟踪接口
//! Multi-object tracking contract
//!
//! 检测阶段只依赖这里的 trait, 具体跟踪算法可替换。

use std::collections::BTreeSet;

use crate::detection::Ellipse;

pub mod nearest;

pub use nearest::{NearestTracker, TrackerParams};

/// 跟踪ID
pub type TrackId = u64;

/// 轨迹结束时的净移动方向 (图像坐标系y轴向下)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// 向上移动 (进巢)
    In,
    /// 向下移动 (出巢)
    Out,
    /// 移动距离不足
    Undecided,
}

/// 跟踪器事件
#[derive(Clone, Debug, PartialEq)]
pub enum TrackEvent {
    /// 轨迹结束, 携带方向和累计的分类标签
    Ended {
        id: TrackId,
        direction: Direction,
        labels: BTreeSet<String>,
    },
}

/// 轨迹快照 (可视化用)
#[derive(Clone, Debug)]
pub struct TrackSnapshot {
    pub id: TrackId,
    pub ellipse: Ellipse,
    pub trajectory: Vec<(f32, f32)>,
    pub labels: BTreeSet<String>,
    pub color: (u8, u8, u8),
}

/// 单条轨迹
pub trait Track {
    /// 分类结果回送
    fn image_classification_complete(&mut self, labels: BTreeSet<String>);
}

/// 多目标跟踪器
pub trait Tracker: Send {
    /// 用当前帧的检测更新, 返回本帧结束的轨迹
    fn update(&mut self, detections: &[Ellipse], groups: &[Ellipse]) -> Vec<TrackEvent>;

    /// 已结束的轨迹返回 None
    fn track_by_id(&mut self, id: TrackId) -> Option<&mut dyn Track>;

    /// 当前帧可见的轨迹位置, 同一轨迹两次返回之间至少间隔 `min_step` 帧
    fn last_bee_positions(&mut self, min_step: u32) -> Vec<(TrackId, Ellipse)>;

    fn snapshot(&self) -> Vec<TrackSnapshot>;
}
