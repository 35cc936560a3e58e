/// 流水线消息定义
/// Messages exchanged between pipeline stages
use std::collections::BTreeSet;
use std::sync::Arc;

use image::RgbImage;

use crate::detection::Ellipse;
use crate::frame::FrameImage;
use crate::tracking::{TrackId, TrackSnapshot};

// ========== 通道名称 ==========

/// 帧集合 (FrameSource → DetectionStage)
pub const FRAME_SETS: &str = "frame_sets";
/// 截取请求 (DetectionStage → ExtractionStage)
pub const EXTRACTION_REQUESTS: &str = "extraction_requests";
/// 分类请求 (ExtractionStage → ClassificationWorker)
pub const CLASSIFICATION_REQUESTS: &str = "classification_requests";
/// 分类结果 (ClassificationWorker → DetectionStage), 无界
pub const CLASSIFICATION_RESULTS: &str = "classification_results";
/// 可视化负载 (DetectionStage → SnapshotWriter), 尽力而为
pub const VISUALIZATION: &str = "visualization";

// ========== 消息 ==========

/// 截取请求: 跟踪坐标 × scale_factor = 截取帧坐标
#[derive(Clone, Debug)]
pub struct ExtractionRequest {
    pub positions: Vec<(TrackId, Ellipse)>,
    pub frame: Arc<FrameImage>,
    pub scale_factor: u32,
    pub frame_id: u64,
}

/// 分类请求
#[derive(Clone, Debug)]
pub struct ClassificationRequest {
    pub track_id: TrackId,
    pub image: RgbImage,
    pub frame_id: u64,
}

/// 分类结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassificationResult {
    pub track_id: TrackId,
    pub labels: BTreeSet<String>,
}

/// 可视化负载
#[derive(Clone, Debug)]
pub struct VisualizationFrame {
    pub frame: Arc<FrameImage>,
    pub frame_id: u64,
    pub detections: Vec<Ellipse>,
    pub groups: Vec<Ellipse>,
    pub tracks: Vec<TrackSnapshot>,
    pub fps: f64,
}
