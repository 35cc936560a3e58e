#![allow(clippy::type_complexity)]
//! 蜂箱入口视频分析 (Bee Sentinel)
//!
//! 视频帧 → 蜜蜂检测与跟踪 → 截取蜜蜂图像 → 神经网络分类 (瓦螨) → 进出/瓦螨统计
pub mod config; // 流水线配置
pub mod detection; // 蜜蜂斑块检测
pub mod error; // 错误类型
pub mod frame; // 多分辨率帧集合
pub mod input; // 视频输入系统
pub mod pipeline; // 流水线阶段与装配
pub mod statistics; // 统计计数
pub mod supervisor; // 阶段监督与通道
pub mod telemetry; // 日志与遥测
pub mod tracking; // 多目标跟踪
pub mod utils; // 截图与仿射变换

pub use crate::config::PipelineConfig;
pub use crate::detection::{detect_bees, BlobDetections, DetectionParams, Ellipse};
pub use crate::error::{PipelineError, Result};
pub use crate::frame::{FrameImage, FrameSet, FrameSetBuilder};
pub use crate::pipeline::{Components, InferenceEngine, Pipeline, RunOutcome};
pub use crate::statistics::{SharedStatistics, StatisticsRegistry, StatisticsSnapshot};
pub use crate::supervisor::{Channel, Stage, StageContext, StopOutcome, Supervisor};
