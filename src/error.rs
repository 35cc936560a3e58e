/// 错误类型 (Error types)
///
/// 流水线所有阶段共用的错误枚举。满队列不是错误,由各阶段自行处理(重试或丢弃)。
use std::time::Duration;

use thiserror::Error;

/// 视频流失败时给运维人员的提示
pub const HW_DECODE_HINT: &str =
    "try disabling hardware-accelerated decoding (set USE_HW_DECODE to false in the config)";

#[derive(Debug, Error)]
pub enum PipelineError {
    /// 构建期致命错误: 帧配置非法、缺少输入源、未知的分辨率枚举、缺少通道
    #[error("configuration error: {0}")]
    Configuration(String),

    /// 运行期致命错误: 读取帧失败
    #[error("video device failure: {detail} ({hint})")]
    DeviceFailure { detail: String, hint: &'static str },

    /// 视频文件读完
    #[error("video stream ended")]
    StreamEnded,

    /// 推理模型加载失败 (仅分类阶段)
    #[error("failed to load inference model: {0}")]
    ModelLoad(String),

    /// 阶段在耐心时间内没有就绪
    #[error("stage {stage} not ready after {waited:?}")]
    ReadinessTimeout { stage: String, waited: Duration },

    #[error("inference failed: {0}")]
    Inference(String),

    /// 帧集合缩放失败
    #[error("frame resampling failed: {0}")]
    Resample(String),

    #[error("channel {0} disconnected")]
    ChannelClosed(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn config(message: impl Into<String>) -> Self {
        PipelineError::Configuration(message.into())
    }

    pub fn device(detail: impl Into<String>) -> Self {
        PipelineError::DeviceFailure {
            detail: detail.into(),
            hint: HW_DECODE_HINT,
        }
    }

    /// 流结束或设备失败: 阶段自行停止,监督者视为正常完成
    pub fn is_end_of_stream(&self) -> bool {
        matches!(
            self,
            PipelineError::StreamEnded | PipelineError::DeviceFailure { .. }
        )
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
