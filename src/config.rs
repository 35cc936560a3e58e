//! 流水线配置 - 通过JSON文件调整参数
//! Pipeline configuration loaded from a JSON file.
//!
//! 键名与部署环境的配置键一致 (SCREAMING_SNAKE_CASE), 所有键都有默认值。

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PipelineError, Result};

/// 分类标签: 蜂螨
pub const VARROA_LABEL: &str = "varroa";

// ========== 帧配置 ==========

/// 颜色模式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColorMode {
    Color,
    Grayscale,
    Unchanged,
}

/// 帧集合中的一个分辨率条目
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct FrameSpec {
    pub width: u32,
    pub height: u32,
    pub color_mode: ColorMode,
}

impl FrameSpec {
    pub const fn new(width: u32, height: u32, color_mode: ColorMode) -> Self {
        Self {
            width,
            height,
            color_mode,
        }
    }
}

/// 分类器输入分辨率 (决定截取哪一层帧以及缩放倍数)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractResolution {
    #[serde(rename = "EXT_RES_150x300")]
    Res150x300,
    #[serde(rename = "EXT_RES_75x150")]
    Res75x150,
}

impl ExtractResolution {
    /// 跟踪坐标 → 截取帧坐标的倍数
    pub fn scale_factor(&self) -> u32 {
        match self {
            ExtractResolution::Res150x300 => 2,
            ExtractResolution::Res75x150 => 1,
        }
    }

    /// 分类器输入尺寸 (width, height)
    pub fn classifier_size(&self) -> (u32, u32) {
        match self {
            ExtractResolution::Res150x300 => (150, 300),
            ExtractResolution::Res75x150 => (75, 150),
        }
    }

    /// 帧集合至少需要的层数 (截取层 + 跟踪层 + 检测层, 后两者可重合)
    pub fn min_frames(&self) -> usize {
        match self {
            ExtractResolution::Res150x300 => 3,
            ExtractResolution::Res75x150 => 2,
        }
    }
}

impl FromStr for ExtractResolution {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "EXT_RES_150x300" => Ok(ExtractResolution::Res150x300),
            "EXT_RES_75x150" => Ok(ExtractResolution::Res75x150),
            other => Err(PipelineError::config(format!(
                "unknown NN_EXTRACT_RESOLUTION {other:?}, expected EXT_RES_150x300 or EXT_RES_75x150"
            ))),
        }
    }
}

/// 近邻椭圆合并策略
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeStrategy {
    /// 逐对访问 (与现场部署的行为一致)
    Pairwise,
    /// 并查集连通分量
    Connected,
}

// ========== 流水线配置 ==========

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct PipelineConfig {
    // === 视频输入 ===
    pub frame_config: Vec<FrameSpec>,
    pub frame_set_buffer_length_camera: usize,
    pub frame_set_buffer_length_video: usize,
    pub frame_set_full_pause_time: f64, // 秒
    pub use_hw_decode: bool,

    // === 检测 ===
    pub binary_threshold_value: u8,
    pub binary_threshold_max: u8,
    pub blur_kernel_size: usize,
    pub blur_sigma: f32,
    pub detect_ellipse_area_min_size: f32,
    pub detect_ellipse_area_max_size: f32,
    pub detect_group_area_min_size: f32,
    pub detect_group_area_max_size: f32,
    pub merge_distance: f32,
    pub merge_strategy: MergeStrategy,

    // === 跟踪 ===
    pub enable_tracking: bool,
    pub tracker_max_distance: f32,
    pub tracker_max_lost_frames: u32,
    pub tracker_min_travel: f32,

    // === 截取 ===
    pub enable_image_extraction: bool,
    pub extract_frame_step: u32,
    pub extract_min_sharpness: f64,
    pub extraction_buffer_length: usize,
    pub extraction_idle_pause_time: f64,
    pub save_extracted_images: bool,
    pub save_extracted_images_path: PathBuf,

    // === 分类 ===
    pub nn_enable: bool,
    pub nn_model_path: PathBuf,
    pub nn_calibration_dir: PathBuf,
    pub nn_ready_timeout_secs: u64,
    pub nn_extract_resolution: ExtractResolution,
    pub classification_labels: Vec<String>,
    pub classification_thresholds: BTreeMap<String, f32>,
    pub classification_buffer_length: usize,
    pub classification_idle_pause_time: f64,
    pub save_detection_images: bool,
    pub save_detection_path: PathBuf,
    pub save_detection_types: Vec<String>,

    // === 可视化 ===
    pub visualization_enabled: bool,
    pub visualization_frame_skip: u64,
    pub visualization_buffer_length: usize,
    pub visualization_output_path: PathBuf,

    // === 调度 ===
    pub limit_fps_to: f64,
    pub stop_grace_ms: u64,
    pub telemetry_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_config: vec![
                FrameSpec::new(1920, 1080, ColorMode::Color),
                FrameSpec::new(960, 540, ColorMode::Color),
                FrameSpec::new(320, 180, ColorMode::Color),
            ],
            frame_set_buffer_length_camera: 10,
            frame_set_buffer_length_video: 50,
            frame_set_full_pause_time: 0.1,
            use_hw_decode: false,

            binary_threshold_value: 60,
            binary_threshold_max: 255,
            blur_kernel_size: 9,
            blur_sigma: 9.0,
            detect_ellipse_area_min_size: 100.0,
            detect_ellipse_area_max_size: 1000.0,
            detect_group_area_min_size: 1000.0,
            detect_group_area_max_size: 5000.0,
            merge_distance: 50.0,
            merge_strategy: MergeStrategy::Pairwise,

            enable_tracking: true,
            tracker_max_distance: 50.0,
            tracker_max_lost_frames: 20,
            tracker_min_travel: 40.0,

            enable_image_extraction: true,
            extract_frame_step: 10,
            extract_min_sharpness: 50.0,
            extraction_buffer_length: 32,
            extraction_idle_pause_time: 0.01,
            save_extracted_images: false,
            save_extracted_images_path: PathBuf::from("out/extracted"),

            nn_enable: true,
            nn_model_path: PathBuf::from("models/bee_classifier.onnx"),
            nn_calibration_dir: PathBuf::from("Images"),
            nn_ready_timeout_secs: 180,
            nn_extract_resolution: ExtractResolution::Res150x300,
            classification_labels: vec![VARROA_LABEL.to_string()],
            classification_thresholds: BTreeMap::from([(VARROA_LABEL.to_string(), 0.5)]),
            classification_buffer_length: 20,
            classification_idle_pause_time: 0.1,
            save_detection_images: false,
            save_detection_path: PathBuf::from("out/detections"),
            save_detection_types: vec![VARROA_LABEL.to_string()],

            visualization_enabled: false,
            visualization_frame_skip: 2,
            visualization_buffer_length: 1,
            visualization_output_path: PathBuf::from("out/latest.jpeg"),

            limit_fps_to: 30.0,
            stop_grace_ms: 1000,
            telemetry_interval_secs: 60,
        }
    }
}

impl PipelineConfig {
    /// 从JSON文件加载配置并校验
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| {
            PipelineError::config(format!("cannot read config {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&json).map_err(|e| {
            PipelineError::config(format!("cannot parse config {}: {e}", path.display()))
        })?;
        config.validate()?;
        info!("configuration loaded from {}", path.display());
        Ok(config)
    }

    /// 配置文件不存在时写入默认配置
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        info!("config {} not found, writing defaults", path.display());
        let config = Self::default();
        config.save(path)?;
        Ok(config)
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// 启动前校验, 所有错误都是 ConfigurationError
    pub fn validate(&self) -> Result<()> {
        if self.frame_config.is_empty() {
            return Err(PipelineError::config(
                "at least one frame config entry has to be provided",
            ));
        }
        for (num, spec) in self.frame_config.iter().enumerate() {
            if spec.width == 0 || spec.height == 0 {
                return Err(PipelineError::config(format!(
                    "frame config entry {} has a zero dimension ({}x{})",
                    num + 1,
                    spec.width,
                    spec.height
                )));
            }
        }
        for pair in self.frame_config.windows(2) {
            if pair[1].width > pair[0].width || pair[1].height > pair[0].height {
                return Err(PipelineError::config(
                    "frame config entries must be ordered largest first",
                ));
            }
        }
        if self.detection_spec().color_mode == ColorMode::Grayscale {
            return Err(PipelineError::config(
                "the smallest frame config entry feeds detection and must not be GRAYSCALE",
            ));
        }

        let resolution = self.nn_extract_resolution;
        if self.frame_config.len() < resolution.min_frames() {
            return Err(PipelineError::config(format!(
                "{:?} needs at least {} frame config entries, got {}",
                resolution,
                resolution.min_frames(),
                self.frame_config.len()
            )));
        }
        if self.tracking_frame_index().is_none() {
            return Err(PipelineError::config(format!(
                "no frame config entry is 1/{} of the largest entry's width",
                resolution.scale_factor()
            )));
        }

        if self.nn_enable {
            for label in &self.classification_labels {
                if !self.classification_thresholds.contains_key(label) {
                    return Err(PipelineError::config(format!(
                        "missing CLASSIFICATION_THRESHOLDS entry for label {label:?}"
                    )));
                }
            }
        }

        let bee = (
            self.detect_ellipse_area_min_size,
            self.detect_ellipse_area_max_size,
        );
        let group = (
            self.detect_group_area_min_size,
            self.detect_group_area_max_size,
        );
        if bee.0 >= bee.1 || group.0 >= group.1 {
            return Err(PipelineError::config("detection area ranges must be non-empty"));
        }
        if bee.0 < group.1 && group.0 < bee.1 {
            return Err(PipelineError::config(
                "DETECT_ELLIPSE_AREA and DETECT_GROUP_AREA ranges must not overlap",
            ));
        }

        if self.blur_kernel_size == 0 || self.blur_kernel_size % 2 == 0 {
            return Err(PipelineError::config("BLUR_KERNEL_SIZE must be odd"));
        }
        if self.telemetry_interval_secs == 0 {
            return Err(PipelineError::config(
                "TELEMETRY_INTERVAL_SECS must be at least 1",
            ));
        }
        if self.frame_set_buffer_length_camera == 0
            || self.frame_set_buffer_length_video == 0
            || self.extraction_buffer_length == 0
            || self.classification_buffer_length == 0
            || self.visualization_buffer_length == 0
        {
            return Err(PipelineError::config("channel buffer lengths must be at least 1"));
        }
        if !(self.limit_fps_to > 0.0) {
            return Err(PipelineError::config("LIMIT_FPS_TO must be positive"));
        }
        if self.visualization_frame_skip == 0 {
            return Err(PipelineError::config(
                "VISUALIZATION_FRAME_SKIP must be at least 1",
            ));
        }
        Ok(())
    }

    // ========== 派生参数 ==========

    /// 检测用的最小分辨率帧
    pub fn detection_spec(&self) -> FrameSpec {
        self.frame_config[self.frame_config.len() - 1]
    }

    /// 跟踪坐标所在的帧: 宽度 × scale_factor == 最大帧宽度
    pub fn tracking_frame_index(&self) -> Option<usize> {
        let largest = self.frame_config.first()?.width;
        let factor = self.nn_extract_resolution.scale_factor();
        self.frame_config
            .iter()
            .position(|spec| spec.width * factor == largest)
    }

    /// 检测坐标 → 跟踪坐标的倍数
    pub fn detection_scale(&self) -> f32 {
        let largest = self.frame_config[0].width as f32;
        let factor = self.nn_extract_resolution.scale_factor() as f32;
        largest / (factor * self.detection_spec().width as f32)
    }

    pub fn frame_set_full_pause(&self) -> Duration {
        Duration::from_secs_f64(self.frame_set_full_pause_time.max(0.0))
    }

    pub fn extraction_idle_pause(&self) -> Duration {
        Duration::from_secs_f64(self.extraction_idle_pause_time.max(0.0))
    }

    pub fn classification_idle_pause(&self) -> Duration {
        Duration::from_secs_f64(self.classification_idle_pause_time.max(0.0))
    }

    /// 每帧时间预算
    pub fn frame_budget(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.limit_fps_to)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn ready_patience(&self) -> Duration {
        Duration::from_secs(self.nn_ready_timeout_secs)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_interval_secs)
    }

    /// 打印当前配置
    pub fn log_summary(&self) {
        info!(
            frames = self.frame_config.len(),
            detection = %format!("{}x{}", self.detection_spec().width, self.detection_spec().height),
            resolution = ?self.nn_extract_resolution,
            nn = self.nn_enable,
            tracking = self.enable_tracking,
            extraction = self.enable_image_extraction,
            visualization = self.visualization_enabled,
            fps_limit = self.limit_fps_to,
            "pipeline configuration"
        );
    }
}
