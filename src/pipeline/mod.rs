/// 视频处理流水线 (Video Processing Pipeline)
///
/// 每个阶段一个监督线程, 通过有界通道通信:
/// - FrameSource:          视频读取 → 帧集合
/// - DetectionStage:       检测 + 跟踪 + 统计
/// - ExtractionStage:      截取蜜蜂图像
/// - ClassificationWorker: 批量分类 (模型加载慢, 最先启动)
/// - SnapshotWriter:       可视化快照 (可选)
/// - TelemetryStage:       定时遥测
pub mod classify;
pub mod detect;
pub mod extract;
pub mod messages;
pub mod visualize;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::detection::DetectionParams;
use crate::error::{PipelineError, Result};
use crate::frame::FrameSet;
use crate::input::{FrameSource, VideoCapture};
use crate::statistics::{SharedStatistics, StatisticsRegistry};
use crate::supervisor::{Channel, StopOutcome, Supervisor};
use crate::telemetry::{LogSink, TelemetrySink, TelemetryStage};
use crate::tracking::{NearestTracker, Tracker, TrackerParams};

pub use classify::{ClassificationSettings, ClassificationWorker, InferenceEngine, BATCH_SIZE};
pub use detect::{DetectionSettings, DetectionStage};
pub use extract::{ExtractionSettings, ExtractionStage};
pub use messages::*;
pub use visualize::SnapshotWriter;

/// 运行期监视的轮询间隔
const WATCH_INTERVAL: Duration = Duration::from_millis(100);

/// 流水线的可替换部件
pub struct Components {
    pub capture: Box<dyn VideoCapture>,
    /// 帧集合通道容量 (摄像头 / 视频文件不同)
    pub frame_buffer: usize,
    pub engine: Option<Box<dyn InferenceEngine>>,
    pub tracker: Box<dyn Tracker>,
    pub sink: Box<dyn TelemetrySink>,
}

impl Components {
    /// 默认部件: 最近邻跟踪器, 日志遥测, 无推理后端
    pub fn new(capture: Box<dyn VideoCapture>, frame_buffer: usize, config: &PipelineConfig) -> Self {
        Self {
            capture,
            frame_buffer,
            engine: None,
            tracker: Box::new(NearestTracker::new(TrackerParams::from(config))),
            sink: Box::new(LogSink),
        }
    }

    pub fn with_engine(mut self, engine: Box<dyn InferenceEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_tracker(mut self, tracker: Box<dyn Tracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn TelemetrySink>) -> Self {
        self.sink = sink;
        self
    }
}

/// `run_until` 返回的原因
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// 外部请求关闭 (Ctrl-C)
    Interrupted,
    /// 检测阶段自行结束
    DetectionFinished,
    /// 视频源结束且缓冲的帧已全部处理
    SourceExhausted,
}

pub struct Pipeline {
    config: PipelineConfig,
    stats: SharedStatistics,
    frames: Channel<FrameSet>,

    source: Supervisor,
    detection: Supervisor,
    extraction: Option<Supervisor>,
    classification: Option<Supervisor>,
    visualization: Option<Supervisor>,
    telemetry: Supervisor,
}

impl Pipeline {
    /// 校验配置, 创建通道并把每个阶段包装进监督者 (尚未启动)
    pub fn build(config: PipelineConfig, components: Components) -> Result<Self> {
        config.validate()?;
        let Components {
            capture,
            frame_buffer,
            engine,
            tracker,
            sink,
        } = components;

        let engine = match (config.nn_enable, engine) {
            (true, Some(engine)) => Some(engine),
            (true, None) => {
                return Err(PipelineError::config(
                    "NN_ENABLE is set but no inference engine is available",
                ))
            }
            (false, _) => None,
        };
        let extraction_enabled = config.enable_tracking && config.enable_image_extraction;
        let grace = config.stop_grace();
        let stats = StatisticsRegistry::shared();

        // 通道
        let frames = Channel::<FrameSet>::bounded(FRAME_SETS, frame_buffer.max(1));
        let extraction_requests =
            Channel::<ExtractionRequest>::bounded(EXTRACTION_REQUESTS, config.extraction_buffer_length);
        let classification_requests = Channel::<ClassificationRequest>::bounded(
            CLASSIFICATION_REQUESTS,
            config.classification_buffer_length,
        );
        let classification_results = Channel::<ClassificationResult>::unbounded(CLASSIFICATION_RESULTS);
        let visualization =
            Channel::<VisualizationFrame>::bounded(VISUALIZATION, config.visualization_buffer_length);

        // 视频源
        let mut source = Supervisor::new(FrameSource::new(
            capture,
            config.frame_config.clone(),
            config.frame_set_full_pause(),
        )?)
        .with_grace(grace);
        source.register_channel(&frames);

        // 检测
        let mut detection = Supervisor::new(DetectionStage::new(
            tracker,
            DetectionParams::from(&config),
            DetectionSettings::from(&config),
            Arc::clone(&stats),
        ))
        .with_grace(grace);
        detection.register_channel(&frames);
        detection.register_channel(&classification_results);
        if extraction_enabled {
            detection.register_channel(&extraction_requests);
        }
        if config.visualization_enabled {
            detection.register_channel(&visualization);
        }

        // 截取
        let extraction = extraction_enabled.then(|| {
            let mut supervisor = Supervisor::new(ExtractionStage::new(
                ExtractionSettings::from(&config),
                Arc::clone(&stats),
            ))
            .with_grace(grace);
            supervisor.register_channel(&extraction_requests);
            supervisor.register_channel(&classification_requests);
            supervisor
        });

        // 分类
        let classification = engine.map(|engine| {
            let mut supervisor = Supervisor::new(ClassificationWorker::new(
                engine,
                ClassificationSettings::from(&config),
            ))
            .with_grace(grace);
            supervisor.register_channel(&classification_requests);
            supervisor.register_channel(&classification_results);
            supervisor
        });

        // 可视化
        let visualization = config.visualization_enabled.then(|| {
            let mut supervisor =
                Supervisor::new(SnapshotWriter::new(config.visualization_output_path.clone()))
                    .with_grace(grace);
            supervisor.register_channel(&visualization);
            supervisor
        });

        let telemetry = Supervisor::new(TelemetryStage::new(
            sink,
            Arc::clone(&stats),
            config.telemetry_interval(),
        ))
        .with_grace(grace);

        Ok(Self {
            config,
            stats,
            frames,
            source,
            detection,
            extraction,
            classification,
            visualization,
            telemetry,
        })
    }

    pub fn stats(&self) -> &SharedStatistics {
        &self.stats
    }

    /// 分类阶段最先启动并等待就绪, 视频源最后启动
    pub fn start(&mut self) -> Result<()> {
        if let Some(classification) = &mut self.classification {
            classification.start()?;
            info!("waiting for the neural network, this may take a few minutes");
            classification.wait_ready(self.config.ready_patience())?;
        }
        if let Some(extraction) = &mut self.extraction {
            extraction.start()?;
        }
        self.detection.start()?;
        if let Some(visualization) = &mut self.visualization {
            visualization.start()?;
        }
        self.telemetry.start()?;
        self.source.start()?;
        info!("pipeline running");
        Ok(())
    }

    /// 阻塞直到关闭信号、检测结束或视频源处理完毕
    pub fn run_until(&self, shutdown: &AtomicBool) -> RunOutcome {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                return RunOutcome::Interrupted;
            }
            if self.detection.is_finished() {
                return RunOutcome::DetectionFinished;
            }
            if self.source.is_finished() && self.frames.is_empty() {
                return RunOutcome::SourceExhausted;
            }
            thread::sleep(WATCH_INTERVAL);
        }
    }

    /// 生产者优先依次停止, 返回各阶段的停止结果
    pub fn stop(&mut self) -> Vec<(String, StopOutcome)> {
        let mut outcomes = Vec::new();
        let mut stop = |supervisor: &mut Supervisor| {
            let outcome = supervisor.stop();
            if outcome == StopOutcome::ForceTerminated {
                warn!(stage = supervisor.name(), "stage was force terminated");
            }
            outcomes.push((supervisor.name().to_string(), outcome));
        };

        stop(&mut self.source);
        stop(&mut self.detection);
        if let Some(extraction) = &mut self.extraction {
            stop(extraction);
        }
        if let Some(classification) = &mut self.classification {
            stop(classification);
        }
        if let Some(visualization) = &mut self.visualization {
            stop(visualization);
        }
        stop(&mut self.telemetry);

        let totals = self.stats.cumulative();
        let drops = self.stats.drops();
        info!(
            frames = totals.frames_processed,
            bees_in = totals.bees_in,
            bees_out = totals.bees_out,
            varroa = totals.varroa_count,
            dropped_extraction = drops.extraction_requests,
            dropped_classification = drops.classification_requests,
            dropped_visualization = drops.visualization,
            orphaned = drops.orphaned_results,
            "pipeline stopped"
        );
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ColorMode, FrameSpec};
    use crate::input::tests::MockCapture;
    use crate::pipeline::classify::tests::MockEngine;

    fn config() -> PipelineConfig {
        PipelineConfig {
            frame_config: vec![
                FrameSpec::new(96, 64, ColorMode::Color),
                FrameSpec::new(48, 32, ColorMode::Color),
                FrameSpec::new(32, 24, ColorMode::Color),
            ],
            nn_calibration_dir: "no-such-dir".into(),
            limit_fps_to: 1000.0,
            telemetry_interval_secs: 3600,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_missing_engine_is_configuration_error() {
        let config = config();
        let components = Components::new(Box::new(MockCapture::numbered(1, 96, 64)), 4, &config);
        assert!(matches!(
            Pipeline::build(config, components),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn test_invalid_config_is_rejected_before_start() {
        let mut config = config();
        config.frame_config.truncate(2);
        let components = Components::new(Box::new(MockCapture::numbered(1, 96, 64)), 4, &config)
            .with_engine(Box::new(MockEngine::new()));
        assert!(matches!(
            Pipeline::build(config, components),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn test_runs_until_source_is_exhausted() {
        let config = config();
        let components = Components::new(Box::new(MockCapture::numbered(12, 96, 64)), 4, &config)
            .with_engine(Box::new(MockEngine::new()));
        let mut pipeline = Pipeline::build(config, components).unwrap();
        pipeline.start().unwrap();

        let shutdown = AtomicBool::new(false);
        assert_eq!(pipeline.run_until(&shutdown), RunOutcome::SourceExhausted);
        let outcomes = pipeline.stop();

        let names: Vec<&str> = outcomes.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(
            names,
            vec!["frame_source", "detection", "extraction", "classification", "telemetry"]
        );
        assert!(outcomes
            .iter()
            .all(|(_, outcome)| *outcome == StopOutcome::GracefullyFinished));
        // 最后一帧可能仍在处理中
        assert!(pipeline.stats().cumulative().frames_processed >= 11);
    }

    #[test]
    fn test_model_load_failure_aborts_start() {
        let config = config();
        let mut engine = MockEngine::new();
        engine.fail_load = true;
        let components = Components::new(Box::new(MockCapture::numbered(3, 96, 64)), 4, &config)
            .with_engine(Box::new(engine));
        let mut pipeline = Pipeline::build(config, components).unwrap();

        assert!(matches!(pipeline.start(), Err(PipelineError::ModelLoad(_))));
        pipeline.stop();
        assert_eq!(pipeline.stats().cumulative().frames_processed, 0);
    }

    #[test]
    fn test_shutdown_flag_interrupts() {
        let mut config = config();
        config.nn_enable = false;
        config.limit_fps_to = 5.0;
        let components = Components::new(Box::new(MockCapture::numbered(50, 96, 64)), 4, &config);
        let mut pipeline = Pipeline::build(config, components).unwrap();
        pipeline.start().unwrap();

        let shutdown = AtomicBool::new(true);
        assert_eq!(pipeline.run_until(&shutdown), RunOutcome::Interrupted);
        pipeline.stop();
    }
}
