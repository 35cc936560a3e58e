/// 检测阶段 (DetectionStage)
/// 职责: 接收FrameSet → 斑块检测 → 跟踪 → 截取请求 / 可视化负载 / 统计
///
/// 每次循环:
/// 1. 非阻塞取回全部分类结果并交给对应轨迹 (轨迹已结束则直接计入统计)
/// 2. 非阻塞取一个帧集合, 没有则短暂休眠
/// 3. 在最小帧上检测, 结果为跟踪坐标
/// 4. 结束的轨迹按方向与标签计数
/// 5. 截取请求与可视化负载都用 try_send, 通道满时丢弃并计数
/// 6. 按帧率上限节流
use std::time::{Duration, Instant};

use crossbeam_channel::{TryRecvError, TrySendError};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::detection::{detect_bees, BlobDetections, DetectionParams};
use crate::error::{PipelineError, Result};
use crate::frame::FrameSet;
use crate::statistics::SharedStatistics;
use crate::supervisor::{Channel, Stage, StageContext};
use crate::tracking::{Direction, TrackEvent, Tracker};

use super::messages::{
    ClassificationResult, ExtractionRequest, VisualizationFrame, CLASSIFICATION_RESULTS,
    EXTRACTION_REQUESTS, FRAME_SETS, VISUALIZATION,
};

/// 吞吐量日志间隔 (帧)
const FPS_LOG_INTERVAL: u64 = 100;
/// 输入为空时的休眠
const IDLE_PAUSE: Duration = Duration::from_millis(10);

/// 检测阶段的运行参数
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionSettings {
    /// 检测坐标 → 跟踪坐标
    pub detection_scale: f32,
    pub enable_tracking: bool,
    pub enable_extraction: bool,
    pub extract_frame_step: u32,
    /// 跟踪坐标 → 截取帧坐标 (截取帧为帧集合中的最大帧)
    pub scale_factor: u32,
    /// 可视化使用的帧 (与跟踪坐标同尺度)
    pub tracking_frame_index: usize,
    pub visualization: bool,
    pub visualization_skip: u64,
    pub frame_budget: Duration,
}

impl From<&PipelineConfig> for DetectionSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            detection_scale: config.detection_scale(),
            enable_tracking: config.enable_tracking,
            enable_extraction: config.enable_tracking && config.enable_image_extraction,
            extract_frame_step: config.extract_frame_step,
            scale_factor: config.nn_extract_resolution.scale_factor(),
            tracking_frame_index: config.tracking_frame_index().unwrap_or(0),
            visualization: config.visualization_enabled,
            visualization_skip: config.visualization_frame_skip.max(1),
            frame_budget: config.frame_budget(),
        }
    }
}

pub struct DetectionStage {
    tracker: Box<dyn Tracker>,
    params: DetectionParams,
    settings: DetectionSettings,
    stats: SharedStatistics,

    // 统计
    count: u64,
    last: Instant,
    current_fps: f64,
}

impl DetectionStage {
    pub fn new(
        tracker: Box<dyn Tracker>,
        params: DetectionParams,
        settings: DetectionSettings,
        stats: SharedStatistics,
    ) -> Self {
        Self {
            tracker,
            params,
            settings,
            stats,
            count: 0,
            last: Instant::now(),
            current_fps: 0.0,
        }
    }

    /// 分类结果回送到轨迹, 轨迹已结束时直接计数
    fn deliver(&mut self, result: ClassificationResult) {
        match self.tracker.track_by_id(result.track_id) {
            Some(track) => track.image_classification_complete(result.labels),
            None => {
                debug!(track = result.track_id, labels = ?result.labels, "result for ended track");
                self.stats.add_orphaned_result(&result.labels);
            }
        }
    }

    fn record(&self, event: TrackEvent) {
        match event {
            TrackEvent::Ended {
                id,
                direction,
                labels,
            } => {
                match direction {
                    Direction::In => self.stats.bee_in(),
                    Direction::Out => self.stats.bee_out(),
                    Direction::Undecided => {}
                }
                debug!(track = id, ?direction, ?labels, "track ended");
                self.stats.add_classification_result(&labels);
            }
        }
    }

    fn request_extraction(
        &mut self,
        frame_set: &FrameSet,
        channel: &Channel<ExtractionRequest>,
    ) -> Result<()> {
        let positions = self
            .tracker
            .last_bee_positions(self.settings.extract_frame_step);
        if positions.is_empty() {
            return Ok(());
        }
        let Some(frame) = frame_set.largest() else {
            return Ok(());
        };

        let request = ExtractionRequest {
            positions,
            frame: frame.clone(),
            scale_factor: self.settings.scale_factor,
            frame_id: frame_set.sequence(),
        };
        match channel.sender().try_send(request) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.stats.extraction_dropped();
                debug!(frame = frame_set.sequence(), "extraction queue full, request dropped");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(PipelineError::ChannelClosed(EXTRACTION_REQUESTS))
            }
        }
    }

    fn publish_visualization(
        &self,
        frame_set: &FrameSet,
        blobs: BlobDetections,
        channel: &Channel<VisualizationFrame>,
    ) {
        if frame_set.sequence() % self.settings.visualization_skip != 0 {
            return;
        }
        let Some(frame) = frame_set.frame(self.settings.tracking_frame_index) else {
            return;
        };

        let payload = VisualizationFrame {
            frame: frame.clone(),
            frame_id: frame_set.sequence(),
            detections: blobs.detections,
            groups: blobs.groups,
            tracks: self.tracker.snapshot(),
            fps: self.current_fps,
        };
        // 可视化是尽力而为的
        if channel.sender().try_send(payload).is_err() {
            self.stats.visualization_dropped();
        }
    }

    fn update_fps(&mut self) {
        self.count += 1;
        if self.count % FPS_LOG_INTERVAL == 0 {
            let elapsed = self.last.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                self.current_fps = FPS_LOG_INTERVAL as f64 / elapsed;
            }
            self.last = Instant::now();
            debug!(
                fps = %format!("{:.1}", self.current_fps),
                frames = self.count,
                tracks = self.tracker.snapshot().len(),
                "detection throughput"
            );
        }
    }
}

impl Stage for DetectionStage {
    fn name(&self) -> &str {
        "detection"
    }

    fn required_channels(&self) -> Vec<&'static str> {
        let mut channels = vec![FRAME_SETS, CLASSIFICATION_RESULTS];
        if self.settings.enable_extraction {
            channels.push(EXTRACTION_REQUESTS);
        }
        if self.settings.visualization {
            channels.push(VISUALIZATION);
        }
        channels
    }

    fn run(mut self: Box<Self>, ctx: StageContext) -> Result<()> {
        let frames: Channel<FrameSet> = ctx.channel(FRAME_SETS)?;
        let results: Channel<ClassificationResult> = ctx.channel(CLASSIFICATION_RESULTS)?;
        let extraction: Option<Channel<ExtractionRequest>> = if self.settings.enable_extraction {
            Some(ctx.channel(EXTRACTION_REQUESTS)?)
        } else {
            None
        };
        let visualization: Option<Channel<VisualizationFrame>> = if self.settings.visualization {
            Some(ctx.channel(VISUALIZATION)?)
        } else {
            None
        };
        info!(
            scale = self.settings.detection_scale,
            tracking = self.settings.enable_tracking,
            extraction = extraction.is_some(),
            visualization = visualization.is_some(),
            "detection running"
        );

        while !ctx.should_stop() {
            // 帧率上限按整轮计时, 包括结果回送
            let iteration = Instant::now();

            // 1. 分类结果
            while let Ok(result) = results.receiver().try_recv() {
                self.deliver(result);
            }

            // 2. 帧集合
            let frame_set = match frames.receiver().try_recv() {
                Ok(frame_set) => frame_set,
                Err(TryRecvError::Empty) => {
                    ctx.sleep(IDLE_PAUSE);
                    continue;
                }
                Err(TryRecvError::Disconnected) => {
                    return Err(PipelineError::ChannelClosed(FRAME_SETS))
                }
            };

            // 3. 检测
            let Some(small) = frame_set.smallest() else {
                warn!(frame = frame_set.sequence(), "empty frame set");
                continue;
            };
            let blobs = detect_bees(&small.to_rgb(), self.settings.detection_scale, &self.params);

            // 4. 跟踪
            if self.settings.enable_tracking {
                for event in self.tracker.update(&blobs.detections, &blobs.groups) {
                    self.record(event);
                }
                if let Some(channel) = &extraction {
                    self.request_extraction(&frame_set, channel)?;
                }
            }

            // 5. 可视化
            if let Some(channel) = &visualization {
                self.publish_visualization(&frame_set, blobs, channel);
            }

            self.stats.frame_processed();
            self.update_fps();

            // 6. 帧率上限
            let elapsed = iteration.elapsed();
            if elapsed < self.settings.frame_budget {
                ctx.sleep(self.settings.frame_budget - elapsed);
            }
        }

        info!(frames = self.count, "detection stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::blob::tests::scene;
    use crate::frame::FrameImage;
    use crate::statistics::StatisticsRegistry;
    use crate::supervisor::{StopOutcome, Supervisor};
    use crate::tracking::{NearestTracker, TrackerParams};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn settings() -> DetectionSettings {
        DetectionSettings {
            detection_scale: 1.0,
            enable_tracking: true,
            enable_extraction: true,
            extract_frame_step: 1,
            scale_factor: 2,
            tracking_frame_index: 1,
            visualization: true,
            visualization_skip: 1,
            frame_budget: Duration::ZERO,
        }
    }

    /// 最大帧 (2倍) + 检测帧, 蜜蜂圆心 (x, y) 半径12
    fn frame_set(sequence: u64, bees: &[(i32, i32)]) -> FrameSet {
        let blobs: Vec<(i32, i32, i32)> = bees.iter().map(|&(x, y)| (x, y, 12)).collect();
        let large: Vec<(i32, i32, i32)> = bees.iter().map(|&(x, y)| (x * 2, y * 2, 24)).collect();
        FrameSet::new(
            sequence,
            vec![
                Arc::new(FrameImage::Color(scene(320, 240, &large))),
                Arc::new(FrameImage::Color(scene(160, 120, &blobs))),
            ],
        )
    }

    struct Harness {
        supervisor: Supervisor,
        frames: Channel<FrameSet>,
        results: Channel<ClassificationResult>,
        extraction: Channel<ExtractionRequest>,
        visualization: Channel<VisualizationFrame>,
        stats: SharedStatistics,
    }

    fn harness(settings: DetectionSettings) -> Harness {
        let stats = StatisticsRegistry::shared();
        let stage = DetectionStage::new(
            Box::new(NearestTracker::new(TrackerParams {
                max_distance: 30.0,
                max_lost_frames: 1,
                min_travel: 20.0,
            })),
            DetectionParams::default(),
            settings,
            Arc::clone(&stats),
        );
        let frames = Channel::bounded(FRAME_SETS, 16);
        let results = Channel::unbounded(CLASSIFICATION_RESULTS);
        let extraction = Channel::bounded(EXTRACTION_REQUESTS, 64);
        let visualization = Channel::bounded(VISUALIZATION, 1);

        let mut supervisor = Supervisor::new(stage);
        supervisor.register_channel(&frames);
        supervisor.register_channel(&results);
        supervisor.register_channel(&extraction);
        supervisor.register_channel(&visualization);
        Harness {
            supervisor,
            frames,
            results,
            extraction,
            visualization,
            stats,
        }
    }

    fn wait_for_frames(stats: &SharedStatistics, frames: u64) {
        let start = Instant::now();
        while stats.cumulative().frames_processed < frames
            && start.elapsed() < Duration::from_secs(10)
        {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(stats.cumulative().frames_processed, frames);
    }

    #[test]
    fn test_bee_moving_up_is_counted_in() {
        let mut h = harness(settings());
        h.supervisor.start().unwrap();

        // 蜜蜂从 y=90 向上移动到 y=40, 然后消失
        for (seq, y) in [90, 80, 70, 60, 50, 40].into_iter().enumerate() {
            h.frames.sender().send(frame_set(seq as u64, &[(80, y)])).unwrap();
        }
        for seq in 6..9 {
            h.frames.sender().send(frame_set(seq, &[])).unwrap();
        }
        wait_for_frames(&h.stats, 9);

        let cumulative = h.stats.cumulative();
        assert_eq!(cumulative.bees_in, 1);
        assert_eq!(cumulative.bees_out, 0);
        assert_eq!(h.supervisor.stop(), StopOutcome::GracefullyFinished);
    }

    #[test]
    fn test_frame_budget_paces_each_iteration() {
        let mut h = harness(DetectionSettings {
            frame_budget: Duration::from_millis(50),
            ..settings()
        });
        for seq in 0..4 {
            h.frames.sender().send(frame_set(seq, &[])).unwrap();
        }
        let start = Instant::now();
        h.supervisor.start().unwrap();
        wait_for_frames(&h.stats, 4);

        // 前三轮都等满预算后才处理第四帧
        assert!(start.elapsed() >= Duration::from_millis(140));
        assert_eq!(h.supervisor.stop(), StopOutcome::GracefullyFinished);
    }

    #[test]
    fn test_extraction_request_uses_largest_frame() {
        let mut h = harness(settings());
        h.supervisor.start().unwrap();
        h.frames.sender().send(frame_set(0, &[(80, 60)])).unwrap();
        wait_for_frames(&h.stats, 1);

        let request = h
            .extraction
            .receiver()
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        assert_eq!(request.frame_id, 0);
        assert_eq!(request.scale_factor, 2);
        assert_eq!(request.frame.width(), 320);
        assert_eq!(request.positions.len(), 1);
        let (_, position) = request.positions[0];
        assert!((position.cx - 80.0).abs() < 2.0);
        assert!((position.cy - 60.0).abs() < 2.0);

        let payload = h.visualization.receiver().try_recv().unwrap();
        assert_eq!(payload.frame.width(), 160);
        assert_eq!(payload.detections.len(), 1);
        assert_eq!(payload.tracks.len(), 1);
        h.supervisor.stop();
    }

    #[test]
    fn test_full_visualization_channel_counts_drops() {
        let mut h = harness(settings());
        h.supervisor.start().unwrap();
        for seq in 0..3 {
            h.frames.sender().send(frame_set(seq, &[])).unwrap();
        }
        wait_for_frames(&h.stats, 3);

        // 容量1, 无人消费
        assert_eq!(h.stats.drops().visualization, 2);
        h.supervisor.stop();
    }

    #[test]
    fn test_result_for_unknown_track_is_orphaned() {
        let mut h = harness(settings());
        h.supervisor.start().unwrap();
        h.results
            .sender()
            .send(ClassificationResult {
                track_id: 999,
                labels: BTreeSet::from(["varroa".to_string()]),
            })
            .unwrap();
        h.frames.sender().send(frame_set(0, &[])).unwrap();
        wait_for_frames(&h.stats, 1);

        assert_eq!(h.stats.drops().orphaned_results, 1);
        assert_eq!(h.stats.cumulative().varroa_count, 1);
        h.supervisor.stop();
    }

    #[test]
    fn test_labels_reach_live_track() {
        let mut h = harness(settings());
        h.supervisor.start().unwrap();
        h.frames.sender().send(frame_set(0, &[(80, 60)])).unwrap();
        wait_for_frames(&h.stats, 1);
        let request = h
            .extraction
            .receiver()
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        let (track_id, _) = request.positions[0];

        h.results
            .sender()
            .send(ClassificationResult {
                track_id,
                labels: BTreeSet::from(["varroa".to_string()]),
            })
            .unwrap();
        // 结果在下一帧之前处理, 之后轨迹丢失两帧结束
        for seq in 1..4 {
            h.frames.sender().send(frame_set(seq, &[])).unwrap();
        }
        wait_for_frames(&h.stats, 4);

        assert_eq!(h.stats.drops().orphaned_results, 0);
        assert_eq!(h.stats.cumulative().varroa_count, 1);
        h.supervisor.stop();
    }

    #[test]
    fn test_tracking_disabled_skips_extraction() {
        let mut s = settings();
        s.enable_tracking = false;
        s.enable_extraction = false;
        let mut h = harness(s);
        h.supervisor.start().unwrap();
        h.frames.sender().send(frame_set(0, &[(80, 60)])).unwrap();
        wait_for_frames(&h.stats, 1);

        assert!(h.extraction.is_empty());
        let payload = h.visualization.receiver().try_recv().unwrap();
        assert_eq!(payload.detections.len(), 1);
        assert!(payload.tracks.is_empty());
        h.supervisor.stop();
    }
}
