//! 截取阶段 (ExtractionStage)
//!
//! 截取请求 → 每个跟踪位置截取一张分类器尺寸的旋转图像 → 清晰度过滤 → 分类请求。
//! 截取失败 (窗口越界) 或不够清晰的位置直接跳过, 分类通道满时丢弃并计数。

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crossbeam_channel::{TryRecvError, TrySendError};
use image::RgbImage;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::statistics::SharedStatistics;
use crate::supervisor::{Channel, Stage, StageContext};
use crate::utils::crop::crop_with_sharpness;
use crate::utils::gen_time_string;

use super::messages::{
    ClassificationRequest, ExtractionRequest, CLASSIFICATION_REQUESTS, EXTRACTION_REQUESTS,
};

#[derive(Clone, Debug, PartialEq)]
pub struct ExtractionSettings {
    /// 分类器输入尺寸 (宽, 高)
    pub classifier_size: (u32, u32),
    pub min_sharpness: f64,
    pub idle_pause: Duration,
    /// 关闭分类时只保存截图
    pub forward_to_classifier: bool,
    pub save_dir: Option<PathBuf>,
}

impl From<&PipelineConfig> for ExtractionSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            classifier_size: config.nn_extract_resolution.classifier_size(),
            min_sharpness: config.extract_min_sharpness,
            idle_pause: config.extraction_idle_pause(),
            forward_to_classifier: config.nn_enable,
            save_dir: config
                .save_extracted_images
                .then(|| config.save_extracted_images_path.clone()),
        }
    }
}

pub struct ExtractionStage {
    settings: ExtractionSettings,
    stats: SharedStatistics,
    extracted: u64,
}

impl ExtractionStage {
    pub fn new(settings: ExtractionSettings, stats: SharedStatistics) -> Self {
        Self {
            settings,
            stats,
            extracted: 0,
        }
    }

    fn save(&self, image: &RgbImage) {
        let Some(dir) = &self.settings.save_dir else {
            return;
        };
        let path = dir.join(format!("{}-{}.jpeg", self.extracted, gen_time_string()));
        if let Err(e) = image.save(&path) {
            warn!(path = %path.display(), "failed to save extracted image: {}", e);
        }
    }

    fn process(
        &mut self,
        ctx: &StageContext,
        request: ExtractionRequest,
        out: Option<&Channel<ClassificationRequest>>,
    ) -> Result<()> {
        let frame = request.frame.to_rgb();
        let scale = request.scale_factor as f32;

        for (track_id, position) in &request.positions {
            if ctx.should_stop() {
                break;
            }
            let (crop, score) =
                crop_with_sharpness(&frame, position, scale, self.settings.classifier_size);
            let Some(image) = crop else {
                continue;
            };
            if score < self.settings.min_sharpness {
                debug!(track = track_id, sharpness = score, "crop too blurry");
                continue;
            }

            self.extracted += 1;
            self.save(&image);

            let Some(out) = out else {
                continue;
            };
            let message = ClassificationRequest {
                track_id: *track_id,
                image,
                frame_id: request.frame_id,
            };
            match out.sender().try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => self.stats.classification_dropped(),
                Err(TrySendError::Disconnected(_)) => {
                    return Err(PipelineError::ChannelClosed(CLASSIFICATION_REQUESTS))
                }
            }
        }
        Ok(())
    }
}

impl Stage for ExtractionStage {
    fn name(&self) -> &str {
        "extraction"
    }

    fn required_channels(&self) -> Vec<&'static str> {
        if self.settings.forward_to_classifier {
            vec![EXTRACTION_REQUESTS, CLASSIFICATION_REQUESTS]
        } else {
            vec![EXTRACTION_REQUESTS]
        }
    }

    fn run(mut self: Box<Self>, ctx: StageContext) -> Result<()> {
        let requests: Channel<ExtractionRequest> = ctx.channel(EXTRACTION_REQUESTS)?;
        let out: Option<Channel<ClassificationRequest>> = if self.settings.forward_to_classifier {
            Some(ctx.channel(CLASSIFICATION_REQUESTS)?)
        } else {
            None
        };
        if let Some(dir) = &self.settings.save_dir {
            fs::create_dir_all(dir)?;
        }
        info!(
            size = ?self.settings.classifier_size,
            min_sharpness = self.settings.min_sharpness,
            "extraction running"
        );

        while !ctx.should_stop() {
            match requests.receiver().try_recv() {
                Ok(request) => self.process(&ctx, request, out.as_ref())?,
                Err(TryRecvError::Empty) => ctx.sleep(self.settings.idle_pause),
                Err(TryRecvError::Disconnected) => {
                    return Err(PipelineError::ChannelClosed(EXTRACTION_REQUESTS))
                }
            }
        }

        info!(extracted = self.extracted, "extraction stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Ellipse;
    use crate::frame::FrameImage;
    use crate::statistics::StatisticsRegistry;
    use crate::supervisor::Supervisor;
    use image::Rgb;
    use std::sync::Arc;
    use std::time::Instant;

    fn checkerboard(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            if (x / 3 + y / 3) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        })
    }

    fn settings() -> ExtractionSettings {
        ExtractionSettings {
            classifier_size: (20, 40),
            min_sharpness: 50.0,
            idle_pause: Duration::from_millis(2),
            forward_to_classifier: true,
            save_dir: None,
        }
    }

    fn request(frame: RgbImage, positions: Vec<(u64, Ellipse)>) -> ExtractionRequest {
        ExtractionRequest {
            positions,
            frame: Arc::new(FrameImage::Color(frame)),
            scale_factor: 2,
            frame_id: 7,
        }
    }

    fn start(
        settings: ExtractionSettings,
        capacity: usize,
    ) -> (
        Supervisor,
        Channel<ExtractionRequest>,
        Channel<ClassificationRequest>,
        SharedStatistics,
    ) {
        let stats = StatisticsRegistry::shared();
        let requests = Channel::bounded(EXTRACTION_REQUESTS, 8);
        let out = Channel::bounded(CLASSIFICATION_REQUESTS, capacity);
        let mut supervisor = Supervisor::new(ExtractionStage::new(settings, Arc::clone(&stats)));
        supervisor.register_channel(&requests);
        supervisor.register_channel(&out);
        supervisor.start().unwrap();
        (supervisor, requests, out, stats)
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let start = Instant::now();
        while !done() && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_sharp_crop_is_forwarded() {
        let (mut supervisor, requests, out, _) = start(settings(), 4);
        let position = Ellipse::new(50.0, 50.0, 12.0, 6.0, 90.0);
        requests
            .sender()
            .send(request(checkerboard(200, 200), vec![(3, position)]))
            .unwrap();

        let message = out.receiver().recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(message.track_id, 3);
        assert_eq!(message.frame_id, 7);
        assert_eq!(message.image.dimensions(), (20, 40));
        supervisor.stop();
    }

    #[test]
    fn test_blurry_and_out_of_frame_crops_are_skipped() {
        let (mut supervisor, requests, out, _) = start(settings(), 4);
        let flat = RgbImage::from_pixel(200, 200, Rgb([90, 90, 90]));
        requests
            .sender()
            .send(request(
                flat,
                vec![(1, Ellipse::new(50.0, 50.0, 12.0, 6.0, 90.0))],
            ))
            .unwrap();
        requests
            .sender()
            .send(request(
                checkerboard(200, 200),
                vec![(2, Ellipse::new(2.0, 2.0, 12.0, 6.0, 90.0))],
            ))
            .unwrap();

        wait_until(|| requests.is_empty());
        std::thread::sleep(Duration::from_millis(50));
        assert!(out.is_empty());
        supervisor.stop();
    }

    #[test]
    fn test_full_classification_channel_counts_drops() {
        let (mut supervisor, requests, out, stats) = start(settings(), 1);
        let positions = (0..3)
            .map(|id| (id, Ellipse::new(30.0 + id as f32 * 20.0, 50.0, 12.0, 6.0, 90.0)))
            .collect();
        requests
            .sender()
            .send(request(checkerboard(300, 200), positions))
            .unwrap();

        wait_until(|| stats.drops().classification_requests == 2);
        assert_eq!(stats.drops().classification_requests, 2);
        assert_eq!(out.len(), 1);
        supervisor.stop();
    }

    #[test]
    fn test_saves_crops_without_classifier() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = settings();
        s.forward_to_classifier = false;
        s.save_dir = Some(dir.path().to_path_buf());

        let stats = StatisticsRegistry::shared();
        let requests = Channel::bounded(EXTRACTION_REQUESTS, 8);
        let mut supervisor = Supervisor::new(ExtractionStage::new(s, stats));
        supervisor.register_channel(&requests);
        supervisor.start().unwrap();

        requests
            .sender()
            .send(request(
                checkerboard(200, 200),
                vec![(1, Ellipse::new(50.0, 50.0, 12.0, 6.0, 90.0))],
            ))
            .unwrap();
        wait_until(|| std::fs::read_dir(dir.path()).map(|d| d.count()).unwrap_or(0) == 1);
        supervisor.stop();

        let saved: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(saved.len(), 1);
    }
}
