/// 视频输入系统 (Video Input System)
///
/// 独立工作线程,负责读取视频帧并生成帧集合
/// - ImageSequenceCapture: 图片目录 (按文件名顺序)
/// - FfmpegCapture:        摄像头 / 视频文件 (需要 ffmpeg 特性)
/// - FrameSource:          帧集合生产阶段, 输出通道满时暂停读取而不是丢帧
use std::path::PathBuf;
use std::time::{Duration, Instant};

use image::RgbImage;
use tracing::{debug, error, info};

use crate::config::{FrameSpec, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::frame::{FrameSet, FrameSetBuilder};
use crate::pipeline::FRAME_SETS;
use crate::supervisor::{Channel, Stage, StageContext};

pub mod decoded;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod sequence;

#[cfg(feature = "ffmpeg")]
pub use ffmpeg::FfmpegCapture;
pub use decoded::DecodedFrames;
pub use sequence::ImageSequenceCapture;

/// 诊断日志间隔 (帧数 / 暂停次数)
const DIAGNOSTIC_INTERVAL: u64 = 100;

// ========== 视频输入接口 ==========

/// 视频输入
pub trait VideoCapture: Send {
    /// 读取下一帧, `None` 表示流结束
    fn read(&mut self) -> Result<Option<RgbImage>>;

    fn describe(&self) -> String;
}

/// 输入源: 摄像头编号或视频文件 (二选一)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureSource {
    Camera(u32),
    Video(PathBuf),
}

impl CaptureSource {
    /// 摄像头与视频文件二选一
    pub fn from_options(camera: Option<u32>, video: Option<PathBuf>) -> Result<Self> {
        match (camera, video) {
            (Some(index), None) => Ok(CaptureSource::Camera(index)),
            (None, Some(path)) => Ok(CaptureSource::Video(path)),
            (None, None) => Err(PipelineError::config(
                "either a camera index or a video path has to be provided",
            )),
            (Some(_), Some(_)) => Err(PipelineError::config(
                "camera index and video path are mutually exclusive",
            )),
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, CaptureSource::Camera(_))
    }

    /// 摄像头按硬件节奏, 文件播放可容忍更大的缓冲
    pub fn buffer_length(&self, config: &PipelineConfig) -> usize {
        if self.is_live() {
            config.frame_set_buffer_length_camera
        } else {
            config.frame_set_buffer_length_video
        }
    }
}

/// 打开输入源
pub fn open_capture(source: &CaptureSource, config: &PipelineConfig) -> Result<Box<dyn VideoCapture>> {
    match source {
        CaptureSource::Video(path) if path.is_dir() => {
            Ok(Box::new(ImageSequenceCapture::open(path)?))
        }
        #[cfg(feature = "ffmpeg")]
        other => Ok(Box::new(FfmpegCapture::open(other, config.use_hw_decode)?)),
        #[cfg(not(feature = "ffmpeg"))]
        other => {
            let _ = config;
            Err(PipelineError::config(format!(
                "{other:?} needs the ffmpeg feature, only image directories can be played without it"
            )))
        }
    }
}

// ========== 帧集合生产阶段 ==========

pub struct FrameSource {
    capture: Box<dyn VideoCapture>,
    builder: FrameSetBuilder,
    full_pause: Duration,
}

impl FrameSource {
    pub fn new(
        capture: Box<dyn VideoCapture>,
        specs: Vec<FrameSpec>,
        full_pause: Duration,
    ) -> Result<Self> {
        for (num, spec) in specs.iter().enumerate() {
            if spec.width == 0 || spec.height == 0 {
                return Err(PipelineError::config(format!(
                    "frame config entry {} has a zero dimension",
                    num + 1
                )));
            }
        }
        Ok(Self {
            capture,
            builder: FrameSetBuilder::new(specs)?,
            full_pause,
        })
    }
}

impl Stage for FrameSource {
    fn name(&self) -> &str {
        "frame_source"
    }

    fn required_channels(&self) -> Vec<&'static str> {
        vec![FRAME_SETS]
    }

    fn run(mut self: Box<Self>, ctx: StageContext) -> Result<()> {
        let out: Channel<FrameSet> = ctx.channel(FRAME_SETS)?;
        info!(source = %self.capture.describe(), capacity = ?out.capacity(), "frame source running");

        let mut sequence = 0u64;
        let mut stalls = 0u64;
        let mut last = Instant::now();

        while !ctx.should_stop() {
            // 输出通道满: 暂停读取, 已读取的帧不会丢弃
            if out.is_full() {
                stalls += 1;
                if stalls % DIAGNOSTIC_INTERVAL == 0 {
                    debug!(stalls, buffered = out.len(), "frame set buffer full");
                }
                ctx.sleep(self.full_pause);
                continue;
            }

            let image = match self.capture.read() {
                Ok(Some(image)) => image,
                Ok(None) => {
                    info!(frames = sequence, "video stream ended");
                    return Err(PipelineError::StreamEnded);
                }
                Err(e) => {
                    error!("failed to read frame: {}", e);
                    return Err(e);
                }
            };
            let (width, height) = image.dimensions();

            let frame_set = self.builder.build(image, sequence)?;
            // 单一生产者, 已确认未满
            out.sender()
                .send(frame_set)
                .map_err(|_| PipelineError::ChannelClosed(FRAME_SETS))?;
            sequence += 1;

            if sequence % DIAGNOSTIC_INTERVAL == 0 {
                let fps = DIAGNOSTIC_INTERVAL as f64 / last.elapsed().as_secs_f64();
                debug!(
                    fps = %format!("{fps:.1}"),
                    resolution = %format!("{width}x{height}"),
                    buffered = out.len(),
                    "frame source throughput"
                );
                last = Instant::now();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::ColorMode;
    use crate::supervisor::{StopOutcome, Supervisor};
    use image::Rgb;
    use std::collections::VecDeque;

    /// 预先准备好帧的输入, 每帧左上角像素编码帧号
    pub(crate) struct MockCapture {
        frames: VecDeque<RgbImage>,
        fail_at_end: bool,
    }

    impl MockCapture {
        pub(crate) fn numbered(count: u8, width: u32, height: u32) -> Self {
            let frames = (0..count)
                .map(|n| RgbImage::from_pixel(width, height, Rgb([n, 0, 0])))
                .collect();
            Self {
                frames,
                fail_at_end: false,
            }
        }
    }

    impl VideoCapture for MockCapture {
        fn read(&mut self) -> Result<Option<RgbImage>> {
            match self.frames.pop_front() {
                Some(frame) => Ok(Some(frame)),
                None if self.fail_at_end => Err(PipelineError::device("camera unplugged")),
                None => Ok(None),
            }
        }

        fn describe(&self) -> String {
            "mock".to_string()
        }
    }

    fn specs() -> Vec<FrameSpec> {
        vec![FrameSpec::new(8, 8, ColorMode::Color)]
    }

    #[test]
    fn test_source_selection() {
        assert_eq!(
            CaptureSource::from_options(Some(0), None).unwrap(),
            CaptureSource::Camera(0)
        );
        assert!(CaptureSource::from_options(None, None).is_err());
        assert!(CaptureSource::from_options(Some(1), Some("clip".into())).is_err());

        let config = PipelineConfig::default();
        assert_eq!(CaptureSource::Camera(0).buffer_length(&config), 10);
        assert_eq!(CaptureSource::Video("a".into()).buffer_length(&config), 50);
    }

    #[test]
    fn test_zero_dimension_is_rejected() {
        let result = FrameSource::new(
            Box::new(MockCapture::numbered(1, 8, 8)),
            vec![FrameSpec::new(0, 8, ColorMode::Color)],
            Duration::from_millis(1),
        );
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn test_stalls_instead_of_dropping_when_full() {
        let channel = Channel::<FrameSet>::bounded(FRAME_SETS, 1);
        let source = FrameSource::new(
            Box::new(MockCapture::numbered(4, 8, 8)),
            specs(),
            Duration::from_millis(5),
        )
        .unwrap();
        let mut supervisor = Supervisor::new(source);
        supervisor.register_channel(&channel);
        supervisor.start().unwrap();

        // 慢消费者
        let mut received = Vec::new();
        while received.len() < 4 {
            std::thread::sleep(Duration::from_millis(30));
            assert!(channel.len() <= 1);
            if let Ok(set) = channel
                .receiver()
                .recv_timeout(Duration::from_secs(5))
            {
                received.push(set.sequence());
            }
        }
        assert_eq!(received, vec![0, 1, 2, 3]);
        assert_eq!(supervisor.stop(), StopOutcome::GracefullyFinished);
    }

    #[test]
    fn test_device_failure_finishes_stage() {
        let channel = Channel::<FrameSet>::bounded(FRAME_SETS, 4);
        let capture = MockCapture {
            frames: VecDeque::new(),
            fail_at_end: true,
        };
        let source = FrameSource::new(Box::new(capture), specs(), Duration::from_millis(5)).unwrap();
        let mut supervisor = Supervisor::new(source);
        supervisor.register_channel(&channel);
        supervisor.start().unwrap();

        let start = Instant::now();
        while !supervisor.is_finished() && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(supervisor.is_finished());
        assert_eq!(supervisor.stop(), StopOutcome::GracefullyFinished);
    }
}
