//! 可视化快照 (SnapshotWriter)
//!
//! 把最新的可视化负载画成一张JPEG: 单只蜜蜂绿色, 蜂群红色, 轨迹黄色
//! (带分类标签时洋红色), 轨迹线按ID着色。先写临时文件再改名, 读取方不会看到半张图。

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crossbeam_channel::TryRecvError;
use image::{ImageFormat, Rgb, RgbImage};
use imageproc::drawing::{draw_cross_mut, draw_line_segment_mut};
use tracing::{debug, info, warn};

use crate::detection::Ellipse;
use crate::error::{PipelineError, Result};
use crate::supervisor::{Channel, Stage, StageContext};

use super::messages::{VisualizationFrame, VISUALIZATION};

const DETECTION_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const GROUP_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const TRACK_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
const LABELLED_COLOR: Rgb<u8> = Rgb([255, 0, 255]);
/// 椭圆折线段数
const ELLIPSE_SEGMENTS: usize = 36;
const IDLE_PAUSE: Duration = Duration::from_millis(20);

/// 画椭圆轮廓
pub fn draw_ellipse_mut(canvas: &mut RgbImage, ellipse: &Ellipse, color: Rgb<u8>) {
    let (sin, cos) = ellipse.angle.to_radians().sin_cos();
    let point = |i: usize| {
        let t = i as f32 / ELLIPSE_SEGMENTS as f32 * std::f32::consts::TAU;
        let (x, y) = (ellipse.a * t.cos(), ellipse.b * t.sin());
        (ellipse.cx + x * cos - y * sin, ellipse.cy + x * sin + y * cos)
    };
    for i in 0..ELLIPSE_SEGMENTS {
        draw_line_segment_mut(canvas, point(i), point(i + 1), color);
    }
}

/// 可视化负载 → 标注后的图像
pub fn render(payload: &VisualizationFrame) -> RgbImage {
    let mut canvas = payload.frame.to_rgb().into_owned();

    for group in &payload.groups {
        draw_ellipse_mut(&mut canvas, group, GROUP_COLOR);
    }
    for detection in &payload.detections {
        draw_ellipse_mut(&mut canvas, detection, DETECTION_COLOR);
    }

    for track in &payload.tracks {
        let (r, g, b) = track.color;
        let color = Rgb([r, g, b]);

        // 轨迹线
        for pair in track.trajectory.windows(2) {
            draw_line_segment_mut(&mut canvas, pair[0], pair[1], color);
        }
        let (cx, cy) = track.ellipse.center();
        draw_cross_mut(&mut canvas, color, cx as i32, cy as i32);

        let outline = if track.labels.is_empty() {
            TRACK_COLOR
        } else {
            LABELLED_COLOR
        };
        draw_ellipse_mut(&mut canvas, &track.ellipse, outline);
    }
    canvas
}

pub struct SnapshotWriter {
    output: PathBuf,
    written: u64,
}

impl SnapshotWriter {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            written: 0,
        }
    }

    fn write(&mut self, payload: &VisualizationFrame) -> Result<()> {
        let image = render(payload);
        let tmp = self.output.with_extension("tmp");
        image.save_with_format(&tmp, ImageFormat::Jpeg)?;
        fs::rename(&tmp, &self.output)?;
        self.written += 1;
        Ok(())
    }
}

impl Stage for SnapshotWriter {
    fn name(&self) -> &str {
        "visualization"
    }

    fn required_channels(&self) -> Vec<&'static str> {
        vec![VISUALIZATION]
    }

    fn run(mut self: Box<Self>, ctx: StageContext) -> Result<()> {
        let input: Channel<VisualizationFrame> = ctx.channel(VISUALIZATION)?;
        if let Some(parent) = self.output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        info!(output = %self.output.display(), "snapshot writer running");

        while !ctx.should_stop() {
            match input.receiver().try_recv() {
                Ok(payload) => {
                    if let Err(e) = self.write(&payload) {
                        warn!(frame = payload.frame_id, "failed to write snapshot: {}", e);
                    } else {
                        debug!(frame = payload.frame_id, fps = payload.fps, "snapshot written");
                    }
                }
                Err(TryRecvError::Empty) => ctx.sleep(IDLE_PAUSE),
                Err(TryRecvError::Disconnected) => {
                    return Err(PipelineError::ChannelClosed(VISUALIZATION))
                }
            }
        }

        info!(written = self.written, "snapshot writer stopped");
        Ok(())
    }
}
