//! FFmpeg 视频输入 (摄像头 / 视频文件)
//!
//! 解码在独立线程中运行, 解码滤镜把 YUV420P 帧转换成 RGB 并送入容量为2的通道,
//! `read()` 从通道阻塞读取。解码器报错或摄像头断开是设备失败, 文件读完是流结束。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Frame, Input};
use image::RgbImage;
use tracing::{debug, info};

use super::decoded::DecodedFrames;
use super::{CaptureSource, VideoCapture};
use crate::error::{PipelineError, Result};

// ========== 解码滤镜 ==========

/// FFmpeg解码过滤器: 视频帧 → RGB帧
struct RgbFilter {
    tx: Sender<RgbImage>,
    closed: Arc<AtomicBool>,
    total_frames: usize,
    dropped_frames: usize,
}

impl FrameFilter for RgbFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> std::result::Result<(), String> {
        debug!("decode filter started");
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: Frame,
        _ctx: &FrameFilterContext,
    ) -> std::result::Result<Option<Frame>, String> {
        if self.closed.load(Ordering::Relaxed) {
            return Err("capture closed".to_string());
        }

        unsafe {
            self.total_frames += 1;

            // 空帧或损坏帧
            if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
                self.dropped_frames += 1;
                return Ok(None);
            }

            let w = (*frame.as_ptr()).width as usize;
            let h = (*frame.as_ptr()).height as usize;
            if w == 0 || h == 0 {
                self.dropped_frames += 1;
                return Ok(None);
            }

            // YUV420P数据指针
            let y_plane = (*frame.as_ptr()).data[0];
            let u_plane = (*frame.as_ptr()).data[1];
            let v_plane = (*frame.as_ptr()).data[2];
            let y_stride = (*frame.as_ptr()).linesize[0] as usize;
            let uv_stride = (*frame.as_ptr()).linesize[1] as usize;

            if y_plane.is_null() || u_plane.is_null() || v_plane.is_null() {
                self.dropped_frames += 1;
                return Ok(None);
            }
            if y_stride < w || uv_stride < w / 2 {
                self.dropped_frames += 1;
                return Ok(None);
            }

            let mut buffer = vec![0u8; w * h * 3];
            yuv420p_to_rgb(
                y_plane,
                u_plane,
                v_plane,
                y_stride,
                uv_stride,
                &mut buffer,
                w,
                h,
            );

            let Some(image) = RgbImage::from_raw(w as u32, h as u32, buffer) else {
                self.dropped_frames += 1;
                return Ok(None);
            };
            if self.tx.send(image).is_err() {
                return Err("capture closed".to_string());
            }
        }

        Ok(Some(frame))
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        debug!(
            total = self.total_frames,
            dropped = self.dropped_frames,
            "decode filter finished"
        );
    }
}

/// YUV420P → RGB (BT.601, 定点数)
#[inline]
#[allow(clippy::too_many_arguments)]
unsafe fn yuv420p_to_rgb(
    y_plane: *const u8,
    u_plane: *const u8,
    v_plane: *const u8,
    y_stride: usize,
    uv_stride: usize,
    buffer: &mut [u8],
    width: usize,
    height: usize,
) {
    let mut out_idx = 0;
    for y in 0..height {
        let y_row = y * y_stride;
        let uv_row = (y >> 1) * uv_stride;

        for x in 0..width {
            let y_val = *y_plane.add(y_row + x) as i32;
            let u_val = *u_plane.add(uv_row + (x >> 1)) as i32 - 128;
            let v_val = *v_plane.add(uv_row + (x >> 1)) as i32 - 128;

            buffer[out_idx] = (y_val + ((v_val * 179) >> 7)).clamp(0, 255) as u8;
            buffer[out_idx + 1] =
                (y_val - ((u_val * 44) >> 7) - ((v_val * 91) >> 7)).clamp(0, 255) as u8;
            buffer[out_idx + 2] = (y_val + ((u_val * 227) >> 7)).clamp(0, 255) as u8;
            out_idx += 3;
        }
    }
}

// ========== 视频输入 ==========

pub struct FfmpegCapture {
    frames: DecodedFrames,
    closed: Arc<AtomicBool>,
}

impl FfmpegCapture {
    pub fn open(source: &CaptureSource, use_hw_decode: bool) -> Result<Self> {
        let (url, format, live) = match source {
            CaptureSource::Camera(index) => (camera_url(*index), Some(camera_format()), true),
            CaptureSource::Video(path) => (path.display().to_string(), None, false),
        };

        let (tx, rx) = crossbeam_channel::bounded(2);
        let closed = Arc::new(AtomicBool::new(false));
        let filter = RgbFilter {
            tx: tx.clone(),
            closed: Arc::clone(&closed),
            total_frames: 0,
            dropped_frames: 0,
        };

        // 构建帧处理管线
        let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
        let pipe = pipe.filter("rgb", Box::new(filter));
        let out = create_null_output().add_frame_pipeline(pipe);

        let mut input = Input::new(url.as_str());
        if let Some(format) = format {
            input = input.set_format(format);
        }
        if use_hw_decode {
            input = input.set_hwaccel("auto");
        }

        let ctx = FfmpegContext::builder()
            .input(input)
            .filter_descs(["format=yuv420p"].into())
            .output(out)
            .build()
            .map_err(|e| PipelineError::device(format!("cannot open {url}: {e}")))?;
        let sch = ctx
            .start()
            .map_err(|e| PipelineError::device(format!("cannot start {url}: {e}")))?;

        let stopped = Arc::clone(&closed);
        let frames = DecodedFrames::spawn(format!("ffmpeg {url}"), live, tx, rx, move || {
            match sch.wait() {
                // 主动关闭时滤镜返回的错误不算解码失败
                Err(_) if stopped.load(Ordering::Relaxed) => Ok(()),
                result => result.map_err(|e| e.to_string()),
            }
        })?;

        info!(source = %url, hw_decode = use_hw_decode, "video capture opened");
        Ok(Self { frames, closed })
    }
}

impl VideoCapture for FfmpegCapture {
    fn read(&mut self) -> Result<Option<RgbImage>> {
        self.frames.next_frame()
    }

    fn describe(&self) -> String {
        self.frames.description().to_string()
    }
}

impl Drop for FfmpegCapture {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

/// 摄像头URL - 根据平台选择
fn camera_url(index: u32) -> String {
    #[cfg(target_os = "linux")]
    {
        format!("/dev/video{}", index)
    }
    #[cfg(not(target_os = "linux"))]
    {
        format!("{}", index)
    }
}

fn camera_format() -> &'static str {
    #[cfg(target_os = "windows")]
    let format = "dshow"; // DirectShow

    #[cfg(target_os = "macos")]
    let format = "avfoundation"; // AVFoundation

    #[cfg(target_os = "linux")]
    let format = "v4l2"; // Video4Linux2

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    let format = "video4linux2"; // 默认

    format
}
