//! 帧集合 (FrameSet)
//! 同一帧按配置缩放成多个分辨率, 作为一个整体在流水线中传递, 生成后不可变。

use std::borrow::Cow;
use std::sync::Arc;

use fast_image_resize as fr;
use image::{imageops, DynamicImage, GrayImage, RgbImage};

use crate::config::{ColorMode, FrameSpec};
use crate::error::{PipelineError, Result};

/// 单层帧图像
#[derive(Clone, Debug)]
pub enum FrameImage {
    Color(RgbImage),
    Gray(GrayImage),
}

impl FrameImage {
    pub fn width(&self) -> u32 {
        match self {
            FrameImage::Color(img) => img.width(),
            FrameImage::Gray(img) => img.width(),
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            FrameImage::Color(img) => img.height(),
            FrameImage::Gray(img) => img.height(),
        }
    }

    pub fn as_rgb(&self) -> Option<&RgbImage> {
        match self {
            FrameImage::Color(img) => Some(img),
            FrameImage::Gray(_) => None,
        }
    }

    /// 灰度层按需展开成RGB
    pub fn to_rgb(&self) -> Cow<'_, RgbImage> {
        match self {
            FrameImage::Color(img) => Cow::Borrowed(img),
            FrameImage::Gray(img) => Cow::Owned(DynamicImage::ImageLuma8(img.clone()).to_rgb8()),
        }
    }
}

/// 帧集合: 按分辨率从大到小排列
#[derive(Clone, Debug)]
pub struct FrameSet {
    sequence: u64,
    frames: Vec<Arc<FrameImage>>,
}

impl FrameSet {
    pub fn new(sequence: u64, frames: Vec<Arc<FrameImage>>) -> Self {
        Self { sequence, frames }
    }

    /// 单调递增的帧序号
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame(&self, index: usize) -> Option<&Arc<FrameImage>> {
        self.frames.get(index)
    }

    /// 最高分辨率 (截取用)
    pub fn largest(&self) -> Option<&Arc<FrameImage>> {
        self.frames.first()
    }

    /// 最低分辨率 (检测用)
    pub fn smallest(&self) -> Option<&Arc<FrameImage>> {
        self.frames.last()
    }
}

// ========== 帧集合构建 ==========

/// 按帧配置把解码出的一帧缩放成帧集合 (逐级缩放, 大图先行)
pub struct FrameSetBuilder {
    specs: Vec<FrameSpec>,
    resizer: fr::Resizer,
}

impl FrameSetBuilder {
    pub fn new(specs: Vec<FrameSpec>) -> Result<Self> {
        if specs.is_empty() {
            return Err(PipelineError::config(
                "at least one frame config entry has to be provided",
            ));
        }
        Ok(Self {
            specs,
            resizer: fr::Resizer::new(),
        })
    }

    pub fn specs(&self) -> &[FrameSpec] {
        &self.specs
    }

    pub fn build(&mut self, source: RgbImage, sequence: u64) -> Result<FrameSet> {
        let mut frames = Vec::with_capacity(self.specs.len());
        let mut current = source;

        for num in 0..self.specs.len() {
            let spec = self.specs[num];
            if current.dimensions() != (spec.width, spec.height) {
                current = self.resize(&current, spec.width, spec.height)?;
            }
            let image = match spec.color_mode {
                ColorMode::Grayscale => FrameImage::Gray(imageops::grayscale(&current)),
                ColorMode::Color | ColorMode::Unchanged => FrameImage::Color(current.clone()),
            };
            frames.push(Arc::new(image));
        }

        Ok(FrameSet::new(sequence, frames))
    }

    fn resize(&mut self, src: &RgbImage, width: u32, height: u32) -> Result<RgbImage> {
        let src_view =
            fr::images::ImageRef::new(src.width(), src.height(), src.as_raw(), fr::PixelType::U8x3)
                .map_err(|e| PipelineError::Resample(e.to_string()))?;
        let mut dst = fr::images::Image::new(width, height, fr::PixelType::U8x3);

        self.resizer
            .resize(
                &src_view,
                &mut dst,
                &fr::ResizeOptions::new()
                    .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
            )
            .map_err(|e| PipelineError::Resample(e.to_string()))?;

        RgbImage::from_raw(width, height, dst.into_vec()).ok_or_else(|| {
            PipelineError::Resample(format!("resized buffer does not fit {width}x{height}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn builds_frames_largest_first() {
        let specs = vec![
            FrameSpec::new(64, 48, ColorMode::Color),
            FrameSpec::new(32, 24, ColorMode::Grayscale),
            FrameSpec::new(16, 12, ColorMode::Unchanged),
        ];
        let mut builder = FrameSetBuilder::new(specs).unwrap();
        let source = RgbImage::from_pixel(128, 96, Rgb([10, 200, 30]));

        let set = builder.build(source, 7).unwrap();
        assert_eq!(set.sequence(), 7);
        assert_eq!(set.len(), 3);
        assert_eq!(set.largest().unwrap().width(), 64);
        assert!(matches!(**set.frame(1).unwrap(), FrameImage::Gray(_)));
        let smallest = set.smallest().unwrap();
        assert_eq!((smallest.width(), smallest.height()), (16, 12));
        let pixel = smallest.as_rgb().unwrap().get_pixel(8, 6);
        for (got, want) in pixel.0.iter().zip([10u8, 200, 30]) {
            assert!(got.abs_diff(want) <= 1);
        }
    }

    #[test]
    fn matching_size_is_not_resampled() {
        let mut builder =
            FrameSetBuilder::new(vec![FrameSpec::new(4, 4, ColorMode::Color)]).unwrap();
        let mut source = RgbImage::new(4, 4);
        source.put_pixel(1, 2, Rgb([255, 0, 0]));

        let set = builder.build(source.clone(), 0).unwrap();
        assert_eq!(set.largest().unwrap().as_rgb().unwrap(), &source);
    }

    #[test]
    fn gray_frame_expands_to_rgb() {
        let frame = FrameImage::Gray(GrayImage::from_pixel(2, 2, image::Luma([90])));
        assert_eq!(frame.to_rgb().get_pixel(0, 0), &Rgb([90, 90, 90]));
        assert!(frame.as_rgb().is_none());
    }

    #[test]
    fn empty_frame_config_is_rejected() {
        assert!(matches!(
            FrameSetBuilder::new(vec![]),
            Err(PipelineError::Configuration(_))
        ));
    }
}
