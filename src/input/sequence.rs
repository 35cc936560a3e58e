//! 图片序列输入 - 目录中的静态图片按文件名顺序播放
//! 不依赖解码库的 "视频文件" 输入

use std::fs;
use std::path::{Path, PathBuf};

use image::RgbImage;
use tracing::info;

use super::VideoCapture;
use crate::error::{PipelineError, Result};

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "tif"];

pub struct ImageSequenceCapture {
    dir: PathBuf,
    files: Vec<PathBuf>,
    next: usize,
}

impl ImageSequenceCapture {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let files = list_images(&dir)?;
        if files.is_empty() {
            return Err(PipelineError::config(format!(
                "no images found in {}",
                dir.display()
            )));
        }
        info!(dir = %dir.display(), frames = files.len(), "image sequence opened");
        Ok(Self {
            dir,
            files,
            next: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// 目录下的图片文件, 按文件名排序
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| {
        PipelineError::config(format!("cannot read directory {}: {e}", dir.display()))
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

impl VideoCapture for ImageSequenceCapture {
    fn read(&mut self) -> Result<Option<RgbImage>> {
        let Some(path) = self.files.get(self.next) else {
            return Ok(None);
        };
        self.next += 1;
        let image = image::open(path)
            .map_err(|e| PipelineError::device(format!("cannot decode {}: {e}", path.display())))?;
        Ok(Some(image.to_rgb8()))
    }

    fn describe(&self) -> String {
        format!("image sequence {} ({} frames)", self.dir.display(), self.files.len())
    }
}
