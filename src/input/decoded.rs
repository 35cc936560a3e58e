//! 解码线程的接收端
//!
//! 解码器在独立线程中运行并把 RGB 帧送入通道。线程结束时把解码器的返回结果记录下来,
//! 之后才释放自己持有的发送端, 所以接收端看到通道断开时失败原因一定已经可见。

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use image::RgbImage;
use tracing::{error, warn};

use crate::error::{PipelineError, Result};

/// 摄像头首帧等待上限
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(10);
/// 后续帧等待上限
const FRAME_TIMEOUT: Duration = Duration::from_secs(60);

pub struct DecodedFrames {
    description: String,
    live: bool,
    rx: Receiver<RgbImage>,
    failure: Arc<Mutex<Option<String>>>,
    handle: Option<JoinHandle<()>>,
    frames: u64,
}

impl DecodedFrames {
    /// 启动解码线程; `decode` 返回 Err 表示解码中途失败
    pub fn spawn<F>(
        description: impl Into<String>,
        live: bool,
        tx: Sender<RgbImage>,
        rx: Receiver<RgbImage>,
        decode: F,
    ) -> Result<Self>
    where
        F: FnOnce() -> std::result::Result<(), String> + Send + 'static,
    {
        let description = description.into();
        let failure = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&failure);
        let name = description.clone();
        let handle = thread::Builder::new()
            .name("decode".to_string())
            .spawn(move || {
                let result = decode();
                if let Err(e) = result {
                    error!(source = %name, "decoder failed: {}", e);
                    if let Ok(mut slot) = slot.lock() {
                        *slot = Some(e);
                    }
                }
                drop(tx);
            })?;

        Ok(Self {
            description,
            live,
            rx,
            failure,
            handle: Some(handle),
            frames: 0,
        })
    }

    fn failure(&self) -> Option<String> {
        self.failure.lock().ok().and_then(|slot| slot.clone())
    }

    /// 读取下一帧, 文件正常结束返回 None
    pub fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        let timeout = if self.frames == 0 && self.live {
            FIRST_FRAME_TIMEOUT
        } else {
            FRAME_TIMEOUT
        };
        let start = Instant::now();
        match self.rx.recv_timeout(timeout) {
            Ok(image) => {
                self.frames += 1;
                Ok(Some(image))
            }
            Err(RecvTimeoutError::Disconnected) => match self.failure() {
                Some(reason) => Err(PipelineError::device(format!(
                    "{} failed after {} frames: {}",
                    self.description, self.frames, reason
                ))),
                None if !self.live => Ok(None),
                None => Err(PipelineError::device(format!(
                    "{} stopped delivering frames",
                    self.description
                ))),
            },
            Err(RecvTimeoutError::Timeout) => Err(PipelineError::device(format!(
                "{} delivered no frame within {:?}",
                self.description,
                start.elapsed()
            ))),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl Drop for DecodedFrames {
    fn drop(&mut self) {
        // 解码线程可能阻塞在发送上
        while self.rx.try_recv().is_ok() {}
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                warn!(source = %self.description, "decode thread still running, detaching");
            }
        }
    }
}
