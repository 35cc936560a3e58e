/// 分类阶段 (ClassificationWorker)
/// 职责: 加载模型 → 预热 → 报告就绪 → 批量推理 → 阈值判定 → 回送结果
///
/// 模型加载可能耗时数分钟, 流水线在启动其它阶段前等待就绪标志。
/// 推理后端通过 `InferenceEngine` 替换, `onnx` 特性提供 ONNX Runtime 实现。
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use image::{imageops, RgbImage};
use ndarray::Array2;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::input::sequence::list_images;
use crate::supervisor::{Channel, Stage, StageContext};
use crate::utils::gen_time_string;

use super::messages::{
    ClassificationRequest, ClassificationResult, CLASSIFICATION_REQUESTS, CLASSIFICATION_RESULTS,
};

/// 每批最多图像数
pub const BATCH_SIZE: usize = 5;

// ========== 推理接口 ==========

/// 推理后端
pub trait InferenceEngine: Send {
    fn load_model(&mut self, path: &Path) -> Result<()>;

    /// 网络输入尺寸 (宽, 高)
    fn input_size(&self) -> (u32, u32);

    /// 返回 标签数 × 批大小 的分数矩阵
    fn predict(&mut self, images: &[RgbImage]) -> Result<Array2<f32>>;
}

/// 尺寸不符时缩放到网络输入尺寸
fn fit_to_input(image: RgbImage, size: (u32, u32)) -> RgbImage {
    if image.dimensions() == size {
        image
    } else {
        imageops::resize(&image, size.0, size.1, imageops::FilterType::Triangle)
    }
}

// ========== 参数 ==========

#[derive(Clone, Debug, PartialEq)]
pub struct ClassificationSettings {
    pub model_path: PathBuf,
    /// 预热用图片目录
    pub calibration_dir: PathBuf,
    pub labels: Vec<String>,
    /// 与 `labels` 一一对应
    pub thresholds: Vec<f32>,
    pub idle_pause: Duration,
    pub save_dir: Option<PathBuf>,
    pub save_types: BTreeSet<String>,
}

impl From<&PipelineConfig> for ClassificationSettings {
    fn from(config: &PipelineConfig) -> Self {
        let thresholds = config
            .classification_labels
            .iter()
            .map(|label| {
                config
                    .classification_thresholds
                    .get(label)
                    .copied()
                    .unwrap_or(0.5)
            })
            .collect();
        Self {
            model_path: config.nn_model_path.clone(),
            calibration_dir: config.nn_calibration_dir.clone(),
            labels: config.classification_labels.clone(),
            thresholds,
            idle_pause: config.classification_idle_pause(),
            save_dir: config
                .save_detection_images
                .then(|| config.save_detection_path.clone()),
            save_types: config.save_detection_types.iter().cloned().collect(),
        }
    }
}

// ========== 分类阶段 ==========

pub struct ClassificationWorker {
    engine: Box<dyn InferenceEngine>,
    settings: ClassificationSettings,
    batches: u64,
    processed: u64,
}

impl ClassificationWorker {
    pub fn new(engine: Box<dyn InferenceEngine>, settings: ClassificationSettings) -> Self {
        Self {
            engine,
            settings,
            batches: 0,
            processed: 0,
        }
    }

    /// 用校准目录中的图片跑一次推理, 确保网络完全初始化
    fn warm_up(&mut self) -> Result<()> {
        let dir = &self.settings.calibration_dir;
        if !dir.is_dir() {
            warn!(dir = %dir.display(), "calibration directory missing, skipping warm-up");
            return Ok(());
        }

        let size = self.engine.input_size();
        let mut images = Vec::new();
        for path in list_images(dir)? {
            match image::open(&path) {
                Ok(img) => images.push(fit_to_input(img.to_rgb8(), size)),
                Err(e) => warn!(path = %path.display(), "skipping calibration image: {}", e),
            }
        }

        let start = Instant::now();
        for chunk in images.chunks(BATCH_SIZE) {
            self.engine.predict(chunk)?;
        }
        info!(images = images.len(), "warm-up finished in {:?}", start.elapsed());
        Ok(())
    }

    fn prepare_save_dirs(&self) -> Result<()> {
        if let Some(dir) = &self.settings.save_dir {
            for label in &self.settings.save_types {
                fs::create_dir_all(dir.join(label))?;
            }
        }
        Ok(())
    }

    fn save_positive(&self, label: &str, image: &RgbImage, frame_id: u64) {
        let Some(dir) = &self.settings.save_dir else {
            return;
        };
        if !self.settings.save_types.contains(label) {
            return;
        }
        let path = dir.join(label).join(format!(
            "{}-{}-{}.jpeg",
            self.batches,
            gen_time_string(),
            frame_id
        ));
        if let Err(e) = image.save(&path) {
            warn!(path = %path.display(), "failed to save detection image: {}", e);
        }
    }

    /// 分数矩阵的一列 → 标签集合
    fn labels_for(&self, scores: &Array2<f32>, column: usize) -> BTreeSet<String> {
        self.settings
            .labels
            .iter()
            .zip(&self.settings.thresholds)
            .enumerate()
            .filter(|(row, (_, threshold))| scores[[*row, column]] > **threshold)
            .map(|(_, (label, _))| label.clone())
            .collect()
    }

    fn classify(
        &mut self,
        batch: Vec<ClassificationRequest>,
        results: &Channel<ClassificationResult>,
    ) -> Result<()> {
        let start = Instant::now();
        self.batches += 1;

        let size = self.engine.input_size();
        let mut meta = Vec::with_capacity(batch.len());
        let mut originals = Vec::with_capacity(batch.len());
        let mut inputs = Vec::with_capacity(batch.len());
        for request in batch {
            meta.push((request.track_id, request.frame_id));
            if self.settings.save_dir.is_some() {
                originals.push(request.image.clone());
            }
            inputs.push(fit_to_input(request.image, size));
        }

        let scores = match self.engine.predict(&inputs) {
            Ok(scores) => scores,
            Err(e) => {
                error!(batch = self.batches, images = inputs.len(), "inference failed: {}", e);
                return Ok(());
            }
        };
        if scores.nrows() != self.settings.labels.len() || scores.ncols() != inputs.len() {
            error!(
                shape = ?scores.shape(),
                labels = self.settings.labels.len(),
                images = inputs.len(),
                "unexpected score matrix shape"
            );
            return Ok(());
        }

        for (column, (track_id, frame_id)) in meta.into_iter().enumerate() {
            let labels = self.labels_for(&scores, column);
            for label in &labels {
                let image = originals.get(column).unwrap_or(&inputs[column]);
                self.save_positive(label, image, frame_id);
            }
            results
                .sender()
                .send(ClassificationResult { track_id, labels })
                .map_err(|_| PipelineError::ChannelClosed(CLASSIFICATION_RESULTS))?;
        }

        self.processed += inputs.len() as u64;
        debug!(
            batch = self.batches,
            images = inputs.len(),
            "processed in {:.3}ms",
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(())
    }
}

impl Stage for ClassificationWorker {
    fn name(&self) -> &str {
        "classification"
    }

    fn required_channels(&self) -> Vec<&'static str> {
        vec![CLASSIFICATION_REQUESTS, CLASSIFICATION_RESULTS]
    }

    fn reports_readiness(&self) -> bool {
        true
    }

    fn run(mut self: Box<Self>, ctx: StageContext) -> Result<()> {
        let requests: Channel<ClassificationRequest> = ctx.channel(CLASSIFICATION_REQUESTS)?;
        let results: Channel<ClassificationResult> = ctx.channel(CLASSIFICATION_RESULTS)?;

        // 加载模型
        info!(model = %self.settings.model_path.display(), "loading classification model");
        if let Err(e) = self.engine.load_model(&self.settings.model_path) {
            ctx.set_failed(e.to_string());
            return Err(e);
        }
        if let Err(e) = self.warm_up() {
            ctx.set_failed(format!("warm-up failed: {e}"));
            return Err(e);
        }
        self.prepare_save_dirs()?;
        ctx.set_ready();

        while !ctx.should_stop() {
            let mut batch = Vec::with_capacity(BATCH_SIZE);
            while batch.len() < BATCH_SIZE {
                if ctx.should_stop() {
                    // 未完成的批次直接丢弃
                    info!(processed = self.processed, "classification stopped");
                    return Ok(());
                }
                match requests.receiver().try_recv() {
                    Ok(request) => batch.push(request),
                    Err(_) => break,
                }
            }

            if batch.is_empty() {
                ctx.sleep(self.settings.idle_pause);
                continue;
            }
            self.classify(batch, &results)?;
        }

        info!(processed = self.processed, "classification stopped");
        Ok(())
    }
}

// ========== ONNX Runtime 后端 ==========

#[cfg(feature = "onnx")]
pub use onnx::OrtEngine;

#[cfg(feature = "onnx")]
mod onnx {
    use std::path::Path;

    use image::RgbImage;
    use ndarray::Array2;
    use ort::session::Session;
    use ort::value::Tensor;

    use super::InferenceEngine;
    use crate::error::{PipelineError, Result};

    /// ONNX分类模型, 输入 NHWC f32 (像素值 0..255)
    /// 输出: 单个 [批大小, 标签数] 张量, 或每个标签一个 [批大小, 1] 张量
    pub struct OrtEngine {
        session: Option<Session>,
        input_size: (u32, u32),
        labels: usize,
    }

    impl OrtEngine {
        pub fn new(input_size: (u32, u32), labels: usize) -> Self {
            Self {
                session: None,
                input_size,
                labels,
            }
        }
    }

    impl InferenceEngine for OrtEngine {
        fn load_model(&mut self, path: &Path) -> Result<()> {
            let session = Session::builder()
                .and_then(|builder| builder.commit_from_file(path))
                .map_err(|e| PipelineError::ModelLoad(format!("{}: {e}", path.display())))?;
            self.session = Some(session);
            Ok(())
        }

        fn input_size(&self) -> (u32, u32) {
            self.input_size
        }

        fn predict(&mut self, images: &[RgbImage]) -> Result<Array2<f32>> {
            let session = self
                .session
                .as_mut()
                .ok_or_else(|| PipelineError::Inference("model not loaded".to_string()))?;
            let (width, height) = self.input_size;
            let batch = images.len();

            let mut data = Vec::with_capacity(batch * (width * height * 3) as usize);
            for image in images {
                data.extend(image.as_raw().iter().map(|&v| v as f32));
            }
            let shape = [batch, height as usize, width as usize, 3];
            let tensor = Tensor::from_array((shape, data.into_boxed_slice()))
                .map_err(|e| PipelineError::Inference(e.to_string()))?;

            let outputs = session
                .run(ort::inputs![tensor])
                .map_err(|e| PipelineError::Inference(e.to_string()))?;

            let mut scores = Array2::<f32>::zeros((self.labels, batch));
            let values: Vec<_> = outputs.iter().map(|(_, value)| value).collect();
            if values.len() >= self.labels && values.len() > 1 {
                for (label, value) in values.iter().take(self.labels).enumerate() {
                    let (_, data) = value
                        .try_extract_tensor::<f32>()
                        .map_err(|e| PipelineError::Inference(e.to_string()))?;
                    for (column, score) in data.iter().take(batch).enumerate() {
                        scores[[label, column]] = *score;
                    }
                }
            } else {
                let value = values
                    .first()
                    .ok_or_else(|| PipelineError::Inference("model produced no output".into()))?;
                let (_, data) = value
                    .try_extract_tensor::<f32>()
                    .map_err(|e| PipelineError::Inference(e.to_string()))?;
                if data.len() < batch * self.labels {
                    return Err(PipelineError::Inference(format!(
                        "expected {} scores, got {}",
                        batch * self.labels,
                        data.len()
                    )));
                }
                for column in 0..batch {
                    for label in 0..self.labels {
                        scores[[label, column]] = data[column * self.labels + label];
                    }
                }
            }
            Ok(scores)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::supervisor::{Readiness, Supervisor};
    use image::Rgb;
    use std::sync::{Arc, Mutex};

    /// 分数 = 左上角像素红色通道 / 255
    pub(crate) struct MockEngine {
        pub(crate) fail_load: bool,
        pub(crate) batches: Arc<Mutex<Vec<usize>>>,
        pub(crate) sizes: Arc<Mutex<Vec<(u32, u32)>>>,
    }

    impl MockEngine {
        pub(crate) fn new() -> Self {
            Self {
                fail_load: false,
                batches: Arc::new(Mutex::new(Vec::new())),
                sizes: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl InferenceEngine for MockEngine {
        fn load_model(&mut self, path: &Path) -> Result<()> {
            if self.fail_load {
                return Err(PipelineError::ModelLoad(format!("{} missing", path.display())));
            }
            Ok(())
        }

        fn input_size(&self) -> (u32, u32) {
            (8, 16)
        }

        fn predict(&mut self, images: &[RgbImage]) -> Result<Array2<f32>> {
            self.batches.lock().unwrap().push(images.len());
            self.sizes
                .lock()
                .unwrap()
                .extend(images.iter().map(|img| img.dimensions()));
            let row: Vec<f32> = images
                .iter()
                .map(|img| img.get_pixel(0, 0)[0] as f32 / 255.0)
                .collect();
            Ok(Array2::from_shape_vec((1, images.len()), row).unwrap())
        }
    }

    pub(crate) fn settings(calibration_dir: PathBuf) -> ClassificationSettings {
        ClassificationSettings {
            model_path: PathBuf::from("model.onnx"),
            calibration_dir,
            labels: vec!["varroa".to_string()],
            thresholds: vec![0.5],
            idle_pause: Duration::from_millis(2),
            save_dir: None,
            save_types: BTreeSet::from(["varroa".to_string()]),
        }
    }

    fn request(track_id: u64, red: u8) -> ClassificationRequest {
        ClassificationRequest {
            track_id,
            image: RgbImage::from_pixel(8, 16, Rgb([red, 0, 0])),
            frame_id: track_id * 10,
        }
    }

    fn start(
        engine: MockEngine,
        settings: ClassificationSettings,
    ) -> (
        Supervisor,
        Channel<ClassificationRequest>,
        Channel<ClassificationResult>,
    ) {
        let requests = Channel::bounded(CLASSIFICATION_REQUESTS, 20);
        let results = Channel::unbounded(CLASSIFICATION_RESULTS);
        let mut supervisor = Supervisor::new(ClassificationWorker::new(Box::new(engine), settings));
        supervisor.register_channel(&requests);
        supervisor.register_channel(&results);
        (supervisor, requests, results)
    }

    #[test]
    fn test_batches_of_at_most_five_in_order() {
        let engine = MockEngine::new();
        let batches = Arc::clone(&engine.batches);
        let (mut supervisor, requests, results) =
            start(engine, settings(PathBuf::from("no-such-dir")));

        // 启动前放入7个请求
        for id in 0..7 {
            let red = if id % 2 == 0 { 255 } else { 0 };
            requests.sender().send(request(id, red)).unwrap();
        }
        supervisor.start().unwrap();
        supervisor.wait_ready(Duration::from_secs(5)).unwrap();

        let received: Vec<ClassificationResult> = (0..7)
            .map(|_| {
                results
                    .receiver()
                    .recv_timeout(Duration::from_secs(5))
                    .unwrap()
            })
            .collect();
        let ids: Vec<u64> = received.iter().map(|r| r.track_id).collect();
        assert_eq!(ids, (0..7).collect::<Vec<_>>());
        for result in &received {
            assert_eq!(result.labels.contains("varroa"), result.track_id % 2 == 0);
        }
        assert_eq!(*batches.lock().unwrap(), vec![5, 2]);
        supervisor.stop();
    }

    #[test]
    fn test_threshold_is_strict() {
        let worker = ClassificationWorker::new(
            Box::new(MockEngine::new()),
            settings(PathBuf::from("unused")),
        );
        let scores = Array2::from_shape_vec((1, 2), vec![0.5, 0.51]).unwrap();
        assert!(worker.labels_for(&scores, 0).is_empty());
        assert!(worker.labels_for(&scores, 1).contains("varroa"));
    }

    #[test]
    fn test_model_load_failure_is_reported() {
        let mut engine = MockEngine::new();
        engine.fail_load = true;
        let (mut supervisor, _requests, _results) = start(engine, settings(PathBuf::from("x")));
        supervisor.start().unwrap();

        let err = supervisor.wait_ready(Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, PipelineError::ModelLoad(_)));
        assert_eq!(supervisor.readiness(), Readiness::Failed);
        supervisor.stop();
    }

    #[test]
    fn test_warm_up_uses_calibration_images() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.png", "b.png"] {
            RgbImage::from_pixel(30, 30, Rgb([10, 20, 30]))
                .save(dir.path().join(name))
                .unwrap();
        }
        let engine = MockEngine::new();
        let batches = Arc::clone(&engine.batches);
        let sizes = Arc::clone(&engine.sizes);
        let (mut supervisor, _requests, _results) =
            start(engine, settings(dir.path().to_path_buf()));
        supervisor.start().unwrap();
        supervisor.wait_ready(Duration::from_secs(5)).unwrap();

        assert_eq!(*batches.lock().unwrap(), vec![2]);
        assert!(sizes.lock().unwrap().iter().all(|&s| s == (8, 16)));
        supervisor.stop();
    }

    #[test]
    fn test_positive_images_are_saved_per_label() {
        let out = tempfile::tempdir().unwrap();
        let mut s = settings(PathBuf::from("no-such-dir"));
        s.save_dir = Some(out.path().to_path_buf());
        let (mut supervisor, requests, results) = start(MockEngine::new(), s);
        supervisor.start().unwrap();
        supervisor.wait_ready(Duration::from_secs(5)).unwrap();

        requests.sender().send(request(1, 255)).unwrap();
        requests.sender().send(request(2, 0)).unwrap();
        for _ in 0..2 {
            results
                .receiver()
                .recv_timeout(Duration::from_secs(5))
                .unwrap();
        }
        supervisor.stop();

        let saved: Vec<_> = fs::read_dir(out.path().join("varroa"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(saved.len(), 1);
        assert!(saved[0].ends_with("-10.jpeg"));
    }
}
