/// 蜂箱监控 (Bee Sentinel)
///
/// 主程序入口 - 直接运行: cargo run --bin sentinel --release -- --video clip/
///
/// 启动顺序: 配置 → 分类模型就绪 → 截取/检测/可视化/遥测 → 视频源
/// Ctrl-C 或视频结束后按生产者优先的顺序停止所有阶段
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use bee_sentinel::config::PipelineConfig;
use bee_sentinel::input::{open_capture, CaptureSource};
use bee_sentinel::pipeline::{Components, Pipeline};
use bee_sentinel::telemetry::init_logging;
use clap::Parser;
use mimalloc::MiMalloc;
use tracing::{error, info};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// 蜂箱监控参数
#[derive(Parser, Debug)]
#[command(author, version, about = "蜂箱入口视频分析 - 蜜蜂进出与瓦螨统计", long_about = None)]
struct Args {
    /// 配置文件 (不存在时写入默认配置)
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// 摄像头编号
    #[arg(long, conflicts_with = "video")]
    camera: Option<u32>,

    /// 视频文件或图片目录
    #[arg(long)]
    video: Option<PathBuf>,

    /// 日志级别 (RUST_LOG 优先)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// 写入默认配置后退出
    #[arg(long)]
    write_default_config: bool,
}

#[cfg(feature = "onnx")]
fn with_engine(components: Components, config: &PipelineConfig) -> anyhow::Result<Components> {
    use bee_sentinel::pipeline::classify::OrtEngine;

    if !config.nn_enable {
        return Ok(components);
    }
    let engine = OrtEngine::new(
        config.nn_extract_resolution.classifier_size(),
        config.classification_labels.len(),
    );
    Ok(components.with_engine(Box::new(engine)))
}

#[cfg(not(feature = "onnx"))]
fn with_engine(components: Components, config: &PipelineConfig) -> anyhow::Result<Components> {
    if config.nn_enable {
        anyhow::bail!("NN_ENABLE is set but this build has no inference engine, rebuild with --features onnx");
    }
    Ok(components)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    if args.write_default_config {
        PipelineConfig::default()
            .save(&args.config)
            .with_context(|| format!("writing {}", args.config.display()))?;
        info!(path = %args.config.display(), "default configuration written");
        return Ok(());
    }

    let config = PipelineConfig::load_or_create(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.log_summary();

    let source = CaptureSource::from_options(args.camera, args.video)?;
    let capture = open_capture(&source, &config)?;
    let components = Components::new(capture, source.buffer_length(&config), &config);
    let components = with_engine(components, &config)?;

    let mut pipeline = Pipeline::build(config, components)?;

    // Ctrl-C → 关闭标志
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })
        .context("installing Ctrl-C handler")?;
    }

    if let Err(e) = pipeline.start() {
        error!("pipeline failed to start: {}", e);
        pipeline.stop();
        return Err(e.into());
    }

    let outcome = pipeline.run_until(&shutdown);
    info!(?outcome, "shutting down");
    pipeline.stop();
    Ok(())
}
