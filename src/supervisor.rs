//! 阶段监督者 (Supervisor)
//!
//! 每个流水线阶段运行在独立的命名线程上, 由 Supervisor 统一管理生命周期:
//! - `register_channel`: 绑定命名通道, 启动时注入, 停止后清空
//! - `start`: 检查必需通道并启动工作线程
//! - `stop`: 两阶段停止 (协作标志 → 宽限期 → 强制放弃线程), 然后清空通道
//! - `join`: 仅在未停止且未自行结束时阻塞等待
//!
//! 状态机: Created → Started → StopRequested → {GracefullyFinished | ForceTerminated} → Drained

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, Result};

/// 停止宽限期
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(1);
/// 完成标志 / 就绪标志的轮询间隔
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

// ========== 命名通道 ==========

/// 命名通道, 容量在创建时确定, 之后不再改变
pub struct Channel<T> {
    name: &'static str,
    capacity: Option<usize>,
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            capacity: self.capacity,
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &self.rx.len())
            .finish()
    }
}

impl<T> Channel<T> {
    pub fn bounded(name: &'static str, capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self {
            name,
            capacity: Some(capacity),
            tx,
            rx,
        }
    }

    pub fn unbounded(name: &'static str) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            name,
            capacity: None,
            tx,
            rx,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// `None` 表示无界
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn sender(&self) -> &Sender<T> {
        &self.tx
    }

    pub fn receiver(&self) -> &Receiver<T> {
        &self.rx
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.rx.is_full()
    }

    /// 丢弃所有缓存的负载, 释放被阻塞的生产者
    pub fn drain(&self) -> usize {
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

/// 类型擦除的通道 (注册表内部使用)
trait ErasedChannel: Send + Sync {
    fn name(&self) -> &'static str;
    fn drain(&self) -> usize;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Send + 'static> ErasedChannel for Channel<T> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn drain(&self) -> usize {
        Channel::drain(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 通道注册表: 按名称注入到阶段入口
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    entries: Vec<Arc<dyn ErasedChannel>>,
}

impl ChannelRegistry {
    pub fn insert<T: Send + 'static>(&mut self, channel: &Channel<T>) {
        self.entries.retain(|entry| entry.name() != channel.name());
        self.entries.push(Arc::new(channel.clone()));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|entry| entry.name() == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|entry| entry.name()).collect()
    }

    /// 按名称和负载类型取出通道
    pub fn get<T: Send + 'static>(&self, name: &str) -> Result<Channel<T>> {
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.name() == name)
            .ok_or_else(|| PipelineError::config(format!("channel {name:?} is not registered")))?;
        entry
            .as_any()
            .downcast_ref::<Channel<T>>()
            .cloned()
            .ok_or_else(|| {
                PipelineError::config(format!(
                    "channel {name:?} does not carry {}",
                    std::any::type_name::<T>()
                ))
            })
    }

    fn drain_all(&self) -> usize {
        self.entries.iter().map(|entry| entry.drain()).sum()
    }
}

// ========== 控制信号 ==========

/// 就绪状态 (仅用于初始化开销大的阶段)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Ready,
    Failed,
}

#[derive(Debug)]
struct ReadinessFlag {
    state: AtomicU8,
    reason: Mutex<Option<String>>,
}

impl ReadinessFlag {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(0),
            reason: Mutex::new(None),
        }
    }

    fn get(&self) -> Readiness {
        match self.state.load(Ordering::SeqCst) {
            1 => Readiness::Ready,
            2 => Readiness::Failed,
            _ => Readiness::Pending,
        }
    }

    fn set_ready(&self) {
        self.state.store(1, Ordering::SeqCst);
    }

    fn set_failed(&self, reason: String) {
        if let Ok(mut guard) = self.reason.lock() {
            *guard = Some(reason);
        }
        self.state.store(2, Ordering::SeqCst);
    }

    fn reason(&self) -> String {
        self.reason
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .unwrap_or_else(|| "stage exited before reporting ready".to_string())
    }
}

/// 注入到阶段入口的上下文: 控制信号 + 已注册的通道
#[derive(Clone)]
pub struct StageContext {
    name: String,
    stop_requested: Arc<AtomicBool>,
    readiness: Arc<ReadinessFlag>,
    channels: ChannelRegistry,
}

impl StageContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 每个工作单元至少检查一次
    pub fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self) {
        self.readiness.set_ready();
    }

    pub fn set_failed(&self, reason: impl Into<String>) {
        self.readiness.set_failed(reason.into());
    }

    pub fn channel<T: Send + 'static>(&self, name: &str) -> Result<Channel<T>> {
        self.channels.get(name)
    }

    /// 可中断的睡眠, 收到停止信号立即返回
    pub fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            if self.should_stop() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep((deadline - now).min(POLL_INTERVAL));
        }
    }
}

// ========== 阶段接口 ==========

/// 流水线阶段
pub trait Stage: Send + 'static {
    fn name(&self) -> &str;

    /// 启动前必须注册的通道
    fn required_channels(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// 是否通过就绪标志报告初始化完成
    fn reports_readiness(&self) -> bool {
        false
    }

    /// 阶段主循环, 返回即视为完成
    fn run(self: Box<Self>, ctx: StageContext) -> Result<()>;
}

/// 生命周期状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageState {
    Created,
    Started,
    StopRequested,
    GracefullyFinished,
    ForceTerminated,
    Drained,
}

/// `stop()` 的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// 从未启动
    NotStarted,
    GracefullyFinished,
    /// 宽限期内未结束, 线程被放弃
    ForceTerminated,
}

// ========== 监督者 ==========

pub struct Supervisor {
    name: String,
    stage: Option<Box<dyn Stage>>,
    required: Vec<&'static str>,
    reports_readiness: bool,
    channels: ChannelRegistry,
    stop_requested: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    readiness: Arc<ReadinessFlag>,
    handle: Option<JoinHandle<()>>,
    state: StageState,
    outcome: StopOutcome,
    grace: Duration,
}

impl Supervisor {
    pub fn new(stage: impl Stage) -> Self {
        Self {
            name: stage.name().to_string(),
            required: stage.required_channels(),
            reports_readiness: stage.reports_readiness(),
            stage: Some(Box::new(stage)),
            channels: ChannelRegistry::default(),
            stop_requested: Arc::new(AtomicBool::new(false)),
            finished: Arc::new(AtomicBool::new(false)),
            readiness: Arc::new(ReadinessFlag::new()),
            handle: None,
            state: StageState::Created,
            outcome: StopOutcome::NotStarted,
            grace: DEFAULT_STOP_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn register_channel<T: Send + 'static>(&mut self, channel: &Channel<T>) {
        self.channels.insert(channel);
    }

    pub fn start(&mut self) -> Result<()> {
        let stage = match (self.state, self.stage.take()) {
            (StageState::Created, Some(stage)) => stage,
            (_, stage) => {
                self.stage = stage;
                return Err(PipelineError::config(format!(
                    "stage {} was already started",
                    self.name
                )));
            }
        };

        if let Some(missing) = self
            .required
            .iter()
            .find(|name| !self.channels.contains(name))
        {
            let err = PipelineError::config(format!(
                "stage {} requires channel {:?}, registered: {:?}",
                self.name,
                missing,
                self.channels.names()
            ));
            self.stage = Some(stage);
            return Err(err);
        }

        let ctx = StageContext {
            name: self.name.clone(),
            stop_requested: Arc::clone(&self.stop_requested),
            readiness: Arc::clone(&self.readiness),
            channels: self.channels.clone(),
        };
        let finished = Arc::clone(&self.finished);
        let readiness = Arc::clone(&self.readiness);
        let reports_readiness = self.reports_readiness;
        let name = self.name.clone();

        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| stage.run(ctx)));
                match result {
                    Ok(Ok(())) => info!(stage = %name, "stage finished"),
                    Ok(Err(e)) if e.is_end_of_stream() => {
                        info!(stage = %name, "stage stopped: {}", e)
                    }
                    Ok(Err(e)) => {
                        error!(stage = %name, "stage failed: {}", e);
                        if reports_readiness && readiness.get() == Readiness::Pending {
                            readiness.set_failed(e.to_string());
                        }
                    }
                    Err(_) => error!(stage = %name, "stage panicked"),
                }
                if reports_readiness && readiness.get() == Readiness::Pending {
                    readiness.set_failed("stage exited before reporting ready".to_string());
                }
                finished.store(true, Ordering::SeqCst);
            })?;

        self.handle = Some(handle);
        self.state = StageState::Started;
        info!(stage = %self.name, "stage started");
        Ok(())
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness.get()
    }

    /// 轮询就绪标志, 超过耐心时间视为部署错误
    pub fn wait_ready(&self, patience: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            match self.readiness.get() {
                Readiness::Ready => {
                    info!(stage = %self.name, "stage ready after {:?}", start.elapsed());
                    return Ok(());
                }
                Readiness::Failed => return Err(PipelineError::ModelLoad(self.readiness.reason())),
                Readiness::Pending => {}
            }
            if start.elapsed() >= patience {
                return Err(PipelineError::ReadinessTimeout {
                    stage: self.name.clone(),
                    waited: start.elapsed(),
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// 工作线程已自行结束
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// 两阶段停止, 总会在宽限期后返回
    pub fn stop(&mut self) -> StopOutcome {
        match self.state {
            StageState::Created => {
                self.channels.drain_all();
                self.state = StageState::Drained;
                return StopOutcome::NotStarted;
            }
            StageState::Drained => return self.outcome,
            _ => {}
        }

        self.stop_requested.store(true, Ordering::SeqCst);
        self.state = StageState::StopRequested;

        let deadline = Instant::now() + self.grace;
        while !self.is_finished() && Instant::now() < deadline {
            thread::sleep(POLL_INTERVAL);
        }

        self.outcome = if self.is_finished() {
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
            self.state = StageState::GracefullyFinished;
            StopOutcome::GracefullyFinished
        } else {
            warn!(
                stage = %self.name,
                "stage did not finish within {:?}, abandoning its thread", self.grace
            );
            // 无法强杀线程: 放弃句柄, 线程退出时自行回收
            self.handle = None;
            self.state = StageState::ForceTerminated;
            StopOutcome::ForceTerminated
        };

        let dropped = self.channels.drain_all();
        if dropped > 0 {
            debug!(stage = %self.name, dropped, "drained buffered payloads");
        }
        self.state = StageState::Drained;
        self.outcome
    }

    /// 等待自然结束 (已停止或已回收则立即返回)
    pub fn join(&mut self) {
        if self.state != StageState::Started {
            return;
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(stage = %self.name, "stage thread panicked outside the stage boundary");
            }
        }
        self.outcome = StopOutcome::GracefullyFinished;
        self.state = StageState::GracefullyFinished;
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if matches!(self.state, StageState::Started | StageState::StopRequested) {
            self.stop();
        }
    }
}
