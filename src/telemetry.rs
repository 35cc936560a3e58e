//! 日志与遥测
//!
//! - `init_logging`: 安装 tracing-subscriber (EnvFilter, RUST_LOG 优先)
//! - `TelemetryRecord`: 每个区间的三项计数, 6字节小端编码
//! - `TelemetryStage`: 定时取走区间计数交给 `TelemetrySink`

use std::fmt::Write as _;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::Result;
use crate::statistics::{SharedStatistics, StatisticsSnapshot};
use crate::supervisor::{Stage, StageContext};

/// 初始化日志, `RUST_LOG` 存在时优先于 `level`
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // 重复初始化 (测试中) 忽略
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}

// ========== 遥测记录 ==========

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TelemetryRecord {
    pub varroa_count: i16,
    pub bees_in: i16,
    pub bees_out: i16,
}

fn saturate(value: u64) -> i16 {
    value.min(i16::MAX as u64) as i16
}

impl From<StatisticsSnapshot> for TelemetryRecord {
    fn from(snapshot: StatisticsSnapshot) -> Self {
        Self {
            varroa_count: saturate(snapshot.varroa_count),
            bees_in: saturate(snapshot.bees_in),
            bees_out: saturate(snapshot.bees_out),
        }
    }
}

impl TelemetryRecord {
    /// varroa, beesIn, beesOut 依次小端编码
    pub fn to_le_bytes(&self) -> [u8; 6] {
        let mut bytes = [0u8; 6];
        bytes[0..2].copy_from_slice(&self.varroa_count.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.bees_in.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.bees_out.to_le_bytes());
        bytes
    }

    pub fn to_hex(&self) -> String {
        self.to_le_bytes()
            .iter()
            .fold(String::with_capacity(12), |mut hex, byte| {
                let _ = write!(hex, "{byte:02X}");
                hex
            })
    }
}

// ========== 遥测输出 ==========

/// 遥测传输 (LoRa网关、HTTP等由使用方实现)
pub trait TelemetrySink: Send {
    fn send(&mut self, record: &TelemetryRecord) -> anyhow::Result<()>;
}

/// 只写日志的默认实现
#[derive(Debug, Default)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn send(&mut self, record: &TelemetryRecord) -> anyhow::Result<()> {
        info!(
            varroa = record.varroa_count,
            bees_in = record.bees_in,
            bees_out = record.bees_out,
            payload = %record.to_hex(),
            "telemetry"
        );
        Ok(())
    }
}

// ========== 遥测阶段 ==========

pub struct TelemetryStage {
    sink: Box<dyn TelemetrySink>,
    stats: SharedStatistics,
    interval: Duration,
    failures: u64,
}

impl TelemetryStage {
    pub fn new(sink: Box<dyn TelemetrySink>, stats: SharedStatistics, interval: Duration) -> Self {
        Self {
            sink,
            stats,
            interval,
            failures: 0,
        }
    }

    fn publish(&mut self) {
        let record = TelemetryRecord::from(self.stats.take_interval());
        if let Err(e) = self.sink.send(&record) {
            self.failures += 1;
            warn!(failures = self.failures, "telemetry send failed: {:#}", e);
        }
    }
}

impl Stage for TelemetryStage {
    fn name(&self) -> &str {
        "telemetry"
    }

    fn run(mut self: Box<Self>, ctx: StageContext) -> Result<()> {
        info!(interval = ?self.interval, "telemetry running");
        let mut next = Instant::now() + self.interval;
        while !ctx.should_stop() {
            let now = Instant::now();
            if now >= next {
                self.publish();
                next += self.interval;
                continue;
            }
            ctx.sleep(next - now);
        }

        let drops = self.stats.drops();
        info!(
            cumulative = ?self.stats.cumulative(),
            ?drops,
            failures = self.failures,
            "telemetry stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statistics::StatisticsRegistry;
    use crate::supervisor::Supervisor;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_record_encoding() {
        let record = TelemetryRecord {
            varroa_count: 1,
            bees_in: 258,
            bees_out: -1,
        };
        assert_eq!(record.to_le_bytes(), [0x01, 0x00, 0x02, 0x01, 0xFF, 0xFF]);
        assert_eq!(record.to_hex(), "01000201FFFF");
    }

    #[test]
    fn test_record_saturates() {
        let record = TelemetryRecord::from(StatisticsSnapshot {
            varroa_count: 3,
            bees_in: 100_000,
            bees_out: 7,
            frames_processed: 9,
        });
        assert_eq!(record.bees_in, i16::MAX);
        assert_eq!(record.varroa_count, 3);
        assert_eq!(record.bees_out, 7);
    }

    struct Recording {
        records: Arc<Mutex<Vec<TelemetryRecord>>>,
        fail: bool,
    }

    impl TelemetrySink for Recording {
        fn send(&mut self, record: &TelemetryRecord) -> anyhow::Result<()> {
            self.records.lock().unwrap().push(*record);
            if self.fail {
                anyhow::bail!("gateway offline");
            }
            Ok(())
        }
    }

    #[test]
    fn test_stage_takes_interval_counters() {
        let stats = StatisticsRegistry::shared();
        stats.bee_in();
        stats.bee_in();
        stats.bee_out();

        let records = Arc::new(Mutex::new(Vec::new()));
        let sink = Recording {
            records: Arc::clone(&records),
            fail: true,
        };
        let mut supervisor = Supervisor::new(TelemetryStage::new(
            Box::new(sink),
            Arc::clone(&stats),
            Duration::from_millis(20),
        ));
        supervisor.start().unwrap();

        let start = Instant::now();
        while records.lock().unwrap().len() < 2 && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(5));
        }
        supervisor.stop();

        // 发送失败不影响后续区间
        let records = records.lock().unwrap();
        assert!(records.len() >= 2);
        assert_eq!(records[0].bees_in, 2);
        assert_eq!(records[0].bees_out, 1);
        assert_eq!(records[1], TelemetryRecord::default());
        assert_eq!(stats.cumulative().bees_in, 2);
        assert_eq!(stats.interval().bees_in, 0);
    }
}
