//! 流水线配置文件（TOML）
//!
//! ```toml
//! [source]
//! params = "pdo.params"      # 缺省或读不到时使用默认格式
//! frame_rate = 4000.0
//! duration = 10.0            # 秒，缺省不限
//!
//! [device]
//! queue_capacity = 8000
//!
//! [assembler]
//! warmup_frames = 1000
//!
//! [[calibration]]
//! source_name = "641_0"
//! gain = 2.0
//! target_name = "speed"
//!
//! [[logger]]
//! path = "run.csv"
//! start = { kind = "Edge", channel = "385_0", edge = "Rising", threshold = 0.5 }
//! end = { kind = "Count", count = 10000 }
//!
//! [[scope]]
//! signals = ["385_0", "641_1"]
//! nsamples = 500
//! samplerate = 1000.0
//! mode = "Redraw"
//!
//! [mirror]
//! path = "mirror.bin"
//! ```

use anyhow::{Context, Result};
use canpdo_sdk::can::DeviceConfig;
use canpdo_sdk::driver::Calibration;
use canpdo_sdk::sinks::{Condition, ScopeSettings};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default)]
    pub source: SourceConfig,
    /// 帧队列与帧率检查
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub assembler: AssemblerSection,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub calibration: Vec<Calibration>,
    #[serde(default)]
    pub logger: Vec<LoggerConfig>,
    #[serde(default)]
    pub scope: Vec<ScopeSettings>,
    #[serde(default)]
    pub mirror: Option<MirrorConfig>,
}

/// 虚拟帧来源
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// `key = value` 参数文件
    pub params: Option<PathBuf>,
    #[serde(default = "default_frame_rate")]
    pub frame_rate: f64,
    /// 模拟时长（秒）
    pub duration: Option<f64>,
}

fn default_frame_rate() -> f64 {
    4000.0
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            params: None,
            frame_rate: default_frame_rate(),
            duration: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssemblerSection {
    pub warmup_frames: Option<u64>,
    pub output_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorSection {
    /// 毫秒
    pub supervise_interval: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggerConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub start: Option<Condition>,
    #[serde(default)]
    pub end: Option<Condition>,
    #[serde(default)]
    pub start_at_zero: bool,
    pub queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MirrorConfig {
    pub path: PathBuf,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid pipeline file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// 检查显示设置能否推出时间基准
    pub fn validate(&self) -> Result<()> {
        for (i, scope) in self.scope.iter().enumerate() {
            scope
                .timebase()
                .with_context(|| format!("scope #{} ({:?})", i + 1, scope.signals))?;
        }
        if let Some(duration) = self.source.duration
            && (!duration.is_finite() || duration <= 0.0)
        {
            anyhow::bail!("source.duration must be positive, got {}", duration);
        }
        if self.device.queue_capacity == 0 {
            anyhow::bail!("device.queue_capacity must be positive");
        }
        if !self.source.frame_rate.is_finite() || self.source.frame_rate <= 0.0 {
            anyhow::bail!("source.frame_rate must be positive, got {}", self.source.frame_rate);
        }
        Ok(())
    }
}
