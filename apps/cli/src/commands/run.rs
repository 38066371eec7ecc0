//! run 命令
//!
//! 按配置文件（可被命令行参数覆盖）搭建流水线并运行，
//! 直到所有输出端结束、模拟时长用完或收到 Ctrl-C。

use crate::config::{LoggerConfig, PipelineConfig};
use anyhow::{Context, Result};
use canpdo_sdk::prelude::*;
use clap::Args;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, info_span, warn};

/// 运行参数
#[derive(Args, Debug)]
pub struct RunCommand {
    /// 流水线配置文件（TOML）
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// PDO 参数文件（覆盖配置）
    #[arg(short, long)]
    pub params: Option<PathBuf>,

    /// 追加一个 CSV 记录器
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// 记录的行数（仅作用于 --output）
    #[arg(short, long)]
    pub rows: Option<u64>,

    /// 模拟时长（秒，覆盖配置）
    #[arg(short, long)]
    pub duration: Option<f64>,

    /// 虚拟总线帧率（帧/秒，覆盖配置）
    #[arg(long)]
    pub frame_rate: Option<f64>,

    /// 显示快照的打印间隔（毫秒）
    #[arg(long, default_value_t = 500)]
    pub view_interval: u64,
}

impl RunCommand {
    /// 合并配置文件和命令行参数
    pub fn resolve(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(params) = &self.params {
            config.source.params = Some(params.clone());
        }
        if let Some(duration) = self.duration {
            config.source.duration = Some(duration);
        }
        if let Some(frame_rate) = self.frame_rate {
            config.source.frame_rate = frame_rate;
        }
        if let Some(path) = &self.output {
            config.logger.push(LoggerConfig {
                path: path.clone(),
                start: None,
                end: self.rows.map(Condition::count),
                start_at_zero: false,
                queue_capacity: None,
            });
        }
        config.validate()?;
        Ok(config)
    }

    pub fn execute(&self) -> Result<()> {
        let config = self.resolve()?;
        let format = Arc::new(match &config.source.params {
            Some(path) => Format::from_params_file(path),
            None => Format::default_format(),
        });
        info!(
            "Format: {} frames, {} channels at {} Hz",
            format.cycle_len(),
            format.channel_count(),
            format.sample_rate_hz()
        );

        let mut pipeline = Pipeline::build(&config, format)?;
        pipeline.run(Duration::from_millis(self.view_interval.max(10)))
    }
}

/// 模拟 `duration` 秒所需的总线周期数，另加预热消耗的周期
fn source_cycles(duration: f64, format: &Format, warmup_frames: u64) -> u64 {
    let cycle_len = format.cycle_len().max(1) as u64;
    let recorded = (duration * format.sample_rate_hz()).round() as u64;
    recorded + warmup_frames.div_ceil(cycle_len)
}

struct Pipeline {
    monitor: Monitor,
    loggers: Vec<Arc<FileLogger>>,
    scopes: Vec<Arc<LiveScope>>,
}

impl Pipeline {
    fn build(config: &PipelineConfig, format: Arc<Format>) -> Result<Self> {
        let mut assembler_config = AssemblerConfig::default();
        if let Some(warmup) = config.assembler.warmup_frames {
            assembler_config.warmup_frames = warmup;
        }
        if let Some(capacity) = config.assembler.output_capacity {
            assembler_config.output_capacity = capacity;
        }

        let max_cycles = config
            .source
            .duration
            .map(|secs| source_cycles(secs, &format, assembler_config.warmup_frames));
        let producer = VirtualProducer::new(
            (*format).clone(),
            VirtualConfig {
                frame_rate: config.source.frame_rate,
                max_cycles,
                ..Default::default()
            },
        );
        let source: Arc<dyn FrameSource> = Arc::new(
            Device::new(producer, config.device.clone()).with_span(info_span!("virtual")),
        );

        let assembler = SampleAssembler::new(source, format, assembler_config)?;

        let mut monitor_config = MonitorConfig::default();
        if let Some(ms) = config.monitor.supervise_interval {
            monitor_config.supervise_interval = Duration::from_millis(ms);
        }
        let mut monitor = Monitor::new(assembler, monitor_config);

        if !config.calibration.is_empty() {
            monitor.add_filter(config.calibration.iter().cloned().collect::<Calibrator>())?;
        }

        let mut loggers = Vec::new();
        for logger in &config.logger {
            let mut options = LoggerOptions {
                start_at_zero: logger.start_at_zero,
                ..Default::default()
            };
            if let Some(capacity) = logger.queue_capacity {
                options.queue_capacity = capacity;
            }
            let sink = Arc::new(
                FileLogger::create(&logger.path, logger.start.clone(), logger.end.clone(), options)
                    .with_context(|| format!("Failed to create logger {}", logger.path.display()))?,
            );
            monitor.add_sink(sink.clone())?;
            loggers.push(sink);
        }

        let mut scopes = Vec::new();
        for settings in &config.scope {
            let scope = Arc::new(LiveScope::new(settings.clone())?);
            monitor.add_sink(scope.clone())?;
            scopes.push(scope);
        }

        if let Some(mirror) = &config.mirror {
            let file = File::create(&mirror.path)
                .with_context(|| format!("Failed to create mirror {}", mirror.path.display()))?;
            monitor.add_sink(Arc::new(MirrorSink::new(
                "mirror",
                BufWriter::new(file),
                config.scope.clone(),
            )))?;
        }

        Ok(Self {
            monitor,
            loggers,
            scopes,
        })
    }

    fn run(&mut self, view_interval: Duration) -> Result<()> {
        let interrupted = Arc::new(AtomicBool::new(false));
        {
            let interrupted = interrupted.clone();
            ctrlc::set_handler(move || {
                interrupted.store(true, Ordering::SeqCst);
            })
            .context("Failed to install Ctrl-C handler")?;
        }

        self.monitor.start()?;
        info!("Pipeline running, press Ctrl-C to stop");
        let started = Instant::now();

        while self.monitor.is_running() && !self.monitor.wait_timeout(view_interval) {
            if interrupted.load(Ordering::SeqCst) {
                info!("Interrupted");
                break;
            }
            self.print_views();
        }
        let stopped = self.monitor.stop();
        self.print_views();

        let metrics = self.monitor.metrics();
        info!(
            "Ran {:.1} s: {} frames, {} batches, {} ignored, {} dropped by sinks",
            started.elapsed().as_secs_f64(),
            metrics.frames_seen,
            metrics.batches_routed,
            metrics.frames_ignored,
            metrics.sink_drops
        );
        for logger in &self.loggers {
            if let Some(path) = logger.path() {
                println!("{}: {} rows", path.display(), logger.rows());
            }
        }

        let faults = self.monitor.take_faults();
        for fault in &faults {
            warn!("Fault: {}", fault);
        }
        stopped?;
        if let Some(fault) = faults.into_iter().next() {
            anyhow::bail!(fault);
        }
        Ok(())
    }

    fn print_views(&self) {
        for scope in &self.scopes {
            let Some(view) = scope.buffer().get_view() else {
                continue;
            };
            let (Some(first), Some(last)) = (view.time.first(), view.time.last()) else {
                continue;
            };
            let mut line = format!("[{}] {} points, t={:.3}..{:.3}", scope.name(), view.len(), first, last);
            for (name, values) in &view.channels {
                let min = values.iter().copied().fold(f64::INFINITY, f64::min);
                let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                line.push_str(&format!("  {}: [{:.3}, {:.3}]", name, min, max));
            }
            println!("{}", line);
        }
    }
}
