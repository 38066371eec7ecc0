//! 实时显示输出端
//!
//! [`LiveScope`] 从批次中挑出要显示的通道，经触发门控后写入 [`LiveBuffer`]；
//! 显示端（GUI、终端、远程镜像）通过 [`LiveScope::buffer`] 取快照。

use crate::condition::EdgeTrigger;
use crate::live_buffer::{DisplayMode, LiveBuffer};
use crate::runner::SinkRunner;
use canpdo_driver::{BatchSink, SinkError};
use canpdo_protocol::Batch;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Span, debug, info_span};

/// Y 轴范围
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum YRange {
    /// `[-v, v]`
    Symmetric(f64),
    /// `[min, max]`
    Bounds([f64; 2]),
}

/// 显示设置
///
/// 点数、采样率、时长三者给出任意两个，第三个由 [`ScopeSettings::timebase`] 推出。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeSettings {
    pub signals: Vec<String>,
    #[serde(default)]
    pub nsamples: Option<usize>,
    #[serde(default)]
    pub samplerate: Option<f64>,
    #[serde(default)]
    pub samplelength: Option<f64>,
    #[serde(default)]
    pub mode: DisplayMode,
    #[serde(default)]
    pub trigger: Option<EdgeTrigger>,
    #[serde(default = "default_time_zero")]
    pub time_zero: bool,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub yrange: Option<YRange>,
}

fn default_time_zero() -> bool {
    true
}

/// 推导后的时间基准
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timebase {
    pub nsamples: usize,
    pub samplerate: f64,
    pub samplelength: f64,
}

impl ScopeSettings {
    pub fn new<I, S>(signals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            signals: signals.into_iter().map(Into::into).collect(),
            nsamples: None,
            samplerate: None,
            samplelength: None,
            mode: DisplayMode::Rolling,
            trigger: None,
            time_zero: true,
            title: String::new(),
            yrange: None,
        }
    }

    pub fn with_nsamples(mut self, nsamples: usize) -> Self {
        self.nsamples = Some(nsamples);
        self
    }

    pub fn with_samplerate(mut self, samplerate: f64) -> Self {
        self.samplerate = Some(samplerate);
        self
    }

    pub fn with_samplelength(mut self, samplelength: f64) -> Self {
        self.samplelength = Some(samplelength);
        self
    }

    pub fn with_mode(mut self, mode: DisplayMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_trigger(mut self, trigger: EdgeTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_time_zero(mut self, time_zero: bool) -> Self {
        self.time_zero = time_zero;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_yrange(mut self, yrange: YRange) -> Self {
        self.yrange = Some(yrange);
        self
    }

    /// 由三者中给定的两个推导时间基准
    pub fn timebase(&self) -> Result<Timebase, SinkError> {
        let (nsamples, samplerate, samplelength) =
            match (self.nsamples, self.samplerate, self.samplelength) {
                (None, Some(rate), Some(length)) => ((rate * length).round() as usize, rate, length),
                (Some(n), None, Some(length)) => (n, n as f64 / length, length),
                (Some(n), Some(rate), None) => (n, rate, n as f64 / rate),
                _ => {
                    return Err(SinkError::InvalidSettings(
                        "exactly two of nsamples, samplerate and samplelength are required".into(),
                    ));
                },
            };
        if nsamples == 0 || !samplerate.is_finite() || samplerate <= 0.0 {
            return Err(SinkError::InvalidSettings(format!(
                "invalid timebase: {} samples at {} Hz",
                nsamples, samplerate
            )));
        }
        Ok(Timebase {
            nsamples,
            samplerate,
            samplelength,
        })
    }

    /// 时间是否在触发点归零（无触发或滚动模式时无效）
    pub fn effective_time_zero(&self) -> bool {
        self.time_zero && self.trigger.is_some() && self.mode != DisplayMode::Rolling
    }
}

/// 触发门控采集
struct Capture {
    signals: Vec<String>,
    trigger: Option<EdgeTrigger>,
    time_zero: bool,
    triggered: bool,
    time_offset: f64,
    values: Vec<f64>,
}

impl Capture {
    fn new(settings: &ScopeSettings) -> Self {
        Self {
            signals: settings.signals.clone(),
            trigger: settings.trigger.clone(),
            time_zero: settings.effective_time_zero(),
            triggered: false,
            time_offset: 0.0,
            values: Vec::with_capacity(settings.signals.len()),
        }
    }

    fn feed(&mut self, batch: &Batch, buffer: &LiveBuffer) -> Result<(), SinkError> {
        self.values.clear();
        self.values
            .extend(self.signals.iter().filter_map(|name| batch.value(name)));
        if self.values.is_empty() {
            debug!("No matching signal names in batch {}", batch.index);
            return Ok(());
        }
        if self.values.len() != self.signals.len() {
            return Err(SinkError::ChannelMismatch {
                expected: self.signals.len(),
                actual: self.values.len(),
            });
        }

        let Some(trigger) = self.trigger.as_mut() else {
            buffer.append(&self.values, batch.time)?;
            return Ok(());
        };
        let Some(level) = batch.value(&trigger.channel) else {
            return Err(SinkError::UnknownTrigger {
                channel: trigger.channel.clone(),
            });
        };

        if !self.triggered {
            if !trigger.check_value(level) {
                return Ok(());
            }
            debug!("Triggered at t={}", batch.time);
            self.triggered = true;
            if self.time_zero {
                self.time_offset = batch.time;
            }
        }

        if buffer.append(&self.values, batch.time - self.time_offset)? {
            debug!("Buffer full, rearming trigger");
            trigger.rearm(Some(level));
            self.triggered = false;
        }
        Ok(())
    }
}

/// 实时显示输出端
pub struct LiveScope {
    settings: ScopeSettings,
    timebase: Timebase,
    buffer: Arc<LiveBuffer>,
    capture: Mutex<Option<Capture>>,
    runner: SinkRunner,
}

impl LiveScope {
    /// 默认输入队列容量
    pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

    pub fn new(settings: ScopeSettings) -> Result<Self, SinkError> {
        if settings.signals.is_empty() {
            return Err(SinkError::InvalidSettings("no signals to display".into()));
        }
        let timebase = settings.timebase()?;
        let buffer = Arc::new(LiveBuffer::new(
            settings.signals.clone(),
            timebase.nsamples,
            settings.mode,
        ));
        let name = if settings.title.is_empty() {
            "scope".to_string()
        } else {
            settings.title.clone()
        };
        Ok(Self {
            capture: Mutex::new(Some(Capture::new(&settings))),
            runner: SinkRunner::new(
                name,
                Self::DEFAULT_QUEUE_CAPACITY,
                Duration::from_secs(1),
                info_span!("scope"),
            ),
            settings,
            timebase,
            buffer,
        })
    }

    /// 修改输入队列容量（启动前）
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        let span = self.runner.span.clone();
        self.runner = SinkRunner::new(
            self.runner.name().to_string(),
            capacity,
            Duration::from_secs(1),
            span,
        );
        self
    }

    /// 指定日志 span
    pub fn with_span(mut self, span: Span) -> Self {
        self.runner.span = span;
        self
    }

    pub fn settings(&self) -> &ScopeSettings {
        &self.settings
    }

    pub fn timebase(&self) -> Timebase {
        self.timebase
    }

    /// 显示端读取用的缓冲区
    pub fn buffer(&self) -> &Arc<LiveBuffer> {
        &self.buffer
    }
}

impl BatchSink for LiveScope {
    fn name(&self) -> &str {
        self.runner.name()
    }

    fn start(&self) -> Result<(), SinkError> {
        let Some(mut capture) = self.capture.lock().take() else {
            return Err(SinkError::AlreadyStarted);
        };
        let buffer = self.buffer.clone();
        self.runner.spawn(move |input| {
            while let Some(batch) = input.get() {
                capture.feed(&batch, &buffer)?;
            }
            Ok(())
        })
    }

    fn put(&self, batch: Arc<Batch>) -> Result<(), SinkError> {
        self.runner.put(batch)
    }

    fn is_active(&self) -> bool {
        self.runner.is_active()
    }

    fn stop(&self, flush: bool) -> Result<(), SinkError> {
        self.runner.stop(flush)
    }

    fn take_fault(&self) -> Option<SinkError> {
        self.runner.take_fault()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Edge;
    use canpdo_protocol::Sample;

    fn batch(index: u64, signal: f64, trig: f64) -> Batch {
        let time = index as f64 / 10.0;
        let mut batch = Batch::new(index, time);
        batch.push(Sample::new("signal", signal).at(index, time, 0.0));
        batch.push(Sample::new("trig", trig).at(index, time, 0.0));
        batch
    }

    #[test]
    fn test_timebase_combinations() {
        let base = ScopeSettings::new(["a"]);
        let tb = base.clone().with_samplerate(1000.0).with_samplelength(0.5).timebase().unwrap();
        assert_eq!(tb.nsamples, 500);
        let tb = base.clone().with_nsamples(200).with_samplelength(2.0).timebase().unwrap();
        assert_eq!(tb.samplerate, 100.0);
        let tb = base.clone().with_nsamples(200).with_samplerate(100.0).timebase().unwrap();
        assert_eq!(tb.samplelength, 2.0);

        assert!(base.clone().with_nsamples(10).timebase().is_err());
        assert!(
            base.with_nsamples(10)
                .with_samplerate(1.0)
                .with_samplelength(10.0)
                .timebase()
                .is_err()
        );
    }

    #[test]
    fn test_time_zero_needs_trigger_and_non_rolling() {
        let settings = ScopeSettings::new(["a"]).with_nsamples(10).with_samplerate(10.0);
        assert!(!settings.effective_time_zero());
        let triggered = settings.with_trigger(EdgeTrigger::new("a", Edge::Rising));
        assert!(!triggered.effective_time_zero());
        assert!(triggered.with_mode(DisplayMode::Redraw).effective_time_zero());
    }

    #[test]
    fn test_free_run_appends_everything() {
        let settings = ScopeSettings::new(["signal"]).with_nsamples(4).with_samplerate(10.0);
        let buffer = LiveBuffer::new(settings.signals.clone(), 4, settings.mode);
        let mut capture = Capture::new(&settings);
        for i in 0..6 {
            capture.feed(&batch(i, i as f64, 0.0), &buffer).unwrap();
        }
        let view = buffer.get_view().unwrap();
        assert_eq!(view.get("signal").unwrap(), &[2.0, 3.0, 4.0, 5.0]);
        // 触发通道未显示
        assert!(view.get("trig").is_none());
    }

    #[test]
    fn test_trigger_gates_capture_and_zeroes_time() {
        let settings = ScopeSettings::new(["signal"])
            .with_nsamples(3)
            .with_samplerate(10.0)
            .with_mode(DisplayMode::Redraw)
            .with_trigger(EdgeTrigger::new("trig", Edge::Rising));
        let buffer = LiveBuffer::new(settings.signals.clone(), 3, settings.mode);
        let mut capture = Capture::new(&settings);

        let trig = [-1.0, -1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
        for (i, &t) in trig.iter().enumerate() {
            capture.feed(&batch(i as u64, i as f64 * 10.0, t), &buffer).unwrap();
        }
        // 第 3 个批次触发，采满 3 个点后重新布防（基线为 1，不会再触发）
        let view = buffer.get_view().unwrap();
        assert_eq!(view.get("signal").unwrap(), &[20.0, 30.0, 40.0]);
        assert_eq!(view.time.len(), 3);
        assert_eq!(view.time[0], 0.0);
        assert!((view.time[2] - 0.2).abs() < 1e-9);
        assert!(!capture.triggered);
    }

    #[test]
    fn test_retrigger_after_rearm() {
        let settings = ScopeSettings::new(["signal"])
            .with_nsamples(2)
            .with_samplerate(10.0)
            .with_mode(DisplayMode::Redraw)
            .with_time_zero(false)
            .with_trigger(EdgeTrigger::new("trig", Edge::Rising));
        let buffer = LiveBuffer::new(settings.signals.clone(), 2, settings.mode);
        let mut capture = Capture::new(&settings);

        let trig = [-1.0, 1.0, 1.0, -1.0, -1.0, 1.0, 1.0];
        for (i, &t) in trig.iter().enumerate() {
            capture.feed(&batch(i as u64, i as f64, t), &buffer).unwrap();
        }
        let view = buffer.get_view().unwrap();
        assert_eq!(view.get("signal").unwrap(), &[5.0, 6.0]);
        // 未归零：保留绝对时间
        assert!((view.time[0] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_missing_signal_is_fatal() {
        let settings = ScopeSettings::new(["signal", "other"])
            .with_nsamples(2)
            .with_samplerate(10.0);
        let buffer = LiveBuffer::new(settings.signals.clone(), 2, settings.mode);
        let mut capture = Capture::new(&settings);
        assert_eq!(
            capture.feed(&batch(0, 1.0, 0.0), &buffer),
            Err(SinkError::ChannelMismatch {
                expected: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn test_unknown_trigger_channel_is_fatal() {
        let settings = ScopeSettings::new(["signal"])
            .with_nsamples(2)
            .with_samplerate(10.0)
            .with_mode(DisplayMode::Redraw)
            .with_trigger(EdgeTrigger::new("trgi", Edge::Rising));
        let buffer = LiveBuffer::new(settings.signals.clone(), 2, settings.mode);
        let mut capture = Capture::new(&settings);
        assert_eq!(
            capture.feed(&batch(0, 1.0, 0.0), &buffer),
            Err(SinkError::UnknownTrigger {
                channel: "trgi".into()
            })
        );
        assert!(buffer.get_view().is_none());
    }

    #[test]
    fn test_unknown_trigger_stops_scope() {
        let scope = LiveScope::new(
            ScopeSettings::new(["signal"])
                .with_nsamples(5)
                .with_samplerate(10.0)
                .with_mode(DisplayMode::Redraw)
                .with_trigger(EdgeTrigger::new("missing", Edge::Either)),
        )
        .unwrap();
        scope.start().unwrap();
        scope.put(Arc::new(batch(0, 1.0, 0.0))).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while scope.is_active() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!scope.is_active());
        let _ = scope.stop(false);
        assert_eq!(
            scope.take_fault(),
            Some(SinkError::UnknownTrigger {
                channel: "missing".into()
            })
        );
    }

    #[test]
    fn test_scope_sink_lifecycle() {
        let scope = LiveScope::new(
            ScopeSettings::new(["signal"])
                .with_nsamples(5)
                .with_samplerate(10.0)
                .with_title("test"),
        )
        .unwrap();
        assert_eq!(scope.name(), "test");
        scope.start().unwrap();
        assert!(scope.is_active());
        for i in 0..5 {
            scope.put(Arc::new(batch(i, i as f64, 0.0))).unwrap();
        }
        scope.stop(true).unwrap();
        assert!(!scope.is_active());
        let view = scope.buffer().get_view().unwrap();
        assert_eq!(view.len(), 5);
        assert_eq!(scope.start(), Err(SinkError::AlreadyStarted));
    }

    #[test]
    fn test_settings_deserialize() {
        let settings: ScopeSettings = serde_json::from_str(
            r#"{"signals":["a","b"],"nsamples":100,"samplerate":1000.0,"mode":"Sliding",
                "trigger":{"channel":"a","edge":"Falling","threshold":0.5},"yrange":[-1.0,2.0]}"#,
        )
        .unwrap();
        assert_eq!(settings.mode, DisplayMode::Sliding);
        assert!(settings.time_zero);
        assert_eq!(settings.yrange, Some(YRange::Bounds([-1.0, 2.0])));
        assert_eq!(settings.trigger.unwrap().threshold, 0.5);
    }
}
