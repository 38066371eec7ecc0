//! 文件记录器
//!
//! 把批次按行写成 CSV：
//!
//! ```text
//! time,<channel>[,<channel>_raw],...
//! <time>,<value>[,<raw_value>],...
//! ```
//!
//! 表头由第一个被接受的批次确定，之后每个批次的通道名和原始值列必须与表头逐列一致，
//! 通道集合变化对该记录器是致命的（不影响流水线其他部分）。
//!
//! 开始条件满足前的批次被丢弃；结束条件在写完一行之后检查，满足即关闭文件。

use crate::condition::Condition;
use crate::runner::{BatchQueue, SinkRunner};
use canpdo_driver::{BatchSink, SinkError};
use canpdo_protocol::Batch;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{Span, debug, info, info_span};

/// 记录器选项
#[derive(Debug, Clone, PartialEq)]
pub struct LoggerOptions {
    /// 输入队列容量（批次）
    pub queue_capacity: usize,
    /// 时间列从 0 开始（减去第一行的时间）
    pub start_at_zero: bool,
    /// 停止时等待写线程退出的超时
    pub join_timeout: Duration,
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            start_at_zero: false,
            join_timeout: Duration::from_secs(2),
        }
    }
}

/// 写一行之后的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Continue,
    Finished,
}

/// 写线程独占的状态
struct LogWriter<W: Write> {
    out: csv::Writer<W>,
    start: Option<Condition>,
    end: Option<Condition>,
    start_at_zero: bool,
    accepting: bool,
    /// 表头中的通道名及是否带原始值列，写表头后确定
    layout: Option<Vec<(String, bool)>>,
    time_offset: f64,
    rows: Arc<AtomicU64>,
    record: Vec<String>,
}

impl<W: Write> LogWriter<W> {
    fn new(out: W, start: Option<Condition>, end: Option<Condition>, start_at_zero: bool) -> Self {
        Self {
            out: csv::Writer::from_writer(out),
            accepting: start.is_none(),
            start,
            end,
            start_at_zero,
            layout: None,
            time_offset: 0.0,
            rows: Arc::new(AtomicU64::new(0)),
            record: Vec::new(),
        }
    }

    fn write_batch(&mut self, batch: &Batch) -> Result<Progress, SinkError> {
        if !self.accepting {
            let Some(start) = self.start.as_mut() else {
                return Ok(Progress::Continue);
            };
            if !start.check(batch) {
                return Ok(Progress::Continue);
            }
            info!("Start condition met at batch {}", batch.index);
            self.accepting = true;
        }

        match &self.layout {
            None => self.write_header(batch)?,
            Some(layout) => check_layout(layout, batch)?,
        }

        self.record.clear();
        self.record.push((batch.time - self.time_offset).to_string());
        for sample in batch {
            self.record.push(sample.value.to_string());
            if let Some(raw) = sample.raw_value {
                self.record.push(raw.to_string());
            }
        }
        self.out.write_record(&self.record).map_err(csv_error)?;
        self.rows.fetch_add(1, Ordering::Relaxed);

        if let Some(end) = self.end.as_mut()
            && end.check(batch)
        {
            info!("End condition met at batch {}", batch.index);
            return Ok(Progress::Finished);
        }
        Ok(Progress::Continue)
    }

    fn write_header(&mut self, batch: &Batch) -> Result<(), SinkError> {
        let layout: Vec<(String, bool)> = batch
            .iter()
            .map(|s| (s.name.clone(), s.raw_value.is_some()))
            .collect();
        let mut header = vec!["time".to_string()];
        header.extend(header_columns(layout.iter().map(|(name, raw)| (name.as_str(), *raw))));
        debug!("Log header: {}", header.join(","));
        self.out.write_record(&header).map_err(csv_error)?;
        self.layout = Some(layout);
        if self.start_at_zero {
            self.time_offset = batch.time;
        }
        Ok(())
    }

    /// 循环写入直到哨兵或结束条件
    fn run(&mut self, input: &BatchQueue) -> Result<(), SinkError> {
        let result = self.drain(input);
        let flushed = self.out.flush().map_err(SinkError::from);
        result.and(flushed)
    }

    fn drain(&mut self, input: &BatchQueue) -> Result<(), SinkError> {
        while let Some(batch) = input.get() {
            if self.write_batch(&batch)? == Progress::Finished {
                break;
            }
        }
        Ok(())
    }
}

/// 数据列名（不含时间列）
fn header_columns<'a>(layout: impl Iterator<Item = (&'a str, bool)>) -> Vec<String> {
    let mut columns = Vec::new();
    for (name, raw) in layout {
        columns.push(name.to_string());
        if raw {
            columns.push(format!("{}_raw", name));
        }
    }
    columns
}

/// 批次的通道名和原始值列必须与表头逐列一致
fn check_layout(layout: &[(String, bool)], batch: &Batch) -> Result<(), SinkError> {
    let expected = layout.iter().map(|(_, raw)| 1 + usize::from(*raw)).sum::<usize>();
    let actual = batch
        .iter()
        .map(|s| 1 + usize::from(s.raw_value.is_some()))
        .sum::<usize>();
    if expected != actual {
        return Err(SinkError::ChannelMismatch { expected, actual });
    }
    let same = layout.len() == batch.len()
        && layout
            .iter()
            .zip(batch.iter())
            .all(|((name, raw), s)| *name == s.name && *raw == s.raw_value.is_some());
    if !same {
        return Err(SinkError::HeaderMismatch {
            expected: header_columns(layout.iter().map(|(n, r)| (n.as_str(), *r))).join(","),
            actual: header_columns(batch.iter().map(|s| (s.name.as_str(), s.raw_value.is_some())))
                .join(","),
        });
    }
    Ok(())
}

fn csv_error(e: csv::Error) -> SinkError {
    SinkError::Write(e.to_string())
}

/// 写 CSV 文件的输出端
pub struct FileLogger {
    path: Option<PathBuf>,
    writer: Mutex<Option<LogWriter<Box<dyn Write + Send>>>>,
    rows: Arc<AtomicU64>,
    runner: SinkRunner,
}

impl FileLogger {
    /// 创建（截断）文件
    pub fn create(
        path: impl AsRef<Path>,
        start: Option<Condition>,
        end: Option<Condition>,
        options: LoggerOptions,
    ) -> Result<Self, SinkError> {
        let path = path.as_ref();
        let file = File::create(path)
            .map_err(|e| SinkError::Write(format!("{}: {}", path.display(), e)))?;
        let name = path
            .file_name()
            .map_or_else(|| "log".to_string(), |n| n.to_string_lossy().into_owned());
        let mut logger = Self::from_writer(name, BufWriter::new(file), start, end, options);
        logger.path = Some(path.to_path_buf());
        Ok(logger)
    }

    /// 写入任意输出（测试或管道）
    pub fn from_writer(
        name: impl Into<String>,
        out: impl Write + Send + 'static,
        start: Option<Condition>,
        end: Option<Condition>,
        options: LoggerOptions,
    ) -> Self {
        let out: Box<dyn Write + Send> = Box::new(out);
        let writer = LogWriter::new(out, start, end, options.start_at_zero);
        let rows = writer.rows.clone();
        Self {
            path: None,
            writer: Mutex::new(Some(writer)),
            rows,
            runner: SinkRunner::new(
                name.into(),
                options.queue_capacity,
                options.join_timeout,
                info_span!("logger"),
            ),
        }
    }

    /// 指定日志 span
    pub fn with_span(mut self, span: Span) -> Self {
        self.runner.span = span;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// 已写入的数据行数（不含表头）
    pub fn rows(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }
}

impl BatchSink for FileLogger {
    fn name(&self) -> &str {
        self.runner.name()
    }

    fn start(&self) -> Result<(), SinkError> {
        let Some(mut writer) = self.writer.lock().take() else {
            return Err(SinkError::AlreadyStarted);
        };
        if let Some(path) = &self.path {
            info!("Logging to {}", path.display());
        }
        self.runner.spawn(move |input| writer.run(input))
    }

    fn put(&self, batch: Arc<Batch>) -> Result<(), SinkError> {
        self.runner.put(batch)
    }

    fn is_active(&self) -> bool {
        self.runner.is_active()
    }

    fn stop(&self, flush: bool) -> Result<(), SinkError> {
        let result = self.runner.stop(flush);
        debug!("Logger {} wrote {} rows", self.runner.name(), self.rows());
        result
    }

    fn take_fault(&self) -> Option<SinkError> {
        self.runner.take_fault()
    }
}
