//! 远程镜像
//!
//! 把显示配置和批次转发给另一进程（远程显示端）。每条消息：
//!
//! ```text
//! +------+----------------+-----------------+
//! | kind | length (u16 BE)| payload (JSON)  |
//! +------+----------------+-----------------+
//! ```
//!
//! `length` 含 3 字节头部。`kind = 1` 为显示配置（[`ScopeSettings`] 列表），
//! `kind = 2` 为一个批次的样本列表。

use crate::runner::SinkRunner;
use crate::scope::ScopeSettings;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use canpdo_driver::{BatchSink, SinkError};
use canpdo_protocol::{Batch, Sample};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{Span, debug, info_span};

/// 头部长度：kind(1) + length(2)
pub const HEADER_LEN: usize = 3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MirrorError {
    #[error("Unknown message kind: {0}")]
    UnknownKind(u8),

    #[error("Message too large: {len} bytes")]
    TooLarge { len: usize },

    #[error("Invalid message length: {len}")]
    InvalidLength { len: usize },

    #[error("JSON error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for MirrorError {
    fn from(e: serde_json::Error) -> Self {
        MirrorError::Json(e.to_string())
    }
}

impl From<MirrorError> for SinkError {
    fn from(e: MirrorError) -> Self {
        SinkError::Write(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    WindowConfig = 1,
    Batch = 2,
}

impl TryFrom<u8> for MessageKind {
    type Error = MirrorError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageKind::WindowConfig),
            2 => Ok(MessageKind::Batch),
            other => Err(MirrorError::UnknownKind(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MirrorMessage {
    pub kind: MessageKind,
    pub payload: Bytes,
}

impl MirrorMessage {
    pub fn window_config(scopes: &[ScopeSettings]) -> Result<Self, MirrorError> {
        Ok(Self {
            kind: MessageKind::WindowConfig,
            payload: Bytes::from(serde_json::to_vec(scopes)?),
        })
    }

    pub fn batch(batch: &Batch) -> Result<Self, MirrorError> {
        Ok(Self {
            kind: MessageKind::Batch,
            payload: Bytes::from(serde_json::to_vec(batch.samples())?),
        })
    }

    /// 编码为线上格式
    pub fn encode(&self) -> Result<Bytes, MirrorError> {
        let len = HEADER_LEN + self.payload.len();
        let wire_len = u16::try_from(len).map_err(|_| MirrorError::TooLarge { len })?;
        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8(self.kind as u8);
        buf.put_u16(wire_len);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode_batch(&self) -> Result<Batch, MirrorError> {
        let samples: Vec<Sample> = serde_json::from_slice(&self.payload)?;
        Ok(Batch::from_samples(samples))
    }

    pub fn decode_window_config(&self) -> Result<Vec<ScopeSettings>, MirrorError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// 流式解码器：按任意分片喂入字节，逐条取出完整消息
#[derive(Debug, Default)]
pub struct MirrorDecoder {
    buf: BytesMut,
}

impl MirrorDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// 尚未构成完整消息的字节数
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn next_message(&mut self) -> Result<Option<MirrorMessage>, MirrorError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let kind = MessageKind::try_from(self.buf[0])?;
        let len = u16::from_be_bytes([self.buf[1], self.buf[2]]) as usize;
        if len < HEADER_LEN {
            return Err(MirrorError::InvalidLength { len });
        }
        if self.buf.len() < len {
            return Ok(None);
        }
        let mut frame = self.buf.split_to(len);
        frame.advance(HEADER_LEN);
        Ok(Some(MirrorMessage {
            kind,
            payload: frame.freeze(),
        }))
    }
}

/// 转发到任意字节流（套接字、管道等）的输出端
pub struct MirrorSink<W: Write + Send + 'static> {
    scopes: Vec<ScopeSettings>,
    out: Mutex<Option<W>>,
    runner: SinkRunner,
}

impl<W: Write + Send + 'static> MirrorSink<W> {
    pub fn new(name: impl Into<String>, out: W, scopes: Vec<ScopeSettings>) -> Self {
        Self {
            scopes,
            out: Mutex::new(Some(out)),
            runner: SinkRunner::new(name.into(), 1000, Duration::from_secs(1), info_span!("mirror")),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.runner.span = span;
        self
    }
}

fn send<W: Write>(out: &mut W, message: &MirrorMessage) -> Result<(), SinkError> {
    out.write_all(&message.encode()?)?;
    Ok(())
}

impl<W: Write + Send + 'static> BatchSink for MirrorSink<W> {
    fn name(&self) -> &str {
        self.runner.name()
    }

    fn start(&self) -> Result<(), SinkError> {
        let Some(mut out) = self.out.lock().take() else {
            return Err(SinkError::AlreadyStarted);
        };
        let config = MirrorMessage::window_config(&self.scopes)?;
        self.runner.spawn(move |input| {
            send(&mut out, &config)?;
            let mut sent = 0u64;
            while let Some(batch) = input.get() {
                send(&mut out, &MirrorMessage::batch(&batch)?)?;
                sent += 1;
            }
            out.flush()?;
            debug!("Mirrored {} batches", sent);
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
    use proptest::prelude::*;

    /// 写入共享缓冲区
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn sample_batch(index: u64) -> Batch {
        let time = index as f64 * 0.001;
        let mut batch = Batch::new(index, time);
        batch.push(Sample::new("641_0", 1.5).at(index, time, 12.0));
        batch.push(Sample::new("641_1", -0.25).at(index, time, 12.0).with_raw(Some(-0.5)));
        batch
    }

    #[test]
    fn test_header_layout() {
        let message = MirrorMessage {
            kind: MessageKind::Batch,
            payload: Bytes::from_static(b"[]"),
        };
        assert_eq!(message.encode().unwrap().as_ref(), &[2, 0, 5, b'[', b']']);
    }

    #[test]
    fn test_too_large() {
        let message = MirrorMessage {
            kind: MessageKind::Batch,
            payload: Bytes::from(vec![0u8; u16::MAX as usize]),
        };
        assert!(matches!(message.encode(), Err(MirrorError::TooLarge { .. })));
    }

    #[test]
    fn test_decoder_rejects_bad_header() {
        let mut decoder = MirrorDecoder::new();
        decoder.feed(&[9, 0, 3]);
        assert_eq!(decoder.next_message(), Err(MirrorError::UnknownKind(9)));

        let mut decoder = MirrorDecoder::new();
        decoder.feed(&[1, 0, 2]);
        assert_eq!(decoder.next_message(), Err(MirrorError::InvalidLength { len: 2 }));
    }

    #[test]
    fn test_batch_survives_wire() {
        let batch = sample_batch(7);
        let wire = MirrorMessage::batch(&batch).unwrap().encode().unwrap();
        let mut decoder = MirrorDecoder::new();
        decoder.feed(&wire);
        let message = decoder.next_message().unwrap().unwrap();
        assert_eq!(message.kind, MessageKind::Batch);
        let decoded = message.decode_batch().unwrap();
        assert_eq!(decoded.index, 7);
        assert_eq!(decoded.samples(), batch.samples());
        assert_eq!(decoder.pending(), 0);
        assert_eq!(decoder.next_message(), Ok(None));
    }

    #[test]
    fn test_mirror_sink_stream() {
        let buf = SharedBuf::default();
        let scopes = vec![ScopeSettings::new(["641_0"]).with_nsamples(10).with_samplerate(100.0)];
        let sink = MirrorSink::new("mirror", buf.clone(), scopes.clone());
        sink.start().unwrap();
        for i in 0..3 {
            sink.put(Arc::new(sample_batch(i))).unwrap();
        }
        sink.stop(true).unwrap();
        assert_eq!(sink.take_fault(), None);

        let mut decoder = MirrorDecoder::new();
        decoder.feed(&buf.0.lock());
        let config = decoder.next_message().unwrap().unwrap();
        assert_eq!(config.kind, MessageKind::WindowConfig);
        assert_eq!(config.decode_window_config().unwrap(), scopes);
        for i in 0..3 {
            let batch = decoder.next_message().unwrap().unwrap().decode_batch().unwrap();
            assert_eq!(batch.index, i);
        }
        assert_eq!(decoder.next_message(), Ok(None));
    }

    proptest! {
        #[test]
        fn test_decoder_handles_any_split(split in 0usize..200) {
            let mut wire = BytesMut::new();
            for i in 0..3 {
                wire.extend_from_slice(&MirrorMessage::batch(&sample_batch(i)).unwrap().encode().unwrap());
            }
            let split = split.min(wire.len());
            let mut decoder = MirrorDecoder::new();
            let mut indices = Vec::new();
            for chunk in [&wire[..split], &wire[split..]] {
                decoder.feed(chunk);
                while let Some(message) = decoder.next_message().unwrap() {
                    indices.push(message.decode_batch().unwrap().index);
                }
            }
            prop_assert_eq!(indices, vec![0, 1, 2]);
        }
    }
}
