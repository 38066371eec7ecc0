//! 解码后的数据点与批次

/// 单个通道在某一时刻的数值
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Sample {
    /// 通道名
    pub name: String,
    /// 数值（已校准）
    pub value: f64,
    /// 校准前的原始值（仅当帧格式对该槽位配置了增益/偏移）
    pub raw_value: Option<f64>,
    /// 来源帧的到达时间（秒）
    pub timestamp: f64,
    /// 采样时间：`index / sample_rate_hz`
    pub time: f64,
    /// 采样序号，从 0 开始严格递增
    pub index: u64,
}

impl Sample {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            raw_value: None,
            timestamp: 0.0,
            time: 0.0,
            index: 0,
        }
    }

    /// 设置时间信息
    pub fn at(mut self, index: u64, time: f64, timestamp: f64) -> Self {
        self.index = index;
        self.time = time;
        self.timestamp = timestamp;
        self
    }

    pub fn with_raw(mut self, raw_value: Option<f64>) -> Self {
        self.raw_value = raw_value;
        self
    }
}

/// 同一采样序号下所有通道的数据（一个总线周期）
///
/// 样本顺序与 `Format` 的周期顺序、槽位顺序一致。
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Batch {
    pub index: u64,
    pub time: f64,
    samples: Vec<Sample>,
}

impl Batch {
    pub fn new(index: u64, time: f64) -> Self {
        Self {
            index,
            time,
            samples: Vec::new(),
        }
    }

    /// 由已有样本构建（`index`/`time` 取自第一个样本）
    pub fn from_samples(samples: Vec<Sample>) -> Self {
        let (index, time) = samples
            .first()
            .map(|sample| (sample.index, sample.time))
            .unwrap_or((0, 0.0));
        Self {
            index,
            time,
            samples,
        }
    }

    pub fn with_capacity(index: u64, time: f64, capacity: usize) -> Self {
        Self {
            index,
            time,
            samples: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut Vec<Sample> {
        &mut self.samples
    }

    pub fn into_samples(self) -> Vec<Sample> {
        self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// 按名字查找第一个匹配的样本
    pub fn get(&self, name: &str) -> Option<&Sample> {
        self.samples.iter().find(|sample| sample.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Sample> {
        self.samples.iter_mut().find(|sample| sample.name == name)
    }

    /// 按名字取数值
    pub fn value(&self, name: &str) -> Option<f64> {
        self.get(name).map(|sample| sample.value)
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.samples.iter().map(|sample| sample.name.as_str())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Sample> {
        self.samples.iter()
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a Sample;
    type IntoIter = std::slice::Iter<'a, Sample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.iter()
    }
}
