//! 批次过滤与线性校准
//!
//! 过滤器在分发之前按注册顺序作用于批次，此时批次仍由路由线程独占，
//! 可以原地修改。

use canpdo_protocol::{Batch, Sample};

/// 批次过滤器
pub trait BatchFilter: Send {
    fn apply(&self, batch: &mut Batch);
}

/// 单通道校准规则：`value' = (value + offset) * gain`
///
/// - 无 `target_name`：原地替换数值
/// - 有 `target_name` 且 `keep_source == false`：原地改名并替换数值
/// - 有 `target_name` 且 `keep_source == true`：保留原样本，追加新样本
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Calibration {
    pub source_name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub offset: f64,
    #[cfg_attr(feature = "serde", serde(default = "default_gain"))]
    pub gain: f64,
    #[cfg_attr(feature = "serde", serde(default))]
    pub target_name: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub keep_source: bool,
}

#[cfg(feature = "serde")]
fn default_gain() -> f64 {
    1.0
}

impl Calibration {
    /// 原地校准
    pub fn new(source_name: impl Into<String>, offset: f64, gain: f64) -> Self {
        Self {
            source_name: source_name.into(),
            offset,
            gain,
            target_name: None,
            keep_source: false,
        }
    }

    /// 改名输出
    pub fn renamed(mut self, target_name: impl Into<String>) -> Self {
        self.target_name = Some(target_name.into());
        self
    }

    /// 保留源通道，结果作为新通道追加
    pub fn keep_source(mut self) -> Self {
        self.keep_source = true;
        self
    }

    #[inline]
    pub fn transform(&self, value: f64) -> f64 {
        (value + self.offset) * self.gain
    }

    /// 作用于批次中第一个匹配的样本，找不到则不做任何事
    pub fn apply_to(&self, batch: &mut Batch) {
        let samples = batch.samples_mut();
        let Some(pos) = samples.iter().position(|s| s.name == self.source_name) else {
            return;
        };
        let value = self.transform(samples[pos].value);

        match (&self.target_name, self.keep_source) {
            (None, _) => samples[pos].value = value,
            (Some(target), false) => {
                let sample = &mut samples[pos];
                sample.value = value;
                sample.name.clone_from(target);
            },
            (Some(target), true) => {
                let source = &samples[pos];
                let derived = Sample {
                    name: target.clone(),
                    value,
                    raw_value: None,
                    timestamp: source.timestamp,
                    time: source.time,
                    index: source.index,
                };
                samples.push(derived);
            },
        }
    }
}

/// 按注册顺序应用的一组校准规则
///
/// 后面的规则可以引用前面规则在同一批次中产生的通道名。
#[derive(Debug, Clone, Default)]
pub struct Calibrator {
    rules: Vec<Calibration>,
}

impl Calibrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, rule: Calibration) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn add(&mut self, rule: Calibration) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[Calibration] {
        &self.rules
    }
}

impl FromIterator<Calibration> for Calibrator {
    fn from_iter<I: IntoIterator<Item = Calibration>>(iter: I) -> Self {
        Self {
            rules: iter.into_iter().collect(),
        }
    }
}

impl BatchFilter for Calibrator {
    fn apply(&self, batch: &mut Batch) {
        for rule in &self.rules {
            rule.apply_to(batch);
        }
    }
}

impl BatchFilter for Calibration {
    fn apply(&self, batch: &mut Batch) {
        self.apply_to(batch);
    }
}
