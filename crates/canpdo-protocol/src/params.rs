//! `key = value` 参数文件读取
//!
//! 每行一个参数，等号两侧空白和行首尾空白被去除，值保存为字符串。
//! 不含 `=` 的行被跳过。

use std::collections::HashMap;
use std::path::Path;

use tracing::trace;

/// 解析参数文本
pub fn parse_params(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                trace!("Skipping parameter line without key: {:?}", line);
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// 读取参数文件，文件不存在或不可读时返回 `None`
pub fn params_from_file(path: impl AsRef<Path>) -> Option<HashMap<String, String>> {
    let text = std::fs::read_to_string(path).ok()?;
    Some(parse_params(&text))
}
