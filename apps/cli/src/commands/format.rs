//! format 命令
//!
//! 显示由参数文件解析出的帧格式

use anyhow::Result;
use canpdo_sdk::protocol::{Encoding, Format};
use clap::Args;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct FormatCommand {
    /// PDO 参数文件（缺省为默认格式）
    #[arg(short, long)]
    pub params: Option<PathBuf>,

    /// 以 JSON 输出
    #[arg(long)]
    pub json: bool,
}

impl FormatCommand {
    pub fn execute(&self) -> Result<()> {
        let format = match &self.params {
            Some(path) => Format::from_params_file(path),
            None => Format::default_format(),
        };
        if self.json {
            println!("{}", serde_json::to_string_pretty(&format)?);
        } else {
            print!("{}", describe(&format));
        }
        Ok(())
    }
}

fn describe(format: &Format) -> String {
    let mut out = format!(
        "{} Hz, {} frames per cycle, {} channels\n",
        format.sample_rate_hz(),
        format.cycle_len(),
        format.channel_count()
    );
    for frame in format.frames_in_order() {
        let encoding = match frame.encoding {
            Encoding::FixedPoint7Q8 => "7Q8",
            Encoding::Single => "single",
        };
        out.push_str(&format!(
            "  0x{:03X} {:<6} {}\n",
            frame.id,
            encoding,
            frame.active_names().join(", ")
        ));
    }
    out
}
