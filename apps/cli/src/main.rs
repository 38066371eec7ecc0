//! # canpdo CLI
//!
//! CAN PDO 采集命令行工具。
//!
//! ```bash
//! # 显示参数文件解析出的帧格式
//! canpdo-cli format --params pdo.params
//!
//! # 按配置文件运行流水线
//! canpdo-cli run --config pipeline.toml
//!
//! # 虚拟总线记录 10 秒到 CSV
//! canpdo-cli run --duration 10 --output run.csv
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod config;

use commands::{FormatCommand, RunCommand};

/// canpdo CLI - CAN PDO 采集
#[derive(Parser, Debug)]
#[command(name = "canpdo-cli")]
#[command(about = "Acquire, log and display CANopen PDO sample streams", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 运行采集流水线
    Run {
        #[command(flatten)]
        args: RunCommand,
    },

    /// 显示帧格式
    Format {
        #[command(flatten)]
        args: FormatCommand,
    },

    /// 检查流水线配置文件
    Check {
        /// 配置文件路径
        config: std::path::PathBuf,
    },
}

fn main() -> Result<()> {
    canpdo_sdk::init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { args } => args.execute(),

        Commands::Format { args } => args.execute(),

        Commands::Check { config } => {
            let pipeline = config::PipelineConfig::load(&config)?;
            pipeline.validate()?;
            println!(
                "{}: {} loggers, {} scopes, {} calibrations{}",
                config.display(),
                pipeline.logger.len(),
                pipeline.scope.len(),
                pipeline.calibration.len(),
                if pipeline.mirror.is_some() { ", mirror" } else { "" }
            );
            Ok(())
        },
    }
}
