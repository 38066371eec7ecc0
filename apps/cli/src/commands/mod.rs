//! 命令定义和实现

pub mod format;
pub mod run;

pub use format::FormatCommand;
pub use run::RunCommand;
