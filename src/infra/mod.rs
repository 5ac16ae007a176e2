//! 基础设施模块
//!
//! 封装外部依赖（子进程执行等）

pub mod command;

pub use command::{CommandError, CommandRunner, PlaybookCommand, StreamingChild};
