//! 命令执行器
//!
//! 启动部署工具子进程，stdout/stderr 共用同一个管道，输出为单一的行流：
//! - 逐行读取，非 UTF-8 字节按 lossy 方式转换
//! - 行顺序与子进程的写入顺序一致，不区分来源
//! - 读取在阻塞线程上进行，不阻塞调用方

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// 行通道容量
const LINE_CHANNEL_CAPACITY: usize = 256;

/// 部署命令
///
/// `program` 之后可带固定的前置参数，用于 `uv run ansible-playbook` 之类的启动器
#[derive(Clone, Debug, PartialEq)]
pub struct PlaybookCommand {
    pub program: String,
    pub leading_args: Vec<String>,
}

impl PlaybookCommand {
    pub fn new(program: impl Into<String>, leading_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            leading_args,
        }
    }

    /// 按空白切分命令字符串，空字符串返回 None
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            leading_args: parts.collect(),
        })
    }
}

impl Default for PlaybookCommand {
    fn default() -> Self {
        Self::new("ansible-playbook", Vec::new())
    }
}

/// 命令执行错误
#[derive(Debug, Error)]
pub enum CommandError {
    /// 命令启动失败
    #[error("Failed to spawn command: {0}")]
    SpawnFailed(#[source] std::io::Error),
    /// 读取输出失败
    #[error("Failed to read command output: {0}")]
    ReadFailed(#[source] std::io::Error),
    /// 等待命令完成失败
    #[error("Failed to wait for command: {0}")]
    WaitFailed(#[source] std::io::Error),
}

/// 命令执行器
pub struct CommandRunner;

/// 正在运行、输出被逐行转发的子进程
pub struct StreamingChild {
    child: Child,
    lines: mpsc::Receiver<Result<String, std::io::Error>>,
    reader: JoinHandle<()>,
}

impl CommandRunner {
    /// 启动命令并合并输出流
    ///
    /// # Arguments
    /// * `command` - 程序与前置参数
    /// * `args` - 追加的命令行参数
    /// * `work_dir` - 工作目录
    /// * `envs` - 额外的环境变量（继承当前进程环境）
    pub fn spawn_streaming(
        command: &PlaybookCommand,
        args: &[String],
        work_dir: &Path,
        envs: &[(&str, &str)],
    ) -> Result<StreamingChild, CommandError> {
        let (output, writer) = os_pipe::pipe().map_err(CommandError::SpawnFailed)?;
        let stderr_writer = writer.try_clone().map_err(CommandError::SpawnFailed)?;

        // Command 持有写端，spawn 后立即释放，子进程退出时读端才能看到 EOF
        let child = Command::new(&command.program)
            .args(&command.leading_args)
            .args(args)
            .current_dir(work_dir)
            .envs(envs.iter().copied())
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(stderr_writer)
            .spawn()
            .map_err(CommandError::SpawnFailed)?;

        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let reader = spawn_line_reader(output, tx);

        Ok(StreamingChild {
            child,
            lines: rx,
            reader,
        })
    }
}

impl StreamingChild {
    /// 子进程 PID
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// 读取下一行输出
    ///
    /// 管道关闭后返回 None
    pub async fn next_line(&mut self) -> Option<Result<String, CommandError>> {
        self.lines
            .recv()
            .await
            .map(|line| line.map_err(CommandError::ReadFailed))
    }

    /// 等待子进程退出
    pub async fn wait(mut self) -> Result<ExitStatus, CommandError> {
        let status = self.child.wait().await.map_err(CommandError::WaitFailed)?;
        // 读取任务在管道关闭后自行结束
        let _ = self.reader.await;
        Ok(status)
    }
}

/// 启动合并输出管道的读取任务
fn spawn_line_reader<R>(
    stream: R,
    tx: mpsc::Sender<Result<String, std::io::Error>>,
) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                    }
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    if tx.blocking_send(Ok(line)).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    break;
                }
            }
        }
    })
}
