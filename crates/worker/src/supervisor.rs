use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use gpujob_core::{JobDescriptor, WorkerConfig};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::progress::ProgressRecorder;

/// 一次训练执行的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Succeeded,
    Failed {
        exit_code: Option<i32>,
        stderr_tail: Vec<String>,
    },
    LaunchFailed {
        reason: String,
    },
    Cancelled,
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Succeeded)
    }

    /// 用作指标标签
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionOutcome::Succeeded => "succeeded",
            ExecutionOutcome::Failed { .. } => "failed",
            ExecutionOutcome::LaunchFailed { .. } => "launch_failed",
            ExecutionOutcome::Cancelled => "cancelled",
        }
    }
}

enum StreamEvent {
    Line(String),
    Closed,
    Cancelled,
}

/// 训练子进程监督器
///
/// 子进程只能看到租用的设备；stdout逐行交给进度记录器，stderr在后台收集末尾若干行。
pub struct SubprocessSupervisor {
    interpreter: String,
    project_root: Option<PathBuf>,
    device_env: String,
    termination_grace: Duration,
    stderr_tail_lines: usize,
}

impl SubprocessSupervisor {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            project_root: None,
            device_env: "CUDA_VISIBLE_DEVICES".to_string(),
            termination_grace: Duration::from_secs(10),
            stderr_tail_lines: 200,
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            project_root: config.project_root.as_ref().map(PathBuf::from),
            device_env: config.device_visibility_env.clone(),
            termination_grace: Duration::from_secs(config.termination_grace_seconds),
            stderr_tail_lines: config.stderr_tail_lines,
        }
    }

    pub fn with_project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.project_root = Some(root.into());
        self
    }

    pub fn with_termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace = grace;
        self
    }

    /// 运行训练脚本直到退出或被取消
    ///
    /// 启动和通信中的错误都视为任务失败，不会向上传播。
    pub async fn run(
        &self,
        job: &JobDescriptor,
        device_id: u32,
        recorder: &mut ProgressRecorder,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        if cancel.is_cancelled() {
            return ExecutionOutcome::Cancelled;
        }

        let mut command = self.build_command(job, device_id);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(device_id, "启动训练进程失败: {}", e);
                return ExecutionOutcome::LaunchFailed {
                    reason: format!("启动训练进程失败: {e}"),
                };
            }
        };

        let pid = child.id();
        info!(
            device_id,
            pid,
            "训练进程已启动: {} {:?}",
            self.interpreter,
            job.command_args()
        );

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            self.terminate(&mut child).await;
            return ExecutionOutcome::LaunchFailed {
                reason: "无法获取子进程输出".to_string(),
            };
        };

        let stderr_task = tokio::spawn(collect_tail(stderr, self.stderr_tail_lines));
        let mut stdout = BufReader::new(stdout);
        let mut buf = Vec::new();

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => StreamEvent::Cancelled,
                read = stdout.read_until(b'\n', &mut buf) => match read {
                    Ok(0) => StreamEvent::Closed,
                    Ok(_) => {
                        let line = decode_line(&buf);
                        buf.clear();
                        StreamEvent::Line(line)
                    }
                    Err(e) => {
                        warn!(device_id, "读取训练输出失败: {}", e);
                        StreamEvent::Closed
                    }
                },
            };

            match event {
                StreamEvent::Line(line) => recorder.record_line(&line).await,
                StreamEvent::Closed => break,
                StreamEvent::Cancelled => {
                    return self.cancel_child(&mut child, stderr_task).await;
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => None,
            status = child.wait() => Some(status),
        };

        let Some(status) = status else {
            return self.cancel_child(&mut child, stderr_task).await;
        };

        if let (Ok(_), Some(pid)) = (&status, pid) {
            // 脚本已退出，清理它留在进程组里的后台进程
            signal_group(pid, "KILL").await;
        }

        match status {
            Ok(status) if status.success() => {
                stderr_task.abort();
                info!(device_id, "训练进程正常退出");
                ExecutionOutcome::Succeeded
            }
            Ok(status) => {
                let stderr_tail = finish_stderr(stderr_task).await;
                self.log_failure(status, &stderr_tail);
                ExecutionOutcome::Failed {
                    exit_code: status.code(),
                    stderr_tail,
                }
            }
            Err(e) => {
                error!(device_id, "等待训练进程退出失败: {}", e);
                self.terminate(&mut child).await;
                let mut stderr_tail = finish_stderr(stderr_task).await;
                stderr_tail.push(format!("等待进程结束失败: {e}"));
                ExecutionOutcome::Failed {
                    exit_code: None,
                    stderr_tail,
                }
            }
        }
    }

    fn build_command(&self, job: &JobDescriptor, device_id: u32) -> Command {
        let mut command = Command::new(&self.interpreter);
        command
            .args(job.command_args())
            .env(&self.device_env, device_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // 独立进程组，终止时连同脚本派生的进程一起处理
        #[cfg(unix)]
        command.process_group(0);

        let working_dir = self.project_root.clone().or_else(|| job.script_dir());
        if let Some(dir) = working_dir {
            command.env("PYTHONPATH", prepend_path(&dir, std::env::var_os("PYTHONPATH")));
            command.current_dir(dir);
        }

        command
    }

    async fn cancel_child(
        &self,
        child: &mut Child,
        stderr_task: tokio::task::JoinHandle<Vec<String>>,
    ) -> ExecutionOutcome {
        warn!("收到取消信号, 终止训练进程");
        self.terminate(child).await;
        stderr_task.abort();
        ExecutionOutcome::Cancelled
    }

    /// 向整个进程组发送SIGTERM，超过宽限期仍未退出则强制杀死
    ///
    /// 子进程退出后再向进程组补发SIGKILL，清理脚本留下的后台进程。
    async fn terminate(&self, child: &mut Child) {
        let Some(pid) = child.id() else {
            debug!("子进程已退出, 无需终止");
            return;
        };

        signal_group(pid, "TERM").await;

        match timeout(self.termination_grace, child.wait()).await {
            Ok(Ok(status)) => info!(pid, "训练进程已终止: {}", status),
            Ok(Err(e)) => {
                warn!(pid, "等待训练进程终止失败: {}", e);
                self.force_kill(child, pid).await;
            }
            Err(_) => {
                warn!(
                    pid,
                    "训练进程在 {}s 内未退出, 强制终止",
                    self.termination_grace.as_secs()
                );
                self.force_kill(child, pid).await;
            }
        }

        signal_group(pid, "KILL").await;
    }

    async fn force_kill(&self, child: &mut Child, pid: u32) {
        signal_group(pid, "KILL").await;
        if let Err(e) = child.kill().await {
            error!(pid, "强制终止训练进程失败: {}", e);
        }
    }

    fn log_failure(&self, status: ExitStatus, stderr_tail: &[String]) {
        error!("训练进程异常退出: {}", status);
        if !stderr_tail.is_empty() {
            error!("训练进程stderr:\n{}", stderr_tail.join("\n"));
        }
    }
}

/// 用 `kill` 向以 `pgid` 为组号的进程组发信号
///
/// 进程组已经为空时 `kill` 以非零状态退出，这里只记录调试日志。
async fn signal_group(pgid: u32, signal: &str) {
    match Command::new("kill")
        .arg(format!("-{signal}"))
        .arg("--")
        .arg(format!("-{pgid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) if status.success() => debug!(pgid, "已向进程组发送SIG{}", signal),
        Ok(status) => debug!(pgid, "向进程组发送SIG{}未成功: {}", signal, status),
        Err(e) => warn!(pgid, "执行kill命令失败: {}", e),
    }
}

/// 去掉行尾换行，非UTF-8字节替换为U+FFFD
fn decode_line(raw: &[u8]) -> String {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

fn prepend_path(dir: &std::path::Path, existing: Option<OsString>) -> OsString {
    let mut value = OsString::from(dir);
    if let Some(existing) = existing.filter(|e| !e.is_empty()) {
        value.push(":");
        value.push(existing);
    }
    value
}

async fn collect_tail<R>(reader: R, limit: usize) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut tail = VecDeque::with_capacity(limit.min(1024));
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("读取stderr结束: {}", e);
                break;
            }
        }
        if limit > 0 {
            if tail.len() == limit {
                tail.pop_front();
            }
            tail.push_back(decode_line(&buf));
        }
        buf.clear();
    }
    tail.into_iter().collect()
}

async fn finish_stderr(task: tokio::task::JoinHandle<Vec<String>>) -> Vec<String> {
    match timeout(Duration::from_secs(2), task).await {
        Ok(Ok(lines)) => lines,
        Ok(Err(e)) => {
            warn!("收集stderr失败: {}", e);
            Vec::new()
        }
        Err(_) => {
            warn!("等待stderr关闭超时");
            Vec::new()
        }
    }
}
