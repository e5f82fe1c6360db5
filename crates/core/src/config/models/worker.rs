use serde::{Deserialize, Serialize};

fn default_worker_id() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "worker-001".to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// 运行训练脚本的解释器
    pub interpreter: String,
    /// 训练进程的工作目录，未设置时使用脚本所在目录
    pub project_root: Option<String>,
    /// 覆盖设备枚举结果
    pub device_count: Option<u32>,
    /// 限制子进程可见设备的环境变量
    pub device_visibility_env: String,
    pub lease_max_attempts: u32,
    pub lease_retry_interval_ms: u64,
    /// 取消时 SIGTERM 之后等待子进程退出的时间
    pub termination_grace_seconds: u64,
    /// 失败时保留的stderr行数
    pub stderr_tail_lines: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            interpreter: "python3".to_string(),
            project_root: None,
            device_count: None,
            device_visibility_env: "CUDA_VISIBLE_DEVICES".to_string(),
            lease_max_attempts: 10,
            lease_retry_interval_ms: 500,
            termination_grace_seconds: 10,
            stderr_tail_lines: 200,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_id.is_empty() {
            return Err(anyhow::anyhow!("Worker ID不能为空"));
        }

        if self.interpreter.is_empty() {
            return Err(anyhow::anyhow!("解释器不能为空"));
        }

        if self.device_visibility_env.is_empty() {
            return Err(anyhow::anyhow!("设备可见性环境变量不能为空"));
        }

        if self.device_count == Some(0) {
            return Err(anyhow::anyhow!("设备数量必须大于0"));
        }

        if self.lease_max_attempts == 0 {
            return Err(anyhow::anyhow!("设备租用最大尝试次数必须大于0"));
        }

        if self.lease_retry_interval_ms == 0 {
            return Err(anyhow::anyhow!("设备租用重试间隔必须大于0"));
        }

        Ok(())
    }
}
