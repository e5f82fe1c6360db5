use gpujob_core::{DispatchError, Result};
use tokio::process::Command;
use tracing::{info, warn};

/// 确定本机可用的设备数量
///
/// 配置了 `device_count` 时直接使用，否则通过 `nvidia-smi` 枚举。
pub async fn discover_devices(device_count: Option<u32>) -> Result<u32> {
    if let Some(count) = device_count {
        info!("使用配置的设备数量: {}", count);
        return Ok(count);
    }

    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=index", "--format=csv,noheader"])
        .output()
        .await
        .map_err(|e| DispatchError::DeviceDiscovery(format!("执行nvidia-smi失败: {e}")))?;

    if !output.status.success() {
        return Err(DispatchError::DeviceDiscovery(format!(
            "nvidia-smi退出码异常: {:?}, stderr: {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let indices = parse_device_indices(&String::from_utf8_lossy(&output.stdout));
    if indices.is_empty() {
        return Err(DispatchError::DeviceDiscovery("未发现任何设备".to_string()));
    }

    info!("发现 {} 个设备: {:?}", indices.len(), indices);
    Ok(indices.len() as u32)
}

/// 解析 `nvidia-smi --query-gpu=index --format=csv,noheader` 的输出
pub fn parse_device_indices(stdout: &str) -> Vec<u32> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match line.parse::<u32>() {
            Ok(index) => Some(index),
            Err(_) => {
                warn!("忽略无法解析的设备行: {}", line);
                None
            }
        })
        .collect()
}
