use async_trait::async_trait;
use gpujob_core::{DevicePool, DispatchError, Result};
use metrics::counter;
use redis::{AsyncCommands, Script};
use tracing::{debug, info};

use super::connection_manager::RedisConnectionManager;

// 空闲序列保存为JSON数组字符串，与外部设备可用性发布进程写入的格式一致。
// 读取、修改、写回都在脚本内完成，Redis保证脚本执行的原子性。
const LEASE_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then
  return false
end
local ids = cjson.decode(raw)
if #ids == 0 then
  return false
end
local id = table.remove(ids, 1)
if #ids == 0 then
  redis.call('SET', KEYS[1], '[]')
else
  redis.call('SET', KEYS[1], cjson.encode(ids))
end
return id
"#;

const RELEASE_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
local ids = {}
if raw then
  ids = cjson.decode(raw)
end
table.insert(ids, tonumber(ARGV[1]))
redis.call('SET', KEYS[1], cjson.encode(ids))
return #ids
"#;

/// 基于Redis的共享设备池
pub struct RedisDevicePool {
    connection_manager: RedisConnectionManager,
    key: String,
    lease_script: Script,
    release_script: Script,
}

impl RedisDevicePool {
    pub fn new(connection_manager: RedisConnectionManager) -> Self {
        let key = connection_manager.config().device_pool_key.clone();
        Self {
            connection_manager,
            key,
            lease_script: Script::new(LEASE_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

fn store_error(action: &str, e: impl std::fmt::Display) -> DispatchError {
    DispatchError::Store(format!("{action}失败: {e}"))
}

#[async_trait]
impl DevicePool for RedisDevicePool {
    async fn initialize(&self, device_count: u32) -> Result<()> {
        let ids: Vec<u32> = (0..device_count).collect();
        let value = serde_json::to_string(&ids)
            .map_err(|e| DispatchError::Serialization(format!("序列化设备列表失败: {e}")))?;

        let mut conn = self.connection_manager.connection();
        let _: () = conn
            .set(&self.key, value)
            .await
            .map_err(|e| store_error("初始化设备池", e))?;

        info!("设备池已初始化: key={}, devices={:?}", self.key, ids);
        Ok(())
    }

    async fn try_lease(&self) -> Result<Option<u32>> {
        let mut conn = self.connection_manager.connection();
        let device_id: Option<u32> = self
            .lease_script
            .key(&self.key)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("租用设备", e))?;

        if device_id.is_none() {
            counter!("gpujob_device_pool_empty_total").increment(1);
        }
        debug!("租用设备结果: {:?}", device_id);
        Ok(device_id)
    }

    async fn release(&self, device_id: u32) -> Result<()> {
        let mut conn = self.connection_manager.connection();
        let free_count: i64 = self
            .release_script
            .key(&self.key)
            .arg(device_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("归还设备", e))?;

        debug!("设备 {} 已归还, 当前空闲数量: {}", device_id, free_count);
        Ok(())
    }

    async fn free_devices(&self) -> Result<Vec<u32>> {
        let mut conn = self.connection_manager.connection();
        let raw: Option<String> = conn
            .get(&self.key)
            .await
            .map_err(|e| store_error("读取设备池", e))?;

        match raw {
            Some(raw) => parse_device_list(&raw),
            None => Ok(Vec::new()),
        }
    }
}

/// 解析空闲设备JSON；空表可能被Lua编码为 `{}`
fn parse_device_list(raw: &str) -> Result<Vec<u32>> {
    if raw.trim() == "{}" {
        return Ok(Vec::new());
    }
    serde_json::from_str(raw)
        .map_err(|e| DispatchError::Serialization(format!("解析设备列表失败: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_list() {
        assert_eq!(parse_device_list("[2, 0, 1]").unwrap(), vec![2, 0, 1]);
        assert_eq!(parse_device_list("[]").unwrap(), Vec::<u32>::new());
        assert_eq!(parse_device_list("{}").unwrap(), Vec::<u32>::new());
        assert!(parse_device_list("not json").is_err());
    }
}
