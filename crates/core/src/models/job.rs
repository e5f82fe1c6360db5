use std::borrow::Cow;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::ZlibDecoder;
use serde::{Deserialize, Deserializer, Serialize};

use crate::{DispatchError, Result};

/// 解压后任务消息的最大字节数
pub const MAX_JOB_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

/// 训练任务描述
///
/// 由任务提交方序列化（可选zlib压缩）后投递到队列，仅在一次分发周期内存在。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// 提交任务的用户
    pub user: String,
    /// 训练脚本入口路径
    pub script_path: String,
    /// 训练配置文件路径
    pub config_path: String,
    /// 模型名称
    pub model_name: String,
    /// 学习率，数字或字符串均可，保留原始文本形式
    #[serde(deserialize_with = "deserialize_learning_rate")]
    pub learning_rate: String,
    /// 追加到命令行末尾的额外参数
    #[serde(default)]
    pub script_args: Option<Vec<String>>,
}

fn deserialize_learning_rate<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::String(s) => Ok(s),
        other => Err(serde::de::Error::custom(format!(
            "learning_rate必须是数字或字符串, 实际为: {other}"
        ))),
    }
}

impl JobDescriptor {
    /// 从队列消息负载解码任务描述
    ///
    /// 先尝试zlib解压，解压失败时按未压缩负载处理，然后解析JSON并校验必填字段。
    /// 解压结果超过 [`MAX_JOB_PAYLOAD_BYTES`] 的消息直接拒绝。
    pub fn decode(payload: &[u8]) -> Result<Self> {
        Self::decode_with_limit(payload, MAX_JOB_PAYLOAD_BYTES)
    }

    fn decode_with_limit(payload: &[u8], limit: usize) -> Result<Self> {
        let body: Cow<'_, [u8]> = match inflate(payload, limit) {
            Ok(bytes) if bytes.len() > limit => {
                return Err(DispatchError::JobDecode(format!(
                    "解压后的任务消息超过 {limit} 字节"
                )));
            }
            Ok(bytes) => Cow::Owned(bytes),
            Err(_) => Cow::Borrowed(payload),
        };

        let job: JobDescriptor = serde_json::from_slice(&body)
            .map_err(|e| DispatchError::JobDecode(format!("解析任务JSON失败: {e}")))?;
        job.validate()?;
        Ok(job)
    }

    /// 校验必填字段非空
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("user", &self.user),
            ("script_path", &self.script_path),
            ("config_path", &self.config_path),
            ("model_name", &self.model_name),
            ("learning_rate", &self.learning_rate),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(DispatchError::JobDecode(format!("字段 {name} 不能为空")));
            }
        }
        Ok(())
    }

    /// 结果存储中的任务键: `{prefix}:{user}:{model_name}`
    pub fn job_key(&self, prefix: &str) -> String {
        format!("{prefix}:{}:{}", self.user, self.model_name)
    }

    /// 传给解释器的参数列表（不含解释器本身）
    pub fn command_args(&self) -> Vec<String> {
        let mut args = vec![
            self.script_path.clone(),
            self.config_path.clone(),
            "--model_name".to_string(),
            self.model_name.clone(),
            "--learning_rate".to_string(),
            self.learning_rate.clone(),
        ];
        if let Some(extra) = &self.script_args {
            args.extend(extra.iter().cloned());
        }
        args
    }

    /// 训练脚本所在目录
    pub fn script_dir(&self) -> Option<PathBuf> {
        Path::new(&self.script_path)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
    }
}

/// 最多解压出 `limit + 1` 字节，调用方据此判断是否超限
fn inflate(payload: &[u8], limit: usize) -> std::io::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(payload).take(limit as u64 + 1);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    const JOB_JSON: &str = r#"{
        "user": "alice",
        "script_path": "/opt/train/main.py",
        "config_path": "/opt/train/configs/base.yaml",
        "model_name": "effnet_b4",
        "learning_rate": "0.001",
        "script_args": ["--epochs", "10"]
    }"#;

    fn compress(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_decode_compressed_payload() {
        let job = JobDescriptor::decode(&compress(JOB_JSON.as_bytes())).unwrap();
        assert_eq!(job.user, "alice");
        assert_eq!(job.model_name, "effnet_b4");
        assert_eq!(job.script_args, Some(vec!["--epochs".into(), "10".into()]));
    }

    #[test]
    fn test_decode_falls_back_to_uncompressed_payload() {
        let job = JobDescriptor::decode(JOB_JSON.as_bytes()).unwrap();
        assert_eq!(job.learning_rate, "0.001");
    }

    #[test]
    fn test_numeric_learning_rate_keeps_text_form() {
        let payload = r#"{"user":"bob","script_path":"train.py","config_path":"c.yaml",
            "model_name":"m","learning_rate":0.0005}"#;
        let job = JobDescriptor::decode(payload.as_bytes()).unwrap();
        assert_eq!(job.learning_rate, "0.0005");
        assert_eq!(job.script_args, None);
    }

    #[test]
    fn test_missing_required_field_is_decode_error() {
        let payload = r#"{"user":"bob","script_path":"train.py","learning_rate":"0.1"}"#;
        let err = JobDescriptor::decode(payload.as_bytes()).unwrap_err();
        assert!(matches!(err, DispatchError::JobDecode(_)));
        assert!(err.to_string().contains("config_path"));
    }

    #[test]
    fn test_empty_user_is_rejected() {
        let payload = r#"{"user":" ","script_path":"train.py","config_path":"c.yaml",
            "model_name":"m","learning_rate":"0.1"}"#;
        let err = JobDescriptor::decode(payload.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("user"));
    }

    #[test]
    fn test_oversized_decompressed_payload_is_rejected() {
        let mut padded = JOB_JSON.to_string();
        padded.push_str(&" ".repeat(4096));
        let payload = compress(padded.as_bytes());
        assert!(payload.len() < 1024);

        let err = JobDescriptor::decode_with_limit(&payload, 1024).unwrap_err();
        assert!(matches!(err, DispatchError::JobDecode(ref msg) if msg.contains("1024")));

        let job = JobDescriptor::decode_with_limit(&payload, 8192).unwrap();
        assert_eq!(job.user, "alice");
    }

    #[test]
    fn test_garbage_payload_is_decode_error() {
        let err = JobDescriptor::decode(&[0xff, 0x00, 0x13, 0x37]).unwrap_err();
        assert!(matches!(err, DispatchError::JobDecode(_)));
    }

    #[test]
    fn test_command_args_order() {
        let job = JobDescriptor::decode(JOB_JSON.as_bytes()).unwrap();
        assert_eq!(
            job.command_args(),
            vec![
                "/opt/train/main.py",
                "/opt/train/configs/base.yaml",
                "--model_name",
                "effnet_b4",
                "--learning_rate",
                "0.001",
                "--epochs",
                "10",
            ]
        );
    }

    #[test]
    fn test_job_key_and_script_dir() {
        let job = JobDescriptor::decode(JOB_JSON.as_bytes()).unwrap();
        assert_eq!(job.job_key("job_result"), "job_result:alice:effnet_b4");
        assert_eq!(job.script_dir(), Some(PathBuf::from("/opt/train")));

        let bare = JobDescriptor {
            script_path: "train.py".into(),
            ..job
        };
        assert_eq!(bare.script_dir(), None);
    }
}
