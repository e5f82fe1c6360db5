use std::sync::Arc;

use gpujob_core::{
    EpochField, Result, ResultStore, ADDITIONAL_TRAINING_FIELD, CURRENT_EPOCH_FIELD,
    TOTAL_EPOCHS_FIELD,
};
use tracing::{debug, info, warn};

use crate::output_parser::{format_metric, parse_line, ParsedLineFact};

#[derive(Debug, Default)]
struct EpochProgress {
    epoch: Option<u32>,
    total: Option<u32>,
    additional: bool,
    train: Option<(f64, f64)>,
    val: Option<(f64, f64)>,
}

/// 把训练输出折叠进结果存储
///
/// 指标总是写到最近一次出现的轮次边界下，而不是指标行自身携带的轮次。
/// 轮次边界即使写入失败也会生效。
pub struct ProgressRecorder {
    store: Arc<dyn ResultStore>,
    job_key: String,
    progress: EpochProgress,
}

impl ProgressRecorder {
    pub fn new(store: Arc<dyn ResultStore>, job_key: impl Into<String>) -> Self {
        Self {
            store,
            job_key: job_key.into(),
            progress: EpochProgress::default(),
        }
    }

    pub fn job_key(&self) -> &str {
        &self.job_key
    }

    /// 最近一次轮次边界设置的轮次
    pub fn current_epoch(&self) -> Option<u32> {
        self.progress.epoch
    }

    /// 处理一行子进程输出
    ///
    /// 写入失败只记录日志，不中断任务。
    pub async fn record_line(&mut self, line: &str) {
        info!(job_key = %self.job_key, "{}", line);

        for fact in parse_line(line) {
            if let Err(e) = self.record_fact(fact).await {
                warn!(job_key = %self.job_key, "写入训练进度失败: {}", e);
            }
        }
    }

    /// 将单个事实写入结果存储
    pub async fn record_fact(&mut self, fact: ParsedLineFact) -> Result<()> {
        match fact {
            ParsedLineFact::EpochBoundary {
                epoch,
                total,
                additional,
            } => {
                let fields = [
                    (CURRENT_EPOCH_FIELD.to_string(), epoch.to_string()),
                    (TOTAL_EPOCHS_FIELD.to_string(), total.to_string()),
                    (
                        ADDITIONAL_TRAINING_FIELD.to_string(),
                        if additional { "1" } else { "0" }.to_string(),
                    ),
                ];
                self.progress = EpochProgress {
                    epoch: Some(epoch),
                    total: Some(total),
                    additional,
                    ..Default::default()
                };
                self.store.set_fields(&self.job_key, &fields).await?;
            }
            ParsedLineFact::TrainMetrics { loss, metric } => {
                let Some(epoch) = self.resolve_epoch().await? else {
                    return Ok(());
                };
                self.write_epoch_fields(
                    epoch,
                    &[
                        (EpochField::TrainLoss, format_metric(loss)),
                        (EpochField::TrainMetric, format_metric(metric)),
                    ],
                )
                .await?;
                self.progress.train = Some((loss, metric));
                self.log_epoch_summary();
            }
            ParsedLineFact::ValMetrics { loss, metric } => {
                let Some(epoch) = self.resolve_epoch().await? else {
                    return Ok(());
                };
                self.write_epoch_fields(
                    epoch,
                    &[
                        (EpochField::ValLoss, format_metric(loss)),
                        (EpochField::ValMetric, format_metric(metric)),
                    ],
                )
                .await?;
                self.progress.val = Some((loss, metric));
                self.log_epoch_summary();
            }
            ParsedLineFact::ClassMetrics { kind, text } => {
                let Some(epoch) = self.resolve_epoch().await? else {
                    return Ok(());
                };
                self.write_epoch_fields(epoch, &[(kind.epoch_field(), text)])
                    .await?;
            }
        }
        Ok(())
    }

    /// 当前轮次；本进程尚未见到轮次边界时回退到存储中的值
    async fn resolve_epoch(&mut self) -> Result<Option<u32>> {
        if let Some(epoch) = self.progress.epoch {
            return Ok(Some(epoch));
        }

        let stored = self
            .store
            .get_field(&self.job_key, CURRENT_EPOCH_FIELD)
            .await?
            .and_then(|v| v.parse::<u32>().ok());

        match stored {
            Some(epoch) => {
                debug!(job_key = %self.job_key, "使用存储中的当前轮次: {}", epoch);
                self.progress.epoch = Some(epoch);
                Ok(Some(epoch))
            }
            None => {
                warn!(job_key = %self.job_key, "尚未出现轮次信息，忽略指标");
                Ok(None)
            }
        }
    }

    async fn write_epoch_fields(&self, epoch: u32, values: &[(EpochField, String)]) -> Result<()> {
        let fields: Vec<(String, String)> = values
            .iter()
            .map(|(field, value)| (field.field_name(epoch), value.clone()))
            .collect();
        self.store.set_fields(&self.job_key, &fields).await
    }

    fn log_epoch_summary(&mut self) {
        let (Some(epoch), Some((train_loss, train_metric)), Some((val_loss, val_metric))) =
            (self.progress.epoch, self.progress.train, self.progress.val)
        else {
            return;
        };

        let prefix = if self.progress.additional {
            "Additional "
        } else {
            ""
        };
        let total = self
            .progress
            .total
            .map(|t| t.to_string())
            .unwrap_or_else(|| "?".to_string());

        info!(
            job_key = %self.job_key,
            "{}Epoch {}/{} 完成: train_loss={}, train_metric={}, val_loss={}, val_metric={}",
            prefix,
            epoch,
            total,
            format_metric(train_loss),
            format_metric(train_metric),
            format_metric(val_loss),
            format_metric(val_metric)
        );

        self.progress.train = None;
        self.progress.val = None;
    }
}
