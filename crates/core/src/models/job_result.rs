use std::collections::{BTreeMap, HashMap};

/// 当前轮次字段
pub const CURRENT_EPOCH_FIELD: &str = "current_epoch";
/// 总轮次字段
pub const TOTAL_EPOCHS_FIELD: &str = "total_epochs";
/// 是否为追加训练字段，取值 "1"/"0"
pub const ADDITIONAL_TRAINING_FIELD: &str = "is_additional_training";

const EPOCH_FIELD_PREFIX: &str = "epoch_";

/// 每个轮次下的指标字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EpochField {
    TrainLoss,
    TrainMetric,
    ValLoss,
    ValMetric,
    TrainClassLosses,
    TrainClassMetric,
    ValClassLosses,
    ValClassMetric,
}

impl EpochField {
    const ALL: [EpochField; 8] = [
        EpochField::TrainLoss,
        EpochField::TrainMetric,
        EpochField::ValLoss,
        EpochField::ValMetric,
        EpochField::TrainClassLosses,
        EpochField::TrainClassMetric,
        EpochField::ValClassLosses,
        EpochField::ValClassMetric,
    ];

    pub fn suffix(&self) -> &'static str {
        match self {
            EpochField::TrainLoss => "train_loss",
            EpochField::TrainMetric => "train_metric",
            EpochField::ValLoss => "val_loss",
            EpochField::ValMetric => "val_metric",
            EpochField::TrainClassLosses => "class_losses",
            EpochField::TrainClassMetric => "class_metric",
            EpochField::ValClassLosses => "val_class_losses",
            EpochField::ValClassMetric => "val_class_metric",
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.suffix() == suffix)
    }

    /// 存储字段名，例如 `epoch_3_val_loss`
    pub fn field_name(&self, epoch: u32) -> String {
        format!("{EPOCH_FIELD_PREFIX}{epoch}_{}", self.suffix())
    }
}

/// 单个轮次的指标
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpochRecord {
    pub train_loss: Option<String>,
    pub train_metric: Option<String>,
    pub val_loss: Option<String>,
    pub val_metric: Option<String>,
    pub train_class_losses: Option<String>,
    pub train_class_metric: Option<String>,
    pub val_class_losses: Option<String>,
    pub val_class_metric: Option<String>,
}

impl EpochRecord {
    fn set(&mut self, field: EpochField, value: String) {
        let slot = match field {
            EpochField::TrainLoss => &mut self.train_loss,
            EpochField::TrainMetric => &mut self.train_metric,
            EpochField::ValLoss => &mut self.val_loss,
            EpochField::ValMetric => &mut self.val_metric,
            EpochField::TrainClassLosses => &mut self.train_class_losses,
            EpochField::TrainClassMetric => &mut self.train_class_metric,
            EpochField::ValClassLosses => &mut self.val_class_losses,
            EpochField::ValClassMetric => &mut self.val_class_metric,
        };
        *slot = Some(value);
    }
}

/// 任务结果记录，由结果存储中的扁平字段重建
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobResultRecord {
    pub current_epoch: Option<u32>,
    pub total_epochs: Option<u32>,
    pub is_additional_training: bool,
    pub epochs: BTreeMap<u32, EpochRecord>,
}

impl JobResultRecord {
    /// 从存储的哈希字段构建记录
    ///
    /// 任何 `epoch_{n}_*` 字段都会登记轮次 n，未知后缀的字段不写入指标。
    pub fn from_fields(fields: &HashMap<String, String>) -> Self {
        let mut record = JobResultRecord::default();

        for (name, value) in fields {
            match name.as_str() {
                CURRENT_EPOCH_FIELD => record.current_epoch = value.parse().ok(),
                TOTAL_EPOCHS_FIELD => record.total_epochs = value.parse().ok(),
                ADDITIONAL_TRAINING_FIELD => record.is_additional_training = value == "1",
                _ => {
                    let Some(rest) = name.strip_prefix(EPOCH_FIELD_PREFIX) else {
                        continue;
                    };
                    let Some((epoch, suffix)) = rest.split_once('_') else {
                        continue;
                    };
                    let Ok(epoch) = epoch.parse::<u32>() else {
                        continue;
                    };
                    let entry = record.epochs.entry(epoch).or_default();
                    if let Some(field) = EpochField::from_suffix(suffix) {
                        entry.set(field, value.clone());
                    }
                }
            }
        }

        record
    }

    /// 出现过的最大轮次号
    pub fn final_epoch(&self) -> Option<u32> {
        self.epochs.keys().next_back().copied()
    }

    /// 最大轮次的验证指标
    pub fn final_val_metric(&self) -> Option<&str> {
        let epoch = self.final_epoch()?;
        self.epochs.get(&epoch)?.val_metric.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_field_names() {
        assert_eq!(EpochField::ValLoss.field_name(3), "epoch_3_val_loss");
        assert_eq!(
            EpochField::TrainClassLosses.field_name(12),
            "epoch_12_class_losses"
        );
        assert_eq!(
            EpochField::from_suffix("val_class_metric"),
            Some(EpochField::ValClassMetric)
        );
        assert_eq!(EpochField::from_suffix("unknown"), None);
    }

    #[test]
    fn test_from_fields_builds_record() {
        let record = JobResultRecord::from_fields(&fields(&[
            ("current_epoch", "10"),
            ("total_epochs", "10"),
            ("is_additional_training", "0"),
            ("epoch_9_val_metric", "0.9100"),
            ("epoch_10_train_loss", "0.1000"),
            ("epoch_10_val_metric", "0.9300"),
        ]));

        assert_eq!(record.current_epoch, Some(10));
        assert_eq!(record.total_epochs, Some(10));
        assert!(!record.is_additional_training);
        assert_eq!(record.epochs.len(), 2);
        assert_eq!(record.final_epoch(), Some(10));
        assert_eq!(record.final_val_metric(), Some("0.9300"));
    }

    #[test]
    fn test_final_epoch_uses_numeric_order() {
        // "9" > "10" 按字符串比较，这里必须按数值比较
        let record = JobResultRecord::from_fields(&fields(&[
            ("epoch_9_val_metric", "0.5"),
            ("epoch_10_train_loss", "0.2"),
        ]));
        assert_eq!(record.final_epoch(), Some(10));
        assert_eq!(record.final_val_metric(), None);
    }

    #[test]
    fn test_empty_record_has_no_final_metric() {
        let record = JobResultRecord::from_fields(&fields(&[("current_epoch", "1")]));
        assert_eq!(record.final_epoch(), None);
        assert_eq!(record.final_val_metric(), None);
    }

    #[test]
    fn test_malformed_epoch_fields_are_skipped() {
        let record = JobResultRecord::from_fields(&fields(&[
            ("epoch_x_val_metric", "0.5"),
            ("epoch_", "0.5"),
            ("is_additional_training", "1"),
        ]));
        assert!(record.epochs.is_empty());
        assert!(record.is_additional_training);
    }
}
