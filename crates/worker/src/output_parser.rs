//! 训练输出解析
//!
//! 按行匹配固定的文本标记，每个标记对应一种事实。各模式互相独立，
//! 某个数值格式错误只丢弃该事实，不影响同一行的其他事实。

use gpujob_core::EpochField;
use metrics::counter;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::warn;

/// 分类指标的种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassMetricKind {
    TrainLosses,
    TrainMetric,
    ValLosses,
    ValMetric,
}

impl ClassMetricKind {
    /// 对应的轮次字段
    pub fn epoch_field(self) -> EpochField {
        match self {
            ClassMetricKind::TrainLosses => EpochField::TrainClassLosses,
            ClassMetricKind::TrainMetric => EpochField::TrainClassMetric,
            ClassMetricKind::ValLosses => EpochField::ValClassLosses,
            ClassMetricKind::ValMetric => EpochField::ValClassMetric,
        }
    }
}

/// 一行输出所表达的事实
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLineFact {
    EpochBoundary {
        epoch: u32,
        total: u32,
        additional: bool,
    },
    TrainMetrics {
        loss: f64,
        metric: f64,
    },
    ValMetrics {
        loss: f64,
        metric: f64,
    },
    ClassMetrics {
        kind: ClassMetricKind,
        text: String,
    },
}

type FactBuilder = fn(&Captures<'_>) -> Result<ParsedLineFact, String>;

struct LinePattern {
    name: &'static str,
    regex: Regex,
    build: FactBuilder,
}

impl LinePattern {
    fn new(name: &'static str, pattern: &str, build: FactBuilder) -> Self {
        Self {
            name,
            regex: Regex::new(pattern).expect("output pattern should be valid"),
            build,
        }
    }
}

static PATTERNS: Lazy<Vec<LinePattern>> = Lazy::new(|| {
    vec![
        LinePattern::new("epoch", r"(Additional )?Epoch (\d+)/(\d+)", |caps| {
            Ok(ParsedLineFact::EpochBoundary {
                additional: caps.get(1).is_some(),
                epoch: parse_number(&caps[2])?,
                total: parse_number(&caps[3])?,
            })
        }),
        LinePattern::new(
            "train",
            r"Train Loss: ([\d.]+), Train Metric: ([\d.]+)",
            |caps| {
                Ok(ParsedLineFact::TrainMetrics {
                    loss: parse_number(&caps[1])?,
                    metric: parse_number(&caps[2])?,
                })
            },
        ),
        LinePattern::new(
            "val",
            r"Val Loss: ([\d.]+), Val Metric: ([\d.]+)",
            |caps| {
                Ok(ParsedLineFact::ValMetrics {
                    loss: parse_number(&caps[1])?,
                    metric: parse_number(&caps[2])?,
                })
            },
        ),
        LinePattern::new("train_class_losses", r"Train Class Losses: (.+)", |caps| {
            Ok(class_fact(ClassMetricKind::TrainLosses, caps))
        }),
        LinePattern::new("train_class_metric", r"Train Class metric: (.+)", |caps| {
            Ok(class_fact(ClassMetricKind::TrainMetric, caps))
        }),
        LinePattern::new("val_class_losses", r"Val Class Losses: (.+)", |caps| {
            Ok(class_fact(ClassMetricKind::ValLosses, caps))
        }),
        LinePattern::new("val_class_metric", r"Val Class metric: (.+)", |caps| {
            Ok(class_fact(ClassMetricKind::ValMetric, caps))
        }),
    ]
});

fn parse_number<T: std::str::FromStr>(text: &str) -> Result<T, String> {
    text.parse::<T>()
        .map_err(|_| format!("无法解析数值: {text}"))
}

fn class_fact(kind: ClassMetricKind, caps: &Captures<'_>) -> ParsedLineFact {
    ParsedLineFact::ClassMetrics {
        kind,
        text: caps[1].trim_end().to_string(),
    }
}

/// 解析一行输出，返回其中识别到的全部事实
///
/// 无法识别的行返回空列表。
pub fn parse_line(line: &str) -> Vec<ParsedLineFact> {
    let mut facts = Vec::new();

    for pattern in PATTERNS.iter() {
        let Some(caps) = pattern.regex.captures(line) else {
            continue;
        };
        match (pattern.build)(&caps) {
            Ok(fact) => facts.push(fact),
            Err(reason) => {
                counter!("gpujob_parse_errors_total", "pattern" => pattern.name).increment(1);
                warn!(pattern = pattern.name, "忽略格式错误的输出: {}, line={}", reason, line);
            }
        }
    }

    facts
}

/// 指标的存储格式，保留四位小数
pub fn format_metric(value: f64) -> String {
    format!("{value:.4}")
}
