//! 5字段 cron 表达式解析与下一次触发时间计算
//!
//! 字段依次为 分钟 小时 日 月 星期，支持 `*`、逗号列表、`a-b` 区间和 `/s` 步长，
//! 月份和星期可以使用英文缩写。五个字段必须同时满足。计算统一使用 UTC。

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use taskq_errors::{QueueError, QueueResult};

const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];
/// `cron` 库接受的星期写法
const SCHEDULE_WEEKDAYS: &[&str] = &["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// 单个字段的取值范围
struct FieldSpec {
    label: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// 第一个名称对应的数值
    name_base: u32,
}

const MINUTE: FieldSpec = FieldSpec {
    label: "分钟",
    min: 0,
    max: 59,
    names: &[],
    name_base: 0,
};
const HOUR: FieldSpec = FieldSpec {
    label: "小时",
    min: 0,
    max: 23,
    names: &[],
    name_base: 0,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    label: "日",
    min: 1,
    max: 31,
    names: &[],
    name_base: 0,
};
const MONTH: FieldSpec = FieldSpec {
    label: "月",
    min: 1,
    max: 12,
    names: MONTH_NAMES,
    name_base: 1,
};
// 7 与 0 都表示周日
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    label: "星期",
    min: 0,
    max: 7,
    names: WEEKDAY_NAMES,
    name_base: 0,
};

/// 解析后的字段
#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    wildcard: bool,
    values: BTreeSet<u32>,
}

impl Field {
    fn render(&self) -> String {
        if self.wildcard {
            return "*".to_string();
        }
        join(self.values.iter().map(u32::to_string))
    }
}

fn join(parts: impl Iterator<Item = String>) -> String {
    parts.collect::<Vec<_>>().join(",")
}

/// CRON表达式
///
/// 解析时把每个字段展开为显式取值集合，再交给 `cron` 库做时间搜索。
#[derive(Debug, Clone)]
pub struct CronExpression {
    source: String,
    minutes: Field,
    hours: Field,
    days_of_month: Field,
    months: Field,
    days_of_week: Field,
    schedule: Schedule,
}

impl CronExpression {
    pub fn parse(expr: &str) -> QueueResult<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(QueueError::invalid_cron(
                expr,
                format!("需要5个字段，实际为 {}", fields.len()),
            ));
        }

        let minutes = parse_field(expr, fields[0], &MINUTE)?;
        let hours = parse_field(expr, fields[1], &HOUR)?;
        let days_of_month = parse_field(expr, fields[2], &DAY_OF_MONTH)?;
        let months = parse_field(expr, fields[3], &MONTH)?;
        let mut days_of_week = parse_field(expr, fields[4], &DAY_OF_WEEK)?;
        if days_of_week.values.remove(&7) {
            days_of_week.values.insert(0);
        }

        // `cron` 库使用6字段（秒在前），星期用名称避免编号差异
        let weekdays = if days_of_week.wildcard {
            "*".to_string()
        } else {
            join(
                days_of_week
                    .values
                    .iter()
                    .map(|d| SCHEDULE_WEEKDAYS[*d as usize].to_string()),
            )
        };
        let normalized = format!(
            "0 {} {} {} {} {}",
            minutes.render(),
            hours.render(),
            days_of_month.render(),
            months.render(),
            weekdays
        );
        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| QueueError::invalid_cron(expr, e.to_string()))?;

        Ok(Self {
            source: expr.trim().to_string(),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            schedule,
        })
    }

    /// 严格晚于 `reference` 的最早触发时间；永远不会触发时返回 `None`
    pub fn next_after(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&reference)
            .find(|candidate| *candidate > reference)
    }

    /// 从 `reference` 之后的若干次触发时间
    pub fn upcoming(&self, reference: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut times = Vec::with_capacity(count);
        let mut cursor = reference;
        while times.len() < count {
            match self.next_after(cursor) {
                Some(next) => {
                    times.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        times
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn minutes(&self) -> impl Iterator<Item = u32> + '_ {
        self.minutes.values.iter().copied()
    }

    pub fn hours(&self) -> impl Iterator<Item = u32> + '_ {
        self.hours.values.iter().copied()
    }

    pub fn days_of_month(&self) -> impl Iterator<Item = u32> + '_ {
        self.days_of_month.values.iter().copied()
    }

    pub fn months(&self) -> impl Iterator<Item = u32> + '_ {
        self.months.values.iter().copied()
    }

    /// 0 = 周日
    pub fn days_of_week(&self) -> impl Iterator<Item = u32> + '_ {
        self.days_of_week.values.iter().copied()
    }

    pub fn validate(expr: &str) -> QueueResult<()> {
        Self::parse(expr).map(|_| ())
    }
}

impl FromStr for CronExpression {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn parse_field(expr: &str, raw: &str, spec: &FieldSpec) -> QueueResult<Field> {
    let err = |message: String| {
        QueueError::invalid_cron(expr, format!("{}字段: {message}", spec.label))
    };

    let mut values = BTreeSet::new();
    for part in raw.split(',') {
        if part.is_empty() {
            return Err(err(format!("列表中存在空项 `{raw}`")));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| err(format!("无效的步长 `{step}`")))?;
                if step == 0 {
                    return Err(err("步长必须大于0".to_string()));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((low, high)) = range.split_once('-') {
            let low = parse_value(low, spec).map_err(&err)?;
            let high = parse_value(high, spec).map_err(&err)?;
            if low > high {
                return Err(err(format!("区间起点大于终点 `{range}`")));
            }
            (low, high)
        } else {
            let value = parse_value(range, spec).map_err(&err)?;
            // `a/s` 表示从 a 到上限
            match step {
                Some(_) => (value, spec.max),
                None => (value, value),
            }
        };

        let step = step.unwrap_or(1) as usize;
        values.extend((start..=end).step_by(step));
    }

    Ok(Field {
        wildcard: raw == "*",
        values,
    })
}

fn parse_value(raw: &str, spec: &FieldSpec) -> Result<u32, String> {
    let value = match raw.parse::<u32>() {
        Ok(value) => value,
        Err(_) => spec
            .names
            .iter()
            .position(|name| name.eq_ignore_ascii_case(raw))
            .map(|index| index as u32 + spec.name_base)
            .ok_or_else(|| format!("无法识别的取值 `{raw}`"))?,
    };

    if value < spec.min || value > spec.max {
        return Err(format!(
            "取值 {value} 超出范围 {}-{}",
            spec.min, spec.max
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_expansion() {
        let expr = CronExpression::parse("*/15 9-17/4 1,15 JAN-MAR mon-fri").unwrap();
        assert_eq!(expr.minutes().collect::<Vec<_>>(), vec![0, 15, 30, 45]);
        assert_eq!(expr.hours().collect::<Vec<_>>(), vec![9, 13, 17]);
        assert_eq!(expr.days_of_month().collect::<Vec<_>>(), vec![1, 15]);
        assert_eq!(expr.months().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(expr.days_of_week().collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_sunday_aliases() {
        let seven = CronExpression::parse("0 0 * * 7").unwrap();
        let zero = CronExpression::parse("0 0 * * 0").unwrap();
        let name = CronExpression::parse("0 0 * * SUN").unwrap();
        assert_eq!(seven.days_of_week().collect::<Vec<_>>(), vec![0]);
        assert_eq!(zero.days_of_week().collect::<Vec<_>>(), vec![0]);
        assert_eq!(name.days_of_week().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_start_with_step() {
        let expr = CronExpression::parse("5/20 * * * *").unwrap();
        assert_eq!(expr.minutes().collect::<Vec<_>>(), vec![5, 25, 45]);
    }

    #[test]
    fn test_invalid_fields() {
        for bad in [
            "",
            "* * * *",
            "* * * * * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * * 13 *",
            "* * * * 8",
            "*/0 * * * *",
            "10-5 * * * *",
            "1,,2 * * * *",
            "* * * FOO *",
            "abc * * * *",
        ] {
            let err = CronExpression::parse(bad).unwrap_err();
            assert!(
                matches!(err, QueueError::InvalidCron { .. }),
                "`{bad}` 应当解析失败"
            );
        }
    }
}
