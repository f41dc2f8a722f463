use chrono::{DateTime, Duration, Utc};
use taskq_config::RetryConfig;
use taskq_domain::value_objects::{FailureKind, RetryDecision, RetryTransition};

/// 退避上限不超过一年
const DELAY_CEILING_SECONDS: i64 = 365 * 24 * 3600;

/// 指数退避重试策略
///
/// 纯函数实现，不访问存储，也不引入随机抖动。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay_seconds: i64,
    max_delay_seconds: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(base_delay_seconds: u64, max_delay_seconds: u64) -> Self {
        let clamp = |seconds: u64| i64::try_from(seconds).unwrap_or(i64::MAX).min(DELAY_CEILING_SECONDS);
        let base = clamp(base_delay_seconds).max(1);
        let max = clamp(max_delay_seconds).max(base);
        Self {
            base_delay_seconds: base,
            max_delay_seconds: max,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.base_delay_seconds, config.max_delay_seconds)
    }

    /// 第 `retry_count` 次失败后的等待时间：base * 2^(retry_count - 1)，不超过上限
    pub fn backoff_delay(&self, retry_count: i32) -> Duration {
        let exponent = retry_count.saturating_sub(1).clamp(0, 62) as u32;
        let seconds = 2_i64
            .checked_pow(exponent)
            .and_then(|factor| self.base_delay_seconds.checked_mul(factor))
            .unwrap_or(self.max_delay_seconds)
            .min(self.max_delay_seconds);
        Duration::seconds(seconds)
    }

    /// 根据失败前的重试次数给出下一步
    ///
    /// 重试次数先加一；超过 `max_retries` 或失败不可重试时进入死信。
    pub fn decide(
        &self,
        retry_count: i32,
        max_retries: i32,
        failed_at: DateTime<Utc>,
        kind: FailureKind,
    ) -> RetryDecision {
        let retry_count = retry_count.saturating_add(1);

        let transition = if kind == FailureKind::Permanent || retry_count > max_retries {
            RetryTransition::DeadLetter
        } else {
            RetryTransition::Retry {
                next_retry_at: failed_at + self.backoff_delay(retry_count),
            }
        };

        RetryDecision {
            retry_count,
            failed_at,
            transition,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn failed_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = RetryPolicy::new(60, 3600);
        assert_eq!(policy.backoff_delay(1), Duration::seconds(60));
        assert_eq!(policy.backoff_delay(2), Duration::seconds(120));
        assert_eq!(policy.backoff_delay(3), Duration::seconds(240));
        assert_eq!(policy.backoff_delay(7), Duration::seconds(3600));
        assert_eq!(policy.backoff_delay(i32::MAX), Duration::seconds(3600));
    }

    #[test]
    fn test_zero_base_delay_still_moves_forward() {
        let policy = RetryPolicy::new(0, 0);
        let decision = policy.decide(0, 3, failed_at(), FailureKind::Retryable);
        assert!(decision.next_retry_at().unwrap() > failed_at());
    }

    #[test]
    fn test_dead_letter_on_fourth_failure() {
        let policy = RetryPolicy::default();
        let mut retry_count = 0;

        for attempt in 1..=3 {
            let decision = policy.decide(retry_count, 3, failed_at(), FailureKind::Retryable);
            assert_eq!(decision.retry_count, attempt);
            assert!(!decision.is_dead_letter(), "第 {attempt} 次失败不应进入死信");
            assert!(decision.next_retry_at().unwrap() > failed_at());
            retry_count = decision.retry_count;
        }

        let decision = policy.decide(retry_count, 3, failed_at(), FailureKind::Retryable);
        assert_eq!(decision.retry_count, 4);
        assert!(decision.is_dead_letter());
        assert_eq!(decision.failed_at, failed_at());
    }

    #[test]
    fn test_permanent_failure_skips_retries() {
        let decision = RetryPolicy::default().decide(0, 5, failed_at(), FailureKind::Permanent);
        assert_eq!(decision.retry_count, 1);
        assert!(decision.is_dead_letter());
    }

    #[test]
    fn test_unknown_handler_follows_backoff() {
        let policy = RetryPolicy::new(10, 100);
        let decision = policy.decide(1, 3, failed_at(), FailureKind::UnknownHandler);
        assert_eq!(
            decision.transition,
            RetryTransition::Retry {
                next_retry_at: failed_at() + Duration::seconds(20)
            }
        );
    }

    #[test]
    fn test_zero_max_retries_dead_letters_first_failure() {
        let decision = RetryPolicy::default().decide(0, 0, failed_at(), FailureKind::Retryable);
        assert!(decision.is_dead_letter());
    }
}
