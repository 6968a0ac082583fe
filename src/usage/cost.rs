use std::fmt;

/// 1 美元 = 10^9 纳美元
pub const NANOS_PER_USD: f64 = 1_000_000_000.0;

/// Token 用量 -> 费用（纳美元）的换算
///
/// 费用以整数纳美元累计，重复累加不会产生浮点漂移。
pub trait CostModel: Send + Sync + fmt::Debug {
    fn cost_nanos(&self, tokens: u64) -> u64;
}

/// 按固定单价计费
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerTokenRate {
    usd_per_token: f64,
}

impl PerTokenRate {
    pub fn new(usd_per_token: f64) -> Self {
        Self {
            usd_per_token: if usd_per_token.is_finite() {
                usd_per_token.max(0.0)
            } else {
                0.0
            },
        }
    }

    pub fn usd_per_token(&self) -> f64 {
        self.usd_per_token
    }
}

impl CostModel for PerTokenRate {
    fn cost_nanos(&self, tokens: u64) -> u64 {
        (tokens as f64 * self.usd_per_token * NANOS_PER_USD).round() as u64
    }
}

pub fn nanos_to_usd(nanos: u64) -> f64 {
    nanos as f64 / NANOS_PER_USD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_token_rate_is_exact() {
        let rate = PerTokenRate::new(0.0001);
        assert_eq!(rate.cost_nanos(1000), 100_000_000);
        assert_eq!(rate.cost_nanos(0), 0);

        // 累加一万次不漂移
        let total: u64 = (0..10_000).map(|_| rate.cost_nanos(1000)).sum();
        assert_eq!(total, 1_000_000_000_000);
        assert_eq!(nanos_to_usd(total), 1000.0);
    }

    #[test]
    fn test_small_calls_are_not_rounded_away() {
        let rate = PerTokenRate::new(0.000_000_15);
        assert_eq!(rate.cost_nanos(1), 150);
        assert_eq!(rate.cost_nanos(3), 450);

        let split: u64 = (0..1000).map(|_| rate.cost_nanos(1)).sum();
        assert_eq!(split, rate.cost_nanos(1000));
    }

    #[test]
    fn test_invalid_rate_is_clamped() {
        assert_eq!(PerTokenRate::new(-1.0).cost_nanos(10), 0);
        assert_eq!(PerTokenRate::new(f64::NAN).cost_nanos(10), 0);
    }
}
