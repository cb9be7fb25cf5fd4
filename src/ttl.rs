use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// How the variable part of a TTL grows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum TtlScale {
    Fixed,
    /// Add `step` for every full `records` underlying records.
    PerRecords {
        records: u64,
        #[serde(with = "crate::config::millis")]
        step:    Duration,
    },
    /// Add `step` for every full `value` of the computed magnitude.
    PerValue {
        value: f64,
        #[serde(with = "crate::config::millis")]
        step:  Duration,
    },
}

/// `ttl = min(base + scale(volume or value), max)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TtlPolicy {
    #[serde(with = "crate::config::millis")]
    pub base:  Duration,
    #[serde(with = "crate::config::millis")]
    pub max:   Duration,
    pub scale: TtlScale,
}

impl TtlPolicy {
    pub const DEFAULT_BASE: Duration = Duration::from_secs(5 * 60);
    pub const DEFAULT_MAX: Duration = Duration::from_secs(30 * 60);

    pub fn fixed(ttl: Duration) -> Self {
        Self {
            base:  ttl,
            max:   ttl,
            scale: TtlScale::Fixed,
        }
    }

    /// Lifetime earnings: one more minute per 100 ledger rows.
    pub fn earnings() -> Self {
        Self {
            base:  Self::DEFAULT_BASE,
            max:   Self::DEFAULT_MAX,
            scale: TtlScale::PerRecords {
                records: 100,
                step:    Duration::from_secs(60),
            },
        }
    }

    /// Lifetime spend: one more minute per 10 000 coins.
    pub fn spending() -> Self {
        Self {
            base:  Self::DEFAULT_BASE,
            max:   Self::DEFAULT_MAX,
            scale: TtlScale::PerValue {
                value: 10_000.0,
                step:  Duration::from_secs(60),
            },
        }
    }

    pub fn stats() -> Self {
        Self::fixed(Self::DEFAULT_BASE)
    }

    /// TTL for an aggregate computed as `value` out of `records` underlying rows.
    pub fn ttl_for(&self, records: u64, value: f64) -> Duration {
        let extra = match self.scale {
            TtlScale::Fixed => Duration::ZERO,
            TtlScale::PerRecords { records: per, step } if per > 0 => step.saturating_mul(steps(records / per)),
            TtlScale::PerValue { value: per, step } if per > 0.0 && value.is_finite() && value > 0.0 => {
                step.saturating_mul(steps((value / per).floor() as u64))
            }
            _ => Duration::ZERO,
        };
        self.base.saturating_add(extra).min(self.max.max(self.base))
    }
}

#[inline]
fn steps(n: u64) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earnings_scale_with_rows() {
        let policy = TtlPolicy::earnings();
        assert_eq!(policy.ttl_for(0, 0.0), Duration::from_secs(300));
        assert_eq!(policy.ttl_for(99, 5_000.0), Duration::from_secs(300));
        // 250 rows: two full steps.
        assert_eq!(policy.ttl_for(250, 12_000.0), Duration::from_secs(420));
        assert_eq!(policy.ttl_for(1_000_000, 0.0), Duration::from_secs(1800));
    }

    #[test]
    fn spending_scales_with_value() {
        let policy = TtlPolicy::spending();
        assert_eq!(policy.ttl_for(3, 9_999.0), Duration::from_secs(300));
        assert_eq!(policy.ttl_for(3, 25_000.0), Duration::from_secs(420));
        assert_eq!(policy.ttl_for(3, f64::INFINITY), Duration::from_secs(300));
        assert_eq!(policy.ttl_for(3, 1e12), Duration::from_secs(1800));
    }

    #[test]
    fn fixed_ignores_input() {
        let policy = TtlPolicy::stats();
        assert_eq!(policy.ttl_for(10_000, 1e9), TtlPolicy::DEFAULT_BASE);
    }

    #[test]
    fn json_shape() {
        let policy: TtlPolicy = serde_json::from_str(
            r#"{"base": 1000, "max": 5000, "scale": {"by": "per_records", "records": 10, "step": 500}}"#,
        )
        .unwrap();
        assert_eq!(policy.ttl_for(25, 0.0), Duration::from_millis(2000));
    }
}
