//! Parimutuel market math.
//!
//! Everything here is pure integer arithmetic over pool balances. Pools and
//! stakes are token base units up to u64 scale; products go through u128 and
//! the multiply-before-divide steps are arranged so they cannot overflow at
//! those magnitudes. `Decimal` only appears as a display view of an exact
//! ratio, never as an input to money math.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fee rates are expressed out of this many basis points.
pub const BPS_DENOMINATOR: u32 = 10_000;

/// Fixed-point scale for the decimal view of a ratio (9 places).
const DISPLAY_SCALE: u128 = 1_000_000_000;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("market has no outcomes")]
    NoOutcomes,
    #[error("fee rates {protocol} + {creator} bps exceed 10000")]
    FeesTooHigh { protocol: u32, creator: u32 },
}

/// An exact non-negative ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub numerator: u128,
    pub denominator: u128,
}

impl Price {
    fn new(numerator: u128, denominator: u128) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Floor of the ratio in basis points.
    pub fn bps(&self) -> u128 {
        mul_div_floor(self.numerator, u128::from(BPS_DENOMINATOR), self.denominator).unwrap_or(0)
    }

    /// Ratio truncated to 9 decimal places.
    pub fn to_decimal(&self) -> Decimal {
        mul_div_floor(self.numerator, DISPLAY_SCALE, self.denominator)
            .and_then(|scaled| i128::try_from(scaled).ok())
            .and_then(|scaled| Decimal::try_from_i128_with_scale(scaled, 9).ok())
            .unwrap_or(Decimal::ZERO)
    }
}

/// floor(a * b / c) without overflowing the intermediate product, as long as
/// `a * c` fits in u128. None on a zero divisor or a result past u128.
pub fn mul_div_floor(a: u128, b: u128, c: u128) -> Option<u128> {
    if c == 0 {
        return None;
    }
    // a*b/c = a*(b/c) + a*(b%c)/c, and a*(b%c) < a*c
    let whole = a.checked_mul(b / c)?;
    let rest = a.checked_mul(b % c)? / c;
    whole.checked_add(rest)
}

fn total(pools: &[u64]) -> u128 {
    pools.iter().map(|p| u128::from(*p)).sum()
}

/// Implied probability of `outcome_index`: its pool over the total.
///
/// With no stake anywhere every outcome is priced uniformly at 1/N. None if
/// the index is out of range.
pub fn price(outcome_index: usize, pools: &[u64]) -> Option<Price> {
    let pool = *pools.get(outcome_index)?;
    let sum = total(pools);
    if sum == 0 {
        return Some(Price::new(1, pools.len() as u128));
    }
    Some(Price::new(u128::from(pool), sum))
}

/// Gross decimal odds (total / pool) before fees. None for an empty pool.
pub fn implied_odds(outcome_index: usize, pools: &[u64]) -> Option<Price> {
    let pool = *pools.get(outcome_index)?;
    if pool == 0 {
        return None;
    }
    Some(Price::new(total(pools), u128::from(pool)))
}

/// Estimated return for staking `amount` on `outcome_index` right now.
///
/// Simulates the pools after the bet, takes `fee_bps` of the new total, and
/// splits the rest pro rata over the winning pool. Rounds down at every step.
/// Returns 0 for a non-positive amount or an unknown outcome.
pub fn indicative_payout(amount: i128, outcome_index: usize, pools: &[u64], fee_bps: u32) -> u128 {
    if amount <= 0 {
        return 0;
    }
    let Some(pool) = pools.get(outcome_index) else {
        return 0;
    };
    let amount = amount.unsigned_abs();

    let Some(new_total) = total(pools).checked_add(amount) else {
        return 0;
    };
    let Some(new_outcome_pool) = u128::from(*pool).checked_add(amount) else {
        return 0;
    };
    if new_outcome_pool == 0 {
        return 0;
    }

    let fee_bps = u128::from(fee_bps.min(BPS_DENOMINATOR));
    let fee = mul_div_floor(new_total, fee_bps, u128::from(BPS_DENOMINATOR)).unwrap_or(new_total);
    let net_pot = new_total - fee;

    mul_div_floor(amount, net_pot, new_outcome_pool).unwrap_or(0)
}

/// Pool balances for one market as read from chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub pools: Vec<u64>,
    pub protocol_fee_bps: u32,
    pub creator_fee_bps: u32,
}

impl PoolSnapshot {
    pub fn new(pools: Vec<u64>, protocol_fee_bps: u32, creator_fee_bps: u32) -> Result<Self, PoolError> {
        let snapshot = Self {
            pools,
            protocol_fee_bps,
            creator_fee_bps,
        };
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Checks what `new` checks, for snapshots that arrived via serde.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.pools.is_empty() {
            return Err(PoolError::NoOutcomes);
        }
        let fees = u64::from(self.protocol_fee_bps) + u64::from(self.creator_fee_bps);
        if fees > u64::from(BPS_DENOMINATOR) {
            return Err(PoolError::FeesTooHigh {
                protocol: self.protocol_fee_bps,
                creator: self.creator_fee_bps,
            });
        }
        Ok(())
    }

    pub fn total_fee_bps(&self) -> u32 {
        self.protocol_fee_bps.saturating_add(self.creator_fee_bps)
    }

    pub fn total_pool(&self) -> u128 {
        total(&self.pools)
    }

    pub fn payout(&self, amount: i128, outcome_index: usize) -> u128 {
        indicative_payout(amount, outcome_index, &self.pools, self.total_fee_bps())
    }
}

/// Per-outcome pricing served to the UI.
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeQuote {
    pub index: usize,
    pub title: Option<String>,
    pub pool: u64,
    pub price: Decimal,
    pub price_bps: u128,
    /// Gross decimal odds; absent while the outcome has no stake.
    pub odds: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketQuote {
    pub total_pool: u128,
    pub fee_bps: u32,
    pub outcomes: Vec<OutcomeQuote>,
}

/// Price every outcome of a snapshot. `titles` is matched by index.
pub fn quote(snapshot: &PoolSnapshot, titles: &[String]) -> MarketQuote {
    let outcomes = (0..snapshot.pools.len())
        .filter_map(|index| {
            let p = price(index, &snapshot.pools)?;
            Some(OutcomeQuote {
                index,
                title: titles.get(index).cloned(),
                pool: snapshot.pools[index],
                price: p.to_decimal(),
                price_bps: p.bps(),
                odds: implied_odds(index, &snapshot.pools).map(|o| o.to_decimal()),
            })
        })
        .collect();

    MarketQuote {
        total_pool: snapshot.total_pool(),
        fee_bps: snapshot.total_fee_bps(),
        outcomes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_uniform_price_without_bets() {
        let pools = [0, 0];
        for i in 0..2 {
            let p = price(i, &pools).unwrap();
            assert_eq!(p, Price::new(1, 2));
            assert_eq!(p.to_decimal(), Decimal::from_str("0.5").unwrap());
            assert_eq!(p.bps(), 5_000);
        }
        assert_eq!(price(0, &[0, 0, 0]).unwrap().bps(), 3_333);
        assert!(price(2, &pools).is_none());
        assert!(price(0, &[]).is_none());
    }

    #[test]
    fn test_price_from_pools() {
        let pools = [600_000_000, 400_000_000];
        assert_eq!(price(0, &pools).unwrap().to_decimal(), Decimal::from_str("0.6").unwrap());
        assert_eq!(price(1, &pools).unwrap().bps(), 4_000);

        let odds = implied_odds(1, &pools).unwrap();
        assert_eq!(odds.to_decimal(), Decimal::from_str("2.5").unwrap());
        assert!(implied_odds(0, &[0, 5]).is_none());
    }

    #[test]
    fn test_indicative_payout_reference() {
        let pools = [600_000_000, 400_000_000];
        let payout = indicative_payout(100_000_000, 0, &pools, 200);
        assert_eq!(payout, 100_000_000u128 * (1_100_000_000 - 22_000_000) / 700_000_000);
        assert_eq!(payout, 154_000_000);
    }

    #[test]
    fn test_payout_guards() {
        let pools = [600_000_000, 400_000_000];
        assert_eq!(indicative_payout(0, 0, &pools, 200), 0);
        assert_eq!(indicative_payout(-5, 0, &pools, 200), 0);
        assert_eq!(indicative_payout(100, 2, &pools, 200), 0);
        assert_eq!(indicative_payout(100, 0, &[], 200), 0);
    }

    #[test]
    fn test_payout_into_empty_market() {
        // Sole bettor gets their stake back minus the fee
        assert_eq!(indicative_payout(1_000, 0, &[0, 0], 250), 975);
        assert_eq!(indicative_payout(1_000, 1, &[0, 0], 0), 1_000);
        // Full fee leaves nothing
        assert_eq!(indicative_payout(1_000, 0, &[0, 0], 10_000), 0);
        assert_eq!(indicative_payout(1_000, 0, &[0, 0], 20_000), 0);
    }

    #[test]
    fn test_payout_at_u64_scale() {
        let pools = [u64::MAX, u64::MAX, u64::MAX];
        let amount = i128::from(u64::MAX);
        // Four equal stakes of u64::MAX on outcome 0 vs three others: 4x pot / 2x pool
        let payout = indicative_payout(amount, 0, &pools, 0);
        assert_eq!(payout, 2 * u128::from(u64::MAX));

        let with_fee = indicative_payout(amount, 0, &pools, 100);
        assert!(with_fee < payout);
    }

    #[test]
    fn test_mul_div_floor() {
        assert_eq!(mul_div_floor(7, 3, 2), Some(10));
        assert_eq!(mul_div_floor(1, 1, 0), None);
        let big = u128::from(u64::MAX);
        assert_eq!(mul_div_floor(big, big * 4, big * 2), Some(big * 2));
    }

    #[test]
    fn test_snapshot_validation() {
        assert_eq!(PoolSnapshot::new(vec![], 0, 0), Err(PoolError::NoOutcomes));
        assert!(matches!(
            PoolSnapshot::new(vec![1, 2], 9_000, 1_001),
            Err(PoolError::FeesTooHigh { .. })
        ));
        let snap = PoolSnapshot::new(vec![600_000_000, 400_000_000], 150, 50).unwrap();
        assert_eq!(snap.total_fee_bps(), 200);
        assert_eq!(snap.payout(100_000_000, 0), 154_000_000);
    }

    #[test]
    fn test_quote() {
        let snap = PoolSnapshot::new(vec![750, 250, 0], 100, 0).unwrap();
        let titles = vec!["Yes".to_string(), "No".to_string()];
        let q = quote(&snap, &titles);
        assert_eq!(q.total_pool, 1_000);
        assert_eq!(q.outcomes.len(), 3);
        assert_eq!(q.outcomes[0].title.as_deref(), Some("Yes"));
        assert_eq!(q.outcomes[0].price_bps, 7_500);
        assert_eq!(q.outcomes[1].odds, Some(Decimal::from(4)));
        assert!(q.outcomes[2].title.is_none());
        assert!(q.outcomes[2].odds.is_none());
    }
}
