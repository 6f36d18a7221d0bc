//! Marketplace fee engine.
//!
//! Pure payout computation: a profitable flip on paper must be profitable
//! after every marketplace fee. Rules are windowed in time so schedules can
//! change without rewriting history.

use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeType {
    Transaction,
    PaymentProcessing,
    Shipping,
    Custom,
}

impl FeeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeeType::Transaction => "transaction",
            FeeType::PaymentProcessing => "payment_processing",
            FeeType::Shipping => "shipping",
            FeeType::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeCalc {
    Percentage,
    Fixed,
    Tiered,
}

/// One band of a tiered rule. Bands are ordered; a band applies while
/// `sale_price <= up_to` (the last band may be open-ended).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeTier {
    pub up_to: Option<f64>,
    pub percentage: Option<f64>,
    pub fixed: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeRule {
    pub id: String,
    pub fee_type: FeeType,
    pub calc: FeeCalc,
    /// Percentage fraction (0.085 = 8.5%) or fixed amount, per `calc`.
    pub value: f64,
    pub minimum: Option<f64>,
    pub tiers: Vec<FeeTier>,
    pub effective_from: DateTime<Utc>,
    pub effective_until: Option<DateTime<Utc>>,
}

impl FeeRule {
    pub fn percentage(id: &str, fee_type: FeeType, fraction: f64) -> Self {
        Self {
            id: id.to_string(),
            fee_type,
            calc: FeeCalc::Percentage,
            value: fraction,
            minimum: None,
            tiers: Vec::new(),
            effective_from: DateTime::<Utc>::MIN_UTC,
            effective_until: None,
        }
    }

    pub fn fixed(id: &str, fee_type: FeeType, amount: f64) -> Self {
        Self {
            id: id.to_string(),
            fee_type,
            calc: FeeCalc::Fixed,
            value: amount,
            minimum: None,
            tiers: Vec::new(),
            effective_from: DateTime::<Utc>::MIN_UTC,
            effective_until: None,
        }
    }

    pub fn tiered(id: &str, fee_type: FeeType, tiers: Vec<FeeTier>) -> Self {
        Self {
            id: id.to_string(),
            fee_type,
            calc: FeeCalc::Tiered,
            value: 0.0,
            minimum: None,
            tiers,
            effective_from: DateTime::<Utc>::MIN_UTC,
            effective_until: None,
        }
    }

    pub fn with_minimum(mut self, minimum: f64) -> Self {
        self.minimum = Some(minimum);
        self
    }

    pub fn effective(mut self, from: DateTime<Utc>, until: Option<DateTime<Utc>>) -> Self {
        self.effective_from = from;
        self.effective_until = until;
        self
    }

    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        at >= self.effective_from && self.effective_until.map_or(true, |until| at < until)
    }

    /// Fee amount for a sale price, rounded to the cent.
    fn fee_for(&self, sale_price: f64) -> f64 {
        let raw = match self.calc {
            FeeCalc::Percentage => {
                let fee = sale_price * self.value;
                match self.minimum {
                    Some(min) => fee.max(min),
                    None => fee,
                }
            }
            FeeCalc::Fixed => self.value,
            FeeCalc::Tiered => {
                let band = self
                    .tiers
                    .iter()
                    .find(|t| t.up_to.map_or(true, |cap| sale_price <= cap));
                match band {
                    Some(t) => {
                        t.percentage.map(|p| sale_price * p).unwrap_or(0.0)
                            + t.fixed.unwrap_or(0.0)
                    }
                    None => 0.0,
                }
            }
        };
        round_cents(raw)
    }
}

#[inline]
fn round_cents(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub rules: Vec<FeeRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Marketplace {
    pub id: String,
    pub name: String,
    pub currency: String,
    pub schedule: FeeSchedule,
}

impl Marketplace {
    /// Resale-marketplace schedule used when a deployment configures nothing
    /// else: 9% transaction (min 5.00), 3% payment processing, 4.50 shipping.
    pub fn default_resale(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            currency: "EUR".to_string(),
            schedule: FeeSchedule {
                rules: vec![
                    FeeRule::percentage("transaction", FeeType::Transaction, 0.09)
                        .with_minimum(5.0),
                    FeeRule::percentage("payment", FeeType::PaymentProcessing, 0.03),
                    FeeRule::fixed("shipping", FeeType::Shipping, 4.50),
                ],
            },
        }
    }
}

/// One applied rule in a payout breakdown; preserves rule identity for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeLine {
    pub rule_id: String,
    pub fee_type: FeeType,
    pub amount: f64,
    pub minimum_applied: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payout {
    pub sale_price: f64,
    pub total_fees: f64,
    pub net_payout: f64,
    pub breakdown: Vec<FeeLine>,
}

/// Compute the seller payout for a sale on `marketplace` at `at_time`.
///
/// Pure and deterministic: identical inputs produce identical output.
/// A schedule with more than one active rule for a fee-type violates the
/// schedule invariant and is rejected rather than guessed at.
pub fn payout_for(
    marketplace: &Marketplace,
    sale_price: f64,
    at_time: DateTime<Utc>,
) -> EngineResult<Payout> {
    if sale_price < 0.0 {
        return Err(EngineError::DataIntegrity(format!(
            "negative sale price {sale_price}"
        )));
    }

    let mut breakdown: Vec<FeeLine> = Vec::with_capacity(4);

    for fee_type in [
        FeeType::Transaction,
        FeeType::PaymentProcessing,
        FeeType::Shipping,
        FeeType::Custom,
    ] {
        let active: Vec<&FeeRule> = marketplace
            .schedule
            .rules
            .iter()
            .filter(|r| r.fee_type == fee_type && r.is_active_at(at_time))
            .collect();

        match active.len() {
            0 => continue,
            1 => {
                let rule = active[0];
                let amount = rule.fee_for(sale_price);
                let minimum_applied = matches!(
                    (rule.calc, rule.minimum),
                    (FeeCalc::Percentage, Some(min)) if round_cents(sale_price * rule.value) < min
                );
                breakdown.push(FeeLine {
                    rule_id: rule.id.clone(),
                    fee_type,
                    amount,
                    minimum_applied,
                });
            }
            n => {
                return Err(EngineError::DataIntegrity(format!(
                    "marketplace '{}' has {} active {} rules at {}",
                    marketplace.id,
                    n,
                    fee_type.as_str(),
                    at_time
                )));
            }
        }
    }

    let total_fees = round_cents(breakdown.iter().map(|l| l.amount).sum());
    Ok(Payout {
        sale_price,
        total_fees,
        net_payout: round_cents(sale_price - total_fees),
        breakdown,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marketplace() -> Marketplace {
        Marketplace {
            id: "stockx".to_string(),
            name: "StockX".to_string(),
            currency: "EUR".to_string(),
            schedule: FeeSchedule {
                rules: vec![
                    FeeRule::percentage("tx-8.5", FeeType::Transaction, 0.085).with_minimum(5.0),
                    FeeRule::percentage("pay-3", FeeType::PaymentProcessing, 0.03),
                    FeeRule::fixed("ship-flat", FeeType::Shipping, 4.50),
                ],
            },
        }
    }

    #[test]
    fn minimum_fee_applies_on_low_price_sale() {
        // 48.94 * 8.5% = 4.16 < 5.00 minimum
        let payout = payout_for(&marketplace(), 48.94, Utc::now()).unwrap();

        let tx = payout
            .breakdown
            .iter()
            .find(|l| l.fee_type == FeeType::Transaction)
            .unwrap();
        assert_eq!(tx.amount, 5.00);
        assert!(tx.minimum_applied);

        let pay = payout
            .breakdown
            .iter()
            .find(|l| l.fee_type == FeeType::PaymentProcessing)
            .unwrap();
        assert_eq!(pay.amount, 1.47);

        assert_eq!(payout.total_fees, 10.97);
        assert_eq!(payout.net_payout, 37.97);
    }

    #[test]
    fn minimum_not_applied_above_threshold() {
        // 180 * 8.5% = 15.30 > 5.00
        let payout = payout_for(&marketplace(), 180.0, Utc::now()).unwrap();
        let tx = payout
            .breakdown
            .iter()
            .find(|l| l.fee_type == FeeType::Transaction)
            .unwrap();
        assert_eq!(tx.amount, 15.30);
        assert!(!tx.minimum_applied);
    }

    #[test]
    fn payout_is_pure() {
        let m = marketplace();
        let at = Utc::now();
        let a = payout_for(&m, 123.45, at).unwrap();
        let b = payout_for(&m, 123.45, at).unwrap();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn tiered_rule_selects_band() {
        let m = Marketplace {
            id: "goat".to_string(),
            name: "GOAT".to_string(),
            currency: "EUR".to_string(),
            schedule: FeeSchedule {
                rules: vec![FeeRule::tiered(
                    "tiers",
                    FeeType::Transaction,
                    vec![
                        FeeTier {
                            up_to: Some(100.0),
                            percentage: None,
                            fixed: Some(9.0),
                        },
                        FeeTier {
                            up_to: None,
                            percentage: Some(0.095),
                            fixed: None,
                        },
                    ],
                )],
            },
        };

        let low = payout_for(&m, 80.0, Utc::now()).unwrap();
        assert_eq!(low.total_fees, 9.0);

        let high = payout_for(&m, 200.0, Utc::now()).unwrap();
        assert_eq!(high.total_fees, 19.0);
    }

    #[test]
    fn expired_rules_are_skipped() {
        let mut m = marketplace();
        let cutoff = Utc::now() - chrono::Duration::days(30);
        m.schedule.rules[2] = FeeRule::fixed("ship-old", FeeType::Shipping, 4.50)
            .effective(DateTime::<Utc>::MIN_UTC, Some(cutoff));

        let payout = payout_for(&m, 100.0, Utc::now()).unwrap();
        assert!(payout
            .breakdown
            .iter()
            .all(|l| l.fee_type != FeeType::Shipping));
    }

    #[test]
    fn duplicate_active_rules_rejected() {
        let mut m = marketplace();
        m.schedule
            .rules
            .push(FeeRule::percentage("tx-dup", FeeType::Transaction, 0.10));

        let err = payout_for(&m, 100.0, Utc::now()).unwrap_err();
        assert!(matches!(err, EngineError::DataIntegrity(_)));
    }
}
