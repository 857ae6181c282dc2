// ===============================
// src/payout.rs (vending commission -> deal candidate)
// ===============================
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    Cash,
    Cashless,
}

/// One sale as reported by the vending telemetry provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendingSale {
    pub machine_id: String,
    pub amount: Decimal,
    pub payment_type: PaymentType,
    pub sold_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommissionPlan {
    pub payer_virtual_account: Uuid,
    /// Percent of cashless revenue, e.g. 3.5
    pub rate_percent: Decimal,
    pub recipient_name: String,
    pub min_payout: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommissionPayout {
    pub payer_virtual_account: Uuid,
    pub recipient_name: String,
    pub sales_count: usize,
    pub gross: Decimal,
    pub commission: Decimal,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
}

/// Cashless sales only (cash never reaches the nominal account).
/// `None` when the rounded commission is below `min_payout` or not positive.
pub fn calculate(plan: &CommissionPlan, sales: &[VendingSale]) -> Option<CommissionPayout> {
    let cashless: Vec<&VendingSale> = sales
        .iter()
        .filter(|s| s.payment_type == PaymentType::Cashless && s.amount > Decimal::ZERO)
        .collect();

    let gross: Decimal = cashless.iter().map(|s| s.amount).sum();
    let commission = (gross * plan.rate_percent / Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);

    if commission <= Decimal::ZERO || commission < plan.min_payout {
        return None;
    }

    Some(CommissionPayout {
        payer_virtual_account: plan.payer_virtual_account,
        recipient_name: plan.recipient_name.clone(),
        sales_count: cashless.len(),
        gross,
        commission,
        period_start: cashless.iter().map(|s| s.sold_at).min(),
        period_end: cashless.iter().map(|s| s.sold_at).max(),
    })
}

impl CommissionPayout {
    /// Loosely-typed on purpose: it goes through the deal validator like any other input.
    pub fn to_deal_candidate(&self) -> Value {
        let amount = self.commission.to_string();
        let mut purpose = format!("Комиссия с {} безналичных продаж", self.sales_count);
        if let (Some(from), Some(to)) = (self.period_start, self.period_end) {
            purpose.push_str(&format!(
                " за период {} - {}",
                from.format("%d.%m.%Y"),
                to.format("%d.%m.%Y")
            ));
        }
        json!({
            "amount": amount,
            "payers": [{ "virtual_account": self.payer_virtual_account.to_string(), "amount": amount }],
            "recipients": [{
                "number": 1,
                "type": "commission",
                "amount": amount,
                "name": self.recipient_name,
                "purpose": purpose,
            }]
        })
    }
}
