// ===============================
// src/deal.rs
// ===============================
use std::fmt;
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Server-authoritative deal status; the client only observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealStatus {
    New,
    InProcess,
    Partial,
    Closed,
    Correction,
    Rejected,
    CanceledByPlatform,
}

impl DealStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DealStatus::New => "new",
            DealStatus::InProcess => "in_process",
            DealStatus::Partial => "partial",
            DealStatus::Closed => "closed",
            DealStatus::Correction => "correction",
            DealStatus::Rejected => "rejected",
            DealStatus::CanceledByPlatform => "canceled_by_platform",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DealStatus::Closed | DealStatus::Rejected | DealStatus::CanceledByPlatform
        )
    }

    pub fn can_edit(&self) -> bool {
        matches!(self, DealStatus::New | DealStatus::Partial)
    }

    pub fn can_execute(&self) -> bool {
        matches!(self, DealStatus::New | DealStatus::Partial)
    }

    pub fn can_cancel_from_correction(&self) -> bool {
        matches!(self, DealStatus::Correction)
    }

    /// Edges of the lifecycle graph:
    /// new -> in_process -> {partial, closed}; new -> correction -> {closed, canceled_by_platform};
    /// new -> rejected; partial -> in_process (re-execution).
    pub fn can_transition_to(&self, next: DealStatus) -> bool {
        use DealStatus::*;
        matches!(
            (self, next),
            (New, InProcess)
                | (New, Correction)
                | (New, Rejected)
                | (InProcess, Partial)
                | (InProcess, Closed)
                | (Partial, InProcess)
                | (Correction, Closed)
                | (Correction, CanceledByPlatform)
        )
    }
}

impl fmt::Display for DealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DealStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(DealStatus::New),
            "in_process" => Ok(DealStatus::InProcess),
            "partial" => Ok(DealStatus::Partial),
            "closed" => Ok(DealStatus::Closed),
            "correction" => Ok(DealStatus::Correction),
            "rejected" => Ok(DealStatus::Rejected),
            "canceled_by_platform" => Ok(DealStatus::CanceledByPlatform),
            other => Err(format!("unknown deal status '{other}'")),
        }
    }
}

/// The part of `get_deal` the client acts on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealSnapshot {
    #[serde(alias = "deal_id")]
    pub id: String,
    pub status: DealStatus,
}

// ---- Recipients ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecipientType {
    PaymentContract,
    Commission,
    SbpV1,
    SbpV2,
    Card,
    Ndfl,
    NdflToVirtualAccount,
}

impl RecipientType {
    pub const ALL: [RecipientType; 7] = [
        RecipientType::PaymentContract,
        RecipientType::Commission,
        RecipientType::SbpV1,
        RecipientType::SbpV2,
        RecipientType::Card,
        RecipientType::Ndfl,
        RecipientType::NdflToVirtualAccount,
    ];

    /// Wire discriminant.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientType::PaymentContract => "payment_contract",
            RecipientType::Commission => "commission",
            RecipientType::SbpV1 => "payment_contract_by_sbp",
            RecipientType::SbpV2 => "payment_contract_by_sbp_v2",
            RecipientType::Card => "payment_contract_to_card",
            RecipientType::Ndfl => "ndfl",
            RecipientType::NdflToVirtualAccount => "ndfl_to_virtual_account",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for RecipientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecipientKind {
    PaymentContract {
        account: String,
        bank_code: String,
        name: String,
        inn: String,
        kpp: Option<String>,
        purpose: Option<String>,
    },
    Commission {
        name: String,
        purpose: Option<String>,
    },
    SbpV1 {
        phone_number: String,
        bank_sbp_id: String,
        first_name: String,
        last_name: String,
        middle_name: Option<String>,
        purpose: Option<String>,
    },
    SbpV2 {
        phone_number: String,
        bank_sbp_id: String,
        name: String,
        inn: Option<String>,
        purpose: Option<String>,
    },
    Card {
        card_number_crypto_base64: String,
    },
    Ndfl {
        kbk: String,
        oktmo: String,
        purpose: Option<String>,
    },
    NdflToVirtualAccount {
        virtual_account: Uuid,
    },
}

impl RecipientKind {
    pub fn recipient_type(&self) -> RecipientType {
        match self {
            RecipientKind::PaymentContract { .. } => RecipientType::PaymentContract,
            RecipientKind::Commission { .. } => RecipientType::Commission,
            RecipientKind::SbpV1 { .. } => RecipientType::SbpV1,
            RecipientKind::SbpV2 { .. } => RecipientType::SbpV2,
            RecipientKind::Card { .. } => RecipientType::Card,
            RecipientKind::Ndfl { .. } => RecipientType::Ndfl,
            RecipientKind::NdflToVirtualAccount { .. } => RecipientType::NdflToVirtualAccount,
        }
    }

    fn write_fields(&self, out: &mut Map<String, Value>) {
        let mut put = |k: &str, v: &str| {
            out.insert(k.to_string(), Value::String(v.to_string()));
        };
        match self {
            RecipientKind::PaymentContract {
                account,
                bank_code,
                name,
                inn,
                kpp,
                purpose,
            } => {
                put("account", account);
                put("bank_code", bank_code);
                put("name", name);
                put("inn", inn);
                if let Some(kpp) = kpp {
                    put("kpp", kpp);
                }
                if let Some(p) = purpose {
                    put("purpose", p);
                }
            }
            RecipientKind::Commission { name, purpose } => {
                put("name", name);
                if let Some(p) = purpose {
                    put("purpose", p);
                }
            }
            RecipientKind::SbpV1 {
                phone_number,
                bank_sbp_id,
                first_name,
                last_name,
                middle_name,
                purpose,
            } => {
                put("phone_number", phone_number);
                put("bank_sbp_id", bank_sbp_id);
                put("first_name", first_name);
                put("last_name", last_name);
                if let Some(m) = middle_name {
                    put("middle_name", m);
                }
                if let Some(p) = purpose {
                    put("purpose", p);
                }
            }
            RecipientKind::SbpV2 {
                phone_number,
                bank_sbp_id,
                name,
                inn,
                purpose,
            } => {
                put("phone_number", phone_number);
                put("bank_sbp_id", bank_sbp_id);
                put("name", name);
                if let Some(inn) = inn {
                    put("inn", inn);
                }
                if let Some(p) = purpose {
                    put("purpose", p);
                }
            }
            RecipientKind::Card {
                card_number_crypto_base64,
            } => put("card_number_crypto_base64", card_number_crypto_base64),
            RecipientKind::Ndfl { kbk, oktmo, purpose } => {
                put("kbk", kbk);
                put("oktmo", oktmo);
                if let Some(p) = purpose {
                    put("purpose", p);
                }
            }
            RecipientKind::NdflToVirtualAccount { virtual_account } => {
                put("virtual_account", &virtual_account.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Payer {
    pub virtual_account: Uuid,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recipient {
    pub number: u32,
    pub amount: Decimal,
    pub kind: RecipientKind,
}

/// A deal candidate that passed validation; the only shape `create_deal` sends.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidDeal {
    pub ext_key: Option<String>,
    pub amount: Decimal,
    pub payers: Vec<Payer>,
    pub recipients: Vec<Recipient>,
}

impl ValidDeal {
    /// Upstream `create_deal` params.
    pub fn to_params(&self) -> Value {
        let payers: Vec<Value> = self
            .payers
            .iter()
            .map(|p| {
                json!({
                    "virtual_account": p.virtual_account.to_string(),
                    "amount": money(p.amount),
                })
            })
            .collect();

        let recipients: Vec<Value> = self
            .recipients
            .iter()
            .map(|r| {
                let mut obj = Map::new();
                obj.insert("number".into(), json!(r.number));
                obj.insert("type".into(), json!(r.kind.recipient_type().as_str()));
                obj.insert("amount".into(), money(r.amount));
                r.kind.write_fields(&mut obj);
                Value::Object(obj)
            })
            .collect();

        let mut params = json!({
            "amount": money(self.amount),
            "payers": payers,
            "recipients": recipients,
        });
        if let (Some(ext_key), Some(obj)) = (&self.ext_key, params.as_object_mut()) {
            obj.insert("ext_key".into(), json!(ext_key));
        }
        params
    }
}

// Two-decimal JSON number. Exact for validated amounts (at most 15 significant
// digits); anything a float cannot carry goes out as text instead of null.
fn money(d: Decimal) -> Value {
    let d = d.round_dp(2);
    d.to_f64()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(d.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn lifecycle_permissions() {
        use DealStatus::*;
        for s in [New, Partial] {
            assert!(s.can_edit() && s.can_execute());
        }
        for s in [InProcess, Closed, Correction, Rejected, CanceledByPlatform] {
            assert!(!s.can_edit() && !s.can_execute(), "{s}");
        }
        assert!(Correction.can_cancel_from_correction());
        assert!(!New.can_cancel_from_correction());
    }

    #[test]
    fn terminal_states_have_no_exits() {
        use DealStatus::*;
        let all = [New, InProcess, Partial, Closed, Correction, Rejected, CanceledByPlatform];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
        assert!(New.can_transition_to(Correction));
        assert!(Correction.can_transition_to(CanceledByPlatform));
        assert!(!New.can_transition_to(Closed));
    }

    #[test]
    fn status_round_trips_through_wire_names() {
        let s: DealStatus = serde_json::from_str("\"canceled_by_platform\"").unwrap();
        assert_eq!(s, DealStatus::CanceledByPlatform);
        assert_eq!("in_process".parse::<DealStatus>().unwrap(), DealStatus::InProcess);
        assert!("done".parse::<DealStatus>().is_err());
    }

    #[test]
    fn params_carry_type_discriminant_and_fields() {
        let va = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();
        let deal = ValidDeal {
            ext_key: Some("k-1".into()),
            amount: Decimal::from_str("150.50").unwrap(),
            payers: vec![Payer {
                virtual_account: va,
                amount: Decimal::from_str("150.50").unwrap(),
            }],
            recipients: vec![
                Recipient {
                    number: 1,
                    amount: Decimal::from_str("100.00").unwrap(),
                    kind: RecipientKind::Commission {
                        name: "ACME".into(),
                        purpose: None,
                    },
                },
                Recipient {
                    number: 2,
                    amount: Decimal::from_str("50.50").unwrap(),
                    kind: RecipientKind::NdflToVirtualAccount { virtual_account: va },
                },
            ],
        };
        let p = deal.to_params();
        assert_eq!(p["ext_key"], "k-1");
        assert_eq!(p["amount"], json!(150.5));
        assert_eq!(p["recipients"][0]["type"], "commission");
        assert_eq!(p["recipients"][0]["name"], "ACME");
        assert!(p["recipients"][0].get("purpose").is_none());
        assert_eq!(p["recipients"][1]["type"], "ndfl_to_virtual_account");
        assert_eq!(p["recipients"][1]["virtual_account"], va.to_string());
    }

    #[test]
    fn money_keeps_cents_of_large_amounts() {
        for text in ["123456789012.34", "999999999999.99", "0.01"] {
            let wire = serde_json::to_string(&money(Decimal::from_str(text).unwrap())).unwrap();
            assert_eq!(wire, text);
        }
        assert!(money(Decimal::MAX).is_number());
    }

    #[test]
    fn recipient_type_names_are_unique() {
        for t in RecipientType::ALL {
            assert_eq!(RecipientType::parse(t.as_str()), Some(t));
        }
        assert_eq!(RecipientType::parse("wire"), None);
    }
}
