// ===============================
// src/validator.rs
// ===============================
//
// Boundary check for create_deal. Loosely-typed JSON in, ValidDeal out.
// Every violated rule is collected; nothing is fail-fast. Digit fields are
// stripped of separators and strings trimmed BEFORE any format or sum check.
//
use std::str::FromStr;

use ahash::AHashMap as HashMap;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::deal::{Payer, Recipient, RecipientKind, RecipientType, ValidDeal};

/// Sums must differ from the deal amount by strictly less than this.
pub const SUM_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// 999 999 999 999.99; 15 significant digits survive the JSON number on the wire.
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(276_447_231, 23_283, 0, false, 2);

const NAME_MAX: usize = 160;
const PURPOSE_MAX: usize = 210;
const EXT_KEY_MAX: usize = 255;

// ASCII printable, Cyrillic block, a few typographic marks upstream accepts
static FREE_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\x20-\x7E\u{0400}-\u{04FF}№«»–—]*$").expect("static regex"));

const DEAL_KEYS: &[&str] = &["ext_key", "amount", "payers", "recipients"];
const PAYER_KEYS: &[&str] = &["virtual_account", "amount"];
const COMMON_RECIPIENT_KEYS: &[&str] = &["number", "type", "amount"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldIssue {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Error)]
#[error("{}", summary(.issues))]
pub struct ValidationErrors {
    pub issues: Vec<FieldIssue>,
}

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    /// Any issue at `path`.
    pub fn has(&self, path: &str) -> bool {
        self.issues.iter().any(|i| i.path == path)
    }
}

// "2 issue(s): payers: ...; recipients[0].name: ..."
fn summary(issues: &[FieldIssue]) -> String {
    let mut out = format!("{} issue(s)", issues.len());
    for (i, issue) in issues.iter().enumerate() {
        out.push_str(if i == 0 { ": " } else { "; " });
        out.push_str(&issue.path);
        out.push_str(": ");
        out.push_str(&issue.message);
    }
    out
}

/// Allowed beyond the common keys, per recipient type.
fn variant_keys(t: RecipientType) -> &'static [&'static str] {
    match t {
        RecipientType::PaymentContract => &["account", "bank_code", "name", "inn", "kpp", "purpose"],
        RecipientType::Commission => &["name", "purpose"],
        RecipientType::SbpV1 => &[
            "phone_number",
            "bank_sbp_id",
            "first_name",
            "last_name",
            "middle_name",
            "purpose",
        ],
        RecipientType::SbpV2 => &["phone_number", "bank_sbp_id", "name", "inn", "purpose"],
        RecipientType::Card => &["card_number_crypto_base64"],
        RecipientType::Ndfl => &["kbk", "oktmo", "purpose"],
        RecipientType::NdflToVirtualAccount => &["virtual_account"],
    }
}

pub fn validate_deal(candidate: &Value) -> Result<ValidDeal, ValidationErrors> {
    let mut cx = Checker::default();

    let Some(deal) = candidate.as_object() else {
        cx.issue("", "deal must be a JSON object");
        return Err(cx.finish());
    };
    cx.unknown_keys(deal, "", DEAL_KEYS);

    // optional, but an explicit empty key is a caller bug
    let ext_key_given = deal.get("ext_key").is_some_and(|v| !v.is_null());
    let ext_key = cx.text(deal, "", "ext_key", ext_key_given, EXT_KEY_MAX);
    let amount = match deal.get("amount") {
        Some(v) => cx.amount(v, "amount"),
        None => {
            cx.issue("amount", "required");
            None
        }
    };

    let (payers, payer_amounts) = cx.payers(deal);
    let (recipients, recipient_amounts) = cx.recipients(deal);

    // ---- cross-field rules ----
    // Sums run on every parsed amount, even when other fields of an item failed.
    if let Some(total) = amount {
        if let Some(amounts) = &payer_amounts {
            cx.sum_matches("payers", "payer", amounts, total);
        }
        if let Some(amounts) = &recipient_amounts {
            cx.sum_matches("recipients", "recipient", amounts, total);
        }
    }

    match (cx.issues.is_empty(), amount, payers, recipients) {
        (true, Some(amount), Some(payers), Some(recipients)) => Ok(ValidDeal {
            ext_key,
            amount,
            payers,
            recipients,
        }),
        _ => Err(cx.finish()),
    }
}

#[derive(Default)]
struct Checker {
    issues: Vec<FieldIssue>,
}

impl Checker {
    fn issue(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.issues.push(FieldIssue {
            path: path.into(),
            message: message.into(),
        });
    }

    fn finish(self) -> ValidationErrors {
        ValidationErrors { issues: self.issues }
    }

    fn sum_matches(&mut self, path: &str, what: &str, amounts: &[Decimal], total: Decimal) {
        let Some(sum) = amounts
            .iter()
            .try_fold(Decimal::ZERO, |acc, a| acc.checked_add(*a))
        else {
            self.issue(path, format!("{what} amounts overflow when summed"));
            return;
        };
        if (sum - total).abs() >= SUM_TOLERANCE {
            self.issue(
                path,
                format!("{what} amounts sum to {sum:.2}, deal amount is {total:.2}"),
            );
        }
    }

    fn unknown_keys(&mut self, obj: &Map<String, Value>, base: &str, allowed: &[&str]) {
        let mut unknown: Vec<&String> = obj.keys().filter(|k| !allowed.contains(&k.as_str())).collect();
        unknown.sort();
        for k in unknown {
            self.issue(join(base, k), "unexpected field");
        }
    }

    /// Trimmed free text. Returns `None` when absent or invalid.
    fn text(&mut self, obj: &Map<String, Value>, base: &str, field: &str, required: bool, max: usize) -> Option<String> {
        let path = join(base, field);
        let raw = match obj.get(field) {
            None | Some(Value::Null) => {
                if required {
                    self.issue(path, "required");
                }
                return None;
            }
            Some(Value::String(s)) => s.trim().to_string(),
            Some(_) => {
                self.issue(path, "must be a string");
                return None;
            }
        };
        if raw.is_empty() {
            if required {
                self.issue(path, "must not be empty");
            }
            return None;
        }
        if raw.chars().count() > max {
            self.issue(path, format!("longer than {max} characters"));
            return None;
        }
        if !FREE_TEXT.is_match(&raw) {
            self.issue(path, "contains characters outside Latin, Cyrillic and basic punctuation");
            return None;
        }
        Some(raw)
    }

    /// Digits only after stripping separators; length must be one of `lens`.
    fn digits(
        &mut self,
        obj: &Map<String, Value>,
        base: &str,
        field: &str,
        required: bool,
        lens: &[usize],
    ) -> Option<String> {
        let path = join(base, field);
        let raw = match obj.get(field) {
            None | Some(Value::Null) => {
                if required {
                    self.issue(path, "required");
                }
                return None;
            }
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(_) => {
                self.issue(path, "must be a string of digits");
                return None;
            }
        };
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() && !required && raw.trim().is_empty() {
            return None;
        }
        if !lens.contains(&digits.len()) {
            let expected = lens.iter().map(|l| l.to_string()).collect::<Vec<_>>().join(" or ");
            self.issue(path, format!("must be exactly {expected} digits"));
            return None;
        }
        Some(digits)
    }

    fn uuid(&mut self, obj: &Map<String, Value>, base: &str, field: &str) -> Option<Uuid> {
        let path = join(base, field);
        match obj.get(field) {
            None | Some(Value::Null) => {
                self.issue(path, "required");
                None
            }
            Some(Value::String(s)) => match Uuid::parse_str(s.trim()) {
                Ok(u) => Some(u),
                Err(_) => {
                    self.issue(path, "must be a UUID");
                    None
                }
            },
            Some(_) => {
                self.issue(path, "must be a UUID string");
                None
            }
        }
    }

    /// Positive, at most two decimal places. Number or numeric string.
    fn amount(&mut self, v: &Value, path: &str) -> Option<Decimal> {
        let parsed = match v {
            Value::Number(n) => {
                let s = n.to_string();
                Decimal::from_str(&s).or_else(|_| Decimal::from_scientific(&s)).ok()
            }
            Value::String(s) => Decimal::from_str(s.trim()).ok(),
            _ => None,
        };
        let Some(d) = parsed else {
            self.issue(path, "must be a number");
            return None;
        };
        if d <= Decimal::ZERO {
            self.issue(path, "must be positive");
            return None;
        }
        if d.normalize().scale() > 2 {
            self.issue(path, "must have at most 2 decimal places");
            return None;
        }
        if d > MAX_AMOUNT {
            self.issue(path, format!("must not exceed {MAX_AMOUNT}"));
            return None;
        }
        Some(d)
    }

    fn list<'a>(&mut self, deal: &'a Map<String, Value>, field: &str, what: &str) -> Option<&'a Vec<Value>> {
        match deal.get(field) {
            None | Some(Value::Null) => {
                self.issue(field, "required");
                None
            }
            Some(Value::Array(items)) if items.is_empty() => {
                self.issue(field, format!("at least one {what} is required"));
                None
            }
            Some(Value::Array(items)) => Some(items),
            Some(_) => {
                self.issue(field, "must be an array");
                None
            }
        }
    }

    /// Payers when every one is valid, and the amounts when every amount parsed.
    fn payers(&mut self, deal: &Map<String, Value>) -> (Option<Vec<Payer>>, Option<Vec<Decimal>>) {
        let Some(items) = self.list(deal, "payers", "payer") else {
            return (None, None);
        };
        let mut out = Vec::with_capacity(items.len());
        let mut amounts = Amounts::with_capacity(items.len());
        let mut all_ok = true;

        for (i, item) in items.iter().enumerate() {
            let base = format!("payers[{i}]");
            let Some(obj) = item.as_object() else {
                self.issue(base, "must be an object");
                all_ok = false;
                amounts.missing();
                continue;
            };
            self.unknown_keys(obj, &base, PAYER_KEYS);
            let va = self.uuid(obj, &base, "virtual_account");
            let amount = self.required_amount(obj, &base);
            amounts.record(amount);
            match (va, amount) {
                (Some(virtual_account), Some(amount)) => out.push(Payer { virtual_account, amount }),
                _ => all_ok = false,
            }
        }
        (all_ok.then_some(out), amounts.finish())
    }

    fn required_amount(&mut self, obj: &Map<String, Value>, base: &str) -> Option<Decimal> {
        let path = join(base, "amount");
        match obj.get("amount") {
            None | Some(Value::Null) => {
                self.issue(path, "required");
                None
            }
            Some(v) => self.amount(v, &path),
        }
    }

    /// Recipients when every one is valid, and the amounts when every amount parsed.
    fn recipients(&mut self, deal: &Map<String, Value>) -> (Option<Vec<Recipient>>, Option<Vec<Decimal>>) {
        let Some(items) = self.list(deal, "recipients", "recipient") else {
            return (None, None);
        };
        let mut out = Vec::with_capacity(items.len());
        let mut amounts = Amounts::with_capacity(items.len());
        let mut all_ok = true;
        let mut seen: HashMap<u64, usize> = HashMap::new();

        for (i, item) in items.iter().enumerate() {
            let base = format!("recipients[{i}]");
            let Some(obj) = item.as_object() else {
                self.issue(base, "must be an object");
                all_ok = false;
                amounts.missing();
                continue;
            };

            // number: positive and unique within the deal
            let number = match obj.get("number").and_then(Value::as_u64) {
                Some(n) if n > 0 && n <= u64::from(u32::MAX) => {
                    if let Some(first) = seen.get(&n) {
                        self.issue(
                            join(&base, "number"),
                            format!("duplicate recipient number {n} (also used by recipients[{first}])"),
                        );
                        None
                    } else {
                        seen.insert(n, i);
                        Some(n as u32)
                    }
                }
                _ => {
                    self.issue(join(&base, "number"), "must be a positive integer");
                    None
                }
            };

            let amount = self.required_amount(obj, &base);
            amounts.record(amount);

            let rtype = match obj.get("type") {
                Some(Value::String(t)) => match RecipientType::parse(t.trim()) {
                    Some(rt) => Some(rt),
                    None => {
                        self.issue(join(&base, "type"), format!("unknown recipient type '{}'", t.trim()));
                        None
                    }
                },
                None | Some(Value::Null) => {
                    self.issue(join(&base, "type"), "required");
                    None
                }
                Some(_) => {
                    self.issue(join(&base, "type"), "must be a string");
                    None
                }
            };

            let kind = rtype.and_then(|rt| {
                let mut allowed: Vec<&str> = COMMON_RECIPIENT_KEYS.to_vec();
                allowed.extend_from_slice(variant_keys(rt));
                let before = self.issues.len();
                self.unknown_keys(obj, &base, &allowed);
                let kind = self.recipient_kind(rt, obj, &base);
                // stray or malformed optional fields fail the recipient too
                if self.issues.len() > before {
                    None
                } else {
                    kind
                }
            });

            match (number, amount, kind) {
                (Some(number), Some(amount), Some(kind)) => out.push(Recipient { number, amount, kind }),
                _ => all_ok = false,
            }
        }
        (all_ok.then_some(out), amounts.finish())
    }

    fn recipient_kind(&mut self, rt: RecipientType, obj: &Map<String, Value>, base: &str) -> Option<RecipientKind> {
        match rt {
            RecipientType::PaymentContract => {
                let account = self.digits(obj, base, "account", true, &[20]);
                let bank_code = self.digits(obj, base, "bank_code", true, &[9]);
                let name = self.text(obj, base, "name", true, NAME_MAX);
                let inn = self.digits(obj, base, "inn", true, &[10, 12]);
                let kpp = self.digits(obj, base, "kpp", false, &[9]);
                let purpose = self.text(obj, base, "purpose", false, PURPOSE_MAX);
                Some(RecipientKind::PaymentContract {
                    account: account?,
                    bank_code: bank_code?,
                    name: name?,
                    inn: inn?,
                    kpp,
                    purpose,
                })
            }
            RecipientType::Commission => {
                let name = self.text(obj, base, "name", true, NAME_MAX);
                let purpose = self.text(obj, base, "purpose", false, PURPOSE_MAX);
                Some(RecipientKind::Commission { name: name?, purpose })
            }
            RecipientType::SbpV1 => {
                let phone_number = self.phone(obj, base);
                let bank_sbp_id = self.digits(obj, base, "bank_sbp_id", true, &[12]);
                let first_name = self.text(obj, base, "first_name", true, NAME_MAX);
                let last_name = self.text(obj, base, "last_name", true, NAME_MAX);
                let middle_name = self.text(obj, base, "middle_name", false, NAME_MAX);
                let purpose = self.text(obj, base, "purpose", false, PURPOSE_MAX);
                Some(RecipientKind::SbpV1 {
                    phone_number: phone_number?,
                    bank_sbp_id: bank_sbp_id?,
                    first_name: first_name?,
                    last_name: last_name?,
                    middle_name,
                    purpose,
                })
            }
            RecipientType::SbpV2 => {
                let phone_number = self.phone(obj, base);
                let bank_sbp_id = self.digits(obj, base, "bank_sbp_id", true, &[12]);
                let name = self.text(obj, base, "name", true, NAME_MAX);
                let inn = self.digits(obj, base, "inn", false, &[10, 12]);
                let purpose = self.text(obj, base, "purpose", false, PURPOSE_MAX);
                Some(RecipientKind::SbpV2 {
                    phone_number: phone_number?,
                    bank_sbp_id: bank_sbp_id?,
                    name: name?,
                    inn,
                    purpose,
                })
            }
            RecipientType::Card => {
                let path = join(base, "card_number_crypto_base64");
                let payload = match obj.get("card_number_crypto_base64") {
                    Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
                    _ => {
                        self.issue(path, "required");
                        return None;
                    }
                };
                if STANDARD.decode(&payload).is_err() {
                    self.issue(path, "must be base64");
                    return None;
                }
                Some(RecipientKind::Card {
                    card_number_crypto_base64: payload,
                })
            }
            RecipientType::Ndfl => {
                let kbk = self.digits(obj, base, "kbk", true, &[20]);
                let oktmo = self.digits(obj, base, "oktmo", true, &[8, 11]);
                let purpose = self.text(obj, base, "purpose", false, PURPOSE_MAX);
                Some(RecipientKind::Ndfl {
                    kbk: kbk?,
                    oktmo: oktmo?,
                    purpose,
                })
            }
            RecipientType::NdflToVirtualAccount => {
                let va = self.uuid(obj, base, "virtual_account")?;
                Some(RecipientKind::NdflToVirtualAccount { virtual_account: va })
            }
        }
    }

    // Russian mobile in international form: 7XXXXXXXXXX
    fn phone(&mut self, obj: &Map<String, Value>, base: &str) -> Option<String> {
        let digits = self.digits(obj, base, "phone_number", true, &[11])?;
        if !digits.starts_with('7') {
            self.issue(join(base, "phone_number"), "must start with country code 7");
            return None;
        }
        Some(digits)
    }
}

// Parsed amounts of one list; poisoned by any amount that did not parse.
struct Amounts {
    values: Vec<Decimal>,
    complete: bool,
}

impl Amounts {
    fn with_capacity(n: usize) -> Self {
        Self {
            values: Vec::with_capacity(n),
            complete: true,
        }
    }

    fn record(&mut self, amount: Option<Decimal>) {
        match amount {
            Some(a) => self.values.push(a),
            None => self.complete = false,
        }
    }

    fn missing(&mut self) {
        self.complete = false;
    }

    fn finish(self) -> Option<Vec<Decimal>> {
        self.complete.then_some(self.values)
    }
}

fn join(base: &str, field: &str) -> String {
    if base.is_empty() {
        field.to_string()
    } else {
        format!("{base}.{field}")
    }
}
