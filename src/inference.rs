//! Item parsers for the two decision modules.

use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::envelope::{ItemError, ItemParser};

/// Ticker symbol, trimmed and uppercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(symbol: &str) -> Option<Self> {
        let symbol = symbol.trim();
        if symbol.is_empty() {
            return None;
        }
        Some(Self(symbol.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Symbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationInference {
    pub symbol: Symbol,
    pub category: String,
    /// Signal strength in `[0, 1]`.
    pub intensity: Decimal,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllocationItemParser;

impl ItemParser for AllocationItemParser {
    type Item = AllocationInference;

    fn parse_item(&self, item: &Value) -> Result<AllocationInference, ItemError> {
        let object = item.as_object().ok_or(ItemError::NotAnObject)?;

        Ok(AllocationInference {
            symbol: symbol(object)?,
            category: required_text(object, "category")?,
            intensity: unit_interval(object, "intensity")?
                .ok_or(ItemError::MissingField("intensity"))?,
            reason: optional_text(object, "reason")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskAction {
    Hold,
    Reduce,
    Exit,
}

impl FromStr for RiskAction {
    type Err = ItemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hold" => Ok(Self::Hold),
            "reduce" => Ok(Self::Reduce),
            "exit" => Ok(Self::Exit),
            other => Err(ItemError::InvalidField {
                field: "action",
                reason: format!("unknown action '{other}'"),
            }),
        }
    }
}

impl Display for RiskAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hold => f.write_str("hold"),
            Self::Reduce => f.write_str("reduce"),
            Self::Exit => f.write_str("exit"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskInference {
    pub symbol: Symbol,
    pub action: RiskAction,
    pub risk_flags: Vec<String>,
    pub intensity: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RiskItemParser;

impl ItemParser for RiskItemParser {
    type Item = RiskInference;

    fn parse_item(&self, item: &Value) -> Result<RiskInference, ItemError> {
        let object = item.as_object().ok_or(ItemError::NotAnObject)?;

        let action = required_text(object, "action")?.parse()?;

        let risk_flags = match object.get("riskFlags") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(flags)) => flags
                .iter()
                .map(|flag| match flag.as_str().map(str::trim) {
                    Some(flag) if !flag.is_empty() => Ok(flag.to_string()),
                    _ => Err(ItemError::InvalidField {
                        field: "riskFlags",
                        reason: "flags must be non-empty strings".to_string(),
                    }),
                })
                .collect::<Result<_, _>>()?,
            Some(_) => {
                return Err(ItemError::InvalidField {
                    field: "riskFlags",
                    reason: "expected a list".to_string(),
                });
            }
        };

        Ok(RiskInference {
            symbol: symbol(object)?,
            action,
            risk_flags,
            intensity: unit_interval(object, "intensity")?,
        })
    }
}

fn symbol(object: &Map<String, Value>) -> Result<Symbol, ItemError> {
    let raw = required_text(object, "symbol")?;
    Symbol::new(&raw).ok_or(ItemError::MissingField("symbol"))
}

fn required_text(object: &Map<String, Value>, field: &'static str) -> Result<String, ItemError> {
    optional_text(object, field)?.ok_or(ItemError::MissingField(field))
}

fn optional_text(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, ItemError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) if text.trim().is_empty() => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.trim().to_string())),
        Some(_) => Err(ItemError::InvalidField {
            field,
            reason: "expected a string".to_string(),
        }),
    }
}

/// Accepts JSON numbers and numeric strings so producers can send exact
/// decimals.
fn unit_interval(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<Decimal>, ItemError> {
    let invalid = |reason: String| ItemError::InvalidField { field, reason };

    let value = match object.get(field) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(number)) => Decimal::from_str(&number.to_string())
            .or_else(|_| Decimal::from_scientific(&number.to_string()))
            .map_err(|e| invalid(e.to_string()))?,
        Some(Value::String(text)) => {
            Decimal::from_str(text.trim()).map_err(|e| invalid(e.to_string()))?
        }
        Some(_) => return Err(invalid("expected a number".to_string())),
    };

    if value < Decimal::ZERO || value > Decimal::ONE {
        return Err(invalid(format!("{value} is outside [0, 1]")));
    }

    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn parses_allocation_item() {
        let item = AllocationItemParser
            .parse_item(&json!({
                "symbol": " aapl ",
                "category": "equity",
                "intensity": 0.75,
                "reason": "momentum"
            }))
            .unwrap();

        assert_eq!(item.symbol.as_str(), "AAPL");
        assert_eq!(item.category, "equity");
        assert_eq!(item.intensity, dec!(0.75));
        assert_eq!(item.reason.as_deref(), Some("momentum"));
    }

    #[test]
    fn allocation_intensity_accepts_decimal_strings() {
        let item = AllocationItemParser
            .parse_item(&json!({ "symbol": "BTC", "category": "crypto", "intensity": "0.125" }))
            .unwrap();
        assert_eq!(item.intensity, dec!(0.125));
    }

    #[test]
    fn allocation_intensity_out_of_range_is_rejected() {
        let error = AllocationItemParser
            .parse_item(&json!({ "symbol": "BTC", "category": "crypto", "intensity": 1.5 }))
            .unwrap_err();
        assert!(matches!(
            error,
            ItemError::InvalidField {
                field: "intensity",
                ..
            }
        ));
    }

    #[test]
    fn allocation_requires_category_and_intensity() {
        assert_eq!(
            AllocationItemParser
                .parse_item(&json!({ "symbol": "BTC", "intensity": 0.5 }))
                .unwrap_err(),
            ItemError::MissingField("category")
        );
        assert_eq!(
            AllocationItemParser
                .parse_item(&json!({ "symbol": "BTC", "category": "crypto" }))
                .unwrap_err(),
            ItemError::MissingField("intensity")
        );
    }

    #[test]
    fn non_object_item_is_rejected() {
        assert_eq!(
            AllocationItemParser.parse_item(&json!("AAPL")).unwrap_err(),
            ItemError::NotAnObject
        );
    }

    #[test]
    fn parses_risk_item() {
        let item = RiskItemParser
            .parse_item(&json!({
                "symbol": "tsla",
                "action": "Reduce",
                "riskFlags": ["drawdown", "volatility"]
            }))
            .unwrap();

        assert_eq!(item.symbol.as_str(), "TSLA");
        assert_eq!(item.action, RiskAction::Reduce);
        assert_eq!(item.risk_flags, vec!["drawdown", "volatility"]);
        assert_eq!(item.intensity, None);
    }

    #[test]
    fn risk_flags_default_to_empty() {
        let item = RiskItemParser
            .parse_item(&json!({ "symbol": "ETH", "action": "hold" }))
            .unwrap();
        assert!(item.risk_flags.is_empty());
    }

    #[test]
    fn unknown_risk_action_is_rejected() {
        let error = RiskItemParser
            .parse_item(&json!({ "symbol": "ETH", "action": "double_down" }))
            .unwrap_err();
        assert!(matches!(error, ItemError::InvalidField { field: "action", .. }));
    }

    #[test]
    fn blank_risk_flag_is_rejected() {
        let error = RiskItemParser
            .parse_item(&json!({ "symbol": "ETH", "action": "exit", "riskFlags": ["", "x"] }))
            .unwrap_err();
        assert!(matches!(
            error,
            ItemError::InvalidField {
                field: "riskFlags",
                ..
            }
        ));
    }
}
