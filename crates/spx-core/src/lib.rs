//! Core domain model for exchange trading results.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "spx-core";

/// Instrument-code components derived by fixed offsets from `exchange_product_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductCodeParts {
    pub oil_id: String,
    pub delivery_basis_id: String,
    pub delivery_type_id: String,
}

/// Splits an instrument code into oil (chars 0..4), delivery basis (chars 4..7)
/// and delivery type (last char). Short codes yield truncated parts, never a panic.
pub fn split_product_code(code: &str) -> ProductCodeParts {
    let chars: Vec<char> = code.chars().collect();
    let slice = |from: usize, to: usize| -> String {
        let to = to.min(chars.len());
        let from = from.min(to);
        chars[from..to].iter().collect()
    };
    ProductCodeParts {
        oil_id: slice(0, 4),
        delivery_basis_id: slice(4, 7),
        delivery_type_id: chars.last().map(|c| c.to_string()).unwrap_or_default(),
    }
}

/// Normalized trade row produced by ingestion, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub exchange_product_id: String,
    pub exchange_product_name: String,
    pub oil_id: String,
    pub delivery_basis_id: String,
    pub delivery_basis_name: String,
    pub delivery_type_id: String,
    pub volume: f64,
    pub total: i64,
    pub count: i64,
    pub trade_date: NaiveDate,
}

impl TradeRecord {
    pub fn new(
        exchange_product_id: impl Into<String>,
        exchange_product_name: impl Into<String>,
        delivery_basis_name: impl Into<String>,
        volume: f64,
        total: i64,
        count: i64,
        trade_date: NaiveDate,
    ) -> Self {
        let exchange_product_id = exchange_product_id.into();
        let parts = split_product_code(&exchange_product_id);
        Self {
            exchange_product_name: exchange_product_name.into(),
            oil_id: parts.oil_id,
            delivery_basis_id: parts.delivery_basis_id,
            delivery_basis_name: delivery_basis_name.into(),
            delivery_type_id: parts.delivery_type_id,
            exchange_product_id,
            volume,
            total,
            count,
            trade_date,
        }
    }
}

/// Persisted trade row with store-assigned identity and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTrade {
    pub id: i64,
    #[serde(flatten)]
    pub record: TradeRecord,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Optional instrument filters shared by the read queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeFilter {
    pub oil_id: Option<String>,
    pub delivery_type_id: Option<String>,
    pub delivery_basis_id: Option<String>,
}

impl TradeFilter {
    pub fn matches(&self, record: &TradeRecord) -> bool {
        fn eq(filter: &Option<String>, value: &str) -> bool {
            filter.as_deref().map_or(true, |f| f == value)
        }
        eq(&self.oil_id, &record.oil_id)
            && eq(&self.delivery_type_id, &record.delivery_type_id)
            && eq(&self.delivery_basis_id, &record.delivery_basis_id)
    }
}

/// Inclusive date range plus instrument filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicsQuery {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(flatten)]
    pub filter: TradeFilter,
}

impl DynamicsQuery {
    pub fn matches(&self, record: &TradeRecord) -> bool {
        record.trade_date >= self.start_date
            && record.trade_date <= self.end_date
            && self.filter.matches(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn derived_fields_follow_fixed_offsets() {
        for code in ["A100NVY060F", "A592ACH005A", "DT5RNPZ065W", "A100000E"] {
            let record = TradeRecord::new(code, "name", "basis", 1.0, 1, 1, day(2024, 3, 1));
            let chars: Vec<char> = code.chars().collect();
            assert_eq!(record.oil_id, chars[..4].iter().collect::<String>());
            assert_eq!(record.delivery_basis_id, chars[4..7].iter().collect::<String>());
            assert_eq!(record.delivery_type_id, chars[chars.len() - 1].to_string());
        }
    }

    #[test]
    fn short_codes_do_not_panic() {
        let parts = split_product_code("AB");
        assert_eq!(parts.oil_id, "AB");
        assert_eq!(parts.delivery_basis_id, "");
        assert_eq!(parts.delivery_type_id, "B");
        assert_eq!(split_product_code(""), ProductCodeParts {
            oil_id: String::new(),
            delivery_basis_id: String::new(),
            delivery_type_id: String::new(),
        });
    }

    #[test]
    fn dynamics_query_is_inclusive_and_filtered() {
        let record = TradeRecord::new("A100000E", "n", "b", 1.0, 1, 1, day(2023, 1, 1));
        let query = DynamicsQuery {
            start_date: day(2023, 1, 1),
            end_date: day(2023, 1, 1),
            filter: TradeFilter {
                oil_id: Some("A100".into()),
                ..Default::default()
            },
        };
        assert!(query.matches(&record));

        let other_oil = DynamicsQuery {
            filter: TradeFilter {
                oil_id: Some("A200".into()),
                ..Default::default()
            },
            ..query.clone()
        };
        assert!(!other_oil.matches(&record));

        let later = DynamicsQuery {
            start_date: day(2023, 1, 2),
            end_date: day(2023, 1, 3),
            ..query
        };
        assert!(!later.matches(&record));
    }
}
