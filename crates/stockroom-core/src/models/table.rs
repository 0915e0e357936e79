//! Synchronized tables

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Every table the engine keeps in sync with the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Products,
    Categories,
    Customers,
    Sales,
    Stock,
    Locations,
    StockMovements,
    Refunds,
}

impl Table {
    pub const ALL: [Self; 8] = [
        Self::Products,
        Self::Categories,
        Self::Customers,
        Self::Sales,
        Self::Stock,
        Self::Locations,
        Self::StockMovements,
        Self::Refunds,
    ];

    /// Table name in both stores.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Products => "products",
            Self::Categories => "categories",
            Self::Customers => "customers",
            Self::Sales => "sales",
            Self::Stock => "stock",
            Self::Locations => "locations",
            Self::StockMovements => "stock_movements",
            Self::Refunds => "refunds",
        }
    }

    /// Fields that identify "the same thing" when no remote id links two records.
    ///
    /// Empty means the table never merges duplicate candidates.
    pub const fn fingerprint_fields(self) -> &'static [&'static str] {
        match self {
            Self::Products | Self::Categories | Self::Customers | Self::Locations => &["name"],
            Self::Sales => &["sale_date", "total_amount"],
            Self::Refunds => &["sale_id", "refund_date"],
            Self::Stock => &["product_id", "location_id"],
            Self::StockMovements => &["movement_number"],
        }
    }

    /// Counter guarded against stale remote values overwriting unsynced local edits.
    pub const fn quantity_field(self) -> Option<&'static str> {
        match self {
            Self::Stock => Some("quantity_current"),
            _ => None,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|table| table.as_str() == wanted)
            .ok_or_else(|| Error::InvalidInput(format!("unknown table `{}`", s.trim())))
    }
}
