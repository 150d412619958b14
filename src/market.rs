//! Shared state of the external market-data collaborator.
//!
//! The engine only reads and writes these fields; fetching prices is the
//! host's job, triggered by a refresh-request event.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Last fetched price pair for the current item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub high: i64,
    pub low: i64,
}

/// Field of the market panel a step reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketField {
    ItemName,
    Quantity,
    HighPrice,
    LowPrice,
}

#[derive(Debug, Clone, Default)]
pub struct MarketPanel {
    pub item_name: String,
    pub quantity: String,
    pub last_price: Option<PriceQuote>,
}

impl MarketPanel {
    /// Text representation of a field, `None` when price data has not been
    /// fetched yet.
    pub fn field_text(&self, field: MarketField) -> Option<String> {
        match field {
            MarketField::ItemName => Some(self.item_name.clone()),
            MarketField::Quantity => Some(self.quantity.clone()),
            MarketField::HighPrice => self.last_price.map(|p| p.high.to_string()),
            MarketField::LowPrice => self.last_price.map(|p| p.low.to_string()),
        }
    }
}

pub type SharedMarket = Arc<Mutex<MarketPanel>>;

pub fn shared_market() -> SharedMarket {
    Arc::new(Mutex::new(MarketPanel::default()))
}
