//! Catalog and sales types shared by the store, the jobs and the API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Product line a catalog item belongs to. Part of the upsert conflict key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    #[default]
    Lego,
    MegaConstrux,
    FunkoPop,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Lego => "lego",
            Category::MegaConstrux => "mega_construx",
            Category::FunkoPop => "funko_pop",
        }
    }

    /// Brand prefix used when searching auction listings.
    pub fn search_prefix(&self) -> &'static str {
        match self {
            Category::Lego => "LEGO",
            Category::MegaConstrux => "Mega Construx",
            Category::FunkoPop => "Funko Pop",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        match key.as_str() {
            "lego" => Ok(Category::Lego),
            "megaconstrux" | "mega" => Ok(Category::MegaConstrux),
            "funkopop" | "funko" => Ok(Category::FunkoPop),
            _ => Err(anyhow::anyhow!("unknown category: {s}")),
        }
    }
}

/// One trackable collectible set or figure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: i64,
    pub set_number: Option<String>,
    pub name: String,
    pub category: Category,
    pub theme: Option<String>,
    pub year_released: Option<i32>,
    pub piece_count: Option<i32>,
    pub retail_price: Option<f64>,
    pub is_retired: bool,
    pub year_retired: Option<i32>,
    pub image_url: Option<String>,
    pub avg_sale_price: Option<f64>,
    pub new_avg_price: Option<f64>,
}

impl CatalogItem {
    /// Bare item with only identity fields populated.
    pub fn new(id: i64, set_number: Option<&str>, name: &str, category: Category) -> Self {
        Self {
            id,
            set_number: set_number.map(str::to_string),
            name: name.to_string(),
            category,
            theme: None,
            year_released: None,
            piece_count: None,
            retail_price: None,
            is_retired: false,
            year_retired: None,
            image_url: None,
            avg_sale_price: None,
            new_avg_price: None,
        }
    }
}

/// Insert payload produced by catalog imports; keyed on (set_number, category).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCatalogItem {
    pub set_number: String,
    pub name: String,
    pub category: Category,
    pub theme: Option<String>,
    pub year_released: Option<i32>,
    pub piece_count: Option<i32>,
    pub image_url: Option<String>,
}

/// Field changes for an existing item. `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ItemPatch {
    pub retail_price: Option<f64>,
    pub piece_count: Option<i32>,
    pub image_url: Option<String>,
    pub is_retired: Option<bool>,
    pub year_retired: Option<i32>,
}

impl ItemPatch {
    pub fn is_empty(&self) -> bool {
        self.retail_price.is_none()
            && self.piece_count.is_none()
            && self.image_url.is_none()
            && self.is_retired.is_none()
            && self.year_retired.is_none()
    }

    /// Names of the columns this patch touches, for log lines.
    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.retail_price.is_some() {
            out.push("retail_price");
        }
        if self.piece_count.is_some() {
            out.push("piece_count");
        }
        if self.image_url.is_some() {
            out.push("image_url");
        }
        if self.is_retired.is_some() {
            out.push("is_retired");
        }
        if self.year_retired.is_some() {
            out.push("year_retired");
        }
        out
    }
}

/// Whether an image is the packaging shot or a product render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    BoxArt,
    Render,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaleCondition {
    NewSealed,
    OpenBox,
    UsedComplete,
    UsedIncomplete,
}

impl SaleCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaleCondition::NewSealed => "new_sealed",
            SaleCondition::OpenBox => "open_box",
            SaleCondition::UsedComplete => "used_complete",
            SaleCondition::UsedIncomplete => "used_incomplete",
        }
    }
}

impl FromStr for SaleCondition {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "new_sealed" => Ok(SaleCondition::NewSealed),
            "open_box" => Ok(SaleCondition::OpenBox),
            "used_complete" => Ok(SaleCondition::UsedComplete),
            "used_incomplete" => Ok(SaleCondition::UsedIncomplete),
            other => Err(anyhow::anyhow!("unknown sale condition: {other}")),
        }
    }
}

/// One matched completed-listing observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleRecord {
    pub item_id: i64,
    pub sale_price: f64,
    pub sale_date: DateTime<Utc>,
    pub condition: SaleCondition,
    pub listing_title: String,
}
