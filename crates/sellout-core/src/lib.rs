//! Core domain model for the sell-out reconciliation engine.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

pub const CRATE_NAME: &str = "sellout-core";

/// Normalize a key fragment: trim, collapse internal whitespace, strip
/// diacritics (NFD, drop combining marks) and uppercase.
///
/// Client codes and names are compared under this normalization; sales
/// barcodes and PDV codes only need the trim.
pub fn normalize_key_fragment(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_uppercase()
}

/// Trim a raw cell value, mapping blank to `None`.
pub fn clean(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// One normalized input row, as handed over by the upstream parser.
///
/// Ephemeral: consumed once by the reconciler and discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowRecord {
    /// 1-based row number in the source file, for incident reporting.
    pub source_row: u32,
    pub client_code: Option<String>,
    pub client_name: Option<String>,
    pub year: i32,
    pub month: i32,
    pub day: i32,
    pub barcode: Option<String>,
    pub description: Option<String>,
    pub brand: Option<String>,
    pub pdv_code: Option<String>,
    pub pdv_name: Option<String>,
    pub city: Option<String>,
    pub units_sold: Option<f64>,
    pub value_sold: Option<f64>,
    pub stock_units: Option<f64>,
}

impl RowRecord {
    /// A row with neither client code nor client name. Two of these in a
    /// sequence terminate reading early.
    pub fn is_structurally_empty(&self) -> bool {
        blank(&self.client_code) && blank(&self.client_name)
    }
}

fn blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |s| s.trim().is_empty())
}

/// A `(code, name)` client pair, carried both normalized (for matching)
/// and as the trimmed original name (what gets persisted on create).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientPair {
    pub code_norm: String,
    pub name_norm: String,
    pub display_name: String,
}

impl ClientPair {
    /// Build from raw cell values. Returns `None` when either side is blank.
    pub fn from_raw(code: &str, name: &str) -> Option<Self> {
        let code_trim = code.trim();
        let name_trim = name.trim();
        if code_trim.is_empty() || name_trim.is_empty() {
            return None;
        }
        Some(Self {
            code_norm: normalize_key_fragment(code_trim),
            name_norm: normalize_key_fragment(name_trim),
            display_name: name_trim.to_string(),
        })
    }

    /// Cache key within one run: the normalized `(code, name)` tuple.
    pub fn cache_key(&self) -> (String, String) {
        (self.code_norm.clone(), self.name_norm.clone())
    }
}

/// Persistent reference entity sales records point back to.
///
/// The normalized `(code, name)` pair is unique; the same code with a
/// different legal name is a distinct client on purpose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub city: Option<String>,
    pub supplier_code: Option<String>,
}

/// Fields persisted when the resolver creates a missing client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewClient {
    /// Normalized (upper-cased, trimmed) client code.
    pub code: String,
    /// Trimmed original display name, not the upper-cased form.
    pub name: String,
    pub city: Option<String>,
}

/// One match from the external reference catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogHit {
    pub product_id: i64,
    pub catalog_code: String,
}

/// The tuple that must be unique per persisted sales record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusinessKey {
    pub client_id: i64,
    pub year: i32,
    pub month: i32,
    pub day: i32,
    pub barcode: String,
    /// Blank PDV codes are normalized to `None` before key construction.
    pub pdv_code: Option<String>,
}

/// Delete key as selected in the maintenance UI: 4 bind parameters per row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SalesKey {
    pub year: i32,
    pub month: i32,
    pub barcode: String,
    pub pdv_code: Option<String>,
}

/// Filter predicate for filtered bulk deletes. All fields optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SalesFilter {
    pub year: Option<i32>,
    pub month: Option<i32>,
    pub brand: Option<String>,
    pub pdv_code: Option<String>,
}

/// Persisted sales record as fetched from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalesRecord {
    pub id: i64,
    pub client_id: i64,
    pub product_id: Option<i64>,
    pub year: i32,
    pub month: i32,
    pub day: i32,
    pub brand: Option<String>,
    pub product_name: Option<String>,
    pub description: Option<String>,
    pub catalog_code: Option<String>,
    pub barcode: String,
    pub pdv_code: Option<String>,
    pub pdv_name: Option<String>,
    pub city: Option<String>,
    pub units_sold: f64,
    pub value_sold: f64,
    pub stock_units: f64,
    pub stock_value: f64,
}

impl SalesRecord {
    pub fn business_key(&self) -> BusinessKey {
        BusinessKey {
            client_id: self.client_id,
            year: self.year,
            month: self.month,
            day: self.day,
            barcode: self.barcode.trim().to_string(),
            pdv_code: self
                .pdv_code
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        }
    }
}

/// Full column set written on insert or overwritten on update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSale {
    pub key: BusinessKey,
    pub product_id: Option<i64>,
    pub brand: Option<String>,
    pub product_name: Option<String>,
    pub description: Option<String>,
    pub catalog_code: String,
    pub pdv_name: Option<String>,
    pub city: Option<String>,
    pub units_sold: f64,
    pub value_sold: f64,
    pub stock_units: f64,
    pub stock_value: f64,
}

/// An overwrite of an existing record's measure and descriptive fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleUpdate {
    pub id: i64,
    pub sale: NewSale,
}

/// Why a row was omitted or failed. Closed so callers can branch on the
/// kind instead of inspecting reason strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    UnresolvedClient,
    CatalogMiss,
    StoreConflict,
    StoreUnavailable,
}

impl std::fmt::Display for IncidentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IncidentKind::UnresolvedClient => write!(f, "unresolved_client"),
            IncidentKind::CatalogMiss => write!(f, "catalog_miss"),
            IncidentKind::StoreConflict => write!(f, "store_conflict"),
            IncidentKind::StoreUnavailable => write!(f, "store_unavailable"),
        }
    }
}

/// Structured record of one omitted or failed row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub row: u32,
    /// The offending code (barcode or client code), when there is one.
    pub code: String,
    pub kind: IncidentKind,
    pub reason: String,
}

impl Incident {
    pub fn new(row: u32, code: impl Into<String>, kind: IncidentKind, reason: impl Into<String>) -> Self {
        Self {
            row,
            code: code.into(),
            kind,
            reason: reason.into(),
        }
    }
}

/// Aggregated result of one ingestion run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub rows_read: usize,
    /// Rows carrying client data, before any per-row validation.
    pub rows_with_client: usize,
    pub inserted: usize,
    pub updated: usize,
    pub omitted: usize,
    pub incidents: Vec<Incident>,
    /// Sorted distinct barcodes touched by this run.
    pub touched_barcodes: Vec<String>,
    pub failed: bool,
    /// Set when a chunk-fatal store error ended the run early.
    pub failure: Option<String>,
}

impl IngestReport {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            rows_read: 0,
            rows_with_client: 0,
            inserted: 0,
            updated: 0,
            omitted: 0,
            incidents: Vec::new(),
            touched_barcodes: Vec::new(),
            failed: false,
            failure: None,
        }
    }

    pub fn absorb_barcodes(&mut self, barcodes: BTreeSet<String>) {
        let mut merged: BTreeSet<String> = self.touched_barcodes.drain(..).collect();
        merged.extend(barcodes);
        self.touched_barcodes = merged.into_iter().collect();
    }
}

/// Result of one bulk delete invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteSummary {
    /// Keys requested, for key-based deletes.
    pub requested: Option<usize>,
    /// Upper bound actually processed this invocation.
    pub processed_max: Option<usize>,
    pub deleted: u64,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_strips_accents_and_collapses_whitespace() {
        assert_eq!(normalize_key_fragment("  Fybéca   del   Nórte "), "FYBECA DEL NORTE");
        assert_eq!(normalize_key_fragment("acme"), "ACME");
        assert_eq!(normalize_key_fragment(""), "");
    }

    #[test]
    fn client_pair_requires_both_sides() {
        assert!(ClientPair::from_raw("C01", "  ").is_none());
        assert!(ClientPair::from_raw("", "Acme").is_none());

        let pair = ClientPair::from_raw(" c01 ", "  Almacenes Tía  ").expect("pair");
        assert_eq!(pair.code_norm, "C01");
        assert_eq!(pair.name_norm, "ALMACENES TIA");
        assert_eq!(pair.display_name, "Almacenes Tía");
    }

    #[test]
    fn business_key_normalizes_blank_pdv() {
        let record = SalesRecord {
            id: 1,
            client_id: 7,
            product_id: None,
            year: 2025,
            month: 3,
            day: 14,
            brand: None,
            product_name: None,
            description: None,
            catalog_code: None,
            barcode: " 786000123 ".into(),
            pdv_code: Some("   ".into()),
            pdv_name: None,
            city: None,
            units_sold: 0.0,
            value_sold: 0.0,
            stock_units: 0.0,
            stock_value: 0.0,
        };
        let key = record.business_key();
        assert_eq!(key.barcode, "786000123");
        assert_eq!(key.pdv_code, None);
    }

    #[test]
    fn structurally_empty_rows_detected() {
        let mut row = RowRecord {
            source_row: 5,
            client_code: Some("  ".into()),
            client_name: None,
            year: 2025,
            month: 1,
            day: 2,
            barcode: None,
            description: None,
            brand: None,
            pdv_code: None,
            pdv_name: None,
            city: None,
            units_sold: None,
            value_sold: None,
            stock_units: None,
        };
        assert!(row.is_structurally_empty());
        row.client_code = Some("C01".into());
        assert!(!row.is_structurally_empty());
    }
}
