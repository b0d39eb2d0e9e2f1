//! Bulk reconciliation pipeline: resolves clients, validates barcodes
//! against the reference catalog, classifies rows as insert or update by
//! business key and persists them in bounded sub-batches.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use sellout_core::{
    normalize_key_fragment, BusinessKey, CatalogHit, Client, ClientPair, DeleteSummary, Incident,
    IncidentKind, IngestReport, NewClient, NewSale, RowRecord, SaleUpdate, SalesFilter, SalesKey,
};
use sellout_store::{
    chunks, max_rows_per_statement, ChunkTx, FetchScope, SalesStore, StoreError,
    DELETE_PARAMS_PER_ROW, DELETE_ROWS_PER_STATEMENT, PARAM_CEILING,
};

pub const CRATE_NAME: &str = "sellout-engine";

/// Knobs for one ingestion run. Read from the environment in the binary,
/// passed explicitly everywhere else.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Input rows per reconciliation chunk.
    pub chunk_size: usize,
    /// Pending writes per persistence sub-batch (checkpoint interval).
    pub batch_size: usize,
    /// Cap on keys processed by one key-based delete invocation.
    pub delete_target_max: usize,
    /// Rows removed per filtered-delete round.
    pub delete_round_size: u32,
    pub param_ceiling: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10_000,
            batch_size: 1_000,
            delete_target_max: 5_000,
            delete_round_size: 5_000,
            param_ceiling: PARAM_CEILING,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            chunk_size: env_usize("SELLOUT_CHUNK_SIZE", defaults.chunk_size),
            batch_size: env_usize("SELLOUT_BATCH_SIZE", defaults.batch_size),
            delete_target_max: env_usize("SELLOUT_DELETE_MAX", defaults.delete_target_max),
            delete_round_size: env_usize("SELLOUT_DELETE_ROUND", defaults.delete_round_size as usize)
                as u32,
            param_ceiling: env_usize("SELLOUT_PARAM_CEILING", defaults.param_ceiling),
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store round-trip failed: {0}")]
    Store(#[from] StoreError),
}

/// Run-scoped lookup state. Built fresh per run and discarded with it so a
/// later run never observes a stale identity.
#[derive(Debug, Default)]
pub struct RunContext {
    clients: HashMap<(String, String), Client>,
    clients_by_code: HashMap<String, Client>,
    conflicted_pairs: HashSet<(String, String)>,
}

impl RunContext {
    fn admit(&mut self, client: Client) {
        let key = (
            normalize_key_fragment(&client.code),
            normalize_key_fragment(&client.name),
        );
        self.clients_by_code
            .entry(key.0.clone())
            .or_insert_with(|| client.clone());
        self.clients.insert(key, client);
    }
}

enum RowClient<'a> {
    Resolved(&'a Client),
    Conflicted,
    Missing,
}

fn client_for_row<'a>(ctx: &'a RunContext, row: &RowRecord) -> RowClient<'a> {
    let code = row.client_code.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let name = row.client_name.as_deref().map(str::trim).filter(|s| !s.is_empty());

    if let (Some(code), Some(name)) = (code, name) {
        let key = (normalize_key_fragment(code), normalize_key_fragment(name));
        if let Some(client) = ctx.clients.get(&key) {
            return RowClient::Resolved(client);
        }
        if ctx.conflicted_pairs.contains(&key) {
            return RowClient::Conflicted;
        }
    }
    if let Some(code) = code {
        if let Some(client) = ctx.clients_by_code.get(&normalize_key_fragment(code)) {
            return RowClient::Resolved(client);
        }
    }
    RowClient::Missing
}

#[derive(Debug, Default)]
struct ChunkOutcome {
    inserted: usize,
    updated: usize,
    omitted: usize,
    incidents: Vec<Incident>,
    touched: BTreeSet<String>,
}

enum PendingOp {
    Insert,
    Update(i64),
}

struct Pending {
    source_row: u32,
    op: PendingOp,
    sale: NewSale,
}

/// Drives the row stream through fixed-size chunks and aggregates the
/// ingestion report. One chunk plus its lookup maps is the whole working
/// set; everything else has been flushed by the time the next chunk starts.
pub struct IngestPipeline {
    store: Arc<dyn SalesStore>,
    config: EngineConfig,
}

impl IngestPipeline {
    pub fn new(store: Arc<dyn SalesStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    /// Run one ingestion to completion. Row-level problems become incidents;
    /// a failed store round-trip ends the run with `failed = true` while
    /// earlier committed chunks stay committed (re-running is idempotent).
    pub async fn run<I>(&self, rows: I) -> IngestReport
    where
        I: IntoIterator<Item = RowRecord>,
    {
        let run_id = Uuid::new_v4();
        let mut report = IngestReport::new(run_id, Utc::now());
        let mut ctx = RunContext::default();
        let mut buffer: Vec<RowRecord> = Vec::with_capacity(self.config.chunk_size);
        let mut consecutive_empty = 0usize;

        info!(run_id = %run_id, chunk_size = self.config.chunk_size, "ingestion run started");

        'reading: for row in rows {
            report.rows_read += 1;
            if row.is_structurally_empty() {
                consecutive_empty += 1;
                if consecutive_empty >= 2 {
                    // end-of-data marker, not an error
                    break 'reading;
                }
                continue;
            }
            consecutive_empty = 0;
            report.rows_with_client += 1;
            buffer.push(row);

            if buffer.len() >= self.config.chunk_size {
                if !self.drain_chunk(&mut ctx, &mut buffer, &mut report).await {
                    return self.finish(report);
                }
            }
        }

        if !buffer.is_empty() {
            self.drain_chunk(&mut ctx, &mut buffer, &mut report).await;
        }
        self.finish(report)
    }

    fn finish(&self, mut report: IngestReport) -> IngestReport {
        report.finished_at = Utc::now();
        info!(
            run_id = %report.run_id,
            rows_read = report.rows_read,
            inserted = report.inserted,
            updated = report.updated,
            omitted = report.omitted,
            failed = report.failed,
            "ingestion run finished"
        );
        report
    }

    /// Reconcile the buffered chunk and fold its outcome into the report.
    /// Returns false when the run must stop (chunk-fatal store error).
    async fn drain_chunk(
        &self,
        ctx: &mut RunContext,
        buffer: &mut Vec<RowRecord>,
        report: &mut IngestReport,
    ) -> bool {
        let chunk = std::mem::take(buffer);
        match self.reconcile_chunk(ctx, &chunk).await {
            Ok(outcome) => {
                report.inserted += outcome.inserted;
                report.updated += outcome.updated;
                report.omitted += outcome.omitted;
                report.incidents.extend(outcome.incidents);
                report.absorb_barcodes(outcome.touched);
                true
            }
            Err(err) => {
                warn!(run_id = %report.run_id, error = %err, "chunk failed, stopping run");
                report.failed = true;
                report.failure = Some(err.to_string());
                false
            }
        }
    }

    /// The seven reconciliation steps for one chunk, in order: resolve
    /// clients, validate barcodes, build keys, snapshot existing records,
    /// classify, persist in sub-batches, aggregate.
    async fn reconcile_chunk(
        &self,
        ctx: &mut RunContext,
        chunk: &[RowRecord],
    ) -> Result<ChunkOutcome, EngineError> {
        let mut outcome = ChunkOutcome::default();

        self.resolve_clients(ctx, chunk).await?;
        let catalog = self.validate_barcodes(chunk).await?;

        // Build the pending write for every row that survives validation.
        let mut validated: Vec<(u32, NewSale)> = Vec::with_capacity(chunk.len());
        let mut scope_years = BTreeSet::new();
        let mut scope_months = BTreeSet::new();
        let mut scope_barcodes = BTreeSet::new();
        let mut scope_pdvs = BTreeSet::new();
        let mut scope_clients = BTreeSet::new();

        for row in chunk {
            let client = match client_for_row(ctx, row) {
                RowClient::Resolved(client) => client,
                RowClient::Conflicted => {
                    outcome.omitted += 1;
                    outcome.incidents.push(Incident::new(
                        row.source_row,
                        row.client_code.clone().unwrap_or_default(),
                        IncidentKind::StoreConflict,
                        "client creation conflicted with a concurrent run",
                    ));
                    continue;
                }
                RowClient::Missing => {
                    outcome.omitted += 1;
                    outcome.incidents.push(Incident::new(
                        row.source_row,
                        row.client_code.clone().unwrap_or_default(),
                        IncidentKind::UnresolvedClient,
                        "client unresolved",
                    ));
                    continue;
                }
            };

            let barcode = row
                .barcode
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or_default();
            let hit: &CatalogHit = match catalog.get(barcode) {
                Some(hit) => hit,
                None => {
                    outcome.omitted += 1;
                    outcome.incidents.push(Incident::new(
                        row.source_row,
                        barcode,
                        IncidentKind::CatalogMiss,
                        "not found in catalog",
                    ));
                    continue;
                }
            };
            let barcode = barcode.to_string();

            let pdv_code = row
                .pdv_code
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string);

            scope_years.insert(row.year);
            scope_months.insert(row.month);
            scope_barcodes.insert(barcode.clone());
            if let Some(pdv) = &pdv_code {
                scope_pdvs.insert(pdv.clone());
            }
            scope_clients.insert(client.id);

            let key = BusinessKey {
                client_id: client.id,
                year: row.year,
                month: row.month,
                day: row.day,
                barcode,
                pdv_code,
            };
            let sale = NewSale {
                key,
                product_id: Some(hit.product_id),
                brand: row.brand.clone(),
                product_name: row.description.clone(),
                description: row.description.clone(),
                catalog_code: hit.catalog_code.clone(),
                pdv_name: row.pdv_name.clone(),
                city: row.city.clone(),
                units_sold: row.units_sold.unwrap_or(0.0),
                value_sold: row.value_sold.unwrap_or(0.0),
                stock_units: row.stock_units.unwrap_or(0.0),
                stock_value: 0.0,
            };
            validated.push((row.source_row, sale));
        }

        // One snapshot per chunk; later rows in the run do not see writes
        // from this chunk until the next chunk fetches again.
        let scope = FetchScope {
            years: scope_years.into_iter().collect(),
            months: scope_months.into_iter().collect(),
            barcodes: scope_barcodes.into_iter().collect(),
            pdv_codes: scope_pdvs.into_iter().collect(),
            client_ids: scope_clients.into_iter().collect(),
        };
        let existing: HashMap<BusinessKey, i64> = self
            .store
            .fetch_existing(&scope)
            .await?
            .into_iter()
            .map(|record| (record.business_key(), record.id))
            .collect();

        // Classify. A duplicate key later in the chunk replaces the pending
        // write in place: one write per key per chunk, last row wins.
        let mut pending: Vec<Pending> = Vec::with_capacity(validated.len());
        let mut slot_by_key: HashMap<BusinessKey, usize> = HashMap::with_capacity(validated.len());
        for (source_row, sale) in validated {
            outcome.touched.insert(sale.key.barcode.clone());
            if let Some(&slot) = slot_by_key.get(&sale.key) {
                pending[slot].sale = sale;
                pending[slot].source_row = source_row;
                outcome.updated += 1;
            } else if let Some(&id) = existing.get(&sale.key) {
                slot_by_key.insert(sale.key.clone(), pending.len());
                pending.push(Pending {
                    source_row,
                    op: PendingOp::Update(id),
                    sale,
                });
                outcome.updated += 1;
            } else {
                slot_by_key.insert(sale.key.clone(), pending.len());
                pending.push(Pending {
                    source_row,
                    op: PendingOp::Insert,
                    sale,
                });
                outcome.inserted += 1;
            }
        }

        let mut inserts: Vec<(u32, NewSale)> = Vec::new();
        let mut updates: Vec<SaleUpdate> = Vec::new();
        for item in pending {
            match item.op {
                PendingOp::Insert => inserts.push((item.source_row, item.sale)),
                PendingOp::Update(id) => updates.push(SaleUpdate {
                    id,
                    sale: item.sale,
                }),
            }
        }

        // The whole chunk persists inside one store transaction: every
        // sub-batch stages into it and nothing is visible until the commit
        // below. A persistence failure rolls the chunk back entirely.
        let mut tx = self.store.begin_chunk().await?;
        if let Err(err) = self
            .persist(&mut *tx, &inserts, &updates, &mut outcome)
            .await
        {
            if let Err(rb) = tx.rollback().await {
                warn!(error = %rb, "chunk rollback failed");
            }
            return Err(err);
        }
        tx.commit().await?;

        info!(
            rows = chunk.len(),
            inserted = outcome.inserted,
            updated = outcome.updated,
            omitted = outcome.omitted,
            "chunk reconciled"
        );
        Ok(outcome)
    }

    /// Stage inserts then updates into the chunk transaction in sub-batches
    /// of `batch_size`, so no single statement outgrows the parameter
    /// ceiling. An insert sub-batch conflict retries row by row and turns
    /// only the losing rows into incidents.
    async fn persist(
        &self,
        tx: &mut dyn ChunkTx,
        inserts: &[(u32, NewSale)],
        updates: &[SaleUpdate],
        outcome: &mut ChunkOutcome,
    ) -> Result<(), EngineError> {
        for part in chunks(inserts, self.config.batch_size) {
            let batch: Vec<NewSale> = part.iter().map(|(_, s)| s.clone()).collect();
            match tx.insert_sales(&batch).await {
                Ok(_) => {}
                Err(StoreError::Conflict(_)) => {
                    for (source_row, sale) in part {
                        match tx.insert_sales(std::slice::from_ref(sale)).await {
                            Ok(_) => {}
                            Err(StoreError::Conflict(detail)) => {
                                outcome.inserted -= 1;
                                outcome.omitted += 1;
                                outcome.incidents.push(Incident::new(
                                    *source_row,
                                    sale.key.barcode.clone(),
                                    IncidentKind::StoreConflict,
                                    detail,
                                ));
                            }
                            Err(err) => return Err(err.into()),
                        }
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
        for part in chunks(updates, self.config.batch_size) {
            tx.update_sales(part).await?;
        }
        Ok(())
    }

    /// Resolve-or-create every distinct client pair in the chunk, memoized
    /// for the run. A uniqueness conflict on create marks the pair as
    /// conflicted (no retry); the rows referencing it become incidents.
    async fn resolve_clients(
        &self,
        ctx: &mut RunContext,
        chunk: &[RowRecord],
    ) -> Result<(), EngineError> {
        let mut new_pairs: Vec<ClientPair> = Vec::new();
        let mut seen: HashSet<(String, String)> = HashSet::new();
        for row in chunk {
            let (Some(code), Some(name)) = (&row.client_code, &row.client_name) else {
                continue;
            };
            let Some(pair) = ClientPair::from_raw(code, name) else {
                continue;
            };
            let key = pair.cache_key();
            if !ctx.clients.contains_key(&key)
                && !ctx.conflicted_pairs.contains(&key)
                && seen.insert(key)
            {
                new_pairs.push(pair);
            }
        }

        if !new_pairs.is_empty() {
            for client in self.store.find_clients(&new_pairs).await? {
                ctx.admit(client);
            }
            for pair in &new_pairs {
                if ctx.clients.contains_key(&pair.cache_key()) {
                    continue;
                }
                let create = NewClient {
                    code: pair.code_norm.clone(),
                    name: pair.display_name.clone(),
                    city: None,
                };
                match self.store.insert_client(&create).await {
                    Ok(client) => {
                        info!(code = %client.code, id = client.id, "client created");
                        ctx.admit(client);
                    }
                    Err(StoreError::Conflict(detail)) => {
                        warn!(code = %pair.code_norm, detail = %detail, "client pair conflicted");
                        ctx.conflicted_pairs.insert(pair.cache_key());
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }

        // Rows carrying only a code fall back to any client with that code.
        let mut missing_codes: BTreeSet<String> = BTreeSet::new();
        for row in chunk {
            if let Some(code) = row.client_code.as_deref().map(str::trim).filter(|s| !s.is_empty())
            {
                let code_norm = normalize_key_fragment(code);
                if !ctx.clients_by_code.contains_key(&code_norm) {
                    missing_codes.insert(code_norm);
                }
            }
        }
        if !missing_codes.is_empty() {
            let codes: Vec<String> = missing_codes.into_iter().collect();
            for client in self.store.find_clients_by_codes(&codes).await? {
                ctx.admit(client);
            }
        }
        Ok(())
    }

    /// One batched catalog lookup for the chunk's distinct barcodes.
    async fn validate_barcodes(
        &self,
        chunk: &[RowRecord],
    ) -> Result<HashMap<String, CatalogHit>, EngineError> {
        let barcodes: BTreeSet<String> = chunk
            .iter()
            .filter_map(|row| row.barcode.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if barcodes.is_empty() {
            return Ok(HashMap::new());
        }
        let barcodes: Vec<String> = barcodes.into_iter().collect();
        Ok(self.store.lookup_catalog(&barcodes).await?)
    }
}

/// Delete up to `delete_target_max` of the selected keys inside one store
/// transaction, in sub-batches sized for the parameter ceiling.
pub async fn delete_by_keys(
    store: &dyn SalesStore,
    config: &EngineConfig,
    keys: &[SalesKey],
) -> Result<DeleteSummary, EngineError> {
    if keys.is_empty() {
        return Ok(DeleteSummary {
            requested: Some(0),
            processed_max: Some(0),
            deleted: 0,
            message: "no records selected".into(),
        });
    }
    let window = keys.len().min(config.delete_target_max);
    let rows_per_statement = DELETE_ROWS_PER_STATEMENT
        .min(max_rows_per_statement(DELETE_PARAMS_PER_ROW, config.param_ceiling));
    let deleted = store.delete_by_keys(&keys[..window], rows_per_statement).await?;
    info!(requested = keys.len(), window, deleted, "selection delete finished");
    Ok(DeleteSummary {
        requested: Some(keys.len()),
        processed_max: Some(window),
        deleted,
        message: format!(
            "selection delete ran in internal sub-batches of at most {rows_per_statement} keys (cap {window})"
        ),
    })
}

/// Delete everything matching the filter in capped rounds, so no single
/// statement holds a lock for an unpredictable duration.
pub async fn delete_by_filter(
    store: &dyn SalesStore,
    config: &EngineConfig,
    filter: &SalesFilter,
    max_total: Option<u64>,
) -> Result<DeleteSummary, EngineError> {
    let round = config.delete_round_size.max(1);
    let mut total = 0u64;
    loop {
        let cap = match max_total {
            Some(max) => {
                let remaining = max.saturating_sub(total);
                if remaining == 0 {
                    break;
                }
                round.min(remaining.min(u64::from(u32::MAX)) as u32)
            }
            None => round,
        };
        let removed = store.delete_by_filter(filter, cap).await?;
        total += removed;
        if removed < u64::from(cap) {
            break;
        }
    }
    info!(deleted = total, "filter delete finished");
    Ok(DeleteSummary {
        requested: None,
        processed_max: max_total.map(|m| m as usize),
        deleted: total,
        message: format!("filter delete completed in rounds of {round}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sellout_store::MemStore;

    fn mk_row(source_row: u32, code: &str, name: &str, barcode: &str, units: f64) -> RowRecord {
        RowRecord {
            source_row,
            client_code: Some(code.to_string()),
            client_name: Some(name.to_string()),
            year: 2025,
            month: 3,
            day: 14,
            barcode: Some(barcode.to_string()),
            description: Some("Lip liner".into()),
            brand: Some("ESSENCE".into()),
            pdv_code: Some("PDV-1".into()),
            pdv_name: Some("Mall del Sol".into()),
            city: Some("Guayaquil".into()),
            units_sold: Some(units),
            value_sold: Some(units * 2.5),
            stock_units: Some(1.0),
        }
    }

    fn empty_row(source_row: u32) -> RowRecord {
        RowRecord {
            source_row,
            client_code: None,
            client_name: None,
            year: 0,
            month: 0,
            day: 0,
            barcode: None,
            description: None,
            brand: None,
            pdv_code: None,
            pdv_name: None,
            city: None,
            units_sold: None,
            value_sold: None,
            stock_units: None,
        }
    }

    async fn seeded_store(barcodes: &[&str]) -> Arc<MemStore> {
        let store = Arc::new(MemStore::new());
        for barcode in barcodes {
            store.seed_catalog(barcode, &format!("CAT-{barcode}")).await;
        }
        store
    }

    #[tokio::test]
    async fn first_run_inserts_second_run_updates_same_state() {
        let store = seeded_store(&["786000", "786001"]).await;
        let rows = vec![
            mk_row(5, "C01", "Acme", "786000", 3.0),
            mk_row(6, "C01", "Acme", "786001", 4.0),
        ];

        let pipeline = IngestPipeline::new(store.clone(), EngineConfig::default());
        let first = pipeline.run(rows.clone()).await;
        assert_eq!((first.inserted, first.updated, first.omitted), (2, 0, 0));
        assert!(!first.failed);
        let after_first = store.sales_snapshot().await;

        let second = pipeline.run(rows).await;
        assert_eq!((second.inserted, second.updated, second.omitted), (0, 2, 0));
        assert!(second.incidents.is_empty());

        let after_second = store.sales_snapshot().await;
        assert_eq!(after_first.len(), after_second.len());
        let keys: HashSet<BusinessKey> =
            after_second.iter().map(|s| s.business_key()).collect();
        assert_eq!(keys.len(), after_second.len(), "business keys stay unique");
        assert_eq!(second.touched_barcodes, vec!["786000", "786001"]);
    }

    #[tokio::test]
    async fn same_code_different_names_become_distinct_clients() {
        let store = seeded_store(&["786000"]).await;
        let mut row_b = mk_row(2, "C01", "Acme Norte", "786000", 2.0);
        row_b.pdv_code = Some("PDV-2".into());
        let rows = vec![mk_row(1, "C01", "Acme", "786000", 1.0), row_b];

        let pipeline = IngestPipeline::new(store.clone(), EngineConfig::default());
        let report = pipeline.run(rows).await;
        assert_eq!(report.inserted, 2);

        let clients = store.clients_snapshot().await;
        assert_eq!(clients.len(), 2);
        assert!(clients.iter().all(|c| c.code == "C01"));
        let names: HashSet<&str> = clients.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, HashSet::from(["Acme", "Acme Norte"]));
    }

    #[tokio::test]
    async fn duplicate_key_in_chunk_last_row_wins() {
        let store = seeded_store(&["786000"]).await;
        let rows = vec![
            mk_row(5, "C01", "Acme", "786000", 10.0),
            mk_row(9, "C01", "Acme", "786000", 99.0),
        ];

        let pipeline = IngestPipeline::new(store.clone(), EngineConfig::default());
        let report = pipeline.run(rows).await;
        assert_eq!((report.inserted, report.updated), (1, 1));

        let sales = store.sales_snapshot().await;
        assert_eq!(sales.len(), 1, "one write per key per chunk");
        assert_eq!(sales[0].units_sold, 99.0);
    }

    #[tokio::test]
    async fn catalog_miss_yields_incident_and_no_record() {
        let store = seeded_store(&["786000"]).await;
        let rows = vec![
            mk_row(1, "C01", "Acme", "786000", 1.0),
            mk_row(2, "C01", "Acme", "999999", 1.0),
        ];

        let pipeline = IngestPipeline::new(store.clone(), EngineConfig::default());
        let report = pipeline.run(rows).await;
        assert_eq!((report.inserted, report.omitted), (1, 1));
        assert_eq!(report.incidents.len(), 1);
        assert_eq!(report.incidents[0].kind, IncidentKind::CatalogMiss);
        assert_eq!(report.incidents[0].reason, "not found in catalog");
        assert_eq!(report.incidents[0].row, 2);
        assert_eq!(store.sales_snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn missing_client_data_yields_unresolved_incident() {
        let store = seeded_store(&["786000"]).await;
        let mut row = mk_row(3, "", "Acme", "786000", 1.0);
        row.client_code = None;

        let pipeline = IngestPipeline::new(store.clone(), EngineConfig::default());
        let report = pipeline.run(vec![row]).await;
        assert_eq!(report.omitted, 1);
        assert_eq!(report.incidents[0].kind, IncidentKind::UnresolvedClient);
        assert!(store.sales_snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn two_consecutive_empty_rows_terminate_reading() {
        let store = seeded_store(&["786000", "786001"]).await;
        let rows = vec![
            mk_row(1, "C01", "Acme", "786000", 1.0),
            empty_row(2),
            empty_row(3),
            mk_row(4, "C01", "Acme", "786001", 1.0),
        ];

        let pipeline = IngestPipeline::new(store.clone(), EngineConfig::default());
        let report = pipeline.run(rows).await;
        assert_eq!(report.rows_read, 3);
        assert_eq!(report.rows_with_client, 1);
        assert_eq!(report.inserted, 1);
    }

    #[tokio::test]
    async fn chunk_boundaries_do_not_change_final_state() {
        let rows: Vec<RowRecord> = (0..25)
            .map(|i| {
                let mut row = mk_row(i + 1, "C01", "Acme", &format!("bc-{i}"), f64::from(i));
                row.pdv_code = Some(format!("PDV-{}", i % 3));
                row
            })
            .collect();
        let barcodes: Vec<String> = (0..25).map(|i| format!("bc-{i}")).collect();
        let barcode_refs: Vec<&str> = barcodes.iter().map(String::as_str).collect();

        let chunked_store = seeded_store(&barcode_refs).await;
        let chunked = IngestPipeline::new(
            chunked_store.clone(),
            EngineConfig {
                chunk_size: 10,
                ..EngineConfig::default()
            },
        );
        let chunked_report = chunked.run(rows.clone()).await;

        let single_store = seeded_store(&barcode_refs).await;
        let single = IngestPipeline::new(single_store.clone(), EngineConfig::default());
        let single_report = single.run(rows).await;

        assert_eq!(chunked_report.inserted, single_report.inserted);

        let project = |records: Vec<sellout_core::SalesRecord>| -> HashSet<(BusinessKey, String)> {
            records
                .into_iter()
                .map(|r| (r.business_key(), format!("{}", r.units_sold)))
                .collect()
        };
        assert_eq!(
            project(chunked_store.sales_snapshot().await),
            project(single_store.sales_snapshot().await)
        );
    }

    #[tokio::test]
    async fn failed_chunk_rolls_back_entirely() {
        let store = seeded_store(&["786000", "786001"]).await;
        let pipeline = IngestPipeline::new(store.clone(), EngineConfig::default());

        let first = pipeline
            .run(vec![mk_row(1, "C01", "Acme", "786000", 1.0)])
            .await;
        assert_eq!(first.inserted, 1);

        // The chunk below classifies one insert and one update; the update
        // fails, so neither write may survive.
        store.fail_next_update().await;
        let report = pipeline
            .run(vec![
                mk_row(1, "C01", "Acme", "786001", 2.0),
                mk_row(2, "C01", "Acme", "786000", 9.0),
            ])
            .await;
        assert!(report.failed);
        assert!(report.failure.is_some());
        assert_eq!((report.inserted, report.updated), (0, 0));

        let sales = store.sales_snapshot().await;
        assert_eq!(sales.len(), 1, "staged insert must not survive the rollback");
        assert_eq!(sales[0].barcode, "786000");
        assert_eq!(sales[0].units_sold, 1.0);
    }

    #[tokio::test]
    async fn key_delete_caps_window_and_partitions_statements() {
        let store = seeded_store(&[]).await;
        let keys: Vec<SalesKey> = (0..6_000)
            .map(|i| SalesKey {
                year: 2025,
                month: 3,
                barcode: format!("bc-{i}"),
                pdv_code: None,
            })
            .collect();

        let summary = delete_by_keys(store.as_ref(), &EngineConfig::default(), &keys)
            .await
            .expect("delete");
        assert_eq!(summary.requested, Some(6_000));
        assert_eq!(summary.processed_max, Some(5_000));

        let statements = store.delete_statement_rows().await;
        assert_eq!(statements.iter().sum::<usize>(), 5_000);
        assert!(statements.iter().all(|&n| n <= 500));
        assert!(statements.len() >= 10);
    }

    #[tokio::test]
    async fn filter_delete_drains_in_rounds() {
        let store = seeded_store(&["786000"]).await;
        let rows: Vec<RowRecord> = (0..12)
            .map(|i| {
                let mut row = mk_row(i + 1, "C01", "Acme", "786000", 1.0);
                row.day = i as i32 + 1;
                row
            })
            .collect();
        let pipeline = IngestPipeline::new(store.clone(), EngineConfig::default());
        let report = pipeline.run(rows).await;
        assert_eq!(report.inserted, 12);

        let config = EngineConfig {
            delete_round_size: 5,
            ..EngineConfig::default()
        };
        let filter = SalesFilter {
            year: Some(2025),
            brand: Some("ESSENCE".into()),
            ..Default::default()
        };
        let summary = delete_by_filter(store.as_ref(), &config, &filter, None)
            .await
            .expect("delete");
        assert_eq!(summary.deleted, 12);
        assert!(store.sales_snapshot().await.is_empty());
    }
}
