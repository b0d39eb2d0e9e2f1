//! Persistence boundary for the sell-out reconciliation engine.
//!
//! Exposes the [`SalesStore`] trait consumed by the engine, the bind-parameter
//! partitioning helpers every bulk operation goes through, a Postgres
//! implementation ([`PgStore`]) and an in-memory implementation ([`MemStore`])
//! used by tests and offline runs.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Acquire, FromRow, Postgres, QueryBuilder, Transaction};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use sellout_core::{
    normalize_key_fragment, CatalogHit, Client, ClientPair, NewClient, NewSale, SaleUpdate,
    SalesFilter, SalesKey, SalesRecord,
};

pub const CRATE_NAME: &str = "sellout-store";

/// Hard ceiling on bound parameters per statement. Kept at the most
/// restrictive backend we target rather than what Postgres would allow.
pub const PARAM_CEILING: usize = 2_100;

/// Maximum values per IN-list / ANY-list partition.
pub const IN_LIMIT: usize = 1_000;

/// Bind parameters per row in a key-based delete: year, month, barcode, pdv.
pub const DELETE_PARAMS_PER_ROW: usize = 4;

/// Safety cap on rows per delete statement: 500 * 4 = 2,000 < 2,100.
pub const DELETE_ROWS_PER_STATEMENT: usize = 500;

/// Bind parameters per row in a multi-row sales insert.
const SALES_INSERT_PARAMS_PER_ROW: usize = 17;

/// Per-statement limits a store instance operates under.
#[derive(Debug, Clone, Copy)]
pub struct StoreLimits {
    pub param_ceiling: usize,
    pub in_limit: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            param_ceiling: PARAM_CEILING,
            in_limit: IN_LIMIT,
        }
    }
}

/// Largest row count a single statement may carry without exceeding the
/// parameter ceiling. Getting this arithmetic wrong silently reintroduces
/// the overflow the partitioning exists to prevent, so it lives here and
/// is tested, not inlined at call sites.
pub fn max_rows_per_statement(params_per_row: usize, ceiling: usize) -> usize {
    if params_per_row == 0 {
        return ceiling.max(1);
    }
    (ceiling / params_per_row).max(1)
}

/// Bounded-size partitions of a candidate slice. A zero size degrades to 1
/// rather than panicking.
pub fn chunks<T>(items: &[T], size: usize) -> std::slice::Chunks<'_, T> {
    items.chunks(size.max(1))
}

/// Errors surfaced by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write, e.g. a concurrent run
    /// created the same client pair or sales key first.
    #[error("unique constraint violated: {0}")]
    Conflict(String),

    /// The store could not be reached or the statement failed outright.
    #[error("store unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

fn from_sqlx(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(ref db) = err {
        if db.is_unique_violation() {
            return StoreError::Conflict(db.message().to_string());
        }
    }
    StoreError::Unavailable(err)
}

/// Candidate space for the one-shot existing-record fetch of a chunk.
#[derive(Debug, Clone, Default)]
pub struct FetchScope {
    pub years: Vec<i32>,
    pub months: Vec<i32>,
    pub barcodes: Vec<String>,
    pub pdv_codes: Vec<String>,
    pub client_ids: Vec<i64>,
}

impl FetchScope {
    pub fn is_empty(&self) -> bool {
        self.years.is_empty()
            || self.months.is_empty()
            || self.barcodes.is_empty()
            || self.client_ids.is_empty()
    }
}

/// Bulk store operations the reconciliation engine consumes.
///
/// Every bulk entry point partitions its candidate set across statements
/// transparently; no statement binds more parameters than the configured
/// ceiling.
#[async_trait]
pub trait SalesStore: Send + Sync {
    /// Existence check for normalized `(code, name)` pairs.
    async fn find_clients(&self, pairs: &[ClientPair]) -> Result<Vec<Client>, StoreError>;

    /// Fallback lookup for rows that carry a code but no name.
    async fn find_clients_by_codes(&self, codes: &[String]) -> Result<Vec<Client>, StoreError>;

    /// Create one client; `Err(Conflict)` when the normalized pair exists.
    async fn insert_client(&self, client: &NewClient) -> Result<Client, StoreError>;

    /// Catalog membership for a set of barcodes. Duplicate catalog rows per
    /// barcode collapse to the lexicographically smallest catalog code.
    async fn lookup_catalog(
        &self,
        barcodes: &[String],
    ) -> Result<HashMap<String, CatalogHit>, StoreError>;

    /// Snapshot of existing sales records intersecting the scope.
    async fn fetch_existing(&self, scope: &FetchScope) -> Result<Vec<SalesRecord>, StoreError>;

    /// Open the transactional write scope for one chunk. All inserts and
    /// updates issued through the returned handle become visible together
    /// on commit, or not at all.
    async fn begin_chunk(&self) -> Result<Box<dyn ChunkTx + '_>, StoreError>;

    /// Standalone batched insert, committed immediately.
    async fn insert_sales(&self, batch: &[NewSale]) -> Result<u64, StoreError>;

    /// Standalone batched update, committed immediately.
    async fn update_sales(&self, batch: &[SaleUpdate]) -> Result<u64, StoreError>;

    /// Delete by explicit keys: one statement per sub-batch of at most
    /// `rows_per_statement` keys, all inside a single transaction.
    async fn delete_by_keys(
        &self,
        keys: &[SalesKey],
        rows_per_statement: usize,
    ) -> Result<u64, StoreError>;

    /// One capped delete round matching the filter; returns rows removed.
    async fn delete_by_filter(&self, filter: &SalesFilter, limit: u32)
        -> Result<u64, StoreError>;

    async fn available_years(&self, client_id: Option<i64>) -> Result<Vec<i32>, StoreError>;

    async fn available_months(
        &self,
        year: Option<i32>,
        client_id: Option<i64>,
    ) -> Result<Vec<i32>, StoreError>;

    async fn available_brands(
        &self,
        year: Option<i32>,
        client_id: Option<i64>,
    ) -> Result<Vec<String>, StoreError>;
}

/// One chunk's write scope. A uniqueness conflict inside `insert_sales`
/// leaves the scope usable (the failed statement alone is undone), so the
/// caller can retry row by row before deciding to commit or roll back.
#[async_trait]
pub trait ChunkTx: Send {
    async fn insert_sales(&mut self, batch: &[NewSale]) -> Result<u64, StoreError>;

    async fn update_sales(&mut self, batch: &[SaleUpdate]) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

#[derive(Debug, FromRow)]
struct ClientRow {
    id: i64,
    code: String,
    name: String,
    city: Option<String>,
    supplier_code: Option<String>,
}

impl From<ClientRow> for Client {
    fn from(row: ClientRow) -> Self {
        Client {
            id: row.id,
            code: row.code,
            name: row.name,
            city: row.city,
            supplier_code: row.supplier_code,
        }
    }
}

#[derive(Debug, FromRow)]
struct CatalogRow {
    id: i64,
    barcode: String,
    catalog_code: String,
}

#[derive(Debug, FromRow)]
struct SalesRow {
    id: i64,
    client_id: i64,
    product_id: Option<i64>,
    year: i32,
    month: i32,
    day: i32,
    brand: Option<String>,
    product_name: Option<String>,
    description: Option<String>,
    catalog_code: Option<String>,
    barcode: String,
    pdv_code: Option<String>,
    pdv_name: Option<String>,
    city: Option<String>,
    units_sold: f64,
    value_sold: f64,
    stock_units: f64,
    stock_value: f64,
}

impl From<SalesRow> for SalesRecord {
    fn from(r: SalesRow) -> Self {
        SalesRecord {
            id: r.id,
            client_id: r.client_id,
            product_id: r.product_id,
            year: r.year,
            month: r.month,
            day: r.day,
            brand: r.brand,
            product_name: r.product_name,
            description: r.description,
            catalog_code: r.catalog_code,
            barcode: r.barcode,
            pdv_code: r.pdv_code,
            pdv_name: r.pdv_name,
            city: r.city,
            units_sold: r.units_sold,
            value_sold: r.value_sold,
            stock_units: r.stock_units,
            stock_value: r.stock_value,
        }
    }
}

const SALES_COLUMNS: &str = "id, client_id, product_id, year, month, day, brand, product_name, \
     description, catalog_code, barcode, pdv_code, pdv_name, city, units_sold, value_sold, \
     stock_units, stock_value";

fn sales_insert_builder(part: &[NewSale]) -> QueryBuilder<'_, Postgres> {
    let mut qb = QueryBuilder::<Postgres>::new(
        "INSERT INTO sales (client_id, product_id, year, month, day, brand, \
         product_name, description, catalog_code, barcode, pdv_code, pdv_name, city, \
         units_sold, value_sold, stock_units, stock_value) ",
    );
    qb.push_values(part, |mut b, sale| {
        b.push_bind(sale.key.client_id);
        b.push_bind(sale.product_id);
        b.push_bind(sale.key.year);
        b.push_bind(sale.key.month);
        b.push_bind(sale.key.day);
        b.push_bind(&sale.brand);
        b.push_bind(&sale.product_name);
        b.push_bind(&sale.description);
        b.push_bind(&sale.catalog_code);
        b.push_bind(&sale.key.barcode);
        b.push_bind(&sale.key.pdv_code);
        b.push_bind(&sale.pdv_name);
        b.push_bind(&sale.city);
        b.push_bind(sale.units_sold);
        b.push_bind(sale.value_sold);
        b.push_bind(sale.stock_units);
        b.push_bind(sale.stock_value);
    });
    qb
}

fn bind_sale_update(
    update: &SaleUpdate,
) -> sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments> {
    let sale = &update.sale;
    sqlx::query(
        "UPDATE sales SET client_id = $1, product_id = $2, brand = $3, \
         product_name = $4, description = $5, catalog_code = $6, pdv_name = $7, \
         city = $8, units_sold = $9, value_sold = $10, stock_units = $11, \
         stock_value = $12 WHERE id = $13",
    )
    .bind(sale.key.client_id)
    .bind(sale.product_id)
    .bind(&sale.brand)
    .bind(&sale.product_name)
    .bind(&sale.description)
    .bind(&sale.catalog_code)
    .bind(&sale.pdv_name)
    .bind(&sale.city)
    .bind(sale.units_sold)
    .bind(sale.value_sold)
    .bind(sale.stock_units)
    .bind(sale.stock_value)
    .bind(update.id)
}

/// Postgres-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    limits: StoreLimits,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(from_sqlx)?;
        Ok(Self {
            pool,
            limits: StoreLimits::default(),
        })
    }

    pub fn with_limits(mut self, limits: StoreLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        debug!("migrations applied");
        Ok(())
    }
}

#[async_trait]
impl SalesStore for PgStore {
    async fn find_clients(&self, pairs: &[ClientPair]) -> Result<Vec<Client>, StoreError> {
        let mut found = Vec::new();
        for part in chunks(pairs, max_rows_per_statement(2, self.limits.param_ceiling).min(self.limits.in_limit)) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "SELECT id, code, name, city, supplier_code FROM client \
                 WHERE (code, name_norm) IN ",
            );
            qb.push_tuples(part, |mut b, pair| {
                b.push_bind(&pair.code_norm);
                b.push_bind(&pair.name_norm);
            });
            let rows: Vec<ClientRow> = qb
                .build_query_as()
                .fetch_all(&self.pool)
                .await
                .map_err(from_sqlx)?;
            found.extend(rows.into_iter().map(Client::from));
        }
        Ok(found)
    }

    async fn find_clients_by_codes(&self, codes: &[String]) -> Result<Vec<Client>, StoreError> {
        let mut found = Vec::new();
        for part in chunks(codes, self.limits.in_limit) {
            let rows: Vec<ClientRow> = sqlx::query_as(
                "SELECT id, code, name, city, supplier_code FROM client WHERE code = ANY($1)",
            )
            .bind(part)
            .fetch_all(&self.pool)
            .await
            .map_err(from_sqlx)?;
            found.extend(rows.into_iter().map(Client::from));
        }
        Ok(found)
    }

    async fn insert_client(&self, client: &NewClient) -> Result<Client, StoreError> {
        let name_norm = normalize_key_fragment(&client.name);
        let row: ClientRow = sqlx::query_as(
            "INSERT INTO client (code, name, name_norm, city) VALUES ($1, $2, $3, $4) \
             RETURNING id, code, name, city, supplier_code",
        )
        .bind(&client.code)
        .bind(&client.name)
        .bind(&name_norm)
        .bind(&client.city)
        .fetch_one(&self.pool)
        .await
        .map_err(from_sqlx)?;
        Ok(row.into())
    }

    async fn lookup_catalog(
        &self,
        barcodes: &[String],
    ) -> Result<HashMap<String, CatalogHit>, StoreError> {
        let mut out = HashMap::new();
        for part in chunks(barcodes, self.limits.in_limit) {
            let rows: Vec<CatalogRow> = sqlx::query_as(
                "SELECT DISTINCT ON (barcode) id, barcode, catalog_code \
                 FROM catalog_product WHERE barcode = ANY($1) \
                 ORDER BY barcode, catalog_code",
            )
            .bind(part)
            .fetch_all(&self.pool)
            .await
            .map_err(from_sqlx)?;
            for row in rows {
                out.insert(
                    row.barcode.trim().to_string(),
                    CatalogHit {
                        product_id: row.id,
                        catalog_code: row.catalog_code.trim().to_string(),
                    },
                );
            }
        }
        Ok(out)
    }

    async fn fetch_existing(&self, scope: &FetchScope) -> Result<Vec<SalesRecord>, StoreError> {
        if scope.is_empty() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for barcode_part in chunks(&scope.barcodes, self.limits.in_limit) {
            for client_part in chunks(&scope.client_ids, self.limits.in_limit) {
                let mut qb = QueryBuilder::<Postgres>::new(format!(
                    "SELECT {SALES_COLUMNS} FROM sales WHERE year = ANY("
                ));
                qb.push_bind(&scope.years);
                qb.push(") AND month = ANY(");
                qb.push_bind(&scope.months);
                qb.push(") AND barcode = ANY(");
                qb.push_bind(barcode_part);
                qb.push(") AND client_id = ANY(");
                qb.push_bind(client_part);
                qb.push(")");
                if scope.pdv_codes.is_empty() {
                    qb.push(" AND pdv_code IS NULL");
                } else {
                    qb.push(" AND (pdv_code IS NULL OR pdv_code = ANY(");
                    qb.push_bind(&scope.pdv_codes);
                    qb.push("))");
                }
                let rows: Vec<SalesRow> = qb
                    .build_query_as()
                    .fetch_all(&self.pool)
                    .await
                    .map_err(from_sqlx)?;
                found.extend(rows.into_iter().map(SalesRecord::from));
            }
        }
        Ok(found)
    }

    async fn begin_chunk(&self) -> Result<Box<dyn ChunkTx + '_>, StoreError> {
        let tx = self.pool.begin().await.map_err(from_sqlx)?;
        Ok(Box::new(PgChunkTx {
            tx,
            limits: self.limits,
        }))
    }

    async fn insert_sales(&self, batch: &[NewSale]) -> Result<u64, StoreError> {
        let mut inserted = 0u64;
        let per_statement =
            max_rows_per_statement(SALES_INSERT_PARAMS_PER_ROW, self.limits.param_ceiling);
        for part in chunks(batch, per_statement) {
            let result = sales_insert_builder(part)
                .build()
                .execute(&self.pool)
                .await
                .map_err(from_sqlx)?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    async fn update_sales(&self, batch: &[SaleUpdate]) -> Result<u64, StoreError> {
        let mut updated = 0u64;
        let mut tx = self.pool.begin().await.map_err(from_sqlx)?;
        for update in batch {
            let result = bind_sale_update(update)
                .execute(&mut *tx)
                .await
                .map_err(from_sqlx)?;
            updated += result.rows_affected();
        }
        tx.commit().await.map_err(from_sqlx)?;
        Ok(updated)
    }

    async fn delete_by_keys(
        &self,
        keys: &[SalesKey],
        rows_per_statement: usize,
    ) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let safe_rows = rows_per_statement
            .min(max_rows_per_statement(DELETE_PARAMS_PER_ROW, self.limits.param_ceiling));
        let mut deleted = 0u64;
        let mut tx = self.pool.begin().await.map_err(from_sqlx)?;
        for part in chunks(keys, safe_rows) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "DELETE FROM sales \
                 WHERE (year, month, barcode, COALESCE(pdv_code, '')) IN ",
            );
            qb.push_tuples(part, |mut b, key| {
                b.push_bind(key.year);
                b.push_bind(key.month);
                b.push_bind(&key.barcode);
                b.push_bind(key.pdv_code.clone().unwrap_or_default());
            });
            debug!(rows = part.len(), "key delete statement");
            let result = qb.build().execute(&mut *tx).await.map_err(from_sqlx)?;
            deleted += result.rows_affected();
        }
        tx.commit().await.map_err(from_sqlx)?;
        Ok(deleted)
    }

    async fn delete_by_filter(
        &self,
        filter: &SalesFilter,
        limit: u32,
    ) -> Result<u64, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "DELETE FROM sales WHERE id IN (SELECT id FROM sales WHERE 1=1",
        );
        if let Some(year) = filter.year {
            qb.push(" AND year = ");
            qb.push_bind(year);
        }
        if let Some(month) = filter.month {
            qb.push(" AND month = ");
            qb.push_bind(month);
        }
        if let Some(brand) = filter.brand.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            qb.push(" AND brand = ");
            qb.push_bind(brand.to_string());
        }
        if let Some(pdv) = filter.pdv_code.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            qb.push(" AND pdv_code = ");
            qb.push_bind(pdv.to_string());
        }
        qb.push(" LIMIT ");
        qb.push_bind(i64::from(limit));
        qb.push(")");
        let result = qb.build().execute(&self.pool).await.map_err(from_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn available_years(&self, client_id: Option<i64>) -> Result<Vec<i32>, StoreError> {
        let mut qb =
            QueryBuilder::<Postgres>::new("SELECT DISTINCT year FROM sales WHERE 1=1");
        if let Some(id) = client_id {
            qb.push(" AND client_id = ");
            qb.push_bind(id);
        }
        qb.push(" ORDER BY year DESC");
        let rows: Vec<(i32,)> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(from_sqlx)?;
        Ok(rows.into_iter().map(|(y,)| y).collect())
    }

    async fn available_months(
        &self,
        year: Option<i32>,
        client_id: Option<i64>,
    ) -> Result<Vec<i32>, StoreError> {
        let mut qb =
            QueryBuilder::<Postgres>::new("SELECT DISTINCT month FROM sales WHERE 1=1");
        if let Some(y) = year {
            qb.push(" AND year = ");
            qb.push_bind(y);
        }
        if let Some(id) = client_id {
            qb.push(" AND client_id = ");
            qb.push_bind(id);
        }
        qb.push(" ORDER BY month");
        let rows: Vec<(i32,)> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(from_sqlx)?;
        Ok(rows.into_iter().map(|(m,)| m).collect())
    }

    async fn available_brands(
        &self,
        year: Option<i32>,
        client_id: Option<i64>,
    ) -> Result<Vec<String>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT DISTINCT brand FROM sales WHERE brand IS NOT NULL",
        );
        if let Some(y) = year {
            qb.push(" AND year = ");
            qb.push_bind(y);
        }
        if let Some(id) = client_id {
            qb.push(" AND client_id = ");
            qb.push_bind(id);
        }
        qb.push(" ORDER BY brand");
        let rows: Vec<(String,)> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(from_sqlx)?;
        Ok(rows.into_iter().map(|(b,)| b).collect())
    }
}

/// Chunk transaction over a Postgres connection. Each insert sub-batch runs
/// under a savepoint so a uniqueness conflict aborts only that statement,
/// not the chunk transaction.
struct PgChunkTx {
    tx: Transaction<'static, Postgres>,
    limits: StoreLimits,
}

#[async_trait]
impl ChunkTx for PgChunkTx {
    async fn insert_sales(&mut self, batch: &[NewSale]) -> Result<u64, StoreError> {
        let mut inserted = 0u64;
        let per_statement =
            max_rows_per_statement(SALES_INSERT_PARAMS_PER_ROW, self.limits.param_ceiling);
        for part in chunks(batch, per_statement) {
            let mut sp = self.tx.begin().await.map_err(from_sqlx)?;
            match sales_insert_builder(part).build().execute(&mut *sp).await {
                Ok(result) => {
                    inserted += result.rows_affected();
                    sp.commit().await.map_err(from_sqlx)?;
                }
                Err(err) => {
                    sp.rollback().await.map_err(from_sqlx)?;
                    return Err(from_sqlx(err));
                }
            }
        }
        Ok(inserted)
    }

    async fn update_sales(&mut self, batch: &[SaleUpdate]) -> Result<u64, StoreError> {
        let mut updated = 0u64;
        for update in batch {
            let result = bind_sale_update(update)
                .execute(&mut *self.tx)
                .await
                .map_err(from_sqlx)?;
            updated += result.rows_affected();
        }
        Ok(updated)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(from_sqlx)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(from_sqlx)
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemState {
    next_client_id: i64,
    next_catalog_id: i64,
    next_sales_id: i64,
    clients: Vec<Client>,
    catalog: Vec<(i64, String, String)>,
    sales: Vec<SalesRecord>,
    /// Row count of every key-delete statement issued, oldest first.
    delete_statement_rows: Vec<usize>,
    /// When set, the next chunk-scoped update fails (cleared on use).
    fail_next_update: bool,
}

fn check_insert_conflicts(
    state: &MemState,
    batch: &[NewSale],
    pending: &[NewSale],
) -> Result<(), StoreError> {
    for sale in batch {
        let duplicate = state
            .sales
            .iter()
            .any(|existing| existing.business_key() == sale.key)
            || pending.iter().any(|buffered| buffered.key == sale.key);
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "sales key already exists for barcode {}",
                sale.key.barcode
            )));
        }
    }
    Ok(())
}

fn apply_inserts(state: &mut MemState, batch: &[NewSale]) {
    for sale in batch {
        state.next_sales_id += 1;
        let id = state.next_sales_id;
        state.sales.push(SalesRecord {
            id,
            client_id: sale.key.client_id,
            product_id: sale.product_id,
            year: sale.key.year,
            month: sale.key.month,
            day: sale.key.day,
            brand: sale.brand.clone(),
            product_name: sale.product_name.clone(),
            description: sale.description.clone(),
            catalog_code: Some(sale.catalog_code.clone()),
            barcode: sale.key.barcode.clone(),
            pdv_code: sale.key.pdv_code.clone(),
            pdv_name: sale.pdv_name.clone(),
            city: sale.city.clone(),
            units_sold: sale.units_sold,
            value_sold: sale.value_sold,
            stock_units: sale.stock_units,
            stock_value: sale.stock_value,
        });
    }
}

fn apply_updates(state: &mut MemState, batch: &[SaleUpdate]) -> u64 {
    let mut updated = 0u64;
    for update in batch {
        if let Some(record) = state.sales.iter_mut().find(|s| s.id == update.id) {
            let sale = &update.sale;
            record.client_id = sale.key.client_id;
            record.product_id = sale.product_id;
            record.brand = sale.brand.clone();
            record.product_name = sale.product_name.clone();
            record.description = sale.description.clone();
            record.catalog_code = Some(sale.catalog_code.clone());
            record.pdv_name = sale.pdv_name.clone();
            record.city = sale.city.clone();
            record.units_sold = sale.units_sold;
            record.value_sold = sale.value_sold;
            record.stock_units = sale.stock_units;
            record.stock_value = sale.stock_value;
            updated += 1;
        }
    }
    updated
}

/// In-memory store mirroring [`PgStore`] semantics, including statement
/// partition accounting. Used by engine tests and offline runs.
#[derive(Debug, Default)]
pub struct MemStore {
    state: Mutex<MemState>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_catalog(&self, barcode: &str, catalog_code: &str) {
        let mut state = self.state.lock().await;
        state.next_catalog_id += 1;
        let id = state.next_catalog_id;
        state
            .catalog
            .push((id, barcode.trim().to_string(), catalog_code.trim().to_string()));
    }

    pub async fn sales_snapshot(&self) -> Vec<SalesRecord> {
        self.state.lock().await.sales.clone()
    }

    pub async fn clients_snapshot(&self) -> Vec<Client> {
        self.state.lock().await.clients.clone()
    }

    pub async fn delete_statement_rows(&self) -> Vec<usize> {
        self.state.lock().await.delete_statement_rows.clone()
    }

    /// Make the next chunk-scoped update fail, for failure-path tests.
    pub async fn fail_next_update(&self) {
        self.state.lock().await.fail_next_update = true;
    }
}

/// Buffering chunk transaction: writes are staged and applied to the shared
/// state only on commit, mirroring [`PgChunkTx`] visibility.
struct MemChunkTx<'a> {
    store: &'a MemStore,
    inserts: Vec<NewSale>,
    updates: Vec<SaleUpdate>,
}

#[async_trait]
impl ChunkTx for MemChunkTx<'_> {
    async fn insert_sales(&mut self, batch: &[NewSale]) -> Result<u64, StoreError> {
        let state = self.store.state.lock().await;
        check_insert_conflicts(&state, batch, &self.inserts)?;
        drop(state);
        self.inserts.extend_from_slice(batch);
        Ok(batch.len() as u64)
    }

    async fn update_sales(&mut self, batch: &[SaleUpdate]) -> Result<u64, StoreError> {
        let mut state = self.store.state.lock().await;
        if state.fail_next_update {
            state.fail_next_update = false;
            return Err(StoreError::Unavailable(sqlx::Error::PoolClosed));
        }
        drop(state);
        self.updates.extend_from_slice(batch);
        Ok(batch.len() as u64)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut state = self.store.state.lock().await;
        check_insert_conflicts(&state, &self.inserts, &[])?;
        apply_inserts(&mut state, &self.inserts);
        apply_updates(&mut state, &self.updates);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

fn pdv_matches(record: &Option<String>, key: &Option<String>) -> bool {
    let norm = |v: &Option<String>| {
        v.as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    norm(record) == norm(key)
}

#[async_trait]
impl SalesStore for MemStore {
    async fn find_clients(&self, pairs: &[ClientPair]) -> Result<Vec<Client>, StoreError> {
        let state = self.state.lock().await;
        let wanted: Vec<(String, String)> = pairs
            .iter()
            .map(|p| (p.code_norm.clone(), p.name_norm.clone()))
            .collect();
        Ok(state
            .clients
            .iter()
            .filter(|c| {
                let key = (
                    normalize_key_fragment(&c.code),
                    normalize_key_fragment(&c.name),
                );
                wanted.contains(&key)
            })
            .cloned()
            .collect())
    }

    async fn find_clients_by_codes(&self, codes: &[String]) -> Result<Vec<Client>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .clients
            .iter()
            .filter(|c| codes.contains(&normalize_key_fragment(&c.code)))
            .cloned()
            .collect())
    }

    async fn insert_client(&self, client: &NewClient) -> Result<Client, StoreError> {
        let mut state = self.state.lock().await;
        let code_norm = normalize_key_fragment(&client.code);
        let name_norm = normalize_key_fragment(&client.name);
        let exists = state.clients.iter().any(|c| {
            normalize_key_fragment(&c.code) == code_norm
                && normalize_key_fragment(&c.name) == name_norm
        });
        if exists {
            return Err(StoreError::Conflict(format!(
                "client pair ({code_norm}, {name_norm}) already exists"
            )));
        }
        state.next_client_id += 1;
        let created = Client {
            id: state.next_client_id,
            code: client.code.clone(),
            name: client.name.clone(),
            city: client.city.clone(),
            supplier_code: None,
        };
        state.clients.push(created.clone());
        Ok(created)
    }

    async fn lookup_catalog(
        &self,
        barcodes: &[String],
    ) -> Result<HashMap<String, CatalogHit>, StoreError> {
        let state = self.state.lock().await;
        let mut out: HashMap<String, CatalogHit> = HashMap::new();
        for (id, barcode, code) in &state.catalog {
            if !barcodes.iter().any(|b| b.trim() == barcode) {
                continue;
            }
            let better = out
                .get(barcode)
                .map_or(true, |existing| *code < existing.catalog_code);
            if better {
                out.insert(
                    barcode.clone(),
                    CatalogHit {
                        product_id: *id,
                        catalog_code: code.clone(),
                    },
                );
            }
        }
        Ok(out)
    }

    async fn fetch_existing(&self, scope: &FetchScope) -> Result<Vec<SalesRecord>, StoreError> {
        if scope.is_empty() {
            return Ok(Vec::new());
        }
        let state = self.state.lock().await;
        Ok(state
            .sales
            .iter()
            .filter(|s| {
                scope.years.contains(&s.year)
                    && scope.months.contains(&s.month)
                    && scope.barcodes.iter().any(|b| b == &s.barcode)
                    && scope.client_ids.contains(&s.client_id)
                    && match s.pdv_code.as_deref() {
                        None => true,
                        Some(pdv) => scope.pdv_codes.iter().any(|p| p == pdv),
                    }
            })
            .cloned()
            .collect())
    }

    async fn begin_chunk(&self) -> Result<Box<dyn ChunkTx + '_>, StoreError> {
        Ok(Box::new(MemChunkTx {
            store: self,
            inserts: Vec::new(),
            updates: Vec::new(),
        }))
    }

    async fn insert_sales(&self, batch: &[NewSale]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        check_insert_conflicts(&state, batch, &[])?;
        apply_inserts(&mut state, batch);
        Ok(batch.len() as u64)
    }

    async fn update_sales(&self, batch: &[SaleUpdate]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        Ok(apply_updates(&mut state, batch))
    }

    async fn delete_by_keys(
        &self,
        keys: &[SalesKey],
        rows_per_statement: usize,
    ) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let safe_rows =
            rows_per_statement.min(max_rows_per_statement(DELETE_PARAMS_PER_ROW, PARAM_CEILING));
        let mut state = self.state.lock().await;
        let mut deleted = 0u64;
        for part in chunks(keys, safe_rows) {
            state.delete_statement_rows.push(part.len());
            let before = state.sales.len();
            state.sales.retain(|s| {
                !part.iter().any(|k| {
                    s.year == k.year
                        && s.month == k.month
                        && s.barcode == k.barcode.trim()
                        && pdv_matches(&s.pdv_code, &k.pdv_code)
                })
            });
            deleted += (before - state.sales.len()) as u64;
        }
        Ok(deleted)
    }

    async fn delete_by_filter(
        &self,
        filter: &SalesFilter,
        limit: u32,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let matching: Vec<i64> = state
            .sales
            .iter()
            .filter(|s| {
                filter.year.map_or(true, |y| s.year == y)
                    && filter.month.map_or(true, |m| s.month == m)
                    && filter
                        .brand
                        .as_deref()
                        .map(str::trim)
                        .filter(|b| !b.is_empty())
                        .map_or(true, |b| s.brand.as_deref() == Some(b))
                    && filter
                        .pdv_code
                        .as_deref()
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map_or(true, |p| s.pdv_code.as_deref() == Some(p))
            })
            .take(limit as usize)
            .map(|s| s.id)
            .collect();
        state.sales.retain(|s| !matching.contains(&s.id));
        Ok(matching.len() as u64)
    }

    async fn available_years(&self, client_id: Option<i64>) -> Result<Vec<i32>, StoreError> {
        let state = self.state.lock().await;
        let mut years: Vec<i32> = state
            .sales
            .iter()
            .filter(|s| client_id.map_or(true, |id| s.client_id == id))
            .map(|s| s.year)
            .collect();
        years.sort_unstable();
        years.dedup();
        years.reverse();
        Ok(years)
    }

    async fn available_months(
        &self,
        year: Option<i32>,
        client_id: Option<i64>,
    ) -> Result<Vec<i32>, StoreError> {
        let state = self.state.lock().await;
        let mut months: Vec<i32> = state
            .sales
            .iter()
            .filter(|s| {
                year.map_or(true, |y| s.year == y)
                    && client_id.map_or(true, |id| s.client_id == id)
            })
            .map(|s| s.month)
            .collect();
        months.sort_unstable();
        months.dedup();
        Ok(months)
    }

    async fn available_brands(
        &self,
        year: Option<i32>,
        client_id: Option<i64>,
    ) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        let mut brands: Vec<String> = state
            .sales
            .iter()
            .filter(|s| {
                year.map_or(true, |y| s.year == y)
                    && client_id.map_or(true, |id| s.client_id == id)
            })
            .filter_map(|s| s.brand.clone())
            .collect();
        brands.sort_unstable();
        brands.dedup();
        Ok(brands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sellout_core::BusinessKey;

    fn mk_sale(client_id: i64, year: i32, month: i32, day: i32, barcode: &str, pdv: Option<&str>) -> NewSale {
        NewSale {
            key: BusinessKey {
                client_id,
                year,
                month,
                day,
                barcode: barcode.to_string(),
                pdv_code: pdv.map(str::to_string),
            },
            product_id: None,
            brand: Some("ESSENCE".into()),
            product_name: None,
            description: None,
            catalog_code: "CAT-1".into(),
            pdv_name: None,
            city: None,
            units_sold: 1.0,
            value_sold: 2.5,
            stock_units: 0.0,
            stock_value: 0.0,
        }
    }

    #[test]
    fn ceiling_arithmetic_matches_safety_margin() {
        assert_eq!(max_rows_per_statement(4, 2_100), 525);
        assert!(DELETE_ROWS_PER_STATEMENT < max_rows_per_statement(4, PARAM_CEILING));
        assert_eq!(max_rows_per_statement(0, 2_100), 2_100);
        assert_eq!(max_rows_per_statement(5_000, 2_100), 1);
    }

    #[test]
    fn chunks_never_exceed_size_and_cover_input() {
        let items: Vec<u32> = (0..1_200).collect();
        let parts: Vec<&[u32]> = chunks(&items, 500).collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 500);
        assert_eq!(parts[2].len(), 200);
        assert_eq!(parts.iter().map(|p| p.len()).sum::<usize>(), 1_200);
    }

    #[tokio::test]
    async fn client_pair_uniqueness_is_enforced() {
        let store = MemStore::new();
        store
            .insert_client(&NewClient {
                code: "C01".into(),
                name: "Almacenes Tía".into(),
                city: None,
            })
            .await
            .expect("first insert");

        // Same code with a different name is a distinct client.
        store
            .insert_client(&NewClient {
                code: "C01".into(),
                name: "Almacenes Tía Norte".into(),
                city: None,
            })
            .await
            .expect("same code, distinct name");

        // Accent/case variants of the same pair collide.
        let err = store
            .insert_client(&NewClient {
                code: "c01".into(),
                name: "ALMACENES TIA".into(),
                city: None,
            })
            .await
            .expect_err("normalized duplicate");
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn catalog_lookup_takes_smallest_code() {
        let store = MemStore::new();
        store.seed_catalog("786000", "CAT-B").await;
        store.seed_catalog("786000", "CAT-A").await;
        store.seed_catalog("999999", "CAT-Z").await;

        let hits = store
            .lookup_catalog(&["786000".into(), "123456".into()])
            .await
            .expect("lookup");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits["786000"].catalog_code, "CAT-A");
    }

    #[tokio::test]
    async fn key_delete_partitions_by_statement_cap() {
        let store = MemStore::new();
        let keys: Vec<SalesKey> = (0..1_200)
            .map(|i| SalesKey {
                year: 2025,
                month: 3,
                barcode: format!("bc-{i}"),
                pdv_code: None,
            })
            .collect();

        store
            .delete_by_keys(&keys, DELETE_ROWS_PER_STATEMENT)
            .await
            .expect("delete");

        let statements = store.delete_statement_rows().await;
        assert_eq!(statements, vec![500, 500, 200]);
        for rows in statements {
            assert!(rows * DELETE_PARAMS_PER_ROW <= PARAM_CEILING);
        }
    }

    #[tokio::test]
    async fn key_delete_is_null_pdv_safe() {
        let store = MemStore::new();
        store
            .insert_sales(&[
                mk_sale(1, 2025, 3, 1, "786000", None),
                mk_sale(1, 2025, 3, 1, "786000", Some("PDV-9")),
            ])
            .await
            .expect("seed");

        let deleted = store
            .delete_by_keys(
                &[SalesKey {
                    year: 2025,
                    month: 3,
                    barcode: "786000".into(),
                    pdv_code: None,
                }],
                DELETE_ROWS_PER_STATEMENT,
            )
            .await
            .expect("delete");
        assert_eq!(deleted, 1);

        let left = store.sales_snapshot().await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].pdv_code.as_deref(), Some("PDV-9"));
    }

    #[tokio::test]
    async fn filter_delete_respects_round_cap() {
        let store = MemStore::new();
        let batch: Vec<NewSale> = (0..7)
            .map(|i| mk_sale(1, 2025, 3, i + 1, &format!("bc-{i}"), None))
            .collect();
        store.insert_sales(&batch).await.expect("seed");

        let filter = SalesFilter {
            year: Some(2025),
            ..Default::default()
        };
        assert_eq!(store.delete_by_filter(&filter, 5).await.expect("round 1"), 5);
        assert_eq!(store.delete_by_filter(&filter, 5).await.expect("round 2"), 2);
        assert!(store.sales_snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_business_key_insert_conflicts() {
        let store = MemStore::new();
        store
            .insert_sales(&[mk_sale(1, 2025, 3, 1, "786000", None)])
            .await
            .expect("first");
        let err = store
            .insert_sales(&[mk_sale(1, 2025, 3, 1, "786000", None)])
            .await
            .expect_err("duplicate key");
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn chunk_tx_writes_are_invisible_until_commit() {
        let store = MemStore::new();

        let mut tx = store.begin_chunk().await.expect("begin");
        tx.insert_sales(&[mk_sale(1, 2025, 3, 1, "786000", None)])
            .await
            .expect("staged insert");
        assert!(store.sales_snapshot().await.is_empty());
        tx.rollback().await.expect("rollback");
        assert!(store.sales_snapshot().await.is_empty());

        let mut tx = store.begin_chunk().await.expect("begin");
        tx.insert_sales(&[mk_sale(1, 2025, 3, 1, "786000", None)])
            .await
            .expect("staged insert");
        tx.commit().await.expect("commit");
        assert_eq!(store.sales_snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn chunk_tx_conflict_leaves_scope_usable() {
        let store = MemStore::new();
        store
            .insert_sales(&[mk_sale(1, 2025, 3, 1, "786000", None)])
            .await
            .expect("seed");

        let mut tx = store.begin_chunk().await.expect("begin");
        let err = tx
            .insert_sales(&[
                mk_sale(1, 2025, 3, 1, "786000", None),
                mk_sale(1, 2025, 3, 2, "786001", None),
            ])
            .await
            .expect_err("duplicate in batch");
        assert!(matches!(err, StoreError::Conflict(_)));

        // the failed statement staged nothing; the scope still accepts writes
        tx.insert_sales(&[mk_sale(1, 2025, 3, 2, "786001", None)])
            .await
            .expect("retry");
        tx.commit().await.expect("commit");
        assert_eq!(store.sales_snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn available_dimensions_reflect_records() {
        let store = MemStore::new();
        let mut other = mk_sale(2, 2024, 11, 3, "786001", None);
        other.brand = Some("CATRICE".into());
        store
            .insert_sales(&[mk_sale(1, 2025, 3, 1, "786000", None), other])
            .await
            .expect("seed");

        assert_eq!(store.available_years(None).await.expect("years"), vec![2025, 2024]);
        assert_eq!(
            store.available_months(Some(2024), None).await.expect("months"),
            vec![11]
        );
        assert_eq!(
            store.available_brands(None, None).await.expect("brands"),
            vec!["CATRICE", "ESSENCE"]
        );
        assert_eq!(
            store.available_brands(Some(2025), None).await.expect("brands"),
            vec!["ESSENCE"]
        );
    }
}
