use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{info, warn};

use sellout_core::{RowRecord, SalesFilter, SalesKey};
use sellout_engine::{EngineConfig, IngestPipeline};
use sellout_store::{PgStore, SalesStore};

#[derive(Debug, Parser)]
#[command(name = "sellout")]
#[command(about = "Sell-out reconciliation engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply pending database migrations.
    Migrate,
    /// Ingest a CSV export and reconcile it against the stored records.
    Ingest {
        /// CSV file with headers: client_code, client_name, year, month,
        /// day, barcode, description, brand, pdv_code, pdv_name, city,
        /// units_sold, value_sold, stock_units.
        file: PathBuf,
        /// Emit the full report as JSON instead of a summary.
        #[arg(long)]
        json: bool,
    },
    /// Delete records selected by explicit keys (CSV: year, month,
    /// barcode, pdv_code).
    DeleteKeys {
        file: PathBuf,
        /// Override the per-invocation key cap.
        #[arg(long)]
        max: Option<usize>,
    },
    /// Delete records matching a filter, in capped rounds.
    DeleteFilter {
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        month: Option<i32>,
        #[arg(long)]
        brand: Option<String>,
        #[arg(long)]
        pdv_code: Option<String>,
        /// Stop after removing at most this many rows.
        #[arg(long)]
        cap: Option<u64>,
    },
    /// Show the years and months that currently hold records.
    Stats {
        #[arg(long)]
        client: Option<i64>,
    },
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    client_code: Option<String>,
    client_name: Option<String>,
    year: Option<i32>,
    month: Option<i32>,
    day: Option<i32>,
    barcode: Option<String>,
    description: Option<String>,
    brand: Option<String>,
    pdv_code: Option<String>,
    pdv_name: Option<String>,
    city: Option<String>,
    units_sold: Option<f64>,
    value_sold: Option<f64>,
    stock_units: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct KeyRow {
    year: i32,
    month: i32,
    barcode: String,
    pdv_code: Option<String>,
}

struct ParsedRows {
    rows: Vec<RowRecord>,
    /// Rows the normalizer refused, with the source line and the reason.
    skipped: Vec<(u32, &'static str)>,
}

fn parse_rows<R: std::io::Read>(input: R) -> Result<ParsedRows> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(input);
    let blank = |v: &Option<String>| v.as_deref().map_or(true, |s| s.trim().is_empty());
    let mut rows = Vec::new();
    let mut skipped = Vec::new();
    for (index, record) in reader.deserialize::<CsvRow>().enumerate() {
        // header is line 1
        let source_row = index as u32 + 2;
        let row: CsvRow = record.with_context(|| format!("row {source_row}"))?;
        let has_date = matches!(
            (row.year, row.month, row.day),
            (Some(y), Some(m), Some(d)) if y > 0 && m > 0 && d > 0
        );
        let candidate = RowRecord {
            source_row,
            client_code: row.client_code,
            client_name: row.client_name,
            year: row.year.unwrap_or(0),
            month: row.month.unwrap_or(0),
            day: row.day.unwrap_or(0),
            barcode: row.barcode,
            description: row.description,
            brand: row.brand,
            pdv_code: row.pdv_code,
            pdv_name: row.pdv_name,
            city: row.city,
            units_sold: row.units_sold,
            value_sold: row.value_sold,
            stock_units: row.stock_units,
        };
        // Blank rows flow through: the pipeline uses them as the
        // end-of-data marker.
        if candidate.is_structurally_empty() {
            rows.push(candidate);
            continue;
        }
        if !has_date {
            skipped.push((source_row, "missing sale date"));
            continue;
        }
        if blank(&candidate.pdv_code) && blank(&candidate.pdv_name) {
            skipped.push((source_row, "missing pdv code and name"));
            continue;
        }
        rows.push(candidate);
    }
    Ok(ParsedRows { rows, skipped })
}

fn read_rows(path: &Path) -> Result<ParsedRows> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    parse_rows(file)
}

fn read_keys(path: &Path) -> Result<Vec<SalesKey>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut keys = Vec::new();
    for (index, record) in reader.deserialize::<KeyRow>().enumerate() {
        let key: KeyRow = record.with_context(|| format!("row {}", index + 2))?;
        keys.push(SalesKey {
            year: key.year,
            month: key.month,
            barcode: key.barcode,
            pdv_code: key.pdv_code,
        });
    }
    Ok(keys)
}

async fn connect() -> Result<PgStore> {
    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
    Ok(PgStore::connect(&database_url).await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    match cli.command {
        Commands::Migrate => {
            let store = connect().await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Ingest { file, json } => {
            let parsed = read_rows(&file)?;
            info!(
                path = %file.display(),
                rows = parsed.rows.len(),
                skipped = parsed.skipped.len(),
                "csv parsed"
            );
            for &(line, reason) in &parsed.skipped {
                warn!(line, reason, "row skipped before ingestion");
            }
            let skipped = parsed.skipped.len();
            let store = Arc::new(connect().await?);
            let pipeline = IngestPipeline::new(store, config);
            let report = pipeline.run(parsed.rows).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "ingest complete: run_id={} read={} inserted={} updated={} omitted={} skipped={}",
                    report.run_id,
                    report.rows_read,
                    report.inserted,
                    report.updated,
                    report.omitted,
                    skipped
                );
                for incident in &report.incidents {
                    eprintln!(
                        "row {}: {} [{}] {}",
                        incident.row, incident.code, incident.kind, incident.reason
                    );
                }
            }
            if report.failed {
                bail!(
                    "ingestion stopped early: {}",
                    report.failure.as_deref().unwrap_or("unknown failure")
                );
            }
        }
        Commands::DeleteKeys { file, max } => {
            let keys = read_keys(&file)?;
            let store = connect().await?;
            let config = EngineConfig {
                delete_target_max: max.unwrap_or(config.delete_target_max),
                ..config
            };
            let summary = sellout_engine::delete_by_keys(&store, &config, &keys).await?;
            println!(
                "deleted {} of {} requested ({})",
                summary.deleted,
                summary.requested.unwrap_or(0),
                summary.message
            );
        }
        Commands::DeleteFilter {
            year,
            month,
            brand,
            pdv_code,
            cap,
        } => {
            let filter = SalesFilter {
                year,
                month,
                brand,
                pdv_code,
            };
            if filter == SalesFilter::default() {
                bail!("refusing to delete without a filter; pass --year, --month, --brand or --pdv-code");
            }
            let store = connect().await?;
            let summary =
                sellout_engine::delete_by_filter(&store, &config, &filter, cap).await?;
            println!("deleted {} rows ({})", summary.deleted, summary.message);
        }
        Commands::Stats { client } => {
            let store = connect().await?;
            let years = store.available_years(client).await?;
            if years.is_empty() {
                println!("no records");
            }
            for year in years {
                let months = store.available_months(Some(year), client).await?;
                let months: Vec<String> = months.iter().map(ToString::to_string).collect();
                println!("{year}: {}", months.join(", "));
            }
            let brands = store.available_brands(None, client).await?;
            if !brands.is_empty() {
                println!("brands: {}", brands.join(", "));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "client_code,client_name,year,month,day,barcode,description,brand,\
pdv_code,pdv_name,city,units_sold,value_sold,stock_units\n";

    #[test]
    fn rows_missing_date_or_pdv_are_skipped() {
        let csv = format!(
            "{HEADER}\
C01,Acme,2025,3,14,786000,Liner,ESSENCE,PDV-1,Mall,Quito,1,2.5,0\n\
C01,Acme,,3,14,786001,Liner,ESSENCE,PDV-1,Mall,Quito,1,2.5,0\n\
C01,Acme,2025,3,14,786002,Liner,ESSENCE,,,Quito,1,2.5,0\n"
        );
        let parsed = parse_rows(csv.as_bytes()).expect("parse");
        assert_eq!(parsed.rows.len(), 1);
        assert_eq!(parsed.rows[0].barcode.as_deref(), Some("786000"));
        assert_eq!(parsed.rows[0].year, 2025);
        assert_eq!(
            parsed.skipped,
            vec![(3, "missing sale date"), (4, "missing pdv code and name")]
        );
    }

    #[test]
    fn blank_rows_flow_through_as_end_markers() {
        let csv = format!(
            "{HEADER}\
C01,Acme,2025,3,14,786000,Liner,ESSENCE,PDV-1,Mall,Quito,1,2.5,0\n\
,,,,,,,,,,,,,\n\
,,,,,,,,,,,,,\n"
        );
        let parsed = parse_rows(csv.as_bytes()).expect("parse");
        assert_eq!(parsed.rows.len(), 3);
        assert!(parsed.rows[1].is_structurally_empty());
        assert!(parsed.rows[2].is_structurally_empty());
        assert!(parsed.skipped.is_empty());
    }

    #[test]
    fn zero_date_counts_as_missing() {
        let csv = format!("{HEADER}C01,Acme,0,0,0,786000,Liner,ESSENCE,PDV-1,Mall,Quito,1,2.5,0\n");
        let parsed = parse_rows(csv.as_bytes()).expect("parse");
        assert!(parsed.rows.is_empty());
        assert_eq!(parsed.skipped, vec![(2, "missing sale date")]);
    }
}
