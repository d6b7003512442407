use anyhow::{Context, Result};
use campaign_fusion::core::fusion::context::{CalculationType, QueryIntent, QueryLevel};
use campaign_fusion::data_utils::{records_to_dataframe, Record};
use campaign_fusion::{FusionConfig, FusionPipeline, FusionRequest};
use clap::Parser;
use polars::prelude::*;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fusion")]
#[command(about = "Fuse campaign budget data with delivery metrics into one report table")]
struct Args {
    /// Primary (budget/metadata) dataset, JSON records, CSV or Parquet
    #[arg(short, long)]
    primary: PathBuf,

    /// Secondary (impression/click/view) dataset, JSON records, CSV or Parquet
    #[arg(short, long)]
    secondary: Option<PathBuf>,

    /// Query intent as JSON; overrides the individual intent flags
    #[arg(short, long)]
    intent: Option<PathBuf>,

    /// Requested dimensions, comma separated (e.g. "Agency,Ad_Format")
    #[arg(long, value_delimiter = ',')]
    dimensions: Vec<String>,

    /// Requested metrics, comma separated (e.g. "Budget_Sum,CTR")
    #[arg(long, value_delimiter = ',')]
    metrics: Vec<String>,

    #[arg(long, default_value = "total")]
    calculation_type: String,

    #[arg(long, default_value = "contract")]
    query_level: String,

    #[arg(long)]
    limit: Option<usize>,

    /// JSON config file (defaults plus environment overrides otherwise)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the full result as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => FusionConfig::load(path)?.with_env_overrides()?,
        None => FusionConfig::from_env()?,
    };
    info!("Planner: {}, row limit: {}", config.planner, config.row_limit);

    let primary = load_table(&args.primary)
        .with_context(|| format!("Failed to load primary data from {}", args.primary.display()))?;
    let secondary = match &args.secondary {
        Some(path) => load_table(path)
            .with_context(|| format!("Failed to load secondary data from {}", path.display()))?,
        None => DataFrame::empty(),
    };
    let intent = build_intent(&args)?;

    let pipeline = FusionPipeline::new(&config)?;
    let output = pipeline.run(FusionRequest::new(primary, secondary).with_intent(intent))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output.to_json()?)?);
        return Ok(());
    }

    println!("\n=== Fusion Result ===");
    println!("{}", output.table);
    if !output.budget_note.is_empty() {
        println!("\nNote: {}", output.budget_note);
    }
    for warning in &output.warnings {
        println!("⚠️  {}", warning);
    }
    Ok(())
}

fn build_intent(args: &Args) -> Result<QueryIntent> {
    if let Some(path) = &args.intent {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read intent {}", path.display()))?;
        return Ok(serde_json::from_str(&content)?);
    }
    let mut intent = QueryIntent::new()
        .with_dimensions(args.dimensions.iter().map(|d| d.trim().to_string()))
        .with_metrics(args.metrics.iter().map(|m| m.trim().to_string()))
        .with_calculation_type(args.calculation_type.parse::<CalculationType>()?)
        .with_query_level(args.query_level.parse::<QueryLevel>()?);
    if let Some(limit) = args.limit {
        intent = intent.with_limit(limit);
    }
    Ok(intent)
}

fn load_table(path: &Path) -> Result<DataFrame> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "csv" => {
            let df = LazyCsvReader::new(path)
                .with_infer_schema_length(Some(1000))
                .finish()?
                .collect()?;
            return Ok(df);
        }
        "parquet" => {
            let df = LazyFrame::scan_parquet(path, ScanArgsParquet::default())?.collect()?;
            return Ok(df);
        }
        _ => {}
    }

    let content = std::fs::read_to_string(path)?;
    let records: Vec<Record> = serde_json::from_str(&content)?;
    Ok(records_to_dataframe(&records)?)
}
