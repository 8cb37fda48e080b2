use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use paswatch_adapters::{adapter_for, RmpCategory, SourceAdapter, StudyFilter};
use paswatch_core::{FieldValue, Record, RunStats};
use paswatch_history::{
    export_json, export_sqlite, export_xlsx, group_values, run_crawl, FieldGrouper, HistoryConfig,
    HistoryEngine, NoDuplicates, RunPipeline, STAT_DELETED_DATE, STAT_NO_DATE_CHANGE,
};
use paswatch_storage::{ArtifactStore, HttpClientConfig, HttpFetcher};
use tracing::info;
use tracing_subscriber::EnvFilter;

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0 Safari/537.36";

#[derive(Debug, Parser)]
#[command(name = "paswatch")]
#[command(about = "EU PAS Register watch: crawl, compare against the last run, export")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Source {
    EuPas,
    EmaRwd,
}

impl Source {
    fn id(self) -> &'static str {
        match self {
            Source::EuPas => "eu_pas",
            Source::EmaRwd => "ema_rwd",
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl a catalogue, compare it against the prior corpus and
    /// export the scraped studies.
    Crawl {
        #[arg(long, value_enum, default_value_t = Source::EuPas)]
        source: Source,
        /// Prior corpus to compare against (defaults to the configured
        /// snapshot path).
        #[arg(long)]
        compare: Option<PathBuf>,
        /// Skip history comparison entirely.
        #[arg(long)]
        no_history: bool,
        /// Where run outputs land; defaults to a timestamped directory
        /// under ./output.
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Narrow the crawl: a register number (EUPAS12345) or an RMP
        /// category (rmp1, rmp2, rmp3, noneu, na).
        #[arg(short = 'F', long)]
        filter: Option<String>,
        /// Fields stamped with $MATCHED_ grouping meta fields.
        #[arg(long, value_delimiter = ',')]
        group_fields: Vec<String>,
        /// Hide meta fields from the history comparison.
        #[arg(long)]
        exclude_meta: bool,
        /// Fields whose change alongside a duplicate listing entry is benign.
        #[arg(long, value_delimiter = ',')]
        duplicate_allowed: Vec<String>,
        /// Fields tallied separately when they change on their own.
        #[arg(long, value_delimiter = ',')]
        excepted: Vec<String>,
        /// Fail the run when more silent updates than this are found;
        /// negative disables the gate.
        #[arg(long, default_value_t = 0)]
        max_silent_updates: i64,
    },
    /// Re-run history comparison over an already exported corpus.
    Replay {
        /// Freshly exported corpus (JSON array of study records).
        input: PathBuf,
        /// Prior corpus to compare against.
        #[arg(long)]
        compare: PathBuf,
        #[arg(long, default_value = "updates.json")]
        changelog: PathBuf,
        #[arg(long, value_enum, default_value_t = Source::EuPas)]
        source: Source,
        #[arg(long)]
        exclude_meta: bool,
        #[arg(long, value_delimiter = ',')]
        duplicate_allowed: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        excepted: Vec<String>,
        #[arg(long, default_value_t = 0)]
        max_silent_updates: i64,
    },
    /// Convert an exported JSON corpus to xlsx, sqlite or json.
    Export {
        input: PathBuf,
        /// Target file; the extension picks the format (.xlsx, .db,
        /// .sqlite, .json).
        output: PathBuf,
        #[arg(long, value_enum, default_value_t = Source::EuPas)]
        source: Source,
    },
    /// Group similar free-text values of one field across the corpus.
    Cluster {
        input: PathBuf,
        /// Field whose distinct values get grouped.
        field: String,
        #[arg(short, long, default_value_t = FieldGrouper::DEFAULT_CUTOFF)]
        cutoff: f64,
        /// Write groups as JSON here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Commands::Crawl {
            source,
            compare,
            no_history,
            output_dir,
            filter,
            group_fields,
            exclude_meta,
            duplicate_allowed,
            excepted,
            max_silent_updates,
        } => {
            let adapter = adapter_for(source.id())
                .with_context(|| format!("no adapter registered for {}", source.id()))?;
            let output_dir = output_dir.unwrap_or_else(default_output_dir);
            fs::create_dir_all(&output_dir)
                .with_context(|| format!("creating {}", output_dir.display()))?;

            let mut config = HistoryConfig::from_env();
            if let Some(compare) = compare {
                config.snapshot_path = Some(compare);
            }
            if no_history {
                config.enabled = false;
            }
            config.changelog_path = output_dir.join("updates.json");
            config.meta_field_exclusion |= exclude_meta;
            if !duplicate_allowed.is_empty() {
                config.duplicate_allowed_fields = to_field_set(duplicate_allowed);
            }
            if !excepted.is_empty() {
                config.excepted_fields = to_field_set(excepted);
            }

            let engine = HistoryEngine::from_config(&config)?;
            let grouper = (!group_fields.is_empty())
                .then(|| FieldGrouper::new(group_fields, FieldGrouper::DEFAULT_CUTOFF));
            let mut pipeline = RunPipeline::new(adapter.schema(), engine, grouper);

            let fetcher = HttpFetcher::new(HttpClientConfig {
                user_agent: Some(USER_AGENT.to_string()),
                ..Default::default()
            })?;
            let artifacts = ArtifactStore::new(output_dir.join("pages"));
            let filter = parse_filter(filter.as_deref())?;

            let summary =
                run_crawl(adapter, &fetcher, Some(&artifacts), &filter, &mut pipeline).await?;
            let outcome = pipeline.on_idle()?;

            let corpus_path = output_dir.join(format!("{}_studies.json", source.id()));
            export_json(pipeline.records(), &corpus_path)?;

            info!(
                run_id = %summary.run_id,
                records = summary.records_scraped,
                pages = summary.pages_fetched,
                corpus = %corpus_path.display(),
                "run complete"
            );
            if let Some(path) = &outcome.changelog_path {
                println!(
                    "{} change(s) written to {}",
                    outcome.change_entry_count,
                    path.display()
                );
            }
            print_stats(pipeline.stats());
            run_gate(pipeline.stats(), max_silent_updates)
        }

        Commands::Replay {
            input,
            compare,
            changelog,
            source,
            exclude_meta,
            duplicate_allowed,
            excepted,
            max_silent_updates,
        } => {
            let adapter = adapter_for(source.id())
                .with_context(|| format!("no adapter registered for {}", source.id()))?;
            let records = load_corpus(&input)?;

            let config = HistoryConfig {
                enabled: true,
                snapshot_path: Some(compare),
                changelog_path: changelog,
                meta_field_exclusion: exclude_meta,
                duplicate_allowed_fields: to_field_set(duplicate_allowed),
                excepted_fields: to_field_set(excepted),
                ..HistoryConfig::default()
            };
            let engine = HistoryEngine::from_config(&config)?;
            let mut pipeline = RunPipeline::new(adapter.schema(), engine, None);

            for record in records {
                pipeline.on_item_scraped(record, &NoDuplicates)?;
            }
            let outcome = pipeline.on_idle()?;

            match &outcome.changelog_path {
                Some(path) => println!(
                    "{} change(s) written to {}",
                    outcome.change_entry_count,
                    path.display()
                ),
                None => println!("no changes since the prior corpus"),
            }
            print_stats(pipeline.stats());
            run_gate(pipeline.stats(), max_silent_updates)
        }

        Commands::Export {
            input,
            output,
            source,
        } => {
            let adapter = adapter_for(source.id())
                .with_context(|| format!("no adapter registered for {}", source.id()))?;
            let records = load_corpus(&input)?;
            export_records(&records, adapter, &output)?;
            println!("{} record(s) exported to {}", records.len(), output.display());
            Ok(())
        }

        Commands::Cluster {
            input,
            field,
            cutoff,
            output,
        } => {
            if !(0.0..=1.0).contains(&cutoff) {
                bail!("cutoff must be between 0 and 1");
            }
            let records = load_corpus(&input)?;
            let values = distinct_values(&records, &field);
            if values.is_empty() {
                bail!("no values found for field {field}");
            }
            let groups = group_values(values, cutoff);
            let rendered = serde_json::to_string_pretty(&groups)?;
            match output {
                Some(path) => {
                    fs::write(&path, rendered + "\n")
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("{} group(s) written to {}", groups.len(), path.display());
                }
                None => println!("{rendered}"),
            }
            Ok(())
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(format!(
        "output/{}",
        Utc::now().format("%Y_%m_%d_T%H_%M_%S")
    ))
}

fn to_field_set(fields: Vec<String>) -> BTreeSet<String> {
    fields
        .into_iter()
        .map(|field| field.trim().to_string())
        .filter(|field| !field.is_empty())
        .collect()
}

fn load_corpus(path: &Path) -> Result<Vec<Record>> {
    let data =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn parse_filter(raw: Option<&str>) -> Result<StudyFilter> {
    let Some(raw) = raw else {
        return Ok(StudyFilter::default());
    };
    let lowered = raw.to_lowercase();
    let id_candidate = lowered.replace("eupas", "");
    if id_candidate.chars().all(|c| c.is_ascii_digit()) && !id_candidate.is_empty() {
        return Ok(StudyFilter {
            register_number: Some(id_candidate),
            rmp_category: None,
        });
    }
    let category = match lowered.as_str() {
        "rmp1" | "risk_management_plan_1" => RmpCategory::Category1,
        "rmp2" | "risk_management_plan_2" => RmpCategory::Category2,
        "rmp3" | "risk_management_plan_3" => RmpCategory::Category3,
        "noneu" | "non_eu" | "noneurmp" | "non_eu_rmp" | "otherrmp" => RmpCategory::NonEu,
        "na" | "n_a" | "n/a" | "notapplicable" | "not_applicable" => RmpCategory::NotApplicable,
        _ => bail!("unsupported filter value: {raw}"),
    };
    Ok(StudyFilter {
        register_number: None,
        rmp_category: Some(category),
    })
}

fn export_records(records: &[Record], adapter: &dyn SourceAdapter, output: &Path) -> Result<()> {
    let extension = output
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_lowercase();
    match extension.as_str() {
        "json" => export_json(records, output)?,
        "xlsx" => export_xlsx(records, adapter.schema(), output)?,
        "db" | "sqlite" | "sqlite3" => export_sqlite(records, adapter.schema(), output)?,
        other => bail!("unsupported export format: .{other}"),
    }
    Ok(())
}

fn distinct_values(records: &[Record], field: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut values = Vec::new();
    for record in records {
        let Some(value) = record.get(field) else {
            continue;
        };
        match value {
            FieldValue::One(scalar) => {
                let text = scalar.to_string();
                if seen.insert(text.clone()) {
                    values.push(text);
                }
            }
            FieldValue::Many(items) => {
                for item in items {
                    let text = item.to_string();
                    if seen.insert(text.clone()) {
                        values.push(text);
                    }
                }
            }
        }
    }
    values
}

fn print_stats(stats: &RunStats) {
    for (key, value) in stats.iter() {
        println!("{key}: {value}");
    }
}

/// The run gate downstream automation relies on: silent updates and
/// deleted update dates must stay under the configured maximum.
fn run_gate(stats: &RunStats, max_silent_updates: i64) -> Result<()> {
    if max_silent_updates < 0 {
        return Ok(());
    }
    let silent = stats.get(STAT_NO_DATE_CHANGE) + stats.get(STAT_DELETED_DATE);
    if silent > max_silent_updates {
        bail!(
            "{silent} update(s) without a date change exceed the configured maximum of {max_silent_updates}"
        );
    }
    Ok(())
}
