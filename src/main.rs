//! # CRM RAG CLI (`crm-rag`)
//!
//! Ingest tenant data into the knowledge base, query it, assemble memory
//! context, and ask grounded questions.
//!
//! ## Usage
//!
//! ```bash
//! crm-rag --config ./config/crm-rag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `crm-rag init` | Create the SQLite database and schema |
//! | `crm-rag sync products <org>` | Ingest catalog products |
//! | `crm-rag sync documents <org>` | Ingest documents not yet indexed |
//! | `crm-rag sync erp <org>` | Full ERP sync (products, customers, orders) |
//! | `crm-rag sync erp-record <org> <kind> <id>` | Refresh one ERP record |
//! | `crm-rag sync catalog <org> --file <json>` | Ingest catalog store-view entries |
//! | `crm-rag cleanup <org> --days N` | Evict stale ERP entries |
//! | `crm-rag search <org> "<query>"` | Similarity search |
//! | `crm-rag remember <org> "<text>"` | Store a CRM memory |
//! | `crm-rag context <org> "<query>"` | Build a budgeted memory context |
//! | `crm-rag ask <org> "<query>"` | Grounded answer from the language model |
//! | `crm-rag recommend <org> "<email>"` | Catalog reply skeleton for an email |
//! | `crm-rag detect-language "<text>"` | Detect language and store |

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crm_rag::adapter_catalog::load_catalog_file;
use crm_rag::config::{self, Config};
use crm_rag::ingest::IngestReport;
use crm_rag::services::{NewMemory, RagServices};
use crm_rag::{db, migrate};
use crm_rag_core::context::ContextOverrides;
use crm_rag_core::erp::ErpRecordKind;
use crm_rag_core::generation::GroundingContext;
use crm_rag_core::language::{resolve_store, KeywordLanguageDetector};
use crm_rag_core::models::{MemoryType, MetaValue, Metadata, OrganizationId, SourceType};
use crm_rag_core::pipeline::IngestOptions;

#[derive(Parser)]
#[command(
    name = "crm-rag",
    version,
    about = "Multi-tenant retrieval-augmented generation over CRM data"
)]
struct Cli {
    /// Path to configuration file (TOML). A missing file means defaults.
    #[arg(long, global = true, default_value = "./config/crm-rag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and schema. Idempotent.
    Init,

    /// Ingest records from a source.
    Sync {
        #[command(subcommand)]
        source: SyncSource,
    },

    /// Delete entries older than a number of days.
    Cleanup {
        org: String,

        /// Age cutoff; defaults to `[sync] stale_after_days`.
        #[arg(long)]
        days: Option<i64>,

        /// Source type to evict (default `metakocka`).
        #[arg(long, default_value = "metakocka")]
        source_type: String,
    },

    /// Similarity search within one organization.
    Search {
        org: String,
        query: String,

        /// Restrict to source types (repeatable).
        #[arg(long = "source-type")]
        source_types: Vec<String>,

        /// Exact-match metadata filter `KEY=VALUE` (repeatable).
        #[arg(long = "filter", value_parser = parse_key_val)]
        filters: Vec<(String, String)>,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Store a memory for context assembly.
    Remember {
        org: String,
        content: String,

        /// contact, interaction, preference, deal, product, insight.
        #[arg(long = "type", default_value = "insight")]
        memory_type: String,

        #[arg(long, default_value_t = 0.5)]
        importance: f64,

        /// Owner; omit for organization-wide.
        #[arg(long)]
        user: Option<String>,

        /// Visible to every user of the organization.
        #[arg(long)]
        shared: bool,

        /// Metadata `KEY=VALUE` (repeatable), e.g. `entity_id=c-42`.
        #[arg(long = "meta", value_parser = parse_key_val)]
        metadata: Vec<(String, String)>,
    },

    /// Build an optimized memory context for a query.
    Context {
        org: String,
        query: String,

        #[arg(long)]
        user: Option<String>,

        /// Token budget override.
        #[arg(long)]
        max_tokens: Option<usize>,
    },

    /// Answer a question grounded in the knowledge base.
    Ask {
        org: String,
        query: String,

        /// Blend live ERP facts for this customer.
        #[arg(long)]
        customer_email: Option<String>,

        /// Ground on assembled memories instead of knowledge-base chunks.
        #[arg(long)]
        memories: bool,

        #[arg(long)]
        user: Option<String>,

        #[arg(long = "source-type")]
        source_types: Vec<String>,
    },

    /// Reply skeleton with catalog suggestions for an incoming email.
    Recommend { org: String, email: String },

    /// Detect the language of a text and show the matching store.
    DetectLanguage { text: String },
}

#[derive(Args)]
struct IngestArgs {
    org: String,

    /// Leave sources that already have entries untouched.
    #[arg(long)]
    skip_existing: bool,

    #[arg(long)]
    chunk_size: Option<usize>,

    #[arg(long)]
    chunk_overlap: Option<usize>,
}

impl IngestArgs {
    fn options(&self) -> IngestOptions {
        IngestOptions {
            skip_if_exists: self.skip_existing,
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
        }
    }
}

#[derive(Subcommand)]
enum SyncSource {
    /// Catalog products with prices, suppliers, and ERP codes.
    Products(IngestArgs),
    /// Uploaded documents not yet indexed.
    Documents(IngestArgs),
    /// Full ERP snapshot.
    Erp(IngestArgs),
    /// One ERP record by kind (`product`, `customer`, `order`) and id.
    ErpRecord {
        #[command(flatten)]
        ingest: IngestArgs,
        kind: String,
        id: String,
    },
    /// Catalog store-view entries from a JSON file.
    Catalog {
        #[command(flatten)]
        ingest: IngestArgs,
        #[arg(long)]
        file: PathBuf,
    },
}

/// Parse a `key=value` pair.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

/// Numbers and booleans become typed values, everything else text.
fn parse_meta_value(raw: &str) -> MetaValue {
    if let Ok(i) = raw.parse::<i64>() {
        MetaValue::Int(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        MetaValue::Float(f)
    } else if let Ok(b) = raw.parse::<bool>() {
        MetaValue::Bool(b)
    } else {
        MetaValue::Text(raw.to_string())
    }
}

fn metadata_from_pairs(pairs: &[(String, String)]) -> Metadata {
    let mut meta = Metadata::new();
    for (k, v) in pairs {
        meta.insert(k.clone(), parse_meta_value(v));
    }
    meta
}

fn parse_source_types(raw: &[String]) -> Result<Vec<SourceType>> {
    raw.iter()
        .map(|s| s.parse::<SourceType>().map_err(anyhow::Error::msg))
        .collect()
}

fn print_report(label: &str, report: &IngestReport) {
    println!(
        "{label}: {} processed, {} successful ({} skipped), {} failed",
        report.processed, report.successful, report.skipped, report.failed
    );
    for e in &report.errors {
        println!("  ! {}: {}", e.record_id, e.error);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    let filter = EnvFilter::try_new(&cfg.log.level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized at {}.", cfg.db.path.display());
        }
        Commands::DetectLanguage { text } => {
            let detector = KeywordLanguageDetector::new();
            let m = resolve_store(&detector, &text, &cfg.catalog.default_language);
            println!(
                "{} ({}) store={} country={} currency={} priority={}",
                m.store.language,
                if m.detected { "detected" } else { "fallback" },
                m.store.store_code,
                m.store.country,
                m.store.currency,
                m.store.priority
            );
        }
        command => {
            let services = RagServices::init(&cfg).await?;
            let result = run(&services, &cfg, command).await;
            services.shutdown().await;
            result?;
        }
    }

    Ok(())
}

async fn run(services: &RagServices, cfg: &Config, command: Commands) -> Result<()> {
    match command {
        Commands::Sync { source } => match source {
            SyncSource::Products(args) => {
                let org = OrganizationId::new(&args.org)?;
                let report = services.product_adapter().sync_all(&org, &args.options()).await?;
                print_report("products", &report);
            }
            SyncSource::Documents(args) => {
                let org = OrganizationId::new(&args.org)?;
                let report = services.document_adapter().sync_pending(&org, &args.options()).await?;
                print_report("documents", &report);
            }
            SyncSource::Erp(args) => {
                let org = OrganizationId::new(&args.org)?;
                let report = services.erp_adapter()?.full_sync(&org, &args.options()).await?;
                print_report("erp products", &report.products);
                print_report("erp customers", &report.customers);
                print_report("erp orders", &report.orders);
            }
            SyncSource::ErpRecord { ingest, kind, id } => {
                let org = OrganizationId::new(&ingest.org)?;
                let kind: ErpRecordKind = kind.parse().map_err(anyhow::Error::msg)?;
                match services
                    .erp_adapter()?
                    .sync_by_id(&org, kind, &id, &ingest.options())
                    .await?
                {
                    Some(outcome) => println!("{kind} {id}: {outcome:?}"),
                    None => println!("{kind} {id}: not found in ERP, entries removed"),
                }
            }
            SyncSource::Catalog { ingest, file } => {
                let org = OrganizationId::new(&ingest.org)?;
                let products = load_catalog_file(&file)?;
                let report = services
                    .catalog_adapter()
                    .ingest(&org, products, &ingest.options())
                    .await;
                print_report("catalog", &report);
            }
        },
        Commands::Cleanup {
            org,
            days,
            source_type,
        } => {
            let org = OrganizationId::new(org)?;
            let days = days.unwrap_or(cfg.sync.stale_after_days);
            if days < 0 {
                bail!("--days must be >= 0");
            }
            let source_type: SourceType = source_type.parse().map_err(anyhow::Error::msg)?;
            let cutoff = chrono::Utc::now() - chrono::Duration::days(days);
            let removed = services
                .pipeline
                .store()
                .delete_older_than(&org, Some(source_type), cutoff)
                .await?;
            println!("Removed {removed} {source_type} entries older than {days} days.");
        }
        Commands::Search {
            org,
            query,
            source_types,
            filters,
            limit,
            threshold,
        } => {
            let org = OrganizationId::new(org)?;
            let mut options = services
                .retrieval_options()
                .with_source_types(&parse_source_types(&source_types)?);
            options.metadata_filters = metadata_from_pairs(&filters);
            if let Some(limit) = limit {
                options = options.with_limit(limit);
            }
            if let Some(t) = threshold {
                options = options.with_threshold(t);
            }

            let result = services.retrieval.retrieve(&query, &org, &options).await;
            if result.degraded {
                eprintln!("warning: retrieval degraded, see log");
            }
            if result.chunks.is_empty() {
                println!("No results.");
            }
            for (i, chunk) in result.chunks.iter().enumerate() {
                println!(
                    "{}. [{:.3}] {} ({}:{} #{})",
                    i + 1,
                    chunk.similarity,
                    chunk.title,
                    chunk.source_type,
                    chunk.source_id,
                    chunk.chunk_index
                );
                let preview: String = chunk.content.chars().take(200).collect();
                println!("    {}", preview.replace('\n', " "));
            }
        }
        Commands::Remember {
            org,
            content,
            memory_type,
            importance,
            user,
            shared,
            metadata,
        } => {
            let org = OrganizationId::new(org)?;
            let memory_type: MemoryType = memory_type.parse().map_err(anyhow::Error::msg)?;
            let id = services
                .add_memory(
                    &org,
                    NewMemory {
                        memory_type,
                        content,
                        importance_score: importance,
                        user_id: user,
                        shared,
                        metadata: metadata_from_pairs(&metadata),
                    },
                )
                .await?;
            println!("Stored memory {id}.");
        }
        Commands::Context {
            org,
            query,
            user,
            max_tokens,
        } => {
            let org = OrganizationId::new(org)?;
            let overrides = ContextOverrides {
                max_context_size: max_tokens,
                ..ContextOverrides::default()
            };
            let result = services
                .assembler
                .build_optimized_context(&query, &org, user.as_deref(), Some(&overrides))
                .await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Ask {
            org,
            query,
            customer_email,
            memories,
            user,
            source_types,
        } => {
            let org = OrganizationId::new(org)?;
            let options = services
                .retrieval_options()
                .with_source_types(&parse_source_types(&source_types)?);

            let answer = if memories {
                let ctx = services
                    .assembler
                    .build_optimized_context(&query, &org, user.as_deref(), None)
                    .await;
                services
                    .orchestrator
                    .query_with_generation(&query, &org, &GroundingContext::from_context(ctx))
                    .await
            } else if let Some(email) = customer_email {
                services
                    .orchestrator
                    .ask_with_live_erp(&query, &org, &email, &options)
                    .await
            } else {
                services.orchestrator.ask(&query, &org, &options).await
            };
            println!("{}", serde_json::to_string_pretty(&answer)?);
        }
        Commands::Recommend { org, email } => {
            let org = OrganizationId::new(org)?;
            let rec = services
                .catalog_adapter()
                .recommend(&org, &email, &services.retrieval_options())
                .await;
            println!("{}", rec.reply);
            eprintln!(
                "language={} ({}), store={}, sentiment={:?}, products={}",
                rec.language,
                if rec.detected { "detected" } else { "fallback" },
                rec.store_code,
                rec.sentiment.label,
                rec.products.len()
            );
        }
        Commands::Init | Commands::DetectLanguage { .. } => {}
    }
    Ok(())
}
