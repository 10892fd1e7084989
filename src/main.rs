use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use orgshift::{
    AttachmentRequest, EntityPlan, EntityReport, FileRequest, MappingStore, MaskPlan, Masker,
    MigrationConfig, Migrator, OrgTransport, RestTransport, SeedRequest,
};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "orgshift")]
#[command(about = "Migrate records, files and attachments between two CRM orgs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run entity plans in the order given
    Migrate {
        #[arg(long = "plan", required = true, num_args = 1..)]
        plans: Vec<PathBuf>,
        /// Read the source but create into an in-memory target
        #[arg(long)]
        dry_run: bool,
    },
    /// Move attachments of already migrated parents
    Attachments {
        #[arg(long)]
        parent: String,
        #[arg(long)]
        condition: Option<String>,
    },
    /// Move files, their shares and public links for already migrated parents
    Files {
        #[arg(long)]
        parent: String,
        #[arg(long)]
        condition: Option<String>,
        /// Filter on the parent links, e.g. "ContentDocument.CreatedDate >= LAST_N_MONTHS:24"
        #[arg(long)]
        document_condition: Option<String>,
        /// Target ContentVersion field that receives the source version id
        #[arg(long)]
        legacy_field: Option<String>,
        #[arg(long)]
        no_distributions: bool,
    },
    /// Mask personal data on migrated target records
    Mask {
        #[arg(long = "plan", required = true, num_args = 1..)]
        plans: Vec<PathBuf>,
    },
    /// Seed mappings from a target legacy-id field
    Seed {
        #[arg(long)]
        entity: String,
        #[arg(long)]
        legacy_field: String,
        #[arg(long)]
        scope: Option<String>,
        #[arg(long)]
        condition: Option<String>,
    },
    /// Print mapping store contents
    Mappings {
        #[arg(long)]
        entity: Option<String>,
    },
    /// Validate configuration without connecting
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let config = MigrationConfig::from_env().context("failed to load configuration")?;

    match cli.command {
        Command::Migrate { plans, dry_run } => migrate(config, &plans, dry_run).await,
        Command::Attachments { parent, condition } => {
            let mut request = AttachmentRequest::new(&parent);
            if let Some(condition) = condition.as_deref() {
                request = request.condition(condition);
            }
            let mut migrator = connect(config).await?;
            let report = migrator
                .migrate_attachments(&request)
                .await
                .with_context(|| format!("attachment migration for {parent} failed"))?;
            print_report(&report);
            Ok(())
        }
        Command::Files {
            parent,
            condition,
            document_condition,
            legacy_field,
            no_distributions,
        } => {
            let mut request = FileRequest::new(&parent);
            if let Some(condition) = condition.as_deref() {
                request = request.condition(condition);
            }
            if let Some(condition) = document_condition.as_deref() {
                request = request.document_condition(condition);
            }
            if let Some(field) = legacy_field.as_deref() {
                request = request.legacy_id_field(field);
            }
            if no_distributions {
                request = request.without_distributions();
            }
            let mut migrator = connect(config).await?;
            let report = migrator
                .migrate_files(&request)
                .await
                .with_context(|| format!("file migration for {parent} failed"))?;
            for entity in report.reports() {
                print_report(entity);
            }
            Ok(())
        }
        Command::Mask { plans } => mask(config, &plans).await,
        Command::Seed {
            entity,
            legacy_field,
            scope,
            condition,
        } => {
            let mut request = SeedRequest::new(&entity, &legacy_field);
            if let Some(scope) = scope.as_deref() {
                request = request.scope(scope);
            }
            if let Some(condition) = condition.as_deref() {
                request = request.condition(condition);
            }
            let mut migrator = connect(config).await?;
            let summary = migrator
                .seed(&request)
                .await
                .with_context(|| format!("seeding {entity} failed"))?;
            println!(
                "{}: {} of {} source ids mapped",
                request.effective_scope(),
                summary.mapped,
                summary.source_ids
            );
            Ok(())
        }
        Command::Mappings { entity } => show_mappings(&config, entity.as_deref()),
        Command::CheckConfig => {
            config.validate().context("configuration is invalid")?;
            println!("source:      {:?}", config.source);
            println!("target:      {:?}", config.target);
            println!("batch size:  {}", config.batch_size);
            println!(
                "fallback:    {}",
                config.fallback_owner_id.as_deref().unwrap_or("<none>")
            );
            println!("data dir:    {}", config.data_dir.display());
            println!(
                "retry:       {} attempts, {}ms base delay",
                config.retry.attempts(),
                config.retry.base_backoff_ms
            );
            println!("configuration OK");
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("orgshift=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn connect(config: MigrationConfig) -> Result<Migrator> {
    Migrator::connect(config)
        .await
        .context("failed to connect to source and target orgs")
}

async fn migrate(config: MigrationConfig, paths: &[PathBuf], dry_run: bool) -> Result<()> {
    let plans = paths
        .iter()
        .map(|path| {
            EntityPlan::from_file(path).with_context(|| format!("failed to load plan {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    if dry_run {
        let migrator = Migrator::connect_dry_run(config)
            .await
            .context("failed to connect to source org")?;
        info!(run_id = %migrator.run_id(), entities = plans.len(), "dry run started");
        return run_plans(migrator, &plans).await;
    }
    let migrator = connect(config).await?;
    info!(run_id = %migrator.run_id(), entities = plans.len(), "migration started");
    run_plans(migrator, &plans).await
}

async fn run_plans<S: OrgTransport, T: OrgTransport>(
    mut migrator: Migrator<S, T>,
    plans: &[EntityPlan],
) -> Result<()> {
    let mut failed_entities = 0usize;
    for plan in plans {
        match migrator.migrate(plan).await {
            Ok(report) => print_report(&report),
            Err(err) => {
                error!(entity = %plan.entity, error = %err, "entity migration aborted");
                failed_entities += 1;
            }
        }
    }
    migrator.into_store().context("failed to flush mapping store")?;

    if failed_entities > 0 {
        bail!("{failed_entities} of {} entities could not be read", plans.len());
    }
    Ok(())
}

async fn mask(config: MigrationConfig, paths: &[PathBuf]) -> Result<()> {
    let plans = paths
        .iter()
        .map(|path| {
            MaskPlan::from_file(path).with_context(|| format!("failed to load mask plan {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    config.validate().context("configuration is invalid")?;
    let target = RestTransport::connect(&config.target)
        .await
        .context("failed to connect to target org")?;
    let masker = Masker::new(&target, &config);

    let mut failed_entities = 0usize;
    for plan in &plans {
        match masker.mask(plan).await {
            Ok(report) => print_report(&report),
            Err(err) => {
                error!(entity = %plan.entity, error = %err, "masking aborted");
                failed_entities += 1;
            }
        }
    }
    if failed_entities > 0 {
        bail!("{failed_entities} of {} entities could not be masked", plans.len());
    }
    Ok(())
}

fn show_mappings(config: &MigrationConfig, entity: Option<&str>) -> Result<()> {
    config.validate_local().context("configuration is invalid")?;
    let path = config.mapping_path();
    let store = MappingStore::open_file(&path)
        .with_context(|| format!("failed to open mapping store {}", path.display()))?;

    match entity {
        Some(entity) => {
            for (source, target) in store.entries(entity) {
                println!("{source}\t{target}");
            }
            eprintln!("{}: {} mappings", entity, store.len(entity));
        }
        None => {
            for scope in store.scopes() {
                println!("{:<32} {}", scope, store.len(scope));
            }
            println!("{:<32} {}", "total", store.total_len());
        }
    }
    Ok(())
}

fn print_report(report: &EntityReport) {
    println!(
        "{:<20} read={} batches={} created={} updated={} failed={} skipped={} fallback={} unmapped={} ({:.1}%)",
        report.entity,
        report.read,
        report.batches,
        report.created,
        report.updated,
        report.failed,
        report.skipped,
        report.references.fallback_substitutions,
        report.references.unmapped_references,
        report.success_rate()
    );
    for failure in &report.batch_failures {
        println!(
            "  batch @{} ({} records, {} recovered) failed: {}",
            failure.offset, failure.size, failure.recovered, failure.error
        );
    }
}
