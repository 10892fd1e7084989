// ============================================================================
// orgshift library
// ============================================================================

pub mod attachments;
pub mod batch;
pub mod config;
pub mod connection;
pub mod core;
pub mod files;
pub mod mapping;
pub mod mask;
pub mod plan;
pub mod report;
pub mod resolver;
pub mod retry;
pub mod transform;
pub mod transport;

pub use attachments::{AttachmentMigrator, AttachmentRequest};
pub use batch::BatchDriver;
pub use config::MigrationConfig;
pub use connection::{
    RestTransport,
    auth::OrgSession,
    config::{OrgConfig, OrgDomain},
};
pub use core::{MigrateError, QueryPage, Record, Result, SaveError, SaveResult};
pub use files::{FileMigrator, FileRequest, FileTransferReport};
pub use mapping::{FileBackend, MappingBackend, MappingStore, MemoryBackend};
pub use mapping::seed::{SeedRequest, SeedSummary};
pub use mask::{MaskPlan, MaskRule, Masker};
pub use plan::{EntityPlan, FieldRule};
pub use report::{EntityReport, OutcomeStatus, RecordOutcome};
pub use resolver::{IdResolver, Resolution};
pub use retry::{RetryPolicy, execute_with_retry};
pub use transport::{OrgTransport, memory::MemoryOrg};

use uuid::Uuid;

// ============================================================================
// High-level API
// ============================================================================

/// Source org, target org and mapping store wired together for one run.
///
/// All entity, attachment, file and masking reports produced by one
/// `Migrator` share a run id.
///
/// # Examples
///
/// ```ignore
/// let config = MigrationConfig::from_env()?;
/// let mut migrator = Migrator::connect(config).await?;
/// let report = migrator.migrate(&EntityPlan::from_file("plans/account.json")?).await?;
/// println!("{} created, {} failed", report.created, report.failed);
/// ```
pub struct Migrator<S = RestTransport, T = RestTransport> {
    config: MigrationConfig,
    source: S,
    target: T,
    store: MappingStore,
    run_id: Uuid,
    write_reports: bool,
}

impl Migrator<RestTransport, RestTransport> {
    /// Validates the configuration, opens the mapping file and logs in to
    /// both orgs.
    pub async fn connect(config: MigrationConfig) -> Result<Self> {
        config.validate()?;
        let store = MappingStore::open_file(config.mapping_path())?;
        let source = RestTransport::connect(&config.source).await?;
        let target = RestTransport::connect(&config.target).await?;
        Ok(Self::new(config, source, target, store))
    }
}

impl Migrator<RestTransport, MemoryOrg> {
    /// Logs in to the source org only. See [`Migrator::dry_run`].
    pub async fn connect_dry_run(config: MigrationConfig) -> Result<Self> {
        config.validate()?;
        let source = RestTransport::connect(&config.source).await?;
        Self::dry_run(config, source)
    }
}

impl<S: OrgTransport> Migrator<S, MemoryOrg> {
    /// Reads from `source` and creates into an in-memory target.
    ///
    /// Mappings start from the persisted file, so references resolve as they
    /// would in a real run, but nothing is written back to it. No report
    /// files are written either.
    pub fn dry_run(config: MigrationConfig, source: S) -> Result<Self> {
        let snapshot = FileBackend::new(config.mapping_path()).load()?;
        let store = MappingStore::open(MemoryBackend::with_snapshot(snapshot))?;
        Ok(Self::new(config, source, MemoryOrg::new(), store).without_report_files())
    }
}

impl<S: OrgTransport, T: OrgTransport> Migrator<S, T> {
    pub fn new(config: MigrationConfig, source: S, target: T, store: MappingStore) -> Self {
        Self {
            config,
            source,
            target,
            store,
            run_id: Uuid::new_v4(),
            write_reports: true,
        }
    }

    pub fn without_report_files(mut self) -> Self {
        self.write_reports = false;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn store(&self) -> &MappingStore {
        &self.store
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    /// Migrates one entity.
    pub async fn migrate(&mut self, plan: &EntityPlan) -> Result<EntityReport> {
        let mut driver = BatchDriver::new(&self.source, &self.target, &mut self.store, &self.config)
            .with_run_id(self.run_id);
        if !self.write_reports {
            driver = driver.without_report_files();
        }
        driver.migrate(plan).await
    }

    /// Migrates entities in the given order. Stops at the first entity whose
    /// source cannot be read.
    pub async fn migrate_all(&mut self, plans: &[EntityPlan]) -> Result<Vec<EntityReport>> {
        let mut reports = Vec::with_capacity(plans.len());
        for plan in plans {
            reports.push(self.migrate(plan).await?);
        }
        Ok(reports)
    }

    pub async fn migrate_attachments(&mut self, request: &AttachmentRequest) -> Result<EntityReport> {
        let mut migrator =
            AttachmentMigrator::new(&self.source, &self.target, &mut self.store, &self.config)
                .with_run_id(self.run_id);
        if !self.write_reports {
            migrator = migrator.without_report_files();
        }
        migrator.migrate(request).await
    }

    pub async fn migrate_files(&mut self, request: &FileRequest) -> Result<FileTransferReport> {
        let mut migrator =
            FileMigrator::new(&self.source, &self.target, &mut self.store, &self.config)
                .with_run_id(self.run_id);
        if !self.write_reports {
            migrator = migrator.without_report_files();
        }
        migrator.migrate(request).await
    }

    /// Masks personal data on records already migrated to the target.
    pub async fn mask(&self, plan: &MaskPlan) -> Result<EntityReport> {
        let mut masker = Masker::new(&self.target, &self.config).with_run_id(self.run_id);
        if !self.write_reports {
            masker = masker.without_report_files();
        }
        masker.mask(plan).await
    }

    pub async fn seed(&mut self, request: &SeedRequest) -> Result<SeedSummary> {
        mapping::seed::seed_from_legacy_ids(
            &self.source,
            &self.target,
            &mut self.store,
            request,
            &self.config.retry,
        )
        .await
    }

    /// Flushes anything still pending and hands back the store.
    pub fn into_store(mut self) -> Result<MappingStore> {
        self.store.flush()?;
        Ok(self.store)
    }
}
