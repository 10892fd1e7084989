//! End-to-end migration tests against in-memory orgs

use orgshift::core::record_str;
use orgshift::transport::memory::Operation;
use orgshift::{
    BatchDriver, EntityPlan, FieldRule, MappingStore, MemoryOrg, MigrateError, MigrationConfig,
    Migrator, OrgConfig, OutcomeStatus, Record, RetryPolicy, SaveError,
};
use serde_json::{Value, json};
use tempfile::TempDir;

const FALLBACK_OWNER: &str = "005FALLBACK0001";

fn record(value: Value) -> Record {
    value.as_object().cloned().unwrap()
}

fn config(dir: &TempDir, batch_size: usize) -> MigrationConfig {
    MigrationConfig::new(
        OrgConfig::new("source@example.com", "pw", ""),
        OrgConfig::new("target@example.com", "pw", ""),
    )
    .batch_size(batch_size)
    .fallback_owner(FALLBACK_OWNER)
    .data_dir(dir.path())
    .retry(RetryPolicy::immediate(3))
}

fn task_plan() -> EntityPlan {
    EntityPlan::new("Task", &["Subject", "OwnerId"])
        .legacy_id_field("Legacy_Id__c")
        .rule("OwnerId", FieldRule::owner("User"))
}

fn target_by_source(target: &MemoryOrg, store: &MappingStore, scope: &str, source_id: &str) -> Record {
    let target_id = store
        .get(scope, source_id)
        .unwrap_or_else(|| panic!("{source_id} was not mapped"));
    target.get(scope, target_id).unwrap()
}

#[tokio::test]
async fn test_owner_is_remapped_or_falls_back() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 200);
    let source = MemoryOrg::new();
    let target = MemoryOrg::new();
    source.insert("Task", record(json!({ "Id": "00TAAA", "Subject": "Mapped", "OwnerId": "005AAA" })));
    source.insert("Task", record(json!({ "Id": "00TBBB", "Subject": "Orphan", "OwnerId": "005BBB" })));

    let mut store = MappingStore::in_memory();
    store.insert("User", "005AAA", "005ZZZ");

    let report = BatchDriver::new(&source, &target, &mut store, &config)
        .migrate(&task_plan())
        .await
        .unwrap();

    assert_eq!(report.created, 2);
    assert_eq!(report.references.fallback_substitutions, 1);

    let mapped = target_by_source(&target, &store, "Task", "00TAAA");
    assert_eq!(mapped.get("OwnerId"), Some(&json!("005ZZZ")));
    assert_eq!(mapped.get("Legacy_Id__c"), Some(&json!("00TAAA")));

    let orphan = target_by_source(&target, &store, "Task", "00TBBB");
    assert_eq!(orphan.get("OwnerId"), Some(&json!(FALLBACK_OWNER)));
}

#[tokio::test]
async fn test_owner_is_omitted_without_fallback() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, 200);
    config.fallback_owner_id = None;
    let source = MemoryOrg::new();
    let target = MemoryOrg::new();
    source.insert("Task", record(json!({ "Id": "00TBBB", "Subject": "Orphan", "OwnerId": "005BBB" })));

    let mut store = MappingStore::in_memory();
    let report = BatchDriver::new(&source, &target, &mut store, &config)
        .migrate(&task_plan())
        .await
        .unwrap();

    assert_eq!(report.created, 1);
    assert_eq!(report.references.unmapped_references, 1);
    let created = target_by_source(&target, &store, "Task", "00TBBB");
    assert!(!created.contains_key("OwnerId"));
}

#[tokio::test]
async fn test_batches_are_ceiling_of_source_over_batch_size() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 5);
    // page size deliberately not a multiple of the batch size
    let source = MemoryOrg::new().with_page_size(7);
    let target = MemoryOrg::new();
    for i in 0..23 {
        source.insert("Account", record(json!({ "Name": format!("Account {i}") })));
    }

    let mut store = MappingStore::in_memory();
    let report = BatchDriver::new(&source, &target, &mut store, &config)
        .migrate(&EntityPlan::new("Account", &["Name"]))
        .await
        .unwrap();

    assert_eq!(target.create_batch_sizes("Account"), vec![5, 5, 5, 5, 3]);
    assert_eq!(report.batches, 5);
    assert_eq!(report.read, 23);
    assert_eq!(report.created, 23);
    assert_eq!(store.len("Account"), 23);
    assert_eq!(store.flush_count(), 5);
    assert_eq!(source.calls(Operation::QueryMore), 3);
}

#[tokio::test]
async fn test_failed_batch_does_not_stop_later_batches() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 3);
    let source = MemoryOrg::new();
    let target = MemoryOrg::new();

    // The first three tasks reference an unmigrated account and are skipped,
    // so the scripted failure hits the batch at offset 3.
    for i in 0..10 {
        let what = if i < 3 { "001MISSING" } else { "001AAA" };
        source.insert(
            "Task",
            record(json!({ "Id": format!("00T{i:03}"), "Subject": format!("t{i}"), "WhatId": what })),
        );
    }
    // the batch call and each single-record resubmission are rejected
    target.fail_next_n(
        Operation::Create,
        4,
        MigrateError::http(400, Some("FIELD_CUSTOM_VALIDATION_EXCEPTION"), "Rejected by rule"),
    );

    let mut store = MappingStore::in_memory();
    store.insert("Account", "001AAA", "001ZZZ");
    let plan = EntityPlan::new("Task", &["Subject", "WhatId"])
        .rule("WhatId", FieldRule::reference("Account"))
        .require_any_of(&["WhatId"]);

    let report = BatchDriver::new(&source, &target, &mut store, &config)
        .migrate(&plan)
        .await
        .unwrap();

    assert_eq!(report.batches, 4);
    assert_eq!(report.skipped, 3);
    assert_eq!(report.failed, 3);
    assert_eq!(report.created, 4);
    assert_eq!(report.batch_failures.len(), 1);
    let failure = &report.batch_failures[0];
    assert_eq!(failure.entity, "Task");
    assert_eq!(failure.offset, 3);
    assert_eq!(failure.size, 3);
    assert_eq!(failure.recovered, 0);
    assert_eq!(failure.source_ids, vec!["00T003", "00T004", "00T005"]);
    assert!(failure.error.contains("FIELD_CUSTOM_VALIDATION_EXCEPTION"));
    assert_eq!(report.record_fallbacks, 1);
    // permanent errors are not retried: one batch call plus three single calls
    // at offset 3, then one call each for offsets 6 and 9
    assert_eq!(target.calls(Operation::Create), 6);
    assert!(!store.contains("Task", "00T004"));
    assert!(store.contains("Task", "00T009"));
}

#[tokio::test]
async fn test_rejected_batch_call_falls_back_to_single_records() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 3);
    let source = MemoryOrg::new();
    let target = MemoryOrg::new();
    for (id, name) in [("001A", "Good"), ("001B", "Bad"), ("001C", "Fine")] {
        source.insert("Account", record(json!({ "Id": id, "Name": name })));
    }
    target.fail_next(
        Operation::Create,
        MigrateError::http(400, Some("JSON_PARSER_ERROR"), "Cannot deserialize instance"),
    );
    target.reject_records_where(
        "Account",
        "Name",
        "Bad",
        SaveError::new("DUPLICATE_VALUE", "duplicate value found"),
    );

    let mut store = MappingStore::in_memory();
    let report = BatchDriver::new(&source, &target, &mut store, &config)
        .migrate(&EntityPlan::new("Account", &["Name"]))
        .await
        .unwrap();

    assert_eq!(report.created, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.record_fallbacks, 1);
    assert_eq!(target.create_batch_sizes("Account"), vec![1, 1, 1]);
    assert!(store.contains("Account", "001A"));
    assert!(store.contains("Account", "001C"));

    assert_eq!(report.batch_failures.len(), 1);
    let failure = &report.batch_failures[0];
    assert_eq!(failure.offset, 0);
    assert_eq!(failure.size, 3);
    assert_eq!(failure.recovered, 2);
    assert_eq!(failure.source_ids, vec!["001B"]);
    assert!(failure.error.contains("JSON_PARSER_ERROR"));

    let rejected = report
        .outcomes
        .iter()
        .find(|o| o.source_id == "001B")
        .unwrap();
    assert_eq!(
        rejected.message.as_deref(),
        Some("DUPLICATE_VALUE: duplicate value found")
    );
}

#[tokio::test]
async fn test_batch_failure_size_counts_submitted_records() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 3);
    let source = MemoryOrg::new();
    let target = MemoryOrg::new();
    for (id, what) in [("00T1", "001AAA"), ("00T2", "001MISSING"), ("00T3", "001AAA")] {
        source.insert("Task", record(json!({ "Id": id, "Subject": "x", "WhatId": what })));
    }
    target.fail_next_n(
        Operation::Create,
        3,
        MigrateError::http(503, Some("SERVER_UNAVAILABLE"), "maintenance"),
    );

    let mut store = MappingStore::in_memory();
    store.insert("Account", "001AAA", "001ZZZ");
    let plan = EntityPlan::new("Task", &["Subject", "WhatId"])
        .rule("WhatId", FieldRule::reference("Account"))
        .require_any_of(&["WhatId"]);

    let report = BatchDriver::new(&source, &target, &mut store, &config)
        .migrate(&plan)
        .await
        .unwrap();

    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed, 2);
    // transient exhaustion is not resubmitted record by record
    assert_eq!(report.record_fallbacks, 0);
    let failure = &report.batch_failures[0];
    assert_eq!(failure.size, 2);
    assert_eq!(failure.source_ids, vec!["00T1", "00T3"]);
}

#[tokio::test]
async fn test_transient_create_failure_is_retried_then_reported() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 2);
    let source = MemoryOrg::new();
    let target = MemoryOrg::new();
    for i in 0..4 {
        source.insert("Contact", record(json!({ "Id": format!("003{i:03}"), "LastName": "Doe" })));
    }
    target.fail_next_n(
        Operation::Create,
        3,
        MigrateError::http(503, Some("SERVER_UNAVAILABLE"), "maintenance"),
    );

    let mut store = MappingStore::in_memory();
    let report = BatchDriver::new(&source, &target, &mut store, &config)
        .migrate(&EntityPlan::new("Contact", &["LastName"]))
        .await
        .unwrap();

    assert_eq!(report.batch_failures.len(), 1);
    assert_eq!(report.batch_failures[0].offset, 0);
    assert_eq!(report.created, 2);
    assert_eq!(target.calls(Operation::Create), 4);
}

#[tokio::test]
async fn test_rejected_records_do_not_roll_back_siblings() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 200);
    let source = MemoryOrg::new();
    let target = MemoryOrg::new();
    for name in ["Good", "Bad", "Fine"] {
        source.insert("Account", record(json!({ "Name": name })));
    }
    target.reject_records_where(
        "Account",
        "Name",
        "Bad",
        SaveError::new("DUPLICATE_VALUE", "duplicate value found"),
    );

    let mut store = MappingStore::in_memory();
    let report = BatchDriver::new(&source, &target, &mut store, &config)
        .migrate(&EntityPlan::new("Account", &["Name"]))
        .await
        .unwrap();

    assert_eq!(report.created, 2);
    assert_eq!(report.failed, 1);
    assert!(report.batch_failures.is_empty());
    assert_eq!(target.count("Account"), 2);
    let failed = report
        .outcomes
        .iter()
        .find(|o| o.status == OutcomeStatus::Failed)
        .unwrap();
    assert_eq!(
        failed.message.as_deref(),
        Some("DUPLICATE_VALUE: duplicate value found")
    );
    assert_eq!(report.first_errors(3), vec!["DUPLICATE_VALUE: duplicate value found"]);
}

#[tokio::test]
async fn test_later_batches_resolve_records_created_earlier_in_the_run() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 1);
    let source = MemoryOrg::new();
    let target = MemoryOrg::new();
    source.insert("Account", record(json!({ "Id": "001PARENT", "Name": "Parent" })));
    source.insert(
        "Account",
        record(json!({ "Id": "001CHILD", "Name": "Child", "ParentId": "001PARENT" })),
    );

    let mut store = MappingStore::in_memory();
    let plan = EntityPlan::new("Account", &["Name", "ParentId"])
        .rule("ParentId", FieldRule::reference("Account"));
    BatchDriver::new(&source, &target, &mut store, &config)
        .migrate(&plan)
        .await
        .unwrap();

    let parent_target = store.get("Account", "001PARENT").unwrap().to_string();
    let child = target_by_source(&target, &store, "Account", "001CHILD");
    assert_eq!(record_str(&child, "ParentId"), Some(parent_target.as_str()));
}

#[tokio::test]
async fn test_source_query_failure_aborts_entity() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 200);
    let source = MemoryOrg::new();
    let target = MemoryOrg::new();
    source.insert("Account", record(json!({ "Name": "Acme" })));
    source.fail_next(
        Operation::Query,
        MigrateError::http(400, Some("INVALID_FIELD"), "No such column 'Nope'"),
    );

    let mut store = MappingStore::in_memory();
    let err = BatchDriver::new(&source, &target, &mut store, &config)
        .migrate(&EntityPlan::new("Account", &["Name"]))
        .await
        .unwrap_err();

    assert!(matches!(err, MigrateError::Http { status: 400, .. }));
    assert_eq!(target.calls(Operation::Create), 0);
}

#[tokio::test]
async fn test_rerun_duplicates_target_records() {
    // Re-running without clearing the store is not idempotent.
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 200);
    let source = MemoryOrg::new();
    let target = MemoryOrg::new();
    source.insert("Account", record(json!({ "Id": "001A", "Name": "Acme" })));
    source.insert("Account", record(json!({ "Id": "001B", "Name": "Globex" })));

    let mut store = MappingStore::in_memory();
    let plan = EntityPlan::new("Account", &["Name"]);
    BatchDriver::new(&source, &target, &mut store, &config)
        .migrate(&plan)
        .await
        .unwrap();
    let first = store.get("Account", "001A").unwrap().to_string();

    BatchDriver::new(&source, &target, &mut store, &config)
        .migrate(&plan)
        .await
        .unwrap();
    let second = store.get("Account", "001A").unwrap().to_string();

    assert_eq!(target.count("Account"), 4);
    assert_ne!(first, second);
    assert_eq!(store.len("Account"), 2);
}

#[tokio::test]
async fn test_checkpoint_and_report_are_written_to_data_dir() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 2);
    let source = MemoryOrg::new();
    let target = MemoryOrg::new();
    for i in 0..3 {
        source.insert("Account", record(json!({ "Id": format!("001S{i}"), "Name": format!("A{i}") })));
    }

    let store = MappingStore::open_file(config.mapping_path()).unwrap();
    let mut migrator = Migrator::new(config.clone(), source, target, store);
    let report = migrator
        .migrate(&EntityPlan::new("Account", &["Name"]))
        .await
        .unwrap();
    assert_eq!(report.run_id, migrator.run_id());
    drop(migrator);

    let reopened = MappingStore::open_file(config.mapping_path()).unwrap();
    assert_eq!(reopened.len("Account"), 3);

    let reports: Vec<_> = std::fs::read_dir(config.reports_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].starts_with("Account_") && reports[0].ends_with(".json"));
}

#[tokio::test]
async fn test_migrate_all_runs_plans_in_order() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 200);
    let source = MemoryOrg::new();
    let target = MemoryOrg::new().with_key_prefix("Account", "001").with_key_prefix("Contact", "003");
    source.insert("Account", record(json!({ "Id": "001A", "Name": "Acme" })));
    source.insert(
        "Contact",
        record(json!({ "Id": "003A", "LastName": "Doe", "AccountId": "001A", "OwnerId": "005NOBODY" })),
    );

    let plans = vec![
        EntityPlan::new("Account", &["Name"]),
        EntityPlan::new("Contact", &["LastName", "AccountId", "OwnerId"])
            .rule("AccountId", FieldRule::reference("Account"))
            .rule("OwnerId", FieldRule::owner("User")),
    ];

    let mut migrator = Migrator::new(config, source, target, MappingStore::in_memory());
    let reports = migrator.migrate_all(&plans).await.unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.created == 1));

    let account_id = migrator.store().get("Account", "001A").unwrap();
    assert!(account_id.starts_with("001"));
    let contact_id = migrator.store().get("Contact", "003A").unwrap();
    let contact = migrator.target().get("Contact", contact_id).unwrap();
    assert_eq!(record_str(&contact, "AccountId"), Some(account_id));
    assert_eq!(record_str(&contact, "OwnerId"), Some(FALLBACK_OWNER));
}

#[tokio::test]
async fn test_dry_run_leaves_mapping_file_and_reports_alone() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 200);
    let mut seeded = MappingStore::open_file(config.mapping_path()).unwrap();
    seeded.insert("User", "005AAA", "005ZZZ");
    seeded.flush().unwrap();
    drop(seeded);

    let source = MemoryOrg::new();
    for id in ["00T1", "00T2"] {
        source.insert("Task", record(json!({ "Id": id, "Subject": id, "OwnerId": "005AAA" })));
    }

    let mut migrator = Migrator::dry_run(config.clone(), source).unwrap();
    let report = migrator.migrate(&task_plan()).await.unwrap();
    assert_eq!(report.created, 2);
    assert_eq!(migrator.target().count("Task"), 2);
    assert!(
        migrator
            .target()
            .records("Task")
            .iter()
            .all(|task| record_str(task, "OwnerId") == Some("005ZZZ"))
    );
    let store = migrator.into_store().unwrap();
    assert_eq!(store.len("Task"), 2);

    let reopened = MappingStore::open_file(config.mapping_path()).unwrap();
    assert_eq!(reopened.len("User"), 1);
    assert_eq!(reopened.len("Task"), 0);
    assert!(!config.reports_dir().exists());
}
