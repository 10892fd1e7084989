//! Integration tests for file, link and distribution transfer

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use orgshift::attachments::NO_PARENT_MAPPING;
use orgshift::core::record_str;
use orgshift::files::{
    ALREADY_MIGRATED, CONTENT_DISTRIBUTION, CONTENT_DOCUMENT, CONTENT_DOCUMENT_LINK,
    CONTENT_VERSION, DOCUMENT_NOT_MIGRATED,
};
use orgshift::transport::memory::Operation;
use orgshift::{
    FileMigrator, FileRequest, MappingStore, MemoryOrg, MigrateError, MigrationConfig, OrgConfig,
    OutcomeStatus, Record, RetryPolicy, SaveError,
};
use serde_json::{Value, json};
use tempfile::TempDir;

fn record(value: Value) -> Record {
    value.as_object().cloned().unwrap()
}

fn config(dir: &TempDir) -> MigrationConfig {
    MigrationConfig::new(
        OrgConfig::new("source@example.com", "pw", ""),
        OrgConfig::new("target@example.com", "pw", ""),
    )
    .batch_size(2)
    .data_dir(dir.path())
    .retry(RetryPolicy::immediate(3))
}

fn link(id: &str, document: &str, entity: &str, kind: &str, share: &str, visibility: &str) -> Record {
    record(json!({
        "Id": id,
        "ContentDocumentId": document,
        "LinkedEntityId": entity,
        "LinkedEntity": { "Type": kind },
        "ShareType": share,
        "Visibility": visibility
    }))
}

/// Document 069A hangs off two mapped accounts and is shared with a mapped
/// and an unmapped user. Document 069B only hangs off an unmapped account.
fn source_with_files() -> MemoryOrg {
    let source = MemoryOrg::new();
    for id in ["001MAPPED", "001SECOND", "001ORPHAN"] {
        source.insert("Account", record(json!({ "Id": id, "Name": id })));
    }

    for row in [
        link("06AA1", "069A", "001MAPPED", "Account", "I", "AllUsers"),
        link("06AA2", "069A", "001SECOND", "Account", "I", "InternalUsers"),
        link("06AA3", "069A", "005AAA", "User", "C", "AllUsers"),
        link("06AA4", "069A", "005BBB", "User", "V", "AllUsers"),
        link("06AB1", "069B", "001ORPHAN", "Account", "I", "AllUsers"),
    ] {
        source.insert(CONTENT_DOCUMENT_LINK, row);
    }

    for (id, document, latest, title, path) in [
        ("068A0", "069A", false, "Contract draft", "draft.pdf"),
        ("068A", "069A", true, "Contract", "contract.pdf"),
        ("068B", "069B", true, "Lost", "lost.txt"),
    ] {
        source.insert(
            CONTENT_VERSION,
            record(json!({
                "Id": id,
                "ContentDocumentId": document,
                "IsLatest": latest,
                "Title": title,
                "PathOnClient": path
            })),
        );
        source.put_blob(CONTENT_VERSION, id, "VersionData", format!("body of {id}").into_bytes());
    }

    source.insert(
        CONTENT_DISTRIBUTION,
        record(json!({
            "Id": "05DA",
            "Name": "Public contract",
            "ContentVersionId": "068A",
            "ContentDocumentId": "069A",
            "RelatedRecordId": "001MAPPED",
            "RelatedRecord": { "Type": "Account" },
            "PreferencesAllowViewInBrowser": true,
            "PreferencesPasswordRequired": false,
            "ExpiryDate": null
        })),
    );
    source.insert(
        CONTENT_DISTRIBUTION,
        record(json!({
            "Id": "05DB",
            "Name": "Lost link",
            "ContentVersionId": "068B",
            "ContentDocumentId": "069B"
        })),
    );
    source
}

fn target() -> MemoryOrg {
    MemoryOrg::new()
        .with_key_prefix(CONTENT_VERSION, "068")
        .with_key_prefix(CONTENT_DOCUMENT, "069")
        .with_key_prefix(CONTENT_DOCUMENT_LINK, "06A")
        .with_key_prefix(CONTENT_DISTRIBUTION, "05D")
}

fn store() -> MappingStore {
    let mut store = MappingStore::in_memory();
    store.insert("Account", "001MAPPED", "001TARGET");
    store.insert("Account", "001SECOND", "001TARGET2");
    store.insert("User", "005AAA", "005ZZZ");
    store
}

fn target_link<'a>(links: &'a [Record], entity: &str) -> &'a Record {
    links
        .iter()
        .find(|l| record_str(l, "LinkedEntityId") == Some(entity))
        .unwrap()
}

#[tokio::test]
async fn test_files_follow_their_parents_and_shares() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let source = source_with_files();
    let target = target();
    let mut store = store();

    let report = FileMigrator::new(&source, &target, &mut store, &config)
        .without_report_files()
        .migrate(&FileRequest::new("Account").legacy_id_field("Card_Legacy_Id__c"))
        .await
        .unwrap();

    assert_eq!(report.documents.read, 2);
    assert_eq!(report.documents.created, 1);
    assert_eq!(report.documents.skipped, 1);
    assert_eq!(report.documents.references.unmapped_references, 1);
    let orphan = report
        .documents
        .outcomes
        .iter()
        .find(|o| o.status == OutcomeStatus::Skipped)
        .unwrap();
    assert_eq!(orphan.source_id, "069B");
    assert_eq!(orphan.message.as_deref(), Some(NO_PARENT_MAPPING));

    // only the latest version is uploaded, published on the first account
    assert_eq!(target.count(CONTENT_VERSION), 1);
    let version = &target.records(CONTENT_VERSION)[0];
    assert_eq!(record_str(version, "Title"), Some("Contract"));
    assert_eq!(record_str(version, "PathOnClient"), Some("contract.pdf"));
    assert_eq!(record_str(version, "FirstPublishLocationId"), Some("001TARGET"));
    assert_eq!(record_str(version, "Card_Legacy_Id__c"), Some("068A"));
    let body = STANDARD
        .decode(record_str(version, "VersionData").unwrap())
        .unwrap();
    assert_eq!(body, b"body of 068A");
    assert_eq!(source.calls(Operation::FetchBlob), 1);

    let document_id = record_str(&target.records(CONTENT_DOCUMENT)[0], "Id")
        .unwrap()
        .to_string();
    assert_eq!(store.get(CONTENT_DOCUMENT, "069A"), Some(document_id.as_str()));
    assert_eq!(
        store.get(CONTENT_VERSION, "068A"),
        record_str(version, "Id")
    );

    // the publish link already exists, the other two mapped entities get one each
    let links = target.records(CONTENT_DOCUMENT_LINK);
    assert_eq!(links.len(), 3);
    assert!(
        links
            .iter()
            .all(|l| record_str(l, "ContentDocumentId") == Some(document_id.as_str()))
    );
    let second = target_link(&links, "001TARGET2");
    assert_eq!(record_str(second, "ShareType"), Some("V"));
    assert_eq!(record_str(second, "Visibility"), Some("InternalUsers"));
    let user = target_link(&links, "005ZZZ");
    assert_eq!(record_str(user, "ShareType"), Some("C"));
    assert_eq!(record_str(user, "Visibility"), Some("AllUsers"));

    assert_eq!(report.links.read, 5);
    assert_eq!(report.links.created, 3);
    assert_eq!(report.links.skipped, 2);
    assert_eq!(report.links.references.unmapped_references, 1);
    assert_eq!(store.len(CONTENT_DOCUMENT_LINK), 3);
    assert!(store.contains(CONTENT_DOCUMENT_LINK, "06AA1"));
    assert!(!store.contains(CONTENT_DOCUMENT_LINK, "06AA4"));

    // the distribution points at the new version and the remapped account
    assert_eq!(report.distributions.read, 1);
    assert_eq!(report.distributions.created, 1);
    let distribution = &target.records(CONTENT_DISTRIBUTION)[0];
    assert_eq!(record_str(distribution, "Name"), Some("Public contract"));
    assert_eq!(
        record_str(distribution, "ContentVersionId"),
        record_str(version, "Id")
    );
    assert_eq!(record_str(distribution, "RelatedRecordId"), Some("001TARGET"));
    assert_eq!(distribution["PreferencesAllowViewInBrowser"], json!(true));
    assert_eq!(distribution["PreferencesPasswordRequired"], json!(false));
    assert!(!distribution.contains_key("ExpiryDate"));
    assert!(store.contains(CONTENT_DISTRIBUTION, "05DA"));

    // successful uploads leave nothing staged
    let staged = std::fs::read_dir(config.staging_dir()).unwrap().count();
    assert_eq!(staged, 0);
}

#[tokio::test]
async fn test_rerun_only_adds_missing_files() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let source = source_with_files();
    let target = target();
    let mut store = store();
    let request = FileRequest::new("Account");

    FileMigrator::new(&source, &target, &mut store, &config)
        .without_report_files()
        .migrate(&request)
        .await
        .unwrap();
    let creates = target.calls(Operation::Create);

    let report = FileMigrator::new(&source, &target, &mut store, &config)
        .without_report_files()
        .migrate(&request)
        .await
        .unwrap();

    assert_eq!(target.calls(Operation::Create), creates);
    assert_eq!(source.calls(Operation::FetchBlob), 1);
    assert_eq!(target.count(CONTENT_VERSION), 1);
    assert_eq!(target.count(CONTENT_DOCUMENT_LINK), 3);
    assert_eq!(target.count(CONTENT_DISTRIBUTION), 1);

    assert_eq!(report.documents.created, 0);
    let reused = report
        .documents
        .outcomes
        .iter()
        .find(|o| o.source_id == "069A")
        .unwrap();
    assert_eq!(reused.message.as_deref(), Some(ALREADY_MIGRATED));
    assert_eq!(report.links.created, 3);
    assert_eq!(report.distributions.skipped, 1);
    assert_eq!(
        report.distributions.outcomes[0].message.as_deref(),
        Some(ALREADY_MIGRATED)
    );
}

#[tokio::test]
async fn test_rejected_upload_keeps_staged_file() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let source = source_with_files();
    let target = target();
    target.reject_records_where(
        CONTENT_VERSION,
        "PathOnClient",
        "contract.pdf",
        SaveError::new("STORAGE_LIMIT_EXCEEDED", "storage limit exceeded"),
    );
    let mut store = store();

    let report = FileMigrator::new(&source, &target, &mut store, &config)
        .without_report_files()
        .migrate(&FileRequest::new("Account"))
        .await
        .unwrap();

    assert_eq!(report.documents.failed, 1);
    assert_eq!(report.documents.created, 0);
    assert_eq!(target.count(CONTENT_DOCUMENT), 0);
    assert_eq!(target.count(CONTENT_DOCUMENT_LINK), 0);
    assert!(!store.contains(CONTENT_DOCUMENT, "069A"));

    let skipped_links: Vec<_> = report
        .links
        .outcomes
        .iter()
        .filter(|o| o.message.as_deref() == Some(DOCUMENT_NOT_MIGRATED))
        .collect();
    assert_eq!(skipped_links.len(), 4);
    assert_eq!(report.distributions.read, 0);

    let staged = config.staging_dir().join("068A_contract.pdf");
    assert_eq!(std::fs::read(staged).unwrap(), b"body of 068A");
}

#[tokio::test]
async fn test_download_is_retried() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let source = source_with_files();
    source.fail_next(
        Operation::FetchBlob,
        MigrateError::http(503, Some("SERVER_UNAVAILABLE"), "busy"),
    );
    let target = target();
    let mut store = store();

    let report = FileMigrator::new(&source, &target, &mut store, &config)
        .without_report_files()
        .migrate(&FileRequest::new("Account").without_distributions())
        .await
        .unwrap();

    assert_eq!(report.documents.created, 1);
    assert_eq!(source.calls(Operation::FetchBlob), 2);
    assert_eq!(report.distributions.read, 0);
    assert_eq!(target.count(CONTENT_DISTRIBUTION), 0);
}

#[tokio::test]
async fn test_reports_written_per_kind() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let source = source_with_files();
    let target = target();
    let mut store = store();

    FileMigrator::new(&source, &target, &mut store, &config)
        .migrate(&FileRequest::new("Account"))
        .await
        .unwrap();

    let mut names: Vec<String> = std::fs::read_dir(config.reports_dir())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names.len(), 3);
    assert!(names[0].starts_with("ContentDistribution_"));
    assert!(names[1].starts_with("ContentDocumentLink_"));
    assert!(names[2].starts_with("ContentDocument_"));
}
