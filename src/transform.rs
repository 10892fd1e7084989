//! Turns a source record into the payload created in the target org.

use crate::core::{ATTRIBUTES_KEY, Record};
use crate::plan::{EntityPlan, FieldRule};
use crate::resolver::{IdResolver, Resolution};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

/// Result of transforming one record.
#[derive(Debug, Clone, PartialEq)]
pub enum Transformed {
    Ready(Record),
    Skipped(String),
}

/// Reference resolution counters accumulated across records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformStats {
    pub fallback_substitutions: usize,
    pub unmapped_references: usize,
}

impl TransformStats {
    pub fn merge(&mut self, other: TransformStats) {
        self.fallback_substitutions += other.fallback_substitutions;
        self.unmapped_references += other.unmapped_references;
    }
}

/// Applies `plan` to `source`.
///
/// `attributes`, `Id`, nulls and nested relationship objects never reach the
/// target payload. Owner fields go through the fallback policy; reference
/// fields are omitted when unmapped.
pub fn transform_record(
    plan: &EntityPlan,
    resolver: &IdResolver<'_>,
    source: &Record,
    stats: &mut TransformStats,
) -> Transformed {
    let mut target = Record::new();
    let mut resolved: Vec<&str> = Vec::new();

    for (field, value) in source {
        if field == ATTRIBUTES_KEY || field.eq_ignore_ascii_case("Id") {
            continue;
        }
        if value.is_null() || value.is_object() {
            continue;
        }

        match plan.rule_for(field) {
            FieldRule::Copy => {
                target.insert(field.clone(), value.clone());
            }
            FieldRule::Drop => {}
            FieldRule::StripHtml => {
                let cleaned = match value.as_str() {
                    Some(text) => Value::String(strip_html(text)),
                    None => value.clone(),
                };
                target.insert(field.clone(), cleaned);
            }
            FieldRule::Owner { scope } => {
                let Some(source_id) = value.as_str() else {
                    continue;
                };
                let resolution = resolver.resolve_owner(scope, source_id);
                if apply(&mut target, field, &resolution, stats) {
                    resolved.push(field);
                }
            }
            FieldRule::Reference { scope } => {
                let Some(source_id) = value.as_str() else {
                    continue;
                };
                let resolution = resolver.resolve_reference(scope, source_id);
                if apply(&mut target, field, &resolution, stats) {
                    resolved.push(field);
                }
            }
        }
    }

    if !plan.require_any_of.is_empty()
        && !plan
            .require_any_of
            .iter()
            .any(|field| resolved.iter().any(|r| r.eq_ignore_ascii_case(field)))
    {
        return Transformed::Skipped(format!(
            "no resolvable reference among {}",
            plan.require_any_of.join(", ")
        ));
    }

    if let Some(legacy_field) = &plan.legacy_id_field {
        if let Some(id) = source.get("Id").filter(|v| v.is_string()) {
            target.insert(legacy_field.clone(), id.clone());
        }
    }
    for (field, value) in &plan.constants {
        target.insert(field.clone(), value.clone());
    }

    Transformed::Ready(target)
}

fn apply(
    target: &mut Record,
    field: &str,
    resolution: &Resolution,
    stats: &mut TransformStats,
) -> bool {
    match resolution {
        Resolution::Mapped(id) => {
            target.insert(field.to_string(), Value::String(id.clone()));
            true
        }
        Resolution::Fallback(id) => {
            stats.fallback_substitutions += 1;
            target.insert(field.to_string(), Value::String(id.clone()));
            true
        }
        Resolution::Unmapped => {
            stats.unmapped_references += 1;
            false
        }
    }
}

/// Removes markup tags, leaving the text content.
pub fn strip_html(text: &str) -> String {
    static TAG: OnceLock<Regex> = OnceLock::new();
    let tag = TAG.get_or_init(|| Regex::new(r"<[^>]+>").expect("valid regex"));
    tag.replace_all(text, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::MappingStore;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn task_plan() -> EntityPlan {
        EntityPlan::new(
            "Task",
            &["Subject", "Description", "OwnerId", "WhatId", "WhoId", "What.Type"],
        )
        .legacy_id_field("Legacy_Id__c")
        .rule("OwnerId", FieldRule::owner("User"))
        .rule("WhatId", FieldRule::reference("Account"))
        .rule("WhoId", FieldRule::reference("Contact"))
        .rule("Description", FieldRule::StripHtml)
        .constant("RecordTypeId", "012000000000001")
        .require_any_of(&["WhatId", "WhoId"])
    }

    fn store() -> MappingStore {
        let mut store = MappingStore::in_memory();
        store.insert("User", "005AAA", "005ZZZ");
        store.insert("Account", "001AAA", "001ZZZ");
        store
    }

    #[test]
    fn test_transform_remaps_and_cleans() {
        let store = store();
        let resolver = IdResolver::new(&store, Some("005FALLBACK"));
        let mut stats = TransformStats::default();

        let source = record(json!({
            "attributes": { "type": "Task" },
            "Id": "00TAAA",
            "Subject": "Call",
            "Description": "<p>Hello <b>there</b></p>",
            "OwnerId": "005AAA",
            "WhatId": "001AAA",
            "WhoId": "003MISSING",
            "What": { "Type": "Account" },
            "ActivityDate": null
        }));

        let Transformed::Ready(out) = transform_record(&task_plan(), &resolver, &source, &mut stats)
        else {
            panic!("expected a ready record");
        };

        assert_eq!(out.get("OwnerId"), Some(&json!("005ZZZ")));
        assert_eq!(out.get("WhatId"), Some(&json!("001ZZZ")));
        assert_eq!(out.get("Description"), Some(&json!("Hello there")));
        assert_eq!(out.get("Legacy_Id__c"), Some(&json!("00TAAA")));
        assert_eq!(out.get("RecordTypeId"), Some(&json!("012000000000001")));
        assert!(!out.contains_key("WhoId"));
        assert!(!out.contains_key("Id"));
        assert!(!out.contains_key("attributes"));
        assert!(!out.contains_key("What"));
        assert!(!out.contains_key("ActivityDate"));
        assert_eq!(stats.unmapped_references, 1);
        assert_eq!(stats.fallback_substitutions, 0);
    }

    #[test]
    fn test_unmapped_owner_uses_fallback() {
        let store = store();
        let resolver = IdResolver::new(&store, Some("005FALLBACK"));
        let mut stats = TransformStats::default();
        let source = record(json!({ "Id": "00TB", "OwnerId": "005BBB", "WhatId": "001AAA" }));

        let Transformed::Ready(out) = transform_record(&task_plan(), &resolver, &source, &mut stats)
        else {
            panic!("expected a ready record");
        };
        assert_eq!(out.get("OwnerId"), Some(&json!("005FALLBACK")));
        assert_eq!(stats.fallback_substitutions, 1);
    }

    #[test]
    fn test_skips_when_no_required_reference_resolves() {
        let store = store();
        let resolver = IdResolver::new(&store, None);
        let mut stats = TransformStats::default();
        let source = record(json!({ "Id": "00TC", "Subject": "x", "WhatId": "001NOPE" }));

        let outcome = transform_record(&task_plan(), &resolver, &source, &mut stats);
        assert!(matches!(outcome, Transformed::Skipped(reason) if reason.contains("WhatId")));
    }

    #[test]
    fn test_drop_rule_and_plain_copy() {
        let store = MappingStore::in_memory();
        let resolver = IdResolver::new(&store, None);
        let plan = EntityPlan::new("Account", &["Name", "Rating", "Industry"])
            .rule("Rating", FieldRule::Drop);
        let source = record(json!({ "Id": "001A", "Name": "Acme", "Rating": "Hot", "Industry": 3 }));

        let outcome = transform_record(&plan, &resolver, &source, &mut TransformStats::default());
        assert_eq!(
            outcome,
            Transformed::Ready(record(json!({ "Name": "Acme", "Industry": 3 })))
        );
    }

    #[test]
    fn test_lowercase_plan_fields_still_remap_owner() {
        let store = MappingStore::in_memory();
        let resolver = IdResolver::new(&store, Some("005FALLBACK0000"));
        let mut stats = TransformStats::default();
        let plan = EntityPlan::new("Account", &["Name", "ownerid", "parentid"])
            .rule("ownerid", FieldRule::owner("User"))
            .rule("parentid", FieldRule::reference("Account"))
            .require_any_of(&["ownerid"]);
        plan.validate().unwrap();

        // the platform answers with its own field spelling
        let source = record(json!({
            "Id": "001A",
            "Name": "Acme",
            "OwnerId": "005SOURCEONLY00",
            "ParentId": "001SOURCEONLY00"
        }));

        let outcome = transform_record(&plan, &resolver, &source, &mut stats);
        assert_eq!(
            outcome,
            Transformed::Ready(record(json!({ "Name": "Acme", "OwnerId": "005FALLBACK0000" })))
        );
        assert_eq!(stats.fallback_substitutions, 1);
        assert_eq!(stats.unmapped_references, 1);
    }

    #[test]
    fn test_strip_html() {
        assert_eq!(strip_html("<div>a<br/>b</div>"), "ab");
        assert_eq!(strip_html("no tags"), "no tags");
    }
}
