//! Resolves source reference values to target identifiers through the mapping store.

use crm_storage::IdMappingStore;

use crate::rules::{ObjectRules, RuleSet};

/// Read-only view of source-to-target id mappings.
pub trait MappingLookup: Send + Sync {
    fn lookup(&self, object_type: &str, source_id: &str) -> Option<String>;
}

impl MappingLookup for IdMappingStore {
    fn lookup(&self, object_type: &str, source_id: &str) -> Option<String> {
        self.get(object_type, source_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedReference {
    pub field: String,
    pub target: String,
    pub source_value: String,
}

#[derive(Clone, Copy)]
pub struct ReferenceResolver<'a> {
    rules: &'a RuleSet,
    mappings: &'a dyn MappingLookup,
    session_user: Option<&'a str>,
}

impl<'a> ReferenceResolver<'a> {
    pub fn new(
        rules: &'a RuleSet,
        mappings: &'a dyn MappingLookup,
        session_user: Option<&'a str>,
    ) -> Self {
        Self {
            rules,
            mappings,
            session_user,
        }
    }

    /// True when `column` names a reference field on `object`.
    pub fn is_reference(&self, object: &ObjectRules, column: &str) -> bool {
        object.references.contains_key(column)
            || self.rules.catalog.references.contains_key(column)
            || self.rules.catalog.polymorphic.iter().any(|f| f == column)
            || self
                .rules
                .catalog
                .reference_suffixes
                .iter()
                .any(|suffix| column.len() > suffix.len() && column.ends_with(suffix.as_str()))
    }

    /// Object type a reference value points at; polymorphic fields use the id prefix table.
    pub fn target_type(&self, object: &ObjectRules, field: &str, raw: &str) -> Option<String> {
        if self.rules.catalog.polymorphic.iter().any(|f| f == field) {
            return self.rules.prefixes.object_for(raw).map(str::to_string);
        }
        object
            .references
            .get(field)
            .and_then(|spec| spec.object.clone())
            .or_else(|| self.rules.catalog.references.get(field).cloned())
    }

    pub fn is_required(&self, object: &ObjectRules, field: &str) -> bool {
        object.references.get(field).is_some_and(|spec| spec.required)
    }

    /// `Ok(None)` means the field is omitted from the target record.
    pub fn resolve(
        &self,
        object: &ObjectRules,
        field: &str,
        raw: &str,
    ) -> Result<Option<String>, UnresolvedReference> {
        let required = self.is_required(object, field);
        let Some(target) = self.target_type(object, field, raw) else {
            if required {
                return Err(UnresolvedReference {
                    field: field.to_string(),
                    target: "unknown".to_string(),
                    source_value: raw.to_string(),
                });
            }
            return Ok(None);
        };

        if let Some(mapped) = self.mappings.lookup(&target, raw) {
            return Ok(Some(mapped));
        }

        if object.session_user_fields.iter().any(|f| f == field) {
            if let Some(user) = self.session_user {
                return Ok(Some(user.to_string()));
            }
        }

        if required {
            return Err(UnresolvedReference {
                field: field.to_string(),
                target,
                source_value: raw.to_string(),
            });
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Mappings(HashMap<(String, String), String>);

    impl Mappings {
        fn with(mut self, object: &str, source: &str, target: &str) -> Self {
            self.0
                .insert((object.to_string(), source.to_string()), target.to_string());
            self
        }
    }

    impl MappingLookup for Mappings {
        fn lookup(&self, object_type: &str, source_id: &str) -> Option<String> {
            self.0
                .get(&(object_type.to_string(), source_id.to_string()))
                .cloned()
        }
    }

    fn rules() -> RuleSet {
        RuleSet::embedded().expect("embedded rules")
    }

    #[test]
    fn mapped_references_resolve_to_target_ids() {
        let rules = rules();
        let mappings = Mappings::default().with("Account", "001S1", "001T1");
        let resolver = ReferenceResolver::new(&rules, &mappings, None);
        let contact = rules.object("Contact").expect("contact");

        assert_eq!(
            resolver.resolve(contact, "AccountId", "001S1"),
            Ok(Some("001T1".to_string()))
        );
        assert_eq!(resolver.resolve(contact, "AccountId", "001S2"), Ok(None));
    }

    #[test]
    fn unmapped_required_references_fail() {
        let rules = rules();
        let mappings = Mappings::default();
        let resolver = ReferenceResolver::new(&rules, &mappings, None);
        let entry = rules.object("PricebookEntry").expect("pricebook entry");

        let err = resolver
            .resolve(entry, "Product2Id", "01tS1")
            .expect_err("required");
        assert_eq!(err.target, "Product2");
    }

    #[test]
    fn polymorphic_references_use_the_id_prefix() {
        let rules = rules();
        let mappings = Mappings::default()
            .with("Lead", "00QS1", "00QT1")
            .with("Opportunity", "006S1", "006T1");
        let resolver = ReferenceResolver::new(&rules, &mappings, None);
        let task = rules.object("Task").expect("task");

        assert_eq!(
            resolver.resolve(task, "WhoId", "00QS1"),
            Ok(Some("00QT1".to_string()))
        );
        assert_eq!(
            resolver.resolve(task, "WhatId", "006S1"),
            Ok(Some("006T1".to_string()))
        );
        assert_eq!(resolver.resolve(task, "WhatId", "a0XS1"), Ok(None));
    }

    #[test]
    fn session_user_stands_in_for_unmapped_owners() {
        let rules = rules();
        let mappings = Mappings::default();
        let task = rules.object("Task").expect("task");
        let case = rules.object("Case").expect("case");

        let with_user = ReferenceResolver::new(&rules, &mappings, Some("005ME"));
        assert_eq!(
            with_user.resolve(task, "OwnerId", "005S1"),
            Ok(Some("005ME".to_string()))
        );
        assert_eq!(with_user.resolve(case, "OwnerId", "005S1"), Ok(None));

        let without_user = ReferenceResolver::new(&rules, &mappings, None);
        assert_eq!(without_user.resolve(task, "OwnerId", "005S1"), Ok(None));
    }

    #[test]
    fn reference_columns_are_detected_by_table_and_suffix() {
        let rules = rules();
        let mappings = Mappings::default();
        let resolver = ReferenceResolver::new(&rules, &mappings, None);
        let account = rules.object("Account").expect("account");

        assert!(resolver.is_reference(account, "OwnerId"));
        assert!(resolver.is_reference(account, "MasterRecordId"));
        assert!(resolver.is_reference(account, "Legacy_SystemId__c"));
        assert!(!resolver.is_reference(account, "Name"));
        assert!(!resolver.is_reference(account, "Id"));
    }
}
