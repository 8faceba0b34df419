//! Pre-passes that create or look up records an object type depends on before transformation.

use std::collections::{BTreeMap, BTreeSet};
use std::result::Result as StdResult;

use anyhow::{Context, Result};
use crm_adapters::{soql_quote, TargetSystem, COLLECTION_LIMIT};
use crm_core::{value_as_string, FieldMap, MappingOrigin, SourceRow, TransformedRecord};
use crm_storage::{IdMappingStore, SourceStore};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::rules::{FieldRule, ObjectRules, Prerequisite, PrerequisiteFailure};
use crate::transform::{StampedField, UniqueKeys};

const STANDARD_PRICEBOOK_QUERY: &str = "SELECT Id FROM Pricebook2 WHERE IsStandard = true LIMIT 1";
const STANDARD_PRICE_NOT_DEFINED: &str = "STANDARD_PRICE_NOT_DEFINED";
const DUPLICATE_VALUE: &str = "DUPLICATE_VALUE";

/// Result of running every pre-pass declared for one object type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Preparation {
    pub stamped: Vec<StampedField>,
    /// Set when a failed pre-pass makes the whole type unuploadable.
    pub skip: Option<String>,
}

fn first_id(rows: &[FieldMap]) -> Option<String> {
    rows.first().and_then(|row| row.get("Id")).and_then(value_as_string)
}

/// Reads `field` from a source row, honouring the object's column renames.
fn renamed_column(object: &ObjectRules, row: &SourceRow, field: &str) -> Option<String> {
    row.columns()
        .find(|(column, _)| {
            object.rename.get(*column).map(String::as_str).unwrap_or(*column) == field
        })
        .and_then(|(_, value)| value_as_string(value))
}

fn as_price(value: Option<&JsonValue>) -> Option<f64> {
    match value? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub struct PrerequisiteRunner<'a> {
    target: &'a dyn TargetSystem,
    source: &'a dyn SourceStore,
    mappings: &'a IdMappingStore,
}

impl<'a> PrerequisiteRunner<'a> {
    pub fn new(
        target: &'a dyn TargetSystem,
        source: &'a dyn SourceStore,
        mappings: &'a IdMappingStore,
    ) -> Self {
        Self {
            target,
            source,
            mappings,
        }
    }

    /// Target-side failures are logged and handled per `on_failure`; only mapping writes abort.
    pub async fn prepare(&self, object: &ObjectRules, rows: &[SourceRow]) -> Result<Preparation> {
        let mut preparation = Preparation::default();
        for prerequisite in &object.prerequisites {
            match prerequisite {
                Prerequisite::DefaultParent {
                    field,
                    object: parent,
                    lookup,
                    create,
                    overwrite,
                    on_failure,
                } => match self.default_parent(parent.as_deref(), lookup, create.as_ref()).await {
                    Ok(id) => {
                        debug!(object = %object.name, %field, %id, "stamping default parent");
                        preparation.stamped.push(StampedField {
                            field: field.clone(),
                            value: json!(id),
                            overwrite: *overwrite,
                        });
                    }
                    Err(reason) => {
                        warn!(object = %object.name, %field, %reason, "default parent unavailable");
                        if *on_failure == PrerequisiteFailure::SkipType {
                            preparation.skip = Some(format!("{field}: {reason}"));
                            return Ok(preparation);
                        }
                    }
                },
                Prerequisite::VisitorRecords {
                    field,
                    object: visitor,
                } => {
                    self.visitor_records(object, rows, field, visitor).await?;
                }
                Prerequisite::StandardPricebookEntries { unit_price } => {
                    self.standard_pricebook_entries(object, rows, *unit_price).await;
                }
                Prerequisite::OrderPricebookEntries { default_unit_price } => {
                    self.order_pricebook_entries(object, rows, *default_unit_price)
                        .await?;
                }
            }
        }
        Ok(preparation)
    }

    /// Seeds unique-key rules with values already present in the target.
    pub async fn seed_unique_keys(&self, object: &ObjectRules, keys: &mut UniqueKeys) {
        for rule in &object.rules {
            let FieldRule::Unique {
                field,
                case_insensitive,
                seed_queries,
                ..
            } = rule
            else {
                continue;
            };
            for soql in seed_queries {
                match self.target.query(soql).await {
                    Ok(rows) => {
                        let values: Vec<String> = rows
                            .iter()
                            .filter_map(|row| row.get(field.as_str()).and_then(value_as_string))
                            .collect();
                        debug!(
                            object = %object.name,
                            %field,
                            count = values.len(),
                            "seeded unique keys"
                        );
                        keys.seed(field, values, *case_insensitive);
                    }
                    Err(err) => {
                        warn!(
                            object = %object.name,
                            %field,
                            error = %err,
                            "unique key seed query failed"
                        );
                    }
                }
            }
        }
    }

    async fn default_parent(
        &self,
        object: Option<&str>,
        lookup: &str,
        create: Option<&BTreeMap<String, JsonValue>>,
    ) -> StdResult<String, String> {
        let lookup_error = match self.target.query(lookup).await {
            Ok(rows) => match first_id(&rows) {
                Some(id) => return Ok(id),
                None => "lookup returned no rows".to_string(),
            },
            Err(err) => format!("lookup failed: {err}"),
        };

        let (Some(object), Some(create)) = (object, create) else {
            return Err(lookup_error);
        };
        let record: FieldMap = create.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        match self.target.create(object, &record).await {
            Ok(id) => {
                info!(object, %id, "created default parent record");
                Ok(id)
            }
            Err(err) => Err(format!("{lookup_error}; create {object} failed: {err}")),
        }
    }

    async fn visitor_records(
        &self,
        object: &ObjectRules,
        rows: &[SourceRow],
        field: &str,
        visitor: &str,
    ) -> Result<()> {
        let wanted: BTreeSet<String> = rows
            .iter()
            .filter_map(|row| renamed_column(object, row, field))
            .filter(|raw| !self.mappings.contains(visitor, raw))
            .collect();
        if wanted.is_empty() {
            return Ok(());
        }

        let mut created = Vec::with_capacity(wanted.len());
        let mut failures = 0usize;
        for raw in wanted {
            match self.target.create(visitor, &FieldMap::new()).await {
                Ok(id) => created.push((raw, id)),
                Err(err) => {
                    failures += 1;
                    if failures <= 5 {
                        warn!(object = visitor, source_id = %raw, error = %err, "create failed");
                    }
                }
            }
        }
        let written = self
            .mappings
            .put_batch(visitor, &created)
            .await
            .with_context(|| format!("writing {visitor} mappings"))?;
        info!(object = visitor, created = written, failures, "created placeholder records");
        Ok(())
    }

    async fn standard_pricebook(&self) -> Option<String> {
        match self.target.query(STANDARD_PRICEBOOK_QUERY).await {
            Ok(rows) => first_id(&rows),
            Err(err) => {
                warn!(error = %err, "standard pricebook lookup failed");
                None
            }
        }
    }

    async fn standard_pricebook_entries(
        &self,
        object: &ObjectRules,
        rows: &[SourceRow],
        unit_price: f64,
    ) {
        let Some(standard) = self.standard_pricebook().await else {
            warn!(object = %object.name, "no standard pricebook in target");
            return;
        };

        let needed: BTreeSet<String> = rows
            .iter()
            .filter_map(|row| {
                let pricebook = renamed_column(object, row, "Pricebook2Id")
                    .and_then(|raw| self.mappings.get("Pricebook2", &raw))?;
                let product = renamed_column(object, row, "Product2Id")
                    .and_then(|raw| self.mappings.get("Product2", &raw))?;
                (pricebook != standard).then_some(product)
            })
            .collect();
        if needed.is_empty() {
            return;
        }

        let mut existing = BTreeSet::new();
        let needed_list: Vec<&String> = needed.iter().collect();
        for chunk in needed_list.chunks(COLLECTION_LIMIT) {
            let ids = chunk
                .iter()
                .map(|id| soql_quote(id))
                .collect::<Vec<_>>()
                .join(", ");
            let soql = format!(
                "SELECT Product2Id FROM PricebookEntry \
                 WHERE Pricebook2Id = {} AND Product2Id IN ({ids})",
                soql_quote(&standard)
            );
            match self.target.query(&soql).await {
                Ok(found) => existing.extend(
                    found
                        .iter()
                        .filter_map(|row| row.get("Product2Id").and_then(value_as_string)),
                ),
                Err(err) => warn!(error = %err, "standard entry lookup failed"),
            }
        }

        let records: Vec<TransformedRecord> = needed
            .difference(&existing)
            .map(|product| {
                let mut record = TransformedRecord::new(None);
                record.fields.insert("Pricebook2Id".into(), json!(standard));
                record.fields.insert("Product2Id".into(), json!(product));
                record.fields.insert("UnitPrice".into(), json!(unit_price));
                record.fields.insert("IsActive".into(), json!(true));
                record
            })
            .collect();
        if records.is_empty() {
            debug!(products = needed.len(), "standard entries already present");
            return;
        }

        match self.target.insert_batch("PricebookEntry", &records).await {
            Ok(outcomes) => {
                let created = outcomes.iter().filter(|o| o.success).count();
                info!(
                    created,
                    failed = outcomes.len() - created,
                    "created standard pricebook entries"
                );
            }
            Err(err) => warn!(error = %err, "standard pricebook entry insert failed"),
        }
    }

    /// Ensures an entry exists for every order pricebook and item product pair,
    /// mapping unmapped source entry ids onto the entry found or created.
    /// Entries that already existed in the target are mapped as adopted.
    async fn order_pricebook_entries(
        &self,
        object: &ObjectRules,
        rows: &[SourceRow],
        default_unit_price: f64,
    ) -> Result<()> {
        let orders = self
            .source
            .rows("Order")
            .await
            .context("reading Order rows for pricebook entries")?;
        let order_pricebooks: BTreeMap<String, String> = orders
            .iter()
            .filter_map(|order| Some((order.source_id()?, order.get_str("Pricebook2Id")?)))
            .collect();

        let mut entries: BTreeMap<(String, String), Option<(String, MappingOrigin)>> =
            BTreeMap::new();
        let mut created = Vec::new();
        let mut adopted = Vec::new();
        let mut unresolved = 0usize;
        let mut standard: Option<Option<String>> = None;

        for row in rows {
            let pair = renamed_column(object, row, "OrderId")
                .and_then(|order| order_pricebooks.get(&order))
                .and_then(|pricebook| self.mappings.get("Pricebook2", pricebook))
                .zip(
                    renamed_column(object, row, "Product2Id")
                        .and_then(|product| self.mappings.get("Product2", &product)),
                );
            let Some((pricebook, product)) = pair else {
                unresolved += 1;
                continue;
            };

            let key = (pricebook, product);
            if !entries.contains_key(&key) {
                let price = as_price(row.get("UnitPrice")).unwrap_or(default_unit_price);
                let entry = self
                    .find_or_create_entry(&key.0, &key.1, price, &mut standard)
                    .await;
                entries.insert(key.clone(), entry);
            }

            let (Some(Some((entry, origin))), Some(source_entry)) = (
                entries.get(&key),
                renamed_column(object, row, "PricebookEntryId"),
            ) else {
                continue;
            };
            if self.mappings.contains("PricebookEntry", &source_entry) {
                continue;
            }
            let pair = (source_entry, entry.clone());
            match origin {
                MappingOrigin::Created => created.push(pair),
                MappingOrigin::Adopted => adopted.push(pair),
            }
        }

        let mut written = 0;
        for (mut pairs, origin) in [
            (created, MappingOrigin::Created),
            (adopted, MappingOrigin::Adopted),
        ] {
            pairs.sort();
            pairs.dedup_by(|a, b| a.0 == b.0);
            written += self
                .mappings
                .put_batch_as("PricebookEntry", &pairs, origin)
                .await
                .context("writing PricebookEntry mappings")?;
        }
        info!(
            pairs = entries.len(),
            available = entries.values().filter(|e| e.is_some()).count(),
            mapped = written,
            unresolved,
            "order pricebook entries ready"
        );
        Ok(())
    }

    async fn find_or_create_entry(
        &self,
        pricebook: &str,
        product: &str,
        unit_price: f64,
        standard: &mut Option<Option<String>>,
    ) -> Option<(String, MappingOrigin)> {
        let soql = format!(
            "SELECT Id FROM PricebookEntry WHERE Pricebook2Id = {} AND Product2Id = {} LIMIT 1",
            soql_quote(pricebook),
            soql_quote(product)
        );
        match self.target.query(&soql).await {
            Ok(rows) => {
                if let Some(id) = first_id(&rows) {
                    return Some((id, MappingOrigin::Adopted));
                }
            }
            Err(err) => {
                warn!(pricebook, product, error = %err, "pricebook entry lookup failed");
                return None;
            }
        }

        let mut entry = FieldMap::new();
        entry.insert("Pricebook2Id".into(), json!(pricebook));
        entry.insert("Product2Id".into(), json!(product));
        entry.insert("UnitPrice".into(), json!(unit_price));
        entry.insert("IsActive".into(), json!(true));

        match self.target.create("PricebookEntry", &entry).await {
            Ok(id) => Some((id, MappingOrigin::Created)),
            Err(err) if err.code() == DUPLICATE_VALUE => {
                let rows = self.target.query(&soql).await.ok()?;
                first_id(&rows).map(|id| (id, MappingOrigin::Adopted))
            }
            Err(err) if err.code() == STANDARD_PRICE_NOT_DEFINED => {
                if standard.is_none() {
                    *standard = Some(self.standard_pricebook().await);
                }
                let standard_id = standard.clone().flatten()?;
                let mut standard_entry = entry.clone();
                standard_entry.insert("Pricebook2Id".into(), json!(standard_id));
                if let Err(err) = self.target.create("PricebookEntry", &standard_entry).await {
                    warn!(product, error = %err, "standard pricebook entry create failed");
                    return None;
                }
                match self.target.create("PricebookEntry", &entry).await {
                    Ok(id) => Some((id, MappingOrigin::Created)),
                    Err(err) => {
                        warn!(pricebook, product, error = %err, "pricebook entry create failed");
                        None
                    }
                }
            }
            Err(err) => {
                warn!(pricebook, product, error = %err, "pricebook entry create failed");
                None
            }
        }
    }
}
