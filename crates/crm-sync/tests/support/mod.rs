#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use crm_adapters::{LeadConversion, ObjectDescription, TargetError, TargetSystem};
use crm_core::{BatchOutcome, FieldMap, SourceRow, TransformedRecord};
use crm_storage::{IdMappingStore, SourceStore, SourceStoreError};
use crm_sync::{RuleSet, UploadOptions, UploadPipeline};
use serde_json::{json, Value as JsonValue};

pub const EXTERNAL_ID: &str = "OriginalId__c";

const OBJECTS: &str = r#"
external_id_field: OriginalId__c
strip: [CreatedDate, LastModifiedDate]
references:
  AccountId: Account
  ContactId: Contact
  Product2Id: Product2
  Pricebook2Id: Pricebook2
  OrderId: Order
objects:
  - name: Contact
    references:
      AccountId: {}
  - name: Account
  - name: Product2
  - name: Pricebook2
  - name: PricebookEntry
    references:
      Product2Id: { required: true }
      Pricebook2Id: { required: true }
  - name: Lead
    conversion: {}
  - name: Case
    references:
      ContactId: {}
  - name: Order
    references:
      Pricebook2Id: {}
  - name: OrderItem
    rename:
      PriceBookEntryId: PricebookEntryId
    references:
      OrderId: { required: true }
      PricebookEntryId: { object: PricebookEntry, required: true }
    prerequisites:
      - kind: order_pricebook_entries
  - name: OpportunityLineItem
    submission:
      fallback: record_by_record
  - name: Territory2
    prerequisites:
      - kind: default_parent
        field: Territory2ModelId
        object: Territory2Model
        lookup: SELECT Id FROM Territory2Model LIMIT 1
        create: { Name: Migration Model }
  - name: ProductCategory
    prerequisites:
      - kind: default_parent
        field: CatalogId
        lookup: SELECT Id FROM ProductCatalog LIMIT 1
        on_failure: skip_type
  - name: LiveChatTranscript
    references:
      LiveChatVisitorId: { object: LiveChatVisitor, required: true }
    prerequisites:
      - kind: visitor_records
        field: LiveChatVisitorId
        object: LiveChatVisitor
"#;

const BENIGN: &str = r#"
rules:
  - object: Contact
    code: DUPLICATES_DETECTED
    reason: duplicate rule matched an existing contact
    recovery: { kind: natural_key, field: Email }
  - object: "*"
    code: DUPLICATE_VALUE
    reason: duplicate value on a unique field
  - object: "*"
    code: ENTITY_IS_LOCKED
    reason: record locked by an approval process
"#;

pub fn rules() -> RuleSet {
    RuleSet::from_texts(OBJECTS, BENIGN, "prefixes: {}").expect("test rules")
}

pub fn row(pairs: &[(&str, JsonValue)]) -> SourceRow {
    SourceRow::from_pairs(pairs.iter().cloned())
}

/// Source snapshot held in memory.
#[derive(Default)]
pub struct MemorySource {
    tables: HashMap<String, Vec<SourceRow>>,
}

impl MemorySource {
    pub fn with(mut self, object: &str, rows: Vec<SourceRow>) -> Self {
        self.tables.insert(object.to_string(), rows);
        self
    }
}

#[async_trait]
impl SourceStore for MemorySource {
    async fn tables(&self) -> Result<Vec<String>, SourceStoreError> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn rows(&self, object: &str) -> Result<Vec<SourceRow>, SourceStoreError> {
        Ok(self.tables.get(object).cloned().unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub object: String,
    pub id: String,
    pub fields: FieldMap,
}

#[derive(Debug, Clone)]
struct Failure {
    object: String,
    field: String,
    value: String,
    code: String,
    message: String,
}

#[derive(Default)]
struct FakeState {
    records: Vec<StoredRecord>,
    batches: Vec<(String, Vec<TransformedRecord>)>,
    conversions: Vec<LeadConversion>,
    queries: Vec<String>,
    next_id: usize,
}

/// In-memory target org. Upserts match on the external id field; queries
/// answer with scripted rows and return nothing otherwise.
#[derive(Default)]
pub struct FakeTarget {
    state: Mutex<FakeState>,
    missing: BTreeSet<String>,
    without_external_id: BTreeSet<String>,
    refuse_upsert: BTreeSet<String>,
    reject_batches: BTreeSet<String>,
    failures: Vec<Failure>,
    responses: Vec<(String, Vec<FieldMap>)>,
}

impl FakeTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// `describe` reports the object type as unavailable.
    pub fn missing(mut self, object: &str) -> Self {
        self.missing.insert(object.to_string());
        self
    }

    /// `describe` omits the external id field, forcing insert mode.
    pub fn without_external_id(mut self, object: &str) -> Self {
        self.without_external_id.insert(object.to_string());
        self
    }

    /// Upserts fail with an inaccessible external id field error.
    pub fn refuse_upsert(mut self, object: &str) -> Self {
        self.refuse_upsert.insert(object.to_string());
        self
    }

    /// Multi-record inserts and upserts are refused as a whole.
    pub fn reject_batches(mut self, object: &str) -> Self {
        self.reject_batches.insert(object.to_string());
        self
    }

    /// Queries containing `fragment` return `rows`; the first matching script wins.
    pub fn respond(mut self, fragment: &str, rows: Vec<JsonValue>) -> Self {
        let rows = rows
            .into_iter()
            .filter_map(|row| match row {
                JsonValue::Object(map) => Some(map),
                _ => None,
            })
            .collect();
        self.responses.push((fragment.to_string(), rows));
        self
    }

    /// Stores a record as if it already existed in the org.
    pub fn seed(&self, object: &str, fields: JsonValue) -> String {
        let fields = match fields {
            JsonValue::Object(map) => map,
            _ => FieldMap::new(),
        };
        let mut state = self.state.lock().expect("state");
        Self::store(&mut state, object, fields)
    }

    /// Records whose `field` equals `value` fail with `code`.
    pub fn fail_when(mut self, object: &str, field: &str, value: &str, code: &str) -> Self {
        self.failures.push(Failure {
            object: object.to_string(),
            field: field.to_string(),
            value: value.to_string(),
            code: code.to_string(),
            message: format!("{code} raised for {value}"),
        });
        self
    }

    pub fn records(&self, object: &str) -> Vec<StoredRecord> {
        let state = self.state.lock().expect("state");
        state
            .records
            .iter()
            .filter(|r| r.object == object)
            .cloned()
            .collect()
    }

    pub fn record_by_external_id(&self, object: &str, source_id: &str) -> Option<StoredRecord> {
        self.records(object)
            .into_iter()
            .find(|r| r.fields.get(EXTERNAL_ID) == Some(&json!(source_id)))
    }

    pub fn record(&self, object: &str, id: &str) -> Option<StoredRecord> {
        self.records(object).into_iter().find(|r| r.id == id)
    }

    /// Object types of every submitted batch, in submission order.
    pub fn batch_objects(&self) -> Vec<String> {
        let state = self.state.lock().expect("state");
        state.batches.iter().map(|(object, _)| object.clone()).collect()
    }

    pub fn submitted(&self, object: &str) -> Vec<TransformedRecord> {
        let state = self.state.lock().expect("state");
        state
            .batches
            .iter()
            .filter(|(o, _)| o == object)
            .flat_map(|(_, records)| records.iter().cloned())
            .collect()
    }

    pub fn conversions(&self) -> Vec<LeadConversion> {
        self.state.lock().expect("state").conversions.clone()
    }

    pub fn queries(&self) -> Vec<String> {
        self.state.lock().expect("state").queries.clone()
    }

    fn check_batch(&self, object: &str, records: &[TransformedRecord]) -> Result<(), TargetError> {
        if records.len() > 1 && self.reject_batches.contains(object) {
            return Err(TargetError::Api {
                status: 400,
                code: "INVALID_BATCH".to_string(),
                message: format!("{object} batch of {} refused", records.len()),
            });
        }
        Ok(())
    }

    fn failure_for(&self, object: &str, fields: &FieldMap) -> Option<BatchOutcome> {
        self.failures
            .iter()
            .find(|f| {
                f.object == object
                    && fields.get(&f.field).and_then(JsonValue::as_str) == Some(f.value.as_str())
            })
            .map(|f| BatchOutcome::failed(&f.code, &f.message).with_fields(vec![f.field.clone()]))
    }

    fn store(state: &mut FakeState, object: &str, fields: FieldMap) -> String {
        state.next_id += 1;
        let id = format!("{}-{:04}", object, state.next_id);
        state.records.push(StoredRecord {
            object: object.to_string(),
            id: id.clone(),
            fields,
        });
        id
    }

    fn write(
        &self,
        object: &str,
        external_id_field: Option<&str>,
        records: &[TransformedRecord],
    ) -> Vec<BatchOutcome> {
        let mut state = self.state.lock().expect("state");
        state.batches.push((object.to_string(), records.to_vec()));
        records
            .iter()
            .map(|record| {
                if let Some(failure) = self.failure_for(object, &record.fields) {
                    return failure;
                }
                let key = external_id_field.and_then(|field| record.fields.get(field).cloned());
                let existing = key.as_ref().and_then(|key| {
                    state.records.iter_mut().find(|r| {
                        r.object == object
                            && external_id_field.and_then(|field| r.fields.get(field)) == Some(key)
                    })
                });
                match existing {
                    Some(existing) => {
                        existing.fields.extend(record.fields.clone());
                        BatchOutcome::created(existing.id.clone())
                    }
                    None => {
                        let id = Self::store(&mut state, object, record.fields.clone());
                        BatchOutcome::created(id)
                    }
                }
            })
            .collect()
    }
}

#[async_trait]
impl TargetSystem for FakeTarget {
    async fn describe(&self, object: &str) -> Result<ObjectDescription, TargetError> {
        if self.missing.contains(object) {
            return Ok(ObjectDescription::missing());
        }
        let mut fields = vec!["Id", "Name", "LastName", "Email", "AccountId"];
        if !self.without_external_id.contains(object) {
            fields.push(EXTERNAL_ID);
        }
        Ok(ObjectDescription::with_fields(fields))
    }

    async fn query(&self, soql: &str) -> Result<Vec<FieldMap>, TargetError> {
        self.state
            .lock()
            .expect("state")
            .queries
            .push(soql.to_string());
        Ok(self
            .responses
            .iter()
            .find(|(fragment, _)| soql.contains(fragment.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }

    async fn create(&self, object: &str, record: &FieldMap) -> Result<String, TargetError> {
        let mut state = self.state.lock().expect("state");
        Ok(Self::store(&mut state, object, record.clone()))
    }

    async fn insert_batch(
        &self,
        object: &str,
        records: &[TransformedRecord],
    ) -> Result<Vec<BatchOutcome>, TargetError> {
        self.check_batch(object, records)?;
        Ok(self.write(object, None, records))
    }

    async fn upsert_batch(
        &self,
        object: &str,
        external_id_field: &str,
        records: &[TransformedRecord],
    ) -> Result<Vec<BatchOutcome>, TargetError> {
        if self.refuse_upsert.contains(object) {
            return Err(TargetError::Api {
                status: 404,
                code: "NOT_FOUND".to_string(),
                message: format!(
                    "Provided external ID field does not exist or is not accessible: {}",
                    external_id_field
                ),
            });
        }
        self.check_batch(object, records)?;
        Ok(self.write(object, Some(external_id_field), records))
    }

    async fn delete(&self, object: &str, id: &str) -> Result<(), TargetError> {
        let mut state = self.state.lock().expect("state");
        let before = state.records.len();
        state.records.retain(|r| !(r.object == object && r.id == id));
        if state.records.len() == before {
            return Err(TargetError::Api {
                status: 404,
                code: "NOT_FOUND".to_string(),
                message: "The requested resource does not exist".to_string(),
            });
        }
        Ok(())
    }

    async fn convert_lead(&self, conversion: &LeadConversion) -> Result<(), TargetError> {
        self.state
            .lock()
            .expect("state")
            .conversions
            .push(conversion.clone());
        Ok(())
    }
}

pub async fn open_mappings(dir: &Path) -> Arc<IdMappingStore> {
    Arc::new(
        IdMappingStore::open(dir.join("id_mappings.db"))
            .await
            .expect("mapping store"),
    )
}

pub fn pipeline(
    source: &Arc<MemorySource>,
    target: &Arc<FakeTarget>,
    mappings: &Arc<IdMappingStore>,
    options: UploadOptions,
) -> UploadPipeline {
    UploadPipeline::new(
        rules(),
        source.clone(),
        target.clone(),
        mappings.clone(),
        options,
    )
    .expect("pipeline")
}

/// Three accounts and five contacts spread across them.
pub fn accounts_and_contacts() -> MemorySource {
    let accounts = (1..=3)
        .map(|n| {
            row(&[
                ("Id", json!(format!("001S{n}"))),
                ("Name", json!(format!("Account {n}"))),
                ("CreatedDate", json!("2024-01-01T00:00:00Z")),
            ])
        })
        .collect();
    let contacts = (1..=5)
        .map(|n| {
            row(&[
                ("Id", json!(format!("003S{n}"))),
                ("LastName", json!(format!("Contact {n}"))),
                ("AccountId", json!(format!("001S{}", (n - 1) % 3 + 1))),
            ])
        })
        .collect();
    MemorySource::default()
        .with("Account", accounts)
        .with("Contact", contacts)
}
