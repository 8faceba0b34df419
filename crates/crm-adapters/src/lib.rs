//! Target-system contract and the Salesforce REST implementation.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use crm_core::{BatchOutcome, FieldMap, TransformedRecord};
use crm_storage::{
    classify_reqwest_error, classify_status, BackoffPolicy, HttpClientConfig, RetryDisposition,
};
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "crm-adapters";

/// sObject Collections accept at most this many records per call.
pub const COLLECTION_LIMIT: usize = 200;

pub const TRANSPORT_ERROR_CODE: &str = "TRANSPORT_ERROR";
pub const PROTOCOL_ERROR_CODE: &str = "PROTOCOL_ERROR";

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("transport failure after retries: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("api error {status} {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TargetError {
    pub fn code(&self) -> &str {
        match self {
            Self::Transport(_) => TRANSPORT_ERROR_CODE,
            Self::Api { code, .. } => code,
            Self::Protocol(_) => PROTOCOL_ERROR_CODE,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Expands a chunk-level failure into one failed outcome per submitted record.
    pub fn to_outcomes(&self, count: usize) -> Vec<BatchOutcome> {
        let message = self.to_string();
        (0..count)
            .map(|_| BatchOutcome::failed(self.code(), message.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDescription {
    pub exists: bool,
    pub fields: BTreeSet<String>,
}

impl ObjectDescription {
    pub fn missing() -> Self {
        Self::default()
    }

    pub fn with_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exists: true,
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.fields.contains(field)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadConversion {
    pub lead_id: String,
    pub converted_status: String,
    pub account_id: String,
    pub contact_id: String,
    pub opportunity_id: Option<String>,
}

impl LeadConversion {
    pub fn payload(&self) -> JsonValue {
        let mut body = json!({
            "convertedStatus": self.converted_status,
            "accountId": self.account_id,
            "contactId": self.contact_id,
            "doNotCreateOpportunity": self.opportunity_id.is_none(),
            "sendNotificationEmail": false,
            "overwriteLeadSource": false,
        });
        if let Some(opportunity_id) = &self.opportunity_id {
            body["opportunityId"] = json!(opportunity_id);
        }
        body
    }
}

/// Remote record store the upload pipeline writes into.
///
/// Batch operations return exactly one outcome per submitted record, in submission order.
#[async_trait]
pub trait TargetSystem: Send + Sync {
    async fn describe(&self, object: &str) -> Result<ObjectDescription, TargetError>;

    async fn query(&self, soql: &str) -> Result<Vec<FieldMap>, TargetError>;

    async fn create(&self, object: &str, record: &FieldMap) -> Result<String, TargetError>;

    async fn insert_batch(
        &self,
        object: &str,
        records: &[TransformedRecord],
    ) -> Result<Vec<BatchOutcome>, TargetError>;

    async fn upsert_batch(
        &self,
        object: &str,
        external_id_field: &str,
        records: &[TransformedRecord],
    ) -> Result<Vec<BatchOutcome>, TargetError>;

    async fn delete(&self, object: &str, id: &str) -> Result<(), TargetError>;

    async fn convert_lead(&self, conversion: &LeadConversion) -> Result<(), TargetError>;
}

/// Rejects responses that break positional correspondence with the submitted batch.
pub fn ensure_positional(
    submitted: usize,
    outcomes: Vec<BatchOutcome>,
) -> Result<Vec<BatchOutcome>, TargetError> {
    if outcomes.len() != submitted {
        return Err(TargetError::Protocol(format!(
            "expected {submitted} outcomes, received {}",
            outcomes.len()
        )));
    }
    Ok(outcomes)
}

/// Escapes a literal for use inside single quotes in a SOQL statement.
pub fn soql_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

pub fn collection_body(object: &str, records: &[TransformedRecord]) -> JsonValue {
    let records: Vec<JsonValue> = records
        .iter()
        .map(|record| {
            let mut fields = FieldMap::new();
            fields.insert("attributes".to_string(), json!({ "type": object }));
            fields.extend(record.fields.clone());
            JsonValue::Object(fields)
        })
        .collect();
    json!({ "allOrNone": false, "records": records })
}

#[derive(Debug, Deserialize)]
struct CollectionItem {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<CollectionItemError>,
}

#[derive(Debug, Deserialize)]
struct CollectionItemError {
    #[serde(rename = "statusCode", alias = "errorCode", default)]
    status_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    fields: Vec<String>,
}

pub fn parse_collection_response(body: &JsonValue) -> Result<Vec<BatchOutcome>, TargetError> {
    let items: Vec<CollectionItem> = serde_json::from_value(body.clone())
        .map_err(|err| TargetError::Protocol(format!("malformed collection response: {err}")))?;

    Ok(items
        .into_iter()
        .map(|item| {
            if item.success {
                return match item.id {
                    Some(id) => BatchOutcome::created(id),
                    None => BatchOutcome::failed(PROTOCOL_ERROR_CODE, "success without id"),
                };
            }
            match item.errors.into_iter().next() {
                Some(error) => BatchOutcome::failed(
                    error.status_code.unwrap_or_else(|| "UNKNOWN_ERROR".to_string()),
                    error.message.unwrap_or_default(),
                )
                .with_fields(error.fields),
                None => BatchOutcome::failed("UNKNOWN_ERROR", "record rejected without errors"),
            }
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(rename = "errorCode", alias = "statusCode", default)]
    error_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Maps a non-success response body to [`TargetError::Api`].
pub fn parse_error_body(status: StatusCode, body: &str) -> TargetError {
    let parsed = serde_json::from_str::<Vec<ApiErrorBody>>(body)
        .ok()
        .and_then(|errors| errors.into_iter().next())
        .or_else(|| serde_json::from_str::<ApiErrorBody>(body).ok());

    let fallback_code = format!("HTTP_{}", status.as_u16());
    match parsed {
        Some(error) => TargetError::Api {
            status: status.as_u16(),
            code: error.error_code.unwrap_or(fallback_code),
            message: error.message.unwrap_or_default(),
        },
        None => TargetError::Api {
            status: status.as_u16(),
            code: fallback_code,
            message: body.chars().take(500).collect(),
        },
    }
}

fn strip_attributes(value: JsonValue) -> Option<FieldMap> {
    match value {
        JsonValue::Object(mut map) => {
            map.remove("attributes");
            Some(map)
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPage {
    pub records: Vec<FieldMap>,
    pub next_records_url: Option<String>,
}

pub fn parse_query_page(body: &JsonValue) -> QueryPage {
    let records = body
        .get("records")
        .and_then(JsonValue::as_array)
        .map(|rows| rows.iter().cloned().filter_map(strip_attributes).collect())
        .unwrap_or_default();
    let done = body.get("done").and_then(JsonValue::as_bool).unwrap_or(true);
    let next_records_url = if done {
        None
    } else {
        body.get("nextRecordsUrl")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
    };
    QueryPage {
        records,
        next_records_url,
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("missing environment variable {0}")]
    Missing(String),
}

/// Bearer session for one org. Acquiring the token happens outside this crate.
#[derive(Clone)]
pub struct SessionCredentials {
    pub instance_url: String,
    pub access_token: String,
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("instance_url", &self.instance_url)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

impl SessionCredentials {
    /// Reads `{prefix}_INSTANCE_URL` and `{prefix}_ACCESS_TOKEN`.
    pub fn from_env(prefix: &str) -> Result<Self, CredentialError> {
        let read = |suffix: &str| {
            let key = format!("{prefix}_{suffix}");
            std::env::var(&key)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or(CredentialError::Missing(key))
        };
        Ok(Self {
            instance_url: read("INSTANCE_URL")?.trim_end_matches('/').to_string(),
            access_token: read("ACCESS_TOKEN")?,
        })
    }
}

#[derive(Debug)]
pub struct SalesforceClient {
    client: reqwest::Client,
    instance_url: String,
    base_url: String,
    access_token: String,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl SalesforceClient {
    pub fn new(
        credentials: SessionCredentials,
        api_version: &str,
        http: &HttpClientConfig,
    ) -> anyhow::Result<Self> {
        let client = http.build_client().context("building salesforce client")?;
        let instance_url = credentials.instance_url.trim_end_matches('/').to_string();
        let base_url = format!(
            "{instance_url}/services/data/v{}/",
            api_version.trim_start_matches('v')
        );
        Ok(Self {
            client,
            instance_url,
            base_url,
            access_token: credentials.access_token,
            limit: Arc::new(Semaphore::new(http.concurrency.max(1))),
            backoff: http.backoff,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&JsonValue>,
    ) -> Result<Option<JsonValue>, TargetError> {
        let _permit = self
            .limit
            .acquire()
            .await
            .map_err(|_| TargetError::Protocol("request limiter closed".to_string()))?;

        let span = info_span!("salesforce_request", %method, path = url.path());
        async {
            let mut attempt = 0usize;
            loop {
                let mut request = self
                    .client
                    .request(method.clone(), url.clone())
                    .bearer_auth(&self.access_token);
                if let Some(body) = body {
                    request = request.json(body);
                }

                match request.send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            let text = resp.text().await?;
                            if text.trim().is_empty() {
                                return Ok(None);
                            }
                            return serde_json::from_str(&text).map(Some).map_err(|err| {
                                TargetError::Protocol(format!("invalid json response: {err}"))
                            });
                        }

                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(%status, attempt, "retrying salesforce request");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }

                        let text = resp.text().await.unwrap_or_default();
                        return Err(parse_error_body(status, &text));
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(error = %err, attempt, "retrying salesforce request");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(TargetError::Transport(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    fn parse_url(&self, raw: &str) -> Result<Url, TargetError> {
        Url::parse(raw).map_err(|err| TargetError::Protocol(format!("invalid url {raw}: {err}")))
    }

    async fn submit_collection(
        &self,
        method: Method,
        path: &str,
        object: &str,
        records: &[TransformedRecord],
    ) -> Result<Vec<BatchOutcome>, TargetError> {
        let url = self.parse_url(&self.api_url(path))?;
        let mut outcomes = Vec::with_capacity(records.len());
        for chunk in records.chunks(COLLECTION_LIMIT) {
            let body = collection_body(object, chunk);
            let response = self
                .send(method.clone(), url.clone(), Some(&body))
                .await?
                .ok_or_else(|| TargetError::Protocol("empty collection response".to_string()))?;
            outcomes.extend(ensure_positional(
                chunk.len(),
                parse_collection_response(&response)?,
            )?);
        }
        Ok(outcomes)
    }
}

#[async_trait]
impl TargetSystem for SalesforceClient {
    async fn describe(&self, object: &str) -> Result<ObjectDescription, TargetError> {
        let url = self.parse_url(&self.api_url(&format!("sobjects/{object}/describe")))?;
        let body = match self.send(Method::GET, url, None).await {
            Ok(body) => body.unwrap_or(JsonValue::Null),
            Err(err) if err.status() == Some(404) || err.code() == "NOT_FOUND" => {
                debug!(object, "object type not available in target");
                return Ok(ObjectDescription::missing());
            }
            Err(err) => return Err(err),
        };

        let fields = body
            .get("fields")
            .and_then(JsonValue::as_array)
            .map(|fields| {
                fields
                    .iter()
                    .filter_map(|f| f.get("name").and_then(JsonValue::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(ObjectDescription {
            exists: true,
            fields,
        })
    }

    async fn query(&self, soql: &str) -> Result<Vec<FieldMap>, TargetError> {
        let url = Url::parse_with_params(&self.api_url("query"), &[("q", soql)])
            .map_err(|err| TargetError::Protocol(format!("invalid query url: {err}")))?;

        let mut records = Vec::new();
        let mut next = Some(url);
        while let Some(url) = next.take() {
            let page = self
                .send(Method::GET, url, None)
                .await?
                .ok_or_else(|| TargetError::Protocol("empty query response".to_string()))?;
            let page = parse_query_page(&page);
            records.extend(page.records);
            if let Some(path) = page.next_records_url {
                next = Some(self.parse_url(&format!("{}{path}", self.instance_url))?);
            }
        }
        Ok(records)
    }

    async fn create(&self, object: &str, record: &FieldMap) -> Result<String, TargetError> {
        let url = self.parse_url(&self.api_url(&format!("sobjects/{object}")))?;
        let body = JsonValue::Object(record.clone());
        let response = self.send(Method::POST, url, Some(&body)).await?;
        response
            .as_ref()
            .and_then(|r| r.get("id"))
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| TargetError::Protocol(format!("create {object} returned no id")))
    }

    async fn insert_batch(
        &self,
        object: &str,
        records: &[TransformedRecord],
    ) -> Result<Vec<BatchOutcome>, TargetError> {
        self.submit_collection(Method::POST, "composite/sobjects", object, records)
            .await
    }

    async fn upsert_batch(
        &self,
        object: &str,
        external_id_field: &str,
        records: &[TransformedRecord],
    ) -> Result<Vec<BatchOutcome>, TargetError> {
        let path = format!("composite/sobjects/{object}/{external_id_field}");
        self.submit_collection(Method::PATCH, &path, object, records)
            .await
    }

    async fn delete(&self, object: &str, id: &str) -> Result<(), TargetError> {
        let url = self.parse_url(&self.api_url(&format!("sobjects/{object}/{id}")))?;
        self.send(Method::DELETE, url, None).await.map(|_| ())
    }

    async fn convert_lead(&self, conversion: &LeadConversion) -> Result<(), TargetError> {
        let url = self.parse_url(
            &self.api_url(&format!("sobjects/Lead/{}/convert", conversion.lead_id)),
        )?;
        let body = conversion.payload();
        let response = self.send(Method::POST, url, Some(&body)).await?;
        let success = response
            .as_ref()
            .and_then(|r| r.get("success"))
            .and_then(JsonValue::as_bool)
            .unwrap_or(true);
        if success {
            return Ok(());
        }

        let error = response
            .as_ref()
            .and_then(|r| r.get("errors"))
            .cloned()
            .unwrap_or(JsonValue::Null);
        Err(TargetError::Api {
            status: 200,
            code: error
                .pointer("/0/statusCode")
                .and_then(JsonValue::as_str)
                .unwrap_or("CONVERSION_FAILED")
                .to_string(),
            message: error
                .pointer("/0/message")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_body_tags_each_record_with_its_type() {
        let mut record = TransformedRecord::new(Some("A1".into()));
        record.fields.insert("Name".into(), json!("Acme"));
        let body = collection_body("Account", &[record]);

        assert_eq!(body["allOrNone"], json!(false));
        assert_eq!(body["records"][0]["attributes"]["type"], json!("Account"));
        assert_eq!(body["records"][0]["Name"], json!("Acme"));
    }

    #[test]
    fn soql_literals_are_escaped() {
        assert_eq!(soql_quote("O'Brien"), "'O\\'Brien'");
        assert_eq!(soql_quote("a\\b"), "'a\\\\b'");
    }

    #[test]
    fn mis_sized_responses_are_protocol_errors() {
        let outcomes = vec![BatchOutcome::created("001A")];
        let err = ensure_positional(2, outcomes).expect_err("size mismatch");
        assert_eq!(err.code(), PROTOCOL_ERROR_CODE);
    }

    #[test]
    fn chunk_errors_expand_to_every_record() {
        let err = TargetError::Protocol("boom".into());
        let outcomes = err.to_outcomes(3);
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| !o.success));
    }

    #[test]
    fn conversion_without_opportunity_skips_creation() {
        let conversion = LeadConversion {
            lead_id: "00QA".into(),
            converted_status: "Closed - Converted".into(),
            account_id: "001A".into(),
            contact_id: "003A".into(),
            opportunity_id: None,
        };
        let payload = conversion.payload();
        assert_eq!(payload["doNotCreateOpportunity"], json!(true));
        assert!(payload.get("opportunityId").is_none());
    }
}
