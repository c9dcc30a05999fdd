//! Bill payment adapter
//!
//! Aggregator authenticated with an `api-key`/`secret-key` header pair.
//! Amounts are sent in major units. The `request_id` must start with the
//! request time as `YYYYMMDDHHmm` in provider-local time; we derive it from
//! the transaction id's embedded timestamp so retries reproduce it exactly.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use reqwest::RequestBuilder;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::http::{ProviderContext, read_json};
use super::{
    Credentials, IdempotencyKey, InitiateOutcome, ProviderAdapter, ProviderError, ProviderKind,
    StatusOutcome, TransferDetails, VerifyOutcome,
};
use crate::core_types::TransactionId;
use crate::money::format_minor;
use crate::transfer::types::Counterparty;

const CODE_OK: &str = "000";
const CODE_PROCESSING: &str = "099";
const CODE_IN_PROGRESS: &str = "089";
const CODE_FAILED: &str = "016";
const CODE_REVERSED: &str = "040";
const CODE_NOT_PROCESSED: &str = "091";
/// Requery: no transaction under that request_id
const CODE_UNKNOWN_REQUEST: &str = "015";
/// The request_id was already used
const CODE_REQUEST_ID_EXISTS: &str = "014";
const CODE_LIKELY_DUPLICATE: &str = "019";
/// Refused before anything was processed
const REFUSAL_CODES: &[&str] = &[
    "010", "011", "012", "013", "017", "018", "021", "022", "023", "024", "028", "031", "032",
    "034", "035",
];

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    code: String,
    #[serde(default)]
    content: VerifyContent,
}

#[derive(Debug, Default, Deserialize)]
struct VerifyContent {
    #[serde(rename = "Customer_Name")]
    customer_name: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PayResponse {
    code: String,
    #[serde(default)]
    response_description: String,
    content: Option<PayContent>,
}

#[derive(Debug, Deserialize)]
struct PayContent {
    transactions: Option<PayTransaction>,
}

#[derive(Debug, Deserialize)]
struct PayTransaction {
    status: String,
}

pub struct BillPaymentProvider {
    ctx: ProviderContext,
    local_offset: FixedOffset,
}

impl BillPaymentProvider {
    pub fn new(ctx: ProviderContext, local_offset: FixedOffset) -> Self {
        Self { ctx, local_offset }
    }

    fn authed(&self, rb: RequestBuilder) -> Result<RequestBuilder, ProviderError> {
        match self.ctx.credentials() {
            Credentials::ApiKeys {
                api_key,
                secret_key,
            } => Ok(rb.header("api-key", api_key).header("secret-key", secret_key)),
            other => Err(ProviderError::NotConfigured(format!(
                "bill provider needs api/secret keys, got {:?}",
                other
            ))),
        }
    }

    /// `YYYYMMDDHHmm` (local) followed by the key
    pub fn request_id(&self, key: &IdempotencyKey) -> Result<String, ProviderError> {
        let id: TransactionId = key
            .as_str()
            .parse()
            .map_err(|e| ProviderError::InvalidRequest(format!("idempotency key: {}", e)))?;
        let created: DateTime<Utc> = DateTime::<Utc>::from(id.inner().datetime());
        let prefix = created
            .with_timezone(&self.local_offset)
            .format("%Y%m%d%H%M");
        Ok(format!("{}{}", prefix, key.as_str().to_ascii_lowercase()))
    }

    /// Codes we do not recognise stay `Processing`: only an explicit verdict
    /// may release the debit
    fn map_pay(&self, resp: PayResponse) -> PayState {
        let tx_status = resp
            .content
            .and_then(|c| c.transactions)
            .map(|t| t.status)
            .unwrap_or_default();
        let code = resp.code.as_str();
        match (code, tx_status.as_str()) {
            (CODE_OK, "delivered") => PayState::Delivered,
            (CODE_OK, "failed" | "reversed") | (CODE_FAILED | CODE_REVERSED | CODE_NOT_PROCESSED, _) => {
                PayState::Failed(non_empty(resp.response_description, "transaction failed"))
            }
            (CODE_OK | CODE_PROCESSING | CODE_IN_PROGRESS, _) => PayState::Processing,
            (CODE_REQUEST_ID_EXISTS | CODE_LIKELY_DUPLICATE, _) => PayState::Duplicate,
            (CODE_UNKNOWN_REQUEST, _) => PayState::Unknown,
            _ if REFUSAL_CODES.contains(&code) => PayState::Failed(non_empty(
                resp.response_description,
                &format!("provider code {}", code),
            )),
            _ => {
                warn!(code, description = %resp.response_description, "Unrecognised bill provider code");
                PayState::Processing
            }
        }
    }

    async fn requery(&self, request_id: &str) -> Result<PayState, ProviderError> {
        let rb = self
            .ctx
            .client()
            .post(self.ctx.url("requery"))
            .json(&json!({ "request_id": request_id }));
        let (_, resp): (u16, PayResponse) = read_json(self.authed(rb)?.send().await?).await?;
        Ok(self.map_pay(resp))
    }
}

enum PayState {
    Delivered,
    Processing,
    Failed(String),
    /// The provider has already seen this request
    Duplicate,
    /// No record of the request
    Unknown,
}

fn non_empty(s: String, fallback: &str) -> String {
    if s.trim().is_empty() {
        fallback.to_string()
    } else {
        s
    }
}

#[async_trait]
impl ProviderAdapter for BillPaymentProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Bills
    }

    async fn verify_counterparty(
        &self,
        counterparty: &Counterparty,
    ) -> Result<VerifyOutcome, ProviderError> {
        let Counterparty::Biller {
            service_id,
            customer_id,
            variation_code,
            ..
        } = counterparty
        else {
            return Err(ProviderError::InvalidRequest(
                "bill provider only serves billers".into(),
            ));
        };
        counterparty
            .check_identifiers()
            .map_err(ProviderError::InvalidRequest)?;

        let mut body = json!({ "billersCode": customer_id, "serviceID": service_id });
        if let Some(variation) = variation_code {
            body["type"] = json!(variation);
        }
        let rb = self
            .ctx
            .client()
            .post(self.ctx.url("merchant-verify"))
            .json(&body);
        let (_, resp): (u16, VerifyResponse) = read_json(self.authed(rb)?.send().await?).await?;

        if resp.code != CODE_OK {
            return Ok(VerifyOutcome::Invalid(format!("provider code {}", resp.code)));
        }
        if let Some(error) = resp.content.error {
            return Ok(VerifyOutcome::Invalid(error));
        }
        match resp.content.customer_name {
            Some(name) if !name.trim().is_empty() => Ok(VerifyOutcome::Valid {
                display_name: name.trim().to_string(),
            }),
            _ => Ok(VerifyOutcome::Invalid("customer not found".into())),
        }
    }

    async fn initiate(
        &self,
        details: &TransferDetails,
        key: &IdempotencyKey,
    ) -> Result<InitiateOutcome, ProviderError> {
        details.validate()?;
        let Counterparty::Biller {
            service_id,
            customer_id,
            variation_code,
            phone,
        } = &details.counterparty
        else {
            return Err(ProviderError::InvalidRequest(
                "bill provider only serves billers".into(),
            ));
        };

        let request_id = self.request_id(key)?;
        let mut body = json!({
            "request_id": request_id,
            "serviceID": service_id,
            "billersCode": customer_id,
            "amount": format_minor(details.amount, details.currency.decimals()),
            "phone": phone.as_deref().unwrap_or(customer_id),
        });
        if let Some(variation) = variation_code {
            body["variation_code"] = json!(variation);
        }

        let rb = self.ctx.client().post(self.ctx.url("pay")).json(&body);
        let (_, resp): (u16, PayResponse) = read_json(self.authed(rb)?.send().await?).await?;
        debug!(request_id = %request_id, code = %resp.code, "Bill payment submitted");

        Ok(match self.map_pay(resp) {
            PayState::Delivered => InitiateOutcome::Completed(request_id),
            PayState::Processing | PayState::Unknown => InitiateOutcome::Pending(request_id),
            PayState::Failed(reason) => InitiateOutcome::Rejected(reason),
            PayState::Duplicate => {
                info!(request_id = %request_id, "Bill payment already submitted, querying original");
                self.lookup(key)
                    .await?
                    .unwrap_or(InitiateOutcome::Pending(request_id))
            }
        })
    }

    async fn query_status(&self, reference: &str) -> Result<StatusOutcome, ProviderError> {
        Ok(match self.requery(reference).await? {
            PayState::Delivered => StatusOutcome::Completed,
            PayState::Failed(reason) => StatusOutcome::Failed(reason),
            PayState::Processing | PayState::Duplicate | PayState::Unknown => {
                StatusOutcome::StillPending
            }
        })
    }

    async fn lookup(&self, key: &IdempotencyKey) -> Result<Option<InitiateOutcome>, ProviderError> {
        let request_id = self.request_id(key)?;
        Ok(match self.requery(&request_id).await? {
            PayState::Delivered => Some(InitiateOutcome::Completed(request_id)),
            PayState::Failed(reason) => Some(InitiateOutcome::Rejected(reason)),
            PayState::Processing | PayState::Duplicate => Some(InitiateOutcome::Pending(request_id)),
            PayState::Unknown => None,
        })
    }
}
