//! Bank payout adapter
//!
//! Bearer-token payout API: resolve the account, create a transfer
//! recipient, then transfer with our idempotency key as the `reference`.
//! Amounts are sent in minor units.

use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::http::{ProviderContext, read_json};
use super::{
    Credentials, IdempotencyKey, InitiateOutcome, ProviderAdapter, ProviderError, ProviderKind,
    StatusOutcome, TransferDetails, VerifyOutcome,
};
use crate::transfer::types::Counterparty;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: bool,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ResolvedAccount {
    account_name: String,
}

#[derive(Debug, Deserialize)]
struct Recipient {
    recipient_code: String,
}

#[derive(Debug, Deserialize)]
struct TransferData {
    status: String,
}

pub struct BankTransferProvider {
    ctx: ProviderContext,
}

enum TransferState {
    Success,
    InFlight,
    Failed,
}

fn classify(status: &str) -> TransferState {
    match status {
        "success" => TransferState::Success,
        "failed" | "reversed" | "abandoned" | "rejected" | "blocked" => TransferState::Failed,
        // pending, received, otp, queued
        _ => TransferState::InFlight,
    }
}

impl BankTransferProvider {
    pub fn new(ctx: ProviderContext) -> Self {
        Self { ctx }
    }

    fn authed(&self, rb: RequestBuilder) -> Result<RequestBuilder, ProviderError> {
        match self.ctx.credentials() {
            Credentials::Bearer { secret_key } => Ok(rb.bearer_auth(secret_key)),
            other => Err(ProviderError::NotConfigured(format!(
                "bank provider needs a bearer secret, got {:?}",
                other
            ))),
        }
    }

    /// Provider references must be lowercase
    fn reference_for(key: &IdempotencyKey) -> String {
        key.as_str().to_ascii_lowercase()
    }

    async fn resolve(
        &self,
        account_number: &str,
        bank_code: &str,
    ) -> Result<Envelope<ResolvedAccount>, ProviderError> {
        let rb = self
            .ctx
            .client()
            .get(self.ctx.url("bank/resolve"))
            .query(&[("account_number", account_number), ("bank_code", bank_code)]);
        let (_, body) = read_json(self.authed(rb)?.send().await?).await?;
        Ok(body)
    }

    /// `None` when the provider has no transfer under `reference`
    async fn verify_transfer(&self, reference: &str) -> Result<Option<StatusOutcome>, ProviderError> {
        let rb = self
            .ctx
            .client()
            .get(self.ctx.url(&format!("transfer/verify/{}", reference)));
        let (http_status, body): (u16, Envelope<TransferData>) =
            read_json(self.authed(rb)?.send().await?).await?;

        match (body.status, body.data) {
            (true, Some(data)) => Ok(Some(match classify(&data.status) {
                TransferState::Success => StatusOutcome::Completed,
                TransferState::Failed => StatusOutcome::Failed(format!("transfer {}", data.status)),
                TransferState::InFlight => StatusOutcome::StillPending,
            })),
            _ => {
                warn!(reference, http_status, message = %body.message, "Bank transfer lookup inconclusive");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl ProviderAdapter for BankTransferProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Bank
    }

    async fn verify_counterparty(
        &self,
        counterparty: &Counterparty,
    ) -> Result<VerifyOutcome, ProviderError> {
        let Counterparty::BankAccount {
            account_number,
            bank_code,
        } = counterparty
        else {
            return Err(ProviderError::InvalidRequest(
                "bank provider only serves bank accounts".into(),
            ));
        };
        counterparty
            .check_identifiers()
            .map_err(ProviderError::InvalidRequest)?;

        let resolved = self.resolve(account_number, bank_code).await?;
        match (resolved.status, resolved.data) {
            (true, Some(account)) => Ok(VerifyOutcome::Valid {
                display_name: account.account_name,
            }),
            _ => Ok(VerifyOutcome::Invalid(resolved.message)),
        }
    }

    async fn initiate(
        &self,
        details: &TransferDetails,
        key: &IdempotencyKey,
    ) -> Result<InitiateOutcome, ProviderError> {
        details.validate()?;
        let Counterparty::BankAccount {
            account_number,
            bank_code,
        } = &details.counterparty
        else {
            return Err(ProviderError::InvalidRequest(
                "bank provider only serves bank accounts".into(),
            ));
        };

        let resolved = self.resolve(account_number, bank_code).await?;
        let account_name = match (resolved.status, resolved.data) {
            (true, Some(account)) => account.account_name,
            _ => return Ok(InitiateOutcome::Rejected(resolved.message)),
        };

        let rb = self
            .ctx
            .client()
            .post(self.ctx.url("transferrecipient"))
            .json(&json!({
                "type": "nuban",
                "name": account_name,
                "account_number": account_number,
                "bank_code": bank_code,
                "currency": details.currency.as_str(),
            }));
        let (_, recipient): (u16, Envelope<Recipient>) =
            read_json(self.authed(rb)?.send().await?).await?;
        let recipient_code = match (recipient.status, recipient.data) {
            (true, Some(r)) => r.recipient_code,
            _ => return Ok(InitiateOutcome::Rejected(recipient.message)),
        };

        let reference = Self::reference_for(key);
        let rb = self.ctx.client().post(self.ctx.url("transfer")).json(&json!({
            "source": "balance",
            "amount": details.amount,
            "recipient": recipient_code,
            "reference": reference,
            "reason": details.description,
            "currency": details.currency.as_str(),
        }));
        let (_, transfer): (u16, Envelope<TransferData>) =
            read_json(self.authed(rb)?.send().await?).await?;

        if !transfer.status {
            let message = transfer.message.to_ascii_lowercase();
            if message.contains("reference") && (message.contains("exist") || message.contains("duplicate")) {
                // A previous attempt with this key got through; report what it became.
                info!(reference = %reference, "Transfer reference already used, querying original");
                return Ok(self
                    .lookup(key)
                    .await?
                    .unwrap_or(InitiateOutcome::Pending(reference)));
            }
            return Ok(InitiateOutcome::Rejected(transfer.message));
        }

        let data = transfer
            .data
            .ok_or_else(|| ProviderError::Decode("transfer response without data".into()))?;
        debug!(reference = %reference, status = %data.status, "Bank transfer submitted");
        Ok(match classify(&data.status) {
            TransferState::Success => InitiateOutcome::Completed(reference),
            TransferState::InFlight => InitiateOutcome::Pending(reference),
            TransferState::Failed => {
                InitiateOutcome::Rejected(format!("transfer {}", data.status))
            }
        })
    }

    async fn query_status(&self, reference: &str) -> Result<StatusOutcome, ProviderError> {
        // Not finding a transfer is not proof it never happened
        Ok(self
            .verify_transfer(reference)
            .await?
            .unwrap_or(StatusOutcome::StillPending))
    }

    async fn lookup(&self, key: &IdempotencyKey) -> Result<Option<InitiateOutcome>, ProviderError> {
        let reference = Self::reference_for(key);
        Ok(self
            .verify_transfer(&reference)
            .await?
            .map(|status| InitiateOutcome::from_status(reference, status)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{Currency, TransactionId};
    use mockito::Matcher;
    use std::time::Duration;

    fn provider(url: String) -> BankTransferProvider {
        BankTransferProvider::new(ProviderContext::new(
            url,
            Credentials::Bearer {
                secret_key: "sk_test_123".into(),
            },
            Duration::from_secs(5),
        )
        .unwrap())
    }

    fn account() -> Counterparty {
        Counterparty::BankAccount {
            account_number: "0123456789".into(),
            bank_code: "058".into(),
        }
    }

    fn details(amount: u64) -> TransferDetails {
        TransferDetails {
            transaction_id: TransactionId::new(),
            owner_id: 1,
            amount,
            currency: Currency::ngn(),
            counterparty: account(),
            description: "rent".into(),
        }
    }

    async fn mock_resolve(server: &mut mockito::ServerGuard) -> mockito::Mock {
        server
            .mock("GET", "/bank/resolve")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("account_number".into(), "0123456789".into()),
                Matcher::UrlEncoded("bank_code".into(), "058".into()),
            ]))
            .match_header("authorization", "Bearer sk_test_123")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":true,"message":"Account number resolved","data":{"account_number":"0123456789","account_name":"ADA OBI"}}"#)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_verify_resolves_account_name() {
        let mut server = mockito::Server::new_async().await;
        let m = mock_resolve(&mut server).await;

        let outcome = provider(server.url())
            .verify_counterparty(&account())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            VerifyOutcome::Valid {
                display_name: "ADA OBI".into()
            }
        );
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_verify_unknown_account_is_invalid() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/bank/resolve")
            .match_query(Matcher::Any)
            .with_status(422)
            .with_body(r#"{"status":false,"message":"Could not resolve account name"}"#)
            .create_async()
            .await;

        let outcome = provider(server.url())
            .verify_counterparty(&account())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            VerifyOutcome::Invalid("Could not resolve account name".into())
        );
    }

    #[tokio::test]
    async fn test_initiate_success() {
        let mut server = mockito::Server::new_async().await;
        mock_resolve(&mut server).await;
        server
            .mock("POST", "/transferrecipient")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "name": "ADA OBI",
                "account_number": "0123456789"
            })))
            .with_status(201)
            .with_body(r#"{"status":true,"message":"Recipient created","data":{"recipient_code":"RCP_abc"}}"#)
            .create_async()
            .await;

        let d = details(250_000);
        let key = IdempotencyKey::for_transaction(d.transaction_id);
        let reference = key.as_str().to_ascii_lowercase();
        let transfer = server
            .mock("POST", "/transfer")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "amount": 250_000,
                "recipient": "RCP_abc",
                "reference": reference
            })))
            .with_status(200)
            .with_body(r#"{"status":true,"message":"Transfer has been queued","data":{"status":"success","transfer_code":"TRF_1"}}"#)
            .expect(1)
            .create_async()
            .await;

        let outcome = provider(server.url()).initiate(&d, &key).await.unwrap();
        assert_eq!(outcome, InitiateOutcome::Completed(reference));
        transfer.assert_async().await;
    }

    #[tokio::test]
    async fn test_initiate_duplicate_reference_reports_original() {
        let mut server = mockito::Server::new_async().await;
        mock_resolve(&mut server).await;
        server
            .mock("POST", "/transferrecipient")
            .with_status(201)
            .with_body(r#"{"status":true,"message":"ok","data":{"recipient_code":"RCP_abc"}}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/transfer")
            .with_status(400)
            .with_body(r#"{"status":false,"message":"Transfer reference already exists"}"#)
            .create_async()
            .await;

        let d = details(1_000);
        let key = IdempotencyKey::for_transaction(d.transaction_id);
        let reference = key.as_str().to_ascii_lowercase();
        server
            .mock("GET", format!("/transfer/verify/{}", reference).as_str())
            .with_status(200)
            .with_body(r#"{"status":true,"message":"ok","data":{"status":"pending"}}"#)
            .create_async()
            .await;

        let outcome = provider(server.url()).initiate(&d, &key).await.unwrap();
        assert_eq!(outcome, InitiateOutcome::Pending(reference));
    }

    #[tokio::test]
    async fn test_initiate_server_error_is_retryable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/bank/resolve")
            .match_query(Matcher::Any)
            .with_status(502)
            .with_body("bad gateway")
            .create_async()
            .await;

        let d = details(1_000);
        let err = provider(server.url())
            .initiate(&d, &IdempotencyKey::for_transaction(d.transaction_id))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_zero_amount_never_hits_network() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let d = details(0);
        let err = provider(server.url())
            .initiate(&d, &IdempotencyKey::for_transaction(d.transaction_id))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidRequest(_)));
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_query_status_mapping() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/transfer/verify/ref_ok")
            .with_status(200)
            .with_body(r#"{"status":true,"message":"ok","data":{"status":"success"}}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/transfer/verify/ref_rev")
            .with_status(200)
            .with_body(r#"{"status":true,"message":"ok","data":{"status":"reversed"}}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/transfer/verify/ref_missing")
            .with_status(404)
            .with_body(r#"{"status":false,"message":"Transfer not found"}"#)
            .create_async()
            .await;

        let p = provider(server.url());
        assert_eq!(p.query_status("ref_ok").await.unwrap(), StatusOutcome::Completed);
        assert!(matches!(
            p.query_status("ref_rev").await.unwrap(),
            StatusOutcome::Failed(_)
        ));
        assert_eq!(
            p.query_status("ref_missing").await.unwrap(),
            StatusOutcome::StillPending
        );
    }

    #[tokio::test]
    async fn test_lookup_by_key() {
        let mut server = mockito::Server::new_async().await;
        let found = IdempotencyKey::for_transaction(TransactionId::new());
        let unknown = IdempotencyKey::for_transaction(TransactionId::new());
        let found_ref = found.as_str().to_ascii_lowercase();
        server
            .mock("GET", format!("/transfer/verify/{}", found_ref).as_str())
            .with_status(200)
            .with_body(r#"{"status":true,"message":"ok","data":{"status":"success"}}"#)
            .create_async()
            .await;
        server
            .mock(
                "GET",
                format!("/transfer/verify/{}", unknown.as_str().to_ascii_lowercase()).as_str(),
            )
            .with_status(404)
            .with_body(r#"{"status":false,"message":"Transfer not found"}"#)
            .create_async()
            .await;

        let p = provider(server.url());
        assert_eq!(
            p.lookup(&found).await.unwrap(),
            Some(InitiateOutcome::Completed(found_ref))
        );
        assert_eq!(p.lookup(&unknown).await.unwrap(), None);
    }
}
