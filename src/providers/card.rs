//! Virtual card funding adapter
//!
//! Bearer-token card issuer. Funding carries our idempotency key as the
//! `paymentReference`, which is also what the transfer lookup takes.

use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::http::{ProviderContext, read_json};
use super::{
    Credentials, IdempotencyKey, InitiateOutcome, ProviderAdapter, ProviderError, ProviderKind,
    StatusOutcome, TransferDetails, VerifyOutcome,
};
use crate::money::to_major;
use crate::transfer::types::Counterparty;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    status_code: u16,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Card {
    status: String,
    #[serde(default)]
    masked_pan: String,
    #[serde(default)]
    currency: String,
}

#[derive(Debug, Deserialize)]
struct Funding {
    status: String,
}

pub struct CardFundingProvider {
    ctx: ProviderContext,
}

impl CardFundingProvider {
    pub fn new(ctx: ProviderContext) -> Self {
        Self { ctx }
    }

    fn authed(&self, rb: RequestBuilder) -> Result<RequestBuilder, ProviderError> {
        match self.ctx.credentials() {
            Credentials::Bearer { secret_key } => Ok(rb.bearer_auth(secret_key)),
            other => Err(ProviderError::NotConfigured(format!(
                "card provider needs a bearer secret, got {:?}",
                other
            ))),
        }
    }

    async fn card(&self, card_id: &str) -> Result<Envelope<Card>, ProviderError> {
        let rb = self
            .ctx
            .client()
            .get(self.ctx.url(&format!("cards/{}", card_id)));
        let (_, body) = read_json(self.authed(rb)?.send().await?).await?;
        Ok(body)
    }

    /// `None` when the issuer has no funding under `reference`
    async fn funding(&self, reference: &str) -> Result<Option<StatusOutcome>, ProviderError> {
        let rb = self
            .ctx
            .client()
            .get(self.ctx.url(&format!("cards/transfers/{}", reference)));
        let (_, resp): (u16, Envelope<Funding>) =
            read_json(self.authed(rb)?.send().await?).await?;

        Ok(resp.data.map(|funding| match classify(&funding.status) {
            FundingState::Completed => StatusOutcome::Completed,
            FundingState::Failed => StatusOutcome::Failed(format!("funding {}", funding.status)),
            FundingState::InFlight => StatusOutcome::StillPending,
        }))
    }

    /// Outcome of the earlier call that used `key`
    async fn original(
        &self,
        key: &IdempotencyKey,
        reference: String,
    ) -> Result<InitiateOutcome, ProviderError> {
        info!(reference = %reference, "Payment reference already used, querying original");
        Ok(self
            .lookup(key)
            .await?
            .unwrap_or(InitiateOutcome::Pending(reference)))
    }
}

enum FundingState {
    Completed,
    Failed,
    InFlight,
}

fn classify(status: &str) -> FundingState {
    match status.to_ascii_lowercase().as_str() {
        "completed" | "success" | "successful" => FundingState::Completed,
        "failed" | "declined" | "reversed" => FundingState::Failed,
        _ => FundingState::InFlight,
    }
}

fn is_duplicate(http_status: u16, message: &str) -> bool {
    http_status == 409 || message.to_ascii_lowercase().contains("duplicate")
}

#[async_trait]
impl ProviderAdapter for CardFundingProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Card
    }

    async fn verify_counterparty(
        &self,
        counterparty: &Counterparty,
    ) -> Result<VerifyOutcome, ProviderError> {
        let Counterparty::Card { card_id } = counterparty else {
            return Err(ProviderError::InvalidRequest(
                "card provider only serves cards".into(),
            ));
        };
        counterparty
            .check_identifiers()
            .map_err(ProviderError::InvalidRequest)?;

        let resp = self.card(card_id).await?;
        match resp.data {
            Some(card) if resp.status_code == 200 && card.status.eq_ignore_ascii_case("active") => {
                Ok(VerifyOutcome::Valid {
                    display_name: format!("{} {}", card.currency, card.masked_pan)
                        .trim()
                        .to_string(),
                })
            }
            Some(card) => Ok(VerifyOutcome::Invalid(format!("card is {}", card.status))),
            None => Ok(VerifyOutcome::Invalid(resp.message)),
        }
    }

    async fn initiate(
        &self,
        details: &TransferDetails,
        key: &IdempotencyKey,
    ) -> Result<InitiateOutcome, ProviderError> {
        details.validate()?;
        let Counterparty::Card { card_id } = &details.counterparty else {
            return Err(ProviderError::InvalidRequest(
                "card provider only serves cards".into(),
            ));
        };

        let reference = key.as_str().to_string();
        let rb = self
            .ctx
            .client()
            .post(self.ctx.url(&format!("cards/{}/fund", card_id)))
            .json(&json!({
                "amount": to_major(details.amount, details.currency.decimals()),
                "currency": details.currency.as_str(),
                "paymentReference": reference,
                "narration": details.description,
            }));
        let (http_status, resp) =
            match read_json::<Envelope<Funding>>(self.authed(rb)?.send().await?).await {
                // A 409 without a JSON body is still a duplicate
                Err(ProviderError::Http { status: 409, .. }) => {
                    return self.original(key, reference).await;
                }
                other => other?,
            };

        if is_duplicate(http_status, &resp.message) {
            return self.original(key, reference).await;
        }
        let Some(funding) = resp.data else {
            if http_status >= 400 {
                return Ok(InitiateOutcome::Rejected(resp.message));
            }
            // Accepted without a body to go on; the lookup settles it later
            return Ok(InitiateOutcome::Pending(reference));
        };
        debug!(reference = %reference, status = %funding.status, "Card funding submitted");
        Ok(match classify(&funding.status) {
            FundingState::Completed => InitiateOutcome::Completed(reference),
            FundingState::Failed => InitiateOutcome::Rejected(format!("funding {}", funding.status)),
            FundingState::InFlight => InitiateOutcome::Pending(reference),
        })
    }

    async fn query_status(&self, reference: &str) -> Result<StatusOutcome, ProviderError> {
        Ok(self
            .funding(reference)
            .await?
            .unwrap_or(StatusOutcome::StillPending))
    }

    async fn lookup(&self, key: &IdempotencyKey) -> Result<Option<InitiateOutcome>, ProviderError> {
        let reference = key.as_str().to_string();
        Ok(self
            .funding(&reference)
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

    fn provider(url: String) -> CardFundingProvider {
        CardFundingProvider::new(
            ProviderContext::new(
                url,
                Credentials::Bearer {
                    secret_key: "card_sk".into(),
                },
                Duration::from_secs(5),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_verify_active_and_frozen_cards() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/cards/card_live")
            .match_header("authorization", "Bearer card_sk")
            .with_status(200)
            .with_body(r#"{"statusCode":200,"message":"ok","data":{"status":"active","maskedPan":"506321******1234","currency":"NGN"}}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/cards/card_frozen")
            .with_status(200)
            .with_body(r#"{"statusCode":200,"message":"ok","data":{"status":"inactive","maskedPan":"506321******9999","currency":"NGN"}}"#)
            .create_async()
            .await;

        let p = provider(server.url());
        assert_eq!(
            p.verify_counterparty(&Counterparty::Card {
                card_id: "card_live".into()
            })
            .await
            .unwrap(),
            VerifyOutcome::Valid {
                display_name: "NGN 506321******1234".into()
            }
        );
        assert_eq!(
            p.verify_counterparty(&Counterparty::Card {
                card_id: "card_frozen".into()
            })
            .await
            .unwrap(),
            VerifyOutcome::Invalid("card is inactive".into())
        );
    }

    #[tokio::test]
    async fn test_fund_card() {
        let mut server = mockito::Server::new_async().await;
        let details = TransferDetails {
            transaction_id: TransactionId::new(),
            owner_id: 1,
            amount: 1_050,
            currency: Currency::ngn(),
            counterparty: Counterparty::Card {
                card_id: "card_live".into(),
            },
            description: "fund".into(),
        };
        let key = IdempotencyKey::for_transaction(details.transaction_id);
        server
            .mock("POST", "/cards/card_live/fund")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "paymentReference": key.as_str(),
                "currency": "NGN"
            })))
            .with_status(200)
            .with_body(r#"{"statusCode":200,"message":"ok","data":{"status":"pending"}}"#)
            .create_async()
            .await;

        let outcome = provider(server.url()).initiate(&details, &key).await.unwrap();
        assert_eq!(outcome, InitiateOutcome::Pending(key.as_str().to_string()));
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retryable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/cards/transfers/ref1")
            .with_status(401)
            .with_body(r#"{"statusCode":401,"message":"Unauthorized"}"#)
            .create_async()
            .await;

        let err = provider(server.url()).query_status("ref1").await.unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_duplicate_reference_reports_original() {
        let mut server = mockito::Server::new_async().await;
        let details = TransferDetails {
            transaction_id: TransactionId::new(),
            owner_id: 1,
            amount: 2_000,
            currency: Currency::ngn(),
            counterparty: Counterparty::Card {
                card_id: "card_live".into(),
            },
            description: "fund".into(),
        };
        let key = IdempotencyKey::for_transaction(details.transaction_id);
        server
            .mock("POST", "/cards/card_live/fund")
            .with_status(409)
            .with_body(r#"{"statusCode":409,"message":"Duplicate payment reference"}"#)
            .create_async()
            .await;
        let original = server
            .mock("GET", format!("/cards/transfers/{}", key.as_str()).as_str())
            .with_status(200)
            .with_body(r#"{"statusCode":200,"message":"ok","data":{"status":"successful"}}"#)
            .expect(1)
            .create_async()
            .await;

        let outcome = provider(server.url()).initiate(&details, &key).await.unwrap();
        assert_eq!(outcome, InitiateOutcome::Completed(key.as_str().to_string()));
        original.assert_async().await;
    }

    #[tokio::test]
    async fn test_validation_refusal_is_rejection() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/cards/card_live/fund")
            .with_status(400)
            .with_body(r#"{"statusCode":400,"message":"Card is terminated"}"#)
            .create_async()
            .await;

        let details = TransferDetails {
            transaction_id: TransactionId::new(),
            owner_id: 1,
            amount: 2_000,
            currency: Currency::ngn(),
            counterparty: Counterparty::Card {
                card_id: "card_live".into(),
            },
            description: String::new(),
        };
        let outcome = provider(server.url())
            .initiate(&details, &IdempotencyKey::for_transaction(details.transaction_id))
            .await
            .unwrap();
        assert_eq!(outcome, InitiateOutcome::Rejected("Card is terminated".into()));
    }
}
