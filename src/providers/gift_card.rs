//! Gift card adapter
//!
//! OAuth2 client-credentials network. The access token is cached and
//! refreshed shortly before it expires; a 401 drops the cached token so the
//! next call fetches a fresh one.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::http::{ProviderContext, read_json};
use super::{
    Credentials, IdempotencyKey, InitiateOutcome, ProviderAdapter, ProviderError, ProviderKind,
    StatusOutcome, TransferDetails, VerifyOutcome,
};
use crate::money::to_major;
use crate::transfer::types::Counterparty;

/// Refresh this long before the provider-declared expiry
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Product {
    product_name: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Order {
    transaction_id: Option<u64>,
    status: Option<String>,
    message: Option<String>,
    error_code: Option<String>,
}

impl Order {
    fn is_duplicate(&self) -> bool {
        let flagged = |s: &Option<String>| {
            s.as_deref()
                .is_some_and(|s| s.to_ascii_lowercase().contains("duplicate"))
        };
        flagged(&self.error_code) || flagged(&self.message)
    }

    fn outcome(&self) -> StatusOutcome {
        let status = self.status.clone().unwrap_or_default().to_ascii_uppercase();
        match status.as_str() {
            "SUCCESSFUL" => StatusOutcome::Completed,
            "FAILED" | "REFUNDED" => StatusOutcome::Failed(format!("order {}", status)),
            _ => StatusOutcome::StillPending,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    content: Vec<T>,
}

struct CachedToken {
    token: String,
    refresh_at: Instant,
}

pub struct GiftCardProvider {
    ctx: ProviderContext,
    token: RwLock<Option<CachedToken>>,
}

impl GiftCardProvider {
    pub fn new(ctx: ProviderContext) -> Self {
        Self {
            ctx,
            token: RwLock::new(None),
        }
    }

    async fn access_token(&self) -> Result<String, ProviderError> {
        if let Some(cached) = self.token.read().await.as_ref()
            && Instant::now() < cached.refresh_at
        {
            return Ok(cached.token.clone());
        }

        let mut slot = self.token.write().await;
        // Another task may have refreshed while we waited for the lock
        if let Some(cached) = slot.as_ref()
            && Instant::now() < cached.refresh_at
        {
            return Ok(cached.token.clone());
        }

        let Credentials::ClientCredentials {
            client_id,
            client_secret,
            auth_url,
            audience,
        } = self.ctx.credentials()
        else {
            return Err(ProviderError::NotConfigured(
                "gift card provider needs client credentials".into(),
            ));
        };

        let resp = self
            .ctx
            .client()
            .post(auth_url)
            .json(&json!({
                "client_id": client_id,
                "client_secret": client_secret,
                "grant_type": "client_credentials",
                "audience": audience,
            }))
            .send()
            .await?;
        let (_, token): (u16, TokenResponse) = read_json(resp).await?;

        let lifetime = Duration::from_secs(token.expires_in);
        let refresh_at = Instant::now() + lifetime.saturating_sub(TOKEN_REFRESH_MARGIN);
        info!(expires_in = token.expires_in, "Gift card access token refreshed");
        *slot = Some(CachedToken {
            token: token.access_token.clone(),
            refresh_at,
        });
        Ok(token.access_token)
    }

    async fn authed(&self, rb: RequestBuilder) -> Result<RequestBuilder, ProviderError> {
        Ok(rb.bearer_auth(self.access_token().await?))
    }

    /// Send and decode; an auth failure invalidates the cached token
    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        rb: RequestBuilder,
    ) -> Result<(u16, T), ProviderError> {
        let result = read_json(self.authed(rb).await?.send().await?).await;
        if let Err(ProviderError::Auth(_)) = &result {
            self.token.write().await.take();
        }
        result
    }

    async fn order_by_identifier(&self, identifier: &str) -> Result<Option<Order>, ProviderError> {
        let rb = self
            .ctx
            .client()
            .get(self.ctx.url("reports/transactions"))
            .query(&[("customIdentifier", identifier)]);
        let (_, page): (u16, Page<Order>) = self.call(rb).await?;
        Ok(page.content.into_iter().next())
    }
}

#[async_trait]
impl ProviderAdapter for GiftCardProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GiftCard
    }

    async fn verify_counterparty(
        &self,
        counterparty: &Counterparty,
    ) -> Result<VerifyOutcome, ProviderError> {
        let Counterparty::GiftCard {
            product_id,
            recipient_email,
        } = counterparty
        else {
            return Err(ProviderError::InvalidRequest(
                "gift card provider only serves gift cards".into(),
            ));
        };
        counterparty
            .check_identifiers()
            .map_err(ProviderError::InvalidRequest)?;
        if !recipient_email.contains('@') {
            return Ok(VerifyOutcome::Invalid("recipient email is malformed".into()));
        }

        let rb = self
            .ctx
            .client()
            .get(self.ctx.url(&format!("products/{}", product_id)));
        match self.call::<Product>(rb).await {
            Ok((_, product)) if product.status.eq_ignore_ascii_case("active") => {
                Ok(VerifyOutcome::Valid {
                    display_name: product.product_name,
                })
            }
            Ok((_, product)) => Ok(VerifyOutcome::Invalid(format!(
                "product {} is {}",
                product_id,
                product.status.to_ascii_lowercase()
            ))),
            Err(ProviderError::Http { status: 404, .. }) => Ok(VerifyOutcome::Invalid(format!(
                "product {} not found",
                product_id
            ))),
            Err(e) => Err(e),
        }
    }

    async fn initiate(
        &self,
        details: &TransferDetails,
        key: &IdempotencyKey,
    ) -> Result<InitiateOutcome, ProviderError> {
        details.validate()?;
        let Counterparty::GiftCard {
            product_id,
            recipient_email,
        } = &details.counterparty
        else {
            return Err(ProviderError::InvalidRequest(
                "gift card provider only serves gift cards".into(),
            ));
        };

        let rb = self.ctx.client().post(self.ctx.url("orders")).json(&json!({
            "productId": product_id,
            "quantity": 1,
            "unitPrice": to_major(details.amount, details.currency.decimals()),
            "customIdentifier": key.as_str(),
            "senderName": "Wallet",
            "recipientEmail": recipient_email,
        }));
        let (http_status, order): (u16, Order) = self.call(rb).await?;

        if order.is_duplicate() {
            info!(custom_identifier = %key, "Order identifier already used, querying original");
            return Ok(self
                .lookup(key)
                .await?
                .unwrap_or_else(|| InitiateOutcome::Pending(key.as_str().to_string())));
        }
        let Some(transaction_id) = order.transaction_id else {
            if http_status >= 400 {
                return Ok(InitiateOutcome::Rejected(
                    order.message.unwrap_or_else(|| "order refused".into()),
                ));
            }
            // Accepted without an id; find it by our identifier later
            return Ok(self
                .lookup(key)
                .await?
                .unwrap_or_else(|| InitiateOutcome::Pending(key.as_str().to_string())));
        };
        let reference = transaction_id.to_string();
        debug!(reference = %reference, status = ?order.status, "Gift card order placed");

        Ok(InitiateOutcome::from_status(reference, order.outcome()))
    }

    /// Takes the provider transaction id, or our custom identifier when the
    /// id was never learned
    async fn query_status(&self, reference: &str) -> Result<StatusOutcome, ProviderError> {
        if reference.parse::<u64>().is_err() {
            return Ok(self
                .order_by_identifier(reference)
                .await?
                .map(|order| order.outcome())
                .unwrap_or(StatusOutcome::StillPending));
        }
        let rb = self
            .ctx
            .client()
            .get(self.ctx.url(&format!("reports/transactions/{}", reference)));
        let (_, order): (u16, Order) = self.call(rb).await?;
        Ok(order.outcome())
    }

    async fn lookup(&self, key: &IdempotencyKey) -> Result<Option<InitiateOutcome>, ProviderError> {
        Ok(self
            .order_by_identifier(key.as_str())
            .await?
            .and_then(|order| {
                let reference = order.transaction_id?.to_string();
                Some(InitiateOutcome::from_status(reference, order.outcome()))
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{Currency, TransactionId};
    use mockito::Matcher;

    fn provider(server: &mockito::ServerGuard) -> GiftCardProvider {
        GiftCardProvider::new(
            ProviderContext::new(
                server.url(),
                Credentials::ClientCredentials {
                    client_id: "cid".into(),
                    client_secret: "csecret".into(),
                    auth_url: format!("{}/oauth/token", server.url()),
                    audience: "https://giftcards.example".into(),
                },
                Duration::from_secs(5),
            )
            .unwrap(),
        )
    }

    async fn mock_token(server: &mut mockito::ServerGuard, hits: usize) -> mockito::Mock {
        server
            .mock("POST", "/oauth/token")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "client_id": "cid",
                "grant_type": "client_credentials"
            })))
            .with_status(200)
            .with_body(r#"{"access_token":"tok_1","expires_in":86400,"token_type":"Bearer"}"#)
            .expect(hits)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_token_is_cached_across_calls() {
        let mut server = mockito::Server::new_async().await;
        let token = mock_token(&mut server, 1).await;
        server
            .mock("GET", "/products/120")
            .match_header("authorization", "Bearer tok_1")
            .with_status(200)
            .with_body(r#"{"productId":120,"productName":"Amazon US","status":"ACTIVE"}"#)
            .expect(2)
            .create_async()
            .await;

        let p = provider(&server);
        let cp = Counterparty::GiftCard {
            product_id: 120,
            recipient_email: "ada@example.com".into(),
        };
        for _ in 0..2 {
            assert_eq!(
                p.verify_counterparty(&cp).await.unwrap(),
                VerifyOutcome::Valid {
                    display_name: "Amazon US".into()
                }
            );
        }
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_bad_email_rejected_locally() {
        let server = mockito::Server::new_async().await;
        let outcome = provider(&server)
            .verify_counterparty(&Counterparty::GiftCard {
                product_id: 120,
                recipient_email: "not-an-email".into(),
            })
            .await
            .unwrap();
        assert!(matches!(outcome, VerifyOutcome::Invalid(_)));
    }

    #[tokio::test]
    async fn test_order_uses_custom_identifier() {
        let mut server = mockito::Server::new_async().await;
        mock_token(&mut server, 1).await;
        let details = TransferDetails {
            transaction_id: TransactionId::new(),
            owner_id: 4,
            amount: 2_500,
            currency: Currency::new("USD").unwrap(),
            counterparty: Counterparty::GiftCard {
                product_id: 120,
                recipient_email: "ada@example.com".into(),
            },
            description: "birthday".into(),
        };
        let key = IdempotencyKey::for_transaction(details.transaction_id);
        server
            .mock("POST", "/orders")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "productId": 120,
                "customIdentifier": key.as_str()
            })))
            .with_status(200)
            .with_body(r#"{"transactionId":98765,"status":"SUCCESSFUL"}"#)
            .create_async()
            .await;

        let outcome = provider(&server).initiate(&details, &key).await.unwrap();
        assert_eq!(outcome, InitiateOutcome::Completed("98765".into()));
    }

    #[tokio::test]
    async fn test_unauthorized_drops_cached_token() {
        let mut server = mockito::Server::new_async().await;
        let token = mock_token(&mut server, 2).await;
        server
            .mock("GET", "/reports/transactions/1")
            .with_status(401)
            .with_body("{}")
            .create_async()
            .await;

        let p = provider(&server);
        assert!(matches!(
            p.query_status("1").await,
            Err(ProviderError::Auth(_))
        ));
        assert!(p.query_status("1").await.is_err());
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_duplicate_identifier_reports_original() {
        let mut server = mockito::Server::new_async().await;
        mock_token(&mut server, 1).await;
        let details = TransferDetails {
            transaction_id: TransactionId::new(),
            owner_id: 4,
            amount: 2_500,
            currency: Currency::new("USD").unwrap(),
            counterparty: Counterparty::GiftCard {
                product_id: 120,
                recipient_email: "ada@example.com".into(),
            },
            description: String::new(),
        };
        let key = IdempotencyKey::for_transaction(details.transaction_id);
        server
            .mock("POST", "/orders")
            .with_status(400)
            .with_body(r#"{"message":"Duplicate custom identifier","errorCode":"DUPLICATE_CUSTOM_IDENTIFIER"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/reports/transactions")
            .match_query(Matcher::UrlEncoded("customIdentifier".into(), key.as_str().into()))
            .with_status(200)
            .with_body(r#"{"content":[{"transactionId":4242,"status":"PENDING"}]}"#)
            .create_async()
            .await;

        let outcome = provider(&server).initiate(&details, &key).await.unwrap();
        assert_eq!(outcome, InitiateOutcome::Pending("4242".into()));
    }

    #[tokio::test]
    async fn test_lookup_without_record() {
        let mut server = mockito::Server::new_async().await;
        mock_token(&mut server, 1).await;
        server
            .mock("GET", "/reports/transactions")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"content":[]}"#)
            .expect(2)
            .create_async()
            .await;

        let p = provider(&server);
        let key = IdempotencyKey::for_transaction(TransactionId::new());
        assert_eq!(p.lookup(&key).await.unwrap(), None);
        assert_eq!(
            p.query_status(key.as_str()).await.unwrap(),
            StatusOutcome::StillPending
        );
    }
}
