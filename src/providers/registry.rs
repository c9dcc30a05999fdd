//! Class → adapter routing
//!
//! Built once at startup. The orchestrator looks adapters up by
//! transaction class; reconciliation looks them up by the kind tag stored
//! on the provider reference.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::FixedOffset;
use reqwest::Client;
use tracing::{info, warn};

use super::{
    BankTransferProvider, BillPaymentProvider, CardFundingProvider, Credentials, GiftCardProvider,
    MockProvider, ProviderAdapter, ProviderContext, ProviderKind, WalletTransferProvider,
};
use crate::config::ProvidersConfig;
use crate::core_types::TransactionClass;
use crate::error::EngineError;
use crate::wallet::WalletStore;

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    by_class: HashMap<TransactionClass, Arc<dyn ProviderAdapter>>,
    by_kind: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `class` to `adapter`; the adapter also becomes the handler for
    /// its kind tag.
    pub fn register(mut self, class: TransactionClass, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.by_kind.insert(adapter.kind(), adapter.clone());
        self.by_class.insert(class, adapter);
        self
    }

    pub fn for_class(
        &self,
        class: TransactionClass,
    ) -> Result<Arc<dyn ProviderAdapter>, EngineError> {
        self.by_class.get(&class).cloned().ok_or_else(|| {
            EngineError::ProviderUnavailable(format!("no provider configured for {}", class))
        })
    }

    pub fn for_kind(&self, kind: ProviderKind) -> Result<Arc<dyn ProviderAdapter>, EngineError> {
        self.by_kind.get(&kind).cloned().ok_or_else(|| {
            EngineError::ProviderUnavailable(format!("no adapter registered for {}", kind))
        })
    }

    /// Wire every configured provider. `send` is always served in-process;
    /// other classes without configuration stay unrouted unless
    /// `mock_unconfigured` is set.
    pub fn from_config(
        config: &ProvidersConfig,
        wallets: Arc<dyn WalletStore>,
        default_timeout: Duration,
        local_offset: FixedOffset,
    ) -> Result<Self, EngineError> {
        let timeout = config
            .http_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(default_timeout);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Config(format!("http client: {}", e)))?;
        let ctx = |base_url: &str, credentials: Credentials| {
            ProviderContext::with_client(client.clone(), base_url, credentials, timeout)
        };

        let mut registry = Self::new().register(
            TransactionClass::Send,
            Arc::new(WalletTransferProvider::new(wallets)),
        );

        if let Some(bank) = &config.bank {
            let credentials = Credentials::Bearer {
                secret_key: bank.secret_key.clone(),
            };
            registry = registry.register(
                TransactionClass::BankTransfer,
                Arc::new(BankTransferProvider::new(ctx(&bank.base_url, credentials))),
            );
        }
        if let Some(bills) = &config.bills {
            let credentials = Credentials::ApiKeys {
                api_key: bills.api_key.clone(),
                secret_key: bills.secret_key.clone(),
            };
            registry = registry.register(
                TransactionClass::Bill,
                Arc::new(BillPaymentProvider::new(
                    ctx(&bills.base_url, credentials),
                    local_offset,
                )),
            );
        }
        if let Some(card) = &config.card {
            let credentials = Credentials::Bearer {
                secret_key: card.secret_key.clone(),
            };
            registry = registry.register(
                TransactionClass::CardFund,
                Arc::new(CardFundingProvider::new(ctx(&card.base_url, credentials))),
            );
        }
        if let Some(gift) = &config.gift_card {
            let credentials = Credentials::ClientCredentials {
                client_id: gift.client_id.clone(),
                client_secret: gift.client_secret.clone(),
                auth_url: gift.auth_url.clone(),
                audience: gift.audience.clone(),
            };
            registry = registry.register(
                TransactionClass::GiftCard,
                Arc::new(GiftCardProvider::new(ctx(&gift.base_url, credentials))),
            );
        }

        let missing: Vec<TransactionClass> = TransactionClass::ALL
            .into_iter()
            .filter(|class| !registry.by_class.contains_key(class))
            .collect();
        if !missing.is_empty() {
            if config.mock_unconfigured {
                let mock: Arc<dyn ProviderAdapter> = Arc::new(MockProvider::new(ProviderKind::Mock));
                for class in &missing {
                    registry = registry.register(*class, mock.clone());
                }
                warn!(classes = ?missing, "Unconfigured classes routed to the mock provider");
            } else {
                warn!(classes = ?missing, "No provider configured; these classes will be rejected");
            }
        }

        info!(classes = ?registry.classes(), "Provider registry ready");
        Ok(registry)
    }

    pub fn classes(&self) -> Vec<TransactionClass> {
        let mut classes: Vec<_> = self.by_class.keys().copied().collect();
        classes.sort();
        classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BearerProviderConfig, ProvidersConfig};
    use crate::wallet::InMemoryWalletStore;

    #[test]
    fn test_lookup_by_class_and_kind() {
        let bills: Arc<dyn ProviderAdapter> = Arc::new(MockProvider::new(ProviderKind::Bills));
        let registry = ProviderRegistry::new().register(TransactionClass::Bill, bills);

        assert_eq!(
            registry.for_class(TransactionClass::Bill).unwrap().kind(),
            ProviderKind::Bills
        );
        assert!(registry.for_kind(ProviderKind::Bills).is_ok());
        assert!(matches!(
            registry.for_class(TransactionClass::GiftCard),
            Err(EngineError::ProviderUnavailable(_))
        ));
        assert_eq!(registry.classes(), vec![TransactionClass::Bill]);
    }

    fn build(config: &ProvidersConfig) -> ProviderRegistry {
        ProviderRegistry::from_config(
            config,
            Arc::new(InMemoryWalletStore::new()),
            Duration::from_secs(5),
            FixedOffset::east_opt(3600).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_from_config_routes_configured_classes_only() {
        let config = ProvidersConfig {
            bank: Some(BearerProviderConfig {
                base_url: "https://bank.test".into(),
                secret_key: "sk_test".into(),
            }),
            ..ProvidersConfig::default()
        };
        let registry = build(&config);

        assert_eq!(
            registry.classes(),
            vec![TransactionClass::Send, TransactionClass::BankTransfer]
        );
        assert_eq!(
            registry.for_class(TransactionClass::Send).unwrap().kind(),
            ProviderKind::Wallet
        );
        assert_eq!(
            registry.for_class(TransactionClass::BankTransfer).unwrap().kind(),
            ProviderKind::Bank
        );
        assert!(registry.for_class(TransactionClass::CardFund).is_err());
    }

    #[test]
    fn test_mock_fills_unconfigured_classes() {
        let config = ProvidersConfig {
            mock_unconfigured: true,
            ..ProvidersConfig::default()
        };
        let registry = build(&config);

        assert_eq!(registry.classes(), TransactionClass::ALL.to_vec());
        assert_eq!(
            registry.for_class(TransactionClass::GiftCard).unwrap().kind(),
            ProviderKind::Mock
        );
        assert!(registry.for_kind(ProviderKind::Mock).is_ok());
    }
}
