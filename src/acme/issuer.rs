//! Certificate issuance over the ACME protocol.

use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{AcmeError, AcmePolicy, ChallengeManager, DirCache, StoredCertificate};

const MAX_ORDER_POLLS: u32 = 20;
const MAX_POLL_DELAY: Duration = Duration::from_secs(10);

/// Something that can obtain a certificate for a single domain.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    /// Obtain a certificate for `domain`.
    ///
    /// HTTP-01 tokens are published through `challenges` for the duration of
    /// the order; `policy` answers the terms-of-service prompt.
    async fn issue(
        &self,
        domain: &str,
        challenges: &ChallengeManager,
        policy: &dyn AcmePolicy,
    ) -> Result<StoredCertificate, AcmeError>;
}

/// HTTP-01 tokens published for one order. They are withdrawn on drop, also
/// when the order future is cancelled midway.
struct PublishedTokens<'a> {
    challenges: &'a ChallengeManager,
    tokens: Vec<String>,
}

impl<'a> PublishedTokens<'a> {
    fn new(challenges: &'a ChallengeManager) -> Self {
        Self {
            challenges,
            tokens: Vec::new(),
        }
    }

    fn publish(&mut self, token: &str, key_authorization: &str) {
        self.challenges.add_challenge(token, key_authorization);
        self.tokens.push(token.to_string());
    }
}

impl Drop for PublishedTokens<'_> {
    fn drop(&mut self) {
        for token in &self.tokens {
            self.challenges.remove_challenge(token);
        }
    }
}

#[derive(Debug, Deserialize)]
struct Directory {
    #[serde(default)]
    meta: Option<DirectoryMeta>,
}

#[derive(Debug, Deserialize)]
struct DirectoryMeta {
    #[serde(rename = "termsOfService")]
    terms_of_service: Option<String>,
}

/// Issuer backed by an ACME directory (Let's Encrypt by default).
pub struct AcmeIssuer {
    directory_url: String,
    contact: Vec<String>,
    cache: DirCache,
    http: reqwest::Client,
    account: OnceCell<Account>,
}

impl AcmeIssuer {
    pub fn new(directory_url: impl Into<String>, contact: Vec<String>, cache: DirCache) -> Self {
        Self {
            directory_url: directory_url.into(),
            contact,
            cache,
            http: reqwest::Client::new(),
            account: OnceCell::new(),
        }
    }

    async fn account(&self, policy: &dyn AcmePolicy) -> Result<&Account, AcmeError> {
        self.account
            .get_or_try_init(|| self.load_or_register(policy))
            .await
    }

    async fn load_or_register(&self, policy: &dyn AcmePolicy) -> Result<Account, AcmeError> {
        if let Some(json) = self.cache.load_credentials().await? {
            let credentials: AccountCredentials = serde_json::from_str(&json)?;
            debug!("Loaded ACME account from cache");
            return Ok(Account::from_credentials(credentials).await?);
        }
        self.register(policy).await
    }

    async fn register(&self, policy: &dyn AcmePolicy) -> Result<Account, AcmeError> {
        if let Some(terms) = self.terms_of_service().await? {
            if !policy.accepts_terms(&terms) {
                return Err(AcmeError::TermsNotAccepted(terms));
            }
        }

        let contact: Vec<&str> = self.contact.iter().map(String::as_str).collect();
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await?;

        self.cache
            .store_credentials(&serde_json::to_string(&credentials)?)
            .await?;
        info!(directory = %self.directory_url, "Registered ACME account");
        Ok(account)
    }

    async fn terms_of_service(&self) -> Result<Option<String>, AcmeError> {
        let directory: Directory = self
            .http
            .get(&self.directory_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(directory.meta.and_then(|m| m.terms_of_service))
    }

    async fn authorize(
        &self,
        order: &mut Order,
        tokens: &mut PublishedTokens<'_>,
    ) -> Result<(), AcmeError> {
        let authorizations = order.authorizations().await?;
        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                ref other => {
                    return Err(AcmeError::Order(format!("authorization is {:?}", other)));
                }
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| AcmeError::Order("no http-01 challenge offered".into()))?;

            let key_authorization = order.key_authorization(challenge);
            tokens.publish(&challenge.token, key_authorization.as_str());
            order.set_challenge_ready(&challenge.url).await?;
        }
        Ok(())
    }

    async fn wait_until_ready(&self, order: &mut Order) -> Result<(), AcmeError> {
        let mut delay = Duration::from_millis(250);
        for _ in 0..MAX_ORDER_POLLS {
            tokio::time::sleep(delay).await;
            let state = order.refresh().await?;
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => return Err(AcmeError::Order("order is invalid".into())),
                _ => {}
            }
            delay = (delay * 2).min(MAX_POLL_DELAY);
        }
        Err(AcmeError::Order("timed out waiting for validation".into()))
    }

    async fn finalize(&self, order: &mut Order, domain: &str) -> Result<StoredCertificate, AcmeError> {
        let mut params = CertificateParams::new(vec![domain.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        let key = KeyPair::generate()?;
        let csr = params.serialize_request(&key)?;
        order.finalize(csr.der()).await?;

        for _ in 0..MAX_ORDER_POLLS {
            if let Some(chain_pem) = order.certificate().await? {
                return Ok(StoredCertificate {
                    chain_pem,
                    key_pem: key.serialize_pem(),
                });
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Err(AcmeError::Order("timed out waiting for certificate".into()))
    }
}

#[async_trait]
impl CertificateIssuer for AcmeIssuer {
    async fn issue(
        &self,
        domain: &str,
        challenges: &ChallengeManager,
        policy: &dyn AcmePolicy,
    ) -> Result<StoredCertificate, AcmeError> {
        let account = self.account(policy).await?;
        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let mut tokens = PublishedTokens::new(challenges);
        let result = async {
            self.authorize(&mut order, &mut tokens).await?;
            self.wait_until_ready(&mut order).await?;
            self.finalize(&mut order, domain).await
        }
        .await;
        drop(tokens);

        if result.is_ok() {
            info!(domain = %domain, "Certificate issued");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;

    #[tokio::test]
    async fn tokens_are_withdrawn_when_the_order_is_cancelled() {
        let challenges = ChallengeManager::new();

        let order = async {
            let mut tokens = PublishedTokens::new(&challenges);
            tokens.publish("abc", "abc.thumbprint");
            pending::<()>().await;
        };
        let cancelled = tokio::time::timeout(Duration::from_millis(10), order).await;
        assert!(cancelled.is_err());

        assert_eq!(challenges.get_response("abc"), None);
        assert_eq!(challenges.pending_count(), 0);
    }

    #[test]
    fn tokens_are_served_while_published() {
        let challenges = ChallengeManager::new();
        let mut tokens = PublishedTokens::new(&challenges);
        tokens.publish("abc", "abc.thumbprint");
        assert_eq!(challenges.get_response("abc").as_deref(), Some("abc.thumbprint"));
        drop(tokens);
        assert_eq!(challenges.pending_count(), 0);
    }
}
