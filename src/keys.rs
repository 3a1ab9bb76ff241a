//! Key resolution: which provider answers a user's question, with which key.
//!
//! Credentials are ordered by the user's explicit preference when one is
//! stored, otherwise by [`ProviderId::DEFAULT_ORDER`]. Providers missing from
//! an explicit preference are appended in default order so a stored key is
//! never silently unreachable.
//!
//! Validation is lazy. [`KeyResolver::select`] exercises the chosen
//! credential only when it was never validated, last failed, or its last
//! success is older than `keys.revalidate_after_secs`.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::Arc;

use pagewise_core::models::{ProviderCredential, ProviderId};
use pagewise_core::store::SecretStore;

use crate::providers::{AiProvider, ProviderError, ProviderFactory};
use crate::settings::SettingsSource;

/// Failure to produce a usable provider for a user.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("No AI provider configured")]
    NotConfigured,
    #[error("{provider} key validation failed: {details}")]
    Validation { provider: ProviderId, details: String },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Outcome of checking one stored credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCheck {
    pub provider: ProviderId,
    pub ok: bool,
    pub details: Option<String>,
}

/// Replace every occurrence of `secret` in `details`.
pub fn redact(details: &str, secret: &str) -> String {
    let secret = secret.trim();
    if secret.is_empty() {
        return details.to_string();
    }
    details.replace(secret, "[redacted]")
}

pub struct KeyResolver {
    secrets: Arc<dyn SecretStore>,
    factory: Arc<dyn ProviderFactory>,
    settings: Arc<dyn SettingsSource>,
}

impl KeyResolver {
    pub fn new(
        secrets: Arc<dyn SecretStore>,
        factory: Arc<dyn ProviderFactory>,
        settings: Arc<dyn SettingsSource>,
    ) -> Self {
        Self {
            secrets,
            factory,
            settings,
        }
    }

    /// Effective provider order for `user_id`.
    pub async fn provider_order(&self, user_id: &str) -> Result<Vec<ProviderId>, KeyError> {
        let mut order = self
            .secrets
            .provider_preference(user_id)
            .await?
            .unwrap_or_default();
        let mut seen = HashSet::new();
        order.retain(|id| seen.insert(*id));
        for id in ProviderId::DEFAULT_ORDER {
            if !order.contains(&id) {
                order.push(id);
            }
        }
        Ok(order)
    }

    /// The user's credentials in preference order.
    ///
    /// Credentials whose last validation failed are skipped unless
    /// `force_recheck` is set. If every stored credential is skipped the
    /// remembered failure of the first one is returned.
    pub async fn resolve(
        &self,
        user_id: &str,
        force_recheck: bool,
    ) -> Result<Vec<ProviderCredential>, KeyError> {
        let mut credentials = self.secrets.list_credentials(user_id).await?;
        if credentials.is_empty() {
            return Err(KeyError::NotConfigured);
        }

        let order = self.provider_order(user_id).await?;
        credentials.sort_by_key(|c| {
            order
                .iter()
                .position(|p| *p == c.provider)
                .unwrap_or(usize::MAX)
        });

        let first = credentials[0].provider;
        let usable: Vec<ProviderCredential> = credentials
            .into_iter()
            .filter(|c| force_recheck || !c.failed_last_validation())
            .collect();

        if usable.is_empty() {
            return Err(KeyError::Validation {
                provider: first,
                details: "credential failed its last validation; update it or re-check".to_string(),
            });
        }
        Ok(usable)
    }

    /// Exercise `credential` against its vendor and record the outcome.
    pub async fn validate(
        &self,
        credential: &ProviderCredential,
        provider: &dyn AiProvider,
    ) -> Result<(), KeyError> {
        let result = provider.validate().await;
        let ok = result.is_ok();
        self.secrets
            .record_validation(&credential.user_id, credential.provider, ok, Utc::now())
            .await?;

        result.map_err(|e| {
            tracing::info!(
                user = %credential.user_id,
                provider = %credential.provider,
                "credential validation failed"
            );
            validation_error(credential, &e)
        })
    }

    /// Pick the first usable credential and build its provider, validating
    /// it first if its last validation is unknown, failed, or stale.
    pub async fn select(
        &self,
        user_id: &str,
    ) -> Result<(ProviderCredential, Arc<dyn AiProvider>), KeyError> {
        let credentials = self.resolve(user_id, false).await?;
        let credential = credentials
            .into_iter()
            .next()
            .ok_or(KeyError::NotConfigured)?;

        let provider = self
            .factory
            .create(credential.provider, &credential.secret)
            .map_err(|e| validation_error(&credential, &e))?;

        if self.needs_validation(&credential) {
            self.validate(&credential, provider.as_ref()).await?;
        }
        Ok((credential, provider))
    }

    /// Validate every stored credential for `user_id`, ignoring remembered
    /// failures.
    pub async fn check_all(&self, user_id: &str) -> Result<Vec<KeyCheck>, KeyError> {
        let credentials = self.resolve(user_id, true).await?;
        let mut checks = Vec::with_capacity(credentials.len());
        for credential in credentials {
            let outcome = match self.factory.create(credential.provider, &credential.secret) {
                Ok(provider) => self.validate(&credential, provider.as_ref()).await,
                Err(e) => Err(validation_error(&credential, &e)),
            };
            checks.push(match outcome {
                Ok(()) => KeyCheck {
                    provider: credential.provider,
                    ok: true,
                    details: None,
                },
                Err(KeyError::Validation { details, .. }) => KeyCheck {
                    provider: credential.provider,
                    ok: false,
                    details: Some(details),
                },
                Err(other) => return Err(other),
            });
        }
        Ok(checks)
    }

    fn needs_validation(&self, credential: &ProviderCredential) -> bool {
        let ttl = self.settings.current().keys.revalidate_after_secs;
        match (credential.last_validation_ok, credential.last_validated_at) {
            (Some(true), Some(at)) => {
                let ttl = ChronoDuration::seconds(i64::try_from(ttl).unwrap_or(i64::MAX));
                Utc::now().signed_duration_since(at) >= ttl
            }
            _ => true,
        }
    }
}

fn validation_error(credential: &ProviderCredential, err: &ProviderError) -> KeyError {
    KeyError::Validation {
        provider: credential.provider,
        details: redact(&err.details(), &credential.secret),
    }
}
