use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::ids::{SurveyId, TenantId};
use crate::qc_config::QcConfig;
use crate::qc_config::repository::QcConfigRepository;

const CACHE_TTL: Duration = Duration::from_secs(30);

struct CacheEntry {
    config: Option<QcConfig>,
    fetched_at: Instant,
}

/// Resolves the active Quality Control Config for a `(tenant, survey)`
/// pair: a survey-specific config if active, else the tenant-wide
/// default (spec.md §4.C step 2). Fronts the repository with a
/// short-TTL cache so the hot path (`OnResponseSubmitted`) does not hit
/// the database on every call.
pub struct ConfigResolver<R: QcConfigRepository> {
    repo: Arc<R>,
    cache: Mutex<HashMap<(TenantId, Option<SurveyId>), CacheEntry>>,
}

impl<R: QcConfigRepository> ConfigResolver<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self {
            repo,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves the config in force for `(tenant_id, survey_id)`.
    /// Returns `None` if neither a survey-specific nor a tenant default
    /// config is active; callers fall back to the built-in default
    /// (`FALLBACK_SAMPLE_PERCENTAGE`, empty rule table — which resolves
    /// to the same `>=50 -> auto_approve, else send_to_qc` default
    /// `resolve_action` applies when no rule matches) rather than
    /// erroring, per spec.md §4.C's built-in fallback.
    pub async fn resolve(
        &self,
        tenant_id: &TenantId,
        survey_id: &SurveyId,
    ) -> anyhow::Result<Option<QcConfig>> {
        let key = (tenant_id.clone(), Some(survey_id.clone()));
        if let Some(hit) = self.cache_get(&key) {
            return Ok(hit);
        }

        let resolved = match self
            .repo
            .fetch_active_for_survey(tenant_id, survey_id)
            .await?
        {
            Some(cfg) => Some(cfg),
            None => self.repo.fetch_active_default(tenant_id).await?,
        };

        self.cache_put(key, resolved.clone());
        Ok(resolved)
    }

    /// Invalidates every cached entry for `tenant_id`. Called after an
    /// admin upsert/deactivate so the new config takes effect without
    /// waiting out the TTL.
    pub fn invalidate_tenant(&self, tenant_id: &TenantId) {
        let mut cache = self.cache.lock();
        let before = cache.len();
        cache.retain(|(t, _), _| t != tenant_id);
        debug!(tenant_id = %tenant_id, evicted = before - cache.len(), "config cache invalidated");
    }

    fn cache_get(&self, key: &(TenantId, Option<SurveyId>)) -> Option<Option<QcConfig>> {
        let cache = self.cache.lock();
        let entry = cache.get(key)?;
        if entry.fetched_at.elapsed() > CACHE_TTL {
            return None;
        }
        Some(entry.config.clone())
    }

    fn cache_put(&self, key: (TenantId, Option<SurveyId>), config: Option<QcConfig>) {
        let mut cache = self.cache.lock();
        cache.insert(
            key,
            CacheEntry {
                config,
                fetched_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qc_config::{Action, ApprovalRule};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRepo {
        calls: AtomicUsize,
        config: QcConfig,
    }

    #[async_trait]
    impl QcConfigRepository for CountingRepo {
        async fn upsert(&self, config: QcConfig) -> anyhow::Result<QcConfig> {
            Ok(config)
        }

        async fn fetch_by_id(
            &self,
            _id: &crate::ids::ConfigId,
        ) -> anyhow::Result<Option<QcConfig>> {
            Ok(None)
        }

        async fn fetch_active_for_survey(
            &self,
            _tenant_id: &TenantId,
            _survey_id: &SurveyId,
        ) -> anyhow::Result<Option<QcConfig>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(self.config.clone()))
        }

        async fn fetch_active_default(
            &self,
            _tenant_id: &TenantId,
        ) -> anyhow::Result<Option<QcConfig>> {
            Ok(None)
        }

        async fn deactivate(&self, _id: &crate::ids::ConfigId) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn sample_config() -> QcConfig {
        QcConfig {
            id: crate::ids::ConfigId::new(),
            tenant_id: TenantId("t1".into()),
            survey_id: Some(SurveyId("s1".into())),
            active: true,
            sample_percentage: 40,
            approval_rules: vec![ApprovalRule {
                min_rate: 0.0,
                max_rate: 100.0,
                action: Action::SendToQc,
            }],
            notes: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn repeated_resolves_within_ttl_hit_cache_once() {
        let repo = Arc::new(CountingRepo {
            calls: AtomicUsize::new(0),
            config: sample_config(),
        });
        let resolver = ConfigResolver::new(repo.clone());

        let tenant = TenantId("t1".into());
        let survey = SurveyId("s1".into());

        resolver.resolve(&tenant, &survey).await.unwrap();
        resolver.resolve(&tenant, &survey).await.unwrap();
        resolver.resolve(&tenant, &survey).await.unwrap();

        assert_eq!(repo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_a_refetch() {
        let repo = Arc::new(CountingRepo {
            calls: AtomicUsize::new(0),
            config: sample_config(),
        });
        let resolver = ConfigResolver::new(repo.clone());

        let tenant = TenantId("t1".into());
        let survey = SurveyId("s1".into());

        resolver.resolve(&tenant, &survey).await.unwrap();
        resolver.invalidate_tenant(&tenant);
        resolver.resolve(&tenant, &survey).await.unwrap();

        assert_eq!(repo.calls.load(Ordering::SeqCst), 2);
    }
}
