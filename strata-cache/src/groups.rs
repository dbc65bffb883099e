//! Tiered cache groups for system, provider and sandbox scopes.
//!
//! Each tier is a version key. A chained tier embeds the token of the tier
//! above it in its own version key and token, so invalidating an upstream
//! tier changes the key every downstream tier is stored under. The old
//! downstream entries are orphaned, not deleted.
//!
//! Resolving a chained group costs one version lookup per level. Upstream
//! tiers are buffered longer than downstream ones because they are read by
//! every tenant and change rarely.
//!
//! ```text
//! system   cgsys:{ns}                       -> "cgsys:{ns}({r})"
//! provider cgp:{pid}:{system token | ns}    -> "p{pid}{upstream}({r})"
//! sandbox  cgs:{sid}:{provider | system | ns} -> "s{sid}{upstream}({r})"
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_core::{make_full_key, CacheSettings, ProviderId, SandboxId, StrataResult};

use crate::version::{VersionKeyStore, VersionRequest};

/// Namespace used for tenant groups when none is given.
pub const DEFAULT_NAMESPACE: &str = "tg";

const SYSTEM_MARK: &str = "cgsys";
const PROVIDER_MARK: &str = "cgp";
const SANDBOX_MARK: &str = "cgs";

/// One invalidation scope in the tenant hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "tier", rename_all = "snake_case")]
pub enum CacheGroup {
    /// Platform-wide scope for a namespace.
    System { namespace: String },
    /// One provider, optionally chained to the system scope.
    Provider {
        provider: ProviderId,
        namespace: String,
        chain_to_system: bool,
    },
    /// One sandbox, optionally chained to its provider and/or the system.
    Sandbox {
        sandbox: SandboxId,
        provider: Option<ProviderId>,
        namespace: String,
        chain_to_system: bool,
    },
}

impl CacheGroup {
    /// System group for `namespace`.
    pub fn system(namespace: impl Into<String>) -> Self {
        CacheGroup::System {
            namespace: namespace.into(),
        }
    }

    /// Provider group for `provider` in `namespace`.
    pub fn provider(
        provider: ProviderId,
        namespace: impl Into<String>,
        chain_to_system: bool,
    ) -> Self {
        CacheGroup::Provider {
            provider,
            namespace: namespace.into(),
            chain_to_system,
        }
    }

    /// Sandbox group for `sandbox` in `namespace`.
    pub fn sandbox(
        sandbox: SandboxId,
        provider: Option<ProviderId>,
        namespace: impl Into<String>,
        chain_to_system: bool,
    ) -> Self {
        CacheGroup::Sandbox {
            sandbox,
            provider,
            namespace: namespace.into(),
            chain_to_system,
        }
    }

    /// Namespace this group lives in.
    pub fn namespace(&self) -> &str {
        match self {
            CacheGroup::System { namespace }
            | CacheGroup::Provider { namespace, .. }
            | CacheGroup::Sandbox { namespace, .. } => namespace,
        }
    }

    /// The group whose token is embedded in this one, if chained.
    pub fn upstream(&self) -> Option<CacheGroup> {
        match self {
            CacheGroup::System { .. } => None,
            CacheGroup::Provider {
                namespace,
                chain_to_system,
                ..
            } => chain_to_system.then(|| CacheGroup::system(namespace.clone())),
            CacheGroup::Sandbox {
                provider: Some(provider),
                namespace,
                chain_to_system,
                ..
            } => Some(CacheGroup::provider(
                *provider,
                namespace.clone(),
                *chain_to_system,
            )),
            CacheGroup::Sandbox {
                provider: None,
                namespace,
                chain_to_system,
                ..
            } => chain_to_system.then(|| CacheGroup::system(namespace.clone())),
        }
    }

    /// Number of version lookups needed to resolve this group.
    pub fn depth(&self) -> usize {
        1 + self.upstream().map_or(0, |up| up.depth())
    }
}

impl fmt::Display for CacheGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheGroup::System { namespace } => write!(f, "system:{namespace}"),
            CacheGroup::Provider {
                provider,
                namespace,
                chain_to_system,
            } => write!(
                f,
                "provider:{provider}:{namespace}{}",
                if *chain_to_system { "+sys" } else { "" }
            ),
            CacheGroup::Sandbox {
                sandbox,
                provider,
                namespace,
                chain_to_system,
            } => {
                write!(f, "sandbox:{sandbox}")?;
                if let Some(provider) = provider {
                    write!(f, ":p{provider}")?;
                }
                write!(
                    f,
                    ":{namespace}{}",
                    if *chain_to_system { "+sys" } else { "" }
                )
            }
        }
    }
}

/// Buffer ages per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierBuffering {
    pub system: Duration,
    pub provider: Duration,
    pub sandbox: Duration,
}

impl TierBuffering {
    /// Buffer ages from settings.
    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self {
            system: settings.buffer_version_system,
            provider: settings.buffer_version_provider,
            sandbox: settings.buffer_version,
        }
    }
}

/// Resolves and invalidates tiered cache groups.
#[derive(Debug, Clone)]
pub struct CacheGroups {
    versions: Arc<VersionKeyStore>,
    buffering: TierBuffering,
}

impl CacheGroups {
    /// Create a group resolver over `versions`.
    pub fn new(versions: Arc<VersionKeyStore>, buffering: TierBuffering) -> Self {
        Self {
            versions,
            buffering,
        }
    }

    /// Token of the system group for `namespace`.
    pub async fn system_group(&self, namespace: &str) -> StrataResult<String> {
        let key = system_key(namespace);
        self.versions
            .get_or_create(
                VersionRequest::new(&key)
                    .prefixed(&key)
                    .buffered(self.buffering.system),
            )
            .await
    }

    /// Token of the provider group, chained to the system group if asked.
    pub async fn provider_group(
        &self,
        provider: ProviderId,
        namespace: &str,
        chain_to_system: bool,
    ) -> StrataResult<String> {
        let upstream = self.system_upstream(namespace, chain_to_system).await?;
        let key = provider_key(provider, &upstream);
        let prefix = format!("p{provider}{upstream}");
        self.versions
            .get_or_create(
                VersionRequest::new(&key)
                    .prefixed(&prefix)
                    .buffered(self.buffering.provider),
            )
            .await
    }

    /// Token of the sandbox group, chained through its provider and/or the
    /// system group if asked.
    pub async fn sandbox_group(
        &self,
        sandbox: SandboxId,
        provider: Option<ProviderId>,
        namespace: &str,
        chain_to_system: bool,
    ) -> StrataResult<String> {
        let upstream = self
            .provider_upstream(provider, namespace, chain_to_system)
            .await?;
        let key = sandbox_key(sandbox, &upstream);
        let prefix = format!("s{sandbox}{upstream}");
        self.versions
            .get_or_create(
                VersionRequest::new(&key)
                    .prefixed(&prefix)
                    .buffered(self.buffering.sandbox),
            )
            .await
    }

    /// Token of any group.
    pub async fn resolve(&self, group: &CacheGroup) -> StrataResult<String> {
        match group {
            CacheGroup::System { namespace } => self.system_group(namespace).await,
            CacheGroup::Provider {
                provider,
                namespace,
                chain_to_system,
            } => {
                self.provider_group(*provider, namespace, *chain_to_system)
                    .await
            }
            CacheGroup::Sandbox {
                sandbox,
                provider,
                namespace,
                chain_to_system,
            } => {
                self.sandbox_group(*sandbox, *provider, namespace, *chain_to_system)
                    .await
            }
        }
    }

    /// Invalidate the system group; every chained provider and sandbox group
    /// in the namespace is orphaned with it.
    pub async fn invalidate_system(&self, namespace: &str) -> StrataResult<()> {
        self.versions.invalidate(&system_key(namespace)).await
    }

    /// Invalidate both the chained and unchained variants of a provider group.
    ///
    /// The system group is never touched.
    pub async fn invalidate_provider(
        &self,
        provider: ProviderId,
        namespace: &str,
    ) -> StrataResult<()> {
        for chained in [true, false] {
            let upstream = self.system_upstream(namespace, chained).await?;
            self.versions
                .invalidate(&provider_key(provider, &upstream))
                .await?;
        }
        Ok(())
    }

    /// Invalidate both the chained and unchained variants of a sandbox group.
    ///
    /// Provider and system groups are never touched.
    pub async fn invalidate_sandbox(
        &self,
        sandbox: SandboxId,
        provider: Option<ProviderId>,
        namespace: &str,
    ) -> StrataResult<()> {
        for chained in [true, false] {
            let upstream = self.provider_upstream(provider, namespace, chained).await?;
            self.versions
                .invalidate(&sandbox_key(sandbox, &upstream))
                .await?;
        }
        Ok(())
    }

    /// Invalidate any group. Chaining flags are ignored: both variants go.
    pub async fn invalidate(&self, group: &CacheGroup) -> StrataResult<()> {
        match group {
            CacheGroup::System { namespace } => self.invalidate_system(namespace).await,
            CacheGroup::Provider {
                provider,
                namespace,
                ..
            } => self.invalidate_provider(*provider, namespace).await,
            CacheGroup::Sandbox {
                sandbox,
                provider,
                namespace,
                ..
            } => self.invalidate_sandbox(*sandbox, *provider, namespace).await,
        }
    }

    async fn system_upstream(&self, namespace: &str, chained: bool) -> StrataResult<String> {
        if chained {
            self.system_group(namespace).await
        } else {
            Ok(namespace.to_string())
        }
    }

    async fn provider_upstream(
        &self,
        provider: Option<ProviderId>,
        namespace: &str,
        chained: bool,
    ) -> StrataResult<String> {
        match provider {
            Some(provider) => self.provider_group(provider, namespace, chained).await,
            None => self.system_upstream(namespace, chained).await,
        }
    }
}

fn system_key(namespace: &str) -> String {
    make_full_key(&[SYSTEM_MARK, namespace])
}

fn provider_key(provider: ProviderId, upstream: &str) -> String {
    make_full_key(&[PROVIDER_MARK, &provider.to_string(), upstream])
}

fn sandbox_key(sandbox: SandboxId, upstream: &str) -> String {
    make_full_key(&[SANDBOX_MARK, &sandbox.to_string(), upstream])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spaces::{CacheName, CacheSpace};
    use crate::store::InMemoryStore;
    use strata_core::ManualClock;

    fn groups() -> CacheGroups {
        let clock = Arc::new(ManualClock::starting_now());
        let settings = CacheSettings::default();
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let space = CacheSpace::new(CacheName::Version, store, &settings);
        let versions = Arc::new(VersionKeyStore::new(space, clock, &settings));
        CacheGroups::new(versions, TierBuffering::from_settings(&settings))
    }

    #[test]
    fn test_upstream_chain() {
        let sandbox = CacheGroup::sandbox(SandboxId(7), Some(ProviderId(42)), "tg", true);
        assert_eq!(
            sandbox.upstream(),
            Some(CacheGroup::provider(ProviderId(42), "tg", true))
        );
        assert_eq!(sandbox.depth(), 3);

        let unchained = CacheGroup::sandbox(SandboxId(7), None, "tg", false);
        assert_eq!(unchained.upstream(), None);
        assert_eq!(unchained.depth(), 1);

        assert_eq!(CacheGroup::provider(ProviderId(42), "tg", true).depth(), 2);
        assert_eq!(CacheGroup::system("tg").namespace(), "tg");
    }

    #[test]
    fn test_display() {
        assert_eq!(CacheGroup::system("tg").to_string(), "system:tg");
        assert_eq!(
            CacheGroup::provider(ProviderId(42), "tg", true).to_string(),
            "provider:42:tg+sys"
        );
        assert_eq!(
            CacheGroup::sandbox(SandboxId(7), Some(ProviderId(42)), "cnt", false).to_string(),
            "sandbox:7:p42:cnt"
        );
    }

    #[tokio::test]
    async fn test_system_token_embeds_its_key() {
        let groups = groups();
        let token = groups.system_group("tg").await.unwrap();
        assert!(token.starts_with("cgsys:tg("));
        assert_eq!(groups.system_group("tg").await.unwrap(), token);
    }

    #[tokio::test]
    async fn test_chained_provider_embeds_system_token() {
        let groups = groups();
        let system = groups.system_group("tg").await.unwrap();
        let chained = groups.provider_group(ProviderId(42), "tg", true).await.unwrap();
        let plain = groups.provider_group(ProviderId(42), "tg", false).await.unwrap();

        assert!(chained.starts_with(&format!("p42{system}(")));
        assert!(plain.starts_with("p42tg("));
        assert_ne!(chained, plain);
    }

    #[tokio::test]
    async fn test_invalidate_provider_isolated() {
        let groups = groups();
        let p42 = groups.provider_group(ProviderId(42), "tg", true).await.unwrap();
        let p42_plain = groups.provider_group(ProviderId(42), "tg", false).await.unwrap();
        let p43 = groups.provider_group(ProviderId(43), "tg", true).await.unwrap();
        let system = groups.system_group("tg").await.unwrap();

        groups.invalidate_provider(ProviderId(42), "tg").await.unwrap();

        assert_ne!(groups.provider_group(ProviderId(42), "tg", true).await.unwrap(), p42);
        assert_ne!(
            groups.provider_group(ProviderId(42), "tg", false).await.unwrap(),
            p42_plain
        );
        assert_eq!(groups.provider_group(ProviderId(43), "tg", true).await.unwrap(), p43);
        assert_eq!(groups.system_group("tg").await.unwrap(), system);
    }

    #[tokio::test]
    async fn test_invalidate_system_cascades_down() {
        let groups = groups();
        let provider = groups.provider_group(ProviderId(42), "tg", true).await.unwrap();
        let sandbox = groups
            .sandbox_group(SandboxId(7), Some(ProviderId(42)), "tg", true)
            .await
            .unwrap();
        let unchained = groups.provider_group(ProviderId(42), "tg", false).await.unwrap();

        groups.invalidate_system("tg").await.unwrap();

        assert_ne!(groups.provider_group(ProviderId(42), "tg", true).await.unwrap(), provider);
        assert_ne!(
            groups
                .sandbox_group(SandboxId(7), Some(ProviderId(42)), "tg", true)
                .await
                .unwrap(),
            sandbox
        );
        // Not chained, so untouched
        assert_eq!(
            groups.provider_group(ProviderId(42), "tg", false).await.unwrap(),
            unchained
        );
    }

    #[tokio::test]
    async fn test_invalidate_sandbox_never_touches_upstream() {
        let groups = groups();
        let provider = groups.provider_group(ProviderId(42), "tg", true).await.unwrap();
        let sandbox = groups
            .sandbox_group(SandboxId(7), Some(ProviderId(42)), "tg", true)
            .await
            .unwrap();
        let sibling = groups
            .sandbox_group(SandboxId(8), Some(ProviderId(42)), "tg", true)
            .await
            .unwrap();

        groups
            .invalidate(&CacheGroup::sandbox(SandboxId(7), Some(ProviderId(42)), "tg", true))
            .await
            .unwrap();

        assert_ne!(
            groups
                .sandbox_group(SandboxId(7), Some(ProviderId(42)), "tg", true)
                .await
                .unwrap(),
            sandbox
        );
        assert_eq!(
            groups
                .sandbox_group(SandboxId(8), Some(ProviderId(42)), "tg", true)
                .await
                .unwrap(),
            sibling
        );
        assert_eq!(groups.provider_group(ProviderId(42), "tg", true).await.unwrap(), provider);
    }

    #[tokio::test]
    async fn test_namespaces_are_independent() {
        let groups = groups();
        let tg = groups.provider_group(ProviderId(42), "tg", false).await.unwrap();
        let cnt = groups.provider_group(ProviderId(42), "cnt", false).await.unwrap();

        groups.invalidate_provider(ProviderId(42), "cnt").await.unwrap();

        assert_eq!(groups.provider_group(ProviderId(42), "tg", false).await.unwrap(), tg);
        assert_ne!(groups.provider_group(ProviderId(42), "cnt", false).await.unwrap(), cnt);
    }

    #[tokio::test]
    async fn test_resolve_matches_direct_calls() {
        let groups = groups();
        let group = CacheGroup::sandbox(SandboxId(7), None, "tg", true);
        let direct = groups
            .sandbox_group(SandboxId(7), None, "tg", true)
            .await
            .unwrap();
        assert_eq!(groups.resolve(&group).await.unwrap(), direct);
        assert!(direct.starts_with("s7cgsys:tg("));
    }
}
