//! Property-Based Tests for Version Invalidation
//!
//! **Property 1: Idempotent Resolution**
//!
//! Resolving any group twice without an intervening invalidation SHALL
//! return the same token.
//!
//! **Property 2: Invalidation Changes Identity**
//!
//! After a group is invalidated, resolving it SHALL return a token never
//! returned before, and every group chained below it SHALL change too.
//!
//! **Property 3: Chain Isolation**
//!
//! Invalidating one provider SHALL NOT change the token of the system group
//! or of any other provider.
//!
//! **Property 4: Bounded Keys**
//!
//! Every backend key SHALL be printable and at most `max_key_len` long,
//! whatever the call fragment.

use proptest::prelude::*;
use strata_cache::{CacheGroup, CacheName, CallKey};
use strata_test_utils::assertions::assert_all_distinct;
use strata_test_utils::fixtures::{engine_fixture, test_settings};
use strata_test_utils::generators::{arb_cache_group, arb_fragment, arb_namespace, arb_provider_id};
use strata_test_utils::ProviderId;
use tokio::runtime::Runtime;

// ============================================================================
// TEST CONFIGURATION
// ============================================================================

fn test_runtime() -> Result<Runtime, TestCaseError> {
    Runtime::new().map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

fn fail(e: impl std::fmt::Display) -> TestCaseError {
    TestCaseError::fail(e.to_string())
}

// ============================================================================
// PROPERTY TESTS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_resolution_is_idempotent(group in arb_cache_group()) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let fixture = engine_fixture();
            let groups = fixture.engine.groups();

            let first = groups.resolve(&group).await.map_err(fail)?;
            let second = groups.resolve(&group).await.map_err(fail)?;
            prop_assert_eq!(first, second);
            Ok::<(), TestCaseError>(())
        })?;
    }

    #[test]
    fn prop_invalidation_changes_identity(group in arb_cache_group()) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let fixture = engine_fixture();
            let engine = &fixture.engine;

            let mut seen = vec![engine.groups().resolve(&group).await.map_err(fail)?];
            for _ in 0..3 {
                engine.invalidate_tier(&group).await.map_err(fail)?;
                seen.push(engine.groups().resolve(&group).await.map_err(fail)?);
            }
            assert_all_distinct(&seen);
            Ok::<(), TestCaseError>(())
        })?;
    }

    #[test]
    fn prop_system_invalidation_reaches_chained_descendants(
        namespace in arb_namespace(),
        provider in arb_provider_id(),
    ) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let fixture = engine_fixture();
            let engine = &fixture.engine;

            let chained = engine.provider_group(provider, &namespace, true).await.map_err(fail)?;
            let unchained = engine.provider_group(provider, &namespace, false).await.map_err(fail)?;

            engine.invalidate_system(&namespace).await.map_err(fail)?;

            let system = engine.system_group(&namespace).await.map_err(fail)?;
            let rechained = engine.provider_group(provider, &namespace, true).await.map_err(fail)?;
            prop_assert_ne!(&chained, &rechained);
            let expected_prefix = format!("p{}{}(", provider, system);
            prop_assert!(rechained.starts_with(&expected_prefix));

            // Unchained groups never see the system group
            prop_assert_eq!(
                unchained,
                engine.provider_group(provider, &namespace, false).await.map_err(fail)?
            );
            Ok::<(), TestCaseError>(())
        })?;
    }

    #[test]
    fn prop_provider_invalidation_is_isolated(
        namespace in arb_namespace(),
        provider in arb_provider_id(),
    ) {
        let other = ProviderId(provider.get() + 1);
        let rt = test_runtime()?;
        rt.block_on(async {
            let fixture = engine_fixture();
            let engine = &fixture.engine;

            let system = engine.system_group(&namespace).await.map_err(fail)?;
            let mine = engine.provider_group(provider, &namespace, true).await.map_err(fail)?;
            let theirs = engine.provider_group(other, &namespace, true).await.map_err(fail)?;

            engine.invalidate_provider(provider, &namespace).await.map_err(fail)?;

            prop_assert_eq!(system, engine.system_group(&namespace).await.map_err(fail)?);
            prop_assert_eq!(theirs, engine.provider_group(other, &namespace, true).await.map_err(fail)?);
            prop_assert_ne!(mine, engine.provider_group(provider, &namespace, true).await.map_err(fail)?);
            Ok::<(), TestCaseError>(())
        })?;
    }

    #[test]
    fn prop_backend_keys_are_bounded(fragment in arb_fragment(), group in arb_cache_group()) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let fixture = engine_fixture();
            let engine = &fixture.engine;
            let key = CallKey::new(fragment).in_group(group);

            let call_key = engine.results().call_key("listing", &key).await.map_err(fail)?;
            let full_key = engine.spaces().get(CacheName::Default).full_key(&call_key);

            prop_assert!(full_key.len() <= test_settings().max_key_len);
            prop_assert!(full_key.chars().all(|c| c.is_ascii_graphic()));
            prop_assert!(full_key.starts_with("def:test.1:"));
            Ok::<(), TestCaseError>(())
        })?;
    }
}

// ============================================================================
// UNIT TESTS
// ============================================================================

#[tokio::test]
async fn test_sandbox_invalidation_leaves_upstream_alone() {
    let fixture = engine_fixture();
    let engine = &fixture.engine;
    let sandbox = strata_test_utils::SandboxId(7);
    let provider = Some(ProviderId(42));

    let system = engine.system_group("tg").await.unwrap();
    let upstream = engine.provider_group(ProviderId(42), "tg", true).await.unwrap();
    let before = engine.sandbox_group(sandbox, provider, "tg", true).await.unwrap();

    engine.invalidate_sandbox(sandbox, provider, "tg").await.unwrap();

    assert_eq!(engine.system_group("tg").await.unwrap(), system);
    assert_eq!(
        engine.provider_group(ProviderId(42), "tg", true).await.unwrap(),
        upstream
    );
    assert_ne!(
        engine.sandbox_group(sandbox, provider, "tg", true).await.unwrap(),
        before
    );
}

#[tokio::test]
async fn test_invalidate_tier_ignores_chaining_flag() {
    let fixture = engine_fixture();
    let engine = &fixture.engine;

    let chained = engine.provider_group(ProviderId(5), "tg", true).await.unwrap();
    let unchained = engine.provider_group(ProviderId(5), "tg", false).await.unwrap();

    engine
        .invalidate_tier(&CacheGroup::provider(ProviderId(5), "tg", false))
        .await
        .unwrap();

    assert_ne!(
        engine.provider_group(ProviderId(5), "tg", true).await.unwrap(),
        chained
    );
    assert_ne!(
        engine.provider_group(ProviderId(5), "tg", false).await.unwrap(),
        unchained
    );
}
