//! Integration tests for the durable store: cache TTL semantics, the
//! dual-ceiling budget ledger, TTL locks, and confirmation durability.

use std::sync::Arc;
use std::time::Duration;

use tiller_config::TillerConfig;
use tiller_core::{Tier, TillerError, TokenUsage};
use tiller_store::{Approval, ConfirmOutcome, DenialReason, Store};
use uuid::Uuid;

fn store() -> Store {
    Store::open_in_memory(&TillerConfig::default()).unwrap()
}

fn store_with(config: &TillerConfig) -> Store {
    Store::open_in_memory(config).unwrap()
}

mod cache {
    use super::*;

    #[test]
    fn test_put_then_get_roundtrip() {
        let s = store();
        s.cache
            .put("fp-1", "the answer", 0.9, Duration::from_secs(60))
            .unwrap();

        let entry = s.cache.get("fp-1").unwrap().unwrap();
        assert_eq!(entry.response, "the answer");
        assert_eq!(entry.hit_count, 1);
    }

    #[test]
    fn test_expired_entry_reads_as_absent() {
        let s = store();
        s.cache
            .put("fp-stale", "old", 0.9, Duration::from_secs(0))
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert!(s.cache.get("fp-stale").unwrap().is_none());
        // The row is still there until the sweep reaps it
        assert_eq!(s.cache.len().unwrap(), 1);
        let (expired, _) = s.cache.sweep(1000).unwrap();
        assert_eq!(expired, 1);
        assert!(s.cache.is_empty().unwrap());
    }

    #[test]
    fn test_sweep_evicts_least_recently_used() {
        let s = store();
        for i in 0..5 {
            s.cache
                .put(&format!("fp-{i}"), "x", 0.9, Duration::from_secs(600))
                .unwrap();
        }
        // Touch fp-0 so it is the most recent
        std::thread::sleep(Duration::from_millis(2));
        s.cache.get("fp-0").unwrap().unwrap();

        let (_, evicted) = s.cache.sweep(2).unwrap();
        assert_eq!(evicted, 3);
        assert!(s.cache.get("fp-0").unwrap().is_some());
    }

    #[test]
    fn test_invalidate_prefix_is_literal() {
        let s = store();
        s.cache.put("abc_1", "x", 0.9, Duration::from_secs(60)).unwrap();
        s.cache.put("abcd2", "x", 0.9, Duration::from_secs(60)).unwrap();
        s.cache.put("zzz", "x", 0.9, Duration::from_secs(60)).unwrap();

        // The underscore must not act as a wildcard
        let removed = s.cache.invalidate_prefix("abc_").unwrap();
        assert_eq!(removed, 1);
        assert!(s.cache.get("abcd2").unwrap().is_some());
    }
}

mod ledger {
    use super::*;

    #[test]
    fn test_trivial_spend_auto_approved() {
        let s = store();
        let approval = s.ledger.approve(0.001, "conv-a", None).unwrap();
        assert_eq!(approval, Approval::Approved);
    }

    #[test]
    fn test_non_trivial_spend_requires_override() {
        let mut config = TillerConfig::default();
        config.budget.override_token = Some("secret".into());
        let s = store_with(&config);

        let denied = s.ledger.approve(0.05, "conv-a", None).unwrap();
        assert!(matches!(
            denied,
            Approval::Denied {
                reason: DenialReason::OverrideRequired,
                ..
            }
        ));

        let wrong = s.ledger.approve(0.05, "conv-a", Some("guess")).unwrap();
        assert!(matches!(wrong, Approval::Denied { .. }));

        let right = s.ledger.approve(0.05, "conv-a", Some("secret")).unwrap();
        assert_eq!(right, Approval::Approved);
    }

    #[test]
    fn test_override_never_bypasses_ceiling() {
        let mut config = TillerConfig::default();
        config.budget.conversation_ceiling_usd = 0.10;
        config.budget.override_token = Some("secret".into());
        let s = store_with(&config);

        s.ledger.commit("conv-a", 0.08).unwrap();

        // 0.08 + 0.05 crosses the $0.10 ceiling; the token is irrelevant
        let denied = s.ledger.approve(0.05, "conv-a", Some("secret")).unwrap();
        match denied {
            Approval::Denied {
                reason: DenialReason::CeilingExceeded { .. },
                remaining_usd,
            } => assert!((remaining_usd - 0.02).abs() < 1e-9),
            other => panic!("expected ceiling denial, got {other:?}"),
        }
    }

    #[test]
    fn test_commit_refuses_to_cross_ceiling() {
        let mut config = TillerConfig::default();
        config.budget.conversation_ceiling_usd = 0.50;
        let s = store_with(&config);

        s.ledger.commit("conv-a", 0.45).unwrap();
        let err = s.ledger.commit("conv-a", 0.10).unwrap_err();
        assert!(matches!(err, TillerError::BudgetExceeded { .. }));

        // The refused commit changed nothing
        let status = s.ledger.status("conv-a").unwrap();
        assert!((status.accumulated_usd - 0.45).abs() < 1e-9);
        assert!(status.accumulated_usd <= status.ceiling_usd);
    }

    #[test]
    fn test_conversation_and_daily_ceilings_are_independent() {
        let mut config = TillerConfig::default();
        config.budget.conversation_ceiling_usd = 0.50;
        config.budget.daily_ceiling_usd = 0.60;
        let s = store_with(&config);

        // Two conversations each inside their own ceiling...
        s.ledger.commit("conv-a", 0.40).unwrap();
        s.ledger.commit("conv-b", 0.15).unwrap();

        // ...but the day is at 0.55, so 0.10 more passes neither scope
        let denied = s.ledger.approve(0.10, "conv-c", None).unwrap();
        match denied {
            Approval::Denied {
                reason: DenialReason::CeilingExceeded { scope },
                ..
            } => assert_eq!(scope, "daily"),
            other => panic!("expected daily ceiling denial, got {other:?}"),
        }
    }

    #[test]
    fn test_daily_commit_refused_at_ceiling() {
        let mut config = TillerConfig::default();
        config.budget.conversation_ceiling_usd = 10.0;
        config.budget.daily_ceiling_usd = 0.50;
        let s = store_with(&config);

        s.ledger.commit("conv-a", 0.30).unwrap();
        let err = s.ledger.commit("conv-b", 0.30).unwrap_err();
        assert!(matches!(err, TillerError::BudgetExceeded { ref scope, .. } if scope == "daily"));
        assert!(s.ledger.day_status().unwrap().accumulated_usd <= 0.50);
    }

    #[test]
    fn test_estimate_orders_tiers_by_cost() {
        let s = store();
        let usage = TokenUsage {
            input_tokens: 1000,
            output_tokens: 1000,
        };
        let local = s.ledger.estimate(Tier::Local, usage);
        let augmented = s.ledger.estimate(Tier::Augmented, usage);
        let frontier = s.ledger.estimate(Tier::Frontier, usage);
        assert_eq!(local, 0.0);
        assert!(augmented > local);
        assert!(frontier > augmented);
    }
}

mod locks {
    use super::*;

    #[test]
    fn test_second_acquirer_gets_contention() {
        let s = store();
        s.locks
            .try_acquire("job-x", "worker-1", Duration::from_secs(60))
            .unwrap();

        let err = s
            .locks
            .try_acquire("job-x", "worker-2", Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(err, TillerError::LockContention { .. }));

        let holder = s.locks.holder("job-x").unwrap().unwrap();
        assert_eq!(holder.holder_id, "worker-1");
    }

    #[test]
    fn test_expired_lock_claimable_without_cleanup() {
        let s = store();
        s.locks
            .try_acquire("job-x", "crashed", Duration::from_secs(0))
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));

        // No sweep needed; the claim statement treats expired rows as absent
        s.locks
            .try_acquire("job-x", "successor", Duration::from_secs(60))
            .unwrap();
        assert_eq!(s.locks.holder("job-x").unwrap().unwrap().holder_id, "successor");
    }

    #[test]
    fn test_release_only_own_lock() {
        let s = store();
        s.locks
            .try_acquire("job-x", "worker-1", Duration::from_secs(60))
            .unwrap();

        // A stale holder must not clobber the live claim
        s.locks.release("job-x", "worker-0").unwrap();
        assert!(s.locks.holder("job-x").unwrap().is_some());

        s.locks.release("job-x", "worker-1").unwrap();
        assert!(s.locks.holder("job-x").unwrap().is_none());
    }

    #[test]
    fn test_renew_extends_only_own_lease() {
        let s = store();
        s.locks
            .try_acquire("job-x", "worker-1", Duration::from_secs(0))
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));

        // A non-holder cannot touch the lease, even an expired one
        assert!(!s.locks.renew("job-x", "worker-2", Duration::from_secs(60)).unwrap());

        // The holder can, and the extended lease holds off contenders
        assert!(s.locks.renew("job-x", "worker-1", Duration::from_secs(60)).unwrap());
        let err = s
            .locks
            .try_acquire("job-x", "worker-2", Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(err, TillerError::LockContention { .. }));
    }
}

mod confirmations {
    use super::*;

    #[tokio::test]
    async fn test_token_consumed_exactly_once() {
        let s = store();
        let conv = Uuid::new_v4();
        let pending = s
            .conversations
            .begin_confirmation(conv, "unlock_door", &serde_json::json!({}))
            .await
            .unwrap();

        let first = s
            .conversations
            .confirm(conv, &pending.confirmation_token)
            .await
            .unwrap();
        assert!(matches!(first, ConfirmOutcome::Confirmed(_)));

        let second = s
            .conversations
            .confirm(conv, &pending.confirmation_token)
            .await
            .unwrap();
        assert!(matches!(second, ConfirmOutcome::Expired));
    }

    #[tokio::test]
    async fn test_concurrent_confirms_one_winner() {
        let config = TillerConfig::default();
        let s = Arc::new(Store::open_in_memory(&config).unwrap());
        let conv = Uuid::new_v4();
        let pending = s
            .conversations
            .begin_confirmation(conv, "launch", &serde_json::json!({}))
            .await
            .unwrap();

        let token = pending.confirmation_token;
        let a = tokio::spawn({
            let s = Arc::clone(&s);
            let token = token.clone();
            async move { s.conversations.confirm(conv, &token).await.unwrap() }
        });
        let b = tokio::spawn({
            let s = Arc::clone(&s);
            async move { s.conversations.confirm(conv, &token).await.unwrap() }
        });

        let outcomes = [a.await.unwrap(), b.await.unwrap()];
        let confirmed = outcomes
            .iter()
            .filter(|o| matches!(o, ConfirmOutcome::Confirmed(_)))
            .count();
        assert_eq!(confirmed, 1);
    }

    #[tokio::test]
    async fn test_pending_survives_reopen() {
        let config = TillerConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiller.db");

        let token = {
            let s = Store::open(&path, &config).unwrap();
            let conv = Uuid::new_v4();
            let p = s
                .conversations
                .begin_confirmation(conv, "erase_disk", &serde_json::json!({"disk": "b"}))
                .await
                .unwrap();
            p.confirmation_token
        };

        let s = Store::open(&path, &config).unwrap();
        let restored = s.conversations.load_pending().unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].1.confirmation_token, token);
        assert_eq!(restored[0].1.name, "erase_disk");
    }

    #[tokio::test]
    async fn test_per_conversation_mutexes_pruned_by_sweep() {
        let s = store();
        for _ in 0..4 {
            let conv = Uuid::new_v4();
            let p = s
                .conversations
                .begin_confirmation(conv, "open_vent", &serde_json::json!({}))
                .await
                .unwrap();
            s.conversations
                .confirm(conv, &p.confirmation_token)
                .await
                .unwrap();
        }
        assert_eq!(s.conversations.key_lock_count(), 4);

        // The sweep drops mutexes no caller is holding
        s.conversations.sweep_expired().unwrap();
        assert_eq!(s.conversations.key_lock_count(), 0);
    }
}

mod audit {
    use super::*;
    use tiller_store::{AuditKind, AuditRecord};

    #[test]
    fn test_append_and_read_back_in_order() {
        let s = store();
        for i in 0..3 {
            s.audit
                .append(&AuditRecord::new(
                    AuditKind::JobRun,
                    format!("job-{i}"),
                    serde_json::json!({"n": i}),
                ))
                .unwrap();
        }

        assert_eq!(s.audit.count().unwrap(), 3);
        let recent = s.audit.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        // Newest first
        assert_eq!(recent[0].subject, "job-2");
        assert_eq!(recent[1].subject, "job-1");
    }
}
