//! Integration tests for the transactional core service.
//!
//! Exercises the production storage layer against an isolated Postgres
//! database: enqueue-and-charge semantics, queue claiming, terminal
//! transitions, refunds, and ledger consistency.

use std::{collections::HashSet, sync::Arc, time::Duration};

use kurier_core::{
    models::{MessageFilter, MessageStatus, SendRequest, TransactionKind},
    CoreError, Storage,
};
use kurier_testing::TestEnv;

fn send_request(env_user: kurier_core::UserId, key: Option<&str>) -> SendRequest {
    SendRequest {
        user_id: env_user,
        to: "+491701234567".to_string(),
        body: "hi".to_string(),
        idempotency_key: key.map(ToString::to_string),
    }
}

#[tokio::test]
async fn top_up_then_balance() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let user = env.create_user("acme").await.unwrap();

    env.top_up(user, 100).await.unwrap();

    assert_eq!(env.balance(user).await.unwrap(), 100);

    let ledger = env.storage().ledger.list_for_user(user).await.unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].kind, TransactionKind::Topup);
    assert_eq!(ledger[0].amount, 100);
    assert!(ledger[0].message_id.is_none());
}

#[tokio::test]
async fn top_up_rejects_non_positive_amounts() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let user = env.create_user("acme").await.unwrap();

    let err = env.storage().top_up(user, 0).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidAmount));

    let err = env.storage().top_up(user, -5).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidAmount));

    assert_eq!(env.balance(user).await.unwrap(), 0);
}

#[tokio::test]
async fn top_up_unknown_user_fails() {
    let env = TestEnv::new().await.expect("test environment setup failed");

    let err = env.storage().top_up(kurier_core::UserId::new(), 10).await.unwrap_err();
    assert!(matches!(err, CoreError::UserNotFound));
}

#[tokio::test]
async fn concurrent_idempotent_enqueue_debits_once() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let user = env.create_user("acme").await.unwrap();
    env.top_up(user, 10).await.unwrap();

    let storage = env.storage();
    let mut handles = Vec::new();
    for _ in 0..20 {
        let storage: Arc<Storage> = storage.clone();
        handles.push(tokio::spawn(async move {
            storage.enqueue_and_charge(&send_request(user, Some("same-key"))).await
        }));
    }

    let mut ids = HashSet::new();
    for handle in handles {
        if let Ok((id, _already)) = handle.await.expect("task completed") {
            ids.insert(id);
        }
    }

    // Every successful call saw the same message.
    assert_eq!(ids.len(), 1);

    assert_eq!(env.balance(user).await.unwrap(), 9);

    let message_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
        .fetch_one(env.pool())
        .await
        .unwrap();
    assert_eq!(message_count, 1);

    let id = *ids.iter().next().unwrap();
    assert_eq!(storage.ledger.count_for_message(id, TransactionKind::Debit).await.unwrap(), 1);
}

#[tokio::test]
async fn sequential_replay_returns_same_id() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let user = env.create_user("acme").await.unwrap();
    env.top_up(user, 10).await.unwrap();

    let storage = env.storage();
    let (first, already) =
        storage.enqueue_and_charge(&send_request(user, Some("key-1"))).await.unwrap();
    assert!(!already);

    let (second, already) =
        storage.enqueue_and_charge(&send_request(user, Some("key-1"))).await.unwrap();
    assert!(already);
    assert_eq!(first, second);

    assert_eq!(env.balance(user).await.unwrap(), 9);
}

#[tokio::test]
async fn absent_keys_never_collide() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let user = env.create_user("acme").await.unwrap();
    env.top_up(user, 10).await.unwrap();

    let storage = env.storage();
    let (first, _) = storage.enqueue_and_charge(&send_request(user, None)).await.unwrap();
    let (second, _) = storage.enqueue_and_charge(&send_request(user, None)).await.unwrap();

    assert_ne!(first, second);
    assert_eq!(env.balance(user).await.unwrap(), 8);
}

#[tokio::test]
async fn insufficient_balance_leaves_no_trace() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let user = env.create_user("acme").await.unwrap();

    let err = env.storage().enqueue_and_charge(&send_request(user, None)).await.unwrap_err();
    assert!(matches!(err, CoreError::InsufficientBalance));

    let message_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
        .fetch_one(env.pool())
        .await
        .unwrap();
    assert_eq!(message_count, 0);

    assert!(env.storage().ledger.list_for_user(user).await.unwrap().is_empty());
}

#[tokio::test]
async fn enqueue_validates_body_and_user() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let user = env.create_user("acme").await.unwrap();
    env.top_up(user, 1).await.unwrap();

    let mut request = send_request(user, None);
    request.to = String::new();
    let err = env.storage().enqueue_and_charge(&request).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidBody));

    let err = env
        .storage()
        .enqueue_and_charge(&send_request(kurier_core::UserId::new(), None))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::UserNotFound));
}

#[tokio::test]
async fn claim_load_and_mark_sent_happy_path() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let user = env.create_user("acme").await.unwrap();
    env.top_up(user, 2).await.unwrap();

    let id = env.enqueue(user, "+49", "ok", None).await.unwrap();

    let claimed = env.storage().messages.claim_queued(10).await.unwrap();
    assert_eq!(claimed, vec![id]);

    let job = env.storage().messages.load_for_send(id).await.unwrap();
    assert_eq!(job.user_id, user);
    assert_eq!(job.to, "+49");
    assert_eq!(job.body, "ok");
    assert_eq!(job.attempts, 1);

    env.storage().messages.mark_sent(id, "prov-1").await.unwrap();

    let message = env.message(id).await.unwrap();
    assert_eq!(message.status, MessageStatus::Sent);
    assert_eq!(message.provider_message_id.as_deref(), Some("prov-1"));
    assert!(message.sent_at.is_some());
    assert_eq!(message.attempts, 1);
}

#[tokio::test]
async fn mark_sent_is_a_no_op_on_repeat() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let user = env.create_user("acme").await.unwrap();
    env.top_up(user, 1).await.unwrap();

    let id = env.enqueue(user, "+49", "x", None).await.unwrap();
    env.storage().messages.claim_queued(10).await.unwrap();

    env.storage().messages.mark_sent(id, "prov-1").await.unwrap();
    env.storage().messages.mark_sent(id, "prov-2").await.unwrap();

    let message = env.message(id).await.unwrap();
    assert_eq!(message.provider_message_id.as_deref(), Some("prov-1"));
    assert_eq!(message.status, MessageStatus::Sent);
}

#[tokio::test]
async fn retry_pushes_send_after_into_the_future() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let user = env.create_user("acme").await.unwrap();
    env.top_up(user, 1).await.unwrap();

    let id = env.enqueue(user, "+49", "x", None).await.unwrap();
    env.storage().messages.claim_queued(10).await.unwrap();

    env.storage().messages.mark_failed_retry(id, Duration::from_secs(30)).await.unwrap();

    let message = env.message(id).await.unwrap();
    assert_eq!(message.status, MessageStatus::Queued);
    assert!(message.send_after > chrono::Utc::now());
    assert_eq!(message.attempts, 1);

    // Not yet eligible: the claim scan must skip it.
    assert!(env.storage().messages.claim_queued(10).await.unwrap().is_empty());

    // The credit stays debited; the message is still owed.
    assert_eq!(env.balance(user).await.unwrap(), 0);
}

#[tokio::test]
async fn elapsed_retry_is_claimable_again() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let user = env.create_user("acme").await.unwrap();
    env.top_up(user, 1).await.unwrap();

    let id = env.enqueue(user, "+49", "x", None).await.unwrap();
    env.storage().messages.claim_queued(10).await.unwrap();
    env.storage().messages.mark_failed_retry(id, Duration::ZERO).await.unwrap();

    let reclaimed = env.storage().messages.claim_queued(10).await.unwrap();
    assert_eq!(reclaimed, vec![id]);

    // Attempts increments exactly once per claim.
    assert_eq!(env.message(id).await.unwrap().attempts, 2);
}

#[tokio::test]
async fn refund_on_permanent_failure_restores_balance() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let user = env.create_user("acme").await.unwrap();
    env.top_up(user, 1).await.unwrap();

    let id = env.enqueue(user, "+49", "x", None).await.unwrap();
    assert_eq!(env.balance(user).await.unwrap(), 0);

    let refunded = env.storage().mark_failed_refund(id, "load_failed").await.unwrap();
    assert!(refunded);

    assert_eq!(env.balance(user).await.unwrap(), 1);

    let message = env.message(id).await.unwrap();
    assert_eq!(message.status, MessageStatus::Failed);
    assert_eq!(message.error_code.as_deref(), Some("load_failed"));

    let storage = env.storage();
    assert_eq!(storage.ledger.count_for_message(id, TransactionKind::Debit).await.unwrap(), 1);
    assert_eq!(storage.ledger.count_for_message(id, TransactionKind::Refund).await.unwrap(), 1);
}

#[tokio::test]
async fn refund_happens_at_most_once() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let user = env.create_user("acme").await.unwrap();
    env.top_up(user, 1).await.unwrap();

    let id = env.enqueue(user, "+49", "x", None).await.unwrap();

    assert!(env.storage().mark_failed_refund(id, "load_failed").await.unwrap());
    assert!(!env.storage().mark_failed_refund(id, "load_failed").await.unwrap());

    assert_eq!(env.balance(user).await.unwrap(), 1);
    assert_eq!(
        env.storage().ledger.count_for_message(id, TransactionKind::Refund).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn mark_failed_without_refund_moves_no_credits() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let user = env.create_user("acme").await.unwrap();
    env.top_up(user, 1).await.unwrap();

    let id = env.enqueue(user, "+49", "x", None).await.unwrap();
    env.storage().messages.claim_queued(10).await.unwrap();

    env.storage().messages.mark_failed(id, "operator_drop").await.unwrap();

    let message = env.message(id).await.unwrap();
    assert_eq!(message.status, MessageStatus::Failed);
    assert_eq!(message.error_code.as_deref(), Some("operator_drop"));

    // No ledger movement, and the failed state blocks a later refund.
    assert_eq!(env.balance(user).await.unwrap(), 0);
    assert!(!env.storage().mark_failed_refund(id, "late").await.unwrap());
    assert_eq!(
        env.storage().ledger.count_for_message(id, TransactionKind::Refund).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn created_user_is_readable() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let user = env.create_user("acme").await.unwrap();

    let row = env.storage().users.find_by_id(user).await.unwrap().expect("user exists");
    assert_eq!(row.id, user);
    assert_eq!(row.name, "acme");
    assert_eq!(row.balance, 0);

    let missing = env.storage().users.find_by_id(kurier_core::UserId::new()).await.unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn sent_messages_are_never_refunded() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let user = env.create_user("acme").await.unwrap();
    env.top_up(user, 1).await.unwrap();

    let id = env.enqueue(user, "+49", "x", None).await.unwrap();
    env.storage().messages.claim_queued(10).await.unwrap();
    env.storage().messages.mark_sent(id, "prov-1").await.unwrap();

    assert!(!env.storage().mark_failed_refund(id, "too_late").await.unwrap());

    let message = env.message(id).await.unwrap();
    assert_eq!(message.status, MessageStatus::Sent);
    assert_eq!(env.balance(user).await.unwrap(), 0);
}

#[tokio::test]
async fn concurrent_claims_never_hand_out_duplicates() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let user = env.create_user("acme").await.unwrap();
    env.top_up(user, 200).await.unwrap();

    const TOTAL: usize = 100;
    for i in 0..TOTAL {
        env.enqueue(user, "+49", "x", Some(&i.to_string())).await.unwrap();
    }

    let queued = env.storage().messages.count_by_status(MessageStatus::Queued).await.unwrap();
    assert_eq!(queued, TOTAL as i64, "precondition failed: not all messages queued");

    let seen = Arc::new(tokio::sync::Mutex::new(HashSet::new()));
    let mut handles = Vec::new();

    for _ in 0..8 {
        let storage = env.storage();
        let seen = seen.clone();
        handles.push(tokio::spawn(async move {
            let deadline = std::time::Instant::now() + Duration::from_secs(10);
            loop {
                {
                    let seen = seen.lock().await;
                    if seen.len() >= TOTAL {
                        return Ok(());
                    }
                }
                if std::time::Instant::now() >= deadline {
                    return Err("timed out before claiming all messages");
                }

                let ids = storage.messages.claim_queued(10).await.expect("claim succeeds");
                if ids.is_empty() {
                    // Others may be mid-commit; retry shortly.
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    continue;
                }

                let mut seen = seen.lock().await;
                for id in ids {
                    assert!(seen.insert(id), "duplicate claim: {id}");
                }
            }
        }));
    }

    for handle in handles {
        handle.await.expect("worker completed").expect("claimed within budget");
    }

    assert_eq!(seen.lock().await.len(), TOTAL);
}

#[tokio::test]
async fn ledger_matches_balance_after_mixed_operations() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let user = env.create_user("acme").await.unwrap();
    env.top_up(user, 5).await.unwrap();

    let first = env.enqueue(user, "+49", "a", Some("k1")).await.unwrap();
    let _second = env.enqueue(user, "+49", "b", Some("k2")).await.unwrap();
    env.top_up(user, 3).await.unwrap();
    env.storage().mark_failed_refund(first, "load_failed").await.unwrap();

    let balance = env.balance(user).await.unwrap();
    let net = env.storage().ledger.net_for_user(user).await.unwrap();
    assert_eq!(balance, net);
    assert_eq!(balance, 7); // 5 - 2 debits + 3 + 1 refund
}

#[tokio::test]
async fn reaper_requeues_stuck_sending_rows() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let user = env.create_user("acme").await.unwrap();
    env.top_up(user, 2).await.unwrap();

    let stuck = env.enqueue(user, "+49", "a", None).await.unwrap();
    let fresh = env.enqueue(user, "+49", "b", None).await.unwrap();

    env.storage().messages.claim_queued(10).await.unwrap();

    // Backdate one claim to simulate a worker that died mid-send.
    sqlx::query("UPDATE messages SET last_attempt_at = NOW() - INTERVAL '1 hour' WHERE id = $1")
        .bind(stuck)
        .execute(env.pool())
        .await
        .unwrap();

    let requeued = env.storage().messages.requeue_stuck(Duration::from_secs(600)).await.unwrap();
    assert_eq!(requeued, 1);

    assert_eq!(env.message_status(stuck).await.unwrap(), MessageStatus::Queued);
    assert_eq!(env.message_status(fresh).await.unwrap(), MessageStatus::Sending);

    // Requeueing moves no credits.
    assert_eq!(env.balance(user).await.unwrap(), 0);
}

#[tokio::test]
async fn query_messages_filters_and_paginates() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let user = env.create_user("acme").await.unwrap();
    env.top_up(user, 10).await.unwrap();

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(env.enqueue(user, "+49", &format!("m{i}"), None).await.unwrap());
    }

    env.storage().messages.claim_queued(1).await.unwrap();
    env.storage().messages.mark_sent(ids[0], "prov-1").await.unwrap();

    let all = env.storage().messages.query(user, &MessageFilter::default()).await.unwrap();
    assert_eq!(all.len(), 5);
    // Newest first.
    for window in all.windows(2) {
        assert!(window[0].requested_at >= window[1].requested_at);
    }

    let sent_only = env
        .storage()
        .messages
        .query(
            user,
            &MessageFilter { status: Some(MessageStatus::Sent), ..Default::default() },
        )
        .await
        .unwrap();
    assert_eq!(sent_only.len(), 1);
    assert_eq!(sent_only[0].id, ids[0]);

    let page = env
        .storage()
        .messages
        .query(user, &MessageFilter { limit: Some(2), offset: Some(1), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(page.len(), 2);

    let future_only = env
        .storage()
        .messages
        .query(
            user,
            &MessageFilter {
                from: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(future_only.is_empty());
}

#[tokio::test]
async fn message_lookup_is_scoped_to_its_owner() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let owner = env.create_user("owner").await.unwrap();
    let stranger = env.create_user("stranger").await.unwrap();
    env.top_up(owner, 1).await.unwrap();

    let id = env.enqueue(owner, "+49", "private", None).await.unwrap();

    let found = env.storage().messages.find_by_id(owner, id).await.unwrap();
    assert!(found.is_some());

    let hidden = env.storage().messages.find_by_id(stranger, id).await.unwrap();
    assert!(hidden.is_none());
}
