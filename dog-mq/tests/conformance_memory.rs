use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;

use dog_mq::{
    Backend, Broker, BrokerConfig, BrokerError, ClaimId, ClaimOptions, ClaimUpdate, Clock, Document,
    DriverRegistry, ErrorKind, ListOptions, ManualClock, MemoryDriver, MessageId,
    MissingQueueStats, NewMessage, Pool, QueueMetadata, RetryConfig,
};

const PROJECT: &str = "acme";

/// Test factory functions
fn test_config() -> BrokerConfig {
    BrokerConfig::default()
        .with_pool(Pool::new("primary", "memory://primary"))
        .with_retry(RetryConfig::immediate(1000, 3))
}

async fn broker_with(config: BrokerConfig, clock: Arc<ManualClock>) -> Broker {
    Broker::builder()
        .with_config(config)
        .with_clock(clock)
        .build()
        .await
        .unwrap()
}

async fn test_broker() -> (Broker, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    (broker_with(test_config(), clock.clone()).await, clock)
}

fn batch(n: usize) -> Vec<NewMessage> {
    (0..n).map(|i| NewMessage::new(json!({ "seq": i }))).collect()
}

async fn post(broker: &Broker, queue: &str, n: usize) -> Vec<MessageId> {
    broker
        .messages()
        .post(queue, PROJECT, batch(n), None)
        .await
        .unwrap()
}

async fn listed(broker: &Broker, queue: &str, options: ListOptions) -> Vec<MessageId> {
    broker
        .messages()
        .list(queue, PROJECT, &options)
        .await
        .unwrap()
        .into_page()
        .await
        .unwrap()
        .items
        .into_iter()
        .map(|m| m.id)
        .collect()
}

/// Idempotent deletes of things that never existed
#[tokio::test]
async fn test_deleting_missing_entities_succeeds() {
    let (broker, _) = test_broker().await;
    let ghost_message = MessageId::from_marker(99);
    let ghost_claim = ClaimId::new();

    for _ in 0..2 {
        broker.queues().delete("ghost", PROJECT).await.unwrap();
        broker
            .messages()
            .delete("ghost", PROJECT, &ghost_message, None)
            .await
            .unwrap();
        broker.claims().delete("ghost", PROJECT, &ghost_claim).await.unwrap();
    }

    post(&broker, "real", 1).await;
    broker
        .messages()
        .delete("real", PROJECT, &ghost_message, None)
        .await
        .unwrap();
    broker.claims().delete("real", PROJECT, &ghost_claim).await.unwrap();
}

/// Concurrent claims never share a message
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_are_exclusive() {
    let broker = Arc::new(Broker::builder().with_config(test_config()).build().await.unwrap());
    post(&broker, "work", 20).await;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .claims()
                    .create("work", PROJECT, &ClaimOptions::new().limit(5))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        let claim = handle.await.unwrap();
        for message in claim.messages {
            total += 1;
            assert!(seen.insert(message.id), "message handed to two claims");
        }
    }
    assert!(total > 0);
    let stats = broker.queues().stats("work", PROJECT).await.unwrap();
    assert_eq!(stats.claimed, total);
    assert_eq!(stats.total, 20);
}

/// Claimed messages drop out of the default listing until released or expired
#[tokio::test]
async fn test_claimed_messages_are_hidden_until_released() {
    let (broker, clock) = test_broker().await;
    let ids = post(&broker, "vis", 4).await;

    let claim = broker
        .claims()
        .create("vis", PROJECT, &ClaimOptions::new().limit(2).ttl(60))
        .await
        .unwrap();
    assert_eq!(listed(&broker, "vis", ListOptions::new()).await, ids[2..].to_vec());
    assert_eq!(
        listed(&broker, "vis", ListOptions::new().include_claimed(true)).await,
        ids
    );

    // lapses on its own
    clock.advance_secs(60);
    assert_eq!(listed(&broker, "vis", ListOptions::new()).await, ids);

    let claim_id = claim.id.unwrap();
    assert!(broker
        .claims()
        .get("vis", PROJECT, &claim_id)
        .await
        .unwrap_err()
        .is_not_found());
}

/// Grace keeps claimed messages alive past their own ttl
#[tokio::test]
async fn test_grace_extends_claimed_message_lifetime() {
    let (broker, clock) = test_broker().await;
    let ids = broker
        .messages()
        .post("grace", PROJECT, vec![NewMessage::new(json!("x")).with_ttl(60)], None)
        .await
        .unwrap();

    // claimed one second before the message would expire
    clock.advance_secs(59);
    let claim = broker
        .claims()
        .create("grace", PROJECT, &ClaimOptions::new().ttl(60).grace(60))
        .await
        .unwrap();
    let claim_id = claim.id.unwrap();
    assert_eq!(claim.messages.len(), 1);

    clock.advance_secs(59);
    let held = broker.claims().get("grace", PROJECT, &claim_id).await.unwrap();
    assert_eq!(held.messages[0].id, ids[0]);

    // claim over, grace still running
    clock.advance_secs(60);
    broker.messages().get("grace", PROJECT, &ids[0]).await.unwrap();

    clock.advance_secs(1);
    let err = broker.messages().get("grace", PROJECT, &ids[0]).await.unwrap_err();
    assert!(matches!(err, BrokerError::MessageDoesNotExist { .. }));
}

/// Lowest ids are claimed first
#[tokio::test]
async fn test_claims_take_lowest_ids_first() {
    let (broker, _) = test_broker().await;
    let ids = post(&broker, "fifo", 5).await;

    let claim = broker
        .claims()
        .create("fifo", PROJECT, &ClaimOptions::new().limit(2))
        .await
        .unwrap();
    let claimed: Vec<_> = claim.messages.into_iter().map(|m| m.id).collect();
    assert_eq!(claimed, ids[..2].to_vec());
    assert_eq!(claimed, vec![MessageId::from_marker(1), MessageId::from_marker(2)]);
}

/// Metadata comes back as stored, plus defaults for unset reserved keys
#[tokio::test]
async fn test_queue_metadata_round_trip() {
    let (broker, _) = test_broker().await;
    let meta = QueueMetadata {
        default_message_ttl: Some(120),
        ..Default::default()
    }
    .with_user_key("owner", json!({"team": "billing"}));

    assert!(broker.queues().create("meta", PROJECT, meta.clone()).await.unwrap());
    let stored = broker.queues().get("meta", PROJECT).await.unwrap();
    assert_eq!(stored, meta.clone().with_defaults(broker.config()));
    assert_eq!(stored.default_message_ttl, Some(120));
    assert_eq!(stored.extra["owner"], json!({"team": "billing"}));

    // re-creating overwrites and reports an existing queue
    let renamed = QueueMetadata::default().with_user_key("owner", json!("ops"));
    assert!(!broker.queues().create("meta", PROJECT, renamed).await.unwrap());
    let stored = broker.queues().get("meta", PROJECT).await.unwrap();
    assert_eq!(stored.extra["owner"], json!("ops"));
    assert_eq!(stored.default_message_ttl, Some(broker.config().default_message_ttl));
}

/// Batch size is checked before anything is written
#[tokio::test]
async fn test_batch_limit_enforced_before_persisting() {
    let clock = Arc::new(ManualClock::starting_now());
    let config = BrokerConfig {
        max_messages_per_page: 50,
        ..test_config()
    };
    let broker = broker_with(config, clock).await;

    let err = broker
        .messages()
        .post("limits", PROJECT, batch(60), None)
        .await
        .unwrap_err();
    assert!(err.is_validation());
    assert!(!broker.queues().exists("limits", PROJECT).await.unwrap());
    assert_eq!(broker.catalog().lookup(PROJECT, "limits").await.unwrap(), None);

    let ids = post(&broker, "limits", 50).await;
    assert_eq!(ids.len(), 50);
}

/// One bad message rejects the whole batch
#[tokio::test]
async fn test_invalid_message_rejects_batch() {
    let (broker, _) = test_broker().await;
    let messages = vec![
        NewMessage::new(json!(1)),
        NewMessage::new(json!(2)).with_ttl(10),
    ];
    let err = broker
        .messages()
        .post("strict", PROJECT, messages, None)
        .await
        .unwrap_err();
    assert!(err.is_validation());
    assert!(!broker.queues().exists("strict", PROJECT).await.unwrap());
}

/// Routing does not move when weights change
#[tokio::test]
async fn test_catalog_routing_is_stable() {
    let (broker, _) = test_broker().await;
    post(&broker, "sticky", 1).await;
    let first = broker.catalog().lookup(PROJECT, "sticky").await.unwrap();
    assert_eq!(first.as_deref(), Some("primary"));

    broker
        .pools()
        .register_pool(Pool::new("primary", "memory://primary").weight(0))
        .await
        .unwrap();
    broker
        .pools()
        .register_pool(Pool::new("secondary", "memory://secondary").weight(100))
        .await
        .unwrap();

    for _ in 0..5 {
        assert_eq!(
            broker.catalog().resolve(PROJECT, "sticky", None).await.unwrap(),
            "primary"
        );
    }
    post(&broker, "sticky", 1).await;
    assert_eq!(listed(&broker, "sticky", ListOptions::new()).await.len(), 2);

    post(&broker, "fresh", 1).await;
    assert_eq!(
        broker.catalog().lookup(PROJECT, "fresh").await.unwrap().as_deref(),
        Some("secondary")
    );
}

/// Post ten, claim three, list the rest, release, list all
#[tokio::test]
async fn test_claim_release_scenario() {
    let (broker, _) = test_broker().await;
    broker
        .queues()
        .create("Q", PROJECT, QueueMetadata::default())
        .await
        .unwrap();
    let ids = post(&broker, "Q", 10).await;

    let claim = broker
        .claims()
        .create("Q", PROJECT, &ClaimOptions::new().limit(3))
        .await
        .unwrap();
    let claimed: Vec<_> = claim.messages.iter().map(|m| m.id.clone()).collect();
    assert_eq!(claimed, ids[..3].to_vec());
    assert_eq!(listed(&broker, "Q", ListOptions::new()).await, ids[3..].to_vec());

    let stats = broker.queues().stats("Q", PROJECT).await.unwrap();
    assert_eq!((stats.claimed, stats.free, stats.total), (3, 7, 10));

    let claim_id = claim.id.unwrap();
    broker.claims().delete("Q", PROJECT, &claim_id).await.unwrap();
    assert_eq!(listed(&broker, "Q", ListOptions::new()).await, ids);

    // releasing twice is fine
    broker.claims().delete("Q", PROJECT, &claim_id).await.unwrap();
}

#[tokio::test]
async fn test_claimed_message_delete_requires_owner() {
    let (broker, _) = test_broker().await;
    let ids = post(&broker, "own", 2).await;
    let claim = broker
        .claims()
        .create("own", PROJECT, &ClaimOptions::new().limit(1))
        .await
        .unwrap();
    let owner = claim.id.unwrap();

    let err = broker
        .messages()
        .delete("own", PROJECT, &ids[0], None)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::MessageIsClaimed { .. }));

    let stranger = ClaimId::new();
    let err = broker
        .messages()
        .delete("own", PROJECT, &ids[0], Some(&stranger))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::MessageNotClaimedBy { .. }));

    // unclaimed message, dead claim id
    let err = broker
        .messages()
        .delete("own", PROJECT, &ids[1], Some(&stranger))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::ClaimDoesNotExist { .. }));

    // unclaimed message, live claim id
    let err = broker
        .messages()
        .delete("own", PROJECT, &ids[1], Some(&owner))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::MessageNotClaimed { .. }));

    broker
        .messages()
        .delete("own", PROJECT, &ids[0], Some(&owner))
        .await
        .unwrap();
    assert!(broker.messages().get("own", PROJECT, &ids[0]).await.is_err());
}

#[tokio::test]
async fn test_delayed_messages_stay_invisible() {
    let (broker, clock) = test_broker().await;
    let delayed = broker
        .messages()
        .post("later", PROJECT, vec![NewMessage::new(json!("soon")).with_delay(30)], None)
        .await
        .unwrap();

    assert!(listed(&broker, "later", ListOptions::new()).await.is_empty());
    assert_eq!(
        listed(&broker, "later", ListOptions::new().include_delayed(true)).await,
        delayed
    );
    assert!(broker
        .claims()
        .create("later", PROJECT, &ClaimOptions::new())
        .await
        .unwrap()
        .is_empty());
    assert!(broker.messages().pop("later", PROJECT, 1).await.unwrap().is_empty());

    clock.advance_secs(30);
    let claim = broker
        .claims()
        .create("later", PROJECT, &ClaimOptions::new())
        .await
        .unwrap();
    assert_eq!(claim.messages[0].id, delayed[0]);
}

#[tokio::test]
async fn test_queue_defaults_apply_to_posted_messages() {
    let (broker, _) = test_broker().await;
    let meta = QueueMetadata {
        default_message_ttl: Some(120),
        default_message_delay: Some(5),
        ..Default::default()
    };
    broker.queues().create("defaults", PROJECT, meta).await.unwrap();
    let ids = post(&broker, "defaults", 1).await;

    let page = broker
        .messages()
        .list("defaults", PROJECT, &ListOptions::new().include_delayed(true))
        .await
        .unwrap()
        .into_page()
        .await
        .unwrap();
    assert_eq!(page.items[0].id, ids[0]);
    assert_eq!(page.items[0].ttl, 120);
    assert!(listed(&broker, "defaults", ListOptions::new()).await.is_empty());
}

#[tokio::test]
async fn test_over_claimed_messages_move_to_dead_letter_queue() {
    let (broker, _) = test_broker().await;
    let meta = QueueMetadata {
        max_claim_count: Some(1),
        dead_letter_queue: Some("graveyard".into()),
        dead_letter_queue_messages_ttl: Some(600),
        ..Default::default()
    };
    broker.queues().create("flaky", PROJECT, meta).await.unwrap();
    post(&broker, "flaky", 1).await;

    let first = broker
        .claims()
        .create("flaky", PROJECT, &ClaimOptions::new())
        .await
        .unwrap();
    assert_eq!(first.messages.len(), 1);
    assert_eq!(first.messages[0].claim_count, 1);
    broker
        .claims()
        .delete("flaky", PROJECT, first.id.as_ref().unwrap())
        .await
        .unwrap();

    let second = broker
        .claims()
        .create("flaky", PROJECT, &ClaimOptions::new())
        .await
        .unwrap();
    assert!(second.is_empty());
    assert_eq!(second.id, None);

    let stats = broker.queues().stats("flaky", PROJECT).await.unwrap();
    assert_eq!(stats.total, 0);
    let dead = broker
        .messages()
        .list("graveyard", PROJECT, &ListOptions::new())
        .await
        .unwrap()
        .into_page()
        .await
        .unwrap();
    assert_eq!(dead.items.len(), 1);
    assert_eq!(dead.items[0].ttl, 600);
    assert_eq!(dead.items[0].body, json!({ "seq": 0 }));
}

#[tokio::test]
async fn test_pop_removes_oldest_free_messages() {
    let (broker, _) = test_broker().await;
    assert!(broker.messages().pop("empty", PROJECT, 5).await.unwrap().is_empty());

    let ids = post(&broker, "pop", 3).await;
    let popped: Vec<_> = broker
        .messages()
        .pop("pop", PROJECT, 2)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(popped, ids[..2].to_vec());

    let rest = broker.messages().pop("pop", PROJECT, 5).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert!(broker.messages().pop("pop", PROJECT, 5).await.unwrap().is_empty());
    assert!(broker.messages().pop("pop", PROJECT, 0).await.unwrap_err().is_validation());
}

#[tokio::test]
async fn test_listing_resumes_after_marker() {
    let (broker, _) = test_broker().await;
    let ids = post(&broker, "pages", 5).await;

    let mut cursor = broker
        .messages()
        .list("pages", PROJECT, &ListOptions::new().limit(2))
        .await
        .unwrap();
    let mut first = Vec::new();
    while let Some(message) = cursor.next().await {
        first.push(message.unwrap().id);
    }
    assert_eq!(first, ids[..2].to_vec());
    let marker = cursor.next_marker().unwrap().to_string();

    let second = listed(&broker, "pages", ListOptions::new().marker(marker).limit(2)).await;
    assert_eq!(second, ids[2..4].to_vec());

    // ids posted later never land before an issued marker
    let newer = post(&broker, "pages", 1).await;
    let tail = listed(&broker, "pages", ListOptions::new().marker(ids[3].to_string())).await;
    assert_eq!(tail, vec![ids[4].clone(), newer[0].clone()]);

    let err = broker
        .messages()
        .list("pages", PROJECT, &ListOptions::new().marker("bogus"))
        .await
        .err()
        .unwrap();
    assert!(err.is_validation());
}

#[tokio::test]
async fn test_echo_controls_own_messages() {
    let (broker, _) = test_broker().await;
    broker
        .messages()
        .post("chat", PROJECT, batch(2), Some("client-a"))
        .await
        .unwrap();
    let theirs = broker
        .messages()
        .post("chat", PROJECT, batch(1), Some("client-b"))
        .await
        .unwrap();

    let without_echo = listed(&broker, "chat", ListOptions::new().client_uuid("client-a")).await;
    assert_eq!(without_echo, theirs);

    let with_echo = listed(
        &broker,
        "chat",
        ListOptions::new().client_uuid("client-a").echo(true),
    )
    .await;
    assert_eq!(with_echo.len(), 3);
}

#[tokio::test]
async fn test_queue_stats_report_edges() {
    let (broker, clock) = test_broker().await;
    let first = post(&broker, "stats", 1).await;
    clock.advance_secs(10);
    let last = post(&broker, "stats", 1).await;

    let stats = broker.queues().stats("stats", PROJECT).await.unwrap();
    assert_eq!((stats.claimed, stats.free, stats.total), (0, 2, 2));
    let oldest = stats.oldest.unwrap();
    let newest = stats.newest.unwrap();
    assert_eq!(oldest.id, first[0]);
    assert_eq!(oldest.age, 10);
    assert_eq!(newest.id, last[0]);
    assert_eq!(newest.age, 0);

    let err = broker.queues().stats("nope", PROJECT).await.unwrap_err();
    assert!(matches!(err, BrokerError::QueueDoesNotExist { .. }));
}

#[tokio::test]
async fn test_missing_queue_stats_can_be_zeroed() {
    let clock = Arc::new(ManualClock::starting_now());
    let config = BrokerConfig {
        missing_queue_stats: MissingQueueStats::Zeroed,
        ..test_config()
    };
    let broker = broker_with(config, clock).await;

    let stats = broker.queues().stats("nope", PROJECT).await.unwrap();
    assert_eq!(stats.total, 0);
    assert!(stats.oldest.is_none());
}

#[tokio::test]
async fn test_queue_delete_cascades() {
    let (broker, _) = test_broker().await;
    post(&broker, "doomed", 3).await;
    broker
        .claims()
        .create("doomed", PROJECT, &ClaimOptions::new().limit(1))
        .await
        .unwrap();

    broker.queues().delete("doomed", PROJECT).await.unwrap();
    assert!(!broker.queues().exists("doomed", PROJECT).await.unwrap());
    assert_eq!(broker.catalog().lookup(PROJECT, "doomed").await.unwrap(), None);
    assert!(listed(&broker, "doomed", ListOptions::new().include_claimed(true))
        .await
        .is_empty());

    // a recreated queue starts over
    let ids = post(&broker, "doomed", 1).await;
    assert_eq!(ids, vec![MessageId::from_marker(1)]);
}

#[tokio::test]
async fn test_metadata_patches() {
    let (broker, _) = test_broker().await;
    broker
        .queues()
        .create("patch", PROJECT, QueueMetadata::default().with_user_key("a", json!(1)))
        .await
        .unwrap();

    let patched = broker
        .queues()
        .update_metadata(
            "patch",
            PROJECT,
            &[
                dog_mq::MetadataPatch::replace("a", json!(2)),
                dog_mq::MetadataPatch::add("_default_message_ttl", json!(300)),
            ],
        )
        .await
        .unwrap();
    assert_eq!(patched.extra["a"], json!(2));
    assert_eq!(patched.default_message_ttl, Some(300));

    let err = broker
        .queues()
        .update_metadata("patch", PROJECT, &[dog_mq::MetadataPatch::remove("missing")])
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Conflict(_)));

    let err = broker
        .queues()
        .update_metadata("ghost", PROJECT, &[dog_mq::MetadataPatch::add("a", json!(1))])
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    broker
        .queues()
        .set_metadata("patch", PROJECT, QueueMetadata::default())
        .await
        .unwrap();
    let stored = broker.queues().get("patch", PROJECT).await.unwrap();
    assert!(stored.extra.is_empty());
}

#[tokio::test]
async fn test_queue_listing_is_ordered_and_paged() {
    let (broker, _) = test_broker().await;
    for name in ["charlie", "alpha", "bravo"] {
        broker
            .queues()
            .create(name, PROJECT, QueueMetadata::default().with_user_key("n", json!(name)))
            .await
            .unwrap();
    }
    broker
        .queues()
        .create("other-project", "someone-else", QueueMetadata::default())
        .await
        .unwrap();

    let page = broker
        .queues()
        .list(PROJECT, None, Some(2), true)
        .await
        .unwrap()
        .into_page()
        .await
        .unwrap();
    let names: Vec<_> = page.items.iter().map(|q| q.name.as_str()).collect();
    assert_eq!(names, ["alpha", "bravo"]);
    assert_eq!(page.items[0].metadata.as_ref().unwrap().extra["n"], json!("alpha"));

    let rest = broker
        .queues()
        .list(PROJECT, page.next_marker.as_deref(), None, false)
        .await
        .unwrap()
        .into_page()
        .await
        .unwrap();
    assert_eq!(rest.items.len(), 1);
    assert_eq!(rest.items[0].name, "charlie");
    assert!(rest.items[0].metadata.is_none());
}

#[tokio::test]
async fn test_queue_listing_skips_routes_without_a_queue() {
    let (broker, _) = test_broker().await;
    for name in ["alpha", "charlie", "delta"] {
        broker
            .queues()
            .create(name, PROJECT, QueueMetadata::default())
            .await
            .unwrap();
    }
    // a route whose queue document was never written
    broker.catalog().resolve(PROJECT, "bravo", None).await.unwrap();

    let page = broker
        .queues()
        .list(PROJECT, None, Some(2), false)
        .await
        .unwrap()
        .into_page()
        .await
        .unwrap();
    let names: Vec<_> = page.items.iter().map(|q| q.name.as_str()).collect();
    assert_eq!(names, ["alpha", "charlie"]);
    assert!(!broker.queues().exists("bravo", PROJECT).await.unwrap());
}

#[tokio::test]
async fn test_queue_listing_validates_the_project() {
    let (broker, _) = test_broker().await;
    let project = "p".repeat(257);
    let err = broker
        .queues()
        .list(&project, None, None, false)
        .await
        .err()
        .unwrap();
    assert!(err.is_validation());
}

#[tokio::test]
async fn test_bulk_get_skips_missing_ids() {
    let (broker, _) = test_broker().await;
    let ids = post(&broker, "bulk", 3).await;
    let wanted = vec![
        ids[0].clone(),
        MessageId::from_marker(42),
        MessageId::from("garbage"),
        ids[2].clone(),
    ];
    let found: Vec<_> = broker
        .messages()
        .bulk_get("bulk", PROJECT, &wanted)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(found, vec![ids[0].clone(), ids[2].clone()]);
}

#[tokio::test]
async fn test_bulk_delete_respects_claims() {
    let (broker, _) = test_broker().await;
    let ids = post(&broker, "sweep", 4).await;
    let claim = broker
        .claims()
        .create("sweep", PROJECT, &ClaimOptions::new().limit(2))
        .await
        .unwrap();
    let owner = claim.id.unwrap();

    // without the claim only free messages go
    broker
        .messages()
        .bulk_delete("sweep", PROJECT, &ids[1..3], None)
        .await
        .unwrap();
    let left = listed(&broker, "sweep", ListOptions::new().include_claimed(true)).await;
    assert_eq!(left, vec![ids[0].clone(), ids[1].clone(), ids[3].clone()]);

    let err = broker
        .messages()
        .bulk_delete("sweep", PROJECT, &ids, Some(&[ClaimId::new()]))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::ClaimDoesNotExist { .. }));

    broker
        .messages()
        .bulk_delete("sweep", PROJECT, &ids, Some(&[owner]))
        .await
        .unwrap();
    assert!(listed(&broker, "sweep", ListOptions::new().include_claimed(true))
        .await
        .is_empty());
}

#[tokio::test]
async fn test_claim_update_moves_expiry() {
    let (broker, clock) = test_broker().await;
    post(&broker, "renew", 1).await;
    let claim = broker
        .claims()
        .create("renew", PROJECT, &ClaimOptions::new().ttl(60))
        .await
        .unwrap();
    let claim_id = claim.id.unwrap();

    clock.advance_secs(50);
    broker
        .claims()
        .update("renew", PROJECT, &claim_id, &ClaimUpdate::ttl(120))
        .await
        .unwrap();

    clock.advance_secs(100);
    let details = broker.claims().get("renew", PROJECT, &claim_id).await.unwrap();
    assert_eq!(details.meta.ttl, 120);
    assert_eq!(details.meta.age, 150);
    assert_eq!(details.messages.len(), 1);

    clock.advance_secs(20);
    let err = broker
        .claims()
        .update("renew", PROJECT, &claim_id, &ClaimUpdate::ttl(120))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::ClaimDoesNotExist { .. }));

    let err = broker
        .claims()
        .update("renew", PROJECT, &claim_id, &ClaimUpdate::ttl(5))
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn test_claiming_a_missing_queue_is_empty() {
    let (broker, _) = test_broker().await;
    let claim = broker
        .claims()
        .create("nowhere", PROJECT, &ClaimOptions::new())
        .await
        .unwrap();
    assert!(claim.is_empty());
    assert!(!broker.queues().exists("nowhere", PROJECT).await.unwrap());
}

#[tokio::test]
async fn test_gc_reclaims_expired_rows() {
    let (broker, clock) = test_broker().await;
    broker
        .messages()
        .post("old", PROJECT, vec![NewMessage::new(json!(1)).with_ttl(60)], None)
        .await
        .unwrap();
    post(&broker, "old", 1).await;
    broker
        .claims()
        .create("old", PROJECT, &ClaimOptions::new().limit(1).ttl(60).grace(60))
        .await
        .unwrap();

    assert_eq!(broker.gc().await.unwrap().total(), 0);

    clock.advance_secs(121);
    let report = broker.gc().await.unwrap();
    assert_eq!(report.messages, 1);
    assert_eq!(report.claims, 1);

    let stats = broker.queues().stats("old", PROJECT).await.unwrap();
    assert_eq!(stats.total, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_posts_get_distinct_contiguous_ids() {
    let broker = Arc::new(Broker::builder().with_config(test_config()).build().await.unwrap());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let broker = broker.clone();
            tokio::spawn(async move { post(&broker, "busy", 5).await })
        })
        .collect();

    let mut all = HashSet::new();
    for handle in handles {
        let ids = handle.await.unwrap();
        let markers: Vec<u64> = ids.iter().map(|id| id.marker().unwrap()).collect();
        assert!(markers.windows(2).all(|w| w[1] == w[0] + 1));
        all.extend(markers);
    }
    assert_eq!(all.len(), 40);
    assert_eq!(broker.queues().stats("busy", PROJECT).await.unwrap().total, 40);
}

/// A row left at marker 4 by a poster that never advanced the counter
fn stray_row(now: i64) -> Document {
    match json!({
        "_id": format!("{PROJECT}/jobs/4"),
        "scope": format!("{PROJECT}/jobs"),
        "marker": 4,
        "body": "stray",
        "ttl": 300,
        "created": now,
        "expires": now + 300,
        "delay_until": now,
        "client_uuid": null,
        "claim_id": null,
        "claim_expires": now,
        "claim_count": 0,
        "tx": "abandoned",
    }) {
        serde_json::Value::Object(doc) => doc,
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_marker_conflicts_roll_back_and_stalled_counters_recover() {
    let clock = Arc::new(ManualClock::starting_now());
    let driver = Arc::new(MemoryDriver::new());
    let mut drivers = DriverRegistry::new();
    drivers.register(driver.clone());
    let broker = Broker::builder()
        .with_config(
            BrokerConfig::default()
                .with_pool(Pool::new("primary", "memory://conflicts"))
                .with_retry(RetryConfig::immediate(4, 3)),
        )
        .with_clock(clock.clone())
        .with_drivers(drivers)
        .build()
        .await
        .unwrap();
    let storage = driver.backend("memory://conflicts");

    assert_eq!(
        post(&broker, "jobs", 2).await,
        vec![MessageId::from_marker(1), MessageId::from_marker(2)]
    );
    storage
        .insert("messages", stray_row(clock.timestamp()))
        .await
        .unwrap();

    // markers 3..=5 collide at 4 on every attempt; the counter is still fresh
    let err = broker
        .messages()
        .post("jobs", PROJECT, batch(3), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::MessageConflict { .. }));
    assert_eq!(err.kind(), ErrorKind::MessageConflict);
    assert_eq!(storage.len("messages"), 3);
    let everything = ListOptions {
        include_claimed: true,
        include_delayed: true,
        echo: true,
        ..ListOptions::default()
    };
    assert_eq!(
        listed(&broker, "jobs", everything).await,
        vec![MessageId::from_marker(1), MessageId::from_marker(2)]
    );

    clock.advance_secs(6);
    let ids = post(&broker, "jobs", 3).await;
    assert_eq!(
        ids,
        vec![
            MessageId::from_marker(5),
            MessageId::from_marker(6),
            MessageId::from_marker(7),
        ]
    );
    assert_eq!(broker.queues().stats("jobs", PROJECT).await.unwrap().total, 5);
}

#[tokio::test]
async fn test_broker_is_alive() {
    let (broker, _) = test_broker().await;
    assert!(broker.is_alive().await);
}

mod fifo {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// Whatever was deleted, a claim takes the lowest remaining ids
        #[test]
        fn claims_take_the_lowest_remaining_ids(
            posted in 1usize..=20,
            limit in 1usize..=20,
            removed in proptest::collection::btree_set(1u64..=20, 0..8),
        ) {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            let (claimed, expected) = runtime.block_on(async {
                let (broker, _) = test_broker().await;
                let ids = post(&broker, "fair", posted).await;
                let doomed: Vec<_> = removed.iter().map(|m| MessageId::from_marker(*m)).collect();
                if !doomed.is_empty() {
                    broker
                        .messages()
                        .bulk_delete("fair", PROJECT, &doomed, None)
                        .await
                        .unwrap();
                }

                let expected: Vec<_> = ids
                    .into_iter()
                    .filter(|id| !removed.contains(&id.marker().unwrap()))
                    .take(limit)
                    .collect();
                let claimed: Vec<_> = broker
                    .claims()
                    .create("fair", PROJECT, &ClaimOptions::new().limit(limit))
                    .await
                    .unwrap()
                    .messages
                    .into_iter()
                    .map(|m| m.id)
                    .collect();
                (claimed, expected)
            });
            prop_assert_eq!(claimed, expected);
        }
    }
}
