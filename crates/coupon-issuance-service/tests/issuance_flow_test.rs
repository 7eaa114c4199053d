//! 发放全链路测试（内存存储）
//!
//! 闸门 -> 进程内发布端 -> worker 池 -> 处理器 -> 内存事务存储，
//! 与生产路径共用同一套解码、重试和处理逻辑，在并发下校验数量上限与唯一性。
//!
//! 内存存储用一把全局锁串行化所有事务，这里的并发只覆盖应用层的检查顺序，
//! 不能发现缺失的策略行锁。行锁与部分唯一索引的行为由
//! `pg_issuance_test`（需要 PostgreSQL，默认 ignore）覆盖。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::Notify;

use coupon_issuance::counter::CounterKey;
use coupon_issuance::models::UserKey;
use coupon_issuance::queue::{
    DeadLetterSink, Delivery, DeliveryHandler, IssueEvent, IssueWorker, LocalIssuePublisher,
    WorkerPool,
};
use coupon_issuance::service::{AdmissionGate, CancellationService, IssuanceProcessor};
use coupon_issuance::testing::{MemoryCounterStore, MemoryIssuanceStore, PolicySeed};
use coupon_issuance::{IssuanceError, IssuanceOutcome, Rejection};
use coupon_shared::dlq::DeadLetterMessage;
use coupon_shared::retry::RetryPolicy;

// ==================== 辅助 ====================

#[derive(Default)]
struct CollectingSink {
    messages: Mutex<Vec<DeadLetterMessage>>,
}

#[async_trait]
impl DeadLetterSink for CollectingSink {
    async fn send(&self, _key: &str, message: &DeadLetterMessage) -> coupon_issuance::Result<()> {
        self.messages.lock().push(message.clone());
        Ok(())
    }
}

/// 组装好的一条完整链路
struct Pipeline {
    store: Arc<MemoryIssuanceStore>,
    counters: Arc<MemoryCounterStore>,
    gate: Arc<AdmissionGate>,
    processor: Arc<IssuanceProcessor<MemoryIssuanceStore>>,
    cancellation: Arc<CancellationService<MemoryIssuanceStore>>,
    pool: WorkerPool,
    dead_letters: Arc<CollectingSink>,
}

impl Pipeline {
    fn new(workers: usize) -> Self {
        let store = Arc::new(MemoryIssuanceStore::new());
        let counters = Arc::new(MemoryCounterStore::new());
        let dead_letters = Arc::new(CollectingSink::default());

        let processor = Arc::new(IssuanceProcessor::new(store.clone(), counters.clone()));
        let worker = IssueWorker::new(
            processor.clone(),
            RetryPolicy {
                max_retries: 1,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
                multiplier: 1.0,
            },
            dead_letters.clone(),
            "coupon-issuance-test",
        );
        let pool = WorkerPool::spawn(workers, 16, Arc::new(worker));

        let gate = Arc::new(AdmissionGate::new(
            counters.clone(),
            store.clone(),
            Arc::new(LocalIssuePublisher::new(pool.dispatcher())),
        ));
        let cancellation = Arc::new(CancellationService::new(store.clone(), counters.clone()));

        Self {
            store,
            counters,
            gate,
            processor,
            cancellation,
            pool,
            dead_letters,
        }
    }

    fn seed_users(&self, prefix: &str, n: usize) -> Vec<UserKey> {
        (0..n)
            .map(|i| {
                let key = format!("{}-{}", prefix, i);
                self.store.seed_user(&key);
                UserKey::new(key)
            })
            .collect()
    }

    /// 所有用户同时请求闸门，返回被放行的数量
    async fn admit_all(&self, coupon_id: i64, users: &[UserKey]) -> usize {
        let tasks = users.iter().cloned().map(|user| {
            let gate = self.gate.clone();
            tokio::spawn(async move { gate.try_admit(coupon_id, &user).await })
        });

        join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.expect("任务 panic"))
            .filter(|o| matches!(o, IssuanceOutcome::Admitted))
            .count()
    }
}

// ==================== 测试 ====================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_never_exceed_total_quantity() {
    let p = Pipeline::new(4);
    let coupon_id = p.store.seed_coupon(PolicySeed::open(10));
    let users = p.seed_users("user", 60);

    let admitted = p.admit_all(coupon_id, &users).await;
    let Pipeline {
        store,
        counters,
        pool,
        dead_letters,
        ..
    } = p;
    pool.shutdown().await;

    assert_eq!(admitted, 10);
    assert_eq!(store.issued_quantity(coupon_id), 10);
    assert_eq!(store.active_issue_count(coupon_id), 10);
    assert_eq!(counters.value(&CounterKey::stock(coupon_id)), Some(0));
    assert_eq!(counters.value(&CounterKey::count(coupon_id)), Some(10));
    assert!(dead_letters.messages.lock().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_processor_alone_enforces_ceiling_and_uniqueness() {
    // 绕过闸门：即便所有意图都进入队列，提交数量也不超过上限
    let p = Pipeline::new(2);
    let coupon_id = p.store.seed_coupon(PolicySeed::open(5));
    let mut users = p.seed_users("direct", 20);
    // 同一用户重复出现
    users.extend(users.clone());

    let tasks = users.into_iter().map(|user| {
        let processor = p.processor.clone();
        tokio::spawn(async move { processor.process(coupon_id, &user).await })
    });
    let outcomes: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.expect("任务 panic"))
        .collect();

    let committed = outcomes
        .iter()
        .filter(|o| matches!(o, IssuanceOutcome::Committed { .. }))
        .count();
    assert_eq!(committed, 5);
    assert!(outcomes.iter().all(|o| !matches!(o, IssuanceOutcome::Failed(_))));
    assert_eq!(p.store.issued_quantity(coupon_id), 5);

    let issues = p.store.issues_for(coupon_id);
    let mut holders: Vec<_> = issues.iter().map(|i| i.user_id).collect();
    holders.sort_unstable();
    holders.dedup();
    assert_eq!(holders.len(), issues.len());

    p.pool.shutdown().await;
}

#[tokio::test]
async fn test_redelivered_intent_issues_once() {
    let p = Pipeline::new(2);
    let coupon_id = p.store.seed_coupon(PolicySeed::open(3));
    p.store.seed_user("alice");

    let event = IssueEvent::new(coupon_id, UserKey::new("alice"));
    let payload = serde_json::to_vec(&event).unwrap();
    let dispatcher = p.pool.dispatcher();
    for _ in 0..3 {
        dispatcher
            .dispatch(Delivery::local(
                coupon_id as u64,
                event.partition_key(),
                payload.clone(),
            ))
            .await
            .unwrap();
    }
    p.pool.shutdown().await;

    assert_eq!(p.store.issued_quantity(coupon_id), 1);
    assert_eq!(p.store.issues_for(coupon_id).len(), 1);
    assert!(p.dead_letters.messages.lock().is_empty());
}

#[tokio::test]
async fn test_single_unit_contention_then_cancel_then_reissue() {
    let p = Pipeline::new(2);
    let coupon_id = p.store.seed_coupon(PolicySeed::open(1));
    let users = p.seed_users("racer", 2);

    let (a, b) = tokio::join!(
        p.processor.process(coupon_id, &users[0]),
        p.processor.process(coupon_id, &users[1]),
    );

    let (winner, loser) = match (&a, &b) {
        (IssuanceOutcome::Committed { .. }, IssuanceOutcome::Rejected(Rejection::SoldOut)) => {
            (&users[0], &users[1])
        }
        (IssuanceOutcome::Rejected(Rejection::SoldOut), IssuanceOutcome::Committed { .. }) => {
            (&users[1], &users[0])
        }
        other => panic!("unexpected outcomes: {:?}", other),
    };
    assert_eq!(p.store.issued_quantity(coupon_id), 1);

    let receipt = p.cancellation.cancel(coupon_id, winner).await.unwrap();
    assert_eq!(receipt.issued_quantity, 0);
    assert_eq!(p.store.issued_quantity(coupon_id), 0);

    assert!(matches!(
        p.processor.process(coupon_id, loser).await,
        IssuanceOutcome::Committed { .. }
    ));
    assert_eq!(p.store.issued_quantity(coupon_id), 1);
    assert_eq!(p.store.active_issue_count(coupon_id), 1);

    p.pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_unit_two_concurrent_requests_at_gate() {
    let p = Pipeline::new(2);
    let coupon_id = p.store.seed_coupon(PolicySeed::open(1));
    let users = p.seed_users("pair", 2);

    let (a, b) = tokio::join!(
        p.gate.try_admit(coupon_id, &users[0]),
        p.gate.try_admit(coupon_id, &users[1]),
    );
    let admitted = [&a, &b]
        .iter()
        .filter(|o| matches!(o, IssuanceOutcome::Admitted))
        .count();
    let sold_out = [&a, &b]
        .iter()
        .filter(|o| matches!(o, IssuanceOutcome::Rejected(Rejection::SoldOut)))
        .count();
    assert_eq!((admitted, sold_out), (1, 1));

    let Pipeline { store, pool, .. } = p;
    pool.shutdown().await;
    assert_eq!(store.issued_quantity(coupon_id), 1);
    assert_eq!(store.active_issue_count(coupon_id), 1);
}

#[tokio::test]
async fn test_cancel_returns_unit_to_gate() {
    let p = Pipeline::new(1);
    let coupon_id = p.store.seed_coupon(PolicySeed::open(1));
    let users = p.seed_users("gate", 2);

    assert!(matches!(
        p.gate.try_admit(coupon_id, &users[0]).await,
        IssuanceOutcome::Admitted
    ));
    assert!(matches!(
        p.gate.try_admit(coupon_id, &users[1]).await,
        IssuanceOutcome::Rejected(Rejection::SoldOut)
    ));

    // 等待第一条意图落库
    for _ in 0..100 {
        if p.store.issued_quantity(coupon_id) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(p.store.issued_quantity(coupon_id), 1);

    p.cancellation.cancel(coupon_id, &users[0]).await.unwrap();
    assert_eq!(p.counters.value(&CounterKey::stock(coupon_id)), Some(1));

    assert!(matches!(
        p.gate.try_admit(coupon_id, &users[1]).await,
        IssuanceOutcome::Admitted
    ));
    p.pool.shutdown().await;

    assert_eq!(p.store.issued_quantity(coupon_id), 1);
    let active: Vec<_> = p
        .store
        .issues_for(coupon_id)
        .into_iter()
        .filter(|i| !i.canceled)
        .collect();
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn test_used_issue_cannot_be_canceled() {
    let p = Pipeline::new(1);
    let coupon_id = p.store.seed_coupon(PolicySeed::open(2));
    let users = p.seed_users("spender", 1);
    p.counters.set(&CounterKey::stock(coupon_id), 1);

    p.processor.process(coupon_id, &users[0]).await;
    let issue = p.store.issues_for(coupon_id).remove(0);
    p.store.mark_used(issue.id);

    let result = p.cancellation.cancel(coupon_id, &users[0]).await;
    assert!(matches!(result, Err(IssuanceError::CannotCancelUsed(_))));
    assert_eq!(p.store.issued_quantity(coupon_id), 1);
    assert_eq!(p.counters.value(&CounterKey::stock(coupon_id)), Some(1));

    p.pool.shutdown().await;
}

#[tokio::test]
async fn test_closed_window_intent_is_dropped() {
    let p = Pipeline::new(1);
    let now = Utc::now();
    let coupon_id = p.store.seed_coupon(PolicySeed {
        total_quantity: 5,
        start_at: now + chrono::Duration::hours(1),
        end_at: now + chrono::Duration::hours(2),
        active: true,
    });
    p.seed_users("early", 1);

    // 闸门不看窗口，意图照常入队，由处理器丢弃
    assert!(matches!(
        p.gate.try_admit(coupon_id, &UserKey::new("early-0")).await,
        IssuanceOutcome::Admitted
    ));
    let Pipeline {
        store,
        counters,
        pool,
        dead_letters,
        ..
    } = p;
    pool.shutdown().await;

    assert_eq!(store.issued_quantity(coupon_id), 0);
    assert!(store.issues_for(coupon_id).is_empty());
    assert_eq!(counters.value(&CounterKey::count(coupon_id)), None);
    // 闸门自身扣减的库存不回补
    assert_eq!(counters.value(&CounterKey::stock(coupon_id)), Some(4));
    assert!(dead_letters.messages.lock().is_empty());
}

#[tokio::test]
async fn test_unknown_user_ends_in_dead_letter() {
    let p = Pipeline::new(1);
    let coupon_id = p.store.seed_coupon(PolicySeed::open(5));

    assert!(matches!(
        p.gate.try_admit(coupon_id, &UserKey::new("nobody")).await,
        IssuanceOutcome::Admitted
    ));
    let Pipeline {
        store,
        pool,
        dead_letters,
        ..
    } = p;
    pool.shutdown().await;

    let messages = dead_letters.messages.lock();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].attempts, 2);
    assert_eq!(store.issued_quantity(coupon_id), 0);
}

/// 取到第一条投递后停住，直到测试放行
#[derive(Default)]
struct StalledHandler {
    started: Notify,
    release: Notify,
}

#[async_trait]
impl DeliveryHandler for StalledHandler {
    async fn handle(&self, _delivery: Delivery) {
        self.started.notify_one();
        self.release.notified().await;
    }
}

#[tokio::test]
async fn test_full_local_queue_fails_fast_and_returns_stock() {
    let store = Arc::new(MemoryIssuanceStore::new());
    let counters = Arc::new(MemoryCounterStore::new());
    let coupon_id = store.seed_coupon(PolicySeed::open(5));

    let handler = Arc::new(StalledHandler::default());
    let pool = WorkerPool::spawn(1, 1, handler.clone());
    let gate = AdmissionGate::new(
        counters.clone(),
        store.clone(),
        Arc::new(LocalIssuePublisher::new(pool.dispatcher())),
    );

    // 第一条被 worker 取走后停住，第二条占满容量为 1 的队列
    assert!(matches!(
        gate.try_admit(coupon_id, &UserKey::new("q-0")).await,
        IssuanceOutcome::Admitted
    ));
    handler.started.notified().await;
    assert!(matches!(
        gate.try_admit(coupon_id, &UserKey::new("q-1")).await,
        IssuanceOutcome::Admitted
    ));

    // 队列已满时立即失败，不等待 worker
    let third = tokio::time::timeout(
        Duration::from_secs(1),
        gate.try_admit(coupon_id, &UserKey::new("q-2")),
    )
    .await
    .expect("闸门在队列已满时阻塞");
    assert!(matches!(
        third,
        IssuanceOutcome::Failed(IssuanceError::QueueFull)
    ));
    assert_eq!(counters.value(&CounterKey::stock(coupon_id)), Some(3));

    handler.release.notify_one();
    handler.release.notify_one();
    pool.shutdown().await;
}
