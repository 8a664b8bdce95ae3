//! End-to-end broker behavior over the in-memory transport.

use async_trait::async_trait;
use broker::{
    handler_fn, Abandoned, BackoffConfig, Broker, BrokerConfig, BrokerError, HandlerError,
    LifecycleError, LifecycleState, MemoryTransport, Message, Middleware, Next, Ordering,
};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

fn config() -> BrokerConfig {
    BrokerConfig::new("bee")
        .with_receive_timeout(Duration::from_millis(50))
        .with_reconnect(
            BackoffConfig::new()
                .with_initial_delay(10)
                .with_max_delay(50),
        )
}

/// Poll `check` until it holds or `timeout` passes.
async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn counting_handler(counter: Arc<AtomicUsize>) -> impl broker::Handler {
    handler_fn(move |_msg: Message| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }
    })
}

#[tokio::test]
async fn test_print_messages_handled_once_in_order() {
    let broker = Broker::new(MemoryTransport::new(), config());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = seen.clone();
    broker
        .register(
            "print",
            handler_fn(move |msg: Message| {
                let sink = sink.clone();
                async move {
                    let text: String = msg.decode()?;
                    sink.lock().unwrap().push(text);
                    Ok::<_, HandlerError>(())
                }
            }),
        )
        .unwrap();

    broker.worker().await.unwrap();
    for payload in ["a", "b", "c"] {
        broker.send("print", payload).await.unwrap();
    }

    assert!(eventually(Duration::from_secs(2), || seen.lock().unwrap().len() == 3).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_counter_batches_accumulate() {
    let broker = Broker::new(MemoryTransport::new(), config().with_concurrency(4));
    let counter = Arc::new(AtomicUsize::new(0));
    broker.register("counter", counting_handler(counter.clone())).unwrap();
    broker.worker().await.unwrap();

    let mut expected = 0;
    for batch in [1usize, 10, 100] {
        let sends: Vec<_> = (0..batch)
            .map(|i| {
                let broker = broker.clone();
                tokio::spawn(async move { broker.send("counter", &i).await })
            })
            .collect();
        for send in sends {
            send.await.unwrap().unwrap();
        }

        expected += batch;
        assert!(
            eventually(Duration::from_secs(5), || {
                counter.load(AtomicOrdering::SeqCst) == expected
            })
            .await,
            "expected {expected} handled"
        );
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counter.load(AtomicOrdering::SeqCst), 111);
    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_always_failing_handler_runs_max_reconsume_times() {
    let (abandoned_tx, mut abandoned_rx) = mpsc::unbounded_channel::<Abandoned>();
    let broker = Broker::new(MemoryTransport::new(), config().with_max_reconsume(3))
        .with_abandon_handler(abandoned_tx);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    broker
        .register(
            "error",
            handler_fn(move |_msg: Message| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, AtomicOrdering::SeqCst);
                    Err(HandlerError::transient("err"))
                }
            }),
        )
        .unwrap();

    broker.worker().await.unwrap();
    broker.send("error", "err").await.unwrap();

    let abandoned = tokio::time::timeout(Duration::from_secs(2), abandoned_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(abandoned.attempts, 3);
    assert_eq!(abandoned.message.name, "error");
    assert_eq!(abandoned.error, HandlerError::transient("err"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(AtomicOrdering::SeqCst), 3);
    assert_eq!(broker.retry_policy().tracked(), 0);
    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_unknown_name_abandoned_without_retry() {
    let (abandoned_tx, mut abandoned_rx) = mpsc::unbounded_channel::<Abandoned>();
    let broker = Broker::new(MemoryTransport::new(), config().with_max_reconsume(5))
        .with_abandon_handler(abandoned_tx);
    broker.worker().await.unwrap();

    broker.send("missing", "x").await.unwrap();

    let abandoned = tokio::time::timeout(Duration::from_secs(2), abandoned_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(abandoned.attempts, 1);
    assert_eq!(abandoned.error, HandlerError::NotFound("missing".into()));
    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_panicking_handler_is_retried_and_loop_survives() {
    let broker = Broker::new(MemoryTransport::new(), config().with_max_reconsume(3));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    broker
        .register(
            "flaky",
            handler_fn(move |_msg: Message| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, AtomicOrdering::SeqCst) == 0 {
                        panic!("first attempt blows up");
                    }
                    Ok(())
                }
            }),
        )
        .unwrap();

    broker.worker().await.unwrap();
    broker.send("flaky", "x").await.unwrap();
    assert!(eventually(Duration::from_secs(2), || calls.load(AtomicOrdering::SeqCst) == 2).await);

    // The same loop keeps consuming.
    broker.send("flaky", "y").await.unwrap();
    assert!(eventually(Duration::from_secs(2), || calls.load(AtomicOrdering::SeqCst) == 3).await);
    assert_eq!(broker.active_workers(), 1);
    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_send_delay_is_never_early() {
    let broker = Broker::new(MemoryTransport::new(), config().with_concurrency(2));
    let handled_at: Arc<Mutex<Option<DateTime<Utc>>>> = Arc::new(Mutex::new(None));

    let slot = handled_at.clone();
    broker
        .register(
            "delay",
            handler_fn(move |_msg: Message| {
                let slot = slot.clone();
                async move {
                    *slot.lock().unwrap() = Some(Utc::now());
                    Ok(())
                }
            }),
        )
        .unwrap();

    broker.worker().await.unwrap();

    let delay = Duration::from_millis(500);
    let want = Utc::now() + chrono::Duration::from_std(delay).unwrap();
    broker.send_delay("delay", &want, delay).await.unwrap();

    assert!(eventually(Duration::from_secs(3), || handled_at.lock().unwrap().is_some()).await);
    let got = handled_at.lock().unwrap().unwrap();

    assert!(got >= want, "handled {got} before {want}");
    assert!(got - want < chrono::Duration::seconds(1), "handled {got}, wanted {want}");
    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_lifecycle_errors() {
    let broker = Broker::new(MemoryTransport::new(), config());
    assert_eq!(broker.state(), LifecycleState::Created);

    broker.worker().await.unwrap();
    assert_eq!(broker.state(), LifecycleState::Running);
    assert!(matches!(
        broker.worker().await,
        Err(BrokerError::Lifecycle(LifecycleError::AlreadyRunning))
    ));

    broker.close().await.unwrap();
    broker.close().await.unwrap();
    assert_eq!(broker.state(), LifecycleState::Closed);

    let err = broker.send("print", "late").await.unwrap_err();
    assert!(matches!(err, BrokerError::Lifecycle(LifecycleError::Closed)));
    assert!(!err.is_transient());

    let err = broker
        .send_delay("print", "late", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(err.is_lifecycle());
}

#[tokio::test]
async fn test_duplicate_registration_rejected() {
    let broker = Broker::new(MemoryTransport::new(), config());
    let counter = Arc::new(AtomicUsize::new(0));

    broker.register("counter", counting_handler(counter.clone())).unwrap();
    let err = broker
        .register("counter", counting_handler(counter))
        .unwrap_err();

    assert!(matches!(err, BrokerError::DuplicateHandler(name) if name == "counter"));
}

/// Records the order in which layers see a message.
struct Tag {
    label: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Middleware for Tag {
    async fn handle(&self, message: &Message, next: Next<'_>) -> Result<(), HandlerError> {
        self.log.lock().unwrap().push(self.label.to_string());
        next.run(message).await
    }
}

#[tokio::test]
async fn test_middleware_order_and_freeze() {
    let broker = Broker::new(MemoryTransport::new(), config());
    let log = Arc::new(Mutex::new(Vec::new()));

    broker.middleware(Tag { label: "first", log: log.clone() }).unwrap();
    broker.middleware(Tag { label: "second", log: log.clone() }).unwrap();

    let sink = log.clone();
    broker
        .register(
            "print",
            handler_fn(move |_msg: Message| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push("handler".to_string());
                    Ok(())
                }
            }),
        )
        .unwrap();

    broker.worker().await.unwrap();
    assert!(matches!(
        broker.middleware(Tag { label: "late", log: log.clone() }),
        Err(BrokerError::Lifecycle(LifecycleError::MiddlewareFrozen))
    ));

    broker.send("print", "a").await.unwrap();
    assert!(eventually(Duration::from_secs(2), || log.lock().unwrap().len() == 3).await);
    assert_eq!(*log.lock().unwrap(), vec!["first", "second", "handler"]);
    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_close_waits_for_in_flight_message() {
    let broker = Broker::new(MemoryTransport::new(), config().with_concurrency(3));
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));

    let (s, f) = (started.clone(), finished.clone());
    broker
        .register(
            "sleep",
            handler_fn(move |_msg: Message| {
                let (s, f) = (s.clone(), f.clone());
                async move {
                    s.store(true, AtomicOrdering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    f.store(true, AtomicOrdering::SeqCst);
                    Ok(())
                }
            }),
        )
        .unwrap();

    broker.worker().await.unwrap();
    assert_eq!(broker.active_workers(), 3);

    broker.send("sleep", "zz").await.unwrap();
    assert!(eventually(Duration::from_secs(2), || started.load(AtomicOrdering::SeqCst)).await);

    broker.close().await.unwrap();
    assert!(finished.load(AtomicOrdering::SeqCst));
    assert_eq!(broker.active_workers(), 0);
}

#[tokio::test]
async fn test_strict_ordering_runs_single_loop() {
    let broker = Broker::new(
        MemoryTransport::new(),
        config().with_concurrency(8).with_ordering(Ordering::Strict),
    );
    broker.worker().await.unwrap();
    assert_eq!(broker.active_workers(), 1);
    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_after_transport_outage() {
    let transport = MemoryTransport::new();
    let broker = Broker::new(transport.clone(), config());
    let counter = Arc::new(AtomicUsize::new(0));
    broker.register("counter", counting_handler(counter.clone())).unwrap();
    broker.worker().await.unwrap();
    assert!(broker.is_connected());

    transport.set_reachable(false);
    transport.disconnect();

    assert!(eventually(Duration::from_secs(2), || !broker.is_connected()).await);
    let err = broker.send("counter", &1).await.unwrap_err();
    assert!(err.is_transient(), "unexpected error: {err}");
    assert!(matches!(err, BrokerError::Disconnected));

    transport.set_reachable(true);
    assert!(eventually(Duration::from_secs(3), || broker.is_connected()).await);

    broker.send("counter", &2).await.unwrap();
    assert!(eventually(Duration::from_secs(2), || counter.load(AtomicOrdering::SeqCst) == 1).await);
    broker.close().await.unwrap();
}
