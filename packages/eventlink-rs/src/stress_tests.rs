//! Stress tests designed to break the eventlink library.
//!
//! These tests exercise races between emitters, ordering under load, and the
//! end-to-end behaviour of namespaces, subscribers and processing services.

#[cfg(test)]
mod stress_tests {
    use crate::callable::Callable;
    use crate::core::{Event, EventArgs, EventKey};
    use crate::emitter::EventEmitter;
    use crate::error::EventLinkError;
    use crate::linker::EventLinker;
    use crate::processing::{
        ProcessingService, Task, TokioProcessingService, WorkerPoolProcessingService,
    };
    use crate::subscriber::SubscribeOptions;
    use crate::testing::{CallLog, EventLatch, ManualService};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;
    use std::time::Duration;

    // ==========================================================================
    // Test Types
    // ==========================================================================

    #[derive(Debug, thiserror::Error)]
    #[error("invalid value: {0}")]
    struct ValueError(String);

    #[derive(Debug, Clone)]
    struct OrderPlaced {
        order_id: usize,
    }
    impl Event for OrderPlaced {}

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }

    fn counting(counter: &Arc<AtomicUsize>) -> SubscribeOptions {
        let counter = counter.clone();
        SubscribeOptions::new(Callable::sync(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }))
    }

    // ==========================================================================
    // At-most-once Delivery
    // ==========================================================================

    #[test]
    fn test_once_subscriber_fires_once_under_concurrent_emits() {
        const EMITTERS: usize = 16;
        init_tracing();

        for _ in 0..20 {
            let linker = EventLinker::new();
            let pool = Arc::new(WorkerPoolProcessingService::new(4).unwrap());
            let emitter = EventEmitter::new(linker.clone(), pool.clone());
            let calls = Arc::new(AtomicUsize::new(0));
            linker
                .subscribe(&["Race".into()], counting(&calls).once(true))
                .unwrap();

            let barrier = Arc::new(Barrier::new(EMITTERS));
            let handles: Vec<_> = (0..EMITTERS)
                .map(|_| {
                    let emitter = emitter.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        emitter.emit("Race", EventArgs::new()).unwrap();
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            pool.shutdown();

            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(linker.subscriber_count(), 0);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_once_subscribers_each_fire_exactly_once() {
        let linker = EventLinker::new();
        let service = TokioProcessingService::new();
        let emitter = EventEmitter::new(linker.clone(), Arc::new(service.clone()));
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            linker
                .subscribe(&["Burst".into()], counting(&calls).once(true))
                .unwrap();
        }

        let mut joins = Vec::new();
        for _ in 0..8 {
            let emitter = emitter.clone();
            joins.push(tokio::spawn(async move {
                for _ in 0..10 {
                    emitter.emit("Burst", EventArgs::new()).unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for join in joins {
            join.await.unwrap();
        }
        service.wait_for_tasks().await;

        assert_eq!(calls.load(Ordering::SeqCst), 100);
        assert_eq!(linker.subscriber_count(), 0);
    }

    // ==========================================================================
    // Ordering
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_submission_order_holds_with_random_delays() {
        let service = TokioProcessingService::builder()
            .enforce_submission_order(true)
            .build();
        let completed = Arc::new(Mutex::new(Vec::new()));

        for index in 0..100_usize {
            let completed = completed.clone();
            let delay = Duration::from_micros(fastrand::u64(0..2_000));
            let task = if index % 3 == 0 {
                Task::blocking(move || {
                    thread::sleep(delay);
                    completed.lock().unwrap().push(index);
                    Ok(())
                })
            } else {
                Task::future(async move {
                    tokio::time::sleep(delay).await;
                    completed.lock().unwrap().push(index);
                    Ok(())
                })
            };
            service.submit(task).unwrap();
        }

        service.wait_for_tasks().await;
        let completed = completed.lock().unwrap();
        assert_eq!(*completed, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ordered_emissions_from_one_producer() {
        let linker = EventLinker::new();
        let service = TokioProcessingService::builder()
            .enforce_submission_order(true)
            .force_async(true)
            .build();
        let emitter = EventEmitter::new(linker.clone(), Arc::new(service.clone()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();

        linker
            .subscribe(
                &[EventKey::of::<OrderPlaced>()],
                SubscribeOptions::new(Callable::future(move |args: EventArgs| {
                    let record = record.clone();
                    async move {
                        tokio::time::sleep(Duration::from_micros(fastrand::u64(0..500))).await;
                        if let Some(order) = args.get::<OrderPlaced>(0) {
                            record.lock().unwrap().push(order.order_id);
                        }
                        Ok(None)
                    }
                })),
            )
            .unwrap();

        for order_id in 0..50 {
            emitter
                .emit_event(OrderPlaced { order_id }, EventArgs::new())
                .unwrap();
        }
        service.wait_for_tasks().await;

        assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    // ==========================================================================
    // Scenarios
    // ==========================================================================

    #[tokio::test]
    async fn test_capacity_scenario() {
        let linker = EventLinker::builder()
            .namespace("N")
            .max_subscribers(2)
            .build()
            .unwrap();
        let service = ManualService::new();
        let emitter = EventEmitter::new(linker.clone(), Arc::new(service.clone()));
        let log = CallLog::new();

        linker.subscribe(&["Ping".into()], log.subscriber("a")).unwrap();
        linker.subscribe(&["Ping".into()], log.subscriber("b")).unwrap();

        emitter.emit("Ping", EventArgs::new()).unwrap();
        service.run_all().await;

        assert_eq!(log.count("a"), 1);
        assert_eq!(log.count("b"), 1);
        assert!(log.calls().iter().all(|c| c.arity == 0 && c.kwargs.is_empty()));

        let third = linker.subscribe(&["Ping".into()], log.subscriber("c"));
        assert!(matches!(
            third,
            Err(EventLinkError::CapacityExceeded { limit: 2, .. })
        ));
        assert_eq!(linker.subscriber_count_from_event(&"Ping".into()).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_once_error_subscriber_scenario() {
        let linker = EventLinker::new();
        let service = ManualService::new();
        let emitter = EventEmitter::new(linker.clone(), Arc::new(service.clone()));
        let log = CallLog::new();

        linker
            .subscribe(
                &[EventKey::error::<ValueError>()],
                log.subscriber("on_error").once(true),
            )
            .unwrap();

        emitter
            .emit_error(ValueError("first".into()), EventArgs::new())
            .unwrap();
        emitter
            .emit_error(ValueError("second".into()), EventArgs::new())
            .unwrap();

        // the second emission found nobody and submitted nothing
        assert_eq!(service.pending(), 1);
        service.run_all().await;
        assert_eq!(log.count("on_error"), 1);
        assert_eq!(log.calls()[0].arity, 1);
    }

    #[tokio::test]
    async fn test_callback_chaining_scenario() {
        let linker = EventLinker::new();
        let service = ManualService::new();
        let emitter = EventEmitter::new(linker.clone(), Arc::new(service.clone()));
        let successes = Arc::new(Mutex::new(Vec::new()));
        let failures = Arc::new(Mutex::new(Vec::new()));

        let (ok_values, ok_errors) = (successes.clone(), failures.clone());
        linker
            .subscribe(
                &["Good".into()],
                SubscribeOptions::new(Callable::sync(|_| Ok(Some(crate::core::payload(42_i32)))))
                    .on_success(Callable::sync(move |value: Option<crate::core::Payload>| {
                        let v = value.and_then(|v| v.downcast_ref::<i32>().copied());
                        ok_values.lock().unwrap().push(v);
                        Ok(())
                    }))
                    .on_failure(Callable::sync(move |e: anyhow::Error| {
                        ok_errors.lock().unwrap().push(e.to_string());
                        Ok(())
                    })),
            )
            .unwrap();

        let (bad_values, bad_errors) = (successes.clone(), failures.clone());
        linker
            .subscribe(
                &["Bad".into()],
                SubscribeOptions::new(Callable::sync(|_| {
                    Err(anyhow::Error::new(ValueError("nope".into())))
                }))
                .on_success(Callable::sync(move |_| {
                    bad_values.lock().unwrap().push(None);
                    Ok(())
                }))
                .on_failure(Callable::sync(move |e: anyhow::Error| {
                    assert!(e.downcast_ref::<ValueError>().is_some());
                    bad_errors.lock().unwrap().push(e.to_string());
                    Ok(())
                })),
            )
            .unwrap();

        emitter.emit("Good", EventArgs::new()).unwrap();
        emitter.emit("Bad", EventArgs::new()).unwrap();
        let results = service.run_all().await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(*successes.lock().unwrap(), vec![Some(42)]);
        assert_eq!(*failures.lock().unwrap(), vec!["invalid value: nope".to_string()]);
    }

    #[tokio::test]
    async fn test_failing_failure_callback_reaches_the_service() {
        init_tracing();
        let linker = EventLinker::builder()
            .default_failure_callback(Callable::sync(|e: anyhow::Error| {
                Err(e.context("failure handler broke"))
            }))
            .build()
            .unwrap();
        let service = ManualService::new();
        let emitter = EventEmitter::new(linker.clone(), Arc::new(service.clone()));

        linker
            .subscribe(
                &["Boom".into()],
                SubscribeOptions::new(Callable::sync(|_| Err(anyhow::anyhow!("boom")))),
            )
            .unwrap();

        emitter.emit("Boom", EventArgs::new()).unwrap();
        let results = service.run_all().await;

        assert_eq!(results.len(), 1);
        let err = results.into_iter().next().unwrap().unwrap_err();
        assert!(err.to_string().contains("failure handler broke"));
    }

    // ==========================================================================
    // Registry Consistency Under Contention
    // ==========================================================================

    #[test]
    fn test_registry_stays_consistent_under_contention() {
        init_tracing();
        let linker = EventLinker::new();
        let events: Vec<EventKey> = (0..6).map(|i| EventKey::name(format!("e{i}"))).collect();
        let events = Arc::new(events);

        let handles: Vec<_> = (0..8)
            .map(|seed| {
                let linker = linker.clone();
                let events = events.clone();
                thread::spawn(move || {
                    let mut rng = fastrand::Rng::with_seed(seed);
                    let mut mine = Vec::new();
                    for _ in 0..300 {
                        match rng.u8(0..4) {
                            0 | 1 => {
                                let a = events[rng.usize(0..events.len())].clone();
                                let b = events[rng.usize(0..events.len())].clone();
                                let options = SubscribeOptions::new(Callable::sync(|_| Ok(None)));
                                mine.push(linker.subscribe(&[a, b], options).unwrap());
                            }
                            2 if !mine.is_empty() => {
                                let sub = mine.swap_remove(rng.usize(0..mine.len()));
                                linker.remove_subscriber(&sub);
                            }
                            _ => {
                                let e = &events[rng.usize(0..events.len())];
                                linker
                                    .subscribers_from_events(std::slice::from_ref(e), true)
                                    .unwrap();
                            }
                        }
                    }
                    mine
                })
            })
            .collect();

        let survivors: Vec<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        // Every registered subscriber is linked to at least one event, and
        // every event listed has at least one subscriber.
        for subscriber in linker.subscribers() {
            assert!(linker.event_count_from_subscriber(&subscriber) > 0);
        }
        for event in linker.events() {
            assert!(linker.subscriber_count_from_event(&EventKey::name(event)).unwrap() > 0);
        }
        assert!(linker.subscriber_count() <= survivors.len());

        for subscriber in &survivors {
            linker.remove_subscriber(subscriber);
        }
        assert_eq!(linker.subscriber_count(), 0);
        assert_eq!(linker.event_count(), 0);
    }

    // ==========================================================================
    // Fan-out
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fan_out_reaches_every_subscriber() {
        let linker = EventLinker::new();
        let service = TokioProcessingService::builder().force_async(true).build();
        let emitter = EventEmitter::new(linker.clone(), Arc::new(service.clone()));
        let latch = EventLatch::new(50);

        for _ in 0..50 {
            linker
                .subscribe(
                    &["Fan".into()],
                    SubscribeOptions::new(Callable::sync(|_| {
                        thread::sleep(Duration::from_millis(1));
                        Ok(None)
                    }))
                    .on_success(latch.success_callback())
                    .force_async(true),
                )
                .unwrap();
        }

        emitter.emit("Fan", EventArgs::new()).unwrap();
        tokio::time::timeout(Duration::from_secs(10), latch.await_zero())
            .await
            .expect("every subscriber should run");
        service.wait_for_tasks().await;
    }
}
