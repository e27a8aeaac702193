#[cfg(test)]
mod tests {
    use promise_chain::{
        all, all_settled, any, delay, promisify, race, CancelToken, Error, Producer, Promise,
        State,
    };
    use std::sync::{Arc, Barrier, Mutex, Once};
    use std::thread;
    use std::time::{Duration, Instant};

    fn init_tracing() {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }

    #[test]
    fn test_basic_resolve() {
        init_tracing();
        let promise = Promise::new(|producer| {
            producer.resolve(42);
        });
        assert_eq!(promise.wait().unwrap(), 42);
    }

    #[test]
    fn test_basic_reject() {
        init_tracing();
        let promise = Promise::<i32>::new(|producer| {
            producer.reject(Error::msg("fail"));
        });
        assert_eq!(promise.wait().unwrap_err().to_string(), "fail");
    }

    #[test]
    fn test_settlement_is_final() {
        init_tracing();
        let (producer, promise) = Producer::new();
        producer.resolve("v");
        for _ in 0..3 {
            producer.resolve("w");
            producer.reject(Error::msg("late"));
        }
        assert_eq!(promise.state(), State::Fulfilled);
        assert_eq!(promise.wait().unwrap(), "v");
    }

    #[test]
    fn test_concurrent_settlers_single_winner() {
        init_tracing();
        let (producer, promise) = Producer::<usize>::new();
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let producer = producer.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    producer.resolve(i)
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        let value = promise.wait().unwrap();
        assert!(value < 8);
        assert_eq!(promise.wait().unwrap(), value);
    }

    #[test]
    fn test_execution_order_fifo() {
        init_tracing();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (release, blocker) = Producer::<()>::new();
        let promise = Promise::new(move |producer| {
            let _ = blocker.wait();
            producer.resolve("done".to_string());
        });

        let chained: Vec<Promise<String>> = ["A", "B", "C"]
            .into_iter()
            .map(|name| {
                let order = Arc::clone(&order);
                promise.then(move |v| {
                    order.lock().unwrap().push(name);
                    Ok(v)
                })
            })
            .collect();

        release.resolve(());
        all(chained).wait().unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_late_registration_runs_in_registering_thread() {
        init_tracing();
        let promise = Promise::resolved(1);
        let caller = thread::current().id();
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        promise.tap(move |_| *slot.lock().unwrap() = Some(thread::current().id()));
        assert_eq!(*seen.lock().unwrap(), Some(caller));
    }

    #[test]
    fn test_all_in_input_order() {
        init_tracing();
        let late = Promise::new(|producer| {
            thread::sleep(Duration::from_millis(20));
            producer.resolve(3);
        });
        let combined = all([Promise::resolved(1), Promise::resolved(2), late]);
        assert_eq!(combined.wait().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_all_rejects_with_first_error() {
        init_tracing();
        let combined = all([Promise::resolved(1), Promise::rejected(Error::msg("oops"))]);
        assert_eq!(combined.wait().unwrap_err().to_string(), "oops");
    }

    #[test]
    fn test_all_settled_never_rejects() {
        init_tracing();
        let results = all_settled([Promise::resolved("ok"), Promise::rejected(Error::msg("bad"))])
            .wait()
            .unwrap();
        assert_eq!(results[0].status(), State::Fulfilled);
        assert_eq!(results[0].value(), Some(&"ok"));
        assert_eq!(results[1].status(), State::Rejected);
        assert_eq!(results[1].reason().map(ToString::to_string), Some("bad".to_string()));
    }

    #[test]
    fn test_race_takes_faster_branch() {
        init_tracing();
        let slow = delay(Duration::from_secs(1)).map(|_| Ok("slow"));
        let fast = delay(Duration::from_millis(50)).map(|_| Ok("fast"));
        let started = Instant::now();
        let winner = race([slow.clone(), fast]);
        assert_eq!(winner.wait().unwrap(), "fast");
        assert!(started.elapsed() < Duration::from_millis(900));
        assert_eq!(slow.wait().unwrap(), "slow");
        assert_eq!(winner.wait().unwrap(), "fast");
    }

    #[test]
    fn test_any_with_all_rejected() {
        init_tracing();
        let err = any([
            Promise::<u8>::rejected(Error::msg("x")),
            Promise::rejected(Error::msg("y")),
        ])
        .wait()
        .unwrap_err();
        assert_eq!(err.to_string(), "aggregate error: all promises rejected");
    }

    #[test]
    fn test_panic_recovery() {
        init_tracing();
        let promise = Promise::<i32>::new(|_producer| panic!("boom"));
        let err = promise.wait().unwrap_err();
        assert_eq!(err.to_string(), "panic: boom");
    }

    #[test]
    fn test_timeout_within_margin() {
        init_tracing();
        let (_keep_pending, never) = Producer::<i32>::new();
        let started = Instant::now();
        let err = never
            .timeout(Duration::from_millis(10), "too slow")
            .wait()
            .unwrap_err();
        assert_eq!(err.to_string(), "too slow");
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_with_cancel_cancelled_before_settling() {
        init_tracing();
        let token = CancelToken::new();
        let promise = Promise::with_cancel(&token, |producer| {
            thread::sleep(Duration::from_millis(100));
            producer.resolve("done");
        });
        token.cancel();
        assert!(matches!(promise.wait(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_with_cancel_executor_wins() {
        init_tracing();
        let token = CancelToken::new();
        let promise = Promise::with_cancel(&token, |producer| {
            producer.resolve(5);
        });
        assert_eq!(promise.wait().unwrap(), 5);
        token.cancel();
        assert_eq!(promise.wait().unwrap(), 5);
    }

    #[test]
    fn test_with_cancel_deadline() {
        init_tracing();
        let token = CancelToken::with_timeout(Duration::from_millis(10));
        let (_keep, gate) = Producer::<()>::new();
        let promise = Promise::<i32>::with_cancel(&token, move |producer| {
            let _ = gate.wait_timeout(Duration::from_millis(500));
            producer.resolve(1);
        });
        assert!(matches!(promise.wait(), Err(Error::DeadlineExceeded)));
    }

    #[test]
    fn test_many_cancelled_promises_settle() {
        init_tracing();
        let token = CancelToken::new();
        let promises: Vec<Promise<i32>> = (0..200)
            .map(|_| {
                Promise::with_cancel(&token, |producer| {
                    // Hold the producer until the token settles the promise.
                    let _ = producer.promise().wait();
                })
            })
            .collect();
        token.cancel();
        for result in all_settled(promises).wait().unwrap() {
            assert!(result.reason().map_or(false, Error::is_cancelled));
        }
    }

    #[test]
    fn test_with_cancel_abandoned_executor_does_not_strand_waiters() {
        init_tracing();
        let token = CancelToken::new();
        let promise = Promise::<i32>::with_cancel(&token, |_producer| {});
        let err = promise.wait_timeout(Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, Error::ProducerDropped), "got {err}");
        token.cancel();
        assert!(matches!(promise.wait(), Err(Error::ProducerDropped)));
    }

    #[test]
    fn test_wait_with_cancel_detaches_waiter_only() {
        init_tracing();
        let (producer, promise) = Producer::<i32>::new();
        let token = CancelToken::new();
        let waiter = {
            let promise = promise.clone();
            let token = token.clone();
            thread::spawn(move || promise.wait_with(&token))
        };
        thread::sleep(Duration::from_millis(10));
        token.cancel();
        assert!(matches!(waiter.join().unwrap(), Err(Error::Cancelled)));
        assert!(promise.is_pending());
        producer.resolve(8);
        assert_eq!(promise.wait().unwrap(), 8);
    }

    #[test]
    fn test_map_round_trip() {
        init_tracing();
        let formatted = Promise::resolved(100).map(|i| Ok(i.to_string()));
        assert_eq!(formatted.wait().unwrap(), "100");

        let failed = Promise::resolved(100).map::<String, _>(|_| Err(Error::msg("mapper failed")));
        assert_eq!(failed.wait().unwrap_err().to_string(), "mapper failed");
        assert_eq!(failed.state(), State::Rejected);
    }

    #[test]
    fn test_promisify() {
        init_tracing();
        assert_eq!(promisify(|| Ok(7)).wait().unwrap(), 7);
        let err = promisify::<i32, _>(|| Err(Error::msg("sync failure")))
            .wait()
            .unwrap_err();
        assert_eq!(err.to_string(), "sync failure");
    }

    #[test]
    fn test_many_waiters_released_together() {
        init_tracing();
        let (producer, promise) = Producer::<u64>::new();
        let waiters: Vec<_> = (0..16)
            .map(|_| {
                let promise = promise.clone();
                thread::spawn(move || promise.wait())
            })
            .collect();
        thread::sleep(Duration::from_millis(10));
        producer.resolve(99);
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap().unwrap(), 99);
        }
    }
}
