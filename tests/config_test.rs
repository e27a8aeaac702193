// Runs in its own test binary: environment variables are process-wide, so
// the overrides are exercised from a single test.
use promise_chain::{Config, DispatchPolicy};
use std::env;

const VARS: [&str; 4] = [
    "PROMISE_DISPATCH_POLICY",
    "PROMISE_DISPATCH_WORKERS",
    "PROMISE_DISPATCH_QUEUE_CAPACITY",
    "PROMISE_HANDLER_POOL_CAPACITY",
];

fn clear_vars() {
    for var in VARS {
        env::remove_var(var);
    }
}

#[test]
fn test_env_overrides() {
    clear_vars();
    let defaults = Config::default();
    let untouched = Config::from_environment();
    assert_eq!(untouched.dispatch.policy, defaults.dispatch.policy);
    assert_eq!(untouched.dispatch.workers, defaults.dispatch.workers);
    assert_eq!(untouched.handler_pool.capacity, defaults.handler_pool.capacity);

    env::set_var("PROMISE_DISPATCH_POLICY", "worker_pool");
    env::set_var("PROMISE_DISPATCH_WORKERS", "3");
    env::set_var("PROMISE_DISPATCH_QUEUE_CAPACITY", "64");
    env::set_var("PROMISE_HANDLER_POOL_CAPACITY", "16");
    let config = Config::default().with_env_overrides();
    assert_eq!(config.dispatch.policy, DispatchPolicy::WorkerPool);
    assert_eq!(config.dispatch.workers, 3);
    assert_eq!(config.dispatch.queue_capacity, 64);
    assert_eq!(config.handler_pool.capacity, 16);
    assert!(config.validate().is_ok());

    // The short policy alias is accepted too.
    env::set_var("PROMISE_DISPATCH_POLICY", "thread");
    let config = Config::from_environment();
    assert_eq!(config.dispatch.policy, DispatchPolicy::ThreadPerTask);

    // Unknown or unparsable values leave the existing settings alone.
    let mut base = Config::default();
    base.dispatch.policy = DispatchPolicy::WorkerPool;
    base.dispatch.workers = 5;
    env::set_var("PROMISE_DISPATCH_POLICY", "fibers");
    env::set_var("PROMISE_DISPATCH_WORKERS", "many");
    env::set_var("PROMISE_DISPATCH_QUEUE_CAPACITY", "-1");
    env::set_var("PROMISE_HANDLER_POOL_CAPACITY", "");
    let config = base.with_env_overrides();
    assert_eq!(config.dispatch.policy, DispatchPolicy::WorkerPool);
    assert_eq!(config.dispatch.workers, 5);
    assert_eq!(config.dispatch.queue_capacity, defaults.dispatch.queue_capacity);
    assert_eq!(config.handler_pool.capacity, defaults.handler_pool.capacity);

    clear_vars();
}
