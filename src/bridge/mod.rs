// Synchronous bridge - blocking calls for callers that cannot await

mod channel;

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::runtime::Executor;
use crate::wire::Envelope;
use channel::{Channel, Wait};
use parking_lot::Mutex;
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// Turns an executor call into a blocking call on the current thread
///
/// The request is serialized into a shared channel and picked up by a
/// dedicated helper thread, which submits it to the executor and drives the
/// pending call to completion on its own. The caller parks on a condition
/// variable until the reply is written or the configured timeout passes.
///
/// Only one call may be in flight per bridge; overlapping calls are rejected.
/// After a timeout the stuck helper is retired and a fresh one is spawned on
/// the next call.
pub struct SyncBridge {
    executor: Arc<Executor>,
    config: BridgeConfig,
    helper: Mutex<Option<Helper>>,
    busy: AtomicBool,
    closed: AtomicBool,
    generation: AtomicU64,
}

struct Helper {
    channel: Arc<Channel>,
    _thread: thread::JoinHandle<()>,
}

impl SyncBridge {
    pub fn new(executor: Arc<Executor>, config: BridgeConfig) -> Self {
        Self {
            executor,
            config,
            helper: Mutex::new(None),
            busy: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    /// Run `name(args)` through the helper and block until it replies
    pub fn call_sync(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Terminated);
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Bridge(
                "another call is already in flight on this bridge".to_string(),
            ));
        }
        let _busy = BusyGuard(&self.busy);

        let request = Envelope::Call {
            id: 0,
            name: name.to_string(),
            args,
        }
        .encode()?;
        if request.len() > self.config.capacity {
            return Err(Error::Validation(format!(
                "request of {} bytes exceeds the bridge capacity of {} bytes",
                request.len(),
                self.config.capacity
            )));
        }

        let channel = self.channel()?;
        let started = Instant::now();
        let seq = channel.post_request(request);
        let deadline = self.config.timeout.map(|timeout| started + timeout);

        match channel.wait_reply(seq, deadline) {
            Wait::Reply(reply) => Envelope::decode(&reply)?.into_outcome(),
            Wait::TimedOut => {
                let timeout = self.config.timeout.unwrap_or_default();
                tracing::warn!(
                    task = name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "bridge call timed out, recycling helper"
                );
                self.recycle();
                Err(Error::Timeout(timeout))
            }
            Wait::Retired => Err(Error::Bridge("bridge helper stopped".to_string())),
        }
    }

    /// Retire the helper; later calls fail with [`Error::Terminated`]
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.recycle();
    }

    /// Channel of the live helper, spawning one if needed
    fn channel(&self) -> Result<Arc<Channel>> {
        let mut helper = self.helper.lock();
        if let Some(live) = helper.as_ref() {
            if !live.channel.is_retired() {
                return Ok(live.channel.clone());
            }
        }

        let channel = Arc::new(Channel::new(self.config.capacity));
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let thread = {
            let channel = channel.clone();
            let executor = self.executor.clone();
            thread::Builder::new()
                .name(format!("offcheck-bridge-{generation}"))
                .spawn(move || run_helper(&channel, &executor))
                .map_err(|e| Error::Platform(format!("failed to spawn bridge helper: {e}")))?
        };
        tracing::debug!(generation, "bridge helper started");

        *helper = Some(Helper {
            channel: channel.clone(),
            _thread: thread,
        });
        Ok(channel)
    }

    fn recycle(&self) {
        if let Some(helper) = self.helper.lock().take() {
            helper.channel.retire();
            tracing::debug!("bridge helper retired");
        }
    }
}

impl Drop for SyncBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn run_helper(channel: &Channel, executor: &Executor) {
    let run = panic::catch_unwind(AssertUnwindSafe(|| {
        while let Some((seq, request)) = channel.next_request() {
            let outcome = match Envelope::decode(&request) {
                Ok(Envelope::Call { name, args, .. }) => executor.submit(name, args).wait(),
                Ok(_) => Err(Error::Validation(
                    "bridge helper expects a call envelope".to_string(),
                )),
                Err(e) => Err(e),
            };
            channel.post_reply(seq, encode_reply(seq, outcome, channel.capacity()));
        }
    }));

    if run.is_err() {
        tracing::error!("bridge helper panicked");
        channel.retire();
    }
}

fn encode_reply(seq: u64, outcome: Result<Value>, capacity: usize) -> String {
    let fallback = |error: Error| {
        serde_json::to_string(&Envelope::reply(seq, Err(error))).unwrap_or_default()
    };

    match Envelope::reply(seq, outcome).encode() {
        Ok(reply) if reply.len() <= capacity => reply,
        Ok(reply) => fallback(Error::Bridge(format!(
            "reply of {} bytes exceeds the bridge capacity of {capacity} bytes",
            reply.len()
        ))),
        Err(e) => fallback(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, PoolConfig};
    use crate::error::CheckerError;
    use crate::runtime::{WorkerModule, WorkerScript};
    use serde_json::json;
    use std::time::Duration;

    struct Slow;

    impl WorkerModule for Slow {
        fn call(&mut self, name: &str, args: &[Value]) -> Result<Value> {
            match name {
                "sleep" => {
                    let ms = args.first().and_then(Value::as_u64).unwrap_or(0);
                    thread::sleep(Duration::from_millis(ms));
                    Ok(json!({ "slept": ms }))
                }
                "big" => Ok(Value::from("x".repeat(4096))),
                "reject" => Err(Error::Checker(CheckerError::new("RangeError", "too deep"))),
                other => Err(Error::Validation(format!("unknown task '{other}'"))),
            }
        }
    }

    fn executor(backend: BackendKind) -> Arc<Executor> {
        let config = PoolConfig {
            max_workers: 2,
            ..Default::default()
        };
        Arc::new(Executor::build(backend, &config, WorkerScript::inline(|_| Slow)).unwrap())
    }

    fn bridge(backend: BackendKind, timeout: Option<Duration>) -> SyncBridge {
        SyncBridge::new(
            executor(backend),
            BridgeConfig {
                timeout,
                ..Default::default()
            },
        )
    }

    #[test]
    fn sync_call_matches_async_result() {
        let executor = executor(BackendKind::ThreadPool);
        let bridge = SyncBridge::new(executor.clone(), BridgeConfig::default());

        let sync = bridge.call_sync("sleep", vec![json!(1)]).unwrap();
        let direct = executor.submit("sleep", vec![json!(1)]).wait().unwrap();
        assert_eq!(sync, direct);
    }

    #[test]
    fn errors_keep_kind_and_message() {
        let bridge = bridge(BackendKind::WorkerPool, None);
        let err = bridge.call_sync("reject", vec![]).unwrap_err();
        assert_eq!(
            err,
            Error::Checker(CheckerError::new("RangeError", "too deep"))
        );
    }

    #[test]
    fn timeout_leaves_bridge_usable() {
        let bridge = bridge(BackendKind::InProcess, Some(Duration::from_millis(50)));

        let started = Instant::now();
        let err = bridge.call_sync("sleep", vec![json!(500)]).unwrap_err();
        let elapsed = started.elapsed();
        assert_eq!(err, Error::Timeout(Duration::from_millis(50)));
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(150), "took {elapsed:?}");

        let ok = bridge.call_sync("sleep", vec![json!(0)]).unwrap();
        assert_eq!(ok, json!({ "slept": 0 }));
    }

    #[test]
    fn overlapping_calls_are_rejected() {
        let bridge = Arc::new(bridge(BackendKind::ThreadPool, None));
        let first = {
            let bridge = bridge.clone();
            thread::spawn(move || bridge.call_sync("sleep", vec![json!(300)]))
        };
        thread::sleep(Duration::from_millis(50));

        let err = bridge.call_sync("sleep", vec![json!(0)]).unwrap_err();
        assert!(matches!(err, Error::Bridge(_)));
        assert!(first.join().unwrap().is_ok());
    }

    #[test]
    fn capacity_is_enforced_both_ways() {
        let bridge = SyncBridge::new(
            executor(BackendKind::InProcess),
            BridgeConfig {
                timeout: None,
                capacity: 512,
            },
        );

        let err = bridge
            .call_sync("sleep", vec![json!("y".repeat(1024))])
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = bridge.call_sync("big", vec![]).unwrap_err();
        assert!(matches!(err, Error::Bridge(_)));
    }

    #[test]
    fn shutdown_closes_the_bridge() {
        let bridge = bridge(BackendKind::InProcess, None);
        assert!(bridge.call_sync("sleep", vec![json!(0)]).is_ok());
        bridge.shutdown();
        assert_eq!(
            bridge.call_sync("sleep", vec![json!(0)]).unwrap_err(),
            Error::Terminated
        );
    }
}
