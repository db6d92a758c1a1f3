//! The cycle driver: fetch pending actions, run each one in the container,
//! write each outcome back, and optionally repeat forever.
//!
//! # One pass
//!
//! ```text
//! fetch_pending ──► for each record, in store order:
//!                      run(command) ──► persist_result(id, outcome)
//!                      pause record_delay
//! ```
//!
//! Records are handled strictly one at a time. The container is a single
//! shared, stateful environment, so commands must not overlap; the pause
//! after every record throttles both the container and the store.
//!
//! In continuous mode a stop request is checked before each record. The
//! records not yet started stay pending for the next run.
//!
//! # Fault containment
//!
//! A record that cannot be handled (missing `id`/`command`, a panicking
//! store call) is logged and skipped; the pass moves on. A panicking backend
//! is recorded as a not-run outcome for that record. In continuous mode a
//! fault escaping a whole pass is logged and the loop carries on after the
//! usual interval: no backoff, no retry ceiling.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use crate::action::{ActionRecord, ExecutionOutcome};
use crate::backend::ExecutionBackend;
use crate::error::{DispatchError, Result};
use crate::shutdown::StopSignal;
use crate::store::ActionStore;

// ---------------------------------------------------------------------------
// LoopState / MonitorSummary
// ---------------------------------------------------------------------------

/// States of the continuous monitoring loop.
///
/// Transitions: `Running → Idle → Running → …`, and `Idle → Stopped` when a
/// stop is requested. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoopState::Idle => "idle",
            LoopState::Running => "running",
            LoopState::Stopped => "stopped",
        })
    }
}

/// Totals reported when the monitoring loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorSummary {
    /// Passes started.
    pub passes: u64,
    /// Records whose outcome was persisted, across all passes.
    pub processed: u64,
    /// Passes that ended in a fault instead of a count.
    pub faults: u64,
}

// ---------------------------------------------------------------------------
// CycleDriver
// ---------------------------------------------------------------------------

pub struct CycleDriver<S, B> {
    store: S,
    backend: B,
    record_delay: Duration,
}

impl<S: ActionStore, B: ExecutionBackend> CycleDriver<S, B> {
    pub fn new(store: S, backend: B, record_delay: Duration) -> Self {
        Self {
            store,
            backend,
            record_delay,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Run one pass over every pending action. Returns how many outcomes
    /// were persisted.
    pub fn process_pending_actions(&self) -> usize {
        self.run_pass(None)
    }

    /// One pass. With a `stop` signal, a stop request leaves the remaining
    /// records pending; the record already handed to the backend still
    /// finishes and is persisted.
    fn run_pass(&self, stop: Option<&StopSignal>) -> usize {
        let actions = self.store.fetch_pending();
        let mut processed = 0;

        for (i, action) in actions.iter().enumerate() {
            if stop.is_some_and(StopSignal::is_requested) {
                tracing::info!(
                    skipped = actions.len() - i,
                    "stop requested, leaving remaining actions pending"
                );
                break;
            }
            match self.handle(action) {
                Ok(true) => processed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(action_id = %action.id_label(), error = %e, "error processing action");
                }
            }
            self.pause(stop);
        }

        processed
    }

    fn pause(&self, stop: Option<&StopSignal>) {
        if self.record_delay.is_zero() {
            return;
        }
        match stop {
            Some(stop) => {
                stop.wait(self.record_delay);
            }
            None => std::thread::sleep(self.record_delay),
        }
    }

    /// Handle one record. `Ok(persisted)` once the outcome was handed to the
    /// store; `Err` when the record could not be handled at all.
    fn handle(&self, action: &ActionRecord) -> Result<bool> {
        let id = action.require_id()?;
        let command = action.require_command()?;
        tracing::info!(action_id = %id, command, "processing action");

        let outcome = contain(|| self.backend.run(command)).unwrap_or_else(|e| {
            tracing::error!(action_id = %id, error = %e, "backend fault");
            ExecutionOutcome::not_run(e.to_string())
        });

        contain(|| self.store.persist_result(id, &outcome))
    }

    /// Repeat [`process_pending_actions`](Self::process_pending_actions)
    /// every `interval` until `stop` fires.
    ///
    /// The first pass starts immediately. A stop is observed between
    /// records and while idle; a running command always runs to completion.
    pub fn run_continuous(&self, interval: Duration, stop: &StopSignal) -> MonitorSummary {
        tracing::info!(
            interval_secs = interval.as_secs(),
            "starting continuous monitoring"
        );
        let mut summary = MonitorSummary::default();
        let mut state = LoopState::Idle;

        loop {
            enter(&mut state, LoopState::Running);
            summary.passes += 1;
            match contain(|| self.run_pass(Some(stop))) {
                Ok(0) => tracing::debug!("no pending actions found"),
                Ok(n) => {
                    summary.processed += n as u64;
                    tracing::info!(processed = n, "processed actions");
                }
                Err(e) => {
                    summary.faults += 1;
                    tracing::error!(error = %e, "error in monitoring loop");
                }
            }

            enter(&mut state, LoopState::Idle);
            if stop.wait(interval) {
                enter(&mut state, LoopState::Stopped);
                tracing::info!("monitoring stopped by user");
                return summary;
            }
        }
    }
}

fn enter(state: &mut LoopState, next: LoopState) {
    tracing::debug!(from = %state, to = %next, "monitor state");
    *state = next;
}

/// Run `f`, turning a panic into [`DispatchError::Fault`].
fn contain<T>(f: impl FnOnce() -> T) -> Result<T> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic with non-string payload".to_string());
        DispatchError::Fault(message)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionId, NOT_RUN_EXIT_CODE};
    use crate::shutdown::StopHandle;
    use std::cell::{Cell, RefCell};

    // -----------------------------------------------------------------------
    // Fakes
    // -----------------------------------------------------------------------

    #[derive(Default)]
    struct FakeStore {
        passes: RefCell<Vec<Vec<ActionRecord>>>,
        fetches: Cell<usize>,
        persisted: RefCell<Vec<(ActionId, ExecutionOutcome)>>,
        reject_writes_for: Option<ActionId>,
        panic_on_fetch: Option<usize>,
        stop_on_fetch: Option<(usize, StopHandle)>,
    }

    impl FakeStore {
        /// Every fetch returns `records`.
        fn with(records: Vec<ActionRecord>) -> Self {
            Self {
                passes: RefCell::new(vec![records]),
                ..Self::default()
            }
        }

        fn exit_codes(&self) -> Vec<i32> {
            self.persisted.borrow().iter().map(|(_, o)| o.exit_code).collect()
        }
    }

    impl ActionStore for FakeStore {
        fn fetch_pending(&self) -> Vec<ActionRecord> {
            let n = self.fetches.get() + 1;
            self.fetches.set(n);
            if let Some((at, handle)) = &self.stop_on_fetch {
                if *at == n {
                    handle.stop();
                }
            }
            if self.panic_on_fetch == Some(n) {
                panic!("store connection reset");
            }
            let passes = self.passes.borrow();
            passes.get(n - 1).or(passes.last()).cloned().unwrap_or_default()
        }

        fn persist_result(&self, id: &ActionId, outcome: &ExecutionOutcome) -> bool {
            self.persisted.borrow_mut().push((id.clone(), outcome.clone()));
            self.reject_writes_for.as_ref() != Some(id)
        }
    }

    /// Emulates a shell in a reachable (or unreachable) container.
    #[derive(Default)]
    struct FakeBackend {
        unreachable: bool,
        ran: RefCell<Vec<String>>,
        stop_on: Option<(&'static str, StopHandle)>,
    }

    impl ExecutionBackend for FakeBackend {
        fn run(&self, command: &str) -> ExecutionOutcome {
            self.ran.borrow_mut().push(command.to_string());
            if let Some((trigger, handle)) = &self.stop_on {
                if *trigger == command {
                    handle.stop();
                }
            }
            if self.unreachable {
                return ExecutionOutcome::not_run("container 'nowhere' not found");
            }
            match command {
                "false" => ExecutionOutcome::completed("", 1),
                "boom" => panic!("exec stream closed"),
                cmd => match cmd.strip_prefix("echo ") {
                    Some(text) => ExecutionOutcome::completed(format!("{text}\n"), 0),
                    None => ExecutionOutcome::completed("", 127),
                },
            }
        }
    }

    fn driver(store: FakeStore, backend: FakeBackend) -> CycleDriver<FakeStore, FakeBackend> {
        CycleDriver::new(store, backend, Duration::ZERO)
    }

    // -----------------------------------------------------------------------
    // process_pending_actions
    // -----------------------------------------------------------------------

    #[test]
    fn three_records_are_run_and_persisted_in_order() {
        let store = FakeStore::with(vec![
            ActionRecord::pending(1, "echo a"),
            ActionRecord::pending(2, "echo b"),
            ActionRecord::pending(3, "false"),
        ]);
        let d = driver(store, FakeBackend::default());

        assert_eq!(d.process_pending_actions(), 3);
        assert_eq!(*d.backend().ran.borrow(), ["echo a", "echo b", "false"]);
        assert_eq!(d.store().exit_codes(), [0, 0, 1]);
        let persisted = d.store().persisted.borrow();
        let ids: Vec<_> = persisted.iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(ids, [ActionId::Int(1), ActionId::Int(2), ActionId::Int(3)]);
        assert_eq!(persisted[0].1.stdout, "a\n");
    }

    #[test]
    fn unreachable_container_outcome_is_still_persisted() {
        let store = FakeStore::with(vec![ActionRecord::pending(9, "uname -a")]);
        let backend = FakeBackend {
            unreachable: true,
            ..FakeBackend::default()
        };
        let d = driver(store, backend);

        assert_eq!(d.process_pending_actions(), 1);
        let persisted = d.store().persisted.borrow();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].1.exit_code, NOT_RUN_EXIT_CODE);
        assert!(!persisted[0].1.stderr.is_empty());
    }

    #[test]
    fn failed_read_means_no_execution_and_no_writes() {
        let d = driver(FakeStore::default(), FakeBackend::default());

        assert_eq!(d.process_pending_actions(), 0);
        assert_eq!(d.store().fetches.get(), 1);
        assert!(d.backend().ran.borrow().is_empty());
        assert!(d.store().persisted.borrow().is_empty());
    }

    #[test]
    fn malformed_record_does_not_stop_the_pass() {
        let store = FakeStore::with(vec![
            ActionRecord::pending(1, "echo a"),
            ActionRecord {
                id: Some(ActionId::Int(2)),
                command: None,
                result: None,
            },
            ActionRecord {
                id: None,
                command: Some("echo orphan".into()),
                result: None,
            },
            ActionRecord::pending(4, "echo d"),
        ]);
        let d = driver(store, FakeBackend::default());

        assert_eq!(d.process_pending_actions(), 2);
        assert_eq!(*d.backend().ran.borrow(), ["echo a", "echo d"]);
    }

    #[test]
    fn rejected_write_is_not_counted() {
        let store = FakeStore {
            reject_writes_for: Some(ActionId::Int(2)),
            ..FakeStore::with(vec![
                ActionRecord::pending(1, "echo a"),
                ActionRecord::pending(2, "echo b"),
                ActionRecord::pending(3, "echo c"),
            ])
        };
        let d = driver(store, FakeBackend::default());

        assert_eq!(d.process_pending_actions(), 2);
        assert_eq!(d.store().persisted.borrow().len(), 3);
    }

    #[test]
    fn backend_panic_is_persisted_as_not_run() {
        let store = FakeStore::with(vec![
            ActionRecord::pending(1, "boom"),
            ActionRecord::pending(2, "echo b"),
        ]);
        let d = driver(store, FakeBackend::default());

        assert_eq!(d.process_pending_actions(), 2);
        let persisted = d.store().persisted.borrow();
        assert_eq!(persisted[0].1.exit_code, NOT_RUN_EXIT_CODE);
        assert!(persisted[0].1.stderr.contains("exec stream closed"));
        assert_eq!(persisted[1].1.exit_code, 0);
    }

    #[test]
    fn record_delay_applies_after_every_record() {
        let store = FakeStore::with(vec![
            ActionRecord::pending(1, "echo a"),
            ActionRecord::default(),
        ]);
        let d = CycleDriver::new(store, FakeBackend::default(), Duration::from_millis(15));

        let start = std::time::Instant::now();
        assert_eq!(d.process_pending_actions(), 1);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    // -----------------------------------------------------------------------
    // run_continuous
    // -----------------------------------------------------------------------

    #[test]
    fn stop_while_idle_prevents_the_next_pass() {
        let (handle, stop) = StopSignal::channel();
        let store = FakeStore::with(vec![]);
        let d = driver(store, FakeBackend::default());

        let interrupter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.stop();
        });
        let start = std::time::Instant::now();
        let summary = d.run_continuous(Duration::from_secs(3600), &stop);
        interrupter.join().unwrap();

        assert!(start.elapsed() < Duration::from_secs(60));
        assert_eq!(
            summary,
            MonitorSummary {
                passes: 1,
                processed: 0,
                faults: 0
            }
        );
        assert_eq!(d.store().fetches.get(), 1);
    }

    #[test]
    fn stop_during_a_pass_leaves_remaining_records_pending() {
        let (handle, stop) = StopSignal::channel();
        let store = FakeStore::with(
            (1..=5i64)
                .map(|n| ActionRecord::pending(n, format!("echo {n}")))
                .collect(),
        );
        let backend = FakeBackend {
            stop_on: Some(("echo 1", handle)),
            ..FakeBackend::default()
        };
        let d = CycleDriver::new(store, backend, Duration::from_secs(3600));

        let start = std::time::Instant::now();
        let summary = d.run_continuous(Duration::from_secs(3600), &stop);

        assert!(start.elapsed() < Duration::from_secs(60));
        assert_eq!(*d.backend().ran.borrow(), ["echo 1"]);
        assert_eq!(d.store().exit_codes(), [0]);
        assert_eq!(
            summary,
            MonitorSummary {
                passes: 1,
                processed: 1,
                faults: 0
            }
        );
    }

    #[test]
    fn stop_at_fetch_runs_nothing_from_that_pass() {
        let (handle, stop) = StopSignal::channel();
        let store = FakeStore {
            stop_on_fetch: Some((1, handle)),
            ..FakeStore::with(vec![ActionRecord::pending(1, "echo a")])
        };
        let d = driver(store, FakeBackend::default());

        let summary = d.run_continuous(Duration::from_secs(3600), &stop);
        assert_eq!(summary.passes, 1);
        assert_eq!(summary.processed, 0);
        assert!(d.backend().ran.borrow().is_empty());
    }

    #[test]
    fn one_shot_pass_ignores_stop_signals() {
        let (handle, _stop) = StopSignal::channel();
        let store = FakeStore::with(vec![
            ActionRecord::pending(1, "echo a"),
            ActionRecord::pending(2, "echo b"),
        ]);
        let backend = FakeBackend {
            stop_on: Some(("echo a", handle)),
            ..FakeBackend::default()
        };
        let d = driver(store, backend);

        assert_eq!(d.process_pending_actions(), 2);
    }

    #[test]
    fn loop_repeats_until_stopped() {
        let (handle, stop) = StopSignal::channel();
        let store = FakeStore {
            passes: RefCell::new(vec![
                vec![ActionRecord::pending(1, "echo a")],
                vec![],
                vec![ActionRecord::pending(2, "echo b"), ActionRecord::pending(3, "false")],
                vec![],
            ]),
            stop_on_fetch: Some((4, handle)),
            ..FakeStore::default()
        };
        let d = driver(store, FakeBackend::default());

        let summary = d.run_continuous(Duration::from_millis(1), &stop);
        assert_eq!(summary.passes, 4);
        assert_eq!(summary.processed, 3);
        assert_eq!(d.store().exit_codes(), [0, 0, 1]);
    }

    #[test]
    fn faulted_pass_is_retried_after_the_interval() {
        let (handle, stop) = StopSignal::channel();
        let store = FakeStore {
            panic_on_fetch: Some(1),
            stop_on_fetch: Some((3, handle)),
            ..FakeStore::with(vec![ActionRecord::pending(1, "echo a")])
        };
        let d = driver(store, FakeBackend::default());

        let summary = d.run_continuous(Duration::from_millis(1), &stop);
        assert_eq!(
            summary,
            MonitorSummary {
                passes: 3,
                processed: 1,
                faults: 1
            }
        );
    }

    #[test]
    fn contain_reports_panic_message() {
        let err = contain(|| -> usize { panic!("bad {}", 1) }).unwrap_err();
        assert_eq!(err.to_string(), "unexpected fault: bad 1");
        assert_eq!(contain(|| 5).unwrap(), 5);
    }
}
