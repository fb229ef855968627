//! Desired-state reconciliation.
//!
//! The reconciler compares the observed [`ConnectionState`] against the
//! caller's [`DesiredState`] and issues one corrective command per
//! iteration until the two match, draining eagerly in an explicit work
//! loop. Most transitions take several hops (discover, wait for the
//! reader to show up, connect, wait for the session), so a single pass
//! usually ends diverged: either a corrective command failed, which the
//! bounded backoff in [`Reconciler::reconcile_with_retry`] retries, or
//! the command was accepted and the rest arrives as driver events, in
//! which case the pass parks as soon as it stops making progress and the
//! connection-change watcher re-triggers it on the next notification.
//!
//! Progress is tracked as the `(observed, desired)` pair recorded before
//! each corrective attempt. A pass that sees the same pair again stops:
//! the last command was accepted but changed nothing observable, and
//! re-issuing it would spin. Failed attempts never define stuckness; the
//! recorded pair is dropped on the error path so the retry schedule alone
//! decides when to give up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use backoff::backoff::Backoff;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::commands::DeviceCommands;
use crate::config::RetryPolicy;
use crate::error::Result;
use crate::store::StateStore;
use tapkit_core::constants::is_busy_reason;
use tapkit_core::{ConnectionState, ConnectionStatus, DesiredState};

/// Drives the observed connection state toward a desired target.
pub(crate) struct Reconciler {
    store: Arc<StateStore>,
    commands: Arc<DeviceCommands>,
    desired: Mutex<DesiredState>,
    /// `(observed, desired)` recorded before the most recent corrective
    /// attempt of the current convergence job.
    last_attempt: Mutex<Option<(ConnectionState, DesiredState)>>,
    pass_active: AtomicBool,
    retry: RetryPolicy,
}

impl Reconciler {
    pub(crate) fn new(
        store: Arc<StateStore>,
        commands: Arc<DeviceCommands>,
        retry: RetryPolicy,
    ) -> Self {
        Reconciler {
            store,
            commands,
            desired: Mutex::new(DesiredState::not_connected()),
            last_attempt: Mutex::new(None),
            pass_active: AtomicBool::new(false),
            retry,
        }
    }

    /// The target currently being reconciled toward.
    pub(crate) fn desired(&self) -> DesiredState {
        self.desired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the target and reconcile toward it.
    ///
    /// The recorded attempt pair is reset first, so an identical target
    /// set again while diverged gets a fresh attempt instead of being
    /// classified as stuck. Returns once converged or parked on a driver
    /// event, or with the original error after the retry schedule is
    /// exhausted.
    pub(crate) async fn set_desired(&self, desired: DesiredState) -> Result<()> {
        info!(?desired, "setting desired state");
        *self
            .desired
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = desired;
        self.reset_attempt();
        self.reconcile_with_retry().await
    }

    /// Spawn the re-arm watcher: one reconcile pass per connection-state
    /// change, for the transitions that complete as driver events after a
    /// pass has parked. Redundant wakeups land on the convergence check
    /// and cost nothing.
    pub(crate) fn spawn_watcher(self: &Arc<Self>, tasks: &mut JoinSet<()>) {
        let reconciler = Arc::clone(self);
        let mut changes = reconciler.store.watch_connection();
        tasks.spawn(async move {
            while changes.changed().await.is_ok() {
                if let Err(err) = reconciler.reconcile_with_retry().await {
                    warn!(error = %err, "reconciliation gave up until the next state change");
                }
            }
        });
    }

    /// Run reconcile passes under the bounded backoff schedule.
    ///
    /// Only corrective-command failures consume the schedule; a pass that
    /// parks stuck returns `Ok` and waits for the watcher. After the last
    /// retry the failing command's error is surfaced unwrapped.
    pub(crate) async fn reconcile_with_retry(&self) -> Result<()> {
        let mut backoff = self.retry.backoff();
        let mut retry_count = 0u32;

        loop {
            let err = match self.run_pass().await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            retry_count += 1;
            if retry_count > self.retry.max_retries {
                return Err(err);
            }
            let Some(duration) = backoff.next_backoff() else {
                return Err(err);
            };
            warn!(error = %err, ?duration, attempt = retry_count, "corrective command failed, backing off");
            tokio::time::sleep(duration).await;
        }
    }

    /// One reconcile pass: classify and correct until converged or stuck.
    async fn run_pass(&self) -> Result<()> {
        let Some(_guard) = PassGuard::try_acquire(&self.pass_active) else {
            // The active pass re-reads observed and desired state every
            // iteration, so a request landing mid-pass is already served.
            debug!("reconcile pass already running, dropping request");
            return Ok(());
        };

        loop {
            let observed = self.store.connection();
            let desired = self.desired();

            if desired.matches(&observed) {
                debug!(status = %observed.status, "reached desired state");
                self.reset_attempt();
                return Ok(());
            }

            if self.is_repeat_attempt(&observed, &desired) {
                debug!(
                    status = %observed.status,
                    "no progress since last attempt, waiting for a state change"
                );
                return Ok(());
            }
            self.record_attempt(&observed, &desired);

            debug!(from = %observed.status, to = ?desired.status, "attempting transition");
            if let Err(err) = self.corrective_step(&observed, &desired).await {
                // The rollback this command recorded is where the retry
                // resumes from; keeping the pair would make the retry
                // look stuck against its own failure.
                self.reset_attempt();
                return Err(err);
            }
        }
    }

    /// Issue the corrective command for one diverged `(observed, desired)`
    /// pair. Branches that have nothing to do yet (initialization still
    /// running, reader not discovered, a session transition in flight)
    /// return `Ok` without a command and let the pass park.
    async fn corrective_step(
        &self,
        observed: &ConnectionState,
        desired: &DesiredState,
    ) -> Result<()> {
        match desired.status {
            Some(ConnectionStatus::NotConnected) => self.commands.disconnect().await,
            Some(ConnectionStatus::Discovering) => {
                if observed.status == ConnectionStatus::NotConnected {
                    self.start_discovery(observed, desired).await
                } else {
                    // Discovery with different parameters, or a live
                    // session; restart from a clean disconnect.
                    self.commands.disconnect().await
                }
            }
            Some(ConnectionStatus::Connected) => match observed.status {
                ConnectionStatus::NotInitialized => Ok(()),
                ConnectionStatus::NotConnected => self.start_discovery(observed, desired).await,
                ConnectionStatus::Discovering => self.connect_discovered(observed, desired).await,
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }

    /// Start a discovery session, clearing a recorded busy-discovery
    /// refusal first so the fresh request is not refused for the same
    /// reason.
    async fn start_discovery(
        &self,
        observed: &ConnectionState,
        desired: &DesiredState,
    ) -> Result<()> {
        if let Some(reason) = &observed.discovery_error
            && is_busy_reason(reason)
        {
            debug!(reason = %reason, "aborting busy discovery before restarting");
            if let Err(err) = self.commands.abort_discovery().await {
                warn!(error = %err, "busy-discovery abort failed");
            }
        }
        let method = desired
            .discovery_method
            .unwrap_or(observed.discovery_method);
        let simulated = desired.simulated.unwrap_or(observed.simulated);
        self.commands.discover(method, simulated).await
    }

    /// Connect to the desired reader if discovery has found it.
    async fn connect_discovered(
        &self,
        observed: &ConnectionState,
        desired: &DesiredState,
    ) -> Result<()> {
        let target = desired
            .serial_number
            .as_ref()
            .and_then(|serial| observed.readers.iter().find(|r| r.serial_number == *serial));
        let Some(reader) = target else {
            debug!(
                discovered = observed.readers.len(),
                "desired reader not in the discovery batch yet"
            );
            return Ok(());
        };
        let location = desired
            .location_id
            .clone()
            .or_else(|| reader.location_id.clone());
        self.commands
            .connect(reader.serial_number.clone(), location)
            .await
    }

    fn is_repeat_attempt(&self, observed: &ConnectionState, desired: &DesiredState) -> bool {
        self.last_attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|(o, d)| o == observed && d == desired)
    }

    fn record_attempt(&self, observed: &ConnectionState, desired: &DesiredState) {
        *self
            .last_attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((observed.clone(), desired.clone()));
    }

    fn reset_attempt(&self) {
        *self
            .last_attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Clears the pass flag on every exit path.
struct PassGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> PassGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            .then_some(PassGuard { flag })
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationTracker;
    use crate::queue::CommandQueue;
    use tapkit_core::constants::ERR_DISCOVERY_BUSY;
    use tapkit_core::{DiscoveryMethod, Reader};
    use tapkit_driver::{DriverError, SimulatedDriver, SimulatedHandle};

    fn reconciler() -> (Arc<Reconciler>, Arc<StateStore>, SimulatedHandle, JoinSet<()>) {
        let store = Arc::new(StateStore::new());
        let (driver, handle) = SimulatedDriver::new();
        let cancel = Arc::new(CancellationTracker::new());
        let mut tasks = JoinSet::new();
        let queue = CommandQueue::start(8, &mut tasks);
        let commands = Arc::new(DeviceCommands::new(
            Arc::clone(&store),
            Arc::new(driver),
            queue,
            cancel,
        ));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            commands,
            RetryPolicy::default(),
        ));
        (reconciler, store, handle, tasks)
    }

    fn discovered(serial: &str, location: Option<&str>) -> Reader {
        Reader {
            serial_number: serial.to_string(),
            location_id: location.map(str::to_string),
            device_type_name: "chipper_2x".to_string(),
            battery_level: Some(0.8),
            is_charging: false,
            is_card_inserted: false,
        }
    }

    #[tokio::test]
    async fn converged_state_issues_no_commands() {
        let (reconciler, store, handle, _tasks) = reconciler();
        store.update_connection(|c| c.status = ConnectionStatus::NotConnected);

        reconciler
            .set_desired(DesiredState::not_connected())
            .await
            .unwrap();
        reconciler
            .set_desired(DesiredState::not_connected())
            .await
            .unwrap();

        assert!(handle.ops().is_empty());
    }

    #[tokio::test]
    async fn discovery_target_converges_in_one_pass() {
        let (reconciler, store, handle, _tasks) = reconciler();
        store.update_connection(|c| c.status = ConnectionStatus::NotConnected);

        reconciler
            .set_desired(DesiredState::discovering(DiscoveryMethod::BluetoothScan, true))
            .await
            .unwrap();

        assert_eq!(handle.ops(), vec!["discover_readers"]);
        assert_eq!(store.connection().status, ConnectionStatus::Discovering);
    }

    #[tokio::test]
    async fn accepted_disconnect_parks_until_the_driver_reports() {
        let (reconciler, store, handle, _tasks) = reconciler();
        store.update_connection(|c| {
            c.status = ConnectionStatus::Connected;
            c.reader = Some(discovered("R1", None));
        });

        reconciler
            .set_desired(DesiredState::not_connected())
            .await
            .unwrap();
        // Accepted but not yet reported; a second trigger with nothing
        // changed must not re-issue the command.
        reconciler.reconcile_with_retry().await.unwrap();
        assert_eq!(handle.ops(), vec!["disconnect_reader"]);

        store.update_connection(|c| {
            c.status = ConnectionStatus::NotConnected;
            c.reader = None;
        });
        reconciler.reconcile_with_retry().await.unwrap();
        assert_eq!(handle.ops(), vec!["disconnect_reader"]);
    }

    #[tokio::test]
    async fn repeating_set_desired_rearms_a_parked_job() {
        let (reconciler, store, handle, _tasks) = reconciler();
        store.update_connection(|c| {
            c.status = ConnectionStatus::Connected;
            c.reader = Some(discovered("R1", None));
        });

        reconciler
            .set_desired(DesiredState::not_connected())
            .await
            .unwrap();
        reconciler
            .set_desired(DesiredState::not_connected())
            .await
            .unwrap();

        assert_eq!(handle.ops(), vec!["disconnect_reader", "disconnect_reader"]);
    }

    #[tokio::test]
    async fn walks_from_not_connected_to_connected_as_state_arrives() {
        let (reconciler, store, handle, _tasks) = reconciler();
        store.update_connection(|c| c.status = ConnectionStatus::NotConnected);
        let desired = DesiredState::connected("R1")
            .with_location("loc_1")
            .with_discovery(DiscoveryMethod::BluetoothScan, true);

        reconciler.set_desired(desired).await.unwrap();
        assert_eq!(handle.ops(), vec!["discover_readers"]);
        assert_eq!(
            handle.calls()[0].args,
            "bluetoothScan simulated=true"
        );

        // Discovery batch with an unrelated reader first.
        store.update_connection(|c| c.readers = vec![discovered("R9", None)]);
        reconciler.reconcile_with_retry().await.unwrap();
        assert_eq!(handle.ops(), vec!["discover_readers"]);

        store.update_connection(|c| {
            c.readers = vec![discovered("R9", None), discovered("R1", Some("loc_2"))]
        });
        reconciler.reconcile_with_retry().await.unwrap();
        assert_eq!(handle.ops(), vec!["discover_readers", "connect_reader"]);
        assert_eq!(handle.calls()[1].args, "R1 at loc_1");

        store.update_connection(|c| {
            c.status = ConnectionStatus::Connected;
            c.reader = Some(discovered("R1", Some("loc_1")));
            c.readers = Vec::new();
        });
        reconciler.reconcile_with_retry().await.unwrap();
        assert_eq!(handle.ops(), vec!["discover_readers", "connect_reader"]);
    }

    #[tokio::test]
    async fn falls_back_to_the_discovered_location() {
        let (reconciler, store, handle, _tasks) = reconciler();
        store.update_connection(|c| {
            c.status = ConnectionStatus::Discovering;
            c.readers = vec![discovered("R1", Some("loc_adv"))];
        });

        reconciler
            .set_desired(DesiredState::connected("R1"))
            .await
            .unwrap();

        assert_eq!(handle.ops(), vec!["connect_reader"]);
        assert_eq!(handle.calls()[0].args, "R1 at loc_adv");
    }

    #[tokio::test]
    async fn busy_discovery_is_aborted_before_restarting() {
        let (reconciler, store, handle, _tasks) = reconciler();
        store.update_connection(|c| {
            c.status = ConnectionStatus::NotConnected;
            c.discovery_error = Some(ERR_DISCOVERY_BUSY.to_string());
        });

        reconciler
            .set_desired(DesiredState::discovering(DiscoveryMethod::BluetoothScan, true))
            .await
            .unwrap();

        assert_eq!(
            handle.ops(),
            vec!["abort_discover_readers", "discover_readers"]
        );
    }

    #[tokio::test]
    async fn waits_for_initialization() {
        let (reconciler, _store, handle, _tasks) = reconciler();

        reconciler
            .set_desired(DesiredState::connected("R1"))
            .await
            .unwrap();

        assert!(handle.ops().is_empty());
    }

    #[tokio::test]
    async fn live_session_restarts_from_disconnect_for_a_discovery_target() {
        let (reconciler, store, handle, _tasks) = reconciler();
        store.update_connection(|c| {
            c.status = ConnectionStatus::Connected;
            c.reader = Some(discovered("R1", None));
        });

        reconciler
            .set_desired(DesiredState::discovering(DiscoveryMethod::Internet, false))
            .await
            .unwrap();

        assert_eq!(handle.ops(), vec!["disconnect_reader"]);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_backoff_then_surfaces_the_original_error() {
        let (reconciler, store, handle, _tasks) = reconciler();
        store.update_connection(|c| c.status = ConnectionStatus::NotConnected);
        for _ in 0..6 {
            handle.fail_next("discover_readers", DriverError::new("adapter powered off"));
        }

        let before = tokio::time::Instant::now();
        let err = reconciler
            .set_desired(DesiredState::discovering(DiscoveryMethod::BluetoothScan, false))
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "adapter powered off");
        assert_eq!(handle.ops(), vec!["discover_readers"; 6]);
        // 500ms, 1s, 2s, 4s, 8s between the six attempts.
        assert_eq!(before.elapsed(), std::time::Duration::from_millis(15_500));
        assert_eq!(
            store.connection().discovery_error.as_deref(),
            Some("adapter powered off")
        );
    }

    #[tokio::test]
    async fn transient_refusal_recovers_on_a_later_attempt() {
        let (reconciler, store, handle, _tasks) = reconciler();
        store.update_connection(|c| c.status = ConnectionStatus::NotConnected);
        handle.fail_next("discover_readers", DriverError::new("adapter busy"));

        tokio::time::pause();
        reconciler
            .set_desired(DesiredState::discovering(DiscoveryMethod::BluetoothScan, true))
            .await
            .unwrap();

        assert_eq!(handle.ops(), vec!["discover_readers", "discover_readers"]);
        assert_eq!(store.connection().status, ConnectionStatus::Discovering);
        assert!(store.connection().discovery_error.is_none());
    }

    #[tokio::test]
    async fn overlapping_pass_requests_are_dropped() {
        let (reconciler, store, handle, _tasks) = reconciler();
        store.update_connection(|c| c.status = ConnectionStatus::Connected);
        reconciler.pass_active.store(true, Ordering::Release);

        reconciler
            .set_desired(DesiredState::not_connected())
            .await
            .unwrap();
        assert!(handle.ops().is_empty());

        reconciler.pass_active.store(false, Ordering::Release);
        reconciler.reconcile_with_retry().await.unwrap();
        assert_eq!(handle.ops(), vec!["disconnect_reader"]);
    }

    #[tokio::test]
    async fn watcher_reconciles_on_connection_changes() {
        let (reconciler, store, mut handle, mut tasks) = reconciler();
        store.update_connection(|c| c.status = ConnectionStatus::NotConnected);
        reconciler.spawn_watcher(&mut tasks);

        // Park a connect target before any reader is known.
        reconciler
            .set_desired(DesiredState::connected("R1"))
            .await
            .unwrap();
        assert_eq!(handle.next_call().await.unwrap().op, "discover_readers");

        store.update_connection(|c| c.readers = vec![discovered("R1", Some("loc_1"))]);

        let call = handle.next_call().await.unwrap();
        assert_eq!(call.op, "connect_reader");
        assert_eq!(call.args, "R1 at loc_1");
    }
}
