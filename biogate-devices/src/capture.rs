//! Per-device capture loop.
//!
//! The loop owns nothing but a handle snapshot; all device state is reached
//! through the slot's mutex, one iteration at a time. Shutdown is checked with
//! priority both while waiting for the next tick and while a driver call is in
//! flight, so a stop request never waits on a slow device.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::driver::{with_timeout, ConnectionHandle};
use crate::error::DriverError;
use crate::events::DeviceEvent;
use crate::registry::{DeviceSlot, DeviceState, Shared};

pub(crate) struct CaptureTask {
    id: u64,
    shutdown: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

impl CaptureTask {
    /// A loop that already returned no longer owns the device.
    pub(crate) fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub(crate) fn signal(&self) {
        let _ = self.shutdown.try_send(());
    }

    /// Signals the loop and waits for it to exit.
    pub(crate) async fn stop(self) {
        self.signal();
        if let Err(err) = self.join.await {
            if err.is_panic() {
                log::error!("capture loop panicked: {}", err);
            }
        }
    }

    /// Signals the loop without waiting; used while the caller holds the device lock.
    pub(crate) fn cancel(self) {
        self.signal();
    }
}

pub(crate) fn spawn(
    shared: Arc<Shared>,
    slot: Arc<DeviceSlot>,
    handle: ConnectionHandle,
) -> CaptureTask {
    let id = shared.next_task_id();
    let (shutdown, rx) = mpsc::channel(1);
    let join = tokio::spawn(run(shared, slot, handle, id, rx));
    CaptureTask { id, shutdown, join }
}

enum Step {
    Continue,
    Stop,
}

async fn run(
    shared: Arc<Shared>,
    slot: Arc<DeviceSlot>,
    mut handle: ConnectionHandle,
    task_id: u64,
    mut shutdown: mpsc::Receiver<()>,
) {
    let device_id = handle.device_id.clone();
    let limit = shared.config.driver_timeout();
    let mut ticker = tokio::time::interval(shared.config.capture_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut failures = 0u32;

    log::debug!("capture loop for {} running", device_id);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            r = with_timeout(limit, slot.driver.capture_frame(&handle)) => r,
        };

        match result {
            Ok(frame) => {
                failures = 0;
                let mut state = slot.state.lock().await;
                if shared.record_frame(&mut state, &handle, frame).is_none() {
                    // connection replaced underneath us
                    break;
                }
            }
            Err(err) => {
                failures += 1;
                let fatal = err.is_connection_fault()
                    || failures >= shared.config.max_consecutive_failures.max(1);
                let step = handle_failure(&shared, &slot, &handle, task_id, &err, fatal).await;
                if let Step::Stop = step {
                    break;
                }
                if fatal {
                    match reconnect(&shared, &slot, &mut shutdown).await {
                        Some(fresh) => {
                            handle = fresh;
                            failures = 0;
                        }
                        None => {
                            release_task(&slot, task_id).await;
                            break;
                        }
                    }
                }
            }
        }
    }
    log::debug!("capture loop for {} exited", device_id);
}

async fn handle_failure(
    shared: &Shared,
    slot: &DeviceSlot,
    handle: &ConnectionHandle,
    task_id: u64,
    err: &DriverError,
    fatal: bool,
) -> Step {
    let mut state = slot.state.lock().await;
    if state.handle.as_ref() != Some(handle) {
        return Step::Stop;
    }
    state.note_error(err);
    if let Some(stream) = state.stream.as_mut() {
        stream.record_drop();
    }
    shared.emit(DeviceEvent::Fault {
        device_id: state.config.id.clone(),
        error: err.to_string(),
        error_count: state.error_count,
        fatal,
    });
    if fatal {
        log::warn!("device {} connection fault: {}", state.config.id, err);
        if let Some(stale) = state.fault() {
            let _ = with_timeout(shared.config.driver_timeout(), slot.driver.disconnect(&stale)).await;
        }
        if !shared.config.reconnect.enabled {
            // give up the slot under the same lock that marked the fault
            forget_task(&mut state, task_id);
            return Step::Stop;
        }
    } else {
        log::debug!("device {} dropped a frame: {}", state.config.id, err);
    }
    Step::Continue
}

/// Re-opens the connection with backoff. Returns the new handle with a
/// streaming stream, or `None` if the policy is off, exhausted or shutdown
/// was requested.
async fn reconnect(
    shared: &Shared,
    slot: &DeviceSlot,
    shutdown: &mut mpsc::Receiver<()>,
) -> Option<ConnectionHandle> {
    let policy = &shared.config.reconnect;
    if !policy.enabled {
        return None;
    }
    for attempt in 1..=policy.max_attempts {
        tokio::select! {
            biased;
            _ = shutdown.recv() => return None,
            _ = tokio::time::sleep(policy.backoff(attempt)) => {}
        }
        let mut state = slot.state.lock().await;
        if !state.active || !matches!(shutdown.try_recv(), Err(TryRecvError::Empty)) {
            return None;
        }
        log::info!(
            "device {} reconnect attempt {}/{}",
            state.config.id,
            attempt,
            policy.max_attempts
        );
        if shared.open(slot.driver.as_ref(), &mut state).await.is_ok() {
            if let Some(stream) = state.stream.as_mut() {
                stream.set_streaming(true);
            }
            return state.handle.clone();
        }
    }
    None
}

/// The loop is ending on its own; forget its task so the device can be restarted.
async fn release_task(slot: &DeviceSlot, task_id: u64) {
    forget_task(&mut *slot.state.lock().await, task_id);
}

fn forget_task(state: &mut DeviceState, task_id: u64) {
    if state.capture.as_ref().map(|t| t.id) == Some(task_id) {
        state.capture = None;
    }
}
