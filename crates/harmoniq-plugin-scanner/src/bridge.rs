//! Hands worker replies from the transport thread to the blocked scan call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Re-check cadence for the cancellation token while a scan is waiting.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shorter poll intervals are raised to this so a wait never spins.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Host-wide "stop scanning" switch handed to the coordinator.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Why a blocked wait returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeReason {
    Reply(Vec<u8>),
    ConnectionLost,
    Cancelled,
    TimedOut,
}

#[derive(Debug, Default)]
struct BridgeState {
    generation: u64,
    armed: bool,
    got_response: bool,
    connection_lost: bool,
    reply: Option<Vec<u8>>,
}

/// Monitor shared by the coordinator and the transport's reader thread.
///
/// Each worker gets its own generation; anything a retired worker delivers
/// is dropped, as is any reply that arrives while no request is armed.
#[derive(Debug, Default)]
pub struct ReplyBridge {
    state: Mutex<BridgeState>,
    signal: Condvar,
}

impl ReplyBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Starts a fresh generation and returns the endpoint a new worker's
    /// transport delivers into.
    pub fn open_generation(self: &Arc<Self>) -> BridgeEndpoint {
        let mut state = self.state.lock();
        Self::advance(&mut state);
        BridgeEndpoint {
            bridge: Arc::clone(self),
            generation: state.generation,
        }
    }

    /// Invalidates the current generation after its worker is torn down.
    pub fn retire(&self) {
        let mut state = self.state.lock();
        Self::advance(&mut state);
    }

    /// Prepares for exactly one reply. Must be called before the request is
    /// sent so a fast reply cannot be lost.
    pub fn arm(&self) {
        let mut state = self.state.lock();
        state.armed = true;
        state.got_response = false;
        state.reply = None;
    }

    /// Disarms without waiting, used when the request never left.
    pub fn disarm(&self) {
        let mut state = self.state.lock();
        state.armed = false;
        state.got_response = false;
        state.reply = None;
    }

    /// Blocks until a reply, a connection loss, cancellation, or the optional
    /// deadline. Cancellation is re-checked at least every `poll_interval`.
    pub fn wait(
        &self,
        cancel: &CancellationToken,
        poll_interval: Duration,
        deadline: Option<Instant>,
    ) -> WakeReason {
        let poll_interval = clamp_poll_interval(poll_interval);
        let mut state = self.state.lock();
        loop {
            if cancel.is_cancelled() {
                state.armed = false;
                return WakeReason::Cancelled;
            }
            if state.connection_lost {
                state.armed = false;
                state.reply = None;
                return WakeReason::ConnectionLost;
            }
            if state.got_response {
                state.armed = false;
                state.got_response = false;
                return WakeReason::Reply(state.reply.take().unwrap_or_default());
            }

            let mut timeout = poll_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    state.armed = false;
                    return WakeReason::TimedOut;
                }
                timeout = timeout.min(deadline - now);
            }
            self.signal.wait_for(&mut state, timeout);
        }
    }

    fn advance(state: &mut BridgeState) {
        state.generation = state.generation.wrapping_add(1);
        state.armed = false;
        state.got_response = false;
        state.connection_lost = false;
        state.reply = None;
    }
}

fn clamp_poll_interval(poll_interval: Duration) -> Duration {
    poll_interval.max(MIN_POLL_INTERVAL)
}

/// Transport-side handle bound to one worker generation.
#[derive(Debug, Clone)]
pub struct BridgeEndpoint {
    bridge: Arc<ReplyBridge>,
    generation: u64,
}

impl BridgeEndpoint {
    pub fn deliver(&self, payload: Vec<u8>) {
        let mut state = self.bridge.state.lock();
        if state.generation != self.generation {
            tracing::debug!("dropping reply from retired scan worker");
            return;
        }
        if !state.armed || state.got_response {
            tracing::debug!("dropping unsolicited scan worker reply");
            return;
        }
        state.reply = Some(payload);
        state.got_response = true;
        self.bridge.signal.notify_one();
    }

    pub fn connection_lost(&self) {
        let mut state = self.bridge.state.lock();
        if state.generation != self.generation {
            return;
        }
        state.connection_lost = true;
        state.reply = None;
        self.bridge.signal.notify_one();
    }
}
