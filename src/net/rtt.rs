use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use hashbrown::HashMap;

/// Correlates outbound ping codes with their acknowledgements and keeps a
/// rolling window of round-trip samples.
///
/// Outbound codes live in a bounded circular map: when it is full the oldest
/// in-flight entry is silently overwritten, and re-recording a code updates
/// its send time in place. Acknowledgements for unknown codes are counted
/// and otherwise ignored; the ack was simply stale.
///
/// The helper is called from both the send and the receive path and is
/// internally synchronized by one short critical section.
pub struct RoundTripTime {
    inner: Mutex<RttState>,
}

struct RttState {
    pending: HashMap<u16, Instant>,
    order: VecDeque<u16>,
    capacity: usize,
    samples: VecDeque<f64>,
    window: usize,
    sum: f64,
    sum_sq: f64,
    last: Option<Duration>,
    stale: usize,
}

impl RoundTripTime {
    /// `capacity` bounds the in-flight outbound pings, `window` the rolling
    /// sample count behind the smoothed statistics.
    pub fn new(capacity: usize, window: usize) -> RoundTripTime {
        assert!(capacity > 0, "In-flight capacity must be positive");
        assert!(window > 0, "Sample window must be positive");

        RoundTripTime {
            inner: Mutex::new(RttState {
                pending: HashMap::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
                capacity,
                samples: VecDeque::with_capacity(window),
                window,
                sum: 0.0,
                sum_sq: 0.0,
                last: None,
                stale: 0,
            }),
        }
    }

    /// Records an outbound ping with the given send time.
    pub fn record_outbound(&self, code: u16, now: Instant) {
        let mut state = self.lock();

        if let Some(sent) = state.pending.get_mut(&code) {
            *sent = now;
            return;
        }

        if state.order.len() == state.capacity {
            if let Some(oldest) = state.order.pop_front() {
                state.pending.remove(&oldest);
            }
        }

        state.order.push_back(code);
        state.pending.insert(code, now);
    }

    /// Completes the round trip for `code`. Returns false when the code was
    /// never recorded outbound (or was already evicted), which leaves the
    /// statistics untouched.
    pub fn record_inbound(&self, code: u16, now: Instant) -> bool {
        let mut state = self.lock();

        let sent = match state.pending.remove(&code) {
            Some(sent) => sent,
            None => {
                state.stale += 1;
                return false;
            }
        };

        if let Some(position) = state.order.iter().position(|&pending| pending == code) {
            state.order.remove(position);
        }

        let sample = now.saturating_duration_since(sent);
        state.push_sample(sample);

        true
    }

    /// Mean round trip over the sample window.
    pub fn smoothed_rtt(&self) -> Duration {
        let state = self.lock();
        if state.samples.is_empty() {
            return Duration::from_secs(0);
        }

        Duration::from_secs_f64(state.sum / state.samples.len() as f64)
    }

    /// Population variance over the sample window, in seconds squared.
    pub fn variance(&self) -> f64 {
        let state = self.lock();
        let count = state.samples.len() as f64;
        if count == 0.0 {
            return 0.0;
        }

        let mean = state.sum / count;
        (state.sum_sq / count - mean * mean).max(0.0)
    }

    /// The most recent completed round trip.
    pub fn last_sample(&self) -> Option<Duration> {
        self.lock().last
    }

    /// Number of samples currently in the window.
    pub fn samples(&self) -> usize {
        self.lock().samples.len()
    }

    /// Number of acknowledgements that arrived without a matching outbound
    /// ping.
    pub fn stale_acks(&self) -> usize {
        self.lock().stale
    }

    /// Number of pings currently awaiting acknowledgement.
    pub fn in_flight(&self) -> usize {
        self.lock().pending.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<RttState> {
        self.inner.lock().expect("Round trip state lock poisoned")
    }
}

impl RttState {
    fn push_sample(&mut self, sample: Duration) {
        let seconds = sample.as_secs_f64();

        if self.samples.len() == self.window {
            if let Some(evicted) = self.samples.pop_front() {
                self.sum -= evicted;
                self.sum_sq -= evicted * evicted;
            }
        }

        self.samples.push_back(seconds);
        self.sum += seconds;
        self.sum_sq += seconds * seconds;
        self.last = Some(sample);
    }
}
