//! Network layer configuration.
//!
//! Defaults match the field deployment; tests and simulations scale the
//! periods down. Every knob can also be overridden from the environment
//! (`TL_*_MS` variables) via [`NetConfig::from_env`].

use std::time::Duration;

use treelink_core::env::env_get;

/// Timing and capacity knobs for one node.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Base delay before an unlinked node starts (or retries) a locate round.
    pub period_locate: Duration,

    /// Random extra delay on top of `period_locate`.
    pub window_locate: Duration,

    /// How long a locating node collects link proposals.
    pub timeout_locate: Duration,

    /// How long a proposer waits for its link proposal to be confirmed.
    pub timeout_propose_link: Duration,

    /// How long to wait for a status reply from upstream before blackout.
    pub timeout_status: Duration,

    /// Downstream link expiry when no status arrives.
    pub timeout_link_decay: Duration,

    /// Base period between upstream status probes.
    pub period_up_status: Duration,

    /// Random extra delay on top of `period_up_status`.
    pub window_up_status: Duration,

    /// Upper bound of the random delay before each transmission.
    pub window_send: Duration,

    /// Pause between broadcasting blackout and restarting the node.
    pub blackout_pause: Duration,

    /// Outbound frame queue capacity.
    pub outbound_capacity: usize,

    /// Per-application inbound queue capacity.
    pub inbound_capacity: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            period_locate: Duration::from_secs(25),
            window_locate: Duration::from_secs(5),
            timeout_locate: Duration::from_secs(1),
            timeout_propose_link: Duration::from_secs(2),
            timeout_status: Duration::from_secs(1),
            timeout_link_decay: Duration::from_secs(30),
            period_up_status: Duration::from_secs(15),
            window_up_status: Duration::from_secs(5),
            window_send: Duration::from_millis(10),
            blackout_pause: Duration::from_secs(2),
            outbound_capacity: 16,
            inbound_capacity: 6,
        }
    }
}

impl NetConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let d = NetConfig::default();
        let ms = |key, dflt: Duration| {
            Duration::from_millis(env_get(key, dflt.as_millis() as u64))
        };
        Self {
            period_locate: ms("TL_PERIOD_LOCATE_MS", d.period_locate),
            window_locate: ms("TL_WINDOW_LOCATE_MS", d.window_locate),
            timeout_locate: ms("TL_TIMEOUT_LOCATE_MS", d.timeout_locate),
            timeout_propose_link: ms("TL_TIMEOUT_PROPOSE_LINK_MS", d.timeout_propose_link),
            timeout_status: ms("TL_TIMEOUT_STATUS_MS", d.timeout_status),
            timeout_link_decay: ms("TL_TIMEOUT_LINK_DECAY_MS", d.timeout_link_decay),
            period_up_status: ms("TL_PERIOD_UP_STATUS_MS", d.period_up_status),
            window_up_status: ms("TL_WINDOW_UP_STATUS_MS", d.window_up_status),
            window_send: ms("TL_WINDOW_SEND_MS", d.window_send),
            blackout_pause: ms("TL_BLACKOUT_PAUSE_MS", d.blackout_pause),
            outbound_capacity: env_get("TL_OUTBOUND_CAPACITY", d.outbound_capacity),
            inbound_capacity: env_get("TL_INBOUND_CAPACITY", d.inbound_capacity),
        }
    }

    /// Uniformly scale every period and timeout; simulations run the
    /// protocol at a fraction of field timing.
    pub fn scaled_down(mut self, divisor: u32) -> Self {
        self.period_locate /= divisor;
        self.window_locate /= divisor;
        self.timeout_locate /= divisor;
        self.timeout_propose_link /= divisor;
        self.timeout_status /= divisor;
        self.timeout_link_decay /= divisor;
        self.period_up_status /= divisor;
        self.window_up_status /= divisor;
        self.window_send /= divisor;
        self.blackout_pause /= divisor;
        self
    }

    /// Print the effective configuration to stderr.
    pub fn dump(&self) {
        eprintln!("treelink network configuration:");
        eprintln!("  period_locate:        {:?}", self.period_locate);
        eprintln!("  window_locate:        {:?}", self.window_locate);
        eprintln!("  timeout_locate:       {:?}", self.timeout_locate);
        eprintln!("  timeout_propose_link: {:?}", self.timeout_propose_link);
        eprintln!("  timeout_status:       {:?}", self.timeout_status);
        eprintln!("  timeout_link_decay:   {:?}", self.timeout_link_decay);
        eprintln!("  period_up_status:     {:?}", self.period_up_status);
        eprintln!("  window_up_status:     {:?}", self.window_up_status);
        eprintln!("  window_send:          {:?}", self.window_send);
        eprintln!("  blackout_pause:       {:?}", self.blackout_pause);
        eprintln!("  outbound_capacity:    {}", self.outbound_capacity);
        eprintln!("  inbound_capacity:     {}", self.inbound_capacity);
    }
}

/// `base` plus a uniform random draw from `[0, window)`.
pub fn jittered(base: Duration, window: Duration) -> Duration {
    use rand::Rng;
    if window.is_zero() {
        return base;
    }
    let extra = rand::thread_rng().gen_range(0..window.as_micros() as u64);
    base + Duration::from_micros(extra)
}
