pub const DEFAULT_HALF_WIDTH_SECS: u32 = 1_800;

/// Accepts timestamps strictly inside `now ± half_width`.
///
/// There is no stored nonce or sequence state. A device whose clock has never
/// been synchronised (`now == 0`) rejects everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayWindow {
    pub half_width_secs: u32,
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self {
            half_width_secs: DEFAULT_HALF_WIDTH_SECS,
        }
    }
}

impl ReplayWindow {
    pub fn new(half_width_secs: u32) -> Self {
        Self { half_width_secs }
    }

    pub fn is_fresh(&self, embedded_unix_time: u32, now: u32) -> bool {
        if now == 0 {
            return false;
        }
        let embedded = i64::from(embedded_unix_time);
        let now = i64::from(now);
        let half_width = i64::from(self.half_width_secs);
        now - half_width < embedded && embedded < now + half_width
    }
}

pub fn is_fresh(embedded_unix_time: u32, now: u32) -> bool {
    ReplayWindow::default().is_fresh(embedded_unix_time, now)
}
