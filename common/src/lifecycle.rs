use tracing::info;

use crate::{
    format::QueryBody,
    timers::{Task, TaskQueue},
};

/// Platform reset reasons, numbered the way the boot ROM reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetCause {
    PowerOn,
    Watchdog,
    Exception,
    SoftwareWatchdog,
    SoftRestart,
    DeepSleepWake,
    ExternalReset,
}

impl ResetCause {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::PowerOn),
            1 => Some(Self::Watchdog),
            2 => Some(Self::Exception),
            3 => Some(Self::SoftwareWatchdog),
            4 => Some(Self::SoftRestart),
            5 => Some(Self::DeepSleepWake),
            6 => Some(Self::ExternalReset),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::PowerOn => 0,
            Self::Watchdog => 1,
            Self::Exception => 2,
            Self::SoftwareWatchdog => 3,
            Self::SoftRestart => 4,
            Self::DeepSleepWake => 5,
            Self::ExternalReset => 6,
        }
    }

    pub fn is_fault(self) -> bool {
        matches!(
            self,
            Self::Watchdog | Self::Exception | Self::SoftwareWatchdog
        )
    }
}

/// What the platform retained across the last reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetInfo {
    pub cause: ResetCause,
    pub exception_cause: u32,
    pub epc1: u32,
    pub excvaddr: u32,
}

impl ResetInfo {
    pub fn new(cause: ResetCause) -> Self {
        Self {
            cause,
            exception_cause: 0,
            epc1: 0,
            excvaddr: 0,
        }
    }
}

/// Body of the `reset_reason` reply.
pub fn describe_reset(info: Option<&ResetInfo>) -> String {
    let Some(info) = info else {
        return "reason=-1".to_string();
    };

    let mut body = QueryBody::new().field("reason", info.cause.code());
    if info.cause.is_fault() {
        body = body
            .field("exccause", info.exception_cause)
            .field("epc1", format!("0x{:08x}", info.epc1))
            .field("excvaddr", format!("0x{:08x}", info.excvaddr));
    }
    body.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootKind {
    /// Restarted by the device itself; a session was already configured.
    Fast,
    /// Power-on, external reset or no report at all.
    Cold,
}

impl BootKind {
    pub fn classify(info: Option<&ResetInfo>) -> Self {
        match info.map(|info| info.cause) {
            None | Some(ResetCause::PowerOn) | Some(ResetCause::ExternalReset) => Self::Cold,
            Some(_) => Self::Fast,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootTimings {
    pub fast_sample_ms: u64,
    pub config_ms: u64,
    pub fallback_sample_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Booting,
    ConfigMode,
    SampleModePending,
    Sampling,
}

#[derive(Debug)]
pub struct Lifecycle {
    state: LifecycleState,
    boot_kind: Option<BootKind>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Booting,
            boot_kind: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn boot_kind(&self) -> Option<BootKind> {
        self.boot_kind
    }

    /// Arms the boot transition timers. Only the first call per boot counts.
    pub fn boot(
        &mut self,
        kind: BootKind,
        timings: BootTimings,
        queue: &mut TaskQueue<Task>,
        now_ms: u64,
    ) -> bool {
        if self.boot_kind.is_some() {
            return false;
        }
        self.boot_kind = Some(kind);

        match kind {
            BootKind::Fast => {
                info!("fast boot, sample mode in {} ms", timings.fast_sample_ms);
                queue.disarm(Task::ConfigMode);
                queue.arm(Task::SampleMode, now_ms, timings.fast_sample_ms);
                self.state = LifecycleState::SampleModePending;
            }
            BootKind::Cold => {
                info!(
                    "cold boot, config mode in {} ms, sample mode in {} ms",
                    timings.config_ms, timings.fallback_sample_ms
                );
                queue.arm(Task::ConfigMode, now_ms, timings.config_ms);
                queue.arm(Task::SampleMode, now_ms, timings.fallback_sample_ms);
            }
        }
        true
    }

    pub fn enter_config_mode(&mut self) -> bool {
        if self.state != LifecycleState::Booting || self.boot_kind != Some(BootKind::Cold) {
            return false;
        }
        self.state = LifecycleState::ConfigMode;
        true
    }

    /// Terminal for the boot epoch. Returns `false` when already sampling.
    pub fn enter_sampling(&mut self, queue: &mut TaskQueue<Task>) -> bool {
        if self.state == LifecycleState::Sampling || self.boot_kind.is_none() {
            return false;
        }
        queue.disarm(Task::ConfigMode);
        queue.disarm(Task::SampleMode);
        self.state = LifecycleState::Sampling;
        true
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::meter::MeterDialect;

    #[test]
    fn classifies_reset_causes() {
        assert_eq!(BootKind::classify(None), BootKind::Cold);
        for (code, kind) in [
            (0, BootKind::Cold),
            (1, BootKind::Fast),
            (2, BootKind::Fast),
            (3, BootKind::Fast),
            (4, BootKind::Fast),
            (6, BootKind::Cold),
        ] {
            let info = ResetInfo::new(ResetCause::from_code(code).unwrap());
            assert_eq!(BootKind::classify(Some(&info)), kind, "code {code}");
        }
        assert_eq!(ResetCause::from_code(9), None);
    }

    #[test]
    fn cold_boot_arms_both_timers_once() {
        for dialect in [MeterDialect::Kmp, MeterDialect::En61107, MeterDialect::Pulse] {
            let mut queue = TaskQueue::new();
            let mut lifecycle = Lifecycle::new();
            assert!(lifecycle.boot(BootKind::Cold, dialect.boot_timings(), &mut queue, 0));
            assert!(!lifecycle.boot(BootKind::Fast, dialect.boot_timings(), &mut queue, 0));

            assert_eq!(queue.armed_len(), 2);
            let config = queue.deadline_of(Task::ConfigMode).unwrap();
            let sample = queue.deadline_of(Task::SampleMode).unwrap();
            assert!(sample >= config + 100_000, "{dialect:?}");
        }
    }

    #[test]
    fn fast_boot_arms_only_sample_mode() {
        let mut queue = TaskQueue::new();
        let mut lifecycle = Lifecycle::new();
        lifecycle.boot(BootKind::Fast, MeterDialect::Kmp.boot_timings(), &mut queue, 500);

        assert_eq!(queue.armed_len(), 1);
        assert!(!queue.is_armed(Task::ConfigMode));
        assert_eq!(queue.deadline_of(Task::SampleMode), Some(16_500));
        assert_eq!(lifecycle.state(), LifecycleState::SampleModePending);
        assert!(!lifecycle.enter_config_mode());
    }

    #[test]
    fn sampling_is_terminal_and_idempotent() {
        let mut queue = TaskQueue::new();
        let mut lifecycle = Lifecycle::new();
        assert!(!lifecycle.enter_sampling(&mut queue));

        lifecycle.boot(BootKind::Cold, MeterDialect::Pulse.boot_timings(), &mut queue, 0);
        assert!(lifecycle.enter_config_mode());
        assert_eq!(lifecycle.state(), LifecycleState::ConfigMode);

        assert!(lifecycle.enter_sampling(&mut queue));
        assert_eq!(queue.armed_len(), 0);
        assert!(!lifecycle.enter_sampling(&mut queue));
        assert!(!lifecycle.enter_config_mode());
        assert_eq!(lifecycle.state(), LifecycleState::Sampling);
    }

    #[test]
    fn describes_reset_reason() {
        assert_eq!(describe_reset(None), "reason=-1");
        assert_eq!(
            describe_reset(Some(&ResetInfo::new(ResetCause::ExternalReset))),
            "reason=6"
        );
        let fault = ResetInfo {
            cause: ResetCause::Exception,
            exception_cause: 28,
            epc1: 0x4020_1a2b,
            excvaddr: 0,
        };
        assert_eq!(
            describe_reset(Some(&fault)),
            "reason=2&exccause=28&epc1=0x40201a2b&excvaddr=0x00000000"
        );
    }
}
