//! Real-time priority for convolution worker threads
//!
//! Each non-inline convolution level runs on its own thread whose scheduling
//! priority decreases with partition size. Elevation is best effort: when the
//! process lacks realtime privileges the worker keeps default scheduling and
//! the failure is logged, never fatal.
//!
//! Platform support:
//! - Linux: SCHED_FIFO / SCHED_RR via `pthread_setschedparam` (needs
//!   CAP_SYS_NICE or an rtprio limit)
//! - macOS: pthread scheduling plus the Mach time-constraint policy, with the
//!   level period as the constraint window
//! - elsewhere: no-op, reported as unsupported

/// Scheduling policy for level workers, mapped to the native policy on unix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedPolicy {
    /// First-in first-out realtime scheduling (SCHED_FIFO).
    #[default]
    Fifo,
    /// Round-robin realtime scheduling (SCHED_RR).
    RoundRobin,
    /// Default time-sharing scheduling; priority values are ignored.
    Other,
}

#[cfg(unix)]
impl SchedPolicy {
    fn native(self) -> libc::c_int {
        match self {
            SchedPolicy::Fifo => libc::SCHED_FIFO,
            SchedPolicy::RoundRobin => libc::SCHED_RR,
            SchedPolicy::Other => libc::SCHED_OTHER,
        }
    }
}

/// Valid priority range for a policy, `(min, max)`.
pub fn priority_range(policy: SchedPolicy) -> (i32, i32) {
    #[cfg(unix)]
    unsafe {
        let native = policy.native();
        (
            libc::sched_get_priority_min(native),
            libc::sched_get_priority_max(native),
        )
    }
    #[cfg(not(unix))]
    {
        let _ = policy;
        (0, 0)
    }
}

/// Apply realtime scheduling to the current thread.
///
/// `period_ns` is the thread's nominal activation period (one level tick);
/// it parameterizes the Mach time-constraint policy on macOS and is unused
/// elsewhere. Returns false when elevation failed.
pub fn set_realtime(policy: SchedPolicy, priority: i32, period_ns: f64) -> bool {
    platform_set(policy, priority, period_ns)
}

#[cfg(all(unix, not(target_os = "macos")))]
fn platform_set(policy: SchedPolicy, priority: i32, _period_ns: f64) -> bool {
    if policy == SchedPolicy::Other {
        return true;
    }
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let rv = unsafe { libc::pthread_setschedparam(libc::pthread_self(), policy.native(), &param) };
    if rv == 0 {
        log::debug!("worker thread scheduled {:?} priority {}", policy, priority);
        true
    } else {
        log::debug!(
            "pthread_setschedparam({:?}, {}) failed: {}",
            policy,
            priority,
            rv
        );
        false
    }
}

#[cfg(target_os = "macos")]
fn platform_set(policy: SchedPolicy, priority: i32, period_ns: f64) -> bool {
    // Fixed-priority, non-timeshare thread, then a time constraint sized to
    // the level period. pthread priorities play no role on this OS.
    const THREAD_EXTENDED_POLICY: u32 = 1;
    const THREAD_EXTENDED_POLICY_COUNT: u32 = 1;
    const THREAD_TIME_CONSTRAINT_POLICY: u32 = 2;
    const THREAD_TIME_CONSTRAINT_POLICY_COUNT: u32 = 4;
    const THREAD_PRECEDENCE_POLICY: u32 = 3;
    const THREAD_PRECEDENCE_POLICY_COUNT: u32 = 1;

    #[repr(C)]
    struct ThreadExtendedPolicy {
        timeshare: i32,
    }

    #[repr(C)]
    struct ThreadPrecedencePolicy {
        importance: i32,
    }

    #[repr(C)]
    struct ThreadTimeConstraintPolicy {
        period: u32,
        computation: u32,
        constraint: u32,
        preemptible: i32,
    }

    #[repr(C)]
    struct MachTimebaseInfo {
        numer: u32,
        denom: u32,
    }

    extern "C" {
        fn mach_thread_self() -> u32;
        fn mach_timebase_info(info: *mut MachTimebaseInfo) -> i32;
        fn thread_policy_set(thread: u32, flavor: u32, policy_info: *const u8, count: u32) -> i32;
    }

    let _ = policy;
    let thread = unsafe { mach_thread_self() };

    let tep = ThreadExtendedPolicy { timeshare: 0 };
    unsafe {
        thread_policy_set(
            thread,
            THREAD_EXTENDED_POLICY,
            &tep as *const _ as *const u8,
            THREAD_EXTENDED_POLICY_COUNT,
        );
    }

    let tpp = ThreadPrecedencePolicy {
        importance: 57 + priority.min(3),
    };
    unsafe {
        thread_policy_set(
            thread,
            THREAD_PRECEDENCE_POLICY,
            &tpp as *const _ as *const u8,
            THREAD_PRECEDENCE_POLICY_COUNT,
        );
    }

    if period_ns <= 0.0 {
        return true;
    }

    let mut timebase = MachTimebaseInfo { numer: 0, denom: 0 };
    if unsafe { mach_timebase_info(&mut timebase) } != 0 || timebase.numer == 0 {
        log::debug!("mach_timebase_info failed, skipping time constraint");
        return true;
    }

    let ns_to_abs = |ns: f64| -> u32 { (ns * timebase.denom as f64 / timebase.numer as f64) as u32 };
    let ttcp = ThreadTimeConstraintPolicy {
        period: ns_to_abs(period_ns),
        computation: ns_to_abs(period_ns * 0.3),
        constraint: ns_to_abs(period_ns * 0.9),
        preemptible: 1,
    };
    let rv = unsafe {
        thread_policy_set(
            thread,
            THREAD_TIME_CONSTRAINT_POLICY,
            &ttcp as *const _ as *const u8,
            THREAD_TIME_CONSTRAINT_POLICY_COUNT,
        )
    };
    if rv != 0 {
        log::debug!("thread_policy_set(time constraint) failed: {}", rv);
    }
    rv == 0
}

#[cfg(not(unix))]
fn platform_set(_policy: SchedPolicy, _priority: i32, _period_ns: f64) -> bool {
    log::debug!("realtime worker scheduling not supported on this platform");
    false
}
