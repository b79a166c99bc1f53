//! Admission control for background work.
//!
//! Every background cycle asks for credits before issuing I/O. A denial is
//! not an error: the engine backs off for
//! [`ADMISSION_BACKOFF_MS`](drivecap_shared::constants::scheduling::ADMISSION_BACKOFF_MS)
//! and tries again. Credits go back to the scheduler when the returned
//! [`AdmissionPermit`] is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use drivecap_shared::constants::scheduling::ADMISSION_BACKOFF_MS;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Background work class. Classes hold independent credit pools so one
/// engine cannot starve the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundClass {
    Zero,
    Sniff,
    VerifyInvalidate,
}

impl BackgroundClass {
    pub const ALL: [BackgroundClass; 3] = [
        BackgroundClass::Zero,
        BackgroundClass::Sniff,
        BackgroundClass::VerifyInvalidate,
    ];

    fn slot(self) -> usize {
        match self {
            BackgroundClass::Zero => 0,
            BackgroundClass::Sniff => 1,
            BackgroundClass::VerifyInvalidate => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackgroundClass::Zero => "zero",
            BackgroundClass::Sniff => "sniff",
            BackgroundClass::VerifyInvalidate => "verify_invalidate",
        }
    }
}

/// Credits asked for by one background cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditRequest {
    pub class: BackgroundClass,
    /// 1 (lowest) to 10 (highest).
    pub priority: u32,
    pub cpu_credits: u32,
    pub io_credits: u32,
}

/// Decides whether background work may run now.
pub trait Scheduler: Send + Sync {
    fn request(&self, request: &CreditRequest) -> bool;

    fn release(&self, request: &CreditRequest);

    /// A foreground request started.
    fn foreground_started(&self) {}

    /// A foreground request finished.
    fn foreground_finished(&self) {}
}

/// Per-class credit settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassCredits {
    pub priority: u32,
    pub cpu_credits: u32,
    pub io_credits: u32,
}

/// Admission settings for the three background classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionOptions {
    pub zero: ClassCredits,
    pub sniff: ClassCredits,
    pub verify_invalidate: ClassCredits,
    /// Delay before a denied engine asks again.
    pub backoff_ms: u64,
}

impl Default for AdmissionOptions {
    fn default() -> Self {
        Self {
            zero: ClassCredits {
                priority: 5,
                cpu_credits: 1,
                io_credits: 1,
            },
            sniff: ClassCredits {
                priority: 2,
                cpu_credits: 1,
                io_credits: 1,
            },
            verify_invalidate: ClassCredits {
                priority: 8,
                cpu_credits: 1,
                io_credits: 1,
            },
            backoff_ms: ADMISSION_BACKOFF_MS,
        }
    }
}

impl AdmissionOptions {
    pub fn credits(&self, class: BackgroundClass) -> ClassCredits {
        match class {
            BackgroundClass::Zero => self.zero,
            BackgroundClass::Sniff => self.sniff,
            BackgroundClass::VerifyInvalidate => self.verify_invalidate,
        }
    }
}

/// Result of an admission request.
#[derive(Debug)]
pub enum Admission {
    Granted(AdmissionPermit),
    Denied,
}

/// Credits held by a running cycle; returned on drop.
pub struct AdmissionPermit {
    scheduler: Arc<dyn Scheduler>,
    request: CreditRequest,
}

impl AdmissionPermit {
    pub fn class(&self) -> BackgroundClass {
        self.request.class
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.scheduler.release(&self.request);
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("request", &self.request)
            .finish()
    }
}

/// Gate between the background engines and the drive's [`Scheduler`].
pub struct AdmissionController {
    scheduler: Arc<dyn Scheduler>,
    options: AdmissionOptions,
}

impl AdmissionController {
    pub fn new(scheduler: Arc<dyn Scheduler>, options: AdmissionOptions) -> Self {
        Self { scheduler, options }
    }

    pub fn backoff(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.options.backoff_ms)
    }

    pub fn request_permission(&self, class: BackgroundClass) -> Admission {
        let credits = self.options.credits(class);
        let request = CreditRequest {
            class,
            priority: credits.priority,
            cpu_credits: credits.cpu_credits,
            io_credits: credits.io_credits,
        };
        if self.scheduler.request(&request) {
            Admission::Granted(AdmissionPermit {
                scheduler: Arc::clone(&self.scheduler),
                request,
            })
        } else {
            tracing::trace!(class = class.as_str(), "Admission denied");
            Admission::Denied
        }
    }

    /// Mark a foreground request for the lifetime of the returned guard.
    pub fn foreground(&self) -> ForegroundGuard {
        self.scheduler.foreground_started();
        ForegroundGuard {
            scheduler: Arc::clone(&self.scheduler),
        }
    }
}

/// Foreground load marker; see [`AdmissionController::foreground`].
pub struct ForegroundGuard {
    scheduler: Arc<dyn Scheduler>,
}

impl Drop for ForegroundGuard {
    fn drop(&mut self) {
        self.scheduler.foreground_finished();
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ClassUsage {
    cpu: u32,
    io: u32,
}

/// Default scheduler.
///
/// Each class has its own credit budget. Background work is also held back
/// while foreground requests are in flight; a class tolerates more
/// foreground load the higher its priority.
#[derive(Debug)]
pub struct LoadScheduler {
    cpu_budget: u32,
    io_budget: u32,
    foreground_limit: u32,
    usage: Mutex<[ClassUsage; 3]>,
    foreground: AtomicU32,
}

impl LoadScheduler {
    /// `foreground_limit` is the in-flight foreground count at which
    /// priority-10 work is still admitted. Lower priorities get a
    /// proportionally smaller allowance.
    pub fn new(cpu_budget: u32, io_budget: u32, foreground_limit: u32) -> Self {
        Self {
            cpu_budget,
            io_budget,
            foreground_limit,
            usage: Mutex::new([ClassUsage::default(); 3]),
            foreground: AtomicU32::new(0),
        }
    }

    pub fn foreground_load(&self) -> u32 {
        self.foreground.load(Ordering::Relaxed)
    }

    fn foreground_allowance(&self, priority: u32) -> u32 {
        self.foreground_limit * priority.clamp(1, 10) / 10
    }
}

impl Default for LoadScheduler {
    fn default() -> Self {
        Self::new(4, 4, 10)
    }
}

impl Scheduler for LoadScheduler {
    fn request(&self, request: &CreditRequest) -> bool {
        if self.foreground_load() > self.foreground_allowance(request.priority) {
            return false;
        }
        let mut usage = self.usage.lock();
        let class = &mut usage[request.class.slot()];
        if class.cpu + request.cpu_credits > self.cpu_budget
            || class.io + request.io_credits > self.io_budget
        {
            return false;
        }
        class.cpu += request.cpu_credits;
        class.io += request.io_credits;
        true
    }

    fn release(&self, request: &CreditRequest) {
        let mut usage = self.usage.lock();
        let class = &mut usage[request.class.slot()];
        class.cpu = class.cpu.saturating_sub(request.cpu_credits);
        class.io = class.io.saturating_sub(request.io_credits);
    }

    fn foreground_started(&self) {
        self.foreground.fetch_add(1, Ordering::Relaxed);
    }

    fn foreground_finished(&self) {
        let _ = self
            .foreground
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }
}
