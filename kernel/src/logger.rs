//! Kernel log backend
//!
//! A thin `log::Log` implementation with a pluggable sink. The kernel itself
//! never formats to a device directly; whoever brings the system up (boot
//! code, or the test harness) installs a sink. Serial and display drivers are
//! outside the core, so the default sink drops records.

use core::sync::atomic::{AtomicUsize, Ordering};

use log::{LevelFilter, Metadata, Record};

/// A sink receives fully-formatted log lines.
pub type Sink = fn(&Record);

static SINK: AtomicUsize = AtomicUsize::new(0);

struct KernelLog;

static LOGGER: KernelLog = KernelLog;

impl log::Log for KernelLog {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        SINK.load(Ordering::Acquire) != 0
    }

    fn log(&self, record: &Record) {
        let raw = SINK.load(Ordering::Acquire);
        if raw != 0 {
            // SAFETY: `raw` was stored from a valid `Sink` fn pointer in
            // `set_sink` and fn pointers are never deallocated.
            let sink: Sink = unsafe { core::mem::transmute(raw) };
            sink(record);
        }
    }

    fn flush(&self) {}
}

/// Install the logger facade. Idempotent; the first caller wins.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

/// Route records to `sink`. Passing a new sink replaces the old one.
pub fn set_sink(sink: Sink) {
    SINK.store(sink as usize, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_sink(_record: &Record) {}

    #[test]
    fn sink_installs_and_enables() {
        init(LevelFilter::Debug);
        set_sink(test_sink);
        log::debug!("logger smoke test");
    }
}
