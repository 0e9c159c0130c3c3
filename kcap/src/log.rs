//! An injectable logging sink.
//!
//! All output routes through a single global sink, registered once at boot
//! and guarded by a `NullLock` pseudo-mutex that is sound only because
//! self-paging runs single-threaded, one address space per core, with no
//! reentrant interrupt path. The sink is a trait object registered at
//! runtime (`register_sink`) rather than a concrete UART driver, so host
//! unit tests can capture output in a `Vec<String>` instead of needing
//! semihosting.

use core::cell::UnsafeCell;
use core::fmt;

/// Exclusive access to the wrapped data for the duration of a closure.
///
/// Sound only under a single-core, no-concurrent-access assumption.
/// Self-paging never installs a fault handler or LMP server across more
/// than one hardware thread at a time, so the assumption holds here.
struct NullLock<T: ?Sized> {
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for NullLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for NullLock<T> {}

impl<T> NullLock<T> {
    const fn new(data: T) -> Self {
        Self {
            data: UnsafeCell::new(data),
        }
    }

    fn lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let data = unsafe { &mut *self.data.get() };
        f(data)
    }
}

/// A destination for diagnostic output.
///
/// Takes `&self` rather than requiring `&mut self` of the caller: a real
/// sink (UART, semihosting channel) manages its own interior mutability.
pub trait Sink: Sync {
    /// Write `s` to the sink. Never fails — a sink with no backing device
    /// (see [`NullSink`]) simply discards its input.
    fn write_str(&self, s: &str);
}

/// The default sink installed before anything calls [`register_sink`].
/// Discards everything.
pub struct NullSink;

impl Sink for NullSink {
    fn write_str(&self, _s: &str) {}
}

static NULL_SINK: NullSink = NullSink;

static SINK: NullLock<&'static (dyn Sink + Sync)> = NullLock::new(&NULL_SINK);

/// Register the sink that [`sink`] (and the [`klog!`] macro) writes to.
///
/// Call once during process bootstrap, before the first fault is handled or
/// the first LMP request is dispatched. Calling it again replaces the sink,
/// which is how host tests install a capturing sink per test.
pub fn register_sink(new_sink: &'static (dyn Sink + Sync)) {
    SINK.lock(|s| *s = new_sink);
}

/// The currently registered sink.
pub fn sink() -> &'static dyn Sink {
    SINK.lock(|s| *s)
}

/// Format `args` into a fixed-size stack buffer and hand the result to the
/// registered sink, truncating rather than allocating if the formatted
/// message overflows the buffer. No-alloc `fmt::Write` bridge, for output
/// built before a heap exists.
#[doc(hidden)]
pub fn write_fmt(args: fmt::Arguments) {
    struct Buf<'a> {
        buf: &'a mut [u8],
        used: usize,
    }

    impl<'a> fmt::Write for Buf<'a> {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            let remaining = &mut self.buf[self.used.min(self.buf.len())..];
            let raw = s.as_bytes();
            let n = raw.len().min(remaining.len());
            remaining[..n].copy_from_slice(&raw[..n]);
            self.used += raw.len();
            Ok(())
        }
    }

    let mut storage = [0u8; 128];
    let mut writer = Buf {
        buf: &mut storage,
        used: 0,
    };
    let _ = fmt::write(&mut writer, args);
    let used = writer.used.min(writer.buf.len());
    // Valid UTF-8: every byte written came from a `&str`, and truncation at
    // `used` only ever drops whole writes, never splits one (`write_str`
    // copies in a single `copy_from_slice`).
    let text = unsafe { core::str::from_utf8_unchecked(&storage[..used]) };
    sink().write_str(text);
}

/// Write a line to the registered sink, `println!`-style. Formats with
/// [`core::format_args!`] and appends a newline.
#[macro_export]
macro_rules! klog {
    ($($arg:tt)*) => {{
        $crate::log::write_fmt(format_args!($($arg)*));
        $crate::log::write_fmt(format_args!("\n"));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use std::sync::Mutex as StdMutex;

    struct CaptureSink {
        lines: Arc<StdMutex<Vec<alloc::string::String>>>,
    }

    impl Sink for CaptureSink {
        fn write_str(&self, s: &str) {
            self.lines.lock().unwrap().push(s.into());
        }
    }

    #[test]
    fn null_sink_discards_everything() {
        let sink = NullSink;
        sink.write_str("ignored");
    }

    #[test]
    fn write_fmt_truncates_rather_than_panics_on_overflow() {
        let long = "x".repeat(1000);
        // Must not panic even though the message is far larger than the
        // internal formatting buffer.
        write_fmt(format_args!("{long}"));
    }

    #[test]
    fn registered_sink_receives_formatted_output() {
        let lines = Arc::new(StdMutex::new(Vec::new()));
        let captured = Box::leak(Box::new(CaptureSink {
            lines: lines.clone(),
        }));
        register_sink(captured);
        write_fmt(format_args!("fault at {:#x}", 0x1000usize));
        let got = lines.lock().unwrap();
        assert_eq!(got.last().unwrap(), "fault at 0x1000");
        register_sink(&NULL_SINK);
    }
}
