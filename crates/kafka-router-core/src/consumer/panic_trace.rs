//! Backtraces captured where a callback panics.
//!
//! Once `catch_unwind` returns, the panicking frames are gone. A process-wide
//! hook records the backtrace on the panicking thread so the worker that
//! caught the panic can log it.

use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::sync::Once;

thread_local! {
    static LAST: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static INSTALL: Once = Once::new();

/// Chain the recording hook in front of the current panic hook.
///
/// Only the first call installs anything.
pub(super) fn install() {
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let _ = LAST.try_with(|slot| {
                if let Ok(mut slot) = slot.try_borrow_mut() {
                    *slot = Some(Backtrace::force_capture());
                }
            });
            previous(info);
        }));
    });
}

/// Backtrace of the last panic raised on this thread, if one was recorded.
pub(super) fn take() -> Option<Backtrace> {
    LAST.try_with(|slot| slot.try_borrow_mut().ok().and_then(|mut slot| slot.take()))
        .ok()
        .flatten()
}
