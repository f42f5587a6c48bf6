//! Panic reporting.

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::{PanicHookInfo, take_hook};
use std::thread;

/// Install a global panic hook that logs panics through `tracing` before
/// deferring to the previous hook.
///
/// Panics inside module handlers are caught and answered with an ack, so
/// without this hook their backtrace would only reach stderr.
pub fn install() {
    let previous_hook = take_hook();

    std::panic::set_hook(Box::new(move |panic_info: &PanicHookInfo<'_>| {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let location = panic_info
                .location()
                .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
                .unwrap_or_else(|| "<unknown>".to_string());
            let thread_name = thread::current()
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| "<unnamed>".to_string());
            let payload = payload_message(panic_info.payload());

            tracing::error!(
                target: "lab::panic",
                thread = %thread_name,
                location = %location,
                "panic: {payload}\nBacktrace:\n{}",
                Backtrace::force_capture()
            );
        }));

        previous_hook(panic_info);
    }));
}

/// Best-effort text of a panic payload.
pub fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "panic with non-string payload".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_message() {
        let caught = std::panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(payload_message(caught.as_ref()), "boom 1");

        let caught = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(payload_message(caught.as_ref()), "static");

        let caught = std::panic::catch_unwind(|| std::panic::panic_any(7_u8)).unwrap_err();
        assert_eq!(payload_message(caught.as_ref()), "panic with non-string payload");
    }
}
