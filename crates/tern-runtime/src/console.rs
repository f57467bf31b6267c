//! Console API
//!
//! Provides `console.log`, `console.info`, `console.debug`, `console.warn` and
//! `console.error`, routed to `tracing` (target `tern::console`) unless a
//! handler is installed with [`set_console_handler`].

use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use tern_core::{BridgeResult, Context, Value, ValueKind};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
    Log,
    Info,
    Debug,
    Warn,
    Error,
}

impl ConsoleLevel {
    const ALL: [ConsoleLevel; 5] = [
        ConsoleLevel::Log,
        ConsoleLevel::Info,
        ConsoleLevel::Debug,
        ConsoleLevel::Warn,
        ConsoleLevel::Error,
    ];

    pub fn method(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

type ConsoleHandler = dyn Fn(ConsoleLevel, &str) + Send + Sync + 'static;

static CONSOLE_HANDLER: OnceLock<Mutex<Arc<ConsoleHandler>>> = OnceLock::new();

fn handler_slot() -> &'static Mutex<Arc<ConsoleHandler>> {
    CONSOLE_HANDLER.get_or_init(|| Mutex::new(Arc::new(default_console_handler)))
}

/// Replace the process-wide console sink
pub fn set_console_handler(handler: impl Fn(ConsoleLevel, &str) + Send + Sync + 'static) {
    *handler_slot().lock() = Arc::new(handler);
}

/// Route console output back to `tracing`
pub fn reset_console_handler() {
    *handler_slot().lock() = Arc::new(default_console_handler);
}

fn default_console_handler(level: ConsoleLevel, message: &str) {
    match level {
        ConsoleLevel::Log | ConsoleLevel::Info => info!(target: "tern::console", "{}", message),
        ConsoleLevel::Debug => debug!(target: "tern::console", "{}", message),
        ConsoleLevel::Warn => warn!(target: "tern::console", "{}", message),
        ConsoleLevel::Error => error!(target: "tern::console", "{}", message),
    }
}

fn dispatch_console(level: ConsoleLevel, message: &str) {
    let handler = handler_slot().lock().clone();
    handler(level, message);
}

/// Render one console argument: strings verbatim, plain objects and arrays
/// as JSON, everything else through its string conversion
fn format_arg(value: &Value) -> String {
    let rendered = match value.value_type() {
        Ok(ValueKind::Object | ValueKind::Array) => value
            .context()
            .json_stringify(value)
            .or_else(|_| value.to_detail_string()),
        _ => value.to_string(),
    };
    rendered.unwrap_or_else(|err| format!("<{err}>"))
}

/// Install the `console` global in `context`
pub fn install(context: &Context) -> BridgeResult<()> {
    let isolate = context.isolate();
    let console = context.new_object()?;
    for level in ConsoleLevel::ALL {
        let function = isolate
            .new_function_template(move |info| {
                let message = info
                    .args()
                    .iter()
                    .map(format_arg)
                    .collect::<Vec<_>>()
                    .join(" ");
                dispatch_console(level, &message);
                None
            })
            .with_name(level.method())
            .get_function(context)?;
        console.set(level.method(), &function)?;
    }
    context.global()?.set("console", &console)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tern_core::Isolate;

    #[test]
    #[serial]
    fn test_console_routes_to_handler() {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        set_console_handler(move |level, message| sink.lock().push((level, message.to_string())));

        let isolate = Isolate::new();
        let context = Context::new(&isolate).unwrap();
        install(&context).unwrap();
        context
            .eval("console.log('a', 1, {b: [true]}); console.error(new TypeError('bad'))")
            .unwrap();
        reset_console_handler();

        let captured = captured.lock();
        assert_eq!(
            *captured,
            vec![
                (ConsoleLevel::Log, r#"a 1 {"b":[true]}"#.to_string()),
                (ConsoleLevel::Error, "TypeError: bad".to_string()),
            ]
        );
    }
}
