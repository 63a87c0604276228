//! Forwarding of `tracing` events to a host-side log sink.
//!
//! Hosts attach a [`LogSink`] once they are ready to receive lines. Until
//! then, and after a detach, the layer does nothing and the native channel
//! is all there is: the `fmt` layer, plus logcat on Android.

use std::fmt::Write as _;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
#[cfg(not(target_os = "android"))]
use tracing_subscriber::util::SubscriberInitExt;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,llama_bridge=debug";

/// Receives one formatted line per event, newline included.
pub trait LogSink: Send + Sync {
    fn print(&self, line: &str);
}

type SinkSlot = Arc<RwLock<Option<Arc<dyn LogSink>>>>;

/// Handle used to attach or detach the host sink after the subscriber has
/// been installed.
#[derive(Clone, Default)]
pub struct HostSink {
    slot: SinkSlot,
}

impl HostSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, sink: Arc<dyn LogSink>) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    pub fn detach(&self) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_attached(&self) -> bool {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Layer writing into this handle's sink.
    pub fn layer(&self) -> HostSinkLayer {
        HostSinkLayer {
            slot: self.slot.clone(),
        }
    }
}

/// `tracing_subscriber` layer formatting events as
/// `"[llama-<level>] <message> <fields>\n"`.
pub struct HostSinkLayer {
    slot: SinkSlot,
}

impl<S: Subscriber> Layer<S> for HostSinkLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let guard = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        let Some(sink) = guard.as_ref() else {
            return;
        };
        let mut line = LineVisitor::default();
        event.record(&mut line);
        sink.print(&format_line(*event.metadata().level(), &line));
    }
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::ERROR => "error",
        Level::WARN => "warn",
        Level::INFO => "info",
        Level::DEBUG => "debug",
        Level::TRACE => "trace",
    }
}

fn format_line(level: Level, line: &LineVisitor) -> String {
    format!("[llama-{}] {}{}\n", level_tag(level), line.message, line.fields)
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// Logcat tag on Android.
pub const NATIVE_LOG_TAG: &str = "llama-bridge";

/// On Android, `tracing` is built with `log-always`, so every event is also
/// a `log` record; route those to logcat.
#[cfg(target_os = "android")]
fn init_native_log(filter: &str) {
    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(log::LevelFilter::Debug)
            .with_tag(NATIVE_LOG_TAG)
            .with_filter(android_logger::FilterBuilder::new().parse(filter).build()),
    );
}

#[cfg(not(target_os = "android"))]
fn init_native_log(_filter: &str) {}

/// Install the global subscriber: `EnvFilter` (falling back to `default`),
/// the `fmt` layer and the host sink layer, plus the logcat logger on
/// Android. Returns `false` if a subscriber was already set.
pub fn init(default: &str, host: &HostSink) -> bool {
    init_native_log(default);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(host.layer());

    // `log` already points at logcat here; a LogTracer would loop.
    #[cfg(target_os = "android")]
    {
        tracing::subscriber::set_global_default(subscriber).is_ok()
    }
    #[cfg(not(target_os = "android"))]
    {
        SubscriberInitExt::try_init(subscriber).is_ok()
    }
}
