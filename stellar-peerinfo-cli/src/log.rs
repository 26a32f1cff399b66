//! Compact stderr rendering of connection traffic.

use tracing::field::{Field, Visit};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// Renders protocol events as `<arrow> <peer> <message>: <fields>`.
pub struct EventFormatter;

impl<S, N> FormatEvent<S, N> for EventFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let level = *event.metadata().level();
        let prefix = if level <= tracing::Level::WARN {
            "❌"
        } else {
            match visitor.direction.as_deref() {
                Some("send") => "➡️",
                Some("recv") => "⬅️",
                _ => "•",
            }
        };

        let mut parts = Vec::new();
        if let Some(v) = visitor.message {
            parts.push(v);
        }
        for (name, value) in visitor.fields {
            parts.push(format!("{name}={value}"));
        }
        if let Some(v) = visitor.error_message {
            parts.push(v);
        }

        match visitor.peer {
            Some(peer) => writeln!(writer, "{} {} {}", prefix, peer, parts.join(": ")),
            None => writeln!(writer, "{} {}", prefix, parts.join(": ")),
        }
    }
}

#[derive(Default)]
struct FieldVisitor {
    direction: Option<String>,
    peer: Option<String>,
    message: Option<String>,
    error_message: Option<String>,
    fields: Vec<(&'static str, String)>,
}

const SHOWN_FIELDS: &[&str] = &[
    "ledger_version",
    "overlay_version",
    "version_str",
    "flags",
    "num_messages",
    "num_bytes",
    "code",
    "node",
];

impl FieldVisitor {
    fn record(&mut self, field: &Field, value: String) {
        match field.name() {
            "direction" => self.direction = Some(value),
            "peer" => self.peer = Some(value),
            "message" => self.message = Some(value),
            "error_message" => self.error_message = Some(value),
            name if SHOWN_FIELDS.contains(&name) => self.fields.push((field.name(), value)),
            _ => {}
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.record(field, format!("{:?}", value));
    }
}
