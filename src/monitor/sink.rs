//! Presentation sinks receiving the ordered snapshot of every refresh cycle.

use std::io::{self, Write};

use log::{info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::flow_tracking::types::Snapshot;

/// Consumer of refresh snapshots. Called from the engine loop, so implementations must not block
/// for long; failures are handled inside the sink.
pub trait SnapshotSink: Send {
    fn publish(&mut self, session_id: Uuid, snapshot: &Snapshot);
}

/// Writes each snapshot as an aligned table through the `log` facade.
#[derive(Debug, Default)]
pub struct LogSink;

impl SnapshotSink for LogSink {
    fn publish(&mut self, session_id: Uuid, snapshot: &Snapshot) {
        if snapshot.flows.is_empty() {
            info!("[{}] No active peers", session_id);
            return;
        }
        info!("[{}] {} active peer(s)", session_id, snapshot.flows.len());
        for view in &snapshot.flows {
            info!(
                "[{}]   {:<45} {:>10}  {}  {} ({}) {} {}",
                session_id,
                view.remote_identifier,
                view.formatted_traffic,
                view.last_activity_display,
                view.geo.country,
                view.geo.country_iso,
                view.geo.city,
                view.geo.asn
            );
        }
    }
}

#[derive(Serialize)]
struct SnapshotDocument<'a> {
    session: Uuid,
    #[serde(flatten)]
    snapshot: &'a Snapshot,
}

/// Writes one JSON document per snapshot, one per line.
pub struct JsonLinesSink<W> {
    writer: W,
}

impl JsonLinesSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_document(&mut self, document: &SnapshotDocument<'_>) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, document)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

impl<W: Write + Send> SnapshotSink for JsonLinesSink<W> {
    fn publish(&mut self, session_id: Uuid, snapshot: &Snapshot) {
        let document = SnapshotDocument {
            session: session_id,
            snapshot,
        };
        if let Err(e) = self.write_document(&document) {
            warn!("[{}] Failed to write snapshot: {}", session_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_tracking::types::{FlowKey, FlowView, GeoInfo};
    use chrono::{Local, TimeZone};
    use std::net::IpAddr;

    fn snapshot() -> Snapshot {
        let at = Local.with_ymd_and_hms(2024, 5, 4, 12, 0, 5).unwrap();
        let key = FlowKey::Remote(IpAddr::from([203, 0, 113, 7]));
        Snapshot {
            taken_at: at,
            flows: vec![FlowView {
                key,
                remote_identifier: key.to_string(),
                formatted_traffic: "1.5 KB".to_string(),
                last_activity_display: "12:00:05".to_string(),
                geo: GeoInfo {
                    country: "Netherlands".to_string(),
                    country_iso: "NL".to_string(),
                    city: "Amsterdam".to_string(),
                    asn: "AS64500".to_string(),
                },
                total_bytes: 1536,
                last_activity: at,
                hidden: false,
            }],
        }
    }

    #[test]
    fn test_json_lines_document() {
        let session = Uuid::new_v4();
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.publish(session, &snapshot());
        sink.publish(session, &Snapshot {
            taken_at: Local::now(),
            flows: Vec::new(),
        });

        let output = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);

        let doc: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(doc["session"], session.to_string());
        let flow = &doc["flows"][0];
        assert_eq!(flow["remote_identifier"], "203.0.113.7");
        assert_eq!(flow["formatted_traffic"], "1.5 KB");
        assert_eq!(flow["last_activity_display"], "12:00:05");
        assert_eq!(flow["country"], "Netherlands");
        assert_eq!(flow["country_iso"], "NL");
        assert_eq!(flow["city"], "Amsterdam");
        assert_eq!(flow["asn"], "AS64500");

        let empty: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert!(empty["flows"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_log_sink_accepts_any_snapshot() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut sink = LogSink;
        sink.publish(Uuid::new_v4(), &snapshot());
        sink.publish(Uuid::new_v4(), &Snapshot {
            taken_at: Local::now(),
            flows: Vec::new(),
        });
    }
}
