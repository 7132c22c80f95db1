//! Log book over MAVLink: live STATUSTEXT forwarding and LOG_REQUEST_LIST
//! replay.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vcu_core::{LogBook, LogEntry, TelemetrySink};
use vcu_proto::mavlink::common::{MavMessage, LOG_ENTRY_DATA, STATUSTEXT_DATA};

pub const CHUNK_LEN: usize = 50;
const CHUNK_GAP: Duration = Duration::from_millis(10);
const ENTRY_GAP: Duration = Duration::from_millis(50);
const REPLAY_DELAY: Duration = Duration::from_millis(100);

/// STATUSTEXT frames for one entry, 50 bytes of text each.
pub fn status_texts(entry: &LogEntry) -> Vec<MavMessage> {
    let bytes = entry.text.as_bytes();
    bytes
        .chunks(CHUNK_LEN)
        .map(|chunk| {
            let mut text = [0u8; CHUNK_LEN];
            text[..chunk.len()].copy_from_slice(chunk);
            MavMessage::STATUSTEXT(STATUSTEXT_DATA { severity: entry.severity, text, ..Default::default() })
        })
        .collect()
}

async fn send_entry(sink: &dyn TelemetrySink, entry: &LogEntry) {
    let chunks = status_texts(entry);
    let last = chunks.len().saturating_sub(1);
    for (i, msg) in chunks.into_iter().enumerate() {
        sink.send_priority(msg.into());
        if i != last {
            tokio::time::sleep(CHUNK_GAP).await;
        }
    }
}

/// Answers LOG_REQUEST_LIST: a LOG_ENTRY summary, then entries `start..=end`.
pub async fn replay(book: &LogBook, sink: &dyn TelemetrySink, start: u16, end: u16) {
    book.set_paused(true);
    let last = book.last_id().unwrap_or(0);
    sink.send_priority(
        MavMessage::LOG_ENTRY(LOG_ENTRY_DATA {
            id: last as u16,
            num_logs: book.len() as u16,
            last_log_num: last as u16,
            ..Default::default()
        })
        .into(),
    );
    tokio::time::sleep(REPLAY_DELAY).await;
    for entry in book.range(u32::from(start), u32::from(end)) {
        send_entry(sink, &entry).await;
        tokio::time::sleep(ENTRY_GAP).await;
    }
    book.set_paused(false);
}

/// Forwards new entries while the link is up.
pub async fn forward_live(
    mut rx: mpsc::UnboundedReceiver<LogEntry>,
    sink: Arc<dyn TelemetrySink>,
    cancel: CancellationToken,
) {
    loop {
        let entry = tokio::select! {
            _ = cancel.cancelled() => break,
            e = rx.recv() => match e {
                Some(e) => e,
                None => break,
            },
        };
        send_entry(sink.as_ref(), &entry).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vcu_core::telemetry::testing::RecordingSink;
    use vcu_proto::mavlink::common::MavSeverity;
    use vcu_proto::VcuMessage;

    fn texts(sink: &RecordingSink) -> Vec<String> {
        sink.messages()
            .into_iter()
            .filter_map(|m| match m {
                VcuMessage::Common(MavMessage::STATUSTEXT(s)) => {
                    let end = s.text.iter().position(|b| *b == 0).unwrap_or(CHUNK_LEN);
                    Some(String::from_utf8_lossy(&s.text[..end]).into_owned())
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_long_text_is_chunked() {
        let entry = LogEntry { id: 3, severity: MavSeverity::MAV_SEVERITY_ERROR, text: "x".repeat(120) };
        let msgs = status_texts(&entry);
        assert_eq!(msgs.len(), 3);
        match &msgs[2] {
            MavMessage::STATUSTEXT(s) => {
                assert_eq!(s.severity, MavSeverity::MAV_SEVERITY_ERROR);
                assert_eq!(&s.text[..20], "x".repeat(20).as_bytes());
                assert_eq!(s.text[20], 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_sends_summary_then_range() {
        let book = LogBook::new();
        let mut live = book.subscribe();
        for t in ["zero", "one", "two", "three"] {
            book.push(MavSeverity::MAV_SEVERITY_INFO, t);
        }
        while live.try_recv().is_ok() {}

        let sink = RecordingSink::new();
        let started = tokio::time::Instant::now();
        replay(&book, &sink, 1, 2).await;

        let msgs = sink.priority_messages();
        match &msgs[0] {
            VcuMessage::Common(MavMessage::LOG_ENTRY(e)) => {
                assert_eq!(e.id, 3);
                assert_eq!(e.num_logs, 4);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(texts(&sink), vec!["one", "two"]);
        assert_eq!(started.elapsed(), Duration::from_millis(200));

        book.push(MavSeverity::MAV_SEVERITY_INFO, "after");
        assert_eq!(live.try_recv().unwrap().text, "after");
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_forwarding() {
        let book = LogBook::new();
        let sink = Arc::new(RecordingSink::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(forward_live(book.subscribe(), sink.clone(), cancel.clone()));
        book.push(MavSeverity::MAV_SEVERITY_WARNING, "a".repeat(60));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(texts(&sink), vec!["a".repeat(50), "a".repeat(10)]);
    }
}
