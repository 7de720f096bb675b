//! Adapters that turn byte streams into edit event records.
//!
//! Each line is either JSONL (`{...}`) or Server-Sent-Events framing as served by the
//! Wikimedia EventStream (`event:`, `id:`, `data: {...}`). Lines that cannot be decoded are
//! surfaced as [`SourceRecord::Malformed`] instead of ending the stream.

use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::header::ACCEPT;
use reqwest::Client;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::io::StreamReader;
use url::Url;

use crate::error::SourceError;
use crate::event::EditEvent;

/// Public Wikimedia recent-change stream.
pub const RECENT_CHANGE_STREAM: &str = "https://stream.wikimedia.org/v2/stream/recentchange";

/// Items yielded by an event source.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRecord {
    /// A decoded edit event.
    Event(EditEvent),
    /// A line that looked like a record but failed to decode.
    Malformed {
        /// 1-based line number in the source.
        line: usize,
        /// Decoder message.
        reason: String,
    },
}

/// Ordered stream of source records; an `Err` ends consumption.
pub type EventStream = BoxStream<'static, Result<SourceRecord, SourceError>>;

/// Classification of a single source line.
#[derive(Debug)]
pub enum ParsedLine {
    /// Blank line or SSE framing.
    Skip,
    /// A decoded edit event.
    Event(EditEvent),
    /// Payload that failed to decode.
    Invalid(String),
}

/// Classifies one line of JSONL or SSE input.
pub fn parse_line(line: &str) -> ParsedLine {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return ParsedLine::Skip;
    }
    let payload = if let Some(data) = line.strip_prefix("data:") {
        data.trim_start()
    } else if ["event:", "id:", "retry:"]
        .iter()
        .any(|field| line.starts_with(field))
    {
        return ParsedLine::Skip;
    } else {
        line
    };
    match serde_json::from_str::<EditEvent>(payload) {
        Ok(event) => ParsedLine::Event(event),
        Err(err) => ParsedLine::Invalid(err.to_string()),
    }
}

/// Reads records line by line from any buffered async reader (file, stdin, HTTP body).
pub fn read_events<R>(reader: R) -> EventStream
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    stream::unfold((reader.lines(), 0usize), |(mut lines, mut line_no)| async move {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    line_no += 1;
                    let record = match parse_line(&line) {
                        ParsedLine::Skip => continue,
                        ParsedLine::Event(event) => SourceRecord::Event(event),
                        ParsedLine::Invalid(reason) => SourceRecord::Malformed {
                            line: line_no,
                            reason,
                        },
                    };
                    return Some((Ok(record), (lines, line_no)));
                }
                Ok(None) => return None,
                Err(err) => return Some((Err(SourceError::Io(err)), (lines, line_no))),
            }
        }
    })
    .boxed()
}

/// Opens a Server-Sent-Events stream and yields its edit events.
pub async fn connect_sse(client: &Client, url: &Url) -> Result<EventStream, SourceError> {
    let response = client
        .get(url.clone())
        .header(ACCEPT, "text/event-stream")
        .send()
        .await?
        .error_for_status()?;
    tracing::info!(%url, "connected to event stream");
    let body = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
    Ok(read_events(StreamReader::new(body)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_framing_is_skipped() {
        for line in ["", "event: message", "id: [{\"topic\":\"x\"}]", ": ok", "retry: 5"] {
            assert!(matches!(parse_line(line), ParsedLine::Skip), "{line}");
        }
    }

    #[test]
    fn data_lines_and_bare_json_decode() {
        let sse = parse_line(r#"data: {"title":"Cat","wikidata_id":"Q146","timestamp":1}"#);
        let bare = parse_line(r#"{"title":"Cat","wikidata_id":"Q146","timestamp":1}"#);
        for parsed in [sse, bare] {
            match parsed {
                ParsedLine::Event(event) => assert_eq!(event.wikidata_id.as_deref(), Some("Q146")),
                other => panic!("expected event, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn malformed_lines_do_not_end_the_stream() {
        let input = "data: {\"title\":\"A\",\"timestamp\":1}\n\ndata: {not json\n{\"title\":\"B\"}\n";
        let records: Vec<_> = read_events(input.as_bytes())
            .map(|record| record.expect("in-memory read"))
            .collect()
            .await;
        assert_eq!(records.len(), 3);
        assert!(matches!(&records[0], SourceRecord::Event(event) if event.title == "A"));
        assert!(matches!(&records[1], SourceRecord::Malformed { line: 3, .. }));
        assert!(matches!(&records[2], SourceRecord::Event(event) if event.title == "B"));
    }
}
