//! Renders decoded events and writes them out, one record per line.

use std::{fmt, io, str::FromStr};

use alloy::{dyn_abi::DynSolValue, hex};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value, json};
use tokio::io::{AsyncWrite, AsyncWriteExt, Stdout};

use crate::{ListenerError, decoder::DecodedEvent, types::ReorgReport};

/// Record layout written by a [`WriterSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// `<timestamp> <event> name=value ...`
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl FromStr for OutputFormat {
    type Err = ListenerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "stdout" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(ListenerError::Config(format!(
                "unknown output format {other:?}, expected \"text\" or \"json\""
            ))),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => f.write_str("text"),
            OutputFormat::Json => f.write_str("json"),
        }
    }
}

/// Destination for decoded events.
///
/// Calls are awaited one at a time, so a slow destination holds back the pipeline instead of
/// letting records pile up.
pub trait EventSink: Send {
    fn write_event(&mut self, event: &DecodedEvent) -> impl Future<Output = io::Result<()>> + Send;

    /// Record that previously written events were orphaned.
    fn write_reorg(&mut self, report: &ReorgReport) -> impl Future<Output = io::Result<()>> + Send;

    fn flush(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

/// Writes records to any [`AsyncWrite`], flushing after each one.
#[derive(Debug)]
pub struct WriterSink<W> {
    writer: W,
    format: OutputFormat,
}

impl WriterSink<Stdout> {
    #[must_use]
    pub fn stdout(format: OutputFormat) -> Self {
        Self::new(tokio::io::stdout(), format)
    }
}

impl<W: AsyncWrite + Unpin + Send> WriterSink<W> {
    pub fn new(writer: W, format: OutputFormat) -> Self {
        Self { writer, format }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    async fn write_line(&mut self, mut line: String) -> io::Result<()> {
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await
    }
}

impl<W: AsyncWrite + Unpin + Send> EventSink for WriterSink<W> {
    async fn write_event(&mut self, event: &DecodedEvent) -> io::Result<()> {
        let line = match self.format {
            OutputFormat::Text => text_event(event),
            OutputFormat::Json => json_event(event).to_string(),
        };
        self.write_line(line).await
    }

    async fn write_reorg(&mut self, report: &ReorgReport) -> io::Result<()> {
        let line = match self.format {
            OutputFormat::Text => text_reorg(report),
            OutputFormat::Json => json!({ "reorg": report }).to_string(),
        };
        self.write_line(line).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.writer.flush().await
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn text_event(event: &DecodedEvent) -> String {
    let mut line = format!("{} {}", timestamp(), event.name);
    for (name, value) in &event.args {
        line.push(' ');
        line.push_str(name);
        line.push('=');
        push_text_value(&mut line, value);
    }
    line
}

fn text_reorg(report: &ReorgReport) -> String {
    let invalidated: Vec<String> =
        report.invalidated.iter().map(ToString::to_string).collect();
    format!(
        "{} REORG common_ancestor={} invalidated=[{}] beyond_history={}",
        timestamp(),
        report.common_ancestor,
        invalidated.join(","),
        report.beyond_history
    )
}

fn push_text_value(out: &mut String, value: &DynSolValue) {
    match value {
        DynSolValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        DynSolValue::Int(i, _) => out.push_str(&i.to_string()),
        DynSolValue::Uint(u, _) => out.push_str(&u.to_string()),
        DynSolValue::Address(address) => out.push_str(&address.to_checksum(None)),
        DynSolValue::String(s) => out.push_str(&format!("{s:?}")),
        DynSolValue::FixedBytes(word, size) => out.push_str(&hex::encode_prefixed(&word[..*size])),
        DynSolValue::Bytes(bytes) => out.push_str(&hex::encode_prefixed(bytes)),
        DynSolValue::Function(function) => out.push_str(&hex::encode_prefixed(function)),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) => {
            push_text_list(out, items, '[', ']');
        }
        DynSolValue::Tuple(items) => push_text_list(out, items, '(', ')'),
        #[allow(unreachable_patterns)]
        other => out.push_str(&format!("{other:?}")),
    }
}

fn push_text_list(out: &mut String, items: &[DynSolValue], open: char, close: char) {
    out.push(open);
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        push_text_value(out, item);
    }
    out.push(close);
}

fn json_event(event: &DecodedEvent) -> Value {
    let args: Map<String, Value> =
        event.args.iter().map(|(name, value)| (name.clone(), json_value(value))).collect();
    json!({
        "block_number": event.origin.block_number,
        "block_hash": event.origin.block_hash,
        "transaction_hash": event.origin.transaction_hash,
        "log_index": event.origin.log_index,
        "address": event.origin.address.to_checksum(None),
        "event": event.name,
        "args": args,
    })
}

/// Integers that fit in 64 bits become JSON numbers, wider ones decimal strings.
fn json_value(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(b) => Value::Bool(*b),
        DynSolValue::Int(i, _) => {
            i64::try_from(*i).map_or_else(|_| Value::String(i.to_string()), Value::from)
        }
        DynSolValue::Uint(u, _) => {
            u64::try_from(*u).map_or_else(|_| Value::String(u.to_string()), Value::from)
        }
        DynSolValue::Address(address) => Value::String(address.to_checksum(None)),
        DynSolValue::String(s) => Value::String(s.clone()),
        DynSolValue::FixedBytes(word, size) => Value::String(hex::encode_prefixed(&word[..*size])),
        DynSolValue::Bytes(bytes) => Value::String(hex::encode_prefixed(bytes)),
        DynSolValue::Function(function) => Value::String(hex::encode_prefixed(function)),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
            Value::Array(items.iter().map(json_value).collect())
        }
        #[allow(unreachable_patterns)]
        other => Value::String(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decoder::LogRef, log_entry::LogPosition};
    use alloy::primitives::{Address, B256, I256, U256, address};
    use indexmap::IndexMap;

    const HOLDER: Address = address!("0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045");

    fn event() -> DecodedEvent {
        let mut args = IndexMap::new();
        args.insert("from".to_owned(), DynSolValue::Address(HOLDER));
        args.insert("value".to_owned(), DynSolValue::Uint(U256::from(1000), 256));
        args.insert("huge".to_owned(), DynSolValue::Uint(U256::MAX, 256));
        args.insert("delta".to_owned(), DynSolValue::Int(I256::try_from(-5i64).unwrap(), 32));
        args.insert(
            "pair".to_owned(),
            DynSolValue::Tuple(vec![DynSolValue::Bool(true), DynSolValue::Bytes(vec![0xab, 0xcd])]),
        );
        DecodedEvent {
            name: "Transfer".to_owned(),
            args,
            origin: LogRef {
                address: HOLDER,
                block_number: 19_000_000,
                block_hash: B256::repeat_byte(0x11),
                transaction_hash: B256::repeat_byte(0x22),
                log_index: 7,
            },
        }
    }

    async fn render(format: OutputFormat, write: impl AsyncFnOnce(&mut WriterSink<Vec<u8>>)) -> String {
        let mut sink = WriterSink::new(Vec::new(), format);
        write(&mut sink).await;
        String::from_utf8(sink.into_inner()).unwrap()
    }

    #[test]
    fn parses_output_formats() {
        assert_eq!("text".parse::<OutputFormat>().unwrap(), OutputFormat::Text);
        assert_eq!("stdout".parse::<OutputFormat>().unwrap(), OutputFormat::Text);
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!(matches!("xml".parse::<OutputFormat>(), Err(ListenerError::Config(_))));
    }

    #[tokio::test]
    async fn text_line_lists_arguments_in_order() {
        let out = render(OutputFormat::Text, async |sink| {
            sink.write_event(&event()).await.unwrap();
        })
        .await;

        let (timestamp, rest) = out.trim_end().split_once(' ').unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
        assert_eq!(
            rest,
            format!(
                "Transfer from=0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045 value=1000 huge={} delta=-5 pair=(true,0xabcd)",
                U256::MAX
            )
        );
    }

    #[tokio::test]
    async fn json_record_carries_origin_and_arguments() {
        let out = render(OutputFormat::Json, async |sink| {
            sink.write_event(&event()).await.unwrap();
        })
        .await;
        assert_eq!(out.lines().count(), 1);

        let record: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(record["block_number"], 19_000_000);
        assert_eq!(record["log_index"], 7);
        assert_eq!(record["event"], "Transfer");
        assert_eq!(record["transaction_hash"], format!("{}", B256::repeat_byte(0x22)));
        assert_eq!(record["args"]["from"], "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045");
        assert_eq!(record["args"]["value"], 1000);
        assert_eq!(record["args"]["huge"], U256::MAX.to_string());
        assert_eq!(record["args"]["delta"], -5);
        assert_eq!(record["args"]["pair"], json!([true, "0xabcd"]));

        let keys: Vec<_> = record["args"].as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, ["from", "value", "huge", "delta", "pair"]);
    }

    #[tokio::test]
    async fn reorgs_are_distinct_records() {
        let report = ReorgReport {
            common_ancestor: 99,
            ancestor_hash: B256::repeat_byte(0x99),
            invalidated: vec![
                LogPosition { block_number: 100, log_index: 0 },
                LogPosition { block_number: 101, log_index: 2 },
            ],
            beyond_history: false,
        };

        let text = render(OutputFormat::Text, async |sink| {
            sink.write_reorg(&report).await.unwrap();
        })
        .await;
        assert!(text.trim_end().ends_with(
            "REORG common_ancestor=99 invalidated=[100:0,101:2] beyond_history=false"
        ));

        let json = render(OutputFormat::Json, async |sink| {
            sink.write_reorg(&report).await.unwrap();
        })
        .await;
        let record: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(record["reorg"]["common_ancestor"], 99);
        assert_eq!(record["reorg"]["invalidated"][1], json!({"block_number": 101, "log_index": 2}));
    }
}
