mod common;

use std::{io, time::Duration};

use alloy::primitives::Bytes;
use chainsub::{
    BlockPointer, Cursor, DecodedEvent, EventSink, Listener, ListenerError, OutputFormat,
    ReorgReport, WriterSink,
    test_utils::{COUNTER_ADDRESS, CallKind, MockChain, counter_schema, fatal_error},
};
use serde_json::Value;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::common::{builder, chain};

type Outcome = (Result<Option<Cursor>, ListenerError>, Vec<u8>);

struct Running {
    cancel: CancellationToken,
    written: watch::Receiver<Option<Cursor>>,
    task: JoinHandle<Outcome>,
}

impl Running {
    async fn wait_until(&mut self, done: impl FnMut(&Option<Cursor>) -> bool) -> anyhow::Result<()> {
        tokio::time::timeout(Duration::from_secs(5), self.written.wait_for(done)).await??;
        Ok(())
    }

    async fn stop(self) -> anyhow::Result<(Result<Option<Cursor>, ListenerError>, Vec<Value>)> {
        self.cancel.cancel();
        let (result, output) = tokio::time::timeout(Duration::from_secs(5), self.task).await??;
        let records = String::from_utf8(output)?
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<Vec<Value>, _>>()?;
        Ok((result, records))
    }
}

fn listener(chain: &MockChain, cancel: &CancellationToken) -> Listener<MockChain> {
    Listener::new(chain.clone(), counter_schema(), COUNTER_ADDRESS)
        .poller(builder().cancellation_token(cancel.clone()))
        .start_at(BlockPointer::Number(1))
}

fn spawn(listener: Listener<MockChain>, cancel: CancellationToken) -> Running {
    let written = listener.subscribe_cursor();
    let task = tokio::spawn(async move {
        let mut sink = WriterSink::new(Vec::new(), OutputFormat::Json);
        let result = listener.run(&mut sink).await;
        (result, sink.into_inner())
    });
    Running { cancel, written, task }
}

fn at_block(number: u64) -> impl FnMut(&Option<Cursor>) -> bool {
    move |cursor| cursor.is_some_and(|cursor| cursor.block_number >= number)
}

fn counts(records: &[Value]) -> Vec<u64> {
    records.iter().filter_map(|record| record["args"]["newCount"].as_u64()).collect()
}

#[tokio::test]
async fn writes_decoded_events_as_json_lines() -> anyhow::Result<()> {
    let chain = chain();
    chain.mine_with_logs(3, 1);
    let cancel = CancellationToken::new();

    let mut running = spawn(listener(&chain, &cancel), cancel);
    running.wait_until(at_block(3)).await?;
    let (result, records) = running.stop().await?;

    assert_eq!(counts(&records), [1, 2, 3]);
    let first = &records[0];
    assert_eq!(first["event"], "CountIncreased");
    assert_eq!(first["block_number"], 1);
    assert_eq!(first["log_index"], 0);
    assert_eq!(first["address"], COUNTER_ADDRESS.to_checksum(None));
    assert_eq!(first["block_hash"], serde_json::to_value(chain.header(1).hash)?);

    assert_eq!(result?, Some(Cursor::end_of(&chain.header(3))));
    Ok(())
}

#[tokio::test]
async fn undecodable_logs_are_skipped() -> anyhow::Result<()> {
    let chain = chain();
    chain.mine_block(1);
    chain.mine_block_with_data(vec![Bytes::from_static(&[1, 2, 3])]);
    chain.mine_block(1);
    let cancel = CancellationToken::new();

    let mut running = spawn(listener(&chain, &cancel), cancel);
    running.wait_until(at_block(3)).await?;
    let (result, records) = running.stop().await?;

    assert_eq!(counts(&records), [1, 2]);
    assert_eq!(records[1]["block_number"], 3);
    assert!(result?.is_some());
    Ok(())
}

#[tokio::test]
async fn reorgs_are_written_and_replayed() -> anyhow::Result<()> {
    let chain = chain();
    chain.mine_with_logs(5, 1);
    let cancel = CancellationToken::new();

    let mut running = spawn(listener(&chain, &cancel), cancel);
    running.wait_until(at_block(5)).await?;

    chain.reorg(2, 3);
    let replaced = chain.header(5).hash;
    running
        .wait_until(move |cursor| cursor.is_some_and(|cursor| cursor.block_hash == replaced))
        .await?;
    let (result, records) = running.stop().await?;

    assert_eq!(records.len(), 8);
    let reorg = &records[5]["reorg"];
    assert_eq!(reorg["common_ancestor"], 3);
    assert_eq!(reorg["invalidated"].as_array().map(Vec::len), Some(2));
    assert_eq!(reorg["invalidated"][0]["block_number"], 4);
    assert_eq!(reorg["beyond_history"], false);
    assert_eq!(counts(&records), [1, 2, 3, 4, 5, 6, 7]);

    assert_eq!(result?, Some(Cursor::end_of(&chain.header(6))));
    Ok(())
}

#[tokio::test]
async fn resumes_from_a_saved_cursor() -> anyhow::Result<()> {
    let chain = chain();
    chain.mine_with_logs(4, 1);
    let saved = Cursor::end_of(&chain.header(2));
    let cancel = CancellationToken::new();

    let mut running = spawn(listener(&chain, &cancel).resume_from(Some(saved)), cancel);
    assert_eq!(*running.written.borrow(), Some(saved));
    running.wait_until(at_block(4)).await?;
    let (result, records) = running.stop().await?;

    assert_eq!(counts(&records), [3, 4]);
    assert_eq!(result?, Some(Cursor::end_of(&chain.header(4))));
    Ok(())
}

#[tokio::test]
async fn fatal_poller_errors_are_returned() -> anyhow::Result<()> {
    let chain = chain();
    chain.mine_with_logs(2, 1);
    chain.fail_call(CallKind::GetLogs, 0, fatal_error());

    let mut sink = WriterSink::new(Vec::new(), OutputFormat::Text);
    let err = listener(&chain, &CancellationToken::new()).run(&mut sink).await.unwrap_err();

    assert!(matches!(err, ListenerError::RpcError(_)));
    assert!(sink.into_inner().is_empty());
    Ok(())
}

struct BrokenSink;

impl EventSink for BrokenSink {
    async fn write_event(&mut self, _: &DecodedEvent) -> io::Result<()> {
        Err(io::Error::other("disk full"))
    }

    async fn write_reorg(&mut self, _: &ReorgReport) -> io::Result<()> {
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn sink_failure_stops_the_listener() -> anyhow::Result<()> {
    let chain = chain();
    chain.mine_with_logs(3, 1);

    let listener = listener(&chain, &CancellationToken::new());
    let written = listener.subscribe_cursor();
    let err = tokio::time::timeout(Duration::from_secs(5), listener.run(&mut BrokenSink))
        .await?
        .unwrap_err();

    assert!(matches!(err, ListenerError::Sink(_)));
    assert_eq!(*written.borrow(), None);
    Ok(())
}

#[tokio::test]
async fn text_output_is_one_line_per_event() -> anyhow::Result<()> {
    let chain = chain();
    chain.mine_with_logs(2, 1);
    let cancel = CancellationToken::new();

    let listener = listener(&chain, &cancel);
    let mut written = listener.subscribe_cursor();
    let task = tokio::spawn(async move {
        let mut sink = WriterSink::new(Vec::new(), OutputFormat::Text);
        let result = listener.run(&mut sink).await;
        (result, sink.into_inner())
    });
    tokio::time::timeout(Duration::from_secs(5), written.wait_for(at_block(2))).await??;
    cancel.cancel();
    let (result, output) = task.await?;
    result?;

    let output = String::from_utf8(output)?;
    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].ends_with(" CountIncreased newCount=1"), "{}", lines[0]);
    assert!(lines[1].ends_with(" CountIncreased newCount=2"), "{}", lines[1]);
    Ok(())
}
