mod common;

use std::time::Duration;

use chainsub::{
    BlockPointer, Cursor, Notification, PollerState, assert_closed, assert_next,
    test_utils::{CallKind, take_logs},
};

use crate::common::{builder, chain, positions, start, wait_for_state};

#[tokio::test]
async fn backfills_history_in_bounded_ranges() -> anyhow::Result<()> {
    let chain = chain();
    chain.mine_with_logs(20, 1);

    let builder = builder().max_block_range(4).safety_margin(2);
    let (mut stream, handle) = start(&chain, builder, BlockPointer::Number(5), None).await?;

    let logs = take_logs(&mut stream, 16).await;
    assert_eq!(positions(&logs), (5..=20).map(|block| (block, 0)).collect::<Vec<_>>());
    assert_next!(stream, Notification::SwitchingToLive);

    // backfill stops two blocks short of the head, catch-up covers the rest
    assert_eq!(chain.log_queries(), [5..=8, 9..=12, 13..=16, 17..=18, 19..=20]);

    handle.stop();
    assert_closed!(stream);
    let cursor = handle.join().await?;
    assert_eq!(cursor, Some(Cursor::end_of(&chain.header(20))));
    Ok(())
}

#[tokio::test]
async fn logs_are_ordered_within_and_across_blocks() -> anyhow::Result<()> {
    let chain = chain();
    chain.mine_block(3);
    chain.mine_empty(2);
    chain.mine_block(2);

    let (mut stream, handle) = start(&chain, builder(), BlockPointer::Number(1), None).await?;

    let logs = take_logs(&mut stream, 5).await;
    assert_eq!(positions(&logs), [(1, 0), (1, 1), (1, 2), (4, 0), (4, 1)]);
    assert_eq!(logs, chain.logs());

    handle.stop();
    Ok(())
}

#[tokio::test]
async fn latest_starts_at_the_current_head() -> anyhow::Result<()> {
    let chain = chain();
    chain.mine_with_logs(10, 1);

    let (mut stream, handle) = start(&chain, builder(), BlockPointer::Head, None).await?;

    let logs = take_logs(&mut stream, 1).await;
    assert_eq!(positions(&logs), [(10, 0)]);
    assert_next!(stream, Notification::SwitchingToLive);

    handle.stop();
    Ok(())
}

#[tokio::test]
async fn future_start_block_waits_for_the_chain() -> anyhow::Result<()> {
    let chain = chain();
    chain.mine_with_logs(3, 1);

    let (mut stream, handle) = start(&chain, builder(), BlockPointer::Number(6), None).await?;
    assert_next!(stream, Notification::SwitchingToLive);
    assert_eq!(handle.state(), PollerState::Live);

    chain.mine_with_logs(5, 1);
    let logs = take_logs(&mut stream, 3).await;
    assert_eq!(positions(&logs), [(6, 0), (7, 0), (8, 0)]);

    handle.stop();
    Ok(())
}

#[tokio::test]
async fn empty_history_reaches_live() -> anyhow::Result<()> {
    let chain = chain();
    chain.mine_empty(30);

    let (mut stream, handle) = start(&chain, builder(), BlockPointer::Number(0), None).await?;
    assert_next!(stream, Notification::SwitchingToLive);
    wait_for_state(&handle, PollerState::Live).await?;

    handle.stop();
    assert_closed!(stream);
    assert_eq!(handle.join().await?, Some(Cursor::end_of(&chain.header(30))));
    Ok(())
}

#[tokio::test]
async fn resumes_after_a_partially_delivered_block() -> anyhow::Result<()> {
    let chain = chain();
    chain.mine_with_logs(6, 3);

    let (mut first, handle) = start(&chain, builder(), BlockPointer::Number(1), None).await?;
    let delivered = take_logs(&mut first, 14).await;
    handle.stop();
    let last = delivered.last().unwrap();
    assert_eq!((last.block_number, last.log_index), (5, 1));

    let resume = Cursor::after_log(last);
    let (mut second, handle) =
        start(&chain, builder(), BlockPointer::Number(1), Some(resume)).await?;

    let rest = take_logs(&mut second, 4).await;
    assert_eq!(positions(&rest), [(5, 2), (6, 0), (6, 1), (6, 2)]);
    assert_next!(second, Notification::SwitchingToLive);

    handle.stop();
    Ok(())
}

#[tokio::test]
async fn resumes_after_a_completed_block() -> anyhow::Result<()> {
    let chain = chain();
    chain.mine_with_logs(6, 1);

    let resume = Cursor::end_of(&chain.header(4));
    let (mut stream, handle) = start(&chain, builder(), BlockPointer::Head, Some(resume)).await?;

    let logs = take_logs(&mut stream, 2).await;
    assert_eq!(positions(&logs), [(5, 0), (6, 0)]);

    handle.stop();
    Ok(())
}

#[tokio::test]
async fn full_queue_pauses_range_queries() -> anyhow::Result<()> {
    let chain = chain();
    chain.mine_with_logs(50, 1);

    let builder = builder().max_block_range(1).buffer_high_watermark(4).buffer_low_watermark(1);
    let (mut stream, handle) = start(&chain, builder, BlockPointer::Number(1), None).await?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(stream.pending(), 4);
    assert!(chain.count_calls(CallKind::GetLogs) <= 5);
    assert_eq!(handle.state(), PollerState::Backfilling);

    let logs = take_logs(&mut stream, 50).await;
    assert_eq!(positions(&logs), (1..=50).map(|block| (block, 0)).collect::<Vec<_>>());

    handle.stop();
    Ok(())
}

#[tokio::test]
async fn dropping_the_stream_stops_the_poller() -> anyhow::Result<()> {
    let chain = chain();
    chain.mine_with_logs(10, 1);

    let (stream, handle) = start(&chain, builder(), BlockPointer::Number(1), None).await?;
    drop(stream);

    let cursor = tokio::time::timeout(Duration::from_secs(5), handle.join()).await??;
    assert!(cursor.is_none_or(|cursor| cursor.block_number <= 10));
    Ok(())
}
