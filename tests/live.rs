mod common;

use std::time::Duration;

use chainsub::{
    BlockPointer, LiveMode, Notification, PollerState, assert_closed, assert_next,
    test_utils::{CallKind, take_logs},
};

use crate::common::{builder, chain, positions, start, wait_for_state};

#[tokio::test]
async fn polling_picks_up_new_blocks() -> anyhow::Result<()> {
    let chain = chain();
    chain.mine_with_logs(2, 1);

    let (mut stream, handle) = start(&chain, builder(), BlockPointer::Number(1), None).await?;
    take_logs(&mut stream, 2).await;
    assert_next!(stream, Notification::SwitchingToLive);

    chain.mine_block(2);
    chain.mine_empty(1);
    chain.mine_block(1);

    let logs = take_logs(&mut stream, 3).await;
    assert_eq!(positions(&logs), [(3, 0), (3, 1), (5, 0)]);
    assert_eq!(chain.count_calls(CallKind::Subscribe), 0);

    handle.stop();
    assert_closed!(stream);
    Ok(())
}

#[tokio::test]
async fn switching_to_live_is_sent_once() -> anyhow::Result<()> {
    let chain = chain().with_pubsub();
    chain.mine_with_logs(3, 1);

    let builder = builder().live_mode(LiveMode::Auto);
    let (mut stream, handle) = start(&chain, builder, BlockPointer::Number(1), None).await?;
    take_logs(&mut stream, 3).await;
    assert_next!(stream, Notification::SwitchingToLive);

    // a dropped subscription sends the poller through a reconnect and back to live
    chain.close_subscriptions();
    chain.mine_block(1);
    assert_next!(stream, chainsub::ListenerMessage::Data(chain.logs_in(4..=4).remove(0)));

    chain.mine_block(1);
    let logs = take_logs(&mut stream, 1).await;
    assert_eq!(positions(&logs), [(5, 0)]);
    assert!(stream.is_empty());

    handle.stop();
    Ok(())
}

#[tokio::test]
async fn subscription_delivers_pushed_logs() -> anyhow::Result<()> {
    let chain = chain().with_pubsub();
    chain.mine_with_logs(3, 1);

    let builder = builder().live_mode(LiveMode::Auto);
    let (mut stream, handle) = start(&chain, builder, BlockPointer::Number(1), None).await?;
    take_logs(&mut stream, 3).await;
    assert_next!(stream, Notification::SwitchingToLive);
    let queries = chain.count_calls(CallKind::GetLogs);

    for _ in 0..4 {
        chain.mine_block(2);
    }
    let logs = take_logs(&mut stream, 8).await;
    let expected: Vec<_> = (4..=7).flat_map(|block| [(block, 0), (block, 1)]).collect();
    assert_eq!(positions(&logs), expected);
    assert_eq!(logs, chain.logs_in(4..=7));

    assert_eq!(chain.count_calls(CallKind::Subscribe), 1);
    assert_eq!(chain.count_calls(CallKind::GetLogs), queries);

    handle.stop();
    assert_closed!(stream);
    Ok(())
}

#[tokio::test]
async fn forced_polling_ignores_pubsub() -> anyhow::Result<()> {
    let chain = chain().with_pubsub();
    chain.mine_with_logs(1, 1);

    let (mut stream, handle) = start(&chain, builder(), BlockPointer::Number(1), None).await?;
    take_logs(&mut stream, 1).await;
    chain.mine_block(1);
    take_logs(&mut stream, 1).await;

    assert_eq!(chain.count_calls(CallKind::Subscribe), 0);
    handle.stop();
    Ok(())
}

#[tokio::test]
async fn state_follows_the_session() -> anyhow::Result<()> {
    let chain = chain();
    chain.mine_empty(5);

    let (mut stream, handle) = start(&chain, builder(), BlockPointer::Number(1), None).await?;
    wait_for_state(&handle, PollerState::Live).await?;
    assert_next!(stream, Notification::SwitchingToLive);

    let mut states = handle.subscribe_state();
    handle.stop();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|state| *state == PollerState::Stopped))
        .await??;
    assert_closed!(stream);
    Ok(())
}

#[tokio::test]
async fn cursor_updates_are_observable() -> anyhow::Result<()> {
    let chain = chain();
    chain.mine_with_logs(2, 1);

    let (mut stream, handle) = start(&chain, builder(), BlockPointer::Number(1), None).await?;
    let mut cursor = handle.subscribe_cursor();
    take_logs(&mut stream, 2).await;

    chain.mine_block(1);
    take_logs(&mut stream, 1).await;
    let target = chain.header(3);
    tokio::time::timeout(
        Duration::from_secs(5),
        cursor.wait_for(|cursor| cursor.is_some_and(|cursor| cursor.block_number == 3)),
    )
    .await??;
    assert_eq!(handle.cursor().map(|cursor| cursor.block_hash), Some(target.hash));

    handle.stop();
    Ok(())
}
