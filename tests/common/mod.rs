#![allow(dead_code)]

use std::time::Duration;

use chainsub::{
    BlockPointer, Cursor, LiveMode, LogPollerBuilder, PollerHandle, PollerState, PollerStream,
    test_utils::{MockChain, counter_chain},
};

pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Fast settings for a chain that answers instantly.
pub fn builder() -> LogPollerBuilder {
    LogPollerBuilder::new()
        .poll_interval(POLL_INTERVAL)
        .reconnect_delay(Duration::from_millis(5), Duration::from_millis(20))
        .safety_margin(0)
        .max_block_range(10)
        .live_mode(LiveMode::Polling)
}

pub fn chain() -> MockChain {
    counter_chain()
}

pub async fn start(
    chain: &MockChain,
    builder: LogPollerBuilder,
    start: BlockPointer,
    resume: Option<Cursor>,
) -> anyhow::Result<(PollerStream, PollerHandle)> {
    let poller = builder.build(chain.clone(), chain.filter())?;
    Ok(poller.start(start, resume).await?)
}

pub async fn wait_for_state(handle: &PollerHandle, state: PollerState) -> anyhow::Result<()> {
    let mut states = handle.subscribe_state();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|current| *current == state))
        .await??;
    Ok(())
}

pub fn positions(logs: &[chainsub::LogEntry]) -> Vec<(u64, u64)> {
    logs.iter().map(|log| (log.block_number, log.log_index)).collect()
}
