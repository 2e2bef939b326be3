use std::{
    collections::VecDeque,
    future::ready,
    ops::RangeInclusive,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use alloy::{
    primitives::{Address, B256, Bytes, U256, keccak256},
    rpc::json_rpc::ErrorPayload,
    transports::{RpcError, TransportErrorKind},
};
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, wrappers::UnboundedReceiverStream};

use crate::{
    log_entry::{BlockRef, LogEntry, LogFilter},
    robust_provider::{Error, LogSource, LogStream},
};

/// The kinds of [`LogSource`] calls a [`MockChain`] answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    LatestBlock,
    BlockHeader,
    GetLogs,
    Subscribe,
}

/// A recorded [`LogSource`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    LatestBlock,
    BlockHeader(u64),
    GetLogs(RangeInclusive<u64>),
    Subscribe,
}

impl Call {
    #[must_use]
    pub fn kind(&self) -> CallKind {
        match self {
            Call::LatestBlock => CallKind::LatestBlock,
            Call::BlockHeader(_) => CallKind::BlockHeader,
            Call::GetLogs(_) => CallKind::GetLogs,
            Call::Subscribe => CallKind::Subscribe,
        }
    }
}

#[derive(Debug)]
struct Block {
    header: BlockRef,
    logs: Vec<LogEntry>,
}

#[derive(Debug)]
struct Failure {
    kind: CallKind,
    skip: usize,
    error: Error,
}

#[derive(Debug)]
struct ChainState {
    address: Address,
    topic0: B256,
    /// Canonical chain, indexed by block number.
    blocks: Vec<Block>,
    fork: u64,
    counter: u64,
    pubsub: bool,
    removal_notices: bool,
    subscribers: Vec<mpsc::UnboundedSender<Result<LogEntry, Error>>>,
    failures: VecDeque<Failure>,
    calls: Vec<Call>,
}

/// An in-memory chain emitting one event from one contract.
///
/// Every mined log is a match for `(address, topic0)` whose data is a `uint256` counter that
/// increases across the whole chain, so redelivered logs from replacement blocks are
/// distinguishable from the originals. Clones share the same chain.
#[derive(Debug, Clone)]
pub struct MockChain {
    inner: Arc<Mutex<ChainState>>,
}

impl MockChain {
    /// A chain holding only the genesis block.
    #[must_use]
    pub fn new(address: Address, topic0: B256) -> Self {
        let genesis = BlockRef { number: 0, hash: block_hash(0, 0), parent_hash: B256::ZERO };
        Self {
            inner: Arc::new(Mutex::new(ChainState {
                address,
                topic0,
                blocks: vec![Block { header: genesis, logs: Vec::new() }],
                fork: 0,
                counter: 0,
                pubsub: false,
                removal_notices: true,
                subscribers: Vec::new(),
                failures: VecDeque::new(),
                calls: Vec::new(),
            })),
        }
    }

    /// Let [`LogSource::subscribe_logs`] succeed.
    #[must_use]
    pub fn with_pubsub(self) -> Self {
        self.state().pubsub = true;
        self
    }

    /// Keep orphaned logs off subscriptions, as nodes that never flag logs as removed do.
    #[must_use]
    pub fn without_removal_notices(self) -> Self {
        self.state().removal_notices = false;
        self
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn filter(&self) -> LogFilter {
        let state = self.state();
        LogFilter::new(state.address, state.topic0)
    }

    #[must_use]
    pub fn head(&self) -> u64 {
        self.state().head()
    }

    /// Mine one block carrying `log_count` matching logs and return its number.
    pub fn mine_block(&self, log_count: usize) -> u64 {
        let mut state = self.state();
        let data = (0..log_count).map(|_| state.next_counter()).collect();
        state.mine(data)
    }

    /// Mine one block whose matching logs carry exactly `data`.
    pub fn mine_block_with_data(&self, data: Vec<Bytes>) -> u64 {
        self.state().mine(data)
    }

    pub fn mine_empty(&self, blocks: u64) {
        for _ in 0..blocks {
            self.mine_block(0);
        }
    }

    pub fn mine_with_logs(&self, blocks: u64, logs_per_block: usize) {
        for _ in 0..blocks {
            self.mine_block(logs_per_block);
        }
    }

    /// Replace the newest `depth` blocks with `replacement` new ones.
    ///
    /// Replacement blocks at a height that had logs get the same number of logs with fresh
    /// counter values. Subscribers first see the orphaned logs flagged as removed, unless
    /// [`MockChain::without_removal_notices`] was set, then the replacement logs.
    pub fn reorg(&self, depth: u64, replacement: u64) {
        let mut state = self.state();
        let head = state.head();
        let depth = depth.min(head);
        let keep = usize::try_from(head - depth + 1).unwrap_or(usize::MAX);

        let orphaned = state.blocks.split_off(keep);
        state.fork += 1;
        if state.removal_notices {
            for log in orphaned.iter().flat_map(|block| &block.logs) {
                state.push(&LogEntry { removed: true, ..log.clone() });
            }
        }

        let log_counts: Vec<usize> = orphaned.iter().map(|block| block.logs.len()).collect();
        for i in 0..replacement {
            let count = usize::try_from(i).ok().and_then(|i| log_counts.get(i)).copied().unwrap_or(0);
            let data = (0..count).map(|_| state.next_counter()).collect();
            state.mine(data);
        }
    }

    /// Canonical header at `number`.
    ///
    /// # Panics
    ///
    /// If the block has not been mined.
    #[must_use]
    pub fn header(&self, number: u64) -> BlockRef {
        self.state().block(number).map(|block| block.header).unwrap_or_else(|| panic!("block {number} not mined"))
    }

    /// A matching log at `(number, log_index)` on the canonical block, whether or not the chain
    /// holds it.
    #[must_use]
    pub fn log_in_block(&self, number: u64, log_index: u64) -> LogEntry {
        let state = self.state();
        let header = state.block(number).map_or_else(
            || BlockRef { number, hash: block_hash(number, state.fork), parent_hash: B256::ZERO },
            |block| block.header,
        );
        state.log(&header, log_index, Bytes::new())
    }

    /// Every matching log on the canonical chain, in order.
    #[must_use]
    pub fn logs(&self) -> Vec<LogEntry> {
        self.state().blocks.iter().flat_map(|block| block.logs.clone()).collect()
    }

    /// Canonical matching logs within `range`.
    #[must_use]
    pub fn logs_in(&self, range: RangeInclusive<u64>) -> Vec<LogEntry> {
        self.logs().into_iter().filter(|log| range.contains(&log.block_number)).collect()
    }

    /// Make the `nth` next call of `kind` (0 for the very next one) fail with `error`.
    pub fn fail_call(&self, kind: CallKind, nth: usize, error: Error) {
        self.state().failures.push_back(Failure { kind, skip: nth, error });
    }

    /// End every open subscription stream.
    pub fn close_subscriptions(&self) {
        self.state().subscribers.clear();
    }

    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    #[must_use]
    pub fn count_calls(&self, kind: CallKind) -> usize {
        self.state().calls.iter().filter(|call| call.kind() == kind).count()
    }

    /// Ranges requested through [`LogSource::get_logs`], in order.
    #[must_use]
    pub fn log_queries(&self) -> Vec<RangeInclusive<u64>> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::GetLogs(range) => Some(range.clone()),
                _ => None,
            })
            .collect()
    }

    /// Recorded calls and injected failures, shared by every [`LogSource`] method.
    fn enter(&self, call: Call) -> Result<MutexGuard<'_, ChainState>, Error> {
        let mut state = self.state();
        let kind = call.kind();
        state.calls.push(call);

        if let Some(position) = state.failures.iter().position(|failure| failure.kind == kind) {
            if state.failures[position].skip > 0 {
                state.failures[position].skip -= 1;
            } else if let Some(failure) = state.failures.remove(position) {
                return Err(failure.error);
            }
        }
        Ok(state)
    }
}

/// A failure the poller retries by reconnecting.
#[must_use]
pub fn transient_error() -> Error {
    Error::Timeout
}

/// A failure that ends the session.
#[must_use]
pub fn fatal_error() -> Error {
    Error::RpcError(Arc::new(RpcError::<TransportErrorKind>::ErrorResp(ErrorPayload {
        code: -32602,
        message: "invalid params".into(),
        data: None,
    })))
}

fn block_hash(number: u64, fork: u64) -> B256 {
    keccak256([number.to_be_bytes(), fork.to_be_bytes()].concat())
}

impl ChainState {
    fn head(&self) -> u64 {
        self.blocks.last().map_or(0, |block| block.header.number)
    }

    fn block(&self, number: u64) -> Option<&Block> {
        usize::try_from(number).ok().and_then(|index| self.blocks.get(index))
    }

    fn next_counter(&mut self) -> Bytes {
        self.counter += 1;
        Bytes::from(U256::from(self.counter).to_be_bytes::<32>().to_vec())
    }

    fn log(&self, header: &BlockRef, log_index: u64, data: Bytes) -> LogEntry {
        LogEntry {
            address: self.address,
            topics: vec![self.topic0],
            data,
            block_number: header.number,
            block_hash: header.hash,
            transaction_hash: keccak256([header.hash.as_slice(), &log_index.to_be_bytes()].concat()),
            log_index,
            removed: false,
        }
    }

    fn mine(&mut self, data: Vec<Bytes>) -> u64 {
        let parent = self.blocks.last().map(|block| block.header);
        let number = parent.map_or(0, |parent| parent.number + 1);
        let header = BlockRef {
            number,
            hash: block_hash(number, self.fork),
            parent_hash: parent.map_or(B256::ZERO, |parent| parent.hash),
        };

        let logs: Vec<LogEntry> =
            data.into_iter().zip(0u64..).map(|(data, index)| self.log(&header, index, data)).collect();
        for log in &logs {
            self.push(log);
        }
        self.blocks.push(Block { header, logs });
        number
    }

    fn push(&mut self, log: &LogEntry) {
        self.subscribers.retain(|subscriber| subscriber.send(Ok(log.clone())).is_ok());
    }
}

impl LogSource for MockChain {
    fn latest_block(&self) -> impl Future<Output = Result<u64, Error>> + Send {
        ready(self.enter(Call::LatestBlock).map(|state| state.head()))
    }

    fn block_header(&self, number: u64) -> impl Future<Output = Result<BlockRef, Error>> + Send {
        ready(self.enter(Call::BlockHeader(number)).and_then(|state| {
            state.block(number).map(|block| block.header).ok_or(Error::BlockNotFound(number))
        }))
    }

    fn get_logs(
        &self,
        filter: &LogFilter,
        range: RangeInclusive<u64>,
    ) -> impl Future<Output = Result<Vec<LogEntry>, Error>> + Send {
        let result = self.enter(Call::GetLogs(range.clone())).map(|state| {
            state
                .blocks
                .iter()
                .filter(|block| range.contains(&block.header.number))
                .flat_map(|block| &block.logs)
                .filter(|log| filter.matches(log))
                .cloned()
                .collect()
        });
        ready(result)
    }

    fn supports_subscription(&self) -> bool {
        self.state().pubsub
    }

    fn subscribe_logs(
        &self,
        filter: &LogFilter,
    ) -> impl Future<Output = Result<LogStream, Error>> + Send {
        let filter = *filter;
        let result: Result<LogStream, Error> = self.enter(Call::Subscribe).and_then(|mut state| {
            if !state.pubsub {
                return Err(Error::RpcError(Arc::new(TransportErrorKind::pubsub_unavailable())));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            state.subscribers.push(tx);
            let stream = UnboundedReceiverStream::new(rx).filter(move |item| match item {
                Ok(log) => filter.matches(log),
                Err(_) => true,
            });
            Ok(Box::pin(stream) as LogStream)
        });
        ready(result)
    }
}
