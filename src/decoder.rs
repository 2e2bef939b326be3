//! Turns raw logs of the watched event into named, typed arguments.

use alloy::{
    dyn_abi::{DynSolType, DynSolValue},
    primitives::{Address, B256},
};
use indexmap::IndexMap;
use thiserror::Error;

use crate::{ListenerError, abi::EventSchema, log_entry::LogEntry};

/// Why a log could not be decoded. The log is skipped, the session continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("topic0 {found:?} does not match event signature {expected}")]
    SignatureMismatch { expected: B256, found: Option<B256> },

    #[error("expected {expected} topics, log has {found}")]
    TopicCount { expected: usize, found: usize },

    #[error("expected {expected} bytes of data, log has {found}")]
    DataLength { expected: usize, found: usize },

    #[error("ABI decoding failed: {0}")]
    Abi(String),
}

impl From<alloy::dyn_abi::Error> for DecodeError {
    fn from(err: alloy::dyn_abi::Error) -> Self {
        DecodeError::Abi(err.to_string())
    }
}

/// Where a decoded event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRef {
    pub address: Address,
    pub block_number: u64,
    pub block_hash: B256,
    pub transaction_hash: B256,
    pub log_index: u64,
}

impl From<&LogEntry> for LogRef {
    fn from(log: &LogEntry) -> Self {
        Self {
            address: log.address,
            block_number: log.block_number,
            block_hash: log.block_hash,
            transaction_hash: log.transaction_hash,
            log_index: log.log_index,
        }
    }
}

/// A log decoded against the event schema. Arguments keep declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub name: String,
    pub args: IndexMap<String, DynSolValue>,
    pub origin: LogRef,
}

#[derive(Debug, Clone)]
struct Input {
    name: String,
    ty: DynSolType,
    indexed: bool,
}

/// Decodes logs of a single event.
#[derive(Debug, Clone)]
pub struct EventDecoder {
    name: String,
    selector: B256,
    inputs: Vec<Input>,
    indexed_count: usize,
    /// Non-indexed inputs as one tuple, the layout of the data blob.
    body: DynSolType,
    /// Exact data length when every non-indexed input is static.
    body_len: Option<usize>,
}

impl EventDecoder {
    /// Prepare a decoder for `schema`, resolving every input type up front.
    pub fn new(schema: &EventSchema) -> Result<Self, ListenerError> {
        let inputs = schema
            .inputs
            .iter()
            .map(|input| {
                let ty = DynSolType::parse(&input.ty).map_err(|err| {
                    ListenerError::InvalidAbi(format!("{}: unsupported type {}: {err}", schema.signature, input.ty))
                })?;
                Ok(Input { name: input.name.clone(), ty, indexed: input.indexed })
            })
            .collect::<Result<Vec<_>, ListenerError>>()?;

        let body_types: Vec<DynSolType> =
            inputs.iter().filter(|input| !input.indexed).map(|input| input.ty.clone()).collect();
        let body_len = body_types
            .iter()
            .map(static_words)
            .sum::<Option<usize>>()
            .map(|words| words * 32);

        Ok(Self {
            name: schema.name.clone(),
            selector: schema.selector,
            indexed_count: inputs.iter().filter(|input| input.indexed).count(),
            inputs,
            body: DynSolType::Tuple(body_types),
            body_len,
        })
    }

    #[must_use]
    pub fn selector(&self) -> B256 {
        self.selector
    }

    pub fn decode(&self, log: &LogEntry) -> Result<DecodedEvent, DecodeError> {
        let found = log.topic0().copied();
        if found != Some(self.selector) {
            return Err(DecodeError::SignatureMismatch { expected: self.selector, found });
        }
        if log.topics.len() != self.indexed_count + 1 {
            return Err(DecodeError::TopicCount {
                expected: self.indexed_count + 1,
                found: log.topics.len(),
            });
        }
        if let Some(expected) = self.body_len &&
            log.data.len() != expected
        {
            return Err(DecodeError::DataLength { expected, found: log.data.len() });
        }

        let mut body = match self.body.abi_decode_sequence(&log.data)? {
            DynSolValue::Tuple(values) => values.into_iter(),
            other => {
                return Err(DecodeError::Abi(format!("expected a tuple of arguments, got {other:?}")));
            }
        };
        let mut topics = log.topics[1..].iter();

        let mut args = IndexMap::with_capacity(self.inputs.len());
        for (position, input) in self.inputs.iter().enumerate() {
            let value = if input.indexed {
                let topic = topics.next().ok_or(DecodeError::TopicCount {
                    expected: self.indexed_count + 1,
                    found: log.topics.len(),
                })?;
                decode_topic(&input.ty, topic)?
            } else {
                body.next().ok_or_else(|| DecodeError::Abi("data holds fewer values than declared".into()))?
            };

            let name = if args.contains_key(&input.name) {
                format!("arg{position}")
            } else {
                input.name.clone()
            };
            args.insert(name, value);
        }

        Ok(DecodedEvent { name: self.name.clone(), args, origin: LogRef::from(log) })
    }
}

/// Indexed reference types are stored as the keccak hash of their encoding, which cannot be
/// reversed, so they surface as the raw 32-byte topic.
fn decode_topic(ty: &DynSolType, topic: &B256) -> Result<DynSolValue, DecodeError> {
    match ty {
        DynSolType::String |
        DynSolType::Bytes |
        DynSolType::Array(_) |
        DynSolType::FixedArray(..) |
        DynSolType::Tuple(_) => Ok(DynSolValue::FixedBytes(*topic, 32)),
        _ => Ok(ty.abi_decode(topic.as_slice())?),
    }
}

/// Head size in words, `None` for dynamic types.
fn static_words(ty: &DynSolType) -> Option<usize> {
    match ty {
        DynSolType::FixedArray(inner, len) => static_words(inner).map(|words| words * len),
        DynSolType::Tuple(items) => items.iter().map(static_words).sum(),
        DynSolType::String | DynSolType::Bytes | DynSolType::Array(_) => None,
        _ => Some(1),
    }
}
