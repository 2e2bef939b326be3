use std::{fmt, str::FromStr};

use crate::{ListenerError, robust_provider::LogSource};

/// Where a session starts: the chain head at startup or a fixed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockPointer {
    #[default]
    Head,
    Number(u64),
}

impl BlockPointer {
    /// Concrete start block given the current head.
    ///
    /// A number above the head is kept as is; the poller waits for the chain to reach it.
    #[must_use]
    pub fn resolve_against(self, head: u64) -> u64 {
        match self {
            BlockPointer::Head => head,
            BlockPointer::Number(number) => number,
        }
    }

    /// Resolve against the head reported by `source`. Only [`BlockPointer::Head`] queries it.
    pub async fn resolve<S: LogSource>(self, source: &S) -> Result<u64, ListenerError> {
        match self {
            BlockPointer::Head => Ok(source.latest_block().await?),
            BlockPointer::Number(number) => Ok(number),
        }
    }
}

impl FromStr for BlockPointer {
    type Err = ListenerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("latest") || trimmed.eq_ignore_ascii_case("head") {
            return Ok(BlockPointer::Head);
        }
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ListenerError::InvalidBlockSpec(s.to_owned()));
        }
        trimmed
            .parse()
            .map(BlockPointer::Number)
            .map_err(|_| ListenerError::InvalidBlockSpec(s.to_owned()))
    }
}

impl fmt::Display for BlockPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockPointer::Head => f.write_str("latest"),
            BlockPointer::Number(number) => write!(f, "{number}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockChain;
    use alloy::primitives::{Address, B256};

    #[test]
    fn parses_latest_and_numbers() {
        assert_eq!("latest".parse::<BlockPointer>().unwrap(), BlockPointer::Head);
        assert_eq!("LATEST".parse::<BlockPointer>().unwrap(), BlockPointer::Head);
        assert_eq!("0".parse::<BlockPointer>().unwrap(), BlockPointer::Number(0));
        assert_eq!(" 19000000 ".parse::<BlockPointer>().unwrap(), BlockPointer::Number(19_000_000));
    }

    #[test]
    fn rejects_malformed_specs() {
        for spec in ["", "-1", "+5", "0x10", "12.5", "earliest", "99999999999999999999999"] {
            assert!(
                matches!(spec.parse::<BlockPointer>(), Err(ListenerError::InvalidBlockSpec(_))),
                "{spec:?} should be rejected"
            );
        }
    }

    #[test]
    fn future_blocks_resolve_unchanged() {
        assert_eq!(BlockPointer::Number(500).resolve_against(100), 500);
        assert_eq!(BlockPointer::Head.resolve_against(100), 100);
    }

    #[tokio::test]
    async fn head_queries_the_source() {
        let chain = MockChain::new(Address::ZERO, B256::ZERO);
        chain.mine_empty(7);

        assert_eq!(BlockPointer::Head.resolve(&chain).await.unwrap(), 7);
        assert_eq!(BlockPointer::Number(3).resolve(&chain).await.unwrap(), 3);
    }
}
