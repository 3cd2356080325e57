//! Chain tail: projects Voting-contract events into the metadata store.
//!
//! The tail is the sole writer of activations, votes and the cursor. It
//! polls rather than holding server-side filters, so it survives RPC
//! provider swaps; the price is a lag bounded by the poll interval plus
//! the window size. Each pass applies one window in a single store
//! transaction, so a crash between fetch and commit replays the window,
//! and the store-level guards make the replay a no-op.

use crate::chain::ChainReader;
use crate::error::{AppError, AppResult};
use crate::repo::{ApplyOutcome, ChainEvent, TailSink};
use ethers::abi::RawLog;
use ethers::contract::EthEvent;
use ethers::core::types::{Log, H160, H256, U256};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, EthEvent)]
#[ethevent(name = "PollCreated", abi = "PollCreated(bytes32,address)")]
pub struct PollCreatedEvent {
    #[ethevent(indexed)]
    pub poll_id: H256,
    #[ethevent(indexed)]
    pub creator: H160,
}

#[derive(Debug, Clone, EthEvent)]
#[ethevent(name = "PollActivated", abi = "PollActivated(bytes32,uint256)")]
pub struct PollActivatedEvent {
    #[ethevent(indexed)]
    pub poll_id: H256,
    pub group_id: U256,
}

#[derive(Debug, Clone, EthEvent)]
#[ethevent(name = "VoteCast", abi = "VoteCast(bytes32,uint8,uint256)")]
pub struct VoteCastEvent {
    #[ethevent(indexed)]
    pub poll_id: H256,
    pub option_index: u8,
    pub nullifier_hash: U256,
}

#[derive(Clone, Debug)]
pub struct TailConfig {
    pub poll_interval: Duration,
    pub max_window: u64,
    pub confirmations: u64,
    pub start_block: u64,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(4),
            max_window: 2_000,
            confirmations: 1,
            start_block: 0,
        }
    }
}

/// Result of one tail pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailStep {
    /// Nothing beyond the cursor yet.
    Idle,
    /// A window was applied and the cursor advanced to `window_end`.
    Applied { window_end: u64, events: usize },
}

const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

pub fn spawn_tail<C, S>(cfg: TailConfig, reader: Arc<C>, store: Arc<S>) -> JoinHandle<()>
where
    C: ChainReader + 'static,
    S: TailSink + Send + Sync + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = run_tail(cfg, reader, store).await {
            error!("tail exited with error: {e:?}");
        }
    })
}

/// The long-lived loop. RPC failures back off exponentially and retry
/// without touching the cursor; storage failures abort so a supervisor
/// restarts the process from the durable cursor.
pub async fn run_tail<C, S>(cfg: TailConfig, reader: Arc<C>, store: Arc<S>) -> AppResult<()>
where
    C: ChainReader + 'static,
    S: TailSink + Send + Sync + 'static,
{
    info!(
        max_window = cfg.max_window,
        confirmations = cfg.confirmations,
        start_block = cfg.start_block,
        "tail started"
    );
    let mut backoff = BACKOFF_MIN;
    loop {
        match run_tail_once(&cfg, reader.as_ref(), store.as_ref()).await {
            Ok(TailStep::Idle) => {
                backoff = BACKOFF_MIN;
                tokio::time::sleep(cfg.poll_interval).await;
            }
            Ok(TailStep::Applied { window_end, events }) => {
                backoff = BACKOFF_MIN;
                debug!(window_end, events, "tail window applied");
                // Loop again immediately: there may be a backlog of windows.
            }
            Err(AppError::Chain(e)) => {
                warn!(delay_secs = backoff.as_secs(), "tail rpc error, backing off: {e}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
            Err(other) => return Err(other),
        }
    }
}

/// One pass of the loop: cursor → head → bounded window → fetch the three
/// event streams → merge in `(block, log_index)` order → apply as one
/// batch. Exposed so tests can drive the tail deterministically.
pub async fn run_tail_once<C, S>(cfg: &TailConfig, reader: &C, store: &S) -> AppResult<TailStep>
where
    C: ChainReader + ?Sized,
    S: TailSink + ?Sized,
{
    let cursor = store.load_cursor().await?.max(cfg.start_block);
    let head = reader.block_number().await?;
    let safe_head = head.saturating_sub(cfg.confirmations.saturating_sub(1));
    if safe_head <= cursor {
        return Ok(TailStep::Idle);
    }
    let window_end = safe_head.min(cursor + cfg.max_window);

    let mut events: Vec<ChainEvent> = Vec::new();
    for topic0 in [
        PollCreatedEvent::signature(),
        PollActivatedEvent::signature(),
        VoteCastEvent::signature(),
    ] {
        let logs = reader.logs(cursor + 1, window_end, topic0).await?;
        for log in logs {
            match decode_event(&log) {
                Some(event) => events.push(event),
                None => warn!(
                    tx = ?log.transaction_hash,
                    "undecodable log in tail window, skipping"
                ),
            }
        }
    }
    // Total order across the three streams; within a block this preserves
    // activate-before-vote.
    events.sort_by_key(ChainEvent::position);

    let count = events.len();
    let outcomes = store.apply_tail_batch(&events, window_end).await?;
    for (event, outcome) in events.iter().zip(outcomes.iter()) {
        log_outcome(event, *outcome);
    }
    Ok(TailStep::Applied {
        window_end,
        events: count,
    })
}

/// Decodes a raw log into a `ChainEvent`. Logs still pending (no block
/// number) are rejected; the tail only reads mined ranges.
pub fn decode_event(log: &Log) -> Option<ChainEvent> {
    let block_number = log.block_number?.as_u64();
    let log_index = log.log_index?.as_u64();
    let tx_hash = log
        .transaction_hash
        .map(|h| format!("{h:#x}"))
        .unwrap_or_default();
    let raw: RawLog = log.clone().into();

    if let Ok(ev) = PollCreatedEvent::decode_log(&raw) {
        return Some(ChainEvent::PollCreated {
            poll_id: format!("{:#x}", ev.poll_id),
            creator: format!("{:#x}", ev.creator),
            tx_hash,
            block_number,
            log_index,
        });
    }
    if let Ok(ev) = PollActivatedEvent::decode_log(&raw) {
        return Some(ChainEvent::PollActivated {
            poll_id: format!("{:#x}", ev.poll_id),
            group_id: ev.group_id.to_string(),
            tx_hash,
            block_number,
            log_index,
        });
    }
    if let Ok(ev) = VoteCastEvent::decode_log(&raw) {
        return Some(ChainEvent::VoteCast {
            poll_id: format!("{:#x}", ev.poll_id),
            option_index: ev.option_index,
            nullifier_hash: ev.nullifier_hash.to_string(),
            tx_hash,
            block_number,
            log_index,
        });
    }
    None
}

fn log_outcome(event: &ChainEvent, outcome: ApplyOutcome) {
    let poll_id = event.poll_id();
    let (block, index) = event.position();
    match outcome {
        ApplyOutcome::Activated => info!(poll_id, block, "poll activated"),
        ApplyOutcome::VoteRecorded => info!(poll_id, block, index, "vote recorded"),
        ApplyOutcome::DraftStamped => debug!(poll_id, block, "creation tx stamped on draft"),
        ApplyOutcome::CreatorPending => {
            info!(poll_id, block, "PollCreated for unknown poll, creator binding recorded")
        }
        ApplyOutcome::AlreadyActive => debug!(poll_id, block, "activation replayed, dropped"),
        ApplyOutcome::ActivationMissingRoster => {
            warn!(poll_id, block, "activation for roster-less poll, dropped")
        }
        ApplyOutcome::ActivationUnknownPoll => {
            warn!(poll_id, block, "activation for unknown poll, dropped")
        }
        ApplyOutcome::VoteDuplicate => debug!(poll_id, block, index, "duplicate nullifier, dropped"),
        ApplyOutcome::VoteBadOption => {
            warn!(poll_id, block, index, "vote with out-of-range option, dropped")
        }
        ApplyOutcome::VoteUnknownPoll => {
            warn!(poll_id, block, index, "vote for unknown poll, dropped")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::abi::{self, Token};
    use ethers::core::types::{Bytes, U64};

    fn mined(mut log: Log, block: u64, index: u64) -> Log {
        log.block_number = Some(U64::from(block));
        log.log_index = Some(U256::from(index));
        log.transaction_hash = Some(H256::from_low_u64_be(block * 1000 + index));
        log
    }

    fn activated_log(poll_id: H256, group_id: u64) -> Log {
        Log {
            topics: vec![PollActivatedEvent::signature(), poll_id],
            data: Bytes::from(abi::encode(&[Token::Uint(U256::from(group_id))])),
            ..Default::default()
        }
    }

    fn vote_log(poll_id: H256, option_index: u8, nullifier: u64) -> Log {
        Log {
            topics: vec![VoteCastEvent::signature(), poll_id],
            data: Bytes::from(abi::encode(&[
                Token::Uint(U256::from(option_index)),
                Token::Uint(U256::from(nullifier)),
            ])),
            ..Default::default()
        }
    }

    #[test]
    fn decodes_activation_and_vote_logs() {
        let poll_id = H256::from_low_u64_be(0x7a);
        let log = mined(activated_log(poll_id, 42), 10, 0);
        match decode_event(&log) {
            Some(ChainEvent::PollActivated {
                poll_id: id,
                group_id,
                block_number,
                ..
            }) => {
                assert_eq!(id, format!("{poll_id:#x}"));
                assert_eq!(group_id, "42");
                assert_eq!(block_number, 10);
            }
            other => panic!("unexpected decode: {other:?}"),
        }

        let log = mined(vote_log(poll_id, 1, 0xdead), 13, 2);
        match decode_event(&log) {
            Some(ChainEvent::VoteCast {
                option_index,
                nullifier_hash,
                log_index,
                ..
            }) => {
                assert_eq!(option_index, 1);
                assert_eq!(nullifier_hash, U256::from(0xdeadu64).to_string());
                assert_eq!(log_index, 2);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn pending_logs_are_rejected() {
        let log = activated_log(H256::from_low_u64_be(1), 7);
        assert!(decode_event(&log).is_none());
    }

    #[test]
    fn merge_order_is_block_then_log_index() {
        let poll_id = H256::from_low_u64_be(0x7a);
        let mut events: Vec<ChainEvent> = vec![
            decode_event(&mined(vote_log(poll_id, 0, 1), 12, 3)).unwrap(),
            decode_event(&mined(vote_log(poll_id, 0, 2), 11, 9)).unwrap(),
            decode_event(&mined(activated_log(poll_id, 42), 11, 1)).unwrap(),
        ];
        events.sort_by_key(ChainEvent::position);
        let positions: Vec<(u64, u64)> = events.iter().map(ChainEvent::position).collect();
        assert_eq!(positions, vec![(11, 1), (11, 9), (12, 3)]);
    }
}
