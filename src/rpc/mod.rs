use std::collections::BTreeMap;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_rpc_types_eth::{Filter, Log};
use alloy_sol_types::{sol, SolEvent};
use alloy_transport::{RpcError, TransportError, TransportResult};
use referral_tracker::backfill::STEPPED_CHUNK_BLOCKS;
use referral_tracker::web3::{classify_rpc_error, RpcErrorKind};
use referral_tracker::{
    EventId, EventSource, LiveCallback, SourceError, SubscriptionId, TransferEvent, TransferFilter,
};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use crate::config::AppConfig;

sol! {
    event Transfer(address indexed from, address indexed to, uint256 value);
}

//==================== provider ====================//

/// Blocking front for an alloy HTTP provider. Every call is bounded by the
/// request timeout and retried with linear back-off.
pub struct RpcClient {
    provider: DynProvider,
    runtime: Runtime,
    timeout: Duration,
    retries: u32,
    backoff: Duration,
}

impl RpcClient {
    pub fn new(url: &str, timeout: Duration, retries: u32) -> Result<Self, SourceError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("referpay-rpc")
            .enable_all()
            .build()
            .map_err(|e| SourceError::Unavailable(format!("failed to start rpc runtime: {e}")))?;
        let provider = runtime
            .block_on(ProviderBuilder::new().connect(url))
            .map_err(|e| SourceError::Unavailable(format!("invalid rpc url {url:?}: {e}")))?
            .erased();
        Ok(Self {
            provider,
            runtime,
            timeout,
            retries: retries.max(1),
            backoff: Duration::from_secs(1),
        })
    }

    /// Errors that a retry cannot fix (range limits, malformed answers)
    /// return immediately.
    fn call<T, F, Fut>(&self, method: &str, op: F) -> Result<T, SourceError>
    where
        F: Fn() -> Fut,
        Fut: IntoFuture<Output = TransportResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self
                .runtime
                .block_on(async { tokio::time::timeout(self.timeout, op()).await });
            let err = match result {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => source_error(err),
                Err(_) => SourceError::Unavailable(format!(
                    "{method} timed out after {}s",
                    self.timeout.as_secs()
                )),
            };
            let retryable = match &err {
                SourceError::Rpc(message) => classify_rpc_error(message).is_retryable(),
                SourceError::Unavailable(_) => true,
                SourceError::RangeTooLarge { .. } | SourceError::Decode(_) => false,
            };
            if !retryable || attempt >= self.retries {
                return Err(err);
            }
            let delay = self.backoff * attempt;
            debug!(method, attempt, ?delay, error = %err, "retrying rpc call");
            thread::sleep(delay);
        }
    }

    pub fn block_number(&self) -> Result<u64, SourceError> {
        self.call("eth_blockNumber", || self.provider.get_block_number())
    }

    pub fn chain_id(&self) -> Result<u64, SourceError> {
        self.call("eth_chainId", || self.provider.get_chain_id())
    }

    pub fn transfer_logs(
        &self,
        filter: &TransferFilter,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferEvent>, SourceError> {
        let query = transfer_filter(filter, from_block, to_block);
        let logs = self
            .call("eth_getLogs", || self.provider.get_logs(&query))
            .map_err(|err| match err {
                SourceError::Rpc(message)
                    if classify_rpc_error(&message) == RpcErrorKind::RangeTooLarge =>
                {
                    SourceError::RangeTooLarge {
                        from: from_block,
                        to: to_block,
                    }
                }
                other => other,
            })?;
        Ok(decode_logs(logs))
    }
}

fn source_error(err: TransportError) -> SourceError {
    match err {
        RpcError::ErrorResp(payload) => {
            SourceError::Rpc(format!("{} (code {})", payload.message, payload.code))
        }
        RpcError::Transport(kind) => SourceError::Unavailable(kind.to_string()),
        RpcError::DeserError { err, .. } => SourceError::Decode(err.to_string()),
        other => SourceError::Rpc(other.to_string()),
    }
}

//==================== logs ====================//

fn transfer_filter(filter: &TransferFilter, from_block: u64, to_block: u64) -> Filter {
    Filter::new()
        .address(filter.token)
        .from_block(from_block)
        .to_block(to_block)
        .event_signature(Transfer::SIGNATURE_HASH)
        .topic1(filter.from.into_word())
        .topic2(filter.to.into_word())
}

/// Decode Transfer logs. Reorged-out logs are dropped; logs that fail to
/// decode are logged and skipped so one bad entry cannot block a range.
fn decode_logs(logs: Vec<Log>) -> Vec<TransferEvent> {
    let mut events = Vec::with_capacity(logs.len());
    for log in logs {
        if log.removed {
            continue;
        }
        let Some(block_number) = log.block_number else {
            warn!(tx = ?log.transaction_hash, "skipping pending Transfer log");
            continue;
        };
        match Transfer::decode_log(&log.inner) {
            Ok(transfer) => events.push(TransferEvent {
                from: transfer.from,
                to: transfer.to,
                value: transfer.value,
                block_number,
                id: log
                    .transaction_hash
                    .zip(log.log_index)
                    .map(|(tx_hash, log_index)| EventId { tx_hash, log_index }),
            }),
            Err(e) => warn!(error = ?e, block_number, "failed to decode Transfer log"),
        }
    }
    events
}

/// Scan `last_seen + 1 ..= head` in slices of at most `chunk` blocks,
/// delivering events slice by slice. Returns the last block scanned; a failed
/// slice stops the walk so the next tick resumes at that slice.
fn catch_up<F, D>(mut fetch: F, mut deliver: D, last_seen: u64, head: u64, chunk: u64) -> u64
where
    F: FnMut(u64, u64) -> Result<Vec<TransferEvent>, SourceError>,
    D: FnMut(TransferEvent),
{
    let chunk = chunk.max(1);
    let mut scanned = last_seen;
    while scanned < head {
        let from = scanned + 1;
        let to = scanned.saturating_add(chunk).min(head);
        match fetch(from, to) {
            Ok(events) => {
                for event in events {
                    deliver(event);
                }
                scanned = to;
            }
            Err(e) => {
                warn!(from, to, error = %e, "live poll failed; retrying next tick");
                break;
            }
        }
    }
    scanned
}

//==================== event source ====================//

/// Event source backed by a JSON-RPC node. Live updates come from one polling
/// thread per subscription.
pub struct JsonRpcEventSource {
    client: Arc<RpcClient>,
    poll_interval: Duration,
    subscriptions: Mutex<BTreeMap<SubscriptionId, Arc<AtomicBool>>>,
    next_id: AtomicU64,
}

impl JsonRpcEventSource {
    pub fn new(client: RpcClient, poll_interval: Duration) -> Self {
        Self {
            client: Arc::new(client),
            poll_interval,
            subscriptions: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn connect(config: &AppConfig) -> Result<Self, SourceError> {
        let client = RpcClient::new(&config.rpc_url, config.request_timeout(), config.rpc_retries)?;
        match client.chain_id() {
            Ok(id) if id == config.chain_id => debug!(chain_id = id, "chain verified"),
            Ok(id) => warn!(
                expected = config.chain_id,
                actual = id,
                "rpc endpoint is on an unexpected chain"
            ),
            Err(e) => warn!(error = %e, "could not verify chain id"),
        }
        info!(url = %config.rpc_url, "connected to rpc endpoint");
        Ok(Self::new(client, config.poll_interval()))
    }

    fn subscriptions(&self) -> MutexGuard<'_, BTreeMap<SubscriptionId, Arc<AtomicBool>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EventSource for JsonRpcEventSource {
    fn current_block(&self) -> Result<u64, SourceError> {
        self.client.block_number()
    }

    fn query_past_events(
        &self,
        filter: &TransferFilter,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferEvent>, SourceError> {
        self.client.transfer_logs(filter, from_block, to_block)
    }

    fn subscribe(
        &self,
        filter: &TransferFilter,
        callback: LiveCallback,
    ) -> Result<SubscriptionId, SourceError> {
        let mut last_seen = self.client.block_number()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let stop = Arc::new(AtomicBool::new(false));

        let client = self.client.clone();
        let filter = *filter;
        let interval = self.poll_interval;
        let stopped = stop.clone();
        thread::Builder::new()
            .name(format!("referral-poll-{id}"))
            .spawn(move || {
                while !stopped.load(Ordering::SeqCst) {
                    thread::sleep(interval);
                    if stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    let head = match client.block_number() {
                        Ok(head) => head,
                        Err(e) => {
                            warn!(subscription = id, error = %e, "live poll: head lookup failed");
                            continue;
                        }
                    };
                    last_seen = catch_up(
                        |from, to| client.transfer_logs(&filter, from, to),
                        |event| {
                            if !stopped.load(Ordering::SeqCst) {
                                callback(event);
                            }
                        },
                        last_seen,
                        head,
                        STEPPED_CHUNK_BLOCKS,
                    );
                }
                debug!(subscription = id, "live poller stopped");
            })
            .map_err(|e| SourceError::Unavailable(format!("failed to spawn poller: {e}")))?;

        self.subscriptions().insert(id, stop);
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(stop) = self.subscriptions().remove(&id) {
            stop.store(true, Ordering::SeqCst);
        }
    }
}

impl Drop for JsonRpcEventSource {
    fn drop(&mut self) {
        for stop in self.subscriptions().values() {
            stop.store(true, Ordering::SeqCst);
        }
    }
}
