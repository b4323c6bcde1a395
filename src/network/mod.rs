//! Peer-to-peer protocol: message framing, gossip state machine, mempool,
//! and peer bookkeeping.
//!
//! Every wire message is a 12-byte zero-padded ASCII command followed by a
//! single bincode payload. One TCP connection carries exactly one message:
//! the sender writes the frame and closes its write side, the receiver
//! reads to EOF. Replies travel over fresh connections to the announced
//! `addr_from`, except `pong`, which rides the surviving write direction
//! of the ping connection.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::{Mutex, RwLock};

use crate::core::chain::{Blockchain, ChainError};
use crate::core::params::PROTOCOL_VERSION;
use crate::core::types::{Block, Hash256, Transaction};
use crate::core::utxo::UtxoIndex;

/// Command field width at the front of every frame.
pub const COMMAND_LEN: usize = 12;

/// Upper bound on a single frame; larger frames are dropped undecoded.
const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

/// Buffered miner-cancellation tokens; producers drop the token when full.
const CANCEL_BUFFER: usize = 10;

// ─── Messages ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvKind {
    Block,
    Tx,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionPayload {
    pub version: u32,
    pub best_height: i64,
    pub addr_from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetBlocksPayload {
    pub addr_from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvPayload {
    pub addr_from: String,
    pub kind: InvKind,
    pub items: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetDataPayload {
    pub addr_from: String,
    pub kind: InvKind,
    pub id: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockPayload {
    pub addr_from: String,
    pub block: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxPayload {
    pub addr_from: String,
    pub tx: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddrPayload {
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionPayload),
    GetBlocks(GetBlocksPayload),
    Inv(InvPayload),
    GetData(GetDataPayload),
    Block(BlockPayload),
    Tx(TxPayload),
    Addr(AddrPayload),
    Ping,
    Pong,
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::GetBlocks(_) => "getblocks",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
            Message::Addr(_) => "addr",
            Message::Ping => "ping",
            Message::Pong => "pong",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let command = self.command().as_bytes();
        let mut frame = vec![0u8; COMMAND_LEN];
        frame[..command.len()].copy_from_slice(command);

        let payload = match self {
            Message::Version(p) => bincode::serialize(p),
            Message::GetBlocks(p) => bincode::serialize(p),
            Message::Inv(p) => bincode::serialize(p),
            Message::GetData(p) => bincode::serialize(p),
            Message::Block(p) => bincode::serialize(p),
            Message::Tx(p) => bincode::serialize(p),
            Message::Addr(p) => bincode::serialize(p),
            Message::Ping | Message::Pong => Ok(Vec::new()),
        }
        .expect("message serialization failed");

        frame.extend_from_slice(&payload);
        frame
    }

    pub fn decode(frame: &[u8]) -> Result<Message, WireError> {
        if frame.len() < COMMAND_LEN {
            return Err(WireError::Truncated(frame.len()));
        }
        if frame.len() > MAX_FRAME_SIZE {
            return Err(WireError::Oversize(frame.len()));
        }

        let end = frame[..COMMAND_LEN]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(COMMAND_LEN);
        let command = std::str::from_utf8(&frame[..end])
            .map_err(|_| WireError::BadCommand)?
            .to_string();
        let payload = &frame[COMMAND_LEN..];

        let bad = |e: bincode::Error| WireError::BadPayload(e.to_string());
        match command.as_str() {
            "version" => Ok(Message::Version(bincode::deserialize(payload).map_err(bad)?)),
            "getblocks" => Ok(Message::GetBlocks(bincode::deserialize(payload).map_err(bad)?)),
            "inv" => Ok(Message::Inv(bincode::deserialize(payload).map_err(bad)?)),
            "getdata" => Ok(Message::GetData(bincode::deserialize(payload).map_err(bad)?)),
            "block" => Ok(Message::Block(bincode::deserialize(payload).map_err(bad)?)),
            "tx" => Ok(Message::Tx(bincode::deserialize(payload).map_err(bad)?)),
            "addr" => Ok(Message::Addr(bincode::deserialize(payload).map_err(bad)?)),
            "ping" => Ok(Message::Ping),
            "pong" => Ok(Message::Pong),
            _ => Err(WireError::UnknownCommand(command)),
        }
    }
}

#[derive(Debug)]
pub enum WireError {
    Truncated(usize),
    Oversize(usize),
    BadCommand,
    UnknownCommand(String),
    BadPayload(String),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Truncated(n) => write!(f, "frame too short: {} bytes", n),
            WireError::Oversize(n) => write!(f, "frame too large: {} bytes", n),
            WireError::BadCommand => write!(f, "command is not ascii"),
            WireError::UnknownCommand(c) => write!(f, "unknown command: {}", c),
            WireError::BadPayload(e) => write!(f, "bad payload: {}", e),
        }
    }
}

impl std::error::Error for WireError {}

// ─── Mempool ─────────────────────────────────────────────────────────

/// In-memory set of validated, not-yet-mined transactions keyed by id.
/// Validation happens at the insertion point, `Node::submit_tx`. Unbounded.
#[derive(Default)]
pub struct Mempool {
    txs: HashMap<Hash256, Transaction>,
}

impl Mempool {
    pub fn new() -> Mempool {
        Mempool { txs: HashMap::new() }
    }

    pub fn insert(&mut self, tx: Transaction) -> bool {
        self.txs.insert(tx.id, tx).is_none()
    }

    pub fn remove(&mut self, id: &Hash256) {
        self.txs.remove(id);
    }

    pub fn contains(&self, id: &Hash256) -> bool {
        self.txs.contains_key(id)
    }

    pub fn get(&self, id: &Hash256) -> Option<&Transaction> {
        self.txs.get(id)
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    /// Take every pooled transaction, emptying the pool. The miner's
    /// working-set snapshot; a cancelled attempt re-submits what it took.
    pub fn drain(&mut self) -> Vec<Transaction> {
        self.txs.drain().map(|(_, tx)| tx).collect()
    }
}

// ─── Peer Set ────────────────────────────────────────────────────────

/// Ordered list of known peer addresses; the first entry is the seed.
/// Unreachable peers are removed for the process lifetime and only return
/// through `addr` gossip.
#[derive(Default)]
pub struct PeerSet {
    addrs: Vec<String>,
}

impl PeerSet {
    pub fn new(seed: Option<String>) -> PeerSet {
        PeerSet {
            addrs: seed.into_iter().collect(),
        }
    }

    /// Add an address if absent; returns whether it was new.
    pub fn add(&mut self, addr: String) -> bool {
        if self.addrs.contains(&addr) {
            return false;
        }
        self.addrs.push(addr);
        true
    }

    pub fn remove(&mut self, addr: &str) {
        self.addrs.retain(|a| a != addr);
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.addrs.iter().any(|a| a == addr)
    }

    pub fn all(&self) -> Vec<String> {
        self.addrs.clone()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

// ─── Node ────────────────────────────────────────────────────────────

/// State of an in-flight initial sync. `pending` holds every block id the
/// announcement promised and still owed to us; a block is routed through
/// the sync path iff its hash is removed from here on arrival. `to_request`
/// keeps the not-yet-requested remainder in announcement order.
#[derive(Default)]
struct SyncState {
    to_request: Vec<Hash256>,
    pending: HashSet<Hash256>,
}

/// Owning node state, passed by `Arc` to every handler: the chain store,
/// UTXO index, mempool, peer set, sync-session state, and the miner's
/// cancellation channel.
pub struct Node {
    pub chain: Arc<Blockchain>,
    pub utxo: UtxoIndex,
    pub mempool: Mutex<Mempool>,
    pub peers: RwLock<PeerSet>,
    sync: Mutex<SyncState>,
    pub addr: String,
    pub seed: String,
    pub mining_address: Option<String>,
    cancel_tx: Sender<()>,
}

impl Node {
    /// Build the node state. The returned receiver is the miner's end of
    /// the cancellation channel.
    pub fn new(
        chain: Blockchain,
        utxo: UtxoIndex,
        addr: String,
        seed: String,
        mining_address: Option<String>,
    ) -> (Arc<Node>, Receiver<()>) {
        let (cancel_tx, cancel_rx) = mpsc::channel(CANCEL_BUFFER);
        let peers = if addr == seed {
            PeerSet::new(None)
        } else {
            PeerSet::new(Some(seed.clone()))
        };
        let node = Arc::new(Node {
            chain: Arc::new(chain),
            utxo,
            mempool: Mutex::new(Mempool::new()),
            peers: RwLock::new(peers),
            sync: Mutex::new(SyncState::default()),
            addr,
            seed,
            mining_address,
            cancel_tx,
        });
        (node, cancel_rx)
    }

    /// Validate a transaction and admit it to the mempool: the id must be
    /// intact, every signature must verify against the chain, and every
    /// referenced output must still be unspent in the UTXO index. Returns
    /// whether the transaction was newly pooled (false for a duplicate).
    pub async fn submit_tx(&self, tx: Transaction) -> Result<bool, ChainError> {
        let id = tx.id;
        if tx.is_coinbase() {
            return Err(ChainError::InvalidTransaction(
                "coinbase not accepted in mempool".to_string(),
            ));
        }
        if tx.compute_id() != id {
            return Err(ChainError::InvalidTransaction(
                "transaction id mismatch".to_string(),
            ));
        }
        if self.mempool.lock().await.contains(&id) {
            return Ok(false);
        }
        if !self.chain.verify_transaction(&tx)? {
            return Err(ChainError::InvalidTransaction(format!(
                "signature check failed for {}",
                hex::encode(id)
            )));
        }
        for input in &tx.inputs {
            if !self.utxo.is_unspent(&input.prev_tx_id, input.prev_out_index)? {
                return Err(ChainError::InvalidTransaction(format!(
                    "output {}:{} already spent",
                    hex::encode(input.prev_tx_id),
                    input.prev_out_index
                )));
            }
        }
        self.mempool.lock().await.insert(tx);
        Ok(true)
    }

    /// Non-blocking nudge to the miner; a full buffer means a token is
    /// already pending.
    pub fn cancel_mining(&self) {
        let _ = self.cancel_tx.try_send(());
    }

    async fn sweep_mempool(&self, block: &Block) {
        let mut mempool = self.mempool.lock().await;
        for tx in &block.transactions {
            mempool.remove(&tx.id);
        }
    }
}

// ─── Server ──────────────────────────────────────────────────────────

/// Run the accept loop and, unless this node is the seed, open the boot
/// handshake toward it.
pub async fn start(node: Arc<Node>, listener: TcpListener) {
    tracing::info!("node {} listening", node.addr);
    if let Some(address) = &node.mining_address {
        tracing::info!("mining enabled, rewards to {}", address);
    }
    if node.addr != node.seed {
        send_version(&node, &node.seed.clone()).await;
    }
    serve(node, listener).await;
}

pub async fn serve(node: Arc<Node>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let node = node.clone();
                tokio::spawn(async move {
                    handle_connection(node, stream, remote.to_string()).await;
                });
            }
            Err(e) => {
                tracing::warn!("accept failed: {}", e);
            }
        }
    }
}

async fn handle_connection(node: Arc<Node>, mut stream: TcpStream, remote: String) {
    let mut frame = Vec::new();
    if let Err(e) = stream.read_to_end(&mut frame).await {
        tracing::debug!("read from {} failed: {}", remote, e);
        return;
    }
    let message = match Message::decode(&frame) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("dropping connection from {}: {}", remote, e);
            return;
        }
    };

    tracing::debug!("received {} from {}", message.command(), remote);
    let result = match message {
        Message::Version(p) => handle_version(&node, p).await,
        Message::GetBlocks(p) => handle_get_blocks(&node, p).await,
        Message::Inv(p) => handle_inv(&node, p).await,
        Message::GetData(p) => handle_get_data(&node, p).await,
        Message::Block(p) => handle_block(&node, p).await,
        Message::Tx(p) => handle_tx(&node, p).await,
        Message::Addr(p) => handle_addr(&node, p).await,
        Message::Ping => {
            let pong = Message::Pong.encode();
            if stream.write_all(&pong).await.is_ok() {
                let _ = stream.shutdown().await;
            }
            Ok(())
        }
        Message::Pong => Ok(()),
    };
    if let Err(e) = result {
        tracing::error!("handler failed for {}: {}", remote, e);
    }
}

// ─── Handlers ────────────────────────────────────────────────────────

async fn handle_version(node: &Arc<Node>, payload: VersionPayload) -> Result<(), ChainError> {
    let peer = payload.addr_from.clone();
    if peer != node.addr && node.peers.write().await.add(peer.clone()) {
        tracing::info!("new peer {} (version {})", peer, payload.version);
    }

    // Share our view of the network.
    let mut addresses = node.peers.read().await.all();
    addresses.push(node.addr.clone());
    send_message(node, &peer, &Message::Addr(AddrPayload { addresses })).await;

    let our_height = node.chain.best_height()?;
    if our_height < payload.best_height {
        send_message(
            node,
            &peer,
            &Message::GetBlocks(GetBlocksPayload {
                addr_from: node.addr.clone(),
            }),
        )
        .await;
    } else if our_height > payload.best_height {
        send_version(node, &peer).await;
    }
    Ok(())
}

async fn handle_get_blocks(node: &Arc<Node>, payload: GetBlocksPayload) -> Result<(), ChainError> {
    let hashes = node.chain.block_hashes()?;
    let items: Vec<Vec<u8>> = hashes.iter().map(|h| h.to_vec()).collect();
    send_message(
        node,
        &payload.addr_from,
        &Message::Inv(InvPayload {
            addr_from: node.addr.clone(),
            kind: InvKind::Block,
            items,
        }),
    )
    .await;
    Ok(())
}

async fn handle_inv(node: &Arc<Node>, payload: InvPayload) -> Result<(), ChainError> {
    tracing::debug!(
        "inventory from {}: {} {:?} item(s)",
        payload.addr_from,
        payload.items.len(),
        payload.kind,
    );
    match payload.kind {
        InvKind::Block => {
            let mut hashes = Vec::with_capacity(payload.items.len());
            for item in &payload.items {
                hashes.push(parse_id(item)?);
            }
            let Some((first, rest)) = hashes.split_first() else {
                return Ok(());
            };
            // A multi-block announcement (or any announcement to a chainless
            // node) opens a sync session: every promised id goes into the
            // pending set, and arrivals are routed by membership rather than
            // by whatever the queue and tip look like later. A single-block
            // inv on a node that already has a chain is steady-state gossip.
            if !rest.is_empty() || node.chain.tip_hash()?.is_none() {
                let mut sync = node.sync.lock().await;
                sync.pending = hashes.iter().copied().collect();
                sync.to_request = rest.to_vec();
            }
            send_message(
                node,
                &payload.addr_from,
                &Message::GetData(GetDataPayload {
                    addr_from: node.addr.clone(),
                    kind: InvKind::Block,
                    id: first.to_vec(),
                }),
            )
            .await;
        }
        InvKind::Tx => {
            let Some(item) = payload.items.first() else {
                return Ok(());
            };
            let id = parse_id(item)?;
            if !node.mempool.lock().await.contains(&id) {
                send_message(
                    node,
                    &payload.addr_from,
                    &Message::GetData(GetDataPayload {
                        addr_from: node.addr.clone(),
                        kind: InvKind::Tx,
                        id: id.to_vec(),
                    }),
                )
                .await;
            }
        }
    }
    Ok(())
}

async fn handle_get_data(node: &Arc<Node>, payload: GetDataPayload) -> Result<(), ChainError> {
    let id = parse_id(&payload.id)?;
    match payload.kind {
        InvKind::Block => match node.chain.get_block(&id) {
            Ok(block) => {
                send_message(
                    node,
                    &payload.addr_from,
                    &Message::Block(BlockPayload {
                        addr_from: node.addr.clone(),
                        block: block.serialize(),
                    }),
                )
                .await;
            }
            // Unknown ids get a silent no-reply.
            Err(ChainError::BlockNotFound(_)) => {}
            Err(e) => return Err(e),
        },
        InvKind::Tx => {
            let tx = node.mempool.lock().await.get(&id).cloned();
            if let Some(tx) = tx {
                send_message(
                    node,
                    &payload.addr_from,
                    &Message::Tx(TxPayload {
                        addr_from: node.addr.clone(),
                        tx: tx.serialize(),
                    }),
                )
                .await;
            }
        }
    }
    Ok(())
}

async fn handle_block(node: &Arc<Node>, payload: BlockPayload) -> Result<(), ChainError> {
    let block = match Block::deserialize(&payload.block) {
        Ok(block) => block,
        Err(e) => {
            tracing::warn!("undecodable block from {}: {}", payload.addr_from, e);
            return Ok(());
        }
    };

    // Membership in the sync session's pending set decides the path; it is
    // consumed on arrival, so the last promised block (genesis, since the
    // announcement runs tip-to-genesis) is still recognized as part of the
    // sync after the request queue has drained and the tip has moved.
    let is_sync_block = node.sync.lock().await.pending.remove(&block.hash);

    if is_sync_block {
        match node.chain.store_sync_block(&block) {
            Ok(()) => {
                tracing::info!("synced block #{} {}", block.height, hex::encode(block.hash));
                node.sweep_mempool(&block).await;
                node.cancel_mining();
            }
            Err(ChainError::InvalidPow(_)) => {
                tracing::warn!(
                    "rejected sync block from {}: bad proof-of-work",
                    payload.addr_from
                );
            }
            Err(e) => return Err(e),
        }

        let (next, done) = {
            let mut sync = node.sync.lock().await;
            let next = if sync.to_request.is_empty() {
                None
            } else {
                Some(sync.to_request.remove(0))
            };
            (next, sync.pending.is_empty())
        };
        match next {
            Some(id) => {
                send_message(
                    node,
                    &payload.addr_from,
                    &Message::GetData(GetDataPayload {
                        addr_from: node.addr.clone(),
                        kind: InvKind::Block,
                        id: id.to_vec(),
                    }),
                )
                .await;
            }
            None if done => {
                node.utxo.reindex(&node.chain)?;
                tracing::info!(
                    "sync complete: height {}, {} utxo entries",
                    node.chain.best_height()?,
                    node.utxo.count()?,
                );
            }
            // Nothing left to request but blocks are still in flight; the
            // completion arm runs when the last of them lands.
            None => {}
        }
        return Ok(());
    }

    match node.chain.accept_block(&block) {
        Ok(()) => {
            node.utxo.update(&block)?;
            node.sweep_mempool(&block).await;
            node.cancel_mining();
            tracing::info!(
                "accepted block #{} {} from {}",
                block.height,
                hex::encode(block.hash),
                payload.addr_from,
            );
        }
        Err(ChainError::MissingBlocks { got, tip }) => {
            tracing::warn!(
                "block #{} from {} is ahead of tip {}, missing blocks",
                got,
                payload.addr_from,
                tip,
            );
        }
        Err(ChainError::StaleBlock { got, tip }) => {
            tracing::debug!("dropping stale block #{} (tip {})", got, tip);
        }
        Err(ChainError::InvalidPow(hash)) => {
            tracing::warn!(
                "rejected block {} from {}: bad proof-of-work",
                hex::encode(hash),
                payload.addr_from,
            );
        }
        Err(e) => return Err(e),
    }
    Ok(())
}

async fn handle_tx(node: &Arc<Node>, payload: TxPayload) -> Result<(), ChainError> {
    let tx = match Transaction::deserialize(&payload.tx) {
        Ok(tx) => tx,
        Err(e) => {
            tracing::warn!("undecodable tx from {}: {}", payload.addr_from, e);
            return Ok(());
        }
    };
    let id = tx.id;
    match node.submit_tx(tx.clone()).await {
        Ok(true) => {
            tracing::info!("pooled tx {} from {}", hex::encode(id), payload.addr_from);
            // Forward fresh transactions; duplicates stop the relay.
            broadcast_tx(node, &tx).await;
        }
        Ok(false) => {}
        Err(ChainError::InvalidTransaction(reason)) => {
            tracing::debug!("rejected tx from {}: {}", payload.addr_from, reason);
        }
        Err(e) => return Err(e),
    }
    Ok(())
}

async fn handle_addr(node: &Arc<Node>, payload: AddrPayload) -> Result<(), ChainError> {
    let mut fresh = Vec::new();
    {
        let mut peers = node.peers.write().await;
        for addr in payload.addresses {
            if addr != node.addr && peers.add(addr.clone()) {
                fresh.push(addr);
            }
        }
    }
    if !fresh.is_empty() {
        tracing::info!(
            "learned {} new peer(s), {} known",
            fresh.len(),
            node.peers.read().await.len(),
        );
    }
    for addr in fresh {
        send_version(node, &addr).await;
    }
    Ok(())
}

fn parse_id(bytes: &[u8]) -> Result<Hash256, ChainError> {
    if bytes.len() != 32 {
        return Err(ChainError::Corrupt(format!(
            "expected 32-byte id, got {}",
            bytes.len()
        )));
    }
    let mut id = [0u8; 32];
    id.copy_from_slice(bytes);
    Ok(id)
}

// ─── Outbound ────────────────────────────────────────────────────────

/// Send one framed message: connect, write, half-close. A failed connect
/// or write removes the address from the peer set for the process
/// lifetime.
pub async fn send_message(node: &Node, addr: &str, message: &Message) {
    if addr == node.addr {
        return;
    }
    if let Err(e) = send_frame(addr, message.encode()).await {
        tracing::warn!("peer {} unreachable ({}), removing", addr, e);
        node.peers.write().await.remove(addr);
    }
}

async fn send_frame(addr: &str, frame: Vec<u8>) -> std::io::Result<()> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&frame).await?;
    stream.shutdown().await?;
    Ok(())
}

pub async fn send_version(node: &Node, addr: &str) {
    let best_height = match node.chain.best_height() {
        Ok(height) => height,
        Err(e) => {
            tracing::error!("reading best height: {}", e);
            return;
        }
    };
    send_message(
        node,
        addr,
        &Message::Version(VersionPayload {
            version: PROTOCOL_VERSION,
            best_height,
            addr_from: node.addr.clone(),
        }),
    )
    .await;
}

/// Send a transaction to every known peer except ourselves.
pub async fn broadcast_tx(node: &Node, tx: &Transaction) {
    let payload = Message::Tx(TxPayload {
        addr_from: node.addr.clone(),
        tx: tx.serialize(),
    });
    for peer in node.peers.read().await.all() {
        send_message(node, &peer, &payload).await;
    }
}

/// Announce a freshly mined block to every known peer.
pub async fn broadcast_block_inv(node: &Node, hash: Hash256) {
    let payload = Message::Inv(InvPayload {
        addr_from: node.addr.clone(),
        kind: InvKind::Block,
        items: vec![hash.to_vec()],
    });
    for peer in node.peers.read().await.all() {
        send_message(node, &peer, &payload).await;
    }
}

/// One-shot transaction push used by the CLI `send` path: no node state,
/// just a frame to the target address.
pub async fn push_tx(addr: &str, addr_from: &str, tx: &Transaction) -> std::io::Result<()> {
    let message = Message::Tx(TxPayload {
        addr_from: addr_from.to_string(),
        tx: tx.serialize(),
    });
    send_frame(addr, message.encode()).await
}

/// Liveness check: ping and wait for the pong riding the same connection.
pub async fn ping(addr: &str) -> bool {
    let Ok(mut stream) = TcpStream::connect(addr).await else {
        return false;
    };
    if stream.write_all(&Message::Ping.encode()).await.is_err() {
        return false;
    }
    if stream.shutdown().await.is_err() {
        return false;
    }
    let mut reply = Vec::new();
    if stream.read_to_end(&mut reply).await.is_err() {
        return false;
    }
    matches!(Message::decode(&reply), Ok(Message::Pong))
}

/// Periodically ping every known peer, applying the unreachable-removal
/// policy outside of regular traffic.
pub async fn liveness_sweep(node: Arc<Node>, period: std::time::Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        for peer in node.peers.read().await.all() {
            if peer == node.addr {
                continue;
            }
            if !ping(&peer).await {
                tracing::warn!("peer {} failed liveness check, removing", peer);
                node.peers.write().await.remove(&peer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::pow;
    use std::time::Duration;

    // ─── Framing ────────────────────────────────────────────────────

    #[test]
    fn test_frame_roundtrip_version() {
        let msg = Message::Version(VersionPayload {
            version: PROTOCOL_VERSION,
            best_height: 42,
            addr_from: "localhost:3000".to_string(),
        });
        let frame = msg.encode();
        assert_eq!(&frame[..7], b"version");
        assert!(frame[7..COMMAND_LEN].iter().all(|&b| b == 0));
        assert_eq!(Message::decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_frame_roundtrip_all_commands() {
        let messages = vec![
            Message::GetBlocks(GetBlocksPayload { addr_from: "a:1".into() }),
            Message::Inv(InvPayload {
                addr_from: "a:1".into(),
                kind: InvKind::Block,
                items: vec![vec![7u8; 32], vec![8u8; 32]],
            }),
            Message::GetData(GetDataPayload {
                addr_from: "a:1".into(),
                kind: InvKind::Tx,
                id: vec![9u8; 32],
            }),
            Message::Block(BlockPayload { addr_from: "a:1".into(), block: vec![1, 2, 3] }),
            Message::Tx(TxPayload { addr_from: "a:1".into(), tx: vec![4, 5] }),
            Message::Addr(AddrPayload { addresses: vec!["b:2".into(), "c:3".into()] }),
            Message::Ping,
            Message::Pong,
        ];
        for msg in messages {
            assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Message::decode(b"short"),
            Err(WireError::Truncated(_))
        ));
        let mut frame = vec![0u8; COMMAND_LEN];
        frame[..5].copy_from_slice(b"nosux");
        assert!(matches!(
            Message::decode(&frame),
            Err(WireError::UnknownCommand(_))
        ));
        let mut bad = Message::Version(VersionPayload {
            version: 1,
            best_height: 0,
            addr_from: "x".into(),
        })
        .encode();
        bad.truncate(COMMAND_LEN + 2);
        assert!(matches!(Message::decode(&bad), Err(WireError::BadPayload(_))));
    }

    // ─── Mempool / peers ────────────────────────────────────────────

    #[test]
    fn test_mempool_ops() {
        let addr = Keypair::generate().address();
        let tx = Transaction::new_coinbase(&addr, None, 0).unwrap();
        let id = tx.id;

        let mut pool = Mempool::new();
        assert!(pool.insert(tx.clone()));
        assert!(!pool.insert(tx));
        assert!(pool.contains(&id));
        assert_eq!(pool.len(), 1);

        let drained = pool.drain();
        assert_eq!(drained.len(), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_peer_set() {
        let mut peers = PeerSet::new(Some("seed:3000".into()));
        assert!(peers.contains("seed:3000"));
        assert!(peers.add("a:1".into()));
        assert!(!peers.add("a:1".into()));
        assert_eq!(peers.all(), vec!["seed:3000".to_string(), "a:1".to_string()]);
        peers.remove("seed:3000");
        assert_eq!(peers.len(), 1);
    }

    // ─── End-to-end ─────────────────────────────────────────────────

    fn mine_on(chain: &Blockchain, addr: &str) {
        let tip = chain.tip().unwrap();
        let coinbase = Transaction::new_coinbase(addr, None, tip.height + 1).unwrap();
        let mut block = Block::new(vec![coinbase], tip.hash, tip.height + 1, 8);
        let (_tx, mut rx) = mpsc::channel(1);
        assert_eq!(pow::search(&mut block, &mut rx), pow::SearchResult::Found);
        chain.accept_block(&block).unwrap();
    }

    async fn spawn_node(
        dir: &std::path::Path,
        seed: Option<String>,
        with_chain: Option<&str>,
    ) -> (Arc<Node>, String) {
        let chain = match with_chain {
            Some(addr) => Blockchain::create(dir, addr).unwrap(),
            None => Blockchain::attach(dir).unwrap(),
        };
        let utxo = UtxoIndex::new(chain.store_handle());
        if with_chain.is_some() {
            utxo.reindex(&chain).unwrap();
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let seed = seed.unwrap_or_else(|| addr.clone());
        let (node, _cancel_rx) = Node::new(chain, utxo, addr.clone(), seed, None);
        tokio::spawn(serve(node.clone(), listener));
        (node, addr)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ping_pong() {
        let dir = tempfile::tempdir().unwrap();
        let (_node, addr) = spawn_node(dir.path(), None, None).await;
        assert!(ping(&addr).await);
        assert!(!ping("127.0.0.1:1").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_initial_sync_converges() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let miner = Keypair::generate().address();

        // Seed node with a three-block chain.
        let (node_a, addr_a) = spawn_node(dir_a.path(), None, Some(&miner)).await;
        mine_on(&node_a.chain, &miner);
        mine_on(&node_a.chain, &miner);
        node_a.utxo.reindex(&node_a.chain).unwrap();
        assert_eq!(node_a.chain.best_height().unwrap(), 2);

        // Fresh node pointed at the seed.
        let (node_b, _addr_b) = spawn_node(dir_b.path(), Some(addr_a.clone()), None).await;
        assert_eq!(node_b.chain.best_height().unwrap(), -1);
        send_version(&node_b, &addr_a).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while node_b.chain.best_height().unwrap() < 2 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "sync did not converge"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(
            node_b.chain.tip_hash().unwrap(),
            node_a.chain.tip_hash().unwrap()
        );
        // UTXO index was rebuilt when the drain finished.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(node_b.utxo.count().unwrap(), node_a.utxo.count().unwrap());
        // The peers discovered each other.
        assert!(node_a.peers.read().await.len() >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_live_block_gossip() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let miner = Keypair::generate().address();

        let (node_a, addr_a) = spawn_node(dir_a.path(), None, Some(&miner)).await;
        let (node_b, _) = spawn_node(dir_b.path(), Some(addr_a.clone()), None).await;
        send_version(&node_b, &addr_a).await;

        // Wait for B to pick up genesis.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while node_b.chain.best_height().unwrap() < 0 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // A mines a new block and announces it; B fetches and accepts.
        mine_on(&node_a.chain, &miner);
        let tip = node_a.chain.tip_hash().unwrap().unwrap();
        node_a.utxo.reindex(&node_a.chain).unwrap();
        broadcast_block_inv(&node_a, tip).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while node_b.chain.best_height().unwrap() < 1 {
            assert!(tokio::time::Instant::now() < deadline, "block not relayed");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(node_b.chain.tip_hash().unwrap(), Some(tip));
    }
}
