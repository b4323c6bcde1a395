//! Continuous mining task.
//!
//! The miner drains the mempool, re-verifies the working set against the
//! chain, prepends a fresh coinbase for the next height, and runs the
//! proof-of-work search on the blocking pool. Block acceptance anywhere in
//! the node nudges the shared cancellation channel; a cancelled attempt
//! re-submits its working set (entries superseded by the accepted block
//! fall out of validation) and starts over. An empty pool still produces
//! coinbase-only blocks, so emission never stalls.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::Receiver;

use crate::core::chain::MineOutcome;
use crate::core::types::Transaction;
use crate::network::{self, Node};

/// Pause between attempts when the chain is missing or an attempt aborts.
const RETRY_DELAY: Duration = Duration::from_millis(500);

pub async fn run(node: Arc<Node>, reward_address: String, mut cancel: Receiver<()>) {
    tracing::info!("mining to {}", reward_address);

    loop {
        // A fresh node may still be bootstrapping its chain from peers.
        let tip = match node.chain.tip() {
            Ok(tip) => tip,
            Err(_) => {
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
        };

        // Clear stale tokens before snapshotting, so only blocks accepted
        // from here on can cancel this attempt.
        while cancel.try_recv().is_ok() {}

        let drained = node.mempool.lock().await.drain();
        let mut working_set: Vec<Transaction> = Vec::with_capacity(drained.len());
        let mut aborted = false;
        for tx in drained {
            match node.chain.verify_transaction(&tx) {
                Ok(true) => working_set.push(tx),
                Ok(false) => {
                    tracing::warn!("dropping invalid mempool tx {}", hex::encode(tx.id));
                }
                Err(e) => {
                    tracing::error!("mempool verification aborted: {}", e);
                    let _ = node.submit_tx(tx).await;
                    aborted = true;
                }
            }
        }
        if aborted {
            resubmit(&node, working_set).await;
            tokio::time::sleep(RETRY_DELAY).await;
            continue;
        }

        let coinbase = match Transaction::new_coinbase(&reward_address, None, tip.height + 1) {
            Ok(coinbase) => coinbase,
            Err(e) => {
                tracing::error!("building coinbase failed: {}", e);
                resubmit(&node, working_set).await;
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
        };

        let mut txs = vec![coinbase];
        txs.extend(working_set.iter().cloned());

        let chain = node.chain.clone();
        let mined = tokio::task::spawn_blocking(move || {
            let outcome = chain.mine_block(txs, &mut cancel);
            (outcome, cancel)
        })
        .await;

        let (outcome, returned) = match mined {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!("mining task failed: {}", e);
                return;
            }
        };
        cancel = returned;

        match outcome {
            Ok(MineOutcome::Mined(block)) => {
                if let Err(e) = node.utxo.update(&block) {
                    tracing::error!("utxo update after mining failed: {}", e);
                }
                tracing::info!(
                    "mined block #{} {} ({} tx)",
                    block.height,
                    hex::encode(block.hash),
                    block.transactions.len(),
                );
                network::broadcast_block_inv(&node, block.hash).await;
            }
            Ok(MineOutcome::Cancelled) => {
                tracing::debug!("search cancelled at height {}, restarting", tip.height + 1);
                resubmit(&node, working_set).await;
            }
            Err(e) => {
                tracing::warn!("mining attempt aborted: {}", e);
                resubmit(&node, working_set).await;
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}

/// Push a working set back through validated insertion. Transactions mined
/// or conflicted by a freshly accepted block fail the UTXO liveness check
/// and drop out here.
async fn resubmit(node: &Node, txs: Vec<Transaction>) {
    for tx in txs {
        let id = tx.id;
        if let Err(e) = node.submit_tx(tx).await {
            tracing::debug!("dropping tx {} on resubmit: {}", hex::encode(id), e);
        }
    }
}
