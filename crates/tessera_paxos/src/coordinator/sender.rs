//! Fire-and-forget sender with bounded retry.
//!
//! Used for replies that have no owning proposer to resend them, such as
//! the TxnLocallyComplete acknowledging an abort outcome for a transaction
//! this RM holds no state for. Decoupled from proposer lifetime: the retry
//! task outlives whatever spawned it.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use tessera_txn::engine::RMId;

use super::types::{Message, Sender};

const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(20);
const MAX_BACKOFF: Duration = Duration::from_millis(640);

pub struct OneShotSender;

impl OneShotSender {
    /// Send `msg` to `to`, retrying with jittered exponential backoff a
    /// bounded number of times.
    pub fn spawn(sender: Arc<dyn Sender>, to: RMId, msg: Message) {
        tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            for attempt in 1..=MAX_ATTEMPTS {
                match sender.send(to, msg.clone()) {
                    Ok(()) => return,
                    Err(err) => {
                        tracing::debug!(error = ?err, to, attempt, "one-shot send failed");
                    }
                }
                let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
                tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            tracing::warn!(to, txn = ?msg.txn_id(), "giving up on one-shot message");
        });
    }
}
