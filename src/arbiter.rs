//! (H) Lock arbiter (spec.md §4.H): a per-channel, priority-ordered FIFO
//! deciding which session's [`crate::bus::Bus::lock_request`] call goes
//! next. Kept as a distinct module from `Bus` itself — the bus models the
//! transport's own exclusive-access primitive (e.g. a GPIB lock), while
//! this arbiter models in-process ordering across sessions that share one
//! channel, per SPEC_FULL.md §5.H.
//!
//! Queue mutations are protected by a plain `std::sync::Mutex`, not an
//! async one: the critical sections here are short, non-blocking
//! bookkeeping (insert/remove/sort a `VecDeque`), so holding a sync lock
//! across an `.await` never happens and the sync mutex avoids the
//! overhead of an async one for work that never itself awaits.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::time::Duration;

use crate::error::BusStatus;

/// Identifies one shared channel (e.g. a transport instance name) that
/// sessions contend over. Cheap to clone/hash; callers typically derive
/// it from a bus or protocol name.
pub type ChannelKey = String;

struct Waiter {
    session: u64,
    priority: i32,
    seq: u64,
    granted: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct ChannelState {
    owner: Option<u64>,
    queue: VecDeque<Waiter>,
    next_seq: u64,
}

/// Process-wide lock arbiter, one instance shared by every session that
/// might contend (normally owned by the [`crate::registry::Engine`]).
#[derive(Default)]
pub struct Arbiter {
    channels: Mutex<HashMap<ChannelKey, ChannelState>>,
}

impl Arbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests ownership of `channel` for `session` at `priority`
    /// (higher values go first; ties broken by arrival order). Blocks
    /// until granted or until `timeout_ms` elapses.
    pub async fn acquire(
        &self,
        channel: &str,
        session: u64,
        priority: i32,
        timeout_ms: u32,
    ) -> BusStatus {
        enum Pending {
            Granted,
            Wait(Arc<AtomicBool>, Arc<AtomicBool>, Arc<Notify>),
        }

        let pending = {
            let mut channels = self.channels.lock().unwrap();
            let state = channels.entry(channel.to_string()).or_default();

            if state.owner.is_none() && state.queue.is_empty() {
                state.owner = Some(session);
                Pending::Granted
            } else if state.owner == Some(session) {
                // Already holds the channel; re-requesting is a no-op grant.
                Pending::Granted
            } else if let Some(existing) = state.queue.iter().find(|w| w.session == session) {
                // Already queued; join the existing wait instead of pushing
                // a second, competing entry for the same session.
                Pending::Wait(existing.granted.clone(), existing.cancelled.clone(), existing.notify.clone())
            } else {
                let granted = Arc::new(AtomicBool::new(false));
                let cancelled = Arc::new(AtomicBool::new(false));
                let notify = Arc::new(Notify::new());
                let seq = state.next_seq;
                state.next_seq += 1;
                state.queue.push_back(Waiter {
                    session,
                    priority,
                    seq,
                    granted: granted.clone(),
                    cancelled: cancelled.clone(),
                    notify: notify.clone(),
                });
                sort_queue(&mut state.queue);
                Pending::Wait(granted, cancelled, notify)
            }
        };

        let (granted, cancelled, notify) = match pending {
            Pending::Granted => return BusStatus::Success,
            Pending::Wait(granted, cancelled, notify) => (granted, cancelled, notify),
        };

        let wait = notify.notified();
        let timed_out = if timeout_ms == 0 {
            !granted.load(Ordering::SeqCst)
        } else {
            tokio::select! {
                _ = wait => false,
                _ = tokio::time::sleep(Duration::from_millis(timeout_ms as u64)) => {
                    !granted.load(Ordering::SeqCst)
                }
            }
        };

        if granted.load(Ordering::SeqCst) {
            return BusStatus::Success;
        }
        if timed_out {
            cancelled.store(true, Ordering::SeqCst);
            return BusStatus::Timeout;
        }
        BusStatus::Success
    }

    /// Releases `channel` from `session`, sweeping cancelled queue
    /// entries and waking (granting) the new head, if any.
    pub fn release(&self, channel: &str, session: u64) {
        let mut channels = self.channels.lock().unwrap();
        let Some(state) = channels.get_mut(channel) else {
            return;
        };
        if state.owner != Some(session) {
            return;
        }
        state.owner = None;

        while let Some(front) = state.queue.front() {
            if front.cancelled.load(Ordering::SeqCst) {
                state.queue.pop_front();
                continue;
            }
            let front = state.queue.pop_front().unwrap();
            state.owner = Some(front.session);
            front.granted.store(true, Ordering::SeqCst);
            front.notify.notify_one();
            break;
        }
    }
}

fn sort_queue(queue: &mut VecDeque<Waiter>) {
    let mut items: Vec<Waiter> = queue.drain(..).collect();
    items.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
    queue.extend(items);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn idle_channel_grants_immediately() {
        let a = Arbiter::new();
        assert_eq!(a.acquire("ch", 1, 0, 1000).await, BusStatus::Success);
    }

    #[tokio::test]
    async fn second_requester_waits_for_release() {
        let a = Arc::new(Arbiter::new());
        assert_eq!(a.acquire("ch", 1, 0, 1000).await, BusStatus::Success);

        let a2 = a.clone();
        let waiter = tokio::spawn(async move { a2.acquire("ch", 2, 0, 1000).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        a.release("ch", 1);
        assert_eq!(waiter.await.unwrap(), BusStatus::Success);
    }

    #[tokio::test]
    async fn higher_priority_waiter_goes_first() {
        let a = Arc::new(Arbiter::new());
        assert_eq!(a.acquire("ch", 1, 0, 1000).await, BusStatus::Success);

        let a_low = a.clone();
        let low = tokio::spawn(async move { a_low.acquire("ch", 2, 0, 1000).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let a_high = a.clone();
        let high = tokio::spawn(async move { a_high.acquire("ch", 3, 10, 1000).await });
        tokio::time::sleep(Duration::from_millis(5)).await;

        a.release("ch", 1);
        assert_eq!(high.await.unwrap(), BusStatus::Success);
        a.release("ch", 3);
        assert_eq!(low.await.unwrap(), BusStatus::Success);
    }

    #[tokio::test]
    async fn timeout_reports_timeout_status() {
        let a = Arc::new(Arbiter::new());
        assert_eq!(a.acquire("ch", 1, 0, 1000).await, BusStatus::Success);
        let status = a.acquire("ch", 2, 0, 10).await;
        assert_eq!(status, BusStatus::Timeout);
    }
}
