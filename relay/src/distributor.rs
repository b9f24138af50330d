use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;

/// One assembled access unit: the Annex-B bytes of a coded picture together
/// with its nominal duration (`1 / detected fps`).
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub data: Bytes,
    pub duration: Duration,
}

/// Creates the bounded single-producer channel between the parser and the
/// track writer. Capacity is kept small so a slow consumer never accumulates
/// stale video; on overflow the oldest frame is dropped in favour of the
/// newest.
pub fn frame_channel(capacity: usize) -> (FrameSender, FrameReceiver) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::with_capacity(capacity)),
        notify: Notify::new(),
        closed: AtomicBool::new(false),
        dropped: AtomicU64::new(0),
        capacity,
    });
    (
        FrameSender {
            shared: shared.clone(),
        },
        FrameReceiver { shared },
    )
}

#[derive(Debug)]
struct Shared {
    queue: Mutex<VecDeque<AccessUnit>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
    capacity: usize,
}

#[derive(Debug, Clone)]
pub struct FrameSender {
    shared: Arc<Shared>,
}

impl FrameSender {
    /// Pushes a frame, evicting the oldest one when the queue is full.
    /// Returns `true` when an old frame was dropped to make room.
    pub fn send(&self, unit: AccessUnit) -> bool {
        let mut dropped = false;
        {
            let mut queue = self.shared.queue.lock().unwrap();
            if queue.len() == self.shared.capacity {
                queue.pop_front();
                dropped = true;
            }
            queue.push_back(unit);
        }
        if dropped {
            let total = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if total % 100 == 0 {
                tracing::debug!("frame queue full, dropped {} stale frames so far", total);
            }
        }
        self.shared.notify.notify_one();
        dropped
    }

    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
    }
}

#[derive(Debug)]
pub struct FrameReceiver {
    shared: Arc<Shared>,
}

impl FrameReceiver {
    /// Receives the next frame, waiting until one is available. Returns
    /// `None` once the sender has closed and the queue is drained.
    pub async fn recv(&mut self) -> Option<AccessUnit> {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(unit) = self.shared.queue.lock().unwrap().pop_front() {
                return Some(unit);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(tag: u8) -> AccessUnit {
        AccessUnit {
            data: Bytes::copy_from_slice(&[0x00, 0x00, 0x00, 0x01, tag]),
            duration: Duration::from_millis(33),
        }
    }

    #[tokio::test]
    async fn test_order_preserved() {
        let (tx, mut rx) = frame_channel(4);
        tx.send(unit(1));
        tx.send(unit(2));
        tx.send(unit(3));
        assert_eq!(rx.recv().await.unwrap().data[4], 1);
        assert_eq!(rx.recv().await.unwrap().data[4], 2);
        assert_eq!(rx.recv().await.unwrap().data[4], 3);
    }

    #[tokio::test]
    async fn test_newest_wins_on_overflow() {
        let (tx, mut rx) = frame_channel(4);
        for tag in 1..=6 {
            tx.send(unit(tag));
        }
        // 1 and 2 were evicted; the newest four remain in order.
        for expected in 3..=6 {
            assert_eq!(rx.recv().await.unwrap().data[4], expected);
        }
    }

    #[tokio::test]
    async fn test_send_reports_drop() {
        let (tx, _rx) = frame_channel(2);
        assert!(!tx.send(unit(1)));
        assert!(!tx.send(unit(2)));
        assert!(tx.send(unit(3)));
    }

    #[tokio::test]
    async fn test_recv_after_close_drains_then_ends() {
        let (tx, mut rx) = frame_channel(4);
        tx.send(unit(1));
        tx.close();
        assert_eq!(rx.recv().await.unwrap().data[4], 1);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_send() {
        let (tx, mut rx) = frame_channel(4);
        let handle = tokio::spawn(async move { rx.recv().await });
        tokio::task::yield_now().await;
        tx.send(unit(9));
        let received = handle.await.unwrap().unwrap();
        assert_eq!(received.data[4], 9);
    }
}
