// Status broadcast channel.
//
// Single producer side shared by every writer, any number of subscribers.
// A subscriber that falls more than `capacity` messages behind loses the
// oldest ones and is told how many it missed (`RecvError::Lagged`).

use tokio::sync::broadcast;
use wingman_types::StatusMessage;

pub const DEFAULT_FEED_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct StatusFeed {
    tx: broadcast::Sender<StatusMessage>,
}

impl StatusFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Send to all current subscribers. Returns how many received it;
    /// zero subscribers is fine.
    pub fn publish(&self, message: StatusMessage) -> usize {
        self.tx.send(message).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusMessage> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for StatusFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;
    use wingman_types::DownloadItem;

    fn message(n: i64) -> StatusMessage {
        StatusMessage::DownloadItem(DownloadItem::new("org/model", "a.gguf", n))
    }

    #[test]
    fn test_publish_without_subscribers() {
        let feed = StatusFeed::new(4);
        assert_eq!(feed.publish(message(1)), 0);
    }

    #[test]
    fn test_every_subscriber_sees_messages_in_order() {
        let feed = StatusFeed::new(8);
        let mut a = feed.subscribe();
        let mut b = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 2);

        feed.publish(message(1));
        feed.publish(message(2));

        for rx in [&mut a, &mut b] {
            assert_eq!(rx.try_recv().unwrap(), message(1));
            assert_eq!(rx.try_recv().unwrap(), message(2));
            assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        }
    }

    #[test]
    fn test_slow_subscriber_drops_oldest() {
        let feed = StatusFeed::new(2);
        let mut rx = feed.subscribe();
        for n in 1..=5 {
            feed.publish(message(n));
        }
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Lagged(3))));
        assert_eq!(rx.try_recv().unwrap(), message(4));
        assert_eq!(rx.try_recv().unwrap(), message(5));
    }
}
