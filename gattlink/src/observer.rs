use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::{CharacteristicHandle, Error, Result};

/// Invoked with every new value of a characteristic, from the radio callback path
pub type ValueListener = Arc<dyn Fn(&[u8]) + Send + Sync>;

// One of these is owned per characteristic by a Connection. Re-enabling
// notifications simply replaces the whole variant, which detaches any
// ChangeObserver handed out for the previous registration.
pub(crate) enum ObserverSlot {
    Disabled,
    Enabled {
        latest: watch::Sender<Option<Vec<u8>>>,
        listener: Option<ValueListener>,
    },
}

impl ObserverSlot {
    pub(crate) fn enabled(characteristic: CharacteristicHandle, listener: Option<ValueListener>)
                          -> (ObserverSlot, ChangeObserver) {
        let (latest, rx) = watch::channel(None);
        (ObserverSlot::Enabled { latest, listener },
         ChangeObserver { characteristic, rx })
    }

    /// Records a new value, returning whether it was accepted along with the
    /// listener to call (outside of any lock).
    pub(crate) fn deliver(&self, value: &[u8]) -> (bool, Option<ValueListener>) {
        match self {
            ObserverSlot::Disabled => (false, None),
            ObserverSlot::Enabled { latest, listener } => {
                latest.send_replace(Some(value.to_vec()));
                (true, listener.clone())
            }
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        matches!(self, ObserverSlot::Enabled { .. })
    }
}

impl fmt::Debug for ObserverSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObserverSlot::Disabled => write!(f, "Disabled"),
            ObserverSlot::Enabled { listener, .. } => {
                f.debug_struct("Enabled")
                    .field("has_listener", &listener.is_some())
                    .finish()
            }
        }
    }
}

/// A single-slot mailbox holding the most recent notified value of one
/// characteristic.
///
/// An observer is detached (and waiting on it fails with
/// [`Error::NotificationsDisabled`]) once notifications are disabled, re-enabled
/// with a new observer, or the connection closes.
#[derive(Debug)]
pub struct ChangeObserver {
    characteristic: CharacteristicHandle,
    rx: watch::Receiver<Option<Vec<u8>>>,
}

impl ChangeObserver {
    pub fn characteristic(&self) -> CharacteristicHandle {
        self.characteristic
    }

    pub fn latest(&self) -> Option<Vec<u8>> {
        self.rx.borrow().clone()
    }

    /// Waits for the next value delivered after the last one seen by this observer
    pub async fn wait_for_value(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        match tokio::time::timeout(timeout, self.rx.changed()).await {
            Ok(Ok(())) => {
                self.rx
                    .borrow()
                    .clone()
                    .ok_or_else(|| Error::MissingResult(format!("notification on {:?}", self.characteristic)))
            }
            Ok(Err(_)) => Err(Error::NotificationsDisabled),
            Err(_elapsed) => Err(Error::Timeout {
                operation: format!("notification on {:?}", self.characteristic),
                timeout,
            }),
        }
    }

    /// A stream of the values delivered from now on, ending once the observer
    /// is detached
    pub fn into_stream(self) -> impl Stream<Item = Vec<u8>> {
        WatchStream::from_changes(self.rx)
            .filter_map(|value| async move { value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latest_value_and_wait() {
        let (slot, mut observer) = ObserverSlot::enabled(CharacteristicHandle(1), None);
        assert_eq!(observer.latest(), None);

        let (accepted, listener) = slot.deliver(&[1, 2]);
        assert!(accepted);
        assert!(listener.is_none());
        assert_eq!(observer.wait_for_value(Duration::from_millis(100)).await.unwrap(), vec![1, 2]);

        let err = observer.wait_for_value(Duration::from_millis(10)).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn replaced_slot_detaches_observer() {
        let (slot, mut observer) = ObserverSlot::enabled(CharacteristicHandle(1), None);
        drop(slot);
        let slot = ObserverSlot::Disabled;
        assert!(!slot.is_enabled());
        assert!(!slot.deliver(&[1]).0);

        let err = observer.wait_for_value(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, Error::NotificationsDisabled));
    }

    #[tokio::test]
    async fn stream_yields_new_values() {
        let (slot, observer) = ObserverSlot::enabled(CharacteristicHandle(3), None);
        let stream = observer.into_stream();
        futures::pin_mut!(stream);

        slot.deliver(&[9]);
        assert_eq!(stream.next().await, Some(vec![9]));

        drop(slot);
        assert_eq!(stream.next().await, None);
    }
}
