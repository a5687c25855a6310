//! Current value plus change notification, on top of `tokio::sync::watch`.

use tokio::sync::watch;

pub struct Observable<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone> Observable<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Replace the value and notify subscribers, even with none attached.
    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    pub fn update(&self, f: impl FnOnce(&mut T)) {
        self.tx.send_modify(f);
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

impl<T: Clone + PartialEq> Observable<T> {
    /// Notify only when the value actually changes.
    pub fn set_if_changed(&self, value: T) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }
}

impl<T: Clone + Default> Default for Observable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_changes() {
        let counter = Observable::new(0u32);
        let mut rx = counter.subscribe();

        counter.set(3);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 3);

        counter.update(|v| *v += 1);
        assert_eq!(counter.get(), 4);
    }

    #[test]
    fn unchanged_values_do_not_notify() {
        let flag = Observable::new(false);
        let rx = flag.subscribe();
        assert!(!flag.set_if_changed(false));
        assert!(!rx.has_changed().unwrap());
        assert!(flag.set_if_changed(true));
        assert!(rx.has_changed().unwrap());
    }
}
