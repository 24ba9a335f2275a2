//! Duplicate message suppression.
//!
//! The bus delivers at least once, so the same message id can arrive more
//! than once. [`SeenIds::admit`] lets each id through exactly once for the
//! life of the process. Id 0 is reserved and is never admitted.
//!
//! Two retention modes:
//! - unbounded (default): every admitted id is remembered until exit
//! - windowed: ids older than the window are forgotten, trading the "ever"
//!   guarantee for bounded memory
//!
//! Nothing here is persisted; a restarted agent starts with an empty set.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use vmfleet_id::MessageId;

enum Retention {
    Unbounded(HashSet<i64>),
    Windowed {
        window: Duration,
        seen: HashMap<i64, Instant>,
        order: VecDeque<(Instant, i64)>,
    },
}

/// Set of message ids already handled by this process.
pub struct SeenIds {
    inner: Mutex<Retention>,
}

impl SeenIds {
    /// Remember every id for the life of the process.
    pub fn unbounded() -> Self {
        Self {
            inner: Mutex::new(Retention::Unbounded(HashSet::new())),
        }
    }

    /// Remember ids for `window` after they were first admitted.
    pub fn windowed(window: Duration) -> Self {
        Self {
            inner: Mutex::new(Retention::Windowed {
                window,
                seen: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Build from an optional window (`None` = unbounded).
    pub fn from_window(window: Option<Duration>) -> Self {
        match window {
            Some(window) => Self::windowed(window),
            None => Self::unbounded(),
        }
    }

    /// Record `id` and return true if it has not been seen before.
    ///
    /// The membership test and the insert happen under one lock.
    pub fn admit(&self, id: MessageId) -> bool {
        self.admit_at(id, Instant::now())
    }

    fn admit_at(&self, id: MessageId, now: Instant) -> bool {
        if id.is_reserved() {
            return false;
        }
        let raw = id.value();

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *inner {
            Retention::Unbounded(seen) => seen.insert(raw),
            Retention::Windowed {
                window,
                seen,
                order,
            } => {
                while let Some(&(at, old)) = order.front() {
                    if now.saturating_duration_since(at) < *window {
                        break;
                    }
                    order.pop_front();
                    seen.remove(&old);
                }

                if seen.contains_key(&raw) {
                    return false;
                }
                seen.insert(raw, now);
                order.push_back((now, raw));
                true
            }
        }
    }

    /// Number of ids currently remembered.
    pub fn len(&self) -> usize {
        match &*self.inner.lock().unwrap_or_else(|e| e.into_inner()) {
            Retention::Unbounded(seen) => seen.len(),
            Retention::Windowed { seen, .. } => seen.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SeenIds {
    fn default() -> Self {
        Self::unbounded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_reserved_id_never_admitted() {
        let seen = SeenIds::unbounded();
        assert!(!seen.admit(MessageId::RESERVED));
        assert!(!seen.admit(MessageId::new(0)));
        assert!(seen.is_empty());
    }

    #[test]
    fn test_admit_once() {
        let seen = SeenIds::unbounded();
        assert!(seen.admit(MessageId::new(42)));
        assert!(!seen.admit(MessageId::new(42)));
        assert!(seen.admit(MessageId::new(43)));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_negative_ids_are_ordinary() {
        let seen = SeenIds::unbounded();
        assert!(seen.admit(MessageId::new(-5)));
        assert!(!seen.admit(MessageId::new(-5)));
    }

    #[test]
    fn test_windowed_forgets_old_ids() {
        let seen = SeenIds::windowed(Duration::from_secs(60));
        let start = Instant::now();
        assert!(seen.admit_at(MessageId::new(1), start));
        assert!(!seen.admit_at(MessageId::new(1), start + Duration::from_secs(59)));
        assert!(seen.admit_at(MessageId::new(2), start + Duration::from_secs(30)));

        let later = start + Duration::from_secs(61);
        assert!(seen.admit_at(MessageId::new(1), later));
        assert!(!seen.admit_at(MessageId::new(2), later));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_windowed_still_rejects_reserved() {
        let seen = SeenIds::from_window(Some(Duration::from_secs(1)));
        assert!(!seen.admit(MessageId::RESERVED));
    }

    #[test]
    fn test_concurrent_admit_lets_one_through() {
        let seen = Arc::new(SeenIds::unbounded());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let seen = Arc::clone(&seen);
                std::thread::spawn(move || seen.admit(MessageId::new(777)))
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|admitted| *admitted)
            .count();
        assert_eq!(admitted, 1);
    }
}
