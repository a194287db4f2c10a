//! Logical identity for listeners and queries.

use std::fmt;
use std::sync::Arc;

use ramvol_types::SubscriberId;

/// A listener or query paired with a stable logical identity.
///
/// Registries key on the [`SubscriberId`], never on the address of the
/// wrapped object, so a freed-and-reallocated listener cannot alias an old
/// registration. Clones share the identity.
pub struct Subscriber<T: ?Sized> {
    id: SubscriberId,
    inner: Arc<T>,
}

impl<T: ?Sized> Subscriber<T> {
    /// Wrap `inner` under a fresh identity.
    pub fn new(inner: Arc<T>) -> Self {
        Self {
            id: SubscriberId::next(),
            inner,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn get(&self) -> &Arc<T> {
        &self.inner
    }
}

impl<T: ?Sized> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            inner: self.inner.clone(),
        }
    }
}

impl<T: ?Sized> PartialEq for Subscriber<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T: ?Sized> Eq for Subscriber<T> {}

impl<T: ?Sized> fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subscriber({})", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_logical() {
        let shared = Arc::new(5u32);
        let a = Subscriber::new(shared.clone());
        let b = Subscriber::new(shared);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert_eq!(**a.get(), 5);
    }
}
