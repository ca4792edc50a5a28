use std::sync::Arc;

use tokio::sync::watch;

use lumen_core::EditSnapshot;

/// Live, mutable edit state. Renders never read it directly; they take a
/// [`EditSnapshot`] copy when they start.
#[derive(Clone, Debug)]
pub struct EditStore {
    inner: Arc<watch::Sender<EditSnapshot>>,
}

impl Default for EditStore {
    fn default() -> Self {
        Self::new(EditSnapshot::default())
    }
}

impl EditStore {
    pub fn new(initial: EditSnapshot) -> Self {
        let (tx, _) = watch::channel(initial);
        Self {
            inner: Arc::new(tx),
        }
    }

    /// Mutate in place. Every call notifies subscribers, including nested
    /// mask and curve point edits.
    pub fn update(&self, f: impl FnOnce(&mut EditSnapshot)) {
        self.inner.send_modify(f);
    }

    pub fn replace(&self, snapshot: EditSnapshot) {
        self.inner.send_replace(snapshot);
    }

    pub fn snapshot(&self) -> EditSnapshot {
        self.inner.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EditSnapshot> {
        self.inner.subscribe()
    }
}
