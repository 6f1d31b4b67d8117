use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{error, instrument};

use crate::catalog::InodeCatalog;
use crate::dir::OverlayDir;
use crate::inode_number::InodeNumber;
use crate::OverlayError;

#[derive(Clone)]
enum Pending {
    Save(OverlayDir),
    Remove,
}

#[derive(Default)]
struct QueueState {
    /// Inodes with queued work, oldest first. Each inode appears at most
    /// once; re-writing a queued inode coalesces into the existing slot.
    order: VecDeque<u64>,
    pending: HashMap<u64, Pending>,
    /// The write currently being applied to the inner catalog. Reads must
    /// see it as the latest value until it lands.
    in_flight: Option<(u64, Pending)>,
    flush_waiters: Vec<oneshot::Sender<()>>,
    closed: bool,
}

impl QueueState {
    fn lookup(&self, inode: u64) -> Option<&Pending> {
        self.pending.get(&inode).or_else(|| {
            self.in_flight
                .as_ref()
                .filter(|(i, _)| *i == inode)
                .map(|(_, p)| p)
        })
    }
}

/// Write-behind wrapper around another catalog.
///
/// Directory writes are queued and applied by a single worker task; writes
/// to the same inode coalesce so only the newest record is persisted. Reads
/// observe queued and in-flight values, so callers see their own writes.
/// [flush](BufferedCatalog::flush) drains the queue; close implies flush.
pub struct BufferedCatalog {
    inner: Arc<dyn InodeCatalog>,
    state: Arc<Mutex<QueueState>>,
    /// Wakes the worker when work is queued or the catalog closes.
    work: Arc<Notify>,
    /// Wakes producers blocked on a full queue.
    space: Arc<Notify>,
    capacity: usize,
}

impl BufferedCatalog {
    pub fn new(inner: Arc<dyn InodeCatalog>, capacity: usize) -> Self {
        let state = Arc::new(Mutex::new(QueueState::default()));
        let work = Arc::new(Notify::new());
        let space = Arc::new(Notify::new());

        tokio::spawn(worker_loop(
            inner.clone(),
            state.clone(),
            work.clone(),
            space.clone(),
        ));

        BufferedCatalog {
            inner,
            state,
            work,
            space,
            capacity,
        }
    }

    async fn enqueue(&self, inode: InodeNumber, pending: Pending) {
        loop {
            {
                let mut state = self.state.lock().await;
                let coalesced = state.pending.contains_key(&inode.get());
                if coalesced || state.order.len() < self.capacity {
                    if !coalesced {
                        state.order.push_back(inode.get());
                    }
                    state.pending.insert(inode.get(), pending);
                    self.work.notify_one();
                    return;
                }
            }
            self.space.notified().await;
        }
    }

    /// Blocks until every queued write has been applied to the inner
    /// catalog.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> Result<(), OverlayError> {
        let rx = {
            let mut state = self.state.lock().await;
            if state.order.is_empty() && state.in_flight.is_none() {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.flush_waiters.push(tx);
            self.work.notify_one();
            rx
        };
        rx.await
            .map_err(|_| OverlayError::Storage("catalog worker exited".to_string()))
    }
}

async fn worker_loop(
    inner: Arc<dyn InodeCatalog>,
    state: Arc<Mutex<QueueState>>,
    work: Arc<Notify>,
    space: Arc<Notify>,
) {
    loop {
        let item = {
            let mut state = state.lock().await;
            match state.order.pop_front() {
                Some(inode) => {
                    let pending = state
                        .pending
                        .remove(&inode)
                        .expect("queued inode must have a pending value");
                    state.in_flight = Some((inode, pending.clone()));
                    Some((inode, pending))
                }
                None => {
                    for waiter in state.flush_waiters.drain(..) {
                        let _ = waiter.send(());
                    }
                    if state.closed {
                        return;
                    }
                    None
                }
            }
        };

        match item {
            Some((raw, pending)) => {
                let inode = InodeNumber::from_raw(raw);
                let result = match pending {
                    Pending::Save(dir) => inner.save_dir(inode, dir).await,
                    Pending::Remove => inner.load_and_remove_dir(inode).await.map(|_| ()),
                };
                if let Err(e) = result {
                    // The write is lost; the overlay stays consistent
                    // because parents are only written after children, but
                    // this inode's local changes may not survive a restart.
                    error!(inode = %inode, error = %e, "buffered catalog write failed");
                }
                let mut state = state.lock().await;
                state.in_flight = None;
                space.notify_waiters();
            }
            None => work.notified().await,
        }
    }
}

#[async_trait]
impl InodeCatalog for BufferedCatalog {
    async fn init(
        &self,
        create_if_missing: bool,
        bypass_lock: bool,
    ) -> Result<Option<InodeNumber>, OverlayError> {
        self.inner.init(create_if_missing, bypass_lock).await
    }

    async fn close(&self, next_inode: Option<InodeNumber>) -> Result<(), OverlayError> {
        self.flush().await?;
        {
            let mut state = self.state.lock().await;
            state.closed = true;
        }
        self.work.notify_one();
        self.inner.close(next_inode).await
    }

    async fn load_dir(&self, inode: InodeNumber) -> Result<Option<OverlayDir>, OverlayError> {
        {
            let state = self.state.lock().await;
            match state.lookup(inode.get()) {
                Some(Pending::Save(dir)) => return Ok(Some(dir.clone())),
                Some(Pending::Remove) => return Ok(None),
                None => {}
            }
        }
        self.inner.load_dir(inode).await
    }

    async fn load_and_remove_dir(
        &self,
        inode: InodeNumber,
    ) -> Result<Option<OverlayDir>, OverlayError> {
        let queued = {
            let state = self.state.lock().await;
            state.lookup(inode.get()).cloned()
        };
        let previous = match queued {
            Some(Pending::Save(dir)) => Some(dir),
            Some(Pending::Remove) => None,
            None => self.inner.load_dir(inode).await?,
        };
        self.enqueue(inode, Pending::Remove).await;
        Ok(previous)
    }

    async fn save_dir(&self, inode: InodeNumber, dir: OverlayDir) -> Result<(), OverlayError> {
        self.enqueue(inode, Pending::Save(dir)).await;
        Ok(())
    }

    async fn remove_dir(&self, inode: InodeNumber) -> Result<(), OverlayError> {
        if let Some(dir) = self.load_dir(inode).await? {
            if !dir.is_empty() {
                return Err(OverlayError::DirectoryNotEmpty(inode));
            }
        }
        self.enqueue(inode, Pending::Remove).await;
        Ok(())
    }

    async fn has_dir(&self, inode: InodeNumber) -> Result<bool, OverlayError> {
        Ok(self.load_dir(inode).await?.is_some())
    }

    fn next_inode_number(&self) -> Result<InodeNumber, OverlayError> {
        self.inner.next_inode_number()
    }

    fn reset_next_inode_number(&self, next: InodeNumber) {
        self.inner.reset_next_inode_number(next);
    }

    async fn get_all_parent_inode_numbers(&self) -> Result<Vec<InodeNumber>, OverlayError> {
        self.flush().await?;
        self.inner.get_all_parent_inode_numbers().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::dir::mode;
    use crate::{OverlayEntry, ROOT_INODE};

    fn entry(ino: u64) -> OverlayEntry {
        OverlayEntry {
            mode: mode::REG | 0o644,
            inode: Some(InodeNumber::from_raw(ino)),
            object_id: None,
        }
    }

    fn dir_with(name: &str, ino: u64) -> OverlayDir {
        let mut dir = OverlayDir::new();
        dir.add(name.into(), entry(ino)).unwrap();
        dir
    }

    #[tokio::test]
    async fn reads_see_queued_writes() {
        let inner = Arc::new(MemoryCatalog::new());
        let buffered = BufferedCatalog::new(inner.clone(), 8);
        buffered.init(true, false).await.unwrap();

        let dir = dir_with("a", 7);
        buffered.save_dir(ROOT_INODE, dir.clone()).await.unwrap();
        assert_eq!(buffered.load_dir(ROOT_INODE).await.unwrap(), Some(dir));
    }

    #[tokio::test]
    async fn flush_drains_to_the_inner_catalog() {
        let inner = Arc::new(MemoryCatalog::new());
        let buffered = BufferedCatalog::new(inner.clone(), 8);
        buffered.init(true, false).await.unwrap();

        let dir = dir_with("a", 7);
        buffered.save_dir(ROOT_INODE, dir.clone()).await.unwrap();
        buffered.flush().await.unwrap();
        assert_eq!(inner.load_dir(ROOT_INODE).await.unwrap(), Some(dir));
    }

    #[tokio::test]
    async fn writes_to_the_same_inode_coalesce() {
        let inner = Arc::new(MemoryCatalog::new());
        let buffered = BufferedCatalog::new(inner.clone(), 8);
        buffered.init(true, false).await.unwrap();

        for i in 2..20 {
            buffered
                .save_dir(ROOT_INODE, dir_with("a", i))
                .await
                .unwrap();
        }
        buffered.flush().await.unwrap();
        assert_eq!(
            inner.load_dir(ROOT_INODE).await.unwrap(),
            Some(dir_with("a", 19))
        );
    }

    #[tokio::test]
    async fn queued_removal_hides_the_inner_record() {
        let inner = Arc::new(MemoryCatalog::new());
        inner.save_dir(ROOT_INODE, dir_with("a", 7)).await.unwrap();

        let buffered = BufferedCatalog::new(inner.clone(), 8);
        buffered.init(true, false).await.unwrap();

        let removed = buffered.load_and_remove_dir(ROOT_INODE).await.unwrap();
        assert_eq!(removed, Some(dir_with("a", 7)));
        assert_eq!(buffered.load_dir(ROOT_INODE).await.unwrap(), None);

        buffered.flush().await.unwrap();
        assert_eq!(inner.load_dir(ROOT_INODE).await.unwrap(), None);
    }
}
