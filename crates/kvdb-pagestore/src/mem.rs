//! In-memory [`PageStore`] used by tests and by callers that don't need
//! durability (e.g. dry runs, unit tests of higher layers).

use std::collections::BTreeSet;

use hashbrown::HashMap;
use kvdb_error::{KvError, Result};
use kvdb_types::{Namespace, PageNo};
use std::sync::Mutex;

use crate::PageStore;

#[derive(Default)]
struct Inner {
    pages: HashMap<(u8, u64), Vec<u8>>,
    append_open: HashMap<(u8, u64), ()>,
}

/// A nested-map in-memory page store with the same semantics as
/// [`DirPageStore`](crate::DirPageStore).
#[derive(Default)]
pub struct MemPageStore {
    inner: Mutex<Inner>,
}

impl MemPageStore {
    /// Create an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key(ns: Namespace, page: PageNo) -> (u8, u64) {
        (ns.get(), page.get())
    }
}

impl PageStore for MemPageStore {
    fn exists(&self, ns: Namespace, page: PageNo) -> Result<bool> {
        Ok(self.inner.lock().unwrap().pages.contains_key(&Self::key(ns, page)))
    }

    fn read(&self, ns: Namespace, page: PageNo) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().unwrap().pages.get(&Self::key(ns, page)).cloned())
    }

    fn create(&self, ns: Namespace, page: PageNo, initial: Option<&[u8]>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = Self::key(ns, page);
        if inner.append_open.contains_key(&key) {
            return Err(KvError::client(format!("page {ns}:{page} is open for append")));
        }
        inner.pages.insert(key, initial.unwrap_or(&[]).to_vec());
        Ok(())
    }

    fn create_open(&self, ns: Namespace, page: PageNo) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = Self::key(ns, page);
        inner.pages.insert(key, Vec::new());
        inner.append_open.insert(key, ());
        Ok(())
    }

    fn delete(&self, ns: Namespace, page: PageNo) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = Self::key(ns, page);
        inner.append_open.remove(&key);
        inner.pages.remove(&key);
        Ok(())
    }

    fn write(&self, ns: Namespace, page: PageNo, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.pages.insert(Self::key(ns, page), bytes.to_vec());
        Ok(())
    }

    fn append(&self, ns: Namespace, page: PageNo, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = Self::key(ns, page);
        if !inner.append_open.contains_key(&key) {
            return Err(KvError::client(format!("page {ns}:{page} is not open for append")));
        }
        inner.pages.entry(key).or_default().extend_from_slice(bytes);
        Ok(())
    }

    fn open_append(&self, ns: Namespace, page: PageNo) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = Self::key(ns, page);
        inner.pages.entry(key).or_default();
        inner.append_open.insert(key, ());
        Ok(())
    }

    fn close_append(&self, ns: Namespace, page: PageNo) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = Self::key(ns, page);
        if inner.append_open.remove(&key).is_none() {
            return Err(KvError::client(format!("page {ns}:{page} is not open for append")));
        }
        Ok(())
    }

    fn can_append(&self, ns: Namespace, page: PageNo) -> Result<bool> {
        Ok(self.inner.lock().unwrap().append_open.contains_key(&Self::key(ns, page)))
    }

    fn list_pages(&self, ns: Namespace) -> Result<BTreeSet<PageNo>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .pages
            .keys()
            .filter(|(n, _)| *n == ns.get())
            .map(|(_, p)| PageNo::new(*p).expect("page numbers are always in range"))
            .collect())
    }

    fn list_stores(&self) -> Result<BTreeSet<Namespace>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.pages.keys().map(|(n, _)| Namespace::from(*n)).collect())
    }
}
