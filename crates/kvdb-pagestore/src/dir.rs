//! Directory-backed [`PageStore`]: one file per page, with a crash-atomic
//! staging protocol for writes and first-time creates (spec §4.1, §6.1).

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use kvdb_error::Result;
use kvdb_types::{Namespace, PageNo};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::PageStoreError;
use crate::PageStore;

const AUX_DIR: &str = "_";
const DATA_DIR: &str = "data";

/// A directory-backed page store. Pages live as `data/<ns>_<page>` files;
/// in-flight writes stage through `data/_/<ns>_<page>_NEW` (overwrite) or
/// `data/_/<ns>_<page>_DEL` (first-time create), renamed atomically into
/// place.
pub struct DirPageStore {
    data_dir: PathBuf,
    aux_dir: PathBuf,
    open_handles: Mutex<HashMap<(u8, u64), File>>,
}

impl DirPageStore {
    /// Open (creating if necessary) a directory-backed store rooted at
    /// `root`, sweeping any in-flight staged files left by an unclean
    /// shutdown.
    pub fn open(root: &Path) -> Result<Self> {
        let data_dir = root.join(DATA_DIR);
        let aux_dir = data_dir.join(AUX_DIR);
        fs::create_dir_all(&aux_dir)?;
        let store = DirPageStore {
            data_dir,
            aux_dir,
            open_handles: Mutex::new(HashMap::new()),
        };
        store.sweep_aux()?;
        Ok(store)
    }

    fn main_path(&self, ns: Namespace, page: PageNo) -> PathBuf {
        self.data_dir.join(format!("{}_{}", ns.get(), page.get()))
    }

    fn aux_path(&self, ns: Namespace, page: PageNo, suffix: &str) -> PathBuf {
        self.aux_dir.join(format!("{}_{}_{}", ns.get(), page.get(), suffix))
    }

    /// Crash recovery sweep run once at open: delete stray `_DEL` files
    /// (an uncompleted create is simply abandoned); for stray `_NEW`
    /// files, complete the rename only if the main file is still absent,
    /// otherwise discard the stale staged write.
    fn sweep_aux(&self) -> Result<()> {
        for entry in fs::read_dir(&self.aux_dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(base) = name.strip_suffix("_DEL") {
                debug!(file = %name, "discarding stray _DEL staging file");
                fs::remove_file(&path)?;
                let _ = base;
            } else if let Some(base) = name.strip_suffix("_NEW") {
                let main = self.data_dir.join(base);
                if main.exists() {
                    debug!(file = %name, "discarding stray _NEW staging file (main exists)");
                    fs::remove_file(&path)?;
                } else {
                    debug!(file = %name, "completing stray _NEW staging file rename");
                    fs::rename(&path, &main)?;
                }
            }
        }
        Ok(())
    }

    /// Write `bytes` to a fresh staging file and atomically rename it
    /// onto the main path.
    fn stage_and_rename(&self, ns: Namespace, page: PageNo, bytes: &[u8], suffix: &str) -> Result<()> {
        let stage = self.aux_path(ns, page, suffix);
        let main = self.main_path(ns, page);
        {
            let mut f = File::create(&stage)?;
            f.write_all(bytes)?;
            f.sync_all()?;
        }
        fs::rename(&stage, &main)?;
        trace!(ns = %ns, page = %page, suffix, "staged write committed");
        Ok(())
    }
}

impl PageStore for DirPageStore {
    fn exists(&self, ns: Namespace, page: PageNo) -> Result<bool> {
        Ok(self.main_path(ns, page).exists())
    }

    fn read(&self, ns: Namespace, page: PageNo) -> Result<Option<Vec<u8>>> {
        let path = self.main_path(ns, page);
        match File::open(&path) {
            Ok(mut f) => {
                let mut buf = Vec::new();
                f.read_to_end(&mut buf)?;
                Ok(Some(buf))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn create(&self, ns: Namespace, page: PageNo, initial: Option<&[u8]>) -> Result<()> {
        let key = (ns.get(), page.get());
        if self.open_handles.lock().contains_key(&key) {
            return Err(PageStoreError::AppendOpen(format!("{ns}:{page}")).into());
        }
        let bytes = initial.unwrap_or(&[]);
        if bytes.is_empty() {
            File::create(self.main_path(ns, page))?;
        } else {
            self.stage_and_rename(ns, page, bytes, "DEL")?;
        }
        Ok(())
    }

    fn create_open(&self, ns: Namespace, page: PageNo) -> Result<()> {
        let key = (ns.get(), page.get());
        let f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.main_path(ns, page))?;
        self.open_handles.lock().insert(key, f);
        Ok(())
    }

    fn delete(&self, ns: Namespace, page: PageNo) -> Result<()> {
        let key = (ns.get(), page.get());
        self.open_handles.lock().remove(&key);
        let path = self.main_path(ns, page);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, ns: Namespace, page: PageNo, bytes: &[u8]) -> Result<()> {
        self.stage_and_rename(ns, page, bytes, "NEW")
    }

    fn append(&self, ns: Namespace, page: PageNo, bytes: &[u8]) -> Result<()> {
        let key = (ns.get(), page.get());
        let mut handles = self.open_handles.lock();
        let Some(f) = handles.get_mut(&key) else {
            return Err(PageStoreError::NotOpenForAppend(format!("{ns}:{page}")).into());
        };
        f.write_all(bytes)?;
        Ok(())
    }

    fn open_append(&self, ns: Namespace, page: PageNo) -> Result<()> {
        let key = (ns.get(), page.get());
        let f = OpenOptions::new().write(true).append(true).open(self.main_path(ns, page))?;
        self.open_handles.lock().insert(key, f);
        Ok(())
    }

    fn close_append(&self, ns: Namespace, page: PageNo) -> Result<()> {
        let key = (ns.get(), page.get());
        let mut handles = self.open_handles.lock();
        let Some(mut f) = handles.remove(&key) else {
            return Err(PageStoreError::NotOpenForAppend(format!("{ns}:{page}")).into());
        };
        f.flush()?;
        f.sync_all()?;
        Ok(())
    }

    fn can_append(&self, ns: Namespace, page: PageNo) -> Result<bool> {
        Ok(self.open_handles.lock().contains_key(&(ns.get(), page.get())))
    }

    fn list_pages(&self, ns: Namespace) -> Result<BTreeSet<PageNo>> {
        let mut out = BTreeSet::new();
        let prefix = format!("{}_", ns.get());
        for entry in fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if let Some(rest) = name.strip_prefix(&prefix) {
                if let Ok(p) = rest.parse::<u64>() {
                    if let Ok(page) = PageNo::new(p) {
                        out.insert(page);
                    }
                }
            }
        }
        Ok(out)
    }

    fn list_stores(&self) -> Result<BTreeSet<Namespace>> {
        let mut out = BTreeSet::new();
        for entry in fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if let Some((ns, _)) = name.split_once('_') {
                if let Ok(n) = ns.parse::<u16>() {
                    if let Ok(ns) = Namespace::new(n) {
                        out.insert(ns);
                    }
                }
            } else {
                warn!(file = %name, "unexpected file in data directory");
            }
        }
        Ok(out)
    }
}
