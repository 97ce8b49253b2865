use crate::{ChildSet, Stat};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// The last known children of every watched path.
///
/// Entries are only ever replaced by a successful refresh, so after a failed refresh the previous
/// (possibly stale) set remains visible. A read that lost a race with a newer one for the same
/// path is not recorded. Cloning yields another handle to the same view.
#[derive(Clone, Debug, Default)]
pub struct ChildView {
    known: Arc<Mutex<HashMap<String, Entry>>>,
}

#[derive(Debug)]
struct Entry {
    children: ChildSet,
    /// zxid of the last change to the children the entry reflects.
    pzxid: i64,
}

impl ChildView {
    /// The children last read for `path`.
    pub fn get(&self, path: &str) -> Option<ChildSet> {
        self.known.lock().get(path).map(|e| e.children.clone())
    }

    /// Every path that has been read successfully at least once.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.known.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Store `children` as read together with `stat`. Returns `false`, leaving the entry alone,
    /// if it already reflects a later change.
    pub(crate) fn record(&self, path: &str, children: ChildSet, stat: &Stat) -> bool {
        let mut known = self.known.lock();
        match known.get_mut(path) {
            Some(e) if e.pzxid > stat.pzxid => false,
            Some(e) => {
                e.children = children;
                e.pzxid = stat.pzxid;
                true
            }
            None => {
                known.insert(
                    path.to_string(),
                    Entry {
                        children,
                        pzxid: stat.pzxid,
                    },
                );
                true
            }
        }
    }

    /// Stop tracking `path`, e.g. because the node no longer exists.
    pub(crate) fn forget(&self, path: &str) -> Option<ChildSet> {
        self.known.lock().remove(path).map(|e| e.children)
    }
}
