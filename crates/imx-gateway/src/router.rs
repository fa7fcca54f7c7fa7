//! Session router: sid → cid.
//!
//! A sid maps to at most one cid. [`SessionRouter::bind`] hands back the
//! mapping it displaced; evicting that connection is the caller's job.

use crate::shard::ShardedMap;
use tracing::debug;

pub struct SessionRouter {
    routes: ShardedMap<u64>,
}

impl SessionRouter {
    pub fn new(shards: usize) -> Self {
        Self {
            routes: ShardedMap::new(shards),
        }
    }

    /// Route `sid` to `cid`. Returns the previously bound cid, if any.
    pub fn bind(&self, sid: u64, cid: u64) -> Option<u64> {
        let prev = self.routes.insert(sid, cid);
        debug!(sid, cid, prev = ?prev, "session bound");
        prev
    }

    pub fn lookup(&self, sid: u64) -> Option<u64> {
        self.routes.get(sid)
    }

    /// Remove the route for `sid` only if it still points at `cid`.
    ///
    /// A connection that was displaced by a newer login must not tear down
    /// the route its successor owns.
    pub fn unbind(&self, sid: u64, cid: u64) -> bool {
        self.routes.remove_if(sid, |bound| *bound == cid).is_some()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }
}
