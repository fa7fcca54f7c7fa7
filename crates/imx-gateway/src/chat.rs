//! Room membership and fan-out.
//!
//! A room holds sessions split into groups. Per-session metadata records the
//! cid currently carrying the session, shared by every room it is in, so a
//! relogin on a new connection moves all of its memberships at once. The
//! same record is the reverse index (sid → rooms) that keeps session
//! teardown proportional to the rooms it is in.

use imx_core::ImxResult;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

struct Presence {
    cid: u64,
    rids: HashSet<u64>,
}

#[derive(Default)]
struct Tables {
    /// rid → sid → gid.
    rooms: HashMap<u64, HashMap<u64, u32>>,
    sessions: HashMap<u64, Presence>,
}

impl Tables {
    fn remove(&mut self, rid: u64, sid: u64) -> bool {
        let Some(room) = self.rooms.get_mut(&rid) else {
            return false;
        };
        let removed = room.remove(&sid).is_some();
        if room.is_empty() {
            self.rooms.remove(&rid);
        }
        if let Some(presence) = self.sessions.get_mut(&sid) {
            presence.rids.remove(&rid);
            if presence.rids.is_empty() {
                self.sessions.remove(&sid);
            }
        }
        removed
    }
}

#[derive(Default)]
pub struct ChatTab {
    tables: RwLock<Tables>,
}

impl ChatTab {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `sid`, carried by `cid`, to group `gid` of room `rid`. Rejoining
    /// moves the session to the new group.
    pub fn join(&self, rid: u64, gid: u32, sid: u64, cid: u64) {
        let mut t = self.tables.write();
        t.rooms.entry(rid).or_default().insert(sid, gid);
        let presence = t.sessions.entry(sid).or_insert_with(|| Presence {
            cid,
            rids: HashSet::new(),
        });
        presence.cid = cid;
        presence.rids.insert(rid);
        debug!(rid, gid, sid, cid, "room joined");
    }

    /// Point every membership of `sid` at `cid`. Returns false when the
    /// session is in no room.
    pub fn rebind(&self, sid: u64, cid: u64) -> bool {
        match self.tables.write().sessions.get_mut(&sid) {
            Some(presence) => {
                if presence.cid != cid {
                    debug!(sid, from = presence.cid, to = cid, "room memberships moved");
                    presence.cid = cid;
                }
                true
            }
            None => false,
        }
    }

    /// Remove `sid` from room `rid`. Empty rooms are pruned.
    pub fn quit(&self, rid: u64, sid: u64) -> bool {
        let removed = self.tables.write().remove(rid, sid);
        if removed {
            debug!(rid, sid, "room quit");
        }
        removed
    }

    /// Remove `sid` from every room it is in. Returns the number of rooms.
    pub fn del_session(&self, sid: u64) -> usize {
        let mut t = self.tables.write();
        let rids: Vec<u64> = match t.sessions.get(&sid) {
            Some(presence) => presence.rids.iter().copied().collect(),
            None => return 0,
        };
        for rid in &rids {
            t.remove(*rid, sid);
        }
        rids.len()
    }

    /// Call `cb(sid, cid, param)` once for each member of room `rid` in
    /// group `gid` (every group when `gid` is 0).
    ///
    /// The member list is snapshotted first, so callbacks run without the
    /// table lock held. A failing callback is logged and traversal goes on.
    /// Returns the number of callbacks made.
    pub fn traverse<P, F>(&self, rid: u64, gid: u32, mut cb: F, param: &P) -> usize
    where
        F: FnMut(u64, u64, &P) -> ImxResult<()>,
    {
        let members: Vec<(u64, u64)> = {
            let t = self.tables.read();
            match t.rooms.get(&rid) {
                Some(room) => room
                    .iter()
                    .filter(|(_, g)| gid == 0 || **g == gid)
                    .filter_map(|(sid, _)| t.sessions.get(sid).map(|p| (*sid, p.cid)))
                    .collect(),
                None => return 0,
            }
        };

        for (sid, cid) in &members {
            if let Err(e) = cb(*sid, *cid, param) {
                warn!(rid, sid, cid, error = %e, "room delivery failed");
            }
        }
        members.len()
    }

    /// Number of sessions in room `rid`.
    pub fn usr_num(&self, rid: u64) -> usize {
        self.tables.read().rooms.get(&rid).map_or(0, HashMap::len)
    }

    pub fn room_num(&self) -> usize {
        self.tables.read().rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imx_core::ImxError;

    #[test]
    fn join_quit_and_prune() {
        let chat = ChatTab::new();
        chat.join(100, 1, 42, 7);
        chat.join(100, 2, 43, 8);
        assert_eq!(chat.usr_num(100), 2);
        assert!(chat.quit(100, 42));
        assert!(!chat.quit(100, 42));
        assert!(chat.quit(100, 43));
        assert_eq!(chat.room_num(), 0);
        assert!(chat.tables.read().sessions.is_empty());
    }

    #[test]
    fn rejoin_moves_group() {
        let chat = ChatTab::new();
        chat.join(1, 1, 42, 7);
        chat.join(1, 2, 42, 7);
        assert_eq!(chat.usr_num(1), 1);

        let mut seen = Vec::new();
        chat.traverse(1, 2, |sid, cid, _| {
            seen.push((sid, cid));
            Ok(())
        }, &());
        assert_eq!(seen, vec![(42, 7)]);
        assert_eq!(chat.traverse(1, 1, |_, _, _| Ok(()), &()), 0);
    }

    #[test]
    fn rebind_moves_every_membership() {
        let chat = ChatTab::new();
        chat.join(1, 0, 42, 7);
        chat.join(2, 0, 42, 7);
        chat.join(2, 0, 43, 8);
        assert!(chat.rebind(42, 9));
        assert!(!chat.rebind(44, 9));

        for rid in [1, 2] {
            let mut cids = Vec::new();
            chat.traverse(rid, 0, |sid, cid, _| {
                if sid == 42 {
                    cids.push(cid);
                }
                Ok(())
            }, &());
            assert_eq!(cids, vec![9]);
        }
    }

    #[test]
    fn traversal_is_best_effort() {
        let chat = ChatTab::new();
        for sid in 1..=5 {
            chat.join(9, 0, sid, sid + 100);
        }
        let mut calls = 0;
        let visited = chat.traverse(
            9,
            0,
            |sid, _, limit: &u64| {
                calls += 1;
                if sid == *limit {
                    Err(ImxError::SessionNotFound(sid))
                } else {
                    Ok(())
                }
            },
            &3,
        );
        assert_eq!(visited, 5);
        assert_eq!(calls, 5);
    }

    #[test]
    fn group_zero_addresses_whole_room() {
        let chat = ChatTab::new();
        chat.join(5, 1, 1, 11);
        chat.join(5, 2, 2, 12);
        chat.join(5, 2, 3, 13);
        assert_eq!(chat.traverse(5, 0, |_, _, _| Ok(()), &()), 3);
        assert_eq!(chat.traverse(5, 2, |_, _, _| Ok(()), &()), 2);
        assert_eq!(chat.traverse(6, 0, |_, _, _| Ok(()), &()), 0);
    }

    #[test]
    fn del_session_leaves_other_members() {
        let chat = ChatTab::new();
        chat.join(1, 0, 42, 7);
        chat.join(2, 0, 42, 7);
        chat.join(2, 0, 43, 8);
        assert_eq!(chat.del_session(42), 2);
        assert_eq!(chat.room_num(), 1);
        assert_eq!(chat.usr_num(2), 1);
        assert_eq!(chat.del_session(42), 0);
    }
}
