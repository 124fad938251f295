//! Operator and remote-config block tables (§3, §4.2 step 4). A hit on
//! either table silently pops the request — no response frame is sent.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::common::now_ms;
use crate::identifiers::edge_key;

#[derive(Default)]
struct BlockTable {
    entries: RwLock<HashMap<String, u64>>,
}

impl BlockTable {
    fn block(&self, cn: &str, sn: &str) {
        self.entries.write().insert(edge_key(cn, sn), now_ms());
    }

    fn unblock(&self, cn: &str, sn: &str) {
        self.entries.write().remove(&edge_key(cn, sn));
    }

    fn is_blocked(&self, cn: &str, sn: &str) -> bool {
        let entries = self.entries.read();
        entries.contains_key(&edge_key(cn, sn))
            || entries.contains_key(&edge_key("*", sn))
            || entries.contains_key(&edge_key(cn, "*"))
    }

    fn replace_all(&self, keys: impl IntoIterator<Item = String>) {
        let now = now_ms();
        let mut entries = self.entries.write();
        entries.clear();
        for key in keys {
            if key == "*~~*" {
                // `*~~*` would block everything; the wire format forbids it.
                continue;
            }
            entries.insert(key, now);
        }
    }
}

/// Two independent tables: one populated by an operator-facing control
/// endpoint, one mirrored from the polled remote-config `kill_switch`
/// list (§6). A hit on either blocks the request.
#[derive(Default)]
pub struct BlockingTable {
    operator: BlockTable,
    remote: BlockTable,
}

impl BlockingTable {
    pub fn new() -> Self {
        BlockingTable::default()
    }

    pub fn block(&self, cn: &str, sn: &str) {
        self.operator.block(cn, sn);
    }

    pub fn unblock(&self, cn: &str, sn: &str) {
        self.operator.unblock(cn, sn);
    }

    /// Replace the remote-config-sourced block list wholesale, as happens
    /// on every config poll tick.
    pub fn apply_remote_kill_switch(&self, keys: Vec<String>) {
        self.remote.replace_all(keys);
    }

    pub fn is_blocked(&self, cn: &str, sn: &str) -> bool {
        self.operator.is_blocked(cn, sn) || self.remote.is_blocked(cn, sn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_blocks() {
        let t = BlockingTable::new();
        t.block("alice", "steve");
        assert!(t.is_blocked("alice", "steve"));
        assert!(!t.is_blocked("bob", "steve"));
    }

    #[test]
    fn wildcard_service_blocks_any_caller() {
        let t = BlockingTable::new();
        t.block("*", "steve");
        assert!(t.is_blocked("anyone", "steve"));
        assert!(!t.is_blocked("anyone", "bob"));
    }

    #[test]
    fn wildcard_caller_blocks_any_service() {
        let t = BlockingTable::new();
        t.block("alice", "*");
        assert!(t.is_blocked("alice", "anything"));
    }

    #[test]
    fn unblock_removes_entry() {
        let t = BlockingTable::new();
        t.block("alice", "steve");
        t.unblock("alice", "steve");
        assert!(!t.is_blocked("alice", "steve"));
    }

    #[test]
    fn remote_kill_switch_ignores_double_wildcard() {
        let t = BlockingTable::new();
        t.apply_remote_kill_switch(vec!["*~~*".to_owned(), "alice~~steve".to_owned()]);
        assert!(t.is_blocked("alice", "steve"));
        assert!(!t.is_blocked("random_cn", "random_sn"));
    }
}
