//! Ephemeral presence ("awareness") state for one document.
//!
//! Awareness is a per-document map from a numeric client id to an opaque
//! presence payload, collectively owned by the document's subscribers and
//! never persisted. Deltas travel inside [`Message::Awareness`] frames as a
//! blob of `(client id, clock, payload)` entries; a `null` payload removes
//! the entry. Clocks resolve races: a delta only wins over the known state
//! for a client when it carries a newer clock.
//!
//! [`Message::Awareness`]: crate::protocol::Message::Awareness

use std::collections::HashMap;

use crate::protocol::{write_var_string, write_var_uint, DecodeError, Reader};

/// Payload string that marks an entry as removed.
const NULL_STATE: &str = "null";

/// Result of applying an awareness delta: which client ids changed and how.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl AwarenessChange {
    /// All client ids touched by the delta, in arrival order.
    pub fn touched(&self) -> impl Iterator<Item = u64> + '_ {
        self.added
            .iter()
            .chain(self.updated.iter())
            .chain(self.removed.iter())
            .copied()
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Presence state for one document.
pub struct Awareness {
    /// Live presence payloads per client.
    states: HashMap<u64, String>,
    /// Last seen clock per client. Removed clients keep their clock so a
    /// stale rebroadcast cannot resurrect them.
    clocks: HashMap<u64, u64>,
}

impl Awareness {
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
            clocks: HashMap::new(),
        }
    }

    /// Whether any client currently has live presence state.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Client ids with live presence state.
    pub fn client_ids(&self) -> Vec<u64> {
        self.states.keys().copied().collect()
    }

    /// The presence payload for one client, if live.
    pub fn state_of(&self, client_id: u64) -> Option<&str> {
        self.states.get(&client_id).map(String::as_str)
    }

    /// Apply a presence delta, returning which clients were added, updated,
    /// or removed. Entries with clocks at or below the known clock are
    /// discarded, except that an equal-clock `null` still removes a live
    /// entry (removal wins a tie).
    pub fn apply_update(&mut self, update: &[u8]) -> Result<AwarenessChange, DecodeError> {
        let mut reader = Reader::new(update);
        let count = reader.read_var_uint()?;
        let mut change = AwarenessChange::default();

        for _ in 0..count {
            let client_id = reader.read_var_uint()?;
            let clock = reader.read_var_uint()?;
            let state = reader.read_var_string()?;

            let known_clock = self.clocks.get(&client_id).copied().unwrap_or(0);
            let is_null = state == NULL_STATE;
            let accept = clock > known_clock
                || (clock == known_clock && is_null && self.states.contains_key(&client_id));
            if !accept {
                continue;
            }

            self.clocks.insert(client_id, clock);
            if is_null {
                if self.states.remove(&client_id).is_some() {
                    change.removed.push(client_id);
                }
            } else if self.states.insert(client_id, state).is_some() {
                change.updated.push(client_id);
            } else {
                change.added.push(client_id);
            }
        }

        Ok(change)
    }

    /// Encode the current entries for the given clients as a delta blob.
    /// Clients without live state encode as removals at their last clock.
    pub fn encode_update(&self, clients: &[u64]) -> Vec<u8> {
        let mut buf = Vec::new();
        write_var_uint(&mut buf, clients.len() as u64);
        for &client_id in clients {
            let clock = self.clocks.get(&client_id).copied().unwrap_or(0);
            write_var_uint(&mut buf, client_id);
            write_var_uint(&mut buf, clock);
            match self.states.get(&client_id) {
                Some(state) => write_var_string(&mut buf, state),
                None => write_var_string(&mut buf, NULL_STATE),
            }
        }
        buf
    }

    /// Encode every live entry; the initial snapshot a new subscriber gets.
    pub fn encode_full(&self) -> Vec<u8> {
        self.encode_update(&self.client_ids())
    }

    /// Remove the given clients (their owning connection disconnected) and
    /// return the removal delta to rebroadcast to remaining subscribers.
    /// Clocks are bumped so the removal outranks any in-flight update.
    pub fn remove_clients(&mut self, clients: &[u64]) -> Vec<u8> {
        let mut buf = Vec::new();
        write_var_uint(&mut buf, clients.len() as u64);
        for &client_id in clients {
            let clock = self.clocks.get(&client_id).copied().unwrap_or(0) + 1;
            self.clocks.insert(client_id, clock);
            self.states.remove(&client_id);
            write_var_uint(&mut buf, client_id);
            write_var_uint(&mut buf, clock);
            write_var_string(&mut buf, NULL_STATE);
        }
        buf
    }
}

impl Default for Awareness {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Awareness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Awareness")
            .field("clients", &self.states.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(entries: &[(u64, u64, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        write_var_uint(&mut buf, entries.len() as u64);
        for &(client_id, clock, state) in entries {
            write_var_uint(&mut buf, client_id);
            write_var_uint(&mut buf, clock);
            write_var_string(&mut buf, state);
        }
        buf
    }

    #[test]
    fn test_apply_adds_clients() {
        let mut aw = Awareness::new();
        let change = aw
            .apply_update(&delta(&[(1, 1, r#"{"cursor":5}"#), (2, 1, r#"{}"#)]))
            .unwrap();

        assert_eq!(change.added, vec![1, 2]);
        assert_eq!(aw.state_of(1), Some(r#"{"cursor":5}"#));
        assert!(!aw.is_empty());
    }

    #[test]
    fn test_stale_clock_is_ignored() {
        let mut aw = Awareness::new();
        aw.apply_update(&delta(&[(1, 5, "new")])).unwrap();
        let change = aw.apply_update(&delta(&[(1, 3, "old")])).unwrap();

        assert!(change.is_empty());
        assert_eq!(aw.state_of(1), Some("new"));
    }

    #[test]
    fn test_newer_clock_updates() {
        let mut aw = Awareness::new();
        aw.apply_update(&delta(&[(1, 1, "a")])).unwrap();
        let change = aw.apply_update(&delta(&[(1, 2, "b")])).unwrap();

        assert_eq!(change.updated, vec![1]);
        assert_eq!(aw.state_of(1), Some("b"));
    }

    #[test]
    fn test_null_removes_entry() {
        let mut aw = Awareness::new();
        aw.apply_update(&delta(&[(1, 1, "a")])).unwrap();
        let change = aw.apply_update(&delta(&[(1, 2, "null")])).unwrap();

        assert_eq!(change.removed, vec![1]);
        assert!(aw.is_empty());
    }

    #[test]
    fn test_equal_clock_null_wins_tie() {
        let mut aw = Awareness::new();
        aw.apply_update(&delta(&[(1, 3, "a")])).unwrap();
        let change = aw.apply_update(&delta(&[(1, 3, "null")])).unwrap();

        assert_eq!(change.removed, vec![1]);
    }

    #[test]
    fn test_removed_client_cannot_resurrect_at_old_clock() {
        let mut aw = Awareness::new();
        aw.apply_update(&delta(&[(1, 4, "a")])).unwrap();
        let removal = aw.remove_clients(&[1]);

        // the removal delta applies cleanly on another replica
        let mut other = Awareness::new();
        other.apply_update(&delta(&[(1, 4, "a")])).unwrap();
        let change = other.apply_update(&removal).unwrap();
        assert_eq!(change.removed, vec![1]);

        // a stale rebroadcast of the original state is discarded
        let change = other.apply_update(&delta(&[(1, 4, "a")])).unwrap();
        assert!(change.is_empty());
        assert!(other.is_empty());
    }

    #[test]
    fn test_full_snapshot_round_trip() {
        let mut a = Awareness::new();
        a.apply_update(&delta(&[(7, 1, "x"), (8, 2, "y")])).unwrap();

        let mut b = Awareness::new();
        let change = b.apply_update(&a.encode_full()).unwrap();

        assert_eq!(change.added.len(), 2);
        assert_eq!(b.state_of(7), Some("x"));
        assert_eq!(b.state_of(8), Some("y"));
    }

    #[test]
    fn test_truncated_delta_errors() {
        let mut aw = Awareness::new();
        let mut buf = delta(&[(1, 1, "state")]);
        buf.truncate(buf.len() - 2);
        assert!(aw.apply_update(&buf).is_err());
    }
}
