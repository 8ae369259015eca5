//! Name → connection map of registered peers.

use rcs_core::Connection;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct Registry {
    peers: HashMap<String, Connection>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn` under `name`. Returns `false`, leaving the registry
    /// untouched, if the name is taken.
    pub fn insert(&mut self, name: &str, conn: Connection) -> bool {
        if self.peers.contains_key(name) {
            return false;
        }
        self.peers.insert(name.to_string(), conn);
        true
    }

    /// Remove `name` if it is still registered to connection `id`.
    pub fn remove(&mut self, name: &str, id: u64) -> Option<Connection> {
        if self.peers.get(name).is_some_and(|conn| conn.id() == id) {
            self.peers.remove(name)
        } else {
            None
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.peers.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Connection> {
        self.peers.get(name)
    }

    /// Every registered connection except the one named `except`.
    pub fn others<'a>(&'a self, except: &'a str) -> impl Iterator<Item = &'a Connection> + 'a {
        self.peers
            .iter()
            .filter(move |(name, _)| name.as_str() != except)
            .map(|(_, conn)| conn)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.peers.values()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
