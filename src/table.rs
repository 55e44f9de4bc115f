//! Worker-confined two-way index of live registrations.
//!
//! One mapping goes from directory identity to the completion token of the
//! live registration for it (used to deduplicate repeat registrations), the
//! other from token to the registration itself (used to attribute dequeued
//! completions). Both are mutated only by the worker thread, so no locking
//! is involved.

use crate::source::{DirectoryIdentity, Token};
use std::collections::HashMap;

#[derive(Debug)]
pub(crate) struct RegistrationTable<R> {
    by_token: HashMap<Token, (DirectoryIdentity, R)>,
    by_identity: HashMap<DirectoryIdentity, Token>,
    last_token: u64,
}

impl<R> RegistrationTable<R> {
    pub fn new() -> Self {
        RegistrationTable {
            by_token: HashMap::new(),
            by_identity: HashMap::new(),
            last_token: Token::WAKEUP.0,
        }
    }

    /// Hands out the next completion token: monotonically increasing,
    /// skipping the reserved wakeup value and any token still live in the
    /// table, so a token can never be attributed to two registrations even
    /// after the counter wraps.
    pub fn allocate_token(&mut self) -> Token {
        loop {
            self.last_token = self.last_token.wrapping_add(1);
            let token = Token(self.last_token);
            if token != Token::WAKEUP && !self.by_token.contains_key(&token) {
                return token;
            }
        }
    }

    pub fn token_for(&self, identity: &DirectoryIdentity) -> Option<Token> {
        self.by_identity.get(identity).copied()
    }

    pub fn contains(&self, token: Token) -> bool {
        self.by_token.contains_key(&token)
    }

    pub fn get(&self, token: Token) -> Option<&R> {
        self.by_token.get(&token).map(|(_, reg)| reg)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut R> {
        self.by_token.get_mut(&token).map(|(_, reg)| reg)
    }

    pub fn insert(&mut self, token: Token, identity: DirectoryIdentity, registration: R) {
        debug_assert!(token != Token::WAKEUP);
        debug_assert!(!self.by_token.contains_key(&token));
        self.by_identity.insert(identity, token);
        self.by_token.insert(token, (identity, registration));
    }

    /// Removes the registration under `token` from both indices, so a
    /// completion still in flight for it is ignored rather than attributed
    /// to a replacement.
    pub fn remove(&mut self, token: Token) -> Option<R> {
        let (identity, registration) = self.by_token.remove(&token)?;
        self.by_identity.remove(&identity);
        Some(registration)
    }

    /// Empties both indices, returning every live registration.
    pub fn drain(&mut self) -> Vec<R> {
        self.by_identity.clear();
        self.by_token.drain().map(|(_, (_, reg))| reg).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }
}
