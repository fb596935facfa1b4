use crate::common::format::{LookupKey, ParsedInternalKey, ValueType};
use crate::common::{KeyComparator, Result};
use crate::iterator::AsyncIterator;
use crate::util::extract_user_key;
use crate::version::SuperVersion;
use std::cmp::Ordering;
use std::sync::Arc;

#[derive(Eq, PartialEq, Clone, Copy)]
enum Direction {
    Forward,
    Reverse,
}

/// The user-facing iterator: walks the merged internal-key stream pinned at
/// a sequence, surfaces each live user key once, and hides tombstones and
/// superseded versions. Works in both directions.
pub struct DbIterator {
    inner: Box<dyn AsyncIterator>,
    user_comparator: Arc<dyn KeyComparator>,
    sequence: u64,
    direction: Direction,
    valid: bool,
    saved_key: Vec<u8>,
    saved_value: Vec<u8>,
    // Pins the memtables and files the inner iterator reads.
    _pinned: Arc<SuperVersion>,
}

impl DbIterator {
    pub fn new(
        inner: Box<dyn AsyncIterator>,
        user_comparator: Arc<dyn KeyComparator>,
        sequence: u64,
        pinned: Arc<SuperVersion>,
    ) -> Self {
        Self {
            inner,
            user_comparator,
            sequence,
            direction: Direction::Forward,
            valid: false,
            saved_key: vec![],
            saved_value: vec![],
            _pinned: pinned,
        }
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => extract_user_key(self.inner.key()),
            Direction::Reverse => &self.saved_key,
        }
    }

    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => self.inner.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    pub fn status(&self) -> Result<()> {
        self.inner.status()
    }

    pub async fn seek(&mut self, target: &[u8]) {
        self.direction = Direction::Forward;
        self.saved_key.clear();
        self.saved_value.clear();
        let lookup = LookupKey::new(target, self.sequence);
        self.inner.seek(lookup.internal_key()).await;
        if self.inner.valid() {
            self.find_next_user_entry(false).await;
        } else {
            self.valid = false;
        }
    }

    pub async fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.saved_key.clear();
        self.saved_value.clear();
        self.inner.seek_to_first().await;
        if self.inner.valid() {
            self.find_next_user_entry(false).await;
        } else {
            self.valid = false;
        }
    }

    pub async fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.saved_key.clear();
        self.saved_value.clear();
        self.inner.seek_to_last().await;
        self.find_prev_user_entry().await;
    }

    pub async fn next(&mut self) {
        debug_assert!(self.valid);
        if self.direction == Direction::Reverse {
            self.direction = Direction::Forward;
            // The inner iterator sits just before the entries of saved_key
            // (or is exhausted at the front); step back onto them so the
            // skip below moves past the current key.
            if !self.inner.valid() {
                self.inner.seek_to_first().await;
            } else {
                self.inner.next().await;
            }
            if !self.inner.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        } else {
            self.saved_key.clear();
            self.saved_key
                .extend_from_slice(extract_user_key(self.inner.key()));
            self.inner.next().await;
            if !self.inner.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        }
        self.find_next_user_entry(true).await;
    }

    pub async fn prev(&mut self) {
        debug_assert!(self.valid);
        if self.direction == Direction::Forward {
            // Back up until we leave the current user key's entries.
            self.saved_key.clear();
            self.saved_key
                .extend_from_slice(extract_user_key(self.inner.key()));
            loop {
                self.inner.prev().await;
                if !self.inner.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    return;
                }
                if self
                    .user_comparator
                    .compare_key(extract_user_key(self.inner.key()), &self.saved_key)
                    == Ordering::Less
                {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }
        self.find_prev_user_entry().await;
    }

    /// Forward scan for the next visible user entry. With `skipping`, entries
    /// for user keys <= `saved_key` are passed over.
    async fn find_next_user_entry(&mut self, mut skipping: bool) {
        loop {
            let ikey = ParsedInternalKey::new(self.inner.key());
            if ikey.valid() && ikey.sequence <= self.sequence {
                if ikey.tp == ValueType::TypeDeletion as u8 {
                    // Everything below this tombstone for the same user key
                    // is shadowed.
                    self.saved_key.clear();
                    self.saved_key.extend_from_slice(ikey.user_key());
                    skipping = true;
                } else if !skipping
                    || self
                        .user_comparator
                        .compare_key(ikey.user_key(), &self.saved_key)
                        == Ordering::Greater
                {
                    self.valid = true;
                    self.saved_key.clear();
                    return;
                }
            }
            self.inner.next().await;
            if !self.inner.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        }
    }

    /// Backward scan: walks entries of one user key from the newest visible
    /// downwards in position (upwards in sequence), remembering the newest
    /// visible value, and stops once the scan crosses into an older user key.
    async fn find_prev_user_entry(&mut self) {
        debug_assert!(self.direction == Direction::Reverse);
        let mut value_type = ValueType::TypeDeletion as u8;
        while self.inner.valid() {
            let ikey = ParsedInternalKey::new(self.inner.key());
            if ikey.valid() && ikey.sequence <= self.sequence {
                if value_type != ValueType::TypeDeletion as u8
                    && self
                        .user_comparator
                        .compare_key(ikey.user_key(), &self.saved_key)
                        == Ordering::Less
                {
                    // We have a live value for the key after this one.
                    break;
                }
                value_type = ikey.tp;
                if value_type == ValueType::TypeDeletion as u8 {
                    self.saved_key.clear();
                    self.saved_value.clear();
                } else {
                    self.saved_key.clear();
                    self.saved_key.extend_from_slice(ikey.user_key());
                    self.saved_value.clear();
                    self.saved_value.extend_from_slice(self.inner.value());
                }
            }
            self.inner.prev().await;
        }
        if value_type == ValueType::TypeDeletion as u8 {
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }
}
