//! Merges the history snapshot and the live stream of one channel activation
//! into a single ordered, duplicate-free view.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use shared::domain::{ChatMessage, MessageId, ReactionAction, ReactionEvent};
use tracing::debug;

pub const DEFAULT_REACTION_WINDOW: usize = 32;
pub const DEFAULT_REACTION_CAPACITY: usize = 64;

type Fingerprint = [u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveOutcome {
    Inserted,
    /// An id-less entry matched by content took over the incoming id.
    AdoptedId,
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionOutcome {
    Applied,
    Unchanged,
    Buffered,
    Dropped,
}

struct Entry {
    message: ChatMessage,
    fingerprint: Fingerprint,
    seq: u64,
}

impl Entry {
    fn sort_key(&self) -> (DateTime<Utc>, i64, u64) {
        sort_key(&self.message, self.seq)
    }
}

struct PendingReaction {
    event: ReactionEvent,
    remaining: usize,
}

pub struct MessageReconciler {
    entries: Vec<Entry>,
    ids: HashSet<MessageId>,
    fingerprints: HashSet<Fingerprint>,
    pending: VecDeque<PendingReaction>,
    /// Reactions applied to live messages before the snapshot landed, with
    /// toggles resolved to the add or remove they performed.
    early_reactions: Vec<ReactionEvent>,
    history_applied: bool,
    next_seq: u64,
    reaction_window: usize,
    reaction_capacity: usize,
}

impl Default for MessageReconciler {
    fn default() -> Self {
        Self::new(DEFAULT_REACTION_WINDOW, DEFAULT_REACTION_CAPACITY)
    }
}

impl MessageReconciler {
    /// `reaction_window` is how many insertions a reaction for an unknown
    /// message waits; `reaction_capacity` caps how many may wait at once.
    pub fn new(reaction_window: usize, reaction_capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            ids: HashSet::new(),
            fingerprints: HashSet::new(),
            pending: VecDeque::new(),
            early_reactions: Vec::new(),
            history_applied: false,
            next_seq: 0,
            reaction_window,
            reaction_capacity,
        }
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.ids.clear();
        self.fingerprints.clear();
        self.pending.clear();
        self.early_reactions.clear();
        self.history_applied = false;
        self.next_seq = 0;
    }

    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> + '_ {
        self.entries.iter().map(|entry| &entry.message)
    }

    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.messages().cloned().collect()
    }

    pub fn get(&self, id: MessageId) -> Option<&ChatMessage> {
        self.entries
            .iter()
            .find(|entry| entry.message.id == Some(id))
            .map(|entry| &entry.message)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn history_applied(&self) -> bool {
        self.history_applied
    }

    pub fn pending_reactions(&self) -> usize {
        self.pending.len()
    }

    /// Replaces the working set with `snapshot`. Messages that already arrived
    /// live during this activation survive unless the snapshot carries them.
    pub fn apply_history(&mut self, snapshot: Vec<ChatMessage>) {
        let live = std::mem::take(&mut self.entries);
        self.ids.clear();
        self.fingerprints.clear();
        self.history_applied = true;

        let snapshot_len = snapshot.len();
        for message in snapshot {
            self.insert(message);
        }
        let mut carried = 0usize;
        for entry in live {
            if self.insert(entry.message) == LiveOutcome::Inserted {
                carried += 1;
            }
        }
        for event in std::mem::take(&mut self.early_reactions) {
            if let Some(message) = self.find_mut(event.message_id) {
                message.apply_reaction(event.reaction, event.action);
            }
        }
        self.resolve_all_pending();

        debug!(
            snapshot = snapshot_len,
            carried_live = carried,
            total = self.entries.len(),
            "reconciler: history applied"
        );
    }

    pub fn apply_live(&mut self, message: ChatMessage) -> LiveOutcome {
        let id = message.id;
        let outcome = self.insert(message);
        if outcome != LiveOutcome::Duplicate {
            if let Some(id) = id {
                self.resolve_pending(id);
            }
        }
        if outcome == LiveOutcome::Inserted {
            self.age_pending();
        }
        outcome
    }

    pub fn apply_reaction(&mut self, event: ReactionEvent) -> ReactionOutcome {
        if let Some(changed) = self.apply_to_known(event.clone()) {
            return if changed {
                ReactionOutcome::Applied
            } else {
                ReactionOutcome::Unchanged
            };
        }

        if self.reaction_window == 0 || self.reaction_capacity == 0 {
            return ReactionOutcome::Dropped;
        }
        if self.pending.len() >= self.reaction_capacity {
            if let Some(evicted) = self.pending.pop_front() {
                debug!(
                    message_id = evicted.event.message_id.0,
                    "reconciler: evicting oldest buffered reaction"
                );
            }
        }
        self.pending.push_back(PendingReaction {
            event,
            remaining: self.reaction_window,
        });
        ReactionOutcome::Buffered
    }

    fn insert(&mut self, message: ChatMessage) -> LiveOutcome {
        if let Some(id) = message.id {
            if self.ids.contains(&id) {
                return LiveOutcome::Duplicate;
            }
        }

        let fingerprint = fingerprint(&message);
        if self.fingerprints.contains(&fingerprint) {
            let Some(id) = message.id else {
                return LiveOutcome::Duplicate;
            };
            if let Some(entry) = self
                .entries
                .iter_mut()
                .find(|entry| entry.fingerprint == fingerprint && entry.message.id.is_none())
            {
                entry.message.id = Some(id);
                for reaction in message.reactions {
                    if !entry.message.has_reaction(&reaction.emoji, reaction.user_id) {
                        entry.message.reactions.push(reaction);
                    }
                }
                self.ids.insert(id);
                self.entries.sort_by_key(Entry::sort_key);
                return LiveOutcome::AdoptedId;
            }
            // Same content under a different id is a distinct message.
        }

        let entry = Entry {
            message,
            fingerprint,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        let key = entry.sort_key();
        let idx = self.entries.partition_point(|existing| existing.sort_key() <= key);
        if let Some(id) = entry.message.id {
            self.ids.insert(id);
        }
        self.fingerprints.insert(fingerprint);
        self.entries.insert(idx, entry);
        LiveOutcome::Inserted
    }

    fn find_mut(&mut self, id: MessageId) -> Option<&mut ChatMessage> {
        if !self.ids.contains(&id) {
            return None;
        }
        self.entries
            .iter_mut()
            .find(|entry| entry.message.id == Some(id))
            .map(|entry| &mut entry.message)
    }

    /// Applies `event` when its target is present; `None` otherwise.
    fn apply_to_known(&mut self, event: ReactionEvent) -> Option<bool> {
        let history_applied = self.history_applied;
        let message = self.find_mut(event.message_id)?;
        let changed = message.apply_reaction(event.reaction.clone(), event.action);
        if !history_applied {
            let action = if message.has_reaction(&event.reaction.emoji, event.reaction.user_id) {
                ReactionAction::Add
            } else {
                ReactionAction::Remove
            };
            self.early_reactions.push(ReactionEvent { action, ..event });
        }
        Some(changed)
    }

    fn resolve_pending(&mut self, id: MessageId) {
        if self.pending.is_empty() {
            return;
        }
        let (matched, rest): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|pending| pending.event.message_id == id);
        self.pending = rest;
        for pending in matched {
            self.apply_to_known(pending.event);
        }
    }

    fn resolve_all_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for item in pending {
            match self.find_mut(item.event.message_id) {
                Some(message) => {
                    message.apply_reaction(item.event.reaction, item.event.action);
                }
                None => self.pending.push_back(item),
            }
        }
    }

    fn age_pending(&mut self) {
        for pending in &mut self.pending {
            pending.remaining = pending.remaining.saturating_sub(1);
        }
        let before = self.pending.len();
        self.pending.retain(|pending| pending.remaining > 0);
        let expired = before - self.pending.len();
        if expired > 0 {
            debug!(expired, "reconciler: discarded reactions for messages that never arrived");
        }
    }
}

/// Messages order by timestamp, then id; id-less messages trail their
/// timestamp and arrival order breaks the remaining ties.
fn sort_key(message: &ChatMessage, seq: u64) -> (DateTime<Utc>, i64, u64) {
    (
        message.created_at,
        message.id.map_or(i64::MAX, |id| id.0),
        seq,
    )
}

fn fingerprint(message: &ChatMessage) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(message.author.id.0.to_be_bytes());
    hasher.update(message.created_at.timestamp().to_be_bytes());
    hasher.update(message.created_at.timestamp_subsec_nanos().to_be_bytes());
    let body = message.body.as_deref().unwrap_or_default();
    hasher.update((body.len() as u64).to_be_bytes());
    hasher.update(body.as_bytes());
    for attachment in &message.attachments {
        hasher.update((attachment.kind.len() as u64).to_be_bytes());
        hasher.update(attachment.kind.as_bytes());
        hasher.update((attachment.locator.len() as u64).to_be_bytes());
        hasher.update(attachment.locator.as_bytes());
    }
    hasher.finalize().into()
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
