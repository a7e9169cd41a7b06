use std::time::Duration;

/// The kind of a pipeline entry, recorded when the command is written.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub(crate) enum EntryKind {
    Multi,
    Exec,
    Discard,
    Watch,
    Unwatch,
    Command,
}

/// One entry per command written to the connection, recording whether a
/// reply is expected and how it should be read back.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub(crate) struct Entry {
    pub kind: EntryKind,
    /// The command was buffered inside a MULTI block.
    pub queued: bool,
    /// The reply is suppressed and never arrives on the wire.
    pub skip: bool,
    /// The command may block on the server.
    pub block: bool,
    /// The blocking timeout declared by the command's last argument.
    pub timeout: Duration,
}

impl Default for Entry {
    fn default() -> Entry {
        Entry::new(EntryKind::Command, false, false)
    }
}

impl Entry {
    fn new(kind: EntryKind, queued: bool, skip: bool) -> Entry {
        Entry {
            kind,
            queued,
            skip,
            block: false,
            timeout: Duration::from_secs(0),
        }
    }
}

/// Deterministic accounting of the causal relation between commands
/// written and replies to be read, across transactions, optimistic
/// locking, reply suppression and database selection.
///
/// Entries live in a FIFO queue; peeked entries are pushed back through
/// a small LIFO stack that is consulted before the queue on every pop,
/// so readers can look ahead without reordering replies.
#[derive(Default)]
pub(crate) struct State {
    dirty: bool,
    multi: bool,
    reply_off: bool,
    reply_skip: bool,
    watch: usize,
    db: u32,
    queue: Vec<Entry>,
    stack: Vec<Entry>,
}

/// The max db index allowed by redis.
pub const MAX_DB_INDEX: u32 = 16;

/// Checks if a database index is valid.
pub fn db_index_valid(index: u32) -> bool {
    index < MAX_DB_INDEX
}

impl State {
    pub fn new() -> State {
        State::default()
    }

    /// Consumes the pending reply-suppression for the entry being
    /// pushed.  Inside a MULTI block replies are never suppressed: the
    /// server acks every queued command with `QUEUED`.
    fn consume_skip(&mut self) -> bool {
        if self.multi {
            return false;
        }
        let skip = self.reply_skip || self.reply_off;
        self.reply_skip = false;
        skip
    }

    fn push(&mut self, kind: EntryKind) {
        match kind {
            EntryKind::Exec | EntryKind::Discard => {
                self.multi = false;
                self.watch = 0;
            }
            EntryKind::Unwatch => {
                self.watch = 0;
            }
            _ => {}
        }
        // The entry's flags reflect the state at push time: a pending
        // reply-skip is consumed by the MULTI entry itself, and the
        // MULTI entry is not queued.
        let skip = self.consume_skip();
        self.dirty = self.dirty || !skip;
        self.queue.push(Entry::new(kind, self.multi, skip));
        if kind == EntryKind::Multi {
            self.multi = true;
        }
    }

    /// Records a `MULTI`.
    pub fn multi(&mut self) {
        self.push(EntryKind::Multi);
    }

    /// Records an `EXEC`.
    pub fn exec(&mut self) {
        self.push(EntryKind::Exec);
    }

    /// Records a `DISCARD`.
    pub fn discard(&mut self) {
        self.push(EntryKind::Discard);
    }

    /// Records a `WATCH` of `n` keys.
    pub fn watch(&mut self, n: usize) {
        self.watch += n;
        self.push(EntryKind::Watch);
    }

    /// Records an `UNWATCH`.
    pub fn unwatch(&mut self) {
        self.push(EntryKind::Unwatch);
    }

    /// Records a `CLIENT REPLY ON`.
    pub fn reply_on(&mut self) {
        self.reply_off = false;
        self.push(EntryKind::Command);
    }

    /// Records a `CLIENT REPLY OFF`.  The acknowledging reply is itself
    /// suppressed.
    pub fn reply_off(&mut self) {
        self.reply_off = true;
        self.push(EntryKind::Command);
    }

    /// Records a `CLIENT REPLY SKIP`.  Its own reply is suppressed and
    /// the next command's reply will be too.  Inside MULTI the server
    /// ignores the subcommand, so the flag is not set.
    pub fn reply_skip(&mut self) {
        self.reply_skip = !self.multi;
        self.push(EntryKind::Command);
        self.reply_skip = !self.multi;
    }

    /// Records a `SELECT` of a valid database index.
    pub fn select(&mut self, db: u32) {
        if db_index_valid(db) {
            self.db = db;
        }
        self.push(EntryKind::Command);
    }

    /// Records any other command.
    pub fn command(&mut self) {
        self.push(EntryKind::Command);
    }

    /// Records a blocking command with the timeout parsed from its last
    /// argument.  Blocking commands buffered inside MULTI execute
    /// without waiting, so the flag is dropped for queued entries.
    pub fn block(&mut self, timeout: Duration) {
        self.push(EntryKind::Command);
        if let Some(entry) = self.queue.last_mut() {
            if !entry.queued {
                entry.block = true;
                entry.timeout = timeout;
            }
        }
    }

    /// Pops the next entry expecting a reply read.  The LIFO stack is
    /// consulted first; when it drains, the queue head is returned and
    /// the remainder is shifted onto the stack in reverse order so
    /// subsequent pops keep FIFO order.
    pub fn pop(&mut self) -> Option<Entry> {
        if let Some(entry) = self.stack.pop() {
            self.recalc_dirty();
            return Some(entry);
        }
        if self.queue.is_empty() {
            self.dirty = false;
            return None;
        }
        let mut drain = self.queue.drain(..);
        let head = drain.next();
        let mut tail: Vec<Entry> = drain.collect();
        tail.reverse();
        self.stack = tail;
        self.recalc_dirty();
        head
    }

    fn recalc_dirty(&mut self) {
        self.dirty = self.stack.iter().any(|e| !e.skip) || self.queue.iter().any(|e| !e.skip);
    }

    /// Pushes a popped entry back; it will be returned by the next pop.
    pub fn push_back(&mut self, entry: Entry) {
        self.stack.push(entry);
        self.dirty = self.dirty || !entry.skip;
    }

    /// Returns the next reply-bearing entry without consuming it.
    pub fn peek(&self) -> Option<Entry> {
        for entry in self.stack.iter().rev() {
            if !entry.skip {
                return Some(*entry);
            }
        }
        self.queue.iter().find(|entry| !entry.skip).copied()
    }

    /// If the next reply-bearing entry opens a MULTI block, returns the
    /// number of commands queued inside it.  Leading suppressed entries
    /// are ignored.
    pub fn peek_multi(&self) -> Option<usize> {
        let mut iter = self
            .stack
            .iter()
            .rev()
            .chain(self.queue.iter())
            .filter(|entry| !entry.skip);
        match iter.next() {
            Some(entry) if entry.kind == EntryKind::Multi => {}
            _ => return None,
        }
        let mut n = 0;
        for entry in iter {
            match entry.kind {
                EntryKind::Exec | EntryKind::Discard => break,
                _ => n += 1,
            }
        }
        Some(n)
    }

    /// The number of entries whose replies arrive on the wire.
    pub fn count_replies(&self) -> usize {
        self.stack.iter().filter(|e| !e.skip).count()
            + self.queue.iter().filter(|e| !e.skip).count()
    }

    /// The number of entries whose replies are suppressed.
    pub fn count_skipped(&self) -> usize {
        self.stack.iter().filter(|e| e.skip).count()
            + self.queue.iter().filter(|e| e.skip).count()
    }

    /// The total number of outstanding entries.
    pub fn len(&self) -> usize {
        self.stack.len() + self.queue.len()
    }

    /// True while any reply remains to be read.
    pub fn dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_multi(&self) -> bool {
        self.multi
    }

    pub fn is_watch(&self) -> bool {
        self.watch > 0
    }

    pub fn is_reply_off(&self) -> bool {
        self.reply_off
    }

    pub fn is_reply_skip(&self) -> bool {
        self.reply_skip
    }

    pub fn db(&self) -> u32 {
        self.db
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_entries_expect_replies() {
        let mut state = State::new();
        state.command();
        state.command();
        assert_eq!(state.len(), 2);
        assert_eq!(state.count_replies(), 2);
        assert!(state.dirty());
        let entry = state.pop().unwrap();
        assert_eq!(entry.kind, EntryKind::Command);
        assert!(!entry.skip);
        assert!(state.pop().is_some());
        assert!(state.pop().is_none());
        assert!(!state.dirty());
    }

    #[test]
    fn pop_preserves_fifo_order_through_stack() {
        let mut state = State::new();
        state.multi();
        state.command();
        state.exec();
        let kinds: Vec<EntryKind> = std::iter::from_fn(|| state.pop()).map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EntryKind::Multi, EntryKind::Command, EntryKind::Exec]
        );
    }

    #[test]
    fn push_back_is_returned_first() {
        let mut state = State::new();
        state.command();
        state.watch(1);
        let first = state.pop().unwrap();
        assert_eq!(first.kind, EntryKind::Command);
        state.push_back(first);
        assert_eq!(state.pop().unwrap().kind, EntryKind::Command);
        assert_eq!(state.pop().unwrap().kind, EntryKind::Watch);
    }

    #[test]
    fn reply_skip_suppresses_next_command_only() {
        let mut state = State::new();
        state.reply_skip();
        state.command();
        state.command();
        assert_eq!(state.count_replies(), 1);
        assert_eq!(state.count_skipped(), 2);
        assert_eq!(state.count_replies() + state.count_skipped(), state.len());
    }

    #[test]
    fn reply_off_suppresses_until_reply_on() {
        let mut state = State::new();
        state.reply_off();
        state.command();
        state.command();
        assert!(state.is_reply_off());
        assert_eq!(state.count_replies(), 0);
        state.reply_on();
        state.command();
        assert!(!state.is_reply_off());
        // CLIENT REPLY ON acks with +OK, so it counts, as does the
        // command after it.
        assert_eq!(state.count_replies(), 2);
    }

    #[test]
    fn multi_cancels_pending_reply_skip() {
        let mut state = State::new();
        state.reply_skip();
        state.multi();
        state.command();
        state.exec();
        // MULTI consumed the skip; the queued command and EXEC both
        // reply.
        let entries: Vec<Entry> = std::iter::from_fn(|| state.pop()).collect();
        assert!(entries[0].skip, "CLIENT REPLY SKIP's own ack is skipped");
        assert!(entries[1].skip, "the MULTI entry consumed the pending skip");
        assert!(!entries[1].queued);
        assert!(!entries[2].skip, "queued command acks QUEUED");
        assert!(entries[2].queued);
        assert!(!entries[3].skip, "EXEC replies");
    }

    #[test]
    fn reply_skip_is_noop_inside_multi() {
        let mut state = State::new();
        state.multi();
        state.reply_skip();
        assert!(!state.is_reply_skip());
        state.command();
        state.exec();
        assert_eq!(state.count_replies(), 4);
    }

    #[test]
    fn watch_accounting() {
        let mut state = State::new();
        state.watch(2);
        assert!(state.is_watch());
        state.watch(1);
        state.unwatch();
        assert!(!state.is_watch());
        state.watch(1);
        state.multi();
        state.command();
        state.exec();
        // EXEC clears the watch state
        assert!(!state.is_watch());
        assert!(!state.is_multi());
    }

    #[test]
    fn discard_leaves_multi() {
        let mut state = State::new();
        state.multi();
        assert!(state.is_multi());
        state.command();
        state.discard();
        assert!(!state.is_multi());
    }

    #[test]
    fn select_tracks_valid_db_index() {
        let mut state = State::new();
        state.select(3);
        assert_eq!(state.db(), 3);
        state.select(99);
        assert_eq!(state.db(), 3);
    }

    #[test]
    fn blocking_flag_cleared_inside_multi() {
        let mut state = State::new();
        state.block(Duration::from_secs(5));
        let entry = state.pop().unwrap();
        assert!(entry.block);
        assert_eq!(entry.timeout, Duration::from_secs(5));

        state.multi();
        state.block(Duration::from_secs(5));
        state.exec();
        let entries: Vec<Entry> = std::iter::from_fn(|| state.pop()).collect();
        assert!(entries[1].queued);
        assert!(!entries[1].block, "queued blocking commands do not block");
    }

    #[test]
    fn peek_skips_suppressed_entries() {
        let mut state = State::new();
        state.reply_skip();
        state.command(); // suppressed
        state.watch(1);
        let next = state.peek().unwrap();
        assert_eq!(next.kind, EntryKind::Watch);
        // peeking does not consume
        assert_eq!(state.len(), 3);
        // a popped entry can be pushed back for the next reader
        let entry = state.pop().unwrap();
        state.push_back(entry);
        assert_eq!(state.len(), 3);
    }

    #[test]
    fn peek_multi_counts_queued_span() {
        let mut state = State::new();
        state.reply_skip();
        state.command(); // suppressed
        state.multi();
        state.command();
        state.command();
        state.command();
        state.exec();
        assert_eq!(state.peek_multi(), Some(3));

        let mut plain = State::new();
        plain.command();
        assert_eq!(plain.peek_multi(), None);
    }
}
