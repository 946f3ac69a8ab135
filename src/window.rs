//! Context-window assembly shared by the query backends.
//!
//! Backends differ only in how neighbours of an anchor are found:
//!
//! - sequential scans feed every record through a [`ScanWindow`], which
//!   keeps a ring of recent non-matching records as "before" context and
//!   counts down the "after" context;
//! - indexed backends implement [`NeighborLookup`] and let
//!   [`expand_anchors`] concatenate `[before.., anchor, after..]` per anchor.

use crate::error::QueryError;
use crate::query::ContextWindow;
use crate::record::LogRecord;
use async_trait::async_trait;
use std::collections::VecDeque;

/// Streaming context windower for a forward, oldest-first scan.
#[derive(Debug)]
pub struct ScanWindow {
    window: ContextWindow,
    ring: VecDeque<LogRecord>,
    after_remaining: usize,
}

impl ScanWindow {
    pub fn new(window: ContextWindow) -> Self {
        ScanWindow {
            window,
            ring: VecDeque::with_capacity(window.before()),
            after_remaining: 0,
        }
    }

    /// Feed the next record of the scan, appending whatever it releases
    /// to `out` in chronological order.
    ///
    /// A match flushes the ring, is emitted itself and re-arms the after
    /// counter. A non-match is emitted while the after counter is armed
    /// and is always retained in the ring, so it may be emitted again as
    /// before-context of a later match.
    pub fn push(&mut self, record: LogRecord, is_match: bool, out: &mut Vec<LogRecord>) {
        if is_match {
            out.extend(self.ring.drain(..));
            out.push(record);
            self.after_remaining = self.window.after();
            return;
        }

        let keep = self.window.before() > 0;
        if self.after_remaining > 0 {
            self.after_remaining -= 1;
            if keep {
                out.push(record.clone());
            } else {
                out.push(record);
                return;
            }
        }

        if keep {
            if self.ring.len() == self.window.before() {
                self.ring.pop_front();
            }
            self.ring.push_back(record);
        }
    }
}

/// Scoped neighbour access for an indexed backend.
///
/// Both methods return records in chronological order and only from the
/// anchor's own identity timeline.
#[async_trait]
pub trait NeighborLookup: Send + Sync {
    /// Up to `count` records strictly older than `anchor`.
    async fn before(&self, anchor: &LogRecord, count: usize) -> Result<Vec<LogRecord>, QueryError>;

    /// Up to `count` records strictly newer than `anchor`.
    async fn after(&self, anchor: &LogRecord, count: usize) -> Result<Vec<LogRecord>, QueryError>;
}

/// Build the context-expanded result for `anchors`, in anchor order.
///
/// Windows of nearby anchors are not merged: a record inside two windows
/// appears twice.
pub async fn expand_anchors<L>(
    lookup: &L,
    anchors: Vec<LogRecord>,
    window: ContextWindow,
) -> Result<Vec<LogRecord>, QueryError>
where
    L: NeighborLookup + ?Sized,
{
    let mut out = Vec::with_capacity(anchors.len() * (window.before() + window.after() + 1));
    for anchor in anchors {
        if window.before() > 0 {
            out.extend(lookup.before(&anchor, window.before()).await?);
        }
        let after = if window.after() > 0 {
            lookup.after(&anchor, window.after()).await?
        } else {
            Vec::new()
        };
        out.push(anchor);
        out.extend(after);
    }
    Ok(out)
}
