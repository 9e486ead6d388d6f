//! Drill-down view state.
//!
//! Each ledger view owns one `Drilldown`. Opening or refreshing issues a new
//! `Ticket`; only a result carrying the latest ticket is committed, so a slow
//! response from an earlier open can never overwrite a newer one, and closing
//! the view discards anything still in flight.

use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

#[derive(Debug, Clone, PartialEq)]
pub enum LoadState<T> {
    Idle,
    Loading,
    Loaded(T),
    Failed(String),
}

#[derive(Debug)]
pub struct Drilldown<T> {
    state: LoadState<T>,
    generation: u64,
    busy_rows: BTreeSet<usize>,
    row_errors: Vec<(usize, String)>,
}

impl<T> Default for Drilldown<T> {
    fn default() -> Self {
        Self {
            state: LoadState::Idle,
            generation: 0,
            busy_rows: BTreeSet::new(),
            row_errors: Vec::new(),
        }
    }
}

impl<T> Drilldown<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &LoadState<T> {
        &self.state
    }

    pub fn data(&self) -> Option<&T> {
        match &self.state {
            LoadState::Loaded(data) => Some(data),
            _ => None,
        }
    }

    pub fn data_mut(&mut self) -> Option<&mut T> {
        match &mut self.state {
            LoadState::Loaded(data) => Some(data),
            _ => None,
        }
    }

    /// Start a fetch, also used for manual refresh. Previous data, errors and
    /// row activity are discarded.
    pub fn open(&mut self) -> Ticket {
        self.generation += 1;
        self.state = LoadState::Loading;
        self.busy_rows.clear();
        self.row_errors.clear();
        Ticket(self.generation)
    }

    /// Back to idle; any response still in flight will be ignored.
    pub fn close(&mut self) {
        self.generation += 1;
        self.state = LoadState::Idle;
        self.busy_rows.clear();
        self.row_errors.clear();
    }

    /// Apply a fetch result. Returns false (and changes nothing) if the
    /// ticket is stale.
    pub fn commit<E: ToString>(&mut self, ticket: Ticket, result: Result<T, E>) -> bool {
        if ticket.0 != self.generation {
            return false;
        }
        self.state = match result {
            Ok(data) => LoadState::Loaded(data),
            Err(e) => LoadState::Failed(e.to_string()),
        };
        true
    }

    // -- row-scoped secondary fetches -------------------------------------

    /// Mark a row busy. Returns `None` if that row already has a fetch running.
    pub fn begin_row(&mut self, row: usize) -> Option<RowTicket> {
        if !self.busy_rows.insert(row) {
            return None;
        }
        self.row_errors.retain(|(r, _)| *r != row);
        Some(RowTicket {
            row,
            ticket: Ticket(self.generation),
        })
    }

    /// Finish a row fetch. Stale row tickets (view reopened since) are ignored.
    pub fn finish_row(&mut self, ticket: RowTicket, error: Option<String>) -> bool {
        if ticket.ticket.0 != self.generation {
            return false;
        }
        self.busy_rows.remove(&ticket.row);
        if let Some(msg) = error {
            self.row_errors.push((ticket.row, msg));
        }
        true
    }

    pub fn is_row_busy(&self, row: usize) -> bool {
        self.busy_rows.contains(&row)
    }

    pub fn row_error(&self, row: usize) -> Option<&str> {
        self.row_errors
            .iter()
            .rev()
            .find(|(r, _)| *r == row)
            .map(|(_, m)| m.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowTicket {
    pub row: usize,
    ticket: Ticket,
}

/// Which groups/rows of a tree view are expanded. Rebuilt on every open.
#[derive(Debug, Clone, Default)]
pub struct Expanded {
    keys: BTreeSet<String>,
}

impl Expanded {
    pub fn toggle(&mut self, key: &str) -> bool {
        if !self.keys.remove(key) {
            self.keys.insert(key.to_string());
            true
        } else {
            false
        }
    }

    pub fn is_expanded(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }
}
