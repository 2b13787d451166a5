//! Terminal dimensions

use serde::{Deserialize, Serialize};

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Number of columns
    pub cols: u16,
    /// Number of rows
    pub rows: u16,
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Default terminal size (80x24)
    pub fn default_size() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::default_size()
    }
}
