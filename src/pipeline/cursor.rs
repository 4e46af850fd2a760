//! Per-line read cursor into a raw-data table

use super::config::CursorStrategy;
use serde::Serialize;

/// Read position of one line
///
/// `offset` counts rows fetched since the last reset; `watermark` is the
/// identity (`idx`) of the last fetched row. Both go back to 0 only when a
/// fetch at the current position finds nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LineCursor {
    strategy: CursorStrategy,
    offset: u64,
    watermark: i64,
}

/// What the source should query for the next row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorPosition {
    Offset(u64),
    After(i64),
}

impl LineCursor {
    pub fn new(strategy: CursorStrategy) -> Self {
        Self {
            strategy,
            offset: 0,
            watermark: 0,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn watermark(&self) -> i64 {
        self.watermark
    }

    pub fn strategy(&self) -> CursorStrategy {
        self.strategy
    }

    pub fn position(&self) -> CursorPosition {
        match self.strategy {
            CursorStrategy::Offset => CursorPosition::Offset(self.offset),
            CursorStrategy::Watermark => CursorPosition::After(self.watermark),
        }
    }

    /// Record one fetched row; never moves by more than one row
    pub fn advance(&mut self, idx: i64) {
        self.offset += 1;
        self.watermark = self.watermark.max(idx);
    }

    /// Source exhausted at the current position
    pub fn reset(&mut self) {
        self.offset = 0;
        self.watermark = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_cursor() {
        let mut cursor = LineCursor::new(CursorStrategy::Offset);
        assert_eq!(cursor.position(), CursorPosition::Offset(0));

        cursor.advance(10);
        cursor.advance(11);
        assert_eq!(cursor.offset(), 2);
        assert_eq!(cursor.position(), CursorPosition::Offset(2));

        cursor.reset();
        assert_eq!(cursor.offset(), 0);
        assert_eq!(cursor.watermark(), 0);
    }

    #[test]
    fn test_watermark_cursor_tracks_idx() {
        let mut cursor = LineCursor::new(CursorStrategy::Watermark);
        assert_eq!(cursor.position(), CursorPosition::After(0));

        cursor.advance(3);
        cursor.advance(9);
        assert_eq!(cursor.position(), CursorPosition::After(9));
        assert_eq!(cursor.offset(), 2);
    }
}
