//! Headless block views used by the document renderer.
//!
//! They hold the layout state a real widget would compute, which is exactly the state that makes
//! reuse worthwhile.

use std::any::Any;
use std::sync::Arc;

use crate::cache::{ImageSlot, MeasurementCache, PooledView, hash_value};

const CHAR_WIDTH: f64 = 7.5;
const LINE_HEIGHT: f64 = 18.0;
const CELL_PADDING: f64 = 12.0;

/// Unconstrained size of `text`: longest line by line count.
pub fn intrinsic_size(text: &str) -> (f64, f64) {
    let lines = text.lines().count().max(1);
    let longest = text.lines().map(|line| line.chars().count()).max().unwrap_or(0);
    (longest as f64 * CHAR_WIDTH, lines as f64 * LINE_HEIGHT)
}

/// Height of `text` wrapped to `width`.
pub fn wrapped_height(text: &str, width: f64) -> f64 {
    let per_line = ((width / CHAR_WIDTH).floor() as usize).max(1);
    let lines: usize = text
        .lines()
        .map(|line| line.chars().count().div_ceil(per_line).max(1))
        .sum();
    lines.max(1) as f64 * LINE_HEIGHT
}

#[derive(Debug, Default)]
pub struct CodeBlockView {
    pub language: Option<String>,
    pub line_count: usize,
    pub highlighted: bool,
    pub configured: u32,
}

impl CodeBlockView {
    pub fn configure(&mut self, code: &str, language: Option<&str>, highlighted: bool) {
        self.language = language.map(str::to_string);
        self.line_count = code.lines().count();
        self.highlighted = highlighted;
        self.configured += 1;
    }
}

impl PooledView for CodeBlockView {
    fn prepare_for_reuse(&mut self) {
        self.language = None;
        self.line_count = 0;
        self.highlighted = false;
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

#[derive(Debug, Default)]
pub struct TableView {
    pub column_widths: Vec<f64>,
    pub row_heights: Vec<f64>,
}

impl TableView {
    /// Lay the table out at `width`, consulting `measurements` for every cell.
    pub fn layout(&mut self, rows: &[Vec<String>], width: f64, measurements: &MeasurementCache) {
        let columns = rows.iter().map(Vec::len).max().unwrap_or(0);
        self.column_widths = vec![0.0; columns];
        self.row_heights = Vec::with_capacity(rows.len());
        if columns == 0 {
            return;
        }

        let hashes: Vec<Vec<u64>> = rows
            .iter()
            .map(|row| row.iter().map(|cell| hash_value(cell)).collect())
            .collect();

        for (row, row_hashes) in rows.iter().zip(&hashes) {
            for (column, (cell, hash)) in row.iter().zip(row_hashes).enumerate() {
                let (cell_width, _) = match measurements.intrinsic(*hash) {
                    Some(size) => size,
                    None => {
                        let (w, h) = intrinsic_size(cell);
                        measurements.store_intrinsic(*hash, w, h);
                        (w, h)
                    }
                };
                let padded = cell_width + CELL_PADDING;
                if padded > self.column_widths[column] {
                    self.column_widths[column] = padded;
                }
            }
        }

        let share = (width / columns as f64).max(CHAR_WIDTH + CELL_PADDING);
        for column_width in &mut self.column_widths {
            *column_width = column_width.min(share);
        }

        for (row, row_hashes) in rows.iter().zip(&hashes) {
            let mut row_height: f64 = 0.0;
            for (column, (cell, hash)) in row.iter().zip(row_hashes).enumerate() {
                let text_width = self.column_widths[column] - CELL_PADDING;
                let height = match measurements.constrained_height(*hash, text_width) {
                    Some(height) => height,
                    None => {
                        let height = wrapped_height(cell, text_width);
                        measurements.store_height(*hash, text_width, height);
                        height
                    }
                };
                row_height = row_height.max(height);
            }
            self.row_heights.push(row_height + CELL_PADDING);
        }
    }
}

impl PooledView for TableView {
    fn prepare_for_reuse(&mut self) {
        self.column_widths.clear();
        self.row_heights.clear();
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

#[derive(Debug, Default)]
pub struct QuoteView {
    pub height: f64,
}

impl QuoteView {
    pub fn configure(&mut self, text: &str, width: f64) {
        self.height = wrapped_height(text, width);
    }
}

impl PooledView for QuoteView {
    fn prepare_for_reuse(&mut self) {
        self.height = 0.0;
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

#[derive(Debug, Default)]
pub struct RuleView;

impl PooledView for RuleView {
    fn prepare_for_reuse(&mut self) {}

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

#[derive(Debug, Default)]
pub struct ImageView {
    pub source: Option<String>,
    pub slot: Arc<ImageSlot>,
}

impl PooledView for ImageView {
    fn prepare_for_reuse(&mut self) {
        self.source = None;
        self.slot.invalidate();
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MeasureConfig;

    #[test]
    fn text_metrics() {
        assert_eq!(intrinsic_size("abcd\nab"), (4.0 * CHAR_WIDTH, 2.0 * LINE_HEIGHT));
        assert_eq!(intrinsic_size(""), (0.0, LINE_HEIGHT));
        assert_eq!(wrapped_height("abcdefghij", CHAR_WIDTH * 4.0), 3.0 * LINE_HEIGHT);
    }

    #[test]
    fn second_layout_is_served_from_measurements() {
        let measurements = MeasurementCache::new(&MeasureConfig::default());
        let rows = vec![
            vec!["name".to_string(), "value".to_string()],
            vec!["a".to_string(), "a much longer cell".to_string()],
        ];

        let mut first = TableView::default();
        first.layout(&rows, 200.0, &measurements);
        let misses = measurements.stats().misses;

        let mut second = TableView::default();
        second.layout(&rows, 200.0, &measurements);

        assert_eq!(first.column_widths, second.column_widths);
        assert_eq!(first.row_heights, second.row_heights);
        assert_eq!(measurements.stats().misses, misses);
        assert!(second.column_widths.iter().all(|width| *width <= 100.0));
    }

    #[test]
    fn recycled_image_view_rejects_late_results() {
        let mut view = ImageView::default();
        let token = view.slot.begin();
        view.prepare_for_reuse();
        assert!(!view.slot.deliver(token, None));
    }
}
