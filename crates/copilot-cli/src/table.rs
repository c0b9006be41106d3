//! Box-drawing table for `node list`.

use colored::Colorize;

/// Collects headers and rows, then renders with Unicode borders.
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: &[&str]) -> Self {
        Self {
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    /// Add a row. Extra cells are dropped; missing cells are empty.
    pub fn add_row(&mut self, cells: &[&str]) {
        let row = (0..self.headers.len())
            .map(|i| cells.get(i).copied().unwrap_or("").to_string())
            .collect();
        self.rows.push(row);
    }

    fn widths(&self) -> Vec<usize> {
        let mut widths: Vec<usize> = self.headers.iter().map(|h| h.chars().count()).collect();
        for row in &self.rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.chars().count());
            }
        }
        widths
    }

    fn border(widths: &[usize], left: &str, mid: &str, right: &str) -> String {
        let segments: Vec<String> = widths.iter().map(|w| "\u{2500}".repeat(w + 2)).collect();
        format!("{left}{}{right}", segments.join(mid))
    }

    fn line(cells: impl Iterator<Item = String>) -> String {
        let cells: Vec<String> = cells.collect();
        format!("\u{2502}{}\u{2502}", cells.join("\u{2502}"))
    }

    pub fn render(&self) -> String {
        let widths = self.widths();
        let pad = |text: &str, width: usize| {
            format!("{text}{}", " ".repeat(width - text.chars().count()))
        };

        let mut lines = vec![Self::border(&widths, "\u{250c}", "\u{252c}", "\u{2510}")];
        lines.push(Self::line(
            self.headers
                .iter()
                .zip(&widths)
                .map(|(h, w)| format!(" {} ", pad(h, *w).bold())),
        ));
        lines.push(Self::border(&widths, "\u{251c}", "\u{253c}", "\u{2524}"));
        for row in &self.rows {
            lines.push(Self::line(
                row.iter().zip(&widths).map(|(c, w)| format!(" {} ", pad(c, *w))),
            ));
        }
        lines.push(Self::border(&widths, "\u{2514}", "\u{2534}", "\u{2518}"));
        lines.join("\n")
    }

    pub fn print(&self) {
        println!("{}", self.render());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_layout() {
        colored::control::set_override(false);
        let mut t = Table::new(&["Name", "Type"]);
        t.add_row(&["hub", "server"]);
        t.add_row(&["edge-one", "client", "ignored"]);

        let rendered = t.render();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 6);
        assert!(lines[0].starts_with('\u{250c}'));
        assert!(lines[5].ends_with('\u{2518}'));
        assert_eq!(lines[1], "\u{2502} Name     \u{2502} Type   \u{2502}");
        assert_eq!(lines[4], "\u{2502} edge-one \u{2502} client \u{2502}");
        assert!(!rendered.contains("ignored"));
    }

    #[test]
    fn test_missing_cells_are_blank() {
        colored::control::set_override(false);
        let mut t = Table::new(&["A", "B"]);
        t.add_row(&["x"]);
        let rendered = t.render();
        assert!(rendered.lines().nth(3).unwrap().contains("\u{2502} x \u{2502}   \u{2502}"));
    }
}
