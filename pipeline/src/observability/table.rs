//! Plain-text tables for end-of-invocation log summaries.

use std::time::Duration;

/// A titled table rendered with `|` borders, one column width per column.
#[derive(Debug, Clone, Default)]
pub struct Table {
    title: String,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(title: impl Into<String>, headers: &[&str]) -> Self {
        Self {
            title: title.into(),
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn row<I, S>(&mut self, cells: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.rows
            .push(cells.into_iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn column_widths(&self) -> Vec<usize> {
        let columns = self
            .rows
            .iter()
            .map(Vec::len)
            .max()
            .unwrap_or(0)
            .max(self.headers.len());

        (0..columns)
            .map(|i| {
                std::iter::once(&self.headers)
                    .chain(self.rows.iter())
                    .filter_map(|row| row.get(i))
                    .map(|cell| cell.chars().count())
                    .max()
                    .unwrap_or(0)
            })
            .collect()
    }

    fn line(cells: &[String], widths: &[usize]) -> String {
        let padded: Vec<String> = widths
            .iter()
            .enumerate()
            .map(|(i, width)| {
                let cell = cells.get(i).map(String::as_str).unwrap_or("");
                format!("{:width$}", cell, width = width)
            })
            .collect();
        format!("| {} |\n", padded.join(" | "))
    }

    pub fn render(&self) -> String {
        if self.rows.is_empty() {
            return String::new();
        }

        let mut widths = self.column_widths();
        let table_width = widths.iter().sum::<usize>() + (widths.len().saturating_sub(1)) * 3;
        let inner_width = table_width.max(self.title.chars().count());
        // Title wider than the columns: the last column absorbs the difference
        if let Some(last) = widths.last_mut() {
            *last += inner_width - table_width;
        }

        let mut out = String::new();
        out.push_str(&format!(" {} \n", "=".repeat(inner_width + 2)));
        out.push_str(&format!("| {:<inner_width$} |\n", self.title));
        out.push_str(&format!("|-{}-|\n", "-".repeat(inner_width)));

        if !self.headers.is_empty() {
            out.push_str(&Self::line(&self.headers, &widths));
            let separator: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
            out.push_str(&format!("|-{}-|\n", separator.join("-|-")));
        }
        for row in &self.rows {
            out.push_str(&Self::line(row, &widths));
        }
        out.push_str(&format!(" {} \n", "-".repeat(inner_width + 2)));
        out
    }
}

/// "Xm Ys" above a minute, "Y.Zs" below.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", elapsed.as_secs_f64())
    }
}
