//! Terminal output helpers: the source-statistics table, compiler
//! diagnostic coloring, and RAM/ROM usage bars.

use colored::Colorize;
use regex::Regex;
use std::cmp;
use std::sync::OnceLock;

/// Small box-drawing table for build statistics.
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: &[&str]) -> Self {
        Table {
            headers: headers.iter().map(|s| s.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn add_row(&mut self, row: Vec<String>) {
        if row.len() == self.headers.len() {
            self.rows.push(row);
        }
    }

    pub fn print(&self) {
        if self.headers.is_empty() {
            return;
        }

        let mut widths: Vec<usize> = self
            .headers
            .iter()
            .map(|h| h.chars().count())
            .collect();
        for row in &self.rows {
            for (i, cell) in row.iter().enumerate() {
                widths[i] = cmp::max(widths[i], cell.chars().count());
            }
        }

        // clamp to the terminal so long cells cannot wrap the frame
        let term_width = console::Term::stdout().size().1 as usize;
        let overhead = 3 + 3 * widths.len();
        while widths.iter().sum::<usize>() + overhead > term_width {
            match widths.iter_mut().max().filter(|w| **w > 8) {
                Some(widest) => *widest -= 1,
                None => break,
            }
        }

        let frame = |left: &str, mid: &str, right: &str| {
            let mut line = format!("  {}", left);
            for (i, width) in widths.iter().enumerate() {
                line.push_str(&"─".repeat(width + 2));
                line.push_str(if i + 1 < widths.len() { mid } else { right });
            }
            line
        };

        println!("{}", frame("┌", "┬", "┐"));
        print!("  │");
        for (header, width) in self.headers.iter().zip(&widths) {
            let text = console::truncate_str(header, *width, "...");
            let pad = width.saturating_sub(text.chars().count());
            print!(" {}{} │", text.bold(), " ".repeat(pad));
        }
        println!();
        println!("{}", frame("├", "┼", "┤"));
        for row in &self.rows {
            print!("  │");
            for (cell, width) in row.iter().zip(&widths) {
                let text = console::truncate_str(cell, *width, "...");
                let pad = width.saturating_sub(text.chars().count());
                print!(" {}{} │", text, " ".repeat(pad));
            }
            println!();
        }
        println!("{}", frame("└", "┴", "┘"));
    }
}

struct DiagnosticMatchers {
    error: Regex,
    warning: Regex,
    note: Regex,
    caret: Regex,
}

fn matchers() -> &'static DiagnosticMatchers {
    static MATCHERS: OnceLock<DiagnosticMatchers> = OnceLock::new();
    MATCHERS.get_or_init(|| DiagnosticMatchers {
        error: Regex::new(r"(?i)\b(error|fatal error)\b\s*(:|#?\d)").unwrap(),
        warning: Regex::new(r"(?i)\bwarning\b\s*(:|#?\d)").unwrap(),
        note: Regex::new(r"(?i)\b(note|info|remark)\b\s*:").unwrap(),
        caret: Regex::new(r"^\s*[\^~|]+\s*$").unwrap(),
    })
}

/// Color compiler output line by line: errors red, warnings yellow, notes
/// cyan, source carets dimmed. Unrecognized lines pass through unchanged.
pub fn colorize_diagnostics(text: &str) -> String {
    let m = matchers();
    text.lines()
        .map(|line| {
            if m.error.is_match(line) {
                line.red().to_string()
            } else if m.warning.is_match(line) {
                line.yellow().to_string()
            } else if m.note.is_match(line) {
                line.cyan().to_string()
            } else if m.caret.is_match(line) {
                line.dimmed().to_string()
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Ten-segment usage bar: `[████████░░] 80.0% RAM (2048/2560 B)`.
/// Green below 80%, yellow below 95%, red at and above.
pub fn usage_bar(label: &str, used: u64, budget: u64) -> String {
    if budget == 0 {
        return format!("{}: {} B (no budget configured)", label, used);
    }
    let ratio = used as f64 / budget as f64;
    let filled = cmp::min((ratio * 10.0).round() as usize, 10);
    let bar = format!("{}{}", "█".repeat(filled), "░".repeat(10 - filled));
    let percent = format!("{:.1}%", ratio * 100.0);

    let colored_bar = if ratio >= 0.95 {
        bar.red().to_string()
    } else if ratio >= 0.80 {
        bar.yellow().to_string()
    } else {
        bar.green().to_string()
    };

    format!("[{}] {} {} ({}/{} B)", colored_bar, percent, label, used, budget)
}
