//! Terminal output.
//!
//! The console [`Reporter`] is the CLI's implementation of the engine's
//! collaborator callbacks: colored status glyphs, indented bullets,
//! verbose-only command echo, and an indicatif bar tracking the compile
//! progress milestones. A small box-drawing table serves the listing
//! commands.

use crate::context::Reporter;
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::cmp;

pub struct ConsoleReporter {
    bar: ProgressBar,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        let bar = ProgressBar::hidden();
        bar.set_length(100);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("   {bar:40.cyan/blue} {pos}%")
                .unwrap()
                .progress_chars("#>-"),
        );
        Self { bar, verbose }
    }
}

impl Reporter for ConsoleReporter {
    fn message(&self, text: &str) {
        self.bar.suspend(|| println!("{}", text));
    }

    fn warning(&self, text: &str) {
        self.bar.suspend(|| println!("{} {}", "!".yellow(), text));
    }

    fn error(&self, text: &str) {
        self.bar.suspend(|| eprintln!("{} {}", "x".red(), text));
    }

    fn heading(&self, text: &str) {
        self.bar.suspend(|| println!("{}", text.bold()));
    }

    fn bullet(&self, text: &str) {
        self.bar.suspend(|| println!("  {} {}", "•".cyan(), text));
    }

    fn bullet2(&self, text: &str) {
        self.bar.suspend(|| println!("    {} {}", "◦".cyan(), text));
    }

    fn bullet3(&self, text: &str) {
        self.bar.suspend(|| println!("      - {}", text));
    }

    fn command(&self, text: &str) {
        if self.verbose {
            self.bar.suspend(|| println!("   {} {}", "$".dimmed(), text.dimmed()));
        }
    }

    fn progress(&self, percent: u8) {
        if self.bar.is_hidden() && percent < 100 {
            self.bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        }
        self.bar.set_position(percent as u64);
        if percent >= 100 {
            self.bar.finish_and_clear();
        }
    }

    fn raw_output(&self, text: &str) {
        self.bar.suspend(|| print!("{}", text));
    }

    fn raw_error(&self, text: &str) {
        self.bar.suspend(|| eprint!("{}", text));
    }
}

/// Minimal auto-sizing table for `sx libs list` and friends.
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: &[&str]) -> Self {
        Self {
            headers: headers.iter().map(|s| s.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn add_row(&mut self, row: Vec<String>) {
        if row.len() == self.headers.len() {
            self.rows.push(row);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn print(&self) {
        let mut widths: Vec<usize> = self.headers.iter().map(|h| h.chars().count()).collect();
        for row in &self.rows {
            for (i, cell) in row.iter().enumerate() {
                widths[i] = cmp::max(widths[i], cell.chars().count());
            }
        }

        // Shrink the widest column until the table fits the terminal.
        let term_width = console::Term::stdout().size().1 as usize;
        let overhead = 3 * widths.len() + 1;
        while widths.iter().sum::<usize>() + overhead > term_width {
            let Some((idx, _)) = widths
                .iter()
                .enumerate()
                .max_by_key(|(_, w)| **w)
                .filter(|(_, w)| **w > 8)
            else {
                break;
            };
            widths[idx] -= 1;
        }

        let sep = |l: &str, m: &str, r: &str| {
            let mut s = String::from(l);
            for (i, w) in widths.iter().enumerate() {
                s.push_str(&"─".repeat(w + 2));
                s.push_str(if i + 1 < widths.len() { m } else { r });
            }
            s
        };

        println!("{}", sep("┌", "┬", "┐"));
        print!("│");
        for (i, header) in self.headers.iter().enumerate() {
            let pad = widths[i].saturating_sub(header.chars().count());
            print!(" {}{} │", header.bold(), " ".repeat(pad));
        }
        println!();
        println!("{}", sep("├", "┼", "┤"));
        for row in &self.rows {
            print!("│");
            for (i, cell) in row.iter().enumerate() {
                let shown = truncate(cell, widths[i]);
                print!(" {:w$} │", shown, w = widths[i]);
            }
            println!();
        }
        println!("{}", sep("└", "┴", "┘"));
    }
}

fn truncate(s: &str, max_width: usize) -> String {
    if s.chars().count() <= max_width {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_width.saturating_sub(3)).collect();
    out.push_str("...");
    out
}
