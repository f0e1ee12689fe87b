use std::time::Duration;

use colored::Colorize;

/// Display utilities for the CLI interface
#[derive(Debug, Clone, Copy)]
pub struct DisplayHelper {
    pub use_color: bool,
}

impl DisplayHelper {
    pub fn new(use_color: bool) -> Self {
        Self { use_color }
    }

    pub fn success(&self, message: &str) {
        if self.use_color {
            println!("{} {}", "✓".green().bold(), message);
        } else {
            println!("[OK] {message}");
        }
    }

    pub fn error(&self, message: &str) {
        if self.use_color {
            eprintln!("{} {}", "✗".red().bold(), message);
        } else {
            eprintln!("[ERROR] {message}");
        }
    }

    pub fn warning(&self, message: &str) {
        if self.use_color {
            eprintln!("{} {}", "⚠".yellow().bold(), message);
        } else {
            eprintln!("[WARNING] {message}");
        }
    }

    pub fn info(&self, message: &str) {
        if self.use_color {
            println!("{} {}", "::".blue().bold(), message);
        } else {
            println!("[INFO] {message}");
        }
    }

    pub fn format_path(&self, path: &str) -> String {
        if self.use_color {
            path.cyan().to_string()
        } else {
            format!("'{path}'")
        }
    }

    pub fn format_repo(&self, repo: &str) -> String {
        if self.use_color {
            repo.cyan().bold().to_string()
        } else {
            repo.to_string()
        }
    }

    pub fn format_branch(&self, branch: &str) -> String {
        if self.use_color {
            branch.green().to_string()
        } else {
            branch.to_string()
        }
    }

    /// Lay out a header and rows in padded columns.
    pub fn table_lines(&self, headers: &[&str], rows: &[Vec<String>]) -> Vec<String> {
        let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
        for row in rows {
            for (i, cell) in row.iter().enumerate() {
                if let Some(width) = widths.get_mut(i) {
                    *width = (*width).max(cell.chars().count());
                }
            }
        }

        let join = |cells: Vec<String>| cells.join("  ").trim_end().to_string();
        let mut lines = Vec::with_capacity(rows.len() + 2);

        let header = join(
            headers
                .iter()
                .zip(&widths)
                .map(|(h, &w)| format!("{h:<w$}"))
                .collect(),
        );
        lines.push(if self.use_color {
            header.bold().to_string()
        } else {
            header
        });

        let rule = if self.use_color { "─" } else { "-" };
        lines.push(join(widths.iter().map(|&w| rule.repeat(w)).collect()));

        for row in rows {
            lines.push(join(
                row.iter()
                    .enumerate()
                    .map(|(i, cell)| {
                        let w = widths.get(i).copied().unwrap_or(0);
                        format!("{cell:<w$}")
                    })
                    .collect(),
            ));
        }
        lines
    }

    pub fn print_table(&self, headers: &[&str], rows: &[Vec<String>]) {
        if rows.is_empty() {
            return;
        }
        for line in self.table_lines(headers, rows) {
            println!("{line}");
        }
    }

    pub fn format_duration(&self, duration: Duration) -> String {
        let secs = duration.as_secs();
        let millis = duration.subsec_millis();

        if secs >= 60 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else if secs > 0 {
            format!("{}.{}s", secs, millis / 100)
        } else {
            format!("{millis}ms")
        }
    }
}

pub mod helpers {
    use super::*;

    /// Color only when stdout is a terminal and neither `--no-color` nor
    /// `NO_COLOR` asks otherwise. Also sets the global `colored` override so
    /// progress bar markers follow the same decision.
    pub fn auto_display(no_color: bool) -> DisplayHelper {
        let use_color =
            !no_color && atty::is(atty::Stream::Stdout) && std::env::var_os("NO_COLOR").is_none();
        if !use_color {
            colored::control::set_override(false);
        }
        DisplayHelper::new(use_color)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_table_lines_pad_columns() {
        let display = DisplayHelper::new(false);
        let lines = display.table_lines(
            &["path", "branch"],
            &[
                vec!["core".to_string(), "develop".to_string()],
                vec!["tools/cli".to_string(), "main".to_string()],
            ],
        );
        assert_eq!(
            lines,
            vec![
                "path       branch",
                "---------  -------",
                "core       develop",
                "tools/cli  main",
            ]
        );
    }

    #[test]
    fn test_format_duration() {
        let display = DisplayHelper::new(false);
        assert_eq!(display.format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(display.format_duration(Duration::from_millis(2500)), "2.5s");
        assert_eq!(display.format_duration(Duration::from_secs(125)), "2m 5s");
    }

    #[test]
    fn test_plain_formatting() {
        let display = DisplayHelper::new(false);
        assert_eq!(display.format_path("src/core"), "'src/core'");
        assert_eq!(display.format_repo("github.com/acme/core"), "github.com/acme/core");
    }
}
