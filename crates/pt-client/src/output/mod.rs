//! Output formatting utilities for the CLI
//!
//! Tables for presence queries and colored status messages. Status
//! messages go to stderr when they could interleave with terminal output.

use tabled::{settings::Style, Table, Tabled};

/// Format presence results as an ASCII table
///
/// # Arguments
/// * `peers` - Peer IDs in query order
/// * `online` - Presence flag per peer, same order
pub fn format_presence(peers: &[String], online: &[bool]) -> String {
    if peers.is_empty() {
        return "No peers queried".to_string();
    }

    #[derive(Tabled)]
    struct PresenceRow {
        #[tabled(rename = "PEER")]
        peer: String,
        #[tabled(rename = "STATUS")]
        status: &'static str,
    }

    let rows: Vec<PresenceRow> = peers
        .iter()
        .zip(online.iter().copied().chain(std::iter::repeat(false)))
        .map(|(peer, online)| PresenceRow {
            peer: truncate(peer, 32),
            status: if online { "online" } else { "offline" },
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

/// Truncate a string with ellipsis if too long
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Print a success message in green with a checkmark prefix
pub fn print_success(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message in red with an X prefix
///
/// Outputs to stderr with red coloring for error feedback to the user.
pub fn print_error(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning message in yellow with a warning symbol prefix
pub fn print_warning(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Yellow),
        Print("⚠ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an informational message in cyan with an info symbol prefix
pub fn print_info(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Cyan),
        Print("ℹ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}
