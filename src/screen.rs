//! Text rendering of the emoji screen

use app_state::EmojiReleaseUiState;
use std::fmt::Write;

/// Title shown in the top bar
pub const TITLE: &str = "Emoji Release";

/// Emojis shown on the screen, in display order
pub const EMOJIS: &[&str] = &[
    "😀", "😂", "🥰", "😎", "🤔", "😴", "🥳", "😭", "🤯", "🙃", "😇", "🤖",
];

/// Number of columns in the grid layout
pub const GRID_COLUMNS: usize = 3;

/// A command typed by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Switch between linear and grid layout
    ToggleLayout,
    /// Switch between light and dark theme
    ToggleTheme,
    /// Click the emoji at this index
    Click(usize),
    /// Leave the application
    Quit,
}

impl Command {
    /// Parse one line of input
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "l" => Some(Command::ToggleLayout),
            "t" => Some(Command::ToggleTheme),
            "q" => Some(Command::Quit),
            other => other.parse().ok().map(Command::Click),
        }
    }
}

/// Message shown when an emoji is clicked
pub fn describe(index: usize) -> Option<String> {
    EMOJIS.get(index).map(|emoji| format!("This is {emoji}"))
}

/// Render the whole screen for a UI state
pub fn render(state: &EmojiReleaseUiState) -> String {
    let mut out = String::new();
    let switch = if state.is_dark_theme { "[dark ●]" } else { "[○ light]" };

    let _ = writeln!(
        out,
        "{TITLE}    {} ({})    {switch}",
        state.toggle_icon().glyph(),
        state.toggle_content_description(),
    );
    let _ = writeln!(out, "{}", "─".repeat(40));

    let columns = if state.is_linear_layout { 1 } else { GRID_COLUMNS };
    for (row, chunk) in EMOJIS.chunks(columns).enumerate() {
        let cells: Vec<String> = chunk
            .iter()
            .enumerate()
            .map(|(col, emoji)| format!("{:>2}: {emoji}", row * columns + col))
            .collect();
        let _ = writeln!(out, "{}", cells.join("    "));
    }

    out
}
