// Terminal attachment layer for SI remote-control.
//
// A `Terminal` owns the pty master (or an already-open tty device) that the
// WebSocket bridge reads from and writes to. Bytes are forwarded raw in both
// directions; no escape-sequence interpretation happens on the server side.

mod discover;
mod terminal;
mod tmux;

pub use discover::{list_tty_candidates, TtyCandidate};
pub use terminal::{Terminal, TerminalMode};
pub use tmux::{attach_command, ensure_installed, list_sessions, TmuxSession};

/// Default pty geometry used until the first client reports its viewport.
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;
