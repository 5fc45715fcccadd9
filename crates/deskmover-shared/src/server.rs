//! Worker side of the protocol
//!
//! [`Server::run`] waits for `command-ready`, dispatches the shared message
//! against a [`Desktop`], writes the results in place and signals
//! `response-ready`. Per-item failures go into the message's error fields and
//! never abort a request.

use crate::channel::Channel;
use crate::logging::LogFile;
use crate::messages::{Command, IconPosition, Message, MoveMode};
use crate::{MAX_ITEMS, Result};
use tracing::{debug, info, warn};

/// Arrangement styles of the desktop list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrangementFlag {
    /// Items are laid out automatically
    AutoArrange,
    /// Items snap to the icon grid when placed
    SnapToGrid,
}

/// Desktop operations the server dispatches to
///
/// The Win32 implementation lives in the worker module; tests use
/// [`MemoryDesktop`](crate::MemoryDesktop).
pub trait Desktop {
    /// Handle to the list holding the desktop items
    type Surface: Copy;

    /// Locate the desktop item list
    fn find_surface(&mut self) -> Option<Self::Surface>;

    /// Number of items on the surface
    fn item_count(&self, surface: Self::Surface) -> usize;

    /// Display name of the item at `index`
    fn item_name(&self, surface: Self::Surface, index: usize) -> Option<String>;

    /// Position of the item at `index`
    fn item_position(&self, surface: Self::Surface, index: usize) -> Option<(i32, i32)>;

    /// Move the item at `index`
    fn set_item_position(
        &mut self,
        surface: Self::Surface,
        index: usize,
        x: i32,
        y: i32,
    ) -> Result<()>;

    /// Screen extent in pixels, used for ratio moves
    fn screen_size(&self) -> (i32, i32);

    /// DPI of the surface
    fn dpi(&self, _surface: Self::Surface) -> u32 {
        96
    }

    /// Ask the shell to redraw the desktop
    fn refresh(&mut self) -> Result<()>;

    /// Simulate the show-desktop gesture
    fn show_desktop(&mut self) -> Result<()>;

    /// Turn an arrangement style on or off
    fn set_arrangement(
        &mut self,
        surface: Self::Surface,
        flag: ArrangementFlag,
        enabled: bool,
    ) -> Result<()>;

    /// Items `[start, start + max)`, clamped to the item count
    fn enumerate_items(
        &self,
        surface: Self::Surface,
        start: usize,
        max: usize,
    ) -> Vec<IconPosition> {
        let end = self.item_count(surface).min(start.saturating_add(max));
        (start..end)
            .map(|i| {
                let name = self.item_name(surface, i).unwrap_or_default();
                let (x, y) = self.item_position(surface, i).unwrap_or((0, 0));
                IconPosition::new(name, x, y)
            })
            .collect()
    }

    /// Index of the item called `name`, see [`match_item_name`]
    fn find_item(&self, surface: Self::Surface, name: &str) -> Option<usize> {
        let names: Vec<String> = (0..self.item_count(surface))
            .map(|i| self.item_name(surface, i).unwrap_or_default())
            .collect();
        match_item_name(&names, name)
    }
}

/// Find `wanted` in `names`
///
/// Exact match first, then case-insensitive, then case-insensitive with a
/// trailing `.lnk` ignored on both sides.
pub fn match_item_name(names: &[String], wanted: &str) -> Option<usize> {
    if let Some(i) = names.iter().position(|n| n == wanted) {
        return Some(i);
    }

    let lower = wanted.to_lowercase();
    if let Some(i) = names.iter().position(|n| n.to_lowercase() == lower) {
        return Some(i);
    }

    let stem = strip_link_suffix(&lower);
    names
        .iter()
        .position(|n| strip_link_suffix(&n.to_lowercase()) == stem)
}

fn strip_link_suffix(name: &str) -> &str {
    name.strip_suffix(".lnk").unwrap_or(name)
}

/// Convert a per-mille value to pixels of `extent`
///
/// Values are clamped to `0..=1000`.
pub fn ratio_to_pixels(per_mille: i32, extent: i32) -> i32 {
    (i64::from(extent) * i64::from(per_mille.clamp(0, 1000)) / 1000) as i32
}

/// Scale a 96-DPI coordinate to the surface DPI, saturating at the `i32` range
pub fn scale_for_dpi(value: i32, dpi: u32) -> i32 {
    let scaled = i64::from(value) * i64::from(dpi) / 96;
    scaled.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// How the server loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerExit {
    /// Unload in order from the server thread
    Normal,
    /// Unload from a detached thread
    Forced,
    /// End the host process
    HardKill,
}

impl ServerExit {
    /// Command that requests this exit
    pub fn command(self) -> Command {
        match self {
            ServerExit::Normal => Command::Exit,
            ServerExit::Forced => Command::ForcedExit,
            ServerExit::HardKill => Command::HardKill,
        }
    }
}

/// Command loop running inside the host
pub struct Server<C, D> {
    channel: C,
    desktop: D,
    log: Option<LogFile>,
}

impl<C: Channel, D: Desktop> Server<C, D> {
    /// Create a server over an opened channel
    pub fn new(channel: C, desktop: D) -> Self {
        Self {
            channel,
            desktop,
            log: None,
        }
    }

    /// Log file truncated by [`Command::ClearLog`]
    pub fn with_log_file(mut self, log: LogFile) -> Self {
        self.log = Some(log);
        self
    }

    /// Serve commands until an exit command arrives
    ///
    /// `response-ready` is signaled once on entry so the first client does
    /// not wait for a reply that was never promised, then once after every
    /// dispatch, exit commands included.
    pub fn run(&mut self) -> Result<ServerExit> {
        info!("server ready");
        self.channel.signal_response()?;

        loop {
            if !self.channel.wait_command(None)? {
                continue;
            }

            let Self {
                channel,
                desktop,
                log,
            } = self;
            let exit = channel.with_shared(|msg| dispatch(desktop, log.as_ref(), msg));

            self.channel.signal_response()?;

            if let Some(exit) = exit {
                info!(?exit, "server stopping");
                return Ok(exit);
            }
        }
    }
}

/// Execute one message in place
///
/// Returns the exit kind for exit commands. Unknown command values are
/// answered with a clean status.
pub fn dispatch<D: Desktop>(
    desktop: &mut D,
    log: Option<&LogFile>,
    msg: &mut Message,
) -> Option<ServerExit> {
    msg.clear_status();

    let Some(command) = msg.command() else {
        debug!(raw = msg.command, "ignoring unknown command");
        return None;
    };

    debug!(?command, count = msg.count, cursor = msg.batch_cursor, "dispatch");

    match command {
        Command::Probe => {}
        Command::Move => move_items(desktop, msg, MoveMode::Pixels),
        Command::MoveByRatio => move_items(desktop, msg, MoveMode::Ratio),
        Command::Enumerate => enumerate(desktop, msg),
        Command::Count => match desktop.find_surface() {
            Some(surface) => msg.set_total(desktop.item_count(surface)),
            None => {
                msg.count = 0;
                msg.record_error("desktop list not found");
            }
        },
        Command::Refresh => {
            if let Err(e) = desktop.refresh() {
                msg.record_error(&e.to_string());
            }
        }
        Command::ShowDesktop => {
            if let Err(e) = desktop.show_desktop() {
                msg.record_error(&e.to_string());
            }
        }
        Command::DisableSnapToGrid => disable(desktop, msg, ArrangementFlag::SnapToGrid),
        Command::DisableAutoArrange => disable(desktop, msg, ArrangementFlag::AutoArrange),
        Command::ClearLog => {
            if let Some(log) = log
                && let Err(e) = log.clear()
            {
                msg.record_error(&e.to_string());
            }
        }
        Command::Exit => return Some(ServerExit::Normal),
        Command::ForcedExit => return Some(ServerExit::Forced),
        Command::HardKill => return Some(ServerExit::HardKill),
    }

    if msg.error_count > 0 {
        warn!(
            ?command,
            errors = msg.error_count,
            last = %msg.error_message(),
            "command finished with errors"
        );
    }
    None
}

fn move_items<D: Desktop>(desktop: &mut D, msg: &mut Message, mode: MoveMode) {
    let requested = msg.positions();

    let Some(surface) = desktop.find_surface() else {
        msg.record_errors(requested.len() as u32, "desktop list not found");
        return;
    };

    let (screen_x, screen_y) = desktop.screen_size();
    let dpi = desktop.dpi(surface);

    for item in &requested {
        if item.name.is_empty() || item.x < 0 || item.y < 0 {
            msg.record_error(&format!(
                "invalid item '{}' at ({}, {})",
                item.name, item.x, item.y
            ));
            continue;
        }

        let Some(index) = desktop.find_item(surface, &item.name) else {
            msg.record_error(&format!("item not found: {}", item.name));
            continue;
        };

        let (x, y) = match mode {
            MoveMode::Pixels => (item.x, item.y),
            MoveMode::Ratio => (
                ratio_to_pixels(item.x, screen_x),
                ratio_to_pixels(item.y, screen_y),
            ),
        };
        let (x, y) = (scale_for_dpi(x, dpi), scale_for_dpi(y, dpi));

        match desktop.set_item_position(surface, index, x, y) {
            Ok(()) => debug!(name = %item.name, index, x, y, "moved"),
            Err(e) => msg.record_error(&format!("{}: {e}", item.name)),
        }
    }
}

fn enumerate<D: Desktop>(desktop: &mut D, msg: &mut Message) {
    let start = msg.batch_cursor as usize;
    let wanted = msg.len().min(MAX_ITEMS);

    let Some(surface) = desktop.find_surface() else {
        msg.set_len(0);
        msg.record_error("desktop list not found");
        return;
    };

    let page = desktop.enumerate_items(surface, start, wanted);
    msg.set_items(&page);
}

fn disable<D: Desktop>(desktop: &mut D, msg: &mut Message, flag: ArrangementFlag) {
    match desktop.find_surface() {
        Some(surface) => {
            if let Err(e) = desktop.set_arrangement(surface, flag, false) {
                msg.record_error(&e.to_string());
            }
        }
        None => msg.record_error("desktop list not found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::{LocalChannel, MemoryDesktop};
    use crate::messages::INVALID_COMMAND;
    use std::time::Duration;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_match_exact_wins() {
        let list = names(&["readme", "Readme", "readme.lnk"]);
        assert_eq!(match_item_name(&list, "Readme"), Some(1));
    }

    #[test]
    fn test_match_case_insensitive() {
        let list = names(&["Recycle Bin", "Notes"]);
        assert_eq!(match_item_name(&list, "recycle bin"), Some(0));
    }

    #[test]
    fn test_match_link_suffix() {
        let list = names(&["Editor.lnk", "Notes"]);
        assert_eq!(match_item_name(&list, "editor"), Some(0));
        let list = names(&["Editor", "Notes"]);
        assert_eq!(match_item_name(&list, "Editor.LNK"), Some(0));
        assert_eq!(match_item_name(&list, "Missing"), None);
    }

    #[test]
    fn test_ratio_to_pixels() {
        assert_eq!(ratio_to_pixels(500, 1920), 960);
        assert_eq!(ratio_to_pixels(0, 1920), 0);
        assert_eq!(ratio_to_pixels(1000, 1080), 1080);
        assert_eq!(ratio_to_pixels(1500, 1080), 1080);
        assert_eq!(ratio_to_pixels(-5, 1080), 0);
    }

    #[test]
    fn test_scale_for_dpi() {
        assert_eq!(scale_for_dpi(100, 96), 100);
        assert_eq!(scale_for_dpi(100, 144), 150);
        assert_eq!(scale_for_dpi(2_000_000_000, 192), i32::MAX);
        assert_eq!(scale_for_dpi(-2_000_000_000, 192), i32::MIN);
    }

    #[test]
    fn test_dispatch_unknown_command_is_clean() {
        let mut desktop = MemoryDesktop::with_items(3);
        let mut msg = Message::boxed(Command::Probe);
        msg.command = 4242;
        msg.error_count = 9;
        assert_eq!(dispatch(&mut desktop, None, &mut msg), None);
        assert_eq!(msg.error_count, 0);

        msg.command = INVALID_COMMAND;
        assert_eq!(dispatch(&mut desktop, None, &mut msg), None);
        assert_eq!(msg.error_count, 0);
    }

    #[test]
    fn test_dispatch_move_counts_each_failure() {
        let mut desktop = MemoryDesktop::with_items(2);
        let mut msg = Message::boxed(Command::Move);
        msg.set_items(&[
            IconPosition::new("item0", 10, 20),
            IconPosition::new("nope", 1, 1),
            IconPosition::new("", 1, 1),
            IconPosition::new("item1", -1, 5),
            IconPosition::new("ITEM1", 30, 40),
        ]);

        dispatch(&mut desktop, None, &mut msg);

        assert_eq!(msg.error_count, 3);
        assert_eq!(desktop.position("item0"), Some((10, 20)));
        assert_eq!(desktop.position("item1"), Some((30, 40)));
    }

    #[test]
    fn test_dispatch_move_by_ratio_with_dpi() {
        let mut desktop = MemoryDesktop::with_items(1);
        desktop.set_screen(2000, 1000);
        desktop.set_dpi(192);
        let mut msg = Message::boxed(Command::MoveByRatio);
        msg.set_items(&[IconPosition::new("item0", 250, 500)]);

        dispatch(&mut desktop, None, &mut msg);

        assert_eq!(msg.error_count, 0);
        assert_eq!(desktop.position("item0"), Some((1000, 1000)));
    }

    #[test]
    fn test_dispatch_without_surface() {
        let mut desktop = MemoryDesktop::with_items(2);
        desktop.set_surface_present(false);

        let mut msg = Message::boxed(Command::Move);
        msg.set_items(&[
            IconPosition::new("item0", 1, 1),
            IconPosition::new("item1", 2, 2),
        ]);
        dispatch(&mut desktop, None, &mut msg);
        assert_eq!(msg.error_count, 2);

        let mut msg = Message::boxed(Command::Count);
        dispatch(&mut desktop, None, &mut msg);
        assert_eq!(msg.error_count, 1);
        assert_eq!(msg.count, 0);
    }

    #[test]
    fn test_dispatch_enumerate_page() {
        let mut desktop = MemoryDesktop::with_items(10);
        let mut msg = Message::boxed(Command::Enumerate);
        msg.batch_cursor = 8;
        msg.set_len(5);

        dispatch(&mut desktop, None, &mut msg);

        let page = msg.positions();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].name, "item8");
        assert_eq!(page[1].name, "item9");
    }

    #[test]
    fn test_dispatch_arrangement() {
        let mut desktop = MemoryDesktop::with_items(1);
        let mut msg = Message::boxed(Command::DisableAutoArrange);
        dispatch(&mut desktop, None, &mut msg);
        assert!(!desktop.arrangement(ArrangementFlag::AutoArrange));
        assert!(desktop.arrangement(ArrangementFlag::SnapToGrid));

        msg.set_command(Command::DisableSnapToGrid);
        dispatch(&mut desktop, None, &mut msg);
        assert!(!desktop.arrangement(ArrangementFlag::SnapToGrid));
    }

    #[test]
    fn test_dispatch_clear_log() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let log = LogFile::open(dir.path().join("worker.log")).unwrap();
        log.writer().write_all(b"old line\n").unwrap();

        let mut desktop = MemoryDesktop::with_items(0);
        let mut msg = Message::boxed(Command::ClearLog);
        dispatch(&mut desktop, Some(&log), &mut msg);

        assert_eq!(msg.error_count, 0);
        assert_eq!(std::fs::metadata(log.path()).unwrap().len(), 0);
    }

    #[test]
    fn test_dispatch_clear_log_while_logging_to_it() {
        use std::sync::mpsc;
        use tracing::Level;

        let dir = tempfile::tempdir().unwrap();
        let log = LogFile::open(dir.path().join("worker.log")).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        let worker_log = log.clone();
        std::thread::spawn(move || {
            let subscriber = tracing_subscriber::fmt()
                .with_max_level(Level::DEBUG)
                .with_writer(worker_log.clone())
                .with_ansi(false)
                .finish();
            tracing::subscriber::with_default(subscriber, || {
                let mut desktop = MemoryDesktop::with_items(0);
                let mut msg = Message::boxed(Command::ClearLog);
                dispatch(&mut desktop, Some(&worker_log), &mut msg);
                done_tx.send(msg.error_count).unwrap();
            });
        });

        let errors = done_rx
            .recv_timeout(Duration::from_secs(3))
            .expect("ClearLog dispatch did not return");
        assert_eq!(errors, 0);
        let text = std::fs::read_to_string(log.path()).unwrap();
        assert!(text.contains("log cleared"));
    }

    #[test]
    fn test_dispatch_exit_kinds() {
        let mut desktop = MemoryDesktop::with_items(0);
        for exit in [ServerExit::Normal, ServerExit::Forced, ServerExit::HardKill] {
            let mut msg = Message::boxed(exit.command());
            assert_eq!(dispatch(&mut desktop, None, &mut msg), Some(exit));
        }
    }

    #[test]
    fn test_server_survives_unknown_command() {
        let channel = LocalChannel::new();
        let server_channel = channel.clone();
        let server = std::thread::spawn(move || {
            Server::new(server_channel, MemoryDesktop::with_items(1)).run()
        });

        let wait = Duration::from_secs(5);
        assert!(channel.wait_response(wait).unwrap());

        channel.with_shared(|msg| {
            msg.command = 777;
            msg.error_count = 3;
        });
        channel.signal_command().unwrap();
        assert!(channel.wait_response(wait).unwrap());
        assert_eq!(channel.with_shared(|msg| msg.error_count), 0);

        // Still listening
        channel.with_shared(|msg| msg.set_command(Command::Exit));
        channel.signal_command().unwrap();
        assert!(channel.wait_response(wait).unwrap());

        assert_eq!(server.join().unwrap().unwrap(), ServerExit::Normal);
    }
}
