//! Message layout shared by controller and worker
//!
//! One [`Message`] lives in the shared segment. Its layout is the wire
//! contract, so every field has a fixed width:
//! ```text
//! ┌──────────────────────────────┐
//! │ command: i32                 │  <- Command as raw integer, INVALID_COMMAND when unset
//! │ items: [WireItem; 256]       │  <- name: [u16; 256], x: i32, y: i32
//! │ count: i32                   │  <- request: items valid/wanted; response: items valid
//! │ batch_cursor: u32            │  <- start index for paged enumeration
//! │ error_count: u32             │  <- response only, 0 means success
//! │ error_message: [u16; 512]    │  <- response only, last error, NUL terminated
//! └──────────────────────────────┘
//! ```

use crate::{MAX_ERROR_LEN, MAX_ITEMS, MAX_NAME_LEN};
use std::alloc::{Layout, alloc_zeroed, handle_alloc_error};

/// Raw value of an unset command slot
pub const INVALID_COMMAND: i32 = i32::MIN;

/// Commands understood by the worker
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Terminate the whole host process
    HardKill = -114514,
    /// Stop the server and unload from a detached thread
    ForcedExit = -1,
    /// Stop the server and unload in order
    Exit = 0,
    /// Move named items to absolute pixel positions
    Move = 1,
    /// Move named items to per-mille fractions of the screen
    MoveByRatio = 2,
    /// Ask the shell to refresh the desktop
    Refresh = 3,
    /// Simulate the show-desktop gesture
    ShowDesktop = 4,
    /// Liveness probe, no side effects
    Probe = 5,
    /// Read a page of items starting at the batch cursor
    Enumerate = 6,
    /// Read the number of items on the desktop
    Count = 7,
    /// Turn off snap-to-grid on the desktop list
    DisableSnapToGrid = 8,
    /// Turn off auto-arrange on the desktop list
    DisableAutoArrange = 9,
    /// Truncate the worker log file
    ClearLog = 10,
}

impl Command {
    /// Every command, in wire order
    pub const ALL: [Command; 13] = [
        Command::HardKill,
        Command::ForcedExit,
        Command::Exit,
        Command::Move,
        Command::MoveByRatio,
        Command::Refresh,
        Command::ShowDesktop,
        Command::Probe,
        Command::Enumerate,
        Command::Count,
        Command::DisableSnapToGrid,
        Command::DisableAutoArrange,
        Command::ClearLog,
    ];

    /// Decode a raw command value, `None` for unknown values
    pub fn from_raw(raw: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.raw() == raw)
    }

    /// Wire value
    pub fn raw(self) -> i32 {
        self as i32
    }

    /// True for the liveness probe, which gets the short wait bound
    pub fn is_probe(self) -> bool {
        self == Command::Probe
    }

    /// True for the commands that end the server loop
    pub fn is_exit(self) -> bool {
        matches!(self, Command::Exit | Command::ForcedExit | Command::HardKill)
    }
}

/// How the `x`/`y` of a move request are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MoveMode {
    /// Absolute pixels
    #[default]
    Pixels,
    /// Per-mille of the screen extent (0..=1000)
    Ratio,
}

impl MoveMode {
    /// Command carrying this mode on the wire
    pub fn command(self) -> Command {
        match self {
            MoveMode::Pixels => Command::Move,
            MoveMode::Ratio => Command::MoveByRatio,
        }
    }
}

/// A named desktop item and its position
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IconPosition {
    /// Display name of the item
    pub name: String,
    /// Horizontal position
    pub x: i32,
    /// Vertical position
    pub y: i32,
}

impl IconPosition {
    /// Create a new item record
    pub fn new(name: impl Into<String>, x: i32, y: i32) -> Self {
        Self {
            name: name.into(),
            x,
            y,
        }
    }
}

/// One entry of the item array
#[repr(C)]
#[derive(Clone, Copy)]
pub struct WireItem {
    /// UTF-16 name, NUL terminated
    pub name: [u16; MAX_NAME_LEN],
    /// Horizontal coordinate
    pub x: i32,
    /// Vertical coordinate
    pub y: i32,
}

impl WireItem {
    /// An item with an empty name at the origin
    pub const EMPTY: WireItem = WireItem {
        name: [0; MAX_NAME_LEN],
        x: 0,
        y: 0,
    };

    /// Store a name, truncated to fit the buffer
    pub fn set_name(&mut self, name: &str) {
        write_wide(&mut self.name, name);
    }

    /// Decoded name
    pub fn name(&self) -> String {
        read_wide(&self.name)
    }

    /// True when the name buffer is empty
    pub fn has_name(&self) -> bool {
        self.name[0] != 0
    }

    /// Convert to the owned form
    pub fn to_position(&self) -> IconPosition {
        IconPosition::new(self.name(), self.x, self.y)
    }
}

impl From<&IconPosition> for WireItem {
    fn from(pos: &IconPosition) -> Self {
        let mut item = WireItem::EMPTY;
        item.set_name(&pos.name);
        item.x = pos.x;
        item.y = pos.y;
        item
    }
}

impl std::fmt::Debug for WireItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireItem")
            .field("name", &self.name())
            .field("x", &self.x)
            .field("y", &self.y)
            .finish()
    }
}

/// The record exchanged through the shared segment
///
/// About 130 KiB, so it is always handled boxed or in place.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Message {
    /// Raw command value
    pub command: i32,
    /// Item payload, only the first `count` entries are meaningful
    pub items: [WireItem; MAX_ITEMS],
    /// Number of valid or requested items
    pub count: i32,
    /// Start index for paged enumeration
    pub batch_cursor: u32,
    /// Number of failed sub-items in the last dispatch
    pub error_count: u32,
    /// Most recent error, UTF-16 NUL terminated
    pub error_message: [u16; MAX_ERROR_LEN],
}

impl Message {
    /// Allocate a zeroed message with the given command
    pub fn boxed(command: Command) -> Box<Self> {
        let mut msg = Self::zeroed();
        msg.command = command.raw();
        msg
    }

    /// Allocate a zeroed message whose command slot holds [`INVALID_COMMAND`]
    pub fn empty() -> Box<Self> {
        let mut msg = Self::zeroed();
        msg.command = INVALID_COMMAND;
        msg
    }

    fn zeroed() -> Box<Self> {
        let layout = Layout::new::<Self>();
        // SAFETY: Message is plain integers and arrays of integers, so the
        // all-zero bit pattern is a valid value. The pointer comes from the
        // global allocator with Message's own layout.
        unsafe {
            let ptr = alloc_zeroed(layout) as *mut Self;
            if ptr.is_null() {
                handle_alloc_error(layout);
            }
            Box::from_raw(ptr)
        }
    }

    /// Decoded command, `None` for unset or unknown values
    pub fn command(&self) -> Option<Command> {
        Command::from_raw(self.command)
    }

    /// Set the command
    pub fn set_command(&mut self, command: Command) {
        self.command = command.raw();
    }

    /// `count` clamped to the item array
    pub fn len(&self) -> usize {
        self.count.clamp(0, MAX_ITEMS as i32) as usize
    }

    /// True when `count` is zero or negative
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Set `count`, clamped to the item array
    pub fn set_len(&mut self, len: usize) {
        self.count = len.min(MAX_ITEMS) as i32;
    }

    /// Store a total that may exceed the item array, as in count responses
    pub fn set_total(&mut self, total: usize) {
        self.count = i32::try_from(total).unwrap_or(i32::MAX);
    }

    /// `count` read as a total rather than an item array length
    pub fn total(&self) -> usize {
        self.count.max(0) as usize
    }

    /// The valid prefix of the item array
    pub fn items(&self) -> &[WireItem] {
        &self.items[..self.len()]
    }

    /// Replace the payload with up to [`MAX_ITEMS`] positions
    ///
    /// Returns how many were stored.
    pub fn set_items(&mut self, positions: &[IconPosition]) -> usize {
        let stored = positions.len().min(MAX_ITEMS);
        for (slot, pos) in self.items.iter_mut().zip(&positions[..stored]) {
            *slot = WireItem::from(pos);
        }
        self.set_len(stored);
        stored
    }

    /// Decode the valid items
    pub fn positions(&self) -> Vec<IconPosition> {
        self.items().iter().map(WireItem::to_position).collect()
    }

    /// Reset the response status before dispatch
    pub fn clear_status(&mut self) {
        self.error_count = 0;
        self.error_message = [0; MAX_ERROR_LEN];
    }

    /// Count one failure and keep its text as the latest error
    pub fn record_error(&mut self, message: &str) {
        self.error_count = self.error_count.saturating_add(1);
        write_wide(&mut self.error_message, message);
    }

    /// Count several failures sharing one message
    pub fn record_errors(&mut self, n: u32, message: &str) {
        self.error_count = self.error_count.saturating_add(n);
        write_wide(&mut self.error_message, message);
    }

    /// Decoded error message
    pub fn error_message(&self) -> String {
        read_wide(&self.error_message)
    }

    /// Copy every field of `other` into `self`
    pub fn copy_from(&mut self, other: &Message) {
        *self = *other;
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("command", &self.command)
            .field("count", &self.count)
            .field("batch_cursor", &self.batch_cursor)
            .field("error_count", &self.error_count)
            .field("error_message", &self.error_message())
            .finish_non_exhaustive()
    }
}

/// Encode `s` into a fixed buffer, truncating and always NUL terminating
pub fn write_wide(buf: &mut [u16], s: &str) {
    let Some(max) = buf.len().checked_sub(1) else {
        return;
    };
    let mut len = 0;
    for unit in s.encode_utf16() {
        if len == max {
            break;
        }
        buf[len] = unit;
        len += 1;
    }
    // Don't leave half a surrogate pair at the cut
    if len == max && len > 0 && (0xD800..0xDC00).contains(&buf[len - 1]) {
        len -= 1;
    }
    buf[len..].fill(0);
}

/// Decode a NUL terminated buffer
pub fn read_wide(buf: &[u16]) -> String {
    let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..len])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_from_raw() {
        assert_eq!(Command::from_raw(1), Some(Command::Move));
        assert_eq!(Command::from_raw(5), Some(Command::Probe));
        assert_eq!(Command::from_raw(0), Some(Command::Exit));
        assert_eq!(Command::from_raw(-1), Some(Command::ForcedExit));
        assert_eq!(Command::from_raw(-114514), Some(Command::HardKill));
        assert_eq!(Command::from_raw(11), None);
        assert_eq!(Command::from_raw(INVALID_COMMAND), None);
    }

    #[test]
    fn test_command_flags() {
        assert!(Command::Probe.is_probe());
        assert!(!Command::Count.is_probe());
        assert!(Command::Exit.is_exit());
        assert!(Command::HardKill.is_exit());
        assert!(!Command::Refresh.is_exit());
        assert_eq!(MoveMode::Ratio.command(), Command::MoveByRatio);
    }

    #[test]
    fn test_empty_message_is_not_exit() {
        let msg = Message::empty();
        assert_eq!(msg.command, INVALID_COMMAND);
        assert_eq!(msg.command(), None);
        assert_eq!(msg.len(), 0);
    }

    #[test]
    fn test_count_is_clamped() {
        let mut msg = Message::boxed(Command::Move);
        msg.count = -4;
        assert_eq!(msg.len(), 0);
        msg.count = 10_000;
        assert_eq!(msg.len(), MAX_ITEMS);
        msg.set_len(999);
        assert_eq!(msg.count, MAX_ITEMS as i32);
    }

    #[test]
    fn test_set_items_caps_at_capacity() {
        let positions: Vec<_> = (0..300)
            .map(|i| IconPosition::new(format!("item{i}"), i, i * 2))
            .collect();
        let mut msg = Message::boxed(Command::Move);
        assert_eq!(msg.set_items(&positions), MAX_ITEMS);
        let back = msg.positions();
        assert_eq!(back.len(), MAX_ITEMS);
        assert_eq!(back[255], IconPosition::new("item255", 255, 510));
    }

    #[test]
    fn test_name_truncation() {
        let mut item = WireItem::EMPTY;
        let long = "x".repeat(MAX_NAME_LEN + 20);
        item.set_name(&long);
        assert_eq!(item.name().len(), MAX_NAME_LEN - 1);
        assert_eq!(item.name[MAX_NAME_LEN - 1], 0);
    }

    #[test]
    fn test_truncation_keeps_surrogates_whole() {
        let mut buf = [0u16; 4];
        // 'a' 'b' then a character outside the BMP (two units)
        write_wide(&mut buf, "ab\u{1F600}");
        assert_eq!(read_wide(&buf), "ab");
    }

    #[test]
    fn test_error_recording() {
        let mut msg = Message::boxed(Command::Move);
        msg.record_error("first");
        msg.record_error("second");
        assert_eq!(msg.error_count, 2);
        assert_eq!(msg.error_message(), "second");
        msg.record_errors(3, "surface missing");
        assert_eq!(msg.error_count, 5);
        msg.clear_status();
        assert_eq!(msg.error_count, 0);
        assert_eq!(msg.error_message(), "");
    }

    #[test]
    fn test_wire_layout() {
        let item = std::mem::size_of::<WireItem>();
        assert_eq!(item, MAX_NAME_LEN * 2 + 8);
        assert_eq!(
            std::mem::size_of::<Message>(),
            4 + item * MAX_ITEMS + 4 + 4 + 4 + MAX_ERROR_LEN * 2
        );
    }
}
