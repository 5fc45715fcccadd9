//! In-process channel and desktop
//!
//! [`LocalChannel`] mirrors the kernel objects with a condvar per object:
//! the mutex is a binary semaphore, the events are auto-reset. Cloning gives
//! another end of the same channel. [`MemoryDesktop`] keeps items in memory.
//! Both are used by the test suites and by embedders that run the server on
//! a thread of their own.

use crate::channel::Channel;
use crate::messages::{IconPosition, Message};
use crate::server::{ArrangementFlag, Desktop};
use crate::{Error, Result};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Auto-reset signal: a successful wait consumes it
struct Signal {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    fn new(initial: bool) -> Self {
        Self {
            set: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    fn set(&self) {
        *lock(&self.set) = true;
        self.cond.notify_one();
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut set = lock(&self.set);
        while !*set {
            match deadline {
                None => set = self.cond.wait(set).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    set = self
                        .cond
                        .wait_timeout(set, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        *set = false;
        true
    }
}

/// A command seen by the channel when it was signaled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    /// Raw command value
    pub command: i32,
    /// Raw count value
    pub count: i32,
}

struct Inner {
    mutex: Signal,
    command_ready: Signal,
    response_ready: Signal,
    shared: Mutex<Box<Message>>,
    transactions: Mutex<Vec<Transaction>>,
}

/// Channel whose ends live in one process
#[derive(Clone)]
pub struct LocalChannel {
    inner: Arc<Inner>,
}

impl LocalChannel {
    /// Create a channel with the mutex free and both events clear
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                mutex: Signal::new(true),
                command_ready: Signal::new(false),
                response_ready: Signal::new(false),
                shared: Mutex::new(Message::empty()),
                transactions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Every command signaled so far, oldest first
    pub fn transactions(&self) -> Vec<Transaction> {
        lock(&self.inner.transactions).clone()
    }

    /// Number of times `command-ready` was signaled
    pub fn command_signals(&self) -> usize {
        lock(&self.inner.transactions).len()
    }
}

impl Default for LocalChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for LocalChannel {
    fn acquire(&self, timeout: Duration) -> Result<bool> {
        Ok(self.inner.mutex.wait(Some(timeout)))
    }

    fn release(&self) -> Result<()> {
        self.inner.mutex.set();
        Ok(())
    }

    fn wait_command(&self, timeout: Option<Duration>) -> Result<bool> {
        Ok(self.inner.command_ready.wait(timeout))
    }

    fn signal_command(&self) -> Result<()> {
        let seen = self.with_shared(|msg| Transaction {
            command: msg.command,
            count: msg.count,
        });
        lock(&self.inner.transactions).push(seen);
        self.inner.command_ready.set();
        Ok(())
    }

    fn wait_response(&self, timeout: Duration) -> Result<bool> {
        Ok(self.inner.response_ready.wait(Some(timeout)))
    }

    fn signal_response(&self) -> Result<()> {
        self.inner.response_ready.set();
        Ok(())
    }

    fn with_shared<R>(&self, f: impl FnOnce(&mut Message) -> R) -> R {
        let mut shared = lock(&self.inner.shared);
        f(&mut shared)
    }
}

struct DesktopState {
    items: Vec<IconPosition>,
    surface_present: bool,
    screen: (i32, i32),
    dpi: u32,
    auto_arrange: bool,
    snap_to_grid: bool,
    refreshes: usize,
    show_desktop_calls: usize,
    rejected: Vec<String>,
}

/// Desktop kept in memory
///
/// Clones share state, so a test can keep a handle while a server thread
/// owns another.
#[derive(Clone)]
pub struct MemoryDesktop {
    state: Arc<Mutex<DesktopState>>,
}

impl MemoryDesktop {
    /// Desktop holding the given items
    pub fn new(items: Vec<IconPosition>) -> Self {
        Self {
            state: Arc::new(Mutex::new(DesktopState {
                items,
                surface_present: true,
                screen: (1920, 1080),
                dpi: 96,
                auto_arrange: true,
                snap_to_grid: true,
                refreshes: 0,
                show_desktop_calls: 0,
                rejected: Vec::new(),
            })),
        }
    }

    /// Desktop with items `item0..itemN` on a diagonal
    pub fn with_items(n: usize) -> Self {
        let items = (0..n)
            .map(|i| IconPosition::new(format!("item{i}"), i as i32, i as i32))
            .collect();
        Self::new(items)
    }

    /// Make the item list disappear or come back
    pub fn set_surface_present(&self, present: bool) {
        lock(&self.state).surface_present = present;
    }

    /// Change the screen extent
    pub fn set_screen(&self, width: i32, height: i32) {
        lock(&self.state).screen = (width, height);
    }

    /// Change the reported DPI
    pub fn set_dpi(&self, dpi: u32) {
        lock(&self.state).dpi = dpi;
    }

    /// Make moves of `name` fail
    pub fn reject_moves_of(&self, name: &str) {
        lock(&self.state).rejected.push(name.to_string());
    }

    /// Position of the item called `name`
    pub fn position(&self, name: &str) -> Option<(i32, i32)> {
        lock(&self.state)
            .items
            .iter()
            .find(|i| i.name == name)
            .map(|i| (i.x, i.y))
    }

    /// All items in list order
    pub fn items(&self) -> Vec<IconPosition> {
        lock(&self.state).items.clone()
    }

    /// Current state of an arrangement style
    pub fn arrangement(&self, flag: ArrangementFlag) -> bool {
        let state = lock(&self.state);
        match flag {
            ArrangementFlag::AutoArrange => state.auto_arrange,
            ArrangementFlag::SnapToGrid => state.snap_to_grid,
        }
    }

    /// Number of refresh requests served
    pub fn refreshes(&self) -> usize {
        lock(&self.state).refreshes
    }

    /// Number of show-desktop requests served
    pub fn show_desktop_calls(&self) -> usize {
        lock(&self.state).show_desktop_calls
    }
}

impl Desktop for MemoryDesktop {
    type Surface = ();

    fn find_surface(&mut self) -> Option<()> {
        lock(&self.state).surface_present.then_some(())
    }

    fn item_count(&self, _surface: ()) -> usize {
        lock(&self.state).items.len()
    }

    fn item_name(&self, _surface: (), index: usize) -> Option<String> {
        lock(&self.state).items.get(index).map(|i| i.name.clone())
    }

    fn item_position(&self, _surface: (), index: usize) -> Option<(i32, i32)> {
        lock(&self.state).items.get(index).map(|i| (i.x, i.y))
    }

    fn set_item_position(&mut self, _surface: (), index: usize, x: i32, y: i32) -> Result<()> {
        let mut state = lock(&self.state);
        let DesktopState {
            items, rejected, ..
        } = &mut *state;
        let item = items
            .get_mut(index)
            .ok_or_else(|| Error::Desktop(format!("no item at index {index}")))?;
        if rejected.contains(&item.name) {
            return Err(Error::Desktop(format!("position rejected for {}", item.name)));
        }
        item.x = x;
        item.y = y;
        Ok(())
    }

    fn screen_size(&self) -> (i32, i32) {
        lock(&self.state).screen
    }

    fn dpi(&self, _surface: ()) -> u32 {
        lock(&self.state).dpi
    }

    fn refresh(&mut self) -> Result<()> {
        lock(&self.state).refreshes += 1;
        Ok(())
    }

    fn show_desktop(&mut self) -> Result<()> {
        lock(&self.state).show_desktop_calls += 1;
        Ok(())
    }

    fn set_arrangement(&mut self, _surface: (), flag: ArrangementFlag, enabled: bool) -> Result<()> {
        let mut state = lock(&self.state);
        match flag {
            ArrangementFlag::AutoArrange => state.auto_arrange = enabled,
            ArrangementFlag::SnapToGrid => state.snap_to_grid = enabled,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Command;

    #[test]
    fn test_events_auto_reset() {
        let channel = LocalChannel::new();
        channel.signal_response().unwrap();
        channel.signal_response().unwrap();
        assert!(channel.wait_response(Duration::from_millis(10)).unwrap());
        assert!(!channel.wait_response(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn test_wait_times_out() {
        let channel = LocalChannel::new();
        let start = Instant::now();
        assert!(!channel.wait_command(Some(Duration::from_millis(50))).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_signal_wakes_other_thread() {
        let channel = LocalChannel::new();
        let other = channel.clone();
        let waiter = std::thread::spawn(move || other.wait_command(None).unwrap());
        std::thread::sleep(Duration::from_millis(20));
        channel.signal_command().unwrap();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_transactions_recorded() {
        let channel = LocalChannel::new();
        channel.with_shared(|msg| {
            msg.set_command(Command::Enumerate);
            msg.count = 17;
        });
        channel.signal_command().unwrap();
        assert_eq!(
            channel.transactions(),
            vec![Transaction {
                command: Command::Enumerate.raw(),
                count: 17
            }]
        );
    }

    #[test]
    fn test_memory_desktop_shares_state() {
        let desktop = MemoryDesktop::with_items(2);
        let mut handle = desktop.clone();
        handle.set_item_position((), 1, 40, 50).unwrap();
        assert_eq!(desktop.position("item1"), Some((40, 50)));
        assert!(handle.set_item_position((), 9, 0, 0).is_err());
    }

    #[test]
    fn test_memory_desktop_rejects() {
        let mut desktop = MemoryDesktop::with_items(1);
        desktop.reject_moves_of("item0");
        assert!(desktop.set_item_position((), 0, 1, 1).is_err());
        assert_eq!(desktop.position("item0"), Some((0, 0)));
    }
}
