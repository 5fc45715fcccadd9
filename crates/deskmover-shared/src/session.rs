//! Client side of the protocol
//!
//! One [`Session::execute`] call is one transaction:
//! 1. take the mutex (bounded by `mutex_timeout`)
//! 2. wait for `response-ready`, the server's "idle" token
//! 3. write the message, signal `command-ready`
//! 4. wait for `response-ready` again, now the reply
//! 5. copy the reply back only if `error_count == 0`, hand the idle token
//!    back, unlock
//! 6. check the host is still alive
//!
//! Waits in steps 2 and 4 use the probe timeout for [`Command::Probe`] and
//! the operation timeout for everything else.

use crate::channel::{Channel, ChannelLock};
use crate::messages::{Command, IconPosition, Message, MoveMode};
use crate::server::ServerExit;
use crate::{Error, MAX_ITEMS, Result};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Timeouts and paging for a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on acquiring the channel mutex
    pub mutex_timeout: Duration,
    /// Bound on each response wait of a liveness probe
    pub probe_timeout: Duration,
    /// Bound on each response wait of any other command
    pub operation_timeout: Duration,
    /// Items per enumerate page and per move chunk, at most [`MAX_ITEMS`]
    pub page_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mutex_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_millis(300),
            operation_timeout: Duration::from_secs(25),
            page_size: MAX_ITEMS,
        }
    }
}

impl SessionConfig {
    /// Response wait bound for a raw command value
    pub fn response_timeout(&self, raw_command: i32) -> Duration {
        match Command::from_raw(raw_command) {
            Some(c) if c.is_probe() => self.probe_timeout,
            _ => self.operation_timeout,
        }
    }

    /// `page_size` clamped to `1..=MAX_ITEMS`
    pub fn page_size(&self) -> usize {
        self.page_size.clamp(1, MAX_ITEMS)
    }
}

/// Liveness check and restart of the host process
pub trait HostMonitor {
    /// True while the host is running
    fn is_alive(&self) -> bool;

    /// Start the host again
    fn restart(&self) -> Result<()>;
}

/// Monitor for hosts that are not watched
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHostMonitor;

impl HostMonitor for NoHostMonitor {
    fn is_alive(&self) -> bool {
        true
    }

    fn restart(&self) -> Result<()> {
        Ok(())
    }
}

/// Outcome of [`Session::move_many`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MoveReport {
    /// Transactions issued, one per chunk
    pub transactions: usize,
    /// Items the worker moved
    pub moved: usize,
    /// Failed items summed over all chunks
    pub error_count: usize,
    /// Most recent error text
    pub last_error: Option<String>,
}

impl MoveReport {
    /// True when no item failed
    pub fn is_success(&self) -> bool {
        self.error_count == 0
    }
}

/// Caller-side serialization of multi-step operations
///
/// Returned by [`Session::begin_transaction`]; dropping it or calling
/// [`TransactionScope::end`] lets the next caller in.
pub struct TransactionScope<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl TransactionScope<'_> {
    /// End the scope
    pub fn end(self) {}
}

/// Client end of a channel
pub struct Session<C, M = NoHostMonitor> {
    channel: C,
    monitor: M,
    config: SessionConfig,
    serial: Mutex<()>,
}

impl<C: Channel> Session<C> {
    /// Session without host monitoring
    pub fn new(channel: C, config: SessionConfig) -> Self {
        Self {
            channel,
            monitor: NoHostMonitor,
            config,
            serial: Mutex::new(()),
        }
    }
}

impl<C: Channel, M: HostMonitor> Session<C, M> {
    /// Watch the host with `monitor` after every transaction
    pub fn with_monitor<N: HostMonitor>(self, monitor: N) -> Session<C, N> {
        Session {
            channel: self.channel,
            monitor,
            config: self.config,
            serial: self.serial,
        }
    }

    /// Settings in use
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The underlying channel
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Serialize a group of calls against other users of this session
    ///
    /// The channel mutex only covers one transaction; hold this across
    /// steps that belong together, like disabling auto-arrange and then
    /// moving items.
    pub fn begin_transaction(&self) -> TransactionScope<'_> {
        TransactionScope {
            _guard: self.serial.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Run one request/response transaction
    ///
    /// On success `msg` holds the server's reply. When the server reports
    /// errors `msg` is left as sent and [`Error::CommandFailed`] carries the
    /// status. A dead host turns any outcome into [`Error::HostCrashed`].
    pub fn execute(&self, msg: &mut Message) -> Result<()> {
        let outcome = self.transact(msg);
        self.check_host()?;
        outcome
    }

    fn transact(&self, msg: &mut Message) -> Result<()> {
        let wait = self.config.response_timeout(msg.command);

        let Some(_lock) = ChannelLock::acquire(&self.channel, self.config.mutex_timeout)? else {
            debug!(command = msg.command, "channel mutex busy");
            return Err(Error::MutexTimeout(self.config.mutex_timeout));
        };

        if !self.channel.wait_response(wait)? {
            return Err(Error::NotReady(wait));
        }

        self.channel.store(msg);
        self.channel.signal_command()?;

        if !self.channel.wait_response(wait)? {
            warn!(command = msg.command, ?wait, "no response from worker");
            return Err(Error::ResponseTimeout(wait));
        }

        let failure = self.channel.with_shared(|shared| {
            if shared.error_count == 0 {
                msg.copy_from(shared);
                None
            } else {
                Some((shared.error_count, shared.error_message()))
            }
        });

        // The reply consumed the idle token; the server is waiting again,
        // unless it was told to stop
        if !Command::from_raw(msg.command).is_some_and(Command::is_exit) {
            self.channel.signal_response()?;
        }

        match failure {
            None => Ok(()),
            Some((error_count, message)) => Err(Error::CommandFailed {
                error_count,
                message,
            }),
        }
    }

    fn check_host(&self) -> Result<()> {
        if self.monitor.is_alive() {
            return Ok(());
        }

        error!("host process is gone, restarting it");
        let restarted = match self.monitor.restart() {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "host restart failed");
                false
            }
        };
        Err(Error::HostCrashed { restarted })
    }

    fn simple(&self, command: Command) -> Result<Box<Message>> {
        let mut msg = Message::boxed(command);
        self.execute(&mut msg)?;
        Ok(msg)
    }

    /// True when a server answered within the probe timeout
    pub fn probe(&self) -> bool {
        match self.simple(Command::Probe) {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "probe failed");
                false
            }
        }
    }

    /// Number of items on the desktop
    pub fn count(&self) -> Result<usize> {
        Ok(self.simple(Command::Count)?.total())
    }

    /// Read every item, in pages of `page_size`
    ///
    /// Fails with [`Error::BatchOverflow`] rather than truncating when the
    /// desktop holds more than `capacity` items.
    pub fn enumerate_all(&self, capacity: usize) -> Result<Vec<IconPosition>> {
        let total = self.count()?;
        if total > capacity {
            return Err(Error::BatchOverflow { capacity });
        }

        let page = self.config.page_size();
        let mut items = Vec::with_capacity(total);
        let mut msg = Message::empty();

        while items.len() < total {
            let wanted = page.min(total - items.len());
            msg.set_command(Command::Enumerate);
            msg.batch_cursor = u32::try_from(items.len())
                .map_err(|_| Error::BatchOverflow { capacity })?;
            msg.set_len(wanted);

            self.execute(&mut msg)?;

            let got = msg.len().min(wanted);
            items.extend(msg.items()[..got].iter().map(|item| item.to_position()));
            debug!(cursor = msg.batch_cursor, got, "enumerate page");

            if got < wanted {
                break;
            }
        }

        Ok(items)
    }

    /// Move items in chunks of `page_size`, one transaction per chunk
    ///
    /// A failed chunk is recorded and the rest still run. Only a dead host
    /// stops the batch.
    pub fn move_many(&self, items: &[IconPosition], mode: MoveMode) -> Result<MoveReport> {
        let mut report = MoveReport::default();

        for chunk in items.chunks(self.config.page_size()) {
            let mut msg = Message::boxed(mode.command());
            msg.set_items(chunk);
            report.transactions += 1;

            match self.execute(&mut msg) {
                Ok(()) => report.moved += chunk.len(),
                Err(Error::CommandFailed {
                    error_count,
                    message,
                }) => {
                    let failed = (error_count as usize).min(chunk.len());
                    report.moved += chunk.len() - failed;
                    report.error_count += failed;
                    report.last_error = Some(message);
                }
                Err(e @ Error::HostCrashed { .. }) => return Err(e),
                Err(e) => {
                    warn!(error = %e, size = chunk.len(), "move chunk failed");
                    report.error_count += chunk.len();
                    report.last_error = Some(e.to_string());
                }
            }
        }

        Ok(report)
    }

    /// Ask the shell to refresh the desktop
    pub fn refresh(&self) -> Result<()> {
        self.simple(Command::Refresh).map(drop)
    }

    /// Simulate the show-desktop gesture
    pub fn show_desktop(&self) -> Result<()> {
        self.simple(Command::ShowDesktop).map(drop)
    }

    /// Turn off snap-to-grid
    pub fn disable_snap_to_grid(&self) -> Result<()> {
        self.simple(Command::DisableSnapToGrid).map(drop)
    }

    /// Turn off auto-arrange
    pub fn disable_auto_arrange(&self) -> Result<()> {
        self.simple(Command::DisableAutoArrange).map(drop)
    }

    /// Truncate the worker log
    pub fn clear_log(&self) -> Result<()> {
        self.simple(Command::ClearLog).map(drop)
    }

    /// Stop the server
    ///
    /// A hard kill takes the host down with it, so the host is not checked
    /// afterwards.
    pub fn shutdown(&self, exit: ServerExit) -> Result<()> {
        let mut msg = Message::boxed(exit.command());
        match exit {
            ServerExit::HardKill => self.transact(&mut msg),
            _ => self.execute(&mut msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::{LocalChannel, MemoryDesktop};
    use crate::server::Server;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread::JoinHandle;
    use std::time::Instant;

    fn fast_config() -> SessionConfig {
        SessionConfig {
            mutex_timeout: Duration::from_millis(200),
            probe_timeout: Duration::from_millis(300),
            operation_timeout: Duration::from_secs(5),
            page_size: MAX_ITEMS,
        }
    }

    fn start_server(
        channel: &LocalChannel,
        desktop: &MemoryDesktop,
    ) -> JoinHandle<Result<ServerExit>> {
        let channel = channel.clone();
        let desktop = desktop.clone();
        std::thread::spawn(move || Server::new(channel, desktop).run())
    }

    fn stop(session: &Session<LocalChannel>, server: JoinHandle<Result<ServerExit>>) {
        session.shutdown(ServerExit::Normal).unwrap();
        assert_eq!(server.join().unwrap().unwrap(), ServerExit::Normal);
    }

    fn commands(channel: &LocalChannel, command: Command) -> Vec<i32> {
        channel
            .transactions()
            .into_iter()
            .filter(|t| t.command == command.raw())
            .map(|t| t.count)
            .collect()
    }

    #[test]
    fn test_probe_with_server() {
        let channel = LocalChannel::new();
        let desktop = MemoryDesktop::with_items(1);
        let server = start_server(&channel, &desktop);
        let session = Session::new(channel.clone(), fast_config());

        assert!(session.probe());
        assert!(session.probe());
        stop(&session, server);
    }

    #[test]
    fn test_probe_without_server_fails_fast() {
        let channel = LocalChannel::new();
        let session = Session::new(channel.clone(), fast_config());

        let start = Instant::now();
        assert!(!session.probe());
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(300) + Duration::from_millis(700));
        assert_eq!(channel.command_signals(), 0);
    }

    #[test]
    fn test_probe_against_stopped_server_fails_fast() {
        let channel = LocalChannel::new();
        let desktop = MemoryDesktop::with_items(1);
        let server = start_server(&channel, &desktop);
        let session = Session::new(channel.clone(), fast_config());
        stop(&session, server);
        let signals = channel.command_signals();

        let start = Instant::now();
        assert!(!session.probe());
        assert!(start.elapsed() < Duration::from_secs(1));
        // No idle token was left behind, so the probe never wrote a command
        assert_eq!(channel.command_signals(), signals);
    }

    #[test]
    fn test_mutex_timeout_leaves_channel_untouched() {
        let channel = LocalChannel::new();
        let session = Session::new(channel.clone(), fast_config());
        channel.signal_response().unwrap();
        channel.with_shared(|msg| {
            msg.set_command(Command::Refresh);
            msg.count = 42;
        });

        assert!(channel.acquire(Duration::from_millis(10)).unwrap());

        let mut msg = Message::boxed(Command::Move);
        msg.set_items(&[IconPosition::new("a", 1, 2)]);
        let err = session.execute(&mut msg).unwrap_err();

        assert!(matches!(err, Error::MutexTimeout(_)));
        assert_eq!(channel.command_signals(), 0);
        channel.with_shared(|shared| {
            assert_eq!(shared.command(), Some(Command::Refresh));
            assert_eq!(shared.count, 42);
        });
        // Idle token untouched too
        assert!(channel.wait_response(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn test_reply_written_slowly_is_read_whole() {
        let channel = LocalChannel::new();
        let server_side = channel.clone();

        let server = std::thread::spawn(move || {
            server_side.signal_response().unwrap();
            assert!(server_side.wait_command(None).unwrap());

            // Each field lands in a separate critical section with a pause
            // in between; the client must not look before the signal.
            server_side.with_shared(|msg| msg.clear_status());
            for i in 0..8 {
                std::thread::sleep(Duration::from_millis(5));
                server_side.with_shared(|msg| {
                    msg.items[i].set_name(&format!("slow{i}"));
                    msg.items[i].x = i as i32 * 10;
                    msg.items[i].y = i as i32 * 20;
                });
            }
            std::thread::sleep(Duration::from_millis(5));
            server_side.with_shared(|msg| msg.count = 8);
            server_side.signal_response().unwrap();
        });

        let session = Session::new(channel.clone(), fast_config());
        let mut msg = Message::boxed(Command::Enumerate);
        msg.set_len(8);
        session.execute(&mut msg).unwrap();
        server.join().unwrap();

        let items = msg.positions();
        assert_eq!(items.len(), 8);
        for (i, item) in items.iter().enumerate() {
            assert_eq!(*item, IconPosition::new(format!("slow{i}"), i as i32 * 10, i as i32 * 20));
        }
    }

    #[test]
    fn test_failed_reply_is_not_copied() {
        let channel = LocalChannel::new();
        let desktop = MemoryDesktop::with_items(1);
        let server = start_server(&channel, &desktop);
        let session = Session::new(channel.clone(), fast_config());

        let mut msg = Message::boxed(Command::Move);
        msg.set_items(&[IconPosition::new("ghost", 5, 5)]);
        msg.batch_cursor = 1234;
        let err = session.execute(&mut msg).unwrap_err();

        match err {
            Error::CommandFailed {
                error_count,
                message,
            } => {
                assert_eq!(error_count, 1);
                assert!(message.contains("ghost"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(msg.batch_cursor, 1234);
        assert_eq!(msg.error_count, 0);

        // Session still usable after a failure
        assert!(session.probe());
        stop(&session, server);
    }

    #[test]
    fn test_enumerate_page_counts() {
        let p = 16;
        for m in [0, 1, p - 1, p, p + 1, 3 * p] {
            let channel = LocalChannel::new();
            let desktop = MemoryDesktop::with_items(m);
            let server = start_server(&channel, &desktop);
            let config = SessionConfig {
                page_size: p,
                ..fast_config()
            };
            let session = Session::new(channel.clone(), config);

            let items = session.enumerate_all(1000).unwrap();

            assert_eq!(items, desktop.items(), "m = {m}");
            let pages = commands(&channel, Command::Enumerate);
            assert_eq!(pages.len(), m.div_ceil(p), "m = {m}");
            assert!(pages.iter().all(|&n| n as usize <= p));
            stop(&session, server);
        }
    }

    #[test]
    fn test_enumerate_full_pages() {
        let channel = LocalChannel::new();
        let desktop = MemoryDesktop::with_items(3 * MAX_ITEMS + 5);
        let server = start_server(&channel, &desktop);
        let session = Session::new(channel.clone(), fast_config());

        let items = session.enumerate_all(usize::MAX).unwrap();

        assert_eq!(items.len(), 3 * MAX_ITEMS + 5);
        assert_eq!(items[MAX_ITEMS].name, format!("item{MAX_ITEMS}"));
        assert_eq!(
            commands(&channel, Command::Enumerate),
            vec![256, 256, 256, 5]
        );
        stop(&session, server);
    }

    #[test]
    fn test_enumerate_stops_on_short_page() {
        let channel = LocalChannel::new();
        let server_side = channel.clone();

        // Reports 10 items, then the desktop shrinks and the first page
        // comes back with only 3 of the 5 asked for
        let server = std::thread::spawn(move || {
            server_side.signal_response().unwrap();
            for _ in 0..2 {
                assert!(server_side.wait_command(None).unwrap());
                server_side.with_shared(|msg| {
                    msg.clear_status();
                    match msg.command() {
                        Some(Command::Count) => msg.set_total(10),
                        Some(Command::Enumerate) => {
                            let page: Vec<_> = (0..3)
                                .map(|i| IconPosition::new(format!("left{i}"), i, i))
                                .collect();
                            msg.set_items(&page);
                        }
                        other => panic!("unexpected command {other:?}"),
                    }
                });
                server_side.signal_response().unwrap();
            }
        });

        let config = SessionConfig {
            page_size: 5,
            ..fast_config()
        };
        let session = Session::new(channel.clone(), config);
        let items = session.enumerate_all(10).unwrap();
        server.join().unwrap();

        assert_eq!(
            items.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(),
            ["left0", "left1", "left2"]
        );
        assert_eq!(commands(&channel, Command::Enumerate), vec![5]);
        assert_eq!(channel.command_signals(), 2);
    }

    #[test]
    fn test_enumerate_overflow_is_rejected() {
        let channel = LocalChannel::new();
        let desktop = MemoryDesktop::with_items(10);
        let server = start_server(&channel, &desktop);
        let session = Session::new(channel.clone(), fast_config());

        let err = session.enumerate_all(9).unwrap_err();

        assert!(matches!(err, Error::BatchOverflow { capacity: 9 }));
        assert!(commands(&channel, Command::Enumerate).is_empty());
        stop(&session, server);
    }

    #[test]
    fn test_move_300_in_two_chunks() {
        let channel = LocalChannel::new();
        let desktop = MemoryDesktop::with_items(300);
        let server = start_server(&channel, &desktop);
        let session = Session::new(channel.clone(), fast_config());

        let targets: Vec<_> = (0..300)
            .map(|i| IconPosition::new(format!("item{i}"), 1000 + i, 2000 + i))
            .collect();
        let report = session.move_many(&targets, MoveMode::Pixels).unwrap();

        assert_eq!(report.transactions, 2);
        assert_eq!(report.moved, 300);
        assert!(report.is_success());
        assert_eq!(commands(&channel, Command::Move), vec![256, 44]);
        // Order preserved across the chunk boundary
        assert_eq!(desktop.items(), targets);
        stop(&session, server);
    }

    #[test]
    fn test_move_chunk_failure_continues() {
        let channel = LocalChannel::new();
        let desktop = MemoryDesktop::with_items(20);
        desktop.reject_moves_of("item3");
        let server = start_server(&channel, &desktop);
        let config = SessionConfig {
            page_size: 5,
            ..fast_config()
        };
        let session = Session::new(channel.clone(), config);

        let mut targets: Vec<_> = (0..20)
            .map(|i| IconPosition::new(format!("item{i}"), 7, 7))
            .collect();
        targets[12].name = "missing".to_string();
        let report = session.move_many(&targets, MoveMode::Pixels).unwrap();

        assert_eq!(report.transactions, 4);
        assert_eq!(report.error_count, 2);
        assert_eq!(report.moved, 18);
        assert!(report.last_error.unwrap().contains("missing"));
        assert_eq!(desktop.position("item19"), Some((7, 7)));
        stop(&session, server);
    }

    #[test]
    fn test_simple_commands_reach_desktop() {
        let channel = LocalChannel::new();
        let desktop = MemoryDesktop::with_items(4);
        let server = start_server(&channel, &desktop);
        let session = Session::new(channel.clone(), fast_config());

        assert_eq!(session.count().unwrap(), 4);
        session.refresh().unwrap();
        session.show_desktop().unwrap();
        session.disable_auto_arrange().unwrap();
        session.disable_snap_to_grid().unwrap();
        session.clear_log().unwrap();

        assert_eq!(desktop.refreshes(), 1);
        assert_eq!(desktop.show_desktop_calls(), 1);
        assert!(!desktop.arrangement(crate::ArrangementFlag::AutoArrange));
        assert!(!desktop.arrangement(crate::ArrangementFlag::SnapToGrid));
        stop(&session, server);
    }

    struct FlakyHost {
        alive: AtomicBool,
        restarts: AtomicUsize,
    }

    impl HostMonitor for Arc<FlakyHost> {
        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn restart(&self) -> Result<()> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_host_crash_escalates_and_restarts() {
        let channel = LocalChannel::new();
        let desktop = MemoryDesktop::with_items(600);
        let server = start_server(&channel, &desktop);
        let host = Arc::new(FlakyHost {
            alive: AtomicBool::new(true),
            restarts: AtomicUsize::new(0),
        });
        let session = Session::new(channel.clone(), fast_config()).with_monitor(host.clone());

        assert!(session.probe());
        host.alive.store(false, Ordering::SeqCst);

        let targets: Vec<_> = (0..600)
            .map(|i| IconPosition::new(format!("item{i}"), 1, 1))
            .collect();
        let err = session.move_many(&targets, MoveMode::Pixels).unwrap_err();

        assert!(matches!(err, Error::HostCrashed { restarted: true }));
        assert_eq!(host.restarts.load(Ordering::SeqCst), 1);
        // The batch stopped after the first chunk
        assert_eq!(commands(&channel, Command::Move).len(), 1);

        host.alive.store(true, Ordering::SeqCst);
        session.shutdown(ServerExit::Normal).unwrap();
        server.join().unwrap().unwrap();
    }

    #[test]
    fn test_hard_kill_skips_host_check() {
        let channel = LocalChannel::new();
        let desktop = MemoryDesktop::with_items(1);
        let server = start_server(&channel, &desktop);
        let host = Arc::new(FlakyHost {
            alive: AtomicBool::new(false),
            restarts: AtomicUsize::new(0),
        });
        let session = Session::new(channel.clone(), fast_config()).with_monitor(host.clone());

        session.shutdown(ServerExit::HardKill).unwrap();

        assert_eq!(server.join().unwrap().unwrap(), ServerExit::HardKill);
        assert_eq!(host.restarts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_transaction_scope_serializes_callers() {
        let channel = LocalChannel::new();
        let desktop = MemoryDesktop::with_items(2);
        let server = start_server(&channel, &desktop);
        let session = Arc::new(Session::new(channel.clone(), fast_config()));
        let barrier = Arc::new(Barrier::new(2));
        let inside = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..2)
            .map(|n| {
                let session = session.clone();
                let barrier = barrier.clone();
                let inside = inside.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    let scope = session.begin_transaction();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    session.disable_auto_arrange().unwrap();
                    let name = format!("item{n}");
                    session
                        .move_many(&[IconPosition::new(name, 9, 9)], MoveMode::Pixels)
                        .unwrap();
                    inside.fetch_sub(1, Ordering::SeqCst);
                    scope.end();
                })
            })
            .collect();

        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(desktop.position("item0"), Some((9, 9)));
        assert_eq!(desktop.position("item1"), Some((9, 9)));
        stop(&session, server);
    }

    #[test]
    fn test_response_timeout_depends_on_command() {
        let config = SessionConfig::default();
        assert_eq!(
            config.response_timeout(Command::Probe.raw()),
            Duration::from_millis(300)
        );
        assert_eq!(
            config.response_timeout(Command::Move.raw()),
            Duration::from_secs(25)
        );
        assert_eq!(config.response_timeout(99), Duration::from_secs(25));
    }
}
