//! Mock serial channel for testing
//!
//! This adapter simulates the sensor without hardware. It provides:
//! - Scripted replies per command code (queued, then a sticky default)
//! - Empty reads before a reply, to exercise the wait loop
//! - Controllable failure injection
//! - Call logging for test verification
//!
//! Clones share state, so a channel "re-opened" after a pause keeps the
//! same script and call log.

use super::SerialChannel;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// What the mock answers to one command.
#[derive(Debug, Clone, PartialEq)]
pub enum MockReply {
    /// One line; a trailing `\n` is added when missing
    Line(String),
    /// Nothing at all: every read stays empty
    Silent,
}

impl MockReply {
    /// Reply line.
    pub fn line(text: impl Into<String>) -> Self {
        MockReply::Line(text.into())
    }
}

#[derive(Default)]
struct Script {
    queued: HashMap<String, VecDeque<MockReply>>,
    sticky: HashMap<String, MockReply>,
    pending: VecDeque<Vec<u8>>,
}

/// Mock serial channel
///
/// # Example
///
/// ```
/// use abakus_daq::adapters::MockAdapter;
///
/// let adapter = MockAdapter::new();
/// adapter.respond("U0004", "U0004 5000");
/// assert!(adapter.is_connected());
/// ```
#[derive(Clone)]
pub struct MockAdapter {
    name: String,
    connected: Arc<AtomicBool>,
    should_fail_next: Arc<AtomicBool>,
    empty_reads: Arc<AtomicU32>,
    script: Arc<Mutex<Script>>,
    call_log: Arc<Mutex<Vec<String>>>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    /// Create a connected mock with an empty script
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            connected: Arc::new(AtomicBool::new(true)),
            should_fail_next: Arc::new(AtomicBool::new(false)),
            empty_reads: Arc::new(AtomicU32::new(0)),
            script: Arc::new(Mutex::new(Script::default())),
            call_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Mock answering like a healthy sensor with `channels` channels.
    ///
    /// Counts stay at zero until scripted otherwise.
    pub fn abakus(channels: usize) -> Self {
        let adapter = Self::new();
        let diameters: Vec<String> = (0..channels).map(|i| (10 + 3 * i).to_string()).collect();
        adapter.respond("C0001", format!("C0001 {}", diameters.join(" ")));
        adapter.respond("X0003", "X0003 LDS 23/25 V2.1");
        let noise: Vec<String> = (0..channels / 2)
            .flat_map(|i| [(400 + i).to_string(), (10 + 3 * i).to_string()])
            .collect();
        adapter.respond("C0013", format!("C0013 {}", noise.join(" ")));
        adapter.respond("U0004", "U0004 5000");
        adapter.respond("U0003", "U0003 3000");
        adapter.respond("C0012", paired_counts_line("C0012", &vec![0.0; channels]));
        adapter
    }

    /// Queue a one-shot reply for `code`, consumed before the sticky one.
    pub fn script(&self, code: &str, reply: MockReply) {
        self.lock_script()
            .queued
            .entry(code.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Set the reply used whenever nothing is queued for `code`.
    pub fn respond(&self, code: &str, line: impl Into<String>) {
        self.lock_script()
            .sticky
            .insert(code.to_string(), MockReply::Line(line.into()));
    }

    /// Make `code` go unanswered unless a reply is queued.
    pub fn silence(&self, code: &str) {
        self.lock_script()
            .sticky
            .insert(code.to_string(), MockReply::Silent);
    }

    /// The next `count` reads return nothing.
    pub fn delay_next_reply(&self, count: u32) {
        self.empty_reads.store(count, Ordering::SeqCst);
    }

    /// Inject a failure for the next operation
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    fn check_failure(&self) -> bool {
        self.should_fail_next.swap(false, Ordering::SeqCst)
    }

    /// Set the connection state manually
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Check if currently connected
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// A fresh connected handle on the same simulated device.
    pub fn reopen(&self) -> Self {
        self.log_call("open".to_string());
        self.set_connected(true);
        self.clone()
    }

    /// Get the call log
    pub fn call_log(&self) -> Vec<String> {
        lock(&self.call_log).clone()
    }

    /// Codes written so far, in order.
    pub fn written(&self) -> Vec<String> {
        self.call_log()
            .into_iter()
            .filter_map(|call| call.strip_prefix("write: ").map(str::to_string))
            .collect()
    }

    /// Clear the call log
    pub fn clear_log(&self) {
        lock(&self.call_log).clear();
    }

    fn log_call(&self, call: String) {
        lock(&self.call_log).push(call);
    }

    fn lock_script(&self) -> MutexGuard<'_, Script> {
        lock(&self.script)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Paired counts reply line for cumulative `counts`, as the sensor sends it.
pub fn paired_counts_line(code: &str, counts: &[f64]) -> String {
    let mut line = code.to_string();
    for (i, count) in counts.iter().enumerate() {
        line.push_str(&format!(" {} {}", 10 + 3 * i, count));
    }
    line
}

#[async_trait]
impl SerialChannel for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        MockAdapter::is_connected(self)
    }

    async fn write(&mut self, bytes: &[u8]) -> AppResult<()> {
        let code = String::from_utf8_lossy(bytes).trim().to_string();
        self.log_call(format!("write: {}", code));

        if self.check_failure() {
            return Err(DaqError::Instrument("Injected failure".to_string()));
        }
        if !MockAdapter::is_connected(self) {
            return Err(DaqError::SerialPortNotConnected);
        }

        let mut script = self.lock_script();
        let reply = match script.queued.get_mut(&code).and_then(VecDeque::pop_front) {
            Some(reply) => Some(reply),
            None => script.sticky.get(&code).cloned(),
        };
        if let Some(MockReply::Line(mut line)) = reply {
            if !line.ends_with('\n') {
                line.push('\n');
            }
            script.pending.push_back(line.into_bytes());
        }
        Ok(())
    }

    async fn read_line(&mut self, _timeout: Duration) -> AppResult<Vec<u8>> {
        self.log_call("read_line".to_string());

        if self.check_failure() {
            return Err(DaqError::Instrument("Injected failure".to_string()));
        }
        if !MockAdapter::is_connected(self) {
            return Err(DaqError::SerialPortNotConnected);
        }

        let skip = self
            .empty_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if skip {
            return Ok(Vec::new());
        }

        Ok(self.lock_script().pending.pop_front().unwrap_or_default())
    }

    async fn close(&mut self) -> AppResult<()> {
        self.log_call("close".to_string());
        self.set_connected(false);
        self.lock_script().pending.clear();
        Ok(())
    }
}
