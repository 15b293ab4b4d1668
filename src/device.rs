//! Exclusive, scoped access to the inverter
//!
//! The data logger accepts one conversation at a time and drops requests
//! that arrive too close together. [`DeviceConnection`] owns the single
//! transport behind a FIFO mutex; a caller gets a [`DeviceSession`] only for
//! the duration of one batch of reads, and the link is closed before the
//! lock is released whatever the batch returned.

use crate::config::DeviceConfig;
use crate::error::{PowerwatchError, Result};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::modbus::RegisterTransport;
use crate::registers::{RawRegisters, ReadBlock};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, timeout};

mod detect;

pub use detect::{DeviceCapabilities, ProbeReading, detect_capabilities, resolve_capabilities};

/// Future returned by a batch passed to [`DeviceConnection::with_session`].
pub type SessionFuture<'s, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 's>>;

/// Timing limits applied to every session
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub inter_read_delay: Duration,
    pub lock_timeout: Duration,
}

impl From<&DeviceConfig> for SessionSettings {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            inter_read_delay: config.inter_read_delay(),
            lock_timeout: config.lock_timeout(),
        }
    }
}

/// Counters for diagnostics
#[derive(Debug, Default)]
pub struct SessionStats {
    cycles: AtomicU64,
    reads: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStatsSnapshot {
    pub cycles: u64,
    pub reads: u64,
    pub failures: u64,
}

impl SessionStats {
    pub fn snapshot(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// An open link, handed out for one batch of reads.
pub struct DeviceSession {
    transport: Box<dyn RegisterTransport>,
    settings: SessionSettings,
    stats: Arc<SessionStats>,
    last_read: Option<Instant>,
}

impl DeviceSession {
    async fn open(&mut self) -> Result<()> {
        self.last_read = None;
        match timeout(self.settings.connect_timeout, self.transport.connect()).await {
            Ok(result) => result,
            Err(_) => Err(PowerwatchError::timeout(format!(
                "Connecting to {} timed out",
                self.transport.endpoint()
            ))),
        }
    }

    async fn close(&mut self) -> Result<()> {
        match timeout(self.settings.connect_timeout, self.transport.close()).await {
            Ok(result) => result,
            Err(_) => Err(PowerwatchError::timeout("Closing the device link timed out")),
        }
    }

    /// Read `count` registers starting at `address`, keeping the minimum
    /// spacing since the previous read of this session.
    pub async fn read_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
        if let Some(last) = self.last_read {
            let elapsed = last.elapsed();
            if elapsed < self.settings.inter_read_delay {
                sleep(self.settings.inter_read_delay - elapsed).await;
            }
        }

        let outcome = timeout(
            self.settings.read_timeout,
            self.transport.read_holding_registers(address, count),
        )
        .await;
        self.last_read = Some(Instant::now());
        self.stats.reads.fetch_add(1, Ordering::Relaxed);

        match outcome {
            Ok(Ok(words)) if words.len() == count as usize => Ok(words),
            Ok(Ok(words)) => Err(PowerwatchError::protocol(format!(
                "Asked for {} registers at {}, got {}",
                count,
                address,
                words.len()
            ))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(PowerwatchError::timeout(format!(
                "Reading {} registers at {} timed out",
                count, address
            ))),
        }
    }

    /// Read every block into a fresh register map.
    pub async fn read_blocks(&mut self, blocks: &[ReadBlock]) -> Result<RawRegisters> {
        let mut raw = RawRegisters::default();
        for block in blocks {
            let words = self.read_registers(block.start, block.count).await?;
            raw.insert_block(block.start, &words);
        }
        Ok(raw)
    }
}

/// The single shared handle to the device.
pub struct DeviceConnection {
    session: Mutex<DeviceSession>,
    lock_timeout: Duration,
    stats: Arc<SessionStats>,
    logger: StructuredLogger,
}

impl DeviceConnection {
    pub fn new(transport: Box<dyn RegisterTransport>, settings: SessionSettings) -> Self {
        let logger = get_logger_with_context(
            LogContext::new("device").with_device(transport.endpoint()),
        );
        let stats = Arc::new(SessionStats::default());
        Self {
            session: Mutex::new(DeviceSession {
                transport,
                settings,
                stats: Arc::clone(&stats),
                last_read: None,
            }),
            lock_timeout: settings.lock_timeout,
            stats,
            logger,
        }
    }

    /// Run one batch against an open link.
    ///
    /// Waits (FIFO) for the device lock, connects, runs `op`, then closes the
    /// link exactly once before releasing the lock. A failure anywhere in the
    /// batch is returned to the caller; nothing is retried here.
    pub async fn with_session<T, F>(&self, op: F) -> Result<T>
    where
        T: Send,
        F: for<'s> FnOnce(&'s mut DeviceSession) -> SessionFuture<'s, T>,
    {
        let mut session = match timeout(self.lock_timeout, self.session.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                return Err(PowerwatchError::timeout("Timed out waiting for the device lock"));
            }
        };
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);

        let result = match session.open().await {
            Ok(()) => op(&mut *session).await,
            Err(e) => Err(e),
        };

        if let Err(e) = session.close().await {
            self.logger.debug(&format!("Close failed: {}", e));
        }
        drop(session);

        if let Err(ref e) = result {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            self.logger.debug(&format!("Session failed: {}", e));
        }
        result
    }

    pub fn stats(&self) -> SessionStatsSnapshot {
        self.stats.snapshot()
    }
}
