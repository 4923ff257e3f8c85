//! Session and SessionManager
//!
//! A session is one logical stream on a physical connection. The manager's
//! table is the only state shared between a connection's demux task and its
//! per-session forwarding tasks. The lock is held for map operations only;
//! every pipe operation happens after it is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::common::{Link, PipeReader, PipeWriter};
use crate::error::{Error, Result};
use crate::metrics::{MUX_SESSIONS_ACTIVE, MUX_SESSIONS_TOTAL};

use super::client::ClientStrategy;
use super::frame::TransferType;
use super::Role;

// ============================================================================
// Session
// ============================================================================

/// One logical stream.
///
/// `input` yields what the local side wants sent to the peer (uplink);
/// `output` receives what the peer sent (downlink).
pub struct Session {
    id: u16,
    input: PipeReader,
    output: PipeWriter,
    transfer: TransferType,
    uplink_closed: AtomicBool,
    downlink_closed: AtomicBool,
}

impl Session {
    /// Wrap the local end of a logical connection
    pub fn from_link(id: u16, link: Link, transfer: TransferType) -> Self {
        Self {
            id,
            input: link.reader,
            output: link.writer,
            transfer,
            uplink_closed: AtomicBool::new(false),
            downlink_closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn input(&self) -> &PipeReader {
        &self.input
    }

    pub fn output(&self) -> &PipeWriter {
        &self.output
    }

    pub fn transfer_type(&self) -> TransferType {
        self.transfer
    }

    /// Record that this side sent End. Returns true once both directions
    /// are finished.
    pub fn mark_uplink_closed(&self) -> bool {
        self.uplink_closed.store(true, Ordering::SeqCst);
        self.downlink_closed.load(Ordering::SeqCst)
    }

    /// Record that the peer sent End. Returns true once both directions
    /// are finished.
    pub fn mark_downlink_closed(&self) -> bool {
        self.downlink_closed.store(true, Ordering::SeqCst);
        self.uplink_closed.load(Ordering::SeqCst)
    }

    pub fn is_done(&self) -> bool {
        self.uplink_closed.load(Ordering::SeqCst) && self.downlink_closed.load(Ordering::SeqCst)
    }

    /// The peer is done sending: the local reader drains what was delivered
    /// and then sees EOF. The uplink keeps running.
    pub fn close(&self) {
        self.output.close();
    }

    /// Abort both directions, dropping anything still buffered
    pub fn close_with_error(&self) {
        self.output.interrupt();
        self.input.interrupt();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("transfer", &self.transfer)
            .field("uplink_closed", &self.uplink_closed.load(Ordering::Relaxed))
            .field("downlink_closed", &self.downlink_closed.load(Ordering::Relaxed))
            .finish()
    }
}

// ============================================================================
// SessionManager
// ============================================================================

struct Table {
    sessions: HashMap<u16, Arc<Session>>,
    /// Sessions ever added; also the id counter on the client side
    count: u16,
    closed: bool,
}

/// Id → session table for one physical connection
pub struct SessionManager {
    role: Role,
    table: Mutex<Table>,
}

impl SessionManager {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            table: Mutex::new(Table {
                sessions: HashMap::new(),
                count: 0,
                closed: false,
            }),
        }
    }

    /// Allocate the next id for a new session, unless the manager is closed
    /// or `strategy` caps are reached. Hands the link back on refusal.
    pub fn allocate(
        &self,
        link: Link,
        transfer: TransferType,
        strategy: &ClientStrategy,
    ) -> std::result::Result<Arc<Session>, Link> {
        let (session, replaced) = {
            let mut table = self.table.lock();
            if table.closed
                || (strategy.max_concurrency > 0
                    && table.sessions.len() >= strategy.max_concurrency as usize)
                || (strategy.max_connections > 0
                    && u32::from(table.count) >= strategy.max_connections)
            {
                return Err(link);
            }

            table.count = table.count.wrapping_add(1);
            if table.count == 0 {
                table.count = 1;
            }
            let id = table.count;
            let session = Arc::new(Session::from_link(id, link, transfer));
            let replaced = table.sessions.insert(id, Arc::clone(&session));
            (session, replaced)
        };

        self.on_added(replaced, session.id());
        Ok(session)
    }

    /// Insert a session whose id was chosen by the peer
    pub fn add(&self, session: Session) -> Result<Arc<Session>> {
        let id = session.id();
        let (session, replaced) = {
            let mut table = self.table.lock();
            if table.closed {
                return Err(Error::ManagerClosed.in_session(id));
            }
            table.count = table.count.wrapping_add(1);
            let session = Arc::new(session);
            let replaced = table.sessions.insert(id, Arc::clone(&session));
            (session, replaced)
        };

        self.on_added(replaced, id);
        Ok(session)
    }

    fn on_added(&self, replaced: Option<Arc<Session>>, id: u16) {
        MUX_SESSIONS_TOTAL.with_label_values(&[self.role.as_str()]).inc();
        match replaced {
            // The old entry keeps running but can no longer be looked up
            Some(old) => {
                warn!(
                    "[mux-{}] session id {} reused while still live",
                    self.role.as_str(),
                    id
                );
                old.close_with_error();
            }
            None => MUX_SESSIONS_ACTIVE.with_label_values(&[self.role.as_str()]).inc(),
        }
    }

    /// Remove by id; absent ids are a no-op
    pub fn remove(&self, id: u16) -> Option<Arc<Session>> {
        let removed = self.table.lock().sessions.remove(&id);
        if removed.is_some() {
            MUX_SESSIONS_ACTIVE.with_label_values(&[self.role.as_str()]).dec();
        }
        removed
    }

    /// Remove `session` if the table still maps its id to it. Returns true
    /// if this call removed it.
    pub fn release(&self, session: &Arc<Session>) -> bool {
        let removed = {
            let mut table = self.table.lock();
            match table.sessions.get(&session.id()) {
                Some(current) if Arc::ptr_eq(current, session) => {
                    table.sessions.remove(&session.id());
                    true
                }
                _ => false,
            }
        };
        if removed {
            MUX_SESSIONS_ACTIVE.with_label_values(&[self.role.as_str()]).dec();
        }
        removed
    }

    pub fn get(&self, id: u16) -> Option<Arc<Session>> {
        self.table.lock().sessions.get(&id).cloned()
    }

    /// Live sessions
    pub fn size(&self) -> usize {
        self.table.lock().sessions.len()
    }

    /// Sessions ever added
    pub fn count(&self) -> u16 {
        self.table.lock().count
    }

    pub fn is_closed(&self) -> bool {
        self.table.lock().closed
    }

    /// Close the manager only if it holds no sessions. Returns true when the
    /// manager is (now) closed.
    pub fn close_if_empty(&self) -> bool {
        let mut table = self.table.lock();
        if table.closed {
            return true;
        }
        if !table.sessions.is_empty() {
            return false;
        }
        table.closed = true;
        true
    }

    /// Close the manager and abort every live session
    pub fn close_all(&self) {
        let sessions = {
            let mut table = self.table.lock();
            table.closed = true;
            std::mem::take(&mut table.sessions)
        };

        if !sessions.is_empty() {
            MUX_SESSIONS_ACTIVE
                .with_label_values(&[self.role.as_str()])
                .sub(sessions.len() as i64);
        }
        for session in sessions.into_values() {
            session.close_with_error();
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.lock();
        f.debug_struct("SessionManager")
            .field("role", &self.role)
            .field("size", &table.sessions.len())
            .field("count", &table.count)
            .field("closed", &table.closed)
            .finish()
    }
}
