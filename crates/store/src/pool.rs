//! A bounded pool of database sessions. Public store operations acquire a
//! session at entry, scoped so that every exit path returns it; when the
//! cap is reached, acquisition blocks up to the caller's deadline and then
//! fails with `TooManySessions`.

use crate::error::Error;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub(crate) struct Pool {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    path: PathBuf,
    cap: usize,
    state: Mutex<State>,
    cond: Condvar,
}

#[derive(Default, Debug)]
struct State {
    idle: Vec<Connection>,
    open: usize,
    closed: bool,
}

impl Pool {
    /// Open a pool over the database at `path`, holding at most `cap`
    /// live connections. One connection is opened eagerly so that an
    /// unusable database fails construction rather than the first
    /// operation.
    pub fn new(path: &Path, cap: usize) -> Result<Pool, Error> {
        let shared = Arc::new(Shared {
            path: path.to_path_buf(),
            cap: cap.max(1),
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        });
        let conn = open_connection(&shared.path)?;
        {
            let mut state = shared.state.lock().unwrap();
            state.idle.push(conn);
            state.open = 1;
        }
        Ok(Pool { shared })
    }

    /// Acquire a session, waiting until `deadline` for one to free up.
    pub fn acquire(&self, deadline: Instant) -> Result<Session, Error> {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if state.closed {
                return Err(Error::Closed);
            }
            if let Some(conn) = state.idle.pop() {
                return Ok(Session {
                    conn: Some(conn),
                    shared: Arc::clone(&self.shared),
                });
            }
            if state.open < self.shared.cap {
                state.open += 1;
                drop(state);
                match open_connection(&self.shared.path) {
                    Ok(conn) => {
                        return Ok(Session {
                            conn: Some(conn),
                            shared: Arc::clone(&self.shared),
                        })
                    }
                    Err(err) => {
                        let mut state = self.shared.state.lock().unwrap();
                        state.open -= 1;
                        self.shared.cond.notify_one();
                        return Err(err);
                    }
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::TooManySessions);
            }
            let (next, timeout) = self
                .shared
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = next;
            if timeout.timed_out() && state.idle.is_empty() && state.open >= self.shared.cap {
                return Err(Error::TooManySessions);
            }
        }
    }

    /// Close the pool: idle connections are dropped, waiters fail with
    /// `Closed`, and checked-out sessions drop their connections on
    /// release. Idempotent.
    pub fn close(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.closed = true;
        let idle = std::mem::take(&mut state.idle);
        state.open -= idle.len();
        drop(state);
        drop(idle);
        self.shared.cond.notify_all();
    }
}

fn open_connection(path: &Path) -> Result<Connection, Error> {
    let conn = Connection::open(path)?;
    // Concurrent starters and writers interleave via WAL plus a busy
    // timeout rather than failing on first contention.
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update(None, "journal_mode", "wal")?;
    conn.pragma_update(None, "synchronous", "normal")?;
    Ok(conn)
}

/// One checked-out database session. Derefs to the underlying connection
/// and returns it to the pool on drop.
#[derive(Debug)]
pub(crate) struct Session {
    conn: Option<Connection>,
    shared: Arc<Shared>,
}

impl std::ops::Deref for Session {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().unwrap()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let conn = self.conn.take().unwrap();
        let mut state = self.shared.state.lock().unwrap();
        if state.closed {
            state.open -= 1;
            drop(state);
            drop(conn);
        } else {
            state.idle.push(conn);
            drop(state);
        }
        self.shared.cond.notify_one();
    }
}
