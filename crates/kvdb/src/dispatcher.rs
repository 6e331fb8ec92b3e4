//! A minimal single-threaded dispatcher ((added) spec §4.10): just enough
//! of the request/worker model from §5 to exercise cooperative scheduling
//! end-to-end in tests and the CLI. Not a production connection manager —
//! there is no network layer here, only the request queue and retry loop
//! the real one would also need.

use std::collections::VecDeque;

use kvdb_error::Result;
use kvdb_types::TxId;

use crate::database::{Database, TxOutcome};

/// One client request, matching the verb set `kvdb-cli` and the
/// integration tests drive the database through.
#[derive(Debug, Clone)]
pub enum Request {
    Begin,
    Get { tx_id: TxId, key: Vec<u8> },
    Set { tx_id: TxId, key: Vec<u8>, value: Vec<u8> },
    Delete { tx_id: TxId, key: Vec<u8> },
    Next { tx_id: TxId, key: Option<Vec<u8>> },
    Find { tx_id: TxId, key: Vec<u8> },
    Commit { tx_id: TxId },
    Rollback { tx_id: TxId },
}

/// A response echoing back what a request produced, or that its worker
/// was aborted out from under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Began(TxId),
    Value(Option<Vec<u8>>),
    Pair(Option<(Vec<u8>, Vec<u8>)>),
    Flank(Option<(Vec<u8>, Vec<u8>)>, Option<(Vec<u8>, Vec<u8>)>),
    Ok,
    Aborted { tx_id: TxId, reason: String },
    Error(String),
}

fn request_tx_id(request: &Request) -> Option<TxId> {
    match request {
        Request::Begin => None,
        Request::Get { tx_id, .. }
        | Request::Set { tx_id, .. }
        | Request::Delete { tx_id, .. }
        | Request::Next { tx_id, .. }
        | Request::Find { tx_id, .. }
        | Request::Commit { tx_id }
        | Request::Rollback { tx_id } => Some(*tx_id),
    }
}

/// Owns the database, an incoming request queue, and the requests whose
/// worker is currently blocked on a lock. `tick` is one dispatcher
/// iteration (spec §5): deliver one new request, then retry every
/// blocked worker once.
pub struct Dispatcher {
    pub db: Database,
    queue: VecDeque<Request>,
    blocked: Vec<Request>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Dispatcher {
            db,
            queue: VecDeque::new(),
            blocked: Vec::new(),
        }
    }

    /// Enqueue a request for a future `tick`.
    pub fn submit(&mut self, request: Request) {
        self.queue.push_back(request);
    }

    /// Advance one new request (if any) plus a retry pass over every
    /// blocked worker, returning whatever responses were produced.
    pub fn tick(&mut self) -> Result<Vec<Response>> {
        let mut responses = Vec::new();
        if let Some(request) = self.queue.pop_front() {
            self.run_or_block(request, &mut responses);
        }

        for request in std::mem::take(&mut self.blocked) {
            self.run_or_block(request, &mut responses);
        }
        Ok(responses)
    }

    fn run_or_block(&mut self, request: Request, responses: &mut Vec<Response>) {
        match self.run(request.clone()) {
            Ok(Some(resp)) => responses.push(resp),
            Ok(None) => self.blocked.push(request),
            Err(e) => responses.push(Response::Error(e.to_string())),
        }
    }

    /// Run the periodic deadlock-detection task (spec §5): break every
    /// cycle found, abort its victim, and drop the victim's still-blocked
    /// request (its future requests would fail against a closed
    /// transaction anyway).
    pub fn detect_deadlocks(&mut self) -> Result<Vec<Response>> {
        let victims = self.db.break_deadlocks()?;
        let mut responses = Vec::with_capacity(victims.len());
        for tx_id in victims {
            self.blocked.retain(|r| request_tx_id(r) != Some(tx_id));
            responses.push(Response::Aborted {
                tx_id,
                reason: "deadlock detected".to_string(),
            });
        }
        Ok(responses)
    }

    fn run(&mut self, request: Request) -> Result<Option<Response>> {
        Ok(Some(match request {
            Request::Begin => Response::Began(self.db.begin()),
            Request::Get { tx_id, key } => match self.db.get(tx_id, &key)? {
                TxOutcome::Done(v) => Response::Value(v),
                TxOutcome::Blocked => return Ok(None),
            },
            Request::Set { tx_id, key, value } => match self.db.set(tx_id, &key, &value)? {
                TxOutcome::Done(()) => Response::Ok,
                TxOutcome::Blocked => return Ok(None),
            },
            Request::Delete { tx_id, key } => match self.db.delete(tx_id, &key)? {
                TxOutcome::Done(()) => Response::Ok,
                TxOutcome::Blocked => return Ok(None),
            },
            Request::Next { tx_id, key } => match self.db.next(tx_id, key.as_deref())? {
                TxOutcome::Done(v) => Response::Pair(v),
                TxOutcome::Blocked => return Ok(None),
            },
            Request::Find { tx_id, key } => match self.db.find(tx_id, &key)? {
                TxOutcome::Done((prev, next)) => Response::Flank(prev, next),
                TxOutcome::Blocked => return Ok(None),
            },
            Request::Commit { tx_id } => {
                self.db.commit(tx_id)?;
                Response::Ok
            }
            Request::Rollback { tx_id } => {
                self.db.rollback(tx_id)?;
                Response::Ok
            }
        }))
    }
}
