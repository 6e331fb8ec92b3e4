//! Log record wire format (spec §6.1): ACT, CLR, COMMIT and CHECKPOINT
//! records, each a self-contained byte string handed to
//! [`kvdb_log::RecordLog::append_record`].

use kvdb_error::{KvError, Result};
use kvdb_pager::LoggedEvent;
use kvdb_types::{Lsn, Namespace, PageId, PageNo, TxId, UpdateType};

use crate::table::TxTableEntry;

const TAG_ACT: u8 = 0;
const TAG_CLR: u8 = 1;
const TAG_COMMIT: u8 = 2;
const TAG_CHECKPOINT: u8 = 3;

/// One record appended to the write-ahead log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// A forward action: the events a `doAct` call produced, plus enough
    /// to undo it (`undo_info`) and to chain backward (`prev_lsn`).
    Act {
        tx_id: TxId,
        prev_lsn: Lsn,
        undo_info: Vec<u8>,
        events: Vec<LoggedEvent>,
    },
    /// A compensation record written while undoing an ACT: re-applies the
    /// opposite events and records where undo should resume next.
    Clr {
        tx_id: TxId,
        prev_lsn: Lsn,
        undo_nxt_lsn: Lsn,
        events: Vec<LoggedEvent>,
    },
    /// A transaction's commit point.
    Commit { tx_id: TxId },
    /// A snapshot of the transaction table and dirty page table, written
    /// periodically to bound recovery and log length.
    Checkpoint {
        tt: Vec<(TxId, TxTableEntry)>,
        dpt: Vec<(PageId, Lsn)>,
    },
}

fn write_u24(out: &mut Vec<u8>, v: u32) {
    out.push((v >> 16) as u8);
    out.push((v >> 8) as u8);
    out.push(v as u8);
}

fn read_u24(bytes: &[u8]) -> u32 {
    (u32::from(bytes[0]) << 16) | (u32::from(bytes[1]) << 8) | u32::from(bytes[2])
}

fn write_u48(out: &mut Vec<u8>, v: u64) {
    for shift in (0..6).rev() {
        out.push((v >> (shift * 8)) as u8);
    }
}

fn read_u48(bytes: &[u8]) -> u64 {
    let mut v = 0u64;
    for &b in &bytes[..6] {
        v = (v << 8) | u64::from(b);
    }
    v
}

fn write_event(out: &mut Vec<u8>, ev: &LoggedEvent) {
    let mut body = Vec::with_capacity(8 + ev.event_bytes.len());
    body.push(ev.update_type.tag());
    body.push(ev.namespace.get());
    write_u48(&mut body, ev.page_no.get());
    body.extend_from_slice(&ev.event_bytes);
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
}

fn read_event(bytes: &[u8], pos: &mut usize) -> Result<LoggedEvent> {
    if *pos + 4 > bytes.len() {
        return Err(KvError::corrupt("truncated event length prefix"));
    }
    let len = u32::from_be_bytes(bytes[*pos..*pos + 4].try_into().unwrap()) as usize;
    *pos += 4;
    if *pos + len > bytes.len() {
        return Err(KvError::corrupt("truncated event body"));
    }
    let body = &bytes[*pos..*pos + len];
    *pos += len;
    if body.len() < 8 {
        return Err(KvError::corrupt("truncated event header"));
    }
    let update_type = UpdateType::from_tag(body[0])?;
    let namespace = Namespace::from(body[1]);
    let page_no = PageNo::new(read_u48(&body[2..8]))?;
    Ok(LoggedEvent {
        update_type,
        namespace,
        page_no,
        event_bytes: body[8..].to_vec(),
    })
}

fn write_events(out: &mut Vec<u8>, events: &[LoggedEvent]) {
    for ev in events {
        write_event(out, ev);
    }
}

fn read_events(bytes: &[u8], pos: &mut usize) -> Result<Vec<LoggedEvent>> {
    let mut events = Vec::new();
    while *pos < bytes.len() {
        events.push(read_event(bytes, pos)?);
    }
    Ok(events)
}

impl LogRecord {
    /// Encode this record to the byte string the log stores.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            LogRecord::Act {
                tx_id,
                prev_lsn,
                undo_info,
                events,
            } => {
                out.push(TAG_ACT);
                write_u24(&mut out, tx_id.get());
                write_u48(&mut out, prev_lsn.get());
                out.extend_from_slice(&(undo_info.len() as u32).to_be_bytes());
                out.extend_from_slice(undo_info);
                write_events(&mut out, events);
            }
            LogRecord::Clr {
                tx_id,
                prev_lsn,
                undo_nxt_lsn,
                events,
            } => {
                out.push(TAG_CLR);
                write_u24(&mut out, tx_id.get());
                write_u48(&mut out, prev_lsn.get());
                write_u48(&mut out, undo_nxt_lsn.get());
                write_events(&mut out, events);
            }
            LogRecord::Commit { tx_id } => {
                out.push(TAG_COMMIT);
                write_u24(&mut out, tx_id.get());
            }
            LogRecord::Checkpoint { tt, dpt } => {
                out.push(TAG_CHECKPOINT);
                write_u24(&mut out, tt.len() as u32);
                write_u24(&mut out, dpt.len() as u32);
                for (tx_id, entry) in tt {
                    write_u24(&mut out, tx_id.get());
                    write_u48(&mut out, entry.first_lsn.get());
                    write_u48(&mut out, entry.last_lsn.get());
                    write_u48(&mut out, entry.undo_nxt_lsn.get());
                }
                for (page_id, rec_lsn) in dpt {
                    out.push(page_id.namespace.get());
                    write_u48(&mut out, page_id.page_no.get());
                    write_u48(&mut out, rec_lsn.get());
                }
            }
        }
        out
    }

    /// Decode a record previously produced by [`serialize`](Self::serialize).
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let Some((&tag, rest)) = bytes.split_first() else {
            return Err(KvError::corrupt("empty log record"));
        };
        match tag {
            TAG_ACT => {
                if rest.len() < 3 + 6 + 4 {
                    return Err(KvError::corrupt("truncated ACT header"));
                }
                let tx_id = TxId::new(read_u24(&rest[0..3]))?;
                let prev_lsn = Lsn::new(read_u48(&rest[3..9]))?;
                let undo_len = u32::from_be_bytes(rest[9..13].try_into().unwrap()) as usize;
                let mut pos = 13;
                if rest.len() < pos + undo_len {
                    return Err(KvError::corrupt("truncated ACT undo info"));
                }
                let undo_info = rest[pos..pos + undo_len].to_vec();
                pos += undo_len;
                let events = read_events(rest, &mut pos)?;
                Ok(LogRecord::Act {
                    tx_id,
                    prev_lsn,
                    undo_info,
                    events,
                })
            }
            TAG_CLR => {
                if rest.len() < 3 + 6 + 6 {
                    return Err(KvError::corrupt("truncated CLR header"));
                }
                let tx_id = TxId::new(read_u24(&rest[0..3]))?;
                let prev_lsn = Lsn::new(read_u48(&rest[3..9]))?;
                let undo_nxt_lsn = Lsn::new(read_u48(&rest[9..15]))?;
                let mut pos = 15;
                let events = read_events(rest, &mut pos)?;
                Ok(LogRecord::Clr {
                    tx_id,
                    prev_lsn,
                    undo_nxt_lsn,
                    events,
                })
            }
            TAG_COMMIT => {
                if rest.len() < 3 {
                    return Err(KvError::corrupt("truncated COMMIT record"));
                }
                let tx_id = TxId::new(read_u24(&rest[0..3]))?;
                Ok(LogRecord::Commit { tx_id })
            }
            TAG_CHECKPOINT => {
                if rest.len() < 6 {
                    return Err(KvError::corrupt("truncated CHECKPOINT header"));
                }
                let tt_len = read_u24(&rest[0..3]) as usize;
                let dpt_len = read_u24(&rest[3..6]) as usize;
                let mut pos = 6;
                let mut tt = Vec::with_capacity(tt_len);
                for _ in 0..tt_len {
                    if rest.len() < pos + 21 {
                        return Err(KvError::corrupt("truncated checkpoint TT entry"));
                    }
                    let tx_id = TxId::new(read_u24(&rest[pos..pos + 3]))?;
                    let first_lsn = Lsn::new(read_u48(&rest[pos + 3..pos + 9]))?;
                    let last_lsn = Lsn::new(read_u48(&rest[pos + 9..pos + 15]))?;
                    let undo_nxt_lsn = Lsn::new(read_u48(&rest[pos + 15..pos + 21]))?;
                    pos += 21;
                    tt.push((
                        tx_id,
                        TxTableEntry {
                            first_lsn,
                            last_lsn,
                            undo_nxt_lsn,
                        },
                    ));
                }
                let mut dpt = Vec::with_capacity(dpt_len);
                for _ in 0..dpt_len {
                    if rest.len() < pos + 13 {
                        return Err(KvError::corrupt("truncated checkpoint DPT entry"));
                    }
                    let namespace = Namespace::from(rest[pos]);
                    let page_no = PageNo::new(read_u48(&rest[pos + 1..pos + 7]))?;
                    let rec_lsn = Lsn::new(read_u48(&rest[pos + 7..pos + 13]))?;
                    pos += 13;
                    dpt.push((PageId::new(namespace, page_no), rec_lsn));
                }
                Ok(LogRecord::Checkpoint { tt, dpt })
            }
            other => Err(KvError::corrupt(format!("bad log record tag {other}"))),
        }
    }
}
