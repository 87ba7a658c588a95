//! Reconciliation channel codec.
//!
//! A shard travels as one or more entry frames followed by a single end frame:
//!
//! ```text
//! entries: [key u32][count u32] count * ([len u32][key][len u32][value])
//! end:     [key u32][0xFFFF_FFFF][sequence u64][total u32]
//! ```
//!
//! `total` is the number of entries sent across all entry frames of the shard, so a
//! receiver can tell a lost frame from a complete transfer.

use super::error::CodecError;
use super::wire::{Reader, len_u32, put_bytes, put_u32, put_u64};
use crate::map::types::Entry;
use crate::strategy::concurrency::ConcurrencyKey;

const END_OF_SHARD: u32 = u32::MAX;

/// Point-in-time contents of one lane, as produced by the active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSnapshot {
    pub key: ConcurrencyKey,
    /// Lane sequence at the moment the snapshot was taken.
    pub sequence: u64,
    pub entries: Vec<Entry>,
}

/// One decoded reconciliation frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncFrame {
    Entries {
        key: ConcurrencyKey,
        entries: Vec<Entry>,
    },
    End {
        key: ConcurrencyKey,
        sequence: u64,
        total: u32,
    },
}

impl SyncFrame {
    pub fn key(&self) -> ConcurrencyKey {
        match self {
            SyncFrame::Entries { key, .. } | SyncFrame::End { key, .. } => *key,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconciliationCodec {
    chunk_entries: usize,
    chunk_bytes: usize,
}

impl ReconciliationCodec {
    /// Frames hold at most `chunk_entries` entries and stop growing once they pass
    /// `chunk_bytes`. A single oversized entry still gets a frame of its own.
    pub fn new(chunk_entries: usize, chunk_bytes: usize) -> Self {
        Self {
            chunk_entries: chunk_entries.max(1),
            chunk_bytes: chunk_bytes.max(1),
        }
    }

    pub fn encode_frame(&self, frame: &SyncFrame) -> Result<Vec<u8>, CodecError> {
        match frame {
            SyncFrame::Entries { key, entries } => encode_entries(*key, entries),
            SyncFrame::End {
                key,
                sequence,
                total,
            } => {
                let mut buf = Vec::with_capacity(20);
                put_u32(&mut buf, key.0);
                put_u32(&mut buf, END_OF_SHARD);
                put_u64(&mut buf, *sequence);
                put_u32(&mut buf, *total);
                Ok(buf)
            }
        }
    }

    pub fn decode_frame(&self, bytes: &[u8]) -> Result<SyncFrame, CodecError> {
        let mut reader = Reader::new(bytes);
        let key = ConcurrencyKey(reader.u32()?);
        let count = reader.u32()?;
        let frame = if count == END_OF_SHARD {
            SyncFrame::End {
                key,
                sequence: reader.u64()?,
                total: reader.u32()?,
            }
        } else {
            let count = count as usize;
            let mut entries = Vec::with_capacity(count.min(reader.remaining() / 8));
            for _ in 0..count {
                let key = reader.bytes()?;
                let value = reader.bytes()?;
                entries.push(Entry { key, value });
            }
            SyncFrame::Entries { key, entries }
        };
        reader.finish()?;
        Ok(frame)
    }

    /// Lazily encodes `snapshot` into frames. Always yields at least one entry frame
    /// (possibly empty) and ends with the end-of-shard frame.
    pub fn frames<'a>(&self, snapshot: &'a ShardSnapshot) -> ShardFrames<'a> {
        ShardFrames {
            codec: *self,
            snapshot,
            next: 0,
            started: false,
            done: false,
        }
    }
}

fn encode_entries(key: ConcurrencyKey, entries: &[Entry]) -> Result<Vec<u8>, CodecError> {
    let size: usize = entries.iter().map(Entry::encoded_len).sum();
    let mut buf = Vec::with_capacity(8 + size);
    put_u32(&mut buf, key.0);
    put_u32(&mut buf, len_u32(entries.len())?);
    for entry in entries {
        put_bytes(&mut buf, &entry.key)?;
        put_bytes(&mut buf, &entry.value)?;
    }
    Ok(buf)
}

/// Iterator over the encoded frames of one shard.
pub struct ShardFrames<'a> {
    codec: ReconciliationCodec,
    snapshot: &'a ShardSnapshot,
    next: usize,
    started: bool,
    done: bool,
}

impl Iterator for ShardFrames<'_> {
    type Item = Result<Vec<u8>, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let entries = &self.snapshot.entries;

        if self.next < entries.len() || !self.started {
            self.started = true;
            let start = self.next;
            let mut bytes = 0usize;
            while self.next < entries.len()
                && self.next - start < self.codec.chunk_entries
                && (self.next == start || bytes < self.codec.chunk_bytes)
            {
                bytes += entries[self.next].encoded_len();
                self.next += 1;
            }
            return Some(encode_entries(self.snapshot.key, &entries[start..self.next]));
        }

        self.done = true;
        let total = match len_u32(entries.len()) {
            Ok(total) => total,
            Err(e) => return Some(Err(e)),
        };
        Some(self.codec.encode_frame(&SyncFrame::End {
            key: self.snapshot.key,
            sequence: self.snapshot.sequence,
            total,
        }))
    }
}

/// Receiver-side accumulator for one shard transfer.
///
/// Entries are staged until the end frame arrives; only then is the shard handed out
/// as a complete [`ShardSnapshot`].
#[derive(Debug)]
pub struct ShardAssembler {
    key: ConcurrencyKey,
    staged: Vec<Entry>,
}

impl ShardAssembler {
    pub fn new(key: ConcurrencyKey) -> Self {
        Self {
            key,
            staged: Vec::new(),
        }
    }

    pub fn key(&self) -> ConcurrencyKey {
        self.key
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Feeds one frame. Returns the finished snapshot on the end frame.
    pub fn accept(&mut self, frame: SyncFrame) -> Result<Option<ShardSnapshot>, CodecError> {
        if frame.key() != self.key {
            return Err(CodecError::InvalidField {
                field: "concurrency key",
                reason: format!("frame for {} fed to assembler for {}", frame.key(), self.key),
            });
        }
        match frame {
            SyncFrame::Entries { entries, .. } => {
                self.staged.extend(entries);
                Ok(None)
            }
            SyncFrame::End {
                sequence, total, ..
            } => {
                if total as usize != self.staged.len() {
                    return Err(CodecError::IncompleteShard {
                        key: self.key.0,
                        expected: total,
                        received: self.staged.len(),
                    });
                }
                Ok(Some(ShardSnapshot {
                    key: self.key,
                    sequence,
                    entries: std::mem::take(&mut self.staged),
                }))
            }
        }
    }
}
