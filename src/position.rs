//! Journal positions and the advance state machine.
//!
//! A [`Position`] describes where the next chunk lands: the accumulated
//! byte count of the current part, the directory-global part counter, and
//! the time-formatted directory. [`advance`] is a pure function from
//! `(position, chunk size, clock)` to the next position plus the side-effect
//! actions the upload pipeline must perform.

use bincode::{Decode, Encode};
use chrono::{DateTime, Utc};

use crate::config::Tuning;

/// Where the next chunk will be appended.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Position {
    /// Bytes accumulated in the current part.
    pub running_bytes: u64,
    /// Monotonic part counter within the directory.
    pub part_index: u64,
    /// Time-formatted directory prefix.
    pub directory: String,
}

impl Position {
    pub fn new(running_bytes: u64, part_index: u64, directory: impl Into<String>) -> Self {
        Self {
            running_bytes,
            part_index,
            directory: directory.into(),
        }
    }

    /// File number within the directory.
    pub fn file_number(&self, tuning: &Tuning) -> u64 {
        self.part_index / tuning.max_parts_per_file
    }

    /// First part index of the file containing this position.
    pub fn part_base(&self, tuning: &Tuning) -> u64 {
        self.part_index - self.part_index % tuning.max_parts_per_file
    }

    /// Identity of the file containing this position.
    pub fn file_id(&self, tuning: &Tuning) -> FileId {
        FileId {
            part_base: self.part_base(tuning),
            directory: self.directory.clone(),
        }
    }
}

/// Identity of one multipart object: the file's first part index plus the
/// directory. At most one active multipart upload exists per `FileId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileId {
    pub part_base: u64,
    pub directory: String,
}

impl FileId {
    /// Object-store key for this file.
    pub fn key(&self, id: &str, tuning: &Tuning) -> String {
        file_key(
            &self.directory,
            id,
            self.part_base / tuning.max_parts_per_file,
        )
    }
}

/// Object key of the form `{directory}/{id}-{file_number:06}.journal`.
pub fn file_key(directory: &str, id: &str, file_number: u64) -> String {
    format!("{directory}/{id}-{file_number:06}.journal")
}

/// 1-based part number local to the multipart upload.
pub fn wire_part_number(part_index: u64, tuning: &Tuning) -> i32 {
    (part_index % tuning.max_parts_per_file) as i32 + 1
}

/// Format the directory for a wall-clock instant.
pub fn format_directory(directory_format: &str, now: DateTime<Utc>) -> String {
    now.format(directory_format).to_string()
}

/// Literal characters before the first strftime code, used as the multipart
/// listing prefix during recovery.
pub fn listing_prefix(directory_format: &str) -> String {
    match directory_format.find('%') {
        Some(idx) => directory_format[..idx].to_string(),
        None => directory_format.to_string(),
    }
}

/// Planned work placed on the durable action queue.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum Action {
    /// Initialize a multipart upload for the file containing the position.
    Start(Position),
    /// Append a chunk to the part at the position.
    Conj {
        position: Position,
        entry_count: u64,
        bytes: Vec<u8>,
    },
    /// Upload the accumulated (non-final) part.
    Upload(Position),
    /// Finalize or abort the multipart upload for the file.
    End(Position),
    /// Enqueue an `End` for every live upload.
    Flush,
    /// Sentinel for tasks that failed to deserialize.
    Skip,
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Start(_) => "start",
            Action::Conj { .. } => "conj",
            Action::Upload(_) => "upload",
            Action::End(_) => "end",
            Action::Flush => "flush",
            Action::Skip => "skip",
        }
    }

    /// The position this action targets, when it carries one.
    pub fn position(&self) -> Option<&Position> {
        match self {
            Action::Start(position)
            | Action::Upload(position)
            | Action::End(position)
            | Action::Conj { position, .. } => Some(position),
            Action::Flush | Action::Skip => None,
        }
    }
}

/// Advance the position for a chunk of `chunk_size` bytes at instant `now`.
///
/// Returns the next position and the actions to enqueue. Rollover rules,
/// applied in order:
///
/// 1. directory change: end the current file, start a fresh one at part 0;
/// 2. part step: once a part exceeds the minimum size, the next chunk opens
///    the following part;
/// 3. file rollover: a part step landing on a multiple of the per-file part
///    limit ends the current file and starts the next;
/// 4. a part that has exceeded the minimum size is scheduled for upload.
pub fn advance(
    tuning: &Tuning,
    current: &Position,
    directory_format: &str,
    chunk_size: u64,
    now: DateTime<Utc>,
) -> (Position, Vec<Action>) {
    let directory = format_directory(directory_format, now);

    if directory != current.directory {
        let next = Position::new(chunk_size, 0, directory);
        let actions = vec![Action::End(current.clone()), Action::Start(next.clone())];
        return (next, actions);
    }

    let part_changed = current.running_bytes > tuning.min_part_size;
    let part_index = if part_changed {
        current.part_index + 1
    } else {
        current.part_index
    };
    let running_bytes = if part_changed {
        chunk_size
    } else {
        current.running_bytes + chunk_size
    };
    let next = Position::new(running_bytes, part_index, directory);

    let mut actions = Vec::new();
    if part_changed && part_index % tuning.max_parts_per_file == 0 {
        actions.push(Action::End(current.clone()));
        actions.push(Action::Start(next.clone()));
    }
    if running_bytes > tuning.min_part_size {
        actions.push(Action::Upload(next.clone()));
    }

    (next, actions)
}
