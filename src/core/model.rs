use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Sentinel used while the length of the remote resource is unknown.
pub const CONTENT_LENGTH_NOT_FOUND: i64 = -1;

/// File name prefix of the per-segment temp files.
pub const PART_PREFIX: &str = "part-";

/// Shared, lockable record. The mutex is the per-record lock: every mutation
/// of completed bytes, status or content length happens while holding it.
pub type RecordHandle = Arc<parking_lot::Mutex<DownloadRecord>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Status {
    Stopped,
    Wait,
    Running,
    Pausing,
    Paused,
    Failed,
    Finished,
    Deleted,
}

impl Status {
    pub fn is_running(self) -> bool {
        self >= Status::Wait && self <= Status::Running
    }

    pub fn is_canceled(self) -> bool {
        self >= Status::Pausing && self <= Status::Paused
    }

    /// In-flight statuses: anything strictly between STOPPED and FAILED.
    pub fn should_stop(self) -> bool {
        self > Status::Stopped && self < Status::Failed
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Stopped | Status::Paused | Status::Failed | Status::Finished | Status::Deleted
        )
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Status::Stopped => 0,
            Status::Wait => 1,
            Status::Running => 2,
            Status::Pausing => 3,
            Status::Paused => 4,
            Status::Failed => 5,
            Status::Finished => 6,
            Status::Deleted => 7,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => Status::Wait,
            2 => Status::Running,
            3 => Status::Pausing,
            4 => Status::Paused,
            5 => Status::Failed,
            6 => Status::Finished,
            7 => Status::Deleted,
            _ => Status::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NetworkUnavailable,
    ContentLengthNotFound,
    UsableSpaceNotEnough,
    FileNotFound,
    UnknownServerError,
    AlreadyExists,
    DownloadFailed,
}

impl ErrorCode {
    pub fn as_i64(self) -> i64 {
        match self {
            ErrorCode::NetworkUnavailable => 1001,
            ErrorCode::ContentLengthNotFound => 1002,
            ErrorCode::UsableSpaceNotEnough => 1003,
            ErrorCode::FileNotFound => 1004,
            ErrorCode::UnknownServerError => 1005,
            ErrorCode::AlreadyExists => 1006,
            ErrorCode::DownloadFailed => 1007,
        }
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            1001 => Some(ErrorCode::NetworkUnavailable),
            1002 => Some(ErrorCode::ContentLengthNotFound),
            1003 => Some(ErrorCode::UsableSpaceNotEnough),
            1004 => Some(ErrorCode::FileNotFound),
            1005 => Some(ErrorCode::UnknownServerError),
            1006 => Some(ErrorCode::AlreadyExists),
            1007 => Some(ErrorCode::DownloadFailed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::NetworkUnavailable => "network unavailable",
            ErrorCode::ContentLengthNotFound => "content length not found",
            ErrorCode::UsableSpaceNotEnough => "usable space not enough",
            ErrorCode::FileNotFound => "file not found on server",
            ErrorCode::UnknownServerError => "unknown server error",
            ErrorCode::AlreadyExists => "file already exists",
            ErrorCode::DownloadFailed => "download failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct DownloadRecord {
    pub id: String,
    pub url: String,
    pub file_path: PathBuf,
    pub tag: String,
    pub thread_num: usize,
    pub content_length: i64,
    pub completed_size: u64,
    pub finished: bool,
    pub progress: u8,
    pub speed: String,
    pub status: Status,
    pub error_code: Option<ErrorCode>,
    pub create_time: i64,
    pub md5: Option<String>,
    pub chunked: bool,
    pub disable_resume: bool,
    pub extra: Option<String>,
    /// Set by `stop`; lives only for this process run and is never persisted.
    pub resume_blocked: bool,
}

impl DownloadRecord {
    pub fn new(url: &str, file_path: &Path, create_time: i64) -> Self {
        Self {
            id: record_id(url, file_path),
            url: url.to_string(),
            file_path: file_path.to_path_buf(),
            tag: String::new(),
            thread_num: 1,
            content_length: CONTENT_LENGTH_NOT_FOUND,
            completed_size: 0,
            finished: false,
            progress: 0,
            speed: String::new(),
            status: Status::Stopped,
            error_code: None,
            create_time,
            md5: None,
            chunked: false,
            disable_resume: false,
            extra: None,
            resume_blocked: false,
        }
    }

    pub fn name(&self) -> String {
        self.file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// `<dir>/.<file name>.parts`, holding one `part-<index>` file per segment.
    pub fn temp_dir(&self) -> PathBuf {
        let dir = self.file_path.parent().unwrap_or_else(|| Path::new("."));
        dir.join(format!(".{}.parts", self.name()))
    }

    pub fn part_path(&self, index: usize) -> PathBuf {
        self.temp_dir().join(format!("{PART_PREFIX}{index}"))
    }

    pub fn resume_disabled(&self) -> bool {
        self.disable_resume || self.resume_blocked
    }

    pub fn calculate_progress(&mut self) {
        self.progress = if self.content_length > 0 {
            let done = self.completed_size.min(self.content_length as u64);
            (done * 100 / self.content_length as u64) as u8
        } else {
            0
        };
    }
}

/// Stable id for a (url, path) pair, identical across process restarts.
pub fn record_id(url: &str, file_path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update([0u8]);
    hasher.update(file_path.to_string_lossy().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}

/// ETag / Last-Modified pair kept per record id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheValidator {
    pub id: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl CacheValidator {
    pub fn from_headers(id: &str, etag: Option<&str>, last_modified: Option<&str>) -> Option<Self> {
        let etag = etag.filter(|v| !v.is_empty()).map(str::to_string);
        let last_modified = last_modified.filter(|v| !v.is_empty()).map(str::to_string);
        if etag.is_none() && last_modified.is_none() {
            return None;
        }
        Some(Self { id: id.to_string(), etag, last_modified })
    }

    /// Value for `If-Range`: the entity tag when known, the date otherwise.
    pub fn if_range_value(&self) -> Option<&str> {
        self.etag.as_deref().or(self.last_modified.as_deref())
    }
}

/// Byte range of one segment. `end` is inclusive; `None` means "to the end of
/// the resource" and is used for the last (or only) segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRange {
    pub index: usize,
    pub start: u64,
    pub end: Option<u64>,
}

impl SegmentRange {
    /// Number of bytes this segment must hold, when it can be known.
    pub fn len(&self, content_length: i64) -> Option<u64> {
        match self.end {
            Some(end) => Some(end + 1 - self.start),
            None if content_length >= 0 => Some((content_length as u64).saturating_sub(self.start)),
            None => None,
        }
    }
}
