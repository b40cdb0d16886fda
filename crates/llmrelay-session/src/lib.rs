//! Session recording, discovery, and cleanup (§4.H): append-only JSONL
//! with a PID sidecar lock, directory scan with header-only reads, first-
//! message preview extraction, and a stale-lock sweep.

pub mod cleanup;
pub mod discovery;
pub mod lock;
pub mod recorder;
pub mod types;

pub use cleanup::{cleanup_stale_locks, should_delete_session, CleanupAction};
pub use discovery::{
    has_content_events, list_sessions, list_sessions_detailed, read_first_user_message,
    resolve_session_ref, ResolveError,
};
pub use lock::{is_pid_alive, lock_path_for, read_lock_pid, SessionLock};
pub use recorder::{session_file_path, Recorder, RecorderError};
pub use types::{ContentPayload, SessionRecordLine, SessionStartPayload, SessionSummary};
