//! Result sink, the single ordered output channel that every demo reports through.
//!
//! Lines are formatted with one policy: `[HH:MM:SS] [TAG] text`.

use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Local};
use tracing::{debug, warn};

/// Mechanism (or lifecycle event) a [`ResultLine`] originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Lifecycle banners (start & completion of a run)
    Debugger,
    /// Anonymous pipe demo
    Pipe,
    /// Shared memory demo
    Shm,
    /// Mutual exclusion demo
    Semaphore,
    /// TCP socket demo
    Socket,
    /// Forced termination of all workers
    Stopped,
}

impl Tag {
    /// Upper-case label used when rendering lines
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debugger => "DEBUGGER",
            Self::Pipe => "PIPE",
            Self::Shm => "SHM",
            Self::Semaphore => "SEMAPHORE",
            Self::Socket => "SOCKET",
            Self::Stopped => "STOPPED",
        }
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable, timestamped line of output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultLine {
    /// When the line was observed by the parent
    timestamp: DateTime<Local>,
    /// Where the line came from
    tag: Tag,
    /// Human-readable content
    text: String,
}

impl ResultLine {
    /// Create a new [`ResultLine`] stamped with the current local time
    pub fn new(tag: Tag, text: impl Into<String>) -> Self {
        Self::with_timestamp(Local::now(), tag, text)
    }

    /// Create a new [`ResultLine`] with an explicit timestamp
    pub fn with_timestamp(timestamp: DateTime<Local>, tag: Tag, text: impl Into<String>) -> Self {
        Self {
            timestamp,
            tag,
            text: text.into(),
        }
    }

    /// Retrieve the timestamp of the line
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    /// Retrieve the tag of the line
    #[must_use]
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Retrieve the text of the line
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }
}

impl std::fmt::Display for ResultLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] [{}] {}",
            self.timestamp.format("%H:%M:%S"),
            self.tag,
            self.text
        )
    }
}

/// Append-only destination for [`ResultLine`]s
///
/// Implementations must not block callers for more than a negligible duration.
pub trait ResultSink {
    /// Append a line
    fn append(&self, line: ResultLine);

    /// Discard every line appended so far
    fn clear(&self);

    /// Build a line stamped with the current time and append it
    fn report(&self, tag: Tag, text: String) {
        self.append(ResultLine::new(tag, text));
    }
}

/// Shared handle to a downstream sink (normally the presentation layer)
pub type SharedSink = Arc<dyn ResultSink + Send + Sync>;

/// Mutable part of a [`Session`]
#[derive(Debug, Default)]
struct SessionLog {
    /// Lines in observation order
    lines: Vec<ResultLine>,

    /// Whether a stop closed the session
    closed: bool,

    /// Whether the STOPPED banner of the closed session was accepted
    stop_reported: bool,
}

/// Ordered log of the lines produced by one orchestrator run
///
/// Cloning a [`Session`] produces another handle to the same log.
///
/// Once [`Session::close`] has been called, the only line still accepted is a single
/// [`Tag::Stopped`] banner, so that banner is always unique and always last.
#[derive(Clone, Default)]
pub struct Session {
    /// The log itself
    log: Arc<Mutex<SessionLog>>,

    /// Sink that receives a copy of every accepted line
    downstream: Option<SharedSink>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .field("has_downstream", &self.downstream.is_some())
            .finish()
    }
}

impl Session {
    /// Create an empty session with no downstream sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty session that forwards accepted lines to `downstream`
    #[must_use]
    pub fn with_downstream(downstream: SharedSink) -> Self {
        Self {
            log: Arc::default(),
            downstream: Some(downstream),
        }
    }

    /// Lock the log, recovering it if a previous holder panicked
    fn lock(&self) -> std::sync::MutexGuard<'_, SessionLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a fresh session: drop prior lines and re-open for appends
    pub fn open(&self) {
        let mut log = self.lock();
        log.lines.clear();
        log.closed = false;
        log.stop_reported = false;
        if let Some(downstream) = &self.downstream {
            downstream.clear();
        }
    }

    /// Close the session, after which only a single STOPPED banner is accepted
    pub fn close(&self) {
        self.lock().closed = true;
    }

    /// Whether the session has been closed by a stop
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Snapshot of the lines currently in the session
    #[must_use]
    pub fn lines(&self) -> Vec<ResultLine> {
        self.lock().lines.clone()
    }

    /// Number of lines currently in the session
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    /// Whether the session holds no lines
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResultSink for Session {
    fn append(&self, line: ResultLine) {
        let mut log = self.lock();
        if log.closed {
            if line.tag() != Tag::Stopped || log.stop_reported {
                debug!(tag = %line.tag(), text = line.text(), "dropping line appended after stop");
                return;
            }
            log.stop_reported = true;
        }
        // Forward while holding the lock so downstream order matches session order
        if let Some(downstream) = &self.downstream {
            downstream.append(line.clone());
        }
        log.lines.push(line);
    }

    fn clear(&self) {
        let mut log = self.lock();
        log.lines.clear();
        if let Some(downstream) = &self.downstream {
            downstream.clear();
        }
    }
}

/// Sink that renders each line onto a [`Write`]r, one line per entry
#[derive(Debug)]
pub struct WriterSink<W: Write + Send> {
    /// Destination of rendered lines
    writer: Mutex<W>,
}

impl WriterSink<std::io::Stdout> {
    /// Create a sink that prints to STDOUT
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> WriterSink<W> {
    /// Create a [`WriterSink`] over an arbitrary writer
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Retrieve the underlying writer
    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> ResultSink for WriterSink<W> {
    fn append(&self, line: ResultLine) {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(writer, "{line}").and_then(|()| writer.flush()) {
            warn!(error = %e, "failed to write result line");
        }
    }

    fn clear(&self) {
        // A stream cannot take lines back, readers see a fresh session start instead
        debug!("clear requested on writer sink");
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn lines_render_with_time_tag_and_text() {
        let at = Local.with_ymd_and_hms(2024, 3, 1, 9, 5, 7).unwrap();
        let line = ResultLine::with_timestamp(at, Tag::Shm, "Written: Shared Memory Data");
        assert_eq!(
            line.to_string(),
            "[09:05:07] [SHM] Written: Shared Memory Data"
        );
    }

    #[test]
    fn session_keeps_observation_order_and_clears() {
        let session = Session::new();
        session.report(Tag::Pipe, "first".into());
        session.report(Tag::Socket, "second".into());
        let texts: Vec<_> = session.lines().iter().map(|l| l.text().to_string()).collect();
        assert_eq!(texts, vec!["first", "second"]);

        session.clear();
        assert!(session.is_empty());
    }

    #[test]
    fn closed_session_accepts_exactly_one_stop_banner() {
        let session = Session::new();
        session.report(Tag::Pipe, "before stop".into());
        session.close();
        session.report(Tag::Semaphore, "late result".into());
        session.report(Tag::Stopped, "stopped".into());
        session.report(Tag::Stopped, "stopped again".into());
        session.report(Tag::Socket, "even later".into());

        let tags: Vec<_> = session.lines().iter().map(ResultLine::tag).collect();
        assert_eq!(tags, vec![Tag::Pipe, Tag::Stopped]);
    }

    #[test]
    fn clearing_a_closed_session_does_not_rearm_the_stop_banner() {
        let session = Session::new();
        session.close();
        session.report(Tag::Stopped, "stopped".into());
        session.clear();
        session.report(Tag::Stopped, "stopped again".into());
        assert!(session.is_empty());

        session.open();
        session.close();
        session.report(Tag::Stopped, "next run stopped".into());
        assert_eq!(session.len(), 1);
    }

    #[test]
    fn open_resets_a_closed_session() {
        let session = Session::new();
        session.report(Tag::Pipe, "old".into());
        session.close();
        session.open();
        assert!(!session.is_closed());
        assert!(session.is_empty());
        session.report(Tag::Pipe, "new".into());
        assert_eq!(session.len(), 1);
    }

    #[test]
    fn session_forwards_to_downstream() {
        let downstream = Arc::new(Session::new());
        let session = Session::with_downstream(downstream.clone());
        session.report(Tag::Debugger, "banner".into());
        assert_eq!(downstream.len(), 1);

        session.clear();
        assert!(downstream.is_empty());
    }

    #[test]
    fn writer_sink_writes_one_line_per_entry() {
        let sink = WriterSink::new(Vec::new());
        sink.report(Tag::Pipe, "a".into());
        sink.report(Tag::Socket, "b".into());
        let out = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[PIPE] a"));
        assert!(lines[1].ends_with("[SOCKET] b"));
    }
}
