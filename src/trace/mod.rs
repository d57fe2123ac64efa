//! Call tracing
//!
//! While tracing is enabled, every dispatched call opens an [`Event`] on the
//! current thread at entry and closes it when the call finishes, nested
//! under whichever event was open. Finished root events go to the configured
//! [`TraceOutput`].
//!
//! Calls made from inside interceptor callbacks are not traced.
//!
//! # Example
//!
//! ```ignore
//! calltrap::trace::enable();
//! run_workload();
//! calltrap::trace::disable();
//!
//! for root in calltrap::trace::take_roots() {
//!     println!("{}", serde_json::to_string_pretty(&root)?);
//! }
//! ```

mod config;
mod event;
mod marshal;

pub use config::{
    TraceConfig, TraceConfigError, TraceOutput, DEFAULT_MAX_DEPTH, MAX_DEPTH_ENV, OUTPUT_ENV,
};
pub use event::{stats, Event, FuncStats};
pub use marshal::{marshal_any_json, marshal_any_json_to, prune, to_json_value, MarshalError};

use std::cell::RefCell;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use calltrap_object::{json, Fields, Object, TrapError};

use crate::functab::FuncInfo;

static ENABLED: AtomicBool = AtomicBool::new(false);
static CONFIG: OnceLock<ArcSwap<TraceConfig>> = OnceLock::new();
static FILE_SEQ: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static OPEN: RefCell<Vec<Event>> = const { RefCell::new(Vec::new()) };
    static ROOTS: RefCell<Vec<Event>> = const { RefCell::new(Vec::new()) };
}

fn config_cell() -> &'static ArcSwap<TraceConfig> {
    CONFIG.get_or_init(|| ArcSwap::from_pointee(TraceConfig::default()))
}

/// The active trace configuration.
pub fn config() -> Arc<TraceConfig> {
    config_cell().load_full()
}

/// Turn tracing on with the configuration from the environment.
///
/// An invalid environment falls back to the defaults with a warning.
pub fn enable() {
    let config = TraceConfig::from_env().unwrap_or_else(|err| {
        tracing::warn!(error = %err, "ignoring trace environment");
        TraceConfig::default()
    });
    enable_with(config);
}

/// Turn tracing on with `config`.
pub fn enable_with(config: TraceConfig) {
    tracing::debug!(output = ?config.output, max_depth = config.max_depth, "tracing enabled");
    json::set_depth_limit(config.max_depth);
    config_cell().store(Arc::new(config));
    ENABLED.store(true, Ordering::Release);
}

/// Turn tracing off. Calls already in flight still close their events.
pub fn disable() {
    ENABLED.store(false, Ordering::Release);
}

pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Acquire)
}

/// Take the root events completed on this thread (memory output only).
pub fn take_roots() -> Vec<Event> {
    ROOTS
        .try_with(|roots| std::mem::take(&mut *roots.borrow_mut()))
        .unwrap_or_default()
}

/// Number of events currently open on this thread.
pub fn open_depth() -> usize {
    OPEN.try_with(|open| open.borrow().len()).unwrap_or(0)
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

fn snapshot(object: &Object<'_>, max_depth: usize) -> Fields {
    let mut fields = object.snapshot();
    // The snapshot map itself is one level.
    let limit = max_depth.saturating_sub(1);
    fields.map_values(|value| prune(value, limit));
    fields
}

// ============================================================================
// Spans
// ============================================================================

/// An event opened by the dispatcher and not yet closed.
pub(crate) struct Span {
    depth: usize,
    error: Option<String>,
}

impl Span {
    /// Open an event for `info`, snapshotting the receiver and arguments.
    pub(crate) fn begin(info: &FuncInfo, recv: &Object<'_>, args: &Object<'_>) -> Span {
        let max_depth = config().max_depth;
        let mut fields = snapshot(recv, max_depth);
        fields.0.extend(snapshot(args, max_depth).0);
        let event = Event {
            func: info.display_name().into_owned(),
            pkg: info.pkg().to_string(),
            args: fields,
            results: Fields::default(),
            start_us: now_us(),
            end_us: 0,
            error: None,
            children: Vec::new(),
        };
        let depth = OPEN
            .try_with(|open| {
                let mut open = open.borrow_mut();
                open.push(event);
                open.len() - 1
            })
            .unwrap_or(usize::MAX);
        Span { depth, error: None }
    }

    /// Remember the first interceptor error of the call.
    pub(crate) fn record_error(&mut self, err: &TrapError) {
        if self.error.is_none() {
            self.error = Some(err.to_string());
        }
    }

    /// Close the event with the final results.
    pub(crate) fn end(self, results: &Object<'_>) {
        let fields = snapshot(results, config().max_depth);
        close(self.depth, Some(fields), self.error);
    }

    /// Close the event without results, e.g. while unwinding.
    pub(crate) fn abandon(self, reason: &str) {
        close(self.depth, None, Some(self.error.unwrap_or_else(|| reason.to_string())));
    }
}

fn close(depth: usize, results: Option<Fields>, error: Option<String>) {
    let finished = OPEN
        .try_with(|open| {
            let mut open = open.borrow_mut();
            if depth >= open.len() {
                return None;
            }
            let end_us = now_us();
            // Events above ours were never closed; fold them into their parents.
            while open.len() > depth + 1 {
                let mut inner = open.pop()?;
                inner.end_us = end_us;
                inner.error.get_or_insert_with(|| "unfinished".to_string());
                open.last_mut()?.children.push(inner);
            }
            let mut event = open.pop()?;
            event.end_us = end_us;
            if let Some(results) = results {
                event.results = results;
            }
            event.error = error;
            match open.last_mut() {
                Some(parent) => {
                    parent.children.push(event);
                    None
                }
                None => Some(event),
            }
        })
        .ok()
        .flatten();

    if let Some(root) = finished {
        deliver(root);
    }
}

fn deliver(root: Event) {
    let config = config();
    match &config.output {
        TraceOutput::Memory => {
            let _ = ROOTS.try_with(|roots| roots.borrow_mut().push(root));
        }
        TraceOutput::Stdout => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            let written = serde_json::to_writer(&mut out, &root)
                .map_err(std::io::Error::from)
                .and_then(|()| writeln!(out));
            if let Err(err) = written {
                tracing::warn!(error = %err, func = %root.qualified_name(), "failed to write trace");
            }
        }
        TraceOutput::Dir(dir) => {
            if let Err(err) = write_to_dir(dir, &root) {
                tracing::warn!(
                    error = %err,
                    dir = %dir.display(),
                    func = %root.qualified_name(),
                    "failed to write trace file"
                );
            }
        }
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-' | '.' => c,
            _ => '_',
        })
        .collect()
}

fn write_to_dir(dir: &Path, root: &Event) -> Result<(), MarshalError> {
    fs::create_dir_all(dir)?;
    let seq = FILE_SEQ.fetch_add(1, Ordering::Relaxed);
    let file_name = format!("{}.{}-{}.json", sanitize(&root.pkg), sanitize(&root.func), seq);
    let path = dir.join(file_name);
    let mut writer = BufWriter::new(fs::File::create(&path)?);
    serde_json::to_writer_pretty(&mut writer, root)?;
    writer.flush()?;
    tracing::debug!(path = %path.display(), "trace written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use calltrap_object::Slot;

    use crate::functab::FuncIdentity;

    fn info(name: &'static str) -> FuncInfo {
        FuncInfo::builder(FuncIdentity::func("unit", name)).build()
    }

    #[test]
    fn test_spans_nest_into_a_tree() {
        let outer_info = info("outer");
        let inner_info = info("inner");
        let mut x = 3i32;
        let mut out: Option<i32> = None;

        let outer = Span::begin(&outer_info, &Object::nil(), &Object::args(vec![Slot::value(&mut x)]));
        let inner = Span::begin(&inner_info, &Object::nil(), &Object::args(vec![]));
        assert_eq!(open_depth(), 2);
        inner.end(&Object::results(vec![]));
        out.replace(9);
        outer.end(&Object::results(vec![Slot::result(&mut out)]));
        assert_eq!(open_depth(), 0);

        let roots = take_roots();
        assert_eq!(roots.len(), 1);
        let root = &roots[0];
        assert_eq!(root.func, "outer");
        assert_eq!(root.args.get("_a0"), Some(&serde_json::json!(3)));
        assert_eq!(root.results.get("_r0"), Some(&serde_json::json!(9)));
        assert_eq!(root.children.len(), 1);
        assert_eq!(root.children[0].func, "inner");
    }

    #[test]
    fn test_abandoned_span_records_reason() {
        let f = info("explodes");
        let mut span = Span::begin(&f, &Object::nil(), &Object::args(vec![]));
        span.record_error(&TrapError::msg("first"));
        span.record_error(&TrapError::msg("second"));
        span.abandon("panicked");

        let roots = take_roots();
        assert_eq!(roots[0].error.as_deref(), Some("first"));
    }

    #[test]
    fn test_unclosed_inner_events_fold_into_parent() {
        let outer_info = info("parent");
        let inner_info = info("leaked");
        let outer = Span::begin(&outer_info, &Object::nil(), &Object::args(vec![]));
        let _never_closed = Span::begin(&inner_info, &Object::nil(), &Object::args(vec![]));
        outer.end(&Object::results(vec![]));
        assert_eq!(open_depth(), 0);

        let roots = take_roots();
        assert_eq!(roots[0].children[0].error.as_deref(), Some("unfinished"));
    }

    #[test]
    fn test_sanitize_file_names() {
        assert_eq!(sanitize("github.com/x/y"), "github.com_x_y");
        assert_eq!(sanitize("Counter.get"), "Counter.get");
    }
}
