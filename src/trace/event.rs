//! Trace events and per-function statistics.

use std::collections::HashMap;

use calltrap_object::Fields;
use serde::{Deserialize, Serialize};

/// One recorded call: its inputs, outputs, timing and nested calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Function name without the package, e.g. `add` or `Counter.get`.
    pub func: String,
    pub pkg: String,
    /// Receiver (as `_recv`) and arguments at entry.
    pub args: Fields,
    /// Results when the call returned; `_r0`, `_r1`, ... unless named.
    pub results: Fields,
    pub start_us: u64,
    pub end_us: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub children: Vec<Event>,
}

impl Event {
    pub fn duration_us(&self) -> u64 {
        self.end_us.saturating_sub(self.start_us)
    }

    /// `pkg.func`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.pkg, self.func)
    }

    /// Visit this event and all descendants depth-first, with their depth.
    pub fn walk<'e>(&'e self, visit: &mut impl FnMut(&'e Event, usize)) {
        self.walk_at(0, visit);
    }

    fn walk_at<'e>(&'e self, depth: usize, visit: &mut impl FnMut(&'e Event, usize)) {
        visit(self, depth);
        for child in &self.children {
            child.walk_at(depth + 1, visit);
        }
    }

    /// Parse a trace document: a single event, a JSON array of events, or a
    /// stream of events (one per line as written to stdout).
    pub fn parse_all(input: &str) -> Result<Vec<Event>, serde_json::Error> {
        let mut events = Vec::new();
        for document in serde_json::Deserializer::from_str(input).into_iter::<serde_json::Value>() {
            match document? {
                serde_json::Value::Array(items) => {
                    for item in items {
                        events.push(serde_json::from_value(item)?);
                    }
                }
                other => events.push(serde_json::from_value(other)?),
            }
        }
        Ok(events)
    }
}

/// Aggregated numbers for one function across a set of trace trees.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FuncStats {
    pub pkg: String,
    pub func: String,
    pub calls: u64,
    pub errors: u64,
    pub total_us: u64,
    pub max_us: u64,
}

/// Per-function statistics over `roots` and all their descendants, ordered
/// by total time (descending), then by name.
pub fn stats<'e>(roots: impl IntoIterator<Item = &'e Event>) -> Vec<FuncStats> {
    let mut by_func: HashMap<(&'e str, &'e str), FuncStats> = HashMap::new();
    for root in roots {
        root.walk(&mut |event: &'e Event, _depth| {
            let entry = by_func
                .entry((event.pkg.as_str(), event.func.as_str()))
                .or_insert_with(|| FuncStats {
                    pkg: event.pkg.clone(),
                    func: event.func.clone(),
                    ..FuncStats::default()
                });
            let duration = event.duration_us();
            entry.calls += 1;
            entry.total_us += duration;
            entry.max_us = entry.max_us.max(duration);
            if event.error.is_some() {
                entry.errors += 1;
            }
        });
    }
    let mut stats: Vec<FuncStats> = by_func.into_values().collect();
    stats.sort_by(|a, b| {
        b.total_us
            .cmp(&a.total_us)
            .then_with(|| (&a.pkg, &a.func).cmp(&(&b.pkg, &b.func)))
    });
    stats
}
