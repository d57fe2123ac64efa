//! calltrap CLI - tools for working with call traces
//!
//! Commands:
//!   calltrap view <path>   - Print recorded call trees
//!   calltrap stats <path>  - Per-function call counts and durations
//!
//! `<path>` is a trace file (one event, an array, or one event per line) or a
//! directory of `*.json` trace files.

use std::path::{Path, PathBuf};

use anyhow::Context;
use calltrap::trace::{stats, Event, FuncStats};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Environment variable for the log filter.
const LOG_ENV: &str = "CALLTRAP_LOG";

#[derive(Parser)]
#[command(name = "calltrap")]
#[command(about = "Inspect call traces recorded by calltrap", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the recorded call trees
    View {
        /// Trace file or directory of trace files
        path: PathBuf,

        /// Only show calls up to this nesting depth
        #[arg(long, short = 'd')]
        depth: Option<usize>,

        /// Show argument and result snapshots
        #[arg(long, short = 'v')]
        values: bool,
    },
    /// Aggregate call counts and durations per function
    Stats {
        /// Trace file or directory of trace files
        path: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::View {
            path,
            depth,
            values,
        } => view_command(&path, depth, values),
        Commands::Stats { path, json } => stats_command(&path, json),
    }
}

fn view_command(path: &Path, depth: Option<usize>, values: bool) -> anyhow::Result<()> {
    let roots = load_events(path)?;
    let mut out = String::new();
    for root in &roots {
        render_tree(root, depth, values, &mut out);
    }
    print!("{}", out);
    Ok(())
}

fn stats_command(path: &Path, json: bool) -> anyhow::Result<()> {
    let roots = load_events(path)?;
    let stats = stats(&roots);
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print!("{}", format_stats(&stats));
    }
    Ok(())
}

/// Load every event from a file, or from each `*.json` file of a directory
/// in name order.
fn load_events(path: &Path) -> anyhow::Result<Vec<Event>> {
    if !path.is_dir() {
        return load_file(path);
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(path)
        .with_context(|| format!("Failed to read directory {}", path.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().map_or(false, |ext| ext == "json"))
        .collect();
    files.sort();

    let mut events = Vec::new();
    for file in files {
        events.extend(load_file(&file)?);
    }
    Ok(events)
}

fn load_file(path: &Path) -> anyhow::Result<Vec<Event>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Event::parse_all(&text).with_context(|| format!("Failed to parse trace {}", path.display()))
}

fn render_tree(root: &Event, max_depth: Option<usize>, values: bool, out: &mut String) {
    root.walk(&mut |event, depth| {
        if max_depth.map_or(false, |max| depth > max) {
            return;
        }
        let indent = "  ".repeat(depth);
        out.push_str(&format!(
            "{}{} ({}us)",
            indent,
            event.qualified_name(),
            event.duration_us()
        ));
        if let Some(error) = &event.error {
            out.push_str(&format!(" error: {}", error));
        }
        out.push('\n');
        if values {
            for (name, value) in event.args.iter().chain(event.results.iter()) {
                out.push_str(&format!("{}    {} = {}\n", indent, name, value));
            }
        }
    });
}

fn format_stats(stats: &[FuncStats]) -> String {
    let mut out = format!(
        "{:<40} {:>8} {:>8} {:>12} {:>10}\n",
        "function", "calls", "errors", "total(us)", "max(us)"
    );
    for s in stats {
        out.push_str(&format!(
            "{:<40} {:>8} {:>8} {:>12} {:>10}\n",
            format!("{}.{}", s.pkg, s.func),
            s.calls,
            s.errors,
            s.total_us,
            s.max_us
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use calltrap::Fields;

    fn event(func: &str, start_us: u64, end_us: u64, children: Vec<Event>) -> Event {
        Event {
            func: func.to_string(),
            pkg: "demo".to_string(),
            args: Fields::default(),
            results: Fields::default(),
            start_us,
            end_us,
            error: None,
            children,
        }
    }

    #[test]
    fn test_render_tree_respects_depth() {
        let root = event("a", 0, 10, vec![event("b", 1, 5, vec![event("c", 2, 3, vec![])])]);

        let mut out = String::new();
        render_tree(&root, None, false, &mut out);
        assert_eq!(out, "demo.a (10us)\n  demo.b (4us)\n    demo.c (1us)\n");

        let mut out = String::new();
        render_tree(&root, Some(1), false, &mut out);
        assert_eq!(out, "demo.a (10us)\n  demo.b (4us)\n");
    }

    #[test]
    fn test_load_events_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let a = serde_json::to_string(&event("a", 0, 1, vec![])).unwrap();
        let b = serde_json::to_string(&event("b", 0, 2, vec![])).unwrap();
        std::fs::write(dir.path().join("1.json"), a).unwrap();
        std::fs::write(dir.path().join("2.json"), b).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let events = load_events(dir.path()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].func, "b");

        let table = format_stats(&stats(&events));
        assert!(table.contains("demo.b"));
    }

    #[test]
    fn test_load_events_reports_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "not json").unwrap();
        let err = load_events(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse trace"));
    }
}
