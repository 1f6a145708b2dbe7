use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use clap::Parser;
use glimpse_contracts::analysis::{ScreenAnalysis, StoredResult};
use glimpse_contracts::cache::atomic_write_text;
use glimpse_engine::{AnalyzeRequest, Analyzer, EngineConfig};
use serde_json::json;

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

#[derive(Debug, Parser)]
#[command(
    name = "glimpse",
    version,
    about = "Analyze recent screenshots with a local vision model, with caching"
)]
struct Cli {
    /// Image file, directory, or a bare number meaning "latest N screenshots"
    target: Option<String>,

    /// How many of the most recent images to analyze
    count: Option<usize>,

    /// Model identifier override (falls back to GLIMPSE_MODEL, then the
    /// engine default)
    #[arg(long)]
    model: Option<String>,

    /// Explicit context window override
    #[arg(long)]
    ctx: Option<u32>,

    /// Bypass the cache and force a fresh backend run
    #[arg(long = "new")]
    force_new: bool,

    /// Use the high-quality scale ladder (fewer, larger attempts)
    #[arg(long)]
    quality: bool,

    /// Where cache, mirror and diagnostics live
    /// (default: GLIMPSE_STATE_DIR, then ~/.glimpse)
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("glimpse error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let (target, count) = normalize_target(cli.target, cli.count);

    let images = select_images(target.as_deref(), count)?;
    if images.is_empty() {
        bail!("no images found to analyze");
    }
    println!("[glimpse] analyzing {} image(s):", images.len());
    for path in &images {
        println!("  {}", path.display());
    }

    let state_dir = resolve_state_dir(cli.state_dir);
    let analyzer = Analyzer::new(EngineConfig::from_env(), &state_dir);

    let request = AnalyzeRequest {
        prompt: build_prompt(images.len()),
        image_paths: images,
        model: cli.model.or_else(|| non_empty_env("GLIMPSE_MODEL")),
        context: cli.ctx,
        quality: cli.quality,
        force_new: cli.force_new,
    };
    let outcome = analyzer
        .analyze(&request)
        .context("screenshot analysis failed")?;

    if let Err(err) = write_last_result(&state_dir, &outcome.result) {
        eprintln!("[glimpse] warning: could not record last result: {err:#}");
    }

    if outcome.cached {
        println!("[glimpse] (cached result)");
    }
    println!("{}", render_result(&outcome.result));
    Ok(0)
}

/// `glimpse 3` means "latest three screenshots", not a path named `3`.
fn normalize_target(target: Option<String>, count: Option<usize>) -> (Option<String>, Option<usize>) {
    match (&target, count) {
        (Some(raw), None) => match raw.parse::<usize>() {
            Ok(parsed) => (None, Some(parsed)),
            Err(_) => (target, None),
        },
        _ => (target, count),
    }
}

fn select_images(target: Option<&str>, count: Option<usize>) -> Result<Vec<PathBuf>> {
    if let Some(raw) = target {
        let path = PathBuf::from(raw);
        if path.is_dir() {
            return pick_latest_images(&path, count.unwrap_or(5));
        }
        if !path.is_file() {
            bail!("{} is neither a file nor a directory", path.display());
        }
        return Ok(vec![path]);
    }
    let dir = screenshot_dir()?;
    pick_latest_images(&dir, count.unwrap_or(1))
}

fn screenshot_dir() -> Result<PathBuf> {
    let raw = non_empty_env("GLIMPSE_SCREENSHOT_DIR")
        .context("GLIMPSE_SCREENSHOT_DIR is not set; pass a file or directory instead")?;
    let dir = PathBuf::from(raw);
    if !dir.is_dir() {
        bail!("screenshot directory {} does not exist", dir.display());
    }
    Ok(dir)
}

/// The `n` most recently modified images in `dir`, newest first.
fn pick_latest_images(dir: &Path, n: usize) -> Result<Vec<PathBuf>> {
    let mut entries: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()));
        if !is_image {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        entries.push((mtime, path));
    }
    entries.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(entries.into_iter().take(n).map(|(_, path)| path).collect())
}

fn resolve_state_dir(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| non_empty_env("GLIMPSE_STATE_DIR").map(PathBuf::from))
        .unwrap_or_else(|| {
            let home = non_empty_env("HOME").unwrap_or_else(|| ".".to_string());
            PathBuf::from(home).join(".glimpse")
        })
}

fn build_prompt(image_count: usize) -> String {
    format!(
        "You are an expert UI/UX developer and QA engineer.\n\
         \n\
         Analyze the provided {image_count} screenshot(s).\n\
         \n\
         Your goal:\n\
         1. Summarize what is shown.\n\
         2. Identify specific UI elements.\n\
         3. Detect any errors, visual glitches, or weird states.\n\
         4. Suggest what a developer should check next.\n\
         \n\
         Constraint: return ONLY valid JSON matching this schema:\n\
         {{\n\
           \"summary\": \"string\",\n\
           \"ui_elements\": [{{\"name\": \"string\", \"description\": \"string\", \"status\": \"visible|hidden|disabled\"}}],\n\
           \"detected_text\": [\"string\"],\n\
           \"issues\": [{{\"title\": \"string\", \"severity\": \"low|medium|high|critical\", \"description\": \"string\", \"recommendation\": \"string\"}}],\n\
           \"next_checks\": [\"string\"]\n\
         }}"
    )
}

fn write_last_result(state_dir: &Path, result: &StoredResult) -> Result<()> {
    let payload = match result {
        StoredResult::Structured(analysis) => serde_json::to_string_pretty(analysis)?,
        StoredResult::Raw(text) => serde_json::to_string_pretty(&json!({ "raw_output": text }))?,
    };
    atomic_write_text(&state_dir.join("last.json"), &payload)
}

fn render_result(result: &StoredResult) -> String {
    match result {
        StoredResult::Structured(analysis) => render_analysis(analysis),
        StoredResult::Raw(text) => format!(
            "(model output did not parse as JSON; raw answer below)\n\n{text}"
        ),
    }
}

fn render_analysis(analysis: &ScreenAnalysis) -> String {
    let mut out = Vec::new();
    out.push(format!("\n> Summary\n  {}", analysis.summary));

    if !analysis.issues.is_empty() {
        out.push("\n> Issues".to_string());
        for issue in &analysis.issues {
            out.push(format!("  * {} [{}]", issue.title, issue.severity));
            if !issue.description.is_empty() {
                out.push(format!("    {}", issue.description));
            }
            if !issue.recommendation.is_empty() {
                out.push(format!("    -> {}", issue.recommendation));
            }
        }
    }

    if !analysis.ui_elements.is_empty() {
        out.push("\n> UI elements".to_string());
        for element in &analysis.ui_elements {
            out.push(format!("  * {}: {}", element.name, element.description));
        }
    }

    if !analysis.next_checks.is_empty() {
        out.push("\n> Next checks".to_string());
        for check in &analysis.next_checks {
            out.push(format!("  - {check}"));
        }
    }

    out.join("\n")
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::thread;
    use std::time::Duration;

    use glimpse_contracts::analysis::{Issue, ScreenAnalysis};

    use super::{normalize_target, pick_latest_images, render_analysis};

    #[test]
    fn bare_number_target_becomes_count() {
        assert_eq!(normalize_target(Some("3".to_string()), None), (None, Some(3)));
        assert_eq!(
            normalize_target(Some("shot.png".to_string()), None),
            (Some("shot.png".to_string()), None)
        );
        assert_eq!(
            normalize_target(Some("5".to_string()), Some(2)),
            (Some("5".to_string()), Some(2))
        );
    }

    #[test]
    fn latest_images_are_newest_first_and_filtered() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        for name in ["a.png", "notes.txt", "b.jpg", "c.webp"] {
            fs::write(temp.path().join(name), b"data")?;
            thread::sleep(Duration::from_millis(10));
        }

        let picked = pick_latest_images(temp.path(), 2)?;
        let names: Vec<String> = picked
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["c.webp".to_string(), "b.jpg".to_string()]);
        Ok(())
    }

    #[test]
    fn render_includes_issues_and_severity() {
        let analysis = ScreenAnalysis {
            summary: "login form with an error banner".to_string(),
            issues: vec![Issue {
                title: "misaligned button".to_string(),
                severity: "high".to_string(),
                description: "submit button overflows its container".to_string(),
                recommendation: "check the flex layout".to_string(),
            }],
            ..ScreenAnalysis::default()
        };
        let rendered = render_analysis(&analysis);
        assert!(rendered.contains("login form with an error banner"));
        assert!(rendered.contains("misaligned button [high]"));
        assert!(rendered.contains("-> check the flex layout"));
    }
}
