//! Lower command - closure and iterator lowering over serialized modules

use anyhow::{anyhow, Context, Result};
use cinder_ir::{print_module, Module};
use cinder_lower::subst::qualified_name;
use cinder_lower::{normalize_module, LowerError, LowerOptions, NormalizedMethod};
use clap::{Args, ValueEnum};
use console::Style;
use similar::{ChangeTag, TextDiff};
use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::Config;
use crate::OutputFormat;

#[derive(Args, Debug)]
pub struct LowerArgs {
    /// Module JSON file or directory of them
    #[arg(default_value = ".")]
    pub input: PathBuf,

    /// Representation of the lowered module
    #[arg(long, value_enum, default_value = "text")]
    pub emit: Emit,

    /// Print a diff between the input and lowered modules instead
    #[arg(long)]
    pub diff: bool,

    /// Configuration file (default: cinder.toml next to the input)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Cache delegates to capture-free anonymous functions in static fields
    #[arg(long)]
    pub cache_delegates: bool,

    /// Leave methods containing `yield` for a later stage
    #[arg(long)]
    pub keep_iterators: bool,

    /// Write lowered modules into this directory instead of printing them
    #[arg(short, long)]
    pub out_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Emit {
    #[default]
    Text,
    Json,
}

impl Emit {
    fn extension(self) -> &'static str {
        match self {
            Emit::Text => "txt",
            Emit::Json => "json",
        }
    }
}

/// Flags override the configuration file.
fn apply_overrides(mut options: LowerOptions, args: &LowerArgs) -> LowerOptions {
    if args.cache_delegates {
        options.cache_static_delegates = true;
    }
    if args.keep_iterators {
        options.lower_iterators = false;
    }
    options
}

/// Collect all module files under a path
fn collect_module_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.exists() {
        return Err(anyhow!("{} does not exist", path.display()));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(path)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if path.is_file() && path.extension().map_or(false, |ext| ext == "json") {
            // Skip our own output
            if !path.to_string_lossy().ends_with(".lowered.json") {
                files.push(path.to_path_buf());
            }
        }
    }
    Ok(files)
}

#[derive(Debug)]
struct Lowered {
    module: Module,
    /// Text dump of the module before lowering
    before: String,
    methods: Vec<NormalizedMethod>,
}

impl Lowered {
    fn type_count(&self) -> usize {
        self.methods.iter().map(|m| m.new_types().len()).sum()
    }

    fn render(&self, emit: Emit) -> Result<String> {
        Ok(match emit {
            Emit::Text => print_module(&self.module),
            Emit::Json => serde_json::to_string_pretty(&self.module)?,
        })
    }
}

fn lower_file(path: &Path, options: &LowerOptions) -> Result<Lowered> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Could not read {}", path.display()))?;
    let mut module: Module = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a serialized module", path.display()))?;
    module
        .validate()
        .with_context(|| format!("{} is inconsistent", path.display()))?;

    let before = print_module(&module);
    let methods = normalize_module(&mut module, options)?;
    log::info!(
        "{}: lowered {} method(s)",
        path.display(),
        methods.len()
    );
    Ok(Lowered {
        module,
        before,
        methods,
    })
}

fn render_diff(before: &str, after: &str, name: &str, use_color: bool) -> String {
    let diff = TextDiff::from_lines(before, after);
    if !use_color {
        let (old, new) = (format!("a/{}", name), format!("b/{}", name));
        return diff
            .unified_diff()
            .context_radius(3)
            .header(&old, &new)
            .to_string();
    }

    let mut out = String::new();
    for (i, group) in diff.grouped_ops(3).iter().enumerate() {
        if i > 0 {
            let _ = writeln!(out, "{}", Style::new().dim().apply_to("..."));
        }
        for op in group {
            for change in diff.iter_changes(op) {
                let (sign, style) = match change.tag() {
                    ChangeTag::Delete => ("-", Style::new().red()),
                    ChangeTag::Insert => ("+", Style::new().green()),
                    ChangeTag::Equal => (" ", Style::new().dim()),
                };
                let _ = write!(out, "{}{}", style.apply_to(sign), style.apply_to(change));
            }
        }
    }
    out
}

fn output_path(dir: &Path, input: &Path, emit: Emit) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("module");
    dir.join(format!("{}.lowered.{}", stem, emit.extension()))
}

fn report_failure(file: &Path, err: &anyhow::Error, format: OutputFormat, use_color: bool) {
    let message = match err.downcast_ref::<LowerError>() {
        Some(lower) => lower.to_string(),
        None => format!("{:#}", err),
    };
    match format {
        OutputFormat::Text => {
            if use_color {
                eprintln!(
                    "{} {}: {}",
                    console::style("error:").red().bold(),
                    file.display(),
                    message
                );
            } else {
                eprintln!("error: {}: {}", file.display(), message);
            }
        }
        OutputFormat::Json => {
            let method = err.downcast_ref::<LowerError>().map(|e| e.method().to_string());
            println!(
                "{}",
                serde_json::json!({
                    "type": "error",
                    "file": file.to_string_lossy(),
                    "method": method,
                    "message": message,
                })
            );
        }
    }
}

pub fn run(args: LowerArgs, format: OutputFormat, use_color: bool, quiet: bool) -> Result<()> {
    let config = Config::resolve(args.config.as_deref(), &args.input)?;
    let options = apply_overrides(config.lower, &args);
    log::debug!("lowering options: {:?}", options);

    let files = collect_module_files(&args.input)?;
    if files.is_empty() {
        match format {
            OutputFormat::Text => {
                if !quiet {
                    eprintln!("No module files found.");
                }
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({
                        "type": "summary",
                        "success": true,
                        "files": 0,
                    })
                );
            }
        }
        return Ok(());
    }

    if let Some(dir) = &args.out_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("Could not create {}", dir.display()))?;
    }

    let mut failures = 0;
    let mut methods_lowered = 0;
    let mut types_added = 0;

    for file in &files {
        let lowered = match lower_file(file, &options) {
            Ok(lowered) => lowered,
            Err(err) => {
                failures += 1;
                report_failure(file, &err, format, use_color);
                continue;
            }
        };
        methods_lowered += lowered.methods.len();
        types_added += lowered.type_count();

        let name = file.file_name().map_or_else(
            || file.to_string_lossy().to_string(),
            |n| n.to_string_lossy().to_string(),
        );
        let output = if args.diff {
            let after = print_module(&lowered.module);
            render_diff(&lowered.before, &after, &name, use_color && args.out_dir.is_none())
        } else {
            lowered.render(args.emit)?
        };

        let written = match &args.out_dir {
            Some(dir) => {
                let path = output_path(dir, file, if args.diff { Emit::Text } else { args.emit });
                fs::write(&path, &output)
                    .with_context(|| format!("Could not write {}", path.display()))?;
                Some(path)
            }
            None => None,
        };

        match format {
            OutputFormat::Text => match &written {
                Some(path) => {
                    if !quiet {
                        eprintln!("  Lowered {} -> {}", file.display(), path.display());
                    }
                }
                None => print!("{}", output),
            },
            OutputFormat::Json => {
                let methods: Vec<String> = lowered
                    .methods
                    .iter()
                    .map(|m| qualified_name(&lowered.module, m.method))
                    .collect();
                let types: Vec<String> = lowered
                    .methods
                    .iter()
                    .flat_map(|m| m.new_types())
                    .map(|t| lowered.module.type_def(t).name.clone())
                    .collect();
                let mut report = serde_json::json!({
                    "type": "file",
                    "file": file.to_string_lossy(),
                    "methods": methods,
                    "types_added": types,
                });
                match &written {
                    Some(path) => report["output_path"] = path.to_string_lossy().into(),
                    None => report["output"] = output.into(),
                }
                println!("{}", serde_json::to_string(&report)?);
            }
        }
    }

    match format {
        OutputFormat::Text => {
            if !quiet {
                let summary = format!(
                    "{} method(s) lowered, {} type(s) added, {} file(s)",
                    methods_lowered,
                    types_added,
                    files.len()
                );
                if failures > 0 {
                    if use_color {
                        eprintln!(
                            "{}: {} of {} file(s) failed",
                            console::style("Lowering failed").red().bold(),
                            failures,
                            files.len()
                        );
                    } else {
                        eprintln!("Lowering failed: {} of {} file(s) failed", failures, files.len());
                    }
                } else if use_color {
                    eprintln!("{} - {}", console::style("Done").green().bold(), summary);
                } else {
                    eprintln!("Done - {}", summary);
                }
            }
        }
        OutputFormat::Json => {
            let summary = serde_json::json!({
                "type": "summary",
                "success": failures == 0,
                "files": files.len(),
                "failed": failures,
                "methods_lowered": methods_lowered,
                "types_added": types_added,
            });
            println!("{}", serde_json::to_string(&summary)?);
        }
    }

    if failures > 0 {
        Err(anyhow!("Lowering failed for {} file(s)", failures))
    } else {
        Ok(())
    }
}
