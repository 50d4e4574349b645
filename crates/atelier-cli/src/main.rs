mod config;
mod logging;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use atelier_contracts::history::HistoryEntry;
use atelier_contracts::request::{
    Background, GenerateRequest, ImageRequest, ImageSize, Moderation, OutputFormat, Quality,
    SourceImage,
};
use atelier_engine::{DisplayImage, HttpImageApi, Studio, SubmitReport};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::info;

use crate::config::{AppConfig, ConfigOverrides};
use crate::logging::{init_logging, LogFormat};

#[derive(Debug, Parser)]
#[command(name = "atelier", version, about = "Image generation and editing client")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// Overrides IMAGE_STORAGE_MODE.
    #[arg(long, global = true)]
    storage_mode: Option<String>,
    /// Overrides ATELIER_API_BASE.
    #[arg(long, global = true)]
    api_base: Option<String>,
    /// Overrides ATELIER_DATA_DIR.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, env = "ATELIER_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the resolved storage mode.
    Mode,
    Generate(GenerateArgs),
    Edit(EditArgs),
    #[command(subcommand)]
    History(HistoryCommand),
    SendToEdit(SendToEditArgs),
    Download(DownloadArgs),
}

#[derive(Debug, Args)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value_t = 1)]
    n: u8,
    #[arg(long, default_value = "auto")]
    size: ImageSize,
    #[arg(long, default_value = "auto")]
    quality: Quality,
    #[arg(long, default_value = "png")]
    output_format: OutputFormat,
    #[arg(long)]
    output_compression: Option<u8>,
    #[arg(long, default_value = "auto")]
    background: Background,
    #[arg(long, default_value = "auto")]
    moderation: Moderation,
}

#[derive(Debug, Args)]
struct EditOptions {
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value_t = 1)]
    n: u8,
    #[arg(long, default_value = "auto")]
    size: ImageSize,
    #[arg(long, default_value = "auto")]
    quality: Quality,
    #[arg(long)]
    mask: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct EditArgs {
    #[arg(long = "image", required = true, num_args = 1..)]
    images: Vec<PathBuf>,
    #[command(flatten)]
    options: EditOptions,
}

#[derive(Debug, Subcommand)]
enum HistoryCommand {
    List {
        #[arg(long)]
        json: bool,
    },
    Show {
        timestamp: i64,
    },
    Clear {
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, Args)]
struct SendToEditArgs {
    /// Stored image to use as the edit source.
    filename: String,
    #[command(flatten)]
    options: EditOptions,
}

#[derive(Debug, Args)]
struct DownloadArgs {
    timestamp: i64,
    #[arg(long)]
    out: PathBuf,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("atelier error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_logging(cli.global.log_level.as_deref(), cli.global.log_format)?;
    let config = AppConfig::from_env(&ConfigOverrides {
        storage_mode: cli.global.storage_mode.clone(),
        api_base: cli.global.api_base.clone(),
        data_dir: cli.global.data_dir.clone(),
    })?;
    info!(
        storage_mode = %config.storage_mode,
        data_dir = %config.data_dir.display(),
        api_base = %config.api_base,
        "configuration resolved"
    );

    match cli.command {
        Command::Mode => {
            print_mode(&config);
            Ok(0)
        }
        Command::Generate(args) => run_generate(&mut open_studio(&config)?, args),
        Command::Edit(args) => run_edit(&mut open_studio(&config)?, args),
        Command::History(command) => run_history(&mut open_studio(&config)?, command),
        Command::SendToEdit(args) => run_send_to_edit(&mut open_studio(&config)?, args),
        Command::Download(args) => run_download(&mut open_studio(&config)?, args),
    }
}

fn open_studio(config: &AppConfig) -> Result<Studio<HttpImageApi>> {
    let api = HttpImageApi::new(&config.api_base, config.request_timeout)?;
    Studio::open(config.storage_mode, &config.data_dir, api, config.quotas)
}

fn print_mode(config: &AppConfig) {
    println!("storage mode: {}", config.storage_mode);
    println!(
        "explicit setting: {}",
        config.explicit_mode.as_deref().unwrap_or("(unset)")
    );
    println!(
        "deployment env: {}",
        config.deployment_env.as_deref().unwrap_or("(unset)")
    );
    println!("data dir: {}", config.data_dir.display());
}

fn run_generate(studio: &mut Studio<HttpImageApi>, args: GenerateArgs) -> Result<i32> {
    let request = ImageRequest::Generate(GenerateRequest {
        prompt: args.prompt,
        n: args.n,
        size: args.size,
        quality: args.quality,
        output_format: args.output_format,
        output_compression: args.output_compression,
        background: args.background,
        moderation: args.moderation,
    });
    let report = studio.submit(request)?;
    print_report(&report);
    Ok(0)
}

fn run_edit(studio: &mut Studio<HttpImageApi>, args: EditArgs) -> Result<i32> {
    for path in &args.images {
        studio.edit_form_mut().add_source_image(read_source_image(path)?)?;
    }
    apply_edit_options(studio, args.options)?;
    let report = studio.submit_edit()?;
    print_report(&report);
    Ok(0)
}

fn run_send_to_edit(studio: &mut Studio<HttpImageApi>, args: SendToEditArgs) -> Result<i32> {
    studio.send_to_edit(&args.filename)?;
    apply_edit_options(studio, args.options)?;
    let report = studio.submit_edit()?;
    print_report(&report);
    Ok(0)
}

fn apply_edit_options(studio: &mut Studio<HttpImageApi>, options: EditOptions) -> Result<()> {
    let mask = options.mask.as_deref().map(read_source_image).transpose()?;
    let form = studio.edit_form_mut();
    form.prompt = options.prompt;
    form.n = options.n;
    form.size = options.size;
    form.quality = options.quality;
    form.mask = mask;
    Ok(())
}

fn run_history(studio: &mut Studio<HttpImageApi>, command: HistoryCommand) -> Result<i32> {
    match command {
        HistoryCommand::List { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(studio.history())?);
            } else if studio.history().is_empty() {
                println!("No history yet.");
            } else {
                for entry in studio.history() {
                    println!("{}", history_line(entry));
                }
            }
            Ok(0)
        }
        HistoryCommand::Show { timestamp } => {
            let selection = studio.select_history(timestamp)?;
            print_images(&selection.images);
            if let Some(warning) = selection.warning {
                eprintln!("warning: {warning}");
            }
            Ok(0)
        }
        HistoryCommand::Clear { yes } => {
            if !yes {
                bail!(
                    "clearing removes the entire image history and cannot be undone; pass --yes to confirm"
                );
            }
            studio.clear_history()?;
            println!("History cleared.");
            Ok(0)
        }
    }
}

fn run_download(studio: &mut Studio<HttpImageApi>, args: DownloadArgs) -> Result<i32> {
    let written = studio.download_entry(args.timestamp, &args.out, |done, total| {
        eprintln!("downloaded {done}/{total}");
    })?;
    for path in &written {
        println!("{}", path.display());
    }
    Ok(0)
}

fn print_report(report: &SubmitReport) {
    print_images(&report.images);
    let summary = json!({
        "timestamp": report.entry.timestamp,
        "mode": report.entry.mode,
        "storageModeUsed": report.entry.storage_mode_used,
        "durationMs": report.entry.duration_ms,
        "estimatedCostUsd": report.entry.cost_details.as_ref().map(|cost| cost.estimated_cost_usd),
    });
    println!("{summary}");
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
}

fn print_images(images: &[DisplayImage]) {
    for image in images {
        println!("{}\t{}", image.filename, image.source);
    }
}

fn history_line(entry: &HistoryEntry) -> String {
    let created = entry
        .created_at()
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| entry.timestamp.to_string());
    let cost = entry
        .cost_details
        .as_ref()
        .map(|cost| format!("${:.4}", cost.estimated_cost_usd))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{}\t{}\t{}\t{}\t{} image(s)\t{}\t{}",
        entry.timestamp,
        created,
        entry.mode,
        entry.storage_mode_used,
        entry.images.len(),
        cost,
        truncate_prompt(&entry.prompt, 60),
    )
}

fn truncate_prompt(prompt: &str, max_chars: usize) -> String {
    let mut chars = prompt.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

fn read_source_image(path: &Path) -> Result<SourceImage> {
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))?;
    Ok(SourceImage::new(file_name, bytes, mime_for_path(path)))
}

fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "image/png",
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use atelier_contracts::history::{HistoryEntry, HistoryImage};
    use atelier_contracts::request::{Background, Moderation, Quality, RequestMode};
    use atelier_contracts::storage::StorageMode;
    use clap::Parser;

    use super::{history_line, mime_for_path, read_source_image, truncate_prompt, Cli, Command};

    #[test]
    fn mime_type_follows_extension() {
        assert_eq!(mime_for_path(Path::new("a/photo.JPG")), "image/jpeg");
        assert_eq!(mime_for_path(Path::new("b.webp")), "image/webp");
        assert_eq!(mime_for_path(Path::new("no_extension")), "image/png");
    }

    #[test]
    fn reads_source_image_from_disk() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("cat.jpeg");
        std::fs::write(&path, b"jpeg-bytes")?;

        let image = read_source_image(&path)?;
        assert_eq!(image.file_name, "cat.jpeg");
        assert_eq!(image.mime_type, "image/jpeg");
        assert_eq!(&image.bytes[..], b"jpeg-bytes");
        Ok(())
    }

    #[test]
    fn prompt_truncation_respects_char_boundaries() {
        assert_eq!(truncate_prompt("short", 10), "short");
        assert_eq!(truncate_prompt("ééééé", 3), "ééé...");
    }

    #[test]
    fn history_line_includes_mode_and_cost_placeholder() {
        let entry = HistoryEntry {
            timestamp: 1_700_000_000_000,
            images: vec![HistoryImage {
                filename: "a.png".to_string(),
            }],
            storage_mode_used: StorageMode::IndexedDb,
            duration_ms: 1200,
            quality: Quality::Auto,
            background: Background::Auto,
            moderation: Moderation::Auto,
            prompt: "a red cube".to_string(),
            mode: RequestMode::Generate,
            cost_details: None,
        };
        let line = history_line(&entry);
        assert!(line.contains("generate"));
        assert!(line.contains("indexeddb"));
        assert!(line.contains("1 image(s)"));
        assert!(line.ends_with("a red cube"));
    }

    #[test]
    fn edit_requires_at_least_one_image() {
        assert!(Cli::try_parse_from(["atelier", "edit", "--prompt", "x"]).is_err());
        let cli = Cli::try_parse_from([
            "atelier", "edit", "--image", "a.png", "--image", "b.png", "--prompt", "x",
        ]);
        assert!(matches!(
            cli.map(|cli| cli.command),
            Ok(Command::Edit(args)) if args.images.len() == 2
        ));
    }
}
