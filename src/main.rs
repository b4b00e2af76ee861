// main.rs — 程序入口
// 负责初始化日志与异步运行时、解析命令行参数、分发子命令

mod cli;
mod config;
mod download;
mod error;
mod pipeline;
mod source;
mod walker;

// 初始化多语言支持，嵌入 locales 目录下的所有翻译
rust_i18n::i18n!("locales", fallback = "en");

use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Commands, ConfigAction};
use config::AppConfig;
use download::{DownloadResult, Downloader};
use error::{ApiError, CollectionFailure};
use pipeline::{Event, RunRequest, RunSummary};
use rust_i18n::t;
use source::CollectionSource;
use source::wallhaven::{WallhavenClient, build_http_client};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Ctrl-C 时的退出码（128 + SIGINT）
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    // 自动检测系统语言并设置
    let locale = std::env::var("LANG").unwrap_or_else(|_| "en".to_string());
    if locale.starts_with("zh") {
        rust_i18n::set_locale("zh-CN");
    } else {
        rust_i18n::set_locale("en");
    }

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = AppConfig::load(cli.config.as_deref())?;
    tracing::debug!(path = %config.config_path.display(), "configuration loaded");

    match cli.command {
        Commands::Fetch {
            username,
            collections,
            api_key,
            dest,
            flat,
            jobs,
        } => {
            let request = RunRequest {
                username,
                collections,
                api_key: api_key.or_else(|| config.api_key.clone()),
                output_dir: resolve_output_dir(&config, dest)?,
                flat: flat || config.flat,
                concurrency: jobs.map(usize::from).unwrap_or(config.concurrency),
                retry: config.retry.clone(),
            };
            handle_fetch(&config, &request).await
        }

        Commands::List { username, api_key } => {
            let api_key = api_key.or_else(|| config.api_key.clone());
            handle_list(&config, &username, api_key.as_deref()).await?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Config { action } => {
            handle_config(&config, &action)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Completions { shell } => {
            generate(shell, &mut Cli::command(), "whcollect", &mut std::io::stdout());
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// 诊断日志写到 stderr，stdout 只留给进度输出
fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,whcollect={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// 命令行指定的目录必须已存在；未指定时使用配置中的目录并自动创建
fn resolve_output_dir(
    config: &AppConfig,
    dest: Option<PathBuf>,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    match dest {
        Some(dir) if dir.is_dir() => Ok(dir),
        Some(dir) => Err(t!("error_dest_missing", path => dir.display()).into()),
        None => {
            config.ensure_output_dir()?;
            Ok(config.output_dir.clone())
        }
    }
}

/// 处理 fetch 子命令：下载收藏夹
async fn handle_fetch(
    config: &AppConfig,
    request: &RunRequest,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    if request.api_key.is_none() {
        println!("{}", t!("no_api_key_hint"));
    }

    let http = build_http_client(config.timeout)?;
    let client = WallhavenClient::new(http.clone(), config.base_url.as_str());
    let downloader = Downloader::new(http);

    let run = pipeline::run(&client, &downloader, request, print_event);

    // Ctrl-C 时直接丢弃 run：进行中的下载随之取消，临时文件由 Drop 清理
    let summary = tokio::select! {
        summary = run => summary,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("{}", t!("interrupted"));
            return Ok(ExitCode::from(EXIT_INTERRUPTED));
        }
    };

    print_summary(&summary);

    if summary.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn print_event(event: Event<'_>) {
    match event {
        Event::CollectionStarted { info, dir } => {
            let name = if info.label.is_empty() { &info.id } else { &info.label };
            println!("{}", t!("collection_start", name => name, dir => dir.display()));
        }
        Event::Downloaded { record, result } => match result {
            DownloadResult::Saved(path) => println!("{}", t!("saved", path => path.display())),
            DownloadResult::Skipped(path) => println!("{}", t!("skipped", path => path.display())),
            DownloadResult::Failed(e) => {
                println!("{}", t!("failed", id => record.id(), reason => e))
            }
        },
    }
}

fn print_summary(summary: &RunSummary) {
    println!();
    for collection in &summary.collections {
        match &collection.error {
            Some(e) => println!(
                "{}",
                t!("collection_aborted", name => collection.name, reason => e)
            ),
            None => println!(
                "{}",
                t!(
                    "collection_summary",
                    name => collection.name,
                    saved => collection.saved,
                    skipped => collection.skipped,
                    failed => collection.failed.len()
                )
            ),
        }
    }

    println!(
        "{}",
        t!(
            "run_summary",
            saved => summary.saved(),
            skipped => summary.skipped(),
            failed => summary.failed()
        )
    );

    if let Some(e) = &summary.fatal {
        eprintln!("{}", t!("error_fatal", reason => e));
    }
    let auth_failed = matches!(summary.fatal, Some(ApiError::Auth { .. }))
        || summary
            .collections
            .iter()
            .any(|c| matches!(c.error, Some(CollectionFailure::Api(ApiError::Auth { .. }))));
    if auth_failed {
        eprintln!("{}", t!("error_auth_hint"));
    }
}

/// 处理 list 子命令：列出用户的收藏夹
async fn handle_list(
    config: &AppConfig,
    username: &str,
    api_key: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let http = build_http_client(config.timeout)?;
    let client = WallhavenClient::new(http, config.base_url.as_str());

    let collections = client.list_collections(username, api_key).await?;

    if collections.is_empty() {
        println!("{}", t!("list_empty"));
        return Ok(());
    }

    println!("{}", t!("list_title", user => username));
    for c in &collections {
        let count = c.count.map(|n| n.to_string()).unwrap_or_else(|| "?".to_string());
        let visibility = if c.public { t!("public") } else { t!("private") };
        println!(
            "{}",
            t!(
                "list_item",
                id => c.id,
                label => c.label,
                count => count,
                visibility => visibility
            )
        );
    }
    Ok(())
}

/// 处理 config 子命令：查看或修改配置
fn handle_config(
    config: &AppConfig,
    action: &ConfigAction,
) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        ConfigAction::Show => {
            println!("{}", t!("config_title"));
            println!("{}", t!("config_path", path => config.config_path.display()));
            println!("{}", t!("config_output_dir", path => config.output_dir.display()));
            println!("{}", t!("config_flat", flat => config.flat));
            println!("{}", t!("config_concurrency", n => config.concurrency));
            let state = if config.api_key.is_some() {
                t!("config_key_set")
            } else {
                t!("config_key_unset")
            };
            println!("{}", t!("config_api_key", state => state));
        }
        ConfigAction::Path => {
            println!("{}", config.config_path.display());
        }
        ConfigAction::Schema => {
            println!("{}", AppConfig::get_schema());
        }
        ConfigAction::Dump => {
            println!("{}", config.to_toml());
        }
        ConfigAction::Set { key, value } => {
            config::set_value(&config.config_path, key, value)?;
            println!("{}", t!("config_updated", key => key, value => value));
        }
    }
    Ok(())
}
