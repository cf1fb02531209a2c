//! 命令行入口
//!
//! 加载JSON文档快照，在专用API线程上运行一次翻译，把结果写回快照文件。

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use cad_translator::env::{self, EnvVar};
use cad_translator::host::{HostApiThread, InMemoryDocument};
use cad_translator::translation::core::{
    HttpProvider, LogProgressSink, ProgressReporter, PseudoProvider, TranslationProvider,
};
use cad_translator::translation::{
    ConfigManager, Orchestrator, RunOutcome, RunStatus, SelectionScope, TranslationConfig,
    TranslationError, TranslationResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProviderKind {
    /// 调用配置中的HTTP翻译服务
    Http,
    /// 本地伪翻译，只给文本加前缀
    Pseudo,
}

#[derive(Parser, Debug)]
#[command(name = "cad-translator")]
#[command(about = "Translate text fields of a CAD document model")]
#[command(version)]
struct Cli {
    /// 文档快照（JSON）
    #[arg(long, short)]
    document: PathBuf,

    /// 要翻译的类别，可重复
    #[arg(long = "category", short, required = true)]
    categories: Vec<String>,

    /// 限定视图，可重复；省略时翻译整个模型
    #[arg(long = "view")]
    views: Vec<String>,

    /// 目标语言，覆盖配置
    #[arg(long, short)]
    target_lang: Option<String>,

    /// 配置文件路径
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "http")]
    provider: ProviderKind,

    /// 译后快照的输出路径，默认覆盖输入文件
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// 运行摘要（JSON）的输出路径
    #[arg(long)]
    report: Option<PathBuf>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(env::core::LogLevel::get_or_default("info".to_string())));
    let no_color = env::core::NoColor::get_or_default(false);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!no_color)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> TranslationResult<TranslationConfig> {
    let manager = match &cli.config {
        Some(path) => ConfigManager::from_file(path)?,
        None => ConfigManager::new()?,
    };

    let mut config = manager.into_config();
    if let Some(lang) = &cli.target_lang {
        config.target_lang = lang.clone();
    }
    config.validate()?;
    Ok(config)
}

fn build_provider(
    kind: ProviderKind,
    config: &TranslationConfig,
) -> TranslationResult<Arc<dyn TranslationProvider>> {
    Ok(match kind {
        ProviderKind::Http => Arc::new(HttpProvider::from_config(config)?),
        ProviderKind::Pseudo => Arc::new(PseudoProvider::new()),
    })
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> TranslationResult<()> {
    let content = serde_json::to_string_pretty(value)?;
    std::fs::write(path, content)?;
    Ok(())
}

async fn run(cli: Cli) -> TranslationResult<RunOutcome> {
    let config = load_config(&cli)?;
    tracing::debug!("使用配置: {:?}", config);

    let provider = build_provider(cli.provider, &config)?;
    let document = InMemoryDocument::load(&cli.document).map_err(|e| {
        TranslationError::ExtractionFailure(format!(
            "无法加载文档 {}: {}",
            cli.document.display(),
            e
        ))
    })?;
    let api = HostApiThread::spawn(document)?;

    let scope = SelectionScope::new(
        cli.categories.iter().map(String::as_str),
        cli.views.iter().map(String::as_str),
    );
    let orchestrator = Orchestrator::new(Arc::new(config), provider);
    let mut handle = orchestrator.start_run(scope, api.context());

    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("收到中断信号，正在取消运行");
            cancel.cancel();
        }
    });

    let reporter = handle.subscribe().map(|events| {
        tokio::spawn(async move {
            let mut sink = LogProgressSink::new();
            ProgressReporter::new(events).run(&mut sink).await
        })
    });

    let outcome = handle.wait().await?;
    if let Some(reporter) = reporter {
        let _ = reporter.await;
    }

    let snapshot = api
        .context()
        .run(|document: &mut InMemoryDocument| document.to_snapshot())
        .await?;
    api.shutdown();

    let output = cli.output.as_deref().unwrap_or(&cli.document);
    write_json(output, &snapshot)?;
    tracing::info!("已写出文档: {}", output.display());

    if let Some(path) = &cli.report {
        write_json(path, &outcome)?;
        tracing::info!("已写出运行摘要: {}", path.display());
    }

    Ok(outcome)
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(outcome) => match outcome.status {
            RunStatus::Completed => ExitCode::SUCCESS,
            RunStatus::Cancelled => ExitCode::from(2),
            RunStatus::Failed => ExitCode::FAILURE,
        },
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
