use std::fs;
use std::io::{self, BufRead, Write};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use log::debug;
use novel_adapters::{
    create_embedding_adapter, create_embedding_adapter_from_profile, create_llm_adapter,
    create_llm_adapter_from_profile, AdapterError, QdrantVectorIndex,
};
use novel_core::interaction::ConfirmKind;
use novel_core::{
    ArchitectureOutcome, ArtifactError, BatchReport, BlueprintOutcome, ChapterGuidance,
    ConfigError, ConfigStore, ConfirmationGate, ConfirmationHandler, EmbeddingModel,
    EmbeddingModelError, FanoutLogSink, FileLogSink, FixedAnswer, LanguageModel,
    LanguageModelError, LocalVectorIndex, LogFacadeSink, LogLevel, LogRecord, LogSink, NovelError,
    NovelPipeline, PipelineError, Project, PromptError, PromptRegistry, SharedLogSink,
    StdoutLogSink, ValidationError, VectorBackend, VectorIndex, VectorStoreError,
};
use thiserror::Error;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let config = cli.config.as_path();

    match cli.command {
        Command::Init(args) => run_init(config, args, cli.quiet),
        Command::Architecture(ArchitectureCommand::Generate(args)) => {
            run_architecture(Session::open(config, &args, cli.quiet)?)
        }
        Command::Blueprint(BlueprintCommand::Generate(args)) => {
            run_blueprint(Session::open(config, &args, cli.quiet)?)
        }
        Command::Chapter(command) => handle_chapter(config, command, cli.quiet),
        Command::Batch(args) => run_batch(config, args, cli.quiet),
        Command::Run(args) => run_all(config, args, cli.quiet),
        Command::Prompts(command) => handle_prompts(config, command, cli.quiet),
        Command::Config(command) => handle_config(config, command),
    }
}

/// Config, project directory and log sinks shared by every project command.
struct Workspace {
    store: ConfigStore,
    project: Project,
    sink: Arc<FanoutLogSink>,
}

impl Workspace {
    fn open(config_path: &Path, quiet: bool) -> Result<Self, CliError> {
        let store = ConfigStore::open(config_path)?;
        let project = Project::open(ensure_output_dir(&store)?)?;
        let sink = Arc::new(build_sink(&project, quiet)?);
        Ok(Self {
            store,
            project,
            sink,
        })
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message));
    }

    fn prompts(&self) -> Result<PromptRegistry, CliError> {
        let sink: SharedLogSink = self.sink.clone();
        Ok(PromptRegistry::load(&self.project, sink)?)
    }
}

/// Progress goes to stdout (or the `log` facade with `--quiet`) and always to `logs/app.log`.
fn build_sink(project: &Project, quiet: bool) -> Result<FanoutLogSink, CliError> {
    let path = project.log_path();
    let file = FileLogSink::open(&path).map_err(|source| CliError::Io { path, source })?;
    let console: SharedLogSink = if quiet {
        Arc::new(LogFacadeSink::with_target("novelctl"))
    } else {
        Arc::new(StdoutLogSink::new())
    };
    Ok(FanoutLogSink::new().with(console).with(Arc::new(file)))
}

/// A workspace plus the adapters and prompt registry a pipeline run needs.
struct Session {
    workspace: Workspace,
    prompts: PromptRegistry,
    model: Box<dyn LanguageModel>,
    index: Option<Box<dyn VectorIndex>>,
    confirmations: Arc<dyn ConfirmationHandler>,
    llm_name: String,
    embedding_name: Option<String>,
}

impl Session {
    fn open(config_path: &Path, args: &InterfaceArgs, quiet: bool) -> Result<Self, CliError> {
        let workspace = Workspace::open(config_path, quiet)?;
        let prompts = workspace.prompts()?;
        let config = workspace.store.config();

        let (llm_name, llm_profile) = config.llm_profile(args.llm_interface.as_deref())?;
        workspace.log(LogLevel::Info, format!("使用 LLM 接口：{llm_name}"));
        let model = create_llm_adapter_from_profile(llm_profile)?;
        let llm_name = llm_name.to_string();

        let wants_embedding =
            args.embedding_interface.is_some() || !config.embedding_profiles.is_empty();
        let (index, embedding_name) = if wants_embedding {
            let (name, profile) = config.embedding_profile(args.embedding_interface.as_deref())?;
            workspace.log(LogLevel::Info, format!("使用 Embedding 接口：{name}"));
            let embedding: Arc<dyn EmbeddingModel> =
                Arc::from(create_embedding_adapter_from_profile(profile)?);
            let store = &config.vector_store;
            let index: Box<dyn VectorIndex> = match store.backend {
                VectorBackend::Local => Box::new(LocalVectorIndex::open(
                    workspace.project.vectorstore_dir(),
                    embedding,
                )?),
                VectorBackend::Qdrant => {
                    let index = QdrantVectorIndex::open(store, embedding)?;
                    workspace.log(
                        LogLevel::Info,
                        format!("使用 Qdrant 向量库集合：{}", index.collection()),
                    );
                    Box::new(index)
                }
            };
            (Some(index), Some(name.to_string()))
        } else {
            workspace.log(
                LogLevel::Info,
                "未配置 Embedding 接口，向量检索与向量库更新将跳过。",
            );
            (None, None)
        };

        let confirmations: Arc<dyn ConfirmationHandler> = if args.yes {
            Arc::new(FixedAnswer(true))
        } else {
            Arc::new(StdinConfirmation)
        };

        Ok(Self {
            workspace,
            prompts,
            model,
            index,
            confirmations,
            llm_name,
            embedding_name,
        })
    }

    fn pipeline(&self) -> NovelPipeline<'_> {
        let workspace = &self.workspace;
        let pipeline = NovelPipeline::new(
            &workspace.project,
            self.model.as_ref(),
            &self.prompts,
            &*workspace.sink,
        )
        .with_confirmations(ConfirmationGate::new(Arc::clone(&self.confirmations)))
        .with_config(workspace.store.config().pipeline.clone());
        match &self.index {
            Some(index) => pipeline.with_vector_index(index.as_ref()),
            None => pipeline,
        }
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.workspace.log(level, message);
    }

    /// Remembers the interfaces used for the next run.
    fn finish(self) -> Result<(), CliError> {
        let mut store = self.workspace.store;
        store.touch_llm_interface(self.llm_name);
        if let Some(name) = self.embedding_name {
            store.touch_embedding_interface(name);
        }
        store.save()?;
        Ok(())
    }
}

/// Asks on stderr and reads the answer from stdin.
struct StdinConfirmation;

impl ConfirmationHandler for StdinConfirmation {
    fn confirm(&self, kind: &ConfirmKind) -> bool {
        let mut stderr = io::stderr();
        let _ = write!(stderr, "{kind} [y/N] ");
        let _ = stderr.flush();

        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => kind.default_answer(),
            Ok(_) => parse_answer(&line).unwrap_or_else(|| kind.default_answer()),
        }
    }
}

fn parse_answer(line: &str) -> Option<bool> {
    match line.trim().to_lowercase().as_str() {
        "y" | "yes" | "是" | "好" => Some(true),
        "" | "n" | "no" | "否" => Some(false),
        _ => None,
    }
}

fn run_init(config_path: &Path, args: InitArgs, quiet: bool) -> Result<(), CliError> {
    let mut store = ConfigStore::open(config_path)?;
    {
        let novel = &mut store.config_mut().novel;
        if let Some(topic) = args.topic {
            novel.topic = topic;
        }
        if let Some(genre) = args.genre {
            novel.genre = genre;
        }
        if let Some(chapters) = args.chapters {
            novel.target_chapters = chapters;
        }
        if let Some(words) = args.words {
            novel.words_per_chapter = words;
        }
        if let Some(volumes) = args.volumes {
            novel.volume_count = volumes;
        }
        if let Some(guidance) = args.guidance {
            novel.user_guidance = guidance;
        }
        if let Some(dir) = args.dir {
            novel.filepath = dir.display().to_string();
        }
    }

    let seed = store.config().novel.to_seed();
    seed.validate()?;
    let plan = seed.volume_plan()?;

    let project = Project::open(ensure_output_dir(&store)?)?;
    let sink = build_sink(&project, quiet)?;
    project.write_seed(&seed)?;
    store.save()?;

    sink.log(LogRecord::new(
        LogLevel::Info,
        format!(
            "已初始化项目：{}（{}），共{}章，每章{}字，目录：{}",
            seed.topic,
            seed.genre,
            seed.target_chapters,
            seed.words_per_chapter,
            project.root().display()
        ),
    ));
    if plan.is_partitioned() {
        sink.log(LogRecord::new(
            LogLevel::Info,
            format!("分卷方案：\n{}", plan.describe()),
        ));
    }
    Ok(())
}

fn run_architecture(session: Session) -> Result<(), CliError> {
    match session.pipeline().generate_architecture()? {
        ArchitectureOutcome::Complete(_) => {
            session.log(
                LogLevel::Info,
                format!(
                    "小说架构已写入：{}",
                    session.workspace.project.architecture_path().display()
                ),
            );
        }
        ArchitectureOutcome::Paused { stage } => {
            return Err(CliError::Incomplete(format!(
                "架构生成在「{stage}」阶段未得到有效结果，已保存进度，重新运行即可续跑。"
            )));
        }
    }
    session.finish()
}

fn run_blueprint(session: Session) -> Result<(), CliError> {
    match session.pipeline().generate_blueprint()? {
        BlueprintOutcome::Complete(blueprint) => {
            session.log(
                LogLevel::Info,
                format!(
                    "章节蓝图已写入：{}（共 {} 章）",
                    session.workspace.project.blueprint_path().display(),
                    blueprint.len()
                ),
            );
        }
        BlueprintOutcome::Paused { next_chapter, .. } => {
            return Err(CliError::Incomplete(format!(
                "章节蓝图在第{next_chapter}章处中断，已保存之前的章节，重新运行即可续跑。"
            )));
        }
    }
    session.finish()
}

fn handle_chapter(config_path: &Path, command: ChapterCommand, quiet: bool) -> Result<(), CliError> {
    match command {
        ChapterCommand::Draft(args) => {
            let session = Session::open(config_path, &args.interface, quiet)?;
            let custom_prompt = args
                .prompt_file
                .as_deref()
                .map(read_text_file)
                .transpose()?;
            let chapter = ensure_chapter_number(args.id)?;
            match session
                .pipeline()
                .draft_chapter(chapter, args.guidance.into_guidance(), custom_prompt)?
            {
                Some(draft) => session.log(
                    LogLevel::Info,
                    format!(
                        "第{chapter}章草稿已写入：{}（{}字）",
                        draft.path.display(),
                        draft.content.chars().count()
                    ),
                ),
                None => session.log(LogLevel::Info, format!("保留已有的第{chapter}章。")),
            }
            session.finish()
        }
        ChapterCommand::Finalize(args) => {
            let session = Session::open(config_path, &args.interface, quiet)?;
            let chapter = ensure_chapter_number(args.id)?;
            match session.pipeline().finalize_chapter(chapter)? {
                Some(report) => {
                    session.log(
                        LogLevel::Info,
                        format!(
                            "第{chapter}章定稿完成（第{}卷），向量库新增片段：{}",
                            report.volume, report.segments_written
                        ),
                    );
                    if let Some(volume) = report.closed_volume {
                        session.log(LogLevel::Info, format!("第{volume}卷已完结，卷摘要已生成。"));
                    }
                }
                None => session.log(LogLevel::Info, format!("已跳过第{chapter}章的重新定稿。")),
            }
            session.finish()
        }
        ChapterCommand::Enrich(args) => {
            let session = Session::open(config_path, &args.interface, quiet)?;
            let chapter = ensure_chapter_number(args.id)?;
            if session.pipeline().enrich_chapter(chapter, args.words)? {
                session.log(LogLevel::Info, format!("第{chapter}章已扩写。"));
            } else {
                session.log(LogLevel::Warn, format!("扩写未返回内容，第{chapter}章保持原文。"));
            }
            session.finish()
        }
    }
}

fn run_batch(config_path: &Path, args: BatchArgs, quiet: bool) -> Result<(), CliError> {
    let session = Session::open(config_path, &args.interface, quiet)?;
    let report = {
        let pipeline = session.pipeline();
        let target = pipeline.seed()?.target_chapters;
        let range = batch_range(args.from, args.to, target)?;
        pipeline.run_batch(range, &args.guidance.into_guidance())?
    };
    log_report(&session, &report);
    session.finish()
}

fn run_all(config_path: &Path, args: RunArgs, quiet: bool) -> Result<(), CliError> {
    let session = Session::open(config_path, &args.interface, quiet)?;
    let report = session
        .pipeline()
        .run_all(&args.guidance.into_guidance())?;
    log_report(&session, &report);
    session.finish()
}

fn log_report(session: &Session, report: &BatchReport) {
    let finalized = report.finalized_chapters();
    let kept = report
        .chapters
        .iter()
        .filter(|outcome| !outcome.drafted)
        .count();
    session.log(
        LogLevel::Info,
        format!(
            "批量生成结束：处理 {} 章，定稿 {} 章，保留原稿 {} 章。",
            report.chapters.len(),
            finalized.len(),
            kept
        ),
    );
}

fn batch_range(from: u32, to: Option<u32>, target: u32) -> Result<RangeInclusive<u32>, CliError> {
    let to = to.unwrap_or(target);
    if from == 0 || to < from {
        return Err(CliError::InvalidChapterRange { from, to });
    }
    Ok(from..=to)
}

fn handle_prompts(config_path: &Path, command: PromptsCommand, quiet: bool) -> Result<(), CliError> {
    let workspace = Workspace::open(config_path, quiet)?;
    let mut prompts = workspace.prompts()?;

    match command {
        PromptsCommand::List => {
            for (key, module) in prompts.modules() {
                let state = if module.required {
                    "必需"
                } else if module.enabled {
                    "启用"
                } else {
                    "停用"
                };
                let custom = prompts
                    .override_path(&key)
                    .filter(|path| path.exists())
                    .map(|path| format!(" | 自定义：{}", path.display()))
                    .unwrap_or_default();
                println!("[{state}] {key} | {}{custom}", module.name);
            }
        }
        PromptsCommand::Enable { key } => {
            prompts.set_enabled(&key, true)?;
            workspace.log(LogLevel::Info, format!("已启用提示词模块 `{key}`"));
        }
        PromptsCommand::Disable { key } => {
            prompts.set_enabled(&key, false)?;
            workspace.log(LogLevel::Info, format!("已停用提示词模块 `{key}`"));
        }
        PromptsCommand::Reset { key: Some(key), .. } => {
            prompts.reset(&key)?;
            workspace.log(LogLevel::Info, format!("已恢复 `{key}` 的内置提示词"));
        }
        PromptsCommand::Reset { key: None, all: true } => {
            prompts.reset_catalog()?;
            workspace.log(LogLevel::Info, "已恢复所有提示词模块的默认开关");
        }
        PromptsCommand::Reset { key: None, all: false } => {
            return Err(CliError::Usage("请指定 --key 或 --all".to_string()));
        }
        PromptsCommand::Save { key, file } => {
            let content = read_text_file(&file)?;
            let path = prompts.save_override(&key, &content)?;
            workspace.log(
                LogLevel::Info,
                format!("提示词 `{key}` 已保存到 {}", path.display()),
            );
        }
    }
    Ok(())
}

fn handle_config(config_path: &Path, command: ConfigCommand) -> Result<(), CliError> {
    let mut store = ConfigStore::open(config_path)?;
    let sink = StdoutLogSink::new();

    match command {
        ConfigCommand::TestLlm(args) => {
            let name = store.config().llm_profile(args.interface.as_deref())?.0.to_string();
            sink.log(LogRecord::new(LogLevel::Info, format!("开始测试 LLM 配置：{name}")));
            let model = create_llm_adapter(store.config(), Some(&name))?;
            let response = model.invoke("Please reply 'OK'", None)?;
            if response.trim().is_empty() {
                return Err(CliError::TestFailed("LLM配置测试失败：未获取到响应".to_string()));
            }
            sink.log(LogRecord::new(LogLevel::Info, "✅ LLM配置测试成功！"));
            debug!("测试回复: {response}");
            store.touch_llm_interface(name);
        }
        ConfigCommand::TestEmbedding(args) => {
            let name = store
                .config()
                .embedding_profile(args.interface.as_deref())?
                .0
                .to_string();
            sink.log(LogRecord::new(
                LogLevel::Info,
                format!("开始测试 Embedding 配置：{name}"),
            ));
            let adapter = create_embedding_adapter(store.config(), Some(&name))?;
            let vector = adapter.embed_query("测试文本")?;
            if vector.is_empty() {
                return Err(CliError::TestFailed(
                    "Embedding配置测试失败：未获取到向量".to_string(),
                ));
            }
            sink.log(LogRecord::new(
                LogLevel::Info,
                format!("✅ Embedding配置测试成功！向量维度：{}", vector.len()),
            ));
            store.touch_embedding_interface(name);
        }
    }
    store.save()?;
    Ok(())
}

fn ensure_output_dir(store: &ConfigStore) -> Result<PathBuf, CliError> {
    let output = store.config().novel.filepath.trim();
    if output.is_empty() {
        Err(CliError::MissingOutputDir)
    } else {
        Ok(PathBuf::from(output))
    }
}

fn ensure_chapter_number(id: u32) -> Result<u32, CliError> {
    if id == 0 {
        Err(CliError::InvalidChapterNumber(id))
    } else {
        Ok(id)
    }
}

fn read_text_file(path: &Path) -> Result<String, CliError> {
    fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Novel(#[from] NovelError),
    #[error("适配器调用失败: {0}")]
    Adapter(#[from] AdapterError),
    #[error("小说输出目录未配置，请在 config.json 的 novel.filepath 中填写或使用 init --dir。")]
    MissingOutputDir,
    #[error("章节编号必须从 1 开始，收到 {0}")]
    InvalidChapterNumber(u32),
    #[error("章节范围无效：{from}..={to}")]
    InvalidChapterRange { from: u32, to: u32 },
    #[error("读取文件 `{path}` 失败: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("{0}")]
    Incomplete(String),
    #[error("{0}")]
    Usage(String),
    #[error("{0}")]
    TestFailed(String),
}

macro_rules! into_novel_error {
    ($($source:ty),* $(,)?) => {
        $(impl From<$source> for CliError {
            fn from(error: $source) -> Self {
                CliError::Novel(error.into())
            }
        })*
    };
}

into_novel_error!(
    PipelineError,
    ConfigError,
    ArtifactError,
    PromptError,
    ValidationError,
    VectorStoreError,
    LanguageModelError,
    EmbeddingModelError,
);

#[derive(Parser)]
#[command(name = "novelctl", version, about = "AI 小说生成命令行工具")]
struct Cli {
    /// 指定配置文件路径
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    /// 进度日志改走 `log` 输出（受 RUST_LOG 控制），不再打印到标准输出
    #[arg(long, short, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 保存小说设定（seed.json）并显示分卷方案
    Init(InitArgs),
    /// 小说架构相关操作
    #[command(subcommand)]
    Architecture(ArchitectureCommand),
    /// 章节蓝图相关操作
    #[command(subcommand)]
    Blueprint(BlueprintCommand),
    /// 单章操作
    #[command(subcommand)]
    Chapter(ChapterCommand),
    /// 按顺序生成并定稿一段章节
    Batch(BatchArgs),
    /// 架构、蓝图、剩余章节一次跑完
    Run(RunArgs),
    /// 提示词模块管理
    #[command(subcommand)]
    Prompts(PromptsCommand),
    /// 配置测试
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum ArchitectureCommand {
    /// 生成或续跑小说架构
    Generate(InterfaceArgs),
}

#[derive(Subcommand)]
enum BlueprintCommand {
    /// 生成或续跑章节蓝图
    Generate(InterfaceArgs),
}

#[derive(Subcommand)]
enum ChapterCommand {
    /// 生成章节草稿
    Draft(ChapterDraftArgs),
    /// 定稿章节，更新摘要、角色状态、伏笔记录与向量库
    Finalize(ChapterArgs),
    /// 扩写章节
    Enrich(EnrichArgs),
}

#[derive(Subcommand)]
enum PromptsCommand {
    /// 列出提示词模块及其状态
    List,
    /// 启用模块
    Enable {
        #[arg(long)]
        key: String,
    },
    /// 停用模块
    Disable {
        #[arg(long)]
        key: String,
    },
    /// 删除自定义提示词，或用 --all 恢复所有模块开关
    Reset {
        #[arg(long, conflicts_with = "all")]
        key: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// 用文件内容保存自定义提示词
    Save {
        #[arg(long)]
        key: String,
        #[arg(long, value_name = "FILE")]
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// 测试 LLM 接口配置
    TestLlm(TestArgs),
    /// 测试 Embedding 接口配置
    TestEmbedding(TestArgs),
}

#[derive(Args)]
struct TestArgs {
    /// 指定要测试的接口名称，默认为最近使用的接口
    #[arg(long)]
    interface: Option<String>,
}

#[derive(Args)]
struct InitArgs {
    #[arg(long)]
    topic: Option<String>,
    #[arg(long)]
    genre: Option<String>,
    /// 目标章节数
    #[arg(long, value_name = "N")]
    chapters: Option<u32>,
    /// 每章字数
    #[arg(long, value_name = "N")]
    words: Option<u32>,
    /// 分卷数，0 或 1 表示不分卷
    #[arg(long, value_name = "N")]
    volumes: Option<u32>,
    /// 全局创作指导
    #[arg(long, value_name = "TEXT")]
    guidance: Option<String>,
    /// 项目目录
    #[arg(long, value_name = "DIR")]
    dir: Option<PathBuf>,
}

#[derive(Args, Default)]
struct InterfaceArgs {
    /// LLM 接口名称，默认为最近使用的接口
    #[arg(long)]
    llm_interface: Option<String>,
    /// Embedding 接口名称，默认为最近使用的接口
    #[arg(long)]
    embedding_interface: Option<String>,
    /// 所有确认问题自动回答“是”
    #[arg(long, short = 'y')]
    yes: bool,
}

#[derive(Args, Default)]
struct GuidanceArgs {
    /// 本章的额外剧情指导
    #[arg(long, value_name = "TEXT")]
    guidance: Option<String>,
    /// 出场角色
    #[arg(long, value_name = "TEXT")]
    characters: Option<String>,
    /// 关键道具
    #[arg(long, value_name = "TEXT")]
    items: Option<String>,
    /// 场景地点
    #[arg(long, value_name = "TEXT")]
    scene: Option<String>,
    /// 时间限制
    #[arg(long, value_name = "TEXT")]
    time: Option<String>,
}

impl GuidanceArgs {
    fn into_guidance(self) -> ChapterGuidance {
        ChapterGuidance {
            user_guidance: self.guidance.unwrap_or_default(),
            characters_involved: self.characters.unwrap_or_default(),
            key_items: self.items.unwrap_or_default(),
            scene_location: self.scene.unwrap_or_default(),
            time_constraint: self.time.unwrap_or_default(),
        }
    }
}

#[derive(Args)]
struct ChapterArgs {
    /// 章节编号
    #[arg(long, value_name = "ID")]
    id: u32,
    #[command(flatten)]
    interface: InterfaceArgs,
}

#[derive(Args)]
struct ChapterDraftArgs {
    /// 章节编号
    #[arg(long, value_name = "ID")]
    id: u32,
    /// 直接使用该文件中的提示词生成草稿
    #[arg(long, value_name = "FILE")]
    prompt_file: Option<PathBuf>,
    #[command(flatten)]
    guidance: GuidanceArgs,
    #[command(flatten)]
    interface: InterfaceArgs,
}

#[derive(Args)]
struct EnrichArgs {
    /// 章节编号
    #[arg(long, value_name = "ID")]
    id: u32,
    /// 目标字数，默认使用设定中的每章字数
    #[arg(long, value_name = "N")]
    words: Option<u32>,
    #[command(flatten)]
    interface: InterfaceArgs,
}

#[derive(Args)]
struct BatchArgs {
    /// 起始章节
    #[arg(long, value_name = "N")]
    from: u32,
    /// 结束章节（含），默认到最后一章
    #[arg(long, value_name = "N")]
    to: Option<u32>,
    #[command(flatten)]
    guidance: GuidanceArgs,
    #[command(flatten)]
    interface: InterfaceArgs,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    guidance: GuidanceArgs,
    #[command(flatten)]
    interface: InterfaceArgs,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_tree_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn batch_arguments_parse() {
        let cli = Cli::try_parse_from([
            "novelctl",
            "--config",
            "novel.json",
            "batch",
            "--from",
            "3",
            "--to",
            "5",
            "--scene",
            "钟楼",
            "-y",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("novel.json"));
        match cli.command {
            Command::Batch(args) => {
                assert_eq!((args.from, args.to), (3, Some(5)));
                assert!(args.interface.yes);
                let guidance = args.guidance.into_guidance();
                assert_eq!(guidance.scene_location, "钟楼");
                assert!(guidance.user_guidance.is_empty());
            }
            _ => panic!("expected batch"),
        }
    }

    #[test]
    fn batch_range_defaults_to_last_chapter() {
        assert_eq!(batch_range(4, None, 10).unwrap(), 4..=10);
        assert!(matches!(
            batch_range(0, Some(3), 10),
            Err(CliError::InvalidChapterRange { .. })
        ));
        assert!(batch_range(6, Some(5), 10).is_err());
    }

    #[test]
    fn confirmation_answers() {
        assert_eq!(parse_answer("y\n"), Some(true));
        assert_eq!(parse_answer(" 是 "), Some(true));
        assert_eq!(parse_answer("\n"), Some(false));
        assert_eq!(parse_answer("maybe"), None);
    }

    #[test]
    fn prompts_reset_requires_a_target() {
        let cli = Cli::try_parse_from(["novelctl", "prompts", "reset", "--all"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Prompts(PromptsCommand::Reset { key: None, all: true })
        ));
        assert!(Cli::try_parse_from(["novelctl", "prompts", "reset", "--key", "a", "--all"]).is_err());
    }
}
