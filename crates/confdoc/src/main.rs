use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use confdoc_core::config::{
    ConnectionOverrides, UserConfig, load_config, save_config, split_labels,
};
use confdoc_core::confluence::{ConfluenceClient, ConfluenceClientConfig};
use confdoc_core::directives::{AttributeInputs, PageAttributes};
use confdoc_core::runtime::{
    ConfigOverrides, ResolutionContext, ResolvedRuntime, normalize_for_display, resolve_runtime,
};
use confdoc_core::upload::{
    SourceDocument, UploadOptions, UploadReport, UploadSource, now_label, prepare_upload,
    read_file_source, read_source, upload_with_store,
};
use confdoc_core::watch::{
    AddWatchResult, RemoveWatchResult, WatchEvent, WatchRegistration, WatchSession,
    add_watch_paths, remove_watch_paths,
};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "confdoc",
    version,
    about = "Upload local files into Confluence pages as code, html or panel macros"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", help = "User config file (default ~/.confdoc)")]
    config: Option<PathBuf>,
    #[arg(short, long, global = true, help = "Debug logging and change summaries")]
    verbose: bool,
    #[arg(short, long, global = true, help = "Only print upload results")]
    quiet: bool,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    config: Option<PathBuf>,
    verbose: bool,
    quiet: bool,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            config: cli.config.clone(),
            verbose: cli.verbose,
            quiet: cli.quiet,
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Upload a file (or stdin) into a Confluence page")]
    Upload(UploadArgs),
    #[command(about = "Manage the watch list and re-upload files when they change")]
    Watch(WatchArgs),
}

#[derive(Debug, Args)]
struct ConnectionArgs {
    #[arg(long, value_name = "URL", help = "Confluence base URL")]
    server: Option<String>,
    #[arg(long, value_name = "USER")]
    username: Option<String>,
    #[arg(long, value_name = "PASSWORD")]
    password: Option<String>,
}

impl ConnectionArgs {
    fn overrides(&self) -> ConnectionOverrides {
        ConnectionOverrides {
            server: self.server.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

#[derive(Debug, Args)]
struct UploadArgs {
    #[arg(value_name = "FILE", help = "File to upload; omit or pass @ to read stdin")]
    file: Option<String>,
    #[command(flatten)]
    connection: ConnectionArgs,
    #[arg(short = 'k', long, value_name = "SPACE")]
    space_key: Option<String>,
    #[arg(short = 'o', long, value_name = "ID", help = "Parent page id for new pages")]
    parent_id: Option<String>,
    #[arg(short = 'i', long, value_name = "ID")]
    page_id: Option<String>,
    #[arg(short = 't', long)]
    title: Option<String>,
    #[arg(long, help = "Search query used to find the page (defaults to the title)")]
    query: Option<String>,
    #[arg(short = 'm', long = "macro", value_name = "MACRO", help = "code, html or panel")]
    macro_name: Option<String>,
    #[arg(short = 'l', long = "labels", value_name = "LABELS", help = "Comma-separated labels")]
    labels: Vec<String>,
    #[arg(short, long, help = "Update the page even when the content is unchanged")]
    force: bool,
    #[arg(long, help = "Print the upload report as JSON")]
    json: bool,
}

impl UploadArgs {
    fn attribute_inputs(&self) -> AttributeInputs {
        AttributeInputs {
            space_key: self.space_key.clone(),
            title: self.title.clone(),
            query: self.query.clone(),
            macro_name: self.macro_name.clone(),
            page_id: self.page_id.clone(),
            parent_id: self.parent_id.clone(),
            labels: split_labels(self.labels.iter().map(String::as_str)),
        }
    }
}

#[derive(Debug, Args)]
struct WatchArgs {
    #[command(subcommand)]
    command: WatchSubcommand,
}

#[derive(Debug, Subcommand)]
enum WatchSubcommand {
    #[command(about = "Add files to the watch list")]
    Add {
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,
    },
    #[command(about = "Remove files from the watch list")]
    Remove {
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,
    },
    #[command(about = "List watched files")]
    List,
    #[command(about = "Watch the listed files and upload them on change")]
    Run(WatchRunArgs),
}

#[derive(Debug, Args)]
struct WatchRunArgs {
    #[command(flatten)]
    connection: ConnectionArgs,
    #[arg(long, default_value_t = 500, value_name = "MS")]
    debounce_ms: u64,
    #[arg(short, long, help = "Update pages even when the content is unchanged")]
    force: bool,
}

/// Per-invocation state shared by the commands.
struct Session {
    runtime: ResolvedRuntime,
    config: UserConfig,
    options: RuntimeOptions,
}

impl Session {
    fn load(options: &RuntimeOptions) -> Result<Self> {
        let context = ResolutionContext::from_process()?;
        let runtime = resolve_runtime(
            &context,
            &ConfigOverrides {
                config: options.config.clone(),
            },
        )?;
        let config = load_config(&runtime.config_path)?;
        Ok(Self {
            runtime,
            config,
            options: options.clone(),
        })
    }

    fn verbose(&self) -> bool {
        self.options.verbose || self.config.verbose.unwrap_or(false)
    }

    fn client(&self, connection: &ConnectionArgs) -> Result<ConfluenceClient> {
        let settings = self.config.connection(&connection.overrides());
        ConfluenceClient::new(ConfluenceClientConfig::from_settings(&settings)?)
    }

    fn print_diagnostics(&self) {
        if self.options.diagnostics {
            println!("\n[diagnostics]\n{}", self.runtime.diagnostics());
        }
    }
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let options = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Commands::Upload(args) => run_upload(&options, args),
        Commands::Watch(WatchArgs { command }) => match command {
            WatchSubcommand::Add { files } => run_watch_add(&options, &files),
            WatchSubcommand::Remove { files } => run_watch_remove(&options, &files),
            WatchSubcommand::List => run_watch_list(&options),
            WatchSubcommand::Run(args) => run_watch(&options, args),
        },
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "confdoc=debug,confdoc_core=debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_upload(options: &RuntimeOptions, args: UploadArgs) -> Result<()> {
    let session = Session::load(options)?;
    let source = UploadSource::from_arg(args.file.as_deref());
    let document = read_source(&source, &session.runtime.cwd)?;
    let mut client = session.client(&args.connection)?;
    let upload_options = UploadOptions {
        force: args.force,
        ..UploadOptions::default()
    };

    let report = upload_document(
        &session,
        &mut client,
        &document,
        &args.attribute_inputs(),
        &upload_options,
    )?;
    if args.json {
        let rendered =
            serde_json::to_string_pretty(&report).context("failed to serialize upload report")?;
        println!("{rendered}");
    }
    session.print_diagnostics();
    Ok(())
}

fn upload_document(
    session: &Session,
    client: &mut ConfluenceClient,
    document: &SourceDocument,
    flags: &AttributeInputs,
    upload_options: &UploadOptions,
) -> Result<UploadReport> {
    let attributes = prepare_upload(
        document,
        &session.runtime.hostname,
        flags,
        &AttributeInputs::from_config(&session.config),
    )?;
    if !session.options.quiet {
        print_attributes(&attributes);
    }

    let report = upload_with_store(
        client,
        &attributes,
        &document.content,
        upload_options,
        &now_label(),
    )?;
    println!("{}", report.status_line());
    if session.verbose() {
        print_summary(&report);
    }
    Ok(report)
}

fn print_attributes(attributes: &PageAttributes) {
    println!("File:     {}", attributes.file);
    println!("SpaceKey: {}", attributes.space_key);
    println!("Title:    {}", attributes.title);
    println!("Query:    {}", attributes.query);
    println!("Macro:    {}", attributes.macro_kind.as_str());
    println!("PageId:   {}", format_id(attributes.page_id));
    println!("ParentId: {}", format_id(attributes.parent_id));
    println!("Labels:   {}", attributes.labels.join(","));
}

fn print_summary(report: &UploadReport) {
    println!("version: {}", report.version);
    println!("minor_change: {}", !report.changed);
    let summary = &report.summary;
    println!(
        "lines: +{} -{}",
        summary.lines_added, summary.lines_removed
    );
    println!(
        "digest: {} -> {}",
        summary
            .old_digest
            .map(|digest| digest.to_string())
            .unwrap_or_else(|| "<none>".to_string()),
        summary.new_digest
    );
    if report.conflict_retries > 0 {
        println!("conflict_retries: {}", report.conflict_retries);
    }
    println!("requests: {}", report.request_count);
}

fn format_id(id: Option<u64>) -> String {
    id.map(|id| id.to_string())
        .unwrap_or_else(|| "<none>".to_string())
}

fn run_watch_add(options: &RuntimeOptions, files: &[PathBuf]) -> Result<()> {
    let mut session = Session::load(options)?;
    let results = add_watch_paths(&mut session.config, files, &session.runtime.cwd);
    let mut added = false;
    for result in results {
        match result {
            AddWatchResult::Added(path) => {
                added = true;
                println!("Watching {}", display(&path));
            }
            AddWatchResult::AlreadyWatching(path) => {
                println!("Already watching {}", display(&path));
            }
            AddWatchResult::Missing { path, reason } => {
                debug!(path = %path.display(), reason = %reason, "cannot watch file");
                println!(
                    "Cannot watch {}. It does not exist or is not readable.",
                    display(&path)
                );
            }
        }
    }
    if added {
        save_config(&session.runtime.config_path, &session.config)?;
    }
    session.print_diagnostics();
    Ok(())
}

fn run_watch_remove(options: &RuntimeOptions, files: &[PathBuf]) -> Result<()> {
    let mut session = Session::load(options)?;
    let results = remove_watch_paths(&mut session.config, files, &session.runtime.cwd);
    let mut removed = false;
    for result in results {
        match result {
            RemoveWatchResult::Removed(path) => {
                removed = true;
                println!("No longer watching {}", display(&path));
            }
            RemoveWatchResult::NotWatching(path) => {
                println!("Was not watching {}", display(&path));
            }
        }
    }
    if removed {
        save_config(&session.runtime.config_path, &session.config)?;
    }
    session.print_diagnostics();
    Ok(())
}

fn run_watch_list(options: &RuntimeOptions) -> Result<()> {
    let session = Session::load(options)?;
    if session.config.watch.is_empty() {
        println!("Not watching any files.");
    } else {
        println!("Watching {} file(s)", session.config.watch.len());
        for path in &session.config.watch {
            println!("  {}", display(path));
        }
    }
    session.print_diagnostics();
    Ok(())
}

fn run_watch(options: &RuntimeOptions, args: WatchRunArgs) -> Result<()> {
    let mut session = Session::load(options)?;
    session.print_diagnostics();
    let mut client = session.client(&args.connection)?;
    let upload_options = UploadOptions {
        force: args.force,
        ..UploadOptions::default()
    };
    let no_flags = AttributeInputs::default();

    let (mut watcher, registrations) = WatchSession::start(
        &session.runtime.config_path,
        &session.config.watch,
        Duration::from_millis(args.debounce_ms),
    )?;
    print_registrations(&registrations, watcher.files().len());

    loop {
        for event in watcher.next_events()? {
            match event {
                WatchEvent::ConfigChanged => {
                    let config = match load_config(&session.runtime.config_path) {
                        Ok(config) => config,
                        Err(err) => {
                            error!("{err:#}");
                            continue;
                        }
                    };
                    session.config = config;
                    match session.client(&args.connection) {
                        Ok(rebuilt) => client = rebuilt,
                        Err(err) => error!("keeping previous connection: {err:#}"),
                    }
                    let registrations = watcher.replace_files(&session.config.watch)?;
                    println!("Configuration reloaded");
                    print_registrations(&registrations, watcher.files().len());
                }
                WatchEvent::FileChanged(path) => {
                    if let Err(err) = upload_changed_file(
                        &session,
                        &mut client,
                        &path,
                        &no_flags,
                        &upload_options,
                    ) {
                        error!(file = %crate::display(&path), "{err:#}");
                    }
                }
            }
        }
    }
}

fn upload_changed_file(
    session: &Session,
    client: &mut ConfluenceClient,
    path: &Path,
    flags: &AttributeInputs,
    upload_options: &UploadOptions,
) -> Result<()> {
    let document = read_file_source(path)?;
    upload_document(session, client, &document, flags, upload_options)?;
    Ok(())
}

fn print_registrations(registrations: &[WatchRegistration], watching: usize) {
    for registration in registrations {
        match registration {
            WatchRegistration::Watching(path) => println!("Watching {}", display(path)),
            WatchRegistration::Missing(path) => println!(
                "Cannot watch {}. It does not exist or is not readable.",
                display(path)
            ),
        }
    }
    if watching == 0 {
        println!("Not watching any files.");
    } else {
        println!("Watching {watching} file(s)");
    }
}

fn display(path: &Path) -> String {
    normalize_for_display(path)
}
