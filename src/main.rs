use std::io::{BufRead, Write};

use clap::Parser;
use tracing_subscriber::EnvFilter;
use vulnrag::{
    DataDir,
    RagRetriever,
    Settings,
    dataset,
    embedding,
    error::{self, Error},
    indexer::VectorIndexer,
    model_manager,
    prompt,
    report,
    retriever::{FallbackPolicy, RetrievalResult, RetrieverOptions},
    session::{AnalysisChatService, DEFAULT_SYSTEM_PROMPT, DataTable, SessionStore},
    vector_store::{VectorStore, keys},
};

mod cli;

use cli::{Cli, Command};

pub const LOG_ENV_VAR: &str = "VULNRAG_LOG";

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var(LOG_ENV_VAR) {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> error::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let settings = resolve_settings(&cli, &data_dir)?;

    match cli.command {
        Command::BuildIndex(args) => cmd_build_index(&settings, &args)?,
        Command::Search(args) => cmd_search(settings, &args)?,
        Command::Ask(args) => {
            let mut retriever = RagRetriever::new(settings);
            retriever.load()?;
            let answer =
                retriever.ask(&args.question, args.count, !args.no_citations)?;
            println!("{answer}");
        }
        Command::Chat(args) => cmd_chat(settings, &args)?,
        Command::Report(args) => {
            let prompts = report::load_prompts(&args.prompts)?;
            let output = match args.output {
                Some(path) => path,
                None => report::default_report_path(&data_dir)?,
            };
            let mut retriever = RagRetriever::new(settings);
            let path = report::summarize_with_rag(&mut retriever, &prompts, &output)?;
            println!("{}", path.display());
        }
        Command::DownloadModel(args) => {
            let model = args
                .model
                .unwrap_or_else(|| settings.local_embedding_model.clone());
            let path = model_manager::download(
                &model,
                args.revision.as_deref(),
                args.target_dir.as_deref(),
            )?;
            println!("{}", path.display());
        }
        Command::Status(args) => cmd_status(&data_dir, &settings, args.json)?,
        Command::Completions(_) => {}
    }

    Ok(())
}

/// Environment settings with command-line overrides applied.
fn resolve_settings(cli: &Cli, data_dir: &DataDir) -> error::Result<Settings> {
    let mut settings = Settings::from_env(data_dir)?;
    if let Some(dir) = &cli.index_dir {
        settings.index_root = dir.clone();
    }
    if let Some(dir) = &cli.dataset_dir {
        settings.dataset_dir = dir.clone();
    }
    if let Some(backend) = cli.embedding_backend {
        settings.embedding_backend = backend;
    }
    if let Some(model) = &cli.embedding_model {
        settings.embedding_model_override = Some(model.clone());
    }
    Ok(settings)
}

fn cmd_build_index(
    settings: &Settings,
    args: &cli::BuildIndexArgs,
) -> error::Result<()> {
    eprintln!("Loading dataset from {}...", settings.dataset_dir.display());
    let loaded = dataset::load_documents(&settings.dataset_dir)?;
    eprintln!("  Found {} documents", loaded.documents.len());
    for (path, reason) in &loaded.skipped_files {
        eprintln!("  Skipped {}: {reason}", path.display());
    }
    if loaded.skipped_records > 0 {
        eprintln!("  Skipped {} non-record entries", loaded.skipped_records);
    }

    let embedder = embedding::resolve(
        settings.embedding_backend,
        settings.embedding_model(),
        settings,
    )?;
    eprintln!(
        "Embedding with {} backend ({})...",
        embedder.backend(),
        embedder.model_id()
    );

    let indexer = VectorIndexer::new(embedder.as_ref(), &settings.index_root);
    let built =
        indexer.build(&loaded.documents, args.batch_size, !args.no_progress);
    if !args.no_progress {
        // End the progress bar's line.
        eprintln!();
    }
    let path = built?;
    eprintln!("Index written to {}", path.display());
    Ok(())
}

fn cmd_search(settings: Settings, args: &cli::SearchArgs) -> error::Result<()> {
    let top_k = args.count.unwrap_or(settings.default_top_k);
    let options = RetrieverOptions {
        fallback: if args.strict {
            FallbackPolicy::Strict
        } else {
            FallbackPolicy::Unfiltered
        },
        ..Default::default()
    };

    let mut retriever = RagRetriever::new(settings).with_options(options);
    retriever.load()?;
    let results = retriever.retrieve(&args.query, &args.filters(), top_k)?;

    if args.json {
        let out = serde_json::json!({
            "query": args.query,
            "result_count": results.len(),
            "results": results,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        format_human(&results);
    }
    Ok(())
}

fn format_human(results: &[RetrievalResult]) {
    if results.is_empty() {
        println!("No results found.");
        return;
    }

    for (i, r) in results.iter().enumerate() {
        let rank = i + 1;
        let mut details = Vec::new();
        if let Some(year) = r.metadata.year {
            details.push(year.to_string());
        }
        if let Some(severity) = r.metadata.severity {
            details.push(severity.to_string());
        }
        if let Some(score) = r.metadata.score {
            details.push(format!("CVSS {score}"));
        }
        println!(
            "{rank:>3}. [{:.3}] {}",
            r.score,
            prompt::source_label(r, rank)
        );
        if !details.is_empty() {
            println!("     {}", details.join(", "));
        }
    }
    println!("\n{} result(s)", results.len());
}

fn cmd_chat(settings: Settings, args: &cli::ChatArgs) -> error::Result<()> {
    let raw: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&args.data)?)?;
    let table = DataTable::from_json(raw)?;
    let system_prompt = args
        .system_prompt
        .as_deref()
        .unwrap_or(DEFAULT_SYSTEM_PROMPT);

    let mut retriever = RagRetriever::new(settings);
    retriever.load()?;
    if !retriever.can_generate() {
        return Err(Error::Config(format!(
            "{} must be set to chat",
            vulnrag::config::env::API_KEY
        )));
    }

    let mut sessions = SessionStore::new();
    let mut service = AnalysisChatService::new(&retriever, &mut sessions);

    eprintln!("Generating analysis report...");
    let report = service.start_session(&args.session, &table, system_prompt)?;
    println!("{report}\n");

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        if matches!(message, "exit" | "quit") {
            break;
        }

        match service.send_message(&args.session, message) {
            Ok(answer) => println!("{answer}\n"),
            Err(e) => eprintln!("Error: {e}"),
        }
    }
    Ok(())
}

fn cmd_status(
    data_dir: &DataDir,
    settings: &Settings,
    json: bool,
) -> error::Result<()> {
    let index_path = settings.index_path();
    let store = match VectorStore::open(&index_path) {
        Ok(store) => Some(store),
        Err(Error::NotFound { .. }) => None,
        Err(e) => return Err(e),
    };

    let (documents, dimension, built_with) = match &store {
        Some(store) => (
            Some(store.len()?),
            store.dimension()?,
            store.get_setting(keys::EMBEDDING_MODEL)?,
        ),
        None => (None, None, None),
    };

    if json {
        let out = serde_json::json!({
            "data_dir": data_dir.root(),
            "index": index_path,
            "built": store.is_some(),
            "documents": documents,
            "dimension": dimension,
            "index_model": built_with,
            "embedding_backend": settings.embedding_backend.as_str(),
            "embedding_model": settings.embedding_model(),
            "chat_model": settings.chat_model,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("Data directory: {}", data_dir.root().display());
        println!("Dataset: {}", settings.dataset_dir.display());
        println!("Index: {}", index_path.display());
        match documents {
            Some(count) => {
                println!("Documents: {count}");
                println!("Dimension: {}", dimension.unwrap_or(0));
                if let Some(model) = &built_with {
                    println!("Built with: {model}");
                }
            }
            None => println!("Index not built yet."),
        }
        println!(
            "Embedding: {} ({})",
            settings.embedding_backend,
            settings.embedding_model()
        );
        println!("Chat model: {}", settings.chat_model);
    }
    Ok(())
}
