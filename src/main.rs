mod config;
mod db;
mod encoding;
mod indexer;
mod language;
mod logging;
mod scanner;
mod search;
mod subtitle;

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

use config::Config;
use db::{Database, FtsCorruption};
use indexer::{IndexState, Indexer, StatusHandler, Strategy};
use search::{MediaKind, SearchMode, SearchRequest, SearchService, Sort};

const EXIT_CONFIG: i32 = 2;
const EXIT_DB: i32 = 3;
const EXIT_FTS: i32 = 4;

enum Command {
    Index { full: bool },
    Search(SearchRequest),
    Status,
    Reset,
    Bookmark { media_path: String, start_ms: u64, on: bool },
    Tag { add: bool, media_path: String, start_ms: u64, tag: String },
    Tags { media_path: String, start_ms: u64 },
}

fn main() {
    let (config_path, command) = parse_args();

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Config error: {:#}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    // Logs live next to the database; the guard flushes them on exit.
    let _log_guard = logging::init(&config.log_dir()).ok();

    let db = match open_database(&config) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            if e.downcast_ref::<FtsCorruption>().is_some() {
                eprintln!("Unrecoverable FTS corruption: {:#}", e);
                std::process::exit(EXIT_FTS);
            }
            eprintln!("Database error: {:#}", e);
            std::process::exit(EXIT_DB);
        }
    };

    if let Err(e) = run(command, config, db) {
        if e.downcast_ref::<FtsCorruption>().is_some() {
            eprintln!("Unrecoverable FTS corruption: {:#}", e);
            std::process::exit(EXIT_FTS);
        }
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    let config = match config_path {
        Some(path) => Config::load_from(&path)?,
        None => Config::load()?,
    };
    config.validate()?;
    Ok(config)
}

fn open_database(config: &Config) -> Result<Database> {
    let db = Database::open(&config.db_path, config.busy_timeout_ms)?;
    db.initialize()?;
    Ok(db)
}

fn run(command: Command, config: Config, db: Arc<Database>) -> Result<()> {
    match command {
        Command::Index { full } => {
            if config.root_dir.is_none() {
                anyhow::bail!("root_dir is not configured; nothing to index");
            }
            let status = Arc::new(StatusHandler::load(
                config.status_file_path(),
                config.log_ring_size,
            ));
            let indexer = Indexer::new(config, db, status);
            let progress = indexer.subscribe();
            let strategy = if full { Strategy::Full } else { Strategy::Incremental };
            indexer.start(strategy)?;

            // Foreground: print coarse progress until the run drains.
            let printer = std::thread::spawn(move || {
                let mut last_printed = 0u64;
                for snapshot in progress.iter() {
                    let done = matches!(
                        snapshot.state,
                        IndexState::Stopped | IndexState::Completed | IndexState::Failed
                    );
                    if done || snapshot.processed_files >= last_printed + 25 {
                        last_printed = snapshot.processed_files;
                        eprintln!(
                            "[{}] {}/{} files, {} cues{}",
                            snapshot.state.as_str(),
                            snapshot.processed_files,
                            snapshot.total_files,
                            snapshot.subtitle_count,
                            snapshot
                                .eta_seconds
                                .map(|s| format!(", ~{}s left", s))
                                .unwrap_or_default(),
                        );
                    }
                    if done {
                        break;
                    }
                }
            });
            indexer.wait();
            let _ = printer.join();

            let status = indexer.status();
            match status.state {
                IndexState::Failed => {
                    anyhow::bail!(
                        "indexing failed: {}",
                        status.error.unwrap_or_else(|| "unknown error".into())
                    )
                }
                _ => {
                    println!(
                        "{}: {} files processed, {} skipped, {} cues in corpus",
                        status.state.as_str(),
                        status.processed_files,
                        status.skipped_files,
                        status.subtitle_count
                    );
                    Ok(())
                }
            }
        }
        Command::Search(request) => {
            let service = SearchService::new(db);
            let response = service.search(&request)?;
            if let Some(warning) = &response.warning {
                eprintln!("warning: {}", warning);
            }
            println!("{} result(s)", response.total);
            for hit in &response.results {
                println!(
                    "{}  {} --> {}  [{}]{}{}",
                    hit.media_path,
                    subtitle::format_timestamp(hit.start_ms),
                    subtitle::format_timestamp(hit.end_ms),
                    hit.lang,
                    if hit.is_bookmarked { " *" } else { "" },
                    if hit.tags.is_empty() {
                        String::new()
                    } else {
                        format!(" #{}", hit.tags.join(" #"))
                    },
                );
                println!("    {}", hit.content.replace('\n', "\n    "));
            }
            Ok(())
        }
        Command::Status => {
            // Peek only: another process may own the run recorded here.
            let status = StatusHandler::read_snapshot(&config.status_file_path());
            println!("state:           {}", status.state.as_str());
            println!(
                "progress:        {}/{} files",
                status.processed_files, status.total_files
            );
            if let Some(path) = &status.current_path {
                println!("current:         {}", path);
            }
            if status.state.is_active() {
                if let Some(pid) = status.pid {
                    println!("owner pid:       {}", pid);
                }
            }
            let stats = db.corpus_stats()?;
            println!("media files:     {} ({} with subtitles)", stats.media_count, stats.with_subtitle);
            println!("cues:            {}", stats.cue_count);
            for (lang, count) in &stats.languages {
                println!("  {:<8} {}", lang, count);
            }
            println!("database size:   {} bytes", stats.db_size_bytes);
            Ok(())
        }
        Command::Reset => {
            // load() keeps an active status whose owner is still alive, so
            // reset() below refuses while another process is indexing.
            let status = Arc::new(StatusHandler::load(
                config.status_file_path(),
                config.log_ring_size,
            ));
            let indexer = Indexer::new(config, db, status);
            indexer.reset()?;
            println!("corpus reset");
            Ok(())
        }
        Command::Bookmark { media_path, start_ms, on } => {
            db.toggle_bookmark(&media_path, start_ms, on)?;
            println!(
                "bookmark {} for {} @ {}ms",
                if on { "set" } else { "cleared" },
                media_path,
                start_ms
            );
            Ok(())
        }
        Command::Tag { add, media_path, start_ms, tag } => {
            if add {
                db.add_tag(&media_path, start_ms, &tag)?;
            } else {
                db.remove_tag(&media_path, start_ms, &tag)?;
            }
            println!(
                "tag '{}' {} for {} @ {}ms",
                tag,
                if add { "added" } else { "removed" },
                media_path,
                start_ms
            );
            Ok(())
        }
        Command::Tags { media_path, start_ms } => {
            for tag in db.list_tags(&media_path, start_ms)? {
                println!("{}", tag);
            }
            Ok(())
        }
    }
}

fn parse_args() -> (Option<PathBuf>, Command) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut rest: Vec<String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("subdex {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(EXIT_CONFIG);
                }
            }
            other => rest.push(other.to_string()),
        }
        i += 1;
    }

    let command = match parse_command(&rest) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(EXIT_CONFIG);
        }
    };
    (config_path, command)
}

fn parse_command(rest: &[String]) -> Result<Command> {
    let Some(subcommand) = rest.first() else {
        anyhow::bail!("missing command");
    };
    match subcommand.as_str() {
        "index" => {
            let mut full = false;
            for arg in &rest[1..] {
                match arg.as_str() {
                    "--full" => full = true,
                    other => anyhow::bail!("unknown index option: {}", other),
                }
            }
            Ok(Command::Index { full })
        }
        "search" => parse_search(&rest[1..]),
        "status" => Ok(Command::Status),
        "reset" => Ok(Command::Reset),
        "bookmark" => {
            let [media_path, start_ms, state] = &rest[1..] else {
                anyhow::bail!("usage: bookmark <media_path> <start_ms> <on|off>");
            };
            let on = match state.as_str() {
                "on" => true,
                "off" => false,
                other => anyhow::bail!("expected on|off, got '{}'", other),
            };
            Ok(Command::Bookmark {
                media_path: media_path.clone(),
                start_ms: start_ms.parse()?,
                on,
            })
        }
        "tag" => {
            let [action, media_path, start_ms, tag] = &rest[1..] else {
                anyhow::bail!("usage: tag <add|remove> <media_path> <start_ms> <tag>");
            };
            let add = match action.as_str() {
                "add" => true,
                "remove" => false,
                other => anyhow::bail!("expected add|remove, got '{}'", other),
            };
            Ok(Command::Tag {
                add,
                media_path: media_path.clone(),
                start_ms: start_ms.parse()?,
                tag: tag.clone(),
            })
        }
        "tags" => {
            let [media_path, start_ms] = &rest[1..] else {
                anyhow::bail!("usage: tags <media_path> <start_ms>");
            };
            Ok(Command::Tags {
                media_path: media_path.clone(),
                start_ms: start_ms.parse()?,
            })
        }
        other => anyhow::bail!("unknown command: {}", other),
    }
}

fn take_value<'a>(args: &'a [String], i: usize) -> Result<&'a String> {
    args.get(i + 1)
        .ok_or_else(|| anyhow::anyhow!("{} requires a value", args[i]))
}

fn parse_search(args: &[String]) -> Result<Command> {
    let mut request = SearchRequest::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--mode" => {
                request.mode = take_value(args, i)?.parse::<SearchMode>()?;
                i += 1;
            }
            "--lang" => {
                request.lang = Some(take_value(args, i)?.clone());
                i += 1;
            }
            "--kind" => {
                request.media_kind = Some(take_value(args, i)?.parse::<MediaKind>()?);
                i += 1;
            }
            "--from" => {
                request.time_range.min_start_ms = Some(take_value(args, i)?.parse()?);
                i += 1;
            }
            "--to" => {
                request.time_range.max_start_ms = Some(take_value(args, i)?.parse()?);
                i += 1;
            }
            "--sort" => {
                request.sort = take_value(args, i)?.parse::<Sort>()?;
                i += 1;
            }
            "--page" => {
                request.page = take_value(args, i)?.parse()?;
                i += 1;
            }
            "--per-page" => {
                request.per_page = take_value(args, i)?.parse()?;
                i += 1;
            }
            "--media-only" => request.media_only = true,
            term if !term.starts_with("--") => {
                if !request.query.is_empty() {
                    request.query.push(' ');
                }
                request.query.push_str(term);
            }
            other => anyhow::bail!("unknown search option: {}", other),
        }
        i += 1;
    }
    if request.query.is_empty() {
        anyhow::bail!("search requires a query");
    }
    Ok(Command::Search(request))
}

fn print_help() {
    println!(
        r#"subdex - subtitle indexing and search for local media libraries

USAGE:
    subdex [OPTIONS] <COMMAND>

COMMANDS:
    index [--full]          Index media/subtitle pairs under root_dir
                            (incremental by default)
    search <QUERY> [...]    Search the corpus
        --mode like|fts     Substring or full-text matching (default: fts)
        --lang LANG         Filter by language tag
        --kind video|audio  Filter by media kind
        --from MS --to MS   Filter by cue start time (milliseconds)
        --sort relevance|recent|oldest
        --page N --per-page N
        --media-only        Only cues whose media file still exists
    status                  Show indexing status and corpus statistics
    reset                   Wipe the corpus and start fresh
    bookmark <PATH> <MS> <on|off>
    tag <add|remove> <PATH> <MS> <TAG>
    tags <PATH> <MS>

OPTIONS:
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    SUBDEX_LOG          Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/subdex/config.toml"#
    );
}
