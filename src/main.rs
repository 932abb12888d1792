use querydeck::config::Settings;
use querydeck::repl;
use querydeck::session::Session;
use std::io::{self, IsTerminal, Read};
use std::process::ExitCode;
use tracing::{error, info};

fn main() -> ExitCode {
    // Logs go to stderr; stdout carries only JSON records
    tracing_subscriber::fmt().with_writer(io::stderr).init();

    info!("Starting querydeck...");

    // Parse CLI arguments: [--config <path>] [database]
    let mut args = std::env::args().skip(1);
    let mut config_path = None;
    let mut database = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config_path = args.next(),
            _ => database = Some(arg),
        }
    }

    let settings = match config_path {
        Some(path) => Settings::load(&path),
        None => Settings::load_or_default(),
    };
    let settings = match settings {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load settings: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let session = Session::with_sqlite(settings);
    let stdin = io::stdin();
    let interactive = stdin.is_terminal();

    let result = match database {
        Some(path) => {
            // Open the database first, as if `:open <path>` had been typed
            let script = format!(":open {}\n", path);
            let input = io::Cursor::new(script).chain(stdin.lock());
            repl::run_repl(&session, input, io::stdout().lock(), interactive)
        }
        None => repl::run_repl(&session, stdin.lock(), io::stdout().lock(), interactive),
    };

    session.shutdown();
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("I/O error: {}", e);
            ExitCode::FAILURE
        }
    }
}
