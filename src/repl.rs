use crate::core::{Result, SessionError};
use crate::executor::AsyncQueryResult;
use crate::session::{ExecuteOptions, Session};
use serde_json::{json, Value};
use std::io::{self, BufRead, Write};
use std::thread;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Represents a parsed REPL command.
#[derive(Debug, PartialEq)]
pub enum Command {
    Open(String),
    Test(String),
    Close(Option<String>),
    Use(String),
    Connections,
    Sql(String),
    NoCache(String),
    Exec(String),
    Poll(String),
    Wait(Option<String>),
    Cancel(String),
    CancelConnection,
    Remove(String),
    Active,
    Begin,
    Commit,
    Rollback,
    Hist(Option<String>),
    ClearHist,
    Cache,
    ClearCache,
    Tables,
    Count(String),
    Help,
    Quit,
    Unknown(String),
}

/// Parses a user input string into a corresponding `Command`.
///
/// If the input starts with a colon (`:`), it is interpreted as a command.
/// Otherwise, it is treated as SQL for the current connection.
pub fn parse_command(input: &str) -> Command {
    let input = input.trim();
    let Some(trimmed) = input.strip_prefix(':') else {
        return Command::Sql(input.to_string());
    };
    let (name, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (trimmed, ""),
    };
    let arg = || (!rest.is_empty()).then(|| rest.to_string());
    let required = |make: fn(String) -> Command| match arg() {
        Some(value) => make(value),
        None => Command::Unknown(input.to_string()),
    };

    match name {
        "open" => required(Command::Open),
        "test" => required(Command::Test),
        "close" => Command::Close(arg()),
        "use" => required(Command::Use),
        "conns" => Command::Connections,
        "run" => required(Command::Sql),
        "nocache" => required(Command::NoCache),
        "exec" => required(Command::Exec),
        "poll" => required(Command::Poll),
        "wait" => Command::Wait(arg()),
        "cancel" => match arg() {
            Some(id) => Command::Cancel(id),
            None => Command::CancelConnection,
        },
        "remove" => required(Command::Remove),
        "active" => Command::Active,
        "begin" => Command::Begin,
        "commit" => Command::Commit,
        "rollback" => Command::Rollback,
        "hist" => Command::Hist(arg()),
        "clearhist" => Command::ClearHist,
        "cache" => Command::Cache,
        "clearcache" => Command::ClearCache,
        "tables" => Command::Tables,
        "count" => required(Command::Count),
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        _ => Command::Unknown(input.to_string()),
    }
}

const HELP: &[&str] = &[
    ":open <path> - Connect and make it the current connection",
    ":test <path> - Check that a database can be opened",
    ":close [conn] - Disconnect (defaults to the current connection)",
    ":use <conn> - Switch the current connection",
    ":conns - List open connections",
    ":run <sql> - Start a query (plain SQL does the same)",
    ":nocache <sql> - Start a query bypassing the result cache",
    ":exec <sql> - Run a query and wait for its result",
    ":poll <id> - Show a query's current state",
    ":wait [id] - Poll until the query (default: the last one started) finishes",
    ":cancel [id] - Cancel a query, or whatever the current connection runs",
    ":remove <id> - Forget a query",
    ":active - List running queries",
    ":begin / :commit / :rollback - Transaction control",
    ":hist [term] - Show (or search) query history",
    ":clearhist - Clear query history",
    ":cache / :clearcache - Show or clear the result cache",
    ":tables - List tables of the current connection",
    ":count <sql> - Count the rows a query returns",
    ":quit - Exit",
];

/// Interprets commands against a session, tracking the current connection
pub struct Repl<'a> {
    session: &'a Session,
    current: Option<String>,
    last_query: Option<String>,
}

impl<'a> Repl<'a> {
    pub fn new(session: &'a Session) -> Self {
        Repl {
            session,
            current: None,
            last_query: None,
        }
    }

    pub fn current_connection(&self) -> Option<&str> {
        self.current.as_deref()
    }

    fn connection(&self) -> Result<&str> {
        self.current
            .as_deref()
            .ok_or_else(|| SessionError::ConnectionNotFound("no current connection; use :open".to_string()))
    }

    /// Runs one command and returns the JSON record to print
    pub fn execute(&mut self, command: Command) -> Result<Value> {
        let session = self.session;
        match command {
            Command::Open(path) => {
                let id = session.connect(&path)?;
                self.current = Some(id.clone());
                Ok(json!({ "connectionId": id }))
            }
            Command::Test(path) => {
                session.test_connection(&path)?;
                Ok(json!({ "ok": true }))
            }
            Command::Close(target) => {
                let id = match target {
                    Some(id) => id,
                    None => self.connection()?.to_string(),
                };
                session.disconnect(&id);
                if self.current.as_deref() == Some(id.as_str()) {
                    self.current = None;
                }
                Ok(json!({ "ok": true }))
            }
            Command::Use(id) => {
                if !session.is_connected(&id) {
                    return Err(SessionError::ConnectionNotFound(id));
                }
                self.current = Some(id.clone());
                Ok(json!({ "connectionId": id }))
            }
            Command::Connections => Ok(json!({ "connections": session.connection_ids() })),
            Command::Sql(sql) => {
                let id = session.execute_async_query(self.connection()?, &sql)?;
                self.last_query = Some(id.clone());
                Ok(json!({ "queryId": id }))
            }
            Command::NoCache(sql) => {
                let options = ExecuteOptions { use_cache: false };
                let id = session.execute_async_query_with(self.connection()?, &sql, options)?;
                self.last_query = Some(id.clone());
                Ok(json!({ "queryId": id }))
            }
            Command::Exec(sql) => to_value(&session.execute_query(
                self.connection()?,
                &sql,
                ExecuteOptions::default(),
            )?),
            Command::Poll(id) => to_value(&session.get_async_query_result(&id)?),
            Command::Wait(id) => {
                let id = id
                    .or_else(|| self.last_query.clone())
                    .ok_or_else(|| SessionError::QueryNotFound("no query started yet".to_string()))?;
                to_value(&wait_for(session, &id)?)
            }
            Command::Cancel(id) => Ok(json!({ "cancelled": session.cancel_async_query(&id) })),
            Command::CancelConnection => {
                Ok(json!({ "cancelled": session.cancel_query(self.connection()?)? }))
            }
            Command::Remove(id) => Ok(json!({ "removed": session.remove_async_query(&id) })),
            Command::Active => Ok(json!({ "queries": session.get_active_queries() })),
            Command::Begin => {
                session.begin_transaction(self.connection()?)?;
                Ok(json!({ "transaction": session.transaction_state(self.connection()?) }))
            }
            Command::Commit => {
                session.commit_transaction(self.connection()?)?;
                Ok(json!({ "transaction": session.transaction_state(self.connection()?) }))
            }
            Command::Rollback => {
                session.rollback_transaction(self.connection()?)?;
                Ok(json!({ "transaction": session.transaction_state(self.connection()?) }))
            }
            Command::Hist(term) => {
                let entries = match term {
                    Some(term) => session.search_query_history(&term),
                    None => session.get_query_history(),
                };
                to_value(&entries)
            }
            Command::ClearHist => {
                session.clear_query_history();
                Ok(json!({ "ok": true }))
            }
            Command::Cache => to_value(&session.get_cache_stats()),
            Command::ClearCache => {
                session.clear_cache();
                Ok(json!({ "ok": true }))
            }
            Command::Tables => Ok(json!({ "tables": session.get_tables(self.connection()?)? })),
            Command::Count(sql) => {
                Ok(json!({ "count": session.get_row_count(self.connection()?, &sql)? }))
            }
            Command::Help => Ok(json!({ "commands": HELP })),
            Command::Quit => Ok(json!({ "ok": true })),
            Command::Unknown(input) => Ok(json!({ "error": {
                "kind": "UnknownCommand",
                "message": format!("Unknown command: {}", input),
            }})),
        }
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn wait_for(session: &Session, query_id: &str) -> Result<AsyncQueryResult> {
    loop {
        let result = session.get_async_query_result(query_id)?;
        if result.status.is_terminal() {
            return Ok(result);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn error_record(err: &SessionError) -> Value {
    json!({ "error": { "kind": err.kind(), "message": err.to_string() } })
}

/// Reads commands line by line and writes one JSON record per command.
/// Stops at `:quit` or end of input. With `interactive` set, a banner and
/// prompts are written as well.
pub fn run_repl<R: BufRead, W: Write>(
    session: &Session,
    input: R,
    mut out: W,
    interactive: bool,
) -> io::Result<()> {
    let mut repl = Repl::new(session);

    if interactive {
        writeln!(out, "querydeck REPL. Type :help for commands, :quit to exit.")?;
    }

    let mut lines = input.lines();
    loop {
        if interactive {
            write!(out, "> ")?;
            out.flush()?;
        }
        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let command = parse_command(&line);
        let quit = command == Command::Quit;
        let record = repl.execute(command).unwrap_or_else(|e| error_record(&e));
        writeln!(out, "{}", record)?;
        out.flush()?;
        if quit {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::test_utils::MockDriverFactory;

    fn session() -> Session {
        Session::new(Settings::default(), MockDriverFactory::new())
    }

    #[test]
    fn test_parse_open_command() {
        let cmd = parse_command(":open database.db");
        assert_eq!(cmd, Command::Open("database.db".to_string()));
    }

    #[test]
    fn test_parse_commands_with_optional_args() {
        assert_eq!(parse_command(":cancel"), Command::CancelConnection);
        assert_eq!(
            parse_command(":cancel query_1"),
            Command::Cancel("query_1".to_string())
        );
        assert_eq!(parse_command(":hist"), Command::Hist(None));
        assert_eq!(
            parse_command(":hist  users "),
            Command::Hist(Some("users".to_string()))
        );
        assert_eq!(parse_command(":close"), Command::Close(None));
    }

    #[test]
    fn test_parse_run_keeps_whole_statement() {
        assert_eq!(
            parse_command(":run SELECT a, b FROM t WHERE x = 'y z'"),
            Command::Sql("SELECT a, b FROM t WHERE x = 'y z'".to_string())
        );
    }

    #[test]
    fn test_parse_missing_argument() {
        assert_eq!(parse_command(":open"), Command::Unknown(":open".to_string()));
        assert_eq!(parse_command(":poll"), Command::Unknown(":poll".to_string()));
    }

    #[test]
    fn test_parse_unknown_command() {
        let cmd = parse_command(":invalid");
        assert_eq!(cmd, Command::Unknown(":invalid".to_string()));
    }

    #[test]
    fn test_parse_sql_query() {
        let cmd = parse_command("SELECT * FROM users");
        assert_eq!(cmd, Command::Sql("SELECT * FROM users".to_string()));
    }

    #[test]
    fn test_sql_without_connection_is_an_error() {
        let session = session();
        let mut repl = Repl::new(&session);
        assert!(matches!(
            repl.execute(Command::Sql("SELECT 1".to_string())),
            Err(SessionError::ConnectionNotFound(_))
        ));
    }

    #[test]
    fn test_open_run_wait() {
        let session = session();
        let mut repl = Repl::new(&session);

        let opened = repl.execute(Command::Open("mock://db".to_string())).unwrap();
        assert_eq!(opened["connectionId"], "conn_1");
        assert_eq!(repl.current_connection(), Some("conn_1"));

        let started = repl.execute(Command::Sql("SELECT 1".to_string())).unwrap();
        let id = started["queryId"].as_str().unwrap().to_string();
        let done = repl.execute(Command::Wait(Some(id))).unwrap();
        assert_eq!(done["status"], "completed");
        assert_eq!(done["result"]["rows"][0][0], "1");

        let closed = repl.execute(Command::Close(None)).unwrap();
        assert_eq!(closed["ok"], true);
        assert_eq!(repl.current_connection(), None);
    }

    #[test]
    fn test_exec_returns_result_inline() {
        let session = session();
        let mut repl = Repl::new(&session);
        repl.execute(Command::Open("mock://db".to_string())).unwrap();

        assert_eq!(
            parse_command(":exec SELECT 1"),
            Command::Exec("SELECT 1".to_string())
        );
        let single = repl.execute(Command::Exec("SELECT 1".to_string())).unwrap();
        assert_eq!(single["result"]["rows"][0][0], "1");

        let script = repl
            .execute(Command::Exec("UPDATE t SET a = 1; SELECT 1".to_string()))
            .unwrap();
        assert_eq!(script["results"][0]["statement"], "UPDATE t SET a = 1");
        assert_eq!(script["results"][1]["data"]["rows"][0][0], "1");
    }

    #[test]
    fn test_run_repl_writes_json_lines() {
        let session = session();
        let input = b":open mock://db\n:begin\n:begin\n:rollback\n:quit\n:active\n";
        let mut out = Vec::new();
        run_repl(&session, &input[..], &mut out, false).unwrap();

        let lines: Vec<Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[1]["transaction"], "active");
        assert_eq!(lines[2]["error"]["kind"], "TransactionStateError");
        assert_eq!(lines[3]["transaction"], "none");
    }
}
