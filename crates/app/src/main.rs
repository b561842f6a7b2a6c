use std::fmt;
use std::time::Instant;

use pyq_core::Clock;
use pyq_core::model::{QuestionId, SessionFilter};
use services::{CurrentQuestion, PracticeApi, PracticeConfig, PracticeService, Reply};
use storage::FallbackStore;
use storage::repository::Storage;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
enum ArgsError {
    MissingValue { flag: &'static str },
    UnknownArg(String),
    InvalidDbUrl { raw: String },
    InvalidTimeLimit { raw: String },
    BlankId { flag: &'static str },
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
            ArgsError::InvalidTimeLimit { raw } => write!(f, "invalid --time-limit value: {raw}"),
            ArgsError::BlankId { flag } => write!(f, "{flag} must not be blank"),
        }
    }
}

impl std::error::Error for ArgsError {}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

fn require_id(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    let value = require_value(args, flag)?;
    if value.trim().is_empty() {
        return Err(ArgsError::BlankId { flag });
    }
    Ok(value)
}

#[derive(Debug, Clone)]
struct Args {
    db_url: String,
    user_id: String,
    session_id: Option<String>,
    name: Option<String>,
    filter: SessionFilter,
    time_limit: Option<i64>,
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cargo run -p app -- [--db <sqlite_url>] [--user <id>] [--session <id>]");
    eprintln!("                      [--exam <id>] [--subject <id>] [--chapter <id>] [--topic <id>]");
    eprintln!("                      [--name <text>] [--time-limit <minutes>] [--shuffle] [--unsolved]");
    eprintln!();
    eprintln!("Defaults:");
    eprintln!("  --db sqlite:pyq.sqlite3?mode=rwc");
    eprintln!("  --user local");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  PYQ_DB_URL, PYQ_USER_ID, PYQ_STORE_TIMEOUT_MS, PYQ_SHUFFLE_SEED, RUST_LOG");
}

impl Args {
    fn parse() -> Result<Self, ArgsError> {
        let mut db_url =
            std::env::var("PYQ_DB_URL").unwrap_or_else(|_| "sqlite:pyq.sqlite3?mode=rwc".into());
        let mut user_id = std::env::var("PYQ_USER_ID").unwrap_or_else(|_| "local".into());
        let mut session_id = None;
        let mut name = None;
        let mut filter = SessionFilter::new();
        let mut time_limit = None;

        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    let value = require_value(&mut args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    db_url = value;
                }
                "--user" => user_id = require_id(&mut args, "--user")?,
                "--session" => session_id = Some(require_id(&mut args, "--session")?),
                "--name" => name = Some(require_value(&mut args, "--name")?),
                "--exam" => filter.exam_id = Some(require_id(&mut args, "--exam")?),
                "--subject" => filter.subject_id = Some(require_id(&mut args, "--subject")?),
                "--chapter" => filter.chapter_id = Some(require_id(&mut args, "--chapter")?),
                "--topic" => filter.topic_id = Some(require_id(&mut args, "--topic")?),
                "--time-limit" => {
                    let value = require_value(&mut args, "--time-limit")?;
                    let minutes = value
                        .parse::<i64>()
                        .map_err(|_| ArgsError::InvalidTimeLimit { raw: value.clone() })?;
                    time_limit = Some(minutes);
                }
                "--shuffle" => filter.shuffle = true,
                "--unsolved" => filter.include_solved = false,
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        Ok(Self {
            db_url,
            user_id,
            session_id,
            name,
            filter,
            time_limit,
        })
    }
}

//
// ─── INTERACTIVE LOOP ──────────────────────────────────────────────────────────
//

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Show,
    Answer(String),
    Next,
    Previous,
    Jump(String),
    Progress,
    Pause,
    Resume,
    Sessions,
    Help,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        match head {
            "" | "show" | "s" => Some(Self::Show),
            "answer" | "a" if !rest.is_empty() => Some(Self::Answer(rest.to_owned())),
            "next" | "n" => Some(Self::Next),
            "prev" | "p" => Some(Self::Previous),
            "jump" | "j" if !rest.is_empty() => Some(Self::Jump(rest.to_owned())),
            "progress" => Some(Self::Progress),
            "pause" => Some(Self::Pause),
            "resume" => Some(Self::Resume),
            "sessions" | "ls" => Some(Self::Sessions),
            "help" | "?" => Some(Self::Help),
            "quit" | "q" | "exit" => Some(Self::Quit),
            _ => None,
        }
    }
}

fn print_commands() {
    println!("commands: show | answer <text> | next | prev | jump <n> | progress");
    println!("          pause | resume | sessions | help | quit");
}

fn report_failure<T>(reply: &Reply<T>) {
    if let Some(error) = &reply.error {
        println!("! {} ({:?})", error.message, error.kind);
    }
}

/// 1-based question number typed by the user to a 0-based index.
fn question_index(raw: &str) -> Option<i64> {
    raw.parse::<i64>().ok().map(|n| n.saturating_sub(1))
}

fn flag(reply_fallback: bool) -> &'static str {
    if reply_fallback { " [unsaved: fallback store]" } else { "" }
}

struct Driver {
    api: PracticeApi,
    user_id: String,
    session_id: String,
    question: Option<QuestionId>,
    shown_at: Instant,
}

impl Driver {
    async fn show(&mut self) {
        let reply = self.api.get_current(&self.session_id).await;
        let Some(current) = reply.data.as_ref() else {
            report_failure(&reply);
            return;
        };
        match current {
            CurrentQuestion::At(at) => {
                let nav = &at.nav;
                println!(
                    "\n[{}/{}] {}{}",
                    nav.current_index + 1,
                    nav.total_questions,
                    at.question.content,
                    flag(reply.fallback)
                );
                for (i, option) in at.question.options.iter().enumerate() {
                    println!("   {}. {option}", i + 1);
                }
                if let Some(year) = at.question.metadata.as_ref().and_then(|m| m.year) {
                    println!("   ({year})");
                }
                if let Some(previous) = &at.previous_attempt {
                    let verdict = if previous.is_correct { "correct" } else { "incorrect" };
                    println!("   previously answered {:?} ({verdict})", previous.user_answer);
                }
                if let Some(deadline) = at.deadline {
                    println!("   deadline {deadline}");
                }
                self.question = Some(at.question.id.clone());
                self.shown_at = Instant::now();
            }
            CurrentQuestion::NoneLeft { nav, .. } => {
                println!(
                    "\nno questions left ({} of {} answered){}",
                    nav.questions_answered,
                    nav.total_questions,
                    flag(reply.fallback)
                );
                self.question = None;
            }
        }
    }

    async fn answer(&mut self, text: &str) {
        let Some(question_id) = self.question.clone() else {
            println!("! no question on screen; use `show` first");
            return;
        };
        let seconds = i64::try_from(self.shown_at.elapsed().as_secs()).unwrap_or(i64::MAX);
        let reply = self
            .api
            .submit_answer(&self.session_id, question_id.as_str(), text, seconds)
            .await;
        let Some(grade) = reply.data.as_ref() else {
            report_failure(&reply);
            return;
        };
        if grade.is_correct {
            println!("correct{}", flag(reply.fallback));
        } else {
            println!(
                "incorrect, answer: {}{}",
                grade.correct_answer,
                flag(reply.fallback)
            );
        }
        if !grade.explanation.is_empty() {
            println!("   {}", grade.explanation);
        }
        println!("   session {}", grade.session_status);
    }

    async fn step(&mut self, direction: &str) {
        let reply = self.api.navigate(&self.session_id, direction).await;
        if reply.success {
            self.show().await;
        } else {
            report_failure(&reply);
        }
    }

    async fn jump(&mut self, raw: &str) {
        let Some(index) = question_index(raw) else {
            println!("! not a question number: {raw}");
            return;
        };
        let reply = self.api.jump(&self.session_id, index).await;
        if reply.success {
            self.show().await;
        } else {
            report_failure(&reply);
        }
    }

    async fn progress(&self) {
        let reply = self.api.get_progress(&self.session_id).await;
        let Some(report) = reply.data.as_ref() else {
            report_failure(&reply);
            return;
        };
        println!(
            "{}: {}/{} answered, {} correct, {:.1}% accuracy, {}s total{}",
            report.session_name,
            report.questions_answered,
            report.total_questions,
            report.questions_correct,
            report.accuracy_percentage,
            report.total_time_seconds,
            flag(reply.fallback)
        );
    }

    async fn sessions(&self) {
        let reply = self.api.list_sessions(&self.user_id, "all").await;
        let Some(rows) = reply.data.as_ref() else {
            report_failure(&reply);
            return;
        };
        for row in rows {
            println!(
                "{} {:<10} {:>3}/{:<3} {}{}",
                row.session_id,
                row.status,
                row.questions_answered,
                row.total_questions,
                row.session_name,
                flag(row.fallback)
            );
        }
    }

    async fn lifecycle(&self, pause: bool) {
        let reply = if pause {
            self.api.pause(&self.session_id).await
        } else {
            self.api.resume(&self.session_id).await
        };
        match reply.data.as_ref() {
            Some(session) => println!("session {}{}", session.status(), flag(reply.fallback)),
            None => report_failure(&reply),
        }
    }

    /// Returns false when the loop should stop.
    async fn dispatch(&mut self, command: Command) -> bool {
        match command {
            Command::Show => self.show().await,
            Command::Answer(text) => self.answer(&text).await,
            Command::Next => self.step("next").await,
            Command::Previous => self.step("previous").await,
            Command::Jump(raw) => self.jump(&raw).await,
            Command::Progress => self.progress().await,
            Command::Pause => self.lifecycle(true).await,
            Command::Resume => self.lifecycle(false).await,
            Command::Sessions => self.sessions().await,
            Command::Help => print_commands(),
            Command::Quit => return false,
        }
        true
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse().map_err(|e| {
        eprintln!("{e}");
        print_usage();
        e
    })?;

    let config = PracticeConfig::from_env();
    let storage = Storage::sqlite_with_busy_timeout(&args.db_url, config.sqlite_busy_timeout()).await?;
    let store = FallbackStore::from_storage(&storage);
    let service =
        PracticeService::new(Clock::default(), store, storage.questions).with_config(config);
    let api = PracticeApi::new(service);

    let session_id = match args.session_id {
        Some(id) => id,
        None => {
            let reply = api
                .create_session(
                    &args.user_id,
                    args.name.as_deref(),
                    args.filter.clone(),
                    args.time_limit,
                )
                .await;
            let Some(session) = reply.data else {
                let message = reply
                    .error
                    .map_or_else(|| "session could not be created".to_owned(), |e| e.message);
                return Err(message.into());
            };
            if reply.fallback {
                warn!(session_id = %session.id(), "session is running on the fallback store");
            }
            session.id().to_string()
        }
    };
    info!(session_id = %session_id, user_id = %args.user_id, "practice started");
    println!("session {session_id}");
    print_commands();

    let mut driver = Driver {
        api,
        user_id: args.user_id,
        session_id,
        question: None,
        shown_at: Instant::now(),
    };
    driver.show().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(command) = Command::parse(&line) else {
            println!("! unknown command: {}", line.trim());
            continue;
        };
        if !driver.dispatch(command).await {
            break;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(2);
    }
}
