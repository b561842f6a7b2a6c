use std::fmt;

use pyq_core::model::{PyqMetadata, Question, QuestionScope};
use storage::sqlite::SqliteRepository;

#[derive(Debug, Clone)]
struct Args {
    db_url: String,
    exam_id: String,
    subject_id: String,
    questions: u32,
    first_year: i32,
}

#[derive(Debug)]
enum ArgsError {
    MissingValue { flag: &'static str },
    UnknownArg(String),
    InvalidDbUrl { raw: String },
    InvalidQuestions { raw: String },
    InvalidYear { raw: String },
    BlankId { flag: &'static str },
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
            ArgsError::InvalidQuestions { raw } => write!(f, "invalid --questions value: {raw}"),
            ArgsError::InvalidYear { raw } => write!(f, "invalid --first-year value: {raw}"),
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

impl Args {
    fn parse() -> Result<Self, ArgsError> {
        let mut db_url =
            std::env::var("PYQ_DB_URL").unwrap_or_else(|_| "sqlite:pyq.sqlite3?mode=rwc".into());
        let mut exam_id = std::env::var("PYQ_EXAM_ID").unwrap_or_else(|_| "jee-main".into());
        let mut subject_id = std::env::var("PYQ_SUBJECT_ID").unwrap_or_else(|_| "physics".into());
        let mut questions = std::env::var("PYQ_QUESTIONS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(10);
        let mut first_year = 2019;

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
                "--exam" => exam_id = require_id(&mut args, "--exam")?,
                "--subject" => subject_id = require_id(&mut args, "--subject")?,
                "--questions" => {
                    let value = require_value(&mut args, "--questions")?;
                    questions = value
                        .parse::<u32>()
                        .map_err(|_| ArgsError::InvalidQuestions { raw: value.clone() })?;
                }
                "--first-year" => {
                    let value = require_value(&mut args, "--first-year")?;
                    first_year = value
                        .parse::<i32>()
                        .map_err(|_| ArgsError::InvalidYear { raw: value.clone() })?;
                }
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        Ok(Self {
            db_url,
            exam_id,
            subject_id,
            questions,
            first_year,
        })
    }
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cargo run -p storage --bin seed -- [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --db <sqlite_url>         SQLite URL (default: sqlite:pyq.sqlite3?mode=rwc)");
    eprintln!("  --exam <id>               Exam id for the seeded questions (default: jee-main)");
    eprintln!("  --subject <id>            Subject id (default: physics)");
    eprintln!("  --questions <n>           Number of questions to upsert (default: 10)");
    eprintln!("  --first-year <year>       Year of the oldest seeded paper (default: 2019)");
    eprintln!("  -h, --help                Show this help");
    eprintln!();
    eprintln!("Environment (same as flags):");
    eprintln!("  PYQ_DB_URL, PYQ_EXAM_ID, PYQ_SUBJECT_ID, PYQ_QUESTIONS");
}

const SAMPLES: [(&str, [&str; 4], &str, &str); 4] = [
    (
        "A body moving with uniform velocity has acceleration equal to?",
        ["Zero", "g", "Infinite", "Depends on mass"],
        "Zero",
        "Uniform velocity means no change in velocity, so acceleration is zero.",
    ),
    (
        "The SI unit of electric charge is?",
        ["Volt", "Coulomb", "Ampere", "Ohm"],
        "Coulomb",
        "Charge is measured in coulombs; one ampere carries one coulomb per second.",
    ),
    (
        "Which quantity is conserved in an elastic collision?",
        ["Only momentum", "Only kinetic energy", "Both", "Neither"],
        "Both",
        "Elastic collisions conserve both momentum and kinetic energy.",
    ),
    (
        "The focal length of a plane mirror is?",
        ["Zero", "Infinite", "Equal to radius", "Negative"],
        "Infinite",
        "A plane mirror has infinite radius of curvature, hence infinite focal length.",
    ),
];

fn sample_question(args: &Args, n: u32) -> Question {
    let idx = (n as usize) % SAMPLES.len();
    let (content, options, answer, solution) = SAMPLES[idx];
    let year = args.first_year + i32::try_from(n / 2).unwrap_or(0);
    let session = if n % 2 == 0 { "January" } else { "April" };
    let difficulty = ["easy", "medium", "hard"][(n as usize) % 3];

    Question {
        id: format!("{}-{}-{:03}", args.exam_id, args.subject_id, n + 1).into(),
        content: content.to_owned(),
        options: options.iter().map(|o| (*o).to_owned()).collect(),
        correct_answer: answer.to_owned(),
        scope: QuestionScope {
            exam_id: Some(args.exam_id.clone()),
            subject_id: Some(args.subject_id.clone()),
            ..QuestionScope::default()
        },
        metadata: Some(PyqMetadata {
            year: Some(year),
            exam_session: Some(session.to_owned()),
            paper_code: Some(format!("{}-{year}-{session}", args.exam_id)),
            question_number: Some((n + 1).to_string()),
            marks_allocated: Some(4.0),
            time_allocated_minutes: Some(2),
            solution: Some(solution.to_owned()),
            source: Some("official".to_owned()),
            tags: vec![args.subject_id.clone()],
            difficulty_level: Some(difficulty.to_owned()),
            question_type: Some("mcq".to_owned()),
        }),
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse().map_err(|e| {
        eprintln!("{e}");
        print_usage();
        e
    })?;

    let repo = SqliteRepository::connect(&args.db_url).await?;
    repo.migrate().await?;

    for n in 0..args.questions {
        repo.upsert_question(&sample_question(&args, n)).await?;
    }

    println!(
        "Seeded {} {}/{} questions into {}",
        args.questions, args.exam_id, args.subject_id, args.db_url
    );

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(2);
    }
}
