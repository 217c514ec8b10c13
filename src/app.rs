use clap::Parser;
use rand::thread_rng;
use std::env;
use std::ffi::OsString;
use std::io::{self, BufRead, IsTerminal, Write};
use std::process::ExitCode;
use std::sync::atomic::Ordering;

use crate::catalog::ChallengeCatalog;
use crate::cli::{Cli, CliCommand, ScoreArgs};
use crate::config::{
    display_config_value, load_config, save_config, set_config_value, Config, ForgePaths,
    CONFIG_KEYS,
};
use crate::diff::{ComparisonResult, FileClass};
use crate::error::{io_context, ErrorKind, ForgeError};
use crate::history::{self, StatsFilter, Statistics, Trend};
use crate::lifecycle::{JournalOutcome, SessionMachine};
use crate::logger::{sanitize_log_value, Logger};
use crate::review::{select_backend, DimensionScores, ReviewOutcome, ReviewResult};
use crate::session::{LifecycleState, Session};
use crate::shell::{run_shell_command_status, INTERRUPTED};
use crate::vcs::GitCli;

#[derive(Debug)]
pub(crate) struct Quit {
    pub(crate) code: i32,
    #[allow(dead_code)]
    pub(crate) reason: String,
}

impl Quit {
    pub(crate) fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code as u8)
    }
}

impl From<ForgeError> for Quit {
    fn from(err: ForgeError) -> Self {
        Quit {
            code: if err.kind() == ErrorKind::Interrupted { 130 } else { 1 },
            reason: err.reason_tag().to_string(),
        }
    }
}

/// Prints the diagnostic, logs it and converts it to an exit status.
fn fail(logger: &Logger, err: ForgeError) -> Quit {
    eprintln!("Error: {}", err);
    if let Some(advice) = advice_for(&err) {
        eprintln!("{}", advice);
    }
    logger.log(&format!(
        "quit reason={} detail={}",
        err.reason_tag(),
        sanitize_log_value(&err.to_string())
    ));
    Quit::from(err)
}

fn advice_for(err: &ForgeError) -> Option<&'static str> {
    match err {
        ForgeError::ChallengeNotFound(_) => Some("Run `forge list` to see the available challenges."),
        ForgeError::InvalidTransition { .. } => Some("Run `forge status` to see where the session stands."),
        _ => None,
    }
}

fn install_interrupt_handler() {
    if let Err(err) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
        eprintln!("Failed to set interrupt handler: {}", err);
    }
}

/// Loads `config.yaml`, reporting unknown keys on stderr.
fn read_config(paths: &ForgePaths) -> Result<Config, ForgeError> {
    let loaded = load_config(&paths.config_path())?;
    for key in &loaded.warnings {
        eprintln!("Warning: unknown config key: {}", key);
    }
    Ok(loaded.config)
}

struct Context {
    paths: ForgePaths,
    config: Config,
    logger: Logger,
    catalog: ChallengeCatalog,
}

impl Context {
    fn open(paths: ForgePaths) -> Result<Self, ForgeError> {
        paths.ensure_layout()?;
        let config = read_config(&paths)?;
        let logger = Logger::new(Some(paths.log_path()));
        let catalog = ChallengeCatalog::load(&paths.challenges_dir())?;
        for rejected in catalog.rejected() {
            eprintln!("Warning: skipped challenge definition: {}", rejected);
            logger.log(&format!(
                "catalog skipped reason={} detail={}",
                rejected.reason_tag(),
                rejected
            ));
        }
        Ok(Self {
            paths,
            config,
            logger,
            catalog,
        })
    }
}

pub(crate) fn run_with_cli(cli: Cli) -> Result<(), Quit> {
    install_interrupt_handler();
    if let CliCommand::Version = cli.command {
        println!("forge {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let bootstrap = Logger::discard();
    let paths = ForgePaths::resolve().map_err(|err| fail(&bootstrap, err))?;
    match cli.command {
        CliCommand::Init => return run_init(&paths).map_err(|err| fail(&bootstrap, err)),
        CliCommand::Config { key, value } => {
            return run_config(&paths, key.as_deref(), value.as_deref())
                .map_err(|err| fail(&bootstrap, err))
        }
        _ => {}
    }

    let ctx = Context::open(paths).map_err(|err| fail(&bootstrap, err))?;
    let vcs = GitCli::new(&ctx.logger);
    let backend = select_backend(&ctx.config);
    let machine = SessionMachine::new(
        &ctx.paths,
        &ctx.config,
        &ctx.catalog,
        &vcs,
        backend.as_ref(),
        &ctx.logger,
    );
    dispatch(&ctx, &machine, cli.command).map_err(|err| fail(&ctx.logger, err))
}

fn dispatch(ctx: &Context, machine: &SessionMachine, command: CliCommand) -> Result<(), ForgeError> {
    match command {
        CliCommand::List { difficulty, tags } => {
            let specs = ctx.catalog.filter(difficulty, &tags);
            if specs.is_empty() {
                println!(
                    "No challenges found in {}.",
                    ctx.paths.challenges_dir().display()
                );
                return Ok(());
            }
            let shown = specs.len();
            for spec in specs {
                println!(
                    "{:<24} {:<7} {:>4}m  {:<14} {}",
                    spec.id,
                    spec.difficulty.as_str(),
                    spec.time_limit,
                    machine.state_of(&spec.id).as_str(),
                    spec.title
                );
            }
            println!("{} of {} challenges", shown, ctx.catalog.len());
        }
        CliCommand::Challenge { difficulty } => {
            let picked = ctx.catalog.pick(
                difficulty,
                |id| machine.state_of(id) == LifecycleState::Completed,
                &mut thread_rng(),
            );
            match picked {
                Some(spec) => {
                    println!("{} [{}] {}", spec.id, spec.difficulty, spec.title);
                    println!("  repo: {}  time limit: {} min", spec.repo, spec.time_limit);
                    if !spec.tags.is_empty() {
                        println!("  tags: {}", spec.tags.join(", "));
                    }
                    println!("Start it with: forge start --id {}", spec.id);
                }
                None if ctx.catalog.is_empty() => println!(
                    "No challenges found in {}.",
                    ctx.paths.challenges_dir().display()
                ),
                None => println!("Every challenge is already completed."),
            }
        }
        CliCommand::Start { id } => {
            let session = machine.start(&id)?;
            let spec = ctx.catalog.get(&id)?;
            let layout = machine.layout(&id);
            println!("Started {}: {}", spec.id, spec.title);
            println!("  repo:    {}", layout.repo.display());
            println!("  journal: {}", session.journal_path.display());
            println!("  time limit: {} min", spec.time_limit);
            if !spec.description.trim().is_empty() {
                println!();
                println!("{}", spec.description.trim_end());
            }
            if !spec.setup.files_of_interest.is_empty() {
                println!();
                println!("Files of interest:");
                for path in &spec.setup.files_of_interest {
                    println!("  {}", path);
                }
            }
            println!();
            println!("Next: forge think --id {}", spec.id);
        }
        CliCommand::Think { target, no_edit } => {
            let id = machine.resolve(target.id.as_deref())?;
            let journal = machine.editable_journal(&id)?;
            if !no_edit {
                let editor = ctx.config.effective_editor();
                let code = run_shell_command_status(
                    &format!("{} \"$1\"", editor),
                    &[journal.display().to_string()],
                    "editor",
                    &ctx.logger,
                )?;
                if code != 0 {
                    eprintln!("Warning: editor '{}' exited with status {}", editor, code);
                }
            }
            match machine.record_journal(&id)? {
                JournalOutcome::Recorded => println!("Journal recorded for {}.", id),
                JournalOutcome::AlreadyRecorded => println!("Journal already recorded for {}.", id),
            }
        }
        CliCommand::Hint { target } => {
            let id = machine.resolve(target.id.as_deref())?;
            let hint = machine.hint(&id)?;
            match &hint.text {
                Some(text) => println!("Hint {}/{}: {}", hint.number, hint.available, text),
                None => println!(
                    "All {} hints are already disclosed; this request is still counted.",
                    hint.available
                ),
            }
            println!("Hint penalty now {:.1} points.", hint.penalty());
        }
        CliCommand::Submit { target } => {
            let id = machine.resolve(target.id.as_deref())?;
            let report = machine.submit(&id)?;
            println!(
                "Submitted {}: {} file(s), {} changed line(s)",
                id,
                report.files.len(),
                report.changed_lines
            );
            for file in &report.files {
                println!("  {}", file);
            }
            println!("  patch: {}", report.diff_path.display());
            match &report.test {
                Some(run) if run.passed => println!("Tests passed ({}).", run.command),
                Some(run) if run.timed_out => println!(
                    "Tests timed out; see {}",
                    run.output_path.display()
                ),
                Some(run) => println!(
                    "Tests failed with exit code {}; see {}",
                    run.exit_code,
                    run.output_path.display()
                ),
                None => println!("No test command configured for this challenge."),
            }
            let over = report.elapsed_minutes > f64::from(report.time_limit);
            println!(
                "Elapsed {:.1} of {} min{}",
                report.elapsed_minutes,
                report.time_limit,
                if over { " (over the limit)" } else { "" }
            );
        }
        CliCommand::Compare { target } => {
            let id = machine.resolve(target.id.as_deref())?;
            let result = machine.compare(&id)?;
            print_comparison(&result);
        }
        CliCommand::Review {
            target,
            export,
            score,
            scores,
        } => {
            let id = machine.resolve(target.id.as_deref())?;
            if score {
                let (scores, rationale) = manual_scores(&scores)?;
                let result = machine.record_manual_score(&id, scores, rationale)?;
                print_review(&result);
                return Ok(());
            }
            match machine.review(&id, export)? {
                ReviewOutcome::Scored(result) => print_review(&result),
                ReviewOutcome::Exported { path, reason } => {
                    println!("Review exported ({}): {}", reason, path.display());
                    println!("Paste it into any assistant, then record the scores with:");
                    println!(
                        "  forge review --id {} --score --correctness N --approach N --code-quality N --edge-cases N --thinking-depth N",
                        id
                    );
                }
            }
        }
        CliCommand::Complete { target } => {
            let id = machine.resolve(target.id.as_deref())?;
            let record = machine.complete(&id)?;
            println!(
                "Completed {} in {:.1} min with final score {:.1}",
                record.challenge_id,
                record.elapsed_minutes,
                record.final_score.unwrap_or(0.0)
            );
        }
        CliCommand::Status { target } => {
            let id = machine.resolve(target.id.as_deref())?;
            match machine.status(&id)? {
                Some(session) => print_session(ctx, &session),
                None => println!("{}: not started", id),
            }
        }
        CliCommand::Stats { difficulty, last } => {
            let log = history::read_all(&ctx.paths.history_path())?;
            if !log.skipped_lines.is_empty() {
                eprintln!(
                    "Warning: skipped unreadable history lines: {:?}",
                    log.skipped_lines
                );
            }
            let stats = history::aggregate(&log.records, &StatsFilter { difficulty, last });
            print_stats(&stats);
        }
        CliCommand::Reset { id, yes, restart } => {
            if !yes && !confirm_reset(&id)? {
                println!("Reset cancelled.");
                return Ok(());
            }
            let report = machine.reset(&id, restart)?;
            if report.removed_workspace {
                println!("Deleted workspace, journal and submission for {}.", id);
            } else {
                println!("No workspace existed for {}.", id);
            }
            if report.abandoned_recorded {
                println!("Recorded the {} attempt as abandoned.", report.previous);
            }
            if let Some(session) = report.restarted {
                println!("Restarted {}; journal at {}", id, session.journal_path.display());
            }
        }
        CliCommand::Init | CliCommand::Config { .. } | CliCommand::Version => {}
    }
    Ok(())
}

fn run_init(paths: &ForgePaths) -> Result<(), ForgeError> {
    paths.ensure_layout()?;
    let config_path = paths.config_path();
    if config_path.is_file() {
        println!("Config already present: {}", config_path.display());
    } else {
        save_config(&config_path, &Config::default())?;
        println!("Wrote default config: {}", config_path.display());
    }
    println!("Forge home: {}", paths.root().display());
    println!(
        "Add challenge definitions (*.yaml) to {}",
        paths.challenges_dir().display()
    );
    Ok(())
}

fn run_config(paths: &ForgePaths, key: Option<&str>, value: Option<&str>) -> Result<(), ForgeError> {
    let config_path = paths.config_path();
    let mut config = read_config(paths)?;
    match (key, value) {
        (None, _) => {
            for key in CONFIG_KEYS {
                if let Some(shown) = display_config_value(&config, key) {
                    println!("{} = {}", key, shown);
                }
            }
        }
        (Some(key), None) => {
            let shown = display_config_value(&config, key).ok_or_else(|| {
                ForgeError::Config(format!(
                    "unknown config key '{}' (known: {})",
                    key,
                    CONFIG_KEYS.join(", ")
                ))
            })?;
            println!("{}", shown);
        }
        (Some(key), Some(value)) => {
            set_config_value(&mut config, key, value)?;
            save_config(&config_path, &config)?;
            let shown = display_config_value(&config, key).unwrap_or_default();
            println!("{} = {}", key, shown);
        }
    }
    Ok(())
}

fn manual_scores(args: &ScoreArgs) -> Result<(DimensionScores, Option<String>), ForgeError> {
    let values = args.values().map_err(|flag| {
        ForgeError::Config(format!(
            "--score needs every dimension; {} is missing",
            flag
        ))
    })?;
    Ok((DimensionScores::from_manual(values)?, args.rationale.clone()))
}

fn confirm_reset(id: &str) -> Result<bool, ForgeError> {
    let stdin = io::stdin();
    if !stdin.is_terminal() {
        return Err(ForgeError::Config(format!(
            "reset of {} permanently deletes its workspace, journal and submission; pass --yes to confirm",
            id
        )));
    }
    print!(
        "This permanently deletes the workspace, journal and submission for {}. Continue? [y/N] ",
        id
    );
    io::stdout()
        .flush()
        .map_err(io_context("Failed to write prompt"))?;
    let mut answer = String::new();
    stdin
        .lock()
        .read_line(&mut answer)
        .map_err(io_context("Failed to read confirmation"))?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn print_comparison(result: &ComparisonResult) {
    println!("Verdict: {}", result.verdict);
    for file in &result.files {
        println!("  {:<40} {}", file.path, file.class);
    }
    let identical = result.count(FileClass::Identical);
    println!(
        "Files: {} identical, {} missing, {} extraneous ({} yours / {} upstream)",
        identical,
        result.missing(),
        result.extraneous(),
        result.submission_files,
        result.solution_files
    );
    println!(
        "Changed lines: {} yours / {} upstream",
        result.submission_changed_lines, result.solution_changed_lines
    );
}

fn print_review(result: &ReviewResult) {
    for (name, value) in result.scores.named() {
        println!("  {:<16} {:>2}/10", name, value);
    }
    println!(
        "Mean {:.1}, hint penalty {:.1}, final {:.1} ({})",
        result.scores.mean(),
        result.penalty,
        result.final_score,
        result.source
    );
    if let Some(rationale) = &result.rationale {
        println!();
        println!("{}", rationale);
    }
}

fn print_session(ctx: &Context, session: &Session) {
    let title = ctx
        .catalog
        .get(&session.challenge_id)
        .map(|spec| spec.title.as_str())
        .unwrap_or("(definition missing)");
    println!("{}: {}", session.challenge_id, title);
    if let Some(source) = ctx.catalog.source_path(&session.challenge_id) {
        println!("  definition: {}", source.display());
    }
    println!("  state:      {}", session.state);
    println!("  started:    {}", session.started_at.to_rfc3339());
    println!("  elapsed:    {:.1} min", session.elapsed_minutes());
    println!("  hints:      {}", session.hints_consumed);
    println!("  workspace:  {}", session.workspace_root.display());
    println!("  journal:    {}", session.journal_path.display());
    if let Some(path) = &session.submission_path {
        println!("  submission: {}", path.display());
    }
    if let Some(passed) = session.test_passed {
        println!("  tests:      {}", if passed { "passed" } else { "failed" });
    }
    if let Some(result) = &session.last_comparison {
        println!("  comparison: {}", result.verdict);
    }
    if let Some(review) = &session.last_review {
        println!("  final:      {:.1} ({})", review.final_score, review.source);
    } else if let Some(path) = &session.last_export {
        println!("  export:     {}", path.display());
    }
}

fn print_stats(stats: &Statistics) {
    if stats.count == 0 {
        println!("No history yet.");
        return;
    }
    println!(
        "Attempts: {} ({} completed, {} abandoned)",
        stats.count, stats.completed, stats.abandoned
    );
    if let Some(mean_final) = stats.mean_final {
        println!("Mean final score: {:.1}", mean_final);
    }
    if let Some(minutes) = stats.mean_elapsed_minutes {
        println!("Mean time: {:.1} min", minutes);
    }
    println!("Hints used: {}", stats.total_hints);
    if !stats.mean_scores.is_empty() {
        println!("Dimensions:");
        for (name, value) in &stats.mean_scores {
            println!("  {:<16} {:.1}", name, value);
        }
    }
    if let Some((name, value)) = stats.weakest_dimension {
        println!("Weakest: {} ({:.1})", name, value);
    }
    for (difficulty, entry) in &stats.by_difficulty {
        println!(
            "  {:<7} {}/{} completed ({:.0}%){}",
            difficulty.as_str(),
            entry.completed,
            entry.attempted,
            entry.completion_rate * 100.0,
            entry
                .mean_final
                .map(|value| format!(", mean final {:.1}", value))
                .unwrap_or_default()
        );
    }
    match stats.trend {
        Some(Trend::Improving(delta)) => println!("Trend: improving (+{:.1})", delta),
        Some(Trend::Declining(delta)) => println!("Trend: declining (-{:.1})", delta),
        Some(Trend::Steady) => println!("Trend: steady"),
        None => {}
    }
    println!("Level: {}", stats.level.title);
    if let Some(next) = stats.next_level {
        println!(
            "Next: {} ({} completed, mean final {:.1}, {} hard)",
            next.title, next.min_completed, next.min_mean_final, next.min_hard
        );
    }
}

pub(crate) fn run_with_args(args: Vec<OsString>) -> Result<(), Quit> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) => {
            // Rendered by hand so the output goes through Rust's captured streams.
            if err.use_stderr() {
                eprint!("{err}");
            } else {
                print!("{err}");
            }
            return Err(Quit {
                code: err.exit_code(),
                reason: "cli_parse".to_string(),
            });
        }
    };
    run_with_cli(cli)
}

pub(crate) fn main() -> ExitCode {
    match run_with_args(env::args_os().collect()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(quit) => quit.exit_code(),
    }
}
