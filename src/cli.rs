use clap::{Args, Parser, Subcommand};

use crate::challenge::Difficulty;

#[derive(Debug, Parser)]
#[command(
    name = "forge",
    about = "Practice fixing real historical bugs, one challenge at a time.",
    long_about = "Forge checks out a real project at the commit before a bug was fixed, asks you to write down your reasoning, captures your fix as a patch, compares it with the upstream fix and scores the attempt.\n\nState lives under $FORGE_HOME (default ~/.codeforge).",
    disable_help_subcommand = true
)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Debug, Clone, Args)]
pub(crate) struct TargetArgs {
    /// Challenge id; defaults to the most recently active session.
    #[arg(long = "id", value_name = "ID")]
    pub(crate) id: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub(crate) struct ScoreArgs {
    #[arg(long, value_name = "1-10", allow_negative_numbers = true)]
    pub(crate) correctness: Option<i64>,
    #[arg(long, value_name = "1-10", allow_negative_numbers = true)]
    pub(crate) approach: Option<i64>,
    #[arg(long = "code-quality", value_name = "1-10", allow_negative_numbers = true)]
    pub(crate) code_quality: Option<i64>,
    #[arg(long = "edge-cases", value_name = "1-10", allow_negative_numbers = true)]
    pub(crate) edge_cases: Option<i64>,
    #[arg(long = "thinking-depth", value_name = "1-10", allow_negative_numbers = true)]
    pub(crate) thinking_depth: Option<i64>,
    #[arg(long, value_name = "TEXT")]
    pub(crate) rationale: Option<String>,
}

impl ScoreArgs {
    /// Values in dimension order, or the first flag left out.
    pub(crate) fn values(&self) -> Result<[i64; 5], &'static str> {
        let pairs = [
            ("--correctness", self.correctness),
            ("--approach", self.approach),
            ("--code-quality", self.code_quality),
            ("--edge-cases", self.edge_cases),
            ("--thinking-depth", self.thinking_depth),
        ];
        let mut values = [0; 5];
        for (slot, (flag, value)) in values.iter_mut().zip(pairs) {
            *slot = value.ok_or(flag)?;
        }
        Ok(values)
    }
}

#[derive(Debug, Subcommand)]
pub(crate) enum CliCommand {
    /// Create the home directory layout and a default config.
    Init,
    /// List catalog challenges with their session state.
    List {
        #[arg(long, value_parser = clap::value_parser!(Difficulty))]
        difficulty: Option<Difficulty>,
        /// Only show challenges carrying this tag (repeatable).
        #[arg(long = "tag", value_name = "TAG")]
        tags: Vec<String>,
    },
    /// Suggest a random challenge you have not completed.
    Challenge {
        #[arg(long, value_parser = clap::value_parser!(Difficulty))]
        difficulty: Option<Difficulty>,
    },
    /// Check out a challenge workspace and start the clock.
    Start {
        #[arg(long = "id", value_name = "ID")]
        id: String,
    },
    /// Edit the thinking journal and record it.
    Think {
        #[command(flatten)]
        target: TargetArgs,
        /// Record the journal without opening the editor.
        #[arg(long = "no-edit")]
        no_edit: bool,
    },
    /// Reveal the next hint (costs 0.5 points).
    Hint {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Capture your changes and run the challenge tests.
    Submit {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Compare your submission with the upstream fix.
    Compare {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Score the attempt with the configured backend, export it, or record scores by hand.
    Review {
        #[command(flatten)]
        target: TargetArgs,
        /// Write the review export instead of calling a backend.
        #[arg(long, conflicts_with = "score")]
        export: bool,
        /// Record scores supplied with the dimension flags.
        #[arg(long)]
        score: bool,
        #[command(flatten)]
        scores: ScoreArgs,
    },
    /// Record the reviewed attempt in history.
    Complete {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Show the session summary.
    Status {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Show aggregate statistics from history.
    Stats {
        #[arg(long, value_parser = clap::value_parser!(Difficulty))]
        difficulty: Option<Difficulty>,
        /// Only consider the N most recent records.
        #[arg(long, value_name = "N")]
        last: Option<usize>,
    },
    /// Permanently delete a challenge workspace and return it to not started.
    Reset {
        #[arg(long = "id", value_name = "ID")]
        id: String,
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
        /// Start a fresh attempt right after the reset.
        #[arg(long)]
        restart: bool,
    },
    /// Show or change configuration values.
    Config {
        key: Option<String>,
        value: Option<String>,
    },
    /// Print the version.
    Version,
}
