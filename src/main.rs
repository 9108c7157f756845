use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use wslshot::config::{ConfigError, ConfigStore, ConfigUpdate};
use wslshot::fetch::{self, FetchEnv, FetchRequest};
use wslshot::git::GitCli;
use wslshot::imaging::{ConvertTarget, RustBackend, UnknownTarget};
use wslshot::output::OutputStyle;
use wslshot::sanitize::{redact, user_message};

#[derive(Parser)]
#[command(name = "wslshot")]
#[command(about = "Fetch screenshots from a shared Windows folder into your project")]
#[command(long_about = "\
Fetch screenshots from a shared Windows folder into your project

Every file is checked before it is copied: it must be a real PNG, JPEG or
GIF with nothing appended after the image data, fit the size limits and not
be a symlink. Copies get random names and are written atomically.

Destination (first match wins):
  --destination
  git repository: img/, images/, assets/img/, assets/images/ (created if none)
  default_destination from the config file
  current directory

Exit status:
  0  everything transferred
  1  nothing transferred (rejected files, limits, usage errors)
  2  some files transferred, others failed
  3  I/O error

Run 'wslshot configure --source <dir>' once to set the screenshot folder.")]
#[command(version)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Config file (default: $WSLSHOT_CONFIG, then ~/.config/wslshot/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log decisions to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    fetch: FetchArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Copy the newest screenshots into the destination (the default)
    Fetch(FetchArgs),
    /// Change saved settings; with no options, print the current config
    Configure(ConfigureArgs),
    /// Rewrite deprecated config keys and values
    MigrateConfig {
        /// Show what would change without writing
        #[arg(long)]
        dry_run: bool,

        /// Accept a config path that goes through a symlink
        #[arg(long)]
        allow_symlinks: bool,
    },
}

#[derive(clap::Args, Clone)]
struct FetchArgs {
    /// Screenshot folder (overrides default_source)
    #[arg(short, long)]
    source: Option<PathBuf>,

    /// Where copies go
    #[arg(short, long)]
    destination: Option<PathBuf>,

    /// Fetch this file instead of the newest ones
    #[arg(short, long)]
    image_path: Option<PathBuf>,

    /// How many of the newest screenshots to fetch
    #[arg(short = 'n', long, default_value_t = 1)]
    count: usize,

    /// markdown, html or text
    #[arg(short = 'f', long)]
    output_style: Option<OutputStyle>,

    /// Convert copies to png, jpg, webp or gif
    #[arg(short, long)]
    convert_to: Option<ConvertTarget>,

    /// Re-encode copies to shrink them, keeping their format
    #[arg(long)]
    optimize: bool,

    /// Check and list candidates without copying anything
    #[arg(long)]
    no_transfer: bool,

    /// Follow symlinks in paths and in the screenshot folder
    #[arg(long)]
    allow_symlinks: bool,
}

impl From<FetchArgs> for FetchRequest {
    fn from(args: FetchArgs) -> Self {
        Self {
            source: args.source,
            destination: args.destination,
            image_path: args.image_path,
            count: args.count,
            output_style: args.output_style,
            convert_to: args.convert_to,
            optimize: args.optimize,
            no_transfer: args.no_transfer,
            allow_symlinks: args.allow_symlinks,
        }
    }
}

/// `--convert-to` value for `configure`: a target, or `none` to clear it.
#[derive(Debug, Clone, Copy)]
struct ConvertSetting(Option<ConvertTarget>);

impl FromStr for ConvertSetting {
    type Err = UnknownTarget;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("none") {
            return Ok(Self(None));
        }
        s.parse().map(|t| Self(Some(t)))
    }
}

#[derive(clap::Args, Clone)]
struct ConfigureArgs {
    /// Default screenshot folder
    #[arg(short, long)]
    source: Option<PathBuf>,

    /// Default destination outside git repositories
    #[arg(short, long)]
    destination: Option<PathBuf>,

    /// Stage copies with git automatically (true/false)
    #[arg(long)]
    auto_stage_enabled: Option<bool>,

    /// Default output style: markdown, html or text
    #[arg(short = 'f', long)]
    output_style: Option<OutputStyle>,

    /// Default conversion: png, jpg, webp, gif or none
    #[arg(short, long)]
    convert_to: Option<ConvertSetting>,

    /// Per-file limit in MB (capped at 50)
    #[arg(long)]
    max_file_size_mb: Option<f64>,

    /// Per-batch limit in MB (capped at 200)
    #[arg(long)]
    max_total_size_mb: Option<f64>,

    /// Accept symlinked source, destination or config paths
    #[arg(long)]
    allow_symlinks: bool,
}

impl ConfigureArgs {
    fn to_update(&self) -> ConfigUpdate {
        ConfigUpdate {
            source: self.source.clone(),
            destination: self.destination.clone(),
            auto_stage_enabled: self.auto_stage_enabled,
            output_style: self.output_style,
            convert_to: self.convert_to.map(|c| c.0),
            max_file_size_mb: self.max_file_size_mb,
            max_total_size_mb: self.max_total_size_mb,
        }
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(parse_error_code(&e));
        }
    };
    wslshot::logging::init(cli.verbose);

    let store = match cli.config {
        Some(path) => ConfigStore::new(path),
        None => match ConfigStore::open_default() {
            Ok(store) => store,
            Err(e) => return fail(&e, 1),
        },
    };

    let code = match cli.command.unwrap_or(Command::Fetch(cli.fetch)) {
        Command::Fetch(args) => run_fetch(&store, args),
        Command::Configure(args) => run_configure(&store, &args),
        Command::MigrateConfig {
            dry_run,
            allow_symlinks,
        } => run_migrate(&store, dry_run, allow_symlinks),
    };
    ExitCode::from(code)
}

/// Help and version requests succeed; every other parse failure is a usage
/// error, which exits 1 like any other run that transferred nothing. Exit 2
/// is reserved for partial transfers.
fn parse_error_code(err: &clap::Error) -> u8 {
    use clap::error::ErrorKind;
    match err.kind() {
        ErrorKind::DisplayHelp
        | ErrorKind::DisplayVersion
        | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => 0,
        _ => 1,
    }
}

fn fail(err: &dyn std::error::Error, code: u8) -> ExitCode {
    eprintln!("Error: {}", user_message(err));
    ExitCode::from(code)
}

fn config_exit_code(err: &ConfigError) -> u8 {
    if err.is_io() { 3 } else { 1 }
}

fn run_fetch(store: &ConfigStore, args: FetchArgs) -> u8 {
    let working_dir = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Error: {}", user_message(&e));
            return 3;
        }
    };
    let backend = RustBackend::new();
    let env = FetchEnv {
        store,
        backend: &backend,
        vcs: &GitCli,
        working_dir,
    };

    match fetch::run(&FetchRequest::from(args), &env) {
        Ok(report) => {
            for rejection in &report.rejected {
                eprintln!(
                    "Skipped {}: {}",
                    redact(&rejection.source),
                    user_message(&rejection.reason)
                );
            }
            for outcome in &report.outcomes {
                if let Some(failure) = &outcome.failure {
                    eprintln!("Failed {}: {failure}", redact(&outcome.source));
                }
            }
            for line in &report.lines {
                println!("{line}");
            }
            report.status.code() as u8
        }
        Err(e) => {
            eprintln!("Error: {}", user_message(&e));
            e.status().code() as u8
        }
    }
}

fn run_configure(store: &ConfigStore, args: &ConfigureArgs) -> u8 {
    let update = args.to_update();
    if update.is_empty() {
        let shown = store
            .load_read_only(args.allow_symlinks)
            .map_err(|e| (config_exit_code(&e), user_message(&e)))
            .and_then(|loaded| {
                loaded
                    .config
                    .to_json()
                    .map_err(|e| (1, user_message(&e)))
            });
        return match shown {
            Ok(json) => {
                print!("{}", String::from_utf8_lossy(&json));
                0
            }
            Err((code, message)) => {
                eprintln!("Error: {message}");
                code
            }
        };
    }

    match store.apply(&update, args.allow_symlinks) {
        Ok(_) => {
            println!("Configuration saved to {}", redact(store.path()));
            0
        }
        Err(e) => {
            eprintln!("Error: {}", user_message(&e));
            config_exit_code(&e)
        }
    }
}

fn run_migrate(store: &ConfigStore, dry_run: bool, allow_symlinks: bool) -> u8 {
    match store.migrate(dry_run, allow_symlinks) {
        Ok(report) if report.changes.is_empty() => {
            println!("Config is already up to date.");
            0
        }
        Ok(report) => {
            if dry_run {
                println!("Migration preview (dry-run, nothing written):");
                for change in &report.changes {
                    println!("  [would change] {change}");
                }
            } else {
                println!("Applied changes:");
                for change in &report.changes {
                    println!("  {change}");
                }
            }
            0
        }
        Err(ConfigError::Missing(path)) => {
            println!("No config file found at {}", redact(path));
            0
        }
        Err(e) => {
            eprintln!("Error: {}", user_message(&e));
            config_exit_code(&e)
        }
    }
}
