use std::io::{self, BufRead, Write};

use clap::{Args, Subcommand};

use crate::config::{DEFAULT_API_URL, StoredConfig, config_file_path};
use crate::error::{AppError, AppResult};
use crate::sync::ReconcilePolicy;

#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommand {
    /// Run the interactive configuration wizard.
    Init,
    /// Show the stored configuration (secrets masked).
    Show,
}

pub fn run(command: ConfigCommand) -> AppResult<()> {
    match command {
        ConfigCommand::Init => run_init(),
        ConfigCommand::Show => run_show(),
    }
}

fn run_init() -> AppResult<()> {
    let mut cfg = StoredConfig::load()?;

    println!("Configuring ticket-desk.");
    println!("Press Enter to keep the current value, '-' to clear it.");
    println!("Secrets are stored in the local config file; protect your filesystem accordingly.");
    println!();

    let stdin = io::stdin();
    Wizard::new(stdin.lock(), io::stdout()).fill(&mut cfg)?;
    cfg.save()?;

    let path = config_file_path()?;
    println!("\nConfiguration saved to {}", path.display());
    Ok(())
}

fn run_show() -> AppResult<()> {
    let cfg = StoredConfig::load()?;
    let path = config_file_path()?;

    println!("Configuration file: {}", path.display());
    println!("Supabase URL: {}", or_unset(cfg.supabase_url.as_deref()));
    println!("Supabase key: {}", mask_secret(&cfg.supabase_key));
    println!(
        "Ticket service URL: {}",
        cfg.api_url.as_deref().unwrap_or(DEFAULT_API_URL)
    );
    println!(
        "Reconcile policy: {}",
        cfg.reconcile_policy
            .as_deref()
            .unwrap_or(ReconcilePolicy::default().as_str())
    );

    Ok(())
}

/// Asks for each stored setting in turn, one answer per line.
struct Wizard<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Wizard<R, W> {
    fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn fill(&mut self, cfg: &mut StoredConfig) -> AppResult<()> {
        self.ask(
            "Supabase project URL (e.g., https://abc.supabase.co)",
            &mut cfg.supabase_url,
            false,
        )?;
        self.ask("Supabase anon key", &mut cfg.supabase_key, true)?;
        self.ask(
            "Ticket service URL ('-' resets to the hosted service)",
            &mut cfg.api_url,
            false,
        )?;
        self.ask(
            "Reconcile policy (full/incremental)",
            &mut cfg.reconcile_policy,
            false,
        )?;

        match cfg.reconcile_policy.as_deref() {
            Some(policy) if ReconcilePolicy::parse(policy).is_none() => {
                Err(AppError::Configuration(format!(
                    "unknown reconcile policy '{policy}' (expected 'full' or 'incremental')"
                )))
            }
            _ => Ok(()),
        }
    }

    fn ask(&mut self, label: &str, target: &mut Option<String>, secret: bool) -> AppResult<()> {
        match target.as_deref() {
            Some(_) if secret => write!(self.output, "{label} [{}]: ", mask_secret(target))?,
            Some(current) => write!(self.output, "{label} [{current}]: ")?,
            None => write!(self.output, "{label}: ")?,
        }
        self.output.flush()?;

        let mut line = String::new();
        self.input.read_line(&mut line)?;
        Answer::parse(&line).apply(target);
        Ok(())
    }
}

enum Answer {
    Keep,
    Clear,
    Set(String),
}

impl Answer {
    fn parse(line: &str) -> Self {
        match line.trim() {
            "" => Answer::Keep,
            "-" => Answer::Clear,
            value => Answer::Set(value.to_string()),
        }
    }

    fn apply(self, target: &mut Option<String>) {
        match self {
            Answer::Keep => {}
            Answer::Clear => *target = None,
            Answer::Set(value) => *target = Some(value),
        }
    }
}

fn or_unset(value: Option<&str>) -> &str {
    value.filter(|v| !v.is_empty()).unwrap_or("<not set>")
}

fn mask_secret(value: &Option<String>) -> String {
    match value.as_deref() {
        Some(token) if token.chars().count() > 6 => {
            let prefix: String = token.chars().take(3).collect();
            let suffix: String = token.chars().skip(token.chars().count() - 3).collect();
            format!("{prefix}***{suffix}")
        }
        Some(token) if !token.is_empty() => "***".to_string(),
        _ => "<not set>".to_string(),
    }
}
