mod credentials;

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::application::{HistoryFilter, LedgerService};
use crate::config::{AppConfig, BackendKind, LogConfig, LogFormat, StorageConfig};
use crate::domain::{CategoryTotal, Cents, Entry, Month, User, format_cents, parse_cents};

pub use credentials::{hash_password, verify_password};

/// Pocketbook - a multi-user personal finance ledger
#[derive(Parser)]
#[command(name = "pocketbook")]
#[command(about = "Track deposits, withdrawals and transfers between users of a shared ledger")]
#[command(version)]
pub struct Cli {
    /// Database file path (overrides the configured storage)
    #[arg(short, long, global = true)]
    pub database: Option<String>,

    /// Configuration file (defaults to ./pocketbook.toml if present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Identifies the acting user.
#[derive(Args, Clone)]
pub struct Credentials {
    /// Email of the acting user
    #[arg(long)]
    pub email: String,

    /// Password of the acting user
    #[arg(long, env = "POCKETBOOK_PASSWORD", hide_env_values = true)]
    pub password: String,
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Csv,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new database
    Init,

    /// Register a new user
    Register {
        #[command(flatten)]
        credentials: Credentials,
    },

    /// Add money to your balance
    Deposit {
        /// Amount (e.g., "50.00" or "50")
        amount: String,

        #[command(flatten)]
        credentials: Credentials,
    },

    /// Take money out of your balance
    Withdraw {
        /// Amount (e.g., "12.50")
        amount: String,

        /// Spending category (e.g., "groceries")
        #[arg(short = 'g', long)]
        category: Option<String>,

        #[command(flatten)]
        credentials: Credentials,
    },

    /// Send money to another user
    Transfer {
        /// Amount to send
        amount: String,

        /// Recipient email
        #[arg(long)]
        to: String,

        #[command(flatten)]
        credentials: Credentials,
    },

    /// Change the amount and category of one of your entries
    Edit {
        /// Entry ID
        id: String,

        /// New amount
        amount: String,

        /// New category (withdrawals only)
        #[arg(short = 'g', long)]
        category: Option<String>,

        #[command(flatten)]
        credentials: Credentials,
    },

    /// Delete one of your entries and reverse its effect
    Delete {
        /// Entry ID
        id: String,

        #[command(flatten)]
        credentials: Credentials,
    },

    /// Show your current balance
    Balance {
        #[command(flatten)]
        credentials: Credentials,
    },

    /// List your entries, newest first
    History {
        /// First day to include (YYYY-MM-DD)
        #[arg(long)]
        from: Option<String>,

        /// Last day to include (YYYY-MM-DD)
        #[arg(long)]
        to: Option<String>,

        /// Maximum number of entries to show
        #[arg(short, long)]
        limit: Option<usize>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,

        #[command(flatten)]
        credentials: Credentials,
    },

    /// Spending per category
    Spending {
        /// First day to include (YYYY-MM-DD)
        #[arg(long)]
        from: Option<String>,

        /// Last day to include (YYYY-MM-DD)
        #[arg(long)]
        to: Option<String>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,

        #[command(flatten)]
        credentials: Credentials,
    },

    /// Inflows and outflows of a month
    Summary {
        /// Month (YYYY-MM, defaults to the current month)
        #[arg(long)]
        month: Option<String>,

        #[command(flatten)]
        credentials: Credentials,
    },

    /// Biggest spending categories of the current month
    Top {
        #[arg(short, long, default_value = "5")]
        limit: usize,

        #[command(flatten)]
        credentials: Credentials,
    },

    /// Budget management commands
    #[command(subcommand)]
    Budget(BudgetCommands),

    /// Compare every cached balance with its ledger
    Check {
        /// Overwrite diverging balances with the ledger total
        #[arg(long)]
        repair: bool,
    },
}

#[derive(Subcommand)]
pub enum BudgetCommands {
    /// Set the monthly limit for a category
    Set {
        /// Category to limit
        category: String,

        /// Limit (e.g., "400" or "400.00")
        amount: String,

        /// Month (YYYY-MM, defaults to the current month)
        #[arg(long)]
        month: Option<String>,

        #[command(flatten)]
        credentials: Credentials,
    },

    /// Remove the limit for a category
    Delete {
        category: String,

        /// Month (YYYY-MM, defaults to the current month)
        #[arg(long)]
        month: Option<String>,

        #[command(flatten)]
        credentials: Credentials,
    },

    /// Show budgets next to actual spending
    Status {
        /// Month (YYYY-MM, defaults to the current month)
        #[arg(long)]
        month: Option<String>,

        #[command(flatten)]
        credentials: Credentials,
    },
}

impl Cli {
    /// Configuration file and environment, then command-line overrides.
    pub fn load_config(&self) -> Result<AppConfig> {
        let mut config =
            AppConfig::load(self.config.as_deref()).context("Failed to load configuration")?;

        if let Some(path) = &self.database {
            config.storage = StorageConfig {
                backend: BackendKind::Sqlite,
                ..StorageConfig::sqlite_file(path)
            };
        }
        if self.verbose {
            config.log.level = "debug".to_string();
        }
        Ok(config)
    }

    pub async fn run(self) -> Result<()> {
        let config = self.load_config()?;
        init_logging(&config.log);

        let service = LedgerService::from_config(&config).await?;

        match self.command {
            Commands::Init => {
                println!("Database initialized: {}", config.storage.url);
            }

            Commands::Register { credentials } => {
                let hash = hash_password(&credentials.password)?;
                let user = service.create_user(&credentials.email, &hash).await?;
                println!("Registered {} ({})", user.email, user.id);
            }

            Commands::Deposit {
                amount,
                credentials,
            } => {
                let user = sign_in(&service, &credentials).await?;
                let entry = service.deposit(user.id, parse_amount(&amount)?).await?;
                let balance = service.balance(user.id).await?;
                println!(
                    "Deposited {} ({}). Balance: {}",
                    format_cents(entry.amount_cents),
                    entry.id,
                    format_cents(balance)
                );
            }

            Commands::Withdraw {
                amount,
                category,
                credentials,
            } => {
                let user = sign_in(&service, &credentials).await?;
                let entry = service
                    .withdraw(user.id, parse_amount(&amount)?, category)
                    .await?;
                let balance = service.balance(user.id).await?;
                println!(
                    "Withdrew {} for {} ({}). Balance: {}",
                    format_cents(entry.amount_cents),
                    entry.category.as_deref().unwrap_or("-"),
                    entry.id,
                    format_cents(balance)
                );
            }

            Commands::Transfer {
                amount,
                to,
                credentials,
            } => {
                let user = sign_in(&service, &credentials).await?;
                let receipt = service
                    .transfer(user.id, &to, parse_amount(&amount)?)
                    .await?;
                println!("{} ({})", receipt.message, receipt.sent.id);
            }

            Commands::Edit {
                id,
                amount,
                category,
                credentials,
            } => {
                let user = sign_in(&service, &credentials).await?;
                let entry = service
                    .edit(parse_entry_id(&id)?, user.id, parse_amount(&amount)?, category)
                    .await?;
                println!(
                    "Updated {}: {} {}",
                    entry.id,
                    entry.kind,
                    format_cents(entry.amount_cents)
                );
            }

            Commands::Delete { id, credentials } => {
                let user = sign_in(&service, &credentials).await?;
                let entry = service.delete(parse_entry_id(&id)?, user.id).await?;
                println!(
                    "Deleted {} of {} ({})",
                    entry.kind,
                    format_cents(entry.amount_cents),
                    entry.id
                );
            }

            Commands::Balance { credentials } => {
                let user = sign_in(&service, &credentials).await?;
                let balance = service.balance(user.id).await?;
                println!("{}: {}", user.email, format_cents(balance));
            }

            Commands::History {
                from,
                to,
                limit,
                format,
                credentials,
            } => {
                let user = sign_in(&service, &credentials).await?;
                let filter = HistoryFilter {
                    date_from: parse_optional_date(from.as_deref())?,
                    date_to: parse_optional_date(to.as_deref())?,
                    limit,
                };
                let entries = service.history(user.id, &filter).await?;
                print_history(&entries, format)?;
            }

            Commands::Spending {
                from,
                to,
                format,
                credentials,
            } => {
                let user = sign_in(&service, &credentials).await?;
                let totals = service
                    .spending_by_category(
                        user.id,
                        parse_optional_date(from.as_deref())?,
                        parse_optional_date(to.as_deref())?,
                    )
                    .await?;
                print_category_totals(&totals, format)?;
            }

            Commands::Summary { month, credentials } => {
                let user = sign_in(&service, &credentials).await?;
                let period = parse_month_or_current(month.as_deref())?;
                let summary = service.monthly_summary_for(user.id, period).await?;

                println!("Summary for {}", summary.period);
                println!("{}", "-".repeat(28));
                println!("  {:<12} {:>12}", "Inflows:", format_cents(summary.inflows));
                println!("  {:<12} {:>12}", "Outflows:", format_cents(summary.outflows));
                println!("  {:<12} {:>12}", "Net:", format_cents(summary.net));
            }

            Commands::Top { limit, credentials } => {
                let user = sign_in(&service, &credentials).await?;
                let totals = service.top_categories(user.id, limit).await?;
                print_category_totals(&totals, OutputFormat::Table)?;
            }

            Commands::Budget(budget_cmd) => {
                run_budget_command(&service, budget_cmd).await?;
            }

            Commands::Check { repair } => {
                run_check_command(&service, repair).await?;
            }
        }

        Ok(())
    }
}

/// `RUST_LOG` wins over the configured level. Logs go to stderr so that
/// csv and json output stay clean.
fn init_logging(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("pocketbook={}", log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    match log.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .init(),
    }
}

async fn sign_in(service: &LedgerService, credentials: &Credentials) -> Result<User> {
    let user = service
        .authenticate(&credentials.email, |hash| {
            verify_password(&credentials.password, hash).unwrap_or(false)
        })
        .await?;
    Ok(user)
}

async fn run_budget_command(service: &LedgerService, cmd: BudgetCommands) -> Result<()> {
    match cmd {
        BudgetCommands::Set {
            category,
            amount,
            month,
            credentials,
        } => {
            let user = sign_in(service, &credentials).await?;
            let period = parse_month_or_current(month.as_deref())?;
            let budget = service
                .set_budget(user.id, &category, parse_amount(&amount)?, period.month, period.year)
                .await?;
            println!(
                "Budget for {} in {}: {}",
                budget.category,
                budget.period,
                format_cents(budget.limit_cents)
            );
        }

        BudgetCommands::Delete {
            category,
            month,
            credentials,
        } => {
            let user = sign_in(service, &credentials).await?;
            let period = parse_month_or_current(month.as_deref())?;
            service
                .delete_budget(user.id, &category, period.month, period.year)
                .await?;
            println!("Deleted budget for {} in {}", category.trim(), period);
        }

        BudgetCommands::Status { month, credentials } => {
            let user = sign_in(service, &credentials).await?;
            let period = parse_month_or_current(month.as_deref())?;
            let statuses = service
                .budget_vs_actual(user.id, period.month, period.year)
                .await?;

            if statuses.is_empty() {
                println!("No budgets for {}.", period);
                return Ok(());
            }

            println!("Budgets for {}", period);
            println!(
                "{:<20} {:>12} {:>12} {:>12}",
                "CATEGORY", "LIMIT", "SPENT", "REMAINING"
            );
            println!("{}", "-".repeat(60));
            for status in &statuses {
                println!(
                    "{:<20} {:>12} {:>12} {:>12}{}",
                    truncate(&status.budget.category, 20),
                    format_cents(status.budget.limit_cents),
                    format_cents(status.spent),
                    format_cents(status.remaining),
                    if status.is_over_budget() { "  OVER" } else { "" }
                );
            }
        }
    }
    Ok(())
}

async fn run_check_command(service: &LedgerService, repair: bool) -> Result<()> {
    println!("Checking balances against the ledger...\n");

    let checks = service.check_all().await?;
    let mut diverging = 0;

    println!("{:<30} {:>12} {:>12}", "USER", "CACHED", "LEDGER");
    println!("{}", "-".repeat(58));
    for check in &checks {
        let status = if check.is_consistent() {
            "OK"
        } else {
            diverging += 1;
            if repair {
                service.repair_balance(check.user_id).await?;
                "REPAIRED"
            } else {
                "DIVERGES"
            }
        };
        println!(
            "{:<30} {:>12} {:>12}  {}",
            truncate(&check.email, 30),
            format_cents(check.cached),
            format_cents(check.derived),
            status
        );
    }
    println!();

    if diverging == 0 {
        println!("All {} balances match their ledgers.", checks.len());
    } else if repair {
        println!("Repaired {} balance(s).", diverging);
    } else {
        anyhow::bail!(
            "{} balance(s) diverge from the ledger; rerun with --repair",
            diverging
        );
    }
    Ok(())
}

fn print_history(entries: &[Entry], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(entries)?);
        }
        OutputFormat::Csv => {
            let mut writer = csv::Writer::from_writer(io::stdout());
            writer.write_record([
                "id",
                "timestamp",
                "kind",
                "amount",
                "category",
                "provenance",
                "transfer_id",
            ])?;
            for entry in entries {
                writer.write_record([
                    entry.id.to_string(),
                    entry.timestamp.to_rfc3339(),
                    entry.kind.to_string(),
                    format_cents(entry.amount_cents),
                    entry.category.clone().unwrap_or_default(),
                    entry.provenance.to_string(),
                    entry.transfer_id.map(|id| id.to_string()).unwrap_or_default(),
                ])?;
            }
            writer.flush()?;
        }
        OutputFormat::Table => {
            if entries.is_empty() {
                println!("No entries found.");
                return Ok(());
            }
            println!(
                "{:<17} {:<10} {:>12} {:<15} {:<18} ID",
                "DATE", "KIND", "AMOUNT", "CATEGORY", "SOURCE"
            );
            println!("{}", "-".repeat(110));
            for entry in entries {
                println!(
                    "{:<17} {:<10} {:>12} {:<15} {:<18} {}",
                    entry.timestamp.format("%Y-%m-%d %H:%M"),
                    entry.kind,
                    format_cents(entry.signed_amount()),
                    truncate(entry.category.as_deref().unwrap_or(""), 15),
                    entry.provenance,
                    entry.id
                );
            }
        }
    }
    Ok(())
}

fn print_category_totals(totals: &[CategoryTotal], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(totals)?);
        }
        OutputFormat::Csv => {
            let mut writer = csv::Writer::from_writer(io::stdout());
            writer.write_record(["category", "total", "count"])?;
            for total in totals {
                writer.write_record([
                    total.category.clone(),
                    format_cents(total.total),
                    total.count.to_string(),
                ])?;
            }
            writer.flush()?;
        }
        OutputFormat::Table => {
            if totals.is_empty() {
                println!("No spending found.");
                return Ok(());
            }
            let grand_total: Cents = totals.iter().map(|t| t.total).sum();
            println!("{:<20} {:>12} {:>7} {:>6}", "CATEGORY", "TOTAL", "COUNT", "%");
            println!("{}", "-".repeat(48));
            for total in totals {
                println!(
                    "{:<20} {:>12} {:>7} {:>5.1}%",
                    truncate(&total.category, 20),
                    format_cents(total.total),
                    total.count,
                    percentage(total.total, grand_total)
                );
            }
            println!("{}", "-".repeat(48));
            println!("{:<20} {:>12}", "Total", format_cents(grand_total));
        }
    }
    Ok(())
}

fn percentage(part: Cents, whole: Cents) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

fn parse_amount(amount: &str) -> Result<Cents> {
    parse_cents(amount).with_context(|| format!("Invalid amount '{}'. Use '50.00' or '50'", amount))
}

fn parse_entry_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).context("Invalid entry ID format (expected UUID)")
}

fn parse_optional_date(date: Option<&str>) -> Result<Option<NaiveDate>> {
    date.map(|s| {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .with_context(|| format!("Invalid date '{}'. Use YYYY-MM-DD", s))
    })
    .transpose()
}

fn parse_month_or_current(month: Option<&str>) -> Result<Month> {
    match month {
        Some(s) => parse_month(s),
        None => Ok(Month::containing(Utc::now())),
    }
}

fn parse_month(s: &str) -> Result<Month> {
    let invalid = || anyhow::anyhow!("Invalid month '{}'. Use YYYY-MM", s);
    let (year, month) = s.split_once('-').ok_or_else(invalid)?;
    let year: i32 = year.parse().map_err(|_| invalid())?;
    let month: u32 = month.parse().map_err(|_| invalid())?;
    Month::new(year, month).ok_or_else(invalid)
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
