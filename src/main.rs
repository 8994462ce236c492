//! phoque - iptables rule manager
//!
//! Each invocation loads the rule file once, runs one operation and prints
//! its outcome. Operations never run concurrently.
//!
//! # Usage
//!
//! ```bash
//! phoque list                               # Rules with their state
//! phoque add allow in tcp --port 22         # New inactive rule
//! phoque edit 67e55044 deny in tcp -p 2222  # Overwrite fields (apply to take effect)
//! phoque toggle 67e55044                    # Flip active, then reconcile
//! phoque toggle-all                         # Toggle all / untoggle all / toggle remaining
//! phoque delete 67e55044                    # De-apply if active, then remove
//! phoque apply                              # Reconcile live chains with the rule file
//! phoque apply --dry-run                    # Print the commands instead
//! ```

use clap::{Args, Parser, Subcommand};
use phoque::audit::AuditLog;
use phoque::config;
use phoque::core::error::{Error, IptablesErrorPattern};
use phoque::core::firewall::{Action, Direction, Protocol, RuleSpec};
use phoque::core::gateway::IptablesGateway;
use phoque::core::manager::{ApplyReport, FirewallManager};
use phoque::core::store::JsonRuleFile;
use std::io::Write;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

type Manager = FirewallManager<IptablesGateway, JsonRuleFile>;

#[derive(Parser)]
#[command(name = "phoque", version)]
#[command(about = "Declarative iptables rule manager", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List rules in priority order
    List,
    /// Add a new (inactive) rule
    Add(RuleArgs),
    /// Overwrite a rule's fields; run `apply` for active rules to pick it up
    Edit {
        /// Rule id or unique id prefix
        id: String,
        #[command(flatten)]
        rule: RuleArgs,
    },
    /// Delete a rule, removing its live entry first if it is active
    Delete {
        /// Rule id or unique id prefix
        id: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Flip a rule's active state and reconcile
    Toggle {
        /// Rule id or unique id prefix
        id: String,
    },
    /// Activate all rules, or deactivate them if all are active, and reconcile
    ToggleAll,
    /// Reconcile the live chains with the rule file
    Apply {
        /// Print the commands a pass would run without executing them
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Args)]
struct RuleArgs {
    /// allow, deny or reject
    action: Action,
    /// in, out or forward
    direction: Direction,
    /// tcp, udp or icmp
    protocol: Protocol,
    /// Port: N, A-B, A:B or * (required for tcp/udp)
    #[arg(short, long)]
    port: Option<String>,
    /// Interface name (input interface for in/forward, output for out)
    #[arg(short, long)]
    interface: Option<String>,
}

impl From<RuleArgs> for RuleSpec {
    fn from(args: RuleArgs) -> Self {
        Self {
            action: args.action,
            direction: args.direction,
            protocol: args.protocol,
            port: args.port,
            interface: args.interface,
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let log_file = phoque::utils::get_state_dir().and_then(|mut path| {
        path.push("phoque.log");
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
    });

    match log_file {
        Some(file) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .init(),
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

fn main() -> ExitCode {
    let _ = phoque::utils::ensure_dirs();
    init_logging();
    let cli = Cli::parse();

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    match runtime.block_on(handle_cli(cli.command)) {
        Ok(code) => code,
        Err(e) => {
            print_error(&e);
            ExitCode::FAILURE
        }
    }
}

async fn open_manager() -> phoque::Result<Manager> {
    let config = config::load_config().await;
    let gateway = IptablesGateway::new(config.iptables_command());
    let rules = JsonRuleFile::new(config.rules_file()?);

    let audit = if config.audit_log {
        AuditLog::new()
            .inspect_err(|e| tracing::warn!("Audit log unavailable: {e}"))
            .ok()
    } else {
        None
    };

    Ok(FirewallManager::open(gateway, rules, config.sweep_untracked)
        .await?
        .with_audit(audit))
}

async fn handle_cli(command: Commands) -> phoque::Result<ExitCode> {
    let mut manager = open_manager().await?;
    let mut clean = true;

    match command {
        Commands::List => print_rules(&manager),
        Commands::Add(args) => {
            let saved = manager.add(args.into()).await?;
            println!("Added {}  {}", saved.value.short_id(), saved.value.summary());
            clean &= report_persist(saved.persist_error.as_ref());
        }
        Commands::Edit { id, rule } => {
            let id = manager.resolve(&id)?;
            let saved = manager.edit(&id, &rule.into()).await?;
            println!("Edited {}  {}", saved.value.short_id(), saved.value.summary());
            if saved.value.active {
                println!("Run 'phoque apply' to update the live entry.");
            }
            clean &= report_persist(saved.persist_error.as_ref());
        }
        Commands::Delete { id, yes } => {
            let id = manager.resolve(&id)?;
            let Some(rule) = manager.get(&id) else {
                return Err(Error::NotFound(id.to_string()));
            };
            if !yes && !confirm(&format!("Delete {}  {}?", rule.short_id(), rule.summary())) {
                println!("Cancelled.");
                return Ok(ExitCode::SUCCESS);
            }

            let saved = manager.remove(&id).await?;
            println!("Deleted {}  {}", saved.value.rule.short_id(), saved.value.rule.summary());
            if let Some(ref e) = saved.value.deapply_error {
                eprintln!("✗ Live entry could not be removed; apply sweeps it while sweep_untracked is on");
                print_error(e);
                clean = false;
            }
            clean &= report_persist(saved.persist_error.as_ref());
        }
        Commands::Toggle { id } => {
            let id = manager.resolve(&id)?;
            let saved = manager.toggle(&id).await?;
            let state = if saved.value.rule.active { "on" } else { "off" };
            println!("{}  {} is now {state}", saved.value.rule.short_id(), saved.value.rule.summary());
            clean &= report_persist(saved.persist_error.as_ref());
            clean &= print_report(&manager, &saved.value.report);
        }
        Commands::ToggleAll => {
            let saved = manager.toggle_all().await;
            match saved.value.target {
                Some(target) => println!("{}: {} rule(s)", target.label(), manager.rules().len()),
                None => println!("No rules to toggle."),
            }
            clean &= report_persist(saved.persist_error.as_ref());
            if saved.value.target.is_some() {
                clean &= print_report(&manager, &saved.value.report);
            }
        }
        Commands::Apply { dry_run: true } => {
            for command in manager.plan() {
                println!("iptables {command}");
            }
        }
        Commands::Apply { dry_run: false } => {
            if !nix::unistd::getuid().is_root() {
                println!("Note: Not running as root. Will use run0/sudo/pkexec for iptables.");
            }
            let report = manager.apply().await;
            clean &= print_report(&manager, &report);
        }
    }

    Ok(if clean {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_rules(manager: &Manager) {
    if manager.rules().is_empty() {
        println!("No rules. Add one with 'phoque add'.");
        return;
    }
    for rule in manager.rules() {
        let mark = if rule.active { "[x]" } else { "[ ]" };
        println!("{mark} {}  {}", rule.short_id(), rule.summary());
    }
    println!();
    println!("toggle-all will: {}", manager.toggle_all_label());
}

/// Returns `false` when the pass reported failures.
fn print_report(manager: &Manager, report: &ApplyReport) -> bool {
    println!(
        "Pass: {} removed, {} leftover swept, {} inserted",
        report.removed, report.swept, report.inserted
    );
    if report.is_success() {
        println!("✓ Live rules match the rule file.");
        return true;
    }

    eprintln!("✗ {} command(s) failed:", report.failures.len());
    for failure in &report.failures {
        let rule = failure
            .rule_id
            .and_then(|id| manager.get(&id))
            .map_or_else(|| "-".to_string(), |r| r.short_id());
        let command = failure.command.as_deref().unwrap_or("(listing)");
        eprintln!("  [{}] {rule}: {command}", failure.phase);
        print_error(&failure.error);
    }
    false
}

/// Returns `false` when saving failed.
fn report_persist(error: Option<&Error>) -> bool {
    match error {
        None => true,
        Some(e) => {
            eprintln!("✗ Rules were changed but not saved");
            print_error(e);
            false
        }
    }
}

fn print_error(error: &Error) {
    eprintln!("    Error: {error}");
    if let Some(stderr) = error.backend_stderr() {
        let translation = IptablesErrorPattern::match_error(stderr);
        eprintln!("    {}", translation.user_message);
        for suggestion in &translation.suggestions {
            eprintln!("      - {suggestion}");
        }
        if let Some(ref url) = translation.help_url {
            eprintln!("      See: {url}");
        }
    }
}

fn confirm(prompt: &str) -> bool {
    print!("{prompt} [y/N] ");
    if std::io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}
