//! votedrip - stealth ballot trickler
//!
//! Casts ticket-weighted governance votes spread across the remaining vote
//! window, with durable journals and an offline post-mortem audit.

use std::io::{BufRead, Write};
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use tokio::sync::watch;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use votedrip_core::chain::TicketHash;
use votedrip_core::wallet::{
    AddressInfo, RemoteWallet, SignRequest, TicketAddress, Wallet, WalletError,
};
use votedrip_core::{Config, VoteMode, Voter};

/// votedrip - stealth ballot trickler
#[derive(Parser, Debug)]
#[command(name = "votedrip")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "votedrip.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Duration to spread votes over, e.g. 6h (0 = remaining window minus
    /// hoursprior)
    #[arg(long, value_parser = humantime::parse_duration)]
    voteduration: Option<Duration>,

    /// Safety margin before the vote window closes
    #[arg(long, value_parser = humantime::parse_duration)]
    hoursprior: Option<Duration>,

    /// Use the truncated-Gaussian time distribution
    #[arg(long)]
    gaussian: bool,

    /// Number of bunches for the bunched distribution
    #[arg(long)]
    bunches: Option<u32>,

    /// Fabricate this many eligible tickets and never contact the server
    #[arg(long)]
    emulatevote: Option<u32>,

    /// Shift the effective start back by the elapsed vote time
    #[arg(long)]
    resume: bool,

    /// Ticket-vote server base URL
    #[arg(long)]
    host: Option<String>,

    /// Minutes between periodic progress tables (0 = off)
    #[arg(long)]
    intervalstats: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Retrieve all proposals that are being voted on
    Inventory,

    /// Vote on a proposal: `vote <token> number yes <Y> no <N>`,
    /// `vote <token> percent yes <y> no <n>`, or `vote <token> mirror`
    Vote {
        /// Proposal censorship token
        token: String,

        /// Vote mode and quantities
        #[arg(trailing_var_arg = true, allow_hyphen_values = false)]
        args: Vec<String>,
    },

    /// Tally votes on a proposal
    Tally {
        /// Proposal censorship token
        token: String,
    },

    /// Tally votes in a grouped own/public/total table
    #[command(name = "tally-table")]
    TallyTable {
        /// Proposal censorship token
        token: String,
    },

    /// Print standing for every active vote
    Stats,

    /// Audit journals: no tokens lists them, `ALL` audits everything
    Verify {
        /// Proposal tokens
        tokens: Vec<String>,
    },
}

// The vote grammar is keyword-positional; parse it by hand the way the
// flag parser never could.
fn parse_vote_mode(args: &[String]) -> Result<VoteMode> {
    let usage = "usage: vote <token> number yes <Y> no <N> | percent yes <y> no <n> | mirror";
    let Some(mode) = args.first() else {
        bail!("vote: not enough arguments\n{usage}");
    };
    match mode.as_str() {
        "mirror" => {
            if args.len() != 1 {
                bail!("vote: mirror takes no further arguments\n{usage}");
            }
            Ok(VoteMode::Mirror)
        }
        "number" => {
            if args.len() != 5 || args[1] != "yes" || args[3] != "no" {
                bail!("vote: invalid arguments\n{usage}");
            }
            let yes: u64 = args[2].parse().context("yes count")?;
            let no: u64 = args[4].parse().context("no count")?;
            Ok(VoteMode::Number { yes, no })
        }
        "percent" => {
            if args.len() != 5 || args[1] != "yes" || args[3] != "no" {
                bail!("vote: invalid arguments\n{usage}");
            }
            let yes: f64 = args[2].parse().context("yes rate")?;
            let no: f64 = args[4].parse().context("no rate")?;
            if yes < 0.0 || no < 0.0 || yes > 1.0 || no > 1.0 {
                bail!("rates must be within [0, 1]");
            }
            if yes + no > 1.0 {
                bail!("total of yes and no rates is greater than 1");
            }
            Ok(VoteMode::Percent { yes, no })
        }
        other => bail!("vote mode [{other}] is not supported\n{usage}"),
    }
}

// Prompt with terminal echo disabled; loops until something is entered.
fn prompt_passphrase() -> Result<SecretString> {
    use nix::sys::termios::{LocalFlags, SetArg, tcgetattr, tcsetattr};

    let stdin = std::io::stdin();
    loop {
        print!("Enter the private passphrase of your wallet: ");
        std::io::stdout().flush()?;

        let saved = tcgetattr(stdin.as_fd()).context("read terminal attributes")?;
        let mut silent = saved.clone();
        silent.local_flags.remove(LocalFlags::ECHO);
        tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &silent).context("disable echo")?;

        let mut line = String::new();
        let read = stdin.lock().read_line(&mut line);
        tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &saved).context("restore echo")?;
        println!();
        read?;

        let pass = line.trim_end_matches(['\r', '\n']).to_string();
        if !pass.is_empty() {
            return Ok(SecretString::new(pass));
        }
    }
}

// Stand-in wallet for emulation runs, which never touch wallet or server.
struct DisabledWallet;

#[async_trait]
impl Wallet for DisabledWallet {
    async fn current_height(&self) -> Result<u32, WalletError> {
        Err(disabled())
    }

    async fn best_block(&self) -> Result<u32, WalletError> {
        Err(disabled())
    }

    async fn verify_passphrase(&self, _: u32, _: &[u8]) -> Result<(), WalletError> {
        Err(disabled())
    }

    async fn committed_tickets(&self, _: &[TicketHash]) -> Result<Vec<TicketAddress>, WalletError> {
        Err(disabled())
    }

    async fn transaction(&self, _: &TicketHash) -> Result<Vec<u8>, WalletError> {
        Err(disabled())
    }

    async fn validate_address(&self, _: &str) -> Result<AddressInfo, WalletError> {
        Err(disabled())
    }

    async fn sign_messages(
        &self,
        _: &[u8],
        _: &[SignRequest],
    ) -> Result<Vec<Vec<u8>>, WalletError> {
        Err(disabled())
    }
}

fn disabled() -> WalletError {
    WalletError::Transport("wallet disabled during emulation".to_string())
}

fn apply_overrides(cfg: &mut Config, cli: &Cli) {
    if let Some(duration) = cli.voteduration {
        cfg.vote_duration = duration;
    }
    if let Some(duration) = cli.hoursprior {
        cfg.hours_prior = duration;
    }
    if cli.gaussian {
        cfg.gaussian = true;
    }
    if let Some(bunches) = cli.bunches {
        cfg.bunches = bunches;
    }
    if let Some(emulate) = cli.emulatevote {
        cfg.emulate_vote = emulate;
    }
    if cli.resume {
        cfg.resume = true;
    }
    if let Some(host) = &cli.host {
        cfg.host = host.clone();
    }
    if let Some(minutes) = cli.intervalstats {
        cfg.interval_stats_minutes = minutes;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut cfg = Config::load(&cli.config)
        .with_context(|| format!("load config {}", cli.config.display()))?;
    apply_overrides(&mut cfg, &cli);

    // Shutdown signal: Ctrl-C or SIGTERM cancels every suspension point.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                warn!(error = %err, "sigterm handler unavailable");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        warn!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    // Emulation never contacts wallet or server; everything else needs the
    // wallet connection up front.
    let emulating = cfg.emulate_vote > 0;
    let needs_wallet = !matches!(cli.command, Commands::Verify { .. }) && !emulating;
    let wallet: Arc<dyn Wallet> = if needs_wallet {
        let wallet = RemoteWallet::connect(
            &cfg.wallet_host,
            &cfg.wallet_cert,
            &cfg.client_cert,
            &cfg.client_key,
        )
        .await
        .context("connect wallet")?;
        let height = wallet.current_height().await.context("wallet accounts")?;
        debug!(height, "current wallet height");
        Arc::new(wallet)
    } else {
        Arc::new(DisabledWallet)
    };

    // The vote command needs the passphrase before ballots are built.
    let passphrase = match (&cli.command, emulating) {
        (Commands::Vote { .. }, false) => Some(match cfg.wallet_passphrase.take() {
            Some(pass) => SecretString::new(pass),
            None => prompt_passphrase()?,
        }),
        _ => None,
    };

    let voter = Voter::new(cfg, wallet, passphrase, shutdown_rx)?;
    debug!(run = %voter.run_started(), "run started");

    match cli.command {
        Commands::Inventory => voter.inventory().await?,
        Commands::Vote { token, args } => {
            let mode = parse_vote_mode(&args)?;
            voter.vote(&token, mode).await?;
        }
        Commands::Tally { token } => voter.tally(&token).await?,
        Commands::TallyTable { token } => voter.tally_table(&token).await?,
        Commands::Stats => voter.stats().await?,
        Commands::Verify { tokens } => voter.verify(&tokens).await?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(parts: &[&str]) -> Vec<String> {
        parts.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn parses_number_mode() {
        let mode = parse_vote_mode(&strings(&["number", "yes", "20", "no", "10"])).unwrap();
        assert_eq!(mode, VoteMode::Number { yes: 20, no: 10 });
    }

    #[test]
    fn parses_percent_mode_with_bounds() {
        let mode = parse_vote_mode(&strings(&["percent", "yes", "0.6", "no", "0.4"])).unwrap();
        assert_eq!(mode, VoteMode::Percent { yes: 0.6, no: 0.4 });

        assert!(parse_vote_mode(&strings(&["percent", "yes", "0.7", "no", "0.5"])).is_err());
        assert!(parse_vote_mode(&strings(&["percent", "yes", "-0.1", "no", "0.5"])).is_err());
    }

    #[test]
    fn parses_mirror_mode() {
        assert_eq!(parse_vote_mode(&strings(&["mirror"])).unwrap(), VoteMode::Mirror);
        assert!(parse_vote_mode(&strings(&["mirror", "extra"])).is_err());
    }

    #[test]
    fn rejects_wrong_keywords() {
        assert!(parse_vote_mode(&strings(&["number", "no", "10", "yes", "20"])).is_err());
        assert!(parse_vote_mode(&strings(&["bogus"])).is_err());
        assert!(parse_vote_mode(&[]).is_err());
    }
}
