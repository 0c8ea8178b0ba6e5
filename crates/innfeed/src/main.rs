use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use innfeed_core::config::Config;
use innfeed_core::dispatcher::Dispatcher;
use innfeed_core::limits::raise_nofile_limit;
use innfeed_core::logging::init_logging;
use tracing::{error, info, warn};

/// Outgoing NNTP news feeder: reads `<filename> <message-id> <peer>...`
/// commands and streams articles to each named peer.
#[derive(Parser)]
#[command(name = "innfeed", version, author, about)]
struct Opts {
    /// Config file (`[global]`/`[peer.<name>]` TOML tables).
    #[arg(short = 'c', long = "config", env = "INNFEED_CONFIG")]
    config: Option<PathBuf>,

    /// Backlog directory holding tapes and lockfiles.
    #[arg(short = 'b', long = "backlog-dir", default_value = "backlog")]
    backlog_dir: PathBuf,

    /// Root directory article filenames are resolved relative to.
    #[arg(short = 'a', long = "article-root")]
    article_root: Option<PathBuf>,

    /// Run `<cmd>` and read dispatcher commands from its stdout instead of
    /// our own stdin or the positional input file.
    #[arg(short = 's', long = "subprocess")]
    subprocess: Option<String>,

    /// No new input: drain existing tapes for every configured peer, then
    /// exit once they're empty.
    #[arg(short = 'x', long = "drain-only")]
    drain_only: bool,

    /// Create peers named on the command line that have no `[peer.*]` table.
    #[arg(short = 'y', long = "create-peers")]
    create_peers: bool,

    /// Console log level.
    #[arg(short = 'd', long = "log-level", default_value = "info")]
    log_level: String,

    /// Tape size cap in bytes, overriding each peer's configured high-water
    /// mark.
    #[arg(short = 'e', long = "tape-cap")]
    tape_cap: Option<u64>,

    /// Redirect stdout/stderr to this file (daemonized operation).
    #[arg(short = 'l', long = "log-file")]
    log_file: Option<PathBuf>,

    /// Log every missing/unreadable article at warn instead of debug.
    #[arg(short = 'm', long = "log-missing")]
    log_missing: bool,

    /// Disable memory-mapped article reads, always copying via `read`.
    #[arg(short = 'M', long = "no-mmap")]
    no_mmap: bool,

    /// Write our pid to this file.
    #[arg(short = 'p', long = "pid-file")]
    pid_file: Option<PathBuf>,

    /// Parse the config file, report any errors, and exit without running.
    #[arg(short = 'C', long = "check-config")]
    check_config: bool,

    /// Emit a shell completion script for the named shell and exit.
    #[arg(long = "completions", value_enum)]
    completions: Option<clap_complete::Shell>,

    /// Input file to read dispatcher commands from. Omit (or pass `-`) for
    /// stdin.
    input: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    if let Some(shell) = opts.completions {
        clap_complete::generate(shell, &mut Opts::command(), "innfeed", &mut io::stdout());
        return Ok(());
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = rt.block_on(async_main(opts));
    rt.shutdown_timeout(Duration::from_secs(1));
    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1)
        }
    }
}

/// Redirects both stdout and stderr onto `path`, for daemonized operation
/// under a process supervisor that doesn't capture the child's fds itself.
fn redirect_output(path: &std::path::Path) -> anyhow::Result<()> {
    use std::os::unix::io::AsRawFd;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {path:?}"))?;
    let fd = file.as_raw_fd();
    unsafe {
        if libc::dup2(fd, libc::STDOUT_FILENO) < 0 || libc::dup2(fd, libc::STDERR_FILENO) < 0 {
            return Err(std::io::Error::last_os_error()).context("redirecting stdout/stderr");
        }
    }
    std::mem::forget(file); // the duplicated fds now own the underlying file
    Ok(())
}

async fn async_main(opts: Opts) -> anyhow::Result<()> {
    if let Some(path) = &opts.log_file {
        redirect_output(path)?;
    }

    let logging = std::sync::Arc::new(
        init_logging(&opts.log_level, false).context("failed to initialize logging")?,
    );

    match raise_nofile_limit() {
        Ok(limit) => info!(limit, "raised open file limit"),
        Err(e) => warn!("failed to raise open file limit: {e:#}"),
    }

    let mut config = match &opts.config {
        Some(path) => Config::load(path).with_context(|| format!("loading config {path:?}"))?,
        None => Config::parse("").context("building default config")?,
    };
    config.create_peers_dynamically |= opts.create_peers;

    if opts.check_config {
        info!(peers = config.peers.len(), "config parsed successfully");
        return Ok(());
    }

    if let Some(pid_path) = &opts.pid_file {
        tokio::fs::write(pid_path, format!("{}\n", std::process::id()))
            .await
            .with_context(|| format!("writing pid file {pid_path:?}"))?;
    }

    // Signal handlers (spec.md §5: SIGTERM/SIGQUIT/SIGHUP/SIGINT/SIGALRM/
    // SIGIOT/SIGUSR1/SIGUSR2) are installed by `Dispatcher::new` below,
    // which also owns the flag word its event loop polls.

    let backlog_dir = config
        .backlog_directory
        .clone()
        .unwrap_or(opts.backlog_dir.clone());
    let wire_cache_bytes = opts.tape_cap.unwrap_or(64 << 20) as usize;

    let mut dispatcher = Dispatcher::new(
        config,
        backlog_dir,
        opts.article_root.clone(),
        !opts.no_mmap,
        wire_cache_bytes,
        opts.log_missing,
    )
    .context("initializing dispatcher")?;
    dispatcher.set_reload_sources(opts.config.clone(), Some(logging));

    if opts.drain_only {
        info!("drain-only mode: no new input will be accepted");
        dispatcher
            .spawn_configured_peers()
            .context("spawning configured peers for drain-only mode")?;
        dispatcher.run(tokio::io::empty()).await?;
        return Ok(());
    }

    if let Some(cmd) = &opts.subprocess {
        let mut child = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(cmd)
            .stdout(std::process::Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning subprocess {cmd:?}"))?;
        let stdout = child.stdout.take().context("subprocess had no stdout")?;
        dispatcher.run(stdout).await?;
        let _ = child.wait().await;
        return Ok(());
    }

    match &opts.input {
        Some(path) if path.as_os_str() != "-" => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening input file {path:?}"))?;
            dispatcher.run(file).await?;
        }
        _ => {
            dispatcher.run(tokio::io::stdin()).await?;
        }
    }

    Ok(())
}
