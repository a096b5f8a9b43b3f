use clap::Parser;
use consultd::paths::DaemonPaths;
use dotenvy::dotenv;

/// Coordination daemon for AI consultations.
#[derive(Debug, Parser)]
#[command(name = "consultd", version, about)]
struct Cli {
    /// Run the daemon in the foreground.
    #[arg(long, conflicts_with_all = ["config", "uninstall", "legacy", "install"])]
    daemon: bool,

    /// Install editor integrations (handled by the installer package).
    #[arg(long)]
    install: bool,

    /// Print the effective configuration and exit.
    #[arg(long)]
    config: bool,

    /// Port of a running daemon to query (with --config).
    #[arg(long, requires = "config")]
    port: Option<u16>,

    /// Stop any running daemon and remove the state directory.
    #[arg(long, conflicts_with_all = ["daemon", "config", "legacy"])]
    uninstall: bool,

    /// Deprecated compatibility mode.
    #[arg(long, hide = true)]
    legacy: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    consultd::telemetry::init_tracing();

    let cli = Cli::parse();
    let paths = DaemonPaths::resolve()?;

    if cli.legacy {
        eprintln!("--legacy is deprecated; run --daemon instead");
        std::process::exit(2);
    }
    if cli.install {
        eprintln!("--install is provided by the installer package");
        std::process::exit(2);
    }
    if cli.daemon {
        return consultd::run_daemon(paths).await;
    }
    if cli.config {
        return print_config(&paths, cli.port).await;
    }
    if cli.uninstall {
        return uninstall(&paths);
    }

    // Default mode is the stdio proxy, which lives in the client package.
    eprintln!("consultd: proxy mode is provided by the MCP client package;");
    eprintln!("run `consultd --daemon` to start the daemon directly.");
    Ok(())
}

/// Show the effective config: from a running daemon when one answers,
/// otherwise straight from the store.
async fn print_config(paths: &DaemonPaths, port_override: Option<u16>) -> anyhow::Result<()> {
    if let Some(lock) = consultd::lifecycle::read_lock(paths) {
        let port = port_override.unwrap_or(lock.port);
        let url = format!("http://127.0.0.1:{}/api/config", port);
        let response = reqwest::Client::new()
            .get(&url)
            .header("x-daemon-token", &lock.token)
            .timeout(std::time::Duration::from_secs(3))
            .send()
            .await;
        if let Ok(response) = response {
            if response.status().is_success() {
                let body: serde_json::Value = response.json().await?;
                println!("{}", serde_json::to_string_pretty(&body)?);
                return Ok(());
            }
        }
    }

    let store = std::sync::Arc::new(consultd::Store::open(&paths.db_file())?);
    let hub = std::sync::Arc::new(consultd::EventHub::new());
    let config = consultd::ConfigService::new(store, hub).load()?;
    println!(
        "{}",
        serde_json::to_string_pretty(&consultd::config::masked_snapshot(&config))?
    );
    Ok(())
}

/// Stop a running daemon by pid and remove everything under the state dir.
fn uninstall(paths: &DaemonPaths) -> anyhow::Result<()> {
    if let Some(lock) = consultd::lifecycle::read_lock(paths) {
        if consultd::lifecycle::lock_is_live(&lock) {
            println!("stopping daemon (pid {})", lock.pid);
            #[cfg(unix)]
            unsafe {
                libc::kill(lock.pid as libc::pid_t, libc::SIGTERM);
            }
            std::thread::sleep(std::time::Duration::from_millis(500));
        }
    }
    std::fs::remove_dir_all(paths.root())?;
    println!("removed {}", paths.root().display());
    Ok(())
}
