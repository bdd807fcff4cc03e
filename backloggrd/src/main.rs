use backloggrd::config::AppConfig;
use backloggrd::runtime::AppRuntime;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run,
    SyncOnce,
    Status,
    RetryDead,
    Login(String),
    Logout,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "run" => mode = CliMode::Run,
            "--sync-once" => mode = CliMode::SyncOnce,
            "--status" => mode = CliMode::Status,
            "--retry-dead" => mode = CliMode::RetryDead,
            "--login" => match args.next() {
                Some(email) if !email.starts_with('-') => mode = CliMode::Login(email),
                _ => anyhow::bail!("--login needs an email address"),
            },
            "--logout" => mode = CliMode::Logout,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn print_help() {
    println!("Usage: backloggrd [run|--sync-once|--status|--retry-dead|--login <email>|--logout]");
    println!("  run               Sync in the background until Ctrl-C (default)");
    println!("  --sync-once       Run a single sync pass and exit");
    println!("  --status          Show pending and dead-lettered operation counts");
    println!("  --retry-dead      Requeue dead-lettered operations");
    println!("  --login <email>   Sign in with BACKLOGGR_PASSWORD and store the token");
    println!("  --logout          Remove the saved token and wipe the local cache");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("backloggrd=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        print_help();
        return Ok(());
    }

    let config = AppConfig::from_env()?;
    let runtime = AppRuntime::bootstrap(config).await?;
    match mode {
        CliMode::Run => runtime.run().await,
        CliMode::SyncOnce => {
            let report = runtime.sync_once().await?;
            if report.skipped_offline {
                println!("offline: nothing sent");
            } else {
                println!(
                    "dispatched {} succeeded {} failed {} dead-lettered {} deferred {}",
                    report.dispatched,
                    report.succeeded,
                    report.failed,
                    report.dead_lettered,
                    report.deferred
                );
            }
            if report.auth_required {
                anyhow::bail!("server rejected the saved token; sign in again");
            }
            Ok(())
        }
        CliMode::Status => {
            let status = runtime.status().await?;
            println!("pending: {}", status.pending);
            println!("dead-lettered: {}", status.dead_lettered);
            Ok(())
        }
        CliMode::RetryDead => {
            let requeued = runtime.retry_dead_letters().await?;
            println!("requeued {requeued} operation(s)");
            Ok(())
        }
        CliMode::Login(email) => {
            let password = std::env::var("BACKLOGGR_PASSWORD")
                .map_err(|_| anyhow::anyhow!("BACKLOGGR_PASSWORD is not set"))?;
            runtime.login(&email, &password).await?;
            println!("signed in as {email}");
            Ok(())
        }
        CliMode::Logout => {
            runtime.logout().await?;
            println!("signed out; local cache cleared");
            Ok(())
        }
        CliMode::Help => Ok(()),
    }
}
