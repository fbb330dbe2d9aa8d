use anyhow::Context;
use plannerd::daemon::{DaemonConfig, DaemonRuntime, format_status};
use plannerd::storage::{StoredCredential, TokenStorage};
use plannerd::sync::clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Once,
    Resync,
    Status,
    StoreToken,
    Logout,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--once" => mode = CliMode::Once,
            "--resync" => mode = CliMode::Resync,
            "--status" => mode = CliMode::Status,
            "--store-token" => mode = CliMode::StoreToken,
            "--logout" => mode = CliMode::Logout,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn init_logging() -> anyhow::Result<()> {
    let level = std::env::var("PLANNER_LOG")
        .ok()
        .and_then(|value| value.trim().parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                clock::format_rfc3339(clock::now_utc()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .level_for("sqlx", log::LevelFilter::Warn)
        .chain(std::io::stderr())
        .apply()
        .context("failed to install logger")?;
    Ok(())
}

fn store_token() -> anyhow::Result<()> {
    let token = std::env::var("PLANNER_ACCESS_TOKEN")
        .ok()
        .filter(|token| !token.trim().is_empty())
        .context("PLANNER_ACCESS_TOKEN is not set")?;
    let expires_at = match std::env::var("PLANNER_TOKEN_EXPIRES_AT") {
        Ok(value) => Some(
            value
                .trim()
                .parse::<i64>()
                .context("PLANNER_TOKEN_EXPIRES_AT must be unix seconds")?,
        ),
        Err(_) => None,
    };
    let storage = TokenStorage::new().context("failed to initialize token storage")?;
    storage
        .save(&StoredCredential::new(token.trim(), expires_at))
        .context("failed to save token")?;
    log::info!("access token saved to the keyring");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    init_logging()?;
    match mode {
        CliMode::Help => {
            println!("Usage: plannerd [--once | --resync | --status | --store-token | --logout]");
            println!("  (no argument)  Run the sync daemon until Ctrl-C");
            println!("  --once         Pull both backends, push one batch and exit");
            println!("  --resync       Drop sync cursors, queue every task and push one batch");
            println!("  --status       Print sync timestamps and queue depth");
            println!("  --store-token  Save PLANNER_ACCESS_TOKEN to the keyring");
            println!("  --logout       Remove the saved token");
            return Ok(());
        }
        CliMode::StoreToken => return store_token(),
        CliMode::Logout => {
            let storage = TokenStorage::new().context("failed to initialize token storage")?;
            storage.delete().context("failed to remove token")?;
            log::info!("saved token removed");
            return Ok(());
        }
        CliMode::Run | CliMode::Once | CliMode::Resync | CliMode::Status => {}
    }

    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    match mode {
        CliMode::Once => {
            let report = daemon.run_once().await?;
            println!(
                "calendar: {} created, {} updated, {} unlinked; tasks: {} created, {} updated, {} unlinked; pushed {}/{}",
                report.calendar.created,
                report.calendar.updated,
                report.calendar.unlinked,
                report.tasks.created,
                report.tasks.updated,
                report.tasks.unlinked,
                report.push.succeeded,
                report.push.processed
            );
            Ok(())
        }
        CliMode::Resync => {
            let (resync, push) = daemon.resync().await?;
            println!(
                "queued {} tasks, pushed {}/{}",
                resync.queued, push.succeeded, push.processed
            );
            Ok(())
        }
        CliMode::Status => {
            println!("{}", format_status(&daemon.status().await?));
            Ok(())
        }
        _ => daemon.run().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Vec<String> {
        std::iter::once("plannerd")
            .chain(extra.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn parse_cli_mode_defaults_to_run() {
        assert_eq!(parse_cli_mode(args(&[])).unwrap(), CliMode::Run);
    }

    #[test]
    fn parse_cli_mode_supports_one_shot_modes() {
        assert_eq!(parse_cli_mode(args(&["--once"])).unwrap(), CliMode::Once);
        assert_eq!(parse_cli_mode(args(&["--resync"])).unwrap(), CliMode::Resync);
        assert_eq!(parse_cli_mode(args(&["--status"])).unwrap(), CliMode::Status);
    }

    #[test]
    fn parse_cli_mode_supports_token_management() {
        assert_eq!(
            parse_cli_mode(args(&["--store-token"])).unwrap(),
            CliMode::StoreToken
        );
        assert_eq!(parse_cli_mode(args(&["--logout"])).unwrap(), CliMode::Logout);
        assert_eq!(parse_cli_mode(args(&["-h"])).unwrap(), CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_flags() {
        assert!(parse_cli_mode(args(&["--verbose"])).is_err());
    }
}
