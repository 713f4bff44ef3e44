use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use mergin_core::{AuthGate, Credentials, MerginClient, ProjectListFilter, UserSession};
use mergin_sync::config::EngineConfig;
use mergin_sync::registry::LocalProjectsRegistry;
use mergin_sync::settings::AuthSettings;
use mergin_sync::sync::coordinator::{SyncCoordinator, SyncEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Pull(String),
    Push(String),
    List,
    Logout,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(first) = args.next() else {
        return Ok(CliMode::Help);
    };
    let mode = match first.as_str() {
        "--help" | "-h" => CliMode::Help,
        "--logout" => CliMode::Logout,
        "list" => CliMode::List,
        "pull" | "push" => {
            let project = args
                .next()
                .context("missing <namespace>/<name> argument")?;
            anyhow::ensure!(
                project.contains('/'),
                "project must be given as <namespace>/<name>"
            );
            if first == "pull" {
                CliMode::Pull(project)
            } else {
                CliMode::Push(project)
            }
        }
        other => anyhow::bail!("unknown argument: {other}"),
    };
    if let Some(extra) = args.next() {
        anyhow::bail!("unexpected argument: {extra}");
    }
    Ok(mode)
}

fn print_usage() {
    println!("Usage: mergin-sync <command> [options]");
    println!();
    println!("Commands:");
    println!("  pull <namespace>/<name>   Download or update a project");
    println!("  push <namespace>/<name>   Upload local changes");
    println!("  list                      List projects available on the server");
    println!();
    println!("Options:");
    println!("  --logout   Remove saved credentials and exit");
    println!("  --help     Show this help");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        print_usage();
        return Ok(());
    }

    let settings_path = AuthSettings::default_path().context("config directory is unavailable")?;
    if mode == CliMode::Logout {
        AuthSettings::delete(&settings_path)?;
        eprintln!("[mergin-sync] saved credentials removed");
        return Ok(());
    }

    let config = EngineConfig::from_env()?;
    let mut settings = AuthSettings::load(&settings_path);
    let api_root = if settings.api_root.is_empty() {
        config.api_root.clone()
    } else {
        settings.api_root.clone()
    };

    let auth = Arc::new(AuthGate::new(&api_root)?);
    let username = std::env::var("MERGIN_USERNAME").unwrap_or_else(|_| settings.username.clone());
    let password = std::env::var("MERGIN_PASSWORD").unwrap_or_else(|_| settings.password.clone());
    if !username.is_empty() && !password.is_empty() {
        auth.set_credentials(Credentials {
            login: username,
            password,
        })
        .await;
    }
    if !settings.token.is_empty() {
        auth.restore_session(UserSession {
            token: settings.token.clone(),
            expire: settings.expire,
            user_id: settings.user_id,
            username: settings.username.clone(),
            disk_usage: 0,
            storage_limit: 0,
        })
        .await;
    }

    let client = MerginClient::new(&api_root, auth.clone())?;
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("failed to create data dir at {:?}", config.data_dir))?;
    let registry = Arc::new(LocalProjectsRegistry::scan(&config.data_dir));

    let (events, mut receiver) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            match event {
                SyncEvent::Progress { project, fraction } if fraction >= 0.0 => {
                    eprintln!("[mergin-sync] {project}: {:.0}%", fraction * 100.0);
                }
                SyncEvent::Progress { .. } => {}
                SyncEvent::Finished {
                    project, success, ..
                } => {
                    let verdict = if success { "done" } else { "failed" };
                    eprintln!("[mergin-sync] {project}: {verdict}");
                }
            }
        }
    });

    let coordinator =
        SyncCoordinator::new(client.clone(), registry, config.data_dir.clone(), events);

    match mode {
        CliMode::Pull(project) => {
            let (namespace, name) = project.rsplit_once('/').context("invalid project name")?;
            let dir = coordinator.pull_project(namespace, name).await?;
            println!("{}", dir.display());
        }
        CliMode::Push(project) => {
            let (namespace, name) = project.rsplit_once('/').context("invalid project name")?;
            let dir = coordinator.push_project(namespace, name).await?;
            println!("{}", dir.display());
        }
        CliMode::List => {
            for project in client.list_projects(&ProjectListFilter::default()).await? {
                println!("{} v{}", project.full_name(), project.version);
            }
        }
        CliMode::Help | CliMode::Logout => unreachable!("handled above"),
    }

    // keep the settings store in step with whatever the gate ended up using
    if let Some(credentials) = auth.credentials().await {
        settings.username = credentials.login;
        settings.password = credentials.password;
    }
    if let Some(session) = auth.session().await {
        settings.token = session.token;
        settings.expire = session.expire;
        settings.user_id = session.user_id;
    }
    settings.api_root = api_root;
    settings.save(&settings_path)?;

    drop(coordinator);
    printer.await.ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("mergin-sync")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn parse_cli_mode_defaults_to_help() {
        assert_eq!(parse_cli_mode(args(&[])).unwrap(), CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_supports_pull_and_push() {
        assert_eq!(
            parse_cli_mode(args(&["pull", "lutra/survey"])).unwrap(),
            CliMode::Pull("lutra/survey".to_string())
        );
        assert_eq!(
            parse_cli_mode(args(&["push", "lutra/survey"])).unwrap(),
            CliMode::Push("lutra/survey".to_string())
        );
    }

    #[test]
    fn parse_cli_mode_rejects_bare_project_names() {
        assert!(parse_cli_mode(args(&["pull", "survey"])).is_err());
        assert!(parse_cli_mode(args(&["pull"])).is_err());
    }

    #[test]
    fn parse_cli_mode_supports_logout() {
        assert_eq!(parse_cli_mode(args(&["--logout"])).unwrap(), CliMode::Logout);
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_arguments() {
        assert!(parse_cli_mode(args(&["prune"])).is_err());
        assert!(parse_cli_mode(args(&["list", "extra"])).is_err());
    }
}
