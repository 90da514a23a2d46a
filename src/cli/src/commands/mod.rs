//! CLI command definitions and dispatch.

mod create;
mod delete;
mod exists;
mod list;
mod read;
mod update;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use lxbake_core::config::ProviderConfig;
use lxbake_runtime::{BuiltImageResource, MemoryServer, Provider, StaticConnector};
use tokio_util::sync::CancellationToken;

use crate::state::StateFile;

/// lxbake - build LXD images and manage them as resources.
#[derive(Parser)]
#[command(name = "lxbake", version, about)]
pub struct Cli {
    /// Provider configuration file (YAML or JSON)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Resource state file [default: ~/.lxbake/state.json]
    #[arg(long, global = true)]
    pub state: Option<PathBuf>,

    /// Use an in-process simulated image store. The store and the records
    /// exist only for this invocation and the state file is neither read nor
    /// written, so only `create` is meaningful; later commands cannot see
    /// images created by an earlier `--simulate` run.
    #[arg(long, global = true)]
    pub simulate: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build a template and import it as a new image
    Create(create::CreateArgs),
    /// Refresh a built image from its store
    Read(read::ReadArgs),
    /// Change the aliases of a built image
    Update(update::UpdateArgs),
    /// Delete a built image from its store
    Delete(delete::DeleteArgs),
    /// Check whether a built image still exists
    Exists(exists::ExistsArgs),
    /// List built images
    List(list::ListArgs),
}

/// Everything a command needs besides its own arguments.
pub struct Context {
    pub resource: BuiltImageResource,
    pub cancel: CancellationToken,
    state_path: Option<PathBuf>,
    simulate: bool,
}

impl Context {
    pub fn new(cli: &Cli, config: ProviderConfig, cancel: CancellationToken) -> Self {
        let provider = if cli.simulate {
            simulated_provider(config)
        } else {
            Provider::lxd(config)
        };

        Self {
            resource: BuiltImageResource::new(provider),
            cancel,
            state_path: cli.state.clone(),
            simulate: cli.simulate,
        }
    }

    pub fn load_state(&self) -> Result<StateFile, std::io::Error> {
        if self.simulate {
            return Ok(StateFile::ephemeral());
        }
        match self.state_path {
            Some(ref path) => StateFile::load(path),
            None => StateFile::load_default(),
        }
    }
}

/// Every configured remote resolves to the same in-memory store.
fn simulated_provider(config: ProviderConfig) -> Provider {
    let server = Arc::new(MemoryServer::new("simulated"));
    let mut connector =
        StaticConnector::new().with_server(config.default_remote.clone(), server.clone());
    for name in config.remotes.keys() {
        connector = connector.with_server(name.clone(), server.clone());
    }
    Provider::new(config, Arc::new(connector))
}

/// Default config file location (~/.lxbake/config.yaml).
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".lxbake"))
        .unwrap_or_else(|| PathBuf::from(".lxbake"))
        .join("config.yaml")
}

/// Load the provider configuration.
///
/// An explicit path must exist; the default path is optional.
pub fn load_config(path: Option<&Path>) -> Result<ProviderConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => ProviderConfig::load(path)?,
        None => {
            let path = default_config_path();
            if path.exists() {
                ProviderConfig::load(&path)?
            } else {
                ProviderConfig::default()
            }
        }
    };
    Ok(config.with_env_overrides())
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli, config: ProviderConfig) -> Result<(), Box<dyn std::error::Error>> {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            trigger.cancel();
        }
    });

    let ctx = Context::new(&cli, config, cancel);
    match cli.command {
        Command::Create(args) => create::execute(&ctx, args).await,
        Command::Read(args) => read::execute(&ctx, args).await,
        Command::Update(args) => update::execute(&ctx, args).await,
        Command::Delete(args) => delete::execute(&ctx, args).await,
        Command::Exists(args) => exists::execute(&ctx, args).await,
        Command::List(args) => list::execute(&ctx, args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_create() {
        let cli = Cli::try_parse_from([
            "lxbake",
            "--simulate",
            "create",
            "web",
            "--template",
            "alpine.yaml",
            "--alias",
            "alpine",
            "--alias",
            "alpine/edge",
        ])
        .unwrap();
        assert!(cli.simulate);
        match cli.command {
            Command::Create(args) => {
                assert_eq!(args.name, "web");
                assert_eq!(args.aliases, vec!["alpine", "alpine/edge"]);
                assert!(args.remote.is_none());
            }
            _ => panic!("expected create"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["lxbake", "list", "--state", "/tmp/s.json"]).unwrap();
        assert_eq!(cli.state, Some(PathBuf::from("/tmp/s.json")));
    }

    #[test]
    fn test_load_config_explicit_missing_is_error() {
        let tmp = TempDir::new().unwrap();
        assert!(load_config(Some(&tmp.path().join("absent.yaml"))).is_err());
    }

    #[test]
    fn test_load_config_explicit() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "default_remote: build\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        if std::env::var(lxbake_core::config::REMOTE_ENV).is_err() {
            assert_eq!(config.default_remote, "build");
        }
    }

    #[test]
    fn test_simulate_ignores_state_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        let mut persisted = StateFile::load(&path).unwrap();
        persisted
            .upsert("web", lxbake_runtime::BuiltImageState::new("image: {}"))
            .unwrap();
        let written = std::fs::read_to_string(&path).unwrap();

        let cli = Cli::try_parse_from([
            "lxbake",
            "--simulate",
            "--state",
            path.to_str().unwrap(),
            "read",
            "web",
        ])
        .unwrap();
        let ctx = Context::new(&cli, ProviderConfig::default(), CancellationToken::new());

        let mut state = ctx.load_state().unwrap();
        assert!(state.get("web").is_none());
        state
            .upsert("db", lxbake_runtime::BuiltImageState::new("image: {}"))
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), written);
    }

    #[tokio::test]
    async fn test_simulated_provider_resolves_default_remote() {
        let provider = simulated_provider(ProviderConfig::default());
        let remote = provider.select_remote("");
        assert!(provider.server(&remote).is_ok());
    }
}
