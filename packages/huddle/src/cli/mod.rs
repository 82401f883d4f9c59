pub mod render;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use huddle::{
    ChannelId, ChatClient, ChatError, ClientConfig, Connector, CredentialSource, MemoryBroker,
    RestApi, StaticCredentials, WsConnector,
};

use crate::ChatArgs;

/// `huddle config`: resolved configuration as TOML on stdout.
pub fn config_command(dir: &Path) -> Result<()> {
    let config = ClientConfig::load(dir)
        .with_context(|| format!("loading configuration from {}", dir.display()))?;
    let rendered = toml::to_string_pretty(&config).context("rendering configuration")?;
    println!("# {}", dir.join(huddle::config::CONFIG_FILE).display());
    print!("{rendered}");
    Ok(())
}

/// A line typed at the prompt.
#[derive(Debug, PartialEq)]
enum Input {
    Say(String),
    Public,
    Group(String),
    Reconnect,
    Reload,
    Clear,
    Status,
    Quit,
    Unknown(String),
}

fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Some(Input::Say(line.to_string()));
    };
    let (name, arg) = command
        .split_once(char::is_whitespace)
        .map(|(n, a)| (n, a.trim()))
        .unwrap_or((command, ""));
    Some(match (name, arg) {
        ("public", _) => Input::Public,
        ("group", id) if !id.is_empty() => Input::Group(id.to_string()),
        ("reconnect", _) => Input::Reconnect,
        ("history", _) => Input::Reload,
        ("clear", _) => Input::Clear,
        ("status", _) => Input::Status,
        ("quit" | "exit", _) => Input::Quit,
        _ => Input::Unknown(line.to_string()),
    })
}

/// `huddle chat`: interactive session on stdin/stdout.
pub async fn chat_command(mut config: ClientConfig, args: ChatArgs) -> Result<()> {
    let (connector, credentials): (Arc<dyn Connector>, Arc<dyn CredentialSource>) = if args.offline {
        // The in-process broker has no REST side.
        config.history.rest = false;
        let token = args.token.clone().unwrap_or_else(|| "offline".to_string());
        (
            Arc::new(MemoryBroker::new(config.routes.clone())),
            Arc::new(StaticCredentials::new(Some(token), args.user.clone())),
        )
    } else {
        (
            Arc::new(WsConnector::new(
                config.server.ws_url.clone(),
                config.server.connect_timeout(),
            )),
            Arc::new(StaticCredentials::new(args.token.clone(), args.user.clone())),
        )
    };

    let mut builder = ChatClient::builder(config.clone(), connector, credentials.clone());
    if config.history.rest {
        let api = Arc::new(
            RestApi::new(
                config.server.api_url.clone(),
                credentials,
                config.server.request_timeout(),
            )
            .context("building HTTP client")?,
        );
        builder = builder.history_source(api.clone()).group_directory(api);
    }
    let client = builder.build();

    let renderer = tokio::spawn(render::messages(client.messages()));
    let status = tokio::spawn(render::status(client.status()));

    match client.connect(&args.user).await {
        Ok(()) => {}
        Err(ChatError::CredentialMissing) => {
            anyhow::bail!("no token: pass --token or set HUDDLE_TOKEN");
        }
        Err(e) => warn!(error = %e, "initial connect failed; retrying in the background"),
    }

    let channel = ChannelId::new(args.channel.as_str());
    if !channel.is_public() {
        client.switch_channel(channel).await;
    }

    eprintln!("type a message, or /public /group <id> /history /clear /reconnect /status /quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        let Some(input) = parse_input(&line) else {
            continue;
        };
        match input {
            Input::Say(text) => {
                if let Err(e) = client.send_chat(&text).await {
                    eprintln!("[not sent: {e}]");
                }
            }
            Input::Public => {
                client.switch_channel(ChannelId::Public).await;
            }
            Input::Group(id) => {
                client.switch_channel(ChannelId::new(id)).await;
            }
            Input::Reconnect => {
                if let Err(e) = client.connect(&args.user).await {
                    eprintln!("[reconnect failed: {e}]");
                }
            }
            Input::Reload => {
                client.reload_history().await;
            }
            Input::Clear => client.clear_messages().await,
            Input::Status => {
                let status = client.status().borrow().clone();
                eprintln!("{}", render::describe(&status));
                eprintln!(
                    "[subscribed: {}]",
                    client
                        .active_subscriptions()
                        .await
                        .iter()
                        .map(ChannelId::as_str)
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
            Input::Quit => break,
            Input::Unknown(raw) => eprintln!("[unknown command: {raw}]"),
        }
    }

    info!("leaving");
    client.disconnect().await;
    renderer.abort();
    status.abort();
    Ok(())
}
