use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, AuthStore, ChatApi, Credentials, FileTokenStore, GifClient, HubSession,
    SessionEvent, Settings,
};
use shared::{
    domain::{ConversationId, UserId},
    protocol::{ChatEvent, MessageMeta},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// Overrides the stored user id.
    #[arg(long)]
    user: Option<String>,
    /// Overrides the stored access token.
    #[arg(long)]
    token: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stores credentials for later runs.
    Login { user: String, token: String },
    Logout,
    /// Direct message to one user.
    Send { to: String, text: String },
    /// Prints hub events until Ctrl-C, optionally joining a conversation.
    Listen {
        #[arg(long)]
        conversation: Option<String>,
    },
    ConnectionId,
    Gif {
        query: String,
        #[arg(long, default_value_t = 5)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    let settings = load_settings();
    let auth = AuthStore::new(Arc::new(FileTokenStore::new(
        settings.token_store_path.clone(),
    )));

    match cli.command {
        Command::Login { user, token } => {
            auth.save(&Credentials {
                user_id: UserId::new(user),
                access_token: token,
            })
            .await?;
            println!("credentials saved to {}", settings.token_store_path.display());
        }
        Command::Logout => {
            auth.clear().await?;
            println!("credentials cleared");
        }
        Command::Send { ref to, ref text } => {
            let credentials = credentials(&auth, cli.user.clone(), cli.token.clone()).await?;
            let chat = connect(&settings, credentials).await?;
            let client_id = chat
                .send_message_with_meta(&UserId::from(to.as_str()), text, MessageMeta::default())
                .await?;
            println!("sent client_message_id={client_id}");
            chat.session().disconnect().await;
        }
        Command::Listen { ref conversation } => {
            let credentials = credentials(&auth, cli.user.clone(), cli.token.clone()).await?;
            let chat = connect(&settings, credentials).await?;
            if let Some(conversation) = conversation {
                chat.join_conversation(&ConversationId::from(conversation.as_str()))
                    .await?;
            }
            listen(&chat).await;
            chat.session().disconnect().await;
        }
        Command::ConnectionId => {
            let credentials = credentials(&auth, cli.user.clone(), cli.token.clone()).await?;
            let chat = connect(&settings, credentials).await?;
            println!("connection_id={}", chat.connection_id().await?);
            chat.session().disconnect().await;
        }
        Command::Gif { ref query, limit } => {
            for gif in GifClient::from_settings(&settings).search(query, limit).await? {
                println!("{} {} {}", gif.id, gif.url, gif.title);
            }
        }
    }

    Ok(())
}

async fn credentials(
    auth: &AuthStore,
    user: Option<String>,
    token: Option<String>,
) -> Result<Credentials> {
    if let (Some(user), Some(token)) = (user.clone(), token.clone()) {
        return Ok(Credentials {
            user_id: UserId::new(user),
            access_token: token,
        });
    }
    let Some(mut stored) = auth.load().await? else {
        bail!("no stored credentials; run `login` or pass --user and --token");
    };
    if let Some(user) = user {
        stored.user_id = UserId::new(user);
    }
    if let Some(token) = token {
        stored.access_token = token;
    }
    Ok(stored)
}

async fn connect(settings: &Settings, credentials: Credentials) -> Result<ChatApi> {
    let session = HubSession::from_settings(settings);
    let mut events = session.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::Connected { transport, url } => {
                    info!(%transport, %url, "connected")
                }
                SessionEvent::ReconnectScheduled { attempt, delay } => {
                    info!(attempt, ?delay, "reconnecting")
                }
                SessionEvent::Fatal(err) => warn!("hub session failed: {err}"),
                SessionEvent::StateChanged(_) => {}
            }
        }
    });
    session
        .connect(credentials.user_id, credentials.access_token)
        .await?;
    Ok(ChatApi::new(session))
}

async fn listen(chat: &ChatApi) {
    let subscription = chat.on_chat_event(|event| match event {
        ChatEvent::MessageReceived(message) => {
            println!("[{}] {}", message.sender_id, message.body)
        }
        ChatEvent::UserTyping(presence) => println!("{} is typing", presence.user_id),
        other => println!("{other:?}"),
    });
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to wait for ctrl-c: {err}");
    }
    subscription.unsubscribe();
}
