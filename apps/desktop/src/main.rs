use anyhow::Result;
use clap::Parser;
use client_core::{load_settings, ClientEvent, ConversationClient, SyncClient};
use shared::{
    domain::{ConversationId, GroupId, UserId},
    protocol::MessageBody,
};
use tokio_stream::StreamExt;

#[derive(Parser, Debug)]
struct Args {
    /// Base URL of the remote API; defaults to client.toml / environment.
    #[arg(long)]
    api_url: Option<String>,
    /// Base URL of the live channel endpoint.
    #[arg(long)]
    channel_url: Option<String>,
    /// Session token issued by the identity provider.
    #[arg(long)]
    session_token: Option<String>,
    /// Identity-provider id of the current user.
    #[arg(long)]
    external_id: String,
    /// Open a direct conversation with this internal user id.
    #[arg(long)]
    peer: Option<i64>,
    /// Open this group conversation instead.
    #[arg(long)]
    group: Option<i64>,
    /// Send one text message after opening.
    #[arg(long)]
    message: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(api_url) = args.api_url {
        settings.api_url = api_url;
    }
    if let Some(channel_url) = args.channel_url {
        settings.channel_url = channel_url;
    }
    if let Some(session_token) = args.session_token {
        settings.session_token = session_token;
    }

    let client = SyncClient::login(settings, &args.external_id).await?;
    println!("Logged in as internal user {}", client.self_id().0);

    for entry in ConversationClient::directory(&client).await {
        let last = entry
            .last_activity
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:>3} unread  {:<24} last activity {last}",
            entry.unread, entry.display_name
        );
    }

    let conversation = match (args.peer, args.group) {
        (Some(peer), _) => Some(ConversationId::Direct(UserId(peer))),
        (None, Some(group)) => Some(ConversationId::Group(GroupId(group))),
        (None, None) => None,
    };

    if let Some(conversation) = conversation {
        client.open_conversation(conversation).await?;
        for message in client.messages().await {
            println!("[{}] {:?}", message.sent_at.to_rfc3339(), message.body);
        }
        if let Some(text) = args.message {
            let id = client.send_message(MessageBody::Text(text)).await?;
            println!("Sent message {}", id.0);
        }

        let mut events = client.event_stream();
        println!("Tailing live events; press Ctrl-C to exit.");
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = events.next() => match event {
                    Some(Ok(ClientEvent::MessageAdded { message, .. })) => {
                        println!("new message {}: {:?}", message.message_id.0, message.body);
                    }
                    Some(Ok(ClientEvent::UnreadChanged { conversation, count })) => {
                        println!("unread changed for {conversation:?}: {count}");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) => {}
                    None => break,
                }
            }
        }
        client.close_conversation().await;
    }

    client.shutdown().await;
    Ok(())
}
