use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use futures::future::join_all;
use presence_client::{
    http_to_ws_url, load_settings, load_settings_from, HttpPresenceFetcher, Presence,
    PresenceEvent, WsPresenceChannel,
};
use shared::{domain::UserId, protocol::PresenceRecord};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Watch the presence of a set of users until interrupted.
#[derive(Parser, Debug)]
struct Args {
    /// Overrides `server_url` from the settings file and environment.
    #[arg(long)]
    server_url: Option<String>,
    /// Settings file; `presence.toml` in the working directory when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Resolve each user once, print it and exit.
    #[arg(long)]
    once: bool,
    #[arg(required = true)]
    users: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => load_settings_from(path),
        None => load_settings(),
    };
    if let Some(server_url) = args.server_url.clone() {
        settings.server_url = Some(server_url);
    }
    let server_url = settings
        .server_url
        .clone()
        .ok_or_else(|| anyhow!("no server url: pass --server-url or set PRESENCE_SERVER_URL"))?;

    let fetcher = HttpPresenceFetcher::new(&server_url)
        .with_context(|| format!("invalid server url {server_url}"))?;
    let channel = WsPresenceChannel::new(http_to_ws_url(&server_url)?);
    let presence = Presence::new_with_dependencies(settings, Arc::new(fetcher), channel.clone());
    info!(
        server_url = %server_url,
        stream = channel.ws_url(),
        users = args.users.len(),
        "presence_watch starting"
    );

    let cancel = CancellationToken::new();
    let stream_task = tokio::spawn(channel.clone().run(
        Arc::clone(&presence),
        presence.settings().reconnect_delay(),
        cancel.clone(),
    ));

    let result = if args.once {
        resolve_once(&presence, &args.users, &cancel).await
    } else {
        watch(&presence, &args.users, &cancel).await
    };

    cancel.cancel();
    if let Err(err) = stream_task.await {
        warn!(error = %err, "live stream task ended abnormally");
    }
    result
}

async fn resolve_once(
    presence: &Arc<Presence>,
    users: &[String],
    cancel: &CancellationToken,
) -> Result<()> {
    let lookups = users.iter().map(|user| {
        let presence = Arc::clone(presence);
        let cancel = cancel.clone();
        let id = UserId::from(user.as_str());
        async move {
            let record = presence.get_with_cancel(id.clone(), cancel).await;
            (id, record)
        }
    });
    let lookups = join_all(lookups);

    let results = tokio::select! {
        results = lookups => results,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            return Ok(());
        }
    };

    for (id, result) in results {
        match result? {
            Some(record) => println!("{}", render(&record)),
            None => println!("{id}\tunknown"),
        }
    }
    Ok(())
}

async fn watch(
    presence: &Arc<Presence>,
    users: &[String],
    cancel: &CancellationToken,
) -> Result<()> {
    for user in users {
        let id = UserId::from(user.as_str());
        let label = id.clone();
        let listener = presence
            .listen(id, move |record: Option<PresenceRecord>| match record {
                Some(record) => println!("{}", render(&record)),
                None => println!("{label}\t(reset)"),
            })
            .await;
        if listener.is_none() {
            warn!(user = %user, "ignoring blank user id");
        }
    }

    let mut events = BroadcastStream::new(presence.subscribe_events());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = cancel.cancelled() => break,
            event = events.next() => match event {
                Some(Ok(PresenceEvent::Reset)) => info!("presence cache reset"),
                Some(Ok(PresenceEvent::Restart)) => info!("presence restarted"),
                Some(Ok(event)) => debug!(?event, "presence event"),
                Some(Err(err)) => warn!(error = %err, "presence event stream lagged"),
                None => break,
            },
        }
    }

    info!("presence_watch stopping");
    Ok(())
}

fn render(record: &PresenceRecord) -> String {
    let status = record.status.unwrap_or_default();
    let mut line = format!("{}\t{}", record.id, status.as_str());
    if let Some(name) = record.name.as_ref().or(record.username.as_ref()) {
        line.push_str(&format!("\t{name}"));
    }
    if let Some(text) = record.status_text.as_deref().filter(|text| !text.is_empty()) {
        line.push_str(&format!("\t{text}"));
    }
    line
}
