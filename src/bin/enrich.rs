use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use reqwest::Client;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use wikienrich::source::{connect_sse, EventStream};
use wikienrich::{
    read_events, resolve_titles, Cli, EnrichmentClient, EnrichmentStore, Pipeline, TitleResolver,
    WikidataApi,
};

#[tokio::main]
async fn main() -> Result<()> {
    wikienrich::telemetry::init_tracing();
    let cli = Cli::parse();
    let controls = cli.build_controls();

    let store = EnrichmentStore::open(&cli.cache)
        .with_context(|| format!("failed to load enrichment cache {:?}", cli.cache))?;
    tracing::info!(path = ?cli.cache, entities = store.len(), "opened enrichment cache");
    let store = Arc::new(store);

    let api = WikidataApi::new(
        cli.api_endpoint.clone(),
        cli.language.clone(),
        cli.request_timeout(),
        cli.api_token.as_deref(),
    )
    .context("failed to build Wikidata client")?;
    let client = EnrichmentClient::new(api, controls.limiter(), controls.retry_policy());

    let mut events = open_source(&cli).await?;
    if cli.resolve_titles {
        // Page lookups go to the wikis, not Wikidata, so they get a limiter of their own.
        let resolver = TitleResolver::new(
            cli.request_timeout(),
            cli.resolver_endpoint.clone(),
            controls.limiter(),
            controls.retry_policy(),
        )
        .context("failed to build title resolver")?;
        tracing::info!("resolving page titles without an entity id");
        events = resolve_titles(events, Arc::new(resolver));
    }
    let pipeline = Pipeline::new(controls, Arc::clone(&store), client);
    let shutdown = CancellationToken::new();
    spawn_shutdown_triggers(&cli, shutdown.clone());

    let report = pipeline
        .run(events, shutdown)
        .await
        .context("failed to persist enrichment cache")?;
    println!("{report}");
    Ok(())
}

async fn open_source(cli: &Cli) -> Result<EventStream> {
    if let Some(url) = &cli.stream_url {
        let client = Client::builder()
            .user_agent(concat!("wikienrich/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build stream client")?;
        return connect_sse(&client, url)
            .await
            .with_context(|| format!("failed to connect to {url}"));
    }
    if cli.input == "-" {
        return Ok(read_events(BufReader::new(tokio::io::stdin())));
    }
    let file = tokio::fs::File::open(&cli.input)
        .await
        .with_context(|| format!("failed to open input {:?}", cli.input))?;
    Ok(read_events(BufReader::new(file)))
}

fn spawn_shutdown_triggers(cli: &Cli, shutdown: CancellationToken) {
    if let Some(limit) = cli.run_duration() {
        let token = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            tracing::info!(secs = limit.as_secs(), "run duration elapsed; shutting down");
            token.cancel();
        });
    }
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; finishing in-flight batches");
            shutdown.cancel();
        }
    });
}
