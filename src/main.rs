mod batch;
mod cli;
mod common;
mod constants;
mod derive;
mod entities;
mod error;
mod export;
mod matcher;
mod metric;
mod proknow;
mod run_log;
#[cfg(test)]
mod testing;
mod updater;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use cli::{Command, ConnectionArgs};
use error::ConfigError;
use proknow::{Credentials, ProKnowClient, Session};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = cli::Args::parse();
    let session = connect(&args.conn).await?;
    let log_dir = &args.conn.log_dir;

    match args.cmd {
        Command::ApplyCsv(cmd) => {
            batch::run(&session, &cmd.csv_path, log_dir)
                .await
                .context("apply-csv failed")?;
        }
        Command::DeriveMetrics(cmd) => {
            derive::run(&session, &cmd.collection, log_dir)
                .await
                .context("derive-metrics failed")?;
        }
        Command::ListEntities(cmd) => {
            let collection = cmd.collection.collection;
            let csv_out = cmd
                .csv_out
                .unwrap_or_else(|| PathBuf::from(entities::default_output_name(&collection)));
            entities::run(&session, &collection, &csv_out)
                .await
                .context("list-entities failed")?;
        }
        Command::ExportJson(cmd) => {
            let selector = match (cmd.context.as_deref(), cmd.description.as_deref()) {
                (Some(context), Some(description)) => Some(export::EntitySelector {
                    context,
                    description,
                }),
                _ => None,
            };
            export::run(&session, &cmd.mrn, &cmd.out_dir, selector)
                .await
                .context("export-json failed")?;
        }
    }
    Ok(())
}

async fn connect(conn: &ConnectionArgs) -> Result<Session<ProKnowClient>> {
    let credentials = Credentials::load(conn.credentials.as_deref())?;
    let client = ProKnowClient::new(&conn.base_url, credentials, conn.max_retries)?;

    let key = conn
        .workspace
        .as_deref()
        .context("No workspace given (pass --workspace or set PROKNOW_WORKSPACE)")?;
    let workspace = match client.resolve_workspace(key).await {
        Ok(workspace) => workspace,
        Err(err) if err.is_not_found() => {
            return Err(ConfigError::WorkspaceNotFound(key.to_string()).into());
        }
        Err(err) => return Err(err).context("Failed resolving workspace"),
    };
    tracing::info!(
        workspace = %workspace.name,
        id = %workspace.id,
        base_url = %conn.base_url,
        "connected to ProKnow"
    );

    Ok(Session::new(client, workspace.id))
}
