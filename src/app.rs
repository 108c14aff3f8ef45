use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tokio::signal::unix::{SignalKind, signal};

use crate::{
    cli::Command,
    config::Config,
    credits::{
        CreditsClient,
        credentials::{CredentialProvider, EnvCredentialProvider},
        session::SessionStatus,
        telemetry::{ReconcileTrigger, TracingTelemetrySink},
        types::{Balance, BalanceSource, MutationReceipt},
    },
};

const WATCH_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, PartialEq, Eq)]
enum ExitReason {
    SessionEnded(SessionStatus),
    Signal(&'static str),
}

/// What gets printed for a balance snapshot.
#[derive(Debug, Serialize)]
struct BalanceView {
    displayed: Option<u64>,
    confirmed: Option<u64>,
    pending_optimistic: Option<i64>,
    source: Option<BalanceSource>,
    sequence: u64,
}

impl From<&Balance> for BalanceView {
    fn from(balance: &Balance) -> Self {
        Self {
            displayed: balance.displayed(),
            confirmed: balance.value,
            pending_optimistic: balance.pending_optimistic,
            source: balance.source,
            sequence: balance.sequence,
        }
    }
}

#[derive(Debug, Serialize)]
struct MutationView<'a> {
    receipt: &'a MutationReceipt,
    balance: BalanceView,
}

pub async fn run(config: Config, command: Command) -> Result<()> {
    let client = CreditsClient::from_config(&config.credits, Arc::new(TracingTelemetrySink))
        .context("failed to build credits client")?;

    let mut credential = EnvCredentialProvider
        .resolve(&config.credits.credential)
        .await
        .context("failed to resolve session credential")?;
    if let Some(user_id) = &config.credits.user_id {
        credential = credential.with_user_id(user_id.clone());
    }

    let balance = match client.begin_session(credential).await {
        Ok(balance) => balance,
        Err(err) if err.is_authentication() => {
            bail!("session token was rejected by {}", config.credits.base_url)
        }
        Err(err) => return Err(err).context("initial balance pull failed"),
    };

    match command {
        Command::Balance => print_json(&BalanceView::from(&balance)),
        Command::Deduct { amount } => {
            let receipt = client.deduct(amount).await?;
            print_json(&MutationView {
                receipt: &receipt,
                balance: BalanceView::from(&client.read()),
            })
        }
        Command::Add {
            amount,
            target_user,
        } => {
            let receipt = client.add(amount, target_user.as_deref()).await?;
            print_json(&MutationView {
                receipt: &receipt,
                balance: BalanceView::from(&client.read()),
            })
        }
        Command::Watch => {
            print_json(&BalanceView::from(&balance))?;
            watch(&client).await
        }
    }
}

/// Prints every balance change until the session ends or the process is
/// interrupted, pulling periodically so remote changes show up.
async fn watch(client: &CreditsClient) -> Result<()> {
    let mut sigint =
        signal(SignalKind::interrupt()).context("unable to listen for SIGINT (Ctrl+C)")?;
    let mut sigterm = signal(SignalKind::terminate()).context("unable to listen for SIGTERM")?;
    let shutdown = async move {
        tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        }
    };

    match watch_until(client, WATCH_RECONCILE_INTERVAL, shutdown).await? {
        ExitReason::SessionEnded(status) => {
            eprintln!("creditsync stopped: session ended ({status:?})")
        }
        ExitReason::Signal(signal_name) => eprintln!("creditsync stopped: received {signal_name}"),
    }

    Ok(())
}

/// Periodic pulls are spawned, never awaited here, so a slow balance
/// endpoint cannot delay shutdown or session handling.
async fn watch_until<S>(
    client: &CreditsClient,
    refresh_every: Duration,
    shutdown: S,
) -> Result<ExitReason>
where
    S: Future<Output = &'static str>,
{
    let mut balance_rx = client.subscribe();
    let mut session_rx = client.subscribe_session();
    balance_rx.mark_unchanged();
    session_rx.mark_unchanged();

    let mut refresh = tokio::time::interval(refresh_every);
    refresh.tick().await;
    tokio::pin!(shutdown);

    let exit_reason = loop {
        tokio::select! {
            signal_name = &mut shutdown => break ExitReason::Signal(signal_name),
            Ok(()) = balance_rx.changed() => {
                let view = BalanceView::from(&*balance_rx.borrow_and_update());
                print_json(&view)?;
            }
            Ok(()) = session_rx.changed() => {
                let status = *session_rx.borrow_and_update();
                if !matches!(status, SessionStatus::Active { .. }) {
                    break ExitReason::SessionEnded(status);
                }
            }
            _ = refresh.tick() => client.spawn_reconcile(ReconcileTrigger::Periodic),
        }
    };

    Ok(exit_reason)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string(value).context("failed to render output")?;
    println!("{rendered}");
    Ok(())
}
