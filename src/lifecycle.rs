//! Starts background behaviors for chats as they appear in the registry.

use std::time::Duration;

use teloxide::types::ChatId;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::handlers::{HandlerError, Handlers};
use crate::registry::{ChatRegistry, Snapshot};

/// Watches registry snapshots and activates every chat exactly once.
pub fn spawn(registry: &ChatRegistry, handlers: Handlers) -> JoinHandle<()> {
    let registry = registry.clone();
    let mut snapshots = registry.subscribe();
    tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let snapshot: Snapshot = snapshots.borrow_and_update().clone();
            activate_new_chats(&snapshot, &registry, &handlers);
        }
        log::info!("Chat registry closed, lifecycle manager shut down.");
    })
}

fn activate_new_chats(snapshot: &Snapshot, registry: &ChatRegistry, handlers: &Handlers) {
    for chat in snapshot.values() {
        if !chat.subscriptions().is_empty() {
            continue;
        }
        let Some(cancel) = chat.subscriptions().activate() else {
            continue;
        };
        log::info!("Activating chat {} ({:?})", chat.id, chat.name);
        tokio::spawn(picture_timer(
            chat.id,
            registry.subscribe(),
            cancel,
            handlers.clone(),
        ));
    }
}

async fn tick_or_pending(timer: Option<&mut tokio::time::Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn new_timer(period: Option<Duration>) -> Option<tokio::time::Interval> {
    let period = period.filter(|p| !p.is_zero())?;
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(timer)
}

/// Period of `chat_id` in the latest snapshot. The outer `None` means the
/// chat is gone.
fn current_period(
    snapshots: &mut watch::Receiver<Snapshot>,
    chat_id: ChatId,
) -> Option<Option<Duration>> {
    snapshots
        .borrow_and_update()
        .get(&chat_id)
        .map(|chat| chat.picture_period())
}

/// Sends a random picture to `chat_id` every period. A new period in the
/// registry replaces the running timer before it can fire again.
async fn picture_timer(
    chat_id: ChatId,
    mut snapshots: watch::Receiver<Snapshot>,
    cancel: CancellationToken,
    handlers: Handlers,
) {
    let Some(mut period) = current_period(&mut snapshots, chat_id) else {
        return;
    };
    let mut timer = new_timer(period);
    log::info!("Picture timer for {chat_id}: {period:?}");

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let Some(latest) = current_period(&mut snapshots, chat_id) else {
                    break;
                };
                // other chats republish too, only a different value restarts
                if latest != period {
                    period = latest;
                    timer = new_timer(period);
                    log::info!("Picture timer for {chat_id} changed: {period:?}");
                }
            }
            _ = tick_or_pending(timer.as_mut()) => {
                let handlers = handlers.clone();
                tokio::spawn(async move {
                    match handlers.send_random_picture(chat_id).await {
                        Ok(()) => {}
                        Err(HandlerError::NoContent(_)) => {
                            log::debug!("No picture for {chat_id}, skipping this tick");
                        }
                        Err(e) => log::error!("Couldn't send timed picture to {chat_id}: {e}"),
                    }
                });
            }
        }
    }
    log::info!("Picture timer for {chat_id} stopped.");
}
