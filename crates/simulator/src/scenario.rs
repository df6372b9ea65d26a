//! Receipt printing scenario run by each simulated session

use crate::config::PrinterSettings;
use crate::printer::{Mechanism, print_line};
use anyhow::{Context, Result};
use common::Timeout;
use engine::{ChannelKind, Command, Session, SessionState, StatusUpdateEvent, status};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

const SETTLE_POLL: Duration = Duration::from_millis(10);

/// Claim the printer, print the configured receipts and let go of it
///
/// Blocks the calling thread; sessions contend for the claim, so with several
/// of them the receipts come out one session after the other.
pub fn run_session(
    session: Arc<Session>,
    mechanism: Arc<Mechanism>,
    settings: PrinterSettings,
) -> Result<()> {
    let name = session.logical_name().to_string();

    session.set_power_notify(true)?;
    session
        .claim(Timeout::INFINITE)
        .with_context(|| format!("{} could not claim the printer", name))?;
    session.set_device_enabled(true)?;
    session.raise_status_event(StatusUpdateEvent::new(session.id(), status::POWER_ONLINE));
    info!("{}: printing {} receipts", name, settings.receipts);

    for receipt in 1..=settings.receipts {
        for line in 1..=settings.lines_per_receipt {
            let text = format!("{} receipt {} line {}", name, receipt, line);
            Command::new(&session, print_line(mechanism.clone(), text, &settings))
                .enqueue()
                .with_context(|| format!("{} could not queue a line", name))?;
        }
        debug!("{}: receipt {} queued", name, receipt);
    }

    session.set_flag_when_idle(true)?;
    wait_until_settled(&session);
    info!("{}: done, {:?}", name, session.snapshot());

    session.release()?;
    session.close()?;
    Ok(())
}

/// Wait until every command ran and every buffered event went out
fn wait_until_settled(session: &Session) {
    loop {
        let settled = session.state() == SessionState::Idle
            && session.count_commands() == 0
            && ChannelKind::ALL
                .iter()
                .all(|kind| session.queued_events(*kind) == 0);
        if settled {
            return;
        }
        thread::sleep(SETTLE_POLL);
    }
}
