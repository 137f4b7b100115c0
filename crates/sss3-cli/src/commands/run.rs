//! Run command - a full interactive session

use std::sync::Arc;

use anyhow::{Context, Result};
use sss3_broker::BrokerError;
use sss3_core::ReceivedFrame;
use sss3_session::{
    ClientConfig, SessionController, SessionEnd, SessionError, SessionResult, SessionSummary,
};

use crate::output::{OutputContext, TerminalObserver};
use crate::prompt::PromptSelector;

/// Sessions started in a row when the broker keeps sending unusable setups
const MAX_SESSION_ATTEMPTS: usize = 3;

/// Negotiate a session, print frames until it ends, then print the summary
pub fn run(config: ClientConfig, ctx: &OutputContext, show_frames: bool) -> Result<()> {
    let frame_ctx = *ctx;
    let controller = SessionController::builder(config, Arc::new(PromptSelector::new(*ctx)))
        .observer(Arc::new(TerminalObserver::new(*ctx)))
        .consumer(Arc::new(move |received: ReceivedFrame| {
            if show_frames {
                frame_ctx.print_frame(&received);
            }
        }))
        .build()
        .context("Failed to create session controller")?;

    let stop = controller.stop_handle();
    let handler = stop.clone();
    ctrlc::set_handler(move || handler.stop()).context("Failed to install Ctrl+C handler")?;

    ctx.info("Press Ctrl+C to stop");
    let summary = run_attempts(
        || controller.run(),
        || stop.is_stopped(),
        |reason| ctx.warn(&format!("Invalid setup from broker ({}), registering again", reason)),
    )
    .context("Session failed")?;

    let Some(summary) = summary else {
        ctx.info("\nSession stopped");
        return Ok(());
    };

    if summary.end == SessionEnd::Stopped {
        ctx.info("\nSession stopped");
    }
    ctx.print_summary(&summary);
    Ok(())
}

/// Run sessions until one completes
///
/// An unusable setup from the broker starts over from registration, at most
/// [`MAX_SESSION_ATTEMPTS`] times in total. Returns `Ok(None)` when a stop
/// was requested before the next attempt.
fn run_attempts(
    mut run: impl FnMut() -> SessionResult<SessionSummary>,
    is_stopped: impl Fn() -> bool,
    mut on_retry: impl FnMut(&str),
) -> SessionResult<Option<SessionSummary>> {
    let mut attempt = 1;
    loop {
        match run() {
            Ok(summary) => return Ok(Some(summary)),
            Err(SessionError::Broker(BrokerError::MalformedPush(reason)))
                if attempt < MAX_SESSION_ATTEMPTS && !is_stopped() =>
            {
                on_retry(&reason);
                attempt += 1;
            }
            Err(SessionError::Broker(BrokerError::MalformedPush(_))) if is_stopped() => {
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use pretty_assertions::assert_eq;
    use sss3_transport::StatsSnapshot;

    fn malformed() -> SessionResult<SessionSummary> {
        Err(BrokerError::MalformedPush("missing CAN_PORT".into()).into())
    }

    fn completed() -> SessionResult<SessionSummary> {
        Ok(SessionSummary {
            end: SessionEnd::BrokerTeardown,
            parameters: None,
            stats: StatsSnapshot::default(),
        })
    }

    #[test]
    fn test_malformed_setup_retried_until_success() {
        let runs = Cell::new(0);
        let mut retries = Vec::new();

        let summary = run_attempts(
            || {
                runs.set(runs.get() + 1);
                if runs.get() < 3 {
                    malformed()
                } else {
                    completed()
                }
            },
            || false,
            |reason| retries.push(reason.to_string()),
        )
        .unwrap();

        assert_eq!(summary.map(|s| s.end), Some(SessionEnd::BrokerTeardown));
        assert_eq!(runs.get(), 3);
        assert_eq!(retries, vec!["missing CAN_PORT", "missing CAN_PORT"]);
    }

    #[test]
    fn test_malformed_setup_attempts_are_bounded() {
        let runs = Cell::new(0);

        let result = run_attempts(
            || {
                runs.set(runs.get() + 1);
                malformed()
            },
            || false,
            |_| {},
        );

        assert!(matches!(
            result,
            Err(SessionError::Broker(BrokerError::MalformedPush(_)))
        ));
        assert_eq!(runs.get(), MAX_SESSION_ATTEMPTS);
    }

    #[test]
    fn test_stop_between_attempts_is_honored() {
        let runs = Cell::new(0);
        let stopped = Cell::new(false);

        let result = run_attempts(
            || {
                runs.set(runs.get() + 1);
                // Ctrl+C lands while the failing attempt tears down
                stopped.set(true);
                malformed()
            },
            || stopped.get(),
            |_| panic!("no retry after a stop"),
        )
        .unwrap();

        assert!(result.is_none());
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn test_other_errors_are_not_retried() {
        let runs = Cell::new(0);

        let result = run_attempts(
            || {
                runs.set(runs.get() + 1);
                Err(BrokerError::RemoteDisconnected.into())
            },
            || false,
            |_| {},
        );

        assert!(result.is_err());
        assert_eq!(runs.get(), 1);
    }
}
